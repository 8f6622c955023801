//! VibeTunnel session core
//!
//! Creates PTY-backed sessions, records their output into replayable
//! asciicast transcripts, mediates I/O between the PTY and every connected
//! consumer, and exposes a framed IPC socket per session for control.
//!
//! The [`manager::SessionManager`] is the lifecycle owner; everything else
//! composes beneath it: [`store`] for the on-disk layout, [`pty`] for the
//! child process, [`transcript`] for recording, [`ipc`] for the control
//! channel and [`tracker`]/[`activity`] for the derived signals.

pub mod activity;
pub mod config;
pub mod error;
pub mod events;
pub mod ipc;
pub mod keys;
pub mod manager;
pub mod pty;
pub mod session;
pub mod spawn;
pub mod store;
pub mod title;
pub mod tracker;
pub mod transcript;
pub mod types;

pub use error::{CoreError, Result};
pub use events::{EventBus, SessionEvent};
pub use manager::{CreateOptions, CreateResult, InputPayload, SessionManager};
pub use store::SessionStore;
pub use types::{ResizeSource, SessionEntry, SessionMeta, SessionStatus, TitleMode, WinSize};
