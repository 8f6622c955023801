//! Per-session IPC: framed messages over a Unix-domain stream socket

mod client;
mod endpoint;
mod protocol;

pub use client::IpcClient;
pub use endpoint::{IpcEndpoint, IpcRequest};
pub use protocol::{
    encode_frame, ControlCommand, ErrorPayload, Frame, FrameParser, MessageType, SignalSpec,
    MAX_FRAME_LEN,
};
