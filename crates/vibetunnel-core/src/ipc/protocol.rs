//! Framed message protocol
//!
//! Wire format: `[1 byte type][4 bytes big-endian length][payload]`.
//! The parser is incremental: feed it arbitrary byte splittings and it
//! yields the same frames.

use bytes::{Buf, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use crate::error::{CoreError, Result};

/// Upper bound on a single frame payload; anything larger is a protocol
/// violation and drops the peer.
pub const MAX_FRAME_LEN: usize = 4 * 1024 * 1024;

const HEADER_LEN: usize = 5;

/// Known message type codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    StdinData = 0x01,
    ControlCmd = 0x02,
    StatusUpdate = 0x03,
    Heartbeat = 0x04,
    Error = 0x05,
    StatusRequest = 0x20,
    StatusResponse = 0x21,
    GitFollowRequest = 0x30,
    GitFollowResponse = 0x31,
    GitEventNotify = 0x32,
    GitEventAck = 0x33,
}

impl MessageType {
    pub fn from_code(code: u8) -> Option<Self> {
        Some(match code {
            0x01 => MessageType::StdinData,
            0x02 => MessageType::ControlCmd,
            0x03 => MessageType::StatusUpdate,
            0x04 => MessageType::Heartbeat,
            0x05 => MessageType::Error,
            0x20 => MessageType::StatusRequest,
            0x21 => MessageType::StatusResponse,
            0x30 => MessageType::GitFollowRequest,
            0x31 => MessageType::GitFollowResponse,
            0x32 => MessageType::GitEventNotify,
            0x33 => MessageType::GitEventAck,
            _ => return None,
        })
    }
}

/// One decoded frame. The type byte is preserved even for codes we do not
/// know, so unknown messages can be skipped without closing the peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub code: u8,
    pub payload: Bytes,
}

impl Frame {
    pub fn message_type(&self) -> Option<MessageType> {
        MessageType::from_code(self.code)
    }
}

/// Encode one frame.
pub fn encode_frame(msg_type: MessageType, payload: &[u8]) -> Bytes {
    let mut out = BytesMut::with_capacity(HEADER_LEN + payload.len());
    out.extend_from_slice(&[msg_type as u8]);
    out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    out.extend_from_slice(payload);
    out.freeze()
}

/// Incremental frame parser. Bytes beyond a complete frame are retained
/// for the next call.
#[derive(Debug, Default)]
pub struct FrameParser {
    buf: BytesMut,
}

impl FrameParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Pop the next complete frame, if the buffer holds one.
    pub fn next_frame(&mut self) -> Result<Option<Frame>> {
        if self.buf.len() < HEADER_LEN {
            return Ok(None);
        }

        let len = u32::from_be_bytes([self.buf[1], self.buf[2], self.buf[3], self.buf[4]]) as usize;
        if len > MAX_FRAME_LEN {
            return Err(CoreError::MalformedFrame(format!(
                "frame length {len} exceeds {MAX_FRAME_LEN}"
            )));
        }
        if self.buf.len() < HEADER_LEN + len {
            return Ok(None);
        }

        let code = self.buf[0];
        self.buf.advance(HEADER_LEN);
        let payload = self.buf.split_to(len).freeze();
        Ok(Some(Frame { code, payload }))
    }
}

/// Signal argument of a `kill` control command: a name or a number.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SignalSpec {
    Number(i32),
    Name(String),
}

impl SignalSpec {
    /// Resolve to a signal, accepting `TERM`, `SIGTERM`, `sigterm` or `15`.
    pub fn to_signal(&self) -> Option<nix::sys::signal::Signal> {
        use std::str::FromStr;
        match self {
            SignalSpec::Number(n) => nix::sys::signal::Signal::try_from(*n).ok(),
            SignalSpec::Name(name) => {
                let upper = name.to_ascii_uppercase();
                let full = if upper.starts_with("SIG") {
                    upper
                } else {
                    format!("SIG{upper}")
                };
                nix::sys::signal::Signal::from_str(&full).ok()
            }
        }
    }
}

/// Control commands carried by `CONTROL_CMD` frames.
///
/// Unknown fields are ignored; unknown commands fail deserialization and
/// the frame is skipped.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "cmd", rename_all = "kebab-case")]
pub enum ControlCommand {
    Resize {
        cols: u16,
        rows: u16,
    },
    Kill {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        signal: Option<SignalSpec>,
    },
    ResetSize,
    UpdateTitle {
        title: String,
    },
}

/// Payload of an `ERROR` frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collect(parser: &mut FrameParser) -> Vec<Frame> {
        let mut frames = Vec::new();
        while let Some(frame) = parser.next_frame().unwrap() {
            frames.push(frame);
        }
        frames
    }

    #[test]
    fn encode_then_parse_round_trips() {
        let frame = encode_frame(MessageType::StdinData, b"hello");
        let mut parser = FrameParser::new();
        parser.push(&frame);
        let frames = collect(&mut parser);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].message_type(), Some(MessageType::StdinData));
        assert_eq!(&frames[0].payload[..], b"hello");
    }

    #[test]
    fn parser_is_invariant_under_byte_splitting() {
        let mut stream = Vec::new();
        stream.extend_from_slice(&encode_frame(MessageType::StdinData, b"abc"));
        stream.extend_from_slice(&encode_frame(MessageType::Heartbeat, b""));
        stream.extend_from_slice(&encode_frame(
            MessageType::ControlCmd,
            br#"{"cmd":"resize","cols":80,"rows":24}"#,
        ));

        let expected: Vec<(u8, Vec<u8>)> = {
            let mut parser = FrameParser::new();
            parser.push(&stream);
            collect(&mut parser)
                .into_iter()
                .map(|f| (f.code, f.payload.to_vec()))
                .collect()
        };
        assert_eq!(expected.len(), 3);

        // Every chunk size, including one byte at a time.
        for chunk in 1..stream.len() {
            let mut parser = FrameParser::new();
            let mut got = Vec::new();
            for piece in stream.chunks(chunk) {
                parser.push(piece);
                got.extend(
                    collect(&mut parser)
                        .into_iter()
                        .map(|f| (f.code, f.payload.to_vec())),
                );
            }
            assert_eq!(got, expected, "chunk size {chunk}");
        }
    }

    #[test]
    fn unknown_type_codes_still_frame() {
        let mut raw = vec![0x7fu8];
        raw.extend_from_slice(&3u32.to_be_bytes());
        raw.extend_from_slice(b"xyz");

        let mut parser = FrameParser::new();
        parser.push(&raw);
        let frames = collect(&mut parser);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].code, 0x7f);
        assert_eq!(frames[0].message_type(), None);
    }

    #[test]
    fn oversized_length_is_rejected() {
        let mut raw = vec![0x01u8];
        raw.extend_from_slice(&(MAX_FRAME_LEN as u32 + 1).to_be_bytes());
        let mut parser = FrameParser::new();
        parser.push(&raw);
        assert!(parser.next_frame().is_err());
    }

    #[test]
    fn control_commands_deserialize() {
        let resize: ControlCommand =
            serde_json::from_str(r#"{"cmd":"resize","cols":120,"rows":40}"#).unwrap();
        assert_eq!(resize, ControlCommand::Resize { cols: 120, rows: 40 });

        let kill: ControlCommand = serde_json::from_str(r#"{"cmd":"kill"}"#).unwrap();
        assert_eq!(kill, ControlCommand::Kill { signal: None });

        let kill_named: ControlCommand =
            serde_json::from_str(r#"{"cmd":"kill","signal":"SIGKILL"}"#).unwrap();
        let ControlCommand::Kill { signal: Some(spec) } = kill_named else {
            panic!("expected kill with signal");
        };
        assert_eq!(spec.to_signal(), Some(nix::sys::signal::Signal::SIGKILL));

        let reset: ControlCommand = serde_json::from_str(r#"{"cmd":"reset-size"}"#).unwrap();
        assert_eq!(reset, ControlCommand::ResetSize);

        let title: ControlCommand =
            serde_json::from_str(r#"{"cmd":"update-title","title":"dev"}"#).unwrap();
        assert_eq!(
            title,
            ControlCommand::UpdateTitle {
                title: "dev".into()
            }
        );
    }

    #[test]
    fn unknown_fields_are_permitted() {
        let cmd: ControlCommand = serde_json::from_str(
            r#"{"cmd":"resize","cols":80,"rows":24,"futureField":true}"#,
        )
        .unwrap();
        assert_eq!(cmd, ControlCommand::Resize { cols: 80, rows: 24 });
    }

    #[test]
    fn unknown_commands_fail_deserialization() {
        assert!(serde_json::from_str::<ControlCommand>(r#"{"cmd":"explode"}"#).is_err());
    }

    #[test]
    fn signal_specs_parse_names_and_numbers() {
        use nix::sys::signal::Signal;
        assert_eq!(SignalSpec::Number(15).to_signal(), Some(Signal::SIGTERM));
        assert_eq!(
            SignalSpec::Name("term".into()).to_signal(),
            Some(Signal::SIGTERM)
        );
        assert_eq!(
            SignalSpec::Name("SIGINT".into()).to_signal(),
            Some(Signal::SIGINT)
        );
        assert_eq!(SignalSpec::Name("NOPE".into()).to_signal(), None);
    }
}
