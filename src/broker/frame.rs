use bytes::{BufMut, Bytes, BytesMut};
use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};
use thiserror::Error;

pub const DEFAULT_MAX_FRAME_BYTES: usize = 2 * 1024 * 1024;

const LF: u8 = 0x0A;
const NUL: u8 = 0x00;

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("frame exceeds maximum size ({size} > {max} bytes)")]
    Oversize { size: usize, max: usize },

    #[error("empty frame")]
    Empty,

    #[error("unknown frame command '{0}'")]
    BadCommand(String),

    #[error("malformed header line '{0}'")]
    BadHeader(String),

    #[error("frame is not NUL-terminated")]
    MissingTerminator,

    #[error("content-length {declared} does not match body length {actual}")]
    ContentLengthMismatch { declared: usize, actual: usize },

    #[error("frame is not valid UTF-8 outside the body")]
    BadEncoding,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameCommand {
    Connect,
    Connected,
    Subscribe,
    Unsubscribe,
    Send,
    Message,
    Disconnect,
    Error,
    Heartbeat,
}

impl FrameCommand {
    pub fn as_str(&self) -> &'static str {
        match self {
            FrameCommand::Connect => "CONNECT",
            FrameCommand::Connected => "CONNECTED",
            FrameCommand::Subscribe => "SUBSCRIBE",
            FrameCommand::Unsubscribe => "UNSUBSCRIBE",
            FrameCommand::Send => "SEND",
            FrameCommand::Message => "MESSAGE",
            FrameCommand::Disconnect => "DISCONNECT",
            FrameCommand::Error => "ERROR",
            FrameCommand::Heartbeat => "HEARTBEAT",
        }
    }

    fn parse(s: &str) -> Result<Self, FrameError> {
        match s {
            "CONNECT" => Ok(FrameCommand::Connect),
            "CONNECTED" => Ok(FrameCommand::Connected),
            "SUBSCRIBE" => Ok(FrameCommand::Subscribe),
            "UNSUBSCRIBE" => Ok(FrameCommand::Unsubscribe),
            "SEND" => Ok(FrameCommand::Send),
            "MESSAGE" => Ok(FrameCommand::Message),
            "DISCONNECT" => Ok(FrameCommand::Disconnect),
            "ERROR" => Ok(FrameCommand::Error),
            "HEARTBEAT" => Ok(FrameCommand::Heartbeat),
            other => Err(FrameError::BadCommand(other.to_string())),
        }
    }
}

/// One client↔gateway message. Header keys are case-insensitive and stored
/// lowercased; on duplicates the first occurrence wins.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub command: FrameCommand,
    headers: HashMap<String, String>,
    pub body: Bytes,
}

impl Frame {
    pub fn new(command: FrameCommand) -> Self {
        Self {
            command,
            headers: HashMap::new(),
            body: Bytes::new(),
        }
    }

    pub fn with_header(mut self, key: &str, value: impl Into<String>) -> Self {
        self.headers
            .entry(key.to_ascii_lowercase())
            .or_insert_with(|| value.into());
        self
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers.get(&key.to_ascii_lowercase()).map(|s| s.as_str())
    }

    pub fn headers(&self) -> &HashMap<String, String> {
        &self.headers
    }

    pub fn heartbeat() -> Self {
        Frame::new(FrameCommand::Heartbeat)
    }

    pub fn connected(session_id: &str) -> Self {
        Frame::new(FrameCommand::Connected).with_header("session", session_id)
    }

    pub fn error(code: &str, message: &str) -> Self {
        Frame::new(FrameCommand::Error)
            .with_header("code", code)
            .with_header("message", message)
    }

    pub fn message(destination: &str, body: impl Into<Bytes>) -> Self {
        Frame::new(FrameCommand::Message)
            .with_header("destination", destination)
            .with_body(body)
    }

    pub fn destination(&self) -> Option<&str> {
        self.header("destination")
    }

    /// Serialize to the wire shape: command LF, headers LF, blank line,
    /// body, NUL.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(64 + self.body.len());
        buf.put_slice(self.command.as_str().as_bytes());
        buf.put_u8(LF);
        // Deterministic header order keeps encode stable for tests and logs.
        let mut keys: Vec<&String> = self.headers.keys().collect();
        keys.sort();
        for key in keys {
            buf.put_slice(key.as_bytes());
            buf.put_u8(b':');
            buf.put_slice(self.headers[key].as_bytes());
            buf.put_u8(LF);
        }
        buf.put_u8(LF);
        buf.put_slice(&self.body);
        buf.put_u8(NUL);
        buf.freeze()
    }

    /// Parse one frame. `max` bounds the total frame size (text or binary).
    pub fn decode(raw: &[u8], max: usize) -> Result<Self, FrameError> {
        if raw.len() > max {
            return Err(FrameError::Oversize {
                size: raw.len(),
                max,
            });
        }
        if raw.is_empty() {
            return Err(FrameError::Empty);
        }
        if raw[raw.len() - 1] != NUL {
            return Err(FrameError::MissingTerminator);
        }
        let raw = &raw[..raw.len() - 1];

        let command_end = raw
            .iter()
            .position(|&b| b == LF)
            .ok_or(FrameError::MissingTerminator)?;
        let command_line =
            std::str::from_utf8(&raw[..command_end]).map_err(|_| FrameError::BadEncoding)?;
        let command = FrameCommand::parse(command_line.trim_end_matches('\r'))?;

        let mut headers = HashMap::new();
        let mut cursor = command_end + 1;
        loop {
            let line_end = raw[cursor..]
                .iter()
                .position(|&b| b == LF)
                .ok_or(FrameError::MissingTerminator)?
                + cursor;
            let line =
                std::str::from_utf8(&raw[cursor..line_end]).map_err(|_| FrameError::BadEncoding)?;
            let line = line.trim_end_matches('\r');
            cursor = line_end + 1;
            if line.is_empty() {
                break;
            }
            let (key, value) = line
                .split_once(':')
                .ok_or_else(|| FrameError::BadHeader(line.to_string()))?;
            headers
                .entry(key.trim().to_ascii_lowercase())
                .or_insert_with(|| value.trim().to_string());
        }

        let body = Bytes::copy_from_slice(&raw[cursor..]);

        if let Some(declared) = headers.get("content-length") {
            let declared: usize = declared
                .parse()
                .map_err(|_| FrameError::BadHeader(format!("content-length:{}", declared)))?;
            if declared != body.len() {
                return Err(FrameError::ContentLengthMismatch {
                    declared,
                    actual: body.len(),
                });
            }
        }

        Ok(Frame {
            command,
            headers,
            body,
        })
    }
}

/// Counts invalid frames per channel; after `max` strikes inside `window`
/// the channel is closed (§ protocol abuse).
pub struct ViolationWindow {
    max: usize,
    window: Duration,
    strikes: VecDeque<Instant>,
}

impl Default for ViolationWindow {
    fn default() -> Self {
        Self::new(5, Duration::from_secs(30))
    }
}

impl ViolationWindow {
    pub fn new(max: usize, window: Duration) -> Self {
        Self {
            max,
            window,
            strikes: VecDeque::new(),
        }
    }

    /// Record one violation; returns true when the channel should close.
    pub fn record(&mut self, now: Instant) -> bool {
        while let Some(&front) = self.strikes.front() {
            if now.duration_since(front) > self.window {
                self.strikes.pop_front();
            } else {
                break;
            }
        }
        self.strikes.push_back(now);
        self.strikes.len() >= self.max
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_every_command() {
        let commands = [
            FrameCommand::Connect,
            FrameCommand::Connected,
            FrameCommand::Subscribe,
            FrameCommand::Unsubscribe,
            FrameCommand::Send,
            FrameCommand::Message,
            FrameCommand::Disconnect,
            FrameCommand::Error,
            FrameCommand::Heartbeat,
        ];
        for command in commands {
            let frame = Frame::new(command)
                .with_header("destination", "/app/deployment/start")
                .with_header("request-id", "42")
                .with_body(&br#"{"taskName":"deploy"}"#[..]);
            let decoded =
                Frame::decode(&frame.encode(), DEFAULT_MAX_FRAME_BYTES).expect("decode");
            assert_eq!(decoded, frame);
        }
    }

    #[test]
    fn wire_shape_is_exact() {
        let frame = Frame::new(FrameCommand::Send)
            .with_header("destination", "/app/x")
            .with_body(&b"hi"[..]);
        assert_eq!(&frame.encode()[..], b"SEND\ndestination:/app/x\n\nhi\x00");
    }

    #[test]
    fn heartbeat_is_an_empty_frame() {
        let encoded = Frame::heartbeat().encode();
        assert_eq!(&encoded[..], b"HEARTBEAT\n\n\x00");
        let decoded = Frame::decode(&encoded, DEFAULT_MAX_FRAME_BYTES).unwrap();
        assert_eq!(decoded.command, FrameCommand::Heartbeat);
        assert!(decoded.body.is_empty());
    }

    #[test]
    fn header_keys_are_case_insensitive_and_first_wins() {
        let raw = b"SEND\nDestination:/app/a\ndestination:/app/b\n\n\x00";
        let frame = Frame::decode(raw, DEFAULT_MAX_FRAME_BYTES).unwrap();
        assert_eq!(frame.destination(), Some("/app/a"));
    }

    #[test]
    fn content_length_must_match_body() {
        let raw = b"SEND\ncontent-length:5\n\nabc\x00";
        assert!(matches!(
            Frame::decode(raw, DEFAULT_MAX_FRAME_BYTES),
            Err(FrameError::ContentLengthMismatch {
                declared: 5,
                actual: 3
            })
        ));

        let raw = b"SEND\ncontent-length:3\n\nabc\x00";
        assert!(Frame::decode(raw, DEFAULT_MAX_FRAME_BYTES).is_ok());
    }

    #[test]
    fn oversize_frames_are_rejected() {
        let frame = Frame::new(FrameCommand::Send).with_body(vec![b'x'; 64]);
        let encoded = frame.encode();
        assert!(matches!(
            Frame::decode(&encoded, 32),
            Err(FrameError::Oversize { .. })
        ));
    }

    #[test]
    fn missing_terminator_is_rejected() {
        assert!(matches!(
            Frame::decode(b"SEND\n\nbody", DEFAULT_MAX_FRAME_BYTES),
            Err(FrameError::MissingTerminator)
        ));
    }

    #[test]
    fn unknown_command_is_rejected() {
        assert!(matches!(
            Frame::decode(b"NOPE\n\n\x00", DEFAULT_MAX_FRAME_BYTES),
            Err(FrameError::BadCommand(_))
        ));
    }

    #[test]
    fn binary_bodies_survive_round_trip() {
        let body: Vec<u8> = (1u8..=255).collect();
        let frame = Frame::message("/queue/terminal/output-user1", body.clone());
        let decoded = Frame::decode(&frame.encode(), DEFAULT_MAX_FRAME_BYTES).unwrap();
        assert_eq!(&decoded.body[..], &body[..]);
    }

    #[test]
    fn violation_window_closes_after_five_strikes() {
        let mut window = ViolationWindow::default();
        let t0 = Instant::now();
        for i in 0..4 {
            assert!(!window.record(t0 + Duration::from_secs(i)), "strike {}", i);
        }
        assert!(window.record(t0 + Duration::from_secs(4)));
    }

    #[test]
    fn violation_window_expires_old_strikes() {
        let mut window = ViolationWindow::default();
        let t0 = Instant::now();
        for i in 0..4 {
            window.record(t0 + Duration::from_secs(i));
        }
        // 40 s later the early strikes are outside the 30 s window.
        assert!(!window.record(t0 + Duration::from_secs(40)));
    }
}
