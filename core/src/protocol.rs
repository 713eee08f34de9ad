//! Wire protocol spoken on every channel between host and guest.
//!
//! Frame format:
//! - Header: the payload length as ASCII decimal digits, terminated by `\n`
//! - Payload: exactly that many bytes of JSON (a `Request` or a `Response`)
//!
//! Reads on a virtio-serial port or a UNIX socket may return any slice of
//! the stream, so `FrameDecoder` accumulates bytes and hands out complete
//! payloads only.

use crate::error::ProtocolError;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Maximum payload size (16 MiB) to prevent unbounded allocations.
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Largest command output carried in a response. Output travels hex
/// encoded, so this leaves room for the rest of the frame.
pub const MAX_OUTPUT_SIZE: usize = MAX_FRAME_SIZE / 2 - 64 * 1024;

/// Longest header we accept before giving up on finding the newline.
const MAX_HEADER_LEN: usize = 20;

pub const CMD_LIST_COMMANDS: &str = "list-commands";
pub const CMD_EXECUTE: &str = "execute";

/// Exit status reported when the requested command does not exist.
pub const EXIT_COMMAND_NOT_FOUND: i32 = 127;
/// Exit status reported when the command exists but could not be spawned.
pub const EXIT_CANNOT_EXECUTE: i32 = 126;
/// Exit status reported for a malformed request (e.g. `execute` without a name).
pub const EXIT_USAGE: i32 = 2;
/// Exit status reported when the peer could not produce or send a result.
pub const EXIT_FAILURE: i32 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Request {
    pub id: String,
    pub command: String,
    #[serde(default)]
    pub arguments: Vec<String>,
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
    /// Bytes fed to the command's standard input.
    #[serde(with = "hex_bytes", default, skip_serializing_if = "Vec::is_empty")]
    pub input: Vec<u8>,
}

impl Request {
    /// Build a request with a fresh correlation id.
    pub fn new(command: impl Into<String>, arguments: Vec<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            command: command.into(),
            arguments,
            environment: BTreeMap::new(),
            input: Vec::new(),
        }
    }

    pub fn with_input(mut self, input: Vec<u8>) -> Self {
        self.input = input;
        self
    }

    pub fn with_environment(mut self, environment: BTreeMap<String, String>) -> Self {
        self.environment = environment;
        self
    }

    pub fn list_commands() -> Self {
        Self::new(CMD_LIST_COMMANDS, vec![])
    }

    pub fn execute(name: impl Into<String>, mut arguments: Vec<String>) -> Self {
        arguments.insert(0, name.into());
        Self::new(CMD_EXECUTE, arguments)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
    pub id: String,
    #[serde(with = "hex_bytes", default)]
    pub output: Vec<u8>,
    pub exit_status: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Response {
    pub fn success(id: &str, output: Vec<u8>, exit_status: i32) -> Self {
        Self {
            id: id.to_string(),
            output,
            exit_status,
            error: None,
        }
    }

    pub fn failure(id: &str, exit_status: i32, error: impl Into<String>) -> Self {
        Self {
            id: id.to_string(),
            output: Vec::new(),
            exit_status,
            error: Some(error.into()),
        }
    }

    pub fn is_success(&self) -> bool {
        self.exit_status == 0 && self.error.is_none()
    }

    /// Output of `list-commands`, one name per line.
    pub fn command_names(&self) -> Vec<String> {
        String::from_utf8_lossy(&self.output)
            .lines()
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect()
    }
}

mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        hex::decode(s).map_err(serde::de::Error::custom)
    }
}

/// Serialize a message into a complete frame.
pub fn encode_frame<T: Serialize>(message: &T) -> Result<Vec<u8>, ProtocolError> {
    let payload = serde_json::to_vec(message)?;
    if payload.len() > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(payload.len()));
    }
    let mut frame = format!("{}\n", payload.len()).into_bytes();
    frame.extend_from_slice(&payload);
    Ok(frame)
}

pub fn decode_payload<T: DeserializeOwned>(payload: &[u8]) -> Result<T, ProtocolError> {
    Ok(serde_json::from_slice(payload)?)
}

/// Reassembles frames from arbitrarily split reads.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: Vec<u8>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Number of buffered bytes not yet returned as a frame.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Take the next complete payload out of the buffer, if there is one.
    pub fn next_frame(&mut self) -> Result<Option<Vec<u8>>, ProtocolError> {
        let Some(newline) = self.buf.iter().position(|&b| b == b'\n') else {
            if self.buf.len() > MAX_HEADER_LEN {
                return Err(self.invalid_header(self.buf.len()));
            }
            return Ok(None);
        };

        let header = &self.buf[..newline];
        let header = header.strip_suffix(b"\r").unwrap_or(header);
        if header.is_empty() || header.len() > MAX_HEADER_LEN || !header.iter().all(u8::is_ascii_digit)
        {
            return Err(self.invalid_header(newline));
        }

        let len: usize = std::str::from_utf8(header)
            .ok()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| self.invalid_header(newline))?;
        if len > MAX_FRAME_SIZE {
            return Err(ProtocolError::FrameTooLarge(len));
        }

        let start = newline + 1;
        if self.buf.len() < start + len {
            return Ok(None);
        }

        let payload = self.buf[start..start + len].to_vec();
        self.buf.drain(..start + len);
        Ok(Some(payload))
    }

    fn invalid_header(&self, len: usize) -> ProtocolError {
        let shown = &self.buf[..len.min(self.buf.len()).min(64)];
        ProtocolError::InvalidHeader(String::from_utf8_lossy(shown).into_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_response() -> Response {
        Response::success("abc", vec![0, 159, 146, 150, b'\n'], 3)
    }

    #[test]
    fn test_frame_header_is_decimal_length() {
        let frame = encode_frame(&Request::list_commands()).unwrap();
        let newline = frame.iter().position(|&b| b == b'\n').unwrap();
        let len: usize = std::str::from_utf8(&frame[..newline]).unwrap().parse().unwrap();
        assert_eq!(len, frame.len() - newline - 1);
    }

    #[test]
    fn test_decode_byte_by_byte() {
        let response = sample_response();
        let frame = encode_frame(&response).unwrap();

        let mut decoder = FrameDecoder::new();
        let mut decoded = None;
        for (i, byte) in frame.iter().enumerate() {
            decoder.push(&[*byte]);
            let next = decoder.next_frame().unwrap();
            if i + 1 < frame.len() {
                assert!(next.is_none());
            } else {
                decoded = next;
            }
        }

        let decoded: Response = decode_payload(&decoded.unwrap()).unwrap();
        assert_eq!(decoded, response);
        assert_eq!(decoder.buffered(), 0);
    }

    #[test]
    fn test_decode_several_frames_in_one_read() {
        let first = Request::execute("uptime", vec!["-p".to_string()]);
        let second = Request::list_commands();
        let mut data = encode_frame(&first).unwrap();
        data.extend(encode_frame(&second).unwrap());

        let mut decoder = FrameDecoder::new();
        decoder.push(&data);

        let a: Request = decode_payload(&decoder.next_frame().unwrap().unwrap()).unwrap();
        let b: Request = decode_payload(&decoder.next_frame().unwrap().unwrap()).unwrap();
        assert_eq!(a, first);
        assert_eq!(b, second);
        assert!(decoder.next_frame().unwrap().is_none());
    }

    #[test]
    fn test_invalid_header() {
        let mut decoder = FrameDecoder::new();
        decoder.push(b"hello\n{}");
        assert!(matches!(
            decoder.next_frame(),
            Err(ProtocolError::InvalidHeader(_))
        ));
    }

    #[test]
    fn test_header_without_newline_too_long() {
        let mut decoder = FrameDecoder::new();
        decoder.push(&[b'1'; 32]);
        assert!(matches!(
            decoder.next_frame(),
            Err(ProtocolError::InvalidHeader(_))
        ));
    }

    #[test]
    fn test_frame_too_large() {
        let mut decoder = FrameDecoder::new();
        decoder.push(format!("{}\n", MAX_FRAME_SIZE + 1).as_bytes());
        assert!(matches!(
            decoder.next_frame(),
            Err(ProtocolError::FrameTooLarge(_))
        ));
    }

    #[test]
    fn test_output_is_hex_on_the_wire() {
        let json = serde_json::to_string(&Response::success("x", b"hi".to_vec(), 0)).unwrap();
        assert!(json.contains("\"output\":\"6869\""));
        assert!(!json.contains("error"));
    }

    #[test]
    fn test_request_defaults() {
        let request: Request = serde_json::from_str(r#"{"id":"1","command":"list-commands"}"#).unwrap();
        assert!(request.arguments.is_empty());
        assert!(request.environment.is_empty());
        assert!(request.input.is_empty());
    }

    #[test]
    fn test_input_is_hex_and_omitted_when_empty() {
        let json = serde_json::to_string(&Request::list_commands()).unwrap();
        assert!(!json.contains("input"));

        let request = Request::execute("cat", vec![]).with_input(b"hi".to_vec());
        let json = serde_json::to_string(&request).unwrap();
        assert!(json.contains("\"input\":\"6869\""));
    }

    #[test]
    fn test_execute_puts_name_first() {
        let request = Request::execute("reboot", vec!["now".to_string()]);
        assert_eq!(request.command, CMD_EXECUTE);
        assert_eq!(request.arguments, vec!["reboot", "now"]);
        assert_ne!(request.id, Request::execute("reboot", vec![]).id);
    }

    #[test]
    fn test_command_names() {
        let response = Response::success("1", b"a\nb\n".to_vec(), 0);
        assert_eq!(response.command_names(), vec!["a", "b"]);
    }
}
