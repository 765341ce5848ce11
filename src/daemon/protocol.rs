//! IPC Protocol types using rkyv for zero-copy serialization
//!
//! One call per connection: the client writes a single [`Request`] frame,
//! the daemon answers with any number of [`Response`] frames and closes the
//! stream with [`Response::StreamEnd`].

use rkyv::util::AlignedVec;
use rkyv::{Archive, Deserialize, Serialize};

/// Frames above this size are refused.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// IPC request from client to daemon
#[derive(Archive, Deserialize, Serialize, Debug, Clone, PartialEq, Eq)]
#[rkyv(derive(Debug))]
pub enum Request {
    /// Daemon version
    Version,
    /// Directory backend diagnostics, streamed line by line
    Status,
    /// Stop the daemon
    Stop {
        /// Abort in-flight calls instead of waiting for them
        force: bool,
    },
}

impl Request {
    /// Method name reported to the call hooks.
    pub fn method(&self) -> &'static str {
        match self {
            Request::Version => "Version",
            Request::Status => "Status",
            Request::Stop { .. } => "Stop",
        }
    }
}

/// IPC response from daemon to client
#[derive(Archive, Deserialize, Serialize, Debug, Clone, PartialEq, Eq)]
#[rkyv(derive(Debug))]
pub enum Response {
    Version { version: String },
    /// One line of a streamed answer
    Line { text: String },
    /// Generic success
    Ok,
    /// Error occurred
    Error { message: String },
    /// End of stream
    StreamEnd,
}

/// Message frame for wire protocol
///
/// Format: [4-byte length (little-endian)][rkyv bytes]
pub struct MessageFrame;

impl MessageFrame {
    /// Encode a request to bytes with length prefix
    pub fn encode_request(request: &Request) -> Result<Vec<u8>, rkyv::rancor::Error> {
        let bytes = rkyv::to_bytes::<rkyv::rancor::Error>(request)?;
        Ok(Self::with_length(&bytes))
    }

    /// Encode a response to bytes with length prefix
    pub fn encode_response(response: &Response) -> Result<Vec<u8>, rkyv::rancor::Error> {
        let bytes = rkyv::to_bytes::<rkyv::rancor::Error>(response)?;
        Ok(Self::with_length(&bytes))
    }

    /// Decode a request body (without the length prefix)
    pub fn decode_request(body: &[u8]) -> Result<Request, rkyv::rancor::Error> {
        let aligned = Self::aligned(body);
        rkyv::from_bytes::<Request, rkyv::rancor::Error>(&aligned)
    }

    /// Decode a response body (without the length prefix)
    pub fn decode_response(body: &[u8]) -> Result<Response, rkyv::rancor::Error> {
        let aligned = Self::aligned(body);
        rkyv::from_bytes::<Response, rkyv::rancor::Error>(&aligned)
    }

    /// Read length prefix from buffer
    pub fn read_length(buf: &[u8; 4]) -> usize {
        u32::from_le_bytes(*buf) as usize
    }

    fn with_length(bytes: &[u8]) -> Vec<u8> {
        let len = bytes.len() as u32;
        let mut result = Vec::with_capacity(4 + bytes.len());
        result.extend_from_slice(&len.to_le_bytes());
        result.extend_from_slice(bytes);
        result
    }

    // archived data must be read from an aligned buffer
    fn aligned(body: &[u8]) -> AlignedVec {
        let mut aligned = AlignedVec::<16>::with_capacity(body.len());
        aligned.extend_from_slice(body);
        aligned
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_frame() {
        let request = Request::Stop { force: true };
        let frame = MessageFrame::encode_request(&request).unwrap();

        let mut len = [0u8; 4];
        len.copy_from_slice(&frame[..4]);
        assert_eq!(MessageFrame::read_length(&len), frame.len() - 4);

        let decoded = MessageFrame::decode_request(&frame[4..]).unwrap();
        assert_eq!(decoded, request);
        assert_eq!(decoded.method(), "Stop");
    }

    #[test]
    fn test_response_archive() {
        let response = Response::Version {
            version: "1.0.0".to_string(),
        };
        let bytes = rkyv::to_bytes::<rkyv::rancor::Error>(&response).unwrap();
        let archived = rkyv::access::<ArchivedResponse, rkyv::rancor::Error>(&bytes).unwrap();

        if let ArchivedResponse::Version { version } = archived {
            assert_eq!(version.as_str(), "1.0.0");
        } else {
            panic!("Expected Version response");
        }
    }

    #[test]
    fn test_garbage_is_rejected() {
        assert!(MessageFrame::decode_request(&[0xff, 0x13, 0x07]).is_err());
    }
}
