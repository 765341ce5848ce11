use super::protocol::{MessageFrame, Request, Response, MAX_FRAME_LEN};
use crate::error::{DaemonError, Result};
use std::path::{Path, PathBuf};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;
use tracing::trace;

/// Client for the daemon's local RPC endpoint.
pub struct DaemonClient {
    socket_path: PathBuf,
}

impl DaemonClient {
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: socket_path.into(),
        }
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    pub fn socket_exists(&self) -> bool {
        self.socket_path.exists()
    }

    /// Send one request and collect every response up to the end of stream.
    pub async fn call(&self, request: &Request) -> Result<Vec<Response>> {
        let mut stream = UnixStream::connect(&self.socket_path).await?;
        trace!(method = request.method(), "Sending request");

        let bytes = MessageFrame::encode_request(request)?;
        stream.write_all(&bytes).await?;
        stream.flush().await?;

        let mut responses = Vec::new();
        loop {
            let mut len_buf = [0u8; 4];
            stream.read_exact(&mut len_buf).await?;
            let len = MessageFrame::read_length(&len_buf);
            if len > MAX_FRAME_LEN {
                return Err(DaemonError::Protocol(format!(
                    "response frame of {len} bytes exceeds limit"
                )));
            }

            let mut buf = vec![0u8; len];
            stream.read_exact(&mut buf).await?;
            match MessageFrame::decode_response(&buf)? {
                Response::StreamEnd => break,
                response => responses.push(response),
            }
        }

        trace!(count = responses.len(), "Response stream complete");
        Ok(responses)
    }

    pub async fn version(&self) -> Result<String> {
        match self.call(&Request::Version).await?.into_iter().next() {
            Some(Response::Version { version }) => Ok(version),
            Some(Response::Error { message }) => Err(DaemonError::Protocol(message)),
            other => Err(unexpected(other)),
        }
    }

    /// Backend diagnostics, one entry per line.
    pub async fn status(&self) -> Result<Vec<String>> {
        let mut lines = Vec::new();
        for response in self.call(&Request::Status).await? {
            match response {
                Response::Line { text } => lines.push(text),
                Response::Error { message } => return Err(DaemonError::Protocol(message)),
                other => return Err(unexpected(Some(other))),
            }
        }
        Ok(lines)
    }

    pub async fn stop(&self, force: bool) -> Result<()> {
        match self.call(&Request::Stop { force }).await?.into_iter().next() {
            Some(Response::Ok) => Ok(()),
            Some(Response::Error { message }) => Err(DaemonError::Protocol(message)),
            other => Err(unexpected(other)),
        }
    }
}

fn unexpected(response: Option<Response>) -> DaemonError {
    DaemonError::Protocol(format!("unexpected response: {response:?}"))
}
