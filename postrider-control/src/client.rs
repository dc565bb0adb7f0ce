//! Control client implementation

use std::{path::Path, time::Duration};

use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::UnixStream,
};
use tracing::{debug, trace};

use crate::{
    ControlError, PROTOCOL_VERSION, Request, Response, ResponsePayload, Result,
};

/// Maximum allowed response size (10MB)
const MAX_RESPONSE_SIZE: u32 = 10_000_000;

/// Control client for communicating with a running postrider instance
pub struct ControlClient {
    socket_path: String,
    timeout: Duration,
}

impl ControlClient {
    /// Create a new control client with the given socket path
    #[must_use]
    pub fn new(socket_path: impl Into<String>) -> Self {
        Self {
            socket_path: socket_path.into(),
            timeout: Duration::from_secs(10),
        }
    }

    /// Set the request timeout
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Send a request and wait for the response
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The socket does not exist or cannot be connected to
    /// - The request times out
    /// - Serialization or deserialization fails
    /// - The server reports an incompatible protocol version
    /// - The server responds with an error payload
    pub async fn send_request(&self, request: Request) -> Result<Response> {
        tokio::time::timeout(self.timeout, self.send_and_receive(request))
            .await
            .map_err(|_| ControlError::Timeout)?
    }

    /// Check whether the control socket exists
    ///
    /// # Errors
    ///
    /// Returns [`ControlError::InvalidSocketPath`] if the socket file is
    /// missing, which usually means no instance is running.
    pub fn check_socket_exists(&self) -> Result<()> {
        if Path::new(&self.socket_path).exists() {
            Ok(())
        } else {
            Err(ControlError::InvalidSocketPath(self.socket_path.clone()))
        }
    }

    async fn send_and_receive(&self, request: Request) -> Result<Response> {
        debug!("Connecting to control socket: {}", self.socket_path);
        let mut stream = UnixStream::connect(&self.socket_path).await?;

        trace!("Sending request: {request:?}");

        // Serialize request
        let request_bytes = bincode::serde::encode_to_vec(&request, bincode::config::legacy())?;
        let request_len = u32::try_from(request_bytes.len())
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;

        // Write length prefix + request
        stream.write_all(&request_len.to_be_bytes()).await?;
        stream.write_all(&request_bytes).await?;
        stream.flush().await?;

        // Read response length prefix (4 bytes)
        let mut len_buf = [0u8; 4];
        stream.read_exact(&mut len_buf).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::UnexpectedEof {
                ControlError::ConnectionClosed
            } else {
                ControlError::Io(e)
            }
        })?;

        let response_len = u32::from_be_bytes(len_buf);
        if response_len > MAX_RESPONSE_SIZE {
            return Err(ControlError::ProtocolDeserialization(
                bincode::error::DecodeError::OtherString(format!(
                    "Response too large: {response_len} bytes"
                )),
            ));
        }

        // Read response bytes
        let mut response_bytes = vec![0u8; response_len as usize];
        stream.read_exact(&mut response_bytes).await?;

        // Deserialize response
        let (response, _): (Response, _) = bincode::serde::decode_from_slice(
            response_bytes.as_slice(),
            bincode::config::legacy(),
        )?;

        trace!("Received response: {response:?}");

        if !response.is_version_compatible() {
            return Err(ControlError::VersionMismatch {
                peer: response.version,
                ours: PROTOCOL_VERSION,
            });
        }

        if let ResponsePayload::Error(message) = &response.payload {
            return Err(ControlError::ServerError(message.clone()));
        }

        Ok(response)
    }
}
