use crate::codec::{self, FrameHeader};
use crate::ipc::{validate_token, IpcError, Message, Result};
use crate::transport::Tunnel;
use std::io;
use std::time::Duration;

/// `send` takes `&mut self`, so calls on one client are never pipelined. Use
/// one client per thread for concurrency.
pub struct IpcClient {
    token: String,
    next_request_id: i64,
    // Taken and closed as soon as the stream can no longer be trusted.
    tunnel: Option<Tunnel>,
}

impl IpcClient {
    pub fn connect(token: &str) -> Result<Self> {
        validate_token(token)?;
        let tunnel = Tunnel::dial(token)?;
        tracing::debug!(token, "ipc client connected");
        Ok(Self {
            token: token.to_string(),
            next_request_id: 0,
            tunnel: Some(tunnel),
        })
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn next_request_id(&self) -> i64 {
        self.next_request_id
    }

    pub fn is_connected(&self) -> bool {
        self.tunnel.is_some()
    }

    pub fn set_io_timeout(&self, timeout: Option<Duration>) -> Result<()> {
        let tunnel = self.tunnel.as_ref().ok_or_else(not_connected)?;
        Ok(tunnel.set_io_timeout(timeout)?)
    }

    /// Any failure once the request has started going out closes the
    /// connection: part of a frame may be left unread, so every later call
    /// fails until the caller reconnects.
    pub fn send(&mut self, message_type: i32, content: &[u8]) -> Result<Message> {
        let request_id = self.next_request_id;
        self.next_request_id += 1;

        let tunnel = self.tunnel.as_mut().ok_or_else(not_connected)?;
        let request = Message::new(request_id, message_type, content);
        FrameHeader::for_message(&request)?;

        match round_trip(tunnel, &request) {
            Ok(response) => Ok(response),
            Err(err) => {
                tracing::warn!(
                    token = %self.token,
                    request_id,
                    error = %err,
                    "ipc round trip failed, closing connection"
                );
                if let Some(tunnel) = self.tunnel.take() {
                    tunnel.close();
                }
                Err(err)
            }
        }
    }

    pub fn close(self) {
        if let Some(tunnel) = self.tunnel {
            tunnel.close();
        }
    }
}

fn round_trip(tunnel: &mut Tunnel, request: &Message) -> Result<Message> {
    codec::write_frame(tunnel, request)?;

    let header = codec::read_header(tunnel)?;
    if header.request_id != request.request_id {
        return Err(IpcError::Protocol(format!(
            "response carries request id {}, expected {}",
            header.request_id, request.request_id
        )));
    }
    let content = codec::read_body(tunnel, &header)?;
    Ok(Message {
        request_id: header.request_id,
        message_type: header.message_type,
        content,
    })
}

fn not_connected() -> IpcError {
    IpcError::Transport(io::Error::new(
        io::ErrorKind::NotConnected,
        "ipc client connection was closed after an earlier failure",
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connect_rejects_invalid_token_without_dialing() {
        let err = IpcClient::connect(&"t".repeat(crate::ipc::MAX_TOKEN_SIZE + 1))
            .err()
            .unwrap();
        assert!(matches!(err, IpcError::InvalidToken(_)));
    }

    #[cfg(unix)]
    #[test]
    fn peer_hangup_mid_response_closes_the_client() {
        let (near, far) = std::os::unix::net::UnixStream::pair().unwrap();
        let peer = std::thread::spawn(move || {
            let mut far = far;
            let request = codec::read_frame(&mut far).unwrap();
            let header = FrameHeader {
                message_type: request.message_type,
                request_id: request.request_id,
                body_size: 64,
            };
            crate::transport::write_all(&mut far, &header.to_bytes()).unwrap();
            crate::transport::write_all(&mut far, b"only part").unwrap();
        });
        let mut client = IpcClient {
            token: "client-hangup".to_string(),
            next_request_id: 0,
            tunnel: Some(Tunnel::from(near)),
        };

        let err = client.send(4, b"req").unwrap_err();
        assert!(err.is_disconnect());
        assert!(!client.is_connected());
        peer.join().unwrap();

        let err = client.send(4, b"again").unwrap_err();
        assert!(matches!(err, IpcError::Transport(ref e) if e.kind() == io::ErrorKind::NotConnected));
        assert_eq!(client.next_request_id(), 2);
    }

    #[test]
    fn connect_fails_when_nobody_listens() {
        let token = format!("client-nobody-{}", std::process::id());
        let err = IpcClient::connect(&token).err().unwrap();
        assert!(matches!(err, IpcError::Transport(_)));
    }
}
