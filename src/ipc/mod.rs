use crate::pool::PoolError;
use std::io;
use std::path::PathBuf;
use thiserror::Error;

pub const MAX_TOKEN_SIZE: usize = 1024;
pub const ADDRESS_PREFIX: &str = "ani-";

#[cfg(not(windows))]
const SOCKET_DIR: &str = "/tmp";
#[cfg(windows)]
const PIPE_NAMESPACE: &str = r"\\.\pipe";

pub type Result<T> = std::result::Result<T, IpcError>;

#[derive(Error, Debug)]
pub enum IpcError {
    #[error("invalid ipc token: {0}")]
    InvalidToken(String),

    #[error("transport: {0}")]
    Transport(#[from] io::Error),

    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error("ipc server is already running")]
    AlreadyRunning,

    #[error("thread pool: {0}")]
    Pool(#[from] PoolError),
}

impl IpcError {
    pub fn is_disconnect(&self) -> bool {
        matches!(
            self,
            IpcError::Transport(err) if matches!(
                err.kind(),
                io::ErrorKind::UnexpectedEof
                    | io::ErrorKind::BrokenPipe
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
            )
        )
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Message {
    pub request_id: i64,
    pub message_type: i32,
    pub content: Vec<u8>,
}

impl Message {
    pub fn new(request_id: i64, message_type: i32, content: impl Into<Vec<u8>>) -> Self {
        Self {
            request_id,
            message_type,
            content: content.into(),
        }
    }
}

pub fn validate_token(token: &str) -> Result<()> {
    if token.is_empty() {
        return Err(IpcError::InvalidToken("token is empty".to_string()));
    }
    if token.len() > MAX_TOKEN_SIZE {
        return Err(IpcError::InvalidToken(format!(
            "token is {} bytes, limit is {MAX_TOKEN_SIZE}",
            token.len()
        )));
    }
    if token.contains(['/', '\\', '\0']) {
        return Err(IpcError::InvalidToken(format!(
            "token {token:?} contains a path separator or NUL"
        )));
    }
    Ok(())
}

// POSIX: `/tmp/ani-<token>` (Unix-domain socket). Windows: `\\.\pipe\ani-<token>`.
pub fn address_for_token(token: &str) -> Result<PathBuf> {
    validate_token(token)?;
    #[cfg(not(windows))]
    let address = PathBuf::from(SOCKET_DIR).join(format!("{ADDRESS_PREFIX}{token}"));
    #[cfg(windows)]
    let address = PathBuf::from(format!(r"{PIPE_NAMESPACE}\{ADDRESS_PREFIX}{token}"));
    Ok(address)
}
