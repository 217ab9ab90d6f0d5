pub mod client;
pub mod codec;
pub mod config;
pub mod ipc;
pub mod pool;
pub mod server;
pub mod service;
pub mod transport;

pub use client::IpcClient;
pub use ipc::{IpcError, Message, Result};
pub use pool::{PoolError, ResultSet, TaskHandle, ThreadPool};
pub use server::{Context, IpcServer, Session, SessionInfo};
