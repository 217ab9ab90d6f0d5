use crate::ipc::Message;
use crate::server::{Context, HandlerError};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum MessageKind {
    Ping = 0,
    Echo = 1,
    Status = 2,
    Shutdown = 3,
}

impl MessageKind {
    pub fn code(self) -> i32 {
        self as i32
    }
}

impl TryFrom<i32> for MessageKind {
    type Error = i32;

    fn try_from(value: i32) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Ping),
            1 => Ok(Self::Echo),
            2 => Ok(Self::Status),
            3 => Ok(Self::Shutdown),
            other => Err(other),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusReport {
    pub service: String,
    pub version: String,
    pub workers: usize,
    pub requests_served: u64,
    pub uptime_ms: u64,
}

impl StatusReport {
    pub fn decode(bytes: &[u8]) -> Result<Self, rmp_serde::decode::Error> {
        rmp_serde::from_slice(bytes)
    }
}

pub struct EchoService {
    name: String,
    workers: usize,
    started: Instant,
    served: AtomicU64,
}

impl EchoService {
    pub fn new(name: &str, workers: usize) -> Self {
        Self {
            name: name.to_string(),
            workers,
            started: Instant::now(),
            served: AtomicU64::new(0),
        }
    }

    pub fn requests_served(&self) -> u64 {
        self.served.load(Ordering::Relaxed)
    }

    pub fn handle(&self, ctx: &Context, msg: &Message) -> Result<Vec<u8>, HandlerError> {
        let kind = MessageKind::try_from(msg.message_type)
            .map_err(|code| format!("unsupported message type {code}"))?;
        let served = self.served.fetch_add(1, Ordering::Relaxed) + 1;
        match kind {
            MessageKind::Ping => Ok(b"pong".to_vec()),
            MessageKind::Echo => Ok(msg.content.clone()),
            MessageKind::Status => {
                let report = StatusReport {
                    service: self.name.clone(),
                    version: env!("CARGO_PKG_VERSION").to_string(),
                    workers: self.workers,
                    requests_served: served,
                    uptime_ms: self.started.elapsed().as_millis() as u64,
                };
                Ok(rmp_serde::to_vec_named(&report)?)
            }
            MessageKind::Shutdown => {
                tracing::info!(service = %self.name, "shutdown requested over ipc");
                ctx.shutdown();
                Ok(b"bye".to_vec())
            }
        }
    }
}
