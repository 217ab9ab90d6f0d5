use crate::codec;
use crate::ipc::{validate_token, IpcError, Message, Result};
use crate::pool::{PoolError, ThreadPool};
use crate::transport::{Listener, ListenerCloser, Tunnel};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};
use std::time::Duration;

pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;
pub type MessageHandler =
    Arc<dyn Fn(&Context, &Message) -> std::result::Result<Vec<u8>, HandlerError> + Send + Sync>;
pub type DisconnectHandler = Arc<dyn Fn(&Context, &SessionInfo) + Send + Sync>;

pub struct IpcServer {
    token: String,
    pool: Arc<ThreadPool>,
    running: AtomicBool,
    active: AtomicBool,
    next_session_id: AtomicU64,
    closer: Mutex<Option<ListenerCloser>>,
    io_timeout: RwLock<Option<Duration>>,
    message_handler: RwLock<Option<MessageHandler>>,
    disconnect_handler: RwLock<Option<DisconnectHandler>>,
}

impl IpcServer {
    pub fn new(token: &str) -> Result<Arc<Self>> {
        Ok(Self::with_pool(token, ThreadPool::global()?))
    }

    pub fn with_pool(token: &str, pool: Arc<ThreadPool>) -> Arc<Self> {
        Arc::new(Self {
            token: token.to_string(),
            pool,
            running: AtomicBool::new(false),
            active: AtomicBool::new(false),
            next_session_id: AtomicU64::new(1),
            closer: Mutex::new(None),
            io_timeout: RwLock::new(None),
            message_handler: RwLock::new(None),
            disconnect_handler: RwLock::new(None),
        })
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn pool(&self) -> &Arc<ThreadPool> {
        &self.pool
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn set_message_handler<F>(&self, handler: F)
    where
        F: Fn(&Context, &Message) -> std::result::Result<Vec<u8>, HandlerError>
            + Send
            + Sync
            + 'static,
    {
        *self
            .message_handler
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(handler));
    }

    pub fn set_disconnect_handler<F>(&self, handler: F)
    where
        F: Fn(&Context, &SessionInfo) + Send + Sync + 'static,
    {
        *self
            .disconnect_handler
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(handler));
    }

    pub fn set_io_timeout(&self, timeout: Option<Duration>) {
        *self.io_timeout.write().unwrap_or_else(PoisonError::into_inner) = timeout;
    }

    /// Blocks the calling thread. Only one `run` may be active at a time.
    pub fn run(self: &Arc<Self>) -> Result<()> {
        validate_token(&self.token)?;
        if self.pool.is_owner() {
            return Err(IpcError::Pool(PoolError::ReentrantSubmit));
        }
        if self
            .active
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(IpcError::AlreadyRunning);
        }
        let _active = ActiveGuard(&self.active);
        self.running.store(true, Ordering::SeqCst);

        let listener = match Listener::bind(&self.token) {
            Ok(listener) => listener,
            Err(err) => {
                self.running.store(false, Ordering::SeqCst);
                return Err(err);
            }
        };
        tracing::info!(
            token = %self.token,
            address = %listener.address().display(),
            workers = self.pool.size(),
            "ipc server listening"
        );

        *self.closer.lock().unwrap_or_else(PoisonError::into_inner) = Some(listener.closer());

        // A shutdown that ran before the closer was published is caught by
        // the loop condition instead.
        let mut outcome = Ok(());
        while self.running.load(Ordering::SeqCst) {
            let tunnel = match listener.accept() {
                Ok(Some(tunnel)) => tunnel,
                Ok(None) => break,
                Err(err) => {
                    tracing::warn!(token = %self.token, error = %err, "ipc accept failed");
                    break;
                }
            };
            if !self.running.load(Ordering::SeqCst) {
                tunnel.close();
                break;
            }
            if let Err(err) = self.schedule_session(tunnel) {
                tracing::warn!(token = %self.token, error = %err, "ipc session could not be scheduled");
                outcome = Err(err.into());
                break;
            }
        }

        self.closer.lock().unwrap_or_else(PoisonError::into_inner).take();
        drop(listener);
        self.running.store(false, Ordering::SeqCst);
        tracing::info!(token = %self.token, "ipc server stopped");
        outcome
    }

    /// Closes the listening handle, which releases a blocked accept even if
    /// the socket file has been removed. Safe to call repeatedly, before
    /// `run`, and from inside a handler.
    pub fn shutdown(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        tracing::info!(token = %self.token, "ipc server shutting down");
        if let Some(closer) = self.closer.lock().unwrap_or_else(PoisonError::into_inner).as_ref() {
            closer.close();
        }
    }

    pub fn serve_connection(self: &Arc<Self>, tunnel: Tunnel) {
        let id = self.next_session_id.fetch_add(1, Ordering::Relaxed);
        self.apply_io_timeout(&tunnel);
        Session::new(id, Arc::downgrade(self), tunnel).run();
    }

    fn schedule_session(self: &Arc<Self>, tunnel: Tunnel) -> std::result::Result<(), PoolError> {
        let id = self.next_session_id.fetch_add(1, Ordering::Relaxed);
        self.apply_io_timeout(&tunnel);
        tracing::debug!(token = %self.token, session = id, "ipc connection accepted");
        let server = self.clone();
        self.pool.submit(move || {
            Session::new(id, Arc::downgrade(&server), tunnel).run();
            drop(server);
        })?;
        Ok(())
    }

    fn apply_io_timeout(&self, tunnel: &Tunnel) {
        let timeout = *self.io_timeout.read().unwrap_or_else(PoisonError::into_inner);
        if timeout.is_none() {
            return;
        }
        if let Err(err) = tunnel.set_io_timeout(timeout) {
            tracing::warn!(error = %err, "failed to apply ipc io timeout");
        }
    }

    fn message_handler(&self) -> Option<MessageHandler> {
        self.message_handler
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn disconnect_handler(&self) -> Option<DisconnectHandler> {
        self.disconnect_handler
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn dispatch(&self, ctx: &Context, request: &Message) -> Vec<u8> {
        let Some(handler) = self.message_handler() else {
            tracing::debug!(token = %self.token, "no ipc message handler installed");
            return Vec::new();
        };
        match panic::catch_unwind(AssertUnwindSafe(|| handler(ctx, request))) {
            Ok(Ok(body)) => body,
            Ok(Err(err)) => {
                tracing::warn!(
                    request_id = request.request_id,
                    message_type = request.message_type,
                    error = %err,
                    "ipc handler failed"
                );
                Vec::new()
            }
            Err(_) => {
                tracing::warn!(
                    request_id = request.request_id,
                    message_type = request.message_type,
                    "ipc handler panicked"
                );
                Vec::new()
            }
        }
    }
}

struct ActiveGuard<'a>(&'a AtomicBool);

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Handed to every handler invocation. Holds the server weakly, so a handler
/// can stop the server without keeping it alive.
#[derive(Clone)]
pub struct Context {
    server: Weak<IpcServer>,
}

impl Context {
    fn new(server: Weak<IpcServer>) -> Self {
        Self { server }
    }

    pub fn shutdown(&self) {
        if let Some(server) = self.server.upgrade() {
            server.shutdown();
        }
    }

    pub fn token(&self) -> Option<String> {
        self.server.upgrade().map(|server| server.token.clone())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    pub id: u64,
    pub requests_served: u64,
}

pub struct Session {
    id: u64,
    server: Weak<IpcServer>,
    tunnel: Tunnel,
    requests_served: u64,
}

impl Session {
    pub fn new(id: u64, server: Weak<IpcServer>, tunnel: Tunnel) -> Self {
        Self {
            id,
            server,
            tunnel,
            requests_served: 0,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn run(mut self) {
        tracing::debug!(session = self.id, "ipc session started");
        loop {
            match self.serve_one() {
                Ok(true) => continue,
                Ok(false) => {
                    tracing::debug!(session = self.id, "ipc server gone, closing session");
                    break;
                }
                Err(err) if err.is_disconnect() => {
                    tracing::info!(
                        session = self.id,
                        requests = self.requests_served,
                        "ipc client disconnected"
                    );
                    break;
                }
                Err(err) => {
                    tracing::warn!(session = self.id, error = %err, "ipc session error");
                    break;
                }
            }
        }
        self.close();
    }

    /// One request/response exchange. `Ok(false)` means the server no longer exists.
    fn serve_one(&mut self) -> Result<bool> {
        let header = codec::read_header(&mut self.tunnel)?;
        let content = codec::read_body(&mut self.tunnel, &header)?;
        let request = Message {
            request_id: header.request_id,
            message_type: header.message_type,
            content,
        };

        let Some(server) = self.server.upgrade() else {
            return Ok(false);
        };
        let ctx = Context::new(self.server.clone());
        tracing::debug!(
            session = self.id,
            request_id = request.request_id,
            message_type = request.message_type,
            bytes = request.content.len(),
            "ipc request"
        );
        let content = server.dispatch(&ctx, &request);
        drop(server);

        let response = Message {
            request_id: request.request_id,
            message_type: request.message_type,
            content,
        };
        codec::write_frame(&mut self.tunnel, &response)?;
        self.requests_served += 1;
        Ok(true)
    }

    fn close(self) {
        let Session {
            id,
            server,
            tunnel,
            requests_served,
        } = self;
        tunnel.close();

        let Some(server) = server.upgrade() else {
            return;
        };
        let Some(handler) = server.disconnect_handler() else {
            return;
        };
        let ctx = Context::new(Arc::downgrade(&server));
        let info = SessionInfo {
            id,
            requests_served,
        };
        if panic::catch_unwind(AssertUnwindSafe(|| handler(&ctx, &info))).is_err() {
            tracing::warn!(session = id, "ipc disconnect handler panicked");
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::os::unix::net::UnixStream;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;
    use std::thread;

    fn test_server(token: &str) -> Arc<IpcServer> {
        IpcServer::with_pool(token, Arc::new(ThreadPool::new("session-test", 1).unwrap()))
    }

    fn spawn_session(server: &Arc<IpcServer>) -> (UnixStream, thread::JoinHandle<()>) {
        let (server_side, client_side) = UnixStream::pair().unwrap();
        let server = server.clone();
        let task = thread::spawn(move || server.serve_connection(Tunnel::from(server_side)));
        (client_side, task)
    }

    fn exchange(client: &mut UnixStream, request: &Message) -> Message {
        codec::write_frame(client, request).unwrap();
        codec::read_frame(client).unwrap()
    }

    #[test]
    fn session_echoes_ids_and_keeps_serving() {
        let server = test_server("session-echo");
        server.set_message_handler(|_ctx, msg| {
            let mut body = b"re:".to_vec();
            body.extend_from_slice(&msg.content);
            Ok(body)
        });
        let (mut client, task) = spawn_session(&server);

        for i in 0..5i64 {
            let resp = exchange(&mut client, &Message::new(i * 10, 3, format!("m{i}")));
            assert_eq!(resp.request_id, i * 10);
            assert_eq!(resp.message_type, 3);
            assert_eq!(resp.content, format!("re:m{i}").into_bytes());
        }

        drop(client);
        task.join().unwrap();
    }

    #[test]
    fn handler_error_and_panic_yield_empty_body_and_session_continues() {
        let server = test_server("session-faults");
        server.set_message_handler(|_ctx, msg| match msg.message_type {
            1 => Err("cannot parse request".into()),
            2 => panic!("handler exploded"),
            _ => Ok(b"fine".to_vec()),
        });
        let (mut client, task) = spawn_session(&server);

        let failed = exchange(&mut client, &Message::new(0, 1, b"x".to_vec()));
        assert_eq!(failed.request_id, 0);
        assert!(failed.content.is_empty());

        let panicked = exchange(&mut client, &Message::new(1, 2, b"x".to_vec()));
        assert_eq!(panicked.request_id, 1);
        assert!(panicked.content.is_empty());

        let ok = exchange(&mut client, &Message::new(2, 0, b"x".to_vec()));
        assert_eq!(ok.content, b"fine");

        drop(client);
        task.join().unwrap();
    }

    #[test]
    fn missing_handler_answers_with_empty_body() {
        let server = test_server("session-nohandler");
        let (mut client, task) = spawn_session(&server);
        let resp = exchange(&mut client, &Message::new(9, 4, b"anyone?".to_vec()));
        assert_eq!(resp.request_id, 9);
        assert!(resp.content.is_empty());
        drop(client);
        task.join().unwrap();
    }

    #[test]
    fn disconnect_handler_fires_once_with_session_stats() {
        let server = test_server("session-disconnect");
        server.set_message_handler(|_ctx, msg| Ok(msg.content.clone()));
        let seen = Arc::new(Mutex::new(Vec::<SessionInfo>::new()));
        let sink = seen.clone();
        server.set_disconnect_handler(move |_ctx, info| sink.lock().unwrap().push(info.clone()));

        let (mut client, task) = spawn_session(&server);
        exchange(&mut client, &Message::new(0, 0, b"a".to_vec()));
        exchange(&mut client, &Message::new(1, 0, b"b".to_vec()));
        drop(client);
        task.join().unwrap();

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].requests_served, 2);
    }

    #[test]
    fn session_closes_without_reply_when_server_is_gone() {
        let server = test_server("session-orphan");
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        server.set_disconnect_handler(move |_ctx, _info| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        let weak = Arc::downgrade(&server);
        drop(server);

        let (server_side, mut client) = UnixStream::pair().unwrap();
        let task = thread::spawn(move || Session::new(7, weak, Tunnel::from(server_side)).run());
        codec::write_frame(&mut client, &Message::new(0, 0, b"hello".to_vec())).unwrap();
        let err = codec::read_frame(&mut client).unwrap_err();
        assert!(err.is_disconnect());
        task.join().unwrap();
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn context_reports_token_and_tolerates_dropped_server() {
        let server = test_server("ctx-token");
        let ctx = Context::new(Arc::downgrade(&server));
        assert_eq!(ctx.token().as_deref(), Some("ctx-token"));
        ctx.shutdown();
        assert!(!server.is_running());

        drop(server);
        assert_eq!(ctx.token(), None);
        ctx.shutdown();
    }

    #[test]
    fn shutdown_before_run_is_a_no_op() {
        let server = test_server("never-started");
        server.shutdown();
        server.shutdown();
        assert!(!server.is_running());
    }

    #[test]
    fn run_rejects_invalid_token_before_binding() {
        let server = test_server(&"x".repeat(crate::ipc::MAX_TOKEN_SIZE + 1));
        assert!(matches!(server.run(), Err(IpcError::InvalidToken(_))));
        assert!(!server.is_running());
    }
}
