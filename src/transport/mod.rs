use crate::ipc::{address_for_token, Result};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const BUFFER_SIZE: usize = 8192;
pub const LISTEN_BACKLOG: i32 = 16;

/// A zero-length read means the peer is gone and is reported as `UnexpectedEof`.
pub fn read_exact<R>(reader: &mut R, buf: &mut [u8]) -> io::Result<()>
where
    R: Read + ?Sized,
{
    let total = buf.len();
    let mut filled = 0;
    while filled < total {
        let end = filled + (total - filled).min(BUFFER_SIZE);
        match reader.read(&mut buf[filled..end]) {
            Ok(0) => {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!("peer closed after {filled} of {total} bytes"),
                ))
            }
            Ok(n) => filled += n,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(err),
        }
    }
    Ok(())
}

pub fn write_all<W>(writer: &mut W, buf: &[u8]) -> io::Result<()>
where
    W: Write + ?Sized,
{
    let total = buf.len();
    let mut written = 0;
    while written < total {
        let end = written + (total - written).min(BUFFER_SIZE);
        match writer.write(&buf[written..end]) {
            Ok(0) => {
                return Err(io::Error::new(
                    io::ErrorKind::WriteZero,
                    format!("peer stopped accepting after {written} of {total} bytes"),
                ))
            }
            Ok(n) => written += n,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(err),
        }
    }
    writer.flush()
}

pub struct Tunnel {
    stream: imp::Stream,
}

impl Tunnel {
    pub fn dial(token: &str) -> Result<Self> {
        let address = address_for_token(token)?;
        let stream = imp::dial(&address)?;
        Ok(Self { stream })
    }

    /// `None` restores fully blocking I/O.
    pub fn set_io_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        imp::set_io_timeout(&self.stream, timeout)
    }

    pub fn read_exact(&mut self, buf: &mut [u8]) -> io::Result<()> {
        read_exact(&mut self.stream, buf)
    }

    pub fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        write_all(&mut self.stream, buf)
    }

    pub fn close(self) {
        imp::close(self.stream);
    }
}

impl Read for Tunnel {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.stream.read(buf)
    }
}

impl Write for Tunnel {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.stream.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.stream.flush()
    }
}

#[cfg(unix)]
impl From<std::os::unix::net::UnixStream> for Tunnel {
    fn from(stream: std::os::unix::net::UnixStream) -> Self {
        Self { stream }
    }
}

pub struct Listener {
    inner: imp::Listener,
    address: PathBuf,
}

impl Listener {
    pub fn bind(token: &str) -> Result<Self> {
        let address = address_for_token(token)?;
        let inner = imp::bind(&address, LISTEN_BACKLOG)?;
        tracing::debug!(address = %address.display(), "ipc transport bound");
        Ok(Self { inner, address })
    }

    /// Blocks until a client connects. Returns `Ok(None)` once the listener
    /// has been closed through one of its [`ListenerCloser`]s.
    pub fn accept(&self) -> io::Result<Option<Tunnel>> {
        Ok(self.inner.accept()?.map(|stream| Tunnel { stream }))
    }

    pub fn closer(&self) -> ListenerCloser {
        ListenerCloser {
            inner: self.inner.closer(),
        }
    }

    pub fn address(&self) -> &Path {
        &self.address
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        self.inner.unbind(&self.address);
    }
}

/// Releases a blocked [`Listener::accept`] from another thread. Closing is
/// sticky: every later accept on that listener returns `Ok(None)` as well.
#[derive(Clone)]
pub struct ListenerCloser {
    inner: imp::Closer,
}

impl ListenerCloser {
    pub fn close(&self) {
        self.inner.close();
    }
}

#[cfg(unix)]
use unix_impl as imp;
#[cfg(windows)]
use windows_impl as imp;

#[cfg(unix)]
mod unix_impl {
    use std::fs;
    use std::io::{self, Write};
    use std::net::Shutdown;
    use std::os::unix::fs::MetadataExt;
    use std::os::unix::io::AsRawFd;
    use std::os::unix::net::{UnixListener, UnixStream};
    use std::path::Path;
    use std::sync::Arc;
    use std::time::Duration;

    pub type Stream = UnixStream;

    pub struct Listener {
        socket: UnixListener,
        wake_rx: UnixStream,
        wake_tx: Arc<UnixStream>,
        // (dev, ino) of the socket file this listener created.
        identity: (u64, u64),
    }

    #[derive(Clone)]
    pub struct Closer(Arc<UnixStream>);

    impl Closer {
        pub fn close(&self) {
            // The wake socket is non-blocking; a full buffer means a wake is already pending.
            let _ = (&*self.0).write(&[1]);
        }
    }

    impl Listener {
        pub fn accept(&self) -> io::Result<Option<UnixStream>> {
            loop {
                let mut fds = [
                    libc::pollfd {
                        fd: self.socket.as_raw_fd(),
                        events: libc::POLLIN,
                        revents: 0,
                    },
                    libc::pollfd {
                        fd: self.wake_rx.as_raw_fd(),
                        events: libc::POLLIN,
                        revents: 0,
                    },
                ];
                let ready = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, -1) };
                if ready < 0 {
                    let err = io::Error::last_os_error();
                    if err.kind() == io::ErrorKind::Interrupted {
                        continue;
                    }
                    return Err(err);
                }
                if fds[1].revents != 0 {
                    return Ok(None);
                }
                match self.socket.accept() {
                    Ok((stream, _)) => {
                        // BSD-derived systems hand out accepted sockets non-blocking.
                        stream.set_nonblocking(false)?;
                        return Ok(Some(stream));
                    }
                    Err(err)
                        if matches!(
                            err.kind(),
                            io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
                        ) =>
                    {
                        continue
                    }
                    Err(err) => return Err(err),
                }
            }
        }

        pub fn closer(&self) -> Closer {
            Closer(self.wake_tx.clone())
        }

        pub fn unbind(&self, address: &Path) {
            // Leave the path alone if another server has bound it since.
            match fs::metadata(address) {
                Ok(meta) if (meta.dev(), meta.ino()) == self.identity => {
                    let _ = fs::remove_file(address);
                }
                _ => {}
            }
        }
    }

    pub fn bind(address: &Path, backlog: i32) -> io::Result<Listener> {
        match fs::remove_file(address) {
            Ok(()) => tracing::debug!(address = %address.display(), "removed stale ipc socket"),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => return Err(err),
        }
        let socket = UnixListener::bind(address)?;
        // std listens with its own default; listening again only resizes the queue.
        if unsafe { libc::listen(socket.as_raw_fd(), backlog) } != 0 {
            return Err(io::Error::last_os_error());
        }
        socket.set_nonblocking(true)?;
        let meta = fs::metadata(address)?;

        let (wake_rx, wake_tx) = UnixStream::pair()?;
        wake_tx.set_nonblocking(true)?;
        Ok(Listener {
            socket,
            wake_rx,
            wake_tx: Arc::new(wake_tx),
            identity: (meta.dev(), meta.ino()),
        })
    }

    pub fn dial(address: &Path) -> io::Result<UnixStream> {
        UnixStream::connect(address)
    }

    pub fn set_io_timeout(stream: &UnixStream, timeout: Option<Duration>) -> io::Result<()> {
        stream.set_read_timeout(timeout)?;
        stream.set_write_timeout(timeout)
    }

    pub fn close(stream: UnixStream) {
        let _ = stream.shutdown(Shutdown::Both);
    }
}

#[cfg(windows)]
mod windows_impl {
    use super::BUFFER_SIZE;
    use std::fs::{File, OpenOptions};
    use std::io;
    use std::os::windows::ffi::OsStrExt;
    use std::os::windows::io::{FromRawHandle, RawHandle};
    use std::path::{Path, PathBuf};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::time::Duration;
    use windows::core::PCWSTR;
    use windows::Win32::Foundation::{CloseHandle, ERROR_PIPE_CONNECTED};
    use windows::Win32::Storage::FileSystem::PIPE_ACCESS_DUPLEX;
    use windows::Win32::System::Pipes::{
        ConnectNamedPipe, CreateNamedPipeW, PIPE_READMODE_BYTE, PIPE_TYPE_BYTE,
        PIPE_UNLIMITED_INSTANCES, PIPE_WAIT,
    };

    pub type Stream = File;

    pub struct Listener {
        wide_name: Vec<u16>,
        address: PathBuf,
        closed: Arc<AtomicBool>,
    }

    #[derive(Clone)]
    pub struct Closer {
        address: PathBuf,
        closed: Arc<AtomicBool>,
    }

    impl Closer {
        pub fn close(&self) {
            self.closed.store(true, Ordering::SeqCst);
            // ConnectNamedPipe has no timeout; a throwaway client releases it.
            if let Ok(wake) = dial(&self.address) {
                drop(wake);
            }
        }
    }

    impl Listener {
        // Every accept creates a fresh pipe instance, so any number of
        // sessions can be open at once.
        pub fn accept(&self) -> io::Result<Option<File>> {
            if self.closed.load(Ordering::SeqCst) {
                return Ok(None);
            }
            let handle = unsafe {
                CreateNamedPipeW(
                    PCWSTR(self.wide_name.as_ptr()),
                    PIPE_ACCESS_DUPLEX,
                    PIPE_TYPE_BYTE | PIPE_READMODE_BYTE | PIPE_WAIT,
                    PIPE_UNLIMITED_INSTANCES,
                    BUFFER_SIZE as u32,
                    BUFFER_SIZE as u32,
                    0,
                    None,
                )
            };
            if handle.is_invalid() {
                return Err(io::Error::last_os_error());
            }
            if let Err(err) = unsafe { ConnectNamedPipe(handle, None) } {
                if err.code() != ERROR_PIPE_CONNECTED.to_hresult() {
                    unsafe {
                        let _ = CloseHandle(handle);
                    }
                    return Err(io::Error::new(
                        io::ErrorKind::Other,
                        format!("ConnectNamedPipe failed: {err}"),
                    ));
                }
            }
            let pipe = unsafe { File::from_raw_handle(handle.0 as RawHandle) };
            if self.closed.load(Ordering::SeqCst) {
                return Ok(None);
            }
            Ok(Some(pipe))
        }

        pub fn closer(&self) -> Closer {
            Closer {
                address: self.address.clone(),
                closed: self.closed.clone(),
            }
        }

        pub fn unbind(&self, _address: &Path) {}
    }

    pub fn bind(address: &Path, _backlog: i32) -> io::Result<Listener> {
        let wide_name = address
            .as_os_str()
            .encode_wide()
            .chain(std::iter::once(0))
            .collect();
        Ok(Listener {
            wide_name,
            address: address.to_path_buf(),
            closed: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn dial(address: &Path) -> io::Result<File> {
        OpenOptions::new().read(true).write(true).open(address)
    }

    pub fn set_io_timeout(_stream: &File, timeout: Option<Duration>) -> io::Result<()> {
        if timeout.is_some() {
            tracing::debug!("io timeouts are not applied to named pipes");
        }
        Ok(())
    }

    pub fn close(stream: File) {
        drop(stream);
    }
}
