// src/transport.rs

//! Local stream transports and the shared connection handle.
//!
//! Unix-like platforms use a Unix domain socket at `${TMP}/<pipeName>`;
//! Windows uses a named pipe at `\\.\pipe\<pipeName>`. Nothing beyond the
//! 12-byte frame header is added on the wire, which keeps the transport
//! byte-compatible with Qt's local-socket framing.
//!
//! Accepted and dialed streams are split into a read half, owned by the
//! connection's read-loop task, and a write half behind an async mutex.
//! Response writes from dispatched handler tasks and request writes from
//! callers race on the same stream; the mutex serializes them so frames are
//! never interleaved.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::AbortHandle;

use crate::error::{Error, Result};

pub(crate) type Reader = Box<dyn AsyncRead + Send + Unpin>;
pub(crate) type Writer = Box<dyn AsyncWrite + Send + Unpin>;

/// Split any duplex stream into boxed halves.
pub(crate) fn split_stream<S>(stream: S) -> (Reader, Writer)
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (reader, writer) = tokio::io::split(stream);
    (Box::new(reader), Box::new(writer))
}

/// Handle to one peer connection.
///
/// Clones share the underlying stream. Identity is by allocation, so a
/// handle can be compared against registry entries to answer "is this still
/// the same peer".
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnInner>,
}

struct ConnInner {
    writer: AsyncMutex<Writer>,
    read_task: parking_lot::Mutex<Option<AbortHandle>>,
    closed: AtomicBool,
}

impl Connection {
    pub(crate) fn new(writer: Writer) -> Self {
        Connection {
            inner: Arc::new(ConnInner {
                writer: AsyncMutex::new(writer),
                read_task: parking_lot::Mutex::new(None),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Remember the read-loop task so an external close can stop it.
    pub(crate) fn attach_read_task(&self, handle: AbortHandle) {
        *self.inner.read_task.lock() = Some(handle);
    }

    /// Write one frame. Writes from concurrent tasks serialize here.
    pub(crate) async fn send(&self, frame: &[u8]) -> Result<()> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(Error::SocketClosed);
        }
        let mut writer = self.inner.writer.lock().await;
        writer.write_all(frame).await?;
        writer.flush().await?;
        Ok(())
    }

    /// Shut the write half down. The peer observes EOF; our own read loop is
    /// left to wind down on its own. Used on exit paths inside the read-loop
    /// task itself, which must not abort itself mid-cleanup.
    pub(crate) async fn close_writer(&self) {
        self.inner.closed.store(true, Ordering::Release);
        let mut writer = self.inner.writer.lock().await;
        let _ = writer.shutdown().await;
    }

    /// Fully close the connection: shut the write half down and stop the
    /// read loop. For callers outside the read-loop task.
    pub(crate) async fn close(&self) {
        self.close_writer().await;
        if let Some(task) = self.inner.read_task.lock().take() {
            task.abort();
        }
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Whether two handles refer to the same underlying stream.
    pub fn same(&self, other: &Connection) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl PartialEq for Connection {
    fn eq(&self, other: &Self) -> bool {
        self.same(other)
    }
}

impl Eq for Connection {}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

#[cfg(unix)]
mod sys {
    use super::{Reader, Writer, split_stream};
    use std::io;
    use std::path::PathBuf;
    use tokio::net::{UnixListener, UnixStream};

    pub(crate) fn socket_path(pipe_name: &str) -> PathBuf {
        std::env::temp_dir().join(pipe_name)
    }

    /// Dial the host's socket.
    pub(crate) async fn dial(pipe_name: &str) -> io::Result<(Reader, Writer)> {
        let stream = UnixStream::connect(socket_path(pipe_name)).await?;
        Ok(split_stream(stream))
    }

    /// Listening socket for the host role.
    pub(crate) struct Listener {
        inner: UnixListener,
    }

    impl Listener {
        pub(crate) fn bind(pipe_name: &str) -> io::Result<Self> {
            let path = socket_path(pipe_name);
            // A stale socket file from a previous run blocks the bind.
            match std::fs::remove_file(&path) {
                Ok(()) => {}
                Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                Err(err) => return Err(err),
            }
            Ok(Listener {
                inner: UnixListener::bind(path)?,
            })
        }

        pub(crate) async fn accept(&mut self) -> io::Result<(Reader, Writer)> {
            let (stream, _addr) = self.inner.accept().await?;
            Ok(split_stream(stream))
        }
    }
}

#[cfg(windows)]
mod sys {
    use super::{Reader, Writer, split_stream};
    use std::io;
    use std::time::Duration;
    use tokio::net::windows::named_pipe::{ClientOptions, NamedPipeServer, ServerOptions};

    /// Raw OS error for "all pipe instances are busy".
    const ERROR_PIPE_BUSY: i32 = 231;

    pub(crate) fn pipe_addr(pipe_name: &str) -> String {
        format!(r"\\.\pipe\{}", pipe_name)
    }

    /// Dial the host's pipe, waiting out transient instance exhaustion.
    pub(crate) async fn dial(pipe_name: &str) -> io::Result<(Reader, Writer)> {
        let addr = pipe_addr(pipe_name);
        let client = loop {
            match ClientOptions::new().open(&addr) {
                Ok(client) => break client,
                Err(err) if err.raw_os_error() == Some(ERROR_PIPE_BUSY) => {
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
                Err(err) => return Err(err),
            }
        };
        Ok(split_stream(client))
    }

    /// Listening pipe for the host role.
    ///
    /// Named pipes hand out one server instance per connection, so the
    /// listener always keeps the next unconnected instance ready.
    pub(crate) struct Listener {
        addr: String,
        next: NamedPipeServer,
    }

    impl Listener {
        pub(crate) fn bind(pipe_name: &str) -> io::Result<Self> {
            let addr = pipe_addr(pipe_name);
            let next = ServerOptions::new()
                .first_pipe_instance(true)
                .create(&addr)?;
            Ok(Listener { addr, next })
        }

        pub(crate) async fn accept(&mut self) -> io::Result<(Reader, Writer)> {
            self.next.connect().await?;
            let replacement = ServerOptions::new().create(&self.addr)?;
            let connected = std::mem::replace(&mut self.next, replacement);
            Ok(split_stream(connected))
        }
    }
}

pub(crate) use sys::{Listener, dial};

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn send_after_close_fails() {
        let (a, _b) = tokio::io::duplex(256);
        let (_reader, writer) = split_stream(a);
        let conn = Connection::new(writer);
        conn.close().await;
        assert!(matches!(conn.send(b"x").await, Err(Error::SocketClosed)));
    }

    #[tokio::test]
    async fn identity_is_by_allocation() {
        let (a, b) = tokio::io::duplex(256);
        let (_ra, wa) = split_stream(a);
        let (_rb, wb) = split_stream(b);
        let first = Connection::new(wa);
        let second = Connection::new(wb);
        assert!(first.same(&first.clone()));
        assert!(!first.same(&second));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn unix_listener_accepts_a_dial() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let pipe_name = format!("pipebus-transport-{}", std::process::id());
        let mut listener = Listener::bind(&pipe_name).unwrap();
        let accepted = tokio::spawn(async move { listener.accept().await.unwrap() });

        let (_reader, mut writer) = dial(&pipe_name).await.unwrap();
        writer.write_all(b"ping").await.unwrap();
        writer.shutdown().await.unwrap();

        let (mut reader, _writer) = accepted.await.unwrap();
        let mut buf = Vec::new();
        reader.read_to_end(&mut buf).await.unwrap();
        assert_eq!(buf, b"ping");
    }
}
