// src/plugin.rs

//! Plugin role: dials the host, performs the connect handshake, and
//! participates as a peer.
//!
//! Objects may be published before connecting; `connect` replays a Publish
//! round-trip for each of them once the host has accepted the plugin id.
//! After that the plugin serves inbound calls against its object map and may
//! call paths published elsewhere, exactly like the host does.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use rmpv::Value;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::endpoint::Endpoint;
use crate::error::{Error, Result};
use crate::message::{Inbound, Message, MessageType, archive, parse};
use crate::proxy::Proxy;
use crate::session::SessionStrategy;
use crate::transport::{Connection, Reader, Writer, dial};

/// A process that dials a host and participates as a peer on the bus.
///
/// Cloning hands out another handle to the same plugin.
#[derive(Clone)]
pub struct Plugin {
    inner: Arc<PluginInner>,
}

struct PluginInner {
    pipe_name: String,
    id: String,
    endpoint: Arc<Endpoint>,
    socket: Mutex<Option<Connection>>,
    connected: AtomicBool,
    read_task: Mutex<Option<JoinHandle<()>>>,
}

/// What the read loop should do after a frame was handled.
enum Flow {
    Continue,
    Shutdown,
}

impl Plugin {
    /// Create a plugin that will dial `pipe_name` and identify itself with
    /// `id`. Nothing touches the socket until [`Plugin::connect`].
    pub fn new(pipe_name: impl Into<String>, id: impl Into<String>) -> Self {
        Plugin::with_strategy(pipe_name, id, SessionStrategy::Recycle)
    }

    pub(crate) fn with_strategy(
        pipe_name: impl Into<String>,
        id: impl Into<String>,
        strategy: SessionStrategy,
    ) -> Self {
        Plugin {
            inner: Arc::new(PluginInner {
                pipe_name: pipe_name.into(),
                id: id.into(),
                endpoint: Arc::new(Endpoint::new(strategy)),
                socket: Mutex::new(None),
                connected: AtomicBool::new(false),
                read_task: Mutex::new(None),
            }),
        }
    }

    /// The id this plugin registers under.
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    /// Dial the host and perform the connect handshake: identify, then
    /// replay a Publish for every pre-registered object. The read loop keeps
    /// running in the background after this returns.
    pub async fn connect(&self) -> Result<()> {
        if self.inner.socket.lock().is_some() {
            return Err(Error::AlreadyConnected);
        }
        let (reader, writer) = dial(&self.inner.pipe_name).await?;
        self.connect_io(reader, writer).await
    }

    /// Like [`Plugin::connect`], but parks until the read loop exits, which
    /// happens when either side disconnects.
    pub async fn connect_and_serve(&self) -> Result<()> {
        self.connect().await?;
        let task = self.inner.read_task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
        Ok(())
    }

    /// Handshake over an already-established stream.
    pub(crate) async fn connect_io(&self, reader: Reader, writer: Writer) -> Result<()> {
        let conn = Connection::new(writer);
        *self.inner.socket.lock() = Some(conn.clone());

        let inner = self.inner.clone();
        let loop_conn = conn.clone();
        let task = tokio::spawn(async move { inner.serve_connection(loop_conn, reader).await });
        conn.attach_read_task(task.abort_handle());
        *self.inner.read_task.lock() = Some(task);

        match self.handshake(&conn).await {
            Ok(()) => Ok(()),
            Err(err) => {
                *self.inner.socket.lock() = None;
                conn.close().await;
                self.inner.endpoint.sessions.fail_all();
                Err(err)
            }
        }
    }

    async fn handshake(&self, conn: &Connection) -> Result<()> {
        let reply = self
            .inner
            .endpoint
            .request(
                conn,
                MessageType::ConnectClient,
                self.inner.id.as_bytes(),
                None,
            )
            .await?;
        if reply.kind != MessageType::ResultOk {
            return Err(Error::HandshakeFailed(format!(
                "can't connect to '{}'",
                self.inner.pipe_name
            )));
        }

        for path in self.inner.endpoint.object_paths() {
            let reply = self
                .inner
                .endpoint
                .request(conn, MessageType::Publish, path.as_bytes(), None)
                .await?;
            if reply.kind != MessageType::ResultOk {
                return Err(Error::HandshakeFailed(format!(
                    "can't publish object at '{}'",
                    path
                )));
            }
        }

        self.inner.connected.store(true, Ordering::Release);
        debug!(id = %self.inner.id, "connected to host");
        Ok(())
    }

    /// Orderly disconnect: tell the host, then drop the socket. Subsequent
    /// operations fail with [`Error::SocketClosed`].
    pub async fn close(&self) -> Result<()> {
        let conn = self.inner.socket.lock().take();
        let Some(conn) = conn else {
            return Err(Error::SocketClosed);
        };
        self.inner.connected.store(false, Ordering::Release);

        let reply = self
            .inner
            .endpoint
            .request(&conn, MessageType::CloseClient, &[], None)
            .await;
        conn.close().await;
        self.inner.endpoint.sessions.fail_all();

        match reply {
            Ok(message) if message.kind == MessageType::ResultOk => Ok(()),
            Ok(_) => Err(Error::HandshakeFailed(format!(
                "unregister error: '{}'",
                self.inner.pipe_name
            ))),
            Err(err) => Err(err),
        }
    }

    /// Register an object at `path`, to be claimed on the host when the
    /// plugin connects. Only valid before [`Plugin::connect`].
    pub fn publish(&self, path: impl Into<String>, proxy: Proxy) -> Result<()> {
        if proxy.is_empty() {
            return Err(Error::NilTarget);
        }
        if self.inner.connected.load(Ordering::Acquire) {
            return Err(Error::AlreadyConnected);
        }
        self.inner.endpoint.insert_object(path.into(), proxy);
        Ok(())
    }

    /// Withdraw an object. When connected, the host is asked to drop the
    /// reservation as well.
    pub async fn unpublish(&self, path: &str) -> Result<()> {
        if !self.inner.endpoint.remove_object(path) {
            return Err(Error::DuplicateRegistration(format!(
                "unpublish error: no object is registered at '{}'",
                path
            )));
        }
        if !self.inner.connected.load(Ordering::Acquire) {
            return Ok(());
        }
        let conn = self.inner.socket.lock().clone();
        let Some(conn) = conn else {
            return Ok(());
        };
        let reply = self
            .inner
            .endpoint
            .request(&conn, MessageType::Unpublish, path.as_bytes(), None)
            .await?;
        if reply.kind != MessageType::ResultOk {
            return Err(Error::HandshakeFailed(format!(
                "host refused to release '{}'",
                path
            )));
        }
        Ok(())
    }

    /// Invoke `method` on the object at `path`. A locally owned path is
    /// invoked in place; anything else goes to the host.
    pub async fn call(&self, path: &str, method: &str, params: Vec<Value>) -> Result<Vec<Value>> {
        self.call_impl(path, method, params, None).await
    }

    /// Like [`Plugin::call`], but gives up with [`Error::Timeout`] when no
    /// response arrives in time. The abandoned session is released.
    pub async fn call_with_timeout(
        &self,
        path: &str,
        method: &str,
        params: Vec<Value>,
        deadline: Duration,
    ) -> Result<Vec<Value>> {
        self.call_impl(path, method, params, Some(deadline)).await
    }

    async fn call_impl(
        &self,
        path: &str,
        method: &str,
        params: Vec<Value>,
        deadline: Option<Duration>,
    ) -> Result<Vec<Value>> {
        let conn = self.inner.socket.lock().clone();
        let Some(conn) = conn else {
            return Err(Error::SocketClosed);
        };
        if let Some(proxy) = self.inner.endpoint.local_object(path) {
            return proxy.call(method, params);
        }
        self.inner
            .endpoint
            .call_remote(&conn, path, method, params, deadline)
            .await
    }

    /// Ask the host whether anything answers at `path`.
    pub async fn confirm_path(&self, path: &str) -> bool {
        let conn = self.inner.socket.lock().clone();
        let Some(conn) = conn else {
            return false;
        };
        matches!(
            self.inner
                .endpoint
                .request(&conn, MessageType::ConfirmPath, path.as_bytes(), None)
                .await,
            Ok(message) if message.kind == MessageType::ResultOk
        )
    }
}

impl PluginInner {
    async fn serve_connection(self: Arc<Self>, conn: Connection, mut reader: Reader) {
        loop {
            match parse(&mut reader).await {
                Ok(Inbound::Frame(message)) => {
                    if let Flow::Shutdown = self.receive(&conn, message).await {
                        break;
                    }
                }
                Ok(Inbound::Eof) => {
                    debug!("host closed the connection");
                    break;
                }
                Err(err) => {
                    warn!("dropping host connection: {}", err);
                    break;
                }
            }
        }
        self.detach(&conn);
        conn.close_writer().await;
    }

    /// Drop connection state so later operations fail fast, and wake any
    /// callers still parked on a session.
    fn detach(&self, conn: &Connection) {
        let mut socket = self.socket.lock();
        if socket.as_ref().is_some_and(|current| current.same(conn)) {
            *socket = None;
        }
        drop(socket);
        self.connected.store(false, Ordering::Release);
        self.endpoint.sessions.fail_all();
    }

    async fn receive(self: &Arc<Self>, conn: &Connection, message: Message) -> Flow {
        match message.kind {
            kind if kind.is_result() => {
                self.endpoint.deliver(message);
                Flow::Continue
            }
            MessageType::CallMethod => {
                self.endpoint.spawn_call(conn.clone(), message);
                Flow::Continue
            }
            MessageType::CloseClient => {
                // Host-initiated disconnect; ack and wind the loop down.
                self.reply(conn, MessageType::ResultOk, message.session).await;
                Flow::Shutdown
            }
            MessageType::Unpublish => {
                // Collision resolution: another plugin took the path over.
                if let Ok(path) = std::str::from_utf8(&message.body) {
                    debug!(path = %path, "releasing path at host request");
                    self.endpoint.remove_object(path);
                }
                self.reply(conn, MessageType::ResultOk, message.session).await;
                Flow::Continue
            }
            MessageType::ConnectClient | MessageType::ConfirmPath => {
                // A plugin hosts no namespace of its own; path resolution is
                // the host's job.
                self.reply(conn, MessageType::ResultNg, message.session).await;
                Flow::Continue
            }
            other => {
                debug!("ignoring {} from the host", other);
                Flow::Continue
            }
        }
    }

    async fn reply(&self, conn: &Connection, kind: MessageType, session: u32) {
        if let Err(err) = conn.send(&archive(kind, session, &[])).await {
            debug!("reply write failed, host is gone: {}", err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{archive_method_call, parse_method_call};
    use crate::transport::split_stream;
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

    fn test_plugin() -> Plugin {
        Plugin::with_strategy("pipe.test", "github.com/example/p1", SessionStrategy::Increment)
    }

    fn image_reader() -> Proxy {
        let mut proxy = Proxy::new();
        proxy.register("TestMethod", |_params| Ok(vec![Value::from("ok")]));
        proxy
    }

    async fn read_frame(stream: &mut DuplexStream) -> Message {
        match parse(stream).await.unwrap() {
            Inbound::Frame(message) => message,
            Inbound::Eof => panic!("unexpected eof"),
        }
    }

    /// Start a connect handshake over a duplex pair and answer the host side
    /// of it, acking one Publish replay per pre-registered object. Returns
    /// the host end of the wire.
    async fn connected_pair(plugin: &Plugin) -> DuplexStream {
        let expected_publishes = plugin.inner.endpoint.object_paths().len();
        let (theirs, ours) = tokio::io::duplex(64 * 1024);
        let (reader, writer) = split_stream(ours);

        let p = plugin.clone();
        let handshake = tokio::spawn(async move { p.connect_io(reader, writer).await });

        let mut host = theirs;
        let connect = read_frame(&mut host).await;
        assert_eq!(connect.kind, MessageType::ConnectClient);
        assert_eq!(&connect.body[..], plugin.id().as_bytes());
        host.write_all(&archive(MessageType::ResultOk, connect.session, &[]))
            .await
            .unwrap();

        for _ in 0..expected_publishes {
            let message = read_frame(&mut host).await;
            assert_eq!(message.kind, MessageType::Publish);
            host.write_all(&archive(MessageType::ResultOk, message.session, &[]))
                .await
                .unwrap();
        }
        handshake.await.unwrap().unwrap();
        host
    }

    #[tokio::test]
    async fn connect_identifies_and_replays_publishes() {
        let plugin = test_plugin();
        plugin.publish("/image/reader", image_reader()).unwrap();
        let _host = connected_pair(&plugin).await;
        assert!(plugin.inner.connected.load(Ordering::Acquire));
    }

    #[tokio::test]
    async fn refused_connect_closes_the_socket() {
        let plugin = test_plugin();
        let (mut host, ours) = tokio::io::duplex(64 * 1024);
        let (reader, writer) = split_stream(ours);

        let p = plugin.clone();
        let handshake = tokio::spawn(async move { p.connect_io(reader, writer).await });

        let connect = read_frame(&mut host).await;
        host.write_all(&archive(MessageType::ResultNg, connect.session, &[]))
            .await
            .unwrap();

        assert!(matches!(
            handshake.await.unwrap(),
            Err(Error::HandshakeFailed(_))
        ));
        assert!(plugin.inner.socket.lock().is_none());
        assert!(matches!(
            plugin.call("/x", "M", vec![]).await,
            Err(Error::SocketClosed)
        ));
    }

    #[tokio::test]
    async fn call_before_connect_fails() {
        let plugin = test_plugin();
        assert!(matches!(
            plugin.call("/image/reader", "TestMethod", vec![]).await,
            Err(Error::SocketClosed)
        ));
    }

    #[tokio::test]
    async fn publish_after_connect_is_refused() {
        let plugin = test_plugin();
        let _host = connected_pair(&plugin).await;
        assert!(matches!(
            plugin.publish("/late", image_reader()),
            Err(Error::AlreadyConnected)
        ));
    }

    #[tokio::test]
    async fn local_object_is_called_in_place() {
        let plugin = test_plugin();
        plugin.publish("/image/reader", image_reader()).unwrap();
        let mut host = connected_pair(&plugin).await;

        let result = plugin
            .call("/image/reader", "TestMethod", vec![Value::from("test value")])
            .await
            .unwrap();
        assert_eq!(result, vec![Value::from("ok")]);

        // In-place invocation puts nothing on the wire.
        let mut probe = [0u8; 1];
        let silent = tokio::time::timeout(Duration::from_millis(50), host.read(&mut probe));
        assert!(silent.await.is_err());
    }

    #[tokio::test]
    async fn remote_call_round_trip() {
        let plugin = test_plugin();
        let mut host = connected_pair(&plugin).await;

        let p = plugin.clone();
        let call = tokio::spawn(async move {
            p.call("/image/reader", "Open", vec![Value::from("image.png")])
                .await
        });

        let request = read_frame(&mut host).await;
        assert_eq!(request.kind, MessageType::CallMethod);
        let decoded = parse_method_call(&request.body).unwrap();
        assert_eq!(decoded.path, "/image/reader");
        assert_eq!(decoded.method, "Open");

        let reply = archive_method_call(
            MessageType::ReturnMethod,
            request.session,
            "",
            "",
            &[Value::from("ok")],
        )
        .unwrap();
        host.write_all(&reply).await.unwrap();

        assert_eq!(call.await.unwrap().unwrap(), vec![Value::from("ok")]);
    }

    #[tokio::test]
    async fn inbound_call_from_host_is_served() {
        let plugin = test_plugin();
        let recorded = Arc::new(Mutex::new(Vec::<Value>::new()));
        let mut proxy = Proxy::new();
        let sink = recorded.clone();
        proxy.register("TestMethod", move |mut params| {
            sink.lock().append(&mut params);
            Ok(vec![Value::from("ok")])
        });
        plugin.publish("/image/reader", proxy).unwrap();
        let mut host = connected_pair(&plugin).await;

        let frame = archive_method_call(
            MessageType::CallMethod,
            45,
            "/image/reader",
            "TestMethod",
            &[Value::from("image.png")],
        )
        .unwrap();
        host.write_all(&frame).await.unwrap();

        let reply = read_frame(&mut host).await;
        assert_eq!(reply.kind, MessageType::ReturnMethod);
        assert_eq!(reply.session, 45);
        assert_eq!(
            parse_method_call(&reply.body).unwrap().params,
            vec![Value::from("ok")]
        );
        assert_eq!(recorded.lock().as_slice(), &[Value::from("image.png")]);
    }

    #[tokio::test]
    async fn close_round_trip() {
        let plugin = test_plugin();
        let mut host = connected_pair(&plugin).await;

        let p = plugin.clone();
        let closing = tokio::spawn(async move { p.close().await });

        let close = read_frame(&mut host).await;
        assert_eq!(close.kind, MessageType::CloseClient);
        host.write_all(&archive(MessageType::ResultOk, close.session, &[]))
            .await
            .unwrap();

        closing.await.unwrap().unwrap();
        assert!(matches!(plugin.close().await, Err(Error::SocketClosed)));
        assert!(matches!(
            plugin.call("/x", "M", vec![]).await,
            Err(Error::SocketClosed)
        ));
    }

    #[tokio::test]
    async fn host_initiated_close_is_acked_and_detaches() {
        let plugin = test_plugin();
        let mut host = connected_pair(&plugin).await;

        host.write_all(&archive(MessageType::CloseClient, 9, &[]))
            .await
            .unwrap();
        let ack = read_frame(&mut host).await;
        assert_eq!(ack.kind, MessageType::ResultOk);
        assert_eq!(ack.session, 9);

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(matches!(
            plugin.call("/x", "M", vec![]).await,
            Err(Error::SocketClosed)
        ));
    }

    #[tokio::test]
    async fn unsolicited_frames_are_refused() {
        let plugin = test_plugin();
        let mut host = connected_pair(&plugin).await;

        host.write_all(&archive(MessageType::ConnectClient, 5, b"nope"))
            .await
            .unwrap();
        let reply = read_frame(&mut host).await;
        assert_eq!(reply.kind, MessageType::ResultNg);
        assert_eq!(reply.session, 5);

        host.write_all(&archive(MessageType::ConfirmPath, 6, b"/p"))
            .await
            .unwrap();
        let reply = read_frame(&mut host).await;
        assert_eq!(reply.kind, MessageType::ResultNg);
    }

    #[tokio::test]
    async fn unpublish_request_from_host_releases_the_object() {
        let plugin = test_plugin();
        plugin.publish("/image/reader", image_reader()).unwrap();
        let mut host = connected_pair(&plugin).await;

        host.write_all(&archive(MessageType::Unpublish, 3, b"/image/reader"))
            .await
            .unwrap();
        let reply = read_frame(&mut host).await;
        assert_eq!(reply.kind, MessageType::ResultOk);

        // The object is no longer served locally, so a call for it now goes
        // to the host instead of being answered in place.
        let p = plugin.clone();
        let call = tokio::spawn(async move { p.call("/image/reader", "TestMethod", vec![]).await });
        let request = read_frame(&mut host).await;
        assert_eq!(request.kind, MessageType::CallMethod);
        host.write_all(&archive(
            MessageType::ResultObjectNotFound,
            request.session,
            &[],
        ))
        .await
        .unwrap();
        assert!(matches!(
            call.await.unwrap(),
            Err(Error::ObjectNotFound(_))
        ));
    }

    #[tokio::test]
    async fn voluntary_unpublish_round_trip() {
        let plugin = test_plugin();
        plugin.publish("/image/reader", image_reader()).unwrap();
        let mut host = connected_pair(&plugin).await;

        let p = plugin.clone();
        let unpublish = tokio::spawn(async move { p.unpublish("/image/reader").await });

        let request = read_frame(&mut host).await;
        assert_eq!(request.kind, MessageType::Unpublish);
        assert_eq!(&request.body[..], b"/image/reader");
        host.write_all(&archive(MessageType::ResultOk, request.session, &[]))
            .await
            .unwrap();
        unpublish.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn unpublish_of_an_unknown_path_fails_without_traffic() {
        let plugin = test_plugin();
        assert!(matches!(
            plugin.unpublish("/image/reader").await,
            Err(Error::DuplicateRegistration(_))
        ));
    }

    #[tokio::test]
    async fn confirm_path_round_trip() {
        let plugin = test_plugin();
        let mut host = connected_pair(&plugin).await;

        let p = plugin.clone();
        let confirm = tokio::spawn(async move { p.confirm_path("/image/reader").await });
        let request = read_frame(&mut host).await;
        assert_eq!(request.kind, MessageType::ConfirmPath);
        host.write_all(&archive(MessageType::ResultOk, request.session, &[]))
            .await
            .unwrap();
        assert!(confirm.await.unwrap());

        let p = plugin.clone();
        let confirm = tokio::spawn(async move { p.confirm_path("/missing").await });
        let request = read_frame(&mut host).await;
        host.write_all(&archive(
            MessageType::ResultObjectNotFound,
            request.session,
            &[],
        ))
        .await
        .unwrap();
        assert!(!confirm.await.unwrap());
    }

    #[tokio::test]
    async fn call_with_timeout_gives_up() {
        let plugin = test_plugin();
        let mut host = connected_pair(&plugin).await;

        let err = plugin
            .call_with_timeout(
                "/image/reader",
                "Slow",
                vec![],
                Duration::from_millis(50),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout));

        // The request did reach the wire; nobody answered it.
        let request = read_frame(&mut host).await;
        assert_eq!(request.kind, MessageType::CallMethod);
    }
}
