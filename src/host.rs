// src/host.rs

//! Host role: accepts plugin connections, holds the authoritative path
//! registry, and tracks connected plugin identities.
//!
//! The registry keeps two mappings per path: objects the host itself serves
//! and paths reserved by a connected plugin. Locals take precedence when
//! both could answer. A duplicate `ConnectClient` evicts the prior holder of
//! the plugin id; a duplicate `Publish` preempts the prior reservation by
//! telling its owner to unpublish.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use rmpv::Value;
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};

use crate::endpoint::{COLLISION_ACK_DEADLINE, Endpoint};
use crate::error::{Error, Result};
use crate::message::{Inbound, Message, MessageType, archive, parse};
use crate::proxy::Proxy;
use crate::session::SessionStrategy;
use crate::transport::{Connection, Listener, Reader};

/// The process that listens for local connections.
///
/// Cloning hands out another handle to the same host; all clones share the
/// listener, the registry, and the session manager.
#[derive(Clone)]
pub struct Host {
    inner: Arc<HostInner>,
}

struct HostInner {
    pipe_name: String,
    endpoint: Arc<Endpoint>,
    registry: RwLock<Registry>,
    accept_task: Mutex<Option<AbortHandle>>,
}

#[derive(Default)]
struct Registry {
    /// path -> socket of the plugin that reserved it
    reservations: HashMap<String, Connection>,
    /// plugin id -> socket
    sockets: HashMap<String, Connection>,
}

impl Registry {
    /// Drop every entry owned by `conn`. Returns the plugin id it held, if
    /// any.
    fn remove_connection(&mut self, conn: &Connection) -> Option<String> {
        self.reservations.retain(|_path, owner| !owner.same(conn));
        let id = self
            .sockets
            .iter()
            .find(|(_id, socket)| socket.same(conn))
            .map(|(id, _socket)| id.clone());
        if let Some(id) = &id {
            self.sockets.remove(id);
        }
        id
    }

    /// Drop the roster entry and reservations for `plugin_id`. Returns the
    /// evicted socket, if any.
    fn remove_plugin(&mut self, plugin_id: &str) -> Option<Connection> {
        let socket = self.sockets.remove(plugin_id)?;
        self.reservations.retain(|_path, owner| !owner.same(&socket));
        Some(socket)
    }
}

impl Host {
    pub fn new(pipe_name: impl Into<String>) -> Self {
        Host::with_strategy(pipe_name, SessionStrategy::Recycle)
    }

    pub(crate) fn with_strategy(pipe_name: impl Into<String>, strategy: SessionStrategy) -> Self {
        Host {
            inner: Arc::new(HostInner {
                pipe_name: pipe_name.into(),
                endpoint: Arc::new(Endpoint::new(strategy)),
                registry: RwLock::new(Registry::default()),
                accept_task: Mutex::new(None),
            }),
        }
    }

    /// Bind the local socket and serve connections in the background.
    ///
    /// A host that was already listening is shut down and restarted.
    pub async fn listen(&self) -> Result<()> {
        let _ = self.close().await;
        let listener = Listener::bind(&self.inner.pipe_name)?;
        let inner = self.inner.clone();
        let task = tokio::spawn(async move { inner.accept_loop(listener).await });
        *self.inner.accept_task.lock() = Some(task.abort_handle());
        Ok(())
    }

    /// Bind the local socket and serve connections until the listener fails
    /// or the host is closed from another task.
    pub async fn listen_and_serve(&self) -> Result<()> {
        let _ = self.close().await;
        let listener = Listener::bind(&self.inner.pipe_name)?;
        let inner = self.inner.clone();
        let task = tokio::spawn(async move { inner.accept_loop(listener).await });
        *self.inner.accept_task.lock() = Some(task.abort_handle());
        let _ = task.await;
        Ok(())
    }

    /// Stop listening, disconnect every plugin, and clear the registry.
    /// Locally published objects survive a close.
    pub async fn close(&self) -> Result<()> {
        let task = self.inner.accept_task.lock().take();
        let Some(task) = task else {
            return Err(Error::SocketClosed);
        };
        task.abort();

        let sockets: Vec<Connection> = {
            let mut registry = self.inner.registry.write();
            let sockets = registry.sockets.values().cloned().collect();
            registry.sockets.clear();
            registry.reservations.clear();
            sockets
        };
        for socket in sockets {
            socket.close().await;
        }
        self.inner.endpoint.sessions.fail_all();
        Ok(())
    }

    /// Serve an object at `path`. Local objects take precedence over plugin
    /// reservations at the same path.
    pub fn publish(&self, path: impl Into<String>, proxy: Proxy) -> Result<()> {
        if proxy.is_empty() {
            return Err(Error::NilTarget);
        }
        self.inner.endpoint.insert_object(path.into(), proxy);
        Ok(())
    }

    /// Withdraw a locally served object.
    pub fn unpublish(&self, path: &str) -> Result<()> {
        if self.inner.endpoint.remove_object(path) {
            Ok(())
        } else {
            Err(Error::DuplicateRegistration(format!(
                "unpublish error: no object is registered at '{}'",
                path
            )))
        }
    }

    /// Disconnect a plugin by id: drop its reservations and roster entry,
    /// then tell it to close.
    pub async fn unregister(&self, plugin_id: &str) -> Result<()> {
        let socket = self.inner.registry.write().remove_plugin(plugin_id);
        let Some(socket) = socket else {
            return Err(Error::NotRegistered(plugin_id.to_owned()));
        };
        self.inner.close_plugin(&socket, plugin_id).await
    }

    /// Invoke `method` on the object at `path` with the given params.
    ///
    /// A locally owned path is invoked in place and emits no frames.
    /// Otherwise the reservation decides which plugin is asked.
    pub async fn call(&self, path: &str, method: &str, params: Vec<Value>) -> Result<Vec<Value>> {
        self.call_impl(path, method, params, None).await
    }

    /// Like [`Host::call`], but gives up with [`Error::Timeout`] when no
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
        if let Some(proxy) = self.inner.endpoint.local_object(path) {
            return proxy.call(method, params);
        }
        let socket = self.inner.registry.read().reservations.get(path).cloned();
        match socket {
            Some(socket) => {
                self.inner
                    .endpoint
                    .call_remote(&socket, path, method, params, deadline)
                    .await
            }
            None => Err(Error::PathNotFound(path.to_owned())),
        }
    }

    /// Whether anything answers at `path`, local or reserved.
    pub fn confirm_path(&self, path: &str) -> bool {
        self.inner.endpoint.owns(path)
            || self.inner.registry.read().reservations.contains_key(path)
    }

    /// Socket of a connected plugin, by id.
    pub fn socket(&self, plugin_id: &str) -> Option<Connection> {
        self.inner.registry.read().sockets.get(plugin_id).cloned()
    }

    /// Reverse lookup: the id a socket registered under.
    pub fn plugin_id(&self, socket: &Connection) -> Option<String> {
        self.inner
            .registry
            .read()
            .sockets
            .iter()
            .find(|(_id, candidate)| candidate.same(socket))
            .map(|(id, _candidate)| id.clone())
    }

    /// Wire an already-established stream into the host, as if it had been
    /// accepted from the listener.
    #[cfg(test)]
    pub(crate) fn attach_stream(
        &self,
        reader: Reader,
        writer: crate::transport::Writer,
    ) -> Connection {
        self.inner.clone().attach(reader, writer)
    }
}

impl HostInner {
    async fn accept_loop(self: Arc<Self>, mut listener: Listener) {
        loop {
            match listener.accept().await {
                Ok((reader, writer)) => {
                    self.clone().attach(reader, writer);
                }
                Err(err) => {
                    warn!("accept failed: {}", err);
                    break;
                }
            }
        }
    }

    fn attach(self: Arc<Self>, reader: Reader, writer: crate::transport::Writer) -> Connection {
        let conn = Connection::new(writer);
        let inner = self.clone();
        let loop_conn = conn.clone();
        let task = tokio::spawn(async move { inner.serve_connection(loop_conn, reader).await });
        conn.attach_read_task(task.abort_handle());
        conn
    }

    async fn serve_connection(self: Arc<Self>, conn: Connection, mut reader: Reader) {
        loop {
            match parse(&mut reader).await {
                Ok(Inbound::Frame(message)) => self.receive(&conn, message).await,
                Ok(Inbound::Eof) => {
                    debug!("plugin connection closed");
                    break;
                }
                Err(err) => {
                    warn!("dropping plugin connection: {}", err);
                    break;
                }
            }
        }
        // Reservations and roster entries must not outlive the connection,
        // orderly shutdown or not.
        let evicted = self.registry.write().remove_connection(&conn);
        if let Some(id) = evicted {
            info!(plugin = %id, "pruned state for a vanished plugin");
        }
        conn.close_writer().await;
    }

    async fn receive(self: &Arc<Self>, conn: &Connection, message: Message) {
        match message.kind {
            kind if kind.is_result() => self.endpoint.deliver(message),
            MessageType::CallMethod => self.endpoint.spawn_call(conn.clone(), message),
            MessageType::ConnectClient => self.handle_connect(conn, message).await,
            MessageType::Publish => self.handle_publish(conn, message).await,
            MessageType::Unpublish => self.handle_release(conn, message).await,
            MessageType::CloseClient => self.handle_close_client(conn, message).await,
            MessageType::ConfirmPath => self.handle_confirm_path(conn, message).await,
            other => debug!("ignoring {} from a plugin", other),
        }
    }

    /// Plugin identifies itself. A duplicate id evicts the prior holder
    /// before the new registration is installed.
    async fn handle_connect(&self, conn: &Connection, message: Message) {
        let Ok(plugin_id) = std::str::from_utf8(&message.body).map(str::to_owned) else {
            self.reply(conn, MessageType::ResultNg, message.session).await;
            return;
        };

        let prior = self.registry.write().remove_plugin(&plugin_id);
        if let Some(prior) = prior {
            info!(plugin = %plugin_id, "evicting previous registration");
            let _ = self.close_plugin(&prior, &plugin_id).await;
        }

        self.registry
            .write()
            .sockets
            .insert(plugin_id.clone(), conn.clone());
        debug!(plugin = %plugin_id, "plugin connected");
        self.reply(conn, MessageType::ResultOk, message.session).await;
    }

    /// Plugin claims a path. A reservation held by a different plugin is
    /// preempted: its owner is told to unpublish before the new reservation
    /// is installed.
    async fn handle_publish(&self, conn: &Connection, message: Message) {
        let Ok(path) = std::str::from_utf8(&message.body).map(str::to_owned) else {
            self.reply(conn, MessageType::ResultNg, message.session).await;
            return;
        };

        let existing = self.registry.read().reservations.get(&path).cloned();
        if let Some(existing) = existing {
            if !existing.same(conn) {
                debug!(path = %path, "preempting previous reservation");
                // The prior owner may already be gone; the reservation is
                // replaced either way.
                let _ = self
                    .endpoint
                    .request(
                        &existing,
                        MessageType::Unpublish,
                        path.as_bytes(),
                        Some(COLLISION_ACK_DEADLINE),
                    )
                    .await;
            }
        }

        self.registry
            .write()
            .reservations
            .insert(path, conn.clone());
        self.reply(conn, MessageType::ResultOk, message.session).await;
    }

    /// Plugin voluntarily releases a path it reserved.
    async fn handle_release(&self, conn: &Connection, message: Message) {
        let Ok(path) = std::str::from_utf8(&message.body) else {
            self.reply(conn, MessageType::ResultNg, message.session).await;
            return;
        };

        let released = {
            let mut registry = self.registry.write();
            match registry.reservations.get(path) {
                Some(owner) if owner.same(conn) => {
                    registry.reservations.remove(path);
                    true
                }
                _ => false,
            }
        };
        let kind = if released {
            MessageType::ResultOk
        } else {
            MessageType::ResultNg
        };
        self.reply(conn, kind, message.session).await;
    }

    /// Orderly plugin-initiated disconnect. The read loop observes EOF right
    /// after and finishes the teardown.
    async fn handle_close_client(&self, conn: &Connection, message: Message) {
        let known = {
            let mut registry = self.registry.write();
            registry.remove_connection(conn)
        };
        match known {
            Some(id) => {
                debug!(plugin = %id, "plugin disconnected");
                self.reply(conn, MessageType::ResultOk, message.session).await;
            }
            None => {
                self.reply(conn, MessageType::ResultNg, message.session).await;
            }
        }
    }

    /// Path query from a plugin; answers for locally served objects.
    async fn handle_confirm_path(&self, conn: &Connection, message: Message) {
        let kind = match std::str::from_utf8(&message.body) {
            Ok(path) if self.endpoint.owns(path) => MessageType::ResultOk,
            Ok(_) => MessageType::ResultObjectNotFound,
            Err(_) => MessageType::ResultNg,
        };
        self.reply(conn, kind, message.session).await;
    }

    /// Tell a plugin to close, wait briefly for the ack, then drop the
    /// socket. Used by eviction and by `unregister`.
    async fn close_plugin(&self, socket: &Connection, plugin_id: &str) -> Result<()> {
        let reply = self
            .endpoint
            .request(
                socket,
                MessageType::CloseClient,
                &[],
                Some(COLLISION_ACK_DEADLINE),
            )
            .await;
        socket.close().await;
        match reply {
            Ok(message) if message.kind == MessageType::ResultOk => Ok(()),
            Ok(_) | Err(Error::Timeout) => Err(Error::HandshakeFailed(format!(
                "unregister error: '{}'",
                plugin_id
            ))),
            Err(err) => Err(err),
        }
    }

    async fn reply(&self, conn: &Connection, kind: MessageType, session: u32) {
        if let Err(err) = conn.send(&archive(kind, session, &[])).await {
            debug!("reply write failed, peer is gone: {}", err);
        }
    }
}
