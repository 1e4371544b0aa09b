// src/endpoint.rs

//! Protocol engine shared by the host and plugin roles.
//!
//! Both roles run the same machinery for the overlapping half of the
//! protocol: result-family frames are routed into the session manager,
//! inbound `CallMethod` frames are dispatched against the local object map
//! on a fresh task, and outbound round-trips (handshakes and remote calls)
//! park their caller on a session rendezvous. Role-specific frames are
//! matched by the host and plugin modules, which hold an `Endpoint` each.

use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use rmpv::Value;
use tracing::{debug, error, warn};

use crate::error::{Error, Result};
use crate::message::{Message, MessageType, archive, archive_method_call, parse_method_call};
use crate::proxy::Proxy;
use crate::session::{SessionManager, SessionStrategy};
use crate::transport::Connection;

/// Deadline for host-initiated collision round-trips (CloseClient and
/// Unpublish acks). A dead peer must not wedge the read loop that is
/// resolving the collision.
pub(crate) const COLLISION_ACK_DEADLINE: Duration = Duration::from_secs(5);

pub(crate) struct Endpoint {
    pub(crate) sessions: SessionManager,
    objects: RwLock<HashMap<String, Arc<Proxy>>>,
}

impl Endpoint {
    pub(crate) fn new(strategy: SessionStrategy) -> Self {
        Endpoint {
            sessions: SessionManager::new(strategy),
            objects: RwLock::new(HashMap::new()),
        }
    }

    // ---- local object map ------------------------------------------------

    pub(crate) fn insert_object(&self, path: String, proxy: Proxy) {
        self.objects.write().insert(path, Arc::new(proxy));
    }

    pub(crate) fn remove_object(&self, path: &str) -> bool {
        self.objects.write().remove(path).is_some()
    }

    pub(crate) fn local_object(&self, path: &str) -> Option<Arc<Proxy>> {
        self.objects.read().get(path).cloned()
    }

    pub(crate) fn owns(&self, path: &str) -> bool {
        self.objects.read().contains_key(path)
    }

    pub(crate) fn object_paths(&self) -> Vec<String> {
        self.objects.read().keys().cloned().collect()
    }

    // ---- outbound round-trips --------------------------------------------

    /// One request/response round-trip: allocate a session, write the frame,
    /// park until the peer answers.
    pub(crate) async fn request(
        &self,
        conn: &Connection,
        kind: MessageType,
        body: &[u8],
        deadline: Option<Duration>,
    ) -> Result<Message> {
        let session = self.sessions.allocate();
        if let Err(err) = conn.send(&archive(kind, session, body)).await {
            self.sessions.discard(session);
            return Err(err);
        }
        self.sessions.receive_and_close(session, deadline).await
    }

    /// Invoke `method` on the peer that owns `path`.
    pub(crate) async fn call_remote(
        &self,
        conn: &Connection,
        path: &str,
        method: &str,
        params: Vec<Value>,
        deadline: Option<Duration>,
    ) -> Result<Vec<Value>> {
        let session = self.sessions.allocate();
        let frame = match archive_method_call(MessageType::CallMethod, session, path, method, &params)
        {
            Ok(frame) => frame,
            Err(err) => {
                self.sessions.discard(session);
                return Err(err);
            }
        };
        if let Err(err) = conn.send(&frame).await {
            self.sessions.discard(session);
            return Err(err);
        }

        let reply = self.sessions.receive_and_close(session, deadline).await?;
        match reply.kind {
            MessageType::ReturnMethod => Ok(parse_method_call(&reply.body)?.params),
            MessageType::ResultObjectNotFound => Err(Error::ObjectNotFound(path.to_owned())),
            MessageType::ResultMethodNotFound => Err(Error::MethodNotFound {
                name: method.to_owned(),
                private: false,
            }),
            MessageType::ResultMethodError => Err(Error::MethodError(format!(
                "remote method '{}' raised at '{}'",
                method, path
            ))),
            MessageType::ResultNg => {
                Err(Error::encoding("peer could not encode the call result"))
            }
            other => Err(Error::encoding(format!(
                "unexpected reply {} to a method call",
                other
            ))),
        }
    }

    // ---- inbound dispatch ------------------------------------------------

    /// Route a result-family frame to its parked caller.
    pub(crate) fn deliver(&self, message: Message) {
        self.sessions.deliver(message.session, message);
    }

    /// Handle an inbound `CallMethod` on a fresh task so the read loop never
    /// blocks on user code.
    pub(crate) fn spawn_call(self: &Arc<Self>, conn: Connection, message: Message) {
        let endpoint = self.clone();
        tokio::spawn(async move {
            endpoint.dispatch_call(conn, message).await;
        });
    }

    async fn dispatch_call(&self, conn: Connection, message: Message) {
        let session = message.session;
        let call = match parse_method_call(&message.body) {
            Ok(call) => call,
            Err(err) => {
                warn!(session, "undecodable method call: {}", err);
                Self::respond(&conn, archive(MessageType::ResultNg, session, &[])).await;
                return;
            }
        };

        let Some(proxy) = self.local_object(&call.path) else {
            Self::respond(
                &conn,
                archive(MessageType::ResultObjectNotFound, session, &[]),
            )
            .await;
            return;
        };

        // User code runs here; a panic must answer the caller instead of
        // tearing the connection down.
        let outcome = catch_unwind(AssertUnwindSafe(|| {
            proxy.call(&call.method, call.params)
        }));

        let frame = match outcome {
            Ok(Ok(results)) => {
                match archive_method_call(MessageType::ReturnMethod, session, "", "", &results) {
                    Ok(frame) => frame,
                    Err(err) => {
                        warn!(session, path = %call.path, method = %call.method,
                              "result failed to encode: {}", err);
                        archive(MessageType::ResultNg, session, &[])
                    }
                }
            }
            Ok(Err(Error::MethodNotFound { .. })) => {
                archive(MessageType::ResultMethodNotFound, session, &[])
            }
            Ok(Err(err)) => {
                debug!(session, path = %call.path, method = %call.method,
                       "method call failed: {}", err);
                archive(MessageType::ResultMethodError, session, &[])
            }
            Err(_panic) => {
                error!(session, path = %call.path, method = %call.method,
                       "method panicked during remote call");
                archive(MessageType::ResultMethodError, session, &[])
            }
        };
        Self::respond(&conn, frame).await;
    }

    /// Response writes are best-effort: a peer that vanished mid-call shows
    /// up as EOF on the read loop momentarily anyway.
    async fn respond(conn: &Connection, frame: bytes::Bytes) {
        if let Err(err) = conn.send(&frame).await {
            debug!("response write failed, peer is gone: {}", err);
        }
    }
}
