//! Chat server event loop
//!
//! A single task drives every connection through readiness polling; there
//! is no per-connection thread or task. Each iteration runs four phases:
//!
//! 1. accept: one bounded accept attempt, plus the presence handshake of
//!    the accepted connection under its own short timeout
//! 2. poll: bounded wait for any member to turn readable, then a
//!    non-blocking sweep for every other readable and writable member
//! 3. read: decode and validate one payload per readable member
//! 4. write: fan chat messages out to the writable members
//!
//! Failures are contained per connection: the offending connection is
//! answered (when possible), closed and deregistered, and the iteration
//! carries on with the rest.

use std::net::SocketAddr;
use std::time::Duration;

use futures_util::stream::FuturesUnordered;
use futures_util::{FutureExt, StreamExt};
use serde::Deserialize;
use serde_json::Value;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::time::{timeout, timeout_at, Instant};
use tracing::{debug, error, info, trace, warn, Instrument, Span};

use crate::codec::Codec;
use crate::config::ServerSettings;
use crate::connection::Connection;
use crate::error::{ConfigError, ConnError, DecodeError, ValidationError};
use crate::message::{Message, MessageKind, Presence, Response, User, WELCOME};
use crate::registry::Registry;
use crate::schema::{SchemaKind, SchemaSet};
use crate::types::ConnId;

/// Alert acknowledging a presence update from an admitted connection
pub const STATUS_UPDATED: &str = "Status updated";

/// Members found ready during the poll phase
#[derive(Debug, Default)]
struct Readiness {
    readable: Vec<ConnId>,
    writable: Vec<ConnId>,
}

/// What one iteration did
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Iteration {
    /// Connection admitted by the accept phase
    pub admitted: Option<ConnId>,
    /// Connection refused by the accept phase
    pub rejected: bool,
    /// Payloads successfully decoded and validated
    pub received: usize,
    /// Chat messages fanned out
    pub broadcast: usize,
    /// Chat message copies written
    pub delivered: usize,
    /// Admitted connections closed this iteration
    pub closed: usize,
}

/// The chat server
///
/// Owns the listener, the registry and the read-only schemas.
pub struct Server {
    listener: TcpListener,
    registry: Registry,
    schemas: SchemaSet,
    codec: Codec,
    accept_timeout: Duration,
    poll_interval: Duration,
    handshake_timeout: Duration,
    /// One byte past the input limit, so oversized reads are detectable
    read_buf: Vec<u8>,
    span: Span,
}

impl Server {
    /// Bind the listening socket described by `settings`
    pub fn bind(settings: &ServerSettings, schemas: SchemaSet) -> Result<Self, ConfigError> {
        let addr = settings.bind_addr;
        let bind_err = move |source| ConfigError::Bind { addr, source };

        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4()
        } else {
            TcpSocket::new_v6()
        }
        .map_err(bind_err)?;
        socket.set_reuseaddr(true).map_err(bind_err)?;
        socket.bind(addr).map_err(bind_err)?;
        let listener = socket.listen(settings.backlog).map_err(bind_err)?;

        Ok(Self::new(listener, settings, schemas))
    }

    /// Serve on an already bound listener
    pub fn new(listener: TcpListener, settings: &ServerSettings, schemas: SchemaSet) -> Self {
        Self {
            listener,
            registry: Registry::new(),
            schemas,
            codec: Codec::new(settings.encoding, settings.input_limit),
            accept_timeout: settings.accept_timeout,
            poll_interval: settings.poll_interval,
            handshake_timeout: settings.handshake_timeout,
            read_buf: vec![0; settings.input_limit + 1],
            span: Span::none(),
        }
    }

    /// Run the loop inside `span`
    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Run the event loop until the process ends
    pub async fn run(mut self) {
        let span = self.span.clone();
        async move {
            info!("Server ready");
            loop {
                let iteration = self.run_once().await;
                if iteration != Iteration::default() {
                    debug!(?iteration, members = self.registry.len(), "Iteration done");
                }
            }
        }
        .instrument(span)
        .await
    }

    /// Run a single accept/poll/read/write iteration
    pub async fn run_once(&mut self) -> Iteration {
        let mut iteration = Iteration::default();

        self.accept_phase(&mut iteration).await;
        let ready = self.poll_phase().await;
        let outbox = self.read_phase(&ready.readable, &mut iteration);
        if !outbox.is_empty() {
            self.write_phase(&outbox, &ready.writable, &mut iteration);
        }

        iteration
    }

    async fn accept_phase(&mut self, iteration: &mut Iteration) {
        // With nobody to serve, the accept attempt doubles as the idle wait
        let wait = if self.registry.is_empty() {
            self.poll_interval
        } else {
            self.accept_timeout
        };

        let (mut stream, peer) = match timeout(wait, self.listener.accept()).await {
            Err(_) => return,
            Ok(Err(e)) => {
                warn!("Failed to accept connection: {}", e);
                return;
            }
            Ok(Ok(accepted)) => accepted,
        };
        info!("Connection request from {}", peer);

        match self.handshake(&mut stream).await {
            Ok(user) => {
                let conn = Connection::new(ConnId::new(), stream, peer, user);
                let id = conn.id;
                info!(
                    "Client {} ({}) registered from {}",
                    id,
                    conn.display_name(),
                    peer
                );
                self.registry.add(conn);
                iteration.admitted = Some(id);
            }
            Err(err) => {
                iteration.rejected = true;
                if err.is_disconnect() {
                    info!("{} left during handshake", peer);
                } else {
                    warn!("Handshake with {} failed: {}", peer, err);
                    if let Some(response) = err.response() {
                        self.send_best_effort(&stream, &response);
                    }
                }
                // stream dropped here, closing the socket
            }
        }
    }

    /// Read one presence and acknowledge it, all within the handshake window
    async fn handshake(&mut self, stream: &mut TcpStream) -> Result<User, ConnError> {
        let deadline = Instant::now() + self.handshake_timeout;

        let n = timeout_at(deadline, stream.read(&mut self.read_buf))
            .await
            .map_err(|_| ConnError::HandshakeTimeout)??;
        if n == 0 {
            return Err(ConnError::Disconnected);
        }
        trace!(payload = %String::from_utf8_lossy(&self.read_buf[..n]), "Handshake payload");

        let value = self.codec.decode_value(&self.read_buf[..n])?;
        self.schemas.validate(SchemaKind::Presence, &value)?;
        let message: Message = serde_json::from_value(value).map_err(DecodeError::from)?;
        let user = match message {
            Message::Presence(presence) => presence.user,
            other => {
                return Err(ValidationError::new(
                    "/action",
                    format!("expected \"presence\", got \"{}\"", other.kind().action()),
                )
                .into())
            }
        };

        let ack = self.encode(&Response::ok(Some(WELCOME)))?;
        timeout_at(deadline, stream.write_all(&ack))
            .await
            .map_err(|_| ConnError::HandshakeTimeout)??;

        Ok(user)
    }

    async fn poll_phase(&self) -> Readiness {
        let mut ready = Readiness::default();
        let members = self.registry.snapshot();
        if members.is_empty() {
            return ready;
        }

        let mut pending: FuturesUnordered<_> = members
            .iter()
            .filter_map(|id| self.registry.get(id))
            .map(|conn| async move { (conn.id, conn.readable().await) })
            .collect();

        // The only steady-state suspension point
        let first = timeout(self.poll_interval, pending.next()).await;
        if let Ok(Some(first)) = first {
            ready.push_readable(first);
            while let Some(Some(next)) = pending.next().now_or_never() {
                ready.push_readable(next);
            }
        }
        drop(pending);

        ready.writable = members
            .into_iter()
            .filter(|id| self.registry.get(id).is_some_and(Connection::is_write_ready))
            .collect();

        ready
    }

    /// Handle every readable member, returning encoded chat messages to fan out
    fn read_phase(&mut self, readable: &[ConnId], iteration: &mut Iteration) -> Vec<Vec<u8>> {
        let mut outbox = Vec::new();

        for id in readable {
            let (message, raw) = match self.receive(id) {
                Ok(Some(received)) => received,
                Ok(None) => continue,
                Err(err) => {
                    self.close(id, &err, iteration);
                    continue;
                }
            };
            iteration.received += 1;

            if let Err(err) = self.dispatch(id, message, &raw, &mut outbox) {
                self.close(id, &err, iteration);
            }
        }

        outbox
    }

    /// Read, decode and validate one payload from a readable member
    ///
    /// Yields the typed message together with the object it was read from.
    fn receive(&mut self, id: &ConnId) -> Result<Option<(Message, Value)>, ConnError> {
        let Some(conn) = self.registry.get(id) else {
            return Ok(None);
        };
        let Some(n) = conn.try_recv(&mut self.read_buf)? else {
            return Ok(None);
        };
        trace!(
            "Payload from {}: {}",
            id,
            String::from_utf8_lossy(&self.read_buf[..n])
        );

        let value = self.codec.decode_value(&self.read_buf[..n])?;
        let message = self.admit(&value)?;
        Ok(Some((message, value)))
    }

    /// Validate a decoded object against the schema for its action
    fn admit(&self, value: &Value) -> Result<Message, ConnError> {
        let kind = match value.get("action") {
            Some(Value::String(action)) => MessageKind::from_action(action).ok_or_else(|| {
                ValidationError::new("/action", format!("unknown action \"{}\"", action))
            })?,
            Some(_) => {
                return Err(ValidationError::new("/action", "is not of type \"string\"").into())
            }
            None => return Err(ValidationError::new("/action", "is a required property").into()),
        };

        if let Some(schema) = kind.schema_kind() {
            self.schemas.validate(schema, value)?;
        }

        Message::deserialize(value).map_err(|e| DecodeError::from(e).into())
    }

    /// Act on one validated message from an admitted connection
    fn dispatch(
        &mut self,
        id: &ConnId,
        message: Message,
        raw: &Value,
        outbox: &mut Vec<Vec<u8>>,
    ) -> Result<(), ConnError> {
        match message {
            Message::Chat(chat) => {
                debug!("Chat from {} to {} via {}", chat.from, chat.to, id);
                // `to` is informational; every member receives every message.
                // Relay the object as received, unknown fields and all.
                outbox.push(self.encode(raw)?);
            }
            Message::Probe { .. } => {
                let Some(conn) = self.registry.get(id) else {
                    return Ok(());
                };
                let presence = Message::Presence(Presence::status(conn.user.clone()));
                let payload = self.encode(&presence)?;
                if !conn.try_send(&payload)? {
                    debug!("Probe reply to {} dropped: not writable", id);
                }
            }
            Message::Presence(presence) => {
                let payload = self.encode(&Response::ok(Some(STATUS_UPDATED)))?;
                let Some(conn) = self.registry.get_mut(id) else {
                    return Ok(());
                };
                info!(
                    "Client {} updated presence: {} -> {}",
                    id, conn.user.account_name, presence.user.account_name
                );
                conn.user = presence.user;
                if !conn.try_send(&payload)? {
                    debug!("Presence ack to {} dropped: not writable", id);
                }
            }
            Message::Quit { .. } => {
                if let Some(conn) = self.registry.remove(id) {
                    info!("Client {} ({}) quit", id, conn.display_name());
                }
            }
        }
        Ok(())
    }

    /// Fan every payload out to the writable members still registered
    fn write_phase(&mut self, outbox: &[Vec<u8>], writable: &[ConnId], iteration: &mut Iteration) {
        for payload in outbox {
            iteration.broadcast += 1;
            for id in writable {
                // May have left earlier in this iteration
                let Some(conn) = self.registry.get(id) else {
                    continue;
                };
                match conn.try_send(payload) {
                    Ok(true) => iteration.delivered += 1,
                    Ok(false) => debug!("Client {} not writable, message dropped", id),
                    Err(err) => self.close(id, &err, iteration),
                }
            }
        }
    }

    /// Deregister and close a member, answering it first if the error calls for it
    fn close(&mut self, id: &ConnId, err: &ConnError, iteration: &mut Iteration) {
        let Some(conn) = self.registry.remove(id) else {
            return;
        };
        iteration.closed += 1;

        match err {
            ConnError::Disconnected => {
                info!("Client {} ({}) disconnected", id, conn.display_name());
                return;
            }
            ConnError::Io(e) => error!("Client {} ({}) I/O failure: {}", id, conn.peer, e),
            other => warn!("Client {} ({}) dropped: {}", id, conn.peer, other),
        }

        if matches!(err, ConnError::Decode(DecodeError::Oversized { .. })) {
            // Unread input makes close send a reset, which can beat the reply
            let mut tail = vec![0; self.codec.input_limit()];
            if let Ok(Some(n)) = conn.try_recv(&mut tail) {
                trace!("Discarded {} unread bytes from {}", n, id);
            }
        }

        if let Some(response) = err.response() {
            match self.encode(&response) {
                Ok(payload) => {
                    if let Err(e) = conn.try_send(&payload) {
                        debug!("Could not notify {}: {}", id, e);
                    }
                }
                Err(e) => error!("Failed to encode response: {}", e),
            }
        }
        // conn dropped here, closing the socket
    }

    fn send_best_effort(&self, stream: &TcpStream, response: &Response) {
        match self.encode(response) {
            Ok(payload) => {
                if let Err(e) = stream.try_write(&payload) {
                    debug!("Could not send response: {}", e);
                }
            }
            Err(e) => error!("Failed to encode response: {}", e),
        }
    }

    fn encode<T: serde::Serialize>(&self, item: &T) -> Result<Vec<u8>, ConnError> {
        self.codec
            .encode(item)
            .map_err(|e| ConnError::Io(std::io::Error::other(e)))
    }
}

impl Readiness {
    fn push_readable(&mut self, (id, result): (ConnId, std::io::Result<()>)) {
        if let Err(e) = result {
            // The read that follows surfaces the failure
            debug!("Readiness error on {}: {}", id, e);
        }
        self.readable.push(id);
    }
}
