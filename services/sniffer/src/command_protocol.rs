//! Administrative command handling.
//!
//! Every accepted admin connection gets an entry in the
//! [`ConnectionRegistry`], which owns the write side of the socket and the
//! per-connection [`ConnectionState`]. Lines read from the socket are fed
//! to [`ConnectionRegistry::handle_line`] on the reactor thread.
//!
//! State machine per connection:
//!
//! ```text
//! Unverified --activate(license)--> Verified
//! Normal --stop_service(license or Verified)--> ShuttingDown
//! ```
//!
//! Both transitions are one-way. A second `stop_service` while a shutdown
//! is pending anywhere in the process is answered with a failure.

use crate::envelope::{Envelope, EnvelopeCodec, ProtocolError, SequenceKind, STOP_IN_PROGRESS};
use crate::request_id::RequestIdGenerator;
use async_trait::async_trait;
use futures::SinkExt;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::task::AbortHandle;
use tokio::time;
use tokio_util::codec::FramedWrite;
use tracing::{debug, info, warn};

pub const CMD_ACTIVATE: &str = "activate";
pub const CMD_STOP_SERVICE: &str = "stop_service";
pub const CMD_PING: &str = "ping";

/// Longest a single response or ping may take to reach the socket.
pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(5);

/// Request failures. None of these close the connection.
#[derive(Debug, Error)]
pub enum CommandError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("Command {0} requires a JSON argument")]
    MissingArgument(&'static str),

    #[error("Invalid JSON payload: {0}")]
    InvalidPayload(#[from] serde_json::Error),

    #[error("License key mismatch")]
    LicenseMismatch,

    #[error("No license key configured")]
    LicenseNotConfigured,

    #[error("Unknown connection {0}")]
    UnknownConnection(ConnectionId),
}

/// Failure writing to an admin peer.
#[derive(Debug, Error)]
#[error("Failed to write to admin connection: {0}")]
pub struct WriteError(pub String);

/// JSON argument of `activate` and `stop_service`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LicensePayload {
    pub license_key: String,
}

/// Identifier of an accepted admin connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "admin-{}", self.0)
    }
}

/// Verification and shutdown flags of one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ConnectionState {
    pub verified: bool,
    pub pending_shutdown: bool,
}

/// Outgoing half of an admin connection.
#[async_trait]
pub trait EnvelopeSink: Send {
    async fn deliver(&mut self, envelope: Envelope) -> Result<(), WriteError>;
}

#[async_trait]
impl EnvelopeSink for FramedWrite<OwnedWriteHalf, EnvelopeCodec> {
    async fn deliver(&mut self, envelope: Envelope) -> Result<(), WriteError> {
        self.send(envelope)
            .await
            .map_err(|e| WriteError(e.to_string()))
    }
}

/// What a handled request asks of the coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandOutcome {
    Handled,
    Activated,
    ShutdownRequested,
}

/// Daemon-wide facts a command handler consults.
#[derive(Debug, Clone, Copy)]
pub struct CommandContext<'a> {
    pub license_key: Option<&'a str>,
    pub shutdown_pending: bool,
}

struct AdminConnection {
    peer: String,
    state: ConnectionState,
    sink: Box<dyn EnvelopeSink>,
    reader: Option<AbortHandle>,
}

impl AdminConnection {
    async fn deliver(&mut self, envelope: Envelope, limit: Duration) -> Result<(), WriteError> {
        time::timeout(limit, self.sink.deliver(envelope))
            .await
            .map_err(|_| WriteError(format!("peer stopped reading, write timed out after {limit:?}")))?
    }
}

impl Drop for AdminConnection {
    fn drop(&mut self) {
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
    }
}

/// Result of one keepalive round.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct KeepaliveReport {
    pub pinged: usize,
    pub closed: Vec<ConnectionId>,
}

/// All live admin connections, owned by the reactor thread.
///
/// Writes are bounded by a timeout so a peer that stops reading cannot
/// stall the reactor; such a peer is treated like a broken one.
pub struct ConnectionRegistry {
    connections: BTreeMap<ConnectionId, AdminConnection>,
    next_id: u64,
    write_timeout: Duration,
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self {
            connections: BTreeMap::new(),
            next_id: 0,
            write_timeout: DEFAULT_WRITE_TIMEOUT,
        }
    }

    pub fn with_write_timeout(mut self, write_timeout: Duration) -> Self {
        self.write_timeout = write_timeout;
        self
    }

    /// Track a new connection; `reader` is aborted when it is removed.
    pub fn register(
        &mut self,
        peer: impl Into<String>,
        sink: Box<dyn EnvelopeSink>,
        reader: Option<AbortHandle>,
    ) -> ConnectionId {
        let id = ConnectionId(self.next_id);
        self.next_id += 1;

        let peer = peer.into();
        info!(connection = %id, peer = %peer, "Admin connection accepted");
        metrics::counter!("sniffer.admin.connections").increment(1);

        self.connections.insert(
            id,
            AdminConnection {
                peer,
                state: ConnectionState::default(),
                sink,
                reader,
            },
        );
        id
    }

    /// Attach the reader task of an already registered connection.
    pub fn set_reader(&mut self, id: ConnectionId, reader: AbortHandle) {
        match self.connections.get_mut(&id) {
            Some(connection) => connection.reader = Some(reader),
            None => reader.abort(),
        }
    }

    pub fn remove(&mut self, id: ConnectionId) -> bool {
        match self.connections.remove(&id) {
            Some(connection) => {
                info!(connection = %id, peer = %connection.peer, "Admin connection closed");
                true
            }
            None => false,
        }
    }

    pub fn state(&self, id: ConnectionId) -> Option<ConnectionState> {
        self.connections.get(&id).map(|c| c.state)
    }

    pub fn contains(&self, id: ConnectionId) -> bool {
        self.connections.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    pub fn close_all(&mut self) {
        let ids: Vec<ConnectionId> = self.connections.keys().copied().collect();
        for id in ids {
            self.remove(id);
        }
    }

    /// Parse and dispatch one line received on `id`.
    pub async fn handle_line(
        &mut self,
        id: ConnectionId,
        line: &str,
        ctx: CommandContext<'_>,
    ) -> Result<CommandOutcome, CommandError> {
        if !self.connections.contains_key(&id) {
            return Err(CommandError::UnknownConnection(id));
        }

        let envelope = Envelope::parse(line)?;
        debug!(
            connection = %id,
            kind = ?envelope.kind,
            request_id = %envelope.id,
            command = %envelope.command(),
            "Admin command received"
        );

        match envelope.kind {
            SequenceKind::Response => {
                debug!(connection = %id, request_id = %envelope.id, "Admin response acknowledged");
                Ok(CommandOutcome::Handled)
            }
            SequenceKind::Request => match envelope.command() {
                CMD_ACTIVATE => self.handle_activate(id, &envelope, ctx).await,
                CMD_STOP_SERVICE => self.handle_stop_service(id, &envelope, ctx).await,
                other => {
                    warn!(connection = %id, command = %other, "Received unknown command");
                    Ok(CommandOutcome::Handled)
                }
            },
        }
    }

    async fn handle_activate(
        &mut self,
        id: ConnectionId,
        envelope: &Envelope,
        ctx: CommandContext<'_>,
    ) -> Result<CommandOutcome, CommandError> {
        let payload = license_payload(envelope, CMD_ACTIVATE)?;
        let license = ctx.license_key.ok_or(CommandError::LicenseNotConfigured)?;
        if payload.license_key != license {
            return Err(CommandError::LicenseMismatch);
        }

        if let Some(connection) = self.connections.get_mut(&id) {
            connection.state.verified = true;
        }
        info!(connection = %id, "Admin connection verified");

        self.reply(id, Envelope::response_ok(envelope.id.clone(), CMD_ACTIVATE))
            .await;
        Ok(CommandOutcome::Activated)
    }

    async fn handle_stop_service(
        &mut self,
        id: ConnectionId,
        envelope: &Envelope,
        ctx: CommandContext<'_>,
    ) -> Result<CommandOutcome, CommandError> {
        let payload = license_payload(envelope, CMD_STOP_SERVICE)?;
        let verified = self.state(id).map(|s| s.verified).unwrap_or(false);
        let license_ok = ctx
            .license_key
            .is_some_and(|license| payload.license_key == license);
        if !license_ok && !verified {
            return Err(CommandError::LicenseMismatch);
        }

        if ctx.shutdown_pending {
            info!(connection = %id, "Stop requested while shutdown already pending");
            self.reply(
                id,
                Envelope::response_fail(envelope.id.clone(), CMD_STOP_SERVICE, STOP_IN_PROGRESS),
            )
            .await;
            return Ok(CommandOutcome::Handled);
        }

        self.reply(id, Envelope::response_ok(envelope.id.clone(), CMD_STOP_SERVICE))
            .await;
        if let Some(connection) = self.connections.get_mut(&id) {
            connection.state.pending_shutdown = true;
        }
        info!(connection = %id, "Stop service accepted");
        Ok(CommandOutcome::ShutdownRequested)
    }

    /// Write a response; a failed write drops the connection.
    async fn reply(&mut self, id: ConnectionId, envelope: Envelope) {
        let limit = self.write_timeout;
        let Some(connection) = self.connections.get_mut(&id) else {
            return;
        };
        if let Err(e) = connection.deliver(envelope, limit).await {
            warn!(connection = %id, error = %e, "Failed to send admin response");
            self.remove(id);
        }
    }

    /// Ping every verified connection, dropping those that fail.
    pub async fn keepalive(&mut self, ids: &mut RequestIdGenerator) -> KeepaliveReport {
        let mut report = KeepaliveReport::default();
        let verified: Vec<ConnectionId> = self
            .connections
            .iter()
            .filter(|(_, c)| c.state.verified)
            .map(|(id, _)| *id)
            .collect();

        let limit = self.write_timeout;
        for id in verified {
            let ping = Envelope::request(ids.next_id(), vec![CMD_PING.to_string()]);
            let Some(connection) = self.connections.get_mut(&id) else {
                continue;
            };
            match connection.deliver(ping, limit).await {
                Ok(()) => {
                    report.pinged += 1;
                    debug!(connection = %id, "Pinged admin client");
                }
                Err(e) => {
                    warn!(connection = %id, error = %e, "Keepalive failed, closing connection");
                    self.remove(id);
                    report.closed.push(id);
                }
            }
        }

        if report.pinged > 0 || !report.closed.is_empty() {
            info!(
                pinged = report.pinged,
                closed = report.closed.len(),
                connected = self.connections.len(),
                "Keepalive round finished"
            );
        }
        report
    }
}

fn license_payload(
    envelope: &Envelope,
    command: &'static str,
) -> Result<LicensePayload, CommandError> {
    let raw = envelope
        .arg(1)
        .ok_or(CommandError::MissingArgument(command))?;
    Ok(serde_json::from_str(raw)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request_id::RequestId;
    use parking_lot::Mutex;
    use std::sync::Arc;

    const LICENSE: &str = "secret license";

    #[derive(Clone, Default)]
    struct RecordingSink {
        sent: Arc<Mutex<Vec<Envelope>>>,
    }

    #[async_trait]
    impl EnvelopeSink for RecordingSink {
        async fn deliver(&mut self, envelope: Envelope) -> Result<(), WriteError> {
            self.sent.lock().push(envelope);
            Ok(())
        }
    }

    struct FailingSink;

    /// A peer whose socket never drains.
    struct StalledSink;

    #[async_trait]
    impl EnvelopeSink for StalledSink {
        async fn deliver(&mut self, _envelope: Envelope) -> Result<(), WriteError> {
            std::future::pending().await
        }
    }

    #[async_trait]
    impl EnvelopeSink for FailingSink {
        async fn deliver(&mut self, _envelope: Envelope) -> Result<(), WriteError> {
            Err(WriteError("broken pipe".to_string()))
        }
    }

    fn ctx(shutdown_pending: bool) -> CommandContext<'static> {
        CommandContext {
            license_key: Some(LICENSE),
            shutdown_pending,
        }
    }

    fn request(id: &str, argv: &[&str]) -> String {
        Envelope::request(
            RequestId::from_wire(id),
            argv.iter().map(|s| s.to_string()).collect(),
        )
        .encode()
    }

    fn license_json(key: &str) -> String {
        serde_json::to_string(&LicensePayload {
            license_key: key.to_string(),
        })
        .unwrap()
    }

    fn registry_with_recorder() -> (ConnectionRegistry, ConnectionId, RecordingSink) {
        let mut registry = ConnectionRegistry::new();
        let sink = RecordingSink::default();
        let id = registry.register("127.0.0.1:5000", Box::new(sink.clone()), None);
        (registry, id, sink)
    }

    #[tokio::test]
    async fn test_activate_with_correct_license() {
        let (mut registry, id, sink) = registry_with_recorder();
        let line = request("00000000000000a1", &[CMD_ACTIVATE, &license_json(LICENSE)]);

        let outcome = registry.handle_line(id, &line, ctx(false)).await.unwrap();

        assert_eq!(outcome, CommandOutcome::Activated);
        assert!(registry.state(id).unwrap().verified);
        let sent = sink.sent.lock();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].kind, SequenceKind::Response);
        assert_eq!(sent[0].id.as_str(), "00000000000000a1");
        assert_eq!(sent[0].argv, vec!["ok", CMD_ACTIVATE]);
    }

    #[tokio::test]
    async fn test_activate_with_wrong_license_stays_unverified() {
        let (mut registry, id, sink) = registry_with_recorder();
        let line = request("01", &[CMD_ACTIVATE, &license_json("guess")]);

        let result = registry.handle_line(id, &line, ctx(false)).await;

        assert!(matches!(result, Err(CommandError::LicenseMismatch)));
        assert!(!registry.state(id).unwrap().verified);
        assert!(sink.sent.lock().is_empty());
        assert!(registry.contains(id));
    }

    #[tokio::test]
    async fn test_activate_without_payload_or_bad_json() {
        let (mut registry, id, sink) = registry_with_recorder();

        let missing = registry
            .handle_line(id, &request("01", &[CMD_ACTIVATE]), ctx(false))
            .await;
        assert!(matches!(missing, Err(CommandError::MissingArgument(_))));

        let bad_json = registry
            .handle_line(id, &request("02", &[CMD_ACTIVATE, "{not json"]), ctx(false))
            .await;
        assert!(matches!(bad_json, Err(CommandError::InvalidPayload(_))));

        assert!(sink.sent.lock().is_empty());
        assert!(!registry.state(id).unwrap().verified);
    }

    #[tokio::test]
    async fn test_activate_without_configured_license() {
        let (mut registry, id, _sink) = registry_with_recorder();
        let line = request("01", &[CMD_ACTIVATE, &license_json(LICENSE)]);
        let no_license = CommandContext {
            license_key: None,
            shutdown_pending: false,
        };

        let result = registry.handle_line(id, &line, no_license).await;
        assert!(matches!(result, Err(CommandError::LicenseNotConfigured)));
    }

    #[tokio::test]
    async fn test_stop_service_with_license() {
        let (mut registry, id, sink) = registry_with_recorder();
        let line = request("0f", &[CMD_STOP_SERVICE, &license_json(LICENSE)]);

        let outcome = registry.handle_line(id, &line, ctx(false)).await.unwrap();

        assert_eq!(outcome, CommandOutcome::ShutdownRequested);
        assert!(registry.state(id).unwrap().pending_shutdown);
        assert_eq!(sink.sent.lock()[0].argv, vec!["ok", CMD_STOP_SERVICE]);
        assert_eq!(sink.sent.lock()[0].id.as_str(), "0f");
    }

    #[tokio::test]
    async fn test_stop_service_on_verified_connection_ignores_key() {
        let (mut registry, id, _sink) = registry_with_recorder();
        registry
            .handle_line(id, &request("01", &[CMD_ACTIVATE, &license_json(LICENSE)]), ctx(false))
            .await
            .unwrap();

        let outcome = registry
            .handle_line(id, &request("02", &[CMD_STOP_SERVICE, &license_json("other")]), ctx(false))
            .await
            .unwrap();
        assert_eq!(outcome, CommandOutcome::ShutdownRequested);
    }

    #[tokio::test]
    async fn test_stop_service_unauthorized() {
        let (mut registry, id, sink) = registry_with_recorder();
        let result = registry
            .handle_line(id, &request("02", &[CMD_STOP_SERVICE, &license_json("other")]), ctx(false))
            .await;

        assert!(matches!(result, Err(CommandError::LicenseMismatch)));
        assert!(!registry.state(id).unwrap().pending_shutdown);
        assert!(sink.sent.lock().is_empty());
    }

    #[tokio::test]
    async fn test_stop_service_while_pending_reports_in_progress() {
        let (mut registry, id, sink) = registry_with_recorder();
        let line = request("10", &[CMD_STOP_SERVICE, &license_json(LICENSE)]);
        let before = registry.state(id).unwrap();

        let outcome = registry.handle_line(id, &line, ctx(true)).await.unwrap();

        assert_eq!(outcome, CommandOutcome::Handled);
        assert_eq!(registry.state(id).unwrap(), before);
        let sent = sink.sent.lock();
        assert_eq!(sent[0].id.as_str(), "10");
        assert_eq!(sent[0].argv, vec!["fail", CMD_STOP_SERVICE, STOP_IN_PROGRESS]);
    }

    #[tokio::test]
    async fn test_unknown_command_and_responses_are_ignored() {
        let (mut registry, id, sink) = registry_with_recorder();

        let unknown = registry
            .handle_line(id, &request("01", &["reload"]), ctx(false))
            .await
            .unwrap();
        assert_eq!(unknown, CommandOutcome::Handled);

        let ack = registry
            .handle_line(id, "1 0000000000000000 ok ping", ctx(false))
            .await
            .unwrap();
        assert_eq!(ack, CommandOutcome::Handled);
        assert!(sink.sent.lock().is_empty());
    }

    #[tokio::test]
    async fn test_malformed_line_keeps_connection() {
        let (mut registry, id, _sink) = registry_with_recorder();
        let result = registry.handle_line(id, "garbage", ctx(false)).await;

        assert!(matches!(result, Err(CommandError::Protocol(_))));
        assert!(registry.contains(id));
    }

    #[tokio::test]
    async fn test_keepalive_pings_only_verified() {
        let mut registry = ConnectionRegistry::new();
        let verified_sink = RecordingSink::default();
        let idle_sink = RecordingSink::default();
        let verified = registry.register("a", Box::new(verified_sink.clone()), None);
        registry.register("b", Box::new(idle_sink.clone()), None);
        registry
            .handle_line(verified, &request("01", &[CMD_ACTIVATE, &license_json(LICENSE)]), ctx(false))
            .await
            .unwrap();

        let mut ids = RequestIdGenerator::new();
        let report = registry.keepalive(&mut ids).await;

        assert_eq!(report.pinged, 1);
        assert!(report.closed.is_empty());
        assert!(idle_sink.sent.lock().is_empty());
        let sent = verified_sink.sent.lock();
        let ping = sent.last().unwrap();
        assert_eq!(ping.kind, SequenceKind::Request);
        assert_eq!(ping.argv, vec![CMD_PING]);
        assert_eq!(ping.id.as_str(), "0000000000000000");
    }

    #[tokio::test]
    async fn test_keepalive_write_failure_removes_connection() {
        let mut registry = ConnectionRegistry::new();
        let id = registry.register("dead-peer", Box::new(FailingSink), None);
        registry.connections.get_mut(&id).unwrap().state.verified = true;

        let mut ids = RequestIdGenerator::new();
        let report = registry.keepalive(&mut ids).await;

        assert_eq!(report.pinged, 0);
        assert_eq!(report.closed, vec![id]);
        assert!(!registry.contains(id));
        assert!(registry.is_empty());

        let next = registry.keepalive(&mut ids).await;
        assert_eq!(next, KeepaliveReport::default());
    }

    #[tokio::test]
    async fn test_response_write_failure_drops_connection() {
        let mut registry = ConnectionRegistry::new();
        let id = registry.register("dead-peer", Box::new(FailingSink), None);
        let line = request("01", &[CMD_ACTIVATE, &license_json(LICENSE)]);

        let outcome = registry.handle_line(id, &line, ctx(false)).await.unwrap();

        assert_eq!(outcome, CommandOutcome::Activated);
        assert!(!registry.contains(id));
    }

    #[tokio::test]
    async fn test_unknown_connection() {
        let mut registry = ConnectionRegistry::new();
        let result = registry
            .handle_line(ConnectionId(99), "0 01 ping", ctx(false))
            .await;
        assert!(matches!(result, Err(CommandError::UnknownConnection(_))));
    }

    #[tokio::test]
    async fn test_keepalive_gives_up_on_stalled_peer() {
        let mut registry = ConnectionRegistry::new().with_write_timeout(Duration::from_millis(50));
        let stalled = registry.register("stalled", Box::new(StalledSink), None);
        let healthy_sink = RecordingSink::default();
        let healthy = registry.register("healthy", Box::new(healthy_sink.clone()), None);
        for id in [stalled, healthy] {
            registry.connections.get_mut(&id).unwrap().state.verified = true;
        }

        let mut ids = RequestIdGenerator::new();
        let report = time::timeout(Duration::from_secs(5), registry.keepalive(&mut ids))
            .await
            .expect("keepalive must not hang on a stalled peer");

        assert_eq!(report.pinged, 1);
        assert_eq!(report.closed, vec![stalled]);
        assert!(!registry.contains(stalled));
        assert!(registry.contains(healthy));
        assert_eq!(healthy_sink.sent.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_response_to_stalled_peer_drops_connection() {
        let mut registry = ConnectionRegistry::new().with_write_timeout(Duration::from_millis(50));
        let id = registry.register("stalled", Box::new(StalledSink), None);
        let line = request("01", &[CMD_ACTIVATE, &license_json(LICENSE)]);

        let outcome = time::timeout(Duration::from_secs(5), registry.handle_line(id, &line, ctx(false)))
            .await
            .unwrap()
            .unwrap();

        assert_eq!(outcome, CommandOutcome::Activated);
        assert!(!registry.contains(id));
    }

    #[tokio::test]
    async fn test_socket_peer_that_never_reads_is_dropped() {
        use tokio::net::{TcpListener, TcpStream};

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap()).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        let (_read_half, write_half) = server.into_split();

        let mut registry = ConnectionRegistry::new().with_write_timeout(Duration::from_millis(200));
        let writer = FramedWrite::new(write_half, EnvelopeCodec::new());
        let id = registry.register("silent", Box::new(writer), None);

        let oversized = Envelope::request(
            RequestId::from_counter(1),
            vec![CMD_PING.to_string(), "x".repeat(32 * 1024 * 1024)],
        );
        time::timeout(Duration::from_secs(10), registry.reply(id, oversized))
            .await
            .expect("reply must give up on a peer that never reads");

        assert!(!registry.contains(id));
        drop(client);
    }
}
