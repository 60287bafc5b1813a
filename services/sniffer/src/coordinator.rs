//! The reactor: wires watcher, worker pool, storage and admin channel.
//!
//! Everything except frame decoding happens on the single thread that
//! drives [`Coordinator::run`]. Decoding runs on the worker pool and comes
//! back as [`ReactorEvent::FileDecoded`].

use crate::command_protocol::{
    CommandContext, CommandError, CommandOutcome, ConnectionId, ConnectionRegistry,
};
use crate::config::SnifferConfig;
use crate::decode_task::DecodeJob;
use crate::envelope::EnvelopeCodec;
use crate::frame_decoder::{DecodeSummary, FrameDecoder};
use crate::location_watcher::{FileReady, LocationWatcher, WatchDescriptor, WatchError};
use crate::observation::Observation;
use crate::reactor::{self, ReactorEvent, ReactorHandle};
use crate::request_id::RequestIdGenerator;
use crate::shard_router::{ShardRouter, StoreConnector};
use crate::worker_pool::{PoolError, WorkerPool};
use futures::StreamExt;
use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::path::Path;
use std::pin::Pin;
use std::sync::Arc;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::{self, Instant, MissedTickBehavior, Sleep};
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, error, info, warn};

/// Errors that prevent the daemon from starting.
#[derive(Debug, Error)]
pub enum CoordinatorError {
    #[error("Failed to acquire the watch notification handle: {0}")]
    Watcher(#[from] WatchError),

    #[error("Failed to start worker pool: {0}")]
    Pool(#[from] PoolError),

    #[error(transparent)]
    Config(#[from] crate::config::ConfigValidationError),
}

/// Shard name of a location: its leaf directory.
pub fn location_name(dir: &Path) -> Option<String> {
    dir.file_name()
        .and_then(|name| name.to_str())
        .map(str::to_string)
}

pub struct Coordinator {
    config: SnifferConfig,
    watcher: LocationWatcher,
    locations: HashMap<WatchDescriptor, String>,
    pool: Option<WorkerPool>,
    router: ShardRouter,
    connections: ConnectionRegistry,
    request_ids: RequestIdGenerator,
    decoder: Arc<FrameDecoder>,
    reactor: ReactorHandle,
    events: mpsc::UnboundedReceiver<ReactorEvent>,
    listener: Option<TcpListener>,
    shutdown_timer: Option<Pin<Box<Sleep>>>,
}

impl Coordinator {
    /// Attach every configured location, start the pool and bind the
    /// admin listener.
    pub async fn start(
        config: SnifferConfig,
        connector: Box<dyn StoreConnector>,
    ) -> Result<Self, CoordinatorError> {
        let decoder = Arc::new(FrameDecoder::new(
            config.decoder.metadata_layout,
            config.decoder.mac_filter()?,
        ));
        let mut watcher = LocationWatcher::new()?;
        let mut router = ShardRouter::new(connector);
        let mut locations = HashMap::new();

        for dir in config.server.location_dirs() {
            let Some(name) = location_name(&dir) else {
                error!(location = %dir.display(), "Location has no usable directory name");
                continue;
            };
            if locations.values().any(|existing| existing == &name) {
                error!(
                    location = %dir.display(),
                    node = %name,
                    "Another location already uses this name, files in this directory will never be processed"
                );
                continue;
            }

            let entry = match watcher.add_location(&dir) {
                Ok(entry) => entry,
                Err(e) => {
                    error!(location = %dir.display(), error = %e, "Failed to watch location");
                    continue;
                }
            };
            locations.insert(entry.descriptor, name.clone());

            if let Err(e) = router.attach(&name, &config.server.db_hosts).await {
                error!(node = %name, error = %e, "Failed to attach storage node");
            }
        }

        if config.server.license_key.is_none() {
            warn!("No license key configured, admin activation is disabled");
        }

        let pool = WorkerPool::new(config.server.worker_threads)?;
        let listener = match TcpListener::bind(config.admin.address()).await {
            Ok(listener) => {
                info!(address = %config.admin.address(), "Admin channel listening");
                Some(listener)
            }
            Err(e) => {
                error!(address = %config.admin.address(), error = %e, "Failed to bind admin channel");
                None
            }
        };

        let (reactor, events) = reactor::channel();
        let connections = ConnectionRegistry::new().with_write_timeout(config.admin.write_timeout());
        info!(
            server_id = %config.server.id,
            locations = locations.len(),
            nodes = router.len(),
            "Sniffer started"
        );

        Ok(Self {
            config,
            watcher,
            locations,
            pool: Some(pool),
            router,
            connections,
            request_ids: RequestIdGenerator::new(),
            decoder,
            reactor,
            events,
            listener,
            shutdown_timer: None,
        })
    }

    pub fn admin_addr(&self) -> Option<SocketAddr> {
        self.listener.as_ref().and_then(|l| l.local_addr().ok())
    }

    /// Names of the locations being watched.
    pub fn location_names(&self) -> Vec<&str> {
        self.locations.values().map(String::as_str).collect()
    }

    /// Drive the reactor until `shutdown` resolves or an accepted stop
    /// request's grace period ends, then shut everything down.
    pub async fn run<F>(mut self, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);

        let period = self.config.admin.keepalive_interval();
        let mut keepalive = time::interval_at(Instant::now() + period, period);
        keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut watching = true;

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("Shutdown signal received");
                    break;
                }
                _ = grace_elapsed(&mut self.shutdown_timer) => {
                    info!("Shutdown grace period elapsed");
                    break;
                }
                ready = self.watcher.poll(), if watching => match ready {
                    Ok(files) => self.dispatch_files(files),
                    Err(e) => {
                        error!(error = %e, "Location watcher stopped");
                        watching = false;
                    }
                },
                accepted = accept(&self.listener) => match accepted {
                    Ok((stream, peer)) => self.open_connection(stream, peer),
                    Err(e) => warn!(error = %e, "Failed to accept admin connection"),
                },
                Some(event) = self.events.recv() => self.handle_event(event).await,
                _ = keepalive.tick() => {
                    self.connections.keepalive(&mut self.request_ids).await;
                }
            }
        }

        self.shutdown().await;
    }

    fn dispatch_files(&self, files: Vec<FileReady>) {
        let Some(pool) = self.pool.as_ref() else {
            return;
        };

        for file in files {
            let (entry, location) = match (
                self.watcher.resolve(file.descriptor),
                self.locations.get(&file.descriptor),
            ) {
                (Ok(entry), Some(location)) => (entry, location),
                _ => {
                    warn!(descriptor = %file.descriptor, "Event for an unknown watch");
                    continue;
                }
            };

            let job = DecodeJob {
                location: location.clone(),
                path: entry.path_of(&file.file_name),
                decoder: Arc::clone(&self.decoder),
                reactor: self.reactor.clone(),
            };
            debug!(location = %job.location, path = %job.path.display(), "Capture file ready");

            if let Err(e) = pool.submit(move || job.run()) {
                warn!(error = %e, "Failed to queue capture file");
            }
        }
    }

    fn open_connection(&mut self, stream: TcpStream, peer: SocketAddr) {
        let (read_half, write_half) = stream.into_split();
        let writer = FramedWrite::new(write_half, EnvelopeCodec::new());
        let conn = self
            .connections
            .register(peer.to_string(), Box::new(writer), None);

        let reactor = self.reactor.clone();
        let reader = tokio::spawn(async move {
            let mut lines = FramedRead::new(read_half, EnvelopeCodec::new());
            while let Some(line) = lines.next().await {
                match line {
                    Ok(Ok(line)) => {
                        if !reactor.submit(ReactorEvent::AdminLine { conn, line }) {
                            return;
                        }
                    }
                    Ok(Err(e)) => {
                        warn!(connection = %conn, error = %e, "Malformed admin line dropped");
                    }
                    Err(e) => {
                        warn!(connection = %conn, error = %e, "Admin connection read failed");
                        break;
                    }
                }
            }
            reactor.submit(ReactorEvent::AdminClosed { conn });
        });
        self.connections.set_reader(conn, reader.abort_handle());
    }

    async fn handle_event(&mut self, event: ReactorEvent) {
        match event {
            ReactorEvent::FileDecoded {
                location,
                path,
                observations,
                summary,
            } => self.store_file(&location, &path, &observations, &summary).await,
            ReactorEvent::AdminLine { conn, line } => self.handle_admin_line(conn, &line).await,
            ReactorEvent::AdminClosed { conn } => {
                self.connections.remove(conn);
            }
        }
    }

    /// Insert a decoded batch, then delete its file whatever the outcome.
    async fn store_file(
        &self,
        location: &str,
        path: &Path,
        observations: &[Observation],
        summary: &DecodeSummary,
    ) {
        match self.router.insert(location, observations).await {
            Ok(stored) => info!(
                location = %location,
                stored,
                skipped = summary.total_skipped(),
                "Capture batch stored"
            ),
            Err(e) => error!(location = %location, error = %e, "Failed to store capture batch"),
        }

        if let Err(e) = tokio::fs::remove_file(path).await {
            warn!(path = %path.display(), error = %e, "Failed to delete capture file");
        }
    }

    async fn handle_admin_line(&mut self, conn: ConnectionId, line: &str) {
        let ctx = CommandContext {
            license_key: self.config.server.license_key.as_deref(),
            shutdown_pending: self.shutdown_timer.is_some(),
        };

        match self.connections.handle_line(conn, line, ctx).await {
            Ok(CommandOutcome::ShutdownRequested) => {
                let grace = self.config.admin.shutdown_grace();
                info!(grace_secs = grace.as_secs(), "Shutdown scheduled");
                self.shutdown_timer = Some(Box::pin(time::sleep(grace)));
            }
            Ok(_) => {}
            Err(CommandError::UnknownConnection(_)) => {
                debug!(connection = %conn, "Line from a closed connection dropped");
            }
            Err(e) => warn!(connection = %conn, error = %e, "Admin request rejected"),
        }
    }

    /// Drain the pool, store what it produced, then release everything.
    async fn shutdown(mut self) {
        info!("Shutting down");
        self.listener = None;

        if let Some(mut pool) = self.pool.take() {
            if let Err(e) = tokio::task::spawn_blocking(move || pool.stop()).await {
                error!(error = %e, "Worker pool drain failed");
            }
        }

        while let Ok(event) = self.events.try_recv() {
            if let ReactorEvent::FileDecoded {
                location,
                path,
                observations,
                summary,
            } = event
            {
                self.store_file(&location, &path, &observations, &summary).await;
            }
        }

        self.connections.close_all();
        self.watcher.close();
        self.router.detach_all().await;
        info!("Shutdown complete");
    }
}

async fn grace_elapsed(timer: &mut Option<Pin<Box<Sleep>>>) {
    match timer {
        Some(sleep) => sleep.as_mut().await,
        None => std::future::pending().await,
    }
}

async fn accept(listener: &Option<TcpListener>) -> std::io::Result<(TcpStream, SocketAddr)> {
    match listener {
        Some(listener) => listener.accept().await,
        None => std::future::pending().await,
    }
}
