//! Sniffer Presence Daemon
//!
//! Ingests rotated 802.11 capture files from watched directories, turns
//! every frame into a `(transmitter, time, signal)` observation and stores
//! the observations of each directory in its own storage node. A small
//! line-oriented admin channel lets an operator stop the daemon.
//!
//! ## Architecture
//!
//! ```text
//! capture dirs         reactor thread                       PostgreSQL
//! ┌──────────────┐    ┌──────────────────┐                ┌──────────────┐
//! │ north/       │    │ LocationWatcher  │                │ "north"      │
//! │ south/       │───▶│        │         │                │ "south"      │
//! └──────────────┘    │        ▼         │  FileDecoded   └──────────────┘
//!                     │   Coordinator ◀──┼──────────┐            ▲
//!                     │    │        │    │          │            │
//!                     │    │        └────┼──▶ ShardRouter ───────┘
//!                     │    ▼             │          │
//!                     │ ConnectionRegistry          │
//!                     └────▲─────────────┘          │
//!                          │               ┌──────────────┐
//!                     admin clients        │ WorkerPool   │
//!                     (TCP, 6317)          │ FrameDecoder │
//!                                          └──────────────┘
//! ```

pub mod admin_client;
pub mod capture_file;
pub mod command_protocol;
pub mod config;
pub mod coordinator;
pub mod decode_task;
pub mod envelope;
pub mod frame_decoder;
pub mod location_watcher;
pub mod observation;
pub mod observation_store;
pub mod reactor;
pub mod request_id;
pub mod shard_router;
pub mod worker_pool;

pub use admin_client::{request_stop, StopOutcome};
pub use config::SnifferConfig;
pub use coordinator::Coordinator;
pub use frame_decoder::{FrameDecoder, MetadataLayout, SkipReason};
pub use observation::{MacAddr, Observation};
pub use observation_store::PgConnector;
pub use shard_router::{ObservationStore, ShardRouter, StorageError, StoreConnector};
