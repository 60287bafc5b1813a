//! Cross-thread handoff into the reactor thread.
//!
//! Worker threads and admin reader tasks never touch coordinator state.
//! They post a [`ReactorEvent`] through a [`ReactorHandle`] and the
//! coordinator applies it on the reactor thread, in arrival order.

use crate::command_protocol::ConnectionId;
use crate::frame_decoder::DecodeSummary;
use crate::observation::Observation;
use std::path::PathBuf;
use tokio::sync::mpsc;
use tracing::debug;

#[derive(Debug)]
pub enum ReactorEvent {
    /// A capture file was decoded and is ready to be stored and deleted.
    FileDecoded {
        location: String,
        path: PathBuf,
        observations: Vec<Observation>,
        summary: DecodeSummary,
    },
    /// A line arrived on an admin connection.
    AdminLine { conn: ConnectionId, line: String },
    /// An admin connection reached EOF or failed.
    AdminClosed { conn: ConnectionId },
}

/// Sending side of the reactor queue; cheap to clone and `Send`.
#[derive(Debug, Clone)]
pub struct ReactorHandle {
    tx: mpsc::UnboundedSender<ReactorEvent>,
}

impl ReactorHandle {
    /// Post an event; returns false once the reactor is gone.
    pub fn submit(&self, event: ReactorEvent) -> bool {
        match self.tx.send(event) {
            Ok(()) => true,
            Err(_) => {
                debug!("Reactor closed, event dropped");
                false
            }
        }
    }
}

pub fn channel() -> (ReactorHandle, mpsc::UnboundedReceiver<ReactorEvent>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (ReactorHandle { tx }, rx)
}
