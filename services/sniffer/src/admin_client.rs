//! Client side of the admin channel, used by `sniffer --stop`.

use crate::command_protocol::{LicensePayload, CMD_STOP_SERVICE};
use crate::config::AdminConfig;
use crate::envelope::{Envelope, EnvelopeCodec, ProtocolError, SequenceKind};
use crate::request_id::RequestId;
use futures::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::time;
use tokio_util::codec::{Framed, LinesCodecError};
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum AdminClientError {
    #[error("Failed to connect to {address}: {source}")]
    Connect {
        address: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Admin channel error: {0}")]
    Channel(#[from] LinesCodecError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("Daemon closed the connection without answering")]
    Closed,

    #[error("No answer within {0} seconds")]
    Timeout(u64),

    #[error(transparent)]
    Payload(#[from] serde_json::Error),
}

/// The daemon's answer to a stop request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopOutcome {
    Accepted,
    Refused(String),
}

impl StopOutcome {
    pub fn exit_code(&self) -> i32 {
        match self {
            StopOutcome::Accepted => 0,
            StopOutcome::Refused(_) => 1,
        }
    }
}

/// Ask a running daemon to shut down.
pub async fn request_stop(
    admin: &AdminConfig,
    license_key: &str,
) -> Result<StopOutcome, AdminClientError> {
    let timeout = admin.client_timeout();
    time::timeout(timeout, send_stop(admin, license_key))
        .await
        .map_err(|_| AdminClientError::Timeout(timeout.as_secs()))?
}

async fn send_stop(admin: &AdminConfig, license_key: &str) -> Result<StopOutcome, AdminClientError> {
    let address = admin.address();
    let stream = TcpStream::connect(&address)
        .await
        .map_err(|source| AdminClientError::Connect {
            address: address.clone(),
            source,
        })?;
    let mut channel = Framed::new(stream, EnvelopeCodec::new());

    let id = RequestId::from_counter(0);
    let payload = serde_json::to_string(&LicensePayload {
        license_key: license_key.to_string(),
    })?;
    channel
        .send(Envelope::request(
            id.clone(),
            vec![CMD_STOP_SERVICE.to_string(), payload],
        ))
        .await?;
    info!(address = %address, "Stop request sent");

    while let Some(line) = channel.next().await {
        let envelope = match line? {
            Ok(line) => Envelope::parse(&line)?,
            Err(e) => {
                debug!(error = %e, "Ignoring malformed line");
                continue;
            }
        };
        if envelope.kind != SequenceKind::Response || envelope.id != id {
            debug!(request_id = %envelope.id, "Ignoring unrelated message");
            continue;
        }

        return Ok(match envelope.arg(0) {
            Some("ok") => StopOutcome::Accepted,
            _ => StopOutcome::Refused(envelope.arg(2).unwrap_or("no reason given").to_string()),
        });
    }

    Err(AdminClientError::Closed)
}
