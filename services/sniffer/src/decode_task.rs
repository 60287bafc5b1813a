//! Decoding of one capture batch on a worker thread.

use crate::capture_file::{parse_capture_start, CaptureFile, FileDecodeError};
use crate::frame_decoder::{DecodeSummary, FrameDecoder, TimeBase};
use crate::observation::Observation;
use crate::reactor::{ReactorEvent, ReactorHandle};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Observations recovered from one file.
#[derive(Debug, Default)]
pub struct DecodedFile {
    pub observations: Vec<Observation>,
    pub summary: DecodeSummary,
}

/// Decode every frame of `path` in file order.
///
/// A record error part way through ends the file; frames read before it
/// are kept.
pub fn decode_capture(path: &Path, decoder: &FrameDecoder) -> Result<DecodedFile, FileDecodeError> {
    let base_secs = parse_capture_start(path)?;
    let time_base = TimeBase::Archive { base_secs };
    let mut capture = CaptureFile::open(path)?;

    let mut decoded = DecodedFile::default();
    while let Some(record) = capture.next_frame() {
        let (header, frame) = match record {
            Ok(record) => record,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Capture file ended early");
                break;
            }
        };

        let outcome = decoder.decode(&frame, &header, time_base);
        decoded.summary.record(&outcome);
        match outcome {
            Ok(observation) => decoded.observations.push(observation),
            Err(reason) => debug!(reason = reason.as_str(), "Frame skipped"),
        }
    }

    Ok(decoded)
}

/// A capture file queued for decoding.
pub struct DecodeJob {
    pub location: String,
    pub path: PathBuf,
    pub decoder: Arc<FrameDecoder>,
    pub reactor: ReactorHandle,
}

impl DecodeJob {
    /// Decode the file and hand the result to the reactor.
    ///
    /// A file that cannot be decoded is left in place and nothing is
    /// posted, so it is neither stored nor deleted.
    pub fn run(self) {
        let decoded = match decode_capture(&self.path, &self.decoder) {
            Ok(decoded) => decoded,
            Err(e) => {
                metrics::counter!("sniffer.files.failed").increment(1);
                warn!(
                    location = %self.location,
                    path = %self.path.display(),
                    error = %e,
                    "Failed to decode capture file"
                );
                return;
            }
        };

        metrics::counter!("sniffer.files.processed").increment(1);
        metrics::counter!("sniffer.frames.decoded").increment(decoded.summary.decoded);
        for (reason, count) in &decoded.summary.skipped {
            metrics::counter!("sniffer.frames.skipped", "reason" => reason.as_str()).increment(*count);
        }

        info!(
            location = %self.location,
            path = %self.path.display(),
            decoded = decoded.summary.decoded,
            skipped = decoded.summary.total_skipped(),
            "Capture file decoded"
        );

        self.reactor.submit(ReactorEvent::FileDecoded {
            location: self.location,
            path: self.path,
            observations: decoded.observations,
            summary: decoded.summary,
        });
    }
}
