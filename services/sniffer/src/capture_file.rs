//! Capture batch files dropped by the external capture process.
//!
//! Batches are classic libpcap savefiles named after the moment the
//! capture started (`YYYY-MM-DD_HH:MM:SS<ext>`, UTC). This module reads
//! the container record by record and recovers the start time from the
//! file name; what is inside each record is the frame decoder's business.

use crate::frame_decoder::CaptureHeader;
use chrono::{NaiveDateTime, TimeZone, Utc};
use pcap_file::pcap::{PcapHeader, PcapReader};
use pcap_file::{DataLink, PcapError};
use std::fs::File;
use std::io::{self, BufReader, Read};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// File-name prefix format of a capture batch.
pub const CAPTURE_NAME_FORMAT: &str = "%Y-%m-%d_%H:%M:%S";

/// Length of a `YYYY-MM-DD_HH:MM:SS` prefix.
const CAPTURE_NAME_LEN: usize = 19;

/// Whole-file failures. The file is abandoned and left in place.
#[derive(Debug, Error)]
pub enum FileDecodeError {
    #[error("File name does not encode a capture start time: {0}")]
    InvalidName(String),

    #[error("Failed to read capture file {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Not a valid capture container: {0}")]
    InvalidContainer(String),

    #[error("Unsupported link type {0:?}, expected radiotap")]
    UnsupportedLinkType(DataLink),

    #[error("Capture file truncated inside a record")]
    Truncated,
}

impl From<PcapError> for FileDecodeError {
    fn from(err: PcapError) -> Self {
        match err {
            PcapError::IncompleteBuffer => FileDecodeError::Truncated,
            other => FileDecodeError::InvalidContainer(other.to_string()),
        }
    }
}

/// Capture start time encoded in a batch file name, as epoch seconds.
pub fn parse_capture_start(path: &Path) -> Result<i64, FileDecodeError> {
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| FileDecodeError::InvalidName(path.display().to_string()))?;

    let prefix = name
        .get(..CAPTURE_NAME_LEN)
        .ok_or_else(|| FileDecodeError::InvalidName(name.to_string()))?;

    let naive = NaiveDateTime::parse_from_str(prefix, CAPTURE_NAME_FORMAT)
        .map_err(|_| FileDecodeError::InvalidName(name.to_string()))?;

    Ok(Utc.from_utc_datetime(&naive).timestamp())
}

/// Sequential reader over a savefile's records.
pub struct CaptureFile<R: Read = BufReader<File>> {
    reader: PcapReader<R>,
    header: PcapHeader,
    finished: bool,
}

impl<R: Read> std::fmt::Debug for CaptureFile<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CaptureFile")
            .field("snaplen", &self.header.snaplen)
            .field("datalink", &self.header.datalink)
            .field("ts_resolution", &self.header.ts_resolution)
            .finish()
    }
}

impl CaptureFile {
    /// Open a capture file and validate its global header.
    pub fn open(path: &Path) -> Result<Self, FileDecodeError> {
        let file = File::open(path).map_err(|source| FileDecodeError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_reader(BufReader::new(file))
    }
}

impl<R: Read> CaptureFile<R> {
    pub fn from_reader(reader: R) -> Result<Self, FileDecodeError> {
        let reader = PcapReader::new(reader).map_err(|e| {
            FileDecodeError::InvalidContainer(format!("unreadable global header: {e}"))
        })?;

        let header = reader.header();
        if header.datalink != DataLink::IEEE802_11_RADIOTAP {
            return Err(FileDecodeError::UnsupportedLinkType(header.datalink));
        }

        Ok(Self {
            reader,
            header,
            finished: false,
        })
    }

    pub fn datalink(&self) -> DataLink {
        self.header.datalink
    }

    /// Read the next record, `None` at a clean end of file.
    pub fn next_frame(&mut self) -> Option<Result<(CaptureHeader, Vec<u8>), FileDecodeError>> {
        if self.finished {
            return None;
        }

        let result = match self.reader.next_packet()? {
            Ok(packet) => {
                let header = CaptureHeader {
                    ts_sec: packet.timestamp.as_secs() as i64,
                    ts_usec: i64::from(packet.timestamp.subsec_micros()),
                    captured_len: packet.data.len() as u32,
                    original_len: packet.orig_len,
                };
                Ok((header, packet.data.into_owned()))
            }
            Err(e) => Err(FileDecodeError::from(e)),
        };

        if result.is_err() {
            self.finished = true;
        }
        Some(result)
    }
}

impl<R: Read> Iterator for CaptureFile<R> {
    type Item = Result<(CaptureHeader, Vec<u8>), FileDecodeError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_frame()
    }
}
