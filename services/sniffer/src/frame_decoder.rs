//! Radiotap and 802.11 frame decoding.
//!
//! Turns one captured frame into a presence [`Observation`]: strip the
//! radiotap metadata header, classify the 802.11 frame by its
//! frame-control field, and pull out the transmitter address together with
//! the signal strength recorded by the radio.
//!
//! Every failure is a [`SkipReason`]. Nothing here is fatal to the decode
//! session; callers count the reason and move on to the next frame.

use crate::observation::{MacAddr, MacFilter, Observation, MAC_LEN};
use serde::Deserialize;
use std::collections::BTreeMap;
use thiserror::Error;

/// Size of the radiotap header written by the deployed capture process:
/// 8-byte preamble, TSFT, flags, rate, channel, antenna signal and noise.
pub const FIXED_METADATA_LEN: usize = 24;

/// Offset of the dBm antenna signal inside the fixed header.
const FIXED_SIGNAL_OFFSET: usize = 22;

/// Radiotap preamble: version, pad, length, first present word.
const RADIOTAP_PREAMBLE_LEN: usize = 8;

const RADIOTAP_PRESENT_EXT: u32 = 1 << 31;

/// Radiotap fields preceding the antenna signal: (bit, size, alignment).
const RADIOTAP_FIELDS: &[(u8, usize, usize)] = &[
    (0, 8, 8), // TSFT
    (1, 1, 1), // Flags
    (2, 1, 1), // Rate
    (3, 4, 2), // Channel (freq u16 + flags u16)
    (4, 2, 2), // FHSS (hop set + pattern)
    (5, 1, 1), // Antenna Signal dBm
];

const RADIOTAP_SIGNAL_BIT: u8 = 5;

/// Frame control + duration.
const FC_DURATION_LEN: usize = 4;

/// Offset of the second address field (fc + duration + addr1).
const ADDR2_OFFSET: usize = FC_DURATION_LEN + MAC_LEN;

/// Management/data header: fc, duration, addr1..3, sequence control.
const MGMT_DATA_HEADER_LEN: usize = 24;

/// Control frames carrying a transmitter: fc, duration, addr1, addr2.
const CONTROL_HEADER_LEN: usize = ADDR2_OFFSET + MAC_LEN;

const SUBTYPE_CONTROL_WRAPPER: u8 = 7;
const SUBTYPE_CTS: u8 = 12;
const SUBTYPE_ACK: u8 = 13;

/// Per-record metadata from the capture container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CaptureHeader {
    /// Capture timestamp, seconds
    pub ts_sec: i64,
    /// Capture timestamp, microseconds within the second
    pub ts_usec: i64,
    /// Bytes actually present in the capture
    pub captured_len: u32,
    /// Length of the frame on the air
    pub original_len: u32,
}

/// How frame timestamps are anchored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeBase {
    /// Archived batch: record seconds are added to the file's start time
    Archive { base_secs: i64 },
    /// Live feed: record timestamps are absolute
    Live,
}

impl TimeBase {
    fn timestamp_ms(&self, header: &CaptureHeader) -> i64 {
        match self {
            TimeBase::Archive { base_secs } => (base_secs + header.ts_sec) * 1000,
            TimeBase::Live => header.ts_sec * 1000 + header.ts_usec / 1000,
        }
    }
}

/// Interpretation of the radiotap header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetadataLayout {
    /// Assume the fixed 24-byte header of the deployed capture process
    #[default]
    Fixed,
    /// Honor the declared header length and walk the present bitmap
    Declared,
}

/// 802.11 frame type from the frame-control field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameType {
    Management,
    Control,
    Data,
    Extension,
}

impl FrameType {
    fn from_bits(bits: u8) -> Self {
        match bits & 0x03 {
            0 => FrameType::Management,
            1 => FrameType::Control,
            2 => FrameType::Data,
            _ => FrameType::Extension,
        }
    }
}

/// Decoded 802.11 frame-control field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameControl {
    pub protocol_version: u8,
    pub frame_type: FrameType,
    pub subtype: u8,
    pub flags: u8,
}

impl FrameControl {
    pub fn parse(bytes: &[u8]) -> Option<Self> {
        let (&fc0, &flags) = (bytes.first()?, bytes.get(1)?);
        Some(Self {
            protocol_version: fc0 & 0x03,
            frame_type: FrameType::from_bits(fc0 >> 2),
            subtype: (fc0 >> 4) & 0x0F,
            flags,
        })
    }
}

/// Why a frame produced no observation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Error)]
pub enum SkipReason {
    #[error("frame shorter than the capture metadata header")]
    TooShortForMetadata,

    #[error("unsupported capture metadata version {0}")]
    UnsupportedMetadata(u8),

    #[error("frame shorter than its 802.11 header")]
    TooShortForHeader,

    #[error("control frame without a transmitter address")]
    SkippedControlFrame,

    #[error("unhandled frame type {0}")]
    UnhandledFrameType(u8),

    #[error("broadcast transmitter")]
    SkippedBroadcast,

    #[error("transmitter is filtered")]
    SkippedFiltered,
}

impl SkipReason {
    /// Short label for logs and metrics.
    pub fn as_str(&self) -> &'static str {
        match self {
            SkipReason::TooShortForMetadata => "too_short_for_metadata",
            SkipReason::UnsupportedMetadata(_) => "unsupported_metadata",
            SkipReason::TooShortForHeader => "too_short_for_header",
            SkipReason::SkippedControlFrame => "control_frame",
            SkipReason::UnhandledFrameType(_) => "unhandled_frame_type",
            SkipReason::SkippedBroadcast => "broadcast",
            SkipReason::SkippedFiltered => "filtered",
        }
    }
}

/// Radiotap fields the decoder cares about.
struct RadioMetadata {
    header_len: usize,
    signal: i8,
}

/// Stateless frame decoder configured with a header layout and filter set.
#[derive(Debug, Clone, Default)]
pub struct FrameDecoder {
    layout: MetadataLayout,
    filter: MacFilter,
}

impl FrameDecoder {
    pub fn new(layout: MetadataLayout, filter: MacFilter) -> Self {
        Self { layout, filter }
    }

    /// Decode one frame into an observation.
    pub fn decode(
        &self,
        frame: &[u8],
        header: &CaptureHeader,
        time_base: TimeBase,
    ) -> Result<Observation, SkipReason> {
        let available = (header.captured_len as usize).min(frame.len());
        let frame = &frame[..available];

        if frame.len() < FIXED_METADATA_LEN {
            return Err(SkipReason::TooShortForMetadata);
        }

        let radio = match self.layout {
            MetadataLayout::Fixed => RadioMetadata {
                header_len: FIXED_METADATA_LEN,
                signal: frame[FIXED_SIGNAL_OFFSET] as i8,
            },
            MetadataLayout::Declared => parse_declared_radiotap(frame)?,
        };

        let dot11 = &frame[radio.header_len..];
        let transmitter = transmitter_address(dot11)?;

        if transmitter.is_broadcast() {
            return Err(SkipReason::SkippedBroadcast);
        }
        if self.filter.contains(&transmitter) {
            return Err(SkipReason::SkippedFiltered);
        }

        Ok(Observation::new(
            transmitter,
            time_base.timestamp_ms(header),
            radio.signal,
        ))
    }
}

/// Locate the transmitter address of an 802.11 frame.
pub fn transmitter_address(dot11: &[u8]) -> Result<MacAddr, SkipReason> {
    let fc = FrameControl::parse(dot11).ok_or(SkipReason::TooShortForHeader)?;

    match fc.frame_type {
        FrameType::Management | FrameType::Data => {
            if dot11.len() < MGMT_DATA_HEADER_LEN {
                return Err(SkipReason::TooShortForHeader);
            }
        }
        FrameType::Control => {
            if matches!(
                fc.subtype,
                SUBTYPE_CONTROL_WRAPPER | SUBTYPE_CTS | SUBTYPE_ACK
            ) {
                return Err(SkipReason::SkippedControlFrame);
            }
            if dot11.len() < CONTROL_HEADER_LEN {
                return Err(SkipReason::TooShortForHeader);
            }
        }
        FrameType::Extension => {
            return Err(SkipReason::UnhandledFrameType(3));
        }
    }

    MacAddr::from_slice(&dot11[ADDR2_OFFSET..ADDR2_OFFSET + MAC_LEN])
        .ok_or(SkipReason::TooShortForHeader)
}

fn align_up(offset: usize, align: usize) -> usize {
    (offset + align - 1) & !(align - 1)
}

fn read_u32_le(data: &[u8], offset: usize) -> Option<u32> {
    let bytes = data.get(offset..offset + 4)?;
    Some(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

/// Walk a radiotap header using its own declared length.
fn parse_declared_radiotap(frame: &[u8]) -> Result<RadioMetadata, SkipReason> {
    if frame.len() < RADIOTAP_PREAMBLE_LEN {
        return Err(SkipReason::TooShortForMetadata);
    }
    let version = frame[0];
    if version != 0 {
        return Err(SkipReason::UnsupportedMetadata(version));
    }
    let header_len = u16::from_le_bytes([frame[2], frame[3]]) as usize;
    if header_len < RADIOTAP_PREAMBLE_LEN || header_len > frame.len() {
        return Err(SkipReason::TooShortForMetadata);
    }
    let header = &frame[..header_len];

    let present = read_u32_le(header, 4).ok_or(SkipReason::TooShortForMetadata)?;

    // Skip any extended present words.
    let mut fields_start = RADIOTAP_PREAMBLE_LEN;
    let mut word = present;
    while word & RADIOTAP_PRESENT_EXT != 0 {
        word = read_u32_le(header, fields_start).ok_or(SkipReason::TooShortForMetadata)?;
        fields_start += 4;
    }

    let mut offset = fields_start;
    let mut signal = 0i8;
    for &(bit, size, align) in RADIOTAP_FIELDS {
        if present & (1 << bit) == 0 {
            continue;
        }
        offset = align_up(offset, align);
        if offset + size > header_len {
            break;
        }
        if bit == RADIOTAP_SIGNAL_BIT {
            signal = header[offset] as i8;
        }
        offset += size;
    }

    Ok(RadioMetadata { header_len, signal })
}

/// Running tally of one decode session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DecodeSummary {
    pub decoded: u64,
    pub skipped: BTreeMap<SkipReason, u64>,
}

impl DecodeSummary {
    pub fn record(&mut self, outcome: &Result<Observation, SkipReason>) {
        match outcome {
            Ok(_) => self.decoded += 1,
            Err(reason) => *self.skipped.entry(*reason).or_default() += 1,
        }
    }

    pub fn total_skipped(&self) -> u64 {
        self.skipped.values().sum()
    }
}
