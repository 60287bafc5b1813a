//! Correlation ids for administrative requests.

use std::fmt;

/// Opaque request correlation token.
///
/// Rendered as the hex encoding of a big-endian u64 so ids read in
/// counting order.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RequestId(String);

impl RequestId {
    pub fn from_counter(value: u64) -> Self {
        Self(hex::encode(value.to_be_bytes()))
    }

    /// Wrap an id received from a peer.
    pub fn from_wire(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Monotonic source of request ids for daemon-originated requests.
#[derive(Debug, Default)]
pub struct RequestIdGenerator {
    next: u64,
}

impl RequestIdGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_id(&mut self) -> RequestId {
        let id = RequestId::from_counter(self.next);
        self.next += 1;
        id
    }
}
