//! Message envelopes and broker-level headers.

use std::time::Instant;

use indexmap::IndexMap;
use serde_json::Value;

/// Retry attempt counter, incremented on each republication.
pub const RETRY_COUNT_HEADER: &str = "x-retry-count";
/// Kind of the last error that caused a retry or dead-lettering.
pub const LAST_ERROR_HEADER: &str = "x-last-error";
/// Worker that last handled the message.
pub const CONSUMER_ID_HEADER: &str = "x-consumer-id";

/// Broker-level header map. Values are JSON scalars.
pub type Headers = IndexMap<String, Value>;

/// A message as held by the broker: opaque payload bytes plus headers.
/// Retry republication preserves the payload bytes untouched.
#[derive(Debug, Clone)]
pub struct Envelope {
    pub payload: Vec<u8>,
    pub headers: Headers,
    pub persistent: bool,
    pub(crate) enqueued_at: Instant,
}

impl Envelope {
    pub fn new(payload: Vec<u8>, headers: Headers, persistent: bool) -> Self {
        Self {
            payload,
            headers,
            persistent,
            enqueued_at: Instant::now(),
        }
    }
}

/// Read the retry count from a header map.
pub fn retry_count(headers: &Headers) -> u64 {
    headers
        .get(RETRY_COUNT_HEADER)
        .and_then(Value::as_u64)
        .unwrap_or(0)
}
