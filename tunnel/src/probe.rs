use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// A byte counter shared between the loops of a flow.
///
/// Incrementing never blocks; readers see a monotonically increasing value.
#[derive(Clone, Debug, Default)]
pub struct Probe(Arc<AtomicU64>);

impl Probe {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn increment(&self, bytes: u64) {
        self.0.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn value(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Bytes-in/bytes-out counters for one flow, per direction.
#[derive(Clone, Debug, Default)]
pub struct FlowProbes {
    /// Bytes read from the local endpoint and framed onto the stream.
    pub conn_to_stream: Probe,
    /// Bytes received from the stream and written to the local endpoint.
    pub stream_to_conn: Probe,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_across_clones() {
        let probe = Probe::new();
        let clone = probe.clone();

        probe.increment(3);
        clone.increment(4);

        assert_eq!(probe.value(), 7);
    }
}
