//! Connection instrumentation
//!
//! Thin wrappers over the `metrics` facade so both adapters record the same
//! series. Every function compiles to nothing without the `metrics` feature.

use std::time::Duration;

/// A data message was written
#[inline]
pub fn message_sent(len: usize) {
    #[cfg(feature = "metrics")]
    {
        metrics::counter!("knsock_messages_sent_total").increment(1);
        metrics::counter!("knsock_bytes_sent_total").increment(len as u64);
    }
    #[cfg(not(feature = "metrics"))]
    let _ = len;
}

/// A data message was delivered to the caller
#[inline]
pub fn message_received(len: usize) {
    #[cfg(feature = "metrics")]
    {
        metrics::counter!("knsock_messages_received_total").increment(1);
        metrics::counter!("knsock_bytes_received_total").increment(len as u64);
    }
    #[cfg(not(feature = "metrics"))]
    let _ = len;
}

/// A handshake completed and a connection opened
#[inline]
pub fn connection_opened(handshake: Duration) {
    #[cfg(feature = "metrics")]
    {
        metrics::counter!("knsock_connections_opened_total").increment(1);
        metrics::histogram!("knsock_handshake_duration_seconds").record(handshake.as_secs_f64());
    }
    #[cfg(not(feature = "metrics"))]
    let _ = handshake;
}

/// A connection released its transport
#[inline]
pub fn connection_closed() {
    #[cfg(feature = "metrics")]
    metrics::counter!("knsock_connections_closed_total").increment(1);
}
