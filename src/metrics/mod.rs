//! Connection metrics
//!
//! Thin wrappers over the `metrics` facade so call sites stay one line. Nothing
//! is recorded unless the application installs a recorder.

/// Counter metrics
pub mod counters {
    /// A connect attempt to one candidate finished (`ok`, `failed`)
    pub fn connect_attempt(outcome: &'static str) {
        ::metrics::counter!("mailwire_connect_attempts_total", "outcome" => outcome).increment(1);
    }

    /// A TLS handshake finished (`ok`, `handshake_error`, `verify_error`)
    pub fn tls_handshake(outcome: &'static str) {
        ::metrics::counter!("mailwire_tls_handshakes_total", "outcome" => outcome).increment(1);
    }

    /// Application bytes delivered into the read buffer
    pub fn bytes_read(n: usize) {
        ::metrics::counter!("mailwire_bytes_read_total").increment(n as u64);
    }

    /// Bytes accepted by the transport
    pub fn bytes_written(n: usize) {
        ::metrics::counter!("mailwire_bytes_written_total").increment(n as u64);
    }

    /// Data had to be queued behind back-pressure
    pub fn write_queued() {
        ::metrics::counter!("mailwire_writes_queued_total").increment(1);
    }

    /// A failure was reported to the caller
    pub fn failure(category: &'static str) {
        ::metrics::counter!("mailwire_failures_total", "category" => category).increment(1);
    }
}
