//! Server-wide session metrics.
//!
//! Metrics are the only state workers share with each other and with the
//! listener. Values are informational and never used to make admission
//! decisions (the session semaphore does that).
//!
//! # Metrics Families
//!
//! | Metric | Type | Labels |
//! |--------|------|--------|
//! | `npipe_sessions_active` | Gauge | |
//! | `npipe_connections_total` | Counter | `outcome` (`admitted`, `rejected`) |
//! | `npipe_sessions_ended_total` | Counter | `outcome` (`completed`, `failed`) |
//! | `npipe_messages_echoed_total` | Counter | |
//! | `npipe_bytes_echoed_total` | Counter | |
//!
//! Each server owns its registry, so several servers in one process (as in
//! the tests) never collide on metric names.

use std::fmt;
use std::sync::Arc;

use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};
use thiserror::Error;

/// Errors from building or exporting the metrics.
#[derive(Debug, Error)]
pub enum StatsError {
    /// Failed to register a metric with Prometheus.
    #[error("failed to register metric: {0}")]
    RegistrationFailed(#[from] prometheus::Error),

    /// Failed to encode metrics output.
    #[error("failed to encode metrics: {0}")]
    EncodingFailed(String),
}

/// Prometheus metrics for one server instance.
#[derive(Clone)]
pub struct ServerStats {
    registry: Registry,
    sessions_active: IntGauge,
    connections_total: IntCounterVec,
    sessions_ended_total: IntCounterVec,
    messages_echoed_total: IntCounter,
    bytes_echoed_total: IntCounter,
}

impl ServerStats {
    /// Create zeroed metrics in a fresh registry.
    ///
    /// # Errors
    ///
    /// Returns an error if a metric fails to register.
    pub fn new() -> Result<Self, StatsError> {
        let registry = Registry::new();

        let sessions_active = IntGauge::with_opts(Opts::new(
            "npipe_sessions_active",
            "Number of sessions currently being served",
        ))?;
        registry.register(Box::new(sessions_active.clone()))?;

        let connections_total = IntCounterVec::new(
            Opts::new(
                "npipe_connections_total",
                "Connections by access check outcome",
            ),
            &["outcome"],
        )?;
        registry.register(Box::new(connections_total.clone()))?;

        let sessions_ended_total = IntCounterVec::new(
            Opts::new("npipe_sessions_ended_total", "Finished sessions by outcome"),
            &["outcome"],
        )?;
        registry.register(Box::new(sessions_ended_total.clone()))?;

        let messages_echoed_total = IntCounter::with_opts(Opts::new(
            "npipe_messages_echoed_total",
            "Messages echoed across all sessions",
        ))?;
        registry.register(Box::new(messages_echoed_total.clone()))?;

        let bytes_echoed_total = IntCounter::with_opts(Opts::new(
            "npipe_bytes_echoed_total",
            "Payload bytes echoed across all sessions",
        ))?;
        registry.register(Box::new(bytes_echoed_total.clone()))?;

        Ok(Self {
            registry,
            sessions_active,
            connections_total,
            sessions_ended_total,
            messages_echoed_total,
            bytes_echoed_total,
        })
    }

    // ========================================================================
    // Admission
    // ========================================================================

    /// Record a connection refused by the security descriptor.
    pub fn record_rejected(&self) {
        self.connections_total.with_label_values(&["rejected"]).inc();
    }

    /// Record an admitted connection and mark it active until the returned
    /// guard is dropped.
    #[must_use]
    pub fn admit(self: &Arc<Self>) -> ActiveSession {
        self.connections_total.with_label_values(&["admitted"]).inc();
        self.sessions_active.inc();
        ActiveSession {
            stats: Arc::clone(self),
        }
    }

    // ========================================================================
    // Session Outcomes
    // ========================================================================

    /// Add the totals of a finished session.
    pub fn record_echoes(&self, messages: u64, bytes: u64) {
        self.messages_echoed_total.inc_by(messages);
        self.bytes_echoed_total.inc_by(bytes);
    }

    /// Record how a session ended.
    pub fn record_end(&self, failed: bool) {
        let outcome = if failed { "failed" } else { "completed" };
        self.sessions_ended_total.with_label_values(&[outcome]).inc();
    }

    // ========================================================================
    // Export
    // ========================================================================

    /// Point-in-time copy of all metrics.
    #[must_use]
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            admitted: self.connections_total.with_label_values(&["admitted"]).get(),
            rejected: self.connections_total.with_label_values(&["rejected"]).get(),
            active: u64::try_from(self.sessions_active.get()).unwrap_or(0),
            completed: self.sessions_ended_total.with_label_values(&["completed"]).get(),
            failed: self.sessions_ended_total.with_label_values(&["failed"]).get(),
            messages_echoed: self.messages_echoed_total.get(),
            bytes_echoed: self.bytes_echoed_total.get(),
        }
    }

    /// Encode every metric in the Prometheus text exposition format.
    ///
    /// # Errors
    ///
    /// Returns [`StatsError::EncodingFailed`] if encoding fails.
    pub fn encode_text(&self) -> Result<String, StatsError> {
        let mut buffer = Vec::new();
        TextEncoder::new()
            .encode(&self.registry.gather(), &mut buffer)
            .map_err(|e| StatsError::EncodingFailed(e.to_string()))?;
        String::from_utf8(buffer).map_err(|e| StatsError::EncodingFailed(e.to_string()))
    }
}

impl fmt::Debug for ServerStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ServerStats").field(&self.snapshot()).finish()
    }
}

/// Marks one session as active for as long as it lives.
#[derive(Debug)]
pub struct ActiveSession {
    stats: Arc<ServerStats>,
}

impl Drop for ActiveSession {
    fn drop(&mut self) {
        self.stats.sessions_active.dec();
    }
}

/// Copy of [`ServerStats`] at one instant.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    /// Connections that passed the access check.
    pub admitted: u64,
    /// Connections refused by the access check.
    pub rejected: u64,
    /// Sessions currently being served.
    pub active: u64,
    /// Sessions that ended normally (disconnect or shutdown).
    pub completed: u64,
    /// Sessions that ended with an error or were force-closed.
    pub failed: u64,
    /// Messages echoed across all sessions.
    pub messages_echoed: u64,
    /// Payload bytes echoed across all sessions.
    pub bytes_echoed: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_active_gauge_follows_guard() {
        let stats = Arc::new(ServerStats::new().unwrap());

        let a = stats.admit();
        let b = stats.admit();
        assert_eq!(stats.snapshot().active, 2);
        assert_eq!(stats.snapshot().admitted, 2);

        drop(a);
        assert_eq!(stats.snapshot().active, 1);
        drop(b);
        assert_eq!(stats.snapshot().active, 0);
        assert_eq!(stats.snapshot().admitted, 2);
    }

    #[test]
    fn test_outcome_counters() {
        let stats = ServerStats::new().unwrap();
        stats.record_rejected();
        stats.record_echoes(2, 5);
        stats.record_end(false);
        stats.record_end(true);

        let snap = stats.snapshot();
        assert_eq!(snap.rejected, 1);
        assert_eq!(snap.messages_echoed, 2);
        assert_eq!(snap.bytes_echoed, 5);
        assert_eq!(snap.completed, 1);
        assert_eq!(snap.failed, 1);
    }

    #[test]
    fn test_encode_text_exports_families() {
        let stats = Arc::new(ServerStats::new().unwrap());
        let _session = stats.admit();
        stats.record_rejected();
        stats.record_echoes(3, 12);

        let text = stats.encode_text().unwrap();
        assert!(text.contains("npipe_sessions_active 1"));
        assert!(text.contains(r#"npipe_connections_total{outcome="admitted"} 1"#));
        assert!(text.contains(r#"npipe_connections_total{outcome="rejected"} 1"#));
        assert!(text.contains("npipe_messages_echoed_total 3"));
        assert!(text.contains("npipe_bytes_echoed_total 12"));
    }

    #[test]
    fn test_servers_keep_separate_registries() {
        let first = ServerStats::new().unwrap();
        let second = ServerStats::new().unwrap();
        first.record_rejected();
        assert_eq!(first.snapshot().rejected, 1);
        assert_eq!(second.snapshot().rejected, 0);
    }
}
