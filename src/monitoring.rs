//! Observability sink: the event surface a node reports consensus and
//! network activity to. Grounded on `original_source/blockchain_sim/core/monitoring.py`'s
//! `Monitoring` class, with the Django ORM persistence (`NodeModel`,
//! `MetricLog`, `NetworkEvent`) left out — this crate is not responsible
//! for shipping a dashboard, only for emitting structured events an
//! external collector can subscribe to.

use crate::identity::NodeId;

/// Direction of a peer-to-peer message, for [`MonitoringSink::record_p2p_event`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    Sent,
    Received,
}

/// Everything a node reports to an external observer over its lifetime.
/// `TracingMonitor` is the only implementation this crate ships, but the
/// trait exists so a simulation driver can plug in a different collector
/// (an in-memory counter for tests, say) without touching `Node`.
pub trait MonitoringSink: Send + Sync {
    fn record_block_committed(&self, node_id: NodeId, block_index: u64);
    fn record_block_produced(&self, node_id: NodeId, block_index: u64);
    fn record_pbft_prepare(&self, node_id: NodeId, block_index: u64, quorum: bool);
    fn record_pbft_commit(&self, node_id: NodeId, block_index: u64, quorum: bool);
    fn record_sync_event(&self, node_id: NodeId, event_info: &str);
    fn record_p2p_event(&self, node_id: NodeId, peer_id: NodeId, msg_type: &str, direction: Direction);
    fn record_message(&self, node_id: NodeId, msg_type: &str, sent: u64, recv: u64, dropped: u64, bytes_count: u64);
    fn record_latency(&self, node_id: NodeId, latency_seconds: f64);
    fn record_trade_success(&self, node_id: NodeId, count: u64);
    fn record_trade_failure(&self, node_id: NodeId, count: u64);
    fn record_trade_confirmation(&self, node_id: NodeId, tx_hash: &str, confirmation_time: f64);
    fn record_fork_event(&self, node_id: NodeId, fork_info: &str);
    fn raise_alert(&self, node_id: NodeId, message: &str, severity: AlertSeverity);
}

/// Severity of an alert raised via [`MonitoringSink::raise_alert`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AlertSeverity {
    Warning,
    Critical,
}

/// Emits every event as a structured `tracing` record at an appropriate
/// level, in place of the source's logging-plus-ORM-write combination.
#[derive(Debug, Default)]
pub struct TracingMonitor;

impl TracingMonitor {
    pub fn new() -> Self {
        Self
    }
}

impl MonitoringSink for TracingMonitor {
    fn record_block_committed(&self, node_id: NodeId, block_index: u64) {
        tracing::info!(node_id, block_index, "block committed");
    }

    fn record_block_produced(&self, node_id: NodeId, block_index: u64) {
        tracing::info!(node_id, block_index, "block proposed");
    }

    fn record_pbft_prepare(&self, node_id: NodeId, block_index: u64, quorum: bool) {
        if quorum {
            tracing::info!(node_id, block_index, "pbft prepare quorum reached");
        } else {
            tracing::debug!(node_id, block_index, "pbft prepare sent");
        }
    }

    fn record_pbft_commit(&self, node_id: NodeId, block_index: u64, quorum: bool) {
        if quorum {
            tracing::info!(node_id, block_index, "pbft commit quorum reached");
        } else {
            tracing::debug!(node_id, block_index, "pbft commit sent");
        }
    }

    fn record_sync_event(&self, node_id: NodeId, event_info: &str) {
        tracing::info!(node_id, event_info, "sync");
    }

    fn record_p2p_event(&self, node_id: NodeId, peer_id: NodeId, msg_type: &str, direction: Direction) {
        match direction {
            Direction::Sent => tracing::debug!(node_id, peer_id, msg_type, "sent"),
            Direction::Received => tracing::debug!(node_id, peer_id, msg_type, "received"),
        }
    }

    fn record_message(&self, node_id: NodeId, msg_type: &str, sent: u64, recv: u64, dropped: u64, bytes_count: u64) {
        tracing::trace!(node_id, msg_type, sent, recv, dropped, bytes_count, "message counters");
    }

    fn record_latency(&self, node_id: NodeId, latency_seconds: f64) {
        tracing::debug!(node_id, latency_seconds, "round latency");
    }

    fn record_trade_success(&self, node_id: NodeId, count: u64) {
        tracing::info!(node_id, count, "trade success");
    }

    fn record_trade_failure(&self, node_id: NodeId, count: u64) {
        tracing::warn!(node_id, count, "trade failure");
    }

    fn record_trade_confirmation(&self, node_id: NodeId, tx_hash: &str, confirmation_time: f64) {
        tracing::debug!(node_id, tx_hash, confirmation_time, "trade confirmed");
    }

    fn record_fork_event(&self, node_id: NodeId, fork_info: &str) {
        tracing::warn!(node_id, fork_info, "fork detected");
    }

    fn raise_alert(&self, node_id: NodeId, message: &str, severity: AlertSeverity) {
        match severity {
            AlertSeverity::Warning => tracing::warn!(node_id, message, "alert"),
            AlertSeverity::Critical => tracing::error!(node_id, message, "alert"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tracing_monitor_does_not_panic_on_any_event() {
        let monitor = TracingMonitor::new();
        monitor.record_block_committed(0, 1);
        monitor.record_block_produced(0, 1);
        monitor.record_pbft_prepare(0, 1, false);
        monitor.record_pbft_commit(0, 1, true);
        monitor.record_sync_event(0, "caught up to tip 5");
        monitor.record_p2p_event(0, 1, "transaction", Direction::Sent);
        monitor.record_message(0, "block", 1, 0, 0, 128);
        monitor.record_latency(0, 0.042);
        monitor.record_trade_success(0, 1);
        monitor.record_trade_failure(0, 1);
        monitor.record_trade_confirmation(0, "deadbeef", 1_700_000_000.0);
        monitor.record_fork_event(0, "fork at block 4");
        monitor.raise_alert(0, "message rejected", AlertSeverity::Warning);
    }
}
