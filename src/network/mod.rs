//! Fault-injecting TCP transport between simulated nodes.
//!
//! One message per connection: the sender writes a JSON envelope and
//! closes its half of the socket, the receiver reads to EOF before
//! parsing. See `original_source/blockchain_sim/core/network.py`.

pub mod fault;

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::sleep;

use crate::config::{AttackConfig, NetworkConfig};
use crate::identity::NodeId;
use crate::monitoring::{Direction, MonitoringSink};
use fault::{FaultInjector, FaultOutcome};

const BIND_RETRIES: u32 = 5;

/// A peer's known listen address.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PeerInfo {
    pub node_id: NodeId,
    pub ip: String,
    pub port: u16,
}

/// Outer wire envelope: a message kind, a freeform JSON payload, and the
/// id of the node that sent it.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: String,
    pub payload: serde_json::Value,
    pub sender_id: NodeId,
}

impl Envelope {
    pub fn new(kind: impl Into<String>, payload: serde_json::Value, sender_id: NodeId) -> Self {
        Self {
            kind: kind.into(),
            payload,
            sender_id,
        }
    }
}

/// Everything a [`Network`] needs to hand an inbound message to its
/// owning node. Implemented by `Node`; kept as a trait (rather than a
/// direct dependency) so this module never needs to know about `node`.
pub trait MessageSink: Send + Sync + 'static {
    fn receive_transaction(&self, payload: serde_json::Value) -> impl Future<Output = ()> + Send;
    fn receive_block(&self, payload: serde_json::Value) -> impl Future<Output = ()> + Send;
    fn handle_sync_request(
        &self,
        payload: serde_json::Value,
        sender_id: NodeId,
    ) -> impl Future<Output = ()> + Send;
    fn handle_sync_response(&self, payload: serde_json::Value) -> impl Future<Output = ()> + Send;
    fn receive_consensus_message(
        &self,
        kind: &str,
        payload: serde_json::Value,
    ) -> impl Future<Output = ()> + Send;
}

struct Inner<S: MessageSink> {
    node_id: NodeId,
    node: S,
    peers: Vec<PeerInfo>,
    listen_ip: String,
    listen_port: u16,
    fault: FaultInjector,
    socket_timeout: Duration,
    running: AtomicBool,
    monitoring: Option<Arc<dyn MonitoringSink>>,
}

/// Handle to a running (or not-yet-started) transport for one node.
/// Cheap to clone: everything lives behind the inner `Arc`.
pub struct Network<S: MessageSink> {
    inner: Arc<Inner<S>>,
}

impl<S: MessageSink> Clone for Network<S> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<S: MessageSink> Network<S> {
    pub fn new(
        node_id: NodeId,
        node: S,
        peers: Vec<PeerInfo>,
        listen_ip: String,
        listen_port: u16,
        attack_config: AttackConfig,
        socket_timeout: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                node_id,
                node,
                peers,
                listen_ip,
                listen_port,
                fault: FaultInjector::new(attack_config),
                socket_timeout,
                running: AtomicBool::new(false),
                monitoring: None,
            }),
        }
    }

    /// Attaches a monitoring sink used to record message and
    /// peer-to-peer counters, mirroring `Network.monitoring` in the
    /// source (set separately from construction there too).
    pub fn with_monitoring(mut self, monitoring: Arc<dyn MonitoringSink>) -> Self {
        let inner = Arc::get_mut(&mut self.inner)
            .expect("with_monitoring must be called before the network is cloned/started");
        inner.monitoring = Some(monitoring);
        self
    }

    /// Binds the listener (retrying up to [`BIND_RETRIES`] times, 1s
    /// apart) and spawns the accept loop and, if enabled, the periodic
    /// replay task.
    pub async fn start(&self) -> Result<(), crate::error::CoreError> {
        self.inner.running.store(true, Ordering::SeqCst);
        let addr = format!("{}:{}", self.inner.listen_ip, self.inner.listen_port);

        let mut last_err = None;
        let mut listener = None;
        for attempt in 0..BIND_RETRIES {
            match TcpListener::bind(&addr).await {
                Ok(l) => {
                    listener = Some(l);
                    break;
                }
                Err(e) => {
                    tracing::warn!(
                        node_id = self.inner.node_id,
                        attempt,
                        error = %e,
                        "failed to bind listener, retrying"
                    );
                    last_err = Some(e);
                    sleep(Duration::from_secs(1)).await;
                }
            }
        }
        let listener = listener.ok_or_else(|| crate::error::CoreError::ListenerBindExhausted {
            addr: addr.clone(),
            source: last_err.expect("loop only exits without a listener if an error was recorded"),
        })?;

        tracing::info!(node_id = self.inner.node_id, %addr, "listening");

        let accept_net = self.clone();
        tokio::spawn(async move {
            accept_net.accept_loop(listener).await;
        });

        if self.inner.fault.replay_enabled() {
            let replay_net = self.clone();
            tokio::spawn(async move {
                replay_net.replay_loop().await;
            });
        }

        Ok(())
    }

    pub fn stop(&self) {
        self.inner.running.store(false, Ordering::SeqCst);
    }

    async fn accept_loop(&self, listener: TcpListener) {
        while self.inner.running.load(Ordering::SeqCst) {
            match listener.accept().await {
                Ok((socket, _)) => {
                    let net = self.clone();
                    tokio::spawn(async move {
                        net.handle_client(socket).await;
                    });
                }
                Err(e) => {
                    tracing::warn!(node_id = self.inner.node_id, error = %e, "accept failed");
                    break;
                }
            }
        }
    }

    async fn handle_client(&self, mut socket: TcpStream) {
        let mut data = Vec::new();
        if let Err(e) = socket.read_to_end(&mut data).await {
            tracing::warn!(node_id = self.inner.node_id, error = %e, "failed reading client data");
            return;
        }
        if data.is_empty() {
            return;
        }
        match serde_json::from_slice::<Envelope>(&data) {
            Ok(envelope) => {
                if let Some(monitoring) = &self.inner.monitoring {
                    monitoring.record_message(self.inner.node_id, &envelope.kind, 0, 1, 0, data.len() as u64);
                    monitoring.record_p2p_event(
                        self.inner.node_id,
                        envelope.sender_id,
                        &envelope.kind,
                        Direction::Received,
                    );
                }
                self.process_envelope(envelope).await
            }
            Err(_) => {
                tracing::warn!(node_id = self.inner.node_id, "received invalid JSON message");
                if let Some(monitoring) = &self.inner.monitoring {
                    monitoring.record_message(self.inner.node_id, "invalid_json", 0, 0, 1, data.len() as u64);
                }
            }
        }
    }

    /// Runs fault injection, then dispatches an admitted envelope to the
    /// owning node by message kind.
    async fn process_envelope(&self, envelope: Envelope) {
        let sender_id = envelope.sender_id;
        let envelope = match self.inner.fault.process(self.inner.node_id, envelope).await {
            FaultOutcome::Admit(envelope) => envelope,
            FaultOutcome::Dropped => return,
        };

        match envelope.kind.as_str() {
            "transaction" => self.inner.node.receive_transaction(envelope.payload).await,
            "block" => self.inner.node.receive_block(envelope.payload).await,
            "sync_request" => {
                self.inner
                    .node
                    .handle_sync_request(envelope.payload, sender_id)
                    .await
            }
            "sync_response" => self.inner.node.handle_sync_response(envelope.payload).await,
            kind if kind.ends_with("_message") => {
                self.inner.node.receive_consensus_message(kind, envelope.payload).await
            }
            other => {
                tracing::warn!(
                    node_id = self.inner.node_id,
                    kind = other,
                    "unknown or unsupported message type"
                );
            }
        }
    }

    async fn replay_loop(&self) {
        while self.inner.running.load(Ordering::SeqCst) {
            if let Some(envelope) = self.inner.fault.sample_replay().await {
                tracing::info!(
                    node_id = self.inner.node_id,
                    kind = %envelope.kind,
                    "replaying cached message"
                );
                self.process_envelope(envelope).await;
            }
            let delay = rand::random::<f64>() * 10.0 + 5.0;
            sleep(Duration::from_secs_f64(delay)).await;
        }
    }

    /// Sends one envelope to `peer`: connect (bounded by the configured
    /// socket timeout), write the JSON payload, then close.
    async fn send_to(&self, peer: &PeerInfo, envelope: &Envelope) {
        let addr = format!("{}:{}", peer.ip, peer.port);
        let connect = tokio::time::timeout(self.inner.socket_timeout, TcpStream::connect(&addr));
        let mut stream = match connect.await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                tracing::warn!(
                    node_id = self.inner.node_id,
                    peer = peer.node_id,
                    %addr,
                    error = %e,
                    "failed to connect to peer"
                );
                return;
            }
            Err(_) => {
                tracing::warn!(
                    node_id = self.inner.node_id,
                    peer = peer.node_id,
                    %addr,
                    "timed out connecting to peer"
                );
                return;
            }
        };

        let body = match serde_json::to_vec(envelope) {
            Ok(body) => body,
            Err(e) => {
                tracing::error!(error = %e, "failed to serialize outgoing envelope");
                return;
            }
        };
        if let Err(e) = stream.write_all(&body).await {
            tracing::warn!(
                node_id = self.inner.node_id,
                peer = peer.node_id,
                error = %e,
                "failed to send message to peer"
            );
            if let Some(monitoring) = &self.inner.monitoring {
                monitoring.record_message(self.inner.node_id, &envelope.kind, 0, 0, 1, 0);
            }
            return;
        }
        let _ = stream.shutdown().await;

        if let Some(monitoring) = &self.inner.monitoring {
            monitoring.record_message(self.inner.node_id, &envelope.kind, 1, 0, 0, body.len() as u64);
            monitoring.record_p2p_event(self.inner.node_id, peer.node_id, &envelope.kind, Direction::Sent);
        }
    }

    /// Sends `envelope` to every peer not currently partitioned away
    /// from this node. A peer is skipped (and counted as `dropped`)
    /// either because the peer itself is partitioned or because this
    /// node is; this is the broadcast-side check, separate from the
    /// receive-side partition filter in `fault.rs`.
    async fn broadcast(&self, envelope: Envelope) {
        let self_partitioned = self.inner.fault.is_partitioned(self.inner.node_id);
        for peer in &self.inner.peers {
            if self_partitioned || self.inner.fault.is_partitioned(peer.node_id) {
                tracing::info!(
                    node_id = self.inner.node_id,
                    peer = peer.node_id,
                    "skipping partitioned peer on broadcast"
                );
                if let Some(monitoring) = &self.inner.monitoring {
                    monitoring.record_message(self.inner.node_id, &envelope.kind, 0, 0, 1, 0);
                }
                continue;
            }
            self.send_to(peer, &envelope).await;
        }
    }

    pub async fn broadcast_transaction(&self, payload: serde_json::Value) {
        self.broadcast(Envelope::new("transaction", payload, self.inner.node_id))
            .await;
    }

    pub async fn broadcast_block(&self, payload: serde_json::Value) {
        self.broadcast(Envelope::new("block", payload, self.inner.node_id))
            .await;
    }

    pub async fn broadcast_pbft_message(&self, payload: serde_json::Value) {
        self.broadcast(Envelope::new("pbft_message", payload, self.inner.node_id))
            .await;
    }

    pub async fn broadcast_poa_message(&self, payload: serde_json::Value) {
        self.broadcast(Envelope::new("poa_message", payload, self.inner.node_id))
            .await;
    }

    pub async fn broadcast_pos_message(&self, payload: serde_json::Value) {
        self.broadcast(Envelope::new("pos_message", payload, self.inner.node_id))
            .await;
    }

    pub async fn broadcast_sync_request(&self, start_index: u64, end_index: u64) {
        let payload = serde_json::json!({ "start": start_index, "end": end_index });
        self.broadcast(Envelope::new("sync_request", payload, self.inner.node_id))
            .await;
    }

    pub async fn send_sync_response(&self, target_node_id: NodeId, blocks: serde_json::Value) {
        if let Some(peer) = self.inner.peers.iter().find(|p| p.node_id == target_node_id) {
            let envelope = Envelope::new("sync_response", blocks, self.inner.node_id);
            self.send_to(peer, &envelope).await;
        }
    }

    /// Merges a runtime network-condition override into the fault
    /// injector, matching `Network.update_config`.
    pub async fn update_network_config(&self, update: NetworkConfig) {
        self.inner.fault.update_config(update).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingSink {
        received: Mutex<Vec<String>>,
    }

    impl MessageSink for Arc<RecordingSink> {
        async fn receive_transaction(&self, _payload: serde_json::Value) {
            self.received.lock().unwrap().push("transaction".into());
        }
        async fn receive_block(&self, _payload: serde_json::Value) {
            self.received.lock().unwrap().push("block".into());
        }
        async fn handle_sync_request(&self, _payload: serde_json::Value, _sender_id: NodeId) {
            self.received.lock().unwrap().push("sync_request".into());
        }
        async fn handle_sync_response(&self, _payload: serde_json::Value) {
            self.received.lock().unwrap().push("sync_response".into());
        }
        async fn receive_consensus_message(&self, kind: &str, _payload: serde_json::Value) {
            self.received.lock().unwrap().push(kind.to_string());
        }
    }

    fn test_network() -> (Network<Arc<RecordingSink>>, Arc<RecordingSink>) {
        let sink = Arc::new(RecordingSink::default());
        let net = Network::new(
            0,
            sink.clone(),
            Vec::new(),
            "127.0.0.1".to_string(),
            0,
            AttackConfig::default(),
            Duration::from_secs(2),
        );
        (net, sink)
    }

    #[tokio::test]
    async fn dispatches_transaction_by_kind() {
        let (net, sink) = test_network();
        net.process_envelope(Envelope::new("transaction", serde_json::json!({}), 1))
            .await;
        assert_eq!(sink.received.lock().unwrap().as_slice(), ["transaction"]);
    }

    #[tokio::test]
    async fn dispatches_suffixed_consensus_message() {
        let (net, sink) = test_network();
        net.process_envelope(Envelope::new("pbft_message", serde_json::json!({}), 1))
            .await;
        assert_eq!(sink.received.lock().unwrap().as_slice(), ["pbft_message"]);
    }

    #[tokio::test]
    async fn partitioned_message_is_never_dispatched() {
        let sink = Arc::new(RecordingSink::default());
        let net = Network::new(
            0,
            sink.clone(),
            Vec::new(),
            "127.0.0.1".to_string(),
            0,
            AttackConfig {
                partition_nodes: vec![1],
                ..AttackConfig::default()
            },
            Duration::from_secs(2),
        );
        net.process_envelope(Envelope::new("transaction", serde_json::json!({}), 1))
            .await;
        assert!(sink.received.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn unknown_kind_is_not_dispatched_but_does_not_panic() {
        let (net, sink) = test_network();
        net.process_envelope(Envelope::new("greeting", serde_json::json!({}), 1))
            .await;
        assert!(sink.received.lock().unwrap().is_empty());
    }

    #[derive(Default)]
    struct CountingMonitor {
        dropped: std::sync::atomic::AtomicU64,
    }

    impl MonitoringSink for CountingMonitor {
        fn record_block_committed(&self, _node_id: NodeId, _block_index: u64) {}
        fn record_block_produced(&self, _node_id: NodeId, _block_index: u64) {}
        fn record_pbft_prepare(&self, _node_id: NodeId, _block_index: u64, _quorum: bool) {}
        fn record_pbft_commit(&self, _node_id: NodeId, _block_index: u64, _quorum: bool) {}
        fn record_sync_event(&self, _node_id: NodeId, _event_info: &str) {}
        fn record_p2p_event(&self, _node_id: NodeId, _peer_id: NodeId, _msg_type: &str, _direction: Direction) {}
        fn record_message(&self, _node_id: NodeId, _msg_type: &str, _sent: u64, _recv: u64, dropped: u64, _bytes_count: u64) {
            self.dropped.fetch_add(dropped, Ordering::SeqCst);
        }
        fn record_latency(&self, _node_id: NodeId, _latency_seconds: f64) {}
        fn record_trade_success(&self, _node_id: NodeId, _count: u64) {}
        fn record_trade_failure(&self, _node_id: NodeId, _count: u64) {}
        fn record_trade_confirmation(&self, _node_id: NodeId, _tx_hash: &str, _confirmation_time: f64) {}
        fn record_fork_event(&self, _node_id: NodeId, _fork_info: &str) {}
        fn raise_alert(&self, _node_id: NodeId, _message: &str, _severity: crate::monitoring::AlertSeverity) {}
    }

    #[tokio::test]
    async fn broadcast_skips_partitioned_peer_and_records_dropped() {
        let sink = Arc::new(RecordingSink::default());
        let monitoring = Arc::new(CountingMonitor::default());
        let net = Network::new(
            0,
            sink,
            vec![PeerInfo { node_id: 1, ip: "127.0.0.1".to_string(), port: 1 }],
            "127.0.0.1".to_string(),
            0,
            AttackConfig {
                partition_nodes: vec![1],
                ..AttackConfig::default()
            },
            Duration::from_secs(2),
        )
        .with_monitoring(monitoring.clone());

        net.broadcast_transaction(serde_json::json!({})).await;
        assert_eq!(monitoring.dropped.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn broadcast_skips_all_peers_when_self_partitioned() {
        let sink = Arc::new(RecordingSink::default());
        let monitoring = Arc::new(CountingMonitor::default());
        let net = Network::new(
            0,
            sink,
            vec![
                PeerInfo { node_id: 1, ip: "127.0.0.1".to_string(), port: 1 },
                PeerInfo { node_id: 2, ip: "127.0.0.1".to_string(), port: 2 },
            ],
            "127.0.0.1".to_string(),
            0,
            AttackConfig {
                partition_nodes: vec![0],
                ..AttackConfig::default()
            },
            Duration::from_secs(2),
        )
        .with_monitoring(monitoring.clone());

        net.broadcast_transaction(serde_json::json!({})).await;
        assert_eq!(monitoring.dropped.load(Ordering::SeqCst), 2);
    }
}
