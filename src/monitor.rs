//! UDP listener for WSJT-X telegrams.
//!
//! Receives telegrams from a WSJT-X instance, answers heartbeats, turns
//! every new on-air Decode into an [`EnrichedMessage`] and queues it for
//! delivery.

use anyhow::{Context, Result};
use chrono::Utc;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::cty::CountryTable;
use crate::delivery::{Enqueued, MessageSender};
use crate::message::EnrichedMessage;
use crate::stats::PipelineStats;
use crate::telegram::{Body, DEFAULT_CLIENT_ID, Decode, Telegram};

/// Default listen address; WSJT-X sends to localhost.
pub const DEFAULT_ADDRESS: &str = "127.0.0.1";

/// Default WSJT-X UDP server port.
pub const DEFAULT_PORT: u16 = 2237;

/// Largest datagram accepted.
pub const MAX_DATAGRAM: usize = 4096;

/// Settings for the UDP monitor.
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    /// Address to bind.
    pub address: String,

    /// UDP port to bind.
    pub port: u16,

    /// Client id announced in our heartbeats.
    pub client_id: String,

    /// Version string announced in our heartbeats.
    pub version: String,

    /// Serve only the WSJT-X instance with this client id instead of the
    /// first sender.
    pub peer_client_id: Option<String>,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            address: DEFAULT_ADDRESS.to_string(),
            port: DEFAULT_PORT,
            client_id: DEFAULT_CLIENT_ID.to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            peer_client_id: None,
        }
    }
}

/// Whether the receive loop keeps going after a telegram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Stop,
}

pub struct Monitor {
    config: MonitorConfig,
    socket: UdpSocket,
    table: Arc<CountryTable>,
    queue: MessageSender,
    stats: Arc<PipelineStats>,
    /// Address of the WSJT-X instance we serve.
    peer: Option<SocketAddr>,
    /// First address seen for each client id.
    clients: HashMap<String, SocketAddr>,
    heartbeat_sent: bool,
}

impl Monitor {
    pub async fn bind(
        config: MonitorConfig,
        table: Arc<CountryTable>,
        queue: MessageSender,
        stats: Arc<PipelineStats>,
    ) -> Result<Self> {
        let addr = format!("{}:{}", config.address, config.port);
        let socket = UdpSocket::bind(&addr)
            .await
            .with_context(|| format!("Failed to bind UDP socket on {addr}"))?;
        info!("Listening for WSJT-X telegrams on {}", socket.local_addr()?);

        Ok(Self {
            config,
            socket,
            table,
            queue,
            stats,
            peer: None,
            clients: HashMap::new(),
            heartbeat_sent: false,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// Make the WSJT-X instance registered under `client_id` the peer.
    ///
    /// Returns false if that client has not been seen.
    pub(crate) fn set_peer(&mut self, client_id: &str) -> bool {
        match self.clients.get(client_id) {
            Some(addr) => {
                self.peer = Some(*addr);
                true
            }
            None => false,
        }
    }

    /// Receive telegrams until shutdown is signalled or the peer closes.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let mut buf = vec![0u8; MAX_DATAGRAM];

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Monitor shutting down");
                        break;
                    }
                }
                received = self.socket.recv_from(&mut buf) => {
                    let (len, from) = received.context("UDP receive failed")?;
                    if self.handle_datagram(&buf[..len], from).await? == Flow::Stop {
                        break;
                    }
                }
            }
        }
        Ok(())
    }

    async fn handle_datagram(&mut self, bytes: &[u8], from: SocketAddr) -> Result<Flow> {
        self.stats.record_datagram(bytes.len());

        let telegram = match Telegram::decode(bytes) {
            Ok(t) => t,
            Err(e) => {
                self.stats.record_decode_error();
                debug!("Dropping {} byte datagram from {}: {}", bytes.len(), from, e);
                return Ok(Flow::Continue);
            }
        };

        if let Some(id) = &telegram.header.client_id {
            self.clients.entry(id.clone()).or_insert(from);
        }
        let peer = match self.config.peer_client_id.clone() {
            Some(wanted) => {
                if self.peer.is_none() && self.set_peer(&wanted) {
                    info!("Serving WSJT-X client '{}' at {}", wanted, from);
                }
                self.peer
            }
            None => Some(*self.peer.get_or_insert(from)),
        };
        let Some(peer) = peer.filter(|&peer| peer == from) else {
            debug!("Ignoring {} from non-peer {}", telegram, from);
            return Ok(Flow::Continue);
        };

        self.handle(telegram, peer).await
    }

    async fn handle(&mut self, telegram: Telegram, peer: SocketAddr) -> Result<Flow> {
        if !self.heartbeat_sent || matches!(telegram.body, Body::Heartbeat(_)) {
            self.send_heartbeat(peer).await;
        }

        match telegram.body {
            Body::Decode(decode) => {
                self.handle_decode(&decode).await?;
                Ok(Flow::Continue)
            }
            Body::Close(_) => {
                info!(
                    "{} closed, monitor exiting",
                    telegram.header.client_id.as_deref().unwrap_or("WSJT-X")
                );
                Ok(Flow::Stop)
            }
            other => {
                debug!("Ignoring {} telegram", other.name());
                Ok(Flow::Continue)
            }
        }
    }

    async fn handle_decode(&self, decode: &Decode) -> Result<()> {
        if decode.off_air == Some(true) || decode.is_new != Some(true) {
            return Ok(());
        }

        let message = EnrichedMessage::from_decode(decode, &self.table, Utc::now().timestamp());
        if let Some(reason) = &message.error {
            self.stats.record_classify_error();
            debug!("Skipping '{}': {}", message.raw, reason);
            return Ok(());
        }
        self.stats.record_message(&message);
        debug!("{}", message);

        match self.queue.send(message).await.context("Delivery queue closed")? {
            Enqueued::Queued => self.stats.record_queued(),
            Enqueued::Dropped => {
                self.stats.record_dropped();
                warn!("Delivery queue full, message dropped ({} total)", self.queue.dropped());
            }
        }
        Ok(())
    }

    async fn send_heartbeat(&mut self, peer: SocketAddr) {
        let heartbeat = Telegram::heartbeat(&self.config.client_id, &self.config.version);
        let sent = match heartbeat.encode() {
            Ok(bytes) => self.socket.send_to(&bytes, peer).await.map(|_| ()),
            Err(e) => Err(std::io::Error::other(e)),
        };
        match sent {
            Ok(()) => self.heartbeat_sent = true,
            Err(e) => warn!("Failed to send heartbeat to {}: {}", peer, e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cty::tests::SAMPLE_CTY;
    use crate::delivery::{MessageReceiver, OverflowPolicy, message_queue};
    use crate::message::MessageKind;
    use crate::telegram::{Close, Heartbeat, Status};
    use std::time::Duration;

    struct Harness {
        monitor_addr: SocketAddr,
        wsjtx: UdpSocket,
        queue: MessageReceiver,
        stats: Arc<PipelineStats>,
        shutdown: watch::Sender<bool>,
        task: tokio::task::JoinHandle<Result<()>>,
    }

    async fn start() -> Harness {
        let config = MonitorConfig {
            port: 0,
            ..Default::default()
        };
        let table = Arc::new(CountryTable::parse(SAMPLE_CTY).unwrap());
        let (tx, rx) = message_queue(16, OverflowPolicy::DropNewest);
        let stats = Arc::new(PipelineStats::new());
        let monitor = Monitor::bind(config, table, tx, stats.clone()).await.unwrap();
        let monitor_addr = monitor.local_addr().unwrap();
        let (shutdown, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(monitor.run(shutdown_rx));
        let wsjtx = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        Harness {
            monitor_addr,
            wsjtx,
            queue: rx,
            stats,
            shutdown,
            task,
        }
    }

    fn decode(text: &str, is_new: bool, off_air: bool) -> Vec<u8> {
        Telegram::new(Decode {
            is_new: Some(is_new),
            time: Some(1000),
            snr: Some(-9),
            delta_t: Some(0.1),
            delta_f: Some(900),
            mode: Some("~".into()),
            message: Some(text.into()),
            low_confidence: Some(false),
            off_air: Some(off_air),
        })
        .encode()
        .unwrap()
    }

    async fn recv_telegram(socket: &UdpSocket) -> Telegram {
        let mut buf = [0u8; MAX_DATAGRAM];
        let (len, _) = tokio::time::timeout(Duration::from_secs(2), socket.recv_from(&mut buf))
            .await
            .expect("no reply from monitor")
            .unwrap();
        Telegram::decode(&buf[..len]).unwrap()
    }

    async fn next_message(queue: &mut MessageReceiver) -> EnrichedMessage {
        tokio::time::timeout(Duration::from_secs(2), queue.recv())
            .await
            .expect("no message queued")
            .unwrap()
    }

    #[tokio::test]
    async fn test_decode_is_classified_and_queued() {
        let mut h = start().await;
        h.wsjtx
            .send_to(&decode("CQ WB9XYZ EN34", true, false), h.monitor_addr)
            .await
            .unwrap();

        // First telegram from the peer gets a heartbeat back.
        let reply = recv_telegram(&h.wsjtx).await;
        assert!(matches!(reply.body, Body::Heartbeat(ref hb) if hb.max_schema == Some(3)));
        assert_eq!(reply.header.client_id.as_deref(), Some(DEFAULT_CLIENT_ID));

        let msg = next_message(&mut h.queue).await;
        assert_eq!(msg.kind, MessageKind::Cq);
        assert_eq!(msg.caller.as_deref(), Some("WB9XYZ"));
        assert_eq!(msg.country.as_deref(), Some("United States"));
        assert_eq!(msg.snr, -9);
        assert!(msg.captured_at > 0);

        h.shutdown.send(true).unwrap();
        h.task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_filters_and_errors() {
        let mut h = start().await;
        let sends = [
            decode("CQ K1AAA FN42", false, false),
            decode("CQ K1BBB FN42", true, true),
            decode("CQ", true, false),
            b"not a telegram".to_vec(),
            decode("KA1ABC WB9XYZ RR73", true, false),
        ];
        for bytes in &sends {
            h.wsjtx.send_to(bytes, h.monitor_addr).await.unwrap();
        }

        let msg = next_message(&mut h.queue).await;
        assert_eq!(msg.raw, "KA1ABC WB9XYZ RR73");
        assert_eq!(msg.kind, MessageKind::Reply);

        h.shutdown.send(true).unwrap();
        h.task.await.unwrap().unwrap();

        let summary = h.stats.summary();
        assert_eq!(summary.datagrams, 5);
        assert_eq!(summary.decode_errors, 1);
        assert_eq!(summary.classify_errors, 1);
        assert_eq!(summary.decodes_handled, 1);
        assert_eq!(summary.messages_queued, 1);
    }

    #[tokio::test]
    async fn test_heartbeat_is_answered() {
        let h = start().await;
        let hb = Telegram::new(Heartbeat {
            max_schema: Some(3),
            version: Some("2.6.1".into()),
            revision: Some("abc".into()),
        });
        h.wsjtx
            .send_to(&hb.encode().unwrap(), h.monitor_addr)
            .await
            .unwrap();
        assert!(matches!(recv_telegram(&h.wsjtx).await.body, Body::Heartbeat(_)));

        // Status after the first exchange gets no reply; the next heartbeat does.
        h.wsjtx
            .send_to(&Telegram::new(Status::default()).encode().unwrap(), h.monitor_addr)
            .await
            .unwrap();
        h.wsjtx
            .send_to(&hb.encode().unwrap(), h.monitor_addr)
            .await
            .unwrap();
        assert!(matches!(recv_telegram(&h.wsjtx).await.body, Body::Heartbeat(_)));

        h.shutdown.send(true).unwrap();
        h.task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_close_stops_monitor() {
        let h = start().await;
        h.wsjtx
            .send_to(&Telegram::new(Close {}).encode().unwrap(), h.monitor_addr)
            .await
            .unwrap();
        let result = tokio::time::timeout(Duration::from_secs(2), h.task)
            .await
            .expect("monitor did not stop");
        assert!(result.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_non_peer_is_ignored() {
        let mut h = start().await;
        h.wsjtx
            .send_to(&decode("CQ WB9XYZ EN34", true, false), h.monitor_addr)
            .await
            .unwrap();
        next_message(&mut h.queue).await;

        let stranger = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        stranger
            .send_to(&decode("CQ KA1ABC FN42", true, false), h.monitor_addr)
            .await
            .unwrap();
        stranger
            .send_to(&Telegram::new(Close {}).encode().unwrap(), h.monitor_addr)
            .await
            .unwrap();

        // The peer's next decode still arrives; the stranger's Close was ignored.
        h.wsjtx
            .send_to(&decode("CQ VE7ABC CN89", true, false), h.monitor_addr)
            .await
            .unwrap();
        let msg = next_message(&mut h.queue).await;
        assert_eq!(msg.caller.as_deref(), Some("VE7ABC"));
        assert!(!h.task.is_finished());

        h.shutdown.send(true).unwrap();
        h.task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_set_peer_by_client_id() {
        let table = Arc::new(CountryTable::parse(SAMPLE_CTY).unwrap());
        let (tx, _rx) = message_queue(4, OverflowPolicy::DropNewest);
        let config = MonitorConfig {
            port: 0,
            ..Default::default()
        };
        let mut monitor = Monitor::bind(config, table, tx, Arc::new(PipelineStats::new()))
            .await
            .unwrap();

        let first = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let second = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let status_from = |id: &str| {
            let mut t = Telegram::new(Status::default());
            t.header.client_id = Some(id.to_string());
            t.encode().unwrap()
        };

        let a = first.local_addr().unwrap();
        let b = second.local_addr().unwrap();
        monitor.handle_datagram(&status_from("rig-a"), a).await.unwrap();
        monitor.handle_datagram(&status_from("rig-b"), b).await.unwrap();
        assert_eq!(monitor.peer, Some(a));

        assert!(monitor.set_peer("rig-b"));
        assert_eq!(monitor.peer, Some(b));
        assert!(!monitor.set_peer("rig-c"));
        assert_eq!(monitor.peer, Some(b));

        // A client id keeps the address it was first seen at.
        monitor.handle_datagram(&status_from("rig-a"), b).await.unwrap();
        assert_eq!(monitor.clients["rig-a"], a);
        assert!(monitor.set_peer("rig-a"));
        assert_eq!(monitor.peer, Some(a));
    }

    #[tokio::test]
    async fn test_peer_client_id_selects_instance() {
        let table = Arc::new(CountryTable::parse(SAMPLE_CTY).unwrap());
        let (tx, mut rx) = message_queue(4, OverflowPolicy::DropNewest);
        let config = MonitorConfig {
            port: 0,
            peer_client_id: Some("rig-b".to_string()),
            ..Default::default()
        };
        let mut monitor = Monitor::bind(config, table, tx, Arc::new(PipelineStats::new()))
            .await
            .unwrap();

        let first = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let second = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let a = first.local_addr().unwrap();
        let b = second.local_addr().unwrap();
        let decode_from = |id: &str, text: &str| {
            let mut t = Telegram::decode(&decode(text, true, false)).unwrap();
            t.header.client_id = Some(id.to_string());
            t.encode().unwrap()
        };

        monitor.handle_datagram(&decode_from("rig-a", "CQ K1AAA FN42"), a).await.unwrap();
        assert_eq!(monitor.peer, None);

        monitor.handle_datagram(&decode_from("rig-b", "CQ VE7ABC CN89"), b).await.unwrap();
        assert_eq!(monitor.peer, Some(b));
        let msg = next_message(&mut rx).await;
        assert_eq!(msg.caller.as_deref(), Some("VE7ABC"));

        // The first sender stays ignored once the chosen instance is served.
        monitor.handle_datagram(&decode_from("rig-a", "CQ K1BBB FN42"), a).await.unwrap();
        assert!(rx.drain().is_empty());
    }
}
