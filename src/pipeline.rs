//! Pipeline wiring: UDP reader → decode+enrich → hub → subscribers.
//!
//! Each stage is its own task joined by bounded drop-oldest queues; the
//! whole pipeline shuts down through a watch channel cascade (reader stops,
//! input queue closes, decode drains and closes the hub, subscribers
//! observe the close and exit).

use crate::archive::writer::ArchiveWriter;
use crate::config::Config;
use crate::frame;
use crate::hub::Hub;
use crate::ingest::{self, Datagram};
use crate::{enrich, queue};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tracing::{debug, info};

/// Counters maintained by the decode stage.
#[derive(Debug, Default)]
pub struct PipelineStats {
    decode_errors: AtomicU64,
    published: AtomicU64,
}

impl PipelineStats {
    pub fn decode_errors(&self) -> u64 {
        self.decode_errors.load(Ordering::Relaxed)
    }

    pub fn published(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }
}

/// Error starting the pipeline. Binding the ingest socket is the only
/// fallible step; everything after is task spawning.
#[derive(Debug)]
pub enum StartError {
    Bind(std::io::Error),
}

impl std::fmt::Display for StartError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StartError::Bind(e) => write!(f, "failed to bind udp socket: {}", e),
        }
    }
}

impl std::error::Error for StartError {}

/// Handles to a running pipeline.
pub struct Pipeline {
    pub hub: Arc<Hub>,
    pub stats: Arc<PipelineStats>,
    /// Actual bound address of the ingest socket (port 0 resolves here).
    pub udp_addr: SocketAddr,
}

/// Bind the ingest socket and spawn the reader, decode+enrich, and
/// archive-writer tasks.
pub async fn start(config: &Config, shutdown: watch::Receiver<bool>) -> Result<Pipeline, StartError> {
    let socket = UdpSocket::bind(("0.0.0.0", config.udp_port))
        .await
        .map_err(StartError::Bind)?;
    let udp_addr = socket.local_addr().map_err(StartError::Bind)?;

    let hub = Arc::new(Hub::new());
    let stats = Arc::new(PipelineStats::default());

    let (input_tx, input_rx) = queue::bounded(config.pipeline.input_capacity);
    tokio::spawn(ingest::run_udp_listener(socket, input_tx, shutdown));

    // Archive writer: a hub subscriber like any other, with its own buffer.
    let (_writer_handle, writer_rx) = hub.subscribe(config.pipeline.writer_capacity);
    let writer = ArchiveWriter::new(&config.archive.root, config.archive.print_end_timeout);
    info!(root = %config.archive.root.display(), "archive writer subscribed");
    tokio::spawn(writer.run(writer_rx));

    tokio::spawn(run_decode_stage(input_rx, hub.clone(), stats.clone()));

    Ok(Pipeline {
        hub,
        stats,
        udp_addr,
    })
}

/// Decode and enrich datagrams until the input queue closes, then shut the
/// hub down so subscribers drain and exit.
async fn run_decode_stage(
    mut input: queue::Receiver<Datagram>,
    hub: Arc<Hub>,
    stats: Arc<PipelineStats>,
) {
    while let Some(datagram) = input.recv().await {
        let sender = datagram.sender.to_string();
        let mut packet = frame::decode(&datagram.payload, &sender, datagram.received_at);
        if packet.error.is_some() {
            stats.decode_errors.fetch_add(1, Ordering::Relaxed);
            debug!(sender = %sender, "datagram failed to decode");
        }
        enrich::enrich(&mut packet);
        stats.published.fetch_add(1, Ordering::Relaxed);
        hub.publish(Arc::new(packet));
    }
    info!("decode stage drained; closing hub");
    hub.close_hub();
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    fn test_config() -> Config {
        let mut config = Config::default();
        config.udp_port = 0;
        config
    }

    #[tokio::test]
    async fn packets_flow_from_socket_to_subscriber() {
        let config = test_config();
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let pipeline = start(&config, shutdown_rx).await.expect("start pipeline");
        let (_handle, mut rx) = pipeline.hub.subscribe(16);

        let client = UdpSocket::bind("127.0.0.1:0").await.expect("client bind");
        client
            .send_to(b"msg=7,tm=9000,v=2\ntemp v=25i 1\n", ("127.0.0.1", pipeline.udp_addr.port()))
            .await
            .expect("send");

        let packet = timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("packet within deadline")
            .expect("hub open");
        assert_eq!(packet.prelude.msg_id, Some(7));
        assert_eq!(packet.metrics[0].device_time_us, Some(10_000));
        assert!(packet.wall_time_str.is_some());
        assert_eq!(pipeline.stats.published(), 1);
        assert_eq!(pipeline.stats.decode_errors(), 0);
    }

    #[tokio::test]
    async fn shutdown_cascade_closes_the_hub() {
        let config = test_config();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let pipeline = start(&config, shutdown_rx).await.expect("start pipeline");
        let (_handle, mut rx) = pipeline.hub.subscribe(16);

        shutdown_tx.send(true).expect("signal shutdown");
        let closed = timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("subscriber observes close");
        assert!(closed.is_none());
        assert!(pipeline.hub.is_closed());
    }

    #[tokio::test]
    async fn undecodable_datagrams_are_counted() {
        let config = test_config();
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let pipeline = start(&config, shutdown_rx).await.expect("start pipeline");
        let (_handle, mut rx) = pipeline.hub.subscribe(16);

        let client = UdpSocket::bind("127.0.0.1:0").await.expect("client bind");
        client
            .send_to(&[0xff, 0xfe, 0x00], ("127.0.0.1", pipeline.udp_addr.port()))
            .await
            .expect("send");

        let packet = timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("packet within deadline")
            .expect("hub open");
        assert!(packet.error.is_some());
        assert!(packet.metrics.is_empty());
        assert_eq!(pipeline.stats.decode_errors(), 1);
    }
}
