//! Inbound UDP listener.
//!
//! Converts each datagram into a `(bytes, sender, received_at)` triple and
//! hands it to the decode stage through a bounded drop-oldest queue, so the
//! reader never blocks on downstream. Socket read errors are logged and the
//! loop continues.

use crate::queue;
use chrono::{DateTime, Utc};
use std::net::SocketAddr;
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Largest datagram we accept. UDP over IPv4 tops out under 64 KiB.
const MAX_DATAGRAM: usize = 64 * 1024;

/// One received datagram, pre-decode.
#[derive(Debug, Clone)]
pub struct Datagram {
    pub payload: Vec<u8>,
    pub sender: SocketAddr,
    /// Wall-clock instant captured on dequeue from the socket.
    pub received_at: DateTime<Utc>,
}

/// Run the UDP reader until shutdown is signalled. Closes the input queue
/// on exit so the decode stage drains and stops.
pub async fn run_udp_listener(
    socket: UdpSocket,
    input: queue::Sender<Datagram>,
    mut shutdown: watch::Receiver<bool>,
) {
    let local = socket.local_addr().ok();
    if let Some(addr) = local {
        info!(addr = %addr, "udp listener started");
    }
    let mut buf = vec![0u8; MAX_DATAGRAM];
    loop {
        tokio::select! {
            result = socket.recv_from(&mut buf) => match result {
                Ok((len, sender)) => {
                    let datagram = Datagram {
                        payload: buf[..len].to_vec(),
                        sender,
                        received_at: Utc::now(),
                    };
                    if input.push(datagram) == queue::PushOutcome::DroppedOldest {
                        debug!("input queue full; dropped oldest datagram");
                    }
                }
                Err(e) => {
                    warn!(error = %e, "udp receive failed");
                }
            },
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    info!("udp listener stopping (shutdown)");
                    break;
                }
            }
        }
    }
    input.close();
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::{timeout, Duration};

    #[tokio::test]
    async fn datagrams_flow_into_the_queue() {
        let socket = UdpSocket::bind("127.0.0.1:0").await.expect("bind");
        let addr = socket.local_addr().expect("local addr");
        let (tx, mut rx) = queue::bounded(16);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(run_udp_listener(socket, tx, shutdown_rx));

        let client = UdpSocket::bind("127.0.0.1:0").await.expect("client bind");
        client
            .send_to(b"msg=1,tm=0,v=1\ntemp v=25i 0\n", addr)
            .await
            .expect("send");

        let datagram = timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("datagram within deadline")
            .expect("queue open");
        assert!(datagram.payload.starts_with(b"msg=1"));
        assert_eq!(datagram.sender.ip(), client.local_addr().expect("addr").ip());

        shutdown_tx.send(true).expect("signal shutdown");
        timeout(Duration::from_secs(2), task)
            .await
            .expect("listener stops")
            .expect("task join");
        // Queue is closed after shutdown.
        assert!(timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("closed queue resolves")
            .is_none());
    }
}
