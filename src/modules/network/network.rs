//! Best-effort UDP broadcast for bids and order syncs.
//!
//! Each envelope is sent `send_repeats` times, a few milliseconds apart,
//! since there is no acknowledgement. Duplicates are left for the receiver's
//! freshness filter to drop.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

use log::{debug, info, warn};
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};

use super::message::Envelope;
use crate::modules::common::{NodeId, Result};
use crate::modules::config::Timing;

/// Broadcast-capable UDP socket bound on all interfaces. Port 0 picks an
/// ephemeral port, which is what senders use.
pub fn create_socket(port: u16) -> Result<UdpSocket> {
    let sock = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    sock.set_reuse_address(true)?;
    #[cfg(unix)]
    sock.set_reuse_port(true)?;
    sock.set_broadcast(true)?;
    sock.set_nonblocking(true)?;
    let bind_addr = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port));
    sock.bind(&bind_addr.into())?;
    Ok(UdpSocket::from_std(sock.into())?)
}

pub async fn network_sender(
    socket: UdpSocket,
    target: SocketAddr,
    timing: Timing,
    mut decision_to_network_rx: mpsc::Receiver<Envelope>,
) -> Result<()> {
    while let Some(envelope) = decision_to_network_rx.recv().await {
        let bytes = match envelope.encode() {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("Could not encode envelope: {e}");
                continue;
            }
        };

        for copy in 0..timing.send_repeats {
            if copy > 0 {
                sleep(timing.repeat_spacing).await;
            }
            if let Err(e) = socket.send_to(&bytes, target).await {
                warn!("Broadcast to {target} failed: {e}");
            }
        }
    }
    info!("Outgoing message channel closed, stopping sender");
    Ok(())
}

/// Receives envelopes with a bounded wait so a dead decision loop is noticed.
/// Own and malformed datagrams are dropped here.
pub async fn network_receiver(
    socket: UdpSocket,
    me: NodeId,
    timing: Timing,
    network_to_decision_tx: mpsc::Sender<Envelope>,
) -> Result<()> {
    let mut buffer = vec![0u8; 65_535];
    loop {
        let (size, source) = match timeout(timing.read_deadline, socket.recv_from(&mut buffer)).await {
            Err(_) if network_to_decision_tx.is_closed() => break,
            Err(_) => continue,
            Ok(Err(e)) => {
                warn!("Receive failed: {e}");
                continue;
            }
            Ok(Ok(received)) => received,
        };

        let envelope = match Envelope::decode(&buffer[..size]) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!("Dropping malformed datagram from {source}: {e}");
                continue;
            }
        };
        if envelope.sender == me {
            continue;
        }
        debug!("Received {:?} from node {}", envelope.payload, envelope.sender);
        if network_to_decision_tx.send(envelope).await.is_err() {
            break;
        }
    }
    info!("Decision loop gone, stopping receiver");
    Ok(())
}
