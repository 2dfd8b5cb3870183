// UDP transports. the orchestrator is generic over these traits so tests can
// substitute recording fakes for the socket-backed implementations
use std::{net::SocketAddr, sync::Arc};

use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::{config::MAX_DATAGRAM, message::Envelope};

pub mod multicast;
pub mod unicast;

/// Group datagram send: one copy best-effort, or several spaced copies for
/// announcements whose loss would wedge convergence (COORDINATOR, JOIN).
pub trait GroupNet {
    fn send(&mut self, envelope: &Envelope) -> anyhow::Result<()>;

    fn send_repeated(&mut self, envelope: &Envelope) -> anyhow::Result<()>;
}

/// Direct per-peer send at increasing reliability levels. `send_retry`
/// re-attempts on local send errors only; `send_acked` runs rounds of
/// send-then-wait-for-ACK and is required for every message whose loss would
/// diverge replicated state.
pub trait PeerNet {
    fn send(&mut self, envelope: &Envelope, to: SocketAddr) -> anyhow::Result<()>;

    fn send_retry(&mut self, envelope: &Envelope, to: SocketAddr) -> anyhow::Result<()>;

    fn send_acked(&mut self, envelope: &Envelope, to: SocketAddr) -> anyhow::Result<()>;

    /// Wake the waiter registered under `msg_id`, if any.
    fn acknowledge(&mut self, msg_id: &str);
}

pub(crate) fn encode_or_log(envelope: &Envelope) -> Option<bytes::Bytes> {
    match envelope.encode() {
        Ok(buf) => Some(buf.into()),
        Err(err) => {
            warn!(kind = envelope.body.kind(), "dropping unencodable message: {err}");
            None
        }
    }
}

/// Receive datagrams until shutdown, handing each to `on_datagram`. The
/// callback decodes and forwards into the session; malformed input is its
/// problem to log and drop.
pub async fn recv_session(
    socket: Arc<UdpSocket>,
    shutdown: CancellationToken,
    mut on_datagram: impl FnMut(&[u8], SocketAddr) -> anyhow::Result<()>,
) -> anyhow::Result<()> {
    let mut buf = vec![0; MAX_DATAGRAM];
    loop {
        enum Select {
            Recv(std::io::Result<(usize, SocketAddr)>),
            Shutdown,
        }
        let selected = tokio::select! {
            _ = shutdown.cancelled() => Select::Shutdown,
            received = socket.recv_from(&mut buf) => Select::Recv(received),
        };
        match selected {
            Select::Shutdown => return Ok(()),
            Select::Recv(received) => {
                let (len, from) = received?;
                on_datagram(&buf[..len], from)?
            }
        }
    }
}
