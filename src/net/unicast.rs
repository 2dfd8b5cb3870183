// per-peer transport. each node binds UNICAST_PORT_BASE + id; reliability is
// layered on top of best-effort sends with a pending-ACK table of oneshot
// waiters. waiters are always removed from the table on the way out,
// whether acknowledged, timed out, or the send itself failed
use std::{
    collections::HashMap,
    net::{Ipv4Addr, SocketAddr},
    sync::{Arc, Mutex},
    time::Duration,
};

use tokio::{net::UdpSocket, sync::oneshot, time::timeout};
use tracing::{debug, warn};

use super::{encode_or_log, PeerNet};
use crate::message::Envelope;

const ACK_ROUND_BACKOFF: Duration = Duration::from_millis(200);

pub fn bind_unicast_socket(port: u16) -> anyhow::Result<UdpSocket> {
    let socket = std::net::UdpSocket::bind((Ipv4Addr::UNSPECIFIED, port))?;
    socket.set_nonblocking(true)?;
    Ok(UdpSocket::from_std(socket)?)
}

/// msg_id to waiter handle. Shared between the orchestrator (which observes
/// ACK messages) and the transient sender tasks waiting on them.
#[derive(Debug, Clone, Default)]
pub struct AckTable(Arc<Mutex<HashMap<String, oneshot::Sender<()>>>>);

impl AckTable {
    fn register(&self, msg_id: &str) -> oneshot::Receiver<()> {
        let (sender, receiver) = oneshot::channel();
        self.0
            .lock()
            .expect("ack table lock")
            .insert(msg_id.into(), sender);
        receiver
    }

    fn forget(&self, msg_id: &str) {
        self.0.lock().expect("ack table lock").remove(msg_id);
    }

    /// Wake the waiter for `msg_id`. Returns false for unknown ids (late or
    /// duplicate ACKs), which is not an error.
    pub fn acknowledge(&self, msg_id: &str) -> bool {
        let Some(waiter) = self.0.lock().expect("ack table lock").remove(msg_id) else {
            return false;
        };
        waiter.send(()).is_ok()
    }
}

#[derive(Debug, Clone)]
pub struct UnicastNet {
    socket: Arc<UdpSocket>,
    acks: AckTable,
    retry_count: u32,
    retry_delay: Duration,
    ack_attempts: u32,
    ack_timeout: Duration,
}

impl UnicastNet {
    pub fn new(
        socket: UdpSocket,
        retry_count: u32,
        retry_delay: Duration,
        ack_attempts: u32,
        ack_timeout: Duration,
    ) -> Self {
        Self {
            socket: Arc::new(socket),
            acks: AckTable::default(),
            retry_count,
            retry_delay,
            ack_attempts,
            ack_timeout,
        }
    }

    pub fn socket(&self) -> Arc<UdpSocket> {
        self.socket.clone()
    }
}

impl PeerNet for UnicastNet {
    fn send(&mut self, envelope: &Envelope, to: SocketAddr) -> anyhow::Result<()> {
        let Some(buf) = encode_or_log(envelope) else {
            return Ok(());
        };
        let socket = self.socket.clone();
        tokio::spawn(async move {
            if let Err(err) = socket.send_to(&buf, to).await {
                warn!(">>> {to} {err}");
            }
        });
        Ok(())
    }

    fn send_retry(&mut self, envelope: &Envelope, to: SocketAddr) -> anyhow::Result<()> {
        let Some(buf) = encode_or_log(envelope) else {
            return Ok(());
        };
        let socket = self.socket.clone();
        let attempts = self.retry_count;
        let delay = self.retry_delay;
        tokio::spawn(async move {
            for attempt in 0..attempts {
                match socket.send_to(&buf, to).await {
                    Ok(_) => return,
                    Err(err) => warn!(">>> {to} attempt {attempt}: {err}"),
                }
                tokio::time::sleep(delay).await;
            }
            warn!(">>> {to} giving up after {attempts} attempts");
        });
        Ok(())
    }

    fn send_acked(&mut self, envelope: &Envelope, to: SocketAddr) -> anyhow::Result<()> {
        let Some(msg_id) = envelope.msg_id.clone() else {
            anyhow::bail!("{} sent with ack but no msg_id", envelope.body.kind())
        };
        let Some(buf) = encode_or_log(envelope) else {
            return Ok(());
        };
        let socket = self.socket.clone();
        let acks = self.acks.clone();
        let attempts = self.ack_attempts;
        let ack_timeout = self.ack_timeout;
        let kind = envelope.body.kind();
        tokio::spawn(async move {
            for attempt in 0..attempts {
                let waiter = acks.register(&msg_id);
                if let Err(err) = socket.send_to(&buf, to).await {
                    warn!(">>> {to} {kind} attempt {attempt}: {err}");
                }
                match timeout(ack_timeout, waiter).await {
                    Ok(Ok(())) => {
                        debug!(">>> {to} {kind} acknowledged ({msg_id})");
                        return;
                    }
                    // timed out, or the table entry was displaced
                    _ => acks.forget(&msg_id),
                }
                tokio::time::sleep(ACK_ROUND_BACKOFF).await;
            }
            warn!(">>> {to} {kind} not acknowledged after {attempts} attempts ({msg_id})");
        });
        Ok(())
    }

    fn acknowledge(&mut self, msg_id: &str) {
        if self.acks.acknowledge(msg_id) {
            debug!(msg_id, "ack delivered to waiter");
        } else {
            debug!(msg_id, "ack with no waiter");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn acknowledge_wakes_registered_waiter() {
        let acks = AckTable::default();
        let waiter = acks.register("m1-1");
        assert!(acks.acknowledge("m1-1"));
        waiter.await.unwrap();
        // consumed on wake
        assert!(!acks.acknowledge("m1-1"));
    }

    #[tokio::test]
    async fn forget_leaves_waiter_pending() {
        let acks = AckTable::default();
        let waiter = acks.register("m1-2");
        acks.forget("m1-2");
        assert!(!acks.acknowledge("m1-2"));
        assert!(waiter.await.is_err());
    }

    #[tokio::test]
    async fn acked_send_round_trips_over_loopback() {
        let receiver = bind_unicast_socket(0).unwrap();
        let target: SocketAddr = ([127, 0, 0, 1], receiver.local_addr().unwrap().port()).into();
        let mut net = UnicastNet::new(
            bind_unicast_socket(0).unwrap(),
            3,
            Duration::from_millis(10),
            2,
            Duration::from_millis(100),
        );

        let envelope = Envelope::new(1, crate::message::Body::StateRequest)
            .with_msg_id("m1-3".into());
        net.send_acked(&envelope, target).unwrap();

        let mut buf = vec![0; 4096];
        let (len, _) = receiver.recv_from(&mut buf).await.unwrap();
        let received = Envelope::decode(&buf[..len]).unwrap();
        assert_eq!(received.msg_id.as_deref(), Some("m1-3"));

        net.acknowledge("m1-3");
    }
}
