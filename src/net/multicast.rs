// group transport: one socket joined to the multicast group for receiving
// (REUSEADDR + REUSEPORT so co-located processes share the port) and a plain
// socket for sending with TTL 1 and loopback on. the orchestrator filters its
// own looped-back datagrams by sender id
use std::{
    net::{Ipv4Addr, SocketAddr, SocketAddrV4},
    sync::Arc,
    time::Duration,
};

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tracing::{debug, warn};

use super::{encode_or_log, GroupNet};
use crate::message::Envelope;

/// Bind the group-joined receive socket. Fatal errors here abort startup.
pub fn bind_group_socket(group: Ipv4Addr, port: u16) -> anyhow::Result<UdpSocket> {
    anyhow::ensure!(group.is_multicast(), "{group} is not a multicast address");
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    #[cfg(unix)]
    socket.set_reuse_port(true)?;
    socket.bind(&SocketAddr::from((Ipv4Addr::UNSPECIFIED, port)).into())?;
    socket.set_nonblocking(true)?;
    let socket = UdpSocket::from_std(socket.into())?;
    socket.join_multicast_v4(group, Ipv4Addr::UNSPECIFIED)?;
    debug!(%group, port, "joined multicast group");
    Ok(socket)
}

/// Bind the send-side socket: unbound port, TTL 1, loopback enabled.
pub fn bind_send_socket() -> anyhow::Result<std::net::UdpSocket> {
    let socket = std::net::UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))?;
    socket.set_multicast_ttl_v4(1)?;
    socket.set_multicast_loop_v4(true)?;
    socket.set_nonblocking(true)?;
    Ok(socket)
}

#[derive(Debug, Clone)]
pub struct MulticastNet {
    socket: Arc<UdpSocket>,
    group: SocketAddrV4,
    copies: u32,
    gap: Duration,
}

impl MulticastNet {
    pub fn new(
        group: Ipv4Addr,
        port: u16,
        copies: u32,
        gap: Duration,
    ) -> anyhow::Result<Self> {
        let socket = Arc::new(UdpSocket::from_std(bind_send_socket()?)?);
        Ok(Self {
            socket,
            group: SocketAddrV4::new(group, port),
            copies,
            gap,
        })
    }
}

impl GroupNet for MulticastNet {
    fn send(&mut self, envelope: &Envelope) -> anyhow::Result<()> {
        let Some(buf) = encode_or_log(envelope) else {
            return Ok(());
        };
        let socket = self.socket.clone();
        let group = self.group;
        tokio::spawn(async move {
            if let Err(err) = socket.send_to(&buf, group).await {
                warn!(">>> {group} {err}");
            }
        });
        Ok(())
    }

    fn send_repeated(&mut self, envelope: &Envelope) -> anyhow::Result<()> {
        let Some(buf) = encode_or_log(envelope) else {
            return Ok(());
        };
        let socket = self.socket.clone();
        let group = self.group;
        let copies = self.copies;
        let gap = self.gap;
        let kind = envelope.body.kind();
        tokio::spawn(async move {
            for copy in 0..copies {
                if copy != 0 {
                    tokio::time::sleep(gap).await;
                }
                if let Err(err) = socket.send_to(&buf, group).await {
                    warn!(">>> {group} {kind} copy {copy}: {err}");
                }
            }
        });
        Ok(())
    }
}
