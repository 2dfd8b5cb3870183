use std::{net::SocketAddr, path::PathBuf, sync::Arc};

use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use gridmesh::{
    config::{parse_node_list, parse_peer_map, Config},
    event::{SendEvent, Session},
    message::Envelope,
    net::{
        multicast::{bind_group_socket, MulticastNet},
        recv_session,
        unicast::{bind_unicast_socket, UnicastNet},
    },
    node::{Command, Inbound, Node, NodeEvent, Tick, Via},
};

#[derive(Debug, Parser)]
#[command(name = "gridmesh", about = "distributed energy trading node")]
struct Args {
    /// Node identifier, also the election priority.
    node_id: u32,
    /// Comma-separated ids of peers known at startup, e.g. "1,3".
    #[arg(long)]
    nodes: Option<String>,
    /// Static peer address map, e.g. "1:192.168.0.10,2:192.168.0.11".
    #[arg(long)]
    peers: Option<String>,
    /// Append logs to this file instead of stderr.
    #[arg(long)]
    log_file: Option<PathBuf>,
    /// Debug-level logging (RUST_LOG overrides).
    #[arg(long)]
    debug: bool,
    /// Errors only; useful with many nodes on one terminal.
    #[arg(long)]
    quiet: bool,
}

fn init_logging(args: &Args) -> anyhow::Result<()> {
    let default = if args.debug {
        "gridmesh=debug"
    } else if args.quiet {
        "gridmesh=error"
    } else {
        "gridmesh=info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match &args.log_file {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)?;
            builder.with_writer(Arc::new(file)).with_ansi(false).init()
        }
        None => builder.with_writer(std::io::stderr).init(),
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logging(&args)?;

    let mut config = Config::from_env(args.node_id)?;
    if let Some(nodes) = &args.nodes {
        config.known_nodes = parse_node_list(nodes)?;
    }
    if let Some(peers) = &args.peers {
        config.seed_peers.extend(parse_peer_map(peers)?);
    }
    config.validate()?;
    info!(node = config.node_id, "starting");

    // bind failures are the one fatal error class: nothing to leave yet
    let group_socket = Arc::new(bind_group_socket(
        config.multicast_group,
        config.multicast_port,
    )?);
    let unicast_socket = bind_unicast_socket(config.unicast_port(config.node_id))?;

    let shutdown = CancellationToken::new();
    let mut session = Session::new(shutdown.clone());

    let group_net = MulticastNet::new(
        config.multicast_group,
        config.multicast_port,
        config.retry_count,
        config.retry_delay,
    )?;
    let peer_net = UnicastNet::new(
        unicast_socket,
        config.retry_count,
        config.retry_delay,
        config.ack_attempts,
        config.ack_timeout,
    );
    let peer_socket = peer_net.socket();
    let mut node = Node::new(config, group_net, peer_net, shutdown.clone());

    let on_datagram = |via: Via, mut sender: gridmesh::event::SessionSender<NodeEvent>| {
        move |buf: &[u8], from: SocketAddr| -> anyhow::Result<()> {
            match Envelope::decode(buf) {
                Ok(envelope) => sender.send(Inbound { envelope, from, via })?,
                // unknown kinds and malformed payloads are logged and dropped
                Err(err) => warn!(%from, "undecodable datagram: {err}"),
            }
            Ok(())
        }
    };
    let multicast_recv = recv_session(
        group_socket,
        shutdown.clone(),
        on_datagram(Via::Multicast, session.sender()),
    );
    tokio::spawn(async move {
        if let Err(err) = multicast_recv.await {
            warn!("multicast receive loop ended: {err}");
        }
    });
    let unicast_recv = recv_session(
        peer_socket,
        shutdown.clone(),
        on_datagram(Via::Unicast, session.sender()),
    );
    tokio::spawn(async move {
        if let Err(err) = unicast_recv.await {
            warn!("unicast receive loop ended: {err}");
        }
    });
    tokio::spawn(command_session(session.sender(), shutdown.clone()));
    tokio::spawn({
        let mut sender = session.sender();
        let shutdown = shutdown.clone();
        async move {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    let _ = sender.send(Command::Quit);
                }
                _ = shutdown.cancelled() => {}
            }
        }
    });

    let mut init = session.sender();
    init.send(Tick::Init)?;
    session.run(&mut node).await?;
    info!("shutdown complete");
    Ok(())
}

/// Read operator commands from stdin and feed them into the session.
async fn command_session(
    mut sender: gridmesh::event::SessionSender<NodeEvent>,
    shutdown: CancellationToken,
) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        enum Select {
            Line(std::io::Result<Option<String>>),
            Shutdown,
        }
        let selected = tokio::select! {
            line = lines.next_line() => Select::Line(line),
            _ = shutdown.cancelled() => Select::Shutdown,
        };
        let line = match selected {
            Select::Shutdown => return,
            Select::Line(Ok(Some(line))) => line,
            Select::Line(Ok(None)) => {
                // stdin closed; keep serving the network until quit
                shutdown.cancelled().await;
                return;
            }
            Select::Line(Err(err)) => {
                warn!("stdin error: {err}");
                return;
            }
        };
        match Command::parse(&line) {
            Ok(Some(command)) => {
                if sender.send(command).is_err() {
                    return;
                }
            }
            Ok(None) => {}
            Err(usage) => println!("{usage}"),
        }
    }
}
