//! cluster-node: one member of a replication cluster.
//!
//! Announces itself over multicast, tracks live peers, accepts replicated
//! messages from them and sends every line read from stdin to all peers.

use anyhow::{Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use clap::Parser;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use cluster_core::protocol::Handshake;
use cluster_core::{
    ClusterConfig, Member, MemberId, MembershipEvent, MembershipRegistry, OutboundMessage,
    SenderStateRegistry,
};
use cluster_daemon::{
    Channels, HeartbeatService, MessageDispatcher, MessageListener, ReplicationReceiver,
    Transmitter,
};

#[derive(Parser, Debug)]
#[command(name = "cluster-node")]
#[command(about = "Cluster membership and replication node")]
struct Args {
    /// Path to a JSON config file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Address to listen on for replication traffic
    #[arg(short, long)]
    listen: Option<SocketAddr>,

    /// Multicast port
    #[arg(long)]
    port: Option<u16>,

    /// Multicast group address
    #[arg(long)]
    address: Option<IpAddr>,

    /// Only track members announcing the same domain
    #[arg(long)]
    domain: Option<String>,

    /// Enable verbose logging
    #[arg(long)]
    verbose: bool,
}

struct LoggingListener;

#[async_trait]
impl MessageListener for LoggingListener {
    async fn on_message_received(&self, payload: Bytes, source: &Member) -> bool {
        info!(
            "Message from {} ({} bytes): {}",
            source,
            payload.len(),
            String::from_utf8_lossy(&payload)
        );
        true
    }
}

/// Node state holding all components.
struct Node {
    heartbeat: HeartbeatService,
    transmitter: Arc<Transmitter>,
    dispatcher: Option<MessageDispatcher>,
    wait_for_ack: bool,
}

impl Node {
    async fn on_membership_event(&self, event: &MembershipEvent) {
        match event {
            MembershipEvent::Added(member) => {
                self.transmitter.add(member);
                info!(
                    "Peer joined: {} ({} live)",
                    member,
                    self.heartbeat.members().len()
                );
            }
            MembershipEvent::Disappeared(member) => {
                self.transmitter.remove(member).await;
                self.transmitter.states().remove(&member.id);
                info!(
                    "Peer left: {} ({} live)",
                    member,
                    self.heartbeat.members().len()
                );
            }
        }
    }

    async fn broadcast(&self, line: String) {
        let members = self.heartbeat.members();
        if members.is_empty() {
            debug!("No peers, dropping line");
            return;
        }

        let message = OutboundMessage::new(line.into_bytes(), self.wait_for_ack);
        match &self.dispatcher {
            Some(dispatcher) => {
                if !dispatcher.enqueue(members, message) {
                    warn!("Send queue full, message dropped");
                }
            }
            None => match self.transmitter.send_message(&members, &message).await {
                Ok(()) => debug!("Sent to {} peer(s)", members.len()),
                Err(e) => warn!("Send failed: {}", e),
            },
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Set up logging - respects RUST_LOG env var, defaults to info (or debug with --verbose)
    let default_filter = if args.verbose {
        "debug,cluster_daemon=debug"
    } else {
        "info,cluster_daemon=info"
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let mut config = match &args.config {
        Some(path) => ClusterConfig::load(path)?,
        None => ClusterConfig::default(),
    };
    if let Some(listen) = args.listen {
        config.receiver.listen = listen;
    }
    if let Some(port) = args.port {
        config.membership.port = port;
    }
    if let Some(address) = args.address {
        config.membership.address = address;
    }
    if let Some(domain) = args.domain {
        config.membership.domain = Some(domain);
    }
    config.validate()?;

    info!("Starting cluster-node");

    let receiver = ReplicationReceiver::bind(config.receiver.listen, Arc::new(LoggingListener))
        .await
        .with_context(|| format!("Failed to bind {}", config.receiver.listen))?;
    let data_port = match config.membership.local_port {
        Some(port) => port,
        None => receiver.local_addr()?.port(),
    };

    let local_id = MemberId::generate();
    let local = Member::new(local_id, config.membership.local_host.clone(), data_port)
        .with_domain(config.membership.domain_bytes());
    info!("Member ID: {} (data channel {})", local_id, local.address());

    let registry = Arc::new(MembershipRegistry::new(local_id));
    let states = Arc::new(SenderStateRegistry::new());
    let transmitter = Arc::new(Transmitter::new(
        config.sender.clone(),
        config.transmitter.fan_out,
        Handshake::for_member(&local),
        states,
    ));
    let keepalive_task = transmitter.spawn_keepalive(config.transmitter.keepalive_interval());
    let dispatcher = config
        .queue
        .enabled
        .then(|| MessageDispatcher::spawn(Arc::clone(&transmitter), &config.queue));
    let receiver_task = receiver.spawn();

    let (heartbeat, mut events) =
        HeartbeatService::new(config.membership.clone(), local, registry);
    let _membership_log = heartbeat.subscribe(|event| debug!("Membership event: {:?}", event));
    heartbeat
        .start(Channels::ALL)
        .await
        .with_context(|| format!("Failed to join {}", config.membership.group()))?;

    let node = Node {
        heartbeat,
        transmitter,
        dispatcher,
        wait_for_ack: config.sender.wait_for_ack,
    };

    info!(
        "Node running with {} peer(s). Type to broadcast, Ctrl+C to stop.",
        node.heartbeat.members().len()
    );

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;

    // Main event loop
    loop {
        tokio::select! {
            Some(event) = events.recv() => {
                node.on_membership_event(&event).await;
                node.heartbeat.events().emit(event);
            }

            line = lines.next_line(), if stdin_open => {
                match line {
                    Ok(Some(line)) => node.broadcast(line).await,
                    Ok(None) => stdin_open = false,
                    Err(e) => {
                        warn!("Failed to read stdin: {}", e);
                        stdin_open = false;
                    }
                }
            }

            // Handle graceful shutdown
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown signal received");
                break;
            }
        }
    }

    info!("Shutting down");
    node.heartbeat.stop(Channels::ALL).await;
    if let Some(dispatcher) = node.dispatcher {
        dispatcher.shutdown();
        dispatcher.join().await;
    }
    keepalive_task.abort();
    receiver_task.abort();
    Ok(())
}
