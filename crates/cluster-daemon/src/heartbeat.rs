//! Multicast heartbeat service.
//!
//! One periodic sender loop and one receiver loop share a multicast socket.
//! Received heartbeats feed the [`MembershipRegistry`]; membership changes are
//! pushed into a channel and never delivered inline, so the receive loop never
//! waits on application callbacks.
//!
//! Sustained socket errors on either loop trigger recovery: both loops are
//! halted, the socket is rebuilt and the channels that were running are
//! restarted. At most one recovery runs per service.

use cluster_core::protocol::{Command, HeartbeatPacket};
use cluster_core::{
    EventBus, Member, MembershipConfig, MembershipEvent, MembershipRegistry, Subscription,
    UpsertOutcome, now_ms,
};
use socket2::{Domain, Protocol, Socket, Type};
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::ops::BitOr;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

/// Which heartbeat loops to start or stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Channels(u8);

impl Channels {
    pub const NONE: Self = Self(0);
    pub const RECEIVE: Self = Self(0b01);
    pub const TRANSMIT: Self = Self(0b10);
    pub const ALL: Self = Self(0b11);

    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0 && other.0 != 0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn without(self, other: Self) -> Self {
        Self(self.0 & !other.0)
    }

    pub fn bits(self) -> u8 {
        self.0
    }

    fn from_bits(bits: u8) -> Self {
        Self(bits & Self::ALL.0)
    }
}

impl BitOr for Channels {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// Heartbeat service handle. Cheap to clone.
#[derive(Clone)]
pub struct HeartbeatService {
    inner: Arc<Inner>,
}

struct Inner {
    config: MembershipConfig,
    registry: Arc<MembershipRegistry>,
    bus: Arc<EventBus>,
    local: Mutex<Member>,
    started_at: Instant,
    socket: Mutex<Option<Arc<UdpSocket>>>,
    sender_task: Mutex<Option<JoinHandle<()>>>,
    receiver_task: Mutex<Option<JoinHandle<()>>>,
    /// Channels the caller asked for; recovery restarts exactly these
    running: AtomicU8,
    recovering: AtomicBool,
    /// Recoveries started since creation
    recoveries: AtomicU32,
    send_errors: AtomicU32,
    recv_errors: AtomicU32,
    events: mpsc::UnboundedSender<MembershipEvent>,
}

impl HeartbeatService {
    /// Create the service. Membership events arrive on the returned receiver;
    /// drain it with [`HeartbeatService::spawn_dispatch`] or a custom loop.
    pub fn new(
        config: MembershipConfig,
        local: Member,
        registry: Arc<MembershipRegistry>,
    ) -> (Self, mpsc::UnboundedReceiver<MembershipEvent>) {
        let (events, events_rx) = mpsc::unbounded_channel();
        let inner = Inner {
            config,
            registry,
            bus: Arc::new(EventBus::new()),
            local: Mutex::new(local),
            started_at: Instant::now(),
            socket: Mutex::new(None),
            sender_task: Mutex::new(None),
            receiver_task: Mutex::new(None),
            running: AtomicU8::new(0),
            recovering: AtomicBool::new(false),
            recoveries: AtomicU32::new(0),
            send_errors: AtomicU32::new(0),
            recv_errors: AtomicU32::new(0),
            events,
        };
        (
            Self {
                inner: Arc::new(inner),
            },
            events_rx,
        )
    }

    /// Start the requested loops, then wait two heartbeat intervals so
    /// membership can settle. Already-running channels are left alone.
    pub async fn start(&self, channels: Channels) -> io::Result<()> {
        let started = self.inner.start_channels(channels).await?;
        if !started.is_empty() {
            tokio::time::sleep(self.inner.config.heartbeat_interval() * 2).await;
        }
        Ok(())
    }

    /// Stop the requested loops. Once nothing runs, a SHUTDOWN heartbeat is
    /// sent (best effort), the group is left and the socket closed.
    pub async fn stop(&self, channels: Channels) {
        self.inner.stop_channels(channels).await;
    }

    pub fn running(&self) -> Channels {
        Channels::from_bits(self.inner.running.load(Ordering::Acquire))
    }

    pub fn is_recovering(&self) -> bool {
        self.inner.recovering.load(Ordering::Acquire)
    }

    pub fn recovery_count(&self) -> u32 {
        self.inner.recoveries.load(Ordering::Acquire)
    }

    pub fn local_member(&self) -> Member {
        self.inner
            .local
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Replace the payload advertised on the next heartbeat.
    pub fn set_payload(&self, payload: impl Into<Vec<u8>>) {
        self.inner
            .local
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .payload = payload.into();
    }

    /// Snapshot of the live peers.
    pub fn members(&self) -> Vec<Member> {
        self.inner.registry.all()
    }

    pub fn registry(&self) -> &Arc<MembershipRegistry> {
        &self.inner.registry
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.inner.bus
    }

    /// Subscribe to membership events delivered through the dispatch task.
    pub fn subscribe(
        &self,
        callback: impl Fn(MembershipEvent) + Send + Sync + 'static,
    ) -> Subscription {
        self.inner.bus.subscribe(callback)
    }

    /// Drain `events_rx` into the event bus on a dedicated task.
    pub fn spawn_dispatch(
        &self,
        mut events_rx: mpsc::UnboundedReceiver<MembershipEvent>,
    ) -> JoinHandle<()> {
        let bus = Arc::clone(&self.inner.bus);
        tokio::spawn(async move {
            while let Some(event) = events_rx.recv().await {
                bus.emit(event);
            }
        })
    }
}

impl Inner {
    async fn start_channels(self: &Arc<Self>, channels: Channels) -> io::Result<Channels> {
        let prev = Channels::from_bits(self.running.fetch_or(channels.bits(), Ordering::AcqRel));
        let newly = channels.without(prev);
        if newly.is_empty() {
            return Ok(Channels::NONE);
        }

        let socket = match self.ensure_socket() {
            Ok(socket) => socket,
            Err(e) => {
                self.running.fetch_and(!newly.bits(), Ordering::AcqRel);
                return Err(e);
            }
        };

        if newly.contains(Channels::TRANSMIT) {
            if let Err(e) = self.send_heartbeat(&socket, Command::Alive).await {
                warn!("Initial heartbeat failed: {}", e);
            }
        }

        self.spawn_loops(newly, socket);
        info!(
            "Heartbeat started (channels {:#04b}) on {}",
            newly.bits(),
            self.config.group()
        );
        Ok(newly)
    }

    async fn stop_channels(&self, channels: Channels) {
        let prev = Channels::from_bits(self.running.fetch_and(!channels.bits(), Ordering::AcqRel));
        if channels.contains(Channels::RECEIVE) {
            abort_task(&self.receiver_task);
        }
        if channels.contains(Channels::TRANSMIT) {
            abort_task(&self.sender_task);
        }

        let remaining = prev.without(channels);
        if !remaining.is_empty() {
            return;
        }

        let Some(socket) = self.take_socket() else {
            return;
        };

        if !prev.is_empty() {
            match self.send_heartbeat(&socket, Command::Shutdown).await {
                Ok(()) => debug!("Shutdown heartbeat sent"),
                Err(e) => warn!("Failed to send shutdown heartbeat: {}", e),
            }
        }
        if let Err(e) = self.leave_group(&socket) {
            debug!("Failed to leave multicast group: {}", e);
        }
        info!("Heartbeat stopped");
    }

    fn ensure_socket(&self) -> io::Result<Arc<UdpSocket>> {
        let mut slot = self.socket.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(socket) = slot.as_ref() {
            return Ok(Arc::clone(socket));
        }
        let socket = Arc::new(open_socket(&self.config)?);
        *slot = Some(Arc::clone(&socket));
        Ok(socket)
    }

    fn take_socket(&self) -> Option<Arc<UdpSocket>> {
        self.socket.lock().unwrap_or_else(|e| e.into_inner()).take()
    }

    fn leave_group(&self, socket: &UdpSocket) -> io::Result<()> {
        match self.config.address {
            IpAddr::V4(group) => socket.leave_multicast_v4(group, v4_interface(&self.config)),
            IpAddr::V6(group) => socket.leave_multicast_v6(&group, 0),
        }
    }

    /// Spawn the loops for `channels` that are still requested and not running.
    ///
    /// The request is re-read under each task slot lock so a concurrent
    /// `stop` either sees the new task and aborts it, or is seen here.
    fn spawn_loops(self: &Arc<Self>, channels: Channels, socket: Arc<UdpSocket>) {
        if channels.contains(Channels::RECEIVE) {
            let mut slot = self.receiver_task.lock().unwrap_or_else(|e| e.into_inner());
            if slot.is_none() && self.is_requested(Channels::RECEIVE) {
                self.recv_errors.store(0, Ordering::Release);
                let inner = Arc::clone(self);
                let socket = Arc::clone(&socket);
                *slot = Some(tokio::spawn(async move {
                    inner.receive_loop(socket).await;
                }));
            }
        }

        if channels.contains(Channels::TRANSMIT) {
            let mut slot = self.sender_task.lock().unwrap_or_else(|e| e.into_inner());
            if slot.is_none() && self.is_requested(Channels::TRANSMIT) {
                self.send_errors.store(0, Ordering::Release);
                let inner = Arc::clone(self);
                *slot = Some(tokio::spawn(async move {
                    inner.transmit_loop(socket).await;
                }));
            }
        }
    }

    fn is_requested(&self, channel: Channels) -> bool {
        Channels::from_bits(self.running.load(Ordering::Acquire)).contains(channel)
    }

    async fn transmit_loop(self: Arc<Self>, socket: Arc<UdpSocket>) {
        let mut ticker = tokio::time::interval(self.config.heartbeat_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // First tick completes immediately; start() already sent one heartbeat.
        ticker.tick().await;

        loop {
            ticker.tick().await;
            match self.send_heartbeat(&socket, Command::Alive).await {
                Ok(()) => self.send_errors.store(0, Ordering::Release),
                Err(e) if e.kind() == io::ErrorKind::InvalidData => {
                    error!("Heartbeat not sent: {}", e);
                }
                Err(e) => {
                    warn!("Heartbeat send failed: {}", e);
                    self.record_error(&self.send_errors);
                }
            }
        }
    }

    async fn receive_loop(self: Arc<Self>, socket: Arc<UdpSocket>) {
        // One spare byte so oversized datagrams are detectable.
        let mut buf = vec![0u8; self.config.max_packet_size + 1];
        let read_timeout = self.config.read_timeout();

        loop {
            match tokio::time::timeout(read_timeout, socket.recv_from(&mut buf)).await {
                Ok(Ok((len, from))) => {
                    self.recv_errors.store(0, Ordering::Release);
                    if len > self.config.max_packet_size {
                        warn!(
                            "Dropping oversized heartbeat from {} (> {} bytes)",
                            from, self.config.max_packet_size
                        );
                    } else {
                        self.handle_datagram(&buf[..len], now_ms());
                    }
                }
                Ok(Err(e)) => {
                    warn!("Heartbeat receive failed: {}", e);
                    self.record_error(&self.recv_errors);
                }
                Err(_) => {}
            }

            self.expire(now_ms());
        }
    }

    /// Apply one received datagram to the registry.
    fn handle_datagram(&self, data: &[u8], now_ms: u64) {
        let packet = match HeartbeatPacket::decode(data, self.config.max_packet_size) {
            Ok(packet) => packet,
            Err(e) => {
                debug!("Dropping malformed heartbeat: {}", e);
                return;
            }
        };

        let (local_id, local_domain) = {
            let local = self.local.lock().unwrap_or_else(|e| e.into_inner());
            (local.id, local.domain.clone())
        };
        if packet.member_id() == local_id {
            return;
        }
        if packet.domain != local_domain {
            debug!("Ignoring heartbeat from {} (foreign domain)", packet.member_id());
            return;
        }

        if packet.is_shutdown() {
            if let Some(member) = self.registry.remove(&packet.member_id()) {
                info!("Member shut down: {}", member);
                let _ = self.events.send(MembershipEvent::Disappeared(member));
            }
            return;
        }

        let member = packet.into_member();
        if self.registry.upsert(member.clone(), now_ms) == UpsertOutcome::Added {
            info!("Member added: {}", member);
            let _ = self.events.send(MembershipEvent::Added(member));
        }
    }

    fn expire(&self, now_ms: u64) {
        for member in self.registry.expire(self.config.expiration_ms, now_ms) {
            info!("Member expired: {}", member);
            let _ = self.events.send(MembershipEvent::Disappeared(member));
        }
    }

    async fn send_heartbeat(&self, socket: &UdpSocket, command: Command) -> io::Result<()> {
        let packet = {
            let mut local = self.local.lock().unwrap_or_else(|e| e.into_inner());
            local.alive_ms = self.started_at.elapsed().as_millis() as u64;
            if command == Command::Alive {
                local.sequence += 1;
                HeartbeatPacket::alive(&local)
            } else {
                HeartbeatPacket::shutdown(&local)
            }
        };
        let data = packet
            .encode(self.config.max_packet_size)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        socket.send_to(&data, self.config.group()).await?;
        Ok(())
    }

    /// Count a socket error; at the threshold reset the counter and recover.
    fn record_error(self: &Arc<Self>, counter: &AtomicU32) {
        let errors = counter.fetch_add(1, Ordering::AcqRel) + 1;
        if errors >= self.config.recovery_threshold {
            counter.store(0, Ordering::Release);
            self.trigger_recovery();
        }
    }

    fn trigger_recovery(self: &Arc<Self>) {
        if !self.config.recovery_enabled {
            return;
        }
        if self
            .recovering
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("Recovery already in progress");
            return;
        }
        self.recoveries.fetch_add(1, Ordering::AcqRel);

        let inner = Arc::clone(self);
        tokio::spawn(async move {
            inner.recover().await;
            inner.recovering.store(false, Ordering::Release);
        });
    }

    async fn recover(self: &Arc<Self>) {
        warn!("Heartbeat socket failing, rebuilding it");
        let mut attempt = 0u32;
        loop {
            let running = Channels::from_bits(self.running.load(Ordering::Acquire));
            if running.is_empty() {
                info!("Recovery abandoned, heartbeat service stopped");
                return;
            }

            attempt += 1;
            // No SHUTDOWN broadcast: peers should keep us while we rebuild.
            abort_task(&self.receiver_task);
            abort_task(&self.sender_task);
            self.take_socket();

            match self.ensure_socket() {
                Ok(socket) => {
                    if self.resume(socket) {
                        info!("Heartbeat recovered after {} attempt(s)", attempt);
                    } else {
                        info!("Recovery abandoned, heartbeat service stopped");
                    }
                    return;
                }
                Err(e) => {
                    warn!(
                        "Heartbeat recovery attempt {} failed: {}; retrying in {:?}",
                        attempt,
                        e,
                        self.config.recovery_sleep()
                    );
                    tokio::time::sleep(self.config.recovery_sleep()).await;
                }
            }
        }
    }

    /// Restart the running channels on a rebuilt socket. When the service
    /// was stopped meanwhile the socket is released instead and false is
    /// returned.
    fn resume(self: &Arc<Self>, socket: Arc<UdpSocket>) -> bool {
        let running = Channels::from_bits(self.running.load(Ordering::Acquire));
        if running.is_empty() {
            if let Some(socket) = self.take_socket() {
                if let Err(e) = self.leave_group(&socket) {
                    debug!("Failed to leave multicast group: {}", e);
                }
            }
            return false;
        }
        self.spawn_loops(running, socket);
        true
    }
}

fn abort_task(slot: &Mutex<Option<JoinHandle<()>>>) {
    if let Some(task) = slot.lock().unwrap_or_else(|e| e.into_inner()).take() {
        task.abort();
    }
}

fn v4_interface(config: &MembershipConfig) -> Ipv4Addr {
    match config.bind {
        Some(IpAddr::V4(addr)) => addr,
        _ => Ipv4Addr::UNSPECIFIED,
    }
}

/// Bind a reusable UDP socket on the group port and join the group.
fn open_socket(config: &MembershipConfig) -> io::Result<UdpSocket> {
    let domain = match config.address {
        IpAddr::V4(_) => Domain::IPV4,
        IpAddr::V6(_) => Domain::IPV6,
    };
    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    #[cfg(all(unix, not(any(target_os = "solaris", target_os = "illumos"))))]
    socket.set_reuse_port(true)?;
    socket.set_nonblocking(true)?;

    match config.address {
        IpAddr::V4(group) => {
            let iface = v4_interface(config);
            socket.bind(&SocketAddr::new(Ipv4Addr::UNSPECIFIED.into(), config.port).into())?;
            socket.join_multicast_v4(&group, &iface)?;
            socket.set_multicast_loop_v4(true)?;
            if !iface.is_unspecified() {
                socket.set_multicast_if_v4(&iface)?;
            }
            if let Some(ttl) = config.ttl {
                socket.set_multicast_ttl_v4(ttl)?;
            }
        }
        IpAddr::V6(group) => {
            socket.set_only_v6(true)?;
            socket.bind(&SocketAddr::new(Ipv6Addr::UNSPECIFIED.into(), config.port).into())?;
            socket.join_multicast_v6(&group, 0)?;
            socket.set_multicast_loop_v6(true)?;
            if let Some(hops) = config.ttl {
                socket.set_multicast_hops_v6(hops)?;
            }
        }
    }

    UdpSocket::from_std(socket.into())
}
