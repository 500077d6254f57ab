//! Multi-peer transmission.
//!
//! The [`Transmitter`] fans one outbound message out to every destination
//! through a pool of [`PeerSender`]s, created on demand from a template
//! [`SenderConfig`]. Every destination is attempted; failures are collected
//! into one [`ChannelError`].

use crate::sender::PeerSender;
use cluster_core::protocol::Handshake;
use cluster_core::{
    ChannelError, FanOut, FaultyMember, Member, MemberId, OutboundMessage, SenderConfig,
    SenderState, SenderStateRegistry, TransportError,
};
use futures::future::join_all;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

type SharedSender = Arc<tokio::sync::Mutex<PeerSender>>;

pub struct Transmitter {
    config: SenderConfig,
    fan_out: FanOut,
    local: Handshake,
    states: Arc<SenderStateRegistry>,
    senders: Mutex<HashMap<MemberId, SharedSender>>,
}

impl Transmitter {
    pub fn new(
        config: SenderConfig,
        fan_out: FanOut,
        local: Handshake,
        states: Arc<SenderStateRegistry>,
    ) -> Self {
        Self {
            config,
            fan_out,
            local,
            states,
            senders: Mutex::new(HashMap::new()),
        }
    }

    pub fn states(&self) -> &Arc<SenderStateRegistry> {
        &self.states
    }

    fn state_of(&self, id: &MemberId) -> Arc<SenderState> {
        self.states.get(id, true).unwrap_or_default()
    }

    /// Look up the sender for `member`, creating it (or replacing it when the
    /// member's address changed).
    fn sender_for(&self, member: &Member) -> SharedSender {
        let mut senders = self.senders.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(existing) = senders.get(&member.id) {
            let same_address = existing
                .try_lock()
                .map(|s| s.destination().address() == member.address())
                // Busy: keep using it
                .unwrap_or(true);
            if same_address {
                return Arc::clone(existing);
            }
            debug!("Address of {} changed, replacing sender", member.id);
        }

        let sender = PeerSender::new(
            self.config.clone(),
            self.local.clone(),
            member.clone(),
            self.state_of(&member.id),
        );
        let sender = Arc::new(tokio::sync::Mutex::new(sender));
        senders.insert(member.id, Arc::clone(&sender));
        sender
    }

    /// Register a peer ahead of the first send.
    pub fn add(&self, member: &Member) {
        self.sender_for(member);
    }

    /// Disconnect and discard the sender for `member`.
    pub async fn remove(&self, member: &Member) -> bool {
        let removed = self
            .senders
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&member.id);

        match removed {
            Some(sender) => {
                // A busy sender closes its connection when its last user drops it.
                if let Ok(mut sender) = sender.try_lock() {
                    sender.disconnect().await;
                }
                true
            }
            None => false,
        }
    }

    /// Send `message` to every destination.
    ///
    /// Destinations already suspect are attempted last. A destination that
    /// fails while already suspect is escalated to Failing.
    pub async fn send_message(
        &self,
        destinations: &[Member],
        message: &OutboundMessage,
    ) -> Result<(), TransportError> {
        let mut ordered: Vec<(&Member, bool)> = destinations
            .iter()
            .map(|m| (m, self.state_of(&m.id).is_suspect()))
            .collect();
        // Stable sort keeps caller order within each group
        ordered.sort_by_key(|(_, suspect)| *suspect);

        let results = match self.fan_out {
            FanOut::Sequential => {
                let mut results = Vec::with_capacity(ordered.len());
                for (member, was_suspect) in ordered {
                    let result = self.deliver(member, message).await;
                    results.push((member, was_suspect, result));
                }
                results
            }
            FanOut::Parallel => {
                join_all(ordered.into_iter().map(|(member, was_suspect)| async move {
                    (member, was_suspect, self.deliver(member, message).await)
                }))
                .await
            }
        };

        let mut faulty = Vec::new();
        for (member, was_suspect, result) in results {
            let Err(cause) = result else {
                continue;
            };
            let state = self.state_of(&member.id);
            if was_suspect {
                state.mark_failing();
            }
            faulty.push(FaultyMember {
                member: member.clone(),
                cause,
                state: state.state(),
            });
        }

        if faulty.is_empty() {
            debug!("Delivered message to {} member(s)", destinations.len());
            Ok(())
        } else {
            let error = ChannelError::new(faulty);
            warn!("{}", error);
            Err(TransportError::Partial(error))
        }
    }

    async fn deliver(&self, member: &Member, message: &OutboundMessage) -> Result<(), TransportError> {
        let sender = self.sender_for(member);
        let mut sender = sender.lock().await;
        sender
            .send_message(message.payload.clone(), message.wait_for_ack)
            .await
    }

    /// Recycle connections past their keepalive limits and drop their senders.
    /// Busy senders are skipped. Returns how many were pruned.
    pub async fn keepalive(&self) -> usize {
        let snapshot: Vec<(MemberId, SharedSender)> = self
            .senders
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(id, s)| (*id, Arc::clone(s)))
            .collect();

        let mut pruned = 0;
        for (id, sender) in snapshot {
            let Ok(mut guard) = sender.try_lock() else {
                continue;
            };
            if guard.keepalive().await {
                drop(guard);
                let mut senders = self.senders.lock().unwrap_or_else(|e| e.into_inner());
                // Only prune if nobody replaced it meanwhile
                if senders.get(&id).is_some_and(|s| Arc::ptr_eq(s, &sender)) {
                    senders.remove(&id);
                    pruned += 1;
                }
            }
        }
        pruned
    }

    /// Run [`Transmitter::keepalive`] every `interval` until aborted.
    pub fn spawn_keepalive(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let transmitter = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let pruned = transmitter.keepalive().await;
                if pruned > 0 {
                    info!("Keepalive recycled {} connection(s)", pruned);
                }
            }
        })
    }

    /// Peers with an open connection. Senders busy sending are left out.
    pub fn connected_peers(&self) -> Vec<Member> {
        self.senders
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .filter_map(|s| match s.try_lock() {
                Ok(sender) if sender.is_connected() => Some(sender.destination().clone()),
                _ => None,
            })
            .collect()
    }

    pub fn sender_count(&self) -> usize {
        self.senders.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}
