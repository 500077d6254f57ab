//! Membership registry: the set of live peers and when each was last heard.
//!
//! The registry is keyed by [`MemberId`], so two entries never share an id.
//! Time is passed in explicitly (`now_ms`) so expiry can be tested without
//! sleeping.

use crate::member::{Member, MemberId};
use std::collections::HashMap;
use std::sync::Mutex;

/// Result of recording a heartbeat.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    /// First heartbeat from this identity.
    Added,
    /// Known identity; last-seen refreshed.
    Updated,
    /// Heartbeat carried the local id and was not stored.
    Ignored,
}

#[derive(Debug, Clone)]
struct Entry {
    member: Member,
    last_seen_ms: u64,
}

/// Thread-safe set of known peers.
///
/// All mutation goes through one mutex for the whole registry.
#[derive(Debug)]
pub struct MembershipRegistry {
    local_id: MemberId,
    members: Mutex<HashMap<MemberId, Entry>>,
}

impl MembershipRegistry {
    pub fn new(local_id: MemberId) -> Self {
        Self {
            local_id,
            members: Mutex::new(HashMap::new()),
        }
    }

    pub fn local_id(&self) -> MemberId {
        self.local_id
    }

    /// Record a heartbeat from `member` received at `now_ms`.
    ///
    /// Last-seen is always refreshed. Stored attributes are only replaced
    /// when the heartbeat's sequence is newer than the stored one, so a
    /// duplicated or reordered datagram cannot roll attributes back.
    pub fn upsert(&self, member: Member, now_ms: u64) -> UpsertOutcome {
        if member.id == self.local_id {
            return UpsertOutcome::Ignored;
        }

        let mut members = self.members.lock().unwrap_or_else(|e| e.into_inner());
        match members.get_mut(&member.id) {
            Some(entry) => {
                entry.last_seen_ms = now_ms;
                if member.sequence > entry.member.sequence {
                    entry.member = member;
                }
                UpsertOutcome::Updated
            }
            None => {
                members.insert(
                    member.id,
                    Entry {
                        member,
                        last_seen_ms: now_ms,
                    },
                );
                UpsertOutcome::Added
            }
        }
    }

    /// Remove and return every member not heard from for more than `max_age_ms`.
    pub fn expire(&self, max_age_ms: u64, now_ms: u64) -> Vec<Member> {
        let mut members = self.members.lock().unwrap_or_else(|e| e.into_inner());
        let expired: Vec<MemberId> = members
            .iter()
            .filter(|(_, entry)| now_ms.saturating_sub(entry.last_seen_ms) > max_age_ms)
            .map(|(id, _)| *id)
            .collect();

        expired
            .into_iter()
            .filter_map(|id| members.remove(&id))
            .map(|entry| entry.member)
            .collect()
    }

    pub fn remove(&self, id: &MemberId) -> Option<Member> {
        self.members
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(id)
            .map(|entry| entry.member)
    }

    pub fn contains(&self, id: &MemberId) -> bool {
        self.members
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(id)
    }

    pub fn get(&self, id: &MemberId) -> Option<Member> {
        self.members
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(id)
            .map(|entry| entry.member.clone())
    }

    /// When the member was last heard from, in milliseconds.
    pub fn last_seen(&self, id: &MemberId) -> Option<u64> {
        self.members
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(id)
            .map(|entry| entry.last_seen_ms)
    }

    /// Snapshot of all known members.
    pub fn all(&self) -> Vec<Member> {
        self.members
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .map(|entry| entry.member.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.members.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn member(seed: u8, port: u16) -> Member {
        Member::new(MemberId::from_bytes([seed; 16]), "10.0.0.1", port)
    }

    fn beat(mut m: Member, sequence: u64) -> Member {
        m.sequence = sequence;
        m
    }

    // ==================== Upsert ====================

    #[test]
    fn test_upsert_added_then_updated() {
        let registry = MembershipRegistry::new(MemberId::generate());
        let peer = member(1, 4001);

        assert_eq!(registry.upsert(beat(peer.clone(), 1), 100), UpsertOutcome::Added);
        assert_eq!(registry.upsert(beat(peer.clone(), 2), 600), UpsertOutcome::Updated);
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.last_seen(&peer.id), Some(600));
    }

    #[test]
    fn test_local_id_is_ignored() {
        let local = MemberId::from_bytes([9; 16]);
        let registry = MembershipRegistry::new(local);

        let outcome = registry.upsert(Member::new(local, "10.0.0.9", 4000), 0);
        assert_eq!(outcome, UpsertOutcome::Ignored);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_one_entry_per_id_and_latest_arrival_wins() {
        let registry = MembershipRegistry::new(MemberId::generate());
        let arrivals = [(1u8, 10u64), (2, 20), (1, 30), (1, 45), (2, 50), (3, 55)];

        for (i, (seed, at)) in arrivals.iter().enumerate() {
            registry.upsert(beat(member(*seed, 4000), i as u64), *at);
        }

        assert_eq!(registry.len(), 3);
        assert_eq!(registry.last_seen(&MemberId::from_bytes([1; 16])), Some(45));
        assert_eq!(registry.last_seen(&MemberId::from_bytes([2; 16])), Some(50));
        assert_eq!(registry.last_seen(&MemberId::from_bytes([3; 16])), Some(55));
    }

    #[test]
    fn test_address_change_replaces_attributes() {
        let registry = MembershipRegistry::new(MemberId::generate());
        registry.upsert(beat(member(1, 4001), 1), 0);

        let moved = beat(member(1, 5001), 2);
        assert_eq!(registry.upsert(moved, 10), UpsertOutcome::Updated);
        assert_eq!(registry.get(&MemberId::from_bytes([1; 16])).unwrap().port, 5001);
    }

    #[test]
    fn test_stale_sequence_refreshes_but_keeps_attributes() {
        let registry = MembershipRegistry::new(MemberId::generate());
        let id = MemberId::from_bytes([1; 16]);
        registry.upsert(beat(member(1, 4001).with_payload(b"new".to_vec()), 5), 0);

        let stale = beat(member(1, 4001).with_payload(b"old".to_vec()), 3);
        assert_eq!(registry.upsert(stale, 100), UpsertOutcome::Updated);

        let stored = registry.get(&id).unwrap();
        assert_eq!(stored.payload, b"new");
        assert_eq!(stored.sequence, 5);
        assert_eq!(registry.last_seen(&id), Some(100));
    }

    // ==================== Expiry ====================

    #[test]
    fn test_expire_removes_only_stale_members() {
        let registry = MembershipRegistry::new(MemberId::generate());
        registry.upsert(member(1, 4001), 0);
        registry.upsert(member(2, 4002), 2000);

        let expired = registry.expire(3000, 3500);
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].id, MemberId::from_bytes([1; 16]));
        assert!(registry.contains(&MemberId::from_bytes([2; 16])));
    }

    #[test]
    fn test_expire_boundary_is_exclusive() {
        let registry = MembershipRegistry::new(MemberId::generate());
        registry.upsert(member(1, 4001), 0);

        assert!(registry.expire(3000, 3000).is_empty());
        assert_eq!(registry.expire(3000, 3001).len(), 1);
    }

    #[test]
    fn test_silent_peer_disappears_exactly_once() {
        // Heartbeat every 500ms, expiration 3000ms, three peers; peer 3 goes
        // silent at t=1000 while the other two keep beating.
        let registry = MembershipRegistry::new(MemberId::generate());
        let silent = MemberId::from_bytes([3; 16]);
        let mut disappeared = Vec::new();

        let mut now = 0;
        let mut seq = 0;
        while now <= 10_000 {
            seq += 1;
            registry.upsert(beat(member(1, 4001), seq), now);
            registry.upsert(beat(member(2, 4002), seq), now);
            if now <= 1000 {
                registry.upsert(beat(member(3, 4003), seq), now);
            }
            disappeared.extend(registry.expire(3000, now));
            now += 500;
        }

        assert_eq!(disappeared.len(), 1);
        assert_eq!(disappeared[0].id, silent);
        assert_eq!(registry.len(), 2);
    }

    // ==================== Removal ====================

    #[test]
    fn test_remove_is_immediate() {
        let registry = MembershipRegistry::new(MemberId::generate());
        let peer = member(1, 4001);
        registry.upsert(peer.clone(), 0);

        assert_eq!(registry.remove(&peer.id).map(|m| m.id), Some(peer.id));
        assert!(!registry.contains(&peer.id));
        assert!(registry.remove(&peer.id).is_none());
    }

    #[test]
    fn test_all_returns_snapshot() {
        let registry = MembershipRegistry::new(MemberId::generate());
        registry.upsert(member(1, 4001), 0);
        registry.upsert(member(2, 4002), 0);

        let mut ports: Vec<u16> = registry.all().iter().map(|m| m.port).collect();
        ports.sort();
        assert_eq!(ports, vec![4001, 4002]);
    }
}
