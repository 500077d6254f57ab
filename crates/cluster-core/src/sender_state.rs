//! Per-peer sender health.
//!
//! Every transport activity towards one peer shares a single [`SenderState`].
//! Within one failure episode the state only moves forward
//! (Ready → Suspect → Failing); only a verified successful send puts it back
//! to Ready.

use crate::member::MemberId;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum HealthState {
    Ready,
    Suspect,
    Failing,
}

impl HealthState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Ready,
            1 => Self::Suspect,
            _ => Self::Failing,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            Self::Ready => 0,
            Self::Suspect => 1,
            Self::Failing => 2,
        }
    }
}

impl fmt::Display for HealthState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Ready => "ready",
            Self::Suspect => "suspect",
            Self::Failing => "failing",
        };
        f.write_str(s)
    }
}

/// Health of the transport towards one peer.
#[derive(Debug)]
pub struct SenderState {
    state: AtomicU8,
}

impl Default for SenderState {
    fn default() -> Self {
        Self {
            state: AtomicU8::new(HealthState::Ready.as_u8()),
        }
    }
}

impl SenderState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> HealthState {
        HealthState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn mark_ready(&self) {
        self.state
            .store(HealthState::Ready.as_u8(), Ordering::Release);
    }

    /// Ready → Suspect. A Failing peer stays Failing.
    pub fn mark_suspect(&self) {
        // Only Ready moves; Suspect and Failing are already at or past Suspect.
        let _ = self.state.compare_exchange(
            HealthState::Ready.as_u8(),
            HealthState::Suspect.as_u8(),
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    pub fn mark_failing(&self) {
        self.state
            .store(HealthState::Failing.as_u8(), Ordering::Release);
    }

    pub fn is_ready(&self) -> bool {
        self.state() == HealthState::Ready
    }

    /// True for Suspect and Failing peers.
    pub fn is_suspect(&self) -> bool {
        self.state() != HealthState::Ready
    }

    pub fn is_failing(&self) -> bool {
        self.state() == HealthState::Failing
    }
}

/// Registry of sender states keyed by peer identity.
///
/// One instance is shared (via `Arc`) between the transmitter, its senders
/// and the membership glue that cleans up departed peers.
#[derive(Debug, Default)]
pub struct SenderStateRegistry {
    states: Mutex<HashMap<MemberId, Arc<SenderState>>>,
}

impl SenderStateRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up the state for `id`, creating a Ready state when `create` is set.
    pub fn get(&self, id: &MemberId, create: bool) -> Option<Arc<SenderState>> {
        let mut states = self.states.lock().unwrap_or_else(|e| e.into_inner());
        if create {
            Some(Arc::clone(states.entry(*id).or_default()))
        } else {
            states.get(id).cloned()
        }
    }

    pub fn remove(&self, id: &MemberId) -> Option<Arc<SenderState>> {
        self.states
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(id)
    }

    pub fn len(&self) -> usize {
        self.states.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_state_is_ready() {
        let state = SenderState::new();
        assert!(state.is_ready());
        assert!(!state.is_suspect());
        assert!(!state.is_failing());
    }

    #[test]
    fn test_transitions_are_monotonic() {
        let state = SenderState::new();

        state.mark_suspect();
        assert_eq!(state.state(), HealthState::Suspect);
        assert!(state.is_suspect());

        state.mark_failing();
        assert_eq!(state.state(), HealthState::Failing);

        // Suspect on a failing peer must not downgrade it
        state.mark_suspect();
        assert_eq!(state.state(), HealthState::Failing);
        assert!(state.is_suspect());
        assert!(state.is_failing());
    }

    #[test]
    fn test_ready_resets_episode() {
        let state = SenderState::new();
        state.mark_suspect();
        state.mark_failing();
        state.mark_ready();
        assert!(state.is_ready());

        state.mark_suspect();
        assert_eq!(state.state(), HealthState::Suspect);
    }

    #[test]
    fn test_registry_lazy_create() {
        let registry = SenderStateRegistry::new();
        let id = MemberId::generate();

        assert!(registry.get(&id, false).is_none());
        assert!(registry.is_empty());

        let state = registry.get(&id, true).unwrap();
        state.mark_suspect();

        // Same instance on subsequent lookups
        let again = registry.get(&id, false).unwrap();
        assert!(Arc::ptr_eq(&state, &again));
        assert!(again.is_suspect());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_registry_remove() {
        let registry = SenderStateRegistry::new();
        let id = MemberId::generate();
        registry.get(&id, true).unwrap().mark_failing();

        assert!(registry.remove(&id).is_some());
        assert!(registry.get(&id, false).is_none());

        // A fresh state after removal starts Ready
        assert!(registry.get(&id, true).unwrap().is_ready());
    }

    #[test]
    fn test_display() {
        assert_eq!(HealthState::Ready.to_string(), "ready");
        assert_eq!(HealthState::Suspect.to_string(), "suspect");
        assert_eq!(HealthState::Failing.to_string(), "failing");
    }
}
