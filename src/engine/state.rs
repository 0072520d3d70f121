//! Session state
//!
//! Created when the wallet unlocks and dropped when it locks. Holds the
//! fee quote cache, the user's fee override and when each pending output
//! was first seen by the sweep.

use crate::core::fee::{FeeRate, FeeRateCache};
use crate::core::model::{AccountId, OutPoint};
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug)]
pub struct EngineState {
    pub account_id: AccountId,
    pub fee_cache: FeeRateCache,
    pub fee_override: Option<FeeRate>,
    pending_seen: HashMap<OutPoint, Instant>,
    opened_at: Instant,
}

impl EngineState {
    pub fn new(account_id: AccountId, fee_quote_ttl: Duration) -> Self {
        Self {
            account_id,
            fee_cache: FeeRateCache::new(fee_quote_ttl),
            fee_override: None,
            pending_seen: HashMap::new(),
            opened_at: Instant::now(),
        }
    }

    /// Record an output as pending, keeping the earliest sighting
    pub fn note_pending(&mut self, outpoint: &OutPoint) -> Instant {
        *self
            .pending_seen
            .entry(outpoint.clone())
            .or_insert_with(Instant::now)
    }

    /// How long an output has been observed pending
    pub fn pending_age(&self, outpoint: &OutPoint) -> Option<Duration> {
        self.pending_seen.get(outpoint).map(Instant::elapsed)
    }

    /// Drop sightings of outputs that are no longer pending
    pub fn retain_pending(&mut self, still_pending: &[OutPoint]) {
        self.pending_seen.retain(|k, _| still_pending.contains(k));
    }

    pub fn session_age(&self) -> Duration {
        self.opened_at.elapsed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pending_tracking() {
        let mut state = EngineState::new(1, Duration::from_secs(60));
        let a = OutPoint::new("aa", 0);
        let b = OutPoint::new("bb", 1);

        let first = state.note_pending(&a);
        assert_eq!(state.note_pending(&a), first);
        state.note_pending(&b);
        assert!(state.pending_age(&a).is_some());

        state.retain_pending(&[b.clone()]);
        assert!(state.pending_age(&a).is_none());
        assert!(state.pending_age(&b).is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_pending_age_follows_clock() {
        let mut state = EngineState::new(1, Duration::from_secs(60));
        let a = OutPoint::new("aa", 0);
        state.note_pending(&a);

        tokio::time::advance(Duration::from_secs(90)).await;
        assert!(state.pending_age(&a).unwrap() >= Duration::from_secs(90));
        assert!(state.session_age() >= Duration::from_secs(90));
    }
}
