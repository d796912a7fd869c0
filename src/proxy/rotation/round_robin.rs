//! Round-robin egress pool with failure tracking

use std::time::Instant;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::config::{EgressConfig, EgressEndpoint};
use crate::models::EgressCandidate;

struct PoolState {
    candidates: Vec<EgressCandidate>,
    cursor: usize,
    next_id: usize,
}

impl PoolState {
    /// Index of the first eligible candidate scanning cyclically from `start`
    fn find_eligible(&self, start: usize, threshold: u32) -> Option<usize> {
        let len = self.candidates.len();
        (0..len)
            .map(|offset| (start + offset) % len)
            .find(|&idx| self.candidates[idx].is_eligible(threshold))
    }

    fn position(&self, id: usize) -> Option<usize> {
        self.candidates.iter().position(|c| c.id == id)
    }
}

/// Pool of egress candidates shared by every request
///
/// All mutation happens under one lock so selection, rotation and failure
/// reporting never observe a half-updated cursor.
pub struct EgressPool {
    state: Mutex<PoolState>,
    failure_threshold: u32,
}

impl EgressPool {
    pub fn new(endpoints: &[EgressEndpoint], failure_threshold: u32) -> Self {
        let candidates: Vec<EgressCandidate> = endpoints
            .iter()
            .enumerate()
            .map(|(id, endpoint)| EgressCandidate::from_endpoint(id, endpoint))
            .collect();
        let next_id = candidates.len();

        Self {
            state: Mutex::new(PoolState {
                candidates,
                cursor: 0,
                next_id,
            }),
            failure_threshold: failure_threshold.max(1),
        }
    }

    pub fn from_config(config: &EgressConfig) -> Self {
        Self::new(&config.endpoints, config.failure_threshold)
    }

    /// Pool that always connects directly
    pub fn empty() -> Self {
        Self::new(&[], 1)
    }

    /// The candidate at (or after) the cursor that is eligible for use
    ///
    /// Returns `None` when the pool is empty or every candidate is excluded,
    /// in which case the caller connects directly.
    pub fn current(&self) -> Option<EgressCandidate> {
        let mut state = self.state.lock();
        if state.candidates.is_empty() {
            return None;
        }

        let start = state.cursor;
        let idx = state.find_eligible(start, self.failure_threshold)?;
        state.cursor = idx;
        let candidate = &mut state.candidates[idx];
        candidate.last_used = Some(Instant::now());
        Some(candidate.clone())
    }

    /// Advance the cursor to the next eligible candidate
    pub fn rotate(&self) -> Option<EgressCandidate> {
        let mut state = self.state.lock();
        self.rotate_locked(&mut state)
    }

    fn rotate_locked(&self, state: &mut PoolState) -> Option<EgressCandidate> {
        if state.candidates.is_empty() {
            return None;
        }

        let start = (state.cursor + 1) % state.candidates.len();
        let idx = state.find_eligible(start, self.failure_threshold)?;
        state.cursor = idx;
        let candidate = &state.candidates[idx];
        debug!(egress = %candidate, "Rotated egress");
        Some(candidate.clone())
    }

    /// Record a failed attempt through a candidate and move away from it
    pub fn report_failure(&self, id: usize) {
        let mut state = self.state.lock();
        let Some(idx) = state.position(id) else {
            return;
        };

        let candidate = &mut state.candidates[idx];
        candidate.consecutive_failures = candidate.consecutive_failures.saturating_add(1);
        let failures = candidate.consecutive_failures;

        if failures >= self.failure_threshold {
            warn!(
                egress = %candidate,
                failures,
                "Egress excluded from rotation until next reset"
            );
        } else {
            debug!(egress = %candidate, failures, "Egress attempt failed");
        }

        // Only rotate if no one has already moved the cursor off this candidate.
        if state.cursor == idx {
            self.rotate_locked(&mut state);
        }
    }

    /// Record a successful attempt, clearing the failure streak
    pub fn report_success(&self, id: usize) {
        let mut state = self.state.lock();
        if let Some(idx) = state.position(id) {
            state.candidates[idx].consecutive_failures = 0;
        }
    }

    /// Clear every failure counter, returning excluded candidates to rotation
    pub fn reset_failures(&self) -> usize {
        let mut state = self.state.lock();
        let mut restored = 0;
        for candidate in state.candidates.iter_mut() {
            if candidate.consecutive_failures >= self.failure_threshold {
                restored += 1;
            }
            candidate.consecutive_failures = 0;
        }

        if restored > 0 {
            info!(restored, "Egress failure counters reset");
        }
        restored
    }

    /// Add a candidate, returning its id
    pub fn add(&self, endpoint: &EgressEndpoint) -> usize {
        let mut state = self.state.lock();
        let id = state.next_id;
        state.next_id += 1;
        let candidate = EgressCandidate::from_endpoint(id, endpoint);
        info!(egress = %candidate, id, "Egress added");
        state.candidates.push(candidate);
        id
    }

    /// Remove a candidate by id
    pub fn remove(&self, id: usize) -> bool {
        let mut state = self.state.lock();
        let Some(idx) = state.position(id) else {
            return false;
        };

        let removed = state.candidates.remove(idx);
        if idx < state.cursor {
            state.cursor -= 1;
        }
        if state.cursor >= state.candidates.len() {
            state.cursor = 0;
        }

        info!(egress = %removed, id, "Egress removed");
        true
    }

    /// Remove every candidate with the given host
    pub fn remove_host(&self, host: &str) -> usize {
        let ids: Vec<usize> = {
            let state = self.state.lock();
            state
                .candidates
                .iter()
                .filter(|c| c.host == host)
                .map(|c| c.id)
                .collect()
        };
        ids.into_iter().filter(|&id| self.remove(id)).count()
    }

    /// Switch a candidate on or off
    pub fn set_active(&self, id: usize, active: bool) -> bool {
        let mut state = self.state.lock();
        match state.position(id) {
            Some(idx) => {
                state.candidates[idx].active = active;
                true
            }
            None => false,
        }
    }

    /// Number of candidates currently eligible for selection
    pub fn available_count(&self) -> usize {
        let state = self.state.lock();
        state
            .candidates
            .iter()
            .filter(|c| c.is_eligible(self.failure_threshold))
            .count()
    }

    /// Number of candidates switched on, whether or not they are excluded
    pub fn active_count(&self) -> usize {
        self.state.lock().candidates.iter().filter(|c| c.active).count()
    }

    pub fn len(&self) -> usize {
        self.state.lock().candidates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of all candidates
    pub fn candidates(&self) -> Vec<EgressCandidate> {
        self.state.lock().candidates.clone()
    }

    pub fn failure_threshold(&self) -> u32 {
        self.failure_threshold
    }
}

impl Default for EgressPool {
    fn default() -> Self {
        Self::empty()
    }
}
