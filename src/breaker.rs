//! Per-channel circuit breaker.
//!
//! A channel is either closed (eligible) or open until `disabled_until_ms`. There is no explicit
//! half-open state: eligibility is recomputed lazily against the clock at selection time, so a
//! channel whose window has elapsed is simply tried again. If that attempt fails the threshold is
//! still met and the window is re-armed from the new failure.
//!
//! Every channel has its own mutex. The table lock is only held long enough to fetch or insert the
//! channel's `Arc`, and is always released before the channel lock is taken.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, RwLock};

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakerPolicy {
    pub threshold: u32,
    pub disable_secs: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitState {
    pub consecutive_fails: u32,
    /// Epoch milliseconds; `None` while the circuit is closed.
    pub disabled_until_ms: Option<u64>,
}

impl CircuitState {
    pub fn is_eligible(&self, now_ms: u64) -> bool {
        self.disabled_until_ms.is_none_or(|until| until <= now_ms)
    }
}

/// What a recorded failure did to the circuit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureEffect {
    /// Still closed; carries the new streak length.
    Counted(u32),
    /// The threshold was reached and the channel is disabled until the given epoch ms.
    Opened { until_ms: u64 },
}

#[derive(Default)]
pub struct CircuitBreaker {
    channels: RwLock<HashMap<String, Arc<Mutex<CircuitState>>>>,
}

impl CircuitBreaker {
    pub fn new() -> Self {
        Self::default()
    }

    fn get(&self, channel_id: &str) -> Option<Arc<Mutex<CircuitState>>> {
        let map = match self.channels.read() {
            Ok(m) => m,
            Err(e) => e.into_inner(),
        };
        map.get(channel_id).cloned()
    }

    fn get_or_insert(&self, channel_id: &str) -> Arc<Mutex<CircuitState>> {
        if let Some(cell) = self.get(channel_id) {
            return cell;
        }
        let mut map = match self.channels.write() {
            Ok(m) => m,
            Err(e) => e.into_inner(),
        };
        map.entry(channel_id.to_string()).or_default().clone()
    }

    pub fn is_eligible(&self, channel_id: &str, now_ms: u64) -> bool {
        self.circuit_state(channel_id).is_eligible(now_ms)
    }

    /// Unknown channels report a closed circuit with no failures.
    pub fn circuit_state(&self, channel_id: &str) -> CircuitState {
        let Some(cell) = self.get(channel_id) else {
            return CircuitState::default();
        };
        let st = match cell.lock() {
            Ok(g) => g,
            Err(e) => e.into_inner(),
        };
        *st
    }

    pub fn record_success(&self, channel_id: &str) {
        // A channel that never failed has nothing to reset.
        let Some(cell) = self.get(channel_id) else {
            return;
        };
        let mut st = match cell.lock() {
            Ok(g) => g,
            Err(e) => e.into_inner(),
        };
        st.consecutive_fails = 0;
        st.disabled_until_ms = None;
    }

    pub fn record_failure(
        &self,
        channel_id: &str,
        policy: Option<BreakerPolicy>,
        now_ms: u64,
    ) -> FailureEffect {
        let cell = self.get_or_insert(channel_id);
        let mut st = match cell.lock() {
            Ok(g) => g,
            Err(e) => e.into_inner(),
        };
        let Some(policy) = policy else {
            st.consecutive_fails = st.consecutive_fails.saturating_add(1);
            return FailureEffect::Counted(st.consecutive_fails);
        };

        // The streak saturates at the threshold until the next success resets it.
        st.consecutive_fails = st.consecutive_fails.saturating_add(1).min(policy.threshold);
        if st.consecutive_fails >= policy.threshold {
            let until_ms = now_ms.saturating_add(policy.disable_secs.saturating_mul(1000));
            st.disabled_until_ms = Some(until_ms);
            FailureEffect::Opened { until_ms }
        } else {
            FailureEffect::Counted(st.consecutive_fails)
        }
    }

    pub fn forget(&self, channel_id: &str) {
        let mut map = match self.channels.write() {
            Ok(m) => m,
            Err(e) => e.into_inner(),
        };
        map.remove(channel_id);
    }

    /// Drops state for channels that no longer exist in the registry.
    pub fn retain_known(&self, known: &HashSet<String>) {
        let mut map = match self.channels.write() {
            Ok(m) => m,
            Err(e) => e.into_inner(),
        };
        map.retain(|id, _| known.contains(id));
    }

    pub fn snapshot(&self) -> HashMap<String, CircuitState> {
        let cells = {
            let map = match self.channels.read() {
                Ok(m) => m,
                Err(e) => e.into_inner(),
            };
            map.iter()
                .map(|(id, cell)| (id.clone(), cell.clone()))
                .collect::<Vec<_>>()
        };
        cells
            .into_iter()
            .map(|(id, cell)| {
                let st = match cell.lock() {
                    Ok(g) => *g,
                    Err(e) => *e.into_inner(),
                };
                (id, st)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const POLICY: Option<BreakerPolicy> = Some(BreakerPolicy {
        threshold: 3,
        disable_secs: 60,
    });

    #[test]
    fn trips_on_third_consecutive_failure_and_recovers_after_window() {
        let cb = CircuitBreaker::new();
        let t0 = 1_000_000;
        assert_eq!(cb.record_failure("a", POLICY, t0), FailureEffect::Counted(1));
        assert_eq!(cb.record_failure("a", POLICY, t0), FailureEffect::Counted(2));
        assert!(cb.is_eligible("a", t0));

        let effect = cb.record_failure("a", POLICY, t0);
        assert_eq!(
            effect,
            FailureEffect::Opened {
                until_ms: t0 + 60_000
            }
        );
        assert!(!cb.is_eligible("a", t0));
        assert!(!cb.is_eligible("a", t0 + 59_999));
        assert!(cb.is_eligible("a", t0 + 60_000));
        assert_eq!(cb.circuit_state("a").consecutive_fails, 3);
    }

    #[test]
    fn half_open_failure_reopens_with_fresh_window() {
        let cb = CircuitBreaker::new();
        for _ in 0..3 {
            cb.record_failure("a", POLICY, 0);
        }
        let later = 61_000;
        assert!(cb.is_eligible("a", later));
        assert_eq!(
            cb.record_failure("a", POLICY, later),
            FailureEffect::Opened {
                until_ms: later + 60_000
            }
        );
        assert_eq!(cb.circuit_state("a").consecutive_fails, 3);
        assert!(!cb.is_eligible("a", later + 1));
    }

    #[test]
    fn success_resets_the_streak() {
        let cb = CircuitBreaker::new();
        cb.record_failure("a", POLICY, 0);
        cb.record_failure("a", POLICY, 0);
        cb.record_success("a");
        assert_eq!(cb.circuit_state("a"), CircuitState::default());

        cb.record_failure("a", POLICY, 0);
        cb.record_failure("a", POLICY, 0);
        assert!(cb.is_eligible("a", 0));
    }

    #[test]
    fn channels_without_threshold_never_open() {
        let cb = CircuitBreaker::new();
        for _ in 0..100 {
            cb.record_failure("a", None, 0);
        }
        assert!(cb.is_eligible("a", 0));
        assert_eq!(cb.circuit_state("a").consecutive_fails, 100);
        assert_eq!(cb.circuit_state("a").disabled_until_ms, None);
    }

    #[test]
    fn forget_and_retain_drop_deleted_channels() {
        let cb = CircuitBreaker::new();
        for _ in 0..3 {
            cb.record_failure("a", POLICY, 0);
            cb.record_failure("b", POLICY, 0);
        }
        cb.forget("a");
        assert!(cb.is_eligible("a", 0));
        cb.retain_known(&HashSet::new());
        assert!(cb.snapshot().is_empty());
    }

    #[test]
    fn concurrent_failures_are_all_counted() {
        let cb = Arc::new(CircuitBreaker::new());
        let handles = (0..8)
            .map(|_| {
                let cb = cb.clone();
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        cb.record_failure("shared", None, 0);
                        cb.record_failure("other", None, 0);
                    }
                })
            })
            .collect::<Vec<_>>();
        for h in handles {
            h.join().expect("join");
        }
        assert_eq!(cb.circuit_state("shared").consecutive_fails, 8000);
        assert_eq!(cb.circuit_state("other").consecutive_fails, 8000);
    }
}
