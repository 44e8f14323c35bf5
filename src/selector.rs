//! Candidate selection: priority tiers, round-robin inside a tier, breaker filtering.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};

use crate::breaker::CircuitBreaker;
use crate::config::{ChannelConfig, ProxyConfig, SchemeConfig};
use crate::error::ProxyError;

type GroupKey = (String, i64);

#[derive(Debug, Clone)]
pub struct Selection {
    pub scheme: String,
    /// True when the requested name matched no scheme and the default one was used.
    pub fell_back: bool,
    /// Channels to try, in order.
    pub candidates: Vec<ChannelConfig>,
    /// Channels skipped because their circuit is open.
    pub disabled: Vec<String>,
}

/// Owns one round-robin cursor per (scheme, priority) group.
#[derive(Default)]
pub struct CandidateSelector {
    cursors: RwLock<HashMap<GroupKey, Arc<AtomicUsize>>>,
}

impl CandidateSelector {
    pub fn new() -> Self {
        Self::default()
    }

    fn cursor(&self, scheme: &str, priority: i64) -> Arc<AtomicUsize> {
        let key = (scheme.to_string(), priority);
        {
            let map = match self.cursors.read() {
                Ok(m) => m,
                Err(e) => e.into_inner(),
            };
            if let Some(c) = map.get(&key) {
                return c.clone();
            }
        }
        let mut map = match self.cursors.write() {
            Ok(m) => m,
            Err(e) => e.into_inner(),
        };
        map.entry(key).or_default().clone()
    }

    /// Returns the rotation start for a group of `len` members and advances the cursor by one.
    fn advance(&self, scheme: &str, priority: i64, len: usize) -> usize {
        if len == 0 {
            return 0;
        }
        let cursor = self.cursor(scheme, priority);
        let prev = match cursor.fetch_update(Ordering::AcqRel, Ordering::Acquire, |c| {
            Some((c % len + 1) % len)
        }) {
            Ok(v) | Err(v) => v,
        };
        prev % len
    }

    pub fn select(
        &self,
        cfg: &ProxyConfig,
        requested: &str,
        breaker: &CircuitBreaker,
        now_ms: u64,
    ) -> Result<Selection, ProxyError> {
        let (scheme, fell_back) = cfg
            .resolve_scheme(requested)
            .ok_or_else(|| ProxyError::SchemeNotFound(requested.to_string()))?;
        let (candidates, disabled) = self.order_scheme(scheme, breaker, now_ms);
        if candidates.is_empty() {
            return Err(ProxyError::NoEligibleChannel {
                scheme: scheme.name.clone(),
            });
        }
        Ok(Selection {
            scheme: scheme.name.clone(),
            fell_back,
            candidates,
            disabled,
        })
    }

    /// Orders a scheme's channels without resolving names. Every tier's cursor is advanced, even
    /// when all of its members are currently disabled.
    pub fn order_scheme(
        &self,
        scheme: &SchemeConfig,
        breaker: &CircuitBreaker,
        now_ms: u64,
    ) -> (Vec<ChannelConfig>, Vec<String>) {
        let mut tiers: BTreeMap<i64, Vec<&ChannelConfig>> = BTreeMap::new();
        for ch in &scheme.channels {
            tiers.entry(ch.priority).or_default().push(ch);
        }

        let mut candidates = Vec::with_capacity(scheme.channels.len());
        let mut disabled = Vec::new();
        for (priority, members) in tiers {
            let start = self.advance(&scheme.name, priority, members.len());
            for i in 0..members.len() {
                let ch = members[(start + i) % members.len()];
                if breaker.is_eligible(&ch.id, now_ms) {
                    candidates.push(ch.clone());
                } else {
                    disabled.push(ch.id.clone());
                }
            }
        }
        (candidates, disabled)
    }

    /// Drops cursors for (scheme, priority) groups that no longer exist.
    pub fn retain_known(&self, cfg: &ProxyConfig) {
        let known = cfg
            .schemes
            .iter()
            .flat_map(|s| s.channels.iter().map(|c| (s.name.clone(), c.priority)))
            .collect::<HashSet<_>>();
        let mut map = match self.cursors.write() {
            Ok(m) => m,
            Err(e) => e.into_inner(),
        };
        map.retain(|k, _| known.contains(k));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::breaker::BreakerPolicy;
    use pretty_assertions::assert_eq;

    fn channel(id: &str, priority: i64) -> ChannelConfig {
        ChannelConfig {
            id: id.to_string(),
            priority,
            base_url: "http://127.0.0.1:9/v1".to_string(),
            api_key: Some("k".to_string()),
            api_key_env: None,
            model: None,
            failure_threshold: None,
            disable_secs: None,
        }
    }

    fn config(schemes: Vec<(&str, Vec<ChannelConfig>)>) -> ProxyConfig {
        ProxyConfig {
            schemes: schemes
                .into_iter()
                .map(|(name, channels)| SchemeConfig {
                    name: name.to_string(),
                    channels,
                })
                .collect(),
            ..Default::default()
        }
    }

    fn ids(sel: &Selection) -> Vec<&str> {
        sel.candidates.iter().map(|c| c.id.as_str()).collect()
    }

    #[test]
    fn lower_priority_tiers_come_first_and_rotate() {
        let cfg = config(vec![(
            "pool",
            vec![channel("c", 2), channel("a", 1), channel("b", 1)],
        )]);
        let sel = CandidateSelector::new();
        let cb = CircuitBreaker::new();

        let first = sel.select(&cfg, "pool", &cb, 0).unwrap();
        assert_eq!(ids(&first), vec!["a", "b", "c"]);
        let second = sel.select(&cfg, "pool", &cb, 0).unwrap();
        assert_eq!(ids(&second), vec!["b", "a", "c"]);
        let third = sel.select(&cfg, "pool", &cb, 0).unwrap();
        assert_eq!(ids(&third), vec!["a", "b", "c"]);
    }

    #[test]
    fn round_robin_is_fair_over_many_selections() {
        let cfg = config(vec![(
            "pool",
            vec![channel("a", 1), channel("b", 1), channel("c", 1)],
        )]);
        let sel = CandidateSelector::new();
        let cb = CircuitBreaker::new();
        let mut counts: HashMap<String, usize> = HashMap::new();
        let n = 100;
        for _ in 0..n {
            let s = sel.select(&cfg, "pool", &cb, 0).unwrap();
            *counts.entry(s.candidates[0].id.clone()).or_default() += 1;
        }
        for id in ["a", "b", "c"] {
            let c = counts[id];
            assert!(c == n / 3 || c == n / 3 + 1, "{id} chosen {c} times");
        }
    }

    #[test]
    fn disabled_channels_keep_their_turn_in_the_rotation() {
        let mut a = channel("a", 1);
        a.failure_threshold = Some(1);
        let cfg = config(vec![("pool", vec![a, channel("b", 1)])]);
        let sel = CandidateSelector::new();
        let cb = CircuitBreaker::new();
        cb.record_failure(
            "a",
            Some(BreakerPolicy {
                threshold: 1,
                disable_secs: 10,
            }),
            0,
        );

        let s1 = sel.select(&cfg, "pool", &cb, 1).unwrap();
        assert_eq!(ids(&s1), vec!["b"]);
        assert_eq!(s1.disabled, vec!["a".to_string()]);
        let s2 = sel.select(&cfg, "pool", &cb, 1).unwrap();
        assert_eq!(ids(&s2), vec!["b"]);

        // After recovery the rotation resumes where it would have been.
        let s3 = sel.select(&cfg, "pool", &cb, 10_000).unwrap();
        assert_eq!(ids(&s3), vec!["a", "b"]);
        let s4 = sel.select(&cfg, "pool", &cb, 10_000).unwrap();
        assert_eq!(ids(&s4), vec!["b", "a"]);
    }

    #[test]
    fn unknown_model_uses_first_scheme() {
        let cfg = config(vec![
            ("pool-a", vec![channel("a", 1)]),
            ("pool-b", vec![channel("b", 1)]),
        ]);
        let sel = CandidateSelector::new();
        let s = sel
            .select(&cfg, "unknown-scheme-xyz", &CircuitBreaker::new(), 0)
            .unwrap();
        assert_eq!(s.scheme, "pool-a");
        assert!(s.fell_back);
        assert_eq!(ids(&s), vec!["a"]);
    }

    #[test]
    fn all_disabled_or_empty_is_reported() {
        let cfg = config(vec![("pool", vec![channel("a", 1)]), ("empty", vec![])]);
        let sel = CandidateSelector::new();
        let cb = CircuitBreaker::new();
        cb.record_failure(
            "a",
            Some(BreakerPolicy {
                threshold: 1,
                disable_secs: 60,
            }),
            0,
        );
        assert!(matches!(
            sel.select(&cfg, "pool", &cb, 1),
            Err(ProxyError::NoEligibleChannel { scheme }) if scheme == "pool"
        ));
        assert!(matches!(
            sel.select(&cfg, "empty", &cb, 1),
            Err(ProxyError::NoEligibleChannel { .. })
        ));
        assert!(matches!(
            sel.select(&ProxyConfig::default(), "pool", &cb, 1),
            Err(ProxyError::SchemeNotFound(_))
        ));
    }

    #[test]
    fn cursor_survives_group_size_changes() {
        let sel = CandidateSelector::new();
        let cb = CircuitBreaker::new();
        let big = config(vec![(
            "pool",
            vec![channel("a", 1), channel("b", 1), channel("c", 1)],
        )]);
        sel.select(&big, "pool", &cb, 0).unwrap();
        sel.select(&big, "pool", &cb, 0).unwrap();
        let small = config(vec![("pool", vec![channel("a", 1)])]);
        let s = sel.select(&small, "pool", &cb, 0).unwrap();
        assert_eq!(ids(&s), vec!["a"]);
        sel.retain_known(&config(vec![]));
        assert!(sel.cursors.read().unwrap().is_empty());
    }
}
