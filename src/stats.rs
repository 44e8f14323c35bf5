//! Success/fail counters per channel, per calendar day, and all-time.
//!
//! Counters are plain atomics. Totals are never stored separately: a snapshot sums the per-channel
//! cells it read, so `sum(by_channel_id) == total` holds for every snapshot. Writers bump the
//! all-time cell before the day cell and readers load day cells before all-time cells, so a
//! snapshot can never report more outcomes today than in total.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use anyhow::{Context, Result};
use chrono::{DateTime, Days, FixedOffset, NaiveDate, Offset, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Fail,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Counts {
    pub success: u64,
    pub fail: u64,
}

impl Counts {
    fn add(&mut self, other: Counts) {
        self.success = self.success.saturating_add(other.success);
        self.fail = self.fail.saturating_add(other.fail);
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DayCounts {
    pub date: NaiveDate,
    pub success: u64,
    pub fail: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub total: Counts,
    pub today: DayCounts,
    pub by_channel_id: BTreeMap<String, Counts>,
    pub today_by_channel_id: BTreeMap<String, Counts>,
    /// Every retained day, oldest first (includes today when it has outcomes).
    pub days: Vec<DayCounts>,
}

/// On-disk form of `stats.json`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PersistedStats {
    #[serde(default)]
    pub by_channel_id: HashMap<String, Counts>,
    #[serde(default)]
    pub days: BTreeMap<NaiveDate, HashMap<String, Counts>>,
}

#[derive(Default)]
struct OutcomeCell {
    success: AtomicU64,
    fail: AtomicU64,
}

impl OutcomeCell {
    fn from_counts(c: Counts) -> Self {
        Self {
            success: AtomicU64::new(c.success),
            fail: AtomicU64::new(c.fail),
        }
    }

    fn bump(&self, outcome: Outcome) {
        match outcome {
            Outcome::Success => self.success.fetch_add(1, Ordering::AcqRel),
            Outcome::Fail => self.fail.fetch_add(1, Ordering::AcqRel),
        };
    }

    fn load(&self) -> Counts {
        Counts {
            success: self.success.load(Ordering::Acquire),
            fail: self.fail.load(Ordering::Acquire),
        }
    }
}

type CellMap = RwLock<HashMap<String, Arc<OutcomeCell>>>;

fn cell_in(map: &CellMap, channel_id: &str) -> Arc<OutcomeCell> {
    {
        let m = match map.read() {
            Ok(m) => m,
            Err(e) => e.into_inner(),
        };
        if let Some(c) = m.get(channel_id) {
            return c.clone();
        }
    }
    let mut m = match map.write() {
        Ok(m) => m,
        Err(e) => e.into_inner(),
    };
    m.entry(channel_id.to_string()).or_default().clone()
}

fn load_all(map: &CellMap) -> BTreeMap<String, Counts> {
    let cells = {
        let m = match map.read() {
            Ok(m) => m,
            Err(e) => e.into_inner(),
        };
        m.iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect::<Vec<_>>()
    };
    cells.into_iter().map(|(k, c)| (k, c.load())).collect()
}

fn sum(counts: &BTreeMap<String, Counts>) -> Counts {
    let mut out = Counts::default();
    for c in counts.values() {
        out.add(*c);
    }
    out
}

pub struct StatsAggregator {
    offset: FixedOffset,
    history_days: usize,
    all_time: CellMap,
    days: RwLock<BTreeMap<NaiveDate, Arc<CellMap>>>,
}

impl StatsAggregator {
    pub fn new(utc_offset_minutes: i32, history_days: usize) -> Self {
        let offset = FixedOffset::east_opt(utc_offset_minutes.saturating_mul(60))
            .unwrap_or_else(|| Utc.fix());
        Self {
            offset,
            history_days: history_days.max(1),
            all_time: RwLock::new(HashMap::new()),
            days: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn day_of(&self, at: DateTime<Utc>) -> NaiveDate {
        at.with_timezone(&self.offset).date_naive()
    }

    fn day_bucket(&self, date: NaiveDate) -> Arc<CellMap> {
        {
            let days = match self.days.read() {
                Ok(d) => d,
                Err(e) => e.into_inner(),
            };
            if let Some(b) = days.get(&date) {
                return b.clone();
            }
        }
        let mut days = match self.days.write() {
            Ok(d) => d,
            Err(e) => e.into_inner(),
        };
        let bucket = days.entry(date).or_default().clone();
        // Opening a new day is the only time history is trimmed.
        if let Some(cutoff) = date.checked_sub_days(Days::new(self.history_days as u64)) {
            days.retain(|d, _| *d > cutoff);
        }
        bucket
    }

    pub fn record_outcome(&self, channel_id: &str, outcome: Outcome, at: DateTime<Utc>) {
        cell_in(&self.all_time, channel_id).bump(outcome);
        let bucket = self.day_bucket(self.day_of(at));
        cell_in(&bucket, channel_id).bump(outcome);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        self.snapshot_at(Utc::now())
    }

    pub fn snapshot_at(&self, now: DateTime<Utc>) -> StatsSnapshot {
        let today_date = self.day_of(now);
        let buckets = {
            let days = match self.days.read() {
                Ok(d) => d,
                Err(e) => e.into_inner(),
            };
            days.iter()
                .map(|(d, b)| (*d, b.clone()))
                .collect::<Vec<_>>()
        };

        // Day cells first, all-time cells last.
        let mut days = Vec::with_capacity(buckets.len());
        let mut today_by_channel_id = BTreeMap::new();
        for (date, bucket) in buckets {
            let per_channel = load_all(&bucket);
            let c = sum(&per_channel);
            days.push(DayCounts {
                date,
                success: c.success,
                fail: c.fail,
            });
            if date == today_date {
                today_by_channel_id = per_channel;
            }
        }
        let today_total = sum(&today_by_channel_id);
        let by_channel_id = load_all(&self.all_time);
        let total = sum(&by_channel_id);

        StatsSnapshot {
            total,
            today: DayCounts {
                date: today_date,
                success: today_total.success,
                fail: today_total.fail,
            },
            by_channel_id,
            today_by_channel_id,
            days,
        }
    }

    pub fn to_persisted(&self) -> PersistedStats {
        let buckets = {
            let days = match self.days.read() {
                Ok(d) => d,
                Err(e) => e.into_inner(),
            };
            days.iter()
                .map(|(d, b)| (*d, b.clone()))
                .collect::<Vec<_>>()
        };
        let days = buckets
            .into_iter()
            .map(|(d, b)| (d, load_all(&b).into_iter().collect()))
            .collect();
        PersistedStats {
            by_channel_id: load_all(&self.all_time).into_iter().collect(),
            days,
        }
    }

    pub fn from_persisted(
        persisted: PersistedStats,
        utc_offset_minutes: i32,
        history_days: usize,
    ) -> Self {
        let agg = Self::new(utc_offset_minutes, history_days);
        {
            let mut all = match agg.all_time.write() {
                Ok(m) => m,
                Err(e) => e.into_inner(),
            };
            for (id, c) in persisted.by_channel_id {
                all.insert(id, Arc::new(OutcomeCell::from_counts(c)));
            }
        }
        let today = agg.day_of(Utc::now());
        let cutoff = today.checked_sub_days(Days::new(agg.history_days as u64));
        {
            let mut days = match agg.days.write() {
                Ok(d) => d,
                Err(e) => e.into_inner(),
            };
            for (date, per_channel) in persisted.days {
                if cutoff.is_some_and(|c| date <= c) {
                    continue;
                }
                let cells = per_channel
                    .into_iter()
                    .map(|(id, c)| (id, Arc::new(OutcomeCell::from_counts(c))))
                    .collect::<HashMap<_, _>>();
                days.insert(date, Arc::new(RwLock::new(cells)));
            }
        }
        agg
    }

    pub async fn load_or_new(
        path: &Path,
        utc_offset_minutes: i32,
        history_days: usize,
    ) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::new(utc_offset_minutes, history_days));
        }
        let bytes = tokio::fs::read(path)
            .await
            .with_context(|| format!("failed to read {:?}", path))?;
        let persisted: PersistedStats = serde_json::from_slice(&bytes)
            .with_context(|| format!("invalid stats file {:?}", path))?;
        Ok(Self::from_persisted(
            persisted,
            utc_offset_minutes,
            history_days,
        ))
    }

    pub async fn save(&self, path: &Path) -> Result<()> {
        let data = serde_json::to_vec_pretty(&self.to_persisted())?;
        if let Some(dir) = path.parent() {
            tokio::fs::create_dir_all(dir).await?;
        }
        let mut tmp = path.as_os_str().to_owned();
        tmp.push(".tmp");
        let tmp = std::path::PathBuf::from(tmp);
        tokio::fs::write(&tmp, &data).await?;
        tokio::fs::rename(&tmp, path).await?;
        Ok(())
    }
}
