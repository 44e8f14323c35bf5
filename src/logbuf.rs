//! Bounded in-memory log served at `/admin/logs`.

use std::collections::VecDeque;
use std::sync::Mutex;

use chrono::{FixedOffset, Offset, Utc};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Info,
    Warn,
}

pub struct LogBuffer {
    capacity: usize,
    offset: FixedOffset,
    entries: Mutex<VecDeque<String>>,
}

impl LogBuffer {
    /// Timestamps are rendered in the same fixed offset the stats day buckets use.
    pub fn new(capacity: usize, utc_offset_minutes: i32) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            offset: FixedOffset::east_opt(utc_offset_minutes.saturating_mul(60))
                .unwrap_or_else(|| Utc.fix()),
            entries: Mutex::new(VecDeque::with_capacity(capacity)),
        }
    }

    pub fn info(&self, message: impl AsRef<str>) {
        self.append(LogLevel::Info, message.as_ref());
    }

    pub fn warn(&self, message: impl AsRef<str>) {
        self.append(LogLevel::Warn, message.as_ref());
    }

    /// Stores `[YYYY-MM-DD HH:MM:SS] message`, evicting the oldest line when full. Also mirrored to
    /// tracing.
    pub fn append(&self, level: LogLevel, message: &str) {
        match level {
            LogLevel::Info => tracing::info!(target: "catfish_agg::events", "{message}"),
            LogLevel::Warn => tracing::warn!(target: "catfish_agg::events", "{message}"),
        }
        let ts = Utc::now().with_timezone(&self.offset);
        let line = format!("[{}] {}", ts.format("%Y-%m-%d %H:%M:%S"), message);

        let mut entries = match self.entries.lock() {
            Ok(g) => g,
            Err(e) => e.into_inner(),
        };
        while entries.len() >= self.capacity {
            entries.pop_front();
        }
        entries.push_back(line);
    }

    /// Most recent `limit` lines, oldest first. `None` returns everything retained.
    pub fn recent(&self, limit: Option<usize>) -> Vec<String> {
        let entries = match self.entries.lock() {
            Ok(g) => g,
            Err(e) => e.into_inner(),
        };
        let n = limit.unwrap_or(entries.len()).min(entries.len());
        entries.iter().skip(entries.len() - n).cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn message(line: &str) -> &str {
        line.split_once("] ").map(|(_, m)| m).unwrap_or(line)
    }

    #[test]
    fn evicts_oldest_first() {
        let buf = LogBuffer::new(3, 0);
        for i in 0..5 {
            buf.info(format!("line {i}"));
        }
        let lines = buf.recent(None);
        let msgs = lines.iter().map(|l| message(l)).collect::<Vec<_>>();
        assert_eq!(msgs, vec!["line 2", "line 3", "line 4"]);
    }

    #[test]
    fn recent_limits_to_newest_lines() {
        let buf = LogBuffer::new(10, 0);
        buf.info("a");
        buf.warn("b");
        buf.info("c");
        let lines = buf.recent(Some(2));
        assert_eq!(message(&lines[0]), "b");
        assert_eq!(message(&lines[1]), "c");
        assert_eq!(buf.recent(Some(100)).len(), 3);
        assert!(buf.recent(Some(0)).is_empty());
    }

    #[test]
    fn lines_carry_a_bracketed_timestamp() {
        let buf = LogBuffer::new(1, 480);
        buf.info("hello");
        let line = &buf.recent(None)[0];
        // "[YYYY-MM-DD HH:MM:SS] hello"
        assert_eq!(line.len(), "[2026-01-01 00:00:00] hello".len());
        assert!(line.starts_with('['));
        assert!(line.ends_with("] hello"));
    }
}
