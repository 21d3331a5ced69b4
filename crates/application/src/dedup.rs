//! 有界的消息 id 去重窗口

use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};

/// 记录时间加插入序号，保证同一时刻记录的 id 也有确定的先后
type AgeKey = (Instant, u64);

#[derive(Debug)]
pub struct DedupCache {
    capacity: usize,
    ttl: Duration,
    next_seq: u64,
    seen: HashMap<String, AgeKey>,
    by_age: BTreeMap<AgeKey, String>,
}

impl DedupCache {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            capacity: capacity.max(1),
            ttl,
            next_seq: 0,
            seen: HashMap::new(),
            by_age: BTreeMap::new(),
        }
    }

    /// 记录一个 id，已存在时返回 `false`。
    ///
    /// 超出容量时淘汰记录时间最早的条目。
    pub fn check_and_record(&mut self, id: &str, now: Instant) -> bool {
        if self.seen.contains_key(id) {
            return false;
        }
        let key = (now, self.next_seq);
        self.next_seq += 1;
        self.seen.insert(id.to_owned(), key);
        self.by_age.insert(key, id.to_owned());

        while self.seen.len() > self.capacity {
            let Some((_, oldest)) = self.by_age.pop_first() else {
                break;
            };
            self.seen.remove(&oldest);
        }
        true
    }

    /// 清除超过存活时间的记录，返回清除数量
    pub fn sweep(&mut self, now: Instant) -> usize {
        let mut removed = 0;
        while let Some(entry) = self.by_age.first_entry() {
            let (recorded, _) = *entry.key();
            if now.saturating_duration_since(recorded) < self.ttl {
                break;
            }
            let id = entry.remove();
            self.seen.remove(&id);
            removed += 1;
        }
        removed
    }

    pub fn contains(&self, id: &str) -> bool {
        self.seen.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_sighting_is_a_duplicate() {
        let mut cache = DedupCache::new(10, Duration::from_secs(60));
        let now = Instant::now();
        assert!(cache.check_and_record("a-1-0", now));
        assert!(!cache.check_and_record("a-1-0", now));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn evicts_oldest_beyond_capacity() {
        let mut cache = DedupCache::new(3, Duration::from_secs(60));
        let start = Instant::now();
        for i in 0..5u64 {
            let id = format!("id-{i}");
            assert!(cache.check_and_record(&id, start + Duration::from_millis(i)));
        }
        assert_eq!(cache.len(), 3);
        assert!(!cache.contains("id-0"));
        assert!(!cache.contains("id-1"));
        assert!(cache.contains("id-4"));
    }

    #[test]
    fn eviction_keeps_recording_order_for_equal_timestamps() {
        let mut cache = DedupCache::new(2, Duration::from_secs(60));
        let now = Instant::now();
        for id in ["a", "b", "c"] {
            assert!(cache.check_and_record(id, now));
        }
        assert!(!cache.contains("a"));
        assert!(cache.contains("b"));
        assert!(cache.contains("c"));
        // 已淘汰的 id 可以重新记录
        assert!(cache.check_and_record("a", now));
        assert!(!cache.contains("b"));
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn sweep_drops_expired_entries() {
        let mut cache = DedupCache::new(100, Duration::from_secs(60));
        let start = Instant::now();
        cache.check_and_record("old", start);
        cache.check_and_record("fresh", start + Duration::from_secs(50));

        let removed = cache.sweep(start + Duration::from_secs(61));
        assert_eq!(removed, 1);
        assert!(!cache.contains("old"));
        assert!(cache.contains("fresh"));
    }
}
