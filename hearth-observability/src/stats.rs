use dashmap::DashMap;
use serde_json::{json, Map, Value};

/// Process-wide concurrent counters, grouped into named tags.
///
/// One instance backs three namespaces at once: `statistics`
/// (proxy served/probes/errors), `analytics` (ip/page/user), and
/// `blacklist` (per-IP probe counters). Increments are atomic; no
/// ordering is guaranteed between requests.
pub struct Stats {
    tags: DashMap<String, DashMap<String, u64>>,
}

impl Stats {
    pub fn new() -> Self {
        Self { tags: DashMap::new() }
    }

    /// Atomically add one to `tag/key`.
    pub fn inc(&self, tag: &str, key: &str) {
        let bucket = self.tags.entry(tag.to_string()).or_default();
        *bucket.entry(key.to_string()).or_insert(0) += 1;
    }

    /// Current value of one counter.
    pub fn get(&self, tag: &str, key: &str) -> u64 {
        self.tags
            .get(tag)
            .and_then(|bucket| bucket.get(key).map(|v| *v))
            .unwrap_or(0)
    }

    /// Snapshot one tag as a JSON object.
    pub fn snapshot_tag(&self, tag: &str) -> Value {
        match self.tags.get(tag) {
            Some(bucket) => {
                let mut map = Map::new();
                for item in bucket.iter() {
                    map.insert(item.key().clone(), json!(*item.value()));
                }
                Value::Object(map)
            }
            None => json!({}),
        }
    }

    /// Snapshot everything, tags as top-level keys.
    pub fn snapshot(&self) -> Value {
        let mut out = Map::new();
        for bucket in self.tags.iter() {
            out.insert(bucket.key().clone(), self.snapshot_tag(bucket.key()));
        }
        Value::Object(out)
    }
}

impl Default for Stats {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_start_at_zero_and_increment() {
        let stats = Stats::new();
        assert_eq!(stats.get("ip", "1.2.3.4"), 0);
        stats.inc("ip", "1.2.3.4");
        stats.inc("ip", "1.2.3.4");
        assert_eq!(stats.get("ip", "1.2.3.4"), 2);
    }

    #[test]
    fn tags_are_independent() {
        let stats = Stats::new();
        stats.inc("page", "/index.html");
        assert_eq!(stats.get("page", "/index.html"), 1);
        assert_eq!(stats.get("user", "/index.html"), 0);
    }

    #[test]
    fn snapshot_reflects_counts() {
        let stats = Stats::new();
        stats.inc("proxy", "served");
        stats.inc("proxy", "served");
        stats.inc("proxy", "errors");
        let snap = stats.snapshot_tag("proxy");
        assert_eq!(snap["served"], 2);
        assert_eq!(snap["errors"], 1);
        assert_eq!(stats.snapshot()["proxy"]["served"], 2);
    }

    #[test]
    fn concurrent_increments_all_land() {
        let stats = std::sync::Arc::new(Stats::new());
        let mut handles = Vec::new();
        for _ in 0..8 {
            let stats = std::sync::Arc::clone(&stats);
            handles.push(std::thread::spawn(move || {
                for _ in 0..100 {
                    stats.inc("ip", "9.9.9.9");
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(stats.get("ip", "9.9.9.9"), 800);
    }
}
