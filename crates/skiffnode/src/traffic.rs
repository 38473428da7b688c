//! Agent-side traffic counter collection.
//!
//! The forwarder exports monotonic per-client counters (keyed by the client
//! email tag the panel renders, `u<user>-p<proxy>`) into a stats file. Each
//! drain reads the file, subtracts the previously seen totals, and emits
//! one sample per client with positive deltas.

use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::PathBuf;
use tracing::{debug, warn};

use skiff_proto::TrafficSampleWire;

#[derive(Debug, Clone, Deserialize)]
struct CounterEntry {
    #[serde(default)]
    up: u64,
    #[serde(default)]
    down: u64,
}

/// Split a rendered client tag back into (user id, proxy id). Ids are
/// UUIDs, so `-p` cannot occur inside either half.
pub fn parse_client_tag(tag: &str) -> Option<(String, String)> {
    let rest = tag.strip_prefix('u')?;
    let (user, proxy) = rest.split_once("-p")?;
    if user.is_empty() || proxy.is_empty() {
        return None;
    }
    Some((user.to_string(), proxy.to_string()))
}

pub struct StatsFileSource {
    path: Option<PathBuf>,
    last_seen: HashMap<String, (u64, u64)>,
}

impl StatsFileSource {
    pub fn new(path: Option<PathBuf>) -> Self {
        Self {
            path,
            last_seen: HashMap::new(),
        }
    }

    /// Read the counters and emit deltas since the previous drain. A counter
    /// that went backwards (forwarder restart) is treated as a fresh start.
    pub fn drain(&mut self, now: DateTime<Utc>) -> Vec<TrafficSampleWire> {
        let Some(path) = &self.path else {
            return Vec::new();
        };
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Vec::new(),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "failed to read stats file");
                return Vec::new();
            }
        };
        let counters: HashMap<String, CounterEntry> = match serde_json::from_str(&content) {
            Ok(counters) => counters,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "stats file is not valid JSON");
                return Vec::new();
            }
        };

        let mut samples = Vec::new();
        for (tag, entry) in &counters {
            let Some((user_id, proxy_id)) = parse_client_tag(tag) else {
                debug!(tag = %tag, "skipping unrecognized client tag");
                continue;
            };
            let (last_up, last_down) = self.last_seen.get(tag).copied().unwrap_or((0, 0));
            let up_delta = if entry.up >= last_up { entry.up - last_up } else { entry.up };
            let down_delta = if entry.down >= last_down {
                entry.down - last_down
            } else {
                entry.down
            };
            if up_delta == 0 && down_delta == 0 {
                continue;
            }
            samples.push(TrafficSampleWire {
                user_id,
                proxy_id: Some(proxy_id),
                up_bytes: up_delta,
                down_bytes: down_delta,
                recorded_at: now,
            });
        }
        self.last_seen = counters
            .into_iter()
            .map(|(tag, entry)| (tag, (entry.up, entry.down)))
            .collect();
        samples
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_client_tag() {
        let (user, proxy) = parse_client_tag("u11111111-2222-ab-p3333-44").expect("parse");
        assert_eq!(user, "11111111-2222-ab");
        assert_eq!(proxy, "3333-44");

        assert!(parse_client_tag("api").is_none());
        assert!(parse_client_tag("u-p").is_none());
        assert!(parse_client_tag("no-prefix").is_none());
    }

    #[test]
    fn test_drain_emits_deltas_not_totals() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("stats.json");
        let mut source = StatsFileSource::new(Some(path.clone()));
        let now = Utc::now();

        std::fs::write(&path, r#"{"uA-pB": {"up": 100, "down": 50}}"#).expect("write");
        let first = source.drain(now);
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].up_bytes, 100);
        assert_eq!(first[0].down_bytes, 50);
        assert_eq!(first[0].user_id, "A");
        assert_eq!(first[0].proxy_id.as_deref(), Some("B"));

        std::fs::write(&path, r#"{"uA-pB": {"up": 160, "down": 50}}"#).expect("write");
        let second = source.drain(now);
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].up_bytes, 60);
        assert_eq!(second[0].down_bytes, 0);

        // Unchanged counters produce no samples.
        let third = source.drain(now);
        assert!(third.is_empty());
    }

    #[test]
    fn test_counter_reset_starts_fresh() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("stats.json");
        let mut source = StatsFileSource::new(Some(path.clone()));
        let now = Utc::now();

        std::fs::write(&path, r#"{"uA-pB": {"up": 1000, "down": 0}}"#).expect("write");
        source.drain(now);

        // Forwarder restarted; counters went backwards.
        std::fs::write(&path, r#"{"uA-pB": {"up": 40, "down": 0}}"#).expect("write");
        let samples = source.drain(now);
        assert_eq!(samples.len(), 1);
        assert_eq!(samples[0].up_bytes, 40);
    }

    #[test]
    fn test_missing_or_invalid_file_is_quiet() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("stats.json");
        let mut source = StatsFileSource::new(Some(path.clone()));
        assert!(source.drain(Utc::now()).is_empty());

        std::fs::write(&path, "not json").expect("write");
        assert!(source.drain(Utc::now()).is_empty());

        let mut disabled = StatsFileSource::new(None);
        assert!(disabled.drain(Utc::now()).is_empty());
    }
}
