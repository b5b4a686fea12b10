//! Bundled broker-definition loading.
//!
//! Definitions ship as one JSON file per broker in a directory. A single
//! file failing to read or decode is reported and skipped — one broken
//! broker must never block the rest of the fleet.

use super::DataBroker;
use crate::events::{EngineEvent, EventBus};
use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

/// Resolve the broker-definitions directory.
///
/// 1. `UNLIST_BROKERS_DIR` env
/// 2. `~/.unlist/brokers`
pub fn default_definitions_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("UNLIST_BROKERS_DIR") {
        if !dir.trim().is_empty() {
            return PathBuf::from(dir);
        }
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".unlist")
        .join("brokers")
}

/// Loads bundled broker definitions from a directory of JSON files.
pub struct BrokerRegistry {
    dir: PathBuf,
}

impl BrokerRegistry {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Load every parseable definition, skipping failures.
    ///
    /// Each skipped file is logged and surfaced as a
    /// [`EngineEvent::BrokerLoadFailed`] so telemetry collaborators can see
    /// broken bundles without this pass ever erroring as a whole. An absent
    /// directory yields an empty set (fresh installs before first sync).
    pub fn load_all(&self, bus: &EventBus) -> Vec<DataBroker> {
        let entries = match std::fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) => {
                tracing::warn!(
                    "broker definitions directory unavailable at {}: {e}",
                    self.dir.display()
                );
                return Vec::new();
            }
        };

        let mut brokers = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path();
            if !is_json(&path) {
                continue;
            }
            match load_one(&path) {
                Ok(broker) => brokers.push(broker),
                Err(e) => {
                    tracing::error!("skipping broker file {}: {e:#}", path.display());
                    bus.emit(EngineEvent::BrokerLoadFailed {
                        file: path.display().to_string(),
                        error: format!("{e:#}"),
                    });
                }
            }
        }

        // Deterministic order keeps updater runs and logs comparable.
        brokers.sort_by(|a, b| a.url.cmp(&b.url));
        brokers
    }
}

fn is_json(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| e.eq_ignore_ascii_case("json"))
        .unwrap_or(false)
}

fn load_one(path: &Path) -> Result<DataBroker> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let broker: DataBroker = serde_json::from_str(&raw)
        .with_context(|| format!("failed to decode {}", path.display()))?;
    Ok(broker)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const GOOD: &str = r#"{
        "name": "Example", "url": "example.com", "version": "1.0",
        "steps": [
            { "stepType": "scan", "actions": [
                { "actionType": "navigate", "url": "https://example.com/?q=${lastName}" }
            ]}
        ]
    }"#;

    #[test]
    fn test_load_all_skips_broken_files() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("example.json"), GOOD).unwrap();
        std::fs::write(dir.path().join("broken.json"), "{ not json").unwrap();
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let bus = EventBus::new(16);
        let mut rx = bus.subscribe();
        let brokers = BrokerRegistry::new(dir.path()).load_all(&bus);

        assert_eq!(brokers.len(), 1);
        assert_eq!(brokers[0].url, "example.com");

        // The broken file surfaced as an event, not an error.
        match rx.try_recv().unwrap() {
            EngineEvent::BrokerLoadFailed { file, .. } => assert!(file.contains("broken.json")),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn test_load_all_missing_dir_is_empty() {
        let bus = EventBus::new(16);
        let brokers = BrokerRegistry::new("/nonexistent/brokers").load_all(&bus);
        assert!(brokers.is_empty());
    }

    #[test]
    fn test_load_all_sorted_by_url() {
        let dir = TempDir::new().unwrap();
        let make = |url: &str| GOOD.replace("example.com", url);
        std::fs::write(dir.path().join("b.json"), make("zeta.com")).unwrap();
        std::fs::write(dir.path().join("a.json"), make("alpha.com")).unwrap();

        let bus = EventBus::new(16);
        let brokers = BrokerRegistry::new(dir.path()).load_all(&bus);
        let urls: Vec<_> = brokers.iter().map(|b| b.url.as_str()).collect();
        assert_eq!(urls, vec!["alpha.com", "zeta.com"]);
    }
}
