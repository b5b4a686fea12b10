//! Reconciles bundled broker definitions with the vault.
//!
//! Runs once per app version (a marker in the vault's meta table makes the
//! pass idempotent) and again whenever the scheduler asks. New brokers are
//! inserted with scan jobs due immediately; stored brokers are replaced only
//! when the bundled version is strictly greater, and that upgrade resets the
//! attempt counts of the broker's opt-out jobs so stalled removals get a
//! fresh budget under the fixed script.

use super::{compare_versions, registry::BrokerRegistry, DataBroker};
use crate::events::{EngineEvent, EventBus};
use crate::vault::Vault;
use anyhow::Result;
use chrono::Utc;
use std::cmp::Ordering;
use std::sync::Arc;

const VERSION_MARKER_KEY: &str = "last_checked_app_version";

/// What one reconciliation pass changed.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct UpdateSummary {
    pub added: usize,
    pub upgraded: usize,
}

pub struct BrokerUpdater {
    vault: Arc<Vault>,
    registry: BrokerRegistry,
    app_version: String,
}

impl BrokerUpdater {
    pub fn new(vault: Arc<Vault>, registry: BrokerRegistry, app_version: &str) -> Self {
        Self {
            vault,
            registry,
            app_version: app_version.to_string(),
        }
    }

    /// Run the reconciliation pass unless it already ran for this app
    /// version. Returns whether a pass actually ran.
    pub fn check_for_updates(&self, bus: &EventBus) -> Result<bool> {
        if self.vault.meta_get(VERSION_MARKER_KEY)?.as_deref() == Some(self.app_version.as_str()) {
            tracing::debug!(
                version = %self.app_version,
                "broker definitions already reconciled for this version"
            );
            return Ok(false);
        }
        self.update_all(bus)?;
        self.vault.meta_set(VERSION_MARKER_KEY, &self.app_version)?;
        Ok(true)
    }

    /// Reconcile every bundled definition against the vault.
    ///
    /// A single broker failing to persist is logged and skipped; the pass
    /// itself only errors if the vault is unusable for the query list.
    pub fn update_all(&self, bus: &EventBus) -> Result<UpdateSummary> {
        let definitions = self.registry.load_all(bus);
        let queries = self.vault.fetch_all_profile_queries()?;
        let query_ids: Vec<i64> = queries.iter().filter_map(|q| q.id).collect();

        let mut summary = UpdateSummary::default();
        for incoming in &definitions {
            match self.reconcile_one(incoming, &query_ids, bus) {
                Ok(Reconciled::Added) => summary.added += 1,
                Ok(Reconciled::Upgraded) => summary.upgraded += 1,
                Ok(Reconciled::Unchanged) => {}
                Err(e) => {
                    tracing::error!(broker = %incoming.url, "reconciliation failed: {e:#}");
                }
            }
        }
        tracing::info!(
            brokers = definitions.len(),
            added = summary.added,
            upgraded = summary.upgraded,
            "broker reconciliation pass complete"
        );
        Ok(summary)
    }

    fn reconcile_one(
        &self,
        incoming: &DataBroker,
        query_ids: &[i64],
        bus: &EventBus,
    ) -> Result<Reconciled> {
        let now = Utc::now();
        match self.vault.fetch_broker_by_url(&incoming.url)? {
            None => {
                let broker_id = self.vault.save_broker(incoming)?;
                // New broker: every active query gets a scan due right now.
                for &query_id in query_ids {
                    self.vault.create_scan_job(broker_id, query_id, now)?;
                }
                tracing::info!(broker = %incoming.url, version = %incoming.version, "broker added");
                Ok(Reconciled::Added)
            }
            Some(stored) => {
                if compare_versions(&incoming.version, &stored.version) != Ordering::Greater {
                    return Ok(Reconciled::Unchanged);
                }
                let broker_id = stored
                    .id
                    .ok_or_else(|| anyhow::anyhow!("stored broker has no id: {}", stored.url))?;
                let affected = self.vault.apply_broker_upgrade(broker_id, incoming)?;
                // Queries added since the broker first landed still need rows.
                for &query_id in query_ids {
                    self.vault.create_scan_job(broker_id, query_id, now)?;
                }
                tracing::info!(
                    broker = %incoming.url,
                    from = %stored.version,
                    to = %incoming.version,
                    opt_outs_reset = affected.len(),
                    "broker upgraded"
                );
                bus.emit(EngineEvent::BrokerUpgraded {
                    broker_url: incoming.url.clone(),
                    from_version: stored.version.clone(),
                    to_version: incoming.version.clone(),
                    opt_outs_reset: affected.len(),
                });
                Ok(Reconciled::Upgraded)
            }
        }
    }
}

enum Reconciled {
    Added,
    Upgraded,
    Unchanged,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::ProfileQuery;
    use tempfile::TempDir;

    fn broker_json(url: &str, version: &str) -> String {
        format!(
            r#"{{
                "name": "Broker {url}", "url": "{url}", "version": "{version}",
                "steps": [
                    {{ "stepType": "scan", "actions": [
                        {{ "actionType": "navigate", "url": "https://{url}/?q=${{lastName}}" }}
                    ]}}
                ]
            }}"#
        )
    }

    fn updater_with(dir: &TempDir, vault: Arc<Vault>) -> BrokerUpdater {
        BrokerUpdater::new(vault, BrokerRegistry::new(dir.path()), "0.3.1")
    }

    #[test]
    fn test_new_broker_seeds_due_scan_jobs() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("a.json"), broker_json("a.com", "1.0")).unwrap();

        let vault = Arc::new(Vault::open_in_memory().unwrap());
        vault
            .save_profile_query(&ProfileQuery::new("Jane", "Doe", "Miami", "FL"))
            .unwrap();

        let bus = EventBus::new(16);
        let summary = updater_with(&dir, vault.clone()).update_all(&bus).unwrap();
        assert_eq!(summary, UpdateSummary { added: 1, upgraded: 0 });

        let due = vault.fetch_due_scans(Utc::now()).unwrap();
        assert_eq!(due.len(), 1);
    }

    #[test]
    fn test_equal_or_lower_version_is_unchanged() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("a.json"), broker_json("a.com", "1.2")).unwrap();

        let vault = Arc::new(Vault::open_in_memory().unwrap());
        let bus = EventBus::new(16);
        let updater = updater_with(&dir, vault.clone());
        updater.update_all(&bus).unwrap();

        // Same version again: nothing happens.
        let summary = updater.update_all(&bus).unwrap();
        assert_eq!(summary, UpdateSummary::default());

        // Lower bundled version never downgrades.
        std::fs::write(dir.path().join("a.json"), broker_json("a.com", "1.1")).unwrap();
        let summary = updater.update_all(&bus).unwrap();
        assert_eq!(summary, UpdateSummary::default());
        assert_eq!(
            vault.fetch_broker_by_url("a.com").unwrap().unwrap().version,
            "1.2"
        );
    }

    #[test]
    fn test_upgrade_emits_event_and_resets_attempts() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("a.json"), broker_json("a.com", "1.2")).unwrap();

        let vault = Arc::new(Vault::open_in_memory().unwrap());
        let query_id = vault
            .save_profile_query(&ProfileQuery::new("Jane", "Doe", "Miami", "FL"))
            .unwrap();
        let bus = EventBus::new(16);
        let updater = updater_with(&dir, vault.clone());
        updater.update_all(&bus).unwrap();

        // A stalled opt-out with spent attempts.
        let broker_id = vault.fetch_broker_by_url("a.com").unwrap().unwrap().id.unwrap();
        let now = Utc::now();
        let summary = vault
            .record_scan_outcome(
                broker_id,
                query_id,
                &[crate::broker::ExtractedProfileRecord {
                    id: None,
                    broker_id: None,
                    profile_query_id: None,
                    profile_url: "https://a.com/p/1".to_string(),
                    full_name: "Jane Doe".to_string(),
                    age: None,
                    addresses: vec![],
                    relatives: vec![],
                    email: None,
                    removed_date: None,
                }],
                now,
                now + chrono::Duration::days(1),
                now,
            )
            .unwrap();
        vault.update_attempt_count(summary.new_profile_ids[0], 3).unwrap();

        // "1.10" beats "1.2" numerically.
        std::fs::write(dir.path().join("a.json"), broker_json("a.com", "1.10")).unwrap();
        let mut rx = bus.subscribe();
        let update = updater.update_all(&bus).unwrap();
        assert_eq!(update, UpdateSummary { added: 0, upgraded: 1 });

        match rx.try_recv().unwrap() {
            EngineEvent::BrokerUpgraded {
                from_version,
                to_version,
                opt_outs_reset,
                ..
            } => {
                assert_eq!(from_version, "1.2");
                assert_eq!(to_version, "1.10");
                assert_eq!(opt_outs_reset, 1);
            }
            other => panic!("unexpected event: {other:?}"),
        }

        let job = vault.fetch_opt_out(summary.new_profile_ids[0]).unwrap().unwrap();
        assert_eq!(job.attempt_count, 0);
    }

    #[test]
    fn test_check_for_updates_runs_once_per_version() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("a.json"), broker_json("a.com", "1.0")).unwrap();

        let vault = Arc::new(Vault::open_in_memory().unwrap());
        let bus = EventBus::new(16);
        let updater = updater_with(&dir, vault.clone());

        assert!(updater.check_for_updates(&bus).unwrap());
        assert!(!updater.check_for_updates(&bus).unwrap());

        // A new app version re-arms the pass.
        let updater = BrokerUpdater::new(vault, BrokerRegistry::new(dir.path()), "0.4.0");
        assert!(updater.check_for_updates(&bus).unwrap());
    }
}
