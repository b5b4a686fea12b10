//! End-to-end flow through the public API: bundled definitions are
//! reconciled into the vault, a scan finds a listing, an opt-out is
//! submitted, and a later confirmation scan retires the tuple.

use anyhow::Result as AnyResult;
use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

use unlist_runtime::broker::registry::BrokerRegistry;
use unlist_runtime::broker::updater::BrokerUpdater;
use unlist_runtime::broker::{Action, ExtractedProfileRecord, ProfileQuery};
use unlist_runtime::config::EngineConfig;
use unlist_runtime::driver::{ActionContext, ActionResult, Driver, DriverSession};
use unlist_runtime::events::{EngineEvent, EventBus};
use unlist_runtime::job::JobRunner;
use unlist_runtime::scheduler::Scheduler;
use unlist_runtime::services::{NoopCaptchaSolver, NoopEmailVerifier};
use unlist_runtime::vault::Vault;

const BROKER_JSON: &str = r##"{
    "name": "Example People Search",
    "url": "example.com",
    "version": "1.0",
    "steps": [
        { "stepType": "scan", "actions": [
            { "actionType": "navigate",
              "url": "https://example.com/search?fn=${firstName}&ln=${lastName}" },
            { "actionType": "extract", "selector": ".result",
              "profile": { "name": ".name", "profileUrl": "a.profile" } }
        ]},
        { "stepType": "optOut", "actions": [
            { "actionType": "navigate", "url": "${profileUrl}" },
            { "actionType": "extract", "selector": ".result",
              "profile": { "name": ".name", "profileUrl": "a.profile" } },
            { "actionType": "click", "selector": "#remove" }
        ]}
    ]
}"##;

struct ScriptedSession {
    results: VecDeque<ActionResult>,
}

#[async_trait]
impl DriverSession for ScriptedSession {
    async fn execute(
        &mut self,
        _action: &Action,
        _ctx: &ActionContext<'_>,
    ) -> AnyResult<ActionResult> {
        Ok(self.results.pop_front().unwrap_or(ActionResult::Completed))
    }
    async fn load(&mut self, _url: &str) -> AnyResult<ActionResult> {
        Ok(self.results.pop_front().unwrap_or(ActionResult::Completed))
    }
    async fn inject_captcha_token(&mut self, _token: &str) -> AnyResult<ActionResult> {
        Ok(ActionResult::Completed)
    }
    async fn current_url(&self) -> AnyResult<String> {
        Ok(String::new())
    }
    async fn finish(self: Box<Self>) -> AnyResult<()> {
        Ok(())
    }
}

struct ScriptedDriver {
    scripts: Mutex<VecDeque<Vec<ActionResult>>>,
}

impl ScriptedDriver {
    fn new(scripts: Vec<Vec<ActionResult>>) -> Self {
        Self {
            scripts: Mutex::new(scripts.into()),
        }
    }
}

#[async_trait]
impl Driver for ScriptedDriver {
    async fn new_session(&self) -> AnyResult<Box<dyn DriverSession>> {
        let results = self
            .scripts
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| anyhow::anyhow!("no scripted session left"))?;
        Ok(Box::new(ScriptedSession {
            results: results.into(),
        }))
    }
    async fn shutdown(&self) -> AnyResult<()> {
        Ok(())
    }
    fn active_sessions(&self) -> usize {
        0
    }
}

fn jane_listing() -> ExtractedProfileRecord {
    ExtractedProfileRecord {
        id: None,
        broker_id: None,
        profile_query_id: None,
        profile_url: "https://example.com/p/jane-doe-1".to_string(),
        full_name: "Jane Doe".to_string(),
        age: Some("44".to_string()),
        addresses: vec!["Miami, FL".to_string()],
        relatives: vec![],
        email: None,
        removed_date: None,
    }
}

struct Harness {
    scheduler: Scheduler,
    vault: Arc<Vault>,
    bus: Arc<EventBus>,
    cancel: Arc<AtomicBool>,
    _brokers_dir: TempDir,
}

fn harness(scripts: Vec<Vec<ActionResult>>) -> Harness {
    let brokers_dir = TempDir::new().unwrap();
    std::fs::write(brokers_dir.path().join("example.json"), BROKER_JSON).unwrap();

    let vault = Arc::new(Vault::open_in_memory().unwrap());
    vault
        .save_profile_query(&ProfileQuery::new("Jane", "Doe", "Miami", "FL"))
        .unwrap();

    let bus = Arc::new(EventBus::new(64));
    let mut config = EngineConfig::default();
    config.pacing = std::time::Duration::from_millis(1);
    config.retry_wait = std::time::Duration::from_millis(1);

    let cancel = Arc::new(AtomicBool::new(false));
    let runner = Arc::new(JobRunner::new(
        config.clone(),
        Arc::new(NoopCaptchaSolver),
        Arc::new(NoopEmailVerifier),
        Arc::clone(&cancel),
    ));
    let updater = Arc::new(BrokerUpdater::new(
        Arc::clone(&vault),
        BrokerRegistry::new(brokers_dir.path()),
        "0.0.0-test",
    ));
    let scheduler = Scheduler::new(
        Arc::clone(&vault),
        Arc::new(ScriptedDriver::new(scripts)),
        runner,
        updater,
        Arc::clone(&bus),
        config,
    );

    Harness {
        scheduler,
        vault,
        bus,
        cancel,
        _brokers_dir: brokers_dir,
    }
}

#[tokio::test]
async fn full_scan_opt_out_confirm_flow() {
    let h = harness(vec![
        // Scan: one listing found.
        vec![
            ActionResult::Completed,
            ActionResult::Extracted(vec![jane_listing()]),
        ],
        // Opt-out: listing still present, removal form submitted.
        vec![
            ActionResult::Completed,
            ActionResult::Extracted(vec![jane_listing()]),
            ActionResult::Completed,
        ],
        // Confirmation check: listing is gone.
        vec![ActionResult::Completed, ActionResult::Extracted(vec![])],
    ]);
    let mut rx = h.bus.subscribe();

    // Reconciliation seeds one scan tuple, due immediately.
    assert!(h.scheduler.updater().check_for_updates(&h.bus).unwrap());
    assert_eq!(h.vault.fetch_due_scans(Utc::now()).unwrap().len(), 1);

    // Tick 1: the scan runs, finds Jane, and creates her opt-out job.
    let summary = h.scheduler.tick(false).await;
    assert_eq!(summary.scans_run, 1);
    let due = h.vault.fetch_due_opt_outs(Utc::now()).unwrap();
    assert_eq!(due.len(), 1);
    let profile_id = due[0].extracted_profile_id;

    // Tick 2: the opt-out submits and schedules a confirmation check.
    let summary = h.scheduler.tick(false).await;
    assert_eq!(summary.opt_outs_run, 1);
    let job = h.vault.fetch_opt_out(profile_id).unwrap().unwrap();
    assert!(job.submitted_date.is_some());
    assert!(h.vault.fetch_due_opt_outs(Utc::now()).unwrap().is_empty());

    // Pull the confirmation check forward and run it.
    h.vault
        .record_opt_out_submitted(&job, Utc::now(), Utc::now())
        .unwrap();
    h.scheduler.tick(false).await;

    let profile = h.vault.fetch_extracted_profile(profile_id).unwrap().unwrap();
    assert!(profile.removed_date.is_some());

    // Nothing left to do, ever.
    let far_future = Utc::now() + ChronoDuration::days(365);
    assert!(h.vault.fetch_due_opt_outs(far_future).unwrap().is_empty());

    // Milestones fired exactly once each across the whole run.
    let (mut first_match, mut first_removal, mut all_removed) = (0, 0, 0);
    while let Ok(event) = rx.try_recv() {
        match event {
            EngineEvent::FirstMatchFound => first_match += 1,
            EngineEvent::FirstProfileRemoved => first_removal += 1,
            EngineEvent::AllProfilesRemoved => all_removed += 1,
            _ => {}
        }
    }
    assert_eq!((first_match, first_removal, all_removed), (1, 1, 1));
}

#[tokio::test]
async fn cancellation_leaves_tuple_due_with_no_writes() {
    let h = harness(vec![vec![
        ActionResult::Completed,
        ActionResult::Extracted(vec![jane_listing()]),
    ]]);

    h.scheduler.updater().check_for_updates(&h.bus).unwrap();
    h.cancel.store(true, Ordering::Relaxed);

    h.scheduler.tick(false).await;

    // The scan was interrupted before its first action: no profiles were
    // written and the tuple is still due for the next tick.
    let due = h.vault.fetch_due_scans(Utc::now()).unwrap();
    assert_eq!(due.len(), 1);
    let scan = &due[0];
    assert_eq!(
        h.vault
            .fetch_extracted_profiles(scan.broker_id, scan.profile_query_id)
            .unwrap()
            .len(),
        0
    );
}

#[tokio::test]
async fn reconciliation_is_idempotent_across_restarts() {
    let h = harness(vec![]);

    assert!(h.scheduler.updater().check_for_updates(&h.bus).unwrap());
    assert!(!h.scheduler.updater().check_for_updates(&h.bus).unwrap());

    // Still exactly one scan tuple for the one broker/query pair.
    assert_eq!(h.vault.fetch_all_scan_jobs().unwrap().len(), 1);
}
