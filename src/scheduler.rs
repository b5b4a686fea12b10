//! Scheduler: the periodic tick loop that keeps every broker tuple moving.
//!
//! Each tick selects due scan and opt-out tuples from the vault, groups
//! them by broker, and dispatches one tokio task per broker behind a
//! semaphore. A broker's tuples run serially inside its task (one driver
//! session per job, never two concurrent sessions against the same site);
//! independent brokers run in parallel. Job outcomes are persisted in
//! single vault transactions; failures are scoped to their tuple and never
//! abort a tick. Cancellation leaves the tuple due, so interrupted work is
//! retried on the next tick.

use crate::broker::updater::BrokerUpdater;
use crate::config::EngineConfig;
use crate::driver::Driver;
use crate::events::{EngineEvent, EventBus};
use crate::job::{JobError, JobRunner, OptOutOutcome};
use crate::vault::{EventKind, HistoryEvent, OptOutJobData, ScanJobData, Vault};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rand::Rng;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::{Notify, Semaphore};

const MILESTONE_FIRST_MATCH: &str = "first_match";
const MILESTONE_FIRST_REMOVAL: &str = "first_removal";
const MILESTONE_ALL_REMOVED: &str = "all_removed";

/// What one tick dispatched.
#[derive(Debug, Default, Clone, Copy)]
pub struct TickSummary {
    pub scans_run: usize,
    pub opt_outs_run: usize,
}

#[derive(Clone)]
pub struct Scheduler {
    vault: Arc<Vault>,
    driver: Arc<dyn Driver>,
    runner: Arc<JobRunner>,
    updater: Arc<BrokerUpdater>,
    bus: Arc<EventBus>,
    config: EngineConfig,
}

impl Scheduler {
    pub fn new(
        vault: Arc<Vault>,
        driver: Arc<dyn Driver>,
        runner: Arc<JobRunner>,
        updater: Arc<BrokerUpdater>,
        bus: Arc<EventBus>,
        config: EngineConfig,
    ) -> Self {
        Self {
            vault,
            driver,
            runner,
            updater,
            bus,
            config,
        }
    }

    pub fn updater(&self) -> &BrokerUpdater {
        &self.updater
    }

    /// Tick until shutdown is signaled.
    pub async fn run(&self, shutdown: Arc<Notify>) {
        if let Err(e) = self.updater.check_for_updates(&self.bus) {
            tracing::error!("broker reconciliation failed: {e:#}");
        }
        tracing::info!(
            profile = self.config.profile.as_str(),
            tick_secs = self.config.tick_every.as_secs(),
            max_concurrent_jobs = self.config.max_concurrent_jobs,
            "scheduler started"
        );

        let mut ticker = tokio::time::interval(self.config.tick_every);
        loop {
            tokio::select! {
                _ = shutdown.notified() => {
                    tracing::info!("scheduler stopping");
                    break;
                }
                _ = ticker.tick() => {
                    let summary = self.tick(false).await;
                    self.bus.emit(EngineEvent::TickCompleted {
                        scans_run: summary.scans_run,
                        opt_outs_run: summary.opt_outs_run,
                    });
                }
            }
        }
    }

    /// Dispatch everything currently due (or, with `all_scans`, every scan
    /// tuple regardless of schedule — the CLI's immediate mode).
    pub async fn tick(&self, all_scans: bool) -> TickSummary {
        let now = Utc::now();
        let scans = if all_scans {
            self.vault.fetch_all_scan_jobs()
        } else {
            self.vault.fetch_due_scans(now)
        };
        let scans = match scans {
            Ok(scans) => scans,
            Err(e) => {
                tracing::error!("due-scan selection failed: {e:#}");
                return TickSummary::default();
            }
        };
        let opt_outs = match self.vault.fetch_due_opt_outs(now) {
            Ok(jobs) => jobs,
            Err(e) => {
                tracing::error!("due-opt-out selection failed: {e:#}");
                Vec::new()
            }
        };

        if scans.is_empty() && opt_outs.is_empty() {
            return TickSummary::default();
        }
        tracing::debug!(scans = scans.len(), opt_outs = opt_outs.len(), "tick dispatching");
        let summary = TickSummary {
            scans_run: scans.len(),
            opt_outs_run: opt_outs.len(),
        };

        // One task per broker: a broker's tuples run back to back so the
        // site never sees two concurrent sessions, while the semaphore
        // bounds how many brokers are worked at once.
        let mut by_broker: BTreeMap<i64, (Vec<ScanJobData>, Vec<OptOutJobData>)> = BTreeMap::new();
        for scan in scans {
            by_broker.entry(scan.broker_id).or_default().0.push(scan);
        }
        for job in opt_outs {
            by_broker.entry(job.broker_id).or_default().1.push(job);
        }

        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrent_jobs));
        let mut handles = Vec::new();
        for (_, (broker_scans, broker_opt_outs)) in by_broker {
            let this = self.clone();
            let semaphore = Arc::clone(&semaphore);
            handles.push(tokio::spawn(async move {
                let Ok(_permit) = semaphore.acquire_owned().await else {
                    return;
                };
                this.jitter().await;
                for scan in broker_scans {
                    this.run_one_scan(scan).await;
                }
                for job in broker_opt_outs {
                    this.run_one_opt_out(job).await;
                }
            }));
        }
        for handle in handles {
            if let Err(e) = handle.await {
                tracing::error!("job task panicked: {e}");
            }
        }

        summary
    }

    /// Small random delay so a burst of due tuples does not hit every
    /// broker at the same instant.
    async fn jitter(&self) {
        let ms = rand::thread_rng().gen_range(0..250u64);
        tokio::time::sleep(std::time::Duration::from_millis(ms)).await;
    }

    async fn run_one_scan(&self, scan: ScanJobData) {
        let now = Utc::now();
        let (broker, query) = match self.load_tuple(scan.broker_id, scan.profile_query_id) {
            Some(pair) => pair,
            None => return,
        };

        if let Err(e) = self.vault.append_event(&HistoryEvent {
            date: now,
            kind: EventKind::ScanStarted,
            broker_id: scan.broker_id,
            profile_query_id: scan.profile_query_id,
            extracted_profile_id: None,
            detail: None,
        }) {
            tracing::error!(broker = %broker.url, "scan-start event write failed: {e:#}");
        }

        let session = match self.driver.new_session().await {
            Ok(session) => session,
            Err(e) => {
                self.record_scan_failure(&scan, &broker.url, "scan", &format!("{e:#}"));
                return;
            }
        };

        match self.runner.run_scan(session, &broker, &query).await {
            Ok(found) => {
                let next_run = Utc::now() + to_chrono(self.config.scan_cadence);
                match self.vault.record_scan_outcome(
                    scan.broker_id,
                    scan.profile_query_id,
                    &found,
                    Utc::now(),
                    next_run,
                    Utc::now(),
                ) {
                    Ok(summary) => {
                        tracing::info!(
                            broker = %broker.url,
                            matches = summary.total_matches,
                            new = summary.new_profile_ids.len(),
                            removed = summary.removed_profile_ids.len(),
                            "scan completed"
                        );
                        self.bus.emit(EngineEvent::ScanCompleted {
                            broker_url: broker.url.clone(),
                            match_count: summary.total_matches,
                        });
                        if !summary.new_profile_ids.is_empty() {
                            self.fire_milestone(MILESTONE_FIRST_MATCH, EngineEvent::FirstMatchFound);
                        }
                        if !summary.removed_profile_ids.is_empty() {
                            self.fire_removal_milestones();
                        }
                    }
                    Err(e) => {
                        // Next scan re-extracts and converges on the truth.
                        tracing::error!(broker = %broker.url, "scan persistence failed: {e:#}");
                    }
                }
            }
            Err(JobError::Cancelled) => {
                tracing::debug!(broker = %broker.url, "scan cancelled, tuple stays due");
            }
            Err(e) => {
                self.record_scan_failure(&scan, &broker.url, e.kind(), &e.to_string());
            }
        }
    }

    async fn run_one_opt_out(&self, job: OptOutJobData) {
        let now = Utc::now();
        let (broker, query) = match self.load_tuple(job.broker_id, job.profile_query_id) {
            Some(pair) => pair,
            None => return,
        };
        let extracted = match self.vault.fetch_extracted_profile(job.extracted_profile_id) {
            Ok(Some(profile)) => profile,
            Ok(None) => {
                tracing::warn!(
                    extracted_profile_id = job.extracted_profile_id,
                    "opt-out references a missing profile, skipping"
                );
                return;
            }
            Err(e) => {
                tracing::error!("profile fetch failed: {e:#}");
                return;
            }
        };

        if let Err(e) = self.vault.append_event(&HistoryEvent {
            date: now,
            kind: EventKind::OptOutStarted,
            broker_id: job.broker_id,
            profile_query_id: job.profile_query_id,
            extracted_profile_id: Some(job.extracted_profile_id),
            detail: None,
        }) {
            tracing::error!(broker = %broker.url, "opt-out-start event write failed: {e:#}");
        }

        let session = match self.driver.new_session().await {
            Ok(session) => session,
            Err(e) => {
                self.record_opt_out_failure(&job, &broker.url, "opt_out", &format!("{e:#}"));
                return;
            }
        };

        match self.runner.run_opt_out(session, &broker, &query, &extracted).await {
            Ok(OptOutOutcome::Submitted { email }) => {
                if let Some(email) = email {
                    if let Err(e) = self
                        .vault
                        .update_profile_email(job.extracted_profile_id, &email)
                    {
                        tracing::error!("email persistence failed: {e:#}");
                    }
                }
                let next_check = Utc::now() + to_chrono(self.config.confirm_cadence);
                match self.vault.record_opt_out_submitted(&job, Utc::now(), next_check) {
                    Ok(()) => {
                        tracing::info!(
                            broker = %broker.url,
                            profile = %extracted.profile_url,
                            "opt-out submitted"
                        );
                        self.bus.emit(EngineEvent::OptOutRequested {
                            broker_url: broker.url.clone(),
                            extracted_profile_id: job.extracted_profile_id,
                        });
                    }
                    Err(e) => {
                        tracing::error!(broker = %broker.url, "opt-out persistence failed: {e:#}");
                    }
                }
            }
            Ok(OptOutOutcome::ProfileAbsent) => {
                match self.vault.record_opt_out_confirmed(&job, Utc::now()) {
                    Ok(()) => {
                        tracing::info!(
                            broker = %broker.url,
                            profile = %extracted.profile_url,
                            "profile removal confirmed"
                        );
                        self.fire_removal_milestones();
                    }
                    Err(e) => {
                        tracing::error!(broker = %broker.url, "removal persistence failed: {e:#}");
                    }
                }
            }
            Err(JobError::Cancelled) => {
                tracing::debug!(broker = %broker.url, "opt-out cancelled, tuple stays due");
            }
            Err(e) => {
                self.record_opt_out_failure(&job, &broker.url, e.kind(), &e.to_string());
            }
        }
    }

    fn load_tuple(
        &self,
        broker_id: i64,
        profile_query_id: i64,
    ) -> Option<(crate::broker::DataBroker, crate::broker::ProfileQuery)> {
        let broker = match self.vault.fetch_broker(broker_id) {
            Ok(Some(broker)) => broker,
            Ok(None) => {
                tracing::warn!(broker_id, "job references an unknown broker, skipping");
                return None;
            }
            Err(e) => {
                tracing::error!("broker fetch failed: {e:#}");
                return None;
            }
        };
        let query = match self.vault.fetch_profile_query(profile_query_id) {
            Ok(Some(query)) => query,
            Ok(None) => {
                tracing::warn!(profile_query_id, "job references an unknown query, skipping");
                return None;
            }
            Err(e) => {
                tracing::error!("query fetch failed: {e:#}");
                return None;
            }
        };
        Some((broker, query))
    }

    fn record_scan_failure(&self, scan: &ScanJobData, broker_url: &str, kind: &str, error: &str) {
        let next_run = Utc::now() + to_chrono(self.config.failure_backoff);
        if let Err(e) = self.vault.record_scan_failure(
            scan.broker_id,
            scan.profile_query_id,
            Utc::now(),
            next_run,
            error,
        ) {
            tracing::error!(broker = %broker_url, "scan-failure persistence failed: {e:#}");
        }
        tracing::warn!(broker = %broker_url, kind, %error, "scan failed");
        self.bus.emit(EngineEvent::JobFailed {
            broker_url: broker_url.to_string(),
            kind: kind.to_string(),
            error: error.to_string(),
        });
    }

    fn record_opt_out_failure(
        &self,
        job: &OptOutJobData,
        broker_url: &str,
        kind: &str,
        error: &str,
    ) {
        let next_run = Utc::now() + to_chrono(self.config.failure_backoff);
        if let Err(e) = self
            .vault
            .record_opt_out_failure(job, Utc::now(), next_run, error)
        {
            tracing::error!(broker = %broker_url, "opt-out-failure persistence failed: {e:#}");
        }
        tracing::warn!(broker = %broker_url, kind, %error, "opt-out failed");
        self.bus.emit(EngineEvent::JobFailed {
            broker_url: broker_url.to_string(),
            kind: kind.to_string(),
            error: error.to_string(),
        });
    }

    fn fire_milestone(&self, name: &str, event: EngineEvent) {
        match self.vault.mark_milestone(name, Utc::now()) {
            Ok(true) => self.bus.emit(event),
            Ok(false) => {}
            Err(e) => tracing::error!(name, "milestone write failed: {e:#}"),
        }
    }

    fn fire_removal_milestones(&self) {
        self.fire_milestone(MILESTONE_FIRST_REMOVAL, EngineEvent::FirstProfileRemoved);
        match self.vault.all_profiles_removed() {
            Ok(true) => self.fire_milestone(MILESTONE_ALL_REMOVED, EngineEvent::AllProfilesRemoved),
            Ok(false) => {}
            Err(e) => tracing::error!("removal census failed: {e:#}"),
        }
    }
}

fn to_chrono(duration: std::time::Duration) -> ChronoDuration {
    ChronoDuration::from_std(duration).unwrap_or_else(|_| ChronoDuration::seconds(0))
}

/// The moment a date becomes due under `<=` selection.
pub fn is_due(preferred: Option<DateTime<Utc>>, as_of: DateTime<Utc>) -> bool {
    preferred.map(|p| p <= as_of).unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::registry::BrokerRegistry;
    use crate::broker::{
        Action, BrokerStep, DataBroker, ExtractSelectors, ExtractedProfileRecord, ProfileQuery,
        StepType,
    };
    use crate::driver::{ActionContext, ActionResult, DriverSession};
    use crate::services::{NoopCaptchaSolver, NoopEmailVerifier};
    use anyhow::Result as AnyResult;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex;

    struct MockSession {
        results: VecDeque<ActionResult>,
    }

    #[async_trait]
    impl DriverSession for MockSession {
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

    /// Hands each new session the next scripted result sequence.
    struct MockDriver {
        scripts: Mutex<VecDeque<Vec<ActionResult>>>,
    }

    impl MockDriver {
        fn new(scripts: Vec<Vec<ActionResult>>) -> Self {
            Self {
                scripts: Mutex::new(scripts.into()),
            }
        }
    }

    #[async_trait]
    impl Driver for MockDriver {
        async fn new_session(&self) -> AnyResult<Box<dyn DriverSession>> {
            let results = self
                .scripts
                .lock()
                .unwrap()
                .pop_front()
                .ok_or_else(|| anyhow::anyhow!("no scripted session left"))?;
            Ok(Box::new(MockSession {
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

    fn test_broker() -> DataBroker {
        DataBroker {
            id: None,
            name: "Example".to_string(),
            url: "example.com".to_string(),
            version: "1.0".to_string(),
            parent: None,
            steps: vec![
                BrokerStep {
                    step_type: StepType::Scan,
                    actions: vec![
                        Action::Navigate {
                            url: "https://example.com/?q=${lastName}".to_string(),
                        },
                        Action::Extract {
                            selector: ".r".to_string(),
                            profile: ExtractSelectors {
                                name: ".n".to_string(),
                                age: None,
                                addresses: None,
                                relatives: None,
                                profile_url: "a".to_string(),
                            },
                        },
                    ],
                },
                BrokerStep {
                    step_type: StepType::OptOut,
                    actions: vec![
                        Action::Navigate {
                            url: "${profileUrl}".to_string(),
                        },
                        Action::Extract {
                            selector: ".r".to_string(),
                            profile: ExtractSelectors {
                                name: ".n".to_string(),
                                age: None,
                                addresses: None,
                                relatives: None,
                                profile_url: "a".to_string(),
                            },
                        },
                        Action::Click {
                            selector: "#remove".to_string(),
                        },
                    ],
                },
            ],
        }
    }

    fn jane_match() -> ExtractedProfileRecord {
        ExtractedProfileRecord {
            id: None,
            broker_id: None,
            profile_query_id: None,
            profile_url: "https://example.com/p/1".to_string(),
            full_name: "Jane Doe".to_string(),
            age: None,
            addresses: vec![],
            relatives: vec![],
            email: None,
            removed_date: None,
        }
    }

    fn fast_config() -> EngineConfig {
        let mut cfg = EngineConfig::default();
        cfg.pacing = std::time::Duration::from_millis(1);
        cfg.retry_wait = std::time::Duration::from_millis(1);
        cfg
    }

    fn scheduler_with(driver: impl Driver + 'static) -> (Scheduler, Arc<Vault>, Arc<EventBus>) {
        let vault = Arc::new(Vault::open_in_memory().unwrap());
        let bus = Arc::new(EventBus::new(64));
        let config = fast_config();
        let runner = Arc::new(JobRunner::new(
            config.clone(),
            Arc::new(NoopCaptchaSolver),
            Arc::new(NoopEmailVerifier),
            Arc::new(AtomicBool::new(false)),
        ));
        let updater = Arc::new(BrokerUpdater::new(
            Arc::clone(&vault),
            BrokerRegistry::new("/nonexistent"),
            "0.0.0-test",
        ));
        let scheduler = Scheduler::new(
            Arc::clone(&vault),
            Arc::new(driver),
            runner,
            updater,
            Arc::clone(&bus),
            config,
        );
        (scheduler, vault, bus)
    }

    fn seed(vault: &Vault) -> (i64, i64) {
        let broker_id = vault.save_broker(&test_broker()).unwrap();
        let query_id = vault
            .save_profile_query(&ProfileQuery::new("Jane", "Doe", "Miami", "FL"))
            .unwrap();
        vault.create_scan_job(broker_id, query_id, Utc::now()).unwrap();
        (broker_id, query_id)
    }

    #[tokio::test]
    async fn test_scan_tick_creates_opt_out_and_reschedules() {
        let driver = MockDriver::new(vec![vec![
            ActionResult::Completed,
            ActionResult::Extracted(vec![jane_match()]),
        ]]);
        let (scheduler, vault, bus) = scheduler_with(driver);
        let (broker_id, query_id) = seed(&vault);
        let mut rx = bus.subscribe();

        let summary = scheduler.tick(false).await;
        assert_eq!(summary.scans_run, 1);

        // One match, one opt-out job, scan pushed into the future.
        assert_eq!(vault.fetch_extracted_profiles(broker_id, query_id).unwrap().len(), 1);
        assert_eq!(vault.fetch_due_opt_outs(Utc::now()).unwrap().len(), 1);
        assert!(vault.fetch_due_scans(Utc::now()).unwrap().is_empty());

        match rx.try_recv().unwrap() {
            EngineEvent::ScanCompleted { match_count, .. } => assert_eq!(match_count, 1),
            other => panic!("unexpected event: {other:?}"),
        }
        assert!(matches!(rx.try_recv().unwrap(), EngineEvent::FirstMatchFound));
    }

    #[tokio::test]
    async fn test_opt_out_submit_then_confirm_fires_milestones_once() {
        let driver = MockDriver::new(vec![
            // Scan run: finds the match.
            vec![
                ActionResult::Completed,
                ActionResult::Extracted(vec![jane_match()]),
            ],
            // Opt-out run: profile still listed, script completes.
            vec![
                ActionResult::Completed,
                ActionResult::Extracted(vec![jane_match()]),
                ActionResult::Completed,
            ],
            // Confirmation run: profile gone.
            vec![ActionResult::Completed, ActionResult::Extracted(vec![])],
        ]);
        let (scheduler, vault, bus) = scheduler_with(driver);
        seed(&vault);
        let mut rx = bus.subscribe();

        scheduler.tick(false).await; // scan
        scheduler.tick(false).await; // opt-out submit

        let profile_id = vault.fetch_due_opt_outs(Utc::now() + ChronoDuration::days(2)).unwrap()[0]
            .extracted_profile_id;
        let job = vault.fetch_opt_out(profile_id).unwrap().unwrap();
        assert!(job.submitted_date.is_some());

        // Make the confirmation check due now.
        vault
            .record_opt_out_submitted(&job, Utc::now(), Utc::now())
            .unwrap();
        scheduler.tick(false).await; // confirmation

        let profile = vault.fetch_extracted_profile(profile_id).unwrap().unwrap();
        assert!(profile.removed_date.is_some());

        let mut removal_events = 0;
        let mut all_removed_events = 0;
        while let Ok(event) = rx.try_recv() {
            match event {
                EngineEvent::FirstProfileRemoved => removal_events += 1,
                EngineEvent::AllProfilesRemoved => all_removed_events += 1,
                _ => {}
            }
        }
        assert_eq!(removal_events, 1);
        assert_eq!(all_removed_events, 1);

        // Terminal: nothing due anymore, even far in the future.
        assert!(vault
            .fetch_due_opt_outs(Utc::now() + ChronoDuration::days(365))
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_failed_scan_backs_off_and_emits_job_failed() {
        let fail = ActionResult::Failed {
            message: "unreachable".to_string(),
        };
        let driver = MockDriver::new(vec![vec![fail.clone(), fail.clone(), fail.clone(), fail]]);
        let (scheduler, vault, bus) = scheduler_with(driver);
        seed(&vault);
        let mut rx = bus.subscribe();

        scheduler.tick(false).await;

        // Not due now, due again after the backoff window.
        assert!(vault.fetch_due_scans(Utc::now()).unwrap().is_empty());
        assert_eq!(
            vault
                .fetch_due_scans(Utc::now() + ChronoDuration::hours(5))
                .unwrap()
                .len(),
            1
        );
        let mut saw_failure = false;
        while let Ok(event) = rx.try_recv() {
            if let EngineEvent::JobFailed { kind, .. } = event {
                assert_eq!(kind, "navigation_failed");
                saw_failure = true;
            }
        }
        assert!(saw_failure);
    }

    /// Counts concurrently open sessions so overlap is observable.
    struct TrackingSession {
        active: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl DriverSession for TrackingSession {
        async fn execute(
            &mut self,
            action: &Action,
            _ctx: &ActionContext<'_>,
        ) -> AnyResult<ActionResult> {
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            if matches!(action, Action::Extract { .. }) {
                Ok(ActionResult::Extracted(vec![]))
            } else {
                Ok(ActionResult::Completed)
            }
        }
        async fn load(&mut self, _url: &str) -> AnyResult<ActionResult> {
            Ok(ActionResult::Completed)
        }
        async fn inject_captcha_token(&mut self, _token: &str) -> AnyResult<ActionResult> {
            Ok(ActionResult::Completed)
        }
        async fn current_url(&self) -> AnyResult<String> {
            Ok(String::new())
        }
        async fn finish(self: Box<Self>) -> AnyResult<()> {
            self.active.fetch_sub(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[derive(Default)]
    struct TrackingDriver {
        active: Arc<AtomicUsize>,
        peak: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Driver for TrackingDriver {
        async fn new_session(&self) -> AnyResult<Box<dyn DriverSession>> {
            let now_active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now_active, Ordering::SeqCst);
            Ok(Box::new(TrackingSession {
                active: Arc::clone(&self.active),
            }))
        }
        async fn shutdown(&self) -> AnyResult<()> {
            Ok(())
        }
        fn active_sessions(&self) -> usize {
            self.active.load(Ordering::SeqCst)
        }
    }

    #[tokio::test]
    async fn test_same_broker_tuples_never_overlap() {
        let driver = TrackingDriver::default();
        let active = Arc::clone(&driver.active);
        let peak = Arc::clone(&driver.peak);
        let (scheduler, vault, _bus) = scheduler_with(driver);

        // Two queries against the one broker, both due now.
        let broker_id = vault.save_broker(&test_broker()).unwrap();
        for (first, last) in [("Jane", "Doe"), ("John", "Roe")] {
            let query_id = vault
                .save_profile_query(&ProfileQuery::new(first, last, "Miami", "FL"))
                .unwrap();
            vault.create_scan_job(broker_id, query_id, Utc::now()).unwrap();
        }

        let summary = scheduler.tick(false).await;
        assert_eq!(summary.scans_run, 2);
        // The broker only ever saw one session at a time, and none leaked.
        assert_eq!(peak.load(Ordering::SeqCst), 1);
        assert_eq!(active.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_is_due_boundary() {
        let t = Utc::now();
        assert!(is_due(Some(t), t));
        assert!(!is_due(Some(t + ChronoDuration::seconds(1)), t));
        assert!(!is_due(None, t));
    }
}
