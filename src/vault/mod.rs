//! Persistent store ("vault") backed by SQLite.
//!
//! Holds everything durable: broker definitions, profile queries, scan and
//! opt-out job state, extracted matches, the append-only history event log,
//! one-shot milestone flags, and engine metadata. One connection behind a
//! mutex; every per-job-completion update runs inside a single transaction
//! so concurrent jobs never interleave partial writes to the same tuple.

use crate::broker::{DataBroker, ExtractedProfileRecord, ProfileQuery};
use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS brokers (
    id INTEGER PRIMARY KEY,
    name TEXT NOT NULL,
    url TEXT NOT NULL UNIQUE,
    version TEXT NOT NULL,
    parent TEXT,
    steps TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS profile_queries (
    id INTEGER PRIMARY KEY,
    first_name TEXT NOT NULL,
    last_name TEXT NOT NULL,
    middle_name TEXT,
    city TEXT NOT NULL,
    state TEXT NOT NULL,
    birth_year INTEGER,
    deprecated INTEGER NOT NULL DEFAULT 0
);
CREATE TABLE IF NOT EXISTS scan_jobs (
    broker_id INTEGER NOT NULL REFERENCES brokers(id),
    profile_query_id INTEGER NOT NULL REFERENCES profile_queries(id),
    last_run_date TEXT,
    preferred_run_date TEXT,
    UNIQUE(broker_id, profile_query_id)
);
CREATE TABLE IF NOT EXISTS extracted_profiles (
    id INTEGER PRIMARY KEY,
    broker_id INTEGER NOT NULL REFERENCES brokers(id),
    profile_query_id INTEGER NOT NULL REFERENCES profile_queries(id),
    profile_url TEXT NOT NULL,
    full_name TEXT NOT NULL,
    age TEXT,
    addresses TEXT NOT NULL DEFAULT '[]',
    relatives TEXT NOT NULL DEFAULT '[]',
    email TEXT,
    removed_date TEXT,
    UNIQUE(broker_id, profile_query_id, profile_url)
);
CREATE TABLE IF NOT EXISTS opt_out_jobs (
    broker_id INTEGER NOT NULL REFERENCES brokers(id),
    profile_query_id INTEGER NOT NULL REFERENCES profile_queries(id),
    extracted_profile_id INTEGER NOT NULL UNIQUE REFERENCES extracted_profiles(id),
    created_date TEXT NOT NULL,
    attempt_count INTEGER NOT NULL DEFAULT 0,
    last_run_date TEXT,
    preferred_run_date TEXT,
    submitted_date TEXT
);
CREATE TABLE IF NOT EXISTS history_events (
    id INTEGER PRIMARY KEY,
    date TEXT NOT NULL,
    event_kind TEXT NOT NULL,
    broker_id INTEGER NOT NULL,
    profile_query_id INTEGER NOT NULL,
    extracted_profile_id INTEGER,
    detail TEXT
);
CREATE TABLE IF NOT EXISTS milestones (
    name TEXT PRIMARY KEY,
    fired_date TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS meta (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
";

/// One scan row: state for a (broker, profile query) tuple.
#[derive(Debug, Clone)]
pub struct ScanJobData {
    pub broker_id: i64,
    pub profile_query_id: i64,
    pub last_run_date: Option<DateTime<Utc>>,
    pub preferred_run_date: Option<DateTime<Utc>>,
}

/// One opt-out row: state for a single extracted profile.
#[derive(Debug, Clone)]
pub struct OptOutJobData {
    pub broker_id: i64,
    pub profile_query_id: i64,
    pub extracted_profile_id: i64,
    pub created_date: DateTime<Utc>,
    pub attempt_count: i64,
    pub last_run_date: Option<DateTime<Utc>>,
    pub preferred_run_date: Option<DateTime<Utc>>,
    pub submitted_date: Option<DateTime<Utc>>,
}

/// Kinds of entries in the append-only history log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    ScanStarted,
    MatchesFound,
    NoMatchFound,
    ScanFailed,
    OptOutStarted,
    OptOutRequested,
    OptOutConfirmed,
    OptOutFailed,
}

impl EventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::ScanStarted => "scan_started",
            EventKind::MatchesFound => "matches_found",
            EventKind::NoMatchFound => "no_match_found",
            EventKind::ScanFailed => "scan_failed",
            EventKind::OptOutStarted => "opt_out_started",
            EventKind::OptOutRequested => "opt_out_requested",
            EventKind::OptOutConfirmed => "opt_out_confirmed",
            EventKind::OptOutFailed => "opt_out_failed",
        }
    }
}

/// One append-only history event.
#[derive(Debug, Clone)]
pub struct HistoryEvent {
    pub date: DateTime<Utc>,
    pub kind: EventKind,
    pub broker_id: i64,
    pub profile_query_id: i64,
    pub extracted_profile_id: Option<i64>,
    pub detail: Option<String>,
}

/// What `record_scan_outcome` persisted, for milestone/hook decisions.
#[derive(Debug, Clone, Default)]
pub struct ScanPersistSummary {
    /// Extracted-profile ids inserted this run (each got an opt-out job).
    pub new_profile_ids: Vec<i64>,
    /// Previously known profiles no longer present on the site.
    pub removed_profile_ids: Vec<i64>,
    /// Total matches the scan reported (new + re-found).
    pub total_matches: usize,
}

/// Aggregate counts shown by the status command.
#[derive(Debug, Clone, Copy, Default)]
pub struct VaultStats {
    pub brokers: i64,
    pub profile_queries: i64,
    pub scan_jobs: i64,
    pub profiles_found: i64,
    pub profiles_removed: i64,
    pub opt_outs_submitted: i64,
    pub opt_outs_pending: i64,
}

/// The persistent store.
pub struct Vault {
    conn: Mutex<Connection>,
}

impl Vault {
    /// Open or create a vault at the given path.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open vault: {}", path.display()))?;
        conn.execute_batch(SCHEMA)
            .context("failed to create vault schema")?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open an in-memory vault. Test use only, but kept in the public API
    /// so integration tests can build one.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("failed to open in-memory vault")?;
        conn.execute_batch(SCHEMA)
            .context("failed to create vault schema")?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| anyhow!("vault lock poisoned"))
    }

    // ── Brokers ───────────────────────────

    /// Insert a broker definition and return its row id.
    pub fn save_broker(&self, broker: &DataBroker) -> Result<i64> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO brokers (name, url, version, parent, steps) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                broker.name,
                broker.url,
                broker.version,
                broker.parent,
                serde_json::to_string(&broker.steps)?,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Fetch a broker by site URL.
    pub fn fetch_broker_by_url(&self, url: &str) -> Result<Option<DataBroker>> {
        let conn = self.conn()?;
        conn.query_row(
            "SELECT id, name, url, version, parent, steps FROM brokers WHERE url = ?1",
            params![url],
            row_to_broker,
        )
        .optional()
        .map_err(Into::into)
    }

    /// Fetch a broker by row id.
    pub fn fetch_broker(&self, id: i64) -> Result<Option<DataBroker>> {
        let conn = self.conn()?;
        conn.query_row(
            "SELECT id, name, url, version, parent, steps FROM brokers WHERE id = ?1",
            params![id],
            row_to_broker,
        )
        .optional()
        .map_err(Into::into)
    }

    pub fn fetch_all_brokers(&self) -> Result<Vec<DataBroker>> {
        let conn = self.conn()?;
        let mut stmt =
            conn.prepare("SELECT id, name, url, version, parent, steps FROM brokers ORDER BY url")?;
        let brokers = stmt
            .query_map([], row_to_broker)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(brokers)
    }

    /// Replace a stored broker with a newer definition and reset the attempt
    /// count of every opt-out job belonging to it.
    ///
    /// The whole transition is one transaction and returns the affected
    /// extracted-profile ids, making the upgrade auditable instead of a
    /// scatter of ad hoc updates.
    pub fn apply_broker_upgrade(&self, broker_id: i64, incoming: &DataBroker) -> Result<Vec<i64>> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        tx.execute(
            "UPDATE brokers SET name = ?1, version = ?2, parent = ?3, steps = ?4 WHERE id = ?5",
            params![
                incoming.name,
                incoming.version,
                incoming.parent,
                serde_json::to_string(&incoming.steps)?,
                broker_id,
            ],
        )?;
        let affected: Vec<i64> = {
            let mut stmt = tx.prepare(
                "SELECT extracted_profile_id FROM opt_out_jobs
                 WHERE broker_id = ?1 AND attempt_count > 0",
            )?;
            let ids = stmt
                .query_map(params![broker_id], |row| row.get(0))?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            ids
        };
        tx.execute(
            "UPDATE opt_out_jobs SET attempt_count = 0 WHERE broker_id = ?1",
            params![broker_id],
        )?;
        tx.commit()?;
        Ok(affected)
    }

    // ── Profile queries ───────────────────

    pub fn save_profile_query(&self, query: &ProfileQuery) -> Result<i64> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO profile_queries
             (first_name, last_name, middle_name, city, state, birth_year, deprecated)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                query.first_name,
                query.last_name,
                query.middle_name,
                query.city,
                query.state,
                query.birth_year,
                query.deprecated,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// All non-deprecated profile queries.
    pub fn fetch_all_profile_queries(&self) -> Result<Vec<ProfileQuery>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, first_name, last_name, middle_name, city, state, birth_year, deprecated
             FROM profile_queries WHERE deprecated = 0 ORDER BY id",
        )?;
        let queries = stmt
            .query_map([], row_to_profile_query)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(queries)
    }

    pub fn fetch_profile_query(&self, id: i64) -> Result<Option<ProfileQuery>> {
        let conn = self.conn()?;
        conn.query_row(
            "SELECT id, first_name, last_name, middle_name, city, state, birth_year, deprecated
             FROM profile_queries WHERE id = ?1",
            params![id],
            row_to_profile_query,
        )
        .optional()
        .map_err(Into::into)
    }

    // ── Scan jobs ─────────────────────────

    /// Create the scan row for a (broker, query) tuple. Idempotent: the
    /// unique key makes a second create a no-op.
    pub fn create_scan_job(
        &self,
        broker_id: i64,
        profile_query_id: i64,
        preferred_run_date: DateTime<Utc>,
    ) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT OR IGNORE INTO scan_jobs (broker_id, profile_query_id, preferred_run_date)
             VALUES (?1, ?2, ?3)",
            params![broker_id, profile_query_id, to_ts(preferred_run_date)],
        )?;
        Ok(())
    }

    pub fn fetch_scan_job(
        &self,
        broker_id: i64,
        profile_query_id: i64,
    ) -> Result<Option<ScanJobData>> {
        let conn = self.conn()?;
        conn.query_row(
            "SELECT broker_id, profile_query_id, last_run_date, preferred_run_date
             FROM scan_jobs WHERE broker_id = ?1 AND profile_query_id = ?2",
            params![broker_id, profile_query_id],
            row_to_scan_job,
        )
        .optional()
        .map_err(Into::into)
    }

    /// Scan tuples with `preferred_run_date <= as_of`.
    pub fn fetch_due_scans(&self, as_of: DateTime<Utc>) -> Result<Vec<ScanJobData>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT broker_id, profile_query_id, last_run_date, preferred_run_date
             FROM scan_jobs
             WHERE preferred_run_date IS NOT NULL AND preferred_run_date <= ?1
             ORDER BY preferred_run_date",
        )?;
        let jobs = stmt
            .query_map(params![to_ts(as_of)], row_to_scan_job)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(jobs)
    }

    pub fn fetch_all_scan_jobs(&self) -> Result<Vec<ScanJobData>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT broker_id, profile_query_id, last_run_date, preferred_run_date
             FROM scan_jobs ORDER BY broker_id, profile_query_id",
        )?;
        let jobs = stmt
            .query_map([], row_to_scan_job)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(jobs)
    }

    // ── Extracted profiles ────────────────

    pub fn fetch_extracted_profiles(
        &self,
        broker_id: i64,
        profile_query_id: i64,
    ) -> Result<Vec<ExtractedProfileRecord>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, broker_id, profile_query_id, profile_url, full_name, age,
                    addresses, relatives, email, removed_date
             FROM extracted_profiles
             WHERE broker_id = ?1 AND profile_query_id = ?2 ORDER BY id",
        )?;
        let profiles = stmt
            .query_map(params![broker_id, profile_query_id], row_to_extracted)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(profiles)
    }

    pub fn fetch_extracted_profile(&self, id: i64) -> Result<Option<ExtractedProfileRecord>> {
        let conn = self.conn()?;
        conn.query_row(
            "SELECT id, broker_id, profile_query_id, profile_url, full_name, age,
                    addresses, relatives, email, removed_date
             FROM extracted_profiles WHERE id = ?1",
            params![id],
            row_to_extracted,
        )
        .optional()
        .map_err(Into::into)
    }

    /// Store the generated confirmation email for a profile's opt-out.
    pub fn update_profile_email(&self, extracted_profile_id: i64, email: &str) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE extracted_profiles SET email = ?1 WHERE id = ?2",
            params![email, extracted_profile_id],
        )?;
        Ok(())
    }

    /// Whether every known extracted profile has a removed date.
    pub fn all_profiles_removed(&self) -> Result<bool> {
        let conn = self.conn()?;
        let total: i64 =
            conn.query_row("SELECT COUNT(*) FROM extracted_profiles", [], |row| row.get(0))?;
        if total == 0 {
            return Ok(false);
        }
        let pending: i64 = conn.query_row(
            "SELECT COUNT(*) FROM extracted_profiles WHERE removed_date IS NULL",
            [],
            |row| row.get(0),
        )?;
        Ok(pending == 0)
    }

    // ── Opt-out jobs ──────────────────────

    pub fn fetch_opt_out(&self, extracted_profile_id: i64) -> Result<Option<OptOutJobData>> {
        let conn = self.conn()?;
        conn.query_row(
            "SELECT broker_id, profile_query_id, extracted_profile_id, created_date,
                    attempt_count, last_run_date, preferred_run_date, submitted_date
             FROM opt_out_jobs WHERE extracted_profile_id = ?1",
            params![extracted_profile_id],
            row_to_opt_out,
        )
        .optional()
        .map_err(Into::into)
    }

    /// Opt-out tuples due at `as_of` whose profile is not yet removed.
    pub fn fetch_due_opt_outs(&self, as_of: DateTime<Utc>) -> Result<Vec<OptOutJobData>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT o.broker_id, o.profile_query_id, o.extracted_profile_id, o.created_date,
                    o.attempt_count, o.last_run_date, o.preferred_run_date, o.submitted_date
             FROM opt_out_jobs o
             JOIN extracted_profiles e ON e.id = o.extracted_profile_id
             WHERE o.preferred_run_date IS NOT NULL AND o.preferred_run_date <= ?1
               AND e.removed_date IS NULL
             ORDER BY o.preferred_run_date",
        )?;
        let jobs = stmt
            .query_map(params![to_ts(as_of)], row_to_opt_out)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(jobs)
    }

    pub fn update_attempt_count(&self, extracted_profile_id: i64, count: i64) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE opt_out_jobs SET attempt_count = ?1 WHERE extracted_profile_id = ?2",
            params![count, extracted_profile_id],
        )?;
        Ok(())
    }

    // ── History events ────────────────────

    pub fn append_event(&self, event: &HistoryEvent) -> Result<()> {
        let conn = self.conn()?;
        insert_event(&conn, event)?;
        Ok(())
    }

    pub fn fetch_events(&self, broker_id: i64, profile_query_id: i64) -> Result<Vec<HistoryEvent>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT date, event_kind, broker_id, profile_query_id, extracted_profile_id, detail
             FROM history_events
             WHERE broker_id = ?1 AND profile_query_id = ?2 ORDER BY id",
        )?;
        let events = stmt
            .query_map(params![broker_id, profile_query_id], row_to_event)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(events)
    }

    // ── Milestones & meta ─────────────────

    /// Record a one-shot milestone. Returns true only the first time a
    /// given name is marked, so each hook fires at most once ever.
    pub fn mark_milestone(&self, name: &str, date: DateTime<Utc>) -> Result<bool> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "INSERT OR IGNORE INTO milestones (name, fired_date) VALUES (?1, ?2)",
            params![name, to_ts(date)],
        )?;
        Ok(changed > 0)
    }

    pub fn milestone_fired(&self, name: &str) -> Result<bool> {
        let conn = self.conn()?;
        let row: Option<String> = conn
            .query_row(
                "SELECT fired_date FROM milestones WHERE name = ?1",
                params![name],
                |row| row.get(0),
            )
            .optional()?;
        Ok(row.is_some())
    }

    pub fn meta_get(&self, key: &str) -> Result<Option<String>> {
        let conn = self.conn()?;
        conn.query_row(
            "SELECT value FROM meta WHERE key = ?1",
            params![key],
            |row| row.get(0),
        )
        .optional()
        .map_err(Into::into)
    }

    pub fn meta_set(&self, key: &str, value: &str) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT OR REPLACE INTO meta (key, value) VALUES (?1, ?2)",
            params![key, value],
        )?;
        Ok(())
    }

    /// Aggregate counts for the status surface.
    pub fn stats(&self) -> Result<VaultStats> {
        let conn = self.conn()?;
        let count = |sql: &str| -> rusqlite::Result<i64> { conn.query_row(sql, [], |r| r.get(0)) };
        Ok(VaultStats {
            brokers: count("SELECT COUNT(*) FROM brokers")?,
            profile_queries: count("SELECT COUNT(*) FROM profile_queries WHERE deprecated = 0")?,
            scan_jobs: count("SELECT COUNT(*) FROM scan_jobs")?,
            profiles_found: count("SELECT COUNT(*) FROM extracted_profiles")?,
            profiles_removed: count(
                "SELECT COUNT(*) FROM extracted_profiles WHERE removed_date IS NOT NULL",
            )?,
            opt_outs_submitted: count(
                "SELECT COUNT(*) FROM opt_out_jobs WHERE submitted_date IS NOT NULL",
            )?,
            opt_outs_pending: count(
                "SELECT COUNT(*) FROM opt_out_jobs o
                 JOIN extracted_profiles e ON e.id = o.extracted_profile_id
                 WHERE e.removed_date IS NULL",
            )?,
        })
    }

    // ── Job-completion transactions ───────

    /// Persist everything a successful scan produced, atomically.
    ///
    /// Updates the scan row's dates, inserts matches not seen before (each
    /// with exactly one opt-out job, guarded by the unique key on the
    /// extracted-profile id), and marks previously known profiles that the
    /// site no longer lists as removed. Re-found profiles never duplicate.
    pub fn record_scan_outcome(
        &self,
        broker_id: i64,
        profile_query_id: i64,
        found: &[ExtractedProfileRecord],
        now: DateTime<Utc>,
        next_run: DateTime<Utc>,
        opt_out_due: DateTime<Utc>,
    ) -> Result<ScanPersistSummary> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let mut summary = ScanPersistSummary {
            total_matches: found.len(),
            ..Default::default()
        };

        tx.execute(
            "UPDATE scan_jobs SET last_run_date = ?1, preferred_run_date = ?2
             WHERE broker_id = ?3 AND profile_query_id = ?4",
            params![to_ts(now), to_ts(next_run), broker_id, profile_query_id],
        )?;

        let known: Vec<(i64, String, Option<String>)> = {
            let mut stmt = tx.prepare(
                "SELECT id, profile_url, removed_date FROM extracted_profiles
                 WHERE broker_id = ?1 AND profile_query_id = ?2",
            )?;
            let rows = stmt
                .query_map(params![broker_id, profile_query_id], |row| {
                    Ok((row.get(0)?, row.get(1)?, row.get(2)?))
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            rows
        };

        for profile in found {
            let existing = known.iter().find(|(_, url, _)| *url == profile.profile_url);
            if existing.is_some() {
                continue;
            }
            tx.execute(
                "INSERT INTO extracted_profiles
                 (broker_id, profile_query_id, profile_url, full_name, age, addresses, relatives)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    broker_id,
                    profile_query_id,
                    profile.profile_url,
                    profile.full_name,
                    profile.age,
                    serde_json::to_string(&profile.addresses)?,
                    serde_json::to_string(&profile.relatives)?,
                ],
            )?;
            let profile_id = tx.last_insert_rowid();
            tx.execute(
                "INSERT OR IGNORE INTO opt_out_jobs
                 (broker_id, profile_query_id, extracted_profile_id, created_date, preferred_run_date)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    broker_id,
                    profile_query_id,
                    profile_id,
                    to_ts(now),
                    to_ts(opt_out_due),
                ],
            )?;
            summary.new_profile_ids.push(profile_id);
        }

        // Known profiles the site no longer lists: the true state wins.
        for (id, url, removed) in &known {
            let still_listed = found.iter().any(|p| p.profile_url == *url);
            if !still_listed && removed.is_none() {
                tx.execute(
                    "UPDATE extracted_profiles SET removed_date = ?1 WHERE id = ?2",
                    params![to_ts(now), id],
                )?;
                summary.removed_profile_ids.push(*id);
            }
        }

        let event_kind = if summary.total_matches > 0 {
            EventKind::MatchesFound
        } else {
            EventKind::NoMatchFound
        };
        insert_event(
            &tx,
            &HistoryEvent {
                date: now,
                kind: event_kind,
                broker_id,
                profile_query_id,
                extracted_profile_id: None,
                detail: Some(summary.total_matches.to_string()),
            },
        )?;

        tx.commit()?;
        Ok(summary)
    }

    /// Persist a submitted opt-out request, atomically.
    pub fn record_opt_out_submitted(
        &self,
        job: &OptOutJobData,
        now: DateTime<Utc>,
        next_check: DateTime<Utc>,
    ) -> Result<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        tx.execute(
            "UPDATE opt_out_jobs
             SET last_run_date = ?1, preferred_run_date = ?2, submitted_date = ?3
             WHERE extracted_profile_id = ?4",
            params![to_ts(now), to_ts(next_check), to_ts(now), job.extracted_profile_id],
        )?;
        insert_event(
            &tx,
            &HistoryEvent {
                date: now,
                kind: EventKind::OptOutRequested,
                broker_id: job.broker_id,
                profile_query_id: job.profile_query_id,
                extracted_profile_id: Some(job.extracted_profile_id),
                detail: None,
            },
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Persist an opt-out whose verification found the profile gone.
    pub fn record_opt_out_confirmed(&self, job: &OptOutJobData, now: DateTime<Utc>) -> Result<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        tx.execute(
            "UPDATE extracted_profiles SET removed_date = ?1 WHERE id = ?2",
            params![to_ts(now), job.extracted_profile_id],
        )?;
        tx.execute(
            "UPDATE opt_out_jobs SET last_run_date = ?1, preferred_run_date = NULL
             WHERE extracted_profile_id = ?2",
            params![to_ts(now), job.extracted_profile_id],
        )?;
        insert_event(
            &tx,
            &HistoryEvent {
                date: now,
                kind: EventKind::OptOutConfirmed,
                broker_id: job.broker_id,
                profile_query_id: job.profile_query_id,
                extracted_profile_id: Some(job.extracted_profile_id),
                detail: None,
            },
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Persist a failed opt-out attempt: bump the attempt count and push
    /// the tuple to its next scheduled run.
    pub fn record_opt_out_failure(
        &self,
        job: &OptOutJobData,
        now: DateTime<Utc>,
        next_run: DateTime<Utc>,
        error: &str,
    ) -> Result<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        tx.execute(
            "UPDATE opt_out_jobs
             SET attempt_count = attempt_count + 1, last_run_date = ?1, preferred_run_date = ?2
             WHERE extracted_profile_id = ?3",
            params![to_ts(now), to_ts(next_run), job.extracted_profile_id],
        )?;
        insert_event(
            &tx,
            &HistoryEvent {
                date: now,
                kind: EventKind::OptOutFailed,
                broker_id: job.broker_id,
                profile_query_id: job.profile_query_id,
                extracted_profile_id: Some(job.extracted_profile_id),
                detail: Some(error.to_string()),
            },
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Persist a failed scan attempt without touching the match set.
    pub fn record_scan_failure(
        &self,
        broker_id: i64,
        profile_query_id: i64,
        now: DateTime<Utc>,
        next_run: DateTime<Utc>,
        error: &str,
    ) -> Result<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        tx.execute(
            "UPDATE scan_jobs SET last_run_date = ?1, preferred_run_date = ?2
             WHERE broker_id = ?3 AND profile_query_id = ?4",
            params![to_ts(now), to_ts(next_run), broker_id, profile_query_id],
        )?;
        insert_event(
            &tx,
            &HistoryEvent {
                date: now,
                kind: EventKind::ScanFailed,
                broker_id,
                profile_query_id,
                extracted_profile_id: None,
                detail: Some(error.to_string()),
            },
        )?;
        tx.commit()?;
        Ok(())
    }
}

// ── Row mappers ───────────────────────────

fn row_to_broker(row: &rusqlite::Row<'_>) -> rusqlite::Result<DataBroker> {
    let steps: String = row.get(5)?;
    Ok(DataBroker {
        id: Some(row.get(0)?),
        name: row.get(1)?,
        url: row.get(2)?,
        version: row.get(3)?,
        parent: row.get(4)?,
        steps: serde_json::from_str(&steps).unwrap_or_default(),
    })
}

fn row_to_profile_query(row: &rusqlite::Row<'_>) -> rusqlite::Result<ProfileQuery> {
    Ok(ProfileQuery {
        id: Some(row.get(0)?),
        first_name: row.get(1)?,
        last_name: row.get(2)?,
        middle_name: row.get(3)?,
        city: row.get(4)?,
        state: row.get(5)?,
        birth_year: row.get(6)?,
        deprecated: row.get(7)?,
    })
}

fn row_to_scan_job(row: &rusqlite::Row<'_>) -> rusqlite::Result<ScanJobData> {
    Ok(ScanJobData {
        broker_id: row.get(0)?,
        profile_query_id: row.get(1)?,
        last_run_date: from_ts_opt(row.get(2)?),
        preferred_run_date: from_ts_opt(row.get(3)?),
    })
}

fn row_to_opt_out(row: &rusqlite::Row<'_>) -> rusqlite::Result<OptOutJobData> {
    Ok(OptOutJobData {
        broker_id: row.get(0)?,
        profile_query_id: row.get(1)?,
        extracted_profile_id: row.get(2)?,
        created_date: from_ts_opt(row.get(3)?).unwrap_or_else(Utc::now),
        attempt_count: row.get(4)?,
        last_run_date: from_ts_opt(row.get(5)?),
        preferred_run_date: from_ts_opt(row.get(6)?),
        submitted_date: from_ts_opt(row.get(7)?),
    })
}

fn row_to_extracted(row: &rusqlite::Row<'_>) -> rusqlite::Result<ExtractedProfileRecord> {
    let addresses: String = row.get(6)?;
    let relatives: String = row.get(7)?;
    Ok(ExtractedProfileRecord {
        id: Some(row.get(0)?),
        broker_id: Some(row.get(1)?),
        profile_query_id: Some(row.get(2)?),
        profile_url: row.get(3)?,
        full_name: row.get(4)?,
        age: row.get(5)?,
        addresses: serde_json::from_str(&addresses).unwrap_or_default(),
        relatives: serde_json::from_str(&relatives).unwrap_or_default(),
        email: row.get(8)?,
        removed_date: from_ts_opt(row.get(9)?),
    })
}

fn row_to_event(row: &rusqlite::Row<'_>) -> rusqlite::Result<HistoryEvent> {
    let kind: String = row.get(1)?;
    Ok(HistoryEvent {
        date: from_ts_opt(row.get(0)?).unwrap_or_else(Utc::now),
        kind: match kind.as_str() {
            "scan_started" => EventKind::ScanStarted,
            "matches_found" => EventKind::MatchesFound,
            "no_match_found" => EventKind::NoMatchFound,
            "scan_failed" => EventKind::ScanFailed,
            "opt_out_started" => EventKind::OptOutStarted,
            "opt_out_requested" => EventKind::OptOutRequested,
            "opt_out_confirmed" => EventKind::OptOutConfirmed,
            _ => EventKind::OptOutFailed,
        },
        broker_id: row.get(2)?,
        profile_query_id: row.get(3)?,
        extracted_profile_id: row.get(4)?,
        detail: row.get(5)?,
    })
}

fn insert_event(conn: &Connection, event: &HistoryEvent) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO history_events
         (date, event_kind, broker_id, profile_query_id, extracted_profile_id, detail)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            to_ts(event.date),
            event.kind.as_str(),
            event.broker_id,
            event.profile_query_id,
            event.extracted_profile_id,
            event.detail,
        ],
    )?;
    Ok(())
}

fn to_ts(date: DateTime<Utc>) -> String {
    date.to_rfc3339()
}

fn from_ts_opt(value: Option<String>) -> Option<DateTime<Utc>> {
    value
        .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
        .map(|d| d.with_timezone(&Utc))
}
