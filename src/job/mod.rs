//! Job engine: runs one broker script inside one driver session.
//!
//! A run walks the script with the [`ActionInterpreter`], checking for
//! cancellation before every action, bounding each action with a timeout and
//! the whole run with a wall-clock deadline, pacing between actions, and
//! re-issuing a failed action a bounded number of times before giving up.
//! The engine never writes to the vault; outcomes are returned to the
//! scheduler, which persists them atomically.

pub mod interpreter;

use crate::broker::{Action, DataBroker, ExtractedProfileRecord, ProfileQuery};
use crate::config::EngineConfig;
use crate::driver::{ActionContext, ActionResult, DriverSession};
use crate::services::{CaptchaSolver, EmailVerifier};
use interpreter::ActionInterpreter;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use uuid::Uuid;

/// Why a run did not complete.
#[derive(Debug, Error)]
pub enum JobError {
    #[error("job cancelled")]
    Cancelled,
    #[error("navigation failed: {0}")]
    NavigationFailed(String),
    #[error("page no longer matches the script")]
    ExtractionMismatch,
    #[error("captcha could not be solved: {0}")]
    CaptchaUnsolvable(String),
    #[error("email verification failed: {0}")]
    EmailVerificationFailed(String),
    #[error("{0} action timed out")]
    ActionTimeout(&'static str),
    #[error("job deadline exceeded")]
    Deadline,
    #[error("storage failure: {0}")]
    Storage(String),
    #[error("{0}")]
    Unknown(String),
}

impl JobError {
    /// Stable tag for history events and outbound hooks.
    pub fn kind(&self) -> &'static str {
        match self {
            JobError::Cancelled => "cancelled",
            JobError::NavigationFailed(_) => "navigation_failed",
            JobError::ExtractionMismatch => "extraction_mismatch",
            JobError::CaptchaUnsolvable(_) => "captcha_unsolvable",
            JobError::EmailVerificationFailed(_) => "email_verification_failed",
            JobError::ActionTimeout(_) => "action_timeout",
            JobError::Deadline => "deadline",
            JobError::Storage(_) => "storage",
            JobError::Unknown(_) => "unknown",
        }
    }
}

/// Run lifecycle, surfaced in debug logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Idle,
    Initializing,
    Executing(usize),
    Completed,
    Failed,
    Cancelled,
}

/// How an opt-out run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OptOutOutcome {
    /// The removal request was submitted.
    Submitted {
        /// Address generated during this run, if the script needed one.
        email: Option<String>,
    },
    /// The verifying extract no longer finds the profile on the site.
    ProfileAbsent,
}

enum Dispatched {
    Completed,
    Extracted(Vec<ExtractedProfileRecord>),
    CaptchaFound { site_key: String, page_url: String },
    PageInvalid,
    Failed(String),
    TimedOut,
}

struct DriveSummary {
    matches: Vec<ExtractedProfileRecord>,
    extract_ran: bool,
}

/// Executes scan and opt-out scripts.
pub struct JobRunner {
    config: EngineConfig,
    captcha: Arc<dyn CaptchaSolver>,
    email: Arc<dyn EmailVerifier>,
    cancel: Arc<AtomicBool>,
}

impl JobRunner {
    pub fn new(
        config: EngineConfig,
        captcha: Arc<dyn CaptchaSolver>,
        email: Arc<dyn EmailVerifier>,
        cancel: Arc<AtomicBool>,
    ) -> Self {
        Self {
            config,
            captcha,
            email,
            cancel,
        }
    }

    fn should_continue(&self) -> bool {
        !self.cancel.load(Ordering::Relaxed)
    }

    /// Run the broker's scan script and return the matches it extracted.
    pub async fn run_scan(
        &self,
        mut session: Box<dyn DriverSession>,
        broker: &DataBroker,
        query: &ProfileQuery,
    ) -> Result<Vec<ExtractedProfileRecord>, JobError> {
        let attempt_id = Uuid::new_v4();
        tracing::debug!(%attempt_id, broker = %broker.url, "scan run starting");

        let result = match broker.scan_actions() {
            None => Err(JobError::Unknown(format!(
                "broker {} has no scan script",
                broker.url
            ))),
            Some(actions) => {
                let mut interpreter = ActionInterpreter::for_actions(actions);
                let mut profile = None;
                self.drive(&mut session, &mut interpreter, query, &mut profile)
                    .await
            }
        };
        // The session is released on every exit path.
        let _ = session.finish().await;

        match result {
            Ok(summary) if summary.extract_ran => {
                tracing::debug!(%attempt_id, matches = summary.matches.len(), "scan run completed");
                Ok(summary.matches)
            }
            Ok(_) => Err(JobError::Unknown(format!(
                "scan script for {} never extracted",
                broker.url
            ))),
            Err(e) => {
                tracing::debug!(%attempt_id, error = %e, "scan run failed");
                Err(e)
            }
        }
    }

    /// Run the broker's opt-out script for one extracted profile.
    pub async fn run_opt_out(
        &self,
        mut session: Box<dyn DriverSession>,
        broker: &DataBroker,
        query: &ProfileQuery,
        extracted: &ExtractedProfileRecord,
    ) -> Result<OptOutOutcome, JobError> {
        let attempt_id = Uuid::new_v4();
        tracing::debug!(
            %attempt_id,
            broker = %broker.url,
            profile = %extracted.profile_url,
            "opt-out run starting"
        );

        let result = match broker.opt_out_actions() {
            None => Err(JobError::Unknown(format!(
                "broker {} has no opt-out script",
                broker.url
            ))),
            Some(actions) => {
                let mut interpreter = ActionInterpreter::for_actions(actions);
                let mut profile = Some(extracted.clone());
                self.drive(&mut session, &mut interpreter, query, &mut profile)
                    .await
                    .map(|summary| (summary, profile))
            }
        };
        let _ = session.finish().await;

        match result {
            Ok((summary, profile)) => {
                let absent = summary.extract_ran
                    && !summary
                        .matches
                        .iter()
                        .any(|m| m.profile_url == extracted.profile_url);
                if absent {
                    tracing::debug!(%attempt_id, "profile already absent");
                    Ok(OptOutOutcome::ProfileAbsent)
                } else {
                    tracing::debug!(%attempt_id, "opt-out submitted");
                    // Only report an address the run itself generated.
                    let generated = profile
                        .and_then(|p| p.email)
                        .filter(|_| extracted.email.is_none());
                    Ok(OptOutOutcome::Submitted { email: generated })
                }
            }
            Err(e) => {
                tracing::debug!(%attempt_id, error = %e, "opt-out run failed");
                Err(e)
            }
        }
    }

    /// Walk the script to completion or failure.
    async fn drive(
        &self,
        session: &mut Box<dyn DriverSession>,
        interpreter: &mut ActionInterpreter,
        query: &ProfileQuery,
        profile: &mut Option<ExtractedProfileRecord>,
    ) -> Result<DriveSummary, JobError> {
        let started = Instant::now();
        let mut restarted = false;
        let mut retries_left = self.config.max_retries_per_run;
        let mut summary = DriveSummary {
            matches: Vec::new(),
            extract_ran: false,
        };

        while let Some(action) = interpreter.next_action() {
            loop {
                if !self.should_continue() {
                    tracing::debug!(state = ?JobState::Cancelled, "run cancelled before action");
                    return Err(JobError::Cancelled);
                }
                let remaining = match self.config.job_deadline.checked_sub(started.elapsed()) {
                    Some(left) if !left.is_zero() => left,
                    _ => {
                        tracing::debug!(state = ?JobState::Failed, "run exceeded its deadline");
                        return Err(JobError::Deadline);
                    }
                };
                // No single action may outlive the run.
                let budget = self.config.action_timeout.min(remaining);
                tracing::trace!(
                    state = ?JobState::Executing(interpreter.position()),
                    action = action.kind(),
                    "dispatching action"
                );

                match self.dispatch(session, &action, query, profile, budget).await? {
                    Dispatched::Completed => {
                        retries_left = self.config.max_retries_per_run;
                        break;
                    }
                    Dispatched::Extracted(records) => {
                        summary.matches = records;
                        summary.extract_ran = true;
                        retries_left = self.config.max_retries_per_run;
                        break;
                    }
                    Dispatched::CaptchaFound { .. } => {
                        // Only a solveCaptcha action may report a captcha;
                        // anywhere else the script and page disagree.
                        return Err(JobError::ExtractionMismatch);
                    }
                    Dispatched::PageInvalid => {
                        if restarted {
                            tracing::debug!(state = ?JobState::Failed, "page invalid twice");
                            return Err(JobError::ExtractionMismatch);
                        }
                        // One restart per run: the page may have been in a
                        // transient state on the first pass.
                        restarted = true;
                        retries_left = self.config.max_retries_per_run;
                        interpreter.restart();
                        tracing::debug!(action = action.kind(), "page invalid, restarting script");
                        break;
                    }
                    Dispatched::Failed(message) => {
                        if retries_left == 0 {
                            tracing::debug!(state = ?JobState::Failed, %message, "retries exhausted");
                            return Err(classify_failure(&action, message));
                        }
                        retries_left -= 1;
                        tracing::debug!(
                            action = action.kind(),
                            retries_left,
                            %message,
                            "action failed, retrying"
                        );
                        tokio::time::sleep(self.config.retry_wait).await;
                        continue;
                    }
                    Dispatched::TimedOut => {
                        // A truncated budget means the deadline, not the
                        // per-action timeout, is what expired.
                        if started.elapsed() >= self.config.job_deadline {
                            tracing::debug!(state = ?JobState::Failed, "run exceeded its deadline");
                            return Err(JobError::Deadline);
                        }
                        if retries_left == 0 {
                            return Err(JobError::ActionTimeout(action.kind()));
                        }
                        retries_left -= 1;
                        tracing::debug!(action = action.kind(), retries_left, "action timed out, retrying");
                        tokio::time::sleep(self.config.retry_wait).await;
                        continue;
                    }
                }
            }
            tokio::time::sleep(self.config.pacing).await;
        }

        tracing::trace!(state = ?JobState::Completed, "script complete");
        Ok(summary)
    }

    /// Dispatch a single action, routing service actions to their clients.
    ///
    /// Everything runs under `budget`, service calls and waits included, so
    /// no action can hold a worker past the run's deadline. Retryable
    /// outcomes come back as `Dispatched` variants; service refusals and
    /// driver errors come back as `Err`.
    async fn dispatch(
        &self,
        session: &mut Box<dyn DriverSession>,
        action: &Action,
        query: &ProfileQuery,
        profile: &mut Option<ExtractedProfileRecord>,
        budget: Duration,
    ) -> Result<Dispatched, JobError> {
        match action {
            Action::Wait { seconds } => {
                let nap = Duration::from_secs(*seconds);
                self.timed(
                    async move {
                        tokio::time::sleep(nap).await;
                        Ok(ActionResult::Completed)
                    },
                    "wait",
                    budget,
                )
                .await
            }
            Action::EmailConfirmation { polling_seconds } => {
                let address = profile
                    .as_ref()
                    .and_then(|p| p.email.clone())
                    .ok_or_else(|| {
                        JobError::EmailVerificationFailed("no address was generated".to_string())
                    })?;
                let poll = self.email.poll_confirmation_link(&address, *polling_seconds);
                let link = match tokio::time::timeout(budget, poll).await {
                    Err(_) => return Ok(Dispatched::TimedOut),
                    Ok(Err(e)) => {
                        return Err(JobError::EmailVerificationFailed(format!("{e:#}")))
                    }
                    Ok(Ok(link)) => link,
                };
                self.timed(session.load(&link), "emailConfirmation", budget)
                    .await
            }
            Action::SolveCaptcha { .. } => {
                let found = {
                    let ctx = ActionContext {
                        query,
                        extracted: profile.as_ref(),
                    };
                    self.timed(session.execute(action, &ctx), "solveCaptcha", budget)
                        .await?
                };
                match found {
                    Dispatched::CaptchaFound { site_key, page_url } => {
                        let solve = self.captcha.solve(&site_key, &page_url);
                        let token = match tokio::time::timeout(budget, solve).await {
                            Err(_) => return Ok(Dispatched::TimedOut),
                            Ok(Err(e)) => {
                                return Err(JobError::CaptchaUnsolvable(format!("{e:#}")))
                            }
                            Ok(Ok(token)) => token,
                        };
                        self.timed(session.inject_captcha_token(&token), "solveCaptcha", budget)
                            .await
                    }
                    other => Ok(other),
                }
            }
            Action::FillForm { .. } if action.needs_email() => {
                // The script wants an address for this opt-out; generate one
                // the first time and keep it for the confirmation step.
                if profile.as_ref().map(|p| p.email.is_none()).unwrap_or(false) {
                    let generate = self.email.generate_address();
                    let address = match tokio::time::timeout(budget, generate).await {
                        Err(_) => return Ok(Dispatched::TimedOut),
                        Ok(Err(e)) => {
                            return Err(JobError::EmailVerificationFailed(format!("{e:#}")))
                        }
                        Ok(Ok(address)) => address,
                    };
                    if let Some(p) = profile.as_mut() {
                        p.email = Some(address);
                    }
                }
                let ctx = ActionContext {
                    query,
                    extracted: profile.as_ref(),
                };
                self.timed(session.execute(action, &ctx), "fillForm", budget)
                    .await
            }
            _ => {
                let ctx = ActionContext {
                    query,
                    extracted: profile.as_ref(),
                };
                self.timed(session.execute(action, &ctx), action.kind(), budget)
                    .await
            }
        }
    }

    /// Bound a call by `budget` and translate its result into a dispatch
    /// outcome.
    async fn timed(
        &self,
        fut: impl std::future::Future<Output = anyhow::Result<ActionResult>> + Send,
        kind: &'static str,
        budget: Duration,
    ) -> Result<Dispatched, JobError> {
        match tokio::time::timeout(budget, fut).await {
            Err(_) => Ok(Dispatched::TimedOut),
            Ok(Err(e)) => Err(JobError::Unknown(format!("{kind}: {e:#}"))),
            Ok(Ok(result)) => Ok(match result {
                ActionResult::Completed => Dispatched::Completed,
                ActionResult::Extracted(records) => Dispatched::Extracted(records),
                ActionResult::PageInvalid => Dispatched::PageInvalid,
                ActionResult::Failed { message } => Dispatched::Failed(message),
                ActionResult::CaptchaFound { site_key, page_url } => {
                    Dispatched::CaptchaFound { site_key, page_url }
                }
            }),
        }
    }
}

fn classify_failure(action: &Action, message: String) -> JobError {
    match action {
        Action::Navigate { .. } => JobError::NavigationFailed(message),
        _ => JobError::Unknown(format!("{}: {message}", action.kind())),
    }
}
