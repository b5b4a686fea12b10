//! Browser-automation driver abstraction.
//!
//! Defines the `Driver` and `DriverSession` traits that abstract over the
//! browser engine (currently Chromium via chromiumoxide). The job engine
//! only ever talks to these traits, so tests run against scripted drivers
//! and the daemon degrades to [`NoopDriver`] when no browser is installed.

pub mod chromium;

use crate::broker::{Action, ExtractedProfileRecord, ProfileQuery};
use anyhow::Result;
use async_trait::async_trait;

/// Values in scope while a script runs: the query being searched for and,
/// during opt-out runs, the specific extracted profile being removed.
pub struct ActionContext<'a> {
    pub query: &'a ProfileQuery,
    pub extracted: Option<&'a ExtractedProfileRecord>,
}

/// Outcome of executing one action inside a session.
#[derive(Debug, Clone)]
pub enum ActionResult {
    /// The action did what its script says.
    Completed,
    /// An extract action collected these matches (possibly none).
    Extracted(Vec<ExtractedProfileRecord>),
    /// A captcha was found; the solving service takes it from here.
    CaptchaFound { site_key: String, page_url: String },
    /// The page no longer matches the script's expectations.
    PageInvalid,
    /// The action failed in a retryable way.
    Failed { message: String },
}

/// A browser engine that can open automation sessions.
#[async_trait]
pub trait Driver: Send + Sync {
    /// Open a new isolated session (tab).
    async fn new_session(&self) -> Result<Box<dyn DriverSession>>;
    /// Shut down the browser engine.
    async fn shutdown(&self) -> Result<()>;
    /// Number of currently active sessions.
    fn active_sessions(&self) -> usize;
}

/// A single browser session running one job's script.
#[async_trait]
pub trait DriverSession: Send + Sync {
    /// Execute one script action in the page.
    async fn execute(&mut self, action: &Action, ctx: &ActionContext<'_>) -> Result<ActionResult>;
    /// Load a URL directly (confirmation links, restarts).
    async fn load(&mut self, url: &str) -> Result<ActionResult>;
    /// Hand a solved captcha token back to the page.
    async fn inject_captcha_token(&mut self, token: &str) -> Result<ActionResult>;
    /// The page's current URL.
    async fn current_url(&self) -> Result<String>;
    /// Close the session. Always called, on success and failure alike.
    async fn finish(self: Box<Self>) -> Result<()>;
}

/// A no-op driver used when Chromium is unavailable.
///
/// The scheduler, updater, and vault all function without a browser; only
/// job dispatch fails, and it fails per-job rather than at startup.
pub struct NoopDriver;

#[async_trait]
impl Driver for NoopDriver {
    async fn new_session(&self) -> Result<Box<dyn DriverSession>> {
        Err(anyhow::anyhow!("browser not available"))
    }
    async fn shutdown(&self) -> Result<()> {
        Ok(())
    }
    fn active_sessions(&self) -> usize {
        0
    }
}
