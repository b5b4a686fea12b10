//! Chromium-based driver using chromiumoxide.
//!
//! Actions execute as sanitized JavaScript evaluated in the page. Every
//! user- or broker-supplied value is escaped before it reaches a script so
//! a hostile selector or profile value can never break out of a string
//! literal.

use super::{ActionContext, ActionResult, Driver, DriverSession};
use crate::broker::{substitute_templates, Action, ExtractSelectors, ExtractedProfileRecord};
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chromiumoxide::browser::{Browser, BrowserConfig};
use chromiumoxide::page::Page;
use futures::StreamExt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

const NAV_TIMEOUT_MS: u64 = 30_000;

/// Find the Chromium binary path.
pub fn find_chromium() -> Option<PathBuf> {
    // 1. UNLIST_CHROMIUM_PATH env
    if let Ok(p) = std::env::var("UNLIST_CHROMIUM_PATH") {
        let path = PathBuf::from(&p);
        if path.exists() {
            return Some(path);
        }
    }

    // 2. ~/.unlist/chromium/
    if let Some(home) = dirs::home_dir() {
        let candidates = if cfg!(target_os = "macos") {
            vec![
                home.join(".unlist/chromium/chrome-mac-arm64/Google Chrome for Testing.app/Contents/MacOS/Google Chrome for Testing"),
                home.join(".unlist/chromium/chrome-mac-x64/Google Chrome for Testing.app/Contents/MacOS/Google Chrome for Testing"),
                home.join(".unlist/chromium/chrome"),
            ]
        } else {
            vec![
                home.join(".unlist/chromium/chrome-linux64/chrome"),
                home.join(".unlist/chromium/chrome"),
            ]
        };
        for c in candidates {
            if c.exists() {
                return Some(c);
            }
        }
    }

    // 3. System PATH
    for name in ["google-chrome", "chromium", "chromium-browser"] {
        if let Ok(path) = which::which(name) {
            return Some(path);
        }
    }

    // 4. Common macOS location
    if cfg!(target_os = "macos") {
        let common = PathBuf::from("/Applications/Google Chrome.app/Contents/MacOS/Google Chrome");
        if common.exists() {
            return Some(common);
        }
    }

    None
}

/// Chromium-based driver.
pub struct ChromiumDriver {
    browser: Browser,
    active_count: Arc<AtomicUsize>,
}

impl ChromiumDriver {
    /// Launch a headless Chromium instance.
    pub async fn new() -> Result<Self> {
        let chrome_path = find_chromium().context("Chromium not found")?;

        let config = BrowserConfig::builder()
            .chrome_executable(chrome_path)
            .arg("--headless=new")
            .arg("--disable-gpu")
            .arg("--no-sandbox")
            .arg("--disable-dev-shm-usage")
            .arg("--disable-extensions")
            .arg("--disable-background-networking")
            .build()
            .map_err(|e| anyhow::anyhow!("failed to build browser config: {e}"))?;

        let (browser, mut handler) = Browser::launch(config)
            .await
            .context("failed to launch Chromium")?;

        tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                let _ = event;
            }
        });

        Ok(Self {
            browser,
            active_count: Arc::new(AtomicUsize::new(0)),
        })
    }
}

#[async_trait]
impl Driver for ChromiumDriver {
    async fn new_session(&self) -> Result<Box<dyn DriverSession>> {
        let page = self
            .browser
            .new_page("about:blank")
            .await
            .context("failed to create new page")?;

        self.active_count.fetch_add(1, Ordering::Relaxed);

        Ok(Box::new(ChromiumSession {
            page,
            active_count: Arc::clone(&self.active_count),
        }))
    }

    async fn shutdown(&self) -> Result<()> {
        // Browser is dropped when ChromiumDriver is dropped
        Ok(())
    }

    fn active_sessions(&self) -> usize {
        self.active_count.load(Ordering::Relaxed)
    }
}

/// A single Chromium page session.
pub struct ChromiumSession {
    page: Page,
    active_count: Arc<AtomicUsize>,
}

impl ChromiumSession {
    async fn execute_js(&self, script: &str) -> Result<serde_json::Value> {
        let result = self
            .page
            .evaluate(script)
            .await
            .context("JS execution failed")?;
        result
            .into_value()
            .map_err(|e| anyhow::anyhow!("failed to convert JS result: {e:?}"))
    }

    /// Interpret the standard `{ success: bool }` script response.
    fn success_or(&self, value: &serde_json::Value, failure: ActionResult) -> ActionResult {
        let ok = value
            .as_object()
            .and_then(|o| o.get("success"))
            .and_then(|v| v.as_bool())
            .unwrap_or(false);
        if ok {
            ActionResult::Completed
        } else {
            failure
        }
    }

    async fn extract_profiles(
        &self,
        selector: &str,
        profile: &ExtractSelectors,
    ) -> Result<ActionResult> {
        let script = build_extract_script(selector, profile);
        let value = self.execute_js(&script).await?;
        let base = self.current_url_inner().await?;

        let mut records = Vec::new();
        for item in value.as_array().cloned().unwrap_or_default() {
            let text = |key: &str| -> String {
                item.get(key)
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .trim()
                    .to_string()
            };
            let list = |key: &str| -> Vec<String> {
                item.get(key)
                    .and_then(|v| v.as_array())
                    .map(|a| {
                        a.iter()
                            .filter_map(|v| v.as_str())
                            .map(|s| s.trim().to_string())
                            .filter(|s| !s.is_empty())
                            .collect()
                    })
                    .unwrap_or_default()
            };

            let raw_url = text("profileUrl");
            if raw_url.is_empty() {
                continue;
            }
            // Listing links are often relative; resolve against the page.
            let profile_url = match url::Url::parse(&base).and_then(|b| b.join(&raw_url)) {
                Ok(u) => u.to_string(),
                Err(_) => raw_url,
            };

            records.push(ExtractedProfileRecord {
                id: None,
                broker_id: None,
                profile_query_id: None,
                profile_url,
                full_name: text("name"),
                age: Some(text("age")).filter(|s| !s.is_empty()),
                addresses: list("addresses"),
                relatives: list("relatives"),
                email: None,
                removed_date: None,
            });
        }
        Ok(ActionResult::Extracted(records))
    }

    async fn current_url_inner(&self) -> Result<String> {
        let url = self
            .page
            .url()
            .await
            .context("failed to get URL")?
            .map(|u| u.to_string())
            .unwrap_or_default();
        Ok(url)
    }

    async fn goto(&mut self, url: &str) -> Result<ActionResult> {
        let result = tokio::time::timeout(
            std::time::Duration::from_millis(NAV_TIMEOUT_MS),
            self.page.goto(url),
        )
        .await;

        match result {
            Ok(Ok(_)) => {
                let _ = self.page.wait_for_navigation().await;
                Ok(ActionResult::Completed)
            }
            Ok(Err(e)) => Ok(ActionResult::Failed {
                message: format!("navigation failed: {e}"),
            }),
            Err(_) => Ok(ActionResult::Failed {
                message: format!("navigation timed out after {NAV_TIMEOUT_MS}ms"),
            }),
        }
    }
}

#[async_trait]
impl DriverSession for ChromiumSession {
    async fn execute(&mut self, action: &Action, ctx: &ActionContext<'_>) -> Result<ActionResult> {
        match action {
            Action::Navigate { url } => {
                let url = substitute_templates(url, ctx.query, ctx.extracted);
                self.goto(&url).await
            }
            Action::Click { selector } => {
                let value = self.execute_js(&build_click_script(selector)).await?;
                Ok(self.success_or(
                    &value,
                    ActionResult::Failed {
                        message: format!("no element matched {selector}"),
                    },
                ))
            }
            Action::FillForm { fields } => {
                for field in fields {
                    let value_text =
                        substitute_templates(&field.value, ctx.query, ctx.extracted);
                    let value = self
                        .execute_js(&build_fill_script(&field.selector, &value_text))
                        .await?;
                    let result = self.success_or(
                        &value,
                        ActionResult::Failed {
                            message: format!("no form field matched {}", field.selector),
                        },
                    );
                    if !matches!(result, ActionResult::Completed) {
                        return Ok(result);
                    }
                }
                Ok(ActionResult::Completed)
            }
            Action::Extract { selector, profile } => self.extract_profiles(selector, profile).await,
            Action::SolveCaptcha { selector } => {
                let value = self.execute_js(&build_sitekey_script(selector)).await?;
                match value.as_str() {
                    Some(site_key) if !site_key.is_empty() => Ok(ActionResult::CaptchaFound {
                        site_key: site_key.to_string(),
                        page_url: self.current_url_inner().await?,
                    }),
                    _ => Ok(ActionResult::Failed {
                        message: format!("no captcha widget matched {selector}"),
                    }),
                }
            }
            Action::Expectation { selector, expect } => {
                let value = self
                    .execute_js(&build_expectation_script(selector, expect.as_deref()))
                    .await?;
                Ok(self.success_or(&value, ActionResult::PageInvalid))
            }
            Action::Wait { seconds } => {
                tokio::time::sleep(std::time::Duration::from_secs(*seconds)).await;
                Ok(ActionResult::Completed)
            }
            Action::EmailConfirmation { .. } => {
                // Needs the email service; the job engine routes it there
                // and only calls `load` on the confirmation link.
                bail!("emailConfirmation cannot run inside a browser session")
            }
        }
    }

    async fn load(&mut self, url: &str) -> Result<ActionResult> {
        self.goto(url).await
    }

    async fn inject_captcha_token(&mut self, token: &str) -> Result<ActionResult> {
        let value = self.execute_js(&build_token_script(token)).await?;
        Ok(self.success_or(
            &value,
            ActionResult::Failed {
                message: "no captcha response field on page".to_string(),
            },
        ))
    }

    async fn current_url(&self) -> Result<String> {
        self.current_url_inner().await
    }

    async fn finish(self: Box<Self>) -> Result<()> {
        self.active_count.fetch_sub(1, Ordering::Relaxed);
        let _ = self.page.close().await;
        Ok(())
    }
}

// ── Script builders ───────────────────────
//
// Every interpolated value goes through `sanitize_js_string` and lands only
// inside string literals, never in code position.

fn build_click_script(selector: &str) -> String {
    format!(
        r#"(() => {{
            const el = document.querySelector('{}');
            if (el) {{ el.click(); return {{ success: true }}; }}
            return {{ success: false }};
        }})()"#,
        sanitize_js_string(selector)
    )
}

fn build_fill_script(selector: &str, value: &str) -> String {
    format!(
        r#"(() => {{
            const el = document.querySelector('{}');
            if (el) {{
                el.value = '{}';
                el.dispatchEvent(new Event('input', {{ bubbles: true }}));
                el.dispatchEvent(new Event('change', {{ bubbles: true }}));
                return {{ success: true }};
            }}
            return {{ success: false }};
        }})()"#,
        sanitize_js_string(selector),
        sanitize_js_string(value)
    )
}

fn build_extract_script(selector: &str, profile: &ExtractSelectors) -> String {
    let sub = |sel: &Option<String>| sanitize_js_string(sel.as_deref().unwrap_or(""));
    format!(
        r#"(() => {{
            const text = (root, sel) => {{
                if (!sel) return '';
                const el = root.querySelector(sel);
                return el ? el.textContent.trim() : '';
            }};
            const texts = (root, sel) => {{
                if (!sel) return [];
                return [...root.querySelectorAll(sel)].map(el => el.textContent.trim());
            }};
            const href = (root, sel) => {{
                const el = root.querySelector(sel);
                if (!el) return '';
                return el.getAttribute('href') || el.textContent.trim();
            }};
            return [...document.querySelectorAll('{}')].map(row => ({{
                name: text(row, '{}'),
                age: text(row, '{}'),
                addresses: texts(row, '{}'),
                relatives: texts(row, '{}'),
                profileUrl: href(row, '{}')
            }}));
        }})()"#,
        sanitize_js_string(selector),
        sanitize_js_string(&profile.name),
        sub(&profile.age),
        sub(&profile.addresses),
        sub(&profile.relatives),
        sanitize_js_string(&profile.profile_url),
    )
}

fn build_sitekey_script(selector: &str) -> String {
    format!(
        r#"(() => {{
            const el = document.querySelector('{}');
            if (!el) return '';
            return el.getAttribute('data-sitekey') || '';
        }})()"#,
        sanitize_js_string(selector)
    )
}

fn build_token_script(token: &str) -> String {
    format!(
        r#"(() => {{
            const field = document.querySelector('#g-recaptcha-response, [name="g-recaptcha-response"], [name="h-captcha-response"]');
            if (!field) return {{ success: false }};
            field.style.display = '';
            field.value = '{}';
            field.dispatchEvent(new Event('change', {{ bubbles: true }}));
            return {{ success: true }};
        }})()"#,
        sanitize_js_string(token)
    )
}

fn build_expectation_script(selector: &str, expect: Option<&str>) -> String {
    match expect {
        Some(needle) => format!(
            r#"(() => {{
                const el = document.querySelector('{}');
                if (!el) return {{ success: false }};
                return {{ success: el.textContent.includes('{}') }};
            }})()"#,
            sanitize_js_string(selector),
            sanitize_js_string(needle)
        ),
        None => format!(
            r#"(() => {{
                return {{ success: document.querySelector('{}') !== null }};
            }})()"#,
            sanitize_js_string(selector)
        ),
    }
}

/// Sanitize a string for safe injection into a JavaScript string literal.
///
/// Escapes all characters that could break out of a JS string context:
/// backslashes, quotes, backticks, newlines, and HTML script-tag brackets.
/// Null bytes are stripped.
fn sanitize_js_string(s: &str) -> String {
    let mut result = String::with_capacity(s.len() + 8);
    for ch in s.chars() {
        match ch {
            '\\' => result.push_str("\\\\"),
            '\'' => result.push_str("\\'"),
            '"' => result.push_str("\\\""),
            '`' => result.push_str("\\`"),
            '\n' => result.push_str("\\n"),
            '\r' => result.push_str("\\r"),
            '\t' => result.push_str("\\t"),
            '\0' => {}
            '<' => result.push_str("\\x3c"),
            '>' => result.push_str("\\x3e"),
            _ => result.push(ch),
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::ProfileQuery;

    #[test]
    fn test_sanitize_basic() {
        assert_eq!(sanitize_js_string("hello"), "hello");
        assert_eq!(sanitize_js_string("it's"), "it\\'s");
        assert_eq!(sanitize_js_string("a\"b"), "a\\\"b");
    }

    #[test]
    fn test_sanitize_script_breakout() {
        let malicious = r#"</script><script>alert(1)</script>"#;
        let sanitized = sanitize_js_string(malicious);
        assert!(!sanitized.contains("</script>"));
        assert!(sanitized.contains("\\x3c/script\\x3e"));
    }

    #[test]
    fn test_sanitize_null_bytes() {
        assert_eq!(sanitize_js_string("abc\0def"), "abcdef");
    }

    #[test]
    fn test_fill_script_escapes_profile_values() {
        // A profile value with a quote must not terminate the JS literal.
        let script = build_fill_script("#name", "O'Brien");
        assert!(script.contains("O\\'Brien"));
    }

    #[test]
    fn test_extract_script_uses_all_selectors() {
        let profile = ExtractSelectors {
            name: ".name".to_string(),
            age: Some(".age".to_string()),
            addresses: Some(".addr".to_string()),
            relatives: None,
            profile_url: "a.profile".to_string(),
        };
        let script = build_extract_script(".result", &profile);
        assert!(script.contains(".result"));
        assert!(script.contains(".age"));
        assert!(script.contains("a.profile"));
    }

    #[tokio::test]
    #[ignore] // Requires Chromium to be installed
    async fn test_chromium_scan_actions_on_data_url() {
        let driver = ChromiumDriver::new().await.expect("failed to launch");
        let mut session = driver.new_session().await.expect("failed to open session");

        let query = ProfileQuery::new("Jane", "Doe", "Miami", "FL");
        let ctx = ActionContext {
            query: &query,
            extracted: None,
        };

        let nav = Action::Navigate {
            url: "data:text/html,<div class=r><span class=n>Jane Doe</span>\
                  <a class=p href='https://example.com/p/1'>view</a></div>"
                .to_string(),
        };
        assert!(matches!(
            session.execute(&nav, &ctx).await.unwrap(),
            ActionResult::Completed
        ));

        let extract = Action::Extract {
            selector: ".r".to_string(),
            profile: ExtractSelectors {
                name: ".n".to_string(),
                age: None,
                addresses: None,
                relatives: None,
                profile_url: ".p".to_string(),
            },
        };
        match session.execute(&extract, &ctx).await.unwrap() {
            ActionResult::Extracted(records) => {
                assert_eq!(records.len(), 1);
                assert_eq!(records[0].full_name, "Jane Doe");
                assert_eq!(records[0].profile_url, "https://example.com/p/1");
            }
            other => panic!("unexpected result: {other:?}"),
        }

        session.finish().await.expect("finish failed");
        assert_eq!(driver.active_sessions(), 0);
    }
}
