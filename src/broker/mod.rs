//! Broker definitions and the profile data model.
//!
//! A broker is a people-search site described declaratively: a version, a
//! scan script and an opt-out script, each an ordered list of [`Action`]s.
//! Scripts arrive as JSON and decode into a closed tagged union — there is
//! no stringly-typed dispatch anywhere downstream.

pub mod registry;
pub mod updater;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// A versioned, declarative broker definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataBroker {
    /// Row id once persisted.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub id: Option<i64>,
    /// Display name (e.g. "Example People Search").
    pub name: String,
    /// Site identity. Brokers are keyed by URL, not by name.
    pub url: String,
    /// Dotted-numeric definition version ("1.10" > "1.2").
    pub version: String,
    /// Parent broker URL for mirror sites that share an opt-out flow.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub parent: Option<String>,
    /// Scan and opt-out scripts.
    pub steps: Vec<BrokerStep>,
}

impl DataBroker {
    /// Whether this broker is a parent (standalone) definition.
    ///
    /// Child brokers are mirrors whose removals ride on the parent's
    /// opt-out flow; their attempt counts are managed via the parent.
    pub fn is_parent(&self) -> bool {
        self.parent.is_none()
    }

    /// The scan script, if the definition carries one.
    pub fn scan_actions(&self) -> Option<&[Action]> {
        self.steps
            .iter()
            .find(|s| s.step_type == StepType::Scan)
            .map(|s| s.actions.as_slice())
    }

    /// The opt-out script, if the definition carries one.
    pub fn opt_out_actions(&self) -> Option<&[Action]> {
        self.steps
            .iter()
            .find(|s| s.step_type == StepType::OptOut)
            .map(|s| s.actions.as_slice())
    }
}

/// One script inside a broker definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerStep {
    #[serde(rename = "stepType")]
    pub step_type: StepType,
    pub actions: Vec<Action>,
}

/// Which flow a step belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum StepType {
    Scan,
    OptOut,
}

/// One atomic automation step in a broker script.
///
/// Templates inside URLs and field values use `${placeholder}` syntax and
/// are substituted from the profile query (and, during opt-out, from the
/// extracted profile) via [`substitute_templates`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "actionType", rename_all = "camelCase")]
pub enum Action {
    /// Load a page. The URL is a template.
    Navigate { url: String },
    /// Click an element.
    Click { selector: String },
    /// Fill a set of form fields. Values are templates.
    FillForm { fields: Vec<FormField> },
    /// Collect profile matches from the current page.
    Extract {
        /// Selector matching one element per listed profile.
        selector: String,
        /// Sub-selectors for the fields of each match.
        profile: ExtractSelectors,
    },
    /// Hand the page's captcha to the external solving service.
    SolveCaptcha { selector: String },
    /// Wait for a confirmation email and follow its link.
    EmailConfirmation {
        #[serde(rename = "pollingSeconds")]
        polling_seconds: u64,
    },
    /// Assert that the page still matches the script's expectations.
    Expectation {
        selector: String,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        expect: Option<String>,
    },
    /// Pause for slow sites that render results asynchronously.
    Wait { seconds: u64 },
}

impl Action {
    /// Short tag for logging and history events.
    pub fn kind(&self) -> &'static str {
        match self {
            Action::Navigate { .. } => "navigate",
            Action::Click { .. } => "click",
            Action::FillForm { .. } => "fillForm",
            Action::Extract { .. } => "extract",
            Action::SolveCaptcha { .. } => "solveCaptcha",
            Action::EmailConfirmation { .. } => "emailConfirmation",
            Action::Expectation { .. } => "expectation",
            Action::Wait { .. } => "wait",
        }
    }

    /// Whether this action needs a generated email address before it runs.
    pub fn needs_email(&self) -> bool {
        match self {
            Action::FillForm { fields } => fields.iter().any(|f| f.value.contains("${email}")),
            _ => false,
        }
    }
}

/// One field inside a fill-form action.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FormField {
    pub selector: String,
    /// Value template, e.g. `"${firstName} ${lastName}"`.
    pub value: String,
}

/// Sub-selectors used by an extract action, relative to each match element.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtractSelectors {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub age: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub addresses: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub relatives: Option<String>,
    pub profile_url: String,
}

/// One search permutation of the user's profile.
///
/// Queries are created once per profile generation and never mutated; a
/// query that disappears from the profile but still owns matches is marked
/// deprecated rather than deleted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfileQuery {
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub id: Option<i64>,
    pub first_name: String,
    pub last_name: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub middle_name: Option<String>,
    pub city: String,
    pub state: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub birth_year: Option<i32>,
    #[serde(default)]
    pub deprecated: bool,
}

impl ProfileQuery {
    pub fn new(first_name: &str, last_name: &str, city: &str, state: &str) -> Self {
        Self {
            id: None,
            first_name: first_name.to_string(),
            last_name: last_name.to_string(),
            middle_name: None,
            city: city.to_string(),
            state: state.to_string(),
            birth_year: None,
            deprecated: false,
        }
    }
}

/// A specific match found on a broker site.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractedProfileRecord {
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub broker_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub profile_query_id: Option<i64>,
    /// The broker's own URL for this listing. Identity of the match.
    pub profile_url: String,
    pub full_name: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub age: Option<String>,
    #[serde(default)]
    pub addresses: Vec<String>,
    #[serde(default)]
    pub relatives: Vec<String>,
    /// Generated address used for this profile's opt-out confirmation.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub email: Option<String>,
    /// Terminal once set: the listing is gone from the site.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub removed_date: Option<DateTime<Utc>>,
}

/// Compare two dotted-numeric version strings segment-wise.
///
/// Missing segments count as zero, so "1.2" == "1.2.0". Non-numeric
/// segments compare as zero rather than erroring — a malformed bundled
/// version should never wedge the updater.
pub fn compare_versions(a: &str, b: &str) -> Ordering {
    let parse = |v: &str| -> Vec<u64> {
        v.split('.')
            .map(|seg| seg.trim().parse::<u64>().unwrap_or(0))
            .collect()
    };
    let (va, vb) = (parse(a), parse(b));
    let len = va.len().max(vb.len());
    for i in 0..len {
        let x = va.get(i).copied().unwrap_or(0);
        let y = vb.get(i).copied().unwrap_or(0);
        match x.cmp(&y) {
            Ordering::Equal => continue,
            other => return other,
        }
    }
    Ordering::Equal
}

/// Substitute `${placeholder}` templates from a profile query.
///
/// Known placeholders: firstName, lastName, middleName, city, state,
/// birthYear, plus profileUrl and email when an extracted profile is in
/// scope (opt-out runs). Unknown placeholders are left intact so a site
/// change shows up verbatim in logs instead of as an empty string.
pub fn substitute_templates(
    template: &str,
    query: &ProfileQuery,
    extracted: Option<&ExtractedProfileRecord>,
) -> String {
    let mut out = template.to_string();
    let pairs: Vec<(&str, String)> = vec![
        ("${firstName}", query.first_name.clone()),
        ("${lastName}", query.last_name.clone()),
        ("${middleName}", query.middle_name.clone().unwrap_or_default()),
        ("${city}", query.city.clone()),
        ("${state}", query.state.clone()),
        (
            "${birthYear}",
            query.birth_year.map(|y| y.to_string()).unwrap_or_default(),
        ),
    ];
    for (key, value) in pairs {
        out = out.replace(key, &value);
    }
    if let Some(profile) = extracted {
        out = out.replace("${profileUrl}", &profile.profile_url);
        out = out.replace("${fullName}", &profile.full_name);
        if let Some(email) = &profile.email {
            out = out.replace("${email}", email);
        }
    }
    out
}
