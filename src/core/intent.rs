//! Engineering intents and their classification.
//!
//! An intent is the high-level request the planner decomposes. Callers that
//! already know the intent type build it directly; free text goes through
//! [`Intent::parse`], which classifies by leading verbs and keywords.
//!
//! ```
//! use taskforge::core::{Intent, IntentKind};
//!
//! assert_eq!(Intent::parse("Fix the flaky login test").kind, IntentKind::Fix);
//! assert_eq!(Intent::parse("Build a REST API for invoices").kind, IntentKind::Create);
//! assert_eq!(Intent::parse("what time is it").kind, IntentKind::Other);
//! ```

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;

static FIX_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(fix|bug|broken|crash(es|ing)?|repair|regression|failing|debug)\b").unwrap()
});

static REVIEW_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(review|audit|inspect|critique)\b").unwrap()
});

static MODIFY_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(modify|change|update|refactor|extend|improve|rename|migrate)\b").unwrap()
});

static CREATE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(create|build|implement|add|make|write|scaffold|generate|new)\b").unwrap()
});

/// Classified type of an intent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntentKind {
    Create,
    Modify,
    Fix,
    Review,
    Other,
}

impl IntentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            IntentKind::Create => "create",
            IntentKind::Modify => "modify",
            IntentKind::Fix => "fix",
            IntentKind::Review => "review",
            IntentKind::Other => "other",
        }
    }
}

impl std::str::FromStr for IntentKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "create" => Ok(IntentKind::Create),
            "modify" => Ok(IntentKind::Modify),
            "fix" => Ok(IntentKind::Fix),
            "review" => Ok(IntentKind::Review),
            "other" => Ok(IntentKind::Other),
            other => Err(format!("unknown intent kind: {}", other)),
        }
    }
}

impl std::fmt::Display for IntentKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A parsed engineering intent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Intent {
    pub kind: IntentKind,
    /// The request as the user phrased it.
    pub description: String,
}

impl Intent {
    pub fn new(kind: IntentKind, description: &str) -> Self {
        Self {
            kind,
            description: description.trim().to_string(),
        }
    }

    /// Classify free text.
    ///
    /// Fix and review signals win over create/modify verbs, so
    /// "add a fix for the crash" is a fix and "review the new module" a review.
    pub fn parse(text: &str) -> Self {
        let kind = if FIX_RE.is_match(text) {
            IntentKind::Fix
        } else if REVIEW_RE.is_match(text) {
            IntentKind::Review
        } else if MODIFY_RE.is_match(text) {
            IntentKind::Modify
        } else if CREATE_RE.is_match(text) {
            IntentKind::Create
        } else {
            IntentKind::Other
        };
        Self::new(kind, text)
    }
}
