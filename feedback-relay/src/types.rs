//! Value types exchanged between the orchestrator and the executor

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

// "/tasks/" followed by the numeric id and a hyphen
static TASK_ID_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"/tasks/(\d+)-").expect("valid regex"));
// "/tasks/" followed by one path segment: no slash, question mark or whitespace
static TASK_SLUG_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"/tasks/([^/?\s]+)").expect("valid regex"));

pub fn extract_task_id(url: &str) -> Option<String> {
    TASK_ID_RE
        .captures(url)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
}

pub fn extract_task_slug(url: &str) -> Option<String> {
    TASK_SLUG_RE
        .captures(url)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskIdentity {
    /// Numeric string taken from the task URL.
    pub id: String,
    /// Full path segment of the task URL.
    pub slug: String,
}

impl TaskIdentity {
    pub fn from_url(url: &str) -> Option<Self> {
        Some(Self {
            id: extract_task_id(url)?,
            slug: extract_task_slug(url)?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Ratings {
    pub average: f64,
    pub exceptional: u32,
    pub meets_expectations: u32,
    pub some_issues: u32,
    pub major_issues: u32,
}

impl Ratings {
    pub fn review_count(&self) -> u64 {
        [
            self.exceptional,
            self.meets_expectations,
            self.some_issues,
            self.major_issues,
        ]
        .into_iter()
        .map(u64::from)
        .sum()
    }
}

/// Cheap summary shown on the task page, sent as `[averageRating, reviewCount]`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RatingsPreview(pub f64, pub u32);

impl RatingsPreview {
    pub fn average(&self) -> f64 {
        self.0
    }

    pub fn review_count(&self) -> u32 {
        self.1
    }

    /// The preview describes the same ratings when both average and count agree.
    pub fn matches(&self, ratings: &Ratings) -> bool {
        ratings.average == self.average()
            && ratings.review_count() == u64::from(self.review_count())
    }
}

/// Persisted form of the ratings cache: `[Ratings, savedTimeMillis]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedRatings(pub Ratings, pub String);
