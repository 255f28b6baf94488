//! Conversation identifiers.
//!
//! An id is `<YYYY-MM-DD>_<unix millis>`, e.g. `2026-10-19_1792368000123`.
//! Lexical order approximates creation order, and ids double as directory
//! names under the storage root.

use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;
use std::sync::atomic::{AtomicI64, Ordering};

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::StoreError;

static ID_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[0-9]{4}-[0-9]{2}-[0-9]{2}_[0-9]{13,}$").expect("valid id regex"));

/// Last millisecond handed out by this process; keeps ids strictly increasing.
static LAST_ISSUED_MS: AtomicI64 = AtomicI64::new(0);

/// Identifier shared by a conversation, its job status and its job descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ConversationId(String);

impl ConversationId {
    /// Allocate a fresh id. Never repeats within a process, even when called
    /// several times in the same millisecond.
    pub fn generate() -> Self {
        let now = Utc::now().timestamp_millis();
        let mut last = LAST_ISSUED_MS.load(Ordering::Relaxed);
        let millis = loop {
            let candidate = now.max(last + 1);
            match LAST_ISSUED_MS.compare_exchange_weak(
                last,
                candidate,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => break candidate,
                Err(actual) => last = actual,
            }
        };
        Self::from_millis(millis)
    }

    fn from_millis(millis: i64) -> Self {
        let date = DateTime::<Utc>::from_timestamp_millis(millis)
            .unwrap_or_else(Utc::now)
            .format("%Y-%m-%d");
        Self(format!("{date}_{millis:013}"))
    }

    /// Validate an externally supplied id.
    pub fn parse(raw: &str) -> Result<Self, StoreError> {
        if ID_PATTERN.is_match(raw) {
            Ok(Self(raw.to_string()))
        } else {
            Err(StoreError::InvalidIdentifier { id: raw.to_string() })
        }
    }

    /// Check whether a string has the shape of a conversation id.
    pub fn is_valid(raw: &str) -> bool {
        ID_PATTERN.is_match(raw)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConversationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for ConversationId {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for ConversationId {
    type Error = StoreError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<ConversationId> for String {
    fn from(id: ConversationId) -> Self {
        id.0
    }
}

impl AsRef<str> for ConversationId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
