//! Strongly-typed identifiers used across the job dispatch services.

use core::str::FromStr;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{CoreError, CoreResult};

/// Prefix carried by every identifier minted by the fallback queue.
pub const FALLBACK_PREFIX: &str = "fallback-";

const FALLBACK_SUFFIX_LEN: usize = 7;
const BASE36: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";

/// Which queue minted an identifier.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobNamespace {
    Primary,
    Fallback,
}

/// Opaque job identifier.
///
/// Primary IDs are UUIDv7 strings. Fallback IDs look like
/// `fallback-<unix millis>-<7 base36 chars>` so that they never collide with
/// primary IDs and can be minted without coordination.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    /// Mint a primary-namespace identifier.
    pub fn primary() -> Self {
        Self(Uuid::now_v7().to_string())
    }

    /// Mint a fallback-namespace identifier.
    pub fn fallback() -> Self {
        let millis = Utc::now().timestamp_millis();
        Self(format!("{FALLBACK_PREFIX}{millis}-{}", random_suffix()))
    }

    pub fn namespace(&self) -> JobNamespace {
        if self.0.starts_with(FALLBACK_PREFIX) {
            JobNamespace::Fallback
        } else {
            JobNamespace::Primary
        }
    }

    pub fn is_fallback(&self) -> bool {
        self.namespace() == JobNamespace::Fallback
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

fn random_suffix() -> String {
    let (mut bits, _) = Uuid::new_v4().as_u64_pair();
    let mut out = String::with_capacity(FALLBACK_SUFFIX_LEN);
    for _ in 0..FALLBACK_SUFFIX_LEN {
        out.push(BASE36[(bits % 36) as usize] as char);
        bits /= 36;
    }
    out
}

impl core::fmt::Display for JobId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for JobId {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(CoreError::invalid_id("JobId: empty"));
        }
        if s.chars().any(|c| c.is_whitespace() || c.is_control()) {
            return Err(CoreError::invalid_id(format!("JobId: unexpected character in {s:?}")));
        }
        Ok(Self(s.to_string()))
    }
}

impl AsRef<str> for JobId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Name of the operation a job asks a handler to run (e.g. `createCustomer`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct JobName(String);

impl JobName {
    pub const MAX_LEN: usize = 128;

    pub fn new(name: impl Into<String>) -> CoreResult<Self> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(CoreError::validation("job name must not be empty"));
        }
        if name.trim() != name {
            return Err(CoreError::validation(
                "job name must not start or end with whitespace",
            ));
        }
        if name.len() > Self::MAX_LEN {
            return Err(CoreError::validation(format!(
                "job name must be at most {} bytes",
                Self::MAX_LEN
            )));
        }
        if name.chars().any(char::is_control) {
            return Err(CoreError::validation("job name must not contain control characters"));
        }
        Ok(Self(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl core::fmt::Display for JobName {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for JobName {
    type Error = CoreError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<JobName> for String {
    fn from(value: JobName) -> Self {
        value.0
    }
}
