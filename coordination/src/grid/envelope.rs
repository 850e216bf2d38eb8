//! PSI wire envelope: `§PSI:{target}:{source}:{type}:{content}`

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{CoordinationError, CoordinationResult};

/// Frame prefix every envelope starts with
pub const PSI_PREFIX: &str = "§PSI:";

/// A message addressed to one grid endpoint.
///
/// Only the first four `:` separate fields; the content keeps any further
/// colons verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Psi {
    pub target: String,
    pub source: String,
    #[serde(rename = "type")]
    pub msg_type: String,
    pub content: String,
}

impl Psi {
    pub fn new(
        target: impl Into<String>,
        source: impl Into<String>,
        msg_type: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            target: target.into(),
            source: source.into(),
            msg_type: msg_type.into(),
            content: content.into(),
        }
    }

    pub fn parse(raw: &str) -> CoordinationResult<Self> {
        let rest = raw
            .strip_prefix(PSI_PREFIX)
            .ok_or_else(|| malformed(raw, "missing §PSI prefix"))?;

        let mut parts = rest.splitn(4, ':');
        let (Some(target), Some(source), Some(msg_type), Some(content)) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(malformed(raw, "expected target:source:type:content"));
        };
        if target.is_empty() {
            return Err(malformed(raw, "empty target"));
        }

        Ok(Self::new(target, source, msg_type, content))
    }

    /// Wire form of this envelope
    pub fn serialize(&self) -> String {
        self.to_string()
    }
}

fn malformed(raw: &str, reason: &str) -> CoordinationError {
    let preview: String = raw.chars().take(64).collect();
    CoordinationError::MalformedEnvelope(format!("{reason}: {preview:?}"))
}

impl fmt::Display for Psi {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{}:{}:{}:{}",
            PSI_PREFIX, self.target, self.source, self.msg_type, self.content
        )
    }
}

impl FromStr for Psi {
    type Err = CoordinationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}
