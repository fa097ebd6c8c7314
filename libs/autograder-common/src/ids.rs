// Identifier grammar for courses, assignments, submissions, and submission pairs.
use crate::error::AutograderError;
use anyhow::Result;
use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

pub const SUBMISSION_ID_DELIM: &str = "::";
pub const PAIRWISE_KEY_DELIM: &str = "||";

fn id_regex() -> &'static Regex {
    static REGEX: OnceLock<Regex> = OnceLock::new();
    REGEX.get_or_init(|| Regex::new(r"^[a-z0-9]([a-z0-9._-]*[a-z0-9])?$").unwrap())
}

/// Normalize (trim + lowercase) and check a course or assignment ID.
/// IDs are `[a-z0-9._-]+` and must start and end with an alphanumeric character.
pub fn validate_id(id: &str) -> Result<String> {
    let id = id.trim().to_lowercase();

    if id.is_empty() {
        return Err(AutograderError::validation("IDs cannot be empty").into());
    }

    if !id_regex().is_match(&id) {
        return Err(AutograderError::validation(format!(
            "IDs must only have letters, digits, and single sequences of periods, underscores, and hyphens, and cannot start or end with punctuation, found '{}'",
            id
        ))
        .into());
    }

    Ok(id)
}

/// Short IDs are one or more ASCII digits.
pub fn is_valid_short_id(short_id: &str) -> bool {
    !short_id.is_empty() && short_id.bytes().all(|b| b.is_ascii_digit())
}

/// Canonical `<course>::<assignment>::<email>::<short id>` submission identifier.
/// Ordering is lexicographic over the joined string.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FullSubmissionId(String);

impl FullSubmissionId {
    pub fn new(course_id: &str, assignment_id: &str, email: &str, short_id: &str) -> Self {
        FullSubmissionId(
            [course_id, assignment_id, email, short_id].join(SUBMISSION_ID_DELIM),
        )
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn parts(&self) -> Vec<&str> {
        self.0.split(SUBMISSION_ID_DELIM).collect()
    }

    pub fn course_id(&self) -> &str {
        self.parts()[0]
    }

    pub fn assignment_id(&self) -> &str {
        self.parts()[1]
    }

    pub fn user_email(&self) -> &str {
        self.parts()[2]
    }

    pub fn short_id(&self) -> &str {
        self.parts()[3]
    }
}

impl Default for FullSubmissionId {
    fn default() -> Self {
        FullSubmissionId::new("", "", "", "0")
    }
}

impl FromStr for FullSubmissionId {
    type Err = anyhow::Error;

    fn from_str(text: &str) -> Result<Self> {
        let parts: Vec<&str> = text.split(SUBMISSION_ID_DELIM).collect();
        if parts.len() != 4 {
            return Err(AutograderError::validation(format!(
                "Malformed full submission ID '{}'. Expected 4 components, found {}",
                text,
                parts.len()
            ))
            .into());
        }

        if parts.iter().any(|part| part.is_empty()) {
            return Err(AutograderError::validation(format!(
                "Malformed full submission ID '{}'. Components cannot be empty",
                text
            ))
            .into());
        }

        if !is_valid_short_id(parts[3]) {
            return Err(AutograderError::validation(format!(
                "Malformed full submission ID '{}'. Short ID must be digits",
                text
            ))
            .into());
        }

        Ok(FullSubmissionId(text.to_string()))
    }
}

impl fmt::Display for FullSubmissionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Serialize for FullSubmissionId {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for FullSubmissionId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        text.parse().map_err(serde::de::Error::custom)
    }
}

/// The short (trailing) component of either a full or a short submission ID.
pub fn short_submission_id(submission_id: &str) -> &str {
    submission_id
        .rsplit(SUBMISSION_ID_DELIM)
        .next()
        .unwrap_or(submission_id)
}

/// Lexicographically ordered pair of submissions; the primary key of a pairwise analysis.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PairwiseKey([FullSubmissionId; 2]);

impl PairwiseKey {
    pub fn new(a: FullSubmissionId, b: FullSubmissionId) -> Self {
        if a <= b {
            PairwiseKey([a, b])
        } else {
            PairwiseKey([b, a])
        }
    }

    pub fn first(&self) -> &FullSubmissionId {
        &self.0[0]
    }

    pub fn second(&self) -> &FullSubmissionId {
        &self.0[1]
    }

    pub fn ids(&self) -> &[FullSubmissionId; 2] {
        &self.0
    }

    /// The representative course of the pair.
    pub fn course_id(&self) -> &str {
        self.0[0].course_id()
    }
}

impl fmt::Display for PairwiseKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{}", self.0[0], PAIRWISE_KEY_DELIM, self.0[1])
    }
}

impl FromStr for PairwiseKey {
    type Err = anyhow::Error;

    fn from_str(text: &str) -> Result<Self> {
        let parts: Vec<&str> = text.split(PAIRWISE_KEY_DELIM).collect();
        if parts.len() != 2 {
            return Err(AutograderError::validation(format!("Invalid pairwise key: '{}'", text)).into());
        }

        Ok(PairwiseKey::new(parts[0].parse()?, parts[1].parse()?))
    }
}

// Serialized as the two-element array form `["a", "b"]`.
impl Serialize for PairwiseKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        self.0.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for PairwiseKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let [a, b] = <[FullSubmissionId; 2]>::deserialize(deserializer)?;
        Ok(PairwiseKey::new(a, b))
    }
}

/// Every unordered pair of distinct IDs, each ordered, in sorted order.
pub fn create_pairwise_keys(ids: &[FullSubmissionId]) -> Vec<PairwiseKey> {
    let mut ids = ids.to_vec();
    ids.sort();
    ids.dedup();

    let mut keys = Vec::with_capacity(ids.len() * ids.len().saturating_sub(1) / 2);
    for i in 0..ids.len() {
        for j in (i + 1)..ids.len() {
            keys.push(PairwiseKey::new(ids[i].clone(), ids[j].clone()));
        }
    }

    keys
}
