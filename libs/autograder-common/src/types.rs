use crate::analysis::AssignmentAnalysisOptions;
use crate::error::AutograderError;
use crate::ids::FullSubmissionId;
use crate::timestamp::Timestamp;
use anyhow::{bail, Result};
use base64::{engine::general_purpose, Engine as _};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;

/// Key embedded in every JSON document this system posts as an LMS comment.
pub const AUTOGRADER_COMMENT_IDENTITY_KEY: &str = "__autograder__version__";
/// Older scoring comments carried this key instead.
pub const AUTOGRADER_COMMENT_LEGACY_KEY: &str = "__autograder__v01__";
/// Case-insensitive marker that freezes a student's LMS grade.
pub const LOCK_COMMENT: &str = "__lock__";

pub const SCORING_INFO_STRUCT_VERSION: &str = "1.0.0";
pub const LATE_DAYS_STRUCT_VERSION: &str = "1.0.0";

/// Does this comment text look like one of ours? Case-insensitive.
pub fn is_autograder_comment(text: &str) -> bool {
    let text = text.to_lowercase();
    text.contains(AUTOGRADER_COMMENT_IDENTITY_KEY) || text.contains(AUTOGRADER_COMMENT_LEGACY_KEY)
}

pub fn is_lock_comment(text: &str) -> bool {
    text.to_lowercase().contains(LOCK_COMMENT)
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CourseRole {
    #[default]
    Unknown,
    Other,
    Student,
    Grader,
    Admin,
    Owner,
}

impl fmt::Display for CourseRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CourseRole::Unknown => "unknown",
            CourseRole::Other => "other",
            CourseRole::Student => "student",
            CourseRole::Grader => "grader",
            CourseRole::Admin => "admin",
            CourseRole::Owner => "owner",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct CourseUser {
    pub email: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub role: CourseRole,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lms_id: Option<String>,
}

impl CourseUser {
    pub fn lms_id(&self) -> &str {
        self.lms_id.as_deref().unwrap_or("")
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Course {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub late_policy: Option<LateGradingPolicy>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Assignment {
    pub id: String,
    pub course_id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lms_id: Option<String>,
    #[serde(default)]
    pub max_points: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub late_policy: Option<LateGradingPolicy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub analysis_options: Option<AssignmentAnalysisOptions>,
    /// Directory that relative static/template FileSpecs resolve against.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub source_dir: String,
}

impl Assignment {
    pub fn lms_id(&self) -> &str {
        self.lms_id.as_deref().unwrap_or("")
    }

    /// The assignment policy, falling back to the course policy.
    pub fn effective_late_policy(&self, course: &Course) -> LateGradingPolicy {
        self.late_policy
            .clone()
            .or_else(|| course.late_policy.clone())
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct GradedQuestion {
    pub name: String,
    pub max_points: f64,
    pub score: f64,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
}

/// Summary of a single graded submission.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct GradingInfo {
    pub id: String,
    pub short_id: String,
    pub course_id: String,
    pub assignment_id: String,
    pub user: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
    pub max_points: f64,
    pub score: f64,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub questions: Vec<GradedQuestion>,
    pub grading_start_time: Timestamp,
    pub grading_end_time: Timestamp,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub additional_info: BTreeMap<String, serde_json::Value>,
}

impl GradingInfo {
    pub fn full_id(&self) -> FullSubmissionId {
        FullSubmissionId::new(&self.course_id, &self.assignment_id, &self.user, &self.short_id)
    }

    pub fn to_scoring_info(&self) -> ScoringInfo {
        ScoringInfo {
            id: self.id.clone(),
            submission_time: self.grading_start_time,
            raw_score: self.score,
            ..ScoringInfo::default()
        }
    }
}

/// A full grading artifact. File maps are relative path to gzipped bytes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct GradingResult {
    pub info: GradingInfo,
    #[serde(default, with = "gzip_map_base64")]
    pub input_files_gzip: BTreeMap<String, Vec<u8>>,
    #[serde(default, with = "gzip_map_base64")]
    pub output_files_gzip: BTreeMap<String, Vec<u8>>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub stdout: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub stderr: String,
}

// Binary payloads travel as base64 strings in JSON.
mod gzip_map_base64 {
    use super::*;
    use serde::{Deserializer, Serializer};

    pub fn serialize<S: Serializer>(map: &BTreeMap<String, Vec<u8>>, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let encoded: BTreeMap<&String, String> = map
            .iter()
            .map(|(path, bytes)| (path, general_purpose::STANDARD.encode(bytes)))
            .collect();
        encoded.serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<BTreeMap<String, Vec<u8>>, D::Error> {
        let encoded = BTreeMap::<String, String>::deserialize(deserializer)?;
        encoded
            .into_iter()
            .map(|(path, text)| {
                general_purpose::STANDARD
                    .decode(text.as_bytes())
                    .map(|bytes| (path, bytes))
                    .map_err(serde::de::Error::custom)
            })
            .collect()
    }
}

/// Per-student scoring state, serialized verbatim into LMS comments.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ScoringInfo {
    pub id: String,
    pub submission_time: Timestamp,
    pub upload_time: Timestamp,
    pub raw_score: f64,
    pub score: f64,
    #[serde(default)]
    pub lock: bool,
    #[serde(default)]
    pub late_day_usage: i64,
    #[serde(default)]
    pub num_days_late: i64,
    #[serde(default)]
    pub reject: bool,
    #[serde(rename = "__autograder__version__", alias = "__autograder__v01__", default)]
    pub autograder_struct_version: String,

    #[serde(skip)]
    pub lms_comment_id: String,
    #[serde(skip)]
    pub lms_comment_author_id: String,
}

impl ScoringInfo {
    pub fn new_versioned(self) -> Self {
        ScoringInfo {
            autograder_struct_version: SCORING_INFO_STRUCT_VERSION.to_string(),
            ..self
        }
    }

    /// Value equality over the scoring content. Upload time and LMS bookkeeping are ignored.
    pub fn same_scoring(&self, other: &ScoringInfo) -> bool {
        self.id == other.id
            && self.submission_time == other.submission_time
            && self.raw_score == other.raw_score
            && self.score == other.score
            && self.lock == other.lock
            && self.late_day_usage == other.late_day_usage
            && self.num_days_late == other.num_days_late
            && self.reject == other.reject
            && self.autograder_struct_version == other.autograder_struct_version
    }
}

/// A student's late-day ledger as stored on the dedicated LMS assignment.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct LateDaysInfo {
    pub available_days: i64,
    pub upload_time: Timestamp,
    #[serde(default)]
    pub allocated_days: BTreeMap<String, i64>,
    #[serde(rename = "__autograder__version__", default)]
    pub autograder_struct_version: String,

    #[serde(skip)]
    pub lms_comment_id: String,
    #[serde(skip)]
    pub lms_comment_author_id: String,
}

impl LateDaysInfo {
    /// Available plus allocated; constant across scoring runs.
    pub fn total_days(&self) -> i64 {
        self.available_days + self.allocated_days.values().sum::<i64>()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LatePolicyType {
    #[default]
    #[serde(rename = "")]
    Empty,
    Baseline,
    ConstantPenalty,
    PercentagePenalty,
    LateDays,
}

impl fmt::Display for LatePolicyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LatePolicyType::Empty => "",
            LatePolicyType::Baseline => "baseline",
            LatePolicyType::ConstantPenalty => "constant-penalty",
            LatePolicyType::PercentagePenalty => "percentage-penalty",
            LatePolicyType::LateDays => "late-days",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct LateGradingPolicy {
    #[serde(rename = "type", default)]
    pub policy_type: LatePolicyType,
    #[serde(default, skip_serializing_if = "is_zero_f64")]
    pub penalty: f64,
    #[serde(default, skip_serializing_if = "is_zero_i64")]
    pub reject_after_days: i64,
    #[serde(rename = "grace-mins", default, skip_serializing_if = "is_zero_i64")]
    pub grace_minutes: i64,

    #[serde(default, skip_serializing_if = "is_zero_i64")]
    pub max_late_days: i64,
    #[serde(rename = "late-days-lms-id", default, skip_serializing_if = "String::is_empty")]
    pub late_days_lms_id: String,
    #[serde(rename = "late-days-lms-name", default, skip_serializing_if = "String::is_empty")]
    pub late_days_lms_name: String,
}

fn is_zero_f64(value: &f64) -> bool {
    *value == 0.0
}

fn is_zero_i64(value: &i64) -> bool {
    *value == 0
}

impl LateGradingPolicy {
    pub fn validate(&self) -> Result<()> {
        let invalid = |message: String| -> Result<()> { Err(AutograderError::Validation(message).into()) };

        if self.reject_after_days < 0 {
            return invalid(format!(
                "Number of days for rejection is negative ({}), should be zero to be ignored or positive to be applied",
                self.reject_after_days
            ));
        }

        if self.grace_minutes < 0 {
            return invalid(format!(
                "Grace time in minutes is negative ({}), should be zero to be ignored or positive to be applied",
                self.grace_minutes
            ));
        }

        match self.policy_type {
            LatePolicyType::Empty | LatePolicyType::Baseline => Ok(()),
            LatePolicyType::ConstantPenalty => {
                if self.penalty <= 0.0 {
                    return invalid(format!(
                        "Policy '{}': penalty must be larger than zero, found '{}'",
                        self.policy_type, self.penalty
                    ));
                }
                Ok(())
            }
            LatePolicyType::PercentagePenalty => self.validate_fraction_penalty(),
            LatePolicyType::LateDays => {
                self.validate_fraction_penalty()?;

                if self.max_late_days < 1 {
                    return invalid(format!(
                        "Policy '{}': max late days must be at least 1, found '{}'",
                        self.policy_type, self.max_late_days
                    ));
                }

                if self.reject_after_days > 0 && self.max_late_days > self.reject_after_days {
                    return invalid(format!(
                        "Policy '{}': max late days must be in [1, <reject days>({})], found '{}'",
                        self.policy_type, self.reject_after_days, self.max_late_days
                    ));
                }

                if self.late_days_lms_id.is_empty() && self.late_days_lms_name.is_empty() {
                    return invalid(format!(
                        "Policy '{}': Both LMS ID and name for late days assignment cannot be empty",
                        self.policy_type
                    ));
                }

                Ok(())
            }
        }
    }

    fn validate_fraction_penalty(&self) -> Result<()> {
        if self.penalty <= 0.0 || self.penalty > 1.0 {
            bail!(AutograderError::Validation(format!(
                "Policy '{}': penalty must be in (0.0, 1.0], found '{}'",
                self.policy_type, self.penalty
            )));
        }

        Ok(())
    }
}

/// Users keyed by email.
pub type UserMap = HashMap<String, CourseUser>;
