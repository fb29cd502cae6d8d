//! Job-name grammar and the derived names of every managed resource.

use thiserror::Error;

use crate::error::ValidationError;

/// Upper bound shared by job names and Kubernetes DNS labels.
pub const MAX_NAME_LENGTH: usize = 63;

const ENDPOINT_SUFFIX: &str = "-svc";
const ROUTING_RULE_SUFFIX: &str = "-ingress";
const RECORD_PREFIX: &str = "cloudops-job-";
const ENDPOINT_LETTER_PREFIX: &str = "svc-";
const HASH_LENGTH: usize = 8;

/// Why a job name was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum JobNameError {
    #[error("name must not be empty")]
    Empty,

    #[error("name must be at most {MAX_NAME_LENGTH} characters (got {0})")]
    TooLong(usize),

    #[error("name must be lowercase; found '{0}'")]
    UppercasePresent(char),

    #[error("name must not contain underscores; use '-' instead")]
    UnderscorePresent,

    #[error("name contains '{0}'; only a-z, 0-9 and '-' are allowed")]
    InvalidCharacter(char),

    #[error("name must not start with '-'")]
    LeadingHyphen,

    #[error("name must not end with '-'")]
    TrailingHyphen,
}

impl JobNameError {
    /// Stable machine-readable reason.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            JobNameError::Empty => "empty",
            JobNameError::TooLong(_) => "too-long",
            JobNameError::UppercasePresent(_) => "uppercase-present",
            JobNameError::UnderscorePresent => "underscore-present",
            JobNameError::InvalidCharacter(_) => "invalid-character",
            JobNameError::LeadingHyphen => "leading-hyphen",
            JobNameError::TrailingHyphen => "trailing-hyphen",
        }
    }
}

/// Validates names against `^[a-z0-9]([-a-z0-9]*[a-z0-9])?$`, at most 63 characters.
///
/// The first failing check wins, in this order: empty, length, uppercase,
/// underscore, other characters, leading hyphen, trailing hyphen. So
/// `My-App` reports uppercase and `-app` reports the leading hyphen.
pub struct JobNameValidator;

impl JobNameValidator {
    pub fn reason(name: &str) -> Option<JobNameError> {
        if name.is_empty() {
            return Some(JobNameError::Empty);
        }

        let length = name.chars().count();
        if length > MAX_NAME_LENGTH {
            return Some(JobNameError::TooLong(length));
        }

        if let Some(upper) = name.chars().find(char::is_ascii_uppercase) {
            return Some(JobNameError::UppercasePresent(upper));
        }

        if name.contains('_') {
            return Some(JobNameError::UnderscorePresent);
        }

        if let Some(bad) = name
            .chars()
            .find(|c| !(c.is_ascii_lowercase() || c.is_ascii_digit() || *c == '-'))
        {
            return Some(JobNameError::InvalidCharacter(bad));
        }

        if name.starts_with('-') {
            return Some(JobNameError::LeadingHyphen);
        }

        if name.ends_with('-') {
            return Some(JobNameError::TrailingHyphen);
        }

        None
    }

    #[must_use]
    pub fn is_valid(name: &str) -> bool {
        Self::reason(name).is_none()
    }

    pub fn check(name: &str) -> Result<(), ValidationError> {
        Self::check_field(name, "job name")
    }

    /// Same grammar, reported against another field (credential names).
    pub fn check_field(name: &str, field: &'static str) -> Result<(), ValidationError> {
        match Self::reason(name) {
            None => Ok(()),
            Some(reason) => Err(ValidationError::Name {
                field,
                name: name.to_string(),
                reason,
            }),
        }
    }
}

/// Names of the resources derived from one job.
///
/// Every name fits a DNS label. Long job names are cut and given a stable
/// hash suffix so two long names sharing a prefix stay distinct.
pub struct ResourceNaming;

impl ResourceNaming {
    /// The workload carries the job name unchanged.
    #[must_use]
    pub fn workload_name(job_name: &str) -> String {
        job_name.to_string()
    }

    /// Service names must start with a letter (RFC 1035).
    #[must_use]
    pub fn endpoint_name(job_name: &str) -> String {
        let base = if job_name.starts_with(|c: char| c.is_ascii_lowercase()) {
            job_name.to_string()
        } else {
            format!("{ENDPOINT_LETTER_PREFIX}{job_name}")
        };
        Self::with_suffix(&base, ENDPOINT_SUFFIX)
    }

    #[must_use]
    pub fn routing_rule_name(job_name: &str) -> String {
        Self::with_suffix(job_name, ROUTING_RULE_SUFFIX)
    }

    /// `ConfigMap` holding the persisted job record.
    #[must_use]
    pub fn record_name(job_name: &str) -> String {
        let base = format!("{RECORD_PREFIX}{job_name}");
        Self::ensure_length(&base, MAX_NAME_LENGTH)
    }

    fn with_suffix(base: &str, suffix: &str) -> String {
        if base.len() + suffix.len() <= MAX_NAME_LENGTH {
            return format!("{base}{suffix}");
        }
        let shortened = Self::ensure_length(base, MAX_NAME_LENGTH - suffix.len());
        format!("{shortened}{suffix}")
    }

    fn ensure_length(name: &str, max: usize) -> String {
        if name.len() <= max {
            return name.to_string();
        }
        let hash = Self::hash_string(name);
        let keep = max.saturating_sub(HASH_LENGTH + 1);
        let head = name[..keep].trim_end_matches('-');
        format!("{head}-{hash}")
    }

    /// FNV-1a; the suffix must not change between releases.
    fn hash_string(input: &str) -> String {
        let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
        for byte in input.bytes() {
            hash ^= u64::from(byte);
            hash = hash.wrapping_mul(0x0100_0000_01b3);
        }
        format!("{hash:016x}")[..HASH_LENGTH].to_string()
    }
}
