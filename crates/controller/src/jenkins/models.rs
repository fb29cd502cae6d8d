//! Jenkins JSON API payloads.

use chrono::{DateTime, TimeZone, Utc};
use serde::Deserialize;

use crate::model::{BuildRecord, BuildSnapshot, BuildStatus};

/// `tree` filter for job listings.
pub(crate) const JOB_LIST_TREE: &str =
    "jobs[name,url,description,inQueue,lastBuild[number,result,building,timestamp,duration]]";

/// `tree` filter for a single job.
pub(crate) const JOB_TREE: &str =
    "name,url,description,inQueue,lastBuild[number,result,building,timestamp,duration]";

/// `tree` filter for build history.
pub(crate) const BUILDS_TREE: &str = "builds[number,result,building,timestamp,duration]";

#[derive(Debug, Deserialize)]
pub(crate) struct JenkinsJobList {
    #[serde(default)]
    pub jobs: Vec<JenkinsJob>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct JenkinsJob {
    pub name: String,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub in_queue: bool,
    #[serde(default)]
    pub last_build: Option<JenkinsBuild>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct JenkinsBuildList {
    #[serde(default)]
    pub builds: Vec<JenkinsBuild>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct JenkinsBuild {
    pub number: u64,
    #[serde(default)]
    pub result: Option<String>,
    #[serde(default)]
    pub building: bool,
    /// Start time, epoch milliseconds
    #[serde(default)]
    pub timestamp: Option<i64>,
    #[serde(default)]
    pub duration: Option<u64>,
}

/// Map a Jenkins result onto the normalized status vocabulary.
///
/// `UNSTABLE` (tests failed, artifacts built) counts as a failure. `NOT_BUILT`
/// and unrecognized results are unknown.
#[must_use]
pub fn normalize_status(result: Option<&str>, building: bool) -> BuildStatus {
    if building {
        return BuildStatus::InProgress;
    }
    match result {
        Some("SUCCESS") => BuildStatus::Success,
        Some("FAILURE" | "UNSTABLE") => BuildStatus::Failure,
        Some("ABORTED") => BuildStatus::Aborted,
        _ => BuildStatus::Unknown,
    }
}

impl JenkinsBuild {
    pub(crate) fn status(&self) -> BuildStatus {
        normalize_status(self.result.as_deref(), self.building)
    }

    pub(crate) fn into_record(self, job_id: &str) -> BuildRecord {
        let status = self.status();
        BuildRecord {
            job_id: job_id.to_string(),
            number: self.number,
            status,
            started_at: started_at(self.timestamp),
            duration_ms: self.duration.unwrap_or_default(),
        }
    }
}

impl JenkinsJob {
    /// Latest-build view; a queued job reports queued regardless of its last result.
    pub(crate) fn snapshot(&self) -> BuildSnapshot {
        let number = self.last_build.as_ref().map(|build| build.number);
        if self.in_queue {
            return BuildSnapshot::new(number, BuildStatus::Queued);
        }
        match &self.last_build {
            Some(build) => BuildSnapshot::new(number, build.status()),
            None => BuildSnapshot::new(None, BuildStatus::Unknown),
        }
    }
}

pub(crate) fn started_at(millis: Option<i64>) -> Option<DateTime<Utc>> {
    millis.and_then(|m| Utc.timestamp_millis_opt(m).single())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_jenkins_results() {
        assert_eq!(normalize_status(Some("SUCCESS"), false), BuildStatus::Success);
        assert_eq!(normalize_status(Some("FAILURE"), false), BuildStatus::Failure);
        assert_eq!(normalize_status(Some("UNSTABLE"), false), BuildStatus::Failure);
        assert_eq!(normalize_status(Some("ABORTED"), false), BuildStatus::Aborted);
        assert_eq!(normalize_status(Some("NOT_BUILT"), false), BuildStatus::Unknown);
        assert_eq!(normalize_status(None, false), BuildStatus::Unknown);
        assert_eq!(normalize_status(None, true), BuildStatus::InProgress);
    }

    #[test]
    fn queued_job_reports_queued() {
        let job: JenkinsJob = serde_json::from_str(
            r#"{"name":"web","inQueue":true,"lastBuild":{"number":4,"result":"SUCCESS","building":false}}"#,
        )
        .unwrap();
        assert_eq!(
            job.snapshot(),
            BuildSnapshot::new(Some(4), BuildStatus::Queued)
        );
    }

    #[test]
    fn build_record_carries_start_time() {
        let build: JenkinsBuild = serde_json::from_str(
            r#"{"number":9,"result":"FAILURE","building":false,"timestamp":1735787045000,"duration":1500}"#,
        )
        .unwrap();
        let record = build.into_record("web");
        assert_eq!(record.number, 9);
        assert_eq!(record.status, BuildStatus::Failure);
        assert_eq!(record.duration_ms, 1500);
        assert_eq!(record.started_at, started_at(Some(1_735_787_045_000)));
    }
}
