//! Job and FailedJob row shapes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use typed_builder::TypedBuilder;
use uuid::Uuid;

/// Dispatch-time status of a job row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    #[default]
    Pending,
    Processing,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(JobStatus::Pending),
            "processing" => Some(JobStatus::Processing),
            "completed" => Some(JobStatus::Completed),
            "failed" => Some(JobStatus::Failed),
            _ => None,
        }
    }
}

/// Dispatch priority. Lower rank leases first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Urgent,
    High,
    #[default]
    Normal,
    Low,
}

impl Priority {
    /// Total order used for dispatch ordering: urgent(0) < high(1) < normal(2) < low(3).
    pub fn rank(&self) -> i16 {
        match self {
            Priority::Urgent => 0,
            Priority::High => 1,
            Priority::Normal => 2,
            Priority::Low => 3,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Urgent => "urgent",
            Priority::High => "high",
            Priority::Normal => "normal",
            Priority::Low => "low",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "urgent" => Some(Priority::Urgent),
            "high" => Some(Priority::High),
            "normal" => Some(Priority::Normal),
            "low" => Some(Priority::Low),
            _ => None,
        }
    }
}

/// Which codec path decodes `callable`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum CallableType {
    #[default]
    Function,
    ClassMethod,
    Closure,
}

impl CallableType {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallableType::Function => "function",
            CallableType::ClassMethod => "class-method",
            CallableType::Closure => "closure",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "function" => Some(CallableType::Function),
            "class-method" => Some(CallableType::ClassMethod),
            "closure" => Some(CallableType::Closure),
            _ => None,
        }
    }
}

/// The durable record of one unit of work.
#[derive(Debug, Clone, Serialize, Deserialize, TypedBuilder)]
#[builder(field_defaults(setter(into)))]
pub struct Job {
    #[builder(default, setter(skip))]
    pub id: i64,

    #[builder(default = Uuid::new_v4())]
    pub uuid: Uuid,

    pub name: String,

    pub callable_type: CallableType,
    pub callable: Vec<u8>,

    #[builder(default, setter(strip_option))]
    pub namespace: Option<String>,
    #[builder(default, setter(strip_option))]
    pub object_instance: Option<Vec<u8>>,
    #[builder(default, setter(strip_option))]
    pub path_files: Option<String>,

    pub params: Vec<u8>,

    #[builder(default)]
    pub status: JobStatus,
    #[builder(default)]
    pub priority: Priority,

    #[builder(default, setter(strip_option))]
    pub pid: Option<String>,

    #[builder(default = 14_400)]
    pub timeout: i64,
    #[builder(default = 0)]
    pub retry_count: i32,
    #[builder(default = 3)]
    pub max_retries: i32,
    #[builder(default = 5)]
    pub retry_delay: i64,

    #[builder(default, setter(strip_option))]
    pub started_at: Option<DateTime<Utc>>,
    #[builder(default, setter(strip_option))]
    pub completed_at: Option<DateTime<Utc>>,
    #[builder(default = Utc::now())]
    pub created_at: DateTime<Utc>,
    #[builder(default = Utc::now())]
    pub updated_at: DateTime<Utc>,
}

impl Job {
    /// Whether a retry should be attempted: true when `retry_count + 1`,
    /// the attempt number the next try would record, is still below
    /// `max_retries`. A job that exhausts its budget dead-letters without
    /// `retry_count` ever reaching `max_retries`.
    pub fn has_retry_budget(&self) -> bool {
        self.retry_count + 1 < self.max_retries
    }
}

/// Forensic record written on terminal failure.
#[derive(Debug, Clone, Serialize, Deserialize, TypedBuilder)]
#[builder(field_defaults(setter(into)))]
pub struct FailedJob {
    #[builder(default, setter(skip))]
    pub id: i64,

    pub uuid: Uuid,
    pub job_id: i64,
    pub exception: String,
    pub payload: String,

    #[builder(default = Utc::now())]
    pub failed_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priority_ordering_matches_spec() {
        assert!(Priority::Urgent.rank() < Priority::High.rank());
        assert!(Priority::High.rank() < Priority::Normal.rank());
        assert!(Priority::Normal.rank() < Priority::Low.rank());
    }

    #[test]
    fn job_builder_applies_spec_defaults() {
        let job = Job::builder()
            .name("add")
            .callable_type(CallableType::Function)
            .callable(b"add".to_vec())
            .params(b"[]".to_vec())
            .build();

        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.priority, Priority::Normal);
        assert_eq!(job.max_retries, 3);
        assert_eq!(job.timeout, 14_400);
        assert_eq!(job.retry_delay, 5);
        assert_eq!(job.retry_count, 0);
        assert!(job.has_retry_budget());
    }

    #[test]
    fn status_round_trips_through_str() {
        for status in [
            JobStatus::Pending,
            JobStatus::Processing,
            JobStatus::Completed,
            JobStatus::Failed,
        ] {
            assert_eq!(JobStatus::parse(status.as_str()), Some(status));
        }
    }

    #[test]
    fn priority_round_trips_through_str() {
        for priority in [
            Priority::Urgent,
            Priority::High,
            Priority::Normal,
            Priority::Low,
        ] {
            assert_eq!(Priority::parse(priority.as_str()), Some(priority));
        }
    }
}
