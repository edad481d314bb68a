//! The declarative job catalog: the immutable, copy-on-write snapshot the
//! scheduler loop reads from and the Control API publishes new versions of.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use typed_builder::TypedBuilder;

use crate::trigger::{self, TimeWindow, Trigger};

pub type JobId = String;

/// One step of a job's command list: a closed tagged variant instead of a
/// duck-typed payload dict, so every step kind is exhaustively matched.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "step", rename_all = "snake_case")]
pub enum JobStep {
    CommandExec {
        argv: Vec<String>,
        #[serde(default)]
        continue_on_error: bool,
    },
    FileWrite {
        path: String,
        contents: String,
        #[serde(default)]
        continue_on_error: bool,
    },
    FileRead {
        path: String,
        #[serde(default)]
        continue_on_error: bool,
    },
    FileCopy {
        from: String,
        to: String,
        #[serde(default)]
        continue_on_error: bool,
    },
    FileDelete {
        path: String,
        #[serde(default)]
        continue_on_error: bool,
    },
    HttpGet {
        url: String,
        #[serde(default)]
        continue_on_error: bool,
    },
    HttpPost {
        url: String,
        #[serde(default)]
        body: Option<String>,
        #[serde(default)]
        continue_on_error: bool,
    },
    WebhookSend {
        payload_template_id: String,
        #[serde(default)]
        variables: HashMap<String, String>,
        #[serde(default)]
        continue_on_error: bool,
    },
    AdbWake {
        device_id: String,
        #[serde(default)]
        continue_on_error: bool,
    },
    AdbStartApp {
        device_id: String,
        package: String,
        #[serde(default)]
        continue_on_error: bool,
    },
    Sleep {
        seconds: u64,
        #[serde(default)]
        continue_on_error: bool,
    },
    ResolutionCheck {
        device_id: String,
        expected: String,
        #[serde(default)]
        continue_on_error: bool,
    },
}

impl JobStep {
    pub fn continue_on_error(&self) -> bool {
        match self {
            JobStep::CommandExec { continue_on_error, .. }
            | JobStep::FileWrite { continue_on_error, .. }
            | JobStep::FileRead { continue_on_error, .. }
            | JobStep::FileCopy { continue_on_error, .. }
            | JobStep::FileDelete { continue_on_error, .. }
            | JobStep::HttpGet { continue_on_error, .. }
            | JobStep::HttpPost { continue_on_error, .. }
            | JobStep::WebhookSend { continue_on_error, .. }
            | JobStep::AdbWake { continue_on_error, .. }
            | JobStep::AdbStartApp { continue_on_error, .. }
            | JobStep::Sleep { continue_on_error, .. }
            | JobStep::ResolutionCheck { continue_on_error, .. } => *continue_on_error,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeywordKind {
    Success,
    Failure,
    Alert,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeywordRule {
    pub patterns: Vec<String>,
    pub kind: KeywordKind,
    pub message: String,
    #[serde(default = "default_case_sensitive")]
    pub case_sensitive: bool,
    /// Only meaningful for `kind = failure`: cancel the process immediately
    /// on first match instead of letting it run to exit.
    #[serde(default)]
    pub abort_on_hit: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NotificationFlags {
    #[serde(default)]
    pub notify_on_start: bool,
    #[serde(default)]
    pub notify_on_success: bool,
    #[serde(default)]
    pub notify_on_failure: bool,
    #[serde(default)]
    pub notify_on_keyword: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    #[serde(default)]
    pub max_failure_retries: u32,
    #[serde(default)]
    pub failure_retry_delay_seconds: u64,
    #[serde(default)]
    pub success_repeat_within_window: bool,
    #[serde(default)]
    pub success_repeat_delay_seconds: u64,
    #[serde(default)]
    pub success_repeat_max: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_failure_retries: 0,
            failure_retry_delay_seconds: 0,
            success_repeat_within_window: false,
            success_repeat_delay_seconds: 0,
            success_repeat_max: 0,
        }
    }
}

/// A job's declarative definition, as published in the catalog.
#[derive(Debug, Clone, Serialize, Deserialize, TypedBuilder)]
pub struct Job {
    pub id: JobId,
    pub name: String,
    #[builder(default = true)]
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Lower value = higher priority; range enforced at publish time.
    pub priority: i32,
    pub resource_group: String,
    pub trigger: Trigger,
    pub steps: Vec<JobStep>,
    #[builder(default)]
    #[serde(default)]
    pub working_directory: Option<String>,
    #[builder(default)]
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// 0 = no timeout.
    #[builder(default)]
    #[serde(default)]
    pub timeout_seconds: u64,
    #[builder(default)]
    #[serde(default)]
    pub retry: RetryPolicy,
    #[builder(default)]
    #[serde(default)]
    pub keyword_rules: Vec<KeywordRule>,
    #[builder(default)]
    #[serde(default)]
    pub notifications: NotificationFlags,
    /// Required whenever the trigger is window-bearing and
    /// `success_repeat_within_window` is set; `RandomWindow` triggers carry
    /// their own window and ignore this field.
    #[builder(default)]
    #[serde(default)]
    pub success_repeat_window: Option<TimeWindow>,
    /// Optional emulator-task pre-steps, synthesized by `effective_steps`
    /// into a prelude prepended to `steps`.
    #[builder(default)]
    #[serde(default)]
    pub emulator_task: Option<EmulatorTask>,
}

/// Device wake/keep-awake, optional resolution assertion, and app launch,
/// synthesized as a `JobStep` prelude ahead of a job's own command list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmulatorTask {
    pub device_id: String,
    #[serde(default)]
    pub expected_resolution: Option<String>,
    #[serde(default)]
    pub app_package: Option<String>,
}

impl Job {
    /// The full step list the supervisor actually runs: the emulator-task
    /// prelude (if any), followed by this job's declared `steps`. A prelude
    /// failure marks the run `failed` with reason `prelude` before the main
    /// command list is reached.
    pub fn effective_steps(&self) -> Vec<JobStep> {
        let Some(task) = &self.emulator_task else {
            return self.steps.clone();
        };
        let mut prelude = vec![JobStep::AdbWake {
            device_id: task.device_id.clone(),
            continue_on_error: false,
        }];
        if let Some(expected) = &task.expected_resolution {
            prelude.push(JobStep::ResolutionCheck {
                device_id: task.device_id.clone(),
                expected: expected.clone(),
                continue_on_error: false,
            });
        }
        if let Some(package) = &task.app_package {
            prelude.push(JobStep::AdbStartApp {
                device_id: task.device_id.clone(),
                package: package.clone(),
                continue_on_error: false,
            });
        }
        prelude.extend(self.steps.clone());
        prelude
    }
}

fn default_true() -> bool {
    true
}

/// Keyword rules are case-sensitive unless a rule opts out.
fn default_case_sensitive() -> bool {
    true
}

impl Job {
    /// The window an in-window success-repeat must stay inside, anchored to
    /// `origin_fire` (the scheduled time of the run that started the window).
    pub fn window_end(&self, origin_fire: chrono::DateTime<chrono::Utc>) -> Option<chrono::DateTime<chrono::Utc>> {
        if let Some(own) = trigger::own_window(&self.trigger) {
            let date = origin_fire.date_naive();
            return Some(chrono::DateTime::<chrono::Utc>::from_naive_utc_and_offset(
                date.and_time(own.end),
                chrono::Utc,
            ));
        }
        let window = self.success_repeat_window?;
        let date = origin_fire.date_naive();
        Some(chrono::DateTime::<chrono::Utc>::from_naive_utc_and_offset(
            date.and_time(window.end),
            chrono::Utc,
        ))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceGroupSpec {
    pub name: String,
    pub max_concurrent: u32,
}

#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    #[error("job {job_id:?} references unknown resource group {group:?}")]
    UnknownGroup { job_id: JobId, group: String },
    #[error("job {job_id:?} has priority {priority} outside the allowed range -100..=100")]
    PriorityOutOfRange { job_id: JobId, priority: i32 },
    #[error("job {job_id:?} has success_repeat_within_window=true but no window and a non-window-bearing trigger")]
    MissingWindow { job_id: JobId },
    #[error("resource group {name:?} has max_concurrent=0")]
    EmptyGroup { name: String },
    #[error("duplicate job id {0:?}")]
    DuplicateJobId(JobId),
}

/// Immutable, `Arc`-shared snapshot of the job catalog. Published
/// copy-on-write: a new `Catalog` replaces the old one under a single lock,
/// readers keep the snapshot they already hold.
#[derive(Debug, Clone, Default)]
pub struct Catalog {
    jobs: HashMap<JobId, Job>,
    resource_groups: HashMap<String, ResourceGroupSpec>,
}

impl Catalog {
    /// Validate and construct a catalog from its raw parts.
    pub fn new(jobs: Vec<Job>, resource_groups: Vec<ResourceGroupSpec>) -> Result<Self, CatalogError> {
        let mut group_map = HashMap::new();
        for group in resource_groups {
            if group.max_concurrent == 0 {
                return Err(CatalogError::EmptyGroup { name: group.name });
            }
            group_map.insert(group.name.clone(), group);
        }

        let mut job_map = HashMap::new();
        for job in jobs {
            if job_map.contains_key(&job.id) {
                return Err(CatalogError::DuplicateJobId(job.id));
            }
            if !group_map.contains_key(&job.resource_group) {
                return Err(CatalogError::UnknownGroup {
                    job_id: job.id,
                    group: job.resource_group,
                });
            }
            if !(-100..=100).contains(&job.priority) {
                return Err(CatalogError::PriorityOutOfRange {
                    job_id: job.id,
                    priority: job.priority,
                });
            }
            if job.retry.success_repeat_within_window {
                let window_bearing = trigger::is_window_bearing(&job.trigger);
                let has_window = trigger::own_window(&job.trigger).is_some() || job.success_repeat_window.is_some();
                if !window_bearing || !has_window {
                    return Err(CatalogError::MissingWindow { job_id: job.id });
                }
            }
            job_map.insert(job.id.clone(), job);
        }

        Ok(Self {
            jobs: job_map,
            resource_groups: group_map,
        })
    }

    pub fn job(&self, id: &str) -> Option<&Job> {
        self.jobs.get(id)
    }

    pub fn jobs(&self) -> impl Iterator<Item = &Job> {
        self.jobs.values()
    }

    pub fn resource_group(&self, name: &str) -> Option<&ResourceGroupSpec> {
        self.resource_groups.get(name)
    }

    pub fn resource_groups(&self) -> impl Iterator<Item = &ResourceGroupSpec> {
        self.resource_groups.values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn group(name: &str, max: u32) -> ResourceGroupSpec {
        ResourceGroupSpec {
            name: name.to_string(),
            max_concurrent: max,
        }
    }

    fn job(id: &str, group: &str, priority: i32) -> Job {
        Job::builder()
            .id(id.to_string())
            .name(id.to_string())
            .priority(priority)
            .resource_group(group.to_string())
            .trigger(Trigger::Interval { spec: "5m".to_string() })
            .steps(vec![JobStep::CommandExec {
                argv: vec!["echo".to_string(), "hi".to_string()],
                continue_on_error: false,
            }])
            .build()
    }

    #[test]
    fn rejects_job_with_unknown_group() {
        let err = Catalog::new(vec![job("a", "missing", 0)], vec![group("G", 1)]).unwrap_err();
        assert!(matches!(err, CatalogError::UnknownGroup { .. }));
    }

    #[test]
    fn rejects_priority_out_of_range() {
        let err = Catalog::new(vec![job("a", "G", 200)], vec![group("G", 1)]).unwrap_err();
        assert!(matches!(err, CatalogError::PriorityOutOfRange { .. }));
    }

    #[test]
    fn rejects_duplicate_job_ids() {
        let err = Catalog::new(vec![job("a", "G", 0), job("a", "G", 1)], vec![group("G", 1)]).unwrap_err();
        assert!(matches!(err, CatalogError::DuplicateJobId(_)));
    }

    #[test]
    fn rejects_success_repeat_without_window_on_non_window_bearing_trigger() {
        let mut j = job("a", "G", 0);
        j.retry.success_repeat_within_window = true;
        let err = Catalog::new(vec![j], vec![group("G", 1)]).unwrap_err();
        assert!(matches!(err, CatalogError::MissingWindow { .. }));
    }

    #[test]
    fn accepts_valid_catalog() {
        let catalog = Catalog::new(vec![job("a", "G", 0)], vec![group("G", 1)]).unwrap();
        assert!(catalog.job("a").is_some());
        assert_eq!(catalog.resource_group("G").unwrap().max_concurrent, 1);
    }
}
