//! Local view of one long-running speech synthesis job.
//!
//! The job keeps running on the provider side regardless of what happens here;
//! this record only tracks how far *we* have observed it. It is written to disk
//! after submission so a later process can pick up polling where this one stopped.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;

use crate::core::error::{PipelineError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Submitted,
    Polling,
    Succeeded,
    Failed,
    TimedOut,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Succeeded | JobStatus::Failed | JobStatus::TimedOut
        )
    }

    /// Forward-only. Polling may repeat; terminal states accept nothing.
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        use JobStatus::*;
        match (self, next) {
            (Submitted, Polling) => true,
            (Submitted | Polling, Succeeded | Failed | TimedOut) => true,
            (Polling, Polling) => true,
            _ => false,
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            JobStatus::Submitted => "submitted",
            JobStatus::Polling => "polling",
            JobStatus::Succeeded => "succeeded",
            JobStatus::Failed => "failed",
            JobStatus::TimedOut => "timed_out",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AudioSynthesisJob {
    pub job_handle: String,
    pub status: JobStatus,
    pub intermediate_location: String,
    #[serde(default)]
    pub result_location: Option<String>,
    pub submitted_at: DateTime<Utc>,
    #[serde(default)]
    pub polls: u32,
    #[serde(default)]
    pub failure: Option<String>,
}

impl AudioSynthesisJob {
    pub fn submitted(job_handle: impl Into<String>, intermediate_location: impl Into<String>) -> Self {
        Self {
            job_handle: job_handle.into(),
            status: JobStatus::Submitted,
            intermediate_location: intermediate_location.into(),
            result_location: None,
            submitted_at: Utc::now(),
            polls: 0,
            failure: None,
        }
    }

    pub fn transition(&mut self, next: JobStatus) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(PipelineError::validation(format!(
                "job {} cannot move from {} to {}",
                self.job_handle, self.status, next
            )));
        }
        if next == JobStatus::Polling {
            self.polls += 1;
        }
        self.status = next;
        Ok(())
    }

    /// Fresh local tracking of the same remote job, e.g. to wait again after a timeout.
    /// The remote job is not resubmitted.
    pub fn reopen(&self) -> Self {
        Self {
            job_handle: self.job_handle.clone(),
            status: JobStatus::Submitted,
            intermediate_location: self.intermediate_location.clone(),
            result_location: None,
            submitted_at: self.submitted_at,
            polls: 0,
            failure: None,
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use JobStatus::*;

    const ALL: [JobStatus; 5] = [Submitted, Polling, Succeeded, Failed, TimedOut];

    #[test]
    fn test_terminal_states_accept_nothing() {
        for terminal in [Succeeded, Failed, TimedOut] {
            for next in ALL {
                assert!(!terminal.can_transition_to(next), "{} -> {}", terminal, next);
            }
        }
    }

    #[test]
    fn test_no_backward_moves() {
        assert!(!Polling.can_transition_to(Submitted));
        assert!(!Submitted.can_transition_to(Submitted));
        assert!(Submitted.can_transition_to(Polling));
        assert!(Polling.can_transition_to(Polling));
        assert!(Polling.can_transition_to(TimedOut));
    }

    #[test]
    fn test_transition_after_success_is_rejected() {
        let mut job = AudioSynthesisJob::submitted("op-1", "jobs/op-1");
        job.transition(Polling).unwrap();
        job.transition(Polling).unwrap();
        job.transition(Succeeded).unwrap();
        assert_eq!(job.polls, 2);

        let err = job.transition(Polling).unwrap_err();
        assert!(err.to_string().contains("succeeded to polling"));
        assert_eq!(job.status, Succeeded);
    }

    #[test]
    fn test_reopen_keeps_handle() {
        let mut job = AudioSynthesisJob::submitted("op-2", "jobs/op-2");
        job.transition(TimedOut).unwrap();
        let again = job.reopen();
        assert_eq!(again.job_handle, "op-2");
        assert_eq!(again.status, Submitted);
        assert_eq!(job.status, TimedOut);
    }

    #[test]
    fn test_save_and_load() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("out").join("job.json");
        let mut job = AudioSynthesisJob::submitted("op-3", "jobs/op-3");
        job.transition(Polling).unwrap();
        job.save(&path).unwrap();

        let loaded = AudioSynthesisJob::load(&path).unwrap();
        assert_eq!(loaded, job);
        let raw = std::fs::read_to_string(&path).unwrap();
        assert!(raw.contains("\"status\": \"polling\""));
    }
}
