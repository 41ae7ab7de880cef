/// Request document describing one supervised execution
use crate::types::{Result, SupervisorError};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// One declared output pipe: where the stream comes from, where it goes,
/// and how many bytes it may deliver.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PipeSpec {
    /// Source stream name inside the sandbox (diagnostic label)
    pub fifo: String,
    /// Destination file the stream is forwarded to
    pub file: PathBuf,
    /// Byte quota for this pipe
    #[serde(default)]
    pub limit: u64,
}

/// Supervision request: limits and channels for a single sandboxed run.
///
/// The namespace/cgroup/mount configuration consumed by the spawner is not
/// represented here; the supervisor only needs the pieces it enforces
/// itself.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Request {
    /// Wall-clock time limit in seconds (fractional allowed)
    #[serde(rename = "timeLimit")]
    pub time_limit: f64,
    /// Declared output pipes, in handoff order
    #[serde(default)]
    pub pipes: Vec<PipeSpec>,
    /// Whether the sandbox is given a status self-report channel
    #[serde(rename = "statusFifo", default)]
    pub status_fifo: bool,
    /// Whether the spawner passes a seccomp user-notification descriptor
    #[serde(rename = "seccompNotify", default)]
    pub seccomp_notify: bool,
}

impl Request {
    /// Parse a request from a JSON document.
    pub fn from_json(data: &[u8]) -> Result<Self> {
        let request: Request = serde_json::from_slice(data)
            .map_err(|e| SupervisorError::Request(format!("Invalid request: {}", e)))?;
        if !request.time_limit.is_finite() || request.time_limit <= 0.0 {
            return Err(SupervisorError::Request(
                "Invalid request: timeLimit must be positive".to_string(),
            ));
        }
        for pipe in &request.pipes {
            if pipe.fifo.is_empty() || pipe.file.as_os_str().is_empty() {
                return Err(SupervisorError::Request(
                    "Invalid request: pipe needs both fifo and file".to_string(),
                ));
            }
        }
        Ok(request)
    }

    /// Wall-clock limit as a `Duration`.
    pub fn time_limit(&self) -> Duration {
        Duration::from_secs_f64(self.time_limit)
    }

    /// Number of descriptors expected in the capability handoff message:
    /// the optional seccomp-notify descriptor, one per pipe, and the
    /// optional self-report channel, in that order.
    pub fn handoff_fd_count(&self) -> usize {
        usize::from(self.seccomp_notify) + self.pipes.len() + usize::from(self.status_fifo)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_minimal_request() {
        let request = Request::from_json(br#"{"timeLimit": 2.5}"#).unwrap();
        assert_eq!(request.time_limit(), Duration::from_millis(2500));
        assert!(request.pipes.is_empty());
        assert!(!request.status_fifo);
        assert_eq!(request.handoff_fd_count(), 0);
    }

    #[test]
    fn test_parse_full_request() {
        let request = Request::from_json(
            br#"{
                "timeLimit": 10,
                "pipes": [{"fifo": "stdout", "file": "/tmp/out", "limit": 4096}],
                "statusFifo": true
            }"#,
        )
        .unwrap();
        assert_eq!(request.pipes.len(), 1);
        assert_eq!(request.pipes[0].fifo, "stdout");
        assert_eq!(request.pipes[0].limit, 4096);
        assert_eq!(request.handoff_fd_count(), 2);
    }

    #[test]
    fn test_reject_bad_time_limit() {
        assert!(Request::from_json(br#"{"timeLimit": 0}"#).is_err());
        assert!(Request::from_json(br#"{"timeLimit": -1}"#).is_err());
    }

    #[test]
    fn test_reject_incomplete_pipe() {
        let result = Request::from_json(
            br#"{"timeLimit": 1, "pipes": [{"fifo": "", "file": "/tmp/out"}]}"#,
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_reject_malformed_json() {
        assert!(Request::from_json(b"{").is_err());
        assert!(Request::from_json(b"[]").is_err());
    }
}
