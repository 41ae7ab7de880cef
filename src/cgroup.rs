/// Cgroup v2 event channels watched by the supervisor
use crate::types::{Result, SupervisorError};
use std::fs::File;
use std::os::unix::io::OwnedFd;
use std::path::Path;

/// Limit-event descriptors for the sandbox's cgroup.
///
/// `memory.events` and `pids.events` signal limit hits via priority
/// readiness; the supervisor keeps both registered as reserved hooks even
/// though no verdict is derived from them yet.
pub struct CgroupEvents {
    pub memory_events: OwnedFd,
    pub pids_events: OwnedFd,
}

impl CgroupEvents {
    /// Open the event files under an already-created cgroup directory.
    /// Creating and configuring the cgroup itself is the caller's job.
    pub fn open(cgroup_dir: &Path) -> Result<Self> {
        Ok(Self {
            memory_events: open_event_file(cgroup_dir, "memory.events")?,
            pids_events: open_event_file(cgroup_dir, "pids.events")?,
        })
    }
}

fn open_event_file(cgroup_dir: &Path, name: &str) -> Result<OwnedFd> {
    let path = cgroup_dir.join(name);
    let file = File::open(&path).map_err(|e| {
        SupervisorError::Channel(format!("Opening '{}': {}", path.display(), e))
    })?;
    Ok(OwnedFd::from(file))
}
