/// The supervisor event loop: one thread, one poll call, one verdict
use crate::cgroup::CgroupEvents;
use crate::handoff;
use crate::report;
use crate::request::Request;
use crate::response::ResponseBuffer;
use crate::sink::{Forward, Sink};
use crate::types::{Result, SupervisorError, STATUS_PIPE_LIMIT, STATUS_TIME_LIMIT};
use nix::sys::signal::{kill, Signal};
use nix::sys::time::TimeSpec;
use nix::sys::timerfd::{ClockId, Expiration, TimerFd, TimerFlags, TimerSetTimeFlags};
use nix::unistd::Pid;
use std::io;
use std::os::unix::io::{AsFd, AsRawFd, OwnedFd, RawFd};

// Fixed channel-table slots. Pipe slots follow SPAWNER_EXIT.
const HANDOFF: usize = 0;
const SECCOMP_NOTIFY: usize = 1;
const MEMORY_EVENTS: usize = 2;
const PIDS_EVENTS: usize = 3;
const STATUS_REPORT: usize = 4;
const TIMER: usize = 5;
const SPAWNER_EXIT: usize = 6;
const PIPE0: usize = 7;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum State {
    Running,
    Exiting,
    Done,
}

/// Owns every descriptor tied to one supervised execution and drives them
/// to a single committed verdict.
///
/// All waiting happens in one indefinite `poll`; everything else is
/// non-blocking. Ready channels are dispatched in fixed priority order,
/// and any mutation of the channel table forces a fresh `poll` before
/// lower-priority channels are looked at again.
pub struct Supervisor {
    request: Request,
    spawner_pid: Pid,
    response_fd: RawFd,
    state: State,
    timer: TimerFd,
    handoff_fd: Option<OwnedFd>,
    seccomp_notify: Option<OwnedFd>,
    cgroup: CgroupEvents,
    status_report: Option<OwnedFd>,
    spawner_exit: Option<OwnedFd>,
    pipes: Vec<Option<OwnedFd>>,
    sinks: Vec<Sink>,
    committed: ResponseBuffer,
    pending: ResponseBuffer,
}

impl Supervisor {
    /// Set up sinks, arm the wall-clock timer, and register the initial
    /// channel set. The pipe and self-report slots stay empty until the
    /// capability handoff delivers their descriptors.
    pub fn new(
        request: Request,
        spawner_pid: Pid,
        cgroup: CgroupEvents,
        spawner_exit: OwnedFd,
        handoff_fd: OwnedFd,
        response_fd: RawFd,
    ) -> Result<Self> {
        let timer = TimerFd::new(ClockId::CLOCK_MONOTONIC, TimerFlags::TFD_CLOEXEC)
            .map_err(|e| SupervisorError::Channel(format!("Create timer: {}", e)))?;
        timer
            .set(
                Expiration::OneShot(TimeSpec::from_duration(request.time_limit())),
                TimerSetTimeFlags::empty(),
            )
            .map_err(|e| SupervisorError::Channel(format!("Set timer: {}", e)))?;

        let sinks = request
            .pipes
            .iter()
            .map(Sink::initialize)
            .collect::<Result<Vec<_>>>()?;
        let npipe = sinks.len();

        Ok(Self {
            request,
            spawner_pid,
            response_fd,
            state: State::Running,
            timer,
            handoff_fd: Some(handoff_fd),
            seccomp_notify: None,
            cgroup,
            status_report: None,
            spawner_exit: Some(spawner_exit),
            pipes: (0..npipe).map(|_| None).collect(),
            sinks,
            committed: ResponseBuffer::new(),
            pending: ResponseBuffer::new(),
        })
    }

    /// Drive the loop until a verdict is committed, then kill the spawner,
    /// drain the pipes and emit the verdict. Safe to call again after
    /// completion; a finished supervisor does nothing.
    pub fn run(&mut self) -> Result<()> {
        while self.state == State::Running {
            let slots = self.wait_ready()?;
            self.dispatch(&slots)?;
        }
        self.finish()
    }

    fn poll_slots(&self) -> Vec<libc::pollfd> {
        fn slot(fd: Option<RawFd>, events: libc::c_short) -> libc::pollfd {
            libc::pollfd {
                fd: fd.unwrap_or(-1),
                events,
                revents: 0,
            }
        }
        let raw = |fd: &Option<OwnedFd>| fd.as_ref().map(|fd| fd.as_raw_fd());

        let mut slots = vec![
            slot(raw(&self.handoff_fd), libc::POLLIN),
            slot(raw(&self.seccomp_notify), libc::POLLIN),
            slot(Some(self.cgroup.memory_events.as_raw_fd()), libc::POLLPRI),
            slot(Some(self.cgroup.pids_events.as_raw_fd()), libc::POLLPRI),
            slot(raw(&self.status_report), libc::POLLIN),
            slot(Some(self.timer.as_fd().as_raw_fd()), libc::POLLIN),
            slot(raw(&self.spawner_exit), libc::POLLIN),
        ];
        debug_assert_eq!(slots.len(), PIPE0);
        for pipe in &self.pipes {
            slots.push(slot(pipe.as_ref().map(|fd| fd.as_raw_fd()), libc::POLLIN));
        }
        slots
    }

    /// Block until some installed channel is ready. Interruption by a
    /// signal is retried transparently; any other failure is fatal.
    fn wait_ready(&self) -> Result<Vec<libc::pollfd>> {
        let mut slots = self.poll_slots();
        loop {
            let rc = unsafe { libc::poll(slots.as_mut_ptr(), slots.len() as libc::nfds_t, -1) };
            if rc >= 0 {
                return Ok(slots);
            }
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                return Err(SupervisorError::Channel(format!("poll: {}", err)));
            }
        }
    }

    /// Act on the highest-priority ready channel, then return so the next
    /// `poll` sees the current channel set. The seccomp and cgroup slots
    /// are reserved hooks: they are kept registered but carry no verdict
    /// logic yet, so readiness on them falls through to the real work.
    fn dispatch(&mut self, slots: &[libc::pollfd]) -> Result<()> {
        if slots[HANDOFF].revents != 0 {
            self.receive_capabilities()?;
            return Ok(());
        }
        if slots[SECCOMP_NOTIFY].revents != 0 {
            // extension point: seccomp user notifications
        }
        if slots[MEMORY_EVENTS].revents != 0 {
            // extension point: cgroup memory.events (OOM)
        }
        if slots[PIDS_EVENTS].revents != 0 {
            // extension point: cgroup pids.events
        }
        if slots[STATUS_REPORT].revents != 0 {
            if self.read_status_report()? {
                self.state = State::Exiting;
            }
            return Ok(());
        }
        if slots[TIMER].revents != 0 {
            log::debug!("Wall-clock limit expired");
            self.committed.set_status(STATUS_TIME_LIMIT)?;
            self.state = State::Exiting;
            return Ok(());
        }
        if slots[SPAWNER_EXIT].revents != 0 {
            if self.read_spawner_exit()? {
                self.state = State::Exiting;
            }
            return Ok(());
        }
        if self.sweep_pipes(Some(slots))? {
            self.state = State::Exiting;
        }
        Ok(())
    }

    /// One-shot receipt of the spawner's capability message. Installing
    /// new descriptors invalidates the in-flight readiness result, which
    /// is why `dispatch` returns right after this.
    fn receive_capabilities(&mut self) -> Result<()> {
        let fd = match &self.handoff_fd {
            Some(fd) => fd.as_raw_fd(),
            None => return Ok(()),
        };
        let caps = match handoff::receive(fd, &self.request)? {
            Some(caps) => caps,
            // the spawner pushes the message asynchronously; a wakeup with
            // nothing queued yet is not an error
            None => return Ok(()),
        };
        self.handoff_fd = None;

        self.seccomp_notify = caps.seccomp_notify;
        for (slot, fd) in self.pipes.iter_mut().zip(caps.pipes) {
            set_nonblocking(fd.as_raw_fd())?;
            *slot = Some(fd);
        }
        self.status_report = caps.status_report;
        log::debug!(
            "Capability handoff complete: {} pipes, status channel: {}",
            self.sinks.len(),
            self.status_report.is_some()
        );
        Ok(())
    }

    /// Accumulate self-report bytes; on end-of-stream, settle the report
    /// into the committed buffer. Returns whether the channel is finished.
    fn read_status_report(&mut self) -> Result<bool> {
        let fd = match &self.status_report {
            Some(fd) => fd.as_raw_fd(),
            None => return Ok(false),
        };
        match self.pending.fill_from(fd) {
            Ok(0) => {
                self.status_report = None;
                let accepted = report::settle_report(&self.pending, &mut self.committed)?;
                if !accepted {
                    log::warn!("Rejected status report ({} bytes)", self.pending.size());
                }
                Ok(true)
            }
            Ok(_) => Ok(false),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(false),
            Err(e) => Err(SupervisorError::Channel(format!(
                "Receiving response: {}",
                e
            ))),
        }
    }

    /// Accumulate the spawner's exit report directly into the committed
    /// buffer. End-of-stream finalizes it; an empty stream means the
    /// spawner died without reporting, which is not a sandbox outcome.
    fn read_spawner_exit(&mut self) -> Result<bool> {
        let fd = match &self.spawner_exit {
            Some(fd) => fd.as_raw_fd(),
            None => return Ok(false),
        };
        match self.committed.fill_from(fd) {
            Ok(0) => {
                self.spawner_exit = None;
                if self.committed.size() == 0 {
                    return Err(SupervisorError::Channel("Empty response".to_string()));
                }
                Ok(true)
            }
            Ok(_) => Ok(false),
            Err(e)
                if e.kind() == io::ErrorKind::WouldBlock
                    || e.kind() == io::ErrorKind::Interrupted =>
            {
                Ok(false)
            }
            Err(e) => Err(SupervisorError::Channel(format!(
                "Receiving response: {}",
                e
            ))),
        }
    }

    /// Forward pipe data. In `Running` state each ready pipe is touched
    /// once; during the exit drain every open pipe is revisited until its
    /// sink closes, so kernel-buffered output from a dead sandbox still
    /// lands (or is flagged over-quota). Returns whether a quota violation
    /// replaced the verdict.
    fn sweep_pipes(&mut self, slots: Option<&[libc::pollfd]>) -> Result<bool> {
        let exiting = self.state != State::Running;
        let mut violated = false;
        for i in 0..self.sinks.len() {
            loop {
                let source = match &self.pipes[i] {
                    Some(fd) => fd.as_raw_fd(),
                    None => break,
                };
                let ready = slots.map_or(false, |s| s[PIPE0 + i].revents != 0);
                if !ready && !exiting {
                    break;
                }
                match self.sinks[i].forward(source)? {
                    Forward::Transferred(_) => {
                        if exiting {
                            continue;
                        }
                        break;
                    }
                    Forward::WouldBlock => break,
                    Forward::Eof => {
                        self.pipes[i] = None;
                        break;
                    }
                    Forward::QuotaExceeded => {
                        self.pipes[i] = None;
                        self.set_pipe_limit_verdict(i)?;
                        violated = true;
                        break;
                    }
                }
            }
        }
        Ok(violated)
    }

    fn set_pipe_limit_verdict(&mut self, i: usize) -> Result<()> {
        let fifo = self.sinks[i].fifo().to_string();
        let file = self.sinks[i].file().to_string();
        log::warn!("Pipe limit exceeded on '{}' (writing '{}')", fifo, file);
        self.committed.reset();
        self.committed.append_raw("{\"status\":\"")?;
        self.committed.append_escaped(STATUS_PIPE_LIMIT)?;
        self.committed.append_raw("\",\"fifo\":\"")?;
        self.committed.append_escaped(&fifo)?;
        self.committed.append_raw("\",\"file\":\"")?;
        self.committed.append_escaped(&file)?;
        self.committed.append_raw("\"}\n")
    }

    /// Kill the spawner, run the final drain and emit the verdict.
    /// Emission happens exactly once; once `Done`, this is a no-op.
    fn finish(&mut self) -> Result<()> {
        if self.state == State::Done {
            return Ok(());
        }
        if let Err(e) = kill(self.spawner_pid, Signal::SIGKILL) {
            log::warn!("Killing spawner {}: {}", self.spawner_pid, e);
        }
        self.state = State::Exiting;
        self.sweep_pipes(None)?;
        self.committed.send(self.response_fd)?;
        self.state = State::Done;
        Ok(())
    }
}

fn set_nonblocking(fd: RawFd) -> Result<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(SupervisorError::Channel(format!(
            "fcntl: {}",
            io::Error::last_os_error()
        )));
    }
    let rc = unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) };
    if rc < 0 {
        return Err(SupervisorError::Channel(format!(
            "fcntl: {}",
            io::Error::last_os_error()
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::PipeSpec;
    use std::os::unix::io::FromRawFd;
    use tempfile::TempDir;

    fn cgroup_fixture(dir: &TempDir) -> CgroupEvents {
        std::fs::write(dir.path().join("memory.events"), "oom 0\n").unwrap();
        std::fs::write(dir.path().join("pids.events"), "max 0\n").unwrap();
        CgroupEvents::open(dir.path()).unwrap()
    }

    fn raw_pipe() -> (OwnedFd, OwnedFd) {
        let mut fds = [0i32; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) }
    }

    fn supervisor_fixture(dir: &TempDir, pipes: Vec<PipeSpec>) -> (Supervisor, OwnedFd, OwnedFd) {
        let request = Request {
            time_limit: 10.0,
            pipes,
            status_fifo: false,
            seccomp_notify: false,
        };
        let cgroup = cgroup_fixture(dir);
        let (spawner_r, spawner_w) = raw_pipe();
        let (handoff_r, handoff_w) = raw_pipe();
        let supervisor = Supervisor::new(
            request,
            Pid::from_raw(i32::MAX), // never signalled in unit tests
            cgroup,
            spawner_r,
            handoff_r,
            libc::STDOUT_FILENO,
        )
        .unwrap();
        (supervisor, spawner_w, handoff_w)
    }

    #[test]
    fn test_new_installs_fixed_slots() {
        let dir = TempDir::new().unwrap();
        let spec = PipeSpec {
            fifo: "stdout".to_string(),
            file: dir.path().join("out"),
            limit: 16,
        };
        let (supervisor, _spawner_w, _handoff_w) = supervisor_fixture(&dir, vec![spec]);

        let slots = supervisor.poll_slots();
        assert_eq!(slots.len(), PIPE0 + 1);
        assert!(slots[HANDOFF].fd >= 0);
        assert!(slots[TIMER].fd >= 0);
        assert!(slots[SPAWNER_EXIT].fd >= 0);
        // not yet installed: placeholder excluded from the wait
        assert_eq!(slots[SECCOMP_NOTIFY].fd, -1);
        assert_eq!(slots[STATUS_REPORT].fd, -1);
        assert_eq!(slots[PIPE0].fd, -1);
    }

    #[test]
    fn test_pipe_limit_verdict_shape() {
        let dir = TempDir::new().unwrap();
        let spec = PipeSpec {
            fifo: "stdout".to_string(),
            file: dir.path().join("out"),
            limit: 16,
        };
        let (mut supervisor, _spawner_w, _handoff_w) = supervisor_fixture(&dir, vec![spec]);

        supervisor.set_pipe_limit_verdict(0).unwrap();
        let verdict = String::from_utf8(supervisor.committed.as_bytes().to_vec()).unwrap();
        assert!(verdict.starts_with("{\"status\":\"pipeLimit\",\"fifo\":\"stdout\",\"file\":\""));
        assert!(verdict.ends_with("\"}\n"));
    }

    #[test]
    fn test_exit_drain_flushes_buffered_output() {
        let dir = TempDir::new().unwrap();
        let out = dir.path().join("out");
        let spec = PipeSpec {
            fifo: "stdout".to_string(),
            file: out.clone(),
            limit: 100,
        };
        let (mut supervisor, _spawner_w, _handoff_w) = supervisor_fixture(&dir, vec![spec]);

        let (pipe_r, pipe_w) = raw_pipe();
        set_nonblocking(pipe_r.as_raw_fd()).unwrap();
        supervisor.pipes[0] = Some(pipe_r);

        let data = b"buffered before the source died";
        let rc = unsafe {
            libc::write(
                pipe_w.as_raw_fd(),
                data.as_ptr().cast::<libc::c_void>(),
                data.len(),
            )
        };
        assert_eq!(rc as usize, data.len());
        drop(pipe_w);

        supervisor.state = State::Exiting;
        assert!(!supervisor.sweep_pipes(None).unwrap());
        assert!(supervisor.pipes[0].is_none());
        assert_eq!(std::fs::read(&out).unwrap(), data);
    }

    #[test]
    fn test_exit_drain_flags_overquota_leftovers() {
        let dir = TempDir::new().unwrap();
        let spec = PipeSpec {
            fifo: "stderr".to_string(),
            file: dir.path().join("err"),
            limit: 4,
        };
        let (mut supervisor, _spawner_w, _handoff_w) = supervisor_fixture(&dir, vec![spec]);

        let (pipe_r, pipe_w) = raw_pipe();
        set_nonblocking(pipe_r.as_raw_fd()).unwrap();
        supervisor.pipes[0] = Some(pipe_r);
        let rc = unsafe { libc::write(pipe_w.as_raw_fd(), b"too much".as_ptr().cast(), 8) };
        assert_eq!(rc, 8);
        drop(pipe_w);

        supervisor.state = State::Exiting;
        assert!(supervisor.sweep_pipes(None).unwrap());
        let verdict = String::from_utf8(supervisor.committed.as_bytes().to_vec()).unwrap();
        assert!(verdict.contains("\"status\":\"pipeLimit\""));
        assert!(verdict.contains("\"fifo\":\"stderr\""));
    }
}
