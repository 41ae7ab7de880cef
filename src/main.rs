/// sandrun: Sandbox Supervisor
///
/// Runs the supervisor half of a sandbox runner: the privileged spawner
/// (an external collaborator) performs the namespace/cgroup-scoped
/// execution, while this process watches the exit channel, the optional
/// status self-report, the cgroup event files, the wall-clock timer and
/// the declared output pipes, and emits exactly one JSON verdict.
///
/// The descriptor numbers below are inherited from the caller that forked
/// the spawner and the supervisor.
use anyhow::Result;
use clap::Parser;
use sandrun::cgroup::CgroupEvents;
use sandrun::request::Request;
use sandrun::response::ResponseBuffer;
use sandrun::supervisor::Supervisor;
use sandrun::types::{SupervisorError, STATUS_INTERNAL_ERROR, STATUS_REQUEST_INVALID, STATUS_RESPONSE_TOO_BIG};
use std::io::Read;
use std::os::unix::io::{FromRawFd, OwnedFd, RawFd};
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Request document (JSON); '-' reads standard input
    #[arg(long, default_value = "-")]
    request: String,
    /// Cgroup directory whose event files are watched
    #[arg(long)]
    cgroup_dir: PathBuf,
    /// Process id of the spawner (killed at shutdown)
    #[arg(long)]
    spawner_pid: i32,
    /// Inherited descriptor carrying the spawner's exit report
    #[arg(long)]
    spawner_exit_fd: RawFd,
    /// Inherited control-channel descriptor for the capability handoff
    #[arg(long)]
    handoff_fd: RawFd,
    /// Descriptor the final verdict is written to
    #[arg(long, default_value_t = 1)]
    response_fd: RawFd,
}

fn read_request(source: &str) -> Result<Vec<u8>> {
    if source == "-" {
        let mut data = Vec::new();
        std::io::stdin().read_to_end(&mut data)?;
        Ok(data)
    } else {
        Ok(std::fs::read(source)?)
    }
}

fn compose_failure(
    response: &mut ResponseBuffer,
    status: &str,
    message: &str,
) -> sandrun::types::Result<()> {
    response.append_raw("{\"status\":\"")?;
    response.append_escaped(status)?;
    response.append_raw("\",\"description\":\"")?;
    response.append_escaped(message)?;
    response.append_raw("\"}\n")
}

/// Report a supervisor-level failure on the response channel. Unlike a
/// verdict, this describes the supervisor's own breakage, never the
/// sandboxed program's outcome.
fn send_failure(response_fd: RawFd, status: &str, message: &str) {
    let mut response = ResponseBuffer::new();
    if compose_failure(&mut response, status, message).is_err() {
        // description too long for the buffer; fall back to the bare status
        let _ = response.set_status(status);
    }
    if let Err(e) = response.send(response_fd) {
        log::error!("Reporting failure: {}", e);
    }
}

fn supervise(cli: &Cli, request: Request) -> sandrun::types::Result<()> {
    let cgroup = CgroupEvents::open(&cli.cgroup_dir)?;
    // inherited descriptors; the supervisor takes exclusive ownership
    let spawner_exit = unsafe { OwnedFd::from_raw_fd(cli.spawner_exit_fd) };
    let handoff = unsafe { OwnedFd::from_raw_fd(cli.handoff_fd) };
    let mut supervisor = Supervisor::new(
        request,
        nix::unistd::Pid::from_raw(cli.spawner_pid),
        cgroup,
        spawner_exit,
        handoff,
        cli.response_fd,
    )?;
    supervisor.run()
}

fn main() -> ExitCode {
    env_logger::init();
    let cli = Cli::parse();

    let request = match read_request(&cli.request).map_err(|e| e.to_string()).and_then(|data| {
        Request::from_json(&data).map_err(|e| e.to_string())
    }) {
        Ok(request) => request,
        Err(e) => {
            log::error!("{}", e);
            send_failure(cli.response_fd, STATUS_REQUEST_INVALID, &e);
            return ExitCode::FAILURE;
        }
    };

    match supervise(&cli, request) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("{}", e);
            let status = match e {
                SupervisorError::Response(_) => STATUS_RESPONSE_TOO_BIG,
                _ => STATUS_INTERNAL_ERROR,
            };
            send_failure(cli.response_fd, status, &e.to_string());
            ExitCode::FAILURE
        }
    }
}
