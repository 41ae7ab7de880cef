/// One-shot capability handoff from the spawner
use crate::request::Request;
use crate::types::{Result, SupervisorError};
use nix::sys::socket::{recvmsg, ControlMessageOwned, MsgFlags};
use std::io::IoSliceMut;
use std::mem;
use std::os::unix::io::{FromRawFd, OwnedFd, RawFd};

/// Descriptors received from the spawner, already split per the agreed
/// message layout `[seccompNotifyFd?] [pipeReadFd x N] [selfReportFd?]`.
pub struct Capabilities {
    pub seccomp_notify: Option<OwnedFd>,
    pub pipes: Vec<OwnedFd>,
    pub status_report: Option<OwnedFd>,
}

/// Try to receive the capability message pending on `fd`.
///
/// Returns `Ok(None)` when nothing is queued yet (the spawner pushes the
/// message asynchronously, so a spurious wakeup is not an error). Anything
/// else consumes the one-shot: a payload whose descriptor count does not
/// match the request configuration is a hard error rather than the silent
/// drop the wire protocol would otherwise allow, since no second message
/// is ever coming.
pub fn receive(fd: RawFd, request: &Request) -> Result<Option<Capabilities>> {
    let expected = request.handoff_fd_count();

    let mut byte = [0u8; 1];
    let mut iov = [IoSliceMut::new(&mut byte)];
    let space = unsafe { libc::CMSG_SPACE((mem::size_of::<RawFd>() * expected.max(1)) as u32) };
    let mut cmsg_buf = vec![0u8; space as usize];

    let msg = match recvmsg::<()>(
        fd,
        &mut iov,
        Some(&mut cmsg_buf),
        MsgFlags::MSG_DONTWAIT | MsgFlags::MSG_CMSG_CLOEXEC,
    ) {
        Ok(msg) => msg,
        Err(nix::errno::Errno::EAGAIN) => return Ok(None),
        Err(e) => return Err(SupervisorError::Channel(format!("recvmsg: {}", e))),
    };

    // wrap every received descriptor before judging the payload, so a bad
    // message cannot leak raw handles
    let mut fds: Vec<OwnedFd> = Vec::new();
    for cmsg in msg.cmsgs() {
        if let ControlMessageOwned::ScmRights(raw) = cmsg {
            fds.extend(raw.into_iter().map(|fd| unsafe { OwnedFd::from_raw_fd(fd) }));
        }
    }

    if msg.bytes == 0 && fds.is_empty() {
        return Err(SupervisorError::Channel(
            "Capability channel closed before handoff".to_string(),
        ));
    }
    if fds.len() != expected {
        return Err(SupervisorError::Channel(format!(
            "Capability message carried {} descriptors, expected {}",
            fds.len(),
            expected
        )));
    }

    let mut fds = fds.into_iter();
    let seccomp_notify = request.seccomp_notify.then(|| fds.next().unwrap());
    let pipes: Vec<OwnedFd> = fds.by_ref().take(request.pipes.len()).collect();
    let status_report = request.status_fifo.then(|| fds.next().unwrap());

    Ok(Some(Capabilities {
        seccomp_notify,
        pipes,
        status_report,
    }))
}
