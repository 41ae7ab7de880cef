/// Bounded verdict buffers and the one-shot response transport
use crate::types::{Result, SupervisorError};
use std::io;
use std::os::unix::io::RawFd;

/// Verdict payload capacity. One pipe buffer is enough for any verdict the
/// supervisor composes itself and for any self-report worth accepting.
pub const RESPONSE_CAPACITY: usize = 4096;

/// Slack past the declared capacity. Channel reads are allowed to land one
/// byte beyond `RESPONSE_CAPACITY` so an over-long self-report is seen as
/// over-long instead of being silently clipped to a valid length.
const RESPONSE_OVERFLOW: usize = 8;

/// Append-only JSON verdict buffer.
///
/// The supervisor owns two of these: the committed buffer (what is
/// eventually sent) and the pending buffer (unvalidated self-report bytes).
pub struct ResponseBuffer {
    bytes: [u8; RESPONSE_CAPACITY + RESPONSE_OVERFLOW],
    size: usize,
}

impl ResponseBuffer {
    pub fn new() -> Self {
        Self {
            bytes: [0; RESPONSE_CAPACITY + RESPONSE_OVERFLOW],
            size: 0,
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes[..self.size]
    }

    /// Discard accumulated content; the next verdict starts from scratch.
    pub fn reset(&mut self) {
        self.size = 0;
    }

    /// Append a literal fragment.
    pub fn append_raw(&mut self, s: &str) -> Result<()> {
        let data = s.as_bytes();
        if self.size + data.len() > RESPONSE_CAPACITY {
            return Err(SupervisorError::Response(format!(
                "Response exceeds {} bytes",
                RESPONSE_CAPACITY
            )));
        }
        self.bytes[self.size..self.size + data.len()].copy_from_slice(data);
        self.size += data.len();
        Ok(())
    }

    /// Append a fragment with JSON string escaping applied.
    pub fn append_escaped(&mut self, s: &str) -> Result<()> {
        for c in s.chars() {
            match c {
                '"' => self.append_raw("\\\"")?,
                '\\' => self.append_raw("\\\\")?,
                c if (c as u32) < 0x20 => {
                    let escaped = format!("\\u{:04x}", c as u32);
                    self.append_raw(&escaped)?;
                }
                c => {
                    let mut utf8 = [0u8; 4];
                    self.append_raw(c.encode_utf8(&mut utf8))?;
                }
            }
        }
        Ok(())
    }

    /// Replace the content with a bare `{"status":...}` verdict.
    pub fn set_status(&mut self, status: &str) -> Result<()> {
        self.reset();
        self.append_raw("{\"status\":\"")?;
        self.append_escaped(status)?;
        self.append_raw("\"}\n")
    }

    /// Replace the content with a copy of another buffer.
    pub fn copy_from(&mut self, other: &ResponseBuffer) {
        self.bytes[..other.size].copy_from_slice(&other.bytes[..other.size]);
        self.size = other.size;
    }

    /// Read from `fd` into the free tail of the buffer.
    ///
    /// Reads are allowed to run one byte past `RESPONSE_CAPACITY`; a
    /// buffer whose size ends up over capacity is rejected later by the
    /// validator's length check. Returns `Ok(0)` on end-of-stream and the
    /// raw `io::Error` (including `WouldBlock`/`Interrupted`) otherwise.
    pub fn fill_from(&mut self, fd: RawFd) -> io::Result<usize> {
        let space = (RESPONSE_CAPACITY + 1).saturating_sub(self.size);
        let rc = unsafe {
            libc::read(
                fd,
                self.bytes[self.size..].as_mut_ptr().cast::<libc::c_void>(),
                space,
            )
        };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        self.size += rc as usize;
        Ok(rc as usize)
    }

    /// Write the verdict to `fd` in full, newline-terminated.
    pub fn send(&self, fd: RawFd) -> Result<()> {
        write_all(fd, self.as_bytes())?;
        if !self.as_bytes().ends_with(b"\n") {
            write_all(fd, b"\n")?;
        }
        Ok(())
    }
}

fn write_all(fd: RawFd, data: &[u8]) -> Result<()> {
    let mut written = 0;
    while written < data.len() {
        let rc = unsafe {
            libc::write(
                fd,
                data[written..].as_ptr().cast::<libc::c_void>(),
                data.len() - written,
            )
        };
        if rc < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return Err(SupervisorError::Response(format!(
                "Sending response: {}",
                err
            )));
        }
        written += rc as usize;
    }
    Ok(())
}
