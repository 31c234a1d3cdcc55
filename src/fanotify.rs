//! Thin ownership layer over the Linux fanotify API: group setup, the
//! event-record wire format, and the allow/deny response channel.
//!
//! See [fanotify(7)](https://man7.org/linux/man-pages/man7/fanotify.7.html).

use std::ffi::CString;
use std::fmt;
use std::io;
use std::mem::size_of;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::ffi::OsStrExt;
use std::path::Path;
use std::ptr;

use bitflags::bitflags;
use thiserror::Error;

/// Metadata layout version this crate is built against.
pub const METADATA_VERSION: u8 = libc::FANOTIFY_METADATA_VERSION;

const METADATA_SIZE: usize = size_of::<libc::fanotify_event_metadata>();

bitflags! {
    /// Event bits carried in a record's mask and installed by a mark.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct EventMask: u64 {
        const ACCESS = libc::FAN_ACCESS;
        const MODIFY = libc::FAN_MODIFY;
        const CLOSE_WRITE = libc::FAN_CLOSE_WRITE;
        const CLOSE_NOWRITE = libc::FAN_CLOSE_NOWRITE;
        const OPEN = libc::FAN_OPEN;
        const OPEN_EXEC = libc::FAN_OPEN_EXEC;
        const Q_OVERFLOW = libc::FAN_Q_OVERFLOW;
        const OPEN_PERM = libc::FAN_OPEN_PERM;
        const ACCESS_PERM = libc::FAN_ACCESS_PERM;
        const OPEN_EXEC_PERM = libc::FAN_OPEN_EXEC_PERM;
        const CLOSE = libc::FAN_CLOSE;
    }
}

/// Notification-class events every mark subscribes to.
pub const NOTIFY_EVENTS: EventMask = EventMask::ACCESS
    .union(EventMask::MODIFY)
    .union(EventMask::CLOSE)
    .union(EventMask::OPEN);

/// Permission-class events. A record carrying any of these blocks the
/// requesting process until a response is written.
pub const PERM_EVENTS: EventMask = EventMask::OPEN_PERM
    .union(EventMask::ACCESS_PERM)
    .union(EventMask::OPEN_EXEC_PERM);

impl fmt::Display for EventMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return f.write_str("(none)");
        }
        let mut first = true;
        for (name, _) in self.iter_names() {
            if !first {
                f.write_str("|")?;
            }
            f.write_str(name)?;
            first = false;
        }
        let unnamed = self.bits() & !Self::all().bits();
        if unnamed != 0 {
            if !first {
                f.write_str("|")?;
            }
            write!(f, "{unnamed:#x}")?;
        }
        Ok(())
    }
}

/// Decision written back for a permission-class record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Allow,
    Deny,
}

impl Verdict {
    pub fn code(self) -> u32 {
        match self {
            Verdict::Allow => libc::FAN_ALLOW,
            Verdict::Deny => libc::FAN_DENY,
        }
    }
}

/// Fatal faults in the kernel event stream.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum ProtocolError {
    /// The kernel speaks a different metadata layout than this build;
    /// decoding any further bytes would misread the stream.
    #[error("kernel sent fanotify metadata version {found}, built against {expected}")]
    VersionMismatch { found: u8, expected: u8 },
}

/// One decoded event record.
#[derive(Debug)]
pub struct Event {
    pub mask: EventMask,
    /// Pid of the process that triggered the event.
    pub pid: i32,
    /// Read-only descriptor for the file the event is about, `None` for
    /// queue overflows and other fd-less records. Dropping the record is
    /// what closes it.
    pub fd: Option<OwnedFd>,
}

impl Event {
    /// True when the kernel expects an allow/deny response for this record.
    pub fn needs_response(&self) -> bool {
        self.mask.intersects(PERM_EVENTS)
    }

    pub fn is_overflow(&self) -> bool {
        self.mask.contains(EventMask::Q_OVERFLOW)
    }
}

/// Lazily decode the records inside one chunk read off the event
/// descriptor.
///
/// Framing follows the kernel contract: iteration stops silently at the
/// first incomplete trailing frame (records before it are unaffected),
/// and a well-framed record with a foreign metadata version yields an
/// error and fuses the iterator.
pub fn events(buf: &[u8]) -> Events<'_> {
    Events { buf }
}

pub struct Events<'a> {
    buf: &'a [u8],
}

impl Iterator for Events<'_> {
    type Item = Result<Event, ProtocolError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.buf.len() < METADATA_SIZE {
            return None;
        }
        let meta = unsafe {
            ptr::read_unaligned(self.buf.as_ptr() as *const libc::fanotify_event_metadata)
        };
        let event_len = meta.event_len as usize;
        if event_len < METADATA_SIZE || event_len > self.buf.len() {
            // Torn trailing frame, nothing usable from here on.
            self.buf = &[];
            return None;
        }
        if meta.vers != METADATA_VERSION {
            self.buf = &[];
            return Some(Err(ProtocolError::VersionMismatch {
                found: meta.vers,
                expected: METADATA_VERSION,
            }));
        }
        self.buf = &self.buf[event_len..];
        let fd = (meta.fd >= 0).then(|| unsafe { OwnedFd::from_raw_fd(meta.fd) });
        Some(Ok(Event {
            mask: EventMask::from_bits_retain(meta.mask),
            pid: meta.pid,
            fd,
        }))
    }
}

/// A fanotify notification group. Owns the event descriptor for the life
/// of the process.
#[derive(Debug)]
pub struct Fanotify {
    fd: OwnedFd,
}

impl Fanotify {
    /// Open a new group, see fanotify_init(2). `flags` pick the
    /// notification class and descriptor semantics, `event_f_flags` the
    /// open mode of per-record descriptors.
    pub fn init(flags: libc::c_uint, event_f_flags: libc::c_uint) -> io::Result<Fanotify> {
        let fd = unsafe { libc::fanotify_init(flags, event_f_flags) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Fanotify {
            fd: unsafe { OwnedFd::from_raw_fd(fd) },
        })
    }

    /// Install a mark for `mask` on `path`, see fanotify_mark(2). `flags`
    /// carry the add semantics and the scope (whole filesystem or one
    /// mount).
    pub fn mark(&self, flags: libc::c_uint, mask: EventMask, path: &Path) -> io::Result<()> {
        let path = CString::new(path.as_os_str().as_bytes())
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "path contains NUL byte"))?;
        let res = unsafe {
            libc::fanotify_mark(
                self.fd.as_raw_fd(),
                flags,
                mask.bits(),
                libc::AT_FDCWD,
                path.as_ptr(),
            )
        };
        if res < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// One read from the event descriptor into `buf`. `Ok(None)` means
    /// nothing was pending (would-block) or the stream ended; interrupted
    /// reads are retried in place.
    pub fn read_chunk(&self, buf: &mut [u8]) -> io::Result<Option<usize>> {
        loop {
            let n = unsafe {
                libc::read(
                    self.fd.as_raw_fd(),
                    buf.as_mut_ptr() as *mut libc::c_void,
                    buf.len(),
                )
            };
            if n > 0 {
                return Ok(Some(n as usize));
            }
            if n == 0 {
                return Ok(None);
            }
            let err = io::Error::last_os_error();
            match err.kind() {
                io::ErrorKind::Interrupted => continue,
                io::ErrorKind::WouldBlock => return Ok(None),
                _ => return Err(err),
            }
        }
    }

    /// Write the verdict for one permission record back to the kernel.
    /// `fd` is the record's descriptor, which is what identifies the
    /// pending request.
    pub fn respond(&self, fd: BorrowedFd<'_>, verdict: Verdict) -> io::Result<()> {
        let resp = libc::fanotify_response {
            fd: fd.as_raw_fd(),
            response: verdict.code(),
        };
        let bytes = unsafe {
            std::slice::from_raw_parts(
                &resp as *const libc::fanotify_response as *const u8,
                size_of::<libc::fanotify_response>(),
            )
        };
        loop {
            let n = unsafe {
                libc::write(
                    self.fd.as_raw_fd(),
                    bytes.as_ptr() as *const libc::c_void,
                    bytes.len(),
                )
            };
            if n == bytes.len() as isize {
                return Ok(());
            }
            if n >= 0 {
                return Err(io::Error::new(
                    io::ErrorKind::WriteZero,
                    "short fanotify response write",
                ));
            }
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                return Err(err);
            }
        }
    }
}

impl FromRawFd for Fanotify {
    unsafe fn from_raw_fd(fd: RawFd) -> Self {
        Fanotify {
            fd: OwnedFd::from_raw_fd(fd),
        }
    }
}

impl AsFd for Fanotify {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

impl AsRawFd for Fanotify {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::fd::IntoRawFd;
    use std::slice;

    fn frame(mask: u64, fd: i32, pid: i32, vers: u8) -> Vec<u8> {
        let meta = libc::fanotify_event_metadata {
            event_len: METADATA_SIZE as u32,
            vers,
            reserved: 0,
            metadata_len: METADATA_SIZE as u16,
            mask,
            fd,
            pid,
        };
        unsafe { slice::from_raw_parts(&meta as *const _ as *const u8, METADATA_SIZE) }.to_vec()
    }

    fn socketpair() -> (OwnedFd, OwnedFd) {
        let mut fds = [0; 2];
        let res = unsafe {
            libc::socketpair(
                libc::AF_UNIX,
                libc::SOCK_STREAM | libc::SOCK_NONBLOCK,
                0,
                fds.as_mut_ptr(),
            )
        };
        assert_eq!(res, 0);
        unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) }
    }

    #[test]
    fn decodes_frames_in_order() {
        let mut buf = frame(libc::FAN_OPEN, libc::FAN_NOFD, 11, METADATA_VERSION);
        buf.extend(frame(libc::FAN_MODIFY, libc::FAN_NOFD, 22, METADATA_VERSION));
        buf.extend(frame(libc::FAN_CLOSE_WRITE, libc::FAN_NOFD, 33, METADATA_VERSION));

        let decoded: Vec<_> = events(&buf).map(|e| e.unwrap()).collect();
        assert_eq!(decoded.len(), 3);
        assert_eq!(decoded[0].pid, 11);
        assert_eq!(decoded[1].pid, 22);
        assert_eq!(decoded[2].pid, 33);
        assert_eq!(decoded[0].mask, EventMask::OPEN);
        assert!(decoded.iter().all(|e| e.fd.is_none()));
    }

    #[test]
    fn skips_by_event_len_not_header_size() {
        let mut first = frame(libc::FAN_OPEN, libc::FAN_NOFD, 1, METADATA_VERSION);
        first[0..4].copy_from_slice(&((METADATA_SIZE + 8) as u32).to_ne_bytes());
        first.extend_from_slice(&[0xAA; 8]);
        let mut buf = first;
        buf.extend(frame(libc::FAN_MODIFY, libc::FAN_NOFD, 2, METADATA_VERSION));

        let decoded: Vec<_> = events(&buf).map(|e| e.unwrap()).collect();
        assert_eq!(decoded.len(), 2);
        assert_eq!(decoded[1].pid, 2);
    }

    #[test]
    fn truncated_trailing_frame_stops_silently() {
        let mut buf = frame(libc::FAN_OPEN, libc::FAN_NOFD, 1, METADATA_VERSION);
        buf.extend(frame(libc::FAN_MODIFY, libc::FAN_NOFD, 2, METADATA_VERSION));
        // Third frame arrives torn mid-header.
        buf.extend(&frame(libc::FAN_ACCESS, libc::FAN_NOFD, 3, METADATA_VERSION)[..10]);

        let mut iter = events(&buf);
        assert_eq!(iter.next().unwrap().unwrap().pid, 1);
        assert_eq!(iter.next().unwrap().unwrap().pid, 2);
        assert!(iter.next().is_none());
        assert!(iter.next().is_none());
    }

    #[test]
    fn overlong_declared_len_stops_silently() {
        let mut buf = frame(libc::FAN_OPEN, libc::FAN_NOFD, 1, METADATA_VERSION);
        let mut torn = frame(libc::FAN_MODIFY, libc::FAN_NOFD, 2, METADATA_VERSION);
        torn[0..4].copy_from_slice(&((METADATA_SIZE + 64) as u32).to_ne_bytes());
        buf.extend(torn);

        let decoded: Vec<_> = events(&buf).collect();
        assert_eq!(decoded.len(), 1);
        assert_eq!(decoded[0].as_ref().unwrap().pid, 1);
    }

    #[test]
    fn undersized_declared_len_stops_silently() {
        let mut buf = frame(libc::FAN_OPEN, libc::FAN_NOFD, 1, METADATA_VERSION);
        let mut bad = frame(libc::FAN_MODIFY, libc::FAN_NOFD, 2, METADATA_VERSION);
        bad[0..4].copy_from_slice(&8u32.to_ne_bytes());
        buf.extend(bad);

        let decoded: Vec<_> = events(&buf).collect();
        assert_eq!(decoded.len(), 1);
        assert!(decoded[0].is_ok());
    }

    #[test]
    fn foreign_version_is_fatal_and_fuses() {
        let mut buf = frame(libc::FAN_OPEN, libc::FAN_NOFD, 1, METADATA_VERSION);
        buf.extend(frame(libc::FAN_MODIFY, libc::FAN_NOFD, 2, METADATA_VERSION + 1));
        buf.extend(frame(libc::FAN_ACCESS, libc::FAN_NOFD, 3, METADATA_VERSION));

        let mut iter = events(&buf);
        assert!(iter.next().unwrap().is_ok());
        assert_eq!(
            iter.next().unwrap().unwrap_err(),
            ProtocolError::VersionMismatch {
                found: METADATA_VERSION + 1,
                expected: METADATA_VERSION,
            }
        );
        // Fused: the in-order frame behind the bad one is not decoded.
        assert!(iter.next().is_none());
    }

    #[test]
    fn overflow_record_has_no_descriptor() {
        let buf = frame(libc::FAN_Q_OVERFLOW, libc::FAN_NOFD, 0, METADATA_VERSION);
        let event = events(&buf).next().unwrap().unwrap();
        assert!(event.fd.is_none());
        assert!(event.is_overflow());
        assert!(!event.needs_response());
    }

    #[test]
    fn perm_masks_need_responses() {
        for mask in [
            libc::FAN_OPEN_PERM,
            libc::FAN_ACCESS_PERM,
            libc::FAN_OPEN_EXEC_PERM,
        ] {
            let buf = frame(mask, libc::FAN_NOFD, 1, METADATA_VERSION);
            assert!(events(&buf).next().unwrap().unwrap().needs_response());
        }
        let buf = frame(libc::FAN_OPEN, libc::FAN_NOFD, 1, METADATA_VERSION);
        assert!(!events(&buf).next().unwrap().unwrap().needs_response());
    }

    #[test]
    fn read_chunk_reports_would_block_as_no_frames() {
        let (a, b) = socketpair();
        let fan = unsafe { Fanotify::from_raw_fd(a.into_raw_fd()) };
        let mut buf = [0u8; 256];

        assert!(fan.read_chunk(&mut buf).unwrap().is_none());

        let payload = frame(libc::FAN_OPEN, libc::FAN_NOFD, 7, METADATA_VERSION);
        let n = unsafe {
            libc::write(
                b.as_raw_fd(),
                payload.as_ptr() as *const libc::c_void,
                payload.len(),
            )
        };
        assert_eq!(n as usize, payload.len());
        assert_eq!(fan.read_chunk(&mut buf).unwrap(), Some(payload.len()));

        drop(b);
        assert!(fan.read_chunk(&mut buf).unwrap().is_none());
    }

    #[test]
    fn respond_writes_one_wire_record() {
        let (a, b) = socketpair();
        let fan = unsafe { Fanotify::from_raw_fd(a.into_raw_fd()) };

        fan.respond(b.as_fd(), Verdict::Deny).unwrap();

        let mut raw = [0u8; size_of::<libc::fanotify_response>() + 1];
        let n = unsafe {
            libc::read(
                b.as_raw_fd(),
                raw.as_mut_ptr() as *mut libc::c_void,
                raw.len(),
            )
        };
        // Exactly one response record on the wire.
        assert_eq!(n as usize, size_of::<libc::fanotify_response>());
        let resp = unsafe { ptr::read_unaligned(raw.as_ptr() as *const libc::fanotify_response) };
        assert_eq!(resp.fd, b.as_raw_fd());
        assert_eq!(resp.response, libc::FAN_DENY);
        assert_eq!(Verdict::Allow.code(), libc::FAN_ALLOW);
    }

    #[test]
    fn mask_renders_symbolically() {
        let mask = EventMask::OPEN | EventMask::ACCESS;
        let shown = mask.to_string();
        assert!(shown.contains("OPEN"));
        assert!(shown.contains("ACCESS"));
        assert_eq!(EventMask::empty().to_string(), "(none)");
        let unknown = EventMask::from_bits_retain(1 << 40);
        assert!(unknown.to_string().contains("0x"));
    }
}
