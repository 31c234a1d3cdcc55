//! Best-effort process lookups under /proc for event enrichment.

use std::fmt;
use std::fs;
use std::io::Read;
use std::os::unix::fs::MetadataExt;

use bytes::BytesMut;
use log::debug;
use users::{get_group_by_gid, get_user_by_uid};

const SCRATCH_SIZE: usize = 4096;

/// Reads process metadata out of /proc, reusing one scratch buffer across
/// records. The scratch is zero-wiped before every snapshot is handed
/// back, so command-line bytes never linger past their record.
pub struct ProcReader {
    scratch: BytesMut,
}

/// What was known about a pid at the moment its record was handled.
pub struct Snapshot {
    pub pid: i32,
    /// `None` when the process was already gone (or the pid never named
    /// one); rendered as expired.
    pub detail: Option<Detail>,
}

pub struct Detail {
    pub cmdline: String,
    pub user: Option<String>,
    pub group: Option<String>,
    /// Kernel stack, readable by root only; skipped silently otherwise.
    pub stack: Option<String>,
}

impl ProcReader {
    pub fn new() -> Self {
        ProcReader {
            scratch: BytesMut::zeroed(SCRATCH_SIZE),
        }
    }

    /// One look at /proc/<pid>. The process may exit between the event
    /// and this read; that is an expired snapshot, not an error.
    pub fn snapshot(&mut self, pid: i32) -> Snapshot {
        let detail = self.read_detail(pid);
        self.scratch.fill(0);
        Snapshot { pid, detail }
    }

    fn read_detail(&mut self, pid: i32) -> Option<Detail> {
        if pid <= 0 {
            return None;
        }
        let n = self.read_proc(&format!("/proc/{pid}/cmdline"))?;
        for b in &mut self.scratch[..n] {
            if *b == 0 {
                *b = b' ';
            }
        }
        let cmdline = String::from_utf8_lossy(&self.scratch[..n])
            .trim_end()
            .to_string();
        let (user, group) = owner_names(pid);
        let stack = match self.read_proc(&format!("/proc/{pid}/stack")) {
            Some(n) => Some(String::from_utf8_lossy(&self.scratch[..n]).into_owned()),
            None => {
                debug!("kernel stack of pid {pid} not readable");
                None
            }
        };
        Some(Detail {
            cmdline,
            user,
            group,
            stack,
        })
    }

    fn read_proc(&mut self, path: &str) -> Option<usize> {
        let mut file = fs::File::open(path).ok()?;
        file.read(&mut self.scratch).ok()
    }
}

impl Default for ProcReader {
    fn default() -> Self {
        Self::new()
    }
}

fn owner_names(pid: i32) -> (Option<String>, Option<String>) {
    let Ok(meta) = fs::metadata(format!("/proc/{pid}")) else {
        return (None, None);
    };
    let user = match get_user_by_uid(meta.uid()) {
        None => format!("{}", meta.uid()),
        Some(name) => name.name().to_string_lossy().to_string(),
    };
    let group = match get_group_by_gid(meta.gid()) {
        None => format!("{}", meta.gid()),
        Some(name) => name.name().to_string_lossy().to_string(),
    };
    (Some(user), Some(group))
}

impl fmt::Display for Snapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let Some(detail) = &self.detail else {
            return writeln!(f, "pid: {} (expired)", self.pid);
        };
        writeln!(f, "pid: {}", self.pid)?;
        if let (Some(user), Some(group)) = (&detail.user, &detail.group) {
            writeln!(f, "user: {user} group: {group}")?;
        }
        writeln!(f, "command line: {}", detail.cmdline)?;
        if let Some(stack) = &detail.stack {
            writeln!(f, "stack:")?;
            write!(f, "{stack}")?;
        }
        Ok(())
    }
}
