use std::path::PathBuf;
use std::process;

use anyhow::Context;
use clap::{Parser, ValueEnum};
use log::info;

use crate::fanotify::{EventMask, Fanotify, Verdict, NOTIFY_EVENTS, PERM_EVENTS};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// directory whose accesses are reported, matched as a substring of
    /// each resolved path
    #[arg(short, long)]
    path: PathBuf,
    /// gate matching accesses and answer them with this verdict
    #[arg(long, value_enum)]
    permission: Option<VerdictArg>,
    /// verdict for gated accesses outside the watched path
    #[arg(long, value_enum, default_value = "allow")]
    unmatched: VerdictArg,
    /// print /proc details of the process behind each event
    #[arg(long, default_value_t = false)]
    pidinfo: bool,
    /// mark only the mount containing the path, not the whole filesystem
    #[arg(long, default_value_t = false)]
    mount: bool,
    /// lock debuggers out of this process
    #[arg(long, default_value_t = false)]
    nodebug: bool,
}

#[derive(ValueEnum, Debug, Clone, Copy)]
pub enum VerdictArg {
    Allow,
    Deny,
}

impl From<VerdictArg> for Verdict {
    fn from(arg: VerdictArg) -> Self {
        match arg {
            VerdictArg::Allow => Verdict::Allow,
            VerdictArg::Deny => Verdict::Deny,
        }
    }
}

/// Everything the event loop needs to know, fixed at startup.
#[derive(Debug)]
pub struct Config {
    pub path: PathBuf,
    /// Lossy string form of `path`, what the filter compares against.
    pub target: String,
    /// `Some` puts the group in permission mode and answers matching
    /// requests with this verdict.
    pub verdict: Option<Verdict>,
    /// Answer for permission requests that fall outside the watch path.
    pub unmatched: Verdict,
    pub pidinfo: bool,
    pub mount: bool,
    pub nodebug: bool,
    /// Our own pid; events this process causes are dropped on sight to
    /// keep the monitor from feeding on itself.
    pub self_pid: i32,
}

impl Config {
    pub fn parse() -> Config {
        Config::from(Args::parse())
    }
}

impl From<Args> for Config {
    fn from(args: Args) -> Config {
        let target = args.path.to_string_lossy().into_owned();
        Config {
            path: args.path,
            target,
            verdict: args.permission.map(Verdict::from),
            unmatched: args.unmatched.into(),
            pidinfo: args.pidinfo,
            mount: args.mount,
            nodebug: args.nodebug,
            self_pid: process::id() as i32,
        }
    }
}

pub fn check_permission() {
    if unsafe { libc::geteuid() } != 0 {
        eprintln!("fanotify_init needs CAP_SYS_ADMIN, run as the root user.");
        process::exit(1);
    }
}

const INIT_FLAGS: libc::c_uint =
    libc::FAN_CLOEXEC | libc::FAN_CLASS_PRE_CONTENT | libc::FAN_NONBLOCK;
const EVENT_F_FLAGS: libc::c_uint = (libc::O_RDONLY | libc::O_LARGEFILE) as libc::c_uint;

fn mark_mask(permission: bool) -> EventMask {
    let mut mask = NOTIFY_EVENTS;
    if permission {
        mask |= PERM_EVENTS;
    }
    mask
}

/// Open the notification group and install the mark described by `cfg`.
pub fn init_fanotify(cfg: &Config) -> anyhow::Result<Fanotify> {
    let fan = Fanotify::init(INIT_FLAGS, EVENT_F_FLAGS).context("fanotify_init failed")?;
    let scope = match cfg.mount {
        true => libc::FAN_MARK_MOUNT,
        false => libc::FAN_MARK_FILESYSTEM,
    };
    let mask = mark_mask(cfg.verdict.is_some());
    fan.mark(libc::FAN_MARK_ADD | scope, mask, &cfg.path)
        .with_context(|| format!("cannot mark {}", cfg.path.display()))?;
    info!("watching {} for {}", cfg.path.display(), mask);
    Ok(fan)
}
