use std::io;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd};
use std::path::{Path, PathBuf};

use anyhow::Context;
use bytes::BytesMut;
use log::{debug, info, warn};
use prettytable::{color, row, Attr, Cell, Row, Table};
use tokio::io::unix::AsyncFd;
use tokio::io::{stdin, AsyncBufReadExt, BufReader, Interest};
use tokio::signal;

use crate::fanotify::{events, Event, Fanotify, Verdict};
use crate::filter::path_matches;
use crate::pidinfo::ProcReader;
use crate::setup::Config;

const EVENT_BUF_SIZE: usize = 4096;

/// What became of one record, for the debug log and the tests.
#[derive(Debug, PartialEq, Eq)]
pub enum Disposition {
    /// Caused by this process itself, dropped unseen.
    SelfSkipped,
    /// Carried no descriptor (queue overflow and friends).
    NoDescriptor,
    Handled {
        matched: bool,
        /// The response written, `None` for plain notifications.
        verdict: Option<Verdict>,
        path: Option<PathBuf>,
    },
}

/// Name the file behind an event descriptor through our own fd table.
fn resolve_target(fd: BorrowedFd<'_>) -> io::Result<PathBuf> {
    std::fs::read_link(format!("/proc/self/fd/{}", fd.as_raw_fd()))
}

/// Take one record through its whole life: self check, path resolution,
/// filter, audit output, response. The record's descriptor dies with the
/// record when it is dropped at the end, on every path.
pub fn dispatch(
    fan: &Fanotify,
    cfg: &Config,
    reader: &mut ProcReader,
    event: Event,
) -> anyhow::Result<Disposition> {
    if event.pid == cfg.self_pid {
        // Our own /proc reads and audit writes come back as events;
        // answering or printing them would feed the loop.
        return Ok(Disposition::SelfSkipped);
    }
    let Some(event_fd) = event.fd.as_ref() else {
        if event.is_overflow() {
            warn!("event queue overflowed, the kernel dropped records");
        }
        return Ok(Disposition::NoDescriptor);
    };

    let path = match resolve_target(event_fd.as_fd()) {
        Ok(path) => Some(path),
        Err(err) => {
            warn!("cannot resolve event fd {}: {err}", event_fd.as_raw_fd());
            None
        }
    };
    let matched = path
        .as_ref()
        .map(|p| path_matches(&p.to_string_lossy(), &cfg.target))
        .unwrap_or(false);

    let verdict = match event.needs_response() {
        false => None,
        true => match (matched, cfg.verdict) {
            (true, Some(v)) => Some(v),
            _ => Some(cfg.unmatched),
        },
    };

    if matched {
        if let Some(path) = &path {
            print_event(path, &event, verdict);
            if cfg.pidinfo {
                print!("{}", reader.snapshot(event.pid));
            }
        }
    }

    if let Some(verdict) = verdict {
        fan.respond(event_fd.as_fd(), verdict)
            .context("writing fanotify response")?;
    }

    debug!(
        "pid {} mask {} matched {matched}",
        event.pid, event.mask
    );
    Ok(Disposition::Handled {
        matched,
        verdict,
        path,
    })
}

fn print_event(path: &Path, event: &Event, verdict: Option<Verdict>) {
    let mut table = Table::new();
    table.set_titles(row!["action", "pid", "mask", "path"]);
    table.add_row(Row::new(vec![
        match verdict {
            Some(Verdict::Deny) => {
                Cell::new("Denied").with_style(Attr::ForegroundColor(color::RED))
            }
            Some(Verdict::Allow) => {
                Cell::new("Allowed").with_style(Attr::ForegroundColor(color::GREEN))
            }
            None => Cell::new("Observed").with_style(Attr::ForegroundColor(color::BLUE)),
        },
        Cell::new(format!("{}", event.pid).as_str())
            .with_style(Attr::ForegroundColor(color::BRIGHT_YELLOW)),
        Cell::new(format!("{} ({:#x})", event.mask, event.mask.bits()).as_str())
            .with_style(Attr::ForegroundColor(color::BRIGHT_WHITE)),
        Cell::new(path.to_string_lossy().as_ref())
            .with_style(Attr::ForegroundColor(color::BRIGHT_WHITE)),
    ]));
    table.print_tty(true).unwrap();
}

/// Pull everything the descriptor has pending and dispatch it. Returns
/// once the descriptor would block, so one readiness edge is consumed
/// completely.
pub fn drain(
    fan: &Fanotify,
    cfg: &Config,
    reader: &mut ProcReader,
    buf: &mut BytesMut,
) -> anyhow::Result<()> {
    while let Some(n) = fan.read_chunk(buf).context("reading fanotify events")? {
        for decoded in events(&buf[..n]) {
            dispatch(fan, cfg, reader, decoded?)?;
        }
    }
    Ok(())
}

/// Event loop: drain the group on every readable edge, quit on a line of
/// stdin, stdin closing, or Ctrl-C.
pub async fn run(fan: Fanotify, cfg: &Config) -> anyhow::Result<()> {
    let notify = AsyncFd::with_interest(fan, Interest::READABLE)?;
    let mut reader = ProcReader::new();
    let mut buf = BytesMut::zeroed(EVENT_BUF_SIZE);
    let mut lines = BufReader::new(stdin()).lines();
    info!("press Enter (or Ctrl-C) to quit");
    loop {
        tokio::select! {
            guard = notify.readable() => {
                let mut guard = guard?;
                drain(notify.get_ref(), cfg, &mut reader, &mut buf)?;
                guard.clear_ready();
            }
            line = lines.next_line() => {
                line.context("reading stdin")?;
                break;
            }
            res = signal::ctrl_c() => {
                res?;
                break;
            }
        }
    }
    Ok(())
}
