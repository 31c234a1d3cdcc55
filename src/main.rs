use anyhow::Context;
use log::info;

use crate::event::run;
use crate::hardening::deny_debuggers;
use crate::setup::{check_permission, init_fanotify, Config};

mod event;
mod fanotify;
mod filter;
mod hardening;
mod pidinfo;
mod setup;

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), anyhow::Error> {
    // Parse before the privilege gate so --help works unprivileged.
    let cfg = Config::parse();
    env_logger::init();
    check_permission();
    if cfg.nodebug {
        deny_debuggers().context("debugger lockout failed")?;
    }
    let fan = init_fanotify(&cfg)?;
    run(fan, &cfg).await?;
    info!("Exiting...");
    Ok(())
}
