#![forbid(unsafe_code)]

//! Security helpers for the server binary.

use anyhow::{Result, bail};
use nix::unistd::Uid;

/// Fails fast when the server is started as root. The proxy terminates
/// arbitrary remote URLs and should run under an unprivileged account.
pub fn ensure_not_root(process: &str) -> Result<()> {
    if Uid::current().is_root() {
        bail!("{process} must not be run as root; use an unprivileged service account");
    }
    Ok(())
}
