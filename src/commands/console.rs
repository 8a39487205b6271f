use anyhow::{Context, Result};
use std::io::Write;
use std::time::Duration;
use tracing::info;

use crate::cli::ConsoleArgs;
use crate::readiness::read_until;

/// Wait for `--signature` on a console socket and dump what was read.
pub async fn cmd_console(args: ConsoleArgs) -> Result<()> {
    info!(path = %args.path.display(), "sandvm console");

    let transcript = read_until(
        &args.path,
        &args.signature,
        Duration::from_secs(args.timeout),
        Duration::from_millis(args.poll_interval_ms),
    )
    .await
    .with_context(|| format!("watching console {}", args.path.display()))?;

    let mut stdout = std::io::stdout().lock();
    stdout
        .write_all(transcript.as_bytes())
        .context("writing console transcript")?;
    stdout.flush()?;
    Ok(())
}
