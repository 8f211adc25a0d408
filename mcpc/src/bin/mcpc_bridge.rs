//! Bridge daemon entry point.
//!
//! Spawned detached by the CLI with the session's [`BridgeConfig`] written to
//! stdin as one JSON line. Once the socket is bound and accepting, a single
//! `ready` line goes out on stdout and the parent stops waiting; stderr is
//! already redirected to the bridge log by the parent.

use std::io::Write as _;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::io::AsyncBufReadExt;

use mcpc::bridge::{self, BridgeConfig};
use mcpc::paths::{self, McpcHome};
use mcpc::secrets::KeyringSecretStore;

#[tokio::main]
async fn main() -> ExitCode {
    let session_arg = match parse_args() {
        Ok(session) => session,
        Err(err) => {
            eprintln!("error: {err}");
            return ExitCode::from(1);
        }
    };

    match run(session_arg).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            // Stderr is the bridge log at this point.
            eprintln!("error: {err:#}");
            let code = err
                .downcast_ref::<mcpc::Error>()
                .map(|e| e.exit_code())
                .unwrap_or(1);
            ExitCode::from(code as u8)
        }
    }
}

async fn run(session_arg: Option<String>) -> Result<()> {
    let config = read_config().await?;
    if let Some(session) = &session_arg
        && session != &config.session_name
    {
        anyhow::bail!(
            "--session {session} does not match configured session {}",
            config.session_name
        );
    }

    let home = McpcHome::resolve()?;
    home.ensure_layout()?;

    let verbose = config.verbose || paths::verbose_enabled();
    let log_writer =
        mcpc::logging::init_bridge_tracing(home.bridge_log_path(&config.session_name), verbose)?;

    let secrets = Arc::new(KeyringSecretStore::default());
    let result = bridge::run(home, secrets, config, || {
        // The readiness token, then never touch stdout again.
        println!("ready");
        let _ = std::io::stdout().flush();
    })
    .await;

    log_writer.flush();
    result.context("bridge terminated")
}

/// One JSON line on stdin carries the whole startup config.
async fn read_config() -> Result<BridgeConfig> {
    let stdin = tokio::io::BufReader::new(tokio::io::stdin());
    let mut lines = stdin.lines();
    let line = lines
        .next_line()
        .await
        .context("read bridge config from stdin")?
        .context("bridge config missing on stdin")?;
    serde_json::from_str(&line).context("parse bridge config")
}

fn parse_args() -> Result<Option<String>, String> {
    let mut session = None;
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--session" => {
                let value = args.next().ok_or("--session requires a value")?;
                session = Some(value);
            }
            "--help" | "-h" => {
                print_usage_and_exit(0);
            }
            other => return Err(format!("unknown argument `{other}`")),
        }
    }
    Ok(session)
}

fn print_usage_and_exit(code: i32) -> ! {
    println!(
        "usage: mcpc-bridge [--session @name]\n\n\
         Internal daemon spawned by mcpc. Reads its JSON config from stdin,\n\
         prints `ready` on stdout once its socket accepts connections."
    );
    std::process::exit(code);
}
