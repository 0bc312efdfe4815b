mod attendance;
mod calendar;
mod clock;
mod config;
mod db;
mod enrollment;
mod error;
mod ipc;
mod ledger;
mod model;
mod payments;
mod permissions;
mod quota;
mod renewal;
mod schedule;
mod status;
mod store;
#[cfg(test)]
mod testkit;

use std::io::{self, BufRead, Write};

use tracing_subscriber::EnvFilter;

fn init_logging() {
    let filter = EnvFilter::try_from_env("ACADEMYD_LOG")
        .unwrap_or_else(|_| EnvFilter::new("academyd=info"));
    // stdout carries the protocol.
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_target(false)
        .init();
}

fn main() {
    init_logging();

    let mut state = ipc::AppState {
        workspace: None,
        db: None,
        clock: clock::from_env(),
    };
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "academyd started");

    let stdin = io::stdin();
    let mut stdout = io::stdout();

    for line in stdin.lock().lines() {
        let line = match line {
            Ok(v) => v,
            Err(e) => {
                tracing::error!(error = %e, "stdin read failed");
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        let resp = match serde_json::from_str::<ipc::Request>(&line) {
            Ok(req) => ipc::handle_request(&mut state, req),
            Err(e) => {
                tracing::warn!(error = %e, "unparseable request");
                // No id to echo back.
                ipc::error::err("", "bad_json", e.to_string(), None)
            }
        };
        let _ = writeln!(
            stdout,
            "{}",
            serde_json::to_string(&resp).unwrap_or_else(|_| "{\"success\":false}".to_string())
        );
        let _ = stdout.flush();
    }
}
