//! Serve command: the long-running report pipeline.
//!
//! Reads `{"employeeCode": .., "report": {..}}` JSON lines from stdin and
//! handles each on its own task with its own database connection, printing
//! one reply line per request. Two background loops run alongside: the
//! offline sweep and raw-event retention cleanup. Live updates go to the
//! [`LiveHub`], and to a JSONL feed file when configured.
//!
//! Input EOF or Ctrl-C stops accepting requests; in-flight requests run to
//! completion before the background loops are stopped.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};
use ws_core::{EmployeeCode, LiveView};
use ws_db::{Database, EngineSettings, Report};

use crate::Config;
use crate::live::{LiveHub, LiveMessage, write_feed};

use super::report;

/// One line of serve input.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Request {
    employee_code: EmployeeCode,
    #[serde(default)]
    report: Report,
    /// Receive time override; server time when absent.
    #[serde(default)]
    at: Option<DateTime<Utc>>,
}

struct Handled {
    line: String,
    live: Option<LiveView>,
}

fn open(path: &Path, settings: EngineSettings) -> Result<Database> {
    Ok(Database::open(path)
        .with_context(|| format!("failed to open {}", path.display()))?
        .with_settings(settings))
}

/// Handles one input line; always produces a reply line.
fn handle_line(path: &Path, settings: EngineSettings, seq: u64, line: &str) -> Handled {
    let request: Request = match serde_json::from_str(line) {
        Ok(request) => request,
        Err(err) => {
            return Handled {
                line: json!({
                    "seq": seq,
                    "reply": {"ok": false, "error": "invalid_request", "message": err.to_string(), "httpStatus": 400},
                })
                .to_string(),
                live: None,
            };
        }
    };

    let now = request.at.unwrap_or_else(Utc::now);
    let result = open(path, settings)
        .and_then(|mut db| report::handle(&mut db, &request.employee_code, &request.report, now));
    match result {
        Ok(reply) => Handled {
            line: json!({
                "seq": seq,
                "employeeCode": request.employee_code,
                "reply": reply.body,
            })
            .to_string(),
            live: reply.live,
        },
        Err(err) => {
            warn!(seq, error = %err, "request failed");
            Handled {
                line: json!({
                    "seq": seq,
                    "employeeCode": request.employee_code,
                    "reply": {"ok": false, "error": "storage_error", "message": format!("{err:#}"), "httpStatus": 500},
                })
                .to_string(),
                live: None,
            }
        }
    }
}

/// Runs `job` on the blocking pool every `period` until shutdown.
async fn periodic<F>(
    name: &'static str,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
    job: F,
) where
    F: Fn() -> Result<Value> + Clone + Send + 'static,
{
    if period.is_zero() {
        warn!(task = name, "interval is zero, background task disabled");
        return;
    }
    info!(task = name, period_secs = period.as_secs(), "background task started");
    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                info!(task = name, "background task stopping");
                return;
            }
            () = tokio::time::sleep(period) => {}
        }

        match tokio::task::spawn_blocking(job.clone()).await {
            Ok(Ok(outcome)) => debug!(task = name, %outcome, "background task ran"),
            Ok(Err(err)) => error!(task = name, error = ?err, "background task failed"),
            Err(err) => error!(task = name, error = %err, "background task panicked"),
        }
    }
}

/// Tells the background loops to stop. Loops disabled by a zero interval have
/// already dropped their receivers.
fn signal_shutdown(shutdown: &watch::Sender<bool>) -> bool {
    let delivered = shutdown.send(true).is_ok();
    if !delivered {
        debug!("background tasks already stopped");
    }
    delivered
}

async fn serve(config: &Config, settings: EngineSettings) -> Result<()> {
    // Create the schema once before concurrent connections open it
    drop(open(&config.database_path, settings)?);
    let path: Arc<PathBuf> = Arc::new(config.database_path.clone());

    let hub = Arc::new(LiveHub::new(config.live_send_timeout()));
    let feed = match &config.live_feed_path {
        Some(feed_path) => {
            let (id, rx) = hub.add();
            let snapshot_db = open(&path, settings)?;
            let now = Utc::now();
            let items = snapshot_db.live_snapshot(now)?;
            hub.send(id, LiveMessage::Snapshot { items, time: now }).await;
            Some((id, tokio::spawn(write_feed(rx, feed_path.clone()))))
        }
        None => None,
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let sweep = tokio::spawn(periodic("offline_sweep", config.sweep_interval(), shutdown_rx.clone(), {
        let path = Arc::clone(&path);
        move || {
            let mut db = open(&path, settings)?;
            Ok(serde_json::to_value(db.sweep_offline(Utc::now())?)?)
        }
    }));
    let retention_days = config.raw_event_retention_days;
    let cleanup = tokio::spawn(periodic("raw_event_cleanup", config.cleanup_interval(), shutdown_rx, {
        let path = Arc::clone(&path);
        move || {
            let db = open(&path, settings)?;
            Ok(json!({ "deleted": db.cleanup_raw_events(Utc::now(), retention_days)? }))
        }
    }));

    info!(database = %path.display(), "serving reports from stdin");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut tasks = JoinSet::new();
    let mut seq = 0_u64;
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        let line = tokio::select! {
            line = lines.next_line() => line.context("failed to read stdin")?,
            _ = &mut ctrl_c => {
                info!("interrupt received, no longer accepting requests");
                None
            }
        };
        let Some(line) = line else { break };
        if line.trim().is_empty() {
            continue;
        }
        seq += 1;

        let path = Arc::clone(&path);
        let hub = Arc::clone(&hub);
        tasks.spawn(async move {
            let handled =
                tokio::task::spawn_blocking(move || handle_line(&path, settings, seq, &line)).await;
            match handled {
                Ok(handled) => {
                    println!("{}", handled.line);
                    if let Some(item) = handled.live {
                        let delivery = hub
                            .broadcast(&LiveMessage::Update { item, time: Utc::now() })
                            .await;
                        debug!(seq, ?delivery, "live update broadcast");
                    }
                }
                Err(err) => error!(seq, error = %err, "request task panicked"),
            }
        });
    }

    while let Some(joined) = tasks.join_next().await {
        if let Err(err) = joined {
            error!(error = %err, "request task failed");
        }
    }

    signal_shutdown(&shutdown_tx);
    for (name, handle) in [("offline_sweep", sweep), ("raw_event_cleanup", cleanup)] {
        if let Err(err) = handle.await {
            error!(task = name, error = %err, "background task failed to stop");
        }
    }
    if let Some((id, writer)) = feed {
        hub.remove(id);
        match writer.await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => error!(error = ?err, "live feed failed"),
            Err(err) => error!(error = %err, "live feed task panicked"),
        }
    }
    info!(requests = seq, "serve stopped");
    Ok(())
}

/// Runs the report server until stdin closes or Ctrl-C.
pub fn run(config: &Config) -> Result<()> {
    let settings = config.engine_settings()?;
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to start async runtime")?;
    runtime.block_on(serve(config, settings))
}
