use anyhow::{Context, Result};
use std::fmt::Write as FmtWrite;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{info, warn};

use crate::core::Core;
use crate::pool::{ConnectionInfo, PoolEvent, PoolMetrics, PooledConnection};

/// How command results are printed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Text,
    Json,
}

impl OutputFormat {
    pub fn from_json_flag(json: bool) -> Self {
        if json {
            OutputFormat::Json
        } else {
            OutputFormat::Text
        }
    }
}

/// Format a millisecond duration for humans (e.g. "1m 05s", "250ms")
pub fn format_duration_ms(ms: u64) -> String {
    if ms < 1_000 {
        return format!("{}ms", ms);
    }
    let secs = ms / 1_000;
    if secs < 60 {
        return format!("{}.{}s", secs, (ms % 1_000) / 100);
    }
    let mins = secs / 60;
    if mins < 60 {
        return format!("{}m {:02}s", mins, secs % 60);
    }
    format!("{}h {:02}m", mins / 60, mins % 60)
}

/// Render pool metrics as a plain text block
pub fn render_metrics(metrics: &PoolMetrics) -> String {
    let mut out = String::with_capacity(256);
    let _ = writeln!(
        out,
        "connections: {} total, {} active (min {}, max {})",
        metrics.total_connections,
        metrics.active_connections,
        metrics.min_connections,
        metrics.max_connections
    );
    let _ = writeln!(
        out,
        "uses: {}  probe errors: {}  pending: {}",
        metrics.total_use_count, metrics.total_errors, metrics.pending_creations
    );

    if metrics.breakers.is_empty() {
        let _ = writeln!(out, "breakers: none");
        return out;
    }

    let _ = writeln!(out, "breakers:");
    for b in &metrics.breakers {
        let _ = writeln!(
            out,
            "  {:<40} {:<9} failures={} ok={}/{} rejected={} for {}{}",
            b.endpoint,
            b.state.name(),
            b.failure_count,
            b.total_successes,
            b.total_requests,
            b.rejected,
            format_duration_ms(b.time_in_state_ms),
            b.since_last_failure_ms
                .map(|ms| format!(", last failure {} ago", format_duration_ms(ms)))
                .unwrap_or_default()
        );
    }
    out
}

pub fn render_connected(conn: &PooledConnection) -> String {
    format!(
        "Connected to {} (id {}, age {})",
        conn.endpoint(),
        conn.id(),
        format_duration_ms(conn.age().as_millis() as u64)
    )
}

pub fn render_connections(connections: &[ConnectionInfo]) -> String {
    let mut out = String::new();
    for c in connections {
        let _ = writeln!(
            out,
            "  {} {:<40} {} uses={} idle={} age={}",
            c.id,
            c.endpoint,
            if c.is_connected { "up  " } else { "down" },
            c.use_count,
            format_duration_ms(c.idle_ms),
            format_duration_ms(c.age_ms)
        );
    }
    out
}

fn render_event(event: &PoolEvent) -> String {
    match event {
        PoolEvent::ConnectionCreated { id, endpoint } => format!("+ {} {}", id, endpoint),
        PoolEvent::ConnectionClosed {
            id,
            endpoint,
            reason,
        } => format!("- {} {} ({})", id, endpoint, reason),
    }
}

async fn print_metrics(core: &Core, format: OutputFormat) -> Result<()> {
    let metrics = core.pool.get_metrics().await;
    match format {
        OutputFormat::Json => {
            println!(
                "{}",
                serde_json::to_string(&metrics).context("Failed to serialize metrics")?
            );
        }
        OutputFormat::Text => {
            print!("{}", render_metrics(&metrics));
            print!("{}", render_connections(&core.pool.connections().await));
        }
    }
    Ok(())
}

/// Warm the pool from config, print metrics, shut down
pub async fn cmd_warm(core: &Core, format: OutputFormat) -> Result<()> {
    let created = core.warm().await.context("Failed to initialize pool")?;
    if format == OutputFormat::Text {
        println!(
            "Warmed {} connection(s) across {} endpoint(s)",
            created,
            core.config.endpoints.len()
        );
    }
    print_metrics(core, format).await?;
    core.shutdown().await;
    Ok(())
}

/// Open one connection to `endpoint`, print it, shut down
pub async fn cmd_connect(core: &Core, endpoint: &str, format: OutputFormat) -> Result<()> {
    let result = core.connect(endpoint).await;

    let outcome = match result {
        Ok(conn) => {
            if format == OutputFormat::Text {
                println!("{}", render_connected(&conn));
            }
            core.pool.release_connection(conn.id()).await;
            print_metrics(core, format).await
        }
        Err(e) => Err(anyhow::Error::new(e).context(format!("Failed to connect to {}", endpoint))),
    };

    core.shutdown().await;
    outcome
}

/// Warm the pool and report until Ctrl-C
pub async fn cmd_watch(core: &Core, interval_secs: u64, format: OutputFormat) -> Result<()> {
    let mut events = core.pool.subscribe();
    core.warm().await.context("Failed to initialize pool")?;

    let period = Duration::from_secs(interval_secs.max(1));
    let mut ticker = interval_at(Instant::now(), period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    info!(interval_secs = period.as_secs(), "Watching pool, press Ctrl-C to stop");

    loop {
        tokio::select! {
            result = &mut ctrl_c => {
                if let Err(e) = result {
                    warn!(error = %e, "Failed to listen for Ctrl-C");
                }
                break;
            }
            _ = ticker.tick() => {
                print_metrics(core, format).await?;
            }
            event = events.recv() => match event {
                Ok(event) => match format {
                    OutputFormat::Json => println!("{}", serde_json::to_string(&event)?),
                    OutputFormat::Text => println!("{}", render_event(&event)),
                },
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped = skipped, "Event stream lagged");
                }
                Err(RecvError::Closed) => break,
            },
        }
    }

    core.shutdown().await;
    Ok(())
}
