use std::time::Duration;

use chrono::{DateTime, Local, Utc};

use crate::app::{AppContext, Result};
use crate::bridge::RefreshOutcome;
use crate::domain::{EventTime, NormalizedEvent, OutcomeStatus, RefreshTarget, SyncRun};

pub async fn refresh(ctx: &AppContext, source: &str, deadline: Option<u64>) -> Result<()> {
    let target: RefreshTarget = match source.parse() {
        Ok(target) => target,
        Err(never) => match never {},
    };

    let run = match deadline {
        None => ctx.trigger_refresh(target).await?,
        Some(secs) => {
            let bridge = ctx.bridge()?;
            let deadline = Duration::from_secs(secs);
            match bridge.refresh_sync(target.into(), Some(deadline))? {
                RefreshOutcome::Completed(run) => run,
                RefreshOutcome::TimedOut { cached_events, .. } => {
                    println!(
                        "Refresh did not finish within {}s; {} cached events kept",
                        secs, cached_events
                    );
                    return Ok(());
                }
            }
        }
    };

    print_run(&run);
    Ok(())
}

fn print_run(run: &SyncRun) {
    for outcome in &run.outcomes {
        let detail = match &outcome.status {
            OutcomeStatus::Updated {
                inserted,
                updated,
                removed,
                warnings,
            } => format!(
                "{} new, {} updated, {} removed, {} warnings",
                inserted, updated, removed, warnings
            ),
            OutcomeStatus::Unchanged => "unchanged".to_string(),
            OutcomeStatus::Failed { error } => format!("failed: {}", error),
            OutcomeStatus::Skipped { reason } => format!("skipped: {}", reason),
            OutcomeStatus::Cancelled => "cancelled".to_string(),
        };
        println!(
            "  {} ({} attempts, {}ms): {}",
            outcome.source_id, outcome.attempts, outcome.elapsed_ms, detail
        );
    }
    println!("Sync complete: {}", run);
}

pub fn list_events(ctx: &AppContext, days: u32, cancelled: bool) -> Result<()> {
    let start = Utc::now();
    let end = start
        .checked_add_signed(chrono::Duration::days(i64::from(days)))
        .unwrap_or(DateTime::<Utc>::MAX_UTC);

    let events = if cancelled {
        ctx.events_in_range(start, end, true)?
    } else {
        let view = ctx.read_events(start, end)?;
        if view.stale {
            eprintln!("Warning: some sources are stale; showing last known data");
        }
        view.events
    };

    if events.is_empty() {
        println!("No events");
        return Ok(());
    }

    for event in events {
        println!("{}", format_event(&event));
    }
    Ok(())
}

fn format_event(event: &NormalizedEvent) -> String {
    let when = match event.start {
        EventTime::Date(date) => format!("{}       ", date.format("%Y-%m-%d")),
        EventTime::DateTime(dt) => dt.with_timezone(&Local).format("%Y-%m-%d %H:%M").to_string(),
    };
    let marker = if event.cancelled { "x" } else { " " };
    match &event.location {
        Some(location) => format!(
            "{} {} {} @ {} [{}]",
            marker,
            when,
            event.display_title(),
            location,
            event.source_id
        ),
        None => format!(
            "{} {} {} [{}]",
            marker,
            when,
            event.display_title(),
            event.source_id
        ),
    }
}

pub fn show_status(ctx: &AppContext) -> Result<()> {
    let status = ctx.sync_status()?;

    if status.sources.is_empty() {
        println!("No sources configured");
        return Ok(());
    }

    for source in &status.sources {
        let last_success = source
            .last_success_at
            .map(|t| t.with_timezone(&Local).format("%Y-%m-%d %H:%M").to_string())
            .unwrap_or_else(|| "never".to_string());
        println!(
            "{} {} (circuit {}, {} failures, last success {}){}",
            if source.healthy { "ok  " } else { "FAIL" },
            source.source_id,
            source.circuit_state,
            source.consecutive_failures,
            last_success,
            if source.is_stale { ", stale" } else { "" }
        );
        if source.auth_blocked {
            println!("     blocked: authentication failed, update the source configuration");
        }
        if let Some(error) = &source.last_error {
            println!("     last error: {}", error);
        }
    }
    Ok(())
}

pub fn cleanup(ctx: &AppContext) -> Result<()> {
    let removed = ctx.cleanup_expired()?;
    println!("Removed {} expired events", removed);
    Ok(())
}

pub fn list_runs(ctx: &AppContext, limit: usize) -> Result<()> {
    let runs = ctx.recent_runs(limit)?;

    if runs.is_empty() {
        println!("No sync runs recorded");
        return Ok(());
    }

    for run in runs {
        println!(
            "{} {}",
            run.started_at.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S"),
            run
        );
        for error in &run.errors {
            println!("  {}", error);
        }
    }
    Ok(())
}
