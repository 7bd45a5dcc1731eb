//! Passive PCI recovery — a scheduled job that pulls the scores of
//! recently active but now idle users toward a soft-floor baseline.
//!
//! The job is driven by a [`RecoveryTrigger`], so the schedule itself (a
//! tokio interval, an external cron hitting the admin endpoint, a test
//! channel) is injected rather than baked in.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use serde::Serialize;
use sqlx::SqlitePool;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::clock::Clock;
use crate::config::Config;
use crate::db;
use crate::errors::Result;
use crate::models::{to_millis, TrendPoint, User};
use crate::pci;
use crate::referral;

pub const RECOVERY_BASELINE: f64 = 700.0;
const RECOVERY_WEIGHT: f64 = 0.05;
/// Beyond this many steps the score equals the baseline to f64 precision.
const MAX_RECOVERY_STEPS: i64 = 1_000;

// ─────────────────────────────────────────────────────────
// Triggers
// ─────────────────────────────────────────────────────────

/// Source of "run now" signals. `None` ends the loop.
#[async_trait]
pub trait RecoveryTrigger: Send {
    async fn next_tick(&mut self) -> Option<()>;
}

/// Fires immediately, then once per period.
pub struct IntervalTrigger {
    interval: tokio::time::Interval,
}

impl IntervalTrigger {
    pub fn every(period: Duration) -> Self {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        Self { interval }
    }
}

#[async_trait]
impl RecoveryTrigger for IntervalTrigger {
    async fn next_tick(&mut self) -> Option<()> {
        self.interval.tick().await;
        Some(())
    }
}

/// Fires whenever a message arrives; ends when every sender is dropped.
#[cfg(test)]
pub struct ChannelTrigger(pub tokio::sync::mpsc::Receiver<()>);

#[cfg(test)]
#[async_trait]
impl RecoveryTrigger for ChannelTrigger {
    async fn next_tick(&mut self) -> Option<()> {
        self.0.recv().await
    }
}

// ─────────────────────────────────────────────────────────
// Scoring
// ─────────────────────────────────────────────────────────

/// Apply `days` daily recovery steps to `score`.
pub fn recover_score(mut score: f64, days: i64) -> f64 {
    for _ in 0..days.clamp(0, MAX_RECOVERY_STEPS) {
        score = pci::blend(score, RECOVERY_BASELINE, RECOVERY_WEIGHT);
    }
    score
}

/// Recovery steps still owed to the user at `now`.
///
/// Whole days are counted from the last PCI event, which is a fixed anchor,
/// minus the days already covered by the last write. A run that fires a few
/// milliseconds early therefore loses no step.
pub fn idle_days(user: &User, now: DateTime<Utc>) -> Option<i64> {
    let last_event = user.pci_last_event_at?;
    let covered = (user.pci_updated_at.max(last_event) - last_event).num_days();
    Some((now - last_event).num_days() - covered)
}

// ─────────────────────────────────────────────────────────
// Batch
// ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RecoveryReport {
    pub scanned: usize,
    pub recovered: usize,
    pub skipped: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum UserRecovery {
    Recovered { days: i64, score: f64 },
    Skipped,
}

/// Recover one user in its own transaction. Users with activity in the
/// last day are left untouched.
pub async fn recover_user(pool: &SqlitePool, uid: &str, now: DateTime<Utc>) -> Result<UserRecovery> {
    let uid = uid.to_owned();
    db::transact(pool, "pci_recovery", move |conn| {
        let uid = uid.clone();
        Box::pin(async move {
            let user: User = db::fetch_user_row(conn, &uid).await?.try_into()?;
            let days = match idle_days(&user, now) {
                Some(days) if days > 0 => days,
                _ => return Ok(UserRecovery::Skipped),
            };

            let score = recover_score(user.pci_score, days);
            let mut trend = user.pci_trend;
            pci::push_trend(&mut trend, TrendPoint { ts: now, score });

            sqlx::query(
                "UPDATE users SET pci_score = ?2, pci_trend = ?3, pci_updated_at = ?4 WHERE id = ?1",
            )
            .bind(&uid)
            .bind(score)
            .bind(serde_json::to_string(&trend)?)
            .bind(to_millis(now))
            .execute(&mut *conn)
            .await?;

            debug!("Recovered {uid} over {days} day(s): {:.2} -> {score:.2}", user.pci_score);
            Ok(UserRecovery::Recovered { days, score })
        })
    })
    .await
}

/// Run one recovery pass over every user with PCI activity in the last
/// `lookback_days`. Per-user failures are logged and counted; they never
/// stop the batch.
pub async fn run_batch(
    pool: &SqlitePool,
    now: DateTime<Utc>,
    lookback_days: i64,
    concurrency: usize,
) -> Result<RecoveryReport> {
    let cutoff = now - chrono::Duration::days(lookback_days);
    let uids: Vec<String> = sqlx::query_scalar(
        r#"
        SELECT id
        FROM   users
        WHERE  pci_last_event_at IS NOT NULL AND pci_last_event_at >= ?1
        ORDER  BY id
        "#,
    )
    .bind(to_millis(cutoff))
    .fetch_all(pool)
    .await?;

    let mut report = RecoveryReport {
        scanned: uids.len(),
        ..RecoveryReport::default()
    };

    let results: Vec<(String, Result<UserRecovery>)> = stream::iter(uids)
        .map(|uid| async move {
            let result = recover_user(pool, &uid, now).await;
            (uid, result)
        })
        .buffer_unordered(concurrency.max(1))
        .collect()
        .await;

    for (uid, result) in results {
        match result {
            Ok(UserRecovery::Recovered { .. }) => report.recovered += 1,
            Ok(UserRecovery::Skipped) => report.skipped += 1,
            Err(e) => {
                error!("PCI recovery failed for {uid}: {e}");
                report.failed += 1;
            }
        }
    }

    Ok(report)
}

// ─────────────────────────────────────────────────────────
// Loop
// ─────────────────────────────────────────────────────────

pub struct SchedulerState {
    pub pool: SqlitePool,
    pub config: Config,
    pub clock: Arc<dyn Clock>,
}

/// One scheduled tick: the recovery batch, then any referral bonus legs left
/// pending by earlier failures.
pub async fn tick(state: &SchedulerState) -> Result<RecoveryReport> {
    let now = state.clock.now();
    let report = run_batch(
        &state.pool,
        now,
        state.config.recovery_lookback_days,
        state.config.recovery_concurrency,
    )
    .await?;
    info!(
        "PCI recovery at {now}: scanned {}, recovered {}, skipped {}, failed {}",
        report.scanned,
        report.recovered,
        report.skipped,
        report.failed
    );

    if let Err(e) = referral::replay_pending_legs(&state.pool, now).await {
        error!("Referral outbox replay failed: {e}");
    }
    Ok(report)
}

/// Drive [`tick`] from `trigger` until it ends or `shutdown` is cancelled.
pub async fn run<T: RecoveryTrigger>(
    state: Arc<SchedulerState>,
    mut trigger: T,
    shutdown: CancellationToken,
) {
    info!("Recovery scheduler starting");
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            next = trigger.next_tick() => {
                if next.is_none() {
                    break;
                }
                if let Err(e) = tick(&state).await {
                    error!("Recovery tick failed: {e}");
                }
            }
        }
    }
    info!("Recovery scheduler stopped");
}
