//! Payment Consistency Index scoring.
//!
//! The score moves by an exponentially weighted blend toward a per-event
//! target and is bounded to `[MIN_SCORE, MAX_SCORE]`. Streaks are counted in
//! UTC calendar days, so several events on one day count once.
//!
//! | Outcome of the day     | Raw delta |
//! |------------------------|-----------|
//! | paid on time           | +4        |
//! | paid late              | −10       |
//! | failed without success | −15       |
//!
//! Positive deltas are capped at +8 before the streak multiplier
//! (×1.5 from 30 days, ×2.0 from 60 days).

use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use sqlx::SqlitePool;
use tracing::debug;

use crate::db;
use crate::errors::Result;
use crate::models::{to_millis, TrendPoint, User};

pub const BASELINE_SCORE: f64 = 650.0;
pub const MIN_SCORE: f64 = 300.0;
pub const MAX_SCORE: f64 = 900.0;
pub const TREND_CAPACITY: usize = 120;

const EVENT_WEIGHT: f64 = 0.1;
const ON_TIME_DELTA: f64 = 4.0;
const DELAYED_DELTA: f64 = -10.0;
const FAILED_DELTA: f64 = -15.0;
const MAX_DAILY_GAIN: f64 = 8.0;

/// Outcome of the payment that triggered the update. Exactly one of the
/// three is expected per event.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PciFlags {
    pub on_time: bool,
    pub delayed: bool,
    pub failed_only: bool,
}

impl PciFlags {
    pub fn on_time() -> Self {
        Self {
            on_time: true,
            ..Self::default()
        }
    }

    pub fn delayed() -> Self {
        Self {
            delayed: true,
            ..Self::default()
        }
    }

    pub fn failed() -> Self {
        Self {
            failed_only: true,
            ..Self::default()
        }
    }
}

/// The PCI fields of a user record.
#[derive(Debug, Clone, PartialEq)]
pub struct PciState {
    pub score: f64,
    pub streak_days: u32,
    pub last_event_at: Option<DateTime<Utc>>,
    pub decay_anchor: Option<DateTime<Utc>>,
    pub trend: Vec<TrendPoint>,
}

impl From<&User> for PciState {
    fn from(user: &User) -> Self {
        PciState {
            score: user.pci_score,
            streak_days: user.pci_streak_days,
            last_event_at: user.pci_last_event_at,
            decay_anchor: user.pci_decay_anchor,
            trend: user.pci_trend.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PciOutcome {
    pub applied: bool,
    pub score: f64,
    pub streak_days: u32,
    pub delta: f64,
}

pub fn day_bucket(at: DateTime<Utc>) -> NaiveDate {
    at.date_naive()
}

pub fn clamp_score(score: f64) -> f64 {
    score.clamp(MIN_SCORE, MAX_SCORE)
}

/// Streak after an event at `at`, given the previous streak and event time.
pub fn next_streak(
    streak: u32,
    last_event_at: Option<DateTime<Utc>>,
    at: DateTime<Utc>,
    failed_only: bool,
) -> u32 {
    let reset = if failed_only { 0 } else { 1 };
    let Some(last) = last_event_at else {
        return reset;
    };
    let diff_days = (day_bucket(at) - day_bucket(last)).num_days();
    match diff_days {
        // Same-day events never move the streak, including a failure after
        // an earlier success.
        0 => streak,
        1 if !failed_only => streak.saturating_add(1),
        _ => reset,
    }
}

pub fn streak_multiplier(streak: u32) -> f64 {
    if streak >= 60 {
        2.0
    } else if streak >= 30 {
        1.5
    } else {
        1.0
    }
}

/// Effective delta for one event, given the streak it produced.
pub fn daily_delta(flags: PciFlags, streak: u32) -> f64 {
    if flags.failed_only {
        return FAILED_DELTA;
    }
    let mut delta = 0.0;
    if flags.on_time {
        delta += ON_TIME_DELTA;
    }
    if flags.delayed {
        delta += DELAYED_DELTA;
    }
    let delta = delta.min(MAX_DAILY_GAIN);
    if delta > 0.0 {
        delta * streak_multiplier(streak)
    } else {
        delta
    }
}

/// One EWMA step of `prev` toward `target`, clamped to the score range.
pub fn blend(prev: f64, target: f64, weight: f64) -> f64 {
    clamp_score((1.0 - weight) * prev + weight * target)
}

/// Prepend a point, keeping the newest [`TREND_CAPACITY`] entries.
pub fn push_trend(trend: &mut Vec<TrendPoint>, point: TrendPoint) {
    trend.insert(0, point);
    trend.truncate(TREND_CAPACITY);
}

/// Pure state transition for one qualifying event.
pub fn apply_event(state: &PciState, at: DateTime<Utc>, flags: PciFlags) -> (PciState, f64) {
    let streak = next_streak(state.streak_days, state.last_event_at, at, flags.failed_only);
    let delta = daily_delta(flags, streak);
    let score = blend(state.score, BASELINE_SCORE + delta, EVENT_WEIGHT);

    let mut trend = state.trend.clone();
    push_trend(&mut trend, TrendPoint { ts: at, score });

    let next = PciState {
        score,
        streak_days: streak,
        last_event_at: Some(at),
        decay_anchor: state.decay_anchor.or(Some(at)),
        trend,
    };
    (next, delta)
}

/// Apply one payment outcome to the user's PCI in its own transaction.
///
/// When `event_id` is given the update is recorded against it and a
/// redelivered event is a no-op.
pub async fn record_event(
    pool: &SqlitePool,
    uid: &str,
    event_id: Option<&str>,
    at: DateTime<Utc>,
    flags: PciFlags,
    now: DateTime<Utc>,
) -> Result<PciOutcome> {
    let uid = uid.to_owned();
    let event_id = event_id.map(str::to_owned);

    db::transact(pool, "pci_event", move |conn| {
        let uid = uid.clone();
        let event_id = event_id.clone();
        Box::pin(async move {
            let user: User = db::fetch_user_row(conn, &uid).await?.try_into()?;
            let state = PciState::from(&user);

            if let Some(event_id) = &event_id {
                let seen = sqlx::query(
                    "INSERT OR IGNORE INTO pci_events (user_id, event_id, applied_at) VALUES (?1, ?2, ?3)",
                )
                .bind(&uid)
                .bind(event_id)
                .bind(to_millis(now))
                .execute(&mut *conn)
                .await?
                .rows_affected()
                    == 0;
                if seen {
                    debug!("PCI event {event_id} for {uid} already applied");
                    return Ok(PciOutcome {
                        applied: false,
                        score: state.score,
                        streak_days: state.streak_days,
                        delta: 0.0,
                    });
                }
            }

            let (next, delta) = apply_event(&state, at, flags);
            sqlx::query(
                r#"
                UPDATE users
                SET    pci_score = ?2, pci_streak_days = ?3, pci_last_event_at = ?4,
                       pci_decay_anchor = ?5, pci_trend = ?6, pci_updated_at = ?7
                WHERE  id = ?1
                "#,
            )
            .bind(&uid)
            .bind(next.score)
            .bind(i64::from(next.streak_days))
            .bind(next.last_event_at.map(to_millis))
            .bind(next.decay_anchor.map(to_millis))
            .bind(serde_json::to_string(&next.trend)?)
            .bind(to_millis(now))
            .execute(&mut *conn)
            .await?;

            debug!(
                "PCI {uid}: {:.2} -> {:.2} (delta {delta}, streak {})",
                state.score, next.score, next.streak_days
            );
            Ok(PciOutcome {
                applied: true,
                score: next.score,
                streak_days: next.streak_days,
                delta,
            })
        })
    })
    .await
}
