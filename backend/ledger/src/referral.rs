//! Referral codes and the referral bonus outbox.
//!
//! Applying a code writes the referral, the referee's `used_referral_code`
//! and one outbox row per bonus leg in a single transaction on the referee.
//! Each leg is then credited to its own user as an ordinary idempotent award
//! and marked done. A leg that fails stays pending and is picked up by
//! [`replay_pending_legs`].

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::SqlitePool;
use tracing::{error, info, warn};

use crate::db;
use crate::errors::{LedgerError, Result};
use crate::ledger;
use crate::models::{to_millis, ReferralStats};

const ROLE_REFERRER: &str = "referrer";
const ROLE_REFEREE: &str = "referee";

#[derive(Debug, Clone, Copy)]
pub struct ReferralBonuses {
    pub referrer: i64,
    pub referee: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReferralOutcome {
    pub referral_id: String,
    pub referrer_user_id: String,
    pub bonus_awarded: bool,
}

#[derive(Debug, Clone, sqlx::FromRow)]
struct Leg {
    referral_id: String,
    user_id: String,
    entry_id: String,
    role: String,
    amount: i64,
}

/// Apply `code` on behalf of `uid`.
pub async fn apply_referral_code(
    pool: &SqlitePool,
    uid: &str,
    code: &str,
    bonuses: ReferralBonuses,
    now: DateTime<Utc>,
) -> Result<ReferralOutcome> {
    let code = code.trim().to_uppercase();
    let uid = uid.to_owned();
    let referral_id = format!("referral_{uid}");

    let (tx_uid, tx_code, tx_referral_id) = (uid.clone(), code.clone(), referral_id.clone());
    let referrer = db::transact(pool, "apply_referral", move |conn| {
        let (uid, code, referral_id) =
            (tx_uid.clone(), tx_code.clone(), tx_referral_id.clone());
        Box::pin(async move {
            let user = db::fetch_user_row(conn, &uid).await?;
            if user.used_referral_code.is_some() {
                return Err(LedgerError::AlreadyUsed);
            }

            let referrer: Option<String> =
                sqlx::query_scalar("SELECT id FROM users WHERE referral_code = ?1")
                    .bind(&code)
                    .fetch_optional(&mut *conn)
                    .await?;
            let referrer =
                referrer.ok_or_else(|| LedgerError::NotFound(format!("referral code {code}")))?;
            if referrer == uid {
                return Err(LedgerError::SelfReferral);
            }

            sqlx::query(
                r#"
                INSERT INTO referrals
                    (id, referrer_user_id, referred_user_id, referral_code, status,
                     bonus_awarded, created_at)
                VALUES (?1, ?2, ?3, ?4, 'pending', 0, ?5)
                "#,
            )
            .bind(&referral_id)
            .bind(&referrer)
            .bind(&uid)
            .bind(&code)
            .bind(to_millis(now))
            .execute(&mut *conn)
            .await?;

            sqlx::query("UPDATE users SET used_referral_code = ?2 WHERE id = ?1")
                .bind(&uid)
                .bind(&code)
                .execute(&mut *conn)
                .await?;

            // Each side's entry id names the other party.
            let legs = [
                (ROLE_REFERRER, &referrer, format!("referral_{uid}"), bonuses.referrer),
                (ROLE_REFEREE, &uid, format!("referral_{referrer}"), bonuses.referee),
            ];
            for (role, user_id, entry_id, amount) in legs {
                sqlx::query(
                    r#"
                    INSERT INTO referral_legs
                        (referral_id, user_id, entry_id, role, amount, status, updated_at)
                    VALUES (?1, ?2, ?3, ?4, ?5, 'pending', ?6)
                    "#,
                )
                .bind(&referral_id)
                .bind(user_id)
                .bind(&entry_id)
                .bind(role)
                .bind(amount)
                .bind(to_millis(now))
                .execute(&mut *conn)
                .await?;
            }

            Ok(referrer)
        })
    })
    .await?;

    info!("User {uid} applied referral code {code} from {referrer}");

    let mut bonus_awarded = false;
    for leg in pending_legs(pool, Some(&referral_id)).await? {
        match execute_leg(pool, &leg, now).await {
            Ok(completed) => bonus_awarded |= completed,
            Err(e) => error!(
                "Referral {} {} leg for {} failed, left pending: {e}",
                leg.referral_id, leg.role, leg.user_id
            ),
        }
    }

    Ok(ReferralOutcome {
        referral_id,
        referrer_user_id: referrer,
        bonus_awarded,
    })
}

async fn pending_legs(pool: &SqlitePool, referral_id: Option<&str>) -> Result<Vec<Leg>> {
    let legs = sqlx::query_as::<_, Leg>(
        r#"
        SELECT referral_id, user_id, entry_id, role, amount
        FROM   referral_legs
        WHERE  status = 'pending' AND (?1 IS NULL OR referral_id = ?1)
        ORDER  BY updated_at ASC, referral_id ASC, role ASC
        "#,
    )
    .bind(referral_id)
    .fetch_all(pool)
    .await?;
    Ok(legs)
}

/// Credit one leg and mark it done. Returns true once every leg of the
/// referral is done.
async fn execute_leg(pool: &SqlitePool, leg: &Leg, now: DateTime<Utc>) -> Result<bool> {
    let note = match leg.role.as_str() {
        ROLE_REFERRER => "Referral bonus",
        _ => "Welcome bonus",
    };

    if let Err(e) = ledger::award(pool, &leg.user_id, &leg.entry_id, leg.amount, note, now).await {
        sqlx::query(
            "UPDATE referral_legs SET attempts = attempts + 1, updated_at = ?3 WHERE referral_id = ?1 AND role = ?2",
        )
        .bind(&leg.referral_id)
        .bind(&leg.role)
        .bind(to_millis(now))
        .execute(pool)
        .await?;
        return Err(e);
    }

    let (referral_id, role) = (leg.referral_id.clone(), leg.role.clone());
    db::transact(pool, "referral_leg_done", move |conn| {
        let (referral_id, role) = (referral_id.clone(), role.clone());
        Box::pin(async move {
            sqlx::query(
                r#"
                UPDATE referral_legs
                SET    status = 'done', attempts = attempts + 1, updated_at = ?3
                WHERE  referral_id = ?1 AND role = ?2
                "#,
            )
            .bind(&referral_id)
            .bind(&role)
            .bind(to_millis(now))
            .execute(&mut *conn)
            .await?;

            let remaining: i64 = sqlx::query_scalar(
                "SELECT COUNT(*) FROM referral_legs WHERE referral_id = ?1 AND status != 'done'",
            )
            .bind(&referral_id)
            .fetch_one(&mut *conn)
            .await?;

            if remaining > 0 {
                return Ok(false);
            }
            sqlx::query(
                "UPDATE referrals SET status = 'completed', bonus_awarded = 1 WHERE id = ?1",
            )
            .bind(&referral_id)
            .execute(&mut *conn)
            .await?;
            Ok(true)
        })
    })
    .await
}

/// Re-run every pending bonus leg. Returns how many legs completed.
pub async fn replay_pending_legs(pool: &SqlitePool, now: DateTime<Utc>) -> Result<usize> {
    let legs = pending_legs(pool, None).await?;
    if legs.is_empty() {
        return Ok(0);
    }

    let mut done = 0;
    for leg in &legs {
        match execute_leg(pool, leg, now).await {
            Ok(_) => done += 1,
            Err(e) => warn!(
                "Replay of referral {} {} leg failed: {e}",
                leg.referral_id, leg.role
            ),
        }
    }
    info!("Replayed {done}/{} pending referral legs", legs.len());
    Ok(done)
}

pub async fn referral_stats(pool: &SqlitePool, uid: &str) -> Result<ReferralStats> {
    let user = db::get_user(pool, uid).await?;

    let (total, completed): (i64, i64) = sqlx::query_as(
        r#"
        SELECT COUNT(*), COALESCE(SUM(CASE WHEN bonus_awarded = 1 THEN 1 ELSE 0 END), 0)
        FROM   referrals
        WHERE  referrer_user_id = ?1
        "#,
    )
    .bind(uid)
    .fetch_one(pool)
    .await?;

    let earned: i64 = sqlx::query_scalar(
        r#"
        SELECT COALESCE(SUM(amount), 0)
        FROM   referral_legs
        WHERE  user_id = ?1 AND role = 'referrer' AND status = 'done'
        "#,
    )
    .bind(uid)
    .fetch_one(pool)
    .await?;

    Ok(ReferralStats {
        referral_code: user.referral_code,
        total_referrals: total,
        completed_referrals: completed,
        bonus_coins_earned: earned,
    })
}
