//! Coin ledger — every balance change is one transaction that writes the new
//! balance together with an append-only entry keyed by an idempotency key.
//!
//! Replaying a key that already has an entry is a silent success: the balance
//! is left as is and the caller gets `applied: false`.

use chrono::{DateTime, Duration, Utc};
use rand::distributions::{Alphanumeric, DistString};
use rand::Rng;
use serde::Serialize;
use sqlx::sqlite::SqliteConnection;
use sqlx::SqlitePool;
use tracing::{debug, info};

use crate::db;
use crate::errors::{LedgerError, Result};
use crate::models::{to_millis, Applied, EntryKind, LedgerEntry, Voucher, VoucherStatus};

/// Smallest voucher that can be issued, in paise.
pub const MIN_VOUCHER_PAISE: i64 = 100;
/// Coins spent per paise of voucher value.
pub const COINS_PER_VOUCHER_PAISE: i64 = 10;

const VOUCHER_CODE_LEN: usize = 10;

/// Build a fresh key for operations that have no triggering event id.
pub fn fresh_key(prefix: &str, now: DateTime<Utc>) -> String {
    // The suffix keeps two calls in the same millisecond apart.
    let suffix: u32 = rand::thread_rng().gen();
    format!("{prefix}_{}_{suffix:08x}", to_millis(now))
}

// ─────────────────────────────────────────────────────────
// Core write
// ─────────────────────────────────────────────────────────

/// Apply a signed `amount` to the balance and append the matching entry,
/// inside an already open transaction.
///
/// Debits that would take the balance below zero fail with
/// [`LedgerError::InsufficientFunds`] before anything is written.
pub async fn apply_entry(
    conn: &mut SqliteConnection,
    uid: &str,
    entry_id: &str,
    kind: EntryKind,
    amount: i64,
    note: &str,
    now: DateTime<Utc>,
) -> Result<Applied> {
    let balance: Option<i64> = sqlx::query_scalar("SELECT coin_balance FROM users WHERE id = ?1")
        .bind(uid)
        .fetch_optional(&mut *conn)
        .await?;
    let balance = balance.ok_or_else(|| LedgerError::NotFound(format!("user {uid}")))?;

    let exists: Option<i64> =
        sqlx::query_scalar("SELECT 1 FROM ledger_entries WHERE user_id = ?1 AND id = ?2")
            .bind(uid)
            .bind(entry_id)
            .fetch_optional(&mut *conn)
            .await?;
    if exists.is_some() {
        debug!("Ledger entry {entry_id} for {uid} already recorded");
        return Ok(Applied {
            entry_id: entry_id.to_string(),
            applied: false,
            balance,
        });
    }

    let new_balance = balance
        .checked_add(amount)
        .ok_or_else(|| LedgerError::InvalidAmount(format!("amount {amount} overflows balance")))?;
    if new_balance < 0 {
        return Err(LedgerError::InsufficientFunds {
            balance,
            required: -amount,
        });
    }

    sqlx::query("UPDATE users SET coin_balance = ?2 WHERE id = ?1")
        .bind(uid)
        .bind(new_balance)
        .execute(&mut *conn)
        .await?;

    sqlx::query(
        r#"
        INSERT INTO ledger_entries (user_id, id, kind, amount, note, created_at)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6)
        "#,
    )
    .bind(uid)
    .bind(entry_id)
    .bind(kind.as_str())
    .bind(amount)
    .bind(note)
    .bind(to_millis(now))
    .execute(&mut *conn)
    .await?;

    Ok(Applied {
        entry_id: entry_id.to_string(),
        applied: true,
        balance: new_balance,
    })
}

async fn post(
    pool: &SqlitePool,
    uid: &str,
    key: &str,
    kind: EntryKind,
    amount: i64,
    note: &str,
    now: DateTime<Utc>,
) -> Result<Applied> {
    let (uid, key, note) = (uid.to_owned(), key.to_owned(), note.to_owned());
    db::transact(pool, kind.as_str(), move |conn| {
        let (uid, key, note) = (uid.clone(), key.clone(), note.clone());
        Box::pin(async move { apply_entry(conn, &uid, &key, kind, amount, &note, now).await })
    })
    .await
}

fn require_positive(amount: i64, what: &str) -> Result<()> {
    if amount <= 0 {
        return Err(LedgerError::InvalidAmount(format!(
            "{what} must be positive, got {amount}"
        )));
    }
    Ok(())
}

// ─────────────────────────────────────────────────────────
// Credits and debits
// ─────────────────────────────────────────────────────────

/// Credit `amount` coins under `key`.
pub async fn award(
    pool: &SqlitePool,
    uid: &str,
    key: &str,
    amount: i64,
    note: &str,
    now: DateTime<Utc>,
) -> Result<Applied> {
    require_positive(amount, "award amount")?;
    post(pool, uid, key, EntryKind::Earn, amount, note, now).await
}

pub async fn award_game_win(
    pool: &SqlitePool,
    uid: &str,
    key: &str,
    amount: i64,
    now: DateTime<Utc>,
) -> Result<Applied> {
    require_positive(amount, "game winnings")?;
    post(pool, uid, key, EntryKind::GameWin, amount, "Game win", now).await
}

/// Debit a game entry fee under `key`.
pub async fn charge_entry_fee(
    pool: &SqlitePool,
    uid: &str,
    key: &str,
    fee: i64,
    now: DateTime<Utc>,
) -> Result<Applied> {
    require_positive(fee, "entry fee")?;
    post(pool, uid, key, EntryKind::GameEntry, -fee, "Game entry fee", now).await
}

/// Spend coins. Every call is a distinct redemption.
pub async fn redeem(
    pool: &SqlitePool,
    uid: &str,
    amount: i64,
    note: &str,
    now: DateTime<Utc>,
) -> Result<Applied> {
    require_positive(amount, "redeem amount")?;
    let key = fresh_key("redeem", now);
    post(pool, uid, &key, EntryKind::Redeem, -amount, note, now).await
}

// ─────────────────────────────────────────────────────────
// Vouchers
// ─────────────────────────────────────────────────────────

/// Buy a voucher worth `value_paise` for `value_paise × 10` coins.
pub async fn create_voucher(
    pool: &SqlitePool,
    uid: &str,
    value_paise: i64,
    now: DateTime<Utc>,
) -> Result<Voucher> {
    if value_paise < MIN_VOUCHER_PAISE {
        return Err(LedgerError::InvalidAmount(format!(
            "voucher value must be at least {MIN_VOUCHER_PAISE} paise, got {value_paise}"
        )));
    }
    let cost = value_paise
        .checked_mul(COINS_PER_VOUCHER_PAISE)
        .ok_or_else(|| LedgerError::InvalidAmount(format!("voucher value {value_paise} too large")))?;

    let voucher_id = fresh_key("voucher", now);
    let code = format!(
        "RW-{}",
        Alphanumeric
            .sample_string(&mut rand::thread_rng(), VOUCHER_CODE_LEN)
            .to_uppercase()
    );
    let uid = uid.to_owned();

    let voucher = db::transact(pool, "create_voucher", move |conn| {
        let (uid, voucher_id, code) = (uid.clone(), voucher_id.clone(), code.clone());
        Box::pin(async move {
            let note = format!("Voucher {code}");
            apply_entry(conn, &uid, &voucher_id, EntryKind::Redeem, -cost, &note, now).await?;

            sqlx::query(
                r#"
                INSERT INTO vouchers (id, user_id, code, value_paise, status, created_at)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                "#,
            )
            .bind(&voucher_id)
            .bind(&uid)
            .bind(&code)
            .bind(value_paise)
            .bind(VoucherStatus::Active.as_str())
            .bind(to_millis(now))
            .execute(&mut *conn)
            .await?;

            Ok(Voucher {
                id: voucher_id,
                user_id: uid,
                code,
                value_paise,
                status: VoucherStatus::Active.as_str().to_string(),
                created_at: to_millis(now),
                redeemed_at: None,
            })
        })
    })
    .await?;

    info!(
        "Issued voucher {} ({} paise) to {}",
        voucher.code, voucher.value_paise, voucher.user_id
    );
    Ok(voucher)
}

/// Retire an active voucher after it was consumed at checkout. Marking an
/// already used voucher again succeeds without changes.
pub async fn mark_voucher_used(
    pool: &SqlitePool,
    uid: &str,
    voucher_id: &str,
    now: DateTime<Utc>,
) -> Result<Voucher> {
    let (uid, voucher_id) = (uid.to_owned(), voucher_id.to_owned());
    db::transact(pool, "mark_voucher_used", move |conn| {
        let (uid, voucher_id) = (uid.clone(), voucher_id.clone());
        Box::pin(async move {
            let mut voucher = sqlx::query_as::<_, Voucher>(
                r#"
                SELECT id, user_id, code, value_paise, status, created_at, redeemed_at
                FROM   vouchers
                WHERE  id = ?1 AND user_id = ?2
                "#,
            )
            .bind(&voucher_id)
            .bind(&uid)
            .fetch_optional(&mut *conn)
            .await?
            .ok_or_else(|| LedgerError::NotFound(format!("voucher {voucher_id}")))?;

            if voucher.is_used() {
                return Ok(voucher);
            }

            sqlx::query("UPDATE vouchers SET status = ?2, redeemed_at = ?3 WHERE id = ?1")
                .bind(&voucher_id)
                .bind(VoucherStatus::Used.as_str())
                .bind(to_millis(now))
                .execute(&mut *conn)
                .await?;

            voucher.status = VoucherStatus::Used.as_str().to_string();
            voucher.redeemed_at = Some(to_millis(now));
            Ok(voucher)
        })
    })
    .await
}

pub async fn list_vouchers(pool: &SqlitePool, uid: &str) -> Result<Vec<Voucher>> {
    let vouchers = sqlx::query_as::<_, Voucher>(
        r#"
        SELECT id, user_id, code, value_paise, status, created_at, redeemed_at
        FROM   vouchers
        WHERE  user_id = ?1
        ORDER  BY created_at DESC, id DESC
        "#,
    )
    .bind(uid)
    .fetch_all(pool)
    .await?;
    Ok(vouchers)
}

// ─────────────────────────────────────────────────────────
// Daily reward
// ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum DailyReward {
    Granted {
        amount: i64,
        balance: i64,
        next_eligible_at: DateTime<Utc>,
    },
    NotEligible {
        next_eligible_at: DateTime<Utc>,
    },
}

/// Credit a random amount in `[min, max]` at most once per cooldown window.
pub async fn award_daily_reward(
    pool: &SqlitePool,
    uid: &str,
    min: i64,
    max: i64,
    cooldown_hours: i64,
    now: DateTime<Utc>,
) -> Result<DailyReward> {
    require_positive(min, "daily reward minimum")?;
    if max < min {
        return Err(LedgerError::InvalidAmount(format!(
            "daily reward range [{min}, {max}] is empty"
        )));
    }
    let cooldown = Duration::try_hours(cooldown_hours)
        .filter(|d| *d > Duration::zero())
        .ok_or_else(|| {
            LedgerError::InvalidAmount(format!(
                "daily reward cooldown of {cooldown_hours}h is out of range"
            ))
        })?;
    let window_end = move |from: DateTime<Utc>| {
        from.checked_add_signed(cooldown).ok_or_else(|| {
            LedgerError::InvalidAmount(format!(
                "daily reward cooldown of {cooldown_hours}h is out of range"
            ))
        })
    };
    let uid = uid.to_owned();

    db::transact(pool, "daily_reward", move |conn| {
        let uid = uid.clone();
        Box::pin(async move {
            let user = db::fetch_user_row(conn, &uid).await?;
            if let Some(last) = user.last_daily_reward_at.map(crate::models::from_millis) {
                let next_eligible_at = window_end(last)?;
                if now < next_eligible_at {
                    return Ok(DailyReward::NotEligible { next_eligible_at });
                }
            }

            // Drawn here so a retried transaction draws again against the
            // state it actually commits.
            let amount = rand::thread_rng().gen_range(min..=max);
            let key = format!("daily_reward_{}", to_millis(now));
            let applied =
                apply_entry(conn, &uid, &key, EntryKind::DailyReward, amount, "Daily reward", now)
                    .await?;
            let next_eligible_at = window_end(now)?;
            if !applied.applied {
                // A reward was already booked at this instant; nothing new was credited.
                return Ok(DailyReward::NotEligible { next_eligible_at });
            }

            sqlx::query("UPDATE users SET last_daily_reward_at = ?2 WHERE id = ?1")
                .bind(&uid)
                .bind(to_millis(now))
                .execute(&mut *conn)
                .await?;

            Ok(DailyReward::Granted {
                amount,
                balance: applied.balance,
                next_eligible_at,
            })
        })
    })
    .await
}

// ─────────────────────────────────────────────────────────
// Reads
// ─────────────────────────────────────────────────────────

pub async fn list_entries(pool: &SqlitePool, uid: &str, limit: i64) -> Result<Vec<LedgerEntry>> {
    let entries = sqlx::query_as::<_, LedgerEntry>(
        r#"
        SELECT id, kind, amount, note, created_at
        FROM   ledger_entries
        WHERE  user_id = ?1
        ORDER  BY created_at DESC, rowid DESC
        LIMIT  ?2
        "#,
    )
    .bind(uid)
    .bind(limit)
    .fetch_all(pool)
    .await?;
    Ok(entries)
}
