//! Database layer — pool setup, the per-user transaction primitive, and
//! user/bill queries shared by the ledger and scoring modules.

use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use rand::distributions::{Alphanumeric, DistString};
use sqlx::sqlite::{SqliteConnectOptions, SqliteConnection, SqlitePoolOptions};
use sqlx::SqlitePool;
use tracing::{debug, info, warn};

use crate::errors::{LedgerError, Result};
use crate::models::{to_millis, Bill, TrendPoint, User, UserRow};
use crate::pci;

const MAX_TX_ATTEMPTS: u32 = 8;
const INITIAL_BACKOFF_MS: u64 = 5;
const MAX_BACKOFF_MS: u64 = 200;

const REFERRAL_CODE_LEN: usize = 8;
const REFERRAL_CODE_ATTEMPTS: usize = 5;

/// Establish a SQLite connection pool and run pending migrations.
pub async fn init_pool(database_url: &str) -> Result<SqlitePool> {
    let url = if database_url.starts_with("sqlite:") {
        database_url.to_string()
    } else {
        format!("sqlite:{database_url}")
    };

    let options = SqliteConnectOptions::from_str(&url)?
        .create_if_missing(true)
        .foreign_keys(true)
        .busy_timeout(Duration::from_secs(5));

    // Every connection to `:memory:` is its own database, so keep exactly one
    // alive for the lifetime of the pool.
    let pool = if url.contains(":memory:") {
        SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?
    } else {
        SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?
    };

    sqlx::migrate!("./migrations").run(&pool).await?;
    info!("Database migrations applied successfully");
    Ok(pool)
}

// ─────────────────────────────────────────────────────────
// Transaction primitive
// ─────────────────────────────────────────────────────────

/// Run `op` inside a single store transaction: read current state, decide,
/// write the new state and its idempotency marker, commit.
///
/// Any error returned by `op` rolls the transaction back. Conflicts with a
/// concurrent writer ([`LedgerError::is_transient`]) rerun `op` from scratch
/// against fresh state, so `op` must derive everything it writes from what it
/// reads inside the transaction.
pub async fn transact<T, F>(pool: &SqlitePool, label: &'static str, mut op: F) -> Result<T>
where
    T: Send,
    F: for<'c> FnMut(&'c mut SqliteConnection) -> BoxFuture<'c, Result<T>> + Send,
{
    let mut backoff = INITIAL_BACKOFF_MS;
    let mut attempt = 1;

    loop {
        let outcome = async {
            let mut tx = pool.begin().await?;
            let value = op(&mut *tx).await?;
            tx.commit().await?;
            Ok::<T, LedgerError>(value)
        }
        .await;

        match outcome {
            Err(e) if e.is_transient() && attempt < MAX_TX_ATTEMPTS => {
                warn!("{label}: store conflict on attempt {attempt}, retrying in {backoff}ms: {e}");
                tokio::time::sleep(Duration::from_millis(backoff)).await;
                backoff = (backoff * 2).min(MAX_BACKOFF_MS);
                attempt += 1;
            }
            other => return other,
        }
    }
}

// ─────────────────────────────────────────────────────────
// Users
// ─────────────────────────────────────────────────────────

const USER_COLUMNS: &str = r#"
    id, coin_balance, pci_score, pci_streak_days, pci_last_event_at,
    pci_updated_at, pci_decay_anchor, pci_trend, referral_code,
    used_referral_code, last_daily_reward_at, created_at
"#;

/// Load a user row inside an open transaction.
pub async fn fetch_user_row(conn: &mut SqliteConnection, uid: &str) -> Result<UserRow> {
    let sql = format!("SELECT {USER_COLUMNS} FROM users WHERE id = ?1");
    sqlx::query_as::<_, UserRow>(&sql)
        .bind(uid)
        .fetch_optional(&mut *conn)
        .await?
        .ok_or_else(|| LedgerError::NotFound(format!("user {uid}")))
}

pub async fn get_user(pool: &SqlitePool, uid: &str) -> Result<User> {
    let mut conn = pool.acquire().await?;
    fetch_user_row(&mut conn, uid).await?.try_into()
}

/// Create the user record on first authentication. Existing users are
/// returned untouched.
pub async fn ensure_user(pool: &SqlitePool, uid: &str, now: DateTime<Utc>) -> Result<User> {
    if uid.trim().is_empty() {
        return Err(LedgerError::InvalidUser("user id must not be empty".to_string()));
    }

    let trend = serde_json::to_string(&[TrendPoint {
        ts: now,
        score: pci::BASELINE_SCORE,
    }])?;

    for _ in 0..REFERRAL_CODE_ATTEMPTS {
        let code = Alphanumeric
            .sample_string(&mut rand::thread_rng(), REFERRAL_CODE_LEN)
            .to_uppercase();

        // OR IGNORE covers both "user exists" and a referral code collision;
        // the lookup below tells them apart.
        let inserted = sqlx::query(
            r#"
            INSERT OR IGNORE INTO users
                (id, coin_balance, pci_score, pci_streak_days, pci_updated_at,
                 pci_decay_anchor, pci_trend, referral_code, created_at)
            VALUES (?1, 0, ?2, 0, ?3, ?3, ?4, ?5, ?3)
            "#,
        )
        .bind(uid)
        .bind(pci::BASELINE_SCORE)
        .bind(to_millis(now))
        .bind(&trend)
        .bind(&code)
        .execute(pool)
        .await?
        .rows_affected();

        match get_user(pool, uid).await {
            Ok(user) => {
                if inserted > 0 {
                    info!("Created user {uid} with referral code {code}");
                }
                return Ok(user);
            }
            Err(LedgerError::NotFound(_)) => {
                debug!("Referral code collision for {uid}, regenerating");
            }
            Err(e) => return Err(e),
        }
    }

    Err(LedgerError::Config(format!(
        "could not allocate a unique referral code for {uid}"
    )))
}

// ─────────────────────────────────────────────────────────
// Bills
// ─────────────────────────────────────────────────────────

/// Register a bill created by the checkout layer. Re-registering the same id
/// is a no-op.
pub async fn register_bill(
    pool: &SqlitePool,
    uid: &str,
    bill_id: &str,
    amount: i64,
    due_at: Option<DateTime<Utc>>,
) -> Result<Bill> {
    if amount <= 0 {
        return Err(LedgerError::InvalidAmount(format!(
            "bill amount must be positive, got {amount}"
        )));
    }
    sqlx::query(
        r#"
        INSERT OR IGNORE INTO bills (id, user_id, amount, due_at, status)
        VALUES (?1, ?2, ?3, ?4, 'pending')
        "#,
    )
    .bind(bill_id)
    .bind(uid)
    .bind(amount)
    .bind(due_at.map(to_millis))
    .execute(pool)
    .await?;

    find_bill(pool, bill_id)
        .await?
        .ok_or_else(|| LedgerError::NotFound(format!("bill {bill_id}")))
}

pub async fn find_bill(pool: &SqlitePool, bill_id: &str) -> Result<Option<Bill>> {
    let bill = sqlx::query_as::<_, Bill>(
        r#"
        SELECT id, user_id, amount, due_at, status, paid_at, payment_id
        FROM   bills
        WHERE  id = ?1
        "#,
    )
    .bind(bill_id)
    .fetch_optional(pool)
    .await?;
    Ok(bill)
}

/// Mark a bill paid by `payment_id`. Only the first settlement wins.
pub async fn mark_bill_paid(
    pool: &SqlitePool,
    bill_id: &str,
    payment_id: &str,
    paid_at: DateTime<Utc>,
) -> Result<bool> {
    let rows = sqlx::query(
        r#"
        UPDATE bills
        SET    status = 'paid', paid_at = ?2, payment_id = ?3
        WHERE  id = ?1 AND status != 'paid'
        "#,
    )
    .bind(bill_id)
    .bind(to_millis(paid_at))
    .bind(payment_id)
    .execute(pool)
    .await?
    .rows_affected();
    Ok(rows > 0)
}

// ─────────────────────────────────────────────────────────
// Test support
// ─────────────────────────────────────────────────────────

#[cfg(test)]
pub async fn test_pool() -> SqlitePool {
    init_pool("sqlite::memory:").await.unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).unwrap()
    }

    #[tokio::test]
    async fn ensure_user_applies_pci_defaults() {
        let pool = test_pool().await;
        let user = ensure_user(&pool, "alice", t0()).await.unwrap();

        assert_eq!(user.coin_balance, 0);
        assert_eq!(user.pci_score, 650.0);
        assert_eq!(user.pci_streak_days, 0);
        assert_eq!(user.pci_trend.len(), 1);
        assert_eq!(user.pci_decay_anchor, Some(t0()));
        assert!(user.pci_last_event_at.is_none());
        assert_eq!(user.referral_code.len(), 8);
        assert!(user.used_referral_code.is_none());
    }

    #[tokio::test]
    async fn ensure_user_is_idempotent() {
        let pool = test_pool().await;
        let first = ensure_user(&pool, "alice", t0()).await.unwrap();
        let later = t0() + chrono::Duration::days(3);
        let second = ensure_user(&pool, "alice", later).await.unwrap();

        assert_eq!(first.referral_code, second.referral_code);
        assert_eq!(second.created_at, t0());
    }

    #[tokio::test]
    async fn blank_user_id_is_rejected() {
        let pool = test_pool().await;
        for uid in ["", "   "] {
            assert!(matches!(
                ensure_user(&pool, uid, t0()).await,
                Err(LedgerError::InvalidUser(_))
            ));
        }
    }

    #[tokio::test]
    async fn missing_user_is_not_found() {
        let pool = test_pool().await;
        assert!(matches!(
            get_user(&pool, "ghost").await,
            Err(LedgerError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn bill_is_paid_once() {
        let pool = test_pool().await;
        ensure_user(&pool, "alice", t0()).await.unwrap();
        register_bill(&pool, "alice", "bill_1", 50_000, Some(t0()))
            .await
            .unwrap();

        assert!(mark_bill_paid(&pool, "bill_1", "pay_1", t0()).await.unwrap());
        assert!(!mark_bill_paid(&pool, "bill_1", "pay_2", t0()).await.unwrap());

        let bill = find_bill(&pool, "bill_1").await.unwrap().unwrap();
        assert_eq!(bill.status, "paid");
        assert_eq!(bill.payment_id.as_deref(), Some("pay_1"));
    }

    #[tokio::test]
    async fn transact_rolls_back_on_error() {
        let pool = test_pool().await;
        ensure_user(&pool, "alice", t0()).await.unwrap();

        let result: Result<()> = transact(&pool, "test", |conn| {
            Box::pin(async move {
                sqlx::query("UPDATE users SET coin_balance = 500 WHERE id = 'alice'")
                    .execute(&mut *conn)
                    .await?;
                Err(LedgerError::AlreadyUsed)
            })
        })
        .await;

        assert!(matches!(result, Err(LedgerError::AlreadyUsed)));
        assert_eq!(get_user(&pool, "alice").await.unwrap().coin_balance, 0);
    }
}
