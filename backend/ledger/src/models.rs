//! Persisted entities and the shapes returned to collaborators.
//!
//! Timestamps are stored as epoch milliseconds and surfaced as
//! [`DateTime<Utc>`]. Money is always an integer count of coins or paise.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::{LedgerError, Result};

pub fn to_millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

pub fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

// ─────────────────────────────────────────────────────────
// Ledger entries
// ─────────────────────────────────────────────────────────

/// Kind of balance-affecting operation recorded in the ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryKind {
    Earn,
    Redeem,
    DailyReward,
    GameEntry,
    GameWin,
}

impl EntryKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Earn => "earn",
            Self::Redeem => "redeem",
            Self::DailyReward => "daily_reward",
            Self::GameEntry => "game_entry",
            Self::GameWin => "game_win",
        }
    }
}

/// An immutable ledger row as read from the database.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct LedgerEntry {
    pub id: String,
    pub kind: String,
    pub amount: i64,
    pub note: String,
    pub created_at: i64,
}

/// Result of a ledger mutation. `applied` is false when the idempotency key
/// had already been used and nothing changed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Applied {
    pub entry_id: String,
    pub applied: bool,
    pub balance: i64,
}

// ─────────────────────────────────────────────────────────
// PCI trend
// ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TrendPoint {
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub ts: DateTime<Utc>,
    pub score: f64,
}

// ─────────────────────────────────────────────────────────
// Users
// ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct UserRow {
    pub id: String,
    pub coin_balance: i64,
    pub pci_score: f64,
    pub pci_streak_days: i64,
    pub pci_last_event_at: Option<i64>,
    pub pci_updated_at: i64,
    pub pci_decay_anchor: Option<i64>,
    pub pci_trend: String,
    pub referral_code: String,
    pub used_referral_code: Option<String>,
    pub last_daily_reward_at: Option<i64>,
    pub created_at: i64,
}

/// Snapshot of a user record.
#[derive(Debug, Clone, Serialize)]
pub struct User {
    pub id: String,
    pub coin_balance: i64,
    pub pci_score: f64,
    pub pci_streak_days: u32,
    pub pci_last_event_at: Option<DateTime<Utc>>,
    pub pci_updated_at: DateTime<Utc>,
    pub pci_decay_anchor: Option<DateTime<Utc>>,
    pub pci_trend: Vec<TrendPoint>,
    pub referral_code: String,
    pub used_referral_code: Option<String>,
    pub last_daily_reward_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl TryFrom<UserRow> for User {
    type Error = LedgerError;

    fn try_from(row: UserRow) -> Result<Self> {
        let pci_trend: Vec<TrendPoint> = serde_json::from_str(&row.pci_trend)?;
        Ok(User {
            id: row.id,
            coin_balance: row.coin_balance,
            pci_score: row.pci_score,
            pci_streak_days: u32::try_from(row.pci_streak_days).unwrap_or(0),
            pci_last_event_at: row.pci_last_event_at.map(from_millis),
            pci_updated_at: from_millis(row.pci_updated_at),
            pci_decay_anchor: row.pci_decay_anchor.map(from_millis),
            pci_trend,
            referral_code: row.referral_code,
            used_referral_code: row.used_referral_code,
            last_daily_reward_at: row.last_daily_reward_at.map(from_millis),
            created_at: from_millis(row.created_at),
        })
    }
}

// ─────────────────────────────────────────────────────────
// Vouchers
// ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VoucherStatus {
    Active,
    Used,
}

impl VoucherStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Used => "used",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Voucher {
    pub id: String,
    pub user_id: String,
    pub code: String,
    pub value_paise: i64,
    pub status: String,
    pub created_at: i64,
    pub redeemed_at: Option<i64>,
}

impl Voucher {
    pub fn is_used(&self) -> bool {
        self.status == VoucherStatus::Used.as_str()
    }
}

// ─────────────────────────────────────────────────────────
// Referrals
// ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReferralStats {
    pub referral_code: String,
    pub total_referrals: i64,
    pub completed_referrals: i64,
    pub bonus_coins_earned: i64,
}

// ─────────────────────────────────────────────────────────
// Bills
// ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Bill {
    pub id: String,
    pub user_id: String,
    pub amount: i64,
    pub due_at: Option<i64>,
    pub status: String,
    pub paid_at: Option<i64>,
    pub payment_id: Option<String>,
}
