//! Invariant checks shared by the test suites.

use sqlx::SqlitePool;

use crate::models::TrendPoint;
use crate::pci::{MAX_SCORE, MIN_SCORE, TREND_CAPACITY};

/// INV-1: the balance is never negative and always equals the sum of the
/// user's ledger entries.
pub async fn assert_balance_matches_ledger(pool: &SqlitePool, uid: &str) {
    let balance: i64 = sqlx::query_scalar("SELECT coin_balance FROM users WHERE id = ?1")
        .bind(uid)
        .fetch_one(pool)
        .await
        .unwrap();
    let sum: i64 =
        sqlx::query_scalar("SELECT COALESCE(SUM(amount), 0) FROM ledger_entries WHERE user_id = ?1")
            .bind(uid)
            .fetch_one(pool)
            .await
            .unwrap();

    assert!(balance >= 0, "INV-1 violated: {uid} has negative balance {balance}");
    assert_eq!(
        balance, sum,
        "INV-1 violated: {uid} balance {balance} differs from ledger sum {sum}"
    );
}

/// INV-2: the score stays inside the PCI range.
pub fn assert_score_in_range(score: f64) {
    assert!(
        (MIN_SCORE..=MAX_SCORE).contains(&score),
        "INV-2 violated: score {score} outside [{MIN_SCORE}, {MAX_SCORE}]"
    );
}

/// INV-3: the trend is bounded, newest first, and every point is in range.
pub fn assert_trend_bounded(trend: &[TrendPoint]) {
    assert!(
        trend.len() <= TREND_CAPACITY,
        "INV-3 violated: trend has {} points",
        trend.len()
    );
    for pair in trend.windows(2) {
        assert!(
            pair[0].ts >= pair[1].ts,
            "INV-3 violated: trend not newest-first at {}",
            pair[0].ts
        );
    }
    for point in trend {
        assert_score_in_range(point.score);
    }
}
