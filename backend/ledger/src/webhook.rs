//! Payment gateway settlement webhooks.
//!
//! The raw request body is authenticated with HMAC-SHA256 before it is
//! parsed. A settled payment is then applied in two independent, idempotent
//! steps: the coin award (keyed `payment_<id>`) and the PCI update (keyed by
//! the settlement outcome and payment id). Redelivery of either is a no-op.

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use sha2::Sha256;
use sqlx::SqlitePool;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::db;
use crate::errors::{LedgerError, Result};
use crate::ledger;
use crate::models::from_millis;
use crate::pci::{self, PciFlags};

pub const SIGNATURE_HEADER: &str = "x-razorpay-signature";

type HmacSha256 = Hmac<Sha256>;

// ─────────────────────────────────────────────────────────
// Signature
// ─────────────────────────────────────────────────────────

fn keyed_mac(secret: &[u8], body: &[u8]) -> Result<HmacSha256> {
    let mut mac = HmacSha256::new_from_slice(secret)
        .map_err(|e| LedgerError::Config(format!("invalid webhook secret: {e}")))?;
    mac.update(body);
    Ok(mac)
}

/// Hex-encoded HMAC-SHA256 of `body` under `secret`.
pub fn sign(secret: &[u8], body: &[u8]) -> Result<String> {
    Ok(hex::encode(keyed_mac(secret, body)?.finalize().into_bytes()))
}

/// Accept only a lowercase hex digest that matches the body exactly.
pub fn verify_signature(secret: &[u8], body: &[u8], signature: &str) -> Result<()> {
    if signature.len() != 64 || signature.bytes().any(|b| b.is_ascii_uppercase()) {
        return Err(LedgerError::SignatureInvalid);
    }
    let expected = hex::decode(signature).map_err(|_| LedgerError::SignatureInvalid)?;
    keyed_mac(secret, body)?
        .verify_slice(&expected)
        .map_err(|_| LedgerError::SignatureInvalid)
}

// ─────────────────────────────────────────────────────────
// Payload shapes
// ─────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct Envelope {
    event: String,
    #[serde(default)]
    payload: Payload,
}

#[derive(Debug, Default, Deserialize)]
struct Payload {
    payment: Option<Wrapped<PaymentEntity>>,
    order: Option<Wrapped<OrderEntity>>,
}

#[derive(Debug, Deserialize)]
struct Wrapped<T> {
    entity: T,
}

#[derive(Debug, Deserialize)]
struct PaymentEntity {
    id: String,
    #[serde(default)]
    amount: i64,
    created_at: Option<i64>,
    #[serde(default, deserialize_with = "notes_or_empty")]
    notes: Notes,
}

#[derive(Debug, Deserialize)]
struct OrderEntity {
    #[serde(default, deserialize_with = "notes_or_empty")]
    notes: Notes,
}

#[derive(Debug, Default, Deserialize)]
struct Notes {
    #[serde(rename = "billId")]
    bill_id: Option<String>,
    #[serde(rename = "voucherId")]
    voucher_id: Option<String>,
    #[serde(rename = "userId")]
    user_id: Option<String>,
}

/// The gateway sends `notes: []` when no notes were attached.
fn notes_or_empty<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Notes, D::Error> {
    match Value::deserialize(deserializer)? {
        value @ Value::Object(_) => serde_json::from_value(value).map_err(serde::de::Error::custom),
        _ => Ok(Notes::default()),
    }
}

// ─────────────────────────────────────────────────────────
// Settlement events
// ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SettlementKind {
    Captured,
    Failed,
    Ignored,
}

impl SettlementKind {
    pub fn from_event(event: &str) -> Self {
        match event {
            "payment.captured" | "order.paid" => Self::Captured,
            "payment.failed" => Self::Failed,
            _ => Self::Ignored,
        }
    }
}

/// The fields of a webhook this engine acts on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SettlementEvent {
    pub event: String,
    pub kind: SettlementKind,
    pub payment_id: Option<String>,
    pub amount: i64,
    pub created_at: Option<DateTime<Utc>>,
    pub bill_id: Option<String>,
    pub voucher_id: Option<String>,
    pub user_id: Option<String>,
}

impl SettlementEvent {
    pub fn parse(body: &[u8]) -> Result<Self> {
        let envelope: Envelope = serde_json::from_slice(body)?;
        let kind = SettlementKind::from_event(&envelope.event);
        let order_notes = envelope.payload.order.map(|o| o.entity.notes).unwrap_or_default();
        let payment = envelope.payload.payment.map(|p| p.entity);

        if kind != SettlementKind::Ignored && payment.is_none() {
            return Err(LedgerError::EventParse(format!(
                "{} without payload.payment.entity",
                envelope.event
            )));
        }

        let (payment_id, amount, created_at, notes) = match payment {
            Some(p) => (
                Some(p.id),
                p.amount,
                p.created_at
                    .and_then(|secs| secs.checked_mul(1_000))
                    .map(from_millis),
                p.notes,
            ),
            None => (None, 0, None, Notes::default()),
        };

        Ok(SettlementEvent {
            event: envelope.event,
            kind,
            payment_id,
            amount,
            created_at,
            bill_id: notes.bill_id.or(order_notes.bill_id),
            voucher_id: notes.voucher_id.or(order_notes.voucher_id),
            user_id: notes.user_id.or(order_notes.user_id),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SettlementOutcome {
    Ignored { reason: String },
    Processed {
        user_id: String,
        coins_awarded: i64,
        score: f64,
        duplicate: bool,
    },
}

/// Apply a verified settlement event.
pub async fn process(
    pool: &SqlitePool,
    config: &Config,
    event: &SettlementEvent,
    now: DateTime<Utc>,
) -> Result<SettlementOutcome> {
    let payment_id = match (event.kind, event.payment_id.as_deref()) {
        (SettlementKind::Ignored, _) | (_, None) => {
            debug!("Ignoring webhook event {}", event.event);
            return Ok(SettlementOutcome::Ignored {
                reason: format!("unhandled event {}", event.event),
            });
        }
        (_, Some(id)) => id,
    };

    let bill = match &event.bill_id {
        Some(bill_id) => db::find_bill(pool, bill_id).await?,
        None => None,
    };
    let Some(uid) = event
        .user_id
        .clone()
        .or_else(|| bill.as_ref().map(|b| b.user_id.clone()))
    else {
        warn!("Payment {payment_id} carries no user and no known bill; ignoring");
        return Ok(SettlementOutcome::Ignored {
            reason: "cannot resolve user".to_string(),
        });
    };

    db::ensure_user(pool, &uid, now).await?;
    let paid_at = event.created_at.unwrap_or(now);

    let (flags, marker, coins_awarded, duplicate) = match event.kind {
        SettlementKind::Captured => {
            let coins = (event.amount / 100).saturating_mul(config.coins_per_rupee);
            let mut duplicate = false;
            if coins > 0 {
                let applied = ledger::award(
                    pool,
                    &uid,
                    &format!("payment_{payment_id}"),
                    coins,
                    "Payment reward",
                    now,
                )
                .await?;
                duplicate = !applied.applied;
            }

            if let Some(bill) = &bill {
                db::mark_bill_paid(pool, &bill.id, payment_id, paid_at).await?;
            }
            if let Some(voucher_id) = &event.voucher_id {
                match ledger::mark_voucher_used(pool, &uid, voucher_id, now).await {
                    Ok(_) => {}
                    Err(LedgerError::NotFound(_)) => {
                        warn!("Payment {payment_id} references unknown voucher {voucher_id}")
                    }
                    Err(e) => return Err(e),
                }
            }

            let on_time = bill
                .as_ref()
                .and_then(|b| b.due_at)
                .map_or(true, |due| paid_at <= from_millis(due));
            let flags = if on_time {
                PciFlags::on_time()
            } else {
                PciFlags::delayed()
            };
            (flags, format!("settled:{payment_id}"), coins, duplicate)
        }
        _ => (PciFlags::failed(), format!("failed:{payment_id}"), 0, false),
    };

    let pci = pci::record_event(pool, &uid, Some(&marker), paid_at, flags, now).await?;

    info!(
        "Processed {} for {uid}: payment {payment_id}, {coins_awarded} coins, PCI {:.2}",
        event.event, pci.score
    );
    Ok(SettlementOutcome::Processed {
        user_id: uid,
        coins_awarded,
        score: pci.score,
        duplicate: duplicate || !pci.applied,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{ensure_user, get_user, register_bill, test_pool};
    use crate::invariants;
    use chrono::{Duration, TimeZone};
    use serde_json::json;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 4, 15, 10, 0, 0).unwrap()
    }

    fn body(event: &str, payment_id: &str, amount: i64, at: DateTime<Utc>, notes: Value) -> Vec<u8> {
        serde_json::to_vec(&json!({
            "entity": "event",
            "event": event,
            "payload": {
                "payment": {
                    "entity": {
                        "id": payment_id,
                        "amount": amount,
                        "currency": "INR",
                        "created_at": at.timestamp(),
                        "notes": notes,
                    }
                }
            }
        }))
        .unwrap()
    }

    #[test]
    fn signature_round_trip() {
        let payload = br#"{"event":"payment.captured"}"#;
        let signature = sign(b"secret", payload).unwrap();
        assert_eq!(signature.len(), 64);
        assert!(verify_signature(b"secret", payload, &signature).is_ok());
    }

    #[test]
    fn known_hmac_vector() {
        // RFC 4231 test case 2.
        assert_eq!(
            sign(b"Jefe", b"what do ya want for nothing?").unwrap(),
            "5bdcc146bf60754e6a042426089575c75a003f089d2739839dec58b964ec3843"
        );
    }

    #[test]
    fn tampered_or_malformed_signatures_are_rejected() {
        let payload = br#"{"event":"payment.captured"}"#;
        let signature = sign(b"secret", payload).unwrap();

        let tampered = br#"{"event":"payment.captured "}"#;
        for (body, sig) in [
            (&tampered[..], signature.clone()),
            (&payload[..], sign(b"other", payload).unwrap()),
            (&payload[..], signature.to_uppercase()),
            (&payload[..], signature[..63].to_string()),
            (&payload[..], String::new()),
            (&payload[..], "zz".repeat(32)),
        ] {
            assert!(matches!(
                verify_signature(b"secret", body, &sig),
                Err(LedgerError::SignatureInvalid)
            ));
        }
    }

    #[test]
    fn parse_captured_payment() {
        let raw = body(
            "payment.captured",
            "pay_1",
            25_000,
            t0(),
            json!({ "billId": "bill_1", "voucherId": "v_1", "userId": "alice" }),
        );
        let event = SettlementEvent::parse(&raw).unwrap();
        assert_eq!(event.kind, SettlementKind::Captured);
        assert_eq!(event.payment_id.as_deref(), Some("pay_1"));
        assert_eq!(event.amount, 25_000);
        assert_eq!(event.created_at, Some(t0()));
        assert_eq!(event.bill_id.as_deref(), Some("bill_1"));
        assert_eq!(event.voucher_id.as_deref(), Some("v_1"));
        assert_eq!(event.user_id.as_deref(), Some("alice"));
    }

    #[test]
    fn parse_tolerates_empty_notes_and_uses_order_notes() {
        let raw = serde_json::to_vec(&json!({
            "event": "order.paid",
            "payload": {
                "payment": { "entity": { "id": "pay_2", "amount": 100, "notes": [] } },
                "order": { "entity": { "id": "order_1", "notes": { "billId": "bill_9" } } }
            }
        }))
        .unwrap();
        let event = SettlementEvent::parse(&raw).unwrap();
        assert_eq!(event.kind, SettlementKind::Captured);
        assert_eq!(event.bill_id.as_deref(), Some("bill_9"));
        assert!(event.created_at.is_none());
    }

    #[test]
    fn parse_rejects_payment_event_without_entity() {
        let raw = br#"{"event":"payment.failed","payload":{}}"#;
        assert!(matches!(
            SettlementEvent::parse(raw),
            Err(LedgerError::EventParse(_))
        ));
        assert!(matches!(
            SettlementEvent::parse(b"not json"),
            Err(LedgerError::Json(_))
        ));
    }

    #[test]
    fn event_classification() {
        assert_eq!(SettlementKind::from_event("payment.captured"), SettlementKind::Captured);
        assert_eq!(SettlementKind::from_event("order.paid"), SettlementKind::Captured);
        assert_eq!(SettlementKind::from_event("payment.failed"), SettlementKind::Failed);
        assert_eq!(SettlementKind::from_event("refund.created"), SettlementKind::Ignored);
    }

    #[tokio::test]
    async fn duplicate_delivery_is_applied_once() {
        let pool = test_pool().await;
        let config = Config::for_tests();
        ensure_user(&pool, "alice", t0()).await.unwrap();
        register_bill(&pool, "alice", "bill_1", 25_000, Some(t0() + Duration::days(2)))
            .await
            .unwrap();

        let raw = body("payment.captured", "pay_1", 25_000, t0(), json!({ "billId": "bill_1" }));
        let event = SettlementEvent::parse(&raw).unwrap();

        let first = process(&pool, &config, &event, t0()).await.unwrap();
        let SettlementOutcome::Processed {
            coins_awarded,
            duplicate,
            score,
            ..
        } = first
        else {
            panic!("expected processed outcome");
        };
        assert_eq!(coins_awarded, 250);
        assert!(!duplicate);
        assert!((score - 650.4).abs() < 1e-9);

        let second = process(&pool, &config, &event, t0() + Duration::minutes(5))
            .await
            .unwrap();
        assert!(matches!(
            second,
            SettlementOutcome::Processed { duplicate: true, .. }
        ));

        // order.paid for the same payment is the same settlement.
        let order_paid = SettlementEvent {
            event: "order.paid".to_string(),
            ..event.clone()
        };
        process(&pool, &config, &order_paid, t0()).await.unwrap();

        let user = get_user(&pool, "alice").await.unwrap();
        assert_eq!(user.coin_balance, 250);
        assert!((user.pci_score - 650.4).abs() < 1e-9);
        assert_eq!(user.pci_streak_days, 1);
        invariants::assert_balance_matches_ledger(&pool, "alice").await;

        let bill = db::find_bill(&pool, "bill_1").await.unwrap().unwrap();
        assert_eq!(bill.status, "paid");
    }

    #[tokio::test]
    async fn late_payment_is_delayed_and_failure_resets() {
        let pool = test_pool().await;
        let config = Config::for_tests();
        ensure_user(&pool, "bob", t0()).await.unwrap();
        register_bill(&pool, "bob", "bill_late", 10_000, Some(t0() - Duration::days(1)))
            .await
            .unwrap();

        let late = SettlementEvent::parse(&body(
            "payment.captured",
            "pay_late",
            10_000,
            t0(),
            json!({ "billId": "bill_late" }),
        ))
        .unwrap();
        process(&pool, &config, &late, t0()).await.unwrap();
        let user = get_user(&pool, "bob").await.unwrap();
        assert!((user.pci_score - (0.9 * 650.0 + 0.1 * 640.0)).abs() < 1e-9);
        assert_eq!(user.coin_balance, 100);

        let failed_at = t0() + Duration::days(1);
        let failed = SettlementEvent::parse(&body(
            "payment.failed",
            "pay_fail",
            10_000,
            failed_at,
            json!({ "userId": "bob" }),
        ))
        .unwrap();
        let outcome = process(&pool, &config, &failed, failed_at).await.unwrap();
        assert!(matches!(
            outcome,
            SettlementOutcome::Processed { coins_awarded: 0, .. }
        ));
        let user = get_user(&pool, "bob").await.unwrap();
        assert_eq!(user.pci_streak_days, 0);
        assert_eq!(user.coin_balance, 100);
    }

    #[tokio::test]
    async fn captured_payment_retires_voucher() {
        let pool = test_pool().await;
        let config = Config::for_tests();
        ensure_user(&pool, "carol", t0()).await.unwrap();
        ledger::award(&pool, "carol", "seed", 1_000, "seed", t0()).await.unwrap();
        let voucher = ledger::create_voucher(&pool, "carol", 100, t0()).await.unwrap();

        let event = SettlementEvent::parse(&body(
            "payment.captured",
            "pay_v",
            50,
            t0(),
            json!({ "userId": "carol", "voucherId": voucher.id }),
        ))
        .unwrap();
        let outcome = process(&pool, &config, &event, t0()).await.unwrap();
        // Less than a rupee earns nothing, but the payment still counts.
        assert!(matches!(
            outcome,
            SettlementOutcome::Processed { coins_awarded: 0, .. }
        ));

        let vouchers = ledger::list_vouchers(&pool, "carol").await.unwrap();
        assert!(vouchers[0].is_used());
        assert_eq!(get_user(&pool, "carol").await.unwrap().pci_streak_days, 1);
    }

    #[tokio::test]
    async fn unresolvable_and_unhandled_events_are_ignored() {
        let pool = test_pool().await;
        let config = Config::for_tests();

        let orphan = SettlementEvent::parse(&body(
            "payment.captured",
            "pay_x",
            500,
            t0(),
            json!({ "billId": "unknown" }),
        ))
        .unwrap();
        assert!(matches!(
            process(&pool, &config, &orphan, t0()).await.unwrap(),
            SettlementOutcome::Ignored { .. }
        ));

        let refund = SettlementEvent::parse(br#"{"event":"refund.created","payload":{}}"#).unwrap();
        assert!(matches!(
            process(&pool, &config, &refund, t0()).await.unwrap(),
            SettlementOutcome::Ignored { .. }
        ));
    }

    #[tokio::test]
    async fn webhook_creates_user_lazily() {
        let pool = test_pool().await;
        let config = Config::for_tests();
        let event = SettlementEvent::parse(&body(
            "payment.captured",
            "pay_new",
            300,
            t0(),
            json!({ "userId": "dave" }),
        ))
        .unwrap();
        process(&pool, &config, &event, t0()).await.unwrap();
        let user = get_user(&pool, "dave").await.unwrap();
        assert_eq!(user.coin_balance, 3);
    }
}
