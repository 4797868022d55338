//! Persistent ledger of notification attempts.
//!
//! The ledger answers two questions: "have we already told this customer
//! about this card" and "did anything fail recently". Expiry notices go
//! through an atomic claim so that redelivered or concurrent webhooks can
//! never produce a duplicate email.

use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::NotifyResult;

/// How long a claimed notice stays exclusively owned before another delivery
/// may retry it.
const CLAIM_TIMEOUT_MINUTES: i32 = 30;

/// An expired-card prompt waits this long after the expiring-soon notice.
const PROMPT_DELAY_MONTHS: i32 = 2;

/// The error-monitor endpoint alerts on failures within this window.
pub const ERROR_MONITOR_WINDOW_MINUTES: i32 = 30;

/// Notification kinds recorded in the ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    CardExpiringSoon,
    CardExpired,
    Cancelled,
    AmountUpdated,
    Receipt,
}

impl EventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::CardExpiringSoon => "card_expiring_soon",
            EventKind::CardExpired => "card_expired",
            EventKind::Cancelled => "cancelled",
            EventKind::AmountUpdated => "amount_updated",
            EventKind::Receipt => "receipt",
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A stored notification attempt.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct NotificationRecord {
    pub id: Uuid,
    pub customer_id: String,
    pub event_kind: String,
    pub customer_email: Option<String>,
    pub customer_name: Option<String>,
    pub subscription_id: Option<String>,
    pub card_fingerprint: Option<String>,
    pub card_last4: Option<String>,
    pub card_exp_month: Option<i16>,
    pub card_exp_year: Option<i16>,
    pub successful: bool,
    pub detail: Option<String>,
    pub prompt_sent_after_two_months: bool,
    pub card_updated_since_notice: bool,
    pub created_at: OffsetDateTime,
}

/// A new attempt or diagnostic entry, written once with its final outcome.
#[derive(Debug, Clone)]
pub struct NewRecord {
    pub customer_id: String,
    pub event_kind: EventKind,
    pub customer_email: Option<String>,
    pub customer_name: Option<String>,
    pub subscription_id: Option<String>,
    pub card_fingerprint: Option<String>,
    pub card_last4: Option<String>,
    pub card_exp_month: Option<i16>,
    pub card_exp_year: Option<i16>,
    pub successful: bool,
    pub detail: Option<String>,
}

/// Parameters for claiming an expiry notice before sending it.
///
/// A claim always identifies the exact card; fingerprint plus last4 is what
/// makes a replacement card eligible again.
#[derive(Debug, Clone)]
pub struct NoticeClaim {
    pub customer_id: String,
    pub event_kind: EventKind,
    pub customer_email: Option<String>,
    pub customer_name: Option<String>,
    pub subscription_id: String,
    pub card_fingerprint: String,
    pub card_last4: String,
    pub card_exp_month: i16,
    pub card_exp_year: i16,
}

#[derive(Clone)]
pub struct NotificationLedger {
    pool: PgPool,
}

impl NotificationLedger {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Most recent record for this customer and kind, if any.
    pub async fn find_recent_record(
        &self,
        customer_id: &str,
        kind: EventKind,
    ) -> NotifyResult<Option<NotificationRecord>> {
        let record = sqlx::query_as::<_, NotificationRecord>(
            r#"
            SELECT id, customer_id, event_kind, customer_email, customer_name,
                   subscription_id, card_fingerprint, card_last4, card_exp_month,
                   card_exp_year, successful, detail, prompt_sent_after_two_months,
                   card_updated_since_notice, created_at
            FROM notification_records
            WHERE customer_id = $1 AND event_kind = $2
            ORDER BY created_at DESC, id DESC
            LIMIT 1
            "#,
        )
        .bind(customer_id)
        .bind(kind.as_str())
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }

    /// Most recent record of this kind created at least the prompt delay ago.
    ///
    /// Used to decide whether a customer ignored the expiring-soon notice for
    /// long enough to deserve the follow-up prompt.
    pub async fn find_aged_record(
        &self,
        customer_id: &str,
        kind: EventKind,
    ) -> NotifyResult<Option<NotificationRecord>> {
        let record = sqlx::query_as::<_, NotificationRecord>(
            r#"
            SELECT id, customer_id, event_kind, customer_email, customer_name,
                   subscription_id, card_fingerprint, card_last4, card_exp_month,
                   card_exp_year, successful, detail, prompt_sent_after_two_months,
                   card_updated_since_notice, created_at
            FROM notification_records
            WHERE customer_id = $1 AND event_kind = $2
              AND created_at <= NOW() - ($3 || ' months')::INTERVAL
            ORDER BY created_at DESC, id DESC
            LIMIT 1
            "#,
        )
        .bind(customer_id)
        .bind(kind.as_str())
        .bind(PROMPT_DELAY_MONTHS)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }

    /// Whether a notification of this kind already went out for this exact
    /// card.
    ///
    /// Only the most recent record counts, and it must match fingerprint and
    /// last4 together. A new card therefore resets eligibility even when the
    /// old one was notified.
    pub async fn has_been_notified(
        &self,
        customer_id: &str,
        kind: EventKind,
        fingerprint: &str,
        last4: &str,
    ) -> NotifyResult<bool> {
        let record = self.find_recent_record(customer_id, kind).await?;
        Ok(record
            .map(|r| {
                r.successful
                    && r.card_fingerprint.as_deref() == Some(fingerprint)
                    && r.card_last4.as_deref() == Some(last4)
            })
            .unwrap_or(false))
    }

    /// Atomically claim an expiry notice, returning the claimed record id.
    ///
    /// Exactly one caller wins for a given customer, kind and card. A row
    /// whose send failed can be re-claimed once the claim timeout passes;
    /// a row whose send succeeded is never re-claimed.
    ///
    /// Returns `None` when another delivery holds the claim or the notice
    /// was already sent.
    pub async fn claim_notice(&self, claim: &NoticeClaim) -> NotifyResult<Option<Uuid>> {
        let claimed = sqlx::query_as::<_, (Uuid,)>(
            r#"
            INSERT INTO notification_records
                (customer_id, event_kind, customer_email, customer_name,
                 subscription_id, card_fingerprint, card_last4,
                 card_exp_month, card_exp_year, successful, detail)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, FALSE, 'claimed')
            ON CONFLICT (customer_id, event_kind, card_fingerprint, card_last4)
                WHERE event_kind IN ('card_expiring_soon', 'card_expired')
                  AND card_fingerprint IS NOT NULL
            DO UPDATE SET
                customer_email = EXCLUDED.customer_email,
                customer_name = EXCLUDED.customer_name,
                subscription_id = EXCLUDED.subscription_id,
                card_exp_month = EXCLUDED.card_exp_month,
                card_exp_year = EXCLUDED.card_exp_year,
                detail = 'reclaimed after failed send',
                created_at = NOW()
            WHERE notification_records.successful = FALSE
              AND notification_records.created_at < NOW() - ($10 || ' minutes')::INTERVAL
            RETURNING id
            "#,
        )
        .bind(&claim.customer_id)
        .bind(claim.event_kind.as_str())
        .bind(&claim.customer_email)
        .bind(&claim.customer_name)
        .bind(&claim.subscription_id)
        .bind(&claim.card_fingerprint)
        .bind(&claim.card_last4)
        .bind(claim.card_exp_month)
        .bind(claim.card_exp_year)
        .bind(CLAIM_TIMEOUT_MINUTES)
        .fetch_optional(&self.pool)
        .await?;

        Ok(claimed.map(|(id,)| id))
    }

    /// Record the send outcome on a previously claimed notice.
    pub async fn complete_claim(
        &self,
        record_id: Uuid,
        successful: bool,
        detail: &str,
    ) -> NotifyResult<()> {
        sqlx::query(
            "UPDATE notification_records SET successful = $2, detail = $3 WHERE id = $1",
        )
        .bind(record_id)
        .bind(successful)
        .bind(detail)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Insert a finished attempt or diagnostic entry.
    pub async fn record_attempt(&self, record: NewRecord) -> NotifyResult<Uuid> {
        let (id,) = sqlx::query_as::<_, (Uuid,)>(
            r#"
            INSERT INTO notification_records
                (customer_id, event_kind, customer_email, customer_name,
                 subscription_id, card_fingerprint, card_last4,
                 card_exp_month, card_exp_year, successful, detail)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            RETURNING id
            "#,
        )
        .bind(&record.customer_id)
        .bind(record.event_kind.as_str())
        .bind(&record.customer_email)
        .bind(&record.customer_name)
        .bind(&record.subscription_id)
        .bind(&record.card_fingerprint)
        .bind(&record.card_last4)
        .bind(record.card_exp_month)
        .bind(record.card_exp_year)
        .bind(record.successful)
        .bind(&record.detail)
        .fetch_one(&self.pool)
        .await?;

        Ok(id)
    }

    /// Flag that the expired-card prompt went out for this notice.
    /// The flag never goes back to false.
    pub async fn mark_prompt_sent(&self, record_id: Uuid) -> NotifyResult<()> {
        sqlx::query(
            r#"
            UPDATE notification_records
            SET prompt_sent_after_two_months = TRUE
            WHERE id = $1 AND prompt_sent_after_two_months = FALSE
            "#,
        )
        .bind(record_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Flag that the customer replaced their card after this notice.
    /// The flag never goes back to false.
    pub async fn mark_card_updated(&self, record_id: Uuid) -> NotifyResult<()> {
        sqlx::query(
            r#"
            UPDATE notification_records
            SET card_updated_since_notice = TRUE
            WHERE id = $1 AND card_updated_since_notice = FALSE
            "#,
        )
        .bind(record_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Most recent failed attempt inside the window, if any.
    pub async fn latest_failure_within_minutes(
        &self,
        minutes: i32,
    ) -> NotifyResult<Option<NotificationRecord>> {
        let record = sqlx::query_as::<_, NotificationRecord>(
            r#"
            SELECT id, customer_id, event_kind, customer_email, customer_name,
                   subscription_id, card_fingerprint, card_last4, card_exp_month,
                   card_exp_year, successful, detail, prompt_sent_after_two_months,
                   card_updated_since_notice, created_at
            FROM notification_records
            WHERE successful = FALSE
              AND created_at > NOW() - ($1 || ' minutes')::INTERVAL
            ORDER BY created_at DESC, id DESC
            LIMIT 1
            "#,
        )
        .bind(minutes)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }

    /// Upsert a payment intent for checkout polling.
    pub async fn record_payment_intent(
        &self,
        intent_id: &str,
        status: &str,
        amount_cents: i64,
    ) -> NotifyResult<()> {
        sqlx::query(
            r#"
            INSERT INTO payment_intent_log (intent_id, status, amount_cents)
            VALUES ($1, $2, $3)
            ON CONFLICT (intent_id) DO UPDATE SET
                status = EXCLUDED.status,
                amount_cents = EXCLUDED.amount_cents
            "#,
        )
        .bind(intent_id)
        .bind(status)
        .bind(amount_cents)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Status of a logged payment intent, if we have seen it.
    pub async fn payment_intent_status(&self, intent_id: &str) -> NotifyResult<Option<String>> {
        let row = sqlx::query_as::<_, (String,)>(
            "SELECT status FROM payment_intent_log WHERE intent_id = $1",
        )
        .bind(intent_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|(status,)| status))
    }
}
