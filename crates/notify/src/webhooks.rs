//! Webhook verification and notification orchestration.
//!
//! Every event follows the same shape: verify, classify, assemble the
//! customer context, consult the ledger, act, record the outcome. External
//! failures inside a flow are logged and recorded but never bubble up, so
//! the HTTP layer can acknowledge receipt no matter what went wrong
//! downstream.

use chrono::Utc;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use sqlx::PgPool;
use stripe::{Customer, Expandable, Subscription};

use crate::client::CustomerDirectory;
use crate::crm::{self, CardRecord, CrmService, PaymentMetadata, PaymentRecord, RefundRecord, SubscriptionRecord};
use crate::dates;
use crate::email::{self, EmailService, SendOutcome};
use crate::error::{NotifyError, NotifyResult};
use crate::events::{
    BusinessEvent, CardSnapshot, ChargeSnapshot, InvoiceSnapshot, PaymentIntentSnapshot,
    SubscriptionSnapshot, WebhookEvent,
};
use crate::ledger::{EventKind, NewRecord, NoticeClaim, NotificationLedger, NotificationRecord};

type HmacSha256 = Hmac<Sha256>;

/// Maximum age of a signed webhook before it is rejected as a replay.
const SIGNATURE_TOLERANCE_SECS: i64 = 300;

/// Payment decline code that identifies an expired card.
const EXPIRED_CARD_DECLINE_CODE: &str = "expired_card";

/// Subscription statuses that keep a customer eligible for notices.
/// Past-due stays in: that is exactly the state an expired card causes.
const NOTIFIABLE_STATUSES: [&str; 2] = ["active", "past_due"];

const NO_MATCHING_SUBSCRIPTION_DETAIL: &str =
    "Can't find an active subscription which matches the invoice.";
const NO_EMAIL_DETAIL: &str = "customer has no email address";

/// Card details taken from an expanded default payment method.
#[derive(Debug, Clone)]
pub struct CardDetails {
    pub brand: String,
    pub last4: String,
    pub exp_month: u32,
    pub exp_year: i32,
    pub fingerprint: Option<String>,
}

/// Everything the notification flows need about one customer, assembled once
/// per event and read-only from then on.
#[derive(Debug, Clone)]
pub struct NotificationContext {
    pub customer_id: String,
    pub email: Option<String>,
    pub name: Option<String>,
    pub subscription_id: String,
    pub subscription_status: String,
    pub subscription_start: i64,
    pub amount_cents: i64,
    pub card: Option<CardDetails>,
}

pub struct WebhookProcessor {
    directory: CustomerDirectory,
    ledger: NotificationLedger,
    email: EmailService,
    crm: CrmService,
    webhook_secret: String,
    timestamp_offset_hours: i64,
}

impl WebhookProcessor {
    pub fn new(
        directory: CustomerDirectory,
        ledger: NotificationLedger,
        email: EmailService,
        crm: CrmService,
        webhook_secret: String,
        timestamp_offset_hours: i64,
    ) -> Self {
        Self {
            directory,
            ledger,
            email,
            crm,
            webhook_secret,
            timestamp_offset_hours,
        }
    }

    pub fn from_env(pool: PgPool) -> NotifyResult<Self> {
        let webhook_secret = std::env::var("STRIPE_WEBHOOK_SECRET")
            .map_err(|_| NotifyError::Config("STRIPE_WEBHOOK_SECRET not set".to_string()))?;
        let timestamp_offset_hours = std::env::var("TIMESTAMP_OFFSET_HOURS")
            .ok()
            .and_then(|value| value.parse().ok())
            .unwrap_or(0);

        Ok(Self::new(
            CustomerDirectory::from_env()?,
            NotificationLedger::new(pool),
            EmailService::from_env()?,
            CrmService::from_env(),
            webhook_secret,
            timestamp_offset_hours,
        ))
    }

    pub fn crm_enabled(&self) -> bool {
        self.crm.is_enabled()
    }

    /// Verify the provider signature and parse the payload.
    ///
    /// The header carries `t=<unix>,v1=<hex>` pairs; the v1 value is
    /// HMAC-SHA256 over `"{t}.{payload}"` keyed with the endpoint secret
    /// (minus its `whsec_` prefix).
    pub fn verify_and_parse(&self, payload: &str, signature_header: &str) -> NotifyResult<WebhookEvent> {
        let mut timestamp: Option<i64> = None;
        let mut v1_signature: Option<String> = None;

        for part in signature_header.split(',') {
            let kv: Vec<&str> = part.splitn(2, '=').collect();
            if kv.len() == 2 {
                match kv[0].trim() {
                    "t" => timestamp = kv[1].trim().parse().ok(),
                    "v1" => v1_signature = Some(kv[1].trim().to_string()),
                    _ => {}
                }
            }
        }

        let timestamp = timestamp.ok_or_else(|| {
            tracing::warn!("Webhook signature header carries no timestamp");
            NotifyError::WebhookSignatureInvalid
        })?;
        let v1_signature = v1_signature.ok_or_else(|| {
            tracing::warn!("Webhook signature header carries no v1 signature");
            NotifyError::WebhookSignatureInvalid
        })?;

        let now = Utc::now().timestamp();
        if (now - timestamp).abs() > SIGNATURE_TOLERANCE_SECS {
            tracing::warn!(timestamp, now, "Webhook timestamp outside tolerance");
            return Err(NotifyError::WebhookSignatureInvalid);
        }

        let secret = self
            .webhook_secret
            .strip_prefix("whsec_")
            .unwrap_or(&self.webhook_secret);
        let signed_payload = format!("{}.{}", timestamp, payload);
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
            .map_err(|_| NotifyError::WebhookSignatureInvalid)?;
        mac.update(signed_payload.as_bytes());
        let computed = hex::encode(mac.finalize().into_bytes());

        if computed != v1_signature {
            tracing::warn!("Webhook signature mismatch");
            return Err(NotifyError::WebhookSignatureInvalid);
        }

        let event: WebhookEvent = serde_json::from_str(payload)?;
        Ok(event)
    }

    /// Dispatch one verified event to its flow.
    pub async fn process_event(&self, event: &WebhookEvent) -> NotifyResult<()> {
        match BusinessEvent::classify(event)? {
            BusinessEvent::SubscriptionCancelled(subscription) => {
                self.handle_cancelled(event, subscription).await
            }
            BusinessEvent::CardUpdated {
                customer_id,
                subscription_id,
            } => self.handle_card_updated(&customer_id, &subscription_id).await,
            BusinessEvent::AmountUpdated {
                subscription,
                previous_amount,
                current_amount,
            } => {
                self.handle_amount_updated(subscription, previous_amount, current_amount)
                    .await
            }
            BusinessEvent::UpcomingInvoice(invoice) => self.handle_upcoming_invoice(invoice).await,
            BusinessEvent::PaymentFailed(invoice) => self.handle_payment_failed(invoice).await,
            BusinessEvent::PaymentSucceeded(intent) => {
                self.handle_payment_succeeded(event, intent).await
            }
            BusinessEvent::RefundIssued(charge) => self.handle_refund(charge).await,
            BusinessEvent::Unhandled => {
                tracing::info!(
                    event_type = %event.event_type,
                    event_id = %event.id,
                    "No handler for this provider event"
                );
                Ok(())
            }
        }
    }

    /// Cancellation: goodbye email, ledger entry, CRM push.
    async fn handle_cancelled(
        &self,
        event: &WebhookEvent,
        subscription: SubscriptionSnapshot,
    ) -> NotifyResult<()> {
        tracing::info!(
            subscription_id = %subscription.id,
            customer_id = %subscription.customer,
            "Subscription cancelled"
        );

        // The cancelled subscription is gone from the active list, so a plain
        // customer fetch is all we need for the email address.
        let (email_to, name) = self.customer_contact(&subscription.customer).await;

        let cancelled_on =
            email::dotted_date(&dates::date_string(event.created, self.timestamp_offset_hours));
        let amount_cents = subscription.first_plan_amount().unwrap_or(0);

        let outcome = match email_to.as_deref() {
            Some(to) => {
                self.email
                    .send_cancelled(
                        to,
                        name.as_deref().unwrap_or(""),
                        &cancelled_on,
                        &email::format_amount(amount_cents),
                    )
                    .await
            }
            None => SendOutcome::failure(NO_EMAIL_DETAIL),
        };
        self.log_send(&outcome, "cancellation", &subscription.customer);

        if let Err(e) = self
            .ledger
            .record_attempt(NewRecord {
                customer_id: subscription.customer.clone(),
                event_kind: EventKind::Cancelled,
                customer_email: email_to,
                customer_name: name,
                subscription_id: Some(subscription.id.clone()),
                card_fingerprint: None,
                card_last4: None,
                card_exp_month: None,
                card_exp_year: None,
                successful: outcome.successful,
                detail: Some(outcome.details),
            })
            .await
        {
            tracing::error!(operation = "ledger_write", error = %e, "Failed to record cancellation outcome");
        }

        let record = SubscriptionRecord {
            id: subscription.id.clone(),
            created: subscription.created.unwrap_or(event.created),
            status: subscription.status.clone(),
            amount: crm::major_units(amount_cents),
            card: CardRecord::empty(),
        };
        if let Err(e) = self.crm.push_cancellation(&record).await {
            tracing::error!(
                operation = "crm_cancellation",
                subscription_id = %subscription.id,
                error = %e,
                "CRM push failed"
            );
        }

        Ok(())
    }

    /// A replaced card sends nothing; it only annotates an outstanding expiry
    /// notice so the follow-up prompt knows to stay quiet.
    async fn handle_card_updated(&self, customer_id: &str, subscription_id: &str) -> NotifyResult<()> {
        tracing::info!(
            customer_id = %customer_id,
            subscription_id = %subscription_id,
            "Customer updated their payment card"
        );

        match self
            .ledger
            .find_recent_record(customer_id, EventKind::CardExpiringSoon)
            .await
        {
            Ok(Some(record)) if record.subscription_id.as_deref() == Some(subscription_id) => {
                if let Err(e) = self.ledger.mark_card_updated(record.id).await {
                    tracing::error!(
                        operation = "ledger_flag",
                        record_id = %record.id,
                        error = %e,
                        "Failed to flag card update on expiry notice"
                    );
                }
            }
            Ok(_) => {
                tracing::debug!(customer_id = %customer_id, "No matching expiry notice to annotate");
            }
            Err(e) => {
                tracing::error!(
                    operation = "ledger_read",
                    customer_id = %customer_id,
                    error = %e,
                    "Failed to look up expiry notice for card update"
                );
            }
        }

        Ok(())
    }

    /// Amount change: confirmation email, ledger entry, CRM push.
    async fn handle_amount_updated(
        &self,
        subscription: SubscriptionSnapshot,
        previous_amount: i64,
        current_amount: i64,
    ) -> NotifyResult<()> {
        tracing::info!(
            subscription_id = %subscription.id,
            customer_id = %subscription.customer,
            previous_amount,
            current_amount,
            "Subscription amount updated"
        );

        let (email_to, name) = self.customer_contact(&subscription.customer).await;

        let outcome = match email_to.as_deref() {
            Some(to) => {
                self.email
                    .send_amount_updated(
                        to,
                        name.as_deref().unwrap_or(""),
                        &email::format_amount(previous_amount),
                        &email::format_amount(current_amount),
                    )
                    .await
            }
            None => SendOutcome::failure(NO_EMAIL_DETAIL),
        };
        self.log_send(&outcome, "amount update", &subscription.customer);

        if let Err(e) = self
            .ledger
            .record_attempt(NewRecord {
                customer_id: subscription.customer.clone(),
                event_kind: EventKind::AmountUpdated,
                customer_email: email_to,
                customer_name: name,
                subscription_id: Some(subscription.id.clone()),
                card_fingerprint: None,
                card_last4: None,
                card_exp_month: None,
                card_exp_year: None,
                successful: outcome.successful,
                detail: Some(outcome.details),
            })
            .await
        {
            tracing::error!(operation = "ledger_write", error = %e, "Failed to record amount update outcome");
        }

        let record = SubscriptionRecord {
            id: subscription.id.clone(),
            created: subscription.created.unwrap_or(0),
            status: subscription.status.clone(),
            amount: crm::major_units(current_amount),
            card: CardRecord::empty(),
        };
        if let Err(e) = self.crm.push_subscription_update(&record).await {
            tracing::error!(
                operation = "crm_subscription_update",
                subscription_id = %subscription.id,
                error = %e,
                "CRM push failed"
            );
        }

        Ok(())
    }

    /// Upcoming renewal: check the card on file and warn the customer before
    /// the charge fails.
    async fn handle_upcoming_invoice(&self, invoice: InvoiceSnapshot) -> NotifyResult<()> {
        let customer_id = match invoice.customer.as_deref() {
            Some(id) => id,
            None => {
                tracing::warn!("Upcoming invoice carries no customer - nothing to check");
                return Ok(());
            }
        };

        let context = match self
            .resolve_context(customer_id, invoice.subscription.as_deref())
            .await
        {
            Ok(Some(context)) => context,
            Ok(None) => {
                self.log_expiry_note(
                    customer_id,
                    EventKind::CardExpiringSoon,
                    invoice.subscription.as_deref(),
                    NO_MATCHING_SUBSCRIPTION_DETAIL,
                )
                .await;
                return Ok(());
            }
            Err(e) => {
                tracing::error!(
                    operation = "context_fetch",
                    customer_id = %customer_id,
                    error = %e,
                    "Failed to resolve customer for upcoming invoice"
                );
                return Ok(());
            }
        };

        let card = match context.card.clone() {
            Some(card) => card,
            None => {
                self.log_expiry_note(
                    &context.customer_id,
                    EventKind::CardExpiringSoon,
                    Some(&context.subscription_id),
                    "subscription has no card on file",
                )
                .await;
                return Ok(());
            }
        };

        let today = Utc::now().date_naive();
        if dates::is_expired(card.exp_month, card.exp_year, today) {
            // Past warning about this one. Hand it straight to the
            // expired-card prompt, whose own gates still apply.
            tracing::info!(
                customer_id = %context.customer_id,
                "Card on upcoming invoice is already expired"
            );
            self.send_expired_prompt(&context, &card).await;
            return Ok(());
        }
        if !dates::is_expiring_soon(card.exp_month, card.exp_year, today) {
            tracing::debug!(
                customer_id = %context.customer_id,
                "Card valid beyond next month - nothing to send"
            );
            return Ok(());
        }

        self.send_expiring_soon_notice(&context, &card).await;
        Ok(())
    }

    /// Failed renewal: only an `expired_card` decline leads anywhere, and
    /// then only through the expired-prompt gates.
    async fn handle_payment_failed(&self, invoice: InvoiceSnapshot) -> NotifyResult<()> {
        let intent_id = match invoice.payment_intent.as_deref() {
            Some(id) => id,
            None => {
                tracing::debug!("Payment failure carries no payment intent - ignoring");
                return Ok(());
            }
        };

        let decline_code = match self.directory.payment_intent(intent_id).await {
            Ok(intent) => intent
                .last_payment_error
                .as_ref()
                .and_then(|error| error.decline_code.clone()),
            Err(e) => {
                tracing::error!(
                    operation = "intent_fetch",
                    intent_id = %intent_id,
                    error = %e,
                    "Failed to fetch failed payment intent"
                );
                return Ok(());
            }
        };

        if decline_code.as_deref() != Some(EXPIRED_CARD_DECLINE_CODE) {
            tracing::debug!(
                intent_id = %intent_id,
                decline_code = ?decline_code,
                "Payment failure not caused by an expired card - ignoring"
            );
            return Ok(());
        }

        let customer_id = match invoice.customer.as_deref() {
            Some(id) => id,
            None => {
                tracing::warn!(intent_id = %intent_id, "Failed payment carries no customer");
                return Ok(());
            }
        };

        let context = match self
            .resolve_context(customer_id, invoice.subscription.as_deref())
            .await
        {
            Ok(Some(context)) => context,
            Ok(None) => {
                self.log_expiry_note(
                    customer_id,
                    EventKind::CardExpired,
                    invoice.subscription.as_deref(),
                    NO_MATCHING_SUBSCRIPTION_DETAIL,
                )
                .await;
                return Ok(());
            }
            Err(e) => {
                tracing::error!(
                    operation = "context_fetch",
                    customer_id = %customer_id,
                    error = %e,
                    "Failed to resolve customer for failed payment"
                );
                return Ok(());
            }
        };

        let card = match context.card.clone() {
            Some(card) => card,
            None => {
                self.log_expiry_note(
                    &context.customer_id,
                    EventKind::CardExpired,
                    Some(&context.subscription_id),
                    "subscription has no card on file",
                )
                .await;
                return Ok(());
            }
        };

        self.send_expired_prompt(&context, &card).await;
        Ok(())
    }

    /// Successful payment: poll log, CRM push, receipt when we know where to
    /// send one.
    async fn handle_payment_succeeded(
        &self,
        event: &WebhookEvent,
        intent: PaymentIntentSnapshot,
    ) -> NotifyResult<()> {
        tracing::info!(
            intent_id = %intent.id,
            amount = ?intent.amount,
            "Payment succeeded"
        );

        if let Err(e) = self
            .ledger
            .record_payment_intent(&intent.id, &intent.status, intent.amount.unwrap_or(0))
            .await
        {
            tracing::error!(
                operation = "intent_log",
                intent_id = %intent.id,
                error = %e,
                "Failed to log successful payment intent"
            );
        }

        let (customer_email, name) = match intent.customer.as_deref() {
            Some(customer_id) => self.customer_contact(customer_id).await,
            None => (None, None),
        };
        let email_to = customer_email.or_else(|| intent.receipt_email.clone());

        let payment = build_payment_record(&intent, name.as_deref(), email_to.as_deref());
        if let Err(e) = self.crm.push_payment(&payment).await {
            tracing::error!(
                operation = "crm_payment",
                intent_id = %intent.id,
                error = %e,
                "CRM push failed"
            );
        }

        // One-off donations can be anonymous; a missing address is normal
        // there, so nothing is recorded when no receipt can go out.
        let Some(to) = email_to.as_deref() else {
            tracing::info!(intent_id = %intent.id, "No email address on payment - receipt skipped");
            return Ok(());
        };

        let paid_on = email::dotted_date(&dates::date_string(
            intent.created.unwrap_or(event.created),
            self.timestamp_offset_hours,
        ));
        let outcome = self
            .email
            .send_receipt(
                to,
                name.as_deref().unwrap_or(""),
                &paid_on,
                intent.description.as_deref().unwrap_or("Donation"),
                &email::format_amount(intent.amount.unwrap_or(0)),
            )
            .await;
        self.log_send(&outcome, "receipt", intent.customer.as_deref().unwrap_or(&intent.id));

        if let Err(e) = self
            .ledger
            .record_attempt(NewRecord {
                customer_id: intent.customer.clone().unwrap_or_else(|| intent.id.clone()),
                event_kind: EventKind::Receipt,
                customer_email: Some(to.to_string()),
                customer_name: name,
                subscription_id: None,
                card_fingerprint: None,
                card_last4: None,
                card_exp_month: None,
                card_exp_year: None,
                successful: outcome.successful,
                detail: Some(outcome.details),
            })
            .await
        {
            tracing::error!(operation = "ledger_write", error = %e, "Failed to record receipt outcome");
        }

        Ok(())
    }

    /// Refunds only go to the CRM; the provider already emails the customer.
    async fn handle_refund(&self, charge: ChargeSnapshot) -> NotifyResult<()> {
        let refund = match charge.refunds.data.first() {
            Some(refund) => refund,
            None => {
                tracing::warn!(charge_id = %charge.id, "Refund event carries no refund entries");
                return Ok(());
            }
        };

        let record = RefundRecord {
            id: refund.id.clone(),
            payment_intent_id: charge.payment_intent.clone().unwrap_or_default(),
            created: refund.created.unwrap_or(0),
            amount: crm::major_units(refund.amount.unwrap_or(0)),
            status: refund.status.clone(),
            reason: refund.reason.clone().unwrap_or_default(),
        };
        tracing::info!(refund_id = %record.id, amount = record.amount, "Refund issued");

        if let Err(e) = self.crm.push_refund(&record).await {
            tracing::error!(
                operation = "crm_refund",
                refund_id = %record.id,
                error = %e,
                "CRM push failed"
            );
        }

        Ok(())
    }

    /// Expiring-soon notice: dedup check, atomic claim, send, record.
    async fn send_expiring_soon_notice(&self, context: &NotificationContext, card: &CardDetails) {
        let fingerprint = match card.fingerprint.as_deref() {
            Some(fingerprint) => fingerprint,
            None => {
                self.log_expiry_note(
                    &context.customer_id,
                    EventKind::CardExpiringSoon,
                    Some(&context.subscription_id),
                    "card has no fingerprint - cannot deduplicate",
                )
                .await;
                return;
            }
        };

        match self
            .ledger
            .has_been_notified(
                &context.customer_id,
                EventKind::CardExpiringSoon,
                fingerprint,
                &card.last4,
            )
            .await
        {
            Ok(true) => {
                tracing::info!(
                    customer_id = %context.customer_id,
                    "Already notified about this card - skipping"
                );
                return;
            }
            Ok(false) => {}
            Err(e) => {
                // Fail closed: a skipped notice beats a duplicate one.
                tracing::error!(
                    operation = "ledger_read",
                    customer_id = %context.customer_id,
                    error = %e,
                    "Dedup check failed - skipping send"
                );
                return;
            }
        }

        let Some(claim_id) = self
            .claim(context, card, fingerprint, EventKind::CardExpiringSoon)
            .await
        else {
            return;
        };

        let outcome = match context.email.as_deref() {
            Some(to) => {
                self.email
                    .send_expiring_soon(
                        to,
                        context.name.as_deref().unwrap_or(""),
                        &card.brand,
                        &card.last4,
                        card.exp_month,
                        card.exp_year,
                    )
                    .await
            }
            None => SendOutcome::failure(NO_EMAIL_DETAIL),
        };
        self.log_send(&outcome, "expiring-soon notice", &context.customer_id);

        if let Err(e) = self
            .ledger
            .complete_claim(claim_id, outcome.successful, &outcome.details)
            .await
        {
            tracing::error!(
                operation = "ledger_write",
                record_id = %claim_id,
                error = %e,
                "Failed to record expiring-soon outcome"
            );
        }
    }

    /// Expired-card prompt: gate on the earlier notice, claim, send, and flag
    /// the notice so the prompt never repeats.
    async fn send_expired_prompt(&self, context: &NotificationContext, card: &CardDetails) {
        let notice = match self
            .ledger
            .find_aged_record(&context.customer_id, EventKind::CardExpiringSoon)
            .await
        {
            Ok(notice) => notice,
            Err(e) => {
                // Fail closed here too.
                tracing::error!(
                    operation = "ledger_read",
                    customer_id = %context.customer_id,
                    error = %e,
                    "Failed to look up expiry notice - skipping prompt"
                );
                return;
            }
        };

        let notice = match expired_prompt_gate(notice.as_ref(), &context.subscription_id) {
            Ok(notice) => notice,
            Err(reason) => {
                tracing::info!(
                    customer_id = %context.customer_id,
                    reason,
                    "Customer not prompted about expired card"
                );
                self.log_expiry_note(
                    &context.customer_id,
                    EventKind::CardExpired,
                    Some(&context.subscription_id),
                    reason,
                )
                .await;
                return;
            }
        };

        let fingerprint = match card.fingerprint.as_deref() {
            Some(fingerprint) => fingerprint,
            None => {
                self.log_expiry_note(
                    &context.customer_id,
                    EventKind::CardExpired,
                    Some(&context.subscription_id),
                    "card has no fingerprint - cannot deduplicate",
                )
                .await;
                return;
            }
        };

        let Some(claim_id) = self
            .claim(context, card, fingerprint, EventKind::CardExpired)
            .await
        else {
            return;
        };

        let started_on = email::dotted_date(&dates::date_string(
            context.subscription_start,
            self.timestamp_offset_hours,
        ));
        let outcome = match context.email.as_deref() {
            Some(to) => {
                self.email
                    .send_expired_prompt(
                        to,
                        context.name.as_deref().unwrap_or(""),
                        &email::format_amount(context.amount_cents),
                        &started_on,
                    )
                    .await
            }
            None => SendOutcome::failure(NO_EMAIL_DETAIL),
        };
        self.log_send(&outcome, "expired-card prompt", &context.customer_id);

        if let Err(e) = self
            .ledger
            .complete_claim(claim_id, outcome.successful, &outcome.details)
            .await
        {
            tracing::error!(
                operation = "ledger_write",
                record_id = %claim_id,
                error = %e,
                "Failed to record expired-prompt outcome"
            );
        }

        if outcome.successful {
            if let Err(e) = self.ledger.mark_prompt_sent(notice.id).await {
                tracing::error!(
                    operation = "ledger_flag",
                    record_id = %notice.id,
                    error = %e,
                    "Failed to flag prompt on expiry notice"
                );
            }
        }
    }

    async fn claim(
        &self,
        context: &NotificationContext,
        card: &CardDetails,
        fingerprint: &str,
        kind: EventKind,
    ) -> Option<uuid::Uuid> {
        let claim = NoticeClaim {
            customer_id: context.customer_id.clone(),
            event_kind: kind,
            customer_email: context.email.clone(),
            customer_name: context.name.clone(),
            subscription_id: context.subscription_id.clone(),
            card_fingerprint: fingerprint.to_string(),
            card_last4: card.last4.clone(),
            card_exp_month: card.exp_month as i16,
            card_exp_year: card.exp_year as i16,
        };

        match self.ledger.claim_notice(&claim).await {
            Ok(Some(id)) => Some(id),
            Ok(None) => {
                tracing::info!(
                    customer_id = %context.customer_id,
                    kind = %kind,
                    "Notice already claimed or sent - skipping"
                );
                None
            }
            Err(e) => {
                tracing::error!(
                    operation = "ledger_claim",
                    customer_id = %context.customer_id,
                    kind = %kind,
                    error = %e,
                    "Failed to claim notice - skipping send"
                );
                None
            }
        }
    }

    /// Fetch the customer and locate the subscription the invoice belongs to.
    async fn resolve_context(
        &self,
        customer_id: &str,
        wanted_subscription: Option<&str>,
    ) -> NotifyResult<Option<NotificationContext>> {
        let customer = self.directory.customer_with_subscriptions(customer_id).await?;
        Ok(build_context(&customer, customer_id, wanted_subscription))
    }

    /// Name and email only, with failures collapsed to blanks.
    async fn customer_contact(&self, customer_id: &str) -> (Option<String>, Option<String>) {
        match self.directory.customer(customer_id).await {
            Ok(customer) => (customer.email.clone(), customer.name.clone()),
            Err(e) => {
                tracing::error!(
                    operation = "customer_lookup",
                    customer_id = %customer_id,
                    error = %e,
                    "Failed to fetch customer"
                );
                (None, None)
            }
        }
    }

    /// Diagnostic ledger entry for an expiry flow that stopped before any
    /// send. Carries no fingerprint so it never occupies a claim slot.
    async fn log_expiry_note(
        &self,
        customer_id: &str,
        kind: EventKind,
        subscription_id: Option<&str>,
        detail: &str,
    ) {
        if let Err(e) = self
            .ledger
            .record_attempt(NewRecord {
                customer_id: customer_id.to_string(),
                event_kind: kind,
                customer_email: None,
                customer_name: None,
                subscription_id: subscription_id.map(str::to_string),
                card_fingerprint: None,
                card_last4: None,
                card_exp_month: None,
                card_exp_year: None,
                successful: false,
                detail: Some(detail.to_string()),
            })
            .await
        {
            tracing::error!(
                operation = "ledger_write",
                customer_id = %customer_id,
                error = %e,
                "Failed to record expiry note"
            );
        }
    }

    fn log_send(&self, outcome: &SendOutcome, what: &str, customer_id: &str) {
        if outcome.successful {
            tracing::info!(customer_id = %customer_id, "Sent {}", what);
        } else {
            tracing::error!(
                customer_id = %customer_id,
                details = %outcome.details,
                "Failed to send {}",
                what
            );
        }
    }
}

/// Decide whether the expired-card prompt may go out, given the most recent
/// sufficiently old expiring-soon record.
///
/// Returns the notice to flag afterwards, or the reason the prompt is
/// withheld.
fn expired_prompt_gate<'a>(
    notice: Option<&'a NotificationRecord>,
    subscription_id: &str,
) -> Result<&'a NotificationRecord, &'static str> {
    let notice = notice.ok_or("no expiring-soon notice at least two months old")?;
    if notice.prompt_sent_after_two_months {
        return Err("prompt already sent for this notice");
    }
    if notice.card_updated_since_notice {
        return Err("customer already updated their card details");
    }
    if notice.subscription_id.as_deref() != Some(subscription_id) {
        return Err("expiry notice belongs to a different subscription");
    }
    Ok(notice)
}

fn subscription_matches(status: &str, subscription_id: &str, wanted: Option<&str>) -> bool {
    NOTIFIABLE_STATUSES.contains(&status)
        && wanted.map(|wanted| wanted == subscription_id).unwrap_or(true)
}

fn build_context(
    customer: &Customer,
    customer_id: &str,
    wanted_subscription: Option<&str>,
) -> Option<NotificationContext> {
    let subscriptions = customer.subscriptions.as_ref()?;
    let subscription = subscriptions.data.iter().find(|subscription| {
        subscription_matches(
            subscription.status.as_str(),
            subscription.id.as_str(),
            wanted_subscription,
        )
    })?;

    Some(NotificationContext {
        customer_id: customer_id.to_string(),
        email: customer.email.clone(),
        name: customer.name.clone(),
        subscription_id: subscription.id.to_string(),
        subscription_status: subscription.status.as_str().to_string(),
        subscription_start: subscription.created,
        amount_cents: subscription_amount(subscription).unwrap_or(0),
        card: extract_card(subscription),
    })
}

/// Recurring amount in minor units from the first line item's price.
fn subscription_amount(subscription: &Subscription) -> Option<i64> {
    subscription
        .items
        .data
        .first()
        .and_then(|item| item.price.as_ref())
        .and_then(|price| price.unit_amount)
}

fn extract_card(subscription: &Subscription) -> Option<CardDetails> {
    let payment_method = match subscription.default_payment_method.as_ref()? {
        Expandable::Object(payment_method) => payment_method,
        Expandable::Id(id) => {
            tracing::warn!(payment_method_id = %id, "Payment method not expanded");
            return None;
        }
    };
    let card = payment_method.card.as_ref()?;

    Some(CardDetails {
        brand: card.brand.clone(),
        last4: card.last4.clone(),
        exp_month: card.exp_month as u32,
        exp_year: card.exp_year as i32,
        fingerprint: card.fingerprint.clone(),
    })
}

/// Flatten a payment intent into the CRM's payment shape.
fn build_payment_record(
    intent: &PaymentIntentSnapshot,
    name: Option<&str>,
    email: Option<&str>,
) -> PaymentRecord {
    PaymentRecord {
        id: intent.id.clone(),
        name: name.unwrap_or("").to_string(),
        email: email.unwrap_or("").to_string(),
        created: intent.created.unwrap_or(0),
        amount: crm::major_units(intent.amount.unwrap_or(0)),
        status: intent.status.clone(),
        payment_method_types: intent.payment_method_types.clone(),
        statement_descriptor: intent.statement_descriptor.clone().unwrap_or_default(),
        payment_currency: intent.currency.clone().unwrap_or_default(),
        metadata: PaymentMetadata::from_provider(&intent.metadata),
        description: intent.description.clone().unwrap_or_default(),
        invoice_id: intent.invoice.clone().unwrap_or_default(),
        card: intent
            .first_card()
            .map(card_record)
            .unwrap_or_else(CardRecord::empty),
        subscription_id: String::new(),
        error: String::new(),
    }
}

fn card_record(card: &CardSnapshot) -> CardRecord {
    CardRecord {
        brand: card.brand.clone().unwrap_or_default(),
        expire_month: card.exp_month.map(|month| month.to_string()).unwrap_or_default(),
        expire_year: card.exp_year.map(|year| year.to_string()).unwrap_or_default(),
        last4_digits: card.last4.clone().unwrap_or_default(),
    }
}
