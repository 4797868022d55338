// Notification engine clippy configuration
#![allow(clippy::too_many_arguments)] // Email senders take flat display fields
// Test code patterns:
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Donorflow notification engine
//!
//! Turns payment-provider webhooks into donor notifications and CRM records.
//!
//! Features:
//! - Webhook signature verification and event classification
//! - Card-expiry warnings with calendar-month arithmetic
//! - At-most-once delivery over a persisted notification ledger
//! - Transactional email via Resend
//! - Salesforce CRM synchronisation for payments, cancellations and refunds

pub mod client;
pub mod crm;
pub mod dates;
pub mod email;
pub mod error;
pub mod events;
pub mod ledger;
pub mod webhooks;


// Core types
pub use error::{NotifyError, NotifyResult};
pub use events::{BusinessEvent, WebhookEvent};

// Services
pub use client::CustomerDirectory;
pub use crm::{CrmConfig, CrmService};
pub use email::{EmailConfig, EmailService, SendOutcome};
pub use ledger::{EventKind, NotificationLedger, NotificationRecord};
pub use webhooks::{CardDetails, NotificationContext, WebhookProcessor};

use sqlx::PgPool;

/// Aggregate of every notification collaborator, wired from the environment.
pub struct NotificationService {
    /// Webhook verification and orchestration
    pub webhooks: WebhookProcessor,
    /// Direct ledger access for the ops endpoints
    pub ledger: NotificationLedger,
}

impl NotificationService {
    /// Build the full service from environment variables.
    ///
    /// Requires `STRIPE_SECRET_KEY`, `STRIPE_WEBHOOK_SECRET`,
    /// `RESEND_API_KEY` and `EMAIL_FROM`. Salesforce credentials and
    /// `TIMESTAMP_OFFSET_HOURS` are optional.
    pub fn from_env(pool: PgPool) -> NotifyResult<Self> {
        Ok(Self {
            webhooks: WebhookProcessor::from_env(pool.clone())?,
            ledger: NotificationLedger::new(pool),
        })
    }
}
