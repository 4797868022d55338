//! Donor-facing email delivery via Resend.
//!
//! Senders never return an error: every send collapses into a
//! [`SendOutcome`] that the caller writes to the ledger, so one failed email
//! can never abort webhook processing.

use serde::{Deserialize, Serialize};

use crate::error::{NotifyError, NotifyResult};

const DEFAULT_API_BASE: &str = "https://api.resend.com";

#[derive(Debug, Clone)]
pub struct EmailConfig {
    pub api_key: String,
    pub from: String,
    pub api_base: String,
    /// Link donors follow to replace their card. Rendered into the expiry
    /// emails; empty when unconfigured.
    pub card_update_url: String,
}

impl EmailConfig {
    pub fn from_env() -> NotifyResult<Self> {
        let api_key = std::env::var("RESEND_API_KEY")
            .map_err(|_| NotifyError::Config("RESEND_API_KEY not set".to_string()))?;
        let from = std::env::var("EMAIL_FROM")
            .map_err(|_| NotifyError::Config("EMAIL_FROM not set".to_string()))?;
        let card_update_url = std::env::var("CARD_UPDATE_URL").unwrap_or_default();
        if card_update_url.is_empty() {
            tracing::warn!("CARD_UPDATE_URL not set - card update links will render empty");
        }

        Ok(Self {
            api_key,
            from,
            api_base: DEFAULT_API_BASE.to_string(),
            card_update_url,
        })
    }
}

/// Result of one delivery attempt. `details` holds the provider message id
/// on success and the error text on failure.
#[derive(Debug, Clone)]
pub struct SendOutcome {
    pub successful: bool,
    pub details: String,
}

impl SendOutcome {
    pub fn failure(details: impl Into<String>) -> Self {
        Self {
            successful: false,
            details: details.into(),
        }
    }
}

pub struct EmailService {
    client: reqwest::Client,
    config: EmailConfig,
}

impl EmailService {
    pub fn new(config: EmailConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            config,
        }
    }

    pub fn from_env() -> NotifyResult<Self> {
        Ok(Self::new(EmailConfig::from_env()?))
    }

    /// Goodbye email after a subscription is cancelled.
    pub async fn send_cancelled(
        &self,
        to: &str,
        name: &str,
        cancelled_on: &str,
        amount: &str,
    ) -> SendOutcome {
        let html = render(
            include_str!("../templates/cancelled.html"),
            &[
                ("first_name", first_name(name)),
                ("date", cancelled_on),
                ("amount", amount),
            ],
        );
        self.deliver(to, "Your regular donation has been cancelled", &html)
            .await
    }

    /// Heads-up that the card on file runs out within a month.
    pub async fn send_expiring_soon(
        &self,
        to: &str,
        name: &str,
        brand: &str,
        last4: &str,
        exp_month: u32,
        exp_year: i32,
    ) -> SendOutcome {
        let expiry = format!("{}/{}", exp_month, exp_year);
        let html = render(
            include_str!("../templates/expiring_soon.html"),
            &[
                ("first_name", first_name(name)),
                ("card_brand", brand),
                ("card_last4", last4),
                ("card_expiry", &expiry),
                ("card_update_url", &self.config.card_update_url),
            ],
        );
        self.deliver(to, "Your payment card is expiring soon", &html)
            .await
    }

    /// Follow-up prompt once an expired card has gone unreplaced for months.
    pub async fn send_expired_prompt(
        &self,
        to: &str,
        name: &str,
        amount: &str,
        started_on: &str,
    ) -> SendOutcome {
        let html = render(
            include_str!("../templates/expired_prompt.html"),
            &[
                ("first_name", first_name(name)),
                ("amount", amount),
                ("started_on", started_on),
                ("card_update_url", &self.config.card_update_url),
            ],
        );
        self.deliver(to, "Your card has expired - keep your donation going", &html)
            .await
    }

    /// Receipt for a successful payment.
    pub async fn send_receipt(
        &self,
        to: &str,
        name: &str,
        paid_on: &str,
        description: &str,
        amount: &str,
    ) -> SendOutcome {
        let html = render(
            include_str!("../templates/receipt.html"),
            &[
                ("first_name", first_name(name)),
                ("date", paid_on),
                ("description", description),
                ("amount", amount),
            ],
        );
        self.deliver(to, "Thank you for your donation", &html).await
    }

    /// Confirmation that the recurring amount changed.
    pub async fn send_amount_updated(
        &self,
        to: &str,
        name: &str,
        old_amount: &str,
        new_amount: &str,
    ) -> SendOutcome {
        let html = render(
            include_str!("../templates/amount_updated.html"),
            &[
                ("first_name", first_name(name)),
                ("old_amount", old_amount),
                ("new_amount", new_amount),
            ],
        );
        self.deliver(to, "Your donation amount has been updated", &html)
            .await
    }

    async fn deliver(&self, to: &str, subject: &str, html: &str) -> SendOutcome {
        #[derive(Serialize)]
        struct SendRequest<'a> {
            from: &'a str,
            to: [&'a str; 1],
            subject: &'a str,
            html: &'a str,
        }

        #[derive(Deserialize)]
        struct SendResponse {
            id: String,
        }

        let body = SendRequest {
            from: &self.config.from,
            to: [to],
            subject,
            html,
        };

        let response = match self
            .client
            .post(format!("{}/emails", self.config.api_base))
            .bearer_auth(&self.config.api_key)
            .json(&body)
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) => return SendOutcome::failure(format!("email request failed: {}", e)),
        };

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return SendOutcome::failure(format!("email provider returned {}: {}", status, text));
        }

        match response.json::<SendResponse>().await {
            Ok(parsed) => SendOutcome {
                successful: true,
                details: parsed.id,
            },
            Err(e) => SendOutcome::failure(format!("unreadable provider response: {}", e)),
        }
    }
}

/// First whitespace-separated token of a full name, for greetings.
pub fn first_name(full_name: &str) -> &str {
    full_name.split_whitespace().next().unwrap_or("")
}

/// Reformat a `D/M/YYYY` date for email display, e.g. `24.8.2023`.
pub fn dotted_date(date: &str) -> String {
    date.replace('/', ".")
}

/// Format minor units for display, e.g. 1250 becomes `12.50`.
pub fn format_amount(cents: i64) -> String {
    format!("{}.{:02}", cents / 100, (cents % 100).abs())
}

fn render(template: &str, substitutions: &[(&str, &str)]) -> String {
    let mut html = template.to_string();
    for (key, value) in substitutions {
        html = html.replace(&format!("{{{{{}}}}}", key), value);
    }
    html
}
