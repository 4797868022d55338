//! Salesforce CRM synchronisation.
//!
//! Payments, cancellations, amount changes and refunds are mirrored into the
//! CRM so fundraising staff see them without opening the payment provider's
//! dashboard. The whole service is optional: without credentials every push
//! logs and succeeds as a no-op.
//!
//! Field casing in the payloads is mixed (snake_case at the top level,
//! camelCase inside `card` and `metadata`) because that is what the CRM's
//! existing integration endpoints expect.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::{NotifyError, NotifyResult};

const PAYMENT_PATH: &str = "payments/stripe/";
const CANCEL_PATH: &str = "subscriptions/stripe/cancel";
const UPDATE_PATH: &str = "subscriptions/stripe/update";
const REFUND_PATH: &str = "refund/stripe/";

#[derive(Debug, Clone)]
pub struct CrmConfig {
    pub token_url: String,
    pub api_url: String,
    pub client_id: String,
    pub client_secret: String,
    pub username: String,
    pub password: String,
}

impl CrmConfig {
    /// All-or-nothing: one missing variable disables the CRM entirely.
    pub fn from_env() -> Option<Self> {
        Some(Self {
            token_url: std::env::var("SALESFORCE_TOKEN_URL").ok()?,
            api_url: std::env::var("SALESFORCE_API_URL").ok()?,
            client_id: std::env::var("SALESFORCE_CLIENT_ID").ok()?,
            client_secret: std::env::var("SALESFORCE_CLIENT_SECRET").ok()?,
            username: std::env::var("SALESFORCE_USERNAME").ok()?,
            password: std::env::var("SALESFORCE_PASSWORD").ok()?,
        })
    }
}

/// Card details in the casing the CRM expects. Every field is present;
/// an unknown card becomes empty strings.
#[derive(Debug, Clone, Serialize)]
pub struct CardRecord {
    pub brand: String,
    #[serde(rename = "expireMonth")]
    pub expire_month: String,
    #[serde(rename = "expireYear")]
    pub expire_year: String,
    #[serde(rename = "last4Digits")]
    pub last4_digits: String,
}

impl CardRecord {
    pub fn empty() -> Self {
        Self {
            brand: String::new(),
            expire_month: String::new(),
            expire_year: String::new(),
            last4_digits: String::new(),
        }
    }
}

/// Checkout metadata forwarded with each payment. The provider stores
/// metadata values as strings, so boolean flags arrive as `"true"`/`"false"`.
#[derive(Debug, Clone, Serialize)]
pub struct PaymentMetadata {
    pub campaign: String,
    #[serde(rename = "paymentInitiatedDomain")]
    pub payment_initiated_domain: String,
    #[serde(rename = "paymentInitiatedWidgetDomain")]
    pub payment_initiated_widget_domain: String,
    pub recurring: bool,
    #[serde(rename = "recurringAmount")]
    pub recurring_amount: String,
    #[serde(rename = "abTestInfo")]
    pub ab_test_info: String,
    #[serde(rename = "clubMember")]
    pub club_member: bool,
    #[serde(rename = "newsletterSignUp")]
    pub newsletter_sign_up: bool,
}

impl PaymentMetadata {
    pub fn from_provider(metadata: &HashMap<String, String>) -> Self {
        let text = |key: &str| metadata.get(key).cloned().unwrap_or_default();
        Self {
            campaign: text("campaign"),
            payment_initiated_domain: text("paymentInitiatedDomain"),
            payment_initiated_widget_domain: text("paymentInitiatedWidgetDomain"),
            recurring: metadata_flag(metadata, "recurring"),
            recurring_amount: text("recurringAmount"),
            ab_test_info: text("abTestInfo"),
            club_member: metadata_flag(metadata, "clubMember"),
            newsletter_sign_up: metadata_flag(metadata, "newsletterSignUp"),
        }
    }
}

fn metadata_flag(metadata: &HashMap<String, String>, key: &str) -> bool {
    metadata.get(key).map(|value| value == "true").unwrap_or(false)
}

/// One settled payment. Amounts are in major units.
#[derive(Debug, Clone, Serialize)]
pub struct PaymentRecord {
    pub id: String,
    pub name: String,
    pub email: String,
    pub created: i64,
    pub amount: f64,
    pub status: String,
    pub payment_method_types: Vec<String>,
    pub statement_descriptor: String,
    pub payment_currency: String,
    pub metadata: PaymentMetadata,
    pub description: String,
    pub invoice_id: String,
    pub card: CardRecord,
    pub subscription_id: String,
    pub error: String,
}

/// A cancelled or updated recurring subscription.
#[derive(Debug, Clone, Serialize)]
pub struct SubscriptionRecord {
    pub id: String,
    pub created: i64,
    pub status: String,
    pub amount: f64,
    pub card: CardRecord,
}

/// One refund against an earlier payment.
#[derive(Debug, Clone, Serialize)]
pub struct RefundRecord {
    pub id: String,
    #[serde(rename = "paymentIntentId")]
    pub payment_intent_id: String,
    pub created: i64,
    pub amount: f64,
    pub status: String,
    pub reason: String,
}

/// Convert minor units to the major-unit amounts the CRM stores.
pub fn major_units(cents: i64) -> f64 {
    cents as f64 / 100.0
}

pub struct CrmService {
    client: reqwest::Client,
    config: Option<CrmConfig>,
}

impl CrmService {
    pub fn new(config: Option<CrmConfig>) -> Self {
        Self {
            client: reqwest::Client::new(),
            config,
        }
    }

    pub fn from_env() -> Self {
        Self::new(CrmConfig::from_env())
    }

    pub fn is_enabled(&self) -> bool {
        self.config.is_some()
    }

    pub async fn push_payment(&self, record: &PaymentRecord) -> NotifyResult<()> {
        self.push("payment", PAYMENT_PATH, record).await
    }

    pub async fn push_cancellation(&self, record: &SubscriptionRecord) -> NotifyResult<()> {
        self.push("cancellation", CANCEL_PATH, record).await
    }

    pub async fn push_subscription_update(&self, record: &SubscriptionRecord) -> NotifyResult<()> {
        self.push("subscription_update", UPDATE_PATH, record).await
    }

    pub async fn push_refund(&self, record: &RefundRecord) -> NotifyResult<()> {
        self.push("refund", REFUND_PATH, record).await
    }

    async fn push<T: Serialize>(
        &self,
        operation: &'static str,
        path: &str,
        record: &T,
    ) -> NotifyResult<()> {
        let config = match &self.config {
            Some(config) => config,
            None => {
                tracing::info!(operation, "CRM push skipped - no credentials configured");
                return Ok(());
            }
        };

        let token = self.access_token(config).await?;
        let url = format!("{}/{}", config.api_url.trim_end_matches('/'), path);

        let response = self
            .client
            .post(&url)
            .bearer_auth(&token)
            .json(record)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(NotifyError::Crm(format!(
                "{} push rejected with {}: {}",
                operation, status, text
            )));
        }

        tracing::info!(operation, "CRM push succeeded");
        Ok(())
    }

    /// OAuth2 password-grant token, fetched fresh for every push. Pushes are
    /// rare enough that caching is not worth the expiry bookkeeping.
    async fn access_token(&self, config: &CrmConfig) -> NotifyResult<String> {
        #[derive(Deserialize)]
        struct TokenResponse {
            access_token: String,
        }

        let params = [
            ("grant_type", "password"),
            ("client_id", config.client_id.as_str()),
            ("client_secret", config.client_secret.as_str()),
            ("username", config.username.as_str()),
            ("password", config.password.as_str()),
        ];

        let response = self
            .client
            .post(&config.token_url)
            .form(&params)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            return Err(NotifyError::Crm(format!(
                "token request rejected with {}",
                status
            )));
        }

        let token: TokenResponse = response.json().await?;
        Ok(token.access_token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn test_config(base: &str) -> CrmConfig {
        CrmConfig {
            token_url: format!("{}/services/oauth2/token", base),
            api_url: format!("{}/services/apexrest", base),
            client_id: "client".to_string(),
            client_secret: "secret".to_string(),
            username: "integration@example.org".to_string(),
            password: "hunter2".to_string(),
        }
    }

    const ENV_KEYS: [&str; 6] = [
        "SALESFORCE_TOKEN_URL",
        "SALESFORCE_API_URL",
        "SALESFORCE_CLIENT_ID",
        "SALESFORCE_CLIENT_SECRET",
        "SALESFORCE_USERNAME",
        "SALESFORCE_PASSWORD",
    ];

    #[test]
    #[serial_test::serial]
    fn test_partial_credentials_disable_the_crm() {
        for key in ENV_KEYS {
            std::env::remove_var(key);
        }
        assert!(CrmConfig::from_env().is_none());

        // One variable alone is not enough.
        std::env::set_var("SALESFORCE_TOKEN_URL", "https://login.example.com/token");
        assert!(CrmConfig::from_env().is_none());

        for key in ENV_KEYS {
            std::env::set_var(key, "value");
        }
        assert!(CrmConfig::from_env().is_some());

        for key in ENV_KEYS {
            std::env::remove_var(key);
        }
    }

    #[test]
    fn test_card_record_uses_crm_casing() {
        let card = CardRecord {
            brand: "visa".to_string(),
            expire_month: "8".to_string(),
            expire_year: "2027".to_string(),
            last4_digits: "4242".to_string(),
        };
        let value = serde_json::to_value(&card).unwrap();
        assert_eq!(
            value,
            json!({
                "brand": "visa",
                "expireMonth": "8",
                "expireYear": "2027",
                "last4Digits": "4242",
            })
        );
    }

    #[test]
    fn test_refund_record_uses_crm_casing() {
        let refund = RefundRecord {
            id: "re_123".to_string(),
            payment_intent_id: "pi_123".to_string(),
            created: 1_692_879_426,
            amount: 5.0,
            status: "succeeded".to_string(),
            reason: "requested_by_customer".to_string(),
        };
        let value = serde_json::to_value(&refund).unwrap();
        assert_eq!(value["paymentIntentId"], "pi_123");
        assert_eq!(value["amount"], 5.0);
    }

    #[test]
    fn test_metadata_converts_string_flags_to_booleans() {
        let mut provider = HashMap::new();
        provider.insert("campaign".to_string(), "spring".to_string());
        provider.insert("recurring".to_string(), "true".to_string());
        provider.insert("clubMember".to_string(), "false".to_string());
        provider.insert("newsletterSignUp".to_string(), "yes".to_string());

        let metadata = PaymentMetadata::from_provider(&provider);
        assert_eq!(metadata.campaign, "spring");
        assert!(metadata.recurring);
        assert!(!metadata.club_member);
        // Anything but the literal "true" is false.
        assert!(!metadata.newsletter_sign_up);
        assert_eq!(metadata.ab_test_info, "");
    }

    #[test]
    fn test_metadata_serializes_with_camel_case_keys() {
        let metadata = PaymentMetadata::from_provider(&HashMap::new());
        let value = serde_json::to_value(&metadata).unwrap();
        assert!(value.get("paymentInitiatedDomain").is_some());
        assert!(value.get("recurringAmount").is_some());
        assert!(value.get("abTestInfo").is_some());
        assert!(value.get("newsletterSignUp").is_some());
        assert_eq!(value["recurring"], false);
    }

    #[test]
    fn test_major_units_conversion() {
        assert_eq!(major_units(1250), 12.5);
        assert_eq!(major_units(0), 0.0);
        assert_eq!(major_units(99), 0.99);
    }

    #[tokio::test]
    async fn test_disabled_service_pushes_nothing() {
        let service = CrmService::new(None);
        assert!(!service.is_enabled());

        let refund = RefundRecord {
            id: "re_123".to_string(),
            payment_intent_id: "pi_123".to_string(),
            created: 0,
            amount: 1.0,
            status: "succeeded".to_string(),
            reason: String::new(),
        };
        // No network configured, still succeeds.
        service.push_refund(&refund).await.unwrap();
    }

    #[tokio::test]
    async fn test_push_fetches_a_token_then_posts_the_record() {
        let mut server = mockito::Server::new_async().await;
        let token_mock = server
            .mock("POST", "/services/oauth2/token")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"access_token":"tok_123","token_type":"Bearer"}"#)
            .create_async()
            .await;
        let push_mock = server
            .mock("POST", "/services/apexrest/subscriptions/stripe/cancel")
            .match_header("authorization", "Bearer tok_123")
            .with_status(200)
            .with_body("{}")
            .create_async()
            .await;

        let service = CrmService::new(Some(test_config(&server.url())));
        let record = SubscriptionRecord {
            id: "sub_123".to_string(),
            created: 1_692_879_426,
            status: "canceled".to_string(),
            amount: 15.0,
            card: CardRecord::empty(),
        };
        service.push_cancellation(&record).await.unwrap();

        token_mock.assert_async().await;
        push_mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_rejected_push_surfaces_a_crm_error() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/services/oauth2/token")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"access_token":"tok_123"}"#)
            .create_async()
            .await;
        server
            .mock("POST", "/services/apexrest/refund/stripe/")
            .with_status(500)
            .with_body("server error")
            .create_async()
            .await;

        let service = CrmService::new(Some(test_config(&server.url())));
        let refund = RefundRecord {
            id: "re_123".to_string(),
            payment_intent_id: "pi_123".to_string(),
            created: 0,
            amount: 1.0,
            status: "succeeded".to_string(),
            reason: String::new(),
        };
        let error = service.push_refund(&refund).await.unwrap_err();
        assert!(matches!(error, NotifyError::Crm(_)));
        assert!(error.to_string().contains("500"));
    }

    #[tokio::test]
    async fn test_failed_token_request_stops_the_push() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/services/oauth2/token")
            .with_status(400)
            .with_body(r#"{"error":"invalid_grant"}"#)
            .create_async()
            .await;
        let push_mock = server
            .mock("POST", "/services/apexrest/payments/stripe/")
            .expect(0)
            .create_async()
            .await;

        let service = CrmService::new(Some(test_config(&server.url())));
        let record = PaymentRecord {
            id: "pi_123".to_string(),
            name: String::new(),
            email: String::new(),
            created: 0,
            amount: 1.0,
            status: "succeeded".to_string(),
            payment_method_types: vec!["card".to_string()],
            statement_descriptor: String::new(),
            payment_currency: "gbp".to_string(),
            metadata: PaymentMetadata::from_provider(&HashMap::new()),
            description: String::new(),
            invoice_id: String::new(),
            card: CardRecord::empty(),
            subscription_id: String::new(),
            error: String::new(),
        };
        assert!(service.push_payment(&record).await.is_err());
        push_mock.assert_async().await;
    }
}
