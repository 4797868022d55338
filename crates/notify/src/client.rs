//! Read-side client for the payment provider's directory.
//!
//! Webhook payloads carry ids, not expanded objects, so the handlers come
//! back here for the customer (with subscriptions and their payment methods
//! expanded) and for failed payment intents (which carry the decline code).

use stripe::{Client, Customer, CustomerId, PaymentIntent, PaymentIntentId};

use crate::error::{NotifyError, NotifyResult};

#[derive(Clone)]
pub struct CustomerDirectory {
    client: Client,
}

impl CustomerDirectory {
    pub fn new(secret_key: &str) -> Self {
        Self {
            client: Client::new(secret_key),
        }
    }

    pub fn from_env() -> NotifyResult<Self> {
        let secret_key = std::env::var("STRIPE_SECRET_KEY")
            .map_err(|_| NotifyError::Config("STRIPE_SECRET_KEY not set".to_string()))?;
        Ok(Self::new(&secret_key))
    }

    /// Customer with subscriptions and each subscription's default payment
    /// method expanded in one round trip.
    pub async fn customer_with_subscriptions(&self, customer_id: &str) -> NotifyResult<Customer> {
        let id = parse_customer_id(customer_id)?;
        let customer = Customer::retrieve(
            &self.client,
            &id,
            &["subscriptions", "subscriptions.data.default_payment_method"],
        )
        .await?;
        Ok(customer)
    }

    /// Plain customer fetch, enough for a name and email address.
    pub async fn customer(&self, customer_id: &str) -> NotifyResult<Customer> {
        let id = parse_customer_id(customer_id)?;
        let customer = Customer::retrieve(&self.client, &id, &[]).await?;
        Ok(customer)
    }

    /// Payment intent fetch; `last_payment_error.decline_code` tells failed
    /// payments apart.
    pub async fn payment_intent(&self, intent_id: &str) -> NotifyResult<PaymentIntent> {
        let id: PaymentIntentId = intent_id
            .parse()
            .map_err(|_| NotifyError::Internal(format!("invalid payment intent id: {}", intent_id)))?;
        let intent = PaymentIntent::retrieve(&self.client, &id, &[]).await?;
        Ok(intent)
    }
}

fn parse_customer_id(customer_id: &str) -> NotifyResult<CustomerId> {
    customer_id
        .parse()
        .map_err(|_| NotifyError::Internal(format!("invalid customer id: {}", customer_id)))
}
