//! Webhook wire types and business-event classification.
//!
//! The provider delivers every event as the same envelope; the interesting
//! part is `data.object` plus, for update events, `data.previous_attributes`.
//! Snapshots deserialize only the fields this service acts on and tolerate
//! everything else.

use std::collections::HashMap;

use serde::Deserialize;
use serde_json::Value;

use crate::error::NotifyResult;

/// Raw webhook envelope as delivered by the payment provider.
#[derive(Debug, Clone, Deserialize)]
pub struct WebhookEvent {
    #[serde(default)]
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    pub created: i64,
    pub data: EventData,
    #[serde(default)]
    pub livemode: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EventData {
    pub object: Value,
    #[serde(default)]
    pub previous_attributes: Option<Value>,
}

/// Subscription fields used by cancellation and amount-change handling.
#[derive(Debug, Clone, Deserialize)]
pub struct SubscriptionSnapshot {
    pub id: String,
    pub customer: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub created: Option<i64>,
    #[serde(default)]
    pub items: SubscriptionItems,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SubscriptionItems {
    #[serde(default)]
    pub data: Vec<SubscriptionItem>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SubscriptionItem {
    #[serde(default)]
    pub plan: Option<PlanSnapshot>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PlanSnapshot {
    #[serde(default)]
    pub amount: Option<i64>,
}

impl SubscriptionSnapshot {
    /// Recurring amount in minor units, taken from the first line item.
    pub fn first_plan_amount(&self) -> Option<i64> {
        self.items
            .data
            .first()
            .and_then(|item| item.plan.as_ref())
            .and_then(|plan| plan.amount)
    }
}

/// Invoice fields shared by `invoice.upcoming` and `invoice.payment_failed`.
///
/// Upcoming invoices are previews and carry no id.
#[derive(Debug, Clone, Deserialize)]
pub struct InvoiceSnapshot {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub customer: Option<String>,
    #[serde(default)]
    pub subscription: Option<String>,
    #[serde(default)]
    pub payment_intent: Option<String>,
}

/// Payment intent fields used for receipts, CRM pushes and the poll log.
#[derive(Debug, Clone, Deserialize)]
pub struct PaymentIntentSnapshot {
    pub id: String,
    #[serde(default)]
    pub created: Option<i64>,
    #[serde(default)]
    pub amount: Option<i64>,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub customer: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub invoice: Option<String>,
    #[serde(default)]
    pub payment_method_types: Vec<String>,
    #[serde(default)]
    pub statement_descriptor: Option<String>,
    #[serde(default)]
    pub currency: Option<String>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    #[serde(default)]
    pub receipt_email: Option<String>,
    #[serde(default)]
    pub charges: ChargeList,
}

impl PaymentIntentSnapshot {
    /// Card that actually funded the payment, from the first charge.
    pub fn first_card(&self) -> Option<&CardSnapshot> {
        self.charges
            .data
            .first()
            .and_then(|charge| charge.payment_method_details.as_ref())
            .and_then(|details| details.card.as_ref())
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ChargeList {
    #[serde(default)]
    pub data: Vec<ChargeEntry>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChargeEntry {
    #[serde(default)]
    pub payment_method_details: Option<PaymentMethodDetails>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PaymentMethodDetails {
    #[serde(default)]
    pub card: Option<CardSnapshot>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CardSnapshot {
    #[serde(default)]
    pub brand: Option<String>,
    #[serde(default)]
    pub last4: Option<String>,
    #[serde(default)]
    pub exp_month: Option<u32>,
    #[serde(default)]
    pub exp_year: Option<i32>,
    #[serde(default)]
    pub fingerprint: Option<String>,
}

/// Charge fields used when a refund is issued.
#[derive(Debug, Clone, Deserialize)]
pub struct ChargeSnapshot {
    pub id: String,
    #[serde(default)]
    pub payment_intent: Option<String>,
    #[serde(default)]
    pub refunds: RefundList,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RefundList {
    #[serde(default)]
    pub data: Vec<RefundSnapshot>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RefundSnapshot {
    pub id: String,
    #[serde(default)]
    pub created: Option<i64>,
    #[serde(default)]
    pub amount: Option<i64>,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub reason: Option<String>,
}

/// What a webhook event means for this service.
///
/// Classification is mutually exclusive: one event maps to exactly one
/// variant, and for `customer.subscription.updated` a card change wins over
/// an amount change when both appear in the same event.
#[derive(Debug, Clone)]
pub enum BusinessEvent {
    SubscriptionCancelled(SubscriptionSnapshot),
    CardUpdated {
        customer_id: String,
        subscription_id: String,
    },
    AmountUpdated {
        subscription: SubscriptionSnapshot,
        previous_amount: i64,
        current_amount: i64,
    },
    UpcomingInvoice(InvoiceSnapshot),
    PaymentFailed(InvoiceSnapshot),
    PaymentSucceeded(PaymentIntentSnapshot),
    RefundIssued(ChargeSnapshot),
    Unhandled,
}

impl BusinessEvent {
    pub fn classify(event: &WebhookEvent) -> NotifyResult<Self> {
        match event.event_type.as_str() {
            "customer.subscription.deleted" => Ok(Self::SubscriptionCancelled(
                serde_json::from_value(event.data.object.clone())?,
            )),
            "customer.subscription.updated" => Self::classify_subscription_update(event),
            "invoice.upcoming" => Ok(Self::UpcomingInvoice(serde_json::from_value(
                event.data.object.clone(),
            )?)),
            "invoice.payment_failed" => Ok(Self::PaymentFailed(serde_json::from_value(
                event.data.object.clone(),
            )?)),
            "payment_intent.succeeded" => Ok(Self::PaymentSucceeded(serde_json::from_value(
                event.data.object.clone(),
            )?)),
            "charge.refunded" => Ok(Self::RefundIssued(serde_json::from_value(
                event.data.object.clone(),
            )?)),
            _ => Ok(Self::Unhandled),
        }
    }

    fn classify_subscription_update(event: &WebhookEvent) -> NotifyResult<Self> {
        let subscription: SubscriptionSnapshot =
            serde_json::from_value(event.data.object.clone())?;
        let previous = event.data.previous_attributes.as_ref();

        // A non-null previous default_payment_method means the card changed.
        // An explicit null means the subscription had no card before, which
        // is not a replacement.
        let card_changed = previous
            .and_then(|prev| prev.get("default_payment_method"))
            .map(|value| !value.is_null())
            .unwrap_or(false);
        if card_changed {
            return Ok(Self::CardUpdated {
                customer_id: subscription.customer.clone(),
                subscription_id: subscription.id,
            });
        }

        let previous_amount = previous.and_then(previous_plan_amount);
        let current_amount = subscription.first_plan_amount();
        match (previous_amount, current_amount) {
            (Some(previous), Some(current)) if previous != current => Ok(Self::AmountUpdated {
                subscription,
                previous_amount: previous,
                current_amount: current,
            }),
            _ => Ok(Self::Unhandled),
        }
    }
}

/// Plan amount of the first line item inside `previous_attributes`, when the
/// update event includes one.
fn previous_plan_amount(previous: &Value) -> Option<i64> {
    previous
        .get("items")?
        .get("data")?
        .get(0)?
        .get("plan")?
        .get("amount")?
        .as_i64()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn event(event_type: &str, object: Value, previous: Option<Value>) -> WebhookEvent {
        let payload = json!({
            "id": "evt_test_1",
            "type": event_type,
            "created": 1_692_879_426i64,
            "livemode": false,
            "data": {
                "object": object,
                "previous_attributes": previous,
            },
        });
        serde_json::from_value(payload).unwrap()
    }

    fn subscription_object(amount: i64) -> Value {
        json!({
            "id": "sub_123",
            "customer": "cus_123",
            "status": "active",
            "created": 1_660_000_000i64,
            "items": { "data": [ { "plan": { "amount": amount } } ] },
        })
    }

    #[test]
    fn test_deleted_subscription_classifies_as_cancelled() {
        let event = event(
            "customer.subscription.deleted",
            subscription_object(1500),
            None,
        );
        match BusinessEvent::classify(&event).unwrap() {
            BusinessEvent::SubscriptionCancelled(sub) => {
                assert_eq!(sub.id, "sub_123");
                assert_eq!(sub.customer, "cus_123");
                assert_eq!(sub.first_plan_amount(), Some(1500));
            }
            other => panic!("expected SubscriptionCancelled, got {:?}", other),
        }
    }

    #[test]
    fn test_previous_payment_method_classifies_as_card_updated() {
        let event = event(
            "customer.subscription.updated",
            subscription_object(1500),
            Some(json!({ "default_payment_method": "pm_old" })),
        );
        match BusinessEvent::classify(&event).unwrap() {
            BusinessEvent::CardUpdated {
                customer_id,
                subscription_id,
            } => {
                assert_eq!(customer_id, "cus_123");
                assert_eq!(subscription_id, "sub_123");
            }
            other => panic!("expected CardUpdated, got {:?}", other),
        }
    }

    #[test]
    fn test_card_change_wins_over_amount_change() {
        let event = event(
            "customer.subscription.updated",
            subscription_object(2000),
            Some(json!({
                "default_payment_method": "pm_old",
                "items": { "data": [ { "plan": { "amount": 1500 } } ] },
            })),
        );
        assert!(matches!(
            BusinessEvent::classify(&event).unwrap(),
            BusinessEvent::CardUpdated { .. }
        ));
    }

    #[test]
    fn test_null_previous_payment_method_is_not_a_card_update() {
        let event = event(
            "customer.subscription.updated",
            subscription_object(1500),
            Some(json!({ "default_payment_method": null })),
        );
        assert!(matches!(
            BusinessEvent::classify(&event).unwrap(),
            BusinessEvent::Unhandled
        ));
    }

    #[test]
    fn test_amount_change_classifies_with_both_amounts() {
        let event = event(
            "customer.subscription.updated",
            subscription_object(2000),
            Some(json!({ "items": { "data": [ { "plan": { "amount": 1500 } } ] } })),
        );
        match BusinessEvent::classify(&event).unwrap() {
            BusinessEvent::AmountUpdated {
                previous_amount,
                current_amount,
                subscription,
            } => {
                assert_eq!(previous_amount, 1500);
                assert_eq!(current_amount, 2000);
                assert_eq!(subscription.customer, "cus_123");
            }
            other => panic!("expected AmountUpdated, got {:?}", other),
        }
    }

    #[test]
    fn test_equal_amounts_are_not_an_amount_change() {
        let event = event(
            "customer.subscription.updated",
            subscription_object(1500),
            Some(json!({ "items": { "data": [ { "plan": { "amount": 1500 } } ] } })),
        );
        assert!(matches!(
            BusinessEvent::classify(&event).unwrap(),
            BusinessEvent::Unhandled
        ));
    }

    #[test]
    fn test_update_without_previous_attributes_is_unhandled() {
        let event = event("customer.subscription.updated", subscription_object(1500), None);
        assert!(matches!(
            BusinessEvent::classify(&event).unwrap(),
            BusinessEvent::Unhandled
        ));
    }

    #[test]
    fn test_missing_line_items_never_panics() {
        let event = event(
            "customer.subscription.updated",
            json!({ "id": "sub_123", "customer": "cus_123", "status": "active", "items": { "data": [] } }),
            Some(json!({ "items": { "data": [] } })),
        );
        assert!(matches!(
            BusinessEvent::classify(&event).unwrap(),
            BusinessEvent::Unhandled
        ));
    }

    #[test]
    fn test_unknown_event_type_is_unhandled() {
        let event = event("customer.created", json!({ "id": "cus_123" }), None);
        assert!(matches!(
            BusinessEvent::classify(&event).unwrap(),
            BusinessEvent::Unhandled
        ));
    }

    #[test]
    fn test_upcoming_invoice_has_no_id() {
        let event = event(
            "invoice.upcoming",
            json!({ "customer": "cus_123", "subscription": "sub_123" }),
            None,
        );
        match BusinessEvent::classify(&event).unwrap() {
            BusinessEvent::UpcomingInvoice(invoice) => {
                assert_eq!(invoice.id, None);
                assert_eq!(invoice.customer.as_deref(), Some("cus_123"));
                assert_eq!(invoice.subscription.as_deref(), Some("sub_123"));
            }
            other => panic!("expected UpcomingInvoice, got {:?}", other),
        }
    }

    #[test]
    fn test_payment_failed_carries_the_intent_id() {
        let event = event(
            "invoice.payment_failed",
            json!({
                "id": "in_123",
                "customer": "cus_123",
                "subscription": "sub_123",
                "payment_intent": "pi_123",
            }),
            None,
        );
        match BusinessEvent::classify(&event).unwrap() {
            BusinessEvent::PaymentFailed(invoice) => {
                assert_eq!(invoice.payment_intent.as_deref(), Some("pi_123"));
            }
            other => panic!("expected PaymentFailed, got {:?}", other),
        }
    }

    #[test]
    fn test_payment_succeeded_extracts_card_and_metadata() {
        let event = event(
            "payment_intent.succeeded",
            json!({
                "id": "pi_123",
                "created": 1_692_879_426i64,
                "amount": 1250,
                "status": "succeeded",
                "customer": "cus_123",
                "description": "Monthly donation",
                "currency": "gbp",
                "payment_method_types": ["card"],
                "metadata": { "campaign": "spring", "recurring": "true" },
                "charges": {
                    "data": [ {
                        "payment_method_details": {
                            "card": {
                                "brand": "visa",
                                "last4": "4242",
                                "exp_month": 8,
                                "exp_year": 2027,
                                "fingerprint": "fp_abc",
                            }
                        }
                    } ]
                },
            }),
            None,
        );
        match BusinessEvent::classify(&event).unwrap() {
            BusinessEvent::PaymentSucceeded(intent) => {
                assert_eq!(intent.amount, Some(1250));
                assert_eq!(intent.metadata.get("campaign").map(String::as_str), Some("spring"));
                let card = intent.first_card().expect("card present");
                assert_eq!(card.last4.as_deref(), Some("4242"));
                assert_eq!(card.exp_month, Some(8));
            }
            other => panic!("expected PaymentSucceeded, got {:?}", other),
        }
    }

    #[test]
    fn test_refund_extracts_the_first_refund() {
        let event = event(
            "charge.refunded",
            json!({
                "id": "ch_123",
                "payment_intent": "pi_123",
                "refunds": {
                    "data": [ {
                        "id": "re_123",
                        "created": 1_692_879_426i64,
                        "amount": 500,
                        "status": "succeeded",
                        "reason": "requested_by_customer",
                    } ]
                },
            }),
            None,
        );
        match BusinessEvent::classify(&event).unwrap() {
            BusinessEvent::RefundIssued(charge) => {
                assert_eq!(charge.payment_intent.as_deref(), Some("pi_123"));
                let refund = charge.refunds.data.first().expect("refund present");
                assert_eq!(refund.id, "re_123");
                assert_eq!(refund.amount, Some(500));
            }
            other => panic!("expected RefundIssued, got {:?}", other),
        }
    }
}
