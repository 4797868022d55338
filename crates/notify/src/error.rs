//! Error types for the notification engine

use thiserror::Error;

pub type NotifyResult<T> = Result<T, NotifyError>;

#[derive(Debug, Error)]
pub enum NotifyError {
    /// Webhook payload failed signature verification. The only error that
    /// turns into a non-2xx response at the HTTP layer.
    #[error("webhook signature verification failed")]
    WebhookSignatureInvalid,

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("payment provider error: {0}")]
    Stripe(#[from] stripe::StripeError),

    #[error("malformed webhook payload: {0}")]
    Payload(#[from] serde_json::Error),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("CRM error: {0}")]
    Crm(String),

    #[error("missing configuration: {0}")]
    Config(String),

    #[error("{0}")]
    Internal(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_messages() {
        assert_eq!(
            NotifyError::WebhookSignatureInvalid.to_string(),
            "webhook signature verification failed"
        );
        assert_eq!(
            NotifyError::Config("RESEND_API_KEY not set".to_string()).to_string(),
            "missing configuration: RESEND_API_KEY not set"
        );
        assert_eq!(
            NotifyError::Internal("boom".to_string()).to_string(),
            "boom"
        );
    }

    #[test]
    fn test_json_errors_convert_to_payload() {
        let parse_error = serde_json::from_str::<serde_json::Value>("{not json").unwrap_err();
        let error: NotifyError = parse_error.into();
        assert!(matches!(error, NotifyError::Payload(_)));
    }
}
