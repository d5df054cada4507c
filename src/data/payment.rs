use base64::Engine;
use bson::{doc, Document};
use chrono::{DateTime, Utc};
use crypto::hmac::Hmac;
use crypto::mac::Mac;
use crypto::sha2::Sha256;
use crypto::util::fixed_time_eq;
use mongodb::Database;
use rocket::http::Status;
use utoipa::ToSchema;
use uuid::Uuid;

use crate::data::is_duplicate_key;
use crate::resp::problem::Problem;
use crate::util::base64_engine;

pub static PAYMENT_COLLECTION_NAME: &str = "payments";

/// "Payment completed" event as delivered by the provider webhook, keyed by
/// an opaque session id the provider may resend.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct PaymentEvent {
    pub session_id: String,
    pub tenant: Uuid,
    pub user: Uuid,
    pub amount_cents: i64,
    pub currency: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentRecord {
    #[serde(
        default = "Uuid::new_v4",
        rename = "_id",
        with = "bson::serde_helpers::uuid_1_as_binary"
    )]
    pub id: Uuid,
    /// Idempotency key; unique index at the storage layer.
    pub session_id: String,
    #[serde(with = "bson::serde_helpers::uuid_1_as_binary")]
    pub tenant: Uuid,
    pub user: Uuid,
    pub amount_cents: i64,
    pub currency: String,
    #[serde(default = "Utc::now")]
    pub recorded_on: DateTime<Utc>,
}

impl From<PaymentEvent> for PaymentRecord {
    fn from(event: PaymentEvent) -> Self {
        PaymentRecord {
            id: Uuid::new_v4(),
            session_id: event.session_id,
            tenant: event.tenant,
            user: event.user,
            amount_cents: event.amount_cents,
            currency: event.currency,
            recorded_on: Utc::now(),
        }
    }
}

pub fn bad_signature_problem() -> Problem {
    // Distinct from the payload problem below so operators can tell a key
    // mismatch from a provider format change. Never echoes the secret or
    // the received signature.
    Problem::new_untyped(Status::Unauthorized, "Webhook signature mismatch.")
}

pub fn bad_payload_problem() -> Problem {
    Problem::new_untyped(Status::BadRequest, "Webhook payload could not be parsed.")
}

/// Verifies the HMAC-SHA256 signature over the raw request body. The header
/// carries the base64url-encoded MAC.
pub fn verify_signature(secret: &[u8], body: &[u8], signature: &str) -> Result<(), Problem> {
    let presented = base64_engine()
        .decode(signature.trim())
        .map_err(|_| bad_signature_problem())?;

    let mut mac = Hmac::new(Sha256::new(), secret);
    mac.input(body);
    let result = mac.result();
    let expected = result.code();

    if presented.len() != expected.len() || !fixed_time_eq(&presented, expected) {
        return Err(bad_signature_problem());
    }

    Ok(())
}

pub fn sign(secret: &[u8], body: &[u8]) -> String {
    let mut mac = Hmac::new(Sha256::new(), secret);
    mac.input(body);
    base64_engine().encode(mac.result().code())
}

pub trait PaymentDbExt {
    /// Records a completed payment at most once per session id. Returns
    /// whether a new record was written; a provider resend is a successful
    /// no-op.
    async fn record_payment(&self, event: PaymentEvent) -> Result<bool, Problem>;
}

impl PaymentDbExt for Database {
    async fn record_payment(&self, event: PaymentEvent) -> Result<bool, Problem> {
        let existing = self
            .collection::<Document>(PAYMENT_COLLECTION_NAME)
            .find_one(doc! { "session_id": &event.session_id }, None)
            .await
            .map_err(Problem::from)?;

        if existing.is_some() {
            tracing::info!("webhook replay for session '{}' ignored", event.session_id);
            return Ok(false);
        }

        let record = PaymentRecord::from(event);
        let insert = self
            .collection(PAYMENT_COLLECTION_NAME)
            .insert_one(
                bson::to_document(&record).expect("PaymentRecord must be serializable to BSON"),
                None,
            )
            .await;

        match insert {
            Ok(_) => Ok(true),
            // Lost a race against a concurrent delivery of the same session;
            // the unique index makes that a replay, not a failure.
            Err(e) if is_duplicate_key(&e) => {
                tracing::info!("webhook replay for session '{}' ignored", record.session_id);
                Ok(false)
            }
            Err(e) => Err(Problem::from(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signature_round_trip() {
        let secret = b"webhook-secret";
        let body = br#"{"session_id":"cs_123"}"#;

        let signature = sign(secret, body);
        verify_signature(secret, body, &signature).expect("valid signature rejected");
    }

    #[test]
    fn tampered_body_is_rejected() {
        let secret = b"webhook-secret";
        let signature = sign(secret, b"original");

        assert!(verify_signature(secret, b"tampered", &signature).is_err());
    }

    #[test]
    fn wrong_secret_is_rejected() {
        let signature = sign(b"secret-a", b"body");
        assert!(verify_signature(b"secret-b", b"body", &signature).is_err());
    }

    #[test]
    fn garbage_signature_is_rejected() {
        assert!(verify_signature(b"secret", b"body", "not base64 !!!").is_err());
    }
}
