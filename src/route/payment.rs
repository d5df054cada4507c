use mongodb::Database;
use rocket::request::{self, FromRequest, Request};
use rocket::serde::json::Json;
use rocket::State;
use serde::Serialize;
use std::convert::Infallible;
use utoipa::ToSchema;

use crate::config::Config;
use crate::data::payment::{
    bad_payload_problem, bad_signature_problem, verify_signature, PaymentDbExt, PaymentEvent,
};
use crate::resp::problem::Problem;

pub static SIGNATURE_HEADER_NAME: &str = "X-Webhook-Signature";

#[derive(Debug)]
pub struct WebhookSignature(pub Option<String>);

#[rocket::async_trait]
impl<'r> FromRequest<'r> for WebhookSignature {
    type Error = Infallible;

    async fn from_request(req: &'r Request<'_>) -> request::Outcome<Self, Self::Error> {
        request::Outcome::Success(WebhookSignature(
            req.headers()
                .get_one(SIGNATURE_HEADER_NAME)
                .map(str::to_string),
        ))
    }
}

#[derive(Debug, Serialize, ToSchema)]
pub struct WebhookAck {
    /// False when the session id was seen before; the provider may resend
    /// events and a replay is acknowledged without a second record.
    pub recorded: bool,
}

/// Payment-completed webhook
///
/// Signature verification runs over the raw body before any parsing, so a
/// key mismatch and a malformed payload are reported as different problems.
#[utoipa::path(
    request_body = PaymentEvent,
    responses(
        (status = 200, description = "Event acknowledged", body = WebhookAck),
        (status = 400, description = "Payload could not be parsed", body = Problem),
        (status = 401, description = "Signature mismatch", body = Problem),
    )
)]
#[post("/payment/webhook", data = "<body>")]
#[tracing::instrument(skip(body, db, c))]
pub async fn payment_webhook(
    body: String,
    signature: WebhookSignature,
    db: &State<Database>,
    c: &State<Config>,
) -> Result<Json<WebhookAck>, Problem> {
    if !c.payment_webhook_secret.is_empty() {
        let signature = signature.0.ok_or_else(bad_signature_problem)?;
        verify_signature(
            c.payment_webhook_secret.as_bytes(),
            body.as_bytes(),
            &signature,
        )?;
    } else {
        tracing::warn!("payment webhook signature verification is disabled");
    }

    let event: PaymentEvent = serde_json::from_str(&body).map_err(|_| bad_payload_problem())?;

    let recorded = db.record_payment(event).await?;

    Ok(Json(WebhookAck { recorded }))
}
