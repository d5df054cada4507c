use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use rocket::http::Status;
use rocket::request::{self, FromRequest, Request};
use serde::{Deserialize, Serialize};

use crate::data::identity::Identity;
use crate::resp::problem::Problem;
use crate::role::Role;
use crate::util::date_time_as_unix_seconds;
use rocket::outcome::Outcome::Success;
use uuid::Uuid;

pub static AUTH_HEADER_NAME: &str = "Authorization";

/// Bearer-token claims: every request resolves to a tenant, an identity and
/// a role from these, and nothing else. The token issuer is trusted
/// unconditionally.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessClaims {
    #[serde(with = "date_time_as_unix_seconds")]
    iat: DateTime<Utc>,
    #[serde(with = "date_time_as_unix_seconds")]
    exp: DateTime<Utc>,
    pub tenant: Uuid,
    pub user: Uuid,
    pub role: Role,
}

impl AccessClaims {
    pub fn new(identity: &Identity) -> AccessClaims {
        let now = Utc::now();
        AccessClaims {
            iat: now,
            exp: now + Duration::weeks(1),
            tenant: identity.tenant(),
            user: identity.id(),
            role: identity.role(),
        }
    }

    pub fn encode_jwt(
        &self,
        private_key: impl AsRef<[u8]>,
    ) -> Result<String, jsonwebtoken::errors::Error> {
        let header = Header::new(Algorithm::PS256);
        let key = EncodingKey::from_rsa_pem(private_key.as_ref())
            .expect("auth private key isn't valid. Unable to encode JWT.");

        encode(&header, &self, &key)
    }
}

pub fn auth_problem(detail: impl ToString) -> Problem {
    Problem::new_untyped(Status::Unauthorized, "Unable to authorize user.")
        .detail(detail)
        .clone()
}

pub fn extract_claims(
    header: Option<&str>,
    public_key: impl AsRef<[u8]>,
) -> Result<AccessClaims, Problem> {
    let token = match header.and_then(|h| h.strip_prefix("Bearer ")) {
        Some(token) => token.trim(),
        None => {
            return Err(auth_problem("No bearer token."));
        }
    };

    match decode::<AccessClaims>(
        token,
        &DecodingKey::from_rsa_pem(public_key.as_ref())
            .expect("auth public key isn't valid. Unable to decode JWT."),
        &Validation::new(Algorithm::PS256),
    )
    .map(|data| data.claims)
    {
        Ok(it) => {
            tracing::debug!("decoded access claims for user: {}", it.user);

            Ok(it)
        }
        Err(_) => Err(auth_problem("Bearer token was malformed or expired.")),
    }
}

#[rocket::async_trait]
impl<'r> FromRequest<'r> for AccessClaims {
    type Error = Problem;

    async fn from_request(req: &'r Request<'_>) -> request::Outcome<Self, Self::Error> {
        tracing::trace!("extracting access claims from request headers");
        let header = req.headers().get_one(AUTH_HEADER_NAME);

        match extract_claims(header, &crate::CRYPTO.jwt_keys.public) {
            Ok(it) => Success(it),
            Err(e) => {
                tracing::debug!("unable to extract claims from headers");
                request::Outcome::Error((Status::Unauthorized, e))
            }
        }
    }
}

pub mod doc {
    use utoipa::openapi::security::*;

    #[derive(Clone, Copy)]
    pub struct JWTAuth;

    impl From<JWTAuth> for SecurityScheme {
        fn from(_: JWTAuth) -> SecurityScheme {
            let mut http = Http::new(HttpAuthScheme::Bearer);
            http.bearer_format = Some("JWT".to_string());
            http.scheme = HttpAuthScheme::Bearer;
            SecurityScheme::Http(http)
        }
    }

    impl utoipa::Modify for JWTAuth {
        fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
            let c = openapi.components.as_mut().unwrap();
            c.add_security_scheme("jwt", JWTAuth)
        }
    }
}

#[cfg(test)]
#[cfg(feature = "generate-security")]
mod tests {
    use super::*;
    use chrono::SubsecRound;
    use rsa::pkcs1::EncodeRsaPrivateKey;
    use rsa::pkcs8::EncodePublicKey;

    #[test]
    fn jwt_round_trips_claims() {
        let mut now = Utc::now();
        now = now.round_subsecs(0);

        let tenant = Uuid::new_v4();
        let user = Uuid::new_v4();

        let claims = AccessClaims {
            iat: now,
            exp: now + Duration::weeks(1),
            tenant,
            user,
            role: Role::Teacher,
        };

        let mut rng = rand::thread_rng();
        let rsa_sk = rsa::RsaPrivateKey::new(&mut rng, 2048).expect("test key generation");
        let private = rsa_sk
            .to_pkcs1_pem(rsa::pkcs1::LineEnding::LF)
            .unwrap()
            .to_string();
        let public = rsa_sk
            .to_public_key()
            .to_public_key_pem(rsa::pkcs8::LineEnding::LF)
            .unwrap();

        let token = claims
            .encode_jwt(private.as_bytes())
            .expect("encoding should work for example");

        let decoded = extract_claims(
            Some(&format!("Bearer {}", token)),
            public.as_bytes(),
        )
        .expect("unable to decode encoded token");

        assert_eq!(now, decoded.iat);
        assert_eq!(now + Duration::weeks(1), decoded.exp);
        assert_eq!(tenant, decoded.tenant);
        assert_eq!(user, decoded.user);
        assert_eq!(decoded.role, Role::Teacher);
    }

    #[test]
    fn missing_bearer_prefix_is_rejected() {
        assert!(extract_claims(Some("Basic abc"), b"").is_err());
        assert!(extract_claims(None, b"").is_err());
    }
}
