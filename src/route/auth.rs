use chrono::Utc;
use mongodb::Database;
use rocket::serde::json::Json;
use rocket::State;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::config::Config;
use crate::data::identity::db::{IdentityDbExt, LoginData, SignupData};
use crate::resp::jwt::AccessClaims;
use crate::resp::problem::Problem;
use crate::role::Role;

#[derive(Debug, Clone, Deserialize, ToSchema)]
pub struct SignupRequest {
    pub tenant: Uuid,
    #[schema(format = "email")]
    pub email: String,
    pub name: String,
    #[schema(format = "password")]
    pub password: String,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct LoginResponse {
    pub token: String,
    pub id: Uuid,
    pub role: Role,
}

/// Create a staff account
///
/// Emails listed in the server configuration get the Admin role.
#[utoipa::path(
    request_body = SignupRequest,
    responses(
        (status = 200, description = "Signed-up account with a fresh token", body = LoginResponse),
        (status = 400, description = "Invalid email or weak password", body = Problem),
    )
)]
#[post("/signup", format = "application/json", data = "<signup>")]
#[tracing::instrument(skip(db, c))]
pub async fn signup(
    signup: Json<SignupRequest>,
    db: &State<Database>,
    c: &State<Config>,
) -> Result<Json<LoginResponse>, Problem> {
    let signup = signup.into_inner();
    let tenant = signup.tenant;

    let user = db
        .create_user(
            tenant,
            SignupData {
                email: signup.email,
                name: signup.name,
                password: signup.password,
            },
            &c.admin_emails,
        )
        .await?;

    let identity = crate::data::identity::Identity::User(user);
    let claims = AccessClaims::new(&identity);
    let token = claims.encode_jwt(&crate::CRYPTO.jwt_keys.private)?;

    Ok(Json(LoginResponse {
        token,
        id: identity.id(),
        role: identity.role(),
    }))
}

/// Log in
///
/// Credentials are verified with the same hashed comparison for every role;
/// identities with MFA enabled must supply a current one-time code.
#[utoipa::path(
    request_body = LoginData,
    responses(
        (status = 200, description = "Bearer token and identity summary", body = LoginResponse),
        (status = 401, description = "Bad credentials or missing/invalid one-time code", body = Problem),
    )
)]
#[post("/login", format = "application/json", data = "<login>")]
#[tracing::instrument(skip(db))]
pub async fn login(
    login: Json<LoginData>,
    db: &State<Database>,
) -> Result<Json<LoginResponse>, Problem> {
    let identity = db.login(login.into_inner()).await?;

    let claims = AccessClaims::new(&identity);
    let token = claims.encode_jwt(&crate::CRYPTO.jwt_keys.private)?;

    Ok(Json(LoginResponse {
        token,
        id: identity.id(),
        role: identity.role(),
    }))
}

#[derive(Debug, Serialize, ToSchema)]
pub struct MfaSetupResponse {
    /// base64url-encoded shared secret; rendered as a QR code by the
    /// frontend. Stable across repeated setup calls until verified or
    /// disabled.
    pub secret: String,
}

#[derive(Debug, Clone, Deserialize, ToSchema)]
pub struct MfaVerifyData {
    pub code: String,
}

/// Begin or resume MFA setup for the authenticated identity
#[utoipa::path(
    responses(
        (status = 200, description = "Shared secret to enroll", body = MfaSetupResponse),
        (status = 400, description = "MFA already enabled", body = Problem),
    ),
    security(("jwt" = []))
)]
#[post("/mfa/setup")]
#[tracing::instrument(skip(db))]
pub async fn mfa_setup(
    auth: AccessClaims,
    db: &State<Database>,
) -> Result<Json<MfaSetupResponse>, Problem> {
    let state = db.load_mfa(auth.tenant, auth.user).await?;
    let (next, secret) = state.setup()?;

    if next != state {
        db.store_mfa(auth.tenant, auth.user, &next).await?;
    }

    Ok(Json(MfaSetupResponse { secret }))
}

/// Confirm MFA setup with a one-time code
#[utoipa::path(
    request_body = MfaVerifyData,
    responses(
        (status = 200, description = "MFA enabled"),
        (status = 400, description = "No setup pending", body = Problem),
        (status = 401, description = "Wrong one-time code", body = Problem),
    ),
    security(("jwt" = []))
)]
#[post("/mfa/verify", format = "application/json", data = "<verify>")]
#[tracing::instrument(skip(db))]
pub async fn mfa_verify(
    verify: Json<MfaVerifyData>,
    auth: AccessClaims,
    db: &State<Database>,
) -> Result<(), Problem> {
    let state = db.load_mfa(auth.tenant, auth.user).await?;
    let next = state.verify(&verify.code, Utc::now())?;

    db.store_mfa(auth.tenant, auth.user, &next).await
}

/// Disable MFA for the authenticated identity
#[utoipa::path(
    responses((status = 200, description = "MFA disabled, secret cleared")),
    security(("jwt" = []))
)]
#[post("/mfa/disable")]
#[tracing::instrument(skip(db))]
pub async fn mfa_disable(auth: AccessClaims, db: &State<Database>) -> Result<(), Problem> {
    let state = db.load_mfa(auth.tenant, auth.user).await?;

    db.store_mfa(auth.tenant, auth.user, &state.disable()).await
}
