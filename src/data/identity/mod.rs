use crate::resp::problem::Problem;
use crate::role::Role;
use crate::util::base64_engine;
use base64::Engine;
use bson::spec::BinarySubtype;
use bson::{Binary, Bson};
use chrono::{DateTime, Utc};
use crypto::bcrypt::bcrypt;
use rocket::http::Status;
use sha2::{Digest, Sha256};
use std::convert::{TryFrom, TryInto};
use uuid::Uuid;

pub mod db;

pub static TEACHER_COLLECTION_NAME: &str = "teachers";
pub static STUDENT_COLLECTION_NAME: &str = "students";
pub static USER_COLLECTION_NAME: &str = "users";

#[derive(Debug, Clone, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct PasswordHash([u8; 24]);

impl PasswordHash {
    pub fn new(password: impl AsRef<str>) -> PasswordHash {
        let mut pw_hash: [u8; 24] = [0; 24];

        // bcrypt input is capped at 72 bytes; pre-hashing removes the cap.
        let mut sha = Sha256::new();
        sha2::Digest::update(&mut sha, password.as_ref().as_bytes());

        bcrypt(
            12,
            &crate::CRYPTO.salt,
            sha.finalize().as_slice(),
            &mut pw_hash,
        );

        PasswordHash(pw_hash)
    }

    /// Hash of a throwaway random password, used when a bulk import record
    /// arrives without credentials.
    pub fn random() -> PasswordHash {
        let bytes: [u8; 24] = rand::random();
        PasswordHash::new(base64_engine().encode(bytes))
    }
}

impl From<PasswordHash> for Bson {
    fn from(pw_hash: PasswordHash) -> Self {
        Bson::Binary(Binary {
            subtype: BinarySubtype::Generic,
            bytes: pw_hash.0.to_vec(),
        })
    }
}

impl TryFrom<Bson> for PasswordHash {
    type Error = Problem;

    fn try_from(bson: Bson) -> Result<Self, Self::Error> {
        match bson {
            Bson::Binary(bin) => {
                if let Ok(array) = bin.bytes.try_into() {
                    Ok(PasswordHash(array))
                } else {
                    Err(password_lost_err())
                }
            }
            _ => Err(password_lost_err()),
        }
    }
}

fn password_lost_err() -> Problem {
    Problem::new_untyped(Status::InternalServerError, "Unable to check password.")
}

const MFA_SECRET_LEN: usize = 20;

fn new_mfa_secret() -> String {
    let bytes: [u8; MFA_SECRET_LEN] = rand::random();
    base64_engine().encode(bytes)
}

/// Per-identity MFA state machine:
/// Disabled → (setup) → PendingSetup → (verify) → Enabled,
/// any state → (disable) → Disabled.
///
/// The secret issued at setup survives the PendingSetup → Enabled transition,
/// and setup while already pending re-returns it, so a QR code displayed to
/// the user stays valid however many times the setup page reloads.
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state")]
pub enum MfaState {
    Disabled,
    PendingSetup { secret: String },
    Enabled { secret: String },
}

impl Default for MfaState {
    fn default() -> Self {
        MfaState::Disabled
    }
}

impl MfaState {
    /// Begins (or resumes) setup, returning the state to persist and the
    /// secret to show to the user. Idempotent while pending; a no-op when
    /// already enabled.
    pub fn setup(&self) -> Result<(MfaState, String), Problem> {
        match self {
            MfaState::Disabled => {
                let secret = new_mfa_secret();
                Ok((
                    MfaState::PendingSetup {
                        secret: secret.clone(),
                    },
                    secret,
                ))
            }
            MfaState::PendingSetup { secret } => Ok((self.clone(), secret.clone())),
            MfaState::Enabled { .. } => Err(Problem::new_untyped(
                Status::BadRequest,
                "MFA is already enabled.",
            )),
        }
    }

    /// Confirms setup with a TOTP code for the pending secret.
    pub fn verify(&self, code: &str, now: DateTime<Utc>) -> Result<MfaState, Problem> {
        match self {
            MfaState::PendingSetup { secret } => {
                if totp::check(secret, code, now)? {
                    Ok(MfaState::Enabled {
                        secret: secret.clone(),
                    })
                } else {
                    Err(bad_totp_code())
                }
            }
            _ => Err(Problem::new_untyped(
                Status::BadRequest,
                "No MFA setup is pending.",
            )),
        }
    }

    /// Checks a login-time TOTP code. Identities without MFA enabled accept
    /// any absence of a code.
    pub fn check_login(&self, code: Option<&str>, now: DateTime<Utc>) -> Result<(), Problem> {
        match self {
            MfaState::Enabled { secret } => match code {
                Some(code) if totp::check(secret, code, now)? => Ok(()),
                _ => Err(bad_totp_code()),
            },
            _ => Ok(()),
        }
    }

    pub fn disable(&self) -> MfaState {
        MfaState::Disabled
    }

    pub fn is_enabled(&self) -> bool {
        matches!(self, MfaState::Enabled { .. })
    }
}

fn bad_totp_code() -> Problem {
    Problem::new_untyped(Status::Unauthorized, "Invalid one-time code.")
}

/// RFC 6238 TOTP over RFC 4226 HOTP, HMAC-SHA1, 6 digits, 30 second step.
pub mod totp {
    use crate::resp::problem::Problem;
    use crate::util::base64_engine;
    use base64::Engine;
    use chrono::{DateTime, Utc};
    use crypto::hmac::Hmac;
    use crypto::mac::Mac;
    use crypto::sha1::Sha1;
    use rocket::http::Status;

    pub const STEP_SECONDS: u64 = 30;
    const DIGITS: u32 = 6;
    /// Accepted clock skew, in steps, on either side.
    const SKEW: u64 = 1;

    pub fn hotp(secret: &[u8], counter: u64) -> u32 {
        let mut mac = Hmac::new(Sha1::new(), secret);
        mac.input(&counter.to_be_bytes());
        let result = mac.result();
        let digest = result.code();

        let offset = (digest[digest.len() - 1] & 0xf) as usize;
        let bin = ((digest[offset] & 0x7f) as u32) << 24
            | (digest[offset + 1] as u32) << 16
            | (digest[offset + 2] as u32) << 8
            | digest[offset + 3] as u32;

        bin % 10u32.pow(DIGITS)
    }

    pub fn at(secret: &[u8], time: DateTime<Utc>) -> u32 {
        hotp(secret, time.timestamp() as u64 / STEP_SECONDS)
    }

    /// Checks a user-supplied code against the base64-encoded secret,
    /// allowing ±SKEW steps of clock drift.
    pub fn check(secret: &str, code: &str, now: DateTime<Utc>) -> Result<bool, Problem> {
        let secret = base64_engine().decode(secret).map_err(|_| {
            Problem::new_untyped(Status::InternalServerError, "Stored MFA secret is invalid.")
        })?;

        let code: u32 = match code.trim().parse() {
            Ok(it) => it,
            Err(_) => return Ok(false),
        };

        let step = now.timestamp() as u64 / STEP_SECONDS;
        let accepted = (step.saturating_sub(SKEW)..=step + SKEW).any(|c| hotp(&secret, c) == code);

        Ok(accepted)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Teacher {
    #[serde(rename = "_id", with = "bson::serde_helpers::uuid_1_as_binary")]
    pub id: Uuid,
    #[serde(with = "bson::serde_helpers::uuid_1_as_binary")]
    pub tenant: Uuid,
    pub email: String,
    pub name: String,
    pub pw_hash: PasswordHash,
    #[serde(default)]
    pub mfa: MfaState,

    // Cached projection output, overwritten by the stats projector.
    // Never authoritative; the course aggregate is the source of truth.
    #[serde(default)]
    pub course_load: u32,
    #[serde(default)]
    pub classes_load: u32,
    #[serde(default)]
    pub students: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Student {
    #[serde(rename = "_id", with = "bson::serde_helpers::uuid_1_as_binary")]
    pub id: Uuid,
    #[serde(with = "bson::serde_helpers::uuid_1_as_binary")]
    pub tenant: Uuid,
    pub email: String,
    pub name: String,
    pub pw_hash: PasswordHash,
    #[serde(default)]
    pub mfa: MfaState,

    // Cached display assignment; class membership inside the course
    // aggregate is the source of truth.
    #[serde(default)]
    pub course: Option<Uuid>,
    #[serde(default)]
    pub class: Option<Uuid>,
    #[serde(default)]
    pub xp: u32,
}

/// Staff/administrative account.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    #[serde(rename = "_id", with = "bson::serde_helpers::uuid_1_as_binary")]
    pub id: Uuid,
    #[serde(with = "bson::serde_helpers::uuid_1_as_binary")]
    pub tenant: Uuid,
    pub email: String,
    pub name: String,
    pub pw_hash: PasswordHash,
    #[serde(default)]
    pub mfa: MfaState,
    #[serde(default)]
    pub role: Role,
}

/// Deterministic identity id for a (tenant, email) pair. Keeps the student
/// batch upsert stable across repeated imports.
pub fn identity_id(tenant: Uuid, email: &str) -> Uuid {
    Uuid::new_v5(
        &Uuid::NAMESPACE_OID,
        [tenant.to_string().as_str(), email].join(":").as_bytes(),
    )
}

/// Result of the single indexed identity lookup at login. Tagged per role so
/// callers never probe collections themselves.
#[derive(Debug, Clone)]
pub enum Identity {
    Teacher(Teacher),
    User(User),
    Student(Student),
}

impl Identity {
    pub fn id(&self) -> Uuid {
        match self {
            Identity::Teacher(t) => t.id,
            Identity::User(u) => u.id,
            Identity::Student(s) => s.id,
        }
    }

    pub fn tenant(&self) -> Uuid {
        match self {
            Identity::Teacher(t) => t.tenant,
            Identity::User(u) => u.tenant,
            Identity::Student(s) => s.tenant,
        }
    }

    pub fn role(&self) -> Role {
        match self {
            Identity::Teacher(_) => Role::Teacher,
            Identity::User(u) => u.role,
            Identity::Student(_) => Role::Student,
        }
    }

    pub fn pw_hash(&self) -> &PasswordHash {
        match self {
            Identity::Teacher(t) => &t.pw_hash,
            Identity::User(u) => &u.pw_hash,
            Identity::Student(s) => &s.pw_hash,
        }
    }

    pub fn mfa(&self) -> &MfaState {
        match self {
            Identity::Teacher(t) => &t.mfa,
            Identity::User(u) => &u.mfa,
            Identity::Student(s) => &s.mfa,
        }
    }

    pub fn collection_name(&self) -> &'static str {
        match self {
            Identity::Teacher(_) => TEACHER_COLLECTION_NAME,
            Identity::User(_) => USER_COLLECTION_NAME,
            Identity::Student(_) => STUDENT_COLLECTION_NAME,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn mfa_setup_is_idempotent_while_pending() {
        let disabled = MfaState::Disabled;
        let (pending, secret) = disabled.setup().expect("setup from Disabled");
        let (pending_again, secret_again) = pending.setup().expect("setup while pending");

        assert_eq!(secret, secret_again, "pending setup re-issued a secret");
        assert_eq!(pending, pending_again);
    }

    #[test]
    fn mfa_verify_keeps_the_issued_secret() {
        let (pending, secret) = MfaState::Disabled.setup().unwrap();
        let now = Utc::now();
        let raw = base64_engine().decode(&secret).unwrap();
        let code = format!("{:06}", totp::at(&raw, now));

        let enabled = pending.verify(&code, now).expect("verify with valid code");
        assert_eq!(
            enabled,
            MfaState::Enabled {
                secret: secret.clone()
            }
        );

        // Login codes for the same secret keep working after the transition.
        enabled
            .check_login(Some(&code), now)
            .expect("login with valid code");
    }

    #[test]
    fn mfa_verify_rejects_wrong_code() {
        let (pending, secret) = MfaState::Disabled.setup().unwrap();
        let now = Utc::now();
        let raw = base64_engine().decode(&secret).unwrap();
        let good = totp::at(&raw, now);
        let bad = format!("{:06}", (good + 1) % 1_000_000);

        assert!(pending.verify(&bad, now).is_err());
    }

    #[test]
    fn mfa_disable_clears_secret_from_any_state() {
        let (pending, _) = MfaState::Disabled.setup().unwrap();
        assert_eq!(pending.disable(), MfaState::Disabled);

        let enabled = MfaState::Enabled {
            secret: "abc".to_string(),
        };
        assert_eq!(enabled.disable(), MfaState::Disabled);
    }

    #[test]
    fn setup_while_enabled_is_rejected() {
        let enabled = MfaState::Enabled {
            secret: "abc".to_string(),
        };
        assert!(enabled.setup().is_err());
    }

    #[test]
    fn staff_account_collection_is_independent_of_granted_role() {
        // Non-admin staff accounts get the Teacher role but live in the
        // users collection; persistence must follow the identity, not the
        // role.
        let user = User {
            id: Uuid::new_v4(),
            tenant: Uuid::new_v4(),
            email: "staff@example.com".to_string(),
            name: "Staff".to_string(),
            pw_hash: PasswordHash([0; 24]),
            mfa: MfaState::Disabled,
            role: Role::Teacher,
        };
        let identity = Identity::User(user);

        assert_eq!(identity.role(), Role::Teacher);
        assert_eq!(identity.collection_name(), USER_COLLECTION_NAME);
    }

    #[test]
    fn hotp_matches_rfc4226_vectors() {
        // RFC 4226 appendix D, secret "12345678901234567890".
        let secret = b"12345678901234567890";
        let expected = [
            755224u32, 287082, 359152, 969429, 338314, 254676, 287922, 162583, 399871, 520489,
        ];

        for (counter, want) in expected.iter().enumerate() {
            assert_eq!(
                totp::hotp(secret, counter as u64),
                *want,
                "counter {}",
                counter
            );
        }
    }

    #[test]
    fn totp_accepts_adjacent_steps_only() {
        let secret_raw = b"12345678901234567890";
        let secret = base64_engine().encode(secret_raw);
        let now = Utc.timestamp_opt(1_111_111_111, 0).unwrap();

        let current = format!("{:06}", totp::at(secret_raw, now));
        let previous = format!(
            "{:06}",
            totp::hotp(
                secret_raw,
                now.timestamp() as u64 / totp::STEP_SECONDS - 1
            )
        );
        let far_past = format!(
            "{:06}",
            totp::hotp(
                secret_raw,
                now.timestamp() as u64 / totp::STEP_SECONDS - 10
            )
        );

        assert!(totp::check(&secret, &current, now).unwrap());
        assert!(totp::check(&secret, &previous, now).unwrap());
        assert!(!totp::check(&secret, &far_past, now).unwrap());
    }
}
