use std::convert::TryInto;
use std::path::PathBuf;
use std::{env, fs};

const PASSWORD_SALT: &str = "password.salt";
const AUTH_PUBLIC: &str = "auth.pem.pub";
const AUTH_PRIVATE: &str = "auth.pem";

pub type Salt = [u8; 16];

#[derive(Debug, Clone)]
pub struct KeySet {
    pub public: Vec<u8>,
    pub private: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct Crypto {
    pub salt: Salt,
    pub jwt_keys: KeySet,
}

#[inline]
fn security_dir() -> PathBuf {
    PathBuf::from(env::var("SECURITY_DIR").unwrap_or("./security".to_string()))
}

impl Crypto {
    pub fn init() -> Crypto {
        let dir = security_dir();

        fs::create_dir_all(dir.clone())
            .expect("unable to create directory for storing security information");

        tracing::info!("Loading password salt...");
        let mut salt: Option<Salt> = fs::read(dir.join(PASSWORD_SALT))
            .map(|s| s.try_into().ok())
            .ok()
            .flatten();

        match salt {
            None => {
                tracing::info!(
                    "Salt not found in '{}'. Generating a new password salt.",
                    dir.join(PASSWORD_SALT).display()
                );
                salt = Some(rand::random());

                fs::write(dir.join(PASSWORD_SALT), salt.unwrap()).expect("unable to write salt");
            }
            Some(_) => tracing::info!("Salt found and loaded."),
        }

        tracing::info!("Loading JWT signing keys...");
        let public = fs::read(dir.join(AUTH_PUBLIC)).unwrap_or_default();
        let private = fs::read(dir.join(AUTH_PRIVATE)).unwrap_or_default();

        let jwt_keys = if public.is_empty() || private.is_empty() {
            generate_jwt_keys(&dir)
        } else {
            tracing::info!("Loaded JWT keys.");
            KeySet { public, private }
        };

        Crypto {
            salt: salt.unwrap(),
            jwt_keys,
        }
    }
}

#[cfg(feature = "generate-security")]
fn generate_jwt_keys(dir: &std::path::Path) -> KeySet {
    use rsa::pkcs1::EncodeRsaPrivateKey;
    use rsa::pkcs8::EncodePublicKey;

    tracing::info!("Private and/or public auth key(s) empty. Generating a new pair.");

    tracing::info!("Generating a private RSA key. This will take a few minutes...");
    let mut rng = rand::thread_rng();
    let rsa_sk =
        rsa::RsaPrivateKey::new(&mut rng, 4096).expect("unable to generate a private RSA key");

    tracing::info!("Creating PS256 private key...");
    let private: Vec<u8> = rsa_sk
        .to_pkcs1_pem(rsa::pkcs1::LineEnding::LF)
        .expect("unable to generate PS256 private key")
        .to_string()
        .into_bytes();

    fs::write(dir.join(AUTH_PRIVATE), private.as_slice())
        .expect("unable to write auth private key");

    tracing::info!("Creating PS256 public key...");
    let public = rsa_sk
        .to_public_key()
        .to_public_key_pem(rsa::pkcs8::LineEnding::LF)
        .expect("unable to generate PS256 public key")
        .into_bytes();

    fs::write(dir.join(AUTH_PUBLIC), public.as_slice()).expect("unable to write auth public key");

    tracing::info!("Done generating JWT keys.");

    KeySet { public, private }
}

#[cfg(not(feature = "generate-security"))]
fn generate_jwt_keys(dir: &std::path::Path) -> KeySet {
    panic!(
        "JWT keys missing in '{}' and key generation is disabled (feature 'generate-security').",
        dir.display()
    )
}
