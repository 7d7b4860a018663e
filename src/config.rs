use anyhow::{Context, Result};
use std::env;
use std::path::PathBuf;
use std::time::Duration;

/// The security core's configuration.
///
/// Built explicitly and passed at construction time. Deployments use
/// [`SecurityConfig::from_env`]; tests build the struct directly, so nothing
/// reads the environment after startup.
#[derive(Clone)]
pub struct SecurityConfig {
    /// The URL of the shared Redis store.
    pub store_url: String,
    /// Path to the master key file (64 hex characters, 32 bytes).
    pub master_key_path: PathBuf,
    /// PEM-encoded RSA private key used to sign tokens.
    pub jwt_private_key: Vec<u8>,
    /// PEM-encoded RSA public key used to verify tokens.
    pub jwt_public_key: Vec<u8>,
    /// Issuer claim stamped into every token.
    pub issuer: String,
    /// Audience claim stamped into every token.
    pub audience: String,
    /// Access token lifetime.
    pub access_token_expiry: Duration,
    /// Refresh token lifetime.
    pub refresh_token_expiry: Duration,
    /// Live refresh tokens allowed per user before the oldest are revoked.
    pub max_refresh_tokens_per_user: usize,
    /// Concurrent sessions allowed per user.
    pub max_sessions_per_user: usize,
    /// Session lifetime from creation; extended only by explicit renewal.
    pub session_timeout: Duration,
    /// Age at which the rotation sweep replaces an active data key.
    pub key_rotation_interval: Duration,
    /// How long revoked token ids stay on the blacklist.
    pub token_blacklist_ttl: Duration,
    /// How long invalidated session ids stay on the blacklist.
    pub session_blacklist_ttl: Duration,
    /// Per-call timeout for store round-trips.
    pub store_timeout: Duration,
    /// Clock-skew tolerance for token validation, in seconds.
    pub jwt_leeway_secs: u64,
    /// Fingerprint hex characters compared during validation. A shorter
    /// prefix tolerates proxy/NAT drift at the cost of precision.
    pub fingerprint_prefix_len: usize,
    /// Interval between background maintenance sweeps.
    pub maintenance_interval: Duration,
}

impl SecurityConfig {
    /// Creates a configuration with the given signing keypair and default
    /// limits: 15 minute access tokens, 7 day refresh tokens, 30 minute
    /// sessions, 5 tokens and 5 sessions per user, 90 day key rotation.
    pub fn new(jwt_private_key: Vec<u8>, jwt_public_key: Vec<u8>) -> Self {
        Self {
            store_url: "redis://127.0.0.1:6379".to_string(),
            master_key_path: PathBuf::from("./keys/master.key"),
            jwt_private_key,
            jwt_public_key,
            issuer: "aegis".to_string(),
            audience: "aegis-clients".to_string(),
            access_token_expiry: Duration::from_secs(15 * 60),
            refresh_token_expiry: Duration::from_secs(7 * 24 * 3600),
            max_refresh_tokens_per_user: 5,
            max_sessions_per_user: 5,
            session_timeout: Duration::from_secs(30 * 60),
            key_rotation_interval: Duration::from_secs(90 * 24 * 3600),
            token_blacklist_ttl: Duration::from_secs(30 * 24 * 3600),
            session_blacklist_ttl: Duration::from_secs(24 * 3600),
            store_timeout: Duration::from_secs(2),
            jwt_leeway_secs: 0,
            fingerprint_prefix_len: 8,
            maintenance_interval: Duration::from_secs(3600),
        }
    }

    /// Creates a `SecurityConfig` from environment variables.
    ///
    /// `JWT_PRIVATE_KEY` and `JWT_PUBLIC_KEY` are required (PEM contents);
    /// everything else falls back to the defaults of [`SecurityConfig::new`].
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();

        let jwt_private_key = env::var("JWT_PRIVATE_KEY")
            .context("JWT_PRIVATE_KEY must be set (PEM-encoded RSA private key)")?
            .into_bytes();
        let jwt_public_key = env::var("JWT_PUBLIC_KEY")
            .context("JWT_PUBLIC_KEY must be set (PEM-encoded RSA public key)")?
            .into_bytes();

        let mut config = Self::new(jwt_private_key, jwt_public_key);

        if let Ok(url) = env::var("STORE_URL") {
            config.store_url = url;
        }
        if let Ok(path) = env::var("MASTER_KEY_PATH") {
            config.master_key_path = PathBuf::from(path);
        }
        if let Ok(issuer) = env::var("TOKEN_ISSUER") {
            config.issuer = issuer;
        }
        if let Ok(audience) = env::var("TOKEN_AUDIENCE") {
            config.audience = audience;
        }

        config.access_token_expiry =
            env_duration_secs("ACCESS_TOKEN_EXPIRY", config.access_token_expiry)?;
        config.refresh_token_expiry =
            env_duration_secs("REFRESH_TOKEN_EXPIRY", config.refresh_token_expiry)?;
        config.session_timeout = env_duration_secs("SESSION_TIMEOUT", config.session_timeout)?;
        config.key_rotation_interval =
            env_duration_secs("KEY_ROTATION_INTERVAL", config.key_rotation_interval)?;
        config.max_refresh_tokens_per_user = env_usize(
            "MAX_REFRESH_TOKENS_PER_USER",
            config.max_refresh_tokens_per_user,
        )?;
        config.max_sessions_per_user =
            env_usize("MAX_SESSIONS_PER_USER", config.max_sessions_per_user)?;

        Ok(config)
    }
}

fn env_duration_secs(name: &str, default: Duration) -> Result<Duration> {
    match env::var(name) {
        Ok(raw) => {
            let secs: u64 = raw
                .parse()
                .with_context(|| format!("Invalid {} (expected seconds)", name))?;
            Ok(Duration::from_secs(secs))
        }
        Err(_) => Ok(default),
    }
}

fn env_usize(name: &str, default: usize) -> Result<usize> {
    match env::var(name) {
        Ok(raw) => raw.parse().with_context(|| format!("Invalid {}", name)),
        Err(_) => Ok(default),
    }
}
