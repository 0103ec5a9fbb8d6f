//! User records, per-user filesystem configuration and credential lookup.
//!
//! Users are read-only during a session. The wire shape of a filesystem
//! config is a tag plus an untyped parameter map (that is what `users.json`
//! carries); [`FilesystemConfig::backend`] projects it into the typed
//! [`BackendConfig`] union once, at session bind time, so backend code never
//! touches loose JSON values.

use std::collections::HashMap;

use async_trait::async_trait;
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256, Sha512};
use tokio::sync::RwLock;

use crate::permission::PermissionSet;
use crate::{Error, Result};

/// Hash algorithm used when a provider is built without an explicit one.
pub const DEFAULT_HASH_ALGO: &str = "sha256";

/// A named filesystem configuration attached to a user.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilesystemConfig {
    /// Backend tag: `"os"` or `"s3"`.
    pub fs: String,
    /// Permission names for sessions on this filesystem. Empty means the
    /// server default applies.
    #[serde(default)]
    pub permissions: Vec<String>,
    /// Backend-specific parameters, keyed by the tag.
    #[serde(default)]
    pub params: serde_json::Map<String, Value>,
}

impl FilesystemConfig {
    /// Project the untyped parameter map into a typed backend config.
    /// Returns `None` for unknown tags; the session binder falls back to the
    /// local backend at the server base path in that case.
    pub fn backend(&self) -> Option<BackendConfig> {
        match self.fs.as_str() {
            "os" => Some(BackendConfig::Os(OsParams {
                base_path: self.param("base_path"),
            })),
            "s3" => {
                let region = self.param("region");
                Some(BackendConfig::S3(S3Params {
                    endpoint: self.param("endpoint"),
                    region: if region.is_empty() {
                        "us-east-1".to_string()
                    } else {
                        region
                    },
                    bucket: self.param("bucket"),
                    access_key: self.param("access_key"),
                    secret: self.param("secret"),
                }))
            }
            _ => None,
        }
    }

    /// The permission mask for sessions on this filesystem.
    pub fn permission_set(&self) -> PermissionSet {
        if self.permissions.is_empty() {
            PermissionSet::all()
        } else {
            PermissionSet::from_names(&self.permissions)
        }
    }

    fn param(&self, key: &str) -> String {
        match self.params.get(key) {
            Some(Value::String(s)) => s.clone(),
            _ => String::new(),
        }
    }
}

/// Typed backend parameters, parsed once per session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendConfig {
    Os(OsParams),
    S3(S3Params),
}

/// Parameters for the local-disk backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OsParams {
    /// Root directory for the session. Empty means the server base path.
    pub base_path: String,
}

/// Parameters for the S3 backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct S3Params {
    pub endpoint: String,
    pub region: String,
    pub bucket: String,
    pub access_key: String,
    pub secret: String,
}

/// A registered user.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    #[serde(default)]
    pub id: i64,
    pub username: String,
    /// Credential reference; the provider decides how to interpret it. The
    /// JSON provider treats it as a hex digest under its hash algorithm.
    pub password: String,
    #[serde(default)]
    pub filesystems: Vec<FilesystemConfig>,
    /// Tag of the filesystem to use when several are configured.
    #[serde(default)]
    pub default_filesystem: String,
    #[serde(default)]
    pub permissions: Vec<String>,
}

impl User {
    /// Resolve the filesystem config for a new session.
    ///
    /// `Ok(None)` means the user has no configuration and the server default
    /// filesystem applies. A non-empty `default_filesystem` must match one of
    /// the configured tags or resolution fails.
    pub fn filesystem(&self) -> Result<Option<&FilesystemConfig>> {
        if self.filesystems.is_empty() {
            return Ok(None);
        }
        if !self.default_filesystem.is_empty() {
            return self
                .filesystems
                .iter()
                .find(|c| c.fs == self.default_filesystem)
                .map(Some)
                .ok_or_else(|| Error::Config("no filesystem for user".into()));
        }
        Ok(Some(&self.filesystems[0]))
    }
}

/// An authentication attempt, alive only for one password callback.
#[derive(Debug, Clone)]
pub struct AuthenticationRequest {
    pub user: String,
    pub pass: String,
    pub ip: String,
    pub session_id: Vec<u8>,
    pub client_version: String,
}

/// The provider's answer to a successful login.
#[derive(Debug, Clone)]
pub struct AuthenticationResponse {
    /// Provider tag, useful when several providers are chained.
    pub server_tag: String,
    /// Opaque 63-bit session token from a cryptographic RNG.
    pub token: u64,
    pub user: User,
}

/// Username to credential lookup and registration.
#[async_trait]
pub trait UserProvider: Send + Sync {
    /// Validate a password. Any failure mode answers
    /// [`Error::InvalidCredentials`].
    async fn login(&self, username: &str, pass: &str) -> Result<AuthenticationResponse>;

    /// Register a user, overwriting any existing record with the same name.
    async fn register(&self, user: User);
}

/// The reference provider: an in-memory map of users, passwords matched
/// against a stored digest. Logins take a read lock; registration, which is
/// rare, takes the write lock.
pub struct JsonUserProvider {
    users: RwLock<HashMap<String, User>>,
    hash_algo: String,
}

impl JsonUserProvider {
    pub fn new(hash_algo: impl Into<String>) -> Self {
        let algo = hash_algo.into();
        Self {
            users: RwLock::new(HashMap::new()),
            hash_algo: if algo.is_empty() {
                DEFAULT_HASH_ALGO.to_string()
            } else {
                algo
            },
        }
    }

    pub fn with_users(hash_algo: impl Into<String>, users: HashMap<String, User>) -> Self {
        let mut provider = Self::new(hash_algo);
        provider.users = RwLock::new(users);
        provider
    }
}

impl Default for JsonUserProvider {
    fn default() -> Self {
        Self::new(DEFAULT_HASH_ALGO)
    }
}

#[async_trait]
impl UserProvider for JsonUserProvider {
    async fn login(&self, username: &str, pass: &str) -> Result<AuthenticationResponse> {
        let users = self.users.read().await;
        // A missing user, a digest mismatch and an unknown hash algorithm
        // must be indistinguishable to the caller.
        let user = users.get(username);
        let matched = user.map(|u| digest_matches(pass, &u.password, &self.hash_algo));
        match (user, matched) {
            (Some(user), Some(Ok(true))) => Ok(AuthenticationResponse {
                server_tag: "json".to_string(),
                token: mint_token(),
                user: user.clone(),
            }),
            _ => Err(Error::InvalidCredentials),
        }
    }

    async fn register(&self, user: User) {
        let mut users = self.users.write().await;
        users.insert(user.username.clone(), user);
    }
}

/// Compare a plaintext password against a stored hex digest.
fn digest_matches(pass: &str, stored: &str, algo: &str) -> Result<bool> {
    let digest = match algo {
        "sha256" => hex::encode(Sha256::digest(pass.as_bytes())),
        "sha512" => hex::encode(Sha512::digest(pass.as_bytes())),
        other => {
            return Err(Error::Config(format!("unknown hash algorithm: {}", other)));
        }
    };
    Ok(digest.eq_ignore_ascii_case(stored))
}

/// A uniform 63-bit token from the OS random source.
fn mint_token() -> u64 {
    OsRng.next_u64() >> 1
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sha256_digest_matching() {
        // sha256("hunter2")
        let stored = "f52fbd32b2b3b86ff88ef6c490628285f482af15ddcb29541f94bcf526a3f6c7";
        assert!(digest_matches("hunter2", stored, "sha256").unwrap());
        assert!(!digest_matches("hunter3", stored, "sha256").unwrap());
        assert!(digest_matches("hunter2", &stored.to_uppercase(), "sha256").unwrap());
    }

    #[test]
    fn unknown_algorithm_is_an_error() {
        assert!(digest_matches("x", "y", "md5").is_err());
    }

    #[test]
    fn tokens_fit_in_63_bits() {
        for _ in 0..64 {
            assert!(mint_token() < (1u64 << 63));
        }
    }

    #[test]
    fn filesystem_resolution_prefers_default_tag() {
        let user = User {
            id: 1,
            username: "a".into(),
            password: String::new(),
            filesystems: vec![
                FilesystemConfig {
                    fs: "os".into(),
                    permissions: vec![],
                    params: Default::default(),
                },
                FilesystemConfig {
                    fs: "s3".into(),
                    permissions: vec![],
                    params: Default::default(),
                },
            ],
            default_filesystem: "s3".into(),
            permissions: vec![],
        };
        assert_eq!(user.filesystem().unwrap().unwrap().fs, "s3");
    }

    #[test]
    fn filesystem_resolution_falls_back_to_first() {
        let user = User {
            id: 1,
            username: "a".into(),
            password: String::new(),
            filesystems: vec![FilesystemConfig {
                fs: "os".into(),
                permissions: vec![],
                params: Default::default(),
            }],
            default_filesystem: String::new(),
            permissions: vec![],
        };
        assert_eq!(user.filesystem().unwrap().unwrap().fs, "os");
    }

    #[test]
    fn unmatched_default_filesystem_fails() {
        let user = User {
            id: 1,
            username: "a".into(),
            password: String::new(),
            filesystems: vec![FilesystemConfig {
                fs: "os".into(),
                permissions: vec![],
                params: Default::default(),
            }],
            default_filesystem: "s3".into(),
            permissions: vec![],
        };
        assert!(user.filesystem().is_err());
    }

    #[test]
    fn s3_params_default_region() {
        let cfg: FilesystemConfig = serde_json::from_value(serde_json::json!({
            "fs": "s3",
            "params": {"bucket": "files", "access_key": "ak", "secret": "sk"}
        }))
        .unwrap();
        match cfg.backend().unwrap() {
            BackendConfig::S3(p) => {
                assert_eq!(p.region, "us-east-1");
                assert_eq!(p.bucket, "files");
                assert!(p.endpoint.is_empty());
            }
            other => panic!("expected S3 config, got {:?}", other),
        }
    }

    #[test]
    fn unknown_tag_has_no_typed_config() {
        let cfg = FilesystemConfig {
            fs: "gdrive".into(),
            permissions: vec![],
            params: Default::default(),
        };
        assert!(cfg.backend().is_none());
    }
}
