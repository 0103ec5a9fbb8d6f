//! Password authentication and session extension minting.
//!
//! The authenticator is the single entry point behind the SSH transport's
//! password callback. On success it produces the string-valued extension map
//! the transport attaches to the connection; the session binder later
//! projects those extensions into a typed context. On any failure, including
//! an unresolvable filesystem, authentication fails.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{SecondsFormat, Utc};
use tracing::{info, warn};
use uuid::Uuid;

use crate::users::{AuthenticationRequest, UserProvider};
use crate::vfs::notify::{Notification, NotificationHandler};
use crate::Result;

/// Extension keys attached to authenticated connections.
pub mod extensions {
    pub const UUID: &str = "uuid";
    pub const USER: &str = "user";
    pub const REMOTE_ADDR: &str = "remote_addr";
    pub const CLIENT_VERSION: &str = "client_version";
    pub const LOGIN_AT: &str = "login_at";
    pub const FILESYSTEM: &str = "filesystem";
    pub const DEFAULT_FS: &str = "default_fs";
}

/// Validates credentials and mints session extensions.
pub struct Authenticator {
    provider: Arc<dyn UserProvider>,
    notify: bool,
    callback: Option<Arc<NotificationHandler>>,
}

impl Authenticator {
    pub fn new(
        provider: Arc<dyn UserProvider>,
        notify: bool,
        callback: Option<Arc<NotificationHandler>>,
    ) -> Self {
        Self {
            provider,
            notify,
            callback,
        }
    }

    /// Validate a password attempt and build the session extensions.
    pub async fn authenticate(
        &self,
        request: AuthenticationRequest,
    ) -> Result<HashMap<String, String>> {
        let now = Utc::now();
        let login_at = now.to_rfc3339_opts(SecondsFormat::Secs, true);

        let response = self.provider.login(&request.user, &request.pass).await?;

        let (filesystem, use_default_fs, fs_type) = match response.user.filesystem()? {
            Some(config) => (
                serde_json::to_string(config)?,
                "false",
                config.fs.clone(),
            ),
            None => (String::new(), "true", "os".to_string()),
        };

        info!(
            user = %request.user,
            login_at = %login_at,
            event = "Login",
            remote_addr = %request.ip,
            client_version = %request.client_version,
            fs_type = %fs_type,
            "user authenticated"
        );

        if self.notify {
            if let Some(callback) = &self.callback {
                let notification = Notification {
                    user: request.user.clone(),
                    fs_type,
                    client_version: request.client_version.clone(),
                    remote_addr: request.ip.clone(),
                    time: now,
                    event: "Login".to_string(),
                    subject: String::new(),
                    target: String::new(),
                    error: None,
                };
                if let Err(e) = callback(notification) {
                    warn!(error = %e, "notification callback failed");
                }
            }
        }

        let mut ext = HashMap::new();
        ext.insert(extensions::UUID.to_string(), Uuid::new_v4().to_string());
        ext.insert(extensions::USER.to_string(), request.user);
        ext.insert(extensions::REMOTE_ADDR.to_string(), request.ip);
        ext.insert(
            extensions::CLIENT_VERSION.to_string(),
            request.client_version,
        );
        ext.insert(extensions::LOGIN_AT.to_string(), login_at);
        ext.insert(extensions::FILESYSTEM.to_string(), filesystem);
        ext.insert(
            extensions::DEFAULT_FS.to_string(),
            use_default_fs.to_string(),
        );
        Ok(ext)
    }
}
