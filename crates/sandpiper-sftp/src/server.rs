//! The connection dispatcher.
//!
//! Listens for TCP connections, runs the SSH handshake through the
//! transport library, authenticates with the password callback and serves
//! the `sftp` subsystem on accepted session channels. Every connection runs
//! on its own task; a panicking session cannot take the listener down.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use russh::server::{Auth, Handler, Msg, Server as SshServer, Session};
use russh::{Channel, ChannelId, CryptoVec, MethodSet};
use tracing::{error, info, warn};

use crate::auth::Authenticator;
use crate::config::Config;
use crate::hostkey::HostKeyStore;
use crate::session::{SessionBinder, SftpSession};
use crate::users::{AuthenticationRequest, JsonUserProvider, User, UserProvider};
use crate::vfs::notify::NotificationHandler;
use crate::{Error, Result};

/// Password attempts allowed before a connection is cut off.
pub const MAX_AUTH_TRIES: u32 = 6;

/// The SFTP server. Construct with a [`Config`], optionally swap the user
/// provider or install a notification sink, then [`run`](SftpServer::run).
pub struct SftpServer {
    config: Config,
    provider: Arc<dyn UserProvider>,
    callback: Option<Arc<NotificationHandler>>,
}

impl SftpServer {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            provider: Arc::new(JsonUserProvider::default()),
            callback: None,
        }
    }

    /// Replace the default in-memory user provider.
    pub fn with_user_provider(mut self, provider: Arc<dyn UserProvider>) -> Self {
        self.provider = provider;
        self
    }

    /// Install a sink for notification records.
    pub fn with_notification_callback(mut self, callback: Arc<NotificationHandler>) -> Self {
        self.callback = Some(callback);
        self
    }

    /// Register a user with the active provider.
    pub async fn add_user(&self, user: User) {
        self.provider.register(user).await;
    }

    /// Set up the host key and serve connections until the listener fails.
    pub async fn run(self) -> Result<()> {
        let base_path = self.config.absolute_base_path();

        let keys = HostKeyStore::new(
            &base_path,
            &self.config.ssh_dir,
            &self.config.private_key,
            &self.config.public_key,
        );
        let host_key = keys.load_or_generate().await?;

        let ssh_config = russh::server::Config {
            auth_rejection_time: std::time::Duration::from_secs(1),
            auth_rejection_time_initial: Some(std::time::Duration::from_secs(0)),
            keys: vec![host_key],
            ..Default::default()
        };

        let authenticator = Arc::new(Authenticator::new(
            self.provider.clone(),
            self.config.notify,
            self.callback.clone(),
        ));
        let binder = Arc::new(SessionBinder {
            base_path,
            read_only: self.config.read_only,
            notify: self.config.notify,
            callback: self.callback.clone(),
        });

        let addr = self.config.listen_addr();
        info!(host = %self.config.address, port = self.config.port, "listening for connections");

        russh::server::run(
            Arc::new(ssh_config),
            &addr,
            ConnectionDispatcher {
                authenticator,
                binder,
            },
        )
        .await
        .map_err(|e| Error::Ssh(format!("server error: {}", e)))
    }
}

/// Hands each accepted TCP connection its own handler.
struct ConnectionDispatcher {
    authenticator: Arc<Authenticator>,
    binder: Arc<SessionBinder>,
}

#[async_trait]
impl SshServer for ConnectionDispatcher {
    type Handler = ConnectionHandler;

    async fn new_client(&mut self, peer_addr: Option<SocketAddr>) -> ConnectionHandler {
        ConnectionHandler {
            authenticator: self.authenticator.clone(),
            binder: self.binder.clone(),
            peer_addr,
            extensions: None,
            sftp: None,
            auth_attempts: 0,
        }
    }
}

/// Per-connection state: extensions minted at authentication, the request
/// server once the `sftp` subsystem is accepted.
struct ConnectionHandler {
    authenticator: Arc<Authenticator>,
    binder: Arc<SessionBinder>,
    peer_addr: Option<SocketAddr>,
    extensions: Option<HashMap<String, String>>,
    sftp: Option<SftpSession>,
    auth_attempts: u32,
}

#[async_trait]
impl Handler for ConnectionHandler {
    type Error = Error;

    async fn auth_password(&mut self, user: &str, password: &str) -> Result<Auth> {
        self.auth_attempts += 1;
        if self.auth_attempts > MAX_AUTH_TRIES {
            warn!(user, "too many authentication attempts");
            return Ok(Auth::Reject {
                proceed_with_methods: None,
            });
        }

        let request = AuthenticationRequest {
            user: user.to_string(),
            pass: password.to_string(),
            ip: self
                .peer_addr
                .map(|a| a.to_string())
                .unwrap_or_default(),
            // The transport does not surface the session id or client
            // banner to the handler; both fields stay empty here.
            session_id: Vec::new(),
            client_version: String::new(),
        };

        match self.authenticator.authenticate(request).await {
            Ok(extensions) => {
                self.extensions = Some(extensions);
                Ok(Auth::Accept)
            }
            Err(e) => {
                warn!(user, error = %e, "authentication failed");
                Ok(Auth::Reject {
                    proceed_with_methods: Some(MethodSet::PASSWORD),
                })
            }
        }
    }

    async fn channel_open_session(
        &mut self,
        _channel: Channel<Msg>,
        _session: &mut Session,
    ) -> Result<bool> {
        Ok(true)
    }

    async fn subsystem_request(
        &mut self,
        channel_id: ChannelId,
        name: &str,
        session: &mut Session,
    ) -> Result<()> {
        if name != "sftp" {
            warn!(subsystem = name, "unsupported subsystem requested");
            session.channel_failure(channel_id).await?;
            return Ok(());
        }

        let Some(extensions) = &self.extensions else {
            warn!("subsystem requested before authentication");
            session.channel_failure(channel_id).await?;
            return Ok(());
        };

        match self.binder.bind(extensions) {
            Some(sftp) => {
                info!(session = %sftp.session_id(), "sftp subsystem started");
                self.sftp = Some(sftp);
                session.channel_success(channel_id).await?;
            }
            None => {
                session.channel_failure(channel_id).await?;
            }
        }
        Ok(())
    }

    async fn data(&mut self, channel: ChannelId, data: &[u8], session: &mut Session) -> Result<()> {
        let Some(sftp) = self.sftp.as_mut() else {
            // Data on a channel that never became an SFTP session.
            return Ok(());
        };

        let reply = match sftp.handle_data(data).await {
            Ok(reply) => reply,
            Err(e) => {
                error!(error = %e, "sftp packet handling failed");
                return Err(e);
            }
        };

        if !reply.is_empty() {
            if let Err(e) = session.data(channel, CryptoVec::from_slice(&reply)).await {
                error!(error = %e, "failed to send reply, channel may be closed");
                return Err(Error::Ssh(format!("failed to send reply: {}", e)));
            }
        }
        Ok(())
    }
}
