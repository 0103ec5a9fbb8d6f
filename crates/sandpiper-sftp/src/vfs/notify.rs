//! Notification decorator over a filesystem backend.
//!
//! Wraps any [`VirtualFs`] and emits a structured event after every
//! operation except `List`, which is far too chatty to be useful. Events go
//! to the log (error level when the operation failed) and, when configured,
//! to a sink callback. A failing sink never affects the client's request.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{error, info, warn};

use crate::protocol::{FileAttrs, OpenFlags};
use crate::vfs::{CmdMethod, DirEntry, FileReader, FileWriter, ListMethod, VirtualFs};
use crate::{Error, Result};

/// A single observability record. Immutable once emitted.
#[derive(Debug, Clone, Serialize)]
pub struct Notification {
    pub user: String,
    pub fs_type: String,
    pub client_version: String,
    pub remote_addr: String,
    pub time: DateTime<Utc>,
    pub event: String,
    pub subject: String,
    pub target: String,
    pub error: Option<String>,
}

/// Sink for notification records. Errors are logged and swallowed.
pub type NotificationHandler =
    dyn Fn(Notification) -> std::result::Result<(), Box<dyn std::error::Error + Send + Sync>>
        + Send
        + Sync;

/// The decorator. Holds the inner backend plus the session context the
/// records are stamped with.
pub struct NotifyFs {
    inner: Arc<dyn VirtualFs>,
    context: HashMap<String, String>,
    callback: Option<Arc<NotificationHandler>>,
}

impl NotifyFs {
    pub fn new(
        inner: Arc<dyn VirtualFs>,
        context: HashMap<String, String>,
        callback: Option<Arc<NotificationHandler>>,
    ) -> Self {
        Self {
            inner,
            context,
            callback,
        }
    }

    fn notify(&self, event: &str, subject: &str, target: &str, outcome: Option<&Error>) {
        let mut notification = Notification {
            user: String::new(),
            fs_type: self.inner.fs_type().to_string(),
            client_version: String::new(),
            remote_addr: String::new(),
            time: Utc::now(),
            event: event.to_string(),
            subject: subject.to_string(),
            target: target.to_string(),
            error: outcome.map(|e| e.to_string()),
        };
        for (key, value) in &self.context {
            match key.as_str() {
                "user" => notification.user = value.clone(),
                "client_version" => notification.client_version = value.clone(),
                "remote_addr" => notification.remote_addr = value.clone(),
                _ => {}
            }
        }

        match outcome {
            Some(err) => error!(
                fs_type = %notification.fs_type,
                user = %notification.user,
                remote_addr = %notification.remote_addr,
                client_version = %notification.client_version,
                event,
                subject,
                target,
                error = %err,
                "sftp event triggered"
            ),
            None => info!(
                fs_type = %notification.fs_type,
                user = %notification.user,
                remote_addr = %notification.remote_addr,
                client_version = %notification.client_version,
                event,
                subject,
                target,
                "sftp event triggered"
            ),
        }

        if let Some(callback) = &self.callback {
            if let Err(e) = callback(notification) {
                warn!(error = %e, "notification callback failed");
            }
        }
    }
}

#[async_trait]
impl VirtualFs for NotifyFs {
    fn fs_type(&self) -> &'static str {
        self.inner.fs_type()
    }

    async fn file_read(&self, path: &str) -> Result<Box<dyn FileReader>> {
        let result = self.inner.file_read(path).await;
        self.notify("Get", path, "", result.as_ref().err());
        result
    }

    async fn file_write(&self, path: &str, flags: OpenFlags) -> Result<Box<dyn FileWriter>> {
        let result = self.inner.file_write(path, flags).await;
        self.notify("Put", path, "", result.as_ref().err());
        result
    }

    async fn file_cmd(
        &self,
        method: CmdMethod,
        path: &str,
        target: Option<&str>,
        attrs: &FileAttrs,
    ) -> Result<()> {
        let result = self.inner.file_cmd(method, path, target, attrs).await;
        self.notify(
            method.name(),
            path,
            target.unwrap_or(""),
            result.as_ref().err(),
        );
        result
    }

    async fn file_list(&self, method: ListMethod, path: &str) -> Result<Vec<DirEntry>> {
        let result = self.inner.file_list(method, path).await;
        // Listings fire on every prompt redraw; suppressing them keeps the
        // event stream meaningful. Stat still reports.
        if method != ListMethod::List {
            self.notify(method.name(), path, "", result.as_ref().err());
        }
        result
    }
}
