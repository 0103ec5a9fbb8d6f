//! # Sandpiper SFTP
//!
//! A multi-tenant SFTP server. Each authenticated session is bound to a
//! virtual filesystem chosen from the user's configuration: a directory on
//! local disk or a bucket on S3-compatible object storage. Every request is
//! checked against the session's permission mask and confined to the
//! session root, and every non-listing operation is reported through an
//! optional notification sink.
//!
//! ## Structure
//!
//! - [`server`]: TCP listener, SSH handshake, per-connection dispatch
//! - [`auth`]: password authentication and session extensions
//! - [`session`]: session binding and the SFTP request server
//! - [`vfs`]: the backend contract plus the local, S3 and notification
//!   implementations
//! - [`users`]: user records and the credential provider
//! - [`permission`]: the permission bitmask
//! - [`path`]: request path containment
//! - [`protocol`]: the SFTP v3 wire layer
//! - [`hostkey`]: RSA host-key loading and generation

pub mod auth;
pub mod config;
pub mod error;
pub mod hostkey;
pub mod path;
pub mod permission;
pub mod protocol;
pub mod server;
pub mod session;
pub mod users;
pub mod vfs;

pub use config::Config;
pub use error::{Error, Result};
pub use permission::{Permission, PermissionSet};
pub use server::SftpServer;
pub use users::{JsonUserProvider, User, UserProvider};
pub use vfs::notify::{Notification, NotificationHandler};
