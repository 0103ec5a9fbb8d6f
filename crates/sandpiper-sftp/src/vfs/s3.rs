//! S3-compatible object-storage backend.
//!
//! SFTP paths map to object keys by stripping the leading `/`. Positional
//! reads become ranged `GetObject` calls; writes are buffered to a local
//! scratch file and uploaded as one `PutObject` when the handle closes,
//! because S3 has no random-access write. Directory semantics use the usual
//! zero-byte `prefix/` marker idiom.

use std::os::unix::fs::FileExt;

use async_trait::async_trait;
use aws_sdk_s3::config::{BehaviorVersion, Credentials, Region};
use aws_sdk_s3::error::DisplayErrorContext;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client;
use tempfile::NamedTempFile;
use tokio::sync::Mutex;
use tracing::{debug, error, warn};

use crate::permission::{Permission, PermissionSet};
use crate::protocol::{FileAttrs, OpenFlags};
use crate::users::S3Params;
use crate::vfs::{CmdMethod, DirEntry, FileReader, FileWriter, ListMethod, VirtualFs};
use crate::{Error, Result};

/// An S3 bucket exposed to one session.
pub struct S3Fs {
    client: Client,
    bucket: String,
    permissions: PermissionSet,
    read_only: bool,
}

impl S3Fs {
    pub fn new(params: &S3Params, permissions: PermissionSet, read_only: bool) -> Self {
        let credentials = Credentials::new(
            params.access_key.clone(),
            params.secret.clone(),
            None,
            None,
            "sandpiper",
        );
        let mut builder = aws_sdk_s3::Config::builder()
            .behavior_version(BehaviorVersion::latest())
            .region(Region::new(params.region.clone()))
            .credentials_provider(credentials)
            .force_path_style(true);
        if !params.endpoint.is_empty() {
            builder = builder.endpoint_url(params.endpoint.clone());
        }

        Self {
            client: Client::from_conf(builder.build()),
            bucket: params.bucket.clone(),
            permissions,
            read_only,
        }
    }

    fn can(&self, permission: Permission) -> bool {
        self.permissions.can(permission)
    }

    /// Probe whether anything exists under `key/`, which is what makes a
    /// "directory" real on object storage.
    async fn prefix_exists(&self, key: &str) -> Result<bool> {
        let output = self
            .client
            .list_objects_v2()
            .bucket(&self.bucket)
            .prefix(format!("{}/", key))
            .max_keys(1)
            .send()
            .await
            .map_err(|e| {
                error!(bucket = %self.bucket, key, error = %DisplayErrorContext(&e), "prefix probe failed");
                Error::Backend("list failed".into())
            })?;
        Ok(!output.contents().is_empty() || !output.common_prefixes().is_empty())
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<()> {
        let mut continuation: Option<String> = None;
        loop {
            let mut request = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(prefix.to_string());
            if let Some(token) = &continuation {
                request = request.continuation_token(token.clone());
            }
            let output = request.send().await.map_err(|e| {
                error!(bucket = %self.bucket, prefix, error = %DisplayErrorContext(&e), "list for delete failed");
                Error::Backend("list failed".into())
            })?;

            for object in output.contents() {
                let Some(key) = object.key() else { continue };
                self.client
                    .delete_object()
                    .bucket(&self.bucket)
                    .key(key)
                    .send()
                    .await
                    .map_err(|e| {
                        error!(bucket = %self.bucket, key, error = %DisplayErrorContext(&e), "delete failed");
                        Error::Backend("delete failed".into())
                    })?;
            }

            continuation = output.next_continuation_token().map(str::to_string);
            if continuation.is_none() {
                break;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl VirtualFs for S3Fs {
    fn fs_type(&self) -> &'static str {
        "s3"
    }

    async fn file_read(&self, path: &str) -> Result<Box<dyn FileReader>> {
        if !self.can(Permission::ReadContent) {
            return Err(Error::PermissionDenied);
        }

        let key = object_key(path);
        // The initial unranged request establishes existence and content
        // length; subsequent positional reads go through ranged requests.
        let object = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(&key)
            .send()
            .await
            .map_err(|e| {
                if e.as_service_error().map(|s| s.is_no_such_key()) == Some(true) {
                    return Error::NoSuchFile;
                }
                error!(bucket = %self.bucket, key, error = %DisplayErrorContext(&e), "get object failed");
                Error::Backend("get failed".into())
            })?;

        let content_length = object.content_length().unwrap_or(0).max(0) as u64;

        Ok(Box::new(S3Reader {
            client: self.client.clone(),
            bucket: self.bucket.clone(),
            key,
            content_length,
        }))
    }

    async fn file_write(&self, path: &str, _flags: OpenFlags) -> Result<Box<dyn FileWriter>> {
        if self.read_only {
            return Err(Error::Unsupported);
        }
        if !self.can(Permission::Create) && !self.can(Permission::Update) {
            return Err(Error::PermissionDenied);
        }

        let writer = S3Writer::new(self.client.clone(), self.bucket.clone(), object_key(path))?;
        Ok(Box::new(writer))
    }

    async fn file_cmd(
        &self,
        method: CmdMethod,
        path: &str,
        target: Option<&str>,
        attrs: &FileAttrs,
    ) -> Result<()> {
        if self.read_only {
            return Err(Error::Unsupported);
        }

        let key = object_key(path);

        match method {
            CmdMethod::Setstat => {
                if !self.can(Permission::Update) {
                    return Err(Error::PermissionDenied);
                }
                // Object storage has no mode bits; record the request and
                // report success so clients that chmod after upload work.
                debug!(bucket = %self.bucket, key, mode = ?attrs.mode_bits(), "setstat is a no-op on object storage");
                Ok(())
            }
            CmdMethod::Rename => {
                if !self.can(Permission::Update) {
                    return Err(Error::PermissionDenied);
                }
                let target_key = object_key(target.ok_or(Error::Unsupported)?);
                // Copy-then-delete within the session's bucket. Not atomic:
                // a crash between the two calls leaves both objects.
                self.client
                    .copy_object()
                    .bucket(&self.bucket)
                    .copy_source(format!("{}/{}", self.bucket, key))
                    .key(&target_key)
                    .send()
                    .await
                    .map_err(|e| {
                        error!(
                            bucket = %self.bucket,
                            source = key,
                            target = target_key,
                            error = %DisplayErrorContext(&e),
                            "failed to rename object"
                        );
                        Error::Backend("copy failed".into())
                    })?;
                self.client
                    .delete_object()
                    .bucket(&self.bucket)
                    .key(&key)
                    .send()
                    .await
                    .map_err(|e| {
                        error!(bucket = %self.bucket, key, error = %DisplayErrorContext(&e), "failed to delete renamed object");
                        Error::Backend("delete failed".into())
                    })?;
                Ok(())
            }
            CmdMethod::Rmdir => {
                if !self.can(Permission::Delete) {
                    return Err(Error::PermissionDenied);
                }
                self.delete_prefix(&format!("{}/", key)).await
            }
            CmdMethod::Mkdir => {
                if !self.can(Permission::Create) {
                    return Err(Error::PermissionDenied);
                }
                self.client
                    .put_object()
                    .bucket(&self.bucket)
                    .key(format!("{}/", key))
                    .body(ByteStream::from_static(b""))
                    .send()
                    .await
                    .map_err(|e| {
                        error!(bucket = %self.bucket, key, error = %DisplayErrorContext(&e), "failed to create directory marker");
                        Error::Backend("put failed".into())
                    })?;
                Ok(())
            }
            // Symlinks have no meaning on object storage.
            CmdMethod::Symlink => Err(Error::Unsupported),
            CmdMethod::Remove => {
                if !self.can(Permission::Delete) {
                    return Err(Error::PermissionDenied);
                }
                self.client
                    .delete_object()
                    .bucket(&self.bucket)
                    .key(&key)
                    .send()
                    .await
                    .map_err(|e| {
                        error!(bucket = %self.bucket, key, error = %DisplayErrorContext(&e), "failed to remove object");
                        Error::Backend("delete failed".into())
                    })?;
                Ok(())
            }
        }
    }

    async fn file_list(&self, method: ListMethod, path: &str) -> Result<Vec<DirEntry>> {
        let key = object_key(path);

        match method {
            ListMethod::List => {
                if !self.can(Permission::Read) {
                    return Err(Error::PermissionDenied);
                }

                let prefix = listing_prefix(&key);
                let mut entries = Vec::new();
                let mut continuation: Option<String> = None;

                loop {
                    let mut request = self
                        .client
                        .list_objects_v2()
                        .bucket(&self.bucket)
                        .prefix(prefix.clone())
                        .delimiter("/");
                    if let Some(token) = &continuation {
                        request = request.continuation_token(token.clone());
                    }
                    let output = request.send().await.map_err(|e| {
                        error!(bucket = %self.bucket, prefix, error = %DisplayErrorContext(&e), "error listing directory");
                        Error::Backend("list failed".into())
                    })?;

                    for common in output.common_prefixes() {
                        let Some(full) = common.prefix() else { continue };
                        let name = full
                            .strip_prefix(&prefix)
                            .unwrap_or(full)
                            .trim_end_matches('/');
                        if name.is_empty() {
                            continue;
                        }
                        entries.push(DirEntry {
                            name: name.to_string(),
                            is_dir: true,
                            mode: 0o755,
                            ..Default::default()
                        });
                    }

                    for object in output.contents() {
                        let Some(full) = object.key() else { continue };
                        // The listing prefix's own marker is not an entry.
                        if full == prefix {
                            continue;
                        }
                        let name = full.strip_prefix(&prefix).unwrap_or(full);
                        entries.push(DirEntry {
                            name: name.to_string(),
                            size: object.size().unwrap_or(0).max(0) as u64,
                            is_dir: false,
                            mode: 0o644,
                            modified: object.last_modified().map(|t| t.secs() as u32),
                        });
                    }

                    continuation = output.next_continuation_token().map(str::to_string);
                    if continuation.is_none() {
                        break;
                    }
                }

                Ok(entries)
            }
            ListMethod::Stat => {
                if !self.can(Permission::Read) {
                    return Err(Error::PermissionDenied);
                }

                if key.is_empty() {
                    return Ok(vec![DirEntry {
                        name: "/".to_string(),
                        is_dir: true,
                        mode: 0o755,
                        ..Default::default()
                    }]);
                }

                match self
                    .client
                    .head_object()
                    .bucket(&self.bucket)
                    .key(&key)
                    .send()
                    .await
                {
                    Ok(head) => Ok(vec![DirEntry {
                        name: leaf_name(&key),
                        size: head.content_length().unwrap_or(0).max(0) as u64,
                        is_dir: false,
                        mode: 0o644,
                        modified: head.last_modified().map(|t| t.secs() as u32),
                    }]),
                    Err(e) if e.as_service_error().map(|s| s.is_not_found()) == Some(true) => {
                        // No object at the key; a populated prefix still
                        // counts as a directory.
                        if self.prefix_exists(&key).await? {
                            Ok(vec![DirEntry {
                                name: leaf_name(&key),
                                is_dir: true,
                                mode: 0o755,
                                ..Default::default()
                            }])
                        } else {
                            Err(Error::NoSuchFile)
                        }
                    }
                    Err(e) => {
                        error!(bucket = %self.bucket, key, error = %DisplayErrorContext(&e), "error running stat on object");
                        Err(Error::Backend("head failed".into()))
                    }
                }
            }
        }
    }
}

/// Positional reader backed by ranged `GetObject` requests. Each read issues
/// a fresh request; the content length from the opening request bounds the
/// ranges so reads past the end answer EOF without a round trip.
struct S3Reader {
    client: Client,
    bucket: String,
    key: String,
    content_length: u64,
}

#[async_trait]
impl FileReader for S3Reader {
    async fn read_at(&self, offset: u64, len: u32) -> Result<Vec<u8>> {
        let Some((start, end)) = byte_range(offset, len, self.content_length) else {
            return Ok(Vec::new());
        };

        let output = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(&self.key)
            .range(format!("bytes={}-{}", start, end))
            .send()
            .await
            .map_err(|e| {
                error!(bucket = %self.bucket, key = %self.key, error = %DisplayErrorContext(&e), "ranged get failed");
                Error::Backend("get failed".into())
            })?;

        let data = output
            .body
            .collect()
            .await
            .map_err(|e| Error::Backend(format!("body read failed: {}", e)))?
            .into_bytes();

        Ok(data.to_vec())
    }
}

/// Write handle that buffers into a scratch file and uploads on commit.
///
/// The scratch file is owned exclusively by this handle. It is removed on
/// commit whether or not the upload succeeds, and the temp-file guard also
/// removes it if the session dies before the handle is closed.
struct S3Writer {
    client: Client,
    bucket: String,
    key: String,
    scratch: Mutex<Option<NamedTempFile>>,
}

impl S3Writer {
    fn new(client: Client, bucket: String, key: String) -> Result<Self> {
        let scratch = tempfile::Builder::new()
            .prefix("sandpiper-s3-")
            .tempfile()
            .map_err(|e| {
                error!(error = %e, "could not allocate scratch file for upload");
                Error::from(e)
            })?;
        Ok(Self {
            client,
            bucket,
            key,
            scratch: Mutex::new(Some(scratch)),
        })
    }
}

#[async_trait]
impl FileWriter for S3Writer {
    async fn write_at(&self, offset: u64, data: &[u8]) -> Result<()> {
        let guard = self.scratch.lock().await;
        let scratch = guard
            .as_ref()
            .ok_or_else(|| Error::Protocol("write handle already closed".into()))?;
        scratch.as_file().write_all_at(data, offset)?;
        Ok(())
    }

    async fn commit(&self) -> Result<()> {
        let scratch = self
            .scratch
            .lock()
            .await
            .take()
            .ok_or_else(|| Error::Protocol("write handle already closed".into()))?;

        let body = ByteStream::from_path(scratch.path())
            .await
            .map_err(|e| Error::Backend(format!("scratch read failed: {}", e)))?;

        let put = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(&self.key)
            .body(body)
            .send()
            .await;

        // The scratch file goes away on both outcomes.
        if let Err(e) = scratch.close() {
            warn!(error = %e, "failed to remove scratch file");
        }

        put.map_err(|e| {
            error!(bucket = %self.bucket, key = %self.key, error = %DisplayErrorContext(&e), "upload failed");
            Error::Backend("put failed".into())
        })?;
        Ok(())
    }
}

/// SFTP path to object key: the path without its leading slash.
fn object_key(path: &str) -> String {
    path.trim_start_matches('/').to_string()
}

/// Listing prefix for a directory key: `""` for the root, `key/` otherwise.
fn listing_prefix(key: &str) -> String {
    if key.is_empty() {
        String::new()
    } else {
        format!("{}/", key)
    }
}

fn leaf_name(key: &str) -> String {
    key.rsplit('/').next().unwrap_or(key).to_string()
}

/// Inclusive byte range for a positional read, clamped to the object size.
/// `None` means the read starts at or past the end and should answer EOF.
fn byte_range(offset: u64, len: u32, content_length: u64) -> Option<(u64, u64)> {
    if len == 0 || offset >= content_length {
        return None;
    }
    let end = (offset + len as u64 - 1).min(content_length - 1);
    Some((offset, end))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn object_key_strips_leading_slash() {
        assert_eq!(object_key("/a/b.txt"), "a/b.txt");
        assert_eq!(object_key("a/b.txt"), "a/b.txt");
        assert_eq!(object_key("/"), "");
    }

    #[test]
    fn listing_prefix_for_root_and_subdir() {
        assert_eq!(listing_prefix(""), "");
        assert_eq!(listing_prefix("a/b"), "a/b/");
    }

    #[test]
    fn byte_range_clamps_to_content_length() {
        // Full-object read.
        assert_eq!(byte_range(0, 100, 100), Some((0, 99)));
        // Tail read shorter than the buffer: 10 bytes requested at 95 of 100.
        assert_eq!(byte_range(95, 10, 100), Some((95, 99)));
        // Interior read.
        assert_eq!(byte_range(10, 10, 100), Some((10, 19)));
    }

    #[test]
    fn byte_range_at_or_past_end_is_eof() {
        assert_eq!(byte_range(100, 10, 100), None);
        assert_eq!(byte_range(150, 10, 100), None);
        assert_eq!(byte_range(0, 10, 0), None);
        assert_eq!(byte_range(0, 0, 100), None);
    }

    #[test]
    fn leaf_name_takes_last_segment() {
        assert_eq!(leaf_name("a/b/c.txt"), "c.txt");
        assert_eq!(leaf_name("c.txt"), "c.txt");
    }
}
