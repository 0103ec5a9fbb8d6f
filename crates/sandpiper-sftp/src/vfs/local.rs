//! Local-disk backend.
//!
//! Maps the four filesystem operations onto syscalls under the session's
//! data root. Reads and listings are lock-free; a per-backend mutex covers
//! only the stat-or-create window of `file_write` so two concurrent uploads
//! of the same new file cannot race the permission decision.

use std::os::unix::fs::{FileExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::task;
use tracing::{error, warn};

use crate::path::{DataDirResolver, PathResolver};
use crate::permission::{Permission, PermissionSet};
use crate::protocol::{FileAttrs, OpenFlags};
use crate::vfs::{CmdMethod, DirEntry, FileReader, FileWriter, ListMethod, VirtualFs};
use crate::{Error, Result};

/// Answers whether the backing disk can accept more data. The default
/// implementation always says yes; deployments wire a real check here.
pub type DiskSpacePredicate = Arc<dyn Fn() -> bool + Send + Sync>;

/// A local filesystem exposed to one session.
pub struct LocalFs {
    resolver: Arc<dyn PathResolver>,
    permissions: PermissionSet,
    read_only: bool,
    has_disk_space: Option<DiskSpacePredicate>,
    write_lock: Mutex<()>,
}

impl LocalFs {
    pub fn new(base_path: impl AsRef<Path>, permissions: PermissionSet, read_only: bool) -> Self {
        Self {
            resolver: Arc::new(DataDirResolver::new(base_path)),
            permissions,
            read_only,
            has_disk_space: None,
            write_lock: Mutex::new(()),
        }
    }

    /// Replace the path resolver. Tests use this to stub containment.
    pub fn with_resolver(mut self, resolver: Arc<dyn PathResolver>) -> Self {
        self.resolver = resolver;
        self
    }

    /// Install a disk-space predicate consulted before every write.
    pub fn with_disk_space_check(mut self, predicate: DiskSpacePredicate) -> Self {
        self.has_disk_space = Some(predicate);
        self
    }

    fn can(&self, permission: Permission) -> bool {
        self.permissions.can(permission)
    }
}

#[async_trait]
impl VirtualFs for LocalFs {
    fn fs_type(&self) -> &'static str {
        "os"
    }

    async fn file_read(&self, path: &str) -> Result<Box<dyn FileReader>> {
        if !self.can(Permission::ReadContent) {
            return Err(Error::PermissionDenied);
        }

        let p = self.resolver.resolve(path)?;

        match tokio::fs::metadata(&p).await {
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Err(Error::NoSuchFile),
            Err(e) => {
                error!(source = %p.display(), error = %e, "could not stat file for reading");
                return Err(e.into());
            }
            Ok(_) => {}
        }

        let file = open_blocking(p.clone(), |p| std::fs::File::open(p)).await.map_err(|e| {
            error!(source = %p.display(), error = %e, "could not open file for reading");
            e
        })?;

        Ok(Box::new(LocalReader { file: Arc::new(file) }))
    }

    async fn file_write(&self, path: &str, flags: OpenFlags) -> Result<Box<dyn FileWriter>> {
        if self.read_only {
            return Err(Error::Unsupported);
        }

        let p = self.resolver.resolve(path)?;

        if let Some(check) = &self.has_disk_space {
            if !check() {
                return Err(Error::QuotaExceeded);
            }
        }

        // The stat decides which permission applies and whether the parent
        // chain must be created; hold the lock across stat plus create so a
        // concurrent writer cannot slip between them.
        let _guard = self.write_lock.lock().await;

        match tokio::fs::metadata(&p).await {
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                if !self.can(Permission::Create) {
                    return Err(Error::PermissionDenied);
                }

                if let Some(parent) = p.parent() {
                    let mut builder = tokio::fs::DirBuilder::new();
                    builder.recursive(true).mode(0o755);
                    if let Err(e) = builder.create(parent).await {
                        error!(
                            source = %p.display(),
                            path = %parent.display(),
                            error = %e,
                            "error making path for file"
                        );
                        return Err(e.into());
                    }
                }
            }
            Err(e) => {
                error!(source = %p.display(), error = %e, "error performing file stat");
                return Err(e.into());
            }
            Ok(stat) => {
                if !self.can(Permission::Update) {
                    return Err(Error::PermissionDenied);
                }
                if stat.is_dir() {
                    warn!(source = %p.display(), "attempted to open a directory for writing");
                    return Err(Error::Unsupported);
                }
            }
        }

        let file = open_blocking(p.clone(), |p| std::fs::File::create(p))
            .await
            .map_err(|e| {
                error!(source = %p.display(), flags = flags.0, error = %e, "error creating file");
                e
            })?;

        Ok(Box::new(LocalWriter { file: Arc::new(file) }))
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

        let p = self.resolver.resolve(path)?;

        // A two-path method whose target leaves the root is refused as
        // unsupported rather than revealing the containment rule.
        let target = match target {
            Some(t) => Some(self.resolver.resolve(t).map_err(|_| Error::Unsupported)?),
            None => None,
        };

        match method {
            CmdMethod::Setstat => {
                if !self.can(Permission::Update) {
                    return Err(Error::PermissionDenied);
                }
                let mode = setstat_mode(attrs);
                let perms = std::fs::Permissions::from_mode(mode);
                if let Err(e) = tokio::fs::set_permissions(&p, perms).await {
                    error!(source = %p.display(), error = %e, "failed to perform setstat");
                    return Err(e.into());
                }
                Ok(())
            }
            CmdMethod::Rename => {
                if !self.can(Permission::Update) {
                    return Err(Error::PermissionDenied);
                }
                let target = target.ok_or(Error::Unsupported)?;
                if let Err(e) = tokio::fs::rename(&p, &target).await {
                    error!(
                        source = %p.display(),
                        target = %target.display(),
                        error = %e,
                        "failed to rename file"
                    );
                    return Err(e.into());
                }
                Ok(())
            }
            CmdMethod::Rmdir => {
                if !self.can(Permission::Delete) {
                    return Err(Error::PermissionDenied);
                }
                if let Err(e) = tokio::fs::remove_dir_all(&p).await {
                    error!(source = %p.display(), error = %e, "failed to remove directory");
                    return Err(e.into());
                }
                Ok(())
            }
            CmdMethod::Mkdir => {
                if !self.can(Permission::Create) {
                    return Err(Error::PermissionDenied);
                }
                let mut builder = tokio::fs::DirBuilder::new();
                builder.recursive(true).mode(0o755);
                if let Err(e) = builder.create(&p).await {
                    error!(source = %p.display(), error = %e, "failed to create directory");
                    return Err(e.into());
                }
                Ok(())
            }
            CmdMethod::Symlink => {
                if !self.can(Permission::Create) {
                    return Err(Error::PermissionDenied);
                }
                let target = target.ok_or(Error::Unsupported)?;
                if let Err(e) = tokio::fs::symlink(&p, &target).await {
                    error!(
                        source = %p.display(),
                        target = %target.display(),
                        error = %e,
                        "failed to create symlink"
                    );
                    return Err(e.into());
                }
                Ok(())
            }
            CmdMethod::Remove => {
                if !self.can(Permission::Delete) {
                    return Err(Error::PermissionDenied);
                }
                if let Err(e) = tokio::fs::remove_file(&p).await {
                    if e.kind() == std::io::ErrorKind::NotFound {
                        warn!(source = %p.display(), "removing a file that is already absent");
                    } else {
                        error!(source = %p.display(), error = %e, "failed to remove a file");
                    }
                    return Err(e.into());
                }
                Ok(())
            }
        }
    }

    async fn file_list(&self, method: ListMethod, path: &str) -> Result<Vec<DirEntry>> {
        let p = self.resolver.resolve(path)?;

        match method {
            ListMethod::List => {
                if !self.can(Permission::Read) {
                    return Err(Error::PermissionDenied);
                }
                let mut read_dir = tokio::fs::read_dir(&p).await.map_err(|e| {
                    error!(source = %p.display(), error = %e, "error listing directory");
                    Error::from(e)
                })?;

                let mut entries = Vec::new();
                while let Some(item) = read_dir.next_entry().await.map_err(Error::from)? {
                    if let Ok(meta) = item.metadata().await {
                        entries.push(entry_from_metadata(
                            item.file_name().to_string_lossy().into_owned(),
                            &meta,
                        ));
                    }
                }
                Ok(entries)
            }
            ListMethod::Stat => {
                if !self.can(Permission::Read) {
                    return Err(Error::PermissionDenied);
                }
                let meta = match tokio::fs::metadata(&p).await {
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                        return Err(Error::NoSuchFile);
                    }
                    Err(e) => {
                        error!(source = %p.display(), error = %e, "error running stat on file");
                        return Err(e.into());
                    }
                    Ok(meta) => meta,
                };
                let name = p
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_else(|| "/".to_string());
                Ok(vec![entry_from_metadata(name, &meta)])
            }
        }
    }
}

/// Positional reader over a shared file descriptor. The OS serializes
/// nothing here; concurrent `pread`s are independent.
struct LocalReader {
    file: Arc<std::fs::File>,
}

#[async_trait]
impl FileReader for LocalReader {
    async fn read_at(&self, offset: u64, len: u32) -> Result<Vec<u8>> {
        let file = self.file.clone();
        run_blocking(move || {
            let mut buf = vec![0u8; len as usize];
            let n = file.read_at(&mut buf, offset)?;
            buf.truncate(n);
            Ok(buf)
        })
        .await
    }
}

struct LocalWriter {
    file: Arc<std::fs::File>,
}

#[async_trait]
impl FileWriter for LocalWriter {
    async fn write_at(&self, offset: u64, data: &[u8]) -> Result<()> {
        let file = self.file.clone();
        let data = data.to_vec();
        run_blocking(move || {
            file.write_all_at(&data, offset)?;
            Ok(())
        })
        .await
    }

    async fn commit(&self) -> Result<()> {
        Ok(())
    }
}

/// Mode for a Setstat request: the client's permission bits, 0644 when the
/// client sent none, 0755 for anything flagged as a directory.
fn setstat_mode(attrs: &FileAttrs) -> u32 {
    if attrs.is_dir() {
        return 0o755;
    }
    match attrs.mode_bits() {
        Some(0) | None => 0o644,
        Some(bits) => bits,
    }
}

fn entry_from_metadata(name: String, meta: &std::fs::Metadata) -> DirEntry {
    DirEntry {
        name,
        size: meta.len(),
        is_dir: meta.is_dir(),
        mode: meta.permissions().mode() & 0o7777,
        modified: meta
            .modified()
            .ok()
            .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
            .map(|d| d.as_secs() as u32),
    }
}

async fn open_blocking(
    path: PathBuf,
    open: impl FnOnce(&Path) -> std::io::Result<std::fs::File> + Send + 'static,
) -> Result<std::fs::File> {
    run_blocking(move || open(&path).map_err(Error::from)).await
}

async fn run_blocking<T: Send + 'static>(
    f: impl FnOnce() -> Result<T> + Send + 'static,
) -> Result<T> {
    task::spawn_blocking(f)
        .await
        .map_err(|e| Error::Backend(format!("blocking task failed: {}", e)))?
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn setstat_mode_defaults_and_clamps() {
        assert_eq!(setstat_mode(&FileAttrs::default()), 0o644);
        assert_eq!(
            setstat_mode(&FileAttrs {
                permissions: Some(0o100000),
                ..Default::default()
            }),
            0o644
        );
        assert_eq!(
            setstat_mode(&FileAttrs {
                permissions: Some(0o100600),
                ..Default::default()
            }),
            0o600
        );
        assert_eq!(
            setstat_mode(&FileAttrs {
                permissions: Some(0o040700),
                ..Default::default()
            }),
            0o755
        );
    }
}
