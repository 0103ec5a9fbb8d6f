//! The pluggable filesystem contract.
//!
//! A backend exposes four operations, mirroring the categories an SFTP
//! request server routes: content reads, content writes, metadata commands
//! and listings. Backends are bound once per session, own their permission
//! mask, and must tolerate concurrent calls from the request pump.

pub mod local;
pub mod notify;
pub mod s3;

use async_trait::async_trait;
use bytes::BytesMut;

use crate::protocol::{codec, FileAttrs, OpenFlags};
use crate::Result;

/// Metadata command vocabulary for [`VirtualFs::file_cmd`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmdMethod {
    Setstat,
    Rename,
    Rmdir,
    Mkdir,
    Symlink,
    Remove,
}

impl CmdMethod {
    pub const fn name(self) -> &'static str {
        match self {
            CmdMethod::Setstat => "Setstat",
            CmdMethod::Rename => "Rename",
            CmdMethod::Rmdir => "Rmdir",
            CmdMethod::Mkdir => "Mkdir",
            CmdMethod::Symlink => "Symlink",
            CmdMethod::Remove => "Remove",
        }
    }
}

/// Listing vocabulary for [`VirtualFs::file_list`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListMethod {
    List,
    Stat,
}

impl ListMethod {
    pub const fn name(self) -> &'static str {
        match self {
            ListMethod::List => "List",
            ListMethod::Stat => "Stat",
        }
    }
}

/// One entry of a listing or stat result.
#[derive(Debug, Clone, Default)]
pub struct DirEntry {
    pub name: String,
    pub size: u64,
    pub is_dir: bool,
    /// Permission bits without the file-type bits.
    pub mode: u32,
    /// Modification time, seconds since the epoch.
    pub modified: Option<u32>,
}

impl DirEntry {
    /// Wire attributes for this entry. The mode word gains the file-type
    /// bits clients use to distinguish directories.
    pub fn attrs(&self) -> FileAttrs {
        let type_bits = if self.is_dir { 0o040000 } else { 0o100000 };
        FileAttrs {
            size: Some(self.size),
            permissions: Some(type_bits | self.mode),
            atime: self.modified,
            mtime: self.modified,
            ..Default::default()
        }
    }

    /// An `ls -l` style line for the NAME reply's longname field.
    pub fn longname(&self) -> String {
        let kind = if self.is_dir { 'd' } else { '-' };
        let mut perms = String::with_capacity(9);
        for shift in [6u32, 3, 0] {
            let bits = (self.mode >> shift) & 0o7;
            perms.push(if bits & 0o4 != 0 { 'r' } else { '-' });
            perms.push(if bits & 0o2 != 0 { 'w' } else { '-' });
            perms.push(if bits & 0o1 != 0 { 'x' } else { '-' });
        }
        format!("{}{} 1 - - {:>12} - {}", kind, perms, self.size, self.name)
    }

    /// Encode this entry into a NAME reply body.
    pub fn encode_to(&self, buf: &mut BytesMut) {
        codec::put_string(buf, &self.name);
        codec::put_string(buf, &self.longname());
        self.attrs().encode_to(buf);
    }
}

/// A handle for positional reads, vended by [`VirtualFs::file_read`].
///
/// Reads are not serialized by the backend; concurrent calls on the same
/// handle are the caller's prerogative.
#[async_trait]
pub trait FileReader: Send + Sync {
    /// Read up to `len` bytes at `offset`. An empty result means end of
    /// file; short reads are allowed.
    async fn read_at(&self, offset: u64, len: u32) -> Result<Vec<u8>>;
}

/// A handle for positional writes, vended by [`VirtualFs::file_write`].
#[async_trait]
pub trait FileWriter: Send + Sync {
    async fn write_at(&self, offset: u64, data: &[u8]) -> Result<()>;

    /// Commit the written data. Called exactly once, when the client closes
    /// the handle; backends that buffer (S3) upload here.
    async fn commit(&self) -> Result<()>;
}

/// The four-operation filesystem contract.
#[async_trait]
pub trait VirtualFs: Send + Sync {
    /// Backend tag as it appears in user configuration: `"os"` or `"s3"`.
    fn fs_type(&self) -> &'static str;

    /// Open `path` for reading. Requires the `read-content` permission.
    async fn file_read(&self, path: &str) -> Result<Box<dyn FileReader>>;

    /// Open `path` for writing. Requires `create` for new files or `update`
    /// for existing ones.
    async fn file_write(&self, path: &str, flags: OpenFlags) -> Result<Box<dyn FileWriter>>;

    /// Execute a metadata command. `target` is set only for two-path
    /// methods (`Rename`, `Symlink`).
    async fn file_cmd(
        &self,
        method: CmdMethod,
        path: &str,
        target: Option<&str>,
        attrs: &FileAttrs,
    ) -> Result<()>;

    /// List a directory or stat a single entry.
    async fn file_list(&self, method: ListMethod, path: &str) -> Result<Vec<DirEntry>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dir_entry_attrs_carry_type_bits() {
        let dir = DirEntry {
            name: "docs".into(),
            is_dir: true,
            mode: 0o755,
            ..Default::default()
        };
        assert_eq!(dir.attrs().permissions, Some(0o040755));

        let file = DirEntry {
            name: "a.txt".into(),
            size: 11,
            mode: 0o644,
            ..Default::default()
        };
        assert_eq!(file.attrs().permissions, Some(0o100644));
        assert_eq!(file.attrs().size, Some(11));
    }

    #[test]
    fn longname_renders_mode_string() {
        let entry = DirEntry {
            name: "a.txt".into(),
            size: 5,
            mode: 0o640,
            ..Default::default()
        };
        assert!(entry.longname().starts_with("-rw-r-----"));
        assert!(entry.longname().ends_with("a.txt"));
    }
}
