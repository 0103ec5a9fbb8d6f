//! Request path validation.
//!
//! Every client-supplied path is resolved lexically against the session's
//! data root before any filesystem call. Resolution never touches the disk:
//! `.` and `..` components are folded purely textually and the result must
//! still live under the data root. A path that escapes is answered with the
//! same error as a missing file so probing clients learn nothing.

use std::path::{Component, Path, PathBuf};

use tracing::warn;

use crate::{Error, Result};

/// Resolves client paths to on-disk paths. Injectable so tests can stub the
/// containment policy.
pub trait PathResolver: Send + Sync {
    fn resolve(&self, request_path: &str) -> Result<PathBuf>;
}

/// The standard resolver: roots every request under `<base>/data`.
pub struct DataDirResolver {
    data_root: PathBuf,
}

impl DataDirResolver {
    pub fn new(base_path: impl AsRef<Path>) -> Self {
        Self {
            data_root: lexical_clean(&base_path.as_ref().join("data")),
        }
    }

    /// The cleaned `<base>/data` directory all requests must stay inside.
    pub fn data_root(&self) -> &Path {
        &self.data_root
    }
}

impl PathResolver for DataDirResolver {
    fn resolve(&self, request_path: &str) -> Result<PathBuf> {
        let joined = self.data_root.join(request_path.trim_start_matches('/'));
        let cleaned = lexical_clean(&joined);

        if cleaned.starts_with(&self.data_root) {
            Ok(cleaned)
        } else {
            warn!(path = request_path, "request path escapes the data root");
            Err(Error::NoSuchFile)
        }
    }
}

/// Fold `.` and `..` components without consulting the filesystem.
///
/// Leading `..` components of a relative path are preserved, which is what
/// makes the containment check above catch escapes: an escaping path either
/// pops out of the root prefix or keeps a literal `..` in front, and both
/// fail the `starts_with` test.
pub fn lexical_clean(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Prefix(p) => out.push(p.as_os_str()),
            Component::RootDir => out.push(Component::RootDir.as_os_str()),
            Component::CurDir => {}
            Component::ParentDir => {
                let last_is_normal =
                    matches!(out.components().next_back(), Some(Component::Normal(_)));
                let last_is_root = matches!(
                    out.components().next_back(),
                    Some(Component::RootDir | Component::Prefix(_))
                );
                if last_is_normal {
                    out.pop();
                } else if !last_is_root {
                    // A parent component at the front of a relative path is
                    // kept so the containment check can still reject it.
                    out.push(Component::ParentDir.as_os_str());
                }
            }
            Component::Normal(c) => out.push(c),
        }
    }
    if out.as_os_str().is_empty() {
        out.push(".");
    }
    out
}

/// Clean a client path within the virtual namespace, for REALPATH replies.
/// The result is always absolute and never contains `.` or `..`.
pub fn virtual_clean(path: &str) -> String {
    let mut parts: Vec<&str> = Vec::new();
    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            other => parts.push(other),
        }
    }
    if parts.is_empty() {
        "/".to_string()
    } else {
        format!("/{}", parts.join("/"))
    }
}
