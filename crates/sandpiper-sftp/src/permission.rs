//! Permission algebra for per-user filesystem access.
//!
//! Permissions are named on the wire (`users.json`, session config) and
//! packed into a bitmask in memory so every check is a single AND. The
//! ordinal of each name is fixed; serialized lists and masks round-trip
//! exactly, modulo unknown names which are dropped.

/// A named filesystem permission with a fixed bit ordinal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum Permission {
    /// List directories and stat entries.
    Read = 0,
    /// Read file contents.
    ReadContent = 1,
    /// Create files, directories and symlinks.
    Create = 2,
    /// Overwrite existing files, rename, chmod.
    Update = 3,
    /// Remove files and directories.
    Delete = 4,
}

impl Permission {
    /// All permissions in ordinal order.
    pub const ALL: [Permission; 5] = [
        Permission::Read,
        Permission::ReadContent,
        Permission::Create,
        Permission::Update,
        Permission::Delete,
    ];

    pub const fn bit(self) -> u32 {
        1 << (self as u32)
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Permission::Read => "read",
            Permission::ReadContent => "read-content",
            Permission::Create => "create",
            Permission::Update => "update",
            Permission::Delete => "delete",
        }
    }

    pub fn from_name(name: &str) -> Option<Permission> {
        Permission::ALL.into_iter().find(|p| p.as_str() == name)
    }
}

/// A set of [`Permission`]s packed into a bitmask.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PermissionSet(u32);

impl PermissionSet {
    /// The empty set.
    pub const fn empty() -> Self {
        PermissionSet(0)
    }

    /// Every permission. This is the server default applied when a user or
    /// filesystem config does not carry its own list.
    pub const fn all() -> Self {
        PermissionSet(
            Permission::Read.bit()
                | Permission::ReadContent.bit()
                | Permission::Create.bit()
                | Permission::Update.bit()
                | Permission::Delete.bit(),
        )
    }

    /// Build a set from permission names. Unknown names are dropped silently.
    pub fn from_names<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut mask = 0;
        for name in names {
            if let Some(p) = Permission::from_name(name.as_ref()) {
                mask |= p.bit();
            }
        }
        PermissionSet(mask)
    }

    /// The member names in stable ordinal order.
    pub fn names(self) -> Vec<&'static str> {
        Permission::ALL
            .into_iter()
            .filter(|p| self.can(*p))
            .map(Permission::as_str)
            .collect()
    }

    pub const fn can(self, permission: Permission) -> bool {
        self.0 & permission.bit() != 0
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub const fn bits(self) -> u32 {
        self.0
    }
}
