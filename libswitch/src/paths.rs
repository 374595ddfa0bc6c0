//! Storage layout.
//!
//! ```text
//! <storage_root>/
//!   <product>/
//!     .empty/          # always-empty terminal lower layer
//!     .work/           # work dir of the live selection mount
//!     .lock            # advisory lock held by mutating operations
//!     <version>/
//!       lower/         # content contributed by this version
//!       upper/         # writes accumulated while selected
//!       parent         # optional, name of the parent version
//! ```

use std::fmt;
use std::path::{Component, Path, PathBuf};

use crate::error::{Result, SwitchError};

pub const LOWER_DIR: &str = "lower";
pub const UPPER_DIR: &str = "upper";
pub const PARENT_FILE: &str = "parent";
pub const EMPTY_DIR: &str = ".empty";
pub const LIVE_WORK_DIR: &str = ".work";
pub const LOCK_FILE: &str = ".lock";

// Scratch directories created inside a version directory while it is being
// flattened.
pub const SRC_MOUNT_DIR: &str = ".src_mount";
pub const SRC_WORK_DIR: &str = ".src_work";
pub const DST_MOUNT_DIR: &str = ".dst_mount";
pub const DST_WORK_DIR: &str = ".dst_work";
pub const NEW_LOWER_DIR: &str = ".new_lower";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Lower,
    Upper,
}

impl Role {
    pub fn dir_name(self) -> &'static str {
        match self {
            Role::Lower => LOWER_DIR,
            Role::Upper => UPPER_DIR,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.dir_name())
    }
}

/// A layer directory decomposed back into its owner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayerPath {
    pub product: String,
    pub version: String,
    pub role: Role,
}

/// Maps products and versions to their locations under the storage root.
#[derive(Debug, Clone)]
pub struct StorageLayout {
    root: PathBuf,
}

impl StorageLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn product_dir(&self, product: &str) -> PathBuf {
        self.root.join(product)
    }

    pub fn version_dir(&self, product: &str, version: &str) -> PathBuf {
        self.product_dir(product).join(version)
    }

    pub fn layer_dir(&self, product: &str, version: &str, role: Role) -> PathBuf {
        self.version_dir(product, version).join(role.dir_name())
    }

    pub fn parent_file(&self, product: &str, version: &str) -> PathBuf {
        self.version_dir(product, version).join(PARENT_FILE)
    }

    pub fn empty_dir(&self, product: &str) -> PathBuf {
        self.product_dir(product).join(EMPTY_DIR)
    }

    pub fn live_work_dir(&self, product: &str) -> PathBuf {
        self.product_dir(product).join(LIVE_WORK_DIR)
    }

    pub fn lock_file(&self, product: &str) -> PathBuf {
        self.product_dir(product).join(LOCK_FILE)
    }

    /// Scratch directory `name` inside a version directory.
    pub fn scratch_dir(&self, product: &str, version: &str, name: &str) -> PathBuf {
        self.version_dir(product, version).join(name)
    }

    /// Decompose `<root>/<product>/<version>/{lower,upper}`.
    pub fn parse_layer_path(&self, path: &Path) -> Result<LayerPath> {
        let malformed = || SwitchError::MalformedPath(path.display().to_string());

        let rest = path.strip_prefix(&self.root).map_err(|_| malformed())?;
        let names = rest
            .components()
            .map(|c| match c {
                Component::Normal(name) => name.to_str().ok_or_else(malformed),
                _ => Err(malformed()),
            })
            .collect::<Result<Vec<_>>>()?;

        let [product, version, role] = names.as_slice() else {
            return Err(malformed());
        };
        let role = match *role {
            LOWER_DIR => Role::Lower,
            UPPER_DIR => Role::Upper,
            _ => return Err(malformed()),
        };

        Ok(LayerPath {
            product: product.to_string(),
            version: version.to_string(),
            role,
        })
    }
}

/// Reject names that cannot be used as a single, non-reserved path component.
pub fn validate_name(kind: &'static str, name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && !name.starts_with('.')
        && !name.contains('/')
        && !name.contains('\0');
    if valid {
        Ok(())
    } else {
        Err(SwitchError::InvalidName {
            kind,
            name: name.to_owned(),
        })
    }
}
