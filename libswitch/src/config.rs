//! Switch configuration.
//!
//! Read once at process entry and handed to [`crate::Switch`]; nothing inside
//! the library consults the environment on its own.
//!
//! Environment variables:
//! - `SWITCH_PRODUCTS_ROOT`: directory holding the live product mount targets. Required.
//! - `SWITCH_STORAGE_ROOT`: directory holding version layers. Required.
//! - `SWITCH_PRIVILEGE`: `auto` (default), `sudo` or `native`. `auto` mounts
//!   natively when running as root and through `sudo` otherwise.
//! - `SWITCH_SYNC_PROGRESS`: set to `1` to let rsync print per-file progress.

use std::path::{Path, PathBuf};

use crate::error::{Result, SwitchError};

pub const PRODUCTS_ROOT_ENV: &str = "SWITCH_PRODUCTS_ROOT";
pub const STORAGE_ROOT_ENV: &str = "SWITCH_STORAGE_ROOT";
pub const PRIVILEGE_ENV: &str = "SWITCH_PRIVILEGE";
pub const SYNC_PROGRESS_ENV: &str = "SWITCH_SYNC_PROGRESS";

static PROC_MOUNTS: &str = "/proc/self/mounts";

/// How privileged mount operations are carried out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Privilege {
    /// Shell out to `sudo mount`, `sudo umount` and `sudo rmdir`.
    Sudo,
    /// Call mount(2)/umount(2) directly, the process must already be root.
    Native,
}

impl Privilege {
    /// Parse a `SWITCH_PRIVILEGE` value. `auto` resolves against the current uid.
    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "auto" => Ok(Self::detect()),
            "sudo" => Ok(Self::Sudo),
            "native" => Ok(Self::Native),
            other => Err(SwitchError::Configuration(format!(
                "unknown privilege mode {other:?}, expected auto, sudo or native"
            ))),
        }
    }

    pub fn detect() -> Self {
        if nix::unistd::getuid().is_root() {
            Self::Native
        } else {
            Self::Sudo
        }
    }
}

#[derive(Debug, Clone)]
pub struct SwitchConfig {
    pub products_root: PathBuf,
    pub storage_root: PathBuf,
    pub privilege: Privilege,
    /// Pass `--progress` to rsync.
    pub sync_progress: bool,
    /// Mount table consulted by the live reader.
    pub mount_table: PathBuf,
}

impl SwitchConfig {
    /// Build a configuration from explicit roots, validating that they do not
    /// overlap.
    pub fn new(products_root: impl AsRef<str>, storage_root: impl AsRef<str>) -> Result<Self> {
        let products_root = normalize_root(PRODUCTS_ROOT_ENV, products_root.as_ref())?;
        let storage_root = normalize_root(STORAGE_ROOT_ENV, storage_root.as_ref())?;
        check_roots(&products_root, &storage_root)?;

        Ok(Self {
            products_root,
            storage_root,
            privilege: Privilege::detect(),
            sync_progress: false,
            mount_table: PathBuf::from(PROC_MOUNTS),
        })
    }

    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a configuration from an arbitrary variable lookup. The binary
    /// layers its command-line overrides on top of the environment this way.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let products_root = lookup(PRODUCTS_ROOT_ENV).ok_or_else(|| missing(PRODUCTS_ROOT_ENV))?;
        let storage_root = lookup(STORAGE_ROOT_ENV).ok_or_else(|| missing(STORAGE_ROOT_ENV))?;

        let mut config = Self::new(products_root, storage_root)?;
        if let Some(privilege) = lookup(PRIVILEGE_ENV) {
            config.privilege = Privilege::parse(&privilege)?;
        }
        config.sync_progress = lookup(SYNC_PROGRESS_ENV)
            .map(|v| v == "1")
            .unwrap_or(false);
        Ok(config)
    }

    pub fn privilege(mut self, privilege: Privilege) -> Self {
        self.privilege = privilege;
        self
    }

    pub fn mount_table(mut self, path: impl Into<PathBuf>) -> Self {
        self.mount_table = path.into();
        self
    }
}

/// Return `true` if `sub_path` is `path` or lies beneath it.
///
/// Purely lexical and component-wise: `/x/yz` is not beneath `/x/y`.
pub fn is_sub_path(sub_path: &Path, path: &Path) -> bool {
    sub_path.starts_with(path)
}

fn check_roots(products_root: &Path, storage_root: &Path) -> Result<()> {
    if is_sub_path(products_root, storage_root) || is_sub_path(storage_root, products_root) {
        return Err(SwitchError::Configuration(format!(
            "products root {} collides with storage root {}",
            products_root.display(),
            storage_root.display()
        )));
    }
    Ok(())
}

/// Roots take the form the kernel reports mount points in: absolute, with
/// symlinks resolved. A root that does not exist yet is only made absolute.
fn normalize_root(var: &str, value: &str) -> Result<PathBuf> {
    let trimmed = value.trim_end_matches('/');
    if trimmed.is_empty() {
        return Err(SwitchError::Configuration(format!(
            "{var} must name a directory other than the filesystem root"
        )));
    }
    let path = Path::new(trimmed);
    match path.canonicalize() {
        Ok(resolved) => Ok(resolved),
        Err(_) => std::path::absolute(path).map_err(|e| {
            SwitchError::Configuration(format!("{var} cannot be made absolute: {e}"))
        }),
    }
}

fn missing(var: &str) -> SwitchError {
    SwitchError::Configuration(format!("environment variable {var} not set"))
}
