//! Overlay stacks for versions.
//!
//! A version is viewed through an overlay whose lower stack is its own
//! `lower/` followed by the `lower/` of every ancestor, nearest first, with the
//! product's `.empty` directory as the terminal base. The actual mount,
//! unmount and tree copy are delegated to a [`UnionMountPort`] and a
//! [`TreeSyncPort`] so the stack logic never depends on how privileges are
//! obtained.

pub mod native;
pub mod rsync;
pub mod sudo;

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use tracing::{debug, error, info, warn};

use crate::chain::LayerChain;
use crate::error::{Result, SwitchError};
use crate::paths::{Role, StorageLayout};

pub use native::NativeMounter;
pub use rsync::RsyncTreeSync;
pub use sudo::SudoMounter;

/// Which layer of the version receives writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MountMode {
    /// The version's `upper/` on top of the full stack.
    ReadWrite,
    /// No upper layer, the merged view is read-only.
    LowerOnly,
    /// The version's own `lower/` is the writable layer and is left out of the
    /// read-only stack. Used when flattening content into a version.
    WriteLower,
}

/// A fully planned overlay mount.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OverlayRequest {
    /// Read-only layers, topmost first.
    pub lower_dirs: Vec<PathBuf>,
    pub upper_dir: Option<PathBuf>,
    pub work_dir: PathBuf,
    pub mount_point: PathBuf,
}

impl OverlayRequest {
    /// Mount data in the form accepted by `mount -o` and mount(2).
    pub fn options(&self) -> String {
        let lower = self
            .lower_dirs
            .iter()
            .map(|p| p.display().to_string())
            .collect::<Vec<_>>()
            .join(":");
        match &self.upper_dir {
            Some(upper) => format!(
                "lowerdir={lower},upperdir={},workdir={}",
                upper.display(),
                self.work_dir.display()
            ),
            None => format!("lowerdir={lower},workdir={}", self.work_dir.display()),
        }
    }
}

/// Mounts and unmounts overlay filesystems.
pub trait UnionMountPort {
    fn mount(&self, request: &OverlayRequest) -> Result<()>;

    fn unmount(&self, mount_point: &Path) -> Result<()>;

    /// Remove an empty directory the kernel may have created with root-only
    /// permissions inside a work dir.
    fn remove_dir(&self, path: &Path) -> Result<()>;
}

/// Mirrors one directory tree onto another.
pub trait TreeSyncPort {
    /// Make `destination` an exact copy of `source`: recursive, symlinks kept
    /// as links, permissions, ownership, timestamps and xattrs preserved,
    /// extraneous destination entries deleted.
    fn sync(&self, source: &Path, destination: &Path) -> Result<()>;
}

/// A short-lived mount used while flattening a version.
#[derive(Debug, Clone)]
pub struct TransientMount {
    pub mount_point: PathBuf,
    pub work_dir: PathBuf,
    pub version: String,
    pub mode: MountMode,
}

pub struct OverlayController<'a> {
    layout: &'a StorageLayout,
    mounter: &'a dyn UnionMountPort,
    syncer: &'a dyn TreeSyncPort,
}

impl<'a> OverlayController<'a> {
    pub fn new(
        layout: &'a StorageLayout,
        mounter: &'a dyn UnionMountPort,
        syncer: &'a dyn TreeSyncPort,
    ) -> Self {
        Self {
            layout,
            mounter,
            syncer,
        }
    }

    /// Compute the overlay for `version` without mounting anything. Creates the
    /// product's `.empty` base if it is missing.
    pub fn plan(
        &self,
        mount_point: &Path,
        work_dir: &Path,
        product: &str,
        version: &str,
        mode: MountMode,
    ) -> Result<OverlayRequest> {
        let empty_dir = self.layout.empty_dir(product);
        fs::create_dir_all(&empty_dir).map_err(SwitchError::io(&empty_dir))?;

        let mut lower_dirs: Vec<PathBuf> = LayerChain::new(self.layout)
            .ancestry(product, version)?
            .iter()
            .map(|v| self.layout.layer_dir(product, v, Role::Lower))
            .collect();
        lower_dirs.push(empty_dir);

        let upper_dir = match mode {
            MountMode::ReadWrite => Some(self.layout.layer_dir(product, version, Role::Upper)),
            MountMode::LowerOnly => None,
            MountMode::WriteLower => Some(lower_dirs.remove(0)),
        };

        Ok(OverlayRequest {
            lower_dirs,
            upper_dir,
            work_dir: work_dir.to_path_buf(),
            mount_point: mount_point.to_path_buf(),
        })
    }

    pub fn mount(
        &self,
        mount_point: &Path,
        work_dir: &Path,
        product: &str,
        version: &str,
        mode: MountMode,
    ) -> Result<()> {
        let request = self.plan(mount_point, work_dir, product, version, mode)?;
        self.create_work_dir(work_dir)?;
        debug!(options = %request.options(), "mounting overlay");
        if let Err(e) = self.mounter.mount(&request) {
            if let Err(cleanup) = self.remove_work_dir(work_dir) {
                warn!(work_dir = %work_dir.display(), "failed to remove work dir: {cleanup}");
            }
            return Err(e);
        }
        info!(
            mount_point = %mount_point.display(),
            product,
            version,
            ?mode,
            "overlay mounted"
        );
        Ok(())
    }

    pub fn unmount(&self, mount_point: &Path, work_dir: &Path) -> Result<()> {
        self.mounter.unmount(mount_point)?;
        self.remove_work_dir(work_dir)?;
        info!(mount_point = %mount_point.display(), "overlay unmounted");
        Ok(())
    }

    pub fn sync_tree(&self, source: &Path, destination: &Path) -> Result<()> {
        debug!(
            source = %source.display(),
            destination = %destination.display(),
            "synchronizing tree"
        );
        self.syncer.sync(source, destination)
    }

    /// Mount every entry of `mounts` in order, run `f` with their mount
    /// points, then unmount them all in order and remove the mount points.
    ///
    /// Teardown always runs. An error from `f` (or from a failed mount) is
    /// returned in preference to any teardown error.
    pub fn with_transient_mounts<T, F>(
        &self,
        product: &str,
        mounts: &[TransientMount],
        f: F,
    ) -> Result<T>
    where
        F: FnOnce(&[PathBuf]) -> Result<T>,
    {
        let mut mounted: Vec<&TransientMount> = Vec::with_capacity(mounts.len());
        let mut result = Ok(());
        for m in mounts {
            result = fs::create_dir_all(&m.mount_point)
                .map_err(SwitchError::io(&m.mount_point))
                .and_then(|_| self.mount(&m.mount_point, &m.work_dir, product, &m.version, m.mode));
            if result.is_err() {
                break;
            }
            mounted.push(m);
        }

        let result = result.and_then(|_| {
            let points: Vec<PathBuf> = mounts.iter().map(|m| m.mount_point.clone()).collect();
            f(&points)
        });

        let mut teardown = Ok(());
        for m in &mounted {
            if let Err(e) = self.unmount(&m.mount_point, &m.work_dir) {
                error!(mount_point = %m.mount_point.display(), "failed to unmount: {e}");
                if teardown.is_ok() {
                    teardown = Err(e);
                }
            }
        }
        if teardown.is_ok() {
            for m in mounts {
                if m.mount_point.is_dir()
                    && let Err(e) = fs::remove_dir(&m.mount_point)
                {
                    error!(mount_point = %m.mount_point.display(), "failed to remove mount point: {e}");
                    if teardown.is_ok() {
                        teardown = Err(SwitchError::io(&m.mount_point)(e));
                    }
                }
            }
        }

        match result {
            Ok(value) => teardown.map(|_| value),
            Err(e) => Err(e),
        }
    }

    /// Start from an empty work dir, clearing out whatever a previous mount
    /// left behind.
    fn create_work_dir(&self, work_dir: &Path) -> Result<()> {
        if work_dir.is_dir() {
            self.remove_work_dir(work_dir)?;
        }
        fs::create_dir_all(work_dir).map_err(SwitchError::io(work_dir))
    }

    fn remove_work_dir(&self, work_dir: &Path) -> Result<()> {
        for entry in fs::read_dir(work_dir).map_err(SwitchError::io(work_dir))? {
            let path = entry.map_err(SwitchError::io(work_dir))?.path();
            if path.is_dir() {
                self.mounter.remove_dir(&path)?;
            }
        }
        fs::remove_dir(work_dir).map_err(SwitchError::io(work_dir))
    }
}

/// Run an external helper, mapping a spawn failure or non-zero exit to
/// [`SwitchError::ExternalTool`].
pub(crate) fn run_command(cmd: &mut Command) -> Result<()> {
    let program = cmd.get_program().to_string_lossy().into_owned();
    let args = cmd
        .get_args()
        .map(|a| a.to_string_lossy().into_owned())
        .collect::<Vec<_>>();
    let command = std::iter::once(program).chain(args).collect::<Vec<_>>().join(" ");

    debug!(%command, "running external command");
    let status = cmd.status().map_err(|e| SwitchError::ExternalTool {
        command: command.clone(),
        status: e.to_string(),
    })?;
    if !status.success() {
        return Err(SwitchError::ExternalTool {
            command,
            status: status.to_string(),
        });
    }
    Ok(())
}
