//! In-process stand-in for the kernel overlay facility and rsync.
//!
//! [`FakeKernel`] implements [`MountTableSource`], [`UnionMountPort`] and
//! [`TreeSyncPort`] at once so that a [`crate::Switch`] can be exercised
//! without privileges. Mounting copies the lower layers (bottom first) and the
//! upper layer into the mount point; unmounting a writable mount leaves in its
//! upper layer only what the merged tree holds beyond the lower stack, the way
//! overlayfs copy-up does. Whiteouts are not modelled, so
//! deletions made through a mount are not recorded as such, and whatever the
//! mount point held before the mount is discarded rather than hidden.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use walkdir::{DirEntry, WalkDir};

use crate::error::{Result, SwitchError};
use crate::mounts::{MountEntry, MountTableSource};
use crate::overlay::{OverlayRequest, TreeSyncPort, UnionMountPort};

#[derive(Debug, Default)]
struct State {
    mounts: Vec<OverlayRequest>,
    extra_entries: Vec<MountEntry>,
    failing_mount_points: HashSet<PathBuf>,
    fail_syncs: bool,
    sync_count: usize,
}

#[derive(Debug, Default)]
pub struct FakeKernel {
    state: Mutex<State>,
}

impl FakeKernel {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        // A panicking test thread must not hide the state from the others.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Overlays currently mounted, in mount order.
    pub fn mounts(&self) -> Vec<OverlayRequest> {
        self.state().mounts.clone()
    }

    /// Report `entry` in the mount table alongside the fake's own mounts.
    pub fn add_entry(&self, entry: MountEntry) {
        self.state().extra_entries.push(entry);
    }

    /// Make every later mount onto `mount_point` fail.
    pub fn fail_mount_at(&self, mount_point: impl Into<PathBuf>) {
        self.state().failing_mount_points.insert(mount_point.into());
    }

    pub fn fail_syncs(&self, fail: bool) {
        self.state().fail_syncs = fail;
    }

    pub fn sync_count(&self) -> usize {
        self.state().sync_count
    }
}

impl MountTableSource for FakeKernel {
    fn entries(&self) -> Result<Vec<MountEntry>> {
        let state = self.state();
        let live = state.mounts.iter().map(|request| MountEntry {
            source: "overlay".to_owned(),
            mount_point: request.mount_point.clone(),
            fs_type: "overlay".to_owned(),
            options: format!("rw,relatime,{}", request.options()),
        });
        Ok(live.chain(state.extra_entries.iter().cloned()).collect())
    }
}

impl UnionMountPort for FakeKernel {
    fn mount(&self, request: &OverlayRequest) -> Result<()> {
        let mut state = self.state();
        let failure = |status: &str| SwitchError::ExternalTool {
            command: format!("mount -t overlay overlay -o {}", request.options()),
            status: status.to_owned(),
        };

        if state.failing_mount_points.contains(&request.mount_point) {
            return Err(failure("injected failure"));
        }
        if state
            .mounts
            .iter()
            .any(|m| m.mount_point == request.mount_point)
        {
            return Err(failure("mount point busy"));
        }
        let layers_exist = request
            .lower_dirs
            .iter()
            .chain(request.upper_dir.iter())
            .chain([&request.work_dir, &request.mount_point])
            .all(|dir| dir.is_dir());
        if !layers_exist {
            return Err(failure("no such directory"));
        }

        clear_dir(&request.mount_point)?;
        for lower in request.lower_dirs.iter().rev() {
            copy_tree(lower, &request.mount_point)?;
        }
        if let Some(upper) = &request.upper_dir {
            copy_tree(upper, &request.mount_point)?;
        }
        // The kernel leaves a root-owned `work` directory behind in the work dir.
        let kernel_work = request.work_dir.join("work");
        fs::create_dir_all(&kernel_work).map_err(SwitchError::io(&kernel_work))?;

        state.mounts.push(request.clone());
        Ok(())
    }

    fn unmount(&self, mount_point: &Path) -> Result<()> {
        let mut state = self.state();
        let index = state
            .mounts
            .iter()
            .position(|m| m.mount_point == mount_point)
            .ok_or_else(|| SwitchError::ExternalTool {
                command: format!("umount {}", mount_point.display()),
                status: "not mounted".to_owned(),
            })?;
        let request = state.mounts.remove(index);

        if let Some(upper) = &request.upper_dir {
            clear_dir(upper)?;
            copy_delta(mount_point, &request.lower_dirs, upper)?;
        }
        clear_dir(mount_point)
    }

    fn remove_dir(&self, path: &Path) -> Result<()> {
        fs::remove_dir(path).map_err(SwitchError::io(path))
    }
}

impl TreeSyncPort for FakeKernel {
    fn sync(&self, source: &Path, destination: &Path) -> Result<()> {
        let mut state = self.state();
        if state.fail_syncs {
            return Err(SwitchError::ExternalTool {
                command: format!("rsync {}/ {}", source.display(), destination.display()),
                status: "exit status: 23".to_owned(),
            });
        }
        state.sync_count += 1;
        clear_dir(destination)?;
        copy_tree(source, destination)
    }
}

/// Remove everything inside `dir`, keeping `dir` itself.
fn clear_dir(dir: &Path) -> Result<()> {
    for entry in fs::read_dir(dir).map_err(SwitchError::io(dir))? {
        let path = entry.map_err(SwitchError::io(dir))?.path();
        let metadata = fs::symlink_metadata(&path).map_err(SwitchError::io(&path))?;
        if metadata.is_dir() {
            fs::remove_dir_all(&path).map_err(SwitchError::io(&path))?;
        } else {
            fs::remove_file(&path).map_err(SwitchError::io(&path))?;
        }
    }
    Ok(())
}

/// Copy the contents of `source` into `destination`, overwriting files that
/// exist in both.
fn copy_tree(source: &Path, destination: &Path) -> Result<()> {
    for entry in WalkDir::new(source).min_depth(1).follow_links(false) {
        let entry = walk_entry(source, entry)?;
        let target = destination.join(relative_path(source, entry.path())?);
        copy_entry(entry.path(), entry.file_type(), &target)?;
    }
    Ok(())
}

/// Copy into `upper` the entries of `merged` that the `lowers` stack (topmost
/// first) does not already provide with the same contents.
fn copy_delta(merged: &Path, lowers: &[PathBuf], upper: &Path) -> Result<()> {
    for entry in WalkDir::new(merged).min_depth(1).follow_links(false) {
        let entry = walk_entry(merged, entry)?;
        let relative = relative_path(merged, entry.path())?;
        let below = lowers
            .iter()
            .map(|lower| lower.join(relative))
            .find(|path| fs::symlink_metadata(path).is_ok());
        if let Some(below) = below
            && same_entry(entry.path(), entry.file_type(), &below)?
        {
            continue;
        }

        let target = upper.join(relative);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).map_err(SwitchError::io(parent))?;
        }
        copy_entry(entry.path(), entry.file_type(), &target)?;
    }
    Ok(())
}

fn same_entry(path: &Path, file_type: fs::FileType, other: &Path) -> Result<bool> {
    let other_type = fs::symlink_metadata(other)
        .map_err(SwitchError::io(other))?
        .file_type();
    if file_type.is_dir() {
        Ok(other_type.is_dir())
    } else if file_type.is_symlink() {
        Ok(other_type.is_symlink()
            && fs::read_link(path).map_err(SwitchError::io(path))?
                == fs::read_link(other).map_err(SwitchError::io(other))?)
    } else {
        Ok(other_type.is_file()
            && fs::read(path).map_err(SwitchError::io(path))?
                == fs::read(other).map_err(SwitchError::io(other))?)
    }
}

fn copy_entry(source: &Path, file_type: fs::FileType, target: &Path) -> Result<()> {
    if file_type.is_dir() {
        fs::create_dir_all(target).map_err(SwitchError::io(target))
    } else if file_type.is_symlink() {
        let link = fs::read_link(source).map_err(SwitchError::io(source))?;
        if fs::symlink_metadata(target).is_ok() {
            fs::remove_file(target).map_err(SwitchError::io(target))?;
        }
        std::os::unix::fs::symlink(&link, target).map_err(SwitchError::io(target))
    } else {
        fs::copy(source, target)
            .map(|_| ())
            .map_err(SwitchError::io(target))
    }
}

fn walk_entry(root: &Path, entry: walkdir::Result<DirEntry>) -> Result<DirEntry> {
    entry.map_err(|e| SwitchError::Io {
        path: root.to_path_buf(),
        error: e.into(),
    })
}

fn relative_path<'p>(root: &Path, path: &'p Path) -> Result<&'p Path> {
    path.strip_prefix(root)
        .map_err(|_| SwitchError::MalformedPath(path.display().to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mount_merges_layers_and_unmount_writes_back() {
        let tmp = tempfile::tempdir().unwrap();
        let [bottom, top, upper, work, mnt] =
            ["bottom", "top", "upper", "work", "mnt"].map(|n| tmp.path().join(n));
        for dir in [&bottom, &top, &upper, &work, &mnt] {
            fs::create_dir_all(dir).unwrap();
        }
        fs::write(bottom.join("a"), "bottom").unwrap();
        fs::write(bottom.join("b"), "bottom").unwrap();
        fs::write(top.join("a"), "top").unwrap();

        let kernel = FakeKernel::new();
        let request = OverlayRequest {
            lower_dirs: vec![top.clone(), bottom.clone()],
            upper_dir: Some(upper.clone()),
            work_dir: work.clone(),
            mount_point: mnt.clone(),
        };
        kernel.mount(&request).unwrap();
        assert_eq!(fs::read_to_string(mnt.join("a")).unwrap(), "top");
        assert_eq!(fs::read_to_string(mnt.join("b")).unwrap(), "bottom");
        assert!(kernel.mount(&request).is_err());

        fs::write(mnt.join("c"), "written").unwrap();
        fs::write(mnt.join("b"), "changed").unwrap();
        kernel.unmount(&mnt).unwrap();
        assert_eq!(fs::read_to_string(upper.join("c")).unwrap(), "written");
        assert_eq!(fs::read_to_string(upper.join("b")).unwrap(), "changed");
        // Untouched lower content is not copied up.
        assert!(!upper.join("a").exists());
        assert_eq!(fs::read_dir(&mnt).unwrap().count(), 0);
        assert!(kernel.unmount(&mnt).is_err());
    }

    #[test]
    fn entries_reflect_mounts() {
        let tmp = tempfile::tempdir().unwrap();
        let [lower, work, mnt] = ["lower", "work", "mnt"].map(|n| tmp.path().join(n));
        for dir in [&lower, &work, &mnt] {
            fs::create_dir_all(dir).unwrap();
        }
        let kernel = FakeKernel::new();
        kernel
            .mount(&OverlayRequest {
                lower_dirs: vec![lower],
                upper_dir: None,
                work_dir: work,
                mount_point: mnt.clone(),
            })
            .unwrap();

        let entries = kernel.entries().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].mount_point, mnt);
        assert!(entries[0].options.starts_with("rw,relatime,lowerdir="));
    }

    #[test]
    fn sync_mirrors_and_can_fail() {
        let tmp = tempfile::tempdir().unwrap();
        let [src, dst] = ["src", "dst"].map(|n| tmp.path().join(n));
        fs::create_dir_all(src.join("dir")).unwrap();
        fs::create_dir_all(&dst).unwrap();
        fs::write(src.join("dir/file"), "data").unwrap();
        fs::write(dst.join("stale"), "old").unwrap();

        let kernel = FakeKernel::new();
        kernel.sync(&src, &dst).unwrap();
        assert_eq!(fs::read_to_string(dst.join("dir/file")).unwrap(), "data");
        assert!(!dst.join("stale").exists());
        assert_eq!(kernel.sync_count(), 1);

        kernel.fail_syncs(true);
        assert!(matches!(
            kernel.sync(&src, &dst),
            Err(SwitchError::ExternalTool { .. })
        ));
    }
}
