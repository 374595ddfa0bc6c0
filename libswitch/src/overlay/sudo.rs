//! Overlay mounts through `sudo`, for unprivileged invocations.

use std::path::Path;
use std::process::Command;

use crate::error::Result;
use crate::overlay::{OverlayRequest, UnionMountPort, run_command};

/// Runs `mount`, `umount` and `rmdir` under `sudo`.
#[derive(Debug, Clone, Default)]
pub struct SudoMounter;

impl UnionMountPort for SudoMounter {
    fn mount(&self, request: &OverlayRequest) -> Result<()> {
        run_command(
            Command::new("sudo")
                .args(["mount", "-t", "overlay", "overlay", "-o"])
                .arg(request.options())
                .arg(&request.mount_point),
        )
    }

    fn unmount(&self, mount_point: &Path) -> Result<()> {
        run_command(Command::new("sudo").arg("umount").arg(mount_point))
    }

    fn remove_dir(&self, path: &Path) -> Result<()> {
        run_command(Command::new("sudo").arg("rmdir").arg(path))
    }
}
