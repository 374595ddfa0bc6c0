//! Overlay mounts through mount(2), for invocations that already run as root.

use std::path::Path;

use nix::mount::{MsFlags, mount, umount};

use crate::error::{Result, SwitchError};
use crate::overlay::{OverlayRequest, UnionMountPort};

#[derive(Debug, Clone, Default)]
pub struct NativeMounter;

impl UnionMountPort for NativeMounter {
    fn mount(&self, request: &OverlayRequest) -> Result<()> {
        let options = request.options();
        mount(
            Some("overlay"),
            &request.mount_point,
            Some("overlay"),
            MsFlags::empty(),
            Some(options.as_str()),
        )
        .map_err(|e| SwitchError::ExternalTool {
            command: format!(
                "mount -t overlay overlay -o {options} {}",
                request.mount_point.display()
            ),
            status: e.to_string(),
        })
    }

    fn unmount(&self, mount_point: &Path) -> Result<()> {
        umount(mount_point).map_err(|e| SwitchError::ExternalTool {
            command: format!("umount {}", mount_point.display()),
            status: e.to_string(),
        })
    }

    fn remove_dir(&self, path: &Path) -> Result<()> {
        std::fs::remove_dir(path).map_err(SwitchError::io(path))
    }
}
