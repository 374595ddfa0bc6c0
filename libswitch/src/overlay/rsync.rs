//! Tree synchronization with rsync.

use std::ffi::OsString;
use std::path::Path;
use std::process::Command;

use crate::error::Result;
use crate::overlay::{TreeSyncPort, run_command};

/// `-r -l -p -E -X -o -g -t --delete`: recursive, symlinks as links,
/// permissions, executability, xattrs, owner, group, mtimes, and removal of
/// destination files missing from the source.
const RSYNC_FLAGS: [&str; 9] = ["-r", "-l", "-p", "-E", "-X", "-o", "-g", "-t", "--delete"];

#[derive(Debug, Clone, Default)]
pub struct RsyncTreeSync {
    progress: bool,
}

impl RsyncTreeSync {
    pub fn new(progress: bool) -> Self {
        Self { progress }
    }

    fn command(&self, source: &Path, destination: &Path) -> Command {
        // The trailing slash makes rsync copy the contents of `source` rather
        // than `source` itself.
        let mut source_arg = OsString::from(source.as_os_str());
        source_arg.push("/");

        let mut cmd = Command::new("rsync");
        cmd.args(RSYNC_FLAGS);
        if self.progress {
            cmd.arg("--progress");
        }
        cmd.arg(source_arg).arg(destination);
        cmd
    }
}

impl TreeSyncPort for RsyncTreeSync {
    fn sync(&self, source: &Path, destination: &Path) -> Result<()> {
        run_command(&mut self.command(source, destination))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(cmd: &Command) -> Vec<String> {
        cmd.get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect()
    }

    #[test]
    fn rsync_arguments() {
        let cmd = RsyncTreeSync::new(false)
            .command(Path::new("/s/.src_mount"), Path::new("/s/.dst_mount"));
        assert_eq!(cmd.get_program(), "rsync");
        assert_eq!(
            args(&cmd),
            vec![
                "-r", "-l", "-p", "-E", "-X", "-o", "-g", "-t", "--delete",
                "/s/.src_mount/", "/s/.dst_mount",
            ]
        );

        let cmd = RsyncTreeSync::new(true).command(Path::new("/a"), Path::new("/b"));
        assert!(args(&cmd).contains(&"--progress".to_string()));
    }

    #[test]
    fn missing_binary_is_an_external_tool_error() {
        let err = run_command(&mut Command::new("/nonexistent/rsync-binary")).unwrap_err();
        assert!(matches!(err, crate::error::SwitchError::ExternalTool { .. }));
    }
}
