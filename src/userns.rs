//! Privilege checks and spawning of the mount helper.
//!
//! Layer blobs in rootless container setups are frequently owned by remapped UIDs and carry
//! restrictive permission bits.  Rather than parsing `/etc/subuid` and setting up a user
//! namespace by hand, the helper is started through `podman unshare` when the current process
//! can't read arbitrary files itself.
//!
//! The helper reports readiness by writing [`READY_LINE`] on its stdout, after its socket is
//! bound and the image index has been built.

use std::ffi::OsStr;
use std::io::{BufRead, BufReader};
use std::path::Path;
use std::process::{Child, ChildStdout, Command, ExitStatus, Stdio};

use anyhow::{bail, Context, Result};
use rustix::process::{getuid, kill_process, Pid, Signal};
use rustix::thread::{capabilities, CapabilitySet};

/// What the helper prints on stdout once it accepts connections.
pub const READY_LINE: &str = "ready";

/// What the current process may do with files it doesn't own.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Privileges {
    pub root: bool,
    /// `CAP_DAC_OVERRIDE` is in the effective set.
    pub dac_override: bool,
}

impl Privileges {
    pub fn current() -> Self {
        Self {
            root: getuid().is_root(),
            dac_override: capabilities(None)
                .is_ok_and(|caps| caps.effective.contains(CapabilitySet::DAC_OVERRIDE)),
        }
    }

    /// Layer blobs are readable whatever their owner and mode bits.
    pub fn reads_any_file(self) -> bool {
        self.root || self.dac_override
    }
}

/// Whether to run the helper inside `podman unshare`.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum Unshare {
    /// Only when the layers may not be readable as we are.
    #[default]
    Auto,
    Always,
    Never,
}

impl Unshare {
    pub fn wanted(self, privileges: Privileges) -> bool {
        match self {
            Unshare::Auto => !privileges.reads_any_file(),
            Unshare::Always => true,
            Unshare::Never => false,
        }
    }
}

/// Builds the command line that starts `binary mount-helper IMAGE SOCKET`.
pub fn helper_command(binary: &Path, image: &str, socket: &Path, unshare: bool) -> Command {
    let mut command = if unshare {
        // podman unshare doesn't pass our environment through, so carry RUST_LOG via env(1)
        let mut command = Command::new("podman");
        command.arg("unshare").arg("env");
        if let Some(filter) = std::env::var_os("RUST_LOG") {
            let mut assignment = OsStr::new("RUST_LOG=").to_os_string();
            assignment.push(filter);
            command.arg(assignment);
        }
        command.arg(binary);
        command
    } else {
        Command::new(binary)
    };

    command
        .arg("mount-helper")
        .arg(image)
        .arg(socket)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit());
    command
}

/// A running helper process, terminated when dropped.
#[derive(Debug)]
pub struct HelperProcess {
    child: Child,
    stdout: Option<BufReader<ChildStdout>>,
}

impl HelperProcess {
    pub fn spawn(mut command: Command) -> Result<Self> {
        log::debug!("spawning helper: {command:?}");
        let mut child = command
            .spawn()
            .with_context(|| format!("Spawning {:?}", command.get_program()))?;
        let stdout = child.stdout.take().map(BufReader::new);
        Ok(Self { child, stdout })
    }

    pub fn id(&self) -> u32 {
        self.child.id()
    }

    /// Blocks until the helper announces readiness.
    ///
    /// Fails if the helper closes stdout or prints anything else first.
    pub fn wait_ready(&mut self) -> Result<()> {
        let Some(stdout) = self.stdout.as_mut() else {
            bail!("Helper stdout is not captured");
        };

        let mut line = String::new();
        let count = stdout
            .read_line(&mut line)
            .context("Reading helper readiness")?;
        if count == 0 {
            bail!("Helper exited before becoming ready");
        }
        if line.trim_end() != READY_LINE {
            bail!("Unexpected output from helper: {:?}", line.trim_end());
        }

        log::debug!("helper {} is ready", self.child.id());
        Ok(())
    }

    /// Sends `SIGTERM` unless the helper already exited, then reaps it.
    pub fn terminate(&mut self) -> Result<ExitStatus> {
        if let Some(status) = self.child.try_wait().context("Polling helper")? {
            return Ok(status);
        }

        let pid = Pid::from_child(&self.child);
        if let Err(errno) = kill_process(pid, Signal::TERM) {
            log::debug!("signalling helper {pid:?}: {errno}");
        }
        let status = self.child.wait().context("Waiting for helper")?;
        log::debug!("helper exited with {status}");
        Ok(status)
    }
}

impl Drop for HelperProcess {
    fn drop(&mut self) {
        if let Err(err) = self.terminate() {
            log::warn!("failed to stop helper: {err:#}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unshare_modes() {
        let unprivileged = Privileges {
            root: false,
            dac_override: false,
        };
        let rootless_with_cap = Privileges {
            root: false,
            dac_override: true,
        };
        let root = Privileges {
            root: true,
            dac_override: false,
        };

        assert!(Unshare::Auto.wanted(unprivileged));
        assert!(!Unshare::Auto.wanted(rootless_with_cap));
        assert!(!Unshare::Auto.wanted(root));

        for privileges in [unprivileged, rootless_with_cap, root] {
            assert!(Unshare::Always.wanted(privileges));
            assert!(!Unshare::Never.wanted(privileges));
        }
    }

    #[test]
    fn test_current_privileges() {
        let privileges = Privileges::current();
        assert_eq!(privileges.root, getuid().is_root());
        if privileges.root {
            assert!(privileges.reads_any_file());
        }
    }

    #[test]
    fn test_helper_command() {
        let command = helper_command(
            Path::new("/usr/bin/skiff"),
            "oci:/images/fedora",
            Path::new("/tmp/x/helper.sock"),
            false,
        );
        assert_eq!(command.get_program(), "/usr/bin/skiff");
        let args: Vec<&OsStr> = command.get_args().collect();
        assert_eq!(
            args,
            ["mount-helper", "oci:/images/fedora", "/tmp/x/helper.sock"]
        );

        let command = helper_command(Path::new("skiff"), "img", Path::new("s"), true);
        assert_eq!(command.get_program(), "podman");
        let args: Vec<&OsStr> = command.get_args().collect();
        assert_eq!(&args[..2], ["unshare", "env"]);
        assert_eq!(&args[args.len() - 4..], ["skiff", "mount-helper", "img", "s"]);
    }

    fn shell(script: &str) -> HelperProcess {
        let mut command = Command::new("sh");
        command.arg("-c").arg(script).stdout(Stdio::piped());
        HelperProcess::spawn(command).unwrap()
    }

    #[test]
    fn test_readiness_handshake() {
        let mut helper = shell("echo ready; exec sleep 60");
        helper.wait_ready().unwrap();
        let status = helper.terminate().unwrap();
        assert!(!status.success());
    }

    #[test]
    fn test_readiness_failures() {
        let mut helper = shell("exit 3");
        assert!(helper.wait_ready().is_err());

        let mut helper = shell("echo 'something else'; exec sleep 60");
        let err = helper.wait_ready().unwrap_err();
        assert!(err.to_string().contains("something else"), "{err}");
    }
}
