//! Orchestration of `skiff mount`.
//!
//! ```text
//! Unmounted -> HelperStarting -> IndexRequested -> Serving -> Unmounting -> Unmounted
//!                    |                 |                          ^
//!                    +-----------------+----- (failure) ----------+
//! ```
//!
//! Whatever happens after the helper was spawned, [`Mount::unmount()`] ends the session,
//! terminates the helper and removes the private socket directory.

use std::path::PathBuf;

use anyhow::{Context, Result};
use tempfile::TempDir;

use crate::client::HelperClient;
use crate::fuse::{self, SkiffFs};
use crate::index::MergedIndex;
use crate::tree::Tree;
use crate::userns::{helper_command, HelperProcess, Privileges, Unshare};

const SOCKET_NAME: &str = "helper.sock";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MountState {
    Unmounted,
    HelperStarting,
    IndexRequested,
    Serving,
    Unmounting,
}

impl MountState {
    pub fn can_become(self, next: MountState) -> bool {
        use MountState::*;
        matches!(
            (self, next),
            (Unmounted, HelperStarting)
                | (HelperStarting, IndexRequested)
                | (IndexRequested, Serving)
                | (HelperStarting | IndexRequested | Serving, Unmounting)
                | (Unmounting, Unmounted)
        )
    }
}

#[derive(Debug, thiserror::Error)]
#[error("cannot go from {from:?} to {to:?}")]
pub struct TransitionError {
    pub from: MountState,
    pub to: MountState,
}

#[derive(Debug, Clone)]
pub struct MountConfig {
    pub image: String,
    pub mountpoint: PathBuf,
    pub allow_other: bool,
    pub unshare: Unshare,
    /// The `skiff` binary to run as `mount-helper`.
    pub helper_binary: PathBuf,
}

/// One mount's lifecycle.
#[derive(Debug)]
pub struct Mount {
    config: MountConfig,
    state: MountState,
    socket_dir: Option<TempDir>,
    helper: Option<HelperProcess>,
}

impl Mount {
    pub fn new(config: MountConfig) -> Self {
        Self {
            config,
            state: MountState::Unmounted,
            socket_dir: None,
            helper: None,
        }
    }

    pub fn state(&self) -> MountState {
        self.state
    }

    fn transition(&mut self, to: MountState) -> Result<(), TransitionError> {
        if !self.state.can_become(to) {
            return Err(TransitionError {
                from: self.state,
                to,
            });
        }
        log::debug!("mount state {:?} -> {to:?}", self.state);
        self.state = to;
        Ok(())
    }

    fn socket_path(&self) -> Option<PathBuf> {
        Some(self.socket_dir.as_ref()?.path().join(SOCKET_NAME))
    }

    /// Spawns the helper and waits for its readiness line.
    pub fn start_helper(&mut self) -> Result<()> {
        self.transition(MountState::HelperStarting)?;

        let socket_dir = tempfile::Builder::new()
            .prefix("skiff-")
            .tempdir()
            .context("Creating socket directory")?;
        let socket = socket_dir.path().join(SOCKET_NAME);
        self.socket_dir = Some(socket_dir);

        let binary = std::fs::canonicalize(&self.config.helper_binary).with_context(|| {
            format!("Locating helper {}", self.config.helper_binary.display())
        })?;
        let unshare = self.config.unshare.wanted(Privileges::current());
        log::info!(
            "starting helper for {}{}",
            self.config.image,
            if unshare { " via podman unshare" } else { "" }
        );

        let command = helper_command(&binary, &self.config.image, &socket, unshare);
        let helper = self.helper.insert(HelperProcess::spawn(command)?);
        helper.wait_ready().context("Starting mount helper")
    }

    /// Opens the session and fetches the merged index.
    pub fn request_index(&mut self) -> Result<(HelperClient, MergedIndex)> {
        self.transition(MountState::IndexRequested)?;

        let socket = self.socket_path().context("Helper socket is gone")?;
        let client = HelperClient::connect(&socket)
            .with_context(|| format!("Connecting to {}", socket.display()))?;
        let index = client.fetch_index().context("Fetching image index")?;
        log::info!("image has {} entries", index.len());
        Ok((client, index))
    }

    /// Mounts the image and blocks until it is unmounted.
    pub fn serve(&mut self, client: &HelperClient, index: &MergedIndex) -> Result<()> {
        self.transition(MountState::Serving)?;

        let tree = Tree::build(index, client);
        let options = fuse::mount_options(&self.config.image, self.config.allow_other);
        log::info!("mounting at {}", self.config.mountpoint.display());
        fuse::serve(SkiffFs::new(tree), &self.config.mountpoint, &options).with_context(|| {
            format!("Serving FUSE mount at {}", self.config.mountpoint.display())
        })
    }

    /// Tears everything down.  Does nothing if the helper was never started.
    pub fn unmount(&mut self, client: Option<&HelperClient>) -> Result<()> {
        if self.state == MountState::Unmounted {
            return Ok(());
        }
        self.transition(MountState::Unmounting)?;

        if let Some(client) = client {
            if let Err(err) = client.end_session() {
                log::debug!("ending session: {err}");
            }
        }
        if let Some(mut helper) = self.helper.take() {
            helper.terminate()?;
        }
        if let Some(socket_dir) = self.socket_dir.take() {
            socket_dir.close().context("Removing socket directory")?;
        }

        self.transition(MountState::Unmounted)?;
        Ok(())
    }
}

fn start_and_serve(mount: &mut Mount, session: &mut Option<HelperClient>) -> Result<()> {
    mount.start_helper()?;
    let (client, index) = mount.request_index()?;
    let client = session.insert(client);
    mount.serve(client, &index)
}

/// Runs a whole mount from helper start to teardown.
pub fn run(config: MountConfig) -> Result<()> {
    let mut mount = Mount::new(config);
    let mut session = None;

    let served = start_and_serve(&mut mount, &mut session);
    let teardown = mount.unmount(session.as_ref());
    served?;
    teardown
}
