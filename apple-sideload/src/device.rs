// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Post-signing deployment.
//!
//! The device transport itself (USB pairing, AFC transfer, debug launch)
//! lives outside this crate. [`DeviceInstaller`] is the seam; the bundled
//! [`CommandInstaller`] drives external libimobiledevice-style tools, and
//! [`export_ipa`] covers the no-device path by archiving the signed bundle.

use {
    crate::{
        bundle,
        error::SideloadError,
        signing::SignedApplication,
    },
    apple_developer_services::Device,
    async_trait::async_trait,
    log::{info, warn},
    std::{
        collections::HashSet,
        path::{Path, PathBuf},
        process::Command,
    },
};

/// Transfers a signed bundle onto a device and launches it.
#[async_trait]
pub trait DeviceInstaller: Send + Sync {
    async fn install_app(
        &self,
        bundle: &Path,
        device: &Device,
        active_profiles: &HashSet<String>,
    ) -> Result<(), SideloadError>;

    async fn launch_app(
        &self,
        bundle_identifier: &str,
        device: &Device,
    ) -> Result<(), SideloadError>;
}

/// Installer that shells out to external device tooling.
///
/// Works with any tool taking `-u <udid> -i <path>` for installs (the
/// libimobiledevice convention). Launching is optional; without a launch
/// command the app is left installed but not started.
pub struct CommandInstaller {
    install_command: PathBuf,
    launch_command: Option<PathBuf>,
}

impl CommandInstaller {
    pub fn new(install_command: PathBuf, launch_command: Option<PathBuf>) -> Self {
        Self {
            install_command,
            launch_command,
        }
    }

    /// Locate conventional tooling on `PATH`.
    pub fn discover() -> Option<Self> {
        let install_command = which::which("ideviceinstaller").ok()?;
        let launch_command = which::which("idevicedebug").ok();

        Some(Self {
            install_command,
            launch_command,
        })
    }
}

#[async_trait]
impl DeviceInstaller for CommandInstaller {
    async fn install_app(
        &self,
        bundle: &Path,
        device: &Device,
        _active_profiles: &HashSet<String>,
    ) -> Result<(), SideloadError> {
        info!("installing {} on {}", bundle.display(), device.name);

        let status = Command::new(&self.install_command)
            .arg("-u")
            .arg(&device.identifier)
            .arg("-i")
            .arg(bundle)
            .status()?;

        if !status.success() {
            return Err(SideloadError::Install(format!(
                "{} exited with {}",
                self.install_command.display(),
                status
            )));
        }

        Ok(())
    }

    async fn launch_app(
        &self,
        bundle_identifier: &str,
        device: &Device,
    ) -> Result<(), SideloadError> {
        let launch_command = match &self.launch_command {
            Some(command) => command,
            None => {
                warn!("no launch tool configured; {} was not started", bundle_identifier);
                return Ok(());
            }
        };

        let status = Command::new(launch_command)
            .arg("-u")
            .arg(&device.identifier)
            .arg("run")
            .arg(bundle_identifier)
            .status()?;

        if !status.success() {
            return Err(SideloadError::Install(format!(
                "{} exited with {}",
                launch_command.display(),
                status
            )));
        }

        Ok(())
    }
}

/// Install a signed application and launch it.
pub async fn deploy(
    installer: &dyn DeviceInstaller,
    signed: &SignedApplication,
    device: &Device,
) -> Result<(), SideloadError> {
    installer
        .install_app(
            signed.application.path(),
            device,
            &signed.active_profiles,
        )
        .await?;

    installer
        .launch_app(&signed.application.bundle_identifier(), device)
        .await
}

/// Archive the signed bundle to an `.ipa` at `output`.
pub fn export_ipa(signed: &SignedApplication, output: &Path) -> Result<PathBuf, SideloadError> {
    bundle::archive_app_bundle(signed.application.path(), output)?;

    info!("exported signed archive to {}", output.display());

    Ok(output.to_path_buf())
}
