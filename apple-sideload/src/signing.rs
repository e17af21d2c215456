// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The signing pipeline.
//!
//! Two entry points cover the two provisioning paths: [`Sideloader::sign_with_account`]
//! drives the full developer-services pipeline (anisette, authentication,
//! team, device registration, certificate, per-bundle provisioning), while
//! [`Sideloader::sign_with_certificate`] signs with a local `.p12` and
//! `.mobileprovision` pair without any network traffic. Both paths end in
//! the injected [`CodeSigner`] and report failures wrapped with user-facing
//! context.

use {
    crate::{
        anisette::AnisetteProvider,
        bundle::{self, Application},
        certificates::CertificateCache,
        error::{SideloadError, SignFailure},
        provisioning::{BundleIdPolicy, ProvisioningResolver},
    },
    apple_developer_services::{
        Certificate, DeveloperApiClient, DeveloperSession, Device, ProvisioningProfile, Team,
        TeamKind, TwoFactorHandler,
    },
    async_trait::async_trait,
    log::{debug, info},
    std::{
        collections::{HashMap, HashSet},
        path::{Path, PathBuf},
        sync::Arc,
    },
    uuid::Uuid,
};

const FAILURE_SIGN_IN: &str = "Could not sign in with the given Apple ID.";
const FAILURE_REGISTER_DEVICE: &str =
    "Your device could not be registered with your development team.";
const FAILURE_CERTIFICATE: &str = "A valid signing certificate could not be created.";
const FAILURE_PROFILES: &str = "New provisioning profiles could not be fetched.";

/// Produces a signed bundle in place, given signing inputs.
#[async_trait]
pub trait CodeSigner: Send + Sync {
    async fn sign(
        &self,
        bundle: &Path,
        certificate: &Certificate,
        profiles: &[ProvisioningProfile],
        entitlements: &HashMap<String, String>,
    ) -> Result<(), SideloadError>;
}

/// Signer that delegates to an external signing tool.
///
/// The tool is invoked as
/// `<command> <bundle> --certificate <p12> --password <pw> --profile <path>...`
/// with one `--profile` per resolved profile and `--entitlement key=value`
/// pairs for overrides; zsign-style signers adapt to this shape with a
/// small wrapper script. Signing inputs are staged in a temporary
/// directory that lives only for the invocation.
pub struct CommandSigner {
    command: PathBuf,
}

impl CommandSigner {
    pub fn new(command: PathBuf) -> Self {
        Self { command }
    }
}

#[async_trait]
impl CodeSigner for CommandSigner {
    async fn sign(
        &self,
        bundle: &Path,
        certificate: &Certificate,
        profiles: &[ProvisioningProfile],
        entitlements: &HashMap<String, String>,
    ) -> Result<(), SideloadError> {
        let staging = tempfile::tempdir()?;

        let password = certificate.machine_identifier.clone().unwrap_or_default();
        let p12_path = staging.path().join("signer.p12");
        std::fs::write(
            &p12_path,
            certificate
                .encrypted_p12(&password)
                .map_err(|e| SideloadError::Signer(e.to_string()))?,
        )?;

        let mut command = std::process::Command::new(&self.command);
        command
            .arg(bundle)
            .arg("--certificate")
            .arg(&p12_path)
            .arg("--password")
            .arg(&password);

        for (index, profile) in profiles.iter().enumerate() {
            let profile_path = staging
                .path()
                .join(format!("profile-{}.mobileprovision", index));
            std::fs::write(&profile_path, &profile.data)?;
            command.arg("--profile").arg(profile_path);
        }

        for (key, value) in entitlements {
            command.arg("--entitlement").arg(format!("{}={}", key, value));
        }

        let status = command.status()?;

        if !status.success() {
            return Err(SideloadError::Signer(format!(
                "{} exited with {}",
                self.command.display(),
                status
            )));
        }

        Ok(())
    }
}

/// An Apple ID and password pair.
pub struct AccountCredentials {
    pub apple_id: String,
    pub password: String,
}

/// Outcome of a successful signing run.
#[derive(Debug)]
pub struct SignedApplication {
    /// The signed bundle, reparsed from disk.
    pub application: Application,

    /// Bundle identifiers actively provisioned during this run.
    pub active_profiles: HashSet<String>,
}

/// Orchestrates the re-signing pipeline.
pub struct Sideloader {
    api: Arc<dyn DeveloperApiClient>,
    anisette: Arc<dyn AnisetteProvider>,
    signer: Arc<dyn CodeSigner>,
    two_factor: Arc<dyn TwoFactorHandler>,
    certificates: CertificateCache,
    scratch_root: PathBuf,
}

impl Sideloader {
    pub fn new(
        api: Arc<dyn DeveloperApiClient>,
        anisette: Arc<dyn AnisetteProvider>,
        signer: Arc<dyn CodeSigner>,
        two_factor: Arc<dyn TwoFactorHandler>,
        certificates: CertificateCache,
    ) -> Self {
        Self {
            api,
            anisette,
            signer,
            two_factor,
            certificates,
            scratch_root: std::env::temp_dir(),
        }
    }

    /// Override where scratch directories are created.
    pub fn with_scratch_root(mut self, scratch_root: PathBuf) -> Self {
        self.scratch_root = scratch_root;
        self
    }

    /// Sign `ipa` for `device` using an Apple ID.
    ///
    /// Steps run strictly in order; the first failure aborts the run,
    /// wrapped with a title naming the app and device plus a reason for the
    /// stage that failed.
    pub async fn sign_with_account(
        &self,
        ipa: &Path,
        device: &Device,
        credentials: &AccountCredentials,
        policy: &BundleIdPolicy,
        entitlements: &HashMap<String, String>,
    ) -> Result<SignedApplication, SignFailure> {
        let mut app_name = file_stem(ipa);

        let wrap = |app_name: &str, failure: Option<&str>, source: SideloadError| {
            SignFailure::new(
                format!("{} could not sign {}.", app_name, device.name),
                failure.map(String::from),
                source,
            )
        };

        info!("preparing signing environment for {}", credentials.apple_id);

        let anisette = self
            .anisette
            .fetch_anisette_data()
            .await
            .map_err(|e| wrap(&app_name, None, e))?;

        let (_account, session) = self
            .api
            .authenticate(
                &credentials.apple_id,
                &credentials.password,
                &anisette,
                self.two_factor.as_ref(),
            )
            .await
            .map_err(|e| wrap(&app_name, Some(FAILURE_SIGN_IN), e.into()))?;

        let team = select_team(
            self.api
                .fetch_teams(&session)
                .await
                .map_err(|e| wrap(&app_name, None, e.into()))?,
        )
        .map_err(|e| wrap(&app_name, None, e))?;

        let device_record = self
            .register_device(device, &team, &session)
            .await
            .map_err(|e| wrap(&app_name, Some(FAILURE_REGISTER_DEVICE), e))?;

        let certificate = self
            .certificates
            .resolve(self.api.as_ref(), &team, &session)
            .await
            .map_err(|e| wrap(&app_name, Some(FAILURE_CERTIFICATE), e))?;

        let application = self
            .unpack(ipa)
            .map_err(|e| wrap(&app_name, None, e))?;
        app_name = application.name();

        // Refresh anisette data to keep the session alive through the
        // remaining (potentially slow) provisioning calls.
        let fresh = self
            .anisette
            .fetch_anisette_data()
            .await
            .map_err(|e| wrap(&app_name, None, e))?;
        session.refresh_anisette(fresh);

        let session = Arc::new(session);
        let resolver = ProvisioningResolver::new(self.api.clone());

        let profiles = resolver
            .resolve_all(&application, &device_record, &team, session, policy)
            .await
            .map_err(|e| wrap(&app_name, Some(FAILURE_PROFILES), e))?;

        let signed = self
            .sign_application(&application, &certificate, &profiles, entitlements)
            .await
            .map_err(|e| wrap(&app_name, None, e))?;

        info!("{} signed successfully", app_name);

        Ok(signed)
    }

    /// Sign `ipa` with a local certificate and provisioning profile.
    ///
    /// No developer services calls are made; the profile's own embedded
    /// bundle identifier drives the rewrite.
    pub async fn sign_with_certificate(
        &self,
        ipa: &Path,
        certificate_path: &Path,
        certificate_password: Option<&str>,
        profile_path: &Path,
        entitlements: &HashMap<String, String>,
    ) -> Result<SignedApplication, SignFailure> {
        let mut app_name = file_stem(ipa);

        let wrap = |app_name: &str, source: SideloadError| {
            SignFailure::new(
                format!("{} could not be signed.", app_name),
                None,
                source,
            )
        };

        let application = self
            .unpack(ipa)
            .map_err(|e| wrap(&app_name, e))?;
        app_name = application.name();

        if !certificate_path.is_file() {
            return Err(wrap(&app_name, SideloadError::MissingCertificate));
        }

        let password = certificate_password.unwrap_or("");

        let data = std::fs::read(certificate_path).map_err(|e| wrap(&app_name, e.into()))?;
        let mut certificate = Certificate::from_p12(&data, password)
            .map_err(|e| wrap(&app_name, e.into()))?;

        // Keep the password around as the machine identifier so the pair
        // can be re-encrypted if it needs embedding later.
        certificate.machine_identifier = Some(password.to_string());

        let profile = ProvisioningProfile::from_file(profile_path)
            .map_err(|e| wrap(&app_name, e.into()))?;

        let mut profiles = HashMap::new();
        profiles.insert(application.bundle_identifier(), profile);

        self.sign_application(&application, &certificate, &profiles, entitlements)
            .await
            .map_err(|e| wrap(&app_name, e))
    }

    fn unpack(&self, ipa: &Path) -> Result<Application, SideloadError> {
        let scratch = self.scratch_root.join(Uuid::new_v4().to_string());
        std::fs::create_dir_all(&scratch)?;

        debug!("unpacking {} into {}", ipa.display(), scratch.display());

        bundle::unzip_app_bundle(ipa, &scratch)
    }

    /// Reuse the team's registration for this device, or register it.
    async fn register_device(
        &self,
        device: &Device,
        team: &Team,
        session: &DeveloperSession,
    ) -> Result<Device, SideloadError> {
        let devices = self
            .api
            .fetch_devices(team, device.platform, session)
            .await?;

        let mut record = match devices
            .into_iter()
            .find(|candidate| candidate.identifier == device.identifier)
        {
            Some(record) => record,
            None => {
                self.api
                    .register_device(
                        &device.name,
                        &device.identifier,
                        device.platform,
                        team,
                        session,
                    )
                    .await?
            }
        };

        // The registry does not track OS versions; carry over what the
        // local transport observed.
        record.os_version = device.os_version.clone();

        Ok(record)
    }

    /// Rewrite bundle metadata and hand everything to the signer.
    async fn sign_application(
        &self,
        application: &Application,
        certificate: &Certificate,
        profiles: &HashMap<String, ProvisioningProfile>,
        entitlements: &HashMap<String, String>,
    ) -> Result<SignedApplication, SideloadError> {
        let main_profile = profiles
            .get(&application.bundle_identifier())
            .ok_or_else(|| {
                SideloadError::MissingProvisioningProfile(application.bundle_identifier())
            })?;

        application.prepare_for_signing(main_profile)?;

        for extension in application.app_extensions()? {
            let profile = profiles.get(&extension.bundle_identifier()).ok_or_else(|| {
                SideloadError::MissingProvisioningProfile(extension.bundle_identifier())
            })?;

            extension.prepare_for_signing(profile)?;
        }

        let profile_list: Vec<ProvisioningProfile> = profiles.values().cloned().collect();

        info!("signing {}", application.path().display());

        self.signer
            .sign(application.path(), certificate, &profile_list, entitlements)
            .await?;

        let active_profiles = profile_list
            .iter()
            .map(|profile| profile.bundle_identifier.clone())
            .collect();

        // Reparse so callers observe the rewritten bundle.
        let application = Application::new(application.path().to_path_buf())?;

        Ok(SignedApplication {
            application,
            active_profiles,
        })
    }
}

/// Pick the team to provision under.
///
/// Individual memberships win over free ones, which win over whatever
/// happens to be listed first.
fn select_team(teams: Vec<Team>) -> Result<Team, SideloadError> {
    let individual = teams
        .iter()
        .find(|team| team.kind == TeamKind::Individual)
        .cloned();
    let free = teams.iter().find(|team| team.kind == TeamKind::Free).cloned();

    individual
        .or(free)
        .or_else(|| teams.into_iter().next())
        .ok_or(SideloadError::NoTeam)
}

fn file_stem(path: &Path) -> String {
    path.file_stem()
        .map(|stem| stem.to_string_lossy().to_string())
        .unwrap_or_else(|| "App".to_string())
}
