// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Signing certificate resolution and at-rest caching.
//!
//! Apple caps the number of live development certificates per account, so
//! re-signing must not mint a fresh certificate on every run. The cache
//! keeps one encrypted `.p12` per team under the tool's support directory,
//! encrypted with the certificate's own machine identifier. A run either
//! reuses the cached pair wholesale or revokes the stale server-side record
//! and creates a new one — never a mix.

use {
    crate::error::SideloadError,
    apple_developer_services::{Certificate, DeveloperApiClient, DeveloperSession, Team},
    log::{debug, warn},
    std::path::PathBuf,
};

/// Local store of encrypted signing certificates, keyed by team.
pub struct CertificateCache {
    directory: PathBuf,
}

impl CertificateCache {
    pub fn new(directory: PathBuf) -> Self {
        Self { directory }
    }

    /// The per-user default cache location.
    pub fn default_directory() -> Option<PathBuf> {
        dirs::data_dir().map(|dir| dir.join(crate::TOOL_NAME).join("Certificates"))
    }

    fn certificate_path(&self, team: &Team) -> PathBuf {
        self.directory.join(format!("{}.p12", team.identifier))
    }

    /// Produce a usable signing certificate with private key for `team`.
    ///
    /// If a previous certificate tagged with this tool's machine name
    /// exists and its encrypted copy is cached locally, that pair is reused
    /// without touching Apple's certificate state. Otherwise the stale
    /// record is revoked and a replacement issued.
    pub async fn resolve(
        &self,
        api: &dyn DeveloperApiClient,
        team: &Team,
        session: &DeveloperSession,
    ) -> Result<Certificate, SideloadError> {
        let certificates = api.fetch_certificates(team, session).await?;

        std::fs::create_dir_all(&self.directory)?;
        let path = self.certificate_path(team);

        let previous = certificates.iter().find(|certificate| {
            certificate
                .machine_name
                .as_deref()
                .map(|name| name.starts_with(crate::TOOL_NAME))
                .unwrap_or(false)
        });

        if let Some(previous) = previous {
            if let Some(machine_identifier) = previous.machine_identifier.as_deref() {
                if let Ok(data) = std::fs::read(&path) {
                    if let Ok(mut certificate) = Certificate::from_p12(&data, machine_identifier) {
                        debug!(
                            "reusing cached signing certificate for team {}",
                            team.identifier
                        );

                        // Re-attach the identifier so the pair can be
                        // re-encrypted later.
                        certificate.machine_identifier =
                            Some(machine_identifier.to_string());

                        return Ok(certificate);
                    }
                }
            }

            api.revoke_certificate(previous, team, session).await?;
        }

        self.create(api, team, session, path).await
    }

    async fn create(
        &self,
        api: &dyn DeveloperApiClient,
        team: &Team,
        session: &DeveloperSession,
        path: PathBuf,
    ) -> Result<Certificate, SideloadError> {
        let created = api.add_certificate(crate::TOOL_NAME, team, session).await?;

        // The private key only exists in this response; it is not
        // retrievable again.
        let private_key = created
            .private_key_der()
            .map(<[u8]>::to_vec)
            .ok_or(SideloadError::MissingPrivateKey)?;

        // The creation response lacks the identifiers needed later, so
        // re-fetch the full record and match it by serial number.
        let certificates = api.fetch_certificates(team, session).await?;

        let mut certificate = certificates
            .into_iter()
            .find(|certificate| certificate.serial_number == created.serial_number)
            .ok_or(SideloadError::MissingCertificate)?;

        certificate.set_private_key_der(private_key);

        if let Some(machine_identifier) = certificate.machine_identifier.clone() {
            match certificate.encrypted_p12(&machine_identifier) {
                Ok(encrypted) => {
                    if let Err(error) = std::fs::write(&path, encrypted) {
                        warn!("failed to cache certificate: {}", error);
                    }
                }
                Err(error) => warn!("failed to cache certificate: {}", error),
            }
        }

        Ok(certificate)
    }
}

#[cfg(test)]
mod test {
    use {
        super::*,
        crate::fakes::{certificate_material, FakeApi},
        std::sync::Arc,
    };

    fn team() -> Team {
        Team {
            identifier: "6053B555".into(),
            name: "Jane Appleseed".into(),
            kind: apple_developer_services::TeamKind::Individual,
        }
    }

    #[tokio::test]
    async fn cached_certificate_short_circuits_creation() {
        let material = certificate_material();
        let api = Arc::new(FakeApi::new());
        let session = api.make_session();
        let team = team();

        api.certificates.lock().unwrap().push(Certificate::new(
            crate::TOOL_NAME.to_string(),
            "0A1B2C3D".to_string(),
            Some("CERTID01".to_string()),
            Some(crate::TOOL_NAME.to_string()),
            Some("token-1".to_string()),
            None,
            None,
        ));

        // A matching local copy, encrypted with the previous certificate's
        // machine identifier.
        let mut on_disk = Certificate::new(
            crate::TOOL_NAME.to_string(),
            material.serial.clone(),
            None,
            None,
            None,
            Some(material.certificate_der.clone()),
            None,
        );
        on_disk.set_private_key_der(material.private_key_der.clone());

        let dir = tempfile::tempdir().unwrap();
        let cache = CertificateCache::new(dir.path().to_path_buf());
        std::fs::write(
            dir.path().join("6053B555.p12"),
            on_disk.encrypted_p12("token-1").unwrap(),
        )
        .unwrap();

        let resolved = cache.resolve(api.as_ref(), &team, &session).await.unwrap();

        assert_eq!(resolved.machine_identifier.as_deref(), Some("token-1"));
        assert!(resolved.private_key_der().is_some());
        assert_eq!(api.count("addCertificate"), 0);
        assert_eq!(api.count("revokeCertificate"), 0);
    }

    #[tokio::test]
    async fn stale_certificate_is_revoked_then_replaced() {
        let api = Arc::new(FakeApi::new());
        let session = api.make_session();
        let team = team();

        api.certificates.lock().unwrap().push(Certificate::new(
            crate::TOOL_NAME.to_string(),
            "0A1B2C3D".to_string(),
            Some("CERTID01".to_string()),
            Some(crate::TOOL_NAME.to_string()),
            Some("token-1".to_string()),
            None,
            None,
        ));

        let dir = tempfile::tempdir().unwrap();
        let cache = CertificateCache::new(dir.path().to_path_buf());

        let resolved = cache.resolve(api.as_ref(), &team, &session).await.unwrap();

        assert_eq!(api.count("revokeCertificate"), 1);
        assert_eq!(api.count("addCertificate"), 1);
        assert!(resolved.private_key_der().is_some());

        // The freshly created pair is cached for the next run.
        assert!(dir.path().join("6053B555.p12").is_file());
    }

    #[tokio::test]
    async fn fresh_team_creates_without_revoking() {
        let api = Arc::new(FakeApi::new());
        let session = api.make_session();
        let team = team();

        let dir = tempfile::tempdir().unwrap();
        let cache = CertificateCache::new(dir.path().to_path_buf());

        cache.resolve(api.as_ref(), &team, &session).await.unwrap();

        assert_eq!(api.count("revokeCertificate"), 0);
        assert_eq!(api.count("addCertificate"), 1);
        assert_eq!(api.count("fetchCertificates"), 2);
    }
}
