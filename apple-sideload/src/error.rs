// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use {
    apple_developer_services::DeveloperServicesError,
    std::path::PathBuf,
    thiserror::Error,
};

/// Unified error type for sideload operations.
#[derive(Debug, Error)]
pub enum SideloadError {
    #[error("unknown command")]
    CliUnknownCommand,

    #[error("bad argument")]
    CliBadArgument,

    #[error("{0}")]
    CliGeneralError(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("developer services error: {0}")]
    Api(#[from] DeveloperServicesError),

    #[error("error parsing plist: {0}")]
    Plist(#[from] plist::Error),

    #[error("zip archive error: {0}")]
    Zip(#[from] zip::result::ZipError),

    #[error("binary parsing error: {0}")]
    Goblin(#[from] goblin::error::Error),

    #[error("the operation was cancelled")]
    Cancelled,

    #[error("you are not a member of any development teams")]
    NoTeam,

    #[error("the developer certificate's private key could not be found")]
    MissingPrivateKey,

    #[error("the developer certificate could not be found")]
    MissingCertificate,

    #[error("no anisette data responder answered in time")]
    AnisetteUnavailable,

    #[error("received anisette data is invalid")]
    InvalidAnisetteData,

    #[error("invalid app: {0}")]
    InvalidApp(String),

    #[error("bundle Info.plist does not define CFBundleIdentifier: {0}")]
    BundleNoIdentifier(PathBuf),

    #[error("no IPA payload application found in {0}")]
    IpaNoPayload(PathBuf),

    #[error("no provisioning profile was resolved for {0}")]
    MissingProvisioningProfile(String),

    #[error("code signing failed: {0}")]
    Signer(String),

    #[error("device installation failed: {0}")]
    Install(String),

    #[error("internal task failure: {0}")]
    Internal(String),
}

impl SideloadError {
    /// Whether this outcome should be treated as a silent no-op by
    /// top-level callers rather than a failure.
    pub fn is_benign(&self) -> bool {
        matches!(
            self,
            Self::Cancelled
                | Self::Api(DeveloperServicesError::RequiresTwoFactorAuthentication)
        )
    }
}

/// A pipeline failure wrapped with user-facing context.
///
/// Carries a title naming the app and target device, an optional reason
/// identifying which pipeline stage failed, and the underlying error as a
/// chained cause.
#[derive(Debug, Error)]
#[error("{title}")]
pub struct SignFailure {
    title: String,
    failure: Option<String>,
    #[source]
    source: SideloadError,
}

impl SignFailure {
    pub fn new(title: String, failure: Option<String>, source: SideloadError) -> Self {
        Self {
            title,
            failure,
            source,
        }
    }

    pub fn title(&self) -> &str {
        &self.title
    }

    /// The stage-specific failure reason, where one was identified.
    pub fn failure_reason(&self) -> Option<&str> {
        self.failure.as_deref()
    }

    pub fn source_error(&self) -> &SideloadError {
        &self.source
    }

    pub fn into_source(self) -> SideloadError {
        self.source
    }

    /// See [SideloadError::is_benign].
    pub fn is_benign(&self) -> bool {
        self.source.is_benign()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn benign_outcomes() {
        assert!(SideloadError::Cancelled.is_benign());
        assert!(SideloadError::Api(
            DeveloperServicesError::RequiresTwoFactorAuthentication
        )
        .is_benign());
        assert!(!SideloadError::NoTeam.is_benign());
        assert!(
            !SideloadError::Api(DeveloperServicesError::IncorrectCredentials).is_benign()
        );
    }

    #[test]
    fn sign_failure_preserves_cause_chain() {
        let failure = SignFailure::new(
            "Example could not sign iPhone.".to_string(),
            Some("A valid signing certificate could not be created.".to_string()),
            SideloadError::MissingPrivateKey,
        );

        assert_eq!(failure.to_string(), "Example could not sign iPhone.");
        assert_eq!(
            failure.failure_reason(),
            Some("A valid signing certificate could not be created.")
        );
        assert!(matches!(
            failure.source_error(),
            SideloadError::MissingPrivateKey
        ));
    }
}
