// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use {std::path::PathBuf, thiserror::Error};

/// Unified error type for Apple developer services interactions.
#[derive(Debug, Error)]
pub enum DeveloperServicesError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    Reqwest(#[from] reqwest::Error),

    #[error("error decoding plist payload: {0}")]
    Plist(#[from] plist::Error),

    #[error("X.509 certificate handler error: {0}")]
    X509(#[from] x509_certificate::X509CertificateError),

    #[error("JSON serialization error: {0}")]
    SerdeJson(#[from] serde_json::Error),

    #[error("the Apple ID or password was incorrect")]
    IncorrectCredentials,

    #[error("this Apple ID requires two-factor authentication")]
    RequiresTwoFactorAuthentication,

    #[error("the verification code was incorrect or expired")]
    IncorrectVerificationCode,

    #[error("the developer services session is no longer valid")]
    InvalidSession,

    #[error("developer services reported failure {code}: {message}")]
    ServiceFailure { code: i64, message: String },

    #[error("developer services returned neither a result nor an error")]
    UnknownResponse,

    #[error("response is missing expected field: {0}")]
    MissingResponseField(&'static str),

    #[error("incorrect password given when decrypting PFX data")]
    PfxBadPassword,

    #[error("error parsing PFX data: {0}")]
    PfxParseError(String),

    #[error("error encoding PFX data: {0}")]
    PfxEncodeError(String),

    #[error("error generating RSA signing key: {0}")]
    RsaKeyGeneration(String),

    #[error("error building certificate signing request: {0}")]
    CertificateRequestBuild(String),

    #[error("certificate file does not exist: {0}")]
    CertificateFileMissing(PathBuf),

    #[error("provisioning profile data is malformed: {0}")]
    MalformedProfile(String),
}
