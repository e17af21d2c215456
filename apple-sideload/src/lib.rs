// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Re-sign and install iOS applications.
//!
//! This crate orchestrates the re-signing of an `.ipa` against Apple's
//! developer services and optionally installs the result on a connected
//! device. Two provisioning paths are supported:
//!
//! * **Account-based**: sign in with an Apple ID, select a development
//!   team, register the target device, obtain (or reuse) a development
//!   certificate, and provision every bundle in the app — the app itself
//!   plus each of its app extensions — with a fresh profile. Driven by
//!   [`Sideloader::sign_with_account`].
//! * **Certificate-based**: sign with a local `.p12` and
//!   `.mobileprovision` pair, with no network involvement. Driven by
//!   [`Sideloader::sign_with_certificate`].
//!
//! The pipeline's collaborators are injected:
//!
//! * [`apple_developer_services::DeveloperApiClient`] for everything Apple-side,
//! * [`AnisetteProvider`] for device-identity attestation data,
//! * [`CodeSigner`] for the cryptographic signing step itself,
//! * [`DeviceInstaller`] for the device transport.
//!
//! The certificate churn policy lives in [`CertificateCache`]: at most one
//! live certificate tagged with this tool's machine name exists per team,
//! and a cached encrypted copy is reused whenever it still matches.

/// Name this tool identifies itself as to Apple's services.
///
/// Used as the machine name on created certificates and as the label
/// prefix on created app groups.
pub const TOOL_NAME: &str = "isideload";

mod anisette;
pub use anisette::*;
mod bundle;
pub use bundle::*;
mod certificates;
pub use certificates::*;
mod device;
pub use device::*;
mod error;
pub use error::*;
#[cfg(test)]
mod fakes;
mod macho;
pub use macho::executable_entitlements;
mod provisioning;
pub use provisioning::*;
mod signing;
pub use signing::*;
