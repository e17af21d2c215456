// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Typed interface to Apple's developer services provisioning APIs.
//!
//! This crate models the entities a development team manages through
//! Apple's developer services — teams, devices, signing certificates, App
//! IDs, app groups, and provisioning profiles — and provides an async HTTP
//! client for the plist-over-HTTPS API that manipulates them.
//!
//! The important types:
//!
//! * [`DeveloperApiClient`] describes every service operation as an async
//!   trait so higher layers can depend on it abstractly (and test against
//!   fakes). [`DeveloperServicesClient`] is the production implementation.
//! * [`DeveloperSession`] is an authenticated session. Apple's services
//!   additionally demand device-identity attestation on every call, modeled
//!   by [`AnisetteData`]; sessions carry a refreshable copy.
//! * [`Certificate`] pairs a development certificate with its locally-held
//!   private key and round-trips through encrypted PKCS#12 for at-rest
//!   caching.
//! * [`Feature`] is the closed mapping between bundle entitlements and the
//!   capability flags stored on an [`AppId`].
//!
//! Nothing in this crate decides *when* to call the services; sequencing
//! (and all retry/reuse policy) lives in consuming crates.

mod anisette;
pub use anisette::*;
mod client;
pub use client::*;
mod certificate_request;
pub use certificate_request::*;
mod error;
pub use error::*;
pub mod features;
pub use features::Feature;
mod models;
pub use models::*;
mod session;
pub use session::*;
