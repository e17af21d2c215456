// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Anisette device-identity attestation data.
//!
//! Every authenticated request to Apple's private provisioning APIs must
//! carry a set of `X-Apple-I-*` headers derived from so-called *anisette*
//! data, an attestation blob minted by an Apple frameworks process. This
//! module only models the data; acquiring it is the job of an
//! [`AnisetteProvider`](https://docs.rs/apple-sideload) implementation in a
//! consuming crate.

use {
    chrono::{DateTime, Utc},
    serde::{Deserialize, Serialize},
    std::collections::HashMap,
};

/// Client string Apple expects from first-party developer tooling.
const XCODE_CLIENT_DESCRIPTION: &str = "(com.apple.dt.Xcode/3594.4.19)>";

/// A device-identity attestation blob required by Apple's private
/// authentication and provisioning APIs.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct AnisetteData {
    /// Stable machine identifier (`X-Apple-I-MD-M`).
    pub machine_id: String,

    /// Rolling one-time password (`X-Apple-I-MD`).
    pub one_time_password: String,

    /// Local user identifier (`X-Apple-I-MD-LU`).
    pub local_user_id: String,

    /// Routing info (`X-Apple-I-MD-RINFO`).
    pub routing_info: u64,

    /// Unique device identifier (`X-Mme-Device-Id`).
    pub device_unique_identifier: String,

    /// Device serial number (`X-Apple-I-SRL-NO`).
    pub device_serial_number: String,

    /// Client description string (`X-Mme-Client-Info`).
    pub device_description: String,

    /// Timestamp the blob was minted at (`X-Apple-I-Client-Time`).
    pub date: DateTime<Utc>,

    /// BCP 47 locale (`X-Apple-Locale`).
    pub locale: String,

    /// IANA time zone name (`X-Apple-I-TimeZone`).
    pub time_zone: String,
}

impl AnisetteData {
    /// Project this blob onto the HTTP headers Apple's services expect.
    pub fn headers(&self) -> HashMap<&'static str, String> {
        let mut headers = HashMap::new();

        headers.insert("X-Apple-I-MD-M", self.machine_id.clone());
        headers.insert("X-Apple-I-MD", self.one_time_password.clone());
        headers.insert("X-Apple-I-MD-LU", self.local_user_id.clone());
        headers.insert("X-Apple-I-MD-RINFO", self.routing_info.to_string());
        headers.insert("X-Mme-Device-Id", self.device_unique_identifier.clone());
        headers.insert("X-Apple-I-SRL-NO", self.device_serial_number.clone());
        headers.insert("X-Mme-Client-Info", self.device_description.clone());
        headers.insert(
            "X-Apple-I-Client-Time",
            self.date.format("%Y-%m-%dT%H:%M:%SZ").to_string(),
        );
        headers.insert("X-Apple-Locale", self.locale.clone());
        headers.insert("X-Apple-I-TimeZone", self.time_zone.clone());

        headers
    }

    /// Rewrite the trailing client identity in the device description.
    ///
    /// Anisette data minted by a third-party responder process carries that
    /// process's bundle identifier in `device_description`. Apple's services
    /// only accept requests that look like they originate from Xcode, so the
    /// responder's identity is replaced before use.
    pub fn sanitize_device_description(&mut self, responder_bundle_id: &str) {
        let needle = format!("({}", responder_bundle_id.to_lowercase());

        if let Some(index) = self.device_description.to_lowercase().find(&needle) {
            let mut adjusted = self.device_description[..index].to_string();
            adjusted.push_str(XCODE_CLIENT_DESCRIPTION);
            self.device_description = adjusted;
        }
    }
}
