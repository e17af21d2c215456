// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Authenticated developer services sessions.

use {crate::anisette::AnisetteData, std::sync::Mutex};

/// An authenticated session against Apple's developer services.
///
/// Instances are shared across concurrent provisioning operations, so the
/// attached anisette data sits behind a mutex: long pipelines refresh it in
/// place to keep the session from expiring mid-run.
#[derive(Debug)]
pub struct DeveloperSession {
    /// Directory services person identifier of the authenticated account.
    pub dsid: String,

    /// Bearer token scoped to the developer services.
    pub auth_token: String,

    anisette: Mutex<AnisetteData>,
}

impl DeveloperSession {
    pub fn new(dsid: String, auth_token: String, anisette: AnisetteData) -> Self {
        Self {
            dsid,
            auth_token,
            anisette: Mutex::new(anisette),
        }
    }

    /// Snapshot of the currently-attached anisette data.
    pub fn anisette_data(&self) -> AnisetteData {
        self.anisette
            .lock()
            .expect("anisette lock should never be poisoned")
            .clone()
    }

    /// Replace the attached anisette data.
    pub fn refresh_anisette(&self, data: AnisetteData) {
        *self
            .anisette
            .lock()
            .expect("anisette lock should never be poisoned") = data;
    }
}
