// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Mapping between bundle entitlements and App ID capability flags.
//!
//! Apple's provisioning service models capabilities as opaque feature keys
//! on an App ID whose values are plist-typed (booleans for simple toggles,
//! strings or arrays for richer capabilities). Only a small set of
//! entitlements influence provisioning; the mapping is intentionally an
//! explicit, closed table rather than something derived at runtime.

use plist::Value;

/// App ID capabilities understood by the provisioning service.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Feature {
    /// App group container access.
    AppGroups,

    /// Inter-App Audio routing.
    InterAppAudio,

    /// Apple Push Notification service.
    PushNotifications,
}

/// Entitlement key for app group membership.
pub const ENTITLEMENT_APP_GROUPS: &str = "com.apple.security.application-groups";

/// Entitlement key for Inter-App Audio.
pub const ENTITLEMENT_INTER_APP_AUDIO: &str = "inter-app-audio";

/// Entitlement key for the push notification environment.
pub const ENTITLEMENT_APS_ENVIRONMENT: &str = "aps-environment";

impl Feature {
    /// The feature key used by the provisioning service for this capability.
    pub fn key(&self) -> &'static str {
        match self {
            Self::AppGroups => "APG3427HIY",
            Self::InterAppAudio => "IAD53UNK2F",
            Self::PushNotifications => "push",
        }
    }

    /// Resolve the capability corresponding to an entitlement key.
    ///
    /// Returns `None` for entitlements that have no server-side capability
    /// (the overwhelmingly common case).
    pub fn from_entitlement(key: &str) -> Option<Self> {
        match key {
            ENTITLEMENT_APP_GROUPS => Some(Self::AppGroups),
            ENTITLEMENT_INTER_APP_AUDIO => Some(Self::InterAppAudio),
            ENTITLEMENT_APS_ENVIRONMENT => Some(Self::PushNotifications),
            _ => None,
        }
    }
}

/// Derive the feature values required by a set of entitlements.
///
/// The value attached to each feature is the entitlement's own value,
/// passed through untransformed. Callers that need to force a feature on or
/// off (app groups, whose value on the App ID is a plain boolean) overwrite
/// the derived entry afterwards.
pub fn features_for_entitlements(
    entitlements: &plist::Dictionary,
) -> Vec<(Feature, Value)> {
    entitlements
        .iter()
        .filter_map(|(key, value)| {
            Feature::from_entitlement(key).map(|feature| (feature, value.clone()))
        })
        .collect()
}
