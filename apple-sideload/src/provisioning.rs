// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Provisioning resolution for apps and their extensions.
//!
//! For each bundle in a signing run, resolution derives the target bundle
//! identifier, reconciles the App ID's registration, capabilities, and app
//! groups, and fetches a fresh provisioning profile. The app and its
//! extensions resolve concurrently; only the app-group reconciliation is
//! serialized, since creating the same group twice is a server-side error.

use {
    crate::{bundle::Application, error::SideloadError},
    apple_developer_services::{
        features::{features_for_entitlements, Feature},
        AppGroup, AppId, DeveloperApiClient, DeveloperSession, Device, ProvisioningProfile, Team,
    },
    log::debug,
    percent_encoding::{utf8_percent_encode, AsciiSet, CONTROLS},
    plist::Value,
    std::{collections::HashMap, sync::Arc},
    tokio::task::JoinSet,
};

/// Characters escaped when sending bundle names to the services.
const NAME_ESCAPE_SET: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'<')
    .add(b'>')
    .add(b'%');

/// Rule used to compute the target bundle identifier during re-signing.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BundleIdPolicy {
    /// Reuse the app's original bundle identifier.
    Same,

    /// Derive `<original>.<team identifier>`.
    Auto,

    /// Use exactly this identifier.
    Explicit(String),
}

impl BundleIdPolicy {
    pub fn parse(value: &str) -> Self {
        match value {
            "same" => Self::Same,
            "auto" => Self::Auto,
            other => Self::Explicit(other.to_string()),
        }
    }

    /// The effective identifier for a bundle whose parent app has
    /// `parent_bundle_id`.
    ///
    /// Extensions derive from their parent's identifier, so every bundle in
    /// one run resolves to the same target identifier.
    fn resolve(&self, parent_bundle_id: &str, team: &Team) -> String {
        match self {
            Self::Same => parent_bundle_id.to_string(),
            Self::Auto => format!("{}.{}", parent_bundle_id, team.identifier),
            Self::Explicit(identifier) => identifier.clone(),
        }
    }
}

/// Resolves provisioning profiles for the bundles of a signing run.
#[derive(Clone)]
pub struct ProvisioningResolver {
    api: Arc<dyn DeveloperApiClient>,
    app_groups_gate: Arc<tokio::sync::Mutex<()>>,
}

impl ProvisioningResolver {
    pub fn new(api: Arc<dyn DeveloperApiClient>) -> Self {
        Self {
            api,
            app_groups_gate: Arc::new(tokio::sync::Mutex::new(())),
        }
    }

    /// Resolve profiles for the app and all of its extensions.
    ///
    /// The returned map is keyed by each bundle's original identifier. The
    /// app resolves first; extensions then fan out concurrently. If any
    /// resolution fails the aggregate fails with the first error observed,
    /// letting the remaining in-flight resolutions finish and discarding
    /// their results.
    pub async fn resolve_all(
        &self,
        application: &Application,
        device: &Device,
        team: &Team,
        session: Arc<DeveloperSession>,
        policy: &BundleIdPolicy,
    ) -> Result<HashMap<String, ProvisioningProfile>, SideloadError> {
        let main_profile = self
            .resolve(
                application.clone(),
                None,
                device.clone(),
                team.clone(),
                session.clone(),
                policy.clone(),
            )
            .await?;

        let mut profiles = HashMap::new();
        profiles.insert(application.bundle_identifier(), main_profile);

        let mut tasks = JoinSet::new();

        for extension in application.app_extensions()? {
            let resolver = self.clone();
            let parent = application.clone();
            let device = device.clone();
            let team = team.clone();
            let session = session.clone();
            let policy = policy.clone();
            let key = extension.bundle_identifier();

            tasks.spawn(async move {
                let profile = resolver
                    .resolve(extension, Some(parent), device, team, session, policy)
                    .await;

                (key, profile)
            });
        }

        let mut first_error = None;

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((key, Ok(profile))) => {
                    profiles.insert(key, profile);
                }
                Ok((key, Err(error))) => {
                    debug!("provisioning {} failed: {}", key, error);

                    if first_error.is_none() {
                        first_error = Some(error);
                    }
                }
                Err(join_error) => {
                    if first_error.is_none() {
                        first_error = Some(SideloadError::Internal(join_error.to_string()));
                    }
                }
            }
        }

        match first_error {
            Some(error) => Err(error),
            None => Ok(profiles),
        }
    }

    /// Resolve one bundle to a provisioning profile.
    async fn resolve(
        &self,
        bundle: Application,
        parent: Option<Application>,
        device: Device,
        team: Team,
        session: Arc<DeveloperSession>,
        policy: BundleIdPolicy,
    ) -> Result<ProvisioningProfile, SideloadError> {
        let parent_bundle_id = parent
            .as_ref()
            .map(Application::bundle_identifier)
            .unwrap_or_else(|| bundle.bundle_identifier());

        let bundle_id = policy.resolve(&parent_bundle_id, &team);

        let preferred_name = match &parent {
            Some(parent) => format!("{} {}", parent.name(), bundle.name()),
            None => bundle.name(),
        };
        // Names may contain arbitrary text; escape for transport.
        let preferred_name =
            utf8_percent_encode(&preferred_name, NAME_ESCAPE_SET).to_string();

        let app_id = self
            .register_app_id(&preferred_name, &bundle_id, &team, &session)
            .await?;
        let app_id = self
            .update_features(app_id, &bundle, &team, &session)
            .await?;
        let app_id = self
            .update_app_groups(app_id, &bundle, &team, &session)
            .await?;

        Ok(self
            .api
            .fetch_provisioning_profile(&app_id, device.platform, &team, &session)
            .await?)
    }

    /// Reuse the App ID registered for `bundle_id`, or register one.
    async fn register_app_id(
        &self,
        name: &str,
        bundle_id: &str,
        team: &Team,
        session: &DeveloperSession,
    ) -> Result<AppId, SideloadError> {
        let app_ids = self.api.fetch_app_ids(team, session).await?;

        match app_ids
            .into_iter()
            .find(|app_id| app_id.bundle_identifier == bundle_id)
        {
            Some(app_id) => Ok(app_id),
            None => Ok(self.api.add_app_id(name, bundle_id, team, session).await?),
        }
    }

    /// Bring the App ID's capability flags in line with the bundle.
    ///
    /// A feature is left untouched only when it is already present with an
    /// equal value, or absent while the desired value is disabled. Any
    /// other difference replaces the entire feature map in one update.
    async fn update_features(
        &self,
        app_id: AppId,
        bundle: &Application,
        team: &Team,
        session: &DeveloperSession,
    ) -> Result<AppId, SideloadError> {
        let mut desired = plist::Dictionary::new();

        for (feature, value) in features_for_entitlements(bundle.entitlements()) {
            desired.insert(feature.key().to_string(), value);
        }

        // The app-groups feature is a plain toggle on the App ID; enable it
        // exactly when the bundle declares groups.
        let uses_app_groups = !bundle.app_group_identifiers().is_empty();
        desired.insert(
            Feature::AppGroups.key().to_string(),
            Value::Boolean(uses_app_groups),
        );

        let mut update_required = false;

        for (key, value) in desired.iter() {
            match app_id.features.get(key) {
                Some(current) if current == value => {}
                None if value == &Value::Boolean(false) => {}
                _ => {
                    update_required = true;
                    break;
                }
            }
        }

        if !update_required {
            return Ok(app_id);
        }

        let mut updated = app_id;
        updated.features = desired;

        Ok(self.api.update_app_id(&updated, team, session).await?)
    }

    /// Ensure the bundle's app groups exist and are assigned to the App ID.
    ///
    /// Held under a resolver-wide gate: concurrent bundle resolutions
    /// racing through fetch-create-assign would otherwise register the same
    /// group twice. The gate covers only this sequence.
    async fn update_app_groups(
        &self,
        app_id: AppId,
        bundle: &Application,
        team: &Team,
        session: &DeveloperSession,
    ) -> Result<AppId, SideloadError> {
        let group_identifiers = bundle.app_group_identifiers();

        // Assigning an App ID to an empty group set is a service error, so
        // a bundle without groups is left alone.
        if group_identifiers.is_empty() {
            return Ok(app_id);
        }

        let _guard = self.app_groups_gate.lock().await;

        let existing = self.api.fetch_app_groups(team, session).await?;

        let mut groups: Vec<AppGroup> = Vec::new();
        let mut missing = Vec::new();

        for identifier in &group_identifiers {
            let adjusted = format!("{}.{}", identifier, team.identifier);

            match existing
                .iter()
                .find(|group| group.group_identifier == adjusted)
            {
                Some(group) => groups.push(group.clone()),
                None => missing.push((identifier.clone(), adjusted)),
            }
        }

        let created = futures::future::join_all(missing.iter().map(|(identifier, adjusted)| {
            // Group names reject most punctuation; replace periods with
            // spaces and tag the group as ours.
            let name = format!("{} {}", crate::TOOL_NAME, identifier.replace('.', " "));

            async move {
                self.api
                    .add_app_group(&name, adjusted, team, session)
                    .await
            }
        }))
        .await;

        for result in created {
            groups.push(result?);
        }

        self.api
            .assign_app_groups(&app_id, &groups, team, session)
            .await?;

        Ok(app_id)
    }
}
