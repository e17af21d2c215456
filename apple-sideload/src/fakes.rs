// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! In-memory collaborators for exercising the pipeline in tests.

use {
    crate::{
        anisette::AnisetteProvider,
        bundle::Application,
        error::SideloadError,
        signing::CodeSigner,
    },
    apple_developer_services::{
        Account, AnisetteData, AppGroup, AppId, Certificate, DeveloperApiClient,
        DeveloperServicesError, DeveloperSession, Device, DevicePlatform, ProvisioningProfile,
        Team, TwoFactorHandler,
    },
    async_trait::async_trait,
    plist::Value,
    std::{
        collections::{HashMap, VecDeque},
        path::{Path, PathBuf},
        sync::{Arc, Mutex},
        time::Duration,
    },
};

/// Certificate + key material for p12 fixtures.
pub(crate) struct CertificateMaterial {
    pub serial: String,
    pub certificate_der: Vec<u8>,
    pub private_key_der: Vec<u8>,
}

/// Generate a self-signed certificate and key pair.
pub(crate) fn certificate_material() -> CertificateMaterial {
    use x509_certificate::{KeyAlgorithm, X509CertificateBuilder};

    let mut builder = X509CertificateBuilder::new(KeyAlgorithm::Ed25519);
    builder
        .subject()
        .append_common_name_utf8_string("iOS Development: test")
        .unwrap();
    builder.validity_duration(chrono::Duration::hours(1));

    let (certificate, _key_pair, document) = builder.create_with_random_keypair().unwrap();

    let certificate_der = certificate.encode_der().unwrap();
    let private_key_der = document.as_ref().to_vec();

    // Round-trip through the model so the serial matches what p12 parsing
    // will later compute.
    let mut probe = Certificate::new(
        "probe".into(),
        String::new(),
        None,
        None,
        None,
        Some(certificate_der.clone()),
        None,
    );
    probe.set_private_key_der(private_key_der.clone());
    let encoded = probe.encrypted_p12("probe").unwrap();
    let serial = Certificate::from_p12(&encoded, "probe").unwrap().serial_number;

    CertificateMaterial {
        serial,
        certificate_der,
        private_key_der,
    }
}

/// Write an `.app` fixture with the given extension names, and parse it.
pub(crate) fn make_app_with_extensions(root: &Path, extensions: &[&str]) -> Application {
    let app = root.join("Example.app");
    std::fs::create_dir_all(&app).unwrap();
    write_info_plist(&app, "com.example.app", "Example");

    for extension in extensions {
        let appex = app.join("PlugIns").join(format!("{}.appex", extension));
        std::fs::create_dir_all(&appex).unwrap();
        write_info_plist(
            &appex,
            &format!("com.example.app.{}", extension.to_lowercase()),
            extension,
        );
    }

    Application::new(app).unwrap()
}

fn write_info_plist(dir: &Path, bundle_id: &str, name: &str) {
    let mut info = plist::Dictionary::new();
    info.insert("CFBundleIdentifier".into(), Value::String(bundle_id.into()));
    info.insert("CFBundleName".into(), Value::String(name.into()));

    Value::Dictionary(info)
        .to_file_xml(dir.join("Info.plist"))
        .unwrap();
}

/// Raw `.mobileprovision`-shaped bytes with an embedded plist payload.
pub(crate) fn encoded_profile(bundle_id: &str) -> Vec<u8> {
    let plist = format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<!DOCTYPE plist PUBLIC "-//Apple//DTD PLIST 1.0//EN" "http://www.apple.com/DTDs/PropertyList-1.0.dtd">
<plist version="1.0">
<dict>
    <key>Name</key>
    <string>{} Development</string>
    <key>UUID</key>
    <string>01234567-89AB-CDEF-0123-456789ABCDEF</string>
    <key>Entitlements</key>
    <dict>
        <key>application-identifier</key>
        <string>6053B555.{}</string>
    </dict>
</dict>
</plist>"#,
        bundle_id, bundle_id
    );

    let mut data = vec![0x30, 0x82, 0x0b, 0xad];
    data.extend_from_slice(plist.as_bytes());
    data.extend_from_slice(&[0x00, 0x00]);
    data
}

pub(crate) fn sample_anisette() -> AnisetteData {
    AnisetteData {
        machine_id: "bWFjaGluZQ==".into(),
        one_time_password: "b3Rw".into(),
        local_user_id: "TOKEN".into(),
        routing_info: 17106176,
        device_unique_identifier: "00000000-0000-0000-0000-000000000000".into(),
        device_serial_number: "0".into(),
        device_description: "<MacBookPro15,1> (com.apple.dt.Xcode/3594.4.19)>".into(),
        date: chrono::Utc::now(),
        locale: "en_US".into(),
        time_zone: "UTC".into(),
    }
}

/// Scripted behavior for one `fetch_provisioning_profile` call.
pub(crate) struct ProfileDirective {
    delay: Duration,
    failure_code: Option<i64>,
}

impl ProfileDirective {
    pub(crate) fn ok(delay_ms: u64) -> Self {
        Self {
            delay: Duration::from_millis(delay_ms),
            failure_code: None,
        }
    }

    pub(crate) fn fail(delay_ms: u64, code: i64) -> Self {
        Self {
            delay: Duration::from_millis(delay_ms),
            failure_code: Some(code),
        }
    }
}

/// An in-memory developer services backend with call recording.
pub(crate) struct FakeApi {
    pub(crate) teams: Mutex<Vec<Team>>,
    pub(crate) certificates: Mutex<Vec<Certificate>>,
    pub(crate) devices: Mutex<Vec<Device>>,
    pub(crate) app_ids: Mutex<Vec<AppId>>,
    pub(crate) app_groups: Mutex<Vec<AppGroup>>,
    pub(crate) assignments: Mutex<HashMap<String, Vec<String>>>,
    pub(crate) calls: Mutex<Vec<String>>,
    profile_script: Mutex<VecDeque<ProfileDirective>>,
    material: CertificateMaterial,
    two_factor_required: Mutex<bool>,
    counter: Mutex<u32>,
}

impl FakeApi {
    pub(crate) fn new() -> Self {
        Self {
            teams: Mutex::new(vec![Team {
                identifier: "6053B555".into(),
                name: "Jane Appleseed".into(),
                kind: apple_developer_services::TeamKind::Individual,
            }]),
            certificates: Mutex::new(Vec::new()),
            devices: Mutex::new(Vec::new()),
            app_ids: Mutex::new(Vec::new()),
            app_groups: Mutex::new(Vec::new()),
            assignments: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
            profile_script: Mutex::new(VecDeque::new()),
            material: certificate_material(),
            two_factor_required: Mutex::new(false),
            counter: Mutex::new(0),
        }
    }

    pub(crate) fn make_session(&self) -> DeveloperSession {
        DeveloperSession::new("12345".into(), "gs-token".into(), sample_anisette())
    }

    pub(crate) fn fail_authenticate(&self) {
        *self.two_factor_required.lock().unwrap() = true;
    }

    pub(crate) fn script_profiles(&self, directives: Vec<ProfileDirective>) {
        *self.profile_script.lock().unwrap() = directives.into();
    }

    pub(crate) fn count(&self, name: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|call| call.as_str() == name)
            .count()
    }

    fn record(&self, name: &str) {
        self.calls.lock().unwrap().push(name.to_string());
    }

    fn next_id(&self) -> u32 {
        let mut counter = self.counter.lock().unwrap();
        *counter += 1;
        *counter
    }
}

#[async_trait]
impl DeveloperApiClient for FakeApi {
    async fn authenticate(
        &self,
        apple_id: &str,
        _password: &str,
        anisette: &AnisetteData,
        _two_factor: &dyn TwoFactorHandler,
    ) -> Result<(Account, DeveloperSession), DeveloperServicesError> {
        self.record("authenticate");

        if *self.two_factor_required.lock().unwrap() {
            return Err(DeveloperServicesError::RequiresTwoFactorAuthentication);
        }

        let account = Account {
            apple_id: apple_id.to_string(),
            identifier: "12345".into(),
            first_name: "Jane".into(),
            last_name: "Appleseed".into(),
        };

        Ok((
            account,
            DeveloperSession::new("12345".into(), "gs-token".into(), anisette.clone()),
        ))
    }

    async fn fetch_teams(
        &self,
        _session: &DeveloperSession,
    ) -> Result<Vec<Team>, DeveloperServicesError> {
        self.record("fetchTeams");
        Ok(self.teams.lock().unwrap().clone())
    }

    async fn fetch_certificates(
        &self,
        _team: &Team,
        _session: &DeveloperSession,
    ) -> Result<Vec<Certificate>, DeveloperServicesError> {
        self.record("fetchCertificates");
        Ok(self.certificates.lock().unwrap().clone())
    }

    async fn add_certificate(
        &self,
        machine_name: &str,
        _team: &Team,
        _session: &DeveloperSession,
    ) -> Result<Certificate, DeveloperServicesError> {
        self.record("addCertificate");

        let stored = Certificate::new(
            machine_name.to_string(),
            self.material.serial.clone(),
            Some(format!("CERTID{:02}", self.next_id())),
            Some(machine_name.to_string()),
            Some("fake-machine-token".to_string()),
            Some(self.material.certificate_der.clone()),
            None,
        );
        self.certificates.lock().unwrap().push(stored);

        // Like the real service, the creation response carries the key but
        // not the record identifiers.
        let mut created = Certificate::new(
            machine_name.to_string(),
            self.material.serial.clone(),
            None,
            Some(machine_name.to_string()),
            None,
            None,
            None,
        );
        created.set_private_key_der(self.material.private_key_der.clone());

        Ok(created)
    }

    async fn revoke_certificate(
        &self,
        certificate: &Certificate,
        _team: &Team,
        _session: &DeveloperSession,
    ) -> Result<(), DeveloperServicesError> {
        self.record("revokeCertificate");
        self.certificates
            .lock()
            .unwrap()
            .retain(|candidate| candidate.serial_number != certificate.serial_number);
        Ok(())
    }

    async fn fetch_devices(
        &self,
        _team: &Team,
        _platform: DevicePlatform,
        _session: &DeveloperSession,
    ) -> Result<Vec<Device>, DeveloperServicesError> {
        self.record("fetchDevices");
        Ok(self.devices.lock().unwrap().clone())
    }

    async fn register_device(
        &self,
        name: &str,
        identifier: &str,
        platform: DevicePlatform,
        _team: &Team,
        _session: &DeveloperSession,
    ) -> Result<Device, DeveloperServicesError> {
        self.record("registerDevice");

        let device = Device {
            identifier: identifier.to_string(),
            name: name.to_string(),
            platform,
            os_version: None,
        };
        self.devices.lock().unwrap().push(device.clone());

        Ok(device)
    }

    async fn fetch_app_ids(
        &self,
        _team: &Team,
        _session: &DeveloperSession,
    ) -> Result<Vec<AppId>, DeveloperServicesError> {
        self.record("fetchAppIds");
        Ok(self.app_ids.lock().unwrap().clone())
    }

    async fn add_app_id(
        &self,
        name: &str,
        bundle_identifier: &str,
        _team: &Team,
        _session: &DeveloperSession,
    ) -> Result<AppId, DeveloperServicesError> {
        self.record("addAppId");

        let app_id = AppId {
            identifier: format!("APPID{:02}", self.next_id()),
            bundle_identifier: bundle_identifier.to_string(),
            name: name.to_string(),
            features: plist::Dictionary::new(),
        };
        self.app_ids.lock().unwrap().push(app_id.clone());

        Ok(app_id)
    }

    async fn update_app_id(
        &self,
        app_id: &AppId,
        _team: &Team,
        _session: &DeveloperSession,
    ) -> Result<AppId, DeveloperServicesError> {
        self.record("updateAppId");

        let mut app_ids = self.app_ids.lock().unwrap();
        match app_ids
            .iter_mut()
            .find(|candidate| candidate.identifier == app_id.identifier)
        {
            Some(stored) => *stored = app_id.clone(),
            None => app_ids.push(app_id.clone()),
        }

        Ok(app_id.clone())
    }

    async fn fetch_app_groups(
        &self,
        _team: &Team,
        _session: &DeveloperSession,
    ) -> Result<Vec<AppGroup>, DeveloperServicesError> {
        self.record("fetchAppGroups");
        Ok(self.app_groups.lock().unwrap().clone())
    }

    async fn add_app_group(
        &self,
        name: &str,
        group_identifier: &str,
        _team: &Team,
        _session: &DeveloperSession,
    ) -> Result<AppGroup, DeveloperServicesError> {
        self.record("addAppGroup");

        let group = AppGroup {
            identifier: format!("GROUPID{:02}", self.next_id()),
            group_identifier: group_identifier.to_string(),
            name: name.to_string(),
        };
        self.app_groups.lock().unwrap().push(group.clone());

        Ok(group)
    }

    async fn assign_app_groups(
        &self,
        app_id: &AppId,
        groups: &[AppGroup],
        _team: &Team,
        _session: &DeveloperSession,
    ) -> Result<(), DeveloperServicesError> {
        self.record("assignAppGroups");

        self.assignments.lock().unwrap().insert(
            app_id.identifier.clone(),
            groups
                .iter()
                .map(|group| group.group_identifier.clone())
                .collect(),
        );

        Ok(())
    }

    async fn fetch_provisioning_profile(
        &self,
        app_id: &AppId,
        _platform: DevicePlatform,
        team: &Team,
        _session: &DeveloperSession,
    ) -> Result<ProvisioningProfile, DeveloperServicesError> {
        self.record("fetchProvisioningProfile");

        let directive = self.profile_script.lock().unwrap().pop_front();

        if let Some(directive) = directive {
            if !directive.delay.is_zero() {
                tokio::time::sleep(directive.delay).await;
            }

            if let Some(code) = directive.failure_code {
                return Err(DeveloperServicesError::ServiceFailure {
                    code,
                    message: format!("scripted failure for {}", app_id.bundle_identifier),
                });
            }
        }

        let mut entitlements = plist::Dictionary::new();
        entitlements.insert(
            "application-identifier".into(),
            Value::String(format!("{}.{}", team.identifier, app_id.bundle_identifier)),
        );

        let assigned = self
            .assignments
            .lock()
            .unwrap()
            .get(&app_id.identifier)
            .cloned()
            .unwrap_or_default();
        if !assigned.is_empty() {
            entitlements.insert(
                apple_developer_services::features::ENTITLEMENT_APP_GROUPS.into(),
                Value::Array(assigned.into_iter().map(Value::String).collect()),
            );
        }

        Ok(ProvisioningProfile {
            name: format!("{} Development", app_id.name),
            uuid: format!("UUID-{}", app_id.identifier),
            bundle_identifier: app_id.bundle_identifier.clone(),
            team_identifier: team.identifier.clone(),
            entitlements,
            data: vec![0xca, 0xfe],
        })
    }
}

/// Anisette provider that always answers immediately.
pub(crate) struct FakeAnisette {
    pub(crate) requests: Mutex<u32>,
}

impl FakeAnisette {
    pub(crate) fn new() -> Self {
        Self {
            requests: Mutex::new(0),
        }
    }
}

#[async_trait]
impl AnisetteProvider for FakeAnisette {
    async fn fetch_anisette_data(&self) -> Result<AnisetteData, SideloadError> {
        *self.requests.lock().unwrap() += 1;
        Ok(sample_anisette())
    }
}

pub(crate) struct SignerInvocation {
    pub(crate) bundle: PathBuf,
    pub(crate) profile_bundle_ids: Vec<String>,
    pub(crate) entitlement_keys: Vec<String>,
}

/// Signer that records invocations and touches nothing.
pub(crate) struct FakeSigner {
    pub(crate) invocations: Mutex<Vec<SignerInvocation>>,
}

impl FakeSigner {
    pub(crate) fn new() -> Self {
        Self {
            invocations: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl CodeSigner for FakeSigner {
    async fn sign(
        &self,
        bundle: &Path,
        _certificate: &Certificate,
        profiles: &[ProvisioningProfile],
        entitlements: &HashMap<String, String>,
    ) -> Result<(), SideloadError> {
        self.invocations.lock().unwrap().push(SignerInvocation {
            bundle: bundle.to_path_buf(),
            profile_bundle_ids: profiles
                .iter()
                .map(|profile| profile.bundle_identifier.clone())
                .collect(),
            entitlement_keys: entitlements.keys().cloned().collect(),
        });

        Ok(())
    }
}

struct NoTwoFactor;

#[async_trait]
impl TwoFactorHandler for NoTwoFactor {
    async fn verification_code(&self) -> Option<String> {
        None
    }
}

pub(crate) fn no_two_factor() -> Arc<dyn TwoFactorHandler> {
    Arc::new(NoTwoFactor)
}
