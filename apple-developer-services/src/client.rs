// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! HTTP client for Apple's developer services provisioning API.
//!
//! The services speak XML property lists over HTTPS. Every request body
//! carries a client identifier, protocol version, and request token; every
//! authenticated request additionally carries session and anisette headers.
//! Responses share a common envelope with a `resultCode` and human-readable
//! strings, which [`DeveloperServicesClient`] normalizes before parsing the
//! payload.

use {
    crate::{
        anisette::AnisetteData,
        certificate_request::CertificateSigningRequest,
        error::DeveloperServicesError,
        models::{
            Account, AppGroup, AppId, Certificate, Device, DevicePlatform, ProvisioningProfile,
            Team,
        },
        session::DeveloperSession,
    },
    async_trait::async_trait,
    log::{debug, error},
    plist::Value,
    uuid::Uuid,
};

const BASE_URL: &str = "https://developerservices2.apple.com/services/QH65B2";
const AUTH_URL: &str = "https://gsa.apple.com/grandslam/GsService2";

/// Client identifier Apple's services associate with developer tooling.
const CLIENT_ID: &str = "XABBG36SBA";
const PROTOCOL_VERSION: &str = "QH65B2";

const RESULT_CODE_INCORRECT_CREDENTIALS: i64 = -22406;
const RESULT_CODE_SECONDARY_AUTH_REQUIRED: i64 = 409;
const RESULT_CODE_INCORRECT_VERIFICATION_CODE: i64 = -21669;
const RESULT_CODE_INVALID_SESSION: i64 = -20101;

/// Supplies a secondary-authentication verification code on demand.
///
/// Returning `None` abandons the sign-in, which surfaces as
/// [`DeveloperServicesError::RequiresTwoFactorAuthentication`].
#[async_trait]
pub trait TwoFactorHandler: Send + Sync {
    async fn verification_code(&self) -> Option<String>;
}

/// The developer services operations the signing pipeline depends on.
///
/// Modeled as a trait so orchestration code takes an explicit dependency it
/// can exercise against fakes; [`DeveloperServicesClient`] is the production
/// implementation.
#[async_trait]
pub trait DeveloperApiClient: Send + Sync {
    async fn authenticate(
        &self,
        apple_id: &str,
        password: &str,
        anisette: &AnisetteData,
        two_factor: &dyn TwoFactorHandler,
    ) -> Result<(Account, DeveloperSession), DeveloperServicesError>;

    async fn fetch_teams(
        &self,
        session: &DeveloperSession,
    ) -> Result<Vec<Team>, DeveloperServicesError>;

    async fn fetch_certificates(
        &self,
        team: &Team,
        session: &DeveloperSession,
    ) -> Result<Vec<Certificate>, DeveloperServicesError>;

    async fn add_certificate(
        &self,
        machine_name: &str,
        team: &Team,
        session: &DeveloperSession,
    ) -> Result<Certificate, DeveloperServicesError>;

    async fn revoke_certificate(
        &self,
        certificate: &Certificate,
        team: &Team,
        session: &DeveloperSession,
    ) -> Result<(), DeveloperServicesError>;

    async fn fetch_devices(
        &self,
        team: &Team,
        platform: DevicePlatform,
        session: &DeveloperSession,
    ) -> Result<Vec<Device>, DeveloperServicesError>;

    async fn register_device(
        &self,
        name: &str,
        identifier: &str,
        platform: DevicePlatform,
        team: &Team,
        session: &DeveloperSession,
    ) -> Result<Device, DeveloperServicesError>;

    async fn fetch_app_ids(
        &self,
        team: &Team,
        session: &DeveloperSession,
    ) -> Result<Vec<AppId>, DeveloperServicesError>;

    async fn add_app_id(
        &self,
        name: &str,
        bundle_identifier: &str,
        team: &Team,
        session: &DeveloperSession,
    ) -> Result<AppId, DeveloperServicesError>;

    async fn update_app_id(
        &self,
        app_id: &AppId,
        team: &Team,
        session: &DeveloperSession,
    ) -> Result<AppId, DeveloperServicesError>;

    async fn fetch_app_groups(
        &self,
        team: &Team,
        session: &DeveloperSession,
    ) -> Result<Vec<AppGroup>, DeveloperServicesError>;

    async fn add_app_group(
        &self,
        name: &str,
        group_identifier: &str,
        team: &Team,
        session: &DeveloperSession,
    ) -> Result<AppGroup, DeveloperServicesError>;

    async fn assign_app_groups(
        &self,
        app_id: &AppId,
        groups: &[AppGroup],
        team: &Team,
        session: &DeveloperSession,
    ) -> Result<(), DeveloperServicesError>;

    async fn fetch_provisioning_profile(
        &self,
        app_id: &AppId,
        platform: DevicePlatform,
        team: &Team,
        session: &DeveloperSession,
    ) -> Result<ProvisioningProfile, DeveloperServicesError>;
}

/// A client for Apple's developer services provisioning API.
pub struct DeveloperServicesClient {
    client: reqwest::Client,
    base_url: String,
    auth_url: String,
}

impl Default for DeveloperServicesClient {
    fn default() -> Self {
        Self::new()
    }
}

impl DeveloperServicesClient {
    pub fn new() -> Self {
        Self::with_base_urls(BASE_URL.to_string(), AUTH_URL.to_string())
    }

    /// Construct an instance speaking to non-default endpoints.
    pub fn with_base_urls(base_url: String, auth_url: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url,
            auth_url,
        }
    }

    fn platform_prefix(platform: DevicePlatform) -> &'static str {
        match platform {
            DevicePlatform::Ios => "ios",
            DevicePlatform::Tvos => "tvos",
        }
    }

    /// Assemble the common request body envelope.
    fn request_body(team: Option<&Team>, extra: plist::Dictionary) -> plist::Dictionary {
        let mut body = plist::Dictionary::new();
        body.insert("clientId".into(), Value::String(CLIENT_ID.into()));
        body.insert(
            "protocolVersion".into(),
            Value::String(PROTOCOL_VERSION.into()),
        );
        body.insert(
            "requestId".into(),
            Value::String(Uuid::new_v4().to_string().to_uppercase()),
        );
        body.insert(
            "userLocale".into(),
            Value::Array(vec![Value::String("en_US".into())]),
        );

        if let Some(team) = team {
            body.insert("teamId".into(), Value::String(team.identifier.clone()));
        }

        for (key, value) in extra {
            body.insert(key, value);
        }

        body
    }

    async fn send_request(
        &self,
        url: &str,
        session: &DeveloperSession,
        team: Option<&Team>,
        extra: plist::Dictionary,
    ) -> Result<plist::Dictionary, DeveloperServicesError> {
        let body = Self::request_body(team, extra);

        let mut encoded = Vec::new();
        Value::Dictionary(body).to_writer_xml(&mut encoded)?;

        debug!("POST {}", url);

        let mut request = self
            .client
            .post(url)
            .header("Content-Type", "text/x-xml-plist")
            .header("Accept", "text/x-xml-plist")
            .header("Accept-Language", "en-us")
            .header("User-Agent", "Xcode")
            .header("X-Xcode-Version", "11.2 (11B41)")
            .header("X-Apple-I-Identity-Id", &session.dsid)
            .header("X-Apple-GS-Token", &session.auth_token)
            .body(encoded);

        for (name, value) in session.anisette_data().headers() {
            request = request.header(name, value);
        }

        let response = request.send().await?;

        if !response.status().is_success() {
            error!("HTTP error from {}", url);

            let body = response.bytes().await?;
            error!("{}", String::from_utf8_lossy(body.as_ref()));

            return Err(DeveloperServicesError::UnknownResponse);
        }

        let bytes = response.bytes().await?;
        let value = Value::from_reader(std::io::Cursor::new(bytes.as_ref()))?;

        let dict = match value {
            Value::Dictionary(dict) => dict,
            _ => return Err(DeveloperServicesError::UnknownResponse),
        };

        self.process_response(dict)
    }

    /// Validate the common response envelope and surface service failures.
    fn process_response(
        &self,
        dict: plist::Dictionary,
    ) -> Result<plist::Dictionary, DeveloperServicesError> {
        match result_code(&dict) {
            Some(0) => Ok(dict),
            Some(RESULT_CODE_INVALID_SESSION) => Err(DeveloperServicesError::InvalidSession),
            Some(code) => Err(DeveloperServicesError::ServiceFailure {
                code,
                message: result_message(&dict),
            }),
            None => Err(DeveloperServicesError::UnknownResponse),
        }
    }

    async fn authenticate_once(
        &self,
        apple_id: &str,
        password: &str,
        anisette: &AnisetteData,
    ) -> Result<plist::Dictionary, DeveloperServicesError> {
        let url = format!("{}/authenticate", self.auth_url);

        let mut extra = plist::Dictionary::new();
        extra.insert("appleId".into(), Value::String(apple_id.into()));
        extra.insert("password".into(), Value::String(password.into()));

        let body = Self::request_body(None, extra);

        let mut encoded = Vec::new();
        Value::Dictionary(body).to_writer_xml(&mut encoded)?;

        debug!("POST {}", url);

        let mut request = self
            .client
            .post(&url)
            .header("Content-Type", "text/x-xml-plist")
            .header("Accept", "text/x-xml-plist")
            .header("Accept-Language", "en-us")
            .header("User-Agent", "Xcode")
            .body(encoded);

        for (name, value) in anisette.headers() {
            request = request.header(name, value);
        }

        let response = request.send().await?;
        let bytes = response.bytes().await?;
        let value = Value::from_reader(std::io::Cursor::new(bytes.as_ref()))?;

        match value {
            Value::Dictionary(dict) => Ok(dict),
            _ => Err(DeveloperServicesError::UnknownResponse),
        }
    }
}

#[async_trait]
impl DeveloperApiClient for DeveloperServicesClient {
    async fn authenticate(
        &self,
        apple_id: &str,
        password: &str,
        anisette: &AnisetteData,
        two_factor: &dyn TwoFactorHandler,
    ) -> Result<(Account, DeveloperSession), DeveloperServicesError> {
        let mut response = self.authenticate_once(apple_id, password, anisette).await?;

        match result_code(&response) {
            Some(0) => {}
            Some(RESULT_CODE_INCORRECT_CREDENTIALS) => {
                return Err(DeveloperServicesError::IncorrectCredentials);
            }
            Some(RESULT_CODE_SECONDARY_AUTH_REQUIRED) => {
                // A trusted device has been shown a verification code. The
                // legacy endpoint accepts it appended to the password.
                let code = two_factor.verification_code().await.ok_or(
                    DeveloperServicesError::RequiresTwoFactorAuthentication,
                )?;

                let retry_password = format!("{}{}", password, code);
                response = self
                    .authenticate_once(apple_id, &retry_password, anisette)
                    .await?;

                match result_code(&response) {
                    Some(0) => {}
                    Some(RESULT_CODE_INCORRECT_VERIFICATION_CODE) => {
                        return Err(DeveloperServicesError::IncorrectVerificationCode);
                    }
                    Some(code) => {
                        return Err(DeveloperServicesError::ServiceFailure {
                            code,
                            message: result_message(&response),
                        });
                    }
                    None => return Err(DeveloperServicesError::UnknownResponse),
                }
            }
            Some(code) => {
                return Err(DeveloperServicesError::ServiceFailure {
                    code,
                    message: result_message(&response),
                });
            }
            None => return Err(DeveloperServicesError::UnknownResponse),
        }

        let dsid = response
            .get("dsPersonId")
            .and_then(Value::as_string)
            .ok_or(DeveloperServicesError::MissingResponseField("dsPersonId"))?
            .to_string();
        let auth_token = response
            .get("sessionToken")
            .and_then(Value::as_string)
            .ok_or(DeveloperServicesError::MissingResponseField("sessionToken"))?
            .to_string();

        let account = Account {
            apple_id: apple_id.to_string(),
            identifier: dsid.clone(),
            first_name: response
                .get("firstName")
                .and_then(Value::as_string)
                .unwrap_or_default()
                .to_string(),
            last_name: response
                .get("lastName")
                .and_then(Value::as_string)
                .unwrap_or_default()
                .to_string(),
        };

        let session = DeveloperSession::new(dsid, auth_token, anisette.clone());

        Ok((account, session))
    }

    async fn fetch_teams(
        &self,
        session: &DeveloperSession,
    ) -> Result<Vec<Team>, DeveloperServicesError> {
        let url = format!("{}/listTeams.action", self.base_url);
        let response = self
            .send_request(&url, session, None, plist::Dictionary::new())
            .await?;

        array_field(&response, "teams")?
            .iter()
            .filter_map(Value::as_dictionary)
            .map(Team::from_response)
            .collect()
    }

    async fn fetch_certificates(
        &self,
        team: &Team,
        session: &DeveloperSession,
    ) -> Result<Vec<Certificate>, DeveloperServicesError> {
        let url = format!("{}/ios/listAllDevelopmentCerts.action", self.base_url);
        let response = self
            .send_request(&url, session, Some(team), plist::Dictionary::new())
            .await?;

        array_field(&response, "certificates")
            .or_else(|_| array_field(&response, "certRequests"))?
            .iter()
            .filter_map(Value::as_dictionary)
            .map(Certificate::from_response)
            .collect()
    }

    async fn add_certificate(
        &self,
        machine_name: &str,
        team: &Team,
        session: &DeveloperSession,
    ) -> Result<Certificate, DeveloperServicesError> {
        let request = CertificateSigningRequest::generate(machine_name)?;

        let url = format!("{}/ios/submitDevelopmentCSR.action", self.base_url);

        let mut extra = plist::Dictionary::new();
        extra.insert("csrContent".into(), Value::String(request.csr_pem.clone()));
        extra.insert(
            "machineId".into(),
            Value::String(Uuid::new_v4().to_string().to_uppercase()),
        );
        extra.insert("machineName".into(), Value::String(machine_name.into()));

        let response = self.send_request(&url, session, Some(team), extra).await?;

        let cert_request = response
            .get("certRequest")
            .and_then(Value::as_dictionary)
            .ok_or(DeveloperServicesError::MissingResponseField("certRequest"))?;

        let mut certificate = Certificate::from_response(cert_request)?;
        certificate.set_private_key_der(request.private_key_der);

        Ok(certificate)
    }

    async fn revoke_certificate(
        &self,
        certificate: &Certificate,
        team: &Team,
        session: &DeveloperSession,
    ) -> Result<(), DeveloperServicesError> {
        let url = format!("{}/ios/revokeDevelopmentCert.action", self.base_url);

        let mut extra = plist::Dictionary::new();
        extra.insert(
            "serialNumber".into(),
            Value::String(certificate.serial_number.clone()),
        );

        self.send_request(&url, session, Some(team), extra).await?;

        Ok(())
    }

    async fn fetch_devices(
        &self,
        team: &Team,
        platform: DevicePlatform,
        session: &DeveloperSession,
    ) -> Result<Vec<Device>, DeveloperServicesError> {
        let url = format!(
            "{}/{}/listDevices.action",
            self.base_url,
            Self::platform_prefix(platform)
        );
        let response = self
            .send_request(&url, session, Some(team), plist::Dictionary::new())
            .await?;

        let devices = array_field(&response, "devices")?
            .iter()
            .filter_map(Value::as_dictionary)
            .filter(|dict| {
                dict.get("deviceClass")
                    .and_then(Value::as_string)
                    .map(|class| platform.device_classes().contains(&class))
                    // Some records omit the class; treat them as matching.
                    .unwrap_or(true)
            })
            .map(Device::from_response)
            .collect::<Result<Vec<_>, _>>()?;

        Ok(devices)
    }

    async fn register_device(
        &self,
        name: &str,
        identifier: &str,
        platform: DevicePlatform,
        team: &Team,
        session: &DeveloperSession,
    ) -> Result<Device, DeveloperServicesError> {
        let url = format!(
            "{}/{}/addDevice.action",
            self.base_url,
            Self::platform_prefix(platform)
        );

        let mut extra = plist::Dictionary::new();
        extra.insert("deviceNumber".into(), Value::String(identifier.into()));
        extra.insert("name".into(), Value::String(name.into()));

        let response = self.send_request(&url, session, Some(team), extra).await?;

        let device = response
            .get("device")
            .and_then(Value::as_dictionary)
            .ok_or(DeveloperServicesError::MissingResponseField("device"))?;

        Device::from_response(device)
    }

    async fn fetch_app_ids(
        &self,
        team: &Team,
        session: &DeveloperSession,
    ) -> Result<Vec<AppId>, DeveloperServicesError> {
        let url = format!("{}/ios/listAppIds.action", self.base_url);
        let response = self
            .send_request(&url, session, Some(team), plist::Dictionary::new())
            .await?;

        array_field(&response, "appIds")?
            .iter()
            .filter_map(Value::as_dictionary)
            .map(AppId::from_response)
            .collect()
    }

    async fn add_app_id(
        &self,
        name: &str,
        bundle_identifier: &str,
        team: &Team,
        session: &DeveloperSession,
    ) -> Result<AppId, DeveloperServicesError> {
        let url = format!("{}/ios/addAppId.action", self.base_url);

        let mut extra = plist::Dictionary::new();
        extra.insert("identifier".into(), Value::String(bundle_identifier.into()));
        extra.insert("name".into(), Value::String(name.into()));

        let response = self.send_request(&url, session, Some(team), extra).await?;

        let app_id = response
            .get("appId")
            .and_then(Value::as_dictionary)
            .ok_or(DeveloperServicesError::MissingResponseField("appId"))?;

        AppId::from_response(app_id)
    }

    async fn update_app_id(
        &self,
        app_id: &AppId,
        team: &Team,
        session: &DeveloperSession,
    ) -> Result<AppId, DeveloperServicesError> {
        let url = format!("{}/ios/updateAppId.action", self.base_url);

        let mut extra = plist::Dictionary::new();
        extra.insert("appIdId".into(), Value::String(app_id.identifier.clone()));
        extra.insert(
            "features".into(),
            Value::Dictionary(app_id.features.clone()),
        );

        let response = self.send_request(&url, session, Some(team), extra).await?;

        let updated = response
            .get("appId")
            .and_then(Value::as_dictionary)
            .ok_or(DeveloperServicesError::MissingResponseField("appId"))?;

        AppId::from_response(updated)
    }

    async fn fetch_app_groups(
        &self,
        team: &Team,
        session: &DeveloperSession,
    ) -> Result<Vec<AppGroup>, DeveloperServicesError> {
        let url = format!("{}/ios/listApplicationGroups.action", self.base_url);
        let response = self
            .send_request(&url, session, Some(team), plist::Dictionary::new())
            .await?;

        array_field(&response, "applicationGroupList")?
            .iter()
            .filter_map(Value::as_dictionary)
            .map(AppGroup::from_response)
            .collect()
    }

    async fn add_app_group(
        &self,
        name: &str,
        group_identifier: &str,
        team: &Team,
        session: &DeveloperSession,
    ) -> Result<AppGroup, DeveloperServicesError> {
        let url = format!("{}/ios/addApplicationGroup.action", self.base_url);

        let mut extra = plist::Dictionary::new();
        extra.insert("identifier".into(), Value::String(group_identifier.into()));
        extra.insert("name".into(), Value::String(name.into()));

        let response = self.send_request(&url, session, Some(team), extra).await?;

        let group = response
            .get("applicationGroup")
            .and_then(Value::as_dictionary)
            .ok_or(DeveloperServicesError::MissingResponseField(
                "applicationGroup",
            ))?;

        AppGroup::from_response(group)
    }

    async fn assign_app_groups(
        &self,
        app_id: &AppId,
        groups: &[AppGroup],
        team: &Team,
        session: &DeveloperSession,
    ) -> Result<(), DeveloperServicesError> {
        let url = format!(
            "{}/ios/assignApplicationGroupToAppId.action",
            self.base_url
        );

        let mut extra = plist::Dictionary::new();
        extra.insert("appIdId".into(), Value::String(app_id.identifier.clone()));
        extra.insert(
            "applicationGroups".into(),
            Value::Array(
                groups
                    .iter()
                    .map(|group| Value::String(group.identifier.clone()))
                    .collect(),
            ),
        );

        self.send_request(&url, session, Some(team), extra).await?;

        Ok(())
    }

    async fn fetch_provisioning_profile(
        &self,
        app_id: &AppId,
        platform: DevicePlatform,
        team: &Team,
        session: &DeveloperSession,
    ) -> Result<ProvisioningProfile, DeveloperServicesError> {
        let url = format!(
            "{}/{}/downloadTeamProvisioningProfile.action",
            self.base_url,
            Self::platform_prefix(platform)
        );

        let mut extra = plist::Dictionary::new();
        extra.insert("appIdId".into(), Value::String(app_id.identifier.clone()));

        let response = self.send_request(&url, session, Some(team), extra).await?;

        let profile = response
            .get("provisioningProfile")
            .and_then(Value::as_dictionary)
            .ok_or(DeveloperServicesError::MissingResponseField(
                "provisioningProfile",
            ))?;

        let encoded = profile
            .get("encodedProfile")
            .and_then(|value| match value {
                Value::Data(data) => Some(data.clone()),
                Value::String(encoded) => base64::decode(encoded.trim()).ok(),
                _ => None,
            })
            .ok_or(DeveloperServicesError::MissingResponseField(
                "encodedProfile",
            ))?;

        ProvisioningProfile::from_encoded(&encoded)
    }
}

fn result_code(dict: &plist::Dictionary) -> Option<i64> {
    match dict.get("resultCode") {
        Some(Value::String(s)) => s.parse().ok(),
        Some(value) => value.as_signed_integer(),
        None => None,
    }
}

fn result_message(dict: &plist::Dictionary) -> String {
    dict.get("userString")
        .or_else(|| dict.get("resultString"))
        .and_then(Value::as_string)
        .unwrap_or("unknown error")
        .to_string()
}

fn array_field<'a>(
    dict: &'a plist::Dictionary,
    key: &'static str,
) -> Result<&'a Vec<Value>, DeveloperServicesError> {
    dict.get(key)
        .and_then(Value::as_array)
        .ok_or(DeveloperServicesError::MissingResponseField(key))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn result_code_accepts_integer_and_string() {
        let mut dict = plist::Dictionary::new();
        dict.insert("resultCode".into(), Value::Integer(0.into()));
        assert_eq!(result_code(&dict), Some(0));

        dict.insert("resultCode".into(), Value::String("7460".into()));
        assert_eq!(result_code(&dict), Some(7460));

        dict.insert("resultCode".into(), Value::Boolean(true));
        assert_eq!(result_code(&dict), None);
    }

    #[test]
    fn envelope_failure_carries_user_string() {
        let client = DeveloperServicesClient::new();

        let mut dict = plist::Dictionary::new();
        dict.insert("resultCode".into(), Value::Integer(7460.into()));
        dict.insert(
            "userString".into(),
            Value::String("You already have a current iOS Development certificate.".into()),
        );

        match client.process_response(dict) {
            Err(DeveloperServicesError::ServiceFailure { code, message }) => {
                assert_eq!(code, 7460);
                assert!(message.starts_with("You already have"));
            }
            other => panic!("unexpected result: {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn envelope_without_result_code_is_unknown() {
        let client = DeveloperServicesClient::new();

        assert!(matches!(
            client.process_response(plist::Dictionary::new()),
            Err(DeveloperServicesError::UnknownResponse)
        ));
    }

    #[test]
    fn request_body_carries_envelope_fields() {
        let team = Team {
            identifier: "6053B555".into(),
            name: "Jane".into(),
            kind: crate::models::TeamKind::Individual,
        };

        let body = DeveloperServicesClient::request_body(Some(&team), plist::Dictionary::new());

        assert_eq!(
            body.get("clientId").and_then(Value::as_string),
            Some(CLIENT_ID)
        );
        assert_eq!(
            body.get("teamId").and_then(Value::as_string),
            Some("6053B555")
        );
        assert!(body.get("requestId").is_some());
    }
}
