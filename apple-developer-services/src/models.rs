// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Entities managed through Apple's developer services.

use {
    crate::error::DeveloperServicesError,
    plist::Value,
    x509_certificate::CapturedX509Certificate,
};

/// Developer program membership classes, in selection-precedence order.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TeamKind {
    Individual,
    Free,
    Organization,
    Enterprise,
}

/// An Apple Developer Program team.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Team {
    pub identifier: String,
    pub name: String,
    pub kind: TeamKind,
}

impl Team {
    pub(crate) fn from_response(dict: &plist::Dictionary) -> Result<Self, DeveloperServicesError> {
        let identifier = string_field(dict, "teamId")?;
        let name = string_field(dict, "name")?;

        let type_string = dict
            .get("type")
            .and_then(Value::as_string)
            .unwrap_or_default();

        let is_free = dict
            .get("memberships")
            .and_then(Value::as_array)
            .map(|memberships| {
                memberships.iter().any(|membership| {
                    membership
                        .as_dictionary()
                        .and_then(|d| d.get("name"))
                        .and_then(Value::as_string)
                        .map(|name| name.to_lowercase().contains("free"))
                        .unwrap_or(false)
                })
            })
            .unwrap_or(false);

        let kind = match type_string {
            "Individual" => TeamKind::Individual,
            _ if is_free => TeamKind::Free,
            "In-House" => TeamKind::Enterprise,
            _ => TeamKind::Organization,
        };

        Ok(Self {
            identifier,
            name,
            kind,
        })
    }
}

/// An authenticated Apple ID identity.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Account {
    pub apple_id: String,
    pub identifier: String,
    pub first_name: String,
    pub last_name: String,
}

impl Account {
    pub fn name(&self) -> String {
        format!("{} {}", self.first_name, self.last_name)
            .trim()
            .to_string()
    }
}

/// Hardware families a device can belong to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DevicePlatform {
    Ios,
    Tvos,
}

impl DevicePlatform {
    /// Device classes reported by the services API for this platform.
    pub(crate) fn device_classes(&self) -> &'static [&'static str] {
        match self {
            Self::Ios => &["IPHONE", "IPAD", "IPOD"],
            Self::Tvos => &["TVOS"],
        }
    }
}

/// A hardware device registered (or registrable) with a team.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Device {
    /// The UDID.
    pub identifier: String,
    pub name: String,
    pub platform: DevicePlatform,
    pub os_version: Option<String>,
}

impl Device {
    pub(crate) fn from_response(dict: &plist::Dictionary) -> Result<Self, DeveloperServicesError> {
        let identifier = string_field(dict, "deviceNumber")?;
        let name = string_field(dict, "name")?;

        let platform = match dict.get("deviceClass").and_then(Value::as_string) {
            Some("TVOS") => DevicePlatform::Tvos,
            _ => DevicePlatform::Ios,
        };

        Ok(Self {
            identifier,
            name,
            platform,
            os_version: None,
        })
    }
}

/// A development signing certificate, optionally paired with its private key.
///
/// The private key only exists on the machine that requested the
/// certificate; Apple never returns it. Consumers persist the pair as an
/// encrypted PKCS#12 blob keyed by [`Certificate::machine_identifier`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Certificate {
    pub name: String,
    pub serial_number: String,
    /// Server-side record identifier, where known.
    pub identifier: Option<String>,
    /// Label of the machine that requested the certificate.
    pub machine_name: Option<String>,
    /// Opaque machine token, doubling as the p12 encryption password.
    pub machine_identifier: Option<String>,
    certificate_der: Option<Vec<u8>>,
    private_key_der: Option<Vec<u8>>,
}

impl Certificate {
    pub fn new(
        name: String,
        serial_number: String,
        identifier: Option<String>,
        machine_name: Option<String>,
        machine_identifier: Option<String>,
        certificate_der: Option<Vec<u8>>,
        private_key_der: Option<Vec<u8>>,
    ) -> Self {
        Self {
            name,
            serial_number,
            identifier,
            machine_name,
            machine_identifier,
            certificate_der,
            private_key_der,
        }
    }

    pub(crate) fn from_response(dict: &plist::Dictionary) -> Result<Self, DeveloperServicesError> {
        let attributes = dict
            .get("attributes")
            .and_then(Value::as_dictionary)
            .unwrap_or(dict);

        let name = string_field(attributes, "name")?;
        let serial_number = attributes
            .get("serialNumber")
            .or_else(|| attributes.get("serialNum"))
            .and_then(Value::as_string)
            .ok_or(DeveloperServicesError::MissingResponseField("serialNumber"))?
            .to_string();

        let certificate_der = attributes
            .get("certContent")
            .and_then(|value| match value {
                Value::Data(data) => Some(data.clone()),
                Value::String(encoded) => base64::decode(encoded.trim()).ok(),
                _ => None,
            });

        Ok(Self {
            name,
            serial_number,
            identifier: attributes
                .get("certificateId")
                .and_then(Value::as_string)
                .map(String::from),
            machine_name: attributes
                .get("machineName")
                .and_then(Value::as_string)
                .map(String::from),
            machine_identifier: attributes
                .get("machineId")
                .and_then(Value::as_string)
                .map(String::from),
            certificate_der,
            private_key_der: None,
        })
    }

    pub fn certificate_der(&self) -> Option<&[u8]> {
        self.certificate_der.as_deref()
    }

    /// PKCS#8 DER of the private key, if this instance holds one.
    pub fn private_key_der(&self) -> Option<&[u8]> {
        self.private_key_der.as_deref()
    }

    pub fn set_private_key_der(&mut self, der: Vec<u8>) {
        self.private_key_der = Some(der);
    }

    /// Parse a certificate + private key pair out of PKCS#12 data.
    ///
    /// Apple's export format wraps the certificate and a PKCS#8 shrouded
    /// key bag in regular data content info; both are decrypted with the
    /// same password. An empty password is legal.
    pub fn from_p12(data: &[u8], password: &str) -> Result<Self, DeveloperServicesError> {
        let pfx = p12::PFX::parse(data).map_err(|e| {
            DeveloperServicesError::PfxParseError(format!(
                "data does not appear to be PFX: {:?}",
                e
            ))
        })?;

        if !pfx.verify_mac(password) {
            return Err(DeveloperServicesError::PfxBadPassword);
        }

        let data = match pfx.auth_safe {
            p12::ContentInfo::Data(data) => data,
            _ => {
                return Err(DeveloperServicesError::PfxParseError(
                    "unexpected PFX content info".to_string(),
                ));
            }
        };

        let content_infos = yasna::parse_der(&data, |reader| {
            reader.collect_sequence_of(p12::ContentInfo::parse)
        })
        .map_err(|e| {
            DeveloperServicesError::PfxParseError(format!(
                "failed parsing inner ContentInfo: {:?}",
                e
            ))
        })?;

        let bmp_password = bmp_string(password);

        let mut certificate_der = None;
        let mut private_key_der = None;

        for content in content_infos {
            let bags_data = match content {
                p12::ContentInfo::Data(inner) => inner,
                p12::ContentInfo::EncryptedData(encrypted) => {
                    encrypted.data(&bmp_password).ok_or_else(|| {
                        DeveloperServicesError::PfxParseError(
                            "failed decrypting inner EncryptedData".to_string(),
                        )
                    })?
                }
                p12::ContentInfo::OtherContext(_) => {
                    return Err(DeveloperServicesError::PfxParseError(
                        "unexpected OtherContext content in inner PFX data".to_string(),
                    ));
                }
            };

            let bags = yasna::parse_ber(&bags_data, |reader| {
                reader.collect_sequence_of(p12::SafeBag::parse)
            })
            .map_err(|e| {
                DeveloperServicesError::PfxParseError(format!(
                    "failed parsing SafeBag within inner Data: {:?}",
                    e
                ))
            })?;

            for bag in bags {
                match bag.bag {
                    p12::SafeBagKind::CertBag(p12::CertBag::X509(cert_data)) => {
                        certificate_der = Some(cert_data);
                    }
                    p12::SafeBagKind::CertBag(p12::CertBag::SDSI(_)) => {
                        return Err(DeveloperServicesError::PfxParseError(
                            "unexpected SDSI certificate data".to_string(),
                        ));
                    }
                    p12::SafeBagKind::Pkcs8ShroudedKeyBag(key_bag) => {
                        let decrypted = key_bag.decrypt(&bmp_password).ok_or_else(|| {
                            DeveloperServicesError::PfxBadPassword
                        })?;

                        private_key_der = Some(decrypted);
                    }
                    p12::SafeBagKind::OtherBagKind(_) => {
                        return Err(DeveloperServicesError::PfxParseError(
                            "unexpected bag type in inner PFX content".to_string(),
                        ));
                    }
                }
            }
        }

        let certificate_der = certificate_der.ok_or_else(|| {
            DeveloperServicesError::PfxParseError(
                "failed to find x509 certificate in PFX data".to_string(),
            )
        })?;
        let private_key_der = private_key_der.ok_or_else(|| {
            DeveloperServicesError::PfxParseError(
                "failed to find signing key in PFX data".to_string(),
            )
        })?;

        let parsed = CapturedX509Certificate::from_der(certificate_der.clone())?;

        Ok(Self {
            name: parsed
                .subject_common_name()
                .unwrap_or_else(|| "Unknown".to_string()),
            serial_number: serial_number_hex(&parsed),
            identifier: None,
            machine_name: None,
            machine_identifier: None,
            certificate_der: Some(certificate_der),
            private_key_der: Some(private_key_der),
        })
    }

    /// Serialize certificate + private key to password-protected PKCS#12.
    ///
    /// Requires both halves to be present.
    pub fn encrypted_p12(&self, password: &str) -> Result<Vec<u8>, DeveloperServicesError> {
        let certificate = self.certificate_der.as_deref().ok_or_else(|| {
            DeveloperServicesError::PfxEncodeError("certificate data is missing".to_string())
        })?;
        let key = self.private_key_der.as_deref().ok_or_else(|| {
            DeveloperServicesError::PfxEncodeError("private key is missing".to_string())
        })?;

        let pfx = p12::PFX::new(certificate, key, None, password, &self.name).ok_or_else(|| {
            DeveloperServicesError::PfxEncodeError("failed assembling PFX structure".to_string())
        })?;

        Ok(pfx.to_der())
    }
}

/// Uppercase hex serial number without leading zero octets.
fn serial_number_hex(certificate: &CapturedX509Certificate) -> String {
    let bytes = certificate.serial_number_asn1().as_slice();
    let significant = match bytes.iter().position(|b| *b != 0) {
        Some(index) => &bytes[index..],
        None => bytes,
    };

    significant
        .iter()
        .map(|b| format!("{:02X}", b))
        .collect::<String>()
}

fn bmp_string(s: &str) -> Vec<u8> {
    let utf16: Vec<u16> = s.encode_utf16().collect();

    let mut bytes = Vec::with_capacity(utf16.len() * 2 + 2);
    for c in utf16 {
        bytes.push((c / 256) as u8);
        bytes.push((c % 256) as u8);
    }
    bytes.push(0x00);
    bytes.push(0x00);

    bytes
}

/// A server-side registration of a bundle identifier plus its capabilities.
#[derive(Clone, Debug, PartialEq)]
pub struct AppId {
    pub identifier: String,
    pub bundle_identifier: String,
    pub name: String,
    /// Capability key → plist-typed value, as stored by the service.
    pub features: plist::Dictionary,
}

impl AppId {
    pub(crate) fn from_response(dict: &plist::Dictionary) -> Result<Self, DeveloperServicesError> {
        Ok(Self {
            identifier: string_field(dict, "appIdId")?,
            bundle_identifier: string_field(dict, "identifier")?,
            name: string_field(dict, "name")?,
            features: dict
                .get("features")
                .and_then(Value::as_dictionary)
                .cloned()
                .unwrap_or_default(),
        })
    }
}

/// A shared app group container registration.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AppGroup {
    pub identifier: String,
    pub group_identifier: String,
    pub name: String,
}

impl AppGroup {
    pub(crate) fn from_response(dict: &plist::Dictionary) -> Result<Self, DeveloperServicesError> {
        Ok(Self {
            identifier: string_field(dict, "applicationGroup")?,
            group_identifier: string_field(dict, "identifier")?,
            name: string_field(dict, "name")?,
        })
    }
}

/// A provisioning profile binding an App ID, certificates, and devices.
#[derive(Clone, Debug, PartialEq)]
pub struct ProvisioningProfile {
    pub name: String,
    pub uuid: String,
    pub bundle_identifier: String,
    pub team_identifier: String,
    pub entitlements: plist::Dictionary,
    /// The raw signed profile, as embedded into app bundles.
    pub data: Vec<u8>,
}

impl ProvisioningProfile {
    /// Parse a raw `.mobileprovision` payload.
    ///
    /// Profiles are CMS-signed; the property list we care about is embedded
    /// verbatim between `<?xml` and `</plist>` markers, so the signature
    /// envelope is skipped rather than verified.
    pub fn from_encoded(data: &[u8]) -> Result<Self, DeveloperServicesError> {
        let start = find_subsequence(data, b"<?xml").ok_or_else(|| {
            DeveloperServicesError::MalformedProfile(
                "no embedded property list found".to_string(),
            )
        })?;
        let end = find_subsequence(&data[start..], b"</plist>").ok_or_else(|| {
            DeveloperServicesError::MalformedProfile(
                "embedded property list is truncated".to_string(),
            )
        })? + start
            + b"</plist>".len();

        let payload = Value::from_reader_xml(std::io::Cursor::new(&data[start..end]))?;
        let dict = payload.as_dictionary().ok_or_else(|| {
            DeveloperServicesError::MalformedProfile(
                "embedded property list is not a dictionary".to_string(),
            )
        })?;

        let entitlements = dict
            .get("Entitlements")
            .and_then(Value::as_dictionary)
            .cloned()
            .ok_or_else(|| {
                DeveloperServicesError::MalformedProfile("profile has no entitlements".to_string())
            })?;

        let application_identifier = entitlements
            .get("application-identifier")
            .and_then(Value::as_string)
            .ok_or_else(|| {
                DeveloperServicesError::MalformedProfile(
                    "entitlements lack an application identifier".to_string(),
                )
            })?;

        // The application identifier is "<team>.<bundle identifier>".
        let (team_identifier, bundle_identifier) =
            application_identifier.split_once('.').ok_or_else(|| {
                DeveloperServicesError::MalformedProfile(format!(
                    "unexpected application identifier format: {}",
                    application_identifier
                ))
            })?;

        Ok(Self {
            name: dict
                .get("Name")
                .and_then(Value::as_string)
                .unwrap_or_default()
                .to_string(),
            uuid: dict
                .get("UUID")
                .and_then(Value::as_string)
                .unwrap_or_default()
                .to_string(),
            bundle_identifier: bundle_identifier.to_string(),
            team_identifier: team_identifier.to_string(),
            entitlements,
            data: data.to_vec(),
        })
    }

    /// Load a profile from a `.mobileprovision` file on disk.
    pub fn from_file(path: &std::path::Path) -> Result<Self, DeveloperServicesError> {
        let data = std::fs::read(path)?;
        Self::from_encoded(&data)
    }

    /// App group identifiers granted by this profile's entitlements.
    pub fn app_group_identifiers(&self) -> Vec<String> {
        self.entitlements
            .get(crate::features::ENTITLEMENT_APP_GROUPS)
            .and_then(Value::as_array)
            .map(|groups| {
                groups
                    .iter()
                    .filter_map(|value| value.as_string().map(String::from))
                    .collect()
            })
            .unwrap_or_default()
    }
}

fn find_subsequence(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

fn string_field(
    dict: &plist::Dictionary,
    key: &'static str,
) -> Result<String, DeveloperServicesError> {
    dict.get(key)
        .and_then(Value::as_string)
        .map(String::from)
        .ok_or(DeveloperServicesError::MissingResponseField(key))
}
