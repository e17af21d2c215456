// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Application bundle handling.
//!
//! An `.ipa` is a zip archive holding `Payload/<name>.app`. The app bundle
//! in turn may nest app extensions under `PlugIns/*.appex`, each a bundle
//! of its own with its own identifier and entitlements. Re-signing mutates
//! bundles in place: identifiers and group metadata are rewritten into
//! `Info.plist` before the signer runs.

use {
    crate::{error::SideloadError, macho},
    apple_developer_services::ProvisioningProfile,
    log::debug,
    plist::Value,
    std::{
        io::{Read, Write},
        path::{Path, PathBuf},
    },
    walkdir::WalkDir,
};

/// Info.plist key recording the app groups assigned during re-signing.
pub const INFO_KEY_APP_GROUPS: &str = "AppGroups";

const INFO_KEY_BUNDLE_IDENTIFIER: &str = "CFBundleIdentifier";
const INFO_KEY_URL_TYPES: &str = "CFBundleURLTypes";

/// A parsed app or app-extension bundle on disk.
#[derive(Clone, Debug)]
pub struct Application {
    path: PathBuf,
    info: plist::Dictionary,
    entitlements: plist::Dictionary,
}

impl Application {
    /// Parse the bundle rooted at `path`.
    pub fn new(path: impl Into<PathBuf>) -> Result<Self, SideloadError> {
        let path = path.into();
        let info_path = path.join("Info.plist");

        if !info_path.is_file() {
            return Err(SideloadError::InvalidApp(format!(
                "no Info.plist in {}",
                path.display()
            )));
        }

        let info = Value::from_file(&info_path)
            .map_err(|e| SideloadError::InvalidApp(format!("unreadable Info.plist: {}", e)))?
            .into_dictionary()
            .ok_or_else(|| {
                SideloadError::InvalidApp("Info.plist is not a dictionary".to_string())
            })?;

        if info
            .get(INFO_KEY_BUNDLE_IDENTIFIER)
            .and_then(Value::as_string)
            .is_none()
        {
            return Err(SideloadError::BundleNoIdentifier(path));
        }

        let entitlements = match executable_path(&path, &info) {
            Some(executable) => macho::executable_entitlements(&executable).unwrap_or_else(|e| {
                debug!(
                    "no entitlements read from {}: {}",
                    executable.display(),
                    e
                );
                plist::Dictionary::new()
            }),
            None => plist::Dictionary::new(),
        };

        Ok(Self {
            path,
            info,
            entitlements,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn bundle_identifier(&self) -> String {
        self.info
            .get(INFO_KEY_BUNDLE_IDENTIFIER)
            .and_then(Value::as_string)
            .expect("bundle identifier was validated during parsing")
            .to_string()
    }

    pub fn name(&self) -> String {
        self.info
            .get("CFBundleDisplayName")
            .or_else(|| self.info.get("CFBundleName"))
            .and_then(Value::as_string)
            .map(String::from)
            .unwrap_or_else(|| {
                self.path
                    .file_stem()
                    .map(|stem| stem.to_string_lossy().to_string())
                    .unwrap_or_default()
            })
    }

    pub fn entitlements(&self) -> &plist::Dictionary {
        &self.entitlements
    }

    /// App group identifiers declared by the bundle's entitlements.
    pub fn app_group_identifiers(&self) -> Vec<String> {
        self.entitlements
            .get(apple_developer_services::features::ENTITLEMENT_APP_GROUPS)
            .and_then(Value::as_array)
            .map(|groups| {
                groups
                    .iter()
                    .filter_map(|value| value.as_string().map(String::from))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Parse the app extensions nested under `PlugIns/`.
    pub fn app_extensions(&self) -> Result<Vec<Application>, SideloadError> {
        let plugins = self.path.join("PlugIns");
        if !plugins.is_dir() {
            return Ok(Vec::new());
        }

        let mut extensions = Vec::new();

        for entry in std::fs::read_dir(&plugins)? {
            let path = entry?.path();

            if path.extension().map(|ext| ext == "appex").unwrap_or(false) {
                extensions.push(Application::new(path)?);
            }
        }

        // Directory iteration order is platform-defined.
        extensions.sort_by(|a, b| a.path.cmp(&b.path));

        Ok(extensions)
    }

    /// Rewrite bundle metadata ahead of signing.
    ///
    /// The bundle identifier becomes the profile's embedded identifier, the
    /// existing URL types are carried forward verbatim, and the profile's
    /// app groups are recorded so the running app can locate its adjusted
    /// containers.
    pub fn prepare_for_signing(
        &self,
        profile: &ProvisioningProfile,
    ) -> Result<(), SideloadError> {
        let mut info = self.info.clone();

        info.insert(
            INFO_KEY_BUNDLE_IDENTIFIER.to_string(),
            Value::String(profile.bundle_identifier.clone()),
        );

        let url_types = info
            .get(INFO_KEY_URL_TYPES)
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        info.insert(INFO_KEY_URL_TYPES.to_string(), Value::Array(url_types));

        let groups = profile.app_group_identifiers();
        if !groups.is_empty() {
            info.insert(
                INFO_KEY_APP_GROUPS.to_string(),
                Value::Array(groups.into_iter().map(Value::String).collect()),
            );
        }

        Value::Dictionary(info).to_file_xml(self.path.join("Info.plist"))?;

        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn synthetic(
        path: PathBuf,
        info: plist::Dictionary,
        entitlements: plist::Dictionary,
    ) -> Self {
        Self {
            path,
            info,
            entitlements,
        }
    }
}

fn executable_path(bundle: &Path, info: &plist::Dictionary) -> Option<PathBuf> {
    info.get("CFBundleExecutable")
        .and_then(Value::as_string)
        .map(|name| bundle.join(name))
}

/// Extract an `.ipa` archive and locate the payload application.
pub fn unzip_app_bundle(ipa: &Path, directory: &Path) -> Result<Application, SideloadError> {
    std::fs::create_dir_all(directory)?;

    let file = std::fs::File::open(ipa)?;
    let mut archive = zip::ZipArchive::new(file)?;

    for index in 0..archive.len() {
        let mut entry = archive.by_index(index)?;

        let relative = match entry.enclosed_name() {
            Some(name) => name.to_path_buf(),
            None => continue,
        };
        let destination = directory.join(relative);

        if entry.is_dir() {
            std::fs::create_dir_all(&destination)?;
            continue;
        }

        if let Some(parent) = destination.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let mut output = std::fs::File::create(&destination)?;
        std::io::copy(&mut entry, &mut output)?;

        #[cfg(unix)]
        if let Some(mode) = entry.unix_mode() {
            use std::os::unix::fs::PermissionsExt;

            std::fs::set_permissions(&destination, std::fs::Permissions::from_mode(mode))?;
        }
    }

    let payload = directory.join("Payload");

    for entry in std::fs::read_dir(&payload).map_err(|_| {
        SideloadError::IpaNoPayload(ipa.to_path_buf())
    })? {
        let path = entry?.path();

        if path.extension().map(|ext| ext == "app").unwrap_or(false) {
            return Application::new(path);
        }
    }

    Err(SideloadError::IpaNoPayload(ipa.to_path_buf()))
}

/// Pack a signed `.app` bundle back into an `.ipa` archive.
pub fn archive_app_bundle(app: &Path, output: &Path) -> Result<(), SideloadError> {
    let app_name = app
        .file_name()
        .ok_or_else(|| SideloadError::InvalidApp("app path has no file name".to_string()))?
        .to_string_lossy()
        .to_string();

    if let Some(parent) = output.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let file = std::fs::File::create(output)?;
    let mut writer = zip::ZipWriter::new(file);

    let directory_options = zip::write::FileOptions::default();

    writer.add_directory(format!("Payload/{}/", app_name), directory_options)?;

    for entry in WalkDir::new(app).min_depth(1) {
        let entry = entry.map_err(|e| {
            SideloadError::InvalidApp(format!("error walking bundle: {}", e))
        })?;

        let relative = entry
            .path()
            .strip_prefix(app)
            .expect("walked entries live under the bundle root");
        let archived = format!("Payload/{}/{}", app_name, relative.to_string_lossy());

        if entry.file_type().is_dir() {
            writer.add_directory(format!("{}/", archived), directory_options)?;
            continue;
        }

        let mut options = zip::write::FileOptions::default();

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;

            options = options.unix_permissions(entry.metadata().map(|m| m.permissions().mode()).unwrap_or(0o644));
        }

        writer.start_file(archived, options)?;

        let mut input = std::fs::File::open(entry.path())?;
        let mut buffer = Vec::new();
        input.read_to_end(&mut buffer)?;
        writer.write_all(&buffer)?;
    }

    writer.finish()?;

    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    fn write_info_plist(dir: &Path, bundle_id: &str, name: &str) {
        let mut info = plist::Dictionary::new();
        info.insert(
            "CFBundleIdentifier".into(),
            Value::String(bundle_id.into()),
        );
        info.insert("CFBundleName".into(), Value::String(name.into()));

        Value::Dictionary(info)
            .to_file_xml(dir.join("Info.plist"))
            .unwrap();
    }

    fn make_app(root: &Path) -> PathBuf {
        let app = root.join("Example.app");
        std::fs::create_dir_all(&app).unwrap();
        write_info_plist(&app, "com.example.app", "Example");

        let appex = app.join("PlugIns").join("Widget.appex");
        std::fs::create_dir_all(&appex).unwrap();
        write_info_plist(&appex, "com.example.app.widget", "Widget");

        app
    }

    #[test]
    fn parses_app_and_extensions() {
        let dir = tempfile::tempdir().unwrap();
        let app = Application::new(make_app(dir.path())).unwrap();

        assert_eq!(app.bundle_identifier(), "com.example.app");
        assert_eq!(app.name(), "Example");

        let extensions = app.app_extensions().unwrap();
        assert_eq!(extensions.len(), 1);
        assert_eq!(extensions[0].bundle_identifier(), "com.example.app.widget");
    }

    #[test]
    fn missing_bundle_identifier_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let app = dir.path().join("Broken.app");
        std::fs::create_dir_all(&app).unwrap();

        let mut info = plist::Dictionary::new();
        info.insert("CFBundleName".into(), Value::String("Broken".into()));
        Value::Dictionary(info)
            .to_file_xml(app.join("Info.plist"))
            .unwrap();

        assert!(matches!(
            Application::new(app),
            Err(SideloadError::BundleNoIdentifier(_))
        ));
    }

    #[test]
    fn prepare_rewrites_identifier_and_groups() {
        let dir = tempfile::tempdir().unwrap();
        let app = Application::new(make_app(dir.path())).unwrap();

        let profile = sample_profile(
            "com.example.app.XYZZY42",
            &["group.com.example.XYZZY42"],
        );

        app.prepare_for_signing(&profile).unwrap();

        let rewritten = Application::new(app.path().to_path_buf()).unwrap();
        assert_eq!(rewritten.bundle_identifier(), "com.example.app.XYZZY42");
        assert_eq!(
            rewritten
                .info
                .get(INFO_KEY_APP_GROUPS)
                .and_then(Value::as_array)
                .map(Vec::len),
            Some(1)
        );
        assert!(rewritten.info.get(INFO_KEY_URL_TYPES).is_some());
    }

    #[test]
    fn archive_then_unzip_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let app = make_app(dir.path());
        std::fs::write(app.join("binary"), b"not a real executable").unwrap();

        let ipa = dir.path().join("Example.ipa");
        archive_app_bundle(&app, &ipa).unwrap();

        let extracted = dir.path().join("extracted");
        let reparsed = unzip_app_bundle(&ipa, &extracted).unwrap();

        assert_eq!(reparsed.bundle_identifier(), "com.example.app");
        assert!(reparsed.path().join("binary").is_file());
    }

    #[test]
    fn unzip_without_payload_fails() {
        let dir = tempfile::tempdir().unwrap();

        let ipa = dir.path().join("empty.ipa");
        let file = std::fs::File::create(&ipa).unwrap();
        let mut writer = zip::ZipWriter::new(file);
        writer
            .start_file("README.txt", zip::write::FileOptions::default())
            .unwrap();
        writer.write_all(b"nothing here").unwrap();
        writer.finish().unwrap();

        assert!(matches!(
            unzip_app_bundle(&ipa, &dir.path().join("out")),
            Err(SideloadError::IpaNoPayload(_))
        ));
    }

    fn sample_profile(bundle_id: &str, groups: &[&str]) -> ProvisioningProfile {
        let mut entitlements = plist::Dictionary::new();
        entitlements.insert(
            "application-identifier".into(),
            Value::String(format!("6053B555.{}", bundle_id)),
        );

        if !groups.is_empty() {
            entitlements.insert(
                apple_developer_services::features::ENTITLEMENT_APP_GROUPS.into(),
                Value::Array(
                    groups
                        .iter()
                        .map(|group| Value::String((*group).to_string()))
                        .collect(),
                ),
            );
        }

        ProvisioningProfile {
            name: format!("{} Development", bundle_id),
            uuid: "01234567-89AB-CDEF-0123-456789ABCDEF".into(),
            bundle_identifier: bundle_id.to_string(),
            team_identifier: "6053B555".into(),
            entitlements,
            data: vec![0xde, 0xad, 0xbe, 0xef],
        }
    }
}
