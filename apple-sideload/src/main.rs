// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use {
    apple_developer_services::{
        DeveloperServicesClient, Device, DevicePlatform, TwoFactorHandler,
    },
    apple_sideload::{
        http_anisette_relay, AccountCredentials, BundleIdPolicy, CertificateCache,
        CommandInstaller, CommandSigner, SideloadError, Sideloader, SignedApplication,
    },
    async_trait::async_trait,
    clap::{Arg, ArgMatches, Command},
    log::{error, LevelFilter},
    std::{collections::HashMap, path::PathBuf, sync::Arc},
};

const DEFAULT_ANISETTE_URL: &str = "https://ani.sidestore.io";

const SIGN_ABOUT: &str = "\
Re-sign an iOS application and optionally install it on a device.

Two signing modes are supported, selected by the arguments given:

Apple ID mode (--apple-id): authenticates against Apple's developer
services, selects your development team, registers the target device,
obtains a development certificate (reusing a locally cached one whenever
possible), provisions the app and each of its app extensions, and signs.

Certificate mode (--p12 + --profile): signs with an existing certificate
and provisioning profile. No network requests are made.

The cryptographic signing step is delegated to an external tool given via
--signer; any zsign-compatible wrapper works. Use --output to write a
signed .ipa, --install to push the app onto the device, or both.
";

fn command_sign(args: &ArgMatches) -> Result<(), SideloadError> {
    let ipa = PathBuf::from(args.value_of("ipa").ok_or(SideloadError::CliBadArgument)?);

    if !ipa.is_file() {
        error!("input does not exist: {}", ipa.display());
        return Err(SideloadError::CliBadArgument);
    }

    let output = args.value_of("output").map(PathBuf::from);
    let install = args.is_present("install");

    if output.is_none() && !install {
        error!("nothing to do; pass --output and/or --install");
        return Err(SideloadError::CliBadArgument);
    }

    let signer = Arc::new(CommandSigner::new(PathBuf::from(
        args.value_of("signer").ok_or(SideloadError::CliBadArgument)?,
    )));

    let platform = match args.value_of("platform") {
        Some("tvos") => DevicePlatform::Tvos,
        _ => DevicePlatform::Ios,
    };

    let device = args.value_of("udid").map(|udid| Device {
        identifier: udid.to_string(),
        name: args.value_of("device_name").unwrap_or("iPhone").to_string(),
        platform,
        os_version: args.value_of("os_version").map(String::from),
    });

    if install && device.is_none() {
        error!("--install requires --udid");
        return Err(SideloadError::CliBadArgument);
    }

    let policy = BundleIdPolicy::parse(args.value_of("bundle_id").unwrap_or("same"));

    let mut entitlements = HashMap::new();
    if let Some(values) = args.values_of("entitlement") {
        for value in values {
            match value.split_once('=') {
                Some((key, value)) => {
                    entitlements.insert(key.to_string(), value.to_string());
                }
                None => {
                    error!("entitlement overrides take the form key=value: {}", value);
                    return Err(SideloadError::CliBadArgument);
                }
            }
        }
    }

    let certificates = match args.value_of("certificates_dir") {
        Some(dir) => CertificateCache::new(PathBuf::from(dir)),
        None => CertificateCache::new(
            CertificateCache::default_directory().ok_or_else(|| {
                SideloadError::CliGeneralError(
                    "unable to determine a certificate cache directory".to_string(),
                )
            })?,
        ),
    };

    let anisette = http_anisette_relay(
        args.value_of("anisette_url").unwrap_or(DEFAULT_ANISETTE_URL),
    );

    let sideloader = Sideloader::new(
        Arc::new(DeveloperServicesClient::new()),
        anisette,
        signer,
        Arc::new(TwoFactorPrompt),
        certificates,
    );

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async {
        let result = match args.value_of("p12") {
            Some(p12) => {
                let profile = args.value_of("profile").ok_or_else(|| {
                    error!("certificate mode requires --profile");
                    SideloadError::CliBadArgument
                })?;

                sideloader
                    .sign_with_certificate(
                        &ipa,
                        &PathBuf::from(p12),
                        args.value_of("p12_password"),
                        &PathBuf::from(profile),
                        &entitlements,
                    )
                    .await
            }
            None => {
                let apple_id = args.value_of("apple_id").ok_or_else(|| {
                    error!("pass either --apple-id or --p12 + --profile");
                    SideloadError::CliBadArgument
                })?;

                let device = device.as_ref().ok_or_else(|| {
                    error!("--udid is required for Apple ID signing");
                    SideloadError::CliBadArgument
                })?;

                let password = resolve_password(args)?;

                sideloader
                    .sign_with_account(
                        &ipa,
                        device,
                        &AccountCredentials {
                            apple_id: apple_id.to_string(),
                            password,
                        },
                        &policy,
                        &entitlements,
                    )
                    .await
            }
        };

        let signed = match result {
            Ok(signed) => signed,
            Err(failure) if failure.is_benign() => {
                // Cancellation and pending two-factor flows end the run
                // without anything to report.
                println!("{}", failure.source_error());
                return Ok(());
            }
            Err(failure) => {
                eprintln!("{}", failure.title());
                if let Some(reason) = failure.failure_reason() {
                    eprintln!("{}", reason);
                }
                return Err(failure.into_source());
            }
        };

        finish_signed(args, &signed, device.as_ref(), output.as_deref(), install).await
    })
}

async fn finish_signed(
    args: &ArgMatches,
    signed: &SignedApplication,
    device: Option<&Device>,
    output: Option<&std::path::Path>,
    install: bool,
) -> Result<(), SideloadError> {
    if let Some(output) = output {
        apple_sideload::export_ipa(signed, output)?;
        println!("wrote {}", output.display());
    }

    if install {
        // Presence of a device was validated before the pipeline ran.
        let device = device.ok_or(SideloadError::CliBadArgument)?;

        let installer = match args.value_of("installer") {
            Some(command) => CommandInstaller::new(PathBuf::from(command), None),
            None => CommandInstaller::discover().ok_or_else(|| {
                SideloadError::Install(
                    "no install tool found on PATH; pass --installer".to_string(),
                )
            })?,
        };

        apple_sideload::deploy(&installer, signed, device).await?;
        println!(
            "{} was successfully installed on {}.",
            signed.application.name(),
            device.name
        );
    }

    Ok(())
}

fn resolve_password(args: &ArgMatches) -> Result<String, SideloadError> {
    if let Some(password) = args.value_of("password") {
        return Ok(password.to_string());
    }

    if let Ok(password) = std::env::var("ISIDELOAD_PASSWORD") {
        return Ok(password);
    }

    dialoguer::Password::new()
        .with_prompt("Apple ID password")
        .interact()
        .map_err(|e| SideloadError::CliGeneralError(e.to_string()))
}

/// Prompts on the terminal for a two-factor verification code.
struct TwoFactorPrompt;

#[async_trait]
impl TwoFactorHandler for TwoFactorPrompt {
    async fn verification_code(&self) -> Option<String> {
        tokio::task::spawn_blocking(|| {
            dialoguer::Input::<String>::new()
                .with_prompt("Enter the verification code shown on your trusted device")
                .interact_text()
                .ok()
        })
        .await
        .ok()
        .flatten()
    }
}

fn main_impl() -> Result<(), SideloadError> {
    let app = Command::new("isideload")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Re-sign and install iOS applications. Signing requires either an Apple ID or a certificate/profile pair.")
        .arg_required_else_help(true)
        .arg(
            Arg::new("verbose")
                .long("verbose")
                .short('v')
                .global(true)
                .multiple_occurrences(true)
                .help("Increase logging verbosity. Can be specified multiple times."),
        );

    let app = app.subcommand(
        Command::new("sign")
            .about("Re-sign an application for a device")
            .long_about(SIGN_ABOUT)
            .arg(
                Arg::new("ipa")
                    .required(true)
                    .help("Path to the .ipa archive to sign"),
            )
            .arg(
                Arg::new("signer")
                    .long("signer")
                    .takes_value(true)
                    .required(true)
                    .help("External signing command invoked on the prepared bundle"),
            )
            .arg(
                Arg::new("udid")
                    .long("udid")
                    .takes_value(true)
                    .help("UDID of the target device (required for Apple ID mode and --install)"),
            )
            .arg(
                Arg::new("device_name")
                    .long("device-name")
                    .takes_value(true)
                    .help("Display name of the target device"),
            )
            .arg(
                Arg::new("os_version")
                    .long("os-version")
                    .takes_value(true)
                    .help("OS version running on the target device"),
            )
            .arg(
                Arg::new("platform")
                    .long("platform")
                    .takes_value(true)
                    .possible_values(&["ios", "tvos"])
                    .default_value("ios")
                    .help("Device platform to provision for"),
            )
            .arg(
                Arg::new("apple_id")
                    .long("apple-id")
                    .takes_value(true)
                    .help("Apple ID to sign in with"),
            )
            .arg(
                Arg::new("password")
                    .long("password")
                    .takes_value(true)
                    .help("Apple ID password (defaults to $ISIDELOAD_PASSWORD, else prompts)"),
            )
            .arg(
                Arg::new("p12")
                    .long("p12")
                    .takes_value(true)
                    .help("Path to a .p12 certificate for certificate-mode signing"),
            )
            .arg(
                Arg::new("p12_password")
                    .long("p12-password")
                    .takes_value(true)
                    .help("Password protecting the .p12 file"),
            )
            .arg(
                Arg::new("profile")
                    .long("profile")
                    .takes_value(true)
                    .help("Path to a .mobileprovision profile for certificate-mode signing"),
            )
            .arg(
                Arg::new("bundle_id")
                    .long("bundle-id")
                    .takes_value(true)
                    .default_value("same")
                    .help("Bundle identifier policy: same, auto, or an explicit identifier"),
            )
            .arg(
                Arg::new("entitlement")
                    .long("entitlement")
                    .takes_value(true)
                    .multiple_occurrences(true)
                    .help("Entitlement override as key=value. Can be specified multiple times."),
            )
            .arg(
                Arg::new("anisette_url")
                    .long("anisette-url")
                    .takes_value(true)
                    .help("HTTP anisette data service to use for Apple ID mode"),
            )
            .arg(
                Arg::new("certificates_dir")
                    .long("certificates-dir")
                    .takes_value(true)
                    .help("Directory holding cached signing certificates"),
            )
            .arg(
                Arg::new("output")
                    .short('o')
                    .long("output")
                    .takes_value(true)
                    .help("Write the signed .ipa to this path"),
            )
            .arg(
                Arg::new("install")
                    .long("install")
                    .help("Install the signed app on the device"),
            )
            .arg(
                Arg::new("installer")
                    .long("installer")
                    .takes_value(true)
                    .help("External install tool (defaults to ideviceinstaller on PATH)"),
            ),
    );

    let matches = app.get_matches();

    let log_level = match matches.occurrences_of("verbose") {
        0 => LevelFilter::Info,
        1 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };

    let mut builder = env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(log_level.as_str()),
    );

    // Disable log context except at higher log levels.
    if log_level <= LevelFilter::Info {
        builder
            .format_timestamp(None)
            .format_level(false)
            .format_module_path(false);
    }

    builder.init();

    match matches.subcommand() {
        Some(("sign", args)) => command_sign(args),
        _ => Err(SideloadError::CliUnknownCommand),
    }
}

fn main() {
    let exit_code = match main_impl() {
        Ok(()) => 0,
        Err(err) => {
            eprintln!("Error: {}", err);
            1
        }
    };

    std::process::exit(exit_code)
}
