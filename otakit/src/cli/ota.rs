/*
 * SPDX-FileCopyrightText: 2022-2025 The otakit developers
 * SPDX-License-Identifier: GPL-3.0-only
 */

use std::{
    collections::BTreeMap,
    ffi::OsString,
    fs,
    path::PathBuf,
    sync::atomic::AtomicBool,
    time::Instant,
};

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};

use crate::{
    build_info::parse_properties,
    cli::{status, warning},
    config::OtaConfig,
    crypto::{self, PassphraseSource},
    format::ota::{
        AbOtaPropertyFiles, NonAbOtaPropertyFiles, PropertyFiles, StreamingPropertyFiles,
    },
    package::{
        ab::generate_ab_package,
        device::NullDeviceExtension,
        finalize::finalize_metadata,
        metadata::get_package_metadata,
        nonab::generate_non_ab_package,
        payload::PayloadSigner,
        sign::{CmsSigner, ExternalSigner, OtaSigner},
    },
    process::SystemRunner,
    target_files::TargetFiles,
};

const HEADING_PATH: &str = "Path options";
const HEADING_KEY: &str = "Signing options";
const HEADING_COMMON: &str = "Common package options";
const HEADING_NON_AB: &str = "Non-A/B package options";
const HEADING_AB: &str = "A/B package options";

#[derive(Debug, Args)]
pub struct KeyGroup {
    /// PEM-encoded private key for signing the package and payload.
    #[arg(short = 'k', long, value_name = "FILE", value_parser, help_heading = HEADING_KEY)]
    pub package_key: Option<PathBuf>,

    /// PEM-encoded certificate matching the package key.
    #[arg(long, value_name = "FILE", value_parser, help_heading = HEADING_KEY)]
    pub package_cert: Option<PathBuf>,

    /// Environment variable containing the package key passphrase.
    #[arg(long, value_name = "ENV_VAR", value_parser, group = "pass", help_heading = HEADING_KEY)]
    pub pass_env_var: Option<OsString>,

    /// File containing the package key passphrase.
    #[arg(long, value_name = "FILE", value_parser, group = "pass", help_heading = HEADING_KEY)]
    pub pass_file: Option<PathBuf>,

    /// Skip signing the output package (the A/B payload is still signed).
    #[arg(long, help_heading = HEADING_KEY)]
    pub no_signing: bool,

    /// External program that signs the whole package (invoked with the input
    /// and output paths appended).
    #[arg(long, value_name = "PROGRAM", value_parser, help_heading = HEADING_KEY)]
    pub signer: Option<OsString>,

    /// Extra argument passed to the external package signer.
    #[arg(long, value_name = "ARG", value_parser, help_heading = HEADING_KEY)]
    pub signer_arg: Vec<OsString>,

    /// External program that signs the payload and metadata hashes (invoked
    /// with -in and -out arguments appended).
    #[arg(long, value_name = "PROGRAM", value_parser, help_heading = HEADING_KEY)]
    pub payload_signer: Option<OsString>,

    /// Extra argument passed to the external payload signer.
    #[arg(long, value_name = "ARG", value_parser, help_heading = HEADING_KEY)]
    pub payload_signer_arg: Vec<OsString>,

    /// Maximum signature size (in bytes) produced by the external payload
    /// signer. For an RSA key this is the size of the modulus.
    #[arg(long, value_name = "BYTES", help_heading = HEADING_KEY)]
    pub payload_signer_maximum_signature_size: Option<usize>,
}

/// Build a full or incremental OTA package from target-files archives.
#[derive(Debug, Parser)]
pub struct BuildCli {
    /// Path to the target build's target-files zip.
    #[arg(short, long, value_name = "FILE", value_parser, help_heading = HEADING_PATH)]
    pub input: PathBuf,

    /// Path to the output OTA package.
    #[arg(short, long, value_name = "FILE", value_parser, help_heading = HEADING_PATH)]
    pub output: PathBuf,

    /// Source build target-files zip for an incremental OTA.
    #[arg(long, value_name = "FILE", value_parser, help_heading = HEADING_PATH)]
    pub incremental_from: Option<PathBuf>,

    /// Write a copy of the final metadata next to the package.
    #[arg(long, value_name = "FILE", value_parser, help_heading = HEADING_PATH)]
    pub output_metadata_path: Option<PathBuf>,

    /// Comma-separated files holding expected OEM-specific properties. Only
    /// the first is used to compute fingerprints.
    #[arg(long, value_name = "FILES", value_delimiter = ',', help_heading = HEADING_COMMON)]
    pub oem_settings: Vec<PathBuf>,

    /// Wipe the user data partition when the package is installed.
    #[arg(long, help_heading = HEADING_COMMON)]
    pub wipe_user_data: bool,

    /// Intentionally build an incremental OTA moving to an older build. A
    /// data wipe is always enforced.
    #[arg(long, help_heading = HEADING_COMMON)]
    pub downgrade: bool,

    /// Mark the package as a downgrade based on timestamps without enforcing
    /// a data wipe (for builds cut in reverse order across branches).
    #[arg(long, conflicts_with = "downgrade", help_heading = HEADING_COMMON)]
    pub override_timestamp: bool,

    /// Permit a security patch level downgrade. A data wipe is enforced.
    #[arg(long, help_heading = HEADING_COMMON)]
    pub spl_downgrade: bool,

    /// Generate a non-A/B package on an A/B device that supports both.
    #[arg(long, help_heading = HEADING_COMMON)]
    pub force_non_ab: bool,

    /// Update the device to support dynamic partitions.
    #[arg(long, help_heading = HEADING_COMMON)]
    pub retrofit_dynamic_partitions: bool,

    /// Worker threads for patch generation (default: half the processors).
    #[arg(long, value_name = "COUNT", help_heading = HEADING_COMMON)]
    pub worker_threads: Option<usize>,

    /// Update recovery first so changes to the system partition are installed
    /// by code from the new build.
    #[arg(short = '2', long, help_heading = HEADING_NON_AB)]
    pub two_step: bool,

    /// Development-only replacement for the build's updater binary.
    #[arg(short = 'b', long, value_name = "FILE", value_parser, help_heading = HEADING_NON_AB)]
    pub binary: Option<PathBuf>,

    /// Additionally include a full payload for the secondary slot images.
    #[arg(long, help_heading = HEADING_AB)]
    pub include_secondary: bool,

    /// Skip all postinstall hooks in the generated payload.
    #[arg(long, help_heading = HEADING_AB)]
    pub skip_postinstall: bool,

    /// Disable on-device FEC data computation for incremental updates.
    #[arg(long, help_heading = HEADING_AB)]
    pub disable_fec_computation: bool,

    /// Disable on-device verity computation for incremental updates.
    #[arg(long, help_heading = HEADING_AB)]
    pub disable_verity_computation: bool,

    /// Disable virtual A/B compression.
    #[arg(long, help_heading = HEADING_AB)]
    pub disable_vabc: bool,

    /// Keep virtual A/B compression enabled for downgrading OTAs.
    #[arg(long, help_heading = HEADING_AB)]
    pub vabc_downgrade: bool,

    /// Space-separated partition list for a partial update, overriding
    /// ab_partitions.txt.
    #[arg(long, value_name = "PARTITIONS", help_heading = HEADING_AB)]
    pub partial: Option<String>,

    #[command(flatten)]
    pub keys: KeyGroup,
}

fn load_oem_props(paths: &[PathBuf]) -> Result<Option<BTreeMap<String, String>>> {
    let Some(first) = paths.first() else {
        return Ok(None);
    };

    if paths.len() > 1 {
        // Remaining dicts only assert OEM properties at install time, which
        // is the updater's job; the first decides fingerprints.
        warning!("Only the first OEM property file is used to compute fingerprints");
    }

    let text = fs::read_to_string(first)
        .with_context(|| format!("Failed to read OEM properties: {first:?}"))?;

    Ok(Some(parse_properties(&text)))
}

pub fn build_subcommand(cli: &BuildCli, cancel_signal: &AtomicBool) -> Result<()> {
    let start = Instant::now();
    let runner = SystemRunner;

    let target = TargetFiles::open(&cli.input)
        .with_context(|| format!("Failed to open target files: {:?}", cli.input))?;

    let oem_props = load_oem_props(&cli.oem_settings)?;
    let target_info = target
        .build_info(oem_props.clone())
        .context("Failed to load target build info")?;

    let source = match &cli.incremental_from {
        Some(path) => {
            let tf = TargetFiles::open(path)
                .with_context(|| format!("Failed to open source target files: {path:?}"))?;
            let info = tf
                .build_info(oem_props)
                .context("Failed to load source build info")?;
            Some((tf, info))
        }
        None => None,
    };

    let mut config = OtaConfig {
        // A downgrade or SPL downgrade always enforces a wipe; otherwise the
        // device could end up on an older build with newer data.
        wipe_user_data: cli.wipe_user_data || cli.downgrade || cli.spl_downgrade,
        downgrade: cli.downgrade || cli.override_timestamp,
        spl_downgrade: cli.spl_downgrade,
        two_step: cli.two_step,
        include_secondary: cli.include_secondary,
        skip_postinstall: cli.skip_postinstall,
        retrofit_dynamic_partitions: cli.retrofit_dynamic_partitions,
        force_non_ab: cli.force_non_ab,
        no_signing: cli.keys.no_signing,
        disable_fec_computation: cli.disable_fec_computation,
        disable_verity_computation: cli.disable_verity_computation,
        disable_vabc: cli.disable_vabc,
        vabc_downgrade: cli.vabc_downgrade,
        partial: cli
            .partial
            .as_ref()
            .map(|p| p.split_whitespace().map(|s| s.to_owned()).collect()),
        output_metadata_path: cli.output_metadata_path.clone(),
        updater_binary: cli.binary.clone(),
        ..Default::default()
    };
    if let Some(threads) = cli.worker_threads {
        if threads == 0 {
            bail!("--worker-threads must be at least 1");
        }
        config.worker_threads = threads;
    }

    let source_refs = source.as_ref().map(|(tf, info)| (tf, info));
    let config = config
        .resolve(&target_info, source_refs.map(|(_, i)| i))
        .context("Invalid configuration for this build pair")?;

    let mut metadata = get_package_metadata(&config, &target_info, source_refs.map(|(_, i)| i))
        .context("Failed to build package metadata")?;

    let generate_ab = config.generate_ab(&target_info);

    // The payload is signed even when package signing is skipped, so A/B
    // packages always need key material of some form.
    if cli.keys.package_key.is_none() {
        if generate_ab && cli.keys.payload_signer.is_none() {
            bail!("--package-key is required to sign the payload (or use --payload-signer)");
        }
        if !cli.keys.no_signing && cli.keys.signer.is_none() {
            bail!("--package-key is required unless --no-signing or --signer is used");
        }
    }

    let staging = tempfile::Builder::new()
        .prefix("otakit-staging-")
        .suffix(".zip")
        .tempfile()
        .context("Failed to create staging file")?;

    if generate_ab {
        status!("Generating A/B OTA package");

        let payload_signer = match &cli.keys.payload_signer {
            Some(program) => PayloadSigner::with_external_signer(
                program,
                &cli.keys.payload_signer_arg,
                cli.keys.payload_signer_maximum_signature_size,
            ),
            None => {
                let key = cli.keys.package_key.as_deref().unwrap();
                PayloadSigner::with_local_key(&runner, key)
                    .context("Failed to initialize payload signer")?
            }
        };

        generate_ab_package(
            &config,
            &target,
            &target_info,
            source_refs,
            &payload_signer,
            metadata.postcondition.timestamp,
            staging.path(),
            &runner,
            cancel_signal,
        )
        .context("Failed to generate A/B package")?;
    } else {
        status!("Generating non-A/B OTA package");

        generate_non_ab_package(
            &config,
            &target,
            &target_info,
            source_refs,
            &NullDeviceExtension,
            &mut metadata,
            staging.path(),
            &runner,
            cancel_signal,
        )
        .context("Failed to generate non-A/B package")?;
    }

    let signer: Option<Box<dyn OtaSigner + '_>> = if config.no_signing {
        None
    } else if let Some(program) = &cli.keys.signer {
        Some(Box::new(ExternalSigner {
            program: program.clone(),
            args: cli.keys.signer_arg.clone(),
            runner: &runner,
        }))
    } else {
        let key_path = cli.keys.package_key.as_deref().unwrap();
        let cert_path = cli
            .keys
            .package_cert
            .as_deref()
            .context("--package-cert is required when signing with --package-key")?;

        let passphrase = PassphraseSource::new(
            cli.keys.pass_file.as_deref(),
            cli.keys.pass_env_var.as_deref(),
        );
        let key = crypto::read_pem_key_file(key_path, &passphrase)
            .with_context(|| format!("Failed to load key: {key_path:?}"))?;
        let cert = crypto::read_pem_cert_file(cert_path)
            .with_context(|| format!("Failed to load certificate: {cert_path:?}"))?;

        Some(Box::new(
            CmsSigner::new(key, cert).context("Package key does not match certificate")?,
        ))
    };

    status!("Finalizing package metadata");

    let ab_pf = AbOtaPropertyFiles;
    let streaming_pf = StreamingPropertyFiles;
    let non_ab_pf = NonAbOtaPropertyFiles;
    let property_files: Vec<&dyn PropertyFiles> = if generate_ab {
        vec![&ab_pf, &streaming_pf]
    } else {
        vec![&non_ab_pf]
    };

    finalize_metadata(
        &mut metadata,
        staging.path(),
        &cli.output,
        &property_files,
        signer.as_deref(),
        &config,
        cancel_signal,
    )
    .context("Failed to finalize OTA package")?;

    status!(
        "Wrote {} package to {:?} after {:.1}s",
        if generate_ab { "A/B" } else { "non-A/B" },
        cli.output,
        start.elapsed().as_secs_f64(),
    );

    Ok(())
}

#[derive(Debug, Subcommand)]
enum OtaCommand {
    Build(BuildCli),
}

/// Build OTA packages from target-files archives.
#[derive(Debug, Parser)]
pub struct OtaCli {
    #[command(subcommand)]
    command: OtaCommand,
}

pub fn ota_main(cli: &OtaCli, cancel_signal: &AtomicBool) -> Result<()> {
    match &cli.command {
        OtaCommand::Build(c) => build_subcommand(c, cancel_signal),
    }
}
