// SPDX-FileCopyrightText: 2022-2025 The otakit developers
// SPDX-License-Identifier: GPL-3.0-only

//! A/B package construction: target-files transform selection, payload
//! generation and signing, and assembly of the staging archive that the
//! metadata finalization protocol consumes.

use std::{
    ffi::OsString,
    fs::File,
    io::{self, Write},
    path::Path,
    sync::atomic::AtomicBool,
};

use thiserror::Error;
use tracing::{info, warn};
use zip::ZipWriter;

use crate::{
    build_info::BuildInfo,
    config::OtaConfig,
    format::zip::stored_options,
    package::payload::{self, Payload, PayloadSigner},
    process::{self, ProcessRunner},
    target_files::{self, AB_PARTITIONS, TargetFiles},
};

#[derive(Debug, Error)]
pub enum Error {
    #[error("{AB_PARTITIONS} is required for A/B updates")]
    MissingAbPartitions,
    #[error("Payload error")]
    Payload(#[from] payload::Error),
    #[error("Target files error")]
    TargetFiles(#[from] target_files::Error),
    #[error("Build info error")]
    BuildInfo(#[from] crate::build_info::Error),
    #[error("Process error")]
    Process(#[from] process::Error),
    #[error("Zip error")]
    Zip(#[from] zip::result::ZipError),
    #[error("I/O error")]
    Io(#[from] io::Error),
}

type Result<T> = std::result::Result<T, Error>;

/// Decide whether virtual A/B compression has to be turned off for this
/// invocation, beyond an explicit `--disable-vabc`.
fn should_disable_vabc(
    config: &OtaConfig,
    target_info: &BuildInfo,
    source_info: Option<&BuildInfo>,
) -> bool {
    if config.disable_vabc {
        return true;
    }

    if let Some(source_info) = source_info {
        // If only the source supports VABC, the delta generator would still
        // emit a compressed OTA that the target cannot apply; if only the
        // target does, the source build has no snapuserd to serve I/O during
        // the install.
        if !source_info.is_vabc() || !target_info.is_vabc() {
            info!("Either source or target does not support VABC. Disabling.");
            return true;
        }
    }

    if target_info.vendor_suppressed_vabc() {
        info!("Vendor suppressed VABC. Disabling.");
        return true;
    }

    false
}

/// Apply the configured target-files transform, returning the derived
/// archive (or `None` to use the original), plus extra delta generator
/// arguments the transform requires.
fn transform_target_files(
    config: &OtaConfig,
    target: &TargetFiles,
    target_info: &BuildInfo,
) -> Result<(Option<TargetFiles>, Vec<OsString>)> {
    if config.retrofit_dynamic_partitions {
        let transformed = target.for_retrofit_dynamic_partitions(target_info)?;
        return Ok((Some(transformed), vec![]));
    }

    if let Some(partitions) = &config.partial {
        let transformed = target.for_partial_update(partitions)?;
        let args = process::command(["--is_partial_update", "true"]);
        return Ok((Some(transformed), args));
    }

    if config.skip_postinstall {
        return Ok((target.without_postinstall_config()?, vec![]));
    }

    Ok((None, vec![]))
}

/// Generate an A/B OTA package into the staging archive. The caller's
/// metadata already carries the pre/post conditions; its timestamp decides
/// the maximum timestamp enforced by the delta generator.
#[allow(clippy::too_many_arguments)]
pub fn generate_ab_package(
    config: &OtaConfig,
    target: &TargetFiles,
    target_info: &BuildInfo,
    source: Option<(&TargetFiles, &BuildInfo)>,
    payload_signer: &PayloadSigner,
    metadata_timestamp: u64,
    staging_path: &Path,
    runner: &dyn ProcessRunner,
    cancel_signal: &AtomicBool,
) -> Result<()> {
    let source_info = source.map(|(_, i)| i);
    let disable_vabc = should_disable_vabc(config, target_info, source_info);

    let (transformed, mut additional_args) = transform_target_files(config, target, target_info)?;
    let effective_target = transformed.as_ref().unwrap_or(target);

    // The transform may have rewritten the partition list; whatever is left
    // must still declare itself A/B-updatable.
    if !effective_target.has_entry(AB_PARTITIONS)? {
        return Err(Error::MissingAbPartitions);
    }
    if let Some((source, _)) = source {
        if !source.has_entry(AB_PARTITIONS)? {
            return Err(Error::MissingAbPartitions);
        }
    }

    // Enforce a maximum timestamp this payload can be applied on top of. For
    // a downgrade that is the source build's timestamp, not the target's.
    let max_timestamp = if config.downgrade {
        source_info
            .expect("Downgrade requires a source build")
            .build_timestamp()?
    } else {
        metadata_timestamp
    };

    if disable_vabc {
        additional_args.extend(process::command(["--disable_vabc", "true"]));
    }
    additional_args.push("--max_timestamp".into());
    additional_args.push(max_timestamp.to_string().into());

    let mut payload = Payload::new(false);
    payload.generate(
        runner,
        effective_target.path(),
        source.map(|(s, _)| s.path()),
        config,
        &additional_args,
    )?;
    payload.sign(runner, payload_signer, config.wipe_user_data)?;

    let file = File::create(staging_path)?;
    let mut zip = ZipWriter::new(file);

    payload.write_to_zip(&mut zip, cancel_signal)?;

    // The secondary slot images always get a full payload, applied after the
    // reboot into the new slot.
    if config.include_secondary {
        let secondary_target = effective_target.for_secondary_images(config.skip_postinstall)?;

        let secondary_args: Vec<OsString> =
            vec!["--max_timestamp".into(), max_timestamp.to_string().into()];

        let mut secondary_payload = Payload::new(true);
        secondary_payload.generate(
            runner,
            secondary_target.path(),
            None,
            config,
            &secondary_args,
        )?;
        secondary_payload.sign(runner, payload_signer, config.wipe_user_data)?;
        secondary_payload.write_to_zip(&mut zip, cancel_signal)?;
    }

    // If dm-verity or AVB is enabled for the device, expose the care map so
    // the update client can verify the written blocks.
    if target_info.get("verity") == Some("true") || target_info.get("avb_enable") == Some("true") {
        let mut found = false;

        for name in ["care_map.pb", "care_map.txt"] {
            if let Some(data) = effective_target.read_opt(&format!("META/{name}"))? {
                // Must be stored so it stays byte-addressable for streaming.
                zip.start_file(name, stored_options(data.len() as u64))?;
                zip.write_all(&data)?;
                found = true;
                break;
            }
        }

        if !found {
            warn!("Cannot find care map file in target files package");
        }
    }

    zip.finish()?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use std::{collections::BTreeMap, io::Read, process::Output, sync::Mutex};

    use zip::write::FileOptions;

    use crate::{
        build_info::parse_properties,
        format::ota::{PATH_PAYLOAD, PATH_SECONDARY_PAYLOAD},
        target_files::MISC_INFO,
    };

    use super::*;

    /// Emulates the delta generator tool chain: records command lines and
    /// writes a plausible file for every output argument.
    #[derive(Default)]
    struct FakeTools {
        commands: Mutex<Vec<String>>,
    }

    impl FakeTools {
        fn arg_value(argv: &[OsString], flag: &str) -> Option<std::path::PathBuf> {
            let mut iter = argv.iter();
            while let Some(arg) = iter.next() {
                if arg == flag {
                    return iter.next().map(|v| v.into());
                }
            }
            None
        }
    }

    impl ProcessRunner for FakeTools {
        fn run(&self, argv: &[OsString]) -> io::Result<Output> {
            let joined = argv
                .iter()
                .map(|a| a.to_string_lossy().into_owned())
                .collect::<Vec<_>>()
                .join(" ");
            self.commands.lock().unwrap().push(joined);

            match argv[0].to_string_lossy().as_ref() {
                "openssl" | "helper" => {
                    std::fs::write(Self::arg_value(argv, "-out").unwrap(), b"sig")?;
                }
                "delta_generator" => {
                    let arg = argv[1].to_string_lossy().into_owned();
                    let path = arg
                        .strip_prefix("--out_maximum_signature_size_file=")
                        .unwrap();
                    std::fs::write(path, "256")?;
                }
                "brillo_update_payload" => match argv[1].to_string_lossy().as_ref() {
                    "generate" => {
                        std::fs::write(
                            Self::arg_value(argv, "--payload").unwrap(),
                            b"payload",
                        )?;
                    }
                    "hash" => {
                        for flag in ["--metadata_hash_file", "--payload_hash_file"] {
                            std::fs::write(Self::arg_value(argv, flag).unwrap(), b"hash")?;
                        }
                    }
                    "sign" => {
                        std::fs::write(
                            Self::arg_value(argv, "--payload").unwrap(),
                            b"signed-payload",
                        )?;
                    }
                    "properties" => {
                        std::fs::write(
                            Self::arg_value(argv, "--properties_file").unwrap(),
                            b"FILE_HASH=abc\n",
                        )?;
                    }
                    other => panic!("Unexpected subcommand: {other}"),
                },
                other => panic!("Unexpected program: {other}"),
            }

            Ok(Output {
                status: process::success_status(),
                stdout: vec![],
                stderr: vec![],
            })
        }
    }

    fn target_files_with(entries: &[(&str, &[u8])]) -> (tempfile::TempPath, TargetFiles) {
        let temp = tempfile::Builder::new().suffix(".zip").tempfile().unwrap();
        let (file, path) = temp.into_parts();
        let mut writer = ZipWriter::new(file);

        for (name, data) in entries {
            writer.start_file(*name, FileOptions::default()).unwrap();
            writer.write_all(data).unwrap();
        }

        writer.finish().unwrap();

        let tf = TargetFiles::open(&path).unwrap();
        (path, tf)
    }

    fn ab_build_info(extra_misc: &str) -> BuildInfo {
        let misc = parse_properties(&format!(
            "ab_update=true\navb_enable=true\n{extra_misc}"
        ));
        let props = parse_properties(
            "ro.product.device=walleye\n\
             ro.build.fingerprint=fp/target\n\
             ro.build.date.utc=1500\n\
             ro.build.version.incremental=1\n",
        );

        BuildInfo::new(misc, props, None, BTreeMap::new(), None)
    }

    #[test]
    fn full_ab_package_with_secondary() {
        let cancel_signal = AtomicBool::new(false);
        let runner = FakeTools::default();
        let config = OtaConfig {
            include_secondary: true,
            skip_postinstall: true,
            ..Default::default()
        };

        let (_path, target) = target_files_with(&[
            (AB_PARTITIONS, b"system\nboot\nvendor\n" as &[u8]),
            (MISC_INFO, b"ab_update=true\navb_enable=true\n"),
            ("META/care_map.pb", b"care-map"),
            ("META/postinstall_config.txt", b"RUN_POSTINSTALL_system=true\n"),
            ("IMAGES/system.img", b"sys"),
            ("IMAGES/system_other.img", b"sys-other"),
            ("IMAGES/boot.img", b"boot"),
            ("IMAGES/vendor.img", b"vendor"),
        ]);
        let target_info = ab_build_info("");

        let signer = PayloadSigner::with_external_signer(
            std::ffi::OsStr::new("helper"),
            &[],
            Some(256),
        );

        let staging = tempfile::Builder::new().suffix(".zip").tempfile().unwrap();

        generate_ab_package(
            &config,
            &target,
            &target_info,
            None,
            &signer,
            1500,
            staging.path(),
            &runner,
            &cancel_signal,
        )
        .unwrap();

        let mut zip = zip::ZipArchive::new(File::open(staging.path()).unwrap()).unwrap();
        assert!(zip.by_name(PATH_PAYLOAD).is_ok());
        assert!(zip.by_name(PATH_SECONDARY_PAYLOAD).is_ok());

        {
            let entry = zip.by_name("care_map.pb").unwrap();
            assert_eq!(entry.compression(), zip::CompressionMethod::Stored);
        }

        let mut properties = String::new();
        zip.by_name("secondary/payload_properties.txt")
            .unwrap()
            .read_to_string(&mut properties)
            .unwrap();
        assert!(properties.contains("SWITCH_SLOT_ON_REBOOT=0\n"));

        let commands = runner.commands.lock().unwrap();
        let generates = commands
            .iter()
            .filter(|c| c.contains("brillo_update_payload generate"))
            .collect::<Vec<_>>();
        assert_eq!(generates.len(), 2);
        assert!(generates[0].contains("--max_timestamp 1500"));
        assert!(generates[1].contains("--max_timestamp 1500"));
        // Secondary payloads are always full.
        assert!(!generates[1].contains("--source_image"));
    }

    #[test]
    fn vabc_disabled_when_source_lacks_support() {
        let target_info = ab_build_info("virtual_ab_compression=true\n");
        let source_info = ab_build_info("");

        assert!(should_disable_vabc(
            &OtaConfig::default(),
            &target_info,
            Some(&source_info),
        ));
        assert!(!should_disable_vabc(
            &OtaConfig::default(),
            &target_info,
            None,
        ));
        assert!(should_disable_vabc(
            &OtaConfig {
                disable_vabc: true,
                ..Default::default()
            },
            &target_info,
            None,
        ));
    }

    #[test]
    fn downgrade_uses_source_timestamp() {
        let cancel_signal = AtomicBool::new(false);
        let runner = FakeTools::default();
        let config = OtaConfig {
            downgrade: true,
            wipe_user_data: true,
            disable_vabc: true,
            ..Default::default()
        };

        let (_tp, target) = target_files_with(&[
            (AB_PARTITIONS, b"system\n" as &[u8]),
            (MISC_INFO, b"ab_update=true\n"),
            ("IMAGES/system.img", b"sys"),
        ]);
        let (_sp, source) = target_files_with(&[
            (AB_PARTITIONS, b"system\n" as &[u8]),
            (MISC_INFO, b"ab_update=true\n"),
            ("IMAGES/system.img", b"sys-old"),
        ]);

        let target_info = ab_build_info("");
        let source_props = parse_properties(
            "ro.product.device=walleye\n\
             ro.build.fingerprint=fp/source\n\
             ro.build.date.utc=2000\n\
             ro.build.version.incremental=0\n",
        );
        let source_info = BuildInfo::new(
            parse_properties("ab_update=true\n"),
            source_props,
            None,
            BTreeMap::new(),
            None,
        );

        let signer = PayloadSigner::with_external_signer(
            std::ffi::OsStr::new("helper"),
            &[],
            Some(256),
        );

        let staging = tempfile::Builder::new().suffix(".zip").tempfile().unwrap();

        generate_ab_package(
            &config,
            &target,
            &target_info,
            Some((&source, &source_info)),
            &signer,
            1500,
            staging.path(),
            &runner,
            &cancel_signal,
        )
        .unwrap();

        let commands = runner.commands.lock().unwrap();
        let generate = commands
            .iter()
            .find(|c| c.contains("brillo_update_payload generate"))
            .unwrap();

        // The source build's timestamp caps what the payload applies on.
        assert!(generate.contains("--max_timestamp 2000"));
        assert!(generate.contains("--disable_vabc true"));
        assert!(generate.contains("--source_image"));
    }
}
