/*
 * SPDX-FileCopyrightText: 2022-2025 The otakit developers
 * SPDX-License-Identifier: GPL-3.0-only
 */

//! End-to-end package generation against an emulated delta generator tool
//! chain: target-files in, finished (unsigned) OTA package out.

use std::{
    collections::BTreeMap,
    ffi::OsString,
    io::{self, Write},
    path::PathBuf,
    process::Output,
    sync::atomic::AtomicBool,
};

use otakit::{
    build_info::parse_properties,
    config::OtaConfig,
    format::{
        ota::{
            AbOtaPropertyFiles, OtaMetadata, OtaType, PATH_METADATA, PropertyFiles,
            StreamingPropertyFiles,
        },
        zip as zip_util,
    },
    package::{
        ab::generate_ab_package, finalize::finalize_metadata, metadata::get_package_metadata,
        payload::PayloadSigner,
    },
    process::{self, ProcessRunner},
    target_files::TargetFiles,
};
use tempfile::NamedTempFile;
use zip::{ZipWriter, write::FileOptions};

/// Emulates brillo_update_payload/delta_generator/openssl. The signed payload
/// it produces carries a valid header so the property-files logic can locate
/// the metadata region.
struct FakeTools;

fn arg_value(argv: &[OsString], flag: &str) -> Option<PathBuf> {
    let mut iter = argv.iter();
    while let Some(arg) = iter.next() {
        if arg == flag {
            return iter.next().map(|v| v.into());
        }
    }
    None
}

fn fake_signed_payload() -> Vec<u8> {
    let mut buf = b"CrAU".to_vec();
    buf.extend_from_slice(&2u64.to_be_bytes());
    buf.extend_from_slice(&64u64.to_be_bytes());
    buf.extend_from_slice(&16u32.to_be_bytes());
    buf.resize(buf.len() + 64 + 16 + 200, 0x5a);
    buf
}

impl ProcessRunner for FakeTools {
    fn run(&self, argv: &[OsString]) -> io::Result<Output> {
        match argv[0].to_string_lossy().as_ref() {
            "openssl" => {
                std::fs::write(arg_value(argv, "-out").unwrap(), b"signature")?;
            }
            "delta_generator" => {
                let arg = argv[1].to_string_lossy().into_owned();
                let path = arg
                    .strip_prefix("--out_maximum_signature_size_file=")
                    .unwrap()
                    .to_owned();
                std::fs::write(path, "256\n")?;
            }
            "brillo_update_payload" => match argv[1].to_string_lossy().as_ref() {
                "generate" => {
                    std::fs::write(arg_value(argv, "--payload").unwrap(), b"unsigned")?;
                }
                "hash" => {
                    for flag in ["--metadata_hash_file", "--payload_hash_file"] {
                        std::fs::write(arg_value(argv, flag).unwrap(), b"hash")?;
                    }
                }
                "sign" => {
                    std::fs::write(arg_value(argv, "--payload").unwrap(), fake_signed_payload())?;
                }
                "properties" => {
                    std::fs::write(
                        arg_value(argv, "--properties_file").unwrap(),
                        b"FILE_HASH=aGFzaA==\nFILE_SIZE=304\n",
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

fn build_target_files() -> (tempfile::TempPath, TargetFiles) {
    let temp = tempfile::Builder::new().suffix(".zip").tempfile().unwrap();
    let (file, path) = temp.into_parts();
    let mut writer = ZipWriter::new(file);

    let entries: &[(&str, &[u8])] = &[
        ("META/ab_partitions.txt", b"system\nvendor\n"),
        (
            "META/misc_info.txt",
            b"ab_update=true\nuse_dynamic_partitions=true\navb_enable=true\n",
        ),
        ("META/care_map.pb", b"care-map-data"),
        ("SYSTEM/build.prop", b"ro.product.device=walleye\n\
          ro.build.fingerprint=google/walleye/walleye:12/SQ1A/1:user/release-keys\n\
          ro.build.date.utc=1650000000\n\
          ro.build.version.incremental=1\n\
          ro.build.version.sdk=31\n\
          ro.build.version.security_patch=2022-04-05\n"),
        ("IMAGES/system.img", b"system-image"),
        ("IMAGES/vendor.img", b"vendor-image"),
    ];

    for (name, data) in entries {
        writer.start_file(*name, FileOptions::default()).unwrap();
        writer.write_all(data).unwrap();
    }

    writer.finish().unwrap();

    let tf = TargetFiles::open(&path).unwrap();
    (path, tf)
}

#[test]
fn full_ab_package_end_to_end() {
    let cancel_signal = AtomicBool::new(false);
    let runner = FakeTools;

    let (_path, target) = build_target_files();
    let target_info = target.build_info(None).unwrap();

    let config = OtaConfig::default()
        .resolve(&target_info, None)
        .unwrap();

    let mut metadata = get_package_metadata(&config, &target_info, None).unwrap();

    let signer = PayloadSigner::with_local_key(&runner, std::path::Path::new("key.pem")).unwrap();
    assert_eq!(signer.max_signature_size(), 256);

    let staging = tempfile::Builder::new().suffix(".zip").tempfile().unwrap();

    generate_ab_package(
        &config,
        &target,
        &target_info,
        None,
        &signer,
        metadata.postcondition.timestamp,
        staging.path(),
        &runner,
        &cancel_signal,
    )
    .unwrap();

    let output = NamedTempFile::new().unwrap();
    let ab = AbOtaPropertyFiles;
    let streaming = StreamingPropertyFiles;
    let pfs: Vec<&dyn PropertyFiles> = vec![&ab, &streaming];

    finalize_metadata(
        &mut metadata,
        staging.path(),
        output.path(),
        &pfs,
        None,
        &config,
        &cancel_signal,
    )
    .unwrap();

    // The published metadata describes a dynamic-partition A/B full OTA.
    let mut zip = zip_util::open_archive(output.path()).unwrap();
    let raw = zip_util::read_entry_string(&mut zip, PATH_METADATA).unwrap();
    let written = OtaMetadata::parse(&raw).unwrap();

    assert_eq!(written.ota_type, OtaType::Ab);
    assert!(!raw.contains("pre-build="));
    assert!(raw.contains(
        "post-build=google/walleye/walleye:12/SQ1A/1:user/release-keys\n"
    ));
    assert!(raw.contains("pre-device=walleye\n"));
    assert!(raw.contains("ota-required-cache=0\n"));

    // Both property-files strings survive verification against the final
    // archive, and the payload_metadata token matches the payload header.
    let mut boxed = zip_util::open_boxed_archive(output.path()).unwrap();

    for pf in &pfs {
        let expected = written.property_files.get(pf.name()).unwrap();
        pf.verify(&mut boxed, expected.trim_end()).unwrap();
    }

    let ab_value = written.property_files.get(ab.name()).unwrap();
    let token = ab_value.split(',').next().unwrap();
    assert!(token.starts_with("payload_metadata.bin:"));
    let size: u64 = token.split(':').nth(2).unwrap().parse().unwrap();
    assert_eq!(size, 24 + 64 + 16);

    // The care map rode along as a streamable entry.
    assert!(ab_value.contains("care_map.pb:"));
}

#[test]
fn secondary_payload_skip_list_round_trip() {
    // Building the derived secondary archive and regenerating build info from
    // it must agree on the skip list.
    let temp = tempfile::Builder::new().suffix(".zip").tempfile().unwrap();
    let (file, path) = temp.into_parts();
    let mut writer = ZipWriter::new(file);

    let entries: &[(&str, &[u8])] = &[
        ("META/ab_partitions.txt", b"system\nboot\nvbmeta\nbootloader\n"),
        (
            "META/misc_info.txt",
            b"ab_update=true\nvirtual_ab=true\nsuper_x_partition_list=system vbmeta\n",
        ),
        ("IMAGES/system.img", b"primary"),
        ("IMAGES/system_other.img", b"secondary"),
        ("IMAGES/boot.img", b"boot"),
        ("IMAGES/vbmeta.img", b"vbmeta"),
        ("IMAGES/bootloader.img", b"bootloader"),
    ];

    for (name, data) in entries {
        writer.start_file(*name, FileOptions::default()).unwrap();
        writer.write_all(data).unwrap();
    }
    writer.finish().unwrap();

    let tf = TargetFiles::open(&path).unwrap();
    let secondary = tf.for_secondary_images(false).unwrap();

    assert_eq!(
        secondary.ab_partitions().unwrap(),
        vec!["system", "bootloader"],
    );
    assert_eq!(secondary.read("IMAGES/system.img").unwrap(), b"secondary");
    assert!(!secondary.has_entry("IMAGES/boot.img").unwrap());
    assert!(!secondary.has_entry("IMAGES/vbmeta.img").unwrap());

    let info: BTreeMap<String, String> =
        parse_properties(&secondary.read_string("META/misc_info.txt").unwrap());
    assert_eq!(info.get("super_x_partition_list").map(|s| s.as_str()), Some("system"));
    assert!(!info.contains_key("virtual_ab"));
}
