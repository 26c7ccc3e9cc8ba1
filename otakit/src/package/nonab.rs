// SPDX-FileCopyrightText: 2022-2025 The otakit developers
// SPDX-License-Identifier: GPL-3.0-only

//! Non-A/B (block-based) package construction for legacy devices: per
//! partition block differences, the recovery-replayable install script, and
//! the two-step install state machine.

use std::{
    fs::File,
    io::{self, Seek, Write},
    path::Path,
    sync::atomic::AtomicBool,
};

use rayon::prelude::*;
use thiserror::Error;
use tracing::{info, warn};
use zip::{ZipWriter, write::FileOptions};

use crate::{
    blockimg::{self, BlockImage, BlockImageDiff},
    build_info::BuildInfo,
    config::OtaConfig,
    edify::{EdifyScript, TwoStepDevices, emit_two_step},
    format::{ota::OtaMetadata, rangeset::RangeSet},
    package::device::DeviceExtension,
    process::{self, ProcessRunner},
    target_files::{self, TargetFiles},
};

/// Partitions eligible for block-based updates, in install order. The system
/// partition is special for progress accounting.
pub const BLOCK_UPDATE_CANDIDATES: &[&str] = &["system", "vendor", "product", "odm", "system_ext"];

const UPDATER_SCRIPT: &str = "META-INF/com/google/android/updater-script";
const UPDATE_BINARY: &str = "META-INF/com/google/android/update-binary";

/// Filesystems whose images must never be diffed file-wise: the compressed
/// layout shifts globally on any change.
const NO_IMGDIFF_FS_TYPES: &[&str] = &["squashfs", "erofs"];

/// Progress share assigned to each non-system partition; the system partition
/// receives the remainder.
const NON_SYSTEM_PROGRESS: f64 = 0.1;

/// Additional progress reserved when the package wipes userdata.
const WIPE_PROGRESS: f64 = 0.1;

#[derive(Debug, Error)]
pub enum Error {
    #[error("No updater binary in target build (OTA/bin/updater)")]
    MissingUpdaterBinary,
    #[error("No recovery image in target build (IMAGES/recovery.img)")]
    MissingRecoveryImage,
    #[error("No block device known for partition: {0}")]
    MissingBlockDevice(String),
    #[error("No control block device in recovery fstab (/misc)")]
    MissingMiscDevice,
    #[error("Unsupported block image diff version: {0}")]
    UnsupportedVersion(u32),
    #[error("Block image error")]
    BlockImg(#[from] blockimg::Error),
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

/// The instruction to bring one partition from a source state (or nothing,
/// for full installs) to the target state. Created once per partition per
/// package; immutable after [`Self::compute`].
pub struct BlockDifference {
    partition: String,
    diff: BlockImageDiff,
    version: u32,
    check_first_block: bool,
    // The extracted raw images live only as long as this difference does.
    _tgt_image: tempfile::NamedTempFile,
    _src_image: Option<tempfile::NamedTempFile>,
}

impl BlockDifference {
    /// A one-sided difference: whole-image write, used for full OTAs and for
    /// partitions that don't exist in the source build.
    pub fn full(partition: &str, version: u32, tgt_image: tempfile::NamedTempFile) -> Result<Self> {
        check_version(version)?;
        let tgt = BlockImage::from_path(tgt_image.path())?;

        Ok(Self {
            partition: partition.to_owned(),
            diff: BlockImageDiff::new(tgt, None, version, false),
            version,
            check_first_block: false,
            _tgt_image: tgt_image,
            _src_image: None,
        })
    }

    /// A two-sided difference transforming the source image into the target
    /// image. `check_first_block` adds the remount-detection check for
    /// journaling filesystems; `disable_imgdiff` is set for filesystems that
    /// cannot be diffed in chunks.
    pub fn incremental(
        partition: &str,
        version: u32,
        tgt_image: tempfile::NamedTempFile,
        src_image: tempfile::NamedTempFile,
        check_first_block: bool,
        disable_imgdiff: bool,
    ) -> Result<Self> {
        check_version(version)?;
        let tgt = BlockImage::from_path(tgt_image.path())?;
        let src = BlockImage::from_path(src_image.path())?;

        Ok(Self {
            partition: partition.to_owned(),
            diff: BlockImageDiff::new(tgt, Some(src), version, disable_imgdiff),
            version,
            check_first_block,
            _tgt_image: tgt_image,
            _src_image: Some(src_image),
        })
    }

    pub fn partition(&self) -> &str {
        &self.partition
    }

    pub fn is_incremental(&self) -> bool {
        self.diff.source().is_some()
    }

    pub fn compute(&mut self, runner: &dyn ProcessRunner, cancel_signal: &AtomicBool) -> Result<()> {
        self.diff.compute(runner, cancel_signal)?;

        Ok(())
    }

    /// Scratch ("cache") size the installer needs for this partition.
    pub fn required_cache(&self) -> u64 {
        self.diff.required_cache()
    }

    /// Emit the verification half of the install: run before any partition is
    /// modified so a bad flash is caught while everything is still intact.
    pub fn write_verify_script(&self, script: &mut EdifyScript, device: &str) -> Result<()> {
        if self.check_first_block {
            let first_block = RangeSet::from_pairs([(0, 1)]);
            let sha1 = self
                .diff
                .source()
                .expect("First block check requires a source image")
                .range_sha1(&first_block)?;

            script.range_sha1_check(
                device,
                &first_block.to_string_raw(),
                &sha1,
                &format!(
                    "E3008: Partition {} has been remounted R/W. Reflash the device to \
                     reenable OTA updates.",
                    self.partition,
                ),
            );
        }

        script.block_image_verify(&self.partition, device);

        Ok(())
    }

    /// Emit the update command for this partition.
    pub fn write_update_script(&self, script: &mut EdifyScript, device: &str) {
        script.print(&format!("Patching {} image...", self.partition));
        script.block_image_update(&self.partition, device);
    }

    /// Write the transfer list and data blobs into the package.
    pub fn write_to_zip(
        &self,
        zip: &mut ZipWriter<impl Write + Seek>,
        cancel_signal: &AtomicBool,
    ) -> Result<()> {
        self.diff.write_to_zip(&self.partition, zip, cancel_signal)?;

        Ok(())
    }
}

fn check_version(version: u32) -> Result<()> {
    if !(3..=4).contains(&version) {
        return Err(Error::UnsupportedVersion(version));
    }

    Ok(())
}

/// The block image diff format version supported by both builds involved.
fn blockimgdiff_version(target_info: &BuildInfo, source_info: Option<&BuildInfo>) -> u32 {
    let parse = |info: &BuildInfo| -> u32 {
        info.get("blockimgdiff_versions")
            .and_then(|v| v.split(',').filter_map(|t| t.trim().parse().ok()).max())
            .unwrap_or(4)
    };

    let version = parse(target_info);

    match source_info {
        Some(source_info) => version.min(parse(source_info)),
        None => version,
    }
}

/// Compute the per-partition block differences for a package. Device-specific
/// overrides replace generic entries; a conflict is logged but the override
/// always wins.
fn collect_block_differences(
    target: &TargetFiles,
    target_info: &BuildInfo,
    source: Option<(&TargetFiles, &BuildInfo)>,
    device_extension: &dyn DeviceExtension,
) -> Result<Vec<BlockDifference>> {
    let version = blockimgdiff_version(target_info, source.map(|(_, i)| i));
    let mut diffs: Vec<BlockDifference> = vec![];

    for &partition in BLOCK_UPDATE_CANDIDATES {
        if !target.has_entry(&format!("IMAGES/{partition}.img"))? {
            continue;
        }

        let tgt_image = target.extract_image(partition)?;

        let source_image = match source {
            Some((source, source_info)) => {
                if source.has_entry(&format!("IMAGES/{partition}.img"))? {
                    Some((source.extract_image(partition)?, source_info))
                } else {
                    info!("{partition} not present in source build; sending full image");
                    None
                }
            }
            None => None,
        };

        let diff = match source_image {
            Some((src_image, source_info)) => {
                let tgt_fs = target_info.fs_type(partition);
                let src_fs = source_info.fs_type(partition);

                // Chunked binary diffs corrupt compressed read-only
                // filesystems; fall back to bsdiff-only on either side.
                let disable_imgdiff = [tgt_fs, src_fs]
                    .iter()
                    .any(|t| t.is_some_and(|t| NO_IMGDIFF_FS_TYPES.contains(&t)));

                // A journaling filesystem mounted read-write dirties the
                // first block even when the contents are untouched.
                let check_first_block = tgt_fs == Some("ext4");

                BlockDifference::incremental(
                    partition,
                    version,
                    tgt_image,
                    src_image,
                    check_first_block,
                    disable_imgdiff,
                )?
            }
            None => BlockDifference::full(partition, version, tgt_image)?,
        };

        diffs.push(diff);
    }

    let overrides = if source.is_some() {
        device_extension.incremental_ota_block_differences()
    } else {
        device_extension.full_ota_block_differences()
    };

    if let Some(overrides) = overrides {
        for replacement in overrides {
            if let Some(existing) = diffs
                .iter_mut()
                .find(|d| d.partition() == replacement.partition())
            {
                warn!(
                    "Duplicate block difference found for {}. The device-specific block \
                     difference overrides the generic one.",
                    replacement.partition(),
                );
                *existing = replacement;
            } else {
                diffs.push(replacement);
            }
        }
    }

    Ok(diffs)
}

/// Progress share for each difference: a fixed slice per non-system
/// partition, the remainder for system, and a reserved slice when wiping.
fn progress_share(diffs: &[BlockDifference], partition: &str, wipe: bool) -> f64 {
    if partition != "system" {
        return NON_SYSTEM_PROGRESS;
    }

    let non_system = diffs.iter().filter(|d| d.partition() != "system").count();
    let mut share = 1.0 - NON_SYSTEM_PROGRESS * non_system as f64;

    if wipe {
        share -= WIPE_PROGRESS;
    }

    share
}

fn partition_device<'a>(info: &'a BuildInfo, partition: &str) -> Result<&'a str> {
    info.partition_device(partition)
        .ok_or_else(|| Error::MissingBlockDevice(partition.to_owned()))
}

/// Emit the main install body (everything inside the final two-step stage,
/// or the whole script for one-step packages).
fn emit_install_body(
    script: &mut EdifyScript,
    config: &OtaConfig,
    target_info: &BuildInfo,
    source_fingerprint: Option<&str>,
    diffs: &[BlockDifference],
    has_boot_image: bool,
) -> Result<()> {
    let incremental = source_fingerprint.is_some();

    if incremental {
        let target_fingerprint = target_info.fingerprint()?;
        script.assert_some_fingerprint(&[source_fingerprint.unwrap(), target_fingerprint.as_str()]);

        let required_cache = diffs.iter().map(|d| d.required_cache()).max().unwrap_or(0);
        if required_cache > 0 {
            script.cache_free_space_check(required_cache);
        }

        script.print("Verifying current system...");
        for diff in diffs {
            if diff.is_incremental() {
                diff.write_verify_script(script, partition_device(target_info, diff.partition())?)?;
            }
        }
    }

    for diff in diffs {
        script.show_progress(
            progress_share(diffs, diff.partition(), config.wipe_user_data),
            0,
        );
        diff.write_update_script(script, partition_device(target_info, diff.partition())?);
    }

    if has_boot_image {
        script.print("Writing boot image...");
        script.write_raw_image("boot.img", partition_device(target_info, "boot")?);
    }

    script.set_progress(1.0);

    Ok(())
}

/// Generate a block-based OTA package into the staging archive. The metadata
/// entry itself is written later by the finalization protocol; this only
/// updates the fields the block differences determine.
#[allow(clippy::too_many_arguments)]
pub fn generate_non_ab_package(
    config: &OtaConfig,
    target: &TargetFiles,
    target_info: &BuildInfo,
    source: Option<(&TargetFiles, &BuildInfo)>,
    device_extension: &dyn DeviceExtension,
    metadata: &mut OtaMetadata,
    staging_path: &Path,
    runner: &dyn ProcessRunner,
    cancel_signal: &AtomicBool,
) -> Result<()> {
    // The updater binary from the target build installs the package, unless a
    // development override was given.
    let updater_binary = match &config.updater_binary {
        Some(path) => std::fs::read(path)?,
        None => target
            .read_opt("OTA/bin/updater")?
            .ok_or(Error::MissingUpdaterBinary)?,
    };

    let mut diffs = collect_block_differences(target, target_info, source, device_extension)?;

    // Partition diffs are independent; compute them on the worker pool. The
    // archive writes below stay on this thread since they share one output.
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(config.worker_threads)
        .build()
        .map_err(|e| Error::Io(io::Error::other(e)))?;

    info!(
        "Computing block differences for {} partitions on {} threads",
        diffs.len(),
        config.worker_threads,
    );

    pool.install(|| {
        diffs
            .par_iter_mut()
            .try_for_each(|diff| diff.compute(runner, cancel_signal))
    })?;

    let required_cache = diffs.iter().map(|d| d.required_cache()).max().unwrap_or(0);
    metadata.required_cache = required_cache;

    // Build the install script.
    let mut script = EdifyScript::new();

    script.comment(&format!(
        "Install script for {}",
        target_info.fingerprint()?
    ));
    script.assert_device(target_info.device()?);
    device_extension.device_specific_assertions(&mut script);

    let source_fingerprint = match source {
        Some((_, source_info)) => Some(source_info.fingerprint()?),
        None => None,
    };
    let has_boot_image = target.has_entry("IMAGES/boot.img")?;

    if config.two_step {
        let devices = TwoStepDevices {
            bcb: target_info
                .misc_device()
                .ok_or(Error::MissingMiscDevice)?
                .to_owned(),
            boot: partition_device(target_info, "boot")?.to_owned(),
            recovery: partition_device(target_info, "recovery")?.to_owned(),
        };

        let mut body = EdifyScript::new();
        emit_install_body(
            &mut body,
            config,
            target_info,
            source_fingerprint.as_deref(),
            &diffs,
            has_boot_image,
        )?;

        emit_two_step(&mut script, &devices, move |s| {
            // Splice the prebuilt body into the final stage.
            for line in body.finish().lines() {
                s.emit(line);
            }
        });
    } else {
        emit_install_body(
            &mut script,
            config,
            target_info,
            source_fingerprint.as_deref(),
            &diffs,
            has_boot_image,
        )?;
    }

    // Assemble the staging archive.
    let file = File::create(staging_path)?;
    let mut zip = ZipWriter::new(file);

    for diff in &diffs {
        diff.write_to_zip(&mut zip, cancel_signal)?;
    }

    if has_boot_image {
        let boot = target.read("IMAGES/boot.img")?;
        zip.start_file("boot.img", FileOptions::default())?;
        zip.write_all(&boot)?;
    }

    if config.two_step {
        let recovery = target
            .read_opt("IMAGES/recovery.img")?
            .ok_or(Error::MissingRecoveryImage)?;
        zip.start_file("recovery.img", FileOptions::default())?;
        zip.write_all(&recovery)?;
    }

    zip.start_file(UPDATE_BINARY, FileOptions::default())?;
    zip.write_all(&updater_binary)?;

    zip.start_file(UPDATER_SCRIPT, FileOptions::default())?;
    zip.write_all(script.finish().as_bytes())?;

    zip.finish()?;

    Ok(())
}
