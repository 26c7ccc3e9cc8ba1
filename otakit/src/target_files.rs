// SPDX-FileCopyrightText: 2022-2025 The otakit developers
// SPDX-License-Identifier: GPL-3.0-only

use std::{
    collections::BTreeMap,
    io::{self, Read, Write},
    path::{Path, PathBuf},
};

use tempfile::{NamedTempFile, TempPath};
use thiserror::Error;
use tracing::{info, warn};
use zip::{ZipWriter, write::FileOptions};

use crate::{
    build_info::{self, BuildInfo, parse_fstab, parse_properties},
    format::zip as zip_util,
};

pub const AB_PARTITIONS: &str = "META/ab_partitions.txt";
pub const MISC_INFO: &str = "META/misc_info.txt";
pub const DYNAMIC_PARTITIONS_INFO: &str = "META/dynamic_partitions_info.txt";
pub const POSTINSTALL_CONFIG: &str = "META/postinstall_config.txt";
pub const UPDATE_ENGINE_CONFIG: &str = "META/update_engine_config.txt";

const BUILD_PROP: &str = "SYSTEM/build.prop";
const RECOVERY_FSTABS: &[&str] = &[
    "RECOVERY/RAMDISK/system/etc/recovery.fstab",
    "RECOVERY/RAMDISK/etc/recovery.fstab",
];

/// Images to be excluded from the secondary payload. We essentially only keep
/// `system_other` and bootloader partitions.
pub const SECONDARY_PAYLOAD_SKIPPED_IMAGES: &[&str] = &[
    "boot",
    "dtbo",
    "modem",
    "odm",
    "odm_dlkm",
    "product",
    "radio",
    "recovery",
    "system_ext",
    "vbmeta",
    "vbmeta_system",
    "vbmeta_vendor",
    "vendor",
    "vendor_boot",
];

/// The suffix in misc_info variables whose value is a space-separated list of
/// partitions belonging to a partition group.
const PARTITION_LIST_SUFFIX: &str = "partition_list";

#[derive(Debug, Error)]
pub enum Error {
    #[error("Unrecognized partitions for partial update: {0:?}")]
    UnknownPartialPartitions(Vec<String>),
    #[error("No super_block_devices are specified in the target build")]
    NoSuperBlockDevices,
    #[error("{0} is in super_block_devices but not in {AB_PARTITIONS}")]
    SuperDeviceNotUpdated(String),
    #[error("Cannot find image for partition: {0}")]
    MissingPartitionImage(String),
    #[error("{0} is a sparse image; only raw block images are supported")]
    SparseImage(String),
    #[error("Build info error")]
    BuildInfo(#[from] build_info::Error),
    #[error("Zip helper error")]
    ZipUtil(#[from] zip_util::Error),
    #[error("Zip error")]
    Zip(#[from] zip::result::ZipError),
    #[error("I/O error")]
    Io(#[from] io::Error),
}

type Result<T> = std::result::Result<T, Error>;

/// Magic for the Android sparse image format.
const SPARSE_MAGIC: [u8; 4] = [0x3a, 0xff, 0x26, 0xed];

/// A target-files archive. The derived transforms return new instances backed
/// by temporary files that are deleted when the value is dropped.
#[derive(Debug)]
pub struct TargetFiles {
    path: PathBuf,
    _temp: Option<TempPath>,
}

impl TargetFiles {
    pub fn open(path: &Path) -> Result<Self> {
        // Validate eagerly so a bad path fails before any real work starts.
        zip_util::open_archive(path)?;

        Ok(Self {
            path: path.to_owned(),
            _temp: None,
        })
    }

    fn from_temp(temp: TempPath) -> Self {
        Self {
            path: temp.to_path_buf(),
            _temp: Some(temp),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn has_entry(&self, name: &str) -> Result<bool> {
        let mut zip = zip_util::open_archive(&self.path)?;

        Ok(zip_util::has_entry(&mut zip, name))
    }

    pub fn entry_names(&self) -> Result<Vec<String>> {
        let mut zip = zip_util::open_archive(&self.path)?;
        let mut names = vec![];

        for i in 0..zip.len() {
            names.push(zip.by_index_raw(i)?.name().to_owned());
        }

        Ok(names)
    }

    pub fn read(&self, name: &str) -> Result<Vec<u8>> {
        let mut zip = zip_util::open_archive(&self.path)?;

        Ok(zip_util::read_entry(&mut zip, name)?)
    }

    pub fn read_opt(&self, name: &str) -> Result<Option<Vec<u8>>> {
        let mut zip = zip_util::open_archive(&self.path)?;

        Ok(zip_util::read_entry_opt(&mut zip, name)?)
    }

    pub fn read_string(&self, name: &str) -> Result<String> {
        let mut zip = zip_util::open_archive(&self.path)?;

        Ok(zip_util::read_entry_string(&mut zip, name)?)
    }

    pub fn ab_partitions(&self) -> Result<Vec<String>> {
        let text = self.read_string(AB_PARTITIONS)?;

        Ok(text
            .lines()
            .map(|l| l.trim())
            .filter(|l| !l.is_empty())
            .map(|l| l.to_owned())
            .collect())
    }

    /// Load the build property dictionaries into an immutable [`BuildInfo`].
    pub fn build_info(&self, oem_props: Option<BTreeMap<String, String>>) -> Result<BuildInfo> {
        let mut zip = zip_util::open_archive(&self.path)?;

        let misc_info = parse_properties(&zip_util::read_entry_string(&mut zip, MISC_INFO)?);

        let build_props = match zip_util::read_entry_opt(&mut zip, BUILD_PROP)? {
            Some(data) => parse_properties(&String::from_utf8_lossy(&data)),
            None => BTreeMap::new(),
        };

        let mut fstab = BTreeMap::new();
        for path in RECOVERY_FSTABS {
            if let Some(data) = zip_util::read_entry_opt(&mut zip, path)? {
                fstab = parse_fstab(&String::from_utf8_lossy(&data));
                break;
            }
        }

        let ab_partitions = match zip_util::read_entry_opt(&mut zip, AB_PARTITIONS)? {
            Some(data) => Some(
                String::from_utf8_lossy(&data)
                    .lines()
                    .map(|l| l.trim())
                    .filter(|l| !l.is_empty())
                    .map(|l| l.to_owned())
                    .collect(),
            ),
            None => None,
        };

        Ok(BuildInfo::new(
            misc_info,
            build_props,
            oem_props,
            fstab,
            ab_partitions,
        ))
    }

    /// Extract a partition's raw block image to a temporary file. Sparse
    /// images are rejected; the block diff layer works on raw images only.
    pub fn extract_image(&self, partition: &str) -> Result<NamedTempFile> {
        let name = format!("IMAGES/{partition}.img");
        let mut zip = zip_util::open_archive(&self.path)?;

        let mut entry = zip
            .by_name(&name)
            .map_err(|_| Error::MissingPartitionImage(partition.to_owned()))?;

        let mut temp = tempfile::Builder::new()
            .prefix(&format!("{partition}-"))
            .suffix(".img")
            .tempfile()?;

        io::copy(&mut entry, temp.as_file_mut())?;

        let mut magic = [0u8; 4];
        let file = temp.as_file_mut();
        if file_read_at_start(file, &mut magic)? && magic == SPARSE_MAGIC {
            return Err(Error::SparseImage(name));
        }

        Ok(temp)
    }

    /// Returns a target-files archive without `META/postinstall_config.txt`,
    /// so the delta generator skips writing postinstall hooks. Returns `None`
    /// when the entry doesn't exist and the original archive can be used
    /// directly.
    pub fn without_postinstall_config(&self) -> Result<Option<TargetFiles>> {
        if !self.has_entry(POSTINSTALL_CONFIG)? {
            return Ok(None);
        }

        let mut zip = zip_util::open_archive(&self.path)?;
        let (mut writer, temp) = temp_zip_writer()?;

        zip_util::copy_filtered(&mut zip, &mut writer, |name| {
            if name == POSTINSTALL_CONFIG {
                None
            } else {
                Some(name.to_owned())
            }
        })?;

        writer.finish()?;

        Ok(Some(Self::from_temp(temp)))
    }

    /// Returns a target-files archive for generating the secondary payload.
    ///
    /// The secondary slot images exist under their `_other` names
    /// (e.g. `IMAGES/system_other.img`) and have to be renamed, because there
    /// are no matching `_other` partitions on device. Partitions without
    /// secondary images keep their primary images so that the inactive slot
    /// always has valid boot, vbmeta, and bootloader bits.
    pub fn for_secondary_images(&self, skip_postinstall: bool) -> Result<TargetFiles> {
        let skipped_images = SECONDARY_PAYLOAD_SKIPPED_IMAGES
            .iter()
            .map(|p| format!("{p}.img"))
            .collect::<Vec<_>>();

        let mut zip = zip_util::open_archive(&self.path)?;
        let (mut writer, temp) = temp_zip_writer()?;

        for i in 0..zip.len() {
            let name = zip.by_index_raw(i)?.name().to_owned();
            let base = name.rsplit_once('/').map_or(name.as_str(), |p| p.1);

            if name == "IMAGES/system_other.img" {
                let entry = zip.by_index_raw(i)?;
                writer.raw_copy_file_rename(entry, "IMAGES/system.img")?;
            } else if name == "IMAGES/system.img" || name == "IMAGES/system.map" {
                // Primary images and friends need to be skipped explicitly.
            } else if name.starts_with("IMAGES/") || name.starts_with("RADIO/") {
                if !skipped_images.iter().any(|img| img == base) {
                    let entry = zip.by_index_raw(i)?;
                    writer.raw_copy_file(entry)?;
                }
            } else if skip_postinstall && name == POSTINSTALL_CONFIG {
                // Skip copying the postinstall config if requested.
            } else if name == AB_PARTITIONS {
                let content = read_index_string(&mut zip, i)?;
                let partitions = content
                    .lines()
                    .filter(|p| !p.is_empty())
                    .filter(|p| !SECONDARY_PAYLOAD_SKIPPED_IMAGES.contains(p))
                    .collect::<Vec<_>>();

                writer.start_file(name.as_str(), FileOptions::default())?;
                writer.write_all(partitions.join("\n").as_bytes())?;
            } else if name == MISC_INFO || name == DYNAMIC_PARTITIONS_INFO {
                let content = read_index_string(&mut zip, i)?;
                // Remove the virtual_ab flags so the OTA client doesn't use
                // snapshots for the secondary update.
                let modified = update_info_for_special_updates(
                    &content,
                    |p| !SECONDARY_PAYLOAD_SKIPPED_IMAGES.contains(&p),
                    &["virtual_ab", "virtual_ab_retrofit"],
                );

                writer.start_file(name.as_str(), FileOptions::default())?;
                writer.write_all(modified.as_bytes())?;
            } else if name.starts_with("META/") {
                let entry = zip.by_index_raw(i)?;
                writer.raw_copy_file(entry)?;
            }
        }

        writer.finish()?;

        Ok(Self::from_temp(temp))
    }

    /// Returns a target-files archive for retrofitting dynamic partitions.
    ///
    /// The delta generator must see the exact bits on the physical block
    /// devices, so every super block device's `OTA/super_<dev>.img` replaces
    /// `IMAGES/<dev>.img`, the logical partitions are dropped from
    /// `ab_partitions.txt`, and postinstall is disabled.
    pub fn for_retrofit_dynamic_partitions(&self, info: &BuildInfo) -> Result<TargetFiles> {
        let super_block_devices = info.super_block_devices();
        let dynamic_partition_list = info.dynamic_partition_list();

        if super_block_devices.is_empty() {
            return Err(Error::NoSuperBlockDevices);
        }

        let ab_partitions = self.ab_partitions()?;

        for dev in &super_block_devices {
            if !ab_partitions.contains(dev) {
                return Err(Error::SuperDeviceNotUpdated(dev.clone()));
            }
        }

        let mut zip = zip_util::open_archive(&self.path)?;

        let mut super_indices = vec![];
        for dev in &super_block_devices {
            let name = format!("OTA/super_{dev}.img");
            let index = zip_util::index_of(&mut zip, &name)?
                .ok_or_else(|| Error::MissingPartitionImage(name.clone()))?;
            super_indices.push((index, format!("IMAGES/{dev}.img")));
        }

        let mut to_delete = vec![
            AB_PARTITIONS.to_owned(),
            // Always skip postinstall for a retrofit update.
            POSTINSTALL_CONFIG.to_owned(),
            // Delete dynamic_partitions_info.txt so the delta generator treats
            // this as a regular update on a device without dynamic partitions.
            DYNAMIC_PARTITIONS_INFO.to_owned(),
        ];
        for dev in &super_block_devices {
            to_delete.push(format!("IMAGES/{dev}.img"));
            to_delete.push(format!("IMAGES/{dev}.map"));
        }

        let new_ab_partitions = ab_partitions
            .iter()
            .filter(|p| {
                let drop = dynamic_partition_list.iter().any(|d| d == *p)
                    && !super_block_devices.iter().any(|d| d == *p);
                if drop {
                    info!("Dropping {p} from {AB_PARTITIONS}");
                }
                !drop
            })
            .cloned()
            .collect::<Vec<_>>();

        let (mut writer, temp) = temp_zip_writer()?;

        zip_util::copy_filtered(&mut zip, &mut writer, |name| {
            if to_delete.iter().any(|d| d == name) {
                None
            } else {
                Some(name.to_owned())
            }
        })?;

        // Write super_{foo}.img as {foo}.img.
        for (index, new_name) in super_indices {
            let entry = zip.by_index_raw(index)?;
            writer.raw_copy_file_rename(entry, new_name)?;
        }

        writer.start_file(AB_PARTITIONS, FileOptions::default())?;
        let mut content = new_ab_partitions.join("\n");
        content.push('\n');
        writer.write_all(content.as_bytes())?;

        writer.finish()?;

        Ok(Self::from_temp(temp))
    }

    /// Returns a target-files archive containing only the requested
    /// partitions, for partial update generation.
    pub fn for_partial_update(&self, partitions: &[String]) -> Result<TargetFiles> {
        let original_ab_partitions = self.ab_partitions()?;

        let unrecognized = partitions
            .iter()
            .filter(|p| !original_ab_partitions.contains(*p))
            .cloned()
            .collect::<Vec<_>>();
        if !unrecognized.is_empty() {
            return Err(Error::UnknownPartialPartitions(unrecognized));
        }

        info!("Generating partial updates for {partitions:?}");

        let mut zip = zip_util::open_archive(&self.path)?;

        let mut copy_indices = vec![];
        if let Some(i) = zip_util::index_of(&mut zip, UPDATE_ENGINE_CONFIG)? {
            copy_indices.push(i);
        }

        for partition in partitions {
            let mut found = false;

            for prefix in ["IMAGES", "RADIO"] {
                let image = format!("{prefix}/{partition}.img");
                if let Some(i) = zip_util::index_of(&mut zip, &image)? {
                    copy_indices.push(i);
                    found = true;

                    let map = format!("{prefix}/{partition}.map");
                    if let Some(i) = zip_util::index_of(&mut zip, &map)? {
                        copy_indices.push(i);
                    }

                    break;
                }
            }

            if !found {
                return Err(Error::MissingPartitionImage(partition.clone()));
            }
        }

        let (mut writer, temp) = temp_zip_writer()?;

        for index in copy_indices {
            let entry = zip.by_index_raw(index)?;
            writer.raw_copy_file(entry)?;
        }

        writer.start_file(AB_PARTITIONS, FileOptions::default())?;
        writer.write_all(partitions.join("\n").as_bytes())?;

        for info_file in [MISC_INFO, DYNAMIC_PARTITIONS_INFO] {
            let Some(i) = zip_util::index_of(&mut zip, info_file)? else {
                warn!("Cannot find {info_file} in input zipfile");
                continue;
            };

            let content = read_index_string(&mut zip, i)?;
            let modified = update_info_for_special_updates(
                &content,
                |p| partitions.iter().any(|x| x == p),
                &[],
            );

            writer.start_file(info_file, FileOptions::default())?;
            writer.write_all(modified.as_bytes())?;
        }

        writer.finish()?;

        Ok(Self::from_temp(temp))
    }
}

fn temp_zip_writer() -> Result<(ZipWriter<std::fs::File>, TempPath)> {
    let temp = tempfile::Builder::new()
        .prefix("targetfiles-")
        .suffix(".zip")
        .tempfile()?;
    let (file, path) = temp.into_parts();

    Ok((ZipWriter::new(file), path))
}

fn read_index_string(
    zip: &mut zip::ZipArchive<impl Read + io::Seek>,
    index: usize,
) -> Result<String> {
    let mut entry = zip.by_index(index)?;
    let mut buf = String::new();
    entry.read_to_string(&mut buf)?;

    Ok(buf)
}

fn file_read_at_start(file: &mut std::fs::File, buf: &mut [u8]) -> Result<bool> {
    use std::io::{Seek, SeekFrom};

    let len = file.seek(SeekFrom::End(0))?;
    if len < buf.len() as u64 {
        return Ok(false);
    }

    file.seek(SeekFrom::Start(0))?;
    file.read_exact(buf)?;
    file.seek(SeekFrom::Start(0))?;

    Ok(true)
}

/// Rewrite an info file (e.g. misc_info.txt) for secondary payloads and
/// partial updates: unwanted partitions are dropped from every
/// `*_partition_list` value and the listed keys are deleted.
pub fn update_info_for_special_updates(
    content: &str,
    keep_partition: impl Fn(&str) -> bool,
    delete_keys: &[&str],
) -> String {
    let mut output = vec![];

    for line in content.lines() {
        if line.starts_with('#') || !line.contains('=') {
            output.push(line.to_owned());
            continue;
        }

        let (key, value) = line.trim().split_once('=').unwrap();

        if delete_keys.contains(&key) {
            continue;
        }

        if key.ends_with(PARTITION_LIST_SUFFIX) {
            let partitions = value
                .split_whitespace()
                .filter(|p| keep_partition(p))
                .collect::<Vec<_>>();
            output.push(format!("{key}={}", partitions.join(" ")));
        } else {
            output.push(line.to_owned());
        }
    }

    output.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build_target_files(entries: &[(&str, &[u8])]) -> TargetFiles {
        let (mut writer, temp) = temp_zip_writer().unwrap();

        for (name, data) in entries {
            writer.start_file(*name, FileOptions::default()).unwrap();
            writer.write_all(data).unwrap();
        }

        writer.finish().unwrap();

        TargetFiles::from_temp(temp)
    }

    #[test]
    fn info_rewrite_filters_partition_lists() {
        let content = "super_partition_groups=google_dynamic_partitions\n\
                       super_google_dynamic_partitions_partition_list=system vendor product\n\
                       virtual_ab=true\n\
                       ab_update=true";

        let modified = update_info_for_special_updates(
            content,
            |p| p == "system",
            &["virtual_ab", "virtual_ab_retrofit"],
        );

        assert!(modified.contains("super_google_dynamic_partitions_partition_list=system\n"));
        assert!(!modified.contains("virtual_ab=true"));
        assert!(modified.contains("ab_update=true"));
    }

    #[test]
    fn secondary_transform_applies_skip_list() {
        let tf = build_target_files(&[
            ("IMAGES/system.img", b"primary"),
            ("IMAGES/system_other.img", b"secondary"),
            ("IMAGES/boot.img", b"boot"),
            ("IMAGES/bootloader.img", b"bl"),
            ("RADIO/modem.img", b"modem"),
            (
                AB_PARTITIONS,
                b"system\nboot\nvendor\nbootloader" as &[u8],
            ),
            (MISC_INFO, b"ab_update=true\nvirtual_ab=true\n"),
            (POSTINSTALL_CONFIG, b"RUN_POSTINSTALL_system=true\n"),
        ]);

        let secondary = tf.for_secondary_images(true).unwrap();
        let names = secondary.entry_names().unwrap();

        // system_other is renamed, skip-list images and postinstall are gone.
        assert!(names.contains(&"IMAGES/system.img".to_owned()));
        assert!(names.contains(&"IMAGES/bootloader.img".to_owned()));
        assert!(!names.contains(&"IMAGES/system_other.img".to_owned()));
        assert!(!names.contains(&"IMAGES/boot.img".to_owned()));
        assert!(!names.contains(&"RADIO/modem.img".to_owned()));
        assert!(!names.contains(&POSTINSTALL_CONFIG.to_owned()));

        assert_eq!(secondary.read("IMAGES/system.img").unwrap(), b"secondary");

        let partitions = secondary.ab_partitions().unwrap();
        assert_eq!(partitions, vec!["system", "bootloader"]);

        let misc = secondary.read_string(MISC_INFO).unwrap();
        assert!(!misc.contains("virtual_ab=true"));
    }

    #[test]
    fn partial_transform_subsets_partitions() {
        let tf = build_target_files(&[
            ("IMAGES/system.img", b"sys"),
            ("IMAGES/system.map", b"map"),
            ("IMAGES/vendor.img", b"ven"),
            (UPDATE_ENGINE_CONFIG, b"PAYLOAD_MAJOR_VERSION=2\n"),
            (AB_PARTITIONS, b"system\nvendor\n" as &[u8]),
            (
                MISC_INFO,
                b"dynamic_partition_list=system vendor\n\
                  super_group_partition_list=system vendor\n",
            ),
        ]);

        let partial = tf.for_partial_update(&["system".to_owned()]).unwrap();
        let names = partial.entry_names().unwrap();

        assert!(names.contains(&"IMAGES/system.img".to_owned()));
        assert!(names.contains(&"IMAGES/system.map".to_owned()));
        assert!(!names.contains(&"IMAGES/vendor.img".to_owned()));

        assert_eq!(partial.ab_partitions().unwrap(), vec!["system"]);

        let misc = partial.read_string(MISC_INFO).unwrap();
        assert!(misc.contains("super_group_partition_list=system\n") || misc.ends_with("super_group_partition_list=system"));

        let err = tf
            .for_partial_update(&["oem".to_owned()])
            .unwrap_err();
        assert!(matches!(err, Error::UnknownPartialPartitions(p) if p == vec!["oem".to_owned()]));
    }

    #[test]
    fn retrofit_transform_is_repeatable() {
        let entries: &[(&str, &[u8])] = &[
            ("IMAGES/super.img", b"logical"),
            ("IMAGES/system.img", b"sys"),
            ("IMAGES/vendor.img", b"ven"),
            ("OTA/super_super.img", b"physical"),
            (AB_PARTITIONS, b"boot\nsuper\nsystem\nvendor\n"),
            (POSTINSTALL_CONFIG, b"RUN_POSTINSTALL_system=true\n"),
            (DYNAMIC_PARTITIONS_INFO, b"use_dynamic_partitions=true\n"),
            (
                MISC_INFO,
                b"use_dynamic_partitions=true\n\
                  dynamic_partition_retrofit=true\n\
                  super_block_devices=super\n\
                  dynamic_partition_list=system vendor\n",
            ),
        ];
        let tf = build_target_files(entries);
        let info = tf.build_info(None).unwrap();

        let retrofit = tf.for_retrofit_dynamic_partitions(&info).unwrap();
        let names = retrofit.entry_names().unwrap();

        assert!(names.contains(&"IMAGES/super.img".to_owned()));
        assert_eq!(retrofit.read("IMAGES/super.img").unwrap(), b"physical");
        assert!(!names.contains(&POSTINSTALL_CONFIG.to_owned()));
        assert!(!names.contains(&DYNAMIC_PARTITIONS_INFO.to_owned()));
        assert_eq!(retrofit.ab_partitions().unwrap(), vec!["boot", "super"]);

        // Applying the transform to already-transformed output must be a
        // no-op, not a second rename.
        let info2 = retrofit.build_info(None).unwrap();
        let again = retrofit.for_retrofit_dynamic_partitions(&info2).unwrap();

        assert_eq!(again.ab_partitions().unwrap(), vec!["boot", "super"]);
        assert_eq!(again.read("IMAGES/super.img").unwrap(), b"physical");
    }
}
