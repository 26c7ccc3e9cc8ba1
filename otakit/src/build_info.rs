// SPDX-FileCopyrightText: 2022-2025 The otakit developers
// SPDX-License-Identifier: GPL-3.0-only

use std::collections::BTreeMap;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Missing build property: {0}")]
    MissingProperty(String),
    #[error("Invalid value for {key}: {value:?}")]
    InvalidProperty { key: String, value: String },
}

type Result<T> = std::result::Result<T, Error>;

/// Parse `key=value` property lines. Blank lines, comments, and lines without
/// a separator are ignored, matching how build property files are consumed on
/// device.
pub fn parse_properties(text: &str) -> BTreeMap<String, String> {
    let mut result = BTreeMap::new();

    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        if let Some((key, value)) = line.split_once('=') {
            result.insert(key.trim().to_owned(), value.trim().to_owned());
        }
    }

    result
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct FstabEntry {
    pub device: String,
    pub fs_type: String,
}

/// Parse a recovery fstab (v2 format: device, mount point, fs type, mount
/// flags, fs_mgr flags). Only the fields the package builders consume are
/// kept.
pub fn parse_fstab(text: &str) -> BTreeMap<String, FstabEntry> {
    let mut result = BTreeMap::new();

    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let fields = line.split_whitespace().collect::<Vec<_>>();
        if fields.len() < 3 {
            continue;
        }

        result.insert(
            fields[1].to_owned(),
            FstabEntry {
                device: fields[0].to_owned(),
                fs_type: fields[2].to_owned(),
            },
        );
    }

    result
}

/// An immutable view of one build's property dictionaries. Two instances
/// exist per incremental operation (source and target); one for a full OTA.
/// Nothing here is mutated after construction.
#[derive(Clone, Debug, Default)]
pub struct BuildInfo {
    misc_info: BTreeMap<String, String>,
    build_props: BTreeMap<String, String>,
    oem_props: Option<BTreeMap<String, String>>,
    fstab: BTreeMap<String, FstabEntry>,
    ab_partitions: Option<Vec<String>>,
}

impl BuildInfo {
    pub fn new(
        misc_info: BTreeMap<String, String>,
        build_props: BTreeMap<String, String>,
        oem_props: Option<BTreeMap<String, String>>,
        fstab: BTreeMap<String, FstabEntry>,
        ab_partitions: Option<Vec<String>>,
    ) -> Self {
        Self {
            misc_info,
            build_props,
            oem_props,
            fstab,
            ab_partitions,
        }
    }

    /// Raw lookup in `misc_info.txt` for genuinely dynamic, device-specific
    /// keys that have no typed accessor.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.misc_info.get(key).map(|s| s.as_str())
    }

    pub fn get_prop(&self, key: &str) -> Option<&str> {
        self.build_props.get(key).map(|s| s.as_str())
    }

    fn require_prop(&self, key: &str) -> Result<&str> {
        self.get_prop(key)
            .ok_or_else(|| Error::MissingProperty(key.to_owned()))
    }

    fn misc_flag(&self, key: &str) -> bool {
        self.get(key) == Some("true")
    }

    pub fn is_ab(&self) -> bool {
        self.misc_flag("ab_update")
    }

    pub fn allow_non_ab(&self) -> bool {
        self.misc_flag("allow_non_ab")
    }

    pub fn is_vabc(&self) -> bool {
        self.misc_flag("virtual_ab_compression")
    }

    /// Some vendors opt out of virtual A/B compression via a vendor property
    /// even when the platform enables it.
    pub fn vendor_suppressed_vabc(&self) -> bool {
        self.get_prop("ro.vendor.build.dont_use_vabc") == Some("true")
    }

    pub fn use_dynamic_partitions(&self) -> bool {
        self.misc_flag("use_dynamic_partitions")
    }

    pub fn dynamic_partition_retrofit(&self) -> bool {
        self.misc_flag("dynamic_partition_retrofit")
    }

    pub fn super_block_devices(&self) -> Vec<String> {
        self.space_list("super_block_devices")
    }

    pub fn dynamic_partition_list(&self) -> Vec<String> {
        self.space_list("dynamic_partition_list")
    }

    fn space_list(&self, key: &str) -> Vec<String> {
        self.get(key)
            .map(|v| v.split_whitespace().map(|s| s.to_owned()).collect())
            .unwrap_or_default()
    }

    pub fn ab_partitions(&self) -> Option<&[String]> {
        self.ab_partitions.as_deref()
    }

    pub fn fstab(&self) -> &BTreeMap<String, FstabEntry> {
        &self.fstab
    }

    /// Filesystem type for a partition, from the recovery fstab when present,
    /// otherwise from `misc_info.txt`.
    pub fn fs_type(&self, partition: &str) -> Option<&str> {
        if let Some(entry) = self.fstab.get(&format!("/{partition}")) {
            return Some(&entry.fs_type);
        }

        if let Some(t) = self.get(&format!("{partition}_fs_type")) {
            return Some(t);
        }

        // The system partition's type historically has no prefix.
        if partition == "system" {
            return self.get("fs_type");
        }

        None
    }

    pub fn partition_device(&self, partition: &str) -> Option<&str> {
        self.fstab
            .get(&format!("/{partition}"))
            .map(|e| e.device.as_str())
    }

    /// Block device holding the bootloader control block, used to persist the
    /// two-step install stage across reboots.
    pub fn misc_device(&self) -> Option<&str> {
        self.fstab.get("/misc").map(|e| e.device.as_str())
    }

    pub fn device(&self) -> Result<&str> {
        if let Some(oem) = &self.oem_props {
            if let Some(device) = oem.get("ro.product.device") {
                return Ok(device);
            }
        }

        self.require_prop("ro.product.device")
    }

    /// The build fingerprint identifying this exact build. When the device
    /// keeps identity properties on the OEM partition, the fingerprint is
    /// assembled from the OEM dictionary instead of `ro.build.fingerprint`.
    pub fn fingerprint(&self) -> Result<String> {
        if self.oem_props.is_some() && self.get("oem_fingerprint_properties").is_some() {
            return self.oem_thumbprint();
        }

        if let Some(fingerprint) = self.get_prop("ro.build.fingerprint") {
            return Ok(fingerprint.to_owned());
        }

        Ok(format!(
            "{}/{}/{}:{}/{}/{}:{}/{}",
            self.require_prop("ro.product.brand")?,
            self.require_prop("ro.product.name")?,
            self.require_prop("ro.product.device")?,
            self.require_prop("ro.build.version.release")?,
            self.require_prop("ro.build.id")?,
            self.require_prop("ro.build.version.incremental")?,
            self.require_prop("ro.build.type")?,
            self.require_prop("ro.build.tags")?,
        ))
    }

    fn oem_thumbprint(&self) -> Result<String> {
        let oem = self.oem_props.as_ref().unwrap();
        let oem_prop = |key: &str| -> Result<&str> {
            oem.get(key)
                .map(|s| s.as_str())
                .ok_or_else(|| Error::MissingProperty(key.to_owned()))
        };

        Ok(format!(
            "{}/{}/{}:{}/{}/{}:{}/{}",
            oem_prop("ro.product.brand")?,
            oem_prop("ro.product.name")?,
            oem_prop("ro.product.device")?,
            self.require_prop("ro.build.version.release")?,
            self.require_prop("ro.build.id")?,
            self.require_prop("ro.build.version.incremental")?,
            self.require_prop("ro.build.type")?,
            self.require_prop("ro.build.tags")?,
        ))
    }

    pub fn build_timestamp(&self) -> Result<u64> {
        let key = "ro.build.date.utc";
        let value = self.require_prop(key)?;

        value.parse().map_err(|_| Error::InvalidProperty {
            key: key.to_owned(),
            value: value.to_owned(),
        })
    }

    pub fn build_incremental(&self) -> Result<&str> {
        self.require_prop("ro.build.version.incremental")
    }

    pub fn sdk_level(&self) -> Result<&str> {
        self.require_prop("ro.build.version.sdk")
    }

    pub fn security_patch_level(&self) -> Option<&str> {
        self.get_prop("ro.build.version.security_patch")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_info() -> BuildInfo {
        let misc_info = parse_properties(
            "ab_update=true\n\
             use_dynamic_partitions=true\n\
             super_block_devices=super\n\
             dynamic_partition_list=system vendor\n\
             # comment\n",
        );
        let build_props = parse_properties(
            "ro.product.device=walleye\n\
             ro.build.fingerprint=google/walleye/walleye:8.1.0/OPM1/1:user/release-keys\n\
             ro.build.date.utc=1500\n\
             ro.build.version.incremental=eng.123\n\
             ro.build.version.sdk=27\n\
             ro.build.version.security_patch=2021-02-05\n",
        );
        let fstab = parse_fstab(
            "# Android fstab file.\n\
             /dev/block/by-name/system  /system  ext4  ro  wait\n\
             /dev/block/by-name/vendor  /vendor  squashfs  ro  wait\n\
             /dev/block/by-name/misc    /misc    emmc  defaults  defaults\n",
        );

        BuildInfo::new(misc_info, build_props, None, fstab, None)
    }

    #[test]
    fn typed_accessors() {
        let info = test_info();

        assert!(info.is_ab());
        assert!(!info.allow_non_ab());
        assert!(info.use_dynamic_partitions());
        assert_eq!(info.super_block_devices(), vec!["super".to_owned()]);
        assert_eq!(info.device().unwrap(), "walleye");
        assert_eq!(info.build_timestamp().unwrap(), 1500);
        assert_eq!(
            info.fingerprint().unwrap(),
            "google/walleye/walleye:8.1.0/OPM1/1:user/release-keys",
        );
        assert_eq!(info.fs_type("vendor"), Some("squashfs"));
        assert_eq!(info.fs_type("system"), Some("ext4"));
        assert_eq!(info.misc_device(), Some("/dev/block/by-name/misc"));
        assert_eq!(info.get("dynamic_partition_list"), Some("system vendor"));
    }

    #[test]
    fn oem_fingerprint() {
        let mut info = test_info();
        info.misc_info.insert(
            "oem_fingerprint_properties".to_owned(),
            "ro.product.brand ro.product.name ro.product.device".to_owned(),
        );
        info.build_props
            .insert("ro.build.version.release".to_owned(), "8.1.0".to_owned());
        info.build_props
            .insert("ro.build.id".to_owned(), "OPM1".to_owned());
        info.build_props
            .insert("ro.build.type".to_owned(), "user".to_owned());
        info.build_props
            .insert("ro.build.tags".to_owned(), "release-keys".to_owned());
        info.oem_props = Some(parse_properties(
            "ro.product.brand=acme\n\
             ro.product.name=rocket\n\
             ro.product.device=sled\n",
        ));

        assert_eq!(
            info.fingerprint().unwrap(),
            "acme/rocket/sled:8.1.0/OPM1/eng.123:user/release-keys",
        );
        assert_eq!(info.device().unwrap(), "sled");
    }
}
