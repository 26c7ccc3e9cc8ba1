// SPDX-FileCopyrightText: 2022-2025 The otakit developers
// SPDX-License-Identifier: GPL-3.0-only

use thiserror::Error;

use crate::{
    build_info::{self, BuildInfo},
    config::OtaConfig,
    format::ota::{DeviceState, OtaMetadata, OtaType},
};

#[derive(Debug, Error)]
pub enum Error {
    #[error(
        "--downgrade or --override-timestamp specified but no downgrade detected: \
         pre: {pre}, post: {post}"
    )]
    DowngradeNotDetected { pre: u64, post: u64 },
    #[error(
        "Downgrade detected based on timestamp check: pre: {pre}, post: {post}. Need to specify \
         --override-timestamp OR --downgrade to allow building the incremental"
    )]
    DowngradeNotAllowed { pre: u64, post: u64 },
    #[error("Build info error")]
    BuildInfo(#[from] build_info::Error),
}

type Result<T> = std::result::Result<T, Error>;

fn device_state(info: &BuildInfo, is_post_build: bool) -> Result<DeviceState> {
    let mut state = DeviceState {
        device: vec![info.device()?.to_owned()],
        build: vec![info.fingerprint()?],
        build_incremental: info.build_incremental()?.to_owned(),
        ..Default::default()
    };

    if is_post_build {
        state.sdk_level = info.sdk_level().unwrap_or_default().to_owned();
        state.security_patch_level = info.security_patch_level().unwrap_or_default().to_owned();
        // The actual post-timestamp, even for a downgrade case.
        state.timestamp = info.build_timestamp()?;
    }

    Ok(state)
}

/// Detect downgrades and set up the downgrade flag accordingly. Only
/// incremental OTAs reach here.
fn handle_downgrade(
    metadata: &mut OtaMetadata,
    config: &OtaConfig,
    target_info: &BuildInfo,
    source_info: &BuildInfo,
) -> Result<()> {
    let post_timestamp = target_info.build_timestamp()?;
    let pre_timestamp = source_info.build_timestamp()?;
    let is_downgrade = post_timestamp < pre_timestamp;

    if config.spl_downgrade {
        metadata.spl_downgrade = true;
    }

    if config.downgrade {
        if !is_downgrade {
            return Err(Error::DowngradeNotDetected {
                pre: pre_timestamp,
                post: post_timestamp,
            });
        }
        metadata.downgrade = true;
    } else if is_downgrade {
        return Err(Error::DowngradeNotAllowed {
            pre: pre_timestamp,
            post: post_timestamp,
        });
    }

    Ok(())
}

/// Build the metadata for a package: postcondition from the target build,
/// precondition from the source build (or just the device names for a full
/// OTA), and the downgrade/wipe flags.
pub fn get_package_metadata(
    config: &OtaConfig,
    target_info: &BuildInfo,
    source_info: Option<&BuildInfo>,
) -> Result<OtaMetadata> {
    let ota_type = if target_info.is_ab() && !config.force_non_ab {
        OtaType::Ab
    } else {
        OtaType::Block
    };

    let mut metadata = OtaMetadata::new(ota_type);
    metadata.postcondition = device_state(target_info, true)?;

    // required_cache stays 0 for A/B; the non-A/B builder updates it from the
    // computed block differences.

    if config.wipe_user_data {
        metadata.wipe = true;
    }

    if config.retrofit_dynamic_partitions {
        metadata.retrofit_dynamic_partitions = true;
    }

    match source_info {
        Some(source_info) => {
            metadata.precondition = device_state(source_info, false)?;
            handle_downgrade(&mut metadata, config, target_info, source_info)?;
        }
        None => {
            metadata.precondition.device = metadata.postcondition.device.clone();
        }
    }

    Ok(metadata)
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use assert_matches::assert_matches;

    use crate::build_info::parse_properties;

    use super::*;

    fn build(utc: u64, fingerprint: &str, misc: &str) -> BuildInfo {
        let props = format!(
            "ro.product.device=walleye\n\
             ro.build.fingerprint={fingerprint}\n\
             ro.build.date.utc={utc}\n\
             ro.build.version.incremental=eng.{utc}\n\
             ro.build.version.sdk=27\n\
             ro.build.version.security_patch=2021-02-05\n"
        );

        BuildInfo::new(
            parse_properties(misc),
            parse_properties(&props),
            None,
            BTreeMap::new(),
            None,
        )
    }

    #[test]
    fn full_ota_metadata() {
        let target = build(
            1500,
            "google/walleye/walleye:8.1.0/a/b:user/release-keys",
            "ab_update=true\nuse_dynamic_partitions=true\n",
        );

        let metadata = get_package_metadata(&OtaConfig::default(), &target, None).unwrap();

        assert_eq!(metadata.ota_type, OtaType::Ab);
        assert_eq!(metadata.required_cache, 0);
        assert_eq!(
            metadata.postcondition.build,
            vec!["google/walleye/walleye:8.1.0/a/b:user/release-keys".to_owned()],
        );
        assert_eq!(metadata.precondition.device, vec!["walleye".to_owned()]);
        assert!(metadata.precondition.build.is_empty());

        let raw = metadata.serialize();
        assert!(raw.contains("ota-type=AB\n"));
        assert!(!raw.contains("pre-build="));
        assert!(raw.contains("post-build=google/walleye/walleye:8.1.0/a/b:user/release-keys\n"));
        assert!(raw.contains("post-timestamp=1500\n"));
    }

    #[test]
    fn downgrade_detection() {
        let target = build(500, "fp/new", "ab_update=true\n");
        let source = build(1000, "fp/old", "ab_update=true\n");

        // Moving backwards in time requires the explicit flag.
        assert_matches!(
            get_package_metadata(&OtaConfig::default(), &target, Some(&source)),
            Err(Error::DowngradeNotAllowed {
                pre: 1000,
                post: 500,
            })
        );

        let config = OtaConfig {
            downgrade: true,
            wipe_user_data: true,
            ..Default::default()
        };
        let metadata = get_package_metadata(&config, &target, Some(&source)).unwrap();

        assert!(metadata.downgrade);
        assert!(metadata.wipe);

        let raw = metadata.serialize();
        assert!(raw.contains("ota-downgrade=yes\n"));
        assert!(raw.contains("ota-wipe=yes\n"));
    }

    #[test]
    fn spurious_downgrade_flag() {
        let target = build(2000, "fp/new", "ab_update=true\n");
        let source = build(1000, "fp/old", "ab_update=true\n");

        let config = OtaConfig {
            downgrade: true,
            ..Default::default()
        };

        assert_matches!(
            get_package_metadata(&config, &target, Some(&source)),
            Err(Error::DowngradeNotDetected {
                pre: 1000,
                post: 2000,
            })
        );
    }

    #[test]
    fn incremental_metadata_has_precondition() {
        let target = build(2000, "fp/new", "ab_update=true\n");
        let source = build(1000, "fp/old", "ab_update=true\n");

        let metadata =
            get_package_metadata(&OtaConfig::default(), &target, Some(&source)).unwrap();

        assert_eq!(metadata.precondition.build, vec!["fp/old".to_owned()]);
        assert_eq!(metadata.precondition.build_incremental, "eng.1000");

        let raw = metadata.serialize();
        assert!(raw.contains("pre-build=fp/old\n"));
        assert!(raw.contains("pre-build-incremental=eng.1000\n"));
    }
}
