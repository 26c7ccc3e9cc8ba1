// SPDX-FileCopyrightText: 2022-2025 The otakit developers
// SPDX-License-Identifier: GPL-3.0-only

use std::{path::PathBuf, thread};

use thiserror::Error;
use tracing::info;

use crate::build_info::BuildInfo;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Cannot generate downgradable full OTAs")]
    WipeRequiresIncremental,
    #[error("--force-non-ab only allowed on devices that support non-A/B")]
    ForceNonAbNotAllowed,
    #[error("--force-non-ab only allowed on A/B devices")]
    ForceNonAbNotAb,
    #[error(
        "Expect to generate incremental OTA for retrofitting dynamic partitions, but \
         dynamic_partition_retrofit is not set in target build"
    )]
    RetrofitNotDeclared,
    #[error(
        "Target security patch level {target} is older than source SPL {source_spl}; applying such \
         an OTA will likely cause the device to fail to boot. Pass --spl-downgrade to override \
         this check"
    )]
    SplDowngradeDetected { source_spl: String, target: String },
    #[error(
        "--spl-downgrade specified but no actual SPL downgrade detected. Target SPL: {target}, \
         source SPL: {source_spl}"
    )]
    SplDowngradeNotDetected { source_spl: String, target: String },
}

type Result<T> = std::result::Result<T, Error>;

pub fn default_worker_threads() -> usize {
    let threads = thread::available_parallelism().map_or(1, |n| n.get()) / 2;

    threads.max(1)
}

/// Every knob of one package-build invocation, resolved once and then passed
/// around immutably. There is no global options bag.
#[derive(Clone, Debug)]
pub struct OtaConfig {
    pub wipe_user_data: bool,
    pub downgrade: bool,
    pub spl_downgrade: bool,
    pub two_step: bool,
    pub include_secondary: bool,
    pub skip_postinstall: bool,
    pub retrofit_dynamic_partitions: bool,
    pub force_non_ab: bool,
    pub no_signing: bool,
    pub disable_fec_computation: bool,
    pub disable_verity_computation: bool,
    pub disable_vabc: bool,
    pub vabc_downgrade: bool,
    pub partial: Option<Vec<String>>,
    pub worker_threads: usize,
    pub output_metadata_path: Option<PathBuf>,
    /// Development override for the updater binary packaged into non-A/B
    /// OTAs; the target build's own binary is used otherwise.
    pub updater_binary: Option<PathBuf>,
}

impl Default for OtaConfig {
    fn default() -> Self {
        Self {
            wipe_user_data: false,
            downgrade: false,
            spl_downgrade: false,
            two_step: false,
            include_secondary: false,
            skip_postinstall: false,
            retrofit_dynamic_partitions: false,
            force_non_ab: false,
            no_signing: false,
            disable_fec_computation: false,
            disable_verity_computation: false,
            disable_vabc: false,
            vabc_downgrade: false,
            partial: None,
            worker_threads: default_worker_threads(),
            output_metadata_path: None,
            updater_binary: None,
        }
    }
}

impl OtaConfig {
    /// Apply cross-flag implications and reject contradictory configurations.
    /// This runs before any external tool does and consumes nothing but the
    /// already-loaded build dictionaries.
    pub fn resolve(mut self, target: &BuildInfo, source: Option<&BuildInfo>) -> Result<Self> {
        if self.wipe_user_data {
            if !self.vabc_downgrade {
                info!(
                    "Detected downgrade/datawipe OTA. Disabling VABC: when wiping userdata, a \
                     VABC OTA makes the user wait in recovery for the merge to finish. Pass \
                     --vabc-downgrade to keep it enabled."
                );
                self.disable_vabc = true;
            }

            // Only incrementals may wipe. A wiping full OTA would let the
            // device move backwards from an arbitrary build.
            if source.is_none() {
                return Err(Error::WipeRequiresIncremental);
            }
        }

        // Assume retrofitting dynamic partitions when the base build does not
        // use them but the target build does.
        if let Some(source) = source {
            if !source.use_dynamic_partitions() && target.use_dynamic_partitions() {
                if !target.dynamic_partition_retrofit() {
                    return Err(Error::RetrofitNotDeclared);
                }

                info!("Implicitly generating retrofit incremental OTA.");
                self.retrofit_dynamic_partitions = true;
            }
        }

        // Retrofit OTAs update the physical super block devices directly, so
        // postinstall hooks cannot run.
        if self.retrofit_dynamic_partitions {
            self.skip_postinstall = true;
        }

        if self.force_non_ab {
            if !target.allow_non_ab() {
                return Err(Error::ForceNonAbNotAllowed);
            }
            if !target.is_ab() {
                return Err(Error::ForceNonAbNotAb);
            }
        }

        if let Some(source) = source {
            self.check_spl(target, source)?;
        }

        Ok(self)
    }

    /// Security patch levels are formatted yyyy-mm-dd, so string comparison
    /// orders them chronologically.
    fn check_spl(&self, target: &BuildInfo, source: &BuildInfo) -> Result<()> {
        let (Some(source_spl), Some(target_spl)) =
            (source.security_patch_level(), target.security_patch_level())
        else {
            return Ok(());
        };

        let is_spl_downgrade = target_spl < source_spl;

        if is_spl_downgrade && !self.spl_downgrade && !self.downgrade {
            return Err(Error::SplDowngradeDetected {
                source_spl: source_spl.to_owned(),
                target: target_spl.to_owned(),
            });
        } else if !is_spl_downgrade && self.spl_downgrade {
            return Err(Error::SplDowngradeNotDetected {
                source_spl: source_spl.to_owned(),
                target: target_spl.to_owned(),
            });
        }

        Ok(())
    }

    /// Whether this invocation produces an A/B package.
    pub fn generate_ab(&self, target: &BuildInfo) -> bool {
        !self.force_non_ab && target.is_ab()
    }
}
