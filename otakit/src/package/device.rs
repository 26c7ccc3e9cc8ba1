// SPDX-FileCopyrightText: 2022-2025 The otakit developers
// SPDX-License-Identifier: GPL-3.0-only

use crate::{edify::EdifyScript, package::nonab::BlockDifference};

/// Optional device-specific hooks for non-A/B package generation. Each hook
/// returns `None` to indicate "no override", in which case the generic logic
/// applies. Overrides returned here always win over generically computed
/// block differences (with a warning on conflict).
///
/// This is an embedding point for library consumers shipping device-specific
/// release logic; the CLI uses [`NullDeviceExtension`].
pub trait DeviceExtension {
    /// Replacement block differences for a full OTA.
    fn full_ota_block_differences(&self) -> Option<Vec<BlockDifference>> {
        None
    }

    /// Replacement block differences for an incremental OTA.
    fn incremental_ota_block_differences(&self) -> Option<Vec<BlockDifference>> {
        None
    }

    /// Additional device assertions emitted at the top of the install script.
    fn device_specific_assertions(&self, _script: &mut EdifyScript) {}
}

/// The no-op extension: every hook reports "no override".
pub struct NullDeviceExtension;

impl DeviceExtension for NullDeviceExtension {}
