/*
 * SPDX-FileCopyrightText: 2022-2025 The otakit developers
 * SPDX-License-Identifier: GPL-3.0-only
 */

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;

use crate::{cli::status, package::merge::merge_target_files, process::SystemRunner};

/// Merge two partial target-files packages into a complete package.
///
/// One input contains the system bits, the other contains the non-system
/// bits. The output is a complete target-files package usable for OTA
/// generation.
#[derive(Debug, Parser)]
pub struct MergeCli {
    /// Path to the zip archive containing the partial system target files.
    #[arg(long, value_name = "FILE", value_parser)]
    pub system_target_files: PathBuf,

    /// Path to the zip archive containing the partial other target files.
    #[arg(long, value_name = "FILE", value_parser)]
    pub other_target_files: PathBuf,

    /// Path to the output merged target files package.
    #[arg(long, value_name = "FILE", value_parser)]
    pub output_target_files: PathBuf,
}

pub fn merge_main(cli: &MergeCli) -> Result<()> {
    merge_target_files(
        &cli.system_target_files,
        &cli.other_target_files,
        &cli.output_target_files,
        &SystemRunner,
    )
    .context("Failed to merge target files packages")?;

    status!("Wrote merged target files: {:?}", cli.output_target_files);

    Ok(())
}
