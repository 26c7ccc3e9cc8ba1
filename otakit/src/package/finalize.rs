// SPDX-FileCopyrightText: 2022-2025 The otakit developers
// SPDX-License-Identifier: GPL-3.0-only

//! The two-pass metadata finalization protocol.
//!
//! The property-files strings must describe final byte offsets inside the
//! package, but signing the package may reorder or pad entries and change
//! those offsets. The protocol writes placeholder values, does a preliminary
//! signing, recomputes the real offsets against the signed layout, and signs
//! once more. Every byte preceding the metadata entry must be frozen before
//! the metadata entry's exact content is known, which is why the package
//! cannot be written in a single linear pass.

use std::{
    fs,
    io::{self},
    path::{Path, PathBuf},
    sync::atomic::AtomicBool,
};

use tempfile::{NamedTempFile, TempPath};
use thiserror::Error;
use tracing::{debug, info};

use crate::{
    config::OtaConfig,
    format::{
        ota::{self, OtaMetadata, PropertyFiles},
        zip as zip_util,
    },
    package::sign::{self, OtaSigner},
    util,
};

#[derive(Debug, Error)]
pub enum Error {
    #[error("OTA format error")]
    Ota(#[from] ota::Error),
    #[error("Signing error")]
    Sign(#[from] sign::Error),
    #[error("Zip helper error")]
    ZipUtil(#[from] zip_util::Error),
    #[error("Failed to persist output to: {0:?}")]
    Persist(PathBuf, #[source] io::Error),
    #[error("I/O error")]
    Io(#[from] io::Error),
}

type Result<T> = std::result::Result<T, Error>;

/// Compute all property-files strings against the archive as it currently
/// is, write the metadata entry (with placeholders for the self-referential
/// tokens), and do a preliminary signing. Returns the path to use for the
/// finalize pass.
fn compute_all_property_files(
    metadata: &mut OtaMetadata,
    input_file: &Path,
    property_files: &[&dyn PropertyFiles],
    signer: Option<&dyn OtaSigner>,
    temps: &mut Vec<TempPath>,
    cancel_signal: &AtomicBool,
) -> Result<PathBuf> {
    {
        let mut zip = zip_util::open_boxed_archive(input_file)?;

        for pf in property_files {
            let value = pf.compute(&mut zip)?;
            metadata.property_files.insert(pf.name().to_owned(), value);
        }
    }

    ota::replace_metadata(input_file, metadata)?;

    let Some(signer) = signer else {
        return Ok(input_file.to_owned());
    };

    let temp = tempfile::Builder::new()
        .prefix("prelim-signing-")
        .suffix(".zip")
        .tempfile()?
        .into_temp_path();

    signer.sign(input_file, &temp, cancel_signal)?;

    let path = temp.to_path_buf();
    temps.push(temp);

    Ok(path)
}

/// Recompute each property-files string against the preliminarily signed
/// archive and pad it to the reserved length.
fn finalize_all_property_files(
    metadata: &mut OtaMetadata,
    prelim_signing: &Path,
    property_files: &[&dyn PropertyFiles],
) -> Result<()> {
    let mut zip = zip_util::open_boxed_archive(prelim_signing)?;

    for pf in property_files {
        let reserved = metadata
            .property_files
            .get(pf.name())
            .map(|v| v.len())
            .unwrap_or_default();
        let value = pf.finalize(&mut zip, reserved)?;
        metadata.property_files.insert(pf.name().to_owned(), value);
    }

    Ok(())
}

/// Finalize the metadata and sign the package.
///
/// Signing may reorder the zip entries as well as pad the entry headers, so a
/// preliminary signing (with an incomplete metadata entry) is performed
/// first, then the entry offsets are computed against that layout, the final
/// metadata is written back, and the package is signed one last time. If even
/// the preliminary layout shifted too much for the reserved space, the
/// preliminary work is redone once, based on the already-ordered entries;
/// a second failure is fatal.
///
/// The output path receives a finished package or nothing at all: everything
/// is built at temporary paths and only renamed into place after the final
/// verification pass succeeds.
pub fn finalize_metadata(
    metadata: &mut OtaMetadata,
    input_file: &Path,
    output_file: &Path,
    property_files: &[&dyn PropertyFiles],
    signer: Option<&dyn OtaSigner>,
    config: &OtaConfig,
    cancel_signal: &AtomicBool,
) -> Result<()> {
    let mut temps = vec![];

    let prelim_signing = compute_all_property_files(
        metadata,
        input_file,
        property_files,
        signer,
        &mut temps,
        cancel_signal,
    )?;

    let prelim_signing = match finalize_all_property_files(metadata, &prelim_signing, property_files)
    {
        Ok(()) => prelim_signing,
        Err(Error::Ota(ota::Error::InsufficientReservedSpace(..))) => {
            // Even with the preliminary signing, the entry order may change
            // dramatically, leaving the space reserved during the first pass
            // insufficient. Redo the preliminary work based on the
            // already-ordered entries; entry order is stable from here on, so
            // this attempt must succeed.
            info!("Entry layout shifted during signing; redoing preliminary pass");

            let prelim_signing = compute_all_property_files(
                metadata,
                &prelim_signing,
                property_files,
                signer,
                &mut temps,
                cancel_signal,
            )?;
            finalize_all_property_files(metadata, &prelim_signing, property_files)?;

            prelim_signing
        }
        Err(e) => return Err(e),
    };

    // Replace the metadata entry with the final values.
    ota::replace_metadata(&prelim_signing, metadata)?;

    // Re-sign the package after updating the metadata entry, directly into a
    // temporary file next to the requested output.
    let temp_output = NamedTempFile::new_in(util::parent_path(output_file))?;

    match signer {
        Some(signer) => signer.sign(&prelim_signing, temp_output.path(), cancel_signal)?,
        None => {
            fs::copy(&prelim_signing, temp_output.path())?;
        }
    }

    // Reopen the final package and double check every property-files string.
    // A mismatch here is an integrity bug, not a recoverable condition.
    {
        let mut zip = zip_util::open_boxed_archive(temp_output.path())?;

        for pf in property_files {
            let expected = metadata
                .property_files
                .get(pf.name())
                .map(|v| v.trim_end())
                .unwrap_or_default();
            pf.verify(&mut zip, expected)?;
        }
    }

    debug!("Moving finished package to {output_file:?}");

    temp_output
        .persist(output_file)
        .map_err(|e| Error::Persist(output_file.to_owned(), e.error))?;

    // If requested, dump the metadata to a separate file so clients can read
    // the post-build fingerprint without extracting the package.
    if let Some(path) = &config.output_metadata_path {
        fs::write(path, metadata.serialize())?;
    }

    Ok(())
}
