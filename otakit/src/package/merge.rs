// SPDX-FileCopyrightText: 2022-2025 The otakit developers
// SPDX-License-Identifier: GPL-3.0-only

//! Merges two partial target-files packages (one containing the system bits,
//! the other containing everything else) into one complete package.

use std::{
    collections::BTreeSet,
    ffi::OsString,
    io::{self, Write},
    path::{Path, PathBuf},
};

use glob::Pattern;
use tempfile::NamedTempFile;
use thiserror::Error;
use tracing::warn;
use zip::{ZipWriter, write::FileOptions};

use crate::{
    format::zip as zip_util,
    process::{self, ProcessRunner, run_checked},
    target_files::{AB_PARTITIONS, MISC_INFO},
    util,
};

/// Items copied verbatim from the partial system target files package.
const SYSTEM_EXTRACT_AS_IS: &[&str] = &[
    "META/apkcerts.txt",
    "META/filesystem_config.txt",
    "META/system_manifest.xml",
    "META/system_matrix.xml",
    "META/root_filesystem_config.txt",
    "PRODUCT/*",
    "ROOT/*",
    "SYSTEM/*",
];

/// Items copied verbatim from the partial other target files package.
const OTHER_EXTRACT_AS_IS: &[&str] = &[
    "META/boot_filesystem_config.txt",
    "META/otakeys.txt",
    "META/releasetools.py",
    "META/update_engine_config.txt",
    "META/vendor_filesystem_config.txt",
    "META/vendor_manifest.xml",
    "META/vendor_matrix.xml",
    "BOOT/*",
    "DATA/*",
    "ODM/*",
    "OTA/android-info.txt",
    "PREBUILT_IMAGES/*",
    "RADIO/*",
    "VENDOR/*",
];

/// SELinux file-contexts sources, in precedence order. The first and third
/// must exist; the others are optional.
const FILE_CONTEXTS_SOURCES: &[(Source, &str, bool)] = &[
    (Source::System, "SYSTEM/etc/selinux/plat_file_contexts", true),
    (
        Source::System,
        "PRODUCT/etc/selinux/product_file_contexts",
        false,
    ),
    (Source::Other, "VENDOR/etc/selinux/vendor_file_contexts", true),
    (Source::Other, "ODM/etc/selinux/odm_file_contexts", false),
];

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Source {
    System,
    Other,
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("Missing file contexts source: {0}")]
    MissingFileContexts(String),
    #[error("Invalid copy pattern: {0:?}")]
    Pattern(String, #[source] glob::PatternError),
    #[error("Zip helper error")]
    ZipUtil(#[from] zip_util::Error),
    #[error("Zip error")]
    Zip(#[from] zip::result::ZipError),
    #[error("Process error")]
    Process(#[from] process::Error),
    #[error("Failed to persist output to: {0:?}")]
    Persist(PathBuf, #[source] io::Error),
    #[error("I/O error")]
    Io(#[from] io::Error),
}

type Result<T> = std::result::Result<T, Error>;

fn compile_patterns(patterns: &[&str]) -> Result<Vec<Pattern>> {
    patterns
        .iter()
        .map(|p| Pattern::new(p).map_err(|e| Error::Pattern((*p).to_owned(), e)))
        .collect()
}

/// Strict set union of two `ab_partitions.txt` files: sorted, deduplicated,
/// one partition per line.
pub fn merge_ab_partitions(system: &str, other: &str) -> String {
    let partitions = system
        .lines()
        .chain(other.lines())
        .map(|l| l.trim())
        .filter(|l| !l.is_empty())
        .collect::<BTreeSet<_>>();

    let mut out = partitions.into_iter().collect::<Vec<_>>().join("\n");
    out.push('\n');
    out
}

/// Combine the per-partition SELinux file-contexts sources and compile them
/// into the binary format. Sorting must happen before the compile: the
/// compiler preserves input order for equally-specific entries, so compiling
/// unsorted input produces wrong policy-matching precedence.
fn merge_file_contexts<R: io::Read + io::Seek>(
    system_zip: &mut zip::ZipArchive<R>,
    other_zip: &mut zip::ZipArchive<R>,
    runner: &dyn ProcessRunner,
) -> Result<Vec<u8>> {
    let mut combined = Vec::new();

    for &(source, path, required) in FILE_CONTEXTS_SOURCES {
        let zip = match source {
            Source::System => &mut *system_zip,
            Source::Other => &mut *other_zip,
        };

        match zip_util::read_entry_opt(zip, path)? {
            Some(data) => {
                combined.extend_from_slice(&data);
                if combined.last() != Some(&b'\n') {
                    combined.push(b'\n');
                }
            }
            None if required => return Err(Error::MissingFileContexts(path.to_owned())),
            None => warn!("File not found: {path}"),
        }
    }

    let mut lines = combined
        .split(|&c| c == b'\n')
        .filter(|l| !l.is_empty())
        .collect::<Vec<_>>();
    lines.sort_unstable();

    let mut sorted = lines.join(&b'\n');
    sorted.push(b'\n');

    let sorted_file = tempfile::Builder::new()
        .prefix("file_contexts-")
        .suffix(".txt")
        .tempfile()?;
    std::fs::write(sorted_file.path(), &sorted)?;

    let compiled_file = tempfile::Builder::new()
        .prefix("file_contexts-")
        .suffix(".bin")
        .tempfile()?;

    let argv: Vec<OsString> = vec![
        "sefcontext_compile".into(),
        "-o".into(),
        compiled_file.path().into(),
        sorted_file.path().into(),
    ];
    run_checked(runner, &argv)?;

    Ok(std::fs::read(compiled_file.path())?)
}

/// Merge two partial target files packages into a complete one. Whitelisted
/// paths are copied verbatim from their respective side; `ab_partitions.txt`
/// is unioned; `misc_info.txt` is taken from the other package; the SELinux
/// file contexts are combined and compiled.
pub fn merge_target_files(
    system_target_files: &Path,
    other_target_files: &Path,
    output_target_files: &Path,
    runner: &dyn ProcessRunner,
) -> Result<()> {
    let system_patterns = compile_patterns(SYSTEM_EXTRACT_AS_IS)?;
    let other_patterns = compile_patterns(OTHER_EXTRACT_AS_IS)?;

    let mut system_zip = zip_util::open_archive(system_target_files)?;
    let mut other_zip = zip_util::open_archive(other_target_files)?;

    let temp = NamedTempFile::new_in(util::parent_path(output_target_files))?;
    let (file, temp_path) = temp.into_parts();
    let mut writer = ZipWriter::new(file);

    zip_util::copy_filtered(&mut system_zip, &mut writer, |name| {
        if system_patterns.iter().any(|p| p.matches(name)) {
            Some(name.to_owned())
        } else {
            None
        }
    })?;

    zip_util::copy_filtered(&mut other_zip, &mut writer, |name| {
        if other_patterns.iter().any(|p| p.matches(name)) {
            Some(name.to_owned())
        } else {
            None
        }
    })?;

    // META/ab_partitions.txt must be the union of both sides, so that the
    // merged build updates every partition either side declares.
    let system_ab = zip_util::read_entry_string(&mut system_zip, AB_PARTITIONS)?;
    let other_ab = zip_util::read_entry_string(&mut other_zip, AB_PARTITIONS)?;
    writer.start_file(AB_PARTITIONS, FileOptions::default())?;
    writer.write_all(merge_ab_partitions(&system_ab, &other_ab).as_bytes())?;

    // misc_info.txt is simply taken from the other side; the existing use
    // cases have no significant differences in this file.
    let misc_info = zip_util::read_entry(&mut other_zip, MISC_INFO)?;
    writer.start_file(MISC_INFO, FileOptions::default())?;
    writer.write_all(&misc_info)?;

    let file_contexts = merge_file_contexts(&mut system_zip, &mut other_zip, runner)?;
    writer.start_file("META/file_contexts.bin", FileOptions::default())?;
    writer.write_all(&file_contexts)?;

    writer.finish()?;

    temp_path
        .persist(output_target_files)
        .map_err(|e| Error::Persist(output_target_files.to_owned(), e.error))?;

    Ok(())
}
