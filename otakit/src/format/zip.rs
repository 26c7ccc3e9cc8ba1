// SPDX-FileCopyrightText: 2022-2025 The otakit developers
// SPDX-License-Identifier: GPL-3.0-only

use std::{
    fs::File,
    io::{self, BufReader, Read, Seek, Write},
    path::{Path, PathBuf},
};

use tempfile::NamedTempFile;
use thiserror::Error;
use zip::{CompressionMethod, ZipArchive, ZipWriter, result::ZipError, write::FileOptions};

use crate::{stream::ReadSeek, util};

#[derive(Debug, Error)]
pub enum Error {
    #[error("Missing zip entry: {0}")]
    MissingEntry(String),
    #[error("Failed to persist temporary file to: {0:?}")]
    Persist(PathBuf, #[source] tempfile::PathPersistError),
    #[error("Zip error")]
    Zip(#[from] ZipError),
    #[error("I/O error")]
    Io(#[from] io::Error),
}

type Result<T> = std::result::Result<T, Error>;

/// Options for entries that must remain byte-addressable (anything referenced
/// by a property-files string).
pub fn stored_options(size: u64) -> FileOptions {
    FileOptions::default()
        .compression_method(CompressionMethod::Stored)
        .large_file(size >= u64::from(u32::MAX))
}

pub fn open_archive(path: &Path) -> Result<ZipArchive<BufReader<File>>> {
    let file = File::open(path)?;

    Ok(ZipArchive::new(BufReader::new(file))?)
}

/// Open an archive behind a type-erased reader. The property-files protocol
/// operates on these so that trait objects can work with both files and
/// in-memory archives.
pub fn open_boxed_archive(path: &Path) -> Result<ZipArchive<Box<dyn ReadSeek>>> {
    let file = File::open(path)?;
    let reader: Box<dyn ReadSeek> = Box::new(BufReader::new(file));

    Ok(ZipArchive::new(reader)?)
}

pub fn has_entry(zip: &mut ZipArchive<impl Read + Seek>, name: &str) -> bool {
    zip.by_name(name).is_ok()
}

/// Find the index of an entry so it can be reopened with `by_index_raw` for a
/// raw copy.
pub fn index_of(zip: &mut ZipArchive<impl Read + Seek>, name: &str) -> Result<Option<usize>> {
    for i in 0..zip.len() {
        if zip.by_index_raw(i)?.name() == name {
            return Ok(Some(i));
        }
    }

    Ok(None)
}

pub fn read_entry(zip: &mut ZipArchive<impl Read + Seek>, name: &str) -> Result<Vec<u8>> {
    match read_entry_opt(zip, name)? {
        Some(data) => Ok(data),
        None => Err(Error::MissingEntry(name.to_owned())),
    }
}

pub fn read_entry_opt(
    zip: &mut ZipArchive<impl Read + Seek>,
    name: &str,
) -> Result<Option<Vec<u8>>> {
    let mut entry = match zip.by_name(name) {
        Ok(e) => e,
        Err(ZipError::FileNotFound) => return Ok(None),
        Err(e) => return Err(e.into()),
    };

    let mut buf = Vec::with_capacity(entry.size() as usize);
    entry.read_to_end(&mut buf)?;

    Ok(Some(buf))
}

pub fn read_entry_string(zip: &mut ZipArchive<impl Read + Seek>, name: &str) -> Result<String> {
    let data = read_entry(zip, name)?;

    String::from_utf8(data).map_err(|_| {
        Error::Io(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("{name} is not valid UTF-8"),
        ))
    })
}

/// Copy entries from `zip` into `writer`, preserving the stored order and the
/// original compressed data. `map` decides per entry name whether to drop it
/// (`None`) or what name to store it under (`Some`).
pub fn copy_filtered(
    zip: &mut ZipArchive<impl Read + Seek>,
    writer: &mut ZipWriter<impl Write + Seek>,
    mut map: impl FnMut(&str) -> Option<String>,
) -> Result<()> {
    for i in 0..zip.len() {
        let entry = zip.by_index_raw(i)?;

        match map(entry.name()) {
            Some(name) if name == entry.name() => writer.raw_copy_file(entry)?,
            Some(name) => writer.raw_copy_file_rename(entry, name)?,
            None => {}
        }
    }

    Ok(())
}

/// Rewrite the archive at `path` without the named entries. Absent entries are
/// ignored. The zip format has no in-place delete, so this copies every other
/// entry into a temporary archive and renames it over the original.
pub fn delete_entries(path: &Path, names: &[&str]) -> Result<()> {
    let mut zip = open_archive(path)?;

    let temp_file = NamedTempFile::new_in(util::parent_path(path))?;
    let (file, temp_path) = temp_file.into_parts();
    let mut writer = ZipWriter::new(file);

    copy_filtered(&mut zip, &mut writer, |name| {
        if names.contains(&name) {
            None
        } else {
            Some(name.to_owned())
        }
    })?;

    writer.finish()?;

    temp_path
        .persist(path)
        .map_err(|e| Error::Persist(path.to_owned(), e))?;

    Ok(())
}
