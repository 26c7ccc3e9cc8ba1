// SPDX-FileCopyrightText: 2022-2025 The otakit developers
// SPDX-License-Identifier: GPL-3.0-only

use std::{
    collections::BTreeMap,
    io::{self, Read, Seek, SeekFrom, Write},
    iter,
    path::Path,
    sync::atomic::AtomicBool,
};

use memchr::memmem;
use ring::digest::Context;
use rsa::RsaPrivateKey;
use tempfile::NamedTempFile;
use thiserror::Error;
use x509_cert::{Certificate, der::Encode};
use zip::{ZipArchive, ZipWriter, result::ZipError};

use crate::{
    crypto,
    format::{
        payload::PayloadHeader,
        zip::{self as zip_util, stored_options},
    },
    stream::{self, HashingWriter, ReadSeek},
    util,
};

pub const PATH_METADATA: &str = "META-INF/com/android/metadata";
pub const PATH_OTACERT: &str = "META-INF/com/android/otacert";
pub const PATH_PAYLOAD: &str = "payload.bin";
pub const PATH_PROPERTIES: &str = "payload_properties.txt";
pub const PATH_SECONDARY_PAYLOAD: &str = "secondary/payload.bin";
pub const PATH_SECONDARY_PROPERTIES: &str = "secondary/payload_properties.txt";

const NAME_PAYLOAD_METADATA: &str = "payload_metadata.bin";

pub const PF_NAME: &str = "ota-property-files";
pub const PF_STREAMING_NAME: &str = "ota-streaming-property-files";

/// The metadata entry is described by its own property-files string, so space
/// for `offset:length` has to be reserved before the real values are known.
/// 10 digits of offset (~9 GiB) and 4 digits of length.
const METADATA_RESERVED_SPACE: usize = 15;

pub const ZIP_EOCD_MAGIC: &[u8; 4] = b"PK\x05\x06";

const COMMENT_MESSAGE: &[u8] = b"signed by otakit\0";

const LEGACY_SEP: &str = "|";

#[derive(Debug, Error)]
pub enum Error {
    #[error("Missing entry in OTA zip: {0}")]
    MissingZipEntry(String),
    #[error("Property files {0:?} exceed {1} byte reserved space")]
    InsufficientReservedSpace(String, usize),
    #[error("Expected entry offsets {expected:?}, but have {actual:?}")]
    MismatchedPropertyFiles { expected: String, actual: String },
    #[error("Invalid metadata line: {0:?}")]
    InvalidMetadataLine(String),
    #[error("Payload error")]
    Payload(#[from] crate::format::payload::Error),
    #[error("CMS signing error")]
    CmsSign(#[from] crypto::Error),
    #[error("x509 DER error")]
    Der(#[from] x509_cert::der::Error),
    #[error("Zip helper error")]
    ZipUtil(#[from] zip_util::Error),
    #[error("Zip error")]
    Zip(#[from] ZipError),
    #[error("I/O error")]
    Io(#[from] io::Error),
}

type Result<T> = std::result::Result<T, Error>;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum OtaType {
    Ab,
    Block,
}

impl OtaType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ab => "AB",
            Self::Block => "BLOCK",
        }
    }
}

/// One side of an update: the state a device must be in for the package to
/// apply (precondition) or the state it ends up in (postcondition).
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct DeviceState {
    pub device: Vec<String>,
    pub build: Vec<String>,
    pub build_incremental: String,
    pub sdk_level: String,
    pub security_patch_level: String,
    pub timestamp: u64,
}

/// The package metadata written to `META-INF/com/android/metadata` as sorted
/// `key=value` lines. This is the single source of truth for what gets
/// written to the archive; the finalization protocol mutates
/// [`Self::property_files`] across the two signing passes and then freezes it.
#[derive(Clone, Debug, PartialEq)]
pub struct OtaMetadata {
    pub ota_type: OtaType,
    pub wipe: bool,
    pub downgrade: bool,
    pub spl_downgrade: bool,
    pub retrofit_dynamic_partitions: bool,
    pub required_cache: u64,
    pub precondition: DeviceState,
    pub postcondition: DeviceState,
    pub property_files: BTreeMap<String, String>,
}

impl OtaMetadata {
    pub fn new(ota_type: OtaType) -> Self {
        Self {
            ota_type,
            wipe: false,
            downgrade: false,
            spl_downgrade: false,
            retrofit_dynamic_partitions: false,
            required_cache: 0,
            precondition: DeviceState::default(),
            postcondition: DeviceState::default(),
            property_files: BTreeMap::new(),
        }
    }

    /// Serialize to the plain-text metadata format: `key=value` lines sorted
    /// by key.
    pub fn serialize(&self) -> String {
        use std::fmt::Write;

        let mut pairs = BTreeMap::<String, String>::new();

        pairs.insert("ota-type".to_owned(), self.ota_type.as_str().to_owned());
        if self.wipe {
            pairs.insert("ota-wipe".to_owned(), "yes".to_owned());
        }
        if self.retrofit_dynamic_partitions {
            pairs.insert(
                "ota-retrofit-dynamic-partitions".to_owned(),
                "yes".to_owned(),
            );
        }
        if self.downgrade {
            pairs.insert("ota-downgrade".to_owned(), "yes".to_owned());
        }

        pairs.insert(
            "ota-required-cache".to_owned(),
            self.required_cache.to_string(),
        );

        let post = &self.postcondition;
        pairs.insert("post-build".to_owned(), post.build.join(LEGACY_SEP));
        pairs.insert(
            "post-build-incremental".to_owned(),
            post.build_incremental.clone(),
        );
        pairs.insert("post-sdk-level".to_owned(), post.sdk_level.clone());
        pairs.insert(
            "post-security-patch-level".to_owned(),
            post.security_patch_level.clone(),
        );
        pairs.insert("post-timestamp".to_owned(), post.timestamp.to_string());

        let pre = &self.precondition;
        pairs.insert("pre-device".to_owned(), pre.device.join(LEGACY_SEP));
        if !pre.build.is_empty() {
            pairs.insert("pre-build".to_owned(), pre.build.join(LEGACY_SEP));
            pairs.insert(
                "pre-build-incremental".to_owned(),
                pre.build_incremental.clone(),
            );
        }

        if self.spl_downgrade {
            pairs.insert("spl-downgrade".to_owned(), "yes".to_owned());
        }

        pairs.extend(self.property_files.clone());

        pairs.into_iter().fold(String::new(), |mut output, (k, v)| {
            let _ = writeln!(output, "{k}={v}");
            output
        })
    }

    /// Parse the plain-text metadata format. Unknown keys are ignored; some
    /// OEMs insert values that aren't defined in AOSP.
    pub fn parse(data: &str) -> Result<Self> {
        let mut metadata = Self::new(OtaType::Block);

        for line in data.split('\n') {
            if line.is_empty() {
                continue;
            }

            let (key, value) = line
                .split_once('=')
                .ok_or_else(|| Error::InvalidMetadataLine(line.to_owned()))?;
            let parse_list = || {
                value
                    .split(LEGACY_SEP)
                    .map(|s| s.to_owned())
                    .collect::<Vec<_>>()
            };

            match key {
                "ota-type" => {
                    metadata.ota_type = match value {
                        "AB" => OtaType::Ab,
                        "BLOCK" => OtaType::Block,
                        _ => return Err(Error::InvalidMetadataLine(line.to_owned())),
                    };
                }
                "ota-wipe" => metadata.wipe = value == "yes",
                "ota-downgrade" => metadata.downgrade = value == "yes",
                "spl-downgrade" => metadata.spl_downgrade = value == "yes",
                "ota-retrofit-dynamic-partitions" => {
                    metadata.retrofit_dynamic_partitions = value == "yes";
                }
                "ota-required-cache" => {
                    metadata.required_cache = value
                        .parse()
                        .map_err(|_| Error::InvalidMetadataLine(line.to_owned()))?;
                }
                "post-build" => metadata.postcondition.build = parse_list(),
                "post-build-incremental" => {
                    value.clone_into(&mut metadata.postcondition.build_incremental);
                }
                "post-sdk-level" => value.clone_into(&mut metadata.postcondition.sdk_level),
                "post-security-patch-level" => {
                    value.clone_into(&mut metadata.postcondition.security_patch_level);
                }
                "post-timestamp" => {
                    metadata.postcondition.timestamp = value
                        .parse()
                        .map_err(|_| Error::InvalidMetadataLine(line.to_owned()))?;
                }
                "pre-device" => metadata.precondition.device = parse_list(),
                "pre-build" => metadata.precondition.build = parse_list(),
                "pre-build-incremental" => {
                    value.clone_into(&mut metadata.precondition.build_incremental);
                }
                k if k.ends_with("-property-files") => {
                    metadata
                        .property_files
                        .insert(key.to_owned(), value.to_owned());
                }
                _ => {}
            }
        }

        Ok(metadata)
    }
}

#[derive(Clone, Debug)]
pub struct ZipEntry {
    pub name: String,
    pub offset: u64,
    pub size: u64,
}

/// An archive opened behind a type-erased reader so that the property-files
/// trait stays object safe.
pub type OtaArchive = ZipArchive<Box<dyn ReadSeek>>;

/// List every entry with the offset of its data (after the local file header,
/// filename, and extra field), which is what a byte-range download needs.
pub fn zip_entries(zip: &mut OtaArchive) -> Result<Vec<ZipEntry>> {
    let mut entries = vec![];

    for i in 0..zip.len() {
        let entry = zip.by_index_raw(i)?;
        entries.push(ZipEntry {
            name: entry.name().to_owned(),
            offset: entry.data_start(),
            size: entry.size(),
        });
    }

    Ok(entries)
}

/// Computes the property-files string for an OTA package: a comma-separated
/// list of `name:offset:length` tokens for entries that a client can fetch by
/// byte range without downloading the whole package.
///
/// Computing the final string requires two passes because signing the package
/// may reorder or pad the zip entries, invalidating earlier offsets. The
/// caller first writes a placeholder from [`Self::compute`], signs, then
/// replaces it with the result of [`Self::finalize`], which is padded to the
/// originally reserved length so the archive layout doesn't shift again.
pub trait PropertyFiles {
    fn name(&self) -> &'static str;

    /// Entries that must exist. A missing one is a fatal error.
    fn required(&self) -> &'static [&'static str];

    /// Entries included only when present in the archive.
    fn optional(&self) -> &'static [&'static str] {
        &[]
    }

    /// Tokens that describe byte ranges with no zip entry of their own.
    fn precomputed(&self, _zip: &mut OtaArchive, _entries: &[ZipEntry]) -> Result<Vec<String>> {
        Ok(vec![])
    }

    /// First pass: real tokens for everything but the metadata entry, whose
    /// offset/length is reserved as spaces.
    fn compute(&self, zip: &mut OtaArchive) -> Result<String> {
        self.property_files_string(zip, true)
    }

    /// Second pass: recompute with the real metadata entry offset and pad to
    /// exactly `reserved_length`.
    fn finalize(&self, zip: &mut OtaArchive, reserved_length: usize) -> Result<String> {
        let mut result = self.property_files_string(zip, false)?;

        if result.len() > reserved_length {
            return Err(Error::InsufficientReservedSpace(result, reserved_length));
        }

        let remain = reserved_length - result.len();
        result.extend(iter::repeat(' ').take(remain));

        Ok(result)
    }

    /// Recompute against the final archive and require byte-for-byte equality
    /// with the previously finalized string (minus trailing padding).
    fn verify(&self, zip: &mut OtaArchive, expected: &str) -> Result<()> {
        let actual = self.property_files_string(zip, false)?;

        if actual != expected {
            return Err(Error::MismatchedPropertyFiles {
                expected: expected.to_owned(),
                actual,
            });
        }

        Ok(())
    }

    fn property_files_string(&self, zip: &mut OtaArchive, reserve_space: bool) -> Result<String> {
        let entries = zip_entries(zip)?;

        let compute_entry = |path: &str| -> Result<String> {
            let entry = entries
                .iter()
                .find(|e| e.name == path)
                .ok_or_else(|| Error::MissingZipEntry(path.to_owned()))?;
            let name = path.rsplit_once('/').map_or(path, |p| p.1);

            Ok(format!("{name}:{}:{}", entry.offset, entry.size))
        };

        let mut tokens = self.precomputed(zip, &entries)?;

        for path in self.required() {
            tokens.push(compute_entry(path)?);
        }

        for path in self.optional() {
            if entries.iter().any(|e| e.name == *path) {
                tokens.push(compute_entry(path)?);
            }
        }

        if reserve_space {
            tokens.push(format!(
                "metadata:{}",
                " ".repeat(METADATA_RESERVED_SPACE)
            ));
        } else {
            tokens.push(compute_entry(PATH_METADATA)?);
        }

        Ok(tokens.join(","))
    }
}

/// Property files for streaming A/B OTAs.
pub struct StreamingPropertyFiles;

impl PropertyFiles for StreamingPropertyFiles {
    fn name(&self) -> &'static str {
        PF_STREAMING_NAME
    }

    fn required(&self) -> &'static [&'static str] {
        // payload.bin and payload_properties.txt must exist.
        &[PATH_PAYLOAD, PATH_PROPERTIES]
    }

    fn optional(&self) -> &'static [&'static str] {
        // care_map is available only if dm-verity is enabled. compatibility.zip
        // is available only if the target supports Treble.
        &["care_map.pb", "care_map.txt", "compatibility.zip"]
    }
}

/// Property files for A/B OTAs that additionally expose a virtual
/// `payload_metadata.bin` token covering the payload's header, manifest, and
/// metadata signature. That region has no zip entry of its own, but lets an
/// updater check whether the payload applies before downloading it.
pub struct AbOtaPropertyFiles;

impl PropertyFiles for AbOtaPropertyFiles {
    fn name(&self) -> &'static str {
        PF_NAME
    }

    fn required(&self) -> &'static [&'static str] {
        &[PATH_PAYLOAD, PATH_PROPERTIES]
    }

    fn optional(&self) -> &'static [&'static str] {
        &["care_map.pb", "care_map.txt", "compatibility.zip"]
    }

    fn precomputed(&self, zip: &mut OtaArchive, entries: &[ZipEntry]) -> Result<Vec<String>> {
        let offset = entries
            .iter()
            .find(|e| e.name == PATH_PAYLOAD)
            .map(|e| e.offset)
            .ok_or_else(|| Error::MissingZipEntry(PATH_PAYLOAD.to_owned()))?;

        let mut entry = zip.by_name(PATH_PAYLOAD)?;
        let payload_size = entry.size();
        let header = PayloadHeader::from_reader(&mut entry)?;
        header.check_bounds(payload_size)?;

        Ok(vec![format!(
            "{NAME_PAYLOAD_METADATA}:{offset}:{}",
            header.metadata_total(),
        )])
    }
}

/// Property files for non-A/B OTAs. There is nothing streamable, but exposing
/// the metadata entry lets clients read the post-build fingerprint without
/// downloading the package.
pub struct NonAbOtaPropertyFiles;

impl PropertyFiles for NonAbOtaPropertyFiles {
    fn name(&self) -> &'static str {
        PF_NAME
    }

    fn required(&self) -> &'static [&'static str] {
        &[]
    }
}

/// Append the metadata entry to a zip that is being written.
pub fn write_metadata(
    writer: &mut ZipWriter<impl Write + Seek>,
    metadata: &OtaMetadata,
) -> Result<()> {
    let raw = metadata.serialize();

    writer.start_file(PATH_METADATA, stored_options(raw.len() as u64))?;
    writer.write_all(raw.as_bytes())?;

    Ok(())
}

/// Replace (or add) the metadata entry in the archive at `path`. Existing
/// entries keep their order and compressed representation, so every other
/// entry's offset is preserved; the new metadata entry goes at the end.
pub fn replace_metadata(path: &Path, metadata: &OtaMetadata) -> Result<()> {
    let mut zip = zip_util::open_archive(path)?;

    let temp_file = NamedTempFile::new_in(util::parent_path(path))?;
    let (file, temp_path) = temp_file.into_parts();
    let mut writer = ZipWriter::new(file);

    zip_util::copy_filtered(&mut zip, &mut writer, |name| {
        if name == PATH_METADATA {
            None
        } else {
            Some(name.to_owned())
        }
    })?;

    write_metadata(&mut writer, metadata)?;
    writer.finish()?;

    temp_path
        .persist(path)
        .map_err(|e| zip_util::Error::Persist(path.to_owned(), e))?;

    Ok(())
}

/// Ensure that we're using a non-zip64 EOCD and there's no archive comment.
fn validate_eocd(eocd: &[u8]) -> io::Result<()> {
    if &eocd[..4] != ZIP_EOCD_MAGIC {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "EOCD magic not found",
        ));
    } else if &eocd[20..22] != b"\0\0" {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "Archive comment is not 0 bytes",
        ));
    }

    Ok(())
}

/// Compute the digital signature for the specified digest, formatted as a zip
/// file archive comment. The returned buffer includes both the 2-byte comment
/// size field and the comment itself. It should be written to the end of the
/// zip file after truncating the original 2-byte comment size field.
fn compute_signature_comment(
    key: &RsaPrivateKey,
    cert: &Certificate,
    digest: ring::digest::Digest,
) -> Result<Vec<u8>> {
    let cms_signature = crypto::cms_sign_external(key, cert, digest.as_ref())?;
    let cms_signature_der = cms_signature.to_der()?;

    // Includes placeholder for the EOCD comment size field.
    let mut buf = vec![0; 2];

    // NULL-terminated readable message and actual signature.
    buf.extend(COMMENT_MESSAGE);
    buf.extend(&cms_signature_der);

    // 6-byte OTA footer.
    let comment_size = buf.len() - 2 + 6;

    // Absolute value of the offset of the signature from the end of the
    // archive comment.
    buf.extend((cms_signature_der.len() as u16 + 6).to_le_bytes());

    // Magic value.
    buf.extend(b"\xff\xff");

    // Archive comment size (for use by the OTA signature verifier).
    buf.extend((comment_size as u16).to_le_bytes());

    if let Some(o) = memmem::find(&buf[2..], ZIP_EOCD_MAGIC) {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("Archive comment contains EOCD magic at offset {o}"),
        )
        .into());
    }

    // Archive comment size (for the EOCD comment size field).
    buf[..2].copy_from_slice(&(comment_size as u16).to_le_bytes());

    Ok(buf)
}

/// A writer that produces a signapk-style signed zip file with a whole-file
/// signature stored in the zip archive comment. The data will be left in an
/// unusable state if [`Self::finish()`] is not called.
///
/// This works on complete zip files written without an archive comment. The
/// data is hashed during [`Self::finish()`].
pub struct SigningWriter<W> {
    inner: W,
}

impl<W: Read + Write + Seek> SigningWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }

    pub fn finish(
        mut self,
        key: &RsaPrivateKey,
        cert: &Certificate,
        cancel_signal: &AtomicBool,
    ) -> Result<W> {
        let file_size = self.seek(SeekFrom::End(0))?;

        // Android only supports non-zip64 EOCD.
        if file_size < 22 {
            return Err(
                io::Error::new(io::ErrorKind::InvalidData, "Too small to contain EOCD").into(),
            );
        }

        self.seek(SeekFrom::Current(-22))?;
        let mut eocd = [0u8; 22];
        self.read_exact(&mut eocd)?;

        validate_eocd(&eocd)?;

        // Compute the digest of everything up until the comment size field.
        let mut hashing_writer =
            HashingWriter::new(io::sink(), Context::new(&ring::digest::SHA256));

        self.rewind()?;
        stream::copy_n(&mut self, &mut hashing_writer, file_size - 2, cancel_signal)?;

        let digest = hashing_writer.finish().1.finish();

        let size_and_comment = compute_signature_comment(key, cert, digest)?;
        self.inner.write_all(&size_and_comment)?;

        Ok(self.inner)
    }
}

impl<W: Read> Read for SigningWriter<W> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.inner.read(buf)
    }
}

impl<W: Write> Write for SigningWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.inner.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

impl<W: Seek> Seek for SigningWriter<W> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.inner.seek(pos)
    }
}
