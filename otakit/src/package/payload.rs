// SPDX-FileCopyrightText: 2022-2025 The otakit developers
// SPDX-License-Identifier: GPL-3.0-only

//! A/B payload construction: drives the external delta generator and wraps
//! payload signing behind one interface regardless of where the key lives.

use std::{
    ffi::{OsStr, OsString},
    fs::{File, OpenOptions},
    io::{self, Seek, SeekFrom, Write},
    path::Path,
    sync::atomic::AtomicBool,
};

use tempfile::TempPath;
use thiserror::Error;
use tracing::{info, warn};
use zip::ZipWriter;

use crate::{
    config::OtaConfig,
    format::{
        ota::{
            PATH_PAYLOAD, PATH_PROPERTIES, PATH_SECONDARY_PAYLOAD, PATH_SECONDARY_PROPERTIES,
        },
        zip::stored_options,
    },
    process::{self, ProcessRunner, run_checked},
    stream,
};

#[derive(Debug, Error)]
pub enum Error {
    #[error("Payload has not been generated yet")]
    NotGenerated,
    #[error("Payload has not been signed yet")]
    NotSigned,
    #[error("Invalid maximum signature size: {0:?}")]
    InvalidMaximumSignatureSize(String),
    #[error("Process error")]
    Process(#[from] process::Error),
    #[error("Zip error")]
    Zip(#[from] zip::result::ZipError),
    #[error("I/O error")]
    Io(#[from] io::Error),
}

type Result<T> = std::result::Result<T, Error>;

fn temp_file(prefix: &str, suffix: &str) -> io::Result<TempPath> {
    let temp = tempfile::Builder::new()
        .prefix(prefix)
        .suffix(suffix)
        .tempfile()?;

    Ok(temp.into_temp_path())
}

/// Wraps the payload signing works. Hashes of the payload and metadata are
/// signed with the device key, either by calling openssl with the package key
/// or by calling an external payload signer, behind the same `sign()` call.
///
/// The maximum signature size must be known before any signature exists
/// because the delta generator reserves that much space in the payload's
/// signature slot.
pub struct PayloadSigner {
    program: OsString,
    args: Vec<OsString>,
    maximum_signature_size: usize,
}

impl PayloadSigner {
    /// Sign with the package private key by calling openssl. The maximum
    /// signature size is whatever the delta generator reports for the key.
    pub fn with_local_key(runner: &dyn ProcessRunner, private_key: &Path) -> Result<Self> {
        let maximum_signature_size = Self::maximum_signature_size(runner, private_key)?;

        let mut args = process::command(["pkeyutl", "-sign", "-inkey"]);
        args.push(private_key.into());
        args.extend(process::command(["-pkeyopt", "digest:sha256"]));

        Ok(Self {
            program: "openssl".into(),
            args,
            maximum_signature_size,
        })
    }

    /// Sign through an external signer program. The signer is invoked with
    /// the caller-provided arguments plus `-in <file>` and `-out <file>`; the
    /// signing key is expected to be part of those arguments.
    pub fn with_external_signer(
        program: &OsStr,
        args: &[OsString],
        maximum_signature_size: Option<usize>,
    ) -> Self {
        let maximum_signature_size = maximum_signature_size.unwrap_or_else(|| {
            // The legacy config uses RSA-2048 keys.
            warn!(
                "The maximum signature size for the payload signer is not set; \
                 defaulting to 256 bytes."
            );
            256
        });

        Self {
            program: program.to_owned(),
            args: args.to_vec(),
            maximum_signature_size,
        }
    }

    fn maximum_signature_size(runner: &dyn ProcessRunner, private_key: &Path) -> Result<usize> {
        let size_file = temp_file("signature_size-", ".txt")?;

        let mut size_arg = OsString::from("--out_maximum_signature_size_file=");
        size_arg.push(size_file.as_os_str());
        let mut key_arg = OsString::from("--private_key=");
        key_arg.push(private_key.as_os_str());

        run_checked(runner, &["delta_generator".into(), size_arg, key_arg])?;

        let raw = std::fs::read_to_string(&size_file)?;
        let size = raw
            .trim()
            .parse()
            .map_err(|_| Error::InvalidMaximumSignatureSize(raw.clone()))?;

        info!("delta_generator reports maximum signature size: {size}");

        Ok(size)
    }

    pub fn max_signature_size(&self) -> usize {
        self.maximum_signature_size
    }

    /// Sign the given file, returning the signature file.
    pub fn sign(&self, runner: &dyn ProcessRunner, input: &Path) -> Result<TempPath> {
        let output = temp_file("signed-", ".bin")?;

        let mut argv = vec![self.program.clone()];
        argv.extend(self.args.iter().cloned());
        argv.push("-in".into());
        argv.push(input.into());
        argv.push("-out".into());
        argv.push(output.to_path_buf().into());

        run_checked(runner, &argv)?;

        Ok(output)
    }
}

/// Manages the creation and signing of an A/B OTA payload.
///
/// The payload moves through `empty -> generated -> signed` before being
/// packaged; each step shells out to the delta generator wrapper. Any tool
/// failure is fatal and the whole package build restarts from scratch.
pub struct Payload {
    secondary: bool,
    payload_file: Option<TempPath>,
    properties_file: Option<TempPath>,
}

impl Payload {
    /// `secondary` selects the independent payload that installs the
    /// secondary slot images; it lives under its own path prefix inside the
    /// package.
    pub fn new(secondary: bool) -> Self {
        Self {
            secondary,
            payload_file: None,
            properties_file: None,
        }
    }

    /// Generate an unsigned payload from the given target-files zip(s). No
    /// source file means a full payload.
    pub fn generate(
        &mut self,
        runner: &dyn ProcessRunner,
        target_file: &Path,
        source_file: Option<&Path>,
        config: &OtaConfig,
        additional_args: &[OsString],
    ) -> Result<()> {
        let payload_file = temp_file("payload-", ".bin")?;

        let mut argv = process::command(["brillo_update_payload", "generate", "--payload"]);
        argv.push(payload_file.to_path_buf().into());
        argv.push("--target_image".into());
        argv.push(target_file.into());

        if let Some(source_file) = source_file {
            argv.push("--source_image".into());
            argv.push(source_file.into());

            // FEC and verity computation toggles apply to incremental
            // generation only.
            if config.disable_fec_computation {
                argv.extend(process::command(["--disable_fec_computation", "true"]));
            }
            if config.disable_verity_computation {
                argv.extend(process::command(["--disable_verity_computation", "true"]));
            }
        }

        argv.extend(additional_args.iter().cloned());

        run_checked(runner, &argv)?;

        self.payload_file = Some(payload_file);
        self.properties_file = None;

        Ok(())
    }

    /// Generate and sign the hashes of the payload and metadata, splice the
    /// signatures back in, and dump the payload properties.
    pub fn sign(
        &mut self,
        runner: &dyn ProcessRunner,
        signer: &PayloadSigner,
        wipe_user_data: bool,
    ) -> Result<()> {
        let payload_file = self.payload_file.as_ref().ok_or(Error::NotGenerated)?;
        let signature_size = signer.max_signature_size().to_string();

        // 1. Generate hashes of the payload and metadata files.
        let payload_sig_file = temp_file("sig-", ".bin")?;
        let metadata_sig_file = temp_file("sig-", ".bin")?;

        let mut argv = process::command(["brillo_update_payload", "hash", "--unsigned_payload"]);
        argv.push(payload_file.to_path_buf().into());
        argv.push("--signature_size".into());
        argv.push(signature_size.clone().into());
        argv.push("--metadata_hash_file".into());
        argv.push(metadata_sig_file.to_path_buf().into());
        argv.push("--payload_hash_file".into());
        argv.push(payload_sig_file.to_path_buf().into());
        run_checked(runner, &argv)?;

        // 2. Sign the hashes.
        let signed_payload_sig = signer.sign(runner, &payload_sig_file)?;
        let signed_metadata_sig = signer.sign(runner, &metadata_sig_file)?;

        // 3. Insert the signatures back into the payload file.
        let signed_payload_file = temp_file("signed-payload-", ".bin")?;

        let mut argv = process::command(["brillo_update_payload", "sign", "--unsigned_payload"]);
        argv.push(payload_file.to_path_buf().into());
        argv.push("--payload".into());
        argv.push(signed_payload_file.to_path_buf().into());
        argv.push("--signature_size".into());
        argv.push(signature_size.into());
        argv.push("--metadata_signature_file".into());
        argv.push(signed_metadata_sig.to_path_buf().into());
        argv.push("--payload_signature_file".into());
        argv.push(signed_payload_sig.to_path_buf().into());
        run_checked(runner, &argv)?;

        // 4. Dump the signed payload properties.
        let properties_file = temp_file("payload-properties-", ".txt")?;

        let mut argv = process::command(["brillo_update_payload", "properties", "--payload"]);
        argv.push(signed_payload_file.to_path_buf().into());
        argv.push("--properties_file".into());
        argv.push(properties_file.to_path_buf().into());
        run_checked(runner, &argv)?;

        // The secondary payload must not switch slots when it finishes; the
        // updater applies it after already having rebooted into the new slot.
        if self.secondary || wipe_user_data {
            let mut file = OpenOptions::new().append(true).open(&properties_file)?;

            if self.secondary {
                file.write_all(b"SWITCH_SLOT_ON_REBOOT=0\n")?;
            }
            if wipe_user_data {
                file.write_all(b"POWERWASH=1\n")?;
            }
        }

        self.payload_file = Some(signed_payload_file);
        self.properties_file = Some(properties_file);

        Ok(())
    }

    /// Store the payload and its properties into the package. Both entries
    /// must be uncompressed so that clients can fetch them by the byte ranges
    /// in the property-files strings.
    pub fn write_to_zip(
        &self,
        zip: &mut ZipWriter<impl Write + Seek>,
        cancel_signal: &AtomicBool,
    ) -> Result<()> {
        let payload_file = self.payload_file.as_ref().ok_or(Error::NotGenerated)?;
        let properties_file = self.properties_file.as_ref().ok_or(Error::NotSigned)?;

        let (payload_name, properties_name) = if self.secondary {
            (PATH_SECONDARY_PAYLOAD, PATH_SECONDARY_PROPERTIES)
        } else {
            (PATH_PAYLOAD, PATH_PROPERTIES)
        };

        for (name, path) in [(payload_name, payload_file), (properties_name, properties_file)] {
            let mut file = File::open(path)?;
            let size = file.seek(SeekFrom::End(0))?;
            file.rewind()?;

            zip.start_file(name, stored_options(size))?;
            stream::copy(&mut file, &mut *zip, cancel_signal)?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::{io::Cursor, io::Read, process::Output, sync::Mutex};

    use assert_matches::assert_matches;

    use super::*;

    /// Emulates brillo_update_payload, delta_generator, and openssl closely
    /// enough to drive the payload state machine: every `--xxx_file`-style
    /// output argument gets a recognizable file written.
    #[derive(Default)]
    struct FakeTools {
        commands: Mutex<Vec<String>>,
    }

    impl FakeTools {
        fn record(&self, argv: &[OsString]) {
            let joined = argv
                .iter()
                .map(|a| a.to_string_lossy().into_owned())
                .collect::<Vec<_>>()
                .join(" ");
            self.commands.lock().unwrap().push(joined);
        }

        fn arg_value(argv: &[OsString], flag: &str) -> Option<std::path::PathBuf> {
            let mut iter = argv.iter();
            while let Some(arg) = iter.next() {
                if arg == flag {
                    return iter.next().map(|v| v.into());
                }
            }
            None
        }
    }

    impl ProcessRunner for FakeTools {
        fn run(&self, argv: &[OsString]) -> io::Result<Output> {
            self.record(argv);

            let program = argv[0].to_string_lossy().into_owned();

            match program.as_str() {
                "delta_generator" => {
                    let arg = argv[1].to_string_lossy().into_owned();
                    let path = arg
                        .strip_prefix("--out_maximum_signature_size_file=")
                        .unwrap();
                    std::fs::write(path, "512\n")?;
                }
                "openssl" | "helper" => {
                    let out = Self::arg_value(argv, "-out").unwrap();
                    std::fs::write(out, b"fake-signature")?;
                }
                "brillo_update_payload" => match argv[1].to_string_lossy().as_ref() {
                    "generate" => {
                        let out = Self::arg_value(argv, "--payload").unwrap();
                        std::fs::write(out, b"unsigned-payload")?;
                    }
                    "hash" => {
                        for flag in ["--metadata_hash_file", "--payload_hash_file"] {
                            let out = Self::arg_value(argv, flag).unwrap();
                            std::fs::write(out, b"hash")?;
                        }
                    }
                    "sign" => {
                        let out = Self::arg_value(argv, "--payload").unwrap();
                        std::fs::write(out, b"signed-payload")?;
                    }
                    "properties" => {
                        let out = Self::arg_value(argv, "--properties_file").unwrap();
                        std::fs::write(out, b"FILE_HASH=abc\nFILE_SIZE=123\n")?;
                    }
                    other => panic!("Unexpected subcommand: {other}"),
                },
                other => panic!("Unexpected program: {other}"),
            }

            Ok(Output {
                status: process::success_status(),
                stdout: vec![],
                stderr: vec![],
            })
        }
    }

    #[test]
    fn local_signer_queries_delta_generator() {
        let runner = FakeTools::default();
        let signer =
            PayloadSigner::with_local_key(&runner, Path::new("/keys/release.pem")).unwrap();

        assert_eq!(signer.max_signature_size(), 512);

        let commands = runner.commands.lock().unwrap();
        assert!(commands[0].starts_with("delta_generator --out_maximum_signature_size_file="));
        assert!(commands[0].ends_with("--private_key=/keys/release.pem"));
    }

    #[test]
    fn external_signer_defaults_to_rsa2048() {
        let signer = PayloadSigner::with_external_signer(OsStr::new("sign-helper"), &[], None);
        assert_eq!(signer.max_signature_size(), 256);

        let signer =
            PayloadSigner::with_external_signer(OsStr::new("sign-helper"), &[], Some(1024));
        assert_eq!(signer.max_signature_size(), 1024);
    }

    #[test]
    fn sign_requires_generate() {
        let runner = FakeTools::default();
        let signer = PayloadSigner::with_external_signer(OsStr::new("helper"), &[], Some(256));

        let mut payload = Payload::new(false);
        assert_matches!(
            payload.sign(&runner, &signer, false),
            Err(Error::NotGenerated)
        );
    }

    #[test]
    fn full_generate_sign_package_flow() {
        let cancel_signal = AtomicBool::new(false);
        let runner = FakeTools::default();
        let config = OtaConfig::default();

        let signer = PayloadSigner::with_local_key(&runner, Path::new("key.pem")).unwrap();

        let mut payload = Payload::new(false);
        payload
            .generate(
                &runner,
                Path::new("target.zip"),
                None,
                &config,
                &process::command(["--max_timestamp", "1500"]),
            )
            .unwrap();
        payload.sign(&runner, &signer, true).unwrap();

        let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
        payload.write_to_zip(&mut writer, &cancel_signal).unwrap();
        let data = writer.finish().unwrap().into_inner();

        let mut zip = zip::ZipArchive::new(Cursor::new(data)).unwrap();

        {
            let entry = zip.by_name(PATH_PAYLOAD).unwrap();
            assert_eq!(entry.compression(), zip::CompressionMethod::Stored);
        }

        let mut properties = String::new();
        zip.by_name(PATH_PROPERTIES)
            .unwrap()
            .read_to_string(&mut properties)
            .unwrap();

        // Wipe packages get the powerwash property appended.
        assert!(properties.contains("FILE_HASH=abc\n"));
        assert!(properties.ends_with("POWERWASH=1\n"));
        assert!(!properties.contains("SWITCH_SLOT_ON_REBOOT"));

        let commands = runner.commands.lock().unwrap();
        let generate = commands
            .iter()
            .find(|c| c.contains("brillo_update_payload generate"))
            .unwrap();
        assert!(generate.contains("--target_image target.zip"));
        assert!(generate.contains("--max_timestamp 1500"));
        assert!(!generate.contains("--source_image"));

        // Four brillo calls, one delta_generator, two openssl signings.
        assert_eq!(
            commands
                .iter()
                .filter(|c| c.starts_with("brillo_update_payload"))
                .count(),
            4,
        );
        assert_eq!(commands.iter().filter(|c| c.starts_with("openssl")).count(), 2);
    }

    #[test]
    fn secondary_payload_disables_slot_switch() {
        let cancel_signal = AtomicBool::new(false);
        let runner = FakeTools::default();
        let config = OtaConfig {
            disable_fec_computation: true,
            ..Default::default()
        };

        let signer = PayloadSigner::with_external_signer(OsStr::new("helper"), &[], Some(256));

        let mut payload = Payload::new(true);
        payload
            .generate(
                &runner,
                Path::new("secondary.zip"),
                Some(Path::new("source.zip")),
                &config,
                &[],
            )
            .unwrap();
        payload.sign(&runner, &signer, false).unwrap();

        let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
        payload.write_to_zip(&mut writer, &cancel_signal).unwrap();
        let data = writer.finish().unwrap().into_inner();

        let mut zip = zip::ZipArchive::new(Cursor::new(data)).unwrap();
        assert!(zip.by_name(PATH_SECONDARY_PAYLOAD).is_ok());

        let mut properties = String::new();
        zip.by_name(PATH_SECONDARY_PROPERTIES)
            .unwrap()
            .read_to_string(&mut properties)
            .unwrap();
        assert!(properties.contains("SWITCH_SLOT_ON_REBOOT=0\n"));

        let commands = runner.commands.lock().unwrap();
        let generate = commands
            .iter()
            .find(|c| c.contains("brillo_update_payload generate"))
            .unwrap();
        assert!(generate.contains("--source_image source.zip"));
        assert!(generate.contains("--disable_fec_computation true"));

        // The external signer handles both hash files.
        assert_eq!(commands.iter().filter(|c| c.starts_with("helper")).count(), 2);
    }
}
