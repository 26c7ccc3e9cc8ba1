// SPDX-FileCopyrightText: 2022-2025 The otakit developers
// SPDX-License-Identifier: GPL-3.0-only

use std::{
    ffi::OsString,
    fs::{self, OpenOptions},
    io,
    path::Path,
    sync::atomic::AtomicBool,
};

use rsa::RsaPrivateKey;
use thiserror::Error;
use x509_cert::Certificate;

use crate::{
    crypto,
    format::ota::SigningWriter,
    process::{self, ProcessRunner, run_checked},
};

#[derive(Debug, Error)]
pub enum Error {
    #[error("Private key does not match certificate")]
    KeyMismatch,
    #[error("OTA format error")]
    Ota(#[from] crate::format::ota::Error),
    #[error("Crypto error")]
    Crypto(#[from] crypto::Error),
    #[error("Process error")]
    Process(#[from] process::Error),
    #[error("I/O error")]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Signs a whole OTA package archive. Implementations may rewrite the archive
/// (reordering or padding entries); the metadata finalization protocol
/// tolerates that by recomputing entry offsets after the preliminary pass.
pub trait OtaSigner {
    fn sign(&self, input: &Path, output: &Path, cancel_signal: &AtomicBool) -> Result<()>;
}

/// In-process signer producing the signapk-compatible whole-file signature in
/// the archive comment. Entry offsets are preserved, so the finalization
/// retry path never triggers with this signer.
pub struct CmsSigner {
    key: RsaPrivateKey,
    cert: Certificate,
}

impl CmsSigner {
    pub fn new(key: RsaPrivateKey, cert: Certificate) -> Result<Self> {
        if !crypto::cert_matches_key(&cert, &key)? {
            return Err(Error::KeyMismatch);
        }

        Ok(Self { key, cert })
    }
}

impl OtaSigner for CmsSigner {
    fn sign(&self, input: &Path, output: &Path, cancel_signal: &AtomicBool) -> Result<()> {
        fs::copy(input, output)?;

        let file = OpenOptions::new().read(true).write(true).open(output)?;
        let writer = SigningWriter::new(file);
        writer.finish(&self.key, &self.cert, cancel_signal)?;

        Ok(())
    }
}

/// External whole-file signer program, invoked as
/// `<program> [args...] <input> <output>`. The program owns the key material
/// and may lay out the output archive however it wants.
pub struct ExternalSigner<'a> {
    pub program: OsString,
    pub args: Vec<OsString>,
    pub runner: &'a dyn ProcessRunner,
}

impl OtaSigner for ExternalSigner<'_> {
    fn sign(&self, input: &Path, output: &Path, _cancel_signal: &AtomicBool) -> Result<()> {
        let mut argv = vec![self.program.clone()];
        argv.extend(self.args.iter().cloned());
        argv.push(input.into());
        argv.push(output.into());

        run_checked(self.runner, &argv)?;

        Ok(())
    }
}
