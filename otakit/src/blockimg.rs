// SPDX-FileCopyrightText: 2022-2025 The otakit developers
// SPDX-License-Identifier: GPL-3.0-only

//! Block-level image representation and diffing for non-A/B packages.
//!
//! The output is a version-4 block image transfer list replayed by the
//! updater binary in recovery, plus the new-data and patch-data blobs it
//! references. Binary patches are produced by the external bsdiff tool; the
//! diffing here decides which block regions need patching at all.

use std::{
    ffi::OsString,
    fs::File,
    io::{self, Read, Seek, SeekFrom, Write},
    path::{Path, PathBuf},
    sync::atomic::AtomicBool,
};

use ring::digest::{Context, SHA1_FOR_LEGACY_USE_ONLY};
use thiserror::Error;
use tracing::debug;
use zip::{ZipWriter, write::FileOptions};

use crate::{
    format::rangeset::RangeSet,
    process::{self, ProcessRunner, run_checked},
    stream, util,
};

pub const BLOCK_SIZE: u32 = 4096;

/// Limit the size of the operand in `new` and `zero` commands to 1024 blocks.
/// This prevents the target size of one command from being too large and
/// might help to avoid fsync errors on some devices.
const SPLIT_BLOCK_LIMIT: u64 = 1024;

/// Upper bound on the number of blocks handed to one bsdiff invocation.
const MAX_DIFF_BLOCKS: u64 = 2048;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Transfers have not been computed yet")]
    NotComputed,
    #[error("Process error")]
    Process(#[from] process::Error),
    #[error("Zip error")]
    Zip(#[from] zip::result::ZipError),
    #[error("I/O error")]
    Io(#[from] io::Error),
}

type Result<T> = std::result::Result<T, Error>;

/// A raw partition image addressed in 4096-byte blocks. The final partial
/// block, if any, reads back zero-padded. Handles are opened per read so that
/// images can be shared across the worker pool without interior locking.
#[derive(Clone, Debug)]
pub struct BlockImage {
    path: PathBuf,
    size: u64,
    total_blocks: u64,
}

impl BlockImage {
    pub fn from_path(path: &Path) -> io::Result<Self> {
        let size = File::open(path)?.seek(SeekFrom::End(0))?;
        let total_blocks = size.div_ceil(u64::from(BLOCK_SIZE));

        Ok(Self {
            path: path.to_owned(),
            size,
            total_blocks,
        })
    }

    pub fn total_blocks(&self) -> u64 {
        self.total_blocks
    }

    /// Every block in the image. Raw images carry no don't-care regions.
    pub fn care_map(&self) -> RangeSet {
        RangeSet::from_pairs([(0, self.total_blocks)])
    }

    /// Read the data for a set of blocks into memory.
    pub fn read_ranges(&self, ranges: &RangeSet) -> io::Result<Vec<u8>> {
        let mut file = File::open(&self.path)?;
        let mut buf = Vec::with_capacity((ranges.blocks() * u64::from(BLOCK_SIZE)) as usize);

        for (start, end) in ranges.iter_pairs() {
            let offset = start * u64::from(BLOCK_SIZE);
            let length = (end - start) * u64::from(BLOCK_SIZE);

            let old_len = buf.len();
            buf.resize(old_len + length as usize, 0);

            if offset < self.size {
                file.seek(SeekFrom::Start(offset))?;
                let available = (self.size - offset).min(length) as usize;
                file.read_exact(&mut buf[old_len..old_len + available])?;
            }
        }

        Ok(buf)
    }

    /// Hex SHA-1 of a set of blocks. The transfer list format predates SHA-2
    /// and the updater binary still verifies SHA-1 only.
    pub fn range_sha1(&self, ranges: &RangeSet) -> io::Result<String> {
        let data = self.read_ranges(ranges)?;
        let mut context = Context::new(&SHA1_FOR_LEGACY_USE_ONLY);
        context.update(&data);

        Ok(hex::encode(context.finish()))
    }

    /// Stream the data for a set of blocks into a writer.
    pub fn write_ranges_to(
        &self,
        ranges: &RangeSet,
        mut writer: impl Write,
        cancel_signal: &AtomicBool,
    ) -> io::Result<()> {
        let mut file = File::open(&self.path)?;

        for (start, end) in ranges.iter_pairs() {
            let offset = start * u64::from(BLOCK_SIZE);
            let length = (end - start) * u64::from(BLOCK_SIZE);

            if offset >= self.size {
                write_zeros(&mut writer, length, cancel_signal)?;
                continue;
            }

            file.seek(SeekFrom::Start(offset))?;

            let available = (self.size - offset).min(length);
            stream::copy_n(&mut file, &mut writer, available, cancel_signal)?;
            write_zeros(&mut writer, length - available, cancel_signal)?;
        }

        Ok(())
    }
}

fn write_zeros(
    mut writer: impl Write,
    mut size: u64,
    cancel_signal: &AtomicBool,
) -> io::Result<()> {
    while size > 0 {
        stream::check_cancel(cancel_signal)?;

        let n = size.min(util::ZEROS.len() as u64) as usize;
        writer.write_all(&util::ZEROS[..n])?;
        size -= n as u64;
    }

    Ok(())
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TransferStyle {
    New,
    Zero,
    Bsdiff,
    Imgdiff,
}

impl TransferStyle {
    fn as_str(self) -> &'static str {
        match self {
            Self::New => "new",
            Self::Zero => "zero",
            Self::Bsdiff => "bsdiff",
            Self::Imgdiff => "imgdiff",
        }
    }
}

/// Location of one transfer's patch within the concatenated patch blob.
#[derive(Clone, Copy, Debug)]
pub struct PatchInfo {
    pub offset: u64,
    pub size: u64,
}

#[derive(Clone, Debug)]
pub struct Transfer {
    pub style: TransferStyle,
    pub tgt_ranges: RangeSet,
    pub src_ranges: RangeSet,
    pub tgt_sha1: String,
    pub src_sha1: String,
    pub patch: Option<PatchInfo>,
}

/// Computes the instructions to transform one partition's block image from a
/// source state (or nothing, for full installs) into the target state.
///
/// In-place, equal-offset diffing is used: a changed region is patched from
/// the same block numbers in the source image. No block ever moves, so no
/// stash space is needed and the transfer list always declares zero stashed
/// blocks.
pub struct BlockImageDiff {
    tgt: BlockImage,
    src: Option<BlockImage>,
    disable_imgdiff: bool,
    version: u32,
    transfers: Vec<Transfer>,
    patch_data: Vec<u8>,
    computed: bool,
}

impl BlockImageDiff {
    /// `version` is the transfer list format version accepted by the builds
    /// involved; everything emitted here is valid for versions 3 and up.
    pub fn new(
        tgt: BlockImage,
        src: Option<BlockImage>,
        version: u32,
        disable_imgdiff: bool,
    ) -> Self {
        Self {
            tgt,
            src,
            disable_imgdiff,
            version,
            transfers: vec![],
            patch_data: vec![],
            computed: false,
        }
    }

    pub fn target(&self) -> &BlockImage {
        &self.tgt
    }

    pub fn source(&self) -> Option<&BlockImage> {
        self.src.as_ref()
    }

    /// Scratch space the updater needs while applying this transfer list. No
    /// blocks are ever stashed, so this is the largest single patch.
    pub fn required_cache(&self) -> u64 {
        self.transfers
            .iter()
            .filter_map(|t| t.patch.map(|p| p.size))
            .max()
            .unwrap_or(0)
    }

    /// Compute the transfers and generate the patches.
    pub fn compute(
        &mut self,
        runner: &dyn ProcessRunner,
        cancel_signal: &AtomicBool,
    ) -> Result<()> {
        if self.disable_imgdiff {
            debug!("imgdiff is disabled for this image pair");
        }

        let (zero, new, diff_regions) = self.classify_blocks(cancel_signal)?;

        let mut transfers = vec![];
        let mut patch_data = vec![];

        for region in diff_regions {
            stream::check_cancel(cancel_signal)?;

            let src = self.src.as_ref().unwrap();
            // Region-level imgdiff would need the filesystem's file map to
            // find compressed file boundaries. Raw block images carry none,
            // so every changed region is patched with bsdiff.
            let style = TransferStyle::Bsdiff;

            let src_sha1 = src.range_sha1(&region)?;
            let tgt_sha1 = self.tgt.range_sha1(&region)?;

            let patch = compute_patch(runner, src, &self.tgt, &region)?;
            let patch_info = PatchInfo {
                offset: patch_data.len() as u64,
                size: patch.len() as u64,
            };
            patch_data.extend_from_slice(&patch);

            transfers.push(Transfer {
                style,
                tgt_ranges: region.clone(),
                src_ranges: region,
                tgt_sha1,
                src_sha1,
                patch: Some(patch_info),
            });
        }

        if !new.is_empty() {
            transfers.push(Transfer {
                style: TransferStyle::New,
                tgt_ranges: new,
                src_ranges: RangeSet::new(),
                tgt_sha1: String::new(),
                src_sha1: String::new(),
                patch: None,
            });
        }

        if !zero.is_empty() {
            transfers.push(Transfer {
                style: TransferStyle::Zero,
                tgt_ranges: zero,
                src_ranges: RangeSet::new(),
                tgt_sha1: String::new(),
                src_sha1: String::new(),
                patch: None,
            });
        }

        debug!(
            "{} transfers, {} patch bytes",
            transfers.len(),
            patch_data.len(),
        );

        self.transfers = transfers;
        self.patch_data = patch_data;
        self.computed = true;

        Ok(())
    }

    /// Split the target's blocks into zero blocks, blocks that need raw new
    /// data, and changed regions that can be patched from the source.
    fn classify_blocks(
        &self,
        cancel_signal: &AtomicBool,
    ) -> Result<(RangeSet, RangeSet, Vec<RangeSet>)> {
        let block_size = u64::from(BLOCK_SIZE);
        let total = self.tgt.total_blocks();
        let src_total = self.src.as_ref().map_or(0, |s| s.total_blocks());

        let mut zero_pairs = vec![];
        let mut new_pairs = vec![];
        let mut changed_pairs = vec![];

        // Work in bounded chunks so arbitrarily large images don't need to fit
        // in memory.
        const CHUNK_BLOCKS: u64 = 1024;

        let mut block = 0;
        while block < total {
            stream::check_cancel(cancel_signal)?;

            let chunk_end = (block + CHUNK_BLOCKS).min(total);
            let chunk = RangeSet::from_pairs([(block, chunk_end)]);

            let tgt_data = self.tgt.read_ranges(&chunk)?;
            let src_data = match &self.src {
                Some(src) if block < src_total => {
                    let src_end = chunk_end.min(src_total);
                    Some((src.read_ranges(&RangeSet::from_pairs([(block, src_end)]))?, src_end))
                }
                _ => None,
            };

            for i in block..chunk_end {
                let lo = ((i - block) * block_size) as usize;
                let hi = lo + block_size as usize;
                let tgt_block = &tgt_data[lo..hi];

                let same_as_src = match &src_data {
                    Some((data, src_end)) if i < *src_end => &data[lo..hi] == tgt_block,
                    _ => false,
                };

                if same_as_src {
                    // Unchanged in place; no command needed.
                } else if util::is_zero(tgt_block) {
                    zero_pairs.push((i, i + 1));
                } else if self.src.is_some() && i < src_total {
                    changed_pairs.push((i, i + 1));
                } else {
                    new_pairs.push((i, i + 1));
                }
            }

            block = chunk_end;
        }

        let changed = RangeSet::from_pairs(changed_pairs);

        // Bound the size of each bsdiff invocation.
        let mut regions = vec![];
        for (start, end) in changed.iter_pairs() {
            let mut s = start;
            while s < end {
                let e = (s + MAX_DIFF_BLOCKS).min(end);
                regions.push(RangeSet::from_pairs([(s, e)]));
                s = e;
            }
        }

        Ok((
            RangeSet::from_pairs(zero_pairs),
            RangeSet::from_pairs(new_pairs),
            regions,
        ))
    }

    /// Serialize the version-4 transfer list.
    pub fn transfer_list(&self) -> Result<String> {
        if !self.computed {
            return Err(Error::NotComputed);
        }

        let mut out = vec![];
        let mut total = 0;

        for transfer in &self.transfers {
            let tgt_size = transfer.tgt_ranges.blocks();

            match transfer.style {
                TransferStyle::New | TransferStyle::Zero => {
                    total += write_split_transfers(
                        &mut out,
                        transfer.style.as_str(),
                        &transfer.tgt_ranges,
                    );
                }
                TransferStyle::Bsdiff | TransferStyle::Imgdiff => {
                    let patch = transfer.patch.expect("Diff transfer without patch");

                    //   <style> <patchstart> <patchlen> <srchash> <tgthash>
                    //   <tgt rangeset> <# src blocks> <src rangeset>
                    out.push(format!(
                        "{} {} {} {} {} {} {} {}\n",
                        transfer.style.as_str(),
                        patch.offset,
                        patch.size,
                        transfer.src_sha1,
                        transfer.tgt_sha1,
                        transfer.tgt_ranges.to_string_raw(),
                        transfer.src_ranges.blocks(),
                        transfer.src_ranges.to_string_raw(),
                    ));
                    total += tgt_size;
                }
            }
        }

        // Header: format version, total target blocks written, number of
        // stash slots (unused since v3), and maximum simultaneously stashed
        // blocks.
        out.insert(0, format!("{}\n", self.version));
        out.insert(1, format!("{total}\n"));
        out.insert(2, "0\n".to_owned());
        out.insert(3, "0\n".to_owned());

        Ok(out.concat())
    }

    /// Write `<prefix>.transfer.list`, `<prefix>.new.dat`, and
    /// `<prefix>.patch.dat` into the output archive. This must run on the
    /// archive-writing thread; only [`Self::compute`] is safe to parallelize.
    pub fn write_to_zip(
        &self,
        prefix: &str,
        zip: &mut ZipWriter<impl Write + Seek>,
        cancel_signal: &AtomicBool,
    ) -> Result<()> {
        let transfer_list = self.transfer_list()?;

        zip.start_file(format!("{prefix}.transfer.list"), FileOptions::default())?;
        zip.write_all(transfer_list.as_bytes())?;

        zip.start_file(format!("{prefix}.new.dat"), FileOptions::default())?;
        for transfer in &self.transfers {
            if transfer.style == TransferStyle::New {
                self.tgt
                    .write_ranges_to(&transfer.tgt_ranges, &mut *zip, cancel_signal)?;
            }
        }

        zip.start_file(format!("{prefix}.patch.dat"), FileOptions::default())?;
        zip.write_all(&self.patch_data)?;

        Ok(())
    }

    pub fn transfers(&self) -> &[Transfer] {
        &self.transfers
    }
}

fn write_split_transfers(out: &mut Vec<String>, style: &str, target_blocks: &RangeSet) -> u64 {
    let mut total = 0;
    let mut remaining = target_blocks.clone();

    while !remaining.is_empty() {
        let blocks_to_write = remaining.first(SPLIT_BLOCK_LIMIT);
        out.push(format!("{style} {}\n", blocks_to_write.to_string_raw()));
        total += blocks_to_write.blocks();
        remaining = remaining.subtract(&blocks_to_write);
    }

    total
}

/// Produce a binary patch for one block region via the external bsdiff tool.
fn compute_patch(
    runner: &dyn ProcessRunner,
    src: &BlockImage,
    tgt: &BlockImage,
    region: &RangeSet,
) -> Result<Vec<u8>> {
    let src_file = tempfile::Builder::new().prefix("src-").tempfile()?;
    let tgt_file = tempfile::Builder::new().prefix("tgt-").tempfile()?;
    let patch_file = tempfile::Builder::new()
        .prefix("patch-")
        .suffix(".p")
        .tempfile()?;

    std::fs::write(src_file.path(), src.read_ranges(region)?)?;
    std::fs::write(tgt_file.path(), tgt.read_ranges(region)?)?;

    let argv: Vec<OsString> = vec![
        "bsdiff".into(),
        src_file.path().into(),
        tgt_file.path().into(),
        patch_file.path().into(),
    ];
    run_checked(runner, &argv)?;

    let patch = std::fs::read(patch_file.path())?;

    Ok(patch)
}
