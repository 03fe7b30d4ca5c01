use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use anyhow::Context;

use crate::metainfo::FileEntry;

/// Output-file backend. Files are created with their full length up front
/// (sparse where the file system supports it) and are only ever touched
/// with positional writes.
///
/// The backend is synchronous; callers run it on the blocking pool.
pub struct FileStorage {
    files: Vec<File>,
}

impl FileStorage {
    pub fn create(base_path: &Path, entries: &[FileEntry]) -> anyhow::Result<Self> {
        let mut files = Vec::with_capacity(entries.len());
        for entry in entries {
            let path = base_path.join(&entry.path);
            std::fs::create_dir_all(
                path.parent()
                    .with_context(|| format!("bug: a file with no parent? {:?}", path))?,
            )
            .with_context(|| format!("error while creating parent directories for a file: {:?}", path))?;

            let file = std::fs::OpenOptions::new()
                .create(true)
                .write(true)
                .read(true)
                .open(&path)
                .with_context(|| format!("error while opening/creating a file: {path:?}"))?;

            file.set_len(entry.length)
                .with_context(|| format!("error while preallocating a file: {:?}, {}", path, entry.length))?;

            files.push(file);
        }

        Ok(FileStorage { files })
    }

    pub fn write_all(&mut self, file_idx: usize, offset: u64, buf: &[u8]) -> anyhow::Result<()> {
        let file = &mut self.files.get(file_idx).context("bug: non-existing file index?")?;
        file.seek(SeekFrom::Start(offset))
            .context("error while seeking the provided offset")?;
        file.write_all(buf).context("error while writing to file")?;

        Ok(())
    }

    pub fn read_exact(&mut self, file_idx: usize, offset: u64, buf: &mut [u8]) -> anyhow::Result<()> {
        let file = &mut self.files.get(file_idx).context("bug: non-existing file index?")?;
        file.seek(SeekFrom::Start(offset))
            .context("error while seeking the provided offset")?;
        file.read_exact(buf).context("error while reading from file")?;

        Ok(())
    }

    pub fn sync_all(&mut self) -> anyhow::Result<()> {
        for file in &self.files {
            file.sync_all().context("error while flushing a file to disk")?;
        }

        Ok(())
    }
}

/// A contiguous span of one output file, produced by resolving a range of
/// the logical payload against the file table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileSlice {
    pub file_idx: usize,
    pub offset: u64,
    pub length: u64,
}

/// Maps `[global_offset, global_offset + length)` of the logical payload
/// onto the files it touches, in payload order. A piece that straddles
/// file boundaries yields one slice per file.
///
/// `entries` carry their prefix-sum offsets, so resolution is a single scan.
pub fn file_slices(entries: &[FileEntry], global_offset: u64, length: u64) -> Vec<FileSlice> {
    let mut slices = Vec::with_capacity(1);
    let mut remaining = length;
    let mut cursor = global_offset;

    for (file_idx, entry) in entries.iter().enumerate() {
        if remaining == 0 {
            break;
        }
        let file_end = entry.offset + entry.length;
        if cursor >= file_end {
            continue;
        }

        let offset_into_file = cursor - entry.offset;
        let slice_length = remaining.min(entry.length - offset_into_file);

        slices.push(FileSlice {
            file_idx,
            offset: offset_into_file,
            length: slice_length,
        });

        cursor += slice_length;
        remaining -= slice_length;
    }

    slices
}
