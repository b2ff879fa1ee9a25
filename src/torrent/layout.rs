//! On-disk file layout.
//!
//! The content of a torrent is a flat byte stream; pieces index into that
//! stream, while files partition it. This module owns the offset map
//! between the two so the storage writer can split a piece across file
//! boundaries.
use super::metainfo::InfoDict;
use super::TorrentError;
use std::path::{Path, PathBuf};

/// One contiguous write target inside a single file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileSlice {
    /// Index into the layout's file list.
    pub file: usize,
    /// Byte offset within that file.
    pub offset: u64,
    pub len: u64,
}

#[derive(Debug, Clone)]
struct LayoutFile {
    path: PathBuf,
    /// Offset of the file's first byte in the flat stream.
    start: u64,
    length: u64,
}

/// The strictly increasing partition of `[0, total)` into files.
#[derive(Debug, Clone)]
pub struct FileLayout {
    files: Vec<LayoutFile>,
    total: u64,
}

impl FileLayout {
    pub fn new(files: Vec<(PathBuf, u64)>) -> Self {
        let mut start = 0u64;
        let files = files
            .into_iter()
            .map(|(path, length)| {
                let file = LayoutFile {
                    path,
                    start,
                    length,
                };
                start += length;
                file
            })
            .collect();
        Self {
            files,
            total: start,
        }
    }

    /// Expands an info dictionary into concrete relative paths:
    /// `<name>` for single-file torrents, `<name>/<path...>` otherwise.
    /// Path components are checked so a hostile torrent cannot escape the
    /// output directory.
    pub fn from_info(info: &InfoDict) -> Result<Self, TorrentError> {
        if info.files.is_empty() {
            check_component(&info.name)?;
            let length = info.length.unwrap_or(0);
            return Ok(Self::new(vec![(PathBuf::from(&info.name), length)]));
        }

        check_component(&info.name)?;
        let mut files = Vec::with_capacity(info.files.len());
        for entry in &info.files {
            let mut path = PathBuf::from(&info.name);
            for component in &entry.path {
                check_component(component)?;
                path.push(component);
            }
            files.push((path, entry.length));
        }
        Ok(Self::new(files))
    }

    pub fn total(&self) -> u64 {
        self.total
    }

    pub fn file_count(&self) -> usize {
        self.files.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Path, u64)> {
        self.files.iter().map(|f| (f.path.as_path(), f.length))
    }

    /// Resolves the global byte range `[start, start + len)` into per-file
    /// slices, in stream order. Zero-length files never overlap anything
    /// and are skipped.
    pub fn locate(&self, start: u64, len: u64) -> Vec<FileSlice> {
        let end = start + len;
        let mut slices = Vec::new();
        for (index, file) in self.files.iter().enumerate() {
            let file_end = file.start + file.length;
            if file_end <= start {
                continue;
            }
            if file.start >= end {
                break;
            }
            let slice_start = start.max(file.start);
            let slice_end = end.min(file_end);
            slices.push(FileSlice {
                file: index,
                offset: slice_start - file.start,
                len: slice_end - slice_start,
            });
        }
        slices
    }
}

fn check_component(component: &str) -> Result<(), TorrentError> {
    if component.is_empty()
        || component == "."
        || component == ".."
        || component.contains(['/', '\\'])
        || component.contains('\0')
    {
        return Err(TorrentError::UnsafePath(component.to_string()));
    }
    Ok(())
}
