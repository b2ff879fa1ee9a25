//! Storage writer.
//!
//! One dedicated blocking task owns every file handle. At startup it
//! creates the directory tree and pre-extends each file to its declared
//! length (sparse where the filesystem allows), then services
//! `WritePiece` commands by splitting each piece's global byte range
//! across the file regions it covers. Pieces arrive in whatever order
//! they verify; within a piece the slices are written in stream order.
use crate::torrent::FileLayout;
use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::Path;
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("disk full")]
    DiskFull,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type StorageResult<T> = std::result::Result<T, StorageError>;

#[derive(Debug)]
pub enum StorageCommand {
    WritePiece { index: u32, data: Vec<u8> },
}

pub struct StorageWriter {
    layout: FileLayout,
    piece_length: u64,
    files: Vec<File>,
}

impl StorageWriter {
    /// Creates the on-disk tree under `root` and opens every file,
    /// pre-extended to its declared length.
    #[tracing::instrument(level = "debug", skip(layout), fields(files = layout.file_count()))]
    pub fn create(root: &Path, layout: FileLayout, piece_length: u64) -> StorageResult<Self> {
        let mut files = Vec::with_capacity(layout.file_count());
        for (relative, length) in layout.iter() {
            let path = root.join(relative);
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent).map_err(map_io)?;
            }
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(false)
                .open(&path)
                .map_err(map_io)?;
            file.set_len(length).map_err(map_io)?;
            files.push(file);
        }
        Ok(Self {
            layout,
            piece_length,
            files,
        })
    }

    /// Writes one verified piece to its place in the layout.
    pub fn write_piece(&mut self, index: u32, data: &[u8]) -> StorageResult<()> {
        let start = index as u64 * self.piece_length;
        let mut cursor = 0usize;
        for slice in self.layout.locate(start, data.len() as u64) {
            let file = &mut self.files[slice.file];
            file.seek(SeekFrom::Start(slice.offset)).map_err(map_io)?;
            file.write_all(&data[cursor..cursor + slice.len as usize])
                .map_err(map_io)?;
            cursor += slice.len as usize;
        }
        tracing::trace!(index, bytes = data.len(), "piece written");
        Ok(())
    }

    /// Blocking service loop; run it on `tokio::task::spawn_blocking`.
    /// Returns once every sender is gone and the backlog is flushed, or
    /// on the first I/O failure.
    pub fn run(mut self, mut commands: mpsc::Receiver<StorageCommand>) -> StorageResult<()> {
        while let Some(command) = commands.blocking_recv() {
            match command {
                StorageCommand::WritePiece { index, data } => self.write_piece(index, &data)?,
            }
        }
        for file in &mut self.files {
            file.flush().map_err(map_io)?;
            file.sync_all().map_err(map_io)?;
        }
        Ok(())
    }
}

fn map_io(e: std::io::Error) -> StorageError {
    if e.kind() == std::io::ErrorKind::StorageFull {
        StorageError::DiskFull
    } else {
        StorageError::Io(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn two_file_layout() -> FileLayout {
        FileLayout::new(vec![
            (PathBuf::from("a/x"), 10),
            (PathBuf::from("a/y"), 25),
        ])
    }

    #[test]
    fn preallocates_the_declared_lengths() {
        let dir = tempfile::tempdir().unwrap();
        StorageWriter::create(dir.path(), two_file_layout(), 8).unwrap();
        assert_eq!(dir.path().join("a/x").metadata().unwrap().len(), 10);
        assert_eq!(dir.path().join("a/y").metadata().unwrap().len(), 25);
    }

    #[test]
    fn splits_a_piece_across_the_file_boundary() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = StorageWriter::create(dir.path(), two_file_layout(), 8).unwrap();

        // piece 1 covers bytes [8, 16): 2 bytes into a/x, 6 into a/y
        writer.write_piece(1, &[1, 2, 3, 4, 5, 6, 7, 8]).unwrap();

        let x = std::fs::read(dir.path().join("a/x")).unwrap();
        assert_eq!(&x[8..10], &[1, 2]);
        let y = std::fs::read(dir.path().join("a/y")).unwrap();
        assert_eq!(&y[..6], &[3, 4, 5, 6, 7, 8]);
    }

    #[test]
    fn out_of_order_pieces_assemble_the_stream() {
        let dir = tempfile::tempdir().unwrap();
        let layout = FileLayout::new(vec![(PathBuf::from("single"), 16)]);
        let mut writer = StorageWriter::create(dir.path(), layout, 8).unwrap();

        writer.write_piece(1, b"89abcdef").unwrap();
        writer.write_piece(0, b"01234567").unwrap();

        let content = std::fs::read(dir.path().join("single")).unwrap();
        assert_eq!(content, b"0123456789abcdef");
    }

    #[test]
    fn short_final_piece_stays_in_bounds() {
        let dir = tempfile::tempdir().unwrap();
        let layout = FileLayout::new(vec![(PathBuf::from("single"), 11)]);
        let mut writer = StorageWriter::create(dir.path(), layout, 8).unwrap();

        writer.write_piece(0, b"01234567").unwrap();
        writer.write_piece(1, b"89a").unwrap();
        let content = std::fs::read(dir.path().join("single")).unwrap();
        assert_eq!(content, b"0123456789a");
    }

    #[tokio::test]
    async fn service_loop_drains_and_exits_cleanly() {
        let dir = tempfile::tempdir().unwrap();
        let layout = FileLayout::new(vec![(PathBuf::from("single"), 8)]);
        let writer = StorageWriter::create(dir.path(), layout, 8).unwrap();

        let (tx, rx) = mpsc::channel(4);
        let handle = tokio::task::spawn_blocking(move || writer.run(rx));
        tx.send(StorageCommand::WritePiece {
            index: 0,
            data: b"piece=0!".to_vec(),
        })
        .await
        .unwrap();
        drop(tx);

        handle.await.unwrap().unwrap();
        let content = std::fs::read(dir.path().join("single")).unwrap();
        assert_eq!(content, b"piece=0!");
    }
}
