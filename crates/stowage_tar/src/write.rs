//! Functions to write tar archives to any [`std::io::Write`].

use std::io::{Read, Write};
use std::path::Path;
use std::time::UNIX_EPOCH;

use fs_err as fs;
use tokio_util::sync::CancellationToken;

use crate::header::{padding_for, Header, BLOCK_SIZE};
use crate::stream::{check_cancelled, copy_exact};
use crate::ArchiveError;

/// Appends entries to a tar stream.
///
/// Names longer than the 100 byte header field are written with a GNU long
/// name record. The archive is only complete after [`TarWriter::finish`]
/// wrote the two terminating zero blocks.
pub struct TarWriter<W: Write> {
    writer: W,
    cancellation: CancellationToken,
}

impl<W: Write> TarWriter<W> {
    /// Writes a tar stream into `writer`.
    pub fn new(writer: W) -> Self {
        Self {
            writer,
            cancellation: CancellationToken::new(),
        }
    }

    /// Sets the token that aborts writing between chunks.
    #[must_use]
    pub fn with_cancellation(self, cancellation: CancellationToken) -> Self {
        Self {
            cancellation,
            ..self
        }
    }

    /// Appends a directory entry.
    pub fn append_dir(&mut self, name: &str, mtime: u64) -> Result<(), ArchiveError> {
        check_cancelled(&self.cancellation)?;
        let header = Header::directory(name).with_mtime(mtime);
        self.writer.write_all(&header.encode_entry())?;
        Ok(())
    }

    /// Appends a file entry with exactly `size` bytes taken from `reader`.
    ///
    /// `on_bytes` is called with the size of every chunk of the body that was
    /// written. Fails with [`ArchiveError::TruncatedStream`] if `reader` holds
    /// fewer than `size` bytes.
    pub fn append_data(
        &mut self,
        name: &str,
        size: u64,
        mtime: u64,
        reader: &mut impl Read,
        on_bytes: impl FnMut(u64),
    ) -> Result<(), ArchiveError> {
        check_cancelled(&self.cancellation)?;
        let header = Header::file(name, size).with_mtime(mtime);
        self.writer.write_all(&header.encode_entry())?;
        copy_exact(reader, &mut self.writer, size, &self.cancellation, on_bytes)?;
        self.write_padding(size)
    }

    /// Appends the file at `path` under `name`. The size is taken from the
    /// file's metadata when it is opened.
    pub fn append_file(
        &mut self,
        name: &str,
        path: &Path,
        on_bytes: impl FnMut(u64),
    ) -> Result<(), ArchiveError> {
        let mut file = fs::File::open(path)?;
        let metadata = file.metadata()?;
        self.append_data(name, metadata.len(), mtime_of(&metadata), &mut file, on_bytes)
    }

    /// Appends everything below `root` with names prefixed by `base_name`.
    ///
    /// Entries are written in file name order, parents before children.
    /// Symlinks and other special files are not archived. `root` itself is not
    /// written, callers add the directory entry for `base_name` if they need
    /// one.
    pub fn append_tree(
        &mut self,
        root: &Path,
        base_name: &str,
        mut on_bytes: impl FnMut(u64),
    ) -> Result<(), ArchiveError> {
        let base_name = base_name.trim_end_matches('/');
        for entry in walkdir::WalkDir::new(root)
            .min_depth(1)
            .sort_by_file_name()
        {
            let entry = entry.map_err(std::io::Error::from)?;
            check_cancelled(&self.cancellation)?;

            let relative = entry
                .path()
                .strip_prefix(root)
                .map_err(|_err| {
                    ArchiveError::InvalidArchive(format!(
                        "{} is not below {}",
                        entry.path().display(),
                        root.display()
                    ))
                })?;
            let relative = relative
                .components()
                .map(|component| component.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");
            let name = format!("{base_name}/{relative}");

            let file_type = entry.file_type();
            if file_type.is_dir() {
                let mtime = entry.metadata().map(|m| mtime_of(&m)).unwrap_or(0);
                self.append_dir(&name, mtime)?;
            } else if file_type.is_file() {
                self.append_file(&name, entry.path(), &mut on_bytes)?;
            } else {
                tracing::debug!("not archiving special file {}", entry.path().display());
            }
        }
        Ok(())
    }

    /// Writes the end of archive marker and returns the underlying writer.
    pub fn finish(mut self) -> Result<W, ArchiveError> {
        self.writer.write_all(&[0u8; BLOCK_SIZE * 2])?;
        self.writer.flush()?;
        Ok(self.writer)
    }

    /// A mutable reference to the underlying writer.
    pub fn get_mut(&mut self) -> &mut W {
        &mut self.writer
    }

    fn write_padding(&mut self, size: u64) -> Result<(), ArchiveError> {
        let padding = padding_for(size) as usize;
        self.writer.write_all(&[0u8; BLOCK_SIZE][..padding])?;
        Ok(())
    }
}

fn mtime_of(metadata: &std::fs::Metadata) -> u64 {
    metadata
        .modified()
        .ok()
        .and_then(|time| time.duration_since(UNIX_EPOCH).ok())
        .map_or(0, |duration| duration.as_secs())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::header::EntryType;
    use crate::read::TarArchive;
    use crate::EntryKind;
    use assert_matches::assert_matches;
    use std::io::Cursor;

    #[test]
    fn test_layout() {
        let mut writer = TarWriter::new(Vec::new());
        writer.append_dir("root", 0).unwrap();
        writer
            .append_data("root/a.txt", 5, 0, &mut Cursor::new(b"hello"), |_| {})
            .unwrap();
        let bytes = writer.finish().unwrap();

        // dir header, file header, one body block, two zero blocks
        assert_eq!(bytes.len(), 5 * BLOCK_SIZE);
        assert_eq!(&bytes[2 * BLOCK_SIZE..2 * BLOCK_SIZE + 5], b"hello");
        assert!(bytes[3 * BLOCK_SIZE..].iter().all(|b| *b == 0));

        let first: [u8; BLOCK_SIZE] = bytes[..BLOCK_SIZE].try_into().unwrap();
        let header = Header::decode(&first).unwrap().unwrap();
        assert_eq!(header.name, "root/");
        assert_eq!(header.entry_type, EntryType::Directory);
    }

    #[test]
    fn test_short_reader() {
        let mut writer = TarWriter::new(Vec::new());
        let result = writer.append_data("a", 100, 0, &mut Cursor::new(vec![0u8; 10]), |_| {});
        assert_matches!(
            result,
            Err(ArchiveError::TruncatedStream {
                expected: 100,
                actual: 10
            })
        );
    }

    #[test]
    fn test_append_tree() {
        let temp_dir = tempfile::tempdir().unwrap();
        let root = temp_dir.path();
        std::fs::create_dir_all(root.join("chats/empty")).unwrap();
        std::fs::write(root.join("chats/b.json"), "bb").unwrap();
        std::fs::write(root.join("chats/a.json"), "a").unwrap();
        std::fs::write(root.join("settings.json"), "{}").unwrap();

        let mut written = 0;
        let mut writer = TarWriter::new(Vec::new());
        writer.append_tree(root, "data/", |n| written += n).unwrap();
        let bytes = writer.finish().unwrap();
        assert_eq!(written, 5);

        let mut archive = TarArchive::new(Cursor::new(bytes));
        let mut names = Vec::new();
        while let Some(entry) = archive.next_entry().unwrap() {
            names.push((entry.path().to_owned(), entry.kind()));
        }
        assert_eq!(
            names,
            vec![
                ("data/chats".to_owned(), EntryKind::Directory),
                ("data/chats/a.json".to_owned(), EntryKind::File),
                ("data/chats/b.json".to_owned(), EntryKind::File),
                ("data/chats/empty".to_owned(), EntryKind::Directory),
                ("data/settings.json".to_owned(), EntryKind::File),
            ]
        );
    }

    #[test]
    fn test_cancelled() {
        let cancellation = CancellationToken::new();
        let mut writer = TarWriter::new(Vec::new()).with_cancellation(cancellation.clone());
        writer.append_dir("a", 0).unwrap();
        cancellation.cancel();
        assert_matches!(writer.append_dir("b", 0), Err(ArchiveError::Cancelled));
    }
}
