//! Functions to read and extract archives from any [`std::io::Read`].
//!
//! [`extract`] detects the container format from the first bytes of the
//! stream. Tar entries can also be consumed lazily with [`TarArchive`].

use std::fmt::{Display, Formatter};
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;

use flate2::read::GzDecoder;
use fs_err as fs;
use tempfile::SpooledTempFile;
use tokio_util::sync::CancellationToken;
use zip::ZipArchive;

use crate::guard::{self, DestinationRoot};
use crate::header::{
    decode_long_name, padding_for, EntryType, Header, BLOCK_SIZE, MAX_LONG_NAME_SIZE,
};
use crate::stream::{
    check_cancelled, copy_exact, copy_to_end, read_block, read_exact_vec, skip_exact, PeekReader,
};
use crate::{ArchiveEntry, ArchiveError, EntryKind};

/// The container format of an archive stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArchiveFormat {
    /// An uncompressed tar stream.
    Tar,
    /// A gzip compressed tar stream.
    GzipTar,
    /// A zip archive.
    Zip,
}

impl ArchiveFormat {
    /// Determines the format from the first two bytes of a stream. Anything
    /// that is neither zip nor gzip is treated as raw tar.
    pub fn sniff(prefix: &[u8]) -> Self {
        match prefix {
            [b'P', b'K', ..] => ArchiveFormat::Zip,
            [0x1f, 0x8b, ..] => ArchiveFormat::GzipTar,
            _ => ArchiveFormat::Tar,
        }
    }
}

impl Display for ArchiveFormat {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            ArchiveFormat::Tar => write!(f, "tar"),
            ArchiveFormat::GzipTar => write!(f, "tar.gz"),
            ArchiveFormat::Zip => write!(f, "zip"),
        }
    }
}

/// Peeks at the start of `reader` to find out its format. No bytes are
/// consumed.
pub fn detect_format<R: Read>(reader: &mut PeekReader<R>) -> std::io::Result<ArchiveFormat> {
    Ok(ArchiveFormat::sniff(reader.peek(2)?))
}

/// What to do with an entry, decided by the path mapper of
/// [`ExtractOptions`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryAction {
    /// Write the entry at the given path relative to the destination.
    Extract(String),
    /// Ignore the entry.
    Skip,
}

/// What happened to a single entry during extraction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryOutcome {
    /// The entry was written to the destination.
    Applied,
    /// The entry was ignored.
    Skipped,
}

type PathMapper = dyn Fn(&str, EntryKind) -> EntryAction + Send + Sync;

/// Options that control [`extract`].
pub struct ExtractOptions {
    cancellation: CancellationToken,
    map_path: Box<PathMapper>,
}

impl Default for ExtractOptions {
    fn default() -> Self {
        Self {
            cancellation: CancellationToken::new(),
            map_path: Box::new(|path, _| EntryAction::Extract(path.to_owned())),
        }
    }
}

impl ExtractOptions {
    /// Sets the token that aborts the extraction between chunks.
    #[must_use]
    pub fn with_cancellation(self, cancellation: CancellationToken) -> Self {
        Self {
            cancellation,
            ..self
        }
    }

    /// Sets the function that maps archive paths to destination paths. It is
    /// only called for names that passed the containment check.
    #[must_use]
    pub fn with_path_mapper(
        self,
        map_path: impl Fn(&str, EntryKind) -> EntryAction + Send + Sync + 'static,
    ) -> Self {
        Self {
            map_path: Box::new(map_path),
            ..self
        }
    }

    /// The cancellation token.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }
}

/// Result of a successful [`extract`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExtractSummary {
    /// The detected container format.
    pub format: ArchiveFormat,
    /// The number of entries written to the destination.
    pub applied: usize,
    /// The number of entries the mapper skipped.
    pub skipped: usize,
}

/// Extracts the archive in `reader` into `destination`.
///
/// The destination is created if it does not exist. `on_entry` is called once
/// for every entry after it has been handled. A name that would escape the
/// destination aborts the whole extraction with
/// [`ArchiveError::PathTraversal`], even if the mapper would skip it.
pub fn extract(
    reader: impl Read,
    destination: &Path,
    options: &ExtractOptions,
    mut on_entry: impl FnMut(&ArchiveEntry, EntryOutcome),
) -> Result<ExtractSummary, ArchiveError> {
    let root = DestinationRoot::create(destination)?;
    let mut reader = PeekReader::new(reader);
    let format = detect_format(&mut reader)?;
    tracing::debug!(
        "extracting {format} archive into {}",
        root.path().display()
    );

    let mut summary = ExtractSummary {
        format,
        applied: 0,
        skipped: 0,
    };
    let mut tally = |entry: &ArchiveEntry, outcome: EntryOutcome| {
        match outcome {
            EntryOutcome::Applied => summary.applied += 1,
            EntryOutcome::Skipped => summary.skipped += 1,
        }
        on_entry(entry, outcome);
    };

    match format {
        ArchiveFormat::Tar => {
            let archive = TarArchive::new(reader).with_cancellation(options.cancellation.clone());
            extract_tar(archive, &root, options, &mut tally)?;
        }
        ArchiveFormat::GzipTar => {
            let archive = TarArchive::new(GzDecoder::new(reader))
                .with_cancellation(options.cancellation.clone());
            extract_tar(archive, &root, options, &mut tally)?;
        }
        ArchiveFormat::Zip => extract_zip(reader, &root, options, &mut tally)?,
    }

    Ok(summary)
}

fn extract_tar<R: Read>(
    mut archive: TarArchive<R>,
    root: &DestinationRoot,
    options: &ExtractOptions,
    on_entry: &mut impl FnMut(&ArchiveEntry, EntryOutcome),
) -> Result<(), ArchiveError> {
    while let Some(mut entry) = archive.next_entry()? {
        let info = entry.entry().clone();
        let outcome = apply_entry(root, options, &info, |file| {
            copy_exact(&mut entry, file, info.size, &options.cancellation, |_| {})
        })?;
        on_entry(&info, outcome);
    }
    Ok(())
}

/// Zip archives up to this size are buffered in memory, bigger ones spill to
/// a temporary file.
const ZIP_SPOOL_LIMIT: usize = 5 * 1024 * 1024;

/// Reads a zip archive through its central directory.
///
/// The stream is spooled first. Zip writers that stream their output (Java's
/// `ZipOutputStream`, Finder's "Compress") store sizes in a data descriptor
/// after each body, which a forward-only reader cannot handle.
fn extract_zip(
    mut reader: impl Read,
    root: &DestinationRoot,
    options: &ExtractOptions,
    on_entry: &mut impl FnMut(&ArchiveEntry, EntryOutcome),
) -> Result<(), ArchiveError> {
    let mut spooled = SpooledTempFile::new(ZIP_SPOOL_LIMIT);
    copy_to_end(&mut reader, &mut spooled, &options.cancellation)?;
    spooled.seek(SeekFrom::Start(0))?;
    let mut archive = ZipArchive::new(spooled)?;

    for index in 0..archive.len() {
        check_cancelled(&options.cancellation)?;
        let mut file = archive.by_index(index)?;
        let name = file.name().to_owned();
        let kind = if file.is_dir() {
            EntryKind::Directory
        } else {
            EntryKind::File
        };
        let path = guard::strip_current_dir(&name).trim_end_matches('/').to_owned();
        if path.is_empty() || path == "." {
            continue;
        }

        let info = ArchiveEntry {
            path,
            kind,
            size: match kind {
                EntryKind::File => file.size(),
                EntryKind::Directory => 0,
            },
        };
        let outcome = apply_entry(root, options, &info, |out| {
            copy_exact(&mut file, out, info.size, &options.cancellation, |_| {})?;
            // The checksum is verified once the entry reader hits its end.
            match copy_to_end(&mut file, &mut std::io::sink(), &options.cancellation)? {
                0 => Ok(()),
                extra => Err(ArchiveError::InvalidArchive(format!(
                    "zip entry '{}' is {extra} bytes longer than its header says",
                    info.path
                ))),
            }
        })?;
        on_entry(&info, outcome);
    }
    Ok(())
}

/// Writes a single entry. The raw name is checked before the mapper sees it,
/// the mapped name is resolved against the root before anything is created.
fn apply_entry(
    root: &DestinationRoot,
    options: &ExtractOptions,
    entry: &ArchiveEntry,
    write_body: impl FnOnce(&mut fs::File) -> Result<(), ArchiveError>,
) -> Result<EntryOutcome, ArchiveError> {
    check_cancelled(&options.cancellation)?;
    guard::check_name(&entry.path)?;

    let target_name = match (options.map_path)(&entry.path, entry.kind) {
        EntryAction::Extract(name) => name,
        EntryAction::Skip => {
            tracing::trace!("skipping archive entry '{}'", entry.path);
            return Ok(EntryOutcome::Skipped);
        }
    };
    let target = root.resolve(&target_name)?;

    match entry.kind {
        EntryKind::Directory => fs::create_dir_all(&target)?,
        EntryKind::File => {
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)?;
            }
            let mut file = fs::File::create(&target)?;
            write_body(&mut file)?;
        }
    }
    Ok(EntryOutcome::Applied)
}

/// A lazy reader over the entries of a tar stream.
///
/// Long name records and PAX headers are consumed transparently. Entries other
/// than regular files and directories are skipped. A stream that ends on a
/// block boundary without the zero terminator is accepted.
pub struct TarArchive<R> {
    reader: R,
    cancellation: CancellationToken,
    remaining: u64,
    padding: u64,
    finished: bool,
}

impl<R: Read> TarArchive<R> {
    /// Reads a tar stream from `reader`.
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            cancellation: CancellationToken::new(),
            remaining: 0,
            padding: 0,
            finished: false,
        }
    }

    /// Sets the token that aborts reading between blocks.
    #[must_use]
    pub fn with_cancellation(self, cancellation: CancellationToken) -> Self {
        Self {
            cancellation,
            ..self
        }
    }

    /// Returns the next entry, or `None` at the end of the archive.
    ///
    /// The unread part of the previous entry is skipped first.
    pub fn next_entry(&mut self) -> Result<Option<TarEntry<'_, R>>, ArchiveError> {
        self.skip_rest()?;

        let mut long_name: Option<String> = None;
        loop {
            check_cancelled(&self.cancellation)?;
            if self.finished {
                return Ok(None);
            }

            let mut block = [0u8; BLOCK_SIZE];
            if !read_block(&mut self.reader, &mut block)? {
                self.finished = true;
                return Ok(None);
            }
            let Some(header) = Header::decode(&block)? else {
                self.finished = true;
                return Ok(None);
            };

            match header.entry_type {
                EntryType::GnuLongName => {
                    if header.size > MAX_LONG_NAME_SIZE {
                        return Err(ArchiveError::InvalidArchive(format!(
                            "long name record of {} bytes exceeds the limit of {MAX_LONG_NAME_SIZE} bytes",
                            header.size
                        )));
                    }
                    let payload = read_exact_vec(&mut self.reader, header.size, &self.cancellation)?;
                    skip_exact(&mut self.reader, padding_for(header.size), &self.cancellation)?;
                    long_name = Some(decode_long_name(&payload));
                }
                EntryType::GnuLongLink | EntryType::PaxExtended | EntryType::PaxGlobal => {
                    self.skip_body(header.size)?;
                }
                EntryType::Other(flag) => {
                    tracing::debug!(
                        "skipping tar entry '{}' with unsupported type '{}'",
                        header.name,
                        flag as char
                    );
                    long_name = None;
                    self.skip_body(header.size)?;
                }
                EntryType::Regular | EntryType::Directory => {
                    let name = long_name.take().unwrap_or(header.name);
                    let is_dir =
                        header.entry_type == EntryType::Directory || name.ends_with('/');
                    let path = guard::strip_current_dir(&name)
                        .trim_end_matches('/')
                        .to_owned();

                    if path.is_empty() || path == "." || is_dir {
                        self.skip_body(header.size)?;
                        if path.is_empty() || path == "." {
                            continue;
                        }
                    } else {
                        self.remaining = header.size;
                        self.padding = padding_for(header.size);
                    }

                    let entry = if is_dir {
                        ArchiveEntry {
                            path,
                            kind: EntryKind::Directory,
                            size: 0,
                        }
                    } else {
                        ArchiveEntry {
                            path,
                            kind: EntryKind::File,
                            size: header.size,
                        }
                    };
                    return Ok(Some(TarEntry {
                        archive: self,
                        entry,
                    }));
                }
            }
        }
    }

    /// Returns the underlying reader.
    pub fn into_inner(self) -> R {
        self.reader
    }

    fn skip_body(&mut self, size: u64) -> Result<(), ArchiveError> {
        skip_exact(&mut self.reader, size + padding_for(size), &self.cancellation)
    }

    fn skip_rest(&mut self) -> Result<(), ArchiveError> {
        let len = self.remaining + self.padding;
        self.remaining = 0;
        self.padding = 0;
        skip_exact(&mut self.reader, len, &self.cancellation)
    }
}

/// A single entry of a [`TarArchive`]. Reading from it yields the body.
pub struct TarEntry<'a, R> {
    archive: &'a mut TarArchive<R>,
    entry: ArchiveEntry,
}

impl<R> std::fmt::Debug for TarEntry<'_, R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TarEntry")
            .field("entry", &self.entry)
            .finish_non_exhaustive()
    }
}

impl<R> TarEntry<'_, R> {
    /// Describes the entry.
    pub fn entry(&self) -> &ArchiveEntry {
        &self.entry
    }

    /// The entry name with a leading `./` removed.
    pub fn path(&self) -> &str {
        &self.entry.path
    }

    /// Whether this is a file or a directory.
    pub fn kind(&self) -> EntryKind {
        self.entry.kind
    }

    /// The size of the body in bytes.
    pub fn size(&self) -> u64 {
        self.entry.size
    }
}

impl<R: Read> Read for TarEntry<'_, R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let remaining = self.archive.remaining;
        if remaining == 0 || buf.is_empty() {
            return Ok(0);
        }
        let len = buf.len().min(usize::try_from(remaining).unwrap_or(usize::MAX));
        let read = self.archive.reader.read(&mut buf[..len])?;
        if read == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                format!("tar entry '{}' ended early", self.entry.path),
            ));
        }
        self.archive.remaining -= read as u64;
        Ok(read)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use rstest::rstest;
    use std::io::Cursor;

    fn archive(entries: &[(&str, &[u8])]) -> Vec<u8> {
        let mut out = Vec::new();
        for (name, body) in entries {
            if name.ends_with('/') {
                out.extend(Header::directory(*name).encode_entry());
            } else {
                out.extend(Header::file(*name, body.len() as u64).encode_entry());
                out.extend_from_slice(body);
                out.resize(out.len() + padding_for(body.len() as u64) as usize, 0);
            }
        }
        out.resize(out.len() + 2 * BLOCK_SIZE, 0);
        out
    }

    #[rstest]
    #[case(b"PK\x03\x04", ArchiveFormat::Zip)]
    #[case(&[0x1f, 0x8b, 0x08], ArchiveFormat::GzipTar)]
    #[case(b"data", ArchiveFormat::Tar)]
    #[case(b"P", ArchiveFormat::Tar)]
    #[case(b"", ArchiveFormat::Tar)]
    fn test_sniff(#[case] prefix: &[u8], #[case] expected: ArchiveFormat) {
        assert_eq!(ArchiveFormat::sniff(prefix), expected);
    }

    #[test]
    fn test_lazy_entries() {
        let data = archive(&[("./dir/", b""), ("./dir/a.txt", b"hello"), ("b.txt", b"world!")]);
        let mut archive = TarArchive::new(Cursor::new(data));

        let entry = archive.next_entry().unwrap().unwrap();
        assert_eq!(entry.path(), "dir");
        assert_eq!(entry.kind(), EntryKind::Directory);

        let mut entry = archive.next_entry().unwrap().unwrap();
        assert_eq!(entry.path(), "dir/a.txt");
        let mut body = String::new();
        entry.read_to_string(&mut body).unwrap();
        assert_eq!(body, "hello");

        // The body of this one is never read, the archive skips it.
        let entry = archive.next_entry().unwrap().unwrap();
        assert_eq!(entry.path(), "b.txt");
        assert_eq!(entry.size(), 6);

        assert!(archive.next_entry().unwrap().is_none());
        assert!(archive.next_entry().unwrap().is_none());
    }

    #[test]
    fn test_skips_unsupported_and_pax_entries() {
        let mut data = Vec::new();
        let mut pax = Header::file("pax", 20);
        pax.entry_type = EntryType::PaxExtended;
        data.extend(pax.encode());
        data.extend([b'x'; 20]);
        data.resize(data.len() + padding_for(20) as usize, 0);
        let mut link = Header::file("link", 0);
        link.entry_type = EntryType::Other(b'2');
        data.extend(link.encode());
        data.extend(archive(&[("kept.txt", b"ok")]));

        let mut archive = TarArchive::new(Cursor::new(data));
        let entry = archive.next_entry().unwrap().unwrap();
        assert_eq!(entry.path(), "kept.txt");
        drop(entry);
        assert!(archive.next_entry().unwrap().is_none());
    }

    #[test]
    fn test_rejects_oversized_long_name() {
        let mut header = Header::file("././@LongLink", MAX_LONG_NAME_SIZE + 1);
        header.entry_type = EntryType::GnuLongName;
        let mut data = header.encode().to_vec();
        data.resize(data.len() + 4 * BLOCK_SIZE, 0);

        let mut archive = TarArchive::new(Cursor::new(data));
        assert_matches!(
            archive.next_entry().err(),
            Some(ArchiveError::InvalidArchive(_))
        );
    }

    #[test]
    fn test_truncated_body() {
        let mut data = Header::file("big.bin", 4000).encode().to_vec();
        data.extend([1u8; 1000]);
        let temp_dir = tempfile::tempdir().unwrap();
        let result = extract(
            Cursor::new(data),
            temp_dir.path(),
            &ExtractOptions::default(),
            |_, _| {},
        );
        assert_matches!(
            result,
            Err(ArchiveError::TruncatedStream {
                expected: 4000,
                actual: 1000
            })
        );
    }

    #[test]
    fn test_mapper_skips_and_renames() {
        let data = archive(&[
            ("root/keep.txt", b"keep"),
            ("root/drop.txt", b"drop"),
            ("root/sub/", b""),
        ]);
        let temp_dir = tempfile::tempdir().unwrap();
        let options = ExtractOptions::default().with_path_mapper(|path, _| {
            match path.strip_prefix("root/") {
                Some("drop.txt") | None => EntryAction::Skip,
                Some(rest) => EntryAction::Extract(format!("out/{rest}")),
            }
        });

        let mut seen = Vec::new();
        let summary = extract(Cursor::new(data), temp_dir.path(), &options, |entry, outcome| {
            seen.push((entry.path.clone(), outcome));
        })
        .unwrap();

        assert_eq!(summary.format, ArchiveFormat::Tar);
        assert_eq!(summary.applied, 2);
        assert_eq!(summary.skipped, 1);
        assert_eq!(
            seen,
            vec![
                ("root/keep.txt".to_owned(), EntryOutcome::Applied),
                ("root/drop.txt".to_owned(), EntryOutcome::Skipped),
                ("root/sub".to_owned(), EntryOutcome::Applied),
            ]
        );
        assert_eq!(
            std::fs::read_to_string(temp_dir.path().join("out/keep.txt")).unwrap(),
            "keep"
        );
        assert!(temp_dir.path().join("out/sub").is_dir());
        assert!(!temp_dir.path().join("out/drop.txt").exists());
    }

    #[test]
    fn test_traversal_fails_even_when_skipped() {
        let data = archive(&[("ok.txt", b"ok"), ("../../etc/passwd", b"root")]);
        let temp_dir = tempfile::tempdir().unwrap();
        let dest = temp_dir.path().join("dest");
        let options = ExtractOptions::default().with_path_mapper(|path, _| {
            if path == "ok.txt" {
                EntryAction::Extract(path.to_owned())
            } else {
                EntryAction::Skip
            }
        });

        let result = extract(Cursor::new(data), &dest, &options, |_, _| {});
        assert_matches!(result, Err(ArchiveError::PathTraversal(name)) if name == "../../etc/passwd");
        assert!(!temp_dir.path().join("etc").exists());
    }

    #[test]
    fn test_mapped_name_is_checked() {
        let data = archive(&[("harmless.txt", b"x")]);
        let temp_dir = tempfile::tempdir().unwrap();
        let options = ExtractOptions::default()
            .with_path_mapper(|_, _| EntryAction::Extract(String::from("../escaped.txt")));
        let result = extract(Cursor::new(data), &temp_dir.path().join("dest"), &options, |_, _| {});
        assert_matches!(result, Err(ArchiveError::PathTraversal(_)));
        assert!(!temp_dir.path().join("escaped.txt").exists());
    }

    #[test]
    fn test_cancelled_before_first_entry() {
        let data = archive(&[("a.txt", b"a")]);
        let temp_dir = tempfile::tempdir().unwrap();
        let cancellation = CancellationToken::new();
        cancellation.cancel();
        let options = ExtractOptions::default().with_cancellation(cancellation);
        let result = extract(Cursor::new(data), temp_dir.path(), &options, |_, _| {});
        assert_matches!(result, Err(ArchiveError::Cancelled));
        assert!(!temp_dir.path().join("a.txt").exists());
    }

    #[test]
    fn test_empty_stream_has_no_entries() {
        let temp_dir = tempfile::tempdir().unwrap();
        let summary = extract(
            Cursor::new(Vec::new()),
            temp_dir.path(),
            &ExtractOptions::default(),
            |_, _| {},
        )
        .unwrap();
        assert_eq!(summary.applied + summary.skipped, 0);
    }
}
