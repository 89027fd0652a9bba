//! Log file tail reader with rotation and truncation detection

use async_trait::async_trait;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncSeekExt, BufReader};

#[cfg(unix)]
use std::os::unix::fs::MetadataExt;

/// A line-oriented input the watcher can follow
#[async_trait]
pub trait LineSource: Send {
    /// (Re)open the source; a fresh open starts at the current end
    async fn open(&mut self) -> std::io::Result<()>;

    /// Next complete line without its terminator, or `None` if nothing
    /// complete is available right now
    async fn next_line(&mut self) -> std::io::Result<Option<String>>;

    fn describe(&self) -> String;
}

/// Take one complete line out of `pending`, normalising `\r\n`
///
/// Returns `None` and leaves `pending` untouched while the line is partial.
pub(crate) fn take_complete_line(pending: &mut Vec<u8>) -> Option<String> {
    if pending.last() != Some(&b'\n') {
        return None;
    }
    let mut bytes = std::mem::take(pending);
    bytes.pop();
    if bytes.last() == Some(&b'\r') {
        bytes.pop();
    }
    Some(String::from_utf8_lossy(&bytes).into_owned())
}

/// Identity of the file behind a path
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FileSignature {
    dev: u64,
    ino: u64,
}

impl FileSignature {
    #[cfg(unix)]
    fn of(metadata: &std::fs::Metadata) -> Option<Self> {
        Some(Self {
            dev: metadata.dev(),
            ino: metadata.ino(),
        })
    }

    #[cfg(not(unix))]
    fn of(_metadata: &std::fs::Metadata) -> Option<Self> {
        None
    }
}

/// Size and mtime of the path at the last check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct StatSnapshot {
    len: u64,
    modified: Option<SystemTime>,
}

impl StatSnapshot {
    fn of(metadata: &std::fs::Metadata) -> Self {
        Self {
            len: metadata.len(),
            modified: metadata.modified().ok(),
        }
    }
}

/// Bytes of the file start kept to recognise an in-place rewrite
const HEAD_FINGERPRINT_LEN: u64 = 64;

async fn read_head(path: &Path) -> std::io::Result<Vec<u8>> {
    let file = File::open(path).await?;
    let mut head = Vec::with_capacity(HEAD_FINGERPRINT_LEN as usize);
    file.take(HEAD_FINGERPRINT_LEN).read_to_end(&mut head).await?;
    Ok(head)
}

pub struct TailReader {
    path: PathBuf,
    file: Option<BufReader<File>>,
    signature: Option<FileSignature>,
    snapshot: Option<StatSnapshot>,
    /// First bytes of the open file; grows until it reaches the fingerprint length
    head: Vec<u8>,
    /// Bytes consumed from the open handle
    position: u64,
    pending: Vec<u8>,
    /// The previous read hit the end of the file
    at_eof: bool,
}

impl TailReader {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            file: None,
            signature: None,
            snapshot: None,
            head: Vec::new(),
            position: 0,
            pending: Vec::new(),
            at_eof: false,
        }
    }

    async fn open_at(&mut self, seek_to_end: bool) -> std::io::Result<()> {
        let file = File::open(&self.path).await?;
        let metadata = file.metadata().await?;
        self.signature = FileSignature::of(&metadata);
        self.snapshot = Some(StatSnapshot::of(&metadata));
        self.head = read_head(&self.path).await?;

        let mut reader = BufReader::new(file);
        self.position = if seek_to_end {
            reader.seek(SeekFrom::End(0)).await?
        } else {
            0
        };
        self.file = Some(reader);
        self.pending.clear();
        self.at_eof = false;
        Ok(())
    }

    /// Has the path been replaced, truncated or rewritten since we opened it?
    async fn detect_rotation(&mut self) -> std::io::Result<bool> {
        let metadata = match tokio::fs::metadata(&self.path).await {
            Ok(metadata) => metadata,
            // Rotated away and not recreated yet; keep draining the old handle
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(e),
        };

        let replaced = match (self.signature, FileSignature::of(&metadata)) {
            (Some(opened), Some(current)) => opened != current,
            _ => false,
        };
        if replaced || self.position > metadata.len() {
            return Ok(true);
        }

        let current = StatSnapshot::of(&metadata);
        if self.snapshot == Some(current) {
            return Ok(false);
        }
        self.snapshot = Some(current);

        // Same inode and at least as long: only the head tells a rewrite from an append
        let head = match read_head(&self.path).await {
            Ok(head) => head,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(e),
        };
        if !head.starts_with(&self.head) {
            return Ok(true);
        }
        self.head = head;
        Ok(false)
    }
}

#[async_trait]
impl LineSource for TailReader {
    /// Start tailing the file (seeks to end)
    async fn open(&mut self) -> std::io::Result<()> {
        self.open_at(true).await?;
        log::info!("📖 Started tailing: {}", self.path.display());
        Ok(())
    }

    async fn next_line(&mut self) -> std::io::Result<Option<String>> {
        if self.file.is_none() {
            return Err(std::io::Error::new(std::io::ErrorKind::NotFound, "File not opened"));
        }

        // Only check between reads that found nothing new, so no buffered line is lost
        if self.at_eof && self.detect_rotation().await? {
            log::info!("🔄 File rotation detected, reopening from start: {}", self.path.display());
            self.open_at(false).await?;
        }

        let Some(reader) = self.file.as_mut() else {
            return Err(std::io::Error::new(std::io::ErrorKind::NotFound, "File not opened"));
        };

        let read = reader.read_until(b'\n', &mut self.pending).await?;
        self.position += read as u64;
        if let Some(line) = take_complete_line(&mut self.pending) {
            self.at_eof = false;
            return Ok(Some(line));
        }

        self.at_eof = true;
        Ok(None)
    }

    fn describe(&self) -> String {
        self.path.display().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::AsyncWriteExt;

    async fn append(path: &std::path::Path, data: &[u8]) {
        let mut file = tokio::fs::OpenOptions::new()
            .append(true)
            .create(true)
            .open(path)
            .await
            .unwrap();
        file.write_all(data).await.unwrap();
        file.flush().await.unwrap();
    }

    /// Poll until a line shows up
    async fn next(reader: &mut TailReader) -> String {
        tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                if let Some(line) = reader.next_line().await.unwrap() {
                    return line;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap()
    }

    #[test]
    fn test_take_complete_line() {
        let mut pending = b"partial".to_vec();
        assert_eq!(take_complete_line(&mut pending), None);
        assert_eq!(pending, b"partial");

        pending.extend_from_slice(b" line\r\n");
        assert_eq!(take_complete_line(&mut pending).as_deref(), Some("partial line"));
        assert!(pending.is_empty());
    }

    #[tokio::test]
    async fn test_tail_reader_skips_existing_content() {
        let temp_dir = tempfile::tempdir().unwrap();
        let file_path = temp_dir.path().join("node.log");
        append(&file_path, b"line1\nline2\n").await;

        let mut reader = TailReader::new(file_path.clone());
        reader.open().await.unwrap();
        assert_eq!(reader.next_line().await.unwrap(), None);

        append(&file_path, b"line3\n").await;
        assert_eq!(next(&mut reader).await, "line3");
    }

    #[tokio::test]
    async fn test_partial_line_held_until_complete() {
        let temp_dir = tempfile::tempdir().unwrap();
        let file_path = temp_dir.path().join("node.log");
        append(&file_path, b"").await;

        let mut reader = TailReader::new(file_path.clone());
        reader.open().await.unwrap();

        append(&file_path, b"half").await;
        assert_eq!(reader.next_line().await.unwrap(), None);

        append(&file_path, b" done\n").await;
        assert_eq!(next(&mut reader).await, "half done");
    }

    #[tokio::test]
    async fn test_rotation_reads_new_file_from_start() {
        let temp_dir = tempfile::tempdir().unwrap();
        let file_path = temp_dir.path().join("node.log");
        append(&file_path, b"old content that is fairly long\n").await;

        let mut reader = TailReader::new(file_path.clone());
        reader.open().await.unwrap();

        let rotated = temp_dir.path().join("node.log.new");
        append(&rotated, b"fresh\n").await;
        tokio::fs::rename(&rotated, &file_path).await.unwrap();

        assert_eq!(next(&mut reader).await, "fresh");
    }

    #[tokio::test]
    async fn test_truncation_reads_from_start() {
        let temp_dir = tempfile::tempdir().unwrap();
        let file_path = temp_dir.path().join("node.log");
        append(&file_path, b"a long line that will be truncated away\n").await;

        let mut reader = TailReader::new(file_path.clone());
        reader.open().await.unwrap();

        tokio::fs::write(&file_path, b"short\n").await.unwrap();
        assert_eq!(next(&mut reader).await, "short");
    }

    #[tokio::test]
    async fn test_in_place_rewrite_past_old_position_reads_from_start() {
        let temp_dir = tempfile::tempdir().unwrap();
        let file_path = temp_dir.path().join("node.log");
        append(&file_path, b"aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa\n").await;

        let mut reader = TailReader::new(file_path.clone());
        reader.open().await.unwrap();
        assert_eq!(reader.next_line().await.unwrap(), None);

        // copytruncate-style: same inode, regrown beyond the old read position
        let mut file = tokio::fs::OpenOptions::new()
            .write(true)
            .truncate(true)
            .open(&file_path)
            .await
            .unwrap();
        file.write_all(b"first rewritten line\nsecond rewritten line, a bit longer\n")
            .await
            .unwrap();
        file.flush().await.unwrap();
        drop(file);

        assert_eq!(next(&mut reader).await, "first rewritten line");
        assert_eq!(next(&mut reader).await, "second rewritten line, a bit longer");
    }

    #[tokio::test]
    async fn test_appends_after_idle_are_not_mistaken_for_rewrite() {
        let temp_dir = tempfile::tempdir().unwrap();
        let file_path = temp_dir.path().join("node.log");
        append(&file_path, b"").await;

        let mut reader = TailReader::new(file_path.clone());
        reader.open().await.unwrap();
        assert_eq!(reader.next_line().await.unwrap(), None);

        append(&file_path, b"one\n").await;
        assert_eq!(next(&mut reader).await, "one");
        assert_eq!(reader.next_line().await.unwrap(), None);

        append(&file_path, b"two\n").await;
        assert_eq!(next(&mut reader).await, "two");
    }

    #[tokio::test]
    async fn test_missing_file_errors() {
        let temp_dir = tempfile::tempdir().unwrap();
        let mut reader = TailReader::new(temp_dir.path().join("absent.log"));
        let err = reader.open().await.unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::NotFound);
    }
}
