//! Per-source side file for rejected lines
//!
//! `<dir>/unprocessed-<source>.log`, one raw line per line. The source name
//! is reduced to `[A-Za-z0-9._-]` with everything else replaced by `_`.

use std::path::PathBuf;
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;

pub fn sanitize_source_name(source: &str) -> String {
    let sanitized: String = source
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect();

    // Never let a name like ".." resolve outside the directory
    if sanitized.is_empty() || sanitized.chars().all(|c| c == '.') {
        "unnamed".to_string()
    } else {
        sanitized
    }
}

#[derive(Debug, Clone)]
pub struct UnprocessedSink {
    dir: PathBuf,
}

impl UnprocessedSink {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn path_for(&self, source: &str) -> PathBuf {
        self.dir
            .join(format!("unprocessed-{}.log", sanitize_source_name(source)))
    }

    /// Append `line` (newline-terminated); the directory is created on demand
    pub async fn record(&self, source: &str, line: &str) -> std::io::Result<()> {
        tokio::fs::create_dir_all(&self.dir).await?;

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.path_for(source))
            .await?;

        let mut data = line.trim_end_matches(['\n', '\r']).as_bytes().to_vec();
        data.push(b'\n');
        file.write_all(&data).await?;
        file.flush().await
    }
}
