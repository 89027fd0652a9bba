//! Remote log stream reader
//!
//! Reads the same tab-separated line format from a `HOST:PORT` TCP stream
//! (e.g. a log forwarder on the storage node). Disconnects and refused
//! connections are retried forever with exponential backoff.

use super::backoff::Backoff;
use super::tail_reader::{take_complete_line, LineSource};
use async_trait::async_trait;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::Instant;

/// How long one `next_line` call waits for bytes before reporting idle
const READ_WAIT: Duration = Duration::from_millis(50);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const RECONNECT_INITIAL: Duration = Duration::from_secs(1);
const RECONNECT_MAX: Duration = Duration::from_secs(60);

pub struct TcpLineReader {
    host: String,
    port: u16,
    stream: Option<BufReader<TcpStream>>,
    pending: Vec<u8>,
    backoff: Backoff,
    retry_at: Option<Instant>,
}

impl TcpLineReader {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            stream: None,
            pending: Vec::new(),
            backoff: Backoff::new(RECONNECT_INITIAL, RECONNECT_MAX),
            retry_at: None,
        }
    }

    #[cfg(test)]
    fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    fn schedule_reconnect(&mut self) {
        self.stream = None;
        self.pending.clear();
        self.retry_at = Some(Instant::now() + self.backoff.next_delay());
    }

    async fn connect(&mut self) -> std::io::Result<()> {
        let addr = (self.host.as_str(), self.port);
        let stream = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(addr))
            .await
            .map_err(|_| std::io::Error::new(std::io::ErrorKind::TimedOut, "connect timed out"))??;

        self.stream = Some(BufReader::new(stream));
        self.pending.clear();
        self.retry_at = None;
        self.backoff.reset();
        log::info!("🔌 Connected to log stream {}", self.describe());
        Ok(())
    }
}

#[async_trait]
impl LineSource for TcpLineReader {
    async fn open(&mut self) -> std::io::Result<()> {
        if let Err(e) = self.connect().await {
            log::warn!("⚠️  Cannot connect to {}: {}", self.describe(), e);
            self.schedule_reconnect();
        }
        Ok(())
    }

    async fn next_line(&mut self) -> std::io::Result<Option<String>> {
        if self.stream.is_none() {
            if self.retry_at.map_or(false, |at| Instant::now() < at) {
                return Ok(None);
            }
            self.open().await?;
            if self.stream.is_none() {
                return Ok(None);
            }
        }

        let Some(stream) = self.stream.as_mut() else {
            return Ok(None);
        };

        // read_until keeps partially read bytes in `pending` if the wait expires
        let read = tokio::time::timeout(READ_WAIT, stream.read_until(b'\n', &mut self.pending)).await;
        match read {
            Err(_) => Ok(None),
            Ok(Ok(0)) => {
                log::warn!("⚠️  Log stream {} closed by peer", self.describe());
                self.schedule_reconnect();
                Ok(None)
            }
            Ok(Ok(_)) => Ok(take_complete_line(&mut self.pending)),
            Ok(Err(e)) => {
                log::warn!("⚠️  Read error on {}: {}", self.describe(), e);
                self.schedule_reconnect();
                Ok(None)
            }
        }
    }

    fn describe(&self) -> String {
        if self.host.contains(':') {
            format!("tcp://[{}]:{}", self.host, self.port)
        } else {
            format!("tcp://{}:{}", self.host, self.port)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener;

    async fn next(reader: &mut TcpLineReader) -> String {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if let Ok(Some(line)) = reader.next_line().await {
                    return line;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_reads_lines_and_reconnects() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let server = tokio::spawn(async move {
            let (mut first, _) = listener.accept().await.unwrap();
            first.write_all(b"one\r\ntw").await.unwrap();
            first.flush().await.unwrap();
            tokio::time::sleep(Duration::from_millis(100)).await;
            first.write_all(b"o\n").await.unwrap();
            drop(first);

            let (mut second, _) = listener.accept().await.unwrap();
            second.write_all(b"three\n").await.unwrap();
            second.flush().await.unwrap();
            tokio::time::sleep(Duration::from_millis(500)).await;
        });

        let mut reader = TcpLineReader::new("127.0.0.1", port)
            .with_backoff(Backoff::new(Duration::from_millis(10), Duration::from_millis(20)));
        reader.open().await.unwrap();

        assert_eq!(next(&mut reader).await, "one");
        assert_eq!(next(&mut reader).await, "two");
        assert_eq!(next(&mut reader).await, "three");

        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_refused_connection_is_not_fatal() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let mut reader = TcpLineReader::new("127.0.0.1", port);
        reader.open().await.unwrap();
        assert_eq!(reader.next_line().await.unwrap(), None);
    }

    #[test]
    fn test_describe_ipv6() {
        assert_eq!(TcpLineReader::new("::1", 7000).describe(), "tcp://[::1]:7000");
    }
}
