//! # Log ingestion
//!
//! Turns storage-node log lines into typed rows:
//!
//! - `line_parser` - raw line → `ParsedLine` or `ParseError`
//! - `classifier` - ignore rules and per-event extractors
//! - `tail_reader` / `tcp_reader` - `LineSource` implementations
//! - `unprocessed` - per-source file for rejected lines
//! - `watcher` - the per-source task that ties the above to an `IngestSink`

pub mod backoff;
pub mod classifier;
pub mod line_parser;
pub mod tail_reader;
pub mod tcp_reader;
pub mod unprocessed;
pub mod watcher;

pub use classifier::{classify, process_line, Classification, ClassifiedRecord, RejectReason};
pub use line_parser::{parse_line, ParseError, ParsedLine};
pub use tail_reader::{LineSource, TailReader};
pub use tcp_reader::TcpLineReader;
pub use unprocessed::UnprocessedSink;
pub use watcher::{build_line_source, SourceWatcher, WatcherSettings, WatcherStats};
