//! Merge stage: pull every shard under a prefix into one local gzip file.
//!
//! Shards are downloaded on the async side and handed over a bounded channel
//! to a blocking writer task. The writer owns the artifact: it streams each
//! shard through a multi-member gzip decoder into a single encoder, finishes
//! that encoder once after the last shard and syncs the file. Decompression
//! and disk I/O never run on a runtime worker. On any failure the partial
//! artifact is removed.

use bytes::Bytes;
use flate2::Compression;
use flate2::write::{GzEncoder, MultiGzDecoder};
use futures::StreamExt;
use futures::stream::BoxStream;
use object_store::path::Path as ObjectPath;
use snafu::prelude::*;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::emit;
use crate::error::{
    ArtifactWriteSnafu, ExportError, MergeCancelledSnafu, MergeError, ShardListSnafu,
    ShardReadSnafu, StorageError, WriterJoinSnafu,
};
use crate::metrics::events::{MergeDuration, ShardMerged};
use crate::storage::{StorageProviderRef, list_objects};

const WRITE_BUFFER_SIZE: usize = 256 * 1024;

/// Chunks in flight between the download loop and the writer.
const SHARD_CHANNEL_CAPACITY: usize = 16;

/// What a merge read and wrote.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergeStats {
    /// Objects found under the prefix, including empty ones.
    pub shards: usize,
    pub compressed_bytes: u64,
    pub decompressed_bytes: u64,
    /// Non-blank NDJSON lines written.
    pub records: u64,
    pub duration: Duration,
}

/// Sink for decompressed shard bytes. Counts records and remembers whether
/// the local write side failed, so decoder errors can be told apart from
/// disk errors.
struct ArtifactWriter<W> {
    inner: W,
    bytes: u64,
    records: u64,
    line_open: bool,
    failed: bool,
}

impl<W: Write> ArtifactWriter<W> {
    fn new(inner: W) -> Self {
        Self {
            inner,
            bytes: 0,
            records: 0,
            line_open: false,
            failed: false,
        }
    }

    /// Terminate a shard whose last line has no newline, so it does not run
    /// into the first line of the next shard.
    fn end_shard(&mut self) -> io::Result<()> {
        if self.line_open {
            self.write_all(b"\n")?;
        }
        Ok(())
    }
}

impl<W: Write> Write for ArtifactWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let written = self.inner.write(buf).inspect_err(|_| self.failed = true)?;
        for &byte in &buf[..written] {
            if byte == b'\n' {
                if self.line_open {
                    self.records += 1;
                }
                self.line_open = false;
            } else if !byte.is_ascii_whitespace() {
                self.line_open = true;
            }
        }
        self.bytes += written as u64;
        Ok(written)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush().inspect_err(|_| self.failed = true)
    }
}

type Artifact = ArtifactWriter<GzEncoder<BufWriter<File>>>;

/// Sent from the download loop to the artifact writer.
#[derive(Debug)]
enum ShardEvent {
    Begin(String),
    Chunk(Bytes),
    End,
}

/// Merges extracted shards into the local artifact.
#[derive(Debug, Clone)]
pub struct ShardMerger {
    storage: StorageProviderRef,
    compression: Compression,
}

impl ShardMerger {
    pub fn new(storage: StorageProviderRef, compression_level: u32) -> Self {
        Self {
            storage,
            compression: Compression::new(compression_level.min(9)),
        }
    }

    /// Merge every object under `prefix` into `artifact_path`.
    ///
    /// Shards are taken in list order. Empty objects are skipped.
    pub async fn merge(
        &self,
        prefix: &str,
        artifact_path: &Path,
        cancel: &CancellationToken,
    ) -> Result<MergeStats, ExportError> {
        let start = Instant::now();
        let result = self.merge_shards(prefix, artifact_path, cancel).await;
        emit!(MergeDuration {
            duration: start.elapsed(),
        });

        match result {
            Ok(mut stats) => {
                stats.duration = start.elapsed();
                info!(
                    "Merged {} shards ({} bytes compressed, {} bytes decompressed, {} records) into {}",
                    stats.shards,
                    stats.compressed_bytes,
                    stats.decompressed_bytes,
                    stats.records,
                    artifact_path.display()
                );
                Ok(stats)
            }
            Err(source) => {
                let path = artifact_path.to_path_buf();
                if let Err(e) = tokio::task::spawn_blocking(move || remove_partial(&path)).await {
                    warn!("Failed to remove partial artifact: {}", e);
                }
                Err(ExportError::ShardMerge {
                    prefix: prefix.to_string(),
                    source,
                })
            }
        }
    }

    async fn merge_shards(
        &self,
        prefix: &str,
        artifact_path: &Path,
        cancel: &CancellationToken,
    ) -> Result<MergeStats, MergeError> {
        let shards = tokio::select! {
            biased;
            _ = cancel.cancelled() => return MergeCancelledSnafu.fail(),
            result = list_objects(&self.storage, prefix) => result.context(ShardListSnafu)?,
        };
        debug!("Found {} shards under {}", shards.len(), prefix);

        let (events, receiver) = mpsc::channel(SHARD_CHANNEL_CAPACITY);
        let path = artifact_path.to_path_buf();
        let compression = self.compression;
        let writer =
            tokio::task::spawn_blocking(move || write_artifact(&path, compression, receiver));

        let sent = self.send_shards(&shards, &events, cancel).await;
        drop(events);
        let written = writer.await.context(WriterJoinSnafu)?;

        // A failed download or a cancellation explains a cut-short artifact
        // better than whatever the writer made of it
        sent?;
        let mut stats = written?;
        stats.shards = shards.len();
        Ok(stats)
    }

    /// Stream every shard to the writer. Returns early without error if the
    /// writer stops accepting input; its own result carries the reason.
    async fn send_shards(
        &self,
        shards: &[ObjectPath],
        events: &mpsc::Sender<ShardEvent>,
        cancel: &CancellationToken,
    ) -> Result<(), MergeError> {
        for shard in shards {
            let path = shard.to_string();
            let mut stream = tokio::select! {
                biased;
                _ = cancel.cancelled() => return MergeCancelledSnafu.fail(),
                result = self.storage.get_stream(shard) => {
                    result.context(ShardReadSnafu { path: path.as_str() })?
                }
            };

            if !send(events, ShardEvent::Begin(path.clone()), cancel).await? {
                return Ok(());
            }
            while let Some(chunk) = next_chunk(&mut stream, &path, cancel).await? {
                if !send(events, ShardEvent::Chunk(chunk), cancel).await? {
                    return Ok(());
                }
            }
            if !send(events, ShardEvent::End, cancel).await? {
                return Ok(());
            }
        }
        Ok(())
    }
}

/// Hand `event` to the writer. `false` once the writer has hung up.
async fn send(
    events: &mpsc::Sender<ShardEvent>,
    event: ShardEvent,
    cancel: &CancellationToken,
) -> Result<bool, MergeError> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => MergeCancelledSnafu.fail(),
        sent = events.send(event) => Ok(sent.is_ok()),
    }
}

/// Next non-empty chunk of a shard, or `None` at its end.
async fn next_chunk(
    stream: &mut BoxStream<'static, Result<Bytes, StorageError>>,
    path: &str,
    cancel: &CancellationToken,
) -> Result<Option<Bytes>, MergeError> {
    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => return MergeCancelledSnafu.fail(),
            next = stream.next() => next,
        };
        match next {
            Some(chunk) => {
                let chunk = chunk.context(ShardReadSnafu { path })?;
                if !chunk.is_empty() {
                    return Ok(Some(chunk));
                }
            }
            None => return Ok(None),
        }
    }
}

/// Blocking half of a merge: build the artifact from the events on
/// `events` until the sender is dropped, then finish and sync it.
fn write_artifact(
    artifact_path: &Path,
    compression: Compression,
    mut events: mpsc::Receiver<ShardEvent>,
) -> Result<MergeStats, MergeError> {
    if let Some(parent) = artifact_path.parent() {
        std::fs::create_dir_all(parent).context(ArtifactWriteSnafu {
            path: artifact_path,
        })?;
    }
    let file = File::create(artifact_path).context(ArtifactWriteSnafu {
        path: artifact_path,
    })?;
    let writer = BufWriter::with_capacity(WRITE_BUFFER_SIZE, file);
    let mut artifact = ArtifactWriter::new(GzEncoder::new(writer, compression));

    let mut compressed_bytes = 0;
    while let Some(event) = events.blocking_recv() {
        if let ShardEvent::Begin(shard) = event {
            compressed_bytes += write_shard(&mut artifact, &shard, &mut events, artifact_path)?;
        }
    }

    let stats = MergeStats {
        compressed_bytes,
        decompressed_bytes: artifact.bytes,
        records: artifact.records,
        ..Default::default()
    };

    let file = artifact
        .inner
        .finish()
        .and_then(|writer| writer.into_inner().map_err(|e| e.into_error()))
        .context(ArtifactWriteSnafu {
            path: artifact_path,
        })?;
    file.sync_all().context(ArtifactWriteSnafu {
        path: artifact_path,
    })?;

    Ok(stats)
}

/// Decode the chunks of one shard into the artifact. Returns the
/// compressed size.
fn write_shard(
    artifact: &mut Artifact,
    shard: &str,
    events: &mut mpsc::Receiver<ShardEvent>,
    artifact_path: &Path,
) -> Result<u64, MergeError> {
    let Some(first) = recv_chunk(events) else {
        debug!("Skipping empty shard {}", shard);
        return Ok(0);
    };
    let before = artifact.bytes;
    let mut compressed = first.len() as u64;

    let mut decoder = MultiGzDecoder::new(&mut *artifact);
    if let Err(source) = decoder.write_all(&first) {
        return Err(write_error(decoder.get_ref().failed, shard, artifact_path, source));
    }
    while let Some(chunk) = recv_chunk(events) {
        compressed += chunk.len() as u64;
        if let Err(source) = decoder.write_all(&chunk) {
            return Err(write_error(decoder.get_ref().failed, shard, artifact_path, source));
        }
    }
    if let Err(source) = decoder.try_finish() {
        return Err(write_error(decoder.get_ref().failed, shard, artifact_path, source));
    }
    drop(decoder);
    artifact.end_shard().context(ArtifactWriteSnafu {
        path: artifact_path,
    })?;

    let decompressed = artifact.bytes - before;
    debug!(
        "Merged shard {} ({} bytes compressed, {} bytes decompressed)",
        shard, compressed, decompressed
    );
    emit!(ShardMerged {
        compressed_bytes: compressed,
        decompressed_bytes: decompressed,
    });
    Ok(compressed)
}

/// Next chunk of the current shard; `None` at its end or once the sender
/// is gone.
fn recv_chunk(events: &mut mpsc::Receiver<ShardEvent>) -> Option<Bytes> {
    match events.blocking_recv()? {
        ShardEvent::Chunk(chunk) => Some(chunk),
        ShardEvent::Begin(_) | ShardEvent::End => None,
    }
}

/// Classify a failed decoder write: the decoder surfaces both malformed
/// input and errors from the artifact it writes into.
fn write_error(local: bool, shard: &str, artifact_path: &Path, source: io::Error) -> MergeError {
    if local {
        MergeError::ArtifactWrite {
            path: artifact_path.to_path_buf(),
            source,
        }
    } else {
        MergeError::Decompress {
            path: shard.to_string(),
            source,
        }
    }
}

fn remove_partial(path: &Path) {
    match std::fs::remove_file(path) {
        Ok(()) => debug!("Removed partial artifact {}", path.display()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => warn!("Failed to remove partial artifact {}: {}", path.display(), e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::StorageProvider;
    use flate2::read::MultiGzDecoder as ReadDecoder;
    use std::io::Read;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn gzip(text: &str) -> Vec<u8> {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(text.as_bytes()).unwrap();
        encoder.finish().unwrap()
    }

    fn read_artifact(path: &Path) -> String {
        let mut text = String::new();
        ReadDecoder::new(File::open(path).unwrap())
            .read_to_string(&mut text)
            .unwrap();
        text
    }

    async fn storage_with(shards: &[(&str, Vec<u8>)]) -> StorageProviderRef {
        let storage = Arc::new(StorageProvider::in_memory());
        for (path, bytes) in shards {
            storage
                .put(&ObjectPath::from(*path), bytes.clone())
                .await
                .unwrap();
        }
        storage
    }

    #[tokio::test]
    async fn test_every_shard_appears_once() {
        let storage = storage_with(&[
            ("m1/000000000000.json.gz", gzip("{\"id\":1}\n{\"id\":2}\n")),
            ("m1/000000000001.json.gz", gzip("{\"id\":3}\n")),
            ("m1/000000000002.json.gz", gzip("{\"id\":4}\n{\"id\":5}\n")),
        ])
        .await;
        let dir = TempDir::new().unwrap();
        let artifact = dir.path().join("m1.json.gz");

        let stats = ShardMerger::new(storage, 6)
            .merge("m1", &artifact, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(stats.shards, 3);
        assert_eq!(stats.records, 5);

        let text = read_artifact(&artifact);
        let mut ids: Vec<u64> = text
            .lines()
            .map(|line| {
                let value: serde_json::Value = serde_json::from_str(line).unwrap();
                value["id"].as_u64().unwrap()
            })
            .collect();
        ids.sort();
        assert_eq!(ids, vec![1, 2, 3, 4, 5]);
        assert_eq!(stats.decompressed_bytes, text.len() as u64);
    }

    #[tokio::test]
    async fn test_artifact_is_a_single_gzip_member() {
        let storage = storage_with(&[
            ("m2/a.json.gz", gzip("{\"id\":1}\n")),
            ("m2/b.json.gz", gzip("{\"id\":2}\n")),
        ])
        .await;
        let dir = TempDir::new().unwrap();
        let artifact = dir.path().join("m2.json.gz");

        ShardMerger::new(storage, 6)
            .merge("m2", &artifact, &CancellationToken::new())
            .await
            .unwrap();

        // A single-member decoder stops after the first member, so it only
        // sees everything if the encoder was finished exactly once.
        let mut text = String::new();
        flate2::read::GzDecoder::new(File::open(&artifact).unwrap())
            .read_to_string(&mut text)
            .unwrap();
        assert_eq!(text.lines().count(), 2);
    }

    #[tokio::test]
    async fn test_empty_and_multi_member_shards() {
        let mut multi = gzip("{\"id\":1}\n");
        multi.extend(gzip("{\"id\":2}"));
        let storage = storage_with(&[
            ("m3/0.json.gz", Vec::new()),
            ("m3/1.json.gz", multi),
            ("m3/2.json.gz", gzip("")),
            ("m3/3.json.gz", gzip("{\"id\":3}\n")),
        ])
        .await;
        let dir = TempDir::new().unwrap();
        let artifact = dir.path().join("m3.json.gz");

        let stats = ShardMerger::new(storage, 1)
            .merge("m3", &artifact, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(stats.shards, 4);
        assert_eq!(stats.records, 3);
        assert_eq!(read_artifact(&artifact).lines().count(), 3);
    }

    #[tokio::test]
    async fn test_no_shards_produces_empty_artifact() {
        let storage = storage_with(&[]).await;
        let dir = TempDir::new().unwrap();
        let artifact = dir.path().join("nested").join("m4.json.gz");

        let stats = ShardMerger::new(storage, 6)
            .merge("m4", &artifact, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(stats.shards, 0);
        assert_eq!(stats.records, 0);
        assert_eq!(read_artifact(&artifact), "");
    }

    #[tokio::test]
    async fn test_corrupt_shard_removes_partial_artifact() {
        let storage = storage_with(&[
            ("m5/0.json.gz", gzip("{\"id\":1}\n")),
            ("m5/1.json.gz", b"definitely not gzip".to_vec()),
        ])
        .await;
        let dir = TempDir::new().unwrap();
        let artifact = dir.path().join("m5.json.gz");

        let err = ShardMerger::new(storage, 6)
            .merge("m5", &artifact, &CancellationToken::new())
            .await
            .unwrap_err();

        match err {
            ExportError::ShardMerge { prefix, source } => {
                assert_eq!(prefix, "m5");
                assert!(matches!(source, MergeError::Decompress { .. }));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(!artifact.exists());
    }

    #[tokio::test]
    async fn test_cancelled_merge() {
        let storage = storage_with(&[("m6/0.json.gz", gzip("{\"id\":1}\n"))]).await;
        let dir = TempDir::new().unwrap();
        let artifact = dir.path().join("m6.json.gz");
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = ShardMerger::new(storage, 6)
            .merge("m6", &artifact, &cancel)
            .await
            .unwrap_err();

        assert!(err.is_cancelled());
        assert!(!artifact.exists());
    }

    #[test]
    fn test_writer_counts_non_blank_lines() {
        let mut writer = ArtifactWriter::new(Vec::new());
        writer.write_all(b"{\"a\":1}\n\n  \n{\"a\"").unwrap();
        writer.write_all(b":2}").unwrap();
        writer.end_shard().unwrap();

        assert_eq!(writer.records, 2);
        assert_eq!(writer.inner, b"{\"a\":1}\n\n  \n{\"a\":2}\n");
    }

    #[tokio::test]
    async fn test_unwritable_artifact_is_a_local_error() {
        let storage = storage_with(&[("m7/0.json.gz", gzip("{\"id\":1}\n"))]).await;
        let dir = TempDir::new().unwrap();
        let blocker = dir.path().join("not-a-dir");
        std::fs::write(&blocker, b"").unwrap();
        let artifact = blocker.join("m7.json.gz");

        let err = ShardMerger::new(storage, 6)
            .merge("m7", &artifact, &CancellationToken::new())
            .await
            .unwrap_err();

        match err {
            ExportError::ShardMerge { source, .. } => {
                assert!(matches!(source, MergeError::ArtifactWrite { .. }));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_large_merge_leaves_runtime_responsive() {
        let rows: String = (0..200_000)
            .map(|i| format!("{{\"id\":{i},\"name\":\"row-{i}\"}}\n"))
            .collect();
        let storage = storage_with(&[("m8/0.json.gz", gzip(&rows))]).await;
        let dir = TempDir::new().unwrap();
        let artifact = dir.path().join("m8.json.gz");

        // Default test runtime is single threaded, so the ticker only runs
        // while the merge is parked on an await
        let ticks = Arc::new(std::sync::atomic::AtomicU64::new(0));
        let ticker = {
            let ticks = ticks.clone();
            tokio::spawn(async move {
                loop {
                    tokio::time::sleep(Duration::from_millis(1)).await;
                    ticks.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                }
            })
        };

        let stats = ShardMerger::new(storage, 6)
            .merge("m8", &artifact, &CancellationToken::new())
            .await
            .unwrap();
        ticker.abort();

        assert_eq!(stats.records, 200_000);
        assert!(ticks.load(std::sync::atomic::Ordering::Relaxed) > 0);
    }
}
