//! Sender side of the chunk transfer protocol.
//!
//! Files go out strictly one after another: meta, then every chunk in
//! index order, then — once the channel has fully drained — the
//! completion marker. Backpressure is applied per chunk against the
//! channel's buffered byte count so sender memory stays bounded and a
//! slow receiver is never flooded.

use std::path::PathBuf;

use anyhow::{anyhow, Result};
use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncSeekExt, SeekFrom};
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::config::{BACKPRESSURE_POLL_INTERVAL, BUFFERED_AMOUNT_HIGH, CHUNK_SIZE};

use super::{
    encode_chunk_frame_into, notify_app, total_chunks, TransferChannel, TransferControl,
    TransferEvent, CHUNK_HEADER_LEN,
};

// ── Configuration ────────────────────────────────────────────────────────────

/// Tunables for one `send_files` run.
#[derive(Debug, Clone)]
pub struct SenderConfig {
    /// Maximum payload bytes per chunk.
    pub chunk_size: usize,
    /// Buffered-byte threshold above which sending pauses.
    pub high_water_mark: usize,
    /// Cadence at which the buffered amount is re-checked while paused.
    pub poll_interval: std::time::Duration,
}

impl Default for SenderConfig {
    fn default() -> Self {
        Self {
            chunk_size: CHUNK_SIZE,
            high_water_mark: BUFFERED_AMOUNT_HIGH,
            poll_interval: BACKPRESSURE_POLL_INTERVAL,
        }
    }
}

// ── File sources ─────────────────────────────────────────────────────────────

/// One file queued for sending.
#[derive(Debug, Clone)]
pub struct OutgoingFile {
    pub name: String,
    pub size: u64,
    source: FileSource,
}

#[derive(Debug, Clone)]
enum FileSource {
    Path(PathBuf),
    Bytes(Bytes),
}

impl OutgoingFile {
    /// A file whose content is already in memory.
    pub fn from_bytes(name: impl Into<String>, data: impl Into<Bytes>) -> Self {
        let data = data.into();
        Self {
            name: name.into(),
            size: data.len() as u64,
            source: FileSource::Bytes(data),
        }
    }

    /// A file read from disk chunk by chunk at send time.
    pub async fn from_path(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let meta = tokio::fs::metadata(&path).await?;
        let name = path
            .file_name()
            .ok_or_else(|| anyhow!("path has no file name: {}", path.display()))?
            .to_string_lossy()
            .into_owned();
        Ok(Self {
            name,
            size: meta.len(),
            source: FileSource::Path(path),
        })
    }
}

// ── Public API ───────────────────────────────────────────────────────────────

/// Send every file in `files`, serially, over `channel`.
///
/// Resolves once the last file has been fully drained and its completion
/// marker sent. Any channel error aborts the whole batch: a partially
/// delivered transfer is not resumable, the caller must start over on a
/// fresh session.
pub async fn send_files(
    channel: &dyn TransferChannel,
    files: &[OutgoingFile],
    config: &SenderConfig,
    events: Option<mpsc::UnboundedSender<TransferEvent>>,
) -> Result<()> {
    for file in files {
        send_file(channel, file, config, &events).await?;
    }
    Ok(())
}

async fn send_file(
    channel: &dyn TransferChannel,
    file: &OutgoingFile,
    config: &SenderConfig,
    events: &Option<mpsc::UnboundedSender<TransferEvent>>,
) -> Result<()> {
    let total = total_chunks(file.size, config.chunk_size);

    let meta = TransferControl::Meta {
        name: file.name.clone(),
        size: file.size,
        total_chunks: total,
    };
    channel.send_text(serde_json::to_string(&meta)?).await?;

    info!(
        event = "file_send_start",
        name = %file.name,
        size = file.size,
        total_chunks = total,
        "Starting file send"
    );

    let mut disk = match &file.source {
        FileSource::Path(path) => Some(tokio::fs::File::open(path).await?),
        FileSource::Bytes(_) => None,
    };
    let mut frame_buf = Vec::with_capacity(CHUNK_HEADER_LEN + config.chunk_size);

    for index in 0..total {
        let payload = read_chunk(file, disk.as_mut(), index, config.chunk_size).await?;
        encode_chunk_frame_into(&mut frame_buf, index, total, &payload);

        wait_for_buffer_space(channel, frame_buf.len(), config).await?;
        channel
            .send_binary(Bytes::copy_from_slice(&frame_buf))
            .await?;

        notify_app(
            events,
            TransferEvent::SendProgress {
                name: file.name.clone(),
                sent_chunks: index + 1,
                total_chunks: total,
            },
        );
    }

    // Every chunk must have left our buffer before the receiver can be
    // told the file is complete.
    wait_for_drain(channel, config).await?;

    let done = TransferControl::IsCompleted {
        name: file.name.clone(),
    };
    channel.send_text(serde_json::to_string(&done)?).await?;

    info!(event = "file_send_complete", name = %file.name, "File fully sent and drained");
    notify_app(
        events,
        TransferEvent::SendComplete {
            name: file.name.clone(),
        },
    );
    Ok(())
}

// ── Backpressure ─────────────────────────────────────────────────────────────

/// Block until the channel can take `next_len` more bytes without
/// crossing the high water mark. Errors out if the channel closes while
/// waiting.
async fn wait_for_buffer_space(
    channel: &dyn TransferChannel,
    next_len: usize,
    config: &SenderConfig,
) -> Result<()> {
    if !channel.is_open() {
        return Err(anyhow!("channel '{}' is not open", channel.label()));
    }
    let buffered = channel.buffered_amount().await;
    if buffered + next_len <= config.high_water_mark {
        return Ok(());
    }

    debug!(
        event = "backpressure_pause",
        channel = %channel.label(),
        buffered,
        high_water_mark = config.high_water_mark,
        "Send buffer above high water mark, pausing"
    );

    loop {
        tokio::time::sleep(config.poll_interval).await;
        if !channel.is_open() {
            return Err(anyhow!(
                "channel '{}' closed during backpressure wait",
                channel.label()
            ));
        }
        if channel.buffered_amount().await + next_len <= config.high_water_mark {
            return Ok(());
        }
    }
}

/// Block until the channel's buffered amount reaches zero.
async fn wait_for_drain(channel: &dyn TransferChannel, config: &SenderConfig) -> Result<()> {
    loop {
        if !channel.is_open() {
            return Err(anyhow!(
                "channel '{}' closed before draining",
                channel.label()
            ));
        }
        if channel.buffered_amount().await == 0 {
            return Ok(());
        }
        tokio::time::sleep(config.poll_interval).await;
    }
}

// ── Chunk reads ──────────────────────────────────────────────────────────────

async fn read_chunk(
    file: &OutgoingFile,
    disk: Option<&mut tokio::fs::File>,
    index: u32,
    chunk_size: usize,
) -> Result<Vec<u8>> {
    let offset = index as u64 * chunk_size as u64;
    let len = (chunk_size as u64).min(file.size.saturating_sub(offset)) as usize;
    match (&file.source, disk) {
        (FileSource::Bytes(data), _) => {
            let start = offset as usize;
            Ok(data[start..start + len].to_vec())
        }
        (FileSource::Path(_), Some(f)) => {
            f.seek(SeekFrom::Start(offset)).await?;
            let mut buf = vec![0u8; len];
            f.read_exact(&mut buf).await?;
            Ok(buf)
        }
        (FileSource::Path(path), None) => Err(anyhow!("no handle for {}", path.display())),
    }
}

// ── Tests ────────────────────────────────────────────────────────────────────
