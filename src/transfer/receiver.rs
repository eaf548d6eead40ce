//! Receiver side of the chunk transfer protocol.
//!
//! Incoming messages are dispatched by kind: text frames carry control
//! JSON, binary frames carry chunks. Reassembly is slot-based and
//! order-tolerant; a file completes only once every slot is filled AND
//! the explicit completion marker has arrived, in either order.
//!
//! Chunks carry no file name. They are matched to an announced transfer
//! by comparing the header's total-chunk count against each incomplete
//! descriptor, oldest first. With strictly serial senders at most one
//! transfer is ever incomplete, so the match is unambiguous in practice;
//! two simultaneously incomplete files that happen to share a chunk
//! count would collide, which is an accepted limit of the wire format.

use anyhow::Result;
use bytes::{Bytes, BytesMut};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::{decode_chunk_frame, notify_app, TransferControl, TransferEvent};

// ── Reassembly state ─────────────────────────────────────────────────────────

/// Reassembly state for one announced file.
#[derive(Debug)]
pub struct TransferDescriptor {
    pub name: String,
    pub size: u64,
    pub total_chunks: u32,
    chunks: Vec<Option<Bytes>>,
    received_size: u64,
    marker_received: bool,
    completed: bool,
}

impl TransferDescriptor {
    fn new(name: String, size: u64, total_chunks: u32) -> Self {
        Self {
            name,
            size,
            total_chunks,
            chunks: vec![None; total_chunks as usize],
            received_size: 0,
            marker_received: false,
            completed: false,
        }
    }

    pub fn received_size(&self) -> u64 {
        self.received_size
    }

    pub fn is_completed(&self) -> bool {
        self.completed
    }

    fn all_slots_filled(&self) -> bool {
        self.chunks.iter().all(Option::is_some)
    }

    /// Concatenate the slots into the final byte sequence.
    fn assemble(&mut self) -> Bytes {
        let mut out = BytesMut::with_capacity(self.size as usize);
        for slot in self.chunks.iter_mut() {
            if let Some(chunk) = slot.take() {
                out.extend_from_slice(&chunk);
            }
        }
        out.freeze()
    }
}

// ── Receiver ─────────────────────────────────────────────────────────────────

/// All in-flight and finished transfers on one data channel.
///
/// Not thread-safe by itself; the owning session task feeds it channel
/// messages one at a time.
#[derive(Default)]
pub struct IncomingFiles {
    transfers: Vec<TransferDescriptor>,
    events: Option<mpsc::UnboundedSender<TransferEvent>>,
}

impl IncomingFiles {
    pub fn new(events: Option<mpsc::UnboundedSender<TransferEvent>>) -> Self {
        Self {
            transfers: Vec::new(),
            events,
        }
    }

    /// Handle a text frame from the channel (control JSON).
    ///
    /// Unparseable text is logged and dropped; a malformed peer must not
    /// tear down the session.
    pub fn handle_text(&mut self, text: &str) -> Result<()> {
        let control: TransferControl = match serde_json::from_str(text) {
            Ok(control) => control,
            Err(error) => {
                warn!(event = "control_message_invalid", %error, "Dropping unparseable control message");
                return Ok(());
            }
        };
        match control {
            TransferControl::Meta {
                name,
                size,
                total_chunks,
            } => self.on_meta(name, size, total_chunks),
            TransferControl::IsCompleted { name } => self.on_completed_marker(&name),
        }
        Ok(())
    }

    /// Handle a binary frame from the channel (one chunk).
    pub fn handle_binary(&mut self, data: &[u8]) -> Result<()> {
        let Some(frame) = decode_chunk_frame(data) else {
            warn!(
                event = "chunk_frame_short",
                len = data.len(),
                "Dropping binary frame shorter than the chunk header"
            );
            return Ok(());
        };

        // Oldest incomplete transfer with a matching chunk count.
        let Some(transfer) = self
            .transfers
            .iter_mut()
            .find(|t| !t.completed && t.total_chunks == frame.total_chunks)
        else {
            warn!(
                event = "chunk_unmatched",
                index = frame.index,
                total_chunks = frame.total_chunks,
                "Dropping chunk with no matching announced transfer"
            );
            return Ok(());
        };

        let index = frame.index as usize;
        if index >= transfer.chunks.len() {
            warn!(
                event = "chunk_index_out_of_range",
                index,
                total_chunks = transfer.total_chunks,
                name = %transfer.name,
                "Dropping chunk with out-of-range index"
            );
            return Ok(());
        }
        if transfer.chunks[index].is_some() {
            warn!(
                event = "chunk_duplicate",
                index,
                name = %transfer.name,
                "Dropping duplicate chunk for an already filled slot"
            );
            return Ok(());
        }

        transfer.received_size += frame.payload.len() as u64;
        transfer.chunks[index] = Some(Bytes::copy_from_slice(frame.payload));
        debug!(
            event = "chunk_stored",
            index,
            name = %transfer.name,
            received_size = transfer.received_size,
            size = transfer.size,
        );

        let progress = TransferEvent::Progress {
            name: transfer.name.clone(),
            received_size: transfer.received_size,
            size: transfer.size,
        };
        notify_app(&self.events, progress);

        self.try_finish_marked();
        Ok(())
    }

    /// Discard every transfer, finished or not (session teardown; a
    /// partial file is never exposed to the application).
    pub fn reset(&mut self) {
        if !self.transfers.is_empty() {
            info!(
                event = "incoming_files_reset",
                dropped = self.transfers.len(),
                "Discarding incoming transfer state"
            );
        }
        self.transfers.clear();
    }

    pub fn transfers(&self) -> &[TransferDescriptor] {
        &self.transfers
    }

    fn on_meta(&mut self, name: String, size: u64, total_chunks: u32) {
        info!(
            event = "file_receive_start",
            name = %name,
            size,
            total_chunks,
            "Incoming file announced"
        );
        let started = TransferEvent::Started {
            name: name.clone(),
            size,
            total_chunks,
        };
        self.transfers
            .push(TransferDescriptor::new(name, size, total_chunks));
        notify_app(&self.events, started);
    }

    fn on_completed_marker(&mut self, name: &str) {
        let Some(transfer) = self
            .transfers
            .iter_mut()
            .find(|t| !t.completed && t.name == name)
        else {
            warn!(
                event = "completion_marker_unmatched",
                name,
                "Dropping completion marker with no in-flight transfer"
            );
            return;
        };
        transfer.marker_received = true;
        self.try_finish_marked();
    }

    /// Complete every transfer whose marker arrived and whose slots are
    /// all filled. Called after both chunk and marker arrival so the two
    /// can land in either order.
    fn try_finish_marked(&mut self) {
        for transfer in self.transfers.iter_mut() {
            if transfer.completed || !transfer.marker_received || !transfer.all_slots_filled() {
                continue;
            }
            transfer.completed = true;
            let data = transfer.assemble();
            info!(
                event = "file_receive_complete",
                name = %transfer.name,
                size = data.len(),
                "File reassembled"
            );
            let completed = TransferEvent::Completed {
                name: transfer.name.clone(),
                data,
            };
            notify_app(&self.events, completed);
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transfer::encode_chunk_frame_into;

    fn meta(name: &str, size: u64, total_chunks: u32) -> String {
        serde_json::to_string(&TransferControl::Meta {
            name: name.into(),
            size,
            total_chunks,
        })
        .unwrap()
    }

    fn marker(name: &str) -> String {
        serde_json::to_string(&TransferControl::IsCompleted { name: name.into() }).unwrap()
    }

    fn chunk(index: u32, total_chunks: u32, payload: &[u8]) -> Vec<u8> {
        let mut buf = Vec::new();
        encode_chunk_frame_into(&mut buf, index, total_chunks, payload);
        buf
    }

    fn receiver_with_events() -> (IncomingFiles, mpsc::UnboundedReceiver<TransferEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (IncomingFiles::new(Some(tx)), rx)
    }

    #[tokio::test]
    async fn reassembles_in_order_delivery() {
        let (mut rx, mut events) = receiver_with_events();

        rx.handle_text(&meta("a.bin", 10, 3)).unwrap();
        rx.handle_binary(&chunk(0, 3, &[1, 2, 3, 4])).unwrap();
        rx.handle_binary(&chunk(1, 3, &[5, 6, 7, 8])).unwrap();
        rx.handle_binary(&chunk(2, 3, &[9, 10])).unwrap();
        rx.handle_text(&marker("a.bin")).unwrap();

        let mut completed = None;
        while let Ok(ev) = events.try_recv() {
            if let TransferEvent::Completed { name, data } = ev {
                completed = Some((name, data));
            }
        }
        let (name, data) = completed.expect("file should complete");
        assert_eq!(name, "a.bin");
        assert_eq!(&data[..], &[1, 2, 3, 4, 5, 6, 7, 8, 9, 10]);
    }

    #[tokio::test]
    async fn marker_before_last_chunk_still_completes() {
        let (mut rx, mut events) = receiver_with_events();

        rx.handle_text(&meta("a.bin", 8, 2)).unwrap();
        rx.handle_binary(&chunk(1, 2, &[5, 6, 7, 8])).unwrap();
        rx.handle_text(&marker("a.bin")).unwrap();
        assert!(!rx.transfers()[0].is_completed());

        rx.handle_binary(&chunk(0, 2, &[1, 2, 3, 4])).unwrap();
        assert!(rx.transfers()[0].is_completed());

        let mut saw_completed = false;
        while let Ok(ev) = events.try_recv() {
            if let TransferEvent::Completed { data, .. } = ev {
                assert_eq!(&data[..], &[1, 2, 3, 4, 5, 6, 7, 8]);
                saw_completed = true;
            }
        }
        assert!(saw_completed);
    }

    #[tokio::test]
    async fn all_chunks_without_marker_stays_incomplete() {
        let (mut rx, _events) = receiver_with_events();

        rx.handle_text(&meta("a.bin", 4, 1)).unwrap();
        rx.handle_binary(&chunk(0, 1, &[1, 2, 3, 4])).unwrap();
        assert!(!rx.transfers()[0].is_completed());

        rx.handle_text(&marker("a.bin")).unwrap();
        assert!(rx.transfers()[0].is_completed());
    }

    #[tokio::test]
    async fn chunks_match_by_total_count_not_arrival_file() {
        let (mut rx, _events) = receiver_with_events();

        // Two announced files with different chunk counts; the chunk
        // header routes to the right one regardless of announce order.
        rx.handle_text(&meta("a.bin", 10, 3)).unwrap();
        rx.handle_text(&meta("b.bin", 5, 2)).unwrap();

        rx.handle_binary(&chunk(0, 2, &[9, 9, 9, 9])).unwrap();
        assert_eq!(rx.transfers()[0].received_size(), 0);
        assert_eq!(rx.transfers()[1].received_size(), 4);
    }

    #[tokio::test]
    async fn duplicate_chunk_is_dropped() {
        let (mut rx, _events) = receiver_with_events();

        rx.handle_text(&meta("a.bin", 8, 2)).unwrap();
        rx.handle_binary(&chunk(0, 2, &[1, 2, 3, 4])).unwrap();
        rx.handle_binary(&chunk(0, 2, &[9, 9, 9, 9])).unwrap();

        assert_eq!(rx.transfers()[0].received_size(), 4);
    }

    #[tokio::test]
    async fn out_of_range_and_unmatched_chunks_are_dropped() {
        let (mut rx, _events) = receiver_with_events();

        rx.handle_text(&meta("a.bin", 8, 2)).unwrap();
        rx.handle_binary(&chunk(5, 2, &[1])).unwrap(); // index out of range
        rx.handle_binary(&chunk(0, 7, &[1])).unwrap(); // no transfer with 7 chunks
        assert_eq!(rx.transfers()[0].received_size(), 0);
    }

    #[tokio::test]
    async fn zero_byte_file_completes_on_marker_alone() {
        let (mut rx, mut events) = receiver_with_events();

        rx.handle_text(&meta("empty.bin", 0, 0)).unwrap();
        rx.handle_text(&marker("empty.bin")).unwrap();

        let mut completed = None;
        while let Ok(ev) = events.try_recv() {
            if let TransferEvent::Completed { data, .. } = ev {
                completed = Some(data);
            }
        }
        assert_eq!(completed.expect("empty file completes").len(), 0);
    }

    #[tokio::test]
    async fn malformed_inputs_do_not_error() {
        let (mut rx, _events) = receiver_with_events();

        rx.handle_text("not json").unwrap();
        rx.handle_text(r#"{"type":"unknown"}"#).unwrap();
        rx.handle_binary(&[0u8; 3]).unwrap();
        rx.handle_text(&marker("nobody")).unwrap();
        assert!(rx.transfers().is_empty());
    }

    #[tokio::test]
    async fn reset_discards_partial_transfers() {
        let (mut rx, _events) = receiver_with_events();

        rx.handle_text(&meta("a.bin", 8, 2)).unwrap();
        rx.handle_binary(&chunk(0, 2, &[1, 2, 3, 4])).unwrap();
        rx.reset();

        assert!(rx.transfers().is_empty());
        // A late marker for the discarded file is ignored.
        rx.handle_text(&marker("a.bin")).unwrap();
        assert!(rx.transfers().is_empty());
    }
}
