//! A single multiplexed channel (spec.md §2/§5).
//!
//! A [`Channel`] is one TCP-shaped pipe riding inside a peer's tunnel.
//! Incoming bytes land in a bounded queue tracked by the multiplexer's
//! [`FlowSlot`]; once it holds more than `high_water_mark` bytes the
//! multiplexer's reader task emits a PAUSE frame asking the remote to stop
//! writing, and RESUME once the queue drains back under `low_water_mark`
//! (spec.md §5, invariant 4).
//!
//! [`Channel::split`] hands out an independently owned [`ChannelWriter`] so
//! a caller bridging a channel to a real TCP socket can drive both
//! directions concurrently instead of serializing them.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Semaphore};

use crate::error::{Error, ErrorKind, Result};
use crate::frame::ChannelId;
use crate::multiplexer::{ChannelTable, ControlFrame};

/// A write request a [`ChannelWriter`] hands to the multiplexer's writer
/// task, tagged with the channel it belongs to.
#[derive(Debug)]
pub struct WriteRequest {
    pub channel_id: ChannelId,
    pub command: ChannelCommand,
}

#[derive(Debug)]
pub enum ChannelCommand {
    /// Payload bytes plus the outstanding-queue permits they reserved.
    /// The writer task returns `permits` to `queue` once `bytes` is
    /// actually flushed to the wire, not when it's merely dequeued here.
    Data {
        bytes: Vec<u8>,
        permits: u32,
        queue: Arc<Semaphore>,
    },
    Close,
}

/// The write half of a channel. Cheaply cloneable so both halves of a
/// bidirectional bridge can hold one.
#[derive(Clone)]
pub struct ChannelWriter {
    id: ChannelId,
    local_open: Arc<AtomicBool>,
    write_tx: mpsc::UnboundedSender<WriteRequest>,
    queue: Arc<Semaphore>,
    write_cap: usize,
}

impl ChannelWriter {
    /// Queues `data` to be sent to the remote peer as one or more DATA
    /// frames. Suspends until the channel's outstanding-queue soft cap
    /// (spec.md §4.3/§5, `write_cap`) has room, so a slow remote peer
    /// applies real backpressure instead of buffering without bound. Fails
    /// if the local side already closed.
    pub async fn write(&self, data: Vec<u8>) -> Result<()> {
        if !self.local_open.load(Ordering::Acquire) {
            return Err(Error::simple(ErrorKind::Protocol));
        }
        // a single chunk larger than the cap still has to go through;
        // clamp the reservation to the cap itself rather than deadlock
        // waiting for permits that will never exist.
        let permits = data.len().min(self.write_cap).max(1) as u32;
        let permit = self
            .queue
            .clone()
            .acquire_many_owned(permits)
            .await
            .map_err(|_| Error::simple(ErrorKind::Transport))?;
        permit.forget();
        self.write_tx
            .send(WriteRequest {
                channel_id: self.id,
                command: ChannelCommand::Data {
                    bytes: data,
                    permits,
                    queue: self.queue.clone(),
                },
            })
            .map_err(|_| Error::simple(ErrorKind::Transport))
    }

    /// Half-closes the channel from the local side. Idempotent: closing an
    /// already-closed channel is a no-op (CLOSE must be idempotent).
    pub fn close(&self) -> Result<()> {
        if !self.local_open.swap(false, Ordering::AcqRel) {
            return Ok(());
        }
        self.write_tx
            .send(WriteRequest {
                channel_id: self.id,
                command: ChannelCommand::Close,
            })
            .map_err(|_| Error::simple(ErrorKind::Transport))
    }
}

/// The read half of a channel.
pub struct ChannelReader {
    id: ChannelId,
    hostname: String,
    incoming: mpsc::UnboundedReceiver<Vec<u8>>,
    closed: mpsc::UnboundedReceiver<()>,
    channels: ChannelTable,
    control_tx: mpsc::UnboundedSender<ControlFrame>,
}

impl ChannelReader {
    pub fn id(&self) -> ChannelId {
        self.id
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    /// Reads the next chunk of bytes the remote peer wrote, or `None` once
    /// the remote side has closed and no more data is pending. Acknowledges
    /// the read against the channel's [`FlowSlot`], sending a RESUME frame
    /// to the remote peer if this drain crosses back under the low water
    /// mark (spec.md §5, invariant 4).
    pub async fn read(&mut self) -> Option<Vec<u8>> {
        let data = tokio::select! {
            data = self.incoming.recv() => data,
            _ = self.closed.recv() => None,
        }?;
        self.acknowledge(data.len());
        Some(data)
    }

    fn acknowledge(&self, n: usize) {
        let resume = match self.channels.write().get_mut(&self.id) {
            Some(slot) => slot.acknowledge_drain(n),
            None => return,
        };
        if resume {
            let _ = self.control_tx.send(ControlFrame::Resume { channel_id: self.id });
        }
    }
}

/// A multiplexed channel, bundling a [`ChannelReader`] and [`ChannelWriter`]
/// for callers that don't need to drive both directions concurrently.
pub struct Channel {
    reader: ChannelReader,
    writer: ChannelWriter,
}

impl Channel {
    pub fn id(&self) -> ChannelId {
        self.reader.id()
    }

    pub fn hostname(&self) -> &str {
        self.reader.hostname()
    }

    pub async fn read(&mut self) -> Option<Vec<u8>> {
        self.reader.read().await
    }

    pub async fn write(&self, data: Vec<u8>) -> Result<()> {
        self.writer.write(data).await
    }

    pub fn close(&mut self) -> Result<()> {
        self.writer.close()
    }

    /// Splits this channel into independently owned halves so a bridge can
    /// read and write it concurrently from two separate tasks.
    pub fn split(self) -> (ChannelReader, ChannelWriter) {
        (self.reader, self.writer)
    }
}

/// The multiplexer's bookkeeping for one live channel, kept in its channel
/// table and driven entirely by the reader task.
pub struct FlowSlot {
    incoming_tx: mpsc::UnboundedSender<Vec<u8>>,
    closed_tx: mpsc::UnboundedSender<()>,
    pub high_water_mark: usize,
    pub low_water_mark: usize,
    pub queued: usize,
    pub paused_remote: bool,
    pub remote_open: bool,
}

/// Creates a [`Channel`] and its matching [`FlowSlot`] for a freshly opened
/// channel. `write_tx` is the multiplexer's shared writer queue; `channels`
/// and `control_tx` let the reader half acknowledge drains back against the
/// flow-control table.
#[allow(clippy::too_many_arguments)]
pub fn new_pair(
    id: ChannelId,
    hostname: String,
    high_water_mark: usize,
    low_water_mark: usize,
    write_tx: mpsc::UnboundedSender<WriteRequest>,
    channels: ChannelTable,
    control_tx: mpsc::UnboundedSender<ControlFrame>,
    write_cap: usize,
) -> (Channel, FlowSlot) {
    let (incoming_tx, incoming_rx) = mpsc::unbounded_channel();
    let (closed_tx, closed_rx) = mpsc::unbounded_channel();

    let channel = Channel {
        reader: ChannelReader {
            id,
            hostname,
            incoming: incoming_rx,
            closed: closed_rx,
            channels,
            control_tx,
        },
        writer: ChannelWriter {
            id,
            local_open: Arc::new(AtomicBool::new(true)),
            write_tx,
            queue: Arc::new(Semaphore::new(write_cap)),
            write_cap,
        },
    };
    let slot = FlowSlot {
        incoming_tx,
        closed_tx,
        high_water_mark,
        low_water_mark,
        queued: 0,
        paused_remote: false,
        remote_open: true,
    };
    (channel, slot)
}

impl FlowSlot {
    /// Delivers a DATA frame's payload to the channel's owner. Returns
    /// `true` if the queue just crossed `high_water_mark` and a PAUSE frame
    /// should be sent to the remote peer.
    pub fn deliver(&mut self, data: Vec<u8>) -> Result<bool> {
        self.queued += data.len();
        let crossed = self.queued > self.high_water_mark;
        self.incoming_tx
            .send(data)
            .map_err(|_| Error::simple(ErrorKind::Protocol))?;
        Ok(crossed)
    }

    /// Acknowledges that `n` bytes have been drained by the channel's
    /// owner. Returns `true` if the queue just crossed back under
    /// `low_water_mark` and a RESUME frame should be sent.
    pub fn acknowledge_drain(&mut self, n: usize) -> bool {
        let was_over = self.queued > self.low_water_mark;
        self.queued = self.queued.saturating_sub(n);
        was_over && self.queued <= self.low_water_mark
    }

    pub fn mark_remote_closed(&mut self) {
        self.remote_open = false;
        let _ = self.closed_tx.send(());
    }
}
