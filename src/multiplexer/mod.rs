//! The channel multiplexer (spec.md §2/§4).
//!
//! One [`Multiplexer`] owns one peer's tunnel socket. A reader task decodes
//! frames off the wire and dispatches them against a shared channel table; a
//! writer task serializes outgoing frames, whether they come from a
//! [`Channel`](crate::channel::Channel) writing payload bytes or from
//! control logic (handshake PING, PAUSE/RESUME) issued by the reader. The
//! shared table is an `Arc<parking_lot::RwLock<HashMap<..>>>`, the same
//! shape `penguin-rs` uses for its multiplexed channel flow-control map.

mod reader;
mod writer;

use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot, Mutex as AsyncMutex};
use tokio::task::JoinHandle;

use crate::channel::{new_pair, Channel, FlowSlot, WriteRequest};
use crate::crypto::cipher::PeerCrypto;
use crate::error::{Error, ErrorKind, Result};
use crate::frame::ChannelId;

pub(crate) type ChannelTable = Arc<RwLock<HashMap<ChannelId, FlowSlot>>>;
pub(crate) type PendingPings = Arc<Mutex<HashMap<[u8; 8], oneshot::Sender<()>>>>;

/// A raw frame the writer task should send that isn't tied to any one
/// channel's payload (NEW, PING, PAUSE, RESUME).
#[derive(Debug)]
pub(crate) enum ControlFrame {
    New { channel_id: ChannelId, hostname: String },
    /// Tell the remote peer to stop sending DATA on `channel_id`; emitted
    /// because *our* incoming buffer for it crossed the high water mark.
    Pause { channel_id: ChannelId },
    /// Tell the remote peer it may resume sending DATA on `channel_id`.
    Resume { channel_id: ChannelId },
    Ping { tag: [u8; 8] },
    Pong { tag: [u8; 8] },
    /// The remote peer asked *us* to stop sending DATA on `channel_id`
    /// (it sent us a PAUSE frame). Purely local writer-side bookkeeping,
    /// never itself put on the wire.
    RemotePaused { channel_id: ChannelId },
    /// The remote peer lifted a prior pause on `channel_id`.
    RemoteResumed { channel_id: ChannelId },
}

/// Owns one peer's tunnel connection and the channels multiplexed over it.
pub struct Multiplexer {
    channels: ChannelTable,
    write_tx: mpsc::UnboundedSender<WriteRequest>,
    control_tx: mpsc::UnboundedSender<ControlFrame>,
    new_channels: AsyncMutex<mpsc::UnboundedReceiver<Channel>>,
    high_water_mark: usize,
    low_water_mark: usize,
    channel_write_cap: usize,
    reader_task: JoinHandle<()>,
    writer_task: JoinHandle<()>,
    last_activity: Arc<Mutex<Instant>>,
    pending_pings: PendingPings,
}

impl Multiplexer {
    /// Spawns the reader and writer tasks for a tunnel connection already
    /// split into independent read/write halves. `channel_write_cap` bounds
    /// how many bytes may sit queued, unsent, on any one channel before
    /// [`crate::channel::ChannelWriter::write`] suspends its caller
    /// (spec.md §4.3/§5).
    pub fn spawn<R, W>(
        read_half: R,
        write_half: W,
        crypto: PeerCrypto,
        high_water_mark: usize,
        low_water_mark: usize,
        channel_write_cap: usize,
    ) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let channels: ChannelTable = Arc::new(RwLock::new(HashMap::new()));
        let (write_tx, write_rx) = mpsc::unbounded_channel();
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let (new_channels_tx, new_channels_rx) = mpsc::unbounded_channel();
        let last_activity = Arc::new(Mutex::new(Instant::now()));
        let pending_pings: PendingPings = Arc::new(Mutex::new(HashMap::new()));

        let writer_task = tokio::spawn(writer::run(
            write_half,
            crypto.clone(),
            write_rx,
            control_rx,
        ));
        let reader_task = tokio::spawn(reader::run(
            read_half,
            crypto,
            channels.clone(),
            new_channels_tx,
            write_tx.clone(),
            control_tx.clone(),
            high_water_mark,
            low_water_mark,
            channel_write_cap,
            last_activity.clone(),
            pending_pings.clone(),
        ));

        Multiplexer {
            channels,
            write_tx,
            control_tx,
            new_channels: AsyncMutex::new(new_channels_rx),
            high_water_mark,
            low_water_mark,
            channel_write_cap,
            reader_task,
            writer_task,
            last_activity,
            pending_pings,
        }
    }

    /// Opens a new channel for `hostname`, sending the NEW frame to the
    /// remote peer. Returns immediately; the remote side is expected to
    /// start relaying without an explicit acknowledgement (spec.md §4.2).
    pub fn create_channel(&self, hostname: impl Into<String>) -> Result<Channel> {
        let hostname = hostname.into();
        let id: ChannelId = rand::random();
        let (channel, slot) = new_pair(
            id,
            hostname.clone(),
            self.high_water_mark,
            self.low_water_mark,
            self.write_tx.clone(),
            self.channels.clone(),
            self.control_tx.clone(),
            self.channel_write_cap,
        );
        self.channels.write().insert(id, slot);
        self.control_tx
            .send(ControlFrame::New {
                channel_id: id,
                hostname,
            })
            .map_err(|_| Error::simple(ErrorKind::Transport))?;
        Ok(channel)
    }

    /// Waits for the next channel the remote peer opened with a NEW frame.
    /// Returns `None` once the tunnel connection has been lost.
    pub async fn wait_for_channel(&self) -> Option<Channel> {
        self.new_channels.lock().await.recv().await
    }

    /// Sends a PING frame with a fresh random tag and waits up to
    /// `timeout_duration` for the matching PONG. Returns a transport error
    /// if the echo never arrives, which is what a caller uses to detect a
    /// half-open connection and trigger a reconnect (spec.md §4.8).
    pub async fn ping(&self, timeout_duration: Duration) -> Result<()> {
        let tag: [u8; 8] = rand::random();
        let (tx, rx) = oneshot::channel();
        self.pending_pings.lock().insert(tag, tx);

        if self
            .control_tx
            .send(ControlFrame::Ping { tag })
            .is_err()
        {
            self.pending_pings.lock().remove(&tag);
            return Err(Error::simple(ErrorKind::Transport));
        }

        match tokio::time::timeout(timeout_duration, rx).await {
            Ok(Ok(())) => Ok(()),
            _ => {
                self.pending_pings.lock().remove(&tag);
                Err(Error::simple(ErrorKind::Transport))
            }
        }
    }

    /// Shuts both the reader and writer tasks down and drains the channel
    /// table, marking every still-open channel remote-closed. `abort`
    /// alone isn't enough: it cancels a task at its next await point
    /// without running the reader's own end-of-loop cleanup, which would
    /// otherwise leave any channel's reader blocked forever.
    pub fn close(&self) {
        self.reader_task.abort();
        self.writer_task.abort();
        for (_, mut slot) in self.channels.write().drain() {
            slot.mark_remote_closed();
        }
    }

    /// Number of channels currently open on this peer's tunnel.
    pub fn channel_count(&self) -> usize {
        self.channels.read().len()
    }

    /// Time elapsed since the last frame was received from the remote peer.
    pub fn idle_for(&self) -> Duration {
        self.last_activity.lock().elapsed()
    }
}

impl Drop for Multiplexer {
    fn drop(&mut self) {
        self.close();
    }
}
