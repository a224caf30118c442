//! Writer task: serializes outgoing frames onto the tunnel socket.
//!
//! Two sources feed this task: per-channel [`WriteRequest`]s (payload bytes
//! a [`Channel`](crate::channel::Channel) owner wrote) and
//! [`ControlFrame`]s (NEW, PING/PONG, and the PAUSE/RESUME we emit because
//! of our own incoming buffer state). A channel the remote peer paused has
//! its DATA frames held in `pending` until a RESUME arrives, rather than
//! being sent straight through and ignoring the remote's backpressure
//! signal.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, Semaphore};
use tracing::debug;

use super::ControlFrame;
use crate::channel::{ChannelCommand, WriteRequest};
use crate::crypto::cipher::PeerCrypto;
use crate::frame::{self, ChannelId, FrameType, MAX_DATA};

const FLUSH_RETRY_INTERVAL: Duration = Duration::from_millis(50);

/// A DATA write held back because its channel is remote-paused, along with
/// the outstanding-queue permits it reserved. The permits are only
/// returned once `bytes` actually reaches the wire.
struct PendingChunk {
    bytes: Vec<u8>,
    permits: u32,
    queue: Arc<Semaphore>,
}

pub(super) async fn run<W>(
    mut write_half: W,
    crypto: PeerCrypto,
    mut write_rx: mpsc::UnboundedReceiver<WriteRequest>,
    mut control_rx: mpsc::UnboundedReceiver<ControlFrame>,
) where
    W: AsyncWrite + Unpin,
{
    let mut pending: HashMap<ChannelId, VecDeque<PendingChunk>> = HashMap::new();
    let mut paused: std::collections::HashSet<ChannelId> = std::collections::HashSet::new();
    let mut retry = tokio::time::interval(FLUSH_RETRY_INTERVAL);

    loop {
        tokio::select! {
            req = write_rx.recv() => {
                let Some(req) = req else { break };
                if let Err(e) = handle_write_request(&mut write_half, &crypto, req, &mut pending, &paused).await {
                    debug!(error = %e, "tunnel writer stopping");
                    break;
                }
            }
            ctrl = control_rx.recv() => {
                let Some(ctrl) = ctrl else { break };
                if let Err(e) = handle_control(&mut write_half, &crypto, ctrl, &mut paused).await {
                    debug!(error = %e, "tunnel writer stopping");
                    break;
                }
            }
            _ = retry.tick() => {
                if let Err(e) = flush_pending(&mut write_half, &crypto, &mut pending, &paused).await {
                    debug!(error = %e, "tunnel writer stopping");
                    break;
                }
            }
        }
    }
}

async fn handle_write_request<W>(
    write_half: &mut W,
    crypto: &PeerCrypto,
    req: WriteRequest,
    pending: &mut HashMap<ChannelId, VecDeque<PendingChunk>>,
    paused: &std::collections::HashSet<ChannelId>,
) -> crate::error::Result<()>
where
    W: AsyncWrite + Unpin,
{
    match req.command {
        ChannelCommand::Data { bytes, permits, queue } => {
            if paused.contains(&req.channel_id) {
                pending
                    .entry(req.channel_id)
                    .or_default()
                    .push_back(PendingChunk { bytes, permits, queue });
                return Ok(());
            }
            let result = write_data(write_half, crypto, req.channel_id, &bytes).await;
            queue.add_permits(permits as usize);
            result
        }
        ChannelCommand::Close => {
            for chunk in pending.remove(&req.channel_id).into_iter().flatten() {
                chunk.queue.add_permits(chunk.permits as usize);
            }
            write_frame(write_half, crypto, req.channel_id, FrameType::Close, [0u8; 11], &[]).await
        }
    }
}

async fn handle_control<W>(
    write_half: &mut W,
    crypto: &PeerCrypto,
    ctrl: ControlFrame,
    paused: &mut std::collections::HashSet<ChannelId>,
) -> crate::error::Result<()>
where
    W: AsyncWrite + Unpin,
{
    match ctrl {
        ControlFrame::New { channel_id, hostname } => {
            write_frame(write_half, crypto, channel_id, FrameType::New, [0u8; 11], hostname.as_bytes()).await
        }
        ControlFrame::Pause { channel_id } => {
            write_frame(write_half, crypto, channel_id, FrameType::Pause, [0u8; 11], &[]).await
        }
        ControlFrame::Resume { channel_id } => {
            write_frame(write_half, crypto, channel_id, FrameType::Resume, [0u8; 11], &[]).await
        }
        ControlFrame::Ping { tag } => {
            let mut extra = [0u8; 11];
            extra[0] = 0;
            extra[1..9].copy_from_slice(&tag);
            write_frame(write_half, crypto, [0u8; 16], FrameType::Ping, extra, &[]).await
        }
        ControlFrame::Pong { tag } => {
            let mut extra = [0u8; 11];
            extra[0] = 1;
            extra[1..9].copy_from_slice(&tag);
            write_frame(write_half, crypto, [0u8; 16], FrameType::Ping, extra, &[]).await
        }
        ControlFrame::RemotePaused { channel_id } => {
            paused.insert(channel_id);
            Ok(())
        }
        ControlFrame::RemoteResumed { channel_id } => {
            paused.remove(&channel_id);
            Ok(())
        }
    }
}

/// Retries channels whose remote-imposed pause has since been lifted.
/// `paused` still marking a channel held in `pending` simply leaves its
/// queue untouched until the next tick.
async fn flush_pending<W>(
    write_half: &mut W,
    crypto: &PeerCrypto,
    pending: &mut HashMap<ChannelId, VecDeque<PendingChunk>>,
    paused: &std::collections::HashSet<ChannelId>,
) -> crate::error::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let ready: Vec<ChannelId> = pending
        .keys()
        .filter(|id| !paused.contains(*id))
        .copied()
        .collect();
    for channel_id in ready {
        if let Some(queue) = pending.get_mut(&channel_id) {
            while let Some(chunk) = queue.pop_front() {
                write_data(write_half, crypto, channel_id, &chunk.bytes).await?;
                chunk.queue.add_permits(chunk.permits as usize);
            }
        }
        pending.remove(&channel_id);
    }
    Ok(())
}

async fn write_data<W>(
    write_half: &mut W,
    crypto: &PeerCrypto,
    channel_id: ChannelId,
    data: &[u8],
) -> crate::error::Result<()>
where
    W: AsyncWrite + Unpin,
{
    for chunk in data.chunks(MAX_DATA) {
        write_frame(write_half, crypto, channel_id, FrameType::Data, [0u8; 11], chunk).await?;
    }
    Ok(())
}

async fn write_frame<W>(
    write_half: &mut W,
    crypto: &PeerCrypto,
    channel_id: ChannelId,
    frame_type: FrameType,
    extra: [u8; 11],
    payload: &[u8],
) -> crate::error::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let wire = frame::encode(channel_id, frame_type, extra, payload, crypto)?;
    write_half.write_all(&wire).await.map_err(crate::error::Error::from)?;
    Ok(())
}
