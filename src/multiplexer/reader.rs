//! Reader task: decodes frames off the tunnel socket and dispatches them
//! against the shared channel table (spec.md §4.2).

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Instant;
use tokio::io::AsyncRead;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use super::{ChannelTable, ControlFrame, PendingPings};
use crate::channel::{new_pair, Channel, WriteRequest};
use crate::crypto::cipher::PeerCrypto;
use crate::frame::{self, ChannelId, FrameType};

#[allow(clippy::too_many_arguments)]
pub(super) async fn run<R>(
    mut read_half: R,
    crypto: PeerCrypto,
    channels: ChannelTable,
    new_channels_tx: mpsc::UnboundedSender<Channel>,
    write_tx: mpsc::UnboundedSender<WriteRequest>,
    control_tx: mpsc::UnboundedSender<ControlFrame>,
    high_water_mark: usize,
    low_water_mark: usize,
    channel_write_cap: usize,
    last_activity: Arc<Mutex<Instant>>,
    pending_pings: PendingPings,
) where
    R: AsyncRead + Unpin,
{
    loop {
        let frame = match frame::decode_async(&mut read_half, &crypto).await {
            Ok(frame) => frame,
            Err(e) => {
                debug!(error = %e, "tunnel reader stopping");
                break;
            }
        };
        *last_activity.lock() = Instant::now();

        match frame.frame_type {
            FrameType::New => {
                let hostname = match String::from_utf8(frame.payload) {
                    Ok(h) => h,
                    Err(_) => {
                        warn!("dropping NEW frame with non-UTF-8 hostname");
                        continue;
                    }
                };
                if channels.read().contains_key(&frame.channel_id) {
                    // ProtocolError (spec.md §4.2/§7): a NEW for a live
                    // channel id tears down the whole peer rather than
                    // being silently ignored.
                    warn!(channel_id = ?frame.channel_id, "NEW frame for already-live channel id, tearing down peer");
                    break;
                }
                let (channel, slot) = new_pair(
                    frame.channel_id,
                    hostname,
                    high_water_mark,
                    low_water_mark,
                    write_tx.clone(),
                    channels.clone(),
                    control_tx.clone(),
                    channel_write_cap,
                );
                channels.write().insert(frame.channel_id, slot);
                if new_channels_tx.send(channel).is_err() {
                    channels.write().remove(&frame.channel_id);
                }
            }
            FrameType::Data => {
                handle_data(&channels, &control_tx, frame.channel_id, frame.payload);
            }
            FrameType::Close => {
                if let Some(slot) = channels.write().get_mut(&frame.channel_id) {
                    slot.mark_remote_closed();
                }
                channels.write().remove(&frame.channel_id);
            }
            FrameType::Pause => {
                if let Some(slot) = channels.write().get_mut(&frame.channel_id) {
                    slot.paused_remote = true;
                }
                let _ = control_tx.send(ControlFrame::RemotePaused {
                    channel_id: frame.channel_id,
                });
            }
            FrameType::Resume => {
                if let Some(slot) = channels.write().get_mut(&frame.channel_id) {
                    slot.paused_remote = false;
                }
                let _ = control_tx.send(ControlFrame::RemoteResumed {
                    channel_id: frame.channel_id,
                });
            }
            FrameType::Ping => handle_ping(&control_tx, &frame.extra, &pending_pings),
        }
    }

    for (_, mut slot) in channels.write().drain() {
        slot.mark_remote_closed();
    }
}

fn handle_data(
    channels: &ChannelTable,
    control_tx: &mpsc::UnboundedSender<ControlFrame>,
    channel_id: ChannelId,
    payload: Vec<u8>,
) {
    let crossed = {
        let mut table = channels.write();
        match table.get_mut(&channel_id) {
            Some(slot) => slot.deliver(payload).unwrap_or(false),
            None => {
                trace!(?channel_id, "DATA frame for unknown channel, dropping");
                return;
            }
        }
    };
    if crossed {
        let _ = control_tx.send(ControlFrame::Pause { channel_id });
    }
}

/// `extra[0]` is 0 for a ping request (we must answer with a pong carrying
/// the same tag) and 1 for a pong reply: match it against the tag's pending
/// waiter and wake it.
fn handle_ping(
    control_tx: &mpsc::UnboundedSender<ControlFrame>,
    extra: &[u8],
    pending_pings: &PendingPings,
) {
    let mut tag = [0u8; 8];
    tag.copy_from_slice(&extra[1..9]);

    if extra.first() == Some(&1) {
        if let Some(waiter) = pending_pings.lock().remove(&tag) {
            let _ = waiter.send(());
        } else {
            trace!(?tag, "pong for an unknown or already-timed-out ping");
        }
        return;
    }
    let _ = control_tx.send(ControlFrame::Pong { tag });
}
