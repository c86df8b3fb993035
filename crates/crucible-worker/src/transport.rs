//! Backend connection plumbing: frame loops and the per-connection
//! handler.
//!
//! Each connection runs a receive loop and a send loop as their own
//! tasks, joined to bounded queues. The handler between them enforces
//! the opening-frame contract and hands the queues to the request
//! driver, one request at a time. The send loop drains up to a `Close`
//! sentinel before it exits, so late envelopes are not lost when the
//! connection winds down.

use std::sync::Arc;

use futures::{SinkExt as _, StreamExt as _};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, error, warn};

use crucible_core::protocol::{ClientEnvelope, WorkerEvent, COMMAND_NEW};
use crucible_core::rules::BuildStages;

use crate::config::WorkerConfig;
use crate::framing::FrameCodec;
use crate::request::{handle_request, RequestContext};

/// Outbound queue capacity; sized to absorb output bursts without
/// stalling the pipe readers.
pub const OUTBOUND_QUEUE_CAPACITY: usize = 256;

/// Inbound queue capacity; the backend sends little and rarely.
pub const INBOUND_QUEUE_CAPACITY: usize = 4;

/// Item on the outbound queue.
#[derive(Debug)]
pub enum Outbound {
    Event(WorkerEvent),
    /// Sentinel: the send loop exits after draining everything queued
    /// before it.
    Close,
}

/// Serialize and write outbound envelopes until the `Close` sentinel or
/// a write failure.
pub async fn send_loop<W>(
    mut sink: FramedWrite<W, FrameCodec>,
    mut outbound: mpsc::Receiver<Outbound>,
) where
    W: AsyncWrite + Unpin,
{
    while let Some(item) = outbound.recv().await {
        let event = match item {
            Outbound::Close => break,
            Outbound::Event(event) => event,
        };

        // Error envelopes also go to the worker log.
        if let WorkerEvent::Error { description, .. } = &event {
            error!("sending error to backend: {description}");
        }

        let payload = match serde_json::to_vec(&event) {
            Ok(payload) => payload,
            Err(e) => {
                error!("failed to marshal outgoing message: {e}");
                let fallback = WorkerEvent::error(
                    format!("Failed to marshal message: {e}"),
                    "",
                    event.request_id(),
                );
                match serde_json::to_vec(&fallback) {
                    Ok(payload) => payload,
                    Err(_) => continue,
                }
            }
        };

        if let Err(e) = sink.send(payload).await {
            error!("failed to write frame to backend: {e}");
            return;
        }
    }
    debug!("send loop exited");
}

/// Read frames, parse envelopes, and feed the inbound queue until the
/// connection closes or the queue's receiver is gone.
pub async fn recv_loop<R>(
    mut stream: FramedRead<R, FrameCodec>,
    inbound: mpsc::Sender<ClientEnvelope>,
) where
    R: AsyncRead + Unpin,
{
    while let Some(frame) = stream.next().await {
        let frame = match frame {
            Ok(frame) => frame,
            Err(e) => {
                warn!("failed to read frame from backend: {e}");
                break;
            }
        };

        let envelope: ClientEnvelope = match serde_json::from_slice(&frame) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!("failed to unmarshal message: {e}, text: '{}'", preview(&frame));
                continue;
            }
        };

        if inbound.send(envelope).await.is_err() {
            break;
        }
    }
    debug!("receive loop exited");
}

/// Handle one backend connection until it closes.
///
/// Requests run strictly one at a time: the handler waits for an
/// opening `{command:"new", request_id, target}` frame, runs the
/// request driver to its terminal `finish`, and loops. Malformed
/// opening frames are logged and dropped without starting a request.
pub async fn handle_connection<S>(stream: S, rules: Arc<BuildStages>, config: Arc<WorkerConfig>)
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (read_half, write_half) = tokio::io::split(stream);
    let framed_read = FramedRead::new(read_half, FrameCodec::new());
    let framed_write = FramedWrite::new(write_half, FrameCodec::new());

    let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_QUEUE_CAPACITY);
    let (inbound_tx, mut inbound_rx) = mpsc::channel(INBOUND_QUEUE_CAPACITY);

    let send_task = tokio::spawn(send_loop(framed_write, outbound_rx));
    let recv_task = tokio::spawn(recv_loop(framed_read, inbound_tx));

    while let Some(envelope) = inbound_rx.recv().await {
        if envelope.command.as_deref() != Some(COMMAND_NEW) {
            warn!("got wrong opening request message: {:?}", envelope.command);
            continue;
        }
        let Some(request_id) = envelope.request_id.clone().filter(|id| !id.is_empty()) else {
            warn!("got empty request_id in the opening message");
            continue;
        };
        if envelope.source_files.is_some() {
            warn!("got unexpected source_files content in the opening message");
            continue;
        }
        let Some(target) = envelope.target.clone().filter(|t| !t.is_empty()) else {
            warn!(%request_id, "got empty target in the opening message");
            continue;
        };

        let ctx = RequestContext {
            request_id,
            target,
            rules: &rules,
            config: &config,
        };
        handle_request(ctx, &outbound_tx, &mut inbound_rx).await;
    }

    // The receive loop is gone; drain the send side and join both.
    let _ = outbound_tx.send(Outbound::Close).await;
    let _ = send_task.await;
    let _ = recv_task.await;
    debug!("connection handler exited");
}

fn preview(bytes: &[u8]) -> String {
    let cut = bytes.len().min(64);
    String::from_utf8_lossy(&bytes[..cut]).into_owned()
}
