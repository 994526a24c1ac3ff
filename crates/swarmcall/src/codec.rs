//! Reference wire codec: length-prefixed JSON frames over any byte stream.
//!
//! Each frame is a 4-byte big-endian length header followed by a JSON
//! body. Calls carry a correlation id drawn from an atomic counter; the
//! matching reply resolves the parked caller, so replies may complete out
//! of order relative to each other. Extension frames are fanned out to
//! subscribers untouched.
//!
//! The framing here is an implementation detail of this codec, not a
//! protocol mandate: sessions accept any [`WireCodec`] implementation.

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tracing::{debug, warn};

use crate::channel::{
    ExtensionFrame, InboundRequest, PeerStream, RawHandler, ReplySink, WireChannel, WireCodec,
};
use swarmcall_types::error::{SwarmError, SwarmResult};

/// Maximum single frame size (16 MB).
pub const MAX_FRAME_SIZE: u32 = 16 * 1024 * 1024;

/// Capacity of the extension fan-out channel.
const EXTENSION_CAPACITY: usize = 64;

/// The JSON codec factory.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl WireCodec for JsonCodec {
    fn channel(&self, stream: PeerStream) -> Arc<dyn WireChannel> {
        JsonChannel::spawn(stream)
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum Frame {
    Call {
        seq: u64,
        command: String,
        #[serde(default)]
        arguments: Vec<Value>,
    },
    Reply {
        seq: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    Extension {
        ext: u32,
        /// Base64 of the opaque payload.
        payload: String,
    },
}

struct JsonChannel {
    handlers: RwLock<HashMap<String, RawHandler>>,
    pending: Mutex<HashMap<u64, oneshot::Sender<SwarmResult<Value>>>>,
    seq: AtomicU64,
    out_tx: mpsc::UnboundedSender<Frame>,
    ext_tx: broadcast::Sender<ExtensionFrame>,
    /// Receiver created with the channel, handed to the first subscriber
    /// so frames arriving before anyone subscribed are not lost.
    ext_rx0: Mutex<Option<broadcast::Receiver<ExtensionFrame>>>,
    closed_tx: watch::Sender<bool>,
    closed_rx: watch::Receiver<bool>,
}

impl JsonChannel {
    fn spawn(stream: PeerStream) -> Arc<dyn WireChannel> {
        let (reader, writer) = tokio::io::split(stream);
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (ext_tx, ext_rx0) = broadcast::channel(EXTENSION_CAPACITY);
        let (closed_tx, closed_rx) = watch::channel(false);

        let channel = Arc::new(Self {
            handlers: RwLock::new(HashMap::new()),
            pending: Mutex::new(HashMap::new()),
            seq: AtomicU64::new(1),
            out_tx,
            ext_tx,
            ext_rx0: Mutex::new(Some(ext_rx0)),
            closed_tx,
            closed_rx,
        });

        tokio::spawn(read_loop(Arc::clone(&channel), reader));
        tokio::spawn(write_loop(Arc::clone(&channel), writer, out_rx));

        channel
    }

    /// Flip the closed flag and fail everything still in flight. Safe to
    /// call from both loops and from `destroy`.
    fn shutdown(&self) {
        if self.closed_tx.send_replace(true) {
            return;
        }
        let drained: Vec<_> = {
            let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
            pending.drain().collect()
        };
        for (_, tx) in drained {
            let _ = tx.send(Err(SwarmError::PeerUnavailable(
                "connection closed with call in flight".to_string(),
            )));
        }
        self.handlers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }

    fn dispatch(self: &Arc<Self>, frame: Frame) {
        match frame {
            Frame::Call {
                seq,
                command,
                arguments,
            } => self.dispatch_call(seq, command, arguments),
            Frame::Reply { seq, result, error } => {
                let waiter = {
                    let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
                    pending.remove(&seq)
                };
                match waiter {
                    Some(tx) => {
                        let outcome = match error {
                            Some(message) => Err(SwarmError::Remote(message)),
                            None => Ok(result.unwrap_or(Value::Null)),
                        };
                        let _ = tx.send(outcome);
                    }
                    None => debug!(seq, "reply without matching call"),
                }
            }
            Frame::Extension { ext, payload } => match BASE64.decode(&payload) {
                Ok(bytes) => {
                    let _ = self.ext_tx.send(ExtensionFrame {
                        ext,
                        payload: Bytes::from(bytes),
                    });
                }
                Err(e) => warn!(ext, error = %e, "dropping extension frame with bad payload"),
            },
        }
    }

    fn dispatch_call(self: &Arc<Self>, seq: u64, command: String, arguments: Vec<Value>) {
        let handler = {
            let handlers = self.handlers.read().unwrap_or_else(|e| e.into_inner());
            handlers.get(&command).cloned()
        };
        let Some(handler) = handler else {
            let _ = self.out_tx.send(Frame::Reply {
                seq,
                result: None,
                error: Some(format!("unknown command: {command}")),
            });
            return;
        };

        let (reply_tx, reply_rx) = oneshot::channel();
        let request = InboundRequest {
            id: seq,
            command: command.clone(),
            arguments,
        };
        handler(request, ReplySink::new(reply_tx));

        let out = self.out_tx.clone();
        tokio::spawn(async move {
            let frame = match reply_rx.await {
                Ok(Ok(value)) => Frame::Reply {
                    seq,
                    result: Some(value),
                    error: None,
                },
                Ok(Err(message)) => Frame::Reply {
                    seq,
                    result: None,
                    error: Some(message),
                },
                // Handler dropped its sink without replying.
                Err(_) => Frame::Reply {
                    seq,
                    result: None,
                    error: Some(format!("handler for '{command}' dropped its reply")),
                },
            };
            let _ = out.send(frame);
        });
    }
}

#[async_trait]
impl WireChannel for JsonChannel {
    fn install(&self, name: &str, handler: RawHandler) {
        let mut handlers = self.handlers.write().unwrap_or_else(|e| e.into_inner());
        handlers.insert(name.to_string(), handler);
    }

    async fn call(&self, name: &str, args: Vec<Value>) -> SwarmResult<Value> {
        if self.is_closed() {
            return Err(SwarmError::PeerUnavailable(format!(
                "channel closed before calling '{name}'"
            )));
        }
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
            pending.insert(seq, tx);
        }
        let frame = Frame::Call {
            seq,
            command: name.to_string(),
            arguments: args,
        };
        // Re-check after parking the waiter: a concurrent shutdown drains
        // the pending table, and an entry inserted after that drain would
        // wait forever.
        if self.out_tx.send(frame).is_err() || self.is_closed() {
            let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
            pending.remove(&seq);
            return Err(SwarmError::PeerUnavailable(
                "channel closed".to_string(),
            ));
        }
        match rx.await {
            Ok(outcome) => outcome,
            Err(_) => Err(SwarmError::PeerUnavailable(
                "connection closed while awaiting reply".to_string(),
            )),
        }
    }

    fn send_extension(&self, ext: u32, payload: Bytes) -> SwarmResult<()> {
        if self.is_closed() {
            return Err(SwarmError::PeerUnavailable(
                "channel closed".to_string(),
            ));
        }
        let frame = Frame::Extension {
            ext,
            payload: BASE64.encode(&payload),
        };
        self.out_tx
            .send(frame)
            .map_err(|_| SwarmError::PeerUnavailable("channel writer stopped".to_string()))
    }

    fn extensions(&self) -> broadcast::Receiver<ExtensionFrame> {
        let mut initial = self.ext_rx0.lock().unwrap_or_else(|e| e.into_inner());
        match initial.take() {
            Some(rx) => rx,
            None => self.ext_tx.subscribe(),
        }
    }

    fn closed(&self) -> watch::Receiver<bool> {
        self.closed_rx.clone()
    }

    fn is_closed(&self) -> bool {
        *self.closed_rx.borrow()
    }

    fn destroy(&self) {
        self.shutdown();
    }
}

/// Encode a frame to bytes: 4-byte big-endian length + JSON body.
fn encode_frame(frame: &Frame) -> SwarmResult<Vec<u8>> {
    let body = serde_json::to_vec(frame).map_err(|e| SwarmError::Codec(e.to_string()))?;
    if body.len() as u64 > MAX_FRAME_SIZE as u64 {
        return Err(SwarmError::Codec(format!(
            "frame too large: {} bytes (max {MAX_FRAME_SIZE})",
            body.len()
        )));
    }
    let mut bytes = Vec::with_capacity(4 + body.len());
    bytes.extend_from_slice(&(body.len() as u32).to_be_bytes());
    bytes.extend_from_slice(&body);
    Ok(bytes)
}

/// Read one frame. `Ok(None)` is a clean end of stream.
async fn read_frame(reader: &mut ReadHalf<PeerStream>) -> SwarmResult<Option<Frame>> {
    let mut header = [0u8; 4];
    match reader.read_exact(&mut header).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(SwarmError::Io(e)),
    }

    let len = u32::from_be_bytes(header);
    if len > MAX_FRAME_SIZE {
        return Err(SwarmError::Codec(format!(
            "frame too large: {len} bytes (max {MAX_FRAME_SIZE})"
        )));
    }

    let mut body = vec![0u8; len as usize];
    reader.read_exact(&mut body).await?;
    let frame = serde_json::from_slice(&body).map_err(|e| SwarmError::Codec(e.to_string()))?;
    Ok(Some(frame))
}

async fn read_loop(channel: Arc<JsonChannel>, mut reader: ReadHalf<PeerStream>) {
    let mut closed = channel.closed_rx.clone();
    loop {
        tokio::select! {
            frame = read_frame(&mut reader) => match frame {
                Ok(Some(frame)) => channel.dispatch(frame),
                Ok(None) => break,
                Err(e) => {
                    debug!(error = %e, "read loop terminating");
                    break;
                }
            },
            _ = closed.changed() => {
                if *closed.borrow() {
                    break;
                }
            }
        }
    }
    channel.shutdown();
}

async fn write_loop(
    channel: Arc<JsonChannel>,
    mut writer: WriteHalf<PeerStream>,
    mut out_rx: mpsc::UnboundedReceiver<Frame>,
) {
    let mut closed = channel.closed_rx.clone();
    loop {
        tokio::select! {
            frame = out_rx.recv() => match frame {
                Some(frame) => match encode_frame(&frame) {
                    Ok(bytes) => {
                        if let Err(e) = writer.write_all(&bytes).await {
                            debug!(error = %e, "write loop terminating");
                            break;
                        }
                        if writer.flush().await.is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!(error = %e, "dropping unencodable frame"),
                },
                None => break,
            },
            _ = closed.changed() => {
                if *closed.borrow() {
                    break;
                }
            }
        }
    }
    channel.shutdown();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::handler;
    use serde_json::json;
    use std::time::Duration;
    use tokio::time::timeout;

    fn pair() -> (Arc<dyn WireChannel>, Arc<dyn WireChannel>) {
        let (a, b) = tokio::io::duplex(64 * 1024);
        (JsonCodec.channel(Box::new(a)), JsonCodec.channel(Box::new(b)))
    }

    fn echo_handler() -> RawHandler {
        let echo = handler(|args| async move { Ok(json!(args)) });
        Arc::new(move |req: InboundRequest, reply: ReplySink| {
            tokio::spawn(echo(req.arguments.clone(), reply, req));
        })
    }

    #[tokio::test]
    async fn test_call_reply_round_trip() {
        let (a, b) = pair();
        a.install("echo", echo_handler());

        let result = b.call("echo", vec![json!("hi"), json!(2)]).await.unwrap();
        assert_eq!(result, json!(["hi", 2]));
    }

    #[tokio::test]
    async fn test_unknown_command_is_remote_error() {
        let (_a, b) = pair();
        let err = b.call("nope", vec![]).await.unwrap_err();
        match err {
            SwarmError::Remote(msg) => assert!(msg.contains("unknown command")),
            other => panic!("expected Remote, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_replies_resolve_out_of_order() {
        let (a, b) = pair();

        // "slow" parks its sink until "fast" has been answered.
        let (gate_tx, gate_rx) = oneshot::channel::<()>();
        let gate = Mutex::new(Some(gate_rx));
        a.install(
            "slow",
            Arc::new(move |_req, reply| {
                let gate = gate.lock().unwrap().take();
                tokio::spawn(async move {
                    if let Some(gate) = gate {
                        let _ = gate.await;
                    }
                    reply.resolve(json!("slow"));
                });
            }),
        );
        a.install(
            "fast",
            Arc::new(|_req, reply| {
                reply.resolve(json!("fast"));
            }),
        );

        let b_slow = Arc::clone(&b);
        let slow = tokio::spawn(async move { b_slow.call("slow", vec![]).await });
        let fast = b.call("fast", vec![]).await.unwrap();
        assert_eq!(fast, json!("fast"));

        gate_tx.send(()).unwrap();
        let slow = slow.await.unwrap().unwrap();
        assert_eq!(slow, json!("slow"));
    }

    #[tokio::test]
    async fn test_destroy_drains_in_flight_calls() {
        let (a, b) = pair();

        // Handler that never replies.
        a.install(
            "stall",
            Arc::new(|_req, reply| {
                std::mem::forget(reply);
            }),
        );

        let b_call = Arc::clone(&b);
        let call = tokio::spawn(async move { b_call.call("stall", vec![]).await });
        tokio::time::sleep(Duration::from_millis(50)).await;

        b.destroy();
        let outcome = timeout(Duration::from_secs(5), call)
            .await
            .expect("in-flight call must not hang after destroy")
            .unwrap();
        assert!(matches!(outcome, Err(SwarmError::PeerUnavailable(_))));
    }

    #[tokio::test]
    async fn test_peer_stream_eof_closes_channel() {
        let (a, b) = pair();
        a.destroy();

        let mut closed = b.closed();
        timeout(Duration::from_secs(5), async {
            while !*closed.borrow() {
                if closed.changed().await.is_err() {
                    break;
                }
            }
        })
        .await
        .expect("peer destroy must propagate as close");
        assert!(b.is_closed());
    }

    #[tokio::test]
    async fn test_oversized_frame_length_kills_connection() {
        let (stream, far) = tokio::io::duplex(64 * 1024);
        let channel = JsonCodec.channel(Box::new(stream));

        // Hand-write a length header past the limit.
        let (_far_read, mut far_write) = tokio::io::split(far);
        far_write
            .write_all(&(MAX_FRAME_SIZE + 1).to_be_bytes())
            .await
            .unwrap();
        far_write.flush().await.unwrap();

        let mut closed = channel.closed();
        timeout(Duration::from_secs(5), async {
            while !*closed.borrow() {
                if closed.changed().await.is_err() {
                    break;
                }
            }
        })
        .await
        .expect("oversized frame must close the channel");
    }

    #[tokio::test]
    async fn test_dropped_reply_sink_reports_handler_fault() {
        let (a, b) = pair();
        a.install(
            "broken",
            Arc::new(|_req, reply| {
                drop(reply);
            }),
        );

        let err = b.call("broken", vec![]).await.unwrap_err();
        match err {
            SwarmError::Remote(msg) => assert!(msg.contains("dropped its reply")),
            other => panic!("expected Remote, got {other:?}"),
        }
    }
}
