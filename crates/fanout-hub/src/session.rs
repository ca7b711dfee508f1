use crate::callbacks::{run_guarded, HubCallbacks};
use crate::config::HubOptions;
use crate::hub::Hub;
use axum::extract::ws::{Message, WebSocket};
use bytes::Bytes;
use fanout_protocol::Envelope;
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

pub type SessionId = Uuid;

/// One live duplex session's identity and outbound queue.
///
/// `recipient_id == 0` means unauthenticated: the session counts toward
/// `Hub::client_count` but never appears in `Hub::by_recipient`.
///
/// `Session` is moved into the Hub on `register` — the Hub is the sole owner
/// of the `Sender` half from that point on, so dropping the registry entry
/// on `unregister` is exactly what closes the queue (the write loop's
/// `Receiver` then sees the channel end and exits).
pub struct Session {
    pub id: SessionId,
    pub recipient_id: u64,
    pub(crate) sender: mpsc::Sender<Bytes>,
}

/// The consumer half of a Session's outbound queue, held by whoever drives
/// `run_write` for this session.
pub struct SessionQueue(pub(crate) mpsc::Receiver<Bytes>);

impl SessionQueue {
    #[cfg(test)]
    pub(crate) fn try_recv(&mut self) -> Result<Bytes, mpsc::error::TryRecvError> {
        self.0.try_recv()
    }
}

impl Session {
    #[must_use]
    pub fn new(recipient_id: u64, send_buffer: usize) -> (Self, SessionQueue) {
        let (sender, receiver) = mpsc::channel(send_buffer);
        (
            Self {
                id: Uuid::new_v4(),
                recipient_id,
                sender,
            },
            SessionQueue(receiver),
        )
    }

    /// Non-blocking attempt to place `bytes` on the outbound queue. On
    /// queue-full the envelope is dropped — never blocks, never retries,
    /// never panics. This is the back-pressure boundary: one slow consumer
    /// never stalls fan-out to everyone else.
    pub(crate) fn enqueue(&self, bytes: Bytes) -> bool {
        match self.sender.try_send(bytes) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(recipient_id = self.recipient_id, "send queue full, dropping envelope");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }
}

/// Drive one session's read loop, write loop, and heartbeat end to end.
///
/// Registers with `hub` first, then races the read and write loops: whichever
/// exits first (socket error, peer close, read-timeout deadline, or a failed
/// write) wins, the other is cancelled, and the session is unregistered
/// exactly once.
pub async fn run_session<C: HubCallbacks>(
    socket: WebSocket,
    recipient_id: u64,
    hub: Hub,
    callbacks: Arc<C>,
    options: HubOptions,
) {
    let (session, queue) = Session::new(recipient_id, options.send_buffer);
    let id = session.id;
    hub.register(session).await;
    run_guarded("on_connect", {
        let callbacks = callbacks.clone();
        async move { callbacks.on_connect(recipient_id).await }
    })
    .await;

    let (sink, stream) = socket.split();
    tokio::select! {
        _ = run_read(stream, id, recipient_id, hub.clone(), callbacks.clone(), options) => {}
        _ = run_write(sink, queue, options) => {}
    }

    hub.unregister(id).await;
    run_guarded("on_disconnect", async move { callbacks.on_disconnect(recipient_id).await }).await;
}

async fn run_read<C: HubCallbacks>(
    mut stream: futures_util::stream::SplitStream<WebSocket>,
    id: SessionId,
    recipient_id: u64,
    hub: Hub,
    callbacks: Arc<C>,
    options: HubOptions,
) {
    loop {
        let next = tokio::time::timeout(options.read_timeout, stream.next()).await;
        let frame = match next {
            Ok(frame) => frame,
            Err(_) => {
                debug!(recipient_id, "read deadline elapsed, disconnecting");
                return;
            }
        };
        match frame {
            None => return,
            Some(Err(_)) => return,
            Some(Ok(Message::Close(_))) => return,
            Some(Ok(Message::Ping(data))) => {
                // Best-effort: we don't have a write lock to the sink here
                // (it's owned by run_write), so replying is the write loop's
                // job in the general case. Answering inline would require a
                // shared sink; since the Hub is server-driven (it pings, the
                // peer pongs), an inbound ping from the peer is rare and
                // tolerating it without a reply is acceptable here.
                let _ = data;
            }
            Some(Ok(Message::Pong(_))) => {
                // The read deadline resets every loop iteration regardless;
                // receiving the frame at all is what matters.
            }
            Some(Ok(Message::Text(text))) => {
                handle_inbound(text.as_bytes(), recipient_id, &hub, &callbacks).await;
            }
            Some(Ok(Message::Binary(data))) => {
                handle_inbound(&data, recipient_id, &hub, &callbacks).await;
            }
        }
        let _ = id;
    }
}

async fn handle_inbound<C: HubCallbacks>(
    bytes: &[u8],
    recipient_id: u64,
    hub: &Hub,
    callbacks: &Arc<C>,
) {
    match Envelope::parse(bytes) {
        Ok(envelope) => {
            let _ = hub;
            run_guarded("on_message", {
                let callbacks = callbacks.clone();
                let envelope = envelope.clone();
                async move { callbacks.on_message(recipient_id, &envelope).await }
            })
            .await;
        }
        Err(err) => {
            warn!(recipient_id, error = %err, "malformed envelope, continuing read loop");
        }
    }
}

async fn run_write(
    mut sink: futures_util::stream::SplitSink<WebSocket, Message>,
    mut queue: SessionQueue,
    options: HubOptions,
) {
    let mut ticker = tokio::time::interval(options.ping_interval);
    ticker.tick().await; // first tick fires immediately; skip it

    loop {
        tokio::select! {
            item = queue.0.recv() => {
                match item {
                    Some(bytes) => {
                        let text = String::from_utf8_lossy(&bytes).into_owned();
                        let write = tokio::time::timeout(options.write_timeout, sink.send(Message::Text(text.into()))).await;
                        if !matches!(write, Ok(Ok(()))) {
                            return;
                        }
                    }
                    None => {
                        let _ = tokio::time::timeout(options.write_timeout, sink.send(Message::Close(None))).await;
                        return;
                    }
                }
            }
            _ = ticker.tick() => {
                let write = tokio::time::timeout(options.write_timeout, sink.send(Message::Ping(Bytes::new()))).await;
                if !matches!(write, Ok(Ok(()))) {
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn enqueue_succeeds_until_buffer_is_full() {
        let (session, _queue) = Session::new(1, 2);
        assert!(session.enqueue(Bytes::from_static(b"a")));
        assert!(session.enqueue(Bytes::from_static(b"b")));
        assert!(!session.enqueue(Bytes::from_static(b"c")));
    }

    #[tokio::test]
    async fn enqueue_on_closed_queue_returns_false() {
        let (session, queue) = Session::new(1, 4);
        drop(queue);
        assert!(!session.enqueue(Bytes::from_static(b"a")));
    }

    #[tokio::test]
    async fn dropping_queue_consumer_does_not_panic_subsequent_enqueues() {
        let (session, queue) = Session::new(1, 1);
        assert!(session.enqueue(Bytes::from_static(b"a")));
        drop(queue);
        assert!(!session.enqueue(Bytes::from_static(b"b")));
    }
}
