use crate::bridge::{run_subscriber, BridgeState, ClusterBridge};
use crate::session::{Session, SessionId};
use bytes::Bytes;
use fanout_bus::{Bus, BusError};
use fanout_protocol::Envelope;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

#[derive(Default)]
struct Registry {
    /// Every live session, keyed by its own id. Sole owner of each `Session`
    /// (and therefore of the `Sender` half of its queue) from `register`
    /// until `unregister` drops the entry.
    sessions: HashMap<SessionId, Session>,
    /// Index from authenticated recipient to the set of sessions currently
    /// fanning out to it. A recipient with no entry here is either
    /// unauthenticated (`recipient_id == 0`) or not connected.
    by_recipient: HashMap<u64, Vec<SessionId>>,
}

struct Inner {
    registry: RwLock<Registry>,
    /// `None` in local mode, `Some` once `enable_cluster` has run. The
    /// transition is one-way per Hub instance.
    bridge: RwLock<Option<BridgeState>>,
}

/// The Connection Hub: single source of truth for "who is connected right
/// now", the fan-out point for local delivery, and (once `enable_cluster`
/// has been called) the cluster-mode publish boundary.
///
/// All registry mutation happens through `Hub`'s own methods, which take the
/// write lock only for the HashMap operations themselves — nothing awaits
/// while holding it. Reads (presence checks, broadcast) take the read lock.
/// This is the single-writer-many-readers registry pattern: there's no
/// separate event-loop task driving mutation, since `tokio::sync::RwLock`
/// already serializes `register`/`unregister` callers safely.
#[derive(Clone)]
pub struct Hub {
    inner: Arc<Inner>,
}

impl Hub {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                registry: RwLock::new(Registry::default()),
                bridge: RwLock::new(None),
            }),
        }
    }

    pub(crate) async fn register(&self, session: Session) {
        let id = session.id;
        let recipient_id = session.recipient_id;
        let mut registry = self.inner.registry.write().await;
        registry.sessions.insert(id, session);
        if recipient_id != 0 {
            registry.by_recipient.entry(recipient_id).or_default().push(id);
        }
        debug!(recipient_id, session = %id, "session registered");
    }

    /// Idempotent: unregistering a session id that is absent (already
    /// unregistered, or never registered) is a no-op.
    pub(crate) async fn unregister(&self, id: SessionId) {
        let mut registry = self.inner.registry.write().await;
        if let Some(session) = registry.sessions.remove(&id) {
            if session.recipient_id != 0 {
                if let Some(ids) = registry.by_recipient.get_mut(&session.recipient_id) {
                    ids.retain(|candidate| *candidate != id);
                    if ids.is_empty() {
                        registry.by_recipient.remove(&session.recipient_id);
                    }
                }
            }
            debug!(recipient_id = session.recipient_id, session = %id, "session unregistered");
        }
    }

    /// Total connected sessions, authenticated or not.
    pub async fn client_count(&self) -> usize {
        self.inner.registry.read().await.sessions.len()
    }

    /// Number of distinct authenticated recipients currently online.
    pub async fn recipient_count(&self) -> usize {
        self.inner.registry.read().await.by_recipient.len()
    }

    /// Whether `recipient_id` currently has at least one live session.
    pub async fn is_online(&self, recipient_id: u64) -> bool {
        self.inner.registry.read().await.by_recipient.contains_key(&recipient_id)
    }

    /// Number of live sessions for `recipient_id` (0 if offline).
    pub async fn sessions_of(&self, recipient_id: u64) -> usize {
        self.inner
            .registry
            .read()
            .await
            .by_recipient
            .get(&recipient_id)
            .map_or(0, Vec::len)
    }

    /// Enqueue `envelope` onto every currently registered session: a
    /// snapshot of `sessions` is taken under the shared lock, the lock is
    /// released, and only then do we attempt delivery — so a broadcast
    /// never holds the registry lock across per-session queue pressure.
    /// Returns the number of sessions it was successfully queued to;
    /// queue-full drops don't count, and are logged once in aggregate for
    /// the whole call rather than per session.
    pub async fn broadcast(&self, envelope: &Envelope) -> usize {
        let bytes = envelope.encode();
        let registry = self.inner.registry.read().await;
        let (delivered, attempted) = fan_out(&registry.sessions, registry.sessions.keys(), &bytes);
        drop(registry);
        log_drops(attempted, delivered, &envelope.kind);
        delivered
    }

    /// Look up every session registered for `recipient_id` and enqueue
    /// `envelope` onto each. Returns `true` iff `recipient_id` had at least
    /// one matching session — regardless of whether the enqueue onto it
    /// actually succeeded, a full send queue still counts as "found".
    pub async fn send_to_recipient(&self, recipient_id: u64, envelope: &Envelope) -> bool {
        let bytes = envelope.encode();
        let registry = self.inner.registry.read().await;
        let Some(ids) = registry.by_recipient.get(&recipient_id) else {
            return false;
        };
        let (delivered, attempted) = fan_out(&registry.sessions, ids.iter(), &bytes);
        drop(registry);
        log_drops(attempted, delivered, &envelope.kind);
        true
    }

    /// Deliver an already-built envelope to local sessions only: `broadcast`
    /// when `user_id` is absent, `send_to_recipient` otherwise. This is the
    /// terminal local-delivery step both `Hub::publish` (local mode) and the
    /// Cluster Bridge subscriber (cluster mode, on every node) funnel
    /// through, so a message looks the same to a Session regardless of where
    /// it originated.
    ///
    /// Returns the number of sessions the envelope was successfully queued
    /// to.
    pub async fn deliver_local(&self, envelope: &Envelope) -> usize {
        if envelope.is_broadcast() {
            return self.broadcast(envelope).await;
        }
        let bytes = envelope.encode();
        let registry = self.inner.registry.read().await;
        let delivered = match registry.by_recipient.get(&envelope.recipient) {
            Some(ids) => fan_out(&registry.sessions, ids.iter(), &bytes).0,
            None => 0,
        };
        drop(registry);
        delivered
    }

    /// Unregister every currently registered session: drops its `Session`
    /// (and therefore the `Sender` half of its outbound queue), which is
    /// what causes its write loop to exit and, once the socket halves are
    /// dropped in turn, its read loop. Used by the lifecycle glue to drain
    /// all live connections on shutdown before the process exits.
    pub async fn unregister_all(&self) {
        let mut registry = self.inner.registry.write().await;
        let count = registry.sessions.len();
        registry.sessions.clear();
        registry.by_recipient.clear();
        if count > 0 {
            debug!(count, "hub shut down, unregistered all sessions");
        }
    }

    /// Publish contract: in local mode, deliver locally and return `Ok`
    /// unconditionally; in cluster mode, encode and publish to the bus
    /// instead (the local copy arrives back through this node's own
    /// subscriber, same as every other node's).
    pub async fn publish(&self, envelope: &Envelope) -> Result<(), BusError> {
        let bridge = self.inner.bridge.read().await;
        match bridge.as_ref() {
            None => {
                self.deliver_local(envelope).await;
                Ok(())
            }
            Some(state) => state.bus.publish(&state.channel, envelope.encode()).await,
        }
    }

    /// `publish`, but first re-addresses the envelope to `recipient_id`.
    pub async fn publish_to_recipient(
        &self,
        recipient_id: u64,
        envelope: Envelope,
    ) -> Result<(), BusError> {
        let envelope = envelope.with_recipient(recipient_id);
        self.publish(&envelope).await
    }

    /// Lifts this Hub from local mode into cluster mode: subscribes to
    /// `channel` on `bus` and spawns the subscriber task that feeds parsed
    /// envelopes back into `deliver_local`. Must be called after the Hub is
    /// otherwise ready to accept sessions; calling it twice on the same Hub
    /// is not supported and callers must not rely on any particular outcome
    /// if they do. `cancel` is the caller-owned lifecycle token — cancel it
    /// (or call `ClusterBridge::shutdown` on the returned handle) during
    /// shutdown to stop the subscriber task.
    pub async fn enable_cluster(
        &self,
        bus: Arc<dyn Bus>,
        channel: impl Into<String>,
        cancel: CancellationToken,
    ) -> Result<ClusterBridge, BusError> {
        let channel = channel.into();
        let subscription = bus.subscribe(&channel).await?;
        tokio::spawn(run_subscriber(subscription, self.clone(), cancel.clone()));
        *self.inner.bridge.write().await = Some(BridgeState { bus, channel: channel.clone() });
        debug!(channel, "hub entered cluster mode");
        Ok(ClusterBridge::new(channel, cancel))
    }
}

/// Log the aggregate drop count for one delivery attempt, once, rather than
/// per session — holding the registry lock across per-session logging would
/// defeat the point of releasing it before enqueueing.
fn log_drops(attempted: usize, delivered: usize, kind: &str) {
    let dropped = attempted - delivered;
    if dropped > 0 {
        warn!(dropped, kind = %kind, "dropped envelope(s) on full send queues");
    }
}

fn fan_out<'a>(
    sessions: &HashMap<SessionId, Session>,
    ids: impl Iterator<Item = &'a SessionId>,
    bytes: &Bytes,
) -> (usize, usize) {
    let mut delivered = 0;
    let mut attempted = 0;
    for id in ids {
        if let Some(session) = sessions.get(id) {
            attempted += 1;
            if session.enqueue(bytes.clone()) {
                delivered += 1;
            }
        }
    }
    (delivered, attempted)
}

impl Default for Hub {
    fn default() -> Self {
        Self::new()
    }
}
