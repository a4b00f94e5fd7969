//! Message dispatcher, per spec §4.4.
//!
//! Routes each inbound [`Message`] to request handlers (keyed by message type) or to
//! response handlers (keyed by `(peer, request_id)`), and exposes a `request`/
//! `request_nodes` API with per-call timeout and deadline-driven handler cleanup.

use bytes::Bytes;
use ethereum_types::H256;
use rand::RngCore;
use rustc_hash::FxHashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

use crate::discv5::messages::{Message, Nodes, MAX_NODES_MESSAGE_TOTAL};
use crate::error::{DiscoveryError, Result};

/// Default bound for per-subscriber inboxes, both request-type subscriptions and
/// response handlers. A slow subscriber applies backpressure to the dispatcher rather
/// than ever being silently dropped: `try_send` failures are logged and the message is
/// skipped for *that* subscriber only, per §9's documented-policy note.
const SUBSCRIPTION_CHANNEL_CAPACITY: usize = 32;

/// `request(...)` retries drawing a fresh request-id up to this many times before
/// giving up, per spec §4.4.
const MAX_REQUEST_ID_ATTEMPTS: u8 = 3;

const REQUEST_RESPONSE_TIMEOUT: Duration = Duration::from_secs(10);

type MessageTypeId = u8;

/// A handle to an active request-type subscription. Dropping it deregisters the
/// handler, honoring the "no orphaned subscription" guarantee of spec §5.
pub struct RequestSubscription {
    message_type: MessageTypeId,
    inner: Arc<Mutex<Inner>>,
    /// Yields `(sender, source address, message)`. The source address is the UDP
    /// address the session layer actually received the datagram from — needed by the
    /// routing-table manager's PING server to answer with the peer's observed endpoint.
    pub receiver: mpsc::Receiver<(H256, SocketAddr, Message)>,
}

impl Drop for RequestSubscription {
    // `Drop` can't be async, so this can't go through `tokio::sync::Mutex`; the lock is
    // held only for the duration of one hashmap removal and never across an await point.
    #[allow(clippy::unwrap_used)]
    fn drop(&mut self) {
        self.inner.lock().unwrap().request_handlers.remove(&self.message_type);
    }
}

/// A handle to an active response subscription for one `(peer, request_id)` pair.
pub struct ResponseSubscription {
    key: (H256, Bytes),
    inner: Arc<Mutex<Inner>>,
    pub receiver: mpsc::Receiver<Message>,
}

impl Drop for ResponseSubscription {
    #[allow(clippy::unwrap_used)]
    fn drop(&mut self) {
        self.inner.lock().unwrap().response_handlers.remove(&self.key);
    }
}

#[derive(Default)]
struct Inner {
    request_handlers: FxHashMap<MessageTypeId, mpsc::Sender<(H256, SocketAddr, Message)>>,
    response_handlers: FxHashMap<(H256, Bytes), mpsc::Sender<Message>>,
}

/// Sends an encoded message to a peer. Implemented by the session layer: dispatched
/// requests go out through the encrypted-session egress path, not raw UDP.
#[async_trait::async_trait]
pub trait OutboundSink: Send + Sync {
    async fn send_message(&self, peer: H256, message: Message) -> Result<()>;
}

/// The message dispatcher described in spec §4.4.
pub struct Dispatcher {
    inner: Arc<Mutex<Inner>>,
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl Dispatcher {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner::default())),
        }
    }

    /// Registers a handler for every inbound message of `message_type`. At most one
    /// handler may be registered per type at a time.
    #[allow(clippy::unwrap_used)]
    pub fn add_request_handler(&self, message_type: MessageTypeId) -> Result<RequestSubscription> {
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_CHANNEL_CAPACITY);
        let mut inner = self.inner.lock().unwrap();
        if inner.request_handlers.contains_key(&message_type) {
            return Err(DiscoveryError::HandlerAlreadyRegistered(message_type));
        }
        inner.request_handlers.insert(message_type, tx);
        drop(inner);
        Ok(RequestSubscription {
            message_type,
            inner: self.inner.clone(),
            receiver: rx,
        })
    }

    /// Registers a handler for inbound messages matching `(peer, request_id)`. Fails if
    /// one is already registered for that exact pair (spec §8's concurrent-request
    /// invariant).
    #[allow(clippy::unwrap_used)]
    pub fn add_response_handler(&self, peer: H256, request_id: Bytes) -> Result<ResponseSubscription> {
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_CHANNEL_CAPACITY);
        let key = (peer, request_id);
        let mut inner = self.inner.lock().unwrap();
        if inner.response_handlers.contains_key(&key) {
            return Err(DiscoveryError::DuplicateResponseHandler {
                node_id: format!("{peer:#x}"),
            });
        }
        inner.response_handlers.insert(key.clone(), tx);
        drop(inner);
        Ok(ResponseSubscription {
            key,
            inner: self.inner.clone(),
            receiver: rx,
        })
    }

    /// Draws a request-id not in use by any live response handler for `peer`.
    #[allow(clippy::unwrap_used)]
    pub fn get_free_request_id(&self, peer: H256) -> Result<Bytes> {
        let inner = self.inner.lock().unwrap();
        let mut rng = rand::thread_rng();
        for _ in 0..MAX_REQUEST_ID_ATTEMPTS {
            let candidate = Bytes::copy_from_slice(&rng.next_u64().to_be_bytes());
            if !inner.response_handlers.contains_key(&(peer, candidate.clone())) {
                return Ok(candidate);
            }
        }
        Err(DiscoveryError::ExhaustedRequestIds {
            node_id: format!("{peer:#x}"),
        })
    }

    /// Dispatches one inbound message. Delivers it to the registered request handler
    /// (if any) and/or response handler (if any); both may fire. Neither firing is a
    /// silent drop. `from` is the UDP address the session layer actually received the
    /// datagram from.
    #[allow(clippy::unwrap_used)]
    pub async fn dispatch_inbound(&self, sender: H256, from: SocketAddr, message: Message) {
        let message_type = message.type_id();
        let request_id = message.request_id().clone();

        let request_tx = {
            let inner = self.inner.lock().unwrap();
            inner.request_handlers.get(&message_type).cloned()
        };
        let response_tx = {
            let inner = self.inner.lock().unwrap();
            inner.response_handlers.get(&(sender, request_id)).cloned()
        };

        if request_tx.is_none() && response_tx.is_none() {
            tracing::trace!(from = %sender, %message, "dropped inbound message with no matching handler");
            return;
        }
        if let Some(tx) = request_tx {
            if tx.send((sender, from, message.clone())).await.is_err() {
                tracing::debug!(from = %sender, "request handler subscription closed");
            }
        }
        if let Some(tx) = response_tx {
            if tx.send(message).await.is_err() {
                tracing::debug!(from = %sender, "response handler subscription closed");
            }
        }
    }

    /// Sends `msg` to `peer` via `sink` and awaits the first response matching
    /// `msg.request_id()`, subject to [`REQUEST_RESPONSE_TIMEOUT`].
    pub async fn request(
        &self,
        sink: &dyn OutboundSink,
        peer: H256,
        msg: Message,
    ) -> Result<Message> {
        let request_id = msg.request_id().clone();
        let mut subscription = self.add_response_handler(peer, request_id)?;
        sink.send_message(peer, msg).await?;

        match tokio::time::timeout(REQUEST_RESPONSE_TIMEOUT, subscription.receiver.recv()).await {
            Ok(Some(response)) => Ok(response),
            Ok(None) | Err(_) => Err(DiscoveryError::RequestTimeout {
                node_id: format!("{peer:#x}"),
            }),
            // `subscription` drops here regardless of branch, deregistering the handler.
        }
    }

    /// Like [`request`](Self::request), but expects a (possibly fragmented) `NODES`
    /// response: reads `total` from the first fragment, bounds it by
    /// [`MAX_NODES_MESSAGE_TOTAL`], and collects that many fragments in order.
    pub async fn request_nodes(&self, sink: &dyn OutboundSink, peer: H256, msg: Message) -> Result<Nodes> {
        let request_id = msg.request_id().clone();
        let mut subscription = self.add_response_handler(peer, request_id)?;
        sink.send_message(peer, msg).await?;

        let first = recv_with_timeout(&mut subscription.receiver).await?;
        let Message::Nodes(mut accumulated) = first else {
            return Err(DiscoveryError::UnexpectedMessage(format!(
                "expected NODES, got {first}"
            )));
        };
        if accumulated.total > MAX_NODES_MESSAGE_TOTAL {
            return Err(DiscoveryError::UnexpectedMessage(format!(
                "NODES total {} exceeds MAX_NODES_MESSAGE_TOTAL",
                accumulated.total
            )));
        }

        for _ in 1..accumulated.total {
            let next = recv_with_timeout(&mut subscription.receiver).await?;
            let Message::Nodes(fragment) = next else {
                return Err(DiscoveryError::UnexpectedMessage(format!(
                    "expected NODES fragment, got {next}"
                )));
            };
            accumulated.enrs.extend(fragment.enrs);
        }
        Ok(accumulated)
    }
}

async fn recv_with_timeout(receiver: &mut mpsc::Receiver<Message>) -> Result<Message> {
    match tokio::time::timeout(REQUEST_RESPONSE_TIMEOUT, receiver.recv()).await {
        Ok(Some(message)) => Ok(message),
        Ok(None) | Err(_) => Err(DiscoveryError::RequestTimeout {
            node_id: String::new(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discv5::messages::Ping;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct RecordingSink {
        sent: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl OutboundSink for RecordingSink {
        async fn send_message(&self, _peer: H256, _message: Message) -> Result<()> {
            self.sent.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[test]
    fn duplicate_request_handler_registration_fails() {
        let dispatcher = Dispatcher::new();
        let _first = dispatcher.add_request_handler(crate::discv5::messages::PING_ID).unwrap();
        let second = dispatcher.add_request_handler(crate::discv5::messages::PING_ID);
        assert!(matches!(second, Err(DiscoveryError::HandlerAlreadyRegistered(_))));
    }

    #[test]
    fn dropping_subscription_frees_the_slot() {
        let dispatcher = Dispatcher::new();
        {
            let _sub = dispatcher.add_request_handler(crate::discv5::messages::PING_ID).unwrap();
        }
        let second = dispatcher.add_request_handler(crate::discv5::messages::PING_ID);
        assert!(second.is_ok());
    }

    #[tokio::test]
    async fn request_times_out_and_releases_handler() {
        let dispatcher = Dispatcher::new();
        let sink = RecordingSink { sent: AtomicUsize::new(0) };
        let peer = H256::from_low_u64_be(1);
        let msg = Message::Ping(Ping {
            request_id: Bytes::from_static(&[1, 2, 3, 4]),
            enr_seq: 0,
        });

        let result = tokio::time::timeout(Duration::from_millis(50), dispatcher.request(&sink, peer, msg)).await;
        // The outer 50ms timeout fires well before the dispatcher's 10s one,
        // cancelling the `request` future; its `ResponseSubscription` must still
        // deregister via Drop.
        assert!(result.is_err());
        assert_eq!(sink.sent.load(Ordering::SeqCst), 1);

        let inner = dispatcher.inner.lock().unwrap();
        assert!(inner.response_handlers.is_empty());
    }

    #[tokio::test]
    async fn concurrent_requests_with_same_id_only_one_registers() {
        let dispatcher = Dispatcher::new();
        let peer = H256::from_low_u64_be(7);
        let request_id = Bytes::from_static(&[9]);
        let _first = dispatcher.add_response_handler(peer, request_id.clone()).unwrap();
        let second = dispatcher.add_response_handler(peer, request_id);
        assert!(matches!(second, Err(DiscoveryError::DuplicateResponseHandler { .. })));
    }
}
