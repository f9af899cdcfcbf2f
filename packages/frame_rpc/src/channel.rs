//! Channel: request/response RPC between exactly two contexts.
//!
//! Built on the fire-and-forget [`Context::post_message`]. Every request
//! carries a sequence number unique for the channel's lifetime; responses are
//! matched to requests by that number alone, never by arrival order.
//!
//! Envelopes:
//!
//! ```text
//! request:  { protocol: "frame-rpc", version, sequence, method, arguments }
//! response: { protocol: "frame-rpc", version, response: sequence, arguments }
//! ```

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::context::{Context, ContextId, Listener, ListenerId, MessageEvent, WILDCARD_ORIGIN};
use crate::error::ChannelError;

pub const PROTOCOL: &str = "frame-rpc";
pub const VERSION: &str = "1.0.0";

/// Wire envelope for both requests and responses.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub protocol: String,
    #[serde(default)]
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sequence: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<u64>,
    pub arguments: Vec<Value>,
}

impl Envelope {
    pub fn request(sequence: u64, method: &str, arguments: Vec<Value>) -> Self {
        Self {
            protocol: PROTOCOL.to_string(),
            version: VERSION.to_string(),
            sequence: Some(sequence),
            method: Some(method.to_string()),
            response: None,
            arguments,
        }
    }

    pub fn response(sequence: u64, arguments: Vec<Value>) -> Self {
        Self {
            protocol: PROTOCOL.to_string(),
            version: VERSION.to_string(),
            sequence: None,
            method: None,
            response: Some(sequence),
            arguments,
        }
    }

    /// Decode a posted value. Anything without the protocol tag or an
    /// `arguments` array is not ours.
    pub fn decode(data: &Value) -> Option<Self> {
        let object = data.as_object()?;
        if object.get("protocol")?.as_str()? != PROTOCOL || !object.get("arguments")?.is_array() {
            return None;
        }
        serde_json::from_value(data.clone()).ok()
    }

    pub fn encode(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// Identifies who is calling a locally exposed method.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallContext {
    pub peer: ContextId,
    pub method: String,
}

/// Locally exposed method. Receives the caller, the call arguments and a
/// [`Responder`] that may be used (once) to reply.
pub type Handler = Arc<dyn Fn(CallContext, Vec<Value>, Responder) + Send + Sync>;

pub type MethodTable = HashMap<String, Handler>;

pub fn handler<F>(f: F) -> Handler
where
    F: Fn(CallContext, Vec<Value>, Responder) + Send + Sync + 'static,
{
    Arc::new(f)
}

/// The synthesized final "reply" argument of an incoming call.
///
/// Replies follow the `(err, result)` argument convention: [`Responder::ok`]
/// sends `[null, result]`, [`Responder::err`] sends `[error]`.
pub struct Responder {
    channel: Channel,
    sequence: Option<u64>,
}

impl Responder {
    pub fn send(self, arguments: Vec<Value>) {
        let Some(sequence) = self.sequence else {
            return;
        };
        if self.channel.is_destroyed() {
            return;
        }
        let envelope = Envelope::response(sequence, arguments);
        if let Err(e) = self.channel.post(envelope) {
            debug!(peer = %self.channel.dst(), seq = sequence, error = %e, "reply not delivered");
        }
    }

    pub fn ok(self, result: Value) {
        self.send(vec![Value::Null, result]);
    }

    /// Acknowledge with no error and no result.
    pub fn done(self) {
        self.send(Vec::new());
    }

    pub fn err(self, error: impl Into<String>) {
        self.send(vec![Value::String(error.into())]);
    }
}

/// `scheme://host[:port]`, or the wildcard.
pub fn normalize_origin(origin: &str) -> String {
    if origin == WILDCARD_ORIGIN {
        return origin.to_string();
    }
    match origin.find("://") {
        Some(idx) => {
            let rest = &origin[idx + 3..];
            let host_end = rest.find(['/', '?', '#']).unwrap_or(rest.len());
            format!("{}{}", &origin[..idx + 3], &rest[..host_end])
        }
        None => origin.to_string(),
    }
}

struct ChannelState {
    sequence: u64,
    pending: HashMap<u64, oneshot::Sender<Vec<Value>>>,
    methods: MethodTable,
    destroyed: bool,
    listener: Option<ListenerId>,
}

struct ChannelInner {
    src: Context,
    dst: ContextId,
    origin: String,
    state: Mutex<ChannelState>,
    cancel: CancellationToken,
}

/// One end of an RPC link. Cheap to clone; all clones share state.
#[derive(Clone)]
pub struct Channel {
    inner: Arc<ChannelInner>,
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("src", &self.inner.src.id())
            .field("dst", &self.inner.dst)
            .field("origin", &self.inner.origin)
            .finish()
    }
}

impl PartialEq for Channel {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

/// Non-owning handle, for handlers that refer back to their own channel.
#[derive(Clone)]
pub struct WeakChannel {
    inner: Weak<ChannelInner>,
}

impl WeakChannel {
    pub fn upgrade(&self) -> Option<Channel> {
        self.inner.upgrade().map(|inner| Channel { inner })
    }
}

impl Channel {
    /// Open a channel from `src` to `dst`, exposing `methods` to the peer.
    /// Must be called inside a tokio runtime.
    pub fn new(
        src: Context,
        dst: ContextId,
        origin: &str,
        methods: MethodTable,
    ) -> Result<Self, ChannelError> {
        Self::with_methods(src, dst, origin, |_| methods)
    }

    /// Like [`Channel::new`], for handlers that need to call back into the
    /// channel they are registered on.
    pub fn with_methods<F>(
        src: Context,
        dst: ContextId,
        origin: &str,
        methods: F,
    ) -> Result<Self, ChannelError>
    where
        F: FnOnce(&Channel) -> MethodTable,
    {
        let listener = src.add_listener()?;
        let channel = Channel {
            inner: Arc::new(ChannelInner {
                src,
                dst,
                origin: normalize_origin(origin),
                state: Mutex::new(ChannelState {
                    sequence: 0,
                    pending: HashMap::new(),
                    methods: HashMap::new(),
                    destroyed: false,
                    listener: Some(listener.id()),
                }),
                cancel: CancellationToken::new(),
            }),
        };
        let table = methods(&channel);
        channel.lock().methods = table;

        tokio::spawn(run_listener(channel.clone(), listener));
        trace!(src = %channel.src().id(), dst = %dst, "channel opened");
        Ok(channel)
    }

    fn lock(&self) -> MutexGuard<'_, ChannelState> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn downgrade(&self) -> WeakChannel {
        WeakChannel {
            inner: Arc::downgrade(&self.inner),
        }
    }

    pub fn src(&self) -> &Context {
        &self.inner.src
    }

    pub fn dst(&self) -> ContextId {
        self.inner.dst
    }

    pub fn origin(&self) -> &str {
        &self.inner.origin
    }

    pub fn is_destroyed(&self) -> bool {
        self.lock().destroyed
    }

    /// Number of requests still waiting for a response.
    pub fn pending_count(&self) -> usize {
        self.lock().pending.len()
    }

    pub fn has_method(&self, method: &str) -> bool {
        self.lock().methods.contains_key(method)
    }

    pub fn add_method(&self, method: &str, handler: Handler) {
        let mut state = self.lock();
        if !state.destroyed {
            state.methods.insert(method.to_string(), handler);
        }
    }

    pub fn remove_method(&self, method: &str) {
        self.lock().methods.remove(method);
    }

    fn next_sequence(&self) -> Option<u64> {
        let mut state = self.lock();
        if state.destroyed {
            return None;
        }
        let sequence = state.sequence;
        state.sequence += 1;
        Some(sequence)
    }

    fn post(&self, envelope: Envelope) -> Result<(), ChannelError> {
        self.inner
            .src
            .post_message(self.inner.dst, envelope.encode(), &self.inner.origin)?;
        Ok(())
    }

    /// Fire-and-forget call. A no-op once the channel is destroyed.
    pub fn call(&self, method: &str, arguments: Vec<Value>) -> Result<(), ChannelError> {
        let Some(sequence) = self.next_sequence() else {
            return Ok(());
        };
        trace!(dst = %self.inner.dst, method, seq = sequence, "rpc call");
        self.post(Envelope::request(sequence, method, arguments))
    }

    /// Call `method` and register for its response. The receiver yields the
    /// reply's arguments, or an error if the channel is destroyed first.
    pub fn request(
        &self,
        method: &str,
        arguments: Vec<Value>,
    ) -> Result<oneshot::Receiver<Vec<Value>>, ChannelError> {
        let (tx, rx) = oneshot::channel();
        let sequence = {
            let mut state = self.lock();
            if state.destroyed {
                return Err(ChannelError::Destroyed);
            }
            let sequence = state.sequence;
            state.sequence += 1;
            state.pending.insert(sequence, tx);
            sequence
        };

        trace!(dst = %self.inner.dst, method, seq = sequence, "rpc request");
        if let Err(e) = self.post(Envelope::request(sequence, method, arguments)) {
            self.lock().pending.remove(&sequence);
            return Err(e);
        }
        Ok(rx)
    }

    /// Disconnect. Idempotent. Pending requests are dropped and no further
    /// messages are sent or handled.
    pub fn destroy(&self) {
        let listener = {
            let mut state = self.lock();
            if state.destroyed {
                return;
            }
            state.destroyed = true;
            state.pending.clear();
            state.methods.clear();
            state.listener.take()
        };
        self.inner.cancel.cancel();
        if let Some(listener) = listener {
            self.inner.src.remove_listener(listener);
        }
        debug!(src = %self.inner.src.id(), dst = %self.inner.dst, "channel destroyed");
    }

    fn handle(&self, event: MessageEvent) {
        if event.source != self.inner.dst
            || (self.inner.origin != WILDCARD_ORIGIN && event.origin != self.inner.origin)
        {
            return;
        }
        let Some(envelope) = Envelope::decode(&event.data) else {
            return;
        };

        if let Some(method) = envelope.method {
            let handler = {
                let state = self.lock();
                if state.destroyed {
                    return;
                }
                state.methods.get(&method).cloned()
            };
            let Some(handler) = handler else {
                trace!(peer = %self.inner.dst, method, "no handler registered");
                return;
            };
            let responder = Responder {
                channel: self.clone(),
                sequence: envelope.sequence,
            };
            let ctx = CallContext {
                peer: self.inner.dst,
                method,
            };
            handler(ctx, envelope.arguments, responder);
        } else if let Some(sequence) = envelope.response {
            let waiter = {
                let mut state = self.lock();
                if state.destroyed {
                    return;
                }
                state.pending.remove(&sequence)
            };
            match waiter {
                Some(tx) => {
                    let _ = tx.send(envelope.arguments);
                }
                None => trace!(peer = %self.inner.dst, seq = sequence, "unmatched response"),
            }
        }
    }
}

async fn run_listener(channel: Channel, mut listener: Listener) {
    let cancel = channel.inner.cancel.clone();
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            event = listener.recv() => match event {
                Some(event) => channel.handle(event),
                None => break,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ContextTree;
    use serde_json::json;
    use std::time::Duration;
    use tokio::time::timeout;

    fn pair() -> (Context, Context) {
        let tree = ContextTree::new();
        let a = tree.create_top("https://a.example");
        let b = a.create_child("https://b.example");
        (a, b)
    }

    async fn recv_envelope(listener: &mut Listener) -> Envelope {
        let event = timeout(Duration::from_secs(1), listener.recv())
            .await
            .unwrap()
            .unwrap();
        Envelope::decode(&event.data).unwrap()
    }

    #[test]
    fn normalizes_origins() {
        assert_eq!(normalize_origin("*"), "*");
        assert_eq!(
            normalize_origin("https://example.com:8080/path?q=1"),
            "https://example.com:8080"
        );
        assert_eq!(normalize_origin("http://example.com"), "http://example.com");
    }

    #[test]
    fn decode_rejects_foreign_messages() {
        assert!(Envelope::decode(&json!("__cross_frame_dhcp_offer")).is_none());
        assert!(Envelope::decode(&json!({"protocol": "other", "arguments": []})).is_none());
        assert!(Envelope::decode(&json!({"protocol": "frame-rpc", "arguments": 1})).is_none());
        assert!(Envelope::decode(&json!({"protocol": "frame-rpc"})).is_none());
        assert_eq!(
            Envelope::decode(&json!({"protocol": "frame-rpc", "response": 3, "arguments": [1]})),
            Some(Envelope {
                version: String::new(),
                ..Envelope::response(3, vec![json!(1)])
            })
        );
    }

    #[tokio::test]
    async fn sequence_numbers_never_repeat() {
        let (a, b) = pair();
        let mut inbox = b.add_listener().unwrap();
        let channel = Channel::new(a, b.id(), "*", MethodTable::new()).unwrap();

        channel.call("one", vec![]).unwrap();
        let _rx = channel.request("two", vec![]).unwrap();
        channel.call("three", vec![json!(3)]).unwrap();

        let mut seen = Vec::new();
        for _ in 0..3 {
            seen.push(recv_envelope(&mut inbox).await.sequence.unwrap());
        }
        assert_eq!(seen, vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn responses_matched_by_sequence_not_arrival_order() {
        let (a, b) = pair();
        let mut inbox = b.add_listener().unwrap();
        let channel = Channel::new(a.clone(), b.id(), "*", MethodTable::new()).unwrap();

        let first = channel.request("first", vec![]).unwrap();
        let second = channel.request("second", vec![]).unwrap();
        let req1 = recv_envelope(&mut inbox).await;
        let req2 = recv_envelope(&mut inbox).await;

        // Reply to the second request before the first.
        for (req, value) in [(&req2, "second-result"), (&req1, "first-result")] {
            let reply = Envelope::response(req.sequence.unwrap(), vec![json!(null), json!(value)]);
            b.post_message(a.id(), reply.encode(), "*").unwrap();
        }

        assert_eq!(first.await.unwrap(), vec![json!(null), json!("first-result")]);
        assert_eq!(second.await.unwrap(), vec![json!(null), json!("second-result")]);
        assert_eq!(channel.pending_count(), 0);
    }

    #[tokio::test]
    async fn invokes_handlers_and_replies() {
        let (a, b) = pair();
        let mut methods = MethodTable::new();
        methods.insert(
            "add".into(),
            handler(|ctx, args, reply| {
                assert_eq!(ctx.method, "add");
                let sum: i64 = args.iter().filter_map(Value::as_i64).sum();
                reply.ok(json!(sum));
            }),
        );
        let _server = Channel::new(b.clone(), a.id(), "https://a.example", methods).unwrap();
        let client = Channel::new(a, b.id(), "https://b.example", MethodTable::new()).unwrap();

        let rx = client.request("add", vec![json!(2), json!(3)]).unwrap();
        let reply = timeout(Duration::from_secs(1), rx).await.unwrap().unwrap();
        assert_eq!(reply, vec![json!(null), json!(5)]);
    }

    #[tokio::test]
    async fn handler_sees_calling_peer() {
        let (a, b) = pair();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let _server = Channel::with_methods(b.clone(), a.id(), "*", |_| {
            let mut methods = MethodTable::new();
            methods.insert(
                "hello".into(),
                handler(move |ctx, _, _| {
                    let _ = tx.send(ctx.peer);
                }),
            );
            methods
        })
        .unwrap();
        let client = Channel::new(a.clone(), b.id(), "*", MethodTable::new()).unwrap();
        client.call("hello", vec![]).unwrap();

        assert_eq!(rx.recv().await, Some(a.id()));
    }

    #[tokio::test]
    async fn ignores_responses_from_other_contexts() {
        let (a, b) = pair();
        let c = a.create_child("https://c.example");
        let mut inbox = b.add_listener().unwrap();
        let channel = Channel::new(a.clone(), b.id(), "*", MethodTable::new()).unwrap();

        let mut rx = channel.request("m", vec![]).unwrap();
        let seq = recv_envelope(&mut inbox).await.sequence.unwrap();

        c.post_message(a.id(), Envelope::response(seq, vec![]).encode(), "*")
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(rx.try_recv().is_err());
        assert_eq!(channel.pending_count(), 1);
    }

    #[tokio::test]
    async fn ignores_responses_from_unexpected_origin() {
        let (a, b) = pair();
        let channel =
            Channel::new(a.clone(), b.id(), "https://z.example", MethodTable::new()).unwrap();

        let mut rx = channel.request("m", vec![]).unwrap();
        b.post_message(a.id(), Envelope::response(0, vec![]).encode(), "*")
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(rx.try_recv().is_err());
        assert_eq!(channel.pending_count(), 1);
    }

    #[tokio::test]
    async fn unknown_methods_are_ignored() {
        let (a, b) = pair();
        let mut inbox = a.add_listener().unwrap();
        let _server = Channel::new(b.clone(), a.id(), "*", MethodTable::new()).unwrap();
        a.post_message(b.id(), Envelope::request(0, "nope", vec![]).encode(), "*")
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(inbox.try_recv().is_none());
    }

    #[tokio::test]
    async fn destroy_is_idempotent_and_final() {
        let (a, b) = pair();
        let mut inbox = b.add_listener().unwrap();
        let channel = Channel::new(a.clone(), b.id(), "*", MethodTable::new()).unwrap();

        let pending = channel.request("m", vec![]).unwrap();
        let seq = recv_envelope(&mut inbox).await.sequence.unwrap();

        channel.destroy();
        channel.destroy();

        assert!(channel.is_destroyed());
        assert!(pending.await.is_err());
        assert_eq!(channel.request("m", vec![]).unwrap_err(), ChannelError::Destroyed);
        assert_eq!(channel.call("m", vec![]), Ok(()));
        b.post_message(a.id(), Envelope::response(seq, vec![]).encode(), "*")
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(inbox.try_recv().is_none());
    }

    #[tokio::test]
    async fn request_to_vanished_peer_fails() {
        let (a, b) = pair();
        let channel = Channel::new(a, b.id(), "*", MethodTable::new()).unwrap();
        b.navigate_away();
        assert!(matches!(
            channel.request("m", vec![]),
            Err(ChannelError::Transport(_))
        ));
        assert_eq!(channel.pending_count(), 0);
    }
}
