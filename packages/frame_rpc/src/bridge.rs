//! Bridge: one call/event API over however many channels exist right now.
//!
//! Each discovered peer gets a [`Channel`], remembered as a [`Link`].
//! [`Bridge::call`] fans a call out to every link and collects the replies,
//! positionally aligned with the link list at call time. A peer that does not
//! answer within the call timeout contributes `None`; a peer whose channel
//! fails is destroyed and dropped from the link list.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures::future::join_all;
use serde_json::Value;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::channel::{CallContext, Channel, Handler, MethodTable, Responder, handler};
use crate::context::{Context, ContextId};
use crate::error::{BridgeError, ChannelError, TransportError};

/// Per-peer wait used by [`Bridge::call`] unless configured otherwise.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_millis(1000);

/// Method every bridge registers on its channels for the token handshake.
pub const CONNECT_METHOD: &str = "connect";

#[derive(Clone, Debug)]
pub struct BridgeConfig {
    pub call_timeout: Duration,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            call_timeout: DEFAULT_CALL_TIMEOUT,
        }
    }
}

/// A channel paired with the peer it talks to.
#[derive(Clone, Debug)]
pub struct Link {
    pub channel: Channel,
    pub peer: ContextId,
}

pub type ConnectCallback = Arc<dyn Fn(&Channel, ContextId) + Send + Sync>;

/// Result of one fan-out call, aligned with the link list at call time.
pub type CallResult = Result<Vec<Option<Value>>, BridgeError>;

#[derive(Default)]
struct BridgeState {
    links: Vec<Link>,
    handlers: MethodTable,
    on_connect: Vec<ConnectCallback>,
}

/// Registry of links with fan-out calls and shared method handlers.
#[derive(Clone)]
pub struct Bridge {
    src: Context,
    config: BridgeConfig,
    state: Arc<Mutex<BridgeState>>,
}

impl Bridge {
    pub fn new(src: Context, config: BridgeConfig) -> Self {
        Self {
            src,
            config,
            state: Arc::new(Mutex::new(BridgeState::default())),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BridgeState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    pub fn links(&self) -> Vec<Link> {
        self.lock().links.clone()
    }

    pub fn link_count(&self) -> usize {
        self.lock().links.len()
    }

    pub fn peers(&self) -> Vec<ContextId> {
        self.lock().links.iter().map(|link| link.peer).collect()
    }

    /// Wrap a freshly discovered peer in a channel and remember it.
    ///
    /// The channel exposes every registered handler plus `connect`, which
    /// accepts only `token`. `connect(token)` is also called on the peer so
    /// both sides reach "ready" whichever notices first; the `on_connect`
    /// callbacks run once per link either way.
    ///
    /// A second handshake from a peer that already has a link (its document
    /// was replaced in place) replaces the old link.
    pub fn create_channel(
        &self,
        peer: ContextId,
        origin: &str,
        token: &str,
    ) -> Result<Channel, ChannelError> {
        let connected = Arc::new(AtomicBool::new(false));
        let state = self.state.clone();
        let ready = Arc::new(move |channel: &Channel| {
            if connected.swap(true, Ordering::SeqCst) {
                return;
            }
            let callbacks = state
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .on_connect
                .clone();
            for callback in callbacks {
                callback(channel, peer);
            }
        });

        let handlers = self.lock().handlers.clone();
        let expected = token.to_string();
        let on_connect = ready.clone();
        let channel = Channel::with_methods(self.src.clone(), peer, origin, move |channel| {
            let weak = channel.downgrade();
            let mut methods = handlers;
            methods.insert(
                CONNECT_METHOD.to_string(),
                handler(move |ctx, args, reply| {
                    if args.first().and_then(Value::as_str) != Some(expected.as_str()) {
                        debug!(peer = %ctx.peer, "connect with unexpected token ignored");
                        return;
                    }
                    reply.done();
                    if let Some(channel) = weak.upgrade() {
                        on_connect(&channel);
                    }
                }),
            );
            methods
        })?;

        let replaced = {
            let mut state = self.lock();
            let (replaced, kept): (Vec<Link>, Vec<Link>) =
                state.links.drain(..).partition(|link| link.peer == peer);
            state.links = kept;
            state.links.push(Link {
                channel: channel.clone(),
                peer,
            });
            for link in &replaced {
                link.channel.destroy();
            }
            replaced.len()
        };
        if replaced > 0 {
            info!(peer = %peer, "peer handshook again, replaced its link");
        }

        match channel.request(CONNECT_METHOD, vec![Value::String(token.to_string())]) {
            Ok(reply) => {
                let weak = channel.downgrade();
                tokio::spawn(async move {
                    if reply.await.is_ok() {
                        if let Some(channel) = weak.upgrade() {
                            ready(&channel);
                        }
                    }
                });
            }
            Err(e) => debug!(peer = %peer, error = %e, "connect call failed"),
        }

        info!(peer = %peer, origin, "channel created");
        Ok(channel)
    }

    /// Call `method` on every connected peer with the configured timeout.
    pub fn call(&self, method: &str, args: Vec<Value>) -> PendingCall {
        self.call_with_timeout(method, args, self.config.call_timeout)
    }

    /// Requests are posted before this returns, so calls made back to back
    /// reach each peer in call order.
    pub fn call_with_timeout(
        &self,
        method: &str,
        args: Vec<Value>,
        timeout: Duration,
    ) -> PendingCall {
        let links = self.links();
        let mut slots = Vec::with_capacity(links.len());
        for link in links {
            let slot = match link.channel.request(method, args.clone()) {
                Ok(reply) => Slot::Waiting(reply),
                Err(ChannelError::Destroyed) => {
                    self.remove_link(&link.channel);
                    Slot::Gone
                }
                Err(source) => {
                    warn!(peer = %link.peer, method, error = %source, "call failed, dropping link");
                    self.remove_link(&link.channel);
                    Slot::Failed(BridgeError::Channel {
                        peer: link.peer,
                        source,
                    })
                }
            };
            slots.push((link, slot));
        }
        PendingCall {
            bridge: self.clone(),
            method: method.to_string(),
            slots,
            timeout,
        }
    }

    /// Trailing-callback form of [`Bridge::call`].
    pub fn call_then<F>(&self, method: &str, args: Vec<Value>, callback: F)
    where
        F: FnOnce(CallResult) + Send + 'static,
    {
        let pending = self.call(method, args);
        tokio::spawn(async move {
            callback(pending.wait().await);
        });
    }

    /// Fire-and-forget fan-out. Failing links are still pruned.
    pub fn notify(&self, method: &str, args: Vec<Value>) {
        let pending = self.call(method, args);
        if pending.is_empty() {
            return;
        }
        tokio::spawn(async move {
            let method = pending.method.clone();
            if let Err(e) = pending.wait().await {
                debug!(method, error = %e, "notification failed for one peer");
            }
        });
    }

    /// Expose `method` to every current and future peer. Registering the
    /// same name twice is a programmer error.
    pub fn on<F>(&self, method: &str, f: F) -> Result<(), BridgeError>
    where
        F: Fn(CallContext, Vec<Value>, Responder) + Send + Sync + 'static,
    {
        self.on_handler(method, handler(f))
    }

    pub fn on_handler(&self, method: &str, handler: Handler) -> Result<(), BridgeError> {
        let mut state = self.lock();
        if method == CONNECT_METHOD || state.handlers.contains_key(method) {
            return Err(BridgeError::DuplicateHandler(method.to_string()));
        }
        state.handlers.insert(method.to_string(), handler.clone());
        for link in &state.links {
            link.channel.add_method(method, handler.clone());
        }
        Ok(())
    }

    pub fn off(&self, method: &str) {
        let mut state = self.lock();
        if state.handlers.remove(method).is_some() {
            for link in &state.links {
                link.channel.remove_method(method);
            }
        }
    }

    /// Run `callback` once for every link whose handshake completes.
    pub fn on_connect<F>(&self, callback: F)
    where
        F: Fn(&Channel, ContextId) + Send + Sync + 'static,
    {
        self.lock().on_connect.push(Arc::new(callback));
    }

    /// Destroy and forget the link to `peer`.
    pub fn remove_peer(&self, peer: ContextId) -> bool {
        let mut state = self.lock();
        let before = state.links.len();
        state.links.retain(|link| {
            if link.peer == peer {
                link.channel.destroy();
                false
            } else {
                true
            }
        });
        let removed = state.links.len() != before;
        if removed {
            debug!(peer = %peer, "link removed");
        }
        removed
    }

    /// Drop the link owning `channel` and destroy the channel, under one lock.
    fn remove_link(&self, channel: &Channel) {
        let mut state = self.lock();
        state.links.retain(|link| link.channel != *channel);
        channel.destroy();
    }

    pub fn destroy(&self) {
        let links = std::mem::take(&mut self.lock().links);
        for link in &links {
            link.channel.destroy();
        }
        info!(links = links.len(), "bridge destroyed");
    }
}

enum Slot {
    Waiting(oneshot::Receiver<Vec<Value>>),
    /// Channel was already destroyed; nobody will answer
    Gone,
    Failed(BridgeError),
}

/// An in-flight fan-out call: one slot per link at call time.
pub struct PendingCall {
    bridge: Bridge,
    method: String,
    slots: Vec<(Link, Slot)>,
    timeout: Duration,
}

impl PendingCall {
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Per-peer outcomes. A timeout is `Ok(None)`, never an error.
    pub async fn wait_each(self) -> Vec<Result<Option<Value>, BridgeError>> {
        let PendingCall {
            bridge,
            method,
            slots,
            timeout,
        } = self;
        let bridge = &bridge;
        let method = method.as_str();

        join_all(slots.into_iter().map(|(link, slot)| async move {
            let reply = match slot {
                Slot::Failed(err) => return Err(err),
                Slot::Gone => return Ok(None),
                Slot::Waiting(reply) => reply,
            };
            match tokio::time::timeout(timeout, reply).await {
                Err(_) if !bridge.src.tree().contains(link.peer) => {
                    warn!(peer = %link.peer, method, "peer navigated away, dropping link");
                    bridge.remove_link(&link.channel);
                    let gone = TransportError::ContextGone(link.peer);
                    Err(BridgeError::Channel {
                        peer: link.peer,
                        source: ChannelError::Transport(gone),
                    })
                }
                Err(_) => {
                    debug!(peer = %link.peer, method, "peer did not reply in time");
                    Ok(None)
                }
                Ok(Err(_)) => Ok(None),
                Ok(Ok(args)) => match args.first() {
                    Some(error) if !error.is_null() => {
                        warn!(
                            peer = %link.peer,
                            method,
                            %error,
                            "peer replied with error, dropping link"
                        );
                        bridge.remove_link(&link.channel);
                        Err(BridgeError::Remote {
                            peer: link.peer,
                            error: error.clone(),
                        })
                    }
                    _ => Ok(Some(args.get(1).cloned().unwrap_or(Value::Null))),
                },
            }
        }))
        .await
    }

    /// All replies, or the first per-peer error. Resolves once every slot has
    /// settled, which is bounded by the call timeout.
    pub async fn wait(self) -> CallResult {
        self.wait_each().await.into_iter().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ContextTree;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::mpsc;

    fn sidebar() -> (ContextTree, Context, Bridge) {
        let tree = ContextTree::new();
        let top = tree.create_top("https://sidebar.example");
        let bridge = Bridge::new(top.clone(), BridgeConfig::default());
        (tree, top, bridge)
    }

    /// A guest answering on a raw channel with the given methods.
    fn guest(sidebar: &Context, methods: MethodTable) -> (Context, Channel) {
        let context = sidebar.create_child("https://guest.example");
        let channel = Channel::new(context.clone(), sidebar.id(), "*", methods).unwrap();
        (context, channel)
    }

    fn replying(value: Value) -> MethodTable {
        let mut methods = MethodTable::new();
        methods.insert(
            "method1".into(),
            handler(move |_, _, reply| reply.ok(value.clone())),
        );
        methods
    }

    #[tokio::test]
    async fn create_channel_adds_link_with_existing_handlers() {
        let (_tree, top, bridge) = sidebar();
        bridge.on("message1", |_, _, _| {}).unwrap();
        let (guest_ctx, _guest) = guest(&top, MethodTable::new());

        let channel = bridge
            .create_channel(guest_ctx.id(), "https://guest.example", "TOKEN")
            .unwrap();

        assert_eq!(channel.src().id(), top.id());
        assert_eq!(channel.dst(), guest_ctx.id());
        assert_eq!(channel.origin(), "https://guest.example");
        assert!(channel.has_method("message1"));
        assert!(channel.has_method(CONNECT_METHOD));
        assert_eq!(bridge.peers(), vec![guest_ctx.id()]);
    }

    #[tokio::test]
    async fn handshake_connects_both_sides_once() {
        let tree = ContextTree::new();
        let top = tree.create_top("https://sidebar.example");
        let child = top.create_child("https://guest.example");
        let host = Bridge::new(top.clone(), BridgeConfig::default());
        let peer = Bridge::new(child.clone(), BridgeConfig::default());

        let (tx, mut rx) = mpsc::unbounded_channel();
        for (name, bridge) in [("host", &host), ("peer", &peer)] {
            let tx = tx.clone();
            bridge.on_connect(move |_, peer| {
                let _ = tx.send((name, peer));
            });
        }

        host.create_channel(child.id(), "*", "1234").unwrap();
        peer.create_channel(top.id(), "*", "1234").unwrap();

        let mut seen = vec![rx.recv().await.unwrap(), rx.recv().await.unwrap()];
        seen.sort();
        assert_eq!(seen, vec![("host", child.id()), ("peer", top.id())]);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn connect_with_wrong_token_is_ignored() {
        let (_tree, top, bridge) = sidebar();
        let (guest_ctx, guest_channel) = guest(&top, MethodTable::new());
        let connects = Arc::new(AtomicUsize::new(0));
        let counter = connects.clone();
        bridge.on_connect(move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        bridge.create_channel(guest_ctx.id(), "*", "RIGHT").unwrap();

        let reply = guest_channel.request(CONNECT_METHOD, vec![json!("WRONG")]).unwrap();
        assert!(tokio::time::timeout(Duration::from_secs(1), reply).await.is_err());
        assert_eq!(connects.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn call_with_no_links_resolves_empty() {
        let (_tree, _top, bridge) = sidebar();
        assert_eq!(bridge.call("method1", vec![]).wait().await, Ok(vec![]));
    }

    #[tokio::test(start_paused = true)]
    async fn call_results_align_with_links_and_timeouts_are_none() {
        let (_tree, top, bridge) = sidebar();
        let (a, _ga) = guest(&top, replying(json!("result1")));
        let (b, _gb) = guest(&top, MethodTable::new());
        let (c, _gc) = guest(&top, replying(json!("result3")));
        for ctx in [&a, &b, &c] {
            bridge.create_channel(ctx.id(), "*", "T").unwrap();
        }

        let started = tokio::time::Instant::now();
        let results = bridge.call("method1", vec![json!("params1")]).wait().await;

        assert_eq!(
            results,
            Ok(vec![Some(json!("result1")), None, Some(json!("result3"))])
        );
        assert!(started.elapsed() >= DEFAULT_CALL_TIMEOUT);
        assert_eq!(bridge.link_count(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn peer_gone_mid_call_is_pruned() {
        let (_tree, top, bridge) = sidebar();
        let (a, _ga) = guest(&top, MethodTable::new());
        let (b, _gb) = guest(&top, replying(json!("result2")));
        bridge.create_channel(a.id(), "*", "T").unwrap();
        bridge.create_channel(b.id(), "*", "T").unwrap();

        let pending = bridge.call("method1", vec![]);
        a.navigate_away();
        let each = pending.wait_each().await;

        assert!(matches!(
            &each[0],
            Err(BridgeError::Channel {
                peer,
                source: ChannelError::Transport(TransportError::ContextGone(_)),
            }) if *peer == a.id()
        ));
        assert_eq!(each[1], Ok(Some(json!("result2"))));
        assert_eq!(bridge.peers(), vec![b.id()]);
    }

    #[tokio::test(start_paused = true)]
    async fn remote_error_prunes_only_that_link() {
        let (_tree, top, bridge) = sidebar();
        let mut failing = MethodTable::new();
        failing.insert("method1".into(), handler(|_, _, reply| reply.err("Uh oh")));
        let (a, _ga) = guest(&top, failing);
        let (b, _gb) = guest(&top, replying(json!("result2")));
        let channel_a = bridge.create_channel(a.id(), "*", "T").unwrap();
        bridge.create_channel(b.id(), "*", "T").unwrap();

        let each = bridge.call("method1", vec![]).wait_each().await;
        assert!(matches!(&each[0], Err(BridgeError::Remote { peer, .. }) if *peer == a.id()));
        assert_eq!(each[1], Ok(Some(json!("result2"))));

        assert!(channel_a.is_destroyed());
        assert_eq!(bridge.peers(), vec![b.id()]);
        assert_eq!(
            bridge.call("method1", vec![]).wait().await,
            Ok(vec![Some(json!("result2"))])
        );
    }

    #[tokio::test(start_paused = true)]
    async fn transport_error_fails_aggregate_and_prunes() {
        let (_tree, top, bridge) = sidebar();
        let (a, _ga) = guest(&top, replying(json!("result1")));
        let (b, _gb) = guest(&top, replying(json!("result2")));
        bridge.create_channel(a.id(), "*", "T").unwrap();
        bridge.create_channel(b.id(), "*", "T").unwrap();

        a.navigate_away();
        let pending = bridge.call("method1", vec![]);
        assert_eq!(bridge.link_count(), 1);
        assert_eq!(pending.len(), 2);

        let (tx, rx) = oneshot::channel();
        bridge.call_then("method1", vec![], move |result| {
            let _ = tx.send(result);
        });
        assert_eq!(rx.await.unwrap(), Ok(vec![Some(json!("result2"))]));

        let err = pending.wait().await.unwrap_err();
        assert_eq!(err.peer(), Some(a.id()));
        assert_eq!(err.error_code(), "channel");
    }

    #[tokio::test]
    async fn duplicate_handler_is_rejected() {
        let (_tree, _top, bridge) = sidebar();
        bridge.on("method1", |_, _, _| {}).unwrap();
        assert_eq!(
            bridge.on("method1", |_, _, _| {}),
            Err(BridgeError::DuplicateHandler("method1".into()))
        );
        assert!(bridge.on(CONNECT_METHOD, |_, _, _| {}).is_err());

        bridge.off("method1");
        assert!(bridge.on("method1", |_, _, _| {}).is_ok());
    }

    #[tokio::test]
    async fn handlers_reach_existing_channels() {
        let (_tree, top, bridge) = sidebar();
        let (g, guest_channel) = guest(&top, MethodTable::new());
        let channel = bridge.create_channel(g.id(), "*", "T").unwrap();

        bridge
            .on("ping", |ctx, _, reply| reply.ok(json!(ctx.peer.0)))
            .unwrap();
        assert!(channel.has_method("ping"));

        let reply = guest_channel.request("ping", vec![]).unwrap();
        assert_eq!(reply.await.unwrap(), vec![json!(null), json!(g.id().0)]);

        bridge.off("ping");
        assert!(!channel.has_method("ping"));
        assert!(channel.has_method(CONNECT_METHOD));
    }

    #[tokio::test]
    async fn rehandshake_replaces_link() {
        let (_tree, top, bridge) = sidebar();
        let (g, _guest) = guest(&top, MethodTable::new());
        let first = bridge.create_channel(g.id(), "*", "1").unwrap();
        let second = bridge.create_channel(g.id(), "*", "2").unwrap();

        assert!(first.is_destroyed());
        assert!(!second.is_destroyed());
        assert_eq!(bridge.link_count(), 1);
    }

    #[tokio::test]
    async fn destroy_and_remove_peer() {
        let (_tree, top, bridge) = sidebar();
        let (a, _ga) = guest(&top, MethodTable::new());
        let (b, _gb) = guest(&top, MethodTable::new());
        let ca = bridge.create_channel(a.id(), "*", "T").unwrap();
        let cb = bridge.create_channel(b.id(), "*", "T").unwrap();

        assert!(bridge.remove_peer(a.id()));
        assert!(!bridge.remove_peer(a.id()));
        assert!(ca.is_destroyed());

        bridge.destroy();
        assert!(cb.is_destroyed());
        assert_eq!(bridge.link_count(), 0);
    }

    #[tokio::test]
    async fn destroyed_channel_link_is_dropped_on_next_call() {
        let (_tree, top, bridge) = sidebar();
        let (a, _ga) = guest(&top, MethodTable::new());
        let channel = bridge.create_channel(a.id(), "*", "T").unwrap();
        channel.destroy();

        assert_eq!(bridge.call("method1", vec![]).wait().await, Ok(vec![None]));
        assert_eq!(bridge.link_count(), 0);
    }
}
