//! In-process context tree: the one-way message primitive the rest of the
//! crate is layered on.
//!
//! A [`Context`] stands for one isolated execution environment (a frame in a
//! browser tab). Contexts never share state. The only way to reach another
//! context is [`Context::post_message`], which is asynchronous, one-way and
//! FIFO per sender/target pair, with no acknowledgement.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde_json::Value;
use tokio::sync::mpsc;
use tracing::trace;

use crate::error::TransportError;

/// Target origin that matches any receiving context.
pub const WILDCARD_ORIGIN: &str = "*";

/// Origin reported for sandboxed contexts and non-network schemes.
pub const OPAQUE_ORIGIN: &str = "null";

/// Opaque handle identifying a context for as long as the tree exists.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq, Ord, PartialOrd)]
pub struct ContextId(pub u64);

impl std::fmt::Display for ContextId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ctx-{}", self.0)
    }
}

/// Identifies one registered listener on a context.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq)]
pub struct ListenerId(u64);

/// A message as seen by a receiving listener.
#[derive(Clone, Debug, PartialEq)]
pub struct MessageEvent {
    /// The context that posted the message
    pub source: ContextId,
    /// Origin of the sending context
    pub origin: String,
    pub data: Value,
}

/// Receiving half of a listener registered with [`Context::add_listener`].
///
/// `recv` returns `None` once the listener is removed or its context is
/// navigated away.
pub struct Listener {
    id: ListenerId,
    rx: mpsc::UnboundedReceiver<MessageEvent>,
}

impl Listener {
    pub fn id(&self) -> ListenerId {
        self.id
    }

    pub async fn recv(&mut self) -> Option<MessageEvent> {
        self.rx.recv().await
    }

    /// Non-blocking receive, mostly useful in tests.
    pub fn try_recv(&mut self) -> Option<MessageEvent> {
        self.rx.try_recv().ok()
    }
}

struct Node {
    origin: String,
    parent: Option<ContextId>,
    children: Vec<ContextId>,
    listeners: HashMap<ListenerId, mpsc::UnboundedSender<MessageEvent>>,
    /// Exclusive per-context roles (e.g. an active discovery session)
    claims: HashSet<String>,
}

#[derive(Default)]
struct TreeState {
    nodes: HashMap<ContextId, Node>,
    next_context: u64,
    next_listener: u64,
}

/// Shared registry of every context in one session.
#[derive(Clone, Default)]
pub struct ContextTree {
    state: Arc<Mutex<TreeState>>,
}

impl ContextTree {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, TreeState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Create a new top-level context (a tab's outermost frame).
    pub fn create_top(&self, origin: impl Into<String>) -> Context {
        let origin = origin.into();
        let id = self.insert(origin.clone(), None);
        Context {
            id,
            origin,
            tree: self.clone(),
        }
    }

    fn insert(&self, origin: String, parent: Option<ContextId>) -> ContextId {
        let mut state = self.lock();
        state.next_context += 1;
        let id = ContextId(state.next_context);
        if let Some(parent) = parent.and_then(|p| state.nodes.get_mut(&p)) {
            parent.children.push(id);
        }
        state.nodes.insert(
            id,
            Node {
                origin,
                parent,
                children: Vec::new(),
                listeners: HashMap::new(),
                claims: HashSet::new(),
            },
        );
        id
    }

    /// Look up a live context by id.
    pub fn context(&self, id: ContextId) -> Option<Context> {
        let state = self.lock();
        state.nodes.get(&id).map(|node| Context {
            id,
            origin: node.origin.clone(),
            tree: self.clone(),
        })
    }

    pub fn contains(&self, id: ContextId) -> bool {
        self.lock().nodes.contains_key(&id)
    }

    pub fn children(&self, id: ContextId) -> Vec<ContextId> {
        self.lock()
            .nodes
            .get(&id)
            .map(|node| node.children.clone())
            .unwrap_or_default()
    }

    /// Walk up to the outermost ancestor of `id`.
    pub fn top_of(&self, id: ContextId) -> ContextId {
        let state = self.lock();
        let mut current = id;
        while let Some(parent) = state.nodes.get(&current).and_then(|n| n.parent) {
            current = parent;
        }
        current
    }

    /// Top-down, breadth-first listing of `root` and all its descendants.
    pub fn breadth_first(&self, root: ContextId) -> Vec<ContextId> {
        let state = self.lock();
        let mut order = Vec::new();
        let mut queue = VecDeque::from([root]);
        while let Some(id) = queue.pop_front() {
            let Some(node) = state.nodes.get(&id) else {
                continue;
            };
            order.push(id);
            queue.extend(node.children.iter().copied());
        }
        order
    }

    /// Remove a context and its whole subtree. Listeners on removed contexts
    /// are closed and later posts to them fail.
    pub fn remove(&self, id: ContextId) {
        let mut state = self.lock();
        let Some(parent) = state.nodes.get(&id).map(|n| n.parent) else {
            return;
        };
        if let Some(parent) = parent.and_then(|p| state.nodes.get_mut(&p)) {
            parent.children.retain(|child| *child != id);
        }
        let mut queue = VecDeque::from([id]);
        while let Some(next) = queue.pop_front() {
            if let Some(node) = state.nodes.remove(&next) {
                queue.extend(node.children);
            }
        }
        trace!(context = %id, "context removed");
    }

    fn add_listener(&self, id: ContextId) -> Result<Listener, TransportError> {
        let mut state = self.lock();
        state.next_listener += 1;
        let listener_id = ListenerId(state.next_listener);
        let node = state
            .nodes
            .get_mut(&id)
            .ok_or(TransportError::ContextGone(id))?;
        let (tx, rx) = mpsc::unbounded_channel();
        node.listeners.insert(listener_id, tx);
        Ok(Listener {
            id: listener_id,
            rx,
        })
    }

    fn remove_listener(&self, id: ContextId, listener: ListenerId) {
        if let Some(node) = self.lock().nodes.get_mut(&id) {
            node.listeners.remove(&listener);
        }
    }

    fn try_claim(&self, id: ContextId, key: &str) -> bool {
        self.lock()
            .nodes
            .get_mut(&id)
            .is_some_and(|node| node.claims.insert(key.to_string()))
    }

    fn release_claim(&self, id: ContextId, key: &str) {
        if let Some(node) = self.lock().nodes.get_mut(&id) {
            node.claims.remove(key);
        }
    }

    fn deliver(
        &self,
        from: ContextId,
        to: ContextId,
        data: Value,
        target_origin: &str,
    ) -> Result<(), TransportError> {
        let mut state = self.lock();
        let origin = state
            .nodes
            .get(&from)
            .map(|node| node.origin.clone())
            .ok_or(TransportError::ContextGone(from))?;
        let target = state
            .nodes
            .get_mut(&to)
            .ok_or(TransportError::ContextGone(to))?;

        if target_origin != WILDCARD_ORIGIN && target_origin != target.origin {
            trace!(
                from = %from,
                to = %to,
                target_origin,
                actual = %target.origin,
                "target origin mismatch, message dropped"
            );
            return Ok(());
        }

        let event = MessageEvent {
            source: from,
            origin,
            data,
        };
        target
            .listeners
            .retain(|_, tx| tx.send(event.clone()).is_ok());
        Ok(())
    }
}

/// Handle onto one context of a [`ContextTree`].
#[derive(Clone)]
pub struct Context {
    id: ContextId,
    origin: String,
    tree: ContextTree,
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("id", &self.id)
            .field("origin", &self.origin)
            .finish()
    }
}

impl Context {
    pub fn id(&self) -> ContextId {
        self.id
    }

    pub fn origin(&self) -> &str {
        &self.origin
    }

    pub fn tree(&self) -> &ContextTree {
        &self.tree
    }

    /// Create an embedded child context (an iframe).
    pub fn create_child(&self, origin: impl Into<String>) -> Context {
        let origin = origin.into();
        let id = self.tree.insert(origin.clone(), Some(self.id));
        Context {
            id,
            origin,
            tree: self.tree.clone(),
        }
    }

    /// The outermost context of the tree this context belongs to.
    pub fn top(&self) -> ContextId {
        self.tree.top_of(self.id)
    }

    pub fn is_alive(&self) -> bool {
        self.tree.contains(self.id)
    }

    /// Post `data` to `target`. Delivery is asynchronous; the message is
    /// silently dropped if `target_origin` does not match the target.
    pub fn post_message(
        &self,
        target: ContextId,
        data: Value,
        target_origin: &str,
    ) -> Result<(), TransportError> {
        self.tree.deliver(self.id, target, data, target_origin)
    }

    pub fn add_listener(&self) -> Result<Listener, TransportError> {
        self.tree.add_listener(self.id)
    }

    pub fn remove_listener(&self, listener: ListenerId) {
        self.tree.remove_listener(self.id, listener);
    }

    /// Take an exclusive named slot on this context. Returns `false` if the
    /// slot is already held or the context is gone.
    pub fn try_claim(&self, key: &str) -> bool {
        self.tree.try_claim(self.id, key)
    }

    pub fn release_claim(&self, key: &str) {
        self.tree.release_claim(self.id, key);
    }

    /// Tear this context (and everything embedded in it) down, as when a
    /// frame navigates to an unrelated document.
    pub fn navigate_away(&self) {
        self.tree.remove(self.id);
    }
}
