//! FrameSync: keeps every connected guest document in step with the central
//! annotation state, and relays presentation commands between them.
//!
//! Outbound, each store change is diffed against the previous snapshot and
//! turned into `loadAnnotations` / `deleteAnnotation` calls. Inbound, guests
//! report new annotations, anchoring results and UI intents. Anchoring results
//! arrive in bursts and are coalesced by an [`AnchorBatcher`].

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use frame_rpc::{
    Bridge, CallContext, Channel, Context, ContextId, Discovery, DiscoveryError,
    DiscoveryOptions, Responder,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{broadcast, mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::annotation::{Annotation, WireAnnotation};
use crate::config::SyncConfig;
use crate::error::SyncError;
use crate::events::SyncEvent;
use crate::store::{AnchorStatus, AnchorStatusBatch, AnnotationStore, FrameInfo, StoreState};

/// Method names exchanged between the sidebar and guests.
pub mod methods {
    // sidebar -> guest
    pub const GET_DOCUMENT_INFO: &str = "getDocumentInfo";
    pub const LOAD_ANNOTATIONS: &str = "loadAnnotations";
    pub const DELETE_ANNOTATION: &str = "deleteAnnotation";
    pub const PUBLIC_ANNOTATION_COUNT_CHANGED: &str = "publicAnnotationCountChanged";
    pub const SCROLL_TO_ANNOTATION: &str = "scrollToAnnotation";

    // guest -> sidebar
    pub const BEFORE_CREATE_ANNOTATION: &str = "beforeCreateAnnotation";
    pub const DESTROY_FRAME: &str = "destroyFrame";
    pub const SYNC: &str = "sync";
    pub const SHOW_ANNOTATIONS: &str = "showAnnotations";
    pub const SHOW_BUCKET_LIST: &str = "showBucketList";
    pub const TOGGLE_ANNOTATION_SELECTION: &str = "toggleAnnotationSelection";
    pub const SIDEBAR_OPENED: &str = "sidebarOpened";

    // both directions
    pub const FOCUS_ANNOTATIONS: &str = "focusAnnotations";
    pub const SHOW_SIDEBAR: &str = "showSidebar";
    pub const HIDE_SIDEBAR: &str = "hideSidebar";
    pub const SET_VISIBLE_HIGHLIGHTS: &str = "setVisibleHighlights";

    /// Commands a guest sends that the sidebar forwards to every guest.
    pub const RELAYED: [&str; 3] = [SHOW_SIDEBAR, HIDE_SIDEBAR, SET_VISIBLE_HIGHLIGHTS];
}

use methods::*;

const EVENT_CAPACITY: usize = 256;

/// Reply to `getDocumentInfo`.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentInfo {
    #[serde(default)]
    pub frame_identifier: Option<String>,
    #[serde(default)]
    pub metadata: Value,
    #[serde(default)]
    pub uri: String,
}

/// Calls owed to guests after one store change.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Outbound {
    pub load: Vec<WireAnnotation>,
    pub delete: Vec<WireAnnotation>,
    pub public_count: Option<usize>,
}

impl Outbound {
    pub fn is_empty(&self) -> bool {
        self.load.is_empty() && self.delete.is_empty() && self.public_count.is_none()
    }
}

/// Set-based diff between successive store snapshots.
///
/// Tracks which annotation tags guests already have ("in frame") so nothing
/// is sent twice; re-sending makes guests re-anchor.
#[derive(Debug, Default)]
pub struct Reconciler {
    in_frame: HashSet<String>,
    prev_annotations: Arc<Vec<Annotation>>,
    prev_frames: Arc<Vec<FrameInfo>>,
    prev_public: Option<usize>,
}

impl Reconciler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_in_frame(&self, tag: &str) -> bool {
        self.in_frame.contains(tag)
    }

    /// Record that guests already hold `tag`, e.g. because one created it.
    pub fn mark_in_frame(&mut self, tag: &str) {
        if !self.in_frame.contains(tag) {
            self.in_frame.insert(tag.to_string());
        }
    }

    pub fn in_frame_tags(&self) -> Vec<String> {
        let mut tags: Vec<_> = self.in_frame.iter().cloned().collect();
        tags.sort();
        tags
    }

    /// Take `state` as the starting point without sending anything. What it
    /// holds reaches guests with the first change after it, typically the
    /// frame a guest's connection adds.
    pub fn seed(&mut self, state: &StoreState) {
        self.prev_annotations = state.annotations.clone();
        self.prev_frames = state.frames.clone();
    }

    /// Diff `state` against the last snapshot seen. `None` when neither the
    /// annotations nor the frames changed.
    pub fn reconcile(&mut self, state: &StoreState) -> Option<Outbound> {
        if Arc::ptr_eq(&state.annotations, &self.prev_annotations)
            && Arc::ptr_eq(&state.frames, &self.prev_frames)
        {
            return None;
        }

        let mut public = 0;
        let mut in_sidebar = HashSet::new();
        let mut added = Vec::new();
        // Guests never display replies.
        for ann in state.annotations.iter().filter(|ann| !ann.is_reply()) {
            if ann.is_public() {
                public += 1;
            }
            if in_sidebar.insert(ann.tag.as_str()) && !self.in_frame.contains(&ann.tag) {
                added.push(ann);
            }
        }

        let mut deleted = Vec::new();
        for ann in self.prev_annotations.iter() {
            if !in_sidebar.contains(ann.tag.as_str()) && self.in_frame.remove(&ann.tag) {
                deleted.push(ann.to_wire());
            }
        }
        for ann in &added {
            self.in_frame.insert(ann.tag.clone());
        }

        let fetch_complete = !state.frames.is_empty()
            && state.frames.iter().all(|frame| frame.is_annotation_fetch_complete);
        let public_count = if fetch_complete && self.prev_public != Some(public) {
            self.prev_public = Some(public);
            Some(public)
        } else {
            None
        };

        let outbound = Outbound {
            load: added.into_iter().map(Annotation::to_wire).collect(),
            delete: deleted,
            public_count,
        };
        self.prev_annotations = state.annotations.clone();
        self.prev_frames = state.frames.clone();
        Some(outbound)
    }
}

/// Coalesces anchoring results and flushes them once no new result has
/// arrived for the debounce window.
#[derive(Clone)]
pub struct AnchorBatcher {
    tx: mpsc::UnboundedSender<(String, AnchorStatus)>,
}

impl AnchorBatcher {
    /// Must be called inside a tokio runtime. The batcher stops when
    /// `cancel` fires or every handle is dropped; results still pending then
    /// are discarded.
    pub fn spawn<F>(debounce: Duration, cancel: CancellationToken, flush: F) -> Self
    where
        F: Fn(AnchorStatusBatch) + Send + 'static,
    {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(run_batcher(rx, debounce, cancel, flush));
        Self { tx }
    }

    pub fn push(&self, tag: &str, status: AnchorStatus) {
        if self.tx.send((tag.to_string(), status)).is_err() {
            trace!(tag, "anchor batcher stopped, result dropped");
        }
    }
}

async fn run_batcher<F>(
    mut rx: mpsc::UnboundedReceiver<(String, AnchorStatus)>,
    debounce: Duration,
    cancel: CancellationToken,
    flush: F,
) where
    F: Fn(AnchorStatusBatch),
{
    let mut pending = AnchorStatusBatch::new();
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            update = rx.recv() => match update {
                Some((tag, status)) => {
                    pending.insert(tag, status);
                }
                None => break,
            },
            _ = tokio::time::sleep(debounce), if !pending.is_empty() => {
                let batch = std::mem::take(&mut pending);
                debug!(count = batch.len(), "flushing anchor status batch");
                flush(batch);
            }
        }
    }
}

/// State shared between FrameSync and the handlers it registers.
struct Shared {
    store: Arc<dyn AnnotationStore>,
    reconciler: Mutex<Reconciler>,
    events: broadcast::Sender<SyncEvent>,
}

impl Shared {
    fn reconciler(&self) -> MutexGuard<'_, Reconciler> {
        self.reconciler.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, event: SyncEvent) {
        trace!(event = event.name(), "sync event");
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    fn add_frame(&self, channel: &Channel, peer: ContextId, reply: Vec<Value>) {
        if let Some(err) = reply.first().filter(|e| !e.is_null()) {
            warn!(peer = %peer, error = %err, "getDocumentInfo failed, dropping channel");
            channel.destroy();
            return;
        }
        let info: DocumentInfo =
            match serde_json::from_value(reply.get(1).cloned().unwrap_or(Value::Null)) {
                Ok(info) => info,
                Err(e) => {
                    warn!(peer = %peer, error = %e, "malformed document info, dropping channel");
                    channel.destroy();
                    return;
                }
            };

        let frame = FrameInfo {
            id: info.frame_identifier,
            uri: info.uri,
            metadata: info.metadata,
            is_annotation_fetch_complete: false,
        };
        info!(peer = %peer, frame = ?frame.id, uri = %frame.uri, "frame connected");
        self.store.connect_frame(frame.clone());
        self.emit(SyncEvent::FrameConnected { peer, frame });
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Phase {
    Idle,
    Connected,
    Closed,
}

/// Sidebar-side synchronization service.
pub struct FrameSync {
    context: Context,
    config: SyncConfig,
    bridge: Bridge,
    discovery: Discovery,
    shared: Arc<Shared>,
    phase: Mutex<Phase>,
    cancel: CancellationToken,
}

impl FrameSync {
    pub fn new(context: Context, store: Arc<dyn AnnotationStore>, config: SyncConfig) -> Self {
        let bridge = Bridge::new(context.clone(), config.bridge.clone());
        let discovery = Discovery::new(
            context.clone(),
            DiscoveryOptions::server()
                .with_origin(config.discovery_origin.clone())
                .with_namespace(config.namespace.clone()),
        );
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            context,
            config,
            bridge,
            discovery,
            shared: Arc::new(Shared {
                store,
                reconciler: Mutex::new(Reconciler::new()),
                events,
            }),
            phase: Mutex::new(Phase::Idle),
            cancel: CancellationToken::new(),
        }
    }

    fn phase(&self) -> MutexGuard<'_, Phase> {
        self.phase.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.shared.events.subscribe()
    }

    pub fn bridge(&self) -> &Bridge {
        &self.bridge
    }

    pub fn discovery(&self) -> &Discovery {
        &self.discovery
    }

    pub fn store(&self) -> &Arc<dyn AnnotationStore> {
        &self.shared.store
    }

    pub fn is_connected(&self) -> bool {
        *self.phase() == Phase::Connected
    }

    pub fn is_in_frame(&self, tag: &str) -> bool {
        self.shared.reconciler().is_in_frame(tag)
    }

    pub fn in_frame_tags(&self) -> Vec<String> {
        self.shared.reconciler().in_frame_tags()
    }

    /// Find guests in the current tree and start keeping them in sync.
    /// Must be called inside a tokio runtime.
    pub fn connect(&self) -> Result<(), SyncError> {
        let mut phase = self.phase();
        match *phase {
            Phase::Idle => {}
            Phase::Connected => return Err(SyncError::AlreadyConnected),
            Phase::Closed => return Err(SyncError::Closed),
        }

        let bridge = self.bridge.clone();
        self.discovery.start_discovery(move |peer, origin, token| {
            if let Err(e) = bridge.create_channel(peer, &origin, &token) {
                warn!(peer = %peer, error = %e, "could not open channel to discovered guest");
            }
        })?;

        let shared = self.shared.clone();
        self.bridge.on_connect(move |channel, peer| {
            let reply = match channel.request(GET_DOCUMENT_INFO, Vec::new()) {
                Ok(reply) => reply,
                Err(e) => {
                    debug!(peer = %peer, error = %e, "getDocumentInfo not sent");
                    return;
                }
            };
            let shared = shared.clone();
            let channel = channel.clone();
            tokio::spawn(async move {
                // Dropped when the channel is destroyed first.
                if let Ok(reply) = reply.await {
                    shared.add_frame(&channel, peer, reply);
                }
            });
        });

        if let Err(e) = self.register_handlers() {
            self.discovery.stop_discovery();
            return Err(e.into());
        }

        tokio::spawn(run_outbound(
            self.shared.store.subscribe(),
            self.shared.clone(),
            self.bridge.clone(),
            self.cancel.clone(),
        ));
        tokio::spawn(watch_discovery(
            self.discovery.fatal_errors(),
            self.shared.clone(),
            self.cancel.clone(),
        ));

        *phase = Phase::Connected;
        info!(context = %self.context.id(), "frame sync connected");
        Ok(())
    }

    fn register_handlers(&self) -> Result<(), frame_rpc::BridgeError> {
        let shared = self.shared.clone();
        self.bridge
            .on(BEFORE_CREATE_ANNOTATION, move |ctx: CallContext, args, _| {
                let Some(event) = args.first() else {
                    return;
                };
                let Some(tag) = event.get("tag").and_then(Value::as_str) else {
                    debug!(peer = %ctx.peer, "beforeCreateAnnotation without tag ignored");
                    return;
                };
                shared.reconciler().mark_in_frame(tag);
                match Annotation::from_guest(tag, event.get("msg").unwrap_or(&Value::Null)) {
                    Ok(annotation) => shared.emit(SyncEvent::BeforeAnnotationCreated(annotation)),
                    Err(e) => debug!(peer = %ctx.peer, tag, error = %e, "malformed new annotation"),
                }
            })?;

        let shared = self.shared.clone();
        let bridge = self.bridge.clone();
        self.bridge.on(DESTROY_FRAME, move |ctx, args, _| {
            let frame_id = args.first().and_then(Value::as_str).map(str::to_string);
            if !shared.store.destroy_frame(frame_id.as_deref()) {
                debug!(peer = %ctx.peer, frame = ?frame_id, "destroyFrame for unknown frame");
            }
            bridge.remove_peer(ctx.peer);
            info!(peer = %ctx.peer, frame = ?frame_id, "frame destroyed");
            shared.emit(SyncEvent::FrameDestroyed {
                peer: ctx.peer,
                frame_id,
            });
        })?;

        let shared = self.shared.clone();
        let flush_to = self.shared.clone();
        let batcher = AnchorBatcher::spawn(
            self.config.anchor_debounce,
            self.cancel.child_token(),
            move |batch| {
                flush_to.store.update_anchor_status(&batch);
                flush_to.emit(SyncEvent::AnnotationsSynced(batch.into_keys().collect()));
            },
        );
        self.bridge.on(SYNC, move |ctx, args, _| {
            let Some(events) = args.first().and_then(Value::as_array) else {
                debug!(peer = %ctx.peer, "sync without event list ignored");
                return;
            };
            let mut reconciler = shared.reconciler();
            for event in events {
                let Some(tag) = event.get("tag").and_then(Value::as_str) else {
                    continue;
                };
                let orphan = event
                    .pointer("/msg/$orphan")
                    .and_then(Value::as_bool)
                    .unwrap_or(false);
                reconciler.mark_in_frame(tag);
                let status = if orphan {
                    AnchorStatus::Orphan
                } else {
                    AnchorStatus::Anchored
                };
                batcher.push(tag, status);
            }
        })?;

        let shared = self.shared.clone();
        self.bridge.on(SHOW_ANNOTATIONS, move |_, args, _| {
            let tags = tags_arg(&args);
            let ids = shared.store.find_ids_for_tags(&tags);
            shared.emit(SyncEvent::ShowAnnotations { tags, ids });
        })?;

        let shared = self.shared.clone();
        self.bridge.on(SHOW_BUCKET_LIST, move |_, args, _| {
            shared.emit(SyncEvent::ShowBucketList(tags_arg(&args)));
        })?;

        let shared = self.shared.clone();
        self.bridge.on(FOCUS_ANNOTATIONS, move |_, args, _| {
            shared.emit(SyncEvent::FocusAnnotations(tags_arg(&args)));
        })?;

        let shared = self.shared.clone();
        self.bridge
            .on(TOGGLE_ANNOTATION_SELECTION, move |_, args, _| {
                let tags = tags_arg(&args);
                let ids = shared.store.find_ids_for_tags(&tags);
                shared.emit(SyncEvent::ToggleAnnotationSelection { tags, ids });
            })?;

        let shared = self.shared.clone();
        self.bridge.on(SIDEBAR_OPENED, move |_, _, _| {
            shared.emit(SyncEvent::SidebarOpened);
        })?;

        for method in RELAYED {
            let bridge = self.bridge.clone();
            self.bridge
                .on(method, move |ctx: CallContext, args, _: Responder| {
                    bridge.notify(&ctx.method, args);
                })?;
        }
        Ok(())
    }

    /// Stop discovery and background tasks and drop every guest link.
    pub fn disconnect(&self) {
        let mut phase = self.phase();
        if *phase == Phase::Closed {
            return;
        }
        let was_connected = *phase == Phase::Connected;
        *phase = Phase::Closed;
        drop(phase);

        self.discovery.stop_discovery();
        self.cancel.cancel();
        if was_connected {
            // Handlers hold bridge clones; removing them breaks the cycle.
            for method in INBOUND {
                self.bridge.off(method);
            }
            self.bridge.destroy();
            info!(context = %self.context.id(), "frame sync disconnected");
        }
    }

    /// Move focus to the highlights of the given annotations in every guest.
    pub fn focus_annotations(&self, tags: &[String]) {
        self.bridge
            .notify(FOCUS_ANNOTATIONS, vec![Value::from(tags.to_vec())]);
    }

    pub fn scroll_to_annotation(&self, tag: &str) {
        self.bridge
            .notify(SCROLL_TO_ANNOTATION, vec![Value::from(tag)]);
    }

    pub fn show_sidebar(&self) {
        self.bridge.notify(SHOW_SIDEBAR, Vec::new());
    }

    pub fn hide_sidebar(&self) {
        self.bridge.notify(HIDE_SIDEBAR, Vec::new());
    }

    pub fn set_visible_highlights(&self, visible: bool) {
        self.bridge
            .notify(SET_VISIBLE_HIGHLIGHTS, vec![Value::Bool(visible)]);
    }
}

impl Drop for FrameSync {
    fn drop(&mut self) {
        self.disconnect();
    }
}

const INBOUND: [&str; 11] = [
    BEFORE_CREATE_ANNOTATION,
    DESTROY_FRAME,
    SYNC,
    SHOW_ANNOTATIONS,
    SHOW_BUCKET_LIST,
    FOCUS_ANNOTATIONS,
    TOGGLE_ANNOTATION_SELECTION,
    SIDEBAR_OPENED,
    SHOW_SIDEBAR,
    HIDE_SIDEBAR,
    SET_VISIBLE_HIGHLIGHTS,
];

/// First argument as a list of tags. `null` or a missing argument is empty.
fn tags_arg(args: &[Value]) -> Vec<String> {
    args.first()
        .and_then(Value::as_array)
        .map(|tags| {
            tags.iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

fn to_wire_value<T: Serialize>(value: &T) -> Value {
    serde_json::to_value(value).unwrap_or(Value::Null)
}

fn dispatch(bridge: &Bridge, outbound: Outbound) {
    if !outbound.load.is_empty() {
        debug!(count = outbound.load.len(), "loading annotations into guests");
        bridge.notify(LOAD_ANNOTATIONS, vec![to_wire_value(&outbound.load)]);
    }
    for wire in &outbound.delete {
        debug!(tag = %wire.tag, "deleting annotation from guests");
        bridge.notify(DELETE_ANNOTATION, vec![to_wire_value(wire)]);
    }
    if let Some(count) = outbound.public_count {
        debug!(count, "public annotation count changed");
        bridge.notify(PUBLIC_ANNOTATION_COUNT_CHANGED, vec![Value::from(count)]);
    }
}

async fn run_outbound(
    mut rx: watch::Receiver<StoreState>,
    shared: Arc<Shared>,
    bridge: Bridge,
    cancel: CancellationToken,
) {
    let initial = rx.borrow_and_update().clone();
    shared.reconciler().seed(&initial);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            changed = rx.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }

        let state = rx.borrow_and_update().clone();
        let outbound = shared.reconciler().reconcile(&state);
        if let Some(outbound) = outbound.filter(|o| !o.is_empty()) {
            dispatch(&bridge, outbound);
        }
    }
}

async fn fatal_error(mut rx: watch::Receiver<Option<DiscoveryError>>) -> Option<DiscoveryError> {
    rx.wait_for(Option::is_some).await.ok().and_then(|e| e.clone())
}

async fn watch_discovery(
    rx: watch::Receiver<Option<DiscoveryError>>,
    shared: Arc<Shared>,
    cancel: CancellationToken,
) {
    tokio::select! {
        _ = cancel.cancelled() => {}
        Some(err) = fatal_error(rx) => {
            error!(error = %err, "guest discovery stopped");
            shared.emit(SyncEvent::DiscoveryFailed(err));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn state(annotations: Vec<Annotation>, frames: Vec<FrameInfo>) -> StoreState {
        StoreState {
            annotations: Arc::new(annotations),
            frames: Arc::new(frames),
        }
    }

    fn tags(wires: &[WireAnnotation]) -> Vec<&str> {
        let mut tags: Vec<_> = wires.iter().map(|w| w.tag.as_str()).collect();
        tags.sort();
        tags
    }

    fn fetched(complete: bool) -> FrameInfo {
        FrameInfo {
            uri: "http://example.com".into(),
            is_annotation_fetch_complete: complete,
            ..Default::default()
        }
    }

    #[test]
    fn diff_loads_new_and_deletes_removed() {
        let mut reconciler = Reconciler::new();
        let a = Annotation::new("a");
        let b = Annotation::new("b");
        let c = Annotation::new("c");

        let first = reconciler.reconcile(&state(vec![a.clone(), b.clone()], vec![])).unwrap();
        assert_eq!(tags(&first.load), vec!["a", "b"]);
        assert!(first.delete.is_empty());

        let second = reconciler.reconcile(&state(vec![b, c], vec![])).unwrap();
        assert_eq!(tags(&second.load), vec!["c"]);
        assert_eq!(second.delete, vec![a.to_wire()]);
        assert_eq!(reconciler.in_frame_tags(), vec!["b", "c"]);
    }

    #[test]
    fn seeded_snapshot_is_sent_with_the_next_change() {
        let mut reconciler = Reconciler::new();
        let annotations = Arc::new(vec![Annotation::new("pre")]);
        reconciler.seed(&StoreState {
            annotations: annotations.clone(),
            frames: Arc::new(vec![]),
        });
        assert!(!reconciler.is_in_frame("pre"));

        let out = reconciler
            .reconcile(&StoreState {
                annotations,
                frames: Arc::new(vec![fetched(false)]),
            })
            .unwrap();
        assert_eq!(tags(&out.load), vec!["pre"]);
        assert!(reconciler.is_in_frame("pre"));
    }

    #[test]
    fn replies_are_never_sent() {
        let mut reconciler = Reconciler::new();
        let reply = Annotation::new("r").reply_to("a");
        let out = reconciler
            .reconcile(&state(vec![Annotation::new("a"), reply.clone()], vec![]))
            .unwrap();
        assert_eq!(tags(&out.load), vec!["a"]);
        assert!(!reconciler.is_in_frame("r"));

        let out = reconciler.reconcile(&state(vec![Annotation::new("a")], vec![])).unwrap();
        assert!(out.is_empty());
    }

    #[test]
    fn annotations_created_in_a_guest_are_not_sent_back() {
        let mut reconciler = Reconciler::new();
        reconciler.mark_in_frame("new");
        let out = reconciler
            .reconcile(&state(vec![Annotation::new("new")], vec![]))
            .unwrap();
        assert!(out.load.is_empty());
    }

    #[test]
    fn unchanged_snapshot_is_skipped() {
        let mut reconciler = Reconciler::new();
        let snapshot = state(vec![Annotation::new("a")], vec![]);
        assert!(reconciler.reconcile(&snapshot).is_some());
        assert!(reconciler.reconcile(&snapshot.clone()).is_none());

        let same_content = state(vec![Annotation::new("a")], vec![]);
        assert!(reconciler.reconcile(&same_content).unwrap().is_empty());
    }

    #[test]
    fn public_count_waits_for_every_frame() {
        let mut reconciler = Reconciler::new();
        let anns = vec![
            Annotation::new("a").shared_with("__world__"),
            Annotation::new("b").private_to("acct:me@example.com"),
        ];
        let out = reconciler
            .reconcile(&state(anns.clone(), vec![fetched(true), fetched(false)]))
            .unwrap();
        assert_eq!(out.public_count, None);

        let out = reconciler
            .reconcile(&state(anns.clone(), vec![fetched(true), fetched(true)]))
            .unwrap();
        assert_eq!(out.public_count, Some(1));

        let out = reconciler
            .reconcile(&state(anns, vec![fetched(true), fetched(true)]))
            .unwrap();
        assert_eq!(out.public_count, None);
    }

    #[test]
    fn public_count_fires_once_per_distinct_value() {
        let mut reconciler = Reconciler::new();
        let frames = vec![fetched(true)];
        let mut sent = Vec::new();
        for anns in [
            vec![],
            vec![],
            vec![Annotation::new("a").shared_with("g")],
            vec![Annotation::new("a").shared_with("g"), Annotation::new("b")],
            vec![],
        ] {
            let out = reconciler.reconcile(&state(anns, frames.clone())).unwrap();
            sent.extend(out.public_count);
        }
        assert_eq!(sent, vec![0, 1, 0]);
    }

    #[test]
    fn no_frames_means_no_count() {
        let mut reconciler = Reconciler::new();
        let out = reconciler
            .reconcile(&state(vec![Annotation::new("a").shared_with("g")], vec![]))
            .unwrap();
        assert_eq!(out.public_count, None);
    }

    #[tokio::test(start_paused = true)]
    async fn batcher_flushes_one_burst_once() {
        let flushes = Arc::new(Mutex::new(Vec::new()));
        let sink = flushes.clone();
        let batcher = AnchorBatcher::spawn(
            Duration::from_millis(10),
            CancellationToken::new(),
            move |batch| sink.lock().unwrap().push(batch),
        );

        for i in 0..50 {
            let status = if i % 2 == 0 {
                AnchorStatus::Anchored
            } else {
                AnchorStatus::Orphan
            };
            batcher.push(&format!("t{i}"), status);
        }
        tokio::time::sleep(Duration::from_millis(50)).await;

        let flushes = flushes.lock().unwrap();
        assert_eq!(flushes.len(), 1);
        assert_eq!(flushes[0].len(), 50);
        assert_eq!(flushes[0]["t0"], AnchorStatus::Anchored);
        assert_eq!(flushes[0]["t1"], AnchorStatus::Orphan);
    }

    #[tokio::test(start_paused = true)]
    async fn batcher_waits_for_quiet_period() {
        let count = Arc::new(AtomicUsize::new(0));
        let counter = count.clone();
        let batcher = AnchorBatcher::spawn(
            Duration::from_millis(10),
            CancellationToken::new(),
            move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            },
        );

        for i in 0..5 {
            batcher.push(&format!("t{i}"), AnchorStatus::Anchored);
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(count.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);

        batcher.push("late", AnchorStatus::Orphan);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn batcher_stops_on_cancel() {
        let count = Arc::new(AtomicUsize::new(0));
        let counter = count.clone();
        let cancel = CancellationToken::new();
        let batcher = AnchorBatcher::spawn(Duration::from_millis(10), cancel.clone(), move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        batcher.push("t1", AnchorStatus::Anchored);
        cancel.cancel();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn tags_argument_tolerates_null() {
        assert!(tags_arg(&[]).is_empty());
        assert!(tags_arg(&[Value::Null]).is_empty());
        assert_eq!(
            tags_arg(&[serde_json::json!(["t1", 2, "t3"])]),
            vec!["t1", "t3"]
        );
    }

    #[tokio::test]
    async fn connect_twice_fails_and_closed_stays_closed() {
        let tree = frame_rpc::ContextTree::new();
        let sidebar = tree.create_top("https://sidebar.example");
        let sync = FrameSync::new(sidebar, Arc::new(MemoryStore::new()), SyncConfig::default());

        sync.connect().unwrap();
        assert!(sync.is_connected());
        assert!(matches!(sync.connect(), Err(SyncError::AlreadyConnected)));

        sync.disconnect();
        assert!(!sync.is_connected());
        assert!(!sync.discovery().is_active());
        assert!(matches!(sync.connect(), Err(SyncError::Closed)));
    }

    #[test]
    fn document_info_uses_camel_case() {
        let info: DocumentInfo = serde_json::from_value(serde_json::json!({
            "frameIdentifier": "sub-1",
            "uri": "http://example.com",
        }))
        .unwrap();
        assert_eq!(info.frame_identifier.as_deref(), Some("sub-1"));
        assert_eq!(info.metadata, Value::Null);
    }
}
