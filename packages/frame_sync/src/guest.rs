//! Guest-side peer, living in an annotated document.
//!
//! Finds the sidebar with client-role discovery, describes its document,
//! "anchors" the annotations it is sent and reports the results back through
//! `sync`. Commands it receives are published as [`GuestEvent`]s.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use frame_rpc::{Bridge, BridgeConfig, Context, ContextId, Discovery, DiscoveryOptions};
use serde_json::{Value, json};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::annotation::{Annotation, WireAnnotation};
use crate::config::SyncConfig;
use crate::error::SyncError;
use crate::sync::DocumentInfo;
use crate::sync::methods::*;

const EVENT_CAPACITY: usize = 256;

#[derive(Clone, Debug)]
pub struct GuestConfig {
    /// `None` for the main frame.
    pub frame_identifier: Option<String>,
    pub uri: String,
    pub metadata: Value,
    pub bridge: BridgeConfig,
    pub discovery_origin: String,
    pub namespace: String,
}

impl GuestConfig {
    /// A main-frame guest using the same timeouts and namespace as `sync`.
    pub fn new(uri: impl Into<String>, sync: &SyncConfig) -> Self {
        Self {
            frame_identifier: None,
            uri: uri.into(),
            metadata: Value::Null,
            bridge: sync.bridge.clone(),
            discovery_origin: sync.discovery_origin.clone(),
            namespace: sync.namespace.clone(),
        }
    }

    pub fn with_frame_identifier(mut self, id: impl Into<String>) -> Self {
        self.frame_identifier = Some(id.into());
        self
    }

    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = metadata;
        self
    }

    fn document_info(&self) -> DocumentInfo {
        DocumentInfo {
            frame_identifier: self.frame_identifier.clone(),
            metadata: self.metadata.clone(),
            uri: self.uri.clone(),
        }
    }
}

/// What the sidebar asked this guest to do.
#[derive(Clone, Debug, PartialEq)]
pub enum GuestEvent {
    Connected(ContextId),
    AnnotationsLoaded(Vec<String>),
    AnnotationDeleted(String),
    PublicAnnotationCount(u64),
    FocusAnnotations(Vec<String>),
    ScrollToAnnotation(String),
    ShowSidebar,
    HideSidebar,
    SetVisibleHighlights(bool),
}

/// An annotation whose target has no selectors cannot be located.
fn anchors(wire: &WireAnnotation) -> bool {
    match &wire.msg.target {
        Value::Null => false,
        Value::Array(targets) => !targets.is_empty(),
        _ => true,
    }
}

#[derive(Default)]
struct GuestState {
    anchored: BTreeMap<String, WireAnnotation>,
}

pub struct Guest {
    context: Context,
    config: GuestConfig,
    bridge: Bridge,
    discovery: Discovery,
    state: Arc<Mutex<GuestState>>,
    events: broadcast::Sender<GuestEvent>,
}

impl Guest {
    pub fn new(context: Context, config: GuestConfig) -> Self {
        let bridge = Bridge::new(context.clone(), config.bridge.clone());
        let discovery = Discovery::new(
            context.clone(),
            DiscoveryOptions::client()
                .with_origin(config.discovery_origin.clone())
                .with_namespace(config.namespace.clone()),
        );
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            context,
            config,
            bridge,
            discovery,
            state: Arc::new(Mutex::new(GuestState::default())),
            events,
        }
    }

    fn lock(&self) -> MutexGuard<'_, GuestState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn context(&self) -> &Context {
        &self.context
    }

    pub fn config(&self) -> &GuestConfig {
        &self.config
    }

    pub fn bridge(&self) -> &Bridge {
        &self.bridge
    }

    pub fn subscribe(&self) -> broadcast::Receiver<GuestEvent> {
        self.events.subscribe()
    }

    /// Tags of every annotation currently held by this document.
    pub fn annotation_tags(&self) -> Vec<String> {
        self.lock().anchored.keys().cloned().collect()
    }

    pub fn has_annotation(&self, tag: &str) -> bool {
        self.lock().anchored.contains_key(tag)
    }

    /// Expose the guest methods and look for the sidebar.
    /// Must be called inside a tokio runtime.
    pub fn connect(&self) -> Result<(), SyncError> {
        self.register_handlers()?;

        let events = self.events.clone();
        self.bridge.on_connect(move |_, peer| {
            let _ = events.send(GuestEvent::Connected(peer));
        });

        let bridge = self.bridge.clone();
        self.discovery.start_discovery(move |peer, origin, token| {
            if let Err(e) = bridge.create_channel(peer, &origin, &token) {
                warn!(peer = %peer, error = %e, "could not open channel to sidebar");
            }
        })?;
        info!(context = %self.context.id(), uri = %self.config.uri, "guest looking for sidebar");
        Ok(())
    }

    fn register_handlers(&self) -> Result<(), frame_rpc::BridgeError> {
        let info = self.config.document_info();
        self.bridge.on(GET_DOCUMENT_INFO, move |_, _, reply| {
            reply.ok(serde_json::to_value(&info).unwrap_or(Value::Null));
        })?;

        let state = self.state.clone();
        let events = self.events.clone();
        let bridge = self.bridge.clone();
        self.bridge.on(LOAD_ANNOTATIONS, move |ctx, args, reply| {
            let wires: Vec<WireAnnotation> =
                match serde_json::from_value(args.first().cloned().unwrap_or(Value::Null)) {
                    Ok(wires) => wires,
                    Err(e) => {
                        debug!(peer = %ctx.peer, error = %e, "malformed loadAnnotations");
                        return;
                    }
                };
            reply.done();

            let mut results = Vec::with_capacity(wires.len());
            let mut tags = Vec::with_capacity(wires.len());
            {
                let mut state = state.lock().unwrap_or_else(PoisonError::into_inner);
                for wire in wires {
                    results.push(json!({
                        "tag": wire.tag,
                        "msg": { "$orphan": !anchors(&wire) },
                    }));
                    tags.push(wire.tag.clone());
                    state.anchored.insert(wire.tag.clone(), wire);
                }
            }
            bridge.notify(SYNC, vec![Value::Array(results)]);
            let _ = events.send(GuestEvent::AnnotationsLoaded(tags));
        })?;

        let state = self.state.clone();
        let events = self.events.clone();
        self.bridge.on(DELETE_ANNOTATION, move |_, args, reply| {
            let Some(tag) = args.first().and_then(|w| w.get("tag")).and_then(Value::as_str) else {
                return;
            };
            reply.done();
            state
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .anchored
                .remove(tag);
            let _ = events.send(GuestEvent::AnnotationDeleted(tag.to_string()));
        })?;

        let events = self.events.clone();
        self.bridge
            .on(PUBLIC_ANNOTATION_COUNT_CHANGED, move |_, args, reply| {
                if let Some(count) = args.first().and_then(Value::as_u64) {
                    reply.done();
                    let _ = events.send(GuestEvent::PublicAnnotationCount(count));
                }
            })?;

        let events = self.events.clone();
        self.bridge.on(FOCUS_ANNOTATIONS, move |_, args, reply| {
            reply.done();
            let tags = args
                .first()
                .and_then(|v| serde_json::from_value(v.clone()).ok())
                .unwrap_or_default();
            let _ = events.send(GuestEvent::FocusAnnotations(tags));
        })?;

        let events = self.events.clone();
        self.bridge.on(SCROLL_TO_ANNOTATION, move |_, args, reply| {
            if let Some(tag) = args.first().and_then(Value::as_str) {
                reply.done();
                let _ = events.send(GuestEvent::ScrollToAnnotation(tag.to_string()));
            }
        })?;

        for (method, event) in [
            (SHOW_SIDEBAR, GuestEvent::ShowSidebar),
            (HIDE_SIDEBAR, GuestEvent::HideSidebar),
        ] {
            let events = self.events.clone();
            self.bridge.on(method, move |_, _, reply| {
                reply.done();
                let _ = events.send(event.clone());
            })?;
        }

        let events = self.events.clone();
        self.bridge.on(SET_VISIBLE_HIGHLIGHTS, move |_, args, reply| {
            if let Some(visible) = args.first().and_then(Value::as_bool) {
                reply.done();
                let _ = events.send(GuestEvent::SetVisibleHighlights(visible));
            }
        })?;
        Ok(())
    }

    /// Tell the sidebar about an annotation the user started creating here.
    pub fn before_create_annotation(&self, annotation: &Annotation) {
        let mut msg = serde_json::to_value(annotation).unwrap_or(Value::Null);
        if let Some(fields) = msg.as_object_mut() {
            fields.remove("$tag");
        }
        self.lock()
            .anchored
            .insert(annotation.tag.clone(), annotation.to_wire());
        self.bridge.notify(
            BEFORE_CREATE_ANNOTATION,
            vec![json!({ "tag": annotation.tag, "msg": msg })],
        );
    }

    /// Report that this document is going away.
    pub fn destroy_frame(&self) {
        let id = self.config.frame_identifier.clone().map_or(Value::Null, Value::String);
        self.bridge.notify(DESTROY_FRAME, vec![id]);
    }

    pub fn show_annotations(&self, tags: &[String]) {
        self.bridge
            .notify(SHOW_ANNOTATIONS, vec![Value::from(tags.to_vec())]);
    }

    pub fn show_bucket_list(&self, tags: &[String]) {
        self.bridge
            .notify(SHOW_BUCKET_LIST, vec![Value::from(tags.to_vec())]);
    }

    pub fn focus_annotations(&self, tags: &[String]) {
        self.bridge
            .notify(FOCUS_ANNOTATIONS, vec![Value::from(tags.to_vec())]);
    }

    pub fn toggle_annotation_selection(&self, tags: &[String]) {
        self.bridge
            .notify(TOGGLE_ANNOTATION_SELECTION, vec![Value::from(tags.to_vec())]);
    }

    pub fn sidebar_opened(&self) {
        self.bridge.notify(SIDEBAR_OPENED, Vec::new());
    }

    /// Ask the sidebar to open; it forwards the request to every guest.
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

    pub fn disconnect(&self) {
        self.discovery.stop_discovery();
        for method in [
            GET_DOCUMENT_INFO,
            LOAD_ANNOTATIONS,
            DELETE_ANNOTATION,
            PUBLIC_ANNOTATION_COUNT_CHANGED,
            FOCUS_ANNOTATIONS,
            SCROLL_TO_ANNOTATION,
            SHOW_SIDEBAR,
            HIDE_SIDEBAR,
            SET_VISIBLE_HIGHLIGHTS,
        ] {
            self.bridge.off(method);
        }
        self.bridge.destroy();
    }
}

impl Drop for Guest {
    fn drop(&mut self) {
        self.disconnect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wire(tag: &str, target: Value) -> WireAnnotation {
        Annotation::new(tag).with_target(target).to_wire()
    }

    #[test]
    fn empty_targets_are_orphans() {
        assert!(!anchors(&wire("t1", Value::Null)));
        assert!(!anchors(&wire("t2", json!([]))));
        assert!(anchors(&wire("t3", json!([{"selector": []}]))));
    }

    #[test]
    fn document_info_reflects_config() {
        let config = GuestConfig::new("http://example.com", &SyncConfig::default())
            .with_frame_identifier("sub-1")
            .with_metadata(json!({"title": "Example"}));
        let info = serde_json::to_value(config.document_info()).unwrap();
        assert_eq!(
            info,
            json!({
                "frameIdentifier": "sub-1",
                "metadata": {"title": "Example"},
                "uri": "http://example.com",
            })
        );
    }

    #[tokio::test]
    async fn connecting_twice_fails() {
        let tree = frame_rpc::ContextTree::new();
        let top = tree.create_top("http://example.com");
        let guest = Guest::new(top, GuestConfig::new("http://example.com", &SyncConfig::default()));
        guest.connect().unwrap();
        assert!(matches!(guest.connect(), Err(SyncError::Bridge(_))));
    }
}
