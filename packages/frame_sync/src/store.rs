//! The central annotation state FrameSync reads from and writes to.
//!
//! The rest of the application owns this state; FrameSync only depends on the
//! [`AnnotationStore`] trait. [`MemoryStore`] is a complete in-memory
//! implementation backed by a tokio `watch` channel.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::watch;
use tracing::debug;

use crate::annotation::Annotation;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AnchorStatus {
    Anchored,
    Orphan,
    Timeout,
}

/// Coalesced anchoring results, keyed by annotation tag.
pub type AnchorStatusBatch = BTreeMap<String, AnchorStatus>;

/// A connected guest document.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FrameInfo {
    /// `None` for the main frame; sub-frames carry an identifier.
    pub id: Option<String>,
    pub uri: String,
    #[serde(default)]
    pub metadata: Value,
    #[serde(default)]
    pub is_annotation_fetch_complete: bool,
}

/// Snapshot of the central state. Each collection is replaced, never mutated
/// in place, so a changed collection is detectable by pointer.
#[derive(Clone, Debug, Default)]
pub struct StoreState {
    pub annotations: Arc<Vec<Annotation>>,
    pub frames: Arc<Vec<FrameInfo>>,
}

pub trait AnnotationStore: Send + Sync {
    fn state(&self) -> StoreState;

    /// Observe every state change.
    fn subscribe(&self) -> watch::Receiver<StoreState>;

    /// Add a frame, replacing any frame with the same id.
    fn connect_frame(&self, frame: FrameInfo);

    /// Remove the frame with the given id. Returns whether one was found.
    fn destroy_frame(&self, id: Option<&str>) -> bool;

    fn update_frame_annotation_fetch_status(&self, uri: &str, complete: bool);

    fn update_anchor_status(&self, batch: &AnchorStatusBatch);

    /// Server ids of the annotations with the given tags. Annotations not yet
    /// saved have no id and are skipped.
    fn find_ids_for_tags(&self, tags: &[String]) -> Vec<String>;
}

pub struct MemoryStore {
    state: watch::Sender<StoreState>,
    anchor_updates: AtomicUsize,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        let (state, _) = watch::channel(StoreState::default());
        Self {
            state,
            anchor_updates: AtomicUsize::new(0),
        }
    }

    pub fn annotations(&self) -> Arc<Vec<Annotation>> {
        self.state.borrow().annotations.clone()
    }

    pub fn frames(&self) -> Arc<Vec<FrameInfo>> {
        self.state.borrow().frames.clone()
    }

    pub fn annotation(&self, tag: &str) -> Option<Annotation> {
        self.state
            .borrow()
            .annotations
            .iter()
            .find(|ann| ann.tag == tag)
            .cloned()
    }

    /// Replace the whole collection in one change.
    pub fn set_annotations(&self, annotations: Vec<Annotation>) {
        self.state.send_modify(|state| state.annotations = Arc::new(annotations));
    }

    /// Add annotations, replacing existing ones with the same tag.
    pub fn add_annotations(&self, added: Vec<Annotation>) {
        self.state.send_modify(|state| {
            let mut annotations = state.annotations.as_ref().clone();
            for ann in added {
                match annotations.iter_mut().find(|a| a.tag == ann.tag) {
                    Some(existing) => *existing = ann,
                    None => annotations.push(ann),
                }
            }
            state.annotations = Arc::new(annotations);
        });
    }

    pub fn remove_annotations(&self, tags: &[String]) {
        let tags: HashSet<&str> = tags.iter().map(String::as_str).collect();
        self.state.send_modify(|state| {
            let annotations = state
                .annotations
                .iter()
                .filter(|ann| !tags.contains(ann.tag.as_str()))
                .cloned()
                .collect();
            state.annotations = Arc::new(annotations);
        });
    }

    /// How many times [`AnnotationStore::update_anchor_status`] has run.
    pub fn anchor_update_count(&self) -> usize {
        self.anchor_updates.load(Ordering::SeqCst)
    }
}

impl AnnotationStore for MemoryStore {
    fn state(&self) -> StoreState {
        self.state.borrow().clone()
    }

    fn subscribe(&self) -> watch::Receiver<StoreState> {
        self.state.subscribe()
    }

    fn connect_frame(&self, frame: FrameInfo) {
        debug!(frame = ?frame.id, uri = %frame.uri, "frame connected");
        self.state.send_modify(|state| {
            let mut frames = state.frames.as_ref().clone();
            match frames.iter_mut().find(|f| f.id == frame.id) {
                Some(existing) => *existing = frame,
                None => frames.push(frame),
            }
            state.frames = Arc::new(frames);
        });
    }

    fn destroy_frame(&self, id: Option<&str>) -> bool {
        self.state.send_if_modified(|state| {
            let Some(index) = state.frames.iter().position(|f| f.id.as_deref() == id) else {
                return false;
            };
            let mut frames = state.frames.as_ref().clone();
            frames.remove(index);
            state.frames = Arc::new(frames);
            true
        })
    }

    fn update_frame_annotation_fetch_status(&self, uri: &str, complete: bool) {
        self.state.send_modify(|state| {
            let frames = state
                .frames
                .iter()
                .map(|frame| {
                    if !frame.uri.is_empty() && frame.uri == uri {
                        FrameInfo {
                            is_annotation_fetch_complete: complete,
                            ..frame.clone()
                        }
                    } else {
                        frame.clone()
                    }
                })
                .collect();
            state.frames = Arc::new(frames);
        });
    }

    fn update_anchor_status(&self, batch: &AnchorStatusBatch) {
        self.anchor_updates.fetch_add(1, Ordering::SeqCst);
        self.state.send_modify(|state| {
            let annotations = state
                .annotations
                .iter()
                .map(|ann| match batch.get(&ann.tag) {
                    None => ann.clone(),
                    Some(AnchorStatus::Timeout) => Annotation {
                        anchor_timeout: true,
                        ..ann.clone()
                    },
                    Some(status) => Annotation {
                        orphan: Some(*status == AnchorStatus::Orphan),
                        ..ann.clone()
                    },
                })
                .collect();
            state.annotations = Arc::new(annotations);
        });
    }

    fn find_ids_for_tags(&self, tags: &[String]) -> Vec<String> {
        self.state
            .borrow()
            .annotations
            .iter()
            .filter(|ann| tags.contains(&ann.tag))
            .filter_map(|ann| ann.id.clone())
            .collect()
    }
}
