//! Notifications FrameSync publishes to the rest of the sidebar application.

use frame_rpc::{ContextId, DiscoveryError};
use tokio::sync::broadcast;
use tracing::debug;

use crate::annotation::Annotation;
use crate::store::FrameInfo;

/// Events are broadcast; slow subscribers may observe `Lagged`.
#[derive(Clone, Debug, PartialEq)]
pub enum SyncEvent {
    /// A guest finished its handshake and described its document.
    FrameConnected { peer: ContextId, frame: FrameInfo },
    /// A guest reported that its document is going away.
    FrameDestroyed {
        peer: ContextId,
        frame_id: Option<String>,
    },
    /// A guest started creating an annotation that has no server id yet.
    BeforeAnnotationCreated(Annotation),
    /// A batch of anchoring results was applied to the store.
    AnnotationsSynced(Vec<String>),
    ShowAnnotations {
        tags: Vec<String>,
        ids: Vec<String>,
    },
    ShowBucketList(Vec<String>),
    FocusAnnotations(Vec<String>),
    ToggleAnnotationSelection {
        tags: Vec<String>,
        ids: Vec<String>,
    },
    SidebarOpened,
    /// Discovery stopped because the session has a second sidebar.
    DiscoveryFailed(DiscoveryError),
}

impl SyncEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::FrameConnected { .. } => "frame_connected",
            Self::FrameDestroyed { .. } => "frame_destroyed",
            Self::BeforeAnnotationCreated(_) => "before_annotation_created",
            Self::AnnotationsSynced(_) => "annotations_synced",
            Self::ShowAnnotations { .. } => "show_annotations",
            Self::ShowBucketList(_) => "show_bucket_list",
            Self::FocusAnnotations(_) => "focus_annotations",
            Self::ToggleAnnotationSelection { .. } => "toggle_annotation_selection",
            Self::SidebarOpened => "sidebar_opened",
            Self::DiscoveryFailed(_) => "discovery_failed",
        }
    }
}

/// Resolves with the next event matching `predicate`, skipping others.
/// Returns `None` once the sender is gone.
pub async fn next_event<T, F>(rx: &mut broadcast::Receiver<T>, mut predicate: F) -> Option<T>
where
    T: Clone,
    F: FnMut(&T) -> bool,
{
    loop {
        match rx.recv().await {
            Ok(event) if predicate(&event) => return Some(event),
            Ok(_) => {}
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                debug!(skipped, "event subscriber lagged");
            }
            Err(broadcast::error::RecvError::Closed) => return None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn next_event_skips_non_matching() {
        let (tx, mut rx) = broadcast::channel(8);
        tx.send(SyncEvent::SidebarOpened).unwrap();
        tx.send(SyncEvent::ShowBucketList(vec!["t1".into()])).unwrap();
        drop(tx);

        let event = next_event(&mut rx, |e| matches!(e, SyncEvent::ShowBucketList(_))).await;
        assert_eq!(event, Some(SyncEvent::ShowBucketList(vec!["t1".into()])));
        assert_eq!(next_event(&mut rx, |_| true).await, None);
    }
}
