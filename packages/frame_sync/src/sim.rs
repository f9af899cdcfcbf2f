//! End-to-end simulation: one host page, a sidebar frame and N guest documents
//! in a single context tree, exercised through the full sync lifecycle.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context as _, Result, bail};
use frame_rpc::ContextTree;
use serde::Serialize;
use serde_json::json;
use tokio::sync::broadcast;
use tokio::time::timeout;
use tracing::info;
use uuid::Uuid;

use crate::annotation::Annotation;
use crate::config::SyncConfig;
use crate::events::{SyncEvent, next_event};
use crate::guest::{Guest, GuestConfig, GuestEvent};
use crate::store::{AnnotationStore, MemoryStore};
use crate::sync::FrameSync;

const HOST_ORIGIN: &str = "https://example.com";
const SIDEBAR_ORIGIN: &str = "https://sidebar.example";

#[derive(Clone, Debug)]
pub struct SimOptions {
    pub guests: usize,
    pub annotations: usize,
    pub config: SyncConfig,
    /// Upper bound on each wait for a step to complete.
    pub step_timeout: Duration,
}

impl Default for SimOptions {
    fn default() -> Self {
        Self {
            guests: 3,
            annotations: 20,
            config: SyncConfig::default(),
            step_timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct SimReport {
    pub frames_connected: usize,
    pub annotations: usize,
    pub in_frame: usize,
    pub anchored: usize,
    pub orphaned: usize,
    pub public_count: Option<u64>,
    pub anchor_updates: usize,
    pub deleted: Option<String>,
}

/// Every third annotation is public, every fourth has nothing to anchor to,
/// every fifth is a reply to the one before it.
fn annotations_for(uri: &str, count: usize) -> Vec<Annotation> {
    (0..count)
        .map(|i| {
            let mut ann = Annotation::new(format!("t{i}"))
                .with_id(Uuid::new_v4().to_string())
                .with_uri(uri);
            if i % 4 != 3 {
                ann = ann.with_target(json!([{ "source": uri, "selector": [] }]));
            }
            ann = if i % 3 == 0 {
                ann.shared_with("__world__")
            } else {
                ann.private_to("acct:sim@example.com")
            };
            if i > 0 && i % 5 == 0 {
                ann = ann.reply_to(format!("t{}", i - 1));
            }
            ann
        })
        .collect()
}

async fn wait<T, F>(
    rx: &mut broadcast::Receiver<T>,
    step: Duration,
    what: &str,
    predicate: F,
) -> Result<T>
where
    T: Clone,
    F: FnMut(&T) -> bool,
{
    timeout(step, next_event(rx, predicate))
        .await
        .with_context(|| format!("Timed out waiting for {what}"))?
        .with_context(|| format!("Event stream closed while waiting for {what}"))
}

pub async fn run(options: SimOptions) -> Result<SimReport> {
    if options.guests == 0 {
        bail!("At least one guest is required");
    }
    let step = options.step_timeout;

    let tree = ContextTree::new();
    let host = tree.create_top(HOST_ORIGIN);
    let sidebar_context = host.create_child(SIDEBAR_ORIGIN);

    let store = Arc::new(MemoryStore::new());
    let sync = FrameSync::new(sidebar_context, store.clone(), options.config.clone());
    let mut sync_events = sync.subscribe();
    sync.connect().context("Failed to start frame sync")?;

    let mut guests = Vec::with_capacity(options.guests);
    let mut guest_events = Vec::with_capacity(options.guests);
    for i in 0..options.guests {
        let (context, config) = if i == 0 {
            (host.clone(), GuestConfig::new(HOST_ORIGIN, &options.config))
        } else {
            let uri = format!("{HOST_ORIGIN}/embed/{i}");
            (
                host.create_child(HOST_ORIGIN),
                GuestConfig::new(uri, &options.config)
                    .with_frame_identifier(Uuid::new_v4().to_string()),
            )
        };
        let guest = Guest::new(context, config);
        guest_events.push(guest.subscribe());
        guest.connect().context("Failed to start guest")?;
        guests.push(guest);
    }

    let mut frames_connected = 0;
    while frames_connected < options.guests {
        wait(&mut sync_events, step, "guest frames to connect", |e| {
            matches!(e, SyncEvent::FrameConnected { .. })
        })
        .await?;
        frames_connected += 1;
    }
    info!(frames = frames_connected, "all guests connected");

    let annotations = annotations_for(HOST_ORIGIN, options.annotations);
    let mut expected: BTreeSet<String> = annotations
        .iter()
        .filter(|ann| !ann.is_reply())
        .map(|ann| ann.tag.clone())
        .collect();
    let expected_count = expected.len();
    store.add_annotations(annotations);
    for guest in &guests {
        store.update_frame_annotation_fetch_status(&guest.config().uri, true);
    }

    while !expected.is_empty() {
        let event = wait(&mut sync_events, step, "anchoring results", |e| {
            matches!(e, SyncEvent::AnnotationsSynced(_))
        })
        .await?;
        if let SyncEvent::AnnotationsSynced(tags) = event {
            for tag in tags {
                expected.remove(&tag);
            }
        }
    }
    info!(annotations = expected_count, "annotations anchored in guests");

    let public_count = match wait(&mut guest_events[0], step, "public annotation count", |e| {
        matches!(e, GuestEvent::PublicAnnotationCount(_))
    })
    .await?
    {
        GuestEvent::PublicAnnotationCount(count) => Some(count),
        _ => None,
    };

    let deleted = store.annotations().iter().find(|a| !a.is_reply()).map(|a| a.tag.clone());
    if let Some(tag) = &deleted {
        store.remove_annotations(std::slice::from_ref(tag));
        wait(&mut guest_events[0], step, "annotation deletion", |e| {
            matches!(e, GuestEvent::AnnotationDeleted(t) if t == tag)
        })
        .await?;
    }

    let state = store.state();
    let report = SimReport {
        frames_connected,
        annotations: state.annotations.len(),
        in_frame: sync.in_frame_tags().len(),
        anchored: state.annotations.iter().filter(|a| a.orphan == Some(false)).count(),
        orphaned: state.annotations.iter().filter(|a| a.orphan == Some(true)).count(),
        public_count,
        anchor_updates: store.anchor_update_count(),
        deleted,
    };

    for guest in &guests {
        guest.disconnect();
    }
    sync.disconnect();
    info!(?report, "simulation finished");
    Ok(report)
}
