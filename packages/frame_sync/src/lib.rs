//! Annotation sync between a sidebar and the documents it annotates.
//!
//! The sidebar runs a [`FrameSync`] over an [`AnnotationStore`]; each annotated
//! document runs a [`Guest`]. Both sides find each other and talk through
//! [`frame_rpc`].

pub mod annotation;
pub mod config;
mod error;
pub mod events;
pub mod guest;
pub mod sim;
pub mod store;
pub mod sync;

pub use annotation::{Annotation, WireAnnotation};
pub use config::{SyncConfig, SyncFileConfig};
pub use error::SyncError;
pub use events::{SyncEvent, next_event};
pub use guest::{Guest, GuestConfig, GuestEvent};
pub use store::{
    AnchorStatus, AnchorStatusBatch, AnnotationStore, FrameInfo, MemoryStore, StoreState,
};
pub use sync::{AnchorBatcher, DocumentInfo, FrameSync, Outbound, Reconciler};
