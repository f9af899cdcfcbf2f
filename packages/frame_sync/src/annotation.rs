//! Annotation records as the sidebar holds them, and the minimal projection
//! that is sent to guest documents.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Permissions {
    #[serde(default)]
    pub read: Vec<String>,
}

/// An annotation in the central collection. Content is opaque apart from the
/// handful of fields needed to decide where it goes; everything else is kept
/// as-is in `extra`.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Annotation {
    /// Local tag, assigned before the annotation has a server id.
    #[serde(rename = "$tag")]
    pub tag: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub references: Vec<String>,
    #[serde(default)]
    pub permissions: Permissions,
    #[serde(default)]
    pub document: Value,
    #[serde(default)]
    pub target: Value,
    #[serde(default)]
    pub uri: String,
    #[serde(rename = "$orphan", default, skip_serializing_if = "Option::is_none")]
    pub orphan: Option<bool>,
    #[serde(rename = "$anchorTimeout", default, skip_serializing_if = "is_false")]
    pub anchor_timeout: bool,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

fn is_false(value: &bool) -> bool {
    !*value
}

impl Annotation {
    pub fn new(tag: impl Into<String>) -> Self {
        Self {
            tag: tag.into(),
            ..Default::default()
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_uri(mut self, uri: impl Into<String>) -> Self {
        self.uri = uri.into();
        self
    }

    pub fn with_target(mut self, target: Value) -> Self {
        self.target = target;
        self
    }

    /// Make this a reply in the thread rooted at `parent`.
    pub fn reply_to(mut self, parent: impl Into<String>) -> Self {
        self.references.push(parent.into());
        self
    }

    /// Shared with the given group.
    pub fn shared_with(mut self, group: &str) -> Self {
        self.permissions.read.push(format!("group:{group}"));
        self
    }

    /// Readable only by `user`.
    pub fn private_to(mut self, user: &str) -> Self {
        self.permissions.read.push(user.to_string());
        self
    }

    pub fn is_reply(&self) -> bool {
        !self.references.is_empty()
    }

    /// Public annotations are readable by a principal of the exact form
    /// `group:<id>`.
    pub fn is_public(&self) -> bool {
        self.permissions.read.iter().any(|principal| {
            let mut parts = principal.split(':');
            parts.next() == Some("group") && parts.next().is_some() && parts.next().is_none()
        })
    }

    /// Build an annotation from a guest's `beforeCreateAnnotation` payload.
    pub fn from_guest(tag: &str, msg: &Value) -> Result<Self, serde_json::Error> {
        let mut fields = match msg {
            Value::Object(fields) => fields.clone(),
            _ => Map::new(),
        };
        fields.insert("$tag".into(), Value::String(tag.to_string()));
        serde_json::from_value(Value::Object(fields))
    }

    pub fn to_wire(&self) -> WireAnnotation {
        WireAnnotation {
            tag: self.tag.clone(),
            msg: WireMessage {
                document: self.document.clone(),
                target: self.target.clone(),
                uri: self.uri.clone(),
            },
        }
    }
}

/// The subset of an annotation a guest needs to anchor it. Guest documents
/// may run untrusted script, so nothing else crosses the channel.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WireAnnotation {
    pub tag: String,
    pub msg: WireMessage,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct WireMessage {
    #[serde(default)]
    pub document: Value,
    #[serde(default)]
    pub target: Value,
    #[serde(default)]
    pub uri: String,
}
