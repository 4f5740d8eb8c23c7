//! Card entities as seen by the snapshot pipeline.
//!
//! Only the fields that influence how a card looks are typed. Everything else
//! the data layer hands over is retained verbatim so it can be injected into
//! the rendering host untouched.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A content entity that can be rendered into a preview image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Card {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subtitle: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub star_count: Option<i64>,
    /// Image descriptors in display order. Descriptor shape is owned by the
    /// rendering host, so they stay untyped.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub images: Option<Vec<Value>>,
    #[serde(default)]
    pub published: bool,
    /// Identifiers of cards this card links to.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub links: Vec<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Card {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: None,
            subtitle: None,
            body: None,
            star_count: None,
            images: None,
            published: false,
            links: Vec::new(),
            extra: Map::new(),
        }
    }

    pub fn is_published(&self) -> bool {
        self.published
    }
}

/// Projection of a linked card. `published` decides link styling; the rest is
/// passed through to the rendering host.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RelatedCard {
    #[serde(default)]
    pub published: bool,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl RelatedCard {
    pub fn published() -> Self {
        Self {
            published: true,
            extra: Map::new(),
        }
    }

    pub fn unpublished() -> Self {
        Self::default()
    }
}

/// Related cards keyed by identifier.
pub type RelatedCards = BTreeMap<String, RelatedCard>;
