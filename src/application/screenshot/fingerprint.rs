//! Cache keys for rendered cards.
//!
//! A key covers everything that can change how a card looks: the card's own
//! visual fields, which of its links point at published cards, the pipeline
//! version and the tag of the last deploy that affected rendering. Two card
//! states that render identically always map to the same key.

use std::fmt::{self, Write as _};

use serde_json::Value;
use sha2::{Digest, Sha256};
use thiserror::Error;
use time::{OffsetDateTime, macros::format_description};

use crate::domain::cards::{Card, RelatedCards};

/// Bump whenever capture settings or orchestration change in a way that
/// should produce a new image for an unchanged card.
pub const PIPELINE_VERSION: u32 = 7;

const KEY_PREFIX: &str = "screenshots";
const KEY_EXTENSION: &str = "png";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DeployTagError {
    #[error("deploy tag must not be empty")]
    Empty,
    #[error("deploy tag contains unsupported character `{0}`")]
    InvalidCharacter(char),
}

/// Marker of the last deploy that could have changed how cards render.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeployTag(String);

impl DeployTag {
    pub fn parse(value: impl Into<String>) -> Result<Self, DeployTagError> {
        let value = value.into();
        if value.is_empty() {
            return Err(DeployTagError::Empty);
        }
        if let Some(ch) = value
            .chars()
            .find(|ch| !(ch.is_ascii_alphanumeric() || matches!(ch, '-' | '_' | '.')))
        {
            return Err(DeployTagError::InvalidCharacter(ch));
        }
        if value == "." || value == ".." {
            return Err(DeployTagError::InvalidCharacter('.'));
        }
        Ok(Self(value))
    }

    /// Tag for a deploy happening at `at`, e.g. `deploy-2024-01-01-00-00`.
    ///
    /// Components are zero-padded so tags sort in deploy order.
    pub fn for_time(at: OffsetDateTime) -> Self {
        let format = format_description!("deploy-[year]-[month]-[day]-[hour]-[minute]");
        let value = at
            .format(&format)
            .unwrap_or_else(|_| format!("deploy-{}", at.unix_timestamp()));
        Self(value)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeployTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Storage address of one rendered card state.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Fingerprint {
    pipeline_version: u32,
    deploy_tag: DeployTag,
    card_id: String,
    digest: String,
}

impl Fingerprint {
    pub fn digest(&self) -> &str {
        &self.digest
    }

    /// `screenshots/v{version}/{deploy_tag}/{card_id}/{digest}.png`, with the
    /// card id form-encoded into a single path segment.
    pub fn path(&self) -> String {
        format!(
            "{KEY_PREFIX}/v{}/{}/{}/{}.{KEY_EXTENSION}",
            self.pipeline_version,
            self.deploy_tag,
            card_id_segment(&self.card_id),
            self.digest
        )
    }
}

/// Encode a card id as one key segment. `/` and `%` are escaped by the form
/// encoding; ids made only of dots have each dot escaped so the segment never
/// reads as `.` or `..`.
fn card_id_segment(card_id: &str) -> String {
    let encoded: String = url::form_urlencoded::byte_serialize(card_id.as_bytes()).collect();
    if encoded.bytes().all(|byte| byte == b'.') {
        encoded.replace('.', "%2E")
    } else {
        encoded
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.path())
    }
}

/// Computes fingerprints for a fixed pipeline version and deploy tag.
#[derive(Debug, Clone)]
pub struct FingerprintBuilder {
    pipeline_version: u32,
    deploy_tag: DeployTag,
}

impl FingerprintBuilder {
    pub fn new(pipeline_version: u32, deploy_tag: DeployTag) -> Self {
        Self {
            pipeline_version,
            deploy_tag,
        }
    }

    pub fn deploy_tag(&self) -> &DeployTag {
        &self.deploy_tag
    }

    pub fn compute(&self, card: &Card, related: &RelatedCards) -> Fingerprint {
        Fingerprint {
            pipeline_version: self.pipeline_version,
            deploy_tag: self.deploy_tag.clone(),
            card_id: card.id.clone(),
            digest: content_digest(card, related),
        }
    }
}

/// Hex SHA-256 over the visually relevant state of `card`.
///
/// Every component is length-prefixed, so no choice of field contents can make
/// two different states produce the same hash input.
pub fn content_digest(card: &Card, related: &RelatedCards) -> String {
    let mut input = String::new();
    push_component(&mut input, card.title.as_deref().unwrap_or_default());
    push_component(&mut input, card.subtitle.as_deref().unwrap_or_default());
    push_component(&mut input, card.body.as_deref().unwrap_or_default());
    push_component(&mut input, &card.star_count.unwrap_or(0).to_string());
    push_component(&mut input, &published_related_ids(related));
    push_component(&mut input, &canonical_images(card.images.as_deref()));

    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    hex::encode(hasher.finalize())
}

fn push_component(buf: &mut String, value: &str) {
    let _ = write!(buf, "{}:{value};", value.len());
}

/// Published related ids in byte order, each length-prefixed.
fn published_related_ids(related: &RelatedCards) -> String {
    let mut ids: Vec<&str> = related
        .iter()
        .filter(|(_, card)| card.published)
        .map(|(id, _)| id.as_str())
        .collect();
    ids.sort_unstable();

    let mut segment = String::new();
    for id in ids {
        push_component(&mut segment, id);
    }
    segment
}

/// Missing and empty image lists serialize identically.
fn canonical_images(images: Option<&[Value]>) -> String {
    let mut out = String::new();
    out.push('[');
    for (index, image) in images.unwrap_or_default().iter().enumerate() {
        if index > 0 {
            out.push(',');
        }
        write_canonical(image, &mut out);
    }
    out.push(']');
    out
}

/// Compact JSON with object keys in byte order at every depth.
pub(crate) fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(&String, &Value)> = map.iter().collect();
            entries.sort_unstable_by(|(a, _), (b, _)| a.cmp(b));
            out.push('{');
            for (index, (key, value)) in entries.into_iter().enumerate() {
                if index > 0 {
                    out.push(',');
                }
                write_json_string(key, out);
                out.push(':');
                write_canonical(value, out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (index, item) in items.iter().enumerate() {
                if index > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        Value::String(text) => write_json_string(text, out),
        Value::Number(number) => {
            let _ = write!(out, "{number}");
        }
        Value::Bool(flag) => out.push_str(if *flag { "true" } else { "false" }),
        Value::Null => out.push_str("null"),
    }
}

fn write_json_string(text: &str, out: &mut String) {
    // Serializing a &str cannot fail.
    match serde_json::to_string(text) {
        Ok(encoded) => out.push_str(&encoded),
        Err(_) => out.push_str("\"\""),
    }
}
