//! Nostr event model.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Kinds for which only the latest event per author is kept (metadata and
/// contact list).
pub const REPLACEABLE_KINDS: [u32; 2] = [0, 3];

/// A tag entry: a small array whose first element names the tag and whose
/// following elements hold data.
///
/// - `e` – references another event id
/// - `p` – references another author's public key
/// - `d` – identifier for parameterized events
///
/// Tags are kept verbatim so custom tags survive a round trip.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tag(pub Vec<String>);

impl Tag {
    pub fn new<I, S>(fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(fields.into_iter().map(Into::into).collect())
    }

    /// Tag name (first element).
    pub fn name(&self) -> Option<&str> {
        self.0.first().map(String::as_str)
    }

    /// Primary value (second element).
    pub fn value(&self) -> Option<&str> {
        self.0.get(1).map(String::as_str)
    }
}

/// A signed event as submitted by a client and served back to subscribers.
///
/// ```json
/// {
///   "id": "5c83…",
///   "pubkey": "79be…",
///   "kind": 1,
///   "created_at": 1700000000,
///   "tags": [["e", "aa11…"], ["p", "bb22…"]],
///   "content": "hello",
///   "sig": "e4f1…"
/// }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    /// Event identifier (64 hex chars). Also the signed message.
    pub id: String,
    /// Author x-only public key (64 hex chars).
    pub pubkey: String,
    pub kind: u32,
    /// Author-declared Unix timestamp.
    pub created_at: i64,
    pub tags: Vec<Tag>,
    pub content: String,
    /// BIP-340 Schnorr signature over the raw `id` bytes (128 hex chars).
    pub sig: String,
}

impl Event {
    /// Whether this event replaces earlier events of the same author and kind.
    pub fn is_replaceable(&self) -> bool {
        REPLACEABLE_KINDS.contains(&self.kind)
    }

    /// Iterate `(name, value)` pairs of all tags that carry a value.
    pub fn tag_pairs(&self) -> impl Iterator<Item = (&str, &str)> {
        self.tags
            .iter()
            .filter_map(|tag| Some((tag.name()?, tag.value()?)))
    }

    /// SHA-256 of the canonical serialization
    /// `[0, pubkey, created_at, kind, tags, content]`.
    pub fn compute_id(&self) -> [u8; 32] {
        let canonical = serde_json::json!([
            0,
            self.pubkey,
            self.created_at,
            self.kind,
            self.tags,
            self.content
        ]);
        Sha256::digest(canonical.to_string().as_bytes()).into()
    }

    /// Whether the declared `id` equals [`Event::compute_id`].
    pub fn has_valid_id(&self) -> bool {
        hex::encode(self.compute_id()).eq_ignore_ascii_case(&self.id)
    }

    /// First 8 characters of the id, for log lines.
    pub fn short_id(&self) -> &str {
        short_hex(&self.id)
    }
}

pub(crate) fn short_hex(value: &str) -> &str {
    value.get(..8).unwrap_or(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Event {
        Event {
            id: String::new(),
            pubkey: "bb".repeat(32),
            kind: 1,
            created_at: 1000,
            tags: vec![Tag::new(["e", "aa11"]), Tag::new(["client"])],
            content: "hi".to_string(),
            sig: String::new(),
        }
    }

    #[test]
    fn tags_serialize_as_plain_arrays() {
        let ev = sample();
        let json = serde_json::to_value(&ev).unwrap();
        assert_eq!(json["tags"], serde_json::json!([["e", "aa11"], ["client"]]));
        let back: Event = serde_json::from_value(json).unwrap();
        assert_eq!(back, ev);
    }

    #[test]
    fn missing_field_is_rejected() {
        let raw = serde_json::json!({
            "id": "aa", "pubkey": "bb", "kind": 1, "created_at": 1,
            "tags": [], "content": "x"
        });
        assert!(serde_json::from_value::<Event>(raw).is_err());
    }

    #[test]
    fn tag_pairs_skip_valueless_tags() {
        let ev = sample();
        let pairs: Vec<_> = ev.tag_pairs().collect();
        assert_eq!(pairs, vec![("e", "aa11")]);
    }

    #[test]
    fn replaceable_kinds() {
        let mut ev = sample();
        assert!(!ev.is_replaceable());
        ev.kind = 0;
        assert!(ev.is_replaceable());
        ev.kind = 3;
        assert!(ev.is_replaceable());
    }

    #[test]
    fn computed_id_changes_with_content() {
        let mut ev = sample();
        let first = ev.compute_id();
        ev.content = "bye".to_string();
        assert_ne!(first, ev.compute_id());

        ev.id = hex::encode(ev.compute_id());
        assert!(ev.has_valid_id());
        ev.content = "tampered".to_string();
        assert!(!ev.has_valid_id());
    }

    #[test]
    fn short_id_handles_short_values() {
        let mut ev = sample();
        ev.id = "abc".to_string();
        assert_eq!(ev.short_id(), "abc");
        ev.id = "0123456789abcdef".to_string();
        assert_eq!(ev.short_id(), "01234567");
    }
}
