//! Canonical event model and wire/storage codec (C1)
use crate::error::{Error, Result};
use bitcoin_hashes::{sha256, Hash};
use serde::{Deserialize, Serialize};

/// Tag names whose values are folded into the full-text index (§3).
pub const FTS_TAG_NAMES: &[&str] = &[
    "url",
    "title",
    "description",
    "name",
    "summary",
    "alt",
    "t",
    "os",
    "arch",
];

/// A signed, immutable Nostr event.
///
/// `decode(encode(e)) == e` for any event that round-trips through
/// [`Event::from_json`] and [`Event::to_json`]; field order in the struct
/// fixes the wire encoding so this holds without a canonicalization pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub id: String,
    pub pubkey: String,
    pub created_at: i64,
    pub kind: u16,
    #[serde(default)]
    pub tags: Vec<Vec<String>>,
    pub content: String,
    pub sig: String,
}

/// Replacement-rule bucket an event's `kind` falls into (§4.5).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplaceClass {
    Replaceable,
    ParamReplaceable,
    Ephemeral,
    Regular,
}

fn is_hex_of_len(s: &str, len: usize) -> bool {
    s.len() == len && s.chars().all(|c| c.is_ascii_hexdigit())
}

impl Event {
    /// Decode a wire-form JSON object into a validated `Event`.
    ///
    /// Fails with `MalformedEvent` when required fields are absent,
    /// mistyped, or outside their domain.
    pub fn from_json(raw: &str) -> Result<Event> {
        let event: Event =
            serde_json::from_str(raw).map_err(|e| Error::MalformedEvent(e.to_string()))?;
        event.validate_shape()?;
        Ok(event)
    }

    /// Encode this event back into its canonical wire-form JSON object.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Structural validation beyond what serde's typed deserialization
    /// already enforces (field presence/type, `kind` fitting in 16 bits).
    fn validate_shape(&self) -> Result<()> {
        if !is_hex_of_len(&self.id, 64) {
            return Err(Error::MalformedEvent(
                "id must be 64 lowercase hex characters".into(),
            ));
        }
        if !is_hex_of_len(&self.pubkey, 64) {
            return Err(Error::MalformedEvent(
                "pubkey must be 64 lowercase hex characters".into(),
            ));
        }
        if !is_hex_of_len(&self.sig, 128) {
            return Err(Error::MalformedEvent(
                "sig must be 128 lowercase hex characters".into(),
            ));
        }
        for tag in &self.tags {
            if tag.is_empty() {
                return Err(Error::MalformedEvent("tag must have at least one element".into()));
            }
        }
        Ok(())
    }

    /// The NIP-01 signing digest: sha256 over the canonical
    /// `[0, pubkey, created_at, kind, tags, content]` serialization.
    pub fn digest(&self) -> [u8; 32] {
        let arr = serde_json::json!([0, self.pubkey, self.created_at, self.kind, self.tags, self.content]);
        let ser = serde_json::to_string(&arr).expect("json array serializes");
        let hash = sha256::Hash::hash(ser.as_bytes());
        let mut out = [0u8; 32];
        out.copy_from_slice(hash.as_ref());
        out
    }

    /// Which replacement bucket this event's kind belongs to (§4.5).
    pub fn replace_class(&self) -> ReplaceClass {
        classify_kind(self.kind)
    }

    /// The value of the first `d` tag, or empty string if absent (used as
    /// the third component of the parameterizable-replaceable key).
    pub fn d_tag(&self) -> String {
        self.tags
            .iter()
            .find(|t| t.first().map(String::as_str) == Some("d"))
            .and_then(|t| t.get(1))
            .cloned()
            .unwrap_or_default()
    }

    /// All values of tags named `name` (element 1 of each matching tag).
    pub fn tag_values_by_name(&self, name: &str) -> Vec<&str> {
        self.tags
            .iter()
            .filter(|t| t.first().map(String::as_str) == Some(name))
            .filter_map(|t| t.get(1).map(String::as_str))
            .collect()
    }

    /// Text folded into the full-text index: the concatenated values of
    /// tags whose name is in [`FTS_TAG_NAMES`].
    pub fn fts_text(&self) -> String {
        fts_text_from_tags(&self.tags)
    }

    /// A short prefix of the event id, for log lines.
    pub fn id_prefix(&self) -> String {
        self.id.chars().take(8).collect()
    }
}

/// The same computation as [`Event::fts_text`], usable from contexts that
/// only have the parsed tag array (notably the `relay_fts_text` SQL
/// function the storage adapter registers for its insert trigger).
pub fn fts_text_from_tags(tags: &[Vec<String>]) -> String {
    let mut parts = Vec::new();
    for tag in tags {
        if let (Some(name), Some(value)) = (tag.first(), tag.get(1)) {
            if FTS_TAG_NAMES.contains(&name.as_str()) {
                parts.push(value.as_str());
            }
        }
    }
    parts.join(" ")
}

/// As [`fts_text_from_tags`], but parsing the tags column's JSON text
/// representation directly; malformed JSON folds to an empty string rather
/// than failing, since this runs inside a SQLite trigger with no caller to
/// propagate an error to.
pub fn fts_text_from_tags_json(tags_json: &str) -> String {
    serde_json::from_str::<Vec<Vec<String>>>(tags_json)
        .map(|tags| fts_text_from_tags(&tags))
        .unwrap_or_default()
}

/// Classify a `kind` into its replacement bucket (§4.5).
pub fn classify_kind(kind: u16) -> ReplaceClass {
    match kind {
        0 | 3 => ReplaceClass::Replaceable,
        10_000..=19_999 => ReplaceClass::Replaceable,
        20_000..=29_999 => ReplaceClass::Ephemeral,
        30_000..=39_999 => ReplaceClass::ParamReplaceable,
        _ => ReplaceClass::Regular,
    }
}

/// True if `name` is a single character, the shape the tag index stores
/// entries for (§3).
pub fn is_indexed_tag_name(name: &str) -> bool {
    name.chars().count() == 1
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_json() -> String {
        r#"{"id":"aa11111111111111111111111111111111111111111111111111111111111111","pubkey":"bb22222222222222222222222222222222222222222222222222222222222222","created_at":1000,"kind":1,"tags":[["d","app.one"],["e","cc333333333333333333333333333333333333333333333333333333333333"]],"content":"hello","sig":"dd4444444444444444444444444444444444444444444444444444444444444444444444444444444444444444444444444444444444444444444444444444"}"#.to_owned()
    }

    #[test]
    fn round_trip() {
        let raw = sample_json();
        let e = Event::from_json(&raw).unwrap();
        let back = Event::from_json(&e.to_json().unwrap()).unwrap();
        assert_eq!(e, back);
    }

    #[test]
    fn rejects_short_id() {
        let raw = sample_json().replacen(
            "aa11111111111111111111111111111111111111111111111111111111111111",
            "aa11",
            1,
        );
        assert!(matches!(Event::from_json(&raw), Err(Error::MalformedEvent(_))));
    }

    #[test]
    fn rejects_kind_out_of_range() {
        let raw = sample_json().replacen("\"kind\":1", "\"kind\":99999999", 1);
        assert!(matches!(Event::from_json(&raw), Err(Error::MalformedEvent(_))));
    }

    #[test]
    fn rejects_empty_tag() {
        let raw = sample_json().replacen(r#"["d","app.one"]"#, "[]", 1);
        assert!(matches!(Event::from_json(&raw), Err(Error::MalformedEvent(_))));
    }

    #[test]
    fn classify_kinds() {
        assert_eq!(classify_kind(0), ReplaceClass::Replaceable);
        assert_eq!(classify_kind(3), ReplaceClass::Replaceable);
        assert_eq!(classify_kind(1), ReplaceClass::Regular);
        assert_eq!(classify_kind(10_001), ReplaceClass::Replaceable);
        assert_eq!(classify_kind(20_001), ReplaceClass::Ephemeral);
        assert_eq!(classify_kind(30_063), ReplaceClass::ParamReplaceable);
        assert_eq!(classify_kind(40_000), ReplaceClass::Regular);
    }

    #[test]
    fn d_tag_defaults_empty() {
        let e = Event::from_json(&sample_json()).unwrap();
        assert_eq!(e.d_tag(), "app.one");
    }

    #[test]
    fn fts_text_only_includes_known_names() {
        let e = Event::from_json(&sample_json()).unwrap();
        // "d" and "e" are not in FTS_TAG_NAMES
        assert_eq!(e.fts_text(), "");
    }

    #[test]
    fn fts_text_from_tags_json_matches_struct_method() {
        let e = Event::from_json(&sample_json()).unwrap();
        let tags_json = serde_json::to_string(&e.tags).unwrap();
        assert_eq!(fts_text_from_tags_json(&tags_json), e.fts_text());
        assert_eq!(fts_text_from_tags_json("not json"), "");
    }
}
