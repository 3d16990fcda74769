//! Subscription filters: the client-facing half of the filter compiler (C3)
use crate::error::{Error, Result};
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};

/// A single filter: a conjunction of zero or more constraints (§4.3).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Filter {
    pub ids: Option<HashSet<String>>,
    pub authors: Option<HashSet<String>>,
    pub kinds: Option<HashSet<u16>>,
    /// `#X` axes, keyed by the single ASCII letter `X`.
    pub tags: BTreeMap<char, HashSet<String>>,
    pub since: Option<i64>,
    pub until: Option<i64>,
    pub search: Option<String>,
    pub limit: Option<u32>,
}

/// A filter set: a disjunction of one or more [`Filter`]s (§4.3).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FilterSet(pub Vec<Filter>);

fn string_set(v: &Value, field: &str) -> Result<HashSet<String>> {
    let arr = v
        .as_array()
        .ok_or_else(|| Error::BadInput(format!("{field} must be an array")))?;
    let mut out = HashSet::with_capacity(arr.len());
    for item in arr {
        let s = item
            .as_str()
            .ok_or_else(|| Error::BadInput(format!("{field} elements must be strings")))?;
        out.insert(s.to_owned());
    }
    Ok(out)
}

fn kind_set(v: &Value) -> Result<HashSet<u16>> {
    let arr = v
        .as_array()
        .ok_or_else(|| Error::BadInput("kinds must be an array".into()))?;
    let mut out = HashSet::with_capacity(arr.len());
    for item in arr {
        let n = item
            .as_u64()
            .ok_or_else(|| Error::BadInput("kinds elements must be non-negative integers".into()))?;
        let kind: u16 = n
            .try_into()
            .map_err(|_| Error::BadInput("kind out of range".into()))?;
        out.insert(kind);
    }
    Ok(out)
}

/// `#X` where `X` is exactly one ASCII letter.
fn single_letter_tag_key(key: &str) -> Option<char> {
    let mut chars = key.chars();
    if chars.next()? != '#' {
        return None;
    }
    let letter = chars.next()?;
    if chars.next().is_some() || !letter.is_ascii_alphabetic() {
        return None;
    }
    Some(letter)
}

impl Filter {
    /// Parse a single filter object. Unrecognized top-level keys fail with
    /// `BadInput` (§4.3 rule 6).
    pub fn from_value(v: &Value) -> Result<Filter> {
        let obj = v
            .as_object()
            .ok_or_else(|| Error::BadInput("filter must be a JSON object".into()))?;
        let mut f = Filter::default();
        for (key, val) in obj {
            match key.as_str() {
                "ids" => f.ids = Some(string_set(val, "ids")?),
                "authors" => f.authors = Some(string_set(val, "authors")?),
                "kinds" => f.kinds = Some(kind_set(val)?),
                "since" => {
                    f.since = Some(
                        val.as_i64()
                            .ok_or_else(|| Error::BadInput("since must be an integer".into()))?,
                    )
                }
                "until" => {
                    f.until = Some(
                        val.as_i64()
                            .ok_or_else(|| Error::BadInput("until must be an integer".into()))?,
                    )
                }
                "search" => {
                    f.search = Some(
                        val.as_str()
                            .ok_or_else(|| Error::BadInput("search must be a string".into()))?
                            .to_owned(),
                    )
                }
                "limit" => {
                    let n = val
                        .as_u64()
                        .ok_or_else(|| Error::BadInput("limit must be a positive integer".into()))?;
                    if n == 0 {
                        return Err(Error::BadInput("limit must be positive".into()));
                    }
                    f.limit = Some(n.min(u32::MAX as u64) as u32);
                }
                other => {
                    if let Some(letter) = single_letter_tag_key(other) {
                        f.tags.insert(letter, string_set(val, other)?);
                    } else {
                        return Err(Error::BadInput(format!("unrecognized filter key: {other}")));
                    }
                }
            }
        }
        Ok(f)
    }

    /// Whether this filter satisfies the admission gate: it must constrain
    /// `kinds` to intersect the statically configured allow-list (§4.3 rule 5).
    pub fn is_admitted(&self, allowed_kinds: &HashSet<u16>) -> bool {
        match &self.kinds {
            Some(kinds) => kinds.iter().any(|k| allowed_kinds.contains(k)),
            None => false,
        }
    }

    /// A copy of this filter with `ids` replaced by `{id}`, used by fan-out
    /// to ask "does this one event match this filter" (§4.7).
    fn constrained_to_id(&self, id: &str) -> Filter {
        let mut out = self.clone();
        let mut only = HashSet::with_capacity(1);
        only.insert(id.to_owned());
        out.ids = Some(only);
        out
    }
}

impl FilterSet {
    /// Parse a sequence of filter JSON values (the tail of a `REQ` frame).
    pub fn from_values(values: &[Value]) -> Result<FilterSet> {
        if values.is_empty() {
            return Err(Error::BadInput("a REQ needs at least one filter".into()));
        }
        let filters = values.iter().map(Filter::from_value).collect::<Result<Vec<_>>>()?;
        Ok(FilterSet(filters))
    }

    /// Whether every filter in the set passes the admission gate.
    pub fn is_admitted(&self, allowed_kinds: &HashSet<u16>) -> bool {
        self.0.iter().all(|f| f.is_admitted(allowed_kinds))
    }

    /// The constrained filter set fan-out compiles against a single
    /// candidate event (§4.7).
    pub fn constrained_to_id(&self, id: &str) -> FilterSet {
        FilterSet(self.0.iter().map(|f| f.constrained_to_id(id)).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_recognized_keys() {
        let v = json!({"kinds":[1,2],"authors":["ab"],"since":100,"until":200,"limit":5,"#d":["x"],"search":"hi"});
        let f = Filter::from_value(&v).unwrap();
        assert_eq!(f.kinds.unwrap(), HashSet::from([1, 2]));
        assert_eq!(f.authors.unwrap(), HashSet::from(["ab".to_owned()]));
        assert_eq!(f.since, Some(100));
        assert_eq!(f.until, Some(200));
        assert_eq!(f.limit, Some(5));
        assert_eq!(f.tags.get(&'d').unwrap(), &HashSet::from(["x".to_owned()]));
        assert_eq!(f.search.as_deref(), Some("hi"));
    }

    #[test]
    fn rejects_unknown_key() {
        let v = json!({"bogus": 1});
        assert!(matches!(Filter::from_value(&v), Err(Error::BadInput(_))));
    }

    #[test]
    fn rejects_multi_letter_tag_key() {
        let v = json!({"#de": ["x"]});
        assert!(matches!(Filter::from_value(&v), Err(Error::BadInput(_))));
    }

    #[test]
    fn admission_requires_kind_intersection() {
        let allowed: HashSet<u16> = HashSet::from([30063]);
        let f = Filter::from_value(&json!({"kinds": [30063]})).unwrap();
        assert!(f.is_admitted(&allowed));
        let f2 = Filter::from_value(&json!({"kinds": [1]})).unwrap();
        assert!(!f2.is_admitted(&allowed));
        let f3 = Filter::from_value(&json!({})).unwrap();
        assert!(!f3.is_admitted(&allowed));
    }

    #[test]
    fn constrained_to_id_keeps_other_fields() {
        let f = Filter::from_value(&json!({"kinds": [1], "authors": ["ab"]})).unwrap();
        let set = FilterSet(vec![f]);
        let constrained = set.constrained_to_id("deadbeef");
        let cf = &constrained.0[0];
        assert_eq!(cf.ids.as_ref().unwrap(), &HashSet::from(["deadbeef".to_owned()]));
        assert_eq!(cf.kinds.as_ref().unwrap(), &HashSet::from([1]));
        assert_eq!(cf.authors.as_ref().unwrap(), &HashSet::from(["ab".to_owned()]));
    }
}
