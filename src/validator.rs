//! Event validator (C4): signature check, publisher allow-list
//! membership, and the per-kind `d`-tag restrictions a restricted
//! allow-list entry carries.
use crate::authentication;
use crate::config::{AllowListEntry, Authorization};
use crate::error::{Error, Result};
use crate::event::Event;

/// Run every admission check the write path requires before an event may
/// reach storage (§4.4): a valid signature, then publisher allow-list
/// membership, then (for the two kinds that carry one) the `d`-tag
/// restriction an allow-list entry may scope a publisher to.
pub fn validate(event: &Event, authorization: &Authorization) -> Result<()> {
    authentication::verify(event)?;
    let entry = authorization
        .pubkey_allowlist
        .get(&event.pubkey)
        .ok_or_else(|| Error::NotAuthorized(format!("{} is not an allowed publisher", event.pubkey)))?;
    if entry.is_unrestricted() {
        return Ok(());
    }
    check_d_tag(event, entry)
}

/// Kind 30063 restricts by `d`-tag *prefix*; kind 32267 restricts by
/// *exact* `d`-tag match. Every other kind a restricted entry may publish
/// is unaffected by its `d_tags` list.
fn check_d_tag(event: &Event, entry: &AllowListEntry) -> Result<()> {
    let allowed = match event.kind {
        30063 => {
            let d = event.d_tag();
            entry.d_tags.iter().any(|prefix| d.starts_with(prefix.as_str()))
        }
        32267 => {
            let d = event.d_tag();
            entry.d_tags.iter().any(|exact| d == exact.as_str())
        }
        _ => true,
    };
    if allowed {
        Ok(())
    } else {
        Err(Error::NotAuthorized(format!(
            "d tag {:?} not permitted for this publisher",
            event.d_tag()
        )))
    }
}
