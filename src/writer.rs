//! Write path (C5): the storage-facing half of submitting an event.
//! Validation (signature, allow-list, §4.4) happens before this module is
//! ever called; acking the publisher and fanning the event out to
//! subscribers happens after, in the connection layer (§4.5 steps 5-6),
//! once [`write`] reports success.
use crate::db::{self, Storage};
use crate::error::Result;
use crate::event::{Event, ReplaceClass};
use std::thread::sleep;
use std::time::Duration;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Stored,
    Duplicate,
}

/// The id of the event this one's replacement class says it should
/// supersede, if any (§4.5 step 2-3).
fn predecessor(storage: &Storage, event: &Event) -> Result<Option<String>> {
    match event.replace_class() {
        ReplaceClass::Replaceable => storage.current_replaceable_holder(&event.pubkey, event.kind),
        ReplaceClass::ParamReplaceable => {
            storage.current_param_replaceable_holder(&event.pubkey, event.kind, &event.d_tag())
        }
        ReplaceClass::Ephemeral | ReplaceClass::Regular => Ok(None),
    }
}

fn write_once(storage: &Storage, event: &Event) -> Result<WriteOutcome> {
    if storage.exists(&event.id)? {
        return Ok(WriteOutcome::Duplicate);
    }
    let predecessor = predecessor(storage, event)?;
    storage.write_transaction(|tx| {
        db::insert_event(tx, event)?;
        if let Some(prev_id) = &predecessor {
            // An event can unconditionally replace its own predecessor
            // regardless of relative created_at (§4.5 note); the only
            // check here is that it is not replacing itself.
            if prev_id != &event.id {
                db::delete_event(tx, prev_id)?;
            }
        }
        Ok(())
    })?;
    Ok(WriteOutcome::Stored)
}

/// Commit `event` to storage, retrying up to `retry_attempts` times on a
/// retryable storage error (§4.5 step 6, §7).
pub fn write(storage: &Storage, event: &Event, retry_attempts: u32) -> Result<WriteOutcome> {
    let mut attempt = 0;
    loop {
        match write_once(storage, event) {
            Ok(outcome) => return Ok(outcome),
            Err(e) if e.is_retryable() && attempt < retry_attempts => {
                attempt += 1;
                warn!(id = %event.id_prefix(), attempt, "retrying write after {e}");
                sleep(Duration::from_millis(5 * u64::from(attempt)));
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(id: &str, pubkey: &str, kind: u16, created_at: i64, d_tag: Option<&str>) -> Event {
        let tags = d_tag
            .map(|d| vec![vec!["d".to_owned(), d.to_owned()]])
            .unwrap_or_default();
        Event {
            id: id.to_owned(),
            pubkey: pubkey.to_owned(),
            created_at,
            kind,
            tags,
            content: String::new(),
            sig: "b".repeat(128),
        }
    }

    #[test]
    fn first_write_of_a_regular_event_is_stored() {
        let storage = Storage::open_in_memory().unwrap();
        let e = event(&"a".repeat(64), &"p".repeat(64), 1, 1000, None);
        assert_eq!(write(&storage, &e, 3).unwrap(), WriteOutcome::Stored);
        assert!(storage.exists(&e.id).unwrap());
    }

    #[test]
    fn rewriting_the_same_id_is_a_duplicate() {
        let storage = Storage::open_in_memory().unwrap();
        let e = event(&"a".repeat(64), &"p".repeat(64), 1, 1000, None);
        write(&storage, &e, 3).unwrap();
        assert_eq!(write(&storage, &e, 3).unwrap(), WriteOutcome::Duplicate);
    }

    #[test]
    fn replaceable_kind_evicts_its_predecessor() {
        let storage = Storage::open_in_memory().unwrap();
        let pubkey = "p".repeat(64);
        let first = event(&"a".repeat(64), &pubkey, 0, 1000, None);
        write(&storage, &first, 3).unwrap();
        let second = event(&"b".repeat(64), &pubkey, 0, 2000, None);
        write(&storage, &second, 3).unwrap();
        assert!(!storage.exists(&first.id).unwrap());
        assert!(storage.exists(&second.id).unwrap());
    }

    #[test]
    fn an_older_submission_still_replaces_a_newer_predecessor() {
        let storage = Storage::open_in_memory().unwrap();
        let pubkey = "p".repeat(64);
        let newer = event(&"a".repeat(64), &pubkey, 0, 5000, None);
        write(&storage, &newer, 3).unwrap();
        let older = event(&"b".repeat(64), &pubkey, 0, 1000, None);
        write(&storage, &older, 3).unwrap();
        assert!(!storage.exists(&newer.id).unwrap());
        assert!(storage.exists(&older.id).unwrap());
    }

    #[test]
    fn param_replaceable_only_evicts_the_matching_d_tag() {
        let storage = Storage::open_in_memory().unwrap();
        let pubkey = "p".repeat(64);
        let first = event(&"a".repeat(64), &pubkey, 30063, 1000, Some("app.one"));
        write(&storage, &first, 3).unwrap();
        let other_d = event(&"c".repeat(64), &pubkey, 30063, 1500, Some("app.two"));
        write(&storage, &other_d, 3).unwrap();
        let second = event(&"b".repeat(64), &pubkey, 30063, 2000, Some("app.one"));
        write(&storage, &second, 3).unwrap();
        assert!(!storage.exists(&first.id).unwrap());
        assert!(storage.exists(&other_d.id).unwrap());
        assert!(storage.exists(&second.id).unwrap());
    }

    #[test]
    fn ephemeral_events_do_not_replace_anything() {
        let storage = Storage::open_in_memory().unwrap();
        let pubkey = "p".repeat(64);
        let first = event(&"a".repeat(64), &pubkey, 20001, 1000, None);
        write(&storage, &first, 3).unwrap();
        let second = event(&"b".repeat(64), &pubkey, 20001, 2000, None);
        write(&storage, &second, 3).unwrap();
        assert!(storage.exists(&first.id).unwrap());
        assert!(storage.exists(&second.id).unwrap());
    }
}
