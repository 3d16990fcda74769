//! Signature verification oracle (C4, signature half): checks that an
//! event's `sig` is a valid BIP-340 schnorr signature over its NIP-01
//! digest, under its own `pubkey`.
use crate::error::{Error, Result};
use crate::event::Event;
use secp256k1::{schnorr, Secp256k1, XOnlyPublicKey};

lazy_static::lazy_static! {
    static ref SECP: Secp256k1<secp256k1::VerifyOnly> = Secp256k1::verification_only();
}

/// Verify `event.sig` against `event.digest()` under `event.pubkey`, and
/// that the claimed `id` actually is `event.digest()` - otherwise `id` is
/// just an attacker-chosen label, not a content hash, and §3's id-based
/// dedup/uniqueness invariants don't hold.
///
/// The wire shape of `pubkey`/`sig` was already checked by
/// [`Event::from_json`] (64/128 hex chars), so any failure here - bad
/// curve point, bad signature encoding, or a genuine mismatch - is
/// reported uniformly as `SignatureInvalid`.
pub fn verify(event: &Event) -> Result<()> {
    let digest = event.digest();
    if event.id != hex::encode(digest) {
        return Err(Error::MalformedEvent(
            "id does not match the sha256 digest of the event".into(),
        ));
    }
    let pubkey_bytes = hex::decode(&event.pubkey).map_err(|_| Error::SignatureInvalid)?;
    let pubkey = XOnlyPublicKey::from_slice(&pubkey_bytes).map_err(|_| Error::SignatureInvalid)?;
    let sig_bytes = hex::decode(&event.sig).map_err(|_| Error::SignatureInvalid)?;
    let sig = schnorr::Signature::from_slice(&sig_bytes).map_err(|_| Error::SignatureInvalid)?;
    let msg = secp256k1::Message::from_slice(&digest).map_err(|_| Error::SignatureInvalid)?;
    SECP.verify_schnorr(&sig, &msg, &pubkey).map_err(|_| Error::SignatureInvalid)
}
