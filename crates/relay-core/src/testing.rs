//! Deterministic signing fixtures, shared by unit tests, the integration
//! tests and downstream crates through the `test-util` feature.

use secp256k1::{Keypair, Message, Secp256k1};

use crate::event::{Event, Tag};

/// A keypair derived from a repeated secret byte.
pub struct Author {
    keypair: Keypair,
    pub pubkey: String,
}

impl Author {
    /// `seed` must be non-zero.
    pub fn new(seed: u8) -> Self {
        let secp = Secp256k1::new();
        let keypair = Keypair::from_seckey_slice(&secp, &[seed; 32]).unwrap();
        let pubkey = hex::encode(keypair.x_only_public_key().0.serialize());
        Self { keypair, pubkey }
    }

    pub fn event(&self, kind: u32, created_at: i64, content: &str) -> Event {
        self.event_with_tags(kind, created_at, content, vec![])
    }

    /// Event with a correct id and signature.
    pub fn event_with_tags(&self, kind: u32, created_at: i64, content: &str, tags: Vec<Tag>) -> Event {
        let mut event = Event {
            id: String::new(),
            pubkey: self.pubkey.clone(),
            kind,
            created_at,
            tags,
            content: content.to_string(),
            sig: String::new(),
        };
        event.id = hex::encode(event.compute_id());
        event.sig = self.sign(&event.id);
        event
    }

    /// Schnorr signature over the raw bytes of a hex id.
    pub fn sign(&self, id: &str) -> String {
        let secp = Secp256k1::new();
        let msg = Message::from_digest_slice(&hex::decode(id).unwrap()).unwrap();
        secp.sign_schnorr_no_aux_rand(&msg, &self.keypair).to_string()
    }
}

/// Shorthand for `Author::new(seed).event_with_tags(..)`.
pub fn signed_event(seed: u8, kind: u32, created_at: i64, content: &str, tags: Vec<Tag>) -> Event {
    Author::new(seed).event_with_tags(kind, created_at, content, tags)
}
