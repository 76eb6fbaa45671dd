//! Verification and persistence of submitted events.

use tracing::{debug, info, warn};

use crate::error::StoreError;
use crate::event::Event;
use crate::message::RelayMessage;
use crate::store::{EventStore, Stored};
use crate::verify::SignatureVerifier;

/// Why a well-formed event was turned away.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    BadSignature,
    /// Declared id differs from the hash of the event body. Only checked
    /// when the pipeline was built with the id check enabled.
    IdMismatch,
    Duplicate,
}

impl Rejection {
    pub fn reason(&self) -> &'static str {
        match self {
            Rejection::BadSignature => "invalid: signature verification failed",
            Rejection::IdMismatch => "invalid: event id does not match content",
            Rejection::Duplicate => "duplicate: already have this event",
        }
    }
}

#[derive(Debug)]
pub enum IngestOutcome {
    Accepted(Stored),
    Rejected(Rejection),
    /// Storage failed; the event must not be considered stored.
    Failed(StoreError),
}

impl IngestOutcome {
    pub fn is_accepted(&self) -> bool {
        matches!(self, IngestOutcome::Accepted(_))
    }

    /// Reason string sent back to the client; empty on acceptance.
    pub fn reason(&self) -> &'static str {
        match self {
            IngestOutcome::Accepted(_) => "",
            IngestOutcome::Rejected(rejection) => rejection.reason(),
            IngestOutcome::Failed(_) => "error: failed to store event",
        }
    }

    /// The `OK` message acknowledging `event_id`.
    pub fn ack(&self, event_id: &str) -> RelayMessage {
        RelayMessage::Ok {
            event_id: event_id.to_string(),
            accepted: self.is_accepted(),
            message: self.reason().to_string(),
        }
    }
}

pub struct IngestionPipeline {
    verifier: SignatureVerifier,
    store: EventStore,
    verify_event_id: bool,
}

impl IngestionPipeline {
    pub fn new(store: EventStore) -> Self {
        Self {
            verifier: SignatureVerifier::new(),
            store,
            verify_event_id: false,
        }
    }

    /// Also require `id` to equal the hash of the event body.
    pub fn with_id_check(mut self, enabled: bool) -> Self {
        self.verify_event_id = enabled;
        self
    }

    pub fn store(&self) -> &EventStore {
        &self.store
    }

    /// Verify `event` and store it, replacing the author's previous event
    /// for replaceable kinds.
    pub async fn ingest(&self, event: Event) -> IngestOutcome {
        debug!(
            "Received event {} (kind {}) from {}",
            event.short_id(),
            event.kind,
            crate::event::short_hex(&event.pubkey)
        );

        if !self.verifier.verify(&event.id, &event.pubkey, &event.sig) {
            return IngestOutcome::Rejected(Rejection::BadSignature);
        }
        if self.verify_event_id && !event.has_valid_id() {
            warn!("Event {} id does not match its content", event.short_id());
            return IngestOutcome::Rejected(Rejection::IdMismatch);
        }

        let id = event.short_id().to_string();
        let kind = event.kind;
        match self.store.store(event).await {
            Ok(stored) => {
                info!("Accepted event {} (kind {}, seq {})", id, kind, stored.seq);
                IngestOutcome::Accepted(stored)
            }
            Err(StoreError::Duplicate) => {
                debug!("Event {} already stored", id);
                IngestOutcome::Rejected(Rejection::Duplicate)
            }
            Err(e) => {
                warn!("Event {} not stored: {}", id, e);
                IngestOutcome::Failed(e)
            }
        }
    }
}
