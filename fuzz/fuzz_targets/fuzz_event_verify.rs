#![no_main]

use libfuzzer_sys::fuzz_target;
use relay_core::{Event, SignatureVerifier};

fuzz_target!(|data: &[u8]| {
    let Ok(event) = serde_json::from_slice::<Event>(data) else {
        return;
    };
    let verifier = SignatureVerifier::new();
    // Arbitrary input must be rejected cleanly, never panic.
    let _ = verifier.verify(&event.id, &event.pubkey, &event.sig);
    let _ = event.has_valid_id();
});
