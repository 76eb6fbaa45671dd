#![no_main]

use libfuzzer_sys::fuzz_target;
use relay_core::filter;

fuzz_target!(|data: &[u8]| {
    let Ok(value) = serde_json::from_slice::<serde_json::Value>(data) else {
        return;
    };
    let compiled = filter::compile(&value);
    assert!(compiled.limit <= filter::MAX_LIMIT);
    // A key exists exactly when the filter can match something.
    assert_eq!(compiled.cache_key().is_none(), compiled.predicate.is_nothing());
});
