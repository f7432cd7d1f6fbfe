//! Fuzz target: parsing slot keys returned by a KV prefix listing.
//!
//! Whatever index a key parses to must survive a round trip through its
//! canonical key.

#![no_main]

use ember_core::slot::{parse_slot_key, slot_key};
use libfuzzer_sys::fuzz_target;

const NODE_ID: &str = "node-0000beef";

fuzz_target!(|data: &[u8]| {
    let Ok(key) = std::str::from_utf8(data) else {
        return;
    };
    if let Some(index) = parse_slot_key(NODE_ID, key) {
        // `u16::from_str` accepts a leading `+` and zero padding.
        let canonical = slot_key(NODE_ID, index);
        assert_eq!(parse_slot_key(NODE_ID, &canonical), Some(index));
    }
});
