//! Fuzz target: decoding and validating a create request body.
//!
//! Any config that passes validation must yield ids that stay inside their
//! root directory and fit on one hosts-file line.

#![no_main]

use ember_core::SandboxConfig;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Ok(config) = serde_json::from_slice::<SandboxConfig>(data) else {
        return;
    };
    if config.validate().is_err() {
        return;
    }
    for id in [
        &config.sandbox_id,
        &config.template_id,
        &config.build_id,
        &config.kernel_version,
        &config.firecracker_version,
    ] {
        assert!(!id.is_empty());
        assert!(id != "." && id != "..");
        assert!(!id.contains('/'));
        assert!(!id.chars().any(char::is_whitespace));
    }
});
