//! Fuzz target for the resolv.conf nameserver scanner.
//!
//! Run with: cargo +nightly fuzz run fuzz_resolv_conf

#![no_main]

use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Ok(s) = std::str::from_utf8(data) {
        let servers = netengine_core::resolver::parse_resolv_conf(s);
        assert!(servers.len() <= s.lines().count());
        assert!(servers.iter().all(|addr| addr.port() == 53));
    }
});
