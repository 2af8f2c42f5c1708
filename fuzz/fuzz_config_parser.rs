//! Fuzz target for the engine configuration parser.
//!
//! Run with: cargo +nightly fuzz run fuzz_config_parser
//!
//! Feeds arbitrary input to `EngineConfig::parse()`, which covers TOML
//! decoding, nameserver address parsing and validation.

#![no_main]

use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Ok(s) = std::str::from_utf8(data) {
        if let Ok(config) = netengine_config::EngineConfig::parse(s) {
            // A config that validated must yield addresses for every nameserver.
            let addrs = config
                .dns
                .socket_addrs()
                .expect("validated config has parsable nameservers");
            assert_eq!(addrs.len(), config.dns.nameservers.len());
        }
    }
});
