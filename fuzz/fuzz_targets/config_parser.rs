#![no_main]

use libfuzzer_sys::fuzz_target;
use straggler::config::{parse_call_sites, MonitorConfig};

fuzz_target!(|data: &[u8]| {
    if let Ok(input) = std::str::from_utf8(data) {
        // Neither parser may panic, whatever the input
        if let Ok(specs) = parse_call_sites(input) {
            for spec in specs {
                assert!(spec.threshold_nanos > 0);
                assert!(!spec.name.is_empty());
            }
        }
        let _ = MonitorConfig::from_toml_str(input);
    }
});
