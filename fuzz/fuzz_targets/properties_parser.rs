#![no_main]

use cpu_time_exporter::config::AgentProperties;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Ok(input) = std::str::from_utf8(data) {
        // Parsing and validation must never panic
        if let Ok(properties) = AgentProperties::from_toml_str(input) {
            let _ = properties.validate();
            let _ = properties.logger_level();
            let rules = properties.rules();
            let _ = rules.is_monitored(input);
            let _ = properties.sampler_settings().probes_per_window();
        }
    }
});
