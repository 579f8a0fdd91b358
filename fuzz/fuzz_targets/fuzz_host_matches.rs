#![no_main]

use libfuzzer_sys::fuzz_target;
use mailwire::connection::host_matches;

fuzz_target!(|input: (&str, &str)| {
    let (host, pattern) = input;
    let matched = host_matches(host, pattern);

    if host.is_empty() || pattern.is_empty() {
        assert!(!matched);
    }
    if matched && !pattern.starts_with("*.") {
        assert!(host.eq_ignore_ascii_case(pattern));
    }
    // case never changes the outcome
    assert_eq!(
        matched,
        host_matches(&host.to_ascii_uppercase(), &pattern.to_ascii_lowercase())
    );
});
