#![allow(dead_code)]
//! Shared integration test utilities.

use std::sync::Once;

use proptest::prelude::ProptestConfig;
use proptest::test_runner::RngSeed;

static INIT_LOGGING: Once = Once::new();

/// Default seed for property tests when no seed is given.
pub const DEFAULT_PROPTEST_SEED: u64 = 0x5EED5EED;

const PROPTEST_SEED_ENV: &str = "SOCKUDO_WIRE_PROPTEST_SEED";

/// Initialize test logging (once per process).
pub fn init_test_logging() {
    init_test_logging_with_level(tracing::Level::TRACE);
}

/// Initialize test logging with a custom level.
pub fn init_test_logging_with_level(level: tracing::Level) {
    INIT_LOGGING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_max_level(level)
            .with_test_writer()
            .with_target(true)
            .with_ansi(false)
            .try_init();
    });
}

/// Proptest config with a fixed seed unless `PROPTEST_RNG_SEED` or
/// `SOCKUDO_WIRE_PROPTEST_SEED` says otherwise.
pub fn test_proptest_config(cases: u32) -> ProptestConfig {
    let mut config = ProptestConfig::with_cases(cases);
    if matches!(config.rng_seed, RngSeed::Random) {
        let seed = std::env::var(PROPTEST_SEED_ENV)
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(DEFAULT_PROPTEST_SEED);
        config.rng_seed = RngSeed::Fixed(seed);
    }
    config
}
