use std::fmt::Display;

/// Reports a GPU test that cannot run on this machine. Setting
/// `SWEEP_REQUIRE_GPU` turns the skip into a failure, for runners that are
/// known to have an adapter.
pub fn skip(reason: impl Display) {
    if std::env::var_os("SWEEP_REQUIRE_GPU").is_some() {
        panic!("GPU required but unavailable: {}", reason);
    }
    log::warn!("skipping: {}", reason);
    eprintln!("SKIPPED (no usable GPU): {}", reason);
}
