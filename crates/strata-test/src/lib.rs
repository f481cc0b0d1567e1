//! Helpers for testing the strata crates.
//!
//! When writing tests, keep the following points in mind:
//!
//!  - In every test that logs, call [`setup`]. This will set up the logger so that all console
//!    output is captured by the test runner.
//!
//!  - When using [`tempdir`], make sure that the handle to the temp directory is held for the
//!    entire lifetime of the test. A file table recreates its directory lazily, so dropping the
//!    handle too early silently leaks the directory. To avoid this, assign it to a variable in the
//!    test function (e.g. `let _table_dir = strata_test::tempdir()`).

use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt::fmt;

pub use tempfile::TempDir;

/// Setup the test environment.
///
///  - Initializes logs: The logger only captures logs from the strata crates and mutes all
///    other logs.
pub fn setup() {
    fmt()
        .with_env_filter(EnvFilter::new("strata_cache=trace,strata_stress=trace"))
        .with_target(false)
        .pretty()
        .with_test_writer()
        .try_init()
        .ok();
}

/// Creates a temporary directory.
///
/// The directory is deleted when the [`TempDir`] instance is dropped, unless
/// [`keep`](TempDir::keep) is called. Use it as a guard to automatically clean up after tests.
pub fn tempdir() -> TempDir {
    TempDir::new().unwrap()
}
