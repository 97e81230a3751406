pub mod fixtures;
pub mod harness;

pub use fixtures::TestFixtures;
pub use harness::{drain_until_exit, read_until, shell, wait_timeout};

use std::sync::Once;
use tracing_subscriber::EnvFilter;

static INIT: Once = Once::new();

pub fn init_test_logging() {
    INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter(
                EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| EnvFilter::new("subterm_pty=debug")),
            )
            .with_test_writer()
            .init();
    });
}

/// Search path handed to children, since sessions inherit no environment.
pub const TEST_PATH: &str = "PATH=/usr/local/bin:/usr/bin:/bin";
