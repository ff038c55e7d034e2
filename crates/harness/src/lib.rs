pub mod conflicts;
pub mod session;
pub mod system;

pub use conflicts::{CONTENT_TYPE_MISMATCH, ContentTypeMismatch};
pub use session::{TestSession, TestSessionGroup};
pub use system::{FakeSystem, FaultPoint};

/// Route engine logs to the test writer. `RUST_LOG` overrides the level.
pub fn init_test_logging() {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = fmt().with_env_filter(filter).with_test_writer().try_init();
}
