//! Subscriber installation runs in its own test binary: it sets the process
//! global default.

use beamline_core::config::LogFormat;
use beamline_core::logging::{self, LoggingConfig};
use tracing::Level;

#[test]
fn init_is_idempotent() {
    let config = LoggingConfig::new(Level::WARN).with_format(LogFormat::Compact);
    assert!(logging::init(config.clone()).is_ok());
    assert!(logging::init(config).is_ok());
}
