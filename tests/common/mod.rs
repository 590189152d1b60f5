//! Shared helpers for the integration tests.

#![allow(dead_code)]

use std::sync::Once;

use acid_lab::{Lab, LabConfig, MemoryBackend};
use tracing_subscriber::EnvFilter;

static TRACING: Once = Once::new();

/// Route `tracing` output through the test harness. Set `RUST_LOG` to see it.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
            .with_test_writer()
            .try_init();
    });
}

/// Memory lab with the default one-second tick. Use with a paused clock.
pub async fn memory_lab() -> Lab<MemoryBackend> {
    init_tracing();
    Lab::open_memory(LabConfig::default()).await.unwrap()
}
