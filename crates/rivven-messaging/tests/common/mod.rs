//! Shared helpers for integration tests

#![allow(dead_code)]

use rivven_messaging::Message;

/// Initialize tracing for tests (safe to call from every test)
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("rivven_messaging=debug")),
        )
        .with_test_writer()
        .try_init();
}

/// A fetched message as the broker client would return it
pub fn fetched(topic: &str, offset: u64) -> Message {
    Message::with_key(topic, format!("key-{}", offset), format!("value-{}", offset))
        .partition(0)
        .offset(offset)
}
