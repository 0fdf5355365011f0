//! Shared harness for pacerpc integration tests.

#![allow(dead_code)]

use std::sync::Once;
use std::time::{Duration, Instant};

/// Install a tracing subscriber once per test binary.
pub fn init_tracing() {
    static ONCE: Once = Once::new();
    ONCE.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::INFO)
            .with_test_writer()
            .try_init();
    });
}

/// Spin `tick` until it returns true or `timeout` elapses.
pub fn poll_until<F: FnMut() -> bool>(mut tick: F, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if tick() {
            return true;
        }
    }
    false
}

/// Pack per-request bookkeeping into the opaque tag word:
/// request index, buffer index, and request size.
pub fn pack_tag(req_i: u16, msgbuf_i: u16, req_size: u32) -> u64 {
    ((req_i as u64) << 48) | ((msgbuf_i as u64) << 32) | req_size as u64
}

/// Inverse of [`pack_tag`].
pub fn unpack_tag(tag: u64) -> (u16, u16, u32) {
    ((tag >> 48) as u16, (tag >> 32) as u16, tag as u32)
}
