//! Utility functions for minimeta

use rand::Rng;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Get current Unix timestamp (milliseconds)
pub fn timestamp_now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Election timeout drawn uniformly from `[base, 2 * base)`
pub fn randomized_timeout(base: Duration) -> Duration {
    let base_ms = base.as_millis().max(1) as u64;
    Duration::from_millis(base_ms + rand::thread_rng().gen_range(0..base_ms))
}

/// Exponential backoff delay for `attempt` (0-based), capped at `max`
pub fn backoff_delay(initial: Duration, attempt: usize, max: Duration) -> Duration {
    let factor = 1u32.checked_shl(attempt.min(16) as u32).unwrap_or(u32::MAX);
    initial.saturating_mul(factor).min(max)
}

/// Calculate CRC32 checksum
pub fn crc32(data: &[u8]) -> u32 {
    crc32fast::hash(data)
}

/// Ask the OS for a currently free TCP port on loopback
pub fn find_available_port() -> std::io::Result<u16> {
    let listener = std::net::TcpListener::bind("127.0.0.1:0")?;
    Ok(listener.local_addr()?.port())
}
