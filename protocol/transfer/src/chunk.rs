//! Download chunk-size policy by client network class.

use crate::message::NetType;

/// Chunk size for broadband clients.
pub const BROADBAND_CHUNK: i64 = 512 * 1024;

/// Chunk size for cellular clients.
pub const CELLULAR_CHUNK: i64 = 64 * 1024;

/// Chunk size for one download response, clamped to the bytes remaining.
pub fn chunk_size(net_type: NetType, remaining: i64) -> i64 {
    let preferred = match net_type {
        NetType::Broadband => BROADBAND_CHUNK,
        NetType::Cellular => CELLULAR_CHUNK,
    };
    preferred.min(remaining)
}
