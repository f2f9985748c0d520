//! Shared protocol constants for the tarlift object daemon

// Protocol header constants
pub const MAGIC: &[u8; 4] = b"TLFT";
pub const VERSION: u16 = 1;

/// Header length: MAGIC (4) | VERSION (2) | TYPE (1) | LENGTH (4)
pub const HEADER_LEN: usize = 11;

// Maximum frame payload size (16MB) - bounds memory held per connection
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

// Payload size used for DATA frames when streaming object bytes
pub const DATA_CHUNK_SIZE: usize = 1024 * 1024;

// Frame type IDs (keep numeric stable)
pub mod frame {
    // Client: store the object named in the payload; DATA* and END follow
    pub const PUT: u8 = 1;
    // Client: send back the object named in the payload
    pub const GET: u8 = 2;
    pub const DATA: u8 = 3;
    pub const END: u8 = 4;
    // Server: request accepted / upload stored (payload: u64 LE byte count)
    pub const OK: u8 = 5;
    // Server: UTF-8 message; "not found: ..." for missing objects
    pub const ERROR: u8 = 6;
}

/// Prefix of ERROR payloads that mean the object does not exist.
pub const NOT_FOUND_PREFIX: &str = "not found: ";

pub mod timeouts {
    // Connection establishment timeout (ms)
    pub const CONNECT_MS: u64 = 5_000;

    // Idle read timeout on either side of a connection (ms)
    pub const IDLE_READ_MS: u64 = 300_000;
}
