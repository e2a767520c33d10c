//! Collision-resistant identifiers as a port.

use uuid::Uuid;

/// Id prefixes used across the ledger.
pub mod prefix {
    pub const CHALLENGE: &str = "chal";
    pub const RECEIPT: &str = "rcpt";
    pub const SESSION: &str = "sess";
    pub const AGENT: &str = "agt";
}

/// Produces identifiers for challenges, receipts, sessions, and agents, plus
/// high-entropy bearer tokens for agents.
pub trait IdGenerator: Send + Sync {
    /// A collision-resistant id with the given prefix, e.g. `chal_9f2c…`.
    fn id(&self, prefix: &str) -> String;

    /// A high-entropy opaque secret. Shown once at agent creation.
    fn token(&self) -> String;
}

/// Production generator: UUIDv4 ids and 256-bit random tokens.
#[derive(Debug, Clone, Copy, Default)]
pub struct UuidIds;

impl IdGenerator for UuidIds {
    fn id(&self, prefix: &str) -> String {
        format!("{prefix}_{}", Uuid::new_v4().simple())
    }

    fn token(&self) -> String {
        format!("agtk_{}", hex::encode(rand::random::<[u8; 32]>()))
    }
}
