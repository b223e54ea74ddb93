//! Common types for the trustmirror environment abstraction.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identifier of one established connection (one `Open` period).
///
/// Uses UUID v4 so log lines from different reconnects never collide.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(pub Uuid);

impl SessionId {
    /// Creates a new random SessionId.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Creates a deterministic SessionId from a seed (for simulation).
    pub fn from_seed(seed: u64) -> Self {
        let mut bytes = [0u8; 16];
        bytes[0..8].copy_from_slice(&seed.to_le_bytes());
        bytes[8..16].copy_from_slice(&seed.wrapping_mul(0x517cc1b727220a95).to_le_bytes());
        Self(Uuid::from_bytes(bytes))
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Show first 8 chars for readability
        write!(f, "{}", &self.0.to_string()[..8])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_id_from_seed_is_stable() {
        assert_eq!(SessionId::from_seed(7), SessionId::from_seed(7));
        assert_ne!(SessionId::from_seed(7), SessionId::from_seed(8));
    }

    #[test]
    fn test_session_id_display_is_short() {
        assert_eq!(SessionId::new().to_string().len(), 8);
    }
}
