use serde::{Deserialize, Serialize};
use thiserror::Error;

/// The directory's domain error taxonomy.
///
/// Serializable so handlers can return the exact variant in the response body
/// and the client orchestrator can match on it after the round trip.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Error)]
pub enum DirectoryError {
    #[error("user is not registered with the directory")]
    UserNotFound,

    #[error("user already exists")]
    UserAlreadyExists,

    #[error("no bucket has {requested} bytes of free capacity")]
    CapacityExceeded { requested: u64 },

    #[error("allocation of {requested} bytes would exceed the quota ceiling ({bytes_used}/{byte_limit} used)")]
    QuotaExceeded {
        byte_limit: u64,
        bytes_used: u64,
        requested: u64,
    },

    #[error("uploaded bytes did not match the claimed digest")]
    HashMismatch,

    #[error("no matching pending allocation")]
    NotFound,

    #[error("the reservation's lease expired before finalize")]
    LeaseExpired,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_format_carries_the_variant() {
        let json =
            serde_json::to_string(&DirectoryError::CapacityExceeded { requested: 512 }).unwrap();
        assert!(json.contains("CapacityExceeded"));

        let back: DirectoryError = serde_json::from_str(&json).unwrap();
        assert_eq!(back, DirectoryError::CapacityExceeded { requested: 512 });

        // Unit variants travel as bare strings.
        assert_eq!(
            serde_json::to_string(&DirectoryError::NotFound).unwrap(),
            "\"NotFound\""
        );
    }
}

