//! Error types for the plugin bridge

use thiserror::Error;

use crate::protocol::ObjectHandle;

#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("Transport failure: {0}")]
    Transport(#[from] std::io::Error),

    #[error("Malformed message: {0}")]
    Corrupt(String),

    #[error("{what} length {len} exceeds maximum {max}")]
    LimitExceeded {
        what: &'static str,
        len: usize,
        max: usize,
    },

    #[error("Shared memory exhausted: {0}")]
    ShmExhausted(String),

    #[error("Stale offset plan: plan generation {plan} != region generation {region}")]
    StalePlan { plan: u64, region: u64 },

    #[error("Plugin instance is dead")]
    InstanceDead,

    #[error("Object handle {0} is no longer valid")]
    HandleInvalid(ObjectHandle),

    #[error("Context menu {0} is not registered")]
    MenuInvalid(u64),

    #[error("Channel closed")]
    ChannelClosed,

    #[error("Timeout after {0}ms waiting for response")]
    Timeout(u64),

    #[error("Protocol error: {0}")]
    ProtocolError(String),
}

impl From<bincode::Error> for BridgeError {
    fn from(err: bincode::Error) -> Self {
        BridgeError::Corrupt(err.to_string())
    }
}

impl BridgeError {
    /// Whether this error poisons the instance. Once a fatal error has been
    /// observed, every subsequent call on the same instance must fail with
    /// [`BridgeError::InstanceDead`].
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            BridgeError::Transport(_)
                | BridgeError::Corrupt(_)
                | BridgeError::ShmExhausted(_)
                | BridgeError::InstanceDead
                | BridgeError::ChannelClosed
                | BridgeError::Timeout(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, BridgeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_limit_exceeded_display() {
        let err = BridgeError::LimitExceeded {
            what: "bus count",
            len: 64,
            max: 32,
        };
        let msg = err.to_string();
        assert!(msg.contains("bus count"));
        assert!(msg.contains("64"));
        assert!(msg.contains("32"));
    }

    #[test]
    fn test_fatal_classification() {
        assert!(BridgeError::InstanceDead.is_fatal());
        assert!(BridgeError::Corrupt("bad tag".into()).is_fatal());
        assert!(BridgeError::Timeout(5000).is_fatal());
        assert!(!BridgeError::LimitExceeded {
            what: "channels",
            len: 33,
            max: 32
        }
        .is_fatal());
        assert!(!BridgeError::MenuInvalid(7).is_fatal());
        assert!(!BridgeError::StalePlan { plan: 1, region: 2 }.is_fatal());
    }
}
