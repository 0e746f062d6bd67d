use thiserror::Error;

use crate::disk::StoreError;

/// Errors that prevent the raft coordinator from starting.
#[derive(Debug, Error)]
pub enum ClusterError {
    #[error("invalid cluster configuration: {0}")]
    Config(String),

    #[error("raft storage: {0}")]
    Store(#[from] StoreError),

    #[error("failed to bind raft listener on {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("raft: {0}")]
    Raft(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_messages() {
        assert_eq!(
            ClusterError::Config("duplicate peer id 2".into()).to_string(),
            "invalid cluster configuration: duplicate peer id 2"
        );
        assert_eq!(
            ClusterError::Store(StoreError::InvalidMagic).to_string(),
            "raft storage: invalid magic bytes"
        );
    }
}
