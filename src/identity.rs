//! Cluster identity presented to the relay.
//!
//! The relay tells clusters apart by a 32-byte digest of the service-account
//! token the connector runs with. The token itself never leaves the pod.

use std::fmt;
use std::io;
use std::path::Path;

use sha2::{Digest, Sha256};

/// Length in bytes of the identity written after the channel handshake.
pub const CLUSTER_ID_LEN: usize = 32;

/// Default location of the projected service-account token.
pub const DEFAULT_TOKEN_PATH: &str = "/var/run/secrets/kubernetes.io/serviceaccount/token";

/// SHA-256 of the service-account token.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClusterId([u8; CLUSTER_ID_LEN]);

impl ClusterId {
    pub fn from_token(token: &[u8]) -> Self {
        Self(Sha256::digest(token).into())
    }

    /// Read and hash the token file. Failure here means the connector cannot
    /// tell the relay which cluster it belongs to.
    pub fn load(path: impl AsRef<Path>) -> io::Result<Self> {
        let token = std::fs::read(path)?;
        Ok(Self::from_token(&token))
    }

    pub fn from_bytes(bytes: [u8; CLUSTER_ID_LEN]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; CLUSTER_ID_LEN] {
        &self.0
    }
}

impl fmt::Debug for ClusterId {
    // Only a short prefix: enough to correlate log lines.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ClusterId(")?;
        for b in &self.0[..4] {
            write!(f, "{b:02x}")?;
        }
        write!(f, "…)")
    }
}
