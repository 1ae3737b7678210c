//! Relay allocation types and their conversion into transport descriptors.

use hostlink_transport::ConnectionDescriptor;
use serde::{Deserialize, Serialize};

use crate::AllocationId;

/// A host's relay allocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayAllocation {
    pub allocation_id: AllocationId,
    pub endpoint: String,
    pub port: u16,
    pub allocation_id_bytes: Vec<u8>,
    /// 64 bytes of key material.
    pub key: Vec<u8>,
    pub connection_data: Vec<u8>,
    /// Peers (excluding the host) this allocation admits.
    pub max_peers: usize,
}

impl RelayAllocation {
    /// Builds the authority-side transport descriptor.
    pub fn connection_descriptor(&self, secure: bool) -> ConnectionDescriptor {
        ConnectionDescriptor {
            endpoint: self.endpoint.clone(),
            port: self.port,
            allocation_id: self.allocation_id_bytes.clone(),
            key: self.key.clone(),
            connection_data: self.connection_data.clone(),
            host_connection_data: None,
            secure,
        }
    }
}

/// What a joiner receives in exchange for a join code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinDescriptor {
    pub allocation_id: AllocationId,
    pub endpoint: String,
    pub port: u16,
    pub allocation_id_bytes: Vec<u8>,
    pub key: Vec<u8>,
    /// The joiner's own connection data.
    pub connection_data: Vec<u8>,
    /// The host's connection data, used to route to the authority.
    pub host_connection_data: Vec<u8>,
}

impl JoinDescriptor {
    /// Builds the participant-side transport descriptor.
    pub fn connection_descriptor(&self, secure: bool) -> ConnectionDescriptor {
        ConnectionDescriptor {
            endpoint: self.endpoint.clone(),
            port: self.port,
            allocation_id: self.allocation_id_bytes.clone(),
            key: self.key.clone(),
            connection_data: self.connection_data.clone(),
            host_connection_data: Some(self.host_connection_data.clone()),
            secure,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocation_descriptor_is_authority() {
        let allocation = RelayAllocation {
            allocation_id: AllocationId("alloc-1".into()),
            endpoint: "relay.local".into(),
            port: 7777,
            allocation_id_bytes: vec![1; 16],
            key: vec![2; 64],
            connection_data: vec![3; 16],
            max_peers: 3,
        };
        let descriptor = allocation.connection_descriptor(true);
        assert!(descriptor.is_authority());
        assert!(descriptor.secure);
        assert_eq!(descriptor.key.len(), 64);
        assert_eq!(descriptor.connection_data, vec![3; 16]);
    }

    #[test]
    fn test_join_descriptor_carries_host_data() {
        let join = JoinDescriptor {
            allocation_id: AllocationId("alloc-2".into()),
            endpoint: "relay.local".into(),
            port: 7777,
            allocation_id_bytes: vec![1; 16],
            key: vec![2; 64],
            connection_data: vec![4; 16],
            host_connection_data: vec![3; 16],
        };
        let descriptor = join.connection_descriptor(false);
        assert!(!descriptor.is_authority());
        assert_eq!(descriptor.host_connection_data, Some(vec![3; 16]));
        assert_eq!(descriptor.port, 7777);
    }
}
