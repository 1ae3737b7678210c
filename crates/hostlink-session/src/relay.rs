//! Relay negotiation boundary.
//!
//! A relay allocates a routable endpoint for the host and trades short join
//! codes for join descriptors. None of these calls touch the transport.

use std::future::Future;

use hostlink_protocol::{JoinDescriptor, RelayAllocation};

use crate::SessionError;

/// Negotiates relay allocations and join codes.
pub trait RelayNegotiator: Send + Sync + 'static {
    /// Allocates room for `max_peers` non-authority peers.
    ///
    /// Not idempotent: a caller that retries must discard the earlier
    /// allocation.
    fn create_allocation(
        &self,
        max_peers: usize,
    ) -> impl Future<Output = Result<RelayAllocation, SessionError>> + Send;

    /// Returns the join code for `allocation`. The same allocation always
    /// yields the same code. Fails with `AllocationFailure` once the
    /// allocation has expired.
    fn join_code(&self, allocation: &RelayAllocation) -> impl Future<Output = Result<String, SessionError>> + Send;

    /// Exchanges a join code for a join descriptor, taking one of the
    /// allocation's peer slots. Fails with `InvalidJoinCode`.
    fn join_by_code(&self, code: &str) -> impl Future<Output = Result<JoinDescriptor, SessionError>> + Send;

    /// Gives back the slot taken by [`join_by_code`](Self::join_by_code).
    /// Releasing twice, or after the host allocation is gone, is a no-op.
    fn release(&self, join: &JoinDescriptor) -> impl Future<Output = Result<(), SessionError>> + Send;
}
