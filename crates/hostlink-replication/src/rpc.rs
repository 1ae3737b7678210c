//! Targeted remote procedure calls.
//!
//! Calls are routed through the authority (star topology). A participant
//! hands every call for someone else to the authority; the authority stamps
//! the real sender, re-checks the invocation permission, and forwards.
//! Delivered calls wait in an inbox until the next [`RpcDispatcher::drain`],
//! so handlers never run re-entrantly inside `invoke` or `receive`.

use std::collections::{BTreeSet, HashMap, VecDeque};

use hostlink_protocol::{Codec, InvocationPermission, ParticipantId, RpcEnvelope, TargetSelector};
use serde::Serialize;

use crate::{Participant, RpcError};

/// A call to be invoked: everything in an [`RpcEnvelope`] except the
/// sender, which the dispatcher fills in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RpcRequest {
    pub target: TargetSelector,
    pub permission: InvocationPermission,
    pub opcode: String,
    pub payload: Vec<u8>,
}

impl RpcRequest {
    pub fn new(
        target: TargetSelector,
        permission: InvocationPermission,
        opcode: impl Into<String>,
        payload: Vec<u8>,
    ) -> Self {
        Self {
            target,
            permission,
            opcode: opcode.into(),
            payload,
        }
    }

    /// Builds a request whose payload is `value` encoded with `codec`.
    pub fn encode<C: Codec, T: Serialize>(
        codec: &C,
        target: TargetSelector,
        permission: InvocationPermission,
        opcode: impl Into<String>,
        value: &T,
    ) -> Result<Self, RpcError> {
        Ok(Self::new(target, permission, opcode, codec.encode(value)?))
    }
}

/// An envelope addressed to one remote participant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutedEnvelope {
    pub to: ParticipantId,
    pub envelope: RpcEnvelope,
}

/// Handles one opcode. Gets the handler state and the call; returns
/// follow-up calls (a reply, typically).
pub type RpcHandler<S> = Box<dyn FnMut(&mut S, &RpcEnvelope) -> Vec<RpcRequest> + Send>;

/// Routes calls between participants and runs handlers.
pub struct RpcDispatcher<S> {
    local: Participant,
    /// Remote non-authority participants (authority side only).
    participants: BTreeSet<ParticipantId>,
    handlers: HashMap<String, RpcHandler<S>>,
    inbox: VecDeque<RpcEnvelope>,
    outgoing: Vec<RoutedEnvelope>,
    violations: u64,
}

impl<S> RpcDispatcher<S> {
    pub fn new(local: Participant) -> Self {
        Self {
            local,
            participants: BTreeSet::new(),
            handlers: HashMap::new(),
            inbox: VecDeque::new(),
            outgoing: Vec::new(),
            violations: 0,
        }
    }

    pub fn local(&self) -> Participant {
        self.local
    }

    pub fn violations(&self) -> u64 {
        self.violations
    }

    // -----------------------------------------------------------------------
    // Handlers
    // -----------------------------------------------------------------------

    /// Registers `handler` for `opcode`, returning the handler it replaces.
    pub fn register_handler<F>(&mut self, opcode: impl Into<String>, handler: F) -> Option<RpcHandler<S>>
    where
        F: FnMut(&mut S, &RpcEnvelope) -> Vec<RpcRequest> + Send + 'static,
    {
        self.handlers.insert(opcode.into(), Box::new(handler))
    }

    pub fn unregister_handler(&mut self, opcode: &str) -> Option<RpcHandler<S>> {
        self.handlers.remove(opcode)
    }

    // -----------------------------------------------------------------------
    // Participants
    // -----------------------------------------------------------------------

    pub fn add_participant(&mut self, id: ParticipantId) {
        if !id.is_authority() {
            self.participants.insert(id);
        }
    }

    pub fn remove_participant(&mut self, id: ParticipantId) -> bool {
        self.participants.remove(&id)
    }

    /// Connected remote participants, ascending.
    pub fn participants(&self) -> impl Iterator<Item = ParticipantId> + '_ {
        self.participants.iter().copied()
    }

    // -----------------------------------------------------------------------
    // Routing
    // -----------------------------------------------------------------------

    /// Invokes a call as the local participant.
    pub fn invoke(&mut self, request: RpcRequest) -> Result<(), RpcError> {
        if request.permission == InvocationPermission::AuthorityOnly && !self.local.is_authority {
            self.violations += 1;
            tracing::warn!(opcode = %request.opcode, sender = %self.local.id, "invocation rejected: authority only");
            return Err(RpcError::PermissionViolation {
                opcode: request.opcode,
                sender: self.local.id,
            });
        }

        let envelope = RpcEnvelope {
            sender: self.local.id,
            target: request.target,
            permission: request.permission,
            opcode: request.opcode,
            payload: request.payload,
        };
        self.route(envelope, None)
    }

    /// Accepts a call that arrived on the link of participant `from`.
    pub fn receive(&mut self, mut envelope: RpcEnvelope, from: ParticipantId) -> Result<(), RpcError> {
        if self.local.is_authority {
            envelope.sender = from;
        }

        if envelope.permission == InvocationPermission::AuthorityOnly && !envelope.sender.is_authority() {
            self.violations += 1;
            tracing::warn!(opcode = %envelope.opcode, sender = %envelope.sender, "incoming call rejected: authority only");
            return Err(RpcError::PermissionViolation {
                opcode: envelope.opcode,
                sender: envelope.sender,
            });
        }

        if self.local.is_authority {
            return self.route(envelope, Some(from));
        }

        // A participant only hears from the authority, which already routed.
        if let TargetSelector::SpecificParticipant(id) = envelope.target {
            if id != self.local.id {
                tracing::warn!(opcode = %envelope.opcode, target = %id, "dropping misrouted call");
                return Ok(());
            }
        }
        self.inbox.push_back(envelope);
        Ok(())
    }

    /// Delivers locally and/or queues for remote participants. `origin` is
    /// the participant the call came from, which never gets it back.
    fn route(&mut self, envelope: RpcEnvelope, origin: Option<ParticipantId>) -> Result<(), RpcError> {
        match envelope.target {
            TargetSelector::Authority => {
                if self.local.is_authority {
                    self.inbox.push_back(envelope);
                } else {
                    self.send(ParticipantId::AUTHORITY, envelope);
                }
            }
            TargetSelector::AllParticipants => {
                if self.local.is_authority {
                    let targets: Vec<ParticipantId> =
                        self.participants.iter().copied().filter(|p| Some(*p) != origin).collect();
                    for to in targets {
                        self.send(to, envelope.clone());
                    }
                } else if origin.is_none() {
                    self.send(ParticipantId::AUTHORITY, envelope.clone());
                }
                self.inbox.push_back(envelope);
            }
            TargetSelector::SpecificParticipant(id) => {
                if id == self.local.id {
                    self.inbox.push_back(envelope);
                } else if !self.local.is_authority {
                    self.send(ParticipantId::AUTHORITY, envelope);
                } else if self.participants.contains(&id) {
                    self.send(id, envelope);
                } else {
                    tracing::warn!(opcode = %envelope.opcode, target = %id, "call for unknown participant");
                    return Err(RpcError::UnknownParticipant(id));
                }
            }
        }
        Ok(())
    }

    fn send(&mut self, to: ParticipantId, envelope: RpcEnvelope) {
        self.outgoing.push(RoutedEnvelope { to, envelope });
    }

    /// Takes the envelopes queued for remote participants.
    pub fn take_outgoing(&mut self) -> Vec<RoutedEnvelope> {
        std::mem::take(&mut self.outgoing)
    }

    /// Calls waiting for the next [`drain`](Self::drain).
    pub fn pending(&self) -> usize {
        self.inbox.len()
    }

    /// Runs handlers for the calls delivered before this call, in receipt
    /// order. Calls delivered by the handlers themselves wait for the next
    /// drain. Returns how many calls were handled.
    pub fn drain(&mut self, state: &mut S) -> usize {
        let batch: Vec<RpcEnvelope> = self.inbox.drain(..).collect();
        let mut handled = 0;
        for envelope in batch {
            let follow_ups = match self.handlers.get_mut(&envelope.opcode) {
                Some(handler) => {
                    handled += 1;
                    handler(state, &envelope)
                }
                None => {
                    tracing::debug!(opcode = %envelope.opcode, sender = %envelope.sender, "no handler registered");
                    continue;
                }
            };
            for request in follow_ups {
                if let Err(e) = self.invoke(request) {
                    tracing::warn!(opcode = %envelope.opcode, error = %e, "follow-up call failed");
                }
            }
        }
        handled
    }

    /// Drops queued calls and known participants. Handlers stay.
    pub fn clear(&mut self) {
        self.participants.clear();
        self.inbox.clear();
        self.outgoing.clear();
    }
}
