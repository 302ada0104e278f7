//! Version Gate
//!
//! Decides what a backup does with each replicated heartbeat. Entries must
//! arrive in strict version order; anything else is a permanent
//! desynchronization.

use super::protocol::HeartbeatMessage;
use super::{Fault, Version};

/// What to do with a received heartbeat
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateDecision {
    /// Mutation continues the local stream: apply it
    Apply,
    /// Liveness ping that matches the local version
    InSync,
    /// Older than the bootstrap snapshot; ignore
    Stale,
    /// Desynchronization was already declared; ignore everything
    Discard,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum GateState {
    /// Freshly bootstrapped; datagrams queued before the snapshot may still arrive
    WarmingUp,
    Synchronized,
    Failed,
}

/// Strict-order gate for replicated heartbeats
#[derive(Debug)]
pub struct VersionGate {
    state: GateState,
}

impl VersionGate {
    /// Gate for a backup that is already in step with the primary
    pub fn synchronized() -> Self {
        Self {
            state: GateState::Synchronized,
        }
    }

    /// Gate for a backup that just restored a snapshot
    pub fn after_bootstrap() -> Self {
        Self {
            state: GateState::WarmingUp,
        }
    }

    /// Has the gate declared desynchronization?
    pub fn has_failed(&self) -> bool {
        self.state == GateState::Failed
    }

    /// Check `msg` against the local version
    pub fn check(&mut self, local: Version, msg: &HeartbeatMessage) -> Result<GateDecision, Fault> {
        let remote = msg.version;

        match self.state {
            GateState::Failed => return Ok(GateDecision::Discard),
            GateState::WarmingUp => {
                let stale = match msg.mutation {
                    Some(_) => remote <= local,
                    None => remote < local,
                };
                if stale {
                    return Ok(GateDecision::Stale);
                }
            }
            GateState::Synchronized => {}
        }

        let decision = match msg.mutation {
            Some(ref entry) if remote == local + 1 && entry.version == remote => GateDecision::Apply,
            None if remote == local => GateDecision::InSync,
            _ => {
                self.state = GateState::Failed;
                return Err(Fault::Desynchronized { local, remote });
            }
        };

        self.state = GateState::Synchronized;
        Ok(decision)
    }

    /// Mark the gate failed after a replay error
    pub fn fail(&mut self) {
        self.state = GateState::Failed;
    }
}
