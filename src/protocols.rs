//! The protocol state machines.
//!
//! Every protocol is a closed state enum plus a pure reducer taking the
//! current state, the [SharedData] snapshot and an action, and returning the
//! next state together with the next snapshot. Embedded (child) protocols are
//! owned by their parent's state and reduced by the parent.

pub mod advance_channel;
pub mod challenging;
pub mod concluding;
pub mod defunding;
pub mod direct_funding;
pub mod funding;
pub mod indirect_defunding;
pub mod indirect_funding;
pub mod responding;
pub mod transaction_submission;
pub mod virtual_funding;
pub mod withdrawal;

use core::fmt;

use serde::{Deserialize, Serialize};

use crate::{
    actions::{ChainEvent, TransactionAction, UserAction, WalletAction},
    commitment::SignedCommitment,
    outbox::{MessageRelay, RelayPayload},
    shared_data::SharedData,
    types::ChannelId,
};

/// Correlates all state and messages of one run of a protocol.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ProcessId(pub String);

impl ProcessId {
    /// Both parties derive the same id for the same protocol and channel.
    pub fn new(protocol: &str, channel_id: ChannelId) -> Self {
        Self(format!("{}-{:?}", protocol, channel_id))
    }
}

impl fmt::Display for ProcessId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Path of named slots leading from a top-level protocol to a nested one.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtocolLocator(pub Vec<String>);

impl ProtocolLocator {
    pub const JOINT_CHANNEL: &'static str = "jointChannel";
    pub const GUARANTOR_CHANNEL: &'static str = "guarantorChannel";

    pub fn root() -> Self {
        Self::default()
    }

    pub fn child(&self, slot: &str) -> Self {
        let mut path = self.0.clone();
        path.push(slot.to_string());
        Self(path)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtocolStateWithSharedData<S> {
    pub protocol_state: S,
    pub shared_data: SharedData,
}

impl<S> ProtocolStateWithSharedData<S> {
    pub fn new(protocol_state: S, shared_data: SharedData) -> Self {
        Self {
            protocol_state,
            shared_data,
        }
    }

    pub fn map<T>(self, f: impl FnOnce(S) -> T) -> ProtocolStateWithSharedData<T> {
        ProtocolStateWithSharedData {
            protocol_state: f(self.protocol_state),
            shared_data: self.shared_data,
        }
    }
}

/// Shorthand for returning a state with its snapshot.
pub(crate) fn with<S>(protocol_state: S, shared_data: SharedData) -> ProtocolStateWithSharedData<S> {
    ProtocolStateWithSharedData::new(protocol_state, shared_data)
}

pub(crate) fn received_commitment(action: &WalletAction) -> Option<&SignedCommitment> {
    match action {
        WalletAction::Message(MessageRelay {
            payload: RelayPayload::Commitment { signed_commitment },
            ..
        }) => Some(signed_commitment),
        _ => None,
    }
}

/// A relayed batch of commitments with the locator it is addressed to.
pub(crate) fn relayed_commitments(
    action: &WalletAction,
) -> Option<(&ProtocolLocator, &[SignedCommitment])> {
    match action {
        WalletAction::Message(MessageRelay {
            payload:
                RelayPayload::Commitments {
                    protocol_locator,
                    signed_commitments,
                },
            ..
        }) => Some((protocol_locator, signed_commitments)),
        _ => None,
    }
}

/// Commitments relayed for the nested protocol at `locator`.
pub(crate) fn received_commitments<'a>(
    action: &'a WalletAction,
    locator: &ProtocolLocator,
) -> Option<&'a [SignedCommitment]> {
    relayed_commitments(action)
        .filter(|(protocol_locator, _)| *protocol_locator == locator)
        .map(|(_, batch)| batch)
}

pub(crate) fn user_action(action: &WalletAction) -> Option<&UserAction> {
    match action {
        WalletAction::User { action, .. } => Some(action),
        _ => None,
    }
}

pub(crate) fn transaction_action(action: &WalletAction) -> Option<&TransactionAction> {
    match action {
        WalletAction::Transaction { action, .. } => Some(action),
        _ => None,
    }
}

pub(crate) fn chain_event(action: &WalletAction) -> Option<&ChainEvent> {
    match action {
        WalletAction::Chain(event) => Some(event),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Address;

    #[test]
    fn process_ids_are_deterministic() {
        let id = Address([0xab; 20]);
        assert_eq!(ProcessId::new("Funding", id), ProcessId::new("Funding", id));
        assert_ne!(
            ProcessId::new("Funding", id),
            ProcessId::new("Concluding", id)
        );
        assert!(ProcessId::new("Funding", id).0.starts_with("Funding-0xabab"));
    }

    #[test]
    fn locator_child_extends_path() {
        let locator = ProtocolLocator::root().child(ProtocolLocator::JOINT_CHANNEL);
        assert_eq!(locator.0, vec!["jointChannel".to_string()]);
    }
}
