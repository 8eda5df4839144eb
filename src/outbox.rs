//! Side effects accumulated by reducers and drained by the effect runner.

use serde::{Deserialize, Serialize};

use crate::{
    commitment::SignedCommitment,
    protocols::{funding::FundingStrategy, ProcessId, ProtocolLocator},
    transactions::TransactionRequest,
    types::{Address, ChannelId},
};

/// A message for another participant's wallet, delivered through the
/// message relay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageRelay {
    pub to: Address,
    pub process_id: ProcessId,
    pub payload: RelayPayload,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RelayPayload {
    Commitment {
        signed_commitment: SignedCommitment,
    },
    /// Oldest first. Used when a nested protocol advances a channel with more
    /// than two participants.
    Commitments {
        protocol_locator: ProtocolLocator,
        signed_commitments: Vec<SignedCommitment>,
    },
    StrategyProposed {
        strategy: FundingStrategy,
    },
    StrategyApproved {
        strategy: FundingStrategy,
    },
    StrategyRejected,
    FundingCancelled,
    /// Carries the instigator's Conclude commitment, the receiving
    /// dispatcher starts a concluding responder for it.
    ConcludeInstigated {
        signed_commitment: SignedCommitment,
    },
}

/// Events for the application embedding the wallet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum WalletNotification {
    ChallengeDetected { channel_id: ChannelId },
    ProcessSucceeded { process_id: ProcessId },
    ProcessFailed { process_id: ProcessId, reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum OutgoingMessage {
    Relay(MessageRelay),
    Notification(WalletNotification),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueuedTransaction {
    pub process_id: ProcessId,
    pub request: TransactionRequest,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DisplayEvent {
    ShowWallet,
    HideWallet,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboxState {
    pub message_outbox: Vec<OutgoingMessage>,
    pub transaction_outbox: Vec<QueuedTransaction>,
    pub display_outbox: Vec<DisplayEvent>,
}

impl OutboxState {
    pub fn is_empty(&self) -> bool {
        self.message_outbox.is_empty()
            && self.transaction_outbox.is_empty()
            && self.display_outbox.is_empty()
    }

    /// Relay messages only, in the order they were queued.
    pub fn relays(&self) -> impl Iterator<Item = &MessageRelay> {
        self.message_outbox.iter().filter_map(|m| match m {
            OutgoingMessage::Relay(relay) => Some(relay),
            OutgoingMessage::Notification(_) => None,
        })
    }

    pub fn notifications(&self) -> impl Iterator<Item = &WalletNotification> {
        self.message_outbox.iter().filter_map(|m| match m {
            OutgoingMessage::Notification(n) => Some(n),
            OutgoingMessage::Relay(_) => None,
        })
    }
}
