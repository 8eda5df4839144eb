//! Everything the wallet reacts to: peer messages, chain events,
//! transaction progress reported by the chain adapter and user decisions.

use serde::{Deserialize, Serialize};

use crate::{
    commitment::{Commitment, SignedCommitment},
    outbox::MessageRelay,
    protocols::{funding::FundingStrategy, ProcessId},
    types::{Address, ChannelId, Hash, PrivateKey, U256},
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum WalletAction {
    Start(StartProcess),
    /// A message relayed from another participant's wallet.
    Message(MessageRelay),
    Chain(ChainEvent),
    Transaction {
        process_id: ProcessId,
        action: TransactionAction,
    },
    User {
        process_id: ProcessId,
        action: UserAction,
    },
    Cancel {
        process_id: ProcessId,
    },
    CloseChannelRequest {
        channel_id: ChannelId,
    },
}

impl WalletAction {
    /// Process the action is addressed to, chain events are broadcast.
    pub fn process_id(&self) -> Option<&ProcessId> {
        match self {
            WalletAction::Message(relay) => Some(&relay.process_id),
            WalletAction::Transaction { process_id, .. }
            | WalletAction::User { process_id, .. }
            | WalletAction::Cancel { process_id } => Some(process_id),
            WalletAction::Start(_)
            | WalletAction::Chain(_)
            | WalletAction::CloseChannelRequest { .. } => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StartProcess {
    Funding {
        channel_id: ChannelId,
    },
    VirtualFunding {
        target_channel_id: ChannelId,
        /// Participants of the target channel, the hub is appended for the
        /// joint and guarantor channels.
        target_participants: Vec<Address>,
        target_allocation: Vec<U256>,
        hub: Address,
        nonce: u64,
        private_key: PrivateKey,
    },
    Challenge {
        channel_id: ChannelId,
    },
    Conclude {
        channel_id: ChannelId,
    },
    Defund {
        channel_id: ChannelId,
    },
}

/// Typed, already decoded adjudicator events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChainEvent {
    FundingReceived {
        channel_id: ChannelId,
        amount: U256,
        total_for_destination: U256,
    },
    ChallengeCreated {
        channel_id: ChannelId,
        /// The challenger's commitment, with the signature the adjudicator
        /// checked.
        commitment: SignedCommitment,
        finalized_at: u64,
    },
    RespondWithMove {
        channel_id: ChannelId,
        response: SignedCommitment,
    },
    Concluded {
        channel_id: ChannelId,
    },
    BlockMined {
        timestamp: u64,
    },
}

impl ChainEvent {
    pub fn channel_id(&self) -> Option<ChannelId> {
        match self {
            ChainEvent::FundingReceived { channel_id, .. }
            | ChainEvent::ChallengeCreated { channel_id, .. }
            | ChainEvent::RespondWithMove { channel_id, .. }
            | ChainEvent::Concluded { channel_id } => Some(*channel_id),
            ChainEvent::BlockMined { .. } => None,
        }
    }
}

/// Progress of a transaction, reported by the chain adapter or decided by
/// the user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransactionAction {
    /// Handed to the chain adapter.
    Sent,
    Submitted { transaction_hash: Hash },
    SubmissionFailed { reason: String },
    Confirmed,
    /// Mined, but reverted.
    Failed,
    RetryApproved,
    RetryDenied,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum UserAction {
    Funding(FundingAction),
    Challenger(ChallengerAction),
    Responder(ResponderAction),
    Concluding(ConcludingAction),
    Withdrawal(WithdrawalAction),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FundingAction {
    StrategyChosen { strategy: FundingStrategy },
    StrategyApproved,
    StrategyRejected,
    SuccessAcknowledged,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChallengerAction {
    ChallengeApproved,
    ChallengeDenied,
    ResponseAcknowledged,
    TimeoutAcknowledged,
    FailureAcknowledged,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResponderAction {
    RespondApproved,
    RespondRejected,
    /// A fresh commitment (ours to sign) answering the challenge.
    ResponseProvided { commitment: Commitment },
    SuccessAcknowledged,
    TimeoutAcknowledged,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConcludingAction {
    ConcludeApproved,
    ConcludeCancelled,
    DefundChosen,
    AcknowledgeSuccess,
    AcknowledgeFailure,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum WithdrawalAction {
    WithdrawalApproved { destination: Address },
    WithdrawalRejected,
    SuccessAcknowledged,
}
