//! Closing a channel cooperatively.
//!
//! The instigator signs a Conclude commitment and relays it, the
//! opponent's wallet starts a responder for it, countersigns and both sides
//! then defund the channel. Both run under the same process id.

pub mod instigator;
pub mod responder;

use core::fmt;

use serde::{Deserialize, Serialize};

use super::{
    defunding::{self, DefundingState},
    user_action, ProcessId, ProtocolStateWithSharedData,
};
use crate::{
    actions::{ConcludingAction, UserAction, WalletAction},
    channel_store::{ChannelStage, ChannelState, StoreError},
    commitment::SignedCommitment,
    outbox::{MessageRelay, RelayPayload},
    shared_data::SharedData,
    types::ChannelId,
};

pub use instigator::InstigatorState;
pub use responder::ResponderState;

pub const PROTOCOL: &str = "Concluding";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureReason {
    NotYourTurn,
    ChannelDoesntExist,
    ChannelNotOpen,
    InvalidCommitment,
    ConcludeCancelled,
    DefundFailed,
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::NotYourTurn => f.write_str("It is not your turn"),
            FailureReason::ChannelDoesntExist => f.write_str("Channel does not exist"),
            FailureReason::ChannelNotOpen => f.write_str("Channel is not open"),
            FailureReason::InvalidCommitment => f.write_str("Invalid conclude commitment"),
            FailureReason::ConcludeCancelled => f.write_str("Concluding was cancelled"),
            FailureReason::DefundFailed => f.write_str("Defunding failed"),
        }
    }
}

impl From<&StoreError> for FailureReason {
    fn from(e: &StoreError) -> Self {
        match e {
            StoreError::ChannelMissing(_) => FailureReason::ChannelDoesntExist,
            StoreError::NotOurTurn => FailureReason::NotYourTurn,
            _ => FailureReason::InvalidCommitment,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConcludingState {
    Instigator(InstigatorState),
    Responder(ResponderState),
}

impl ConcludingState {
    pub fn is_terminal(&self) -> bool {
        match self {
            ConcludingState::Instigator(s) => s.is_terminal(),
            ConcludingState::Responder(s) => s.is_terminal(),
        }
    }

    pub fn awaiting_user(&self) -> bool {
        match self {
            ConcludingState::Instigator(s) => s.awaiting_user(),
            ConcludingState::Responder(s) => s.awaiting_user(),
        }
    }

    /// `Some` once the process ended in failure.
    pub fn failure_reason(&self) -> Option<FailureReason> {
        match self {
            ConcludingState::Instigator(InstigatorState::Failure { reason, .. })
            | ConcludingState::Responder(ResponderState::Failure { reason, .. }) => Some(*reason),
            _ => None,
        }
    }
}

pub fn reducer(
    state: ConcludingState,
    shared: SharedData,
    action: &WalletAction,
) -> ProtocolStateWithSharedData<ConcludingState> {
    match state {
        ConcludingState::Instigator(s) => {
            instigator::reducer(s, shared, action).map(ConcludingState::Instigator)
        }
        ConcludingState::Responder(s) => {
            responder::reducer(s, shared, action).map(ConcludingState::Responder)
        }
    }
}

/// The channel, if it may be concluded at all.
fn concludable(shared: &SharedData, channel_id: ChannelId) -> Result<&ChannelState, FailureReason> {
    let channel = shared
        .get_channel(channel_id)
        .ok_or(FailureReason::ChannelDoesntExist)?;
    match channel.stage {
        ChannelStage::Funding | ChannelStage::Running => Ok(channel),
        _ => Err(FailureReason::ChannelNotOpen),
    }
}

fn concluding_action(action: &WalletAction) -> Option<ConcludingAction> {
    match user_action(action) {
        Some(UserAction::Concluding(action)) => Some(*action),
        _ => None,
    }
}

/// The Conclude commitment carried by a `ConcludeInstigated` message.
fn instigated_commitment(action: &WalletAction) -> Option<&SignedCommitment> {
    match action {
        WalletAction::Message(MessageRelay {
            payload: RelayPayload::ConcludeInstigated { signed_commitment },
            ..
        }) => Some(signed_commitment),
        _ => None,
    }
}

/// Where defunding leaves a concluding process.
enum Defunded {
    Pending(DefundingState),
    Done,
    Failed,
}

fn start_defunding(
    shared: SharedData,
    process_id: ProcessId,
    channel_id: ChannelId,
) -> ProtocolStateWithSharedData<Defunded> {
    defunding::initialize(shared, process_id, channel_id).map(defunded)
}

fn defunded(state: DefundingState) -> Defunded {
    match state {
        DefundingState::Success { .. } => Defunded::Done,
        DefundingState::Failure { .. } => Defunded::Failed,
        pending => Defunded::Pending(pending),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        actions::WithdrawalAction,
        outbox::RelayPayload,
        protocols::{withdrawal::WithdrawalState, ProcessId},
        shared_data::FundingType,
        test_utils::{commitment_received, sent_commitments, user, Fixture},
    };

    fn concluding(f: &Fixture, action: ConcludingAction) -> WalletAction {
        user(&pid(f), UserAction::Concluding(action))
    }

    fn pid(f: &Fixture) -> ProcessId {
        ProcessId::new(PROTOCOL, f.channel.id())
    }

    fn funded(f: &Fixture, our_index: usize) -> SharedData {
        f.running_shared(our_index)
            .set_funding_state(f.channel.id(), FundingType::Direct)
    }

    #[test]
    fn both_sides_conclude_then_defund() {
        let f = Fixture::two_party();
        let alice = instigator::initialize(funded(&f, 0), pid(&f), f.channel.id());
        let mut alice = reducer(
            ConcludingState::Instigator(alice.protocol_state),
            alice.shared_data,
            &concluding(&f, ConcludingAction::ConcludeApproved),
        );
        let instigated = match alice.shared_data.take_outbox().relays().next().map(|r| &r.payload) {
            Some(RelayPayload::ConcludeInstigated { signed_commitment }) => signed_commitment.clone(),
            other => panic!("expected ConcludeInstigated, got {:?}", other),
        };

        let bob = responder::initialize(funded(&f, 1), pid(&f), instigated);
        let bob = reducer(
            ConcludingState::Responder(bob.protocol_state),
            bob.shared_data,
            &concluding(&f, ConcludingAction::ConcludeApproved),
        );
        assert!(matches!(
            bob.protocol_state,
            ConcludingState::Responder(ResponderState::DecideDefund { .. })
        ));
        assert!(bob.shared_data.get_channel(f.channel.id()).unwrap().is_closed());

        let reply = sent_commitments(&bob.shared_data).remove(0);
        let alice = reducer(alice.protocol_state, alice.shared_data, &commitment_received(&pid(&f), reply));
        assert!(matches!(
            alice.protocol_state,
            ConcludingState::Instigator(InstigatorState::AcknowledgeConcludeReceived { .. })
        ));

        let alice = reducer(
            alice.protocol_state,
            alice.shared_data,
            &concluding(&f, ConcludingAction::DefundChosen),
        );
        assert!(matches!(
            alice.protocol_state,
            ConcludingState::Instigator(InstigatorState::WaitForDefund {
                defunding: DefundingState::WaitForWithdrawal {
                    withdrawal: WithdrawalState::WaitForApproval { .. },
                    ..
                },
                ..
            })
        ));

        let alice = reducer(
            alice.protocol_state,
            alice.shared_data,
            &user(&pid(&f), UserAction::Withdrawal(WithdrawalAction::WithdrawalRejected)),
        );
        let alice = reducer(
            alice.protocol_state,
            alice.shared_data,
            &concluding(&f, ConcludingAction::AcknowledgeFailure),
        );
        assert_eq!(
            alice.protocol_state.failure_reason(),
            Some(FailureReason::DefundFailed)
        );
        assert!(alice.protocol_state.is_terminal());
    }
}
