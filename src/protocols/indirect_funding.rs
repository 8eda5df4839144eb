//! Funding an application channel through a directly funded ledger channel.
//!
//! The ledger channel runs the consensus app over the application channel's
//! participants. Player A (participant 0) opens it, both fund it directly,
//! then A proposes a ledger update moving the ledger's total to the
//! application channel and B votes for it. Finally the application channel's
//! PostFundSetup round is exchanged.

pub mod player_a;
pub mod player_b;

use core::fmt;

use serde::{Deserialize, Serialize};

use super::{ProcessId, ProtocolStateWithSharedData};
use crate::{
    actions::WalletAction,
    commitment::{Channel, CommitmentType},
    config::WalletConfig,
    shared_data::{FundingType, SharedData},
    types::{ChannelId, U256},
};

pub use player_a::PlayerAState;
pub use player_b::PlayerBState;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureReason {
    ChannelMissing,
    LedgerSetupFailed,
    LedgerFundingFailed,
    UnexpectedLedgerUpdate,
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::ChannelMissing => f.write_str("Channel does not exist"),
            FailureReason::LedgerSetupFailed => f.write_str("Could not open the ledger channel"),
            FailureReason::LedgerFundingFailed => f.write_str("Ledger funding failed"),
            FailureReason::UnexpectedLedgerUpdate => f.write_str("Unexpected ledger update"),
        }
    }
}

/// Identifies one indirect funding run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerFunding {
    pub process_id: ProcessId,
    pub channel_id: ChannelId,
    pub ledger_id: ChannelId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum IndirectFundingState {
    PlayerA(PlayerAState),
    PlayerB(PlayerBState),
}

impl IndirectFundingState {
    pub fn is_terminal(&self) -> bool {
        self.is_success() || self.failure().is_some()
    }

    pub fn awaiting_user(&self) -> bool {
        match self {
            IndirectFundingState::PlayerA(PlayerAState::AWaitForDirectFunding {
                direct_funding_state,
                ..
            })
            | IndirectFundingState::PlayerB(PlayerBState::BWaitForDirectFunding {
                direct_funding_state,
                ..
            }) => direct_funding_state.awaiting_user(),
            _ => false,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(
            self,
            IndirectFundingState::PlayerA(PlayerAState::Success { .. })
                | IndirectFundingState::PlayerB(PlayerBState::Success { .. })
        )
    }

    pub fn failure(&self) -> Option<FailureReason> {
        match self {
            IndirectFundingState::PlayerA(PlayerAState::Failure { reason, .. })
            | IndirectFundingState::PlayerB(PlayerBState::Failure { reason, .. }) => Some(*reason),
            _ => None,
        }
    }
}

/// The ledger channel funding `app`.
pub fn ledger_channel(config: &WalletConfig, app: &Channel) -> Channel {
    Channel::new(config.consensus_library, app.nonce, app.participants.clone())
}

pub fn initialize(
    shared: SharedData,
    config: &WalletConfig,
    process_id: ProcessId,
    channel_id: ChannelId,
) -> ProtocolStateWithSharedData<IndirectFundingState> {
    match shared.get_channel(channel_id).map(|c| c.our_index) {
        Some(0) => player_a::initialize(shared, config, process_id, channel_id)
            .map(IndirectFundingState::PlayerA),
        Some(_) => player_b::initialize(shared, config, process_id, channel_id)
            .map(IndirectFundingState::PlayerB),
        None => ProtocolStateWithSharedData::new(
            IndirectFundingState::PlayerA(PlayerAState::Failure {
                process_id,
                reason: FailureReason::ChannelMissing,
            }),
            shared,
        ),
    }
}

pub fn reducer(
    state: IndirectFundingState,
    shared: SharedData,
    action: &WalletAction,
) -> ProtocolStateWithSharedData<IndirectFundingState> {
    match state {
        IndirectFundingState::PlayerA(state) => {
            player_a::reducer(state, shared, action).map(IndirectFundingState::PlayerA)
        }
        IndirectFundingState::PlayerB(state) => {
            player_b::reducer(state, shared, action).map(IndirectFundingState::PlayerB)
        }
    }
}

fn app_total(shared: &SharedData, channel_id: ChannelId) -> U256 {
    shared
        .get_channel(channel_id)
        .map_or(U256::zero(), |c| c.last().total())
}

/// Sign and send our application PostFundSetup commitment if it is our turn.
fn send_app_post_fund_setup(shared: SharedData, ids: &LedgerFunding) -> SharedData {
    let next = shared
        .get_channel(ids.channel_id)
        .filter(|c| c.our_turn())
        .and_then(|c| c.last().next_setup())
        .filter(|c| c.commitment_type == CommitmentType::PostFundSetup);
    match next.map(|c| shared.sign_and_store(c)) {
        Some(Ok((shared, signed))) => shared.send_commitment(&ids.process_id, signed),
        Some(Err(e)) => {
            tracing::warn!(process_id = %ids.process_id, error = %e, "could not sign PostFundSetup");
            shared
        }
        None => shared,
    }
}

fn app_setup_complete(shared: &SharedData, ids: &LedgerFunding) -> bool {
    shared
        .get_channel(ids.channel_id)
        .map_or(false, |c| c.last().completes_setup())
}

fn record_app_funding(shared: SharedData, ids: &LedgerFunding) -> SharedData {
    shared.set_funding_state(
        ids.channel_id,
        FundingType::Indirect {
            ledger_id: ids.ledger_id,
        },
    )
}
