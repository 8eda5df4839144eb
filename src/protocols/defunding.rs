//! Defunding a concluded channel, the way it was funded.

use core::fmt;

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{
    indirect_defunding::{self, IndirectDefundingState},
    with,
    withdrawal::{self, WithdrawalState},
    ProcessId, ProtocolStateWithSharedData,
};
use crate::{
    actions::WalletAction,
    shared_data::{FundingType, SharedData},
    types::ChannelId,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureReason {
    ChannelNotFunded,
    WithdrawalFailed,
    IndirectDefundingFailed,
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::ChannelNotFunded => f.write_str("Channel is not funded"),
            FailureReason::WithdrawalFailed => f.write_str("Withdrawal failed"),
            FailureReason::IndirectDefundingFailed => f.write_str("Ledger defunding failed"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DefundingState {
    WaitForWithdrawal {
        process_id: ProcessId,
        channel_id: ChannelId,
        withdrawal: WithdrawalState,
    },
    WaitForIndirectDefunding {
        process_id: ProcessId,
        channel_id: ChannelId,
        indirect_defunding: IndirectDefundingState,
    },
    Success {
        process_id: ProcessId,
        channel_id: ChannelId,
    },
    Failure {
        process_id: ProcessId,
        reason: FailureReason,
    },
}

use DefundingState::*;

impl DefundingState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Success { .. } | Failure { .. })
    }

    /// Ledger defunding runs without user input.
    pub fn awaiting_user(&self) -> bool {
        match self {
            WaitForWithdrawal { withdrawal, .. } => withdrawal.awaiting_user(),
            _ => false,
        }
    }
}

type Result = ProtocolStateWithSharedData<DefundingState>;

pub fn initialize(shared: SharedData, process_id: ProcessId, channel_id: ChannelId) -> Result {
    match shared.funding_type(channel_id).cloned() {
        Some(FundingType::Direct) => {
            debug!(%process_id, "defunding by withdrawal");
            let res = withdrawal::initialize(shared, process_id.clone(), channel_id);
            after_withdrawal(process_id, channel_id, res)
        }
        Some(FundingType::Indirect { ledger_id }) => {
            debug!(%process_id, ?ledger_id, "defunding through ledger");
            let res = indirect_defunding::initialize(shared, process_id.clone(), channel_id, ledger_id);
            after_indirect_defunding(process_id, channel_id, res)
        }
        None => with(
            Failure {
                process_id,
                reason: FailureReason::ChannelNotFunded,
            },
            shared,
        ),
    }
}

pub fn reducer(state: DefundingState, shared: SharedData, action: &WalletAction) -> Result {
    match state {
        WaitForWithdrawal {
            process_id,
            channel_id,
            withdrawal,
        } => {
            let res = withdrawal::reducer(withdrawal, shared, action);
            after_withdrawal(process_id, channel_id, res)
        }
        WaitForIndirectDefunding {
            process_id,
            channel_id,
            indirect_defunding,
        } => {
            let res = indirect_defunding::reducer(indirect_defunding, shared, action);
            after_indirect_defunding(process_id, channel_id, res)
        }
        state @ (Success { .. } | Failure { .. }) => with(state, shared),
    }
}

fn after_withdrawal(
    process_id: ProcessId,
    channel_id: ChannelId,
    res: ProtocolStateWithSharedData<WithdrawalState>,
) -> Result {
    let state = match res.protocol_state {
        WithdrawalState::Success { .. } => Success {
            process_id,
            channel_id,
        },
        WithdrawalState::Failure { .. } => Failure {
            process_id,
            reason: FailureReason::WithdrawalFailed,
        },
        withdrawal => WaitForWithdrawal {
            process_id,
            channel_id,
            withdrawal,
        },
    };
    with(state, res.shared_data)
}

fn after_indirect_defunding(
    process_id: ProcessId,
    channel_id: ChannelId,
    res: ProtocolStateWithSharedData<IndirectDefundingState>,
) -> Result {
    let state = match res.protocol_state {
        IndirectDefundingState::Success { .. } => Success {
            process_id,
            channel_id,
        },
        IndirectDefundingState::Failure { .. } => Failure {
            process_id,
            reason: FailureReason::IndirectDefundingFailed,
        },
        indirect_defunding => WaitForIndirectDefunding {
            process_id,
            channel_id,
            indirect_defunding,
        },
    };
    with(state, res.shared_data)
}
