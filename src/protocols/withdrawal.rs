//! Paying out our share of a closed, directly funded channel.

use core::fmt;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::{transaction_submission as ts, user_action, with, ProcessId, ProtocolStateWithSharedData};
use crate::{
    actions::{UserAction, WalletAction, WithdrawalAction},
    channel_store::{ChannelStage, ChannelState},
    shared_data::SharedData,
    transactions::{SignedWithdrawalAuth, TransactionRequest, WithdrawalAuth},
    types::{Address, ChannelId, U256},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureReason {
    ChannelNotClosed,
    UserRejected,
    SigningFailed,
    TransactionFailed,
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::ChannelNotClosed => f.write_str("Channel is not closed"),
            FailureReason::UserRejected => f.write_str("User rejected the withdrawal"),
            FailureReason::SigningFailed => f.write_str("Could not sign the withdrawal"),
            FailureReason::TransactionFailed => f.write_str("Withdrawal transaction failed"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Withdrawal {
    pub process_id: ProcessId,
    pub channel_id: ChannelId,
    pub amount: U256,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum WithdrawalState {
    WaitForApproval {
        withdrawal: Withdrawal,
    },
    WaitForTransaction {
        withdrawal: Withdrawal,
        transaction_submission: ts::TransactionSubmissionState,
    },
    WaitForAcknowledgement {
        withdrawal: Withdrawal,
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

use WithdrawalState::*;

impl WithdrawalState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Success { .. } | Failure { .. })
    }

    pub fn awaiting_user(&self) -> bool {
        match self {
            WaitForApproval { .. } | WaitForAcknowledgement { .. } => true,
            WaitForTransaction {
                transaction_submission,
                ..
            } => transaction_submission.awaiting_user(),
            Success { .. } | Failure { .. } => false,
        }
    }
}

type Result = ProtocolStateWithSharedData<WithdrawalState>;

fn failure(withdrawal: Withdrawal, reason: FailureReason, shared: SharedData) -> Result {
    with(
        Failure {
            process_id: withdrawal.process_id,
            reason,
        },
        shared,
    )
}

pub fn initialize(shared: SharedData, process_id: ProcessId, channel_id: ChannelId) -> Result {
    let amount = match shared.get_channel(channel_id) {
        Some(channel) if channel.is_closed() => channel.last().amount_for(channel.address),
        _ => {
            return with(
                Failure {
                    process_id,
                    reason: FailureReason::ChannelNotClosed,
                },
                shared,
            )
        }
    };
    with(
        WaitForApproval {
            withdrawal: Withdrawal {
                process_id,
                channel_id,
                amount,
            },
        },
        shared,
    )
}

pub fn reducer(state: WithdrawalState, shared: SharedData, action: &WalletAction) -> Result {
    match state {
        WaitForApproval { withdrawal } => match withdrawal_action(action) {
            Some(WithdrawalAction::WithdrawalApproved { destination }) => {
                let request = shared
                    .get_channel(withdrawal.channel_id)
                    .and_then(|channel| withdrawal_request(channel, *destination, withdrawal.amount));
                let request = match request {
                    Some(request) => request,
                    None => {
                        warn!(process_id = %withdrawal.process_id, "could not authorize withdrawal");
                        return failure(withdrawal, FailureReason::SigningFailed, shared);
                    }
                };
                info!(process_id = %withdrawal.process_id, amount = %withdrawal.amount, ?destination, "withdrawing");
                let shared = shared.set_stage(withdrawal.channel_id, ChannelStage::Withdrawing);
                let res = ts::initialize(shared, withdrawal.process_id.clone(), request);
                after_transaction(withdrawal, res)
            }
            Some(WithdrawalAction::WithdrawalRejected) => {
                failure(withdrawal, FailureReason::UserRejected, shared)
            }
            _ => with(WaitForApproval { withdrawal }, shared),
        },
        WaitForTransaction {
            withdrawal,
            transaction_submission,
        } => {
            let res = ts::reducer(transaction_submission, shared, action);
            after_transaction(withdrawal, res)
        }
        WaitForAcknowledgement { withdrawal } => match withdrawal_action(action) {
            Some(WithdrawalAction::SuccessAcknowledged) => with(
                Success {
                    process_id: withdrawal.process_id,
                    channel_id: withdrawal.channel_id,
                },
                shared,
            ),
            _ => with(WaitForAcknowledgement { withdrawal }, shared),
        },
        state @ (Success { .. } | Failure { .. }) => with(state, shared),
    }
}

fn withdrawal_action(action: &WalletAction) -> Option<&WithdrawalAction> {
    match user_action(action) {
        Some(UserAction::Withdrawal(action)) => Some(action),
        _ => None,
    }
}

/// With nothing to pay out the channel is only concluded on chain.
fn withdrawal_request(
    channel: &ChannelState,
    destination: Address,
    amount: U256,
) -> Option<TransactionRequest> {
    let from = channel.penultimate_commitment.clone()?;
    let to = channel.last_commitment.clone();
    if amount.is_zero() {
        return Some(TransactionRequest::Conclude { from, to });
    }
    // The destination account submits its own withdrawal.
    let auth = WithdrawalAuth {
        participant: channel.address,
        destination,
        amount,
        sender: destination,
    };
    let authorization = SignedWithdrawalAuth::sign(auth, &channel.signer().ok()?).ok()?;
    Some(TransactionRequest::ConcludeAndWithdraw {
        from,
        to,
        authorization,
    })
}

fn after_transaction(
    withdrawal: Withdrawal,
    res: ProtocolStateWithSharedData<ts::TransactionSubmissionState>,
) -> Result {
    match res.protocol_state {
        ts::TransactionSubmissionState::Success { .. } => {
            with(WaitForAcknowledgement { withdrawal }, res.shared_data)
        }
        ts::TransactionSubmissionState::Failure { .. } => {
            failure(withdrawal, FailureReason::TransactionFailed, res.shared_data)
        }
        transaction_submission => with(
            WaitForTransaction {
                withdrawal,
                transaction_submission,
            },
            res.shared_data,
        ),
    }
}
