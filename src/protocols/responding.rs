//! Answering a challenge raised against us.
//!
//! Depending on what the store holds we refute (a later commitment by the
//! challenger), respond with a commitment we already signed, or ask the
//! application for a new commitment to respond with.

use core::fmt;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::{
    chain_event, transaction_submission as ts, user_action, with, ProcessId,
    ProtocolStateWithSharedData,
};
use crate::{
    actions::{ChainEvent, ResponderAction, UserAction, WalletAction},
    channel_store::{ChannelStage, ChannelState},
    commitment::{Commitment, SignedCommitment},
    shared_data::SharedData,
    transactions::TransactionRequest,
    types::ChannelId,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureReason {
    ChannelDoesntExist,
    UserRejected,
    TransactionFailed,
    TimedOut,
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::ChannelDoesntExist => f.write_str("Channel does not exist"),
            FailureReason::UserRejected => f.write_str("User rejected the response"),
            FailureReason::TransactionFailed => f.write_str("Response transaction failed"),
            FailureReason::TimedOut => f.write_str("Challenge timed out"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Responding {
    pub process_id: ProcessId,
    pub channel_id: ChannelId,
    pub challenge_commitment: Commitment,
    pub expiry: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResponderState {
    WaitForApproval {
        responding: Responding,
    },
    WaitForResponse {
        responding: Responding,
    },
    WaitForTransaction {
        responding: Responding,
        transaction_submission: ts::TransactionSubmissionState,
    },
    WaitForAcknowledgement {
        responding: Responding,
    },
    AcknowledgeTimeout {
        responding: Responding,
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

use ResponderState::*;

impl ResponderState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Success { .. } | Failure { .. })
    }

    pub fn awaiting_user(&self) -> bool {
        match self {
            WaitForApproval { .. }
            | WaitForResponse { .. }
            | WaitForAcknowledgement { .. }
            | AcknowledgeTimeout { .. } => true,
            WaitForTransaction {
                transaction_submission,
                ..
            } => transaction_submission.awaiting_user(),
            Success { .. } | Failure { .. } => false,
        }
    }
}

type Result = ProtocolStateWithSharedData<ResponderState>;

fn failure(responding: Responding, reason: FailureReason, shared: SharedData) -> Result {
    with(
        Failure {
            process_id: responding.process_id,
            reason,
        },
        shared,
    )
}

pub fn initialize(
    shared: SharedData,
    process_id: ProcessId,
    channel_id: ChannelId,
    challenge: SignedCommitment,
    expiry: u64,
) -> Result {
    let turn_num = match shared.get_channel(channel_id) {
        Some(channel) => channel.turn_num,
        None => {
            return with(
                Failure {
                    process_id,
                    reason: FailureReason::ChannelDoesntExist,
                },
                shared,
            )
        }
    };
    info!(%process_id, ?channel_id, turn_num = challenge.commitment.turn_num, expiry, "challenged");

    // Our response has to follow the challenge, so a challenge we have not
    // seen yet becomes our latest state.
    let shared = if challenge.commitment.turn_num > turn_num {
        match shared.check_and_store(challenge.clone()) {
            Ok(shared) => shared,
            Err(e) => {
                warn!(%process_id, error = %e, "could not store challenge commitment");
                shared
            }
        }
    } else {
        shared
    };
    let shared = shared.set_stage(channel_id, ChannelStage::Responding);
    with(
        WaitForApproval {
            responding: Responding {
                process_id,
                channel_id,
                challenge_commitment: challenge.commitment,
                expiry,
            },
        },
        shared,
    )
}

pub fn reducer(state: ResponderState, shared: SharedData, action: &WalletAction) -> Result {
    match state {
        WaitForApproval { responding } => {
            if timed_out(&responding, action) {
                return with(AcknowledgeTimeout { responding }, shared);
            }
            match responder_action(action) {
                Some(ResponderAction::RespondApproved) => respond(responding, shared),
                Some(ResponderAction::RespondRejected) => {
                    failure(responding, FailureReason::UserRejected, shared)
                }
                _ => with(WaitForApproval { responding }, shared),
            }
        }
        WaitForResponse { responding } => {
            if timed_out(&responding, action) {
                return with(AcknowledgeTimeout { responding }, shared);
            }
            let commitment = match responder_action(action) {
                Some(ResponderAction::ResponseProvided { commitment }) => commitment.clone(),
                _ => return with(WaitForResponse { responding }, shared),
            };
            match shared.sign_and_store(commitment) {
                Ok((shared, response)) => {
                    submit(responding, shared, TransactionRequest::RespondWithMove { response })
                }
                Err(e) => {
                    warn!(process_id = %responding.process_id, error = %e, "cannot respond with provided commitment");
                    with(WaitForResponse { responding }, shared)
                }
            }
        }
        WaitForTransaction {
            responding,
            transaction_submission,
        } => {
            let res = ts::reducer(transaction_submission, shared, action);
            after_transaction(responding, res)
        }
        WaitForAcknowledgement { responding } => match responder_action(action) {
            Some(ResponderAction::SuccessAcknowledged) => {
                let shared = shared.set_stage(responding.channel_id, ChannelStage::Running);
                with(
                    Success {
                        process_id: responding.process_id,
                        channel_id: responding.channel_id,
                    },
                    shared,
                )
            }
            _ => with(WaitForAcknowledgement { responding }, shared),
        },
        AcknowledgeTimeout { responding } => match responder_action(action) {
            Some(ResponderAction::TimeoutAcknowledged) => {
                let shared = shared
                    .update_adjudicator(responding.channel_id, |a| a.finalized = true)
                    .set_stage(responding.channel_id, ChannelStage::Closing);
                failure(responding, FailureReason::TimedOut, shared)
            }
            _ => with(AcknowledgeTimeout { responding }, shared),
        },
        state @ (Success { .. } | Failure { .. }) => with(state, shared),
    }
}

fn responder_action(action: &WalletAction) -> Option<&ResponderAction> {
    match user_action(action) {
        Some(UserAction::Responder(action)) => Some(action),
        _ => None,
    }
}

fn timed_out(responding: &Responding, action: &WalletAction) -> bool {
    matches!(
        chain_event(action),
        Some(ChainEvent::BlockMined { timestamp }) if *timestamp >= responding.expiry
    )
}

/// Refute, respond with a stored commitment, or wait for a new one.
fn respond(responding: Responding, shared: SharedData) -> Result {
    let request = shared
        .get_channel(responding.channel_id)
        .and_then(|channel| stored_answer(channel, &responding.challenge_commitment));
    match request {
        Some(request) => {
            debug!(process_id = %responding.process_id, ?request, "answering challenge from store");
            submit(responding, shared, request)
        }
        None => with(WaitForResponse { responding }, shared),
    }
}

fn stored_answer(channel: &ChannelState, challenge: &Commitment) -> Option<TransactionRequest> {
    let challenger = challenge.mover()?;
    let commitments = channel.commitments();
    if let Some(refutation) = commitments.iter().find(|s| {
        s.commitment.turn_num > challenge.turn_num && s.commitment.mover() == Some(challenger)
    }) {
        return Some(TransactionRequest::Refute {
            refutation: refutation.clone(),
        });
    }
    commitments
        .into_iter()
        .find(|s| Some(s.commitment.turn_num) == challenge.turn_num.checked_add(1))
        .map(|response| TransactionRequest::RespondWithMove { response })
}

fn submit(responding: Responding, shared: SharedData, request: TransactionRequest) -> Result {
    let res = ts::initialize(shared, responding.process_id.clone(), request);
    after_transaction(responding, res)
}

fn after_transaction(
    responding: Responding,
    res: ProtocolStateWithSharedData<ts::TransactionSubmissionState>,
) -> Result {
    match res.protocol_state {
        ts::TransactionSubmissionState::Success { .. } => {
            with(WaitForAcknowledgement { responding }, res.shared_data)
        }
        ts::TransactionSubmissionState::Failure { .. } => {
            failure(responding, FailureReason::TransactionFailed, res.shared_data)
        }
        transaction_submission => with(
            WaitForTransaction {
                responding,
                transaction_submission,
            },
            res.shared_data,
        ),
    }
}
