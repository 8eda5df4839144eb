//! Forcing an unresponsive opponent to move, through the adjudicator.
//!
//! The challenge is a force-move transaction carrying our two most recent
//! commitments. Once it is on chain the opponent either responds with a
//! later commitment, or the challenge times out and the channel finalizes.

use core::fmt;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::{
    chain_event, transaction_action, transaction_submission as ts, user_action, with, ProcessId,
    ProtocolStateWithSharedData,
};
use crate::{
    actions::{ChainEvent, ChallengerAction, TransactionAction, UserAction, WalletAction},
    channel_store::ChannelStage,
    config::WalletConfig,
    shared_data::SharedData,
    transactions::TransactionRequest,
    types::ChannelId,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureReason {
    ChannelDoesntExist,
    NotFullyOpen,
    AlreadyHaveLatest,
    DeclinedByUser,
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::ChannelDoesntExist => f.write_str("Channel does not exist"),
            FailureReason::NotFullyOpen => f.write_str("Channel is not fully open"),
            FailureReason::AlreadyHaveLatest => f.write_str("Already have the latest commitment"),
            FailureReason::DeclinedByUser => f.write_str("Challenge declined"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Challenge {
    pub process_id: ProcessId,
    pub channel_id: ChannelId,
    pub request: TransactionRequest,
    /// Taken from the adjudicator's `ChallengeCreated` event once seen.
    pub expiry: Option<u64>,
    /// Used to estimate the expiry until the event is seen.
    pub challenge_duration: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChallengerState {
    ApproveChallenge {
        process_id: ProcessId,
        channel_id: ChannelId,
        challenge_duration: u64,
    },
    WaitForChallengeInitiation {
        challenge: Challenge,
        transaction_submission: ts::TransactionSubmissionState,
    },
    WaitForChallengeSubmission {
        challenge: Challenge,
        transaction_submission: ts::TransactionSubmissionState,
    },
    WaitForChallengeConfirmation {
        challenge: Challenge,
        transaction_submission: ts::TransactionSubmissionState,
    },
    /// Only an explicit retry leaves this state.
    ChallengeTransactionFailed {
        challenge: Challenge,
    },
    WaitForResponseOrTimeout {
        challenge: Challenge,
        expiry: u64,
    },
    AcknowledgeChallengeResponse {
        challenge: Challenge,
    },
    AcknowledgeChallengeTimeout {
        challenge: Challenge,
    },
    AcknowledgeFailure {
        process_id: ProcessId,
        channel_id: ChannelId,
        reason: FailureReason,
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

use ChallengerState::*;

impl ChallengerState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Success { .. } | Failure { .. })
    }

    pub fn awaiting_user(&self) -> bool {
        match self {
            ApproveChallenge { .. }
            | ChallengeTransactionFailed { .. }
            | AcknowledgeChallengeResponse { .. }
            | AcknowledgeChallengeTimeout { .. }
            | AcknowledgeFailure { .. } => true,
            WaitForChallengeInitiation {
                transaction_submission,
                ..
            }
            | WaitForChallengeSubmission {
                transaction_submission,
                ..
            }
            | WaitForChallengeConfirmation {
                transaction_submission,
                ..
            } => transaction_submission.awaiting_user(),
            WaitForResponseOrTimeout { .. } | Success { .. } | Failure { .. } => false,
        }
    }
}

type Result = ProtocolStateWithSharedData<ChallengerState>;

pub fn initialize(
    shared: SharedData,
    config: &WalletConfig,
    process_id: ProcessId,
    channel_id: ChannelId,
) -> Result {
    let reason = match shared.get_channel(channel_id) {
        None => Some(FailureReason::ChannelDoesntExist),
        Some(c) if !c.is_fully_open() => Some(FailureReason::NotFullyOpen),
        // The opponent already moved, there is nothing to force.
        Some(c) if c.our_turn() => Some(FailureReason::AlreadyHaveLatest),
        Some(_) => None,
    };
    match reason {
        Some(reason) => {
            debug!(%process_id, %reason, "cannot challenge");
            with(
                AcknowledgeFailure {
                    process_id,
                    channel_id,
                    reason,
                },
                shared,
            )
        }
        None => with(
            ApproveChallenge {
                process_id,
                channel_id,
                challenge_duration: config.challenge_duration,
            },
            shared,
        ),
    }
}

pub fn reducer(state: ChallengerState, shared: SharedData, action: &WalletAction) -> Result {
    match state {
        ApproveChallenge {
            process_id,
            channel_id,
            challenge_duration,
        } => match challenger_action(action) {
            Some(ChallengerAction::ChallengeApproved) => {
                let request = match force_move(&shared, channel_id) {
                    Some(request) => request,
                    None => {
                        return with(
                            AcknowledgeFailure {
                                process_id,
                                channel_id,
                                reason: FailureReason::NotFullyOpen,
                            },
                            shared,
                        )
                    }
                };
                info!(%process_id, ?channel_id, "challenging");
                let shared = shared.set_stage(channel_id, ChannelStage::Challenging);
                submit(
                    Challenge {
                        process_id,
                        channel_id,
                        request,
                        expiry: None,
                        challenge_duration,
                    },
                    shared,
                )
            }
            Some(ChallengerAction::ChallengeDenied) => with(
                AcknowledgeFailure {
                    process_id,
                    channel_id,
                    reason: FailureReason::DeclinedByUser,
                },
                shared,
            ),
            _ => with(
                ApproveChallenge {
                    process_id,
                    channel_id,
                    challenge_duration,
                },
                shared,
            ),
        },
        WaitForChallengeInitiation {
            challenge,
            transaction_submission,
        }
        | WaitForChallengeSubmission {
            challenge,
            transaction_submission,
        }
        | WaitForChallengeConfirmation {
            challenge,
            transaction_submission,
        } => {
            let challenge = observe_challenge(challenge, action);
            let res = ts::reducer(transaction_submission, shared, action);
            after_transaction(challenge, res)
        }
        ChallengeTransactionFailed { challenge } => {
            let challenge = observe_challenge(challenge, action);
            match transaction_action(action) {
                Some(TransactionAction::RetryApproved) => {
                    debug!(process_id = %challenge.process_id, "retrying challenge");
                    submit(challenge, shared)
                }
                _ => with(ChallengeTransactionFailed { challenge }, shared),
            }
        }
        WaitForResponseOrTimeout { challenge, expiry } => {
            let challenge = observe_challenge(challenge, action);
            let expiry = challenge.expiry.unwrap_or(expiry);
            match chain_event(action) {
                Some(ChainEvent::BlockMined { timestamp }) if *timestamp >= expiry => {
                    info!(process_id = %challenge.process_id, "challenge timed out");
                    with(AcknowledgeChallengeTimeout { challenge }, shared)
                }
                Some(ChainEvent::RespondWithMove {
                    channel_id,
                    response,
                }) if *channel_id == challenge.channel_id => {
                    match shared.check_and_store(response.clone()) {
                        Ok(shared) => {
                            info!(process_id = %challenge.process_id, "challenge answered");
                            with(AcknowledgeChallengeResponse { challenge }, shared)
                        }
                        Err(e) => {
                            warn!(process_id = %challenge.process_id, error = %e, "ignoring invalid response");
                            with(WaitForResponseOrTimeout { challenge, expiry }, shared)
                        }
                    }
                }
                _ => with(WaitForResponseOrTimeout { challenge, expiry }, shared),
            }
        }
        AcknowledgeChallengeResponse { challenge } => match challenger_action(action) {
            Some(ChallengerAction::ResponseAcknowledged) => {
                let shared = shared.set_stage(challenge.channel_id, ChannelStage::Running);
                with(
                    Success {
                        process_id: challenge.process_id,
                        channel_id: challenge.channel_id,
                    },
                    shared,
                )
            }
            _ => with(AcknowledgeChallengeResponse { challenge }, shared),
        },
        AcknowledgeChallengeTimeout { challenge } => match challenger_action(action) {
            Some(ChallengerAction::TimeoutAcknowledged) => {
                let shared = shared
                    .update_adjudicator(challenge.channel_id, |a| a.finalized = true)
                    .set_stage(challenge.channel_id, ChannelStage::Closing);
                with(
                    Success {
                        process_id: challenge.process_id,
                        channel_id: challenge.channel_id,
                    },
                    shared,
                )
            }
            _ => with(AcknowledgeChallengeTimeout { challenge }, shared),
        },
        AcknowledgeFailure {
            process_id,
            channel_id,
            reason,
        } => match challenger_action(action) {
            Some(ChallengerAction::FailureAcknowledged) => {
                with(Failure { process_id, reason }, shared)
            }
            _ => with(
                AcknowledgeFailure {
                    process_id,
                    channel_id,
                    reason,
                },
                shared,
            ),
        },
        state @ (Success { .. } | Failure { .. }) => with(state, shared),
    }
}

fn challenger_action(action: &WalletAction) -> Option<ChallengerAction> {
    match user_action(action) {
        Some(UserAction::Challenger(action)) => Some(*action),
        _ => None,
    }
}

fn force_move(shared: &SharedData, channel_id: ChannelId) -> Option<TransactionRequest> {
    let channel = shared.get_channel(channel_id)?;
    Some(TransactionRequest::ForceMove {
        from: channel.penultimate_commitment.clone()?,
        to: channel.last_commitment.clone(),
    })
}

/// Record the expiry of our challenge when the adjudicator reports it.
fn observe_challenge(challenge: Challenge, action: &WalletAction) -> Challenge {
    match chain_event(action) {
        Some(ChainEvent::ChallengeCreated {
            channel_id,
            finalized_at,
            ..
        }) if *channel_id == challenge.channel_id => Challenge {
            expiry: Some(*finalized_at),
            ..challenge
        },
        _ => challenge,
    }
}

fn submit(challenge: Challenge, shared: SharedData) -> Result {
    let res = ts::initialize(shared, challenge.process_id.clone(), challenge.request.clone());
    after_transaction(challenge, res)
}

fn after_transaction(
    challenge: Challenge,
    res: ProtocolStateWithSharedData<ts::TransactionSubmissionState>,
) -> Result {
    let shared = res.shared_data;
    match res.protocol_state {
        ts::TransactionSubmissionState::Success { .. } => {
            let expiry = challenge.expiry.unwrap_or_else(|| {
                shared
                    .adjudicator(challenge.channel_id)
                    .challenge
                    .map(|c| c.expires_at)
                    .unwrap_or(shared.block_timestamp.saturating_add(challenge.challenge_duration))
            });
            debug!(process_id = %challenge.process_id, expiry, "challenge submitted");
            with(WaitForResponseOrTimeout { challenge, expiry }, shared)
        }
        ts::TransactionSubmissionState::ApproveRetry(_)
        | ts::TransactionSubmissionState::Failure { .. } => {
            warn!(process_id = %challenge.process_id, "challenge transaction failed");
            with(ChallengeTransactionFailed { challenge }, shared)
        }
        transaction_submission @ ts::TransactionSubmissionState::WaitForSend(_) => with(
            WaitForChallengeInitiation {
                challenge,
                transaction_submission,
            },
            shared,
        ),
        transaction_submission @ ts::TransactionSubmissionState::WaitForSubmission(_) => with(
            WaitForChallengeSubmission {
                challenge,
                transaction_submission,
            },
            shared,
        ),
        transaction_submission @ ts::TransactionSubmissionState::WaitForConfirmation { .. } => {
            with(
                WaitForChallengeConfirmation {
                    challenge,
                    transaction_submission,
                },
                shared,
            )
        }
    }
}
