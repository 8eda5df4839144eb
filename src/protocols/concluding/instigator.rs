use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::{
    concludable, concluding_action, instigated_commitment, start_defunding, Defunded,
    FailureReason,
};
use crate::{
    actions::{ConcludingAction, WalletAction},
    commitment::CommitmentType,
    outbox::RelayPayload,
    protocols::{
        defunding::{self, DefundingState},
        received_commitment, with, ProcessId, ProtocolStateWithSharedData,
    },
    shared_data::SharedData,
    types::ChannelId,
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum InstigatorState {
    ApproveConcluding {
        process_id: ProcessId,
        channel_id: ChannelId,
    },
    WaitForOpponentConclude {
        process_id: ProcessId,
        channel_id: ChannelId,
    },
    AcknowledgeConcludeReceived {
        process_id: ProcessId,
        channel_id: ChannelId,
    },
    WaitForDefund {
        process_id: ProcessId,
        channel_id: ChannelId,
        defunding: DefundingState,
    },
    AcknowledgeSuccess {
        process_id: ProcessId,
        channel_id: ChannelId,
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

use InstigatorState::*;

impl InstigatorState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Success { .. } | Failure { .. })
    }

    pub fn awaiting_user(&self) -> bool {
        match self {
            ApproveConcluding { .. }
            | AcknowledgeConcludeReceived { .. }
            | AcknowledgeSuccess { .. }
            | AcknowledgeFailure { .. } => true,
            WaitForDefund { defunding, .. } => defunding.awaiting_user(),
            WaitForOpponentConclude { .. } | Success { .. } | Failure { .. } => false,
        }
    }

    /// Nothing was signed yet, so the opponent's own conclude attempt takes
    /// over.
    pub fn superseded_by_opponent(&self) -> bool {
        matches!(
            self,
            ApproveConcluding { .. }
                | AcknowledgeFailure {
                    reason: FailureReason::NotYourTurn,
                    ..
                }
        )
    }
}

type Result = ProtocolStateWithSharedData<InstigatorState>;

fn acknowledge_failure(
    process_id: ProcessId,
    channel_id: ChannelId,
    reason: FailureReason,
    shared: SharedData,
) -> Result {
    debug!(%process_id, %reason, "concluding failed");
    with(
        AcknowledgeFailure {
            process_id,
            channel_id,
            reason,
        },
        shared,
    )
}

pub fn initialize(shared: SharedData, process_id: ProcessId, channel_id: ChannelId) -> Result {
    let reason = match concludable(&shared, channel_id) {
        Err(reason) => Some(reason),
        Ok(channel) if !channel.our_turn() => Some(FailureReason::NotYourTurn),
        Ok(_) => None,
    };
    match reason {
        Some(reason) => acknowledge_failure(process_id, channel_id, reason, shared),
        None => with(
            ApproveConcluding {
                process_id,
                channel_id,
            },
            shared,
        ),
    }
}

pub fn reducer(state: InstigatorState, shared: SharedData, action: &WalletAction) -> Result {
    match state {
        ApproveConcluding {
            process_id,
            channel_id,
        } => match concluding_action(action) {
            Some(ConcludingAction::ConcludeApproved) => conclude(shared, process_id, channel_id),
            Some(ConcludingAction::ConcludeCancelled) => with(
                Failure {
                    process_id,
                    reason: FailureReason::ConcludeCancelled,
                },
                shared,
            ),
            _ => with(
                ApproveConcluding {
                    process_id,
                    channel_id,
                },
                shared,
            ),
        },
        WaitForOpponentConclude {
            process_id,
            channel_id,
        } => {
            let signed = match received_commitment(action).or_else(|| instigated_commitment(action)) {
                Some(signed)
                    if signed.commitment.channel_id() == channel_id
                        && signed.commitment.commitment_type == CommitmentType::Conclude =>
                {
                    signed
                }
                _ => {
                    return with(
                        WaitForOpponentConclude {
                            process_id,
                            channel_id,
                        },
                        shared,
                    )
                }
            };
            match shared.check_and_store(signed.clone()) {
                Ok(shared) => {
                    info!(%process_id, "opponent concluded");
                    with(
                        AcknowledgeConcludeReceived {
                            process_id,
                            channel_id,
                        },
                        shared,
                    )
                }
                Err(e) => {
                    warn!(%process_id, error = %e, "invalid conclude commitment");
                    acknowledge_failure(process_id, channel_id, FailureReason::InvalidCommitment, shared)
                }
            }
        }
        AcknowledgeConcludeReceived {
            process_id,
            channel_id,
        } => match concluding_action(action) {
            Some(ConcludingAction::DefundChosen) => {
                let res = start_defunding(shared, process_id.clone(), channel_id);
                after_defunding(process_id, channel_id, res)
            }
            _ => with(
                AcknowledgeConcludeReceived {
                    process_id,
                    channel_id,
                },
                shared,
            ),
        },
        WaitForDefund {
            process_id,
            channel_id,
            defunding,
        } => {
            let res = defunding::reducer(defunding, shared, action).map(super::defunded);
            after_defunding(process_id, channel_id, res)
        }
        AcknowledgeSuccess {
            process_id,
            channel_id,
        } => match concluding_action(action) {
            Some(ConcludingAction::AcknowledgeSuccess) => with(
                Success {
                    process_id,
                    channel_id,
                },
                shared,
            ),
            _ => with(
                AcknowledgeSuccess {
                    process_id,
                    channel_id,
                },
                shared,
            ),
        },
        AcknowledgeFailure {
            process_id,
            channel_id,
            reason,
        } => match concluding_action(action) {
            Some(ConcludingAction::AcknowledgeFailure) => with(Failure { process_id, reason }, shared),
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

/// Sign our Conclude commitment and hand it to the opponent, whose wallet
/// starts a responder for it.
fn conclude(shared: SharedData, process_id: ProcessId, channel_id: ChannelId) -> Result {
    let next = match shared.get_channel(channel_id) {
        Some(channel) => channel.last().conclude(),
        None => {
            return acknowledge_failure(process_id, channel_id, FailureReason::ChannelDoesntExist, shared)
        }
    };
    match shared.sign_and_store(next) {
        Ok((shared, signed_commitment)) => {
            info!(%process_id, turn_num = signed_commitment.commitment.turn_num, "concluding");
            let shared = shared.send_to_others(
                channel_id,
                &process_id,
                RelayPayload::ConcludeInstigated { signed_commitment },
            );
            with(
                WaitForOpponentConclude {
                    process_id,
                    channel_id,
                },
                shared,
            )
        }
        Err(e) => {
            warn!(%process_id, error = %e, "could not sign conclude commitment");
            acknowledge_failure(process_id, channel_id, FailureReason::from(&e), shared)
        }
    }
}

fn after_defunding(
    process_id: ProcessId,
    channel_id: ChannelId,
    res: ProtocolStateWithSharedData<Defunded>,
) -> Result {
    match res.protocol_state {
        Defunded::Pending(defunding) => with(
            WaitForDefund {
                process_id,
                channel_id,
                defunding,
            },
            res.shared_data,
        ),
        Defunded::Done => with(
            AcknowledgeSuccess {
                process_id,
                channel_id,
            },
            res.shared_data,
        ),
        Defunded::Failed => {
            acknowledge_failure(process_id, channel_id, FailureReason::DefundFailed, res.shared_data)
        }
    }
}
