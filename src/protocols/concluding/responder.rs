use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::{concludable, concluding_action, start_defunding, Defunded, FailureReason};
use crate::{
    actions::{ConcludingAction, WalletAction},
    commitment::{CommitmentType, SignedCommitment},
    protocols::{
        defunding::{self, DefundingState},
        with, ProcessId, ProtocolStateWithSharedData,
    },
    shared_data::SharedData,
    types::ChannelId,
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResponderState {
    ApproveConcluding {
        process_id: ProcessId,
        channel_id: ChannelId,
    },
    DecideDefund {
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

use ResponderState::*;

impl ResponderState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Success { .. } | Failure { .. })
    }

    pub fn awaiting_user(&self) -> bool {
        match self {
            ApproveConcluding { .. }
            | DecideDefund { .. }
            | AcknowledgeSuccess { .. }
            | AcknowledgeFailure { .. } => true,
            WaitForDefund { defunding, .. } => defunding.awaiting_user(),
            Success { .. } | Failure { .. } => false,
        }
    }
}

type Result = ProtocolStateWithSharedData<ResponderState>;

fn acknowledge_failure(
    process_id: ProcessId,
    channel_id: ChannelId,
    reason: FailureReason,
    shared: SharedData,
) -> Result {
    debug!(%process_id, %reason, "cannot respond to conclude");
    with(
        AcknowledgeFailure {
            process_id,
            channel_id,
            reason,
        },
        shared,
    )
}

/// Start from the opponent's Conclude commitment. It is only stored once we
/// know it leaves the next move to us.
pub fn initialize(shared: SharedData, process_id: ProcessId, signed: SignedCommitment) -> Result {
    let channel_id = signed.commitment.channel_id();
    let our_index = match concludable(&shared, channel_id) {
        Ok(channel) => channel.our_index,
        Err(reason) => return acknowledge_failure(process_id, channel_id, reason, shared),
    };
    let commitment = &signed.commitment;
    let n = commitment.num_participants() as u64;
    let next = commitment.turn_num.checked_add(1);
    if n == 0 || next.map_or(true, |next| (next % n) as usize != our_index) {
        return acknowledge_failure(process_id, channel_id, FailureReason::NotYourTurn, shared);
    }
    if commitment.commitment_type != CommitmentType::Conclude {
        return acknowledge_failure(process_id, channel_id, FailureReason::InvalidCommitment, shared);
    }
    match shared.check_and_store(signed) {
        Ok(shared) => {
            info!(%process_id, "opponent wants to conclude");
            with(
                ApproveConcluding {
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

pub fn reducer(state: ResponderState, shared: SharedData, action: &WalletAction) -> Result {
    match state {
        ApproveConcluding {
            process_id,
            channel_id,
        } => match concluding_action(action) {
            Some(ConcludingAction::ConcludeApproved) => countersign(shared, process_id, channel_id),
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
        DecideDefund {
            process_id,
            channel_id,
        } => match concluding_action(action) {
            Some(ConcludingAction::DefundChosen) => {
                let res = start_defunding(shared, process_id.clone(), channel_id);
                after_defunding(process_id, channel_id, res)
            }
            _ => with(
                DecideDefund {
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

fn countersign(shared: SharedData, process_id: ProcessId, channel_id: ChannelId) -> Result {
    let next = match shared.get_channel(channel_id) {
        Some(channel) => channel.last().conclude(),
        None => {
            return acknowledge_failure(process_id, channel_id, FailureReason::ChannelDoesntExist, shared)
        }
    };
    match shared.sign_and_store(next) {
        Ok((shared, signed)) => {
            info!(%process_id, turn_num = signed.commitment.turn_num, "conclude countersigned");
            let shared = shared.send_commitment(&process_id, signed);
            with(
                DecideDefund {
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        actions::UserAction,
        protocols::concluding::PROTOCOL,
        test_utils::{user, Fixture},
    };

    fn pid(f: &Fixture) -> ProcessId {
        ProcessId::new(PROTOCOL, f.channel.id())
    }

    fn acknowledge_failure(f: &Fixture, res: Result) -> Result {
        reducer(
            res.protocol_state,
            res.shared_data,
            &user(&pid(f), UserAction::Concluding(ConcludingAction::AcknowledgeFailure)),
        )
    }

    #[test]
    fn conclude_out_of_turn_is_refused() {
        let f = Fixture::two_party();
        let (_, b) = f.running_commitments();
        // Turn 6 leaves turn 7 to Bob, not to Alice.
        let shared = f.running_shared(0);
        let before = shared.clone();
        let res = initialize(shared, pid(&f), f.sign(b.conclude()));
        assert_eq!(
            res.protocol_state,
            AcknowledgeFailure {
                process_id: pid(&f),
                channel_id: f.channel.id(),
                reason: FailureReason::NotYourTurn,
            }
        );
        assert_eq!(res.shared_data, before);

        let res = acknowledge_failure(&f, res);
        assert_eq!(
            res.protocol_state,
            Failure {
                process_id: pid(&f),
                reason: FailureReason::NotYourTurn,
            }
        );
    }

    #[test]
    fn unknown_channel_is_refused() {
        let f = Fixture::two_party();
        let (_, b) = f.running_commitments();
        let res = initialize(SharedData::default(), pid(&f), f.sign(b.conclude()));
        let res = acknowledge_failure(&f, res);
        assert!(matches!(
            res.protocol_state,
            Failure {
                reason: FailureReason::ChannelDoesntExist,
                ..
            }
        ));
    }

    #[test]
    fn app_commitment_is_not_a_conclude() {
        let f = Fixture::two_party();
        let (_, b) = f.running_commitments();
        let res = initialize(f.running_shared(1), pid(&f), f.sign(b.next_app(vec![3])));
        assert!(matches!(
            res.protocol_state,
            AcknowledgeFailure {
                reason: FailureReason::InvalidCommitment,
                ..
            }
        ));
    }

    #[test]
    fn approval_countersigns() {
        let f = Fixture::two_party();
        let (_, b) = f.running_commitments();
        let res = initialize(f.running_shared(1), pid(&f), f.sign(b.conclude()));
        assert!(matches!(res.protocol_state, ApproveConcluding { .. }));

        let res = reducer(
            res.protocol_state,
            res.shared_data,
            &user(&pid(&f), UserAction::Concluding(ConcludingAction::ConcludeApproved)),
        );
        assert!(matches!(res.protocol_state, DecideDefund { .. }));
        let channel = res.shared_data.get_channel(f.channel.id()).unwrap();
        assert!(channel.is_closed());
        assert_eq!(channel.turn_num, 7);
        assert_eq!(res.shared_data.outbox.relays().count(), 1);
    }
}
