//! Runs one setup round (PreFundSetup or PostFundSetup) of a channel with
//! any number of participants.
//!
//! Participants sign in turn order. Whoever signs broadcasts the channel's
//! last two commitments, tagged with the protocol locator of the embedding
//! protocol, so that every participant eventually sees the whole round.

use core::fmt;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::{received_commitments, with, ProcessId, ProtocolLocator, ProtocolStateWithSharedData};
use crate::{
    actions::WalletAction,
    commitment::{Commitment, CommitmentType, SignedCommitment},
    shared_data::SharedData,
    types::{ChannelId, PrivateKey},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureReason {
    ChannelMissing,
    SigningFailed,
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::ChannelMissing => f.write_str("Channel does not exist"),
            FailureReason::SigningFailed => f.write_str("Could not sign commitment"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdvanceChannelParams {
    pub process_id: ProcessId,
    pub protocol_locator: ProtocolLocator,
    pub channel_id: ChannelId,
    /// The round being run.
    pub commitment_type: CommitmentType,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AdvanceChannelState {
    /// Waiting for the first PreFundSetup commitment of a channel we did not
    /// open ourselves.
    ChannelUnknown {
        params: AdvanceChannelParams,
        private_key: PrivateKey,
    },
    NotSafeToSend {
        params: AdvanceChannelParams,
    },
    CommitmentSent {
        params: AdvanceChannelParams,
    },
    Success {
        process_id: ProcessId,
        channel_id: ChannelId,
        commitment_type: CommitmentType,
    },
    Failure {
        process_id: ProcessId,
        reason: FailureReason,
    },
}

use AdvanceChannelState::*;

impl AdvanceChannelState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Success { .. } | Failure { .. })
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Success { .. })
    }

    fn params(&self) -> Option<&AdvanceChannelParams> {
        match self {
            ChannelUnknown { params, .. } | NotSafeToSend { params } | CommitmentSent { params } => {
                Some(params)
            }
            Success { .. } | Failure { .. } => None,
        }
    }
}

type Result = ProtocolStateWithSharedData<AdvanceChannelState>;

/// Start the PreFundSetup round of a new channel. Participant 0 opens it,
/// everybody else waits for its commitment.
pub fn initialize_pre_fund(
    shared: SharedData,
    process_id: ProcessId,
    protocol_locator: ProtocolLocator,
    genesis: Commitment,
    private_key: PrivateKey,
    our_index: usize,
) -> Result {
    let params = AdvanceChannelParams {
        process_id,
        protocol_locator,
        channel_id: genesis.channel_id(),
        commitment_type: CommitmentType::PreFundSetup,
    };
    if our_index != 0 {
        return with(
            ChannelUnknown {
                params,
                private_key,
            },
            shared,
        );
    }

    match shared.sign_and_initialize(genesis, private_key) {
        Ok((shared, _)) => {
            let shared = shared.broadcast_commitments(
                params.channel_id,
                &params.process_id,
                &params.protocol_locator,
            );
            status(params, shared)
        }
        Err(e) => {
            warn!(process_id = %params.process_id, error = %e, "could not open channel");
            with(
                Failure {
                    process_id: params.process_id,
                    reason: FailureReason::SigningFailed,
                },
                shared,
            )
        }
    }
}

/// Start the PostFundSetup round of a channel whose PreFundSetup round is
/// complete.
pub fn initialize_post_fund(
    shared: SharedData,
    process_id: ProcessId,
    protocol_locator: ProtocolLocator,
    channel_id: ChannelId,
) -> Result {
    if shared.get_channel(channel_id).is_none() {
        return with(
            Failure {
                process_id,
                reason: FailureReason::ChannelMissing,
            },
            shared,
        );
    }
    let params = AdvanceChannelParams {
        process_id,
        protocol_locator,
        channel_id,
        commitment_type: CommitmentType::PostFundSetup,
    };
    advance(params, shared)
}

pub fn reducer(state: AdvanceChannelState, shared: SharedData, action: &WalletAction) -> Result {
    let locator = match state.params() {
        Some(params) => params.protocol_locator.clone(),
        None => return with(state, shared),
    };
    match received_commitments(action, &locator) {
        Some(batch) => receive(state, shared, batch),
        None => with(state, shared),
    }
}

/// Store a batch of commitments relayed for this round and sign ours if it
/// is now our turn. Commitments of other channels are skipped.
pub fn receive(state: AdvanceChannelState, shared: SharedData, batch: &[SignedCommitment]) -> Result {
    let (params, private_key) = match state {
        ChannelUnknown {
            params,
            private_key,
        } => (params, Some(private_key)),
        NotSafeToSend { params } | CommitmentSent { params } => (params, None),
        terminal => return with(terminal, shared),
    };

    let batch: Vec<SignedCommitment> = batch
        .iter()
        .filter(|s| s.commitment.channel_id() == params.channel_id)
        .cloned()
        .collect();

    let stored = match (private_key, batch.split_first()) {
        (Some(private_key), Some((genesis, rest))) => shared
            .check_and_initialize(genesis.clone(), private_key)
            .and_then(|s| s.check_and_store_batch(rest)),
        (_, None) => return with(unchanged(params, private_key), shared),
        (None, Some(_)) => shared.check_and_store_batch(&batch),
    };
    match stored {
        Ok(shared) => advance(params, shared),
        Err(e) => {
            warn!(process_id = %params.process_id, error = %e, "ignoring commitments");
            with(unchanged(params, private_key), shared)
        }
    }
}

fn unchanged(params: AdvanceChannelParams, private_key: Option<PrivateKey>) -> AdvanceChannelState {
    match private_key {
        Some(private_key) => ChannelUnknown {
            params,
            private_key,
        },
        None => NotSafeToSend { params },
    }
}

/// Sign our commitment of the round if it is our turn, then report where
/// the round stands.
fn advance(params: AdvanceChannelParams, shared: SharedData) -> Result {
    let next = shared
        .get_channel(params.channel_id)
        .filter(|c| c.our_turn())
        .and_then(|c| c.last().next_setup())
        .filter(|c| c.commitment_type == params.commitment_type);

    let shared = match next.map(|c| shared.sign_and_store(c)) {
        Some(Ok((shared, _))) => shared.broadcast_commitments(
            params.channel_id,
            &params.process_id,
            &params.protocol_locator,
        ),
        Some(Err(e)) => {
            warn!(process_id = %params.process_id, error = %e, "could not sign setup commitment");
            return with(
                Failure {
                    process_id: params.process_id,
                    reason: FailureReason::SigningFailed,
                },
                shared,
            );
        }
        None => shared,
    };
    status(params, shared)
}

fn status(params: AdvanceChannelParams, shared: SharedData) -> Result {
    let channel = match shared.get_channel(params.channel_id) {
        Some(channel) => channel,
        None => {
            return with(
                Failure {
                    process_id: params.process_id,
                    reason: FailureReason::ChannelMissing,
                },
                shared,
            )
        }
    };
    let n = channel.num_participants() as u64;
    let base = match params.commitment_type {
        CommitmentType::PostFundSetup => n,
        _ => 0,
    };
    let complete = channel.turn_num.saturating_add(1) >= base + n;
    let sent = channel.turn_num >= base + channel.our_index as u64;

    if complete {
        debug!(process_id = %params.process_id, channel_id = ?params.channel_id, round = ?params.commitment_type, "setup round complete");
        with(
            Success {
                process_id: params.process_id,
                channel_id: params.channel_id,
                commitment_type: params.commitment_type,
            },
            shared,
        )
    } else if sent {
        with(CommitmentSent { params }, shared)
    } else {
        with(NotSafeToSend { params }, shared)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        outbox::RelayPayload,
        test_utils::{commitments_received, Fixture},
        types::Address,
    };

    fn locator() -> ProtocolLocator {
        ProtocolLocator::root().child(ProtocolLocator::JOINT_CHANNEL)
    }

    fn pid(f: &Fixture) -> ProcessId {
        ProcessId::new("VirtualFunding", f.channel.id())
    }

    /// Batches addressed to `to` in `shared`'s outbox.
    fn batches_to(shared: &SharedData, to: Address) -> Vec<Vec<SignedCommitment>> {
        shared
            .outbox
            .relays()
            .filter(|r| r.to == to)
            .filter_map(|r| match &r.payload {
                RelayPayload::Commitments {
                    signed_commitments, ..
                } => Some(signed_commitments.clone()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn three_party_pre_fund_round() {
        let f = Fixture::three_party();
        let genesis = f.pre_fund_setup();
        let mut players: Vec<(AdvanceChannelState, SharedData)> = (0..3)
            .map(|i| {
                let res = initialize_pre_fund(
                    SharedData::default(),
                    pid(&f),
                    locator(),
                    genesis.clone(),
                    f.key(i),
                    i,
                );
                (res.protocol_state, res.shared_data)
            })
            .collect();
        assert!(matches!(players[0].0, NotSafeToSend { .. } | CommitmentSent { .. }));
        assert!(matches!(players[1].0, ChannelUnknown { .. }));

        let addresses = f.channel.participants.clone();
        for _ in 0..3 {
            let mut inbox: Vec<Vec<Vec<SignedCommitment>>> = vec![vec![]; 3];
            for (_, shared) in players.iter_mut() {
                for (i, to) in addresses.iter().enumerate() {
                    inbox[i].extend(batches_to(shared, *to));
                }
                shared.take_outbox();
            }
            for (i, batches) in inbox.into_iter().enumerate() {
                for batch in batches {
                    let (state, shared) = players[i].clone();
                    let res = reducer(state, shared, &commitments_received(&pid(&f), locator(), batch));
                    players[i] = (res.protocol_state, res.shared_data);
                }
            }
        }

        for (state, shared) in &players {
            assert!(state.is_success(), "ended in {:?}", state);
            assert_eq!(shared.get_channel(f.channel.id()).unwrap().turn_num, 2);
        }
    }

    #[test]
    fn post_fund_round_signs_on_our_turn() {
        let f = Fixture::two_party();
        let setup = f.setup_commitments();
        let res = initialize_post_fund(
            f.shared_with(0, &setup[..2]),
            pid(&f),
            locator(),
            f.channel.id(),
        );
        assert!(matches!(res.protocol_state, CommitmentSent { .. }));
        let sent = batches_to(&res.shared_data, f.bob.address());
        assert_eq!(sent[0].last().unwrap().commitment, setup[2]);

        let reply = vec![f.sign(setup[2].clone()), f.sign(setup[3].clone())];
        let res = reducer(
            res.protocol_state,
            res.shared_data,
            &commitments_received(&pid(&f), locator(), reply),
        );
        assert_eq!(
            res.protocol_state,
            Success {
                process_id: pid(&f),
                channel_id: f.channel.id(),
                commitment_type: CommitmentType::PostFundSetup,
            }
        );
    }

    #[test]
    fn other_locators_are_ignored() {
        let f = Fixture::two_party();
        let setup = f.setup_commitments();
        let res = initialize_post_fund(f.shared_with(1, &setup[..2]), pid(&f), locator(), f.channel.id());
        assert!(matches!(res.protocol_state, NotSafeToSend { .. }));

        let batch = vec![f.sign(setup[2].clone())];
        let other = ProtocolLocator::root().child(ProtocolLocator::GUARANTOR_CHANNEL);
        let res = reducer(
            res.protocol_state,
            res.shared_data,
            &commitments_received(&pid(&f), other, batch),
        );
        assert!(matches!(res.protocol_state, NotSafeToSend { .. }));
        assert_eq!(res.shared_data.get_channel(f.channel.id()).unwrap().turn_num, 1);
    }

    #[test]
    fn post_fund_on_missing_channel_fails() {
        let f = Fixture::two_party();
        let res = initialize_post_fund(SharedData::default(), pid(&f), locator(), f.channel.id());
        assert_eq!(
            res.protocol_state,
            Failure {
                process_id: pid(&f),
                reason: FailureReason::ChannelMissing,
            }
        );
    }
}
