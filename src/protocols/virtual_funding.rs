//! Funding a target channel through a hub, without on-chain deposits.
//!
//! Three consensus channels over the target's participants plus the hub are
//! involved:
//! * the joint channel, holding every participant's share and the hub's
//!   matching share,
//! * the guarantor channel, allocating the target's total to the target,
//! * a consensus round on the joint channel moving its funds to
//!   `[guarantor, hub]`, after which the guarantor (and thus the target) is
//!   funded.
//!
//! The setup rounds are run by [advance_channel] machines embedded under the
//! [ProtocolLocator::JOINT_CHANNEL] and [ProtocolLocator::GUARANTOR_CHANNEL]
//! slots. Peers move through the stages at their own pace, so a batch for a
//! stage we have not reached yet is kept and replayed once we get there.

use core::fmt;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::{
    advance_channel::{self, AdvanceChannelState},
    relayed_commitments, with, ProcessId, ProtocolLocator, ProtocolStateWithSharedData,
};
use crate::{
    actions::WalletAction,
    commitment::{
        consensus::{self, ConsensusAttributes},
        Channel, Commitment, CommitmentType, SignedCommitment,
    },
    config::WalletConfig,
    shared_data::{FundingType, SharedData},
    sig::Signer,
    types::{Address, ChannelId, PrivateKey, U256},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureReason {
    NotAParticipant,
    JointChannelFailed,
    GuarantorChannelFailed,
    InvalidJointUpdate,
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::NotAParticipant => f.write_str("Not a participant"),
            FailureReason::JointChannelFailed => f.write_str("Joint channel setup failed"),
            FailureReason::GuarantorChannelFailed => f.write_str("Guarantor channel setup failed"),
            FailureReason::InvalidJointUpdate => f.write_str("Invalid joint channel update"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VirtualFundingParams {
    pub process_id: ProcessId,
    pub protocol_locator: ProtocolLocator,
    pub target_channel_id: ChannelId,
    pub target_allocation: Vec<U256>,
    pub joint_channel: Channel,
    pub guarantor_channel: Channel,
    pub hub: Address,
    pub private_key: PrivateKey,
    pub our_index: usize,
    /// Batches for a later stage than the current one, in arrival order.
    pub deferred: Vec<(ProtocolLocator, Vec<SignedCommitment>)>,
}

impl VirtualFundingParams {
    fn target_total(&self) -> U256 {
        self.target_allocation
            .iter()
            .fold(U256::zero(), |acc, a| acc.saturating_add(*a))
    }

    fn joint_locator(&self) -> ProtocolLocator {
        self.protocol_locator.child(ProtocolLocator::JOINT_CHANNEL)
    }

    fn guarantor_locator(&self) -> ProtocolLocator {
        self.protocol_locator.child(ProtocolLocator::GUARANTOR_CHANNEL)
    }

    /// Each participant's share, followed by the hub's matching share.
    fn joint_pre_fund_setup(&self) -> Commitment {
        let mut allocation = self.target_allocation.clone();
        allocation.push(self.target_total());
        let destination = self.joint_channel.participants.clone();
        let attributes = ConsensusAttributes::consensus(&allocation, &destination);
        Commitment::pre_fund_setup(
            self.joint_channel.clone(),
            allocation,
            destination,
            attributes.to_bytes(),
        )
    }

    fn guarantor_pre_fund_setup(&self) -> Commitment {
        let allocation = vec![self.target_total()];
        let destination = vec![self.target_channel_id];
        let attributes = ConsensusAttributes::consensus(&allocation, &destination);
        Commitment::pre_fund_setup(
            self.guarantor_channel.clone(),
            allocation,
            destination,
            attributes.to_bytes(),
        )
    }

    /// Joint channel outcome funding the guarantor.
    fn guarantee(&self) -> (Vec<U256>, Vec<Address>) {
        let total = self.target_total();
        (
            vec![total, total],
            vec![self.guarantor_channel.id(), self.hub],
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum VirtualFundingState {
    WaitForJointChannel {
        params: VirtualFundingParams,
        joint_channel: AdvanceChannelState,
    },
    WaitForGuarantorChannel {
        params: VirtualFundingParams,
        guarantor_channel: AdvanceChannelState,
    },
    WaitForGuarantorFunding {
        params: VirtualFundingParams,
    },
    Success {
        process_id: ProcessId,
        target_channel_id: ChannelId,
    },
    Failure {
        process_id: ProcessId,
        reason: FailureReason,
    },
}

use VirtualFundingState::*;

impl VirtualFundingState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Success { .. } | Failure { .. })
    }

    /// Virtual funding only waits on peers.
    pub fn awaiting_user(&self) -> bool {
        false
    }
}

type Result = ProtocolStateWithSharedData<VirtualFundingState>;

fn failure(params: VirtualFundingParams, reason: FailureReason, shared: SharedData) -> Result {
    with(
        Failure {
            process_id: params.process_id,
            reason,
        },
        shared,
    )
}

#[allow(clippy::too_many_arguments)]
pub fn initialize(
    shared: SharedData,
    config: &WalletConfig,
    process_id: ProcessId,
    target_channel_id: ChannelId,
    target_participants: &[Address],
    target_allocation: Vec<U256>,
    hub: Address,
    nonce: u64,
    private_key: PrivateKey,
) -> Result {
    let mut participants = target_participants.to_vec();
    participants.push(hub);
    let our_index = Signer::from_private_key(&private_key)
        .ok()
        .and_then(|s| participants.iter().position(|p| *p == s.address()));
    let our_index = match our_index {
        Some(i) => i,
        None => {
            return with(
                Failure {
                    process_id,
                    reason: FailureReason::NotAParticipant,
                },
                shared,
            )
        }
    };

    let params = VirtualFundingParams {
        process_id,
        protocol_locator: ProtocolLocator::root(),
        target_channel_id,
        target_allocation,
        joint_channel: Channel::new(config.consensus_library, nonce, participants.clone()),
        guarantor_channel: Channel::new(config.consensus_library, nonce + 1, participants),
        hub,
        private_key,
        our_index,
        deferred: Vec::new(),
    };
    info!(process_id = %params.process_id, target_channel_id = ?target_channel_id, our_index, "virtual funding started");

    let res = advance_channel::initialize_pre_fund(
        shared,
        params.process_id.clone(),
        params.joint_locator(),
        params.joint_pre_fund_setup(),
        private_key,
        our_index,
    );
    after_joint_channel(params, res)
}

pub fn reducer(state: VirtualFundingState, shared: SharedData, action: &WalletAction) -> Result {
    match relayed_commitments(action) {
        Some((locator, batch)) => receive(state, shared, locator, batch),
        None => with(state, shared),
    }
}

fn receive(
    state: VirtualFundingState,
    shared: SharedData,
    locator: &ProtocolLocator,
    batch: &[SignedCommitment],
) -> Result {
    match state {
        WaitForJointChannel {
            params,
            joint_channel,
        } => {
            if *locator == params.joint_locator() {
                let res = advance_channel::receive(joint_channel, shared, batch);
                after_joint_channel(params, res)
            } else {
                let params = if *locator == params.guarantor_locator() {
                    defer(params, locator, batch)
                } else {
                    params
                };
                with(
                    WaitForJointChannel {
                        params,
                        joint_channel,
                    },
                    shared,
                )
            }
        }
        WaitForGuarantorChannel {
            params,
            guarantor_channel,
        } => {
            if *locator == params.guarantor_locator() {
                let res = advance_channel::receive(guarantor_channel, shared, batch);
                after_guarantor_channel(params, res)
            } else {
                // The guarantee round on the joint channel may start before
                // our guarantor round completes.
                let params = if *locator == params.joint_locator() {
                    defer(params, locator, batch)
                } else {
                    params
                };
                with(
                    WaitForGuarantorChannel {
                        params,
                        guarantor_channel,
                    },
                    shared,
                )
            }
        }
        WaitForGuarantorFunding { params } => {
            if *locator != params.joint_locator() {
                return with(WaitForGuarantorFunding { params }, shared);
            }
            match shared.check_and_store_batch(batch) {
                Ok(shared) => guarantor_funding(params, shared),
                Err(e) => {
                    warn!(process_id = %params.process_id, error = %e, "ignoring joint channel update");
                    with(WaitForGuarantorFunding { params }, shared)
                }
            }
        }
        state @ (Success { .. } | Failure { .. }) => with(state, shared),
    }
}

fn defer(
    mut params: VirtualFundingParams,
    locator: &ProtocolLocator,
    batch: &[SignedCommitment],
) -> VirtualFundingParams {
    debug!(process_id = %params.process_id, locator = ?locator.0, "deferring commitments for a later stage");
    params.deferred.push((locator.clone(), batch.to_vec()));
    params
}

/// Feed deferred batches back in after a stage change.
fn replay(res: Result) -> Result {
    let ProtocolStateWithSharedData {
        mut protocol_state,
        shared_data,
    } = res;
    let deferred = match &mut protocol_state {
        WaitForJointChannel { params, .. }
        | WaitForGuarantorChannel { params, .. }
        | WaitForGuarantorFunding { params } => core::mem::take(&mut params.deferred),
        Success { .. } | Failure { .. } => Vec::new(),
    };
    deferred
        .into_iter()
        .fold(with(protocol_state, shared_data), |res, (locator, batch)| {
            receive(res.protocol_state, res.shared_data, &locator, &batch)
        })
}

fn after_joint_channel(
    params: VirtualFundingParams,
    res: ProtocolStateWithSharedData<AdvanceChannelState>,
) -> Result {
    let shared = res.shared_data;
    match res.protocol_state {
        AdvanceChannelState::Success {
            commitment_type: CommitmentType::PreFundSetup,
            ..
        } => {
            let res = advance_channel::initialize_post_fund(
                shared,
                params.process_id.clone(),
                params.joint_locator(),
                params.joint_channel.id(),
            );
            after_joint_channel(params, res)
        }
        AdvanceChannelState::Success { .. } => {
            debug!(process_id = %params.process_id, "joint channel open");
            let res = advance_channel::initialize_pre_fund(
                shared,
                params.process_id.clone(),
                params.guarantor_locator(),
                params.guarantor_pre_fund_setup(),
                params.private_key,
                params.our_index,
            );
            replay(after_guarantor_channel(params, res))
        }
        AdvanceChannelState::Failure { .. } => {
            failure(params, FailureReason::JointChannelFailed, shared)
        }
        joint_channel => with(
            WaitForJointChannel {
                params,
                joint_channel,
            },
            shared,
        ),
    }
}

fn after_guarantor_channel(
    params: VirtualFundingParams,
    res: ProtocolStateWithSharedData<AdvanceChannelState>,
) -> Result {
    let shared = res.shared_data;
    match res.protocol_state {
        AdvanceChannelState::Success {
            commitment_type: CommitmentType::PreFundSetup,
            ..
        } => {
            let res = advance_channel::initialize_post_fund(
                shared,
                params.process_id.clone(),
                params.guarantor_locator(),
                params.guarantor_channel.id(),
            );
            after_guarantor_channel(params, res)
        }
        AdvanceChannelState::Success { .. } => {
            debug!(process_id = %params.process_id, "guarantor channel open");
            replay(guarantor_funding(params, shared))
        }
        AdvanceChannelState::Failure { .. } => {
            failure(params, FailureReason::GuarantorChannelFailed, shared)
        }
        guarantor_channel => with(
            WaitForGuarantorChannel {
                params,
                guarantor_channel,
            },
            shared,
        ),
    }
}

/// Participant 0 proposes the guarantee once the joint channel's setup is
/// complete, everybody else votes in turn.
fn guarantor_funding(params: VirtualFundingParams, shared: SharedData) -> Result {
    let (allocation, destination) = params.guarantee();
    let joint_id = params.joint_channel.id();
    let joint = match shared.get_channel(joint_id) {
        Some(joint) => joint,
        None => return failure(params, FailureReason::JointChannelFailed, shared),
    };
    let last = joint.last();

    let next = if !joint.our_turn() {
        None
    } else if last.completes_setup() {
        Some(consensus::propose(last, allocation.clone(), destination.clone()))
    } else if consensus::is_proposal_of(last, &allocation, &destination) {
        match consensus::vote(last) {
            Ok(next) => Some(next),
            Err(e) => {
                warn!(process_id = %params.process_id, error = %e, "malformed joint channel proposal");
                return failure(params, FailureReason::InvalidJointUpdate, shared);
            }
        }
    } else {
        None
    };

    let shared = match next.map(|c| shared.sign_and_store(c)) {
        Some(Ok((shared, _))) => {
            shared.broadcast_commitments(joint_id, &params.process_id, &params.joint_locator())
        }
        Some(Err(e)) => {
            warn!(process_id = %params.process_id, error = %e, "could not sign joint channel update");
            return failure(params, FailureReason::InvalidJointUpdate, shared);
        }
        None => shared,
    };

    let funded = shared
        .get_channel(joint_id)
        .map_or(false, |j| consensus::is_consensus_on(j.last(), &allocation, &destination));
    if !funded {
        return with(WaitForGuarantorFunding { params }, shared);
    }

    info!(process_id = %params.process_id, "virtual funding succeeded");
    let guarantor_id = params.guarantor_channel.id();
    let shared = shared
        .set_funding_state(
            params.target_channel_id,
            FundingType::Indirect {
                ledger_id: guarantor_id,
            },
        )
        .set_funding_state(guarantor_id, FundingType::Indirect { ledger_id: joint_id });
    with(
        Success {
            process_id: params.process_id,
            target_channel_id: params.target_channel_id,
        },
        shared,
    )
}
