use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::{
    app_setup_complete, app_total, ledger_channel, record_app_funding, send_app_post_fund_setup,
    FailureReason, LedgerFunding,
};
use crate::{
    actions::WalletAction,
    commitment::{
        consensus::{self, ConsensusAttributes},
        Commitment,
    },
    config::WalletConfig,
    protocols::{
        direct_funding::{self, DirectFundingParams, DirectFundingState},
        received_commitment, with, ProcessId, ProtocolStateWithSharedData,
    },
    shared_data::SharedData,
    types::ChannelId,
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PlayerAState {
    AWaitForPreFundSetup1 {
        ids: LedgerFunding,
    },
    AWaitForDirectFunding {
        ids: LedgerFunding,
        direct_funding_state: DirectFundingState,
    },
    AWaitForLedgerUpdate1 {
        ids: LedgerFunding,
    },
    AWaitForPostFundSetup1 {
        ids: LedgerFunding,
    },
    Success {
        ids: LedgerFunding,
    },
    Failure {
        process_id: ProcessId,
        reason: FailureReason,
    },
}

use PlayerAState::*;

type Result = ProtocolStateWithSharedData<PlayerAState>;

fn failure(ids: LedgerFunding, reason: FailureReason, shared: SharedData) -> Result {
    with(
        Failure {
            process_id: ids.process_id,
            reason,
        },
        shared,
    )
}

pub fn initialize(
    shared: SharedData,
    config: &WalletConfig,
    process_id: ProcessId,
    channel_id: ChannelId,
) -> Result {
    let app = match shared.get_channel(channel_id) {
        Some(app) => app.clone(),
        None => {
            return with(
                Failure {
                    process_id,
                    reason: FailureReason::ChannelMissing,
                },
                shared,
            )
        }
    };
    let ledger = ledger_channel(config, &app.channel);
    let ids = LedgerFunding {
        process_id,
        channel_id,
        ledger_id: ledger.id(),
    };

    let allocation = app.last().allocation.clone();
    let destination = app.last().destination.clone();
    let attributes = ConsensusAttributes::consensus(&allocation, &destination);
    let pre_fund_setup =
        Commitment::pre_fund_setup(ledger, allocation, destination, attributes.to_bytes());

    match shared.sign_and_initialize(pre_fund_setup, app.private_key) {
        Ok((shared, signed)) => {
            debug!(process_id = %ids.process_id, ledger_id = ?ids.ledger_id, "opened ledger channel");
            let shared = shared.send_commitment(&ids.process_id, signed);
            with(AWaitForPreFundSetup1 { ids }, shared)
        }
        Err(e) => {
            warn!(process_id = %ids.process_id, error = %e, "could not open ledger channel");
            failure(ids, FailureReason::LedgerSetupFailed, shared)
        }
    }
}

pub fn reducer(state: PlayerAState, shared: SharedData, action: &WalletAction) -> Result {
    match state {
        AWaitForPreFundSetup1 { ids } => {
            match store_commitment(&shared, action, ids.ledger_id) {
                Some(shared) => start_direct_funding(ids, shared),
                None => with(AWaitForPreFundSetup1 { ids }, shared),
            }
        }
        AWaitForDirectFunding {
            ids,
            direct_funding_state,
        } => {
            let res = direct_funding::reducer(direct_funding_state, shared, action);
            after_direct_funding(ids, res)
        }
        AWaitForLedgerUpdate1 { ids } => {
            let shared = match store_commitment(&shared, action, ids.ledger_id) {
                Some(shared) => shared,
                None => return with(AWaitForLedgerUpdate1 { ids }, shared),
            };
            let total = app_total(&shared, ids.channel_id);
            let ledger = match shared.get_channel(ids.ledger_id) {
                Some(ledger) => ledger.last().clone(),
                None => return failure(ids, FailureReason::UnexpectedLedgerUpdate, shared),
            };
            if consensus::is_consensus_on(&ledger, &[total], &[ids.channel_id]) {
                let shared = send_app_post_fund_setup(shared, &ids);
                with(AWaitForPostFundSetup1 { ids }, shared)
            } else if consensus::is_proposal_of(&ledger, &[total], &[ids.channel_id]) {
                // More votes to come.
                with(AWaitForLedgerUpdate1 { ids }, shared)
            } else {
                failure(ids, FailureReason::UnexpectedLedgerUpdate, shared)
            }
        }
        AWaitForPostFundSetup1 { ids } => {
            let shared = match store_commitment(&shared, action, ids.channel_id) {
                Some(shared) => shared,
                None => return with(AWaitForPostFundSetup1 { ids }, shared),
            };
            let shared = send_app_post_fund_setup(shared, &ids);
            if app_setup_complete(&shared, &ids) {
                let shared = record_app_funding(shared, &ids);
                with(Success { ids }, shared)
            } else {
                with(AWaitForPostFundSetup1 { ids }, shared)
            }
        }
        state @ (Success { .. } | Failure { .. }) => with(state, shared),
    }
}

/// Store a relayed commitment for `channel_id`, `None` if the action
/// carries none or it was rejected.
fn store_commitment(
    shared: &SharedData,
    action: &WalletAction,
    channel_id: ChannelId,
) -> Option<SharedData> {
    let signed = received_commitment(action)?;
    if signed.commitment.channel_id() != channel_id {
        return None;
    }
    shared
        .check_and_store(signed.clone())
        .map_err(|e| warn!(?channel_id, error = %e, "ignoring commitment"))
        .ok()
}

fn start_direct_funding(ids: LedgerFunding, shared: SharedData) -> Result {
    let params = match shared.get_channel(ids.ledger_id) {
        Some(ledger) => DirectFundingParams::for_allocation(
            ids.process_id.clone(),
            ids.ledger_id,
            &ledger.last().allocation,
            ledger.our_index,
        ),
        None => return failure(ids, FailureReason::LedgerSetupFailed, shared),
    };
    let res = direct_funding::initialize(shared, params);
    after_direct_funding(ids, res)
}

fn after_direct_funding(
    ids: LedgerFunding,
    res: ProtocolStateWithSharedData<DirectFundingState>,
) -> Result {
    match res.protocol_state {
        DirectFundingState::FundingSuccess { .. } => propose_ledger_update(ids, res.shared_data),
        DirectFundingState::FundingFailure { .. } => {
            failure(ids, FailureReason::LedgerFundingFailed, res.shared_data)
        }
        direct_funding_state => with(
            AWaitForDirectFunding {
                ids,
                direct_funding_state,
            },
            res.shared_data,
        ),
    }
}

/// Propose moving the ledger's total to the application channel.
fn propose_ledger_update(ids: LedgerFunding, shared: SharedData) -> Result {
    let total = app_total(&shared, ids.channel_id);
    let ledger = match shared.get_channel(ids.ledger_id) {
        Some(ledger) => ledger,
        None => return failure(ids, FailureReason::LedgerSetupFailed, shared),
    };
    let proposal = consensus::propose(ledger.last(), vec![total], vec![ids.channel_id]);

    // The update is the first commitment after the setup phase. Anything
    // else means the funding sequence is broken.
    let expected_turn = 2 * ledger.num_participants() as u64;
    if proposal.turn_num != expected_turn {
        panic!(
            "ledger update must be made at turn {}, not {}",
            expected_turn, proposal.turn_num
        );
    }

    match shared.sign_and_store(proposal) {
        Ok((shared, signed)) => {
            let shared = shared.send_commitment(&ids.process_id, signed);
            with(AWaitForLedgerUpdate1 { ids }, shared)
        }
        Err(e) => {
            warn!(process_id = %ids.process_id, error = %e, "could not sign ledger update");
            failure(ids, FailureReason::UnexpectedLedgerUpdate, shared)
        }
    }
}
