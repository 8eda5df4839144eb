use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::{
    app_setup_complete, app_total, ledger_channel, record_app_funding, send_app_post_fund_setup,
    FailureReason, LedgerFunding,
};
use crate::{
    actions::WalletAction,
    commitment::{consensus, CommitmentType},
    config::WalletConfig,
    protocols::{
        direct_funding::{self, DirectFundingParams, DirectFundingState},
        received_commitment, with, ProcessId, ProtocolStateWithSharedData,
    },
    shared_data::SharedData,
    types::ChannelId,
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PlayerBState {
    BWaitForPreFundSetup0 {
        ids: LedgerFunding,
    },
    BWaitForDirectFunding {
        ids: LedgerFunding,
        direct_funding_state: DirectFundingState,
    },
    BWaitForLedgerUpdate0 {
        ids: LedgerFunding,
    },
    BWaitForPostFundSetup0 {
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

use PlayerBState::*;

type Result = ProtocolStateWithSharedData<PlayerBState>;

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
    let ledger_id = match shared.get_channel(channel_id) {
        Some(app) => ledger_channel(config, &app.channel).id(),
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
    let ids = LedgerFunding {
        process_id,
        channel_id,
        ledger_id,
    };
    with(BWaitForPreFundSetup0 { ids }, shared)
}

pub fn reducer(state: PlayerBState, shared: SharedData, action: &WalletAction) -> Result {
    match state {
        BWaitForPreFundSetup0 { ids } => {
            let signed = match received_commitment(action) {
                Some(signed) if signed.commitment.channel_id() == ids.ledger_id => signed,
                _ => return with(BWaitForPreFundSetup0 { ids }, shared),
            };
            let private_key = match shared.get_channel(ids.channel_id) {
                Some(app) => app.private_key,
                None => return failure(ids, FailureReason::ChannelMissing, shared),
            };
            let shared = match shared.check_and_initialize(signed.clone(), private_key) {
                Ok(shared) => shared,
                Err(e) => {
                    warn!(process_id = %ids.process_id, error = %e, "rejected ledger PreFundSetup");
                    return with(BWaitForPreFundSetup0 { ids }, shared);
                }
            };
            let next = shared
                .get_channel(ids.ledger_id)
                .and_then(|ledger| ledger.last().next_setup())
                .filter(|c| c.commitment_type == CommitmentType::PreFundSetup);
            let shared = match next.map(|c| shared.sign_and_store(c)) {
                Some(Ok((shared, signed))) => shared.send_commitment(&ids.process_id, signed),
                Some(Err(e)) => {
                    warn!(process_id = %ids.process_id, error = %e, "could not sign ledger PreFundSetup");
                    return failure(ids, FailureReason::LedgerSetupFailed, shared);
                }
                None => return failure(ids, FailureReason::LedgerSetupFailed, shared),
            };
            debug!(process_id = %ids.process_id, ledger_id = ?ids.ledger_id, "joined ledger channel");
            start_direct_funding(ids, shared)
        }
        BWaitForDirectFunding {
            ids,
            direct_funding_state,
        } => {
            let res = direct_funding::reducer(direct_funding_state, shared, action);
            after_direct_funding(ids, res)
        }
        BWaitForLedgerUpdate0 { ids } => {
            let signed = match received_commitment(action) {
                Some(signed) if signed.commitment.channel_id() == ids.ledger_id => signed,
                _ => return with(BWaitForLedgerUpdate0 { ids }, shared),
            };
            let total = app_total(&shared, ids.channel_id);
            if !consensus::is_proposal_of(&signed.commitment, &[total], &[ids.channel_id]) {
                warn!(process_id = %ids.process_id, "ledger update does not fund the channel");
                return failure(ids, FailureReason::UnexpectedLedgerUpdate, shared);
            }
            let shared = match shared.check_and_store(signed.clone()) {
                Ok(shared) => shared,
                Err(e) => {
                    warn!(process_id = %ids.process_id, error = %e, "ignoring ledger update");
                    return with(BWaitForLedgerUpdate0 { ids }, shared);
                }
            };
            vote(ids, shared, total)
        }
        BWaitForPostFundSetup0 { ids } => {
            let signed = match received_commitment(action) {
                Some(signed) if signed.commitment.channel_id() == ids.channel_id => signed,
                _ => return with(BWaitForPostFundSetup0 { ids }, shared),
            };
            let shared = match shared.check_and_store(signed.clone()) {
                Ok(shared) => shared,
                Err(e) => {
                    warn!(process_id = %ids.process_id, error = %e, "ignoring commitment");
                    return with(BWaitForPostFundSetup0 { ids }, shared);
                }
            };
            let shared = send_app_post_fund_setup(shared, &ids);
            if app_setup_complete(&shared, &ids) {
                let shared = record_app_funding(shared, &ids);
                with(Success { ids }, shared)
            } else {
                with(BWaitForPostFundSetup0 { ids }, shared)
            }
        }
        state @ (Success { .. } | Failure { .. }) => with(state, shared),
    }
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
        DirectFundingState::FundingSuccess { .. } => {
            with(BWaitForLedgerUpdate0 { ids }, res.shared_data)
        }
        DirectFundingState::FundingFailure { .. } => {
            failure(ids, FailureReason::LedgerFundingFailed, res.shared_data)
        }
        direct_funding_state => with(
            BWaitForDirectFunding {
                ids,
                direct_funding_state,
            },
            res.shared_data,
        ),
    }
}

/// Vote for the stored proposal if it is our turn. With more than two
/// participants we keep waiting until the final vote is in.
fn vote(ids: LedgerFunding, shared: SharedData, total: crate::types::U256) -> Result {
    let ledger = match shared.get_channel(ids.ledger_id) {
        Some(ledger) => ledger,
        None => return failure(ids, FailureReason::LedgerSetupFailed, shared),
    };
    let shared = if ledger.our_turn() {
        let next = match consensus::vote(ledger.last()) {
            Ok(next) => next,
            Err(e) => {
                warn!(process_id = %ids.process_id, error = %e, "malformed ledger proposal");
                return failure(ids, FailureReason::UnexpectedLedgerUpdate, shared);
            }
        };
        match shared.sign_and_store(next) {
            Ok((shared, signed)) => shared.send_commitment(&ids.process_id, signed),
            Err(e) => {
                warn!(process_id = %ids.process_id, error = %e, "could not vote on ledger update");
                return failure(ids, FailureReason::UnexpectedLedgerUpdate, shared);
            }
        }
    } else {
        shared
    };

    let agreed = shared
        .get_channel(ids.ledger_id)
        .map_or(false, |l| consensus::is_consensus_on(l.last(), &[total], &[ids.channel_id]));
    if agreed {
        with(BWaitForPostFundSetup0 { ids }, shared)
    } else {
        with(BWaitForLedgerUpdate0 { ids }, shared)
    }
}
