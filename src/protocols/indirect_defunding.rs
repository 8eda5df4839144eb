//! Returning a concluded channel's funds to its ledger channel.
//!
//! A consensus round on the ledger channel adopts the concluded channel's
//! final outcome. Whoever's turn it is on the ledger proposes, the others
//! vote.

use core::fmt;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::{received_commitment, with, ProcessId, ProtocolStateWithSharedData};
use crate::{
    actions::WalletAction,
    commitment::{
        consensus::{self, ConsensusAttributes},
        Commitment,
    },
    shared_data::SharedData,
    types::{Address, ChannelId, U256},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureReason {
    ChannelNotClosed,
    LedgerChannelMissing,
    InvalidCommitment,
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::ChannelNotClosed => f.write_str("Channel is not closed"),
            FailureReason::LedgerChannelMissing => f.write_str("Ledger channel does not exist"),
            FailureReason::InvalidCommitment => f.write_str("Invalid ledger commitment"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerDefunding {
    pub process_id: ProcessId,
    pub channel_id: ChannelId,
    pub ledger_id: ChannelId,
    /// Final outcome of the concluded channel.
    pub allocation: Vec<U256>,
    pub destination: Vec<Address>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum IndirectDefundingState {
    WaitForLedgerUpdate {
        defunding: LedgerDefunding,
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

use IndirectDefundingState::*;

impl IndirectDefundingState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Success { .. } | Failure { .. })
    }
}

type Result = ProtocolStateWithSharedData<IndirectDefundingState>;

fn failure(process_id: ProcessId, reason: FailureReason, shared: SharedData) -> Result {
    with(Failure { process_id, reason }, shared)
}

pub fn initialize(
    shared: SharedData,
    process_id: ProcessId,
    channel_id: ChannelId,
    ledger_id: ChannelId,
) -> Result {
    let (allocation, destination) = match shared.get_channel(channel_id) {
        Some(channel) if channel.is_closed() => (
            channel.last().allocation.clone(),
            channel.last().destination.clone(),
        ),
        _ => return failure(process_id, FailureReason::ChannelNotClosed, shared),
    };
    if shared.get_channel(ledger_id).is_none() {
        return failure(process_id, FailureReason::LedgerChannelMissing, shared);
    }
    info!(%process_id, ?ledger_id, "defunding through ledger");
    advance(
        LedgerDefunding {
            process_id,
            channel_id,
            ledger_id,
            allocation,
            destination,
        },
        shared,
    )
}

pub fn reducer(state: IndirectDefundingState, shared: SharedData, action: &WalletAction) -> Result {
    let defunding = match state {
        WaitForLedgerUpdate { defunding } => defunding,
        terminal => return with(terminal, shared),
    };
    let signed = match received_commitment(action) {
        Some(signed) if signed.commitment.channel_id() == defunding.ledger_id => signed,
        _ => return with(WaitForLedgerUpdate { defunding }, shared),
    };
    match shared.check_and_store(signed.clone()) {
        Ok(shared) => advance(defunding, shared),
        Err(e) => {
            warn!(process_id = %defunding.process_id, error = %e, "invalid ledger commitment");
            failure(defunding.process_id, FailureReason::InvalidCommitment, shared)
        }
    }
}

/// Propose or vote when it is our turn, and finish once the ledger adopted
/// the outcome.
fn advance(defunding: LedgerDefunding, shared: SharedData) -> Result {
    let ledger = match shared.get_channel(defunding.ledger_id) {
        Some(ledger) => ledger,
        None => return failure(defunding.process_id, FailureReason::LedgerChannelMissing, shared),
    };
    let last = ledger.last();
    if is_done(&defunding, last) {
        return success(defunding, shared);
    }

    let next = match ConsensusAttributes::of(last) {
        Ok(_) if consensus::is_proposal_of(last, &defunding.allocation, &defunding.destination) => {
            if ledger.our_turn() {
                consensus::vote(last).ok()
            } else {
                None
            }
        }
        Ok(a) if a.further_votes_required == 0 => {
            if ledger.our_turn() {
                Some(consensus::propose(
                    last,
                    defunding.allocation.clone(),
                    defunding.destination.clone(),
                ))
            } else {
                None
            }
        }
        _ => {
            warn!(process_id = %defunding.process_id, turn_num = last.turn_num, "ledger holds a conflicting proposal");
            return failure(defunding.process_id, FailureReason::InvalidCommitment, shared);
        }
    };

    let shared = match next.map(|c| shared.sign_and_store(c)) {
        Some(Ok((shared, signed))) => {
            debug!(process_id = %defunding.process_id, turn_num = signed.commitment.turn_num, "signed ledger update");
            shared.send_commitment(&defunding.process_id, signed)
        }
        Some(Err(e)) => {
            warn!(process_id = %defunding.process_id, error = %e, "could not sign ledger update");
            return failure(defunding.process_id, FailureReason::InvalidCommitment, shared);
        }
        None => shared,
    };

    let done = shared
        .get_channel(defunding.ledger_id)
        .map_or(false, |l| is_done(&defunding, l.last()));
    if done {
        success(defunding, shared)
    } else {
        with(WaitForLedgerUpdate { defunding }, shared)
    }
}

fn is_done(defunding: &LedgerDefunding, last: &Commitment) -> bool {
    consensus::is_consensus_on(last, &defunding.allocation, &defunding.destination)
}

fn success(defunding: LedgerDefunding, shared: SharedData) -> Result {
    info!(process_id = %defunding.process_id, "ledger defunded");
    with(
        Success {
            process_id: defunding.process_id,
            channel_id: defunding.channel_id,
        },
        shared,
    )
}
