//! Funding a channel with on-chain deposits, followed by the PostFundSetup
//! round.
//!
//! Participants deposit in order: it is safe for us to deposit once everybody
//! before us has deposited, i.e. the holdings reach our
//! `safe_to_deposit_level`.

use core::fmt;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::{
    chain_event, received_commitment, transaction_submission as ts, with, ProcessId,
    ProtocolStateWithSharedData,
};
use crate::{
    actions::{ChainEvent, WalletAction},
    commitment::{Commitment, CommitmentType},
    shared_data::{FundingType, SharedData},
    transactions::TransactionRequest,
    types::{ChannelId, U256},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureReason {
    DepositTransactionFailed,
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::DepositTransactionFailed => f.write_str("Deposit transaction failed"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectFundingParams {
    pub process_id: ProcessId,
    pub channel_id: ChannelId,
    pub total_funding_required: U256,
    pub required_deposit: U256,
    pub safe_to_deposit_level: U256,
}

impl DirectFundingParams {
    /// Deposit parameters for participant `our_index` of an allocation,
    /// participants deposit in allocation order.
    pub fn for_allocation(
        process_id: ProcessId,
        channel_id: ChannelId,
        allocation: &[U256],
        our_index: usize,
    ) -> Self {
        let sum = |items: &[U256]| {
            items
                .iter()
                .fold(U256::zero(), |acc, a| acc.saturating_add(*a))
        };
        Self {
            process_id,
            channel_id,
            total_funding_required: sum(allocation),
            required_deposit: allocation.get(our_index).copied().unwrap_or_default(),
            safe_to_deposit_level: sum(&allocation[..our_index.min(allocation.len())]),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DirectFundingState {
    NotSafeToDeposit {
        params: DirectFundingParams,
    },
    WaitForDepositTransaction {
        params: DirectFundingParams,
        transaction_submission: ts::TransactionSubmissionState,
    },
    WaitForFundingAndPostFundSetup {
        params: DirectFundingParams,
        channel_funded: bool,
        post_fund_setup_received: bool,
    },
    FundingSuccess {
        process_id: ProcessId,
        channel_id: ChannelId,
    },
    FundingFailure {
        process_id: ProcessId,
        channel_id: ChannelId,
        reason: FailureReason,
    },
}

use DirectFundingState::*;

impl DirectFundingState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, FundingSuccess { .. } | FundingFailure { .. })
    }

    pub fn awaiting_user(&self) -> bool {
        match self {
            WaitForDepositTransaction {
                transaction_submission,
                ..
            } => transaction_submission.awaiting_user(),
            _ => false,
        }
    }

    fn params(&self) -> Option<&DirectFundingParams> {
        match self {
            NotSafeToDeposit { params }
            | WaitForDepositTransaction { params, .. }
            | WaitForFundingAndPostFundSetup { params, .. } => Some(params),
            FundingSuccess { .. } | FundingFailure { .. } => None,
        }
    }
}

type Result = ProtocolStateWithSharedData<DirectFundingState>;

pub fn initialize(shared: SharedData, params: DirectFundingParams) -> Result {
    let shared = shared.monitor(params.channel_id);
    let holdings = shared.holdings(params.channel_id);
    debug!(process_id = %params.process_id, channel_id = ?params.channel_id, %holdings, "direct funding started");

    if holdings >= params.total_funding_required {
        funded(params, shared, false)
    } else if holdings >= params.safe_to_deposit_level.saturating_add(params.required_deposit) {
        // Our deposit already happened.
        with(
            WaitForFundingAndPostFundSetup {
                params,
                channel_funded: false,
                post_fund_setup_received: false,
            },
            shared,
        )
    } else if holdings >= params.safe_to_deposit_level {
        deposit(params, shared)
    } else {
        with(NotSafeToDeposit { params }, shared)
    }
}

pub fn reducer(state: DirectFundingState, shared: SharedData, action: &WalletAction) -> Result {
    if state.is_terminal() {
        return with(state, shared);
    }

    if let Some(ChainEvent::FundingReceived {
        channel_id,
        total_for_destination,
        ..
    }) = chain_event(action)
    {
        return funding_received(state, shared, *channel_id, *total_for_destination);
    }

    if let Some(signed) = received_commitment(action) {
        let (process_id, channel_id) = match state.params() {
            Some(params) => (params.process_id.clone(), params.channel_id),
            None => return with(state, shared),
        };
        if signed.commitment.channel_id() != channel_id {
            return with(state, shared);
        }
        let shared = match shared.check_and_store(signed.clone()) {
            Ok(shared) => shared,
            Err(e) => {
                warn!(%process_id, error = %e, "ignoring commitment");
                return with(state, shared);
            }
        };
        return match state {
            WaitForFundingAndPostFundSetup {
                params,
                channel_funded,
                post_fund_setup_received,
            } => {
                let post_fund_setup_received = post_fund_setup_received
                    || signed.commitment.commitment_type == CommitmentType::PostFundSetup;
                advance_post_fund_setup(params, shared, channel_funded, post_fund_setup_received)
            }
            state => with(state, shared),
        };
    }

    match state {
        WaitForDepositTransaction {
            params,
            transaction_submission,
        } => {
            let res = ts::reducer(transaction_submission, shared, action);
            match res.protocol_state {
                ts::TransactionSubmissionState::Success { .. } => {
                    let shared = res.shared_data;
                    let channel_funded =
                        shared.holdings(params.channel_id) >= params.total_funding_required;
                    if channel_funded {
                        funded(params, shared, false)
                    } else {
                        with(
                            WaitForFundingAndPostFundSetup {
                                params,
                                channel_funded: false,
                                post_fund_setup_received: false,
                            },
                            shared,
                        )
                    }
                }
                ts::TransactionSubmissionState::Failure { .. } => with(
                    FundingFailure {
                        process_id: params.process_id,
                        channel_id: params.channel_id,
                        reason: FailureReason::DepositTransactionFailed,
                    },
                    res.shared_data,
                ),
                transaction_submission => with(
                    WaitForDepositTransaction {
                        params,
                        transaction_submission,
                    },
                    res.shared_data,
                ),
            }
        }
        state => with(state, shared),
    }
}

fn funding_received(
    state: DirectFundingState,
    shared: SharedData,
    channel_id: ChannelId,
    total: U256,
) -> Result {
    match state {
        NotSafeToDeposit { params } if params.channel_id == channel_id => {
            if total >= params.total_funding_required {
                funded(params, shared, false)
            } else if total >= params.safe_to_deposit_level {
                deposit(params, shared)
            } else {
                with(NotSafeToDeposit { params }, shared)
            }
        }
        WaitForDepositTransaction { params, .. }
            if params.channel_id == channel_id && total >= params.total_funding_required =>
        {
            funded(params, shared, false)
        }
        WaitForFundingAndPostFundSetup {
            params,
            channel_funded: false,
            post_fund_setup_received,
        } if params.channel_id == channel_id && total >= params.total_funding_required => {
            funded(params, shared, post_fund_setup_received)
        }
        state => with(state, shared),
    }
}

fn deposit(params: DirectFundingParams, shared: SharedData) -> Result {
    let request = TransactionRequest::Deposit {
        channel_id: params.channel_id,
        amount: params.required_deposit,
        expected_held: params.safe_to_deposit_level,
    };
    let res = ts::initialize(shared, params.process_id.clone(), request);
    with(
        WaitForDepositTransaction {
            params,
            transaction_submission: res.protocol_state,
        },
        res.shared_data,
    )
}

fn funded(params: DirectFundingParams, shared: SharedData, post_fund_setup_received: bool) -> Result {
    advance_post_fund_setup(params, shared, true, post_fund_setup_received)
}

/// Once funded, send our PostFundSetup commitment when it is our turn and
/// finish when the round is complete.
fn advance_post_fund_setup(
    params: DirectFundingParams,
    shared: SharedData,
    channel_funded: bool,
    post_fund_setup_received: bool,
) -> Result {
    let mut shared = shared;
    if channel_funded {
        if let Some(next) = our_post_fund_setup(&shared, params.channel_id) {
            match shared.sign_and_store(next) {
                Ok((next_shared, signed)) => {
                    shared = next_shared.send_commitment(&params.process_id, signed);
                }
                Err(e) => warn!(process_id = %params.process_id, error = %e, "could not sign PostFundSetup"),
            }
        }
        if setup_complete(&shared, params.channel_id) {
            debug!(process_id = %params.process_id, "direct funding succeeded");
            let shared = shared.set_funding_state(params.channel_id, FundingType::Direct);
            return with(
                FundingSuccess {
                    process_id: params.process_id,
                    channel_id: params.channel_id,
                },
                shared,
            );
        }
    }
    with(
        WaitForFundingAndPostFundSetup {
            params,
            channel_funded,
            post_fund_setup_received,
        },
        shared,
    )
}

fn our_post_fund_setup(shared: &SharedData, channel_id: ChannelId) -> Option<Commitment> {
    let channel = shared.get_channel(channel_id)?;
    if !channel.our_turn() {
        return None;
    }
    channel
        .last()
        .next_setup()
        .filter(|c| c.commitment_type == CommitmentType::PostFundSetup)
}

fn setup_complete(shared: &SharedData, channel_id: ChannelId) -> bool {
    shared.get_channel(channel_id).map_or(false, |c| {
        c.turn_num.saturating_add(1) >= 2 * c.num_participants() as u64
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        actions::TransactionAction,
        test_utils::{
            commitment_received, confirm_transaction, funding_received, queued_transactions,
            sent_commitments, tx, Fixture,
        },
    };

    fn params(f: &Fixture, our_index: usize) -> DirectFundingParams {
        DirectFundingParams::for_allocation(
            ProcessId::new("Funding", f.channel.id()),
            f.channel.id(),
            &f.allocation,
            our_index,
        )
    }

    /// Both PreFundSetup commitments exchanged.
    fn prefunded(f: &Fixture, our_index: usize) -> SharedData {
        let setup = f.setup_commitments();
        f.shared_with(our_index, &setup[..2])
    }

    #[test]
    fn params_follow_allocation_order() {
        let f = Fixture::two_party();
        let b = params(&f, 1);
        assert_eq!(b.total_funding_required, U256::from(5));
        assert_eq!(b.required_deposit, U256::from(3));
        assert_eq!(b.safe_to_deposit_level, U256::from(2));
        assert_eq!(params(&f, 0).safe_to_deposit_level, U256::zero());
    }

    #[test]
    fn first_depositor_deposits_immediately() {
        let f = Fixture::two_party();
        let res = initialize(prefunded(&f, 0), params(&f, 0));
        assert!(matches!(res.protocol_state, WaitForDepositTransaction { .. }));
        assert_eq!(
            queued_transactions(&res.shared_data),
            vec![TransactionRequest::Deposit {
                channel_id: f.channel.id(),
                amount: U256::from(2),
                expected_held: U256::zero(),
            }]
        );
        assert!(res.shared_data.monitored_channels.contains(&f.channel.id()));
    }

    #[test]
    fn second_depositor_waits_until_safe_then_funded() {
        let f = Fixture::two_party();
        let res = initialize(prefunded(&f, 1), params(&f, 1));
        assert!(matches!(res.protocol_state, NotSafeToDeposit { .. }));

        let res = reducer(res.protocol_state, res.shared_data, &funding_received(f.channel.id(), 2));
        assert!(matches!(res.protocol_state, WaitForDepositTransaction { .. }));

        let res = reducer(res.protocol_state, res.shared_data, &funding_received(f.channel.id(), 5));
        assert!(matches!(
            res.protocol_state,
            WaitForFundingAndPostFundSetup {
                channel_funded: true,
                ..
            }
        ));
    }

    #[test]
    fn funding_for_other_channel_is_ignored() {
        let f = Fixture::two_party();
        let res = initialize(prefunded(&f, 1), params(&f, 1));
        let before = res.clone();
        let res = reducer(
            res.protocol_state,
            res.shared_data,
            &funding_received(crate::types::Address([9; 20]), 5),
        );
        assert_eq!(res, before);
    }

    #[test]
    fn player_a_sends_post_fund_setup_when_funded() {
        let f = Fixture::two_party();
        let res = initialize(prefunded(&f, 0), params(&f, 0));
        let mut res = res;
        for action in confirm_transaction(&params(&f, 0).process_id) {
            res = reducer(res.protocol_state, res.shared_data, &action);
        }
        assert!(matches!(
            res.protocol_state,
            WaitForFundingAndPostFundSetup {
                channel_funded: false,
                ..
            }
        ));
        assert!(sent_commitments(&res.shared_data).is_empty());

        let res = reducer(res.protocol_state, res.shared_data, &funding_received(f.channel.id(), 5));
        assert!(matches!(
            res.protocol_state,
            WaitForFundingAndPostFundSetup {
                channel_funded: true,
                ..
            }
        ));
        let sent = sent_commitments(&res.shared_data);
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].commitment, f.setup_commitments()[2]);
    }

    #[test]
    fn player_b_succeeds_on_post_fund_setup() {
        let f = Fixture::two_party();
        let res = initialize(prefunded(&f, 1), params(&f, 1));
        let res = reducer(res.protocol_state, res.shared_data, &funding_received(f.channel.id(), 5));

        let post_fund_0 = f.sign(f.setup_commitments()[2].clone());
        let res = reducer(
            res.protocol_state,
            res.shared_data,
            &commitment_received(&params(&f, 1).process_id, post_fund_0),
        );
        assert!(matches!(res.protocol_state, FundingSuccess { .. }));
        let sent = sent_commitments(&res.shared_data);
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].commitment, f.setup_commitments()[3]);
        assert_eq!(
            res.shared_data.funding_type(f.channel.id()),
            Some(&FundingType::Direct)
        );
        assert!(res.shared_data.get_channel(f.channel.id()).unwrap().funded);
    }

    #[test]
    fn post_fund_setup_before_funding_is_recorded() {
        let f = Fixture::two_party();
        let mut shared = prefunded(&f, 1);
        shared = shared.update_adjudicator(f.channel.id(), |a| a.balance = U256::from(5));
        // Bob already deposited in an earlier run.
        let mut p = params(&f, 1);
        p.total_funding_required = U256::from(6);
        let res = initialize(shared, p.clone());
        assert!(matches!(res.protocol_state, WaitForFundingAndPostFundSetup { .. }));

        let post_fund_0 = f.sign(f.setup_commitments()[2].clone());
        let res = reducer(
            res.protocol_state,
            res.shared_data,
            &commitment_received(&p.process_id, post_fund_0),
        );
        assert!(matches!(
            res.protocol_state,
            WaitForFundingAndPostFundSetup {
                channel_funded: false,
                post_fund_setup_received: true,
                ..
            }
        ));
        assert!(sent_commitments(&res.shared_data).is_empty());

        let res = reducer(res.protocol_state, res.shared_data, &funding_received(f.channel.id(), 6));
        assert!(matches!(res.protocol_state, FundingSuccess { .. }));
    }

    #[test]
    fn deposit_failure_is_terminal() {
        let f = Fixture::two_party();
        let p = params(&f, 0);
        let res = initialize(prefunded(&f, 0), p.clone());
        let res = reducer(res.protocol_state, res.shared_data, &tx(&p.process_id, TransactionAction::Sent));
        let res = reducer(
            res.protocol_state,
            res.shared_data,
            &tx(
                &p.process_id,
                TransactionAction::Submitted {
                    transaction_hash: crate::types::Hash([1; 32]),
                },
            ),
        );
        let res = reducer(res.protocol_state, res.shared_data, &tx(&p.process_id, TransactionAction::Failed));
        assert!(matches!(
            res.protocol_state,
            FundingFailure {
                reason: FailureReason::DepositTransactionFailed,
                ..
            }
        ));
    }
}
