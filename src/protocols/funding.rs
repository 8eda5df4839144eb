//! Agreeing on a funding strategy, then running it.
//!
//! Player A (participant 0) chooses a strategy and proposes it, player B
//! approves or rejects it. Once approved both sides run the embedded direct
//! or indirect funding protocol under the same process id.

use core::fmt;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::{
    direct_funding::{self, DirectFundingParams, DirectFundingState},
    indirect_funding::{self, IndirectFundingState},
    user_action, with, ProcessId, ProtocolStateWithSharedData,
};
use crate::{
    actions::{FundingAction, UserAction, WalletAction},
    config::WalletConfig,
    outbox::{MessageRelay, RelayPayload},
    shared_data::SharedData,
    types::ChannelId,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FundingStrategy {
    Direct,
    Indirect,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureReason {
    ChannelMissing,
    UserCancelled,
    OpponentCancelled,
    FundingFailed,
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::ChannelMissing => f.write_str("Channel does not exist"),
            FailureReason::UserCancelled => f.write_str("User cancelled"),
            FailureReason::OpponentCancelled => f.write_str("Opponent cancelled"),
            FailureReason::FundingFailed => f.write_str("Funding failed"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum EmbeddedFunding {
    Direct(DirectFundingState),
    Indirect(IndirectFundingState),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FundingState {
    WaitForStrategyChoice {
        process_id: ProcessId,
        channel_id: ChannelId,
    },
    WaitForStrategyResponse {
        process_id: ProcessId,
        channel_id: ChannelId,
        strategy: FundingStrategy,
    },
    WaitForStrategyProposal {
        process_id: ProcessId,
        channel_id: ChannelId,
    },
    WaitForStrategyApproval {
        process_id: ProcessId,
        channel_id: ChannelId,
        strategy: FundingStrategy,
    },
    WaitForFunding {
        process_id: ProcessId,
        channel_id: ChannelId,
        funding: EmbeddedFunding,
    },
    WaitForSuccessConfirmation {
        process_id: ProcessId,
        channel_id: ChannelId,
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

use FundingState::*;

impl FundingState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Success { .. } | Failure { .. })
    }

    pub fn awaiting_user(&self) -> bool {
        match self {
            WaitForStrategyChoice { .. }
            | WaitForStrategyApproval { .. }
            | WaitForSuccessConfirmation { .. } => true,
            WaitForFunding {
                funding: EmbeddedFunding::Direct(s),
                ..
            } => s.awaiting_user(),
            WaitForFunding {
                funding: EmbeddedFunding::Indirect(s),
                ..
            } => s.awaiting_user(),
            _ => false,
        }
    }

    fn negotiating(&self) -> Option<(&ProcessId, ChannelId)> {
        match self {
            WaitForStrategyChoice {
                process_id,
                channel_id,
            }
            | WaitForStrategyResponse {
                process_id,
                channel_id,
                ..
            }
            | WaitForStrategyProposal {
                process_id,
                channel_id,
            }
            | WaitForStrategyApproval {
                process_id,
                channel_id,
                ..
            } => Some((process_id, *channel_id)),
            _ => None,
        }
    }
}

type Result = ProtocolStateWithSharedData<FundingState>;

pub fn initialize(shared: SharedData, process_id: ProcessId, channel_id: ChannelId) -> Result {
    let our_index = match shared.get_channel(channel_id) {
        Some(channel) => channel.our_index,
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
    info!(%process_id, ?channel_id, our_index, "funding started");
    if our_index == 0 {
        with(
            WaitForStrategyChoice {
                process_id,
                channel_id,
            },
            shared,
        )
    } else {
        with(
            WaitForStrategyProposal {
                process_id,
                channel_id,
            },
            shared,
        )
    }
}

pub fn reducer(
    state: FundingState,
    shared: SharedData,
    config: &WalletConfig,
    action: &WalletAction,
) -> Result {
    if let Some((process_id, channel_id)) = state.negotiating() {
        match (user_action(action), relayed(action)) {
            (Some(UserAction::Funding(FundingAction::Cancelled)), _) => {
                let process_id = process_id.clone();
                let shared =
                    shared.send_to_others(channel_id, &process_id, RelayPayload::FundingCancelled);
                return with(
                    Failure {
                        process_id,
                        reason: FailureReason::UserCancelled,
                    },
                    shared,
                );
            }
            (_, Some(RelayPayload::FundingCancelled)) => {
                return with(
                    Failure {
                        process_id: process_id.clone(),
                        reason: FailureReason::OpponentCancelled,
                    },
                    shared,
                );
            }
            _ => {}
        }
    }

    match state {
        WaitForStrategyChoice {
            process_id,
            channel_id,
        } => match user_action(action) {
            Some(UserAction::Funding(FundingAction::StrategyChosen { strategy })) => {
                let strategy = *strategy;
                let shared = shared.send_to_others(
                    channel_id,
                    &process_id,
                    RelayPayload::StrategyProposed { strategy },
                );
                with(
                    WaitForStrategyResponse {
                        process_id,
                        channel_id,
                        strategy,
                    },
                    shared,
                )
            }
            _ => with(
                WaitForStrategyChoice {
                    process_id,
                    channel_id,
                },
                shared,
            ),
        },
        WaitForStrategyResponse {
            process_id,
            channel_id,
            strategy,
        } => match relayed(action) {
            Some(RelayPayload::StrategyApproved { strategy: approved }) if *approved == strategy => {
                start_funding(shared, config, process_id, channel_id, strategy)
            }
            Some(RelayPayload::StrategyRejected) => {
                debug!(%process_id, ?strategy, "strategy rejected");
                with(
                    WaitForStrategyChoice {
                        process_id,
                        channel_id,
                    },
                    shared,
                )
            }
            _ => with(
                WaitForStrategyResponse {
                    process_id,
                    channel_id,
                    strategy,
                },
                shared,
            ),
        },
        WaitForStrategyProposal {
            process_id,
            channel_id,
        } => match relayed(action) {
            Some(RelayPayload::StrategyProposed { strategy }) => with(
                WaitForStrategyApproval {
                    process_id,
                    channel_id,
                    strategy: *strategy,
                },
                shared,
            ),
            _ => with(
                WaitForStrategyProposal {
                    process_id,
                    channel_id,
                },
                shared,
            ),
        },
        WaitForStrategyApproval {
            process_id,
            channel_id,
            strategy,
        } => match user_action(action) {
            Some(UserAction::Funding(FundingAction::StrategyApproved)) => {
                let shared = shared.send_to_others(
                    channel_id,
                    &process_id,
                    RelayPayload::StrategyApproved { strategy },
                );
                start_funding(shared, config, process_id, channel_id, strategy)
            }
            Some(UserAction::Funding(FundingAction::StrategyRejected)) => {
                let shared =
                    shared.send_to_others(channel_id, &process_id, RelayPayload::StrategyRejected);
                with(
                    WaitForStrategyProposal {
                        process_id,
                        channel_id,
                    },
                    shared,
                )
            }
            _ => with(
                WaitForStrategyApproval {
                    process_id,
                    channel_id,
                    strategy,
                },
                shared,
            ),
        },
        WaitForFunding {
            process_id,
            channel_id,
            funding,
        } => {
            let res = match funding {
                EmbeddedFunding::Direct(state) => {
                    direct_funding::reducer(state, shared, action).map(EmbeddedFunding::Direct)
                }
                EmbeddedFunding::Indirect(state) => {
                    indirect_funding::reducer(state, shared, action).map(EmbeddedFunding::Indirect)
                }
            };
            after_funding(process_id, channel_id, res)
        }
        WaitForSuccessConfirmation {
            process_id,
            channel_id,
        } => match user_action(action) {
            Some(UserAction::Funding(FundingAction::SuccessAcknowledged)) => with(
                Success {
                    process_id,
                    channel_id,
                },
                shared,
            ),
            _ => with(
                WaitForSuccessConfirmation {
                    process_id,
                    channel_id,
                },
                shared,
            ),
        },
        state @ (Success { .. } | Failure { .. }) => with(state, shared),
    }
}

fn relayed(action: &WalletAction) -> Option<&RelayPayload> {
    match action {
        WalletAction::Message(MessageRelay { payload, .. }) => Some(payload),
        _ => None,
    }
}

fn start_funding(
    shared: SharedData,
    config: &WalletConfig,
    process_id: ProcessId,
    channel_id: ChannelId,
    strategy: FundingStrategy,
) -> Result {
    info!(%process_id, ?strategy, "funding strategy agreed");
    let res = match strategy {
        FundingStrategy::Direct => {
            let params = match shared.get_channel(channel_id) {
                Some(channel) => DirectFundingParams::for_allocation(
                    process_id.clone(),
                    channel_id,
                    &channel.last().allocation,
                    channel.our_index,
                ),
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
            direct_funding::initialize(shared, params).map(EmbeddedFunding::Direct)
        }
        FundingStrategy::Indirect => {
            indirect_funding::initialize(shared, config, process_id.clone(), channel_id)
                .map(EmbeddedFunding::Indirect)
        }
    };
    after_funding(process_id, channel_id, res)
}

fn after_funding(
    process_id: ProcessId,
    channel_id: ChannelId,
    res: ProtocolStateWithSharedData<EmbeddedFunding>,
) -> Result {
    let (succeeded, failed) = match &res.protocol_state {
        EmbeddedFunding::Direct(s) => (
            matches!(s, DirectFundingState::FundingSuccess { .. }),
            matches!(s, DirectFundingState::FundingFailure { .. }),
        ),
        EmbeddedFunding::Indirect(s) => (s.is_success(), s.failure().is_some()),
    };
    if succeeded {
        with(
            WaitForSuccessConfirmation {
                process_id,
                channel_id,
            },
            res.shared_data,
        )
    } else if failed {
        with(
            Failure {
                process_id,
                reason: FailureReason::FundingFailed,
            },
            res.shared_data,
        )
    } else {
        with(
            WaitForFunding {
                process_id,
                channel_id,
                funding: res.protocol_state,
            },
            res.shared_data,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        test_utils::{message, user, Fixture},
        types::U256,
    };

    fn pid(f: &Fixture) -> ProcessId {
        ProcessId::new("Funding", f.channel.id())
    }

    fn funding(action: FundingAction) -> UserAction {
        UserAction::Funding(action)
    }

    fn relays(shared: &SharedData) -> Vec<RelayPayload> {
        shared.outbox.relays().map(|r| r.payload.clone()).collect()
    }

    #[test]
    fn players_agree_on_direct_funding() {
        let f = Fixture::two_party();
        let setup = f.setup_commitments();
        let a = initialize(f.shared_with(0, &setup[..2]), pid(&f), f.channel.id());
        let b = initialize(f.shared_with(1, &setup[..2]), pid(&f), f.channel.id());
        assert!(matches!(a.protocol_state, WaitForStrategyChoice { .. }));
        assert!(matches!(b.protocol_state, WaitForStrategyProposal { .. }));

        let a = reducer(
            a.protocol_state,
            a.shared_data,
            &f.config,
            &user(&pid(&f), funding(FundingAction::StrategyChosen {
                strategy: FundingStrategy::Direct,
            })),
        );
        let proposal = relays(&a.shared_data).remove(0);
        assert_eq!(
            proposal,
            RelayPayload::StrategyProposed {
                strategy: FundingStrategy::Direct
            }
        );

        let b = reducer(b.protocol_state, b.shared_data, &f.config, &message(&pid(&f), proposal));
        assert!(matches!(
            b.protocol_state,
            WaitForStrategyApproval {
                strategy: FundingStrategy::Direct,
                ..
            }
        ));
        let b = reducer(
            b.protocol_state,
            b.shared_data,
            &f.config,
            &user(&pid(&f), funding(FundingAction::StrategyApproved)),
        );
        // Bob deposits after Alice.
        assert!(matches!(
            b.protocol_state,
            WaitForFunding {
                funding: EmbeddedFunding::Direct(DirectFundingState::NotSafeToDeposit { .. }),
                ..
            }
        ));

        let approval = relays(&b.shared_data).remove(0);
        let a = reducer(a.protocol_state, a.shared_data, &f.config, &message(&pid(&f), approval));
        assert!(matches!(
            a.protocol_state,
            WaitForFunding {
                funding: EmbeddedFunding::Direct(DirectFundingState::WaitForDepositTransaction { .. }),
                ..
            }
        ));
    }

    #[test]
    fn rejection_returns_to_choice() {
        let f = Fixture::two_party();
        let state = WaitForStrategyResponse {
            process_id: pid(&f),
            channel_id: f.channel.id(),
            strategy: FundingStrategy::Indirect,
        };
        let res = reducer(
            state,
            f.running_shared(0),
            &f.config,
            &message(&pid(&f), RelayPayload::StrategyRejected),
        );
        assert!(matches!(res.protocol_state, WaitForStrategyChoice { .. }));
    }

    #[test]
    fn cancellation_notifies_the_opponent() {
        let f = Fixture::two_party();
        let state = WaitForStrategyChoice {
            process_id: pid(&f),
            channel_id: f.channel.id(),
        };
        let res = reducer(
            state,
            f.running_shared(0),
            &f.config,
            &user(&pid(&f), funding(FundingAction::Cancelled)),
        );
        assert_eq!(
            res.protocol_state,
            Failure {
                process_id: pid(&f),
                reason: FailureReason::UserCancelled,
            }
        );
        assert_eq!(relays(&res.shared_data), vec![RelayPayload::FundingCancelled]);

        let state = WaitForStrategyProposal {
            process_id: pid(&f),
            channel_id: f.channel.id(),
        };
        let res = reducer(
            state,
            f.running_shared(1),
            &f.config,
            &message(&pid(&f), RelayPayload::FundingCancelled),
        );
        assert_eq!(
            res.protocol_state,
            Failure {
                process_id: pid(&f),
                reason: FailureReason::OpponentCancelled,
            }
        );
    }

    #[test]
    fn already_funded_channel_waits_for_confirmation() {
        let f = Fixture::two_party();
        let setup = f.setup_commitments();
        // Alice already sent her PostFundSetup.
        let shared = f
            .shared_with(1, &setup[..3])
            .update_adjudicator(f.channel.id(), |a| a.balance = U256::from(5));
        let state = WaitForStrategyApproval {
            process_id: pid(&f),
            channel_id: f.channel.id(),
            strategy: FundingStrategy::Direct,
        };
        let res = reducer(
            state,
            shared,
            &f.config,
            &user(&pid(&f), funding(FundingAction::StrategyApproved)),
        );
        assert!(matches!(res.protocol_state, WaitForSuccessConfirmation { .. }));

        let res = reducer(
            res.protocol_state,
            res.shared_data,
            &f.config,
            &user(&pid(&f), funding(FundingAction::SuccessAcknowledged)),
        );
        assert!(matches!(res.protocol_state, Success { .. }));
    }
}
