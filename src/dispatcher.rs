//! The top-level wallet state and the action router.
//!
//! [WalletState] is the single owner of the [SharedData] snapshot and of all
//! running protocol processes. It handles one action at a time: starting
//! processes, applying chain events to the adjudicator view, intercepting
//! messages that start a process on our side and routing everything else to
//! the process it is addressed to. Side effects stay in the outbox until the
//! effect runner drains them with [WalletState::take_outbox].

use core::fmt;
use std::collections::{BTreeMap, VecDeque};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::{
    actions::{ChainEvent, StartProcess, WalletAction},
    commitment::SignedCommitment,
    config::WalletConfig,
    outbox::{DisplayEvent, MessageRelay, OutboxState, RelayPayload, WalletNotification},
    protocols::{
        challenging::{self, ChallengerState},
        concluding::{self, ConcludingState},
        defunding::{self, DefundingState},
        funding::{self, FundingState},
        responding,
        virtual_funding::{self, VirtualFundingState},
        ProcessId, ProtocolStateWithSharedData,
    },
    shared_data::{ChallengeRecord, SharedData},
    types::ChannelId,
};

/// Name prefixes of the process ids, both wallets derive the same id for the
/// same protocol and channel.
pub mod process {
    pub const FUNDING: &str = "Funding";
    pub const VIRTUAL_FUNDING: &str = "VirtualFunding";
    pub const CHALLENGING: &str = "Challenging";
    pub const RESPONDING: &str = "Responding";
    pub const CONCLUDING: &str = crate::protocols::concluding::PROTOCOL;
    pub const DEFUNDING: &str = "Defunding";
}

/// State of a top-level protocol.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProtocolState {
    Funding(FundingState),
    VirtualFunding(VirtualFundingState),
    Challenging(ChallengerState),
    Responding(responding::ResponderState),
    Concluding(ConcludingState),
    Defunding(DefundingState),
}

impl ProtocolState {
    pub fn is_terminal(&self) -> bool {
        match self {
            ProtocolState::Funding(s) => s.is_terminal(),
            ProtocolState::VirtualFunding(s) => s.is_terminal(),
            ProtocolState::Challenging(s) => s.is_terminal(),
            ProtocolState::Responding(s) => s.is_terminal(),
            ProtocolState::Concluding(s) => s.is_terminal(),
            ProtocolState::Defunding(s) => s.is_terminal(),
        }
    }

    /// Whether the process is blocked on a user decision rather than on
    /// peers or the chain.
    pub fn awaiting_user(&self) -> bool {
        match self {
            ProtocolState::Funding(s) => s.awaiting_user(),
            ProtocolState::VirtualFunding(s) => s.awaiting_user(),
            ProtocolState::Challenging(s) => s.awaiting_user(),
            ProtocolState::Responding(s) => s.awaiting_user(),
            ProtocolState::Concluding(s) => s.awaiting_user(),
            ProtocolState::Defunding(s) => s.awaiting_user(),
        }
    }

    /// `None` while the process is still running.
    pub fn outcome(&self) -> Option<ProcessOutcome> {
        use ProtocolState::*;

        match self {
            Funding(FundingState::Failure { reason, .. }) => Some(ProcessOutcome::failed(reason)),
            VirtualFunding(VirtualFundingState::Failure { reason, .. }) => {
                Some(ProcessOutcome::failed(reason))
            }
            Challenging(ChallengerState::Failure { reason, .. }) => Some(ProcessOutcome::failed(reason)),
            Responding(responding::ResponderState::Failure { reason, .. }) => {
                Some(ProcessOutcome::failed(reason))
            }
            Defunding(DefundingState::Failure { reason, .. }) => Some(ProcessOutcome::failed(reason)),
            Concluding(s) => match s.failure_reason() {
                Some(reason) => Some(ProcessOutcome::failed(reason)),
                None if s.is_terminal() => Some(ProcessOutcome::Succeeded),
                None => None,
            },
            s if s.is_terminal() => Some(ProcessOutcome::Succeeded),
            _ => None,
        }
    }

    fn reduce(
        self,
        shared: SharedData,
        config: &WalletConfig,
        action: &WalletAction,
    ) -> ProtocolStateWithSharedData<ProtocolState> {
        match self {
            ProtocolState::Funding(s) => {
                funding::reducer(s, shared, config, action).map(ProtocolState::Funding)
            }
            ProtocolState::VirtualFunding(s) => {
                virtual_funding::reducer(s, shared, action).map(ProtocolState::VirtualFunding)
            }
            ProtocolState::Challenging(s) => {
                challenging::reducer(s, shared, action).map(ProtocolState::Challenging)
            }
            ProtocolState::Responding(s) => {
                responding::reducer(s, shared, action).map(ProtocolState::Responding)
            }
            ProtocolState::Concluding(s) => {
                concluding::reducer(s, shared, action).map(ProtocolState::Concluding)
            }
            ProtocolState::Defunding(s) => {
                defunding::reducer(s, shared, action).map(ProtocolState::Defunding)
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProcessOutcome {
    Succeeded,
    Failed { reason: String },
    Cancelled,
}

impl ProcessOutcome {
    fn failed(reason: impl fmt::Display) -> Self {
        ProcessOutcome::Failed {
            reason: reason.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunningProcess {
    /// Channel the process was started for.
    pub channel_id: ChannelId,
    pub state: ProtocolState,
}

/// Outcomes of recently finished processes, oldest forgotten first.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FinishedProcesses {
    outcomes: BTreeMap<ProcessId, ProcessOutcome>,
    order: VecDeque<ProcessId>,
}

impl FinishedProcesses {
    pub fn get(&self, process_id: &ProcessId) -> Option<&ProcessOutcome> {
        self.outcomes.get(process_id)
    }

    pub fn len(&self) -> usize {
        self.outcomes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.outcomes.is_empty()
    }

    fn record(&mut self, process_id: ProcessId, outcome: ProcessOutcome, capacity: usize) {
        if self.outcomes.insert(process_id.clone(), outcome).is_some() {
            self.order.retain(|id| *id != process_id);
        }
        self.order.push_back(process_id);
        while self.order.len() > capacity {
            match self.order.pop_front() {
                Some(oldest) => {
                    debug!(process_id = %oldest, "outcome forgotten");
                    self.outcomes.remove(&oldest);
                }
                None => break,
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalletState {
    pub config: WalletConfig,
    pub shared_data: SharedData,
    pub processes: BTreeMap<ProcessId, RunningProcess>,
    pub finished: FinishedProcesses,
}

impl WalletState {
    pub fn new(config: WalletConfig) -> Self {
        Self {
            config,
            shared_data: SharedData::default(),
            processes: BTreeMap::new(),
            finished: FinishedProcesses::default(),
        }
    }

    pub fn with_shared_data(mut self, shared_data: SharedData) -> Self {
        self.shared_data = shared_data;
        self
    }

    pub fn process(&self, process_id: &ProcessId) -> Option<&ProtocolState> {
        self.processes.get(process_id).map(|p| &p.state)
    }

    pub fn processes_awaiting_user(&self) -> impl Iterator<Item = &ProcessId> {
        self.processes
            .iter()
            .filter(|(_, p)| p.state.awaiting_user())
            .map(|(id, _)| id)
    }

    /// Handle a single action.
    pub fn dispatch(mut self, action: WalletAction) -> Self {
        match &action {
            WalletAction::Start(start) => self.start(start),
            WalletAction::Chain(event) => self.on_chain_event(event, &action),
            WalletAction::Cancel { process_id } => self.cancel(process_id),
            WalletAction::CloseChannelRequest { channel_id } => self.close_channel(*channel_id),
            WalletAction::Message(MessageRelay {
                process_id,
                payload: RelayPayload::ConcludeInstigated { signed_commitment },
                ..
            }) if self.yields_to_responder(process_id) => {
                self.start_concluding_responder(process_id.clone(), signed_commitment.clone())
            }
            _ => match action.process_id() {
                Some(process_id) => self.step(process_id, &action),
                None => debug!("action without a process ignored"),
            },
        }
        self
    }

    /// Drain the side effects accumulated so far.
    pub fn take_outbox(&mut self) -> OutboxState {
        self.shared_data.take_outbox()
    }

    fn start(&mut self, start: &StartProcess) {
        let (process_id, channel_id) = match start {
            StartProcess::Funding { channel_id } => (process::FUNDING, *channel_id),
            StartProcess::VirtualFunding {
                target_channel_id, ..
            } => (process::VIRTUAL_FUNDING, *target_channel_id),
            StartProcess::Challenge { channel_id } => (process::CHALLENGING, *channel_id),
            StartProcess::Conclude { channel_id } => (process::CONCLUDING, *channel_id),
            StartProcess::Defund { channel_id } => (process::DEFUNDING, *channel_id),
        };
        let process_id = ProcessId::new(process_id, channel_id);
        if self.processes.contains_key(&process_id) {
            debug!(%process_id, "process already running");
            return;
        }
        info!(%process_id, "starting process");

        let config = self.config.clone();
        let pid = process_id.clone();
        self.launch(process_id, channel_id, move |shared| match start {
            StartProcess::Funding { channel_id } => {
                funding::initialize(shared, pid, *channel_id).map(ProtocolState::Funding)
            }
            StartProcess::VirtualFunding {
                target_channel_id,
                target_participants,
                target_allocation,
                hub,
                nonce,
                private_key,
            } => virtual_funding::initialize(
                shared,
                &config,
                pid,
                *target_channel_id,
                target_participants,
                target_allocation.clone(),
                *hub,
                *nonce,
                *private_key,
            )
            .map(ProtocolState::VirtualFunding),
            StartProcess::Challenge { channel_id } => {
                challenging::initialize(shared, &config, pid, *channel_id)
                    .map(ProtocolState::Challenging)
            }
            StartProcess::Conclude { channel_id } => {
                concluding::instigator::initialize(shared, pid, *channel_id)
                    .map(|s| ProtocolState::Concluding(ConcludingState::Instigator(s)))
            }
            StartProcess::Defund { channel_id } => {
                defunding::initialize(shared, pid, *channel_id).map(ProtocolState::Defunding)
            }
        });
    }

    /// The opponent's Conclude starts a responder, replacing an instigator
    /// of ours that never got to sign.
    fn yields_to_responder(&self, process_id: &ProcessId) -> bool {
        match self.process(process_id) {
            None => true,
            Some(ProtocolState::Concluding(ConcludingState::Instigator(s))) => {
                s.superseded_by_opponent()
            }
            Some(_) => false,
        }
    }

    fn start_concluding_responder(&mut self, process_id: ProcessId, signed: SignedCommitment) {
        let channel_id = signed.commitment.channel_id();
        info!(%process_id, "opponent instigated concluding");
        let pid = process_id.clone();
        self.launch(process_id, channel_id, move |shared| {
            concluding::responder::initialize(shared, pid, signed)
                .map(|s| ProtocolState::Concluding(ConcludingState::Responder(s)))
        });
    }

    fn on_chain_event(&mut self, event: &ChainEvent, action: &WalletAction) {
        self.shared_data = record_chain_event(core::mem::take(&mut self.shared_data), event);

        let running: Vec<ProcessId> = self.processes.keys().cloned().collect();
        for process_id in running {
            self.step(&process_id, action);
        }

        if let ChainEvent::ChallengeCreated {
            channel_id,
            commitment,
            finalized_at,
        } = event
        {
            let ours = ProcessId::new(process::CHALLENGING, *channel_id);
            let process_id = ProcessId::new(process::RESPONDING, *channel_id);
            // A challenge on our own commitment is never answered by us, even
            // after our challenger has finished.
            let by_opponent = self
                .shared_data
                .get_channel(*channel_id)
                .map_or(false, |c| commitment.commitment.mover() != Some(c.address));
            if by_opponent
                && !self.processes.contains_key(&ours)
                && !self.processes.contains_key(&process_id)
            {
                info!(%process_id, "challenge detected");
                self.shared_data = core::mem::take(&mut self.shared_data).notify(
                    WalletNotification::ChallengeDetected {
                        channel_id: *channel_id,
                    },
                );
                let pid = process_id.clone();
                let (channel_id, commitment, expiry) = (*channel_id, commitment.clone(), *finalized_at);
                self.launch(process_id, channel_id, move |shared| {
                    responding::initialize(shared, pid, channel_id, commitment, expiry)
                        .map(ProtocolState::Responding)
                });
            }
        }
    }

    fn launch(
        &mut self,
        process_id: ProcessId,
        channel_id: ChannelId,
        init: impl FnOnce(SharedData) -> ProtocolStateWithSharedData<ProtocolState>,
    ) {
        let shared = core::mem::take(&mut self.shared_data)
            .monitor(channel_id)
            .display(DisplayEvent::ShowWallet);
        let res = init(shared);
        self.shared_data = res.shared_data;
        self.settle(process_id, channel_id, res.protocol_state);
    }

    /// Reduce `action` with the process it is addressed to.
    fn step(&mut self, process_id: &ProcessId, action: &WalletAction) {
        let process = match self.processes.remove(process_id) {
            Some(process) => process,
            None => {
                warn!(%process_id, "no such process, action dropped");
                return;
            }
        };
        let shared = core::mem::take(&mut self.shared_data);
        let res = process.state.reduce(shared, &self.config, action);
        self.shared_data = res.shared_data;
        self.settle(process_id.clone(), process.channel_id, res.protocol_state);
    }

    /// Keep a running process, or retire a terminal one.
    fn settle(&mut self, process_id: ProcessId, channel_id: ChannelId, state: ProtocolState) {
        let outcome = match state.outcome() {
            Some(outcome) => outcome,
            None => {
                self.processes
                    .insert(process_id, RunningProcess { channel_id, state });
                return;
            }
        };
        let notification = match &outcome {
            ProcessOutcome::Failed { reason } => {
                info!(%process_id, %reason, "process failed");
                WalletNotification::ProcessFailed {
                    process_id: process_id.clone(),
                    reason: reason.clone(),
                }
            }
            _ => {
                info!(%process_id, "process succeeded");
                WalletNotification::ProcessSucceeded {
                    process_id: process_id.clone(),
                }
            }
        };
        self.shared_data = core::mem::take(&mut self.shared_data)
            .notify(notification)
            .display(DisplayEvent::HideWallet);
        self.finished
            .record(process_id, outcome, self.config.finished_capacity);
    }

    /// Cancelling a process that is not running is a no-op.
    fn cancel(&mut self, process_id: &ProcessId) {
        let process = match self.processes.remove(process_id) {
            Some(process) => process,
            None => {
                debug!(%process_id, "nothing to cancel");
                return;
            }
        };
        info!(%process_id, "process cancelled");
        self.shared_data = core::mem::take(&mut self.shared_data)
            .stop_monitoring(process.channel_id)
            .display(DisplayEvent::HideWallet);
        self.finished.record(
            process_id.clone(),
            ProcessOutcome::Cancelled,
            self.config.finished_capacity,
        );
    }

    fn close_channel(&mut self, channel_id: ChannelId) {
        let on_channel: Vec<ProcessId> = self
            .processes
            .iter()
            .filter(|(_, p)| p.channel_id == channel_id)
            .map(|(id, _)| id.clone())
            .collect();
        for process_id in &on_channel {
            self.cancel(process_id);
        }
        self.shared_data = core::mem::take(&mut self.shared_data).stop_monitoring(channel_id);
    }
}

/// Mirror a chain event into our view of the adjudicator.
fn record_chain_event(shared: SharedData, event: &ChainEvent) -> SharedData {
    match event {
        ChainEvent::FundingReceived {
            channel_id,
            total_for_destination,
            ..
        } => shared.update_adjudicator(*channel_id, |a| a.balance = *total_for_destination),
        ChainEvent::ChallengeCreated {
            channel_id,
            commitment,
            finalized_at,
        } => shared.update_adjudicator(*channel_id, |a| {
            a.challenge = Some(ChallengeRecord {
                expires_at: *finalized_at,
                commitment: commitment.commitment.clone(),
            })
        }),
        ChainEvent::RespondWithMove { channel_id, .. } => {
            shared.update_adjudicator(*channel_id, |a| a.challenge = None)
        }
        ChainEvent::Concluded { channel_id } => {
            shared.update_adjudicator(*channel_id, |a| a.finalized = true)
        }
        ChainEvent::BlockMined { timestamp } => SharedData {
            block_timestamp: *timestamp,
            ..shared
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        actions::{ConcludingAction, UserAction},
        protocols::concluding::{InstigatorState, ResponderState},
        test_utils::{chain, funding_received, user, Fixture},
        types::U256,
    };

    fn wallet(f: &Fixture, shared: SharedData) -> WalletState {
        WalletState::new(f.config.clone()).with_shared_data(shared)
    }

    fn concluding(f: &Fixture) -> ProcessId {
        ProcessId::new(process::CONCLUDING, f.channel.id())
    }

    #[test]
    fn starting_a_running_process_is_ignored() {
        let f = Fixture::two_party();
        let start = WalletAction::Start(StartProcess::Conclude {
            channel_id: f.channel.id(),
        });
        let once = wallet(&f, f.running_shared(0)).dispatch(start.clone());
        assert!(matches!(
            once.process(&concluding(&f)),
            Some(ProtocolState::Concluding(ConcludingState::Instigator(
                InstigatorState::ApproveConcluding { .. }
            )))
        ));
        assert!(once.shared_data.monitored_channels.contains(&f.channel.id()));
        let twice = once.clone().dispatch(start);
        assert_eq!(once, twice);
    }

    #[test]
    fn actions_for_unknown_processes_are_dropped() {
        let f = Fixture::two_party();
        let before = wallet(&f, f.running_shared(0));
        let after = before.clone().dispatch(user(
            &concluding(&f),
            UserAction::Concluding(ConcludingAction::ConcludeApproved),
        ));
        assert_eq!(before, after);
    }

    #[test]
    fn conclude_instigation_starts_responder() {
        let f = Fixture::two_party();
        let mut alice = wallet(&f, f.running_shared(0))
            .dispatch(WalletAction::Start(StartProcess::Conclude {
                channel_id: f.channel.id(),
            }))
            .dispatch(user(
                &concluding(&f),
                UserAction::Concluding(ConcludingAction::ConcludeApproved),
            ));
        let relays: Vec<_> = alice.take_outbox().relays().cloned().collect();
        assert_eq!(relays.len(), 1);

        let bob = relays
            .into_iter()
            .fold(wallet(&f, f.running_shared(1)), |bob, relay| {
                bob.dispatch(WalletAction::Message(relay))
            });
        assert!(matches!(
            bob.process(&concluding(&f)),
            Some(ProtocolState::Concluding(ConcludingState::Responder(
                ResponderState::ApproveConcluding { .. }
            )))
        ));
    }

    #[test]
    fn terminal_processes_are_retired() {
        let f = Fixture::two_party();
        // Bob moved last, so Bob cannot conclude.
        let mut bob = wallet(&f, f.running_shared(1))
            .dispatch(WalletAction::Start(StartProcess::Conclude {
                channel_id: f.channel.id(),
            }))
            .dispatch(user(
                &concluding(&f),
                UserAction::Concluding(ConcludingAction::AcknowledgeFailure),
            ));
        assert!(bob.processes.is_empty());
        assert_eq!(
            bob.finished.get(&concluding(&f)),
            Some(&ProcessOutcome::Failed {
                reason: "It is not your turn".to_string()
            })
        );
        let outbox = bob.take_outbox();
        assert!(outbox.notifications().any(|n| matches!(
            n,
            WalletNotification::ProcessFailed { process_id, .. } if *process_id == concluding(&f)
        )));
        assert_eq!(
            outbox.display_outbox,
            vec![DisplayEvent::ShowWallet, DisplayEvent::HideWallet]
        );
    }

    #[test]
    fn challenge_by_opponent_starts_responder() {
        let f = Fixture::two_party();
        let (_, b) = f.running_commitments();
        let mut alice = wallet(&f, f.running_shared(0)).dispatch(chain(ChainEvent::ChallengeCreated {
            channel_id: f.channel.id(),
            commitment: f.sign(b.clone()),
            finalized_at: 1_000,
        }));
        let responding = ProcessId::new(process::RESPONDING, f.channel.id());
        assert!(matches!(
            alice.process(&responding),
            Some(ProtocolState::Responding(_))
        ));
        assert_eq!(
            alice.shared_data.adjudicator(f.channel.id()).challenge,
            Some(ChallengeRecord {
                expires_at: 1_000,
                commitment: b,
            })
        );
        assert!(alice
            .take_outbox()
            .notifications()
            .any(|n| *n == WalletNotification::ChallengeDetected { channel_id: f.channel.id() }));
    }

    #[test]
    fn own_challenge_does_not_start_responder() {
        let f = Fixture::two_party();
        let (_, b) = f.running_commitments();
        let bob = wallet(&f, f.running_shared(1))
            .dispatch(WalletAction::Start(StartProcess::Challenge {
                channel_id: f.channel.id(),
            }))
            .dispatch(chain(ChainEvent::ChallengeCreated {
                channel_id: f.channel.id(),
                commitment: f.sign(b),
                finalized_at: 1_000,
            }));
        assert!(bob
            .process(&ProcessId::new(process::CHALLENGING, f.channel.id()))
            .is_some());
        assert!(bob
            .process(&ProcessId::new(process::RESPONDING, f.channel.id()))
            .is_none());
    }

    #[test]
    fn own_challenge_is_ignored_without_a_challenger() {
        let f = Fixture::two_party();
        let (_, b) = f.running_commitments();
        let mut bob = wallet(&f, f.running_shared(1)).dispatch(chain(ChainEvent::ChallengeCreated {
            channel_id: f.channel.id(),
            commitment: f.sign(b.clone()),
            finalized_at: 1_000,
        }));
        assert!(bob.processes.is_empty());
        assert_eq!(
            bob.shared_data.adjudicator(f.channel.id()).challenge,
            Some(ChallengeRecord {
                expires_at: 1_000,
                commitment: b,
            })
        );
        assert!(!bob
            .take_outbox()
            .notifications()
            .any(|n| matches!(n, WalletNotification::ChallengeDetected { .. })));
    }

    #[test]
    fn oldest_outcomes_are_forgotten() {
        let f = Fixture::two_party();
        let ids: Vec<ProcessId> = [process::FUNDING, process::CHALLENGING, process::CONCLUDING]
            .iter()
            .map(|name| ProcessId::new(name, f.channel.id()))
            .collect();
        let mut finished = FinishedProcesses::default();
        for id in &ids {
            finished.record(id.clone(), ProcessOutcome::Cancelled, 2);
        }
        assert_eq!(finished.len(), 2);
        assert_eq!(finished.get(&ids[0]), None);

        // Finishing again makes an outcome the newest.
        finished.record(ids[1].clone(), ProcessOutcome::Succeeded, 2);
        finished.record(ids[0].clone(), ProcessOutcome::Cancelled, 2);
        assert_eq!(finished.get(&ids[1]), Some(&ProcessOutcome::Succeeded));
        assert_eq!(finished.get(&ids[0]), Some(&ProcessOutcome::Cancelled));
        assert_eq!(finished.get(&ids[2]), None);
    }

    #[test]
    fn cancelled_outcomes_respect_the_capacity() {
        let f = Fixture::two_party();
        let config = WalletConfig {
            finished_capacity: 1,
            ..f.config.clone()
        };
        let state = WalletState::new(config)
            .with_shared_data(f.running_shared(0))
            .dispatch(WalletAction::Start(StartProcess::Conclude {
                channel_id: f.channel.id(),
            }))
            .dispatch(WalletAction::Cancel {
                process_id: concluding(&f),
            })
            .dispatch(WalletAction::Start(StartProcess::Challenge {
                channel_id: f.channel.id(),
            }))
            .dispatch(WalletAction::Cancel {
                process_id: ProcessId::new(process::CHALLENGING, f.channel.id()),
            });
        assert_eq!(state.finished.len(), 1);
        assert_eq!(state.finished.get(&concluding(&f)), None);
    }

    #[test]
    fn chain_events_update_adjudicator_view() {
        let f = Fixture::two_party();
        let id = f.channel.id();
        let state = wallet(&f, f.running_shared(0))
            .dispatch(funding_received(id, 5))
            .dispatch(chain(ChainEvent::BlockMined { timestamp: 42 }))
            .dispatch(chain(ChainEvent::Concluded { channel_id: id }));
        let adjudicator = state.shared_data.adjudicator(id);
        assert_eq!(adjudicator.balance, U256::from(5));
        assert!(adjudicator.finalized);
        assert_eq!(state.shared_data.block_timestamp, 42);
    }

    #[test]
    fn cancellation_is_idempotent() {
        let f = Fixture::two_party();
        let cancel = WalletAction::Cancel {
            process_id: concluding(&f),
        };
        let once = wallet(&f, f.running_shared(0))
            .dispatch(WalletAction::Start(StartProcess::Conclude {
                channel_id: f.channel.id(),
            }))
            .dispatch(cancel.clone());
        assert!(once.processes.is_empty());
        assert_eq!(once.finished.get(&concluding(&f)), Some(&ProcessOutcome::Cancelled));
        assert!(!once.shared_data.monitored_channels.contains(&f.channel.id()));

        let twice = once.clone().dispatch(cancel);
        assert_eq!(once, twice);
    }

    #[test]
    fn approval_is_awaited_from_the_user() {
        let f = Fixture::two_party();
        let state = wallet(&f, f.running_shared(0)).dispatch(WalletAction::Start(
            StartProcess::Conclude {
                channel_id: f.channel.id(),
            },
        ));
        assert_eq!(
            state.processes_awaiting_user().collect::<Vec<_>>(),
            vec![&concluding(&f)]
        );

        let state = state.dispatch(WalletAction::User {
            process_id: concluding(&f),
            action: UserAction::Concluding(ConcludingAction::ConcludeApproved),
        });
        assert!(state.process(&concluding(&f)).is_some());
        assert_eq!(state.processes_awaiting_user().count(), 0);
    }

    #[test]
    fn close_channel_request_cancels_its_processes() {
        let f = Fixture::two_party();
        let close = WalletAction::CloseChannelRequest {
            channel_id: f.channel.id(),
        };
        let once = wallet(&f, f.running_shared(0))
            .dispatch(WalletAction::Start(StartProcess::Conclude {
                channel_id: f.channel.id(),
            }))
            .dispatch(close.clone());
        assert!(once.processes.is_empty());
        let twice = once.clone().dispatch(close);
        assert_eq!(once, twice);
    }
}
