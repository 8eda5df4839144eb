//! Two wallets talking to each other through an in-memory relay and a
//! simulated adjudicator.

use std::collections::BTreeMap;

use channel_wallet::{
    actions::{ConcludingAction, FundingAction, TransactionAction, UserAction, WithdrawalAction},
    dispatcher::{process, ProtocolState},
    outbox::{QueuedTransaction, WalletNotification},
    protocols::{
        concluding::{ConcludingState, InstigatorState, ResponderState},
        funding::FundingStrategy,
        ProcessId,
    },
    shared_data::FundingType,
    sig::Signer,
    transactions::TransactionRequest,
    Address, ChainEvent, Channel, ChannelId, Commitment, Hash, PrivateKey, ProcessOutcome,
    StartProcess, WalletAction, WalletConfig, WalletState, U256,
};
use rand::{rngs::StdRng, Rng, SeedableRng};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};

const APP: Address = Address([0xaa; 20]);

struct Peer {
    address: Address,
    key: PrivateKey,
    wallet: WalletState,
    inbox: UnboundedReceiver<WalletAction>,
    notifications: Vec<WalletNotification>,
}

impl Peer {
    fn apply(&mut self, action: WalletAction) {
        let wallet = std::mem::replace(&mut self.wallet, WalletState::new(WalletConfig::default()));
        self.wallet = wallet.dispatch(action);
    }
}

/// Delivers relay messages in order and executes queued transactions
/// against a fake adjudicator, until nothing is left to do.
struct Network {
    peers: Vec<Peer>,
    senders: Vec<UnboundedSender<WalletAction>>,
    holdings: BTreeMap<ChannelId, U256>,
}

impl Network {
    fn new(n: usize) -> Self {
        // Do not use that on any real device, this is just for testing.
        let mut rng = StdRng::seed_from_u64(7);
        let mut peers = Vec::new();
        let mut senders = Vec::new();
        for _ in 0..n {
            let key: PrivateKey = rng.gen();
            let (tx, rx) = unbounded_channel();
            peers.push(Peer {
                address: Signer::from_private_key(&key).unwrap().address(),
                key,
                wallet: WalletState::new(WalletConfig::default()),
                inbox: rx,
                notifications: Vec::new(),
            });
            senders.push(tx);
        }
        Self {
            peers,
            senders,
            holdings: BTreeMap::new(),
        }
    }

    fn participants(&self) -> Vec<Address> {
        self.peers.iter().map(|p| p.address).collect()
    }

    fn wallet(&self, i: usize) -> &WalletState {
        &self.peers[i].wallet
    }

    /// Both PreFundSetup commitments of a fresh channel, exchanged out of
    /// band.
    fn open_channel(&mut self, nonce: u64, allocation: &[u64]) -> ChannelId {
        let participants = self.participants();
        let channel = Channel::new(APP, nonce, participants.clone());
        let c0 = Commitment::pre_fund_setup(
            channel,
            allocation.iter().map(|a| U256::from(*a)).collect(),
            participants,
            vec![],
        );
        let c1 = c0.next_setup().unwrap();

        let (alice, bob) = self.peers.split_at_mut(1);
        let (alice, bob) = (&mut alice[0], &mut bob[0]);
        let (shared, s0) = alice
            .wallet
            .shared_data
            .sign_and_initialize(c0.clone(), alice.key)
            .unwrap();
        alice.wallet.shared_data = shared;
        bob.wallet.shared_data = bob.wallet.shared_data.check_and_initialize(s0, bob.key).unwrap();
        let (shared, s1) = bob.wallet.shared_data.sign_and_store(c1).unwrap();
        bob.wallet.shared_data = shared;
        alice.wallet.shared_data = alice.wallet.shared_data.check_and_store(s1).unwrap();
        c0.channel_id()
    }

    fn send(&self, to: Address, action: WalletAction) {
        let idx = self
            .peers
            .iter()
            .position(|p| p.address == to)
            .expect("unknown recipient");
        self.senders[idx].send(action).unwrap();
    }

    fn broadcast(&self, event: ChainEvent) {
        for sender in &self.senders {
            sender.send(WalletAction::Chain(event.clone())).unwrap();
        }
    }

    fn execute(&mut self, from: usize, queued: QueuedTransaction) {
        let process_id = queued.process_id;
        for action in [
            TransactionAction::Sent,
            TransactionAction::Submitted {
                transaction_hash: Hash([0x42; 32]),
            },
            TransactionAction::Confirmed,
        ] {
            self.senders[from]
                .send(WalletAction::Transaction {
                    process_id: process_id.clone(),
                    action,
                })
                .unwrap();
        }

        match queued.request {
            TransactionRequest::Deposit {
                channel_id, amount, ..
            } => {
                let held = self.holdings.entry(channel_id).or_default();
                *held = held.saturating_add(amount);
                let total_for_destination = *held;
                self.broadcast(ChainEvent::FundingReceived {
                    channel_id,
                    amount,
                    total_for_destination,
                });
            }
            TransactionRequest::ConcludeAndWithdraw { to, authorization, .. } => {
                let channel_id = to.commitment.channel_id();
                let held = self.holdings.entry(channel_id).or_default();
                *held = held.saturating_sub(authorization.auth.amount);
                self.broadcast(ChainEvent::Concluded { channel_id });
            }
            _ => {}
        }
    }

    /// Hand `action` to peer `i` and run until the network is quiet.
    async fn dispatch(&mut self, i: usize, action: WalletAction) {
        self.senders[i].send(action).unwrap();
        self.run().await;
    }

    async fn run(&mut self) {
        loop {
            let mut progressed = false;
            for i in 0..self.peers.len() {
                while let Ok(action) = self.peers[i].inbox.try_recv() {
                    self.peers[i].apply(action);
                    progressed = true;
                }
                let outbox = self.peers[i].wallet.take_outbox();
                for relay in outbox.relays() {
                    self.send(relay.to, WalletAction::Message(relay.clone()));
                    progressed = true;
                }
                self.peers[i]
                    .notifications
                    .extend(outbox.notifications().cloned());
                for queued in outbox.transaction_outbox {
                    self.execute(i, queued);
                    progressed = true;
                }
            }
            if !progressed {
                break;
            }
            tokio::task::yield_now().await;
        }
    }

    async fn user(&mut self, i: usize, process_id: &ProcessId, action: UserAction) {
        self.dispatch(
            i,
            WalletAction::User {
                process_id: process_id.clone(),
                action,
            },
        )
        .await;
    }

    /// Agree on direct funding, deposit and exchange PostFundSetup.
    async fn fund_directly(&mut self, channel_id: ChannelId) {
        let pid = ProcessId::new(process::FUNDING, channel_id);
        for i in 0..2 {
            self.dispatch(i, WalletAction::Start(StartProcess::Funding { channel_id }))
                .await;
        }
        self.user(
            0,
            &pid,
            UserAction::Funding(FundingAction::StrategyChosen {
                strategy: FundingStrategy::Direct,
            }),
        )
        .await;
        self.user(1, &pid, UserAction::Funding(FundingAction::StrategyApproved))
            .await;
        for i in 0..2 {
            self.user(i, &pid, UserAction::Funding(FundingAction::SuccessAcknowledged))
                .await;
        }
    }
}

#[tokio::test]
async fn direct_funding_end_to_end() {
    let mut net = Network::new(2);
    let channel_id = net.open_channel(0, &[2, 3]);
    net.fund_directly(channel_id).await;

    let pid = ProcessId::new(process::FUNDING, channel_id);
    for i in 0..2 {
        let wallet = net.wallet(i);
        assert!(wallet.processes.is_empty());
        assert_eq!(wallet.finished.get(&pid), Some(&ProcessOutcome::Succeeded));
        let channel = wallet.shared_data.get_channel(channel_id).unwrap();
        assert_eq!(channel.turn_num, 3);
        assert!(channel.funded);
        assert_eq!(
            wallet.shared_data.funding_type(channel_id),
            Some(&FundingType::Direct)
        );
        assert_eq!(wallet.shared_data.holdings(channel_id), U256::from(5));
        assert!(net.peers[i]
            .notifications
            .contains(&WalletNotification::ProcessSucceeded {
                process_id: pid.clone()
            }));
    }
    assert_eq!(net.holdings[&channel_id], U256::from(5));
}

#[tokio::test]
async fn conclude_and_withdraw() {
    let mut net = Network::new(2);
    let channel_id = net.open_channel(0, &[2, 3]);
    net.fund_directly(channel_id).await;

    let pid = ProcessId::new(process::CONCLUDING, channel_id);
    let concluding = |action| UserAction::Concluding(action);

    net.dispatch(0, WalletAction::Start(StartProcess::Conclude { channel_id }))
        .await;
    net.user(0, &pid, concluding(ConcludingAction::ConcludeApproved))
        .await;
    // The instigation started a responder on Bob's side.
    assert!(matches!(
        net.wallet(1).process(&pid),
        Some(ProtocolState::Concluding(_))
    ));
    net.user(1, &pid, concluding(ConcludingAction::ConcludeApproved))
        .await;

    for i in 0..2 {
        assert!(net.wallet(i).shared_data.get_channel(channel_id).unwrap().is_closed());
        let destination = net.peers[i].address;
        net.user(i, &pid, concluding(ConcludingAction::DefundChosen)).await;
        net.user(
            i,
            &pid,
            UserAction::Withdrawal(WithdrawalAction::WithdrawalApproved { destination }),
        )
        .await;
        net.user(i, &pid, UserAction::Withdrawal(WithdrawalAction::SuccessAcknowledged))
            .await;
        net.user(i, &pid, concluding(ConcludingAction::AcknowledgeSuccess))
            .await;
    }

    for i in 0..2 {
        let wallet = net.wallet(i);
        assert_eq!(wallet.finished.get(&pid), Some(&ProcessOutcome::Succeeded));
        assert!(wallet.shared_data.adjudicator(channel_id).finalized);
    }
    assert_eq!(net.holdings[&channel_id], U256::zero());
}

#[tokio::test]
async fn processes_on_other_channels_are_untouched() {
    let mut net = Network::new(2);
    let concluded = net.open_channel(0, &[2, 3]);
    let negotiating = net.open_channel(1, &[4, 4]);
    net.fund_directly(concluded).await;

    let funding = ProcessId::new(process::FUNDING, negotiating);
    for i in 0..2 {
        net.dispatch(i, WalletAction::Start(StartProcess::Funding { channel_id: negotiating }))
            .await;
    }
    let snapshot: Vec<_> = (0..2)
        .map(|i| {
            let wallet = net.wallet(i);
            (
                wallet.process(&funding).cloned(),
                wallet.shared_data.get_channel(negotiating).cloned(),
            )
        })
        .collect();
    assert!(snapshot.iter().all(|(process, _)| process.is_some()));

    let pid = ProcessId::new(process::CONCLUDING, concluded);
    net.dispatch(0, WalletAction::Start(StartProcess::Conclude { channel_id: concluded }))
        .await;
    net.user(0, &pid, UserAction::Concluding(ConcludingAction::ConcludeApproved))
        .await;
    net.user(1, &pid, UserAction::Concluding(ConcludingAction::ConcludeApproved))
        .await;
    net.dispatch(0, WalletAction::Chain(ChainEvent::BlockMined { timestamp: 1_000 }))
        .await;

    for (i, (process, channel)) in snapshot.into_iter().enumerate() {
        let wallet = net.wallet(i);
        assert_eq!(wallet.process(&funding).cloned(), process);
        assert_eq!(wallet.shared_data.get_channel(negotiating).cloned(), channel);
    }

    // Closing the negotiating channel cancels only its own process.
    net.dispatch(0, WalletAction::CloseChannelRequest { channel_id: negotiating })
        .await;
    let alice = net.wallet(0);
    assert_eq!(alice.finished.get(&funding), Some(&ProcessOutcome::Cancelled));
    assert!(alice.process(&pid).is_some());
}

#[tokio::test]
async fn both_sides_start_concluding_at_once() {
    let mut net = Network::new(2);
    let channel_id = net.open_channel(0, &[2, 3]);
    net.fund_directly(channel_id).await;

    let pid = ProcessId::new(process::CONCLUDING, channel_id);
    for i in 0..2 {
        net.dispatch(i, WalletAction::Start(StartProcess::Conclude { channel_id }))
            .await;
    }
    // Alice moves next, Bob's own attempt is refused until she concludes.
    assert!(matches!(
        net.wallet(1).process(&pid),
        Some(ProtocolState::Concluding(ConcludingState::Instigator(
            InstigatorState::AcknowledgeFailure { .. }
        )))
    ));

    net.user(0, &pid, UserAction::Concluding(ConcludingAction::ConcludeApproved))
        .await;
    assert!(matches!(
        net.wallet(1).process(&pid),
        Some(ProtocolState::Concluding(ConcludingState::Responder(
            ResponderState::ApproveConcluding { .. }
        )))
    ));

    net.user(1, &pid, UserAction::Concluding(ConcludingAction::ConcludeApproved))
        .await;
    assert!(matches!(
        net.wallet(0).process(&pid),
        Some(ProtocolState::Concluding(ConcludingState::Instigator(
            InstigatorState::AcknowledgeConcludeReceived { .. }
        )))
    ));
    for i in 0..2 {
        let channel = net.wallet(i).shared_data.get_channel(channel_id).unwrap();
        assert!(channel.is_closed());
        assert_eq!(channel.turn_num, 5);
    }
}
