//! Fixtures shared by the unit tests.

use rand::{rngs::StdRng, Rng, SeedableRng};

use crate::{
    actions::{ChainEvent, TransactionAction, UserAction, WalletAction},
    channel_store::{ChannelStage, ChannelState, ChannelStore},
    commitment::{consensus::ConsensusAttributes, Channel, Commitment, SignedCommitment},
    config::WalletConfig,
    outbox::{MessageRelay, RelayPayload},
    protocols::{ProcessId, ProtocolLocator},
    shared_data::SharedData,
    sig::Signer,
    transactions::TransactionRequest,
    types::{Address, PrivateKey, U256},
};

pub const APP: Address = Address([0xaa; 20]);
pub const CONSENSUS_LIBRARY: Address = Address([0xcc; 20]);

pub struct Fixture {
    pub alice: Signer,
    pub bob: Signer,
    pub hub: Signer,
    keys: [PrivateKey; 3],
    pub channel: Channel,
    pub allocation: Vec<U256>,
    pub config: WalletConfig,
}

impl Fixture {
    fn with_participants(n: usize) -> Self {
        // Do not use that on any real device, this is just for testing.
        let mut rng = StdRng::seed_from_u64(0);
        let keys: [PrivateKey; 3] = [rng.gen(), rng.gen(), rng.gen()];
        let signers: Vec<Signer> = keys
            .iter()
            .map(|k| Signer::from_private_key(k).unwrap())
            .collect();
        let participants: Vec<Address> = signers.iter().take(n).map(|s| s.address()).collect();
        let allocation = [2u64, 3, 5]
            .iter()
            .take(n)
            .map(|a| U256::from(*a))
            .collect();

        Self {
            alice: signers[0].clone(),
            bob: signers[1].clone(),
            hub: signers[2].clone(),
            keys,
            channel: Channel::new(APP, 0, participants),
            allocation,
            config: WalletConfig {
                consensus_library: CONSENSUS_LIBRARY,
                challenge_duration: 300,
                finished_capacity: 16,
            },
        }
    }

    /// Alice and Bob.
    pub fn two_party() -> Self {
        Self::with_participants(2)
    }

    /// Alice, Bob and the hub.
    pub fn three_party() -> Self {
        Self::with_participants(3)
    }

    /// Key of alice (0), bob (1) or the hub (2).
    pub fn key(&self, idx: usize) -> PrivateKey {
        self.keys[idx]
    }

    pub fn signer(&self, address: Address) -> &Signer {
        [&self.alice, &self.bob, &self.hub]
            .into_iter()
            .find(|s| s.address() == address)
            .unwrap()
    }

    pub fn key_of(&self, address: Address) -> PrivateKey {
        let idx = [&self.alice, &self.bob, &self.hub]
            .iter()
            .position(|s| s.address() == address)
            .unwrap();
        self.keys[idx]
    }

    /// Sign with the key of the commitment's mover.
    pub fn sign(&self, commitment: Commitment) -> SignedCommitment {
        let signer = self.signer(commitment.mover().unwrap());
        SignedCommitment::sign(commitment, signer).unwrap()
    }

    pub fn pre_fund_setup(&self) -> Commitment {
        Commitment::pre_fund_setup(
            self.channel.clone(),
            self.allocation.clone(),
            self.channel.participants.clone(),
            vec![],
        )
    }

    /// PreFundSetup and PostFundSetup rounds, `2n` commitments.
    pub fn setup_commitments(&self) -> Vec<Commitment> {
        setup_from(self.pre_fund_setup())
    }

    /// Two app commitments following a complete setup.
    pub fn running_commitments(&self) -> (Commitment, Commitment) {
        let setup = self.setup_commitments();
        let a = setup[setup.len() - 1].next_app(vec![1]);
        let b = a.next_app(vec![2]);
        (a, b)
    }

    pub fn ledger_channel(&self) -> Channel {
        Channel::new(
            CONSENSUS_LIBRARY,
            self.channel.nonce,
            self.channel.participants.clone(),
        )
    }

    pub fn ledger_pre_fund_setup(&self) -> Commitment {
        let attributes =
            ConsensusAttributes::consensus(&self.allocation, &self.channel.participants);
        Commitment::pre_fund_setup(
            self.ledger_channel(),
            self.allocation.clone(),
            self.channel.participants.clone(),
            attributes.to_bytes(),
        )
    }

    pub fn ledger_setup_commitments(&self) -> Vec<Commitment> {
        setup_from(self.ledger_pre_fund_setup())
    }

    /// Two consensus commitments of the ledger channel following its setup.
    pub fn running_consensus_commitments(&self) -> (Commitment, Commitment) {
        let setup = self.ledger_setup_commitments();
        let last = &setup[setup.len() - 1];
        let a = last.next_app(last.app_attributes.clone());
        let b = a.next_app(a.app_attributes.clone());
        (a, b)
    }

    /// A store holding the last (at most) two of `commitments` for the
    /// participant with index `our_index`.
    pub fn store_with(&self, our_index: usize, commitments: &[Commitment]) -> ChannelStore {
        let last = commitments.last().unwrap();
        let penultimate = commitments
            .len()
            .checked_sub(2)
            .map(|i| self.sign(commitments[i].clone()));
        let address = last.channel.participants[our_index];
        ChannelStore::default().set_channel(ChannelState {
            channel_id: last.channel_id(),
            address,
            private_key: self.key_of(address),
            channel: last.channel.clone(),
            our_index,
            turn_num: last.turn_num,
            last_commitment: self.sign(last.clone()),
            penultimate_commitment: penultimate,
            funded: false,
            stage: ChannelStage::after(last.commitment_type),
        })
    }

    pub fn shared_with(&self, our_index: usize, commitments: &[Commitment]) -> SharedData {
        SharedData {
            channel_store: self.store_with(our_index, commitments),
            ..SharedData::default()
        }
    }

    /// Shared data with a fully set up and running app channel.
    pub fn running_shared(&self, our_index: usize) -> SharedData {
        let (a, b) = self.running_commitments();
        self.shared_with(our_index, &[a, b])
    }
}

fn setup_from(first: Commitment) -> Vec<Commitment> {
    let mut commitments = vec![first];
    while let Some(next) = commitments[commitments.len() - 1].next_setup() {
        commitments.push(next);
    }
    commitments
}

/// Add a channel from another fixture snapshot to `shared`.
pub fn merge_channel(shared: SharedData, other: &SharedData, channel_id: crate::types::ChannelId) -> SharedData {
    let state = other.get_channel(channel_id).unwrap().clone();
    shared.set_channel(state)
}

pub fn commitment_received(process_id: &ProcessId, signed_commitment: SignedCommitment) -> WalletAction {
    WalletAction::Message(MessageRelay {
        to: Address::default(),
        process_id: process_id.clone(),
        payload: RelayPayload::Commitment { signed_commitment },
    })
}

pub fn commitments_received(
    process_id: &ProcessId,
    protocol_locator: ProtocolLocator,
    signed_commitments: Vec<SignedCommitment>,
) -> WalletAction {
    WalletAction::Message(MessageRelay {
        to: Address::default(),
        process_id: process_id.clone(),
        payload: RelayPayload::Commitments {
            protocol_locator,
            signed_commitments,
        },
    })
}

pub fn message(process_id: &ProcessId, payload: RelayPayload) -> WalletAction {
    WalletAction::Message(MessageRelay {
        to: Address::default(),
        process_id: process_id.clone(),
        payload,
    })
}

pub fn user(process_id: &ProcessId, action: UserAction) -> WalletAction {
    WalletAction::User {
        process_id: process_id.clone(),
        action,
    }
}

pub fn tx(process_id: &ProcessId, action: TransactionAction) -> WalletAction {
    WalletAction::Transaction {
        process_id: process_id.clone(),
        action,
    }
}

pub fn chain(event: ChainEvent) -> WalletAction {
    WalletAction::Chain(event)
}

pub fn funding_received(channel_id: crate::types::ChannelId, total: u64) -> WalletAction {
    chain(ChainEvent::FundingReceived {
        channel_id,
        amount: U256::from(total),
        total_for_destination: U256::from(total),
    })
}

/// Commitments queued for relay, in order, flattening batches.
pub fn sent_commitments(shared: &SharedData) -> Vec<SignedCommitment> {
    shared
        .outbox
        .relays()
        .flat_map(|r| match &r.payload {
            RelayPayload::Commitment { signed_commitment } => vec![signed_commitment.clone()],
            RelayPayload::Commitments {
                signed_commitments, ..
            } => signed_commitments.clone(),
            _ => vec![],
        })
        .collect()
}

pub fn queued_transactions(shared: &SharedData) -> Vec<TransactionRequest> {
    shared
        .outbox
        .transaction_outbox
        .iter()
        .map(|t| t.request.clone())
        .collect()
}

/// Drive an embedded transaction submission to success.
pub fn confirm_transaction(process_id: &ProcessId) -> [WalletAction; 3] {
    [
        tx(process_id, TransactionAction::Sent),
        tx(
            process_id,
            TransactionAction::Submitted {
                transaction_hash: crate::types::Hash([0x11; 32]),
            },
        ),
        tx(process_id, TransactionAction::Confirmed),
    ]
}
