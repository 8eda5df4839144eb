//! Signed, turn-numbered snapshots of a channel's agreed state.
//!
//! A [Commitment] is never mutated once created: every helper here derives
//! the commitment for the next turn from the current one.

pub mod consensus;
pub mod encoding;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    sig::{self, Signer},
    types::{Address, ChannelId, Hash, Signature, U256},
};
use encoding::{to_hash, Bytes, Encode, Writer};

/// The static part of a channel, its id is derived from it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Channel {
    /// Address of the app (rules) the channel follows.
    pub channel_type: Address,
    pub nonce: u64,
    pub participants: Vec<Address>,
}

impl Encode for Channel {
    fn encode<W: Writer>(&self, w: &mut W) {
        self.channel_type.encode(w);
        self.nonce.encode(w);
        self.participants.encode(w);
    }
}

impl Channel {
    pub fn new(channel_type: Address, nonce: u64, participants: Vec<Address>) -> Self {
        Self {
            channel_type,
            nonce,
            participants,
        }
    }

    /// Last 20 bytes of the hash of the channel definition.
    pub fn id(&self) -> ChannelId {
        let hash = to_hash(self);
        let mut id = ChannelId::default();
        id.0.copy_from_slice(&hash.0[32 - 20..]);
        id
    }

    pub fn num_participants(&self) -> usize {
        self.participants.len()
    }

    pub fn index_of(&self, address: Address) -> Option<usize> {
        self.participants.iter().position(|p| *p == address)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommitmentType {
    PreFundSetup,
    PostFundSetup,
    App,
    Conclude,
}

impl CommitmentType {
    fn as_u64(self) -> u64 {
        match self {
            CommitmentType::PreFundSetup => 0,
            CommitmentType::PostFundSetup => 1,
            CommitmentType::App => 2,
            CommitmentType::Conclude => 3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Commitment {
    pub channel: Channel,
    pub turn_num: u64,
    pub commitment_type: CommitmentType,
    pub commitment_count: u64,
    pub allocation: Vec<U256>,
    pub destination: Vec<Address>,
    pub app_attributes: Vec<u8>,
}

impl Encode for Commitment {
    fn encode<W: Writer>(&self, w: &mut W) {
        self.channel.encode(w);
        self.turn_num.encode(w);
        self.commitment_type.as_u64().encode(w);
        self.commitment_count.encode(w);
        self.allocation.encode(w);
        self.destination.encode(w);
        Bytes(&self.app_attributes).encode(w);
    }
}

/// Reasons a commitment cannot follow another one.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum InvalidTransition {
    #[error("commitment belongs to a different channel")]
    ChannelMismatch,
    #[error("expected turn {expected}, got {got}")]
    TurnNumber { expected: u64, got: u64 },
    #[error("{from:?} cannot be followed by {to:?}")]
    CommitmentType {
        from: CommitmentType,
        to: CommitmentType,
    },
    #[error("unexpected commitment count {0}")]
    CommitmentCount(u64),
    #[error("allocation changed during setup or conclusion")]
    AllocationChanged,
    #[error("channel has no participants")]
    NoParticipants,
    #[error("turn number {0} cannot be followed")]
    TurnOverflow(u64),
}

impl Commitment {
    /// The first commitment of a channel.
    pub fn pre_fund_setup(
        channel: Channel,
        allocation: Vec<U256>,
        destination: Vec<Address>,
        app_attributes: Vec<u8>,
    ) -> Self {
        Self {
            channel,
            turn_num: 0,
            commitment_type: CommitmentType::PreFundSetup,
            commitment_count: 0,
            allocation,
            destination,
            app_attributes,
        }
    }

    pub fn channel_id(&self) -> ChannelId {
        self.channel.id()
    }

    pub fn num_participants(&self) -> usize {
        self.channel.num_participants()
    }

    /// Index of the participant whose move `turn_num` is.
    pub fn mover_index(&self) -> usize {
        match self.num_participants() {
            0 => 0,
            n => (self.turn_num % n as u64) as usize,
        }
    }

    pub fn mover(&self) -> Option<Address> {
        self.channel.participants.get(self.mover_index()).copied()
    }

    pub fn hash(&self) -> Hash {
        to_hash(self)
    }

    pub fn total(&self) -> U256 {
        self.allocation
            .iter()
            .fold(U256::zero(), |acc, a| acc.saturating_add(*a))
    }

    /// Allocated amount for `destination`, zero if it is not a destination.
    pub fn amount_for(&self, destination: Address) -> U256 {
        self.destination
            .iter()
            .zip(self.allocation.iter())
            .filter(|(d, _)| **d == destination)
            .fold(U256::zero(), |acc, (_, a)| acc.saturating_add(*a))
    }

    pub fn is_setup(&self) -> bool {
        matches!(
            self.commitment_type,
            CommitmentType::PreFundSetup | CommitmentType::PostFundSetup
        )
    }

    /// Whether this is the last PostFundSetup commitment of the setup phase.
    pub fn completes_setup(&self) -> bool {
        self.commitment_type == CommitmentType::PostFundSetup
            && self.commitment_count + 1 == self.num_participants() as u64
    }

    /// Saturates at `u64::MAX`, which no transition accepts.
    fn next_turn(&self) -> Self {
        Self {
            turn_num: self.turn_num.saturating_add(1),
            ..self.clone()
        }
    }

    /// The setup commitment following this one, `None` once the setup phase
    /// is over.
    pub fn next_setup(&self) -> Option<Self> {
        let n = self.num_participants() as u64;
        let turn_num = self.turn_num.checked_add(1)?;
        let (commitment_type, commitment_count) = if turn_num < n {
            (CommitmentType::PreFundSetup, turn_num)
        } else if turn_num < 2 * n {
            (CommitmentType::PostFundSetup, turn_num - n)
        } else {
            return None;
        };
        Some(Self {
            commitment_type,
            commitment_count,
            ..self.next_turn()
        })
    }

    pub fn conclude(&self) -> Self {
        let commitment_count = match self.commitment_type {
            CommitmentType::Conclude => self.commitment_count + 1,
            _ => 0,
        };
        Self {
            commitment_type: CommitmentType::Conclude,
            commitment_count,
            ..self.next_turn()
        }
    }

    pub fn next_app(&self, app_attributes: Vec<u8>) -> Self {
        Self {
            commitment_type: CommitmentType::App,
            commitment_count: 0,
            app_attributes,
            ..self.next_turn()
        }
    }

    /// Checks that `self` may directly follow `from`.
    pub fn validate_transition_from(&self, from: &Commitment) -> Result<(), InvalidTransition> {
        use CommitmentType::*;

        let n = from.num_participants() as u64;
        let last = n.checked_sub(1).ok_or(InvalidTransition::NoParticipants)?;
        let allocation_kept =
            self.allocation == from.allocation && self.destination == from.destination;

        let expected_turn = from
            .turn_num
            .checked_add(1)
            .ok_or(InvalidTransition::TurnOverflow(from.turn_num))?;

        if self.channel != from.channel {
            return Err(InvalidTransition::ChannelMismatch);
        } else if self.turn_num != expected_turn {
            return Err(InvalidTransition::TurnNumber {
                expected: expected_turn,
                got: self.turn_num,
            });
        }

        let expected_count = match (from.commitment_type, self.commitment_type) {
            (PreFundSetup, PreFundSetup) | (PostFundSetup, PostFundSetup)
                if from.commitment_count < last =>
            {
                Some(from.commitment_count + 1)
            }
            (PreFundSetup, PostFundSetup) if from.commitment_count == last => Some(0),
            (PostFundSetup, App) if from.commitment_count == last => None,
            (PostFundSetup, Conclude) if from.commitment_count == last => Some(0),
            (App, App) => None,
            (App, Conclude) => Some(0),
            (Conclude, Conclude) => Some(from.commitment_count + 1),
            (from, to) => return Err(InvalidTransition::CommitmentType { from, to }),
        };

        if let Some(count) = expected_count {
            if self.commitment_count != count {
                return Err(InvalidTransition::CommitmentCount(self.commitment_count));
            }
        }
        if self.commitment_type != App && !allocation_kept {
            return Err(InvalidTransition::AllocationChanged);
        }
        Ok(())
    }

    /// Checks that `self` can open a channel.
    pub fn validate_genesis(&self) -> Result<(), InvalidTransition> {
        if self.num_participants() == 0 {
            Err(InvalidTransition::NoParticipants)
        } else if self.turn_num != 0 {
            Err(InvalidTransition::TurnNumber {
                expected: 0,
                got: self.turn_num,
            })
        } else if self.commitment_type != CommitmentType::PreFundSetup {
            Err(InvalidTransition::CommitmentType {
                from: CommitmentType::PreFundSetup,
                to: self.commitment_type,
            })
        } else if self.commitment_count != 0 {
            Err(InvalidTransition::CommitmentCount(self.commitment_count))
        } else {
            Ok(())
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedCommitment {
    pub commitment: Commitment,
    pub signature: Signature,
}

impl SignedCommitment {
    pub fn sign(commitment: Commitment, signer: &Signer) -> Result<Self, sig::Error> {
        let signature = signer.sign_eth(commitment.hash())?;
        Ok(Self {
            commitment,
            signature,
        })
    }

    pub fn signer(&self) -> Result<Address, sig::Error> {
        sig::recover_signer(self.commitment.hash(), self.signature)
    }

    /// The signature must recover to the mover of the commitment's turn.
    pub fn has_valid_signature(&self) -> bool {
        match self.commitment.mover() {
            Some(mover) => sig::verify(self.commitment.hash(), self.signature, mover),
            None => false,
        }
    }
}
