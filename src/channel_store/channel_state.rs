use serde::{Deserialize, Serialize};

use crate::{
    commitment::{Channel, Commitment, CommitmentType, SignedCommitment},
    sig::{self, Signer},
    types::{Address, ChannelId, PrivateKey},
};

/// Lifecycle stage of a channel. Channels are never removed from the store,
/// closing them is a stage transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChannelStage {
    Opening,
    Funding,
    Running,
    Challenging,
    Responding,
    Closing,
    Withdrawing,
}

impl ChannelStage {
    /// Stage a channel is in after accepting a commitment of type `t`.
    pub fn after(t: CommitmentType) -> Self {
        match t {
            CommitmentType::PreFundSetup => ChannelStage::Opening,
            CommitmentType::PostFundSetup => ChannelStage::Funding,
            CommitmentType::App => ChannelStage::Running,
            CommitmentType::Conclude => ChannelStage::Closing,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelState {
    pub channel_id: ChannelId,
    /// Our own address in this channel.
    pub address: Address,
    pub private_key: PrivateKey,
    pub channel: Channel,
    pub our_index: usize,
    pub turn_num: u64,
    pub last_commitment: SignedCommitment,
    pub penultimate_commitment: Option<SignedCommitment>,
    pub funded: bool,
    pub stage: ChannelStage,
}

impl ChannelState {
    pub fn participants(&self) -> &[Address] {
        &self.channel.participants
    }

    pub fn num_participants(&self) -> usize {
        self.channel.num_participants()
    }

    pub fn last(&self) -> &Commitment {
        &self.last_commitment.commitment
    }

    pub fn penultimate(&self) -> Option<&Commitment> {
        self.penultimate_commitment.as_ref().map(|s| &s.commitment)
    }

    /// Whether the next commitment is ours to sign.
    pub fn our_turn(&self) -> bool {
        let n = self.num_participants() as u64;
        n > 0
            && self
                .turn_num
                .checked_add(1)
                .map_or(false, |next| (next % n) as usize == self.our_index)
    }

    /// Every participant but us.
    pub fn their_addresses(&self) -> Vec<Address> {
        self.participants()
            .iter()
            .enumerate()
            .filter(|(i, _)| *i != self.our_index)
            .map(|(_, a)| *a)
            .collect()
    }

    /// Whether the channel is fully open, i.e. past its setup phase.
    pub fn is_fully_open(&self) -> bool {
        matches!(
            self.last().commitment_type,
            CommitmentType::App | CommitmentType::Conclude
        ) || self.last().completes_setup()
    }

    /// A channel is closed once every participant signed a Conclude
    /// commitment.
    pub fn is_closed(&self) -> bool {
        let last = self.last();
        last.commitment_type == CommitmentType::Conclude
            && last.commitment_count + 1 >= self.num_participants() as u64
    }

    pub fn signer(&self) -> Result<Signer, sig::Error> {
        Signer::from_private_key(&self.private_key)
    }

    /// The stored commitments, oldest first.
    pub fn commitments(&self) -> Vec<SignedCommitment> {
        self.penultimate_commitment
            .iter()
            .chain(core::iter::once(&self.last_commitment))
            .cloned()
            .collect()
    }

    pub(super) fn advance(mut self, signed: SignedCommitment) -> Self {
        self.turn_num = signed.commitment.turn_num;
        self.stage = ChannelStage::after(signed.commitment.commitment_type);
        self.penultimate_commitment = Some(core::mem::replace(&mut self.last_commitment, signed));
        self
    }
}
