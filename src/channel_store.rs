//! Per-channel ledger of the last two signed commitments.
//!
//! Every commitment enters the store through [ChannelStore::check_and_store]
//! (or its genesis/signing siblings), which enforce the signature and
//! turn-taking rules. All operations return a new store and leave the
//! original untouched.

mod channel_state;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::{
    commitment::{Commitment, InvalidTransition, SignedCommitment},
    sig::{self, Signer},
    types::{ChannelId, PrivateKey},
};

pub use channel_state::{ChannelStage, ChannelState};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("no channel with id {0}")]
    ChannelMissing(ChannelId),
    #[error("channel {0} already exists")]
    AlreadyInitialized(ChannelId),
    #[error("signature does not belong to the mover")]
    InvalidSignature,
    #[error("invalid transition: {0}")]
    InvalidTransition(#[from] InvalidTransition),
    #[error("not our turn to move")]
    NotOurTurn,
    #[error("we are not a participant of the channel")]
    NotAParticipant,
    #[error("signing failed: {0}")]
    Signing(#[from] sig::Error),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelStore(BTreeMap<ChannelId, ChannelState>);

impl ChannelStore {
    pub fn get_channel(&self, channel_id: ChannelId) -> Option<&ChannelState> {
        self.0.get(&channel_id)
    }

    pub fn set_channel(&self, state: ChannelState) -> Self {
        let mut store = self.clone();
        store.0.insert(state.channel_id, state);
        store
    }

    pub fn channel_ids(&self) -> impl Iterator<Item = &ChannelId> {
        self.0.keys()
    }

    /// Accept a commitment signed by somebody else (or a previously signed
    /// one of ours) into an existing channel.
    ///
    /// Replaying the stored last commitment fails with
    /// [StoreError::InvalidTransition], so the penultimate commitment is
    /// never shifted twice.
    pub fn check_and_store(&self, signed: SignedCommitment) -> Result<Self, StoreError> {
        let channel_id = signed.commitment.channel_id();
        let state = self
            .get_channel(channel_id)
            .ok_or(StoreError::ChannelMissing(channel_id))?;

        if !signed.has_valid_signature() {
            warn!(?channel_id, turn_num = signed.commitment.turn_num, "rejected commitment with invalid signature");
            return Err(StoreError::InvalidSignature);
        }
        if let Err(e) = signed.commitment.validate_transition_from(state.last()) {
            warn!(?channel_id, error = %e, "rejected commitment");
            return Err(e.into());
        }

        debug!(?channel_id, turn_num = signed.commitment.turn_num, "stored commitment");
        Ok(self.set_channel(state.clone().advance(signed)))
    }

    /// Store a batch of commitments, oldest first. Commitments the store
    /// already holds are skipped instead of being replayed.
    pub fn check_and_store_batch(&self, batch: &[SignedCommitment]) -> Result<Self, StoreError> {
        let mut store = self.clone();
        for signed in batch {
            let channel_id = signed.commitment.channel_id();
            let state = store
                .get_channel(channel_id)
                .ok_or(StoreError::ChannelMissing(channel_id))?;
            if signed.commitment.turn_num <= state.turn_num {
                if state.commitments().contains(signed) {
                    continue;
                }
                return Err(InvalidTransition::TurnNumber {
                    expected: state.turn_num.saturating_add(1),
                    got: signed.commitment.turn_num,
                }
                .into());
            }
            store = store.check_and_store(signed.clone())?;
        }
        Ok(store)
    }

    /// Open a channel from somebody else's PreFundSetup commitment.
    pub fn check_and_initialize(
        &self,
        signed: SignedCommitment,
        private_key: PrivateKey,
    ) -> Result<Self, StoreError> {
        let commitment = &signed.commitment;
        commitment.validate_genesis()?;
        if !signed.has_valid_signature() {
            return Err(StoreError::InvalidSignature);
        }
        let state = self.genesis_state(signed, private_key)?;
        debug!(channel_id = ?state.channel_id, "initialized channel");
        Ok(self.set_channel(state))
    }

    /// Open a channel by signing its first PreFundSetup commitment.
    pub fn sign_and_initialize(
        &self,
        commitment: Commitment,
        private_key: PrivateKey,
    ) -> Result<(Self, SignedCommitment), StoreError> {
        commitment.validate_genesis()?;
        let signer = Signer::from_private_key(&private_key)?;
        if commitment.mover() != Some(signer.address()) {
            return Err(StoreError::NotOurTurn);
        }
        let signed = SignedCommitment::sign(commitment, &signer)?;
        let state = self.genesis_state(signed.clone(), private_key)?;
        debug!(channel_id = ?state.channel_id, "initialized channel");
        Ok((self.set_channel(state), signed))
    }

    /// Sign our own next commitment and store it.
    pub fn sign_and_store(
        &self,
        commitment: Commitment,
    ) -> Result<(Self, SignedCommitment), StoreError> {
        let channel_id = commitment.channel_id();
        let state = self
            .get_channel(channel_id)
            .ok_or(StoreError::ChannelMissing(channel_id))?;
        if commitment.mover() != Some(state.address) {
            return Err(StoreError::NotOurTurn);
        }
        commitment.validate_transition_from(state.last())?;

        let signed = SignedCommitment::sign(commitment, &state.signer()?)?;
        debug!(?channel_id, turn_num = signed.commitment.turn_num, "signed commitment");
        Ok((self.set_channel(state.clone().advance(signed.clone())), signed))
    }

    /// Apply `f` to a stored channel. Unknown channels are left alone.
    pub fn update_channel(&self, channel_id: ChannelId, f: impl FnOnce(&mut ChannelState)) -> Self {
        match self.get_channel(channel_id) {
            Some(state) => {
                let mut state = state.clone();
                f(&mut state);
                self.set_channel(state)
            }
            None => self.clone(),
        }
    }

    fn genesis_state(
        &self,
        signed: SignedCommitment,
        private_key: PrivateKey,
    ) -> Result<ChannelState, StoreError> {
        let channel_id = signed.commitment.channel_id();
        if self.get_channel(channel_id).is_some() {
            return Err(StoreError::AlreadyInitialized(channel_id));
        }
        let address = Signer::from_private_key(&private_key)?.address();
        let channel = signed.commitment.channel.clone();
        let our_index = channel
            .index_of(address)
            .ok_or(StoreError::NotAParticipant)?;

        Ok(ChannelState {
            channel_id,
            address,
            private_key,
            channel,
            our_index,
            turn_num: 0,
            last_commitment: signed,
            penultimate_commitment: None,
            funded: false,
            stage: ChannelStage::Opening,
        })
    }
}
