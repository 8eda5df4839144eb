//! The aggregate snapshot threaded through every protocol reducer.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::{
    channel_store::{ChannelStage, ChannelState, ChannelStore, StoreError},
    commitment::{Commitment, SignedCommitment},
    outbox::{
        DisplayEvent, MessageRelay, OutboxState, OutgoingMessage, QueuedTransaction, RelayPayload,
        WalletNotification,
    },
    protocols::{ProcessId, ProtocolLocator},
    transactions::TransactionRequest,
    types::{Address, ChannelId, PrivateKey, U256},
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FundingType {
    Direct,
    /// Funded by reallocating funds held by another channel.
    Indirect { ledger_id: ChannelId },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChallengeRecord {
    pub expires_at: u64,
    pub commitment: Commitment,
}

/// What we know about a channel from the adjudicator's events.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdjudicatorChannelState {
    pub balance: U256,
    pub finalized: bool,
    pub challenge: Option<ChallengeRecord>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SharedData {
    pub channel_store: ChannelStore,
    pub funding_state: BTreeMap<ChannelId, FundingType>,
    pub adjudicator_state: BTreeMap<ChannelId, AdjudicatorChannelState>,
    /// Channels whose chain event listener should be running.
    pub monitored_channels: BTreeSet<ChannelId>,
    /// Timestamp of the most recent block we were told about.
    pub block_timestamp: u64,
    pub outbox: OutboxState,
}

impl SharedData {
    pub fn get_channel(&self, channel_id: ChannelId) -> Option<&ChannelState> {
        self.channel_store.get_channel(channel_id)
    }

    pub fn set_channel(mut self, state: ChannelState) -> Self {
        self.channel_store = self.channel_store.set_channel(state);
        self
    }

    pub fn check_and_store(&self, signed: SignedCommitment) -> Result<Self, StoreError> {
        let channel_store = self.channel_store.check_and_store(signed)?;
        Ok(self.with_store(channel_store))
    }

    pub fn check_and_store_batch(&self, batch: &[SignedCommitment]) -> Result<Self, StoreError> {
        let channel_store = self.channel_store.check_and_store_batch(batch)?;
        Ok(self.with_store(channel_store))
    }

    pub fn check_and_initialize(
        &self,
        signed: SignedCommitment,
        private_key: PrivateKey,
    ) -> Result<Self, StoreError> {
        let channel_store = self
            .channel_store
            .check_and_initialize(signed, private_key)?;
        Ok(self.with_store(channel_store))
    }

    pub fn sign_and_store(
        &self,
        commitment: Commitment,
    ) -> Result<(Self, SignedCommitment), StoreError> {
        let (channel_store, signed) = self.channel_store.sign_and_store(commitment)?;
        Ok((self.with_store(channel_store), signed))
    }

    pub fn sign_and_initialize(
        &self,
        commitment: Commitment,
        private_key: PrivateKey,
    ) -> Result<(Self, SignedCommitment), StoreError> {
        let (channel_store, signed) = self
            .channel_store
            .sign_and_initialize(commitment, private_key)?;
        Ok((self.with_store(channel_store), signed))
    }

    fn with_store(&self, channel_store: ChannelStore) -> Self {
        Self {
            channel_store,
            ..self.clone()
        }
    }

    pub fn set_stage(mut self, channel_id: ChannelId, stage: ChannelStage) -> Self {
        self.channel_store = self
            .channel_store
            .update_channel(channel_id, |c| c.stage = stage);
        self
    }

    pub fn set_funding_state(mut self, channel_id: ChannelId, funding: FundingType) -> Self {
        self.channel_store = self
            .channel_store
            .update_channel(channel_id, |c| c.funded = true);
        self.funding_state.insert(channel_id, funding);
        self
    }

    pub fn funding_type(&self, channel_id: ChannelId) -> Option<&FundingType> {
        self.funding_state.get(&channel_id)
    }

    pub fn adjudicator(&self, channel_id: ChannelId) -> AdjudicatorChannelState {
        self.adjudicator_state
            .get(&channel_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn holdings(&self, channel_id: ChannelId) -> U256 {
        self.adjudicator_state
            .get(&channel_id)
            .map_or(U256::zero(), |a| a.balance)
    }

    pub fn update_adjudicator(
        mut self,
        channel_id: ChannelId,
        f: impl FnOnce(&mut AdjudicatorChannelState),
    ) -> Self {
        f(self.adjudicator_state.entry(channel_id).or_default());
        self
    }

    pub fn monitor(mut self, channel_id: ChannelId) -> Self {
        self.monitored_channels.insert(channel_id);
        self
    }

    /// Removing a channel that is not monitored is a no-op.
    pub fn stop_monitoring(mut self, channel_id: ChannelId) -> Self {
        self.monitored_channels.remove(&channel_id);
        self
    }

    pub fn send(mut self, to: Address, process_id: &ProcessId, payload: RelayPayload) -> Self {
        self.outbox
            .message_outbox
            .push(OutgoingMessage::Relay(MessageRelay {
                to,
                process_id: process_id.clone(),
                payload,
            }));
        self
    }

    /// Send `payload` to every participant of the channel but us.
    pub fn send_to_others(
        self,
        channel_id: ChannelId,
        process_id: &ProcessId,
        payload: RelayPayload,
    ) -> Self {
        let others = self
            .get_channel(channel_id)
            .map(|c| c.their_addresses())
            .unwrap_or_default();
        others.into_iter().fold(self, |shared, to| {
            shared.send(to, process_id, payload.clone())
        })
    }

    pub fn send_commitment(
        self,
        process_id: &ProcessId,
        signed_commitment: SignedCommitment,
    ) -> Self {
        let channel_id = signed_commitment.commitment.channel_id();
        self.send_to_others(
            channel_id,
            process_id,
            RelayPayload::Commitment { signed_commitment },
        )
    }

    /// Broadcast the channel's last two commitments to the other
    /// participants.
    pub fn broadcast_commitments(
        self,
        channel_id: ChannelId,
        process_id: &ProcessId,
        protocol_locator: &ProtocolLocator,
    ) -> Self {
        let signed_commitments = self
            .get_channel(channel_id)
            .map(|c| c.commitments())
            .unwrap_or_default();
        self.send_to_others(
            channel_id,
            process_id,
            RelayPayload::Commitments {
                protocol_locator: protocol_locator.clone(),
                signed_commitments,
            },
        )
    }

    pub fn queue_transaction(mut self, process_id: &ProcessId, request: TransactionRequest) -> Self {
        self.outbox.transaction_outbox.push(QueuedTransaction {
            process_id: process_id.clone(),
            request,
        });
        self
    }

    pub fn notify(mut self, notification: WalletNotification) -> Self {
        self.outbox
            .message_outbox
            .push(OutgoingMessage::Notification(notification));
        self
    }

    pub fn display(mut self, event: DisplayEvent) -> Self {
        self.outbox.display_outbox.push(event);
        self
    }

    pub fn take_outbox(&mut self) -> OutboxState {
        core::mem::take(&mut self.outbox)
    }
}
