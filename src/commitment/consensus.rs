//! The consensus app used by ledger, joint and guarantor channels.
//!
//! A participant proposes a new allocation. Every other participant then
//! votes on it in turn, and the final vote adopts the proposal as the
//! channel's allocation.

use serde::{Deserialize, Serialize};

use super::{
    encoding::{to_bytes, Encode, EncodingError, SlotReader, Writer},
    Commitment,
};
use crate::types::{Address, U256};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsensusAttributes {
    pub further_votes_required: u64,
    pub proposed_allocation: Vec<U256>,
    pub proposed_destination: Vec<Address>,
}

impl Encode for ConsensusAttributes {
    fn encode<W: Writer>(&self, w: &mut W) {
        self.further_votes_required.encode(w);
        self.proposed_allocation.encode(w);
        self.proposed_destination.encode(w);
    }
}

impl ConsensusAttributes {
    /// Attributes of a channel in consensus on its current outcome.
    pub fn consensus(allocation: &[U256], destination: &[Address]) -> Self {
        Self {
            further_votes_required: 0,
            proposed_allocation: allocation.to_vec(),
            proposed_destination: destination.to_vec(),
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        to_bytes(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, EncodingError> {
        let mut reader = SlotReader::new(bytes);
        let further_votes_required = reader.read_u64()?;
        let proposed_allocation = reader.read_vec(|r| r.read_u256())?;
        let proposed_destination = reader.read_vec(|r| r.read_address())?;
        reader.finish()?;
        Ok(Self {
            further_votes_required,
            proposed_allocation,
            proposed_destination,
        })
    }

    pub fn of(commitment: &Commitment) -> Result<Self, EncodingError> {
        Self::decode(&commitment.app_attributes)
    }
}

/// Next commitment proposing a new outcome, requiring a vote from every
/// other participant.
pub fn propose(from: &Commitment, allocation: Vec<U256>, destination: Vec<Address>) -> Commitment {
    let votes = (from.num_participants() as u64).saturating_sub(1);
    if votes == 0 {
        return adopt(from, allocation, destination);
    }
    let attributes = ConsensusAttributes {
        further_votes_required: votes,
        proposed_allocation: allocation,
        proposed_destination: destination,
    };
    from.next_app(attributes.to_bytes())
}

/// Next commitment agreeing with the proposal in `from`. The final vote
/// adopts the proposal.
pub fn vote(from: &Commitment) -> Result<Commitment, EncodingError> {
    let attributes = ConsensusAttributes::of(from)?;
    match attributes.further_votes_required {
        0 | 1 => Ok(adopt(
            from,
            attributes.proposed_allocation,
            attributes.proposed_destination,
        )),
        votes => Ok(from.next_app(
            ConsensusAttributes {
                further_votes_required: votes - 1,
                ..attributes
            }
            .to_bytes(),
        )),
    }
}

fn adopt(from: &Commitment, allocation: Vec<U256>, destination: Vec<Address>) -> Commitment {
    let attributes = ConsensusAttributes::consensus(&allocation, &destination);
    Commitment {
        allocation,
        destination,
        ..from.next_app(attributes.to_bytes())
    }
}

/// Whether `commitment` is a consensus commitment with the given outcome.
pub fn is_consensus_on(commitment: &Commitment, allocation: &[U256], destination: &[Address]) -> bool {
    matches!(
        ConsensusAttributes::of(commitment),
        Ok(a) if a.further_votes_required == 0
    ) && commitment.allocation == allocation
        && commitment.destination == destination
}

/// Whether `commitment` is a pending proposal for the given outcome.
pub fn is_proposal_of(commitment: &Commitment, allocation: &[U256], destination: &[Address]) -> bool {
    matches!(
        ConsensusAttributes::of(commitment),
        Ok(a) if a.further_votes_required > 0
            && a.proposed_allocation == allocation
            && a.proposed_destination == destination
    )
}
