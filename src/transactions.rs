//! On-chain transactions the wallet asks the chain adapter to submit.
//!
//! The chain adapter is responsible for encoding these for the adjudicator
//! contract, the wallet only decides what to submit and when.

use serde::{Deserialize, Serialize};

use crate::{
    commitment::{
        encoding::{to_hash, Encode, Writer},
        SignedCommitment,
    },
    sig::{self, Signer},
    types::{Address, ChannelId, Signature, U256},
};

/// Authorizes the adjudicator to pay out a participant's holdings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WithdrawalAuth {
    /// Off-chain channel address
    pub participant: Address,
    /// On-chain receiver of funds on withdrawal
    pub destination: Address,
    pub amount: U256,
    /// Account submitting the transaction. The adjudicator rejects the
    /// authorization when relayed by anyone else.
    pub sender: Address,
}

impl Encode for WithdrawalAuth {
    fn encode<W: Writer>(&self, w: &mut W) {
        self.participant.encode(w);
        self.destination.encode(w);
        self.amount.encode(w);
        self.sender.encode(w);
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedWithdrawalAuth {
    pub auth: WithdrawalAuth,
    pub signature: Signature,
}

impl SignedWithdrawalAuth {
    pub fn sign(auth: WithdrawalAuth, signer: &Signer) -> Result<Self, sig::Error> {
        let signature = signer.sign_eth(to_hash(&auth))?;
        Ok(Self { auth, signature })
    }

    pub fn is_valid(&self) -> bool {
        sig::verify(to_hash(&self.auth), self.signature, self.auth.participant)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransactionRequest {
    Deposit {
        channel_id: ChannelId,
        amount: U256,
        /// Holdings the deposit expects to find, protects against
        /// depositing twice.
        expected_held: U256,
    },
    /// Challenge with the two most recent commitments.
    ForceMove {
        from: SignedCommitment,
        to: SignedCommitment,
    },
    RespondWithMove {
        response: SignedCommitment,
    },
    Refute {
        refutation: SignedCommitment,
    },
    /// Finalize a concluded channel without paying anything out.
    Conclude {
        from: SignedCommitment,
        to: SignedCommitment,
    },
    ConcludeAndWithdraw {
        from: SignedCommitment,
        to: SignedCommitment,
        authorization: SignedWithdrawalAuth,
    },
}

impl TransactionRequest {
    pub fn channel_id(&self) -> ChannelId {
        match self {
            TransactionRequest::Deposit { channel_id, .. } => *channel_id,
            TransactionRequest::ForceMove { to, .. }
            | TransactionRequest::Conclude { to, .. }
            | TransactionRequest::ConcludeAndWithdraw { to, .. } => to.commitment.channel_id(),
            TransactionRequest::RespondWithMove { response } => response.commitment.channel_id(),
            TransactionRequest::Refute { refutation } => refutation.commitment.channel_id(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::Fixture;

    #[test]
    fn withdrawal_auth_is_signed_by_participant() {
        let f = Fixture::two_party();
        let auth = WithdrawalAuth {
            participant: f.alice.address(),
            destination: Address([7; 20]),
            amount: U256::from(2),
            sender: Address([7; 20]),
        };
        let signed = SignedWithdrawalAuth::sign(auth.clone(), &f.alice).unwrap();
        assert!(signed.is_valid());

        let forged = SignedWithdrawalAuth::sign(auth.clone(), &f.bob).unwrap();
        assert!(!forged.is_valid());

        let mut relayed = signed;
        relayed.auth.sender = f.bob.address();
        assert!(!relayed.is_valid());
    }
}
