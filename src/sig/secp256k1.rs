//! Signer using the secp256k1 crate (bindings to libsecp256k1).

use crate::types::{Address, Hash, PrivateKey, Signature};
use secp256k1::{
    ecdsa::{RecoverableSignature, RecoveryId},
    All, Message, PublicKey, Secp256k1, SecretKey,
};

use super::{address_from_uncompressed, hash_to_eth_signed_msg_hash, recovery_id, Error};

#[derive(Debug, Clone)]
pub struct Signer {
    secp: Secp256k1<All>,
    key: SecretKey,
    addr: Address,
}

impl From<PublicKey> for Address {
    fn from(pk: PublicKey) -> Self {
        address_from_uncompressed(&pk.serialize_uncompressed())
    }
}

impl Signer {
    pub fn new<R: rand::Rng + rand::CryptoRng>(rng: &mut R) -> Self {
        let secp = Secp256k1::new();
        let key = SecretKey::new(rng);
        let addr = PublicKey::from_secret_key(&secp, &key).into();
        Self { secp, key, addr }
    }

    pub fn from_private_key(key: &PrivateKey) -> Result<Self, Error> {
        let secp = Secp256k1::new();
        let key = SecretKey::from_slice(&key.0).map_err(|_| Error::InvalidPrivateKey)?;
        let addr = PublicKey::from_secret_key(&secp, &key).into();
        Ok(Self { secp, key, addr })
    }

    pub fn address(&self) -> Address {
        self.addr
    }

    /// Sign a hash using a Ethereum 65-byte recoverable signature.
    ///
    /// Note that this differs from transaction signatures, as it does not
    /// include the chain id in v.
    pub fn sign_eth(&self, msg: Hash) -> Result<Signature, Error> {
        // "\x19Ethereum Signed Message:\n32" format
        let hash = hash_to_eth_signed_msg_hash(msg);
        let message = Message::from_slice(&hash.0).map_err(|_| Error::SigningFailed)?;

        // We have to use sign_ecdsa_recoverable because the adjudicator must
        // be able to recover the address. This gives us the additional
        // information needed for v.
        let sig = self.secp.sign_ecdsa_recoverable(&message, &self.key);
        let (v, rs) = sig.serialize_compact();

        // EIP-2 makes signatures with a non-canonical s invalid. The library
        // produces canonical signatures, fail early if that changes.
        debug_assert!(rs[32] & 0x80 == 0);

        // The yParity is offset by 27, like Ethereum inherited from Bitcoin.
        let v: u8 = 27 + v.to_i32() as u8;

        Ok(Signature::new(&rs, v))
    }

    /// Hash is the hash of the data given to [Signer::sign_eth()], it should
    /// not include the `Ethereum Signed Message` prefix.
    pub fn recover_signer(msg: Hash, eth_sig: Signature) -> Result<Address, Error> {
        let secp = Secp256k1::verification_only();
        let hash = hash_to_eth_signed_msg_hash(msg);
        let message = Message::from_slice(&hash.0).map_err(|_| Error::RecoveryFailed)?;

        let v = recovery_id(&eth_sig)?;
        let recid = RecoveryId::from_i32(v.into()).map_err(|_| Error::InvalidRecoveryId(v))?;
        let sig = RecoverableSignature::from_compact(&eth_sig.0[..64], recid)
            .map_err(|_| Error::MalformedSignature)?;

        let pk = secp
            .recover_ecdsa(&message, &sig)
            .map_err(|_| Error::RecoveryFailed)?;
        Ok(pk.into())
    }
}
