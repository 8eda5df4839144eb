//! Signer using the k256 Rust crate (implementation of ecdsa in Rust).

use crate::types::{Address, Hash, PrivateKey, Signature};
use k256::{
    ecdsa::{
        recoverable,
        signature::{hazmat::PrehashSigner, Signature as k256Signature},
        SigningKey, VerifyingKey,
    },
    elliptic_curve::sec1::ToEncodedPoint,
};

use super::{address_from_uncompressed, hash_to_eth_signed_msg_hash, recovery_id, Error};

#[derive(Debug, Clone)]
pub struct Signer {
    key: SigningKey,
    addr: Address,
}

impl From<VerifyingKey> for Address {
    fn from(key: VerifyingKey) -> Self {
        // The uncompressed EncodedPoint is 65 bytes, the tag byte followed by
        // x and y.
        address_from_uncompressed(key.to_encoded_point(false).as_bytes())
    }
}

impl Signer {
    pub fn new<R: rand::Rng + rand::CryptoRng>(rng: &mut R) -> Self {
        let key = SigningKey::random(rng);
        let addr = key.verifying_key().into();
        Self { key, addr }
    }

    pub fn from_private_key(key: &PrivateKey) -> Result<Self, Error> {
        let key = SigningKey::from_bytes(&key.0).map_err(|_| Error::InvalidPrivateKey)?;
        let addr = key.verifying_key().into();
        Ok(Self { key, addr })
    }

    pub fn address(&self) -> Address {
        self.addr
    }

    pub fn sign_eth(&self, msg: Hash) -> Result<Signature, Error> {
        // "\x19Ethereum Signed Message:\n32" format
        let hash = hash_to_eth_signed_msg_hash(msg);

        let sig: recoverable::Signature = self
            .key
            .sign_prehash(&hash.0)
            .map_err(|_| Error::SigningFailed)?;

        // This Signature type already has the layout we need (r, s and v in
        // this order), but v has to be offset by 27 for the EVM.
        let mut sig_bytes = [0u8; 65];
        sig_bytes.copy_from_slice(sig.as_bytes());
        debug_assert!(sig_bytes[32] & 0x80 == 0);
        sig_bytes[64] += 27;

        Ok(Signature(sig_bytes))
    }

    pub fn recover_signer(msg: Hash, eth_sig: Signature) -> Result<Address, Error> {
        // "\x19Ethereum Signed Message:\n32" format
        let hash = hash_to_eth_signed_msg_hash(msg);

        let mut sig_bytes: [u8; 65] = eth_sig.0;
        sig_bytes[64] = recovery_id(&eth_sig)?;

        let sig = recoverable::Signature::from_bytes(&sig_bytes)
            .map_err(|_| Error::MalformedSignature)?;

        let verifying_key = sig
            .recover_verifying_key_from_digest_bytes(&hash.0.into())
            .map_err(|_| Error::RecoveryFailed)?;
        Ok(verifying_key.into())
    }
}
