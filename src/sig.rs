//! Handles the creation and verification of (Ethereum) Signatures.
//!
//! Two backends are available: `secp256k1` (C library bindings) and `k256`
//! (pure Rust). If both features are enabled, `secp256k1` is used as the
//! [Signer]; both produce identical signatures for the same key.

use crate::types::{Address, Hash, Signature};
use sha3::{Digest, Keccak256};
use thiserror::Error;

#[cfg(feature = "k256")]
mod k256;
#[cfg(feature = "secp256k1")]
mod secp256k1;

#[cfg(feature = "secp256k1")]
pub use self::secp256k1::Signer;
#[cfg(all(feature = "k256", not(feature = "secp256k1")))]
pub use self::k256::Signer;

#[cfg(not(any(feature = "k256", feature = "secp256k1")))]
compile_error!("channel-wallet needs a signature backend: enable `k256` or `secp256k1`");


#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    #[error("invalid private key")]
    InvalidPrivateKey,
    #[error("invalid recovery id in signature: v = {0}")]
    InvalidRecoveryId(u8),
    #[error("malformed signature")]
    MalformedSignature,
    #[error("could not recover signer from signature")]
    RecoveryFailed,
    #[error("signing failed")]
    SigningFailed,
}

/// Add the `\x19Ethereum Signed Message\n<length>` prefix to hash.
///
/// This is the format expected by the Solidity contracts.
fn hash_to_eth_signed_msg_hash(hash: Hash) -> Hash {
    // Packed encoding => We can't use the slot writer
    let mut hasher = Keccak256::new();
    hasher.update(b"\x19Ethereum Signed Message:\n32");
    hasher.update(hash.0);
    Hash(hasher.finalize().into())
}

/// Undo the `+27` offset Ethereum adds to the recovery id.
fn recovery_id(eth_sig: &Signature) -> Result<u8, Error> {
    let v = eth_sig.0[64];
    match v.checked_sub(27) {
        Some(id) if id <= 1 => Ok(id),
        _ => Err(Error::InvalidRecoveryId(v)),
    }
}

/// Derive the Ethereum address from an uncompressed SEC1 public key.
fn address_from_uncompressed(pk_bytes: &[u8]) -> Address {
    // See https://ethereum.stackexchange.com/questions/65233/goethereum-getting-public-key-from-private-key-hex-formatting
    //
    // Throw away the first byte, which is not part of the public key. It is
    // added by the uncompressed encoding.
    let hash: [u8; 32] = Keccak256::digest(&pk_bytes[1..]).into();

    let mut addr = Address([0; 20]);
    addr.0.copy_from_slice(&hash[32 - 20..]);
    addr
}

/// Recover the address that produced `eth_sig` over `msg`.
pub fn recover_signer(msg: Hash, eth_sig: Signature) -> Result<Address, Error> {
    Signer::recover_signer(msg, eth_sig)
}

/// Whether `eth_sig` is a signature of `expected` over `msg`. Malformed
/// signatures are simply invalid.
pub fn verify(msg: Hash, eth_sig: Signature, expected: Address) -> bool {
    recover_signer(msg, eth_sig).map_or(false, |signer| signer == expected)
}
