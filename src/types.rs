//! Fixed-size primitive types shared by the whole wallet.
//!
//! All byte types print as `0x`-prefixed hex and serialize to hex strings, so
//! wallet snapshots stay readable when persisted.

use core::fmt::Debug;

use rand::{distributions::Standard, prelude::Distribution};
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use uint::construct_uint;

macro_rules! impl_hex_debug {
    ($T:ident) => {
        impl Debug for $T {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                f.write_str("0x")?;
                for b in self.0 {
                    f.write_fmt(format_args!("{:02x}", b))?;
                }
                Ok(())
            }
        }

        impl core::fmt::Display for $T {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                Debug::fmt(self, f)
            }
        }
    };
}

macro_rules! impl_hex_serde {
    ($T:ident, $N:literal) => {
        impl Serialize for $T {
            fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
            where
                S: Serializer,
            {
                serializer.serialize_str(&format!("0x{}", hex::encode(self.0)))
            }
        }

        impl<'de> Deserialize<'de> for $T {
            fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
            where
                D: Deserializer<'de>,
            {
                let s = String::deserialize(deserializer)?;
                let mut bytes = [0u8; $N];
                hex::decode_to_slice(s.trim_start_matches("0x"), &mut bytes)
                    .map_err(de::Error::custom)?;
                Ok($T(bytes))
            }
        }
    };
}

macro_rules! bytesN {
    ( $T:ident, $N:literal ) => {
        #[derive(PartialEq, Eq, PartialOrd, Ord, Hash, Copy, Clone)]
        pub struct $T(pub [u8; $N]);

        impl Distribution<$T> for Standard {
            fn sample<R: rand::Rng + ?Sized>(&self, rng: &mut R) -> $T {
                $T(rng.gen())
            }
        }

        impl Default for $T {
            fn default() -> Self {
                Self([0; $N])
            }
        }

        impl_hex_debug!($T);
        impl_hex_serde!($T, $N);
    };
}

bytesN!(Hash, 32);
bytesN!(Address, 20);

/// Channels are identified by an address-sized digest of their definition,
/// which lets a channel appear as a destination in another channel's
/// allocation.
pub type ChannelId = Address;

bytesN!(Signature, 65);
impl Signature {
    pub fn new(rs: &[u8; 64], v: u8) -> Self {
        let mut sig: Signature = Signature([0; 65]);
        sig.0[..64].copy_from_slice(rs);
        sig.0[64] = v;
        sig
    }
}

/// Raw secp256k1 secret key. `Debug` never prints the key material.
#[derive(PartialEq, Eq, Copy, Clone)]
pub struct PrivateKey(pub [u8; 32]);
impl_hex_serde!(PrivateKey, 32);

impl Debug for PrivateKey {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str("PrivateKey(..)")
    }
}

impl Distribution<PrivateKey> for Standard {
    fn sample<R: rand::Rng + ?Sized>(&self, rng: &mut R) -> PrivateKey {
        PrivateKey(rng.gen())
    }
}

// Same reasoning as for the byte types: a local construct_uint keeps
// arithmetic on `x.add` instead of `x.0.add` while letting us pick the serde
// representation.
construct_uint! {
    pub struct U256(4);
}

impl Serialize for U256 {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&format!("{:#x}", self))
    }
}

impl<'de> Deserialize<'de> for U256 {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        U256::from_str_radix(s.trim_start_matches("0x"), 16).map_err(de::Error::custom)
    }
}

impl Distribution<U256> for Standard {
    fn sample<R: rand::Rng + ?Sized>(&self, rng: &mut R) -> U256 {
        let buf: [u8; 32] = rng.gen();
        U256::from_big_endian(&buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::StdRng, Rng, SeedableRng};

    #[test]
    fn address_debug_is_hex() {
        let mut addr = Address::default();
        addr.0[19] = 0xab;
        assert_eq!(
            format!("{:?}", addr),
            "0x00000000000000000000000000000000000000ab"
        );
    }

    #[test]
    fn private_key_is_redacted() {
        let mut rng = StdRng::seed_from_u64(0);
        let key: PrivateKey = rng.gen();
        assert_eq!(format!("{:?}", key), "PrivateKey(..)");
    }

    #[test]
    fn bytes_serialize_as_hex_strings() {
        let mut rng = StdRng::seed_from_u64(0);
        let hash: Hash = rng.gen();
        let encoded = toml::Value::try_from(hash).unwrap();
        let s = encoded.as_str().unwrap();
        assert!(s.starts_with("0x"));
        assert_eq!(s.len(), 2 + 64);
        let decoded: Hash = encoded.try_into().unwrap();
        assert_eq!(decoded, hash);
    }

    #[test]
    fn u256_serializes_as_hex_string() {
        let value = U256::from(255u64);
        let encoded = toml::Value::try_from(value).unwrap();
        assert_eq!(encoded.as_str(), Some("0xff"));
        let decoded: U256 = encoded.try_into().unwrap();
        assert_eq!(decoded, value);
    }
}
