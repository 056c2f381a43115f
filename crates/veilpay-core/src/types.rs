use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::GatewayError;

/// Lamports: the ledger's native unit (rent and gas are denominated in it).
pub type Lamports = u64;

/// Stablecoin amount in the mint's smallest unit.
pub type TokenAmount = u64;

/// Unix timestamp in milliseconds, UTC.
pub type TimestampMs = i64;

/// Current wall-clock time as unix milliseconds.
pub fn now_ms() -> TimestampMs {
    chrono::Utc::now().timestamp_millis()
}

// ── Address ──────────────────────────────────────────────────────────────────

/// 32-byte ledger account address (an ed25519 public key), rendered base-58.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Address(pub [u8; 32]);

impl Address {
    pub fn from_bytes(b: [u8; 32]) -> Self {
        Self(b)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_b58(&self) -> String {
        bs58::encode(&self.0).into_string()
    }

    pub fn from_b58(s: &str) -> Result<Self, GatewayError> {
        let bytes = bs58::decode(s)
            .into_vec()
            .map_err(|_| GatewayError::InvalidAddress(s.to_string()))?;
        if bytes.len() != 32 {
            return Err(GatewayError::InvalidAddress(s.to_string()));
        }
        let mut arr = [0u8; 32];
        arr.copy_from_slice(&bytes);
        Ok(Self(arr))
    }
}

impl FromStr for Address {
    type Err = GatewayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_b58(s)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_b58())
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Address({}…)", &self.to_b58()[..8])
    }
}

impl Serialize for Address {
    fn serialize<S: serde::Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        if s.is_human_readable() {
            s.serialize_str(&self.to_b58())
        } else {
            s.serialize_bytes(&self.0)
        }
    }
}

impl<'de> Deserialize<'de> for Address {
    fn deserialize<D: serde::Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        if d.is_human_readable() {
            let s = String::deserialize(d)?;
            Address::from_b58(&s).map_err(serde::de::Error::custom)
        } else {
            let b = <Vec<u8>>::deserialize(d)?;
            let arr: [u8; 32] = b
                .try_into()
                .map_err(|_| serde::de::Error::custom("expected 32 bytes"))?;
            Ok(Address(arr))
        }
    }
}

// ── TxSignature ──────────────────────────────────────────────────────────────

/// 64-byte ed25519 transaction signature, rendered base-58.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct TxSignature(pub [u8; 64]);

impl TxSignature {
    pub fn from_bytes(b: [u8; 64]) -> Self {
        Self(b)
    }

    pub fn as_bytes(&self) -> &[u8; 64] {
        &self.0
    }

    pub fn to_b58(&self) -> String {
        bs58::encode(self.0.as_slice()).into_string()
    }

    pub fn from_b58(s: &str) -> Result<Self, GatewayError> {
        let bytes = bs58::decode(s)
            .into_vec()
            .map_err(|_| GatewayError::InvalidSignature)?;
        if bytes.len() != 64 {
            return Err(GatewayError::InvalidSignature);
        }
        let mut arr = [0u8; 64];
        arr.copy_from_slice(&bytes);
        Ok(Self(arr))
    }
}

impl fmt::Display for TxSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_b58())
    }
}

impl fmt::Debug for TxSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TxSignature({}…)", &self.to_b58()[..12])
    }
}

impl Serialize for TxSignature {
    fn serialize<S: serde::Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        if s.is_human_readable() {
            s.serialize_str(&self.to_b58())
        } else {
            s.serialize_bytes(&self.0)
        }
    }
}

impl<'de> Deserialize<'de> for TxSignature {
    fn deserialize<D: serde::Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        if d.is_human_readable() {
            let s = String::deserialize(d)?;
            TxSignature::from_b58(&s).map_err(serde::de::Error::custom)
        } else {
            let b = <Vec<u8>>::deserialize(d)?;
            if b.len() != 64 {
                return Err(serde::de::Error::custom("expected 64 bytes"));
            }
            let mut arr = [0u8; 64];
            arr.copy_from_slice(&b);
            Ok(TxSignature(arr))
        }
    }
}

// ── Blockhash ────────────────────────────────────────────────────────────────

/// A recent blockhash together with the block height past which transactions
/// referencing it are no longer accepted.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct RecentBlockhash {
    pub blockhash: String,
    pub last_valid_block_height: u64,
}

// ── Identifier newtypes ──────────────────────────────────────────────────────

/// 16 random bytes, hex-encoded, prefixed per kind.
fn fresh_id(prefix: &str) -> String {
    let mut b = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut b);
    format!("{prefix}_{}", hex::encode(b))
}

macro_rules! string_id {
    ($(#[$doc:meta])* $name:ident, $prefix:literal) => {
        $(#[$doc])*
        #[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn generate() -> Self {
                Self(fresh_id($prefix))
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!(stringify!($name), "({})"), self.0)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }
    };
}

string_id!(
    /// Stable identifier of a stealth pool.
    PoolId,
    "pool"
);
string_id!(
    /// Identifier of one payment session (also used as the reservation key).
    SessionId,
    "sess"
);
string_id!(
    /// Identifier of a shadow link invoice.
    LinkId,
    "link"
);
string_id!(
    /// Identifier of a registered agent.
    AgentId,
    "agent"
);
