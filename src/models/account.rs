//! Ledger accounts and the exchange-assigned deposit subaccount.

use std::fmt;

use serde::{Deserialize, Deserializer, Serialize, Serializer, de};
use sha2::{Digest, Sha256};

/// Domain separator mixed into deposit subaccount derivation.
const DEPOSIT_DOMAIN: &[u8] = b"deposit";

/// A 32-byte ledger subaccount, hex encoded on the wire.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Subaccount(pub [u8; 32]);

impl fmt::Debug for Subaccount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Subaccount({})", hex::encode(self.0))
    }
}

impl Serialize for Subaccount {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(self.0))
    }
}

impl<'de> Deserialize<'de> for Subaccount {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        let bytes = hex::decode(&text).map_err(de::Error::custom)?;
        let bytes: [u8; 32] = bytes
            .try_into()
            .map_err(|v: Vec<u8>| de::Error::custom(format!("expected 32 bytes, got {}", v.len())))?;
        Ok(Self(bytes))
    }
}

/// An owner principal plus optional subaccount.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Account {
    pub owner: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subaccount: Option<Subaccount>,
}

impl Account {
    /// The default account of `owner`.
    pub fn of(owner: impl Into<String>) -> Self {
        Self {
            owner: owner.into(),
            subaccount: None,
        }
    }

    /// The exchange-owned account into which `user` deposits directly.
    ///
    /// The subaccount is `SHA-256("deposit" || user)`, so it is stable across
    /// sessions and unique per user.
    pub fn deposit_account(exchange: impl Into<String>, user: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(DEPOSIT_DOMAIN);
        hasher.update(user.as_bytes());
        Self {
            owner: exchange.into(),
            subaccount: Some(Subaccount(hasher.finalize().into())),
        }
    }
}
