use crate::error::ValidationError;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// Balances and transfer amounts, in base units.
pub type Amount = u128;

/// Number of decimal places carried by every asset.
pub const DECIMALS: u32 = 8;

/// One whole asset unit expressed in base units.
pub const UNIT: Amount = 100_000_000;

/// Reserved sender for mining rewards and other issuance.
pub const NETWORK_SENDER: &str = "network";

/// Native ledger asset.
pub const DEFAULT_ASSET: &str = "QFC";

/// Convert whole units into base units.
pub fn units(whole: u64) -> Amount {
    whole as Amount * UNIT
}

/// Transaction identifier: SHA-256 of the signing material.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TxHash(pub [u8; 32]);

impl TxHash {
    pub fn as_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// First eight hex characters, for log lines.
    pub fn short(&self) -> String {
        hex::encode(&self.0[..4])
    }
}

impl fmt::Display for TxHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.as_hex())
    }
}

/// Detached signature plus the key it claims to verify under.
///
/// The public key travels with the transaction because the ledger stores no keys.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxSignature {
    pub signature: Vec<u8>,
    pub public_key: Vec<u8>,
}

/// A value transfer of one asset between two accounts.
///
/// Fields are private: a transaction is immutable once built, and its hash is
/// only meaningful as long as nothing rewrites it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    sender: String,
    recipient: String,
    amount: Amount,
    asset: String,
    timestamp: i64,
    #[serde(default)]
    nonce: u64,
    #[serde(default)]
    signature: Option<TxSignature>,
}

/// Deterministically ordered hash view (field order is the serialization order).
#[derive(Serialize)]
struct SigningView<'a> {
    amount: String,
    asset: &'a str,
    nonce: u64,
    recipient: &'a str,
    sender: &'a str,
    timestamp: i64,
}

impl Transaction {
    /// Build and validate a transfer stamped with the current time.
    pub fn new(
        sender: impl Into<String>,
        recipient: impl Into<String>,
        amount: Amount,
        asset: impl Into<String>,
    ) -> Result<Self, ValidationError> {
        Self::with_timestamp(sender, recipient, amount, asset, Utc::now().timestamp_millis())
    }

    pub fn with_timestamp(
        sender: impl Into<String>,
        recipient: impl Into<String>,
        amount: Amount,
        asset: impl Into<String>,
        timestamp: i64,
    ) -> Result<Self, ValidationError> {
        let tx = Transaction {
            sender: sender.into(),
            recipient: recipient.into(),
            amount,
            asset: asset.into(),
            timestamp,
            nonce: 0,
            signature: None,
        };
        tx.validate()?;
        Ok(tx)
    }

    /// Issuance from the reserved network sender (mining rewards).
    pub fn issuance(
        recipient: impl Into<String>,
        amount: Amount,
        asset: impl Into<String>,
        nonce: u64,
    ) -> Result<Self, ValidationError> {
        Ok(Self::with_timestamp(
            NETWORK_SENDER,
            recipient,
            amount,
            asset,
            Utc::now().timestamp_millis(),
        )?
        .with_nonce(nonce))
    }

    /// Distinguishes otherwise identical transfers; part of the hash.
    pub fn with_nonce(mut self, nonce: u64) -> Self {
        self.nonce = nonce;
        self
    }

    pub fn with_signature(mut self, signature: TxSignature) -> Self {
        self.signature = Some(signature);
        self
    }

    /// Structural checks. Deserialized transactions bypass the constructor,
    /// so admission calls this again.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.sender.is_empty() || self.recipient.is_empty() {
            return Err(ValidationError::EmptyAccount);
        }
        if self.asset.is_empty() {
            return Err(ValidationError::EmptyAsset);
        }
        if self.amount == 0 {
            return Err(ValidationError::NonPositiveAmount);
        }
        if self.sender == self.recipient {
            return Err(ValidationError::SelfTransfer(self.sender.clone()));
        }
        Ok(())
    }

    pub fn sender(&self) -> &str {
        &self.sender
    }

    pub fn recipient(&self) -> &str {
        &self.recipient
    }

    pub fn amount(&self) -> Amount {
        self.amount
    }

    pub fn asset(&self) -> &str {
        &self.asset
    }

    pub fn timestamp(&self) -> i64 {
        self.timestamp
    }

    pub fn nonce(&self) -> u64 {
        self.nonce
    }

    pub fn signature(&self) -> Option<&TxSignature> {
        self.signature.as_ref()
    }

    pub fn is_issuance(&self) -> bool {
        self.sender == NETWORK_SENDER
    }

    /// Bytes covered by the sender's signature. The signature itself is excluded.
    pub fn signing_bytes(&self) -> Vec<u8> {
        let view = SigningView {
            amount: self.amount.to_string(),
            asset: &self.asset,
            nonce: self.nonce,
            recipient: &self.recipient,
            sender: &self.sender,
            timestamp: self.timestamp,
        };
        // Serializing a struct of strings and integers cannot fail.
        serde_json::to_vec(&view).unwrap_or_default()
    }

    /// Canonical identifier, stable across signing.
    pub fn hash(&self) -> TxHash {
        let digest = Sha256::digest(self.signing_bytes());
        TxHash(digest.into())
    }
}
