use crate::transaction::{Transaction, TxSignature};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use log::debug;

/// Signature predicate injected into transaction admission.
///
/// Key generation and storage belong to the key-management collaborator;
/// the ledger only asks whether a signature is valid.
pub trait SignatureVerifier: Send + Sync {
    fn verify(&self, signature: &[u8], transaction: &Transaction, public_key: &[u8]) -> bool;
}

/// Ed25519 over [`Transaction::signing_bytes`].
#[derive(Debug, Clone, Copy, Default)]
pub struct Ed25519Verifier;

impl SignatureVerifier for Ed25519Verifier {
    fn verify(&self, signature: &[u8], transaction: &Transaction, public_key: &[u8]) -> bool {
        let Ok(key_bytes) = <[u8; 32]>::try_from(public_key) else {
            return false;
        };
        let Ok(key) = VerifyingKey::from_bytes(&key_bytes) else {
            debug!("Rejecting transaction {}: public key is not a curve point", transaction.hash().short());
            return false;
        };
        let Ok(signature) = Signature::from_slice(signature) else {
            return false;
        };
        key.verify(&transaction.signing_bytes(), &signature).is_ok()
    }
}

/// Sign a transaction with an Ed25519 key (wallet-side helper).
pub fn sign_ed25519(signing_key: &SigningKey, transaction: Transaction) -> Transaction {
    let signature = signing_key.sign(&transaction.signing_bytes());
    let envelope = TxSignature {
        signature: signature.to_bytes().to_vec(),
        public_key: signing_key.verifying_key().to_bytes().to_vec(),
    };
    transaction.with_signature(envelope)
}
