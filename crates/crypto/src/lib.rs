//! Signature abstraction for channel messages.
//!
//! Channels identify participants by an address string.  The verifier
//! recovers the signing address from a message and signature, and the
//! signer produces signatures for exactly one address.  The concrete
//! scheme here is recoverable secp256k1 ECDSA over the SHA-256 digest
//! of the message, with the address derived from the public key.  Test
//! code substitutes fake implementations of the same traits.

use armada_primitives::hash::sha256;
use secp256k1::ecdsa::{RecoverableSignature, RecoveryId};
use secp256k1::{All, Message, PublicKey, Secp256k1, SecretKey};

/// Sentinel address returned when a signature cannot be recovered.
///
/// Real addresses are 40 hex characters, so this value can never match
/// a participant address.
pub const INVALID_ADDRESS: &str = "invalid";

/// Recovers the signer address of a message.  Implementations must be
/// pure and must return [`INVALID_ADDRESS`] on malformed input.
pub trait SignatureVerifier: Send + Sync {
    fn recover_signer(&self, message: &str, signature: &[u8]) -> String;
}

/// Signs messages for a single address.
pub trait SignatureSigner: Send {
    /// The address this signer signs for.
    fn address(&self) -> &str;

    /// Signs a message, returning the encoded signature.
    fn sign_message(&self, message: &str) -> Vec<u8>;
}

/// Derives the address string for a public key.
///
/// The address is the hex encoding of the first 20 bytes of the SHA-256
/// digest of the compressed public key.
pub fn address_for_pubkey(pubkey: &PublicKey) -> String {
    let digest = sha256(&pubkey.serialize());
    hex::encode(&digest.as_slice()[..20])
}

fn message_digest(message: &str) -> Message {
    Message::from_digest(*sha256(message.as_bytes()).as_bytes())
}

/// Verifier recovering addresses from recoverable ECDSA signatures.
///
/// The wire encoding of a signature is 65 bytes: one recovery id byte
/// followed by the 64-byte compact signature.
pub struct EcdsaVerifier {
    secp: Secp256k1<All>,
}

impl EcdsaVerifier {
    pub fn new() -> Self {
        Self {
            secp: Secp256k1::new(),
        }
    }

    fn try_recover(&self, message: &str, signature: &[u8]) -> Option<String> {
        if signature.len() != 65 {
            return None;
        }
        let rec_id = RecoveryId::from_i32(signature[0] as i32).ok()?;
        let sig = RecoverableSignature::from_compact(&signature[1..], rec_id).ok()?;
        let pubkey = self.secp.recover_ecdsa(&message_digest(message), &sig).ok()?;
        Some(address_for_pubkey(&pubkey))
    }
}

impl Default for EcdsaVerifier {
    fn default() -> Self {
        Self::new()
    }
}

impl SignatureVerifier for EcdsaVerifier {
    fn recover_signer(&self, message: &str, signature: &[u8]) -> String {
        self.try_recover(message, signature)
            .unwrap_or_else(|| INVALID_ADDRESS.to_owned())
    }
}

/// Signer holding a single secp256k1 secret key.
pub struct EcdsaSigner {
    secp: Secp256k1<All>,
    secret: SecretKey,
    address: String,
}

impl EcdsaSigner {
    pub fn new(secret: SecretKey) -> Self {
        let secp = Secp256k1::new();
        let address = address_for_pubkey(&secret.public_key(&secp));
        Self {
            secp,
            secret,
            address,
        }
    }

    /// Constructs a signer from a 32-byte secret key.
    pub fn from_secret_bytes(bytes: &[u8]) -> Option<Self> {
        SecretKey::from_slice(bytes).ok().map(Self::new)
    }
}

impl SignatureSigner for EcdsaSigner {
    fn address(&self) -> &str {
        &self.address
    }

    fn sign_message(&self, message: &str) -> Vec<u8> {
        let sig = self
            .secp
            .sign_ecdsa_recoverable(&message_digest(message), &self.secret);
        let (rec_id, compact) = sig.serialize_compact();
        let mut out = Vec::with_capacity(65);
        out.push(rec_id.to_i32() as u8);
        out.extend_from_slice(&compact);
        out
    }
}
