use ed25519_dalek::{Keypair, PublicKey, SecretKey, Signature, Signer, Verifier};
use rand::rngs::OsRng;
use rand::RngCore;

use crate::errors::{NodeError, NodeResult};

/// Peer identities are 33 bytes on the wire: a one-byte key-type prefix
/// followed by the raw ed25519 public key.
pub const PUBKEY_LEN: usize = 33;
pub const KEY_TYPE_ED25519: u8 = 0xed;
pub const SIG_LEN: usize = 64;

pub fn generate_keypair() -> Keypair {
    Keypair::generate(&mut OsRng)
}

/// Prefixed binary form of a public key, as carried in proposals, the UNL
/// and the config file.
pub fn pubkey_bytes(public: &PublicKey) -> Vec<u8> {
    let mut out = Vec::with_capacity(PUBKEY_LEN);
    out.push(KEY_TYPE_ED25519);
    out.extend_from_slice(public.as_bytes());
    out
}

pub fn public_key_from_bin(bin: &[u8]) -> NodeResult<PublicKey> {
    if bin.len() != PUBKEY_LEN || bin[0] != KEY_TYPE_ED25519 {
        return Err(NodeError::SignatureInvalid(
            "unsupported public key encoding".into(),
        ));
    }
    PublicKey::from_bytes(&bin[1..])
        .map_err(|err| NodeError::SignatureInvalid(format!("invalid public key bytes: {err}")))
}

pub fn keypair_from_bin(private: &[u8], public: &[u8]) -> NodeResult<Keypair> {
    let secret = SecretKey::from_bytes(private)
        .map_err(|err| NodeError::ConfigInvalid(format!("invalid secret key bytes: {err}")))?;
    let public = public_key_from_bin(public)?;
    Ok(Keypair { secret, public })
}

pub fn sign(message: &[u8], keypair: &Keypair) -> Vec<u8> {
    keypair.sign(message).to_bytes().to_vec()
}

pub fn verify(message: &[u8], sig: &[u8], pubkey_bin: &[u8]) -> NodeResult<()> {
    let public = public_key_from_bin(pubkey_bin)?;
    let signature = Signature::from_bytes(sig)
        .map_err(|err| NodeError::SignatureInvalid(format!("invalid signature bytes: {err}")))?;
    public
        .verify(message, &signature)
        .map_err(|err| NodeError::SignatureInvalid(format!("verification failed: {err}")))
}

pub fn random_bytes(len: usize) -> Vec<u8> {
    let mut buf = vec![0u8; len];
    OsRng.fill_bytes(&mut buf);
    buf
}

/// Random identifier for a freshly created contract directory.
pub fn generate_contract_id() -> String {
    let bytes = random_bytes(16);
    format!(
        "{}-{}-{}-{}-{}",
        hex::encode(&bytes[0..4]),
        hex::encode(&bytes[4..6]),
        hex::encode(&bytes[6..8]),
        hex::encode(&bytes[8..10]),
        hex::encode(&bytes[10..16])
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_verify_round_trip() {
        let keypair = generate_keypair();
        let pubkey = pubkey_bytes(&keypair.public);
        let sig = sign(b"round data", &keypair);
        verify(b"round data", &sig, &pubkey).expect("verify");
        assert!(verify(b"tampered", &sig, &pubkey).is_err());
    }

    #[test]
    fn rejects_unprefixed_public_key() {
        let keypair = generate_keypair();
        let raw = keypair.public.as_bytes().to_vec();
        assert!(public_key_from_bin(&raw).is_err());
    }

    #[test]
    fn keypair_reconstructs_from_binary() {
        let keypair = generate_keypair();
        let public = pubkey_bytes(&keypair.public);
        let private = keypair.secret.to_bytes().to_vec();
        let restored = keypair_from_bin(&private, &public).expect("restore");
        let sig = sign(b"payload", &restored);
        verify(b"payload", &sig, &public).expect("verify");
    }

    #[test]
    fn contract_id_has_uuid_shape() {
        let id = generate_contract_id();
        assert_eq!(id.split('-').count(), 5);
        assert_eq!(id.len(), 36);
    }
}
