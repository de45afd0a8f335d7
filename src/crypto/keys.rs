// src/crypto/keys.rs
use ed25519_dalek::{Signature, SigningKey, VerifyingKey};
use rand::rngs::OsRng;
use rand::RngCore;
use signature::{Signer, Verifier};

/// Verify a signature over `msg` using `pubkey` (32 bytes) and signature bytes (64).
/// Returns `false` for any malformed input.
pub fn verify_bytes(pubkey: &[u8], msg: &[u8], sig_bytes: &[u8]) -> bool {
    let Ok(pk) = <&[u8; 32]>::try_from(pubkey) else {
        return false;
    };
    let Ok(vk) = VerifyingKey::from_bytes(pk) else {
        return false;
    };
    let Ok(sig) = <&[u8; 64]>::try_from(sig_bytes) else {
        return false;
    };
    vk.verify(msg, &Signature::from_bytes(sig)).is_ok()
}

/// Sign `msg` with a 32-byte secret seed. None for a seed of the wrong length.
pub fn sign_bytes(secret_seed: &[u8], msg: &[u8]) -> Option<Vec<u8>> {
    let seed = <&[u8; 32]>::try_from(secret_seed).ok()?;
    let sk = SigningKey::from_bytes(seed);
    let sig: Signature = sk.sign(msg);
    Some(sig.to_bytes().to_vec())
}

/// Derive verifying (public) key bytes from a 32-byte seed.
pub fn public_from_seed(seed: &[u8]) -> Option<Vec<u8>> {
    let seed = <&[u8; 32]>::try_from(seed).ok()?;
    let sk = SigningKey::from_bytes(seed);
    Some(VerifyingKey::from(&sk).to_bytes().to_vec())
}

/// Fresh 32-byte validator seed from the OS RNG.
pub fn generate_seed() -> [u8; 32] {
    let mut seed = [0u8; 32];
    OsRng.fill_bytes(&mut seed);
    seed
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_then_verify() {
        let seed = [7u8; 32];
        let pk = public_from_seed(&seed).unwrap();
        let sig = sign_bytes(&seed, b"vote").unwrap();
        assert!(verify_bytes(&pk, b"vote", &sig));
        assert!(!verify_bytes(&pk, b"vote!", &sig));
    }

    #[test]
    fn wrong_key_fails() {
        let sig = sign_bytes(&[1u8; 32], b"m").unwrap();
        let other = public_from_seed(&[2u8; 32]).unwrap();
        assert!(!verify_bytes(&other, b"m", &sig));
    }

    #[test]
    fn short_seed_is_refused() {
        assert!(sign_bytes(&[1u8; 16], b"m").is_none());
        assert!(public_from_seed(&[]).is_none());
    }

    #[test]
    fn generated_seeds_differ() {
        assert_ne!(generate_seed(), generate_seed());
    }
}
