//! TOTP secret handling: generation, at-rest encryption, and code checks.
//!
//! Stored secrets are sealed with ChaCha20-Poly1305 under the server-side
//! key, AAD-bound to the owning user id so a row copied between users fails
//! to decrypt. Layout is `nonce (12 bytes) || ciphertext`.

use anyhow::{anyhow, Context, Result};
use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    ChaCha20Poly1305, Key, Nonce,
};
use rand::{rngs::OsRng, RngCore};
use totp_rs::{Algorithm, Secret, TOTP};
use uuid::Uuid;

const NONCE_LEN: usize = 12;
const SECRET_LEN: usize = 20;

/// Generate a fresh TOTP secret and return it with its base32 form.
pub(super) fn generate_secret() -> Result<(Vec<u8>, String)> {
    let secret = Secret::generate_secret();
    let bytes = secret
        .to_bytes()
        .map_err(|err| anyhow!("failed to generate TOTP secret: {err:?}"))?;
    let encoded = match secret.to_encoded() {
        Secret::Encoded(encoded) => encoded,
        Secret::Raw(_) => return Err(anyhow!("TOTP secret did not encode")),
    };
    Ok((bytes, encoded))
}

/// Decode a base32 secret submitted back during activation.
pub(super) fn decode_secret(encoded: &str) -> Result<Vec<u8>, &'static str> {
    let bytes = Secret::Encoded(encoded.trim().to_string())
        .to_bytes()
        .map_err(|_| "Invalid secret")?;
    if bytes.len() != SECRET_LEN {
        return Err("Invalid secret");
    }
    Ok(bytes)
}

/// Build the otpauth URL for authenticator-app enrollment.
pub(super) fn otpauth_url(secret: &[u8], issuer: &str, account: &str) -> Result<String> {
    let totp = TOTP::new(
        Algorithm::SHA1,
        6,
        1,
        30,
        secret.to_vec(),
        Some(issuer.to_string()),
        account.to_string(),
    )
    .map_err(|err| anyhow!("failed to build TOTP: {err:?}"))?;
    Ok(totp.get_url())
}

/// Check a submitted code against the secret, allowing one period of skew.
pub(super) fn verify_code(secret: &[u8], code: &str) -> Result<bool> {
    let totp = TOTP::new(
        Algorithm::SHA1,
        6,
        1,
        30,
        secret.to_vec(),
        None,
        String::new(),
    )
    .map_err(|err| anyhow!("failed to build TOTP: {err:?}"))?;
    totp.check_current(code.trim())
        .context("system clock error during TOTP check")
}

/// Seal a secret for storage. Returns `nonce || ciphertext`.
pub(super) fn encrypt_secret(key: &[u8; 32], secret: &[u8], user_id: Uuid) -> Result<Vec<u8>> {
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key));

    let mut nonce_bytes = [0u8; NONCE_LEN];
    OsRng
        .try_fill_bytes(&mut nonce_bytes)
        .context("failed to generate nonce")?;
    let nonce = Nonce::from_slice(&nonce_bytes);

    let aad = user_id.as_bytes().to_vec();
    let payload = Payload {
        msg: secret,
        aad: &aad,
    };
    let ciphertext = cipher
        .encrypt(nonce, payload)
        .map_err(|err| anyhow!("failed to encrypt TOTP secret: {err}"))?;

    let mut sealed = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    sealed.extend_from_slice(&nonce_bytes);
    sealed.extend_from_slice(&ciphertext);
    Ok(sealed)
}

/// Open a sealed secret; fails when the key or the bound user id is wrong.
pub(super) fn decrypt_secret(key: &[u8; 32], sealed: &[u8], user_id: Uuid) -> Result<Vec<u8>> {
    if sealed.len() <= NONCE_LEN {
        return Err(anyhow!("sealed TOTP secret is too short"));
    }
    let (nonce_bytes, ciphertext) = sealed.split_at(NONCE_LEN);
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key));
    let aad = user_id.as_bytes().to_vec();
    let payload = Payload {
        msg: ciphertext,
        aad: &aad,
    };
    cipher
        .decrypt(Nonce::from_slice(nonce_bytes), payload)
        .map_err(|err| anyhow!("failed to decrypt TOTP secret: {err}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_secret_round_trips_base32() {
        let Ok((bytes, encoded)) = generate_secret() else {
            panic!("secret generation failed");
        };
        assert_eq!(bytes.len(), SECRET_LEN);
        assert_eq!(decode_secret(&encoded).ok().as_deref(), Some(&bytes[..]));
    }

    #[test]
    fn decode_secret_rejects_garbage() {
        assert!(decode_secret("not base32 at all!").is_err());
        assert!(decode_secret("").is_err());
    }

    #[test]
    fn otpauth_url_carries_issuer_and_account() {
        let secret = vec![1u8; SECRET_LEN];
        let url = otpauth_url(&secret, "Hub", "alice@example.com").unwrap_or_default();
        assert!(url.starts_with("otpauth://totp/"));
        assert!(url.contains("Hub"));
    }

    #[test]
    fn encrypt_decrypt_round_trip_binds_user() {
        let key = [9u8; 32];
        let secret = vec![7u8; SECRET_LEN];
        let user = Uuid::new_v4();
        let other = Uuid::new_v4();

        let Ok(sealed) = encrypt_secret(&key, &secret, user) else {
            panic!("encrypt failed");
        };
        assert_eq!(decrypt_secret(&key, &sealed, user).ok(), Some(secret));
        assert!(decrypt_secret(&key, &sealed, other).is_err());
    }

    #[test]
    fn decrypt_rejects_truncated_blob() {
        let key = [9u8; 32];
        assert!(decrypt_secret(&key, &[0u8; 8], Uuid::nil()).is_err());
    }
}
