//! Recovery code generation and verification.
//!
//! Each user holds exactly one recovery code at a time. It is consumed at
//! most once per two-factor reset and immediately replaced. Codes are
//! Argon2id-hashed with a server-side pepper.

use anyhow::{Context, Result};
use argon2::{
    password_hash::SaltString, Argon2, PasswordHash, PasswordHasher, PasswordVerifier,
};
use rand::{rngs::OsRng, RngCore};

const RECOVERY_CODE_LEN: usize = 12;
const RECOVERY_CODE_GROUP_SIZE: usize = 4;
const RECOVERY_CODE_ALPHABET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";

/// A freshly generated recovery code (plaintext + hash).
#[derive(Debug)]
pub struct RecoveryCode {
    pub code: String,
    pub code_hash: String,
}

impl RecoveryCode {
    /// Generate a new recovery code using the provided pepper.
    pub fn generate(pepper: &[u8]) -> Result<Self> {
        let code = generate_code()?;
        let code_hash = hash_recovery_code(&code, pepper)?;
        Ok(Self { code, code_hash })
    }
}

/// Normalize a recovery code for verification.
pub fn normalize_recovery_code(input: &str) -> Result<String> {
    let normalized: String = input
        .chars()
        .filter(char::is_ascii_alphanumeric)
        .map(|ch| ch.to_ascii_uppercase())
        .collect();

    if normalized.len() != RECOVERY_CODE_LEN {
        return Err(anyhow::anyhow!("invalid recovery code length"));
    }

    if !normalized
        .as_bytes()
        .iter()
        .all(|ch| RECOVERY_CODE_ALPHABET.contains(ch))
    {
        return Err(anyhow::anyhow!("invalid recovery code characters"));
    }

    Ok(normalized)
}

/// Format a normalized recovery code for display.
pub fn format_recovery_code(normalized: &str) -> Result<String> {
    if normalized.len() != RECOVERY_CODE_LEN {
        return Err(anyhow::anyhow!("invalid recovery code length"));
    }
    let mut out = String::with_capacity(RECOVERY_CODE_LEN + 2);
    for (idx, chunk) in normalized
        .as_bytes()
        .chunks(RECOVERY_CODE_GROUP_SIZE)
        .enumerate()
    {
        if idx > 0 {
            out.push('-');
        }
        out.push_str(std::str::from_utf8(chunk).context("invalid recovery code chunk")?);
    }
    Ok(out)
}

/// Verify a recovery code against a stored hash.
pub fn verify_recovery_code(code: &str, stored_hash: &str, pepper: &[u8]) -> Result<bool> {
    let normalized = normalize_recovery_code(code)?;
    let parsed = PasswordHash::new(stored_hash)
        .map_err(|_| anyhow::anyhow!("invalid recovery code hash"))?;
    let argon2 = peppered_argon2(pepper)?;
    Ok(argon2
        .verify_password(normalized.as_bytes(), &parsed)
        .is_ok())
}

fn peppered_argon2(pepper: &[u8]) -> Result<Argon2<'_>> {
    Argon2::new_with_secret(
        pepper,
        argon2::Algorithm::Argon2id,
        argon2::Version::V0x13,
        argon2::Params::default(),
    )
    .map_err(|_| anyhow::anyhow!("failed to initialize Argon2id"))
}

/// Generate a single recovery code in grouped form.
fn generate_code() -> Result<String> {
    let mut raw = [0u8; RECOVERY_CODE_LEN];
    OsRng
        .try_fill_bytes(&mut raw)
        .context("failed to generate recovery code")?;
    let mut normalized = String::with_capacity(RECOVERY_CODE_LEN);
    for byte in raw {
        let idx = usize::from(byte) % RECOVERY_CODE_ALPHABET.len();
        if let Some(&char_byte) = RECOVERY_CODE_ALPHABET.get(idx) {
            normalized.push(char_byte as char);
        }
    }
    format_recovery_code(&normalized)
}

/// Hash a recovery code using Argon2id with the server-side pepper.
fn hash_recovery_code(code: &str, pepper: &[u8]) -> Result<String> {
    let normalized = normalize_recovery_code(code)?;
    let salt = SaltString::generate(&mut OsRng);
    let argon2 = peppered_argon2(pepper)?;
    let hash = argon2
        .hash_password(normalized.as_bytes(), &salt)
        .map_err(|_| anyhow::anyhow!("failed to hash recovery code"))?
        .to_string();
    Ok(hash)
}
