// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Password Hashing
//!
//! Accounts never store plaintext passwords. Hashes are salted
//! PBKDF2-HMAC-SHA256 encoded as `pbkdf2-sha256$<iterations>$<salt>$<hash>`
//! with hex salt and hash, so the iteration count travels with each record.

use std::num::NonZeroU32;

use ring::pbkdf2;
use ring::rand::{SecureRandom, SystemRandom};

use crate::error::StorageError;

/// Default PBKDF2 iteration count for newly provisioned accounts.
pub const DEFAULT_ITERATIONS: u32 = 100_000;

const SCHEME: &str = "pbkdf2-sha256";
const SALT_LEN: usize = 16;
const HASH_LEN: usize = 32;

static ALGORITHM: pbkdf2::Algorithm = pbkdf2::PBKDF2_HMAC_SHA256;

const ABSENT_SALT: [u8; SALT_LEN] = [0x5a; SALT_LEN];
const ABSENT_HASH: [u8; HASH_LEN] = [0; HASH_LEN];

/// Hashes a password with a fresh random salt.
pub fn hash_password(password: &str, iterations: u32) -> Result<String, StorageError> {
    let iterations = NonZeroU32::new(iterations)
        .ok_or_else(|| StorageError::CredentialFormat("iterations must be non-zero".into()))?;

    let mut salt = [0u8; SALT_LEN];
    SystemRandom::new()
        .fill(&mut salt)
        .map_err(|_| StorageError::CredentialFormat("salt generation failed".into()))?;

    let mut hash = [0u8; HASH_LEN];
    pbkdf2::derive(ALGORITHM, iterations, &salt, password.as_bytes(), &mut hash);

    Ok(format!(
        "{}${}${}${}",
        SCHEME,
        iterations,
        hex::encode(salt),
        hex::encode(hash)
    ))
}

/// Checks a password against an encoded hash in constant time.
///
/// Returns `Ok(false)` for a wrong password and `Err` only when the stored
/// record itself is unreadable.
pub fn verify_password(password: &str, encoded: &str) -> Result<bool, StorageError> {
    let mut parts = encoded.split('$');
    let (scheme, iterations, salt, hash) =
        match (parts.next(), parts.next(), parts.next(), parts.next(), parts.next()) {
            (Some(s), Some(i), Some(salt), Some(hash), None) => (s, i, salt, hash),
            _ => return Err(StorageError::CredentialFormat("wrong field count".into())),
        };

    if scheme != SCHEME {
        return Err(StorageError::CredentialFormat(format!(
            "unsupported scheme `{}`",
            scheme
        )));
    }

    let iterations = iterations
        .parse::<u32>()
        .ok()
        .and_then(NonZeroU32::new)
        .ok_or_else(|| StorageError::CredentialFormat("bad iteration count".into()))?;
    let salt =
        hex::decode(salt).map_err(|_| StorageError::CredentialFormat("bad salt hex".into()))?;
    let hash =
        hex::decode(hash).map_err(|_| StorageError::CredentialFormat("bad hash hex".into()))?;

    Ok(pbkdf2::verify(ALGORITHM, iterations, &salt, password.as_bytes(), &hash).is_ok())
}

/// Does the PBKDF2 work of a failed [`verify_password`] for a username with
/// no account, so unknown names cost as much as wrong passwords.
pub fn verify_absent(password: &str, iterations: u32) {
    let iterations = NonZeroU32::new(iterations).unwrap_or(NonZeroU32::MIN);
    let _ = pbkdf2::verify(
        ALGORITHM,
        iterations,
        &ABSENT_SALT,
        password.as_bytes(),
        &ABSENT_HASH,
    );
}
