//! Password verification for form mechanisms.

use argon2::{
    password_hash::{PasswordHasher, SaltString},
    Argon2, PasswordHash, PasswordVerifier,
};
use secmgr_core::config::{LocalAccount, MechanismConfig};
use secmgr_core::error::{Result, SecmgrError};

/// Hash a password using Argon2id.
pub fn hash_password(password: &str) -> Result<String> {
    let salt = SaltString::generate(&mut rand::rngs::OsRng);
    let argon2 = Argon2::default();
    let hash = argon2
        .hash_password(password.as_bytes(), &salt)
        .map_err(|e| SecmgrError::Auth(format!("failed to hash password: {e}")))?;
    Ok(hash.to_string())
}

/// Verify a password against an Argon2id hash.
pub fn verify_password(hash: &str, password: &str) -> Result<bool> {
    let parsed_hash = PasswordHash::new(hash)
        .map_err(|e| SecmgrError::Auth(format!("invalid password hash: {e}")))?;
    Ok(Argon2::default()
        .verify_password(password.as_bytes(), &parsed_hash)
        .is_ok())
}

/// Authenticate a username and password against a form mechanism's accounts.
///
/// Usernames compare case-insensitively. Returns the matching account.
pub fn authenticate_form<'a>(
    mechanism: &'a MechanismConfig,
    username: &str,
    password: &str,
) -> Result<&'a LocalAccount> {
    let MechanismConfig::Form { accounts, .. } = mechanism else {
        return Err(SecmgrError::Auth(format!(
            "mechanism {} does not take form credentials",
            mechanism.name()
        )));
    };
    let account = accounts
        .iter()
        .find(|a| a.username.eq_ignore_ascii_case(username.trim()))
        .ok_or_else(|| SecmgrError::Auth("invalid credentials".into()))?;

    if !verify_password(&account.password_hash, password)? {
        return Err(SecmgrError::Auth("invalid credentials".into()));
    }
    Ok(account)
}
