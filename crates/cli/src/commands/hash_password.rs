use secmgr_idp::auth::hash_password;

/// Run the `hash-password` command: print an Argon2id hash for a local account.
pub fn run(password: &str) -> anyhow::Result<()> {
    if password.is_empty() {
        anyhow::bail!("password must not be empty");
    }
    let hash = hash_password(password)?;
    println!("{hash}");
    Ok(())
}
