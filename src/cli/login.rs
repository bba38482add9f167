//! Login command: persist registry credentials

use crate::registry::auth::{AuthError, AuthFileHelper};
use crate::storage::paths;
use crate::TOKEN_USERNAME;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum LoginError {
    #[error("Auth error: {0}")]
    Auth(#[from] AuthError),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

/// Prompt for a secret (no echo) and store it for `server_url`.
///
/// A blank username means the secret is a token; the stored username is
/// the `<token>` sentinel the registry auth understands.
pub fn login(server_url: &str, username: &str, auth_file: &str) -> Result<(), LoginError> {
    let auth_file = paths::expand_path(auth_file);

    let username = if username.is_empty() {
        TOKEN_USERNAME
    } else {
        username
    };

    let secret = rpassword::prompt_password("Secret: ")?;

    AuthFileHelper::new(auth_file).add(server_url, username, &secret)?;
    Ok(())
}
