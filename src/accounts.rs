//! Account registration and password login.
//!
//! Passwords are hashed with Argon2 into PHC strings; only the hash reaches
//! the [`UserDirectory`].  Both operations end by minting a bearer token.

use crate::canonical::Clock;
use crate::identity::{AuthError, TokenAuthority};
use crate::model::{Identity, InputError};
use crate::store::{StoreError, UserDirectory, UserRecord};
use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::Argon2;
use rand_core::OsRng;
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};
use unicode_general_category::{get_general_category, GeneralCategory};

const MIN_PASSWORD_LEN: usize = 8;
const MAX_PASSWORD_LEN: usize = 100;

/// Registration and login failures.
#[derive(Debug, Error)]
pub enum AccountError {
    /// The email is not a valid identity.
    #[error("Invalid email")]
    InvalidEmail,
    /// The password does not meet the policy.
    #[error(
        "Password must be at least 8 characters, include an uppercase letter, \
         a symbol, and a number, and not exceed 100 characters"
    )]
    WeakPassword,
    /// An account with this email already exists.
    #[error("Email is already registered")]
    EmailTaken,
    /// Unknown email or wrong password.
    #[error("invalid email or password")]
    BadCredentials,
    /// Hashing or verification machinery failed.
    #[error("password hashing error: {0}")]
    Hash(String),
    /// Token minting failed.
    #[error("Error generating the token: {0}")]
    Token(#[from] AuthError),
    /// The directory could not be read or written.
    #[error("Error creating the user: {0}")]
    Store(StoreError),
}

impl From<InputError> for AccountError {
    fn from(_: InputError) -> Self {
        AccountError::InvalidEmail
    }
}

/// `true` for 8-100 byte passwords with upper, lower, digit and symbol.
///
/// Classes follow Unicode general categories: `Lu`, `Ll`, `Nd`, and any
/// punctuation (`P*`) or symbol (`S*`) counts as the special character.
pub fn is_valid_password(password: &str) -> bool {
    use GeneralCategory::*;

    if password.len() < MIN_PASSWORD_LEN || password.len() > MAX_PASSWORD_LEN {
        return false;
    }
    let (mut upper, mut lower, mut digit, mut special) = (false, false, false, false);
    for c in password.chars() {
        match get_general_category(c) {
            UppercaseLetter => upper = true,
            LowercaseLetter => lower = true,
            DecimalNumber => digit = true,
            ConnectorPunctuation | DashPunctuation | OpenPunctuation | ClosePunctuation
            | InitialPunctuation | FinalPunctuation | OtherPunctuation | MathSymbol
            | CurrencySymbol | ModifierSymbol | OtherSymbol => special = true,
            _ => {}
        }
    }
    upper && lower && digit && special
}

/// Owns the account directory and the token authority.
#[derive(Clone)]
pub struct AccountService {
    users: Arc<dyn UserDirectory>,
    tokens: Arc<TokenAuthority>,
    clock: Arc<dyn Clock>,
}

impl AccountService {
    /// Wires the service to its directory, token authority and clock.
    pub fn new(
        users: Arc<dyn UserDirectory>,
        tokens: Arc<TokenAuthority>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            users,
            tokens,
            clock,
        }
    }

    /// Creates an account and returns a token for it.
    pub async fn register(&self, email: &str, password: &str) -> Result<String, AccountError> {
        let email = Identity::parse(email)?;
        if !is_valid_password(password) {
            return Err(AccountError::WeakPassword);
        }
        if self
            .users
            .find_user(&email)
            .await
            .map_err(AccountError::Store)?
            .is_some()
        {
            return Err(AccountError::EmailTaken);
        }

        let password_hash = hash_password(password.to_string()).await?;
        let record = UserRecord {
            email: email.clone(),
            password_hash,
            created_at: self.clock.unix_now(),
        };
        match self.users.insert_user(&record).await {
            Ok(()) => {}
            Err(StoreError::Conflict(_)) => return Err(AccountError::EmailTaken),
            Err(err) => {
                warn!(module = "accounts", evt = "INSERT_FAILED", identity = %email, error = %err);
                return Err(AccountError::Store(err));
            }
        }
        info!(module = "accounts", evt = "REGISTERED", identity = %email);
        Ok(self.tokens.issue(&email)?)
    }

    /// Checks the password and returns a fresh token.
    pub async fn login(&self, email: &str, password: &str) -> Result<String, AccountError> {
        let email = Identity::parse(email).map_err(|_| AccountError::BadCredentials)?;
        let Some(user) = self
            .users
            .find_user(&email)
            .await
            .map_err(AccountError::Store)?
        else {
            return Err(AccountError::BadCredentials);
        };
        if !verify_password(password.to_string(), user.password_hash).await? {
            info!(module = "accounts", evt = "LOGIN_REJECTED", identity = %email);
            return Err(AccountError::BadCredentials);
        }
        Ok(self.tokens.issue(&email)?)
    }
}

async fn hash_password(password: String) -> Result<String, AccountError> {
    tokio::task::spawn_blocking(move || {
        let salt = SaltString::generate(&mut OsRng);
        Argon2::default()
            .hash_password(password.as_bytes(), &salt)
            .map(|hash| hash.to_string())
            .map_err(|e| AccountError::Hash(e.to_string()))
    })
    .await
    .map_err(|e| AccountError::Hash(e.to_string()))?
}

async fn verify_password(password: String, stored: String) -> Result<bool, AccountError> {
    tokio::task::spawn_blocking(move || {
        let parsed = PasswordHash::new(&stored).map_err(|e| AccountError::Hash(e.to_string()))?;
        Ok(Argon2::default()
            .verify_password(password.as_bytes(), &parsed)
            .is_ok())
    })
    .await
    .map_err(|e| AccountError::Hash(e.to_string()))?
}
