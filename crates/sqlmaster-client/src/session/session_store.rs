//! Session Store
//!
//! Owns the bearer credential and the signed-in identity. It is the only writer
//! of session state; every other component reads the credential through
//! [`SessionStore::current_credential`] and reports 401s through
//! [`SessionStore::expire`]. The credential and identity are always stored and
//! cleared together.

use arc_swap::ArcSwapOption;
use std::fmt;
use std::sync::Arc;
use tracing::{error, info, warn};

use super::kv_store::{KvStore, TOKEN_KEY, USERNAME_KEY};
use crate::api::ApiClient;
use crate::error::{ClientError, ClientResult, ValidationError, MIN_SECRET_LEN};

/// Display name used when a token was persisted without its username.
pub const FALLBACK_IDENTITY: &str = "Explorer";

#[derive(Clone, PartialEq, Eq)]
pub struct Session {
    pub credential: String,
    pub identity: String,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("credential", &"<redacted>")
            .field("identity", &self.identity)
            .finish()
    }
}

pub struct SessionStore {
    api: ApiClient,
    kv: Arc<dyn KvStore>,
    current: ArcSwapOption<Session>,
}

impl SessionStore {
    /// Opens the store and restores a persisted session, if any.
    pub fn open(api: ApiClient, kv: Arc<dyn KvStore>) -> ClientResult<Self> {
        let token = kv.get(TOKEN_KEY).map_err(ClientError::Storage)?;
        let username = kv.get(USERNAME_KEY).map_err(ClientError::Storage)?;

        let restored = match token.filter(|t| !t.trim().is_empty()) {
            Some(credential) => {
                let identity = username
                    .filter(|u| !u.trim().is_empty())
                    .unwrap_or_else(|| FALLBACK_IDENTITY.to_string());
                info!("Restored session for '{}'", identity);
                Some(Arc::new(Session { credential, identity }))
            }
            None => {
                if username.is_some() {
                    warn!("Found a stored username without a token, treating as signed out");
                }
                None
            }
        };

        Ok(Self {
            api,
            kv,
            current: ArcSwapOption::new(restored),
        })
    }

    pub async fn sign_in(&self, identity: &str, secret: &str) -> ClientResult<Session> {
        let identity = identity.trim();
        if identity.is_empty() {
            return Err(ValidationError::MissingIdentity.into());
        }
        if secret.is_empty() {
            return Err(ValidationError::MissingSecret.into());
        }

        let credential = self.api.login(identity, secret).await.map_err(|e| {
            warn!("Sign-in failed for '{}': {}", identity, e);
            e
        })?;
        let session = Session {
            credential,
            identity: identity.to_string(),
        };
        self.store(session.clone())?;
        info!("Signed in as '{}'", session.identity);
        Ok(session)
    }

    /// Validates locally, registers, then signs in with the same credentials.
    pub async fn sign_up(
        &self,
        identity: &str,
        email: &str,
        secret: &str,
        secret_confirmation: &str,
    ) -> ClientResult<Session> {
        validate_sign_up(identity, email, secret, secret_confirmation)?;
        let identity = identity.trim();

        self.api.signup(identity, email.trim(), secret).await.map_err(|e| {
            warn!("Sign-up failed for '{}': {}", identity, e);
            e
        })?;
        info!("Account created for '{}'", identity);
        self.sign_in(identity, secret).await
    }

    /// Clears the session. The in-memory state is cleared even when the
    /// persisted copy cannot be removed; that failure is still returned.
    pub fn sign_out(&self) -> ClientResult<()> {
        let previous = self.current.swap(None);
        if let Some(session) = previous {
            info!("Signed out '{}'", session.identity);
        }
        self.kv
            .apply(&[], &[TOKEN_KEY, USERNAME_KEY])
            .map_err(ClientError::Storage)
    }

    /// Tears the session down after the service rejected the credential.
    pub fn expire(&self) {
        warn!("Session expired, clearing stored credential");
        if let Err(e) = self.sign_out() {
            error!("Failed to remove expired session from storage: {}", e);
        }
    }

    pub fn current_credential(&self) -> Option<String> {
        self.current.load_full().map(|s| s.credential.clone())
    }

    pub fn current_session(&self) -> Option<Session> {
        self.current.load_full().map(|s| (*s).clone())
    }

    pub fn is_signed_in(&self) -> bool {
        self.current.load().is_some()
    }

    fn store(&self, session: Session) -> ClientResult<()> {
        self.kv
            .apply(
                &[
                    (TOKEN_KEY, session.credential.as_str()),
                    (USERNAME_KEY, session.identity.as_str()),
                ],
                &[],
            )
            .map_err(ClientError::Storage)?;
        self.current.store(Some(Arc::new(session)));
        Ok(())
    }
}

pub fn validate_sign_up(
    identity: &str,
    email: &str,
    secret: &str,
    secret_confirmation: &str,
) -> Result<(), ValidationError> {
    if identity.trim().is_empty() {
        return Err(ValidationError::MissingIdentity);
    }
    if email.trim().is_empty() {
        return Err(ValidationError::MissingEmail);
    }
    if secret != secret_confirmation {
        return Err(ValidationError::SecretMismatch);
    }
    if secret.chars().count() < MIN_SECRET_LEN {
        return Err(ValidationError::SecretTooShort);
    }
    Ok(())
}
