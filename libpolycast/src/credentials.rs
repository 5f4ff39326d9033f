//! Credential resolution for channels
//!
//! A channel stores either a literal token or a reference to one:
//!
//! - `env:NAME` reads the environment variable `NAME`
//! - `file:PATH` reads a token file (`~` is expanded)
//! - anything else is used as-is
//!
//! Tokens stay wrapped in [`SecretString`] end to end.

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use thiserror::Error;

use crate::error::PublishError;
use crate::types::Channel;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CredentialError {
    /// The credential is missing or unusable; retrying will not help
    #[error("Invalid credential: {0}")]
    Invalid(String),

    /// The credential store could not be reached right now
    #[error("Credential store unavailable: {0}")]
    Unavailable(String),
}

impl From<CredentialError> for PublishError {
    fn from(err: CredentialError) -> Self {
        match err {
            CredentialError::Invalid(msg) => PublishError::Authentication(msg),
            CredentialError::Unavailable(msg) => PublishError::Network(msg),
        }
    }
}

/// Turns a channel into a usable access token
#[async_trait]
pub trait CredentialResolver: Send + Sync {
    async fn resolve(&self, channel: &Channel) -> Result<SecretString, CredentialError>;
}

/// Resolves the credential stored on the channel row
#[derive(Debug, Clone, Copy, Default)]
pub struct StoredCredentialResolver;

impl StoredCredentialResolver {
    fn non_empty(value: &str, channel: &Channel) -> Result<SecretString, CredentialError> {
        let value = value.trim();
        if value.is_empty() {
            return Err(CredentialError::Invalid(format!(
                "channel {} has an empty credential",
                channel.id
            )));
        }
        Ok(SecretString::from(value.to_string()))
    }
}

#[async_trait]
impl CredentialResolver for StoredCredentialResolver {
    async fn resolve(&self, channel: &Channel) -> Result<SecretString, CredentialError> {
        let stored = channel.credential.expose_secret();

        if let Some(name) = stored.strip_prefix("env:") {
            let value = std::env::var(name).map_err(|_| {
                CredentialError::Invalid(format!(
                    "environment variable {} for channel {} is not set",
                    name, channel.id
                ))
            })?;
            return Self::non_empty(&value, channel);
        }

        if let Some(path) = stored.strip_prefix("file:") {
            let expanded = shellexpand::full(path).map_err(|e| {
                CredentialError::Invalid(format!(
                    "bad token file path for channel {}: {}",
                    channel.id, e
                ))
            })?;
            let value = tokio::fs::read_to_string(expanded.as_ref())
                .await
                .map_err(|e| match e.kind() {
                    std::io::ErrorKind::NotFound | std::io::ErrorKind::PermissionDenied => {
                        CredentialError::Invalid(format!(
                            "token file for channel {} unreadable: {}",
                            channel.id, e
                        ))
                    }
                    _ => CredentialError::Unavailable(format!(
                        "token file for channel {} could not be read: {}",
                        channel.id, e
                    )),
                })?;
            return Self::non_empty(&value, channel);
        }

        Self::non_empty(stored, channel)
    }
}
