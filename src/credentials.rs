//! Repository access tokens.
//!
//! A [`CredentialProvider`] is asked for a token once per sync. The token is
//! moved into [`crate::repo_sync::sync_to_latest`] and dropped when the call
//! returns; nothing else holds on to it.

use async_trait::async_trait;
use std::fmt;

use crate::error::{PipelineError, PipelineResult};
use crate::models::Project;

/// An opaque access token. `Debug` and `Display` never reveal the value.
#[derive(Clone, PartialEq, Eq)]
pub struct AccessToken(String);

impl AccessToken {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// The raw secret. Only [`crate::repo_sync`] should call this.
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("AccessToken([REDACTED])")
    }
}

impl fmt::Display for AccessToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[REDACTED]")
    }
}

#[async_trait]
pub trait CredentialProvider: Send + Sync {
    /// Token for `project`, or `None` for anonymous access.
    ///
    /// Fails with [`PipelineError::NoValidToken`] when a token is required
    /// but absent or expired.
    async fn access_token(&self, project: &Project) -> PipelineResult<Option<AccessToken>>;
}

/// Reads the token from an environment variable at call time, so rotated
/// values are picked up without a restart.
pub struct EnvTokenProvider {
    var: String,
    required: bool,
}

impl EnvTokenProvider {
    pub fn new(var: impl Into<String>, required: bool) -> Self {
        Self {
            var: var.into(),
            required,
        }
    }
}

#[async_trait]
impl CredentialProvider for EnvTokenProvider {
    async fn access_token(&self, project: &Project) -> PipelineResult<Option<AccessToken>> {
        match std::env::var(&self.var) {
            Ok(value) if !value.trim().is_empty() => Ok(Some(AccessToken::new(value.trim()))),
            _ if self.required => Err(PipelineError::NoValidToken(project.id.clone())),
            _ => Ok(None),
        }
    }
}

/// Fixed token, or none. For embedding and tests.
pub struct StaticTokenProvider {
    token: Option<AccessToken>,
}

impl StaticTokenProvider {
    pub fn new(token: Option<AccessToken>) -> Self {
        Self { token }
    }

    pub fn anonymous() -> Self {
        Self { token: None }
    }
}

#[async_trait]
impl CredentialProvider for StaticTokenProvider {
    async fn access_token(&self, _project: &Project) -> PipelineResult<Option<AccessToken>> {
        Ok(self.token.clone())
    }
}
