//! Authentication collaborators (§6 `AuthProvider`/`Authenticator`) and
//! the SASL/plain exchange the connection drives during `open()` (§4.5
//! step 4). Grounded on the teacher's handshake module in spirit — a
//! server-driven challenge/response loop — adapted from MySQL's
//! auth-plugin-switch exchange to CQL's `AUTHENTICATE`/`AUTH_CHALLENGE`/
//! `AUTH_SUCCESS` opcodes.

use async_trait::async_trait;

use crate::endpoint::Endpoint;
use crate::error::{Error, Result};

#[async_trait]
pub trait Authenticator: Send + Sync {
    /// The first token sent in `AUTH_RESPONSE` (§4.5 step 4).
    async fn initial_response(&mut self) -> Result<Vec<u8>>;

    /// Evaluate an `AUTH_CHALLENGE` token and produce the next response.
    async fn evaluate_challenge(&mut self, token: Vec<u8>) -> Result<Vec<u8>>;

    /// Called once the server sends `AUTH_SUCCESS`.
    async fn on_authentication_success(&mut self, _token: Option<Vec<u8>>) -> Result<()> {
        Ok(())
    }

    /// Only used by the protocol-v1 `CREDENTIALS` path (§4.5 step 4),
    /// which predates SASL entirely.
    fn username(&self) -> Option<&str> {
        None
    }

    fn password(&self) -> Option<&str> {
        None
    }
}

#[async_trait]
pub trait AuthProvider: Send + Sync {
    async fn new_authenticator(
        &self,
        endpoint: &Endpoint,
        authenticator_name: &str,
    ) -> Result<Box<dyn Authenticator>>;
}

/// SASL PLAIN (`org.apache.cassandra.auth.PasswordAuthenticator` and
/// DSE's equivalent): a single round, token is `\0username\0password`.
pub struct PlainTextAuthenticator {
    username: String,
    password: String,
    sent_initial: bool,
}

impl PlainTextAuthenticator {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
            sent_initial: false,
        }
    }

    fn token(&self) -> Vec<u8> {
        let mut token = Vec::with_capacity(self.username.len() + self.password.len() + 2);
        token.push(0);
        token.extend_from_slice(self.username.as_bytes());
        token.push(0);
        token.extend_from_slice(self.password.as_bytes());
        token
    }
}

#[async_trait]
impl Authenticator for PlainTextAuthenticator {
    async fn initial_response(&mut self) -> Result<Vec<u8>> {
        self.sent_initial = true;
        Ok(self.token())
    }

    async fn evaluate_challenge(&mut self, _token: Vec<u8>) -> Result<Vec<u8>> {
        // SASL PLAIN is single-round; a server that challenges again after
        // the initial response is violating the mechanism it advertised.
        Err(Error::AuthenticationError {
            inner: Box::new(Error::ProtocolError(
                "PLAIN authenticator received an unexpected AUTH_CHALLENGE".to_string(),
            )),
        })
    }

    fn username(&self) -> Option<&str> {
        Some(&self.username)
    }

    fn password(&self) -> Option<&str> {
        Some(&self.password)
    }
}

pub struct PlainTextAuthProvider {
    pub username: String,
    pub password: String,
}

#[async_trait]
impl AuthProvider for PlainTextAuthProvider {
    async fn new_authenticator(
        &self,
        _endpoint: &Endpoint,
        _authenticator_name: &str,
    ) -> Result<Box<dyn Authenticator>> {
        Ok(Box::new(PlainTextAuthenticator::new(
            self.username.clone(),
            self.password.clone(),
        )))
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[tokio::test]
    async fn plain_token_is_null_separated() {
        let mut auth = PlainTextAuthenticator::new("alice", "secret");
        let token = auth.initial_response().await.unwrap();
        assert_eq!(token, b"\0alice\0secret");
    }

    #[tokio::test]
    async fn plain_rejects_a_second_challenge() {
        let mut auth = PlainTextAuthenticator::new("alice", "secret");
        auth.initial_response().await.unwrap();
        assert!(auth.evaluate_challenge(vec![]).await.is_err());
    }
}
