use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use base64::{
    Engine,
    engine::general_purpose::{URL_SAFE, URL_SAFE_NO_PAD},
};
use chat_core::{ChatError, ChatErrorCode};
use tracing::debug;

/// Supplies auth tokens to the socket controller.
#[async_trait]
pub trait TokenProvider: Send + Sync {
    /// Return a usable token, loading one if nothing is cached.
    async fn ensure_token_loaded(&self) -> Result<String, ChatError>;

    /// Drop the cached token so the next call loads a fresh one.
    fn expire_token(&self);
}

/// Source of fresh tokens, for example an HTTP call to the app backend.
#[async_trait]
pub trait TokenLoader: Send + Sync {
    async fn load_token(&self) -> Result<String, ChatError>;
}

/// Loader that always returns the same token.
#[derive(Debug, Clone)]
pub struct StaticTokenLoader {
    token: String,
}

impl StaticTokenLoader {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }
}

#[async_trait]
impl TokenLoader for StaticTokenLoader {
    async fn load_token(&self) -> Result<String, ChatError> {
        Ok(self.token.clone())
    }
}

/// Token provider that caches the loader's result until expired.
pub struct CachedTokenProvider<L> {
    loader: L,
    cached: Mutex<Option<String>>,
    load_lock: tokio::sync::Mutex<()>,
}

impl<L: TokenLoader> CachedTokenProvider<L> {
    pub fn new(loader: L) -> Self {
        Self {
            loader,
            cached: Mutex::new(None),
            load_lock: tokio::sync::Mutex::new(()),
        }
    }

    fn cached(&self) -> Option<String> {
        self.cached
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl<L: TokenLoader> TokenProvider for CachedTokenProvider<L> {
    async fn ensure_token_loaded(&self) -> Result<String, ChatError> {
        if let Some(token) = self.cached() {
            return Ok(token);
        }

        let _guard = self.load_lock.lock().await;
        if let Some(token) = self.cached() {
            return Ok(token);
        }

        let token = self.loader.load_token().await?;
        if token.is_empty() {
            return Err(ChatError::network(
                ChatErrorCode::UndefinedToken,
                "token loader returned an empty token",
            ));
        }
        debug!("loaded a fresh auth token");
        *self.cached.lock().unwrap_or_else(PoisonError::into_inner) = Some(token.clone());
        Ok(token)
    }

    fn expire_token(&self) {
        debug!("expiring cached auth token");
        self.cached
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }
}

/// Read the `user_id` claim from a JWT without verifying its signature.
pub fn user_id_from_token(token: &str) -> Result<String, ChatError> {
    let invalid = |message: &str| ChatError::network(ChatErrorCode::InvalidToken, message);

    let payload = token
        .split('.')
        .nth(1)
        .filter(|part| !part.is_empty())
        .ok_or_else(|| invalid("token is not a JWT"))?;
    let bytes = URL_SAFE_NO_PAD
        .decode(payload.trim_end_matches('='))
        .or_else(|_| URL_SAFE.decode(payload))
        .map_err(|_| invalid("token payload is not base64"))?;
    let claims: serde_json::Value =
        serde_json::from_slice(&bytes).map_err(|_| invalid("token payload is not JSON"))?;
    claims
        .get("user_id")
        .and_then(serde_json::Value::as_str)
        .map(str::to_owned)
        .ok_or_else(|| invalid("token has no user_id claim"))
}

/// Unsigned development token for `user_id`; only accepted by servers with auth checks disabled.
pub fn dev_token(user_id: &str) -> String {
    let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"HS256","typ":"JWT"}"#);
    let payload = URL_SAFE_NO_PAD.encode(serde_json::json!({ "user_id": user_id }).to_string());
    format!("{header}.{payload}.devtoken")
}
