pub mod models;
pub mod transport;

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use reqwest::Method;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::{
    error::{AuthError, CloudError, TransportError},
    store::{SessionTokens, StateStore},
};

use self::{
    models::{
        CloudOperation, HeaterInfo, LoginRequest, RefreshRequest, StatusSnapshot, TokenResult,
        UserInfo, APP_LANG, APP_NAME, APP_VERSION,
    },
    transport::{HttpRequest, HttpResponse, HttpTransport},
};

/// Operator login for the Thermowatt cloud.
#[derive(Clone)]
pub struct Credentials {
    pub email: String,
    pub password: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("email", &self.email)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Authenticated session against the Thermowatt cloud.
///
/// Tokens live in the shared [`StateStore`] and are persisted after every
/// login or refresh. An expired access token is refreshed at most once per
/// request; concurrent requests hitting 401 share a single refresh. Once a
/// refresh is rejected the session halts and refuses further cloud calls.
#[derive(Clone)]
pub struct ThermowattClient {
    inner: Arc<Inner>,
}

struct Inner {
    transport: Arc<dyn HttpTransport>,
    store: StateStore,
    credentials: Credentials,
    refresh_lock: Mutex<()>,
    halted: AtomicBool,
}

impl ThermowattClient {
    pub fn new(
        transport: Arc<dyn HttpTransport>,
        store: StateStore,
        credentials: Credentials,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                transport,
                store,
                credentials,
                refresh_lock: Mutex::new(()),
                halted: AtomicBool::new(false),
            }),
        }
    }

    /// `true` once an authentication failure has stopped all cloud calls.
    pub fn is_halted(&self) -> bool {
        self.inner.halted.load(Ordering::SeqCst)
    }

    pub async fn has_tokens(&self) -> bool {
        self.inner.store.read(|s| s.tokens.is_some()).await
    }

    /// Identifier sent with every login and refresh.
    pub async fn install_id(&self) -> Uuid {
        self.inner.store.read(|s| s.install_id).await
    }

    /// Full login with the operator credentials. Clears a previous halt.
    pub async fn authenticate(&self) -> Result<SessionTokens, CloudError> {
        let _refresh = self.inner.refresh_lock.lock().await;
        let install_id = self.inner.store.read(|s| s.install_id).await;

        let body = LoginRequest {
            email: &self.inner.credentials.email,
            password: &self.inner.credentials.password,
            app: APP_NAME,
            version: APP_VERSION,
            lang: APP_LANG,
            install_id: install_id.to_string(),
        };
        let request = HttpRequest::new(Method::POST, "/login").json(to_value(&body)?);

        info!(email = %self.inner.credentials.email, "Logging in to Thermowatt cloud");
        let response = self.inner.transport.send(request).await?;
        if response.status == 401 || response.status == 403 {
            return Err(AuthError::LoginRejected.into());
        }
        let tokens: TokenResult = decode(&response)?;

        let tokens = self.store_tokens(tokens).await;
        self.inner.halted.store(false, Ordering::SeqCst);
        info!("Thermowatt login succeeded");
        Ok(tokens)
    }

    /// Perform an authenticated request.
    ///
    /// A 401 triggers exactly one refresh and one retry; a second 401 halts
    /// the session and surfaces [`AuthError::StillUnauthorized`].
    pub async fn execute(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, &str)],
        body: Option<Value>,
    ) -> Result<HttpResponse, CloudError> {
        if self.is_halted() {
            return Err(AuthError::Halted.into());
        }

        let token = self
            .access_token()
            .await
            .ok_or(AuthError::NotAuthenticated)?;

        let response = self
            .send_with(&token, method.clone(), path, query, body.clone())
            .await?;
        if !response.is_unauthorized() {
            return ensure_success(response);
        }

        debug!(path = %path, "Access token rejected; refreshing");
        let fresh = self.refresh_after(&token).await?;

        let response = self.send_with(&fresh, method, path, query, body).await?;
        if response.is_unauthorized() {
            self.halt("request rejected again after token refresh");
            return Err(AuthError::StillUnauthorized.into());
        }
        ensure_success(response)
    }

    /// Heaters registered to the operator account.
    pub async fn user_info(&self) -> Result<Vec<HeaterInfo>, CloudError> {
        let response = self.execute(Method::GET, "/user-info", &[], None).await?;
        let info: UserInfo = decode(&response)?;
        Ok(info.heaters)
    }

    /// Current authoritative status document for one heater.
    pub async fn status(&self, serial: &str) -> Result<StatusSnapshot, CloudError> {
        let response = self
            .execute(Method::GET, "/status", &[("serial", serial)], None)
            .await?;
        let snapshot: StatusSnapshot = decode(&response)?;
        Ok(snapshot)
    }

    pub async fn send_operation(
        &self,
        serial: &str,
        operation: &CloudOperation,
    ) -> Result<(), CloudError> {
        debug!(serial = %serial, path = operation.path(), "Sending control operation");
        self.execute(Method::POST, operation.path(), &[], Some(operation.body(serial)))
            .await?;
        Ok(())
    }

    async fn access_token(&self) -> Option<String> {
        self.inner
            .store
            .read(|s| s.tokens.as_ref().map(|t| t.access_token.clone()))
            .await
    }

    async fn send_with(
        &self,
        token: &str,
        method: Method,
        path: &str,
        query: &[(&str, &str)],
        body: Option<Value>,
    ) -> Result<HttpResponse, TransportError> {
        let mut request = HttpRequest::new(method, path).bearer(token);
        for (k, v) in query {
            request = request.query(k, v);
        }
        if let Some(body) = body {
            request = request.json(body);
        }
        self.inner.transport.send(request).await
    }

    /// Single-flight refresh. `stale` is the token that was just rejected: if
    /// another task already replaced it, its result is reused.
    async fn refresh_after(&self, stale: &str) -> Result<String, CloudError> {
        let _refresh = self.inner.refresh_lock.lock().await;

        if self.is_halted() {
            return Err(AuthError::Halted.into());
        }

        let (current, install_id) = self
            .inner
            .store
            .read(|s| (s.tokens.clone(), s.install_id))
            .await;
        let current = current.ok_or(AuthError::NotAuthenticated)?;
        if current.access_token != stale {
            debug!("Token already refreshed by a concurrent request");
            return Ok(current.access_token);
        }

        let body = RefreshRequest {
            refresh_token: &current.refresh_token,
            install_id: install_id.to_string(),
        };
        let request = HttpRequest::new(Method::POST, "/refresh").json(to_value(&body)?);
        let response = self.inner.transport.send(request).await?;

        if response.is_unauthorized() || response.status == 403 {
            self.halt("refresh token rejected");
            return Err(AuthError::RefreshRejected.into());
        }
        let tokens: TokenResult = decode(&response)?;
        let tokens = self.store_tokens(tokens).await;
        info!("Thermowatt access token refreshed");
        Ok(tokens.access_token)
    }

    async fn store_tokens(&self, tokens: TokenResult) -> SessionTokens {
        let tokens = SessionTokens {
            access_token: tokens.access_token,
            refresh_token: tokens.refresh_token,
        };
        let stored = tokens.clone();
        self.inner.store.update(|s| s.tokens = Some(stored)).await;
        if let Err(e) = self.inner.store.persist().await {
            warn!(error = %e, "Failed to persist refreshed tokens");
        }
        tokens
    }

    fn halt(&self, reason: &str) {
        if !self.inner.halted.swap(true, Ordering::SeqCst) {
            error!(
                reason = %reason,
                "Thermowatt authentication failed; cloud calls halted until restart"
            );
        }
    }
}

fn ensure_success(response: HttpResponse) -> Result<HttpResponse, CloudError> {
    if response.is_success() {
        Ok(response)
    } else {
        Err(TransportError::Status { status: response.status }.into())
    }
}

fn decode<T: DeserializeOwned>(response: &HttpResponse) -> Result<T, CloudError> {
    if !response.is_success() {
        return Err(TransportError::Status { status: response.status }.into());
    }
    serde_json::from_slice(&response.body).map_err(|e| TransportError::Decode(e).into())
}

fn to_value<T: serde::Serialize>(body: &T) -> Result<Value, CloudError> {
    serde_json::to_value(body).map_err(|e| TransportError::Decode(e).into())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
