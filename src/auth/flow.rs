//! OAuth2 flows: silent refresh and the interactive PKCE browser flow.
//!
//! The engine's batch path is strictly non-interactive: [`Authenticator::ensure_token`]
//! either returns a valid token (refreshing when near expiry) or fails fast
//! with [`AuthError::Required`]. The browser step lives only behind
//! [`Authenticator::authorize`], which the operator invokes explicitly.

use oauth2::basic::BasicClient;
use oauth2::reqwest::async_http_client;
use oauth2::{
    AuthUrl, AuthorizationCode, ClientId, ClientSecret, CsrfToken, PkceCodeChallenge,
    RedirectUrl, RefreshToken, Scope, TokenResponse, TokenUrl,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

use super::token::{refresh_margin, OAuth2Token, TokenCache};

/// How long the loopback listener waits for the browser redirect.
const CALLBACK_TIMEOUT_SECS: u64 = 300;

/// Errors from credential acquisition and refresh.
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    /// An interactive browser step is needed; the caller is non-interactive.
    #[error("interactive authentication required: {0}")]
    Required(String),

    /// Network failure talking to the token endpoint.
    #[error("token endpoint unreachable: {0}")]
    Network(String),

    /// The authorization server rejected the request.
    #[error("authorization server error: {0}")]
    Endpoint(String),

    /// The loopback redirect did not produce a usable code.
    #[error("authorization callback failed: {0}")]
    Callback(String),

    /// Flow configuration problem (bad URLs etc).
    #[error("invalid OAuth configuration: {0}")]
    Config(String),

    /// Token cache I/O failure.
    #[error("token cache error: {0}")]
    Io(#[from] std::io::Error),
}

/// Endpoint and client configuration for one OAuth2 provider.
#[derive(Debug, Clone)]
pub struct OAuthConfig {
    /// Authorization endpoint.
    pub auth_url: String,
    /// Token endpoint.
    pub token_url: String,
    /// OAuth client id.
    pub client_id: String,
    /// Client secret, absent for public PKCE clients.
    pub client_secret: Option<String>,
    /// Requested scopes.
    pub scopes: Vec<String>,
    /// Account hint pre-filled on the provider's login page.
    pub login_hint: Option<String>,
}

/// Per-credential authenticator: refreshes silently, authorizes on demand.
#[derive(Debug)]
pub struct Authenticator {
    config: OAuthConfig,
    cache: TokenCache,
}

impl Authenticator {
    /// Creates an authenticator over the given token cache.
    pub fn new(config: OAuthConfig, cache: TokenCache) -> Self {
        Self { config, cache }
    }

    /// The underlying token cache.
    pub fn cache(&self) -> &TokenCache {
        &self.cache
    }

    fn client(&self) -> Result<BasicClient, AuthError> {
        let auth_url = AuthUrl::new(self.config.auth_url.clone())
            .map_err(|e| AuthError::Config(format!("auth url: {}", e)))?;
        let token_url = TokenUrl::new(self.config.token_url.clone())
            .map_err(|e| AuthError::Config(format!("token url: {}", e)))?;
        Ok(BasicClient::new(
            ClientId::new(self.config.client_id.clone()),
            self.config.client_secret.clone().map(ClientSecret::new),
            auth_url,
            Some(token_url),
        ))
    }

    /// Returns a valid access token without any interactive step.
    ///
    /// Refreshes the cached token when it is within the expiry margin. Fails
    /// fast with [`AuthError::Required`] when no cached token exists or the
    /// refresh token has been revoked, so headless runs surface the
    /// condition instead of hanging.
    pub async fn ensure_token(&self) -> Result<OAuth2Token, AuthError> {
        let Some(token) = self.cache.load() else {
            return Err(AuthError::Required(format!(
                "no cached token at {}",
                self.cache.path().display()
            )));
        };

        if !token.is_expired(refresh_margin()) {
            return Ok(token);
        }

        debug!(path = %self.cache.path().display(), "access token near expiry, refreshing");
        let refreshed = self.refresh(&token).await?;
        self.cache.save(&refreshed)?;
        Ok(refreshed)
    }

    /// Exchanges the refresh token for a new access token.
    async fn refresh(&self, token: &OAuth2Token) -> Result<OAuth2Token, AuthError> {
        if token.refresh_token.is_empty() {
            self.cache.invalidate();
            return Err(AuthError::Required(
                "cached token has no refresh token".to_string(),
            ));
        }

        let client = self.client()?;
        let refresh_token = RefreshToken::new(token.refresh_token.clone());
        let mut request = client.exchange_refresh_token(&refresh_token);
        for scope in &self.config.scopes {
            request = request.add_scope(Scope::new(scope.clone()));
        }

        match request.request_async(async_http_client).await {
            Ok(response) => Ok(self.to_token(&response, Some(&token.refresh_token))),
            Err(oauth2::RequestTokenError::ServerResponse(e)) => {
                // The grant itself was rejected: the refresh token is dead.
                warn!(error = %e, "refresh token rejected, invalidating cache");
                self.cache.invalidate();
                Err(AuthError::Required(format!(
                    "refresh token rejected: {}",
                    e
                )))
            }
            Err(oauth2::RequestTokenError::Request(e)) => Err(AuthError::Network(e.to_string())),
            Err(e) => Err(AuthError::Endpoint(e.to_string())),
        }
    }

    /// Runs the interactive authorization-code + PKCE flow.
    ///
    /// Binds a loopback listener on an ephemeral port, opens the provider's
    /// authorization page in a browser, waits for the redirect, validates
    /// the CSRF state and exchanges the code. The resulting token is cached.
    pub async fn authorize(&self) -> Result<OAuth2Token, AuthError> {
        let listener = TcpListener::bind(("127.0.0.1", 0)).await?;
        let port = listener
            .local_addr()
            .map_err(AuthError::Io)?
            .port();
        let redirect = format!("http://localhost:{}/", port);

        let client = self.client()?.set_redirect_uri(
            RedirectUrl::new(redirect).map_err(|e| AuthError::Config(e.to_string()))?,
        );

        let (pkce_challenge, pkce_verifier) = PkceCodeChallenge::new_random_sha256();
        let mut request = client
            .authorize_url(CsrfToken::new_random)
            .set_pkce_challenge(pkce_challenge);
        for scope in &self.config.scopes {
            request = request.add_scope(Scope::new(scope.clone()));
        }
        if let Some(hint) = &self.config.login_hint {
            request = request.add_extra_param("login_hint", hint.clone());
        }
        let (auth_url, csrf_state) = request.url();

        info!("opening browser for authorization");
        info!("if the browser does not open, visit: {}", auth_url);
        open_browser(auth_url.as_str());

        let (code, returned_state) = tokio::time::timeout(
            std::time::Duration::from_secs(CALLBACK_TIMEOUT_SECS),
            wait_for_callback(&listener),
        )
        .await
        .map_err(|_| AuthError::Callback("timed out waiting for the browser redirect".to_string()))??;

        if returned_state.as_deref() != Some(csrf_state.secret().as_str()) {
            return Err(AuthError::Callback(
                "state mismatch in authorization response".to_string(),
            ));
        }

        let response = client
            .exchange_code(AuthorizationCode::new(code))
            .set_pkce_verifier(pkce_verifier)
            .request_async(async_http_client)
            .await
            .map_err(|e| match e {
                oauth2::RequestTokenError::Request(e) => AuthError::Network(e.to_string()),
                other => AuthError::Endpoint(other.to_string()),
            })?;

        let token = self.to_token(&response, None);
        self.cache.save(&token)?;
        info!("authorization successful");
        Ok(token)
    }

    /// Builds our token value from a token-endpoint response. When the
    /// provider omits a refresh token on refresh, the previous one is kept.
    fn to_token(
        &self,
        response: &oauth2::basic::BasicTokenResponse,
        previous_refresh: Option<&str>,
    ) -> OAuth2Token {
        let expires_in = response
            .expires_in()
            .unwrap_or(std::time::Duration::from_secs(3600));
        let refresh_token = response
            .refresh_token()
            .map(|t| t.secret().clone())
            .or_else(|| previous_refresh.map(str::to_string))
            .unwrap_or_default();

        OAuth2Token {
            access_token: response.access_token().secret().clone(),
            refresh_token,
            expires_at: chrono::Utc::now()
                + chrono::Duration::seconds(expires_in.as_secs() as i64),
            token_type: "Bearer".to_string(),
            scope: self.config.scopes.join(" "),
        }
    }
}

/// Accepts one loopback connection and parses the redirect query.
///
/// Returns the authorization code and the returned state parameter.
async fn wait_for_callback(
    listener: &TcpListener,
) -> Result<(String, Option<String>), AuthError> {
    let (mut stream, _) = listener.accept().await?;

    let mut buf = vec![0u8; 8192];
    let n = stream.read(&mut buf).await?;
    let request = String::from_utf8_lossy(&buf[..n]);

    let path = request
        .lines()
        .next()
        .and_then(|line| line.split_whitespace().nth(1))
        .ok_or_else(|| AuthError::Callback("malformed redirect request".to_string()))?;

    let url = url::Url::parse(&format!("http://localhost{}", path))
        .map_err(|e| AuthError::Callback(format!("unparseable redirect: {}", e)))?;

    let mut code = None;
    let mut state = None;
    let mut error = None;
    for (key, value) in url.query_pairs() {
        match key.as_ref() {
            "code" => code = Some(value.into_owned()),
            "state" => state = Some(value.into_owned()),
            "error_description" | "error" if error.is_none() => {
                error = Some(value.into_owned())
            }
            _ => {}
        }
    }

    let body = if code.is_some() {
        "<html><body><h1>Authentication successful</h1>\
         <p>You can close this window and return to loreferry.</p></body></html>"
    } else {
        "<html><body><h1>Authentication failed</h1>\
         <p>Please close this window and try again.</p></body></html>"
    };
    let response = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: text/html\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        body.len(),
        body
    );
    let _ = stream.write_all(response.as_bytes()).await;
    let _ = stream.shutdown().await;

    match code {
        Some(code) => Ok((code, state)),
        None => Err(AuthError::Callback(
            error.unwrap_or_else(|| "authorization denied".to_string()),
        )),
    }
}

/// Best-effort browser launch; the URL is always logged as a fallback.
fn open_browser(url: &str) {
    let opener = if cfg!(target_os = "macos") {
        "open"
    } else {
        "xdg-open"
    };
    let _ = std::process::Command::new(opener)
        .arg(url)
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .spawn();
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn config() -> OAuthConfig {
        OAuthConfig {
            auth_url: "https://login.example.com/authorize".to_string(),
            token_url: "https://login.example.com/token".to_string(),
            client_id: "client".to_string(),
            client_secret: None,
            scopes: vec!["mail.write".to_string()],
            login_hint: None,
        }
    }

    #[tokio::test]
    async fn ensure_token_requires_auth_without_cache() {
        let dir = tempfile::tempdir().unwrap();
        let auth = Authenticator::new(config(), TokenCache::new(dir.path().join("t.json")));

        let err = auth.ensure_token().await.unwrap_err();
        assert!(matches!(err, AuthError::Required(_)));
    }

    #[tokio::test]
    async fn ensure_token_returns_fresh_cached_token() {
        let dir = tempfile::tempdir().unwrap();
        let cache = TokenCache::new(dir.path().join("t.json"));
        let token = OAuth2Token {
            access_token: "at".to_string(),
            refresh_token: "rt".to_string(),
            expires_at: Utc::now() + chrono::Duration::hours(1),
            token_type: "Bearer".to_string(),
            scope: String::new(),
        };
        cache.save(&token).unwrap();

        let auth = Authenticator::new(config(), cache);
        assert_eq!(auth.ensure_token().await.unwrap().access_token, "at");
    }

    #[tokio::test]
    async fn expired_token_without_refresh_token_requires_auth() {
        let dir = tempfile::tempdir().unwrap();
        let cache = TokenCache::new(dir.path().join("t.json"));
        let token = OAuth2Token {
            access_token: "at".to_string(),
            refresh_token: String::new(),
            expires_at: Utc::now() - chrono::Duration::hours(1),
            token_type: "Bearer".to_string(),
            scope: String::new(),
        };
        cache.save(&token).unwrap();

        let auth = Authenticator::new(config(), cache);
        let err = auth.ensure_token().await.unwrap_err();
        assert!(matches!(err, AuthError::Required(_)));
        // The dead token must have been set aside.
        assert!(auth.cache().load().is_none());
    }

    #[tokio::test]
    async fn callback_parses_code_and_state() {
        let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let addr = listener.local_addr().unwrap();

        let client = tokio::spawn(async move {
            let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
            stream
                .write_all(b"GET /?code=abc123&state=xyz HTTP/1.1\r\nHost: localhost\r\n\r\n")
                .await
                .unwrap();
            let mut response = String::new();
            stream.read_to_string(&mut response).await.unwrap();
            response
        });

        let (code, state) = wait_for_callback(&listener).await.unwrap();
        assert_eq!(code, "abc123");
        assert_eq!(state.as_deref(), Some("xyz"));

        let response = client.await.unwrap();
        assert!(response.contains("Authentication successful"));
    }

    #[tokio::test]
    async fn callback_reports_provider_errors() {
        let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
            stream
                .write_all(
                    b"GET /?error=access_denied&error_description=user%20declined HTTP/1.1\r\n\r\n",
                )
                .await
                .unwrap();
            let mut response = String::new();
            let _ = stream.read_to_string(&mut response).await;
        });

        let err = wait_for_callback(&listener).await.unwrap_err();
        match err {
            AuthError::Callback(msg) => assert!(msg.contains("declined") || msg.contains("denied")),
            other => panic!("unexpected error: {:?}", other),
        }
    }
}
