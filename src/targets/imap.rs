//! IMAP delivery target.
//!
//! Appends messages to a fixed folder over an SSL connection. Two
//! authentication modes: LOGIN with a password (inline or from a file), or
//! OAuth2 against a directory service using the XOAUTH2 SASL mechanism with
//! an authorization-code + PKCE grant. A built-in public client id is used
//! unless the account's tenant requires a custom app registration.
//!
//! Labels are ignored: IMAP delivery is single-folder.

use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::ClientConfig;
use tokio_rustls::TlsConnector;
use tokio_util::compat::{Compat, TokioAsyncReadCompatExt};
use tracing::{debug, info};

use crate::auth::{Authenticator, OAuthConfig, TokenCache};
use crate::domain::{DeliveryTrace, Message, TargetId};

use super::{Label, Result, Target, TargetError, TargetKind};

/// Built-in application (client) id for the OAuth2 directory service.
/// Tenants that block third-party applications can override it with their
/// own registration.
pub const DEFAULT_CLIENT_ID: &str = "96202974-99c3-4d7d-b2a5-1f57fe7f114c";

const MS_AUTH_URL: &str = "https://login.microsoftonline.com/{tenant}/oauth2/v2.0/authorize";
const MS_TOKEN_URL: &str = "https://login.microsoftonline.com/{tenant}/oauth2/v2.0/token";

/// Scopes needed for IMAP access plus refresh tokens.
const IMAP_SCOPES: &[&str] = &[
    "https://outlook.office.com/IMAP.AccessAsUser.All",
    "offline_access",
];

/// Type alias for the IMAP session with TLS (using tokio-util compat layer).
type ImapSession = async_imap::Session<Compat<TlsStream<TcpStream>>>;

/// Authentication configuration for an IMAP target.
#[derive(Debug, Clone)]
pub enum ImapAuthConfig {
    /// LOGIN with a password, inline or read from a file.
    Password {
        password: Option<String>,
        password_file: Option<PathBuf>,
    },
    /// XOAUTH2 with an authorization-code + PKCE grant.
    OAuth2 {
        /// Application client id; `None` uses [`DEFAULT_CLIENT_ID`].
        client_id: Option<String>,
        /// Directory tenant, or `common`.
        tenant: String,
        /// Token cache location.
        token_file: PathBuf,
    },
}

/// Connection configuration for an IMAP target.
#[derive(Debug, Clone)]
pub struct ImapTargetConfig {
    /// Server hostname.
    pub server: String,
    /// Server port (993 for SSL).
    pub port: u16,
    /// Account username.
    pub username: String,
    /// Destination folder; must already exist on the server.
    pub folder: String,
    /// Authentication mode.
    pub auth: ImapAuthConfig,
}

enum AuthState {
    Password { password: String },
    OAuth2 { authenticator: Authenticator },
}

/// XOAUTH2 SASL responder.
struct XOAuth2 {
    user: String,
    access_token: String,
}

impl async_imap::Authenticator for XOAuth2 {
    type Response = String;

    fn process(&mut self, _challenge: &[u8]) -> Self::Response {
        format!(
            "user={}\x01auth=Bearer {}\x01\x01",
            self.user, self.access_token
        )
    }
}

/// IMAP target.
pub struct ImapTarget {
    id: TargetId,
    server: String,
    port: u16,
    username: String,
    folder: String,
    auth: AuthState,
    session: Option<ImapSession>,
}

impl std::fmt::Debug for ImapTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImapTarget")
            .field("id", &self.id)
            .field("server", &self.server)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("folder", &self.folder)
            .field("connected", &self.session.is_some())
            .finish()
    }
}

impl ImapTarget {
    /// Creates an IMAP target from its configuration.
    ///
    /// Password files are read eagerly so misconfiguration surfaces at
    /// construction, not mid-run.
    pub fn new(id: TargetId, config: ImapTargetConfig) -> Result<Self> {
        if config.server.is_empty() {
            return Err(TargetError::Permanent(format!(
                "no server specified for IMAP target '{}'",
                id
            )));
        }
        if config.username.is_empty() {
            return Err(TargetError::Permanent(format!(
                "no username specified for IMAP target '{}'",
                id
            )));
        }

        let auth = match config.auth {
            ImapAuthConfig::Password {
                password,
                password_file,
            } => {
                let password = match (password, password_file) {
                    (Some(p), _) => p,
                    (None, Some(path)) => std::fs::read_to_string(&path)
                        .map_err(|e| {
                            TargetError::Permanent(format!(
                                "password file {} unreadable: {}",
                                path.display(),
                                e
                            ))
                        })?
                        .trim()
                        .to_string(),
                    (None, None) => {
                        return Err(TargetError::Permanent(format!(
                            "no password or password_file for IMAP target '{}'",
                            id
                        )))
                    }
                };
                AuthState::Password { password }
            }
            ImapAuthConfig::OAuth2 {
                client_id,
                tenant,
                token_file,
            } => {
                let client_id = client_id.unwrap_or_else(|| DEFAULT_CLIENT_ID.to_string());
                let authenticator = Authenticator::new(
                    OAuthConfig {
                        auth_url: MS_AUTH_URL.replace("{tenant}", &tenant),
                        token_url: MS_TOKEN_URL.replace("{tenant}", &tenant),
                        client_id,
                        client_secret: None,
                        scopes: IMAP_SCOPES.iter().map(|s| s.to_string()).collect(),
                        login_hint: Some(config.username.clone()),
                    },
                    TokenCache::new(token_file),
                );
                AuthState::OAuth2 { authenticator }
            }
        };

        Ok(Self {
            id,
            server: config.server,
            port: config.port,
            username: config.username,
            folder: config.folder,
            auth,
            session: None,
        })
    }

    /// Establishes the TLS connection with the futures compat wrapper.
    async fn connect_tls(&self) -> Result<Compat<TlsStream<TcpStream>>> {
        let tcp_stream = TcpStream::connect((self.server.as_str(), self.port))
            .await
            .map_err(|e| TargetError::Transient(format!("TCP connect failed: {}", e)))?;

        let config = ClientConfig::builder()
            .with_root_certificates(tokio_rustls::rustls::RootCertStore::from_iter(
                webpki_roots::TLS_SERVER_ROOTS.iter().cloned(),
            ))
            .with_no_client_auth();

        let connector = TlsConnector::from(Arc::new(config));
        let server_name = ServerName::try_from(self.server.clone())
            .map_err(|e| TargetError::Permanent(format!("invalid server name: {}", e)))?;

        let tls_stream = connector
            .connect(server_name, tcp_stream)
            .await
            .map_err(|e| TargetError::Transient(format!("TLS handshake failed: {}", e)))?;

        Ok(tls_stream.compat())
    }

    /// Connects and authenticates, verifying the destination folder exists.
    async fn connect(&mut self) -> Result<()> {
        if self.session.is_some() {
            return Ok(());
        }

        let tls_stream = self.connect_tls().await?;
        let client = async_imap::Client::new(tls_stream);

        let mut session = match &self.auth {
            AuthState::Password { password } => client
                .login(&self.username, password)
                .await
                .map_err(|(e, _)| {
                    TargetError::Permanent(format!("IMAP login failed: {:?}", e))
                })?,
            AuthState::OAuth2 { authenticator } => {
                let token = authenticator.ensure_token().await?;
                let sasl = XOAuth2 {
                    user: self.username.clone(),
                    access_token: token.access_token,
                };
                client.authenticate("XOAUTH2", sasl).await.map_err(|(e, _)| {
                    TargetError::Permanent(format!("IMAP XOAUTH2 failed: {:?}", e))
                })?
            }
        };

        // Verify the folder exists; it is never auto-created.
        session.examine(&self.folder).await.map_err(|e| {
            TargetError::Permanent(format!(
                "folder '{}' does not exist on {}: {}",
                self.folder, self.server, e
            ))
        })?;

        debug!(
            target = %self.id,
            server = %self.server,
            folder = %self.folder,
            "IMAP session established"
        );
        self.session = Some(session);
        Ok(())
    }

    /// Checks whether a message with this Message-ID already exists in the
    /// destination folder. Fails open: any search problem means "unknown",
    /// and the append proceeds.
    async fn message_exists(&mut self, msgid: &str) -> bool {
        let Some(session) = self.session.as_mut() else {
            return false;
        };
        if session.examine(&self.folder).await.is_err() {
            return false;
        }
        let query = format!("HEADER Message-ID {}", msgid);
        match session.search(&query).await {
            Ok(hits) => !hits.is_empty(),
            Err(e) => {
                debug!(target = %self.id, error = %e, "Message-ID search failed, proceeding");
                false
            }
        }
    }

    /// Runs the interactive OAuth2 authorization for this target.
    ///
    /// Only valid for OAuth2-configured targets.
    async fn run_authorization(&mut self) -> Result<()> {
        match &self.auth {
            AuthState::OAuth2 { authenticator } => {
                authenticator.authorize().await?;
                // Force a reconnect with the fresh credential.
                self.session = None;
                info!(target = %self.id, "IMAP OAuth2 authorization complete");
                Ok(())
            }
            AuthState::Password { .. } => Err(TargetError::CapabilityUnsupported(
                "authorize (password-authenticated IMAP target)",
            )),
        }
    }
}

#[async_trait]
impl Target for ImapTarget {
    fn id(&self) -> &TargetId {
        &self.id
    }

    fn kind(&self) -> TargetKind {
        TargetKind::Imap
    }

    async fn authenticate(&mut self) -> Result<()> {
        self.connect().await
    }

    async fn deliver(
        &mut self,
        message: &Message,
        _labels: &[String],
        trace: &DeliveryTrace,
    ) -> Result<()> {
        self.connect().await?;

        // Skip if the folder already holds this Message-ID; some servers
        // keep mail the user filed there manually.
        if self.message_exists(&message.message_id().0).await {
            debug!(
                target = %self.id,
                msgid = %message.message_id(),
                "message already present in folder, skipping append"
            );
            return Ok(());
        }

        let wire = message.for_delivery(Some(trace));
        let result = {
            let session = self.session.as_mut().ok_or_else(|| {
                TargetError::Transient("IMAP session lost before append".to_string())
            })?;
            session.append(&self.folder, None, None, &wire).await
        };

        if let Err(e) = result {
            // Drop the session so the next attempt reconnects cleanly.
            self.session = None;
            return Err(TargetError::Transient(format!(
                "APPEND to '{}' failed: {}",
                self.folder, e
            )));
        }

        debug!(target = %self.id, msgid = %message.message_id(), "appended message");
        Ok(())
    }

    async fn list_labels(&mut self) -> Result<Vec<Label>> {
        Err(TargetError::CapabilityUnsupported("list_labels"))
    }

    async fn authorize(&mut self) -> Result<()> {
        self.run_authorization().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn password_config(password: Option<&str>, file: Option<PathBuf>) -> ImapTargetConfig {
        ImapTargetConfig {
            server: "imap.example.com".to_string(),
            port: 993,
            username: "user@example.com".to_string(),
            folder: "INBOX".to_string(),
            auth: ImapAuthConfig::Password {
                password: password.map(str::to_string),
                password_file: file,
            },
        }
    }

    #[test]
    fn inline_password_accepted() {
        let target = ImapTarget::new(TargetId::from("work"), password_config(Some("s3cret"), None));
        assert!(target.is_ok());
    }

    #[test]
    fn password_file_is_read_and_trimmed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("password");
        std::fs::write(&path, "  s3cret\n\n").unwrap();

        let target =
            ImapTarget::new(TargetId::from("work"), password_config(None, Some(path))).unwrap();
        match &target.auth {
            AuthState::Password { password } => assert_eq!(password, "s3cret"),
            _ => panic!("expected password auth"),
        }
    }

    #[test]
    fn missing_password_is_rejected() {
        let err = ImapTarget::new(TargetId::from("work"), password_config(None, None)).unwrap_err();
        assert!(matches!(err, TargetError::Permanent(_)));
    }

    #[test]
    fn missing_server_is_rejected() {
        let mut config = password_config(Some("p"), None);
        config.server = String::new();
        let err = ImapTarget::new(TargetId::from("work"), config).unwrap_err();
        assert!(matches!(err, TargetError::Permanent(_)));
    }

    #[test]
    fn oauth2_defaults_to_builtin_client_id() {
        let dir = tempfile::tempdir().unwrap();
        let config = ImapTargetConfig {
            server: "outlook.office365.com".to_string(),
            port: 993,
            username: "user@example.com".to_string(),
            folder: "INBOX".to_string(),
            auth: ImapAuthConfig::OAuth2 {
                client_id: None,
                tenant: "common".to_string(),
                token_file: dir.path().join("token.json"),
            },
        };
        let target = ImapTarget::new(TargetId::from("o365"), config).unwrap();
        assert!(matches!(&target.auth, AuthState::OAuth2 { .. }));
    }

    #[test]
    fn xoauth2_string_format() {
        let mut sasl = XOAuth2 {
            user: "user@example.com".to_string(),
            access_token: "tok".to_string(),
        };
        let response = async_imap::Authenticator::process(&mut sasl, b"");
        assert_eq!(response, "user=user@example.com\x01auth=Bearer tok\x01\x01");
    }

    #[tokio::test]
    async fn oauth2_without_token_reports_auth_required() {
        let dir = tempfile::tempdir().unwrap();
        let config = ImapTargetConfig {
            server: "outlook.office365.com".to_string(),
            port: 993,
            username: "user@example.com".to_string(),
            folder: "INBOX".to_string(),
            auth: ImapAuthConfig::OAuth2 {
                client_id: None,
                tenant: "common".to_string(),
                token_file: dir.path().join("token.json"),
            },
        };
        let target = ImapTarget::new(TargetId::from("o365"), config).unwrap();
        match &target.auth {
            AuthState::OAuth2 { authenticator } => {
                let err = authenticator.ensure_token().await.unwrap_err();
                assert!(matches!(err, crate::auth::AuthError::Required(_)));
            }
            _ => panic!("expected oauth2 auth"),
        }
    }
}
