//! Primary discovery through sentinel endpoints.
//!
//! A [`SentinelResolver`] asks a fixed, ordered list of sentinel
//! endpoints where the current primary for a named service lives,
//! connects there, and verifies the node's reported role before handing
//! the session out. The validated session is cached and reused; when it
//! goes away, the next [`SentinelResolver::resolve`] call runs discovery
//! again. The resolver never re-resolves behind the caller's back.

use super::handshake::establish;
use super::session::Session;
use super::target::Target;
use super::transport::{Connector, DefaultConnector, Endpoint};
use crate::error::{Error, Result};
use crate::protocol::Reply;
use bytes::Bytes;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Resolves and connects to the current primary for a named service.
#[derive(Debug)]
pub struct SentinelResolver {
    sentinels: Vec<Target>,
    /// Credentials and timeouts applied to the resolved primary.
    template: Target,
    connector: Arc<dyn Connector>,
    cached: tokio::sync::Mutex<Option<Session>>,
}

impl SentinelResolver {
    /// Build a resolver over an ordered sentinel list. `template`
    /// supplies the password, database and timeouts used when connecting
    /// to the resolved primary.
    pub fn new(sentinels: Vec<Target>, template: Target) -> Self {
        Self::with_connector(sentinels, template, Arc::new(DefaultConnector))
    }

    /// Build a resolver with a custom transport connector.
    pub fn with_connector(
        sentinels: Vec<Target>,
        template: Target,
        connector: Arc<dyn Connector>,
    ) -> Self {
        Self {
            sentinels,
            template,
            connector,
            cached: tokio::sync::Mutex::new(None),
        }
    }

    /// Return a session to the verified primary for `service`.
    ///
    /// A still-open session from an earlier resolution is returned as-is.
    /// Otherwise sentinels are consulted in configuration order until one
    /// names a primary; the candidate must identify itself with role
    /// `master` or resolution fails with [`Error::InvalidRole`]. When
    /// every sentinel fails, the error aggregates each endpoint's failure.
    pub async fn resolve(&self, service: &str) -> Result<Session> {
        let mut cached = self.cached.lock().await;
        if let Some(session) = cached.as_ref() {
            if session.is_open() {
                debug!(service, "reusing cached primary session");
                return Ok(session.clone());
            }
            *cached = None;
        }

        let (host, port) = self.discover(service).await?;
        let primary = self.primary_target(host, port);
        let session = establish(&primary, self.connector.as_ref()).await?;

        if let Err(e) = verify_role(&session, &primary.endpoint).await {
            session.close();
            return Err(e);
        }

        info!(service, primary = %primary.endpoint, "resolved primary");
        *cached = Some(session.clone());
        Ok(session)
    }

    /// Ask each sentinel, in order, for the primary address. First
    /// well-formed answer wins.
    async fn discover(&self, service: &str) -> Result<(String, u16)> {
        if self.sentinels.is_empty() {
            return Err(Error::NoPrimaryFound {
                name: service.to_string(),
                detail: "no sentinels configured".to_string(),
            });
        }

        let mut failures = Vec::new();
        for sentinel in &self.sentinels {
            debug!(endpoint = %sentinel.endpoint, service, "asking sentinel");
            match self.ask(sentinel, service).await {
                Ok(Some(addr)) => return Ok(addr),
                Ok(None) => {
                    warn!(endpoint = %sentinel.endpoint, service, "sentinel does not know service");
                    failures.push(format!(
                        "{}: unknown service '{service}'",
                        sentinel.endpoint
                    ));
                }
                Err(e) => {
                    warn!(endpoint = %sentinel.endpoint, error = %e, "sentinel query failed");
                    failures.push(format!("{}: {e}", sentinel.endpoint));
                }
            }
        }

        Err(Error::NoPrimaryFound {
            name: service.to_string(),
            detail: failures.join("; "),
        })
    }

    /// Ask one sentinel over a short-lived session. `Ok(None)` means the
    /// sentinel answered but does not track this service.
    async fn ask(&self, sentinel: &Target, service: &str) -> Result<Option<(String, u16)>> {
        let session = establish(sentinel, self.connector.as_ref()).await?;
        let args = [
            Bytes::from_static(b"get-master-addr-by-name"),
            Bytes::copy_from_slice(service.as_bytes()),
        ];
        let reply = session.invoke("SENTINEL", &args).await;
        session.close();

        match reply? {
            Reply::Null => Ok(None),
            Reply::Array(items) if items.len() == 2 => {
                let host = items[0]
                    .as_str()
                    .ok_or_else(|| Error::UnexpectedReply("SENTINEL".into()))?
                    .to_string();
                let port = items[1]
                    .as_integer()
                    .and_then(|p| u16::try_from(p).ok())
                    .ok_or_else(|| Error::UnexpectedReply("SENTINEL".into()))?;
                Ok(Some((host, port)))
            }
            _ => Err(Error::UnexpectedReply("SENTINEL".into())),
        }
    }

    fn primary_target(&self, host: String, port: u16) -> Target {
        let tls = matches!(self.template.endpoint, Endpoint::Tcp { tls: true, .. });
        Target {
            endpoint: Endpoint::Tcp { host, port, tls },
            password: self.template.password.clone(),
            db: self.template.db,
            connect_timeout: self.template.connect_timeout,
            idle_timeout: self.template.idle_timeout,
        }
    }
}

/// Require the connected node to report role `master`.
async fn verify_role(session: &Session, endpoint: &Endpoint) -> Result<()> {
    let role = match session.invoke("ROLE", &[]).await? {
        Reply::Array(items) => items
            .first()
            .and_then(Reply::as_str)
            .unwrap_or("unknown")
            .to_string(),
        _ => "unknown".to_string(),
    };
    if role == "master" {
        Ok(())
    } else {
        Err(Error::InvalidRole {
            addr: endpoint.to_string(),
            role,
        })
    }
}
