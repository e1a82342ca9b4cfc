//! Connection establishment: transport connect plus the AUTH/SELECT
//! handshake, bounded by the target's connect timeout.

use super::session::Session;
use super::target::Target;
use super::transport::Connector;
use crate::error::{Error, Result};
use bytes::Bytes;
use tracing::debug;

/// Connect to `target` and run its handshake.
///
/// On success the returned session is authenticated and switched to the
/// requested database. On any failure after the transport came up, the
/// session is closed before the error is returned; dropping the future
/// mid-flight tears the connection down as well.
pub async fn establish(target: &Target, connector: &dyn Connector) -> Result<Session> {
    match target.connect_timeout {
        Some(limit) => tokio::time::timeout(limit, establish_inner(target, connector))
            .await
            .map_err(|_| Error::ConnectTimedOut(limit))?,
        None => establish_inner(target, connector).await,
    }
}

async fn establish_inner(target: &Target, connector: &dyn Connector) -> Result<Session> {
    debug!(endpoint = %target.endpoint, "connecting");
    let stream = connector.connect(&target.endpoint).await?;
    let session = Session::new(stream);

    if let Some(password) = &target.password {
        let args = [Bytes::copy_from_slice(password.as_bytes())];
        match session.invoke("AUTH", &args).await {
            Ok(_) => {}
            // Any error reply aborts the handshake, including the reply a
            // server without a configured password gives to AUTH.
            Err(Error::Server(message)) => {
                session.close();
                return Err(Error::AuthFailed(message));
            }
            Err(e) => {
                session.close();
                return Err(e);
            }
        }
    }

    if let Some(db) = target.db {
        let args = [Bytes::from(db.to_string())];
        match session.invoke("SELECT", &args).await {
            Ok(_) => {}
            Err(Error::Server(message)) => {
                session.close();
                let lower = message.to_ascii_lowercase();
                return Err(if message.starts_with("NOAUTH") {
                    Error::AuthFailed(message)
                } else if lower.contains("db index") || lower.contains("out of range") {
                    Error::UnknownDatabase(db)
                } else {
                    Error::SelectFailed(message)
                });
            }
            Err(e) => {
                session.close();
                return Err(e);
            }
        }
    }

    debug!(endpoint = %target.endpoint, "handshake complete");
    Ok(session)
}
