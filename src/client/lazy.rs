//! Lazily-connecting client.
//!
//! A [`Client`] holds a [`Target`] and opens the underlying [`Session`]
//! on first use. When the session dies the client stays usable: the next
//! command reconnects, runs the handshake again and restores any active
//! subscriptions. A quiescent connection is recycled after the target's
//! idle period; the next command brings it back.

use super::event::{Event, EventHub};
use super::handshake::establish;
use super::session::Session;
use super::target::Target;
use super::transport::{Connector, DefaultConnector};
use crate::error::{Error, Result};
use crate::protocol::Reply;
use bytes::Bytes;
use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, Weak};
use tokio::sync::{mpsc, watch};
use tracing::debug;

/// Lazily-connecting client handle. Cheap to clone.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientShared>,
}

struct ClientShared {
    target: Target,
    connector: Arc<dyn Connector>,
    /// Current session, if any. The async mutex serializes connection
    /// attempts so concurrent commands share one handshake.
    conn: tokio::sync::Mutex<Option<Session>>,
    state: parking_lot::Mutex<ClientState>,
    events: EventHub,
    /// Flips to true exactly once, when the client is closed. Also used
    /// to cancel an in-flight connect.
    closed_tx: watch::Sender<bool>,
}

struct ClientState {
    closed: bool,
    /// Bumped on every command; stale idle timers notice and do nothing.
    generation: u64,
    subscribed: HashSet<Bytes>,
    psubscribed: HashSet<Bytes>,
}

impl Client {
    /// Create a client for a target URI. No connection is opened until
    /// the first command.
    pub fn connect(uri: &str) -> Result<Self> {
        Ok(Self::with_connector(
            Target::parse(uri)?,
            Arc::new(DefaultConnector),
        ))
    }

    /// Create a client with a custom transport connector.
    pub fn with_connector(target: Target, connector: Arc<dyn Connector>) -> Self {
        let (closed_tx, _) = watch::channel(false);
        Self {
            inner: Arc::new(ClientShared {
                target,
                connector,
                conn: tokio::sync::Mutex::new(None),
                state: parking_lot::Mutex::new(ClientState {
                    closed: false,
                    generation: 0,
                    subscribed: HashSet::new(),
                    psubscribed: HashSet::new(),
                }),
                events: EventHub::new(),
                closed_tx,
            }),
        }
    }

    /// The target this client connects to.
    pub fn target(&self) -> &Target {
        &self.inner.target
    }

    /// Register a receiver for push messages and lifecycle events.
    pub fn events(&self) -> mpsc::UnboundedReceiver<Event> {
        self.inner.events.register()
    }

    /// Whether a live connection currently exists. A `false` here does
    /// not prevent commands; they reconnect on demand.
    pub fn is_connected(&self) -> bool {
        match self.inner.conn.try_lock() {
            Ok(slot) => slot.as_ref().is_some_and(Session::is_open),
            Err(_) => false,
        }
    }

    /// Send a raw command, connecting first if necessary.
    pub async fn invoke(&self, name: &str, args: &[Bytes]) -> Result<Reply> {
        // Stale the idle timer before the session is handed out, so it
        // cannot close a connection this command is about to use.
        self.inner.bump_generation();
        let session = self.inner.acquire().await?;
        let result = session.invoke(name, args).await;
        self.inner.arm_idle(&session);
        result
    }

    /// Fetch a key. `None` when the key does not exist.
    pub async fn get(&self, key: impl AsRef<[u8]>) -> Result<Option<Bytes>> {
        let reply = self.invoke("GET", &[copy(key)]).await?;
        match reply {
            Reply::Null => Ok(None),
            Reply::Bulk(value) => Ok(Some(value)),
            other => Err(Error::UnexpectedReply(format!("GET returned {other:?}"))),
        }
    }

    /// Store a value under a key.
    pub async fn set(&self, key: impl AsRef<[u8]>, value: impl AsRef<[u8]>) -> Result<()> {
        let reply = self.invoke("SET", &[copy(key), copy(value)]).await?;
        match reply {
            Reply::Status(ref s) if s == "OK" => Ok(()),
            other => Err(Error::UnexpectedReply(format!("SET returned {other:?}"))),
        }
    }

    /// Delete a key. Returns the number of keys removed.
    pub async fn del(&self, key: impl AsRef<[u8]>) -> Result<i64> {
        let reply = self.invoke("DEL", &[copy(key)]).await?;
        reply
            .as_integer()
            .ok_or_else(|| Error::UnexpectedReply(format!("DEL returned {reply:?}")))
    }

    /// Ping the server, optionally with a payload to echo.
    pub async fn ping(&self, payload: Option<Bytes>) -> Result<Bytes> {
        let args: &[Bytes] = match &payload {
            Some(p) => std::slice::from_ref(p),
            None => &[],
        };
        let reply = self.invoke("PING", args).await?;
        reply
            .into_bytes()
            .ok_or_else(|| Error::UnexpectedReply("PING returned a non-string reply".into()))
    }

    /// Publish a message. Returns the number of receivers.
    pub async fn publish(
        &self,
        channel: impl AsRef<[u8]>,
        payload: impl AsRef<[u8]>,
    ) -> Result<i64> {
        let reply = self.invoke("PUBLISH", &[copy(channel), copy(payload)]).await?;
        reply
            .as_integer()
            .ok_or_else(|| Error::UnexpectedReply(format!("PUBLISH returned {reply:?}")))
    }

    /// Subscribe to a channel. The subscription survives reconnects until
    /// [`Client::unsubscribe`] is called.
    pub async fn subscribe(&self, channel: impl AsRef<[u8]>) -> Result<()> {
        let channel = copy(channel);
        self.invoke("SUBSCRIBE", &[channel.clone()]).await?;
        self.inner.state.lock().subscribed.insert(channel);
        Ok(())
    }

    /// Drop a channel subscription.
    pub async fn unsubscribe(&self, channel: impl AsRef<[u8]>) -> Result<()> {
        let channel = copy(channel);
        self.inner.state.lock().subscribed.remove(&channel);
        self.invoke("UNSUBSCRIBE", &[channel]).await?;
        Ok(())
    }

    /// Subscribe to a channel pattern. Survives reconnects like
    /// [`Client::subscribe`].
    pub async fn psubscribe(&self, pattern: impl AsRef<[u8]>) -> Result<()> {
        let pattern = copy(pattern);
        self.invoke("PSUBSCRIBE", &[pattern.clone()]).await?;
        self.inner.state.lock().psubscribed.insert(pattern);
        Ok(())
    }

    /// Drop a pattern subscription.
    pub async fn punsubscribe(&self, pattern: impl AsRef<[u8]>) -> Result<()> {
        let pattern = copy(pattern);
        self.inner.state.lock().psubscribed.remove(&pattern);
        self.invoke("PUNSUBSCRIBE", &[pattern]).await?;
        Ok(())
    }

    /// Close gracefully: let in-flight commands finish, then disconnect.
    /// The client accepts no further commands.
    pub async fn end(&self) {
        self.shutdown(true).await;
    }

    /// Close immediately, rejecting in-flight commands. Idempotent.
    pub async fn close(&self) {
        self.shutdown(false).await;
    }

    async fn shutdown(&self, graceful: bool) {
        let first = {
            let mut state = self.inner.state.lock();
            !std::mem::replace(&mut state.closed, true)
        };
        // Cancels any connect in progress, releasing the conn mutex.
        let _ = self.inner.closed_tx.send(true);

        let session = self.inner.conn.lock().await.take();
        if let Some(session) = session {
            if graceful {
                session.end().await;
            } else {
                session.close();
                session.closed().await;
            }
        }

        if first {
            self.inner.events.emit(Event::Closed { by_peer: false });
            self.inner.events.detach_all();
        }
    }
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("endpoint", &self.inner.target.endpoint.to_string())
            .field("connected", &self.is_connected())
            .finish()
    }
}

impl ClientShared {
    /// Return the live session, connecting if there is none.
    async fn acquire(self: &Arc<Self>) -> Result<Session> {
        if self.state.lock().closed {
            return Err(Error::NotConnected);
        }

        let mut slot = self.conn.lock().await;
        if let Some(session) = slot.as_ref() {
            if session.is_open() {
                return Ok(session.clone());
            }
            *slot = None;
        }
        // Re-check under the slot lock: close() may have won the race.
        if self.state.lock().closed {
            return Err(Error::NotConnected);
        }

        let mut closed_rx = self.closed_tx.subscribe();
        let session = tokio::select! {
            res = establish(&self.target, self.connector.as_ref()) => res?,
            _ = closed_rx.wait_for(|c| *c) => return Err(Error::ConnectCancelled),
        };

        let events = session.events();
        tokio::spawn(forward_events(
            Arc::downgrade(self),
            session.clone(),
            events,
        ));

        if let Err(e) = self.restore_subscriptions(&session).await {
            session.close();
            return Err(e);
        }

        self.arm_idle(&session);
        *slot = Some(session.clone());
        Ok(session)
    }

    /// Re-issue the client's desired subscriptions on a fresh session.
    async fn restore_subscriptions(&self, session: &Session) -> Result<()> {
        let (channels, patterns) = {
            let state = self.state.lock();
            (
                state.subscribed.iter().cloned().collect::<Vec<_>>(),
                state.psubscribed.iter().cloned().collect::<Vec<_>>(),
            )
        };
        for channel in channels {
            session.invoke("SUBSCRIBE", &[channel]).await?;
        }
        for pattern in patterns {
            session.invoke("PSUBSCRIBE", &[pattern]).await?;
        }
        Ok(())
    }

    fn bump_generation(&self) {
        self.state.lock().generation += 1;
    }

    /// Start (or restart) the idle countdown for a session. The timer
    /// fires only if no newer command has run and the session is
    /// completely quiet.
    fn arm_idle(self: &Arc<Self>, session: &Session) {
        let Some(idle) = self.target.idle_timeout else {
            return;
        };
        let generation = {
            let mut state = self.state.lock();
            state.generation += 1;
            state.generation
        };
        let weak = Arc::downgrade(self);
        let session = session.clone();
        tokio::spawn(async move {
            tokio::time::sleep(idle).await;
            let Some(shared) = weak.upgrade() else { return };
            // The whole decision happens under the state lock, so it is
            // ordered against the generation bump in `Client::invoke`: a
            // command either finds the session already closed here, or
            // stales this timer before acquiring the session.
            let state = shared.state.lock();
            if state.generation != generation {
                return;
            }
            if session.pending_count() == 0 && session.subscription_count() == 0 {
                debug!("idle timeout reached, disconnecting");
                session.close();
            }
        });
    }
}

/// Forward session events to the client hub until the session closes,
/// then release the dead session so the next command reconnects.
async fn forward_events(
    shared: Weak<ClientShared>,
    session: Session,
    mut events: mpsc::UnboundedReceiver<Event>,
) {
    while let Some(event) = events.recv().await {
        let Some(shared) = shared.upgrade() else { return };
        match event {
            Event::Closed { .. } => {
                if let Ok(mut slot) = shared.conn.try_lock() {
                    if slot.as_ref().is_some_and(|s| s.same(&session)) {
                        *slot = None;
                    }
                }
                return;
            }
            other => shared.events.emit(other),
        }
    }
}

fn copy(bytes: impl AsRef<[u8]>) -> Bytes {
    Bytes::copy_from_slice(bytes.as_ref())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::transport::{BoxedStream, ConnectFuture, Endpoint};
    use parking_lot::Mutex;
    use std::io;
    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt, DuplexStream};

    /// Hands out queued in-memory streams, one per connect.
    #[derive(Debug)]
    struct QueueConnector {
        streams: Mutex<Vec<DuplexStream>>,
    }

    impl QueueConnector {
        fn new(count: usize) -> (Arc<Self>, Vec<DuplexStream>) {
            let mut locals = Vec::new();
            let mut remotes = Vec::new();
            for _ in 0..count {
                let (local, remote) = duplex(64 * 1024);
                locals.push(local);
                remotes.push(remote);
            }
            locals.reverse();
            (
                Arc::new(Self {
                    streams: Mutex::new(locals),
                }),
                remotes,
            )
        }
    }

    impl Connector for QueueConnector {
        fn connect<'a>(&'a self, _endpoint: &'a Endpoint) -> ConnectFuture<'a> {
            Box::pin(async move {
                match self.streams.lock().pop() {
                    Some(stream) => Ok(Box::new(stream) as BoxedStream),
                    None => Err(io::Error::new(
                        io::ErrorKind::ConnectionRefused,
                        "no more streams",
                    )),
                }
            })
        }
    }

    fn target(uri: &str) -> Target {
        Target::parse(uri).unwrap()
    }

    async fn serve_ping(remote: &mut DuplexStream) {
        let mut buf = vec![0u8; 256];
        remote.read(&mut buf).await.unwrap();
        remote.write_all(b"+PONG\r\n").await.unwrap();
    }

    #[tokio::test]
    async fn test_no_connection_until_first_command() {
        let (connector, mut remotes) = QueueConnector::new(1);
        let client = Client::with_connector(target("plain://x?idle=-1"), connector.clone());
        assert!(!client.is_connected());
        assert_eq!(connector.streams.lock().len(), 1);

        let mut remote = remotes.remove(0);
        let server = tokio::spawn(async move { serve_ping(&mut remote).await });
        client.ping(None).await.unwrap();
        assert!(client.is_connected());
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_reconnects_after_session_loss() {
        let (connector, mut remotes) = QueueConnector::new(2);
        let client = Client::with_connector(target("plain://x?idle=-1"), connector);
        let mut second = remotes.pop().unwrap();
        let mut first = remotes.pop().unwrap();

        let server = tokio::spawn(async move { serve_ping(&mut first).await });
        client.ping(None).await.unwrap();
        server.await.unwrap();
        // first was dropped with the server task, killing the connection;
        // give the reader a moment to notice.
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        let server = tokio::spawn(async move {
            serve_ping(&mut second).await;
            second
        });
        client.ping(None).await.unwrap();
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_closed_client_rejects_commands() {
        let (connector, _remotes) = QueueConnector::new(1);
        let client = Client::with_connector(target("plain://x"), connector);
        let mut events = client.events();

        client.close().await;
        client.close().await;

        assert_eq!(events.recv().await, Some(Event::Closed { by_peer: false }));
        assert_eq!(events.recv().await, None);
        assert!(matches!(
            client.ping(None).await.unwrap_err(),
            Error::NotConnected
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_disconnect_without_client_close_event() {
        let (connector, mut remotes) = QueueConnector::new(1);
        let client = Client::with_connector(target("plain://x?idle=0.05"), connector);
        let mut events = client.events();
        let mut remote = remotes.remove(0);

        let server = tokio::spawn(async move {
            serve_ping(&mut remote).await;
            remote
        });
        client.ping(None).await.unwrap();
        let remote = server.await.unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        assert!(!client.is_connected());
        // Idle recycling is invisible at the client level.
        assert!(events.try_recv().is_err());
        drop(remote);
    }

    #[tokio::test(start_paused = true)]
    async fn test_commands_push_the_idle_deadline_back() {
        let (connector, mut remotes) = QueueConnector::new(1);
        let client = Client::with_connector(target("plain://x?idle=0.1"), connector);
        let mut remote = remotes.remove(0);

        let server = tokio::spawn(async move {
            for _ in 0..3 {
                serve_ping(&mut remote).await;
            }
            remote
        });

        for _ in 0..3 {
            tokio::time::sleep(std::time::Duration::from_millis(60)).await;
            client.ping(None).await.unwrap();
        }
        // 180ms elapsed, more than the idle period, yet still connected.
        assert!(client.is_connected());
        let _remote = server.await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_command_racing_the_idle_deadline_is_always_served() {
        // Issue commands right as the idle timer comes due, repeatedly.
        // Whichever side wins, the command must be served: on the old
        // session, or transparently on a fresh one.
        let (connector, remotes) = QueueConnector::new(128);
        for mut remote in remotes {
            tokio::spawn(async move {
                let mut buf = vec![0u8; 256];
                loop {
                    match remote.read(&mut buf).await {
                        Ok(0) | Err(_) => return,
                        Ok(_) => {
                            if remote.write_all(b"+PONG\r\n").await.is_err() {
                                return;
                            }
                        }
                    }
                }
            });
        }

        let client = Client::with_connector(target("plain://x?idle=0.002"), connector);
        for _ in 0..100 {
            tokio::time::sleep(std::time::Duration::from_millis(2)).await;
            client.ping(None).await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_subscriptions_survive_reconnect() {
        let (connector, mut remotes) = QueueConnector::new(2);
        let client = Client::with_connector(target("plain://x?idle=-1"), connector);
        let mut second = remotes.pop().unwrap();
        let mut first = remotes.pop().unwrap();

        let server = tokio::spawn(async move {
            let mut buf = vec![0u8; 256];
            let n = first.read(&mut buf).await.unwrap();
            assert_eq!(&buf[..n], b"*2\r\n$9\r\nSUBSCRIBE\r\n$4\r\nnews\r\n");
            first
                .write_all(b"*3\r\n$9\r\nsubscribe\r\n$4\r\nnews\r\n:1\r\n")
                .await
                .unwrap();
        });
        client.subscribe("news").await.unwrap();
        server.await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        // The replacement connection sees the subscription replayed before
        // the command that triggered the reconnect.
        let server = tokio::spawn(async move {
            let mut buf = vec![0u8; 256];
            let n = second.read(&mut buf).await.unwrap();
            assert!(buf[..n].starts_with(b"*2\r\n$9\r\nSUBSCRIBE\r\n$4\r\nnews\r\n"));
            second
                .write_all(b"*3\r\n$9\r\nsubscribe\r\n$4\r\nnews\r\n:1\r\n")
                .await
                .unwrap();
            serve_ping(&mut second).await;
            second
        });
        client.ping(None).await.unwrap();
        let _remote = server.await.unwrap();
    }

    #[tokio::test]
    async fn test_message_events_reach_client_listeners() {
        let (connector, mut remotes) = QueueConnector::new(1);
        let client = Client::with_connector(target("plain://x?idle=-1"), connector);
        let mut events = client.events();
        let mut remote = remotes.remove(0);

        let server = tokio::spawn(async move {
            let mut buf = vec![0u8; 256];
            remote.read(&mut buf).await.unwrap();
            remote
                .write_all(b"*3\r\n$9\r\nsubscribe\r\n$4\r\nnews\r\n:1\r\n")
                .await
                .unwrap();
            remote
                .write_all(b"*3\r\n$7\r\nmessage\r\n$4\r\nnews\r\n$2\r\nhi\r\n")
                .await
                .unwrap();
            remote
        });

        client.subscribe("news").await.unwrap();
        assert_eq!(
            events.recv().await,
            Some(Event::Subscribe {
                channel: Bytes::from("news"),
                subscriptions: 1,
            })
        );
        assert_eq!(
            events.recv().await,
            Some(Event::Message {
                channel: Bytes::from("news"),
                payload: Bytes::from("hi"),
            })
        );
        let _remote = server.await.unwrap();
    }
}
