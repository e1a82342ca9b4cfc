//! Established connection with request/reply correlation.
//!
//! A [`Session`] owns one connected stream and pipelines commands over it.
//! Replies are matched to callers strictly in submission order; pub/sub
//! push frames are routed to the event hub and never consume a reply slot.
//!
//! Lifecycle is `Open` → (`Ending`) → `Closed`. `Closed` is terminal and
//! announced exactly once through [`Event::Closed`].

use super::event::{Event, EventHub};
use super::transport::BoxedStream;
use crate::error::{Error, Result};
use crate::protocol::{encode_command, Reply, ReplyDecoder};
use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::sync::{Arc, Weak};
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, trace, warn};

const READ_BUFFER_SIZE: usize = 16 * 1024;

/// Handle to an established connection. Cheap to clone; the connection
/// lives as long as any handle does.
#[derive(Clone)]
pub struct Session {
    inner: Arc<Shared>,
}

struct Shared {
    state: Mutex<State>,
    write_tx: mpsc::UnboundedSender<WriteOp>,
    events: EventHub,
    closed_tx: watch::Sender<bool>,
}

struct State {
    phase: Phase,
    pending: VecDeque<Pending>,
    subscribed: HashSet<Bytes>,
    psubscribed: HashSet<Bytes>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Open,
    Ending,
    Closed,
}

struct Pending {
    command: String,
    tx: oneshot::Sender<Result<Reply>>,
}

enum WriteOp {
    Data(Bytes),
    Shutdown,
}

impl Session {
    /// Take ownership of a connected stream and start its reader and
    /// writer tasks. Must be called within a tokio runtime.
    pub fn new(stream: BoxedStream) -> Self {
        let (read_half, write_half) = tokio::io::split(stream);
        let (write_tx, write_rx) = mpsc::unbounded_channel();
        let (closed_tx, _) = watch::channel(false);

        let inner = Arc::new(Shared {
            state: Mutex::new(State {
                phase: Phase::Open,
                pending: VecDeque::new(),
                subscribed: HashSet::new(),
                psubscribed: HashSet::new(),
            }),
            write_tx,
            events: EventHub::new(),
            closed_tx,
        });

        let closed_rx = inner.closed_tx.subscribe();
        tokio::spawn(read_loop(Arc::downgrade(&inner), read_half, closed_rx));
        tokio::spawn(write_loop(write_rx, write_half));

        Self { inner }
    }

    /// Send a command and wait for its reply.
    ///
    /// Replies resolve in submission order regardless of how callers are
    /// scheduled. An error reply from the server resolves to
    /// [`Error::Server`] and leaves the session open.
    pub async fn invoke(&self, name: &str, args: &[Bytes]) -> Result<Reply> {
        let rx = self.inner.submit(name, args)?;
        match rx.await {
            Ok(result) => result,
            // Rejection on close sends an explicit error; a plain drop of
            // the slot only happens when the shared state itself went away.
            Err(_) => Err(Error::ConnectionAborted),
        }
    }

    /// Register a receiver for push messages and lifecycle events.
    pub fn events(&self) -> mpsc::UnboundedReceiver<Event> {
        self.inner.events.register()
    }

    /// Stop accepting commands, let already-submitted ones finish, then
    /// close. Resolves once the session is fully closed.
    pub async fn end(&self) {
        let shutdown_now = {
            let mut state = self.inner.state.lock();
            match state.phase {
                Phase::Closed | Phase::Ending => false,
                Phase::Open if state.pending.is_empty() => true,
                Phase::Open => {
                    debug!(pending = state.pending.len(), "draining before close");
                    state.phase = Phase::Ending;
                    false
                }
            }
        };
        if shutdown_now {
            self.inner.shutdown(false);
        }
        self.closed().await;
    }

    /// Close immediately. Outstanding commands are rejected with
    /// [`Error::ConnectionAborted`]. Idempotent.
    pub fn close(&self) {
        self.inner.shutdown(false);
    }

    /// Wait until the session reaches its terminal state.
    pub async fn closed(&self) {
        let mut rx = self.inner.closed_tx.subscribe();
        let _ = rx.wait_for(|closed| *closed).await;
    }

    /// Whether new commands are currently accepted.
    pub fn is_open(&self) -> bool {
        self.inner.state.lock().phase == Phase::Open
    }

    /// Number of active channel and pattern subscriptions.
    pub fn subscription_count(&self) -> usize {
        let state = self.inner.state.lock();
        state.subscribed.len() + state.psubscribed.len()
    }

    /// Number of commands awaiting a reply.
    pub fn pending_count(&self) -> usize {
        self.inner.state.lock().pending.len()
    }

    /// Whether two handles refer to the same underlying connection.
    pub fn same(&self, other: &Session) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("Session")
            .field("phase", &state.phase)
            .field("pending", &state.pending.len())
            .field("subscriptions", &(state.subscribed.len() + state.psubscribed.len()))
            .finish()
    }
}

impl Shared {
    fn submit(&self, name: &str, args: &[Bytes]) -> Result<oneshot::Receiver<Result<Reply>>> {
        let command = name.to_ascii_uppercase();
        if command == "MONITOR" {
            return Err(Error::Unsupported(
                "MONITOR replies cannot be correlated with requests".into(),
            ));
        }
        if is_subscription_command(&command) && args.len() != 1 {
            return Err(Error::WrongArity(command));
        }

        let mut buf = BytesMut::new();
        encode_command(&command, args, &mut buf);
        let (tx, rx) = oneshot::channel();

        let mut state = self.state.lock();
        match state.phase {
            Phase::Open => {}
            Phase::Ending => return Err(Error::Closing),
            Phase::Closed => return Err(Error::NotConnected),
        }
        // Holding the lock across the send keeps the wire order and the
        // pending queue order identical.
        self.write_tx
            .send(WriteOp::Data(buf.freeze()))
            .map_err(|_| Error::NotConnected)?;
        trace!(%command, args = args.len(), "submitted");
        state.pending.push_back(Pending { command, tx });
        Ok(rx)
    }

    /// Route one decoded reply. Returns false once the session is closed
    /// and the reader should stop.
    fn handle_reply(&self, reply: Reply) -> bool {
        if self.state.lock().phase == Phase::Closed {
            return false;
        }
        if let Some(event) = self.classify_push(&reply) {
            trace!(?event, "push frame");
            self.events.emit(event);
            return true;
        }

        let Some(pending) = self.state.lock().pending.pop_front() else {
            self.stream_error(Error::ReplyUnderflow.to_string());
            return false;
        };
        let result = match reply {
            Reply::Error(message) => Err(Error::Server(message)),
            other => {
                self.note_subscription(&pending.command, &other);
                Ok(other)
            }
        };
        let _ = pending.tx.send(result);

        let drained = {
            let state = self.state.lock();
            state.phase == Phase::Ending && state.pending.is_empty()
        };
        if drained {
            self.shutdown(false);
            return false;
        }
        true
    }

    /// A push frame is an array tagged `message` (3 items) or `pmessage`
    /// (4 items) arriving while the connection has any subscription
    /// active. Anything else correlates with the pending queue.
    fn classify_push(&self, reply: &Reply) -> Option<Event> {
        let items = reply.as_array()?;
        let kind = items.first()?.as_bytes()?;
        {
            let state = self.state.lock();
            if state.subscribed.is_empty() && state.psubscribed.is_empty() {
                return None;
            }
        }
        match kind {
            b"message" if items.len() == 3 => Some(Event::Message {
                channel: bulk(&items[1])?,
                payload: bulk(&items[2])?,
            }),
            b"pmessage" if items.len() == 4 => Some(Event::PatternMessage {
                pattern: bulk(&items[1])?,
                channel: bulk(&items[2])?,
                payload: bulk(&items[3])?,
            }),
            _ => None,
        }
    }

    /// Track subscription state from a confirmation triple
    /// `[kind, topic, count]` and surface it as an event.
    fn note_subscription(&self, command: &str, reply: &Reply) {
        if !is_subscription_command(command) {
            return;
        }
        let Some(items) = reply.as_array() else { return };
        if items.len() != 3 {
            return;
        }
        let Some(topic) = bulk(&items[1]) else { return };
        let subscriptions = items[2].as_integer().unwrap_or(0);

        let event = {
            let mut state = self.state.lock();
            match command {
                "SUBSCRIBE" => {
                    state.subscribed.insert(topic.clone());
                    Event::Subscribe {
                        channel: topic,
                        subscriptions,
                    }
                }
                "UNSUBSCRIBE" => {
                    state.subscribed.remove(&topic);
                    Event::Unsubscribe {
                        channel: topic,
                        subscriptions,
                    }
                }
                "PSUBSCRIBE" => {
                    state.psubscribed.insert(topic.clone());
                    Event::PatternSubscribe {
                        pattern: topic,
                        subscriptions,
                    }
                }
                "PUNSUBSCRIBE" => {
                    state.psubscribed.remove(&topic);
                    Event::PatternUnsubscribe {
                        pattern: topic,
                        subscriptions,
                    }
                }
                _ => return,
            }
        };
        self.events.emit(event);
    }

    /// Fatal stream error: announce it, then tear down.
    fn stream_error(&self, message: String) {
        warn!(%message, "session stream error");
        self.events.emit(Event::Error(message));
        self.shutdown(true);
    }

    /// Transition to `Closed`. Idempotent; only the first call rejects
    /// pending commands, synthesizes unsubscriptions and emits `Closed`.
    fn shutdown(&self, by_peer: bool) {
        let (pending, subscribed, psubscribed) = {
            let mut state = self.state.lock();
            if state.phase == Phase::Closed {
                return;
            }
            state.phase = Phase::Closed;
            (
                std::mem::take(&mut state.pending),
                std::mem::take(&mut state.subscribed),
                std::mem::take(&mut state.psubscribed),
            )
        };
        debug!(by_peer, rejected = pending.len(), "session closed");

        for slot in pending {
            let err = if by_peer {
                Error::ConnectionReset
            } else {
                Error::ConnectionAborted
            };
            let _ = slot.tx.send(Err(err));
        }

        // Listeners learn that their subscriptions are gone even though no
        // unsubscribe confirmation will ever arrive.
        let mut remaining = (subscribed.len() + psubscribed.len()) as i64;
        for channel in subscribed {
            remaining -= 1;
            self.events.emit(Event::Unsubscribe {
                channel,
                subscriptions: remaining,
            });
        }
        for pattern in psubscribed {
            remaining -= 1;
            self.events.emit(Event::PatternUnsubscribe {
                pattern,
                subscriptions: remaining,
            });
        }

        let _ = self.write_tx.send(WriteOp::Shutdown);
        let _ = self.closed_tx.send(true);
        self.events.emit(Event::Closed { by_peer });
        self.events.detach_all();
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        // Last handle gone: stop both tasks.
        let _ = self.write_tx.send(WriteOp::Shutdown);
        let _ = self.closed_tx.send(true);
    }
}

fn is_subscription_command(command: &str) -> bool {
    matches!(
        command,
        "SUBSCRIBE" | "UNSUBSCRIBE" | "PSUBSCRIBE" | "PUNSUBSCRIBE"
    )
}

fn bulk(reply: &Reply) -> Option<Bytes> {
    match reply {
        Reply::Bulk(b) => Some(b.clone()),
        _ => None,
    }
}

/// Reader task: decode frames and hand them to the shared state. Holds
/// only a weak reference so dropped sessions do not linger.
async fn read_loop(
    shared: Weak<Shared>,
    mut stream: ReadHalf<BoxedStream>,
    mut closed: watch::Receiver<bool>,
) {
    let mut decoder = ReplyDecoder::new();
    let mut buf = vec![0u8; READ_BUFFER_SIZE];
    loop {
        let n = tokio::select! {
            _ = closed.wait_for(|c| *c) => return,
            res = stream.read(&mut buf) => match res {
                Ok(0) => {
                    if let Some(shared) = shared.upgrade() {
                        shared.shutdown(true);
                    }
                    return;
                }
                Ok(n) => n,
                Err(e) => {
                    if let Some(shared) = shared.upgrade() {
                        shared.stream_error(format!("read failed: {e}"));
                    }
                    return;
                }
            },
        };

        decoder.extend(&buf[..n]);
        loop {
            let Some(shared) = shared.upgrade() else { return };
            match decoder.decode() {
                Ok(Some(reply)) => {
                    if !shared.handle_reply(reply) {
                        return;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    shared.stream_error(format!("protocol violation: {e}"));
                    return;
                }
            }
        }
    }
}

/// Writer task: serialize writes submitted by any handle.
async fn write_loop(mut rx: mpsc::UnboundedReceiver<WriteOp>, mut stream: WriteHalf<BoxedStream>) {
    while let Some(op) = rx.recv().await {
        match op {
            WriteOp::Data(bytes) => {
                if let Err(e) = stream.write_all(&bytes).await {
                    debug!("write failed: {e}");
                    break;
                }
            }
            WriteOp::Shutdown => {
                let _ = stream.shutdown().await;
                break;
            }
        }
    }
}
