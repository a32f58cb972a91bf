//! Client sessions
//!
//! A session ties one connection to a username and an outbound queue. Its
//! life is driven by two pumps: the reader turns inbound frames into chat
//! lines or commands, the writer drains the queue onto the connection and
//! keeps the connection alive with pings.

use parlor_config::HubConfig;
use parlor_core::{notice, Username};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::time::{timeout, Instant, MissedTickBehavior};
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::commands::{self, Outcome};
use crate::connection::{ConnectionError, Frame, FrameSink, FrameStream};
use crate::hub::{Hub, HubError};

/// Immutable payload shared by every recipient of a message
pub type Outbound = Arc<str>;

/// Registry key of a session
pub type SessionId = Uuid;

/// Upper bound on queued messages joined into one frame
const MAX_BATCH: usize = 64;

/// Room for the welcome plus the session's own join announcement
const MIN_QUEUE_CAPACITY: usize = 2;

/// Server-side state of one identified user
#[derive(Debug)]
pub struct Session {
    id: SessionId,
    username: Username,
    outbound: mpsc::Sender<Outbound>,
    /// Cancelled once the outbound queue is closed
    closed: CancellationToken,
}

impl Session {
    /// Create a session and the receiving end of its outbound queue.
    ///
    /// `capacity` is raised to at least two slots.
    pub fn new(username: Username, capacity: usize) -> (Arc<Self>, mpsc::Receiver<Outbound>) {
        let (outbound, rx) = mpsc::channel(capacity.max(MIN_QUEUE_CAPACITY));
        let session = Self {
            id: Uuid::new_v4(),
            username,
            outbound,
            closed: CancellationToken::new(),
        };
        (Arc::new(session), rx)
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn username(&self) -> &Username {
        &self.username
    }

    /// Non-blocking enqueue; a closed session refuses everything
    pub(crate) fn try_enqueue(&self, message: Outbound) -> Result<(), TrySendError<Outbound>> {
        if self.closed.is_cancelled() {
            return Err(TrySendError::Closed(message));
        }
        self.outbound.try_send(message)
    }

    /// Close the outbound queue. The writer pump flushes what is queued,
    /// sends a close frame and stops; the reader pump stops too.
    pub fn close(&self) {
        self.closed.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Resolves once the session is closed
    pub fn closed(&self) -> WaitForCancellationFuture<'_> {
        self.closed.cancelled()
    }
}

/// Per-connection timing and queue settings
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub queue_capacity: usize,
    pub ping_interval: Duration,
    pub read_timeout: Duration,
    pub write_timeout: Duration,
    pub handshake_timeout: Duration,
    pub batch_outbound: bool,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self::from(&HubConfig::default())
    }
}

impl From<&HubConfig> for SessionSettings {
    fn from(config: &HubConfig) -> Self {
        Self {
            queue_capacity: config.send_queue_capacity,
            ping_interval: config.ping_interval(),
            read_timeout: config.read_timeout(),
            write_timeout: config.write_timeout(),
            handshake_timeout: config.handshake_timeout(),
            batch_outbound: config.batch_outbound,
        }
    }
}

/// Why a connection was not admitted
#[derive(Debug, thiserror::Error)]
pub enum AdmissionError {
    #[error("invalid username {raw:?}: {source}")]
    InvalidUsername {
        raw: String,
        source: parlor_core::UsernameError,
    },
    #[error("username {0:?} is already taken")]
    UsernameTaken(String),
    #[error("server is full")]
    ServerFull,
    #[error("server is shutting down")]
    ShuttingDown,
    #[error("no username received within {0:?}")]
    HandshakeTimeout(Duration),
    #[error("connection ended before a username was sent")]
    Disconnected,
    #[error("connection error during handshake: {0}")]
    Connection(#[from] ConnectionError),
}

impl AdmissionError {
    /// Notice to send before closing, if the peer should get one
    pub fn notice(&self) -> Option<&'static str> {
        match self {
            AdmissionError::InvalidUsername { .. } => Some(notice::USERNAME_INVALID),
            AdmissionError::UsernameTaken(_) => Some(notice::USERNAME_TAKEN),
            AdmissionError::ServerFull => Some(notice::SERVER_FULL),
            AdmissionError::ShuttingDown => Some(notice::SHUTTING_DOWN),
            _ => None,
        }
    }
}

impl From<HubError> for AdmissionError {
    fn from(err: HubError) -> Self {
        match err {
            HubError::UsernameTaken(name) => AdmissionError::UsernameTaken(name.to_string()),
            HubError::Full(_) => AdmissionError::ServerFull,
            HubError::ShuttingDown => AdmissionError::ShuttingDown,
            HubError::SessionClosed(_) => AdmissionError::Disconnected,
        }
    }
}

/// Validate a proposed username and register a new session for it
pub fn admit(
    hub: &Hub,
    proposed: &str,
    queue_capacity: usize,
) -> Result<(Arc<Session>, mpsc::Receiver<Outbound>), AdmissionError> {
    let username = Username::parse(proposed).map_err(|source| AdmissionError::InvalidUsername {
        raw: proposed.to_string(),
        source,
    })?;

    // Cheap early rejection; `register` repeats the check under its lock
    if hub.is_username_taken(username.as_str()) {
        return Err(AdmissionError::UsernameTaken(username.to_string()));
    }

    let (session, rx) = Session::new(username, queue_capacity);
    hub.register(Arc::clone(&session))?;
    Ok((session, rx))
}

/// How the reader pump ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReaderExit {
    /// Close frame or end of stream
    Disconnected,
    /// The client asked to leave
    ClientExit,
    /// Nothing arrived within the read timeout
    IdleTimeout,
    /// The transport reported an error
    Error,
    /// The session was closed by the hub or by the writer pump
    Closed,
}

/// Drive one connection from handshake to teardown.
///
/// The first frame is the proposed username. A rejected connection gets a
/// single notice and is closed without ever being registered.
pub async fn serve_connection<K, S>(
    hub: Arc<Hub>,
    settings: SessionSettings,
    mut sink: K,
    mut stream: S,
) -> Result<ReaderExit, AdmissionError>
where
    K: FrameSink,
    S: FrameStream,
{
    let admitted = match timeout(settings.handshake_timeout, read_username(&mut stream)).await {
        Ok(Ok(proposed)) => admit(&hub, &proposed, settings.queue_capacity),
        Ok(Err(e)) => Err(e),
        Err(_) => Err(AdmissionError::HandshakeTimeout(settings.handshake_timeout)),
    };

    let (session, rx) = match admitted {
        Ok(admitted) => admitted,
        Err(e) => {
            info!("Connection rejected: {}", e);
            if let Some(text) = e.notice() {
                if let Err(write_err) =
                    write_frame(&mut sink, Frame::Text(text.to_string()), settings.write_timeout)
                        .await
                {
                    debug!("Failed to send rejection notice: {}", write_err);
                }
            }
            match timeout(settings.write_timeout, sink.close()).await {
                Ok(Ok(())) => {}
                Ok(Err(close_err)) => debug!("Failed to close rejected connection: {}", close_err),
                Err(_) => debug!("Timed out closing rejected connection"),
            }
            return Err(e);
        }
    };

    let writer = tokio::spawn(writer_pump(
        Arc::clone(&session),
        rx,
        sink,
        settings.clone(),
    ));

    let exit = reader_pump(&hub, &session, &mut stream, &settings).await;
    debug!(username = %session.username(), ?exit, "Reader pump finished");

    hub.unregister(session.id());
    session.close();
    if let Err(e) = writer.await {
        warn!("Writer pump for {} panicked: {}", session.username(), e);
    }

    Ok(exit)
}

async fn read_username<S: FrameStream>(stream: &mut S) -> Result<String, AdmissionError> {
    loop {
        match stream.recv().await {
            Some(Ok(Frame::Text(text))) => return Ok(text),
            Some(Ok(Frame::Binary(data))) => {
                return Ok(String::from_utf8_lossy(&data).into_owned());
            }
            Some(Ok(Frame::Ping(_))) | Some(Ok(Frame::Pong(_))) => continue,
            Some(Ok(Frame::Close)) | None => return Err(AdmissionError::Disconnected),
            Some(Err(e)) => return Err(e.into()),
        }
    }
}

/// Read frames until the connection fails, the client leaves or the
/// session is closed
pub async fn reader_pump<S: FrameStream>(
    hub: &Hub,
    session: &Arc<Session>,
    stream: &mut S,
    settings: &SessionSettings,
) -> ReaderExit {
    loop {
        let next = tokio::select! {
            _ = session.closed() => return ReaderExit::Closed,
            next = timeout(settings.read_timeout, stream.recv()) => next,
        };

        let frame = match next {
            Err(_) => {
                info!(username = %session.username(), "Read timed out after {:?}", settings.read_timeout);
                return ReaderExit::IdleTimeout;
            }
            Ok(None) | Ok(Some(Ok(Frame::Close))) => return ReaderExit::Disconnected,
            Ok(Some(Err(e))) => {
                warn!(username = %session.username(), "Read error: {}", e);
                return ReaderExit::Error;
            }
            Ok(Some(Ok(frame))) => frame,
        };

        let text = match frame {
            Frame::Text(text) => text,
            Frame::Binary(data) => match String::from_utf8(data) {
                Ok(text) => text,
                Err(_) => {
                    debug!(username = %session.username(), "Ignoring non-UTF-8 binary frame");
                    continue;
                }
            },
            // Any inbound frame refreshes the idle timeout
            Frame::Ping(_) | Frame::Pong(_) | Frame::Close => continue,
        };

        if let Outcome::Disconnect = handle_text(hub, session, &text) {
            return ReaderExit::ClientExit;
        }
    }
}

/// Route one inbound line: commands to the interpreter, everything else to
/// the room
pub fn handle_text(hub: &Hub, session: &Arc<Session>, text: &str) -> Outcome {
    if text.trim().is_empty() {
        return Outcome::Continue;
    }
    if text.starts_with('/') {
        return commands::execute(hub, session, text);
    }
    hub.broadcast(notice::chat_line(session.username().as_str(), text));
    Outcome::Continue
}

/// Drain the outbound queue onto the connection, pinging when idle
pub async fn writer_pump<K: FrameSink>(
    session: Arc<Session>,
    mut rx: mpsc::Receiver<Outbound>,
    mut sink: K,
    settings: SessionSettings,
) {
    let mut ticker = tokio::time::interval_at(
        Instant::now() + settings.ping_interval,
        settings.ping_interval,
    );
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut wrote_since_tick = false;

    loop {
        tokio::select! {
            biased;

            message = rx.recv() => {
                let Some(first) = message else { break };
                let payload = if settings.batch_outbound {
                    coalesce(first, &mut rx)
                } else {
                    first.to_string()
                };
                if let Err(e) = write_frame(&mut sink, Frame::Text(payload), settings.write_timeout).await {
                    warn!(username = %session.username(), "Write failed: {}", e);
                    break;
                }
                wrote_since_tick = true;
            }

            _ = session.closed() => {
                // Queue closed: flush what is left, then say goodbye
                while let Ok(message) = rx.try_recv() {
                    if write_frame(&mut sink, Frame::Text(message.to_string()), settings.write_timeout)
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
                let _ = timeout(settings.write_timeout, sink.close()).await;
                debug!(username = %session.username(), "Writer pump closed");
                return;
            }

            _ = ticker.tick() => {
                if !wrote_since_tick {
                    if let Err(e) = write_frame(&mut sink, Frame::Ping(Vec::new()), settings.write_timeout).await {
                        warn!(username = %session.username(), "Ping failed: {}", e);
                        break;
                    }
                }
                wrote_since_tick = false;
            }
        }
    }

    // The connection is unusable; take the reader down with us
    session.close();
    let _ = timeout(settings.write_timeout, sink.close()).await;
}

/// Join the first message with whatever is already queued behind it
fn coalesce(first: Outbound, rx: &mut mpsc::Receiver<Outbound>) -> String {
    let mut payload = String::from(&*first);
    for _ in 1..MAX_BATCH {
        match rx.try_recv() {
            Ok(next) => {
                payload.push('\n');
                payload.push_str(&next);
            }
            Err(_) => break,
        }
    }
    payload
}

async fn write_frame<K: FrameSink>(
    sink: &mut K,
    frame: Frame,
    deadline: Duration,
) -> Result<(), ConnectionError> {
    match timeout(deadline, sink.send(frame)).await {
        Ok(result) => result,
        Err(_) => Err(ConnectionError::WriteTimeout(deadline)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::mock::{self, MockPeer};

    fn settings() -> SessionSettings {
        SessionSettings {
            batch_outbound: false,
            ..SessionSettings::default()
        }
    }

    async fn recv(peer: &mut MockPeer) -> String {
        tokio::time::timeout(Duration::from_secs(5), peer.next_text())
            .await
            .expect("timed out waiting for a frame")
    }

    async fn recv_frame(peer: &mut MockPeer) -> Option<Frame> {
        tokio::time::timeout(Duration::from_secs(5), peer.next_frame())
            .await
            .expect("timed out waiting for a frame")
    }

    /// Spawn a connection that has already sent its username
    fn connect(
        hub: &Arc<Hub>,
        settings: SessionSettings,
        name: &str,
    ) -> (MockPeer, tokio::task::JoinHandle<Result<ReaderExit, AdmissionError>>) {
        let (sink, stream, peer) = mock::connection();
        peer.send_text(name);
        let task = tokio::spawn(serve_connection(Arc::clone(hub), settings, sink, stream));
        (peer, task)
    }

    async fn join(
        hub: &Arc<Hub>,
        name: &str,
    ) -> (MockPeer, tokio::task::JoinHandle<Result<ReaderExit, AdmissionError>>) {
        let (mut peer, task) = connect(hub, settings(), name);
        assert!(recv(&mut peer).await.starts_with(&format!("Welcome {}!", name)));
        assert_eq!(recv(&mut peer).await, notice::joined(name));
        (peer, task)
    }

    #[tokio::test]
    async fn test_chat_line_is_broadcast_to_everyone() {
        let hub = Arc::new(Hub::default());
        let (mut alice, _a) = join(&hub, "alice").await;
        let (mut bob, _b) = join(&hub, "bob").await;
        assert_eq!(recv(&mut alice).await, "*** bob joined the chat ***");

        alice.send_text("hello room");
        assert_eq!(recv(&mut alice).await, "alice: hello room");
        assert_eq!(recv(&mut bob).await, "alice: hello room");
    }

    #[tokio::test]
    async fn test_blank_lines_are_ignored() {
        let hub = Arc::new(Hub::default());
        let (mut alice, _a) = join(&hub, "alice").await;

        alice.send_text("   ");
        alice.send_text("");
        alice.send_text("real");
        assert_eq!(recv(&mut alice).await, "alice: real");
    }

    #[tokio::test]
    async fn test_duplicate_username_is_rejected_and_closed() {
        let hub = Arc::new(Hub::default());
        let (_alice, _a) = join(&hub, "alice").await;

        let (mut imposter, task) = connect(&hub, settings(), "ALICE");
        assert_eq!(recv(&mut imposter).await, notice::USERNAME_TAKEN);
        assert_eq!(recv_frame(&mut imposter).await, Some(Frame::Close));
        assert!(matches!(
            task.await.unwrap(),
            Err(AdmissionError::UsernameTaken(_))
        ));
        assert_eq!(hub.len(), 1);
    }

    #[tokio::test]
    async fn test_invalid_username_is_rejected() {
        let hub = Arc::new(Hub::default());
        let (mut peer, task) = connect(&hub, settings(), "no spaces");

        assert_eq!(recv(&mut peer).await, notice::USERNAME_INVALID);
        assert_eq!(recv_frame(&mut peer).await, Some(Frame::Close));
        assert!(matches!(
            task.await.unwrap(),
            Err(AdmissionError::InvalidUsername { .. })
        ));
        assert!(hub.is_empty());
    }

    #[tokio::test]
    async fn test_rejection_survives_unwritable_connection() {
        let hub = Arc::new(Hub::default());
        let (_alice, _a) = join(&hub, "alice").await;

        let (mut imposter, task) = {
            let (sink, stream, peer) = mock::connection();
            peer.break_writes();
            peer.send_text("alice");
            let task = tokio::spawn(serve_connection(Arc::clone(&hub), settings(), sink, stream));
            (peer, task)
        };

        assert!(matches!(
            task.await.unwrap(),
            Err(AdmissionError::UsernameTaken(_))
        ));
        assert_eq!(recv_frame(&mut imposter).await, None);
        assert_eq!(hub.len(), 1);
    }

    #[test]
    fn test_concurrent_admission_of_one_name() {
        let hub = Arc::new(Hub::default());
        let barrier = std::sync::Barrier::new(16);

        let results: Vec<_> = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..16)
                .map(|_| {
                    scope.spawn(|| {
                        barrier.wait();
                        admit(&hub, "Alice", 16).map(|(session, _rx)| session)
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        let admitted = results.iter().filter(|r| r.is_ok()).count();
        assert_eq!(admitted, 1);
        assert!(results
            .iter()
            .filter_map(|r| r.as_ref().err())
            .all(|e| matches!(e, AdmissionError::UsernameTaken(_))));
        assert_eq!(hub.len(), 1);
    }

    #[tokio::test]
    async fn test_hang_up_unregisters_and_announces() {
        let hub = Arc::new(Hub::default());
        let (mut alice, alice_task) = join(&hub, "alice").await;
        let (mut bob, _b) = join(&hub, "bob").await;
        assert_eq!(recv(&mut alice).await, "*** bob joined the chat ***");

        alice.hang_up();
        assert_eq!(alice_task.await.unwrap().unwrap(), ReaderExit::Disconnected);
        assert_eq!(recv(&mut bob).await, "*** alice left the chat ***");
        assert!(!hub.is_username_taken("alice"));
    }

    #[tokio::test]
    async fn test_close_frame_ends_session() {
        let hub = Arc::new(Hub::default());
        let (alice, task) = join(&hub, "alice").await;

        alice.send(Frame::Close);
        assert_eq!(task.await.unwrap().unwrap(), ReaderExit::Disconnected);
        assert!(hub.is_empty());
    }

    #[tokio::test]
    async fn test_exit_command_leaves_once() {
        let hub = Arc::new(Hub::default());
        let (mut alice, alice_task) = join(&hub, "alice").await;
        let (mut bob, _b) = join(&hub, "bob").await;
        assert_eq!(recv(&mut alice).await, "*** bob joined the chat ***");

        alice.send_text("/exit");
        assert_eq!(recv(&mut alice).await, notice::GOODBYE);
        assert_eq!(recv_frame(&mut alice).await, Some(Frame::Close));
        assert_eq!(alice_task.await.unwrap().unwrap(), ReaderExit::ClientExit);

        assert_eq!(recv(&mut bob).await, "*** alice left the chat ***");
        bob.send_text("still here");
        assert_eq!(recv(&mut bob).await, "bob: still here");
    }

    #[tokio::test]
    async fn test_rejoin_after_disconnect() {
        let hub = Arc::new(Hub::default());
        let (mut carol, task) = join(&hub, "carol").await;
        carol.hang_up();
        task.await.unwrap().unwrap();

        let (_carol_again, _t) = join(&hub, "carol").await;
        assert_eq!(hub.len(), 1);
    }

    #[tokio::test]
    async fn test_write_failure_tears_session_down() {
        let hub = Arc::new(Hub::default());
        let (mut alice, alice_task) = join(&hub, "alice").await;
        let (mut bob, _b) = join(&hub, "bob").await;
        assert_eq!(recv(&mut alice).await, "*** bob joined the chat ***");

        alice.break_writes();
        bob.send_text("ping?");
        assert_eq!(recv(&mut bob).await, "bob: ping?");

        assert_eq!(alice_task.await.unwrap().unwrap(), ReaderExit::Closed);
        assert_eq!(recv(&mut bob).await, "*** alice left the chat ***");
        assert_eq!(hub.len(), 1);
    }

    #[tokio::test]
    async fn test_batching_joins_queued_messages() {
        let (session, mut rx) = Session::new(Username::parse("alice").unwrap(), 16);
        let (sink, _stream, mut peer) = mock::connection();

        for line in ["one", "two", "three"] {
            session.try_enqueue(Outbound::from(line)).unwrap();
        }
        let first = rx.recv().await.unwrap();
        assert_eq!(coalesce(first, &mut rx), "one\ntwo\nthree");

        let settings = SessionSettings::default();
        session.try_enqueue(Outbound::from("a")).unwrap();
        session.try_enqueue(Outbound::from("b")).unwrap();
        let writer = tokio::spawn(writer_pump(Arc::clone(&session), rx, sink, settings));
        assert_eq!(recv(&mut peer).await, "a\nb");

        session.close();
        writer.await.unwrap();
        assert_eq!(recv_frame(&mut peer).await, Some(Frame::Close));
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_writer_sends_ping() {
        let (session, rx) = Session::new(Username::parse("alice").unwrap(), 16);
        let (sink, _stream, mut peer) = mock::connection();
        let writer = tokio::spawn(writer_pump(Arc::clone(&session), rx, sink, settings()));

        assert_eq!(peer.next_frame().await, Some(Frame::Ping(Vec::new())));

        session.try_enqueue(Outbound::from("hi")).unwrap();
        assert_eq!(peer.next_frame().await, Some(Frame::Text("hi".to_string())));

        session.close();
        writer.await.unwrap();
        assert_eq!(peer.next_frame().await, Some(Frame::Close));
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_connection_times_out() {
        let hub = Arc::new(Hub::default());
        let (mut alice, task) = join(&hub, "alice").await;

        // Pings keep flowing out, but nothing comes back
        loop {
            match alice.next_frame().await {
                Some(Frame::Ping(_)) => continue,
                Some(Frame::Close) => break,
                other => panic!("unexpected frame {:?}", other),
            }
        }
        assert_eq!(task.await.unwrap().unwrap(), ReaderExit::IdleTimeout);
        assert!(hub.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_inbound_pong_keeps_connection_alive() {
        let hub = Arc::new(Hub::default());
        let (mut alice, _task) = join(&hub, "alice").await;

        for _ in 0..30 {
            assert_eq!(alice.next_frame().await, Some(Frame::Ping(Vec::new())));
            alice.send(Frame::Pong(Vec::new()));
        }
        // 15 minutes later, still registered
        assert!(hub.is_username_taken("alice"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_handshake_timeout() {
        let hub = Arc::new(Hub::default());
        let (sink, stream, mut peer) = mock::connection();
        let task = tokio::spawn(serve_connection(Arc::clone(&hub), settings(), sink, stream));

        assert!(matches!(
            task.await.unwrap(),
            Err(AdmissionError::HandshakeTimeout(_))
        ));
        assert_eq!(peer.next_frame().await, Some(Frame::Close));
    }
}
