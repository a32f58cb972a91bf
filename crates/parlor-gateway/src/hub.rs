//! Hub: session registry and message router
//!
//! All membership changes and every fan-out happen under one lock, so a
//! broadcast never observes a half-updated member set and broadcasts are
//! totally ordered. Nothing done under the lock can block: deliveries use
//! `try_send`, and a recipient whose queue is full is dropped on the spot.

use parking_lot::Mutex;
use parlor_core::{fold, notice, Username};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::error::TrySendError;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::session::{Outbound, Session, SessionId};

/// Registry entry
#[derive(Debug)]
struct Member {
    session: Arc<Session>,
    joined: Instant,
}

#[derive(Debug, Default)]
struct Registry {
    members: HashMap<SessionId, Member>,
    /// Folded username -> session id
    names: HashMap<String, SessionId>,
    shutting_down: bool,
}

/// Outcome of a single delivery
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Delivered,
    /// The recipient could not keep up and has been removed
    Dropped,
    /// The recipient is not (or no longer) registered
    NotRegistered,
}

/// Outcome of a broadcast
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    pub delivered: usize,
    /// Members removed because their queue was full or closed
    pub dropped: Vec<Username>,
}

/// One row of [`Hub::list_active`]
#[derive(Debug, Clone)]
pub struct ActiveMember {
    pub username: Username,
    /// Time since registration, rounded to whole seconds
    pub connected: Duration,
}

impl Registry {
    fn remove(&mut self, id: SessionId) -> Option<Member> {
        let member = self.members.remove(&id)?;
        self.names.remove(&member.session.username().key());
        Some(member)
    }

    /// Close and forget a member that cannot keep up
    fn drop_member(&mut self, id: SessionId) -> Option<Username> {
        let member = self.remove(id)?;
        member.session.close();
        warn!(
            session_id = %id,
            username = %member.session.username(),
            "Dropping unresponsive session"
        );
        Some(member.session.username().clone())
    }

    fn deliver(&mut self, id: SessionId, message: Outbound) -> Delivery {
        let Some(member) = self.members.get(&id) else {
            return Delivery::NotRegistered;
        };
        match member.session.try_enqueue(message) {
            Ok(()) => Delivery::Delivered,
            Err(TrySendError::Full(_)) | Err(TrySendError::Closed(_)) => {
                self.drop_member(id);
                Delivery::Dropped
            }
        }
    }

    fn fan_out(&mut self, message: Outbound) -> BroadcastReport {
        let mut report = BroadcastReport::default();
        let mut stalled = Vec::new();

        for (id, member) in &self.members {
            match member.session.try_enqueue(Arc::clone(&message)) {
                Ok(()) => report.delivered += 1,
                Err(_) => stalled.push(*id),
            }
        }

        for id in stalled {
            if let Some(name) = self.drop_member(id) {
                report.dropped.push(name);
            }
        }
        report
    }
}

/// The single authoritative registry of connected sessions
#[derive(Debug)]
pub struct Hub {
    registry: Mutex<Registry>,
    max_members: usize,
}

impl Default for Hub {
    fn default() -> Self {
        Self::new(usize::MAX)
    }
}

impl Hub {
    /// Create a hub admitting at most `max_members` sessions at once
    pub fn new(max_members: usize) -> Self {
        Self {
            registry: Mutex::new(Registry::default()),
            max_members,
        }
    }

    /// Register a session, greet it and announce it to everyone.
    ///
    /// The name check, the insert, the welcome notice and the join
    /// announcement all happen under the same lock. Returns the number of
    /// members online after the insert. A session whose queue cannot take
    /// the welcome is dropped again and nobody hears about it.
    pub fn register(&self, session: Arc<Session>) -> Result<usize, HubError> {
        let mut registry = self.registry.lock();

        if registry.shutting_down {
            return Err(HubError::ShuttingDown);
        }
        if session.is_closed() {
            return Err(HubError::SessionClosed(session.username().clone()));
        }
        let key = session.username().key();
        if registry.names.contains_key(&key) {
            return Err(HubError::UsernameTaken(session.username().clone()));
        }
        if registry.members.len() >= self.max_members {
            return Err(HubError::Full(self.max_members));
        }

        let id = session.id();
        let username = session.username().clone();
        registry.names.insert(key, id);
        registry.members.insert(
            id,
            Member {
                session,
                joined: Instant::now(),
            },
        );
        let online = registry.members.len();
        info!(session_id = %id, username = %username, online, "Client connected");

        if registry.deliver(id, notice::welcome(username.as_str(), online).into())
            != Delivery::Delivered
        {
            return Err(HubError::SessionClosed(username));
        }
        registry.fan_out(notice::joined(username.as_str()).into());

        Ok(online)
    }

    /// Remove a session, close its queue and announce the departure.
    ///
    /// Returns `false` (and announces nothing) if the session was not
    /// registered.
    pub fn unregister(&self, id: SessionId) -> bool {
        let mut registry = self.registry.lock();

        let Some(member) = registry.remove(id) else {
            debug!(session_id = %id, "Unregister of absent session ignored");
            return false;
        };
        member.session.close();
        let username = member.session.username();
        info!(
            session_id = %id,
            username = %username,
            online = registry.members.len(),
            "Client disconnected"
        );

        registry.fan_out(notice::left(username.as_str()).into());
        true
    }

    /// Deliver a message to every registered session
    pub fn broadcast(&self, message: impl Into<Outbound>) -> BroadcastReport {
        let message = message.into();
        let report = self.registry.lock().fan_out(message);
        if !report.dropped.is_empty() {
            debug!(dropped = report.dropped.len(), "Broadcast dropped slow members");
        }
        report
    }

    /// Deliver a message to one registered session, with the same
    /// drop-on-full policy as [`Hub::broadcast`]
    pub fn send_to(&self, session: &Session, message: impl Into<Outbound>) -> Delivery {
        self.registry.lock().deliver(session.id(), message.into())
    }

    /// Snapshot of the members, oldest first
    pub fn list_active(&self) -> Vec<ActiveMember> {
        let registry = self.registry.lock();
        let now = Instant::now();

        let mut members: Vec<(&Member, ActiveMember)> = registry
            .members
            .values()
            .map(|member| {
                (
                    member,
                    ActiveMember {
                        username: member.session.username().clone(),
                        connected: round_to_secs(now.saturating_duration_since(member.joined)),
                    },
                )
            })
            .collect();
        members.sort_by(|(a, _), (b, _)| {
            a.joined
                .cmp(&b.joined)
                .then_with(|| a.session.username().as_str().cmp(b.session.username().as_str()))
        });
        members.into_iter().map(|(_, active)| active).collect()
    }

    /// Case-insensitive lookup
    pub fn find_by_username(&self, name: &str) -> Option<Arc<Session>> {
        let registry = self.registry.lock();
        let id = registry.names.get(&fold(name))?;
        registry
            .members
            .get(id)
            .map(|member| Arc::clone(&member.session))
    }

    pub fn is_username_taken(&self, name: &str) -> bool {
        self.registry.lock().names.contains_key(&fold(name))
    }

    pub fn is_registered(&self, id: SessionId) -> bool {
        self.registry.lock().members.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.registry.lock().members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Close every session queue and refuse new registrations.
    ///
    /// Used for cooperative process shutdown: writer pumps flush what is
    /// queued, send a close frame and exit. Returns how many sessions were
    /// closed.
    pub fn shutdown(&self) -> usize {
        let mut registry = self.registry.lock();
        registry.shutting_down = true;
        registry.names.clear();
        let members: Vec<Member> = registry.members.drain().map(|(_, m)| m).collect();
        drop(registry);

        for member in &members {
            member.session.close();
        }
        info!(closed = members.len(), "Hub shut down");
        members.len()
    }
}

fn round_to_secs(duration: Duration) -> Duration {
    let mut secs = duration.as_secs();
    if duration.subsec_millis() >= 500 {
        secs += 1;
    }
    Duration::from_secs(secs)
}

/// Registration errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HubError {
    #[error("Username already taken: {0}")]
    UsernameTaken(Username),
    #[error("Hub is full ({0} members)")]
    Full(usize),
    #[error("Session already closed: {0}")]
    SessionClosed(Username),
    #[error("Hub is shutting down")]
    ShuttingDown,
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn session(name: &str, capacity: usize) -> (Arc<Session>, mpsc::Receiver<Outbound>) {
        Session::new(Username::parse(name).unwrap(), capacity)
    }

    fn drain(rx: &mut mpsc::Receiver<Outbound>) -> Vec<String> {
        let mut out = Vec::new();
        while let Ok(message) = rx.try_recv() {
            out.push(message.to_string());
        }
        out
    }

    #[tokio::test]
    async fn test_register_sends_welcome_then_join() {
        let hub = Hub::default();
        let (alice, mut alice_rx) = session("alice", 16);

        assert_eq!(hub.register(Arc::clone(&alice)), Ok(1));
        assert_eq!(
            drain(&mut alice_rx),
            vec![
                notice::welcome("alice", 1),
                "*** alice joined the chat ***".to_string(),
            ]
        );

        let (bob, mut bob_rx) = session("bob", 16);
        assert_eq!(hub.register(bob), Ok(2));
        assert_eq!(drain(&mut alice_rx), vec!["*** bob joined the chat ***"]);
        assert_eq!(
            drain(&mut bob_rx),
            vec![notice::welcome("bob", 2), "*** bob joined the chat ***".to_string()]
        );
    }

    #[tokio::test]
    async fn test_tiny_queue_still_gets_welcome_and_join() {
        let hub = Hub::default();
        let (tiny, mut tiny_rx) = session("tiny", 1);

        assert_eq!(hub.register(Arc::clone(&tiny)), Ok(1));
        assert!(hub.is_registered(tiny.id()));
        assert_eq!(
            drain(&mut tiny_rx),
            vec![notice::welcome("tiny", 1), "*** tiny joined the chat ***".to_string()]
        );
    }

    #[tokio::test]
    async fn test_unwelcomed_session_is_not_announced() {
        let hub = Hub::default();
        let (alice, mut alice_rx) = session("alice", 16);
        hub.register(alice).unwrap();
        drain(&mut alice_rx);

        let (stuck, _stuck_rx) = session("stuck", 2);
        stuck.try_enqueue("backlog".into()).unwrap();
        stuck.try_enqueue("backlog".into()).unwrap();

        assert_eq!(
            hub.register(Arc::clone(&stuck)),
            Err(HubError::SessionClosed(stuck.username().clone()))
        );
        assert!(stuck.is_closed());
        assert!(!hub.is_username_taken("stuck"));
        assert_eq!(hub.len(), 1);
        assert!(drain(&mut alice_rx).is_empty());
    }

    #[tokio::test]
    async fn test_distinct_names_coexist_case_variants_do_not() {
        let hub = Hub::default();
        let (a, _a_rx) = session("alice", 16);
        let (b, _b_rx) = session("bob", 16);
        let (a2, _a2_rx) = session("ALICE", 16);

        assert!(hub.register(a).is_ok());
        assert!(hub.register(b).is_ok());
        assert!(matches!(hub.register(a2), Err(HubError::UsernameTaken(_))));
        assert_eq!(hub.len(), 2);
        assert!(hub.is_username_taken("Alice"));
        assert!(!hub.is_username_taken("carol"));
    }

    #[tokio::test]
    async fn test_capacity_limit() {
        let hub = Hub::new(1);
        let (a, _a_rx) = session("alice", 16);
        let (b, _b_rx) = session("bob", 16);

        assert!(hub.register(a).is_ok());
        assert_eq!(hub.register(b), Err(HubError::Full(1)));
    }

    #[tokio::test]
    async fn test_broadcast_reaches_every_member_in_order() {
        let hub = Hub::default();
        let mut receivers = Vec::new();
        for name in ["alice", "bob", "carol"] {
            let (s, rx) = session(name, 32);
            hub.register(s).unwrap();
            receivers.push(rx);
        }
        for rx in &mut receivers {
            drain(rx);
        }

        let first = hub.broadcast("alice: one");
        let second = hub.broadcast("bob: two");
        assert_eq!(first.delivered, 3);
        assert_eq!(second.delivered, 3);
        assert!(first.dropped.is_empty());

        for rx in &mut receivers {
            assert_eq!(drain(rx), vec!["alice: one", "bob: two"]);
        }
    }

    #[tokio::test]
    async fn test_full_queue_drops_member_without_leave_notice() {
        let hub = Hub::default();
        // welcome + own join fill a queue of two
        let (slow, mut slow_rx) = session("slow", 2);
        let (fast, mut fast_rx) = session("fast", 16);
        hub.register(Arc::clone(&slow)).unwrap();
        hub.register(Arc::clone(&fast)).unwrap();

        // "fast joined" could not be queued for slow
        assert!(!hub.is_registered(slow.id()));
        assert!(slow.is_closed());
        assert_eq!(hub.len(), 1);

        let report = hub.broadcast("fast: anyone there?");
        assert_eq!(report.delivered, 1);
        assert!(report.dropped.is_empty());

        assert_eq!(slow_rx.try_recv().unwrap().as_ref(), notice::welcome("slow", 1));
        assert_eq!(slow_rx.try_recv().unwrap().as_ref(), "*** slow joined the chat ***");
        assert!(slow_rx.try_recv().is_err());

        let fast_lines = drain(&mut fast_rx);
        assert!(!fast_lines.iter().any(|l| l.contains("left the chat")));
        assert_eq!(fast_lines.last().unwrap(), "fast: anyone there?");

        // a dropped session's later unregister is a no-op
        assert!(!hub.unregister(slow.id()));
    }

    #[tokio::test]
    async fn test_broadcast_report_names_dropped_members() {
        let hub = Hub::default();
        let (a, _a_rx) = session("alice", 3);
        hub.register(a).unwrap();

        hub.broadcast("x");
        let report = hub.broadcast("y");
        assert_eq!(report.delivered, 0);
        assert_eq!(report.dropped.len(), 1);
        assert_eq!(report.dropped[0].as_str(), "alice");
        assert!(hub.is_empty());
    }

    #[tokio::test]
    async fn test_unregister_is_idempotent() {
        let hub = Hub::default();
        let (alice, mut alice_rx) = session("alice", 16);
        let (bob, mut bob_rx) = session("bob", 16);
        hub.register(Arc::clone(&alice)).unwrap();
        hub.register(Arc::clone(&bob)).unwrap();
        drain(&mut alice_rx);
        drain(&mut bob_rx);

        assert!(hub.unregister(alice.id()));
        assert!(!hub.unregister(alice.id()));

        assert_eq!(drain(&mut bob_rx), vec!["*** alice left the chat ***"]);
        assert!(alice.is_closed());
        assert!(drain(&mut alice_rx).is_empty());

        hub.broadcast("bob: hello?");
        assert!(drain(&mut alice_rx).is_empty());
        let names: Vec<String> = hub
            .list_active()
            .into_iter()
            .map(|m| m.username.to_string())
            .collect();
        assert_eq!(names, vec!["bob"]);
    }

    #[tokio::test]
    async fn test_name_is_freed_after_unregister() {
        let hub = Hub::default();
        let (first, _rx1) = session("carol", 16);
        hub.register(Arc::clone(&first)).unwrap();
        hub.unregister(first.id());

        let (second, _rx2) = session("Carol", 16);
        assert!(hub.register(second).is_ok());

        // a closed session never re-enters the registry
        assert!(matches!(hub.register(first), Err(HubError::SessionClosed(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_list_active_reports_durations_oldest_first() {
        let hub = Hub::default();
        let (alice, _a_rx) = session("alice", 16);
        hub.register(alice).unwrap();

        tokio::time::advance(Duration::from_secs(65)).await;
        let (bob, _b_rx) = session("bob", 16);
        hub.register(bob).unwrap();
        tokio::time::advance(Duration::from_millis(3_600)).await;

        let active = hub.list_active();
        assert_eq!(active.len(), 2);
        assert_eq!(active[0].username.as_str(), "alice");
        assert_eq!(active[0].connected, Duration::from_secs(69));
        assert_eq!(active[1].username.as_str(), "bob");
        assert_eq!(active[1].connected, Duration::from_secs(4));

        tokio::time::advance(Duration::from_millis(300)).await;
        let active = hub.list_active();
        assert_eq!(active[0].connected, Duration::from_secs(69));
        assert_eq!(notice::format_duration(active[0].connected), "1m9s");
        assert_eq!(active[1].connected, Duration::from_secs(4));
    }

    #[tokio::test]
    async fn test_find_by_username_ignores_case() {
        let hub = Hub::default();
        let (bob, _rx) = session("Bob", 16);
        hub.register(Arc::clone(&bob)).unwrap();

        let found = hub.find_by_username("bOB").unwrap();
        assert_eq!(found.id(), bob.id());
        assert!(hub.find_by_username("ghost").is_none());
    }

    #[tokio::test]
    async fn test_send_to_unregistered_session_is_skipped() {
        let hub = Hub::default();
        let (ghost, mut rx) = session("ghost", 16);
        assert_eq!(hub.send_to(&ghost, "hello"), Delivery::NotRegistered);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_shutdown_closes_everyone_and_refuses_newcomers() {
        let hub = Hub::default();
        let (alice, _rx) = session("alice", 16);
        hub.register(Arc::clone(&alice)).unwrap();

        assert_eq!(hub.shutdown(), 1);
        assert!(alice.is_closed());
        assert!(hub.is_empty());

        let (bob, _rx) = session("bob", 16);
        assert_eq!(hub.register(bob), Err(HubError::ShuttingDown));
    }
}
