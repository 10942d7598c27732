//! Single-threaded readiness event loop.
//!
//! # Responsibilities
//! - Own every registered I/O handler and its poll registration
//! - Dispatch read/write readiness to handlers on one thread
//! - Enforce handler deadlines alongside readiness polling
//! - Accept registrations and stop requests from any thread
//!
//! # Design Decisions
//! - Polling is edge-triggered (mio); handlers drain until `WouldBlock`
//! - A handler that is registered or replaced gets one synthetic readiness
//!   pass so bytes already queued in the kernel are never stranded
//! - Handler errors and panics close that handler only
//! - Every poll is bounded by `poll_interval`, so `stop()` is observed
//!   within one iteration even with no sockets registered

use std::collections::HashMap;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use mio::event::Source;
use mio::{Events, Interest, Poll, Token, Waker};
use thiserror::Error;
use tracing::{debug, error, info, trace, warn};

use crate::config::ReactorConfig;

const WAKE_TOKEN: Token = Token(0);

// Bounds replace-then-kick chains within a single iteration.
const MAX_KICK_ROUNDS: usize = 8;

/// Identifier of a registered handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(usize);

impl HandlerId {
    fn token(self) -> Token {
        Token(self.0)
    }
}

impl std::fmt::Display for HandlerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "h-{}", self.0)
    }
}

/// Errors returned by handler callbacks.
#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("TLS error: {0}")]
    Tls(#[from] rustls::Error),

    #[error("connection rejected: {0}")]
    Rejected(String),
}

/// Errors returned by the reactor itself.
#[derive(Debug, Error)]
pub enum ReactorError {
    #[error("reactor is stopped")]
    Stopped,

    #[error("reactor I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("reactor thread panicked")]
    Panicked,
}

/// What the reactor should do with a handler after a callback.
pub enum Status {
    /// Keep the handler registered, re-arming its interest.
    Continue,
    /// Deregister and drop the handler.
    Close,
    /// Swap in a new handler that owns the same socket.
    Replace(Box<dyn Handler>),
}

impl std::fmt::Debug for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Status::Continue => f.write_str("Continue"),
            Status::Close => f.write_str("Close"),
            Status::Replace(next) => write!(f, "Replace({})", next.name()),
        }
    }
}

/// An I/O handler driven by the reactor.
///
/// All callbacks run on the reactor thread and must never block.
pub trait Handler: Send {
    /// Short name used in log lines.
    fn name(&self) -> &'static str;

    /// The socket this handler is registered with.
    fn source(&mut self) -> &mut dyn Source;

    fn wants_read(&self) -> bool {
        true
    }

    fn wants_write(&self) -> bool {
        false
    }

    fn on_readable(&mut self, cx: &mut Context<'_>) -> Result<Status, HandlerError>;

    fn on_writable(&mut self, _cx: &mut Context<'_>) -> Result<Status, HandlerError> {
        Ok(Status::Continue)
    }

    /// Called when a callback failed, just before the handler is closed.
    fn on_error(&mut self, _error: &HandlerError) {}

    /// Called once when the handler leaves the reactor.
    fn on_close(&mut self) {}

    /// Instant after which the handler is timed out and closed.
    fn deadline(&self) -> Option<Instant> {
        None
    }

    fn on_timeout(&mut self) {}
}

/// Source left behind by a handler whose socket moved to another owner.
///
/// Registration fails; deregistration is a no-op.
#[derive(Debug, Default)]
pub struct Detached;

impl Source for Detached {
    fn register(&mut self, _: &mio::Registry, _: Token, _: Interest) -> io::Result<()> {
        Err(io::ErrorKind::NotConnected.into())
    }

    fn reregister(&mut self, _: &mio::Registry, _: Token, _: Interest) -> io::Result<()> {
        Err(io::ErrorKind::NotConnected.into())
    }

    fn deregister(&mut self, _: &mio::Registry) -> io::Result<()> {
        Ok(())
    }
}

/// Per-dispatch context handed to handler callbacks.
pub struct Context<'a> {
    id: HandlerId,
    spawned: &'a mut Vec<Box<dyn Handler>>,
    handle: &'a ReactorHandle,
}

impl Context<'_> {
    /// Id of the handler being dispatched.
    pub fn id(&self) -> HandlerId {
        self.id
    }

    /// Register a new handler once the current callback returns.
    pub fn register(&mut self, handler: Box<dyn Handler>) {
        self.spawned.push(handler);
    }

    /// Cross-thread handle of the running reactor.
    pub fn handle(&self) -> &ReactorHandle {
        self.handle
    }
}

enum Command {
    Register(HandlerId, Box<dyn Handler>),
    Unregister(HandlerId),
}

#[derive(Debug)]
struct Shared {
    sender: Sender<Command>,
    waker: Waker,
    stopped: AtomicBool,
    next_id: AtomicUsize,
}

impl std::fmt::Debug for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Command::Register(id, handler) => write!(f, "Register({}, {})", id, handler.name()),
            Command::Unregister(id) => write!(f, "Unregister({})", id),
        }
    }
}

/// Thread-safe handle used to register handlers and stop the reactor.
#[derive(Debug, Clone)]
pub struct ReactorHandle {
    shared: Arc<Shared>,
}

impl ReactorHandle {
    /// Register a handler from any thread.
    pub fn register(&self, handler: Box<dyn Handler>) -> Result<HandlerId, ReactorError> {
        if self.is_stopped() {
            return Err(ReactorError::Stopped);
        }
        let id = self.next_id();
        self.send(Command::Register(id, handler))?;
        Ok(id)
    }

    /// Remove a handler from any thread. Unknown ids are ignored.
    pub fn unregister(&self, id: HandlerId) -> Result<(), ReactorError> {
        if self.is_stopped() {
            return Err(ReactorError::Stopped);
        }
        self.send(Command::Unregister(id))
    }

    /// Ask the reactor to exit. Idempotent.
    pub fn stop(&self) {
        if !self.shared.stopped.swap(true, Ordering::SeqCst) {
            info!("Reactor stop requested");
        }
        if let Err(e) = self.shared.waker.wake() {
            debug!(error = %e, "Failed to wake reactor");
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.shared.stopped.load(Ordering::SeqCst)
    }

    fn next_id(&self) -> HandlerId {
        HandlerId(self.shared.next_id.fetch_add(1, Ordering::Relaxed))
    }

    fn send(&self, command: Command) -> Result<(), ReactorError> {
        self.shared
            .sender
            .send(command)
            .map_err(|_| ReactorError::Stopped)?;
        self.shared.waker.wake()?;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
struct Readiness {
    readable: bool,
    writable: bool,
}

struct Entry {
    handler: Box<dyn Handler>,
    interest: Interest,
}

fn interest_of(handler: &dyn Handler) -> Interest {
    match (handler.wants_read(), handler.wants_write()) {
        (true, true) => Interest::READABLE | Interest::WRITABLE,
        (false, true) => Interest::WRITABLE,
        // mio has no empty interest; readable still reports hangups.
        (_, false) => Interest::READABLE,
    }
}

/// The event loop.
pub struct Reactor {
    poll: Poll,
    receiver: Receiver<Command>,
    handle: ReactorHandle,
    handlers: HashMap<Token, Entry>,
    kicks: Vec<Token>,
    config: ReactorConfig,
}

impl Reactor {
    /// Create a reactor. Nothing runs until `run` or `spawn`.
    pub fn new(config: &ReactorConfig) -> Result<Self, ReactorError> {
        let poll = Poll::new()?;
        let waker = Waker::new(poll.registry(), WAKE_TOKEN)?;
        let (sender, receiver) = mpsc::channel();

        let handle = ReactorHandle {
            shared: Arc::new(Shared {
                sender,
                waker,
                stopped: AtomicBool::new(false),
                next_id: AtomicUsize::new(WAKE_TOKEN.0 + 1),
            }),
        };

        Ok(Self {
            poll,
            receiver,
            handle,
            handlers: HashMap::new(),
            kicks: Vec::new(),
            config: config.clone(),
        })
    }

    pub fn handle(&self) -> ReactorHandle {
        self.handle.clone()
    }

    /// Run the loop on a dedicated thread.
    pub fn spawn(self) -> Result<ReactorThread, ReactorError> {
        let handle = self.handle();
        let join = thread::Builder::new()
            .name("reactor".to_string())
            .spawn(move || self.run())?;

        Ok(ReactorThread {
            handle,
            join: Some(join),
        })
    }

    /// Drive readiness dispatch until `stop()` is requested.
    pub fn run(mut self) -> Result<(), ReactorError> {
        let mut events = Events::with_capacity(self.config.events_capacity.max(1));
        info!(
            poll_interval_ms = self.config.poll_interval_ms,
            "Reactor running"
        );

        let result = loop {
            if self.handle.is_stopped() {
                break Ok(());
            }

            self.process_commands();
            self.run_kicks();

            let timeout = self.next_timeout();
            if let Err(e) = self.poll.poll(&mut events, Some(timeout)) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                error!(error = %e, "Poll failed");
                break Err(ReactorError::Io(e));
            }

            for event in events.iter() {
                let token = event.token();
                if token == WAKE_TOKEN {
                    continue;
                }
                let readiness = Readiness {
                    readable: event.is_readable() || event.is_read_closed() || event.is_error(),
                    writable: event.is_writable() || event.is_write_closed(),
                };
                self.dispatch(token, readiness);
            }

            self.run_kicks();
            self.expire_deadlines(Instant::now());
        };

        self.handle.shared.stopped.store(true, Ordering::SeqCst);
        self.shutdown();
        result
    }

    fn process_commands(&mut self) {
        while let Ok(command) = self.receiver.try_recv() {
            match command {
                Command::Register(id, handler) => self.insert(id, handler),
                Command::Unregister(id) => match self.handlers.remove(&id.token()) {
                    Some(entry) => {
                        debug!(handler = entry.handler.name(), id = %id, "Unregistering handler");
                        self.close_entry(id.token(), entry);
                    }
                    None => trace!(id = %id, "Unregister of unknown handler ignored"),
                },
            }
        }
    }

    fn insert(&mut self, id: HandlerId, mut handler: Box<dyn Handler>) {
        let token = id.token();
        let interest = interest_of(&*handler);
        match self
            .poll
            .registry()
            .register(handler.source(), token, interest)
        {
            Ok(()) => {
                trace!(handler = handler.name(), id = %id, "Handler registered");
                self.handlers.insert(token, Entry { handler, interest });
                self.kicks.push(token);
            }
            Err(e) => {
                warn!(handler = handler.name(), id = %id, error = %e, "Failed to register handler");
                handler.on_close();
            }
        }
    }

    fn dispatch(&mut self, token: Token, readiness: Readiness) {
        // Events can still arrive for a handler closed earlier in the batch.
        let Some(mut entry) = self.handlers.remove(&token) else {
            return;
        };

        let id = HandlerId(token.0);
        let mut spawned = Vec::new();
        let outcome = {
            let handle = &self.handle;
            let handler = &mut entry.handler;
            let spawned = &mut spawned;
            panic::catch_unwind(AssertUnwindSafe(move || -> Result<Status, HandlerError> {
                let mut cx = Context {
                    id,
                    spawned,
                    handle,
                };
                let mut status = Status::Continue;
                if readiness.readable {
                    status = handler.on_readable(&mut cx)?;
                }
                if readiness.writable && matches!(status, Status::Continue) {
                    status = handler.on_writable(&mut cx)?;
                }
                Ok(status)
            }))
        };

        for handler in spawned {
            let new_id = self.handle.next_id();
            self.insert(new_id, handler);
        }

        match outcome {
            Ok(Ok(Status::Continue)) => self.rearm(token, entry),
            Ok(Ok(Status::Close)) => {
                trace!(handler = entry.handler.name(), id = %id, "Handler closed");
                self.close_entry(token, entry);
            }
            Ok(Ok(Status::Replace(next))) => {
                debug!(from = entry.handler.name(), to = next.name(), id = %id, "Handler replaced");
                // The old handler already gave its socket to `next`.
                drop(entry);
                self.replace(token, next);
            }
            Ok(Err(e)) => {
                warn!(handler = entry.handler.name(), id = %id, error = %e, "Handler failed, closing");
                entry.handler.on_error(&e);
                self.close_entry(token, entry);
            }
            Err(payload) => {
                let message = payload
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| payload.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                error!(handler = entry.handler.name(), id = %id, panic = %message, "Handler panicked, closing");
                if let Err(e) = self.poll.registry().deregister(entry.handler.source()) {
                    debug!(id = %id, error = %e, "Deregister after panic failed");
                }
            }
        }
    }

    fn rearm(&mut self, token: Token, mut entry: Entry) {
        let interest = interest_of(&*entry.handler);
        if interest != entry.interest {
            if let Err(e) = self
                .poll
                .registry()
                .reregister(entry.handler.source(), token, interest)
            {
                warn!(handler = entry.handler.name(), error = %e, "Failed to re-arm handler");
                self.close_entry(token, entry);
                return;
            }
            entry.interest = interest;
        }
        self.handlers.insert(token, entry);
    }

    fn replace(&mut self, token: Token, mut handler: Box<dyn Handler>) {
        let interest = interest_of(&*handler);
        match self
            .poll
            .registry()
            .reregister(handler.source(), token, interest)
        {
            Ok(()) => {
                self.handlers.insert(token, Entry { handler, interest });
                self.kicks.push(token);
            }
            Err(e) => {
                warn!(handler = handler.name(), error = %e, "Failed to register replacement handler");
                let _ = self.poll.registry().deregister(handler.source());
                handler.on_close();
            }
        }
    }

    fn close_entry(&mut self, token: Token, mut entry: Entry) {
        if let Err(e) = self.poll.registry().deregister(entry.handler.source()) {
            debug!(handler = entry.handler.name(), token = token.0, error = %e, "Deregister failed");
        }
        entry.handler.on_close();
    }

    fn run_kicks(&mut self) {
        for _ in 0..MAX_KICK_ROUNDS {
            if self.kicks.is_empty() {
                return;
            }
            let kicks = std::mem::take(&mut self.kicks);
            for token in kicks {
                let Some(entry) = self.handlers.get(&token) else {
                    continue;
                };
                let readiness = Readiness {
                    readable: entry.handler.wants_read(),
                    writable: entry.handler.wants_write(),
                };
                if readiness.readable || readiness.writable {
                    self.dispatch(token, readiness);
                }
            }
        }
    }

    fn next_timeout(&self) -> Duration {
        if !self.kicks.is_empty() {
            return Duration::ZERO;
        }
        let now = Instant::now();
        self.handlers
            .values()
            .filter_map(|entry| entry.handler.deadline())
            .map(|deadline| deadline.saturating_duration_since(now))
            .fold(self.config.poll_interval(), Duration::min)
    }

    fn expire_deadlines(&mut self, now: Instant) {
        let expired: Vec<Token> = self
            .handlers
            .iter()
            .filter(|(_, entry)| entry.handler.deadline().is_some_and(|d| d <= now))
            .map(|(token, _)| *token)
            .collect();

        for token in expired {
            let Some(mut entry) = self.handlers.remove(&token) else {
                continue;
            };
            debug!(handler = entry.handler.name(), token = token.0, "Handler deadline passed");
            let handler = &mut entry.handler;
            if panic::catch_unwind(AssertUnwindSafe(|| handler.on_timeout())).is_err() {
                error!(handler = entry.handler.name(), "Handler panicked in timeout callback");
            }
            self.close_entry(token, entry);
        }
    }

    fn shutdown(&mut self) {
        let entries: Vec<(Token, Entry)> = self.handlers.drain().collect();
        let closed = entries.len();
        for (token, entry) in entries {
            self.close_entry(token, entry);
        }

        // Registrations that raced with stop never reached the poller.
        while let Ok(command) = self.receiver.try_recv() {
            if let Command::Register(_, mut handler) = command {
                handler.on_close();
            }
        }

        info!(closed_handlers = closed, "Reactor stopped");
    }
}

/// A reactor running on its own thread.
#[derive(Debug)]
pub struct ReactorThread {
    handle: ReactorHandle,
    join: Option<JoinHandle<Result<(), ReactorError>>>,
}

impl ReactorThread {
    pub fn handle(&self) -> &ReactorHandle {
        &self.handle
    }

    /// Request the loop to exit. Idempotent.
    pub fn stop(&self) {
        self.handle.stop();
    }

    /// Wait for the loop thread to finish.
    pub fn join(mut self) -> Result<(), ReactorError> {
        match self.join.take() {
            Some(join) => join.join().map_err(|_| ReactorError::Panicked)?,
            None => Ok(()),
        }
    }
}

impl Drop for ReactorThread {
    fn drop(&mut self) {
        if let Some(join) = self.join.take() {
            self.handle.stop();
            let _ = join.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mio::net::TcpListener;

    fn test_config() -> ReactorConfig {
        ReactorConfig {
            poll_interval_ms: 20,
            events_capacity: 16,
        }
    }

    fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        false
    }

    #[derive(Clone, Copy)]
    enum Behavior {
        Fail,
        Panic,
        Idle,
        Expire,
    }

    struct ScriptedHandler {
        listener: TcpListener,
        behavior: Behavior,
        reads: Arc<AtomicUsize>,
        closed: Arc<AtomicBool>,
        timed_out: Arc<AtomicBool>,
        deadline: Option<Instant>,
    }

    impl ScriptedHandler {
        fn new(behavior: Behavior) -> (Self, Arc<AtomicUsize>, Arc<AtomicBool>, Arc<AtomicBool>) {
            let listener = TcpListener::bind("127.0.0.1:0".parse().unwrap()).unwrap();
            let reads = Arc::new(AtomicUsize::new(0));
            let closed = Arc::new(AtomicBool::new(false));
            let timed_out = Arc::new(AtomicBool::new(false));
            let deadline = match behavior {
                Behavior::Expire => Some(Instant::now() + Duration::from_millis(50)),
                _ => None,
            };
            let handler = Self {
                listener,
                behavior,
                reads: reads.clone(),
                closed: closed.clone(),
                timed_out: timed_out.clone(),
                deadline,
            };
            (handler, reads, closed, timed_out)
        }
    }

    impl Handler for ScriptedHandler {
        fn name(&self) -> &'static str {
            "scripted"
        }

        fn source(&mut self) -> &mut dyn Source {
            &mut self.listener
        }

        fn on_readable(&mut self, _cx: &mut Context<'_>) -> Result<Status, HandlerError> {
            self.reads.fetch_add(1, Ordering::SeqCst);
            match self.behavior {
                Behavior::Fail => Err(HandlerError::Rejected("scripted failure".to_string())),
                Behavior::Panic => panic!("scripted panic"),
                Behavior::Idle | Behavior::Expire => Ok(Status::Continue),
            }
        }

        fn on_close(&mut self) {
            self.closed.store(true, Ordering::SeqCst);
        }

        fn deadline(&self) -> Option<Instant> {
            self.deadline
        }

        fn on_timeout(&mut self) {
            self.timed_out.store(true, Ordering::SeqCst);
        }
    }

    #[test]
    fn stop_is_idempotent_and_thread_joins() {
        let reactor = Reactor::new(&test_config()).unwrap();
        let thread = reactor.spawn().unwrap();

        thread.stop();
        thread.stop();
        assert!(thread.handle().is_stopped());
        assert!(thread.join().is_ok());
    }

    #[test]
    fn stop_before_run_returns_immediately() {
        let reactor = Reactor::new(&test_config()).unwrap();
        reactor.handle().stop();
        assert!(reactor.run().is_ok());
    }

    #[test]
    fn failing_and_panicking_handlers_do_not_stop_the_loop() {
        let reactor = Reactor::new(&test_config()).unwrap();
        let handle = reactor.handle();
        let thread = reactor.spawn().unwrap();

        let (failing, _, failing_closed, _) = ScriptedHandler::new(Behavior::Fail);
        handle.register(Box::new(failing)).unwrap();
        assert!(wait_until(|| failing_closed.load(Ordering::SeqCst)));

        let (panicking, panic_reads, _, _) = ScriptedHandler::new(Behavior::Panic);
        handle.register(Box::new(panicking)).unwrap();
        assert!(wait_until(|| panic_reads.load(Ordering::SeqCst) == 1));

        let (idle, idle_reads, idle_closed, _) = ScriptedHandler::new(Behavior::Idle);
        handle.register(Box::new(idle)).unwrap();
        assert!(wait_until(|| idle_reads.load(Ordering::SeqCst) >= 1));
        assert!(!idle_closed.load(Ordering::SeqCst));

        thread.stop();
        thread.join().unwrap();
        assert!(idle_closed.load(Ordering::SeqCst), "shutdown closes remaining handlers");
    }

    #[test]
    fn expired_handler_is_timed_out_and_closed() {
        let reactor = Reactor::new(&test_config()).unwrap();
        let handle = reactor.handle();
        let thread = reactor.spawn().unwrap();

        let (expiring, _, closed, timed_out) = ScriptedHandler::new(Behavior::Expire);
        handle.register(Box::new(expiring)).unwrap();

        assert!(wait_until(|| closed.load(Ordering::SeqCst)));
        assert!(timed_out.load(Ordering::SeqCst));

        thread.stop();
        thread.join().unwrap();
    }

    #[test]
    fn unregister_closes_handler() {
        let reactor = Reactor::new(&test_config()).unwrap();
        let handle = reactor.handle();
        let thread = reactor.spawn().unwrap();

        let (idle, reads, closed, _) = ScriptedHandler::new(Behavior::Idle);
        let id = handle.register(Box::new(idle)).unwrap();
        assert!(wait_until(|| reads.load(Ordering::SeqCst) >= 1));

        handle.unregister(id).unwrap();
        assert!(wait_until(|| closed.load(Ordering::SeqCst)));

        thread.stop();
        thread.join().unwrap();
    }

    #[test]
    fn register_after_stop_is_refused() {
        let reactor = Reactor::new(&test_config()).unwrap();
        let handle = reactor.handle();
        let thread = reactor.spawn().unwrap();
        thread.stop();
        thread.join().unwrap();

        let (idle, _, _, _) = ScriptedHandler::new(Behavior::Idle);
        assert!(matches!(
            handle.register(Box::new(idle)),
            Err(ReactorError::Stopped)
        ));
    }
}
