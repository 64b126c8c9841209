/// Signal routing between the supervisor and whichever job is active.
///
/// Every monitored signal is either forwarded to the registered target right
/// away or queued as pending until the next target registers. All state lives
/// behind one mutex so a routing decision never sees a half-updated table.
use nix::sys::signal::Signal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// The fixed set of signals the supervisor intercepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalKind {
    Hangup,
    Interrupt,
    Quit,
    Terminate,
    TerminalStop,
    Continue,
}

impl SignalKind {
    pub const ALL: [SignalKind; 6] = [
        SignalKind::Hangup,
        SignalKind::Interrupt,
        SignalKind::Quit,
        SignalKind::Terminate,
        SignalKind::TerminalStop,
        SignalKind::Continue,
    ];

    pub fn signal(self) -> Signal {
        match self {
            SignalKind::Hangup => Signal::SIGHUP,
            SignalKind::Interrupt => Signal::SIGINT,
            SignalKind::Quit => Signal::SIGQUIT,
            SignalKind::Terminate => Signal::SIGTERM,
            SignalKind::TerminalStop => Signal::SIGTSTP,
            SignalKind::Continue => Signal::SIGCONT,
        }
    }

    /// Raw platform signal number.
    pub fn number(self) -> i32 {
        self.signal() as i32
    }

    pub fn name(self) -> &'static str {
        match self {
            SignalKind::Hangup => "hangup",
            SignalKind::Interrupt => "interrupt",
            SignalKind::Quit => "quit",
            SignalKind::Terminate => "terminate",
            SignalKind::TerminalStop => "terminal_stop",
            SignalKind::Continue => "continue",
        }
    }

    /// Signals that ask the job to go away, as opposed to stop/continue.
    pub fn is_termination(self) -> bool {
        matches!(
            self,
            SignalKind::Hangup | SignalKind::Interrupt | SignalKind::Quit | SignalKind::Terminate
        )
    }

    /// Exit status a process reports when it dies from this signal.
    pub fn exit_code(self) -> i32 {
        128 + self.number()
    }

    fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for SignalKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Per-kind routing state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SignalState {
    #[default]
    Unseen,
    Pending,
    Handled,
}

/// A small set of [`SignalKind`]s, serialized as a list of names.
#[derive(Clone, Copy, Default, PartialEq, Eq)]
pub struct SignalSet(u8);

impl SignalSet {
    pub const fn empty() -> Self {
        Self(0)
    }

    /// hangup, interrupt, quit and terminate.
    pub fn termination() -> Self {
        SignalKind::ALL
            .into_iter()
            .filter(|kind| kind.is_termination())
            .collect()
    }

    pub fn insert(&mut self, kind: SignalKind) {
        self.0 |= 1 << kind.index();
    }

    pub fn contains(self, kind: SignalKind) -> bool {
        self.0 & (1 << kind.index()) != 0
    }

    pub fn intersects(self, other: SignalSet) -> bool {
        self.0 & other.0 != 0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn iter(self) -> impl Iterator<Item = SignalKind> {
        SignalKind::ALL
            .into_iter()
            .filter(move |kind| self.contains(*kind))
    }
}

impl FromIterator<SignalKind> for SignalSet {
    fn from_iter<I: IntoIterator<Item = SignalKind>>(iter: I) -> Self {
        let mut set = SignalSet::empty();
        for kind in iter {
            set.insert(kind);
        }
        set
    }
}

impl fmt::Display for SignalSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, kind) in self.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            f.write_str(kind.name())?;
        }
        Ok(())
    }
}

impl fmt::Debug for SignalSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}

impl Serialize for SignalSet {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(self.iter())
    }
}

impl<'de> Deserialize<'de> for SignalSet {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let kinds = Vec::<SignalKind>::deserialize(deserializer)?;
        Ok(kinds.into_iter().collect())
    }
}

/// Something the router can forward signals to: a running job, or a
/// blocking lock wait.
pub trait SignalTarget: Send + Sync {
    /// Short label for log lines (e.g. "job 4242").
    fn describe(&self) -> String;

    fn deliver(&self, kind: SignalKind) -> std::io::Result<()>;
}

/// What happened to a received signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Routing {
    Forwarded,
    Queued,
}

#[derive(Default)]
struct RouterState {
    table: [SignalState; 6],
    ever_handled: SignalSet,
    target: Option<Arc<dyn SignalTarget>>,
}

impl RouterState {
    fn deliver(&mut self, target: &dyn SignalTarget, kind: SignalKind) {
        if let Err(e) = target.deliver(kind) {
            tracing::warn!(
                signal = %kind,
                target = %target.describe(),
                error = %e,
                "failed to deliver signal"
            );
        }
        self.table[kind.index()] = SignalState::Handled;
        self.ever_handled.insert(kind);
    }
}

/// Process-wide signal table plus the currently registered target.
#[derive(Default)]
pub struct Router {
    state: Mutex<RouterState>,
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, RouterState> {
        // Delivery never panics while holding the lock, but a poisoned table
        // is still the best information we have.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Route one incoming signal: forward it if a target is registered,
    /// otherwise queue it for the next one.
    pub fn on_signal_received(&self, kind: SignalKind) -> Routing {
        let mut state = self.lock();
        match state.target.clone() {
            Some(target) => {
                state.deliver(target.as_ref(), kind);
                tracing::info!(signal = %kind, target = %target.describe(), "signal forwarded");
                Routing::Forwarded
            }
            None => {
                state.table[kind.index()] = SignalState::Pending;
                tracing::info!(signal = %kind, "signal queued, no active job");
                Routing::Queued
            }
        }
    }

    /// Install `target` as the active one and flush every pending signal
    /// into it. Returns the kinds that were flushed.
    pub fn register(&self, target: Arc<dyn SignalTarget>) -> SignalSet {
        let mut state = self.lock();
        let mut flushed = SignalSet::empty();
        for kind in SignalKind::ALL {
            if state.table[kind.index()] == SignalState::Pending {
                state.deliver(target.as_ref(), kind);
                flushed.insert(kind);
            }
        }
        if !flushed.is_empty() {
            tracing::info!(
                signals = %flushed,
                target = %target.describe(),
                "delivered pending signals"
            );
        }
        state.target = Some(target);
        flushed
    }

    /// Clear the active target; later signals queue again.
    pub fn deregister(&self) {
        self.lock().target = None;
    }

    #[cfg(test)]
    pub fn has_target(&self) -> bool {
        self.lock().target.is_some()
    }

    #[cfg(test)]
    pub fn state_of(&self, kind: SignalKind) -> SignalState {
        self.lock().table[kind.index()]
    }

    /// Kinds currently queued for the next job.
    pub fn pending(&self) -> SignalSet {
        let state = self.lock();
        SignalKind::ALL
            .into_iter()
            .filter(|kind| state.table[kind.index()] == SignalState::Pending)
            .collect()
    }

    /// Kinds forwarded to some target at least once in this process.
    pub fn handled(&self) -> SignalSet {
        self.lock().ever_handled
    }
}

/// Install handlers for every monitored signal and feed them into `router`.
///
/// Each signal stream pushes into one queue drained by a single task, so
/// routing happens strictly one signal at a time. Handlers are installed
/// before this returns; the returned task runs for the life of the runtime.
pub fn listen(router: Arc<Router>) -> std::io::Result<JoinHandle<()>> {
    use tokio::signal::unix::{signal, SignalKind as StreamKind};

    let mut streams = Vec::with_capacity(SignalKind::ALL.len());
    for kind in SignalKind::ALL {
        streams.push((kind, signal(StreamKind::from_raw(kind.number()))?));
    }

    let (tx, mut rx) = mpsc::unbounded_channel();
    for (kind, mut stream) in streams {
        let tx = tx.clone();
        tokio::spawn(async move {
            while stream.recv().await.is_some() {
                if tx.send(kind).is_err() {
                    break;
                }
            }
        });
    }
    drop(tx);

    Ok(tokio::spawn(async move {
        while let Some(kind) = rx.recv().await {
            tracing::debug!(signal = %kind, "signal received");
            router.on_signal_received(kind);
        }
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    /// Target that records everything delivered to it.
    #[derive(Default)]
    struct RecordingTarget {
        delivered: Mutex<Vec<SignalKind>>,
    }

    impl RecordingTarget {
        fn delivered(&self) -> Vec<SignalKind> {
            self.delivered.lock().unwrap().clone()
        }
    }

    impl SignalTarget for RecordingTarget {
        fn describe(&self) -> String {
            "recorder".to_string()
        }

        fn deliver(&self, kind: SignalKind) -> io::Result<()> {
            self.delivered.lock().unwrap().push(kind);
            Ok(())
        }
    }

    struct FailingTarget;

    impl SignalTarget for FailingTarget {
        fn describe(&self) -> String {
            "failing".to_string()
        }

        fn deliver(&self, _kind: SignalKind) -> io::Result<()> {
            Err(io::Error::from(nix::errno::Errno::ESRCH))
        }
    }

    #[test]
    fn test_signal_numbers_and_exit_codes() {
        assert_eq!(SignalKind::Hangup.number(), 1);
        assert_eq!(SignalKind::Interrupt.number(), 2);
        assert_eq!(SignalKind::Quit.number(), 3);
        assert_eq!(SignalKind::Terminate.number(), 15);
        assert_eq!(SignalKind::Interrupt.exit_code(), 130);
        assert_eq!(SignalKind::Terminate.exit_code(), 143);
    }

    #[test]
    fn test_termination_class() {
        let set = SignalSet::termination();
        assert!(set.contains(SignalKind::Hangup));
        assert!(set.contains(SignalKind::Terminate));
        assert!(!set.contains(SignalKind::TerminalStop));
        assert!(!set.contains(SignalKind::Continue));
        assert_eq!(set.to_string(), "hangup,interrupt,quit,terminate");
    }

    #[test]
    fn test_signal_set_serde() {
        let set: SignalSet = [SignalKind::Terminate, SignalKind::Interrupt]
            .into_iter()
            .collect();
        let json = serde_json::to_string(&set).unwrap();
        assert_eq!(json, r#"["interrupt","terminate"]"#);

        let back: SignalSet = serde_json::from_str(r#"["terminal_stop","continue"]"#).unwrap();
        assert!(back.contains(SignalKind::TerminalStop));
        assert!(back.contains(SignalKind::Continue));
        assert!(!back.intersects(SignalSet::termination()));
    }

    #[test]
    fn test_unknown_signal_name_rejected() {
        let result: Result<SignalSet, _> = serde_json::from_str(r#"["kill"]"#);
        assert!(result.is_err());
    }

    #[test]
    fn test_signal_queued_while_idle() {
        let router = Router::new();
        assert_eq!(router.state_of(SignalKind::Terminate), SignalState::Unseen);

        assert_eq!(
            router.on_signal_received(SignalKind::Terminate),
            Routing::Queued
        );
        assert_eq!(router.state_of(SignalKind::Terminate), SignalState::Pending);
        assert!(router.pending().contains(SignalKind::Terminate));
        assert!(router.handled().is_empty());
    }

    #[test]
    fn test_register_flushes_pending() {
        let router = Router::new();
        router.on_signal_received(SignalKind::Hangup);
        router.on_signal_received(SignalKind::Terminate);

        let target = Arc::new(RecordingTarget::default());
        let flushed = router.register(target.clone());

        assert_eq!(
            target.delivered(),
            vec![SignalKind::Hangup, SignalKind::Terminate]
        );
        assert_eq!(flushed.to_string(), "hangup,terminate");
        assert!(router.pending().is_empty());
        assert_eq!(router.state_of(SignalKind::Hangup), SignalState::Handled);
        assert_eq!(router.handled(), flushed);
        // Untouched kinds stay unseen
        assert_eq!(router.state_of(SignalKind::Quit), SignalState::Unseen);
    }

    #[test]
    fn test_register_with_nothing_pending() {
        let router = Router::new();
        let target = Arc::new(RecordingTarget::default());
        assert!(router.register(target.clone()).is_empty());
        assert!(target.delivered().is_empty());
        assert!(router.has_target());
    }

    #[test]
    fn test_signal_forwarded_while_registered() {
        let router = Router::new();
        let target = Arc::new(RecordingTarget::default());
        router.register(target.clone());

        assert_eq!(
            router.on_signal_received(SignalKind::Interrupt),
            Routing::Forwarded
        );
        assert_eq!(target.delivered(), vec![SignalKind::Interrupt]);
        assert_eq!(
            router.state_of(SignalKind::Interrupt),
            SignalState::Handled
        );
        assert!(router.handled().contains(SignalKind::Interrupt));
    }

    #[test]
    fn test_deregister_queues_again() {
        let router = Router::new();
        let first = Arc::new(RecordingTarget::default());
        router.register(first.clone());
        router.on_signal_received(SignalKind::Interrupt);
        router.deregister();
        assert!(!router.has_target());

        assert_eq!(
            router.on_signal_received(SignalKind::Interrupt),
            Routing::Queued
        );
        assert_eq!(
            router.state_of(SignalKind::Interrupt),
            SignalState::Pending
        );
        // Handled history survives the transition back to pending
        assert!(router.handled().contains(SignalKind::Interrupt));

        let second = Arc::new(RecordingTarget::default());
        router.register(second.clone());
        assert_eq!(first.delivered(), vec![SignalKind::Interrupt]);
        assert_eq!(second.delivered(), vec![SignalKind::Interrupt]);
    }

    #[test]
    fn test_failed_delivery_still_marks_handled() {
        let router = Router::new();
        router.register(Arc::new(FailingTarget));
        assert_eq!(
            router.on_signal_received(SignalKind::Quit),
            Routing::Forwarded
        );
        assert_eq!(router.state_of(SignalKind::Quit), SignalState::Handled);
    }

    #[test]
    fn test_no_signal_lost_under_concurrent_routing() {
        let router = Arc::new(Router::new());
        let target = Arc::new(RecordingTarget::default());

        let senders: Vec<_> = SignalKind::ALL
            .into_iter()
            .map(|kind| {
                let router = Arc::clone(&router);
                std::thread::spawn(move || {
                    for _ in 0..200 {
                        router.on_signal_received(kind);
                    }
                })
            })
            .collect();

        for _ in 0..200 {
            router.register(target.clone());
            router.deregister();
        }
        for sender in senders {
            sender.join().unwrap();
        }

        for kind in SignalKind::ALL {
            assert_ne!(router.state_of(kind), SignalState::Unseen, "{kind} lost");
        }

        // A final registration drains everything still queued
        let last = Arc::new(RecordingTarget::default());
        let flushed = router.register(last.clone());
        assert_eq!(last.delivered().len(), flushed.iter().count());
        assert!(router.pending().is_empty());
    }
}
