//! Monitoring the metadata pipe.
//!
//! The [`Monitor`] owns a reader thread that feeds the pipe line by line to
//! a [`Reader`], and a state machine that follows what the stream signals.
//! Callers observe the monitor through two callbacks: one for every
//! dispatched metadata bundle and one for every actual state change.
//!
//! A paused or stopped session moves to [`PlaybackState::Waiting`] when the
//! pipe stays quiet for the configured wait timeout.
//!
//! # Threads
//!
//! Callbacks run on the reader thread, or on a timer thread for the waiting
//! transition, and never while the monitor holds its internal lock. They may
//! call back into the monitor.
//!
//! Callbacks are delivered one at a time, in the order the changes were
//! made. While one thread is delivering, changes made by other threads are
//! queued and delivered by that thread.
//!
//! # Example
//!
//! ```no_run
//! use nowplaying::{config::Config, monitor::{Callbacks, Monitor}};
//!
//! let callbacks = Callbacks::new(
//!     |bundle| println!("now playing: {:?}", bundle.get("title")),
//!     |state| println!("state: {state}"),
//! );
//!
//! let mut monitor = Monitor::new(Config::default(), callbacks);
//! monitor.start()?;
//! // ...
//! monitor.stop();
//! # Ok::<(), nowplaying::error::Error>(())
//! ```

use std::{
    collections::VecDeque,
    path::Path,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use crate::{
    bundle::Bundle,
    capture::CaptureSink,
    config::Config,
    error::{Error, Result},
    events::Event,
    pipe::{Closer, Pipe},
    reader::{Handler, Reader},
    scheduler::{Scheduler, TaskHandle, ThreadScheduler},
    state::{PlaybackState, StateMachine},
};

pub type MetadataCallback = Box<dyn Fn(&Bundle) + Send + Sync>;
pub type StateCallback = Box<dyn Fn(PlaybackState) + Send + Sync>;

/// How often `stop()` checks whether the reader thread has exited.
const JOIN_POLL_INTERVAL: Duration = Duration::from_millis(5);

pub struct Callbacks {
    metadata: MetadataCallback,
    state: StateCallback,
}

impl Callbacks {
    pub fn new<M, S>(metadata: M, state: S) -> Self
    where
        M: Fn(&Bundle) + Send + Sync + 'static,
        S: Fn(PlaybackState) + Send + Sync + 'static,
    {
        Self {
            metadata: Box::new(metadata),
            state: Box::new(state),
        }
    }

    /// Callbacks that log what is published.
    #[must_use]
    pub fn logging() -> Self {
        Self::new(
            |bundle| info!("published metadata: {bundle}"),
            |state| info!("published state: {state}"),
        )
    }
}

impl Default for Callbacks {
    fn default() -> Self {
        Self::logging()
    }
}

/// What the reader extracted from a line.
enum Extracted {
    Bundle(Bundle),
    StateRequest(PlaybackState),
}

/// Collects what the reader extracts while the monitor lock is held.
#[derive(Default)]
struct Outbox(Vec<Extracted>);

impl Handler for Outbox {
    fn on_metadata(&mut self, bundle: Bundle) {
        self.0.push(Extracted::Bundle(bundle));
    }

    fn on_state_request(&mut self, state: PlaybackState) {
        self.0.push(Extracted::StateRequest(state));
    }
}

/// A callback to deliver once the lock is released.
enum Notice {
    Metadata(Bundle),
    State(PlaybackState),
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum Mode {
    Validated,
    Forced,
}

struct Core {
    machine: StateMachine,
    reader: Reader<Outbox>,
    capture: Option<Box<dyn CaptureSink>>,

    /// Deferred transition to waiting, if armed.
    timer: Option<TaskHandle>,
    /// Identifies the armed timer, so that a timer that fires while being
    /// replaced does nothing.
    timer_generation: u64,

    first_data: bool,
}

impl Core {
    fn cancel_timer(&mut self) {
        if let Some(mut timer) = self.timer.take() {
            timer.cancel();
        }
    }

    fn capture_event(&mut self, event: &Event) {
        if let Some(capture) = self.capture.as_mut() {
            capture.event(event);
        }
    }
}

/// Notices waiting for delivery, in the order they were queued.
#[derive(Default)]
struct Delivery {
    queue: VecDeque<Notice>,
    /// Whether some thread is delivering the queue.
    draining: bool,
}

struct Shared {
    core: Mutex<Core>,
    delivery: Mutex<Delivery>,
    callbacks: Callbacks,
    scheduler: Arc<dyn Scheduler>,
    wait_timeout: Duration,
    poll_interval: Duration,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Core> {
        // Callbacks never run under the lock, so a poisoned lock only means a
        // bug in this module. The state it protects is still consistent.
        self.core.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Runs `f` under the lock, then delivers the notices it collected.
    fn locked<R>(&self, f: impl FnOnce(&mut Core, &mut Vec<Notice>) -> R) -> R {
        let mut notices = Vec::new();
        let (result, drain) = {
            let mut core = self.lock();
            let result = f(&mut *core, &mut notices);

            // Queued before the lock is released, so the queue follows the
            // order of the changes.
            let mut delivery = self.delivery.lock().unwrap_or_else(PoisonError::into_inner);
            delivery.queue.extend(notices);
            let drain = !delivery.draining && !delivery.queue.is_empty();
            if drain {
                delivery.draining = true;
            }
            (result, drain)
        };

        if drain {
            self.drain();
        }
        result
    }

    fn drain(&self) {
        loop {
            let notice = {
                let mut delivery = self.delivery.lock().unwrap_or_else(PoisonError::into_inner);
                match delivery.queue.pop_front() {
                    Some(notice) => notice,
                    None => {
                        delivery.draining = false;
                        return;
                    }
                }
            };

            match notice {
                Notice::Metadata(bundle) => (self.callbacks.metadata)(&bundle),
                Notice::State(state) => (self.callbacks.state)(state),
            }
        }
    }

    /// Validated transition from outside a critical section.
    fn transition(self: &Arc<Self>, target: PlaybackState, reason: &str) {
        self.locked(|core, notices| {
            self.apply(core, target, reason, Mode::Validated, notices);
        });
    }

    /// The single routine through which every state change goes.
    fn apply(
        self: &Arc<Self>,
        core: &mut Core,
        target: PlaybackState,
        reason: &str,
        mode: Mode,
        notices: &mut Vec<Notice>,
    ) -> bool {
        core.cancel_timer();

        let from = core.machine.current();
        if from != target {
            core.capture_event(&Event::StateChange {
                from,
                to: target,
                reason: reason.to_owned(),
            });
        }

        let accepted = match mode {
            Mode::Validated => core.machine.transition_to(target, reason),
            Mode::Forced => {
                core.machine.force_transition(target, reason);
                true
            }
        };

        if !accepted {
            return false;
        }

        if core.machine.current() != from {
            notices.push(Notice::State(target));

            if target == PlaybackState::NoSession {
                info!("clearing metadata for session end");
                core.reader.clear_fields();
                notices.push(Notice::Metadata(Bundle::session_end()));
            }
        }

        if matches!(target, PlaybackState::Paused | PlaybackState::Stopped) {
            self.arm_waiting_timer(core);
        }

        true
    }

    fn arm_waiting_timer(self: &Arc<Self>, core: &mut Core) {
        core.timer_generation = core.timer_generation.wrapping_add(1);
        let generation = core.timer_generation;

        let shared = Arc::downgrade(self);
        let timer = self.scheduler.schedule(
            self.wait_timeout,
            Box::new(move || {
                if let Some(shared) = shared.upgrade() {
                    shared.on_wait_timeout(generation);
                }
            }),
        );

        core.timer = Some(timer);
    }

    fn on_wait_timeout(self: &Arc<Self>, generation: u64) {
        self.locked(|core, notices| {
            if core.timer.is_none() || core.timer_generation != generation {
                trace!("ignoring stale waiting timer");
                return;
            }

            core.timer = None;
            self.apply(core, PlaybackState::Waiting, "timeout", Mode::Validated, notices);
        });
    }

    /// Processes one line. Lines from the pipe are `live`: they are captured
    /// and the first one starts playback.
    fn handle_line(self: &Arc<Self>, line: &str, live: bool) {
        self.locked(|core, notices| {
            if live && !core.first_data {
                core.first_data = true;
                // Whatever the line holds, data flowing means playback.
                let mode = if core.machine.can_transition_to(PlaybackState::Playing) {
                    Mode::Validated
                } else {
                    Mode::Forced
                };
                self.apply(core, PlaybackState::Playing, "first data received", mode, notices);
            }

            core.cancel_timer();

            if live {
                if let Some(capture) = core.capture.as_mut() {
                    capture.line(line);
                }
            }

            core.reader.process_line(line);

            let extracted = std::mem::take(&mut core.reader.handler_mut().0);
            for item in extracted {
                match item {
                    Extracted::Bundle(bundle) => notices.push(Notice::Metadata(bundle)),
                    Extracted::StateRequest(state) => {
                        self.apply(core, state, "metadata event", Mode::Validated, notices);
                    }
                }
            }
        });
    }

    fn run(self: &Arc<Self>, path: &Path, control: &Control) {
        info!("reader thread started");

        let mut pipe = match Pipe::open(path) {
            Ok(pipe) => pipe,
            Err(e) => {
                warn!("failed to open {}: {e}", path.display());
                info!("reader thread exited");
                return;
            }
        };

        control.set_closer(Some(pipe.closer()));
        self.transition(PlaybackState::Undetermined, "pipe opened");

        while !control.is_stopping() {
            match pipe.wait_readable(self.poll_interval) {
                Ok(true) => {}
                Ok(false) => continue,
                Err(e) => {
                    if !control.is_stopping() {
                        error!("failed to poll {}: {e}", path.display());
                    }
                    break;
                }
            }

            match pipe.read_line() {
                // Another reader thread may own the pipe by now.
                Ok(Some(_)) if control.is_stopping() => {
                    debug!("discarding line read while stopping");
                    break;
                }
                Ok(Some(line)) => self.handle_line(&line, true),
                Ok(None) => {
                    debug!("end of pipe");
                    break;
                }
                Err(e) => {
                    if !control.is_stopping() {
                        error!("failed to read from {}: {e}", path.display());
                    }
                    break;
                }
            }
        }

        control.set_closer(None);
        drop(pipe);
        info!("reader thread exited");
    }
}

/// Stop controls of one reader thread.
#[derive(Default)]
struct Control {
    stop: AtomicBool,
    closer: Mutex<Option<Closer>>,
}

impl Control {
    fn is_stopping(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }

    fn set_closer(&self, closer: Option<Closer>) {
        *self.closer.lock().unwrap_or_else(PoisonError::into_inner) = closer;
    }

    fn request_stop(&self) {
        self.stop.store(true, Ordering::Release);
        if let Some(closer) = self
            .closer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
        {
            closer.close();
        }
    }
}

struct Worker {
    handle: JoinHandle<()>,
    control: Arc<Control>,
}

pub struct Monitor {
    config: Config,
    shared: Arc<Shared>,
    worker: Option<Worker>,
}

impl Monitor {
    #[must_use]
    pub fn new(config: Config, callbacks: Callbacks) -> Self {
        Self::with_scheduler(config, callbacks, Arc::new(ThreadScheduler))
    }

    /// Creates a monitor that defers the waiting transition through
    /// `scheduler`.
    #[must_use]
    pub fn with_scheduler(
        config: Config,
        callbacks: Callbacks,
        scheduler: Arc<dyn Scheduler>,
    ) -> Self {
        let core = Core {
            machine: StateMachine::new(PlaybackState::NoSession),
            reader: Reader::new(&config, Outbox::default()),
            capture: None,
            timer: None,
            timer_generation: 0,
            first_data: false,
        };

        let shared = Arc::new(Shared {
            core: Mutex::new(core),
            delivery: Mutex::default(),
            callbacks,
            scheduler,
            wait_timeout: config.wait_timeout,
            poll_interval: config.poll_interval,
        });

        Self {
            config,
            shared,
            worker: None,
        }
    }

    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Sets the sink that receives raw lines and events, replacing any
    /// previous one.
    pub fn set_capture(&self, sink: Option<Box<dyn CaptureSink>>) {
        self.shared.lock().capture = sink;
    }

    /// Starts the reader thread. Does nothing if it is already running.
    ///
    /// # Errors
    ///
    /// Returns `FailedPrecondition` if no pipe path is configured, `NotFound`
    /// if there is nothing at the configured path, or the error that occurred
    /// while spawning the thread.
    pub fn start(&mut self) -> Result<()> {
        if let Some(worker) = self.worker.take() {
            if !worker.handle.is_finished() && !worker.control.is_stopping() {
                warn!("monitor is already running");
                self.worker = Some(worker);
                return Ok(());
            }

            if worker.handle.is_finished() {
                let _ = worker.handle.join();
            } else {
                debug!("previous reader thread is still exiting");
            }
        }

        let path = self.config.pipe_path.clone();
        if path.as_os_str().is_empty() {
            return Err(Error::failed_precondition("no pipe path configured"));
        }
        if !path.exists() {
            return Err(Error::not_found(format!(
                "metadata pipe {} does not exist",
                path.display()
            )));
        }

        {
            let mut core = self.shared.lock();
            core.first_data = false;
            if let Some(capture) = core.capture.as_mut() {
                capture.begin();
                capture.event(&Event::MonitorStart { pipe: path.clone() });
            }
        }

        let control = Arc::new(Control::default());
        let shared = Arc::clone(&self.shared);
        let thread_control = Arc::clone(&control);
        let thread_path = path.clone();
        let handle = thread::Builder::new()
            .name("nowplaying-reader".to_owned())
            .spawn(move || shared.run(&thread_path, &thread_control))?;

        self.worker = Some(Worker { handle, control });
        info!("monitoring {}", path.display());

        Ok(())
    }

    /// Stops the reader thread.
    ///
    /// Waits at most the configured join timeout for the thread to exit. If
    /// it does not, a warning is logged and the thread is left to exit on its
    /// own.
    pub fn stop(&mut self) {
        let worker = self.worker.take();
        if let Some(worker) = &worker {
            worker.control.stop.store(true, Ordering::Release);
        }

        {
            let mut core = self.shared.lock();
            core.cancel_timer();
            if worker.is_some() {
                if let Some(capture) = core.capture.as_mut() {
                    capture.event(&Event::MonitorStop);
                    capture.finish();
                }
            }
        }

        let Some(worker) = worker else {
            return;
        };

        worker.control.request_stop();

        let deadline = Instant::now() + self.config.join_timeout;
        while !worker.handle.is_finished() && Instant::now() < deadline {
            thread::sleep(JOIN_POLL_INTERVAL);
        }

        if worker.handle.is_finished() {
            if worker.handle.join().is_err() {
                error!("reader thread panicked");
            }
            info!("monitor stopped");
        } else {
            warn!(
                "reader thread did not exit within {:?}",
                self.config.join_timeout
            );
        }
    }

    /// Whether the reader thread is running and has not been asked to stop.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.worker
            .as_ref()
            .is_some_and(|worker| !worker.handle.is_finished() && !worker.control.is_stopping())
    }

    #[must_use]
    pub fn state(&self) -> PlaybackState {
        self.shared.lock().machine.current()
    }

    /// Sets the state regardless of the transition table.
    pub fn set_state(&self, state: PlaybackState) {
        self.shared.locked(|core, notices| {
            self.shared.apply(core, state, "manual", Mode::Forced, notices);
        });
    }

    /// Processes a line as if it was read from the pipe, without the reader
    /// thread. The line is not captured and does not count as first data.
    pub fn process_line(&self, line: &str) {
        self.shared.handle_line(line, false);
    }
}

impl Drop for Monitor {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use std::{io::Write, path::PathBuf};

    use base64::prelude::*;

    use super::*;
    use crate::{error::ErrorKind, scheduler::ManualScheduler};
    use PlaybackState::*;

    type Bundles = Arc<Mutex<Vec<Bundle>>>;
    type States = Arc<Mutex<Vec<PlaybackState>>>;

    fn recorder() -> (Callbacks, Bundles, States) {
        let bundles = Bundles::default();
        let states = States::default();

        let callbacks = Callbacks::new(
            {
                let bundles = Arc::clone(&bundles);
                move |bundle: &Bundle| bundles.lock().unwrap().push(bundle.clone())
            },
            {
                let states = Arc::clone(&states);
                move |state| states.lock().unwrap().push(state)
            },
        );

        (callbacks, bundles, states)
    }

    struct Fixture {
        monitor: Monitor,
        scheduler: Arc<ManualScheduler>,
        bundles: Bundles,
        states: States,
        _dir: tempfile::TempDir,
    }

    fn fixture() -> Fixture {
        fixture_with(|_| {})
    }

    fn fixture_with(configure: impl FnOnce(&mut Config)) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::for_testing();
        config.cover_art_dir = dir.path().to_path_buf();
        configure(&mut config);

        let (callbacks, bundles, states) = recorder();
        let scheduler = Arc::new(ManualScheduler::default());
        let monitor = Monitor::with_scheduler(config, callbacks, scheduler.clone());

        Fixture {
            monitor,
            scheduler,
            bundles,
            states,
            _dir: dir,
        }
    }

    fn item(kind: &str, code: &str, payload: &[u8]) -> String {
        let kind = hex(kind);
        let code = hex(code);
        if payload.is_empty() {
            format!("<item><type>{kind}</type><code>{code}</code><length>0</length></item>")
        } else {
            format!(
                "<item><type>{kind}</type><code>{code}</code><length>{}</length>\
                 <data encoding=\"base64\">{}</data></item>",
                payload.len(),
                BASE64_STANDARD.encode(payload)
            )
        }
    }

    fn hex(tag: &str) -> String {
        tag.bytes().map(|b| format!("{b:02x}")).collect()
    }

    fn ssnc(code: &str) -> String {
        item("ssnc", code, b"")
    }

    #[derive(Clone, Default)]
    struct Sink(Arc<Mutex<Vec<String>>>);

    impl CaptureSink for Sink {
        fn begin(&mut self) {
            self.0.lock().unwrap().push("begin".to_owned());
        }

        fn line(&mut self, line: &str) {
            self.0.lock().unwrap().push(format!("line {}", line.trim()));
        }

        fn event(&mut self, event: &Event) {
            self.0.lock().unwrap().push(event.to_string());
        }

        fn finish(&mut self) {
            self.0.lock().unwrap().push("finish".to_owned());
        }
    }

    fn wait_until(timeout: Duration, condition: impl Fn() -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        condition()
    }

    // State changes

    #[test]
    fn repeated_request_notifies_once() {
        let f = fixture();
        f.monitor.set_state(Undetermined);
        f.monitor.process_line(&ssnc("pbeg"));
        f.monitor.process_line(&ssnc("pbeg"));

        assert_eq!(*f.states.lock().unwrap(), [Undetermined, Playing]);
        assert_eq!(f.monitor.state(), Playing);
    }

    #[test]
    fn illegal_request_is_ignored() {
        let f = fixture();
        f.monitor.process_line(&ssnc("pend"));

        assert_eq!(f.monitor.state(), NoSession);
        assert!(f.states.lock().unwrap().is_empty());
    }

    #[test]
    fn set_state_is_forced() {
        let f = fixture();
        f.monitor.set_state(Waiting);
        f.monitor.set_state(Waiting);

        assert_eq!(f.monitor.state(), Waiting);
        assert_eq!(*f.states.lock().unwrap(), [Waiting]);
    }

    #[test]
    fn session_end_dispatches_blank_bundle() {
        let f = fixture();
        f.monitor.set_state(Undetermined);
        for line in [
            ssnc("pbeg"),
            ssnc("mdst"),
            item("core", "asal", b"Abbey Road"),
            ssnc("mden"),
            ssnc("aend"),
        ] {
            f.monitor.process_line(&line);
        }

        assert_eq!(*f.states.lock().unwrap(), [Undetermined, Playing, NoSession]);

        let bundles = f.bundles.lock().unwrap();
        assert_eq!(bundles.len(), 2);
        assert_eq!(bundles[0].get("album"), Some("Abbey Road"));
        assert!(bundles[1].is_blank());
        assert_eq!(bundles[1].sequence, 0);
        assert!(f.monitor.shared.lock().reader.fields().is_empty());
    }

    #[test]
    fn callbacks_may_call_back_into_monitor() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::for_testing();
        config.cover_art_dir = dir.path().to_path_buf();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let monitor: Arc<Mutex<Option<Arc<Monitor>>>> = Arc::default();
        let callbacks = Callbacks::new(|_| {}, {
            let seen = Arc::clone(&seen);
            let monitor = Arc::clone(&monitor);
            move |state| {
                let monitor = monitor.lock().unwrap().clone();
                if let Some(monitor) = monitor {
                    seen.lock().unwrap().push((state, monitor.state()));
                    if state == Undetermined {
                        monitor.set_state(Playing);
                    }
                }
            }
        });

        let shared = Arc::new(Monitor::with_scheduler(
            config,
            callbacks,
            Arc::new(ManualScheduler::default()),
        ));
        *monitor.lock().unwrap() = Some(Arc::clone(&shared));

        shared.set_state(Undetermined);
        assert_eq!(
            *seen.lock().unwrap(),
            [(Undetermined, Undetermined), (Playing, Playing)]
        );

        // Break the cycle so the monitor is dropped.
        monitor.lock().unwrap().take();
    }

    #[test]
    fn callbacks_follow_order_of_changes() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::for_testing();
        config.cover_art_dir = dir.path().to_path_buf();

        let seen = States::default();
        let delivering_waiting = Arc::new(AtomicBool::new(false));
        let callbacks = Callbacks::new(|_| {}, {
            let seen = Arc::clone(&seen);
            let delivering_waiting = Arc::clone(&delivering_waiting);
            move |state| {
                if state == Waiting {
                    delivering_waiting.store(true, Ordering::Release);
                    thread::sleep(Duration::from_millis(200));
                }
                seen.lock().unwrap().push(state);
            }
        });

        let scheduler = Arc::new(ManualScheduler::default());
        let monitor = Monitor::with_scheduler(config, callbacks, scheduler.clone());
        monitor.set_state(Paused);

        thread::scope(|scope| {
            let timer = scope.spawn(|| scheduler.fire_all());
            assert!(wait_until(Duration::from_secs(2), || {
                delivering_waiting.load(Ordering::Acquire)
            }));

            monitor.process_line(&item("ssnc", "pcst", b"1"));
            assert_eq!(monitor.state(), Playing);
            assert_eq!(timer.join().unwrap(), 1);
        });

        assert_eq!(*seen.lock().unwrap(), [Paused, Waiting, Playing]);
        assert_eq!(seen.lock().unwrap().last(), Some(&monitor.state()));
    }

    #[test]
    fn first_data_forces_playing_when_not_reachable() {
        let f = fixture();
        assert!(!f.monitor.shared.lock().machine.can_transition_to(Playing));

        f.monitor.shared.handle_line(&item("ssnc", "prgr", b"1/2/3"), true);
        assert_eq!(f.monitor.state(), Playing);
        assert_eq!(*f.states.lock().unwrap(), [Playing]);

        // Only the first line counts.
        f.monitor.set_state(Paused);
        f.monitor.shared.handle_line(&item("ssnc", "prgr", b"1/2/3"), true);
        assert_eq!(f.monitor.state(), Paused);
    }

    // Waiting timer

    #[test]
    fn pause_settles_into_waiting() {
        let f = fixture();
        f.monitor.set_state(Undetermined);
        f.monitor.process_line(&ssnc("pbeg"));
        f.monitor.process_line(&item("ssnc", "pcst", b"0"));

        assert_eq!(f.monitor.state(), Paused);
        assert_eq!(f.scheduler.pending(), 1);
        assert_eq!(f.scheduler.last_delay(), Some(f.monitor.config().wait_timeout));

        assert_eq!(f.scheduler.fire_all(), 1);
        assert_eq!(f.monitor.state(), Waiting);
        assert_eq!(*f.states.lock().unwrap(), [Undetermined, Playing, Paused, Waiting]);
    }

    #[test]
    fn stop_request_settles_into_waiting() {
        let f = fixture();
        f.monitor.set_state(Playing);
        f.monitor.process_line(&ssnc("pend"));
        assert_eq!(f.monitor.state(), Stopped);

        f.scheduler.fire_all();
        assert_eq!(f.monitor.state(), Waiting);
    }

    #[test]
    fn any_line_cancels_waiting_timer() {
        let f = fixture();
        f.monitor.set_state(Playing);
        f.monitor.process_line(&item("ssnc", "pcst", b"0"));
        f.monitor.process_line(&item("ssnc", "prgr", b"1/2/3"));

        assert_eq!(f.scheduler.pending(), 0);
        assert_eq!(f.scheduler.fire_all(), 0);
        assert_eq!(f.monitor.state(), Paused);
    }

    #[test]
    fn rearming_replaces_timer() {
        let f = fixture();
        f.monitor.set_state(Playing);
        f.monitor.process_line(&item("ssnc", "pcst", b"0"));
        f.monitor.process_line(&item("ssnc", "pcst", b"0"));

        assert_eq!(f.scheduler.pending(), 1);
        assert_eq!(f.scheduler.fire_all(), 1);
        assert_eq!(f.monitor.state(), Waiting);
        assert_eq!(*f.states.lock().unwrap(), [Playing, Paused, Waiting]);
    }

    #[test]
    fn leaving_paused_cancels_timer() {
        let f = fixture();
        f.monitor.set_state(Paused);
        assert_eq!(f.scheduler.pending(), 1);

        f.monitor.set_state(Playing);
        assert_eq!(f.scheduler.pending(), 0);
        assert_eq!(f.monitor.state(), Playing);
    }

    #[test]
    fn stale_timer_does_nothing() {
        let f = fixture();
        f.monitor.set_state(Paused);
        let stale = f.monitor.shared.lock().timer_generation;
        f.monitor.set_state(Playing);

        f.monitor.shared.on_wait_timeout(stale);
        assert_eq!(f.monitor.state(), Playing);
    }

    #[test]
    fn timer_thread_reaches_waiting() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::for_testing();
        config.cover_art_dir = dir.path().to_path_buf();
        config.wait_timeout = Duration::from_millis(20);

        let (callbacks, _bundles, states) = recorder();
        let monitor = Monitor::new(config, callbacks);
        monitor.set_state(Stopped);

        assert!(wait_until(Duration::from_secs(2), || monitor.state() == Waiting));
        assert_eq!(*states.lock().unwrap(), [Stopped, Waiting]);
    }

    // Lifecycle

    #[test]
    fn start_without_pipe_path_fails() {
        let mut f = fixture_with(|config| config.pipe_path = PathBuf::new());
        let err = f.monitor.start().unwrap_err();
        assert_eq!(err.kind, ErrorKind::FailedPrecondition);
        assert!(!f.monitor.is_running());
    }

    #[test]
    fn start_with_missing_pipe_fails() {
        let mut f = fixture_with(|config| {
            config.pipe_path = PathBuf::from("/nonexistent/shairport-sync-metadata");
        });
        let err = f.monitor.start().unwrap_err();
        assert_eq!(err.kind, ErrorKind::NotFound);
    }

    #[test]
    fn stop_without_start_is_harmless() {
        let mut f = fixture();
        f.monitor.stop();
        f.monitor.stop();
        assert_eq!(f.monitor.state(), NoSession);
    }

    #[test]
    fn reads_until_end_of_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        for line in [
            ssnc("mdst"),
            item("core", "asar", b"The Beatles"),
            item("core", "asal", b"Abbey Road"),
            ssnc("mden"),
        ] {
            writeln!(file, "{line}").unwrap();
        }

        let path = file.path().to_path_buf();
        let mut f = fixture_with(|config| config.pipe_path = path);
        let sink = Sink::default();
        f.monitor.set_capture(Some(Box::new(sink.clone())));

        f.monitor.start().unwrap();
        assert!(wait_until(Duration::from_secs(2), || !f.monitor.is_running()));

        assert_eq!(*f.states.lock().unwrap(), [Undetermined, Playing]);
        let bundles = f.bundles.lock().unwrap();
        assert_eq!(bundles.len(), 1);
        assert_eq!(bundles[0].get("artist"), Some("The Beatles"));
        assert_eq!(bundles[0].sequence, 1);
        drop(bundles);

        f.monitor.stop();
        let captured = sink.0.lock().unwrap();
        assert_eq!(captured[0], "begin");
        assert!(captured[1].starts_with("monitor_start:"));
        assert!(captured.contains(&"state_change: no_session -> undetermined: pipe opened".to_owned()));
        assert!(captured.contains(&"state_change: undetermined -> playing: first data received".to_owned()));
        assert_eq!(captured.iter().filter(|entry| entry.starts_with("line ")).count(), 4);
    }

    #[cfg(unix)]
    #[test]
    fn line_read_while_stopping_is_discarded() {
        use std::{ffi::CString, fs::OpenOptions};

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("shairport-sync-metadata");
        let c_path = CString::new(path.to_str().unwrap()).unwrap();
        assert_eq!(unsafe { libc::mkfifo(c_path.as_ptr(), 0o600) }, 0);

        let f = fixture_with(|config| config.poll_interval = Duration::from_secs(10));

        let control = Arc::new(Control::default());
        let worker = {
            let shared = Arc::clone(&f.monitor.shared);
            let control = Arc::clone(&control);
            let path = path.clone();
            thread::spawn(move || shared.run(&path, &control))
        };

        // Opening for writing waits until the reader has the pipe open.
        let mut writer = OpenOptions::new().write(true).open(&path).unwrap();
        assert!(wait_until(Duration::from_secs(2), || f.monitor.state() == Undetermined));

        // Stop while the reader waits for data, without waking it.
        control.stop.store(true, Ordering::Release);
        writeln!(writer, "{}", item("ssnc", "pbeg", b"")).unwrap();
        worker.join().unwrap();

        assert_eq!(f.monitor.state(), Undetermined);
        assert_eq!(*f.states.lock().unwrap(), [Undetermined]);
    }

    #[test]
    fn manual_lines_are_not_captured() {
        let f = fixture();
        let sink = Sink::default();
        f.monitor.set_capture(Some(Box::new(sink.clone())));

        f.monitor.process_line(&ssnc("pbeg"));
        assert!(sink.0.lock().unwrap().iter().all(|entry| !entry.starts_with("line ")));
        assert_eq!(f.monitor.state(), NoSession);
    }
}
