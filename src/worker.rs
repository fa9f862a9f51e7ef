//! The worker loop contract (distilled spec §4.2): a pluggable collaborator
//! (`WorkerLogic`) wrapped by a concrete runtime (`Worker`/`WorkerHandle`)
//! that this crate owns end to end.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use rand::seq::SliceRandom;
use tracing::{debug, trace, warn};

use crate::channel::Channel;
use crate::config::{ExtraValue, WorkerOptions};
use crate::envelope::{ControlToken, Envelope, Payload};
use crate::error::WorkerException;
use crate::exit_event::ExitEvent;
use crate::panic::WorkerPanic;

/// The life-cycle state of a single worker (distilled spec §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Created,
    Running,
    Waiting,
    Terminated,
}

/// A pluggable per-item handler: the only domain-specific collaborator this
/// crate does not implement itself. Cloned once per spawned worker so each
/// gets its own mutable state.
pub trait WorkerLogic<T>: Send + Clone + 'static {
    fn handle(&mut self, item: T, ctx: &WorkerContext<T>);
}

impl<T, F> WorkerLogic<T> for F
where
    F: FnMut(T, &WorkerContext<T>) + Send + Clone + 'static,
{
    fn handle(&mut self, item: T, ctx: &WorkerContext<T>) {
        (self)(item, ctx)
    }
}

/// Handed to [`WorkerLogic::handle`] so user code can forward results
/// downstream or push runtime configuration without reaching back into the
/// manager.
pub struct WorkerContext<T> {
    name: String,
    input: Channel<T>,
    outputs: Vec<Channel<T>>,
    configuration: Channel<T>,
    options: WorkerOptions,
    extras: HashMap<String, ExtraValue>,
}

impl<T> WorkerContext<T> {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Looks up a value forwarded verbatim from the manager's extras map at
    /// spawn time.
    pub fn get_extra(&self, name: &str) -> Option<&ExtraValue> {
        self.extras.get(name)
    }

    fn maybe_delay_sharing(&self) {
        if self.options.delay_message_sharing {
            std::thread::sleep(self.options.sharing_delay);
        }
    }

    /// Forwards `data` to a single, uniformly-chosen output channel, tagged
    /// with this worker as the source.
    pub fn push_to_output_queues(&self, data: T) {
        self.maybe_delay_sharing();
        if let Some(channel) = self.outputs.choose(&mut rand::thread_rng()) {
            channel.push(Envelope::data(data, self.name.clone()));
        }
    }

    /// Forwards `data` to every output channel, tagged with this worker as
    /// the source.
    pub fn push_to_all_output_queues(&self, data: T)
    where
        T: Clone,
    {
        self.maybe_delay_sharing();
        for channel in &self.outputs {
            channel.push(Envelope::data(data.clone(), self.name.clone()));
        }
    }

    pub fn push_to_configuration_queue(&self, data: T) {
        self.maybe_delay_sharing();
        self.configuration
            .push(Envelope::data(data, self.name.clone()));
    }

    /// Re-enqueues `envelope` onto the input channel unchanged; used both by
    /// the targeted-processing guard and available to user logic that wants
    /// to defer an item.
    pub fn requeue(&self, envelope: Envelope<T>) {
        self.input.push(envelope);
    }
}

/// Shared, thread-safe state a [`WorkerHandle`] exposes to the manager.
struct Shared {
    state: Mutex<WorkerState>,
    exception: Mutex<Option<WorkerException>>,
    concurrent_workers_names: Mutex<Vec<String>>,
    kill: AtomicBool,
    /// Set once the worker is told to actually start processing.
    ///
    /// Unlike a literal OS process, the thread backing a worker exists from
    /// the moment it is spawned. To still honor the distinction between a
    /// worker that has only been *created* and one that has been *started*,
    /// a freshly spawned worker parks itself until this flag is set rather
    /// than entering its receive loop immediately.
    armed: AtomicBool,
}

/// The manager-facing handle to a spawned worker: everything described in
/// the distilled spec's worker contract (start/terminate/join/is_alive,
/// a writable `concurrent_workers_names`, a read-only `exception`) plus the
/// three push operations, all backed by channel handles shared with the
/// worker's own thread.
pub struct WorkerHandle<T> {
    name: String,
    input: Channel<T>,
    outputs: Vec<Channel<T>>,
    configuration: Channel<T>,
    shared: Arc<Shared>,
    thread: Option<JoinHandle<()>>,
    daemon: bool,
}

impl<T: Send + 'static> WorkerHandle<T> {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> WorkerState {
        *self.shared.state.lock().unwrap()
    }

    pub fn is_alive(&self) -> bool {
        match &self.thread {
            Some(handle) => !handle.is_finished(),
            None => false,
        }
    }

    pub fn set_concurrent_workers_names(&self, names: Vec<String>) {
        *self.shared.concurrent_workers_names.lock().unwrap() = names;
    }

    pub fn concurrent_workers_names(&self) -> Vec<String> {
        self.shared.concurrent_workers_names.lock().unwrap().clone()
    }

    /// Takes the worker's stored exception, if any. `None` both when the
    /// worker hasn't failed and after the exception has already been taken.
    pub fn take_exception(&self) -> Option<WorkerException> {
        self.shared.exception.lock().unwrap().take()
    }

    pub fn has_exception(&self) -> bool {
        self.shared.exception.lock().unwrap().is_some()
    }

    /// Requests forced termination of just this worker: sets its kill flag
    /// (checked at the worker's next suspension point) without touching the
    /// pool-wide exit event.
    pub fn request_termination(&self) {
        self.shared.kill.store(true, Ordering::SeqCst);
    }

    /// Joins the worker's thread, if it is owned (non-daemon) and hasn't
    /// already been joined.
    pub fn join(&mut self) {
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
        *self.shared.state.lock().unwrap() = WorkerState::Terminated;
    }

    pub fn is_daemon(&self) -> bool {
        self.daemon
    }

    /// Releases the worker from its initial parked state so it starts
    /// consuming its input channel. Idempotent.
    pub fn arm(&self) {
        self.shared.armed.store(true, Ordering::SeqCst);
    }

    /// Whether this worker has ever been armed, regardless of its current
    /// state. Used by the manager to tell apart workers that were merely
    /// created from ones that were actually started.
    pub fn is_armed(&self) -> bool {
        self.shared.armed.load(Ordering::SeqCst)
    }

    pub fn push_to_input_queue(
        &self,
        data: T,
        source_worker: impl Into<String>,
        destination_worker: Option<String>,
    ) {
        let mut envelope = Envelope::data(data, source_worker);
        envelope.destination_worker = destination_worker;
        self.input.push(envelope);
    }

    pub fn push_to_output_queues(
        &self,
        data: T,
        source_worker: impl Into<String>,
        destination_worker: Option<String>,
    ) {
        let mut envelope = Envelope::data(data, source_worker);
        envelope.destination_worker = destination_worker;
        if let Some(channel) = self.outputs.choose(&mut rand::thread_rng()) {
            channel.push(envelope);
        }
    }

    pub fn push_to_output_queues_broadcast(&self, data: T, source_worker: impl Into<String>)
    where
        T: Clone,
    {
        let source_worker = source_worker.into();
        for channel in &self.outputs {
            channel.push(Envelope::data(data.clone(), source_worker.clone()));
        }
    }

    pub fn push_to_configuration_queue(
        &self,
        data: T,
        source_worker: impl Into<String>,
        destination_worker: Option<String>,
    ) {
        let mut envelope = Envelope::data(data, source_worker);
        envelope.destination_worker = destination_worker;
        self.configuration.push(envelope);
    }

    pub fn push_control_to_input(&self, token: ControlToken, source_worker: impl Into<String>) {
        self.input.push(Envelope::new(Payload::Control(token), source_worker));
    }

    pub fn push_control_to_input_targeted(
        &self,
        token: ControlToken,
        source_worker: impl Into<String>,
        destination_worker: impl Into<String>,
    ) {
        self.input.push(
            Envelope::new(Payload::Control(token), source_worker)
                .with_destination(destination_worker),
        );
    }

    pub fn push_control_to_outputs(&self, token: ControlToken, source_worker: impl Into<String>) {
        let source_worker = source_worker.into();
        for channel in &self.outputs {
            channel.push(Envelope::new(Payload::Control(token), source_worker.clone()));
        }
    }
}

impl<T> Drop for WorkerHandle<T> {
    fn drop(&mut self) {
        if self.daemon {
            // Detach: let the thread keep running past this handle's lifetime.
            self.thread.take();
        }
    }
}

/// Spawns a worker thread running the loop contract described in the
/// distilled spec §4.2, and returns the manager-facing handle for it.
#[allow(clippy::too_many_arguments)]
pub fn spawn<T, L>(
    name: String,
    input: Channel<T>,
    outputs: Vec<Channel<T>>,
    configuration: Channel<T>,
    exit_event: ExitEvent,
    options: WorkerOptions,
    extras: HashMap<String, ExtraValue>,
    mut logic: L,
) -> WorkerHandle<T>
where
    T: Send + 'static,
    L: WorkerLogic<T>,
{
    let shared = Arc::new(Shared {
        state: Mutex::new(WorkerState::Created),
        exception: Mutex::new(None),
        concurrent_workers_names: Mutex::new(Vec::new()),
        kill: AtomicBool::new(false),
        armed: AtomicBool::new(false),
    });

    let thread_name = name.clone();
    let thread_input = input.clone();
    let thread_outputs = outputs.clone();
    let thread_configuration = configuration.clone();
    let thread_shared = shared.clone();
    let thread_exit_event = exit_event.clone();
    let thread_options = options.clone();
    let thread_extras = extras;

    let thread = std::thread::Builder::new()
        .name(thread_name.clone())
        .spawn(move || {
            while !thread_shared.armed.load(Ordering::SeqCst) {
                if thread_exit_event.is_set() || thread_shared.kill.load(Ordering::SeqCst) {
                    *thread_shared.state.lock().unwrap() = WorkerState::Terminated;
                    return;
                }
                std::thread::sleep(Duration::from_millis(20));
            }

            *thread_shared.state.lock().unwrap() = WorkerState::Running;
            let ctx = WorkerContext {
                name: thread_name.clone(),
                input: thread_input.clone(),
                outputs: thread_outputs,
                configuration: thread_configuration,
                options: thread_options.clone(),
                extras: thread_extras,
            };

            run_loop(
                &thread_name,
                &thread_input,
                &ctx,
                &thread_exit_event,
                &thread_options,
                &thread_shared,
                &mut logic,
            );

            *thread_shared.state.lock().unwrap() = WorkerState::Terminated;
        })
        .expect("failed to spawn worker thread");

    WorkerHandle {
        name,
        input,
        outputs,
        configuration,
        shared,
        thread: Some(thread),
        daemon: options.daemon,
    }
}

#[allow(clippy::too_many_arguments)]
fn run_loop<T, L>(
    name: &str,
    input: &Channel<T>,
    ctx: &WorkerContext<T>,
    exit_event: &ExitEvent,
    options: &WorkerOptions,
    shared: &Arc<Shared>,
    logic: &mut L,
) where
    T: Send + 'static,
    L: WorkerLogic<T>,
{
    loop {
        if exit_event.is_set() || shared.kill.load(Ordering::SeqCst) {
            debug!(worker = name, "exit event observed, terminating");
            return;
        }

        // Poll with a short timeout so the exit event and kill flag above
        // are re-checked regularly even when the channel is idle.
        let envelope = match input.recv_timeout(Duration::from_millis(100)) {
            Some(envelope) => envelope,
            None => {
                if !options.fetch_delay.is_zero() {
                    std::thread::sleep(options.fetch_delay);
                }
                continue;
            }
        };

        if options.targeted_processing && envelope.misaddressed(name) {
            trace!(worker = name, "re-queueing envelope addressed elsewhere");
            ctx.requeue(envelope);
            continue;
        }

        match envelope.payload {
            Payload::Control(ControlToken::Stop) => {
                if options.spread_stop_signal {
                    ctx.push_to_all_output_queues_control(ControlToken::Stop);
                }
                if options.delay_shutdown {
                    std::thread::sleep(options.shutdown_delay);
                }
                debug!(worker = name, "honoring stop signal");
                return;
            }
            Payload::Control(ControlToken::Wait) => {
                debug!(worker = name, "entering waiting state");
                if options.spread_wait_signal {
                    ctx.push_to_all_output_queues_control(ControlToken::Wait);
                }
                *shared.state.lock().unwrap() = WorkerState::Waiting;
                let next = loop {
                    if exit_event.is_set() || shared.kill.load(Ordering::SeqCst) {
                        return;
                    }
                    match input.recv_timeout(Duration::from_millis(100)) {
                        Some(e) if e.payload.is_wait() => continue,
                        Some(e) => break e,
                        None => continue,
                    }
                };
                *shared.state.lock().unwrap() = WorkerState::Running;

                if options.targeted_processing && next.misaddressed(name) {
                    ctx.requeue(next);
                    continue;
                }

                match next.payload {
                    Payload::Control(ControlToken::Stop) => {
                        if options.spread_stop_signal {
                            ctx.push_to_all_output_queues_control(ControlToken::Stop);
                        }
                        if options.delay_shutdown {
                            std::thread::sleep(options.shutdown_delay);
                        }
                        return;
                    }
                    Payload::Control(ControlToken::Wait) => unreachable!(
                        "the inner absorption loop above never yields another Wait token"
                    ),
                    Payload::Data(item) => {
                        invoke_logic(name, item, ctx, options, shared, logic);
                    }
                }
            }
            Payload::Data(item) => {
                invoke_logic(name, item, ctx, options, shared, logic);
            }
        }
    }
}

fn invoke_logic<T, L>(
    name: &str,
    item: T,
    ctx: &WorkerContext<T>,
    options: &WorkerOptions,
    shared: &Arc<Shared>,
    logic: &mut L,
) where
    T: Send + 'static,
    L: WorkerLogic<T>,
{
    if options.raise_exception {
        logic.handle(item, ctx);
        return;
    }

    let result = catch_unwind(AssertUnwindSafe(|| logic.handle(item, ctx)));
    if let Err(payload) = result {
        let panic = WorkerPanic::from_payload(&*payload);
        warn!(worker = name, message = %panic, "worker logic panicked");
        *shared.exception.lock().unwrap() = Some(WorkerException {
            worker_name: name.to_string(),
            panic,
        });
    }
}

impl<T> WorkerContext<T> {
    fn push_to_all_output_queues_control(&self, token: ControlToken) {
        for channel in &self.outputs {
            channel.push(Envelope::new(Payload::Control(token), self.name.clone()));
        }
    }
}
