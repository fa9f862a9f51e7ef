//! The pool manager: owns the shared channels and the exit event, spawns and
//! tears down workers, and dispatches data to them.

use rand::seq::SliceRandom;
use tracing::{debug, error};

use crate::channel::Channel;
use crate::config::{default_cpu_count, ExtraValue, ManagerConfig};
use crate::envelope::{ControlToken, Envelope, Payload};
use crate::error::ManagerError;
use crate::exit_event::ExitEvent;
use crate::worker::{self, WorkerHandle, WorkerLogic};

/// Owns a pool of workers that all share one input channel, one
/// configuration channel, and some number of output channels.
///
/// `created_workers`/`running_workers` in the distilled source are really two
/// views onto a single list of worker objects (an entry lives in both once
/// started, and is removed from both together). This type keeps one owning
/// `Vec<WorkerHandle<T>>` and derives both views from each worker's armed
/// state instead of maintaining two parallel lists that could drift apart.
pub struct Manager<T, L: WorkerLogic<T>> {
    config: ManagerConfig,
    logic: L,
    input: Channel<T>,
    outputs: Vec<Channel<T>>,
    configuration: Channel<T>,
    exit_event: ExitEvent,
    workers: Vec<WorkerHandle<T>>,
    /// Data queued for the input channel before the pool is started.
    pub input_datasets: Vec<T>,
    /// Data queued for the output channels before the pool is started.
    pub output_datasets: Vec<T>,
    /// Data queued for the configuration channel before the pool is started.
    pub configuration_datasets: Vec<T>,
}

impl<T, L> Manager<T, L>
where
    T: Send + 'static,
    L: WorkerLogic<T>,
{
    /// Builds the manager's shared channels from `config` and stores `logic`
    /// as the template cloned into every worker it spawns.
    pub fn new(config: ManagerConfig, logic: L) -> Self {
        Manager::with_channels(config, logic, None, None, None)
            .expect("Manager::new never supplies external channels, so it cannot fail")
    }

    /// Like [`Manager::new`], but lets the caller wire in externally built
    /// channels instead of having the manager generate its own — the
    /// distilled spec's `input_queue`/`output_queue`/`configuration_queue`
    /// construction options (§4.1). Any channel left `None` is generated
    /// exactly as `new` would generate it.
    ///
    /// This is how two pools are chained: hand one pool's output channel to
    /// the next pool's `input`, and items pushed to the first pool's output
    /// queues land directly on the second pool's input queue without an
    /// intermediate consumer.
    ///
    /// Fails with [`ManagerError::InvalidChannelConfiguration`] if an
    /// externally supplied `outputs` list does not have exactly
    /// `config.output_channel_count` entries.
    pub fn with_channels(
        config: ManagerConfig,
        logic: L,
        input: Option<Channel<T>>,
        outputs: Option<Vec<Channel<T>>>,
        configuration: Option<Channel<T>>,
    ) -> Result<Self, ManagerError> {
        let outputs = match outputs {
            Some(channels) if channels.len() == config.output_channel_count => channels,
            Some(channels) => {
                return Err(ManagerError::InvalidChannelConfiguration(format!(
                    "expected {} output channel(s), got {}",
                    config.output_channel_count,
                    channels.len()
                )))
            }
            None => (0..config.output_channel_count)
                .map(|_| Channel::with_capacity(config.bounded_capacity))
                .collect(),
        };
        let input = input.unwrap_or_else(|| Channel::with_capacity(config.bounded_capacity));
        let configuration =
            configuration.unwrap_or_else(|| Channel::with_capacity(config.bounded_capacity));

        Ok(Manager {
            config,
            logic,
            input,
            outputs,
            configuration,
            exit_event: ExitEvent::new(),
            workers: Vec::new(),
            input_datasets: Vec::new(),
            output_datasets: Vec::new(),
            configuration_datasets: Vec::new(),
        })
    }

    /// The manager's own name, used as the default `source_worker` on pushes
    /// it initiates directly.
    pub fn name(&self) -> String {
        format!("ppm-{}", self.config.pool_name)
    }

    pub fn cpu_count(&self) -> usize {
        default_cpu_count(num_cpus::get())
    }

    pub fn max_workers(&self) -> usize {
        self.config.max_workers
    }

    pub fn set_max_workers(&mut self, value: i64) {
        self.config.max_workers = value.max(1) as usize;
    }

    /// All workers this manager has ever spawned, started or not.
    pub fn created_workers(&self) -> &[WorkerHandle<T>] {
        &self.workers
    }

    /// The subset of `created_workers` that have been started at least once.
    pub fn running_workers(&self) -> Vec<&WorkerHandle<T>> {
        self.workers.iter().filter(|w| w.is_armed()).collect()
    }

    /// Whether at least one started worker's thread is still alive.
    pub fn is_running(&self) -> bool {
        self.workers
            .iter()
            .any(|w| w.is_armed() && w.is_alive())
    }

    fn ensure_spawned(&mut self) {
        if self.workers.is_empty() {
            self.spawn_workers(false);
        }
    }

    /// Chooses which view of the worker list a push operation should target,
    /// mirroring the source's own branch: once the pool is running, pushes
    /// target the started workers, otherwise they target every worker that
    /// has been created so far.
    fn target_workers(&self) -> Vec<&WorkerHandle<T>> {
        if self.is_running() {
            self.running_workers()
        } else {
            self.workers.iter().collect()
        }
    }

    /// Resolves the number of items currently queued on the input channel.
    pub fn queue_size(&self) -> usize {
        self.input.len()
    }

    /// A queue is considered full once it holds more items than the pool has
    /// workers to drain them with.
    pub fn is_queue_full(&self) -> bool {
        self.queue_size() > self.config.max_workers
    }

    pub fn get_extra(&self, name: &str) -> Option<&ExtraValue> {
        self.config.extras.get(name)
    }

    /// Attribute-style access: known fields first, then the extras map,
    /// standing in for the distilled source's dynamic attribute fallthrough.
    pub fn attr(&self, name: &str) -> Result<ExtraValue, ManagerError> {
        match name {
            "pool_name" => Ok(ExtraValue::String(self.config.pool_name.clone())),
            "max_workers" => Ok(ExtraValue::Int(self.config.max_workers as i64)),
            "daemon" => Ok(ExtraValue::Bool(self.config.worker_options.daemon)),
            "cpu_count" => Ok(ExtraValue::Int(self.cpu_count() as i64)),
            _ => self
                .get_extra(name)
                .cloned()
                .ok_or_else(|| ManagerError::UnknownAttribute(name.to_string())),
        }
    }

    /// Spawns and configures a single new worker. Returns `None` once the
    /// pool already has `max_workers` started workers.
    pub fn spawn_worker(&mut self, start: bool) -> Option<&WorkerHandle<T>> {
        if self.running_workers().len() >= self.config.max_workers {
            return None;
        }

        let name = format!("ppm-{}-{}", self.config.pool_name, self.workers.len() + 1);

        // Preserved from the source as observed rather than as a naive
        // reader would expect: while the pool is running, a newly spawned
        // worker is told about every worker created so far; while it is
        // not, it is told only about the ones already started (usually
        // none, on the very first spawn).
        let concurrent_workers_names: Vec<String> = if self.is_running() {
            self.workers.iter().map(|w| w.name().to_string()).collect()
        } else {
            self.running_workers()
                .iter()
                .map(|w| w.name().to_string())
                .collect()
        };

        let handle = worker::spawn(
            name.clone(),
            self.input.clone(),
            self.outputs.clone(),
            self.configuration.clone(),
            self.exit_event.clone(),
            self.config.worker_options.clone(),
            self.config.extras.clone(),
            self.logic.clone(),
        );
        handle.set_concurrent_workers_names(concurrent_workers_names);

        if start {
            handle.arm();
        }

        self.workers.push(handle);
        debug!(pool = %self.name(), worker = %name, "worker spawned");
        self.workers.last()
    }

    /// Spawns as many workers as `max_workers` allows.
    pub fn spawn_workers(&mut self, start: bool) -> &mut Self {
        for _ in 0..self.config.max_workers {
            self.spawn_worker(start);
        }
        self
    }

    pub fn push_to_input_queue(&mut self, data: T, source_worker: Option<String>) -> &mut Self {
        self.ensure_spawned();
        let source = source_worker.unwrap_or_else(|| self.name());
        if let Some(worker) = self.target_workers().choose(&mut rand::thread_rng()) {
            worker.push_to_input_queue(data, source, None);
        }
        debug!(pool = %self.name(), "pushed to input queue");
        self
    }

    pub fn push_to_output_queues(&mut self, data: T, source_worker: Option<String>) -> &mut Self {
        self.ensure_spawned();
        let source = source_worker.unwrap_or_else(|| self.name());
        if let Some(worker) = self.target_workers().choose(&mut rand::thread_rng()) {
            worker.push_to_output_queues(data, source, None);
        }
        debug!(pool = %self.name(), "pushed to output queues");
        self
    }

    /// Pushes to a single, randomly chosen worker's configuration queue
    /// without broadcasting. `push_to_configuration_queue` below is the
    /// one most callers want: the distilled spec defaults configuration
    /// pushes to `all_queues = true`, since configuration changes are
    /// normally meant for every worker in the pool.
    pub fn push_to_configuration_queue_single(
        &mut self,
        data: T,
        source_worker: Option<String>,
    ) -> &mut Self {
        self.ensure_spawned();
        let source = source_worker.unwrap_or_else(|| self.name());
        if let Some(worker) = self.target_workers().choose(&mut rand::thread_rng()) {
            worker.push_to_configuration_queue(data, source, None);
        }
        debug!(pool = %self.name(), "pushed to configuration queue");
        self
    }

    pub fn push_stop_signal(&mut self, source_worker: Option<String>) -> &mut Self {
        self.ensure_spawned();
        let source = source_worker.unwrap_or_else(|| self.name());
        for worker in self.target_workers() {
            worker.push_control_to_input_targeted(ControlToken::Stop, source.clone(), worker.name());
        }
        self
    }

    pub fn push_wait_signal(&mut self, source_worker: Option<String>) -> &mut Self {
        self.ensure_spawned();
        let source = source_worker.unwrap_or_else(|| self.name());
        for worker in self.target_workers() {
            worker.push_control_to_input_targeted(ControlToken::Wait, source.clone(), worker.name());
        }
        self
    }

    /// Forcibly stops and removes a single worker by name.
    pub fn terminate_worker(&mut self, name: &str) -> &mut Self {
        if let Some(pos) = self.workers.iter().position(|w| w.name() == name) {
            debug!(pool = %self.name(), worker = name, "terminating worker");
            let mut handle = self.workers.remove(pos);
            handle.request_termination();
            handle.join();
            debug!(pool = %self.name(), "worker terminated");
        }
        self
    }

    /// Sets the global exit event and tears down every worker that is still
    /// alive, then pushes a closing `Stop` to every output channel so that
    /// downstream consumers of this pool learn of its completion. Workers
    /// that were created but never started are left in place, matching the
    /// source: it only calls `terminate_worker` on workers it finds alive,
    /// skipping the rest.
    ///
    /// The exit event is set unconditionally, and the closing broadcast is
    /// pushed directly through `self.outputs` rather than through a worker
    /// handle: both the event and the output channels are owned by the
    /// manager itself, so neither needs a worker to still exist to reach
    /// them, and `terminate()` must stay idempotent even on a pool that
    /// never spawned a worker or has already drained every one it spawned.
    pub fn terminate(&mut self) -> &mut Self {
        debug!(pool = %self.name(), "terminating all workers");

        self.exit_event.set();

        let alive: Vec<String> = self
            .workers
            .iter()
            .filter(|w| w.is_alive())
            .map(|w| w.name().to_string())
            .collect();
        for name in alive {
            self.terminate_worker(&name);
        }

        for channel in &self.outputs {
            channel.push(Envelope::new(Payload::Control(ControlToken::Stop), self.name()));
        }

        debug!(pool = %self.name(), "all workers terminated");
        self
    }

    /// Waits for every started worker to finish, then for every worker that
    /// was created but never started, propagating the first worker exception
    /// observed. Collects each cohort's names up front before mutating
    /// `self.workers`, unlike the source, which mutates the list it is still
    /// iterating over.
    pub fn wait(&mut self) -> Result<(), ManagerError> {
        let started: Vec<String> = self
            .workers
            .iter()
            .filter(|w| w.is_armed())
            .map(|w| w.name().to_string())
            .collect();

        for name in started {
            debug!(pool = %self.name(), worker = %name, "waiting for worker");
            if let Some(pos) = self.workers.iter().position(|w| w.name() == name) {
                let mut handle = self.workers.remove(pos);
                handle.join();
                if let Some(exception) = handle.take_exception() {
                    self.terminate();
                    error!(pool = %self.name(), worker = %name, trace = %exception.trace(), "worker raised an exception");
                    return Err(ManagerError::from(exception));
                }
            }
        }

        let pending: Vec<String> = self.workers.iter().map(|w| w.name().to_string()).collect();
        for name in pending {
            debug!(pool = %self.name(), worker = %name, "waiting for worker - created");
            if let Some(pos) = self.workers.iter().position(|w| w.name() == name) {
                let mut handle = self.workers.remove(pos);
                handle.request_termination();
                handle.join();
                if let Some(exception) = handle.take_exception() {
                    self.terminate();
                    error!(pool = %self.name(), worker = %name, trace = %exception.trace(), "worker raised an exception");
                    return Err(ManagerError::from(exception));
                }
            }
        }

        self.terminate();
        Ok(())
    }

    /// Starts every created worker, spawning a full cohort first if none has
    /// been created yet, and drains the pre-start dataset queues. A no-op
    /// while the pool is already running.
    ///
    /// Guarded only by `is_running()`, so calling this again after every
    /// worker has died re-sends the dataset queues in full, exactly as
    /// observed in the source: nothing clears `input_datasets` et al, and
    /// nothing checks whether the workers that will receive them are fresh.
    pub fn start(&mut self) -> &mut Self
    where
        T: Clone,
    {
        if self.is_running() {
            return self;
        }

        self.ensure_spawned();

        for worker in &self.workers {
            worker.arm();
        }

        for data in self.input_datasets.clone() {
            self.push_to_input_queue(data, Some("ppm".to_string()));
        }
        for data in self.output_datasets.clone() {
            self.push_to_output_queues(data, Some("ppm".to_string()));
        }
        for data in self.configuration_datasets.clone() {
            self.push_to_configuration_queue(data, Some("ppm".to_string()));
        }

        self
    }
}

/// Broadcast variants that push one envelope per targeted worker instead of
/// picking a single one at random. Split into their own `impl` block because
/// they additionally require `T: Clone`.
impl<T, L> Manager<T, L>
where
    T: Send + Clone + 'static,
    L: WorkerLogic<T>,
{
    pub fn push_to_input_queue_broadcast(
        &mut self,
        data: T,
        source_worker: Option<String>,
    ) -> &mut Self {
        self.ensure_spawned();
        let source = source_worker.unwrap_or_else(|| self.name());
        for worker in self.target_workers() {
            worker.push_to_input_queue(data.clone(), source.clone(), Some(worker.name().to_string()));
        }
        self
    }

    pub fn push_to_output_queues_broadcast(
        &mut self,
        data: T,
        source_worker: Option<String>,
    ) -> &mut Self {
        self.ensure_spawned();
        let source = source_worker.unwrap_or_else(|| self.name());
        for worker in self.target_workers() {
            worker.push_to_output_queues(data.clone(), source.clone(), Some(worker.name().to_string()));
        }
        self
    }

    /// Broadcasts `data` to every worker's configuration queue, one envelope
    /// per worker addressed to that worker's name. This is the default shape
    /// for configuration pushes (the distilled spec's `all_queues = true`
    /// default); use [`Manager::push_to_configuration_queue_single`] for the
    /// single-random-worker variant.
    pub fn push_to_configuration_queue(
        &mut self,
        data: T,
        source_worker: Option<String>,
    ) -> &mut Self {
        self.ensure_spawned();
        let source = source_worker.unwrap_or_else(|| self.name());
        for worker in self.target_workers() {
            worker.push_to_configuration_queue(
                data.clone(),
                source.clone(),
                Some(worker.name().to_string()),
            );
        }
        self
    }
}

impl<T, L> Drop for Manager<T, L>
where
    T: Send + 'static,
    L: WorkerLogic<T>,
{
    fn drop(&mut self) {
        self.exit_event.set();
        for worker in &mut self.workers {
            worker.request_termination();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ManagerConfig;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    fn test_config(max_workers: i64) -> ManagerConfig {
        ManagerConfig::new()
            .pool_name("test")
            .max_workers(max_workers)
            .fetch_delay(Duration::from_millis(1))
    }

    #[test]
    fn with_channels_rejects_a_mismatched_output_count() {
        let result = Manager::with_channels(
            test_config(1).output_channel_count(2),
            |_item: u32, _ctx: &_| {},
            None,
            Some(vec![Channel::unbounded()]),
            None,
        );
        assert!(matches!(
            result,
            Err(ManagerError::InvalidChannelConfiguration(_))
        ));
    }

    #[test]
    fn with_channels_chains_one_pools_output_into_anothers_input() {
        let bridge: Channel<u32> = Channel::unbounded();

        let mut upstream = Manager::with_channels(
            test_config(1).output_channel_count(1),
            |item: u32, ctx: &_| {
                ctx.push_to_output_queues(item * 2);
            },
            None,
            Some(vec![bridge.clone()]),
            None,
        )
        .unwrap();

        let mut downstream = Manager::with_channels(
            test_config(1),
            |_item: u32, _ctx: &_| {},
            Some(bridge),
            None,
            None,
        )
        .unwrap();

        upstream.start();
        upstream.push_to_input_queue(21, None);
        std::thread::sleep(Duration::from_millis(150));
        upstream.push_stop_signal(None);
        upstream.wait().unwrap();

        downstream.spawn_workers(false);
        let forwarded = downstream.queue_size();
        assert_eq!(forwarded, 1, "upstream's output landed on downstream's input");
        downstream.terminate();
    }

    #[test]
    fn spawn_worker_respects_max_workers() {
        let mut manager = Manager::new(test_config(1), |_item: u32, _ctx: &_| {});
        assert!(manager.spawn_worker(true).is_some());
        assert!(manager.spawn_worker(true).is_none());
    }

    #[test]
    fn terminate_pushes_stop_to_every_output_channel() {
        let mut manager = Manager::new(test_config(2), |_item: u32, _ctx: &_| {});
        manager.start();

        manager.terminate();

        let envelope = manager
            .outputs[0]
            .recv_timeout(Duration::from_millis(200))
            .expect("terminate() should have pushed a Stop to the output channel");
        assert!(envelope.payload.is_stop());
        assert_eq!(envelope.source_worker, manager.name());
    }

    #[test]
    fn terminate_on_a_pool_with_no_spawned_workers_still_sets_the_exit_event_and_pushes_stop() {
        let mut manager = Manager::new(test_config(1), |_item: u32, _ctx: &_| {});
        assert!(manager.created_workers().is_empty());

        manager.terminate();

        assert!(manager.exit_event.is_set());
        let envelope = manager
            .outputs[0]
            .recv_timeout(Duration::from_millis(200))
            .expect("terminate() should push Stop even when no worker was ever spawned");
        assert!(envelope.payload.is_stop());
    }

    #[test]
    fn terminate_is_idempotent_and_keeps_pushing_stop_on_an_already_empty_pool() {
        let mut manager = Manager::new(test_config(1), |_item: u32, _ctx: &_| {});
        manager.start();
        manager.terminate();
        assert!(manager.created_workers().is_empty());

        // Drain the first Stop before calling terminate() again.
        manager
            .outputs[0]
            .recv_timeout(Duration::from_millis(200))
            .expect("first terminate() should have pushed a Stop");

        manager.terminate();

        let second = manager
            .outputs[0]
            .recv_timeout(Duration::from_millis(200))
            .expect("a second terminate() on an already-empty pool should still push a Stop");
        assert!(second.payload.is_stop());
        assert!(manager.created_workers().is_empty());
    }

    #[test]
    fn queue_size_reflects_pending_input() {
        let counter = Arc::new(AtomicUsize::new(0));
        let handler_counter = counter.clone();
        let mut manager = Manager::new(test_config(1), move |_item: u32, _ctx: &_| {
            handler_counter.fetch_add(1, Ordering::SeqCst);
        });

        manager.push_to_input_queue(1, None);
        assert_eq!(manager.queue_size(), 1);

        manager.terminate();
    }

    #[test]
    fn pre_start_datasets_land_on_the_right_channels() {
        // Workers are created but left unarmed, so they never start reading
        // their input channel and cannot race this test for the envelopes
        // `start()` would otherwise drain onto it.
        let mut manager = Manager::new(test_config(1), |_item: u32, _ctx: &_| {});
        manager.spawn_workers(false);
        let worker_name = manager.created_workers()[0].name().to_string();

        manager.push_to_input_queue(1, Some("ppm".to_string()));
        manager.push_to_output_queues(2, Some("ppm".to_string()));
        manager.push_to_configuration_queue(3, Some("ppm".to_string()));

        let input_envelope = manager
            .input
            .recv_timeout(Duration::from_millis(200))
            .expect("input dataset envelope");
        assert_eq!(input_envelope.source_worker, "ppm");

        let output_envelope = manager.outputs[0]
            .recv_timeout(Duration::from_millis(200))
            .expect("output dataset envelope");
        assert_eq!(output_envelope.source_worker, "ppm");

        let configuration_envelope = manager
            .configuration
            .recv_timeout(Duration::from_millis(200))
            .expect("configuration dataset envelope");
        assert_eq!(configuration_envelope.source_worker, "ppm");
        assert_eq!(
            configuration_envelope.destination_worker.as_deref(),
            Some(worker_name.as_str())
        );

        manager.terminate();
    }

    #[test]
    fn wait_collects_results_without_panicking() {
        let counter = Arc::new(AtomicUsize::new(0));
        let handler_counter = counter.clone();
        let mut manager = Manager::new(test_config(2), move |item: u32, ctx: &_| {
            handler_counter.fetch_add(item as usize, Ordering::SeqCst);
            let _ = ctx;
        });

        manager.start();
        manager.push_to_input_queue(1, None);
        manager.push_to_input_queue(2, None);
        manager.push_stop_signal(None);

        assert!(manager.wait().is_ok());
    }
}
