//! A worker-pool process manager for batch processing.
//!
//! A [`manager::Manager`] owns one input channel, one configuration channel,
//! and one or more output channels, and hands out [`worker::WorkerHandle`]s
//! that all share them. Workers run as dedicated OS threads rather than
//! literal child processes (see `DESIGN.md` for why), but the envelope-based
//! wire shape, the worker life cycle, and the manager's dispatch policies
//! mirror a true multi-process pool closely enough that switching the
//! transport underneath would not change this crate's public surface.
//!
//! ```rust,no_run
//! use ppm::{ManagerConfig, Manager};
//!
//! let mut manager = Manager::new(
//!     ManagerConfig::new().max_workers(2),
//!     |item: u32, ctx: &ppm::WorkerContext<u32>| {
//!         ctx.push_to_output_queues(item * 2);
//!     },
//! );
//!
//! manager.start();
//! manager.push_to_input_queue(21, None);
//! manager.push_stop_signal(None);
//! manager.wait().unwrap();
//! ```

mod channel;
mod config;
mod envelope;
mod error;
mod exit_event;
mod manager;
mod panic;
mod worker;

pub use channel::Channel;
pub use config::{default_cpu_count, ExtraValue, ManagerConfig, WorkerOptions, STD_NAME};
pub use envelope::{ControlToken, Envelope, Payload};
pub use error::{ManagerError, WorkerException};
pub use exit_event::ExitEvent;
pub use manager::Manager;
pub use panic::WorkerPanic;
pub use worker::{WorkerContext, WorkerHandle, WorkerLogic, WorkerState};
