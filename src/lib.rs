//! # Tandem
//!
//! Host-side runtime that executes user model code in a supervised child
//! process (the "stub") over a shared-memory arena.
//!
//! The host never runs model code itself. It owns the arena, marshals each
//! batch of inference requests into it, wakes the stub through a futex-based
//! cross-process rendezvous, waits for the results, and demultiplexes them
//! back into host responses. If the stub hangs or dies, the host detects it
//! through bounded lock acquisitions and a liveness flag, kills the process,
//! and restarts it in place.
//!
//! ## Architecture
//!
//! - [`memory`]: named POSIX shared-memory regions and the growable bump
//!   [`memory::Arena`] that is the sole data channel between the processes.
//! - [`ipc`]: process-shared mutexes and condition variables, the rendezvous
//!   protocol built on them, and the typed wire codec.
//! - [`execution`]: the stub supervisor (spawn, handshake, kill, restart) and
//!   [`execution::ModelInstance`] with its per-batch execution loop.
//! - [`host`]: traits the enclosing server implements to hand requests in and
//!   receive responses back.
//!
//! ## Quick start
//!
//! ```rust,ignore
//! use tandem::prelude::*;
//!
//! let backend = BackendConfig::from_backend_config(config_json, "/opt/backend")?;
//! let model = ModelSpec::from_config_json("resnet", 1, "/models/resnet", model_config)?;
//! let spec = InstanceSpec { name: "resnet_0".into(), kind: InstanceKind::Cpu, device_id: 0 };
//!
//! let mut instance = ModelInstance::new(model, spec, &backend)?;
//! instance.process_requests(&requests)?;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod config;
pub mod error;
pub mod execution;
pub mod host;
pub mod ipc;
pub mod memory;

/// Prelude for convenient imports.
pub mod prelude {
    pub use crate::config::{BackendConfig, InstanceKind, InstanceSpec, ModelSpec};
    pub use crate::error::{Error, Result};
    pub use crate::execution::ModelInstance;
    pub use crate::host::{DataType, InferenceRequest, InferenceResponse, InputView};
    pub use crate::memory::Arena;
}

pub use error::{Error, Result};
