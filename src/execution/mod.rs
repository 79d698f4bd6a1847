//! Stub lifecycle and the per-batch execution loop.
//!
//! - [`StubSupervisor`]: spawning the stub under a shell (optionally inside
//!   a sourced execution environment), the initialization handshake, and the
//!   kill/terminate paths.
//! - [`ModelInstance`]: owns one arena, one rendezvous and one stub, and
//!   drives the marshal, notify, wait, demux loop.

mod instance;
mod supervisor;

pub use instance::ModelInstance;
pub use supervisor::{
    compose_stub_command, resolve_stub_binary, ProcessLauncher, StubLaunchContext, StubLauncher,
    StubSupervisor,
};
