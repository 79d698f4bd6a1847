//! Cross-process coordination for Tandem.
//!
//! Everything the host and the stub share beyond raw bytes lives here:
//!
//! - [`SharedMutex`] / [`SharedCondvar`]: futex-backed primitives with a
//!   stable `repr(C)` layout so they can be placed inside the arena and
//!   driven from both processes.
//! - [`Rendezvous`] / [`StubRendezvous`]: the two mutex/condition pairs plus
//!   the liveness flag that serialize one stub execution at a time and
//!   detect a hung or dead peer.
//! - [`codec`]: the typed wire records (batches, tensors, strings, maps)
//!   written into the arena.

pub mod codec;
mod rendezvous;
mod sync;

pub use rendezvous::{IpcMessage, Rendezvous, RendezvousBlock, StubRendezvous};
pub use sync::{SharedCondvar, SharedMutex};
