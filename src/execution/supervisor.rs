//! Stub process lifecycle: spawn, initialization handshake, kill, terminate.

use crate::config::STUB_BINARY_NAME;
use crate::error::{Error, Result};
use crate::ipc::codec::{self, ResponseBatch};
use crate::ipc::Rendezvous;
use crate::memory::Arena;
use rustix::process::{kill_process, Pid, Signal};
use std::path::{Path, PathBuf};
use std::process::{Child, Command};
use std::time::Duration;

/// Everything needed to exec one stub process.
pub struct StubLaunchContext<'a> {
    /// Resolved stub executable.
    pub stub_binary: &'a Path,
    /// Path of the model entry file.
    pub model_path: &'a Path,
    /// Arena object name.
    pub region_name: &'a str,
    /// Arena default size, forwarded so the stub attaches with matching
    /// expectations.
    pub default_byte_size: u64,
    /// Arena growth step.
    pub growth_byte_size: u64,
    /// Pid of the host process.
    pub parent_pid: u32,
    /// Directory holding the backend runtime the stub links against.
    pub backend_lib_path: &'a Path,
    /// Activate script of the execution environment, when one is set.
    pub activate_script: Option<&'a Path>,
    /// `lib/` directory of the execution environment, when one is set.
    pub env_lib_dir: Option<&'a Path>,
}

/// Seam for creating the stub process.
pub trait StubLauncher: Send {
    /// Spawn the stub described by `ctx`.
    fn launch(&mut self, ctx: &StubLaunchContext<'_>) -> Result<Child>;
}

/// Compose the shell line the stub is executed with.
///
/// The stub replaces the shell via `exec`, so the child pid is the stub pid.
/// When an execution environment is set, its libraries must be resolved
/// ahead of the system ones and its activate script sourced first.
pub fn compose_stub_command(ctx: &StubLaunchContext<'_>) -> String {
    let mut command = format!(
        "exec {} {} {} {} {} {} {}",
        ctx.stub_binary.display(),
        ctx.model_path.display(),
        ctx.region_name,
        ctx.default_byte_size,
        ctx.growth_byte_size,
        ctx.parent_pid,
        ctx.backend_lib_path.display(),
    );
    if let (Some(activate), Some(lib_dir)) = (ctx.activate_script, ctx.env_lib_dir) {
        command = format!(
            "export LD_LIBRARY_PATH={}:$LD_LIBRARY_PATH; source {} && {}",
            lib_dir.display(),
            activate.display(),
            command,
        );
    }
    command
}

/// Resolve the stub binary, preferring a model-local override.
pub fn resolve_stub_binary(model_repository: &Path, backend_lib_path: &Path) -> PathBuf {
    let local = model_repository.join(STUB_BINARY_NAME);
    if local.exists() {
        local
    } else {
        backend_lib_path.join(STUB_BINARY_NAME)
    }
}

/// Launcher that execs the stub under a shell.
pub struct ProcessLauncher;

impl StubLauncher for ProcessLauncher {
    fn launch(&mut self, ctx: &StubLaunchContext<'_>) -> Result<Child> {
        let command = compose_stub_command(ctx);
        tracing::debug!(command = %command, "starting stub process");
        Command::new("bash")
            .arg("-c")
            .arg(&command)
            .spawn()
            .map_err(|e| Error::StubLost(format!("failed to launch the stub process: {e}")))
    }
}

/// Owns the stub child process and its handshake state.
pub struct StubSupervisor {
    launcher: Box<dyn StubLauncher>,
    child: Option<Child>,
    initialized: bool,
}

impl StubSupervisor {
    /// Create a supervisor around `launcher`.
    pub fn new(launcher: Box<dyn StubLauncher>) -> Self {
        Self { launcher, child: None, initialized: false }
    }

    /// Pid of the running stub, if one exists.
    pub fn pid(&self) -> Option<u32> {
        self.child.as_ref().map(Child::id)
    }

    /// Whether the initialization handshake completed for the current stub.
    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// Spawn the stub and run the initialization handshake.
    ///
    /// The rendezvous primitives are reconstructed in place first so the new
    /// stub finds them in their ground state at the same offsets.
    pub fn start(
        &mut self,
        ctx: &StubLaunchContext<'_>,
        arena: &Arena,
        rendezvous: &Rendezvous,
        init_args: &[(String, String)],
        stub_timeout: Duration,
        instance_name: &str,
    ) -> Result<()> {
        rendezvous.reset_stub_primitives();
        self.initialized = false;
        self.child = Some(self.launcher.launch(ctx)?);

        // Pre-initialization: the stub signals once it has attached the arena.
        if !rendezvous.wait_parent(stub_timeout) {
            self.kill();
            return Err(Error::StubLost(format!(
                "timed out waiting for the stub process; failed to initialize model instance {instance_name}"
            )));
        }

        let init_offset = codec::save_map(arena, init_args)?;
        rendezvous.set_request_batch(init_offset);

        if !rendezvous.notify_stub() || !rendezvous.wait_for_stub() {
            self.kill();
            return Err(Error::StubLost(format!(
                "failed to initialize stub, the stub process exited unexpectedly: {instance_name}"
            )));
        }

        let batch = arena.record_at::<ResponseBatch>(rendezvous.response_batch())?;
        if batch.has_error != 0 {
            let message = if batch.is_error_set != 0 {
                codec::load_string(arena, batch.error)?
            } else {
                "failed to fetch the initialization error reported by the stub".to_string()
            };
            self.kill();
            return Err(Error::ModelBatch(message));
        }

        self.initialized = true;
        Ok(())
    }

    /// SIGKILL the stub and reap it.
    pub fn kill(&mut self) {
        if let Some(mut child) = self.child.take() {
            let _ = child.kill();
            let _ = child.wait();
        }
        self.initialized = false;
    }

    /// SIGTERM the stub and reap it (shutdown path).
    pub fn terminate(&mut self) {
        if let Some(mut child) = self.child.take() {
            let _ = kill_process(Pid::from_child(&child), Signal::TERM);
            let _ = child.wait();
        }
        self.initialized = false;
    }
}
