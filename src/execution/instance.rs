//! One model instance: its arena, its stub, and the per-batch loop.

use super::supervisor::{resolve_stub_binary, ProcessLauncher, StubLaunchContext, StubLauncher, StubSupervisor};
use crate::config::{BackendConfig, InstanceSpec, ModelSpec, MODEL_FILENAME};
use crate::error::{Error, Result};
use crate::host::{BatchTimestamps, InferenceRequest, InferenceResponse, InputView, NoopStats, StatsReporter};
use crate::ipc::codec::{self, Request, RequestBatch, Response, ResponseBatch, Tensor};
use crate::ipc::Rendezvous;
use crate::memory::Arena;
use std::collections::HashSet;
use std::path::PathBuf;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Largest input payload the arena transport accepts per tensor.
const MAX_INPUT_BYTE_SIZE: u64 = i32::MAX as u64;

const STUB_EXITED_MESSAGE: &str = "the stub process has exited unexpectedly";

/// How long the stub gets to prove it is alive before shutdown falls back to
/// SIGTERM, and the slice count bounding the shutdown wait.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(1);
const SHUTDOWN_WAIT_SLICES: u32 = 30;

/// One model instance bound to one stub process.
///
/// Strictly serial: the enclosing server delivers one
/// [`ModelInstance::process_requests`] call at a time per instance. Dropping
/// the instance runs the graceful shutdown protocol, terminates the stub and
/// removes the arena.
pub struct ModelInstance {
    model: ModelSpec,
    instance: InstanceSpec,
    stub_timeout: Duration,
    default_byte_size: u64,
    growth_byte_size: u64,
    model_file: PathBuf,
    stub_binary: PathBuf,
    backend_lib_path: PathBuf,
    activate_script: Option<PathBuf>,
    env_lib_dir: Option<PathBuf>,
    rendezvous: Rendezvous,
    supervisor: StubSupervisor,
    stats: Box<dyn StatsReporter + Send>,
    arena: Arena,
}

impl ModelInstance {
    /// Create an instance and start its stub.
    pub fn new(model: ModelSpec, instance: InstanceSpec, backend: &BackendConfig) -> Result<Self> {
        Self::with_launcher(model, instance, backend, Box::new(ProcessLauncher))
    }

    /// Create an instance with a custom stub launcher.
    pub fn with_launcher(
        model: ModelSpec,
        instance: InstanceSpec,
        backend: &BackendConfig,
        launcher: Box<dyn StubLauncher>,
    ) -> Result<Self> {
        let model_file = model.model_file();
        if !model_file.exists() {
            return Err(Error::Config(format!(
                "{MODEL_FILENAME} does not exist in the model repository: {}",
                model_file.display()
            )));
        }

        let (activate_script, env_lib_dir) = match &model.execution_env {
            Some(env) => {
                let activate = env.join("bin").join("activate");
                if !activate.exists() {
                    return Err(Error::Config(format!(
                        "path {} does not exist; the execution environment must contain an 'activate' script",
                        activate.display()
                    )));
                }
                (Some(activate), Some(env.join("lib")))
            }
            None => (None, None),
        };

        let region_name = instance.shm_region_name();
        let arena = Arena::create(&region_name, backend.shm_default_byte_size, backend.shm_growth_byte_size)?;
        let rendezvous = Rendezvous::new(&arena)?;
        let stub_binary = resolve_stub_binary(&model.repository_path, &backend.backend_lib_path);

        let mut state = Self {
            model,
            instance,
            stub_timeout: backend.stub_timeout,
            default_byte_size: backend.shm_default_byte_size,
            growth_byte_size: backend.shm_growth_byte_size,
            model_file,
            stub_binary,
            backend_lib_path: backend.backend_lib_path.clone(),
            activate_script,
            env_lib_dir,
            rendezvous,
            supervisor: StubSupervisor::new(launcher),
            stats: Box::new(NoopStats),
            arena,
        };
        state.start_stub()?;
        tracing::info!(instance = %state.instance.name, "model instance initialized");
        Ok(state)
    }

    /// Replace the statistics hook.
    pub fn set_stats_reporter(&mut self, stats: Box<dyn StatsReporter + Send>) {
        self.stats = stats;
    }

    /// Pid of the running stub, if one exists.
    pub fn stub_pid(&self) -> Option<u32> {
        self.supervisor.pid()
    }

    fn initialize_args(&self) -> Vec<(String, String)> {
        vec![
            ("model_config".into(), self.model.config_json.clone()),
            ("model_instance_kind".into(), self.instance.kind.as_str().into()),
            ("model_instance_name".into(), self.instance.name.clone()),
            ("model_instance_device_id".into(), self.instance.device_id.to_string()),
            ("model_repository".into(), self.model.repository_path.display().to_string()),
            ("model_version".into(), self.model.version.to_string()),
            ("model_name".into(), self.model.name.clone()),
        ]
    }

    fn start_stub(&mut self) -> Result<()> {
        let region_name = self.instance.shm_region_name();
        let ctx = StubLaunchContext {
            stub_binary: &self.stub_binary,
            model_path: &self.model_file,
            region_name: &region_name,
            default_byte_size: self.default_byte_size,
            growth_byte_size: self.growth_byte_size,
            parent_pid: std::process::id(),
            backend_lib_path: &self.backend_lib_path,
            activate_script: self.activate_script.as_deref(),
            env_lib_dir: self.env_lib_dir.as_deref(),
        };
        let init_args = self.initialize_args();
        self.supervisor.start(
            &ctx,
            &self.arena,
            &self.rendezvous,
            &init_args,
            self.stub_timeout,
            &self.instance.name,
        )
    }

    /// Execute one batch of requests.
    ///
    /// All per-request and whole-batch failures are delivered through the
    /// response handles; the returned error is reserved for conditions that
    /// leave the instance unusable (a broken arena).
    pub fn process_requests<R: InferenceRequest>(&mut self, requests: &[Option<R>]) -> Result<()> {
        let request_count = requests.len();
        if request_count == 0 {
            return Ok(());
        }

        if requests.iter().any(Option::is_none) {
            self.respond_error_to_requests(
                requests,
                &format!("null request given to model instance {}", self.instance.name),
            );
            return Ok(());
        }

        let max_batch_size = u64::from(self.model.max_batch_size);
        let mut total_batch_size = 0u64;
        for request in requests.iter().flatten() {
            if max_batch_size > 0 {
                // The first dimension of input 0 is the batch dimension.
                match request.input(0) {
                    Ok(input) => {
                        total_batch_size += input.shape.first().copied().unwrap_or(0).max(0) as u64;
                    }
                    Err(error) => {
                        self.respond_error_to_requests(requests, &error.to_string());
                        return Ok(());
                    }
                }
            } else {
                total_batch_size += 1;
            }
        }
        if total_batch_size == 0 {
            return Ok(());
        }
        if max_batch_size > 0 && total_batch_size > max_batch_size {
            self.respond_error_to_requests(
                requests,
                &format!(
                    "batch size {total_batch_size} for model {}, max allowed is {max_batch_size}",
                    self.model.name
                ),
            );
            return Ok(());
        }

        tracing::debug!(
            model = %self.model.name,
            instance = %self.instance.name,
            requests = request_count,
            "executing batch"
        );
        let mut timestamps = BatchTimestamps { exec_start_ns: now_ns(), ..Default::default() };
        let batch_watermark = self.arena.watermark();

        let (batch_offset, requests_offset) = codec::alloc_request_batch(&self.arena, request_count as u32)?;
        self.rendezvous.set_request_batch(batch_offset);

        let mut responses: Vec<Option<R::Response>> = Vec::with_capacity(request_count);
        for request in requests.iter().flatten() {
            match request.new_response() {
                Ok(response) => responses.push(Some(response)),
                Err(error) => {
                    tracing::error!("failed to create response: {error}");
                    responses.push(None);
                }
            }
        }

        let empty_id = codec::save_string(&self.arena, "")?;
        for index in 0..request_count {
            let Some(request) = requests[index].as_ref() else { continue };
            let slot_offset = codec::request_offset(requests_offset, index);
            if let Err(error) = self.marshal_request(request, slot_offset) {
                self.send_slot_error(&mut responses, index, &error.to_string());
                // Keep indices aligned for the stub: the failed slot becomes
                // an empty request.
                if let Ok(slot) = self.arena.record_at_mut::<Request>(slot_offset) {
                    *slot = Request {
                        id: empty_id,
                        correlation_id: 0,
                        inputs: 0,
                        requested_output_names: 0,
                        input_count: 0,
                        requested_output_count: 0,
                    };
                }
            }
        }

        if self.supervisor.pid().is_none() {
            self.respond_error_to_all(&mut responses, STUB_EXITED_MESSAGE);
            self.arena.set_watermark(batch_watermark);
            return Ok(());
        }

        timestamps.compute_start_ns = now_ns();

        if !self.rendezvous.notify_stub() || !self.rendezvous.wait_for_stub() {
            self.supervisor.kill();
            tracing::error!(instance = %self.instance.name, "{STUB_EXITED_MESSAGE}");
            match self.start_stub() {
                Ok(()) => tracing::info!("stub process successfully restarted"),
                Err(error) => tracing::error!(
                    model = %self.model.name,
                    "stub process failed to restart; future requests to this model will fail: {error}"
                ),
            }
            self.respond_error_to_all(&mut responses, STUB_EXITED_MESSAGE);
            self.arena.set_watermark(batch_watermark);
            return Ok(());
        }

        timestamps.compute_end_ns = now_ns();

        let batch = match self.arena.record_at::<ResponseBatch>(self.rendezvous.response_batch()) {
            Ok(batch) => batch,
            Err(error) => {
                self.respond_error_to_all(&mut responses, &error.to_string());
                self.arena.set_watermark(batch_watermark);
                return Ok(());
            }
        };
        let (batch_size, has_error, is_error_set, error_offset, responses_offset) =
            (batch.batch_size, batch.has_error, batch.is_error_set, batch.error, batch.responses);

        if has_error != 0 {
            // A batch-level failure at this point usually means a bug in the
            // model code itself.
            let message = if is_error_set != 0 {
                codec::load_string(&self.arena, error_offset)
                    .unwrap_or_else(|_| "failed to fetch the error in the response batch".into())
            } else {
                "failed to fetch the error in the response batch".into()
            };
            self.respond_error_to_all(&mut responses, &message);
            self.arena.set_watermark(batch_watermark);
            return Ok(());
        }

        let mut delivered = vec![false; request_count];
        for index in 0..request_count.min(batch_size as usize) {
            if responses[index].is_none() {
                continue;
            }
            let Some(request) = requests[index].as_ref() else { continue };

            let record_offset = codec::response_offset(responses_offset, index);
            let (has_error, is_error_set, error_offset, output_count, outputs_offset) =
                match self.arena.record_at::<Response>(record_offset) {
                    Ok(record) => (record.has_error, record.is_error_set, record.error, record.output_count, record.outputs),
                    Err(error) => {
                        self.send_slot_error(&mut responses, index, &error.to_string());
                        continue;
                    }
                };

            if has_error != 0 {
                // The response content is not inspected once the error flag
                // is raised, even if outputs were written.
                let message = if is_error_set != 0 {
                    codec::load_string(&self.arena, error_offset)
                        .unwrap_or_else(|_| "failed to process the response".into())
                } else {
                    "failed to process the response".into()
                };
                self.send_slot_error(&mut responses, index, &message);
                continue;
            }

            let outcome = match responses[index].as_mut() {
                Some(response) => self.copy_outputs(request, response, output_count, outputs_offset),
                None => continue,
            };
            match outcome {
                Ok(()) => {
                    if let Some(response) = responses[index].take() {
                        match response.send() {
                            Ok(()) => delivered[index] = true,
                            Err(error) => tracing::error!("failed sending response: {error}"),
                        }
                    }
                }
                Err(error) => self.send_slot_error(&mut responses, index, &error.to_string()),
            }
        }

        timestamps.exec_end_ns = now_ns();

        for (index, success) in delivered.iter().enumerate() {
            self.stats.report_request(index, *success, &timestamps);
        }
        self.stats.report_batch(total_batch_size, &timestamps);

        self.arena.set_watermark(batch_watermark);
        Ok(())
    }

    /// Marshal one request into its shared-memory slot.
    fn marshal_request<R: InferenceRequest>(&self, request: &R, slot_offset: u64) -> Result<()> {
        let input_count = request.input_count();
        let requested_outputs = request.requested_output_names()?;

        let (inputs_offset, _) = self.arena.alloc_records::<Tensor>(input_count)?;
        for index in 0..input_count {
            let input = request.input(index)?;
            let tensor_offset = inputs_offset + (std::mem::size_of::<Tensor>() * index) as u64;
            self.stage_input_tensor(&input, tensor_offset)?;
        }

        let (names_offset, name_slots) = self.arena.alloc_records::<u64>(requested_outputs.len())?;
        for (slot, name) in name_slots.iter_mut().zip(&requested_outputs) {
            *slot = codec::save_string(&self.arena, name)?;
        }

        let id = request.id()?;
        let id_offset = codec::save_string(&self.arena, &id)?;
        let correlation_id = request.correlation_id()?;

        let slot = self.arena.record_at_mut::<Request>(slot_offset)?;
        *slot = Request {
            id: id_offset,
            correlation_id,
            inputs: inputs_offset,
            requested_output_names: names_offset,
            input_count: input_count as u32,
            requested_output_count: requested_outputs.len() as u32,
        };
        Ok(())
    }

    /// Stage one input tensor into the arena, copying every host buffer into
    /// one contiguous host-memory region regardless of where it lives.
    fn stage_input_tensor(&self, input: &InputView<'_>, tensor_offset: u64) -> Result<()> {
        if input.byte_size > MAX_INPUT_BYTE_SIZE {
            return Err(Error::Unsupported(format!(
                "input tensor {} is {} bytes; inputs larger than 2 GiB are not supported, \
                 consider partitioning the input into multiple tensors",
                input.name, input.byte_size
            )));
        }

        let payload = codec::write_tensor_into(
            &self.arena,
            tensor_offset,
            input.name,
            input.dtype,
            &input.shape,
            input.byte_size,
        )?;

        let mut written = 0u64;
        for buffer in &input.buffers {
            if written + buffer.len() as u64 > input.byte_size {
                return Err(Error::Marshal(format!(
                    "input tensor {} buffers exceed the declared byte size {}",
                    input.name, input.byte_size
                )));
            }
            // SAFETY: the payload region is byte_size bytes and
            // written + buffer.len() stays within it.
            unsafe {
                std::ptr::copy_nonoverlapping(
                    buffer.as_ptr(),
                    payload.as_ptr().add(written as usize),
                    buffer.len(),
                );
            }
            written += buffer.len() as u64;
        }
        if written < input.byte_size {
            return Err(Error::Marshal(format!(
                "input tensor {} buffers cover {written} of {} declared bytes",
                input.name, input.byte_size
            )));
        }
        Ok(())
    }

    /// Copy the outputs of one response into the host buffers, dropping
    /// outputs the request did not ask for.
    fn copy_outputs<R: InferenceRequest>(
        &self,
        request: &R,
        response: &mut R::Response,
        output_count: u32,
        outputs_offset: u64,
    ) -> Result<()> {
        let requested: HashSet<String> = request.requested_output_names()?.into_iter().collect();

        let mut pending_transfer = false;
        for index in 0..output_count as usize {
            let tensor_offset = outputs_offset + (std::mem::size_of::<Tensor>() * index) as u64;
            let view = codec::read_tensor(&self.arena, tensor_offset)?;
            if !requested.contains(&view.name) {
                continue;
            }
            let data = codec::tensor_bytes(&self.arena, &view)?;
            pending_transfer |= response.write_output(&view.name, view.dtype, &view.dims, data)?;
        }
        if pending_transfer {
            response.flush_transfers()?;
        }
        Ok(())
    }

    /// Send an error response for every request, creating the handles here.
    /// Used before the per-batch response vector exists.
    fn respond_error_to_requests<R: InferenceRequest>(&self, requests: &[Option<R>], message: &str) {
        for request in requests.iter().flatten() {
            match request.new_response() {
                Ok(response) => {
                    if let Err(error) = response.send_error(message) {
                        tracing::error!("failed to send error response: {error}");
                    }
                }
                Err(error) => tracing::error!("failed to create error response: {error}"),
            }
        }
    }

    /// Fail every still-live response slot with the same message.
    fn respond_error_to_all<Resp: InferenceResponse>(&self, responses: &mut [Option<Resp>], message: &str) {
        tracing::info!(instance = %self.instance.name, "failed to process the batch of requests");
        let message = format!("failed to process the request(s): {message}");
        for slot in responses.iter_mut() {
            if let Some(response) = slot.take() {
                if let Err(error) = response.send_error(&message) {
                    tracing::error!("failed sending response: {error}");
                }
            }
        }
    }

    /// Fail one response slot; the slot is nulled and skipped afterwards.
    fn send_slot_error<Resp: InferenceResponse>(
        &self,
        responses: &mut [Option<Resp>],
        index: usize,
        message: &str,
    ) {
        if let Some(response) = responses[index].take() {
            if let Err(error) = response.send_error(message) {
                tracing::error!("failed to send error response: {error}");
            }
        }
    }

    fn shutdown(&mut self) {
        if self.supervisor.is_initialized() && self.rendezvous.clear_health() {
            // Give a live stub the chance to raise the flag again; its
            // health publisher runs on a sub-second interval.
            std::thread::sleep(SHUTDOWN_GRACE);
            if self.rendezvous.is_stub_alive() {
                self.graceful_shutdown();
            }
        }
        self.supervisor.terminate();
        self.rendezvous.release_parent_lock();
    }

    /// Tell the stub to unload the model and exit: a request batch of size
    /// zero is the shutdown marker.
    fn graceful_shutdown(&mut self) {
        let marker = (|| -> Result<u64> {
            let (offset, batch) = self.arena.alloc_record::<RequestBatch>()?;
            batch.batch_size = 0;
            Ok(offset)
        })();
        let Ok(offset) = marker else { return };

        self.rendezvous.set_request_batch(offset);
        if self.rendezvous.notify_stub() {
            for _ in 0..SHUTDOWN_WAIT_SLICES {
                if self.rendezvous.wait_parent(Duration::from_secs(1)) {
                    break;
                }
                if !self.rendezvous.is_stub_alive() {
                    break;
                }
            }
        }
    }
}

impl Drop for ModelInstance {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn now_ns() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_nanos() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::InstanceKind;
    use crate::host::DataType;
    use crate::ipc::StubRendezvous;
    use std::process::{Child, Command};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::thread::JoinHandle;

    // ---- mock host API ------------------------------------------------

    #[derive(Clone)]
    struct MockTensor {
        name: String,
        dtype: DataType,
        shape: Vec<i64>,
        data: Vec<u8>,
        reported_byte_size: Option<u64>,
    }

    impl MockTensor {
        fn fp32(name: &str, shape: &[i64], data: &[u8]) -> Self {
            Self {
                name: name.into(),
                dtype: DataType::Fp32,
                shape: shape.to_vec(),
                data: data.to_vec(),
                reported_byte_size: None,
            }
        }
    }

    #[derive(Clone, Debug, PartialEq)]
    enum Sent {
        Ok(Vec<(String, DataType, Vec<i64>, Vec<u8>)>),
        Err(String),
    }

    type Sink = Arc<Mutex<Vec<(usize, Sent)>>>;

    struct MockRequest {
        id: String,
        correlation_id: u64,
        inputs: Vec<MockTensor>,
        requested: Vec<String>,
        slot: usize,
        sink: Sink,
    }

    impl MockRequest {
        fn new(slot: usize, sink: &Sink, inputs: Vec<MockTensor>, requested: &[&str]) -> Self {
            Self {
                id: format!("request-{slot}"),
                correlation_id: slot as u64 + 100,
                inputs,
                requested: requested.iter().map(|s| s.to_string()).collect(),
                slot,
                sink: Arc::clone(sink),
            }
        }
    }

    struct MockResponse {
        slot: usize,
        outputs: Vec<(String, DataType, Vec<i64>, Vec<u8>)>,
        sink: Sink,
    }

    impl InferenceRequest for MockRequest {
        type Response = MockResponse;

        fn id(&self) -> Result<String> {
            Ok(self.id.clone())
        }

        fn correlation_id(&self) -> Result<u64> {
            Ok(self.correlation_id)
        }

        fn input_count(&self) -> usize {
            self.inputs.len()
        }

        fn input(&self, index: usize) -> Result<InputView<'_>> {
            let tensor = self
                .inputs
                .get(index)
                .ok_or_else(|| Error::Marshal(format!("no input at index {index}")))?;
            Ok(InputView {
                name: &tensor.name,
                dtype: tensor.dtype,
                shape: tensor.shape.iter().copied().collect(),
                byte_size: tensor.reported_byte_size.unwrap_or(tensor.data.len() as u64),
                buffers: vec![&tensor.data],
            })
        }

        fn requested_output_names(&self) -> Result<Vec<String>> {
            Ok(self.requested.clone())
        }

        fn new_response(&self) -> Result<MockResponse> {
            Ok(MockResponse { slot: self.slot, outputs: Vec::new(), sink: Arc::clone(&self.sink) })
        }
    }

    impl InferenceResponse for MockResponse {
        fn write_output(&mut self, name: &str, dtype: DataType, shape: &[i64], data: &[u8]) -> Result<bool> {
            self.outputs.push((name.into(), dtype, shape.to_vec(), data.to_vec()));
            Ok(false)
        }

        fn send(self) -> Result<()> {
            self.sink.lock().unwrap().push((self.slot, Sent::Ok(self.outputs)));
            Ok(())
        }

        fn send_error(self, message: &str) -> Result<()> {
            self.sink.lock().unwrap().push((self.slot, Sent::Err(message.into())));
            Ok(())
        }
    }

    // ---- in-process stub harness ---------------------------------------
    //
    // The protocol side of a stub, run on a thread attached to the same
    // arena. The launcher pairs it with a placeholder child process so the
    // kill and reap paths exercise real signal delivery.

    #[derive(Clone)]
    enum StubReply {
        /// Copy input j to an output named after requested output j.
        Echo { extra_output: bool },
        /// Mark one response index as failed.
        ErrorAt { index: usize, message: String },
        /// Fail the whole batch.
        BatchError(String),
        /// Stop responding on the first real batch.
        Vanish,
    }

    #[derive(Clone)]
    struct HarnessConfig {
        reply: StubReply,
        health_updates: bool,
        fail_init: Option<String>,
    }

    impl HarnessConfig {
        fn echo() -> Self {
            Self { reply: StubReply::Echo { extra_output: false }, health_updates: true, fail_init: None }
        }
    }

    struct Harness {
        thread: Option<JoinHandle<()>>,
        stop: Arc<AtomicBool>,
        saw_shutdown: Arc<AtomicBool>,
        batches: Arc<AtomicUsize>,
    }

    impl Harness {
        fn spawn(region: String, config: HarnessConfig) -> Self {
            let stop = Arc::new(AtomicBool::new(false));
            let saw_shutdown = Arc::new(AtomicBool::new(false));
            let batches = Arc::new(AtomicUsize::new(0));
            let thread = {
                let stop = Arc::clone(&stop);
                let saw_shutdown = Arc::clone(&saw_shutdown);
                let batches = Arc::clone(&batches);
                std::thread::spawn(move || stub_main(&region, config, &stop, &saw_shutdown, &batches))
            };
            Self { thread: Some(thread), stop, saw_shutdown, batches }
        }

        fn join(mut self) -> (bool, usize) {
            self.stop.store(true, Ordering::Release);
            if let Some(thread) = self.thread.take() {
                let _ = thread.join();
            }
            (self.saw_shutdown.load(Ordering::Acquire), self.batches.load(Ordering::Acquire))
        }
    }

    fn stub_main(
        region: &str,
        config: HarnessConfig,
        stop: &AtomicBool,
        saw_shutdown: &AtomicBool,
        batches: &AtomicUsize,
    ) {
        let arena = Arena::attach(region).expect("harness failed to attach arena");
        let stub = StubRendezvous::attach(&arena).expect("harness failed to attach rendezvous");
        stub.signal_parent();

        let mut initialized = false;
        loop {
            if stop.load(Ordering::Acquire) {
                break;
            }
            let notified = stub.wait_for_work(Duration::from_millis(200));
            if !notified {
                if config.health_updates {
                    stub.set_health(true);
                }
                continue;
            }

            let batch_offset = stub.request_batch();
            if !initialized {
                initialized = true;
                let _args = codec::load_map(&arena, batch_offset).expect("bad init map");
                let reply = match &config.fail_init {
                    Some(message) => codec::write_error_response_batch(&arena, message).unwrap(),
                    None => {
                        let (offset, _) = codec::alloc_response_batch(&arena, 0).unwrap();
                        offset
                    }
                };
                stub.set_health(true);
                stub.set_response_batch(reply);
                stub.signal_parent();
                continue;
            }

            let batch = arena.record_at::<RequestBatch>(batch_offset).unwrap();
            let (batch_size, requests_offset) = (batch.batch_size, batch.requests);
            if batch_size == 0 {
                saw_shutdown.store(true, Ordering::Release);
                stub.signal_parent();
                break;
            }
            batches.fetch_add(1, Ordering::AcqRel);

            if matches!(config.reply, StubReply::Vanish) {
                // A dead stub never unlocks anything; leak the handle so the
                // host sees exactly that.
                std::mem::forget(stub);
                return;
            }
            stub.set_health(true);

            let reply_offset = match &config.reply {
                StubReply::BatchError(message) => codec::write_error_response_batch(&arena, message).unwrap(),
                StubReply::Echo { extra_output } => {
                    echo_batch(&arena, batch_size, requests_offset, *extra_output, None)
                }
                StubReply::ErrorAt { index, message } => {
                    echo_batch(&arena, batch_size, requests_offset, false, Some((*index, message.clone())))
                }
                StubReply::Vanish => unreachable!(),
            };
            stub.set_response_batch(reply_offset);
            stub.signal_parent();
        }
    }

    /// Build an echo response batch: output j of request r carries the bytes
    /// of input j, named after requested output j (or the input itself when
    /// the request asked for fewer outputs than it has inputs).
    fn echo_batch(
        arena: &Arena,
        batch_size: u32,
        requests_offset: u64,
        extra_output: bool,
        error_at: Option<(usize, String)>,
    ) -> u64 {
        let (batch_offset, responses_offset) = codec::alloc_response_batch(arena, batch_size).unwrap();

        for index in 0..batch_size as usize {
            let request = arena
                .record_at::<Request>(codec::request_offset(requests_offset, index))
                .unwrap();
            let (inputs_offset, names_offset, input_count, requested_count) = (
                request.inputs,
                request.requested_output_names,
                request.input_count as usize,
                request.requested_output_count as usize,
            );

            let response = arena
                .record_at_mut::<Response>(codec::response_offset(responses_offset, index))
                .unwrap();

            if let Some((error_index, message)) = &error_at {
                if *error_index == index {
                    response.has_error = 1;
                    response.is_error_set = 1;
                    response.error = codec::save_string(arena, message).unwrap();
                    continue;
                }
            }

            let output_count = input_count + usize::from(extra_output);
            let (outputs_offset, _) = arena.alloc_records::<Tensor>(output_count).unwrap();
            let requested_names = arena.records_at::<u64>(names_offset, requested_count).unwrap().to_vec();

            for j in 0..input_count {
                let input = codec::read_tensor(
                    arena,
                    inputs_offset + (std::mem::size_of::<Tensor>() * j) as u64,
                )
                .unwrap();
                let name = match requested_names.get(j) {
                    Some(offset) => codec::load_string(arena, *offset).unwrap(),
                    None => input.name.clone(),
                };
                let payload = codec::write_tensor_into(
                    arena,
                    outputs_offset + (std::mem::size_of::<Tensor>() * j) as u64,
                    &name,
                    input.dtype,
                    &input.dims,
                    input.byte_size,
                )
                .unwrap();
                let bytes = codec::tensor_bytes(arena, &input).unwrap();
                // SAFETY: source and destination are both byte_size long.
                unsafe {
                    std::ptr::copy_nonoverlapping(bytes.as_ptr(), payload.as_ptr(), bytes.len());
                }
            }

            if extra_output {
                let payload = codec::write_tensor_into(
                    arena,
                    outputs_offset + (std::mem::size_of::<Tensor>() * input_count) as u64,
                    "uninvited_output",
                    DataType::Uint8,
                    &[1],
                    1,
                )
                .unwrap();
                // SAFETY: one byte was reserved.
                unsafe { payload.as_ptr().write(0xFF) };
            }

            let response = arena
                .record_at_mut::<Response>(codec::response_offset(responses_offset, index))
                .unwrap();
            response.outputs = outputs_offset;
            response.output_count = output_count as u32;
        }

        batch_offset
    }

    // ---- test launcher -------------------------------------------------

    enum LaunchPlan {
        /// Spawn a placeholder process and a protocol harness.
        Harness(HarnessConfig),
        /// Spawn a placeholder process only; nothing ever signals.
        Silent,
        /// Fail the spawn itself.
        Fail,
    }

    struct TestLauncher {
        region: String,
        plans: Vec<LaunchPlan>,
        next: usize,
        harnesses: Arc<Mutex<Vec<Harness>>>,
    }

    impl TestLauncher {
        fn new(region: String, plans: Vec<LaunchPlan>) -> (Self, Arc<Mutex<Vec<Harness>>>) {
            let harnesses = Arc::new(Mutex::new(Vec::new()));
            (Self { region, plans, next: 0, harnesses: Arc::clone(&harnesses) }, harnesses)
        }

        fn placeholder_child() -> Result<Child> {
            Command::new("sleep").arg("600").spawn().map_err(Error::from)
        }
    }

    impl StubLauncher for TestLauncher {
        fn launch(&mut self, _ctx: &StubLaunchContext<'_>) -> Result<Child> {
            let plan = self
                .plans
                .get(self.next)
                .ok_or_else(|| Error::StubLost("no launch plan left".into()))?;
            self.next += 1;
            match plan {
                LaunchPlan::Fail => Err(Error::StubLost("stub binary is not runnable".into())),
                LaunchPlan::Silent => Self::placeholder_child(),
                LaunchPlan::Harness(config) => {
                    let harness = Harness::spawn(self.region.clone(), config.clone());
                    self.harnesses.lock().unwrap().push(harness);
                    Self::placeholder_child()
                }
            }
        }
    }

    // ---- fixtures ------------------------------------------------------

    struct Fixture {
        _dir: tempfile::TempDir,
        model: ModelSpec,
        instance: InstanceSpec,
        backend: BackendConfig,
    }

    fn fixture(tag: &str) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let repository = dir.path().join(tag);
        std::fs::create_dir_all(repository.join("1")).unwrap();
        std::fs::write(repository.join("1").join(MODEL_FILENAME), b"").unwrap();

        let model = ModelSpec {
            name: tag.into(),
            version: 1,
            repository_path: repository,
            max_batch_size: 0,
            config_json: "{}".into(),
            execution_env: None,
        };
        let instance = InstanceSpec {
            name: format!("{tag}_{}", std::process::id()),
            kind: InstanceKind::Cpu,
            device_id: 0,
        };
        let backend = BackendConfig {
            shm_default_byte_size: 4 * 1024 * 1024,
            shm_growth_byte_size: 1024 * 1024,
            stub_timeout: Duration::from_secs(5),
            backend_lib_path: dir.path().to_path_buf(),
        };
        Fixture { _dir: dir, model, instance, backend }
    }

    fn start_instance(
        fixture: &Fixture,
        plans: Vec<LaunchPlan>,
    ) -> (Result<ModelInstance>, Arc<Mutex<Vec<Harness>>>) {
        let region = fixture.instance.shm_region_name();
        let (launcher, harnesses) = TestLauncher::new(region, plans);
        let instance = ModelInstance::with_launcher(
            fixture.model.clone(),
            fixture.instance.clone(),
            &fixture.backend,
            Box::new(launcher),
        );
        (instance, harnesses)
    }

    fn join_all(harnesses: &Arc<Mutex<Vec<Harness>>>) -> Vec<(bool, usize)> {
        let mut taken = Vec::new();
        std::mem::swap(&mut taken, &mut *harnesses.lock().unwrap());
        taken.into_iter().map(Harness::join).collect()
    }

    fn sorted(sink: &Sink) -> Vec<(usize, Sent)> {
        let mut sent = sink.lock().unwrap().clone();
        sent.sort_by_key(|(slot, _)| *slot);
        sent
    }

    // ---- scenarios -----------------------------------------------------

    #[test]
    fn test_single_request_echo() {
        let fixture = fixture("echo");
        let (instance, harnesses) = start_instance(&fixture, vec![LaunchPlan::Harness(HarnessConfig::echo())]);
        let mut instance = instance.unwrap();

        let sink: Sink = Arc::new(Mutex::new(Vec::new()));
        let payload = [
            0x00, 0x00, 0x80, 0x3F, // 1.0
            0x00, 0x00, 0x00, 0x40, // 2.0
            0x00, 0x00, 0x40, 0x40, // 3.0
        ];
        let requests = vec![Some(MockRequest::new(
            0,
            &sink,
            vec![MockTensor::fp32("x", &[1, 3], &payload)],
            &["y"],
        ))];

        instance.process_requests(&requests).unwrap();

        let sent = sorted(&sink);
        assert_eq!(sent.len(), 1);
        match &sent[0].1 {
            Sent::Ok(outputs) => {
                assert_eq!(outputs.len(), 1);
                let (name, dtype, shape, data) = &outputs[0];
                assert_eq!(name, "y");
                assert_eq!(*dtype, DataType::Fp32);
                assert_eq!(shape.as_slice(), &[1, 3]);
                assert_eq!(data.as_slice(), &payload);
            }
            other => panic!("expected success, got {other:?}"),
        }

        drop(instance);
        join_all(&harnesses);
    }

    #[test]
    fn test_batch_of_three_middle_fails() {
        let fixture = fixture("midfail");
        let config = HarnessConfig {
            reply: StubReply::ErrorAt { index: 1, message: "bad".into() },
            ..HarnessConfig::echo()
        };
        let (instance, harnesses) = start_instance(&fixture, vec![LaunchPlan::Harness(config)]);
        let mut instance = instance.unwrap();

        let sink: Sink = Arc::new(Mutex::new(Vec::new()));
        let requests: Vec<Option<MockRequest>> = (0..3)
            .map(|slot| {
                Some(MockRequest::new(
                    slot,
                    &sink,
                    vec![MockTensor::fp32("x", &[1], &[0, 0, 0, 0])],
                    &["y"],
                ))
            })
            .collect();

        instance.process_requests(&requests).unwrap();

        // Delivery preserves request order.
        let sent = sink.lock().unwrap().clone();
        assert_eq!(sent.iter().map(|(slot, _)| *slot).collect::<Vec<_>>(), vec![0, 1, 2]);
        assert!(matches!(sent[0].1, Sent::Ok(_)));
        match &sent[1].1 {
            Sent::Err(message) => assert_eq!(message, "bad"),
            other => panic!("expected error, got {other:?}"),
        }
        assert!(matches!(sent[2].1, Sent::Ok(_)));

        drop(instance);
        join_all(&harnesses);
    }

    #[test]
    fn test_unrequested_outputs_are_dropped() {
        let fixture = fixture("filter");
        let config = HarnessConfig {
            reply: StubReply::Echo { extra_output: true },
            ..HarnessConfig::echo()
        };
        let (instance, harnesses) = start_instance(&fixture, vec![LaunchPlan::Harness(config)]);
        let mut instance = instance.unwrap();

        let sink: Sink = Arc::new(Mutex::new(Vec::new()));
        let requests = vec![Some(MockRequest::new(
            0,
            &sink,
            vec![MockTensor::fp32("x", &[1], &[1, 2, 3, 4])],
            &["y"],
        ))];

        instance.process_requests(&requests).unwrap();

        match &sorted(&sink)[0].1 {
            Sent::Ok(outputs) => {
                assert_eq!(outputs.len(), 1);
                assert_eq!(outputs[0].0, "y");
            }
            other => panic!("expected success, got {other:?}"),
        }

        drop(instance);
        join_all(&harnesses);
    }

    #[test]
    fn test_stub_death_mid_batch_then_restart() {
        let fixture = fixture("restart");
        let vanish = HarnessConfig {
            reply: StubReply::Vanish,
            health_updates: false,
            fail_init: None,
        };
        let (instance, harnesses) = start_instance(
            &fixture,
            vec![LaunchPlan::Harness(vanish), LaunchPlan::Harness(HarnessConfig::echo())],
        );
        let mut instance = instance.unwrap();
        let first_pid = instance.stub_pid();

        let sink: Sink = Arc::new(Mutex::new(Vec::new()));
        let requests = vec![
            Some(MockRequest::new(0, &sink, vec![MockTensor::fp32("x", &[1], &[9, 9, 9, 9])], &["y"])),
            Some(MockRequest::new(1, &sink, vec![MockTensor::fp32("x", &[1], &[8, 8, 8, 8])], &["y"])),
        ];
        instance.process_requests(&requests).unwrap();

        let sent = sorted(&sink);
        assert_eq!(sent.len(), 2);
        for (_, outcome) in &sent {
            match outcome {
                Sent::Err(message) => {
                    assert!(message.contains("stub"));
                    assert!(message.contains("exited"));
                }
                other => panic!("expected error, got {other:?}"),
            }
        }

        // The restart swapped in a fresh stub; the next batch succeeds.
        assert!(instance.stub_pid().is_some());
        assert_ne!(instance.stub_pid(), first_pid);

        let sink2: Sink = Arc::new(Mutex::new(Vec::new()));
        let requests2 = vec![Some(MockRequest::new(
            0,
            &sink2,
            vec![MockTensor::fp32("x", &[1], &[7, 7, 7, 7])],
            &["y"],
        ))];
        instance.process_requests(&requests2).unwrap();
        assert!(matches!(sorted(&sink2)[0].1, Sent::Ok(_)));

        drop(instance);
        join_all(&harnesses);
    }

    #[test]
    fn test_stub_death_with_failed_restart_fails_fast() {
        let fixture = fixture("norestart");
        let vanish = HarnessConfig {
            reply: StubReply::Vanish,
            health_updates: false,
            fail_init: None,
        };
        let (instance, harnesses) =
            start_instance(&fixture, vec![LaunchPlan::Harness(vanish), LaunchPlan::Fail]);
        let mut instance = instance.unwrap();

        let sink: Sink = Arc::new(Mutex::new(Vec::new()));
        let requests = vec![Some(MockRequest::new(
            0,
            &sink,
            vec![MockTensor::fp32("x", &[1], &[1, 1, 1, 1])],
            &["y"],
        ))];
        instance.process_requests(&requests).unwrap();
        assert!(matches!(&sorted(&sink)[0].1, Sent::Err(m) if m.contains("exited")));
        assert!(instance.stub_pid().is_none());

        // Subsequent batches fail fast without touching the rendezvous.
        let sink2: Sink = Arc::new(Mutex::new(Vec::new()));
        let requests2 = vec![Some(MockRequest::new(
            0,
            &sink2,
            vec![MockTensor::fp32("x", &[1], &[2, 2, 2, 2])],
            &["y"],
        ))];
        let started = std::time::Instant::now();
        instance.process_requests(&requests2).unwrap();
        assert!(started.elapsed() < Duration::from_secs(1));
        assert!(matches!(&sorted(&sink2)[0].1, Sent::Err(m) if m.contains("exited")));

        drop(instance);
        join_all(&harnesses);
    }

    #[test]
    fn test_init_timeout_leaves_no_stub() {
        let mut fixture = fixture("inittimeout");
        fixture.backend.stub_timeout = Duration::from_secs(1);

        let (instance, harnesses) = start_instance(&fixture, vec![LaunchPlan::Silent]);
        match instance {
            Err(Error::StubLost(message)) => assert!(message.contains("timed out")),
            Err(other) => panic!("expected a stub-lost timeout, got {other}"),
            Ok(_) => panic!("initialization should have timed out"),
        }
        // The placeholder child was killed and reaped inside the error path;
        // nothing is left to join.
        assert!(join_all(&harnesses).is_empty());
    }

    #[test]
    fn test_init_error_from_stub() {
        let fixture = fixture("initerror");
        let config = HarnessConfig { fail_init: Some("missing dependency".into()), ..HarnessConfig::echo() };
        let (instance, harnesses) = start_instance(&fixture, vec![LaunchPlan::Harness(config)]);
        match instance {
            Err(Error::ModelBatch(message)) => assert_eq!(message, "missing dependency"),
            Err(other) => panic!("expected a model error, got {other}"),
            Ok(_) => panic!("initialization should have failed"),
        }
        join_all(&harnesses);
    }

    #[test]
    fn test_oversize_input_is_isolated() {
        let fixture = fixture("oversize");
        let (instance, harnesses) = start_instance(&fixture, vec![LaunchPlan::Harness(HarnessConfig::echo())]);
        let mut instance = instance.unwrap();

        let oversize = MockTensor {
            name: "big".into(),
            dtype: DataType::Uint8,
            shape: vec![1],
            data: Vec::new(),
            reported_byte_size: Some(5 * 1024 * 1024 * 1024 / 2), // 2.5 GiB
        };
        let sink: Sink = Arc::new(Mutex::new(Vec::new()));
        let requests = vec![
            Some(MockRequest::new(0, &sink, vec![MockTensor::fp32("x", &[1], &[5, 5, 5, 5])], &["y"])),
            Some(MockRequest::new(1, &sink, vec![oversize], &["y"])),
        ];

        instance.process_requests(&requests).unwrap();

        let sent = sorted(&sink);
        assert_eq!(sent.len(), 2);
        assert!(matches!(sent[0].1, Sent::Ok(_)));
        match &sent[1].1 {
            Sent::Err(message) => assert!(message.contains("2 GiB")),
            other => panic!("expected error, got {other:?}"),
        }

        drop(instance);
        join_all(&harnesses);
    }

    #[test]
    fn test_batch_level_error_fails_all_uniformly() {
        let fixture = fixture("batcherror");
        let config = HarnessConfig {
            reply: StubReply::BatchError("interpreter crashed".into()),
            ..HarnessConfig::echo()
        };
        let (instance, harnesses) = start_instance(&fixture, vec![LaunchPlan::Harness(config)]);
        let mut instance = instance.unwrap();

        let sink: Sink = Arc::new(Mutex::new(Vec::new()));
        let requests: Vec<Option<MockRequest>> = (0..2)
            .map(|slot| {
                Some(MockRequest::new(
                    slot,
                    &sink,
                    vec![MockTensor::fp32("x", &[1], &[0, 0, 0, 0])],
                    &["y"],
                ))
            })
            .collect();
        instance.process_requests(&requests).unwrap();

        let sent = sorted(&sink);
        assert_eq!(sent.len(), 2);
        for (_, outcome) in &sent {
            assert!(matches!(outcome, Sent::Err(m) if m.contains("interpreter crashed")));
        }

        drop(instance);
        join_all(&harnesses);
    }

    #[test]
    fn test_null_request_fails_every_live_request() {
        let fixture = fixture("nullreq");
        let (instance, harnesses) = start_instance(&fixture, vec![LaunchPlan::Harness(HarnessConfig::echo())]);
        let mut instance = instance.unwrap();

        let sink: Sink = Arc::new(Mutex::new(Vec::new()));
        let requests = vec![
            Some(MockRequest::new(0, &sink, vec![MockTensor::fp32("x", &[1], &[1, 2, 3, 4])], &["y"])),
            None,
        ];
        instance.process_requests(&requests).unwrap();

        let sent = sorted(&sink);
        assert_eq!(sent.len(), 1);
        assert!(matches!(&sent[0].1, Sent::Err(m) if m.contains("null request")));

        drop(instance);
        join_all(&harnesses);
    }

    #[test]
    fn test_batch_size_limit() {
        let mut fixture = fixture("maxbatch");
        fixture.model.max_batch_size = 4;
        let (instance, harnesses) = start_instance(&fixture, vec![LaunchPlan::Harness(HarnessConfig::echo())]);
        let mut instance = instance.unwrap();

        let sink: Sink = Arc::new(Mutex::new(Vec::new()));
        let requests = vec![Some(MockRequest::new(
            0,
            &sink,
            vec![MockTensor::fp32("x", &[8, 1], &[0u8; 32])],
            &["y"],
        ))];
        instance.process_requests(&requests).unwrap();

        assert!(matches!(&sorted(&sink)[0].1, Sent::Err(m) if m.contains("max allowed is 4")));

        drop(instance);
        join_all(&harnesses);
    }

    #[test]
    fn test_graceful_shutdown_sends_zero_batch() {
        let fixture = fixture("shutdown");
        let (instance, harnesses) = start_instance(&fixture, vec![LaunchPlan::Harness(HarnessConfig::echo())]);
        let mut instance = instance.unwrap();

        let sink: Sink = Arc::new(Mutex::new(Vec::new()));
        let requests = vec![Some(MockRequest::new(
            0,
            &sink,
            vec![MockTensor::fp32("x", &[1], &[3, 3, 3, 3])],
            &["y"],
        ))];
        instance.process_requests(&requests).unwrap();

        drop(instance);

        let joined = join_all(&harnesses);
        assert_eq!(joined.len(), 1);
        let (saw_shutdown, batches) = joined[0];
        assert!(saw_shutdown, "the stub never observed the shutdown marker");
        assert_eq!(batches, 1);
    }

    #[test]
    fn test_shutdown_after_zero_batches() {
        let fixture = fixture("idle");
        let (instance, harnesses) = start_instance(&fixture, vec![LaunchPlan::Harness(HarnessConfig::echo())]);
        let instance = instance.unwrap();
        drop(instance);

        let joined = join_all(&harnesses);
        assert_eq!(joined.len(), 1);
        assert!(joined[0].0, "the stub never observed the shutdown marker");
        assert_eq!(joined[0].1, 0);
    }
}
