use crate::{
    error::ChartQaError,
    model::{GenerationRequest, GenerationResult, InferenceModel, ModelInfo},
};
use std::{
    any::Any,
    panic::{AssertUnwindSafe, catch_unwind},
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicU64, Ordering},
        mpsc,
    },
    thread::JoinHandle,
    time::{Duration, Instant},
};
use tokio::sync::oneshot;

/// Represents the current state of the inference engine.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EngineState {
    /// Waiting for the next generation.
    Idle,
    /// A generation is running on the worker.
    Processing,
    /// The worker thread has exited.
    Stopped,
}

impl EngineState {
    /// Returns the state as a string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            EngineState::Idle => "idle",
            EngineState::Processing => "processing",
            EngineState::Stopped => "stopped",
        }
    }
}

type Reply = oneshot::Sender<Result<GenerationResult, String>>;

struct EngineJob {
    id: u64,
    request: GenerationRequest,
    reply: Reply,
}

/// Serializes generations against a single model on a dedicated worker thread.
///
/// The model is moved onto the worker when the engine is created and never
/// leaves it, so at most one generation is in flight at any time. Callers are
/// queued in arrival order and wait, bounded by the optional timeout, for
/// their turn. A timed-out caller's queued job is skipped; a generation that
/// already started runs to completion.
pub struct InferenceEngine {
    info: ModelInfo,
    state: Arc<Mutex<EngineState>>,
    req_tx: Option<mpsc::Sender<EngineJob>>,
    inference_handle: Option<JoinHandle<()>>,
    id_counter: AtomicU64,
    timeout: Option<Duration>,
}

impl InferenceEngine {
    /// Moves `model` onto a new worker thread.
    pub fn new<M>(model: M, timeout: Option<Duration>) -> Self
    where
        M: InferenceModel + Send + 'static,
    {
        let info = model.info();
        let (req_tx, req_rx) = mpsc::channel::<EngineJob>();
        let state = Arc::new(Mutex::new(EngineState::Idle));

        let inference_handle = std::thread::spawn({
            let state = state.clone();
            let mut model = model;
            move || {
                while let Ok(job) = req_rx.recv() {
                    if job.reply.is_closed() {
                        log::debug!("Skipping inference {}: caller no longer waiting", job.id);
                        continue;
                    }

                    log::debug!("Running inference {}", job.id);
                    set_state(&state, EngineState::Processing);
                    let start_time = Instant::now();

                    // the kv cache is reset at the start of every generation, so a
                    // panicking job leaves nothing behind for the next one
                    let outcome = match catch_unwind(AssertUnwindSafe(|| model.generate(job.request))) {
                        Ok(result) => result.map_err(|err| err.to_string()),
                        Err(payload) => {
                            let message = panic_message(payload.as_ref());
                            log::error!("Inference {} panicked: {message}", job.id);
                            Err(format!("backend panicked: {message}"))
                        }
                    };

                    log::debug!(
                        "Inference {} finished in {:.2}s",
                        job.id,
                        start_time.elapsed().as_secs_f64()
                    );
                    set_state(&state, EngineState::Idle);

                    if job.reply.send(outcome).is_err() {
                        log::warn!("Inference {} completed after its caller gave up", job.id);
                    }
                }
                set_state(&state, EngineState::Stopped);
            }
        });

        Self {
            info,
            state,
            req_tx: Some(req_tx),
            inference_handle: Some(inference_handle),
            id_counter: AtomicU64::new(0),
            timeout,
        }
    }

    pub fn info(&self) -> &ModelInfo {
        &self.info
    }

    /// Whether the worker thread is alive and accepting jobs.
    pub fn is_running(&self) -> bool {
        self.req_tx.is_some()
            && self
                .inference_handle
                .as_ref()
                .is_some_and(|handle| !handle.is_finished())
    }

    /// Returns the current state of the inference engine.
    pub fn state(&self) -> EngineState {
        if !self.is_running() {
            return EngineState::Stopped;
        }
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queues a generation and waits for its result.
    pub async fn generate(
        &self,
        request: GenerationRequest,
    ) -> Result<GenerationResult, ChartQaError> {
        let tx = self
            .req_tx
            .as_ref()
            .ok_or_else(|| ChartQaError::ModelNotReady("inference engine is stopped".into()))?;

        let id = self.id_counter.fetch_add(1, Ordering::Relaxed);
        let (reply, response) = oneshot::channel();
        tx.send(EngineJob { id, request, reply })
            .map_err(|_| ChartQaError::ModelNotReady("inference worker is not running".into()))?;
        log::debug!("Scheduled inference {id}");

        let outcome = match self.timeout {
            Some(limit) => tokio::time::timeout(limit, response).await.map_err(|_| {
                ChartQaError::Generation(format!(
                    "generation timed out after {:.1}s",
                    limit.as_secs_f64()
                ))
            })?,
            None => response.await,
        };

        match outcome {
            Ok(Ok(result)) => Ok(result),
            Ok(Err(message)) => Err(ChartQaError::Generation(message)),
            Err(_) => Err(ChartQaError::ModelNotReady(
                "inference worker stopped before replying".into(),
            )),
        }
    }

    /// Stops the inference engine and shuts down the background thread.
    ///
    /// Jobs already queued are still processed before the thread exits.
    pub fn stop(&mut self) {
        self.req_tx.take();
        if let Some(handle) = self.inference_handle.take() {
            if handle.join().is_err() {
                log::error!("Inference worker panicked");
            }
        }
    }
}

impl Drop for InferenceEngine {
    fn drop(&mut self) {
        self.stop();
    }
}

fn set_state(state: &Mutex<EngineState>, next: EngineState) {
    *state.lock().unwrap_or_else(PoisonError::into_inner) = next;
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
