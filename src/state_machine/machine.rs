//! The worker that serializes API calls and events for one camera.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use flume::{Receiver, Sender};
use tracing::{debug, info, warn};

use super::command::{ApiKind, ApiRequest, ApiResult, Command, HalEvent, ResultPayload};
use super::control::CameraControl;
use super::states::{dispatch_api, handler_for, Ctx, State};
use crate::error::{HalError, HalResult};
use crate::pipeline::{CmdKind, CmdThread, CmdWaker, CommandQueue};
use crate::StateMachineConfig;

#[derive(Default)]
struct Queues {
    api: CommandQueue<Command>,
    events: CommandQueue<Command>,
    state: AtomicU8,
    watchers: Mutex<Vec<Sender<State>>>,
}

impl Queues {
    /// API commands first so a stop or release is never starved by events.
    fn next(&self) -> Option<Command> {
        self.api.dequeue().or_else(|| self.events.dequeue())
    }

    fn publish(&self, state: State) {
        self.state.store(state as u8, Ordering::SeqCst);
        lock(&self.watchers).retain(|w| w.send(state).is_ok());
    }
}

/// Cloneable event-only handle for driver, stream and encoder callbacks.
/// It cannot submit API requests, so callback chains never block on the worker.
#[derive(Clone)]
pub struct EventSender {
    queues: Arc<Queues>,
    waker: CmdWaker,
}

impl EventSender {
    pub fn submit_event(&self, event: HalEvent) -> HalResult<()> {
        self.queues.events.enqueue(Command::Event(event));
        self.waker.send(CmdKind::DoNextJob)
    }
}

pub struct StateMachine {
    queues: Arc<Queues>,
    waker: CmdWaker,
    thread: Mutex<Option<CmdThread>>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|p| p.into_inner())
}

fn shutdown_result(request: ApiKind) -> ApiResult {
    ApiResult {
        request,
        status: Err(HalError::Shutdown),
        payload: ResultPayload::None,
    }
}

impl StateMachine {
    /// Start the worker in `PreviewStopped`. It owns `control` from now on.
    pub fn new(mut control: Box<dyn CameraControl>, policy: StateMachineConfig) -> HalResult<Self> {
        let queues = Arc::new(Queues::default());
        let worker = queues.clone();
        let mut state = State::PreviewStopped;

        let thread = CmdThread::launch("cam-state-machine", move |cmd| match cmd {
            CmdKind::DoNextJob => {
                let Some(command) = worker.next() else {
                    return;
                };
                let mut ctx = Ctx {
                    control: control.as_mut(),
                    policy,
                };
                state = run(&mut ctx, &worker, state, command);
            }
            CmdKind::Exit => {
                // anyone still waiting gets an answer
                for cmd in worker.api.flush() {
                    if let Command::Api { request, reply } = cmd {
                        let _ = reply.send(shutdown_result(request.kind()));
                    }
                }
                let dropped = worker.events.flush().len();
                if dropped > 0 {
                    debug!(dropped, "Dropped pending events on exit");
                }
            }
        })?;

        Ok(Self {
            queues,
            waker: thread.waker(),
            thread: Mutex::new(Some(thread)),
        })
    }

    /// Queue `request` and wait for its result. Never called from callback chains.
    pub fn submit_api(&self, request: ApiRequest) -> ApiResult {
        let kind = request.kind();
        match self.submit_api_async(request) {
            Ok(rx) => rx.recv().unwrap_or_else(|_| shutdown_result(kind)),
            Err(_) => shutdown_result(kind),
        }
    }

    /// Queue `request`; the result arrives on the returned receiver.
    pub fn submit_api_async(&self, request: ApiRequest) -> HalResult<Receiver<ApiResult>> {
        let (reply, rx) = flume::bounded(1);
        self.queues.api.enqueue(Command::Api { request, reply });
        if let Err(e) = self.waker.send(CmdKind::DoNextJob) {
            self.queues.api.flush();
            return Err(e);
        }
        Ok(rx)
    }

    /// Queue `event` and return at once; the worker owns it from here.
    pub fn submit_event(&self, event: HalEvent) -> HalResult<()> {
        self.event_sender().submit_event(event)
    }

    pub fn event_sender(&self) -> EventSender {
        EventSender {
            queues: self.queues.clone(),
            waker: self.waker.clone(),
        }
    }

    pub fn state(&self) -> State {
        State::from_u8(self.queues.state.load(Ordering::SeqCst))
    }

    pub fn is_preview_running(&self) -> bool {
        self.state().is_preview_running()
    }

    /// Every state entered from now on, in order.
    pub fn watch_states(&self) -> Receiver<State> {
        let (tx, rx) = flume::unbounded();
        lock(&self.queues.watchers).push(tx);
        rx
    }

    /// Let the worker finish what is queued, then join it.
    pub fn shutdown(&self) {
        if let Some(mut t) = lock(&self.thread).take() {
            t.exit();
        }
    }
}

impl Drop for StateMachine {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Handle one command. A transition is published before the caller sees its
/// result, so `state()` already agrees with a returned status.
fn run(ctx: &mut Ctx<'_>, queues: &Queues, state: State, command: Command) -> State {
    let handler = handler_for(state);
    let (step, reply) = match command {
        Command::Api { request, reply } => {
            let kind = request.kind();
            metrics::counter!("camhal_api_calls_total", "api" => format!("{kind:?}")).increment(1);
            debug!(?request, ?state, "API request");
            let step = dispatch_api(handler, ctx, request);
            if let Err(e) = &step.status {
                warn!(?kind, ?state, "API request failed: {}", e);
            }
            (step, Some((kind, reply)))
        }
        Command::Event(event) => {
            debug!(?event, ?state, "Event");
            let step = handler.on_event(ctx, event);
            if let Err(e) = &step.status {
                warn!(?state, "Event handling failed: {}", e);
            }
            (step, None)
        }
    };

    let next = match step.next {
        Some(next) if next != state => {
            info!(from = ?state, to = ?next, "State transition");
            queues.publish(next);
            next
        }
        _ => state,
    };

    if let Some((kind, reply)) = reply {
        let result = ApiResult {
            request: kind,
            status: step.status,
            payload: step.payload,
        };
        if reply.send(result).is_err() {
            debug!(?kind, "Caller went away before the result");
        }
    }
    next
}
