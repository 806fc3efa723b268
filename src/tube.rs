//! The tube pipeline: composable, cloneable, bidirectional processing stages.
//!
//! A tube never calls its successor directly. It returns a [`NextAction`] and a
//! [`Fiber`] drives the chain: requests flow head to tail, the tail produces a
//! response, and every tube that asked to `Invoke` its successor sees the
//! response (or exception) on the way back.

use crate::error::{Result, RuntimeError};
use crate::packet::Packet;
use parking_lot::Mutex;
use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::debug;

/// Shared handle to a tube.
pub type TubeRef = Arc<Mutex<dyn Tube>>;

/// Wrap a tube into a [`TubeRef`].
pub fn tube_ref<T: Tube + 'static>(tube: T) -> TubeRef {
    Arc::new(Mutex::new(tube))
}

/// What the fiber should do after a tube ran.
pub enum NextAction {
    /// Pass the packet to `next` and come back with its response.
    Invoke { next: TubeRef, packet: Packet },
    /// Pass the packet to `next`; this tube does not see the response.
    InvokeAndForget { next: TubeRef, packet: Packet },
    /// Turn around with a response.
    Return(Packet),
    /// Turn around with an error.
    Throw(RuntimeError),
}

impl NextAction {
    pub fn invoke(next: &TubeRef, packet: Packet) -> Self {
        Self::Invoke {
            next: Arc::clone(next),
            packet,
        }
    }

    pub fn invoke_and_forget(next: &TubeRef, packet: Packet) -> Self {
        Self::InvokeAndForget {
            next: Arc::clone(next),
            packet,
        }
    }

    pub fn ret(packet: Packet) -> Self {
        Self::Return(packet)
    }

    pub fn throw(error: impl Into<RuntimeError>) -> Self {
        Self::Throw(error.into())
    }
}

impl fmt::Debug for NextAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Invoke { .. } => f.write_str("Invoke"),
            Self::InvokeAndForget { .. } => f.write_str("InvokeAndForget"),
            Self::Return(_) => f.write_str("Return"),
            Self::Throw(e) => write!(f, "Throw({})", e),
        }
    }
}

/// A processing stage.
pub trait Tube: Send {
    /// Short name used in logs.
    fn name(&self) -> &'static str;

    fn process_request(&mut self, packet: Packet) -> NextAction;

    fn process_response(&mut self, packet: Packet) -> NextAction {
        NextAction::Return(packet)
    }

    /// Errors pass through unmodified unless a tube overrides this.
    fn process_exception(&mut self, error: RuntimeError) -> NextAction {
        NextAction::Throw(error)
    }

    /// Release resources. Called once when the owning pipeline closes.
    fn pre_destroy(&mut self) {}

    /// Produce a copy of this tube (and, through `cloner`, its successors).
    fn copy(&self, cloner: &mut TubeCloner) -> TubeRef;

    /// Stateless tubes may be shared between clones instead of copied.
    fn shareable(&self) -> bool {
        false
    }

    /// The successor, if any.
    fn next(&self) -> Option<TubeRef> {
        None
    }
}

fn identity<T: ?Sized>(arc: &Arc<T>) -> usize {
    Arc::as_ptr(arc) as *const () as usize
}

/// Copies a tube chain, copying every tube at most once.
///
/// Tubes reachable through more than one path map to the same copy, and
/// per-chain state objects registered through [`TubeCloner::copy_state`] are
/// replaced by one fresh instance shared by all copies that referred to the
/// original.
#[derive(Default)]
pub struct TubeCloner {
    tubes: HashMap<usize, TubeRef>,
    states: HashMap<usize, Box<dyn Any + Send>>,
}

impl TubeCloner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy a whole chain starting at `head`.
    pub fn clone_chain(head: &TubeRef) -> TubeRef {
        TubeCloner::new().copy(head)
    }

    /// Copy of `tube`; repeated calls with the same tube return the same copy.
    pub fn copy(&mut self, tube: &TubeRef) -> TubeRef {
        let key = identity(tube);
        if let Some(existing) = self.tubes.get(&key) {
            return Arc::clone(existing);
        }
        let copy = {
            let guard = tube.lock();
            if guard.shareable() {
                Arc::clone(tube)
            } else {
                guard.copy(self)
            }
        };
        self.tubes.insert(key, Arc::clone(&copy));
        copy
    }

    /// Fresh replacement for a shared state object.
    pub fn copy_state<T, F>(&mut self, state: &Arc<Mutex<T>>, fresh: F) -> Arc<Mutex<T>>
    where
        T: Send + 'static,
        F: FnOnce() -> T,
    {
        let key = identity(state);
        if let Some(existing) = self
            .states
            .get(&key)
            .and_then(|s| s.downcast_ref::<Arc<Mutex<T>>>())
        {
            return Arc::clone(existing);
        }
        let copy = Arc::new(Mutex::new(fresh()));
        self.states.insert(key, Box::new(Arc::clone(&copy)));
        copy
    }
}

/// Observable fiber state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FiberState {
    Idle,
    ProcessingRequest,
    ProcessingResponse,
    Closed,
}

enum Pending {
    Request(TubeRef, Packet),
    Response(Packet),
    Exception(RuntimeError),
}

/// Runs one exchange through a chain as an explicit trampoline.
pub struct Fiber {
    head: TubeRef,
    state: FiberState,
    stack: Vec<TubeRef>,
}

impl Fiber {
    pub fn new(head: TubeRef) -> Self {
        Self {
            head,
            state: FiberState::Idle,
            stack: Vec::new(),
        }
    }

    pub fn state(&self) -> FiberState {
        self.state
    }

    /// Drive `packet` through the chain to completion.
    pub fn run(&mut self, packet: Packet) -> Result<Packet> {
        if self.state == FiberState::Closed {
            return Err(RuntimeError::PipelineClosed);
        }
        self.stack.clear();
        let mut pending = Pending::Request(Arc::clone(&self.head), packet);

        loop {
            pending = match pending {
                Pending::Request(tube, packet) => {
                    self.state = FiberState::ProcessingRequest;
                    let action = tube.lock().process_request(packet);
                    self.follow(tube, action)
                }
                Pending::Response(packet) => {
                    self.state = FiberState::ProcessingResponse;
                    match self.stack.pop() {
                        None => {
                            self.state = FiberState::Idle;
                            return Ok(packet);
                        }
                        Some(tube) => {
                            let action = tube.lock().process_response(packet);
                            self.follow(tube, action)
                        }
                    }
                }
                Pending::Exception(error) => {
                    self.state = FiberState::ProcessingResponse;
                    match self.stack.pop() {
                        None => {
                            self.state = FiberState::Idle;
                            return Err(error);
                        }
                        Some(tube) => {
                            let action = tube.lock().process_exception(error);
                            self.follow(tube, action)
                        }
                    }
                }
            };
        }
    }

    fn follow(&mut self, current: TubeRef, action: NextAction) -> Pending {
        match action {
            NextAction::Invoke { next, packet } => {
                self.stack.push(current);
                Pending::Request(next, packet)
            }
            NextAction::InvokeAndForget { next, packet } => Pending::Request(next, packet),
            NextAction::Return(packet) => Pending::Response(packet),
            NextAction::Throw(error) => Pending::Exception(error),
        }
    }

    pub fn close(&mut self) {
        self.stack.clear();
        self.state = FiberState::Closed;
    }
}

/// Call `pre_destroy` once on every tube reachable from `heads`.
fn destroy_chains<'a>(heads: impl IntoIterator<Item = &'a TubeRef>) {
    let mut visited = HashSet::new();
    for head in heads {
        let mut current = Some(Arc::clone(head));
        while let Some(tube) = current {
            if !visited.insert(identity(&tube)) {
                break;
            }
            let mut guard = tube.lock();
            debug!(tube = guard.name(), "Destroying tube");
            guard.pre_destroy();
            current = guard.next();
        }
    }
}

/// A template chain, built once and forked per use.
pub struct Pipeline {
    head: TubeRef,
    closed: AtomicBool,
}

impl Pipeline {
    pub fn new(head: TubeRef) -> Self {
        Self {
            head,
            closed: AtomicBool::new(false),
        }
    }

    pub fn head(&self) -> &TubeRef {
        &self.head
    }

    /// An independent copy of the chain.
    pub fn fork(&self) -> Result<TubeRef> {
        if self.is_closed() {
            return Err(RuntimeError::PipelineClosed);
        }
        Ok(TubeCloner::clone_chain(&self.head))
    }

    /// Run one exchange on a fresh fork.
    pub fn process(&self, packet: Packet) -> Result<Packet> {
        let head = self.fork()?;
        Fiber::new(head).run(packet)
    }

    /// Destroy the template. Later forks fail with `PipelineClosed`.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            destroy_chains([&self.head]);
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// Reuses forked chains across invocations.
pub struct TubePool {
    pipeline: Pipeline,
    idle: Mutex<Vec<TubeRef>>,
}

impl TubePool {
    pub fn new(head: TubeRef) -> Self {
        Self {
            pipeline: Pipeline::new(head),
            idle: Mutex::new(Vec::new()),
        }
    }

    /// An idle chain, or a new fork when none is available.
    pub fn take(&self) -> Result<TubeRef> {
        if self.pipeline.is_closed() {
            return Err(RuntimeError::PipelineClosed);
        }
        if let Some(tube) = self.idle.lock().pop() {
            return Ok(tube);
        }
        debug!("Forking new tube chain");
        self.pipeline.fork()
    }

    /// Return a chain taken from this pool.
    pub fn recycle(&self, tube: TubeRef) {
        if self.pipeline.is_closed() {
            destroy_chains([&tube]);
        } else {
            self.idle.lock().push(tube);
        }
    }

    /// Run one exchange on a pooled chain.
    pub fn process(&self, packet: Packet) -> Result<Packet> {
        let head = self.take()?;
        let result = Fiber::new(Arc::clone(&head)).run(packet);
        self.recycle(head);
        result
    }

    pub fn idle_count(&self) -> usize {
        self.idle.lock().len()
    }

    pub fn close(&self) {
        if self.pipeline.is_closed() {
            return;
        }
        let idle: Vec<TubeRef> = std::mem::take(&mut *self.idle.lock());
        self.pipeline.closed.store(true, Ordering::SeqCst);
        destroy_chains(std::iter::once(&self.pipeline.head).chain(idle.iter()));
    }

    pub fn is_closed(&self) -> bool {
        self.pipeline.is_closed()
    }
}
