use crate::{Lod, NodeId, Status};

use parking_lot::{Condvar, Mutex};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, Waker};
use std::time::{Duration, Instant};

/// Identifies one fetch. At most one fetch per key is pending at a time.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct FetchKey {
    pub node: NodeId,
    pub lod: Lod,
}

/// How a fetch ended.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum FetchOutcome {
    Completed { lod: Lod },
    /// The fetch ran out of attempts or hit a corrupt blob. Any previously resident payload is untouched.
    Failed(Status),
    /// No client wanted the LOD any more when it came up for dispatch.
    Cancelled,
    /// By the time the payload was decoded, the node already held this LOD or a finer one.
    Superseded { resident: Lod },
}

#[derive(Default)]
pub(crate) struct Completion {
    state: Mutex<CompletionState>,
    cond: Condvar,
}

#[derive(Default)]
struct CompletionState {
    outcome: Option<FetchOutcome>,
    wakers: Vec<Waker>,
}

impl Completion {
    /// Publishes `outcome` to every waiter. Only the first outcome sticks.
    pub(crate) fn complete(&self, outcome: FetchOutcome) {
        let wakers = {
            let mut state = self.state.lock();
            if state.outcome.is_some() {
                return;
            }
            state.outcome = Some(outcome);
            std::mem::take(&mut state.wakers)
        };
        self.cond.notify_all();
        for waker in wakers {
            waker.wake();
        }
    }
}

/// A requester's view of a pending fetch. Every requester coalesced onto one fetch shares the same completion.
///
/// The handle can be polled with [`try_outcome`](Self::try_outcome), blocked on with [`wait_timeout`](Self::wait_timeout),
/// or `.await`ed.
#[derive(Clone)]
pub struct FetchHandle {
    key: FetchKey,
    completion: Arc<Completion>,
}

impl FetchHandle {
    pub(crate) fn new(key: FetchKey, completion: Arc<Completion>) -> Self {
        Self { key, completion }
    }

    pub fn key(&self) -> FetchKey {
        self.key
    }

    pub fn try_outcome(&self) -> Option<FetchOutcome> {
        self.completion.state.lock().outcome.clone()
    }

    pub fn is_finished(&self) -> bool {
        self.completion.state.lock().outcome.is_some()
    }

    pub fn wait_timeout(&self, timeout: Duration) -> Option<FetchOutcome> {
        let deadline = Instant::now() + timeout;
        let mut state = self.completion.state.lock();
        while state.outcome.is_none() {
            if self.completion.cond.wait_until(&mut state, deadline).timed_out() {
                break;
            }
        }
        state.outcome.clone()
    }
}

impl Future for FetchHandle {
    type Output = FetchOutcome;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut state = self.completion.state.lock();
        if let Some(outcome) = &state.outcome {
            return Poll::Ready(outcome.clone());
        }
        if !state.wakers.iter().any(|w| w.will_wake(cx.waker())) {
            state.wakers.push(cx.waker().clone());
        }
        Poll::Pending
    }
}

// ████████╗███████╗███████╗████████╗
// ╚══██╔══╝██╔════╝██╔════╝╚══██╔══╝
//    ██║   █████╗  ███████╗   ██║
//    ██║   ██╔══╝  ╚════██║   ██║
//    ██║   ███████╗███████║   ██║
//    ╚═╝   ╚══════╝╚══════╝   ╚═╝
