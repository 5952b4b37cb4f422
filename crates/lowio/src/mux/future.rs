// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll, Waker};

use super::Completion;

/// State shared between an [`IoFuture`] and its operation record.
///
/// The multiplexer's receiver-invocation path stores the completion and
/// returns the parked waker; the awaiter polls the completed flag. The
/// operation record outlives both the awaiter and the kernel i/o, so a
/// dropped future simply abandons its result.
#[derive(Default)]
pub(super) struct Shared {
    state: Mutex<SharedState>,
}

#[derive(Default)]
struct SharedState {
    completion: Option<Completion>,
    waker: Option<Waker>,
}

impl Shared {
    /// Stores the completion; returns the waker to resume, if a task is
    /// suspended on it.
    pub(super) fn complete(&self, completion: Completion) -> Option<Waker> {
        let mut state = self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        state.completion = Some(completion);
        state.waker.take()
    }
}

/// The awaiter returned by [`Multiplexer::co_read`](super::Multiplexer::co_read)
/// and [`co_write`](super::Multiplexer::co_write).
///
/// Resolves to the operation's [`Completion`]. Someone must drive the
/// multiplexer ([`run`](super::Multiplexer::run)) for the resolution to
/// arrive; the future itself performs no i/o.
pub struct IoFuture {
    shared: Arc<Shared>,
}

impl IoFuture {
    pub(super) fn new(shared: Arc<Shared>) -> Self {
        Self { shared }
    }
}

impl Future for IoFuture {
    type Output = Completion;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut state = self
            .shared
            .state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if let Some(completion) = state.completion.take() {
            return Poll::Ready(completion);
        }
        state.waker = Some(cx.waker().clone());
        Poll::Pending
    }
}

impl std::fmt::Debug for IoFuture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IoFuture").finish_non_exhaustive()
    }
}
