//! Shared consumption of one streamed model response.
//!
//! A raw provider stream can only be polled once, but an agent turn needs
//! several views of it: the UI wants fragments as they arrive, history wants
//! the final concatenation, the dispatch loop wants fully assembled tool
//! calls, and the usage tracker wants the terminal token counts.
//! `StreamingCompletion` drives the upstream exactly once and fans the
//! results out to any number of subscribers, replaying accumulated history
//! to late ones.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::StreamExt;
use tokio::sync::{mpsc, watch};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::error::Error;
use crate::message::{StreamChunk, ToolCall, Usage};
use crate::provider::StreamResult;

type Subscriber = mpsc::UnboundedSender<Result<String, Error>>;

/// Tool call under assembly. Every field is appended across fragments; the
/// call must not be dispatched before the stream ends.
#[derive(Default)]
struct PartialToolCall {
    id: String,
    name: String,
    arguments: String,
}

struct StreamState {
    /// Each non-empty content fragment, in arrival order.
    fragments: Vec<String>,
    /// Running concatenation of `fragments`.
    content: String,
    tool_calls: Vec<PartialToolCall>,
    usage: Option<Usage>,
    finished: bool,
    error: Option<Error>,
    fragment_subs: Vec<Subscriber>,
    content_subs: Vec<Subscriber>,
}

struct Inner {
    state: Mutex<StreamState>,
    done_tx: watch::Sender<bool>,
    done_rx: watch::Receiver<bool>,
}

impl Inner {
    fn lock_state(&self) -> MutexGuard<'_, StreamState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn apply(&self, chunk: StreamChunk) {
        let mut state = self.lock_state();
        if state.finished {
            return;
        }
        match chunk {
            StreamChunk::Start { model } => {
                trace!(model = %model, "completion stream opened");
            }
            StreamChunk::Delta { content } => {
                if content.is_empty() {
                    return;
                }
                state.content.push_str(&content);
                state.fragments.push(content.clone());
                let running = state.content.clone();
                state
                    .fragment_subs
                    .retain(|tx| tx.send(Ok(content.clone())).is_ok());
                state
                    .content_subs
                    .retain(|tx| tx.send(Ok(running.clone())).is_ok());
            }
            StreamChunk::ToolCallStart { index, id, name } => {
                ensure_entry(&mut state.tool_calls, index);
                let entry = &mut state.tool_calls[index];
                entry.id.push_str(&id);
                entry.name.push_str(&name);
            }
            StreamChunk::ToolCallDelta { index, arguments } => {
                ensure_entry(&mut state.tool_calls, index);
                state.tool_calls[index].arguments.push_str(&arguments);
            }
            StreamChunk::Done { usage } => {
                state.usage = usage;
            }
        }
    }

    /// Close out normally. Idempotent; later calls are no-ops.
    fn finish(&self) {
        let mut state = self.lock_state();
        if state.finished {
            return;
        }
        state.finished = true;
        state.fragment_subs.clear();
        state.content_subs.clear();
        drop(state);
        let _ = self.done_tx.send(true);
    }

    /// Close out with a terminal error, delivered to every live subscriber
    /// exactly once. Accumulated content stays readable.
    fn fail(&self, error: Error) {
        let mut state = self.lock_state();
        if state.finished {
            return;
        }
        state.finished = true;
        state.error = Some(error.clone());
        for tx in state.fragment_subs.drain(..) {
            let _ = tx.send(Err(error.clone()));
        }
        for tx in state.content_subs.drain(..) {
            let _ = tx.send(Err(error.clone()));
        }
        drop(state);
        let _ = self.done_tx.send(true);
    }
}

fn ensure_entry(calls: &mut Vec<PartialToolCall>, index: usize) {
    while calls.len() <= index {
        calls.push(PartialToolCall::default());
    }
}

/// One model response, consumable by many subscribers.
///
/// Cloning is cheap and every clone observes the same underlying stream.
#[derive(Clone)]
pub struct StreamingCompletion {
    inner: Arc<Inner>,
}

impl StreamingCompletion {
    /// Take ownership of a raw provider stream and start draining it.
    /// Tripping `cancel` mid-stream terminates every view with
    /// [`Error::Cancelled`].
    pub fn new(upstream: StreamResult, cancel: CancellationToken) -> Self {
        let (done_tx, done_rx) = watch::channel(false);
        let inner = Arc::new(Inner {
            state: Mutex::new(StreamState {
                fragments: Vec::new(),
                content: String::new(),
                tool_calls: Vec::new(),
                usage: None,
                finished: false,
                error: None,
                fragment_subs: Vec::new(),
                content_subs: Vec::new(),
            }),
            done_tx,
            done_rx,
        });

        let driver = inner.clone();
        tokio::spawn(async move {
            let mut upstream = upstream;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        driver.fail(Error::Cancelled);
                        break;
                    }
                    item = upstream.next() => match item {
                        Some(Ok(chunk)) => {
                            let is_done = matches!(chunk, StreamChunk::Done { .. });
                            driver.apply(chunk);
                            if is_done {
                                driver.finish();
                                break;
                            }
                        }
                        Some(Err(e)) => {
                            driver.fail(e);
                            break;
                        }
                        None => {
                            driver.finish();
                            break;
                        }
                    }
                }
            }
        });

        Self { inner }
    }

    /// Each non-empty content fragment verbatim, in arrival order. A late
    /// subscriber first receives every fragment seen so far.
    pub fn incremental_content(&self) -> UnboundedReceiverStream<Result<String, Error>> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.inner.lock_state();
        for fragment in &state.fragments {
            let _ = tx.send(Ok(fragment.clone()));
        }
        if let Some(error) = &state.error {
            let _ = tx.send(Err(error.clone()));
        } else if !state.finished {
            state.fragment_subs.push(tx);
        }
        UnboundedReceiverStream::new(rx)
    }

    /// The running concatenation, emitted once per fragment. The last value
    /// equals the concatenation of everything `incremental_content` emitted.
    pub fn running_content(&self) -> UnboundedReceiverStream<Result<String, Error>> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.inner.lock_state();
        let mut running = String::new();
        for fragment in &state.fragments {
            running.push_str(fragment);
            let _ = tx.send(Ok(running.clone()));
        }
        if let Some(error) = &state.error {
            let _ = tx.send(Err(error.clone()));
        } else if !state.finished {
            state.content_subs.push(tx);
        }
        UnboundedReceiverStream::new(rx)
    }

    /// The fully reconciled tool-call list. Resolves only once the stream
    /// has ended; fragments of one call may be split across many chunks and
    /// must never be dispatched early.
    pub async fn tool_calls(&self) -> Result<Vec<ToolCall>, Error> {
        self.wait_done().await;
        let state = self.inner.lock_state();
        if let Some(error) = &state.error {
            return Err(error.clone());
        }
        Ok(state
            .tool_calls
            .iter()
            .map(|p| ToolCall::new(p.id.clone(), p.name.clone(), p.arguments.clone()))
            .collect())
    }

    /// Wait for the terminal signal, then return the token usage reported on
    /// the final chunk (if any).
    pub async fn completed(&self) -> Result<Option<Usage>, Error> {
        self.wait_done().await;
        let state = self.inner.lock_state();
        if let Some(error) = &state.error {
            return Err(error.clone());
        }
        Ok(state.usage)
    }

    /// Await the terminal accumulated content value.
    pub async fn full_content(&self) -> Result<String, Error> {
        self.wait_done().await;
        let state = self.inner.lock_state();
        if let Some(error) = &state.error {
            return Err(error.clone());
        }
        Ok(state.content.clone())
    }

    /// Whatever content has accumulated so far, readable at any point and
    /// after a failure.
    pub fn partial_content(&self) -> String {
        self.inner.lock_state().content.clone()
    }

    pub fn usage(&self) -> Option<Usage> {
        self.inner.lock_state().usage
    }

    pub fn is_finished(&self) -> bool {
        self.inner.lock_state().finished
    }

    async fn wait_done(&self) {
        let mut rx = self.inner.done_rx.clone();
        if *rx.borrow_and_update() {
            return;
        }
        while rx.changed().await.is_ok() {
            if *rx.borrow() {
                return;
            }
        }
    }
}
