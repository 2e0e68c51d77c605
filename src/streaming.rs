//! SSE byte-stream plumbing for the request dispatcher (component G).
//!
//! Wraps a backend's raw chat-completion byte stream so that, regardless of
//! how the stream ends, the bound slot's lock is released (by simply letting
//! this struct drop, which drops the held `OwnedMutexGuard`) and a terminal
//! `data: [DONE]\n\n` chunk is appended unconditionally — on a clean finish
//! or an error alike, never only on error.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::Bytes;
use futures_util::Stream;
use tokio::sync::OwnedMutexGuard;
use tracing::warn;

use crate::backend::{BackendError, ChatByteStream};
use crate::metadata::MetadataIndex;
use crate::slots::{GlobalSlot, SlotManager};

pub const DONE_CHUNK: &[u8] = b"data: [DONE]\n\n";

/// What to do with the bound slot once the stream finishes.
pub enum FinishPolicy {
    /// Small-request path: always mark the slot cold, success or failure.
    AlwaysCold,
    /// Large-request path: mark cold only on a mid-stream failure; on
    /// success, leave it hot (it stays the live binding for reuse).
    ColdOnErrorOnly,
}

enum Phase {
    Streaming,
    EmitDone,
    Done,
}

pub struct DispatcherStream {
    inner: ChatByteStream,
    guard: Option<OwnedMutexGuard<()>>,
    slot_manager: Arc<SlotManager>,
    slot: GlobalSlot,
    policy: FinishPolicy,
    touch_on_chunk: bool,
    phase: Phase,
    /// When set, a successful large-path stream spawns a best-effort task to
    /// persist the KV and write fresh metadata (§10.2 of the design notes).
    save_on_success: Option<Arc<MetadataIndex>>,
}

impl DispatcherStream {
    pub fn new(
        inner: ChatByteStream,
        guard: OwnedMutexGuard<()>,
        slot_manager: Arc<SlotManager>,
        slot: GlobalSlot,
        policy: FinishPolicy,
        touch_on_chunk: bool,
        save_on_success: Option<Arc<MetadataIndex>>,
    ) -> Self {
        Self {
            inner,
            guard: Some(guard),
            slot_manager,
            slot,
            policy,
            touch_on_chunk,
            phase: Phase::Streaming,
            save_on_success,
        }
    }
}

impl Stream for DispatcherStream {
    type Item = Result<Bytes, std::convert::Infallible>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        loop {
            match this.phase {
                Phase::Streaming => match Pin::new(&mut this.inner).poll_next(cx) {
                    Poll::Pending => return Poll::Pending,
                    Poll::Ready(Some(Ok(chunk))) => {
                        if this.touch_on_chunk {
                            this.slot_manager.touch(this.slot);
                        }
                        return Poll::Ready(Some(Ok(chunk)));
                    }
                    Poll::Ready(Some(Err(e))) => {
                        warn!(slot = ?this.slot, error = %e, "backend_stream_error");
                        apply_finish(&this.slot_manager, this.slot, &this.policy, false);
                        this.phase = Phase::EmitDone;
                        continue;
                    }
                    Poll::Ready(None) => {
                        apply_finish(&this.slot_manager, this.slot, &this.policy, true);
                        if let Some(metadata) = this.save_on_success.take() {
                            // Move the slot lock into the save task so a new
                            // request can't acquire this slot (and start a
                            // fresh generation) while the backend is still
                            // reading its live KV for the save.
                            let guard = this.guard.take();
                            let slot_manager = this.slot_manager.clone();
                            let slot = this.slot;
                            tokio::spawn(async move {
                                if let Err(e) = slot_manager.save_slot_cache(slot, &metadata).await {
                                    warn!(slot = ?slot, error = %e, "slot_save_failed");
                                }
                                drop(guard);
                            });
                        }
                        this.phase = Phase::EmitDone;
                        continue;
                    }
                },
                Phase::EmitDone => {
                    this.phase = Phase::Done;
                    return Poll::Ready(Some(Ok(Bytes::from_static(DONE_CHUNK))));
                }
                Phase::Done => return Poll::Ready(None),
            }
        }
    }
}

fn apply_finish(slot_manager: &SlotManager, slot: GlobalSlot, policy: &FinishPolicy, succeeded: bool) {
    match policy {
        FinishPolicy::AlwaysCold => slot_manager.mark_slot_cold(slot),
        FinishPolicy::ColdOnErrorOnly => {
            if !succeeded {
                slot_manager.mark_slot_cold(slot);
            }
        }
    }
}

pub type BoxedSseStream = Pin<Box<dyn Stream<Item = Result<Bytes, std::convert::Infallible>> + Send>>;

pub fn boxed(stream: DispatcherStream) -> BoxedSseStream {
    Box::pin(stream)
}

#[allow(dead_code)]
fn _assert_backend_error_displays(_e: &BackendError) {}
