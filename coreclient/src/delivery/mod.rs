// SPDX-FileCopyrightText: 2025 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Delivery queue and offline buffer.
//!
//! Fully processed submissions are handed to the transport collaborator
//! immediately while online. Submissions made while offline are buffered as
//! raw batches and replayed strictly in arrival order when connectivity
//! returns; replay re-runs the full validation, dedup and compression path,
//! because the restriction configuration or format heuristics may no longer
//! treat an old batch identically.

use std::{
    collections::VecDeque,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use chrono::{DateTime, Utc};
use terncommon::identifiers::SubmissionId;
use tokio::sync::{Mutex, Notify, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::attachments::{
    AttachmentCandidate, AttachmentRestrictions, CompressionConfig, CompressionPipeline,
    ProcessedAttachment, ValidationVerdict, dedup_candidates, inspect_image, validate_batch,
};

/// The unit handed to the transport collaborator.
///
/// Only ever constructed from candidates that passed validation and
/// deduplication. Attachment order matches submission input order.
#[derive(Debug)]
pub struct DeliveryItem {
    pub text: Option<String>,
    pub attachments: Vec<ProcessedAttachment>,
}

/// Outbound transport collaborator.
///
/// Called once per admitted delivery item, in submission order. Retry and
/// ordering semantics on the wire are not this crate's concern.
#[trait_variant::make(Send)]
pub trait Transport: Send + Sync + 'static {
    async fn deliver(&self, item: DeliveryItem) -> anyhow::Result<()>;
}

/// A raw submission captured while connectivity was down.
#[derive(Debug)]
pub struct QueuedSubmission {
    pub id: SubmissionId,
    pub text: Option<String>,
    pub candidates: Vec<AttachmentCandidate>,
    pub queued_at: DateTime<Utc>,
}

/// Telemetry returned alongside a delivered submission.
#[derive(Debug, Default)]
pub struct SubmissionReport {
    /// One verdict per input candidate, in input order.
    pub verdicts: Vec<ValidationVerdict>,
    /// Batch-level errors for a partial delivery, e.g. an exceeded item
    /// count. Empty when every candidate was admitted.
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    pub removed_duplicates: usize,
}

#[derive(Debug)]
pub enum SubmitOutcome {
    /// Handed to the transport.
    Delivered { report: SubmissionReport },
    /// Captured for replay; the caller is acknowledged synchronously.
    Queued { id: SubmissionId },
    /// Nothing admissible; per-item verdicts and batch errors for the UI.
    Rejected {
        errors: Vec<String>,
        verdicts: Vec<ValidationVerdict>,
    },
    /// Processed, but the transport refused the handoff.
    TransportFailed { reason: String },
}

/// Owns the submission path and the offline buffer.
///
/// Dropping the outbox stops the background drain loop; the queue itself is
/// independent of any UI component's lifetime.
pub struct Outbox<T: Transport> {
    inner: Arc<OutboxInner<T>>,
    cancel: CancellationToken,
}

struct OutboxInner<T> {
    restrictions: AttachmentRestrictions,
    pipeline: CompressionPipeline,
    transport: T,
    connectivity: watch::Receiver<bool>,
    queue: Mutex<VecDeque<QueuedSubmission>>,
    draining: AtomicBool,
    // Wakes the drain loop when an entry lands in the queue. Without it, an
    // entry enqueued after the loop pops the queue empty would sit until the
    // next connectivity change.
    wakeup: Notify,
}

impl<T: Transport> Outbox<T> {
    pub fn new(
        restrictions: AttachmentRestrictions,
        compression: CompressionConfig,
        transport: T,
        connectivity: watch::Receiver<bool>,
    ) -> Self {
        let inner = Arc::new(OutboxInner {
            restrictions,
            pipeline: CompressionPipeline::new(compression),
            transport,
            connectivity: connectivity.clone(),
            queue: Mutex::new(VecDeque::new()),
            draining: AtomicBool::new(false),
            wakeup: Notify::new(),
        });
        let cancel = CancellationToken::new();
        tokio::spawn(drain_loop(inner.clone(), connectivity, cancel.clone()));
        Self { inner, cancel }
    }

    /// Submits text plus raw attachment candidates.
    ///
    /// While online (and with no backlog), the batch runs through the full
    /// validation, dedup, inspection and compression path and the result is
    /// handed to the transport. Otherwise the raw batch is appended to the
    /// offline queue and the caller is acknowledged immediately.
    pub async fn submit(
        &self,
        text: Option<String>,
        candidates: Vec<AttachmentCandidate>,
    ) -> SubmitOutcome {
        let online = *self.inner.connectivity.borrow();
        let draining = self.inner.draining.load(Ordering::SeqCst);
        let mut queue = self.inner.queue.lock().await;
        if !online || draining || !queue.is_empty() {
            let id = SubmissionId::random();
            queue.push_back(QueuedSubmission {
                id,
                text,
                candidates,
                queued_at: Utc::now(),
            });
            info!(%id, online, queued = queue.len(), "submission deferred to offline queue");
            drop(queue);
            self.inner.wakeup.notify_one();
            return SubmitOutcome::Queued { id };
        }
        drop(queue);

        self.inner.process_and_deliver(text, candidates).await
    }

    /// Number of submissions currently waiting for replay.
    pub async fn queued_submissions(&self) -> usize {
        self.inner.queue.lock().await.len()
    }
}

impl<T: Transport> Drop for Outbox<T> {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl<T: Transport> OutboxInner<T> {
    /// The full admission path: validate, dedup, inspect, compress, hand off.
    async fn process_and_deliver(
        &self,
        text: Option<String>,
        candidates: Vec<AttachmentCandidate>,
    ) -> SubmitOutcome {
        let validation = validate_batch(candidates, &self.restrictions);
        let has_text = text.as_deref().is_some_and(|text| !text.trim().is_empty());
        if validation.accepted.is_empty() && !has_text {
            return SubmitOutcome::Rejected {
                errors: validation.errors,
                verdicts: validation.verdicts,
            };
        }

        let (unique, removed_duplicates) = dedup_candidates(validation.accepted);

        let mut attachments = Vec::with_capacity(unique.len());
        for candidate in unique {
            let descriptor = candidate
                .is_image()
                .then(|| inspect_image(candidate.bytes(), candidate.content_type()));
            let processed = self.pipeline.process(candidate, descriptor.as_ref()).await;
            attachments.push(processed);
        }

        let item = DeliveryItem { text, attachments };
        match self.transport.deliver(item).await {
            Ok(()) => SubmitOutcome::Delivered {
                report: SubmissionReport {
                    verdicts: validation.verdicts,
                    errors: validation.errors,
                    warnings: validation.warnings,
                    removed_duplicates,
                },
            },
            Err(error) => {
                error!(%error, "transport handoff failed");
                SubmitOutcome::TransportFailed {
                    reason: error.to_string(),
                }
            }
        }
    }

    /// Drains the queue front-to-back while connectivity holds.
    async fn drain(&self) {
        self.draining.store(true, Ordering::SeqCst);
        loop {
            if !*self.connectivity.borrow() {
                debug!("connectivity lost mid-drain; keeping remaining entries");
                break;
            }
            let Some(entry) = self.queue.lock().await.pop_front() else {
                break;
            };
            info!(
                id = %entry.id,
                queued_at = %entry.queued_at,
                "replaying queued submission"
            );
            // Replay runs the full path again; the entry may be stale.
            match self
                .process_and_deliver(entry.text, entry.candidates)
                .await
            {
                SubmitOutcome::Delivered { .. } => {}
                SubmitOutcome::Rejected { errors, .. } => {
                    info!(id = %entry.id, ?errors, "queued submission no longer admissible");
                }
                SubmitOutcome::TransportFailed { reason } => {
                    // At-most-once handoff: the entry is not re-queued ahead
                    // of later entries.
                    error!(id = %entry.id, reason, "dropping queued submission after failed handoff");
                }
                SubmitOutcome::Queued { .. } => {
                    error!(id = %entry.id, "logic error: replay path must not queue");
                }
            }
        }
        self.draining.store(false, Ordering::SeqCst);
    }
}

async fn drain_loop<T: Transport>(
    inner: Arc<OutboxInner<T>>,
    mut connectivity: watch::Receiver<bool>,
    cancel: CancellationToken,
) {
    loop {
        let online = *connectivity.borrow_and_update();
        if online {
            inner.drain().await;
        }
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = inner.wakeup.notified() => {}
            changed = connectivity.changed() => {
                if changed.is_err() {
                    // The connectivity signal is gone; nothing to react to
                    // anymore.
                    return;
                }
            }
        }
    }
}
