// SPDX-FileCopyrightText: 2025 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Client-side pipeline that turns user input (text and binary attachments)
//! into messages ready for network delivery.
//!
//! Control flow: the [`Composer`] produces a submission intent, the
//! [`Outbox`] validates the attachment batch, removes intra-batch duplicates,
//! classifies images and runs the compression pipeline, then hands the
//! resulting [`DeliveryItem`] to the transport collaborator. Submissions made
//! while offline are buffered and replayed in order through the same path
//! when connectivity returns.
//!
//! Nothing in this crate is fatal: validation and batch problems are returned
//! as data, compression failures degrade to the original payload, and an
//! unavailable draft store disables autosave without error.

pub mod attachments;
pub mod composer;
pub mod delivery;

pub use attachments::{
    AllowedTypes, AttachmentCandidate, AttachmentRestrictions, BatchValidation, CompressionConfig,
    CompressionPipeline, ContentSignature, FormatDescriptor, LocalPreview, Orientation,
    ProcessedAttachment, ValidationVerdict, VerdictKind,
};
pub use composer::{
    CharacterLimits, Composer, ComposerConfig, ComposerState, Draft, DraftStore, DraftStoreError,
    LimitState, MemoryDraftStore, SqliteDraftStore,
};
pub use delivery::{
    DeliveryItem, Outbox, QueuedSubmission, SubmissionReport, SubmitOutcome, Transport,
};
pub use terncommon::identifiers::{ChatId, SubmissionId, TaskId};
