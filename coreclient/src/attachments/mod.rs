// SPDX-FileCopyrightText: 2025 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Attachment data model and processing stages.

use std::{
    ffi::OsStr,
    fmt,
    path::{Path, PathBuf},
};

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};

mod compress;
mod inspect;
mod signature;
mod validate;

pub use compress::{CompressionConfig, CompressionPipeline};
pub use inspect::{FormatDescriptor, Orientation, inspect_image};
pub use signature::{ContentSignature, dedup_candidates};
pub use validate::{
    AllowedTypes, AttachmentRestrictions, BatchValidation, ValidationVerdict, VerdictKind,
    validate_batch,
};

#[derive(Clone, derive_more::From)]
pub struct AttachmentBytes {
    bytes: Vec<u8>,
}

impl AttachmentBytes {
    fn new(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

impl AsRef<[u8]> for AttachmentBytes {
    fn as_ref(&self) -> &[u8] {
        &self.bytes
    }
}

// Payloads are never logged; only their size is.
impl fmt::Debug for AttachmentBytes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AttachmentBytes({} bytes)", self.bytes.len())
    }
}

/// A raw payload proposed for sending, before validation.
///
/// Captured from one of the input sources (file picker, clipboard paste,
/// drag-and-drop, camera); the pipeline does not care which. Immutable once
/// captured: the later stages classify and copy, they never modify.
#[derive(Debug, Clone)]
pub struct AttachmentCandidate {
    file_name: String,
    content_type: String,
    last_modified: DateTime<Utc>,
    bytes: AttachmentBytes,
}

impl AttachmentCandidate {
    pub fn new(
        file_name: impl Into<String>,
        content_type: impl Into<String>,
        last_modified: DateTime<Utc>,
        bytes: Vec<u8>,
    ) -> Self {
        Self {
            file_name: file_name.into(),
            content_type: content_type.into(),
            last_modified,
            bytes: AttachmentBytes::new(bytes),
        }
    }

    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    pub fn content_type(&self) -> &str {
        &self.content_type
    }

    pub fn last_modified(&self) -> DateTime<Utc> {
        self.last_modified
    }

    pub fn size(&self) -> u64 {
        self.bytes.len() as u64
    }

    pub fn bytes(&self) -> &[u8] {
        self.bytes.as_ref()
    }

    /// Lowercased file extension, if any.
    pub fn extension(&self) -> Option<String> {
        Path::new(&self.file_name)
            .extension()
            .and_then(OsStr::to_str)
            .map(str::to_lowercase)
    }

    pub fn is_image(&self) -> bool {
        self.content_type.starts_with("image/")
    }
}

/// The final unit placed into a delivery item.
///
/// Carries the (possibly compressed) payload, its declared name and type, a
/// sha256 content hash, and an ephemeral local preview for images.
#[derive(Debug)]
pub struct ProcessedAttachment {
    file_name: String,
    content_type: String,
    payload: AttachmentBytes,
    content_hash: Vec<u8>,
    preview: Option<LocalPreview>,
    was_compressed: bool,
}

impl ProcessedAttachment {
    /// The candidate's payload is used unchanged.
    pub(crate) fn passthrough(candidate: AttachmentCandidate) -> Self {
        let content_hash = Sha256::digest(candidate.bytes()).to_vec();
        Self {
            file_name: candidate.file_name,
            content_type: candidate.content_type,
            payload: candidate.bytes,
            content_hash,
            preview: None,
            was_compressed: false,
        }
    }

    /// The candidate's payload was replaced by a re-encoded one.
    ///
    /// The file extension follows the new content type so that the declared
    /// name stays truthful.
    pub(crate) fn reencoded(
        candidate: AttachmentCandidate,
        payload: Vec<u8>,
        content_type: String,
        preview: Option<LocalPreview>,
    ) -> Self {
        let content_hash = Sha256::digest(&payload).to_vec();
        let mut file_name = PathBuf::from(&candidate.file_name);
        match content_type.as_str() {
            "image/webp" => {
                file_name.set_extension("webp");
            }
            "image/jpeg" => {
                file_name.set_extension("jpg");
            }
            _ => {}
        }
        Self {
            file_name: file_name.to_string_lossy().to_string(),
            content_type,
            payload: AttachmentBytes::new(payload),
            content_hash,
            preview,
            was_compressed: true,
        }
    }

    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    pub fn content_type(&self) -> &str {
        &self.content_type
    }

    pub fn size(&self) -> u64 {
        self.payload.len() as u64
    }

    pub fn payload(&self) -> &[u8] {
        self.payload.as_ref()
    }

    pub fn content_hash(&self) -> &[u8] {
        &self.content_hash
    }

    pub fn content_hash_hex(&self) -> String {
        hex::encode(&self.content_hash)
    }

    pub fn was_compressed(&self) -> bool {
        self.was_compressed
    }

    pub fn preview(&self) -> Option<&LocalPreview> {
        self.preview.as_ref()
    }

    /// Moves the preview out, releasing it from this attachment.
    pub fn take_preview(&mut self) -> Option<LocalPreview> {
        self.preview.take()
    }
}

/// Ephemeral preview of a just-attached image, for rendering before server
/// acknowledgment.
///
/// Owned by the attachment (and thereby the delivery item) that created it;
/// dropping the owner releases the preview. Never shared across items.
#[derive(Clone)]
pub struct LocalPreview {
    thumbnail_webp: Vec<u8>,
    blurhash: Option<String>,
    width: u32,
    height: u32,
}

impl LocalPreview {
    pub(crate) fn new(
        thumbnail_webp: Vec<u8>,
        blurhash: Option<String>,
        width: u32,
        height: u32,
    ) -> Self {
        Self {
            thumbnail_webp,
            blurhash,
            width,
            height,
        }
    }

    pub fn thumbnail_webp(&self) -> &[u8] {
        &self.thumbnail_webp
    }

    pub fn blurhash(&self) -> Option<&str> {
        self.blurhash.as_deref()
    }

    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }
}

impl fmt::Debug for LocalPreview {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalPreview")
            .field("thumbnail_bytes", &self.thumbnail_webp.len())
            .field("blurhash", &self.blurhash)
            .field("width", &self.width)
            .field("height", &self.height)
            .finish()
    }
}
