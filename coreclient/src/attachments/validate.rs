// SPDX-FileCopyrightText: 2025 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Attachment admission rules.
//!
//! Validation classifies, it never mutates and it never throws: every
//! problem is returned as data so the composition UI can render it and the
//! caller can decide whether to proceed with the remaining valid items.

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::AttachmentCandidate;

/// Types accepted for upload but known to render inconsistently across
/// platforms. Accepting them yields a batch-level warning.
const LIMITED_SUPPORT_TYPES: &[&str] = &["image/webp", "image/avif", "image/heic", "image/heif"];

/// Restriction configuration, supplied by the embedding application and
/// static for the session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttachmentRestrictions {
    /// Maximum number of attachments per submission.
    pub max_items: usize,
    /// Maximum size of a single attachment in bytes.
    pub max_item_bytes: u64,
    /// Maximum combined size of a submission's attachments in bytes.
    pub max_batch_bytes: u64,
    /// Allowed content types and extensions.
    pub allowed: AllowedTypes,
}

impl Default for AttachmentRestrictions {
    fn default() -> Self {
        Self {
            max_items: 10,
            max_item_bytes: 25 * 1024 * 1024,
            max_batch_bytes: 100 * 1024 * 1024,
            allowed: AllowedTypes::any(),
        }
    }
}

/// Allow-list over MIME types and file extensions.
///
/// A candidate is permitted if its content type matches an entry (exact or
/// `prefix/*` wildcard) or its extension is listed. Empty lists permit
/// everything.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AllowedTypes {
    mime_types: Vec<String>,
    extensions: Vec<String>,
}

impl AllowedTypes {
    pub fn new(mime_types: Vec<String>, extensions: Vec<String>) -> Self {
        Self {
            mime_types,
            extensions: extensions.into_iter().map(|e| e.to_lowercase()).collect(),
        }
    }

    pub fn any() -> Self {
        Self::default()
    }

    fn permits(&self, candidate: &AttachmentCandidate) -> bool {
        if self.mime_types.is_empty() && self.extensions.is_empty() {
            return true;
        }
        let content_type = candidate.content_type();
        let mime_match = self.mime_types.iter().any(|allowed| {
            allowed
                .strip_suffix("/*")
                .map(|prefix| {
                    content_type
                        .split_once('/')
                        .is_some_and(|(candidate_prefix, _)| candidate_prefix == prefix)
                })
                .unwrap_or_else(|| allowed.as_str() == content_type)
        });
        if mime_match {
            return true;
        }
        candidate
            .extension()
            .is_some_and(|extension| self.extensions.contains(&extension))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VerdictKind {
    Valid,
    Oversized,
    UnsupportedType,
    BatchLimitExceeded,
}

/// Per-candidate validation result with a human-readable reason.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationVerdict {
    pub kind: VerdictKind,
    pub reason: String,
}

impl ValidationVerdict {
    fn valid(candidate: &AttachmentCandidate) -> Self {
        Self {
            kind: VerdictKind::Valid,
            reason: format!("{} accepted", candidate.file_name()),
        }
    }

    pub fn is_valid(&self) -> bool {
        self.kind == VerdictKind::Valid
    }
}

/// Result of validating one batch.
///
/// `verdicts` parallels the input in order, one entry per candidate; the
/// accepted subset preserves input order. No item is ever dropped without a
/// reason.
#[derive(Debug, Default)]
pub struct BatchValidation {
    pub verdicts: Vec<ValidationVerdict>,
    pub accepted: Vec<AttachmentCandidate>,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl BatchValidation {
    pub fn all_valid(&self) -> bool {
        self.errors.is_empty() && self.verdicts.iter().all(ValidationVerdict::is_valid)
    }
}

/// Applies the restriction configuration to a candidate batch.
pub fn validate_batch(
    candidates: Vec<AttachmentCandidate>,
    restrictions: &AttachmentRestrictions,
) -> BatchValidation {
    let mut out = BatchValidation::default();

    if candidates.len() > restrictions.max_items {
        out.errors.push(format!(
            "batch exceeds {} items",
            restrictions.max_items
        ));
    }

    let mut accepted_bytes: u64 = 0;
    let mut batch_bytes_exceeded = false;
    for (index, candidate) in candidates.into_iter().enumerate() {
        let verdict = if index >= restrictions.max_items {
            ValidationVerdict {
                kind: VerdictKind::BatchLimitExceeded,
                reason: format!(
                    "{} exceeds the limit of {} attachments per message",
                    candidate.file_name(),
                    restrictions.max_items
                ),
            }
        } else if candidate.size() > restrictions.max_item_bytes {
            ValidationVerdict {
                kind: VerdictKind::Oversized,
                reason: format!(
                    "{} is larger than the allowed {} bytes",
                    candidate.file_name(),
                    restrictions.max_item_bytes
                ),
            }
        } else if !restrictions.allowed.permits(&candidate) {
            ValidationVerdict {
                kind: VerdictKind::UnsupportedType,
                reason: format!(
                    "{} has unsupported type {}",
                    candidate.file_name(),
                    candidate.content_type()
                ),
            }
        } else if accepted_bytes + candidate.size() > restrictions.max_batch_bytes {
            if !batch_bytes_exceeded {
                batch_bytes_exceeded = true;
                out.errors.push(format!(
                    "batch exceeds {} bytes in total",
                    restrictions.max_batch_bytes
                ));
            }
            ValidationVerdict {
                kind: VerdictKind::BatchLimitExceeded,
                reason: format!(
                    "{} does not fit into the remaining batch size budget",
                    candidate.file_name()
                ),
            }
        } else {
            accepted_bytes += candidate.size();
            if LIMITED_SUPPORT_TYPES.contains(&candidate.content_type()) {
                out.warnings.push(format!(
                    "type {} has limited support",
                    candidate.content_type()
                ));
            }
            ValidationVerdict::valid(&candidate)
        };

        if verdict.is_valid() {
            out.accepted.push(candidate);
        }
        out.verdicts.push(verdict);
    }

    debug!(
        accepted = out.accepted.len(),
        rejected = out.verdicts.len() - out.accepted.len(),
        warnings = out.warnings.len(),
        "validated attachment batch"
    );
    out
}

#[cfg(test)]
mod test {
    use chrono::Utc;

    use super::*;

    fn candidate(name: &str, content_type: &str, size: usize) -> AttachmentCandidate {
        AttachmentCandidate::new(name, content_type, Utc::now(), vec![0u8; size])
    }

    fn restrictions() -> AttachmentRestrictions {
        AttachmentRestrictions {
            max_items: 3,
            max_item_bytes: 1024,
            max_batch_bytes: 2048,
            allowed: AllowedTypes::new(
                vec!["image/*".to_owned(), "application/pdf".to_owned()],
                vec!["txt".to_owned()],
            ),
        }
    }

    #[test]
    fn oversized_is_never_valid() {
        let batch = vec![candidate("big.png", "image/png", 2000)];
        let result = validate_batch(batch, &restrictions());
        assert_eq!(result.verdicts[0].kind, VerdictKind::Oversized);
        assert!(result.accepted.is_empty());
        assert!(result.verdicts[0].reason.contains("big.png"));
    }

    #[test]
    fn unsupported_type_is_rejected_with_reason() {
        let batch = vec![
            candidate("movie.mp4", "video/mp4", 100),
            candidate("notes.txt", "text/plain", 100),
        ];
        let result = validate_batch(batch, &restrictions());
        assert_eq!(result.verdicts[0].kind, VerdictKind::UnsupportedType);
        // Allowed via the extension list even though text/plain is not listed.
        assert_eq!(result.verdicts[1].kind, VerdictKind::Valid);
        assert_eq!(result.accepted.len(), 1);
    }

    #[test]
    fn items_beyond_the_count_cap_are_rejected() {
        let batch = vec![
            candidate("a.png", "image/png", 10),
            candidate("b.png", "image/png", 10),
            candidate("c.png", "image/png", 10),
            candidate("d.png", "image/png", 10),
        ];
        let result = validate_batch(batch, &restrictions());
        assert_eq!(result.errors.len(), 1);
        assert_eq!(
            result.verdicts[3].kind,
            VerdictKind::BatchLimitExceeded
        );
        assert_eq!(result.accepted.len(), 3);
    }

    #[test]
    fn batch_byte_budget_is_enforced() {
        let batch = vec![
            candidate("a.png", "image/png", 1024),
            candidate("b.png", "image/png", 1024),
            candidate("c.png", "image/png", 1024),
        ];
        let result = validate_batch(batch, &restrictions());
        assert_eq!(result.verdicts[0].kind, VerdictKind::Valid);
        assert_eq!(result.verdicts[1].kind, VerdictKind::Valid);
        assert_eq!(
            result.verdicts[2].kind,
            VerdictKind::BatchLimitExceeded
        );
        assert!(result.errors.iter().any(|e| e.contains("2048")));
    }

    #[test]
    fn limited_support_types_warn_but_pass() {
        let batch = vec![candidate("anim.webp", "image/webp", 100)];
        let result = validate_batch(batch, &restrictions());
        assert_eq!(result.verdicts[0].kind, VerdictKind::Valid);
        assert_eq!(result.warnings.len(), 1);
        assert!(result.warnings[0].contains("image/webp"));
    }

    #[test]
    fn validation_is_idempotent_on_a_valid_batch() {
        let restrictions = restrictions();
        let batch = vec![
            candidate("a.png", "image/png", 100),
            candidate("b.pdf", "application/pdf", 200),
        ];
        let first = validate_batch(batch, &restrictions);
        assert!(first.all_valid());

        let second = validate_batch(first.accepted, &restrictions);
        assert!(second.all_valid());
        assert_eq!(second.verdicts.len(), first.verdicts.len());
        for (a, b) in first.verdicts.iter().zip(&second.verdicts) {
            assert_eq!(a.kind, b.kind);
            assert_eq!(a.reason, b.reason);
        }
    }

    #[test]
    fn empty_allow_list_permits_everything() {
        let restrictions = AttachmentRestrictions::default();
        let batch = vec![candidate("anything.bin", "application/octet-stream", 10)];
        let result = validate_batch(batch, &restrictions);
        assert!(result.all_valid());
    }
}
