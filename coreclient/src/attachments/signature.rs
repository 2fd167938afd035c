// SPDX-FileCopyrightText: 2025 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Intra-batch duplicate detection.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use tracing::debug;

use super::AttachmentCandidate;

/// Derived content identity of a candidate.
///
/// Built from the declared size, type and last-modified timestamp, plus the
/// file extension for images. Structural equality; never persisted and never
/// compared across submissions.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ContentSignature {
    size: u64,
    content_type: String,
    last_modified: DateTime<Utc>,
    extension: Option<String>,
}

impl ContentSignature {
    pub fn of(candidate: &AttachmentCandidate) -> Self {
        // The extension only disambiguates raster files; for other types the
        // declared content type already carries that information.
        let extension = candidate
            .is_image()
            .then(|| candidate.extension())
            .flatten();
        Self {
            size: candidate.size(),
            content_type: candidate.content_type().to_owned(),
            last_modified: candidate.last_modified(),
            extension,
        }
    }
}

/// Removes repeats within one submission.
///
/// Keeps the first occurrence of each signature in input order and returns
/// the number of removed candidates. Has no memory of previously sent
/// attachments.
pub fn dedup_candidates(candidates: Vec<AttachmentCandidate>) -> (Vec<AttachmentCandidate>, usize) {
    let before = candidates.len();
    let mut seen = HashSet::new();
    let kept: Vec<_> = candidates
        .into_iter()
        .filter(|candidate| seen.insert(ContentSignature::of(candidate)))
        .collect();
    let removed = before - kept.len();
    if removed > 0 {
        debug!(removed, "removed duplicate attachments from batch");
    }
    (kept, removed)
}
