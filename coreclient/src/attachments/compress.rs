// SPDX-FileCopyrightText: 2025 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Adaptive image compression with multi-stage fallback.
//!
//! Eligible images are re-encoded on a background thread under a hard
//! deadline. A worker failure falls back to a synchronous raster re-encode
//! with the same dimension and quality targets; if that throws too, or the
//! deadline is exceeded, the original payload is used. The pipeline never
//! raises to its caller.

use std::{io::Cursor, sync::Arc, time::Duration};

use anyhow::Context;
use image::DynamicImage;
use serde::{Deserialize, Serialize};
use terncommon::identifiers::TaskId;
use tokio::{sync::Semaphore, time::timeout};
use tracing::{debug, error, info, warn};

use super::{
    AttachmentCandidate, FormatDescriptor, LocalPreview, Orientation, ProcessedAttachment,
};

const THUMBNAIL_WIDTH: u32 = 300;
const THUMBNAIL_HEIGHT: u32 = 300;

/// Compression tuning, static for the session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompressionConfig {
    /// Output images are scaled down to fit these dimensions.
    pub max_width: u32,
    pub max_height: u32,
    /// Encoder quality in percent.
    pub quality: f32,
    /// Images below this size are passed through unchanged.
    pub min_size_floor: u64,
    /// Modern formats (WebP/AVIF/HEIC) already above this size are passed
    /// through; re-encoding them rarely pays off.
    pub modern_format_size_threshold: u64,
    /// Hard deadline for one background compression task.
    pub task_timeout: Duration,
    /// Ceiling on concurrently active compression tasks.
    pub max_in_flight: usize,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            max_width: 4096,
            max_height: 4096,
            quality: 90.0,
            min_size_floor: 10 * 1024,
            modern_format_size_threshold: 1024 * 1024,
            task_timeout: Duration::from_secs(30),
            max_in_flight: 2,
        }
    }
}

/// Dimension/quality targets shared by the background worker and the raster
/// fallback.
#[derive(Debug, Clone)]
struct EncodeTargets {
    max_width: u32,
    max_height: u32,
    quality: f32,
    orientation: Orientation,
    /// Keep the source stream untouched (animated sources).
    preserve_animation: bool,
    /// Re-encode to JPEG instead of WebP (modern-format sources).
    prefer_jpeg: bool,
    source_type: String,
}

struct EncodedImage {
    payload: Vec<u8>,
    content_type: String,
    preview: Option<LocalPreview>,
}

pub struct CompressionPipeline {
    config: CompressionConfig,
    // In-flight work budget. Permits move into the background task, so
    // release follows task resolution on every branch, including timeout.
    budget: Arc<Semaphore>,
}

impl CompressionPipeline {
    pub fn new(config: CompressionConfig) -> Self {
        let budget = Arc::new(Semaphore::new(config.max_in_flight));
        Self { config, budget }
    }

    pub fn config(&self) -> &CompressionConfig {
        &self.config
    }

    /// Transforms one accepted, non-duplicate candidate.
    ///
    /// Never fails: every path terminates in a usable payload. Non-images
    /// pass `None` as descriptor and are passed through unchanged.
    pub async fn process(
        &self,
        candidate: AttachmentCandidate,
        descriptor: Option<&FormatDescriptor>,
    ) -> ProcessedAttachment {
        let Some(descriptor) = descriptor else {
            return ProcessedAttachment::passthrough(candidate);
        };
        if let Some(reason) = self.skip_reason(&candidate, descriptor) {
            debug!(
                file_name = candidate.file_name(),
                reason, "skipping compression"
            );
            return ProcessedAttachment::passthrough(candidate);
        }

        let targets = EncodeTargets {
            max_width: self.config.max_width,
            max_height: self.config.max_height,
            quality: self.config.quality,
            orientation: descriptor.orientation,
            preserve_animation: descriptor.is_animated,
            prefer_jpeg: descriptor.is_modern_format,
            source_type: candidate.content_type().to_owned(),
        };

        let task_id = TaskId::random();
        let permit = match self.budget.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(error) => {
                error!(%task_id, %error, "compression budget closed; using original payload");
                return ProcessedAttachment::passthrough(candidate);
            }
        };

        debug!(
            %task_id,
            file_name = candidate.file_name(),
            from_bytes = candidate.size(),
            "dispatching compression task"
        );
        let bytes = candidate.bytes().to_vec();
        let worker_targets = targets.clone();
        let task = tokio::task::spawn_blocking(move || {
            let _permit = permit;
            encode_image(&bytes, &worker_targets)
        });

        match timeout(self.config.task_timeout, task).await {
            Ok(Ok(Ok(encoded))) => {
                info!(
                    %task_id,
                    from_bytes = candidate.size(),
                    to_bytes = encoded.payload.len(),
                    content_type = encoded.content_type,
                    "compressed attachment image"
                );
                ProcessedAttachment::reencoded(
                    candidate,
                    encoded.payload,
                    encoded.content_type,
                    encoded.preview,
                )
            }
            Ok(Ok(Err(error))) => {
                warn!(%task_id, %error, "compression worker failed; trying raster fallback");
                raster_fallback(candidate, &targets)
            }
            Ok(Err(error)) => {
                warn!(%task_id, %error, "compression worker unavailable; trying raster fallback");
                raster_fallback(candidate, &targets)
            }
            Err(_) => {
                warn!(
                    %task_id,
                    timeout = ?self.config.task_timeout,
                    "compression task deadline exceeded; using original payload"
                );
                ProcessedAttachment::passthrough(candidate)
            }
        }
    }

    fn skip_reason(
        &self,
        candidate: &AttachmentCandidate,
        descriptor: &FormatDescriptor,
    ) -> Option<&'static str> {
        if descriptor.is_animated && !descriptor.broadly_supported {
            Some("animated format with limited support")
        } else if descriptor.is_modern_format
            && candidate.size() > self.config.modern_format_size_threshold
        {
            Some("large modern-format image")
        } else if candidate.size() < self.config.min_size_floor {
            Some("below minimum size floor")
        } else {
            None
        }
    }

    #[cfg(test)]
    fn available_budget(&self) -> usize {
        self.budget.available_permits()
    }
}

/// Synchronous raster-surface re-encode, bounded by decode/encode time.
fn raster_fallback(candidate: AttachmentCandidate, targets: &EncodeTargets) -> ProcessedAttachment {
    match raster_reencode(candidate.bytes(), targets) {
        Ok(encoded) => {
            info!(
                file_name = candidate.file_name(),
                from_bytes = candidate.size(),
                to_bytes = encoded.payload.len(),
                "raster fallback re-encoded attachment image"
            );
            ProcessedAttachment::reencoded(
                candidate,
                encoded.payload,
                encoded.content_type,
                encoded.preview,
            )
        }
        Err(error) => {
            warn!(%error, "raster fallback failed; using original payload");
            ProcessedAttachment::passthrough(candidate)
        }
    }
}

/// Background worker: decode, orientation-correct, resize, re-encode.
///
/// Animated sources are preserved losslessly; only their preview is derived
/// from the first frame. Modern formats re-encode to JPEG for broad support,
/// everything else to WebP.
fn encode_image(bytes: &[u8], targets: &EncodeTargets) -> anyhow::Result<EncodedImage> {
    let image = prepare(bytes, targets)?;
    let preview = make_preview(&image);

    if targets.preserve_animation {
        return Ok(EncodedImage {
            payload: bytes.to_vec(),
            content_type: targets.source_type.clone(),
            preview,
        });
    }

    if targets.prefer_jpeg {
        let payload = encode_jpeg(&image, targets.quality)?;
        Ok(EncodedImage {
            payload,
            content_type: "image/jpeg".to_owned(),
            preview,
        })
    } else {
        let rgba = image.to_rgba8();
        let (width, height) = rgba.dimensions();
        let payload = webp::Encoder::from_rgba(&rgba, width, height)
            .encode(targets.quality)
            .to_vec();
        Ok(EncodedImage {
            payload,
            content_type: "image/webp".to_owned(),
            preview,
        })
    }
}

/// Fallback path: same targets, but always a plain JPEG raster encode.
fn raster_reencode(bytes: &[u8], targets: &EncodeTargets) -> anyhow::Result<EncodedImage> {
    let image = prepare(bytes, targets)?;
    let preview = make_preview(&image);
    let payload = encode_jpeg(&image, targets.quality)?;
    Ok(EncodedImage {
        payload,
        content_type: "image/jpeg".to_owned(),
        preview,
    })
}

fn prepare(bytes: &[u8], targets: &EncodeTargets) -> anyhow::Result<DynamicImage> {
    let image = image::load_from_memory(bytes).context("failed to decode image")?;
    let image = targets.orientation.correct(image);
    Ok(resize_to_fit(image, targets.max_width, targets.max_height))
}

fn resize_to_fit(image: DynamicImage, max_width: u32, max_height: u32) -> DynamicImage {
    let (width, height) = (image.width(), image.height());
    if width <= max_width && height <= max_height {
        return image;
    }

    let scale_x = max_width as f32 / width as f32;
    let scale_y = max_height as f32 / height as f32;
    let scale = scale_x.min(scale_y);

    let new_width = (width as f32 * scale).round() as u32;
    let new_height = (height as f32 * scale).round() as u32;

    image.resize_exact(new_width, new_height, image::imageops::FilterType::Lanczos3)
}

fn encode_jpeg(image: &DynamicImage, quality: f32) -> anyhow::Result<Vec<u8>> {
    // JPEG carries no alpha channel.
    let rgb = image.to_rgb8();
    let mut buf = Vec::new();
    let mut cursor = Cursor::new(&mut buf);
    let encoder =
        image::codecs::jpeg::JpegEncoder::new_with_quality(&mut cursor, quality.round() as u8);
    rgb.write_with_encoder(encoder)
        .context("failed to encode jpeg")?;
    Ok(buf)
}

fn make_preview(image: &DynamicImage) -> Option<LocalPreview> {
    let thumbnail = image
        .thumbnail(THUMBNAIL_WIDTH, THUMBNAIL_HEIGHT)
        .to_rgba8();
    let (width, height) = thumbnail.dimensions();
    let thumbnail_webp = webp::Encoder::from_rgba(&thumbnail, width, height)
        .encode(90.0)
        .to_vec();
    let blurhash = blurhash::encode(4, 3, width, height, &thumbnail)
        .inspect_err(|error| error!(%error, "failed to encode blurhash"))
        .ok();
    Some(LocalPreview::new(thumbnail_webp, blurhash, width, height))
}
