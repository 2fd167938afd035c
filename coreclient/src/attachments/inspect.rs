// SPDX-FileCopyrightText: 2025 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Pure classification of image candidates.
//!
//! Produces the compatibility descriptor consumed by the compression
//! pipeline's skip/transform decision. The inspector itself never rejects a
//! file.

use std::io::Cursor;

use exif::{In, Tag};
use image::DynamicImage;
use tracing::trace;

const PNG_SIGNATURE: [u8; 8] = [0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A];

/// Display correction derived from the EXIF orientation values 1-8.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Orientation {
    #[default]
    Normal,
    FlipHorizontal,
    Rotate180,
    FlipVertical,
    Rotate90FlipHorizontal,
    Rotate90,
    Rotate270FlipHorizontal,
    Rotate270,
}

impl Orientation {
    fn from_exif_value(value: u32) -> Self {
        match value {
            2 => Self::FlipHorizontal,
            3 => Self::Rotate180,
            4 => Self::FlipVertical,
            5 => Self::Rotate90FlipHorizontal,
            6 => Self::Rotate90,
            7 => Self::Rotate270FlipHorizontal,
            8 => Self::Rotate270,
            _ => Self::Normal,
        }
    }

    /// Applies the correction to a decoded image.
    pub(crate) fn correct(self, image: DynamicImage) -> DynamicImage {
        match self {
            Self::Normal => image,
            Self::FlipHorizontal => image.fliph(),
            Self::Rotate180 => image.rotate180(),
            Self::FlipVertical => image.flipv(),
            Self::Rotate90FlipHorizontal => image.rotate90().fliph(),
            Self::Rotate90 => image.rotate90(),
            Self::Rotate270FlipHorizontal => image.rotate270().fliph(),
            Self::Rotate270 => image.rotate270(),
        }
    }
}

/// Compatibility verdict for one image candidate.
///
/// Computed once per candidate and attached for the lifetime of its
/// processing. Advisory input to the compression decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FormatDescriptor {
    pub is_animated: bool,
    pub is_modern_format: bool,
    pub broadly_supported: bool,
    pub can_preview: bool,
    /// Re-encode target the compressor should prefer, if any.
    pub suggested_type: Option<&'static str>,
    pub orientation: Orientation,
}

/// Classifies an image payload.
///
/// The payload is sniffed; the declared type is only used when sniffing
/// fails (e.g. a truncated header).
pub fn inspect_image(bytes: &[u8], declared_type: &str) -> FormatDescriptor {
    let content_type = infer::get(bytes)
        .map(|kind| kind.mime_type())
        .unwrap_or(declared_type);

    let is_animated = match content_type {
        "image/gif" => gif_frame_count(bytes) > 1,
        "image/webp" => webp_has_chunk(bytes, b"ANIM"),
        "image/png" | "image/apng" => png_has_chunk(bytes, b"acTL"),
        _ => false,
    };
    let is_modern_format = matches!(
        content_type,
        "image/webp" | "image/avif" | "image/heic" | "image/heif"
    );
    // HEIC/AVIF cannot be decoded by the raster surface on all platforms.
    let broadly_supported = matches!(
        content_type,
        "image/jpeg" | "image/png" | "image/gif" | "image/bmp" | "image/webp"
    );
    let suggested_type = if is_animated {
        None
    } else if is_modern_format {
        Some("image/jpeg")
    } else {
        Some("image/webp")
    };
    let orientation = read_orientation(bytes);

    trace!(
        content_type,
        is_animated,
        is_modern_format,
        ?orientation,
        "inspected image attachment"
    );

    FormatDescriptor {
        is_animated,
        is_modern_format,
        broadly_supported,
        can_preview: broadly_supported,
        suggested_type,
        orientation,
    }
}

fn read_orientation(bytes: &[u8]) -> Orientation {
    let exif_reader = exif::Reader::new();
    let mut cursor = Cursor::new(bytes);
    exif_reader
        .read_from_container(&mut cursor)
        .ok()
        .and_then(|exif| {
            exif.get_field(Tag::Orientation, In::PRIMARY)
                .and_then(|field| field.value.get_uint(0))
        })
        .map(Orientation::from_exif_value)
        .unwrap_or_default()
}

/// Counts image descriptors in a GIF stream.
///
/// Walks the block structure (header, logical screen descriptor, optional
/// global color table, then extensions/image descriptors until the trailer).
/// Stops counting on malformed data; a best-effort count is enough for the
/// animation probe.
fn gif_frame_count(bytes: &[u8]) -> usize {
    if bytes.len() < 13 || !bytes.starts_with(b"GIF8") {
        return 0;
    }
    let mut pos = 13;
    let packed = bytes[10];
    if packed & 0x80 != 0 {
        // global color table: 3 bytes per entry, 2^(n+1) entries
        pos += 3 * (2usize << (packed & 0x07));
    }

    let mut frames = 0;
    while pos < bytes.len() {
        match bytes[pos] {
            // trailer
            0x3B => break,
            // extension block: label byte, then data sub-blocks
            0x21 => {
                let Some(next) = skip_sub_blocks(bytes, pos + 2) else {
                    break;
                };
                pos = next;
            }
            // image descriptor
            0x2C => {
                frames += 1;
                if pos + 10 > bytes.len() {
                    break;
                }
                let packed = bytes[pos + 9];
                pos += 10;
                if packed & 0x80 != 0 {
                    pos += 3 * (2usize << (packed & 0x07));
                }
                // LZW minimum code size byte, then data sub-blocks
                let Some(next) = skip_sub_blocks(bytes, pos + 1) else {
                    break;
                };
                pos = next;
            }
            _ => break,
        }
    }
    frames
}

fn skip_sub_blocks(bytes: &[u8], mut pos: usize) -> Option<usize> {
    loop {
        let len = *bytes.get(pos)? as usize;
        pos += 1;
        if len == 0 {
            return Some(pos);
        }
        pos += len;
    }
}

/// Looks for a chunk with the given fourcc in a WebP RIFF container.
fn webp_has_chunk(bytes: &[u8], fourcc: &[u8; 4]) -> bool {
    if bytes.len() < 12 || &bytes[0..4] != b"RIFF" || &bytes[8..12] != b"WEBP" {
        return false;
    }
    let mut pos = 12;
    while pos + 8 <= bytes.len() {
        if &bytes[pos..pos + 4] == fourcc {
            return true;
        }
        let size = u32::from_le_bytes([
            bytes[pos + 4],
            bytes[pos + 5],
            bytes[pos + 6],
            bytes[pos + 7],
        ]) as usize;
        // chunk payloads are padded to even length
        pos += 8 + size + (size & 1);
    }
    false
}

/// Looks for a chunk of the given type in a PNG stream, up to the image data.
///
/// The `acTL` animation control chunk is required to precede `IDAT`, so the
/// scan stops there.
fn png_has_chunk(bytes: &[u8], chunk_type: &[u8; 4]) -> bool {
    if !bytes.starts_with(&PNG_SIGNATURE) {
        return false;
    }
    let mut pos = PNG_SIGNATURE.len();
    while pos + 8 <= bytes.len() {
        let len = u32::from_be_bytes([bytes[pos], bytes[pos + 1], bytes[pos + 2], bytes[pos + 3]])
            as usize;
        let current = &bytes[pos + 4..pos + 8];
        if current == chunk_type {
            return true;
        }
        if current == b"IDAT" || current == b"IEND" {
            return false;
        }
        // length + type + payload + crc
        pos += 12 + len;
    }
    false
}

#[cfg(test)]
mod test {
    use super::*;

    // Minimal single-frame GIF: header, screen descriptor without a color
    // table, one image descriptor with an empty data stream, trailer.
    fn gif(frames: usize) -> Vec<u8> {
        let mut bytes = b"GIF89a".to_vec();
        bytes.extend_from_slice(&[1, 0, 1, 0, 0x00, 0, 0]);
        for _ in 0..frames {
            bytes.push(0x2C);
            bytes.extend_from_slice(&[0, 0, 0, 0, 1, 0, 1, 0, 0x00]);
            bytes.push(0x02); // LZW minimum code size
            bytes.extend_from_slice(&[1, 0x00]); // one data sub-block, then terminator
            bytes.push(0x00);
        }
        bytes.push(0x3B);
        bytes
    }

    fn webp(with_anim: bool) -> Vec<u8> {
        let mut bytes = b"RIFF".to_vec();
        bytes.extend_from_slice(&[0, 0, 0, 0]);
        bytes.extend_from_slice(b"WEBP");
        bytes.extend_from_slice(b"VP8X");
        bytes.extend_from_slice(&10u32.to_le_bytes());
        bytes.extend_from_slice(&[0u8; 10]);
        if with_anim {
            bytes.extend_from_slice(b"ANIM");
            bytes.extend_from_slice(&6u32.to_le_bytes());
            bytes.extend_from_slice(&[0u8; 6]);
        }
        bytes
    }

    fn png(with_actl: bool) -> Vec<u8> {
        let mut bytes = PNG_SIGNATURE.to_vec();
        // IHDR
        bytes.extend_from_slice(&13u32.to_be_bytes());
        bytes.extend_from_slice(b"IHDR");
        bytes.extend_from_slice(&[0u8; 13 + 4]);
        if with_actl {
            bytes.extend_from_slice(&8u32.to_be_bytes());
            bytes.extend_from_slice(b"acTL");
            bytes.extend_from_slice(&[0u8; 8 + 4]);
        }
        bytes.extend_from_slice(&0u32.to_be_bytes());
        bytes.extend_from_slice(b"IDAT");
        bytes.extend_from_slice(&[0u8; 4]);
        bytes
    }

    #[test]
    fn gif_animation_probe() {
        assert_eq!(gif_frame_count(&gif(1)), 1);
        assert_eq!(gif_frame_count(&gif(2)), 2);
        assert_eq!(gif_frame_count(b"not a gif"), 0);

        let descriptor = inspect_image(&gif(2), "image/gif");
        assert!(descriptor.is_animated);
        assert!(descriptor.broadly_supported);
        assert!(!descriptor.is_modern_format);

        let descriptor = inspect_image(&gif(1), "image/gif");
        assert!(!descriptor.is_animated);
    }

    #[test]
    fn webp_animation_probe() {
        assert!(webp_has_chunk(&webp(true), b"ANIM"));
        assert!(!webp_has_chunk(&webp(false), b"ANIM"));

        let descriptor = inspect_image(&webp(true), "image/webp");
        assert!(descriptor.is_animated);
        assert!(descriptor.is_modern_format);
        assert_eq!(descriptor.suggested_type, None);

        let descriptor = inspect_image(&webp(false), "image/webp");
        assert!(!descriptor.is_animated);
        assert_eq!(descriptor.suggested_type, Some("image/jpeg"));
    }

    #[test]
    fn apng_animation_probe() {
        assert!(png_has_chunk(&png(true), b"acTL"));
        assert!(!png_has_chunk(&png(false), b"acTL"));

        let descriptor = inspect_image(&png(true), "image/png");
        assert!(descriptor.is_animated);

        let descriptor = inspect_image(&png(false), "image/png");
        assert!(!descriptor.is_animated);
        assert_eq!(descriptor.suggested_type, Some("image/webp"));
    }

    #[test]
    fn orientation_mapping_covers_all_exif_values() {
        assert_eq!(Orientation::from_exif_value(1), Orientation::Normal);
        assert_eq!(Orientation::from_exif_value(2), Orientation::FlipHorizontal);
        assert_eq!(Orientation::from_exif_value(3), Orientation::Rotate180);
        assert_eq!(Orientation::from_exif_value(4), Orientation::FlipVertical);
        assert_eq!(
            Orientation::from_exif_value(5),
            Orientation::Rotate90FlipHorizontal
        );
        assert_eq!(Orientation::from_exif_value(6), Orientation::Rotate90);
        assert_eq!(
            Orientation::from_exif_value(7),
            Orientation::Rotate270FlipHorizontal
        );
        assert_eq!(Orientation::from_exif_value(8), Orientation::Rotate270);
        // Out-of-range values fall back to no correction.
        assert_eq!(Orientation::from_exif_value(0), Orientation::Normal);
        assert_eq!(Orientation::from_exif_value(9), Orientation::Normal);
    }

    #[test]
    fn orientation_correction_changes_dimensions() {
        let image = DynamicImage::new_rgba8(4, 2);
        let rotated = Orientation::Rotate90.correct(image.clone());
        assert_eq!((rotated.width(), rotated.height()), (2, 4));
        let flipped = Orientation::FlipHorizontal.correct(image);
        assert_eq!((flipped.width(), flipped.height()), (4, 2));
    }

    #[test]
    fn declared_type_is_a_fallback_only() {
        // Sniffing wins over a wrong declared type.
        let descriptor = inspect_image(&gif(2), "image/png");
        assert!(descriptor.is_animated);
        // Unsniffable bytes fall back to the declared type.
        let descriptor = inspect_image(&[0u8; 4], "image/heic");
        assert!(descriptor.is_modern_format);
        assert!(!descriptor.broadly_supported);
        assert!(!descriptor.can_preview);
    }
}
