//! Animated-image detection.
//!
//! Animated content must be transmitted untouched: re-encoding would keep
//! only the first frame. Detection is container-specific — frame count for
//! GIF, the `ANIM`/`ANMF` chunks for WebP, the `acTL` chunk for APNG.

use std::io::Cursor;

use anyhow::{bail, Context, Result};
use image::{codecs::gif::GifDecoder, AnimationDecoder, ImageReader};

/// Reports whether `bytes` hold an animated image. Errors only when the
/// container itself cannot be recognized; callers decide the fallback
/// policy for unreadable files.
pub fn is_animated(bytes: &[u8]) -> Result<bool> {
    let reader = ImageReader::new(Cursor::new(bytes))
        .with_guessed_format()
        .context("failed to sniff image container")?;
    let Some(container) = reader.format() else {
        bail!("unrecognized image container");
    };

    Ok(match container {
        image::ImageFormat::Gif => gif_has_multiple_frames(bytes)?,
        image::ImageFormat::WebP => webp_has_animation(bytes),
        image::ImageFormat::Png => png_has_animation_control(bytes),
        _ => false,
    })
}

fn gif_has_multiple_frames(bytes: &[u8]) -> Result<bool> {
    let decoder = GifDecoder::new(Cursor::new(bytes)).context("failed to open gif stream")?;
    let mut frames = decoder.into_frames();
    if frames.next().is_none() {
        return Ok(false);
    }
    Ok(frames.next().is_some_and(|frame| frame.is_ok()))
}

/// Walks the top-level RIFF chunks; an animated WebP carries `ANIM` (and
/// per-frame `ANMF`) chunks after the `WEBP` fourcc.
fn webp_has_animation(bytes: &[u8]) -> bool {
    if bytes.len() < 12 || &bytes[..4] != b"RIFF" || &bytes[8..12] != b"WEBP" {
        return false;
    }
    let mut offset = 12;
    while offset + 8 <= bytes.len() {
        let id = &bytes[offset..offset + 4];
        if id == b"ANIM" || id == b"ANMF" {
            return true;
        }
        let size = u32::from_le_bytes([
            bytes[offset + 4],
            bytes[offset + 5],
            bytes[offset + 6],
            bytes[offset + 7],
        ]) as usize;
        // chunk payloads are padded to even length
        offset += 8 + size + (size & 1);
    }
    false
}

/// APNG marks itself with an `acTL` chunk ahead of the first `IDAT`.
fn png_has_animation_control(bytes: &[u8]) -> bool {
    const SIGNATURE: [u8; 8] = [0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A];
    if bytes.len() < 8 || bytes[..8] != SIGNATURE {
        return false;
    }
    let mut offset = 8;
    while offset + 8 <= bytes.len() {
        let length = u32::from_be_bytes([
            bytes[offset],
            bytes[offset + 1],
            bytes[offset + 2],
            bytes[offset + 3],
        ]) as usize;
        let kind = &bytes[offset + 4..offset + 8];
        if kind == b"acTL" {
            return true;
        }
        if kind == b"IDAT" || kind == b"IEND" {
            return false;
        }
        // length + type + data + crc
        offset += 12 + length;
    }
    false
}
