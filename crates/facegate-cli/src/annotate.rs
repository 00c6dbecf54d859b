//! Identification output drawn onto the probe image: a box around each
//! face with its label underneath.

use ab_glyph::{FontVec, PxScale};
use anyhow::{anyhow, Context, Result};
use facegate_core::BoundingBox;
use image::{Rgb, RgbImage};
use imageproc::drawing::{draw_filled_rect_mut, draw_hollow_rect_mut, draw_text_mut, text_size};
use imageproc::rect::Rect;
use std::path::Path;

const BOX_COLOUR: Rgb<u8> = Rgb([0, 0, 255]);
const TEXT_COLOUR: Rgb<u8> = Rgb([255, 255, 255]);
const LABEL_SCALE: f32 = 16.0;
const LABEL_PADDING: u32 = 2;

/// Tried in order when no font is given.
const SYSTEM_FONTS: &[&str] = &[
    "/usr/share/fonts/truetype/dejavu/DejaVuSans.ttf",
    "/usr/share/fonts/TTF/DejaVuSans.ttf",
    "/usr/share/fonts/dejavu/DejaVuSans.ttf",
    "/usr/share/fonts/truetype/liberation/LiberationSans-Regular.ttf",
];

pub struct Annotation {
    pub bounding_box: BoundingBox,
    pub label: String,
}

/// Load `explicit`, or the first usable system font. `None` when nothing
/// was given and no system font is installed.
pub fn load_font(explicit: Option<&Path>) -> Result<Option<FontVec>> {
    if let Some(path) = explicit {
        let data = std::fs::read(path).with_context(|| format!("reading font {}", path.display()))?;
        let font = FontVec::try_from_vec(data).map_err(|e| anyhow!("{}: {e}", path.display()))?;
        return Ok(Some(font));
    }
    Ok(SYSTEM_FONTS
        .iter()
        .filter_map(|p| std::fs::read(p).ok())
        .find_map(|data| FontVec::try_from_vec(data).ok()))
}

/// Draw every face's box, and its label when a font is available.
pub fn annotate(image: &mut RgbImage, faces: &[Annotation], font: Option<&FontVec>) {
    let scale = PxScale::from(LABEL_SCALE);
    for face in faces {
        let Some(rect) = face_rect(&face.bounding_box) else {
            tracing::debug!(label = %face.label, "skipping degenerate bounding box");
            continue;
        };
        draw_hollow_rect_mut(image, rect, BOX_COLOUR);

        let Some(font) = font else { continue };
        let (w, h) = text_size(scale, font, &face.label);
        let bar = Rect::at(rect.left(), rect.bottom() + 1)
            .of_size(w.max(1) + 2 * LABEL_PADDING, h.max(1) + 2 * LABEL_PADDING);
        draw_filled_rect_mut(image, bar, BOX_COLOUR);
        let pad = LABEL_PADDING as i32;
        draw_text_mut(
            image,
            TEXT_COLOUR,
            bar.left() + pad,
            bar.top() + pad,
            scale,
            font,
            &face.label,
        );
    }
}

fn face_rect(b: &BoundingBox) -> Option<Rect> {
    let width = u32::try_from(b.right - b.left).ok().filter(|w| *w > 0)?;
    let height = u32::try_from(b.bottom - b.top).ok().filter(|h| *h > 0)?;
    Some(Rect::at(i32::try_from(b.left).ok()?, i32::try_from(b.top).ok()?).of_size(width, height))
}
