//! Placement geometry: source-rect clamping, cell-size inference, and
//! composition of the scaled raster under the crop/contain/fill/none
//! policies.

use fast_image_resize as fr;
use std::num::NonZeroU32;

use crate::error::CommandError;
use crate::image::{Raster, ScaleMode};

/// Pixel size of one character cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CellSize {
    pub width: u16,
    pub height: u16,
}

/// A source rectangle clamped into an image's pixel space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SourceRect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

/// Clamps a requested source rectangle against the image bounds: the
/// origin is pulled inside the image, and zero or out-of-range extents
/// become "from origin to image edge". Negative inputs must already be
/// clamped to 0 by the caller.
pub fn clamp_source_rect(
    x: u32,
    y: u32,
    width: u32,
    height: u32,
    pix_width: u32,
    pix_height: u32,
) -> SourceRect {
    let x = x.min(pix_width.saturating_sub(1));
    let y = y.min(pix_height.saturating_sub(1));
    let max_w = pix_width - x;
    let max_h = pix_height - y;
    let width = if width == 0 || width > max_w { max_w } else { width };
    let height = if height == 0 || height > max_h { max_h } else { height };
    SourceRect {
        x,
        y,
        width,
        height,
    }
}

/// Fills in zero `cols`/`rows` from the source rectangle and cell size.
///
/// With both zero, the placement covers the source at natural size. With
/// exactly one zero and `Contain` scaling, the missing dimension is
/// chosen so the aspect-preserved image just fits the given one; any
/// other mode falls back to the pixel/cell ratio.
pub fn infer_cols_rows(
    cols: u16,
    rows: u16,
    src: SourceRect,
    cell: CellSize,
    scale_mode: ScaleMode,
) -> (u16, u16) {
    let cell_w = cell.width.max(1) as u32;
    let cell_h = cell.height.max(1) as u32;
    let natural_cols = clamp_cells(src.width.div_ceil(cell_w));
    let natural_rows = clamp_cells(src.height.div_ceil(cell_h));

    match (cols, rows) {
        (0, 0) => (natural_cols, natural_rows),
        (0, rows) => {
            let cols = if scale_mode == ScaleMode::Contain && src.height != 0 {
                let scaled_h = rows as u64 * cell_h as u64;
                let dest_w = (src.width as u64 * scaled_h).div_ceil(src.height as u64);
                clamp_cells(dest_w.div_ceil(cell_w as u64) as u32)
            } else {
                natural_cols
            };
            (cols, rows)
        }
        (cols, 0) => {
            let rows = if scale_mode == ScaleMode::Contain && src.width != 0 {
                let scaled_w = cols as u64 * cell_w as u64;
                let dest_h = (src.height as u64 * scaled_w).div_ceil(src.width as u64);
                clamp_cells(dest_h.div_ceil(cell_h as u64) as u32)
            } else {
                natural_rows
            };
            (cols, rows)
        }
        (cols, rows) => (cols, rows),
    }
}

fn clamp_cells(cells: u32) -> u16 {
    cells.clamp(1, u16::MAX as u32) as u16
}

/// Composes the scaled raster for a placement: `cols*cell_w` by
/// `rows*cell_h` pixels, cleared to transparent, with the source rect
/// mapped in according to the scale mode.
///
/// Fails with `EFBIG` if the target would exceed `max_ram` bytes.
pub fn compose_scaled(
    original: &Raster,
    src: SourceRect,
    cols: u16,
    rows: u16,
    cell: CellSize,
    scale_mode: ScaleMode,
    max_ram: u64,
) -> Result<Raster, CommandError> {
    let scaled_w = cols as u32 * cell.width as u32;
    let scaled_h = rows as u32 * cell.height as u32;
    if scaled_w == 0 || scaled_h == 0 || src.width == 0 || src.height == 0 {
        return Err(CommandError::ebadf(format!(
            "cannot scale a {}x{} source into {}x{} pixels",
            src.width, src.height, scaled_w, scaled_h
        )));
    }
    if scaled_w as u64 * scaled_h as u64 * 4 > max_ram {
        return Err(CommandError::efbig(format!(
            "scaled placement needs {} bytes, budget is {max_ram}",
            scaled_w as u64 * scaled_h as u64 * 4
        )));
    }

    let mode = match scale_mode {
        ScaleMode::NoneOrContain => {
            if src.width <= scaled_w && src.height <= scaled_h {
                ScaleMode::None
            } else {
                ScaleMode::Contain
            }
        }
        other => other,
    };

    let mut target = Raster::transparent(scaled_w, scaled_h);
    match mode {
        ScaleMode::None => {
            target.copy_from(original, src.x, src.y, src.width, src.height, 0, 0);
        }
        ScaleMode::Fill => {
            let stretched = resize_rect(original, src, scaled_w, scaled_h)?;
            target.copy_from(&stretched, 0, 0, scaled_w, scaled_h, 0, 0);
        }
        ScaleMode::Contain => {
            // Wider target than source: height binds; otherwise width does.
            let (dest_w, dest_h) = if scaled_w as u64 * src.height as u64
                > src.width as u64 * scaled_h as u64
            {
                let w = (src.width as u64 * scaled_h as u64 / src.height as u64).max(1) as u32;
                (w, scaled_h)
            } else {
                let h = (src.height as u64 * scaled_w as u64 / src.width as u64).max(1) as u32;
                (scaled_w, h)
            };
            let fitted = resize_rect(original, src, dest_w, dest_h)?;
            let dst_x = (scaled_w - dest_w) / 2;
            let dst_y = (scaled_h - dest_h) / 2;
            target.copy_from(&fitted, 0, 0, dest_w, dest_h, dst_x, dst_y);
        }
        ScaleMode::NoneOrContain => unreachable!("resolved above"),
    }
    Ok(target)
}

/// Crops a rectangle out of `src` and resizes it to `dst_w` x `dst_h`.
fn resize_rect(
    src: &Raster,
    rect: SourceRect,
    dst_w: u32,
    dst_h: u32,
) -> Result<Raster, CommandError> {
    let mut cropped = Raster::transparent(rect.width, rect.height);
    cropped.copy_from(src, rect.x, rect.y, rect.width, rect.height, 0, 0);
    if rect.width == dst_w && rect.height == dst_h {
        return Ok(cropped);
    }

    let src_w = NonZeroU32::new(rect.width)
        .ok_or_else(|| CommandError::eio("empty source rectangle".to_string()))?;
    let src_h = NonZeroU32::new(rect.height)
        .ok_or_else(|| CommandError::eio("empty source rectangle".to_string()))?;
    let src_view = fr::Image::from_vec_u8(src_w, src_h, cropped.into_vec(), fr::PixelType::U8x4)
        .map_err(|e| CommandError::eio(format!("resize source: {e}")))?;

    let dst_w_nz = NonZeroU32::new(dst_w)
        .ok_or_else(|| CommandError::eio("empty scale target".to_string()))?;
    let dst_h_nz = NonZeroU32::new(dst_h)
        .ok_or_else(|| CommandError::eio("empty scale target".to_string()))?;
    let mut dst = fr::Image::new(dst_w_nz, dst_h_nz, fr::PixelType::U8x4);

    let mut resizer = fr::Resizer::new(fr::ResizeAlg::Nearest);
    resizer
        .resize(&src_view.view(), &mut dst.view_mut())
        .map_err(|e| CommandError::eio(format!("resize failed: {e}")))?;

    Raster::from_rgba(dst_w, dst_h, dst.into_vec())
        .ok_or_else(|| CommandError::eio("resizer produced a short buffer".to_string()))
}
