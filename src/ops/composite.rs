// ============================================================================
// OVERLAY COMPOSITING - live tool previews over the committed surface
// ============================================================================

use image::{Rgba, RgbaImage};
use rayon::prelude::*;

use crate::canvas::{BlendMode, TiledImage};

/// Compose a transient overlay over the committed pixels for display.
///
/// The result has `base`'s size.  It starts transparent, receives `base`
/// with source-over (which leaves `base` unchanged), then receives `overlay`
/// anchored at (0, 0) with `mode`.  Overlay pixels outside `base` are
/// clipped.  Neither input is modified.  All pixels are premultiplied RGBA.
pub fn compose(base: &TiledImage, overlay: &RgbaImage, mode: BlendMode) -> RgbaImage {
    let mut result = base.to_rgba_image();
    let (width, height) = result.dimensions();
    if width == 0 || height == 0 {
        return result;
    }

    let span_w = width.min(overlay.width()) as usize;
    let span_h = height.min(overlay.height()) as usize;
    let row_len = width as usize * 4;
    let overlay_row_len = overlay.width() as usize * 4;
    let overlay_raw = overlay.as_raw();

    result
        .as_mut()
        .par_chunks_mut(row_len)
        .take(span_h)
        .enumerate()
        .for_each(|(y, row)| {
            let src_row = &overlay_raw[y * overlay_row_len..y * overlay_row_len + span_w * 4];
            for (dst, src) in row[..span_w * 4]
                .chunks_exact_mut(4)
                .zip(src_row.chunks_exact(4))
            {
                let out = blend_premultiplied(
                    Rgba([dst[0], dst[1], dst[2], dst[3]]),
                    Rgba([src[0], src[1], src[2], src[3]]),
                    mode,
                );
                dst.copy_from_slice(&out.0);
            }
        });

    result
}

/// Combine one premultiplied `top` pixel onto a premultiplied `base` pixel.
pub fn blend_premultiplied(base: Rgba<u8>, top: Rgba<u8>, mode: BlendMode) -> Rgba<u8> {
    // Fully transparent top pixel leaves the base untouched (except for a
    // straight copy, which copies the transparency).
    if top[3] == 0 && mode != BlendMode::Overwrite {
        return base;
    }

    match mode {
        BlendMode::Overwrite => return top,
        BlendMode::Normal if top[3] == 255 => return top,
        _ => {}
    }

    let d = [unit(base[0]), unit(base[1]), unit(base[2])];
    let s = [unit(top[0]), unit(top[1]), unit(top[2])];
    let da = unit(base[3]);
    let sa = unit(top[3]);
    let union_a = sa + da - sa * da;

    let (rgb, a): ([f32; 3], f32) = match mode {
        BlendMode::Normal | BlendMode::Overwrite => {
            (per_channel(s, d, |s, d| s + d * (1.0 - sa)), union_a)
        }
        BlendMode::Xor => (
            per_channel(s, d, |s, d| s * (1.0 - da) + d * (1.0 - sa)),
            sa * (1.0 - da) + da * (1.0 - sa),
        ),
        BlendMode::Difference => (
            per_channel(s, d, |s, d| s + d - 2.0 * (s * da).min(d * sa)),
            union_a,
        ),
        BlendMode::Multiply => (
            per_channel(s, d, |s, d| s * d + s * (1.0 - da) + d * (1.0 - sa)),
            union_a,
        ),
        BlendMode::Screen => (per_channel(s, d, |s, d| s + d - s * d), union_a),
        BlendMode::Additive => (per_channel(s, d, |s, d| (s + d).min(1.0)), (sa + da).min(1.0)),
    };

    // Premultiplied colour can never exceed its alpha.
    Rgba([
        byte(rgb[0].min(a)),
        byte(rgb[1].min(a)),
        byte(rgb[2].min(a)),
        byte(a),
    ])
}

#[inline(always)]
fn unit(v: u8) -> f32 {
    v as f32 / 255.0
}

#[inline(always)]
fn byte(v: f32) -> u8 {
    (v * 255.0).round().clamp(0.0, 255.0) as u8
}

#[inline(always)]
fn per_channel(s: [f32; 3], d: [f32; 3], f: impl Fn(f32, f32) -> f32) -> [f32; 3] {
    [f(s[0], d[0]), f(s[1], d[1]), f(s[2], d[2])]
}

#[cfg(test)]
mod tests {
    use super::*;

    const WHITE: Rgba<u8> = Rgba([255, 255, 255, 255]);
    const BLACK: Rgba<u8> = Rgba([0, 0, 0, 255]);
    const CLEAR: Rgba<u8> = Rgba([0, 0, 0, 0]);

    fn white_base(w: u32, h: u32) -> TiledImage {
        TiledImage::new_filled(w, h, WHITE)
    }

    #[test]
    fn compose_keeps_base_size_and_leaves_inputs_alone() {
        let base = white_base(4, 4);
        let mut overlay = RgbaImage::new(6, 2);
        overlay.put_pixel(1, 1, BLACK);
        overlay.put_pixel(5, 0, BLACK);
        let overlay_before = overlay.clone();

        let out = compose(&base, &overlay, BlendMode::Normal);

        assert_eq!(out.dimensions(), (4, 4));
        assert_eq!(*out.get_pixel(1, 1), BLACK);
        assert_eq!(*out.get_pixel(0, 0), WHITE);
        assert_eq!(*out.get_pixel(3, 3), WHITE);
        assert!(base.same_pixels(&white_base(4, 4)));
        assert_eq!(overlay, overlay_before);
    }

    #[test]
    fn normal_blends_translucent_overlay_over_base() {
        // 50% black, premultiplied
        let out = blend_premultiplied(WHITE, Rgba([0, 0, 0, 128]), BlendMode::Normal);
        assert_eq!(out[3], 255);
        assert!(out[0].abs_diff(127) <= 1);
    }

    #[test]
    fn xor_punches_through_where_both_are_opaque() {
        assert_eq!(blend_premultiplied(WHITE, BLACK, BlendMode::Xor), CLEAR);
        assert_eq!(blend_premultiplied(CLEAR, BLACK, BlendMode::Xor), BLACK);
        assert_eq!(blend_premultiplied(WHITE, CLEAR, BlendMode::Xor), WHITE);
    }

    #[test]
    fn difference_inverts_under_white() {
        assert_eq!(blend_premultiplied(WHITE, WHITE, BlendMode::Difference), BLACK);
        assert_eq!(blend_premultiplied(BLACK, WHITE, BlendMode::Difference), WHITE);
    }

    #[test]
    fn overwrite_copies_transparency() {
        assert_eq!(blend_premultiplied(WHITE, CLEAR, BlendMode::Overwrite), CLEAR);
    }

    #[test]
    fn multiply_screen_and_additive_on_opaque_pixels() {
        let grey = Rgba([128, 128, 128, 255]);
        assert_eq!(blend_premultiplied(WHITE, grey, BlendMode::Multiply), grey);
        assert_eq!(blend_premultiplied(BLACK, grey, BlendMode::Screen), grey);
        assert_eq!(blend_premultiplied(grey, grey, BlendMode::Additive), WHITE);
    }

    #[test]
    fn empty_base_composes_to_empty_image() {
        let out = compose(&TiledImage::new(0, 0), &RgbaImage::new(3, 3), BlendMode::Xor);
        assert_eq!(out.dimensions(), (0, 0));
    }
}
