// THEORY:
// Screenshots carry a burned-in caption (capture time and incident number) so a
// reviewer can match an image to its record even after it has been copied out of
// the evidence tree. The caption alphabet is tiny: digits, '-', ':', '#' and
// space. A 5x7 bitmap font covers it without shipping a font file, and the text
// is drawn on a dark banner so it stays legible on any background.

use image::{Rgb, RgbImage};

const GLYPH_W: u32 = 5;
const GLYPH_H: u32 = 7;
const SPACING: u32 = 1;
const MARGIN: u32 = 4;

const TEXT_COLOR: Rgb<u8> = Rgb([255, 40, 40]);
const BANNER_COLOR: Rgb<u8> = Rgb([0, 0, 0]);

/// Rows of a glyph, top to bottom. Bit 4 is the leftmost column.
fn glyph(c: char) -> [u8; 7] {
    match c {
        '0' => [0x0E, 0x11, 0x13, 0x15, 0x19, 0x11, 0x0E],
        '1' => [0x04, 0x0C, 0x04, 0x04, 0x04, 0x04, 0x0E],
        '2' => [0x0E, 0x11, 0x01, 0x02, 0x04, 0x08, 0x1F],
        '3' => [0x1F, 0x02, 0x04, 0x02, 0x01, 0x11, 0x0E],
        '4' => [0x02, 0x06, 0x0A, 0x12, 0x1F, 0x02, 0x02],
        '5' => [0x1F, 0x10, 0x1E, 0x01, 0x01, 0x11, 0x0E],
        '6' => [0x06, 0x08, 0x10, 0x1E, 0x11, 0x11, 0x0E],
        '7' => [0x1F, 0x01, 0x02, 0x04, 0x08, 0x08, 0x08],
        '8' => [0x0E, 0x11, 0x11, 0x0E, 0x11, 0x11, 0x0E],
        '9' => [0x0E, 0x11, 0x11, 0x0F, 0x01, 0x02, 0x0C],
        '-' => [0x00, 0x00, 0x00, 0x1F, 0x00, 0x00, 0x00],
        ':' => [0x00, 0x0C, 0x0C, 0x00, 0x0C, 0x0C, 0x00],
        '#' => [0x0A, 0x0A, 0x1F, 0x0A, 0x1F, 0x0A, 0x0A],
        _ => [0; 7],
    }
}

/// Pixel size of `text` rendered at `scale`, banner margins included.
pub fn caption_size(text: &str, scale: u32) -> (u32, u32) {
    let chars = text.chars().count() as u32;
    let width = chars * (GLYPH_W + SPACING) * scale + 2 * MARGIN;
    let height = GLYPH_H * scale + 2 * MARGIN;
    (width, height)
}

/// Draws `text` on a banner anchored at the top-left corner. Anything that
/// falls outside the image is clipped.
pub fn burn_caption(image: &mut RgbImage, text: &str, scale: u32) {
    let scale = scale.max(1);
    let (img_w, img_h) = image.dimensions();
    let (banner_w, banner_h) = caption_size(text, scale);

    for y in 0..banner_h.min(img_h) {
        for x in 0..banner_w.min(img_w) {
            image.put_pixel(x, y, BANNER_COLOR);
        }
    }

    let mut pen_x = MARGIN;
    for c in text.chars() {
        let rows = glyph(c);
        for (row, bits) in rows.iter().enumerate() {
            for col in 0..GLYPH_W {
                if bits & (0x10 >> col) == 0 {
                    continue;
                }
                let x0 = pen_x + col * scale;
                let y0 = MARGIN + row as u32 * scale;
                for dy in 0..scale {
                    for dx in 0..scale {
                        let (x, y) = (x0 + dx, y0 + dy);
                        if x < img_w && y < img_h {
                            image.put_pixel(x, y, TEXT_COLOR);
                        }
                    }
                }
            }
        }
        pen_x += (GLYPH_W + SPACING) * scale;
    }
}
