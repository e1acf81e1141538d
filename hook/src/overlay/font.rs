//! Built-in 8x8 bitmap font, printable ASCII.
//!
//! Glyphs are packed row-major into a 16x6 atlas of 8x8 cells, one byte per
//! texel (coverage 0 or 255).

pub const GLYPH_SIZE: usize = 8;
pub const ATLAS_COLUMNS: usize = 16;
pub const ATLAS_ROWS: usize = 6;
pub const ATLAS_WIDTH: usize = ATLAS_COLUMNS * GLYPH_SIZE;
pub const ATLAS_HEIGHT: usize = ATLAS_ROWS * GLYPH_SIZE;

const FIRST_CHAR: u8 = b' ';
const GLYPH_COUNT: usize = ATLAS_COLUMNS * ATLAS_ROWS;

/// One byte per glyph row, most significant bit leftmost.
#[rustfmt::skip]
const GLYPHS: [[u8; GLYPH_SIZE]; GLYPH_COUNT] = [
    // ' '..
    [0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00],
    [0x18, 0x18, 0x18, 0x18, 0x18, 0x00, 0x18, 0x00],
    [0x6C, 0x6C, 0x24, 0x00, 0x00, 0x00, 0x00, 0x00],
    [0x6C, 0xFE, 0x6C, 0x6C, 0xFE, 0x6C, 0x00, 0x00],
    [0x18, 0x7E, 0xC0, 0x7C, 0x06, 0xFC, 0x18, 0x00],
    [0xC6, 0xCC, 0x18, 0x30, 0x66, 0xC6, 0x00, 0x00],
    [0x38, 0x6C, 0x38, 0x76, 0xDC, 0xCC, 0x76, 0x00],
    [0x18, 0x18, 0x30, 0x00, 0x00, 0x00, 0x00, 0x00],
    [0x0C, 0x18, 0x30, 0x30, 0x30, 0x18, 0x0C, 0x00],
    [0x30, 0x18, 0x0C, 0x0C, 0x0C, 0x18, 0x30, 0x00],
    [0x00, 0x66, 0x3C, 0xFF, 0x3C, 0x66, 0x00, 0x00],
    [0x00, 0x18, 0x18, 0x7E, 0x18, 0x18, 0x00, 0x00],
    [0x00, 0x00, 0x00, 0x00, 0x00, 0x18, 0x18, 0x30],
    [0x00, 0x00, 0x00, 0x7E, 0x00, 0x00, 0x00, 0x00],
    [0x00, 0x00, 0x00, 0x00, 0x00, 0x18, 0x18, 0x00],
    [0x06, 0x0C, 0x18, 0x30, 0x60, 0xC0, 0x00, 0x00],
    // '0'..
    [0x7C, 0xC6, 0xCE, 0xD6, 0xE6, 0xC6, 0x7C, 0x00],
    [0x18, 0x38, 0x18, 0x18, 0x18, 0x18, 0x7E, 0x00],
    [0x7C, 0xC6, 0x06, 0x1C, 0x70, 0xC6, 0xFE, 0x00],
    [0x7C, 0xC6, 0x06, 0x3C, 0x06, 0xC6, 0x7C, 0x00],
    [0x1C, 0x3C, 0x6C, 0xCC, 0xFE, 0x0C, 0x1E, 0x00],
    [0xFE, 0xC0, 0xFC, 0x06, 0x06, 0xC6, 0x7C, 0x00],
    [0x38, 0x60, 0xC0, 0xFC, 0xC6, 0xC6, 0x7C, 0x00],
    [0xFE, 0xC6, 0x0C, 0x18, 0x30, 0x30, 0x30, 0x00],
    [0x7C, 0xC6, 0xC6, 0x7C, 0xC6, 0xC6, 0x7C, 0x00],
    [0x7C, 0xC6, 0xC6, 0x7E, 0x06, 0x0C, 0x78, 0x00],
    [0x00, 0x18, 0x18, 0x00, 0x00, 0x18, 0x18, 0x00],
    [0x00, 0x18, 0x18, 0x00, 0x00, 0x18, 0x18, 0x30],
    [0x0C, 0x18, 0x30, 0x60, 0x30, 0x18, 0x0C, 0x00],
    [0x00, 0x00, 0x7E, 0x00, 0x7E, 0x00, 0x00, 0x00],
    [0x30, 0x18, 0x0C, 0x06, 0x0C, 0x18, 0x30, 0x00],
    [0x7C, 0xC6, 0x0C, 0x18, 0x18, 0x00, 0x18, 0x00],
    // '@'..
    [0x7C, 0xC6, 0xDE, 0xDE, 0xDE, 0xC0, 0x7C, 0x00],
    [0x38, 0x6C, 0xC6, 0xC6, 0xFE, 0xC6, 0xC6, 0x00],
    [0xFC, 0xC6, 0xC6, 0xFC, 0xC6, 0xC6, 0xFC, 0x00],
    [0x7C, 0xC6, 0xC0, 0xC0, 0xC0, 0xC6, 0x7C, 0x00],
    [0xF8, 0xCC, 0xC6, 0xC6, 0xC6, 0xCC, 0xF8, 0x00],
    [0xFE, 0xC0, 0xC0, 0xFC, 0xC0, 0xC0, 0xFE, 0x00],
    [0xFE, 0xC0, 0xC0, 0xFC, 0xC0, 0xC0, 0xC0, 0x00],
    [0x7C, 0xC6, 0xC0, 0xCE, 0xC6, 0xC6, 0x7E, 0x00],
    [0xC6, 0xC6, 0xC6, 0xFE, 0xC6, 0xC6, 0xC6, 0x00],
    [0x7E, 0x18, 0x18, 0x18, 0x18, 0x18, 0x7E, 0x00],
    [0x1E, 0x06, 0x06, 0x06, 0xC6, 0xC6, 0x7C, 0x00],
    [0xC6, 0xCC, 0xD8, 0xF0, 0xD8, 0xCC, 0xC6, 0x00],
    [0xC0, 0xC0, 0xC0, 0xC0, 0xC0, 0xC0, 0xFE, 0x00],
    [0xC6, 0xEE, 0xFE, 0xD6, 0xC6, 0xC6, 0xC6, 0x00],
    [0xC6, 0xE6, 0xF6, 0xDE, 0xCE, 0xC6, 0xC6, 0x00],
    [0x7C, 0xC6, 0xC6, 0xC6, 0xC6, 0xC6, 0x7C, 0x00],
    // 'P'..
    [0xFC, 0xC6, 0xC6, 0xFC, 0xC0, 0xC0, 0xC0, 0x00],
    [0x7C, 0xC6, 0xC6, 0xC6, 0xD6, 0xDE, 0x7C, 0x06],
    [0xFC, 0xC6, 0xC6, 0xFC, 0xD8, 0xCC, 0xC6, 0x00],
    [0x7C, 0xC6, 0xC0, 0x7C, 0x06, 0xC6, 0x7C, 0x00],
    [0xFF, 0x18, 0x18, 0x18, 0x18, 0x18, 0x18, 0x00],
    [0xC6, 0xC6, 0xC6, 0xC6, 0xC6, 0xC6, 0xFE, 0x00],
    [0xC6, 0xC6, 0xC6, 0xC6, 0xC6, 0x6C, 0x38, 0x00],
    [0xC6, 0xC6, 0xC6, 0xD6, 0xFE, 0xEE, 0xC6, 0x00],
    [0xC6, 0xC6, 0x6C, 0x38, 0x6C, 0xC6, 0xC6, 0x00],
    [0xC3, 0xC3, 0x66, 0x3C, 0x18, 0x18, 0x18, 0x00],
    [0xFE, 0x06, 0x0C, 0x18, 0x30, 0x60, 0xFE, 0x00],
    [0x3C, 0x30, 0x30, 0x30, 0x30, 0x30, 0x3C, 0x00],
    [0xC0, 0x60, 0x30, 0x18, 0x0C, 0x06, 0x00, 0x00],
    [0x3C, 0x0C, 0x0C, 0x0C, 0x0C, 0x0C, 0x3C, 0x00],
    [0x10, 0x38, 0x6C, 0xC6, 0x00, 0x00, 0x00, 0x00],
    [0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0xFF],
    // '`'..
    [0x30, 0x18, 0x0C, 0x00, 0x00, 0x00, 0x00, 0x00],
    [0x00, 0x00, 0x7C, 0x06, 0x7E, 0xC6, 0x7E, 0x00],
    [0xC0, 0xC0, 0xFC, 0xC6, 0xC6, 0xC6, 0xFC, 0x00],
    [0x00, 0x00, 0x7C, 0xC6, 0xC0, 0xC6, 0x7C, 0x00],
    [0x06, 0x06, 0x7E, 0xC6, 0xC6, 0xC6, 0x7E, 0x00],
    [0x00, 0x00, 0x7C, 0xC6, 0xFE, 0xC0, 0x7C, 0x00],
    [0x1C, 0x36, 0x30, 0x7C, 0x30, 0x30, 0x30, 0x00],
    [0x00, 0x00, 0x7E, 0xC6, 0xC6, 0x7E, 0x06, 0x7C],
    [0xC0, 0xC0, 0xFC, 0xC6, 0xC6, 0xC6, 0xC6, 0x00],
    [0x18, 0x00, 0x38, 0x18, 0x18, 0x18, 0x3C, 0x00],
    [0x06, 0x00, 0x0E, 0x06, 0x06, 0x06, 0xC6, 0x7C],
    [0xC0, 0xC0, 0xCC, 0xD8, 0xF0, 0xD8, 0xCC, 0x00],
    [0x38, 0x18, 0x18, 0x18, 0x18, 0x18, 0x3C, 0x00],
    [0x00, 0x00, 0xEC, 0xFE, 0xD6, 0xD6, 0xD6, 0x00],
    [0x00, 0x00, 0xFC, 0xC6, 0xC6, 0xC6, 0xC6, 0x00],
    [0x00, 0x00, 0x7C, 0xC6, 0xC6, 0xC6, 0x7C, 0x00],
    // 'p'..
    [0x00, 0x00, 0xFC, 0xC6, 0xC6, 0xFC, 0xC0, 0xC0],
    [0x00, 0x00, 0x7E, 0xC6, 0xC6, 0x7E, 0x06, 0x06],
    [0x00, 0x00, 0xDC, 0xE6, 0xC0, 0xC0, 0xC0, 0x00],
    [0x00, 0x00, 0x7E, 0xC0, 0x7C, 0x06, 0xFC, 0x00],
    [0x30, 0x30, 0x7C, 0x30, 0x30, 0x36, 0x1C, 0x00],
    [0x00, 0x00, 0xC6, 0xC6, 0xC6, 0xC6, 0x7E, 0x00],
    [0x00, 0x00, 0xC6, 0xC6, 0xC6, 0x6C, 0x38, 0x00],
    [0x00, 0x00, 0xC6, 0xD6, 0xD6, 0xFE, 0x6C, 0x00],
    [0x00, 0x00, 0xC6, 0x6C, 0x38, 0x6C, 0xC6, 0x00],
    [0x00, 0x00, 0xC6, 0xC6, 0xC6, 0x7E, 0x06, 0x7C],
    [0x00, 0x00, 0xFE, 0x0C, 0x38, 0x60, 0xFE, 0x00],
    [0x0E, 0x18, 0x18, 0x70, 0x18, 0x18, 0x0E, 0x00],
    [0x18, 0x18, 0x18, 0x00, 0x18, 0x18, 0x18, 0x00],
    [0x70, 0x18, 0x18, 0x0E, 0x18, 0x18, 0x70, 0x00],
    [0x76, 0xDC, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00],
    [0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00],
];

/// Atlas cell of `c`; characters outside the font map to the blank cell.
pub fn glyph_index(c: char) -> usize {
    let code = c as u32;
    if (FIRST_CHAR as u32..FIRST_CHAR as u32 + GLYPH_COUNT as u32).contains(&code) {
        (code - FIRST_CHAR as u32) as usize
    } else {
        0
    }
}

/// Normalized texture coordinates `(u0, v0, u1, v1)` of a glyph.
pub fn glyph_uv(c: char) -> [f32; 4] {
    let index = glyph_index(c);
    let u0 = ((index % ATLAS_COLUMNS) * GLYPH_SIZE) as f32 / ATLAS_WIDTH as f32;
    let v0 = ((index / ATLAS_COLUMNS) * GLYPH_SIZE) as f32 / ATLAS_HEIGHT as f32;
    [
        u0,
        v0,
        u0 + GLYPH_SIZE as f32 / ATLAS_WIDTH as f32,
        v0 + GLYPH_SIZE as f32 / ATLAS_HEIGHT as f32,
    ]
}

/// Expand the glyph bitmaps into an R8 atlas, `ATLAS_WIDTH` bytes per row.
pub fn atlas_pixels() -> Vec<u8> {
    let mut pixels = vec![0u8; ATLAS_WIDTH * ATLAS_HEIGHT];
    for (index, glyph) in GLYPHS.iter().enumerate() {
        let origin_x = (index % ATLAS_COLUMNS) * GLYPH_SIZE;
        let origin_y = (index / ATLAS_COLUMNS) * GLYPH_SIZE;
        for (y, bits) in glyph.iter().enumerate() {
            for x in 0..GLYPH_SIZE {
                if bits & (0x80 >> x) != 0 {
                    pixels[(origin_y + y) * ATLAS_WIDTH + origin_x + x] = 0xFF;
                }
            }
        }
    }
    pixels
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn printable_ascii_maps_to_its_cell() {
        assert_eq!(glyph_index(' '), 0);
        assert_eq!(glyph_index('0'), 16);
        assert_eq!(glyph_index('~'), 94);
        assert_eq!(glyph_index('\u{e9}'), 0);
        assert_eq!(glyph_index('\n'), 0);
    }

    #[test]
    fn uv_covers_exactly_one_cell() {
        let [u0, v0, u1, v1] = glyph_uv('0');
        assert_eq!((u0, v0), (0.0, 8.0 / 48.0));
        assert_eq!(u1 - u0, 8.0 / 128.0);
        assert!((v1 - v0 - 8.0 / 48.0).abs() < 1e-6);
    }

    #[test]
    fn atlas_has_ink_only_where_glyphs_do() {
        let pixels = atlas_pixels();
        assert_eq!(pixels.len(), 128 * 48);
        // Space is blank.
        assert!((0..8).all(|y| pixels[y * ATLAS_WIDTH..y * ATLAS_WIDTH + 8].iter().all(|&p| p == 0)));
        // '!' has ink in its top row.
        assert!(pixels[8..16].iter().any(|&p| p == 0xFF));
    }
}
