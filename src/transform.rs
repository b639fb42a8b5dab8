//! The inverse image transform stack: predictor, cross-colour, subtract-green, and
//! colour-indexing.
//!
//! Transforms are read during the header phase (recursing into auxiliary image streams for their
//! side data) and applied in reverse read order over each row band during the flush.

use std::fmt;
use std::fmt::Display;

use derive_more::Display;

use crate::bitstream::BitBufReader;
use crate::error::{DecodeError, Result, ResultExt};
use crate::huffman::{decode_entropy_image, subsample_size};
use crate::ensure_matches_attach;

/// Maximum depth of the transform stack.
pub(crate) const NUM_TRANSFORMS: usize = 4;

const ARGB_BLACK: u32 = 0xff00_0000;

//
// crate-internal types
//

#[repr(u8)]
#[derive(Clone, Copy, Debug, Display, PartialEq, Eq)]
pub(crate) enum TransformType {
    #[display(fmt = "predictor")]
    Predictor = 0b00,
    #[display(fmt = "cross color")]
    CrossColor = 0b01,
    #[display(fmt = "subtract green")]
    SubtractGreen = 0b10,
    #[display(fmt = "color indexing")]
    ColorIndexing = 0b11,
}

/// One inverse transform with its recorded geometry and auxiliary data.
///
/// `xsize` is the stream width at the point the transform was read; colour-indexing packs the
/// stream width for everything read after it.
pub(crate) struct Transform {
    transform_type: TransformType,
    bits: u8,
    xsize: u32,
    ysize: u32,
    data: Vec<u32>,
}

#[derive(Display)]
#[display(fmt = "invalid predictor `{_0}`")]
struct InvalidPredictor(u8);

#[derive(Display)]
#[display(fmt = "invalid transform block bits `{_0}`")]
struct InvalidTransformBits(u8);

#[derive(Display)]
#[display(fmt = "while parsing {_0} transform")]
struct WhileParsingTransform(TransformType);

//
// TransformType impls
//

impl TransformType {
    const PREDICTOR: u8 = TransformType::Predictor as u8;
    const CROSS_COLOR: u8 = TransformType::CrossColor as u8;
    const SUBTRACT_GREEN: u8 = TransformType::SubtractGreen as u8;
    const COLOR_INDEXING: u8 = TransformType::ColorIndexing as u8;

    fn read(reader: &mut BitBufReader) -> Result<Self> {
        match reader.read(2)? {
            Self::PREDICTOR => Ok(Self::Predictor),
            Self::CROSS_COLOR => Ok(Self::CrossColor),
            Self::SUBTRACT_GREEN => Ok(Self::SubtractGreen),
            Self::COLOR_INDEXING => Ok(Self::ColorIndexing),
            0b100.. => unreachable!(),
        }
    }
}

//
// Transform impls
//

impl Transform {
    /// Read one transform, narrowing `xsize` in place when colour-indexing packs pixels.
    pub fn read(reader: &mut BitBufReader, xsize: &mut u32, ysize: u32) -> Result<Self> {
        let transform_type = TransformType::read(reader)?;
        let recorded_xsize = *xsize;
        match transform_type {
            TransformType::Predictor | TransformType::CrossColor => {
                let bits: u8 = reader
                    .read(4)
                    .attach_printable(WhileParsingTransform(transform_type))?;
                ensure_matches_attach!(
                    bits,
                    1..=9,
                    DecodeError::InvalidBitstream,
                    InvalidTransformBits(bits),
                    WhileParsingTransform(transform_type),
                );
                let data = decode_entropy_image(
                    reader,
                    subsample_size(recorded_xsize, bits),
                    subsample_size(ysize, bits),
                )
                .attach_printable(WhileParsingTransform(transform_type))?;
                if transform_type == TransformType::Predictor {
                    for &pixel in &data {
                        let mode = (pixel >> 8) as u8;
                        ensure_matches_attach!(
                            mode,
                            0..=13,
                            DecodeError::InvalidBitstream,
                            InvalidPredictor(mode),
                            WhileParsingTransform(transform_type),
                        );
                    }
                }
                Ok(Self { transform_type, bits, xsize: recorded_xsize, ysize, data })
            }
            TransformType::SubtractGreen => {
                Ok(Self { transform_type, bits: 0, xsize: recorded_xsize, ysize, data: Vec::new() })
            }
            TransformType::ColorIndexing => {
                let num_colors = 1 + u32::from(
                    reader
                        .read::<u8>(8)
                        .attach_printable(WhileParsingTransform(transform_type))?,
                );
                let bits = match num_colors {
                    17.. => 0,
                    5..=16 => 1,
                    3..=4 => 2,
                    0..=2 => 3,
                };
                let palette = decode_entropy_image(reader, num_colors, 1)
                    .attach_printable(WhileParsingTransform(transform_type))?;
                let data = expand_color_map(&palette, bits);
                *xsize = subsample_size(recorded_xsize, bits);
                Ok(Self { transform_type, bits, xsize: recorded_xsize, ysize, data })
            }
        }
    }

    pub fn transform_type(&self) -> TransformType {
        self.transform_type
    }

    /// Undo this transform over the rows `[row_start, row_end)`.
    ///
    /// `raw_band` is the band in the raw decoded raster; `cache` holds the working copy at
    /// `band_offset`, preceded by one row of scratch carrying the previous band's last predicted
    /// row. All kernels work in place on the cache except colour-indexing, which expands
    /// `raw_band` along the x-axis.
    pub fn apply_inverse(
        &self,
        row_start: u32,
        row_end: u32,
        raw_band: &[u32],
        cache: &mut [u32],
        band_offset: usize,
    ) {
        let num_rows = (row_end - row_start) as usize;
        let width = self.xsize as usize;
        match self.transform_type {
            TransformType::SubtractGreen => {
                add_green_to_blue_and_red(&mut cache[band_offset..band_offset + width * num_rows]);
            }
            TransformType::Predictor => {
                self.predictor_inverse(row_start, row_end, cache, band_offset);
                if row_end != self.ysize {
                    // The last predicted row becomes the top-prediction row of the next band.
                    let last = band_offset + (num_rows - 1) * width;
                    cache.copy_within(last..last + width, band_offset - width);
                }
            }
            TransformType::CrossColor => {
                self.cross_color_inverse(row_start, &mut cache[band_offset..band_offset + width * num_rows]);
            }
            TransformType::ColorIndexing => {
                self.color_index_inverse(num_rows, raw_band, &mut cache[band_offset..band_offset + width * num_rows]);
            }
        }
    }

    fn predictor_inverse(&self, row_start: u32, row_end: u32, cache: &mut [u32], band_offset: usize) {
        let width = self.xsize as usize;
        let tiles_per_row = subsample_size(self.xsize, self.bits) as usize;
        let tile_mask = (1usize << self.bits) - 1;

        let mut y = row_start;
        let mut base = band_offset;
        if y == 0 {
            // The first row follows the left mode after a fixed black pixel 0.
            cache[base] = add_pixels(cache[base], ARGB_BLACK);
            for x in 1..width {
                cache[base + x] = add_pixels(cache[base + x], cache[base + x - 1]);
            }
            y += 1;
            base += width;
        }
        while y < row_end {
            let tile_row = &self.data[(y >> self.bits) as usize * tiles_per_row..][..tiles_per_row];
            // The first pixel of each row follows the top mode.
            cache[base] = add_pixels(cache[base], cache[base - width]);
            let mut tile = 0;
            let mut mode = (tile_row[0] >> 8) as u8 & 0xf;
            for x in 1..width {
                if (x & tile_mask) == 0 {
                    tile += 1;
                    mode = (tile_row[tile] >> 8) as u8 & 0xf;
                }
                let left = cache[base + x - 1];
                let top = cache[base + x - width];
                let top_left = cache[base + x - width - 1];
                // For the last column this reads the first pixel of the current row, matching the
                // contiguous layout of the raster.
                let top_right = cache[base + x - width + 1];
                cache[base + x] = add_pixels(cache[base + x], predict(mode, left, top, top_left, top_right));
            }
            y += 1;
            base += width;
        }
    }

    fn cross_color_inverse(&self, row_start: u32, band: &mut [u32]) {
        let width = self.xsize as usize;
        let tiles_per_row = subsample_size(self.xsize, self.bits) as usize;
        for (row_index, row) in band.chunks_exact_mut(width).enumerate() {
            let y = row_start + row_index as u32;
            let tile_row = &self.data[(y >> self.bits) as usize * tiles_per_row..][..tiles_per_row];
            for (x, pixel) in row.iter_mut().enumerate() {
                *pixel = transform_color_inverse(tile_row[x >> self.bits], *pixel);
            }
        }
    }

    fn color_index_inverse(&self, num_rows: usize, raw_band: &[u32], out: &mut [u32]) {
        let width = self.xsize as usize;
        let color_map = &self.data;
        if self.bits == 0 {
            for (dst, src) in out.iter_mut().zip(raw_band) {
                *dst = color_map[(src >> 8) as usize & 0xff];
            }
        } else {
            let bits_per_pixel = 8 >> self.bits;
            let count_mask = (1usize << self.bits) - 1;
            let bit_mask = (1u32 << bits_per_pixel) - 1;
            let packed_width = subsample_size(self.xsize, self.bits) as usize;
            for row_index in 0..num_rows {
                let src_row = &raw_band[row_index * packed_width..][..packed_width];
                let dst_row = &mut out[row_index * width..][..width];
                let mut packed = 0u32;
                let mut src_x = 0;
                for (x, dst) in dst_row.iter_mut().enumerate() {
                    if (x & count_mask) == 0 {
                        packed = src_row[src_x] >> 8 & 0xff;
                        src_x += 1;
                    }
                    *dst = color_map[(packed & bit_mask) as usize];
                    packed >>= bits_per_pixel;
                }
            }
        }
    }
}

impl Display for Transform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.transform_type {
            TransformType::Predictor | TransformType::CrossColor => {
                write!(f, "{} transform: block size {}", self.transform_type, 1u32 << self.bits)
            }
            TransformType::SubtractGreen => write!(f, "{} transform", self.transform_type),
            TransformType::ColorIndexing => {
                write!(f, "{} transform: {} pixels per byte", self.transform_type, 1u32 << self.bits)
            }
        }
    }
}

//
// crate-internal functions
//

/// Per-channel modulo-256 pixel addition.
pub(crate) fn add_pixels(a: u32, b: u32) -> u32 {
    let alpha_and_green = (a & 0xff00_ff00).wrapping_add(b & 0xff00_ff00);
    let red_and_blue = (a & 0x00ff_00ff).wrapping_add(b & 0x00ff_00ff);
    (alpha_and_green & 0xff00_ff00) | (red_and_blue & 0x00ff_00ff)
}

//
// private functions
//

fn add_green_to_blue_and_red(band: &mut [u32]) {
    for pixel in band {
        let green = *pixel >> 8 & 0xff;
        let mut red_blue = *pixel & 0x00ff_00ff;
        red_blue = red_blue.wrapping_add(green << 16 | green);
        *pixel = (*pixel & 0xff00_ff00) | (red_blue & 0x00ff_00ff);
    }
}

/// The expanded colour map is differenced byte-wise and padded with black so every representable
/// packed index stays in bounds.
fn expand_color_map(palette: &[u32], bits: u8) -> Vec<u32> {
    let final_num_colors = 1usize << (8 >> bits);
    let mut color_map = vec![0u32; final_num_colors];
    color_map[0] = palette[0];
    for (i, &delta) in palette.iter().enumerate().skip(1) {
        color_map[i] = add_pixels(color_map[i - 1], delta);
    }
    color_map
}

fn average2(a: u32, b: u32) -> u32 {
    (((a ^ b) & 0xfefe_fefe) >> 1).wrapping_add(a & b)
}

fn sub3(a: i32, b: i32, c: i32) -> i32 {
    (b - c).abs() - (a - c).abs()
}

fn select(a: u32, b: u32, c: u32) -> u32 {
    let pa_minus_pb = (0..4).fold(0, |acc, shift| {
        let shift = shift * 8;
        acc + sub3(
            (a >> shift & 0xff) as i32,
            (b >> shift & 0xff) as i32,
            (c >> shift & 0xff) as i32,
        )
    });
    if pa_minus_pb <= 0 {
        a
    } else {
        b
    }
}

fn clip255(value: i32) -> u32 {
    value.clamp(0, 255) as u32
}

fn clamped_add_subtract_full(c0: u32, c1: u32, c2: u32) -> u32 {
    (0..4).fold(0, |acc, shift| {
        let shift = shift * 8;
        let channel = (c0 >> shift & 0xff) as i32 + (c1 >> shift & 0xff) as i32 - (c2 >> shift & 0xff) as i32;
        acc | clip255(channel) << shift
    })
}

fn clamped_add_subtract_half(c0: u32, c1: u32, c2: u32) -> u32 {
    let ave = average2(c0, c1);
    (0..4).fold(0, |acc, shift| {
        let shift = shift * 8;
        let a = (ave >> shift & 0xff) as i32;
        let b = (c2 >> shift & 0xff) as i32;
        acc | clip255(a + (a - b) / 2) << shift
    })
}

fn predict(mode: u8, left: u32, top: u32, top_left: u32, top_right: u32) -> u32 {
    match mode {
        0 => ARGB_BLACK,
        1 => left,
        2 => top,
        3 => top_right,
        4 => top_left,
        5 => average2(average2(left, top_right), top),
        6 => average2(left, top_left),
        7 => average2(left, top),
        8 => average2(top_left, top),
        9 => average2(top, top_right),
        10 => average2(average2(left, top_left), average2(top, top_right)),
        11 => select(top, left, top_left),
        12 => clamped_add_subtract_full(left, top, top_left),
        13 => clamped_add_subtract_half(left, top, top_left),
        // Unused table slots predict black, like the reference decoders.
        14.. => ARGB_BLACK,
    }
}

fn color_transform_delta(predictor: i8, channel: i8) -> u32 {
    ((i32::from(predictor) * i32::from(channel)) >> 5) as u32
}

fn transform_color_inverse(multipliers: u32, argb: u32) -> u32 {
    let green_to_red = multipliers as u8 as i8;
    let green_to_blue = (multipliers >> 8) as u8 as i8;
    let red_to_blue = (multipliers >> 16) as u8 as i8;

    let green = (argb >> 8) as u8 as i8;
    let mut red = argb >> 16 & 0xff;
    let mut blue = argb & 0xff;
    red = red.wrapping_add(color_transform_delta(green_to_red, green)) & 0xff;
    blue = blue.wrapping_add(color_transform_delta(green_to_blue, green));
    blue = blue.wrapping_add(color_transform_delta(red_to_blue, red as u8 as i8)) & 0xff;
    (argb & 0xff00_ff00) | red << 16 | blue
}

#[cfg(test)]
mod test {
    use super::*;

    fn transform(transform_type: TransformType, bits: u8, xsize: u32, ysize: u32, data: Vec<u32>) -> Transform {
        Transform { transform_type, bits, xsize, ysize, data }
    }

    #[test]
    fn add_pixels_is_per_channel() {
        assert_eq!(add_pixels(0x01020304, 0x10203040), 0x11223344);
        assert_eq!(add_pixels(0xffffffff, 0x01010101), 0x00000000);
    }

    #[test]
    fn subtract_green_adds_green_into_red_and_blue() {
        let t = transform(TransformType::SubtractGreen, 0, 2, 1, Vec::new());
        // One scratch row of width 2, then the band.
        let mut cache = vec![0, 0, 0xff10_3020, 0xff00_ff01];
        t.apply_inverse(0, 1, &[], &mut cache, 2);
        assert_eq!(cache[2], 0xff40_3050);
        assert_eq!(cache[3], 0xffff_ff00);
    }

    #[test]
    fn predictor_first_row_is_left_predicted() {
        // Residuals: pixel 0 is offset from opaque black, the rest from their left neighbour.
        let data = vec![0u32; 1]; // single tile, mode 0 (unused on row 0)
        let t = transform(TransformType::Predictor, 9, 4, 1, data);
        let mut cache = vec![0u32; 4 + 4];
        cache[4..].copy_from_slice(&[0x00000001, 0x00000001, 0x00000100, 0x01000000]);
        t.apply_inverse(0, 1, &[], &mut cache, 4);
        assert_eq!(cache[4..], [0xff000001, 0xff000002, 0xff000102, 0x00000102]);
    }

    #[test]
    fn predictor_top_mode() {
        // Two rows, mode 2 (top) on the second row.
        let data = vec![2 << 8];
        let t = transform(TransformType::Predictor, 9, 2, 2, data);
        let mut cache = vec![0u32; 2 + 4];
        cache[2..].copy_from_slice(&[0x00000010, 0x00000001, 0x00000002, 0x00000003]);
        t.apply_inverse(0, 2, &[], &mut cache, 2);
        // Row 0: black + 0x10, then left + 1.
        assert_eq!(cache[2..4], [0xff000010, 0xff000011]);
        // Row 1: top + 2, top + 3.
        assert_eq!(cache[4..6], [0xff000012, 0xff000014]);
    }

    #[test]
    fn predictor_select_and_clamp_modes() {
        assert_eq!(select(0x10, 0x20, 0x10), 0x20);
        assert_eq!(select(0x10, 0x20, 0x22), 0x10);
        assert_eq!(clamped_add_subtract_full(0x80, 0x80, 0x10), 0xf0);
        assert_eq!(clamped_add_subtract_full(0xff, 0xff, 0x00), 0xff);
        assert_eq!(clamped_add_subtract_half(0x40, 0x20, 0x10), 0x40);
    }

    #[test]
    fn cross_color_identity_with_zero_multipliers() {
        let t = transform(TransformType::CrossColor, 2, 4, 1, vec![0]);
        let mut cache = vec![0u32; 4 + 4];
        cache[4..].copy_from_slice(&[0xff102030; 4]);
        t.apply_inverse(0, 1, &[], &mut cache, 4);
        assert_eq!(cache[4..], [0xff102030; 4]);
    }

    #[test]
    fn cross_color_applies_green_to_red() {
        // green_to_red = 32: delta = (32 * green) >> 5 = green.
        let t = transform(TransformType::CrossColor, 2, 1, 1, vec![32]);
        let mut cache = vec![0u32; 1 + 1];
        cache[1] = 0xff00_4000;
        t.apply_inverse(0, 1, &[], &mut cache, 1);
        assert_eq!(cache[1], 0xff40_4000);
    }

    #[test]
    fn color_map_expansion_is_cumulative_and_padded() {
        let expanded = expand_color_map(&[0xff000010, 0x00000010, 0x00000010], 2);
        assert_eq!(expanded, [0xff000010, 0xff000020, 0xff000030, 0]);
    }

    #[test]
    fn color_index_unpacks_lsb_first() {
        // num_colors 4: bits = 2, four 2-bit indices per byte.
        let palette = [0xff000000u32, 0xff000001, 0xff000002, 0xff000003];
        let mut data = vec![0u32; 4];
        data.copy_from_slice(&palette);
        let t = transform(TransformType::ColorIndexing, 2, 4, 1, data);
        // Packed green byte 0b11_10_01_00 unpacks to indices 0, 1, 2, 3.
        let raw = [0b1110_0100u32 << 8];
        let mut cache = vec![0u32; 4 + 4];
        t.apply_inverse(0, 1, &raw, &mut cache, 4);
        assert_eq!(cache[4..], palette);
    }
}
