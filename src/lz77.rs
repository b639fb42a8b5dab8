//! The per-pixel decode loop interleaving literals, backward references, and colour-cache
//! lookups, driven by the green symbol stream.

use derive_more::Display;

use crate::bitstream::BitBufReader;
use crate::error::{DecodeError, Result};
use crate::huffman::{HTreeGroup, HuffmanImage, Metadata, NUM_LENGTH_CODES, NUM_LITERAL_CODES};
use crate::{bail_attach, ensure_attach, ensure_matches_attach};

/// Rows per row-block handed to the transform/emit pipeline.
pub(crate) const NUM_ARGB_CACHE_ROWS: u32 = 16;

/// The 120 nearest 2D displacements, encoded `yoffset << 4 | (8 - xoffset)`.
#[rustfmt::skip]
const CODE_TO_PLANE: [u8; 120] = [
    0x18, 0x07, 0x17, 0x19, 0x28, 0x06, 0x27, 0x29, 0x16, 0x1a,
    0x26, 0x2a, 0x38, 0x05, 0x37, 0x39, 0x15, 0x1b, 0x36, 0x3a,
    0x25, 0x2b, 0x48, 0x04, 0x47, 0x49, 0x14, 0x1c, 0x35, 0x3b,
    0x46, 0x4a, 0x24, 0x2c, 0x58, 0x45, 0x4b, 0x34, 0x3c, 0x03,
    0x57, 0x59, 0x13, 0x1d, 0x56, 0x5a, 0x23, 0x2d, 0x44, 0x4c,
    0x55, 0x5b, 0x33, 0x3d, 0x68, 0x02, 0x67, 0x69, 0x12, 0x1e,
    0x66, 0x6a, 0x22, 0x2e, 0x54, 0x5c, 0x43, 0x4d, 0x65, 0x6b,
    0x32, 0x3e, 0x78, 0x01, 0x77, 0x79, 0x53, 0x5d, 0x11, 0x1f,
    0x64, 0x6c, 0x42, 0x4e, 0x76, 0x7a, 0x21, 0x2f, 0x75, 0x7b,
    0x31, 0x3f, 0x63, 0x6d, 0x52, 0x5e, 0x00, 0x74, 0x7c, 0x41,
    0x4f, 0x10, 0x20, 0x62, 0x6e, 0x30, 0x73, 0x7d, 0x51, 0x5f,
    0x40, 0x72, 0x7e, 0x61, 0x6f, 0x50, 0x71, 0x7f, 0x60, 0x70,
];

#[derive(Display)]
#[display(fmt = "invalid back-reference distance `{_0}` at pixel `{_1}`")]
struct InvalidBackRefDistance(usize, usize);

#[derive(Display)]
#[display(fmt = "invalid back-reference length `{_0}` at pixel `{_1}` with image length `{_2}`")]
struct InvalidBackRefLength(u32, usize, usize);

#[derive(Display)]
#[display(fmt = "color cache symbol without a negotiated color cache")]
struct UnexpectedColorCacheSymbol;

#[derive(Display)]
#[display(fmt = "green symbol `{_0}` outside the negotiated alphabet")]
struct GreenSymbolOutOfRange(u32);

/// Map a small plane code to a scanline distance; codes past the table are linear distances.
pub(crate) fn plane_code_to_distance(width: u32, plane_code: u32) -> u32 {
    if plane_code > CODE_TO_PLANE.len() as u32 {
        plane_code - CODE_TO_PLANE.len() as u32
    } else {
        let dist_code = i64::from(CODE_TO_PLANE[plane_code as usize - 1]);
        let yoffset = dist_code >> 4;
        let xoffset = 8 - (dist_code & 0xf);
        // Small widths can make a near-left displacement non-positive; clamp to the previous
        // pixel like the sanitizers do.
        (yoffset * i64::from(width) + xoffset).max(1) as u32
    }
}

/// Decode `width * height` pixels into `argb`.
///
/// `on_row_block` is invoked with the raster and the current row at every
/// [`NUM_ARGB_CACHE_ROWS`]-row crossing and once after the final pixel; auxiliary image streams
/// pass `None` and are decoded in one shot.
pub(crate) fn decode_image_data(
    reader: &mut BitBufReader,
    metadata: &mut Metadata,
    width: u32,
    height: u32,
    argb: &mut [u32],
    mut on_row_block: Option<&mut dyn FnMut(&[u32], u32) -> Result<()>>,
) -> Result<()> {
    let Metadata { huffman_image, htree_groups, color_cache } = metadata;
    let end = width as usize * height as usize;
    debug_assert!(argb.len() >= end);

    let mask = match huffman_image {
        Some(image) => (1 << image.subsample_bits()) - 1,
        None => !0u32,
    };
    let len_code_limit = u32::from(NUM_LITERAL_CODES + NUM_LENGTH_CODES);
    let color_cache_limit =
        len_code_limit + color_cache.as_ref().map(|cache| u32::from(cache.len())).unwrap_or_default();

    let (mut col, mut row) = (0u32, 0u32);
    let (mut src, mut last_cached) = (0usize, 0usize);
    let mut htree_group = group_for_pos(huffman_image, htree_groups, 0, 0);

    while src < end {
        // Only update when changing tile.
        if (col & mask) == 0 {
            htree_group = group_for_pos(huffman_image, htree_groups, col, row);
        }
        let code = u32::from(reader.read_huffman(&htree_group.green)?);

        if code < u32::from(NUM_LITERAL_CODES) {
            // Literal: the green symbol is the green channel; red, blue and alpha follow.
            let red = reader.read_huffman(&htree_group.red)?;
            let blue = reader.read_huffman(&htree_group.blue)?;
            let alpha = reader.read_huffman(&htree_group.alpha)?;
            argb[src] = u32::from(alpha) << 24 | u32::from(red) << 16 | code << 8 | u32::from(blue);
        } else if code < len_code_limit {
            // Backward reference.
            let length_symbol = (code - u32::from(NUM_LITERAL_CODES)) as u16;
            let length = reader.read_lz77(length_symbol)?.get();
            let dist_symbol = reader.read_huffman(&htree_group.dist)?;
            let dist_code = reader.read_lz77(u16::from(dist_symbol))?.get();
            let dist = plane_code_to_distance(width, dist_code) as usize;
            ensure_attach!(
                dist <= src,
                DecodeError::InvalidBitstream,
                InvalidBackRefDistance(dist, src),
            );
            ensure_attach!(
                length as usize <= end - src,
                DecodeError::InvalidBitstream,
                InvalidBackRefLength(length, src, end),
            );
            // Pixel-by-pixel forward copy: length may exceed distance for repeats.
            for _ in 0..length {
                argb[src] = argb[src - dist];
                src += 1;
            }
            col += length;
            while col >= width {
                col -= width;
                row += 1;
                if row % NUM_ARGB_CACHE_ROWS == 0 {
                    if let Some(process_rows) = on_row_block.as_mut() {
                        process_rows(argb, row)?;
                    }
                }
            }
            if src < end {
                htree_group = group_for_pos(huffman_image, htree_groups, col, row);
                if let Some(cache) = color_cache.as_mut() {
                    while last_cached < src {
                        cache.insert(argb[last_cached]);
                        last_cached += 1;
                    }
                }
            }
            continue;
        } else if code < color_cache_limit {
            // Colour-cache lookup: ingest everything decoded so far first.
            let key = (code - len_code_limit) as u16;
            ensure_matches_attach!(
                color_cache.as_mut(),
                Some(cache),
                DecodeError::InvalidBitstream,
                UnexpectedColorCacheSymbol,
            );
            while last_cached < src {
                cache.insert(argb[last_cached]);
                last_cached += 1;
            }
            argb[src] = cache.lookup(key);
        } else {
            bail_attach!(DecodeError::InvalidBitstream, GreenSymbolOutOfRange(code));
        }

        // Advance a single literal or cache pixel.
        src += 1;
        col += 1;
        if col >= width {
            col = 0;
            row += 1;
            if row % NUM_ARGB_CACHE_ROWS == 0 {
                if let Some(process_rows) = on_row_block.as_mut() {
                    process_rows(argb, row)?;
                }
            }
            if let Some(cache) = color_cache.as_mut() {
                while last_cached < src {
                    cache.insert(argb[last_cached]);
                    last_cached += 1;
                }
            }
        }
    }

    // Flush the final partial row-block.
    if let Some(process_rows) = on_row_block.as_mut() {
        process_rows(argb, row)?;
    }
    Ok(())
}

fn group_for_pos<'a>(
    huffman_image: &Option<HuffmanImage>,
    htree_groups: &'a [HTreeGroup],
    x: u32,
    y: u32,
) -> &'a HTreeGroup {
    let index = huffman_image.as_ref().map(|image| image.group_index(x, y)).unwrap_or_default();
    &htree_groups[index]
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn plane_codes_map_to_distinct_displacements() {
        let mut seen = std::collections::BTreeSet::new();
        for code in &CODE_TO_PLANE {
            let dy = i32::from(code >> 4);
            let dx = 8 - i32::from(code & 0xf);
            assert!((0..=7).contains(&dy), "dy {dy} out of range");
            assert!((-7..=8).contains(&dx), "dx {dx} out of range");
            assert!(dy > 0 || dx > 0, "displacement must point backwards");
            assert!(seen.insert((dy, dx)), "duplicate displacement ({dy}, {dx})");
        }
        assert_eq!(seen.len(), 120);
    }

    #[test]
    fn plane_code_distances() {
        // Code 1 is one row up, code 2 the previous pixel.
        assert_eq!(plane_code_to_distance(100, 1), 100);
        assert_eq!(plane_code_to_distance(100, 2), 1);
        // Code 6 maps to (dy 0, dx 2).
        assert_eq!(plane_code_to_distance(100, 6), 2);
        // Codes past the table are linear.
        assert_eq!(plane_code_to_distance(100, 121), 1);
        assert_eq!(plane_code_to_distance(100, 300), 180);
    }

    #[test]
    fn tiny_width_distance_clamped() {
        // (dy 1, dx -7) on a 4-wide image would point forward; it clamps to 1.
        let code = CODE_TO_PLANE.iter().position(|&c| c == 0x1f).unwrap() as u32 + 1;
        assert_eq!(plane_code_to_distance(4, code), 1);
    }
}
