#![warn(missing_docs)]

//! `vp8ldec` is a decoder for the VP8L lossless image bitstream.
//!
//! Given a compressed byte buffer, the decoder reconstructs a raster of 32-bit BGRA pixels and
//! emits rows through a sink that can crop, rescale, and convert to other RGB colour orders.
//!
//! # Usage
//!
//! Decoding is two-phase. [`Decoder::decode_header`] parses the dimensions and the entropy-code
//! section and fills [`Io::width`]/[`Io::height`]; the caller may then adjust the crop window,
//! scaling, or output colour space on the [`Io`] before [`Decoder::decode_image`] reconstructs
//! the pixels.
//!
//! ```
//! let data = b"\x2f\x00\x00\x00\x80\x88\x88\x00";
//!
//! let mut io = vp8ldec::Io::builder().data(&data[..]).build();
//! let mut decoder = vp8ldec::Decoder::new();
//! decoder.decode_header(&mut io)?;
//! assert_eq!((io.width, io.height), (1, 1));
//! decoder.decode_image(&mut io)?;
//! assert_eq!(io.output.pixels, [0, 0, 0, 0]);
//! # Ok::<(), vp8ldec::Report>(())
//! ```
//!
//! A truncated input fails with [`Status::Suspended`] rather than a bitstream error: the caller
//! may [`clear`](Decoder::clear) the decoder and retry with a longer buffer.
//!
//! The [`bitstream`] module contains a less stable and undocumented API exposing the bit reader
//! and the canonical prefix-code trees.

pub mod bitstream;
pub mod error;

mod cache;
mod decoder;
mod huffman;
mod io;
mod lz77;
mod rescale;
mod transform;
mod util;

pub use decoder::{get_info, Decoder};
pub use error::{DecodeError, Report, Result, ResultExt, Status};
pub use io::{ColorMode, Io, IoBuilder, OutputBuffer};

#[cfg(doctest)]
#[doc = include_str!("../README.md")]
pub mod readme {}

#[cfg(test)]
mod test {
    use super::*;

    use assert_matches::assert_matches;

    use crate::cache::test::hash;
    use crate::util::test::{decode_bgra, write_code_group, write_image_header, BitSink};

    fn bgra(pixels: &[u32]) -> Vec<u8> {
        pixels.iter().flat_map(|pixel| pixel.to_le_bytes()).collect()
    }

    fn constant_image(width: u32, height: u32) -> Vec<u8> {
        let mut sink = BitSink::new();
        write_image_header(&mut sink, width, height);
        sink.write_bit(false); // no transforms
        sink.write_bit(false); // no meta image
        sink.write_bit(false); // no color cache
        write_code_group(&mut sink, &[0x10], &[0x20], &[0x30], &[0xff], &[0]);
        sink.into_bytes()
    }

    const CONSTANT_PIXEL: u32 = 0xff201030;

    #[test]
    fn trivial_image() {
        let (width, height, pixels) = decode_bgra(constant_image(2, 2)).unwrap();
        assert_eq!((width, height), (2, 2));
        assert_eq!(pixels, bgra(&[CONSTANT_PIXEL; 4]));
    }

    #[test]
    fn single_pixel_image() {
        let (width, height, pixels) = decode_bgra(constant_image(1, 1)).unwrap();
        assert_eq!((width, height), (1, 1));
        assert_eq!(pixels, bgra(&[CONSTANT_PIXEL]));
    }

    fn backref_image() -> Vec<u8> {
        let mut sink = BitSink::new();
        write_image_header(&mut sink, 8, 1);
        sink.write_bit(false);
        sink.write_bit(false);
        sink.write_bit(false);
        write_code_group(&mut sink, &[0x10, 257], &[0x20, 0x21], &[0x30], &[0xff], &[4]);
        // Pixels 0..6: literals with alternating red.
        for pixel in 0..6 {
            sink.write_bit(false); // green 0x10
            sink.write_bit(pixel % 2 == 1); // red 0x20 or 0x21
        }
        // Length-2 back-reference at distance 2.
        sink.write_bit(true); // green 257: length symbol 1, length 2
        sink.write_bit(true); // distance symbol 4 + extra bit 1: code 6, distance 2
        sink.into_bytes()
    }

    #[test]
    fn backward_reference_copies_pixels() {
        let (_, _, pixels) = decode_bgra(backref_image()).unwrap();
        let even = 0xff201030;
        let odd = 0xff211030;
        assert_eq!(pixels, bgra(&[even, odd, even, odd, even, odd, even, odd]));
    }

    #[test]
    fn color_cache_hit() {
        let color = 0xff414042u32;
        let key = hash(color, 1);
        let mut sink = BitSink::new();
        write_image_header(&mut sink, 2, 1);
        sink.write_bit(false); // no transforms
        sink.write_bit(false); // no meta image
        sink.write_bit(true); // color cache
        sink.write(1, 4); // cache bits 1
        write_code_group(&mut sink, &[0x40, 280 + key], &[0x41], &[0x42], &[0xff], &[0]);
        sink.write_bit(false); // literal
        sink.write_bit(true); // cache lookup
        let (_, _, pixels) = decode_bgra(sink.into_bytes()).unwrap();
        assert_eq!(pixels, bgra(&[color, color]));
    }

    #[test]
    fn meta_huffman_selects_groups_per_tile() {
        let color_a = 0xff0a141e;
        let color_b = 0xff28323c;
        let mut sink = BitSink::new();
        write_image_header(&mut sink, 4, 4);
        sink.write_bit(false); // no transforms
        sink.write_bit(true); // meta image
        sink.write(1, 4); // precision 1: 2x2 pixel tiles
        // The 2x2 meta image is its own entropy-coded stream; the group index is carried in the
        // green channel.
        sink.write_bit(false); // no nested meta image
        sink.write_bit(false); // no color cache
        write_code_group(&mut sink, &[0, 1], &[0], &[0], &[0], &[0]);
        for index in [false, true, true, false] {
            sink.write_bit(index);
        }
        sink.write(1, 4); // meta codes nbits
        sink.write(0, 1); // two htree groups
        sink.write_bit(false); // no color cache
        write_code_group(&mut sink, &[0x14], &[0x0a], &[0x1e], &[0xff], &[0]);
        write_code_group(&mut sink, &[0x32], &[0x28], &[0x3c], &[0xff], &[0]);
        // All 16 pixels decode through zero-bit codes.
        let (_, _, pixels) = decode_bgra(sink.into_bytes()).unwrap();
        for y in 0..4usize {
            for x in 0..4usize {
                let expected: u32 = if (x < 2) == (y < 2) { color_a } else { color_b };
                assert_eq!(pixels[4 * (y * 4 + x)..][..4], expected.to_le_bytes(), "pixel ({x}, {y})");
            }
        }
    }

    #[test]
    fn color_indexing_unpacks_palette_pixels() {
        let mut sink = BitSink::new();
        write_image_header(&mut sink, 4, 1);
        sink.write_bit(true); // transform present
        sink.write(3, 2); // color indexing
        sink.write(4, 8); // 5 colors: two 4-bit indices per packed byte
        // Palette stream: byte-wise deltas; entry 0 carries alpha 0xff, each entry adds 0x10 to
        // blue.
        sink.write_bit(false); // no meta image
        sink.write_bit(false); // no color cache
        write_code_group(&mut sink, &[0], &[0], &[0x10], &[0xff, 0], &[0]);
        for delta_alpha_zero in [false, true, true, true, true] {
            sink.write_bit(delta_alpha_zero);
        }
        sink.write_bit(false); // no more transforms
        // Main stream over the packed 2x1 raster.
        sink.write_bit(false); // no meta image
        sink.write_bit(false); // no color cache
        write_code_group(&mut sink, &[0x23, 0x01], &[0], &[0], &[0], &[0]);
        sink.write_bit(false); // packed 0x23: indices 3, 2
        sink.write_bit(true); // packed 0x01: indices 1, 0
        let (width, _, pixels) = decode_bgra(sink.into_bytes()).unwrap();
        assert_eq!(width, 4);
        assert_eq!(pixels, bgra(&[0xff000040, 0xff000030, 0xff000020, 0xff000010]));
    }

    #[test]
    fn subtract_green_restores_channels() {
        let mut sink = BitSink::new();
        write_image_header(&mut sink, 2, 1);
        sink.write_bit(true); // transform present
        sink.write(2, 2); // subtract green
        sink.write_bit(false); // no more transforms
        sink.write_bit(false);
        sink.write_bit(false);
        write_code_group(&mut sink, &[0x30], &[0x10], &[0x20], &[0xff], &[0]);
        let (_, _, pixels) = decode_bgra(sink.into_bytes()).unwrap();
        assert_eq!(pixels, bgra(&[0xff403050; 2]));
    }

    #[test]
    fn predictor_transform_reconstructs_rows() {
        let mut sink = BitSink::new();
        write_image_header(&mut sink, 1, 2);
        sink.write_bit(true); // transform present
        sink.write(0, 2); // predictor
        sink.write(1, 4); // block bits 1
        // 1x1 mode image: mode 2 (top).
        sink.write_bit(false); // no meta image
        sink.write_bit(false); // no color cache
        write_code_group(&mut sink, &[2], &[0], &[0], &[0], &[0]);
        sink.write_bit(false); // no more transforms
        // Residuals: blue 0x10 off opaque black, then blue +1 off the row above.
        sink.write_bit(false);
        sink.write_bit(false);
        write_code_group(&mut sink, &[0], &[0], &[0x10, 0x01], &[0], &[0]);
        sink.write_bit(false); // pixel 0: blue 0x10
        sink.write_bit(true); // pixel 1: blue 0x01
        let (_, _, pixels) = decode_bgra(sink.into_bytes()).unwrap();
        assert_eq!(pixels, bgra(&[0xff000010, 0xff000011]));
    }

    #[test]
    fn cropping_emits_the_window() {
        let mut sink = BitSink::new();
        write_image_header(&mut sink, 4, 4);
        sink.write_bit(false);
        sink.write_bit(false);
        sink.write_bit(false);
        write_code_group(&mut sink, &[0, 1], &[0], &[0], &[0xff], &[0]);
        for y in 0..4 {
            for x in 0..4 {
                sink.write_bit(x == y); // green 1 on the diagonal
            }
        }
        let mut io = Io::builder().data(sink.into_bytes()).build();
        let mut decoder = Decoder::new();
        decoder.decode_header(&mut io).unwrap();
        io.crop_left = 1;
        io.crop_right = 3;
        io.crop_top = 1;
        io.crop_bottom = 3;
        decoder.decode_image(&mut io).unwrap();
        assert_eq!(io.last_y, 2);
        let diagonal = 0xff000100u32;
        let off = 0xff000000u32;
        assert_eq!(io.output.pixels, bgra(&[diagonal, off, off, diagonal]));
    }

    #[test]
    fn scaling_averages_pixels() {
        let mut io = Io::builder().data(constant_image(2, 2)).build();
        io.use_scaling = true;
        io.scaled_width = 1;
        io.scaled_height = 1;
        let mut decoder = Decoder::new();
        decoder.decode_header(&mut io).unwrap();
        decoder.decode_image(&mut io).unwrap();
        assert_eq!(io.last_y, 1);
        assert_eq!(io.output.pixels, bgra(&[CONSTANT_PIXEL]));
    }

    #[test]
    fn rgb_output_mode() {
        let mut io = Io::builder().data(constant_image(2, 1)).build();
        io.output.mode = ColorMode::Rgb;
        let mut decoder = Decoder::new();
        decoder.decode_header(&mut io).unwrap();
        decoder.decode_image(&mut io).unwrap();
        assert_eq!(io.output.pixels, [0x20, 0x10, 0x30, 0x20, 0x10, 0x30]);
    }

    #[test]
    fn packed_output_modes_rejected() {
        for mode in [ColorMode::Rgba4444, ColorMode::Rgb565] {
            let mut io = Io::builder().data(constant_image(1, 1)).build();
            io.output.mode = mode;
            let mut decoder = Decoder::new();
            decoder.decode_header(&mut io).unwrap();
            let err = decoder.decode_image(&mut io).unwrap_err();
            assert_matches!(err.get_ref(), DecodeError::InvalidParam);
            assert_eq!(decoder.status(), Status::InvalidParam);
        }
    }

    #[test]
    fn truncated_stream_is_suspended() {
        let data = backref_image();
        // The last byte carries image data; dropping it suspends the image phase.
        let mut io = Io::builder().data(data[..data.len() - 1].to_vec()).build();
        let mut decoder = Decoder::new();
        decoder.decode_header(&mut io).unwrap();
        let err = decoder.decode_image(&mut io).unwrap_err();
        assert_matches!(err.get_ref(), DecodeError::Truncated);
        assert_eq!(decoder.status(), Status::Suspended);
        // Nothing was emitted for the incomplete row.
        assert!(io.output.pixels.iter().all(|&byte| byte == 0));
    }

    #[test]
    fn every_truncation_point_is_suspended() {
        let data = backref_image();
        for len in 0..data.len() {
            let err = decode_bgra(data[..len].to_vec()).unwrap_err();
            assert_eq!(err.status(), Status::Suspended, "truncated to {len} bytes");
        }
    }

    #[test]
    fn oversubscribed_code_length_code_rejected() {
        let mut sink = BitSink::new();
        write_image_header(&mut sink, 1, 1);
        sink.write_bit(false);
        sink.write_bit(false);
        sink.write_bit(false);
        sink.write_bit(false); // green: normal code
        sink.write(1, 4); // 5 code length codes, in order 17, 18, 0, 1, 2
        for length in [0, 0, 1, 1, 1] {
            sink.write(length, 3); // three one-bit codes: oversubscribed
        }
        let err = decode_bgra(sink.into_bytes()).unwrap_err();
        assert_matches!(err.get_ref(), DecodeError::InvalidPrefixCode);
        assert_eq!(err.status(), Status::BitstreamError);
    }

    #[test]
    fn cross_color_transform_with_zero_multipliers() {
        let mut sink = BitSink::new();
        write_image_header(&mut sink, 2, 1);
        sink.write_bit(true); // transform present
        sink.write(1, 2); // cross color
        sink.write(2, 4); // block bits 2
        sink.write_bit(false); // no meta image
        sink.write_bit(false); // no color cache
        write_code_group(&mut sink, &[0], &[0], &[0], &[0], &[0]);
        sink.write_bit(false); // no more transforms
        sink.write_bit(false);
        sink.write_bit(false);
        write_code_group(&mut sink, &[0x10], &[0x20], &[0x30], &[0xff], &[0]);
        let (_, _, pixels) = decode_bgra(sink.into_bytes()).unwrap();
        assert_eq!(pixels, bgra(&[CONSTANT_PIXEL; 2]));
    }

    #[test]
    fn finished_decoder_requires_clear() {
        let mut io = Io::builder().data(constant_image(1, 1)).build();
        let mut decoder = Decoder::new();
        decoder.decode_header(&mut io).unwrap();
        decoder.decode_image(&mut io).unwrap();
        assert_matches!(
            decoder.decode_header(&mut io).unwrap_err().get_ref(),
            DecodeError::InvalidParam
        );
        decoder.clear();
        io.output.pixels.clear();
        decoder.decode_header(&mut io).unwrap();
        decoder.decode_image(&mut io).unwrap();
        assert_eq!(io.output.pixels, bgra(&[CONSTANT_PIXEL]));
    }

    #[test]
    fn unused_simple_code_path() {
        // A two-symbol green code where only one symbol is ever emitted still decodes.
        let mut sink = BitSink::new();
        write_image_header(&mut sink, 2, 1);
        sink.write_bit(false);
        sink.write_bit(false);
        sink.write_bit(false);
        write_code_group(&mut sink, &[0x10, 0x80], &[0x20], &[0x30], &[0xff], &[0]);
        sink.write_bit(false);
        sink.write_bit(false);
        let (_, _, pixels) = decode_bgra(sink.into_bytes()).unwrap();
        assert_eq!(pixels, bgra(&[CONSTANT_PIXEL; 2]));
    }
}
