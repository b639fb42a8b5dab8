//! The sink descriptor the decoder reads pixels from and emits rows through.

use bytes::Bytes;
use derive_builder::Builder;

/// Output colour spaces the emitter can convert the decoded BGRA raster into.
///
/// `Rgba4444` and `Rgb565` are representable but rejected by
/// [`decode_image`](crate::Decoder::decode_image); YUV output is not offered by this decoder.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ColorMode {
    /// 32-bit BGRA, the native layout of the decoded raster.
    #[default]
    Bgra,
    /// 32-bit RGBA.
    Rgba,
    /// 32-bit ARGB.
    Argb,
    /// 24-bit RGB.
    Rgb,
    /// 24-bit BGR.
    Bgr,
    /// 16-bit RGBA with 4 bits per channel (unsupported).
    Rgba4444,
    /// 16-bit RGB with 5-6-5 bits per channel (unsupported).
    Rgb565,
}

/// The destination raster rows are emitted into.
#[derive(Clone, Debug, Default)]
pub struct OutputBuffer {
    /// Colour space rows are converted into.
    pub mode: ColorMode,
    /// Destination pixels, row-major at `stride` bytes per row.
    ///
    /// Left empty, it is sized by [`decode_image`](crate::Decoder::decode_image); a caller-provided
    /// buffer must be large enough for the emitted rows.
    pub pixels: Vec<u8>,
    /// Bytes per output row; `0` selects the tightly packed stride.
    pub stride: usize,
}

/// Decoder input/output descriptor.
///
/// [`decode_header`](crate::Decoder::decode_header) fills [`width`](Self::width) and
/// [`height`](Self::height); the caller may then narrow the crop window or request scaling before
/// [`decode_image`](crate::Decoder::decode_image) runs the pixel pipeline.
#[derive(Builder, Clone, Debug, Default)]
#[builder(build_fn(name = "try_build"), default)]
pub struct Io {
    /// The compressed bitstream, starting at the signature byte.
    #[builder(setter(into))]
    pub data: Bytes,

    /// Visible width, parsed from the header.
    pub width: u32,
    /// Visible height, parsed from the header.
    pub height: u32,

    /// Left edge of the crop window.
    pub crop_left: u32,
    /// Right edge (exclusive) of the crop window; `0` selects the full frame.
    pub crop_right: u32,
    /// Top edge of the crop window.
    pub crop_top: u32,
    /// Bottom edge (exclusive) of the crop window; `0` selects the full frame.
    pub crop_bottom: u32,

    /// Whether the cropped rows are run through the rescaler.
    pub use_scaling: bool,
    /// Output width when scaling.
    pub scaled_width: u32,
    /// Output height when scaling.
    pub scaled_height: u32,

    /// First row of the current band, relative to the crop window; updated by the cropper.
    pub mb_y: u32,
    /// Width of the cropped band; updated by the cropper.
    pub mb_w: u32,
    /// Rows in the current cropped band; updated by the cropper.
    pub mb_h: u32,

    /// Total output rows emitted, updated when [`decode_image`](crate::Decoder::decode_image)
    /// succeeds.
    pub last_y: u32,

    /// The destination descriptor.
    pub output: OutputBuffer,
}

//
// ColorMode impls
//

impl ColorMode {
    pub(crate) fn bytes_per_pixel(self) -> usize {
        match self {
            Self::Bgra | Self::Rgba | Self::Argb => 4,
            Self::Rgb | Self::Bgr => 3,
            Self::Rgba4444 | Self::Rgb565 => 2,
        }
    }

    pub(crate) fn is_supported(self) -> bool {
        !matches!(self, Self::Rgba4444 | Self::Rgb565)
    }
}

//
// Io impls
//

impl Io {
    /// Construct a builder for `Io`.
    ///
    /// See the documentation for [`IoBuilder`].
    pub fn builder() -> IoBuilder {
        IoBuilder::default()
    }
}

//
// IoBuilder impls
//

impl IoBuilder {
    /// Build a new [`Io`].
    pub fn build(&self) -> Io {
        self.try_build().unwrap_or_else(|_| unreachable!())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn builder_defaults() {
        let io = Io::builder().data(vec![0x2f]).build();
        assert_eq!(&io.data[..], [0x2f]);
        assert_eq!(io.output.mode, ColorMode::Bgra);
        assert_eq!((io.crop_right, io.crop_bottom), (0, 0));
        assert!(!io.use_scaling);
    }

    #[test]
    fn mode_pixel_sizes() {
        assert_eq!(ColorMode::Bgra.bytes_per_pixel(), 4);
        assert_eq!(ColorMode::Rgb.bytes_per_pixel(), 3);
        assert!(ColorMode::Argb.is_supported());
        assert!(!ColorMode::Rgb565.is_supported());
    }
}
