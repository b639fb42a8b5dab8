//! Decoder lifecycle: the two-phase entry points, the level-0 image stream, and the row pipeline
//! that crops, scales, and colour-converts decoded row-blocks.

use bytes::Bytes;
use derive_more::Display;

use crate::bitstream::BitBufReader;
use crate::error::{DecodeError, Result, Status};
use crate::huffman::{self, Metadata};
use crate::io::{ColorMode, Io};
use crate::lz77::{self, NUM_ARGB_CACHE_ROWS};
use crate::rescale::Rescaler;
use crate::transform::{Transform, TransformType, NUM_TRANSFORMS};
use crate::{ensure_attach, ensure_matches_attach, report_attach};

const HEADER_BYTES: usize = 5;
const IMAGE_SIZE_BITS: u32 = 14;
const SIGNATURE: u8 = 0x2f;
const SIGNATURE_RESERVED: u8 = 0x64;

/// Scaled output dimensions are capped at the maximum bitstream dimension.
const MAX_SCALED_DIMENSION: u32 = 1 << IMAGE_SIZE_BITS;

//
// public types
//

/// A VP8L lossless bitstream decoder.
///
/// Decoding is two-phase: [`decode_header`](Self::decode_header) parses the dimensions, the
/// transform stack and the htree groups; [`decode_image`](Self::decode_image) reconstructs the
/// raster and emits rows through the sink described by [`Io`]. Failures latch a [`Status`] that
/// subsequent calls observe until [`clear`](Self::clear).
pub struct Decoder {
    state: State,
    status: Status,
    reader: Option<BitBufReader>,
    /// Decode-side dimensions; colour-indexing can make the width narrower than the visible one.
    width: u32,
    height: u32,
    transforms: Vec<Transform>,
    metadata: Option<Metadata>,
    argb: Vec<u32>,
    argb_cache: Vec<u32>,
    pipeline: RowPipeline,
    rescaler: Option<Rescaler>,
}

//
// private types
//

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum State {
    ReadDim,
    ReadHdr,
    ReadData,
    Done,
    Error,
}

/// Emission state: the last raster row flushed through the transforms and the number of rows
/// handed to the output buffer so far.
#[derive(Default)]
struct RowPipeline {
    last_row: u32,
    last_out_row: u32,
}

#[derive(Display)]
#[display(fmt = "invalid signature byte `0x{_0:02x}`")]
struct InvalidSignature(u8);

#[derive(Display)]
#[display(fmt = "more than {} transforms", "NUM_TRANSFORMS")]
struct TooManyTransforms;

#[derive(Display)]
#[display(fmt = "invalid duplicate {_0} transform")]
struct InvalidDuplicateTransform(TransformType);

#[derive(Display)]
#[display(fmt = "unsupported output color mode `{_0:?}`")]
struct UnsupportedColorMode(ColorMode);

#[derive(Display)]
#[display(fmt = "invalid crop window ({_0}, {_2})..({_1}, {_3})")]
struct InvalidCropWindow(u32, u32, u32, u32);

#[derive(Display)]
#[display(fmt = "invalid scaled dimensions `{_0}`x`{_1}`")]
struct InvalidScaledDimensions(u32, u32);

#[derive(Display)]
#[display(fmt = "output stride `{_0}` below row size `{_1}`")]
struct InvalidOutputStride(usize, usize);

#[derive(Display)]
#[display(fmt = "output buffer of `{_0}` bytes, `{_1}` needed")]
struct OutputBufferTooSmall(usize, usize);

//
// public functions
//

/// Sniff the signature and dimensions from the first 5 bytes of a bitstream.
pub fn get_info(data: &[u8]) -> Option<(u32, u32)> {
    if data.len() < HEADER_BYTES {
        return None;
    }
    let mut reader = BitBufReader::new(Bytes::copy_from_slice(&data[..HEADER_BYTES]));
    read_image_size(&mut reader).ok()
}

//
// Decoder impls
//

impl Decoder {
    /// Construct an idle decoder.
    pub fn new() -> Self {
        Self {
            state: State::ReadDim,
            status: Status::Ok,
            reader: None,
            width: 0,
            height: 0,
            transforms: Vec::new(),
            metadata: None,
            argb: Vec::new(),
            argb_cache: Vec::new(),
            pipeline: RowPipeline::default(),
            rescaler: None,
        }
    }

    /// The status latched by the last failing entry point, or [`Status::Ok`].
    pub fn status(&self) -> Status {
        self.status
    }

    /// Parse the 5-byte header and the entire transforms-plus-htrees section, filling
    /// [`Io::width`] and [`Io::height`].
    pub fn decode_header(&mut self, io: &mut Io) -> Result<()> {
        let result = self.try_decode_header(io);
        self.latch(result)
    }

    /// Reconstruct the raster and emit rows through `io`.
    ///
    /// On success [`Io::last_y`] is the emitted output height and the decoder's working buffers
    /// are released.
    pub fn decode_image(&mut self, io: &mut Io) -> Result<()> {
        let result = self.try_decode_image(io);
        self.latch(result)
    }

    /// Release all buffers and reset the decoder to its initial state.
    pub fn clear(&mut self) {
        self.release();
        self.reader = None;
        self.width = 0;
        self.height = 0;
        self.state = State::ReadDim;
        self.status = Status::Ok;
    }

    fn try_decode_header(&mut self, io: &mut Io) -> Result<()> {
        self.check_latched()?;
        ensure_matches_attach!(
            self.state,
            State::ReadDim,
            DecodeError::InvalidParam,
            "header already decoded; clear the decoder first",
        );

        let mut reader = BitBufReader::new(io.data.clone());
        let (width, height) = read_image_size(&mut reader)?;
        io.width = width;
        io.height = height;
        self.height = height;

        // Level-0 image stream: the transform stack, then the htree groups. Transform side data
        // and the meta image recurse into auxiliary image streams.
        let mut xsize = width;
        while reader.read_bit()? {
            ensure_attach!(
                self.transforms.len() < NUM_TRANSFORMS,
                DecodeError::InvalidBitstream,
                TooManyTransforms,
            );
            let transform = Transform::read(&mut reader, &mut xsize, height)?;
            ensure_attach!(
                self.transforms.iter().all(|t| t.transform_type() != transform.transform_type()),
                DecodeError::InvalidBitstream,
                InvalidDuplicateTransform(transform.transform_type()),
            );
            log::info!("{transform}");
            self.transforms.push(transform);
        }

        let metadata = huffman::read_huffman_codes(&mut reader, xsize, height, true)?;
        log::info!(
            "{width}x{height}: {transforms} transforms, {groups} htree groups",
            transforms = self.transforms.len(),
            groups = metadata.htree_groups.len(),
        );

        self.width = xsize;
        self.metadata = Some(metadata);
        self.reader = Some(reader);
        self.state = State::ReadHdr;
        Ok(())
    }

    fn try_decode_image(&mut self, io: &mut Io) -> Result<()> {
        self.check_latched()?;
        ensure_matches_attach!(
            self.state,
            State::ReadHdr,
            DecodeError::InvalidParam,
            "decode_image requires a decoded header",
        );
        let mode = io.output.mode;
        ensure_attach!(mode.is_supported(), DecodeError::InvalidParam, UnsupportedColorMode(mode));

        init_crop_window(io)?;
        let (out_width, out_height) = if io.use_scaling {
            ensure_attach!(
                (1..=MAX_SCALED_DIMENSION).contains(&io.scaled_width)
                    && (1..=MAX_SCALED_DIMENSION).contains(&io.scaled_height),
                DecodeError::InvalidParam,
                InvalidScaledDimensions(io.scaled_width, io.scaled_height),
            );
            (io.scaled_width, io.scaled_height)
        } else {
            (io.mb_w, io.mb_h)
        };
        prepare_output(io, out_width, out_height)?;

        self.argb = alloc_pixels(self.width as usize * self.height as usize)?;
        // One top-prediction scratch row ahead of the row-block cache.
        self.argb_cache = alloc_pixels(io.width as usize * (NUM_ARGB_CACHE_ROWS as usize + 1))?;
        self.rescaler =
            io.use_scaling.then(|| Rescaler::new(io.mb_w, io.mb_h, io.scaled_width, io.scaled_height));
        self.pipeline = RowPipeline::default();
        self.state = State::ReadData;

        let Self { reader, metadata, transforms, argb, argb_cache, pipeline, rescaler, width, height, .. } = self;
        ensure_matches_attach!(reader.as_mut(), Some(reader), DecodeError::InvalidParam);
        ensure_matches_attach!(metadata.as_mut(), Some(metadata), DecodeError::InvalidParam);
        let decode_width = *width;
        let mut process_rows = |raster: &[u32], row: u32| {
            pipeline.process_rows(io, transforms, decode_width, raster, argb_cache, rescaler.as_mut(), row)
        };
        lz77::decode_image_data(reader, metadata, *width, *height, argb, Some(&mut process_rows))?;

        io.last_y = self.pipeline.last_out_row;
        self.state = State::Done;
        self.release();
        Ok(())
    }

    fn latch<T>(&mut self, result: Result<T>) -> Result<T> {
        if let Err(err) = &result {
            self.status = err.status();
            self.state = State::Error;
            self.release();
        }
        result
    }

    fn check_latched(&self) -> Result<()> {
        let error = match self.status {
            Status::Ok => return Ok(()),
            Status::OutOfMemory => DecodeError::OutOfMemory,
            Status::InvalidParam => DecodeError::InvalidParam,
            Status::BitstreamError => DecodeError::InvalidBitstream,
            Status::Suspended => DecodeError::Truncated,
        };
        Err(report_attach!(error, "status latched by an earlier failure"))
    }

    fn release(&mut self) {
        self.metadata = None;
        self.transforms.clear();
        self.argb = Vec::new();
        self.argb_cache = Vec::new();
        self.rescaler = None;
        self.pipeline = RowPipeline::default();
    }
}

impl Default for Decoder {
    fn default() -> Self {
        Self::new()
    }
}

//
// RowPipeline impls
//

impl RowPipeline {
    /// Flush raster rows `[last_row, row)`: copy the band into the cache, run the inverse
    /// transforms over it, crop, and emit.
    #[allow(clippy::too_many_arguments)]
    fn process_rows(
        &mut self,
        io: &mut Io,
        transforms: &[Transform],
        decode_width: u32,
        raster: &[u32],
        argb_cache: &mut [u32],
        rescaler: Option<&mut Rescaler>,
        row: u32,
    ) -> Result<()> {
        if row == self.last_row {
            return Ok(());
        }
        let decode_width = decode_width as usize;
        let visible_width = io.width as usize;
        let band_offset = visible_width;
        let raw_band = &raster[decode_width * self.last_row as usize..decode_width * row as usize];
        argb_cache[band_offset..band_offset + raw_band.len()].copy_from_slice(raw_band);
        for transform in transforms.iter().rev() {
            transform.apply_inverse(self.last_row, row, raw_band, argb_cache, band_offset);
        }

        // Crop the band, then emit through the rescaler or straight to the output buffer.
        let mut rows_out = 0;
        let mut y_start = self.last_row;
        let y_end = row.min(io.crop_bottom);
        let mut band_start = band_offset;
        if y_start < io.crop_top {
            band_start += visible_width * (io.crop_top - y_start) as usize;
            y_start = io.crop_top;
        }
        if y_start < y_end {
            band_start += io.crop_left as usize;
            io.mb_y = y_start - io.crop_top;
            io.mb_w = io.crop_right - io.crop_left;
            io.mb_h = y_end - y_start;
            rows_out = match rescaler {
                Some(rescaler) => {
                    emit_rescaled_rows(io, rescaler, argb_cache, band_start, visible_width, self.last_out_row)
                }
                None => emit_rows(io, argb_cache, band_start, visible_width, self.last_out_row),
            };
        }

        self.last_row = row;
        self.last_out_row += rows_out;
        Ok(())
    }
}

//
// private functions
//

fn read_image_size(reader: &mut BitBufReader) -> Result<(u32, u32)> {
    let signature: u8 = reader.read(8)?;
    ensure_attach!(
        matches!(signature, SIGNATURE | SIGNATURE_RESERVED),
        DecodeError::InvalidBitstream,
        InvalidSignature(signature),
    );
    if signature == SIGNATURE_RESERVED {
        log::warn!("accepting reserved signature byte `0x{signature:02x}`");
    }
    let width = 1 + reader.read::<u32>(IMAGE_SIZE_BITS)?;
    let height = 1 + reader.read::<u32>(IMAGE_SIZE_BITS)?;
    Ok((width, height))
}

/// Default an unset crop window to the full frame, validate it, and prime the band counters.
fn init_crop_window(io: &mut Io) -> Result<()> {
    if (io.crop_left, io.crop_right, io.crop_top, io.crop_bottom) == (0, 0, 0, 0) {
        io.crop_right = io.width;
        io.crop_bottom = io.height;
    }
    ensure_attach!(
        io.crop_left < io.crop_right
            && io.crop_right <= io.width
            && io.crop_top < io.crop_bottom
            && io.crop_bottom <= io.height,
        DecodeError::InvalidParam,
        InvalidCropWindow(io.crop_left, io.crop_right, io.crop_top, io.crop_bottom),
    );
    io.mb_y = 0;
    io.mb_w = io.crop_right - io.crop_left;
    io.mb_h = io.crop_bottom - io.crop_top;
    Ok(())
}

/// Default and validate the output stride, then size or validate the destination buffer.
fn prepare_output(io: &mut Io, out_width: u32, out_height: u32) -> Result<()> {
    let row_size = out_width as usize * io.output.mode.bytes_per_pixel();
    if io.output.stride == 0 {
        io.output.stride = row_size;
    }
    ensure_attach!(
        io.output.stride >= row_size,
        DecodeError::InvalidParam,
        InvalidOutputStride(io.output.stride, row_size),
    );
    ensure_matches_attach!(
        io.output.stride.checked_mul(out_height as usize),
        Some(needed),
        DecodeError::OutOfMemory,
    );
    if io.output.pixels.is_empty() {
        io.output
            .pixels
            .try_reserve_exact(needed)
            .map_err(|err| report_attach!(DecodeError::OutOfMemory, err))?;
        io.output.pixels.resize(needed, 0);
    } else {
        ensure_attach!(
            io.output.pixels.len() >= needed,
            DecodeError::InvalidParam,
            OutputBufferTooSmall(io.output.pixels.len(), needed),
        );
    }
    Ok(())
}

fn alloc_pixels(len: usize) -> Result<Vec<u32>> {
    let mut pixels = Vec::new();
    pixels
        .try_reserve_exact(len)
        .map_err(|err| report_attach!(DecodeError::OutOfMemory, err))?;
    pixels.resize(len, 0);
    Ok(pixels)
}

fn emit_rows(io: &mut Io, cache: &[u32], band_start: usize, in_stride: usize, last_out_row: u32) -> u32 {
    let mode = io.output.mode;
    let bytes_per_pixel = mode.bytes_per_pixel();
    let stride = io.output.stride;
    let width = io.mb_w as usize;
    for r in 0..io.mb_h as usize {
        let src = &cache[band_start + r * in_stride..][..width];
        let dst = &mut io.output.pixels[(last_out_row as usize + r) * stride..][..width * bytes_per_pixel];
        convert_bgra_row(src.iter().copied(), mode, dst);
    }
    io.mb_h
}

fn emit_rescaled_rows(
    io: &mut Io,
    rescaler: &mut Rescaler,
    cache: &[u32],
    band_start: usize,
    in_stride: usize,
    last_out_row: u32,
) -> u32 {
    let mode = io.output.mode;
    let bytes_per_pixel = mode.bytes_per_pixel();
    let stride = io.output.stride;
    let width = io.mb_w as usize;
    let scaled_width = io.scaled_width as usize;
    let mut rows_out = 0u32;
    for r in 0..io.mb_h as usize {
        rescaler.import_row(&cache[band_start + r * in_stride..][..width]);
        while rescaler.has_pending_output() {
            let dst_row = (last_out_row + rows_out) as usize;
            let scaled = rescaler.export_row();
            let pixels = scaled.chunks_exact(4).map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]));
            let dst = &mut io.output.pixels[dst_row * stride..][..scaled_width * bytes_per_pixel];
            convert_bgra_row(pixels, mode, dst);
            rows_out += 1;
        }
    }
    rows_out
}

/// Convert a row of native ARGB words into the sink's colour space.
fn convert_bgra_row(pixels: impl Iterator<Item = u32>, mode: ColorMode, dst: &mut [u8]) {
    match mode {
        ColorMode::Bgra => {
            for (argb, out) in pixels.zip(dst.chunks_exact_mut(4)) {
                out.copy_from_slice(&argb.to_le_bytes());
            }
        }
        ColorMode::Rgba => {
            for (argb, out) in pixels.zip(dst.chunks_exact_mut(4)) {
                let [b, g, r, a] = argb.to_le_bytes();
                out.copy_from_slice(&[r, g, b, a]);
            }
        }
        ColorMode::Argb => {
            for (argb, out) in pixels.zip(dst.chunks_exact_mut(4)) {
                let [b, g, r, a] = argb.to_le_bytes();
                out.copy_from_slice(&[a, r, g, b]);
            }
        }
        ColorMode::Rgb => {
            for (argb, out) in pixels.zip(dst.chunks_exact_mut(3)) {
                let [b, g, r, _] = argb.to_le_bytes();
                out.copy_from_slice(&[r, g, b]);
            }
        }
        ColorMode::Bgr => {
            for (argb, out) in pixels.zip(dst.chunks_exact_mut(3)) {
                let [b, g, r, _] = argb.to_le_bytes();
                out.copy_from_slice(&[b, g, r]);
            }
        }
        // Rejected before the pipeline runs.
        ColorMode::Rgba4444 | ColorMode::Rgb565 => unreachable!(),
    }
}
