//! Htree groups and the meta image mapping spatial tiles to groups.
//!
//! Each group is a 5-tuple of prefix trees in fixed slot order: green (extended with the LZ77
//! length codes and the colour-cache keys), red, blue, alpha, and distance.

use std::fmt::Debug;

use derive_more::Display;
use num_integer::div_ceil;
use num_traits::AsPrimitive;

use crate::bitstream::{BitBufReader, CanonicalHuffmanTree};
use crate::cache::ColorCache;
use crate::error::{DecodeError, Result, ResultExt};
use crate::lz77;
use crate::{ensure_attach, ensure_matches_attach};

pub(crate) const NUM_LITERAL_CODES: u16 = 256;
pub(crate) const NUM_LENGTH_CODES: u16 = 24;
pub(crate) const NUM_DISTANCE_CODES: u16 = 40;

const NUM_CODE_LENGTH_CODES: usize = 19;
const CODE_LENGTH_CODE_ORDER: [u8; NUM_CODE_LENGTH_CODES] =
    [17, 18, 0, 1, 2, 3, 4, 5, 16, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15];
const CODE_LENGTH_LITERALS: u8 = 16;
const DEFAULT_CODE_LENGTH: u8 = 8;

const MAX_COLOR_CACHE_BITS: u8 = 11;
const MAX_HUFFMAN_PRECISION: u8 = 9;

//
// crate-internal types
//

/// The five prefix trees one meta code selects between.
#[derive(Debug)]
pub(crate) struct HTreeGroup {
    pub green: CanonicalHuffmanTree<u16>,
    pub red: CanonicalHuffmanTree<u8>,
    pub blue: CanonicalHuffmanTree<u8>,
    pub alpha: CanonicalHuffmanTree<u8>,
    pub dist: CanonicalHuffmanTree<u8>,
}

/// Sub-sampled grid of group indices, one per `2^subsample_bits` square tile.
#[derive(Debug)]
pub(crate) struct HuffmanImage {
    grid: Vec<u16>,
    xsize: u32,
    subsample_bits: u8,
}

/// Everything one image stream's pixel loop selects symbols with: the optional tile-to-group
/// mapping, the groups themselves, and the optional colour cache. Owned as one aggregate with a
/// single release point.
#[derive(Debug)]
pub(crate) struct Metadata {
    pub huffman_image: Option<HuffmanImage>,
    pub htree_groups: Vec<HTreeGroup>,
    pub color_cache: Option<ColorCache>,
}

trait PrefixCodeSlot {
    type Symbol;

    fn alphabet_size(color_cache_size: u16) -> u16;
}

enum GreenSlot {}
enum ChannelSlot {}
enum DistanceSlot {}

#[derive(Display)]
#[display(fmt = "invalid color cache size `{_0}`")]
struct InvalidColorCacheSize(u8);

#[derive(Display)]
#[display(fmt = "invalid meta image precision `{_0}`")]
struct InvalidHuffmanPrecision(u8);

#[derive(Display)]
#[display(fmt = "meta image not allowed in an auxiliary image stream")]
struct NestedHuffmanImage;

#[derive(Display)]
#[display(fmt = "meta group index `{_0}` >= `{_1}` groups")]
struct MetaGroupIndexOutOfBounds(u16, u32);

#[derive(Display)]
#[display(fmt = "invalid symbol `{_0}` >= alphabet size `{_1}`")]
struct SymbolOutOfRange(u16, u16);

#[derive(Display)]
#[display(fmt = "invalid symbol count `{_0}` > `{_1}`")]
struct InvalidSymbolCount(u32, u16);

#[derive(Display)]
#[display(fmt = "invalid code length repetition `{_0}` at `{_1}` with alphabet size `{_2}`")]
struct InvalidCodeLengthRepetition(u16, usize, u16);

#[derive(Display)]
#[display(fmt = "while reading the {_0} prefix code")]
struct WhileReadingSlot(&'static str);

//
// crate-internal functions
//

/// `⌈size / 2^sampling_bits⌉`, the dimension of a sub-sampled grid.
pub(crate) fn subsample_size(size: u32, sampling_bits: u8) -> u32 {
    div_ceil(size, 1 << sampling_bits)
}

/// Read the htree groups for an image stream of `xsize` x `ysize` pixels, along with the optional
/// meta image and colour cache. `allow_meta` is set for the top-level ARGB stream only.
pub(crate) fn read_huffman_codes(
    reader: &mut BitBufReader,
    xsize: u32,
    ysize: u32,
    allow_meta: bool,
) -> Result<Metadata> {
    let mut huffman_image = None;
    let mut num_htree_groups: u32 = 1;

    if reader.read_bit()? {
        ensure_attach!(allow_meta, DecodeError::InvalidBitstream, NestedHuffmanImage);
        let precision: u8 = reader.read(4)?;
        ensure_matches_attach!(
            precision,
            1..=MAX_HUFFMAN_PRECISION,
            DecodeError::InvalidBitstream,
            InvalidHuffmanPrecision(precision),
        );
        let huffman_xsize = subsample_size(xsize, precision);
        let huffman_ysize = subsample_size(ysize, precision);
        let data = decode_entropy_image(reader, huffman_xsize, huffman_ysize)
            .attach_printable("while reading the meta image")?;
        // The group index is stored in the red and green bytes of each tile pixel.
        let grid = data.iter().map(|&pixel| (pixel >> 8) as u16).collect();
        let meta_codes_nbits: u32 = reader.read(4)?;
        num_htree_groups = 2 + reader.read::<u32>(meta_codes_nbits)?;
        huffman_image = Some(HuffmanImage { grid, xsize: huffman_xsize, subsample_bits: precision });
    }

    let color_cache = if reader.read_bit()? {
        let bits: u8 = reader.read(4)?;
        ensure_matches_attach!(
            bits,
            1..=MAX_COLOR_CACHE_BITS,
            DecodeError::InvalidBitstream,
            InvalidColorCacheSize(bits),
        );
        Some(ColorCache::new(bits))
    } else {
        None
    };

    if let Some(image) = &huffman_image {
        let max_index = image.grid.iter().copied().max().unwrap_or_default();
        ensure_attach!(
            u32::from(max_index) < num_htree_groups,
            DecodeError::InvalidBitstream,
            MetaGroupIndexOutOfBounds(max_index, num_htree_groups),
        );
    }

    let color_cache_size = color_cache.as_ref().map(ColorCache::len).unwrap_or_default();
    let mut htree_groups = Vec::with_capacity(num_htree_groups as usize);
    for _ in 0..num_htree_groups {
        htree_groups.push(HTreeGroup::read(reader, color_cache_size)?);
    }

    Ok(Metadata { huffman_image, htree_groups, color_cache })
}

/// Decode a complete auxiliary image stream (meta image, transform data, or palette).
pub(crate) fn decode_entropy_image(reader: &mut BitBufReader, xsize: u32, ysize: u32) -> Result<Vec<u32>> {
    let mut metadata = read_huffman_codes(reader, xsize, ysize, false)?;
    let mut data = vec![0u32; xsize as usize * ysize as usize];
    lz77::decode_image_data(reader, &mut metadata, xsize, ysize, &mut data, None)?;
    Ok(data)
}

//
// HTreeGroup impls
//

impl HTreeGroup {
    pub fn read(reader: &mut BitBufReader, color_cache_size: u16) -> Result<Self> {
        let green = read_prefix_code::<GreenSlot>(reader, color_cache_size)
            .attach_printable(WhileReadingSlot("green"))?;
        let red = read_prefix_code::<ChannelSlot>(reader, color_cache_size)
            .attach_printable(WhileReadingSlot("red"))?;
        let blue = read_prefix_code::<ChannelSlot>(reader, color_cache_size)
            .attach_printable(WhileReadingSlot("blue"))?;
        let alpha = read_prefix_code::<ChannelSlot>(reader, color_cache_size)
            .attach_printable(WhileReadingSlot("alpha"))?;
        let dist = read_prefix_code::<DistanceSlot>(reader, color_cache_size)
            .attach_printable(WhileReadingSlot("distance"))?;
        Ok(Self { green, red, blue, alpha, dist })
    }
}

//
// HuffmanImage impls
//

impl HuffmanImage {
    pub fn subsample_bits(&self) -> u8 {
        self.subsample_bits
    }

    /// Group index for pixel position `(x, y)`; validated against the group count at read time.
    pub fn group_index(&self, x: u32, y: u32) -> usize {
        let tile = (y >> self.subsample_bits) * self.xsize + (x >> self.subsample_bits);
        usize::from(self.grid[tile as usize])
    }
}

//
// PrefixCodeSlot impls
//

impl PrefixCodeSlot for GreenSlot {
    type Symbol = u16;

    fn alphabet_size(color_cache_size: u16) -> u16 {
        NUM_LITERAL_CODES + NUM_LENGTH_CODES + color_cache_size
    }
}

impl PrefixCodeSlot for ChannelSlot {
    type Symbol = u8;

    fn alphabet_size(_color_cache_size: u16) -> u16 {
        NUM_LITERAL_CODES
    }
}

impl PrefixCodeSlot for DistanceSlot {
    type Symbol = u8;

    fn alphabet_size(_color_cache_size: u16) -> u16 {
        NUM_DISTANCE_CODES
    }
}

//
// private functions
//

fn read_prefix_code<T: PrefixCodeSlot>(
    reader: &mut BitBufReader,
    color_cache_size: u16,
) -> Result<CanonicalHuffmanTree<T::Symbol>>
where
    T::Symbol: Copy + Debug + Ord + 'static,
    u16: AsPrimitive<T::Symbol>,
    usize: AsPrimitive<T::Symbol>,
{
    let alphabet_size = T::alphabet_size(color_cache_size);
    if reader.read_bit()? {
        read_simple_code::<T>(reader, alphabet_size)
    } else {
        let code_length_code = read_code_length_code(reader)?;
        let mut code_lengths = read_code_lengths::<T>(reader, &code_length_code, alphabet_size)?;
        CanonicalHuffmanTree::new(&mut code_lengths)
    }
}

/// The simple-code path: one or two symbols listed directly in the stream.
fn read_simple_code<T: PrefixCodeSlot>(
    reader: &mut BitBufReader,
    alphabet_size: u16,
) -> Result<CanonicalHuffmanTree<T::Symbol>>
where
    T::Symbol: Copy + Ord + 'static,
    u16: AsPrimitive<T::Symbol>,
{
    let nbits: u8 = reader.read(3)?;
    if nbits == 0 {
        return CanonicalHuffmanTree::from_symbols(vec![(0u16.as_(), vec![])]);
    }
    let num_symbols = 1 + reader.read::<u8>(1)?;
    let symbol_bits = (u32::from(nbits) - 1) * 2 + 4;
    let mut symbols = Vec::with_capacity(num_symbols.into());
    for code in 0..num_symbols {
        let symbol: u16 = reader.read(symbol_bits)?;
        ensure_attach!(
            symbol < alphabet_size,
            DecodeError::InvalidBitstream,
            SymbolOutOfRange(symbol, alphabet_size),
        );
        let code_bits = if num_symbols == 1 { vec![] } else { vec![code] };
        symbols.push((symbol.as_(), code_bits));
    }
    CanonicalHuffmanTree::from_symbols(symbols)
}

/// The prefix code the symbol code lengths themselves are compressed with.
fn read_code_length_code(reader: &mut BitBufReader) -> Result<CanonicalHuffmanTree<u8>> {
    let num_codes = 4 + usize::from(reader.read::<u8>(4)?);

    let mut code_lengths = [(0u8, 0u8); NUM_CODE_LENGTH_CODES];
    let mut order = CODE_LENGTH_CODE_ORDER.iter();
    for &symbol in order.by_ref().take(num_codes) {
        code_lengths[usize::from(symbol)] = (symbol, reader.read(3)?);
    }
    for &symbol in order {
        code_lengths[usize::from(symbol)] = (symbol, 0);
    }

    CanonicalHuffmanTree::new(&mut code_lengths).attach_printable("while reading the code length code")
}

/// Decode `alphabet_size` symbol code lengths with the run-length mini-protocol.
fn read_code_lengths<T: PrefixCodeSlot>(
    reader: &mut BitBufReader,
    code_length_code: &CanonicalHuffmanTree<u8>,
    alphabet_size: u16,
) -> Result<Vec<(T::Symbol, u8)>>
where
    T::Symbol: Copy + 'static,
    usize: AsPrimitive<T::Symbol>,
{
    let mut max_symbol = if reader.read_bit()? {
        let length_nbits = 2 + 2 * reader.read::<u32>(3)?;
        let max_symbol = 2 + reader.read::<u32>(length_nbits)?;
        ensure_attach!(
            max_symbol <= u32::from(alphabet_size),
            DecodeError::InvalidBitstream,
            InvalidSymbolCount(max_symbol, alphabet_size),
        );
        max_symbol
    } else {
        u32::from(alphabet_size)
    };

    let mut prev_code_length = DEFAULT_CODE_LENGTH;
    let mut code_lengths: Vec<(T::Symbol, u8)> = Vec::with_capacity(alphabet_size.into());
    while code_lengths.len() < usize::from(alphabet_size) {
        if max_symbol == 0 {
            break;
        }
        max_symbol -= 1;

        let code = reader.read_huffman(code_length_code)?;
        if code < CODE_LENGTH_LITERALS {
            code_lengths.push((code_lengths.len().as_(), code));
            if code != 0 {
                prev_code_length = code;
            }
        } else {
            // The code length alphabet has 19 symbols, so anything else is 18.
            let (length, extra_bits, repeat_offset) = match code {
                16 => (prev_code_length, 2, 3),
                17 => (0, 3, 3),
                _ => (0, 7, 11),
            };
            let repeat = repeat_offset + reader.read::<u16>(extra_bits)?;
            ensure_attach!(
                code_lengths.len() + usize::from(repeat) <= usize::from(alphabet_size),
                DecodeError::InvalidPrefixCode,
                InvalidCodeLengthRepetition(repeat, code_lengths.len(), alphabet_size),
            );
            for _ in 0..repeat {
                code_lengths.push((code_lengths.len().as_(), length));
            }
        }
    }

    // Lengths past max_symbol are implicitly zero.
    while code_lengths.len() < usize::from(alphabet_size) {
        code_lengths.push((code_lengths.len().as_(), 0));
    }
    Ok(code_lengths)
}
