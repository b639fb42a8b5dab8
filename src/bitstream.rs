#![allow(missing_docs)]

//! Unstable lower-level API: the LSB-first bit reader and canonical prefix-code trees.

use std::fmt::Debug;
use std::io::Cursor;
use std::num::NonZeroU32;

use bitstream_io::huffman::{compile_read_tree, ReadHuffmanTree};
use bitstream_io::{BitRead, BitReader, HuffmanRead, Numeric, LE};
use bytes::Bytes;
use derive_more::Display;

use crate::error::{DecodeError, Result};
use crate::util::IoResultExt;
use crate::{bail_attach, ensure_attach, report_attach};

/// An LSB-first bit reader over the complete compressed payload.
///
/// Reads past the end of the buffer surface [`DecodeError::Truncated`], which the decoder maps to
/// the resumable `Suspended` status.
pub struct BitBufReader {
    reader: BitReader<Cursor<Bytes>, LE>,
}

/// A canonical prefix-code tree over symbols of type `S`.
///
/// Wraps the compiled read tree as an opaque query capability: [`BitBufReader::read_huffman`]
/// walks it bit by bit until a leaf symbol is reached.
pub struct CanonicalHuffmanTree<S: Clone> {
    read_tree: Box<[ReadHuffmanTree<LE, S>]>,
    longest_code_len: u32,
}

impl<S: Clone> Debug for CanonicalHuffmanTree<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CanonicalHuffmanTree")
            .field("longest_code_len", &self.longest_code_len)
            .finish_non_exhaustive()
    }
}

#[derive(Display)]
#[display(fmt = "invalid lz77 prefix code `{_0}`")]
struct InvalidLz77PrefixCode(u16);

#[derive(Display)]
#[display(fmt = "prefix code is {_0}subscribed")]
struct SubscriptionMismatch(&'static str);

//
// BitBufReader impls
//

impl BitBufReader {
    pub fn new(input: Bytes) -> Self {
        Self { reader: BitReader::new(Cursor::new(input)) }
    }

    pub fn read_bit(&mut self) -> Result<bool> {
        self.reader.read_bit().map_eof()
    }

    /// Read the next `bits` bits, LSB first within each byte.
    pub fn read<T: Numeric>(&mut self, bits: u32) -> Result<T> {
        self.reader.read(bits).map_eof()
    }

    pub fn read_huffman<S: Clone>(&mut self, tree: &CanonicalHuffmanTree<S>) -> Result<S> {
        self.reader.read_huffman(tree.read_tree()).map_eof()
    }

    /// Decode the shared LZ77 length/distance value for `prefix_code`.
    pub fn read_lz77(&mut self, prefix_code: u16) -> Result<NonZeroU32> {
        match prefix_code {
            0..=3 => Ok(NonZeroU32::MIN.saturating_add(prefix_code.into())),
            4..=39 => {
                let extra_bits = (u32::from(prefix_code) - 2) >> 1;
                let offset = (2 + (u32::from(prefix_code) & 1)) << extra_bits;
                Ok(NonZeroU32::MIN.saturating_add(offset + self.read::<u32>(extra_bits)?))
            }
            _ => bail_attach!(DecodeError::InvalidBitstream, InvalidLz77PrefixCode(prefix_code)),
        }
    }
}

//
// CanonicalHuffmanTree impls
//

impl<S: Clone> CanonicalHuffmanTree<S> {
    /// Build a tree from per-symbol code lengths, assigning codes canonically.
    ///
    /// Over- and under-subscribed length assignments are rejected. A single used symbol denotes
    /// the trivial code emitting that symbol without consuming bits.
    pub fn new(code_lengths: &mut [(S, u8)]) -> Result<Self>
    where
        S: Copy + Debug + Ord + 'static,
    {
        let longest_code_len = u32::from(code_lengths.iter().map(|&(_, len)| len).max().unwrap_or_default());
        let symbols = Self::symbols(code_lengths)?;
        log::debug!("symbols: {symbols:?}");
        let read_tree =
            compile_read_tree(symbols).map_err(|err| report_attach!(DecodeError::InvalidPrefixCode, err))?;
        Ok(Self { read_tree, longest_code_len })
    }

    /// Build a tree directly from `(symbol, code bits)` pairs, as the simple-code path does.
    pub fn from_symbols(symbols: Vec<(S, Vec<u8>)>) -> Result<Self> {
        let longest_code_len = symbols.iter().map(|(_, code)| code.len()).max().unwrap_or_default() as u32;
        let read_tree =
            compile_read_tree(symbols).map_err(|err| report_attach!(DecodeError::InvalidPrefixCode, err))?;
        Ok(Self { read_tree, longest_code_len })
    }

    pub fn read_tree(&self) -> &[ReadHuffmanTree<LE, S>] {
        &self.read_tree
    }

    pub fn longest_code_len(&self) -> u32 {
        self.longest_code_len
    }

    fn symbols(code_lengths: &mut [(S, u8)]) -> Result<Vec<(S, Vec<u8>)>>
    where
        S: Copy + Ord + 'static,
    {
        code_lengths.sort_unstable_by_key(|&(symbol, code_length)| (code_length, symbol));
        let zero_code_length_count = code_lengths.partition_point(|&(_, code_length)| code_length == 0);

        match &code_lengths[zero_code_length_count..] {
            [] => bail_attach!(DecodeError::InvalidPrefixCode, "no symbol has a non-zero code length"),

            // One used symbol decodes without consuming bits.
            &[(symbol, _)] => Ok(vec![(symbol, vec![])]),

            used @ &[(_, first_code_length), .., (_, last_code_length)] => {
                let mut kraft_sum = 0u64;
                for &(_, code_length) in used {
                    kraft_sum += 1 << (u32::from(last_code_length) - u32::from(code_length));
                }
                ensure_attach!(
                    kraft_sum == 1 << u32::from(last_code_length),
                    DecodeError::InvalidPrefixCode,
                    SubscriptionMismatch(if kraft_sum > 1 << u32::from(last_code_length) { "over" } else { "under" }),
                );

                let mut code = Vec::with_capacity(last_code_length.into());
                code.resize(first_code_length.into(), 0);

                let mut symbols = Vec::with_capacity(used.len());
                symbols.push((used[0].0, code.clone()));
                for &(symbol, code_length) in &used[1..] {
                    for code_bit in code.iter_mut().rev() {
                        *code_bit ^= 1;
                        if *code_bit == 1 {
                            break;
                        }
                    }
                    code.resize(code_length.into(), 0);
                    symbols.push((symbol, code.clone()));
                }
                Ok(symbols)
            }
        }
    }
}

impl<S: Clone + Default> Default for CanonicalHuffmanTree<S> {
    fn default() -> Self {
        Self::from_symbols(vec![(S::default(), vec![])]).unwrap_or_else(|_| unreachable!())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use assert_matches::assert_matches;

    fn reader(bytes: &[u8]) -> BitBufReader {
        BitBufReader::new(Bytes::copy_from_slice(bytes))
    }

    #[test]
    fn read_is_lsb_first() {
        let mut br = reader(&[0b1010_0110, 0b0000_0001]);
        assert_eq!(br.read::<u8>(3).unwrap(), 0b110);
        assert_eq!(br.read::<u8>(5).unwrap(), 0b10100);
        assert_eq!(br.read::<u16>(8).unwrap(), 1);
    }

    #[test]
    fn read_past_end_is_truncated() {
        let mut br = reader(&[0xff]);
        assert_eq!(br.read::<u16>(8).unwrap(), 0xff);
        assert_matches!(br.read::<u16>(1).unwrap_err().get_ref(), DecodeError::Truncated);
    }

    #[test]
    fn canonical_codes_consume_assigned_lengths() {
        // lengths {a: 1, b: 2, c: 2} assign codes 0, 01, 11 (LSB-first on the wire).
        let mut tree_lengths = [(0u8, 1), (1, 2), (2, 2)];
        let tree = CanonicalHuffmanTree::new(&mut tree_lengths).unwrap();
        assert_eq!(tree.longest_code_len(), 2);
        let mut br = reader(&[0b0001_1010]);
        assert_eq!(br.read_huffman(&tree).unwrap(), 0);
        assert_eq!(br.read_huffman(&tree).unwrap(), 1);
        assert_eq!(br.read_huffman(&tree).unwrap(), 2);
        assert_eq!(br.read_huffman(&tree).unwrap(), 0);
    }

    #[test]
    fn single_symbol_consumes_no_bits() {
        let mut lengths = [(7u8, 0), (42, 1)];
        let tree = CanonicalHuffmanTree::new(&mut lengths).unwrap();
        let mut br = reader(&[]);
        assert_eq!(br.read_huffman(&tree).unwrap(), 42);
        assert_eq!(br.read_huffman(&tree).unwrap(), 42);
    }

    #[test]
    fn oversubscribed_lengths_rejected() {
        let mut lengths = [(0u8, 1), (1, 1), (2, 1)];
        assert_matches!(
            CanonicalHuffmanTree::new(&mut lengths).unwrap_err().get_ref(),
            DecodeError::InvalidPrefixCode
        );
    }

    #[test]
    fn undersubscribed_lengths_rejected() {
        let mut lengths = [(0u8, 1), (1, 2)];
        assert_matches!(
            CanonicalHuffmanTree::new(&mut lengths).unwrap_err().get_ref(),
            DecodeError::InvalidPrefixCode
        );
    }

    #[test]
    fn lz77_values() {
        let mut br = reader(&[]);
        for (code, value) in [(0, 1), (1, 2), (2, 3), (3, 4)] {
            assert_eq!(br.read_lz77(code).unwrap().get(), value);
        }
        // code 4: offset 4, one extra bit
        let mut br = reader(&[0b1]);
        assert_eq!(br.read_lz77(4).unwrap().get(), 6);
        let mut br = reader(&[0b0]);
        assert_eq!(br.read_lz77(4).unwrap().get(), 5);
        assert_matches!(reader(&[]).read_lz77(40).unwrap_err().get_ref(), DecodeError::InvalidBitstream);
    }
}
