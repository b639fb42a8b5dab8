use bytes::Bytes;
use criterion::{black_box, criterion_group, criterion_main, BatchSize, Criterion};
use vp8ldec::bitstream::{BitBufReader, CanonicalHuffmanTree};

criterion_group!(
    benches,
    read_huffman_one_symbol,
    read_huffman_two_symbols,
    read_huffman_256_symbols
);
criterion_main!(benches);

const BUF_LEN: usize = 4096;

pub fn read_huffman_one_symbol(c: &mut Criterion) {
    let tree = CanonicalHuffmanTree::<u8>::default();
    read_huffman(c, "one symbol", &tree);
}

pub fn read_huffman_two_symbols(c: &mut Criterion) {
    let tree = CanonicalHuffmanTree::new(&mut [(0u8, 1), (1, 1)]).unwrap();
    read_huffman(c, "two symbols", &tree);
}

pub fn read_huffman_256_symbols(c: &mut Criterion) {
    let mut code_lengths: Vec<(u16, u8)> = (0..256).map(|symbol| (symbol, 8)).collect();
    let tree = CanonicalHuffmanTree::new(&mut code_lengths).unwrap();
    read_huffman(c, "256 symbols", &tree);
}

fn read_huffman<S: Clone>(c: &mut Criterion, name: &str, tree: &CanonicalHuffmanTree<S>) {
    let reads = match tree.longest_code_len() {
        0 => BUF_LEN * 8,
        len => BUF_LEN * 8 / len as usize,
    };
    let mut group = c.benchmark_group(name);
    group.throughput(criterion::Throughput::Bytes(BUF_LEN as u64));
    group.bench_function("read_huffman", |bencher| {
        bencher.iter_batched(
            || BitBufReader::new(Bytes::from(vec![0u8; BUF_LEN])),
            |mut reader| {
                for _ in 0..reads {
                    black_box(reader.read_huffman(tree)).unwrap();
                }
            },
            BatchSize::SmallInput,
        )
    });
    group.finish();
}
