//! Property-based tests for the systematic Reed-Solomon FEC codec.
//!
//! For any `erasureCount <= nparity` with correctly identified erasure
//! locations, `decode(encode(src)) == src` (`SPEC_FULL.md` §4.1).

use norm_engine::gf::{FecScheme, RsCodec};
use proptest::prelude::*;

fn roundtrip(scheme: FecScheme, ndata: usize, nparity: usize, erasures: &[usize], vec_size: usize, seed: u64) {
    let codec = RsCodec::new(scheme, ndata, nparity).unwrap();
    let source: Vec<Vec<u8>> = (0..ndata)
        .map(|i| {
            (0..vec_size)
                .map(|b| ((i as u64).wrapping_mul(131).wrapping_add(b as u64).wrapping_add(seed)) as u8)
                .collect()
        })
        .collect();

    let mut parity: Vec<Vec<u8>> = vec![Vec::new(); nparity];
    for (i, s) in source.iter().enumerate() {
        codec.encode_symbol(i, s, &mut parity).unwrap();
    }

    let mut received: Vec<Option<Vec<u8>>> = source.iter().cloned().map(Some).collect();
    received.extend(parity.iter().cloned().map(Some));
    for &e in erasures {
        received[e] = None;
    }

    codec.decode(&mut received, erasures).unwrap();
    for i in 0..ndata {
        assert_eq!(received[i].as_ref().unwrap(), &source[i], "symbol {i} mismatch");
    }
}

proptest! {
    /// Any subset of source positions, up to `nparity` of them, erased and
    /// correctly located must decode back to the original source symbols,
    /// over RS8.
    #[test]
    fn rs8_recovers_any_erasure_set_within_parity_budget(
        ndata in 2usize..=40,
        nparity in 1usize..=8,
        vec_size in 1usize..=64,
        seed in any::<u64>(),
        pick in 0usize..1000,
    ) {
        let nparity = nparity.min(ndata);
        let erasure_count = 1 + pick % nparity;
        let erasures: Vec<usize> = (0..erasure_count).map(|i| (i * 7 + pick) % ndata).collect();
        let mut erasures: Vec<usize> = erasures.into_iter().collect::<std::collections::BTreeSet<_>>().into_iter().collect();
        erasures.truncate(nparity);
        roundtrip(FecScheme::Rs8, ndata, nparity, &erasures, vec_size, seed);
    }

    /// Same property over RS16, which exercises the 2-byte-chunked
    /// accumulation path instead of RS8's byte-at-a-time GF(2^8) path.
    #[test]
    fn rs16_recovers_any_erasure_set_within_parity_budget(
        ndata in 2usize..=40,
        nparity in 1usize..=6,
        vec_size in 2usize..=64,
        seed in any::<u64>(),
        pick in 0usize..1000,
    ) {
        let nparity = nparity.min(ndata);
        let vec_size = if vec_size % 2 == 0 { vec_size } else { vec_size + 1 };
        let erasure_count = 1 + pick % nparity;
        let mut erasures: Vec<usize> = (0..erasure_count).map(|i| (i * 11 + pick) % ndata).collect::<std::collections::BTreeSet<_>>().into_iter().collect();
        erasures.truncate(nparity);
        roundtrip(FecScheme::Rs16, ndata, nparity, &erasures, vec_size, seed);
    }

    /// Erasure counts beyond `nparity` must be rejected rather than silently
    /// returning corrupted data.
    #[test]
    fn decode_rejects_erasures_beyond_parity_budget(
        ndata in 2usize..=20,
        nparity in 1usize..=4,
        extra in 1usize..=4,
    ) {
        let codec = RsCodec::new(FecScheme::Rs8, ndata, nparity).unwrap();
        let total = ndata + nparity;
        let mut received: Vec<Option<Vec<u8>>> = vec![Some(vec![0u8; 8]); total];
        let too_many = (nparity + extra).min(ndata);
        let erasures: Vec<usize> = (0..too_many).collect();
        for &e in &erasures {
            received[e] = None;
        }
        prop_assert!(codec.decode(&mut received, &erasures).is_err());
    }
}
