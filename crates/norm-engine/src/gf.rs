//! # Systematic Reed–Solomon FEC codec
//!
//! Two interchangeable field sizes (`RS8`/GF(2^8), `RS16`/GF(2^16)) plus a
//! legacy `MDP` variant that reorders the generator matrix rows. All three
//! share the same systematic-matrix-inversion contract: the top `k` rows of
//! the `(k+npar) x k` generator are the identity (source symbols pass
//! through unmodified), the bottom `npar` rows are a Vandermonde matrix over
//! the field. Decode inverts whichever `k` of the `k+npar` rows were
//! actually received and multiplies through to recover the erased rows.
//!
//! Table construction follows the reference implementation's
//! `enc_matrix`/`InvertDecodingMatrix` structuring (see `DESIGN.md`).

use once_cell::sync::Lazy;

use crate::error::{NormError, Result};

// ─── GF(2^8) tables ─────────────────────────────────────────────────────────

const GF8_PRIMITIVE: u16 = 0x11D;

const fn gen_gf8_tables() -> ([u8; 256], [u16; 256]) {
    let mut exp = [0u8; 256];
    let mut log = [0u16; 256];
    let mut x: u16 = 1;
    let mut i = 0usize;
    while i < 255 {
        exp[i] = x as u8;
        log[x as usize] = i as u16;
        x <<= 1;
        if x & 0x100 != 0 {
            x ^= GF8_PRIMITIVE;
        }
        i += 1;
    }
    exp[255] = exp[0];
    (exp, log)
}

const GF8_TABLES: ([u8; 256], [u16; 256]) = gen_gf8_tables();

/// GF(2^8) arithmetic, table-driven (log/antilog).
pub mod gf8 {
    use super::GF8_TABLES;

    #[inline]
    pub fn mul(a: u8, b: u8) -> u8 {
        if a == 0 || b == 0 {
            return 0;
        }
        let (exp, log) = &GF8_TABLES;
        let sum = log[a as usize] as u32 + log[b as usize] as u32;
        exp[(sum % 255) as usize]
    }

    #[inline]
    pub fn pow(base: u8, exponent: u32) -> u8 {
        if base == 0 {
            return if exponent == 0 { 1 } else { 0 };
        }
        let (exp, log) = &GF8_TABLES;
        let e = (log[base as usize] as u64 * exponent as u64) % 255;
        exp[e as usize]
    }

    #[inline]
    pub fn inv(a: u8) -> u8 {
        assert!(a != 0, "GF(256) inverse of zero");
        let (exp, log) = &GF8_TABLES;
        exp[(255 - log[a as usize] as usize) % 255]
    }

    #[inline]
    pub fn div(a: u8, b: u8) -> u8 {
        if a == 0 {
            return 0;
        }
        mul(a, inv(b))
    }
}

// ─── GF(2^16) tables ────────────────────────────────────────────────────────

const GF16_PRIMITIVE: u32 = 0x1100B;
const GF16_ORDER: u32 = 65535;

struct Gf16Tables {
    exp: Vec<u16>,
    log: Vec<u32>,
}

fn build_gf16_tables() -> Gf16Tables {
    let mut exp = vec![0u16; GF16_ORDER as usize + 1];
    let mut log = vec![0u32; 1 << 16];
    let mut x: u32 = 1;
    for i in 0..GF16_ORDER as usize {
        exp[i] = x as u16;
        log[x as usize] = i as u32;
        x <<= 1;
        if x & 0x1_0000 != 0 {
            x ^= GF16_PRIMITIVE;
        }
    }
    exp[GF16_ORDER as usize] = exp[0];
    Gf16Tables { exp, log }
}

static GF16_TABLES: Lazy<Gf16Tables> = Lazy::new(build_gf16_tables);

/// GF(2^16) arithmetic, table-driven (log/antilog), tables built lazily
/// on first use since the 64K-entry log table is too large to recompute
/// per block.
pub mod gf16 {
    use super::{GF16_ORDER, GF16_TABLES};

    #[inline]
    pub fn mul(a: u16, b: u16) -> u16 {
        if a == 0 || b == 0 {
            return 0;
        }
        let t = &*GF16_TABLES;
        let sum = t.log[a as usize] as u64 + t.log[b as usize] as u64;
        t.exp[(sum % GF16_ORDER as u64) as usize]
    }

    #[inline]
    pub fn pow(base: u16, exponent: u32) -> u16 {
        if base == 0 {
            return if exponent == 0 { 1 } else { 0 };
        }
        let t = &*GF16_TABLES;
        let e = (t.log[base as usize] as u64 * exponent as u64) % GF16_ORDER as u64;
        t.exp[e as usize]
    }

    #[inline]
    pub fn inv(a: u16) -> u16 {
        assert!(a != 0, "GF(65536) inverse of zero");
        let t = &*GF16_TABLES;
        t.exp[((GF16_ORDER as u64 - t.log[a as usize] as u64) % GF16_ORDER as u64) as usize]
    }

    #[inline]
    pub fn div(a: u16, b: u16) -> u16 {
        if a == 0 {
            return 0;
        }
        mul(a, inv(b))
    }
}

// ─── Field-agnostic matrix machinery ───────────────────────────────────────

/// The three wire-compatible FEC schemes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum FecScheme {
    /// `fecId=2`: systematic RS over GF(2^8), block size <= 255.
    Rs8,
    /// `fecId=5`: systematic RS over GF(2^16), block size <= 65535.
    Rs16,
    /// `fecId=129`: legacy MDP variant, reversed generator row order.
    Mdp,
}

impl FecScheme {
    pub fn m(&self) -> u8 {
        match self {
            FecScheme::Rs8 => 8,
            FecScheme::Rs16 | FecScheme::Mdp => 16,
        }
    }

    pub fn max_block_size(&self) -> usize {
        match self {
            FecScheme::Rs8 => 255,
            FecScheme::Rs16 | FecScheme::Mdp => 65535,
        }
    }

    fn order(&self) -> u32 {
        match self {
            FecScheme::Rs8 => 255,
            FecScheme::Rs16 | FecScheme::Mdp => GF16_ORDER,
        }
    }

    fn field_mul(&self, a: u16, b: u16) -> u16 {
        match self {
            FecScheme::Rs8 | FecScheme::Mdp => gf8::mul(a as u8, b as u8) as u16,
            FecScheme::Rs16 => gf16::mul(a, b),
        }
    }

    fn field_pow(&self, base: u16, exp: u32) -> u16 {
        match self {
            FecScheme::Rs8 | FecScheme::Mdp => gf8::pow(base as u8, exp) as u16,
            FecScheme::Rs16 => gf16::pow(base, exp),
        }
    }

    fn field_inv(&self, a: u16) -> u16 {
        match self {
            FecScheme::Rs8 | FecScheme::Mdp => gf8::inv(a as u8) as u16,
            FecScheme::Rs16 => gf16::inv(a),
        }
    }

    /// Vandermonde parity-row coefficient for source column `i`, parity row `j`.
    fn parity_coeff(&self, i: usize, j: usize, npar: usize) -> u16 {
        if i == 0 {
            return 1;
        }
        let exponent = match self {
            FecScheme::Mdp => (i as u32) * ((npar - 1 - j) as u32),
            _ => (i as u32) * (j as u32),
        };
        self.field_pow(2, exponent % self.order())
    }
}

/// Systematic Reed-Solomon encoder/decoder for one FEC block.
///
/// `encode_symbol` must be called exactly once per source symbol in
/// increasing `segment_id` order (§4.1); `decode` recovers any erased
/// source symbols given `erasure_count <= nparity` correctly-received
/// parity symbols.
#[derive(Debug)]
pub struct RsCodec {
    scheme: FecScheme,
    ndata: usize,
    nparity: usize,
}

impl RsCodec {
    pub fn new(scheme: FecScheme, ndata: usize, nparity: usize) -> Result<Self> {
        if ndata == 0 || ndata > scheme.max_block_size() {
            return Err(NormError::Config(format!(
                "ndata={ndata} out of range for {scheme:?}"
            )));
        }
        if nparity == 0 || ndata + nparity > scheme.max_block_size() {
            return Err(NormError::Config(format!(
                "nparity={nparity} out of range for {scheme:?} with ndata={ndata}"
            )));
        }
        Ok(RsCodec {
            scheme,
            ndata,
            nparity,
        })
    }

    pub fn ndata(&self) -> usize {
        self.ndata
    }

    pub fn nparity(&self) -> usize {
        self.nparity
    }

    /// Incrementally accumulate source symbol `segment_id`'s contribution
    /// into each of the `nparity` parity vectors. `data` and every entry of
    /// `parity` must share the same length (`vec_size`, padded as needed).
    pub fn encode_symbol(&self, segment_id: usize, data: &[u8], parity: &mut [Vec<u8>]) -> Result<()> {
        if segment_id >= self.ndata {
            return Err(NormError::Fec(format!(
                "segment_id {segment_id} out of range (ndata={})",
                self.ndata
            )));
        }
        if parity.len() != self.nparity {
            return Err(NormError::Fec("parity vector count mismatch".into()));
        }
        for (j, pvec) in parity.iter_mut().enumerate() {
            if pvec.len() != data.len() {
                pvec.resize(data.len(), 0);
            }
            let coeff = self.scheme.parity_coeff(segment_id, j, self.nparity);
            if coeff == 0 {
                continue;
            }
            self.accumulate(pvec, data, coeff);
        }
        Ok(())
    }

    fn accumulate(&self, dst: &mut [u8], src: &[u8], coeff: u16) {
        match self.scheme {
            FecScheme::Rs8 | FecScheme::Mdp => {
                let c = coeff as u8;
                for (d, s) in dst.iter_mut().zip(src.iter()) {
                    *d ^= gf8::mul(c, *s);
                }
            }
            FecScheme::Rs16 => {
                for (dchunk, schunk) in dst.chunks_mut(2).zip(src.chunks(2)) {
                    if dchunk.len() < 2 || schunk.len() < 2 {
                        continue;
                    }
                    let sval = u16::from_be_bytes([schunk[0], schunk[1]]);
                    let product = gf16::mul(coeff, sval);
                    let dval = u16::from_be_bytes([dchunk[0], dchunk[1]]) ^ product;
                    let bytes = dval.to_be_bytes();
                    dchunk[0] = bytes[0];
                    dchunk[1] = bytes[1];
                }
            }
        }
    }

    /// Recover erased source symbols. `received` holds one entry per
    /// symbol index `0..ndata+nparity`; entries at positions listed in
    /// `erasure_locs` are ignored (may be empty/garbage). On success, the
    /// erased entries of `received` at source positions are overwritten
    /// with recovered data.
    pub fn decode(&self, received: &mut [Option<Vec<u8>>], erasure_locs: &[usize]) -> Result<()> {
        if erasure_locs.len() > self.nparity {
            return Err(NormError::Fec(format!(
                "erasure_count {} exceeds nparity {}",
                erasure_locs.len(),
                self.nparity
            )));
        }
        if received.len() != self.ndata + self.nparity {
            return Err(NormError::Fec("received vector count mismatch".into()));
        }

        let erased_source: Vec<usize> = erasure_locs
            .iter()
            .copied()
            .filter(|&loc| loc < self.ndata)
            .collect();
        if erased_source.is_empty() {
            return Ok(());
        }

        // Build the k received row indices: every non-erased source row
        // contributes its identity row directly; for each erased source
        // row we borrow the next unused, received parity row.
        let mut row_indices: Vec<usize> = Vec::with_capacity(self.ndata);
        let erased_set: std::collections::HashSet<usize> = erased_source.iter().copied().collect();
        for i in 0..self.ndata {
            if !erased_set.contains(&i) {
                row_indices.push(i);
            }
        }
        for j in 0..self.nparity {
            if row_indices.len() == self.ndata {
                break;
            }
            let parity_idx = self.ndata + j;
            if received[parity_idx].is_some() {
                row_indices.push(parity_idx);
            }
        }
        if row_indices.len() != self.ndata {
            return Err(NormError::Fec(
                "insufficient received symbols to decode block".into(),
            ));
        }

        // Build the k x k matrix over the chosen rows, columns 0..ndata.
        let k = self.ndata;
        let mut matrix: Vec<Vec<u16>> = Vec::with_capacity(k);
        for &row in &row_indices {
            if row < self.ndata {
                let mut r = vec![0u16; k];
                r[row] = 1;
                matrix.push(r);
            } else {
                let j = row - self.ndata;
                let r: Vec<u16> = (0..k).map(|i| self.scheme.parity_coeff(i, j, self.nparity)).collect();
                matrix.push(r);
            }
        }

        let inverse = self.invert(&matrix)?;

        let vec_size = received
            .iter()
            .find_map(|v| v.as_ref().map(|b| b.len()))
            .unwrap_or(0);

        // Recompute only the erased source rows: recovered[i] = sum_c inv[i][c] * received_row[c]
        let received_rows: Vec<&Vec<u8>> = row_indices
            .iter()
            .map(|&row| received[row].as_ref().expect("row selected because present"))
            .collect();

        let mut recovered = Vec::with_capacity(erased_source.len());
        for &erased in &erased_source {
            let mut out = vec![0u8; vec_size];
            for (c, row_data) in received_rows.iter().enumerate() {
                let coeff = inverse[erased][c];
                if coeff == 0 {
                    continue;
                }
                self.accumulate(&mut out, row_data, coeff);
            }
            recovered.push((erased, out));
        }
        drop(received_rows);
        for (erased, out) in recovered {
            received[erased] = Some(out);
        }

        Ok(())
    }

    /// Gauss-Jordan elimination with partial pivoting over the field.
    fn invert(&self, matrix: &[Vec<u16>]) -> Result<Vec<Vec<u16>>> {
        let n = matrix.len();
        let mut aug: Vec<Vec<u16>> = matrix
            .iter()
            .enumerate()
            .map(|(i, row)| {
                let mut r = row.clone();
                r.resize(2 * n, 0);
                r[n + i] = 1;
                r
            })
            .collect();

        for col in 0..n {
            let pivot_row = (col..n).find(|&r| aug[r][col] != 0).ok_or_else(|| {
                NormError::Fec("singular matrix during RS decode".into())
            })?;
            aug.swap(col, pivot_row);

            let inv_pivot = self.scheme.field_inv(aug[col][col]);
            for v in aug[col].iter_mut() {
                *v = self.scheme.field_mul(*v, inv_pivot);
            }

            for row in 0..n {
                if row == col {
                    continue;
                }
                let factor = aug[row][col];
                if factor == 0 {
                    continue;
                }
                for c in 0..2 * n {
                    let term = self.scheme.field_mul(factor, aug[col][c]);
                    aug[row][c] ^= term;
                }
            }
        }

        Ok(aug.into_iter().map(|row| row[n..].to_vec()).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gf8_mul_div_roundtrip() {
        for a in 1..=255u16 {
            for b in 1..=255u16 {
                let p = gf8::mul(a as u8, b as u8);
                assert_eq!(gf8::div(p, b as u8), a as u8);
            }
        }
    }

    #[test]
    fn gf8_inv_is_multiplicative_inverse() {
        for a in 1..=255u8 {
            assert_eq!(gf8::mul(a, gf8::inv(a)), 1);
        }
    }

    #[test]
    fn gf16_mul_div_roundtrip() {
        for a in [1u16, 2, 300, 12345, 65535] {
            for b in [1u16, 7, 1000, 54321] {
                let p = gf16::mul(a, b);
                assert_eq!(gf16::div(p, b), a);
            }
        }
    }

    fn roundtrip(scheme: FecScheme, ndata: usize, nparity: usize, erasure_count: usize, vec_size: usize) {
        let codec = RsCodec::new(scheme, ndata, nparity).unwrap();
        let source: Vec<Vec<u8>> = (0..ndata)
            .map(|i| (0..vec_size).map(|b| ((i * 7 + b * 3 + 1) % 251) as u8).collect())
            .collect();

        let mut parity: Vec<Vec<u8>> = vec![Vec::new(); nparity];
        for (i, s) in source.iter().enumerate() {
            codec.encode_symbol(i, s, &mut parity).unwrap();
        }

        let mut received: Vec<Option<Vec<u8>>> = Vec::with_capacity(ndata + nparity);
        for s in &source {
            received.push(Some(s.clone()));
        }
        for p in &parity {
            received.push(Some(p.clone()));
        }

        let erasures: Vec<usize> = (0..erasure_count).collect();
        for &e in &erasures {
            received[e] = None;
        }

        codec.decode(&mut received, &erasures).unwrap();

        for i in 0..ndata {
            assert_eq!(received[i].as_ref().unwrap(), &source[i], "symbol {i} mismatch");
        }
    }

    #[test]
    fn rs8_decode_recovers_all_erasures_at_parity_limit() {
        roundtrip(FecScheme::Rs8, 16, 4, 4, 32);
    }

    #[test]
    fn rs8_decode_single_erasure() {
        roundtrip(FecScheme::Rs8, 32, 8, 1, 64);
    }

    #[test]
    fn rs16_decode_recovers_erasures() {
        roundtrip(FecScheme::Rs16, 20, 5, 5, 64);
    }

    #[test]
    fn mdp_decode_recovers_erasures() {
        roundtrip(FecScheme::Mdp, 16, 4, 3, 32);
    }

    #[test]
    fn decode_too_many_erasures_is_rejected() {
        let codec = RsCodec::new(FecScheme::Rs8, 8, 2).unwrap();
        let mut received: Vec<Option<Vec<u8>>> = vec![Some(vec![0u8; 4]); 10];
        let erasures = vec![0, 1, 2];
        assert!(codec.decode(&mut received, &erasures).is_err());
    }

    #[test]
    fn decode_no_erasures_is_noop() {
        let codec = RsCodec::new(FecScheme::Rs8, 4, 2).unwrap();
        let mut received: Vec<Option<Vec<u8>>> = vec![Some(vec![1u8; 4]); 6];
        codec.decode(&mut received, &[]).unwrap();
        assert!(received.iter().all(|v| v.is_some()));
    }
}
