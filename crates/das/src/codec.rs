use rayon::prelude::*;
use reed_solomon_erasure::{galois_16, galois_8, Field, ReedSolomon};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, info};

use crate::{DasError, Result};

/// Largest share count GF(2^8) can address.
pub const MAX_GF8_SHARDS: usize = 256;
/// Largest share count GF(2^16) can address.
pub const MAX_GF16_SHARDS: usize = 65_536;

/// Shards are coded in independent column stripes of this many bytes.
const STRIPE_LEN: usize = 64 * 1024;

/// Galois field the Reed-Solomon code runs over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FieldWidth {
    Gf8,
    Gf16,
}

impl FieldWidth {
    pub fn for_shards(total_shards: usize) -> Result<Self> {
        if total_shards <= MAX_GF8_SHARDS {
            Ok(Self::Gf8)
        } else if total_shards <= MAX_GF16_SHARDS {
            Ok(Self::Gf16)
        } else {
            Err(DasError::Codec(format!(
                "{} shards exceed the {} supported by GF(2^16)",
                total_shards, MAX_GF16_SHARDS
            )))
        }
    }

    fn elem_bytes(&self) -> usize {
        match self {
            Self::Gf8 => 1,
            Self::Gf16 => 2,
        }
    }
}

/// Erasure coded payload
#[derive(Debug, Clone)]
pub struct EncodedPayload {
    /// Data shards first, then parity shards
    pub shards: Vec<Vec<u8>>,
    pub data_units: usize,
    pub payload_len: u64,
    pub shard_len: usize,
}

impl EncodedPayload {
    pub fn total_shards(&self) -> usize {
        self.shards.len()
    }

    /// Distinct shards needed to decode.
    pub fn threshold(&self) -> usize {
        self.data_units
    }

    pub fn data_shards(&self) -> &[Vec<u8>] {
        &self.shards[..self.data_units]
    }
}

/// Systematic Reed-Solomon code over fixed-size units.
///
/// A payload of `M` bytes is cut into `k = max(1, ceil(M / unit_size))`
/// data units and expanded to `redundancy * k` shards, any `k` of which
/// decode the payload.
#[derive(Debug, Clone)]
pub struct ErasureCodec {
    unit_size: usize,
    redundancy: usize,
}

impl ErasureCodec {
    pub fn new(unit_size: usize, redundancy: usize) -> Result<Self> {
        if unit_size == 0 {
            return Err(DasError::Codec("unit size must be non-zero".into()));
        }
        if redundancy < 2 {
            return Err(DasError::Codec(format!(
                "redundancy factor {} leaves no parity",
                redundancy
            )));
        }
        Ok(Self { unit_size, redundancy })
    }

    pub fn unit_size(&self) -> usize {
        self.unit_size
    }

    pub fn redundancy(&self) -> usize {
        self.redundancy
    }

    pub fn data_units_for(&self, payload_len: usize) -> usize {
        payload_len.div_ceil(self.unit_size).max(1)
    }

    pub fn total_shards_for(&self, data_units: usize) -> usize {
        data_units * self.redundancy
    }

    /// Shard length for a given data unit count. GF(2^16) works on byte
    /// pairs so odd unit sizes gain one padding byte there.
    pub fn shard_len_for(&self, data_units: usize) -> Result<usize> {
        let width = FieldWidth::for_shards(self.total_shards_for(data_units))?;
        Ok(self.unit_size.next_multiple_of(width.elem_bytes()))
    }

    /// Encode a payload into `redundancy * k` shards.
    pub fn encode(&self, payload: &[u8]) -> Result<EncodedPayload> {
        let data_units = self.data_units_for(payload.len());
        let total = self.total_shards_for(data_units);
        let width = FieldWidth::for_shards(total)?;
        let shard_len = self.shard_len_for(data_units)?;

        debug!(
            "Encoding {} bytes into {} data and {} parity shards over {:?}",
            payload.len(),
            data_units,
            total - data_units,
            width
        );

        let mut shards: Vec<Vec<u8>> = (0..data_units)
            .into_par_iter()
            .map(|i| {
                let start = (i * self.unit_size).min(payload.len());
                let end = ((i + 1) * self.unit_size).min(payload.len());
                let mut shard = Vec::with_capacity(shard_len);
                shard.extend_from_slice(&payload[start..end]);
                shard.resize(shard_len, 0);
                shard
            })
            .collect();

        let parity = match width {
            FieldWidth::Gf8 => encode_parity::<galois_8::Field>(&shards, total - data_units, shard_len)?,
            FieldWidth::Gf16 => encode_parity::<galois_16::Field>(&shards, total - data_units, shard_len)?,
        };
        shards.extend(parity);

        info!(
            "Encoded {} bytes into {} shards of {} bytes each",
            payload.len(),
            shards.len(),
            shard_len
        );

        Ok(EncodedPayload {
            shards,
            data_units,
            payload_len: payload.len() as u64,
            shard_len,
        })
    }

    /// Extend already split data shards with parity, keeping their bytes
    /// as they are (padding included).
    pub fn encode_units(&self, units: Vec<Vec<u8>>, payload_len: u64) -> Result<EncodedPayload> {
        let data_units = units.len();
        if data_units == 0 {
            return Err(DasError::Codec("data unit count must be non-zero".into()));
        }
        let total = self.total_shards_for(data_units);
        let width = FieldWidth::for_shards(total)?;
        let shard_len = self.shard_len_for(data_units)?;
        if let Some(unit) = units.iter().find(|unit| unit.len() != shard_len) {
            return Err(DasError::Codec(format!(
                "data unit has {} bytes, expected {}",
                unit.len(),
                shard_len
            )));
        }

        let parity = match width {
            FieldWidth::Gf8 => encode_parity::<galois_8::Field>(&units, total - data_units, shard_len)?,
            FieldWidth::Gf16 => encode_parity::<galois_16::Field>(&units, total - data_units, shard_len)?,
        };
        let mut shards = units;
        shards.extend(parity);

        Ok(EncodedPayload {
            shards,
            data_units,
            payload_len,
            shard_len,
        })
    }

    /// Decode the payload from any `data_units` distinct shards.
    ///
    /// Repeated indices must carry identical bytes. When more than the
    /// threshold is supplied every extra shard is checked against the
    /// parity of the decoded units.
    pub fn decode<I>(&self, shares: I, data_units: usize, payload_len: u64) -> Result<Vec<u8>>
    where
        I: IntoIterator<Item = (u32, Vec<u8>)>,
    {
        if payload_len > (data_units * self.unit_size) as u64 {
            return Err(DasError::Codec(format!(
                "payload length {} does not fit {} units of {} bytes",
                payload_len, data_units, self.unit_size
            )));
        }

        let units = self.decode_units(shares, data_units)?;
        let mut payload = Vec::with_capacity(data_units * self.unit_size);
        for unit in &units {
            payload.extend_from_slice(&unit[..self.unit_size]);
        }
        payload.truncate(payload_len as usize);
        Ok(payload)
    }

    /// Decode the `data_units` data shards, padding included.
    pub fn decode_units<I>(&self, shares: I, data_units: usize) -> Result<Vec<Vec<u8>>>
    where
        I: IntoIterator<Item = (u32, Vec<u8>)>,
    {
        if data_units == 0 {
            return Err(DasError::Codec("data unit count must be non-zero".into()));
        }
        let total = self.total_shards_for(data_units);
        let width = FieldWidth::for_shards(total)?;
        let shard_len = self.shard_len_for(data_units)?;

        let mut supplied: BTreeMap<u32, Vec<u8>> = BTreeMap::new();
        for (index, data) in shares {
            if index as usize >= total {
                return Err(DasError::InconsistentShares(format!(
                    "share index {} out of range for {} shares",
                    index, total
                )));
            }
            if data.len() != shard_len {
                return Err(DasError::InconsistentShares(format!(
                    "share {} has {} bytes, expected {}",
                    index,
                    data.len(),
                    shard_len
                )));
            }
            if let Some(existing) = supplied.get(&index) {
                if *existing != data {
                    return Err(DasError::InconsistentShares(format!(
                        "conflicting contents for share {}",
                        index
                    )));
                }
                continue;
            }
            supplied.insert(index, data);
        }

        if supplied.len() < data_units {
            return Err(DasError::InsufficientShares {
                have: supplied.len(),
                need: data_units,
            });
        }

        // Always decode from the lowest indices so supersets agree.
        let mut slots: Vec<Option<Vec<u8>>> = vec![None; total];
        for (index, data) in supplied.iter().take(data_units) {
            slots[*index as usize] = Some(data.clone());
        }

        let systematic = slots[..data_units].iter().all(Option::is_some);
        let units: Vec<Vec<u8>> = if systematic {
            slots.into_iter().take(data_units).flatten().collect()
        } else {
            match width {
                FieldWidth::Gf8 => reconstruct_units::<galois_8::Field>(slots, data_units, shard_len)?,
                FieldWidth::Gf16 => reconstruct_units::<galois_16::Field>(slots, data_units, shard_len)?,
            }
        };

        if supplied.len() > data_units {
            self.check_extra_shares(&units, &supplied, total, width, shard_len)?;
        }

        debug!(
            "Decoded {} data units from {} supplied shares",
            data_units,
            supplied.len()
        );
        Ok(units)
    }

    fn check_extra_shares(
        &self,
        units: &[Vec<u8>],
        supplied: &BTreeMap<u32, Vec<u8>>,
        total: usize,
        width: FieldWidth,
        shard_len: usize,
    ) -> Result<()> {
        let data_units = units.len();
        let parity = match width {
            FieldWidth::Gf8 => encode_parity::<galois_8::Field>(units, total - data_units, shard_len)?,
            FieldWidth::Gf16 => encode_parity::<galois_16::Field>(units, total - data_units, shard_len)?,
        };

        for (index, data) in supplied.iter().skip(data_units) {
            let index = *index as usize;
            let expected = if index < data_units {
                &units[index]
            } else {
                &parity[index - data_units]
            };
            if expected != data {
                return Err(DasError::InconsistentShares(format!(
                    "share {} disagrees with the parity of the other shares",
                    index
                )));
            }
        }
        Ok(())
    }
}

/// Byte view of a Reed-Solomon field element.
trait ByteField: Field {
    fn pack(bytes: &[u8]) -> Vec<Self::Elem>;
    fn unpack(elems: &[Self::Elem], out: &mut Vec<u8>);
}

impl ByteField for galois_8::Field {
    fn pack(bytes: &[u8]) -> Vec<u8> {
        bytes.to_vec()
    }

    fn unpack(elems: &[u8], out: &mut Vec<u8>) {
        out.extend_from_slice(elems);
    }
}

impl ByteField for galois_16::Field {
    fn pack(bytes: &[u8]) -> Vec<[u8; 2]> {
        bytes.chunks_exact(2).map(|pair| [pair[0], pair[1]]).collect()
    }

    fn unpack(elems: &[[u8; 2]], out: &mut Vec<u8>) {
        for pair in elems {
            out.extend_from_slice(pair);
        }
    }
}

fn rs_error(e: reed_solomon_erasure::Error) -> DasError {
    DasError::Codec(format!("Reed-Solomon: {:?}", e))
}

fn stripes(shard_len: usize) -> Vec<(usize, usize)> {
    (0..shard_len)
        .step_by(STRIPE_LEN)
        .map(|start| (start, (start + STRIPE_LEN).min(shard_len)))
        .collect()
}

/// Parity shards for the given data shards, computed stripe by stripe in
/// parallel. Reed-Solomon is column-wise so striping does not change the
/// result.
fn encode_parity<F: ByteField>(
    data: &[Vec<u8>],
    parity_shards: usize,
    shard_len: usize,
) -> Result<Vec<Vec<u8>>> {
    let data_shards = data.len();
    let striped: Vec<Vec<Vec<u8>>> = stripes(shard_len)
        .into_par_iter()
        .map_init(
            || ReedSolomon::<F>::new(data_shards, parity_shards),
            |rs, (start, end)| {
                let rs = rs.as_ref().map_err(|e| rs_error(e.clone()))?;
                let mut shards: Vec<Vec<F::Elem>> =
                    data.iter().map(|unit| F::pack(&unit[start..end])).collect();
                let elems = shards.first().map(Vec::len).unwrap_or(0);
                shards.extend((0..parity_shards).map(|_| vec![F::Elem::default(); elems]));
                rs.encode(&mut shards).map_err(rs_error)?;
                Ok(shards[data_shards..]
                    .iter()
                    .map(|shard| {
                        let mut out = Vec::with_capacity(end - start);
                        F::unpack(shard, &mut out);
                        out
                    })
                    .collect())
            },
        )
        .collect::<Result<_>>()?;

    Ok(stitch(striped, parity_shards, shard_len))
}

/// Data shards recovered from any `data_shards` present slots.
fn reconstruct_units<F: ByteField>(
    slots: Vec<Option<Vec<u8>>>,
    data_shards: usize,
    shard_len: usize,
) -> Result<Vec<Vec<u8>>> {
    let parity_shards = slots.len() - data_shards;
    let striped: Vec<Vec<Vec<u8>>> = stripes(shard_len)
        .into_par_iter()
        .map_init(
            || ReedSolomon::<F>::new(data_shards, parity_shards),
            |rs, (start, end)| {
                let rs = rs.as_ref().map_err(|e| rs_error(e.clone()))?;
                let mut stripe: Vec<Option<Vec<F::Elem>>> = slots
                    .iter()
                    .map(|slot| slot.as_ref().map(|data| F::pack(&data[start..end])))
                    .collect();
                rs.reconstruct_data(&mut stripe).map_err(rs_error)?;
                stripe
                    .into_iter()
                    .take(data_shards)
                    .map(|shard| {
                        let shard = shard.ok_or_else(|| {
                            DasError::Codec("data shard missing after reconstruction".into())
                        })?;
                        let mut out = Vec::with_capacity(end - start);
                        F::unpack(&shard, &mut out);
                        Ok(out)
                    })
                    .collect()
            },
        )
        .collect::<Result<_>>()?;

    Ok(stitch(striped, data_shards, shard_len))
}

fn stitch(striped: Vec<Vec<Vec<u8>>>, shards: usize, shard_len: usize) -> Vec<Vec<u8>> {
    let mut out: Vec<Vec<u8>> = (0..shards).map(|_| Vec::with_capacity(shard_len)).collect();
    for stripe in striped {
        for (shard, piece) in out.iter_mut().zip(stripe) {
            shard.extend_from_slice(&piece);
        }
    }
    out
}
