//! # NORM wire codec
//!
//! Encode/decode for the message set described in `SPEC_FULL.md` §4.2:
//! INFO/DATA/CMD (with flavors)/NACK/ACK/REPORT, header extensions, and
//! `RepairRequest` records. Follows the grounding repository's
//! `bytes::{Buf, BufMut}` encode/decode idiom (`encode(&self) -> Bytes` /
//! `decode(buf: &[u8]) -> Result<Self>`), generalized from its custom
//! VarInt-framed packet format to NORM's fixed-width, network-byte-order
//! fields.

use bytes::{Buf, BufMut, Bytes};

use crate::error::{NormError, Result};

fn need(buf: &(impl Buf + ?Sized), n: usize, what: &str) -> Result<()> {
    if buf.remaining() < n {
        Err(NormError::Codec(format!("truncated while reading {what}")))
    } else {
        Ok(())
    }
}

// ─── Quantization ───────────────────────────────────────────────────────────

/// Generic log-scale quantizer: value = (2^mant_bits + mantissa) * unit * 2^exponent.
/// Values within this family are strictly increasing in `(exponent, mantissa)`
/// order, which is what makes `quantize(unquantize(q)) == q` hold exactly.
fn quantize_log(value: f64, unit: f64, exp_bits: u32, mant_bits: u32) -> u32 {
    let value = value.max(unit);
    let mant_levels = 1u32 << mant_bits;
    let max_exp = (1u32 << exp_bits) - 1;
    for e in 0..=max_exp {
        let scale = unit * (1u64 << e) as f64;
        for m in 0..mant_levels {
            let val = (mant_levels + m) as f64 * scale;
            if val >= value {
                return (e << mant_bits) | m;
            }
        }
    }
    (max_exp << mant_bits) | (mant_levels - 1)
}

fn unquantize_log(q: u32, unit: f64, exp_bits: u32, mant_bits: u32) -> f64 {
    let mant_levels = 1u32 << mant_bits;
    let mask = mant_levels - 1;
    let e = (q >> mant_bits) & ((1u32 << exp_bits) - 1);
    let m = q & mask;
    let scale = unit * (1u64 << e) as f64;
    (mant_levels + m) as f64 * scale
}

const RTT_UNIT_SECS: f64 = 1.0e-6;
const RATE_UNIT_BPS: f64 = 1.0;

/// Quantize a round-trip time (seconds) into NORM's 8-bit GRTT field.
/// Rounds up: `unquantize_rtt(quantize_rtt(x)) >= x`.
pub fn quantize_rtt(rtt_secs: f64) -> u8 {
    quantize_log(rtt_secs, RTT_UNIT_SECS, 5, 3) as u8
}

pub fn unquantize_rtt(q: u8) -> f64 {
    unquantize_log(q as u32, RTT_UNIT_SECS, 5, 3)
}

/// Quantize a rate (bits/sec) into NORM's 16-bit CC_RATE field.
pub fn quantize_rate(rate_bps: f64) -> u16 {
    quantize_log(rate_bps, RATE_UNIT_BPS, 5, 11) as u16
}

pub fn unquantize_rate(q: u16) -> f64 {
    unquantize_log(q as u32, RATE_UNIT_BPS, 5, 11)
}

/// Linear fixed-point loss-fraction quantizers (32-bit and 16-bit forms);
/// unlike RTT/rate these carry no round-trip-monotonicity requirement.
pub fn quantize_loss32(p: f64) -> u32 {
    (p.clamp(0.0, 1.0) * u32::MAX as f64).round() as u32
}

pub fn unquantize_loss32(q: u32) -> f64 {
    q as f64 / u32::MAX as f64
}

pub fn quantize_loss16(p: f64) -> u16 {
    (p.clamp(0.0, 1.0) * u16::MAX as f64).round() as u16
}

pub fn unquantize_loss16(q: u16) -> f64 {
    q as f64 / u16::MAX as f64
}

/// 8-bit log-bucket group-size estimate: `q = floor(log2(n))`.
pub fn quantize_group_size(n: u32) -> u8 {
    if n <= 1 {
        0
    } else {
        (31 - n.leading_zeros()).min(255) as u8
    }
}

pub fn unquantize_group_size(q: u8) -> u32 {
    1u32 << q.min(31)
}

// ─── Common header ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NormMsgType {
    Info = 1,
    Data = 2,
    Cmd = 3,
    Nack = 4,
    Ack = 5,
    Report = 6,
}

impl NormMsgType {
    fn from_u8(v: u8) -> Result<Self> {
        match v {
            1 => Ok(NormMsgType::Info),
            2 => Ok(NormMsgType::Data),
            3 => Ok(NormMsgType::Cmd),
            4 => Ok(NormMsgType::Nack),
            5 => Ok(NormMsgType::Ack),
            6 => Ok(NormMsgType::Report),
            other => Err(NormError::Codec(format!("unknown message type {other}"))),
        }
    }
}

pub const NORM_VERSION: u8 = 1;

/// Present on every NORM message: version/type, a diagnostic sequence
/// number and the originating node id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommonHeader {
    pub version: u8,
    pub msg_type: NormMsgType,
    pub sequence: u16,
    pub source_id: u32,
}

impl CommonHeader {
    const WIRE_LEN: usize = 8;

    fn encode(&self, buf: &mut impl BufMut) {
        buf.put_u8(((self.version & 0x0F) << 4) | (self.msg_type as u8 & 0x0F));
        buf.put_u8((Self::WIRE_LEN / 4) as u8);
        buf.put_u16(self.sequence);
        buf.put_u32(self.source_id);
    }

    fn decode(buf: &mut impl Buf) -> Result<Self> {
        need(buf, Self::WIRE_LEN, "common header")?;
        let b0 = buf.get_u8();
        let _hdr_len = buf.get_u8();
        let sequence = buf.get_u16();
        let source_id = buf.get_u32();
        Ok(CommonHeader {
            version: b0 >> 4,
            msg_type: NormMsgType::from_u8(b0 & 0x0F)?,
            sequence,
            source_id,
        })
    }
}

// ─── Header extensions ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FtiExt {
    pub fec_id: u8,
    pub segment_size: u16,
    pub object_size: u64,
    pub ndata: u16,
    pub nparity: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CcFeedback {
    pub flags: u8,
    pub cc_sequence: u32,
    pub rtt_quantized: u8,
    pub loss_quantized: u32,
    pub rate_quantized: u16,
}

pub mod cc_flags {
    pub const CLR: u8 = 0x01;
    pub const PLR: u8 = 0x02;
    pub const RTT: u8 = 0x04;
    pub const START: u8 = 0x08;
    pub const LIMIT: u8 = 0x10;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeaderExtension {
    Fti(FtiExt),
    CcRate(u16),
    CcFeedback(CcFeedback),
    AppAck(Bytes),
}

const HET_FTI: u8 = 1;
const HET_CC_RATE: u8 = 2;
const HET_CC_FEEDBACK: u8 = 3;
const HET_APP_ACK: u8 = 4;

impl HeaderExtension {
    fn encode(&self, buf: &mut impl BufMut) {
        match self {
            HeaderExtension::Fti(fti) => {
                let len = 1 + 2 + 8 + 2 + 2;
                buf.put_u8(HET_FTI);
                buf.put_u16(len as u16);
                buf.put_u8(fti.fec_id);
                buf.put_u16(fti.segment_size);
                buf.put_u64(fti.object_size);
                buf.put_u16(fti.ndata);
                buf.put_u16(fti.nparity);
            }
            HeaderExtension::CcRate(rate) => {
                buf.put_u8(HET_CC_RATE);
                buf.put_u16(2);
                buf.put_u16(*rate);
            }
            HeaderExtension::CcFeedback(fb) => {
                let len = 1 + 4 + 1 + 4 + 2;
                buf.put_u8(HET_CC_FEEDBACK);
                buf.put_u16(len as u16);
                buf.put_u8(fb.flags);
                buf.put_u32(fb.cc_sequence);
                buf.put_u8(fb.rtt_quantized);
                buf.put_u32(fb.loss_quantized);
                buf.put_u16(fb.rate_quantized);
            }
            HeaderExtension::AppAck(data) => {
                buf.put_u8(HET_APP_ACK);
                buf.put_u16(data.len() as u16);
                buf.put_slice(data);
            }
        }
    }

    fn wire_len(&self) -> usize {
        3 + match self {
            HeaderExtension::Fti(_) => 1 + 2 + 8 + 2 + 2,
            HeaderExtension::CcRate(_) => 2,
            HeaderExtension::CcFeedback(_) => 1 + 4 + 1 + 4 + 2,
            HeaderExtension::AppAck(d) => d.len(),
        }
    }
}

/// Iterator over a header-extension region. Stops with an error rather than
/// panicking if a declared length would run past the region boundary.
struct ExtensionIter<'a> {
    remaining: &'a [u8],
}

impl<'a> Iterator for ExtensionIter<'a> {
    type Item = Result<HeaderExtension>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining.is_empty() {
            return None;
        }
        if self.remaining.len() < 3 {
            self.remaining = &[];
            return Some(Err(NormError::Codec("truncated header extension".into())));
        }
        let het = self.remaining[0];
        let len = u16::from_be_bytes([self.remaining[1], self.remaining[2]]) as usize;
        let body_start = 3;
        if self.remaining.len() < body_start + len {
            self.remaining = &[];
            return Some(Err(NormError::Codec(
                "header extension length exceeds region".into(),
            )));
        }
        let body = &self.remaining[body_start..body_start + len];
        self.remaining = &self.remaining[body_start + len..];

        let parsed = match het {
            HET_FTI => {
                if body.len() < 15 {
                    return Some(Err(NormError::Codec("truncated FTI extension".into())));
                }
                Ok(HeaderExtension::Fti(FtiExt {
                    fec_id: body[0],
                    segment_size: u16::from_be_bytes([body[1], body[2]]),
                    object_size: u64::from_be_bytes(body[3..11].try_into().unwrap()),
                    ndata: u16::from_be_bytes([body[11], body[12]]),
                    nparity: u16::from_be_bytes([body[13], body[14]]),
                }))
            }
            HET_CC_RATE => {
                if body.len() < 2 {
                    return Some(Err(NormError::Codec("truncated CC_RATE extension".into())));
                }
                Ok(HeaderExtension::CcRate(u16::from_be_bytes([body[0], body[1]])))
            }
            HET_CC_FEEDBACK => {
                if body.len() < 12 {
                    return Some(Err(NormError::Codec(
                        "truncated CC_FEEDBACK extension".into(),
                    )));
                }
                Ok(HeaderExtension::CcFeedback(CcFeedback {
                    flags: body[0],
                    cc_sequence: u32::from_be_bytes(body[1..5].try_into().unwrap()),
                    rtt_quantized: body[5],
                    loss_quantized: u32::from_be_bytes(body[6..10].try_into().unwrap()),
                    rate_quantized: u16::from_be_bytes([body[10], body[11]]),
                }))
            }
            HET_APP_ACK => Ok(HeaderExtension::AppAck(Bytes::copy_from_slice(body))),
            other => Err(NormError::Codec(format!("unknown header extension type {other}"))),
        };
        Some(parsed)
    }
}

fn encode_extensions(buf: &mut impl BufMut, extensions: &[HeaderExtension]) {
    for ext in extensions {
        ext.encode(buf);
    }
}

fn extensions_len(extensions: &[HeaderExtension]) -> usize {
    extensions.iter().map(|e| e.wire_len()).sum()
}

fn decode_extensions(region: &[u8]) -> Result<Vec<HeaderExtension>> {
    ExtensionIter { remaining: region }.collect()
}

// ─── Repair requests ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepairForm {
    Items = 1,
    Ranges = 2,
    Erasures = 3,
}

impl RepairForm {
    fn from_u8(v: u8) -> Result<Self> {
        match v {
            1 => Ok(RepairForm::Items),
            2 => Ok(RepairForm::Ranges),
            3 => Ok(RepairForm::Erasures),
            other => Err(NormError::Codec(format!("unknown repair form {other}"))),
        }
    }
}

pub mod repair_flags {
    pub const SEGMENT: u8 = 0x01;
    pub const BLOCK: u8 = 0x02;
    pub const OBJECT: u8 = 0x04;
    pub const INFO: u8 = 0x08;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RepairItem {
    pub object_id: u16,
    pub block_id: u32,
    pub block_len: u16,
    pub symbol_id: u16,
}

impl RepairItem {
    const WIRE_LEN: usize = 2 + 4 + 2 + 2;

    fn encode(&self, buf: &mut impl BufMut) {
        buf.put_u16(self.object_id);
        buf.put_u32(self.block_id);
        buf.put_u16(self.block_len);
        buf.put_u16(self.symbol_id);
    }

    fn decode(buf: &mut impl Buf) -> Result<Self> {
        need(buf, Self::WIRE_LEN, "repair item")?;
        Ok(RepairItem {
            object_id: buf.get_u16(),
            block_id: buf.get_u32(),
            block_len: buf.get_u16(),
            symbol_id: buf.get_u16(),
        })
    }
}

/// One repair-request record: a form tag (`ITEMS`/`RANGES`/`ERASURES`), a
/// scope-flags byte, and the item list whose interpretation the form governs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepairRequest {
    pub form: RepairForm,
    pub flags: u8,
    pub items: Vec<RepairItem>,
}

impl RepairRequest {
    fn wire_len(&self) -> usize {
        2 + 2 + self.items.len() * RepairItem::WIRE_LEN
    }

    fn encode(&self, buf: &mut impl BufMut) {
        buf.put_u8(self.form as u8);
        buf.put_u8(self.flags);
        buf.put_u16(self.items.len() as u16);
        for item in &self.items {
            item.encode(buf);
        }
    }

    fn decode(buf: &mut impl Buf) -> Result<Self> {
        need(buf, 4, "repair request header")?;
        let form = RepairForm::from_u8(buf.get_u8())?;
        let flags = buf.get_u8();
        let count = buf.get_u16();
        let mut items = Vec::with_capacity(count as usize);
        for _ in 0..count {
            items.push(RepairItem::decode(buf)?);
        }
        Ok(RepairRequest { form, flags, items })
    }

    /// Iterate the `(object, block, symbol)` endpoints this request names,
    /// expanding `RANGES` pairs into their bounding endpoints.
    pub fn endpoints(&self) -> Vec<(u16, u32, u16)> {
        match self.form {
            RepairForm::Items | RepairForm::Erasures => self
                .items
                .iter()
                .map(|i| (i.object_id, i.block_id, i.symbol_id))
                .collect(),
            RepairForm::Ranges => self
                .items
                .chunks(2)
                .flat_map(|pair| {
                    if pair.len() == 2 {
                        vec![
                            (pair[0].object_id, pair[0].block_id, pair[0].symbol_id),
                            (pair[1].object_id, pair[1].block_id, pair[1].symbol_id),
                        ]
                    } else {
                        vec![(pair[0].object_id, pair[0].block_id, pair[0].symbol_id)]
                    }
                })
                .collect(),
        }
    }
}

fn encode_repair_requests(buf: &mut impl BufMut, reqs: &[RepairRequest]) {
    buf.put_u16(reqs.len() as u16);
    for r in reqs {
        r.encode(buf);
    }
}

fn decode_repair_requests(buf: &mut impl Buf) -> Result<Vec<RepairRequest>> {
    need(buf, 2, "repair request count")?;
    let count = buf.get_u16();
    let mut out = Vec::with_capacity(count as usize);
    for _ in 0..count {
        out.push(RepairRequest::decode(buf)?);
    }
    Ok(out)
}

// ─── DATA/INFO ──────────────────────────────────────────────────────────────

pub mod obj_flags {
    pub const STREAM: u8 = 0x01;
    pub const FILE: u8 = 0x02;
    pub const INFO_DATA: u8 = 0x04;
    pub const REPAIR: u8 = 0x08;
    pub const SYN: u8 = 0x10;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FecPayloadId {
    pub block_id: u32,
    pub symbol_id: u16,
    pub block_len: u16,
}

impl FecPayloadId {
    const WIRE_LEN: usize = 4 + 2 + 2;

    fn encode(&self, buf: &mut impl BufMut) {
        buf.put_u32(self.block_id);
        buf.put_u16(self.symbol_id);
        buf.put_u16(self.block_len);
    }

    fn decode(buf: &mut impl Buf) -> Result<Self> {
        need(buf, Self::WIRE_LEN, "fec payload id")?;
        Ok(FecPayloadId {
            block_id: buf.get_u32(),
            symbol_id: buf.get_u16(),
            block_len: buf.get_u16(),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamPayloadHeader {
    pub msg_start_offset: u16,
    pub length: u16,
    pub stream_offset: u64,
}

impl StreamPayloadHeader {
    const WIRE_LEN: usize = 2 + 2 + 8;

    fn encode(&self, buf: &mut impl BufMut) {
        buf.put_u16(self.msg_start_offset);
        buf.put_u16(self.length);
        buf.put_u64(self.stream_offset);
    }

    fn decode(buf: &mut impl Buf) -> Result<Self> {
        need(buf, Self::WIRE_LEN, "stream payload header")?;
        Ok(StreamPayloadHeader {
            msg_start_offset: buf.get_u16(),
            length: buf.get_u16(),
            stream_offset: buf.get_u64(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectHeaderFields {
    pub instance_id: u16,
    pub grtt_quantized: u8,
    pub backoff_factor: u8,
    pub group_size_quantized: u8,
    pub object_id: u16,
    pub flags: u8,
}

impl ObjectHeaderFields {
    const WIRE_LEN: usize = 2 + 1 + 1 + 1 + 2 + 1;

    fn encode(&self, buf: &mut impl BufMut) {
        buf.put_u16(self.instance_id);
        buf.put_u8(self.grtt_quantized);
        buf.put_u8(self.backoff_factor);
        buf.put_u8(self.group_size_quantized);
        buf.put_u16(self.object_id);
        buf.put_u8(self.flags);
    }

    fn decode(buf: &mut impl Buf) -> Result<Self> {
        need(buf, Self::WIRE_LEN, "object header fields")?;
        Ok(ObjectHeaderFields {
            instance_id: buf.get_u16(),
            grtt_quantized: buf.get_u8(),
            backoff_factor: buf.get_u8(),
            group_size_quantized: buf.get_u8(),
            object_id: buf.get_u16(),
            flags: buf.get_u8(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InfoMsg {
    pub header: CommonHeader,
    pub fields: ObjectHeaderFields,
    pub fti: Option<FtiExt>,
    pub info_payload: Bytes,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataMsg {
    pub header: CommonHeader,
    pub fields: ObjectHeaderFields,
    pub fec_payload_id: FecPayloadId,
    pub fti: Option<FtiExt>,
    pub stream_header: Option<StreamPayloadHeader>,
    pub payload: Bytes,
}

// ─── CMD ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CcNode {
    pub node_id: u32,
    pub flags: u8,
    pub rtt_quantized: u8,
    pub rate_quantized: u16,
}

impl CcNode {
    const WIRE_LEN: usize = 4 + 1 + 1 + 2;

    fn encode(&self, buf: &mut impl BufMut) {
        buf.put_u32(self.node_id);
        buf.put_u8(self.flags);
        buf.put_u8(self.rtt_quantized);
        buf.put_u16(self.rate_quantized);
    }

    fn decode(buf: &mut impl Buf) -> Result<Self> {
        need(buf, Self::WIRE_LEN, "cc node")?;
        Ok(CcNode {
            node_id: buf.get_u32(),
            flags: buf.get_u8(),
            rtt_quantized: buf.get_u8(),
            rate_quantized: buf.get_u16(),
        })
    }
}

/// `CMD` payload, tagged by flavor per `SPEC_FULL.md` §4.2.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CmdFlavor {
    Flush {
        object_id: u16,
        block_id: u32,
        symbol_id: u16,
        ackers: Vec<u32>,
    },
    Eot,
    Squelch {
        object_id: u16,
        block_id: u32,
        symbol_id: u16,
        invalid_objects: Vec<u16>,
    },
    Cc {
        cc_sequence: u32,
        send_time_us: u64,
        nodes: Vec<CcNode>,
    },
    RepairAdv {
        repair_requests: Vec<RepairRequest>,
    },
    AckReq {
        object_id: u16,
    },
    Application {
        payload: Bytes,
    },
}

const CMD_FLUSH: u8 = 1;
const CMD_EOT: u8 = 2;
const CMD_SQUELCH: u8 = 3;
const CMD_CC: u8 = 4;
const CMD_REPAIR_ADV: u8 = 5;
const CMD_ACK_REQ: u8 = 6;
const CMD_APPLICATION: u8 = 7;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CmdMsg {
    pub header: CommonHeader,
    pub instance_id: u16,
    pub grtt_quantized: u8,
    pub backoff_factor: u8,
    pub group_size_quantized: u8,
    pub flavor: CmdFlavor,
}

impl CmdMsg {
    pub fn encode(&self) -> Bytes {
        let mut buf = Vec::new();
        self.header.encode(&mut buf);
        buf.put_u16(self.instance_id);
        buf.put_u8(self.grtt_quantized);
        buf.put_u8(self.backoff_factor);
        buf.put_u8(self.group_size_quantized);
        match &self.flavor {
            CmdFlavor::Flush {
                object_id,
                block_id,
                symbol_id,
                ackers,
            } => {
                buf.put_u8(CMD_FLUSH);
                buf.put_u16(*object_id);
                buf.put_u32(*block_id);
                buf.put_u16(*symbol_id);
                buf.put_u16(ackers.len() as u16);
                for a in ackers {
                    buf.put_u32(*a);
                }
            }
            CmdFlavor::Eot => buf.put_u8(CMD_EOT),
            CmdFlavor::Squelch {
                object_id,
                block_id,
                symbol_id,
                invalid_objects,
            } => {
                buf.put_u8(CMD_SQUELCH);
                buf.put_u16(*object_id);
                buf.put_u32(*block_id);
                buf.put_u16(*symbol_id);
                buf.put_u16(invalid_objects.len() as u16);
                for o in invalid_objects {
                    buf.put_u16(*o);
                }
            }
            CmdFlavor::Cc {
                cc_sequence,
                send_time_us,
                nodes,
            } => {
                buf.put_u8(CMD_CC);
                buf.put_u32(*cc_sequence);
                buf.put_u64(*send_time_us);
                buf.put_u16(nodes.len() as u16);
                for n in nodes {
                    n.encode(&mut buf);
                }
            }
            CmdFlavor::RepairAdv { repair_requests } => {
                buf.put_u8(CMD_REPAIR_ADV);
                encode_repair_requests(&mut buf, repair_requests);
            }
            CmdFlavor::AckReq { object_id } => {
                buf.put_u8(CMD_ACK_REQ);
                buf.put_u16(*object_id);
            }
            CmdFlavor::Application { payload } => {
                buf.put_u8(CMD_APPLICATION);
                buf.put_u16(payload.len() as u16);
                buf.put_slice(payload);
            }
        }
        Bytes::from(buf)
    }

    pub fn decode(mut buf: &[u8]) -> Result<Self> {
        let header = CommonHeader::decode(&mut buf)?;
        need(&buf, 5, "cmd fields")?;
        let instance_id = buf.get_u16();
        let grtt_quantized = buf.get_u8();
        let backoff_factor = buf.get_u8();
        let group_size_quantized = buf.get_u8();
        need(&buf, 1, "cmd flavor tag")?;
        let tag = buf.get_u8();
        let flavor = match tag {
            CMD_FLUSH => {
                need(&buf, 8, "flush fields")?;
                let object_id = buf.get_u16();
                let block_id = buf.get_u32();
                let symbol_id = buf.get_u16();
                need(&buf, 2, "acker count")?;
                let n = buf.get_u16();
                let mut ackers = Vec::with_capacity(n as usize);
                for _ in 0..n {
                    need(&buf, 4, "acker id")?;
                    ackers.push(buf.get_u32());
                }
                CmdFlavor::Flush {
                    object_id,
                    block_id,
                    symbol_id,
                    ackers,
                }
            }
            CMD_EOT => CmdFlavor::Eot,
            CMD_SQUELCH => {
                need(&buf, 8, "squelch fields")?;
                let object_id = buf.get_u16();
                let block_id = buf.get_u32();
                let symbol_id = buf.get_u16();
                need(&buf, 2, "invalid object count")?;
                let n = buf.get_u16();
                let mut invalid_objects = Vec::with_capacity(n as usize);
                for _ in 0..n {
                    need(&buf, 2, "invalid object id")?;
                    invalid_objects.push(buf.get_u16());
                }
                CmdFlavor::Squelch {
                    object_id,
                    block_id,
                    symbol_id,
                    invalid_objects,
                }
            }
            CMD_CC => {
                need(&buf, 12, "cc fields")?;
                let cc_sequence = buf.get_u32();
                let send_time_us = buf.get_u64();
                need(&buf, 2, "cc node count")?;
                let n = buf.get_u16();
                let mut nodes = Vec::with_capacity(n as usize);
                for _ in 0..n {
                    nodes.push(CcNode::decode(&mut buf)?);
                }
                CmdFlavor::Cc {
                    cc_sequence,
                    send_time_us,
                    nodes,
                }
            }
            CMD_REPAIR_ADV => CmdFlavor::RepairAdv {
                repair_requests: decode_repair_requests(&mut buf)?,
            },
            CMD_ACK_REQ => {
                need(&buf, 2, "ack_req object id")?;
                CmdFlavor::AckReq {
                    object_id: buf.get_u16(),
                }
            }
            CMD_APPLICATION => {
                need(&buf, 2, "application payload length")?;
                let n = buf.get_u16() as usize;
                need(&buf, n, "application payload")?;
                let payload = Bytes::copy_from_slice(&buf[..n]);
                buf.advance(n);
                CmdFlavor::Application { payload }
            }
            other => return Err(NormError::Codec(format!("unknown cmd flavor {other}"))),
        };
        Ok(CmdMsg {
            header,
            instance_id,
            grtt_quantized,
            backoff_factor,
            group_size_quantized,
            flavor,
        })
    }
}

// ─── NACK / ACK ─────────────────────────────────────────────────────────────

/// NACK: sender id the loss report targets, an optional piggy-backed GRTT
/// response, optional CC feedback, and the repair requests themselves.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NackMsg {
    pub header: CommonHeader,
    pub instance_id: u16,
    pub sender_id: u32,
    pub grtt_response_us: Option<u64>,
    pub cc_feedback: Option<CcFeedback>,
    pub repair_requests: Vec<RepairRequest>,
}

impl NackMsg {
    pub fn encode(&self) -> Bytes {
        let mut buf = Vec::new();
        self.header.encode(&mut buf);
        buf.put_u16(self.instance_id);
        buf.put_u32(self.sender_id);
        buf.put_u8(self.grtt_response_us.is_some() as u8);
        if let Some(t) = self.grtt_response_us {
            buf.put_u64(t);
        }
        let mut extensions = Vec::new();
        if let Some(fb) = &self.cc_feedback {
            extensions.push(HeaderExtension::CcFeedback(*fb));
        }
        buf.put_u16(extensions_len(&extensions) as u16);
        encode_extensions(&mut buf, &extensions);
        encode_repair_requests(&mut buf, &self.repair_requests);
        Bytes::from(buf)
    }

    pub fn decode(mut buf: &[u8]) -> Result<Self> {
        let header = CommonHeader::decode(&mut buf)?;
        need(&buf, 7, "nack fixed fields")?;
        let instance_id = buf.get_u16();
        let sender_id = buf.get_u32();
        let has_grtt = buf.get_u8() != 0;
        let grtt_response_us = if has_grtt {
            need(&buf, 8, "grtt response")?;
            Some(buf.get_u64())
        } else {
            None
        };
        need(&buf, 2, "extension region length")?;
        let ext_len = buf.get_u16() as usize;
        need(&buf, ext_len, "extension region")?;
        let extensions = decode_extensions(&buf[..ext_len])?;
        buf.advance(ext_len);
        let cc_feedback = extensions.into_iter().find_map(|e| match e {
            HeaderExtension::CcFeedback(fb) => Some(fb),
            _ => None,
        });
        let repair_requests = decode_repair_requests(&mut buf)?;
        Ok(NackMsg {
            header,
            instance_id,
            sender_id,
            grtt_response_us,
            cc_feedback,
            repair_requests,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckType {
    Flush = 1,
    Cc = 2,
}

/// Positive acknowledgment: a watermark (object/block/symbol) position plus
/// its flavor (watermark-FLUSH completion vs. CC round-trip feedback).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AckMsg {
    pub header: CommonHeader,
    pub instance_id: u16,
    pub sender_id: u32,
    pub ack_type: AckType,
    pub object_id: u16,
    pub block_id: u32,
    pub symbol_id: u16,
    pub grtt_response_us: Option<u64>,
    pub cc_feedback: Option<CcFeedback>,
}

impl AckMsg {
    pub fn encode(&self) -> Bytes {
        let mut buf = Vec::new();
        self.header.encode(&mut buf);
        buf.put_u16(self.instance_id);
        buf.put_u32(self.sender_id);
        buf.put_u8(self.ack_type as u8);
        buf.put_u16(self.object_id);
        buf.put_u32(self.block_id);
        buf.put_u16(self.symbol_id);
        buf.put_u8(self.grtt_response_us.is_some() as u8);
        if let Some(t) = self.grtt_response_us {
            buf.put_u64(t);
        }
        let mut extensions = Vec::new();
        if let Some(fb) = &self.cc_feedback {
            extensions.push(HeaderExtension::CcFeedback(*fb));
        }
        buf.put_u16(extensions_len(&extensions) as u16);
        encode_extensions(&mut buf, &extensions);
        Bytes::from(buf)
    }

    pub fn decode(mut buf: &[u8]) -> Result<Self> {
        let header = CommonHeader::decode(&mut buf)?;
        need(&buf, 15, "ack fixed fields")?;
        let instance_id = buf.get_u16();
        let sender_id = buf.get_u32();
        let ack_type = match buf.get_u8() {
            1 => AckType::Flush,
            2 => AckType::Cc,
            other => return Err(NormError::Codec(format!("unknown ack type {other}"))),
        };
        let object_id = buf.get_u16();
        let block_id = buf.get_u32();
        let symbol_id = buf.get_u16();
        let has_grtt = buf.get_u8() != 0;
        let grtt_response_us = if has_grtt {
            need(&buf, 8, "grtt response")?;
            Some(buf.get_u64())
        } else {
            None
        };
        need(&buf, 2, "extension region length")?;
        let ext_len = buf.get_u16() as usize;
        need(&buf, ext_len, "extension region")?;
        let extensions = decode_extensions(&buf[..ext_len])?;
        buf.advance(ext_len);
        let cc_feedback = extensions.into_iter().find_map(|e| match e {
            HeaderExtension::CcFeedback(fb) => Some(fb),
            _ => None,
        });
        Ok(AckMsg {
            header,
            instance_id,
            sender_id,
            ack_type,
            object_id,
            block_id,
            symbol_id,
            grtt_response_us,
            cc_feedback,
        })
    }
}

// ─── REPORT ─────────────────────────────────────────────────────────────────

/// Periodic sender activity summary (diagnostic, not required for reliability).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReportMsg {
    pub header: CommonHeader,
    pub instance_id: u16,
    pub objects_active: u16,
    pub bytes_sent: u64,
}

impl ReportMsg {
    pub fn encode(&self) -> Bytes {
        let mut buf = Vec::new();
        self.header.encode(&mut buf);
        buf.put_u16(self.instance_id);
        buf.put_u16(self.objects_active);
        buf.put_u64(self.bytes_sent);
        Bytes::from(buf)
    }

    pub fn decode(mut buf: &[u8]) -> Result<Self> {
        let header = CommonHeader::decode(&mut buf)?;
        need(&buf, 12, "report fields")?;
        Ok(ReportMsg {
            header,
            instance_id: buf.get_u16(),
            objects_active: buf.get_u16(),
            bytes_sent: buf.get_u64(),
        })
    }
}

// ─── INFO / DATA encode/decode ──────────────────────────────────────────────

impl InfoMsg {
    pub fn encode(&self) -> Bytes {
        let mut buf = Vec::new();
        self.header.encode(&mut buf);
        self.fields.encode(&mut buf);
        let mut extensions = Vec::new();
        if let Some(fti) = self.fti {
            extensions.push(HeaderExtension::Fti(fti));
        }
        buf.put_u16(extensions_len(&extensions) as u16);
        encode_extensions(&mut buf, &extensions);
        buf.put_u16(self.info_payload.len() as u16);
        buf.put_slice(&self.info_payload);
        Bytes::from(buf)
    }

    pub fn decode(mut buf: &[u8]) -> Result<Self> {
        let header = CommonHeader::decode(&mut buf)?;
        let fields = ObjectHeaderFields::decode(&mut buf)?;
        need(&buf, 2, "extension region length")?;
        let ext_len = buf.get_u16() as usize;
        need(&buf, ext_len, "extension region")?;
        let extensions = decode_extensions(&buf[..ext_len])?;
        buf.advance(ext_len);
        let fti = extensions.into_iter().find_map(|e| match e {
            HeaderExtension::Fti(f) => Some(f),
            _ => None,
        });
        need(&buf, 2, "info payload length")?;
        let n = buf.get_u16() as usize;
        need(&buf, n, "info payload")?;
        let info_payload = Bytes::copy_from_slice(&buf[..n]);
        buf.advance(n);
        Ok(InfoMsg {
            header,
            fields,
            fti,
            info_payload,
        })
    }
}

impl DataMsg {
    pub fn encode(&self) -> Bytes {
        let mut buf = Vec::new();
        self.header.encode(&mut buf);
        self.fields.encode(&mut buf);
        self.fec_payload_id.encode(&mut buf);
        let mut extensions = Vec::new();
        if let Some(fti) = self.fti {
            extensions.push(HeaderExtension::Fti(fti));
        }
        buf.put_u16(extensions_len(&extensions) as u16);
        encode_extensions(&mut buf, &extensions);
        buf.put_u8(self.stream_header.is_some() as u8);
        if let Some(sh) = &self.stream_header {
            sh.encode(&mut buf);
        }
        buf.put_u16(self.payload.len() as u16);
        buf.put_slice(&self.payload);
        Bytes::from(buf)
    }

    pub fn decode(mut buf: &[u8]) -> Result<Self> {
        let header = CommonHeader::decode(&mut buf)?;
        let fields = ObjectHeaderFields::decode(&mut buf)?;
        let fec_payload_id = FecPayloadId::decode(&mut buf)?;
        need(&buf, 2, "extension region length")?;
        let ext_len = buf.get_u16() as usize;
        need(&buf, ext_len, "extension region")?;
        let extensions = decode_extensions(&buf[..ext_len])?;
        buf.advance(ext_len);
        let fti = extensions.into_iter().find_map(|e| match e {
            HeaderExtension::Fti(f) => Some(f),
            _ => None,
        });
        need(&buf, 1, "stream header flag")?;
        let has_stream = buf.get_u8() != 0;
        let stream_header = if has_stream {
            Some(StreamPayloadHeader::decode(&mut buf)?)
        } else {
            None
        };
        need(&buf, 2, "data payload length")?;
        let n = buf.get_u16() as usize;
        need(&buf, n, "data payload")?;
        let payload = Bytes::copy_from_slice(&buf[..n]);
        buf.advance(n);
        Ok(DataMsg {
            header,
            fields,
            fec_payload_id,
            fti,
            stream_header,
            payload,
        })
    }
}

// ─── Top-level message ──────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NormMsg {
    Info(InfoMsg),
    Data(DataMsg),
    Cmd(CmdMsg),
    Nack(NackMsg),
    Ack(AckMsg),
    Report(ReportMsg),
}

impl NormMsg {
    pub fn encode(&self) -> Bytes {
        match self {
            NormMsg::Info(m) => m.encode(),
            NormMsg::Data(m) => m.encode(),
            NormMsg::Cmd(m) => m.encode(),
            NormMsg::Nack(m) => m.encode(),
            NormMsg::Ack(m) => m.encode(),
            NormMsg::Report(m) => m.encode(),
        }
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < 2 {
            return Err(NormError::Codec("truncated message".into()));
        }
        let msg_type = NormMsgType::from_u8(buf[0] & 0x0F)?;
        Ok(match msg_type {
            NormMsgType::Info => NormMsg::Info(InfoMsg::decode(buf)?),
            NormMsgType::Data => NormMsg::Data(DataMsg::decode(buf)?),
            NormMsgType::Cmd => NormMsg::Cmd(CmdMsg::decode(buf)?),
            NormMsgType::Nack => NormMsg::Nack(NackMsg::decode(buf)?),
            NormMsgType::Ack => NormMsg::Ack(AckMsg::decode(buf)?),
            NormMsgType::Report => NormMsg::Report(ReportMsg::decode(buf)?),
        })
    }
}
