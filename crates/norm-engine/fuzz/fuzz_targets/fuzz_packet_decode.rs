#![no_main]

use libfuzzer_sys::fuzz_target;
use norm_engine::wire::NormMsg;

/// Fuzz the top-level message decoder across every message type tag.
///
/// `NormMsg::decode` dispatches on the low nibble of byte 0 to one of
/// INFO/DATA/CMD/NACK/ACK/REPORT. None of these decode paths must ever
/// panic on arbitrary input; malformed data should return `Err`.
fuzz_target!(|data: &[u8]| {
    let _ = NormMsg::decode(data);
});
