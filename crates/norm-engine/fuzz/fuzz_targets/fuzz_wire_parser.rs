#![no_main]

use libfuzzer_sys::fuzz_target;
use norm_engine::wire::NormMsg;

/// Fuzz the decode-then-re-encode round-trip: whenever arbitrary bytes
/// happen to decode successfully, re-encoding that message and decoding it
/// again must reproduce the same value. Never panics; decode failures are
/// silently skipped.
fuzz_target!(|data: &[u8]| {
    if let Ok(msg) = NormMsg::decode(data) {
        let encoded = msg.encode();
        let re_decoded = NormMsg::decode(&encoded).expect("re-encoded message must decode");
        assert_eq!(re_decoded, msg, "decode(encode(msg)) must equal msg");
    }
});
