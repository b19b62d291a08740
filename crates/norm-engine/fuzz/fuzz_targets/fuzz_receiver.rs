#![no_main]

use libfuzzer_sys::fuzz_target;
use norm_engine::config::SessionConfig;
use norm_engine::receiver::RemoteSenderNode;
use norm_engine::wire::NormMsg;

/// Fuzz the receiver-side dispatch path with arbitrary wire bytes, the way
/// a remote sender's packets would arrive off the wire (`SPEC_FULL.md`
/// §4.6). Exercises INFO/DATA admission, FEC reassembly, and CMD handling.
/// Must never panic, even on garbage or adversarially malformed input.
fuzz_target!(|data: &[u8]| {
    let config = SessionConfig::default();
    let mut rx = RemoteSenderNode::new(1, 0, &config);

    if let Ok(msg) = NormMsg::decode(data) {
        match msg {
            NormMsg::Info(m) => {
                let _ = rx.on_info(m);
            }
            NormMsg::Data(m) => {
                let _ = rx.on_data(m);
            }
            NormMsg::Cmd(m) => {
                rx.on_cmd(&m, 1);
            }
            _ => {}
        }
    }
    rx.drain_events().for_each(drop);
});
