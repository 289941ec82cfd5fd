#![no_main]

use libfuzzer_sys::fuzz_target;
use setlink::card;
use setlink::protocol::WireMessage;
use setlink::replicator::Replicator;

fuzz_target!(|data: &[u8]| {
    let Ok(text) = std::str::from_utf8(data) else {
        return;
    };
    let Ok(message) = WireMessage::from_json(text) else {
        return;
    };

    // Whatever a peer sends, applying it must never panic.
    if let WireMessage::State { reason, state } = message {
        let _ = card::decode_board(&state.board);
        let mut client = Replicator::client("fuzz");
        let _ = client.apply_snapshot(reason, state, 0);
        let _ = client.finish_transition(0);
        let _ = client.view(u64::MAX);
    }
});
