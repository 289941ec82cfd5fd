#![no_main]

use libfuzzer_sys::fuzz_target;
use setlink::protocol::{LobbyInfo, Signal};

fuzz_target!(|data: &[u8]| {
    let Ok(body) = std::str::from_utf8(data) else {
        return;
    };

    // Exercise the envelope checks shared by every relay response.
    let _ = setlink::relay::parse_response::<serde_json::Value>(body);

    // Then the signal log itself, record by record.
    if let Ok(info) = serde_json::from_str::<LobbyInfo>(body) {
        let _ = info.player_names();
        for record in &info.signals {
            let _ = Signal::from_record(record);
        }
    }
});
