#![no_main]

use pulsedb_core::event::{Event, RECORD_SIZE};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Ok(event) = Event::decode(data) else {
        return;
    };
    assert_eq!(data.len(), RECORD_SIZE);

    // Padding and, for resets, the timestamp and kind byte are not
    // preserved; the decoded value is.
    let encoded = event.encode();
    assert_eq!(Event::decode(&encoded), Ok(event));
    assert_eq!(event.is_reset(), data[..8] == [0; 8] || data[12] == 2);
});
