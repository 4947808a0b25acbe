#![no_main]

use libfuzzer_sys::fuzz_target;
use pulsedb_core::buffer::{PulseBuffer, normalize};
use pulsedb_core::event::{Event, Timestamp};

fn event_for(tag: u8, micros: u64) -> Event {
    let at = Timestamp::from_micros(micros.saturating_add(1_000_000));
    match tag % 3 {
        0 => Event::off(at),
        1 => Event::on(at),
        _ => Event::reset(),
    }
}

fuzz_target!(|data: &[u8]| {
    let events: Vec<Event> = data
        .chunks(3)
        .map(|chunk| {
            let tag = chunk[0];
            let micros = chunk.iter().skip(1).fold(0u64, |acc, b| acc << 8 | u64::from(*b));
            event_for(tag, micros)
        })
        .collect();

    // Restore never yields an implausible buffer, and normalizing is stable.
    for window in events.windows(4) {
        let restored = PulseBuffer::restore(window);
        assert!(restored.is_plausible(), "restore({window:?}) = {restored}");
        let once = normalize(window);
        assert_eq!(normalize(&once), once);
    }

    // Admission with the daemon's retirement order keeps the buffer plausible.
    let mut buffer = PulseBuffer::new();
    for event in events {
        buffer.take_reset();
        if let Some(start) = buffer.pulse_at(2) {
            buffer.collapse_to(start, buffer.open_state());
        }
        if buffer.admit(event).is_err() {
            panic!("admission rejected {event} into {buffer}");
        }
        assert!(buffer.is_plausible(), "after {event}: {buffer}");
    }
});
