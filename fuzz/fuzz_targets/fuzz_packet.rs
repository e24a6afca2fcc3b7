#![no_main]

use libfuzzer_sys::fuzz_target;
use trustbus::Packet;

fuzz_target!(|data: &[u8]| {
    // Decoding arbitrary bytes must never panic.
    if let Ok(packet) = Packet::from_bytes(data) {
        let frame = packet.to_bytes().expect("decoded packet encodes");
        assert_eq!(Packet::from_bytes(&frame).ok(), Some(packet));
    }
});
