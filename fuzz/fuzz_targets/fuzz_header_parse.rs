#![no_main]

use libfuzzer_sys::fuzz_target;
use tdmabus::{Header, Packet, Role, PACKET_SIZE};

fuzz_target!(|data: &[u8]| {
    let mut packet = Packet::idle();
    let len = data.len().min(PACKET_SIZE);
    packet.as_bytes_mut()[..len].copy_from_slice(&data[..len]);
    for role in [Role::Master, Role::Node] {
        if let Ok(header) = Header::parse(&packet, role) {
            let mut copy = packet.clone();
            header.write(&mut copy);
            assert_eq!(Header::parse(&copy, role).ok(), Some(header));
        }
    }
});
