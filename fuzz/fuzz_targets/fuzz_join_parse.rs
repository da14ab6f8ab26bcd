#![no_main]

use libfuzzer_sys::fuzz_target;
use tdmabus::{
    network::{find_join_response, join_requests, unique_id_checksum},
    Packet, PACKET_SIZE,
};

fuzz_target!(|data: &[u8]| {
    let mut packet = Packet::idle();
    let len = data.len().min(PACKET_SIZE);
    packet.as_bytes_mut()[..len].copy_from_slice(&data[..len]);
    for unique_id in join_requests(&packet) {
        assert_ne!(unique_id, 0);
        assert_ne!(unique_id, u64::MAX);
        let _ = unique_id_checksum(unique_id);
        let _ = find_join_response(&packet, unique_id);
    }
});
