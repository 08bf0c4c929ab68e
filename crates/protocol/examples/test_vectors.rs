//! Generate test vectors for interop testing against other device clients.
//!
//! Run with: cargo run --package protocol --example test_vectors

use protocol::crypto::{aes_ecb_encrypt, validation_response, SessionKey};
use protocol::framing::encode_frame;
use protocol::path::derive_path_suffix;
use serde_json::json;

fn main() {
    let key = SessionKey::from_hex("00112233445566778899aabbccddeeff").expect("valid key");

    // AES-256-ECB with byte padding, across block boundaries
    for plaintext in ["", "fifteen bytes!!", "sixteen bytes!!!", "seventeen bytes!!"] {
        println!("=== aes_ecb ({} bytes) ===", plaintext.len());
        println!("key:        {}", key.as_str());
        println!("plaintext:  {:?}", plaintext);
        println!("ciphertext: {}", aes_ecb_encrypt(plaintext.as_bytes(), &key));
        println!();
    }

    println!("=== path suffix ===");
    for payload in ["xAxBxCxDxE", "1J2x3C4D5A", "pHqAzIkCwG", "xxxxxxxxxx"] {
        println!("{} -> {:?}", payload, derive_path_suffix(payload));
    }
    println!();

    println!("=== validation ===");
    for challenge in ["xyz", "1700000000000"] {
        println!("{} -> {}", challenge, validation_response(challenge));
    }
    println!();

    let header = json!({
        "type": "msg",
        "topic": "rt/utlidar/voxel_map_compressed",
        "data": {"origin": [0.0, 0.0, 0.0], "resolution": 0.05}
    });
    let frame = encode_frame(&header, &[0xDE, 0xAD, 0xBE, 0xEF]).expect("header fits");
    println!("=== binary frame ===");
    println!("hex: {}", hex::encode(&frame));
    println!("header_length: {}", u16::from_le_bytes([frame[0], frame[1]]));
}
