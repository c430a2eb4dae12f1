#![no_main]

use filewire::{Frame, Message};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    // Single-frame parse, then body decode; neither may panic
    if let Ok(frame) = Frame::from_bytes(data) {
        if let Ok(message) = Message::from_frame(&frame) {
            let _ = Message::from_frame(&message.to_frame());
        }
    }
});
