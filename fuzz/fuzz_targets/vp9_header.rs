#![no_main]

use amlvdec::codec::vp9::FrameInfo;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let _ = FrameInfo::peek(data);
});
