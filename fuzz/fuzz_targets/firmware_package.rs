#![no_main]

use amlvdec::firmware::FirmwareBlob;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Ok(blob) = FirmwareBlob::new(data.to_vec()) {
        for info in blob.images() {
            let _ = blob.code(info);
            let _ = blob.find(&info.name);
        }
    }
});
