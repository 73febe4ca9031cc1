#![no_main]

use hearth::parser::h1::chunked::ChunkedDecoder;
use hearth::parser::h1::request::H1Request;
use hearth::parser::{Status, StrictLevel};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let mut request = H1Request::new();
    if let Ok(Status::Complete(head)) = request.parse(data) {
        let mut decoder = ChunkedDecoder::new();
        let mut pos = head;
        while let Ok(Status::Complete((_, consumed))) =
            decoder.decode(&data[pos..], StrictLevel::MIN)
        {
            if consumed == 0 || decoder.is_done() {
                break;
            }
            pos += consumed;
        }
    }
});
