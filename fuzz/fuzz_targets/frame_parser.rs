#![no_main]

use libfuzzer_sys::fuzz_target;

// Arbitrary bytes must never panic the parser, regardless of how the
// varint header, length, or payload boundary is malformed.
fuzz_target!(|data: &[u8]| {
    let _ = mplex::frame::decode(data);
});
