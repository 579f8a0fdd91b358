#![no_main]

use libfuzzer_sys::fuzz_target;
use mailwire::stream::ReadBuffer;

// The first byte picks a read size; the rest is fed in pieces of that size.
// Lines must come out identical to splitting the whole input at once.
fuzz_target!(|data: &[u8]| {
    let Some((&step, data)) = data.split_first() else {
        return;
    };
    let step = usize::from(step).max(1);

    let mut expected: Vec<&[u8]> = data.split(|&b| b == b'\n').collect();
    // bytes after the last terminator never form a line
    expected.pop();
    let expected: Vec<&[u8]> = expected
        .into_iter()
        .map(|line| line.strip_suffix(b"\r").unwrap_or(line))
        .collect();

    let mut buf = ReadBuffer::with_capacity(1024);
    let mut got: Vec<Vec<u8>> = Vec::new();
    for piece in data.chunks(step) {
        if buf.extend_from_slice(piece).is_err() {
            // a line longer than the buffer; nothing more to compare
            return;
        }
        while let Some(line) = buf.read_line() {
            got.push(line.to_vec());
        }
        assert!(buf.scanoff() <= buf.len());
        assert!(buf.offset() + buf.len() <= buf.capacity());
    }

    assert_eq!(got.len(), expected.len());
    for (g, e) in got.iter().zip(expected) {
        assert_eq!(g.as_slice(), e);
    }
});
