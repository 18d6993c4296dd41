#![no_main]
use heapwrap_core::{DerivedOps, SystemPrimitive};
use libfuzzer_sys::fuzz_target;

const SLOTS: usize = 16;

fuzz_target!(|data: &[u8]| {
    // Each 4-byte chunk: op, slot, little-endian size.
    let ops = DerivedOps::new(SystemPrimitive::new());
    let mut live: [(*mut u8, usize, u8); SLOTS] = [(std::ptr::null_mut(), 0, 0); SLOTS];

    for (step, chunk) in data.chunks_exact(4).enumerate() {
        let slot = usize::from(chunk[1]) % SLOTS;
        let size = usize::from(u16::from_le_bytes([chunk[2], chunk[3]]));
        let tag = step as u8;
        let (ptr, len, old_tag) = live[slot];

        match chunk[0] % 6 {
            0 | 1 if ptr.is_null() => {
                let result = if chunk[0] % 6 == 0 {
                    ops.malloc(size)
                } else {
                    ops.calloc(size % 64, size / 64)
                };
                if let Ok(p) = result {
                    let len = if chunk[0] % 6 == 0 { size } else { (size % 64) * (size / 64) };
                    unsafe { p.as_ptr().write_bytes(tag, len) };
                    live[slot] = (p.as_ptr(), len, tag);
                }
            }
            2 if ptr.is_null() => {
                let alignment = 1usize << (chunk[1] % 17);
                if let Ok(p) = ops.memalign(alignment, size) {
                    assert_eq!(p.as_ptr().addr() % alignment, 0);
                    unsafe { p.as_ptr().write_bytes(tag, size) };
                    live[slot] = (p.as_ptr(), size, tag);
                }
            }
            3 | 4 if !ptr.is_null() => {
                let r = unsafe { ops.realloc(ptr, size) }.expect("reference primitive has memory");
                let q = r.as_ptr();
                let kept = unsafe { std::slice::from_raw_parts(q, len.min(size)) };
                assert!(kept.iter().all(|&b| b == old_tag));
                if size == 0 {
                    unsafe { ops.free(q) };
                    live[slot] = (std::ptr::null_mut(), 0, 0);
                } else {
                    unsafe { q.write_bytes(tag, size) };
                    live[slot] = (q, size, tag);
                }
            }
            _ if !ptr.is_null() => {
                assert!(unsafe { ops.usable_size(ptr) } >= len);
                let block = unsafe { std::slice::from_raw_parts(ptr, len) };
                assert!(block.iter().all(|&b| b == old_tag));
                unsafe { ops.free(ptr) };
                live[slot] = (std::ptr::null_mut(), 0, 0);
            }
            _ => {}
        }
    }

    for (ptr, _, _) in live {
        unsafe { ops.free(ptr) };
    }
    assert_eq!(ops.primitive().live(), 0);
    assert_eq!(ops.tracked_aligned_blocks(), 0);
});
