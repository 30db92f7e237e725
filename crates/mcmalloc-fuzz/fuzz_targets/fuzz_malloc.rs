#![no_main]
use libfuzzer_sys::fuzz_target;

use std::sync::OnceLock;

use mcmalloc_membrane::{Engine, EngineConfig};

// Engines keep their chunk spans mapped until exit, so share one.
static ENGINE: OnceLock<Engine> = OnceLock::new();

fn engine() -> &'static Engine {
    ENGINE.get_or_init(|| {
        Engine::new(EngineConfig::default().with_thread_capacity(4)).expect("engine")
    })
}

fuzz_target!(|data: &[u8]| {
    // Each 4-byte chunk is one operation: opcode, 16-bit size, alignment shift.
    if data.len() < 4 {
        return;
    }

    let engine = engine();
    let mut ctx = engine.attach().expect("attach");
    let mut live = Vec::new();

    for (i, chunk) in data.chunks_exact(4).enumerate() {
        let size = u16::from_le_bytes([chunk[1], chunk[2]]) as usize;
        let tag = i as u8 | 1;
        match chunk[0] % 4 {
            0 => {
                let mut a = ctx.allocate(size).expect("allocate");
                assert!(a.usable_size() >= size);
                a.as_mut_slice()[..size].fill(tag);
                live.push((a, size, tag));
            }
            1 => {
                if let Some((a, len, tag)) = live.pop() {
                    assert!(a.as_slice()[..len].iter().all(|&b| b == tag));
                    ctx.release(a).expect("release");
                }
            }
            2 => {
                if let Some((a, len, old)) = live.pop() {
                    let a = ctx.reallocate(a, size).expect("reallocate");
                    let keep = len.min(size);
                    assert!(a.as_slice()[..keep].iter().all(|&b| b == old));
                    live.push((a, keep, old));
                }
            }
            _ => {
                let alignment = 16usize << (chunk[3] % 10);
                let a = ctx.allocate_aligned(alignment, size).expect("allocate_aligned");
                assert_eq!(a.addr() % alignment, 0);
                assert!(a.usable_size() >= size);
                live.push((a, 0, 0));
            }
        }
    }

    for (a, _, _) in live {
        ctx.release(a).expect("release");
    }
    drop(ctx);
    let stats = engine.stats();
    assert_eq!(stats.total_malloc(), stats.total_free());
});
