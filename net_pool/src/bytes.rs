//! Relaxed atomic access to shared buffer bytes. Buffers travel through
//! descriptor chains while the pool retains a view of the same memory, so all
//! data access goes through `AtomicU8` slices.

use std::sync::atomic::AtomicU8;
use std::sync::atomic::Ordering::Relaxed;

pub fn atomic_read(src: &[AtomicU8], dest: &mut [u8]) {
    assert!(dest.len() <= src.len());
    for (d, s) in dest.iter_mut().zip(src) {
        *d = s.load(Relaxed);
    }
}

pub fn atomic_write(dest: &[AtomicU8], src: &[u8]) {
    assert!(src.len() <= dest.len());
    for (d, s) in dest.iter().zip(src) {
        d.store(*s, Relaxed);
    }
}

pub fn atomic_fill(dest: &[AtomicU8], value: u8) {
    for d in dest {
        d.store(value, Relaxed);
    }
}

pub fn alloc_bytes(len: usize) -> Box<[AtomicU8]> {
    (0..len).map(|_| AtomicU8::new(0)).collect()
}
