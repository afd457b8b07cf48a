use std::sync::atomic::{AtomicU32, Ordering};

use crate::capture::frame::Handle;

/// Hands out `(history << 8) | index` handles; zero is never produced.
#[derive(Debug, Default)]
pub struct HandleGenerator {
    history: AtomicU32,
}

impl HandleGenerator {
    pub const fn new() -> Self {
        Self {
            history: AtomicU32::new(0),
        }
    }

    pub fn generate(&self, index: u8) -> Handle {
        loop {
            let count = self
                .history
                .fetch_add(1, Ordering::Relaxed)
                .wrapping_add(1)
                & 0x00ff_ffff;
            let handle = (count << 8) | index as u32;
            if count != 0 && handle != 0 {
                return handle;
            }
        }
    }
}

static HANDLES: HandleGenerator = HandleGenerator::new();

/// Process-wide handle for an object living at slot `index`
pub fn generate_handle(index: u8) -> Handle {
    HANDLES.generate(index)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handles_encode_index_and_are_unique() {
        let g = HandleGenerator::new();
        let a = g.generate(3);
        let b = g.generate(3);
        assert_ne!(a, b);
        assert_eq!(a & 0xff, 3);
        assert_eq!(a >> 8, 1);
    }

    #[test]
    fn wrapped_counter_skips_zero() {
        let g = HandleGenerator {
            history: AtomicU32::new(0x00ff_ffff),
        };
        let h = g.generate(0);
        assert_ne!(h, 0);
        assert_eq!(h >> 8, 1);
    }
}
