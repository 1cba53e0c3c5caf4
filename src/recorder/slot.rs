//! Latest-value hand-off between a producer loop and a consumer loop

use parking_lot::Mutex;

/// Single-writer/single-reader slot holding the most recent value.
///
/// Both sides only hold the lock long enough to copy the value, so the
/// writer is never held up by a slow reader and a reader never sees a
/// partially written value.
#[derive(Debug)]
pub struct LatestSlot<T> {
    inner: Mutex<Option<(u64, T)>>,
}

impl<T> Default for LatestSlot<T> {
    fn default() -> Self {
        Self {
            inner: Mutex::new(None),
        }
    }
}

impl<T: Clone> LatestSlot<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the held value. Returns its sequence number.
    pub fn publish(&self, value: T) -> u64 {
        let mut inner = self.inner.lock();
        let seq = inner.as_ref().map_or(1, |(seq, _)| seq + 1);
        *inner = Some((seq, value));
        seq
    }

    /// Most recent value and its sequence number
    pub fn latest(&self) -> Option<(u64, T)> {
        self.inner.lock().clone()
    }

    pub fn clear(&self) {
        *self.inner.lock() = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_latest_value_wins() {
        let slot = LatestSlot::new();
        assert_eq!(slot.latest(), None::<(u64, u32)>);
        assert_eq!(slot.publish(10), 1);
        assert_eq!(slot.publish(20), 2);
        assert_eq!(slot.latest(), Some((2, 20)));
        slot.clear();
        assert_eq!(slot.latest(), None);
    }

    #[test]
    fn test_reader_never_sees_torn_values() {
        let slot = Arc::new(LatestSlot::new());
        let writer = {
            let slot = slot.clone();
            std::thread::spawn(move || {
                for i in 0..10_000u64 {
                    slot.publish([i; 6]);
                }
            })
        };

        let mut last_seq = 0;
        for _ in 0..10_000 {
            if let Some((seq, value)) = slot.latest() {
                assert!(value.iter().all(|v| *v == value[0]));
                assert!(seq >= last_seq);
                last_seq = seq;
            }
        }
        writer.join().unwrap();
    }
}
