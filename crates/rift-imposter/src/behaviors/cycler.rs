//! Response cycling state management.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Trait for types that can have a repeat behavior
pub trait HasRepeatBehavior {
    fn get_repeat(&self) -> Option<u32>;
}

/// Lock-free rotation through one stub's responses.
///
/// Packs the response index and the repeat counter into a single `AtomicU64`
/// so concurrent matches against the same stub each claim a distinct slot.
#[derive(Default)]
pub struct StubCycler(AtomicU64);

fn split(v: u64) -> (u32, u32) {
    ((v >> 32) as u32, v as u32)
}

fn join(resp_idx: u32, repeat_idx: u32) -> u64 {
    (u64::from(resp_idx) << 32) | u64::from(repeat_idx)
}

fn advance(
    (mut resp_idx, mut repeat_idx): (u32, u32),
    response_count: u32,
    repeat_count: u32,
) -> (u32, u32) {
    repeat_idx = repeat_idx.saturating_add(1);
    if repeat_idx >= repeat_count {
        repeat_idx = 0;
        resp_idx += 1;
        if resp_idx >= response_count {
            resp_idx = 0;
        }
    }
    (resp_idx, repeat_idx)
}

impl StubCycler {
    #[must_use]
    pub const fn new() -> Self {
        Self(AtomicU64::new(0))
    }

    /// Claim the response for this match and advance, honoring each
    /// response's `repeat` count.
    #[must_use]
    pub fn next_index<T: HasRepeatBehavior>(&self, responses: &[T]) -> usize {
        if responses.is_empty() {
            return 0;
        }
        let response_count = u32::try_from(responses.len()).unwrap_or(u32::MAX);
        let old_value = self
            .0
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| {
                let (mut resp_idx, repeat_idx) = split(v);
                // responses may have been appended or the list replaced since
                if resp_idx >= response_count {
                    resp_idx = 0;
                }
                let repeat_count = responses
                    .get(resp_idx as usize)
                    .and_then(HasRepeatBehavior::get_repeat)
                    .unwrap_or(1)
                    .max(1);
                let (resp_idx, repeat_idx) =
                    advance((resp_idx, repeat_idx), response_count, repeat_count);
                Some(join(resp_idx, repeat_idx))
            })
            .unwrap_or_else(|e| e);
        let (resp_idx, _) = split(old_value);
        if resp_idx >= response_count {
            0
        } else {
            resp_idx as usize
        }
    }
}

impl fmt::Debug for StubCycler {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let (response_idx, repeat_idx) = split(self.0.load(Ordering::Relaxed));
        f.debug_struct("StubCycler")
            .field("response_idx", &response_idx)
            .field("repeat_idx", &repeat_idx)
            .finish()
    }
}
