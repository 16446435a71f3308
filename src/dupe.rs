//! A marker for "clone" calls that are known to be cheap (an `Arc` bump, a
//! channel handle, ...), so call sites read as intentional, not a deep copy.
//! SPDX-License-Identifier: Apache-2.0 OR GPL-3.0-or-later

/// Types that can be cheaply duplicated.
///
/// Blanket-implemented for every `Clone` type; this crate only calls
/// `.dupe()` on handles where the clone is O(1) (`Arc`, channel senders).
pub trait Dupe: Clone {
    /// Duplicate `self`. Equivalent to `Clone::clone`, spelled differently
    /// to document that the call is cheap.
    #[inline]
    fn dupe(&self) -> Self {
        self.clone()
    }
}

impl<T: Clone> Dupe for T {}
