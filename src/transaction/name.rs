//! Name Resolver
//!
//! Several instrumentation points propose a transaction name: the generic
//! request hook (`GET /orders/42`), route resolution (`OrdersController#show`),
//! the application itself. Each write carries a [`NamePriority`]; a write is
//! refused when the stored name came from a strictly stronger priority.
//!
//! Within one priority the last writer wins; across priorities the stronger
//! one wins no matter the order of the writes.

use super::Transaction;
use parking_lot::MutexGuard;
use serde::Serialize;
use std::fmt;
use std::ops::{Deref, DerefMut};

/// Rank of a name write. A lower rank is a stronger priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct NamePriority(u8);

impl NamePriority {
    /// Set explicitly by application code
    pub const USER_SUPPLIED: NamePriority = NamePriority(1);
    /// Resolved by the framework down to a handler method
    pub const HIGH_LEVEL_FRAMEWORK: NamePriority = NamePriority(5);
    /// Derived generically from the request line
    pub const LOW_LEVEL_FRAMEWORK: NamePriority = NamePriority(10);
    /// Fallback naming
    pub const DEFAULT: NamePriority = NamePriority(100);

    /// Build a priority from a raw rank (lower wins)
    pub const fn from_rank(rank: u8) -> Self {
        NamePriority(rank)
    }

    /// Raw rank
    pub const fn rank(self) -> u8 {
        self.0
    }

    /// Whether a name written at `self` must not be replaced by `other`
    pub fn outranks(self, other: NamePriority) -> bool {
        self.0 < other.0
    }
}

#[derive(Debug, Default)]
pub(crate) struct NameSlot {
    pub(crate) value: String,
    pub(crate) priority: Option<NamePriority>,
}

/// Writable name buffer handed out by [`Transaction::get_and_override_name`].
///
/// Holds the transaction's name lock until dropped; append the candidate
/// name and let it go.
pub struct NameBuffer<'a> {
    slot: MutexGuard<'a, NameSlot>,
}

impl NameBuffer<'_> {
    /// Priority this buffer was acquired at
    pub fn priority(&self) -> Option<NamePriority> {
        self.slot.priority
    }
}

impl Deref for NameBuffer<'_> {
    type Target = String;

    fn deref(&self) -> &String {
        &self.slot.value
    }
}

impl DerefMut for NameBuffer<'_> {
    fn deref_mut(&mut self) -> &mut String {
        &mut self.slot.value
    }
}

impl fmt::Write for NameBuffer<'_> {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.slot.value.push_str(s);
        Ok(())
    }
}

impl Transaction {
    /// Acquire the name buffer at `priority`.
    ///
    /// Returns `None` when the current name was written at a strictly
    /// stronger priority, or when the transaction has already ended.
    /// Otherwise the buffer is cleared and returned for the caller to fill.
    pub fn get_and_override_name(&self, priority: NamePriority) -> Option<NameBuffer<'_>> {
        if self.is_ended() {
            return None;
        }

        let mut slot = self.name.lock();
        if let Some(current) = slot.priority {
            if current.outranks(priority) {
                return None;
            }
        }

        slot.value.clear();
        slot.priority = Some(priority);
        Some(NameBuffer { slot })
    }

    /// Current display name
    pub fn name(&self) -> String {
        self.name.lock().value.clone()
    }

    /// Priority the current name was written at
    pub fn name_priority(&self) -> Option<NamePriority> {
        self.name.lock().priority
    }
}

/// Propose a name for `transaction` at `priority`.
///
/// An absent transaction is a silent no-op. `mutator` runs only when the
/// write is permitted; returns whether it ran.
pub fn override_name<F>(transaction: Option<&Transaction>, priority: NamePriority, mutator: F) -> bool
where
    F: FnOnce(&mut NameBuffer<'_>),
{
    let Some(transaction) = transaction else {
        return false;
    };

    match transaction.get_and_override_name(priority) {
        Some(mut buffer) => {
            mutator(&mut buffer);
            true
        }
        None => false,
    }
}
