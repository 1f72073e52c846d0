//! Copy-on-write access to shared cache structures.

use kestrel_common::{KestrelError, Result};
use std::sync::Arc;

/// Structures that can produce an independent copy of themselves.
///
/// Copies allocate fresh arena blocks, so duplication can fail when the
/// segment is exhausted.
pub trait Duplicate: Sized {
    fn duplicate(&self) -> Result<Self>;
}

/// Returns a mutable reference to the value behind `this`, first replacing
/// it with a private copy if any other holder still references it.
///
/// Holders of the old `Arc` keep seeing the old contents.
pub fn make_mut<T: Duplicate>(this: &mut Arc<T>) -> Result<&mut T> {
    if Arc::get_mut(this).is_none() {
        let copy = this.duplicate()?;
        *this = Arc::new(copy);
    }
    Arc::get_mut(this)
        .ok_or_else(|| KestrelError::InvariantViolation("fresh copy is already shared".to_string()))
}
