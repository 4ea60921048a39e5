//! Value wrapper that scopes each access.
//!
//! `Traced<T>` owns a value together with a tag and source location. Every
//! `track()`/`track_mut()` borrow opens a scope that closes when the
//! borrow guard drops, so each access to the wrapped value shows up as one
//! edge in the caller's graph. `get()` and `get_mut()` bypass tracking.

use std::ops::{Deref, DerefMut};

use crate::location::Location;

pub struct Traced<T> {
    value: T,
    tag: &'static str,
    location: Location,
}

impl<T> Traced<T> {
    pub const fn new(value: T, tag: &'static str, location: Location) -> Self {
        Self {
            value,
            tag,
            location,
        }
    }

    pub fn tag(&self) -> &'static str {
        self.tag
    }

    /// Borrow the value inside a scope named after the wrapper's tag.
    ///
    /// The guard latches the enabled flag like [`Scope`](crate::Scope): a
    /// borrow taken while tracing is disabled stays inert even if tracing
    /// is re-enabled before the guard drops, so it can never pop a frame it
    /// did not push.
    pub fn track(&self) -> TrackedRef<'_, T> {
        let armed = crate::is_enabled();
        if armed {
            crate::begin_scope(self.tag, self.location);
        }
        TrackedRef {
            value: &self.value,
            armed,
        }
    }

    /// Mutable counterpart of [`track`](Self::track).
    pub fn track_mut(&mut self) -> TrackedMut<'_, T> {
        let armed = crate::is_enabled();
        if armed {
            crate::begin_scope(self.tag, self.location);
        }
        TrackedMut {
            value: &mut self.value,
            armed,
        }
    }

    /// Untracked access.
    pub fn get(&self) -> &T {
        &self.value
    }

    /// Untracked mutable access.
    pub fn get_mut(&mut self) -> &mut T {
        &mut self.value
    }

    pub fn into_inner(self) -> T {
        self.value
    }
}

#[must_use = "the scope closes when the guard drops"]
pub struct TrackedRef<'a, T> {
    value: &'a T,
    armed: bool,
}

impl<T> Deref for TrackedRef<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        self.value
    }
}

impl<T> Drop for TrackedRef<'_, T> {
    fn drop(&mut self) {
        if self.armed {
            crate::end_scope();
        }
    }
}

#[must_use = "the scope closes when the guard drops"]
pub struct TrackedMut<'a, T> {
    value: &'a mut T,
    armed: bool,
}

impl<T> Deref for TrackedMut<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        self.value
    }
}

impl<T> DerefMut for TrackedMut<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        self.value
    }
}

impl<T> Drop for TrackedMut<'_, T> {
    fn drop(&mut self) {
        if self.armed {
            crate::end_scope();
        }
    }
}

/// Wrap a value, capturing the caller's source location.
#[macro_export]
macro_rules! traced {
    ($tag:expr, $value:expr) => {
        $crate::Traced::new($value, $tag, $crate::here!())
    };
}
