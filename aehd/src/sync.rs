// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Mutex type that never reports poison.
//!
//! The wrapped state is kept consistent between statements that can panic, so a panic on one
//! vCPU thread must not wedge every other thread. Poisoned locks are recovered and handed out as
//! usual.

use std::fmt;
use std::fmt::Debug;
use std::sync::Mutex as StdMutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;

/// A mutual exclusion primitive whose lock always succeeds.
#[derive(Default)]
pub(crate) struct Mutex<T: ?Sized> {
    std: StdMutex<T>,
}

impl<T> Mutex<T> {
    pub(crate) fn new(value: T) -> Mutex<T> {
        Mutex {
            std: StdMutex::new(value),
        }
    }
}

impl<T: ?Sized> Mutex<T> {
    /// Acquires the lock, blocking the current thread until it is able to do so.
    pub(crate) fn lock(&self) -> MutexGuard<'_, T> {
        self.std.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns a mutable reference to the underlying data without locking.
    pub(crate) fn get_mut(&mut self) -> &mut T {
        self.std.get_mut().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<T: ?Sized + Debug> Debug for Mutex<T> {
    fn fmt(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        Debug::fmt(&self.std, formatter)
    }
}
