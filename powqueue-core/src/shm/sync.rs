// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Process-shared pthread primitives that live inside the mapped region.
//!
//! Default-initialised pthread objects are process-local; every primitive
//! here is initialised with `PTHREAD_PROCESS_SHARED`. On Linux the mutexes
//! are also robust, so a process that dies holding a lock does not wedge the
//! ring, and timed waits run on `CLOCK_MONOTONIC`.
//!
//! Other unix targets get plain process-shared mutexes and `CLOCK_REALTIME`
//! deadlines. Targets without process-shared condition variables are not
//! supported.

use std::cell::UnsafeCell;
use std::marker::PhantomData;
use std::mem::MaybeUninit;
use std::time::Duration;

use crate::error::SyncError;

#[cfg(target_os = "linux")]
const WAIT_CLOCK: libc::clockid_t = libc::CLOCK_MONOTONIC;
#[cfg(not(target_os = "linux"))]
const WAIT_CLOCK: libc::clockid_t = libc::CLOCK_REALTIME;

const NANOS_PER_SEC: u64 = 1_000_000_000;

fn check(op: &'static str, code: libc::c_int) -> Result<(), SyncError> {
    if code == 0 {
        Ok(())
    } else {
        Err(SyncError::from_code(op, code))
    }
}

/// Mutex stored in shared memory.
#[repr(transparent)]
pub struct SharedMutex(UnsafeCell<libc::pthread_mutex_t>);

// SAFETY: the pthread mutex is itself the synchronization; all access goes
// through pthread calls.
unsafe impl Sync for SharedMutex {}
unsafe impl Send for SharedMutex {}

impl SharedMutex {
    /// Initialise in place with process-shared (and, on Linux, robust)
    /// attributes.
    ///
    /// # Safety
    /// Must run exactly once, before any process locks this mutex.
    pub unsafe fn init(&self) -> Result<(), SyncError> {
        let mut attr = MaybeUninit::<libc::pthread_mutexattr_t>::uninit();
        check(
            "pthread_mutexattr_init",
            libc::pthread_mutexattr_init(attr.as_mut_ptr()),
        )?;

        let result = (|| {
            check(
                "pthread_mutexattr_setpshared",
                libc::pthread_mutexattr_setpshared(attr.as_mut_ptr(), libc::PTHREAD_PROCESS_SHARED),
            )?;
            #[cfg(target_os = "linux")]
            check(
                "pthread_mutexattr_setrobust",
                libc::pthread_mutexattr_setrobust(attr.as_mut_ptr(), libc::PTHREAD_MUTEX_ROBUST),
            )?;
            check(
                "pthread_mutex_init",
                libc::pthread_mutex_init(self.0.get(), attr.as_ptr()),
            )
        })();

        libc::pthread_mutexattr_destroy(attr.as_mut_ptr());
        result
    }

    /// Lock, returning a guard that unlocks on every exit path.
    pub fn lock(&self) -> Result<SharedMutexGuard<'_>, SyncError> {
        // SAFETY: initialised by `init` before the region was published.
        let code = unsafe { libc::pthread_mutex_lock(self.0.get()) };
        self.acquired("pthread_mutex_lock", code)?;
        Ok(SharedMutexGuard {
            mutex: self,
            _not_send: PhantomData,
        })
    }

    /// Turn a lock/wait return code into ownership, repairing a mutex whose
    /// previous owner died.
    fn acquired(&self, op: &'static str, code: libc::c_int) -> Result<(), SyncError> {
        match code {
            0 => Ok(()),
            #[cfg(target_os = "linux")]
            libc::EOWNERDEAD => {
                tracing::warn!(op, "Previous lock owner died; recovering shared mutex");
                // SAFETY: we hold the mutex after EOWNERDEAD.
                check("pthread_mutex_consistent", unsafe {
                    libc::pthread_mutex_consistent(self.0.get())
                })
            }
            code => Err(SyncError::from_code(op, code)),
        }
    }

    /// # Safety
    /// No process may hold or wait on this mutex afterwards.
    pub unsafe fn destroy(&self) -> Result<(), SyncError> {
        check("pthread_mutex_destroy", libc::pthread_mutex_destroy(self.0.get()))
    }
}

/// RAII guard for [`SharedMutex`]. Not `Send`: pthread mutexes must be
/// unlocked by the locking thread.
pub struct SharedMutexGuard<'a> {
    mutex: &'a SharedMutex,
    _not_send: PhantomData<*const ()>,
}

impl Drop for SharedMutexGuard<'_> {
    fn drop(&mut self) {
        // SAFETY: the guard exists only while this thread holds the mutex.
        let code = unsafe { libc::pthread_mutex_unlock(self.mutex.0.get()) };
        if code != 0 {
            tracing::error!(
                error = %SyncError::from_code("pthread_mutex_unlock", code),
                "Failed to unlock shared mutex"
            );
        }
    }
}

/// Outcome of a timed condition wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitStatus {
    /// Woken (possibly spuriously); the caller re-checks its predicate.
    Woken,
    TimedOut,
}

/// Absolute deadline on the clock the condition variables were built with.
#[derive(Clone, Copy)]
pub struct Deadline(libc::timespec);

impl Deadline {
    pub fn after(timeout: Duration) -> Result<Self, SyncError> {
        let mut now = MaybeUninit::<libc::timespec>::uninit();
        // SAFETY: `now` is a valid out pointer.
        if unsafe { libc::clock_gettime(WAIT_CLOCK, now.as_mut_ptr()) } != 0 {
            return Err(SyncError::last("clock_gettime"));
        }
        // SAFETY: clock_gettime succeeded.
        let mut at = unsafe { now.assume_init() };

        let nanos = at.tv_nsec as u64 + u64::from(timeout.subsec_nanos());
        let secs = (at.tv_sec as u64)
            .saturating_add(timeout.as_secs())
            .saturating_add(nanos / NANOS_PER_SEC)
            .min(libc::time_t::MAX as u64);
        at.tv_sec = secs as libc::time_t;
        at.tv_nsec = (nanos % NANOS_PER_SEC) as _;
        Ok(Self(at))
    }
}

/// Condition variable stored in shared memory.
#[repr(transparent)]
pub struct SharedCondvar(UnsafeCell<libc::pthread_cond_t>);

// SAFETY: see SharedMutex.
unsafe impl Sync for SharedCondvar {}
unsafe impl Send for SharedCondvar {}

impl SharedCondvar {
    /// Initialise in place with process-shared attributes.
    ///
    /// # Safety
    /// Must run exactly once, before any process waits on or signals it.
    pub unsafe fn init(&self) -> Result<(), SyncError> {
        let mut attr = MaybeUninit::<libc::pthread_condattr_t>::uninit();
        check(
            "pthread_condattr_init",
            libc::pthread_condattr_init(attr.as_mut_ptr()),
        )?;

        let result = (|| {
            check(
                "pthread_condattr_setpshared",
                libc::pthread_condattr_setpshared(attr.as_mut_ptr(), libc::PTHREAD_PROCESS_SHARED),
            )?;
            #[cfg(target_os = "linux")]
            check(
                "pthread_condattr_setclock",
                libc::pthread_condattr_setclock(attr.as_mut_ptr(), WAIT_CLOCK),
            )?;
            check(
                "pthread_cond_init",
                libc::pthread_cond_init(self.0.get(), attr.as_ptr()),
            )
        })();

        libc::pthread_condattr_destroy(attr.as_mut_ptr());
        result
    }

    /// Block until signalled. Spurious wakeups are possible.
    pub fn wait(&self, guard: &mut SharedMutexGuard<'_>) -> Result<(), SyncError> {
        // SAFETY: the guard proves this thread holds the mutex.
        let code = unsafe { libc::pthread_cond_wait(self.0.get(), guard.mutex.0.get()) };
        guard.mutex.acquired("pthread_cond_wait", code)
    }

    /// Block until signalled or `deadline` passes.
    pub fn wait_until(
        &self,
        guard: &mut SharedMutexGuard<'_>,
        deadline: &Deadline,
    ) -> Result<WaitStatus, SyncError> {
        // SAFETY: the guard proves this thread holds the mutex.
        let code = unsafe {
            libc::pthread_cond_timedwait(self.0.get(), guard.mutex.0.get(), &deadline.0)
        };
        if code == libc::ETIMEDOUT {
            return Ok(WaitStatus::TimedOut);
        }
        guard.mutex.acquired("pthread_cond_timedwait", code)?;
        Ok(WaitStatus::Woken)
    }

    pub fn signal(&self) -> Result<(), SyncError> {
        // SAFETY: initialised before the region was published.
        check("pthread_cond_signal", unsafe {
            libc::pthread_cond_signal(self.0.get())
        })
    }

    pub fn broadcast(&self) -> Result<(), SyncError> {
        // SAFETY: initialised before the region was published.
        check("pthread_cond_broadcast", unsafe {
            libc::pthread_cond_broadcast(self.0.get())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    /// Heap-allocated primitives behave the same as mapped ones within one
    /// process, which is enough to exercise the wrappers.
    struct Pair {
        mutex: SharedMutex,
        cond: SharedCondvar,
    }

    fn pair() -> Arc<Pair> {
        // SAFETY: zeroed pthread storage is valid input to *_init, and the
        // primitives are initialised in place and never moved afterwards.
        let pair: Arc<Pair> = Arc::new(unsafe { std::mem::zeroed() });
        unsafe {
            pair.mutex.init().unwrap();
            pair.cond.init().unwrap();
        }
        pair
    }

    #[test]
    fn test_timed_wait_expires() {
        let pair = pair();
        let mut guard = pair.mutex.lock().unwrap();
        let deadline = Deadline::after(Duration::from_millis(20)).unwrap();
        let mut status = WaitStatus::Woken;
        while status == WaitStatus::Woken {
            status = pair.cond.wait_until(&mut guard, &deadline).unwrap();
        }
        assert_eq!(status, WaitStatus::TimedOut);
    }

    #[test]
    fn test_signal_wakes_waiter() {
        let pair = pair();
        let flag = Arc::new(std::sync::atomic::AtomicBool::new(false));

        let waiter = {
            let pair = Arc::clone(&pair);
            let flag = Arc::clone(&flag);
            thread::spawn(move || {
                let mut guard = pair.mutex.lock().unwrap();
                let deadline = Deadline::after(Duration::from_secs(5)).unwrap();
                while !flag.load(std::sync::atomic::Ordering::SeqCst) {
                    if pair.cond.wait_until(&mut guard, &deadline).unwrap() == WaitStatus::TimedOut {
                        return false;
                    }
                }
                true
            })
        };

        thread::sleep(Duration::from_millis(20));
        {
            let _guard = pair.mutex.lock().unwrap();
            flag.store(true, std::sync::atomic::Ordering::SeqCst);
            pair.cond.signal().unwrap();
        }
        assert!(waiter.join().unwrap());
    }
}
