//! Recursive mutex capability.
//!
//! The shared-cache lock may be acquired by the same thread multiple times
//! for nested operations. The default implementation delegates to the
//! host's recursive primitive (`parking_lot::ReentrantMutex`); the
//! `portable-mutex` feature selects a homegrown fallback that tracks the
//! owning thread and a reentry counter by hand, for platforms without a
//! usable recursive primitive.

use crate::error::ErrorCode;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutexKind {
    /// Non-recursive; reentry from the owning thread is a usage error.
    Fast,
    /// Recursive; the owning thread may re-enter.
    Recursive,
}

#[cfg(not(feature = "portable-mutex"))]
mod imp {
    use super::MutexKind;
    use parking_lot::lock_api::{RawMutex as _, RawMutexFair as _};
    use parking_lot::{RawMutex, ReentrantMutex};

    /// Mutex handle backed by the host primitives.
    ///
    /// `ReentrantMutex` guards cannot be stored through the capability's
    /// enter/leave interface, so entry is expressed with raw locking;
    /// every `enter` is paired with exactly one `leave` by the callers.
    pub struct CoreMutex {
        kind: MutexKind,
        fast: RawMutex,
        recursive: ReentrantMutex<()>,
    }

    impl CoreMutex {
        pub(super) fn new(kind: MutexKind) -> Self {
            Self {
                kind,
                fast: RawMutex::INIT,
                recursive: ReentrantMutex::new(()),
            }
        }

        pub(super) fn enter(&self) {
            match self.kind {
                MutexKind::Fast => self.fast.lock(),
                MutexKind::Recursive => {
                    std::mem::forget(self.recursive.lock());
                }
            }
        }

        pub(super) fn try_enter(&self) -> bool {
            match self.kind {
                MutexKind::Fast => self.fast.try_lock(),
                MutexKind::Recursive => match self.recursive.try_lock() {
                    Some(guard) => {
                        std::mem::forget(guard);
                        true
                    }
                    None => false,
                },
            }
        }

        pub(super) fn leave(&self) {
            // Callers pair every leave with a prior enter on the same
            // thread, which is the raw-unlock contract.
            match self.kind {
                MutexKind::Fast => unsafe { self.fast.unlock_fair() },
                MutexKind::Recursive => unsafe { self.recursive.force_unlock() },
            }
        }

        pub(super) fn held(&self) -> bool {
            match self.kind {
                MutexKind::Fast => self.fast.is_locked(),
                MutexKind::Recursive => self.recursive.is_owned_by_current_thread(),
            }
        }
    }
}

#[cfg(feature = "portable-mutex")]
mod imp {
    use super::MutexKind;
    use std::sync::{Condvar, Mutex};
    use std::thread::ThreadId;

    struct State {
        owner: Option<ThreadId>,
        count: u32,
    }

    /// Homegrown reentrant mutex: owner identity plus a reentry counter.
    pub struct CoreMutex {
        kind: MutexKind,
        state: Mutex<State>,
        condvar: Condvar,
    }

    impl CoreMutex {
        pub(super) fn new(kind: MutexKind) -> Self {
            Self {
                kind,
                state: Mutex::new(State {
                    owner: None,
                    count: 0,
                }),
                condvar: Condvar::new(),
            }
        }

        pub(super) fn enter(&self) {
            let tid = std::thread::current().id();
            let mut guard = self.state.lock().unwrap();
            loop {
                match guard.owner {
                    None => {
                        guard.owner = Some(tid);
                        guard.count = 1;
                        return;
                    }
                    Some(owner) if owner == tid && self.kind == MutexKind::Recursive => {
                        guard.count += 1;
                        return;
                    }
                    _ => guard = self.condvar.wait(guard).unwrap(),
                }
            }
        }

        pub(super) fn try_enter(&self) -> bool {
            let tid = std::thread::current().id();
            let mut guard = self.state.lock().unwrap();
            match guard.owner {
                None => {
                    guard.owner = Some(tid);
                    guard.count = 1;
                    true
                }
                Some(owner) if owner == tid && self.kind == MutexKind::Recursive => {
                    guard.count += 1;
                    true
                }
                _ => false,
            }
        }

        pub(super) fn leave(&self) {
            let tid = std::thread::current().id();
            let mut guard = self.state.lock().unwrap();
            if guard.owner == Some(tid) {
                guard.count = guard.count.saturating_sub(1);
                if guard.count == 0 {
                    guard.owner = None;
                    self.condvar.notify_one();
                }
            }
        }

        pub(super) fn held(&self) -> bool {
            self.state.lock().unwrap().owner == Some(std::thread::current().id())
        }
    }
}

pub use imp::CoreMutex;

pub fn mutex_alloc(kind: MutexKind) -> Arc<CoreMutex> {
    Arc::new(CoreMutex::new(kind))
}

pub fn mutex_free(_mutex: Arc<CoreMutex>) {}

pub fn mutex_enter(mutex: &CoreMutex) {
    mutex.enter();
}

pub fn mutex_try(mutex: &CoreMutex) -> ErrorCode {
    if mutex.try_enter() {
        ErrorCode::Ok
    } else {
        ErrorCode::Busy
    }
}

pub fn mutex_leave(mutex: &CoreMutex) {
    mutex.leave();
}

pub fn mutex_held(mutex: &CoreMutex) -> bool {
    mutex.held()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recursive_reentry() {
        let m = mutex_alloc(MutexKind::Recursive);
        mutex_enter(&m);
        mutex_enter(&m);
        assert!(mutex_held(&m));
        mutex_leave(&m);
        assert!(mutex_held(&m));
        mutex_leave(&m);
    }

    #[test]
    fn test_try_on_contended_mutex() {
        let m = mutex_alloc(MutexKind::Fast);
        mutex_enter(&m);
        let m2 = Arc::clone(&m);
        let blocked = std::thread::spawn(move || mutex_try(&m2)).join().unwrap();
        assert_eq!(blocked, ErrorCode::Busy);
        mutex_leave(&m);
    }

    #[test]
    fn test_recursive_released_only_at_zero() {
        let m = mutex_alloc(MutexKind::Recursive);
        mutex_enter(&m);
        mutex_enter(&m);
        mutex_leave(&m);
        // Still held once; another thread must not acquire it.
        let m2 = Arc::clone(&m);
        let got = std::thread::spawn(move || mutex_try(&m2)).join().unwrap();
        assert_eq!(got, ErrorCode::Busy);
        mutex_leave(&m);
        let m3 = Arc::clone(&m);
        let got = std::thread::spawn(move || {
            let rc = mutex_try(&m3);
            if rc == ErrorCode::Ok {
                mutex_leave(&m3);
            }
            rc
        })
        .join()
        .unwrap();
        assert_eq!(got, ErrorCode::Ok);
    }
}
