use std::fmt;

/// OS-level identity of a thread, compared with `pthread_equal`.
#[derive(Clone, Copy)]
#[repr(transparent)]
pub struct ThreadId(libc::pthread_t);

impl ThreadId {
    pub fn current() -> Self {
        ThreadId(unsafe { libc::pthread_self() })
    }
}

// pthread_t is a plain handle; on some targets it is a pointer type.
unsafe impl Send for ThreadId {}
unsafe impl Sync for ThreadId {}

impl PartialEq for ThreadId {
    fn eq(&self, other: &Self) -> bool {
        unsafe { libc::pthread_equal(self.0, other.0) != 0 }
    }
}

impl Eq for ThreadId {}

impl fmt::Debug for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ThreadId({:?})", self.0)
    }
}
