use std::alloc::{self, Layout};
use std::cell::UnsafeCell;
use std::ptr::{self, NonNull};
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::error::{EhError, Result};
use crate::thread::ThreadId;

use super::header::{ExceptionHeader, ExceptionObject};

/// Exceptions in flight on one thread.
///
/// The node is published in the [`Registry`] once and from then on only its
/// owning thread touches `local`; other threads only read `id` while scanning.
pub struct ThreadExceptionStack {
    id: ThreadId,
    local: UnsafeCell<LocalStack>,
}

struct LocalStack {
    /// Innermost (most recently thrown) header, linked through `next`.
    top: *mut ExceptionHeader,
    /// Reused while free, so a single exception in flight needs no allocation.
    storage: ExceptionHeader,
    storage_used: bool,
    /// Headers created and not yet released, linked or not.
    live: usize,
}

// SAFETY: `local` is only accessed from the owning thread, see above
unsafe impl Send for ThreadExceptionStack {}
unsafe impl Sync for ThreadExceptionStack {}

impl ThreadExceptionStack {
    fn new(id: ThreadId) -> Self {
        Self {
            id,
            local: UnsafeCell::new(LocalStack {
                top: ptr::null_mut(),
                storage: ExceptionHeader::zeroed(),
                storage_used: false,
                live: 0,
            }),
        }
    }

    pub fn id(&self) -> ThreadId {
        self.id
    }

    fn local(&self) -> *mut LocalStack {
        self.local.get()
    }

    fn storage(&self) -> *mut ExceptionHeader {
        unsafe { ptr::addr_of_mut!((*self.local()).storage) }
    }

    pub fn is_embedded(&self, header: *const ExceptionHeader) -> bool {
        ptr::eq(header, self.storage())
    }

    /// Innermost exception in flight, null if none.
    ///
    /// # Safety
    /// Only the owning thread may call this.
    pub unsafe fn top(&self) -> *mut ExceptionHeader {
        (*self.local()).top
    }

    /// No header of this thread is alive, so the stack is empty and the
    /// embedded slot is free: the node may go.
    ///
    /// # Safety
    /// Only the owning thread may call this.
    pub unsafe fn is_idle(&self) -> bool {
        let local = self.local();
        (*local).live == 0 && (*local).top.is_null()
    }

    /// Hands out the embedded slot when free, otherwise a zeroed allocation
    /// from the system allocator (never from the collected heap).
    ///
    /// # Safety
    /// Only the owning thread may call this.
    pub unsafe fn create_header(&self, object: *mut ExceptionObject) -> Result<NonNull<ExceptionHeader>> {
        let local = self.local();
        let header = if !(*local).storage_used {
            (*local).storage_used = true;
            self.storage()
        } else {
            let raw = alloc::alloc_zeroed(Layout::new::<ExceptionHeader>()) as *mut ExceptionHeader;
            if raw.is_null() {
                return Err(EhError::OutOfMemory);
            }
            log::trace!("embedded exception slot busy, allocated header {:p}", raw);
            raw
        };

        header.write(ExceptionHeader::new(object, self.id));
        (*local).live += 1;
        Ok(NonNull::new_unchecked(header))
    }

    /// Zeroes the header and gives its memory back. Returns true when the
    /// node became idle.
    ///
    /// # Safety
    /// `header` must come from [`Self::create_header`] on this node and must
    /// not be linked into the stack any more.
    pub unsafe fn release_header(&self, header: NonNull<ExceptionHeader>) -> bool {
        let header = header.as_ptr();
        header.write(ExceptionHeader::zeroed());
        if self.is_embedded(header) {
            (*self.local()).storage_used = false;
        } else {
            alloc::dealloc(header.cast(), Layout::new::<ExceptionHeader>());
        }
        let local = self.local();
        (*local).live = (*local).live.saturating_sub(1);
        self.is_idle()
    }

    /// # Safety
    /// Only the owning thread may call this, with a header created on this node.
    pub unsafe fn push(&self, header: NonNull<ExceptionHeader>) {
        let local = self.local();
        (*header.as_ptr()).next = (*local).top;
        (*local).top = header.as_ptr();
    }

    /// # Safety
    /// Only the owning thread may call this.
    pub unsafe fn pop(&self) -> Option<NonNull<ExceptionHeader>> {
        let local = self.local();
        let top = NonNull::new((*local).top)?;
        (*local).top = (*top.as_ptr()).next;
        (*top.as_ptr()).next = ptr::null_mut();
        Some(top)
    }

    /// Pops `header`, which must be the innermost exception: catches retire
    /// exceptions in reverse throw order.
    ///
    /// # Safety
    /// Only the owning thread may call this.
    pub unsafe fn pop_expecting(&self, header: *mut ExceptionHeader) -> Result<()> {
        let top = self.top();
        if top.is_null() {
            return Err(EhError::NothingInFlight);
        }
        if top != header {
            return Err(EhError::CatchMismatch {
                landed: header as usize,
                innermost: top as usize,
            });
        }
        self.pop();
        Ok(())
    }
}

struct StackPtr(NonNull<ThreadExceptionStack>);

// SAFETY: the registry owns the node; see `ThreadExceptionStack`
unsafe impl Send for StackPtr {}

/// Process-wide set of per-thread exception stacks.
///
/// The lock only guards membership. Nodes are boxed, so their address stays
/// valid from insertion until [`Registry::remove`].
pub struct Registry {
    threads: Mutex<Vec<StackPtr>>,
}

impl Registry {
    pub const fn new() -> Self {
        Self {
            threads: Mutex::new(Vec::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Vec<StackPtr>> {
        self.threads.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn find(&self, id: ThreadId) -> Option<NonNull<ThreadExceptionStack>> {
        let threads = self.lock();
        threads
            .iter()
            .map(|node| node.0)
            .find(|node| unsafe { node.as_ref() }.id == id)
    }

    pub fn get_or_create(&self, id: ThreadId) -> NonNull<ThreadExceptionStack> {
        let mut threads = self.lock();
        if let Some(node) = threads.iter().find(|node| unsafe { node.0.as_ref() }.id == id) {
            return node.0;
        }

        let node = NonNull::from(Box::leak(Box::new(ThreadExceptionStack::new(id))));
        threads.push(StackPtr(node));
        log::debug!("registered exception stack for {:?} ({} threads)", id, threads.len());
        node
    }

    /// Unlinks and frees `node`.
    ///
    /// # Safety
    /// The node must be idle and nothing may use it afterwards.
    pub unsafe fn remove(&self, node: NonNull<ThreadExceptionStack>) {
        let mut threads = self.lock();
        if let Some(pos) = threads.iter().position(|other| other.0 == node) {
            threads.swap_remove(pos);
            drop(threads);

            log::debug!("released exception stack for {:?}", node.as_ref().id);
            drop(Box::from_raw(node.as_ptr()));
        }
    }

    /// Retires `header` and drops the node once nothing uses it any more.
    ///
    /// # Safety
    /// As for [`ThreadExceptionStack::release_header`]; `node` must be owned by
    /// the calling thread.
    pub unsafe fn free_header(&self, node: NonNull<ThreadExceptionStack>, header: NonNull<ExceptionHeader>) {
        if node.as_ref().release_header(header) {
            self.remove(node);
        }
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

static REGISTRY: Registry = Registry::new();

pub fn global() -> &'static Registry {
    &REGISTRY
}

#[cfg(test)]
mod tests {
    use std::ptr::{self, NonNull};

    use super::*;

    fn object() -> *mut ExceptionObject {
        Box::into_raw(Box::new(ExceptionObject { next: ptr::null_mut() }))
    }

    #[test]
    fn one_node_per_thread() {
        let registry = Registry::new();
        let id = ThreadId::current();

        let a = registry.get_or_create(id);
        let b = registry.get_or_create(id);
        assert_eq!(a, b);
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.find(id), Some(a));

        unsafe { registry.remove(a) };
        assert!(registry.is_empty());
        assert_eq!(registry.find(id), None);
    }

    #[test]
    fn embedded_slot_reused() {
        let registry = Registry::new();
        let id = ThreadId::current();

        for _ in 0..3 {
            let node = registry.get_or_create(id);
            let stack = unsafe { node.as_ref() };
            let payload = object();

            unsafe {
                let header = stack.create_header(payload).unwrap();
                assert!(stack.is_embedded(header.as_ptr()));
                assert_eq!((*header.as_ptr()).object, payload);
                assert_eq!((*header.as_ptr()).thread_id, id);

                stack.push(header);
                stack.pop_expecting(header.as_ptr()).unwrap();
                registry.free_header(node, header);
                drop(Box::from_raw(payload));
            }

            assert!(registry.is_empty());
        }
    }

    #[test]
    fn overflow_headers_are_allocated() {
        let registry = Registry::new();
        let node = registry.get_or_create(ThreadId::current());
        let stack = unsafe { node.as_ref() };

        unsafe {
            let first = stack.create_header(ptr::null_mut()).unwrap();
            let second = stack.create_header(ptr::null_mut()).unwrap();
            assert!(stack.is_embedded(first.as_ptr()));
            assert!(!stack.is_embedded(second.as_ptr()));

            stack.push(first);
            stack.push(second);

            // the embedded slot is free again before the overflow header is
            stack.pop_expecting(second.as_ptr()).unwrap();
            stack.pop_expecting(first.as_ptr()).unwrap();
            assert!(!stack.release_header(first));
            let third = stack.create_header(ptr::null_mut()).unwrap();
            assert!(stack.is_embedded(third.as_ptr()));

            assert!(!stack.release_header(second));
            assert!(stack.release_header(third));
            registry.remove(node);
        }
        assert!(registry.is_empty());
    }

    #[test]
    fn lifo_catch_discipline() {
        let registry = Registry::new();
        let node = registry.get_or_create(ThreadId::current());
        let stack = unsafe { node.as_ref() };

        unsafe {
            let headers: Vec<NonNull<ExceptionHeader>> =
                (0..4).map(|_| stack.create_header(ptr::null_mut()).unwrap()).collect();
            for header in &headers {
                stack.push(*header);
            }
            assert_eq!(stack.top(), headers[3].as_ptr());

            let err = stack.pop_expecting(headers[1].as_ptr()).unwrap_err();
            assert_eq!(
                err,
                EhError::CatchMismatch {
                    landed: headers[1].as_ptr() as usize,
                    innermost: headers[3].as_ptr() as usize,
                }
            );
            // a failed check leaves the stack untouched
            assert_eq!(stack.top(), headers[3].as_ptr());

            for header in headers.iter().rev() {
                stack.pop_expecting(header.as_ptr()).unwrap();
                registry.free_header(node, *header);
            }
        }
        assert!(registry.is_empty());
    }

    #[test]
    fn catch_with_nothing_in_flight() {
        let registry = Registry::new();
        let node = registry.get_or_create(ThreadId::current());
        let mut header = ExceptionHeader::zeroed();

        unsafe {
            let stack = node.as_ref();
            assert!(stack.is_idle());
            assert_eq!(stack.pop_expecting(&mut header), Err(EhError::NothingInFlight));
            assert!(stack.pop().is_none());
            registry.remove(node);
        }
    }

    #[test]
    fn node_kept_while_slot_in_use() {
        let registry = Registry::new();
        let node = registry.get_or_create(ThreadId::current());

        unsafe {
            let stack = node.as_ref();
            let header = stack.create_header(ptr::null_mut()).unwrap();
            // popped but not yet retired
            assert!(!stack.is_idle());
            registry.free_header(node, header);
        }
        assert!(registry.is_empty());
    }

    #[test]
    fn threads_register_independently() {
        let registry = Registry::new();

        std::thread::scope(|scope| {
            for _ in 0..8 {
                scope.spawn(|| {
                    let id = ThreadId::current();
                    for _ in 0..50 {
                        let node = registry.get_or_create(id);
                        assert_eq!(registry.find(id), Some(node));

                        unsafe {
                            let stack = node.as_ref();
                            let outer = stack.create_header(ptr::null_mut()).unwrap();
                            let inner = stack.create_header(ptr::null_mut()).unwrap();
                            stack.push(outer);
                            stack.push(inner);
                            stack.pop_expecting(inner.as_ptr()).unwrap();
                            registry.free_header(node, inner);
                            stack.pop_expecting(outer.as_ptr()).unwrap();
                            registry.free_header(node, outer);
                        }
                        assert_eq!(registry.find(id), None);
                    }
                });
            }
        });

        assert!(registry.is_empty());
    }
}
