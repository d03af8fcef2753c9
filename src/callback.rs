//! Error-callback plumbing between libjq and Rust.
//!
//! libjq reports errors through a single `(callback, void *context)` slot
//! per engine handle. A Rust closure cannot travel through that `void *`
//! safely, so the context carries a [`CallbackId`] instead and the
//! [`Registry`] maps it back to the closure on the way out.
//!
//! ```text
//! install(handle, id) ──► jq_set_error_cb(handle, error_trampoline::<D>, id)
//!                                      │
//!   engine reports error ──► error_trampoline::<D>(id, err) ──► D::dispatch(id, err)
//! ```
//!
//! The trampoline runs synchronously on the thread that drives the engine.

use std::collections::HashMap;
use std::ffi::c_void;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};

use crate::ffi::{self, jq_msg_cb, jq_state, JqLib};
use crate::jv::Jv;

/// Opaque token standing in for a host-side error handler.
///
/// Pointer-width, so every id survives the trip through the `void *`
/// context unchanged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CallbackId(pub usize);

impl CallbackId {
    fn into_context(self) -> *mut c_void {
        self.0 as *mut c_void
    }

    fn from_context(context: *mut c_void) -> Self {
        CallbackId(context as usize)
    }
}

impl fmt::Display for CallbackId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// The host-side hook the trampoline forwards to.
///
/// `error` is owned by the implementation, which must free it (or hand it
/// to something that will).
pub trait ErrorDispatch {
    fn dispatch(id: CallbackId, error: ffi::jv);
}

/// The error-callback slot of an engine handle.
pub trait ErrorCallbackSlot {
    /// Stores `cb` and `data` for `state`. `None` restores the engine's
    /// built-in handler.
    ///
    /// # Safety
    ///
    /// `state` must be a live handle belonging to this slot's library.
    unsafe fn set_error_cb(&self, state: *mut jq_state, cb: jq_msg_cb, data: *mut c_void);
}

impl ErrorCallbackSlot for JqLib {
    unsafe fn set_error_cb(&self, state: *mut jq_state, cb: jq_msg_cb, data: *mut c_void) {
        (self.jq_set_error_cb)(state, cb, data)
    }
}

/// Native entry point for reported errors.
///
/// Panics from the dispatch hook are caught here and logged; they never
/// unwind into libjq.
pub extern "C" fn error_trampoline<D: ErrorDispatch>(context: *mut c_void, error: ffi::jv) {
    let id = CallbackId::from_context(context);
    if panic::catch_unwind(AssertUnwindSafe(|| D::dispatch(id, error))).is_err() {
        log::error!("panic in jq error handler {} (caught at FFI boundary)", id);
    }
}

/// Points the handle's error callback at the trampoline for `D`, carrying
/// `id`. Any previously installed callback is replaced.
///
/// # Safety
///
/// `state` must be a live handle belonging to `slot`.
pub unsafe fn install<D: ErrorDispatch, S: ErrorCallbackSlot + ?Sized>(
    slot: &S,
    state: *mut jq_state,
    id: CallbackId,
) {
    log::debug!("installing jq error callback {}", id);
    let cb: unsafe extern "C" fn(*mut c_void, ffi::jv) = error_trampoline::<D>;
    slot.set_error_cb(state, Some(cb), id.into_context());
}

/// Restores the engine's built-in error handling for the handle.
///
/// # Safety
///
/// `state` must be a live handle belonging to `slot`.
pub unsafe fn reset_to_default<S: ErrorCallbackSlot + ?Sized>(slot: &S, state: *mut jq_state) {
    log::debug!("resetting jq error callback");
    slot.set_error_cb(state, None, std::ptr::null_mut());
}

/// Error handler closure stored in the [`Registry`].
pub type ErrorHandler = Box<dyn FnMut(Jv) + Send + 'static>;

type SharedHandler = Arc<Mutex<ErrorHandler>>;

/// Process-wide table from [`CallbackId`] to handler.
///
/// Ids start at 1 and are never reused, so a stale id can only miss.
pub struct Registry {
    next_id: AtomicUsize,
    handlers: Mutex<HashMap<CallbackId, SharedHandler>>,
}

static REGISTRY: OnceLock<Registry> = OnceLock::new();

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    // A handler that panicked leaves nothing half-updated in the map.
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl Registry {
    fn new() -> Self {
        Registry {
            next_id: AtomicUsize::new(1),
            handlers: Mutex::new(HashMap::new()),
        }
    }

    pub fn global() -> &'static Registry {
        REGISTRY.get_or_init(Registry::new)
    }

    pub fn register<F>(&self, handler: F) -> CallbackId
    where
        F: FnMut(Jv) + Send + 'static,
    {
        let id = CallbackId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let handler: ErrorHandler = Box::new(handler);
        lock(&self.handlers).insert(id, Arc::new(Mutex::new(handler)));
        id
    }

    /// Removes the handler. Returns false if it was not registered.
    pub fn unregister(&self, id: CallbackId) -> bool {
        lock(&self.handlers).remove(&id).is_some()
    }

    pub fn contains(&self, id: CallbackId) -> bool {
        lock(&self.handlers).contains_key(&id)
    }

    /// Runs the handler registered for `id` with `error`.
    ///
    /// The registry lock is released before the handler runs.
    pub fn invoke(&self, id: CallbackId, error: Jv) -> bool {
        let handler = lock(&self.handlers).get(&id).cloned();
        match handler {
            Some(handler) => {
                let mut handler = lock(&handler);
                (*handler)(error);
                true
            }
            None => {
                log::warn!("jq error reported for unknown handler {}", id);
                false
            }
        }
    }
}

impl ErrorDispatch for Registry {
    fn dispatch(id: CallbackId, error: ffi::jv) {
        match ffi::loaded_library() {
            Some(lib) => {
                let error = unsafe { Jv::from_raw(lib, error) };
                Registry::global().invoke(id, error);
            }
            // Only libjq calls the trampoline, so it is loaded in practice.
            None => log::error!("jq error for handler {} arrived before libjq loaded", id),
        }
    }
}
