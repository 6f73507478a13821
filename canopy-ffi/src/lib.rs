//! C bindings for the Canopy forest index
//!
//! Exposes a C-compatible interface over [`canopy_core::ForestIndex`] for
//! both metrics. All functions are panic-safe and report failures through a
//! thread-local error message.
//!
//! # Safety Guarantees
//!
//! - No panic may cross the FFI boundary (enforced by `ffi_guard`)
//! - Strict UTF-8 validation for all string inputs
//! - Null pointer checks on all pointer arguments
//!
//! # Error Handling
//!
//! - `canopy_save` and `canopy_load` return `false`
//! - Functions returning `int` return `-1`
//! - Neighbor queries return `-1`, `canopy_get_distance` returns NaN
//! - The message is available from `canopy_last_error_message()`
//!
//! # Thread Safety
//!
//! Adding, building, saving, loading and unloading need exclusive access to
//! the handle. Queries may run concurrently once the index is built or
//! loaded.

use canopy_core::{AngularIndex, EuclideanIndex, IndexOptions, ItemId, Metric, Neighbor, TreeCount};
use libc::{c_char, c_float, c_int, size_t, ssize_t};
use std::cell::RefCell;
use std::ffi::{CStr, CString};
use std::ptr;
use std::slice;
use std::str::FromStr;

/// An index of either metric, chosen at runtime by name
enum AnyIndex {
    Angular(AngularIndex),
    Euclidean(EuclideanIndex),
}

macro_rules! dispatch {
    ($index:expr, $inner:ident => $body:expr) => {
        match $index {
            AnyIndex::Angular($inner) => $body,
            AnyIndex::Euclidean($inner) => $body,
        }
    };
}

impl AnyIndex {
    fn new(dimensions: usize, metric: Metric, options: IndexOptions) -> anyhow::Result<Self> {
        Ok(match metric {
            Metric::Angular => AnyIndex::Angular(AngularIndex::with_options(dimensions, options)?),
            Metric::Euclidean => {
                AnyIndex::Euclidean(EuclideanIndex::with_options(dimensions, options)?)
            }
        })
    }

    fn dimensions(&self) -> usize {
        dispatch!(self, index => index.dimensions())
    }
}

/// Opaque handle to a Canopy index (C-compatible)
///
/// C code only sees pointers to this type. The real data is an `AnyIndex`.
#[repr(C)]
pub struct CanopyIndex {
    _private: [u8; 0],
}

thread_local! {
    /// Last error message, one per thread
    static LAST_ERROR: RefCell<Option<CString>> = const { RefCell::new(None) };
}

/// Set the last error message for the current thread
///
/// Interior NULs are replaced with "\\0" so reporting never fails.
fn set_last_error(err: impl std::fmt::Display) {
    LAST_ERROR.with(|cell| {
        let safe_msg = err.to_string().replace('\0', "\\0");
        let c_str = CString::new(safe_msg).unwrap_or_default();
        *cell.borrow_mut() = Some(c_str);
    });
}

/// Set the last error from an `anyhow` chain, causes included
fn set_last_error_chain(err: &anyhow::Error) {
    set_last_error(format!("{:#}", err));
}

fn clear_last_error() {
    LAST_ERROR.with(|cell| {
        *cell.borrow_mut() = None;
    });
}

/// Panic barrier for every exported function
///
/// Returns `None` after a panic, with the panic message stored as the last
/// error, so callers can fall back to their sentinel value.
fn ffi_guard<F, R>(f: F) -> Option<R>
where
    F: FnOnce() -> R,
{
    // The operation is abandoned on panic, nothing resumes the broken state.
    match std::panic::catch_unwind(std::panic::AssertUnwindSafe(f)) {
        Ok(result) => Some(result),
        Err(e) => {
            let msg = if let Some(s) = e.downcast_ref::<&str>() {
                format!("Panic: {}", s)
            } else if let Some(s) = e.downcast_ref::<String>() {
                format!("Panic: {}", s)
            } else {
                "Unknown panic".to_string()
            };
            set_last_error(msg);
            None
        }
    }
}

/// Borrow a C string argument as UTF-8, recording an error on failure
///
/// # Safety
///
/// `ptr` must be NULL or a valid NUL-terminated string that outlives `'a`.
unsafe fn str_arg<'a>(ptr: *const c_char, what: &str) -> Option<&'a str> {
    if ptr.is_null() {
        set_last_error(format!("{} cannot be NULL", what));
        return None;
    }

    // SAFETY: Caller guarantees ptr is a valid C string
    let c_str = unsafe { CStr::from_ptr(ptr) };

    // Strict: to_string_lossy() would silently change paths
    match c_str.to_str() {
        Ok(s) => Some(s),
        Err(_) => {
            set_last_error(format!("{} must be valid UTF-8", what));
            None
        }
    }
}

/// # Safety
///
/// `ptr` must be NULL or a live handle from `canopy_new`.
unsafe fn index_ref<'a>(ptr: *const CanopyIndex) -> Option<&'a AnyIndex> {
    // SAFETY: Caller guarantees ptr is NULL or valid
    let index = unsafe { (ptr as *const AnyIndex).as_ref() };
    if index.is_none() {
        set_last_error("Null index pointer");
    }
    index
}

/// # Safety
///
/// `ptr` must be NULL or a live handle from `canopy_new`, not accessed by
/// any other thread during the borrow.
unsafe fn index_mut<'a>(ptr: *mut CanopyIndex) -> Option<&'a mut AnyIndex> {
    // SAFETY: Caller guarantees ptr is NULL or valid and exclusive
    let index = unsafe { (ptr as *mut AnyIndex).as_mut() };
    if index.is_none() {
        set_last_error("Null index pointer");
    }
    index
}

fn search_budget(search_k: i64) -> Option<usize> {
    if search_k < 0 { None } else { Some(usize::try_from(search_k).unwrap_or(usize::MAX)) }
}

/// Copy neighbors into caller buffers and return how many were written
///
/// # Safety
///
/// `out_ids` must hold `neighbors.len()` values. `out_dists` must be NULL
/// or hold as many.
unsafe fn write_neighbors(
    neighbors: &[Neighbor],
    out_ids: *mut ItemId,
    out_dists: *mut c_float,
) -> ssize_t {
    for (i, neighbor) in neighbors.iter().enumerate() {
        // SAFETY: Caller guarantees the buffers have room for every result
        unsafe {
            *out_ids.add(i) = neighbor.id;
            if !out_dists.is_null() {
                *out_dists.add(i) = neighbor.distance;
            }
        }
    }
    clear_last_error();
    ssize_t::try_from(neighbors.len()).unwrap_or(ssize_t::MAX)
}

//
// === LIFECYCLE MANAGEMENT ===
//

/// Create an empty index
///
/// # Arguments
///
/// - `dimensions`: Components per vector (must be > 0)
/// - `metric`: `"angular"` or `"euclidean"` (must not be NULL)
///
/// # Returns
///
/// - Non-NULL pointer on success
/// - NULL on failure (check `canopy_last_error_message()`)
///
/// # Example (C)
///
/// ```c
/// CanopyIndex* index = canopy_new(40, "angular");
/// if (index == NULL) {
///     fprintf(stderr, "Error: %s\n", canopy_last_error_message());
///     exit(1);
/// }
/// ```
///
/// # Safety
///
/// - `metric` must be a valid, NUL-terminated UTF-8 string
/// - Caller must free the returned pointer with `canopy_free()`
#[unsafe(no_mangle)]
pub unsafe extern "C" fn canopy_new(dimensions: u32, metric: *const c_char) -> *mut CanopyIndex {
    // SAFETY: Forwarded caller guarantees
    unsafe { new_index(dimensions, metric, IndexOptions::default()) }
}

/// Create an empty index whose builds are reproducible
///
/// Two indexes created with the same seed, fed the same items and built with
/// the same tree count produce byte-identical files.
///
/// # Safety
///
/// Same requirements as `canopy_new()`
#[unsafe(no_mangle)]
pub unsafe extern "C" fn canopy_new_seeded(
    dimensions: u32,
    metric: *const c_char,
    seed: u64,
) -> *mut CanopyIndex {
    let options = IndexOptions { seed: Some(seed), ..IndexOptions::default() };
    // SAFETY: Forwarded caller guarantees
    unsafe { new_index(dimensions, metric, options) }
}

unsafe fn new_index(
    dimensions: u32,
    metric: *const c_char,
    options: IndexOptions,
) -> *mut CanopyIndex {
    ffi_guard(|| {
        // SAFETY: Caller guarantees metric is NULL or a valid C string
        let Some(name) = (unsafe { str_arg(metric, "Metric") }) else {
            return ptr::null_mut();
        };

        let created = Metric::from_str(name)
            .and_then(|metric| AnyIndex::new(dimensions as usize, metric, options));

        match created {
            Ok(index) => {
                clear_last_error();
                Box::into_raw(Box::new(index)) as *mut CanopyIndex
            }
            Err(e) => {
                set_last_error_chain(&e);
                ptr::null_mut()
            }
        }
    })
    .unwrap_or(ptr::null_mut())
}

/// Free an index and release its file mapping, if any
///
/// # Safety
///
/// - `ptr` must be NULL or a pointer from `canopy_new()` not yet freed
/// - After this call, `ptr` is invalid and must not be used
/// - Safe to call with NULL (no-op)
#[unsafe(no_mangle)]
pub unsafe extern "C" fn canopy_free(ptr: *mut CanopyIndex) {
    if !ptr.is_null() {
        ffi_guard(|| {
            // SAFETY: Caller guarantees ptr came from canopy_new
            let _ = unsafe { Box::from_raw(ptr as *mut AnyIndex) };
        });
    }
}

/// Log build and load progress at `info` level
///
/// # Safety
///
/// - `ptr` must be NULL or valid, with no other thread using it
#[unsafe(no_mangle)]
pub unsafe extern "C" fn canopy_verbose(ptr: *mut CanopyIndex, verbose: bool) {
    ffi_guard(|| {
        // SAFETY: Caller guarantees exclusive access
        if let Some(index) = unsafe { index_mut(ptr) } {
            dispatch!(index, inner => inner.verbose(verbose));
        }
    });
}

//
// === BUILDING ===
//

/// Store a vector under `id`
///
/// Ids need not be dense. Gaps read back as missing items.
///
/// # Returns
///
/// - 0 on success
/// - -1 on failure (check `canopy_last_error_message()`)
///
/// # Example (C)
///
/// ```c
/// float v[3] = {1.0f, 0.0f, 0.5f};
/// if (canopy_add_item(index, 0, v, 3) != 0) {
///     fprintf(stderr, "Add failed: %s\n", canopy_last_error_message());
/// }
/// ```
///
/// # Safety
///
/// - `ptr` must be non-NULL and valid, with no other thread using it
/// - `vector` must point to `len` valid floats
#[unsafe(no_mangle)]
pub unsafe extern "C" fn canopy_add_item(
    ptr: *mut CanopyIndex,
    id: u32,
    vector: *const c_float,
    len: size_t,
) -> c_int {
    ffi_guard(|| {
        // SAFETY: Caller guarantees exclusive access
        let Some(index) = (unsafe { index_mut(ptr) }) else {
            return -1;
        };

        if vector.is_null() {
            set_last_error("Null vector pointer");
            return -1;
        }

        // SAFETY: Caller guarantees vector points to len floats
        let vector = unsafe { slice::from_raw_parts(vector, len) };

        match dispatch!(index, inner => inner.add_item(id, vector)) {
            Ok(()) => {
                clear_last_error();
                0
            }
            Err(e) => {
                set_last_error_chain(&e);
                -1
            }
        }
    })
    .unwrap_or(-1)
}

/// Build the forest
///
/// # Arguments
///
/// - `n_trees`: Number of trees, or -1 to add trees until the node count
///   reaches twice the item count
///
/// # Returns
///
/// - 0 on success
/// - -1 on failure (check `canopy_last_error_message()`)
///
/// # Safety
///
/// - `ptr` must be non-NULL and valid, with no other thread using it
#[unsafe(no_mangle)]
pub unsafe extern "C" fn canopy_build(ptr: *mut CanopyIndex, n_trees: c_int) -> c_int {
    ffi_guard(|| {
        // SAFETY: Caller guarantees exclusive access
        let Some(index) = (unsafe { index_mut(ptr) }) else {
            return -1;
        };

        match dispatch!(index, inner => inner.build(TreeCount::from(n_trees))) {
            Ok(()) => {
                clear_last_error();
                0
            }
            Err(e) => {
                set_last_error_chain(&e);
                -1
            }
        }
    })
    .unwrap_or(-1)
}

//
// === PERSISTENCE ===
//

/// Write a built index to `path` and keep serving it from the file
///
/// # Returns
///
/// `true` on success, `false` on failure (check
/// `canopy_last_error_message()`)
///
/// # Safety
///
/// - `ptr` must be non-NULL and valid, with no other thread using it
/// - `path` must be a valid, NUL-terminated UTF-8 string
#[unsafe(no_mangle)]
pub unsafe extern "C" fn canopy_save(ptr: *mut CanopyIndex, path: *const c_char) -> bool {
    ffi_guard(|| {
        // SAFETY: Caller guarantees exclusive access
        let Some(index) = (unsafe { index_mut(ptr) }) else {
            return false;
        };
        // SAFETY: Caller guarantees path is NULL or a valid C string
        let Some(path) = (unsafe { str_arg(path, "Path") }) else {
            return false;
        };

        match dispatch!(index, inner => inner.save(path)) {
            Ok(()) => {
                clear_last_error();
                true
            }
            Err(e) => {
                set_last_error_chain(&e);
                false
            }
        }
    })
    .unwrap_or(false)
}

/// Map an index file read-only
///
/// The handle must have been created with the dimensions and metric the
/// file was written with. On failure the handle keeps its contents.
///
/// # Example (C)
///
/// ```c
/// CanopyIndex* index = canopy_new(40, "angular");
/// if (!canopy_load(index, "items.canopy")) {
///     fprintf(stderr, "Load failed: %s\n", canopy_last_error_message());
/// }
/// ```
///
/// # Safety
///
/// - `ptr` must be non-NULL and valid, with no other thread using it
/// - `path` must be a valid, NUL-terminated UTF-8 string
#[unsafe(no_mangle)]
pub unsafe extern "C" fn canopy_load(ptr: *mut CanopyIndex, path: *const c_char) -> bool {
    ffi_guard(|| {
        // SAFETY: Caller guarantees exclusive access
        let Some(index) = (unsafe { index_mut(ptr) }) else {
            return false;
        };
        // SAFETY: Caller guarantees path is NULL or a valid C string
        let Some(path) = (unsafe { str_arg(path, "Path") }) else {
            return false;
        };

        match dispatch!(index, inner => inner.load(path)) {
            Ok(()) => {
                clear_last_error();
                true
            }
            Err(e) => {
                set_last_error_chain(&e);
                false
            }
        }
    })
    .unwrap_or(false)
}

/// Release a loaded file and return to an empty index
///
/// # Safety
///
/// - `ptr` must be NULL or valid, with no other thread using it
#[unsafe(no_mangle)]
pub unsafe extern "C" fn canopy_unload(ptr: *mut CanopyIndex) {
    ffi_guard(|| {
        // SAFETY: Caller guarantees exclusive access
        if let Some(index) = unsafe { index_mut(ptr) } {
            dispatch!(index, inner => inner.unload());
        }
    });
}

//
// === QUERIES ===
//

/// Raw distance between two stored items
///
/// Squared chord length for angular, squared L2 for Euclidean.
///
/// # Returns
///
/// The distance, or NaN on failure (check `canopy_last_error_message()`)
///
/// # Safety
///
/// - `ptr` must be non-NULL and valid
#[unsafe(no_mangle)]
pub unsafe extern "C" fn canopy_get_distance(ptr: *const CanopyIndex, a: u32, b: u32) -> c_float {
    ffi_guard(|| {
        // SAFETY: Caller guarantees ptr is valid (shared access)
        let Some(index) = (unsafe { index_ref(ptr) }) else {
            return c_float::NAN;
        };

        match dispatch!(index, inner => inner.get_distance(a, b)) {
            Ok(distance) => {
                clear_last_error();
                distance
            }
            Err(e) => {
                set_last_error_chain(&e);
                c_float::NAN
            }
        }
    })
    .unwrap_or(c_float::NAN)
}

/// Approximate nearest neighbors of a stored item
///
/// # Arguments
///
/// - `id`: Item whose vector is the query
/// - `n`: Maximum number of neighbors
/// - `search_k`: Candidates to inspect, or a negative value for
///   `n * number of trees`
/// - `out_ids`: Buffer with room for `n` ids (must not be NULL)
/// - `out_dists`: Buffer with room for `n` distances, or NULL
///
/// # Returns
///
/// - Number of neighbors written, nearest first
/// - -1 on failure (check `canopy_last_error_message()`)
///
/// # Example (C)
///
/// ```c
/// uint32_t ids[10];
/// float dists[10];
/// ssize_t count = canopy_get_nns_by_item(index, 0, 10, -1, ids, dists);
/// for (ssize_t i = 0; i < count; i++) {
///     printf("%u %f\n", ids[i], dists[i]);
/// }
/// ```
///
/// # Safety
///
/// - `ptr` must be non-NULL and valid
/// - `out_ids` and a non-NULL `out_dists` must have room for `n` values
/// - Buffers must not overlap
#[unsafe(no_mangle)]
pub unsafe extern "C" fn canopy_get_nns_by_item(
    ptr: *const CanopyIndex,
    id: u32,
    n: size_t,
    search_k: i64,
    out_ids: *mut u32,
    out_dists: *mut c_float,
) -> ssize_t {
    ffi_guard(|| {
        // SAFETY: Caller guarantees ptr is valid (shared access)
        let Some(index) = (unsafe { index_ref(ptr) }) else {
            return -1;
        };

        if out_ids.is_null() {
            set_last_error("Null output buffer");
            return -1;
        }

        let budget = search_budget(search_k);
        match dispatch!(index, inner => inner.get_nns_by_item(id, n, budget)) {
            // SAFETY: Caller guarantees the buffers hold n values, and at
            // most n neighbors come back
            Ok(neighbors) => unsafe { write_neighbors(&neighbors, out_ids, out_dists) },
            Err(e) => {
                set_last_error_chain(&e);
                -1
            }
        }
    })
    .unwrap_or(-1)
}

/// Approximate nearest neighbors of an arbitrary vector
///
/// Same conventions as `canopy_get_nns_by_item()`. `len` must match the
/// index dimensions.
///
/// # Safety
///
/// - `ptr` must be non-NULL and valid
/// - `query` must point to `len` valid floats
/// - `out_ids` and a non-NULL `out_dists` must have room for `n` values
#[unsafe(no_mangle)]
pub unsafe extern "C" fn canopy_get_nns_by_vector(
    ptr: *const CanopyIndex,
    query: *const c_float,
    len: size_t,
    n: size_t,
    search_k: i64,
    out_ids: *mut u32,
    out_dists: *mut c_float,
) -> ssize_t {
    ffi_guard(|| {
        // SAFETY: Caller guarantees ptr is valid (shared access)
        let Some(index) = (unsafe { index_ref(ptr) }) else {
            return -1;
        };

        if query.is_null() || out_ids.is_null() {
            set_last_error("Null buffer pointers");
            return -1;
        }

        // SAFETY: Caller guarantees query points to len floats
        let query = unsafe { slice::from_raw_parts(query, len) };

        let budget = search_budget(search_k);
        match dispatch!(index, inner => inner.get_nns_by_vector(query, n, budget)) {
            // SAFETY: As in canopy_get_nns_by_item
            Ok(neighbors) => unsafe { write_neighbors(&neighbors, out_ids, out_dists) },
            Err(e) => {
                set_last_error_chain(&e);
                -1
            }
        }
    })
    .unwrap_or(-1)
}

/// One past the highest item id, or 0 if `ptr` is NULL
///
/// # Safety
///
/// - `ptr` must be NULL or valid
#[unsafe(no_mangle)]
pub unsafe extern "C" fn canopy_get_n_items(ptr: *const CanopyIndex) -> size_t {
    ffi_guard(|| {
        // SAFETY: Caller guarantees ptr is NULL or valid
        let Some(index) = (unsafe { index_ref(ptr) }) else {
            return 0;
        };
        dispatch!(index, inner => inner.get_n_items())
    })
    .unwrap_or(0)
}

/// Components per vector, or 0 if `ptr` is NULL
///
/// # Safety
///
/// - `ptr` must be NULL or valid
#[unsafe(no_mangle)]
pub unsafe extern "C" fn canopy_dimensions(ptr: *const CanopyIndex) -> size_t {
    ffi_guard(|| {
        // SAFETY: Caller guarantees ptr is NULL or valid
        unsafe { index_ref(ptr) }.map_or(0, AnyIndex::dimensions)
    })
    .unwrap_or(0)
}

/// Copy the vector stored under `id` into `out`
///
/// # Returns
///
/// `true` on success, `false` on failure (check
/// `canopy_last_error_message()`)
///
/// # Safety
///
/// - `ptr` must be non-NULL and valid
/// - `out` must have room for `len` floats, and `len` must match the index
///   dimensions
#[unsafe(no_mangle)]
pub unsafe extern "C" fn canopy_get_item(
    ptr: *const CanopyIndex,
    id: u32,
    out: *mut c_float,
    len: size_t,
) -> bool {
    ffi_guard(|| {
        // SAFETY: Caller guarantees ptr is valid (shared access)
        let Some(index) = (unsafe { index_ref(ptr) }) else {
            return false;
        };

        if out.is_null() {
            set_last_error("Null output buffer");
            return false;
        }

        if len != index.dimensions() {
            set_last_error(format!(
                "Vector dimension mismatch: expected {}, got {}",
                index.dimensions(),
                len
            ));
            return false;
        }

        match dispatch!(index, inner => inner.get_item_slice(id)) {
            Ok(vector) => {
                // SAFETY: Caller guarantees out has room for len floats
                let out = unsafe { slice::from_raw_parts_mut(out, len) };
                out.copy_from_slice(vector);
                clear_last_error();
                true
            }
            Err(e) => {
                set_last_error_chain(&e);
                false
            }
        }
    })
    .unwrap_or(false)
}

//
// === ERROR HANDLING ===
//

/// Last error message for the current thread
///
/// # Returns
///
/// - Pointer to a NUL-terminated string
/// - NULL if the last call succeeded
///
/// # Lifetime
///
/// Valid until the next call into this library on the same thread. Do NOT
/// free the returned pointer.
#[unsafe(no_mangle)]
pub extern "C" fn canopy_last_error_message() -> *const c_char {
    LAST_ERROR.with(|cell| cell.borrow().as_ref().map_or(ptr::null(), |s| s.as_ptr()))
}

//
// === VERSIONING ===
//

/// Library version, e.g. "0.1.0"
///
/// Valid for the lifetime of the program. Do NOT free the returned pointer.
#[unsafe(no_mangle)]
pub extern "C" fn canopy_version() -> *const c_char {
    static VERSION: &str = concat!(env!("CARGO_PKG_VERSION"), "\0");

    VERSION.as_ptr() as *const c_char
}
