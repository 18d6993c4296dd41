//! Names this library binds on each platform.
//!
//! Always compiled, so the export lists can be checked against the core
//! redirection table in unit tests without pulling in the entry points.

/// Symbols a release build exports on ELF targets.
pub const ELF_EXPORTS: &[&str] = &[
    "malloc",
    "free",
    "realloc",
    "reallocf",
    "calloc",
    "strdup",
    "memalign",
    "posix_memalign",
    "aligned_alloc",
    "valloc",
    "vfree",
    "malloc_usable_size",
];

/// Originals replaced through the Darwin interpose table, in table order.
pub const DARWIN_INTERPOSED: &[&str] = &[
    "malloc",
    "free",
    "realloc",
    "reallocf",
    "calloc",
    "strdup",
    "posix_memalign",
    "aligned_alloc",
    "valloc",
    "vfree",
    "malloc_size",
    "malloc_good_size",
    "_Znwm",
    "_Znam",
    "_ZnwmRKSt9nothrow_t",
    "_ZnamRKSt9nothrow_t",
    "_ZdlPv",
    "_ZdaPv",
    "_ZdlPvRKSt9nothrow_t",
    "_ZdaPvRKSt9nothrow_t",
    "_malloc_fork_prepare",
    "_malloc_fork_parent",
    "_malloc_fork_child",
    "malloc_default_zone",
    "malloc_default_purgeable_zone",
    "malloc_zone_from_ptr",
    "malloc_create_zone",
    "malloc_destroy_zone",
    "malloc_get_zone_name",
    "malloc_set_zone_name",
];

/// Element-wise equality of two name lists, usable in const assertions.
#[must_use]
pub const fn same_names(a: &[&str], b: &[&str]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut i = 0;
    while i < a.len() {
        let (x, y) = (a[i].as_bytes(), b[i].as_bytes());
        if x.len() != y.len() {
            return false;
        }
        let mut j = 0;
        while j < x.len() {
            if x[j] != y[j] {
                return false;
            }
            j += 1;
        }
        i += 1;
    }
    true
}
