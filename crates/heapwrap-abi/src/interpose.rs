//! Darwin `__DATA,__interpose` table.
//!
//! dyld rebinds every image except this one: a call to an original symbol
//! lands on its replacement, while calls made from here still reach
//! libSystem.

use std::ffi::c_void;

use crate::surface::{DARWIN_INTERPOSED, same_names};
use crate::{fork_abi, malloc_abi, zone_abi};

#[repr(C)]
struct Interpose {
    replacement: *const c_void,
    original: *const c_void,
}

// SAFETY: the table is immutable and only read by dyld.
unsafe impl Sync for Interpose {}

macro_rules! interpose_table {
    ($($original:ident = $name:literal => $replacement:path;)*) => {
        // Only the addresses are taken; the declared signature is irrelevant.
        #[allow(clashing_extern_declarations)]
        unsafe extern "C" {
            $(
                #[link_name = $name]
                fn $original();
            )*
        }

        const INTERPOSED: &[&str] = &[$($name),*];

        #[used]
        #[unsafe(link_section = "__DATA,__interpose")]
        static INTERPOSE_TABLE: [Interpose; INTERPOSED.len()] = [$(
            Interpose {
                replacement: $replacement as *const c_void,
                original: $original as *const c_void,
            },
        )*];
    };
}

interpose_table! {
    original_malloc = "malloc" => malloc_abi::malloc;
    original_free = "free" => malloc_abi::free;
    original_realloc = "realloc" => malloc_abi::realloc;
    original_reallocf = "reallocf" => malloc_abi::reallocf;
    original_calloc = "calloc" => malloc_abi::calloc;
    original_strdup = "strdup" => malloc_abi::strdup;
    original_posix_memalign = "posix_memalign" => malloc_abi::posix_memalign;
    original_aligned_alloc = "aligned_alloc" => malloc_abi::aligned_alloc;
    original_valloc = "valloc" => malloc_abi::valloc;
    original_vfree = "vfree" => malloc_abi::vfree;
    original_malloc_size = "malloc_size" => malloc_abi::malloc_size;
    original_malloc_good_size = "malloc_good_size" => malloc_abi::malloc_good_size;
    original_new = "_Znwm" => malloc_abi::malloc;
    original_new_array = "_Znam" => malloc_abi::malloc;
    original_new_nothrow = "_ZnwmRKSt9nothrow_t" => malloc_abi::malloc;
    original_new_array_nothrow = "_ZnamRKSt9nothrow_t" => malloc_abi::malloc;
    original_delete = "_ZdlPv" => malloc_abi::free;
    original_delete_array = "_ZdaPv" => malloc_abi::free;
    original_delete_nothrow = "_ZdlPvRKSt9nothrow_t" => malloc_abi::free;
    original_delete_array_nothrow = "_ZdaPvRKSt9nothrow_t" => malloc_abi::free;
    original_fork_prepare = "_malloc_fork_prepare" => fork_abi::fork_prepare;
    original_fork_parent = "_malloc_fork_parent" => fork_abi::fork_parent;
    original_fork_child = "_malloc_fork_child" => fork_abi::fork_child;
    original_default_zone = "malloc_default_zone" => zone_abi::malloc_default_zone;
    original_default_purgeable_zone = "malloc_default_purgeable_zone" => zone_abi::malloc_default_zone;
    original_zone_from_ptr = "malloc_zone_from_ptr" => zone_abi::malloc_zone_from_ptr;
    original_create_zone = "malloc_create_zone" => zone_abi::malloc_create_zone;
    original_destroy_zone = "malloc_destroy_zone" => zone_abi::malloc_destroy_zone;
    original_get_zone_name = "malloc_get_zone_name" => zone_abi::malloc_get_zone_name;
    original_set_zone_name = "malloc_set_zone_name" => zone_abi::malloc_set_zone_name;
}

const _: () = assert!(same_names(INTERPOSED, DARWIN_INTERPOSED));
