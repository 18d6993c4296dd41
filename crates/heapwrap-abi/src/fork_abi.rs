//! Fork hooks.
//!
//! ELF release builds register the three hooks with `pthread_atfork` from a
//! load-time constructor. On Darwin libSystem calls `_malloc_fork_prepare`,
//! `_malloc_fork_parent` and `_malloc_fork_child` itself; the interpose table
//! points those at the functions below.

use heapwrap_core::ForkCoordinator;

use crate::primitive::{ExternPrimitive, OPS};

pub(crate) static FORK: ForkCoordinator<'static, ExternPrimitive> = ForkCoordinator::new(&OPS);

pub unsafe extern "C" fn fork_prepare() {
    FORK.prepare();
}

pub unsafe extern "C" fn fork_parent() {
    FORK.parent_resume();
}

pub unsafe extern "C" fn fork_child() {
    FORK.child_resume();
}

#[cfg(all(not(debug_assertions), any(target_os = "linux", target_os = "android")))]
extern "C" fn register_fork_hooks() {
    // SAFETY: the hooks are 'static functions with the expected signature.
    let rc = unsafe {
        libc::pthread_atfork(Some(fork_prepare), Some(fork_parent), Some(fork_child))
    };
    if rc != 0 {
        use heapwrap_core::LogLevel;
        use heapwrap_core::log::LogEvent;

        OPS.log().record(LogEvent::new(
            LogLevel::Error,
            "pthread_atfork",
            "fork_hooks_unregistered",
            "error",
        ));
    }
}

#[cfg(all(not(debug_assertions), any(target_os = "linux", target_os = "android")))]
#[used]
#[unsafe(link_section = ".init_array")]
static REGISTER_FORK_HOOKS: extern "C" fn() = register_fork_hooks;
