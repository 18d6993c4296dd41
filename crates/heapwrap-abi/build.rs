//! Generates the primitive binding table.
//!
//! The five primitive symbols are named `{prefix}malloc`, `{prefix}free`,
//! ... where the prefix comes from `HEAPWRAP_EXPORT_PREFIX` (default `xx`).
//! `HEAPWRAP_INTERIOR_FREE=0` declares a primitive that cannot release
//! interior pointers. `HEAPWRAP_PRIMITIVE_LIB` / `HEAPWRAP_PRIMITIVE_LIB_DIR`
//! optionally link the primitive in; otherwise it is resolved at load time.

use std::env;
use std::fmt::Write as _;
use std::path::PathBuf;

use heapwrap_core::symbols::{DEFAULT_EXPORT_PREFIX, EXPORT_PREFIX_ENV, PrimitiveSymbols};

const INTERIOR_FREE_ENV: &str = "HEAPWRAP_INTERIOR_FREE";
const PRIMITIVE_LIB_ENV: &str = "HEAPWRAP_PRIMITIVE_LIB";
const PRIMITIVE_LIB_DIR_ENV: &str = "HEAPWRAP_PRIMITIVE_LIB_DIR";

fn main() {
    for var in [
        EXPORT_PREFIX_ENV,
        INTERIOR_FREE_ENV,
        PRIMITIVE_LIB_ENV,
        PRIMITIVE_LIB_DIR_ENV,
    ] {
        println!("cargo:rerun-if-env-changed={var}");
    }
    println!("cargo:rerun-if-changed=build.rs");

    let prefix = env::var(EXPORT_PREFIX_ENV).unwrap_or_else(|_| DEFAULT_EXPORT_PREFIX.to_owned());
    let symbols = PrimitiveSymbols::with_prefix(&prefix)
        .unwrap_or_else(|err| panic!("{EXPORT_PREFIX_ENV}={prefix:?}: {err}"));
    let interior_free = env::var(INTERIOR_FREE_ENV)
        .map(|v| !matches!(v.trim().to_ascii_lowercase().as_str(), "0" | "false" | "no" | "off"))
        .unwrap_or(true);

    let out_dir = PathBuf::from(env::var("OUT_DIR").unwrap());
    std::fs::write(out_dir.join("primitive_bindings.rs"), bindings(&symbols)).unwrap();
    std::fs::write(
        out_dir.join("build_config.rs"),
        build_config(&prefix, &symbols, interior_free),
    )
    .unwrap();

    let target_os = env::var("CARGO_CFG_TARGET_OS").unwrap_or_default();
    if let Ok(dir) = env::var(PRIMITIVE_LIB_DIR_ENV) {
        println!("cargo:rustc-link-search=native={dir}");
    }
    match env::var(PRIMITIVE_LIB_ENV) {
        Ok(lib) => println!("cargo:rustc-link-lib=dylib={lib}"),
        // ELF shared objects may leave symbols undefined; Mach-O needs to be told.
        Err(_) if target_os == "macos" => {
            println!("cargo:rustc-cdylib-link-arg=-Wl,-undefined,dynamic_lookup");
        }
        Err(_) => {}
    }
}

fn bindings(symbols: &PrimitiveSymbols) -> String {
    let mut out = String::new();
    writeln!(out, "// @generated by build.rs").unwrap();
    writeln!(out, "unsafe extern \"C\" {{").unwrap();
    let decls = [
        (&symbols.allocate, "fn primitive_allocate(size: usize) -> *mut c_void;"),
        (&symbols.deallocate, "fn primitive_deallocate(ptr: *mut c_void);"),
        (&symbols.usable_size, "fn primitive_usable_size(ptr: *mut c_void) -> usize;"),
        (&symbols.lock, "fn primitive_lock();"),
        (&symbols.unlock, "fn primitive_unlock();"),
    ];
    for (name, decl) in decls {
        writeln!(out, "    #[link_name = \"{name}\"]").unwrap();
        writeln!(out, "    {decl}").unwrap();
    }
    writeln!(out, "}}").unwrap();
    out
}

fn build_config(prefix: &str, symbols: &PrimitiveSymbols, interior_free: bool) -> String {
    let names = symbols
        .names()
        .iter()
        .map(|n| format!("{n:?}"))
        .collect::<Vec<_>>()
        .join(", ");
    format!(
        "// @generated by build.rs\n\
         /// Prefix of the primitive symbols.\n\
         pub const EXPORT_PREFIX: &str = {prefix:?};\n\
         /// Primitive symbol names: allocate, deallocate, usable-size, lock, unlock.\n\
         pub const PRIMITIVE_NAMES: [&str; 5] = [{names}];\n\
         /// Whether the primitive releases interior pointers.\n\
         pub const INTERIOR_FREE: bool = {interior_free};\n"
    )
}
