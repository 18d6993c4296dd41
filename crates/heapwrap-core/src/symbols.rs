//! Symbol tables: primitive names and the redirection contract.
//!
//! The primitive allocator is linked by name. Its five symbols share a
//! configurable prefix (`xx` by default, giving `xxmalloc`, `xxfree`, ...),
//! fixed at build time by the ABI crate's build script.
//!
//! [`REDIRECTIONS`] lists every platform symbol that must end up in this
//! layer. How that happens is platform business: Linux exports the original
//! names directly, macOS adds `__DATA,__interpose` entries.

use serde::Serialize;

use crate::error::PrefixError;

/// Prefix used when the build does not choose one.
pub const DEFAULT_EXPORT_PREFIX: &str = "xx";

/// Build-time environment variable carrying the prefix.
pub const EXPORT_PREFIX_ENV: &str = "HEAPWRAP_EXPORT_PREFIX";

/// Check that `prefix` can start a C identifier.
pub fn validate_prefix(prefix: &str) -> Result<(), PrefixError> {
    let mut chars = prefix.chars();
    let Some(first) = chars.next() else {
        return Err(PrefixError::Empty);
    };
    if first.is_ascii_digit() {
        return Err(PrefixError::LeadingDigit(prefix.to_owned()));
    }
    match std::iter::once(first)
        .chain(chars)
        .find(|c| !(c.is_ascii_alphanumeric() || *c == '_'))
    {
        Some(found) => Err(PrefixError::InvalidCharacter { found }),
        None => Ok(()),
    }
}

/// Concrete names of the five primitive operations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PrimitiveSymbols {
    pub allocate: String,
    pub deallocate: String,
    pub usable_size: String,
    pub lock: String,
    pub unlock: String,
}

impl PrimitiveSymbols {
    pub fn with_prefix(prefix: &str) -> Result<Self, PrefixError> {
        validate_prefix(prefix)?;
        Ok(Self {
            allocate: format!("{prefix}malloc"),
            deallocate: format!("{prefix}free"),
            usable_size: format!("{prefix}malloc_usable_size"),
            lock: format!("{prefix}malloc_lock"),
            unlock: format!("{prefix}malloc_unlock"),
        })
    }

    /// Names in contract order: allocate, deallocate, usable-size, lock, unlock.
    #[must_use]
    pub fn names(&self) -> [&str; 5] {
        [
            self.allocate.as_str(),
            self.deallocate.as_str(),
            self.usable_size.as_str(),
            self.lock.as_str(),
            self.unlock.as_str(),
        ]
    }
}

/// Operation a redirected symbol must reach.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Replacement {
    Malloc,
    Free,
    UsableSize,
    GoodSize,
    Realloc,
    Reallocf,
    Calloc,
    Strdup,
    Memalign,
    PosixMemalign,
    AlignedAlloc,
    Valloc,
    ForkPrepare,
    ForkParent,
    ForkChild,
    DefaultZone,
    ZoneFromPtr,
    CreateZone,
    DestroyZone,
    ZoneName,
    SetZoneName,
}

/// Platforms on which a redirection applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Platform {
    Any,
    Linux,
    Darwin,
}

impl Platform {
    /// Whether the redirection is live on a target with this `target_os`.
    #[must_use]
    pub fn applies_to(self, target_os: &str) -> bool {
        match self {
            Self::Any => true,
            Self::Linux => target_os == "linux",
            Self::Darwin => target_os == "macos" || target_os == "ios",
        }
    }
}

/// One row of the redirection contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Redirection {
    /// Symbol callers bind to.
    pub original: &'static str,
    pub replacement: Replacement,
    pub platform: Platform,
}

const fn redirect(
    original: &'static str,
    replacement: Replacement,
    platform: Platform,
) -> Redirection {
    Redirection {
        original,
        replacement,
        platform,
    }
}

/// Every original symbol that must resolve to this layer.
pub const REDIRECTIONS: &[Redirection] = &[
    redirect("malloc", Replacement::Malloc, Platform::Any),
    redirect("free", Replacement::Free, Platform::Any),
    redirect("realloc", Replacement::Realloc, Platform::Any),
    redirect("reallocf", Replacement::Reallocf, Platform::Any),
    redirect("calloc", Replacement::Calloc, Platform::Any),
    redirect("strdup", Replacement::Strdup, Platform::Any),
    redirect("memalign", Replacement::Memalign, Platform::Linux),
    redirect("posix_memalign", Replacement::PosixMemalign, Platform::Any),
    redirect("aligned_alloc", Replacement::AlignedAlloc, Platform::Any),
    redirect("valloc", Replacement::Valloc, Platform::Any),
    redirect("vfree", Replacement::Free, Platform::Any),
    redirect("malloc_usable_size", Replacement::UsableSize, Platform::Linux),
    redirect("malloc_size", Replacement::UsableSize, Platform::Darwin),
    redirect("malloc_good_size", Replacement::GoodSize, Platform::Darwin),
    // operator new / new[] and their nothrow forms
    redirect("_Znwm", Replacement::Malloc, Platform::Darwin),
    redirect("_Znam", Replacement::Malloc, Platform::Darwin),
    redirect("_ZnwmRKSt9nothrow_t", Replacement::Malloc, Platform::Darwin),
    redirect("_ZnamRKSt9nothrow_t", Replacement::Malloc, Platform::Darwin),
    // operator delete / delete[] and their nothrow forms
    redirect("_ZdlPv", Replacement::Free, Platform::Darwin),
    redirect("_ZdaPv", Replacement::Free, Platform::Darwin),
    redirect("_ZdlPvRKSt9nothrow_t", Replacement::Free, Platform::Darwin),
    redirect("_ZdaPvRKSt9nothrow_t", Replacement::Free, Platform::Darwin),
    redirect("_malloc_fork_prepare", Replacement::ForkPrepare, Platform::Darwin),
    redirect("_malloc_fork_parent", Replacement::ForkParent, Platform::Darwin),
    redirect("_malloc_fork_child", Replacement::ForkChild, Platform::Darwin),
    redirect("malloc_default_zone", Replacement::DefaultZone, Platform::Darwin),
    redirect("malloc_default_purgeable_zone", Replacement::DefaultZone, Platform::Darwin),
    redirect("malloc_zone_from_ptr", Replacement::ZoneFromPtr, Platform::Darwin),
    redirect("malloc_create_zone", Replacement::CreateZone, Platform::Darwin),
    redirect("malloc_destroy_zone", Replacement::DestroyZone, Platform::Darwin),
    redirect("malloc_get_zone_name", Replacement::ZoneName, Platform::Darwin),
    redirect("malloc_set_zone_name", Replacement::SetZoneName, Platform::Darwin),
];

/// Redirections that apply to `target_os`, in table order.
pub fn redirections_for(target_os: &str) -> impl Iterator<Item = &'static Redirection> + '_ {
    REDIRECTIONS
        .iter()
        .filter(move |r| r.platform.applies_to(target_os))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn default_prefix_names() {
        let symbols = PrimitiveSymbols::with_prefix(DEFAULT_EXPORT_PREFIX).unwrap();
        assert_eq!(
            symbols.names(),
            [
                "xxmalloc",
                "xxfree",
                "xxmalloc_usable_size",
                "xxmalloc_lock",
                "xxmalloc_unlock"
            ]
        );
    }

    #[test]
    fn custom_prefix_is_applied_verbatim() {
        let symbols = PrimitiveSymbols::with_prefix("hoard_").unwrap();
        assert_eq!(symbols.allocate, "hoard_malloc");
        assert_eq!(symbols.unlock, "hoard_malloc_unlock");
    }

    #[test]
    fn prefixes_must_be_identifier_starts() {
        assert_eq!(validate_prefix(""), Err(PrefixError::Empty));
        assert_eq!(
            validate_prefix("9x"),
            Err(PrefixError::LeadingDigit("9x".into()))
        );
        assert_eq!(
            validate_prefix("my-alloc"),
            Err(PrefixError::InvalidCharacter { found: '-' })
        );
        assert!(validate_prefix("_x9").is_ok());
    }

    #[test]
    fn originals_are_unique() {
        let mut seen = HashSet::new();
        for r in REDIRECTIONS {
            assert!(seen.insert(r.original), "duplicate {}", r.original);
        }
    }

    #[test]
    fn every_platform_covers_the_core_family() {
        for os in ["linux", "macos"] {
            let roles: HashSet<_> = redirections_for(os).map(|r| r.replacement).collect();
            for role in [
                Replacement::Malloc,
                Replacement::Free,
                Replacement::Realloc,
                Replacement::Calloc,
                Replacement::PosixMemalign,
                Replacement::Valloc,
                Replacement::UsableSize,
            ] {
                assert!(roles.contains(&role), "{os} lacks {role:?}");
            }
        }
        assert!(redirections_for("linux").all(|r| !r.original.starts_with("_malloc_fork")));
        assert_eq!(
            redirections_for("macos")
                .filter(|r| r.original.starts_with("_malloc_fork"))
                .count(),
            3
        );
    }
}
