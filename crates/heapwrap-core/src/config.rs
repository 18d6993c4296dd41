//! Runtime configuration.
//!
//! Resolved once from the environment:
//! - `HEAPWRAP_REALLOC_ZERO`: `minimal` (default) frees the block and returns a
//!   fresh 1-byte object for `realloc(ptr, 0)`; `null` frees and returns null.
//! - `HEAPWRAP_TRACE`: `1`/`on`/`true`/`yes` records lifecycle events for every
//!   derived operation. Off by default.

use std::sync::atomic::{AtomicU8, Ordering};

/// Convention for `realloc(ptr, 0)` on a live pointer.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ZeroSizeRealloc {
    /// Free the block and return a live 1-byte object (historical Darwin behavior).
    #[default]
    MinimalObject,
    /// Free the block and return null.
    ReturnNull,
}

impl ZeroSizeRealloc {
    /// Parse from string (case-insensitive). Unknown values keep the default.
    #[must_use]
    pub fn from_str_loose(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "null" | "none" | "free" | "posix" => Self::ReturnNull,
            _ => Self::MinimalObject,
        }
    }
}

/// Effective configuration of a derived layer.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WrapConfig {
    pub zero_size_realloc: ZeroSizeRealloc,
    pub trace: bool,
}

impl WrapConfig {
    /// Default configuration, usable in const contexts.
    pub const DEFAULT: Self = Self {
        zero_size_realloc: ZeroSizeRealloc::MinimalObject,
        trace: false,
    };

    #[must_use]
    pub const fn with_zero_size_realloc(mut self, convention: ZeroSizeRealloc) -> Self {
        self.zero_size_realloc = convention;
        self
    }

    #[must_use]
    pub const fn with_trace(mut self, trace: bool) -> Self {
        self.trace = trace;
        self
    }

    fn to_bits(self) -> u8 {
        let mut bits = CONFIG_RESOLVED;
        if matches!(self.zero_size_realloc, ZeroSizeRealloc::ReturnNull) {
            bits |= CONFIG_ZERO_NULL;
        }
        if self.trace {
            bits |= CONFIG_TRACE;
        }
        bits
    }

    fn from_bits(bits: u8) -> Self {
        Self {
            zero_size_realloc: if bits & CONFIG_ZERO_NULL != 0 {
                ZeroSizeRealloc::ReturnNull
            } else {
                ZeroSizeRealloc::MinimalObject
            },
            trace: bits & CONFIG_TRACE != 0,
        }
    }
}

fn parse_flag(raw: &str) -> bool {
    matches!(
        raw.to_ascii_lowercase().as_str(),
        "1" | "on" | "true" | "yes"
    )
}

// Atomic cache: 0=unresolved, 255=resolving, otherwise CONFIG_RESOLVED | flags.
// Resolution reads the environment, which allocates; when the shim is the
// process allocator that allocation re-enters here and must not block.
static CACHED_CONFIG: AtomicU8 = AtomicU8::new(CONFIG_UNRESOLVED);

const CONFIG_UNRESOLVED: u8 = 0;
const CONFIG_RESOLVED: u8 = 0b0000_0001;
const CONFIG_ZERO_NULL: u8 = 0b0000_0010;
const CONFIG_TRACE: u8 = 0b0000_0100;
const CONFIG_RESOLVING: u8 = 255;

fn resolve_from_env() -> WrapConfig {
    let zero_size_realloc = std::env::var("HEAPWRAP_REALLOC_ZERO")
        .map(|v| ZeroSizeRealloc::from_str_loose(&v))
        .unwrap_or_default();
    let trace = std::env::var("HEAPWRAP_TRACE")
        .map(|v| parse_flag(&v))
        .unwrap_or(false);
    WrapConfig {
        zero_size_realloc,
        trace,
    }
}

/// Get the process configuration (reads the environment on first call).
///
/// Re-entrant or concurrent callers that arrive while another caller is
/// resolving get [`WrapConfig::DEFAULT`].
#[must_use]
pub fn wrap_config() -> WrapConfig {
    let cached = CACHED_CONFIG.load(Ordering::Acquire);
    if cached != CONFIG_UNRESOLVED && cached != CONFIG_RESOLVING {
        return WrapConfig::from_bits(cached);
    }
    if cached == CONFIG_RESOLVING {
        return WrapConfig::DEFAULT;
    }

    if CACHED_CONFIG
        .compare_exchange(
            CONFIG_UNRESOLVED,
            CONFIG_RESOLVING,
            Ordering::SeqCst,
            Ordering::Relaxed,
        )
        .is_err()
    {
        let v = CACHED_CONFIG.load(Ordering::Acquire);
        return if v != CONFIG_UNRESOLVED && v != CONFIG_RESOLVING {
            WrapConfig::from_bits(v)
        } else {
            WrapConfig::DEFAULT
        };
    }

    let config = resolve_from_env();
    CACHED_CONFIG.store(config.to_bits(), Ordering::Release);
    config
}
