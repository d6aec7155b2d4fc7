//! Symbol name demangling
//!
//! Applied to resolved names only, after lookup. Rust mangling (legacy and
//! v0) is tried first, then the Itanium C++ ABI. Anything else is returned
//! unchanged.

use rustc_demangle::try_demangle;

/// Demangle a symbol name, falling back to the input
#[must_use]
pub fn demangle_symbol(name: &str) -> String {
    if let Ok(demangled) = try_demangle(name) {
        // Use alternate format to drop the trailing hash
        return format!("{demangled:#}");
    }

    if name.starts_with("_Z") {
        let options = cpp_demangle::DemangleOptions::default().no_return_type();
        if let Ok(symbol) = cpp_demangle::Symbol::new(name) {
            if let Ok(demangled) = symbol.demangle_with_options(&options) {
                return demangled;
            }
        }
    }

    name.to_string()
}
