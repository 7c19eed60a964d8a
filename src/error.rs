//! Link-time error kinds and the warning accumulator.
//!
//! Every phase returns `Result<_, LinkError>`; the first fatal error aborts
//! the pipeline. Recoverable conditions go through [`Diagnostics`], which
//! counts them and forwards the text to the `log` facade so embedders decide
//! where it lands.

use thiserror::Error;

/// Fatal conditions the link pipeline can surface.
#[derive(Debug, Error)]
pub enum LinkError {
    /// No definition after resolution settled and the output type requires one.
    #[error("undefined reference to `{name}' (first referenced from {referrer})")]
    UnresolvedSymbol { name: String, referrer: String },

    /// Two strong definitions collided.
    #[error("multiple definition of `{name}': defined in {first} and {second}")]
    MultipleDefinition {
        name: String,
        first: String,
        second: String,
    },

    /// The backend has no apply function for this relocation type.
    #[error("unsupported relocation type {rtype} against `{symbol}' in {input}")]
    UnsupportedReloc {
        rtype: u32,
        symbol: String,
        input: String,
    },

    /// A relocation reserved for the dynamic linker showed up in an input.
    #[error("unexpected dynamic relocation {rtype} in object file {input}; recompile with -fPIC")]
    UnexpectedReloc { rtype: u32, input: String },

    /// Malformed object, archive, or shared object.
    #[error("{path}: {reason}")]
    InvalidInput { path: String, reason: String },

    /// A computed value does not fit the relocated field.
    #[error(
        "relocation truncated to fit: type {rtype} against `{symbol}' at {section}+{offset:#x}"
    )]
    RelocOverflow {
        rtype: u32,
        symbol: String,
        section: String,
        offset: u64,
    },

    #[error("cannot read {path}: {source}")]
    IoRead {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot write {path}: {source}")]
    IoWrite {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// Invalid or missing configuration for the requested operation.
    #[error("configuration error: {0}")]
    Config(String),
}

impl LinkError {
    pub fn invalid(path: impl Into<String>, reason: impl Into<String>) -> Self {
        LinkError::InvalidInput {
            path: path.into(),
            reason: reason.into(),
        }
    }
}

/// Accumulates non-fatal findings across the pipeline.
///
/// Warnings never abort the link; the driver prints the count at exit when
/// nonzero. Kept deliberately small: the engine's only consumers are the CLI
/// driver and tests, both of which want counts plus log lines.
#[derive(Debug, Default)]
pub struct Diagnostics {
    warnings: usize,
}

impl Diagnostics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn warn(&mut self, msg: impl AsRef<str>) {
        self.warnings += 1;
        log::warn!("{}", msg.as_ref());
    }

    pub fn warning_count(&self) -> usize {
        self.warnings
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_carries_context() {
        let e = LinkError::RelocOverflow {
            rtype: 28,
            symbol: "memcpy".into(),
            section: ".text".into(),
            offset: 0x44,
        };
        let msg = e.to_string();
        assert!(msg.contains("memcpy"));
        assert!(msg.contains(".text"));
        assert!(msg.contains("0x44"));
    }

    #[test]
    fn test_warning_count() {
        let mut diag = Diagnostics::new();
        assert_eq!(diag.warning_count(), 0);
        diag.warn("something mild");
        diag.warn("something else");
        assert_eq!(diag.warning_count(), 2);
    }
}
