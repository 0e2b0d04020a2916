//! Shared error taxonomy for the echidna workspace.
//!
//! [`EchidnaError`] enumerates the fatal kinds from the router's error
//! table: any one of them terminates the event loop immediately with a
//! single `echidna: `-prefixed line on stderr and process exit code 1.
//! [`Diagnostic`] enumerates the non-fatal kinds, which are logged and
//! never alter loop state.

/// A fatal error. Propagating one of these out of the router always means
/// the process is about to exit 1.
#[derive(Debug, thiserror::Error)]
pub enum EchidnaError {
    #[error("failed to allocate {context} ring buffer")]
    AllocFailure { context: &'static str },

    #[error("failed to spawn worker {worker_id}")]
    SpawnFailure {
        worker_id: usize,
        #[source]
        source: std::io::Error,
    },

    #[error("I/O error on {fd_label}")]
    IoFatal {
        fd_label: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error("unknown input format on {source_label}: first byte is not '@' or '>'")]
    UnknownFormat { source_label: &'static str },

    #[error("FASTA framing on {source_label} is not implemented")]
    FastaInletUnsupported { source_label: &'static str },

    #[error("invalid --processes value: {0}")]
    InvalidProcessCount(String),

    #[error("no worker command supplied")]
    MissingCommand,
}

impl EchidnaError {
    /// All variants are fatal today; kept as a method rather than a constant
    /// so a future non-fatal variant doesn't silently become fatal by omission.
    pub fn exit_code(&self) -> i32 {
        1
    }
}

/// Non-fatal framing diagnostics. Logged at `warn`, never alter framing or
/// dispatch state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Diagnostic {
    /// A framed FASTQ record's first byte was not `@`. Framing is
    /// line-count driven, so this does not stop the scanner.
    UnalignedFastq { line: u64 },
    /// A scanner's head pointer disagreed with its ring buffer's `front`.
    /// Treated as a soft assertion.
    InternalConsistency { detail: &'static str },
}

impl std::fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Diagnostic::UnalignedFastq { line } => {
                write!(f, "unaligned FASTQ input at line {line}")
            }
            Diagnostic::InternalConsistency { detail } => {
                write!(f, "internal consistency warning: {detail}")
            }
        }
    }
}
