//! Compiler error types.
//!
//! Pass-internal invariant failures are bugs and abort the compilation;
//! they carry enough context to name the offending pass and function.

use std::fmt;

/// Errors raised by SSA construction and the pass suite.
#[derive(Debug)]
pub enum SsaError {
    /// A variable lookup failed during IR->SSA conversion. Indicates a
    /// frontend invariant violation.
    MissingValue { func: String, what: String },
    /// A node was emitted with no current block selected.
    NoCurrentBlock { func: String },
    /// A fixpoint pass exceeded its iteration bound.
    IterationLimit { pass: &'static str, func: String },
    /// The scheduler could not order every value in a block.
    ScheduleIncomplete {
        func: String,
        block: u32,
        unscheduled: Vec<u32>,
    },
    /// An edge or use-count invariant check failed.
    Verify { func: String, message: String },
}

impl fmt::Display for SsaError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SsaError::MissingValue { func, what } => {
                write!(f, "{}: missing value for {}", func, what)
            }
            SsaError::NoCurrentBlock { func } => {
                write!(f, "{}: no current block", func)
            }
            SsaError::IterationLimit { pass, func } => {
                write!(f, "{}: pass '{}' exceeded its iteration bound", func, pass)
            }
            SsaError::ScheduleIncomplete {
                func,
                block,
                unscheduled,
            } => {
                write!(
                    f,
                    "{}: schedule incomplete in b{}: values {:?} unscheduled",
                    func, block, unscheduled
                )
            }
            SsaError::Verify { func, message } => {
                write!(f, "{}: verify failed: {}", func, message)
            }
        }
    }
}

impl std::error::Error for SsaError {}

/// Top-level compilation error.
#[derive(Debug)]
pub enum CompileError {
    /// Diagnostics were reported against the input; the count is attached
    /// and the rendered text was already printed by the reporter's owner.
    Diagnostics(usize),
    /// AST->IR lowering failed on an internal invariant.
    Lower(String),
    /// SSA construction or a pass failed.
    Ssa(SsaError),
    /// Wasm code generation failed.
    Codegen(String),
    /// Module assembly failed.
    Link(String),
}

impl fmt::Display for CompileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CompileError::Diagnostics(n) => write!(f, "{} error(s) reported", n),
            CompileError::Lower(msg) => write!(f, "lowering error: {}", msg),
            CompileError::Ssa(e) => write!(f, "ssa error: {}", e),
            CompileError::Codegen(msg) => write!(f, "codegen error: {}", msg),
            CompileError::Link(msg) => write!(f, "link error: {}", msg),
        }
    }
}

impl std::error::Error for CompileError {}

impl From<SsaError> for CompileError {
    fn from(e: SsaError) -> Self {
        CompileError::Ssa(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_iteration_limit() {
        let e = SsaError::IterationLimit {
            pass: "rewritedec",
            func: "main".to_string(),
        };
        assert_eq!(
            e.to_string(),
            "main: pass 'rewritedec' exceeded its iteration bound"
        );
    }

    #[test]
    fn test_compile_error_from_ssa() {
        let e: CompileError = SsaError::NoCurrentBlock {
            func: "f".to_string(),
        }
        .into();
        assert!(e.to_string().contains("no current block"));
    }
}
