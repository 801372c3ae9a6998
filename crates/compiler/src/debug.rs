//! Per-phase diagnostic logging.
//!
//! Controlled by two environment variables, read once per process:
//!
//! - `COT_DEBUG=lower,ssa,...` (or `all`) enables stderr dumps for the
//!   named phases.
//! - `COT_TRACE=funcname` prints a heading whenever the named function
//!   enters a pass, so a single function can be followed through the
//!   pipeline.

use std::collections::HashSet;
use std::sync::OnceLock;

/// Compiler phases recognized by `COT_DEBUG`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    Parse,
    Check,
    Lower,
    Ssa,
    Schedule,
    Regalloc,
    Codegen,
    Strings,
    Abi,
    Verify,
}

impl Phase {
    pub fn name(self) -> &'static str {
        match self {
            Phase::Parse => "parse",
            Phase::Check => "check",
            Phase::Lower => "lower",
            Phase::Ssa => "ssa",
            Phase::Schedule => "schedule",
            Phase::Regalloc => "regalloc",
            Phase::Codegen => "codegen",
            Phase::Strings => "strings",
            Phase::Abi => "abi",
            Phase::Verify => "verify",
        }
    }

    fn from_name(name: &str) -> Option<Phase> {
        Some(match name {
            "parse" => Phase::Parse,
            "check" => Phase::Check,
            "lower" => Phase::Lower,
            "ssa" => Phase::Ssa,
            "schedule" => Phase::Schedule,
            "regalloc" => Phase::Regalloc,
            "codegen" => Phase::Codegen,
            "strings" => Phase::Strings,
            "abi" => Phase::Abi,
            "verify" => Phase::Verify,
            _ => return None,
        })
    }
}

struct DebugConfig {
    all: bool,
    phases: HashSet<Phase>,
    trace_func: Option<String>,
}

static CONFIG: OnceLock<DebugConfig> = OnceLock::new();

fn config() -> &'static DebugConfig {
    CONFIG.get_or_init(|| {
        let mut all = false;
        let mut phases = HashSet::new();
        if let Ok(spec) = std::env::var("COT_DEBUG") {
            for part in spec.split(',') {
                let part = part.trim();
                if part == "all" {
                    all = true;
                } else if let Some(phase) = Phase::from_name(part) {
                    phases.insert(phase);
                } else if !part.is_empty() {
                    eprintln!("warning: COT_DEBUG: unknown phase '{}'", part);
                }
            }
        }
        let trace_func = std::env::var("COT_TRACE").ok().filter(|s| !s.is_empty());
        DebugConfig {
            all,
            phases,
            trace_func,
        }
    })
}

/// True if dumps for `phase` were requested.
pub fn enabled(phase: Phase) -> bool {
    let cfg = config();
    cfg.all || cfg.phases.contains(&phase)
}

/// True if `COT_TRACE` names this function.
pub fn tracing(func_name: &str) -> bool {
    config().trace_func.as_deref() == Some(func_name)
}

/// Print a per-function trace heading if `COT_TRACE` names the function.
pub fn trace_heading(func_name: &str, stage: &str) {
    if tracing(func_name) {
        eprintln!("=== {} [{}] ===", func_name, stage);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_names_round_trip() {
        for phase in [
            Phase::Parse,
            Phase::Check,
            Phase::Lower,
            Phase::Ssa,
            Phase::Schedule,
            Phase::Regalloc,
            Phase::Codegen,
            Phase::Strings,
            Phase::Abi,
            Phase::Verify,
        ] {
            assert_eq!(Phase::from_name(phase.name()), Some(phase));
        }
    }

    #[test]
    fn test_unknown_phase() {
        assert_eq!(Phase::from_name("linker"), None);
    }
}
