//! Source diagnostics.
//!
//! The frontend reports scanner/parser/type/semantic errors (E1xx-E4xx)
//! through a [`Reporter`]; the core reuses the same machinery for the few
//! diagnostics it can raise against user code. Rendering follows the
//! `file:line:col: error[Exxx]: message` shape with an underlined source
//! line and optional `note:` secondary.

use serde::{Deserialize, Serialize};
use std::fmt::Write as _;

/// A source position. Line and column are 1-based; 0 means "unknown".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Span {
    pub line: u32,
    pub col: u32,
    /// Length of the underlined region, in characters.
    pub len: u32,
}

impl Span {
    pub fn new(line: u32, col: u32, len: u32) -> Span {
        Span { line, col, len }
    }

    pub fn none() -> Span {
        Span::default()
    }

    pub fn is_known(&self) -> bool {
        self.line != 0
    }
}

/// A secondary note attached to a diagnostic ("previously defined here").
#[derive(Debug, Clone)]
pub struct Note {
    pub message: String,
    pub span: Span,
}

/// One reported error.
#[derive(Debug, Clone)]
pub struct Diagnostic {
    /// Error code, e.g. "E301".
    pub code: String,
    pub message: String,
    pub span: Span,
    /// The source line the span points into, if the caller has it.
    pub source_line: Option<String>,
    pub note: Option<Note>,
}

/// Collects diagnostics up to a hard cap, then compilation aborts.
pub struct Reporter {
    file: String,
    diags: Vec<Diagnostic>,
    limit: usize,
}

/// After this many errors the reporter refuses more and the driver stops.
pub const MAX_DIAGNOSTICS: usize = 10;

impl Reporter {
    pub fn new(file: impl Into<String>) -> Reporter {
        Reporter {
            file: file.into(),
            diags: Vec::new(),
            limit: MAX_DIAGNOSTICS,
        }
    }

    /// Record a diagnostic. Returns false once the cap is reached.
    pub fn report(&mut self, diag: Diagnostic) -> bool {
        if self.diags.len() >= self.limit {
            return false;
        }
        self.diags.push(diag);
        self.diags.len() < self.limit
    }

    pub fn error(&mut self, code: &str, message: impl Into<String>, span: Span) -> bool {
        self.report(Diagnostic {
            code: code.to_string(),
            message: message.into(),
            span,
            source_line: None,
            note: None,
        })
    }

    pub fn count(&self) -> usize {
        self.diags.len()
    }

    pub fn is_empty(&self) -> bool {
        self.diags.is_empty()
    }

    pub fn at_limit(&self) -> bool {
        self.diags.len() >= self.limit
    }

    pub fn diagnostics(&self) -> &[Diagnostic] {
        &self.diags
    }

    /// Render every diagnostic in the canonical format.
    pub fn render(&self) -> String {
        let mut out = String::new();
        for d in &self.diags {
            let _ = writeln!(
                out,
                "{}:{}:{}: error[{}]: {}",
                self.file, d.span.line, d.span.col, d.code, d.message
            );
            if let Some(ref line) = d.source_line {
                let _ = writeln!(out, "  {}", line);
                let pad = " ".repeat(d.span.col.saturating_sub(1) as usize);
                let carets = "^".repeat(d.span.len.max(1) as usize);
                let _ = writeln!(out, "  {}{}", pad, carets);
            }
            if let Some(ref note) = d.note {
                let _ = writeln!(
                    out,
                    "{}:{}:{}: note: {}",
                    self.file, note.span.line, note.span.col, note.message
                );
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_with_caret() {
        let mut r = Reporter::new("main.cot");
        r.report(Diagnostic {
            code: "E301".to_string(),
            message: "type mismatch".to_string(),
            span: Span::new(3, 5, 4),
            source_line: Some("let x: i64 = true".to_string()),
            note: None,
        });
        let out = r.render();
        assert!(out.contains("main.cot:3:5: error[E301]: type mismatch"));
        assert!(out.contains("^^^^"));
    }

    #[test]
    fn test_cap() {
        let mut r = Reporter::new("x.cot");
        for i in 0..MAX_DIAGNOSTICS {
            assert!(!r.at_limit(), "capped early at {}", i);
            r.error("E400", "boom", Span::none());
        }
        assert!(r.at_limit());
        assert!(!r.error("E400", "over", Span::none()));
        assert_eq!(r.count(), MAX_DIAGNOSTICS);
    }

    #[test]
    fn test_note_rendering() {
        let mut r = Reporter::new("a.cot");
        r.report(Diagnostic {
            code: "E402".to_string(),
            message: "duplicate definition of 'f'".to_string(),
            span: Span::new(9, 1, 1),
            source_line: None,
            note: Some(Note {
                message: "previously defined here".to_string(),
                span: Span::new(2, 1, 1),
            }),
        });
        let out = r.render();
        assert!(out.contains("a.cot:2:1: note: previously defined here"));
    }
}
