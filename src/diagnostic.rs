use crate::preprocess::SourceMap;
use crate::span::Span;

/// The pipeline stage that produced a diagnostic.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Stage {
    Preprocessor,
    Tokenizer,
    Parser,
    Lowering,
    Codegen,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Preprocessor => "preprocessor",
            Stage::Tokenizer => "tokenizer",
            Stage::Parser => "parser",
            Stage::Lowering => "lowering",
            Stage::Codegen => "codegen",
        }
    }
}

/// A compiler diagnostic (error or warning).
#[derive(Clone, Debug)]
pub struct Diagnostic {
    pub severity: Severity,
    pub stage: Stage,
    pub message: String,
    pub span: Span,
    pub notes: Vec<String>,
    pub help: Option<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Severity {
    Error,
    Warning,
}

/// A user-visible source position, resolved through the source map.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SourceLocation {
    pub file: String,
    /// 1-based line in `file`.
    pub line: u32,
    /// 1-based column on that line.
    pub col: u32,
    pub message: String,
}

impl Diagnostic {
    pub fn error(stage: Stage, message: String, span: Span) -> Self {
        Self {
            severity: Severity::Error,
            stage,
            message,
            span,
            notes: Vec::new(),
            help: None,
        }
    }

    pub fn warning(stage: Stage, message: String, span: Span) -> Self {
        Self {
            severity: Severity::Warning,
            stage,
            message,
            span,
            notes: Vec::new(),
            help: None,
        }
    }

    pub fn with_note(mut self, note: String) -> Self {
        self.notes.push(note);
        self
    }

    pub fn with_help(mut self, help: String) -> Self {
        self.help = Some(help);
        self
    }

    /// Resolve this diagnostic to a user-visible `(file, line, col, message)`.
    ///
    /// Positions that fall inside standard-library includes collapse to a
    /// generic stdlib location so library internals don't leak into user
    /// error output.
    pub fn location(&self, map: &SourceMap) -> SourceLocation {
        match map.resolve(self.span.start) {
            Some(resolved) if resolved.stdlib => SourceLocation {
                file: "<stdlib>".to_string(),
                line: 0,
                col: 0,
                message: self.message.clone(),
            },
            Some(resolved) => SourceLocation {
                file: resolved.file,
                line: resolved.line,
                col: resolved.col,
                message: self.message.clone(),
            },
            None => SourceLocation {
                file: "<unknown>".to_string(),
                line: 0,
                col: 0,
                message: self.message.clone(),
            },
        }
    }

    /// Render the diagnostic to stderr using ariadne.
    pub fn render(&self, filename: &str, source: &str) {
        use ariadne::{Color, Label, Report, ReportKind, Source};

        let kind = match self.severity {
            Severity::Error => ReportKind::Error,
            Severity::Warning => ReportKind::Warning,
        };

        let color = match self.severity {
            Severity::Error => Color::Red,
            Severity::Warning => Color::Yellow,
        };

        let mut report = Report::build(kind, filename, self.span.start as usize)
            .with_message(&self.message)
            .with_label(
                Label::new((filename, self.span.start as usize..self.span.end as usize))
                    .with_message(&self.message)
                    .with_color(color),
            );

        for note in &self.notes {
            report = report.with_note(note);
        }

        if let Some(help) = &self.help {
            report = report.with_help(help);
        }

        report
            .finish()
            .eprint((filename, Source::from(source)))
            .ok();
    }
}

/// Render a list of diagnostics.
pub fn render_diagnostics(diagnostics: &[Diagnostic], filename: &str, source: &str) {
    for diag in diagnostics {
        diag.render(filename, source);
    }
}
