pub mod annotate;
pub mod api;
pub mod ast;
pub mod cache;
pub mod codegen;
pub mod desugar;
pub mod diagnostic;
pub mod ir;
pub mod lexeme;
pub mod lexer;
pub mod parser;
pub mod preprocess;
pub mod span;
pub mod swatch;

// Re-export the public API — `weft::compile()` etc.
pub use api::{compile, compile_file, CompileOptions, Program};
pub use diagnostic::{render_diagnostics, Diagnostic, Severity, Stage};

use lexer::Lexer;
use parser::Parser;

/// Tokenize and parse a source string without preprocessing. Used by
/// tests and tools that work on a single buffer.
pub fn parse_source(source: &str) -> Result<ast::SourceFile, Vec<Diagnostic>> {
    let (tokens, lex_errors) = Lexer::new(source).tokenize();
    if !lex_errors.is_empty() {
        return Err(lex_errors);
    }
    Parser::new(tokens).parse_file()
}
