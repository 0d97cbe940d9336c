//! Preprocessor: `#include` expansion with a line-accurate source map.
//!
//! The preprocessor flattens an include tree into a single processed text.
//! Every processed line records which file and line it came from, so any
//! downstream diagnostic with a processed-source span can be reported at
//! the user-visible position.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use crate::diagnostic::{Diagnostic, Stage};
use crate::span::Span;

/// Origin of one processed line.
#[derive(Clone, Debug)]
pub struct LineOrigin {
    /// Display path of the originating file.
    pub file: String,
    /// 1-based line number in that file.
    pub line: u32,
    /// True if the line came from the standard-library directory.
    pub stdlib: bool,
}

/// Maps processed-source positions back to original files.
#[derive(Clone, Debug, Default)]
pub struct SourceMap {
    /// One entry per processed line.
    entries: Vec<LineOrigin>,
    /// Byte offset of each processed line start.
    line_starts: Vec<u32>,
}

/// A position resolved through the source map.
#[derive(Clone, Debug)]
pub struct Resolved {
    pub file: String,
    pub line: u32,
    pub col: u32,
    pub stdlib: bool,
}

impl SourceMap {
    /// Resolve a byte offset into the processed source.
    pub fn resolve(&self, offset: u32) -> Option<Resolved> {
        if self.entries.is_empty() {
            return None;
        }
        // Last line whose start is <= offset.
        let idx = match self.line_starts.binary_search(&offset) {
            Ok(i) => i,
            Err(0) => 0,
            Err(i) => i - 1,
        };
        let origin = self.entries.get(idx)?;
        Some(Resolved {
            file: origin.file.clone(),
            line: origin.line,
            col: offset - self.line_starts[idx] + 1,
            stdlib: origin.stdlib,
        })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// The preprocessor's output: flattened text plus its source map.
#[derive(Clone, Debug)]
pub struct Preprocessed {
    pub text: String,
    pub map: SourceMap,
}

/// Find the standard-library directory.
/// Search order:
///   1. WEFT_STDLIB environment variable
///   2. `stdlib/` relative to the compiler binary
///   3. `stdlib/` in the current working directory
pub fn find_stdlib_dir() -> Option<PathBuf> {
    if let Ok(p) = std::env::var("WEFT_STDLIB") {
        let path = PathBuf::from(p);
        if path.is_dir() {
            return Some(path);
        }
    }

    if let Ok(exe) = std::env::current_exe() {
        if let Some(dir) = exe.parent() {
            let path = dir.join("stdlib");
            if path.is_dir() {
                return Some(path);
            }
            if let Some(parent) = dir.parent() {
                let path = parent.join("stdlib");
                if path.is_dir() {
                    return Some(path);
                }
            }
        }
    }

    let cwd = PathBuf::from("stdlib");
    if cwd.is_dir() {
        return Some(cwd);
    }

    None
}

/// Expand `#include` directives in `source` (nominally located at `path`).
pub fn preprocess(
    source: &str,
    path: &Path,
    search_paths: &[PathBuf],
    stdlib_dir: Option<&Path>,
) -> Result<Preprocessed, Vec<Diagnostic>> {
    let mut pp = Preprocessor {
        search_paths,
        stdlib_dir,
        included: HashSet::new(),
        stack: Vec::new(),
        out: String::new(),
        map: SourceMap::default(),
        diagnostics: Vec::new(),
    };

    pp.expand(source, path, false);

    if pp.diagnostics.is_empty() {
        Ok(Preprocessed {
            text: pp.out,
            map: pp.map,
        })
    } else {
        Err(pp.diagnostics)
    }
}

struct Preprocessor<'a> {
    search_paths: &'a [PathBuf],
    stdlib_dir: Option<&'a Path>,
    /// Paths already spliced in (each file is included at most once).
    included: HashSet<PathBuf>,
    /// Active include chain, for cycle reporting.
    stack: Vec<PathBuf>,
    out: String,
    map: SourceMap,
    diagnostics: Vec<Diagnostic>,
}

impl<'a> Preprocessor<'a> {
    fn expand(&mut self, source: &str, path: &Path, stdlib: bool) {
        let display = path.display().to_string();
        self.stack.push(path.to_path_buf());
        self.included.insert(normalize(path));

        let mut in_block_comment = false;
        for (i, line) in source.lines().enumerate() {
            let line_no = i as u32 + 1;

            if !in_block_comment {
                if let Some(directive) = parse_include(line) {
                    match directive {
                        Ok(inc_path) => {
                            self.handle_include(&inc_path, path, &display, line_no, stdlib);
                            continue;
                        }
                        Err(msg) => {
                            self.diagnostics.push(
                                Diagnostic::error(
                                    Stage::Preprocessor,
                                    format!("{} ({}:{})", msg, display, line_no),
                                    Span::dummy(),
                                )
                                .with_help(
                                    "include directives look like `#include \"file.weft\"`"
                                        .to_string(),
                                ),
                            );
                            continue;
                        }
                    }
                }
            }

            in_block_comment = scan_comment_state(line, in_block_comment);
            self.push_line(line, &display, line_no, stdlib);
        }

        self.stack.pop();
    }

    fn handle_include(
        &mut self,
        inc_path: &str,
        from: &Path,
        from_display: &str,
        line_no: u32,
        parent_stdlib: bool,
    ) {
        let (resolved, from_stdlib) = match self.resolve_include(inc_path, from) {
            Some(r) => r,
            None => {
                self.diagnostics.push(
                    Diagnostic::error(
                        Stage::Preprocessor,
                        format!(
                            "cannot find include \"{}\" ({}:{})",
                            inc_path, from_display, line_no
                        ),
                        Span::dummy(),
                    )
                    .with_help(
                        "paths resolve relative to the including file, then the configured \
                         search paths, then the standard library"
                            .to_string(),
                    ),
                );
                return;
            }
        };

        let norm = normalize(&resolved);

        // Circular include: the file is still on the active chain.
        if self.stack.iter().any(|p| normalize(p) == norm) {
            let mut cycle: Vec<String> = self
                .stack
                .iter()
                .skip_while(|p| normalize(p) != norm)
                .map(|p| p.display().to_string())
                .collect();
            cycle.push(resolved.display().to_string());
            self.diagnostics.push(
                Diagnostic::error(
                    Stage::Preprocessor,
                    format!("circular include: {}", cycle.join(" -> ")),
                    Span::dummy(),
                )
                .with_help("remove one of the includes to break the cycle".to_string()),
            );
            return;
        }

        // Each path is spliced at most once; keep line numbering with a
        // placeholder comment where the directive was.
        if self.included.contains(&norm) {
            let placeholder = format!("// #include \"{}\" (already included)", inc_path);
            self.push_line(&placeholder, from_display, line_no, parent_stdlib);
            return;
        }

        let source = match std::fs::read_to_string(&resolved) {
            Ok(s) => s,
            Err(e) => {
                self.diagnostics.push(
                    Diagnostic::error(
                        Stage::Preprocessor,
                        format!("cannot read '{}': {}", resolved.display(), e),
                        Span::dummy(),
                    )
                    .with_help("check that the file exists and is readable".to_string()),
                );
                return;
            }
        };

        self.expand(&source, &resolved, parent_stdlib || from_stdlib);
    }

    /// Resolution order: including file's directory, search paths, stdlib.
    /// Returns the path and whether it came from the stdlib directory.
    fn resolve_include(&self, inc_path: &str, from: &Path) -> Option<(PathBuf, bool)> {
        if let Some(dir) = from.parent() {
            let candidate = dir.join(inc_path);
            if candidate.is_file() {
                return Some((candidate, false));
            }
        }
        for dir in self.search_paths {
            let candidate = dir.join(inc_path);
            if candidate.is_file() {
                return Some((candidate, false));
            }
        }
        if let Some(stdlib) = self.stdlib_dir {
            let candidate = stdlib.join(inc_path);
            if candidate.is_file() {
                return Some((candidate, true));
            }
        }
        None
    }

    fn push_line(&mut self, line: &str, file: &str, line_no: u32, stdlib: bool) {
        self.map.line_starts.push(self.out.len() as u32);
        self.map.entries.push(LineOrigin {
            file: file.to_string(),
            line: line_no,
            stdlib,
        });
        self.out.push_str(line);
        self.out.push('\n');
    }
}

fn normalize(path: &Path) -> PathBuf {
    path.canonicalize().unwrap_or_else(|_| path.to_path_buf())
}

/// Recognize an `#include "path"` directive as the first token on a line.
/// Returns `Some(Err(_))` for a malformed or empty directive.
fn parse_include(line: &str) -> Option<Result<String, String>> {
    let trimmed = line.trim_start();
    let rest = trimmed.strip_prefix("#include")?;
    let rest = rest.trim_start();
    if !rest.starts_with('"') {
        return Some(Err("expected a quoted path after #include".to_string()));
    }
    let body = &rest[1..];
    let close = match body.find('"') {
        Some(i) => i,
        None => return Some(Err("unterminated include path".to_string())),
    };
    let path = &body[..close];
    if path.is_empty() {
        return Some(Err("empty include path".to_string()));
    }
    Some(Ok(path.to_string()))
}

/// Track whether a block comment is open at the end of the line.
/// Strings and line comments are respected so `"/*"` and `// /*` are inert.
fn scan_comment_state(line: &str, mut in_block: bool) -> bool {
    let bytes = line.as_bytes();
    let mut i = 0;
    let mut in_string = false;
    while i < bytes.len() {
        if in_block {
            if bytes[i] == b'*' && bytes.get(i + 1) == Some(&b'/') {
                in_block = false;
                i += 2;
                continue;
            }
            i += 1;
            continue;
        }
        if in_string {
            if bytes[i] == b'\\' {
                i += 2;
                continue;
            }
            if bytes[i] == b'"' {
                in_string = false;
            }
            i += 1;
            continue;
        }
        match bytes[i] {
            b'"' => {
                in_string = true;
                i += 1;
            }
            b'/' if bytes.get(i + 1) == Some(&b'/') => return in_block,
            b'/' if bytes.get(i + 1) == Some(&b'*') => {
                in_block = true;
                i += 2;
            }
            _ => i += 1,
        }
    }
    in_block
}
