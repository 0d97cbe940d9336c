//! Public compile pipeline.
//!
//! `compile` runs the whole front end: preprocess → tokenize → parse →
//! desugar → lower → schedule → annotate → swatch → cache-extract →
//! generate. Each stage returns `Ok` or the first errors it found; no
//! partial program escapes a failed compile.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::annotate::{self, Annotation};
use crate::cache::{self, CacheDescriptor};
use crate::codegen::{self, CompiledUnit};
use crate::desugar::desugar;
use crate::diagnostic::Diagnostic;
use crate::ir::lower;
use crate::ir::sched;
use crate::ir::{Bundle, ExecEntry, Spindle};
use crate::lexer::Lexer;
use crate::parser::Parser;
use crate::preprocess::{self, SourceMap};

#[cfg(test)]
mod tests;

/// Options controlling compilation.
#[derive(Clone, Debug)]
pub struct CompileOptions {
    /// Extra directories searched by `#include`.
    pub search_paths: Vec<PathBuf>,
    /// Standard-library directory; discovered via `WEFT_STDLIB` or the
    /// binary's location when not set.
    pub stdlib_dir: Option<PathBuf>,
    /// Node-count threshold above which a strand is marked for
    /// pre-materialization.
    pub heavy_threshold: usize,
}

impl Default for CompileOptions {
    fn default() -> Self {
        Self {
            search_paths: Vec::new(),
            stdlib_dir: None,
            heavy_threshold: 30,
        }
    }
}

/// A finished compilation.
#[derive(Clone, Debug)]
pub struct Program {
    pub bundles: BTreeMap<String, Bundle>,
    pub spindles: BTreeMap<String, Spindle>,
    /// Topological execution order over current-tick dependencies.
    pub order: Vec<ExecEntry>,
    /// Image/audio file paths, interned by path.
    pub resources: Vec<String>,
    /// Inline text resources, interned by content.
    pub text_resources: Vec<String>,
    pub annotations: BTreeMap<String, Annotation>,
    pub cache_descriptors: Vec<CacheDescriptor>,
    pub units: Vec<CompiledUnit>,
    /// Maps processed-source spans back to user files (error reporting).
    pub source_map: SourceMap,
}

/// Compile a WEFT source string. `path` names the source for include
/// resolution and error reporting.
pub fn compile(
    source: &str,
    path: &Path,
    options: &CompileOptions,
) -> Result<Program, Vec<Diagnostic>> {
    let stdlib = options
        .stdlib_dir
        .clone()
        .or_else(preprocess::find_stdlib_dir);

    let preprocessed = preprocess::preprocess(
        source,
        path,
        &options.search_paths,
        stdlib.as_deref(),
    )?;

    let (tokens, lex_errors) = Lexer::new(&preprocessed.text).tokenize();
    if !lex_errors.is_empty() {
        return Err(lex_errors);
    }

    let file = Parser::new(tokens).parse_file()?;
    let file = desugar(file)?;
    let lowered = lower::lower(&file)?;

    let mut program = lowered.program;
    program.order = sched::schedule(&program, &lowered.entries)?;

    let annotations = annotate::annotate(&program)?;
    let swatches = crate::swatch::build(&program, &annotations, options.heavy_threshold);
    let cache_descriptors = cache::extract(&mut program, &annotations)?;
    let units = codegen::generate(&program, &annotations, &swatches, &cache_descriptors)?;

    Ok(Program {
        bundles: program.bundles,
        spindles: program.spindles,
        order: program.order,
        resources: program.resources,
        text_resources: program.text_resources,
        annotations,
        cache_descriptors,
        units,
        source_map: preprocessed.map,
    })
}

/// Compile a `.weft` file from disk.
pub fn compile_file(path: &Path, options: &CompileOptions) -> Result<Program, Vec<Diagnostic>> {
    let source = std::fs::read_to_string(path).map_err(|e| {
        vec![Diagnostic::error(
            crate::diagnostic::Stage::Preprocessor,
            format!("cannot read '{}': {}", path.display(), e),
            crate::span::Span::dummy(),
        )
        .with_help("check that the file exists and is readable".to_string())]
    })?;
    compile(&source, path, options)
}

impl Program {
    /// Width of a bundle, or 0 when it does not exist.
    pub fn width_of(&self, bundle: &str) -> usize {
        self.bundles.get(bundle).map(|b| b.width()).unwrap_or(0)
    }

    /// Program summary as JSON (hand-rolled; this mirrors what the editor
    /// host reads to set up buffers and panels).
    pub fn summary_json(&self) -> String {
        let mut out = String::new();
        out.push_str("{\n  \"bundles\": {\n");
        for (i, (name, bundle)) in self.bundles.iter().enumerate() {
            let ann = self.annotations.get(name);
            out.push_str(&format!(
                "    {}: {{\"width\": {}, \"backend\": {}, \"purity\": {}, \"domain\": [{}], \"hardware\": [{}]}}",
                json_str(name),
                bundle.width(),
                json_str(ann.map(|a| a.backend.as_str()).unwrap_or("visual")),
                json_str(ann.map(|a| a.purity.as_str()).unwrap_or("pure")),
                ann.map(|a| {
                    a.domain
                        .iter()
                        .map(|d| json_str(d))
                        .collect::<Vec<_>>()
                        .join(", ")
                })
                .unwrap_or_default(),
                ann.map(|a| {
                    a.hardware
                        .iter()
                        .map(|h| json_str(h.as_str()))
                        .collect::<Vec<_>>()
                        .join(", ")
                })
                .unwrap_or_default(),
            ));
            if i + 1 < self.bundles.len() {
                out.push(',');
            }
            out.push('\n');
        }
        out.push_str("  },\n");

        out.push_str("  \"order\": [");
        for (i, entry) in self.order.iter().enumerate() {
            if i > 0 {
                out.push_str(", ");
            }
            out.push_str(&json_str(&entry.bundle));
        }
        out.push_str("],\n");

        out.push_str("  \"resources\": [");
        for (i, r) in self.resources.iter().enumerate() {
            if i > 0 {
                out.push_str(", ");
            }
            out.push_str(&json_str(r));
        }
        out.push_str("],\n");

        out.push_str("  \"textResources\": [");
        for (i, r) in self.text_resources.iter().enumerate() {
            if i > 0 {
                out.push_str(", ");
            }
            out.push_str(&json_str(r));
        }
        out.push_str("],\n");

        out.push_str("  \"cacheDescriptors\": [\n");
        for (i, d) in self.cache_descriptors.iter().enumerate() {
            out.push_str(&format!(
                "    {{\"id\": {}, \"owner\": {}, \"strand\": {}, \"historySize\": {}, \"domain\": {}, \"hasSelfRef\": {}}}",
                json_str(&d.id),
                json_str(&d.owner),
                d.strand_index,
                d.history_size,
                json_str(d.domain.as_str()),
                d.has_self_ref
            ));
            if i + 1 < self.cache_descriptors.len() {
                out.push(',');
            }
            out.push('\n');
        }
        out.push_str("  ],\n");

        out.push_str("  \"units\": [\n");
        for (i, unit) in self.units.iter().enumerate() {
            out.push_str(&format!(
                "    {{\"name\": {}, \"backend\": {}, \"inputs\": [{}], \"outputs\": [{}], \"fingerprint\": {}}}",
                json_str(&unit.name),
                json_str(unit.backend.as_str()),
                unit.inputs
                    .iter()
                    .map(|b| json_str(b))
                    .collect::<Vec<_>>()
                    .join(", "),
                unit.outputs
                    .iter()
                    .map(|b| json_str(b))
                    .collect::<Vec<_>>()
                    .join(", "),
                json_str(&unit.fingerprint)
            ));
            if i + 1 < self.units.len() {
                out.push(',');
            }
            out.push('\n');
        }
        out.push_str("  ]\n}\n");
        out
    }
}

fn json_str(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('"');
    for ch in s.chars() {
        match ch {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\t' => out.push_str("\\t"),
            c if (c as u32) < 0x20 => out.push_str(&format!("\\u{:04x}", c as u32)),
            c => out.push(c),
        }
    }
    out.push('"');
    out
}
