pub mod build;
pub mod check;
pub mod view;

use std::path::Path;
use std::process;

use weft::preprocess;
use weft::{CompileOptions, Program};

/// Compile a file or exit with rendered diagnostics.
///
/// Diagnostics carry spans into the processed (include-expanded) source;
/// the source map turns them into user-visible file:line:col positions.
pub fn compile_or_exit(path: &Path, options: &CompileOptions) -> Program {
    if !path.extension().is_some_and(|e| e == "weft") {
        eprintln!("error: input must be a .weft file");
        process::exit(1);
    }

    let source = match std::fs::read_to_string(path) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("error: cannot read '{}': {}", path.display(), e);
            process::exit(1);
        }
    };

    let stdlib = options
        .stdlib_dir
        .clone()
        .or_else(preprocess::find_stdlib_dir);
    let preprocessed =
        preprocess::preprocess(&source, path, &options.search_paths, stdlib.as_deref());

    match weft::compile(&source, path, options) {
        Ok(program) => program,
        Err(errors) => {
            let filename = path.display().to_string();
            match &preprocessed {
                Ok(pp) => {
                    for err in &errors {
                        let loc = err.location(&pp.map);
                        eprintln!(
                            "{}:{}:{}: {}: {}",
                            loc.file,
                            loc.line,
                            loc.col,
                            err.stage.as_str(),
                            loc.message
                        );
                        err.render(&filename, &pp.text);
                    }
                }
                Err(_) => {
                    for err in &errors {
                        eprintln!("{}: {}", err.stage.as_str(), err.message);
                    }
                }
            }
            eprintln!("error: {} error(s) in '{}'", errors.len(), filename);
            process::exit(1);
        }
    }
}
