use std::path::PathBuf;

use clap::Args;

use weft::CompileOptions;

#[derive(Args)]
pub struct CheckArgs {
    /// Input .weft file
    pub input: PathBuf,
    /// Extra include search paths
    #[arg(short = 'I', long = "include")]
    pub include: Vec<PathBuf>,
}

pub fn run(args: CheckArgs) {
    let options = CompileOptions {
        search_paths: args.include,
        ..CompileOptions::default()
    };
    let program = super::compile_or_exit(&args.input, &options);
    println!(
        "ok: {} bundle(s), {} spindle(s), {} unit(s)",
        program.bundles.len(),
        program.spindles.len(),
        program.units.len()
    );
}
