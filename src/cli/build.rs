use std::path::PathBuf;

use clap::Args;

use weft::CompileOptions;

#[derive(Args)]
pub struct BuildArgs {
    /// Input .weft file
    pub input: PathBuf,
    /// Output directory for kernels and program metadata
    #[arg(short, long, default_value = "weft-out")]
    pub out: PathBuf,
    /// Extra include search paths
    #[arg(short = 'I', long = "include")]
    pub include: Vec<PathBuf>,
    /// Pre-materialization node-count threshold
    #[arg(long, default_value_t = 30)]
    pub heavy_threshold: usize,
}

pub fn run(args: BuildArgs) {
    let options = CompileOptions {
        search_paths: args.include,
        stdlib_dir: None,
        heavy_threshold: args.heavy_threshold,
    };
    let program = super::compile_or_exit(&args.input, &options);

    if let Err(e) = std::fs::create_dir_all(&args.out) {
        eprintln!("error: cannot create '{}': {}", args.out.display(), e);
        std::process::exit(1);
    }

    for unit in &program.units {
        if let Some(kernel) = &unit.kernel {
            let path = args.out.join(format!("{}.wgsl", unit.name));
            if let Err(e) = std::fs::write(&path, kernel) {
                eprintln!("error: cannot write '{}': {}", path.display(), e);
                std::process::exit(1);
            }
            println!("wrote {}", path.display());
        }
    }

    let json_path = args.out.join("program.json");
    if let Err(e) = std::fs::write(&json_path, program.summary_json()) {
        eprintln!("error: cannot write '{}': {}", json_path.display(), e);
        std::process::exit(1);
    }
    println!("wrote {}", json_path.display());

    println!(
        "compiled {} bundle(s), {} unit(s), {} cache buffer(s)",
        program.bundles.len(),
        program.units.len(),
        program.cache_descriptors.len()
    );
}
