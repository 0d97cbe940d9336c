mod cli;

use clap::{Parser, Subcommand};

use cli::build::BuildArgs;
use cli::check::CheckArgs;
use cli::view::ViewArgs;

#[derive(Parser)]
#[command(
    name = "weft",
    version,
    about = "WEFT compiler — dataflow programs for pixels and samples"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Compile a .weft file: write kernels and program metadata
    Build(BuildArgs),
    /// Compile without emitting anything
    Check(CheckArgs),
    /// Show execution order, annotations, and cache buffers
    View(ViewArgs),
}

fn main() {
    let cli = Cli::parse();
    match cli.command {
        Command::Build(args) => cli::build::run(args),
        Command::Check(args) => cli::check::run(args),
        Command::View(args) => cli::view::run(args),
    }
}
