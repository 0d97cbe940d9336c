use std::path::PathBuf;

use clap::Args;

use weft::CompileOptions;

#[derive(Args)]
pub struct ViewArgs {
    /// Input .weft file
    pub input: PathBuf,
    /// Extra include search paths
    #[arg(short = 'I', long = "include")]
    pub include: Vec<PathBuf>,
    /// Also print each strand's lowered expression
    #[arg(long)]
    pub strands: bool,
}

pub fn run(args: ViewArgs) {
    let options = CompileOptions {
        search_paths: args.include,
        ..CompileOptions::default()
    };
    let program = super::compile_or_exit(&args.input, &options);

    println!("execution order:");
    for entry in &program.order {
        println!("  {} {:?}", entry.bundle, entry.strands);
    }

    println!("\nbundles:");
    for (name, bundle) in &program.bundles {
        let ann = &program.annotations[name];
        let domain: Vec<&str> = ann.domain.iter().map(|s| s.as_str()).collect();
        let hardware: Vec<&str> = ann.hardware.iter().map(|h| h.as_str()).collect();
        println!(
            "  {} width={} backend={} purity={} domain={{{}}} hardware={{{}}}",
            name,
            bundle.width(),
            ann.backend.as_str(),
            ann.purity.as_str(),
            domain.join(", "),
            hardware.join(", ")
        );
        if args.strands {
            for strand in &bundle.strands {
                println!("    .{} ({}) = {}", strand.index, strand.name, strand.expr);
            }
        }
    }

    if !program.cache_descriptors.is_empty() {
        println!("\ncache buffers:");
        for d in &program.cache_descriptors {
            println!(
                "  {} owner={} strand={} size={} domain={} selfRef={}",
                d.id,
                d.owner,
                d.strand_index,
                d.history_size,
                d.domain.as_str(),
                d.has_self_ref
            );
        }
    }

    if !program.resources.is_empty() {
        println!("\nresources:");
        for (i, r) in program.resources.iter().enumerate() {
            println!("  [{}] {}", i, r);
        }
    }

    println!("\nunits:");
    for unit in &program.units {
        println!(
            "  {} backend={} inputs=[{}] outputs=[{}] fingerprint={}",
            unit.name,
            unit.backend.as_str(),
            unit.inputs.join(", "),
            unit.outputs.join(", "),
            &unit.fingerprint[..16]
        );
    }
}
