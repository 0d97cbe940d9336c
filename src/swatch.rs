//! Swatch building: group scheduled bundles into per-backend compilation
//! units.
//!
//! A swatch is a maximal run of consecutive execution entries that share a
//! backend. Each swatch records the buffers it reads from other units and
//! the buffers later units (or the host's sinks) consume from it, plus the
//! strands heavy enough to pre-materialize into intermediate storage.

use std::collections::{BTreeMap, BTreeSet};

use crate::annotate::{collect_reads, Annotation, Backend};
use crate::ir::{ExecEntry, Program};

/// One compilation unit.
#[derive(Clone, Debug)]
pub struct Swatch {
    /// Unit name, e.g. `visual0`, `audio1`.
    pub name: String,
    pub backend: Backend,
    /// The slice of the execution order this unit covers.
    pub entries: Vec<ExecEntry>,
    /// Bundle names computed here, in execution order, deduplicated.
    pub bundles: Vec<String>,
    /// Bundles read here but produced outside this unit (cross-unit
    /// buffers, `scope` taps, shared constants).
    pub inputs: Vec<String>,
    /// Bundles produced here that later units or the host consume.
    pub outputs: Vec<String>,
    /// `(bundle, strand)` pairs that exceed the pre-materialization
    /// threshold or contain a spindle call.
    pub heavy: Vec<(String, u32)>,
}

/// Group the execution order into swatches.
pub fn build(
    program: &Program,
    annotations: &BTreeMap<String, Annotation>,
    heavy_threshold: usize,
) -> Vec<Swatch> {
    let mut swatches: Vec<Swatch> = Vec::new();
    let mut current: Option<(Backend, Vec<ExecEntry>)> = None;
    let mut counts: BTreeMap<&'static str, usize> = BTreeMap::new();

    for entry in &program.order {
        let backend = annotations
            .get(&entry.bundle)
            .map(|a| a.backend)
            .unwrap_or(Backend::Visual);

        match &mut current {
            Some((b, entries)) if *b == backend => entries.push(entry.clone()),
            _ => {
                if let Some((b, entries)) = current.take() {
                    swatches.push(finish_swatch(b, entries, &mut counts));
                }
                current = Some((backend, vec![entry.clone()]));
            }
        }
    }
    if let Some((b, entries)) = current.take() {
        swatches.push(finish_swatch(b, entries, &mut counts));
    }

    // Wire inputs/outputs and heavy strands now that membership is fixed.
    let produced_by: BTreeMap<String, usize> = swatches
        .iter()
        .enumerate()
        .flat_map(|(i, s)| s.bundles.iter().map(move |b| (b.clone(), i)))
        .collect();

    let mut inputs: Vec<BTreeSet<String>> = vec![BTreeSet::new(); swatches.len()];
    let mut outputs: Vec<BTreeSet<String>> = vec![BTreeSet::new(); swatches.len()];

    for (i, swatch) in swatches.iter().enumerate() {
        for entry in &swatch.entries {
            let bundle = match program.bundles.get(&entry.bundle) {
                Some(b) => b,
                None => continue,
            };
            for &strand in &entry.strands {
                let mut reads = BTreeSet::new();
                collect_reads(
                    &bundle.strands[strand as usize].expr,
                    None,
                    program,
                    &mut reads,
                );
                for read in reads {
                    match produced_by.get(&read) {
                        Some(&owner) if owner != i => {
                            inputs[i].insert(read.clone());
                            outputs[owner].insert(read);
                        }
                        Some(_) => {}
                        None => {
                            inputs[i].insert(read);
                        }
                    }
                }
            }
        }
    }

    for (i, swatch) in swatches.iter_mut().enumerate() {
        // Sinks are always consumed by the host.
        for sink in ["display", "play", "scope"] {
            if swatch.bundles.iter().any(|b| b == sink) {
                outputs[i].insert(sink.to_string());
            }
        }
        swatch.inputs = inputs[i].iter().cloned().collect();
        swatch.outputs = outputs[i].iter().cloned().collect();

        for entry in &swatch.entries {
            let bundle = match program.bundles.get(&entry.bundle) {
                Some(b) => b,
                None => continue,
            };
            for &strand in &entry.strands {
                let expr = &bundle.strands[strand as usize].expr;
                if expr.has_call() || expr.node_count() > heavy_threshold {
                    let key = (entry.bundle.clone(), strand);
                    if !swatch.heavy.contains(&key) {
                        swatch.heavy.push(key);
                    }
                }
            }
        }
    }

    swatches
}

fn finish_swatch(
    backend: Backend,
    entries: Vec<ExecEntry>,
    counts: &mut BTreeMap<&'static str, usize>,
) -> Swatch {
    let counter = counts.entry(backend.as_str()).or_insert(0);
    let name = format!("{}{}", backend.as_str(), *counter);
    *counter += 1;

    let mut bundles = Vec::new();
    for entry in &entries {
        if !bundles.contains(&entry.bundle) {
            bundles.push(entry.bundle.clone());
        }
    }

    Swatch {
        name,
        backend,
        entries,
        bundles,
        inputs: Vec::new(),
        outputs: Vec::new(),
        heavy: Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::annotate::annotate;
    use crate::desugar::desugar;
    use crate::ir::lower::lower;
    use crate::ir::sched::schedule;
    use crate::lexer::Lexer;
    use crate::parser::Parser;

    fn swatches_for(source: &str, threshold: usize) -> (Program, Vec<Swatch>) {
        let (tokens, diags) = Lexer::new(source).tokenize();
        assert!(diags.is_empty());
        let file = Parser::new(tokens).parse_file().expect("parse");
        let file = desugar(file).expect("desugar");
        let lowered = lower(&file).expect("lower");
        let mut program = lowered.program;
        program.order = schedule(&program, &lowered.entries).expect("schedule");
        let annotations = annotate(&program).expect("annotate");
        let swatches = build(&program, &annotations, threshold);
        (program, swatches)
    }

    #[test]
    fn test_single_visual_swatch() {
        let (_, swatches) = swatches_for("display[r, g, b] = [me.x, me.y, 0]", 30);
        assert_eq!(swatches.len(), 1);
        assert_eq!(swatches[0].backend, Backend::Visual);
        assert_eq!(swatches[0].name, "visual0");
        assert_eq!(swatches[0].bundles, vec!["display"]);
        assert_eq!(swatches[0].outputs, vec!["display"]);
    }

    #[test]
    fn test_visual_and_audio_split() {
        let (_, swatches) = swatches_for(
            "display[r, g, b] = [me.x, me.y, 0]\nplay[0] = sin(me.i * 0.01)",
            30,
        );
        assert_eq!(swatches.len(), 2);
        let backends: Vec<Backend> = swatches.iter().map(|s| s.backend).collect();
        assert!(backends.contains(&Backend::Visual));
        assert!(backends.contains(&Backend::Audio));
    }

    #[test]
    fn test_cross_unit_buffers() {
        // `scope` taps audio; the visual unit reads it.
        let (_, swatches) = swatches_for(
            "scope[v] = sin(me.i * 0.1)\ndisplay[r, g, b] = [scope.v, me.x, me.y]",
            30,
        );
        let visual = swatches
            .iter()
            .find(|s| s.backend == Backend::Visual)
            .expect("visual unit");
        assert!(visual.inputs.contains(&"scope".to_string()));
        let audio = swatches
            .iter()
            .find(|s| s.backend == Backend::Audio)
            .expect("audio unit");
        assert!(audio.outputs.contains(&"scope".to_string()));
    }

    #[test]
    fn test_consecutive_same_backend_merge() {
        let (_, swatches) = swatches_for(
            "a = me.x\nb = a.0 * 2\ndisplay[r, g, b] = [b.0, a.0, 0]",
            30,
        );
        assert_eq!(swatches.len(), 1);
        assert_eq!(swatches[0].bundles, vec!["a", "b", "display"]);
        // Intra-unit reads are not inputs.
        assert!(swatches[0].inputs.is_empty());
    }

    #[test]
    fn test_heavy_by_call() {
        let (_, swatches) = swatches_for(
            "spindle f(v) { return = [v * 2] }\ndisplay[r, g, b] = [f(me.x), me.y, 0]",
            30,
        );
        assert!(swatches[0]
            .heavy
            .contains(&("display".to_string(), 0)));
        assert!(!swatches[0]
            .heavy
            .contains(&("display".to_string(), 1)));
    }

    #[test]
    fn test_heavy_by_node_count() {
        let (_, swatches) = swatches_for("big = me.x + me.y + me.t + 1 + 2 + 3", 5);
        assert!(swatches[0].heavy.contains(&("big".to_string(), 0)));
        let (_, swatches) = swatches_for("big = me.x + me.y + me.t + 1 + 2 + 3", 30);
        assert!(swatches[0].heavy.is_empty());
    }
}
