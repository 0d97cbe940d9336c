//! Dependency analysis and topological scheduling.
//!
//! The scheduler orders declarations so that within a tick every strand is
//! computed before its readers. Edges come from current-tick free
//! variables. Two edge strengths:
//!
//! - **hard**: an ordinary strand read. Hard edges are strict; a cycle of
//!   hard edges is a fatal circular dependency.
//! - **soft**: a read inside a `cache(...)` value argument. The read
//!   itself is of the previous tick, so a soft edge orders the producer
//!   within a tick when it can, but is dropped when it would close a
//!   cycle against the hard edges.
//!
//! Temporal remaps (`me.t` in the substitution keys) contribute nothing
//! for their base: they are previous-tick reads resolved by the host.

use std::collections::{BTreeSet, HashMap, HashSet};

use petgraph::algo::is_cyclic_directed;
use petgraph::graphmap::DiGraphMap;

use crate::diagnostic::{Diagnostic, Stage};
use crate::ir::{BuiltinFn, ExecEntry, Expr, ExprKind, IndexKey, Program, Spindle};

use super::lower::DeclEntry;

/// Produce the execution order: a depth-first postorder over declarations,
/// visiting in source order, failing on hard-edge cycles.
pub fn schedule(
    program: &Program,
    entries: &[DeclEntry],
) -> Result<Vec<ExecEntry>, Vec<Diagnostic>> {
    // Who produces each strand.
    let mut owner: HashMap<(String, u32), usize> = HashMap::new();
    for (decl_id, entry) in entries.iter().enumerate() {
        for &strand in &entry.strands {
            owner.insert((entry.bundle.clone(), strand), decl_id);
        }
    }

    // Dependency edges, dependent → dependency.
    let mut hard_edges: Vec<(usize, usize)> = Vec::new();
    let mut soft_edges: Vec<(usize, usize)> = Vec::new();
    let mut diagnostics: Vec<Diagnostic> = Vec::new();

    for (decl_id, entry) in entries.iter().enumerate() {
        let bundle = match program.bundles.get(&entry.bundle) {
            Some(b) => b,
            None => continue,
        };
        let mut deps = DepSet::default();
        for &strand in &entry.strands {
            let expr = &bundle.strands[strand as usize].expr;
            collect_deps(expr, None, program, false, &mut deps);
        }
        for (key, soft) in deps.into_edges() {
            if let Some(&target) = owner.get(&key) {
                if target == decl_id {
                    // Self-reference: legal through a cache (recorded on
                    // the descriptor), fatal otherwise.
                    if !soft {
                        diagnostics.push(
                            Diagnostic::error(
                                Stage::Lowering,
                                format!(
                                    "circular dependency: {} -> {}",
                                    entry.bundle, entry.bundle
                                ),
                                entry.span,
                            )
                            .with_help(
                                "break the cycle with `cache(value, size, tap, signal)`, \
                                 which reads the previous tick"
                                    .to_string(),
                            ),
                        );
                    }
                    continue;
                }
                if soft {
                    soft_edges.push((decl_id, target));
                } else {
                    hard_edges.push((decl_id, target));
                }
            }
        }
    }

    if !diagnostics.is_empty() {
        return Err(diagnostics);
    }

    let mut graph: DiGraphMap<usize, ()> = DiGraphMap::new();
    for decl_id in 0..entries.len() {
        graph.add_node(decl_id);
    }
    for &(from, to) in &hard_edges {
        graph.add_edge(from, to, ());
    }

    // Hard edges are strict: any cycle among them is an error.
    detect_hard_cycles(&graph, entries)?;

    // Soft edges order producers when they can; one that would close a
    // cycle is exactly the previous-tick feedback cache exists for.
    for &(from, to) in &soft_edges {
        if graph.contains_edge(from, to) {
            continue;
        }
        graph.add_edge(from, to, ());
        if is_cyclic_directed(&graph) {
            graph.remove_edge(from, to);
        }
    }

    // Depth-first postorder, visiting declarations in source order.
    let mut order: Vec<usize> = Vec::new();
    let mut visited: HashSet<usize> = HashSet::new();
    for decl_id in 0..entries.len() {
        postorder(decl_id, &graph, &mut visited, &mut order);
    }

    Ok(order
        .into_iter()
        .map(|decl_id| ExecEntry {
            bundle: entries[decl_id].bundle.clone(),
            strands: entries[decl_id].strands.clone(),
        })
        .collect())
}

fn postorder(
    node: usize,
    graph: &DiGraphMap<usize, ()>,
    visited: &mut HashSet<usize>,
    order: &mut Vec<usize>,
) {
    if visited.contains(&node) {
        return;
    }
    visited.insert(node);

    let mut neighbors: Vec<usize> = graph
        .neighbors_directed(node, petgraph::Direction::Outgoing)
        .collect();
    neighbors.sort_unstable();
    for next in neighbors {
        postorder(next, graph, visited, order);
    }

    order.push(node);
}

/// Depth-first search over the hard subgraph; a back-edge is a circular
/// dependency, reported with the full cycle path.
fn detect_hard_cycles(
    graph: &DiGraphMap<usize, ()>,
    entries: &[DeclEntry],
) -> Result<(), Vec<Diagnostic>> {
    let mut visited: HashSet<usize> = HashSet::new();
    let mut diagnostics: Vec<Diagnostic> = Vec::new();

    for decl_id in 0..entries.len() {
        if !visited.contains(&decl_id) {
            let mut on_stack: HashSet<usize> = HashSet::new();
            let mut stack: Vec<usize> = Vec::new();
            cycle_dfs(
                decl_id,
                graph,
                entries,
                &mut visited,
                &mut on_stack,
                &mut stack,
                &mut diagnostics,
            );
        }
    }

    if diagnostics.is_empty() {
        Ok(())
    } else {
        Err(diagnostics)
    }
}

fn cycle_dfs(
    node: usize,
    graph: &DiGraphMap<usize, ()>,
    entries: &[DeclEntry],
    visited: &mut HashSet<usize>,
    on_stack: &mut HashSet<usize>,
    stack: &mut Vec<usize>,
    diagnostics: &mut Vec<Diagnostic>,
) {
    visited.insert(node);
    on_stack.insert(node);
    stack.push(node);

    let mut neighbors: Vec<usize> = graph
        .neighbors_directed(node, petgraph::Direction::Outgoing)
        .collect();
    neighbors.sort_unstable();

    for next in neighbors {
        if on_stack.contains(&next) {
            let cycle: Vec<&str> = stack
                .iter()
                .skip_while(|n| **n != next)
                .map(|n| entries[*n].bundle.as_str())
                .chain(std::iter::once(entries[next].bundle.as_str()))
                .collect();
            diagnostics.push(
                Diagnostic::error(
                    Stage::Lowering,
                    format!("circular dependency: {}", cycle.join(" -> ")),
                    entries[node].span,
                )
                .with_help(
                    "break the cycle with `cache(value, size, tap, signal)`, which reads \
                     the previous tick"
                        .to_string(),
                ),
            );
            continue;
        }
        if !visited.contains(&next) {
            cycle_dfs(next, graph, entries, visited, on_stack, stack, diagnostics);
        }
    }

    stack.pop();
    on_stack.remove(&node);
}

// ─── Free-variable collection ─────────────────────────────────────

#[derive(Default)]
struct DepSet {
    hard: BTreeSet<(String, u32)>,
    soft: BTreeSet<(String, u32)>,
}

impl DepSet {
    fn insert(&mut self, key: (String, u32), soft: bool) {
        if soft {
            self.soft.insert(key);
        } else {
            self.hard.insert(key);
        }
    }

    /// (strand, soft) pairs; a strand referenced both ways is hard.
    fn into_edges(self) -> Vec<((String, u32), bool)> {
        let mut out: Vec<((String, u32), bool)> = Vec::new();
        for key in &self.soft {
            if !self.hard.contains(key) {
                out.push((key.clone(), true));
            }
        }
        for key in self.hard {
            out.push((key, false));
        }
        out
    }
}

/// Current-tick strand references of an expression.
///
/// `scope` carries the spindle whose body is being traversed, so spindle
/// locals resolve to their defining expressions instead of being mistaken
/// for globals.
fn collect_deps(
    expr: &Expr,
    scope: Option<&Spindle>,
    program: &Program,
    soft: bool,
    out: &mut DepSet,
) {
    match &expr.kind {
        ExprKind::Num(_) | ExprKind::Param(_) => {}

        ExprKind::Index { bundle, index } => {
            if bundle == "me" {
                return;
            }
            // A spindle-local read depends on whatever the local reads.
            if let Some(spindle) = scope {
                if let Some(local) = spindle.local(bundle) {
                    if let IndexKey::Pos(pos) = index {
                        if let Some(strand) = local.strands.get(*pos as usize) {
                            collect_deps(&strand.expr, scope, program, soft, out);
                        }
                    }
                    return;
                }
            }
            if let IndexKey::Pos(pos) = index {
                out.insert((bundle.clone(), *pos), soft);
            }
        }

        ExprKind::Binary { lhs, rhs, .. } => {
            collect_deps(lhs, scope, program, soft, out);
            collect_deps(rhs, scope, program, soft, out);
        }

        ExprKind::Unary { operand, .. } => collect_deps(operand, scope, program, soft, out),

        ExprKind::Call { spindle, args } => {
            for arg in args {
                collect_deps(arg, scope, program, soft, out);
            }
            if let Some(callee) = program.spindles.get(spindle) {
                for ret in &callee.returns {
                    collect_deps(ret, Some(callee), program, soft, out);
                }
            }
        }

        ExprKind::Builtin { name, args } => {
            if *name == BuiltinFn::Cache {
                // The value argument is pushed after the tick: producers
                // still order, but the read is of the previous tick.
                if let Some(value) = args.first() {
                    collect_deps(value, scope, program, true, out);
                }
                for arg in args.iter().skip(1) {
                    collect_deps(arg, scope, program, soft, out);
                }
            } else {
                for arg in args {
                    collect_deps(arg, scope, program, soft, out);
                }
            }
        }

        ExprKind::Extract { call, .. } => collect_deps(call, scope, program, soft, out),

        ExprKind::Remap {
            base,
            subs,
            temporal,
        } => {
            if !temporal {
                collect_deps(base, scope, program, soft, out);
            }
            for (_, value) in subs {
                collect_deps(value, scope, program, soft, out);
            }
        }

        ExprKind::CacheRead { tap, .. } => collect_deps(tap, scope, program, soft, out),
    }
}
