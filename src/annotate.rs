//! Signal annotations: domain, hardware, purity, backend.
//!
//! The domain of a strand is the set of `me.*` coordinates its value
//! ultimately depends on, followed transitively through strand reads.
//! Hardware and statefulness are properties of the strand's own tree
//! (spindle calls included). The per-bundle union of both decides the
//! backend.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use crate::diagnostic::{Diagnostic, Stage};
use crate::ir::{BuiltinFn, Expr, ExprKind, IndexKey, Program, Spindle};

/// Hardware a strand consumes or a sink drives.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Hardware {
    Camera,
    Microphone,
    Mouse,
    Keyboard,
    Speaker,
    Gpu,
}

impl Hardware {
    pub fn as_str(&self) -> &'static str {
        match self {
            Hardware::Camera => "camera",
            Hardware::Microphone => "microphone",
            Hardware::Mouse => "mouse",
            Hardware::Keyboard => "keyboard",
            Hardware::Speaker => "speaker",
            Hardware::Gpu => "gpu",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Purity {
    Pure,
    Stateful,
    External,
}

impl Purity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Purity::Pure => "pure",
            Purity::Stateful => "stateful",
            Purity::External => "external",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Backend {
    Visual,
    Audio,
}

impl Backend {
    pub fn as_str(&self) -> &'static str {
        match self {
            Backend::Visual => "visual",
            Backend::Audio => "audio",
        }
    }
}

/// Per-bundle annotation summary.
#[derive(Clone, Debug, PartialEq)]
pub struct Annotation {
    /// `me.*` coordinates the bundle's strands depend on, transitively.
    pub domain: BTreeSet<String>,
    pub stateful: bool,
    pub hardware: BTreeSet<Hardware>,
    pub purity: Purity,
    pub backend: Backend,
}

/// Annotate every bundle. Deterministic: equal programs produce equal maps.
pub fn annotate(program: &Program) -> Result<BTreeMap<String, Annotation>, Vec<Diagnostic>> {
    let mut walker = DomainWalker::new(program);
    let mut diagnostics = Vec::new();
    let mut annotations: BTreeMap<String, Annotation> = BTreeMap::new();
    // Bundles whose backend is not forced by domain or hardware.
    let mut ambiguous: Vec<String> = Vec::new();

    for (name, bundle) in &program.bundles {
        let mut domain = BTreeSet::new();
        let mut hardware = BTreeSet::new();
        let mut stateful = false;

        for strand in &bundle.strands {
            domain.extend(walker.domain_of(name, strand.index));
            collect_direct(&strand.expr, None, program, &mut hardware, &mut stateful);
        }

        // Sinks carry their output device.
        match name.as_str() {
            "display" => {
                hardware.insert(Hardware::Gpu);
            }
            "play" => {
                hardware.insert(Hardware::Speaker);
            }
            _ => {}
        }

        let wants_visual = domain.contains("x")
            || domain.contains("y")
            || hardware.contains(&Hardware::Camera)
            || hardware.contains(&Hardware::Gpu);
        let wants_audio = domain.contains("i")
            || hardware.contains(&Hardware::Microphone)
            || hardware.contains(&Hardware::Speaker);

        let backend = match (wants_visual, wants_audio) {
            (true, true) => {
                diagnostics.push(
                    Diagnostic::error(
                        Stage::Codegen,
                        format!(
                            "bundle '{}' mixes pixel and sample signals (domain {{{}}}, hardware {{{}}})",
                            name,
                            domain.iter().cloned().collect::<Vec<_>>().join(", "),
                            hardware
                                .iter()
                                .map(|h| h.as_str())
                                .collect::<Vec<_>>()
                                .join(", ")
                        ),
                        bundle.span,
                    )
                    .with_help(
                        "a strand belongs to exactly one backend; route audio values to \
                         visuals through the `scope` bundle"
                            .to_string(),
                    ),
                );
                Backend::Visual
            }
            (true, false) => Backend::Visual,
            (false, true) => Backend::Audio,
            (false, false) => {
                ambiguous.push(name.clone());
                // Provisional; resolved below by following consumers.
                Backend::Visual
            }
        };

        let purity = if stateful {
            Purity::Stateful
        } else if hardware.iter().any(|h| {
            matches!(
                h,
                Hardware::Camera | Hardware::Microphone | Hardware::Mouse | Hardware::Keyboard
            )
        }) {
            Purity::External
        } else {
            Purity::Pure
        };

        annotations.insert(
            name.clone(),
            Annotation {
                domain,
                stateful,
                hardware,
                purity,
                backend,
            },
        );
    }

    resolve_ambiguous(program, &mut annotations, ambiguous);

    if diagnostics.is_empty() {
        Ok(annotations)
    } else {
        Err(diagnostics)
    }
}

/// Constants follow their downstream sinks: adopt the consumers' backend
/// when it is unanimous, defaulting to visual otherwise. `scope` taps the
/// audio domain and defaults there instead.
fn resolve_ambiguous(
    program: &Program,
    annotations: &mut BTreeMap<String, Annotation>,
    ambiguous: Vec<String>,
) {
    if ambiguous.is_empty() {
        return;
    }

    // bundle → bundles that read it.
    let mut consumers: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
    for (name, bundle) in &program.bundles {
        for strand in &bundle.strands {
            let mut reads: BTreeSet<String> = BTreeSet::new();
            collect_reads(&strand.expr, None, program, &mut reads);
            for read in reads {
                consumers.entry(read).or_default().insert(name.clone());
            }
        }
    }

    let mut pending = ambiguous;
    // Consumers may themselves be ambiguous; take the unanimous backend of
    // the already-decided consumers and iterate until stable.
    loop {
        let pending_set: HashSet<String> = pending.iter().cloned().collect();
        let mut still_pending = Vec::new();
        let mut progressed = false;

        for name in pending {
            let backends: BTreeSet<Backend> = consumers
                .get(&name)
                .map(|cs| {
                    cs.iter()
                        .filter(|c| !pending_set.contains(*c))
                        .filter_map(|c| annotations.get(c).map(|a| a.backend))
                        .collect()
                })
                .unwrap_or_default();

            if backends.len() == 1 {
                let backend = *backends.iter().next().unwrap();
                annotations.get_mut(&name).unwrap().backend = backend;
                progressed = true;
            } else {
                still_pending.push(name);
            }
        }

        pending = still_pending;
        if pending.is_empty() || !progressed {
            break;
        }
    }

    // Anything left keeps the visual default; `scope` taps audio.
    for name in pending {
        if name == "scope" {
            annotations.get_mut(&name).unwrap().backend = Backend::Audio;
        }
    }
}

/// Bundle names read by an expression (spindle calls traversed).
pub(crate) fn collect_reads(
    expr: &Expr,
    scope: Option<&Spindle>,
    program: &Program,
    out: &mut BTreeSet<String>,
) {
    match &expr.kind {
        ExprKind::Num(_) | ExprKind::Param(_) => {}
        ExprKind::Index { bundle, .. } => {
            if bundle == "me" {
                return;
            }
            if let Some(spindle) = scope {
                if let Some(local) = spindle.local(bundle) {
                    for strand in &local.strands {
                        collect_reads(&strand.expr, scope, program, out);
                    }
                    return;
                }
            }
            out.insert(bundle.clone());
        }
        ExprKind::Binary { lhs, rhs, .. } => {
            collect_reads(lhs, scope, program, out);
            collect_reads(rhs, scope, program, out);
        }
        ExprKind::Unary { operand, .. } => collect_reads(operand, scope, program, out),
        ExprKind::Call { spindle, args } => {
            for arg in args {
                collect_reads(arg, scope, program, out);
            }
            if let Some(callee) = program.spindles.get(spindle) {
                for ret in &callee.returns {
                    collect_reads(ret, Some(callee), program, out);
                }
            }
        }
        ExprKind::Builtin { args, .. } => {
            for arg in args {
                collect_reads(arg, scope, program, out);
            }
        }
        ExprKind::Extract { call, .. } => collect_reads(call, scope, program, out),
        ExprKind::Remap { base, subs, .. } => {
            collect_reads(base, scope, program, out);
            for (_, value) in subs {
                collect_reads(value, scope, program, out);
            }
        }
        ExprKind::CacheRead { tap, .. } => collect_reads(tap, scope, program, out),
    }
}

/// Hardware and statefulness of a strand's own tree (calls included,
/// reads of other bundles excluded).
fn collect_direct(
    expr: &Expr,
    scope: Option<&Spindle>,
    program: &Program,
    hardware: &mut BTreeSet<Hardware>,
    stateful: &mut bool,
) {
    match &expr.kind {
        ExprKind::Num(_) | ExprKind::Param(_) => {}
        ExprKind::Index { bundle, .. } => {
            if let Some(spindle) = scope {
                if let Some(local) = spindle.local(bundle) {
                    for strand in &local.strands {
                        collect_direct(&strand.expr, scope, program, hardware, stateful);
                    }
                }
            }
        }
        ExprKind::Binary { lhs, rhs, .. } => {
            collect_direct(lhs, scope, program, hardware, stateful);
            collect_direct(rhs, scope, program, hardware, stateful);
        }
        ExprKind::Unary { operand, .. } => {
            collect_direct(operand, scope, program, hardware, stateful)
        }
        ExprKind::Call { spindle, args } => {
            for arg in args {
                collect_direct(arg, scope, program, hardware, stateful);
            }
            if let Some(callee) = program.spindles.get(spindle) {
                for ret in &callee.returns {
                    collect_direct(ret, Some(callee), program, hardware, stateful);
                }
            }
        }
        ExprKind::Builtin { name, args } => {
            match name {
                BuiltinFn::Camera => {
                    hardware.insert(Hardware::Camera);
                }
                BuiltinFn::Microphone => {
                    hardware.insert(Hardware::Microphone);
                }
                BuiltinFn::Mouse => {
                    hardware.insert(Hardware::Mouse);
                }
                BuiltinFn::Key => {
                    hardware.insert(Hardware::Keyboard);
                }
                BuiltinFn::Texture | BuiltinFn::Load | BuiltinFn::Text => {
                    hardware.insert(Hardware::Gpu);
                }
                BuiltinFn::Cache => {
                    *stateful = true;
                }
                _ => {}
            }
            for arg in args {
                collect_direct(arg, scope, program, hardware, stateful);
            }
        }
        ExprKind::Extract { call, .. } => collect_direct(call, scope, program, hardware, stateful),
        ExprKind::Remap { base, subs, .. } => {
            collect_direct(base, scope, program, hardware, stateful);
            for (_, value) in subs {
                collect_direct(value, scope, program, hardware, stateful);
            }
        }
        ExprKind::CacheRead { tap, .. } => {
            *stateful = true;
            collect_direct(tap, scope, program, hardware, stateful);
        }
    }
}

/// Transitive `me.*` domain computation with memoization; cycles through
/// cache feedback cut to the empty set on re-entry.
pub struct DomainWalker<'a> {
    program: &'a Program,
    memo: HashMap<(String, u32), BTreeSet<String>>,
    visiting: HashSet<(String, u32)>,
}

impl<'a> DomainWalker<'a> {
    pub fn new(program: &'a Program) -> Self {
        Self {
            program,
            memo: HashMap::new(),
            visiting: HashSet::new(),
        }
    }

    /// Domain of one strand.
    pub fn domain_of(&mut self, bundle: &str, strand: u32) -> BTreeSet<String> {
        let key = (bundle.to_string(), strand);
        if let Some(cached) = self.memo.get(&key) {
            return cached.clone();
        }
        if self.visiting.contains(&key) {
            return BTreeSet::new();
        }
        self.visiting.insert(key.clone());

        let program = self.program;
        let mut domain = BTreeSet::new();
        if let Some(b) = program.bundles.get(bundle) {
            if let Some(s) = b.strands.get(strand as usize) {
                self.expr_domain(&s.expr, None, &mut domain);
            }
        }

        self.visiting.remove(&key);
        self.memo.insert(key, domain.clone());
        domain
    }

    /// Domain of a free expression (used by the cache extractor for the
    /// signal argument).
    pub fn domain_of_expr(&mut self, expr: &Expr) -> BTreeSet<String> {
        let mut domain = BTreeSet::new();
        self.expr_domain(expr, None, &mut domain);
        domain
    }

    fn expr_domain(&mut self, expr: &Expr, scope: Option<&'a Spindle>, out: &mut BTreeSet<String>) {
        let program = self.program;
        match &expr.kind {
            ExprKind::Num(_) | ExprKind::Param(_) => {}
            ExprKind::Index { bundle, index } => {
                if bundle == "me" {
                    if let IndexKey::Field(field) = index {
                        out.insert(field.clone());
                    }
                    return;
                }
                // `scope` is the sanctioned audio→visual tap: the host
                // snapshots it per frame, so reading it imports no domain.
                if bundle == "scope" {
                    return;
                }
                if let Some(spindle) = scope {
                    if let Some(local) = spindle.local(bundle) {
                        if let IndexKey::Pos(pos) = index {
                            if let Some(strand) = local.strands.get(*pos as usize) {
                                self.expr_domain(&strand.expr, scope, out);
                            }
                        }
                        return;
                    }
                }
                if let IndexKey::Pos(pos) = index {
                    out.extend(self.domain_of(bundle, *pos));
                }
            }
            ExprKind::Binary { lhs, rhs, .. } => {
                self.expr_domain(lhs, scope, out);
                self.expr_domain(rhs, scope, out);
            }
            ExprKind::Unary { operand, .. } => self.expr_domain(operand, scope, out),
            ExprKind::Call { spindle, args } => {
                for arg in args {
                    self.expr_domain(arg, scope, out);
                }
                if let Some(callee) = program.spindles.get(spindle) {
                    for ret in &callee.returns {
                        self.expr_domain(ret, Some(callee), out);
                    }
                }
            }
            ExprKind::Builtin { args, .. } => {
                for arg in args {
                    self.expr_domain(arg, scope, out);
                }
            }
            ExprKind::Extract { call, .. } => self.expr_domain(call, scope, out),
            ExprKind::Remap { base, subs, .. } => {
                self.expr_domain(base, scope, out);
                for (_, value) in subs {
                    self.expr_domain(value, scope, out);
                }
            }
            ExprKind::CacheRead { tap, .. } => self.expr_domain(tap, scope, out),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::desugar::desugar;
    use crate::ir::lower::lower;
    use crate::lexer::Lexer;
    use crate::parser::Parser;

    fn annotated(source: &str) -> BTreeMap<String, Annotation> {
        let (tokens, diags) = Lexer::new(source).tokenize();
        assert!(diags.is_empty());
        let file = Parser::new(tokens).parse_file().expect("parse");
        let file = desugar(file).expect("desugar");
        let lowered = lower(&file).expect("lower");
        annotate(&lowered.program).unwrap_or_else(|errs| {
            panic!(
                "annotation errors: {:?}",
                errs.iter().map(|e| &e.message).collect::<Vec<_>>()
            )
        })
    }

    fn domain(a: &Annotation) -> Vec<&str> {
        a.domain.iter().map(|s| s.as_str()).collect()
    }

    #[test]
    fn test_visual_scenario() {
        // Scenario 1.
        let ann = annotated("display[r, g, b] = [me.x, me.y, fract(me.t)]");
        let display = &ann["display"];
        assert_eq!(display.backend, Backend::Visual);
        assert_eq!(domain(display), vec!["t", "x", "y"]);
        assert!(!display.stateful);
    }

    #[test]
    fn test_audio_scenario() {
        // Scenario 2.
        let ann = annotated("play[0] = sin(me.i / me.sampleRate * 440 * 6.28318) * 0.3");
        let play = &ann["play"];
        assert_eq!(play.backend, Backend::Audio);
        assert_eq!(domain(play), vec!["i", "sampleRate"]);
        assert_eq!(play.purity, Purity::Pure);
    }

    #[test]
    fn test_domain_is_transitive() {
        let ann = annotated("base = me.x * 2\nmid = base.0 + 1\ndisplay[r, g, b] = [mid.0, 0, 0]");
        assert_eq!(domain(&ann["mid"]), vec!["x"]);
        assert_eq!(domain(&ann["display"]), vec!["x"]);
    }

    #[test]
    fn test_stateful_flag() {
        let ann = annotated("trail.v = cache(current.v, 2, 1, me.t)\ncurrent.v = me.x");
        assert!(ann["trail"].stateful);
        assert_eq!(ann["trail"].purity, Purity::Stateful);
        assert!(!ann["current"].stateful);
    }

    #[test]
    fn test_hardware_external_purity() {
        let ann = annotated("cam = camera(me.x, me.y)\nptr = mouse()");
        assert!(ann["cam"].hardware.contains(&Hardware::Camera));
        assert_eq!(ann["cam"].purity, Purity::External);
        assert!(ann["ptr"].hardware.contains(&Hardware::Mouse));
        assert_eq!(ann["ptr"].purity, Purity::External);
    }

    #[test]
    fn test_sinks_get_output_hardware() {
        let ann = annotated("display[r, g, b] = [1, 1, 1]\nplay[0] = 0");
        assert!(ann["display"].hardware.contains(&Hardware::Gpu));
        assert_eq!(ann["display"].backend, Backend::Visual);
        assert!(ann["play"].hardware.contains(&Hardware::Speaker));
        assert_eq!(ann["play"].backend, Backend::Audio);
    }

    #[test]
    fn test_constant_follows_consumer() {
        let ann = annotated("volume = 0.5\nplay[0] = sin(me.i) * volume.0");
        assert_eq!(ann["volume"].backend, Backend::Audio);
    }

    #[test]
    fn test_constant_defaults_to_visual() {
        let ann = annotated("orphan = 42");
        assert_eq!(ann["orphan"].backend, Backend::Visual);
    }

    #[test]
    fn test_annotation_is_deterministic() {
        let source = "a = me.x\nb = a.0 * 2\ndisplay[r, g, b] = [b.0, a.0, me.t]\nplay[0] = sin(me.i)";
        assert_eq!(annotated(source), annotated(source));
    }

    #[test]
    fn test_error_mixed_backends() {
        let (tokens, _) = Lexer::new("bad = me.x + me.i").tokenize();
        let file = Parser::new(tokens).parse_file().expect("parse");
        let file = desugar(file).expect("desugar");
        let lowered = lower(&file).expect("lower");
        let errs = annotate(&lowered.program).expect_err("expected backend conflict");
        assert!(errs[0].message.contains("mixes pixel and sample"));
    }

    #[test]
    fn test_feedback_domain_terminates() {
        let ann = annotated("fb.v = cache(fb.v, 4, 1, me.t) * 0.9 + me.x");
        assert!(ann["fb"].domain.contains("x"));
        assert!(ann["fb"].stateful);
    }
}
