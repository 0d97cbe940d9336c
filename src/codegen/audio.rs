//! Audio units: IR trees interpreted per sample.
//!
//! Audio strands are not compiled; the host drives `AudioInterp` once per
//! sample with the coordinates `{i, t, sampleRate}`. Cache ring buffers
//! live inside the interpreter: each tick reads previous values and the
//! producers are pushed after the tick completes, matching the visual
//! backend's push-after-tick contract.

use std::collections::{BTreeMap, HashMap, VecDeque};

use crate::annotate::Backend;
use crate::cache::CacheDescriptor;
use crate::ir::{BinOp, Bundle, BuiltinFn, Expr, ExprKind, IndexKey, Program, Spindle, UnOp};
use crate::swatch::Swatch;

/// One strand of an audio unit, in execution order.
#[derive(Clone, Debug)]
pub struct AudioStrand {
    pub bundle: String,
    pub index: u32,
    pub expr: Expr,
}

/// The interpretable form of an audio swatch.
#[derive(Clone, Debug)]
pub struct AudioUnit {
    pub name: String,
    pub strands: Vec<AudioStrand>,
}

/// Collect the swatch's strands in execution order.
pub fn build_unit(program: &Program, swatch: &Swatch) -> AudioUnit {
    let mut strands = Vec::new();
    for entry in &swatch.entries {
        if let Some(bundle) = program.bundles.get(&entry.bundle) {
            for &index in &entry.strands {
                strands.push(AudioStrand {
                    bundle: entry.bundle.clone(),
                    index,
                    expr: bundle.strands[index as usize].expr.clone(),
                });
            }
        }
    }
    AudioUnit {
        name: swatch.name.clone(),
        strands,
    }
}

/// Host-provided data sources for audio evaluation.
pub trait AudioInputs {
    /// Microphone sample at a relative offset, per channel.
    fn microphone(&self, _offset: f64, _channel: u32) -> f64 {
        0.0
    }
    /// Sample of a loaded audio resource.
    fn sample(&self, _resource: u32, _offset: f64, _channel: u32) -> f64 {
        0.0
    }
    fn key(&self, _code: f64) -> f64 {
        0.0
    }
    fn mouse(&self, _channel: u32) -> f64 {
        0.0
    }
    /// Cross-unit buffer value (shared constants computed elsewhere).
    fn buffer(&self, _bundle: &str, _index: u32) -> f64 {
        0.0
    }
}

/// Inputs that return silence and zeros; useful for tests and warm-up.
pub struct NullInputs;

impl AudioInputs for NullInputs {}

/// Per-sample evaluator with cache ring state.
pub struct AudioInterp<'p> {
    bundles: &'p BTreeMap<String, Bundle>,
    spindles: &'p BTreeMap<String, Spindle>,
    unit: &'p AudioUnit,
    /// Audio-domain descriptors, with their ring buffers. Front = value
    /// pushed after the most recent completed tick.
    descriptors: Vec<CacheDescriptor>,
    rings: BTreeMap<String, VecDeque<f64>>,
    sample_rate: f64,
    sample_index: u64,
}

impl<'p> AudioInterp<'p> {
    pub fn new(
        bundles: &'p BTreeMap<String, Bundle>,
        spindles: &'p BTreeMap<String, Spindle>,
        unit: &'p AudioUnit,
        descriptors: &[CacheDescriptor],
        sample_rate: f64,
    ) -> Self {
        let descriptors: Vec<CacheDescriptor> = descriptors
            .iter()
            .filter(|d| d.domain == Backend::Audio)
            .cloned()
            .collect();
        let rings = descriptors
            .iter()
            .map(|d| {
                (
                    d.id.clone(),
                    VecDeque::from(vec![0.0; d.history_size as usize]),
                )
            })
            .collect();
        Self {
            bundles,
            spindles,
            unit,
            descriptors,
            rings,
            sample_rate,
            sample_index: 0,
        }
    }

    pub fn sample_index(&self) -> u64 {
        self.sample_index
    }

    /// Evaluate one tick: every strand in execution order, then the cache
    /// producers, then advance the sample counter.
    pub fn tick(&mut self, inputs: &dyn AudioInputs) -> BTreeMap<(String, u32), f64> {
        let mut frame: BTreeMap<(String, u32), f64> = BTreeMap::new();

        for strand in &self.unit.strands {
            let ctx = EvalCtx {
                frame: &frame,
                inputs,
                params: HashMap::new(),
                spindle: None,
                overrides: HashMap::new(),
            };
            let value = self.eval(&strand.expr, &ctx);
            frame.insert((strand.bundle.clone(), strand.index), value);
        }

        // Push producers after the tick so the next tick reads this one.
        let mut pushes: Vec<(String, f64)> = Vec::new();
        for descriptor in &self.descriptors {
            let ctx = EvalCtx {
                frame: &frame,
                inputs,
                params: HashMap::new(),
                spindle: None,
                overrides: HashMap::new(),
            };
            pushes.push((descriptor.id.clone(), self.eval(&descriptor.producer, &ctx)));
        }
        for (id, value) in pushes {
            if let Some(ring) = self.rings.get_mut(&id) {
                ring.push_front(value);
                ring.pop_back();
            }
        }

        self.sample_index += 1;
        frame
    }

    /// Convenience: one tick, returning the `play` sink's channels.
    pub fn play(&mut self, inputs: &dyn AudioInputs) -> Vec<f64> {
        let frame = self.tick(inputs);
        let width = self
            .bundles
            .get("play")
            .map(|b| b.width())
            .unwrap_or(0);
        (0..width as u32)
            .map(|i| frame.get(&("play".to_string(), i)).copied().unwrap_or(0.0))
            .collect()
    }

    // ─── Evaluation ───────────────────────────────────────────────

    fn eval(&self, expr: &Expr, ctx: &EvalCtx) -> f64 {
        match &expr.kind {
            ExprKind::Num(n) => *n,

            ExprKind::Param(name) => ctx.params.get(name).copied().unwrap_or(0.0),

            ExprKind::Index { bundle, index } => self.eval_index(bundle, index, ctx),

            ExprKind::Binary { op, lhs, rhs } => {
                let l = self.eval(lhs, ctx);
                let r = self.eval(rhs, ctx);
                match op {
                    BinOp::Add => l + r,
                    BinOp::Sub => l - r,
                    BinOp::Mul => l * r,
                    BinOp::Div => l / r,
                    BinOp::Rem => l - r * (l / r).floor(),
                    BinOp::Pow => l.powf(r),
                    BinOp::Lt => bool_f(l < r),
                    BinOp::Gt => bool_f(l > r),
                    BinOp::Le => bool_f(l <= r),
                    BinOp::Ge => bool_f(l >= r),
                    BinOp::Eq => bool_f(l == r),
                    BinOp::Ne => bool_f(l != r),
                    BinOp::And => bool_f(l != 0.0 && r != 0.0),
                    BinOp::Or => bool_f(l != 0.0 || r != 0.0),
                }
            }

            ExprKind::Unary { op, operand } => {
                let o = self.eval(operand, ctx);
                match op {
                    UnOp::Neg => -o,
                    UnOp::Not => bool_f(o == 0.0),
                }
            }

            ExprKind::Extract { call, index } => {
                let (spindle, args) = match &call.kind {
                    ExprKind::Call { spindle, args } => (spindle, args),
                    _ => return 0.0,
                };
                let callee = match self.spindles.get(spindle) {
                    Some(s) => s,
                    None => return 0.0,
                };
                let mut params = HashMap::new();
                for (param, arg) in callee.params.iter().zip(args) {
                    params.insert(param.clone(), self.eval(arg, ctx));
                }
                let inner = EvalCtx {
                    frame: ctx.frame,
                    inputs: ctx.inputs,
                    params,
                    spindle: Some(callee),
                    overrides: ctx.overrides.clone(),
                };
                match callee.returns.get(*index as usize) {
                    Some(ret) => self.eval(ret, &inner),
                    None => 0.0,
                }
            }

            ExprKind::Call { .. } => 0.0,

            ExprKind::Builtin { name, args } => self.eval_builtin(*name, args, ctx),

            ExprKind::Remap {
                base,
                subs,
                temporal,
            } => {
                // Temporal remaps are rejected during generation.
                if *temporal {
                    return 0.0;
                }
                let mut overrides = ctx.overrides.clone();
                for (key, value) in subs {
                    overrides.insert(key.clone(), self.eval(value, ctx));
                }
                let inner = EvalCtx {
                    frame: ctx.frame,
                    inputs: ctx.inputs,
                    params: ctx.params.clone(),
                    spindle: ctx.spindle,
                    overrides,
                };
                self.eval(base, &inner)
            }

            ExprKind::CacheRead { id, tap } => {
                let ring = match self.rings.get(id) {
                    Some(ring) => ring,
                    None => return 0.0,
                };
                let tap = self.eval(tap, ctx).round();
                let tap = tap.clamp(1.0, ring.len() as f64) as usize;
                ring.get(tap - 1).copied().unwrap_or(0.0)
            }
        }
    }

    fn eval_index(&self, bundle: &str, index: &IndexKey, ctx: &EvalCtx) -> f64 {
        let key = format!("{}.{}", bundle, index);
        if let Some(value) = ctx.overrides.get(&key) {
            return *value;
        }

        if bundle == "me" {
            return match index {
                IndexKey::Field(field) => match field.as_str() {
                    "i" => self.sample_index as f64,
                    "t" => self.sample_index as f64 / self.sample_rate,
                    "sampleRate" => self.sample_rate,
                    "duration" => 0.0,
                    _ => 0.0,
                },
                IndexKey::Pos(_) => 0.0,
            };
        }

        let pos = match index {
            IndexKey::Pos(pos) => *pos,
            IndexKey::Field(_) => return 0.0,
        };

        if let Some(spindle) = ctx.spindle {
            if let Some(local) = spindle.local(bundle) {
                return match local.strands.get(pos as usize) {
                    Some(strand) => self.eval(&strand.expr, ctx),
                    None => 0.0,
                };
            }
        }

        // Under a remap, re-evaluate the strand so the substitution reaches
        // the coordinates it closes over.
        if !ctx.overrides.is_empty() {
            if let Some(b) = self.bundles.get(bundle) {
                if let Some(strand) = b.strands.get(pos as usize) {
                    let plain = EvalCtx {
                        frame: ctx.frame,
                        inputs: ctx.inputs,
                        params: HashMap::new(),
                        spindle: None,
                        overrides: ctx.overrides.clone(),
                    };
                    return self.eval(&strand.expr, &plain);
                }
            }
        }

        if let Some(value) = ctx.frame.get(&(bundle.to_string(), pos)) {
            return *value;
        }

        ctx.inputs.buffer(bundle, pos)
    }

    fn eval_builtin(&self, name: BuiltinFn, args: &[Expr], ctx: &EvalCtx) -> f64 {
        use BuiltinFn::*;
        let arg = |i: usize| -> f64 {
            args.get(i).map(|a| self.eval(a, ctx)).unwrap_or(0.0)
        };

        match name {
            Sin => arg(0).sin(),
            Cos => arg(0).cos(),
            Tan => arg(0).tan(),
            Asin => arg(0).asin(),
            Acos => arg(0).acos(),
            Atan => arg(0).atan(),
            Abs => arg(0).abs(),
            Floor => arg(0).floor(),
            Ceil => arg(0).ceil(),
            Round => arg(0).round(),
            Sqrt => arg(0).sqrt(),
            Exp => arg(0).exp(),
            Log => arg(0).ln(),
            Log2 => arg(0).log2(),
            Sign => {
                let x = arg(0);
                if x > 0.0 {
                    1.0
                } else if x < 0.0 {
                    -1.0
                } else {
                    0.0
                }
            }
            Fract => {
                let x = arg(0);
                x - x.floor()
            }
            Atan2 => arg(0).atan2(arg(1)),
            Pow => arg(0).powf(arg(1)),
            Mod => {
                let (a, b) = (arg(0), arg(1));
                a - b * (a / b).floor()
            }
            Min => arg(0).min(arg(1)),
            Max => arg(0).max(arg(1)),
            Step => bool_f(arg(1) >= arg(0)),
            Clamp => arg(0).clamp(arg(1), arg(2)),
            Lerp => {
                let (a, b, t) = (arg(0), arg(1), arg(2));
                a + (b - a) * t
            }
            Smoothstep => {
                let (e0, e1, x) = (arg(0), arg(1), arg(2));
                let t = ((x - e0) / (e1 - e0)).clamp(0.0, 1.0);
                t * t * (3.0 - 2.0 * t)
            }
            Select => {
                // Nearest integer, clamped at the boundaries.
                let count = args.len().saturating_sub(1);
                if count == 0 {
                    return 0.0;
                }
                let idx = arg(0).round().clamp(0.0, (count - 1) as f64) as usize;
                arg(idx + 1)
            }
            Osc => {
                let t = self.sample_index as f64 / self.sample_rate;
                (std::f64::consts::TAU * arg(0) * t).sin()
            }
            Noise => {
                let (x, y) = (arg(0), if args.len() > 1 { arg(1) } else { 0.0 });
                let v = (x * 12.9898 + y * 78.233).sin() * 43758.5453;
                v - v.floor()
            }
            Microphone => {
                // [offset, channel]
                let channel = args
                    .last()
                    .map(|a| self.eval(a, ctx) as u32)
                    .unwrap_or(0);
                ctx.inputs.microphone(arg(0), channel)
            }
            Sample => {
                // [id, offset?, channel]; offset defaults to the sample clock.
                let id = arg(0) as u32;
                let channel = args
                    .last()
                    .map(|a| self.eval(a, ctx) as u32)
                    .unwrap_or(0);
                let offset = if args.len() > 2 {
                    arg(1)
                } else {
                    self.sample_index as f64
                };
                ctx.inputs.sample(id, offset, channel)
            }
            Mouse => ctx.inputs.mouse(arg(0) as u32),
            Key => ctx.inputs.key(arg(0)),
            // Visual-only and pre-extraction constructs are rejected
            // during generation.
            Camera | Texture | Load | Text | Cache => 0.0,
        }
    }
}

struct EvalCtx<'a> {
    frame: &'a BTreeMap<(String, u32), f64>,
    inputs: &'a dyn AudioInputs,
    params: HashMap<String, f64>,
    spindle: Option<&'a Spindle>,
    overrides: HashMap<String, f64>,
}

fn bool_f(b: bool) -> f64 {
    if b {
        1.0
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::annotate::annotate;
    use crate::cache::extract;
    use crate::desugar::desugar;
    use crate::ir::lower::lower;
    use crate::ir::sched::schedule;
    use crate::lexer::Lexer;
    use crate::parser::Parser;
    use crate::swatch;

    fn audio_setup(source: &str) -> (Program, AudioUnit, Vec<CacheDescriptor>) {
        let (tokens, diags) = Lexer::new(source).tokenize();
        assert!(diags.is_empty());
        let file = Parser::new(tokens).parse_file().expect("parse");
        let file = desugar(file).expect("desugar");
        let lowered = lower(&file).expect("lower");
        let mut program = lowered.program;
        program.order = schedule(&program, &lowered.entries).expect("schedule");
        let annotations = annotate(&program).expect("annotate");
        let swatches = swatch::build(&program, &annotations, 30);
        let descriptors = extract(&mut program, &annotations).expect("extract");
        let unit = swatches
            .iter()
            .find(|s| s.backend == Backend::Audio)
            .map(|s| build_unit(&program, s))
            .expect("audio swatch");
        (program, unit, descriptors)
    }

    #[test]
    fn test_sine_scenario() {
        // Scenario 2.
        let (program, unit, descriptors) =
            audio_setup("play[0] = sin(me.i / me.sampleRate * 440 * 6.28318) * 0.3");
        let mut interp =
            AudioInterp::new(&program.bundles, &program.spindles, &unit, &descriptors, 48000.0);

        let first = interp.play(&NullInputs);
        assert_eq!(first.len(), 1);
        assert!(first[0].abs() < 1e-12, "sample 0 of a sine is 0");

        let second = interp.play(&NullInputs);
        let expected = (1.0f64 / 48000.0 * 440.0 * 6.28318).sin() * 0.3;
        assert!((second[0] - expected).abs() < 1e-12);
    }

    #[test]
    fn test_sample_clock_advances() {
        let (program, unit, descriptors) = audio_setup("play[0] = me.i");
        let mut interp = AudioInterp::new(&program.bundles, &program.spindles, &unit, &descriptors, 44100.0);
        assert_eq!(interp.play(&NullInputs)[0], 0.0);
        assert_eq!(interp.play(&NullInputs)[0], 1.0);
        assert_eq!(interp.play(&NullInputs)[0], 2.0);
    }

    #[test]
    fn test_cache_reads_previous_tick() {
        let (program, unit, descriptors) =
            audio_setup("play[0] = cache(me.i, 4, 1, me.i)");
        let mut interp = AudioInterp::new(&program.bundles, &program.spindles, &unit, &descriptors, 44100.0);
        // Tick 0 reads the zero-initialized ring; tick n reads n - 1.
        assert_eq!(interp.play(&NullInputs)[0], 0.0);
        assert_eq!(interp.play(&NullInputs)[0], 0.0);
        assert_eq!(interp.play(&NullInputs)[0], 1.0);
        assert_eq!(interp.play(&NullInputs)[0], 2.0);
    }

    #[test]
    fn test_cache_feedback_accumulates() {
        let (program, unit, descriptors) =
            audio_setup("play[0] = cache(play.0, 2, 1, me.i) + 1");
        let mut interp = AudioInterp::new(&program.bundles, &program.spindles, &unit, &descriptors, 44100.0);
        assert_eq!(interp.play(&NullInputs)[0], 1.0);
        assert_eq!(interp.play(&NullInputs)[0], 2.0);
        assert_eq!(interp.play(&NullInputs)[0], 3.0);
    }

    #[test]
    fn test_deeper_tap() {
        let (program, unit, descriptors) =
            audio_setup("play[0] = cache(me.i, 3, 3, me.i)");
        let mut interp = AudioInterp::new(&program.bundles, &program.spindles, &unit, &descriptors, 44100.0);
        // Tap 3 reads three ticks back.
        assert_eq!(interp.play(&NullInputs)[0], 0.0); // ring still zeroed
        assert_eq!(interp.play(&NullInputs)[0], 0.0);
        assert_eq!(interp.play(&NullInputs)[0], 0.0);
        assert_eq!(interp.play(&NullInputs)[0], 0.0); // pushed at tick 0
        assert_eq!(interp.play(&NullInputs)[0], 1.0); // pushed at tick 1
    }

    #[test]
    fn test_select_clamps() {
        let (program, unit, descriptors) =
            audio_setup("opts[a, b] = [1, 2]\nplay[0] = opts.(me.i) * 0.5");
        let mut interp = AudioInterp::new(&program.bundles, &program.spindles, &unit, &descriptors, 44100.0);
        assert_eq!(interp.play(&NullInputs)[0], 0.5);
        assert_eq!(interp.play(&NullInputs)[0], 1.0);
        // Index 2 clamps to the last option.
        assert_eq!(interp.play(&NullInputs)[0], 1.0);
    }

    #[test]
    fn test_spindle_call_evaluates() {
        let (program, unit, descriptors) = audio_setup(
            "spindle gain(v, k) { return = [v * k] }\nplay[0] = gain(me.i, 0.5)",
        );
        let mut interp = AudioInterp::new(&program.bundles, &program.spindles, &unit, &descriptors, 44100.0);
        assert_eq!(interp.play(&NullInputs)[0], 0.0);
        assert_eq!(interp.play(&NullInputs)[0], 0.5);
        assert_eq!(interp.play(&NullInputs)[0], 1.0);
    }

    #[test]
    fn test_remap_substitutes_coordinates() {
        let (program, unit, descriptors) = audio_setup(
            "base.v = me.i * 2\nplay[0] = base.v[me.i ~ 10] * 0.5",
        );
        let mut interp = AudioInterp::new(&program.bundles, &program.spindles, &unit, &descriptors, 44100.0);
        // base.v re-evaluates with me.i replaced by 10.
        assert_eq!(interp.play(&NullInputs)[0], 10.0);
        assert_eq!(interp.play(&NullInputs)[0], 10.0);
    }

    #[test]
    fn test_stereo_play() {
        let (program, unit, descriptors) =
            audio_setup("play[l, r] = [me.i * 0.001, me.i * 0.002]");
        let mut interp = AudioInterp::new(&program.bundles, &program.spindles, &unit, &descriptors, 44100.0);
        interp.play(&NullInputs);
        let frame = interp.play(&NullInputs);
        assert_eq!(frame, vec![0.001, 0.002]);
    }
}
