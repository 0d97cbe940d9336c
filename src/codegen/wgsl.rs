//! WGSL kernel emission for visual swatches.
//!
//! One compute thread per pixel. The unit's strands emit as straight-line
//! `let` bindings in execution order; cross-unit reads become storage
//! buffer loads, resource reads become texture samples, and cache reads
//! index host-owned ring buffers. Spindle calls are inlined (no recursion
//! exists after lowering, so inlining always terminates).
//!
//! Buffer layout contract with the host:
//! - visual bundle buffers: `value[pixel * width + strand]`, row 0 at the
//!   bottom of the canvas;
//! - audio/constant input buffers: `value[strand]`, one scalar per strand;
//! - cache buffers: `value[(tap - 1) * pixels + pixel]`, tap 1 = most
//!   recent completed tick; the kernel writes `push_*` buffers that the
//!   host rolls into the ring after the tick.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use crate::annotate::{Annotation, Backend};
use crate::cache::CacheDescriptor;
use crate::diagnostic::{Diagnostic, Stage};
use crate::ir::{BinOp, BuiltinFn, Expr, ExprKind, IndexKey, Program, UnOp};
use crate::span::Span;
use crate::swatch::Swatch;

/// Emit a complete WGSL compute kernel for one visual swatch.
pub fn emit_kernel(
    program: &Program,
    annotations: &BTreeMap<String, Annotation>,
    swatch: &Swatch,
    descriptors: &[CacheDescriptor],
) -> Result<String, Vec<Diagnostic>> {
    let mut emitter = KernelEmitter {
        program,
        annotations,
        swatch,
        descriptors,
        locals: HashMap::new(),
        diagnostics: Vec::new(),
        uses_sampler: false,
        uses_camera: false,
        uses_keys: false,
        uses_mod: false,
        uses_osc: false,
        uses_noise: false,
        used_textures: BTreeSet::new(),
        used_text: BTreeSet::new(),
        used_caches: BTreeSet::new(),
        prev_bundles: BTreeSet::new(),
    };
    emitter.emit()
}

struct KernelEmitter<'a> {
    program: &'a Program,
    annotations: &'a BTreeMap<String, Annotation>,
    swatch: &'a Swatch,
    descriptors: &'a [CacheDescriptor],
    /// Strand → emitted local name, filled in execution order.
    locals: HashMap<(String, u32), String>,
    diagnostics: Vec<Diagnostic>,
    uses_sampler: bool,
    uses_camera: bool,
    uses_keys: bool,
    uses_mod: bool,
    uses_osc: bool,
    uses_noise: bool,
    used_textures: BTreeSet<u32>,
    used_text: BTreeSet<u32>,
    used_caches: BTreeSet<String>,
    /// Bundles read through temporal remaps (previous-frame copies).
    prev_bundles: BTreeSet<String>,
}

/// Scopes visible while emitting one expression.
#[derive(Clone, Default)]
struct EmitEnv {
    /// Spindle parameter → emitted argument text.
    params: HashMap<String, String>,
    /// Spindle whose body is being inlined.
    spindle: Option<String>,
    /// Remap substitutions: `me.x` / `bundle.2` → emitted text.
    overrides: HashMap<String, String>,
}

impl<'a> KernelEmitter<'a> {
    fn emit(mut self) -> Result<String, Vec<Diagnostic>> {
        // Body first: emission discovers which bindings the prelude needs.
        let mut body = String::new();
        let env = EmitEnv::default();

        for entry in &self.swatch.entries {
            let bundle = match self.program.bundles.get(&entry.bundle) {
                Some(b) => b,
                None => continue,
            };
            for &index in &entry.strands {
                let strand = &bundle.strands[index as usize];
                let value = self.emit_expr(&strand.expr, &env);
                let local = format!("s_{}_{}", san(&entry.bundle), index);
                body.push_str(&format!("    let {}: f32 = {};\n", local, value));
                self.locals.insert((entry.bundle.clone(), index), local);
            }
        }

        // Output writes.
        body.push('\n');
        for output in &self.swatch.outputs {
            let bundle = match self.program.bundles.get(output) {
                Some(b) => b,
                None => continue,
            };
            let width = bundle.width();
            for strand in &bundle.strands {
                if let Some(local) = self.locals.get(&(output.clone(), strand.index)) {
                    body.push_str(&format!(
                        "    out_{}[pixel * {}u + {}u] = {};\n",
                        san(output),
                        width,
                        strand.index,
                        local
                    ));
                }
            }
        }

        // Cache producers: computed this tick, rolled into the ring by the
        // host after the tick completes.
        for descriptor in self.descriptors {
            if descriptor.domain != Backend::Visual {
                continue;
            }
            if !self.swatch.bundles.contains(&descriptor.owner) {
                continue;
            }
            let producer = descriptor.producer.clone();
            let value = self.emit_expr(&producer, &env);
            self.used_caches.insert(descriptor.id.clone());
            body.push_str(&format!(
                "    push_{}[pixel] = {};\n",
                san(&descriptor.id),
                value
            ));
        }

        if !self.diagnostics.is_empty() {
            return Err(self.diagnostics);
        }

        Ok(self.assemble(body))
    }

    /// Put the prelude, bindings, and main function around the body.
    fn assemble(&self, body: String) -> String {
        let mut out = String::new();
        out.push_str(&format!("// swatch {} (visual)\n\n", self.swatch.name));

        out.push_str(
            "struct Globals {\n    width: f32,\n    height: f32,\n    time: f32,\n    frame: f32,\n    mouse_x: f32,\n    mouse_y: f32,\n    mouse_down: f32,\n    pad: f32,\n}\n\n",
        );

        // group(0): globals, sampler, key state.
        out.push_str("@group(0) @binding(0) var<uniform> globals: Globals;\n");
        if self.uses_sampler {
            out.push_str("@group(0) @binding(1) var samp: sampler;\n");
        }
        if self.uses_keys {
            out.push_str("@group(0) @binding(2) var<storage, read> keys: array<f32>;\n");
        }

        // group(1): textures.
        let mut binding = 0;
        if self.uses_camera {
            out.push_str(&format!(
                "@group(1) @binding({}) var tex_camera: texture_2d<f32>;\n",
                binding
            ));
            binding += 1;
        }
        for id in &self.used_textures {
            out.push_str(&format!(
                "@group(1) @binding({}) var tex_img_{}: texture_2d<f32>;\n",
                binding, id
            ));
            binding += 1;
        }
        for id in &self.used_text {
            out.push_str(&format!(
                "@group(1) @binding({}) var tex_txt_{}: texture_2d<f32>;\n",
                binding, id
            ));
            binding += 1;
        }

        // group(2): read-only inputs.
        let mut binding = 0;
        for input in &self.swatch.inputs {
            out.push_str(&format!(
                "@group(2) @binding({}) var<storage, read> in_{}: array<f32>;\n",
                binding,
                san(input)
            ));
            binding += 1;
        }
        for bundle in &self.prev_bundles {
            out.push_str(&format!(
                "@group(2) @binding({}) var<storage, read> prev_{}: array<f32>;\n",
                binding,
                san(bundle)
            ));
            binding += 1;
        }
        for id in &self.used_caches {
            out.push_str(&format!(
                "@group(2) @binding({}) var<storage, read> cache_{}: array<f32>;\n",
                binding,
                san(id)
            ));
            binding += 1;
        }

        // group(3): outputs.
        let mut binding = 0;
        for output in &self.swatch.outputs {
            out.push_str(&format!(
                "@group(3) @binding({}) var<storage, read_write> out_{}: array<f32>;\n",
                binding,
                san(output)
            ));
            binding += 1;
        }
        for id in &self.used_caches {
            out.push_str(&format!(
                "@group(3) @binding({}) var<storage, read_write> push_{}: array<f32>;\n",
                binding,
                san(id)
            ));
            binding += 1;
        }
        out.push('\n');

        if self.uses_mod {
            out.push_str(
                "fn w_mod(a: f32, b: f32) -> f32 {\n    return a - b * floor(a / b);\n}\n\n",
            );
        }
        if self.uses_osc {
            out.push_str(
                "fn w_osc(freq: f32, t: f32) -> f32 {\n    return sin(6.28318530718 * freq * t);\n}\n\n",
            );
        }
        if self.uses_noise {
            out.push_str(
                "fn w_noise(x: f32, y: f32) -> f32 {\n    return fract(sin(x * 12.9898 + y * 78.233) * 43758.5453);\n}\n\n",
            );
        }

        out.push_str("@compute @workgroup_size(8, 8, 1)\n");
        out.push_str("fn main(@builtin(global_invocation_id) gid: vec3<u32>) {\n");
        out.push_str("    let dims = vec2<u32>(u32(globals.width), u32(globals.height));\n");
        out.push_str("    if (gid.x >= dims.x || gid.y >= dims.y) {\n        return;\n    }\n");
        out.push_str("    let pixel = gid.y * dims.x + gid.x;\n");
        out.push_str("    let pixels = dims.x * dims.y;\n");
        out.push_str("    let me_x = (f32(gid.x) + 0.5) / globals.width;\n");
        out.push_str("    let me_y = (f32(gid.y) + 0.5) / globals.height;\n");
        out.push_str("    let me_w = globals.width;\n");
        out.push_str("    let me_h = globals.height;\n");
        out.push_str("    let me_t = globals.time;\n\n");
        out.push_str(&body);
        out.push_str("}\n");
        out
    }

    // ─── Expression emission ──────────────────────────────────────

    fn emit_expr(&mut self, expr: &Expr, env: &EmitEnv) -> String {
        match &expr.kind {
            ExprKind::Num(n) => float(*n),

            ExprKind::Param(name) => match env.params.get(name) {
                Some(text) => text.clone(),
                None => {
                    self.error(expr.span, format!("unbound parameter '{}'", name));
                    "0.0".to_string()
                }
            },

            ExprKind::Index { bundle, index } => self.emit_index(bundle, index, expr.span, env),

            ExprKind::Binary { op, lhs, rhs } => {
                let l = self.emit_expr(lhs, env);
                let r = self.emit_expr(rhs, env);
                match op {
                    BinOp::Add => format!("({} + {})", l, r),
                    BinOp::Sub => format!("({} - {})", l, r),
                    BinOp::Mul => format!("({} * {})", l, r),
                    BinOp::Div => format!("({} / {})", l, r),
                    BinOp::Rem => {
                        self.uses_mod = true;
                        format!("w_mod({}, {})", l, r)
                    }
                    BinOp::Pow => format!("pow({}, {})", l, r),
                    BinOp::Lt => format!("f32({} < {})", l, r),
                    BinOp::Gt => format!("f32({} > {})", l, r),
                    BinOp::Le => format!("f32({} <= {})", l, r),
                    BinOp::Ge => format!("f32({} >= {})", l, r),
                    BinOp::Eq => format!("f32({} == {})", l, r),
                    BinOp::Ne => format!("f32({} != {})", l, r),
                    BinOp::And => format!("f32(({} != 0.0) && ({} != 0.0))", l, r),
                    BinOp::Or => format!("f32(({} != 0.0) || ({} != 0.0))", l, r),
                }
            }

            ExprKind::Unary { op, operand } => {
                let o = self.emit_expr(operand, env);
                match op {
                    UnOp::Neg => format!("(-{})", o),
                    UnOp::Not => format!("f32({} == 0.0)", o),
                }
            }

            ExprKind::Extract { call, index } => self.emit_extract(call, *index, expr.span, env),

            ExprKind::Call { .. } => {
                // Calls are always projected through Extract after lowering.
                self.error(
                    expr.span,
                    "bare spindle call in kernel emission".to_string(),
                );
                "0.0".to_string()
            }

            ExprKind::Builtin { name, args } => self.emit_builtin(*name, args, expr.span, env),

            ExprKind::Remap {
                base,
                subs,
                temporal,
            } => {
                if *temporal {
                    return self.emit_temporal_remap(base, expr.span, env);
                }
                let mut inner = env.clone();
                for (key, value) in subs {
                    let text = self.emit_expr(value, env);
                    inner.overrides.insert(key.clone(), text);
                }
                self.emit_expr(base, &inner)
            }

            ExprKind::CacheRead { id, tap } => {
                let size = self
                    .descriptors
                    .iter()
                    .find(|d| &d.id == id)
                    .map(|d| d.history_size)
                    .unwrap_or(1);
                self.used_caches.insert(id.clone());
                let tap = self.emit_expr(tap, env);
                format!(
                    "cache_{}[(u32(clamp(round({}), 1.0, {}.0)) - 1u) * pixels + pixel]",
                    san(id),
                    tap,
                    size
                )
            }
        }
    }

    fn emit_index(&mut self, bundle: &str, index: &IndexKey, span: Span, env: &EmitEnv) -> String {
        let key = format!("{}.{}", bundle, index);
        if let Some(text) = env.overrides.get(&key) {
            return text.clone();
        }

        if bundle == "me" {
            return match index {
                IndexKey::Field(field) => match field.as_str() {
                    "x" => "me_x".to_string(),
                    "y" => "me_y".to_string(),
                    "w" => "me_w".to_string(),
                    "h" => "me_h".to_string(),
                    "t" => "me_t".to_string(),
                    other => {
                        self.error(
                            span,
                            format!("audio coordinate 'me.{}' in a visual kernel", other),
                        );
                        "0.0".to_string()
                    }
                },
                IndexKey::Pos(_) => {
                    self.error(span, "numeric access on 'me'".to_string());
                    "0.0".to_string()
                }
            };
        }

        let pos = match index {
            IndexKey::Pos(pos) => *pos,
            IndexKey::Field(field) => {
                self.error(
                    span,
                    format!("unresolved field access '{}.{}'", bundle, field),
                );
                return "0.0".to_string();
            }
        };

        // A spindle-local read inlines its defining expression.
        if let Some(spindle_name) = &env.spindle {
            if let Some(spindle) = self.program.spindles.get(spindle_name) {
                if let Some(local) = spindle.local(bundle) {
                    if let Some(strand) = local.strands.get(pos as usize) {
                        let expr = strand.expr.clone();
                        return self.emit_expr(&expr, env);
                    }
                }
            }
        }

        // Under a remap, a strand read re-evaluates its defining expression
        // so the substitution reaches the coordinates it closes over. The
        // scheduler has already rejected cycles, so inlining terminates.
        if !env.overrides.is_empty() {
            if let Some(b) = self.program.bundles.get(bundle) {
                let visual = self
                    .annotations
                    .get(bundle)
                    .map(|a| a.backend == Backend::Visual)
                    .unwrap_or(false);
                if visual {
                    if let Some(strand) = b.strands.get(pos as usize) {
                        let expr = strand.expr.clone();
                        return self.emit_expr(&expr, env);
                    }
                }
            }
        }

        if let Some(local) = self.locals.get(&(bundle.to_string(), pos)) {
            return local.clone();
        }

        // Cross-unit read: per-pixel for visual producers, per-strand for
        // audio producers and shared constants.
        let width = self
            .program
            .bundles
            .get(bundle)
            .map(|b| b.width())
            .unwrap_or(1);
        let per_pixel = self
            .annotations
            .get(bundle)
            .map(|a| a.backend == Backend::Visual)
            .unwrap_or(false);
        if per_pixel {
            format!("in_{}[pixel * {}u + {}u]", san(bundle), width, pos)
        } else {
            format!("in_{}[{}u]", san(bundle), pos)
        }
    }

    fn emit_extract(&mut self, call: &Expr, index: u32, span: Span, env: &EmitEnv) -> String {
        let (spindle_name, args) = match &call.kind {
            ExprKind::Call { spindle, args } => (spindle.clone(), args),
            _ => {
                self.error(span, "extract of a non-call expression".to_string());
                return "0.0".to_string();
            }
        };
        let spindle = match self.program.spindles.get(&spindle_name) {
            Some(s) => s.clone(),
            None => {
                self.error(span, format!("unknown spindle '{}'", spindle_name));
                return "0.0".to_string();
            }
        };

        // Inline the call: parameters bind to the emitted argument text.
        let mut inner = EmitEnv {
            params: HashMap::new(),
            spindle: Some(spindle_name),
            overrides: env.overrides.clone(),
        };
        for (param, arg) in spindle.params.iter().zip(args) {
            let text = self.emit_expr(arg, env);
            inner.params.insert(param.clone(), format!("({})", text));
        }

        match spindle.returns.get(index as usize) {
            Some(ret) => self.emit_expr(ret, &inner),
            None => {
                self.error(
                    span,
                    format!("return index {} out of range for '{}'", index, spindle.name),
                );
                "0.0".to_string()
            }
        }
    }

    fn emit_builtin(
        &mut self,
        name: BuiltinFn,
        args: &[Expr],
        span: Span,
        env: &EmitEnv,
    ) -> String {
        use BuiltinFn::*;

        // Simple 1:1 WGSL functions.
        let direct = match name {
            Sin => Some("sin"),
            Cos => Some("cos"),
            Tan => Some("tan"),
            Asin => Some("asin"),
            Acos => Some("acos"),
            Atan => Some("atan"),
            Abs => Some("abs"),
            Floor => Some("floor"),
            Ceil => Some("ceil"),
            Round => Some("round"),
            Sqrt => Some("sqrt"),
            Exp => Some("exp"),
            Log => Some("log"),
            Log2 => Some("log2"),
            Sign => Some("sign"),
            Fract => Some("fract"),
            Atan2 => Some("atan2"),
            Pow => Some("pow"),
            Min => Some("min"),
            Max => Some("max"),
            Step => Some("step"),
            Clamp => Some("clamp"),
            Lerp => Some("mix"),
            Smoothstep => Some("smoothstep"),
            _ => None,
        };
        if let Some(fn_name) = direct {
            let args: Vec<String> = args.iter().map(|a| self.emit_expr(a, env)).collect();
            return format!("{}({})", fn_name, args.join(", "));
        }

        match name {
            Mod => {
                self.uses_mod = true;
                let a = self.emit_expr(&args[0], env);
                let b = self.emit_expr(&args[1], env);
                format!("w_mod({}, {})", a, b)
            }
            Osc => {
                self.uses_osc = true;
                let freq = self.emit_expr(&args[0], env);
                format!("w_osc({}, me_t)", freq)
            }
            Noise => {
                self.uses_noise = true;
                let x = self.emit_expr(&args[0], env);
                let y = if args.len() > 1 {
                    self.emit_expr(&args[1], env)
                } else {
                    "0.0".to_string()
                };
                format!("w_noise({}, {})", x, y)
            }
            Select => {
                // select(i, v0, ..., vN): nearest-integer index, clamped by
                // the comparison chain itself.
                let index = self.emit_expr(&args[0], env);
                let options: Vec<String> =
                    args[1..].iter().map(|a| self.emit_expr(a, env)).collect();
                let mut result = options
                    .last()
                    .cloned()
                    .unwrap_or_else(|| "0.0".to_string());
                for (k, option) in options.iter().enumerate().rev().skip(1) {
                    result = format!(
                        "select({}, {}, (round({}) < {}.5))",
                        result, option, index, k
                    );
                }
                result
            }
            Camera => {
                self.uses_camera = true;
                self.uses_sampler = true;
                let u = self.emit_expr(&args[0], env);
                let v = self.emit_expr(&args[1], env);
                let comp = self.channel_component(args.get(2), span);
                format!(
                    "textureSampleLevel(tex_camera, samp, vec2<f32>({}, 1.0 - {}), 0.0).{}",
                    u, v, comp
                )
            }
            Texture | Load => {
                self.uses_sampler = true;
                let id = self.resource_id(args.first(), span);
                self.used_textures.insert(id);
                // texture(id, u, v, ch); load may omit the coordinates.
                let (u, v, ch) = if args.len() == 4 {
                    (
                        self.emit_expr(&args[1], env),
                        self.emit_expr(&args[2], env),
                        args.get(3),
                    )
                } else {
                    ("me_x".to_string(), "me_y".to_string(), args.get(1))
                };
                let comp = self.channel_component(ch, span);
                format!(
                    "textureSampleLevel(tex_img_{}, samp, vec2<f32>({}, 1.0 - {}), 0.0).{}",
                    id, u, v, comp
                )
            }
            Text => {
                self.uses_sampler = true;
                let id = self.resource_id(args.first(), span);
                self.used_text.insert(id);
                let u = self.emit_expr(&args[1], env);
                let v = self.emit_expr(&args[2], env);
                format!(
                    "textureSampleLevel(tex_txt_{}, samp, vec2<f32>({}, 1.0 - {}), 0.0).x",
                    id, u, v
                )
            }
            Mouse => {
                match args.first().map(|a| &a.kind) {
                    Some(ExprKind::Num(n)) if *n == 1.0 => "globals.mouse_y".to_string(),
                    Some(ExprKind::Num(n)) if *n == 2.0 => "globals.mouse_down".to_string(),
                    _ => "globals.mouse_x".to_string(),
                }
            }
            Key => {
                self.uses_keys = true;
                let code = self.emit_expr(&args[0], env);
                format!("keys[u32(clamp(round({}), 0.0, 255.0))]", code)
            }
            Microphone | Sample => {
                self.error(
                    span,
                    format!(
                        "builtin '{}' is not available in the visual backend",
                        name.as_str()
                    ),
                );
                "0.0".to_string()
            }
            Cache => {
                self.error(span, "cache site survived extraction".to_string());
                "0.0".to_string()
            }
            _ => unreachable!("handled above"),
        }
    }

    fn emit_temporal_remap(&mut self, base: &Expr, span: Span, _env: &EmitEnv) -> String {
        // The host keeps one previous-frame copy per remapped bundle, so
        // the base must be a plain strand read.
        match &base.kind {
            ExprKind::Index { bundle, index } if bundle != "me" => {
                let pos = match index {
                    IndexKey::Pos(pos) => *pos,
                    IndexKey::Field(_) => {
                        self.error(span, "unresolved strand in temporal remap".to_string());
                        return "0.0".to_string();
                    }
                };
                let width = self
                    .program
                    .bundles
                    .get(bundle)
                    .map(|b| b.width())
                    .unwrap_or(1);
                self.prev_bundles.insert(bundle.clone());
                format!("prev_{}[pixel * {}u + {}u]", san(bundle), width, pos)
            }
            _ => {
                self.error(
                    span,
                    "temporal remap requires a strand reference as its base".to_string(),
                );
                "0.0".to_string()
            }
        }
    }

    fn channel_component(&mut self, arg: Option<&Expr>, span: Span) -> &'static str {
        match arg.map(|a| &a.kind) {
            Some(ExprKind::Num(n)) if *n == 0.0 => "x",
            Some(ExprKind::Num(n)) if *n == 1.0 => "y",
            Some(ExprKind::Num(n)) if *n == 2.0 => "z",
            Some(ExprKind::Num(n)) if *n == 3.0 => "w",
            _ => {
                self.error(span, "non-constant texture channel".to_string());
                "x"
            }
        }
    }

    fn resource_id(&mut self, arg: Option<&Expr>, span: Span) -> u32 {
        match arg.map(|a| &a.kind) {
            Some(ExprKind::Num(n)) => *n as u32,
            _ => {
                self.error(span, "non-constant resource id".to_string());
                0
            }
        }
    }

    fn error(&mut self, span: Span, message: String) {
        self.diagnostics
            .push(Diagnostic::error(Stage::Codegen, message, span));
    }
}

/// Format a float as a WGSL literal.
fn float(n: f64) -> String {
    if n == n.trunc() && n.abs() < 1e15 {
        format!("{:.1}", n)
    } else {
        format!("{}", n)
    }
}

/// Make a bundle or cache id usable as a WGSL identifier.
fn san(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for (i, ch) in name.chars().enumerate() {
        if ch.is_ascii_alphanumeric() {
            if i == 0 && ch.is_ascii_digit() {
                out.push('_');
            }
            out.push(ch);
        } else {
            out.push('_');
        }
    }
    out
}
