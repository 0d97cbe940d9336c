//! Code generation: one compiled unit per swatch.
//!
//! Visual swatches become WGSL compute kernels computing the unit's
//! strands once per pixel. Audio swatches stay as IR trees; the host
//! interprets them per sample with `audio::AudioInterp`. Every unit
//! carries a blake3 content fingerprint so the host can key its
//! pipeline-state cache by kernel content.

pub mod audio;
pub mod wgsl;

use std::collections::BTreeMap;

use crate::annotate::{Annotation, Backend};
use crate::cache::CacheDescriptor;
use crate::diagnostic::{Diagnostic, Stage};
use crate::ir::{BuiltinFn, Expr, ExprKind, IndexKey, Program};
use crate::swatch::Swatch;

pub use audio::{AudioInputs, AudioInterp, AudioStrand, AudioUnit, NullInputs};

/// One compiled swatch, as handed to the host.
#[derive(Clone, Debug)]
pub struct CompiledUnit {
    pub name: String,
    pub backend: Backend,
    pub bundles: Vec<String>,
    /// Buffer names the host must bind as inputs.
    pub inputs: Vec<String>,
    /// Buffer names this unit produces.
    pub outputs: Vec<String>,
    /// `(bundle, strand)` pairs the host may pre-materialize.
    pub heavy: Vec<(String, u32)>,
    /// WGSL kernel source (visual units).
    pub kernel: Option<String>,
    /// Interpretable strand list (audio units).
    pub audio: Option<AudioUnit>,
    /// blake3 hex fingerprint of the unit's content.
    pub fingerprint: String,
}

/// Generate compiled units for every swatch.
pub fn generate(
    program: &Program,
    annotations: &BTreeMap<String, Annotation>,
    swatches: &[Swatch],
    descriptors: &[CacheDescriptor],
) -> Result<Vec<CompiledUnit>, Vec<Diagnostic>> {
    let mut units = Vec::new();
    let mut diagnostics = Vec::new();

    for swatch in swatches {
        match swatch.backend {
            Backend::Visual => {
                match wgsl::emit_kernel(program, annotations, swatch, descriptors) {
                    Ok(kernel) => {
                        let fingerprint = blake3::hash(kernel.as_bytes()).to_hex().to_string();
                        units.push(CompiledUnit {
                            name: swatch.name.clone(),
                            backend: Backend::Visual,
                            bundles: swatch.bundles.clone(),
                            inputs: swatch.inputs.clone(),
                            outputs: swatch.outputs.clone(),
                            heavy: swatch.heavy.clone(),
                            kernel: Some(kernel),
                            audio: None,
                            fingerprint,
                        });
                    }
                    Err(errs) => diagnostics.extend(errs),
                }
            }
            Backend::Audio => {
                let unit = audio::build_unit(program, swatch);
                if let Err(errs) = validate_audio_unit(program, &unit) {
                    diagnostics.extend(errs);
                    continue;
                }
                // Fingerprint over the printed IR; stable because Display
                // is deterministic.
                let mut text = String::new();
                for strand in &unit.strands {
                    text.push_str(&format!(
                        "{}.{} = {}\n",
                        strand.bundle, strand.index, strand.expr
                    ));
                }
                let fingerprint = blake3::hash(text.as_bytes()).to_hex().to_string();
                units.push(CompiledUnit {
                    name: swatch.name.clone(),
                    backend: Backend::Audio,
                    bundles: swatch.bundles.clone(),
                    inputs: swatch.inputs.clone(),
                    outputs: swatch.outputs.clone(),
                    heavy: swatch.heavy.clone(),
                    kernel: None,
                    audio: Some(unit),
                    fingerprint,
                });
            }
        }
    }

    if diagnostics.is_empty() {
        Ok(units)
    } else {
        Err(diagnostics)
    }
}

/// Audio strands may not use pixel-only constructs.
fn validate_audio_unit(program: &Program, unit: &AudioUnit) -> Result<(), Vec<Diagnostic>> {
    let mut diagnostics = Vec::new();

    for strand in &unit.strands {
        check_audio_expr(program, &strand.expr, &mut diagnostics);
    }

    if diagnostics.is_empty() {
        Ok(())
    } else {
        Err(diagnostics)
    }
}

fn check_audio_expr(program: &Program, expr: &Expr, diagnostics: &mut Vec<Diagnostic>) {
    expr.walk(&mut |e| match &e.kind {
        ExprKind::Builtin { name, .. } => {
            if matches!(
                name,
                BuiltinFn::Camera | BuiltinFn::Texture | BuiltinFn::Load | BuiltinFn::Text
            ) {
                diagnostics.push(Diagnostic::error(
                    Stage::Codegen,
                    format!(
                        "builtin '{}' is not available in the audio backend",
                        name.as_str()
                    ),
                    e.span,
                ));
            }
        }
        ExprKind::Index { bundle, index } => {
            if bundle == "me" {
                if let IndexKey::Field(field) = index {
                    if field == "x" || field == "y" || field == "w" || field == "h" {
                        diagnostics.push(Diagnostic::error(
                            Stage::Codegen,
                            format!("pixel coordinate 'me.{}' in an audio strand", field),
                            e.span,
                        ));
                    }
                }
            }
        }
        ExprKind::Remap { temporal, .. } => {
            if *temporal {
                diagnostics.push(
                    Diagnostic::error(
                        Stage::Codegen,
                        "temporal remap is not supported in the audio backend".to_string(),
                        e.span,
                    )
                    .with_help(
                        "audio history needs a bounded buffer; use \
                         `cache(value, size, tap, signal)` instead"
                            .to_string(),
                    ),
                );
            }
        }
        ExprKind::Call { spindle, .. } => {
            if let Some(callee) = program.spindles.get(spindle) {
                for ret in &callee.returns {
                    check_audio_expr(program, ret, diagnostics);
                }
            }
        }
        _ => {}
    });
}
