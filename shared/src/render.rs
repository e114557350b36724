//! Text exposition rendering
//!
//! Converts a [`MetricsByCounter`] into the plaintext exposition format.
//! For every counter:
//!
//! ```text
//! # HELP DCGM_FI_DEV_SM_CLOCK SM clock frequency (in MHz).
//! # TYPE DCGM_FI_DEV_SM_CLOCK gauge
//! DCGM_FI_DEV_SM_CLOCK{gpu="0",UUID="GPU-..",pci_bus_id="..",device="nvidia0",modelName=".."} 1410
//! ```
//!
//! Output depends only on the input, so the same snapshot can be handed to
//! several sinks.

use crate::types::metric::{MetricsByCounter, Sample};
use std::fmt::Write;

/// Label key carrying the entity unique identifier
pub const UUID_LABEL: &str = "UUID";

/// Formatting failure while rendering a snapshot
#[derive(Debug, thiserror::Error)]
#[error("failed to render metrics into exposition format")]
pub struct RenderError(#[from] std::fmt::Error);

/// Render `metrics` in iteration order. An empty mapping yields an empty string.
pub fn render(metrics: &MetricsByCounter) -> Result<String, RenderError> {
    let mut out = String::new();

    for (counter, samples) in metrics.iter() {
        write!(out, "# HELP {} {}", counter.name, escape_help(&counter.help))?;
        write!(out, "\n# TYPE {} {}", counter.name, counter.kind)?;
        for sample in samples {
            out.push('\n');
            write_sample(&mut out, &counter.name, sample)?;
        }
        out.push('\n');
    }

    Ok(out)
}

fn write_sample(out: &mut String, name: &str, sample: &Sample) -> std::fmt::Result {
    write!(
        out,
        "{}{{gpu=\"{}\",{}=\"{}\",pci_bus_id=\"{}\",device=\"{}\",modelName=\"{}\"",
        name,
        escape_label(&sample.gpu),
        UUID_LABEL,
        escape_label(&sample.gpu_uuid),
        escape_label(&sample.pci_bus_id),
        escape_label(&sample.device),
        escape_label(&sample.model_name),
    )?;

    if !sample.mig_profile.is_empty() {
        write!(
            out,
            ",GPU_I_PROFILE=\"{}\",GPU_I_ID=\"{}\"",
            escape_label(&sample.mig_profile),
            escape_label(&sample.gpu_instance_id),
        )?;
    }

    if !sample.hostname.is_empty() {
        write!(out, ",Hostname=\"{}\"", escape_label(&sample.hostname))?;
    }

    for (key, value) in &sample.labels {
        write!(out, ",{}=\"{}\"", key, escape_label(value))?;
    }

    write!(out, "}} {}", sample.value)
}

/// Escape a label value: backslash, double quote and newline.
pub fn escape_label(value: &str) -> String {
    if !value.contains(['\\', '"', '\n']) {
        return value.to_string();
    }
    let mut escaped = String::with_capacity(value.len() + 8);
    for c in value.chars() {
        match c {
            '\\' => escaped.push_str("\\\\"),
            '"' => escaped.push_str("\\\""),
            '\n' => escaped.push_str("\\n"),
            other => escaped.push(other),
        }
    }
    escaped
}

/// Escape HELP text: backslash and newline only.
fn escape_help(help: &str) -> String {
    help.replace('\\', "\\\\").replace('\n', "\\n")
}
