use anyhow::{Context, Result};
use csv::Writer;
use std::path::Path;

/// Raw and smoothed translation trace of one slice across time.
#[derive(Debug, Clone)]
pub struct SliceTrace {
    pub iz: usize,
    pub x_raw: Vec<f64>,
    pub x_smooth: Vec<f64>,
    pub y_raw: Vec<f64>,
    pub y_smooth: Vec<f64>,
}

/// Export motion traces as CSV, one row per (slice, timepoint).
pub fn write_motion_traces(path: &Path, traces: &[SliceTrace]) -> Result<()> {
    let mut wtr = Writer::from_path(path)
        .with_context(|| format!("failed to create trace file {}", path.display()))?;
    wtr.write_record(["slice", "time", "tx_raw", "tx_smooth", "ty_raw", "ty_smooth"])?;
    for trace in traces {
        for it in 0..trace.x_raw.len() {
            wtr.write_record(&[
                trace.iz.to_string(),
                it.to_string(),
                trace.x_raw[it].to_string(),
                trace.x_smooth[it].to_string(),
                trace.y_raw[it].to_string(),
                trace.y_smooth[it].to_string(),
            ])?;
        }
    }
    wtr.flush()?;
    Ok(())
}
