pub use candle_relax::{candle_core, candle_nn};
pub use clap::{Args, Parser, Subcommand, ValueEnum};
pub use log::{info, warn};

use indicatif::{ProgressBar, ProgressDrawTarget};
use std::io::Write;

#[derive(ValueEnum, Clone, Debug, PartialEq)]
#[clap(rename_all = "lowercase")]
pub enum ComputeDevice {
    Cpu,
    Cuda,
    Metal,
}

impl ComputeDevice {
    pub fn to_device(&self) -> anyhow::Result<candle_core::Device> {
        Ok(match self {
            ComputeDevice::Metal => candle_core::Device::new_metal(0)?,
            ComputeDevice::Cuda => candle_core::Device::new_cuda(0)?,
            ComputeDevice::Cpu => candle_core::Device::Cpu,
        })
    }
}

pub struct TrainConfig {
    pub learning_rate: f64,
    pub num_epochs: usize,
    pub device: candle_core::Device,
    pub verbose: bool,
    pub show_progress: bool,
}

impl TrainConfig {
    /// hidden bar when per-epoch values are logged instead
    pub fn progress_bar(&self) -> ProgressBar {
        let pb = ProgressBar::new(self.num_epochs as u64);
        if !self.show_progress || self.verbose {
            pb.set_draw_target(ProgressDrawTarget::hidden());
        }
        pb
    }
}

pub fn init_logger(verbose: bool) {
    if verbose {
        std::env::set_var("RUST_LOG", "info");
    }
    let _ = env_logger::try_init();
}

/// Running average of a scalar trace
#[derive(Default, Debug, Clone)]
pub struct AverageMeter {
    pub val: f64,
    pub sum: f64,
    pub count: usize,
}

impl AverageMeter {
    pub fn update(&mut self, val: f64) {
        self.val = val;
        self.sum += val;
        self.count += 1;
    }

    pub fn avg(&self) -> f64 {
        if self.count == 0 {
            0.
        } else {
            self.sum / self.count as f64
        }
    }
}

/// create the output directory of `{out}.*` files
pub fn mkdir_for(out: &str) -> anyhow::Result<()> {
    if let Some(dir) = std::path::Path::new(out).parent() {
        if !dir.as_os_str().is_empty() {
            std::fs::create_dir_all(dir)?;
        }
    }
    Ok(())
}

/// Tab-separated rows with a header line
pub fn write_tsv<R>(file: &str, header: &[&str], rows: R) -> anyhow::Result<()>
where
    R: IntoIterator,
    R::Item: IntoIterator,
    <R::Item as IntoIterator>::Item: std::fmt::Display,
{
    let mut buf = std::io::BufWriter::new(std::fs::File::create(file)?);
    writeln!(buf, "{}", header.join("\t"))?;
    for row in rows {
        let line = row
            .into_iter()
            .map(|x| x.to_string())
            .collect::<Vec<_>>()
            .join("\t");
        writeln!(buf, "{}", line)?;
    }
    buf.flush()?;
    info!("wrote {}", file);
    Ok(())
}

pub fn write_trace(file: &str, column: &str, trace: &[f32]) -> anyhow::Result<()> {
    let rows = trace
        .iter()
        .enumerate()
        .map(|(epoch, v)| vec![(epoch + 1).to_string(), v.to_string()]);
    write_tsv(file, &["epoch", column], rows)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn average_meter_tracks_mean() {
        let mut meter = AverageMeter::default();
        assert_eq!(meter.avg(), 0.0);
        for v in [1.0, 2.0, 6.0] {
            meter.update(v);
        }
        assert_eq!(meter.val, 6.0);
        assert_eq!(meter.avg(), 3.0);
    }

    #[test]
    fn trace_file_has_header_and_rows() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let out = dir.path().join("nested/run");
        let out = out.to_str().ok_or(anyhow::anyhow!("path"))?;
        mkdir_for(out)?;

        let file = format!("{}.trace.tsv", out);
        write_trace(&file, "kl", &[0.5, 0.25])?;
        let text = std::fs::read_to_string(&file)?;
        assert_eq!(text, "epoch\tkl\n1\t0.5\n2\t0.25\n");
        Ok(())
    }
}
