//! Command-line entry point for the tube calibration engine.
//!
//! The real lab drives the engine from scripts wired to the actual hardware
//! drivers; this binary exposes the simulated rig so the whole calibration
//! flow can be exercised end to end without any hardware attached.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use log::info;

use colorlab::calibrate::Calibrator;
use colorlab::config::Settings;
use colorlab::core::{CancelToken, Channel};
use colorlab::curve::{
    default_start, ChannelCurveParams, CurveFitter, CurveParameterSet, LevenbergMarquardtFitter,
    TubeCurveModel,
};
use colorlab::hardware::mock::SimulatedLab;
use colorlab::storage::CsvSeriesSink;
use colorlab::table::{ColorEntry, ColorTable};

#[derive(Parser)]
#[command(name = "colorlab", version, about = "Closed-loop tube color calibration")]
struct Cli {
    /// Configuration base name, without extension.
    #[arg(long, default_value = "config/default")]
    config: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a full calibration session against the simulated lab.
    Simulate {
        /// Number of color entries to calibrate.
        #[arg(long, default_value_t = 3)]
        colors: usize,
        /// Measurement noise of the simulated photometer (sd on Y).
        #[arg(long, default_value_t = 0.0)]
        noise: f64,
        /// Where to write the calibrated color table.
        #[arg(long, default_value = "calibdata/colortable.csv")]
        output: PathBuf,
    },
    /// Refit tube curve parameters from raw sweep series files.
    Refit {
        /// Raw sweep CSV for the red channel.
        #[arg(long)]
        red: PathBuf,
        /// Raw sweep CSV for the green channel.
        #[arg(long)]
        green: PathBuf,
        /// Raw sweep CSV for the blue channel.
        #[arg(long)]
        blue: PathBuf,
        /// Where to write the fitted parameters.
        #[arg(long, default_value = "calibdata/tube_parameters.json")]
        output: PathBuf,
    },
    /// Print the effective configuration and exit.
    ShowConfig,
}

/// Reads `(voltage, Y)` pairs for one channel out of a raw sweep series file.
fn read_sweep(path: &Path, channel: Channel) -> Result<Vec<(f64, f64)>> {
    let file = std::fs::File::open(path)
        .with_context(|| format!("opening sweep file {}", path.display()))?;
    let mut reader = csv::Reader::from_reader(file);
    let headers = reader.headers()?.clone();
    let vol_col = match channel {
        Channel::Red => "volR",
        Channel::Green => "volG",
        Channel::Blue => "volB",
    };
    let vi = headers
        .iter()
        .position(|h| h == vol_col)
        .with_context(|| format!("{} lacks a {vol_col} column", path.display()))?;
    let yi = headers
        .iter()
        .position(|h| h == "Y")
        .with_context(|| format!("{} lacks a Y column", path.display()))?;
    let mut samples = Vec::new();
    for record in reader.records() {
        let record = record?;
        let v: f64 = record.get(vi).unwrap_or("").parse()?;
        let y: f64 = record.get(yi).unwrap_or("").parse()?;
        samples.push((v, y));
    }
    Ok(samples)
}

fn refit(
    settings: &Settings,
    red: &Path,
    green: &Path,
    blue: &Path,
    output: &Path,
) -> Result<()> {
    let fitter = LevenbergMarquardtFitter::default();
    let mut fitted = Vec::with_capacity(3);
    for (channel, path) in [
        (Channel::Red, red),
        (Channel::Green, green),
        (Channel::Blue, blue),
    ] {
        let samples = read_sweep(path, channel)?;
        let params = fitter
            .fit(&samples, default_start(channel))
            .with_context(|| format!("fitting {channel} channel from {}", path.display()))?;
        info!(
            "{channel} channel fitted: p1={:.3} p2={:.3} p3={:.3}",
            params.p1, params.p2, params.p3
        );
        fitted.push(params);
    }
    let model = TubeCurveModel::from_params(
        CurveParameterSet {
            red: fitted[0],
            green: fitted[1],
            blue: fitted[2],
        },
        settings.tubes.limits,
    );
    if let Some(parent) = output.parent() {
        std::fs::create_dir_all(parent)?;
    }
    model.save_params(output)?;
    Ok(())
}

/// Response parameters the simulated tubes follow.
fn simulated_truth() -> CurveParameterSet {
    CurveParameterSet {
        red: ChannelCurveParams::new(278.04, -139.32, -6.60),
        green: ChannelCurveParams::new(272.88, -97.94, -6.85),
        blue: ChannelCurveParams::new(263.73, -187.05, -6.46),
    }
}

fn simulate(mut settings: Settings, colors: usize, noise: f64, output: &Path) -> Result<()> {
    // The simulated photometer needs no settling time.
    settings.search.imi = Duration::ZERO;
    settings.tuning.imi = Duration::ZERO;
    settings.measurement.imi = Duration::ZERO;

    let lab = SimulatedLab::new(simulated_truth(), noise);
    let mut actuator = lab.actuator();
    let mut photometer = lab.photometer();
    let mut monitor = lab.monitor();
    let mut operator = lab.operator();
    let mut sink = CsvSeriesSink::new(&settings.storage.data_dir)
        .with_context(|| format!("opening data dir {}", settings.storage.data_dir.display()))?;
    let mut model = TubeCurveModel::uncalibrated(settings.tubes.limits);

    let mut table = ColorTable::new();
    for i in 0..colors {
        let patch = (i + 1) as f64 / (colors + 1) as f64;
        table.push(ColorEntry::new(format!("color{}", i + 1), patch));
    }

    let mut calibrator = Calibrator::new(
        &mut model,
        &mut actuator,
        &mut photometer,
        &mut monitor,
        &mut operator,
        &mut sink,
        &settings,
        CancelToken::new(),
    );

    info!("Simulated tube calibration sweep starting");
    calibrator
        .calibrate_tubes(&LevenbergMarquardtFitter::default())
        .context("tube calibration failed")?;

    info!("Simulated color-table calibration starting ({colors} colors)");
    calibrator
        .calibrate_table(&mut table)
        .context("color-table calibration failed")?;

    if let Some(parent) = output.parent() {
        std::fs::create_dir_all(parent)?;
    }
    table.save_csv(output)?;
    for entry in table.entries() {
        info!(
            "{}: calibrated={} voltages={:?}",
            entry.name,
            entry.is_calibrated(),
            entry.voltages
        );
    }
    Ok(())
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    let settings = Settings::load_from(&cli.config)
        .with_context(|| format!("loading configuration '{}'", cli.config))?;

    match cli.command {
        Command::Simulate {
            colors,
            noise,
            ref output,
        } => simulate(settings, colors, noise, output),
        Command::Refit {
            ref red,
            ref green,
            ref blue,
            ref output,
        } => refit(&settings, red, green, blue, output),
        Command::ShowConfig => {
            let rendered = toml::to_string_pretty(&settings)?;
            println!("{rendered}");
            Ok(())
        }
    }
}
