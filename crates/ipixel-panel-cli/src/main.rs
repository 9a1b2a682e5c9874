//! iPixel Panel Control Tool
//!
//! Loads the panel configuration, connects to every unit and runs one
//! operation: push a pre-rendered image, upload an animation, clear, or
//! switch the units on and off.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use ipixel_panel_hw::{
    AnimationPlan, Canvas, FamilyRegistry, ImageOptions, PanelConfig, PanelCore,
    TransferOutcome, UnitId, UnitResults,
};
use serde::Serialize;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "ipixelctl")]
#[command(about = "Control tool for stacked iPixel LED panels")]
#[command(version)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Panel configuration file
    #[arg(short, long, default_value = "config/default.toml")]
    config: PathBuf,

    /// Print results as JSON
    #[arg(long)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show the configured units and canvas size
    Info,
    /// Push a PNG that already has the canvas size
    Push {
        /// Image file
        image: PathBuf,

        /// Only update this unit (repeatable; default: every unit)
        #[arg(long = "unit")]
        units: Vec<u8>,

        /// Blank the units before drawing
        #[arg(long)]
        clear: bool,
    },
    /// Upload an animation file (e.g. a GIF) with acknowledged transfer
    Animate {
        /// Animation file
        file: PathBuf,

        /// Target unit id (repeatable; default: every animation-capable unit)
        #[arg(long = "unit")]
        units: Vec<u8>,

        /// Blank the units before uploading
        #[arg(long)]
        clear: bool,
    },
    /// Blank every unit
    Clear,
    /// Switch every unit on
    On,
    /// Switch every unit off
    Off,
}

#[derive(Serialize)]
struct UnitInfo {
    id: u8,
    address: String,
    width: u32,
    height: u32,
    family: String,
    animation: bool,
}

#[derive(Serialize)]
struct UnitReport {
    unit: u8,
    ok: bool,
    detail: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("warn")
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = PanelConfig::load(&cli.config).with_context(|| {
        format!("Failed to load configuration from {}", cli.config.display())
    })?;
    let core = PanelCore::from_config(&config, &FamilyRegistry::builtin())
        .context("Invalid panel configuration")?;
    info!(
        "Loaded {} unit(s) from {}",
        core.panel_count(),
        cli.config.display()
    );

    match cli.command {
        Commands::Info => handle_info(&core, cli.json),
        Commands::Push {
            image,
            units,
            clear,
        } => {
            connect(&core).await?;
            let options = ImageOptions {
                units: units.into_iter().map(UnitId).collect(),
                clear_first: clear,
            };
            let results = handle_push(&core, &image, &options).await?;
            report(&results, cli.json, |_| "image sent".to_string())
        }
        Commands::Animate { file, units, clear } => {
            connect(&core).await?;
            let results = handle_animate(&core, &file, &units, clear).await?;
            report(&results, cli.json, |outcome| match outcome {
                TransferOutcome::Complete { windows } => format!("complete ({} windows)", windows),
                TransferOutcome::Cancelled { next_window } => {
                    format!("cancelled before window {}", next_window)
                }
            })
        }
        Commands::Clear => {
            connect(&core).await?;
            let results = core.clear().await;
            report(&results, cli.json, |_| "cleared".to_string())
        }
        Commands::On => {
            connect(&core).await?;
            let results = core.power_on().await;
            report(&results, cli.json, |_| "on".to_string())
        }
        Commands::Off => {
            connect(&core).await?;
            let results = core.power_off().await;
            report(&results, cli.json, |_| "off".to_string())
        }
    }
    // The process exits without disconnect_all: disconnecting blanks the units.
}

/// Connects every unit; continues if at least one is reachable.
async fn connect(core: &PanelCore) -> Result<()> {
    let results = core.connect_all().await;
    for (unit, err) in results.failed() {
        eprintln!("Unit {}: {}", unit, err);
    }
    if results.succeeded().is_empty() {
        anyhow::bail!("No unit could be connected");
    }
    Ok(())
}

fn handle_info(core: &PanelCore, json: bool) -> Result<()> {
    let (width, height) = core.canvas_size();
    let units: Vec<UnitInfo> = core
        .units()
        .iter()
        .map(|u| UnitInfo {
            id: u.id.as_u8(),
            address: u.address.clone(),
            width: u.width(),
            height: u.height(),
            family: u.family.clone(),
            animation: u.animation,
        })
        .collect();

    if json {
        let value = serde_json::json!({
            "canvas": { "width": width, "height": height },
            "units": units,
        });
        println!("{}", serde_json::to_string_pretty(&value)?);
        return Ok(());
    }

    println!("Canvas: {}x{}", width, height);
    println!("Units:");
    for unit in units {
        println!(
            "  #{} {} {}x{} ({}{})",
            unit.id,
            unit.address,
            unit.width,
            unit.height,
            unit.family,
            if unit.animation { ", animation" } else { "" }
        );
    }
    Ok(())
}

async fn handle_push(
    core: &PanelCore,
    path: &Path,
    options: &ImageOptions,
) -> Result<UnitResults<()>> {
    let image = image::open(path)
        .with_context(|| format!("Failed to open image {}", path.display()))?
        .to_rgb8();

    let (width, height) = core.canvas_size();
    if image.dimensions() != (width, height) {
        anyhow::bail!(
            "Image is {}x{} but the panel canvas is {}x{}",
            image.width(),
            image.height(),
            width,
            height
        );
    }

    let canvas = Canvas::from_rgb8(width, height, image.into_raw())?;
    Ok(core.upload_image_with(&canvas, options).await?)
}

async fn handle_animate(
    core: &PanelCore,
    path: &Path,
    units: &[u8],
    clear: bool,
) -> Result<UnitResults<TransferOutcome>> {
    let payload = std::fs::read(path)
        .with_context(|| format!("Failed to read animation {}", path.display()))?;

    let targets: Vec<UnitId> = if units.is_empty() {
        core.animation_units()
    } else {
        units.iter().copied().map(UnitId).collect()
    };
    let plan = AnimationPlan::broadcast(&payload, targets).with_clear_first(clear);

    let upload = core.upload_animation(&plan);
    tokio::pin!(upload);
    let results = tokio::select! {
        results = &mut upload => results,
        _ = tokio::signal::ctrl_c() => {
            eprintln!("Cancelling animation upload...");
            for unit in plan.units() {
                core.cancel_animation(unit)?;
            }
            upload.await
        }
    };
    Ok(results?)
}

fn report<T>(results: &UnitResults<T>, json: bool, describe: impl Fn(&T) -> String) -> Result<()> {
    let reports: Vec<UnitReport> = results
        .iter()
        .map(|(unit, result)| match result {
            Ok(value) => UnitReport {
                unit: unit.as_u8(),
                ok: true,
                detail: describe(value),
            },
            Err(e) => UnitReport {
                unit: unit.as_u8(),
                ok: false,
                detail: e.to_string(),
            },
        })
        .collect();

    if json {
        println!("{}", serde_json::to_string_pretty(&reports)?);
    } else {
        for r in &reports {
            println!(
                "Unit #{}: {}{}",
                r.unit,
                if r.ok { "" } else { "FAILED: " },
                r.detail
            );
        }
    }

    let failed = reports.iter().filter(|r| !r.ok).count();
    if failed > 0 {
        anyhow::bail!("{} of {} unit(s) failed", failed, reports.len());
    }
    Ok(())
}
