// SPDX-License-Identifier: GPL-3.0-only

//! CLI commands
//!
//! - `simulate`: drive the splitter with a loopback camera and consumers
//! - `config`: show the configuration the splitter would run with

use camera_splitter::SplitterConfig;
use camera_splitter::simulation::{self, SimulationOptions};
use camera_splitter::transport::SurfaceId;
use clap::Args;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

#[derive(Args, Debug)]
pub struct SimulateArgs {
    /// Number of frames the camera produces
    #[arg(short, long, default_value = "120")]
    frames: u64,

    /// Number of output surfaces
    #[arg(short, long, default_value = "2")]
    outputs: usize,

    /// Frame width in pixels
    #[arg(long, default_value = "1920")]
    width: u32,

    /// Frame height in pixels
    #[arg(long, default_value = "1080")]
    height: u32,

    /// Delay between frames in milliseconds
    #[arg(long, default_value = "5")]
    interval_ms: u64,

    /// Per-output consumer hold time in milliseconds (comma separated)
    #[arg(long, value_delimiter = ',', default_value = "2")]
    consumer_delay_ms: Vec<u64>,

    /// Surface ids of outputs that replace pending frames (comma separated)
    #[arg(long, value_delimiter = ',')]
    async_outputs: Vec<SurfaceId>,

    /// Surface id of an output to remove mid-stream
    #[arg(long, requires = "remove_after")]
    remove_output: Option<SurfaceId>,

    /// Frame number at which `--remove-output` takes effect
    #[arg(long, requires = "remove_output")]
    remove_after: Option<u64>,

    /// Buffers the simulated HAL may have in flight
    #[arg(long, default_value = "8")]
    max_hal_buffers: usize,

    /// Use the HAL buffer manager dequeue timeout
    #[arg(long)]
    hal_buffer_manager: bool,
}

impl SimulateArgs {
    fn to_options(&self) -> SimulationOptions {
        SimulationOptions {
            frames: self.frames,
            outputs: self.outputs,
            width: self.width,
            height: self.height,
            frame_interval: Duration::from_millis(self.interval_ms),
            consumer_delays: self
                .consumer_delay_ms
                .iter()
                .map(|&ms| Duration::from_millis(ms))
                .collect(),
            async_outputs: self.async_outputs.clone(),
            remove_output: self.remove_output.zip(self.remove_after),
            max_hal_buffers: self.max_hal_buffers,
        }
    }
}

fn load_config(path: Option<&Path>) -> Result<SplitterConfig, Box<dyn std::error::Error>> {
    match path {
        Some(path) => Ok(SplitterConfig::load(path)?),
        None => Ok(SplitterConfig::default()),
    }
}

/// Run a simulation and print its report as JSON
pub fn simulate(args: SimulateArgs, config: Option<&Path>) -> Result<(), Box<dyn std::error::Error>> {
    let mut config = load_config(config)?;
    if args.hal_buffer_manager {
        config.use_hal_buffer_manager = true;
    }
    let options = args.to_options();

    println!(
        "Simulating {} frames into {} outputs ({}x{})",
        options.frames, options.outputs, options.width, options.height
    );
    println!("Press Ctrl+C to stop early");

    let stop_flag = Arc::new(AtomicBool::new(false));
    let stop_flag_clone = Arc::clone(&stop_flag);
    ctrlc::set_handler(move || {
        stop_flag_clone.store(true, Ordering::SeqCst);
    })?;

    let report = simulation::run(&options, config, stop_flag)?;
    if report.stopped_early {
        println!("Stopped early");
    }

    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

/// Print the effective configuration as JSON
pub fn print_config(config: Option<&Path>) -> Result<(), Box<dyn std::error::Error>> {
    let config = load_config(config)?;
    println!("{}", serde_json::to_string_pretty(&config)?);
    Ok(())
}
