//! `mosaic` - build a single mosaic raster from a list of inputs.
//!
//! Thin command-line wrapper over [`mosrs::do_mosaic`]: parse options,
//! read the input list, run, write the monitor record if requested, map
//! the error taxonomy to exit codes.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use mosrs::{
    do_mosaic, GeoTiffProvider, MonitorRecord, MosaicError, MosaicOptions, ResamplingMethod,
    DFLT_BLOCKSIZE, DFLT_DRIVER, DFLT_NUMTHREADS,
};

#[derive(Parser, Debug)]
#[command(
    name = "mosaic",
    version,
    about = "Merge overlapping georeferenced rasters into a single mosaic"
)]
struct Args {
    /// Text file listing input rasters, one per line; order is the mosaic
    /// priority order
    #[arg(short = 'i', long)]
    infilelist: PathBuf,

    /// Output raster path
    #[arg(short = 'o', long)]
    outfile: PathBuf,

    /// Number of read threads
    #[arg(short = 'n', long, default_value_t = DFLT_NUMTHREADS)]
    numthreads: usize,

    /// Working block size in pixels
    #[arg(short = 'b', long, default_value_t = DFLT_BLOCKSIZE)]
    blocksize: usize,

    /// Output format driver
    #[arg(short = 'd', long, default_value = DFLT_DRIVER)]
    driver: String,

    /// Driver creation option as NAME=VALUE; may be given multiple times
    #[arg(long = "co", value_name = "NAME=VALUE")]
    creation_options: Vec<String>,

    /// Nodata value (default comes from the first input)
    #[arg(long)]
    nullval: Option<f64>,

    /// Write a JSON file of monitoring info
    #[arg(long, value_name = "FILE")]
    monitorjson: Option<PathBuf>,

    /// EPSG code of the output projection (default matches the inputs)
    #[arg(long, conflicts_with = "outprojwktfile")]
    outprojepsg: Option<u32>,

    /// Text file containing WKT of the output projection
    #[arg(long, value_name = "FILE")]
    outprojwktfile: Option<PathBuf>,

    /// Output X pixel size (default matches the first input)
    #[arg(long)]
    xres: Option<f64>,

    /// Output Y pixel size (default matches the first input)
    #[arg(long)]
    yres: Option<f64>,

    /// Resampling method for reprojection: near, bilinear or cubic
    #[arg(long, default_value = "near")]
    resample: String,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();

    // Bad usage exits 1, not clap's default 2; --help/--version exit 0
    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(e) => {
            let code = u8::from(e.use_stderr());
            let _ = e.print();
            return ExitCode::from(code);
        }
    };

    match run(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            eprintln!("mosaic: {error}");
            let code = u8::try_from(error.exit_code()).unwrap_or(1);
            ExitCode::from(code)
        }
    }
}

fn run(args: &Args) -> Result<(), MosaicError> {
    let resampling = ResamplingMethod::parse(&args.resample)
        .map_err(|name| MosaicError::Usage(format!("unknown resampling method '{name}'")))?;

    let options = MosaicOptions {
        numthreads: args.numthreads,
        blocksize: args.blocksize,
        driver: args.driver.clone(),
        creation_options: args.creation_options.clone(),
        nullval: args.nullval,
        output_epsg: args.outprojepsg,
        output_wkt_file: args.outprojwktfile.clone(),
        xres: args.xres,
        yres: args.yres,
        resampling,
    };

    let inputs = mosrs::read_input_list(&args.infilelist)?;
    let provider = GeoTiffProvider::new();

    match do_mosaic(&inputs, &args.outfile, &options, &provider) {
        Ok(record) => {
            write_monitor(args, &record);
            Ok(())
        }
        Err(failure) => {
            // A failed run still flushes the partial record
            write_monitor(args, &failure.monitor);
            Err(failure.error)
        }
    }
}

fn write_monitor(args: &Args, record: &MonitorRecord) {
    let Some(path) = &args.monitorjson else {
        return;
    };
    let json = match record.to_json_pretty() {
        Ok(json) => json,
        Err(e) => {
            eprintln!("mosaic: cannot serialize monitor record: {e}");
            return;
        }
    };
    if let Err(e) = std::fs::write(path, json) {
        eprintln!("mosaic: cannot write {}: {e}", path.display());
    }
}
