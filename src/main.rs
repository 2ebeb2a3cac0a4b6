use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use log::LevelFilter;
use std::path::PathBuf;
use std::process;
use ts2ass::pipeline::{run, Config};

/// Extract ARIB formatted closed captions from an MPEG transport stream and format the
/// results as a standard .ass subtitle file.
#[derive(Parser)]
#[command(name = "ts2ass", version)]
struct Cli {
    /// Input filename (MPEG2 Transport Stream File)
    infile: PathBuf,

    /// Output filename (.ass subtitle file); defaults to <infile>.ass
    #[arg(short, long)]
    outfile: Option<PathBuf>,

    /// PID of a PES known to contain closed caption info (auto-detected when negative)
    #[arg(short, long, default_value_t = -1)]
    pid: i32,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Does not write to stdout
    #[arg(short, long)]
    quiet: bool,

    /// Subtitle display time limit (seconds)
    #[arg(short, long, default_value_t = 5)]
    tmax: u32,

    /// Shift all time values in the generated .ass file by this offset in seconds
    #[arg(short = 'm', long = "timeoffset", default_value_t = 0.0)]
    time_offset: f64,
}

fn main() {
    let cli = Cli::parse();

    let level = if cli.quiet {
        LevelFilter::Error
    } else if cli.verbose {
        LevelFilter::Debug
    } else {
        LevelFilter::Warn
    };
    let mut builder = pretty_env_logger::formatted_builder();
    builder.filter_level(level);
    builder.init();

    if !cli.infile.exists() {
        if !cli.quiet {
            println!("Input filename {} does not exist.", cli.infile.display());
        }
        process::exit(1);
    }

    let outfile = cli.outfile.clone().unwrap_or_else(|| {
        let mut name = cli.infile.clone().into_os_string();
        name.push(".ass");
        PathBuf::from(name)
    });

    let config = Config {
        infile: cli.infile.clone(),
        outfile,
        pid: u16::try_from(cli.pid).ok(),
        tmax: cli.tmax,
        time_offset: cli.time_offset,
        quiet: cli.quiet,
    };

    let bar = if cli.verbose && !cli.quiet {
        let bar = ProgressBar::new(0);
        bar.set_style(
            ProgressStyle::with_template("{bytes}/{total_bytes} {wide_bar} {eta}")
                .expect("progress template"),
        );
        bar
    } else {
        ProgressBar::hidden()
    };

    let summary = match run(&config, |bytes_read, total_bytes| {
        bar.set_length(total_bytes);
        bar.set_position(bytes_read);
    }) {
        Ok(summary) => summary,
        Err(e) => {
            eprintln!("Error: {e}");
            process::exit(1);
        }
    };
    bar.finish_and_clear();

    if summary.caption_pid.is_none() {
        if !cli.quiet {
            println!(
                "*** No ARIB subtitle content was found in file {} ***",
                cli.infile.display()
            );
        }
        process::exit(1);
    }

    if !summary.file_written {
        if !cli.quiet {
            println!(
                "*** No nonempty ARIB closed caption content found in file {} ***",
                cli.infile.display()
            );
        }
        process::exit(1);
    }
}
