use std::fs::File;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Mutex;

use clap::{Parser, Subcommand};
use ratatui::DefaultTerminal;
use tracing::{error, info};
use tracing_error::ErrorLayer;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

mod controller;
mod dataset;
mod domain;
mod edit;
mod grid;
mod inputter;
mod model;
mod report;
mod ui;
mod workbook;

use controller::Controller;
use domain::{SheetError, TEConfig};
use model::{Model, Status};
use ui::TableUI;

#[derive(Parser, Debug)]
#[command(
    version,
    about = "Edit spreadsheet data in the terminal and build cost reports",
    args_conflicts_with_subcommands = true
)]
struct Args {
    /// Spreadsheet to open (.xlsx, .xls or .csv)
    path: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,

    /// Time in ms to wait for terminal events
    #[arg(long, default_value_t = 100)]
    event_poll_time: u64,

    /// Widest a column is rendered
    #[arg(long, default_value_t = 32)]
    max_column_width: usize,

    /// Write logs to this file (filtered by RUST_LOG)
    #[arg(long)]
    log_file: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Write one table sheet with totals per cost sheet of INPUT
    Report {
        input: String,
        #[arg(default_value = report::DEFAULT_OUTPUT)]
        output: String,
    },
}

fn main() -> ExitCode {
    let args = Args::parse();
    let result = match args.command {
        Some(Command::Report { ref input, ref output }) => run_report(input, output),
        None => run(&args),
    };
    match result {
        Err(e) => {
            error!("{e}");
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
        Ok(_) => ExitCode::SUCCESS,
    }
}

fn init_file_logging(path: &Path) -> Result<(), SheetError> {
    let file = File::create(path)?;
    tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_writer(Mutex::new(file))
                .with_ansi(false)
                .with_filter(EnvFilter::from_default_env()),
        )
        .with(ErrorLayer::default())
        .init();
    Ok(())
}

fn init_stderr_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr).with_filter(filter))
        .with(ErrorLayer::default())
        .init();
}

fn run_report(input: &str, output: &str) -> Result<(), SheetError> {
    init_stderr_logging();
    let input = model::expand_path(input)?;
    let output = model::expand_path(output)?;
    let summary = report::generate_report(&input, &output)?;
    info!("Skipped sheets: {:?}", summary.skipped);
    Ok(())
}

fn run(args: &Args) -> Result<(), SheetError> {
    if let Some(log_file) = &args.log_file {
        init_file_logging(log_file)?;
    }
    info!("Starting tabedit");

    let cfg = TEConfig::default()
        .event_poll_time(args.event_poll_time)
        .max_column_width(args.max_column_width);

    let mut terminal = ratatui::init();
    let result = event_loop(&mut terminal, args, &cfg);
    ratatui::restore();
    result
}

fn event_loop(
    terminal: &mut DefaultTerminal,
    args: &Args,
    cfg: &TEConfig,
) -> Result<(), SheetError> {
    let size = terminal.size()?;
    let mut model = Model::init(cfg, size.width as usize, size.height as usize);
    if let Some(path) = &args.path {
        model.load_data_file(model::expand_path(path)?)?;
    }
    let ui = TableUI::new();
    let controller = Controller::new(cfg);

    while model.status != Status::QUITTING {
        // Render the current view
        terminal.draw(|f| ui.draw(&model, f))?;

        // Handle events and map to a Message
        if let Some(message) = controller.handle_event(&model)? {
            model.update(message);
        }
    }
    Ok(())
}
