use std::fs::File;
use std::io::BufReader;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use bulkload::config::AppConfig;
use bulkload::loader::{DeadLetter, Loader, PgSink, RecordSource, SourceOptions};
use bulkload::{LoadError, db, init_logger};
use clap::Parser;
use tokio_util::sync::CancellationToken;

#[derive(Parser, Debug)]
#[command(
    name = "bulkload",
    about = "Load a delimited-text file into a database table with a pool of parallel inserters"
)]
struct Args {
    /// JSON job configuration (connection, table, pool and worker sizing).
    config: PathBuf,

    /// Delimited-text data file; the first row names the columns.
    data: PathBuf,

    /// Number of concurrent insert workers (overrides `total_worker`).
    #[arg(long)]
    workers: Option<usize>,

    /// Target table (overrides `db_table`).
    #[arg(long)]
    table: Option<String>,

    /// Write rejected records and their errors to this CSV file.
    #[arg(long)]
    reject_file: Option<PathBuf>,

    /// Log per-worker progress.
    #[arg(long)]
    debug: bool,
}

/// Exit status when the input could not be read to the end.
const EXIT_READ_ERROR: u8 = 2;
/// Exit status when some records were rejected.
const EXIT_REJECTED: u8 = 3;

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    let debug = args.debug;

    match run(args).await {
        Ok(code) => code,
        Err(err) => {
            init_logger(debug);
            log::error!("{}", err);
            if matches!(err, LoadError::Config(_)) {
                eprintln!("usage: bulkload <config.json> <data.csv>");
            }
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args) -> Result<ExitCode, LoadError> {
    let mut config = AppConfig::from_file(&args.config)?;
    config.apply_env_overrides();
    if let Some(workers) = args.workers {
        config.total_worker = workers;
    }
    if let Some(table) = args.table {
        config.db_table = table;
    }
    if args.reject_file.is_some() {
        config.reject_file = args.reject_file;
    }
    config.debug |= args.debug;

    init_logger(config.debug);
    config.validate()?;

    log::info!("{}", config);
    log::info!("  data_batch: {}", args.data.display());

    let pool = db::open_pool(&config).await?;

    let file = File::open(&args.data).map_err(|source| LoadError::Open {
        path: args.data.clone(),
        source,
    })?;
    let source = RecordSource::new(
        BufReader::new(file),
        SourceOptions {
            delimiter: config.delimiter_byte()?,
        },
    );
    let (header, stream) = source.read_header()?;

    let sink = PgSink::for_header(pool.clone(), &config.db_table, &header).await?;
    let dead_letter = match &config.reject_file {
        Some(path) => {
            log::info!("rejected records go to {}", path.display());
            DeadLetter::to_path(path, &header)?
        }
        None => DeadLetter::discard(),
    };

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                log::warn!("interrupt received, stopping load");
                cancel.cancel();
            }
        }
    });

    let loader = Loader::new(Arc::new(sink), config.load_options())
        .with_dead_letter(dead_letter)
        .with_cancellation(cancel);

    let report = loader.run(stream).await;
    pool.close().await;
    let report = report?;

    log::info!(
        "data_path: {} total_data: {} process_time: {} seconds",
        args.data.display(),
        report.dispatched,
        report.elapsed_seconds()
    );
    log::debug!("{}", report);

    if let Some(err) = &report.read_error {
        log::error!("input was not fully read: {}", err);
        return Ok(ExitCode::from(EXIT_READ_ERROR));
    }
    if report.rejected > 0 {
        log::warn!("{} records were rejected", report.rejected);
        return Ok(ExitCode::from(EXIT_REJECTED));
    }

    Ok(ExitCode::SUCCESS)
}
