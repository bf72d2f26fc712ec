//! Shared tracing/logging initialization.
//!
//! Sets up `tracing_subscriber` with an env-filter, human or JSON console
//! output, and an optional plain-text daily log file.

use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::NaiveDate;
use tracing::Subscriber;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::{Layer, layer::SubscriberExt, util::SubscriberInitExt};

/// Boxed layer over the subscriber `S`.
pub type BoxedLayer<S> = Box<dyn Layer<S> + Send + Sync + 'static>;

/// Initialise the global tracing subscriber.
///
/// * `default_filter` -- default `RUST_LOG` value when the env-var is not set
///   (e.g. `"tether_server=info"`).
/// * `log_json` -- when `true`, emit structured JSON log lines instead of the
///   human-readable format.
/// * `log_file` -- an already opened file that receives a copy of every event.
pub fn init_tracing(default_filter: &str, log_json: bool, log_file: Option<File>) {
    let env_filter = tracing_subscriber::EnvFilter::new(
        std::env::var("RUST_LOG").unwrap_or_else(|_| default_filter.into()),
    );
    tracing_subscriber::registry()
        .with(env_filter)
        .with(output_layers(log_json, log_file))
        .init();
}

/// Console layer plus, when given, a plain-text copy into `log_file`.
pub fn output_layers<S>(log_json: bool, log_file: Option<File>) -> Vec<BoxedLayer<S>>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    let console = if log_json {
        tracing_subscriber::fmt::layer().json().boxed()
    } else {
        tracing_subscriber::fmt::layer().boxed()
    };
    let mut layers = vec![console];
    if let Some(file) = log_file {
        // The mutex serialises writers so concurrent events never interleave in the file.
        layers.push(
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(Mutex::new(file))
                .boxed(),
        );
    }
    layers
}

/// Path of the log file for `component` on `date`.
pub fn daily_log_path(log_dir: &Path, component: &str, date: NaiveDate) -> PathBuf {
    log_dir
        .join(component)
        .join(format!("LogFile_{}.log", date.format("%Y-%m-%d")))
}

/// Open (appending) today's log file for `component`, creating directories as needed.
pub fn open_daily_log(log_dir: &Path, component: &str) -> io::Result<File> {
    let path = daily_log_path(log_dir, component, chrono::Local::now().date_naive());
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    OpenOptions::new().create(true).append(true).open(path)
}
