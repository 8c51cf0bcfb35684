//! Tracing initialisation for the `vmci` binary.
//!
//! Human-readable logs go to stderr, filtered by `RUST_LOG` (default `info`).
//! While a run is in progress the same events are also written to `run.log`
//! in its run directory through a non-blocking appender.

use parking_lot::Mutex;
use std::path::Path;
use std::sync::Arc;
use tracing::Subscriber;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, Registry, fmt, reload};

/// File name of the run log inside the run directory.
pub const LOG_FILE_NAME: &str = "run.log";

type FileLayer = Box<dyn Layer<Registry> + Send + Sync>;

/// Switches the run log file layer on and off.
#[derive(Clone)]
pub struct RunLogHandle {
    layer: reload::Handle<Option<FileLayer>, Registry>,
    guard: Arc<Mutex<Option<WorkerGuard>>>,
}

impl RunLogHandle {
    /// Start writing events to `<dir>/run.log`, replacing any earlier file.
    pub fn attach(&self, dir: &Path) {
        self.detach();
        let appender = tracing_appender::rolling::never(dir, LOG_FILE_NAME);
        let (writer, guard) = tracing_appender::non_blocking(appender);
        let layer: FileLayer = Box::new(fmt::layer().with_writer(writer).with_ansi(false));
        match self.layer.reload(Some(layer)) {
            Ok(()) => *self.guard.lock() = Some(guard),
            Err(e) => tracing::warn!(dir = %dir.display(), error = %e, "Cannot attach run log"),
        }
    }

    /// Stop writing the run log and flush it.
    pub fn detach(&self) {
        if let Err(e) = self.layer.reload(None) {
            tracing::warn!(error = %e, "Cannot detach run log");
        }
        // Dropping the guard flushes pending lines.
        self.guard.lock().take();
    }
}

fn build(default_level: &str) -> (impl Subscriber + Send + Sync + 'static, RunLogHandle) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let (file_layer, layer) = reload::Layer::new(None::<FileLayer>);
    let stderr_layer = fmt::layer().with_writer(std::io::stderr).with_target(false);

    let subscriber = tracing_subscriber::registry()
        .with(file_layer)
        .with(env_filter)
        .with(stderr_layer);
    let handle = RunLogHandle {
        layer,
        guard: Arc::new(Mutex::new(None)),
    };
    (subscriber, handle)
}

/// Install the global subscriber. Only the first call takes effect.
pub fn init(default_level: &str) -> RunLogHandle {
    let (subscriber, handle) = build(default_level);
    subscriber.try_init().ok();
    handle
}
