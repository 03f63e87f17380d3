use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use tracing::Level;
use tracing_subscriber::{
    filter::FromEnvError, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer,
    Registry,
};

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Init(#[from] tracing_subscriber::util::TryInitError),

    #[error("invalid RUST_LOG: {0}")]
    Filter(#[from] FromEnvError),

    #[error("unable to open log file {0:?}: {1}")]
    LogFile(PathBuf, std::io::Error),
}

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

pub struct TracingBuilder {
    level: Level,
    json: bool,
    source: bool,
    file: Option<PathBuf>,
}

impl Default for TracingBuilder {
    fn default() -> Self {
        TracingBuilder {
            level: Level::INFO,
            json: false,
            source: false,
            file: None,
        }
    }
}

impl TracingBuilder {
    /// Set the log level for all layers: stderr and the log file if configured. RUST_LOG still
    /// has a higher priority over this value.
    pub fn level(mut self, level: Level) -> TracingBuilder {
        self.level = level;
        self
    }

    /// Emit one JSON object per event instead of the compact text format.
    pub fn json(mut self, json: bool) -> TracingBuilder {
        self.json = json;
        self
    }

    /// Include source file and line number in every event.
    pub fn source(mut self, source: bool) -> TracingBuilder {
        self.source = source;
        self
    }

    /// Additionally append all events to the given file. `None` keeps stderr only.
    pub fn log_file(mut self, file: Option<PathBuf>) -> TracingBuilder {
        self.file = file;
        self
    }

    /// This will setup tracing based on the configuration passed in.
    /// It will setup a stderr writer output layer and a EnvFilter based on the provided log
    /// level (RUST_LOG still has a higher priority over the configured value).
    /// If a log file is configured, a second output layer appends to it, without ANSI colors.
    pub fn build(self) -> Result<(), Error> {
        let filter = EnvFilter::builder()
            .with_default_directive(self.level.into())
            .from_env()?;

        let mut layers: Vec<BoxedLayer> = vec![self.output_layer(std::io::stderr, true)];

        if let Some(path) = &self.file {
            layers.push(self.output_layer(open_log_file(path)?, false));
        }

        tracing_subscriber::registry()
            .with(layers)
            .with(filter)
            .try_init()?;

        Ok(())
    }

    fn output_layer<W>(&self, writer: W, ansi: bool) -> BoxedLayer
    where
        W: for<'w> tracing_subscriber::fmt::MakeWriter<'w> + Send + Sync + 'static,
    {
        let layer = tracing_subscriber::fmt::Layer::new()
            .with_writer(writer)
            .with_ansi(ansi)
            .with_file(self.source)
            .with_line_number(self.source);

        if self.json {
            layer.json().boxed()
        } else {
            layer.compact().boxed()
        }
    }
}

fn open_log_file(path: &Path) -> Result<Mutex<std::fs::File>, Error> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map(Mutex::new)
        .map_err(|e| Error::LogFile(path.to_path_buf(), e))
}
