use std::path::Path;

use snafu::{ResultExt, Snafu};
use tracing::level_filters::LevelFilter;
use tracing_appender::rolling::{InitError, RollingFileAppender};
use tracing_subscriber::{EnvFilter, Layer, Registry, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to initialize rolling file appender"))]
    InitRollingFileAppender { source: InitError },

    #[snafu(display("unable to set the global default subscriber"))]
    SetGlobalDefaultSubscriber {
        source: tracing_subscriber::util::TryInitError,
    },
}

/// Initializes `tracing` with a console layer and, if `log_directory` is
/// given, a JSON file layer writing into that directory.
///
/// Both layers are filtered with the directives in the environment variable
/// `env`, events up to INFO are logged when it is not set.
pub fn initialize_logging(env: &str, log_directory: Option<&Path>) -> Result<(), Error> {
    let mut layers: Vec<Box<dyn Layer<Registry> + Send + Sync>> = Vec::new();

    layers.push(
        tracing_subscriber::fmt::layer()
            .with_writer(std::io::stderr)
            .with_filter(env_filter(env))
            .boxed(),
    );

    if let Some(log_directory) = log_directory {
        let file_appender = RollingFileAppender::builder()
            .filename_prefix(env!("CARGO_PKG_NAME"))
            .filename_suffix("tracing-rs.json")
            .max_log_files(6)
            .build(log_directory)
            .context(InitRollingFileAppenderSnafu)?;

        layers.push(
            tracing_subscriber::fmt::layer()
                .json()
                .with_writer(file_appender)
                .with_filter(env_filter(env))
                .boxed(),
        );
    }

    tracing_subscriber::registry()
        .with(layers)
        .try_init()
        .context(SetGlobalDefaultSubscriberSnafu)?;

    // need to delay logging until after tracing is initialized
    match log_directory {
        Some(directory) => tracing::debug!(directory = %directory.display(), "file logging enabled"),
        None => tracing::debug!("file logging disabled, because no log directory set"),
    }
    Ok(())
}

fn env_filter(env: &str) -> EnvFilter {
    EnvFilter::builder()
        .with_env_var(env)
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy()
}
