use std::{
    backtrace::Backtrace,
    fs::File,
    io::{self, Write},
    path::{Path, PathBuf},
};

use env_logger::{Builder, Logger, Target};
use log::{error, LevelFilter, Log};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LogError {
    #[error("{}: {source}", path.display())]
    Create {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error(transparent)]
    Install(#[from] log::SetLoggerError),
}

impl LogError {
    pub fn path(&self) -> Option<&Path> {
        match self {
            LogError::Create { path, .. } => Some(path),
            LogError::Install(_) => None,
        }
    }
}

/// Copies every log line to stderr and to a file.
struct Tee {
    console: io::Stderr,
    file: File,
}

impl Write for Tee {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.console.write_all(buf)?;
        self.file.write_all(buf)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.console.flush()?;
        self.file.flush()
    }
}

/// Logger settings shared by every run: `<timestamp>: <LEVEL> message`
/// lines, also written to `log_file` when given. The file is created (or
/// truncated) here. No level filter is set.
pub fn builder(log_file: Option<&Path>) -> Result<Builder, LogError> {
    let mut builder = Builder::new();
    builder.format(|buf, record| {
        writeln!(
            buf,
            "{}: <{}> {}",
            buf.timestamp_millis(),
            record.level(),
            record.args()
        )
    });

    if let Some(path) = log_file {
        let file = File::create(path).map_err(|source| LogError::Create {
            path: path.to_path_buf(),
            source,
        })?;
        builder.target(Target::Pipe(Box::new(Tee {
            console: io::stderr(),
            file,
        })));
    }

    Ok(builder)
}

/// Builds the logger at INFO unless `RUST_LOG` says otherwise.
pub fn build(log_file: Option<&Path>) -> Result<Logger, LogError> {
    Ok(builder(log_file)?
        .filter_level(LevelFilter::Info)
        .parse_default_env()
        .build())
}

/// Makes `logger` the process-wide sink for the `log` macros.
pub fn install(logger: Logger) -> Result<(), LogError> {
    let max_level = logger.filter();
    log::set_boxed_logger(Box::new(logger))?;
    log::set_max_level(max_level);
    Ok(())
}

/// Routes panics through the installed logger, with a backtrace, so they
/// land in the log file too.
pub fn install_panic_hook() {
    std::panic::set_hook(Box::new(|info| {
        error!("Uncaught panic: {info}\n{}", Backtrace::force_capture());
        log::logger().flush();
    }));
}
