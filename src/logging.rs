use flexi_logger::{
    Cleanup, Criterion, Duplicate, FileSpec, FlexiLoggerError, Logger, LoggerHandle, Naming,
};
use std::path::Path;

/// Start the global logger.
///
/// `level` is a log specification such as `info` or `petct_prep=debug`; the
/// `RUST_LOG` environment variable takes precedence when set. With a
/// `log_dir` records go to rotated `preprocessing` log files there and are
/// duplicated to stderr, otherwise they go to stderr only. Keep the returned
/// handle alive for the duration of the program.
pub fn setup_logging(level: &str, log_dir: Option<&Path>) -> Result<LoggerHandle, FlexiLoggerError> {
    let logger = Logger::try_with_env_or_str(level)?.format(flexi_logger::detailed_format);
    let logger = match log_dir {
        Some(dir) => logger
            .log_to_file(FileSpec::default().directory(dir).basename("preprocessing"))
            .duplicate_to_stderr(Duplicate::All)
            .rotate(
                Criterion::Size(10 * 1024 * 1024),
                Naming::Timestamps,
                Cleanup::KeepLogFiles(5),
            ),
        None => logger.log_to_stderr(),
    };
    logger.start()
}
