use std::str::FromStr;

use anyhow::Result;
use log::LevelFilter;

/// Sets up fern logging: leveled file output under `dir`, warnings mirrored
/// to stderr in color. Returns once the global logger is installed.
pub fn init_logging(dir: &str, level: &str) -> Result<()> {
    std::fs::create_dir_all(dir)?;
    let log_path = std::path::Path::new(dir).join("docdb-server.log");

    let dispatch_file = fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!(
                "[{}] - {} - [{}] {}",
                chrono::Local::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
                record.level(),
                record.target(),
                message
            ))
        })
        .level(LevelFilter::from_str(level)?)
        .chain(fern::log_file(log_path)?);

    let dispatch_stderr = fern::Dispatch::new()
        .level(LevelFilter::Warn)
        .format(|out, message, _| {
            out.finish(format_args!(
                "\x1B[{}m{}\x1B[0m",
                fern::colors::Color::Yellow.to_fg_str(),
                message
            ))
        })
        .chain(std::io::stderr());

    let result = fern::Dispatch::new()
        .chain(dispatch_file)
        .chain(dispatch_stderr)
        .apply();

    if result.is_err() {
        eprintln!("logger has already been set");
    }
    Ok(())
}
