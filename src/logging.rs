use std::io::Write;

use chrono::Local;
use env_logger::{Builder, Env};
use log::SetLoggerError;

use crate::config::log_config::LogConfig;

/// Installs the global logger. `RUST_LOG` overrides the configured level.
pub fn init_logging(config: &LogConfig) -> Result<(), SetLoggerError> {
    build_logger(config).try_init()?;
    log::info!("Logging initialized");
    Ok(())
}

fn build_logger(config: &LogConfig) -> Builder {
    let env = Env::default().default_filter_or(config.level.as_str());
    let mut builder = Builder::from_env(env);

    if config.timestamps {
        builder.format(|buf, record| {
            writeln!(
                buf,
                "{} [{}] {}: {}",
                Local::now().format("%Y-%m-%dT%H:%M:%S%.3f"),
                record.level(),
                record.target(),
                record.args()
            )
        });
    } else {
        builder.format(|buf, record| writeln!(buf, "[{}] {}", record.level(), record.args()));
    }
    builder
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn logger_installs_once() {
        let config = LogConfig {
            level: "debug".into(),
            timestamps: false,
        };
        assert!(init_logging(&config).is_ok());
        assert!(init_logging(&config).is_err());
    }
}
