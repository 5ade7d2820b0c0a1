use std::{fs, fs::OpenOptions, path::PathBuf, sync::Once};

use tracing::level_filters::LevelFilter;
use tracing_error::ErrorLayer;
use tracing_subscriber::{
    EnvFilter, Registry, fmt::format::FmtSpan, layer::SubscriberExt, util::SubscriberInitExt,
};

use crate::config::{LOG_NAME, ModuleConfig};

static TRACING_INIT: Once = Once::new();

/// Install the file subscriber once per process.
///
/// Failures are reported on stderr; the module keeps working without logs.
pub fn initialize_logging(config: &ModuleConfig) {
    if config.disable_logging {
        return;
    }
    TRACING_INIT.call_once(|| {
        init(LOG_NAME, config.log_home.clone(), config.logging_level).unwrap_or_else(|e| {
            eprintln!("Failed to initialize logging: {e}");
        });
    });
}

fn init(
    log_name: &str,
    log_home: Option<String>,
    level_filter: LevelFilter,
) -> Result<(), Box<dyn std::error::Error>> {
    let log_home = match log_home {
        None => {
            let log_home = etcetera::home_dir().map_err(|e| format!("No home directory {e:?}"))?;
            log_home.join(".cosmian")
        }
        Some(log_home) => PathBuf::from(log_home),
    };
    fs::create_dir_all(&log_home)?;
    let log_path = log_home.join(log_name);
    let file = OpenOptions::new()
        .append(true)
        .create(true)
        .open(log_path)?;
    let env_filter = EnvFilter::builder()
        .with_default_directive(level_filter.into())
        .from_env_lossy();
    _ = Registry::default()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::sync::Mutex::new(file))
                .with_span_events(FmtSpan::ENTER),
        )
        .with(env_filter)
        .with(ErrorLayer::default())
        .try_init();
    Ok(())
}

#[allow(clippy::unwrap_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_file_is_created_in_the_log_home() {
        let dir = tempfile::tempdir().unwrap();
        let home = dir.path().join("logs");
        init(
            "test.log",
            Some(home.to_string_lossy().into_owned()),
            LevelFilter::DEBUG,
        )
        .unwrap();
        assert!(home.join("test.log").exists());
    }
}
