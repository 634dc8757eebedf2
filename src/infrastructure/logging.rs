use crate::domain::settings::LogSettings;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

pub struct LoggingGuard {
    // Dropping the guards stops the file writer before buffered lines are flushed
    _guards: Vec<WorkerGuard>,
}

fn rotation(name: &str) -> tracing_appender::rolling::Rotation {
    match name.to_lowercase().as_str() {
        "hourly" => tracing_appender::rolling::Rotation::HOURLY,
        "minutely" => tracing_appender::rolling::Rotation::MINUTELY,
        "never" => tracing_appender::rolling::Rotation::NEVER,
        _ => tracing_appender::rolling::Rotation::DAILY,
    }
}

/// Target of the session, scanner and connection events.
pub const BLUETOOTH_TARGET: &str = "ble_session::infrastructure::bluetooth";

/// Filter built from the configured levels.
fn settings_filter(settings: &LogSettings) -> anyhow::Result<EnvFilter> {
    let mut filter = EnvFilter::try_new(&settings.level)?;
    if let Some(level) = &settings.bluetooth_level {
        filter = filter.add_directive(format!("{}={}", BLUETOOTH_TARGET, level).parse()?);
    }
    Ok(filter)
}

/// Install the global subscriber. `RUST_LOG` overrides the configured level.
///
/// Console output goes to stderr; stdout belongs to the interactive host.
pub fn init_logger(settings: &LogSettings) -> anyhow::Result<LoggingGuard> {
    let mut guards = Vec::new();

    let level_filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => settings_filter(settings).unwrap_or_else(|e| {
            eprintln!("Invalid log level in settings ({}), using info", e);
            EnvFilter::new("info")
        }),
    };

    let console_layer = if settings.console_logging_enabled {
        Some(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_file(settings.show_file_line)
                .with_line_number(settings.show_file_line)
                .with_thread_ids(settings.show_thread_ids)
                .with_target(settings.show_target)
                .with_ansi(settings.ansi_colors),
        )
    } else {
        None
    };

    let file_layer = if settings.file_logging_enabled {
        std::fs::create_dir_all(&settings.log_dir)?;
        let file_appender = tracing_appender::rolling::RollingFileAppender::new(
            rotation(&settings.rotation),
            &settings.log_dir,
            &settings.file_name_prefix,
        );
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
        guards.push(guard);
        Some(
            fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_file(settings.show_file_line)
                .with_line_number(settings.show_file_line)
                .with_thread_ids(settings.show_thread_ids)
                .with_target(settings.show_target),
        )
    } else {
        None
    };

    tracing_subscriber::registry()
        .with(level_filter)
        .with(console_layer)
        .with(file_layer)
        .try_init()?;

    tracing::info!("Logging initialized");

    Ok(LoggingGuard { _guards: guards })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_appender::rolling::Rotation;

    #[test]
    fn test_rotation_names() {
        assert_eq!(rotation("Hourly"), Rotation::HOURLY);
        assert_eq!(rotation("never"), Rotation::NEVER);
        assert_eq!(rotation("weekly"), Rotation::DAILY);
    }

    #[test]
    fn test_bluetooth_level_adds_target_directive() {
        let settings = LogSettings {
            level: "warn".to_string(),
            bluetooth_level: Some("trace".to_string()),
            ..Default::default()
        };
        let filter = settings_filter(&settings).unwrap().to_string();
        assert!(filter.contains("warn"));
        assert!(filter.contains("ble_session::infrastructure::bluetooth=trace"));
    }

    #[test]
    fn test_base_level_only_without_bluetooth_level() {
        let filter = settings_filter(&LogSettings::default()).unwrap().to_string();
        assert!(!filter.contains(BLUETOOTH_TARGET));
    }

    #[test]
    fn test_bad_bluetooth_level_is_rejected() {
        let settings = LogSettings {
            bluetooth_level: Some("loud".to_string()),
            ..Default::default()
        };
        assert!(settings_filter(&settings).is_err());
    }
}
