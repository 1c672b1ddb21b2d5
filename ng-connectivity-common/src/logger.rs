use ng_connectivity_error::{NGError, NGResult};
use ng_connectivity_models::settings::Log;
use std::{
    str::FromStr,
    sync::{Arc, Mutex},
};
use tracing::{subscriber::set_global_default, Level, Metadata};
use tracing_appender::{non_blocking::WorkerGuard, rolling};
use tracing_subscriber::{
    filter::DynFilterFn,
    fmt::{self},
    layer::{Context, SubscriberExt},
    Layer, Registry,
};

pub struct Logger {
    level: Arc<Mutex<Level>>,
    dir: String,
    file_enabled: bool,
    _file_guard: Option<WorkerGuard>,
}

impl Logger {
    pub fn new(level: Option<Level>) -> Self {
        Logger {
            level: Arc::new(Mutex::new(level.unwrap_or(Level::INFO))),
            dir: "logs".to_string(),
            file_enabled: false,
            _file_guard: None,
        }
    }

    /// Logger configured from the `log` settings section.
    pub fn from_settings(log: &Log) -> NGResult<Self> {
        let level = Level::from_str(&log.level)
            .map_err(|_| NGError::ConfigurationError(format!("invalid log level '{}'", log.level)))?;
        Ok(Logger {
            level: Arc::new(Mutex::new(level)),
            dir: log.dir.clone(),
            file_enabled: log.file_enabled,
            _file_guard: None,
        })
    }

    #[inline]
    /// Sets the new logging level; takes effect for both layers immediately.
    pub fn set_level(&self, new_level: Level) {
        let mut level = self.level.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        *level = new_level;
    }

    #[inline]
    pub fn get_level(&self) -> Level {
        *self.level.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn level_filter<S>(&self) -> DynFilterFn<S, impl Fn(&Metadata<'_>, &Context<'_, S>) -> bool> {
        let level = Arc::clone(&self.level);
        DynFilterFn::new(move |metadata, _| {
            let current = *level.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            metadata.level() <= &current
        })
    }

    /// Installs the global subscriber: console output, plus a daily rolling
    /// `connectivity.log` under the configured directory when file output is enabled.
    pub fn initialize(&mut self) -> NGResult<()> {
        let console_layer = {
            #[cfg(debug_assertions)]
            let layer = fmt::layer()
                .with_writer(std::io::stdout)
                .with_file(true)
                .with_line_number(true);

            #[cfg(not(debug_assertions))]
            let layer = fmt::layer().with_writer(std::io::stdout);

            layer.with_filter(self.level_filter())
        };

        let file_layer = if self.file_enabled {
            let file_appender = rolling::daily(&self.dir, "connectivity.log");
            let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
            self._file_guard = Some(guard);
            Some(
                fmt::layer()
                    .with_writer(non_blocking)
                    .with_ansi(false)
                    .with_filter(self.level_filter()),
            )
        } else {
            None
        };

        let subscriber = Registry::default().with(console_layer).with(file_layer);
        set_global_default(subscriber).map_err(|_| NGError::from("Failed to set logger"))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn level_is_adjustable_at_runtime() {
        let logger = Logger::new(None);
        assert_eq!(logger.get_level(), Level::INFO);
        logger.set_level(Level::DEBUG);
        assert_eq!(logger.get_level(), Level::DEBUG);
    }

    #[test]
    fn settings_level_must_parse() {
        let mut log = Log::default();
        log.level = "verbose".into();
        assert!(Logger::from_settings(&log).is_err());
        log.level = "warn".into();
        assert_eq!(Logger::from_settings(&log).unwrap().get_level(), Level::WARN);
    }
}
