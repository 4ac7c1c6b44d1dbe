//! Kernel logging: a `log::Log` sink over the serial console.
//!
//! Subsystems log through the `log` macros with their module path as
//! the target; the boot banner and the panic path use `println!`
//! directly (panic must not depend on the logger at all).

use log::{LevelFilter, Metadata, Record};

struct SerialLogger;

impl log::Log for SerialLogger {
    fn enabled(&self, _metadata: &Metadata) -> bool {
        true
    }

    fn log(&self, record: &Record) {
        if self.enabled(record.metadata()) {
            crate::println!(
                "[{:5}] {}: {}",
                record.level(),
                record.target(),
                record.args()
            );
        }
    }

    fn flush(&self) {}
}

static LOGGER: SerialLogger = SerialLogger;

/// Install the logger. The level can be tightened from the kernel
/// command line (`loglevel=warn` etc.).
pub fn init(level: LevelFilter) {
    if log::set_logger(&LOGGER).is_ok() {
        log::set_max_level(level);
    }
}

/// Parse a `loglevel=` fragment of the kernel command line.
pub fn level_from_cmdline(cmdline: &str) -> LevelFilter {
    for part in cmdline.split_whitespace() {
        if let Some(level) = part.strip_prefix("loglevel=") {
            return match level {
                "off" => LevelFilter::Off,
                "error" => LevelFilter::Error,
                "warn" => LevelFilter::Warn,
                "info" => LevelFilter::Info,
                "debug" => LevelFilter::Debug,
                "trace" => LevelFilter::Trace,
                _ => LevelFilter::Info,
            };
        }
    }
    LevelFilter::Info
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_parsing() {
        assert_eq!(level_from_cmdline("loglevel=debug"), LevelFilter::Debug);
        assert_eq!(
            level_from_cmdline("console=serial loglevel=warn quiet"),
            LevelFilter::Warn
        );
        assert_eq!(level_from_cmdline(""), LevelFilter::Info);
        assert_eq!(level_from_cmdline("loglevel=bogus"), LevelFilter::Info);
    }
}
