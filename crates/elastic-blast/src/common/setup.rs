use std::io::Write;

use env_logger::{DEFAULT_FILTER_ENV, Env};
use log::LevelFilter;

/// Overrides `RUST_LOG` for this program only.
const ELB_LOG_ENV: &str = "ELB_LOG";

fn requested_filter() -> Option<String> {
    [ELB_LOG_ENV, DEFAULT_FILTER_ENV]
        .into_iter()
        .find_map(|key| std::env::var(key).ok().filter(|value| !value.is_empty()))
}

/// Initializes the logger. Messages of dependencies are only shown with an
/// explicit filter in `ELB_LOG` or `RUST_LOG`.
pub fn setup_logging(debug: bool) {
    let filter = requested_filter();
    let verbose = debug || filter.as_deref().is_some_and(|f| f.contains("debug"));

    let mut builder = env_logger::Builder::new();
    builder.filter_level(LevelFilter::Warn);
    builder.filter_module(
        "elastic_blast",
        if debug {
            LevelFilter::Debug
        } else {
            LevelFilter::Info
        },
    );

    if verbose {
        builder.format_timestamp_millis().format_module_path(true);
    } else {
        // <time> <level> <message>
        builder.format(|buf, record| {
            let level_style = buf.default_level_style(record.level()).bold();
            writeln!(
                buf,
                "{} {level_style}{:<5}{level_style:#} {}",
                buf.timestamp_seconds(),
                record.level(),
                record.args()
            )
        });
    }

    builder.parse_env(Env::new().filter(if std::env::var(ELB_LOG_ENV).is_ok() {
        ELB_LOG_ENV
    } else {
        DEFAULT_FILTER_ENV
    }));
    builder.init();
}
