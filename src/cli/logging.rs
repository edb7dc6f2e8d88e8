use std::io::{self, IsTerminal};

use colored::*;
use tracing::Level;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Layer,
};

use crate::error::{Error, Result};

/// Filter directive for a verbosity count, unless `quiet` wins
pub fn default_directive(verbosity: u8, quiet: bool) -> &'static str {
    if quiet {
        return "error";
    }
    match verbosity {
        0 => "sst2_lora=info,warn",
        1 => "sst2_lora=debug,info",
        2 => "sst2_lora=trace,debug",
        _ => "trace",
    }
}

/// Install the global subscriber
///
/// `RUST_LOG` overrides the verbosity flags unless `quiet` is set.
pub fn init_logging(verbosity: u8, quiet: bool, json_output: bool) -> Result<()> {
    let directive = default_directive(verbosity, quiet);
    let env_filter = if quiet {
        EnvFilter::new(directive)
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(directive))
    };

    let installed = if json_output {
        let json_layer = fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(true)
            .with_writer(io::stderr)
            .with_filter(env_filter);
        tracing_subscriber::registry().with(json_layer).try_init()
    } else if io::stderr().is_terminal() && !quiet {
        let fmt_layer = fmt::layer()
            .with_ansi(true)
            .with_span_events(FmtSpan::CLOSE)
            .event_format(ColoredFormatter)
            .with_writer(io::stderr)
            .with_filter(env_filter);
        tracing_subscriber::registry().with(fmt_layer).try_init()
    } else {
        let fmt_layer = fmt::layer()
            .with_target(false)
            .with_ansi(false)
            .without_time()
            .with_writer(io::stderr)
            .with_filter(env_filter);
        tracing_subscriber::registry().with(fmt_layer).try_init()
    };

    installed.map_err(|e| Error::config(format!("failed to install logger: {e}")))
}

/// Timestamp, coloured level, then the event fields
struct ColoredFormatter;

impl<S, N> fmt::FormatEvent<S, N> for ColoredFormatter
where
    S: tracing::Subscriber + for<'a> tracing_subscriber::registry::LookupSpan<'a>,
    N: for<'a> fmt::FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &fmt::FmtContext<'_, S, N>,
        mut writer: fmt::format::Writer<'_>,
        event: &tracing::Event<'_>,
    ) -> std::fmt::Result {
        let now = chrono::Local::now();
        write!(writer, "{} ", now.format("%H:%M:%S").to_string().dimmed())?;

        let level = match *event.metadata().level() {
            Level::ERROR => "ERROR".red().bold(),
            Level::WARN => "WARN".yellow().bold(),
            Level::INFO => "INFO".green().bold(),
            Level::DEBUG => "DEBUG".blue().bold(),
            Level::TRACE => "TRACE".purple().bold(),
        };
        write!(writer, "{level} ")?;

        ctx.field_format().format_fields(writer.by_ref(), event)?;
        writeln!(writer)
    }
}

/// Print a success line to stdout
pub fn success(message: &str) {
    if io::stdout().is_terminal() {
        println!("{} {}", "✓".green().bold(), message);
    } else {
        println!("SUCCESS: {message}");
    }
}

/// Print a warning line to stderr
pub fn warning(message: &str) {
    if io::stderr().is_terminal() {
        eprintln!("{} {}", "⚠".yellow().bold(), message);
    } else {
        eprintln!("WARNING: {message}");
    }
}
