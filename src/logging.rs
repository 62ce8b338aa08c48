//! Log line formatting and subscriber setup.
//!
//! Every event is rendered as one line:
//! `[LEVEL] <rfc3339 timestamp> <stage>: <message> key=value ...`
//! where `<stage>` is the name of the innermost span (`pipeline` outside
//! any stage).

use anyhow::{Context as _, Result};
use chrono::{Local, SecondsFormat};
use std::fmt::{self, Write as _};
use std::fs::OpenOptions;
use std::path::Path;
use std::sync::Mutex;
use tracing::field::{Field, Visit};
use tracing::{Event, Subscriber};
use tracing_subscriber::fmt::format::Writer;
use tracing_subscriber::fmt::{FmtContext, FormatEvent, FormatFields, FormattedFields};
use tracing_subscriber::prelude::*;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::EnvFilter;

pub const DEFAULT_STAGE: &str = "pipeline";

#[derive(Debug, Clone, Copy, Default)]
pub struct StageLineFormat;

#[derive(Default)]
struct LineVisitor {
    message: String,
    fields: String,
}

impl Visit for LineVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message.push_str(value);
        } else {
            let _ = write!(self.fields, " {}={}", field.name(), value);
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        if field.name() == "message" {
            let _ = write!(self.message, "{value:?}");
        } else {
            let _ = write!(self.fields, " {}={:?}", field.name(), value);
        }
    }
}

impl<S, N> FormatEvent<S, N> for StageLineFormat
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        let span = ctx.event_scope().and_then(|mut scope| scope.next());
        let stage = span.as_ref().map_or(DEFAULT_STAGE, |s| s.name());

        write!(
            writer,
            "[{}] {} {}: ",
            event.metadata().level(),
            Local::now().to_rfc3339_opts(SecondsFormat::Millis, false),
            stage
        )?;

        let mut visitor = LineVisitor::default();
        event.record(&mut visitor);
        writer.write_str(&visitor.message)?;
        writer.write_str(&visitor.fields)?;

        if let Some(span) = &span {
            let extensions = span.extensions();
            if let Some(fields) = extensions.get::<FormattedFields<N>>() {
                if !fields.is_empty() {
                    write!(writer, " {}", fields)?;
                }
            }
        }
        writeln!(writer)
    }
}

fn filter(verbose: bool) -> EnvFilter {
    if verbose {
        return EnvFilter::new("debug");
    }
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Installs the global subscriber: stderr always, plus `log_file` opened in
/// append mode when given.
pub fn init(log_file: Option<&Path>, verbose: bool) -> Result<()> {
    let stderr_layer = tracing_subscriber::fmt::layer()
        .event_format(StageLineFormat)
        .with_writer(std::io::stderr);

    let file_layer = match log_file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("cannot open log file {}", path.display()))?;
            Some(
                tracing_subscriber::fmt::layer()
                    .event_format(StageLineFormat)
                    .with_ansi(false)
                    .with_writer(Mutex::new(file)),
            )
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(filter(verbose))
        .with(stderr_layer)
        .with(file_layer)
        .try_init()
        .context("cannot install tracing subscriber")?;
    tracing::info!("Logging initialised");
    Ok(())
}
