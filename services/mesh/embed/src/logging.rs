//! Log formatting and per-server log sinks.
//!
//! Engine diagnostics are emitted with `tracing`. Each server runs its engine
//! futures under its own [`Dispatch`], chosen by [`LogTarget`]: the host's
//! current subscriber, nothing at all, or a [`NodeLogFormatter`] writing to a
//! descriptor the host handed over.

use crate::error::{MeshError, Result};
use std::fmt;
use std::fs::File;
use std::io::IsTerminal;
use std::sync::Arc;
use tracing::{Dispatch, Event, Level, Subscriber};
use tracing_subscriber::fmt::{format::Writer, FmtContext, FormatEvent, FormatFields};
use tracing_subscriber::registry::LookupSpan;

const COLOR_RESET: &str = "\x1b[0m";
const COLOR_CYAN: &str = "\x1b[36m";
const COLOR_GREEN: &str = "\x1b[32m";
const COLOR_BRIGHT_YELLOW: &str = "\x1b[93m";
const COLOR_BRIGHT_RED: &str = "\x1b[91m";
const COLOR_BRIGHT_GRAY: &str = "\x1b[90m";

const COMPONENT_WIDTH: usize = 20;
const LOG_LEVEL_WIDTH: usize = 9;

/// Line formatter: `[timestamp] [component] [level] message key=value...`
pub struct NodeLogFormatter {
    service_name: String,
    color_enabled: bool,
}

impl NodeLogFormatter {
    /// Formatter that colours output when stderr is a terminal
    pub fn new(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            color_enabled: is_terminal(),
        }
    }

    /// Force colour on or off
    pub fn with_color(mut self, enabled: bool) -> Self {
        self.color_enabled = enabled;
        self
    }

    fn format_component(&self, component: Option<&str>) -> String {
        let name = match component {
            Some(comp) => format!("{}-{}", self.service_name, comp),
            None => self.service_name.clone(),
        };

        if name.chars().count() > COMPONENT_WIDTH {
            let truncated: String = name.chars().take(COMPONENT_WIDTH - 1).collect();
            format!("{}…", truncated)
        } else {
            format!("{:<width$}", name, width = COMPONENT_WIDTH)
        }
    }

    fn format_level(level: &Level) -> String {
        let label = match *level {
            Level::ERROR => "✗ ERROR",
            Level::WARN => "⚠ WARN",
            Level::INFO => "ℹ INFO",
            Level::DEBUG => "◦ DEBUG",
            Level::TRACE => "◦ TRACE",
        };
        format!("{:<width$}", label, width = LOG_LEVEL_WIDTH)
    }

    fn color_for_level(&self, level: &Level) -> &'static str {
        if !self.color_enabled {
            return "";
        }
        match *level {
            Level::ERROR => COLOR_BRIGHT_RED,
            Level::WARN => COLOR_BRIGHT_YELLOW,
            Level::INFO => COLOR_GREEN,
            Level::DEBUG | Level::TRACE => COLOR_BRIGHT_GRAY,
        }
    }
}

impl<S, N> FormatEvent<S, N> for NodeLogFormatter
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        _ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        let timestamp = chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f");
        let level = event.metadata().level();

        let mut visitor = FieldVisitor::default();
        event.record(&mut visitor);

        let color = self.color_for_level(level);
        let (reset, cyan) = if self.color_enabled {
            (COLOR_RESET, COLOR_CYAN)
        } else {
            ("", "")
        };

        write!(
            writer,
            "{}[{}] [{}] [{}{}{}] ",
            cyan,
            timestamp,
            self.format_component(visitor.component.as_deref()),
            color,
            Self::format_level(level),
            reset
        )?;
        write!(writer, "{}", visitor.message)?;
        for (key, value) in &visitor.fields {
            write!(writer, " {}={}", key, value)?;
        }
        writeln!(writer, "{}", reset)
    }
}

#[derive(Default)]
struct FieldVisitor {
    message: String,
    component: Option<String>,
    fields: Vec<(&'static str, String)>,
}

impl tracing::field::Visit for FieldVisitor {
    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn fmt::Debug) {
        let rendered = format!("{:?}", value);
        let unquoted = rendered
            .strip_prefix('"')
            .and_then(|s| s.strip_suffix('"'))
            .map(str::to_string)
            .unwrap_or(rendered);
        self.record_str(field, &unquoted);
    }

    fn record_str(&mut self, field: &tracing::field::Field, value: &str) {
        match field.name() {
            "message" => self.message = value.to_string(),
            "component" => self.component = Some(value.to_string()),
            name => self.fields.push((name, value.to_string())),
        }
    }
}

fn is_terminal() -> bool {
    if std::env::var("TERM").map(|t| t == "dumb").unwrap_or(true) {
        return false;
    }
    std::io::stderr().is_terminal()
}

/// Where a server's engine logs go
#[derive(Clone, Debug, Default)]
pub enum LogTarget {
    /// The subscriber active when the server starts
    #[default]
    Default,
    /// Nothing is logged
    Discard,
    /// A descriptor duplicated from the host
    Fd(Arc<File>),
}

impl LogTarget {
    /// Interpret a host descriptor: `-1` discards, anything else is duplicated
    pub fn from_fd(fd: i32) -> Result<Self> {
        match fd {
            -1 => Ok(LogTarget::Discard),
            fd if fd < 0 => Err(MeshError::Config(format!("invalid log fd {}", fd))),
            fd => dup_fd(fd).map(|file| LogTarget::Fd(Arc::new(file))),
        }
    }

    /// Build the dispatch engine futures run under
    pub fn dispatch(&self, hostname: &str) -> Dispatch {
        match self {
            LogTarget::Default => tracing::dispatcher::get_default(|current| current.clone()),
            LogTarget::Discard => Dispatch::none(),
            LogTarget::Fd(file) => {
                let subscriber = tracing_subscriber::fmt()
                    .with_max_level(Level::DEBUG)
                    .event_format(NodeLogFormatter::new(hostname).with_color(false))
                    .with_writer(file.clone())
                    .finish();
                Dispatch::new(subscriber)
            }
        }
    }
}

#[cfg(unix)]
fn dup_fd(fd: i32) -> Result<File> {
    use std::os::fd::BorrowedFd;

    // SAFETY: the descriptor is only borrowed for the duplicating fcntl call,
    // which fails with EBADF if the host passed a closed descriptor.
    let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
    let owned = borrowed
        .try_clone_to_owned()
        .map_err(|e| MeshError::Config(format!("log fd {}: {}", fd, e)))?;
    Ok(File::from(owned))
}

#[cfg(not(unix))]
fn dup_fd(fd: i32) -> Result<File> {
    Err(MeshError::Config(format!(
        "log fd {} unsupported on this platform",
        fd
    )))
}
