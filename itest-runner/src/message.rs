//! Error message construction.
//!
//! A [`Message`] carries two renderings of the same failure. The long form
//! is the reason recorded for the entity; the short form heads the stack
//! text and leaves out the text of an extracted cause, which is listed
//! separately underneath the caller's location.
//!
//! ```ignore
//! s.error("Page did not load");
//! s.error(err);                                // short == err's message
//! s.error(("Failed to start browser: ", err)); // short == "Failed to start browser"
//! s.error(Message::causef(format_args!("Tab {} crashed ", id), err));
//! ```

use itest_common::ErrorReport;
use std::backtrace::{Backtrace, BacktraceStatus};
use std::fmt;
use std::panic::Location;

/// Error text plus an optional extracted cause.
#[derive(Debug)]
pub struct Message {
    long: String,
    short: String,
    cause: Option<anyhow::Error>,
}

impl Message {
    /// Plain text with no cause.
    pub fn text(text: impl Into<String>) -> Self {
        let long = text.into();
        Self {
            short: long.clone(),
            long,
            cause: None,
        }
    }

    /// `prefix` followed by `err`, the way `Error("Failed to x: ", err)` reads.
    ///
    /// When `prefix` ends in whitespace (which covers the usual `": "`), the
    /// short form is `prefix` with its trailing separator stripped and `err`
    /// becomes the cause. Otherwise both forms are the concatenation and no
    /// cause is extracted.
    pub fn cause(prefix: impl Into<String>, err: impl Into<anyhow::Error>) -> Self {
        let prefix = prefix.into();
        let err = err.into();
        let long = format!("{prefix}{err:#}");
        if prefix.ends_with(char::is_whitespace) {
            Self {
                long,
                short: strip_separator(&prefix),
                cause: Some(err),
            }
        } else {
            Self {
                short: long.clone(),
                long,
                cause: None,
            }
        }
    }

    /// Formatted `prefix` followed by `err`, the way `Errorf("... %v", err)`
    /// reads.
    ///
    /// Unlike [`cause`](Self::cause), the error is extracted whatever the
    /// prefix ends in: choosing `causef` already says that the error is the
    /// trailing argument of the format, so there is nothing to guess from the
    /// text.
    pub fn causef(prefix: fmt::Arguments<'_>, err: impl Into<anyhow::Error>) -> Self {
        let prefix = prefix.to_string();
        let err = err.into();
        Self {
            long: format!("{prefix}{err:#}"),
            short: strip_separator(&prefix),
            cause: Some(err),
        }
    }

    /// Full message, recorded as the error reason.
    pub fn long(&self) -> &str {
        &self.long
    }

    /// Message without the extracted cause text.
    pub fn short(&self) -> &str {
        &self.short
    }

    pub fn cause_ref(&self) -> Option<&anyhow::Error> {
        self.cause.as_ref()
    }

    pub(crate) fn with_prefix(mut self, prefix: &str) -> Self {
        if !prefix.is_empty() {
            self.long.insert_str(0, prefix);
            self.short.insert_str(0, prefix);
        }
        self
    }

    /// Build the structured record for an error reported at `location`.
    pub(crate) fn into_report(self, location: &Location<'_>) -> ErrorReport {
        let mut stack = format!(
            "{}\n\tat {}:{}",
            self.short,
            location.file(),
            location.line()
        );

        let mut backtrace = None;
        if let Some(cause) = &self.cause {
            for link in cause.chain() {
                let text = link.to_string();
                if text != self.short {
                    stack.push_str("\ncaused by: ");
                    stack.push_str(&text);
                }
            }
            if cause.backtrace().status() == BacktraceStatus::Captured {
                backtrace = Some(cause.backtrace().to_string());
            }
        }
        if backtrace.is_none() {
            let here = Backtrace::capture();
            if here.status() == BacktraceStatus::Captured {
                backtrace = Some(here.to_string());
            }
        }
        if let Some(trace) = backtrace {
            stack.push('\n');
            stack.push_str(&trace);
        }

        ErrorReport {
            reason: self.long,
            file: location.file().to_string(),
            line: location.line(),
            stack,
        }
    }
}

/// Drop the trailing run of colons and whitespace; leading text is kept as is.
fn strip_separator(prefix: &str) -> String {
    prefix
        .trim_end_matches(|c: char| c == ':' || c.is_whitespace())
        .to_string()
}

impl From<&str> for Message {
    fn from(text: &str) -> Self {
        Self::text(text)
    }
}

impl From<String> for Message {
    fn from(text: String) -> Self {
        Self::text(text)
    }
}

impl From<&String> for Message {
    fn from(text: &String) -> Self {
        Self::text(text.as_str())
    }
}

impl<'a> From<fmt::Arguments<'a>> for Message {
    fn from(args: fmt::Arguments<'a>) -> Self {
        Self::text(args.to_string())
    }
}

/// A lone error value: both forms are the error's own message.
impl From<anyhow::Error> for Message {
    fn from(err: anyhow::Error) -> Self {
        let text = format!("{err:#}");
        Self {
            long: text.clone(),
            short: text,
            cause: Some(err),
        }
    }
}

impl<S, E> From<(S, E)> for Message
where
    S: Into<String>,
    E: Into<anyhow::Error>,
{
    fn from((prefix, err): (S, E)) -> Self {
        Self::cause(prefix, err)
    }
}
