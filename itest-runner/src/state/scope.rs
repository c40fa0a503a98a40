//! Error scope and the capability traits built on it.

use super::{EntityCondition, EntityRoot};
use crate::message::Message;
use crate::stage::abort_task;
use itest_common::ErrorReport;
use std::fmt;
use std::panic::Location;
use std::path::PathBuf;
use std::sync::Arc;

pub(crate) const PRECONDITION_PREFIX: &str = "[Precondition failure] ";
pub(crate) const FIXTURE_PREFIX: &str = "[Fixture failure] ";

/// Where reports from one view go: the entity's output, the error flag of
/// the current (sub)test, and the prefix its messages carry.
#[derive(Clone)]
pub struct Scope {
    root: Arc<EntityRoot>,
    condition: Arc<EntityCondition>,
    subtest_path: String,
    phase_prefix: &'static str,
}

impl Scope {
    pub(crate) fn new(root: Arc<EntityRoot>) -> Self {
        Self {
            condition: root.condition.clone(),
            root,
            subtest_path: String::new(),
            phase_prefix: "",
        }
    }

    pub(crate) fn with_phase(mut self, prefix: &'static str) -> Self {
        self.phase_prefix = prefix;
        self
    }

    /// Scope for a subtest named `name`, with its own error flag.
    pub(crate) fn subtest(&self, name: &str) -> Self {
        let subtest_path = if self.subtest_path.is_empty() {
            name.to_string()
        } else {
            format!("{}/{}", self.subtest_path, name)
        };
        Self {
            root: self.root.clone(),
            condition: Arc::new(EntityCondition::child(&self.condition)),
            subtest_path,
            phase_prefix: self.phase_prefix,
        }
    }

    pub fn root(&self) -> &Arc<EntityRoot> {
        &self.root
    }

    /// `a/b` for a nested subtest, empty at the top level.
    pub fn subtest_path(&self) -> &str {
        &self.subtest_path
    }

    fn prefix(&self) -> String {
        if self.subtest_path.is_empty() {
            self.phase_prefix.to_string()
        } else {
            format!("{}{}: ", self.phase_prefix, self.subtest_path)
        }
    }

    pub(crate) fn log(&self, text: &str) {
        self.root.output().log(text);
    }

    pub(crate) fn report(&self, msg: Message, location: &Location<'_>) {
        self.condition.record_error();
        let report = msg.with_prefix(&self.prefix()).into_report(location);
        self.root.output().error(report);
    }

    pub(crate) fn fatal(&self, msg: Message, location: &Location<'_>) -> ! {
        self.report(msg, location);
        abort_task()
    }

    pub(crate) fn report_panic(&self, message: String) {
        self.condition.record_error();
        let reason = format!("{}Panic: {message}", self.prefix());
        self.root.output().error(ErrorReport {
            stack: reason.clone(),
            reason,
            file: String::new(),
            line: 0,
        });
    }

    pub(crate) fn has_error(&self) -> bool {
        self.condition.has_error()
    }
}

impl fmt::Debug for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scope")
            .field("entity", &self.root.info().name)
            .field("subtest_path", &self.subtest_path)
            .field("phase_prefix", &self.phase_prefix)
            .finish()
    }
}

/// Implemented by every state view. Not meant to be called directly.
pub trait EntityScoped {
    #[doc(hidden)]
    fn scope(&self) -> &Scope;
}

/// Log lines to the entity's output.
pub trait Logger: EntityScoped {
    fn log(&self, msg: impl fmt::Display) {
        self.scope().log(&msg.to_string());
    }

    fn logf(&self, args: fmt::Arguments<'_>) {
        self.scope().log(&args.to_string());
    }
}

/// Record errors. `fatal` additionally stops the calling task.
pub trait Reporter: EntityScoped {
    #[track_caller]
    fn error(&self, msg: impl Into<Message>) {
        self.scope().report(msg.into(), Location::caller());
    }

    #[track_caller]
    fn errorf(&self, args: fmt::Arguments<'_>) {
        self.scope().report(Message::from(args), Location::caller());
    }

    #[track_caller]
    fn fatal(&self, msg: impl Into<Message>) -> ! {
        self.scope().fatal(msg.into(), Location::caller())
    }

    #[track_caller]
    fn fatalf(&self, args: fmt::Arguments<'_>) -> ! {
        self.scope().fatal(Message::from(args), Location::caller())
    }

    /// Whether this (sub)test has reported an error so far.
    fn has_error(&self) -> bool {
        self.scope().has_error()
    }
}

/// Declared data files and runtime variables.
pub trait DataAccess: EntityScoped {
    /// Absolute path of a declared data file. Fatal if `name` was not
    /// declared.
    #[track_caller]
    fn data_path(&self, name: &str) -> PathBuf {
        let scope = self.scope();
        let root = scope.root();
        if !root.info().data.iter().any(|d| d == name) {
            scope.fatal(
                Message::from(format!("Data file {name:?} was not declared")),
                Location::caller(),
            );
        }
        root.config().data_dir.join(name)
    }

    /// Value of a declared variable, if one was supplied. Fatal if `name`
    /// was not declared.
    #[track_caller]
    fn var(&self, name: &str) -> Option<String> {
        let scope = self.scope();
        let root = scope.root();
        if !root.info().vars.iter().any(|v| v == name) {
            scope.fatal(
                Message::from(format!("Variable {name:?} was not declared")),
                Location::caller(),
            );
        }
        root.config().vars.get(name).cloned()
    }

    #[track_caller]
    fn required_var(&self, name: &str) -> String {
        let location = Location::caller();
        let scope = self.scope();
        let root = scope.root();
        if !root.info().vars.iter().any(|v| v == name) {
            scope.fatal(
                Message::from(format!("Variable {name:?} was not declared")),
                location,
            );
        }
        match root.config().vars.get(name) {
            Some(value) => value.clone(),
            None => scope.fatal(
                Message::from(format!("Required variable {name:?} was not provided")),
                location,
            ),
        }
    }
}

pub trait OutDirAccess: EntityScoped {
    /// Directory for files the entity wants to keep.
    fn out_dir(&self) -> Option<PathBuf> {
        self.scope().root().out_dir().map(PathBuf::from)
    }
}

pub trait EntityMeta: EntityScoped {
    fn name(&self) -> &str {
        &self.scope().root().info().name
    }

    fn software_deps(&self) -> &[String] {
        &self.scope().root().info().software_deps
    }

    fn service_deps(&self) -> &[String] {
        &self.scope().root().info().service_deps
    }
}
