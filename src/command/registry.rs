//! Extension registry
//!
//! Maps command names to the handler that executes them, the resources the
//! command must hold exclusively, and the argument shapes it accepts. Built
//! once at startup and then only read.

use futures::future::BoxFuture;
use futures::FutureExt;
use serde_json::Value;
use std::collections::{BTreeSet, HashMap};
use std::future::Future;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use super::handlers::HandlerContext;
use super::types::{Arguments, CommandError, HandlerResult};

pub type HandlerFuture = BoxFuture<'static, HandlerResult>;
pub type Handler = Arc<dyn Fn(HandlerContext) -> HandlerFuture + Send + Sync>;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("extension `{0}` is already registered")]
    DuplicateExtension(String),

    #[error("unknown command `{0}`")]
    UnknownCommand(String),
}

/// Accepted shape of one argument
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgKind {
    String,
    NonEmptyString,
    Bool,
    Integer,
    IpAddr,
    OneOf(&'static [&'static str]),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArgSpec {
    pub name: &'static str,
    pub kind: ArgKind,
    pub required: bool,
}

impl ArgSpec {
    pub const fn required(name: &'static str, kind: ArgKind) -> Self {
        Self {
            name,
            kind,
            required: true,
        }
    }

    pub const fn optional(name: &'static str, kind: ArgKind) -> Self {
        Self {
            name,
            kind,
            required: false,
        }
    }

    fn check(&self, value: &Value) -> Result<(), String> {
        let ok = match self.kind {
            ArgKind::String => value.is_string(),
            ArgKind::NonEmptyString => value.as_str().is_some_and(|s| !s.trim().is_empty()),
            ArgKind::Bool => value.is_boolean(),
            ArgKind::Integer => value.is_i64() || value.is_u64(),
            ArgKind::IpAddr => value.as_str().is_some_and(|s| s.parse::<IpAddr>().is_ok()),
            ArgKind::OneOf(allowed) => value.as_str().is_some_and(|s| allowed.contains(&s)),
        };
        if ok {
            return Ok(());
        }
        Err(match self.kind {
            ArgKind::String => format!("`{}` must be a string", self.name),
            ArgKind::NonEmptyString => format!("`{}` must be a non-empty string", self.name),
            ArgKind::Bool => format!("`{}` must be a boolean", self.name),
            ArgKind::Integer => format!("`{}` must be an integer", self.name),
            ArgKind::IpAddr => format!("`{}` must be an IP address, got {value}", self.name),
            ArgKind::OneOf(allowed) => {
                format!("`{}` must be one of {}, got {value}", self.name, allowed.join(", "))
            }
        })
    }
}

/// One registered command
pub struct Extension {
    name: String,
    resources: BTreeSet<String>,
    args: Vec<ArgSpec>,
    deadline: Option<Duration>,
    handler: Handler,
}

impl Extension {
    pub fn new<F, Fut>(name: impl Into<String>, handler: F) -> Self
    where
        F: Fn(HandlerContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        Self {
            name: name.into(),
            resources: BTreeSet::new(),
            args: Vec::new(),
            deadline: None,
            handler: Arc::new(move |ctx| handler(ctx).boxed()),
        }
    }

    /// Declare a resource the command must hold exclusively
    pub fn requires(mut self, resource: impl Into<String>) -> Self {
        self.resources.insert(resource.into());
        self
    }

    pub fn arg(mut self, spec: ArgSpec) -> Self {
        self.args.push(spec);
        self
    }

    /// Deadline used when the command does not carry its own
    pub fn deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn resources(&self) -> &BTreeSet<String> {
        &self.resources
    }

    pub fn default_deadline(&self) -> Option<Duration> {
        self.deadline
    }

    /// Check presence and shape of every declared argument. Undeclared
    /// arguments are ignored.
    pub fn validate(&self, args: &Arguments) -> Result<(), CommandError> {
        for spec in &self.args {
            match args.get(spec.name) {
                None | Some(Value::Null) if spec.required => {
                    return Err(CommandError::invalid_arguments(format!(
                        "missing required argument `{}`",
                        spec.name
                    )));
                }
                None | Some(Value::Null) => {}
                Some(value) => spec.check(value).map_err(CommandError::invalid_arguments)?,
            }
        }
        Ok(())
    }

    pub(crate) fn invoke(&self, ctx: HandlerContext) -> HandlerFuture {
        (self.handler)(ctx)
    }
}

impl std::fmt::Debug for Extension {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Extension")
            .field("name", &self.name)
            .field("resources", &self.resources)
            .field("args", &self.args)
            .field("deadline", &self.deadline)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Default)]
pub struct ExtensionRegistry {
    extensions: HashMap<String, Arc<Extension>>,
}

impl ExtensionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, extension: Extension) -> Result<(), RegistryError> {
        if self.extensions.contains_key(extension.name()) {
            return Err(RegistryError::DuplicateExtension(extension.name.clone()));
        }
        self.extensions
            .insert(extension.name.clone(), Arc::new(extension));
        Ok(())
    }

    pub fn resolve(&self, name: &str) -> Result<Arc<Extension>, RegistryError> {
        self.extensions
            .get(name)
            .cloned()
            .ok_or_else(|| RegistryError::UnknownCommand(name.to_string()))
    }

    /// Registered command names, sorted
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.extensions.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}
