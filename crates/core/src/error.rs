//! Processing error model.
//!
//! Handler failures are classified by an [`ErrorClass`]: a named node in a
//! single-parent hierarchy rooted at [`class::EXCEPTION`]. Exception handler
//! resolution and retry classification both walk this hierarchy, so a custom
//! class only has to name its parent to inherit every policy attached to it.

use std::error::Error as StdError;
use std::fmt;
use std::sync::Arc;

use thiserror::Error;

/// A node in the error class hierarchy.
///
/// Classes are compared by name; names must be unique within a process.
/// Declare custom classes as statics so they can be referenced by `&'static`:
///
/// ```
/// use courier_core::{ErrorClass, class};
///
/// static ORDER_REJECTED: ErrorClass = ErrorClass::new("order_rejected", Some(&class::ILLEGAL_STATE));
/// assert!(class::RUNTIME.is_assignable_from(&ORDER_REJECTED));
/// ```
#[derive(Debug)]
pub struct ErrorClass {
    name: &'static str,
    parent: Option<&'static ErrorClass>,
}

impl ErrorClass {
    pub const fn new(name: &'static str, parent: Option<&'static ErrorClass>) -> Self {
        Self { name, parent }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn parent(&self) -> Option<&'static ErrorClass> {
        self.parent
    }

    /// Iterate from this class up to the root, starting with `self`.
    pub fn lineage(&self) -> Lineage<'_> {
        Lineage { next: Some(self) }
    }

    /// Number of parent hops from `self` to `ancestor`, if `ancestor` is in the lineage.
    pub fn distance_to(&self, ancestor: &ErrorClass) -> Option<usize> {
        self.lineage().position(|c| c == ancestor)
    }

    /// `true` when `other` is this class or one of its descendants.
    pub fn is_assignable_from(&self, other: &ErrorClass) -> bool {
        other.distance_to(self).is_some()
    }

    /// `true` when this class is `ancestor` or descends from it.
    pub fn is_a(&self, ancestor: &ErrorClass) -> bool {
        ancestor.is_assignable_from(self)
    }
}

impl PartialEq for ErrorClass {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
    }
}

impl Eq for ErrorClass {}

impl std::hash::Hash for ErrorClass {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.name.hash(state);
    }
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)
    }
}

/// Iterator over an [`ErrorClass`] and its ancestors.
#[derive(Debug, Clone)]
pub struct Lineage<'a> {
    next: Option<&'a ErrorClass>,
}

impl<'a> Iterator for Lineage<'a> {
    type Item = &'a ErrorClass;

    fn next(&mut self) -> Option<Self::Item> {
        let current = self.next?;
        self.next = current.parent;
        Some(current)
    }
}

/// Built-in error classes.
pub mod class {
    use super::ErrorClass;

    /// Root of the hierarchy; the catch-all handler binds here.
    pub static EXCEPTION: ErrorClass = ErrorClass::new("exception", None);

    pub static RUNTIME: ErrorClass = ErrorClass::new("runtime", Some(&EXCEPTION));
    pub static ILLEGAL_ARGUMENT: ErrorClass = ErrorClass::new("illegal_argument", Some(&RUNTIME));
    pub static NULL_POINTER: ErrorClass = ErrorClass::new("null_pointer", Some(&RUNTIME));
    pub static ILLEGAL_STATE: ErrorClass = ErrorClass::new("illegal_state", Some(&RUNTIME));
    pub static CLASS_CAST: ErrorClass = ErrorClass::new("class_cast", Some(&RUNTIME));
    pub static UNSUPPORTED_OPERATION: ErrorClass =
        ErrorClass::new("unsupported_operation", Some(&RUNTIME));
    pub static SECURITY: ErrorClass = ErrorClass::new("security", Some(&RUNTIME));

    /// Payload could not be decoded into the handler's declared type.
    pub static SERIALIZATION: ErrorClass = ErrorClass::new("serialization", Some(&RUNTIME));
    /// No handler is bound to the message's business route.
    pub static UNROUTABLE: ErrorClass = ErrorClass::new("unroutable", Some(&RUNTIME));

    pub static IO: ErrorClass = ErrorClass::new("io", Some(&EXCEPTION));
    pub static NETWORK: ErrorClass = ErrorClass::new("network", Some(&IO));
    pub static CONNECT: ErrorClass = ErrorClass::new("connect", Some(&NETWORK));
    pub static SOCKET_TIMEOUT: ErrorClass = ErrorClass::new("socket_timeout", Some(&NETWORK));

    pub static TIMEOUT: ErrorClass = ErrorClass::new("timeout", Some(&EXCEPTION));
}

/// A failure raised while processing a message.
///
/// This is what handler closures return; the class decides which exception
/// handler binding and which retry policy apply.
#[derive(Debug, Clone, Error)]
#[error("{class}: {message}")]
pub struct ProcessingError {
    class: &'static ErrorClass,
    message: String,
    #[source]
    source: Option<Arc<dyn StdError + Send + Sync + 'static>>,
}

impl ProcessingError {
    pub fn new(class: &'static ErrorClass, message: impl Into<String>) -> Self {
        Self {
            class,
            message: message.into(),
            source: None,
        }
    }

    /// Attach an underlying cause.
    pub fn with_source(mut self, source: impl StdError + Send + Sync + 'static) -> Self {
        self.source = Some(Arc::new(source));
        self
    }

    pub fn class(&self) -> &'static ErrorClass {
        self.class
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn runtime(msg: impl Into<String>) -> Self {
        Self::new(&class::RUNTIME, msg)
    }

    pub fn illegal_argument(msg: impl Into<String>) -> Self {
        Self::new(&class::ILLEGAL_ARGUMENT, msg)
    }

    pub fn illegal_state(msg: impl Into<String>) -> Self {
        Self::new(&class::ILLEGAL_STATE, msg)
    }

    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::new(&class::SERIALIZATION, msg)
    }

    pub fn unroutable(msg: impl Into<String>) -> Self {
        Self::new(&class::UNROUTABLE, msg)
    }

    pub fn network(msg: impl Into<String>) -> Self {
        Self::new(&class::NETWORK, msg)
    }

    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::new(&class::TIMEOUT, msg)
    }
}

impl From<serde_json::Error> for ProcessingError {
    fn from(err: serde_json::Error) -> Self {
        Self::serialization(err.to_string()).with_source(err)
    }
}
