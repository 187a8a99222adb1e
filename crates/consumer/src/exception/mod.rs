//! Error class → response action resolution.

mod registry;

pub use registry::{
    DEFAULT_RECONSUME_DELAY, ExceptionHandlerBinding, ExceptionHandlerFn, ExceptionHandlerRegistry,
    RegistryStats, ResolvedAction, ResponseAction,
};
