//! Per-message context, threaded explicitly through every call.

use crate::{InboundMessage, Properties, SpanId, TraceId};

/// Property keys used to carry [`MessageContext`] across the broker.
pub mod keys {
    pub const CORP_KEY: &str = "corp_key";
    pub const APP_NAME: &str = "app_name";
    pub const TRACE_ID: &str = "trace_id";
    pub const SPAN_ID: &str = "span_id";
}

/// Tenant and trace context for one message.
///
/// Built by the listener container from the inbound properties and handed to
/// interceptors and handlers; the send path writes it back into outbound
/// properties so it propagates downstream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageContext {
    corp_key: Option<String>,
    app_name: Option<String>,
    trace_id: TraceId,
    span_id: SpanId,
    route: String,
}

impl MessageContext {
    /// A fresh context with new trace and span ids.
    pub fn new() -> Self {
        Self {
            corp_key: None,
            app_name: None,
            trace_id: TraceId::new(),
            span_id: SpanId::new(),
            route: String::new(),
        }
    }

    /// Read context from message properties.
    ///
    /// The trace id is kept when present and parseable; a new span is always
    /// started for the consuming side.
    pub fn from_message(msg: &InboundMessage) -> Self {
        let trace_id = msg
            .property(keys::TRACE_ID)
            .and_then(|s| s.parse().ok())
            .unwrap_or_default();

        Self {
            corp_key: msg.property(keys::CORP_KEY).map(str::to_string),
            app_name: msg.property(keys::APP_NAME).map(str::to_string),
            trace_id,
            span_id: SpanId::new(),
            route: String::new(),
        }
    }

    pub fn with_corp_key(mut self, corp_key: impl Into<String>) -> Self {
        self.corp_key = Some(corp_key.into());
        self
    }

    pub fn with_app_name(mut self, app_name: impl Into<String>) -> Self {
        self.app_name = Some(app_name.into());
        self
    }

    pub fn with_route(mut self, route: impl Into<String>) -> Self {
        self.route = route.into();
        self
    }

    pub fn corp_key(&self) -> Option<&str> {
        self.corp_key.as_deref()
    }

    pub fn app_name(&self) -> Option<&str> {
        self.app_name.as_deref()
    }

    pub fn trace_id(&self) -> TraceId {
        self.trace_id
    }

    pub fn span_id(&self) -> SpanId {
        self.span_id
    }

    /// Business route selected for this message (empty for the default handler).
    pub fn route(&self) -> &str {
        &self.route
    }

    /// Write this context into outbound properties.
    pub fn inject(&self, properties: &mut Properties) {
        if let Some(corp_key) = &self.corp_key {
            properties.insert(keys::CORP_KEY.to_string(), corp_key.clone());
        }
        if let Some(app_name) = &self.app_name {
            properties.insert(keys::APP_NAME.to_string(), app_name.clone());
        }
        properties.insert(keys::TRACE_ID.to_string(), self.trace_id.to_string());
        properties.insert(keys::SPAN_ID.to_string(), self.span_id.to_string());
    }
}

impl Default for MessageContext {
    fn default() -> Self {
        Self::new()
    }
}
