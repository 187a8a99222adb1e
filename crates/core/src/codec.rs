//! Payload serialization.
//!
//! Strings and byte arrays travel as-is, primitives as their text rendering,
//! and structured values as JSON (wrap them in [`Json`]).

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::ProcessingError;

/// A type that can be carried as a message payload.
pub trait MessagePayload: Sized {
    fn decode(bytes: &[u8]) -> Result<Self, ProcessingError>;

    fn encode(&self) -> Result<Vec<u8>, ProcessingError>;

    /// Declared payload type, used in logs.
    fn type_name() -> &'static str {
        std::any::type_name::<Self>()
    }
}

impl MessagePayload for String {
    fn decode(bytes: &[u8]) -> Result<Self, ProcessingError> {
        String::from_utf8(bytes.to_vec())
            .map_err(|e| ProcessingError::serialization("payload is not valid UTF-8").with_source(e))
    }

    fn encode(&self) -> Result<Vec<u8>, ProcessingError> {
        Ok(self.as_bytes().to_vec())
    }
}

impl MessagePayload for Vec<u8> {
    fn decode(bytes: &[u8]) -> Result<Self, ProcessingError> {
        Ok(bytes.to_vec())
    }

    fn encode(&self) -> Result<Vec<u8>, ProcessingError> {
        Ok(self.clone())
    }
}

macro_rules! impl_text_payload {
    ($($t:ty),* $(,)?) => {
        $(
            impl MessagePayload for $t {
                fn decode(bytes: &[u8]) -> Result<Self, ProcessingError> {
                    let text = std::str::from_utf8(bytes).map_err(|e| {
                        ProcessingError::serialization("payload is not valid UTF-8").with_source(e)
                    })?;
                    text.trim().parse::<$t>().map_err(|e| {
                        ProcessingError::serialization(format!(
                            "cannot parse `{}` as {}: {}",
                            text,
                            stringify!($t),
                            e
                        ))
                    })
                }

                fn encode(&self) -> Result<Vec<u8>, ProcessingError> {
                    Ok(self.to_string().into_bytes())
                }
            }
        )*
    };
}

impl_text_payload!(bool, i8, i16, i32, i64, u8, u16, u32, u64, f32, f64);

impl MessagePayload for serde_json::Value {
    fn decode(bytes: &[u8]) -> Result<Self, ProcessingError> {
        Ok(serde_json::from_slice(bytes)?)
    }

    fn encode(&self) -> Result<Vec<u8>, ProcessingError> {
        Ok(serde_json::to_vec(self)?)
    }
}

/// JSON-encoded structured payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Json<T>(pub T);

impl<T> Json<T> {
    pub fn into_inner(self) -> T {
        self.0
    }
}

impl<T> MessagePayload for Json<T>
where
    T: Serialize + DeserializeOwned,
{
    fn decode(bytes: &[u8]) -> Result<Self, ProcessingError> {
        Ok(Json(serde_json::from_slice(bytes)?))
    }

    fn encode(&self) -> Result<Vec<u8>, ProcessingError> {
        Ok(serde_json::to_vec(&self.0)?)
    }

    fn type_name() -> &'static str {
        std::any::type_name::<T>()
    }
}

/// Extract a single top-level field from a JSON object payload.
///
/// String values are returned unquoted; numbers and booleans are rendered as
/// text. Returns `None` for non-object payloads, missing keys, null, and
/// nested objects/arrays.
pub fn extract_field(payload: &[u8], key: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_slice(payload).ok()?;
    match value.as_object()?.get(key)? {
        serde_json::Value::String(s) => Some(s.clone()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        serde_json::Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}
