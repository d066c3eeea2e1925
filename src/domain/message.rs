// src/domain/message.rs

//! Message model and name validation.
//!
//! A [`Message`] is the unit of exchange between producers and consumers: an
//! ordered, string-keyed mapping with a mandatory `type` key that consumers
//! dispatch on. Values use the schemaless [`Value`] model (null, bool,
//! integers, floats, strings, byte strings, arrays, string-keyed maps) so
//! any configured codec can represent them.

use std::collections::BTreeMap;

use crate::{Error, Result};

/// Schemaless message value.
///
/// Re-exported from `rmpv`; this is the full set of shapes the default
/// binary codec can carry on the wire.
pub use rmpv::Value;

/// Maximum length of a channel or group name, in bytes.
const MAX_NAME_LEN: usize = 100;

/// A string-keyed message with a mandatory `type` key.
///
/// # Examples
///
/// ```
/// use channel_layers::Message;
///
/// let message = Message::new("chat.message")
///     .with("room", "lobby")
///     .with("body", "hello");
/// assert_eq!(message.msg_type(), Some("chat.message"));
/// ```
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Message {
    fields: BTreeMap<String, Value>,
}

impl Message {
    /// Create a message carrying the given `type`.
    pub fn new(msg_type: impl Into<String>) -> Self {
        // ---
        let mut fields = BTreeMap::new();
        fields.insert("type".to_string(), Value::from(msg_type.into()));
        Self { fields }
    }

    /// Builder-style insert.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        // ---
        self.fields.insert(key.into(), value.into());
        self
    }

    /// Insert or replace a field.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.fields.insert(key.into(), value.into());
    }

    /// Look up a field.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    /// The message `type`, if present and a string.
    pub fn msg_type(&self) -> Option<&str> {
        self.fields.get("type").and_then(Value::as_str)
    }

    /// Number of fields, including `type`.
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    /// Whether the message has no fields at all.
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Iterate fields in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.fields.iter()
    }

    /// Validate the message for sending.
    ///
    /// Requires a string `type` matching `[a-z][a-z0-9._-]*`.
    pub fn validate(&self) -> Result<()> {
        // ---
        let Some(msg_type) = self.msg_type() else {
            return Err(Error::InvalidMessage {
                reason: "missing string `type` key".to_string(),
            });
        };

        let mut chars = msg_type.chars();
        let head_ok = chars.next().is_some_and(|c| c.is_ascii_lowercase());
        let tail_ok = chars
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '.' | '_' | '-'));

        if head_ok && tail_ok {
            Ok(())
        } else {
            Err(Error::InvalidMessage {
                reason: format!("malformed `type`: {msg_type:?}"),
            })
        }
    }

    /// Convert into the value-model representation used by codecs.
    pub fn to_value(&self) -> Value {
        // ---
        Value::Map(
            self.fields
                .iter()
                .map(|(k, v)| (Value::from(k.as_str()), v.clone()))
                .collect(),
        )
    }

    /// Rebuild a message from its value-model representation.
    ///
    /// Fails unless the value is a map whose keys are all strings.
    pub fn from_value(value: Value) -> Result<Self> {
        // ---
        let Value::Map(entries) = value else {
            return Err(Error::Serialization(
                "decoded message is not a map".to_string(),
            ));
        };

        let mut fields = BTreeMap::new();
        for (key, value) in entries {
            let Some(key) = key.as_str() else {
                return Err(Error::Serialization(
                    "decoded message has a non-string key".to_string(),
                ));
            };
            fields.insert(key.to_string(), value);
        }

        Ok(Self { fields })
    }
}

impl FromIterator<(String, Value)> for Message {
    fn from_iter<I: IntoIterator<Item = (String, Value)>>(iter: I) -> Self {
        Self {
            fields: iter.into_iter().collect(),
        }
    }
}

/// Check a name against `[A-Za-z0-9!._-]{1,100}`.
fn name_chars_ok(name: &str) -> bool {
    // ---
    !name.is_empty()
        && name.len() <= MAX_NAME_LEN
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '!' | '.' | '_' | '-'))
}

/// Validate a channel name.
///
/// Channel names allow at most one `!`; the part after it is the shard
/// routing suffix for ephemeral channels.
pub(crate) fn validate_channel_name(name: &str) -> Result<()> {
    // ---
    if name_chars_ok(name) && name.matches('!').count() <= 1 {
        Ok(())
    } else {
        Err(Error::InvalidChannelName {
            name: name.to_string(),
        })
    }
}

/// Validate a group name.
pub(crate) fn validate_group_name(name: &str) -> Result<()> {
    // ---
    if name_chars_ok(name) {
        Ok(())
    } else {
        Err(Error::InvalidChannelName {
            name: name.to_string(),
        })
    }
}
