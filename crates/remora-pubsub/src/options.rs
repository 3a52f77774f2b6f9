//! Options accepted by the subscribe family of calls.

use crate::error::PubSubError;
use remora_core::{Credentials, Value};

/// Subscription options as carried over the wire in a struct.
///
/// `auth`/`secure` describe how to call the subscriber back; `pubauth`,
/// `pubsecure` and `name` are used when this broker subscribes itself to
/// an upstream publisher.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubscribeOptions {
    /// Whether sustained delivery failure may evict the subscriber.
    /// Unset means allowed.
    pub unsub: Option<bool>,
    pub auth: Option<Credentials>,
    pub secure: Option<bool>,
    /// Identity to subscribe under at the publisher.
    pub name: Option<String>,
    pub pubauth: Option<Credentials>,
    pub pubsecure: Option<bool>,
}

impl SubscribeOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn can_unsubscribe(&self) -> bool {
        self.unsub.unwrap_or(true)
    }

    pub fn with_unsub(mut self, unsub: bool) -> Self {
        self.unsub = Some(unsub);
        self
    }

    pub fn with_auth(mut self, auth: Credentials) -> Self {
        self.auth = Some(auth);
        self
    }

    pub fn with_secure(mut self, secure: bool) -> Self {
        self.secure = Some(secure);
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_pubauth(mut self, auth: Credentials) -> Self {
        self.pubauth = Some(auth);
        self
    }

    pub fn with_pubsecure(mut self, secure: bool) -> Self {
        self.pubsecure = Some(secure);
        self
    }

    /// Encode the set members only. Credentials travel as `"user:secret"`.
    pub fn to_value(&self) -> Value {
        let mut pairs: Vec<(&str, Value)> = Vec::new();
        if let Some(unsub) = self.unsub {
            pairs.push(("unsub", Value::Bool(unsub)));
        }
        if let Some(auth) = &self.auth {
            pairs.push(("auth", encode_credentials(auth)));
        }
        if let Some(secure) = self.secure {
            pairs.push(("secure", Value::Bool(secure)));
        }
        if let Some(name) = &self.name {
            pairs.push(("name", Value::from(name.as_str())));
        }
        if let Some(auth) = &self.pubauth {
            pairs.push(("pubauth", encode_credentials(auth)));
        }
        if let Some(secure) = self.pubsecure {
            pairs.push(("pubsecure", Value::Bool(secure)));
        }
        Value::from_pairs(pairs)
    }

    /// Decode from a struct. Nil means no options; unknown members are
    /// ignored.
    pub fn from_value(value: &Value) -> Result<Self, PubSubError> {
        if value.is_nil() {
            return Ok(Self::default());
        }
        if value.as_struct().is_none() {
            return Err(PubSubError::InvalidOptions(format!(
                "expected struct, got {}",
                value.type_name()
            )));
        }

        Ok(Self {
            unsub: flag(value, "unsub")?,
            auth: credentials(value, "auth")?,
            secure: flag(value, "secure")?,
            name: match value.get("name") {
                None | Some(Value::Nil) => None,
                Some(v) => Some(
                    v.as_str()
                        .ok_or_else(|| invalid("name", "string", v))?
                        .to_string(),
                ),
            },
            pubauth: credentials(value, "pubauth")?,
            pubsecure: flag(value, "pubsecure")?,
        })
    }
}

fn invalid(key: &str, expected: &str, got: &Value) -> PubSubError {
    PubSubError::InvalidOptions(format!(
        "'{}' must be a {}, got {}",
        key,
        expected,
        got.type_name()
    ))
}

fn flag(value: &Value, key: &str) -> Result<Option<bool>, PubSubError> {
    match value.get(key) {
        None | Some(Value::Nil) => Ok(None),
        Some(v) => v.as_bool().map(Some).ok_or_else(|| invalid(key, "bool", v)),
    }
}

fn encode_credentials(auth: &Credentials) -> Value {
    Value::from(format!("{}:{}", auth.user, auth.secret))
}

/// Credentials as `"user:secret"` or a `[user, secret]` pair.
fn credentials(value: &Value, key: &str) -> Result<Option<Credentials>, PubSubError> {
    match value.get(key) {
        None | Some(Value::Nil) => Ok(None),
        Some(Value::Str(s)) => Credentials::parse(s)
            .map(Some)
            .map_err(|e| PubSubError::InvalidOptions(e.to_string())),
        Some(Value::Array(pair)) => match pair.as_slice() {
            [Value::Str(user), Value::Str(secret)] => Ok(Some(Credentials::new(user, secret))),
            _ => Err(PubSubError::InvalidOptions(format!(
                "'{}' must be a [user, secret] pair",
                key
            ))),
        },
        Some(v) => Err(invalid(key, "credentials string", v)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encoding_keeps_unset_members_unset() {
        let options = SubscribeOptions::new()
            .with_unsub(false)
            .with_auth(Credentials::new("tsc", "pw"))
            .with_name("pubsub-summit");
        let value = options.to_value();
        assert!(value.get("secure").is_none());
        assert_eq!(value.get("auth").and_then(Value::as_str), Some("tsc:pw"));

        let decoded = SubscribeOptions::from_value(&value).unwrap();
        assert_eq!(decoded, options);
        assert!(!decoded.can_unsubscribe());
    }

    #[test]
    fn test_decoding_variants() {
        assert_eq!(
            SubscribeOptions::from_value(&Value::Nil).unwrap(),
            SubscribeOptions::default()
        );
        assert!(SubscribeOptions::default().can_unsubscribe());

        let pair = Value::from_pairs([(
            "pubauth",
            Value::Array(vec![Value::from("obs"), Value::from("secret")]),
        )]);
        let decoded = SubscribeOptions::from_value(&pair).unwrap();
        assert_eq!(decoded.pubauth, Some(Credentials::new("obs", "secret")));

        assert!(SubscribeOptions::from_value(&Value::Int(1)).is_err());
        let bad = Value::from_pairs([("unsub", Value::from("yes"))]);
        assert!(SubscribeOptions::from_value(&bad).is_err());
    }
}
