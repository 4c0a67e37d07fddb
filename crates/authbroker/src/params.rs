//! Request parameters
//!
//! Callers send a loosely typed string-keyed map. The map is kept as-is for
//! matching; typed accessors below are used once, when the request kind is
//! derived.

use serde_json::Value;
use thiserror::Error;

/// Parameter map supplied by a caller
pub type Parameters = serde_json::Map<String, Value>;

// Accounts interface
pub const KEY_PROVIDER: &str = "provider";
pub const KEY_SERVICE_TYPE: &str = "serviceType";
pub const KEY_APPLICATION_ID: &str = "applicationId";
pub const KEY_WINDOW_ID: &str = "windowId";

// SignOn interface
pub const KEY_REQUEST_ID: &str = "requestId";
pub const KEY_OPEN_URL: &str = "openUrl";
pub const KEY_IDENTITY: &str = "identity";
pub const KEY_METHOD: &str = "method";
pub const KEY_MECHANISM: &str = "mechanism";
pub const KEY_CLIENT_DATA: &str = "clientData";
/// Provider named by the credential store inside `clientData`
pub const KEY_CLIENT_PROVIDER_ID: &str = "providerId";
pub const KEY_PID: &str = "pid";
pub const KEY_QUERY_USERNAME: &str = "queryUsername";
pub const KEY_QUERY_PASSWORD: &str = "queryPassword";

/// Returns true if every key of `pattern` exists in `candidate` with an
/// equal value. Extra keys in `candidate` are ignored.
pub fn is_superset(candidate: &Parameters, pattern: &Parameters) -> bool {
    pattern
        .iter()
        .all(|(key, value)| candidate.get(key) == Some(value))
}

/// Copy the listed keys that are present in `params`
pub fn subset(params: &Parameters, keys: &[&str]) -> Parameters {
    keys.iter()
        .filter_map(|key| params.get(*key).map(|v| (key.to_string(), v.clone())))
        .collect()
}

/// A parameter holding a value of the wrong type
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("'{0}' must be an unsigned integer")]
pub struct NotUnsigned(pub String);

/// Typed views over a parameter map
pub trait ParametersExt {
    /// String value, if present and a string
    fn str_value(&self, key: &str) -> Option<&str>;

    /// Unsigned value. `Ok(None)` when absent, an error when present but not
    /// an unsigned integer that fits in 32 bits.
    fn u32_value(&self, key: &str) -> Result<Option<u32>, NotUnsigned>;
}

impl ParametersExt for Parameters {
    fn str_value(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(Value::as_str)
    }

    fn u32_value(&self, key: &str) -> Result<Option<u32>, NotUnsigned> {
        match self.get(key) {
            None => Ok(None),
            Some(value) => value
                .as_u64()
                .and_then(|v| u32::try_from(v).ok())
                .map(Some)
                .ok_or_else(|| NotUnsigned(key.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn map(value: Value) -> Parameters {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_superset_match() {
        let candidate = map(json!({"provider": "foo", "windowId": 3, "extra": true}));

        assert!(is_superset(&candidate, &map(json!({"provider": "foo"}))));
        assert!(is_superset(
            &candidate,
            &map(json!({"provider": "foo", "windowId": 3}))
        ));
        assert!(!is_superset(&candidate, &map(json!({"provider": "bar"}))));
        assert!(!is_superset(&candidate, &map(json!({"missing": "foo"}))));
        // Empty pattern matches everything
        assert!(is_superset(&candidate, &Parameters::new()));
    }

    #[test]
    fn test_superset_compares_values_strictly() {
        let candidate = map(json!({"identity": 5}));
        assert!(!is_superset(&candidate, &map(json!({"identity": "5"}))));
    }

    #[test]
    fn test_subset() {
        let params = map(json!({"identity": 5, "method": "oauth2", "other": 1}));
        let key = subset(&params, &[KEY_IDENTITY, KEY_METHOD, KEY_MECHANISM]);
        assert_eq!(key, map(json!({"identity": 5, "method": "oauth2"})));
    }

    #[test]
    fn test_u32_value() {
        let params = map(json!({"windowId": 12, "bad": "12", "neg": -1, "big": 5_000_000_000u64}));
        assert_eq!(params.u32_value(KEY_WINDOW_ID), Ok(Some(12)));
        assert_eq!(params.u32_value("absent"), Ok(None));
        assert_eq!(params.u32_value("bad"), Err(NotUnsigned("bad".to_string())));
        assert!(params.u32_value("neg").is_err());
        let err = params.u32_value("big").unwrap_err();
        assert_eq!(err.to_string(), "'big' must be an unsigned integer");
    }
}
