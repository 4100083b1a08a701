//! Outbound actions and their synchronous responses.

use crate::{
    constants::{KEY_ACTION_ID, KEY_MESSAGE, KEY_RESPONSE, LINE_TERMINATOR},
    error::{AmiError, AmiResult},
};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Validate that a user-provided string contains no newline characters.
///
/// AMI frames are line-delimited; embedded newlines would allow injection
/// of arbitrary protocol lines.
fn validate_no_newlines(s: &str, context: &str) -> AmiResult<()> {
    if s.contains('\n') || s.contains('\r') {
        return Err(AmiError::ProtocolError {
            message: format!("{} must not contain newlines", context),
        });
    }
    Ok(())
}

/// Ordered key/value list preserving duplicates.
///
/// The manager protocol allows a key to repeat within one frame (e.g.
/// multiple `Variable:` lines on an Originate), so a map is the wrong
/// shape. Lookups are ASCII case-insensitive because Asterisk's header
/// casing varies across versions.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fields(Vec<(String, String)>);

impl Fields {
    /// Create an empty field list.
    pub fn new() -> Self {
        Self(Vec::new())
    }

    /// Append a field, keeping insertion order.
    pub fn push(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.push((key.into(), value.into()));
    }

    /// First value for `key`, case-insensitive.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v.as_str())
    }

    /// All values for `key` in order, case-insensitive.
    pub fn get_all<'a>(&'a self, key: &'a str) -> impl Iterator<Item = &'a str> {
        self.0
            .iter()
            .filter(move |(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v.as_str())
    }

    /// Iterate over all `(key, value)` pairs in order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Number of fields.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the list is empty.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromIterator<(String, String)> for Fields {
    fn from_iter<T: IntoIterator<Item = (String, String)>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// An outbound request frame. Immutable once built.
///
/// Every action carries an `ActionID` used to correlate the reply; one is
/// generated if the caller does not supply one.
///
/// ```
/// use asterisk_ami_tokio::Action;
///
/// let action = Action::builder("Originate")
///     .field("Channel", "PJSIP/1000")
///     .field("Exten", "2000")
///     .field("Context", "default")
///     .build();
/// assert_eq!(action.name(), "Originate");
/// assert_eq!(action.fields().get("Channel"), Some("PJSIP/1000"));
/// ```
#[derive(Clone, PartialEq, Eq)]
pub struct Action {
    name: String,
    fields: Fields,
    action_id: String,
}

impl fmt::Debug for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Credential fields must never leak through Debug output.
        let fields: Vec<(&str, &str)> = self
            .fields
            .iter()
            .map(|(k, v)| {
                if k.eq_ignore_ascii_case("Secret") || k.eq_ignore_ascii_case("Password") {
                    (k, "[REDACTED]")
                } else {
                    (k, v)
                }
            })
            .collect();
        f.debug_struct("Action")
            .field("name", &self.name)
            .field("action_id", &self.action_id)
            .field("fields", &fields)
            .finish()
    }
}

impl Action {
    /// Start building an action with the given name.
    pub fn builder(name: impl Into<String>) -> ActionBuilder {
        ActionBuilder {
            name: name.into(),
            fields: Fields::new(),
            action_id: None,
        }
    }

    /// A `Login` action. The password never appears in `Debug` output.
    pub fn login(username: &str, password: &str) -> Self {
        Action::builder("Login")
            .field("Username", username)
            .field("Secret", password)
            .build()
    }

    /// A `Logoff` action.
    pub fn logoff() -> Self {
        Action::builder("Logoff").build()
    }

    /// A `Ping` action, used as the pool health probe.
    pub fn ping() -> Self {
        Action::builder("Ping").build()
    }

    /// An `Originate` action placing a call from `channel` to `exten`
    /// in `context`.
    pub fn originate(channel: &str, exten: &str, context: &str) -> Self {
        Action::builder("Originate")
            .field("Channel", channel)
            .field("Exten", exten)
            .field("Context", context)
            .field("Priority", "1")
            .build()
    }

    /// A `Hangup` action for `channel`.
    pub fn hangup(channel: &str) -> Self {
        Action::builder("Hangup").field("Channel", channel).build()
    }

    /// A `QueueAdd` action adding `interface` to `queue`.
    pub fn queue_add(queue: &str, interface: &str) -> Self {
        Action::builder("QueueAdd")
            .field("Queue", queue)
            .field("Interface", interface)
            .build()
    }

    /// A `QueueRemove` action removing `interface` from `queue`.
    pub fn queue_remove(queue: &str, interface: &str) -> Self {
        Action::builder("QueueRemove")
            .field("Queue", queue)
            .field("Interface", interface)
            .build()
    }

    /// A `QueuePause` action pausing or unpausing `interface` in `queue`.
    pub fn queue_pause(queue: &str, interface: &str, paused: bool) -> Self {
        Action::builder("QueuePause")
            .field("Queue", queue)
            .field("Interface", interface)
            .field("Paused", if paused { "true" } else { "false" })
            .build()
    }

    /// Action name (the `Action:` line value).
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Action fields, excluding `Action` and `ActionID`.
    pub fn fields(&self) -> &Fields {
        &self.fields
    }

    /// Correlation id echoed back by the server on the reply.
    pub fn action_id(&self) -> &str {
        &self.action_id
    }

    /// Validate all user-supplied lines, then render the wire frame.
    pub fn to_wire_format(&self) -> AmiResult<String> {
        use std::fmt::Write;

        validate_no_newlines(&self.name, "action name")?;
        validate_no_newlines(&self.action_id, "action id")?;

        let mut out = String::new();
        let _ = write!(out, "Action: {}{}", self.name, LINE_TERMINATOR);
        let _ = write!(out, "ActionID: {}{}", self.action_id, LINE_TERMINATOR);
        for (key, value) in self.fields.iter() {
            validate_no_newlines(key, "field name")?;
            validate_no_newlines(value, "field value")?;
            let _ = write!(out, "{}: {}{}", key, value, LINE_TERMINATOR);
        }
        out.push_str(LINE_TERMINATOR);
        Ok(out)
    }
}

/// Builder returned by [`Action::builder`].
#[derive(Debug)]
pub struct ActionBuilder {
    name: String,
    fields: Fields,
    action_id: Option<String>,
}

impl ActionBuilder {
    /// Append a field. Repeated keys are preserved in order.
    pub fn field(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.fields.push(key, value);
        self
    }

    /// Supply an explicit correlation id instead of a generated one.
    pub fn action_id(mut self, id: impl Into<String>) -> Self {
        self.action_id = Some(id.into());
        self
    }

    /// Finalize the action. A uuid `ActionID` is generated if none was set.
    pub fn build(self) -> Action {
        Action {
            name: self.name,
            fields: self.fields,
            action_id: self
                .action_id
                .unwrap_or_else(|| Uuid::new_v4().to_string()),
        }
    }
}

/// Reply classification per the wire protocol.
///
/// Asterisk replies `Response: Success` on success, `Response: Error` on
/// failure, and `Response: Goodbye` acknowledging a `Logoff`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum ResponseStatus {
    /// `Response: Success` (or `Goodbye`, which ends the session cleanly).
    Success,
    /// `Response: Error`.
    Error,
    /// Response line present but matched neither known value.
    Other,
}

/// The synchronous reply to an [`Action`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionResponse {
    fields: Fields,
    status: ResponseStatus,
}

impl ActionResponse {
    /// Status is derived from the `Response` field.
    pub fn new(fields: Fields) -> Self {
        let status = match fields.get(KEY_RESPONSE) {
            Some(v) if v.eq_ignore_ascii_case("Success") => ResponseStatus::Success,
            Some(v) if v.eq_ignore_ascii_case("Goodbye") => ResponseStatus::Success,
            Some(v) if v.eq_ignore_ascii_case("Error") => ResponseStatus::Error,
            _ => ResponseStatus::Other,
        };
        Self { fields, status }
    }

    /// `true` if the server accepted the action.
    pub fn is_success(&self) -> bool {
        self.status == ResponseStatus::Success
    }

    /// Classification of the `Response` field.
    pub fn status(&self) -> ResponseStatus {
        self.status
    }

    /// The `Message` field, if present.
    pub fn message(&self) -> Option<&str> {
        self.fields.get(KEY_MESSAGE)
    }

    /// The echoed `ActionID`, if present.
    pub fn action_id(&self) -> Option<&str> {
        self.fields.get(KEY_ACTION_ID)
    }

    /// Look up a reply field by name.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.fields.get(key)
    }

    /// All reply fields.
    pub fn fields(&self) -> &Fields {
        &self.fields
    }

    /// Convert to a result based on the response status.
    pub fn into_result(self) -> AmiResult<Self> {
        match self.status {
            ResponseStatus::Success => Ok(self),
            ResponseStatus::Error | ResponseStatus::Other => {
                let message = self.message().unwrap_or("unknown error").to_string();
                Err(AmiError::ActionFailed { message })
            }
        }
    }
}

impl fmt::Display for ActionResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:?}: {}",
            self.status,
            self.message().unwrap_or_default()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fields(pairs: &[(&str, &str)]) -> Fields {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_fields_duplicate_keys_preserved() {
        let mut f = Fields::new();
        f.push("Variable", "a=1");
        f.push("Variable", "b=2");
        assert_eq!(f.get("Variable"), Some("a=1"));
        let all: Vec<_> = f.get_all("Variable").collect();
        assert_eq!(all, vec!["a=1", "b=2"]);
    }

    #[test]
    fn test_fields_case_insensitive_lookup() {
        let f = fields(&[("ActionID", "abc")]);
        assert_eq!(f.get("actionid"), Some("abc"));
        assert_eq!(f.get("ACTIONID"), Some("abc"));
        assert_eq!(f.get("missing"), None);
    }

    #[test]
    fn test_action_wire_format() {
        let action = Action::builder("Ping").action_id("id-1").build();
        let wire = action.to_wire_format().unwrap();
        assert_eq!(wire, "Action: Ping\r\nActionID: id-1\r\n\r\n");
    }

    #[test]
    fn test_action_wire_format_with_fields() {
        let action = Action::builder("Hangup")
            .field("Channel", "PJSIP/1000-00000001")
            .action_id("id-2")
            .build();
        let wire = action.to_wire_format().unwrap();
        assert!(wire.starts_with("Action: Hangup\r\n"));
        assert!(wire.contains("Channel: PJSIP/1000-00000001\r\n"));
        assert!(wire.ends_with("\r\n\r\n"));
    }

    #[test]
    fn test_action_id_generated_when_absent() {
        let a = Action::builder("Ping").build();
        let b = Action::builder("Ping").build();
        assert!(!a.action_id().is_empty());
        assert_ne!(a.action_id(), b.action_id());
    }

    #[test]
    fn test_duplicate_fields_in_wire_format() {
        let action = Action::builder("Originate")
            .field("Channel", "PJSIP/1000")
            .field("Variable", "a=1")
            .field("Variable", "b=2")
            .action_id("id-3")
            .build();
        let wire = action.to_wire_format().unwrap();
        let first = wire.find("Variable: a=1").unwrap();
        let second = wire.find("Variable: b=2").unwrap();
        assert!(first < second);
    }

    #[test]
    fn test_newline_injection_rejected() {
        let action = Action::builder("Ping")
            .field("X-Bad", "value\r\nAction: Logoff")
            .build();
        assert!(action.to_wire_format().is_err());

        let action = Action::builder("Ping\nAction: Logoff").build();
        assert!(action.to_wire_format().is_err());
    }

    #[test]
    fn test_response_status_success() {
        let resp = ActionResponse::new(fields(&[("Response", "Success"), ("Message", "ok")]));
        assert!(resp.is_success());
        assert_eq!(resp.status(), ResponseStatus::Success);
        assert!(resp.into_result().is_ok());
    }

    #[test]
    fn test_response_status_goodbye_is_success() {
        let resp = ActionResponse::new(fields(&[("Response", "Goodbye")]));
        assert!(resp.is_success());
    }

    #[test]
    fn test_response_status_error() {
        let resp = ActionResponse::new(fields(&[
            ("Response", "Error"),
            ("Message", "Permission denied"),
        ]));
        assert!(!resp.is_success());
        let err = resp.into_result().unwrap_err();
        assert!(
            matches!(err, AmiError::ActionFailed { ref message } if message == "Permission denied")
        );
    }

    #[test]
    fn test_response_status_missing_is_other() {
        let resp = ActionResponse::new(fields(&[("Message", "weird")]));
        assert_eq!(resp.status(), ResponseStatus::Other);
        assert!(resp.into_result().is_err());
    }

    #[test]
    fn test_debug_redacts_secret() {
        let action = Action::login("admin", "secret123");
        let debug_str = format!("{:?}", action);
        assert!(!debug_str.contains("secret123"));
        assert!(debug_str.contains("REDACTED"));
        assert!(debug_str.contains("admin"));
    }

    #[test]
    fn test_typed_builders() {
        let wire = Action::queue_pause("support", "PJSIP/agent1", true)
            .to_wire_format()
            .unwrap();
        assert!(wire.contains("Action: QueuePause\r\n"));
        assert!(wire.contains("Queue: support\r\n"));
        assert!(wire.contains("Interface: PJSIP/agent1\r\n"));
        assert!(wire.contains("Paused: true\r\n"));

        let wire = Action::originate("PJSIP/1000", "2000", "default")
            .to_wire_format()
            .unwrap();
        assert!(wire.contains("Exten: 2000\r\n"));
        assert!(wire.contains("Priority: 1\r\n"));
    }
}
