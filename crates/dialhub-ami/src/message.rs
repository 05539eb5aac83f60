//! AMI wire codec
//!
//! Messages are ASCII `Key: Value` lines terminated by `CRLF`, with a blank
//! line (`CRLF CRLF`) closing the message. Keys may repeat (`Variable:` does
//! on Originate), so fields are kept as an ordered list rather than a map.

/// A single AMI message: an ordered list of `Key: Value` pairs
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AmiMessage {
    fields: Vec<(String, String)>,
}

impl AmiMessage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start building an action message.
    pub fn action(name: &str) -> Self {
        let mut msg = Self::new();
        msg.push("Action", name);
        msg
    }

    /// Append a field, preserving order and allowing duplicate keys.
    pub fn push(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.fields.push((key.into(), value.into()));
    }

    /// Builder-style `push`.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.push(key, value);
        self
    }

    /// First value for `key`, if present.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// All values for `key`, in order.
    pub fn get_all<'a>(&'a self, key: &'a str) -> impl Iterator<Item = &'a str> {
        self.fields
            .iter()
            .filter(move |(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn event(&self) -> Option<&str> {
        self.get("Event")
    }

    pub fn action_id(&self) -> Option<&str> {
        self.get("ActionID")
    }

    pub fn response(&self) -> Option<&str> {
        self.get("Response")
    }

    pub fn is_success(&self) -> bool {
        self.response() == Some("Success")
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn fields(&self) -> &[(String, String)] {
        &self.fields
    }

    /// Parse one message block (without its terminating blank line).
    ///
    /// Each line is split on the first `:`; both sides are trimmed. Lines
    /// without a colon (banner fragments, continuation noise) are skipped.
    pub fn parse(block: &str) -> Self {
        let mut msg = Self::new();
        for line in block.split("\r\n") {
            let line = line.trim_end_matches('\n');
            if let Some((key, value)) = line.split_once(':') {
                msg.push(key.trim(), value.trim());
            }
        }
        msg
    }

    /// Serialize to the wire format, including the terminating blank line.
    pub fn to_wire(&self) -> String {
        let mut out = String::new();
        for (key, value) in &self.fields {
            out.push_str(key);
            out.push_str(": ");
            out.push_str(value);
            out.push_str("\r\n");
        }
        out.push_str("\r\n");
        out
    }
}
