use bson::Bson;

use crate::sdam::ServerAddress;

pub(crate) mod command;
pub(crate) mod server_selection;

pub(crate) const COMMAND_TRACING_EVENT_TARGET: &str = "mongodb_executor::command";
pub(crate) const SERVER_SELECTION_TRACING_EVENT_TARGET: &str = "mongodb_executor::server_selection";
pub(crate) const CURSOR_TRACING_EVENT_TARGET: &str = "mongodb_executor::cursor";

/// The length commands and replies are truncated to in tracing events unless configured
/// otherwise.
pub(crate) const DEFAULT_MAX_DOCUMENT_LENGTH_BYTES: usize = 1000;

pub(crate) trait TracingRepresentation {
    type Representation;

    fn tracing_representation(&self) -> Self::Representation;
}

impl TracingRepresentation for bson::Document {
    type Representation = String;

    fn tracing_representation(&self) -> String {
        Bson::Document(self.clone())
            .into_relaxed_extjson()
            .to_string()
    }
}

impl TracingRepresentation for crate::error::Error {
    type Representation = String;

    fn tracing_representation(&self) -> String {
        self.to_string()
    }
}

impl ServerAddress {
    pub(crate) fn port_tracing_representation(&self) -> Option<u16> {
        Some(self.port())
    }
}

/// Serializes a command or reply to relaxed extended JSON, truncated to at most roughly
/// `max_length_bytes`.
pub(crate) fn serialize_command_or_reply(doc: bson::Document, max_length_bytes: usize) -> String {
    let mut ext_json = doc.tracing_representation();
    truncate_on_char_boundary(&mut ext_json, max_length_bytes);
    ext_json
}

/// Truncates `s` to the first character boundary at or after `new_length` and appends "..." if
/// anything was cut.
pub(crate) fn truncate_on_char_boundary(s: &mut String, new_length: usize) {
    let original_length = s.len();
    if original_length <= new_length {
        return;
    }

    let mut truncate_at = new_length;
    while !s.is_char_boundary(truncate_at) {
        truncate_at += 1;
    }
    if truncate_at < original_length {
        s.truncate(truncate_at);
        s.push_str("...");
    }
}

#[cfg(test)]
mod test {
    use bson::doc;
    use pretty_assertions::assert_eq;

    use super::{serialize_command_or_reply, truncate_on_char_boundary};

    #[test]
    fn tracing_truncation() {
        let two_emoji = String::from("🤔🤔");

        let mut s = two_emoji.clone();
        assert_eq!(s.len(), 8);

        // start of string is a boundary, so we should truncate there
        truncate_on_char_boundary(&mut s, 0);
        assert_eq!(s, String::from("..."));

        // we should "round up" to the end of the first emoji
        s.clone_from(&two_emoji);
        truncate_on_char_boundary(&mut s, 1);
        assert_eq!(s, String::from("🤔..."));

        s.clone_from(&two_emoji);
        truncate_on_char_boundary(&mut s, 4);
        assert_eq!(s, String::from("🤔..."));

        // we should round up to the full string
        s.clone_from(&two_emoji);
        truncate_on_char_boundary(&mut s, 5);
        assert_eq!(s, two_emoji);

        s.clone_from(&two_emoji);
        truncate_on_char_boundary(&mut s, 10);
        assert_eq!(s, two_emoji);
    }

    #[test]
    fn commands_serialize_to_relaxed_extjson() {
        let serialized = serialize_command_or_reply(doc! { "find": "coll", "limit": 1i64 }, 1000);
        assert_eq!(serialized, r#"{"find":"coll","limit":1}"#);

        let serialized = serialize_command_or_reply(doc! { "find": "coll" }, 5);
        assert_eq!(serialized, r#"{"fin..."#);
    }
}
