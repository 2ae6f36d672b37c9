//! Decoding of server replies and extraction of the errors they report.

use bson::{Bson, Document};

use crate::{
    bson_util,
    error::{
        CommandError,
        Error,
        ErrorKind,
        IndexedWriteError,
        Result,
        WriteCommandError,
        WriteConcernError,
    },
    wire::{Reply, ReplyFlags, WireMessage},
};

/// Unwraps the single document a command reply carries.
pub(crate) fn response_document(message: WireMessage) -> Result<Document> {
    match message {
        WireMessage::Message(message) => Ok(message.document_payload),
        WireMessage::Reply(reply) => {
            check_reply_flags(&reply)?;
            let mut documents = reply.documents.into_iter();
            match (documents.next(), documents.next()) {
                (Some(document), None) => Ok(document),
                (None, _) => Err(Error::wire_protocol("no documents in command response")),
                (Some(_), Some(_)) => Err(Error::wire_protocol(
                    "multiple documents in command response",
                )),
            }
        }
        other => Err(Error::wire_protocol(format!(
            "expected a reply but received {}",
            other_op_name(&other)
        ))),
    }
}

fn other_op_name(message: &WireMessage) -> &'static str {
    match message {
        WireMessage::Message(_) => "OP_MSG",
        WireMessage::Query(_) => "OP_QUERY",
        WireMessage::GetMore(_) => "OP_GET_MORE",
        WireMessage::KillCursors(_) => "OP_KILL_CURSORS",
        WireMessage::Reply(_) => "OP_REPLY",
    }
}

/// Surfaces the failures a legacy OP_REPLY reports through its flags.
pub(crate) fn check_reply_flags(reply: &Reply) -> Result<()> {
    if reply.flags.contains(ReplyFlags::CURSOR_NOT_FOUND) {
        return Err(ErrorKind::CursorNotFound.into());
    }
    if reply.flags.contains(ReplyFlags::QUERY_FAILURE) {
        let response = reply.documents.first().cloned().unwrap_or_default();
        let message = response
            .get_str("$err")
            .unwrap_or("command failure")
            .to_string();
        let code = response.get("code").and_then(bson_util::get_i32);
        return Err(ErrorKind::QueryFailure {
            message,
            code,
            response,
        }
        .into());
    }
    Ok(())
}

/// Returns the error a decoded response reports, if any.
///
/// A response is successful only when `ok` is numerically 1. A successful response can still
/// carry per-document `writeErrors` or a `writeConcernError`, which become a
/// [`ErrorKind::WriteCommand`] error.
pub(crate) fn extract_error(response: &Document) -> Option<Error> {
    let ok = response.get("ok").and_then(bson_util::get_int) == Some(1);
    let labels: Vec<String> = response
        .get_array("errorLabels")
        .map(|labels| {
            labels
                .iter()
                .filter_map(Bson::as_str)
                .map(String::from)
                .collect()
        })
        .unwrap_or_default();

    if !ok {
        let command_error = CommandError {
            code: response.get("code").and_then(bson_util::get_i32).unwrap_or(0),
            code_name: response.get_str("codeName").unwrap_or_default().to_string(),
            message: response
                .get_str("errmsg")
                .unwrap_or("command failed")
                .to_string(),
            topology_version: response.get_document("topologyVersion").ok().cloned(),
        };
        return Some(Error::new(ErrorKind::Command(command_error), Some(labels)));
    }

    let failure = match write_command_failure(response) {
        Ok(failure) => failure,
        Err(error) => return Some(error),
    };
    if failure.is_empty() {
        return None;
    }
    Some(Error::new(ErrorKind::WriteCommand(failure), Some(labels)))
}

fn write_command_failure(response: &Document) -> Result<WriteCommandError> {
    let write_errors = match response.get("writeErrors") {
        Some(errors @ Bson::Array(_)) => {
            bson::from_bson::<Vec<IndexedWriteError>>(errors.clone())?
        }
        _ => Vec::new(),
    };
    let write_concern_error = match response.get("writeConcernError") {
        Some(Bson::Document(error)) => {
            Some(bson::from_document::<WriteConcernError>(error.clone())?)
        }
        _ => None,
    };
    Ok(WriteCommandError {
        write_errors,
        write_concern_error,
    })
}

#[cfg(test)]
mod test {
    use bson::doc;
    use pretty_assertions::assert_eq;

    use super::{extract_error, response_document};
    use crate::{
        error::ErrorKind,
        wire::{Reply, ReplyFlags, WireMessage},
    };

    #[test]
    fn ok_forms() {
        assert!(extract_error(&doc! { "ok": 1 }).is_none());
        assert!(extract_error(&doc! { "ok": 1i64 }).is_none());
        assert!(extract_error(&doc! { "ok": 1.0 }).is_none());
        assert!(extract_error(&doc! { "ok": 0 }).is_some());
        assert!(extract_error(&doc! { "ok": "1" }).is_some());
        assert!(extract_error(&doc! { "n": 1 }).is_some());
    }

    #[test]
    fn failure_without_message() {
        let error = extract_error(&doc! { "ok": 0 }).unwrap();
        match *error.kind {
            ErrorKind::Command(ref command_error) => {
                assert_eq!(command_error.code, 0);
                assert_eq!(command_error.message, "command failed");
            }
            ref other => panic!("expected command error, got {other:?}"),
        }
    }

    #[test]
    fn write_errors_and_write_concern_error() {
        let error = extract_error(&doc! {
            "ok": 1,
            "n": 1,
            "code": 11600,
            "writeErrors": [{ "index": 1, "code": 11000, "errmsg": "duplicate key" }],
            "writeConcernError": {
                "code": 64,
                "codeName": "WriteConcernFailed",
                "errmsg": "waiting for replication timed out",
                "errInfo": { "wtimeout": true },
            },
            "errorLabels": ["RetryableWriteError"],
        })
        .unwrap();
        assert!(error.contains_label("RetryableWriteError"));
        match *error.kind {
            ErrorKind::WriteCommand(ref failure) => {
                assert_eq!(failure.write_errors.len(), 1);
                assert_eq!(failure.write_errors[0].index, 1);
                assert_eq!(failure.write_errors[0].code, 11000);
                let wc_error = failure.write_concern_error.as_ref().unwrap();
                assert_eq!(wc_error.code, 64);
                assert_eq!(wc_error.details, Some(doc! { "wtimeout": true }));
            }
            ref other => panic!("expected write command error, got {other:?}"),
        }
    }

    #[test]
    fn legacy_reply_flags() {
        let failure = Reply::new(
            1,
            ReplyFlags::QUERY_FAILURE,
            0,
            vec![doc! { "$err": "bad query", "code": 2 }],
        );
        let error = response_document(WireMessage::Reply(failure)).unwrap_err();
        match *error.kind {
            ErrorKind::QueryFailure {
                ref message, code, ..
            } => {
                assert_eq!(message, "bad query");
                assert_eq!(code, Some(2));
            }
            ref other => panic!("expected query failure, got {other:?}"),
        }

        let not_found = Reply::new(1, ReplyFlags::CURSOR_NOT_FOUND, 0, Vec::new());
        let error = response_document(WireMessage::Reply(not_found)).unwrap_err();
        assert!(matches!(*error.kind, ErrorKind::CursorNotFound));

        let empty = Reply::new(1, ReplyFlags::empty(), 0, Vec::new());
        assert!(response_document(WireMessage::Reply(empty)).is_err());

        let two = Reply::new(1, ReplyFlags::empty(), 0, vec![doc! {}, doc! {}]);
        assert!(response_document(WireMessage::Reply(two)).is_err());
    }
}
