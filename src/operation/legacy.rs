//! Protocol selection, and the translations of modern commands into the opcodes servers older
//! than 3.2 understand.

use bson::{doc, Bson, Document, Regex};

use super::response::{check_reply_flags, response_document};
use crate::{
    bson_util,
    error::{Error, Result},
    sdam::ServerDescription,
    wire::{next_request_id, GetMore, KillCursors, Query, QueryFlags, WireMessage},
};

/// The wire version that introduced OP_MSG.
pub(crate) const OP_MSG_WIRE_VERSION: i32 = 6;
/// The wire version that introduced the `find`, `getMore` and `killCursors` commands.
const FIND_COMMAND_WIRE_VERSION: i32 = 4;
/// The wire version that introduced the `listCollections` and `listIndexes` commands.
const LIST_COMMANDS_WIRE_VERSION: i32 = 3;

/// Marks an operation whose command has a legacy equivalent.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[non_exhaustive]
pub enum LegacyKind {
    #[default]
    None,
    /// The connection handshake, which must be sent as OP_QUERY until the server's wire version
    /// is known.
    Handshake,
    Find,
    GetMore,
    KillCursors,
    ListCollections,
    ListIndexes,
}

/// How a command travels on the wire to a particular server.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Protocol {
    Msg,
    /// A command sent as OP_QUERY against `<db>.$cmd`.
    Query,
    LegacyFind,
    LegacyGetMore,
    LegacyKillCursors,
    LegacyListCollections,
    LegacyListIndexes,
}

impl Protocol {
    pub(crate) fn select(kind: LegacyKind, server: &ServerDescription) -> Self {
        let wire_version = server.max_wire_version.unwrap_or(0);
        if kind == LegacyKind::Handshake && wire_version == 0 {
            return Self::Query;
        }
        if wire_version >= OP_MSG_WIRE_VERSION {
            return Self::Msg;
        }
        match kind {
            LegacyKind::Find if wire_version < FIND_COMMAND_WIRE_VERSION => Self::LegacyFind,
            LegacyKind::GetMore if wire_version < FIND_COMMAND_WIRE_VERSION => Self::LegacyGetMore,
            LegacyKind::KillCursors if wire_version < FIND_COMMAND_WIRE_VERSION => {
                Self::LegacyKillCursors
            }
            LegacyKind::ListCollections if wire_version < LIST_COMMANDS_WIRE_VERSION => {
                Self::LegacyListCollections
            }
            LegacyKind::ListIndexes if wire_version < LIST_COMMANDS_WIRE_VERSION => {
                Self::LegacyListIndexes
            }
            _ => Self::Query,
        }
    }
}

/// How the reply to a request becomes the response document callers see.
#[derive(Clone, Debug, PartialEq)]
pub(crate) enum ReplyShape {
    /// A command reply carrying exactly one document.
    Command,

    /// A legacy OP_REPLY whose documents are wrapped into a cursor response.
    Cursor {
        ns: String,
        batch_field: &'static str,
    },

    /// Nothing is read. The document stands in for the reply.
    Synthetic(Document),
}

impl ReplyShape {
    pub(crate) fn reads_reply(&self) -> bool {
        !matches!(self, Self::Synthetic(_))
    }

    pub(crate) fn decode(&self, message: WireMessage) -> Result<Document> {
        match self {
            Self::Command => response_document(message),
            Self::Cursor { ns, batch_field } => {
                let WireMessage::Reply(reply) = message else {
                    return Err(Error::wire_protocol("expected an OP_REPLY to a legacy query"));
                };
                check_reply_flags(&reply)?;
                let mut cursor = doc! { "id": reply.cursor_id, "ns": ns.as_str() };
                cursor.insert(*batch_field, bson_util::to_bson_array(&reply.documents));
                Ok(doc! { "cursor": cursor, "ok": 1 })
            }
            Self::Synthetic(response) => Ok(response.clone()),
        }
    }
}

/// A translated request and the shape its reply comes back in.
#[derive(Debug)]
pub(crate) struct LegacyRequest {
    pub(crate) message: WireMessage,
    pub(crate) reply: ReplyShape,
}

/// Translates `command` for the given legacy protocol. `read_preference` and `flags` carry what
/// the read preference step decided for OP_QUERY.
pub(crate) fn translate(
    protocol: Protocol,
    db: &str,
    command: &Document,
    read_preference: Option<Document>,
    flags: QueryFlags,
) -> Result<LegacyRequest> {
    match protocol {
        Protocol::LegacyFind => find(db, command, read_preference, flags),
        Protocol::LegacyGetMore => get_more(db, command),
        Protocol::LegacyKillCursors => kill_cursors(command),
        Protocol::LegacyListCollections => list_collections(db, command, read_preference, flags),
        Protocol::LegacyListIndexes => list_indexes(db, command, read_preference, flags),
        Protocol::Msg | Protocol::Query => Err(Error::internal(format!(
            "{protocol:?} is not a legacy translation"
        ))),
    }
}

fn string_field<'a>(command: &'a Document, key: &str) -> Result<&'a str> {
    command.get_str(key).map_err(|_| {
        Error::invalid_argument(format!("legacy command requires a string `{key}` field"))
    })
}

fn i32_field(key: &str, value: &Bson) -> Result<i32> {
    bson_util::get_i32(value)
        .ok_or_else(|| Error::invalid_argument(format!("`{key}` must be a 32-bit integer")))
}

fn document_field(key: &str, value: &Bson) -> Result<Document> {
    match value {
        Bson::Document(document) => Ok(document.clone()),
        _ => Err(Error::invalid_argument(format!("`{key}` must be a document"))),
    }
}

/// The `find` options that travel as query modifiers, and the modifier each becomes.
fn modifier_name(option: &str) -> Option<&'static str> {
    Some(match option {
        "sort" => "$orderby",
        "hint" => "$hint",
        "max" => "$max",
        "min" => "$min",
        "returnKey" => "$returnKey",
        "showRecordId" => "$showDiskLoc",
        "maxTimeMS" => "$maxTimeMS",
        "snapshot" => "$snapshot",
        "comment" => "$comment",
        _ => return None,
    })
}

fn find(
    db: &str,
    command: &Document,
    read_preference: Option<Document>,
    mut flags: QueryFlags,
) -> Result<LegacyRequest> {
    let ns = format!("{}.{}", db, string_field(command, "find")?);
    let mut query = doc! { "$query": {} };
    let mut projection = None;
    let mut skip = 0;
    let mut limit = 0;
    let mut batch_size = 0;
    let mut single_batch = false;

    for (key, value) in command.iter().skip(1) {
        match key.as_str() {
            "filter" => {
                query.insert("$query", document_field(key, value)?);
            }
            "projection" => projection = Some(document_field(key, value)?),
            "skip" => skip = i32_field(key, value)?,
            "limit" => limit = i32_field(key, value)?,
            "batchSize" => {
                batch_size = i32_field(key, value)?;
                if batch_size < 0 {
                    return Err(Error::invalid_argument("`batchSize` must be non-negative"));
                }
            }
            "singleBatch" => single_batch = value.as_bool().unwrap_or(false),
            "tailable" => flags.set(QueryFlags::TAILABLE_CURSOR, value.as_bool() == Some(true)),
            "awaitData" => flags.set(QueryFlags::AWAIT_DATA, value.as_bool() == Some(true)),
            "oplogReplay" => flags.set(QueryFlags::OPLOG_REPLAY, value.as_bool() == Some(true)),
            "noCursorTimeout" => {
                flags.set(QueryFlags::NO_CURSOR_TIMEOUT, value.as_bool() == Some(true))
            }
            "allowPartialResults" => {
                flags.set(QueryFlags::PARTIAL, value.as_bool() == Some(true))
            }
            other => {
                if let Some(modifier) = modifier_name(other) {
                    query.insert(modifier, value.clone());
                }
            }
        }
    }
    if let Some(read_preference) = read_preference {
        query.insert("$readPreference", read_preference);
    }

    let message = WireMessage::Query(Query {
        request_id: next_request_id(),
        flags,
        full_collection_name: ns.clone(),
        number_to_skip: skip,
        number_to_return: number_to_return(limit, batch_size, single_batch),
        query,
        return_fields_selector: projection,
    });
    Ok(LegacyRequest {
        message,
        reply: ReplyShape::Cursor {
            ns,
            batch_field: "firstBatch",
        },
    })
}

/// The OP_QUERY `numberToReturn` for a find. A batch size of 1 would make the server close the
/// cursor after the first batch, so it is raised to 2.
pub(crate) fn number_to_return(limit: i32, batch_size: i32, single_batch: bool) -> i32 {
    let batch_size = if batch_size == 1 { 2 } else { batch_size };
    let n = if limit < 0 {
        limit
    } else if limit == 0 {
        batch_size
    } else if batch_size == 0 {
        limit
    } else {
        limit.min(batch_size)
    };
    if single_batch {
        -n.saturating_abs()
    } else {
        n
    }
}

fn get_more(db: &str, command: &Document) -> Result<LegacyRequest> {
    let cursor_id = command
        .get("getMore")
        .and_then(bson_util::get_int)
        .ok_or_else(|| Error::invalid_argument("`getMore` must be a cursor id"))?;
    let ns = format!("{}.{}", db, string_field(command, "collection")?);
    let number_to_return = match command.get("batchSize") {
        Some(value) => i32_field("batchSize", value)?,
        None => 0,
    };

    let message = WireMessage::GetMore(GetMore {
        request_id: next_request_id(),
        full_collection_name: ns.clone(),
        number_to_return,
        cursor_id,
    });
    Ok(LegacyRequest {
        message,
        reply: ReplyShape::Cursor {
            ns,
            batch_field: "nextBatch",
        },
    })
}

fn kill_cursors(command: &Document) -> Result<LegacyRequest> {
    let cursors = command
        .get_array("cursors")
        .map_err(|_| Error::invalid_argument("`cursors` must be an array of cursor ids"))?;
    let cursor_ids = cursors
        .iter()
        .map(|id| {
            bson_util::get_int(id)
                .ok_or_else(|| Error::invalid_argument("`cursors` must contain cursor ids"))
        })
        .collect::<Result<Vec<i64>>>()?;

    let reply = ReplyShape::Synthetic(doc! {
        "ok": 1,
        "cursorsUnknown": cursor_ids.clone(),
    });
    let message = WireMessage::KillCursors(KillCursors {
        request_id: next_request_id(),
        cursor_ids,
    });
    Ok(LegacyRequest { message, reply })
}

/// The `numberToReturn` of a legacy listing query: the `cursor.batchSize` option, if any.
fn cursor_batch_size(command: &Document) -> Result<i32> {
    match command
        .get_document("cursor")
        .ok()
        .and_then(|cursor| cursor.get("batchSize"))
    {
        Some(value) => i32_field("batchSize", value),
        None => Ok(0),
    }
}

fn listing_query(
    ns: String,
    filter: Document,
    command: &Document,
    read_preference: Option<Document>,
    flags: QueryFlags,
) -> Result<LegacyRequest> {
    let mut query = doc! { "$query": filter };
    for (key, value) in command.iter().skip(1) {
        if let Some(modifier) = modifier_name(key) {
            query.insert(modifier, value.clone());
        }
    }
    if let Some(read_preference) = read_preference {
        query.insert("$readPreference", read_preference);
    }

    let message = WireMessage::Query(Query {
        request_id: next_request_id(),
        flags,
        full_collection_name: ns.clone(),
        number_to_skip: 0,
        number_to_return: cursor_batch_size(command)?,
        query,
        return_fields_selector: None,
    });
    Ok(LegacyRequest {
        message,
        reply: ReplyShape::Cursor {
            ns,
            batch_field: "firstBatch",
        },
    })
}

fn list_collections(
    db: &str,
    command: &Document,
    read_preference: Option<Document>,
    flags: QueryFlags,
) -> Result<LegacyRequest> {
    // system.namespaces also lists indexes, whose names contain '$'.
    let no_indexes = doc! {
        "name": Regex { pattern: "^[^$]*$".to_string(), options: String::new() },
    };
    let filter = match command.get("filter") {
        Some(Bson::Document(filter)) if !filter.is_empty() => {
            doc! { "$and": [no_indexes, qualify_name_filter(db, filter)?] }
        }
        Some(Bson::Document(_)) | None => no_indexes,
        Some(_) => return Err(Error::invalid_argument("`filter` must be a document")),
    };
    listing_query(
        format!("{db}.system.namespaces"),
        filter,
        command,
        read_preference,
        flags,
    )
}

/// system.namespaces names collections by their full namespace, so a filter on `name` has to
/// be qualified with the database.
fn qualify_name_filter(db: &str, filter: &Document) -> Result<Document> {
    let mut qualified = filter.clone();
    match filter.get("name") {
        Some(Bson::String(name)) => {
            qualified.insert("name", format!("{db}.{name}"));
        }
        Some(_) => {
            return Err(Error::invalid_argument(
                "a legacy listCollections filter on `name` must be a string",
            ))
        }
        None => {}
    }
    Ok(qualified)
}

fn list_indexes(
    db: &str,
    command: &Document,
    read_preference: Option<Document>,
    flags: QueryFlags,
) -> Result<LegacyRequest> {
    let collection = string_field(command, "listIndexes")?;
    listing_query(
        format!("{db}.system.indexes"),
        doc! { "ns": format!("{db}.{collection}") },
        command,
        read_preference,
        flags,
    )
}
