use std::sync::Arc;

use bson::{doc, Bson, Document, Timestamp};
use futures_core::future::BoxFuture;
use pretty_assertions::assert_eq;

use super::{
    legacy::{number_to_return, Protocol},
    Assembled,
    Batches,
    LegacyKind,
    Operation,
    OperationType,
};
use crate::{
    concern::{ReadConcern, WriteConcern},
    context::Context,
    csfle::Crypt,
    error::{ErrorKind, Result},
    executor::execute,
    options::{ServerApi, ServerApiVersion},
    sdam::{SelectedServer, ServerType, TopologyType},
    selection_criteria::ReadPreference,
    session::{ClusterClock, ClusterTime, Session, SessionOptions, TransactionOptions},
    test::{
        command,
        mock::{MockDeployment, Response},
        server_description,
    },
    wire::{MessageFlags, QueryFlags, Reply, ReplyFlags, WireMessage},
};

fn selected(server_type: ServerType, max_wire_version: i32, kind: TopologyType) -> SelectedServer {
    SelectedServer {
        server: server_description("a", server_type, max_wire_version),
        kind,
    }
}

fn primary() -> SelectedServer {
    selected(ServerType::RsPrimary, 17, TopologyType::ReplicaSetWithPrimary)
}

fn deployment() -> Arc<MockDeployment> {
    Arc::new(MockDeployment::new(
        TopologyType::ReplicaSetWithPrimary,
        vec![server_description("a", ServerType::RsPrimary, 17)],
    ))
}

async fn assemble(op: &mut Operation<'_>, selected: &SelectedServer) -> Result<Assembled> {
    let protocol = Protocol::select(op.legacy, &selected.server);
    op.assemble(&Context::new(), selected, protocol, false, None)
        .await
}

fn keys(document: &Document) -> Vec<&str> {
    document.keys().map(String::as_str).collect()
}

fn body(assembled: &Assembled) -> &Document {
    match assembled.message {
        WireMessage::Message(ref message) => &message.document_payload,
        ref other => panic!("expected OP_MSG, got {other:?}"),
    }
}

struct PassThrough;

impl Crypt for PassThrough {
    fn encrypt<'a>(
        &'a self,
        _ctx: &'a Context,
        _db: &'a str,
        command: Document,
    ) -> BoxFuture<'a, Result<Document>> {
        Box::pin(async move { Ok(command) })
    }

    fn decrypt<'a>(&'a self, _ctx: &'a Context, reply: Document) -> BoxFuture<'a, Result<Document>> {
        Box::pin(async move { Ok(reply) })
    }
}

#[tokio::test]
async fn command_fields_follow_assembly_order() {
    let clock = Arc::new(ClusterClock::new());
    clock.advance(&ClusterTime {
        cluster_time: Timestamp {
            time: 10,
            increment: 1,
        },
        signature: doc! { "hash": 1 },
    });
    let mut session = Session::implicit();
    let mut op = Operation::new("db", deployment(), command(doc! { "find": "users" }))
        .op_type(OperationType::Read)
        .read_concern(ReadConcern::local())
        .read_preference(ReadPreference::SecondaryPreferred { options: None })
        .session(&mut session)
        .clock(clock)
        .server_api(ServerApi::builder().version(ServerApiVersion::V1).build());

    let selected = primary();
    let assembled = op
        .assemble(&Context::new(), &selected, Protocol::Msg, false, Some(250))
        .await
        .unwrap();

    let body = body(&assembled);
    assert_eq!(
        keys(body),
        vec![
            "find",
            "readConcern",
            "lsid",
            "$clusterTime",
            "apiVersion",
            "maxTimeMS",
            "$db",
            "$readPreference",
        ]
    );
    assert_eq!(body.get_document("readConcern").unwrap(), &doc! { "level": "local" });
    assert_eq!(body.get_i64("maxTimeMS"), Ok(250));
    assert_eq!(
        body.get_document("$readPreference").unwrap(),
        &doc! { "mode": "secondaryPreferred" }
    );
    assert_eq!(assembled.command_name, "find");
    assert_eq!(&assembled.command, body);
}

#[tokio::test]
async fn batch_is_sent_as_document_sequence() {
    let documents = vec![doc! { "_id": 1 }, doc! { "_id": 2 }];
    let mut op = Operation::new("db", deployment(), command(doc! { "insert": "coll" }))
        .op_type(OperationType::Write)
        .write_concern(WriteConcern::majority())
        .batches(Batches::new("documents", documents.clone()));
    op.batches.as_mut().unwrap().advance(10, 1024, 1024).unwrap();

    let assembled = assemble(&mut op, &primary()).await.unwrap();
    let WireMessage::Message(ref message) = assembled.message else {
        panic!("expected OP_MSG");
    };
    assert!(!message.document_payload.contains_key("documents"));
    assert_eq!(message.document_sequences.len(), 1);
    assert_eq!(message.document_sequences[0].identifier, "documents");
    assert_eq!(message.document_sequences[0].documents, documents);
    assert!(!message.flags.contains(MessageFlags::MORE_TO_COME));
    assert_eq!(
        message.document_payload.get_document("writeConcern").unwrap(),
        &doc! { "w": "majority" }
    );

    // Monitoring sees the documents inline.
    assert_eq!(
        assembled.command.get_array("documents").unwrap().len(),
        documents.len()
    );
    assert!(!assembled.command.contains_key("$readPreference"));
}

#[tokio::test]
async fn empty_batch_sends_no_sequence() {
    let mut op = Operation::new("db", deployment(), command(doc! { "insert": "coll" }))
        .op_type(OperationType::Write)
        .batches(Batches::new("documents", Vec::new()));

    let assembled = assemble(&mut op, &primary()).await.unwrap();
    let WireMessage::Message(ref message) = assembled.message else {
        panic!("expected OP_MSG");
    };
    assert!(message.document_sequences.is_empty());
}

fn large_documents() -> Vec<Document> {
    let payload = "x".repeat(600 * 1024);
    (0..10)
        .map(|i| doc! { "_id": i, "payload": payload.as_str() })
        .collect()
}

#[tokio::test]
async fn large_insert_fits_one_batch() {
    let deployment = deployment();
    deployment.push_response(Response::Command(doc! { "ok": 1, "n": 10 }));

    let mut op = Operation::new("db", deployment.clone(), command(doc! { "insert": "coll" }))
        .op_type(OperationType::Write)
        .batches(Batches::new("documents", large_documents()));
    execute(&Context::new(), &mut op).await.unwrap();

    let requests = deployment.requests();
    assert_eq!(requests.len(), 1);
    match requests[0].message {
        WireMessage::Message(ref message) => {
            assert_eq!(message.document_sequences[0].documents.len(), 10);
        }
        ref other => panic!("expected OP_MSG, got {other:?}"),
    }
}

#[tokio::test]
async fn encrypted_insert_uses_smaller_batches() {
    let deployment = deployment();
    for _ in 0..4 {
        deployment.push_response(Response::Command(doc! { "ok": 1 }));
    }
    let crypt: Arc<dyn Crypt> = Arc::new(PassThrough);

    let mut op = Operation::new("db", deployment.clone(), command(doc! { "insert": "coll" }))
        .op_type(OperationType::Write)
        .crypt(crypt)
        .batches(Batches::new("documents", large_documents()));
    execute(&Context::new(), &mut op).await.unwrap();

    let sizes: Vec<_> = deployment
        .requests()
        .iter()
        .map(|request| match request.message {
            WireMessage::Message(ref message) => {
                assert!(message.document_sequences.is_empty());
                message.document_payload.get_array("documents").unwrap().len()
            }
            ref other => panic!("expected OP_MSG, got {other:?}"),
        })
        .collect();
    assert_eq!(sizes, vec![3, 3, 3, 1]);
}

#[tokio::test]
async fn encryption_requires_wire_version_8() {
    let crypt: Arc<dyn Crypt> = Arc::new(PassThrough);
    let mut op = Operation::new("db", deployment(), command(doc! { "find": "users" }))
        .op_type(OperationType::Read)
        .crypt(crypt);

    let selected = selected(ServerType::RsPrimary, 7, TopologyType::ReplicaSetWithPrimary);
    let error = assemble(&mut op, &selected).await.unwrap_err();
    assert!(matches!(*error.kind, ErrorKind::Encryption { .. }));
}

#[test]
fn oversized_document_fails_the_batch() {
    let mut batches = Batches::new("documents", vec![doc! { "payload": "x".repeat(64) }]);
    let error = batches.advance(10, 16, 16).unwrap_err();
    assert!(matches!(*error.kind, ErrorKind::DocumentTooLarge { .. }));
}

#[test]
fn batches_respect_count_and_retry_same_documents() {
    let documents: Vec<_> = (0..5).map(|i| doc! { "_id": i }).collect();
    let mut batches = Batches::new("documents", documents);

    batches.advance(2, 1024, 1024).unwrap();
    assert_eq!(batches.current().len(), 2);
    assert_eq!(batches.remaining().len(), 3);

    // A retry advances again without clearing.
    batches.advance(2, 1024, 1024).unwrap();
    assert_eq!(batches.current(), &[doc! { "_id": 0 }, doc! { "_id": 1 }]);

    batches.clear_batch();
    batches.advance(2, 1024, 1024).unwrap();
    assert_eq!(batches.current(), &[doc! { "_id": 2 }, doc! { "_id": 3 }]);
}

#[tokio::test]
async fn read_preference_placement() {
    let read = |read_preference: Option<ReadPreference>| {
        Operation::new("db", deployment(), command(doc! { "find": "users" }))
            .op_type(OperationType::Read)
            .read_preference(read_preference)
    };
    let nearest = ReadPreference::Nearest { options: None };

    let standalone = selected(ServerType::Standalone, 17, TopologyType::Single);
    let op = read(Some(nearest.clone()));
    assert_eq!(op.create_read_pref(&standalone, false).unwrap(), None);

    let direct_secondary = selected(ServerType::RsSecondary, 17, TopologyType::Single);
    let op = read(None);
    assert_eq!(
        op.create_read_pref(&direct_secondary, false).unwrap(),
        Some(doc! { "mode": "primaryPreferred" })
    );
    assert_eq!(op.secondary_ok(&direct_secondary), QueryFlags::SECONDARY_OK);

    let mongos = selected(ServerType::Mongos, 17, TopologyType::Sharded);
    let op = read(Some(ReadPreference::Primary));
    assert_eq!(op.create_read_pref(&mongos, false).unwrap(), None);
    let op = read(Some(ReadPreference::SecondaryPreferred { options: None }));
    assert_eq!(op.create_read_pref(&mongos, true).unwrap(), None);
    assert_eq!(
        op.create_read_pref(&mongos, false).unwrap(),
        Some(doc! { "mode": "secondaryPreferred" })
    );

    let op = read(Some(nearest)).op_type(OperationType::Write);
    assert_eq!(op.create_read_pref(&primary(), false).unwrap(), None);
}

#[tokio::test]
async fn op_query_wraps_read_preference_for_mongos() {
    let mut op = Operation::new("db", deployment(), command(doc! { "count": "users" }))
        .op_type(OperationType::Read)
        .read_preference(ReadPreference::Nearest { options: None });
    let mongos = selected(ServerType::Mongos, 5, TopologyType::Sharded);

    let assembled = assemble(&mut op, &mongos).await.unwrap();
    match assembled.message {
        WireMessage::Query(ref query) => {
            assert_eq!(query.full_collection_name, "db.$cmd");
            assert_eq!(query.number_to_return, -1);
            assert!(query.flags.contains(QueryFlags::SECONDARY_OK));
            assert_eq!(
                query.query,
                doc! {
                    "$query": { "count": "users" },
                    "$readPreference": { "mode": "nearest" },
                }
            );
        }
        ref other => panic!("expected OP_QUERY, got {other:?}"),
    }
    assert_eq!(assembled.command, doc! { "count": "users" });
}

#[tokio::test]
async fn transaction_fields_only_on_first_command() {
    let mut session = Session::new(None);
    session
        .start_transaction(TransactionOptions {
            read_concern: Some(ReadConcern::snapshot()),
            ..Default::default()
        })
        .unwrap();
    let selected = primary();

    let mut op = Operation::new("db", deployment(), command(doc! { "find": "users" }))
        .op_type(OperationType::Read)
        .session(&mut session);
    let first = assemble(&mut op, &selected).await.unwrap();
    let second = assemble(&mut op, &selected).await.unwrap();

    let first = body(&first);
    assert_eq!(first.get_i64("txnNumber"), Ok(1));
    assert_eq!(first.get_bool("startTransaction"), Ok(true));
    assert_eq!(first.get_bool("autocommit"), Ok(false));
    assert_eq!(first.get_document("readConcern").unwrap(), &doc! { "level": "snapshot" });

    let second = body(&second);
    assert_eq!(second.get_i64("txnNumber"), Ok(1));
    assert!(!second.contains_key("startTransaction"));
    assert!(!second.contains_key("readConcern"));
    assert_eq!(second.get_bool("autocommit"), Ok(false));
}

#[tokio::test]
async fn transaction_reads_must_use_primary() {
    let mut session = Session::new(None);
    session
        .start_transaction(TransactionOptions {
            read_preference: Some(ReadPreference::Secondary { options: None }),
            ..Default::default()
        })
        .unwrap();
    let selected = primary();

    let mut op = Operation::new("db", deployment(), command(doc! { "find": "users" }))
        .op_type(OperationType::Read)
        .session(&mut session);
    assemble(&mut op, &selected).await.unwrap();
    let error = assemble(&mut op, &selected).await.unwrap_err();
    assert!(matches!(*error.kind, ErrorKind::NonPrimaryReadPref));
}

#[tokio::test]
async fn sharded_commit_carries_recovery_token() {
    let mut session = Session::new(None);
    session.start_transaction(None).unwrap();
    let mongos = selected(ServerType::Mongos, 17, TopologyType::Sharded);
    {
        let mut op = Operation::new("db", deployment(), command(doc! { "insert": "coll" }))
            .op_type(OperationType::Write)
            .session(&mut session);
        assemble(&mut op, &mongos).await.unwrap();
    }
    session.update_from_response(
        &doc! { "ok": 1, "recoveryToken": { "shard": "s0" } },
        "insert",
    );
    session.begin_commit().unwrap();

    let mut op = Operation::new("admin", deployment(), command(doc! { "commitTransaction": 1 }))
        .op_type(OperationType::Write)
        .session(&mut session);
    let assembled = assemble(&mut op, &mongos).await.unwrap();
    assert_eq!(
        body(&assembled).get_document("recoveryToken").unwrap(),
        &doc! { "shard": "s0" }
    );
}

#[tokio::test]
async fn causal_reads_wait_for_operation_time() {
    let mut session = Session::new(SessionOptions::builder().causal_consistency(true).build());
    let operation_time = Timestamp {
        time: 20,
        increment: 3,
    };
    session.advance_operation_time(operation_time);

    let mut op = Operation::new("db", deployment(), command(doc! { "find": "users" }))
        .op_type(OperationType::Read)
        .session(&mut session);
    let assembled = assemble(&mut op, &primary()).await.unwrap();
    assert_eq!(
        body(&assembled).get_document("readConcern").unwrap(),
        &doc! { "afterClusterTime": operation_time }
    );
}

#[tokio::test]
async fn snapshot_sessions_need_modern_servers() {
    let mut session = Session::new(SessionOptions::builder().snapshot(true).build());
    let mut op = Operation::new("db", deployment(), command(doc! { "find": "users" }))
        .op_type(OperationType::Read)
        .session(&mut session);

    let old = selected(ServerType::RsPrimary, 12, TopologyType::ReplicaSetWithPrimary);
    let error = assemble(&mut op, &old).await.unwrap_err();
    assert!(matches!(*error.kind, ErrorKind::IncompatibleServer { .. }));

    let assembled = assemble(&mut op, &primary()).await.unwrap();
    assert_eq!(
        body(&assembled).get_document("readConcern").unwrap(),
        &doc! { "level": "snapshot" }
    );
}

#[tokio::test]
async fn explicit_session_requires_session_support() {
    let mut session = Session::new(None);
    let mut op = Operation::new("db", deployment(), command(doc! { "find": "users" }))
        .op_type(OperationType::Read)
        .session(&mut session);
    let mut no_sessions = primary();
    no_sessions.server.session_timeout_minutes = None;

    let error = assemble(&mut op, &no_sessions).await.unwrap_err();
    assert!(matches!(*error.kind, ErrorKind::SessionsNotSupported));
}

#[test]
fn validate_rejects_unusable_operations() {
    let op = Operation::new("", deployment(), command(doc! { "ping": 1 }));
    assert!(op.validate().is_err());

    let mut session = Session::implicit();
    let op = Operation::new("db", deployment(), command(doc! { "insert": "coll" }))
        .write_concern(WriteConcern::nodes(0))
        .session(&mut session);
    assert!(op.validate().is_err());

    let op = Operation::new("db", deployment(), command(doc! { "insert": "coll" }))
        .batches(Batches::new("", Vec::new()));
    assert!(op.validate().is_err());
}

#[tokio::test]
async fn legacy_find_translation() {
    let mut op = Operation::new(
        "db",
        deployment(),
        command(doc! {
            "find": "users",
            "filter": { "age": { "$gt": 21 } },
            "sort": { "name": 1 },
            "limit": 50,
            "batchSize": 20,
            "singleBatch": false,
        }),
    )
    .op_type(OperationType::Read)
    .legacy(LegacyKind::Find);
    let old = selected(ServerType::RsPrimary, 3, TopologyType::ReplicaSetWithPrimary);

    let assembled = assemble(&mut op, &old).await.unwrap();
    assert_eq!(assembled.command_name, "find");
    match assembled.message {
        WireMessage::Query(ref query) => {
            assert_eq!(query.full_collection_name, "db.users");
            assert_eq!(query.number_to_skip, 0);
            assert_eq!(query.number_to_return, 20);
            assert_eq!(
                query.query,
                doc! {
                    "$query": { "age": { "$gt": 21 } },
                    "$orderby": { "name": 1 },
                }
            );
        }
        ref other => panic!("expected OP_QUERY, got {other:?}"),
    }

    let reply = Reply::new(0, ReplyFlags::empty(), 7, vec![doc! { "_id": 1 }]);
    assert_eq!(
        assembled.reply.decode(WireMessage::Reply(reply)).unwrap(),
        doc! {
            "cursor": { "id": 7i64, "ns": "db.users", "firstBatch": [{ "_id": 1 }] },
            "ok": 1,
        }
    );
}

#[tokio::test]
async fn legacy_translation_only_below_cutoff() {
    let mut op = Operation::new("db", deployment(), command(doc! { "find": "users" }))
        .op_type(OperationType::Read)
        .legacy(LegacyKind::Find);

    let command_server = selected(ServerType::RsPrimary, 4, TopologyType::ReplicaSetWithPrimary);
    let assembled = assemble(&mut op, &command_server).await.unwrap();
    match assembled.message {
        WireMessage::Query(ref query) => assert_eq!(query.full_collection_name, "db.$cmd"),
        ref other => panic!("expected OP_QUERY, got {other:?}"),
    }

    let assembled = assemble(&mut op, &primary()).await.unwrap();
    assert!(matches!(assembled.message, WireMessage::Message(_)));
}

#[tokio::test]
async fn legacy_kill_cursors_reply_is_synthetic() {
    let mut op = Operation::new(
        "db",
        deployment(),
        command(doc! { "killCursors": "users", "cursors": [42i64] }),
    )
    .legacy(LegacyKind::KillCursors);
    let old = selected(ServerType::RsPrimary, 3, TopologyType::ReplicaSetWithPrimary);

    let assembled = assemble(&mut op, &old).await.unwrap();
    match assembled.message {
        WireMessage::KillCursors(ref kill) => assert_eq!(kill.cursor_ids, vec![42]),
        ref other => panic!("expected OP_KILL_CURSORS, got {other:?}"),
    }
    assert!(!assembled.reply.reads_reply());
    assert_eq!(
        assembled.reply.decode(assembled.message.clone()).unwrap(),
        doc! { "ok": 1, "cursorsUnknown": [42i64] }
    );
}

#[tokio::test]
async fn legacy_list_indexes_queries_system_indexes() {
    let mut op = Operation::new(
        "db",
        deployment(),
        command(doc! { "listIndexes": "users", "cursor": { "batchSize": 5 } }),
    )
    .op_type(OperationType::Read)
    .legacy(LegacyKind::ListIndexes);
    let old = selected(ServerType::RsPrimary, 2, TopologyType::ReplicaSetWithPrimary);

    let assembled = assemble(&mut op, &old).await.unwrap();
    match assembled.message {
        WireMessage::Query(ref query) => {
            assert_eq!(query.full_collection_name, "db.system.indexes");
            assert_eq!(query.number_to_return, 5);
            assert_eq!(query.query, doc! { "$query": { "ns": "db.users" } });
        }
        ref other => panic!("expected OP_QUERY, got {other:?}"),
    }
}

#[tokio::test]
async fn legacy_list_collections_qualifies_name_filter() {
    let mut op = Operation::new(
        "db",
        deployment(),
        command(doc! { "listCollections": 1, "filter": { "name": "users" } }),
    )
    .op_type(OperationType::Read)
    .legacy(LegacyKind::ListCollections);
    let old = selected(ServerType::RsPrimary, 2, TopologyType::ReplicaSetWithPrimary);

    let assembled = assemble(&mut op, &old).await.unwrap();
    let WireMessage::Query(ref query) = assembled.message else {
        panic!("expected OP_QUERY");
    };
    let clauses = query
        .query
        .get_document("$query")
        .unwrap()
        .get_array("$and")
        .unwrap();
    assert_eq!(clauses[1], Bson::Document(doc! { "name": "db.users" }));
}

#[tokio::test]
async fn handshake_uses_op_query_before_wire_version_is_known() {
    let mut op = Operation::new("admin", deployment(), command(doc! { "hello": 1 }))
        .legacy(LegacyKind::Handshake);
    let mut unknown = primary();
    unknown.server.max_wire_version = Some(0);

    let assembled = assemble(&mut op, &unknown).await.unwrap();
    match assembled.message {
        WireMessage::Query(ref query) => {
            assert_eq!(query.full_collection_name, "admin.$cmd");
            assert_eq!(query.query, doc! { "hello": 1 });
        }
        ref other => panic!("expected OP_QUERY, got {other:?}"),
    }
}

#[test]
fn legacy_number_to_return() {
    assert_eq!(number_to_return(0, 0, false), 0);
    assert_eq!(number_to_return(0, 1, false), 2);
    assert_eq!(number_to_return(50, 20, false), 20);
    assert_eq!(number_to_return(10, 0, false), 10);
    assert_eq!(number_to_return(-5, 20, false), -5);
    assert_eq!(number_to_return(10, 0, true), -10);
}
