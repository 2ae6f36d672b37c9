use std::{sync::Arc, time::Duration};

use bson::{doc, Document};
use pretty_assertions::assert_eq;

use super::{execute, retry::RetryBudget};
use crate::{
    concern::WriteConcern,
    context::Context,
    error::{
        ErrorKind,
        NETWORK_ERROR,
        NO_WRITES_PERFORMED,
        RETRYABLE_WRITE_ERROR,
        TRANSIENT_TRANSACTION_ERROR,
        UNKNOWN_TRANSACTION_COMMIT_RESULT,
    },
    operation::{Batches, Operation, OperationType, RetryMode},
    sdam::{ServerAddress, ServerType, TopologyType},
    session::{Session, TransactionState},
    test::{
        command,
        mock::{MockDeployment, Response},
        server_description,
        EventBuffer,
    },
    wire::{MessageFlags, WireMessage},
};

fn primary(max_wire_version: i32) -> Arc<MockDeployment> {
    Arc::new(MockDeployment::new(
        TopologyType::ReplicaSetWithPrimary,
        vec![server_description("a", ServerType::RsPrimary, max_wire_version)],
    ))
}

fn insert_one() -> Document {
    doc! { "insert": "coll", "documents": [{ "x": 1 }] }
}

#[test]
fn initial_budget_follows_retry_mode() {
    let deployment = primary(17);
    let mut session = Session::implicit();

    let op = Operation::new("db", deployment.clone(), command(insert_one()))
        .op_type(OperationType::Write)
        .retry(RetryMode::Once);
    assert_eq!(super::initial_budget(&op, false), RetryBudget::None);

    let op = Operation::new("db", deployment.clone(), command(insert_one()))
        .op_type(OperationType::Write)
        .retry(RetryMode::OncePerCommand)
        .session(&mut session);
    assert_eq!(super::initial_budget(&op, false), RetryBudget::Limited(1));
    assert_eq!(super::initial_budget(&op, true), RetryBudget::Unbounded);

    let op = Operation::new("db", deployment.clone(), command(doc! { "find": "coll" }))
        .op_type(OperationType::Read)
        .retry(RetryMode::Context);
    assert_eq!(super::initial_budget(&op, false), RetryBudget::Unbounded);

    let op = Operation::new("db", deployment, command(doc! { "ping": 1 })).retry(RetryMode::Once);
    assert_eq!(super::initial_budget(&op, false), RetryBudget::None);
}

#[tokio::test]
async fn retryable_write_is_retried_once_with_same_txn_number() {
    let deployment = primary(8);
    deployment.push_response(Response::Command(doc! {
        "ok": 0,
        "code": 11600,
        "codeName": "InterruptedAtShutdown",
        "errmsg": "interrupted at shutdown",
    }));
    deployment.push_response(Response::Command(doc! { "ok": 1, "n": 1 }));
    let buffer = EventBuffer::new();
    let mut session = Session::implicit();

    let response = {
        let mut op = Operation::new("db", deployment.clone(), command(insert_one()))
            .op_type(OperationType::Write)
            .retry(RetryMode::Once)
            .session(&mut session)
            .event_handler(buffer.handler());
        execute(&Context::new(), &mut op).await.unwrap()
    };

    assert_eq!(response, doc! { "ok": 1, "n": 1 });
    assert_eq!(session.txn_number(), 1);
    let commands = deployment.commands();
    assert_eq!(commands.len(), 2);
    for command in &commands {
        assert_eq!(command.get_i64("txnNumber").unwrap(), 1);
        assert_eq!(command.get_document("lsid").unwrap(), session.id());
    }
    assert_eq!(buffer.kinds(), vec!["started", "failed", "started", "succeeded"]);
    assert_eq!(deployment.processed_errors(), 1);
}

#[tokio::test]
async fn exhausted_retry_surfaces_labelled_error() {
    let deployment = primary(8);
    for _ in 0..2 {
        deployment.push_response(Response::Command(doc! {
            "ok": 0,
            "code": 91,
            "codeName": "ShutdownInProgress",
            "errmsg": "shutting down",
        }));
    }
    let mut session = Session::implicit();

    let error = {
        let mut op = Operation::new("db", deployment.clone(), command(insert_one()))
            .op_type(OperationType::Write)
            .retry(RetryMode::Once)
            .session(&mut session);
        execute(&Context::new(), &mut op).await.unwrap_err()
    };

    match *error.kind {
        ErrorKind::Command(ref command_error) => assert_eq!(command_error.code, 91),
        ref other => panic!("expected command error, got {other:?}"),
    }
    assert!(error.contains_label(RETRYABLE_WRITE_ERROR));
    assert_eq!(deployment.commands().len(), 2);
}

#[tokio::test]
async fn writes_without_session_are_not_retried() {
    let deployment = primary(17);
    deployment.push_response(Response::Command(doc! {
        "ok": 0,
        "code": 91,
        "errorLabels": [RETRYABLE_WRITE_ERROR],
    }));

    let mut op = Operation::new("db", deployment.clone(), command(insert_one()))
        .op_type(OperationType::Write)
        .retry(RetryMode::Once);
    execute(&Context::new(), &mut op).await.unwrap_err();

    assert_eq!(deployment.commands().len(), 1);
    assert!(!deployment.commands()[0].contains_key("txnNumber"));
}

#[tokio::test]
async fn unacknowledged_write_reports_synthetic_success() {
    let deployment = Arc::new(MockDeployment::new(
        TopologyType::Single,
        vec![server_description("a", ServerType::Standalone, 17)],
    ));
    let buffer = EventBuffer::new();

    let mut op = Operation::new("db", deployment.clone(), command(insert_one()))
        .op_type(OperationType::Write)
        .write_concern(WriteConcern::nodes(0))
        .event_handler(buffer.handler());
    let error = execute(&Context::new(), &mut op).await.unwrap_err();

    assert!(matches!(*error.kind, ErrorKind::UnacknowledgedWrite));
    assert_eq!(buffer.kinds(), vec!["started", "succeeded"]);
    match buffer.all().pop() {
        Some(crate::event::command::CommandEvent::Succeeded(event)) => {
            assert_eq!(event.reply, doc! { "ok": 1 });
        }
        other => panic!("expected a succeeded event, got {other:?}"),
    }

    let requests = deployment.requests();
    assert_eq!(requests.len(), 1);
    match requests[0].message {
        WireMessage::Message(ref message) => {
            assert!(message.flags.contains(MessageFlags::MORE_TO_COME));
        }
        ref other => panic!("expected OP_MSG, got {other:?}"),
    }
}

#[tokio::test]
async fn network_error_in_transaction_is_transient() {
    let deployment = primary(17);
    deployment.push_response(Response::ReadFailure);
    let mut session = Session::new(None);
    session.start_transaction(None).unwrap();

    let error = {
        let mut op = Operation::new("db", deployment.clone(), command(insert_one()))
            .op_type(OperationType::Write)
            .retry(RetryMode::Once)
            .session(&mut session);
        execute(&Context::new(), &mut op).await.unwrap_err()
    };

    assert!(error.is_network_error());
    assert!(error.contains_label(NETWORK_ERROR));
    assert!(error.contains_label(TRANSIENT_TRANSACTION_ERROR));
    assert!(!error.contains_label(RETRYABLE_WRITE_ERROR));
    assert!(session.is_dirty());
    assert!(!session.is_pinned());

    let commands = deployment.commands();
    assert_eq!(commands.len(), 1);
    assert_eq!(commands[0].get_bool("startTransaction"), Ok(true));
    assert_eq!(commands[0].get_bool("autocommit"), Ok(false));
    assert_eq!(commands[0].get_i64("txnNumber"), Ok(1));
}

#[tokio::test]
async fn max_time_is_sent_rounded_up() {
    let deployment = primary(17);
    deployment.push_response(Response::Command(doc! { "ok": 1 }));

    let mut op = Operation::new("db", deployment.clone(), command(doc! { "count": "coll" }))
        .op_type(OperationType::Read)
        .max_time(Duration::from_micros(1_500_500));
    execute(&Context::new(), &mut op).await.unwrap();

    assert_eq!(deployment.commands()[0].get_i64("maxTimeMS"), Ok(1501));
}

#[tokio::test]
async fn timeout_becomes_max_time_and_interrupts_hung_reads() {
    let deployment = primary(17);
    deployment.push_response(Response::Hang);
    let buffer = EventBuffer::new();

    let mut op = Operation::new("db", deployment.clone(), command(doc! { "count": "coll" }))
        .op_type(OperationType::Read)
        .retry(RetryMode::Once)
        .timeout(Duration::from_millis(200))
        .event_handler(buffer.handler());
    let error = execute(&Context::new(), &mut op).await.unwrap_err();

    assert!(error.is_context_error());
    let max_time_ms = deployment.commands()[0].get_i64("maxTimeMS").unwrap();
    assert!(max_time_ms > 0 && max_time_ms < 200, "maxTimeMS was {max_time_ms}");
    assert_eq!(buffer.kinds(), vec!["started", "failed"]);
}

#[tokio::test]
async fn omitted_timeout_max_time_keeps_explicit_value() {
    let deployment = primary(17);
    deployment.push_response(Response::Command(doc! { "ok": 1 }));

    let mut op = Operation::new("db", deployment.clone(), command(doc! { "count": "coll" }))
        .op_type(OperationType::Read)
        .timeout(Duration::from_secs(30))
        .omit_timeout_max_time(true)
        .max_time(Duration::from_millis(20));
    execute(&Context::new(), &mut op).await.unwrap();

    assert_eq!(deployment.commands()[0].get_i64("maxTimeMS"), Ok(20));
}

#[tokio::test]
async fn retried_read_avoids_failed_mongos() {
    let a = server_description("a", ServerType::Mongos, 17);
    let b = server_description("b", ServerType::Mongos, 17);
    let deployment = Arc::new(
        MockDeployment::new(TopologyType::Sharded, vec![a, b]).with_responses([
            Response::Command(doc! {
                "ok": 0,
                "code": 91,
                "codeName": "ShutdownInProgress",
            }),
            Response::Command(doc! { "ok": 1 }),
        ]),
    );

    let mut op = Operation::new("db", deployment.clone(), command(doc! { "count": "coll" }))
        .op_type(OperationType::Read)
        .retry(RetryMode::Once);
    execute(&Context::new(), &mut op).await.unwrap();

    let first = ServerAddress::new("a", 27017);
    assert_eq!(deployment.deprioritized(), vec![vec![], vec![first.clone()]]);
    let addresses: Vec<_> = deployment
        .requests()
        .into_iter()
        .map(|request| request.address)
        .collect();
    assert_eq!(addresses, vec![first, ServerAddress::new("b", 27017)]);
}

#[tokio::test]
async fn no_writes_performed_surfaces_earlier_error() {
    let deployment = primary(17);
    deployment.push_response(Response::Command(doc! {
        "ok": 0,
        "code": 91,
        "codeName": "ShutdownInProgress",
        "errorLabels": [RETRYABLE_WRITE_ERROR],
    }));
    deployment.push_response(Response::Command(doc! {
        "ok": 0,
        "code": 10107,
        "codeName": "NotWritablePrimary",
        "errorLabels": [RETRYABLE_WRITE_ERROR, NO_WRITES_PERFORMED],
    }));
    let mut session = Session::implicit();

    let error = {
        let mut op = Operation::new("db", deployment.clone(), command(insert_one()))
            .op_type(OperationType::Write)
            .retry(RetryMode::Once)
            .session(&mut session);
        execute(&Context::new(), &mut op).await.unwrap_err()
    };

    match *error.kind {
        ErrorKind::Command(ref command_error) => assert_eq!(command_error.code, 91),
        ref other => panic!("expected command error, got {other:?}"),
    }
    assert!(!error.contains_label(NO_WRITES_PERFORMED));
}

#[tokio::test]
async fn commit_write_concern_error_is_unknown_commit_result() {
    let deployment = primary(17);
    deployment.push_response(Response::Command(doc! {
        "ok": 1,
        "writeConcernError": {
            "code": 64,
            "codeName": "WriteConcernFailed",
            "errmsg": "waiting for replication timed out",
        },
    }));
    let mut session = Session::new(None);
    session.start_transaction(None).unwrap();
    session.begin_commit().unwrap();

    let error = {
        let mut op = Operation::new(
            "admin",
            deployment.clone(),
            command(doc! { "commitTransaction": 1 }),
        )
        .op_type(OperationType::Write)
        .retry(RetryMode::Once)
        .session(&mut session);
        execute(&Context::new(), &mut op).await.unwrap_err()
    };

    match *error.kind {
        ErrorKind::Command(ref command_error) => {
            assert_eq!(command_error.code, 64);
            assert_eq!(command_error.code_name, "WriteConcernFailed");
        }
        ref other => panic!("expected command error, got {other:?}"),
    }
    assert!(error.contains_label(UNKNOWN_TRANSACTION_COMMIT_RESULT));
    assert!(error.server_response().is_some());
    assert_eq!(session.txn_number(), 1);
}

#[tokio::test]
async fn unsatisfiable_commit_write_concern_is_not_unknown() {
    let deployment = primary(17);
    deployment.push_response(Response::Command(doc! {
        "ok": 1,
        "writeConcernError": { "code": 100, "errmsg": "unsatisfiable" },
    }));
    let mut session = Session::new(None);
    session.start_transaction(None).unwrap();
    session.begin_commit().unwrap();

    let error = {
        let mut op = Operation::new(
            "admin",
            deployment.clone(),
            command(doc! { "commitTransaction": 1 }),
        )
        .op_type(OperationType::Write)
        .session(&mut session);
        execute(&Context::new(), &mut op).await.unwrap_err()
    };

    assert!(!error.contains_label(UNKNOWN_TRANSACTION_COMMIT_RESULT));
}

#[tokio::test]
async fn retried_commit_uses_majority_write_concern() {
    let deployment = primary(17);
    deployment.push_response(Response::ReadFailure);
    deployment.push_response(Response::Command(doc! { "ok": 1 }));
    let mut session = Session::new(None);
    session.start_transaction(None).unwrap();
    session.begin_commit().unwrap();

    {
        let mut op = Operation::new(
            "admin",
            deployment.clone(),
            command(doc! { "commitTransaction": 1 }),
        )
        .op_type(OperationType::Write)
        .retry(RetryMode::Once)
        .session(&mut session);
        execute(&Context::new(), &mut op).await.unwrap();
    }

    let commands = deployment.commands();
    assert_eq!(commands.len(), 2);
    assert!(!commands[0].contains_key("writeConcern"));
    assert_eq!(
        commands[1].get_document("writeConcern").unwrap(),
        &doc! { "w": "majority", "wtimeout": 10_000 }
    );
    assert_eq!(commands[0].get_i64("txnNumber"), commands[1].get_i64("txnNumber"));
}

fn numbered(n: i32) -> Vec<Document> {
    (0..n).map(|i| doc! { "_id": i }).collect()
}

fn small_batches(max_wire_version: i32) -> Arc<MockDeployment> {
    let mut server = server_description("a", ServerType::RsPrimary, max_wire_version);
    server.max_batch_count = 2;
    Arc::new(MockDeployment::new(
        TopologyType::ReplicaSetWithPrimary,
        vec![server],
    ))
}

#[tokio::test]
async fn ordered_batches_stop_at_first_write_error() {
    let deployment = small_batches(17);
    deployment.push_response(Response::Command(doc! { "ok": 1, "n": 2 }));
    deployment.push_response(Response::Command(doc! {
        "ok": 1,
        "n": 1,
        "writeErrors": [{ "index": 1, "code": 11000, "errmsg": "duplicate key" }],
    }));

    let mut op = Operation::new("db", deployment.clone(), command(doc! { "insert": "coll" }))
        .op_type(OperationType::Write)
        .batches(Batches::new("documents", numbered(5)));
    let error = execute(&Context::new(), &mut op).await.unwrap_err();

    match *error.kind {
        ErrorKind::WriteCommand(ref failure) => {
            let indexes: Vec<_> = failure.write_errors.iter().map(|e| e.index).collect();
            assert_eq!(indexes, vec![3]);
        }
        ref other => panic!("expected write command error, got {other:?}"),
    }
    assert_eq!(deployment.requests().len(), 2);
    assert_eq!(op.batches_ref().unwrap().remaining().len(), 1);
    assert_eq!(deployment.checkouts(), 1);
}

#[tokio::test]
async fn unordered_batches_collect_write_errors() {
    let deployment = small_batches(17);
    deployment.push_response(Response::Command(doc! { "ok": 1, "n": 2 }));
    deployment.push_response(Response::Command(doc! {
        "ok": 1,
        "n": 1,
        "writeErrors": [{ "index": 0, "code": 11000, "errmsg": "duplicate key" }],
    }));
    deployment.push_response(Response::Command(doc! {
        "ok": 1,
        "n": 0,
        "writeErrors": [{ "index": 0, "code": 11000, "errmsg": "duplicate key" }],
    }));

    let mut op = Operation::new("db", deployment.clone(), command(doc! { "insert": "coll" }))
        .op_type(OperationType::Write)
        .batches(Batches::new("documents", numbered(5)).ordered(false));
    let error = execute(&Context::new(), &mut op).await.unwrap_err();

    match *error.kind {
        ErrorKind::WriteCommand(ref failure) => {
            let indexes: Vec<_> = failure.write_errors.iter().map(|e| e.index).collect();
            assert_eq!(indexes, vec![2, 4]);
        }
        ref other => panic!("expected write command error, got {other:?}"),
    }

    let requests = deployment.requests();
    assert_eq!(requests.len(), 3);
    let sizes: Vec<_> = requests
        .iter()
        .map(|request| match request.message {
            WireMessage::Message(ref message) => message.document_sequences[0].documents.len(),
            ref other => panic!("expected OP_MSG, got {other:?}"),
        })
        .collect();
    assert_eq!(sizes, vec![2, 2, 1]);
    assert_eq!(deployment.checkouts(), 1);
    assert_eq!(deployment.closes(), 1);
}

#[tokio::test]
async fn each_batch_gets_its_own_txn_number() {
    let deployment = small_batches(17);
    for _ in 0..3 {
        deployment.push_response(Response::Command(doc! { "ok": 1 }));
    }
    let mut session = Session::implicit();

    {
        let mut op = Operation::new("db", deployment.clone(), command(doc! { "insert": "coll" }))
            .op_type(OperationType::Write)
            .retry(RetryMode::OncePerCommand)
            .session(&mut session)
            .batches(Batches::new("documents", numbered(5)));
        execute(&Context::new(), &mut op).await.unwrap();
    }

    let numbers: Vec<_> = deployment
        .commands()
        .iter()
        .map(|command| command.get_i64("txnNumber").unwrap())
        .collect();
    assert_eq!(numbers, vec![1, 2, 3]);
}

#[tokio::test]
async fn process_response_sees_every_batch() {
    let deployment = small_batches(17);
    for n in [2, 2, 1] {
        deployment.push_response(Response::Command(doc! { "ok": 1, "n": n }));
    }
    let mut seen = Vec::new();

    {
        let mut op = Operation::new("db", deployment.clone(), command(doc! { "insert": "coll" }))
            .op_type(OperationType::Write)
            .batches(Batches::new("documents", numbered(5)))
            .process_response(|info| {
                let n = info.response.and_then(|r| r.get_i32("n").ok()).unwrap_or(-1);
                seen.push((info.current_index, n));
                Ok(())
            });
        execute(&Context::new(), &mut op).await.unwrap();
    }

    assert_eq!(seen, vec![(0, 2), (2, 2), (4, 1)]);
}

#[tokio::test]
async fn server_selection_failure_in_transaction_is_transient() {
    let deployment = Arc::new(MockDeployment::new(
        TopologyType::ReplicaSetWithPrimary,
        vec![server_description("a", ServerType::RsSecondary, 17)],
    ));
    let mut session = Session::new(None);
    session.start_transaction(None).unwrap();

    let error = {
        let mut op = Operation::new("db", deployment.clone(), command(insert_one()))
            .op_type(OperationType::Write)
            .session(&mut session);
        execute(&Context::new(), &mut op).await.unwrap_err()
    };

    assert!(matches!(*error.kind, ErrorKind::ServerSelection { .. }));
    assert!(error.contains_label(TRANSIENT_TRANSACTION_ERROR));
}

#[tokio::test]
async fn sensitive_commands_are_redacted_in_events() {
    let deployment = primary(17);
    deployment.push_response(Response::Command(doc! { "ok": 1, "payload": "secret" }));
    let buffer = EventBuffer::new();

    let mut op = Operation::new("admin", deployment.clone(), command(doc! { "saslStart": 1 }))
        .event_handler(buffer.handler());
    execute(&Context::new(), &mut op).await.unwrap();

    for event in buffer.all() {
        match event {
            crate::event::command::CommandEvent::Started(event) => {
                assert_eq!(event.command, Document::new());
            }
            crate::event::command::CommandEvent::Succeeded(event) => {
                assert_eq!(event.reply, Document::new());
            }
            other => panic!("unexpected event {other:?}"),
        }
    }
}

#[cfg(feature = "zlib-compression")]
#[tokio::test]
async fn commands_are_compressed_unless_sensitive() {
    use crate::compression::Compressor;

    let deployment = Arc::new(
        MockDeployment::new(
            TopologyType::ReplicaSetWithPrimary,
            vec![server_description("a", ServerType::RsPrimary, 17)],
        )
        .compressor(Compressor::Zlib { level: None })
        .with_responses([
            Response::Command(doc! { "ok": 1 }),
            Response::Command(doc! { "ok": 1 }),
        ]),
    );

    let mut op = Operation::new("db", deployment.clone(), command(doc! { "count": "coll" }))
        .op_type(OperationType::Read);
    execute(&Context::new(), &mut op).await.unwrap();
    let mut op = Operation::new("admin", deployment.clone(), command(doc! { "hello": 1 }));
    execute(&Context::new(), &mut op).await.unwrap();

    let compressed: Vec<_> = deployment
        .requests()
        .iter()
        .map(|request| request.compressed)
        .collect();
    assert_eq!(compressed, vec![true, false]);
    assert_eq!(deployment.commands()[0].get_str("count"), Ok("coll"));
}

#[tokio::test]
async fn ended_session_is_rejected_before_selection() {
    let deployment = primary(17);
    let mut session = Session::new(None);
    session.end();

    let error = {
        let mut op = Operation::new("db", deployment.clone(), command(insert_one()))
            .op_type(OperationType::Write)
            .session(&mut session);
        execute(&Context::new(), &mut op).await.unwrap_err()
    };

    assert!(matches!(*error.kind, ErrorKind::SessionEnded));
    assert!(deployment.deprioritized().is_empty());
}

fn load_balancer() -> Arc<MockDeployment> {
    Arc::new(MockDeployment::new(
        TopologyType::LoadBalanced,
        vec![server_description("lb", ServerType::LoadBalancer, 17)],
    ))
}

#[tokio::test]
async fn load_balanced_transaction_pins_its_connection() {
    let deployment = load_balancer();
    deployment.push_response(Response::Command(doc! { "ok": 1 }));
    deployment.push_response(Response::Command(doc! { "ok": 1 }));
    let mut session = Session::new(None);
    session.start_transaction(None).unwrap();

    for _ in 0..2 {
        let mut op = Operation::new("db", deployment.clone(), command(insert_one()))
            .op_type(OperationType::Write)
            .session(&mut session);
        execute(&Context::new(), &mut op).await.unwrap();
    }

    assert!(session.is_pinned());
    assert_eq!(deployment.checkouts(), 1);
    assert_eq!(deployment.closes(), 0);

    session.end();
    assert_eq!(deployment.closes(), 1);
}

#[tokio::test]
async fn transient_error_releases_pinned_connection() {
    let deployment = load_balancer();
    deployment.push_response(Response::ReadFailure);
    let mut session = Session::new(None);
    session.start_transaction(None).unwrap();

    let error = {
        let mut op = Operation::new("db", deployment.clone(), command(insert_one()))
            .op_type(OperationType::Write)
            .session(&mut session);
        execute(&Context::new(), &mut op).await.unwrap_err()
    };

    assert!(error.contains_label(TRANSIENT_TRANSACTION_ERROR));
    assert!(!session.is_pinned());
    assert_eq!(deployment.closes(), 1);
}

#[tokio::test]
async fn retry_is_not_sent_to_server_without_sessions() {
    let a = server_description("a", ServerType::Mongos, 8);
    let mut b = server_description("b", ServerType::Mongos, 8);
    b.session_timeout_minutes = None;
    let deployment = Arc::new(
        MockDeployment::new(TopologyType::Sharded, vec![a, b]).with_responses([
            Response::Command(doc! {
                "ok": 0,
                "code": 11600,
                "codeName": "InterruptedAtShutdown",
            }),
            Response::Command(doc! { "ok": 1, "n": 1 }),
        ]),
    );
    let buffer = EventBuffer::new();
    let mut session = Session::implicit();

    let error = {
        let mut op = Operation::new("db", deployment.clone(), command(insert_one()))
            .op_type(OperationType::Write)
            .retry(RetryMode::Once)
            .session(&mut session)
            .event_handler(buffer.handler());
        execute(&Context::new(), &mut op).await.unwrap_err()
    };

    match *error.kind {
        ErrorKind::Command(ref command_error) => assert_eq!(command_error.code, 11600),
        ref other => panic!("expected command error, got {other:?}"),
    }
    let first = ServerAddress::new("a", 27017);
    assert_eq!(deployment.deprioritized(), vec![vec![], vec![first.clone()]]);
    let requests = deployment.requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].address, first);
    assert_eq!(buffer.get_command_started_events(&["insert"]).len(), 1);
    assert_eq!(deployment.remaining_responses(), 1);
}

#[tokio::test]
async fn network_error_blocks_later_transactions() {
    let deployment = primary(17);
    deployment.push_response(Response::ReadFailure);
    deployment.push_response(Response::Command(doc! { "ok": 1, "n": 0 }));
    let mut session = Session::new(None);

    {
        let mut op = Operation::new("db", deployment.clone(), command(doc! { "count": "coll" }))
            .op_type(OperationType::Read)
            .retry(RetryMode::Once)
            .session(&mut session);
        execute(&Context::new(), &mut op).await.unwrap();
    }

    assert_eq!(deployment.commands().len(), 2);
    assert!(session.is_dirty());
    assert!(session.start_transaction(None).is_err());
    assert_eq!(session.transaction_state(), TransactionState::None);
}

#[tokio::test]
async fn context_retry_surfaces_first_error_when_reselection_fails() {
    let deployment = Arc::new(
        MockDeployment::new(
            TopologyType::ReplicaSetWithPrimary,
            vec![server_description("a", ServerType::RsPrimary, 17)],
        )
        .selectable_attempts(2)
        .with_responses([
            Response::Command(doc! {
                "ok": 0,
                "code": 91,
                "codeName": "ShutdownInProgress",
            }),
            Response::Command(doc! {
                "ok": 0,
                "code": 189,
                "codeName": "PrimarySteppedDown",
            }),
        ]),
    );

    let mut op = Operation::new("db", deployment.clone(), command(doc! { "find": "coll" }))
        .op_type(OperationType::Read)
        .retry(RetryMode::Context);
    let error = execute(&Context::new(), &mut op).await.unwrap_err();

    match *error.kind {
        ErrorKind::Command(ref command_error) => assert_eq!(command_error.code, 91),
        ref other => panic!("expected command error, got {other:?}"),
    }
    assert_eq!(deployment.commands().len(), 2);
    assert_eq!(deployment.deprioritized().len(), 3);
}
