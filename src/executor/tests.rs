use super::*;
use crate::config::ProtocolOptions;
use crate::errors::ServerError;
use crate::query::QueryKey;
use crate::transport::PgStream;
use bytes::Bytes;
use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt, DuplexStream};

fn msg(code: u8, body: &[u8]) -> Vec<u8> {
    let mut out = vec![code];
    out.extend_from_slice(&((body.len() + 4) as i32).to_be_bytes());
    out.extend_from_slice(body);
    out
}

fn param(name: &str, value: &str) -> Vec<u8> {
    msg(b'S', format!("{name}\0{value}\0").as_bytes())
}

fn key_data(pid: i32, key: i32) -> Vec<u8> {
    let mut body = pid.to_be_bytes().to_vec();
    body.extend_from_slice(&key.to_be_bytes());
    msg(b'K', &body)
}

fn rfq(status: u8) -> Vec<u8> {
    msg(b'Z', &[status])
}

fn error(code: &str, message: &str, routine: Option<&str>) -> Vec<u8> {
    let mut body = format!("SERROR\0VERROR\0C{code}\0M{message}\0");
    if let Some(routine) = routine {
        body.push_str(&format!("R{routine}\0"));
    }
    body.push('\0');
    msg(b'E', body.as_bytes())
}

fn notice(message: &str) -> Vec<u8> {
    msg(
        b'N',
        format!("SWARNING\0VWARNING\0C01000\0M{message}\0\0").as_bytes(),
    )
}

fn command_complete(tag: &str) -> Vec<u8> {
    msg(b'C', format!("{tag}\0").as_bytes())
}

fn notification(pid: i32, channel: &str, payload: &str) -> Vec<u8> {
    let mut body = pid.to_be_bytes().to_vec();
    body.extend_from_slice(format!("{channel}\0{payload}\0").as_bytes());
    msg(b'A', &body)
}

fn server_error(code: &str) -> Error {
    Error::Server(ServerError::new(
        ServerErrorMessage {
            severity: "ERROR".to_string(),
            code: code.to_string(),
            message: "boom".to_string(),
            ..Default::default()
        },
        true,
    ))
}

fn startup() -> Vec<u8> {
    [
        param("client_encoding", "UTF8"),
        param("server_version", "15.2"),
        key_data(4242, 99),
        rfq(b'I'),
    ]
    .concat()
}

async fn start(
    script: Vec<u8>,
    options: ProtocolOptions,
) -> (Result<QueryExecutorImpl<DuplexStream>, Error>, DuplexStream) {
    let (client, mut server) = duplex(1 << 16);
    server.write_all(&script).await.unwrap();
    let stream = PgStream::new(client, HostSpec::default());
    let executor = QueryExecutorImpl::new(stream, "postgres", "postgres", options).await;
    (executor, server)
}

/// Read one framed frontend message from the server side.
async fn read_message(server: &mut DuplexStream) -> (u8, Vec<u8>) {
    let code = server.read_u8().await.unwrap();
    let len = server.read_i32().await.unwrap();
    let mut body = vec![0; len as usize - 4];
    server.read_exact(&mut body).await.unwrap();
    (code, body)
}

async fn read_codes(server: &mut DuplexStream, count: usize) -> Vec<(u8, Vec<u8>)> {
    let mut out = Vec::new();
    for _ in 0..count {
        out.push(read_message(server).await);
    }
    out
}

#[tokio::test]
async fn test_startup_scenario() {
    let (executor, _server) = start(startup(), ProtocolOptions::default()).await;
    let executor = executor.unwrap();

    assert_eq!(executor.transaction_state(), TransactionState::Idle);
    assert_eq!(executor.backend_pid(), 4242);
    assert_eq!(executor.parameter_status("client_encoding"), Some("UTF8"));
    assert_eq!(executor.parameter_status("server_version"), Some("15.2"));
    assert_eq!(executor.server_version(), "15.2");
    assert_eq!(executor.server_version_num(), 150002);
    assert_eq!(executor.protocol_version(), 3);
    assert_eq!(executor.user(), "postgres");
    assert!(!executor.is_closed());

    let statuses = executor.parameter_statuses();
    let names: Vec<&str> = statuses.keys().map(|name| name.as_str()).collect();
    assert_eq!(names, vec!["client_encoding", "server_version"]);
}

#[tokio::test]
async fn test_parameter_names_are_case_insensitive() {
    let script = [
        param("TimeZone", "Europe/Amsterdam"),
        param("timezone", "UTC"),
        rfq(b'I'),
    ]
    .concat();
    let (executor, _server) = start(script, ProtocolOptions::default()).await;
    let executor = executor.unwrap();

    // The first spelling is kept, the value is replaced.
    let statuses = executor.parameter_statuses();
    assert_eq!(statuses.len(), 1);
    assert_eq!(statuses.keys().next().unwrap().as_str(), "TimeZone");
    assert_eq!(executor.parameter_status("TIMEZONE"), Some("UTC"));
    // Only the exact name has the side effect.
    assert_eq!(executor.base().time_zone(), Some("Europe/Amsterdam"));
}

#[tokio::test]
async fn test_ready_for_query_states() {
    for (status, expected) in [
        (b'I', TransactionState::Idle),
        (b'T', TransactionState::Open),
        (b'E', TransactionState::Failed),
    ] {
        let (executor, _server) = start(rfq(status), ProtocolOptions::default()).await;
        assert_eq!(executor.unwrap().transaction_state(), expected);
    }

    let (executor, _server) = start(rfq(b'X'), ProtocolOptions::default()).await;
    assert!(matches!(executor, Err(Error::ProtocolViolation(_))));

    let (executor, _server) = start(msg(b'Z', b"II"), ProtocolOptions::default()).await;
    assert!(matches!(executor, Err(Error::ProtocolViolation(_))));
}

#[tokio::test]
async fn test_malformed_backend_key_data() {
    let script = [msg(b'K', &4242i32.to_be_bytes()), rfq(b'I')].concat();
    let (executor, _server) = start(script, ProtocolOptions::default()).await;
    assert!(matches!(executor, Err(Error::ProtocolViolation(_))));
}

#[tokio::test]
async fn test_unexpected_startup_message() {
    let script = [command_complete("SELECT 1"), rfq(b'I')].concat();
    let (executor, _server) = start(script, ProtocolOptions::default()).await;
    assert!(matches!(executor, Err(Error::ProtocolViolation(_))));
}

#[tokio::test]
async fn test_startup_error_is_raised() {
    let script = error("28000", "role \"nobody\" does not exist", None);
    let (executor, _server) = start(script, ProtocolOptions::default()).await;
    match executor {
        Err(Error::Server(err)) => {
            assert_eq!(err.sql_state(), "28000");
            assert_eq!(err.message(), "role \"nobody\" does not exist");
        }
        other => panic!("Expected server error, got {:?}", other.err()),
    }
}

#[tokio::test]
async fn test_startup_message_cap() {
    let mut script: Vec<u8> = (0..999).flat_map(|_| notice("hello")).collect();
    script.extend(rfq(b'I'));
    let (executor, _server) = start(script, ProtocolOptions::default()).await;
    let executor = executor.unwrap();
    assert_eq!(executor.take_warnings().len(), 999);
    assert!(executor.take_warnings().is_empty());

    let mut script: Vec<u8> = (0..1000).flat_map(|_| notice("hello")).collect();
    script.extend(rfq(b'I'));
    let (executor, _server) = start(script, ProtocolOptions::default()).await;
    assert!(matches!(executor, Err(Error::ProtocolViolation(_))));
}

#[tokio::test]
async fn test_client_encoding_change_refused() {
    let script = [param("client_encoding", "LATIN1"), rfq(b'I')].concat();
    let (executor, mut server) = start(script, ProtocolOptions::default()).await;
    assert!(matches!(executor, Err(Error::ConnectionFailure(_))));

    // The connection was closed with a Terminate.
    let (code, body) = read_message(&mut server).await;
    assert_eq!(code, b'X');
    assert!(body.is_empty());
}

#[tokio::test]
async fn test_client_encoding_change_allowed() {
    let options = ProtocolOptions {
        allow_encoding_changes: true,
        ..Default::default()
    };
    let script = [
        param("client_encoding", "LATIN1"),
        // "café" in Latin-1
        msg(b'S', b"application_name\0caf\xE9\0"),
        rfq(b'I'),
    ]
    .concat();
    let (executor, _server) = start(script, options).await;
    let executor = executor.unwrap();

    assert_eq!(*executor.encoding(), Encoding::Latin1);
    assert_eq!(executor.base().application_name(), "café");
}

#[tokio::test]
async fn test_date_style_must_be_iso() {
    let (executor, _server) = start(
        [param("DateStyle", "ISO, MDY"), rfq(b'I')].concat(),
        ProtocolOptions::default(),
    )
    .await;
    assert!(executor.is_ok());

    let (executor, _server) = start(
        [param("DateStyle", "SQL, DMY"), rfq(b'I')].concat(),
        ProtocolOptions::default(),
    )
    .await;
    assert!(matches!(executor, Err(Error::ConnectionFailure(_))));
}

#[tokio::test]
async fn test_standard_conforming_strings_toggle() {
    let script = [param("standard_conforming_strings", "on"), rfq(b'I')].concat();
    let (executor, mut server) = start(script, ProtocolOptions::default()).await;
    let mut executor = executor.unwrap();
    assert!(executor.standard_conforming_strings());

    server
        .write_all(
            &[
                command_complete("SET"),
                param("standard_conforming_strings", "off"),
                rfq(b'I'),
            ]
            .concat(),
        )
        .await
        .unwrap();
    let mut collector = RowCollector::default();
    executor
        .execute_simple("set standard_conforming_strings = off", &mut collector)
        .await
        .unwrap();
    assert!(!executor.standard_conforming_strings());
    assert_eq!(collector.statuses, vec!["SET"]);

    server
        .write_all(&param("standard_conforming_strings", "maybe"))
        .await
        .unwrap();
    let result = executor
        .execute_simple("set standard_conforming_strings = maybe", &mut collector)
        .await;
    assert!(matches!(result, Err(Error::ConnectionFailure(_))));
    assert!(executor.is_closed());
}

#[tokio::test]
async fn test_integer_datetimes() {
    let (executor, _server) = start(
        [param("integer_datetimes", "off"), rfq(b'I')].concat(),
        ProtocolOptions::default(),
    )
    .await;
    assert!(!executor.unwrap().base().integer_datetimes());

    let (executor, _server) = start(
        [param("integer_datetimes", "sometimes"), rfq(b'I')].concat(),
        ProtocolOptions::default(),
    )
    .await;
    assert!(matches!(executor, Err(Error::ProtocolViolation(_))));
}

#[tokio::test]
async fn test_server_version_num() {
    let script = [param("server_version_num", "90603"), rfq(b'I')].concat();
    let (executor, _server) = start(script, ProtocolOptions::default()).await;
    assert_eq!(executor.unwrap().server_version_num(), 90603);

    let script = [param("server_version_num", "fifteen"), rfq(b'I')].concat();
    let (executor, _server) = start(script, ProtocolOptions::default()).await;
    assert!(matches!(executor, Err(Error::ProtocolViolation(_))));
}

#[test]
fn test_parse_server_version() {
    assert_eq!(parse_server_version("15.2"), 150002);
    assert_eq!(parse_server_version("9.6.3"), 90603);
    assert_eq!(parse_server_version("16beta1"), 160000);
    assert_eq!(parse_server_version("15.2 (Debian 15.2-1.pgdg110+1)"), 150002);
    assert_eq!(parse_server_version(""), 0);
}

#[tokio::test]
async fn test_transaction_fail_cause() {
    let (executor, mut server) = start(startup(), ProtocolOptions::default()).await;
    let mut executor = executor.unwrap();
    let mut collector = RowCollector::default();

    server
        .write_all(&[error("22012", "division by zero", None), rfq(b'E')].concat())
        .await
        .unwrap();
    let first = executor
        .execute_simple("select 1/0", &mut collector)
        .await
        .unwrap_err();
    assert_eq!(first.sql_state(), Some("22012"));
    assert_eq!(executor.transaction_state(), TransactionState::Failed);

    server
        .write_all(
            &[
                error("25P02", "current transaction is aborted", None),
                rfq(b'E'),
            ]
            .concat(),
        )
        .await
        .unwrap();
    let second = executor
        .execute_simple("select 1", &mut collector)
        .await
        .unwrap_err();
    let second = second.as_server_error().unwrap();
    assert_eq!(second.sql_state(), "25P02");
    assert_eq!(second.root_cause().sql_state(), "22012");
    // E keeps the cause.
    assert_eq!(
        executor.base().transaction_fail_cause().map(|c| c.sql_state()),
        Some("22012")
    );

    server
        .write_all(&[command_complete("ROLLBACK"), rfq(b'I')].concat())
        .await
        .unwrap();
    executor
        .execute_simple("rollback", &mut collector)
        .await
        .unwrap();
    assert_eq!(executor.transaction_state(), TransactionState::Idle);
    assert!(executor.base().transaction_fail_cause().is_none());
    assert_eq!(collector.errors.len(), 2);
    assert!(!executor.is_closed());
}

#[tokio::test]
async fn test_open_transaction_clears_fail_cause() {
    let (executor, mut server) = start(startup(), ProtocolOptions::default()).await;
    let mut executor = executor.unwrap();
    let mut collector = RowCollector::default();

    server
        .write_all(&[error("42601", "syntax error", None), rfq(b'T')].concat())
        .await
        .unwrap();
    assert!(executor
        .execute_simple("selec", &mut collector)
        .await
        .is_err());
    assert_eq!(executor.transaction_state(), TransactionState::Open);
    assert!(executor.base().transaction_fail_cause().is_none());
}

#[tokio::test]
async fn test_will_heal_on_retry() {
    let (executor, mut server) = start(startup(), ProtocolOptions::default()).await;
    let mut executor = executor.unwrap();

    // Idle: stale statement errors heal, others do not.
    assert!(executor.will_heal_on_retry(&server_error("26000")));
    assert!(!executor.will_heal_on_retry(&server_error("23505")));
    assert!(!executor.will_heal_on_retry(&Error::ConnectionClosed));

    server
        .write_all(&[error("22012", "division by zero", None), rfq(b'E')].concat())
        .await
        .unwrap();
    let mut collector = RowCollector::default();
    let _ = executor.execute_simple("select 1/0", &mut collector).await;
    assert_eq!(executor.transaction_state(), TransactionState::Failed);

    // Failed without autosave: nothing heals.
    assert!(!executor.will_heal_on_retry(&server_error("26000")));

    executor.set_autosave(AutoSave::Always);
    assert!(executor.will_heal_on_retry(&server_error("26000")));
}

#[tokio::test]
async fn test_execute_simple_rows() {
    let (executor, mut server) = start(startup(), ProtocolOptions::default()).await;
    let mut executor = executor.unwrap();

    let mut row_description = 1i16.to_be_bytes().to_vec();
    row_description.extend_from_slice(b"answer\0");
    row_description.extend_from_slice(&0i32.to_be_bytes());
    row_description.extend_from_slice(&0i16.to_be_bytes());
    row_description.extend_from_slice(&23i32.to_be_bytes());
    row_description.extend_from_slice(&4i16.to_be_bytes());
    row_description.extend_from_slice(&(-1i32).to_be_bytes());
    row_description.extend_from_slice(&0i16.to_be_bytes());

    let mut data_row = 2i16.to_be_bytes().to_vec();
    data_row.extend_from_slice(&2i32.to_be_bytes());
    data_row.extend_from_slice(b"42");
    data_row.extend_from_slice(&(-1i32).to_be_bytes());

    server
        .write_all(
            &[
                msg(b'T', &row_description),
                msg(b'D', &data_row),
                notice("careful"),
                command_complete("SELECT 1"),
                rfq(b'I'),
            ]
            .concat(),
        )
        .await
        .unwrap();

    let mut collector = RowCollector::default();
    executor
        .execute_simple("select 42, null", &mut collector)
        .await
        .unwrap();

    assert_eq!(collector.fields.len(), 1);
    assert_eq!(collector.fields[0].name, "answer");
    assert_eq!(collector.fields[0].type_oid, 23);
    assert_eq!(
        collector.rows,
        vec![vec![Some(Bytes::from_static(b"42")), None]]
    );
    assert_eq!(collector.statuses, vec!["SELECT 1"]);
    assert!(collector.completed);

    let warnings = executor.take_warnings();
    assert_eq!(warnings.len(), 1);
    assert_eq!(warnings[0].message, "careful");

    let (code, body) = read_message(&mut server).await;
    assert_eq!(code, b'Q');
    assert_eq!(body, b"select 42, null\0");
}

#[tokio::test]
async fn test_execute_prepared_and_evicted_close() {
    let options = ProtocolOptions {
        prepare_threshold: 1,
        prepared_statement_cache_queries: 1,
        ..Default::default()
    };
    let (executor, mut server) = start(startup(), options).await;
    let mut executor = executor.unwrap();
    let mut collector = RowCollector::default();

    let reply = [
        msg(b'1', &[]),
        msg(b'2', &[]),
        msg(b'n', &[]),
        command_complete("INSERT 0 1"),
        rfq(b'I'),
    ]
    .concat();

    // First statement gets S_1.
    server.write_all(&reply).await.unwrap();
    let mut first = executor.borrow_query("insert into t values ($1)").unwrap();
    executor
        .execute_prepared(&mut first, &[Some(Bytes::from_static(b"42"))], &mut collector)
        .await
        .unwrap();
    assert_eq!(first.statement_name(), Some("S_1"));
    assert_eq!(collector.statuses, vec!["INSERT 0 1"]);

    let sent = read_codes(&mut server, 5).await;
    let codes: Vec<u8> = sent.iter().map(|(code, _)| *code).collect();
    assert_eq!(codes, b"PBDES".to_vec());
    assert!(sent[0].1.starts_with(b"S_1\0insert into t values ($1)\0"));

    // Second statement gets S_2 and pushes the first out of the cache.
    server.write_all(&reply).await.unwrap();
    let mut second = executor.borrow_query("insert into u values ($1)").unwrap();
    executor
        .execute_prepared(&mut second, &[None], &mut collector)
        .await
        .unwrap();
    assert_eq!(second.statement_name(), Some("S_2"));
    read_codes(&mut server, 5).await;

    executor.release_query(first);
    executor.release_query(second);

    // Re-running the resident statement closes the evicted one first and
    // skips Parse.
    server
        .write_all(
            &[
                msg(b'3', &[]),
                msg(b'2', &[]),
                msg(b'n', &[]),
                command_complete("INSERT 0 1"),
                rfq(b'I'),
            ]
            .concat(),
        )
        .await
        .unwrap();
    let mut second = executor.borrow_query("insert into u values ($1)").unwrap();
    assert_eq!(second.statement_name(), Some("S_2"));
    executor
        .execute_prepared(&mut second, &[None], &mut collector)
        .await
        .unwrap();

    let sent = read_codes(&mut server, 5).await;
    let codes: Vec<u8> = sent.iter().map(|(code, _)| *code).collect();
    assert_eq!(codes, b"CBDES".to_vec());
    assert_eq!(sent[0].1, b"SS_1\0".to_vec());
    assert!(sent[1].1.starts_with(b"\0S_2\0"));
}

#[tokio::test]
async fn test_stale_statement_is_unprepared() {
    let options = ProtocolOptions {
        prepare_threshold: 1,
        ..Default::default()
    };
    let (executor, mut server) = start(startup(), options).await;
    let mut executor = executor.unwrap();
    let mut collector = RowCollector::default();

    server
        .write_all(
            &[
                msg(b'1', &[]),
                msg(b'2', &[]),
                msg(b'n', &[]),
                command_complete("SELECT 0"),
                rfq(b'I'),
            ]
            .concat(),
        )
        .await
        .unwrap();
    let mut query = executor.borrow_query("select * from t").unwrap();
    executor
        .execute_prepared(&mut query, &[], &mut collector)
        .await
        .unwrap();
    assert!(query.is_prepared());

    server
        .write_all(
            &[
                error(
                    "0A000",
                    "cached plan must not change result type",
                    Some("RevalidateCachedQuery"),
                ),
                rfq(b'I'),
            ]
            .concat(),
        )
        .await
        .unwrap();
    let err = executor
        .execute_prepared(&mut query, &[], &mut collector)
        .await
        .unwrap_err();

    assert!(executor.will_heal_on_retry(&err));
    assert!(!query.is_prepared());
    assert_eq!(
        executor.base().pending_close.lock().iter().cloned().collect::<Vec<_>>(),
        vec!["S_1".to_string()]
    );
}

#[tokio::test]
async fn test_deallocate_all_flushes_cache() {
    let options = ProtocolOptions {
        prepare_threshold: 1,
        ..Default::default()
    };
    let (executor, mut server) = start(startup(), options).await;
    let mut executor = executor.unwrap();
    let mut collector = RowCollector::default();

    server
        .write_all(
            &[
                msg(b'1', &[]),
                msg(b'2', &[]),
                msg(b'n', &[]),
                command_complete("SELECT 0"),
                rfq(b'I'),
            ]
            .concat(),
        )
        .await
        .unwrap();
    let mut query = executor.borrow_query("select 1").unwrap();
    executor
        .execute_prepared(&mut query, &[], &mut collector)
        .await
        .unwrap();
    executor.release_query(query);
    assert_eq!(executor.base().statement_cache().len(), 1);

    server
        .write_all(&[command_complete("DEALLOCATE ALL"), rfq(b'I')].concat())
        .await
        .unwrap();
    executor
        .execute_simple("deallocate all", &mut collector)
        .await
        .unwrap();

    assert!(executor.base().statement_cache().is_empty());
    assert!(executor.base().pending_close.lock().is_empty());
}

#[tokio::test]
async fn test_cache_keys_with_returning_columns() {
    let (executor, _server) = start(startup(), ProtocolOptions::default()).await;
    let mut executor = executor.unwrap();

    let sql = "insert into t(a) values ($1)";
    let by_id = executor.create_query_key(sql, true, true, Returning::Columns(vec!["id".into()]));
    let by_name =
        executor.create_query_key(sql, true, true, Returning::Columns(vec!["name".into()]));

    let query = executor.borrow_query_by_key(by_id.clone()).unwrap();
    executor.release_query(query);

    let other = executor.borrow_query_by_key(by_name.clone()).unwrap();
    assert_eq!(other.key, by_name);
    assert!(executor.base().statement_cache().contains(&by_id));

    let created = executor.create_query_by_key(&QueryKey::callable("{call f()}")).unwrap();
    assert!(created.is_function);
}

#[tokio::test]
async fn test_process_notifies() {
    let (executor, mut server) = start(startup(), ProtocolOptions::default()).await;
    let mut executor = executor.unwrap();

    server
        .write_all(
            &[
                notification(77, "jobs", "42"),
                notice("listener"),
                param("application_name", "worker"),
            ]
            .concat(),
        )
        .await
        .unwrap();

    executor
        .process_notifies(Some(std::time::Duration::from_millis(50)))
        .await
        .unwrap();

    let notifications = executor.take_notifications();
    assert_eq!(
        notifications,
        vec![Notification {
            name: "jobs".to_string(),
            parameter: "42".to_string(),
            pid: 77,
        }]
    );
    assert!(executor.take_notifications().is_empty());
    assert_eq!(executor.take_warnings().len(), 1);
    assert_eq!(executor.base().application_name(), "worker");

    // Nothing pending: returns at once.
    executor.process_notifies(None).await.unwrap();
}

#[tokio::test]
async fn test_read_timeout_aborts_connection() {
    let (executor, _server) = start(startup(), ProtocolOptions::default()).await;
    let mut executor = executor.unwrap();
    executor.set_network_timeout(Some(std::time::Duration::from_millis(20)));
    assert_eq!(
        executor.network_timeout(),
        Some(std::time::Duration::from_millis(20))
    );

    let mut collector = RowCollector::default();
    let result = executor.execute_simple("select pg_sleep(10)", &mut collector).await;
    assert!(matches!(result, Err(Error::ConnectionFailure(_))));
    assert!(executor.is_closed());

    let result = executor.execute_simple("select 1", &mut collector).await;
    assert!(matches!(result, Err(Error::ConnectionClosed)));
}

#[tokio::test]
async fn test_close_is_idempotent() {
    let (executor, mut server) = start(startup(), ProtocolOptions::default()).await;
    let mut executor = executor.unwrap();

    executor.close().await;
    executor.close().await;
    assert!(executor.is_closed());

    let (code, _) = read_message(&mut server).await;
    assert_eq!(code, b'X');
    // Exactly one Terminate, then EOF.
    let mut rest = Vec::new();
    server.read_to_end(&mut rest).await.unwrap();
    assert!(rest.is_empty());
}

#[tokio::test]
async fn test_cancel_token_reads_backend_key() {
    let (executor, _server) = start(startup(), ProtocolOptions::default()).await;
    let executor = executor.unwrap();

    let token = executor.cancel_token();
    assert_eq!(token.host_spec(), executor.host_spec());
    assert_eq!(
        executor.base().shared().backend_key(),
        Some(BackendKey {
            process_id: 4242,
            secret_key: 99,
        })
    );
}

#[tokio::test]
async fn test_warnings_shared_with_other_tasks() {
    let (executor, _server) = start(
        [notice("one"), notice("two"), rfq(b'I')].concat(),
        ProtocolOptions::default(),
    )
    .await;
    let executor = executor.unwrap();

    let shared = executor.base().shared().clone();
    let drained = tokio::spawn(async move { shared.take_warnings() })
        .await
        .unwrap();
    let messages: Vec<String> = drained.into_iter().map(|w| w.message).collect();
    assert_eq!(messages, vec!["one", "two"]);
    assert!(executor.take_warnings().is_empty());
}

#[tokio::test]
async fn test_truncated_row_description_closes_connection() {
    let (executor, mut server) = start(startup(), ProtocolOptions::default()).await;
    let mut executor = executor.unwrap();

    // One field announced, no field bytes follow.
    server
        .write_all(
            &[
                msg(b'T', &1i16.to_be_bytes()),
                command_complete("SELECT 0"),
                rfq(b'I'),
            ]
            .concat(),
        )
        .await
        .unwrap();

    let mut collector = RowCollector::default();
    let result = executor.execute_simple("select 1", &mut collector).await;
    assert!(matches!(result, Err(Error::ProtocolViolation(_))));
    assert!(executor.is_closed());

    // The leftover CommandComplete is never read as the next query's result.
    let mut collector = RowCollector::default();
    let result = executor.execute_simple("select 42", &mut collector).await;
    assert!(matches!(result, Err(Error::ConnectionClosed)));
    assert!(collector.statuses.is_empty());
}

#[tokio::test]
async fn test_truncated_data_row_closes_connection() {
    let (executor, mut server) = start(startup(), ProtocolOptions::default()).await;
    let mut executor = executor.unwrap();

    // Two columns announced, the second length is cut short.
    let mut data_row = 2i16.to_be_bytes().to_vec();
    data_row.extend_from_slice(&(-1i32).to_be_bytes());
    data_row.extend_from_slice(&[0, 0]);
    server
        .write_all(&[msg(b'D', &data_row), command_complete("SELECT 1"), rfq(b'I')].concat())
        .await
        .unwrap();

    let mut collector = RowCollector::default();
    let result = executor.execute_simple("select 1", &mut collector).await;
    assert!(matches!(result, Err(Error::ProtocolViolation(_))));
    assert!(executor.is_closed());
}
