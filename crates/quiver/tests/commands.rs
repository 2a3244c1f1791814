//! End-to-end command tests over the in-memory host.

use std::sync::Arc;

use quiver::commands::args::argv;
use quiver::{dispatch, MemoryHost, ReplyValue, ServerContext};

fn context() -> (ServerContext, Arc<MemoryHost>) {
    let host = Arc::new(MemoryHost::new());
    let ctx = ServerContext::new(host.clone());
    (ctx, host)
}

fn bulk(s: &str) -> ReplyValue {
    ReplyValue::Bulk(s.to_string())
}

fn expect_array(reply: ReplyValue) -> Vec<ReplyValue> {
    match reply {
        ReplyValue::Array(items) => items,
        other => panic!("expected array reply, got {other:?}"),
    }
}

fn ingest_numeric(ctx: &ServerContext, host: &MemoryHost, key: &str, value: &str) {
    let schema = ctx.manager.get("idx").unwrap();
    schema.upsert_record(&fletch::intern(key), &[("num", value)]);
    host.put(0, key, &[("num", value)]);
}

fn create_numeric_index(ctx: &ServerContext) {
    let reply = dispatch(ctx, &argv(&["FT.CREATE", "idx", "SCHEMA", "num", "NUMERIC"]));
    assert_eq!(reply, ReplyValue::Simple("OK".to_string()));
}

#[test]
fn numeric_range_scenario() {
    let (ctx, host) = context();
    create_numeric_index(&ctx);
    ingest_numeric(&ctx, &host, "a", "5");
    ingest_numeric(&ctx, &host, "b", "10");
    ingest_numeric(&ctx, &host, "c", "15");

    let reply = dispatch(&ctx, &argv(&["FT.SEARCH", "idx", "@num:[6 12]", "NOCONTENT"]));
    assert_eq!(expect_array(reply), vec![ReplyValue::Int(1), bulk("b")]);
}

#[test]
fn count_only_with_zero_limit() {
    let (ctx, host) = context();
    create_numeric_index(&ctx);
    for (key, value) in [("a", "5"), ("b", "10"), ("c", "15")] {
        ingest_numeric(&ctx, &host, key, value);
    }
    let reply = dispatch(
        &ctx,
        &argv(&["FT.SEARCH", "idx", "@num:[-inf +inf]", "LIMIT", "0", "0"]),
    );
    assert_eq!(expect_array(reply), vec![ReplyValue::Int(3)]);
}

#[test]
fn tag_pipe_escaping_scenario() {
    let (ctx, _host) = context();
    let reply = dispatch(
        &ctx,
        &argv(&["FT.CREATE", "idx", "SCHEMA", "tag", "TAG", "SEPARATOR", ","]),
    );
    assert_eq!(reply, ReplyValue::Simple("OK".to_string()));
    let schema = ctx.manager.get("idx").unwrap();
    // under a comma separator, the record value "a|b" is one tag
    schema.upsert_record(&fletch::intern("k1"), &[("tag", "a|b")]);

    let reply = dispatch(
        &ctx,
        &argv(&["FT.SEARCH", "idx", r"@tag:{a\|b}", "NOCONTENT"]),
    );
    assert_eq!(expect_array(reply), vec![ReplyValue::Int(1), bulk("k1")]);

    // an unescaped `|` is the query-language OR: tags {a, b}, neither of
    // which is the indexed value "a|b"
    let reply = dispatch(&ctx, &argv(&["FT.SEARCH", "idx", "@tag:{a|b}", "NOCONTENT"]));
    assert_eq!(expect_array(reply), vec![ReplyValue::Int(0)]);
}

#[test]
fn knn_flat_scenario() {
    let (ctx, _host) = context();
    let reply = dispatch(
        &ctx,
        &argv(&[
            "FT.CREATE", "idx", "SCHEMA", "v", "VECTOR", "FLAT", "6", "TYPE", "FLOAT32", "DIM",
            "2", "DISTANCE_METRIC", "L2",
        ]),
    );
    assert_eq!(reply, ReplyValue::Simple("OK".to_string()));
    let schema = ctx.manager.get("idx").unwrap();
    for i in 0..50 {
        let key = format!("doc{i:02}");
        schema.upsert_vector(&fletch::intern(&key), "v", vec![i as f32, 0.0]);
    }

    let mut blob = Vec::new();
    for f in [0.0f32, 0.0] {
        blob.extend_from_slice(&f.to_le_bytes());
    }
    let mut args = argv(&[
        "FT.SEARCH",
        "idx",
        "*=>[KNN 10 @v $q AS score]",
        "PARAMS",
        "2",
        "q",
    ]);
    args.push(blob);
    args.extend(argv(&["DIALECT", "2", "NOCONTENT"]));

    let items = expect_array(dispatch(&ctx, &args));
    assert_eq!(items[0], ReplyValue::Int(10));
    // exactly 10 neighbors in non-decreasing distance order
    let keys: Vec<String> = items[1..]
        .iter()
        .map(|item| match item {
            ReplyValue::Bulk(s) => s.clone(),
            other => panic!("expected key, got {other:?}"),
        })
        .collect();
    assert_eq!(keys.len(), 10);
    let expected: Vec<String> = (0..10).map(|i| format!("doc{i:02}")).collect();
    assert_eq!(keys, expected);
}

#[test]
fn phrase_and_slop_scenario() {
    let (ctx, _host) = context();
    let reply = dispatch(&ctx, &argv(&["FT.CREATE", "idx", "SCHEMA", "body", "TEXT"]));
    assert_eq!(reply, ReplyValue::Simple("OK".to_string()));
    let schema = ctx.manager.get("idx").unwrap();
    schema.upsert_record(&fletch::intern("adjacent"), &[("body", "hello world")]);
    schema.upsert_record(&fletch::intern("gap"), &[("body", "hello big bad world")]);
    schema.upsert_record(&fletch::intern("swapped"), &[("body", "world hello")]);

    let reply = dispatch(
        &ctx,
        &argv(&["FT.SEARCH", "idx", "@body:\"hello world\"", "NOCONTENT"]),
    );
    assert_eq!(expect_array(reply), vec![ReplyValue::Int(1), bulk("adjacent")]);

    // SLOP 2 INORDER: pos(world) - pos(hello) <= 3
    let items = expect_array(dispatch(
        &ctx,
        &argv(&[
            "FT.SEARCH", "idx", "@body:hello world", "SLOP", "2", "INORDER", "NOCONTENT",
        ]),
    ));
    assert_eq!(items[0], ReplyValue::Int(2));
    let mut keys: Vec<&ReplyValue> = items[1..].iter().collect();
    keys.sort_by_key(|v| format!("{v:?}"));
    assert_eq!(keys, vec![&bulk("adjacent"), &bulk("gap")]);
}

#[test]
fn aggregate_groupby_scenario() {
    let (ctx, host) = context();
    let reply = dispatch(
        &ctx,
        &argv(&["FT.CREATE", "idx", "SCHEMA", "x", "TAG", "num", "NUMERIC"]),
    );
    assert_eq!(reply, ReplyValue::Simple("OK".to_string()));
    let schema = ctx.manager.get("idx").unwrap();
    // ten groups with group g getting g members
    let mut doc = 0;
    for group in 1..=10 {
        for _ in 0..group {
            let key = format!("doc{doc}");
            doc += 1;
            let group_name = format!("g{group:02}");
            schema
                .upsert_record(&fletch::intern(&key), &[("x", &group_name), ("num", "1")]);
            host.put(0, &key, &[("x", &group_name), ("num", "1")]);
        }
    }

    let items = expect_array(dispatch(
        &ctx,
        &argv(&[
            "FT.AGGREGATE", "idx", "*", "LOAD", "1", "@x", "GROUPBY", "1", "@x", "REDUCE",
            "COUNT", "0", "AS", "n", "SORTBY", "2", "@n", "DESC", "MAX", "3",
        ]),
    ));
    assert_eq!(items[0], ReplyValue::Int(3));
    let rows: Vec<Vec<ReplyValue>> = items[1..]
        .iter()
        .map(|row| match row {
            ReplyValue::Array(fields) => fields.clone(),
            other => panic!("expected row, got {other:?}"),
        })
        .collect();
    // top three groups by count, descending
    assert_eq!(rows[0], vec![bulk("x"), bulk("g10"), bulk("n"), bulk("10")]);
    assert_eq!(rows[1], vec![bulk("x"), bulk("g09"), bulk("n"), bulk("9")]);
    assert_eq!(rows[2], vec![bulk("x"), bulk("g08"), bulk("n"), bulk("8")]);
}

#[test]
fn sortby_with_sortkeys() {
    let (ctx, host) = context();
    create_numeric_index(&ctx);
    ingest_numeric(&ctx, &host, "low", "1");
    ingest_numeric(&ctx, &host, "high", "9");
    ingest_numeric(&ctx, &host, "mid", "5");

    let items = expect_array(dispatch(
        &ctx,
        &argv(&[
            "FT.SEARCH", "idx", "*", "SORTBY", "num", "DESC", "WITHSORTKEYS", "RETURN", "1",
            "num",
        ]),
    ));
    // three items per neighbor: key, sortkey, fields
    assert_eq!(items[0], ReplyValue::Int(3));
    assert_eq!(items[1], bulk("high"));
    assert_eq!(items[2], bulk("#9"));
    assert_eq!(items[4], bulk("mid"));
    assert_eq!(items[7], bulk("low"));
    assert_eq!(items[8], bulk("#1"));
}

#[test]
fn limit_offset_and_count() {
    let (ctx, host) = context();
    create_numeric_index(&ctx);
    for i in 0..10 {
        ingest_numeric(&ctx, &host, &format!("k{i}"), &i.to_string());
    }
    // o >= total -> empty
    let items = expect_array(dispatch(
        &ctx,
        &argv(&["FT.SEARCH", "idx", "*", "LIMIT", "20", "5", "NOCONTENT"]),
    ));
    assert_eq!(items, vec![ReplyValue::Int(10)]);
    // c == 0 -> count only
    let items = expect_array(dispatch(
        &ctx,
        &argv(&["FT.SEARCH", "idx", "*", "LIMIT", "0", "0"]),
    ));
    assert_eq!(items, vec![ReplyValue::Int(10)]);
    // min(c, total - o) entries
    let items = expect_array(dispatch(
        &ctx,
        &argv(&["FT.SEARCH", "idx", "*", "LIMIT", "8", "5", "NOCONTENT"]),
    ));
    assert_eq!(items.len(), 1 + 2);
}

#[test]
fn error_classes() {
    let (ctx, _host) = context();
    match dispatch(&ctx, &argv(&["FT.SEARCH", "missing", "*"])) {
        ReplyValue::Error(message) => assert!(message.starts_with("NOT-FOUND"), "{message}"),
        other => panic!("expected error, got {other:?}"),
    }

    create_numeric_index(&ctx);
    match dispatch(&ctx, &argv(&["FT.SEARCH", "idx", "@bogus:[1 2]"])) {
        ReplyValue::Error(message) => assert!(message.starts_with("ERR"), "{message}"),
        other => panic!("expected error, got {other:?}"),
    }
    match dispatch(&ctx, &argv(&["FT.SEARCH", "idx", "*", "PARAMS", "2", "p", "v"])) {
        ReplyValue::Error(message) => assert!(message.starts_with("NOT-FOUND"), "{message}"),
        other => panic!("expected error, got {other:?}"),
    }
    match dispatch(&ctx, &argv(&["FT.INFO", "idx", "CLUSTER"])) {
        ReplyValue::Error(message) => assert!(message.starts_with("ERR"), "{message}"),
        other => panic!("expected error, got {other:?}"),
    }
}

#[test]
fn list_and_info_and_drop() {
    let (ctx, _host) = context();
    create_numeric_index(&ctx);
    let items = expect_array(dispatch(&ctx, &argv(&["FT._LIST"])));
    assert_eq!(items, vec![bulk("idx")]);

    let items = expect_array(dispatch(&ctx, &argv(&["FT.INFO", "idx"])));
    assert_eq!(items[0], bulk("index_name"));
    assert_eq!(items[1], bulk("idx"));

    assert_eq!(
        dispatch(&ctx, &argv(&["FT.DROPINDEX", "idx"])),
        ReplyValue::Simple("OK".to_string())
    );
    match dispatch(&ctx, &argv(&["FT.INFO", "idx"])) {
        ReplyValue::Error(message) => assert!(message.starts_with("NOT-FOUND")),
        other => panic!("expected error, got {other:?}"),
    }
    assert!(expect_array(dispatch(&ctx, &argv(&["FT._LIST"]))).is_empty());
}

#[test]
fn internal_update_is_gated() {
    let (ctx, _host) = context();
    match dispatch(&ctx, &argv(&["FT.INTERNAL_UPDATE", "id", "meta", "v1"])) {
        ReplyValue::Error(message) => assert!(message.starts_with("ERR")),
        other => panic!("expected error, got {other:?}"),
    }
}

#[test]
fn debug_subcommands() {
    let (ctx, _host) = context();
    assert!(!expect_array(dispatch(&ctx, &argv(&["FT._DEBUG", "INFO_METADATA"]))).is_empty());
    assert!(!expect_array(dispatch(&ctx, &argv(&["FT._DEBUG", "INFO_VALUES"]))).is_empty());
    match dispatch(&ctx, &argv(&["FT._DEBUG", "NOPE"])) {
        ReplyValue::Error(message) => assert!(message.starts_with("ERR")),
        other => panic!("expected error, got {other:?}"),
    }
}
