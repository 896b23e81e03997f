use scylla_cql::frame::response::result::{CqlValue, Row};
use scylla_rust_repo::codec::{cql_type_name, Entity, Record};
use scylla_rust_repo::{Error, Order};

#[test]
fn order_round_trips_through_record() {
    let cases = vec![
        Order::new("1212", 1212.12, 12.12),
        Order::new("a", 0.0, 0.0),
        Order::new("neg", -5.5, f32::MAX),
        Order::new("ünïcode-key", 1e-30, f32::MIN_POSITIVE),
    ];
    for order in cases {
        let record = order.encode().expect("encode");
        assert_eq!(record.len(), 3);
        assert_eq!(Order::decode(&record).expect("decode"), order);
    }
}

#[test]
fn encode_uses_declared_column_types() {
    let record = Order::new("1212", 1212.12, 12.12).encode().unwrap();
    assert_eq!(record.get("order_id"), Some(&CqlValue::Text("1212".into())));
    assert_eq!(record.get("amount"), Some(&CqlValue::Float(1212.12)));
    assert_eq!(record.get("discount"), Some(&CqlValue::Float(12.12)));
}

#[test]
fn encode_rejects_empty_key() {
    let err = Order::new("", 1.0, 0.0).encode().unwrap_err();
    assert!(matches!(err, Error::Codec { ref column, .. } if column == "order_id"));
}

#[test]
fn decode_fails_on_missing_column() {
    let record = Record::new()
        .with("order_id", CqlValue::Text("x".into()))
        .with("amount", CqlValue::Float(1.0));
    let err = Order::decode(&record).unwrap_err();
    match err {
        Error::Codec { column, detail } => {
            assert_eq!(column, "discount");
            assert!(detail.contains("missing"));
        }
        other => panic!("unexpected error {other}"),
    }
}

#[test]
fn decode_fails_on_wrong_type() {
    let record = Record::new()
        .with("order_id", CqlValue::Int(7))
        .with("amount", CqlValue::Float(1.0))
        .with("discount", CqlValue::Float(0.5));
    let err = Order::decode(&record).unwrap_err();
    assert!(err.to_string().contains("expected text, found int"));
}

#[test]
fn decode_accepts_double_within_float_range() {
    let record = Record::new()
        .with("order_id", CqlValue::Text("d".into()))
        .with("amount", CqlValue::Double(2.5))
        .with("discount", CqlValue::Float(0.25));
    let order = Order::decode(&record).unwrap();
    assert_eq!(order.amount, 2.5);
}

#[test]
fn decode_rejects_double_outside_float_range() {
    let record = Record::new()
        .with("order_id", CqlValue::Text("big".into()))
        .with("amount", CqlValue::Double(1e300))
        .with("discount", CqlValue::Float(0.0));
    let err = Order::decode(&record).unwrap_err();
    assert!(matches!(err, Error::Codec { ref column, .. } if column == "amount"));
    assert!(err.to_string().contains("outside float range"));
}

#[test]
fn decode_rejects_double_that_flushes_to_zero() {
    for tiny in [1e-300, -1e-300] {
        let record = Record::new()
            .with("order_id", CqlValue::Text("tiny".into()))
            .with("amount", CqlValue::Double(tiny))
            .with("discount", CqlValue::Float(0.0));
        let err = Order::decode(&record).unwrap_err();
        assert!(matches!(err, Error::Codec { ref column, .. } if column == "amount"));
        assert!(err.to_string().contains("outside float range"));
    }

    // zero and f32 subnormals still narrow without loss of sign or magnitude class
    for ok in [0.0, 1e-40] {
        let record = Record::new()
            .with("order_id", CqlValue::Text("small".into()))
            .with("amount", CqlValue::Double(ok))
            .with("discount", CqlValue::Float(0.0));
        let order = Order::decode(&record).expect("decode");
        assert_eq!(order.amount, ok as f32);
    }
}

#[test]
fn record_from_row_skips_null_cells() {
    let row = Row {
        columns: vec![
            Some(CqlValue::Text("r1".into())),
            None,
            Some(CqlValue::Float(3.0)),
        ],
    };
    let record = Record::from_row(Order::columns(), row);
    assert_eq!(record.len(), 2);
    assert!(record.get("amount").is_none());
    assert!(Order::decode(&record).is_err());
}

#[test]
fn bind_values_follow_declaration_order() {
    let record = Order::new("k", 1.5, 0.5).encode().unwrap();
    let values = record.bind_values(Order::columns()).unwrap();
    assert_eq!(
        values,
        vec![
            CqlValue::Text("k".into()),
            CqlValue::Float(1.5),
            CqlValue::Float(0.5),
        ]
    );
}

#[test]
fn key_column_is_first_partition_key() {
    assert_eq!(Order::key_column(), "order_id");
    assert_eq!(Order::TABLE, "order_data");
    assert_eq!(Order::new("77", 0.0, 0.0).key(), "77");
}

#[test]
fn cql_type_names_cover_basic_values() {
    let cases = vec![
        (CqlValue::Text("t".into()), "text"),
        (CqlValue::Float(1.0), "float"),
        (CqlValue::Double(1.0), "double"),
        (CqlValue::Int(1), "int"),
        (CqlValue::BigInt(1), "bigint"),
        (CqlValue::Boolean(true), "boolean"),
    ];
    for (value, expected) in cases {
        assert_eq!(cql_type_name(&value), expected);
    }
}

#[test]
fn bigint_reader_rejects_missing_or_mistyped_counts() {
    let record = Record::new().with("count", CqlValue::BigInt(7));
    assert_eq!(record.bigint("count").unwrap(), 7);
    let record = Record::new().with("count", CqlValue::Int(3));
    assert_eq!(record.bigint("count").unwrap(), 3);

    let err = Record::new().bigint("count").unwrap_err();
    assert!(matches!(err, Error::Codec { ref column, .. } if column == "count"));
    let err = Record::new()
        .with("count", CqlValue::Text("7".into()))
        .bigint("count")
        .unwrap_err();
    assert!(err.to_string().contains("expected bigint"));
}
