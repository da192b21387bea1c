use std::collections::BTreeMap;

use rabbit_fixtures::config::{ConnectionConfig, ExchangeConfig, ExchangeType, RabbitConfig};
use rabbit_fixtures::rabbitmq::provisioner::exchange_options;
use rabbit_fixtures::{ErrorKind, InMemoryBroker, RabbitFixture, RabbitMQError};

fn connection(vhost: &str, exchanges: &[(&str, &str, ExchangeType)]) -> ConnectionConfig {
    ConnectionConfig {
        host: "localhost".to_string(),
        port: 5672,
        username: "tester".to_string(),
        password: "secret".to_string(),
        vhost: vhost.to_string(),
        management_port: 15672,
        exchanges: exchanges
            .iter()
            .map(|(exchange, queue, kind)| {
                (
                    exchange.to_string(),
                    ExchangeConfig { queue: queue.to_string(), exchange_type: *kind },
                )
            })
            .collect(),
    }
}

fn two_connections() -> RabbitConfig {
    let mut connections = BTreeMap::new();
    connections.insert(
        "orders".to_string(),
        connection(
            "orders_vhost",
            &[
                ("orders.created", "orders.created.q", ExchangeType::Direct),
                ("orders.audit", "orders.audit.q", ExchangeType::Fanout),
            ],
        ),
    );
    connections.insert(
        "billing".to_string(),
        connection(
            "billing_vhost",
            &[
                ("invoices", "invoices.q", ExchangeType::Topic),
                ("receipts", "receipts.q", ExchangeType::Headers),
            ],
        ),
    );
    RabbitConfig { connections }
}

async fn fixture(broker: &InMemoryBroker, config: &RabbitConfig) -> RabbitFixture {
    RabbitFixture::with_clients(config, broker, broker).await.unwrap()
}

#[tokio::test]
async fn provisioning_creates_vhosts_and_bound_empty_queues() {
    let broker = InMemoryBroker::new();
    let config = two_connections();

    let fixture = fixture(&broker, &config).await;

    assert_eq!(fixture.connection_names(), vec!["billing", "orders"]);
    assert!(broker.has_permission("orders_vhost", "tester"));
    assert!(broker.has_permission("billing_vhost", "tester"));
    for (name, connection) in &config.connections {
        for (exchange, exchange_config) in &connection.exchanges {
            assert_eq!(
                broker.exchange_type(&connection.vhost, exchange),
                Some(exchange_config.exchange_type),
                "{} {}",
                name,
                exchange
            );
            assert_eq!(broker.queue_depth(&connection.vhost, &exchange_config.queue), Some(0));
            assert!(broker.has_binding(&connection.vhost, exchange, &exchange_config.queue, ""));
        }
    }
}

#[tokio::test]
async fn published_message_round_trips_through_each_exchange() {
    let broker = InMemoryBroker::new();
    let config = two_connections();
    let fixture = fixture(&broker, &config).await;

    for (name, connection) in &config.connections {
        for (exchange, exchange_config) in &connection.exchanges {
            fixture.publish(exchange, "x", name, None).await.unwrap();
            assert_eq!(
                fixture.fetch_one(&exchange_config.queue, name).await.unwrap(),
                Some("x".to_string())
            );
        }
    }
}

#[tokio::test]
async fn provisioning_twice_is_idempotent() {
    let broker = InMemoryBroker::new();
    let config = two_connections();

    let first = fixture(&broker, &config).await;
    first.publish("orders.audit", "stale", "orders", None).await.unwrap();
    let second = fixture(&broker, &config).await;

    assert_eq!(broker.queue_depth("orders_vhost", "orders.audit.q"), Some(0));
    assert!(broker.has_binding("orders_vhost", "orders.audit", "orders.audit.q", ""));
    assert!(!broker
        .operation_log()
        .iter()
        .any(|op| op.starts_with("exchange.delete") || op.starts_with("queue.delete")));

    second.publish("orders.audit", "fresh", "orders", None).await.unwrap();
    assert_eq!(
        second.fetch_one("orders.audit.q", "orders").await.unwrap(),
        Some("fresh".to_string())
    );
}

#[tokio::test]
async fn conflicting_exchange_type_is_replaced() {
    let broker = InMemoryBroker::new();
    let mut config = two_connections();
    fixture(&broker, &config).await;

    config
        .connections
        .get_mut("orders")
        .unwrap()
        .exchanges
        .get_mut("orders.created")
        .unwrap()
        .exchange_type = ExchangeType::Fanout;
    let fixture = fixture(&broker, &config).await;

    assert_eq!(
        broker.exchange_type("orders_vhost", "orders.created"),
        Some(ExchangeType::Fanout)
    );
    fixture.publish("orders.created", "after", "orders", Some("any.key")).await.unwrap();
    assert_eq!(
        fixture.fetch_one("orders.created.q", "orders").await.unwrap(),
        Some("after".to_string())
    );
}

#[tokio::test]
async fn recreate_follows_purge_and_failed_declare() {
    let broker = InMemoryBroker::new();
    broker.seed_exchange("orders_vhost", "orders.created", ExchangeType::Topic);
    let mut connections = BTreeMap::new();
    connections.insert(
        "orders".to_string(),
        connection("orders_vhost", &[("orders.created", "orders.created.q", ExchangeType::Direct)]),
    );
    let config = RabbitConfig { connections };

    fixture(&broker, &config).await;

    assert_eq!(
        broker.operation_log(),
        vec![
            "queue.purge orders.created.q",
            "queue.declare orders.created.q",
            "exchange.declare orders.created",
            "exchange.delete orders.created",
            "queue.delete orders.created.q",
            "queue.declare orders.created.q",
            "exchange.declare orders.created",
            "queue.bind orders.created.q",
        ]
    );
}

#[tokio::test]
async fn second_conflict_is_fatal() {
    let broker = InMemoryBroker::new();
    broker.conflict_on("exchange.declare");
    let mut connections = BTreeMap::new();
    connections.insert(
        "orders".to_string(),
        connection("orders_vhost", &[("orders.created", "orders.created.q", ExchangeType::Direct)]),
    );
    let config = RabbitConfig { connections };

    let err = RabbitFixture::with_clients(&config, &broker, &broker).await.err().unwrap();

    assert_eq!(err.kind(), ErrorKind::Conflict);
    let declares = broker
        .operation_log()
        .iter()
        .filter(|op| op.starts_with("exchange.declare"))
        .count();
    assert_eq!(declares, 2);
}

#[tokio::test]
async fn failure_during_recreate_propagates() {
    let broker = InMemoryBroker::new();
    // The same exchange name cannot carry two types on one vhost.
    let mut first = connection("shared", &[("events", "events.a", ExchangeType::Direct)]);
    first.username = "a".to_string();
    let mut second = connection("shared", &[("events", "events.b", ExchangeType::Topic)]);
    second.username = "b".to_string();

    let mut connections = BTreeMap::new();
    connections.insert("a".to_string(), first);
    connections.insert("b".to_string(), second);
    let config = RabbitConfig { connections };
    broker.fail_operation("exchange.delete");

    let err = RabbitFixture::with_clients(&config, &broker, &broker).await.err().unwrap();

    // The recreate path hits the injected delete failure and gives up.
    assert_eq!(err.kind(), ErrorKind::Transport);
    assert_eq!(broker.exchange_type("shared", "events"), Some(ExchangeType::Direct));
}

#[tokio::test]
async fn fetch_from_empty_queue_is_none() {
    let broker = InMemoryBroker::new();
    let fixture = fixture(&broker, &two_connections()).await;

    assert_eq!(fixture.fetch_one("invoices.q", "billing").await.unwrap(), None);
}

#[tokio::test]
async fn purge_of_missing_queue_is_not_an_error() {
    let broker = InMemoryBroker::new();
    let fixture = fixture(&broker, &two_connections()).await;

    fixture.purge("never.declared", "orders").await.unwrap();
}

#[tokio::test]
async fn purge_removes_all_messages() {
    let broker = InMemoryBroker::new();
    let fixture = fixture(&broker, &two_connections()).await;
    for body in ["1", "2", "3"] {
        fixture.publish("orders.audit", body, "orders", None).await.unwrap();
    }

    fixture.purge("orders.audit.q", "orders").await.unwrap();
    fixture.purge("orders.audit.q", "orders").await.unwrap();

    assert_eq!(broker.queue_depth("orders_vhost", "orders.audit.q"), Some(0));
}

#[tokio::test]
async fn unknown_connection_fails_before_any_transport_call() {
    let broker = InMemoryBroker::new();
    let fixture = fixture(&broker, &two_connections()).await;
    let channels_before = broker.channels_opened();

    let publish = fixture.publish("orders.audit", "x", "shipping", None).await.unwrap_err();
    let fetch = fixture.fetch_one("orders.audit.q", "shipping").await.unwrap_err();
    let purge = fixture.purge("orders.audit.q", "shipping").await.unwrap_err();
    let assert_empty = fixture.assert_empty("orders.audit.q", "shipping").await.unwrap_err();

    for err in [publish, fetch, purge, assert_empty] {
        assert!(matches!(&err, RabbitMQError::UnknownConnection(name) if name == "shipping"));
        assert_eq!(err.kind(), ErrorKind::Configuration);
        assert!(err.to_string().contains("shipping"));
    }
    assert_eq!(broker.channels_opened(), channels_before);
}

#[tokio::test]
async fn assert_empty_consumes_the_message_it_finds() {
    let broker = InMemoryBroker::new();
    let fixture = fixture(&broker, &two_connections()).await;
    fixture.publish("orders.created", "leftover", "orders", None).await.unwrap();

    let err = fixture.assert_empty("orders.created.q", "orders").await.unwrap_err();
    assert!(matches!(
        err,
        RabbitMQError::QueueNotEmpty { ref queue, ref body } if queue == "orders.created.q" && body == "leftover"
    ));

    fixture.assert_empty("orders.created.q", "orders").await.unwrap();
}

#[tokio::test]
async fn routing_key_is_honoured() {
    let broker = InMemoryBroker::new();
    let fixture = fixture(&broker, &two_connections()).await;

    // Bound with the empty key, so a keyed publish to a direct exchange is dropped.
    fixture
        .publish("orders.created", "keyed", "orders", Some("eu"))
        .await
        .unwrap();
    assert_eq!(fixture.fetch_one("orders.created.q", "orders").await.unwrap(), None);

    fixture.publish("", "direct", "orders", Some("orders.created.q")).await.unwrap();
    assert_eq!(
        fixture.fetch_one("orders.created.q", "orders").await.unwrap(),
        Some("direct".to_string())
    );
}

#[tokio::test]
async fn unreachable_broker_aborts_construction() {
    let broker = InMemoryBroker::new();
    let mut config = two_connections();
    config.connections.get_mut("orders").unwrap().host = "down.local".to_string();
    broker.unreachable_host("down.local");

    let err = RabbitFixture::with_clients(&config, &broker, &broker).await.err().unwrap();

    assert_eq!(err.kind(), ErrorKind::Management);
    // "billing" sorts first and was set up; "orders" never got a connection.
    assert_eq!(broker.connections_opened(), 1);
    assert!(!broker.vhost_exists("orders_vhost"));
}

#[tokio::test]
async fn operations_leave_no_channel_open() {
    let broker = InMemoryBroker::new();
    let fixture = fixture(&broker, &two_connections()).await;

    fixture.publish("orders.audit", "x", "orders", None).await.unwrap();
    fixture.fetch_one("orders.audit.q", "orders").await.unwrap();
    fixture.purge("missing", "orders").await.unwrap();

    assert_eq!(broker.channels_in_use(), 0);
}

#[tokio::test]
async fn declarations_match_durable_non_auto_delete_settings() {
    let broker = InMemoryBroker::new();
    broker.seed_exchange("orders_vhost", "orders.audit", ExchangeType::Fanout);
    let options = exchange_options();
    assert!(options.durable);
    assert!(!options.auto_delete);

    fixture(&broker, &two_connections()).await;

    // The seeded exchange is durable and non-auto-delete, so it is reused as is.
    assert!(!broker
        .operation_log()
        .contains(&"exchange.delete orders.audit".to_string()));
}

#[tokio::test]
async fn binary_message_is_returned_with_the_decode_error() {
    let broker = InMemoryBroker::new();
    let fixture = fixture(&broker, &two_connections()).await;
    broker.seed_message("orders_vhost", "orders.created.q", &[0xff, 0xfe, 0x01]);

    let err = fixture.fetch_one("orders.created.q", "orders").await.unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Decode);
    assert!(matches!(
        err,
        RabbitMQError::DeserializationError { ref queue, ref body, .. }
            if queue == "orders.created.q" && body == &[0xff, 0xfe, 0x01]
    ));
    assert_eq!(broker.queue_depth("orders_vhost", "orders.created.q"), Some(0));
}

#[tokio::test]
async fn assert_empty_reports_binary_message_as_not_empty() {
    let broker = InMemoryBroker::new();
    let fixture = fixture(&broker, &two_connections()).await;
    broker.seed_message("orders_vhost", "orders.created.q", &[0xff, 0xfe, 0x01]);

    let err = fixture.assert_empty("orders.created.q", "orders").await.unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Assertion);
    assert!(matches!(
        err,
        RabbitMQError::QueueNotEmpty { ref queue, ref body }
            if queue == "orders.created.q" && body == "\u{fffd}\u{fffd}\u{1}"
    ));
    fixture.assert_empty("orders.created.q", "orders").await.unwrap();
}

#[tokio::test]
async fn publish_to_missing_exchange_is_fire_and_forget() {
    let broker = InMemoryBroker::new();
    let fixture = fixture(&broker, &two_connections()).await;

    fixture.publish("never.declared", "x", "orders", None).await.unwrap();

    assert_eq!(broker.channels_in_use(), 0);
    fixture.assert_empty("orders.created.q", "orders").await.unwrap();
}

#[tokio::test]
async fn close_reaches_every_connection_despite_a_failure() {
    let broker = InMemoryBroker::new();
    let fixture = fixture(&broker, &two_connections()).await;
    broker.fail_operation("connection.close");

    let err = fixture.close().await.unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Transport);
    let closes = broker
        .operation_log()
        .iter()
        .filter(|op| op.starts_with("connection.close"))
        .count();
    assert_eq!(closes, 2);
}
