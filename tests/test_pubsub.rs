mod support;

use redmux::{AsyncCommands, Client, ErrorKind};
use support::TestServer;

#[tokio::test]
async fn publish_reaches_subscriber() {
    let server = TestServer::spawn().await;
    let client = Client::open(server.url()).unwrap();

    let mut pubsub = client.get_async_pubsub().await.unwrap();
    let mut subscription = pubsub.subscribe("test::somewhere").await.unwrap();

    let mut publisher = client.get_multiplexed_connection().await.unwrap();
    let receivers: i64 = publisher
        .publish("test::somewhere", "hello there")
        .await
        .unwrap();
    assert_eq!(receivers, 1);

    let msg = subscription.next_message().await.unwrap();
    assert_eq!(msg.get_channel_name(), "test::somewhere");
    assert_eq!(msg.get_payload_bytes(), b"hello there");
}

#[tokio::test]
async fn subscribe_is_idempotent_and_fans_out() {
    let server = TestServer::spawn().await;
    let client = Client::open(server.url()).unwrap();

    let mut pubsub = client.get_async_pubsub().await.unwrap();
    let mut first = pubsub.subscribe("chan").await.unwrap();
    // A second subscribe must not hit the wire again; it attaches another
    // listener to the same subscription.
    let mut second = pubsub.subscribe("chan").await.unwrap();

    let mut publisher = client.get_multiplexed_connection().await.unwrap();
    let receivers: i64 = publisher.publish("chan", "fan-out").await.unwrap();
    assert_eq!(receivers, 1, "the server saw a single subscriber");

    assert_eq!(
        first.next_message().await.unwrap().get_payload_bytes(),
        b"fan-out"
    );
    assert_eq!(
        second.next_message().await.unwrap().get_payload_bytes(),
        b"fan-out"
    );
}

#[tokio::test]
async fn unsubscribe_completes_the_stream() {
    let server = TestServer::spawn().await;
    let client = Client::open(server.url()).unwrap();

    let mut pubsub = client.get_async_pubsub().await.unwrap();
    let mut subscription = pubsub.subscribe("closing").await.unwrap();
    pubsub.unsubscribe("closing").await.unwrap();

    assert!(subscription.next_message().await.is_none());
}

#[tokio::test]
async fn messages_keep_server_order() {
    let server = TestServer::spawn().await;
    let client = Client::open(server.url()).unwrap();

    let mut pubsub = client.get_async_pubsub().await.unwrap();
    let mut subscription = pubsub.subscribe("ordered").await.unwrap();

    let mut publisher = client.get_multiplexed_connection().await.unwrap();
    for i in 0..10 {
        let _: i64 = publisher.publish("ordered", i).await.unwrap();
    }

    for i in 0..10u32 {
        let msg = subscription.next_message().await.unwrap();
        assert_eq!(msg.get_payload::<u32>().unwrap(), i);
    }
}

#[tokio::test]
async fn subscriber_mode_gates_other_commands() {
    let server = TestServer::spawn().await;
    let client = Client::open(server.url()).unwrap();
    let mut con = client.get_multiplexed_connection().await.unwrap();

    // Subscribing through the shared RESP2 connection flips it into
    // subscriber mode.
    redmux::cmd("SUBSCRIBE")
        .arg("gate")
        .query_async::<redmux::Value>(&mut con)
        .await
        .unwrap();

    let err = con.get::<_, String>("foo").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::SubscriptionMode);

    // The allowed set still works.
    let pong: String = con.ping().await.unwrap();
    assert_eq!(pong, "PONG");

    // Leaving subscriber mode lifts the gate.
    redmux::cmd("UNSUBSCRIBE")
        .arg("gate")
        .query_async::<redmux::Value>(&mut con)
        .await
        .unwrap();
    let missing: Option<String> = con.get("foo").await.unwrap();
    assert_eq!(missing, None);
}

#[tokio::test]
async fn subscriber_sees_messages_on_shared_connection() {
    let server = TestServer::spawn().await;
    let client = Client::open(server.url()).unwrap();

    let (push_tx, mut push_rx) = tokio::sync::mpsc::unbounded_channel();
    let config = redmux::aio::AsyncConnectionConfig::new().set_push_sender(push_tx);
    let mut con = client
        .get_multiplexed_connection_with_config(config)
        .await
        .unwrap();

    redmux::cmd("SUBSCRIBE")
        .arg("shared")
        .query_async::<redmux::Value>(&mut con)
        .await
        .unwrap();

    let mut publisher = client.get_multiplexed_connection().await.unwrap();
    let _: i64 = publisher.publish("shared", "payload").await.unwrap();

    // The subscribe ack arrives first, then the message.
    loop {
        let push = push_rx.recv().await.unwrap();
        match push.kind {
            redmux::PushKind::Subscribe => continue,
            redmux::PushKind::Message => {
                let msg = redmux::Msg::from_push_info(push).unwrap();
                assert_eq!(msg.get_payload_bytes(), b"payload");
                break;
            }
            other => panic!("unexpected push kind {other:?}"),
        }
    }
}
