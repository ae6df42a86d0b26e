//! Connection lifecycle against an in-process broker.
//!
//! The broker speaks just enough MQTT 3.1.1 over a local `TcpListener` to
//! drive the session: CONNACK, SUBACK and plain QoS 0 publishes.

use std::time::{Duration, Instant};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio_test::assert_ok;

use saj_common::{BaseConfig, TopicBuilder};
use saj_mqtt::frame::{self, RequestFrame};
use saj_mqtt::{SajClient, SajError, Session, SessionState};

const SERIAL: &str = "H1S267K2429B029410";

const CONNECT: u8 = 0x10;
const SUBSCRIBE: u8 = 0x82;
const PINGREQ: u8 = 0xc0;
const DISCONNECT: u8 = 0xe0;

const CONNACK_ACCEPTED: [u8; 4] = [0x20, 0x02, 0x00, 0x00];
const SUBACK_GRANTED: u8 = 0x00;
const SUBACK_FAILURE: u8 = 0x80;

async fn listen() -> (TcpListener, BaseConfig) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let mut config = BaseConfig::default();
    config.mqtt.host = "127.0.0.1".to_string();
    config.mqtt.port = port;
    config.mqtt.qos = 0;
    config.device.serial = SERIAL.to_string();
    config.requests.connect_timeout_secs = 5;
    config.requests.timeout_secs = 5;

    (listener, config)
}

async fn connect(config: &BaseConfig) -> saj_mqtt::Result<Session> {
    Session::connect(&config.mqtt, &config.device, &config.requests).await
}

async fn read_packet(stream: &mut TcpStream) -> std::io::Result<(u8, Vec<u8>)> {
    let header = stream.read_u8().await?;

    let mut length = 0usize;
    let mut shift = 0;
    loop {
        let byte = stream.read_u8().await?;
        length |= usize::from(byte & 0x7f) << shift;
        if byte & 0x80 == 0 {
            break;
        }
        shift += 7;
    }

    let mut body = vec![0; length];
    stream.read_exact(&mut body).await?;
    Ok((header, body))
}

fn push_remaining_length(packet: &mut Vec<u8>, mut length: usize) {
    loop {
        let mut byte = (length % 128) as u8;
        length /= 128;
        if length > 0 {
            byte |= 0x80;
        }
        packet.push(byte);
        if length == 0 {
            break;
        }
    }
}

fn publish_packet(topic: &str, payload: &[u8]) -> Vec<u8> {
    let mut body = Vec::new();
    body.extend_from_slice(&(topic.len() as u16).to_be_bytes());
    body.extend_from_slice(topic.as_bytes());
    body.extend_from_slice(payload);

    let mut packet = vec![0x30];
    push_remaining_length(&mut packet, body.len());
    packet.extend_from_slice(&body);
    packet
}

/// Split a QoS 0 PUBLISH body into topic and payload.
fn split_publish(body: &[u8]) -> (String, Vec<u8>) {
    let length = usize::from(u16::from_be_bytes([body[0], body[1]]));
    let topic = String::from_utf8(body[2..2 + length].to_vec()).unwrap();
    (topic, body[2 + length..].to_vec())
}

/// Accept one client, acknowledge its CONNECT and return the SUBSCRIBE
/// packet id and topic.
async fn accept_until_subscribe(listener: &TcpListener) -> (TcpStream, [u8; 2], String) {
    let (mut stream, _) = listener.accept().await.unwrap();

    let (header, _) = read_packet(&mut stream).await.unwrap();
    assert_eq!(header, CONNECT);
    stream.write_all(&CONNACK_ACCEPTED).await.unwrap();

    let (header, body) = read_packet(&mut stream).await.unwrap();
    assert_eq!(header, SUBSCRIBE);
    let pkid = [body[0], body[1]];
    let length = usize::from(u16::from_be_bytes([body[2], body[3]]));
    let topic = String::from_utf8(body[4..4 + length].to_vec()).unwrap();

    (stream, pkid, topic)
}

async fn send_suback(stream: &mut TcpStream, pkid: [u8; 2], code: u8) {
    stream
        .write_all(&[0x90, 0x03, pkid[0], pkid[1], code])
        .await
        .unwrap();
}

/// Answer read requests until the client disconnects; returns how many
/// requests were served.
async fn serve_reads(mut stream: TcpStream, values: impl Fn(u16) -> u16) -> usize {
    let topics = TopicBuilder::new(SERIAL);
    let mut served = 0;

    loop {
        let (header, body) = match read_packet(&mut stream).await {
            Ok(packet) => packet,
            Err(_) => return served,
        };

        match header {
            DISCONNECT => return served,
            PINGREQ => stream.write_all(&[0xd0, 0x00]).await.unwrap(),
            0x30 => {
                let (topic, payload) = split_publish(&body);
                assert_eq!(topic, topics.request());

                let request = RequestFrame::decode(&payload).unwrap();
                let data: Vec<u8> = (0..request.argument)
                    .flat_map(|i| values(request.register + i).to_be_bytes())
                    .collect();
                let response =
                    frame::encode_read_response(request.key.id, 0x6710_2030, &data).unwrap();

                stream
                    .write_all(&publish_packet(&topics.response(), &response))
                    .await
                    .unwrap();
                served += 1;
            }
            other => panic!("unexpected packet type {other:#04x}"),
        }
    }
}

#[tokio::test]
async fn test_connect_is_ready_only_after_subscription_ack() {
    let (listener, config) = listen().await;
    let (release_tx, release_rx) = oneshot::channel::<()>();

    let broker = tokio::spawn(async move {
        let (mut stream, pkid, topic) = accept_until_subscribe(&listener).await;
        release_rx.await.unwrap();
        send_suback(&mut stream, pkid, SUBACK_GRANTED).await;

        let served = serve_reads(stream, |register| register).await;
        (topic, served)
    });

    let connect_config = config.clone();
    let connecting = tokio::spawn(async move { connect(&connect_config).await });

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(!connecting.is_finished());

    release_tx.send(()).unwrap();
    let session = assert_ok!(connecting.await.unwrap());
    assert_eq!(session.state(), SessionState::Connected);

    session.shutdown().await;
    assert_eq!(session.state(), SessionState::Disconnected);

    let (topic, served) = broker.await.unwrap();
    assert_eq!(topic, format!("saj/{}/data_transmission_rsp", SERIAL));
    assert_eq!(served, 0);
}

#[tokio::test]
async fn test_refused_subscription_fails_connect() {
    let (listener, config) = listen().await;

    tokio::spawn(async move {
        let (mut stream, pkid, _) = accept_until_subscribe(&listener).await;
        send_suback(&mut stream, pkid, SUBACK_FAILURE).await;
        // Hold the socket open; the client must give up on its own.
        let mut rest = Vec::new();
        let _ = stream.read_to_end(&mut rest).await;
    });

    let err = connect(&config).await.unwrap_err();
    assert!(matches!(err, SajError::Transport(_)), "got {err:?}");
}

#[tokio::test]
async fn test_silent_broker_times_out_and_closes_socket() {
    let (listener, mut config) = listen().await;
    config.requests.connect_timeout_secs = 1;

    let broker = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let (header, _) = read_packet(&mut stream).await.unwrap();
        assert_eq!(header, CONNECT);

        // Never acknowledge; wait for the client to hang up.
        let mut rest = Vec::new();
        tokio::time::timeout(Duration::from_secs(10), stream.read_to_end(&mut rest))
            .await
            .is_ok()
    });

    let started = Instant::now();
    let err = connect(&config).await.unwrap_err();

    assert!(
        matches!(err, SajError::ConnectionTimeout(timeout) if timeout == Duration::from_secs(1)),
        "got {err:?}"
    );
    assert!(started.elapsed() >= Duration::from_secs(1));
    assert!(started.elapsed() < Duration::from_secs(8));
    assert!(broker.await.unwrap(), "client kept the connection open");
}

#[tokio::test]
async fn test_query_round_trip_through_broker() {
    let (listener, config) = listen().await;

    let broker = tokio::spawn(async move {
        let (mut stream, pkid, _) = accept_until_subscribe(&listener).await;
        send_suback(&mut stream, pkid, SUBACK_GRANTED).await;
        serve_reads(stream, |register| register ^ 0x0f0f).await
    });

    let session = assert_ok!(connect(&config).await);
    let client = SajClient::with_session(session, &config);

    let data = assert_ok!(client.query(0x4000, 150).await);
    let expected: Vec<u8> = (0x4000..0x4000 + 150u16)
        .flat_map(|register| (register ^ 0x0f0f).to_be_bytes())
        .collect();
    assert_eq!(data, expected);
    assert_eq!(client.pending(), 0);

    client.shutdown().await;
    assert_eq!(broker.await.unwrap(), 2);
}
