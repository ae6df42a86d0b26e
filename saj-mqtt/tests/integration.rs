//! End-to-end tests of the client against a simulated inverter.
//!
//! The inverter task reads request frames from a `ChannelLink`, builds
//! responses with the codec's device-side helpers and feeds them to
//! `dispatch`, exactly as the session pump does with broker traffic.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc::UnboundedReceiver;
use tokio_test::{assert_err, assert_ok};

use saj_common::{BaseConfig, TopicBuilder};
use saj_mqtt::frame::{self, RequestFrame};
use saj_mqtt::{
    ChannelLink, Correlator, Dispatch, PublishedFrame, RequestKind, SajClient, SajError, Session,
    SessionState, dispatch,
};

const SERIAL: &str = "H1S267K2429B029410";
const METER_REGISTER: u16 = 0x40a1;
const METER_WATTS: i16 = -123;

struct Harness {
    client: SajClient,
    correlator: Arc<Correlator>,
    requests: UnboundedReceiver<PublishedFrame>,
}

fn harness() -> Harness {
    let mut config = BaseConfig::default();
    config.device.serial = SERIAL.to_string();

    let (link, requests) = ChannelLink::new();
    let session = Session::attach(Arc::new(link), TopicBuilder::new(SERIAL));
    let correlator = session.correlator();

    Harness {
        client: SajClient::with_session(session, &config).with_timeout(Duration::from_secs(5)),
        correlator,
        requests,
    }
}

/// Simulated register bank: every register holds its own address, except
/// the grid meter.
fn register_value(register: u16) -> u16 {
    if register == METER_REGISTER {
        METER_WATTS as u16
    } else {
        register
    }
}

fn expected_bytes(start: u16, count: u16) -> Vec<u8> {
    (0..count)
        .flat_map(|i| register_value(start + i).to_be_bytes())
        .collect()
}

fn respond(request: &RequestFrame) -> Vec<u8> {
    match request.key.kind {
        RequestKind::Read => {
            let data = expected_bytes(request.register, request.argument);
            frame::encode_read_response(request.key.id, 0x6710_2030, &data).unwrap()
        }
        RequestKind::Write => {
            frame::encode_write_response(request.key.id, 0x6710_2030, request.argument, 0xbeef)
        }
    }
}

async fn next_request(requests: &mut UnboundedReceiver<PublishedFrame>) -> RequestFrame {
    let published = requests.recv().await.expect("client published a request");
    assert_eq!(published.topic, format!("saj/{}/data_transmission", SERIAL));
    RequestFrame::decode(&published.payload).expect("request frame decodes")
}

#[tokio::test]
async fn test_query_single_register() {
    let Harness {
        client,
        correlator,
        mut requests,
    } = harness();

    let device = tokio::spawn(async move {
        let request = next_request(&mut requests).await;
        assert_eq!(request.register, METER_REGISTER);
        assert_eq!(request.argument, 1);
        assert_eq!(request.slave_address, 1);
        dispatch(&correlator, &respond(&request))
    });

    let data = assert_ok!(client.query(METER_REGISTER, 1).await);
    assert_eq!(data.len(), 2);
    assert_eq!(i16::from_be_bytes([data[0], data[1]]), METER_WATTS);
    assert!(matches!(device.await.unwrap(), Dispatch::Resolved(_)));
    assert_eq!(client.pending(), 0);
}

#[tokio::test]
async fn test_query_chunks_and_reassembles_in_address_order() {
    let Harness {
        client,
        correlator,
        mut requests,
    } = harness();

    let device = tokio::spawn(async move {
        let mut batch = Vec::new();
        for _ in 0..3 {
            batch.push(next_request(&mut requests).await);
        }

        // Answer the last chunk first.
        for request in batch.iter().rev() {
            assert_eq!(
                dispatch(&correlator, &respond(request)),
                Dispatch::Resolved(request.key)
            );
        }

        batch
            .iter()
            .map(|request| (request.register, request.argument))
            .collect::<Vec<_>>()
    });

    let data = assert_ok!(client.query(0x4000, 250).await);

    assert_eq!(
        device.await.unwrap(),
        vec![(0x4000, 100), (0x4064, 100), (0x40c8, 50)]
    );
    assert_eq!(data.len(), 500);
    assert_eq!(data, expected_bytes(0x4000, 250));
}

#[tokio::test]
async fn test_stray_response_is_ignored() {
    let Harness {
        client,
        correlator,
        mut requests,
    } = harness();

    let device = tokio::spawn(async move {
        let request = next_request(&mut requests).await;

        let stray_id = request.key.id.wrapping_add(1);
        let stray = frame::encode_read_response(stray_id, 0, &[0xde, 0xad]).unwrap();
        let stray_outcome = dispatch(&correlator, &stray);

        let outcome = dispatch(&correlator, &respond(&request));
        (stray_outcome, outcome)
    });

    let data = assert_ok!(client.query(0x4010, 1).await);
    assert_eq!(data, vec![0x40, 0x10]);

    let (stray, outcome) = device.await.unwrap();
    assert_eq!(stray, Dispatch::Discarded);
    assert!(matches!(outcome, Dispatch::Resolved(_)));
}

#[tokio::test]
async fn test_corrupted_checksum_fails_without_waiting_for_timeout() {
    let Harness {
        client,
        correlator,
        mut requests,
    } = harness();
    let client = client.with_timeout(Duration::from_secs(30));

    tokio::spawn(async move {
        let request = next_request(&mut requests).await;
        let mut response = respond(&request);
        let last = response.len() - 1;
        response[last] ^= 0x01;
        dispatch(&correlator, &response)
    });

    let started = Instant::now();
    let err = assert_err!(client.query(0x4020, 2).await);

    assert!(matches!(err, SajError::Integrity { .. }), "got {err:?}");
    assert!(started.elapsed() < Duration::from_secs(10));
    assert_eq!(client.pending(), 0);
}

#[tokio::test]
async fn test_concurrent_queries_do_not_cross_deliver() {
    let Harness {
        client,
        correlator,
        mut requests,
    } = harness();

    let device = tokio::spawn(async move {
        let mut batch = Vec::new();
        for _ in 0..5 {
            batch.push(next_request(&mut requests).await);
        }

        for index in [3, 0, 4, 2, 1] {
            let request = &batch[index];
            assert_eq!(
                dispatch(&correlator, &respond(request)),
                Dispatch::Resolved(request.key)
            );
        }
    });

    // Overlapping ranges of three and two chunks.
    let (wide, narrow) = tokio::join!(client.query(0x4000, 250), client.query(0x4032, 150));

    assert_eq!(wide.unwrap(), expected_bytes(0x4000, 250));
    assert_eq!(narrow.unwrap(), expected_bytes(0x4032, 150));
    device.await.unwrap();
    assert_eq!(client.pending(), 0);
}

#[tokio::test]
async fn test_timeout_leaves_no_pending_entries() {
    let Harness {
        client,
        correlator,
        mut requests,
    } = harness();
    let client = client.with_timeout(Duration::from_millis(100));

    let err = assert_err!(client.query(0x4030, 150).await);
    assert!(
        matches!(err, SajError::RequestTimeout { outstanding: 2, .. }),
        "got {err:?}"
    );
    assert!(err.is_timeout());
    assert_eq!(client.pending(), 0);

    // The device answers late; nobody is waiting any more.
    let request = next_request(&mut requests).await;
    assert_eq!(dispatch(&correlator, &respond(&request)), Dispatch::Discarded);
    assert!(correlator.is_empty());
}

#[tokio::test]
async fn test_cancelled_query_leaves_no_pending_entries() {
    let Harness {
        client,
        correlator,
        mut requests,
    } = harness();

    let cancelled =
        tokio::time::timeout(Duration::from_millis(50), client.query(0x4000, 250)).await;
    assert!(cancelled.is_err());
    assert_eq!(client.pending(), 0);

    let request = next_request(&mut requests).await;
    assert_eq!(dispatch(&correlator, &respond(&request)), Dispatch::Discarded);
    assert!(correlator.is_empty());
}

#[tokio::test]
async fn test_cancelled_write_leaves_no_pending_entries() {
    let Harness {
        client,
        mut requests,
        ..
    } = harness();

    tokio::select! {
        result = client.write(0x3249, 100) => {
            panic!("write finished without a response: {result:?}")
        }
        _ = tokio::time::sleep(Duration::from_millis(50)) => {}
    }

    assert!(requests.try_recv().is_ok());
    assert_eq!(client.pending(), 0);
}

#[tokio::test]
async fn test_short_chunk_is_a_protocol_error() {
    let Harness {
        client,
        correlator,
        mut requests,
    } = harness();

    tokio::spawn(async move {
        let request = next_request(&mut requests).await;
        // One register of data for a two-register read.
        let response = frame::encode_read_response(request.key.id, 0, &[0x00, 0x01]).unwrap();
        dispatch(&correlator, &response)
    });

    let err = assert_err!(client.query(0x4040, 2).await);
    assert!(matches!(err, SajError::Protocol(_)), "got {err:?}");
}

#[tokio::test]
async fn test_write_returns_echoed_value() {
    let Harness {
        client,
        correlator,
        mut requests,
    } = harness();

    let device = tokio::spawn(async move {
        let request = next_request(&mut requests).await;
        assert_eq!(request.key.kind, RequestKind::Write);
        assert_eq!(request.register, 0x3249);
        dispatch(&correlator, &respond(&request));
        request.argument
    });

    let echoed = assert_ok!(client.write(0x3249, 6000).await);
    assert_eq!(echoed, 6000);
    assert_eq!(device.await.unwrap(), 6000);
}

#[tokio::test]
async fn test_zero_count_query_publishes_nothing() {
    let Harness {
        client,
        mut requests,
        ..
    } = harness();

    let data = assert_ok!(client.query(0x4000, 0).await);
    assert!(data.is_empty());
    assert!(requests.try_recv().is_err());
}

#[tokio::test]
async fn test_range_past_last_register_is_rejected() {
    let Harness { client, .. } = harness();

    let err = assert_err!(client.query(0xfff0, 0x20).await);
    assert!(matches!(err, SajError::InvalidRequest(_)));
    assert_eq!(client.pending(), 0);
}

#[tokio::test]
async fn test_publish_failure_purges_registered_requests() {
    let Harness {
        client, requests, ..
    } = harness();
    drop(requests);

    let err = assert_err!(client.query(0x4000, 250).await);
    assert!(matches!(err, SajError::Transport(_)), "got {err:?}");
    assert_eq!(client.pending(), 0);
}

#[tokio::test]
async fn test_not_connected_after_shutdown() {
    let Harness { client, .. } = harness();

    client.shutdown().await;
    assert_eq!(client.state(), SessionState::Disconnected);

    let err = assert_err!(client.query(METER_REGISTER, 1).await);
    assert!(matches!(err, SajError::NotConnected));

    let err = assert_err!(client.write(0x3249, 100).await);
    assert!(matches!(err, SajError::NotConnected));
}
