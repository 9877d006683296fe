//! Measurements emitted through the metrics facade.

use httpmock::{Method::GET, MockServer};
use metrics_util::debugging::{DebugValue, DebuggingRecorder, Snapshotter};
use probe_core::telemetry::{
    ATTR_ERROR_TYPE, ATTR_PROTOCOL_VERSION, ATTR_REUSED, ATTR_STATE, ATTR_STATUS_CODE,
    CONNECT_DURATION, DNS_DURATION, HTTP_CONNECTION, NETSTAT_CONNECTIONS, REQUEST_DURATION,
    TTFB_DURATION,
};
use probe_core::{
    Census, ClientProfile, ConnectionAccountant, Instrumented, Protocol, StubTransport, Transport,
};
use serial_test::serial;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

fn snapshotter() -> &'static Snapshotter {
    static SNAPSHOTTER: OnceLock<Snapshotter> = OnceLock::new();
    SNAPSHOTTER.get_or_init(|| {
        let recorder = DebuggingRecorder::new();
        let snapshotter = recorder.snapshotter();
        recorder.install().expect("no other recorder installed");
        snapshotter
    })
}

type Recorded = (String, Vec<(String, String)>, DebugValue);

/// (name, labels, value) for every metric recorded since the last snapshot.
fn drain() -> Vec<Recorded> {
    snapshotter()
        .snapshot()
        .into_vec()
        .into_iter()
        .map(|(key, _, _, value)| {
            let key = key.key();
            let labels = key
                .labels()
                .map(|l| (l.key().to_string(), l.value().to_string()))
                .collect();
            (key.name().to_string(), labels, value)
        })
        .collect()
}

fn named<'a>(metrics: &'a [Recorded], name: &'a str) -> impl Iterator<Item = &'a Recorded> + 'a {
    metrics.iter().filter(move |(n, _, _)| n == name)
}

fn has_label(labels: &[(String, String)], key: &str, value: &str) -> bool {
    labels.iter().any(|(k, v)| k == key && v == value)
}

fn histogram_len(value: &DebugValue) -> usize {
    match value {
        DebugValue::Histogram(samples) => samples.len(),
        _ => 0,
    }
}

#[tokio::test]
#[serial]
async fn test_successful_request_emits_lifecycle_measurements() {
    snapshotter();
    drain();

    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(GET).path("/");
            then.status(200).body("ok");
        })
        .await;

    let client = ClientProfile {
        protocol: Protocol::Http1,
        request_timeout: Duration::from_secs(5),
        ..ClientProfile::default()
    }
    .build_with(Arc::new(ConnectionAccountant::new()))
    .unwrap();
    let wrapped = Instrumented::new(client);
    let uri: http::Uri = format!("http://localhost:{}/", server.port()).parse().unwrap();
    wrapped.send(&uri).await.unwrap();

    let metrics = drain();

    let request = named(&metrics, REQUEST_DURATION)
        .find(|(_, labels, _)| has_label(labels, ATTR_STATUS_CODE, "200"))
        .expect("request duration recorded");
    assert!(has_label(&request.1, ATTR_PROTOCOL_VERSION, "1.1"));
    assert_eq!(histogram_len(&request.2), 1);

    for name in [TTFB_DURATION, CONNECT_DURATION, DNS_DURATION] {
        let total: usize = named(&metrics, name).map(|(_, _, v)| histogram_len(v)).sum();
        assert!(total >= 1, "{name} not recorded");
    }

    let conn = named(&metrics, HTTP_CONNECTION)
        .find(|(_, labels, _)| has_label(labels, ATTR_REUSED, "false"))
        .expect("connection counter recorded");
    assert!(matches!(conn.2, DebugValue::Counter(n) if n >= 1));
}

#[tokio::test]
#[serial]
async fn test_failed_request_records_error_type() {
    snapshotter();
    drain();

    let wrapped = Instrumented::new(StubTransport::new(Duration::ZERO).fail_every(1));
    let uri: http::Uri = "http://stub.local/".parse().unwrap();
    assert!(wrapped.send(&uri).await.is_err());

    let metrics = drain();
    let failed = metrics
        .iter()
        .find(|(name, labels, _)| {
            name == REQUEST_DURATION && has_label(labels, ATTR_ERROR_TYPE, "connect")
        })
        .expect("failed request duration recorded");
    assert_eq!(histogram_len(&failed.2), 1);
    assert!(!has_label(&failed.1, ATTR_STATUS_CODE, "200"));
}

#[tokio::test]
#[serial]
async fn test_dropped_request_records_cancelled() {
    snapshotter();
    drain();

    let wrapped = Instrumented::new(StubTransport::new(Duration::from_secs(10)));
    let uri: http::Uri = "http://stub.local/".parse().unwrap();
    let res = tokio::time::timeout(Duration::from_millis(10), wrapped.send(&uri)).await;
    assert!(res.is_err());

    let metrics = drain();
    assert!(metrics.iter().any(|(name, labels, _)| {
        name == REQUEST_DURATION && has_label(labels, ATTR_ERROR_TYPE, "cancelled")
    }));
}

fn state_gauge(metrics: &[Recorded], state: &str) -> Option<f64> {
    named(metrics, NETSTAT_CONNECTIONS)
        .find(|(_, labels, _)| has_label(labels, ATTR_STATE, state))
        .and_then(|(_, _, value)| match value {
            DebugValue::Gauge(v) => Some(v.0),
            _ => None,
        })
}

#[cfg(unix)]
#[tokio::test]
#[serial]
async fn test_census_zeroes_vanished_states() {
    snapshotter();
    drain();

    let path = std::env::temp_dir().join(format!("census-{}.txt", std::process::id()));
    let census = Census::from_command(&[
        "cat".to_string(),
        path.display().to_string(),
    ])
    .unwrap()
    .with_pid(4242);

    std::fs::write(
        &path,
        "TCP 1.1.1.1:1 2.2.2.2:443 ESTABLISHED 4242\nTCP 1.1.1.1:2 2.2.2.2:443 TIME_WAIT 4242\n",
    )
    .unwrap();
    census.count().await.unwrap();
    let metrics = drain();
    assert_eq!(state_gauge(&metrics, "ESTABLISHED"), Some(1.0));
    assert_eq!(state_gauge(&metrics, "TIME_WAIT"), Some(1.0));

    std::fs::write(&path, "TCP 1.1.1.1:2 2.2.2.2:443 TIME_WAIT 4242\n").unwrap();
    census.count().await.unwrap();
    let metrics = drain();
    assert_eq!(state_gauge(&metrics, "ESTABLISHED"), Some(0.0));
    assert_eq!(state_gauge(&metrics, "TIME_WAIT"), Some(1.0));

    census.reset();
    let metrics = drain();
    assert_eq!(state_gauge(&metrics, "TIME_WAIT"), Some(0.0));

    std::fs::remove_file(&path).unwrap();
}
