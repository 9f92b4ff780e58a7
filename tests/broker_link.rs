//! End-to-end runs against a minimal in-process MQTT 3.1.1 responder.
//!
//! The responder speaks just enough of the protocol for one client: it
//! answers CONNECT, SUBSCRIBE and PINGREQ, and pushes the given payloads on
//! the subscribed topic right after the SUBACK.

use brew_scale::{
    test_connection, BrokerConfig, Config, DatabaseService, MqttService, SensorReading, StartOutcome, StatusReader,
};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use time::OffsetDateTime;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

const CONNACK_ACCEPTED: u8 = 0x00;
const CONNACK_NOT_AUTHORIZED: u8 = 0x05;

async fn read_packet(stream: &mut TcpStream) -> Option<(u8, Vec<u8>)> {
    let mut header = [0u8; 1];
    stream.read_exact(&mut header).await.ok()?;

    let mut remaining = 0usize;
    let mut shift = 0;
    loop {
        let mut byte = [0u8; 1];
        stream.read_exact(&mut byte).await.ok()?;
        remaining |= ((byte[0] & 0x7f) as usize) << shift;
        if byte[0] & 0x80 == 0 {
            break;
        }
        shift += 7;
    }

    let mut body = vec![0u8; remaining];
    stream.read_exact(&mut body).await.ok()?;
    Some((header[0], body))
}

fn publish_packet(topic: &str, payload: &str) -> Vec<u8> {
    let remaining = 2 + topic.len() + payload.len();
    assert!(remaining < 128, "test packets use a one-byte length");

    let mut packet = vec![0x30, remaining as u8];
    packet.extend_from_slice(&(topic.len() as u16).to_be_bytes());
    packet.extend_from_slice(topic.as_bytes());
    packet.extend_from_slice(payload.as_bytes());
    packet
}

async fn serve_client(mut stream: TcpStream, connack_code: u8, payloads: Vec<&'static str>) {
    while let Some((header, body)) = read_packet(&mut stream).await {
        match header >> 4 {
            // CONNECT
            1 => {
                if stream.write_all(&[0x20, 0x02, 0x00, connack_code]).await.is_err() {
                    return;
                }
                if connack_code != CONNACK_ACCEPTED {
                    return;
                }
            }
            // SUBSCRIBE
            8 => {
                let topic_len = u16::from_be_bytes([body[2], body[3]]) as usize;
                let topic = String::from_utf8_lossy(&body[4..4 + topic_len]).to_string();
                if stream.write_all(&[0x90, 0x03, body[0], body[1], 0x00]).await.is_err() {
                    return;
                }
                for payload in &payloads {
                    if stream.write_all(&publish_packet(&topic, payload)).await.is_err() {
                        return;
                    }
                }
            }
            // PINGREQ
            12 => {
                if stream.write_all(&[0xd0, 0x00]).await.is_err() {
                    return;
                }
            }
            // DISCONNECT
            14 => return,
            _ => {}
        }
    }
}

async fn spawn_broker(connack_code: u8, payloads: Vec<&'static str>) -> (u16, JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let handle = tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            tokio::spawn(serve_client(stream, connack_code, payloads.clone()));
        }
    });
    (port, handle)
}

fn database(dir: &TempDir) -> Arc<DatabaseService> {
    let db = DatabaseService::new(dir.path().join("brewscale.db")).unwrap();
    db.initialize_db().unwrap();
    Arc::new(db)
}

async fn wait_for_weight(service: &MqttService, expected_kg: f64) -> SensorReading {
    for _ in 0..100 {
        if let Some(reading) = service.latest_weight() {
            if reading.weight_kg == expected_kg {
                return reading;
            }
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("no {} kg reading arrived within 5 seconds", expected_kg);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn published_weight_reaches_every_worker_and_clears_on_stop() {
    let (port, broker) = spawn_broker(CONNACK_ACCEPTED, vec!["5000"]).await;
    let dir = TempDir::new().unwrap();
    let db = database(&dir);

    let broker_config = BrokerConfig {
        host: "127.0.0.1".to_string(),
        port,
        topic_prefix: "brewery".to_string(),
        enabled: true,
        ..BrokerConfig::default()
    };
    db.save_broker_config(&broker_config).unwrap();

    let service = MqttService::new(db.clone(), Config::default());
    assert_eq!(service.start(broker_config).await, StartOutcome::Started);

    let reading = wait_for_weight(&service, 5.0).await;
    let age = OffsetDateTime::now_utc() - reading.observed_at;
    assert!(age < time::Duration::seconds(10));
    assert!(service.is_connected().await);

    // a second worker process only has the database file
    let other_worker = StatusReader::new(database(&dir), Duration::from_secs(90));
    assert!(other_worker.is_connected().unwrap());
    assert_eq!(other_worker.latest_weight().unwrap().map(|r| r.weight_kg), Some(5.0));

    service.stop().await;
    assert!(service.latest_weight().is_none());
    assert!(!service.is_connected().await);
    assert!(!other_worker.is_connected().unwrap());

    broker.abort();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn malformed_payload_does_not_break_the_session() {
    let (port, broker) = spawn_broker(CONNACK_ACCEPTED, vec!["1234", "not-a-number", "2500,4"]).await;
    let dir = TempDir::new().unwrap();
    let db = database(&dir);

    let broker_config = BrokerConfig {
        host: "127.0.0.1".to_string(),
        port,
        enabled: true,
        ..BrokerConfig::default()
    };
    db.save_broker_config(&broker_config).unwrap();

    let service = MqttService::new(db.clone(), Config::default());
    service.start(broker_config).await;

    wait_for_weight(&service, 2.5).await;
    assert!(service.is_running().await);

    service.stop().await;
    broker.abort();
}

#[tokio::test]
async fn connection_test_reports_success_and_refusal() {
    let (accepting, accepting_broker) = spawn_broker(CONNACK_ACCEPTED, vec![]).await;
    let result = test_connection("127.0.0.1", accepting, None, None, false, Duration::from_secs(5)).await;
    assert!(result.success);
    assert_eq!(result.message, "Connection successful");

    let (refusing, refusing_broker) = spawn_broker(CONNACK_NOT_AUTHORIZED, vec![]).await;
    let result = test_connection(
        "127.0.0.1",
        refusing,
        Some("brewer"),
        Some("wrong"),
        false,
        Duration::from_secs(5),
    )
    .await;
    assert!(!result.success);
    assert_eq!(result.message, "Not authorized");

    accepting_broker.abort();
    refusing_broker.abort();
}

#[tokio::test]
async fn silent_broker_times_out() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    // accepts but never answers CONNECT
    let silent = tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((stream, _)) = listener.accept().await {
            held.push(stream);
        }
    });

    let result = test_connection("127.0.0.1", port, None, None, false, Duration::from_secs(1)).await;
    assert!(!result.success);
    assert_eq!(result.message, "Connection timeout after 1 seconds");

    silent.abort();
}
