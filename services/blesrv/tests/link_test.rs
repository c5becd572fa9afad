//! Fragmented JSON link tests: multiplexer send path and stream receive path

#![allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable

mod common;

use std::time::Duration;

use serde_json::{json, Value};
use tokio::io::AsyncWriteExt;

use blesrv::core::config::LinkSettings;
use blesrv::core::link::{receive_json, JsonLinkReceiver, JsonLinkSender, PeripheralLink};
use common::{quiet_mux, setup_test_env};
use voltage_ble::packet::reassemble_packets;
use voltage_ble::FrameFormat;

const NOTIFY_PREFIX: &str = "AT+QBLEGATTSNTFY=0,fff2,";

fn settings() -> LinkSettings {
    LinkSettings {
        read_delay_ms: 0,
        ..LinkSettings::default()
    }
}

fn document(len: usize) -> (Value, Vec<u8>) {
    // {"data":"..."} adds 11 bytes around the string
    let value = json!({ "data": "x".repeat(len - 11) });
    let bytes = serde_json::to_vec(&value).unwrap();
    assert_eq!(bytes.len(), len);
    (value, bytes)
}

#[tokio::test]
async fn test_large_document_is_split_into_notify_frames() {
    setup_test_env();
    let (mux, device) = quiet_mux();
    let sender = JsonLinkSender::new(mux, &settings()).unwrap();
    assert_eq!(sender.format().max_payload(), 217);

    let (value, bytes) = document(500);
    sender.send_value(&value).await.unwrap();

    let frames = device.frames();
    assert_eq!(frames.len(), 3);
    for frame in &frames {
        assert!(frame.starts_with(NOTIFY_PREFIX.as_bytes()));
        assert!(frame.len() + 2 <= sender.format().mtu());
    }

    let packets: Vec<_> = frames
        .iter()
        .map(|frame| sender.format().decode(frame).unwrap())
        .collect();
    let sizes: Vec<usize> = packets.iter().map(|p| p.payload.len()).collect();
    assert_eq!(sizes, vec![217, 217, 66]);
    assert!(packets.iter().all(|p| p.total == 3));
    assert_eq!(reassemble_packets(packets).unwrap(), bytes);
}

#[tokio::test]
async fn test_small_document_fits_one_frame() {
    let (mux, device) = quiet_mux();
    let sender = JsonLinkSender::new(mux, &settings()).unwrap();

    sender.send_json(&json!({"ok": true})).await.unwrap();

    let frames = device.frames();
    assert_eq!(frames.len(), 1);
    let packet = sender.format().decode(&frames[0]).unwrap();
    assert_eq!((packet.index, packet.total), (0, 1));
    assert_eq!(&packet.payload[..], br#"{"ok":true}"#);
}

#[tokio::test]
async fn test_empty_payload_sends_nothing() {
    let (mux, device) = quiet_mux();
    let sender = JsonLinkSender::new(mux, &settings()).unwrap();

    sender.send_bytes(&[]).await.unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(device.frames().is_empty());
}

#[tokio::test]
async fn test_failed_packet_aborts_the_message() {
    let (mux, device) = quiet_mux();
    device.respond("AT+QBLEGATTSNTFY", &["ERROR"]);
    let sender = JsonLinkSender::new(mux, &settings()).unwrap();

    let (value, _) = document(500);
    let err = sender.send_value(&value).await.unwrap_err();
    assert!(err.is_command_failed());
    assert_eq!(device.frames().len(), 1);
}

#[tokio::test]
async fn test_frames_reassemble_from_a_byte_stream() {
    let (mux, device) = quiet_mux();
    let sender = JsonLinkSender::new(mux, &settings()).unwrap();
    let (value, bytes) = document(500);
    sender.send_value(&value).await.unwrap();

    // replay the captured frames, last first, onto a fresh stream
    let (mut writer, reader) = tokio::io::duplex(4096);
    for frame in device.frames().iter().rev() {
        writer.write_all(frame).await.unwrap();
        writer.write_all(b"\r\n").await.unwrap();
    }
    drop(writer);

    let format = settings().frame_format().unwrap();
    let received = receive_json(reader, format, None).await.unwrap();
    assert_eq!(received, bytes);
}

#[tokio::test]
async fn test_receiver_yields_consecutive_documents() {
    let format = FrameFormat::notify(64, "fff2").unwrap();
    let (mut writer, reader) = tokio::io::duplex(4096);

    for doc in [json!({"seq": 1, "pad": "aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa"}), json!({"seq": 2})] {
        let data = serde_json::to_vec(&doc).unwrap();
        for packet in format.split(&data).unwrap() {
            writer.write_all(&format.encode(&packet)).await.unwrap();
        }
    }
    drop(writer);

    let mut receiver = JsonLinkReceiver::new(reader, format, Some(Duration::from_secs(5)));
    let first: Value = serde_json::from_slice(&receiver.next_message().await.unwrap().unwrap())
        .unwrap();
    let second: Value = serde_json::from_slice(&receiver.next_message().await.unwrap().unwrap())
        .unwrap();
    assert_eq!(first["seq"], 1);
    assert_eq!(second["seq"], 2);
    assert!(receiver.next_message().await.unwrap().is_none());
}
