mod common;

use std::sync::Arc;
use std::time::Duration;

use common::*;
use hwlink_core::protocol::legacy::{LegacyCodec, ACK_COMMAND, NACK_COMMAND};
use hwlink_core::protocol::{
    ConnectionState, DeviceConnection, PacketVersion, ProtocolError, RawData,
};
use pretty_assertions::assert_eq;

const PROBE_COMMAND: u32 = 41;
const DATA_COMMAND: u32 = 12;

async fn connect_v2<F>(responder: F) -> (DeviceConnection, Arc<MockDevice>)
where
    F: FnMut(&[u8]) -> Vec<Vec<u8>> + Send + 'static,
{
    let (connection, device) = open_with(test_config(), responder).await;
    assert_eq!(
        connection.negotiate_version().await.unwrap(),
        PacketVersion::V2
    );
    (connection, device)
}

#[tokio::test(start_paused = true)]
async fn test_negotiation_falls_back_to_v2() {
    let (connection, device) = connect_v2(acking_legacy_device(PacketVersion::V2)).await;

    assert_eq!(connection.state(), ConnectionState::Connected);
    assert_eq!(connection.working_version(), Some(PacketVersion::V2));

    let probes = device.written_legacy(PacketVersion::V2, PROBE_COMMAND);
    assert_eq!(probes.len(), 1);
    assert_eq!(probes[0].data, vec![0x00]);

    assert!(matches!(
        connection.commands().err(),
        Some(ProtocolError::UnsupportedVersion(PacketVersion::V2))
    ));
}

#[tokio::test(start_paused = true)]
async fn test_send_waits_for_each_ack() {
    let (connection, device) = connect_v2(acking_legacy_device(PacketVersion::V2)).await;

    let data: Vec<u8> = (0..100).collect();
    connection
        .send_legacy_data(DATA_COMMAND, &data)
        .await
        .unwrap();

    let frames = device.written_legacy(PacketVersion::V2, DATA_COMMAND);
    assert_eq!(frames.len(), 3);
    let sent: Vec<u8> = frames.iter().flat_map(|f| f.data.clone()).collect();
    assert_eq!(sent, data);
}

#[tokio::test(start_paused = true)]
async fn test_nacked_frame_is_retried_then_fails() {
    let codec = LegacyCodec::new(PacketVersion::V2);
    let (connection, device) = connect_v2(legacy_device(PacketVersion::V2, move |frame| {
        if frame.command_type == PROBE_COMMAND {
            vec![codec.ack(frame.current_packet_number)]
        } else {
            vec![codec.nack(frame.current_packet_number)]
        }
    }))
    .await;

    let err = connection
        .send_legacy_data(DATA_COMMAND, &[1, 2, 3])
        .await
        .unwrap_err();
    assert!(matches!(err, ProtocolError::WriteError(_)));
    assert_eq!(device.written_legacy(PacketVersion::V2, DATA_COMMAND).len(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_received_frames_are_acked_and_reassembled() {
    let (connection, device) = connect_v2(acking_legacy_device(PacketVersion::V2)).await;

    let data: Vec<u8> = (0..100).map(|i| 255 - i).collect();
    for frame in LegacyCodec::new(PacketVersion::V2).encode(DATA_COMMAND, &data).unwrap() {
        device.inject(frame).await;
    }

    let message = connection
        .receive_legacy_data(&[DATA_COMMAND], Duration::from_secs(1))
        .await
        .unwrap();
    assert_eq!(
        message,
        RawData {
            command_type: DATA_COMMAND,
            data
        }
    );

    let acked: Vec<Vec<u8>> = device
        .written_legacy(PacketVersion::V2, ACK_COMMAND)
        .into_iter()
        .map(|f| f.data)
        .collect();
    assert_eq!(acked, vec![vec![0, 1], vec![0, 2], vec![0, 3]]);
}

#[tokio::test(start_paused = true)]
async fn test_corrupted_frame_is_nacked() {
    let (connection, device) = connect_v2(acking_legacy_device(PacketVersion::V2)).await;

    let mut frame = LegacyCodec::new(PacketVersion::V2)
        .encode(DATA_COMMAND, &[1, 2, 3])
        .unwrap()
        .remove(0);
    frame[12] ^= 0x40;
    device.inject(frame).await;
    settle().await;

    assert_eq!(device.written_legacy(PacketVersion::V2, NACK_COMMAND).len(), 1);
    assert!(device.written_legacy(PacketVersion::V2, ACK_COMMAND).is_empty());
    assert_eq!(connection.counters().malformed_frames, 1);
}

#[tokio::test(start_paused = true)]
async fn test_receive_times_out() {
    let (connection, _device) = connect_v2(acking_legacy_device(PacketVersion::V2)).await;

    let err = connection
        .receive_legacy_data(&[DATA_COMMAND], Duration::from_millis(500))
        .await
        .unwrap_err();
    assert!(matches!(err, ProtocolError::ReadTimeout));
}

#[tokio::test(start_paused = true)]
async fn test_legacy_operations_need_legacy_version() {
    let (connection, _device) = connect_v3(|_| vec![]).await;

    let err = connection
        .send_legacy_data(DATA_COMMAND, &[1])
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        ProtocolError::UnsupportedVersion(PacketVersion::V3)
    ));
}
