//! Error path tests for the frame transport
//!
//! Tests verify the transport rejects malformed frames and reports stream
//! failures with enough context to diagnose them.

#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]
#![allow(clippy::panic)]
#![allow(clippy::indexing_slicing)]
#![allow(clippy::arithmetic_side_effects)]

use std::collections::BTreeMap;
use std::io::{Read, Write};

use bpfsync_daemon::{
    DaemonRequest, DaemonResponse, FrameTransport, IoOp, LoadRequest, Location,
    MAX_PAYLOAD_SIZE, TransportError,
};

/// Reader that yields a fixed byte sequence, then reports EOF.
struct Scripted {
    bytes: Vec<u8>,
    position: usize,
}

impl Scripted {
    fn new(bytes: Vec<u8>) -> Self {
        Self { bytes, position: 0 }
    }
}

impl Read for Scripted {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let remaining = &self.bytes[self.position..];
        let n = remaining.len().min(buf.len());
        buf[..n].copy_from_slice(&remaining[..n]);
        self.position += n;
        Ok(n)
    }
}

fn frame(length: u32, payload: &[u8]) -> Vec<u8> {
    let mut bytes = length.to_be_bytes().to_vec();
    bytes.extend_from_slice(payload);
    bytes
}

#[test]
fn test_oversized_load_request_is_refused() {
    let mut transport = FrameTransport::new(std::io::empty(), std::io::sink());
    let mut metadata = BTreeMap::new();
    metadata.insert("blob".to_string(), "x".repeat(MAX_PAYLOAD_SIZE + 1));

    let result = transport.send(&DaemonRequest::Load(LoadRequest {
        location: Location::File("/bin/true".to_string()),
        name: "trace1".to_string(),
        program_type: 2,
        metadata,
        global_data: BTreeMap::new(),
        map_owner_id: None,
    }));

    match result {
        Err(TransportError::Oversized { size, limit }) => {
            assert!(size > MAX_PAYLOAD_SIZE);
            assert_eq!(limit, MAX_PAYLOAD_SIZE);
        }
        other => panic!("expected Oversized, got {other:?}"),
    }
}

#[test]
fn test_length_above_cap_is_refused() {
    let mut transport = FrameTransport::new(Scripted::new(frame(u32::MAX, &[])), std::io::sink());

    let result = transport.recv::<DaemonResponse>();

    assert!(matches!(
        result,
        Err(TransportError::BadLength {
            length: u32::MAX,
            ..
        })
    ));
}

#[test]
fn test_empty_frame_is_refused() {
    let mut transport = FrameTransport::new(Scripted::new(frame(0, &[])), std::io::sink());

    match transport.recv::<DaemonResponse>() {
        Err(TransportError::BadLength { length, reason }) => {
            assert_eq!(length, 0);
            assert!(reason.contains("empty"));
        }
        other => panic!("expected BadLength, got {other:?}"),
    }
}

#[test]
fn test_close_before_prefix_is_hangup() {
    let mut transport = FrameTransport::new(Scripted::new(Vec::new()), std::io::sink());

    match transport.recv::<DaemonResponse>() {
        Err(err @ TransportError::Truncated { read, expected }) => {
            assert_eq!(read, 0);
            assert_eq!(expected, 4);
            assert!(err.is_hangup());
        }
        other => panic!("expected Truncated, got {other:?}"),
    }
}

#[test]
fn test_close_mid_payload_is_truncation() {
    let mut transport =
        FrameTransport::new(Scripted::new(frame(1000, &[0u8; 500])), std::io::sink());

    match transport.recv::<DaemonResponse>() {
        Err(err @ TransportError::Truncated { read, expected }) => {
            assert_eq!((read, expected), (4, 1004));
            assert!(!err.is_hangup());
        }
        other => panic!("expected Truncated, got {other:?}"),
    }
}

#[test]
fn test_garbage_payload_fails_decode() {
    let mut transport =
        FrameTransport::new(Scripted::new(frame(100, &[0xff; 100])), std::io::sink());

    match transport.recv::<DaemonResponse>() {
        Err(TransportError::Decode {
            cause,
            payload_bytes,
        }) => {
            assert!(!cause.is_empty());
            assert_eq!(payload_bytes, 100);
        }
        other => panic!("expected Decode, got {other:?}"),
    }
}

#[test]
fn test_broken_pipe_surfaces_as_write_io() {
    struct FailingWriter;

    impl Write for FailingWriter {
        fn write(&mut self, _buf: &[u8]) -> std::io::Result<usize> {
            Err(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "broken pipe",
            ))
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Err(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "broken pipe",
            ))
        }
    }

    let mut transport = FrameTransport::new(std::io::empty(), FailingWriter);

    let result = transport.send(&DaemonResponse::Unloaded);

    assert!(matches!(
        result,
        Err(TransportError::Io {
            op: IoOp::Write,
            kind: std::io::ErrorKind::BrokenPipe,
            ..
        })
    ));
}

#[test]
fn test_length_prefix_is_big_endian() {
    let mut written = Vec::new();
    {
        let mut transport = FrameTransport::new(std::io::empty(), &mut written);
        transport.send(&DaemonResponse::Unloaded).unwrap();
    }

    let length = u32::from_be_bytes([written[0], written[1], written[2], written[3]]);
    assert_eq!(length as usize, written.len() - 4);

    let mut reader = FrameTransport::new(Scripted::new(written), std::io::sink());
    assert_eq!(
        reader.recv::<DaemonResponse>().unwrap(),
        DaemonResponse::Unloaded
    );
}
