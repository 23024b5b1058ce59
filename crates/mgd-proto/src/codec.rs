//! ---
//! mgd_section: "02-wire-protocol"
//! mgd_subsection: "module"
//! mgd_type: "source"
//! mgd_scope: "code"
//! mgd_description: "Binary frame layouts and codec for the endpoint link."
//! mgd_version: "v0.1.0"
//! mgd_owner: "tbd"
//! ---
use thiserror::Error;

use crate::frames::{DispatchCommand, DispatchFrame, NodeKind, TelemetryFrame, TelemetryNode};

/// "GRID", little-endian, prefixes telemetry frames.
pub const TELEMETRY_MAGIC: u32 = 0x4752_4944;
/// "DISP", little-endian, prefixes dispatch frames.
pub const DISPATCH_MAGIC: u32 = 0x4449_5350;

/// Upper bound on node records per frame.
pub const MAX_NODES: usize = 16;

/// magic (4) + timestamp (4) + count (1)
pub const TELEMETRY_HEADER_LEN: usize = 9;
/// magic (4) + count (1)
pub const DISPATCH_HEADER_LEN: usize = 5;

const TELEMETRY_NODE_LEN: usize = 10;
const DISPATCH_NODE_LEN: usize = 6;

pub type Result<T> = std::result::Result<T, CodecError>;

#[derive(Debug, Error, PartialEq)]
pub enum CodecError {
    #[error("bad magic 0x{found:08x}")]
    BadMagic { found: u32 },
    #[error("truncated frame: need {needed} bytes, have {available}")]
    TruncatedFrame { needed: usize, available: usize },
    #[error("frame declares {count} nodes, protocol maximum is {MAX_NODES}")]
    TooManyNodes { count: usize },
    #[error("node {node_id} supply {supply} outside [0, 1]")]
    OutOfRangeSupply { node_id: u8, supply: f32 },
    #[error("node {node_id} carries unknown type byte {raw}")]
    BadNodeKind { node_id: u8, raw: u8 },
    #[error("encode buffer too small: need {needed} bytes, have {available}")]
    BufferTooSmall { needed: usize, available: usize },
}

/// Encoded size of a telemetry frame carrying `node_count` records.
pub fn telemetry_frame_len(node_count: usize) -> usize {
    TELEMETRY_HEADER_LEN + node_count * TELEMETRY_NODE_LEN
}

/// Encoded size of a dispatch frame carrying `node_count` records.
pub fn dispatch_frame_len(node_count: usize) -> usize {
    DISPATCH_HEADER_LEN + node_count * DISPATCH_NODE_LEN
}

/// Encode a telemetry frame into `buf`, returning the exact byte count
/// written. Never allocates.
pub fn encode_telemetry(frame: &TelemetryFrame, buf: &mut [u8]) -> Result<usize> {
    let count = frame.nodes.len();
    if count > MAX_NODES {
        return Err(CodecError::TooManyNodes { count });
    }
    let needed = telemetry_frame_len(count);
    if buf.len() < needed {
        return Err(CodecError::BufferTooSmall {
            needed,
            available: buf.len(),
        });
    }

    buf[0..4].copy_from_slice(&TELEMETRY_MAGIC.to_le_bytes());
    buf[4..8].copy_from_slice(&frame.timestamp_ms.to_le_bytes());
    buf[8] = count as u8;

    let mut offset = TELEMETRY_HEADER_LEN;
    for node in &frame.nodes {
        buf[offset] = node.id;
        buf[offset + 1] = node.kind.to_wire();
        buf[offset + 2..offset + 6].copy_from_slice(&node.demand.to_le_bytes());
        buf[offset + 6..offset + 10].copy_from_slice(&node.fulfillment.to_le_bytes());
        offset += TELEMETRY_NODE_LEN;
    }
    Ok(offset)
}

/// Decode a telemetry frame from the front of `buf`, returning the frame and
/// the number of bytes consumed.
pub fn decode_telemetry(buf: &[u8]) -> Result<(TelemetryFrame, usize)> {
    if buf.len() < TELEMETRY_HEADER_LEN {
        return Err(CodecError::TruncatedFrame {
            needed: TELEMETRY_HEADER_LEN,
            available: buf.len(),
        });
    }
    let magic = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]);
    if magic != TELEMETRY_MAGIC {
        return Err(CodecError::BadMagic { found: magic });
    }
    let timestamp_ms = u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]);
    let count = buf[8] as usize;
    if count > MAX_NODES {
        return Err(CodecError::TooManyNodes { count });
    }
    let needed = telemetry_frame_len(count);
    if buf.len() < needed {
        return Err(CodecError::TruncatedFrame {
            needed,
            available: buf.len(),
        });
    }

    let mut nodes = Vec::with_capacity(count);
    let mut offset = TELEMETRY_HEADER_LEN;
    for _ in 0..count {
        let id = buf[offset];
        let raw_kind = buf[offset + 1];
        let kind = NodeKind::from_wire(raw_kind)
            .ok_or(CodecError::BadNodeKind {
                node_id: id,
                raw: raw_kind,
            })?;
        let demand = f32::from_le_bytes([
            buf[offset + 2],
            buf[offset + 3],
            buf[offset + 4],
            buf[offset + 5],
        ]);
        let fulfillment = f32::from_le_bytes([
            buf[offset + 6],
            buf[offset + 7],
            buf[offset + 8],
            buf[offset + 9],
        ]);
        nodes.push(TelemetryNode {
            id,
            kind,
            demand,
            fulfillment,
        });
        offset += TELEMETRY_NODE_LEN;
    }

    Ok((
        TelemetryFrame {
            timestamp_ms,
            nodes,
        },
        offset,
    ))
}

/// Encode a dispatch frame into `buf`, returning the exact byte count
/// written. Never allocates.
pub fn encode_dispatch(frame: &DispatchFrame, buf: &mut [u8]) -> Result<usize> {
    let count = frame.commands.len();
    if count > MAX_NODES {
        return Err(CodecError::TooManyNodes { count });
    }
    for command in &frame.commands {
        if !(0.0..=1.0).contains(&command.supply) {
            return Err(CodecError::OutOfRangeSupply {
                node_id: command.node_id,
                supply: command.supply,
            });
        }
    }
    let needed = dispatch_frame_len(count);
    if buf.len() < needed {
        return Err(CodecError::BufferTooSmall {
            needed,
            available: buf.len(),
        });
    }

    buf[0..4].copy_from_slice(&DISPATCH_MAGIC.to_le_bytes());
    buf[4] = count as u8;

    let mut offset = DISPATCH_HEADER_LEN;
    for command in &frame.commands {
        buf[offset] = command.node_id;
        buf[offset + 1..offset + 5].copy_from_slice(&command.supply.to_le_bytes());
        buf[offset + 5] = command.source_id;
        offset += DISPATCH_NODE_LEN;
    }
    Ok(offset)
}

/// Decode a dispatch frame from the front of `buf`, returning the frame and
/// the number of bytes consumed.
pub fn decode_dispatch(buf: &[u8]) -> Result<(DispatchFrame, usize)> {
    if buf.len() < DISPATCH_HEADER_LEN {
        return Err(CodecError::TruncatedFrame {
            needed: DISPATCH_HEADER_LEN,
            available: buf.len(),
        });
    }
    let magic = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]);
    if magic != DISPATCH_MAGIC {
        return Err(CodecError::BadMagic { found: magic });
    }
    let count = buf[4] as usize;
    if count > MAX_NODES {
        return Err(CodecError::TooManyNodes { count });
    }
    let needed = dispatch_frame_len(count);
    if buf.len() < needed {
        return Err(CodecError::TruncatedFrame {
            needed,
            available: buf.len(),
        });
    }

    let mut commands = Vec::with_capacity(count);
    let mut offset = DISPATCH_HEADER_LEN;
    for _ in 0..count {
        let node_id = buf[offset];
        let supply = f32::from_le_bytes([
            buf[offset + 1],
            buf[offset + 2],
            buf[offset + 3],
            buf[offset + 4],
        ]);
        let source_id = buf[offset + 5];
        if !(0.0..=1.0).contains(&supply) {
            return Err(CodecError::OutOfRangeSupply { node_id, supply });
        }
        commands.push(DispatchCommand {
            node_id,
            supply,
            source_id,
        });
        offset += DISPATCH_NODE_LEN;
    }

    Ok((DispatchFrame { commands }, offset))
}

/// Find the byte offset of the next occurrence of `magic` in `buf`, used by
/// the link reader to resynchronize after corrupt input.
pub fn scan_for_magic(buf: &[u8], magic: u32) -> Option<usize> {
    let needle = magic.to_le_bytes();
    buf.windows(4).position(|window| window == needle)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_telemetry() -> TelemetryFrame {
        TelemetryFrame {
            timestamp_ms: 1_234_567_890,
            nodes: vec![
                TelemetryNode {
                    id: 1,
                    kind: NodeKind::Power,
                    demand: 0.0,
                    fulfillment: 9.55,
                },
                TelemetryNode {
                    id: 2,
                    kind: NodeKind::Consumer,
                    demand: 2.5,
                    fulfillment: 2.2,
                },
                TelemetryNode {
                    id: 3,
                    kind: NodeKind::Consumer,
                    demand: 1.8,
                    fulfillment: 1.8,
                },
            ],
        }
    }

    #[test]
    fn telemetry_round_trip() {
        let frame = sample_telemetry();
        let mut buf = [0u8; 256];
        let written = encode_telemetry(&frame, &mut buf).unwrap();
        assert_eq!(written, telemetry_frame_len(3));
        let (decoded, consumed) = decode_telemetry(&buf[..written]).unwrap();
        assert_eq!(consumed, written);
        assert_eq!(decoded, frame);
    }

    #[test]
    fn dispatch_round_trip() {
        let frame = DispatchFrame {
            commands: vec![
                DispatchCommand {
                    node_id: 2,
                    supply: 0.65,
                    source_id: 1,
                },
                DispatchCommand {
                    node_id: 3,
                    supply: 0.42,
                    source_id: 1,
                },
            ],
        };
        let mut buf = [0u8; 64];
        let written = encode_dispatch(&frame, &mut buf).unwrap();
        assert_eq!(written, dispatch_frame_len(2));
        let (decoded, consumed) = decode_dispatch(&buf[..written]).unwrap();
        assert_eq!(consumed, written);
        assert_eq!(decoded, frame);
    }

    #[test]
    fn telemetry_layout_is_bit_exact() {
        let frame = TelemetryFrame {
            timestamp_ms: 0x0102_0304,
            nodes: vec![TelemetryNode {
                id: 7,
                kind: NodeKind::Consumer,
                demand: 1.0,
                fulfillment: 0.5,
            }],
        };
        let mut buf = [0u8; 32];
        let written = encode_telemetry(&frame, &mut buf).unwrap();
        assert_eq!(written, 19);
        assert_eq!(&buf[0..4], b"DIRG"); // "GRID" magic, little-endian
        assert_eq!(&buf[4..8], &[0x04, 0x03, 0x02, 0x01]);
        assert_eq!(buf[8], 1);
        assert_eq!(buf[9], 7);
        assert_eq!(buf[10], 1);
        assert_eq!(&buf[11..15], &1.0f32.to_le_bytes());
        assert_eq!(&buf[15..19], &0.5f32.to_le_bytes());
    }

    #[test]
    fn bad_magic_is_rejected() {
        let mut buf = [0u8; 32];
        let written = encode_telemetry(&sample_telemetry(), &mut buf[..]).unwrap();
        buf[0] ^= 0xFF;
        let err = decode_telemetry(&buf[..written]).unwrap_err();
        assert!(matches!(err, CodecError::BadMagic { .. }));
    }

    #[test]
    fn truncated_frame_is_rejected() {
        let mut buf = [0u8; 64];
        let written = encode_telemetry(&sample_telemetry(), &mut buf).unwrap();
        let err = decode_telemetry(&buf[..written - 4]).unwrap_err();
        assert!(matches!(err, CodecError::TruncatedFrame { .. }));
    }

    #[test]
    fn excess_node_count_is_rejected() {
        let mut buf = [0u8; 16];
        buf[0..4].copy_from_slice(&TELEMETRY_MAGIC.to_le_bytes());
        buf[8] = 17;
        let err = decode_telemetry(&buf).unwrap_err();
        assert_eq!(err, CodecError::TooManyNodes { count: 17 });

        let frame = TelemetryFrame {
            timestamp_ms: 0,
            nodes: vec![
                TelemetryNode {
                    id: 0,
                    kind: NodeKind::Power,
                    demand: 0.0,
                    fulfillment: 0.0,
                };
                17
            ],
        };
        let mut out = [0u8; 512];
        assert!(matches!(
            encode_telemetry(&frame, &mut out).unwrap_err(),
            CodecError::TooManyNodes { .. }
        ));
    }

    #[test]
    fn out_of_range_supply_is_rejected_both_ways() {
        let frame = DispatchFrame {
            commands: vec![DispatchCommand {
                node_id: 4,
                supply: 1.5,
                source_id: 1,
            }],
        };
        let mut buf = [0u8; 32];
        assert!(matches!(
            encode_dispatch(&frame, &mut buf).unwrap_err(),
            CodecError::OutOfRangeSupply { node_id: 4, .. }
        ));

        // Hand-craft the same invalid frame to exercise the decode side.
        buf[0..4].copy_from_slice(&DISPATCH_MAGIC.to_le_bytes());
        buf[4] = 1;
        buf[5] = 4;
        buf[6..10].copy_from_slice(&1.5f32.to_le_bytes());
        buf[10] = 1;
        assert!(matches!(
            decode_dispatch(&buf[..11]).unwrap_err(),
            CodecError::OutOfRangeSupply { node_id: 4, .. }
        ));
    }

    #[test]
    fn encoder_reports_exact_buffer_requirement() {
        let frame = sample_telemetry();
        let needed = telemetry_frame_len(frame.nodes.len());
        let mut small = vec![0u8; needed - 1];
        match encode_telemetry(&frame, &mut small).unwrap_err() {
            CodecError::BufferTooSmall {
                needed: reported, ..
            } => assert_eq!(reported, needed),
            other => panic!("unexpected error {other:?}"),
        }
        let mut exact = vec![0u8; needed];
        assert_eq!(encode_telemetry(&frame, &mut exact).unwrap(), needed);
    }

    #[test]
    fn scanner_finds_magic_past_junk() {
        let mut stream = vec![0xAA, 0xBB, 0xCC, 0xDD, 0x01, 0x02, 0x03];
        let mut buf = [0u8; 64];
        let written = encode_telemetry(&sample_telemetry(), &mut buf).unwrap();
        stream.extend_from_slice(&buf[..written]);
        assert_eq!(scan_for_magic(&stream, TELEMETRY_MAGIC), Some(7));
        assert_eq!(scan_for_magic(&stream[..6], TELEMETRY_MAGIC), None);
    }

    #[test]
    fn round_trip_law_over_generated_frames() {
        // Deterministic pseudo-random generator so the law is exercised over
        // a spread of node counts and values without an external crate here.
        let mut state = 0x243F_6A88_85A3_08D3u64;
        let mut next = move || {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            state
        };
        for _ in 0..200 {
            let count = (next() % (MAX_NODES as u64 + 1)) as usize;
            let nodes = (0..count)
                .map(|i| TelemetryNode {
                    id: (next() % 255 + 1) as u8,
                    kind: if next() % 2 == 0 {
                        NodeKind::Power
                    } else {
                        NodeKind::Consumer
                    },
                    demand: if i % 2 == 0 {
                        (next() % 10_000) as f32 / 100.0
                    } else {
                        0.0
                    },
                    fulfillment: (next() % 10_000) as f32 / 100.0,
                })
                .collect();
            let frame = TelemetryFrame {
                timestamp_ms: next() as u32,
                nodes,
            };
            let mut buf = [0u8; 256];
            let written = encode_telemetry(&frame, &mut buf).unwrap();
            let (decoded, _) = decode_telemetry(&buf[..written]).unwrap();
            assert_eq!(decoded, frame);

            let commands = (0..count)
                .map(|_| DispatchCommand {
                    node_id: (next() % 255 + 1) as u8,
                    supply: (next() % 1_000) as f32 / 1_000.0,
                    source_id: (next() % 8) as u8,
                })
                .collect();
            let dispatch = DispatchFrame { commands };
            let written = encode_dispatch(&dispatch, &mut buf).unwrap();
            let (decoded, _) = decode_dispatch(&buf[..written]).unwrap();
            assert_eq!(decoded, dispatch);
        }
    }
}
