// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

#![cfg(test)]
//! CONTEXT: Property-based tests for the pipe ring buffer
//! OWNERS: @kernel-ipc-team
//! NOTE: Tests only; no kernel logic.
//!
//! TEST_SCOPE:
//!   - Byte order is preserved across arbitrary push/pop interleavings
//!   - Occupancy never exceeds capacity
//!
//! TEST_SCENARIOS:
//!   - fifo_matches_model(): ring agrees with a VecDeque model step by step
//!   - fill_then_drain(): a full ring hands back exactly what went in

use std::collections::VecDeque;

use super::PipeBuffer;
use proptest::prelude::*;

#[derive(Debug, Clone)]
enum Op {
    Push(Vec<u8>),
    Pop(usize),
}

fn arb_op() -> impl Strategy<Value = Op> {
    prop_oneof![
        proptest::collection::vec(any::<u8>(), 0..24).prop_map(Op::Push),
        (0usize..24).prop_map(Op::Pop),
    ]
}

proptest! {
    #[test]
    fn fifo_matches_model(capacity in 1usize..32, ops in proptest::collection::vec(arb_op(), 0..64)) {
        let mut ring = PipeBuffer::new(capacity);
        let mut model: VecDeque<u8> = VecDeque::new();
        for op in ops {
            match op {
                Op::Push(bytes) => {
                    let taken = ring.push(&bytes);
                    prop_assert_eq!(taken, bytes.len().min(capacity - model.len()));
                    model.extend(&bytes[..taken]);
                }
                Op::Pop(want) => {
                    let mut out = vec![0u8; want];
                    let got = ring.pop(&mut out);
                    let expected: Vec<u8> = model.drain(..want.min(model.len())).collect();
                    prop_assert_eq!(&out[..got], &expected[..]);
                }
            }
            prop_assert!(ring.len() <= ring.capacity());
            prop_assert_eq!(ring.len(), model.len());
            prop_assert_eq!(ring.free(), capacity - model.len());
        }
    }

    #[test]
    fn fill_then_drain(data in proptest::collection::vec(any::<u8>(), 1..64)) {
        let mut ring = PipeBuffer::new(data.len());
        prop_assert_eq!(ring.push(&data), data.len());
        prop_assert!(ring.is_full());
        let mut out = vec![0u8; data.len()];
        prop_assert_eq!(ring.pop(&mut out), data.len());
        prop_assert_eq!(out, data);
        prop_assert!(ring.is_empty());
    }
}
