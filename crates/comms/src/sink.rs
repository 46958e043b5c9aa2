// Copyright 2025-2026 Aurora Radar Group

//! Outbound ack and timing channels.
//!
//! The orchestrator talks to a `SequenceSink`; the ZMQ implementation is
//! used in production, the crossbeam one for in-process wiring and tests.
//! Send failures are logged and dropped: a lost report must never stall or
//! kill a sequence.

use std::sync::Mutex;

use crossbeam::channel::Sender;

use crate::wire::{self, AckMsg, TimingMsg};

/// Where acks and timing reports go. Called from sequence worker threads.
pub trait SequenceSink: Send + Sync {
    /// The raw samples for `sequence_num` have left the ring buffer.
    fn send_ack(&self, sequence_num: u32);

    /// Decimation finished (or failed); report kernel latency and status.
    fn send_timing(&self, timing: &TimingMsg);
}

/// ZMQ PUSH sockets for the ack and timing endpoints.
///
/// Sockets are not thread-safe; sequences finish on their own worker
/// threads, so sends are serialised behind a mutex.
pub struct ZmqSink {
    ack: Mutex<zmq::Socket>,
    timing: Mutex<zmq::Socket>,
    _ctx: zmq::Context,
}

impl ZmqSink {
    pub fn new(ack_endpoint: &str, timing_endpoint: &str) -> Result<Self, String> {
        let ctx = zmq::Context::new();

        let ack = ctx
            .socket(zmq::PUSH)
            .map_err(|e| format!("zmq PUSH socket: {}", e))?;
        ack.set_sndhwm(1000)
            .map_err(|e| format!("zmq set_sndhwm: {}", e))?;
        ack.connect(ack_endpoint)
            .map_err(|e| format!("zmq connect to {}: {}", ack_endpoint, e))?;

        let timing = ctx
            .socket(zmq::PUSH)
            .map_err(|e| format!("zmq PUSH socket: {}", e))?;
        timing
            .set_sndhwm(1000)
            .map_err(|e| format!("zmq set_sndhwm: {}", e))?;
        timing
            .connect(timing_endpoint)
            .map_err(|e| format!("zmq connect to {}: {}", timing_endpoint, e))?;

        log::info!(
            "ack channel: {}, timing channel: {}",
            ack_endpoint,
            timing_endpoint
        );

        Ok(Self {
            ack: Mutex::new(ack),
            timing: Mutex::new(timing),
            _ctx: ctx,
        })
    }
}

impl SequenceSink for ZmqSink {
    fn send_ack(&self, sequence_num: u32) {
        let buf = wire::frame(&AckMsg { sequence_num }.encode());
        let socket = match self.ack.lock() {
            Ok(s) => s,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Err(e) = socket.send(&buf[..], zmq::DONTWAIT) {
            log::warn!("dropped ack for sequence {}: {}", sequence_num, e);
        }
    }

    fn send_timing(&self, timing: &TimingMsg) {
        let buf = wire::frame(&timing.encode());
        let socket = match self.timing.lock() {
            Ok(s) => s,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Err(e) = socket.send(&buf[..], zmq::DONTWAIT) {
            log::warn!(
                "dropped timing report for sequence {}: {}",
                timing.sequence_num,
                e
            );
        }
    }
}

/// Crossbeam-channel sink for in-process consumers.
#[derive(Clone)]
pub struct ChannelSink {
    ack_tx: Sender<AckMsg>,
    timing_tx: Sender<TimingMsg>,
}

impl ChannelSink {
    pub fn new(ack_tx: Sender<AckMsg>, timing_tx: Sender<TimingMsg>) -> Self {
        Self { ack_tx, timing_tx }
    }
}

impl SequenceSink for ChannelSink {
    fn send_ack(&self, sequence_num: u32) {
        if self.ack_tx.send(AckMsg { sequence_num }).is_err() {
            log::warn!("dropped ack for sequence {}: receiver gone", sequence_num);
        }
    }

    fn send_timing(&self, timing: &TimingMsg) {
        if self.timing_tx.send(*timing).is_err() {
            log::warn!(
                "dropped timing report for sequence {}: receiver gone",
                timing.sequence_num
            );
        }
    }
}
