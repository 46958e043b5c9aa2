// Copyright 2025-2026 Aurora Radar Group

//! Messaging between the DSP core and the rest of the radar: the tagged
//! binary wire format and the outbound ack/timing channels.

pub mod sink;
pub mod wire;

pub use sink::{ChannelSink, SequenceSink, ZmqSink};
pub use wire::{AckMsg, DecodeError, SequenceRequest, SequenceStatus, TimingMsg};
