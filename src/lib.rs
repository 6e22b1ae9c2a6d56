//! Buffering and timing core of a reliable, UDP based transport with timestamp based packet
//!  delivery (TSBPD).
//!
//! * [send_buffer::SendBuffer] keeps application data split into packet-sized blocks until the
//!   peer acknowledges it, and hands blocks out for (re)transmission
//! * [receive_buffer::ReceiveBuffer] reorders incoming packets, reassembles messages, and holds
//!   packets back until their playout time
//! * [tsbpd::TsbpdTime] and [drift::DriftTracker] map the peer's 32 bit timestamps to local
//!   playout times, compensating for clock drift and timestamp wrap-around
//! * [clock::MonotonicClock] is the time base for all of this
//!
//! Sockets, handshakes, congestion control and the wire format live outside this crate: the
//!  connection layer feeds packets and ACKs into the buffers and reads data and sizes back out.

pub mod buffers;
pub mod clock;
pub mod config;
pub mod drift;
pub mod error;
pub mod receive_buffer;
pub mod safe_converter;
pub mod send_buffer;
pub mod seq_no;
mod size_average;
pub mod tsbpd;
