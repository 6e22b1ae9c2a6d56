use std::cmp::min;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{debug, trace};
use crate::clock::TimeSource;
use crate::config::{BufferConfig, TsbpdConfig};
use crate::error::BufferError;
use crate::safe_converter::{PrecheckedCast, SafeCast};
use crate::seq_no::{MsgNo, SeqNo};
use crate::size_average::SizeAverage;
use crate::tsbpd::TsbpdTime;

const DEFAULT_WRAP_CHECK_WINDOW: Duration = Duration::from_secs(30);
const INITIAL_AVG_PAYLOAD_SIZE: usize = 1316;
/// number of dropped messages whose late fragments are still recognized
const DROPPED_MESSAGE_MEMORY: usize = 32;

/// A data packet as it is handed over by the connection layer
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ReceivedPacket {
    pub seq_no: SeqNo,
    pub msg_no: MsgNo,
    /// the sender's 32 bit microsecond timestamp
    pub timestamp: u32,
    pub payload: Vec<u8>,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
enum SlotState {
    Good,
    /// read out of order before it was acknowledged
    PassAck,
    /// marked by drop_message
    Dropped,
}

struct Slot {
    packet: ReceivedPacket,
    state: SlotState,
    /// included in the 'buffered' statistics since it was acknowledged
    counted: bool,
}

/// How a delivered message was put together
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Reassembly {
    /// all packets up to the one flagged 'last'
    Complete,
    /// The ACK cursor moved past the message before all of its packets arrived. The packets
    ///  that were there (a prefix of the message) are delivered anyway.
    AckedTruncated,
    /// a complete message without in-order flag, delivered before it was acknowledged
    OutOfOrder,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct MessageRead {
    /// number of bytes copied to the output buffer
    pub len: usize,
    /// length of the message as it was reassembled - more than `len` if the output buffer was
    ///  too small, in which case the rest is discarded
    pub msg_len: usize,
    pub seq_no: SeqNo,
    pub msg_no: MsgNo,
    pub num_packets: usize,
    pub reassembly: Reassembly,
    pub playout_time: Option<u64>,
}

#[derive(Debug, Default, Copy, Clone, Eq, PartialEq)]
pub struct ReadyState {
    /// `read` or `read_message` will return data now
    pub ready: bool,
    /// playout time of the first packet (TSBPD only), whether it is due yet or not
    pub playout_time: Option<u64>,
    /// The first packet is beyond the ACK cursor. Without TSBPD this is a complete out-of-order
    ///  message that is ready; in TSBPD mode, the packet is not ready before it is acknowledged
    ///  or skipped to.
    pub passack: bool,
    /// Sequence number of the first packet that is due if it is preceded by missing packets.
    ///  The consumer can skip to it instead of waiting for a retransmission that would be too
    ///  late anyway.
    pub skip_sequence: Option<SeqNo>,
}

#[derive(Debug, Default, Copy, Clone, Eq, PartialEq)]
pub struct ReceiveStats {
    pub acked_packets: u64,
    pub acked_bytes: u64,
    pub dropped_packets: u64,
    /// acknowledged and not read yet
    pub buffered_packets: usize,
    pub buffered_bytes: usize,
    pub avg_payload_size: usize,
    /// TSBPD only: time between the first and the last acknowledged packet
    pub timespan_ms: u64,
}

/// Moving average of the acknowledged, unread part of the buffer
#[derive(Debug, Default, Copy, Clone, Eq, PartialEq)]
pub struct ReceiveBufferSize {
    pub packets: usize,
    pub bytes: usize,
    pub timespan_ms: u64,
}

#[derive(Debug)]
struct Counters {
    acked_packets: u64,
    acked_bytes: u64,
    dropped_packets: u64,
    buffered_packets: usize,
    buffered_bytes: usize,
    avg_payload_size: usize,
    size_average: SizeAverage,
}
impl Counters {
    fn on_acked(&mut self, bytes: usize) {
        self.acked_packets += 1;
        self.acked_bytes += SafeCast::<u64>::safe_cast(bytes);
        self.buffered_packets += 1;
        self.buffered_bytes += bytes;
        self.avg_payload_size = (self.avg_payload_size * 99 + bytes) / 100;
    }
}

struct FoundMessage {
    first: usize,
    num_slots: usize,
    reassembly: Reassembly,
}

/// The ring of packet slots with its cursors.
///
/// ```ascii
///        start_pos      last_ack_pos            last_ack_pos + max_pos
///            |               |                          |
///  ... empty | acknowledged  | received, not yet acked  | empty ...
/// ```
///
/// `start_pos == last_ack_pos` means there is no acknowledged data. One slot always stays empty,
///  so the buffer is full when `start_pos == last_ack_pos + 1`.
struct RingState {
    slots: Vec<Option<Slot>>,
    start_pos: usize,
    last_ack_pos: usize,
    /// offset (relative to `last_ack_pos`) one past the furthest slot that was written
    max_pos: usize,
    /// bytes of the slot at `start_pos` that were already read
    notch: usize,
    /// sequence number of the packet at `last_ack_pos`
    ack_seq: SeqNo,
    tsbpd: Option<TsbpdTime>,
    /// (message sequence number, using rexmit flag) of recently dropped messages
    dropped_messages: VecDeque<(u32, bool)>,
    closed: bool,
}

impl RingState {
    fn capacity(&self) -> usize {
        self.slots.len()
    }

    fn pos(&self, base: usize, offset: usize) -> usize {
        (base + offset) % self.capacity()
    }

    fn acked_len(&self) -> usize {
        (self.last_ack_pos + self.capacity() - self.start_pos) % self.capacity()
    }

    fn available_space(&self) -> usize {
        self.capacity() - self.acked_len() - 1
    }

    fn has_acked_data(&self) -> bool {
        self.start_pos != self.last_ack_pos
    }

    fn free_head(&mut self, counters: &mut Counters) -> Option<Slot> {
        let slot = self.slots[self.start_pos].take();
        if let Some(slot) = &slot {
            if slot.counted {
                counters.buffered_packets -= 1;
                counters.buffered_bytes -= slot.packet.payload.len().saturating_sub(self.notch);
            }
        }
        self.start_pos = self.pos(self.start_pos, 1);
        self.notch = 0;
        slot
    }

    /// Release everything at the head of the acknowledged region that can not be read: empty
    ///  slots of skipped packets, slots that were dropped or read out of order, and (in message
    ///  mode) fragments of a message whose first packet is gone
    fn release_consumed_head(&mut self, counters: &mut Counters, message_mode: bool) {
        while self.has_acked_data() {
            let (release, orphan) = match &self.slots[self.start_pos] {
                None => (true, false),
                Some(slot) if slot.state != SlotState::Good => (true, false),
                Some(slot) => {
                    let orphan = message_mode && self.notch == 0 && !slot.packet.msg_no.boundary().starts_message();
                    (orphan, orphan)
                }
            };
            if !release {
                break;
            }

            if let Some(slot) = self.free_head(counters) {
                if orphan {
                    debug!("dropping orphaned fragment {:?} of {:?}", slot.packet.seq_no, slot.packet.msg_no);
                    counters.dropped_packets += 1;
                }
            }
        }
    }

    fn is_dropped_message(&self, msg_no: MsgNo) -> bool {
        self.dropped_messages.iter()
            .any(|&(msg_seq, using_rexmit_flag)| msg_no.seq(using_rexmit_flag) == msg_seq)
    }

    fn remember_dropped_message(&mut self, msg_seq: u32, using_rexmit_flag: bool) {
        if self.dropped_messages.contains(&(msg_seq, using_rexmit_flag)) {
            return;
        }
        if self.dropped_messages.len() == DROPPED_MESSAGE_MEMORY {
            self.dropped_messages.pop_front();
        }
        self.dropped_messages.push_back((msg_seq, using_rexmit_flag));
    }

    fn is_good(&self, pos: usize) -> bool {
        matches!(&self.slots[pos], Some(slot) if slot.state == SlotState::Good)
    }

    fn packet(&self, pos: usize) -> Option<&ReceivedPacket> {
        self.slots[pos].as_ref().map(|s| &s.packet)
    }

    /// Find the next message that can be read: the message at the head of the acknowledged
    ///  region, or, if allowed, a complete out-of-order message beyond the ACK cursor
    fn find_message(&self, allow_out_of_order: bool) -> Option<FoundMessage> {
        if let Some(found) = self.find_head_message() {
            return Some(found);
        }
        if allow_out_of_order {
            return self.find_out_of_order_message();
        }
        None
    }

    fn find_head_message(&self) -> Option<FoundMessage> {
        if !self.has_acked_data() {
            return None;
        }

        let first = self.start_pos;
        let msg_seq = self.packet(first)?.msg_no.seq(true);
        let mut pos = first;
        let mut num_slots = 0;

        loop {
            if pos == self.last_ack_pos {
                // the rest of the message may still arrive
                return None;
            }

            let continues_message = self.is_good(pos) && match self.packet(pos) {
                Some(p) => num_slots == 0 || (p.msg_no.seq(true) == msg_seq && !p.msg_no.boundary().starts_message()),
                None => false,
            };
            if !continues_message {
                // the ACK cursor passed the message's end, but its last packet is missing
                return Some(FoundMessage { first, num_slots, reassembly: Reassembly::AckedTruncated });
            }

            num_slots += 1;
            if self.packet(pos).map(|p| p.msg_no.boundary().ends_message()).unwrap_or(false) {
                return Some(FoundMessage { first, num_slots, reassembly: Reassembly::Complete });
            }
            pos = self.pos(pos, 1);
        }
    }

    fn find_out_of_order_message(&self) -> Option<FoundMessage> {
        let mut offset = 0;
        'candidates: while offset < self.max_pos {
            let first = self.pos(self.last_ack_pos, offset);
            offset += 1;

            let head = match self.packet(first) {
                Some(p) if self.is_good(first) && p.msg_no.boundary().starts_message() && !p.msg_no.in_order() => p,
                _ => continue,
            };
            let msg_seq = head.msg_no.seq(true);

            let mut num_slots = 1;
            let mut pos = first;
            while !self.packet(pos).map(|p| p.msg_no.boundary().ends_message()).unwrap_or(false) {
                if offset + num_slots > self.max_pos {
                    continue 'candidates;
                }
                pos = self.pos(pos, 1);
                match self.packet(pos) {
                    Some(p) if self.is_good(pos) && p.msg_no.seq(true) == msg_seq && !p.msg_no.boundary().starts_message() => {}
                    _ => continue 'candidates,
                }
                num_slots += 1;
            }
            return Some(FoundMessage { first, num_slots, reassembly: Reassembly::OutOfOrder });
        }
        None
    }

    /// offset (relative to the ACK cursor) and timestamp of the first received packet beyond it
    fn first_unacked_packet(&self) -> Option<(usize, u32)> {
        (0..self.max_pos)
            .find(|&offset| self.is_good(self.pos(self.last_ack_pos, offset)))
            .and_then(|offset| self.packet(self.pos(self.last_ack_pos, offset))
                .map(|p| (offset, p.timestamp)))
    }

    fn head_timestamp(&self) -> Option<u32> {
        if !self.has_acked_data() {
            return None;
        }
        self.packet(self.start_pos).map(|p| p.timestamp)
    }

    /// TSBPD only: time between the first and the last acknowledged packet, 0 if there is none
    fn timespan_ms(&self) -> u64 {
        if self.tsbpd.is_none() {
            return 0;
        }
        let first_ts = match self.head_timestamp() {
            Some(ts) => ts,
            None => return 0,
        };
        let last_ts = (0..self.acked_len())
            .rev()
            .find_map(|offset| self.packet(self.pos(self.start_pos, offset)))
            .map(|p| p.timestamp)
            .unwrap_or(first_ts);
        SafeCast::<u64>::safe_cast(last_ts.wrapping_sub(first_ts)) / 1000 + 1
    }

    /// Sequence number of the first packet beyond the ACK cursor if it is due and preceded by
    ///  missing packets
    fn due_skip_sequence(&self, now: u64) -> Option<SeqNo> {
        let (offset, ts) = self.first_unacked_packet()?;
        let tsbpd = self.tsbpd.as_ref()?;
        if offset > 0 && tsbpd.peek_playout_time(ts) <= now {
            Some(self.ack_seq + PrecheckedCast::<u32>::prechecked_cast(offset))
        }
        else {
            None
        }
    }

    /// Readiness in TSBPD mode. Only the packet at the read cursor moves the timestamp wrap
    ///  state, packets further back are peeked.
    fn tsbpd_ready_state(&mut self, now: u64, message_mode: bool) -> ReadyState {
        match self.head_timestamp() {
            Some(ts) => {
                let playout_time = match self.tsbpd.as_mut() {
                    Some(tsbpd) => tsbpd.playout_time(ts),
                    None => return ReadyState::default(),
                };
                let due = playout_time <= now;

                if message_mode && self.find_head_message().is_none() {
                    // the rest of the head message is beyond the ACK cursor
                    return ReadyState {
                        ready: false,
                        playout_time: Some(playout_time),
                        passack: false,
                        skip_sequence: if due { self.due_skip_sequence(now) } else { None },
                    };
                }

                ReadyState {
                    ready: due,
                    playout_time: Some(playout_time),
                    passack: false,
                    skip_sequence: None,
                }
            }
            None => {
                let (_, ts) = match self.first_unacked_packet() {
                    Some(first) => first,
                    None => return ReadyState::default(),
                };
                let playout_time = match self.tsbpd.as_ref() {
                    Some(tsbpd) => tsbpd.peek_playout_time(ts),
                    None => return ReadyState::default(),
                };

                ReadyState {
                    ready: false,
                    playout_time: Some(playout_time),
                    passack: true,
                    skip_sequence: self.due_skip_sequence(now),
                }
            }
        }
    }
}

/// The receive-side reorder and playout buffer.
///
/// Packets are stored in a fixed ring of slots, addressed by their offset from the ACK cursor.
///  The connection layer inserts packets as they arrive (in any order) and acknowledges them
///  once they are contiguous; the application reads acknowledged data as a byte stream or as
///  messages. In TSBPD mode, a packet is only handed out once its playout time has come.
///
/// Structural state and statistics counters are behind separate locks. When both are needed,
///  the structural lock is taken first.
pub struct ReceiveBuffer {
    config: Arc<BufferConfig>,
    clock: Arc<dyn TimeSource>,
    ring: Mutex<RingState>,
    counters: Mutex<Counters>,
    data_ready: Notify,
}

impl ReceiveBuffer {
    pub fn new(config: Arc<BufferConfig>, clock: Arc<dyn TimeSource>, initial_seq: SeqNo) -> ReceiveBuffer {
        let capacity = config.receive.capacity;
        let tsbpd = config.tsbpd.as_ref()
            .map(|tsbpd| TsbpdTime::new(tsbpd, config.drift.clone(), 0));

        ReceiveBuffer {
            ring: Mutex::new(RingState {
                slots: (0..capacity).map(|_| None).collect(),
                start_pos: 0,
                last_ack_pos: 0,
                max_pos: 0,
                notch: 0,
                ack_seq: initial_seq,
                tsbpd,
                dropped_messages: VecDeque::with_capacity(DROPPED_MESSAGE_MEMORY),
                closed: false,
            }),
            counters: Mutex::new(Counters {
                acked_packets: 0,
                acked_bytes: 0,
                dropped_packets: 0,
                buffered_packets: 0,
                buffered_bytes: 0,
                avg_payload_size: INITIAL_AVG_PAYLOAD_SIZE,
                size_average: SizeAverage::default(),
            }),
            config,
            clock,
            data_ready: Notify::new(),
        }
    }

    fn message_mode(&self) -> bool {
        self.config.receive.message_mode
    }

    /// Switch to timestamp based delivery. `time_base` is the local time that corresponds to
    ///  the peer's timestamp 0, `delay` is added to every packet's playout time.
    pub fn set_tsbpd_mode(&self, time_base: u64, delay: Duration) {
        let wrap_check_window = self.config.tsbpd.as_ref()
            .map(|t| t.wrap_check_window)
            .unwrap_or(DEFAULT_WRAP_CHECK_WINDOW);
        let tsbpd_config = TsbpdConfig { delay, wrap_check_window };

        debug!("TSBPD mode with time base {} and delay {:?}", time_base, delay);
        self.ring.lock().unwrap().tsbpd = Some(TsbpdTime::new(&tsbpd_config, self.config.drift.clone(), time_base));
        self.data_ready.notify_waiters();
    }

    pub fn is_tsbpd_mode(&self) -> bool {
        self.ring.lock().unwrap().tsbpd.is_some()
    }

    /// Feed the timestamp of an ACKACK for drift tracking, returning the correction if one was
    ///  applied
    pub fn add_drift_sample(&self, timestamp: u32) -> Option<i64> {
        let now = self.clock.now_micros();
        let correction = self.ring.lock().unwrap().tsbpd.as_mut()?
            .add_drift_sample(timestamp, now);
        if correction.is_some() {
            self.data_ready.notify_waiters();
        }
        correction
    }

    /// The playout time a packet with this timestamp would have. This is a pure query, it
    ///  does not move the timestamp wrap state.
    pub fn playout_time(&self, timestamp: u32) -> Option<u64> {
        self.ring.lock().unwrap().tsbpd.as_ref()
            .map(|tsbpd| tsbpd.peek_playout_time(timestamp))
    }

    /// Store a packet `offset` slots after the ACK cursor
    pub fn insert(&self, packet: ReceivedPacket, offset: usize) -> Result<(), BufferError> {
        {
            let mut ring = self.ring.lock().unwrap();

            if offset >= ring.available_space() {
                debug!("no room for packet {:?} at offset {}", packet.seq_no, offset);
                return Err(BufferError::BufferFull { capacity: ring.capacity() });
            }

            let pos = ring.pos(ring.last_ack_pos, offset);
            if ring.slots[pos].is_some() {
                debug!("duplicate packet {:?} at offset {}", packet.seq_no, offset);
                return Err(BufferError::DuplicateData { offset: offset.prechecked_cast() });
            }

            let state = if ring.is_dropped_message(packet.msg_no) {
                debug!("packet {:?} belongs to dropped message {:?}", packet.seq_no, packet.msg_no);
                self.counters.lock().unwrap().dropped_packets += 1;
                SlotState::Dropped
            }
            else {
                trace!("storing packet {:?} ({:?}) at offset {}", packet.seq_no, packet.msg_no, offset);
                SlotState::Good
            };
            ring.slots[pos] = Some(Slot {
                packet,
                state,
                counted: false,
            });
            if offset >= ring.max_pos {
                ring.max_pos = offset + 1;
            }
        }

        self.data_ready.notify_waiters();
        Ok(())
    }

    /// Store a packet at the position given by its sequence number
    pub fn insert_packet(&self, packet: ReceivedPacket) -> Result<(), BufferError> {
        let offset = self.ring.lock().unwrap().ack_seq.offset_to(packet.seq_no);
        if offset < 0 {
            debug!("packet {:?} is behind the ACK cursor", packet.seq_no);
            return Err(BufferError::DuplicateData { offset });
        }
        self.insert(packet, offset.prechecked_cast())
    }

    /// Move the ACK cursor forward by `count` slots, making their packets available for reading
    pub fn acknowledge(&self, count: usize) -> Result<(), BufferError> {
        {
            let mut guard = self.ring.lock().unwrap();
            let ring = &mut *guard;

            let limit = ring.available_space();
            if count > limit {
                return Err(BufferError::InvalidOffset { offset: count, limit });
            }

            let mut counters = self.counters.lock().unwrap();
            for _ in 0..count {
                if let Some(slot) = ring.slots[ring.last_ack_pos].as_mut() {
                    match slot.state {
                        SlotState::Good => {
                            slot.counted = true;
                            counters.on_acked(slot.packet.payload.len());
                        }
                        SlotState::PassAck => {
                            counters.acked_packets += 1;
                            counters.acked_bytes += SafeCast::<u64>::safe_cast(slot.packet.payload.len());
                        }
                        SlotState::Dropped => {}
                    }
                }
                ring.last_ack_pos = ring.pos(ring.last_ack_pos, 1);
            }

            ring.ack_seq = ring.ack_seq + PrecheckedCast::<u32>::prechecked_cast(count);
            ring.max_pos = ring.max_pos.saturating_sub(count);
            ring.release_consumed_head(&mut counters, self.message_mode());
            trace!("acknowledged {} packets, ACK cursor is now {}", count, ring.ack_seq);
        }

        self.data_ready.notify_waiters();
        Ok(())
    }

    /// Acknowledge everything before `seq_no`. An ACK behind the current cursor is ignored.
    pub fn acknowledge_to(&self, seq_no: SeqNo) -> Result<(), BufferError> {
        let ack_seq = self.ack_seq();
        let offset = ack_seq.offset_to(seq_no);
        if offset < 0 {
            debug!("ignoring ACK {} which is behind the ACK cursor {}", seq_no, ack_seq);
            return Ok(());
        }
        self.acknowledge(offset.prechecked_cast())
    }

    /// Move the ACK cursor past `count` slots of irrecoverably lost packets, discarding whatever
    ///  was received in that range. Returns the number of discarded packets.
    pub fn skip(&self, count: usize) -> Result<usize, BufferError> {
        let discarded = {
            let mut guard = self.ring.lock().unwrap();
            let ring = &mut *guard;

            let limit = ring.available_space();
            if count > limit {
                return Err(BufferError::InvalidOffset { offset: count, limit });
            }

            let mut discarded = 0;
            for _ in 0..count {
                if ring.slots[ring.last_ack_pos].take().is_some() {
                    discarded += 1;
                }
                ring.last_ack_pos = ring.pos(ring.last_ack_pos, 1);
            }

            let first_skipped = ring.ack_seq;
            ring.ack_seq = ring.ack_seq + PrecheckedCast::<u32>::prechecked_cast(count);
            ring.max_pos = ring.max_pos.saturating_sub(count);

            let mut counters = self.counters.lock().unwrap();
            counters.dropped_packets += SafeCast::<u64>::safe_cast(discarded);
            ring.release_consumed_head(&mut counters, self.message_mode());

            if count > 0 {
                debug!("skipped {} packets from {} to {} ({} of them received)", count, first_skipped, ring.ack_seq, discarded);
            }
            discarded
        };

        self.data_ready.notify_waiters();
        Ok(discarded)
    }

    pub fn skip_to(&self, seq_no: SeqNo) -> Result<usize, BufferError> {
        let ack_seq = self.ack_seq();
        let offset = ack_seq.offset_to(seq_no);
        if offset < 0 {
            debug!("ignoring skip to {} which is behind the ACK cursor {}", seq_no, ack_seq);
            return Ok(0);
        }
        self.skip(offset.prechecked_cast())
    }

    /// Mark all packets of a message as dropped, e.g. because the sender gave up on it. Returns
    ///  the number of slots that were marked.
    ///
    /// Fragments of the message that arrive later are stored as dropped as well, so the
    ///  application never sees any part of it.
    pub fn drop_message(&self, msg_seq: u32, using_rexmit_flag: bool) -> usize {
        let num_dropped = {
            let mut guard = self.ring.lock().unwrap();
            let ring = &mut *guard;

            let end = ring.pos(ring.last_ack_pos, ring.max_pos);
            let mut pos = ring.start_pos;
            let mut num_dropped = 0;
            while pos != end {
                if let Some(slot) = ring.slots[pos].as_mut() {
                    if slot.state == SlotState::Good && slot.packet.msg_no.seq(using_rexmit_flag) == msg_seq {
                        slot.state = SlotState::Dropped;
                        num_dropped += 1;
                    }
                }
                pos = ring.pos(pos, 1);
            }
            ring.remember_dropped_message(msg_seq, using_rexmit_flag);

            let mut counters = self.counters.lock().unwrap();
            counters.dropped_packets += SafeCast::<u64>::safe_cast(num_dropped);
            ring.release_consumed_head(&mut counters, self.message_mode());

            debug!("dropped message {}: {} packets", msg_seq, num_dropped);
            num_dropped
        };

        if num_dropped > 0 {
            self.data_ready.notify_waiters();
        }
        num_dropped
    }

    pub fn is_data_ready(&self) -> ReadyState {
        let now = self.clock.now_micros();
        let message_mode = self.message_mode();

        let mut guard = self.ring.lock().unwrap();
        let ring = &mut *guard;
        ring.release_consumed_head(&mut self.counters.lock().unwrap(), message_mode);

        if ring.tsbpd.is_some() {
            return ring.tsbpd_ready_state(now, message_mode);
        }

        if message_mode {
            return match ring.find_message(true) {
                Some(found) => ReadyState {
                    ready: true,
                    passack: found.reassembly == Reassembly::OutOfOrder,
                    ..ReadyState::default()
                },
                None => ReadyState::default(),
            };
        }

        ReadyState {
            ready: ring.has_acked_data(),
            ..ReadyState::default()
        }
    }

    /// Read acknowledged data as a byte stream. A packet that does not fit completely is
    ///  consumed partially, the rest stays in place for the next call.
    pub fn read(&self, out: &mut [u8]) -> usize {
        let now = self.clock.now_micros();

        let mut guard = self.ring.lock().unwrap();
        let ring = &mut *guard;
        let mut counters = self.counters.lock().unwrap();
        ring.release_consumed_head(&mut counters, false);

        let mut copied = 0;
        while copied < out.len() && ring.has_acked_data() {
            if !ring.is_good(ring.start_pos) {
                ring.free_head(&mut counters);
                continue;
            }

            if let Some(ts) = ring.head_timestamp() {
                if let Some(tsbpd) = ring.tsbpd.as_mut() {
                    if tsbpd.playout_time(ts) > now {
                        break;
                    }
                }
            }

            let (n, remaining) = match ring.packet(ring.start_pos) {
                Some(packet) => {
                    let data = &packet.payload[ring.notch..];
                    let n = min(data.len(), out.len() - copied);
                    out[copied..copied + n].copy_from_slice(&data[..n]);
                    (n, data.len() - n)
                }
                None => (0, 0),
            };
            copied += n;

            if remaining == 0 {
                ring.free_head(&mut counters);
            }
            else {
                ring.notch += n;
                counters.buffered_bytes -= n;
            }
        }

        trace!("read {} bytes", copied);
        copied
    }

    /// Read one message. If `out` is too small, the message is truncated to fit and the rest is
    ///  discarded.
    pub fn read_message(&self, out: &mut [u8]) -> Option<MessageRead> {
        let now = self.clock.now_micros();
        let message_mode = self.message_mode();

        let mut guard = self.ring.lock().unwrap();
        let ring = &mut *guard;
        let mut counters = self.counters.lock().unwrap();
        ring.release_consumed_head(&mut counters, message_mode);

        let mut playout_time = None;
        if ring.tsbpd.is_some() {
            let ts = ring.head_timestamp()?;
            let t = ring.tsbpd.as_mut()?.playout_time(ts);
            if t > now {
                return None;
            }
            playout_time = Some(t);
        }

        let found = ring.find_message(message_mode && ring.tsbpd.is_none())?;

        let notch = if found.first == ring.start_pos { ring.notch } else { 0 };
        let mut len = 0;
        let mut msg_len = 0;
        let (seq_no, msg_no) = ring.packet(found.first)
            .map(|p| (p.seq_no, p.msg_no))?;

        for i in 0..found.num_slots {
            let pos = ring.pos(found.first, i);
            if let Some(packet) = ring.packet(pos) {
                let data = if i == 0 { &packet.payload[notch..] } else { &packet.payload[..] };
                let n = min(data.len(), out.len() - len);
                out[len..len + n].copy_from_slice(&data[..n]);
                len += n;
                msg_len += data.len();
            }
        }

        match found.reassembly {
            Reassembly::OutOfOrder => {
                for i in 0..found.num_slots {
                    let pos = ring.pos(found.first, i);
                    if let Some(slot) = ring.slots[pos].as_mut() {
                        slot.state = SlotState::PassAck;
                    }
                }
                debug!("delivered message {} out of order before it was acknowledged", msg_no.seq(true));
            }
            reassembly => {
                for _ in 0..found.num_slots {
                    ring.free_head(&mut counters);
                }
                ring.release_consumed_head(&mut counters, message_mode);

                if reassembly == Reassembly::AckedTruncated {
                    debug!("delivered truncated message {}: {} packets before the ACK cursor passed its end", msg_no.seq(true), found.num_slots);
                }
            }
        }

        if len < msg_len {
            debug!("message {} of {} bytes truncated to {} bytes", msg_no.seq(true), msg_len, len);
        }
        trace!("read message {} with {} packets", msg_no.seq(true), found.num_slots);

        Some(MessageRead {
            len,
            msg_len,
            seq_no,
            msg_no,
            num_packets: found.num_slots,
            reassembly: found.reassembly,
            playout_time,
        })
    }

    /// Wait until data is ready for reading. In TSBPD mode, this sleeps until the first packet's
    ///  playout time; any structural change (arriving packets, ACKs, drops) re-evaluates the
    ///  ready state.
    pub async fn wait_for_data(&self) -> Result<ReadyState, BufferError> {
        loop {
            let notified = self.data_ready.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.ring.lock().unwrap().closed {
                return Err(BufferError::Closed);
            }

            let state = self.is_data_ready();
            if state.ready {
                return Ok(state);
            }

            // a playout time that passed without the data becoming ready needs a structural change
            match state.playout_time.filter(|&t| t > self.clock.now_micros()) {
                Some(playout_time) => {
                    let delay = playout_time.saturating_sub(self.clock.now_micros());
                    tokio::select! {
                        _ = tokio::time::sleep(Duration::from_micros(delay)) => {}
                        _ = &mut notified => {}
                    }
                }
                None => notified.await,
            }
        }
    }

    /// Wake all waiting readers with [BufferError::Closed], and make future waits fail the same
    ///  way
    pub fn close(&self) {
        debug!("closing receive buffer");
        self.ring.lock().unwrap().closed = true;
        self.data_ready.notify_waiters();
    }

    /// number of packets that can still be received beyond the ACK cursor
    pub fn available_space(&self) -> usize {
        self.ring.lock().unwrap().available_space()
    }

    /// number of acknowledged slots that were not read yet
    pub fn data_size(&self) -> usize {
        self.ring.lock().unwrap().acked_len()
    }

    pub fn ack_seq(&self) -> SeqNo {
        self.ring.lock().unwrap().ack_seq
    }

    pub fn stats(&self) -> ReceiveStats {
        let timespan_ms = self.ring.lock().unwrap().timespan_ms();

        let counters = self.counters.lock().unwrap();
        ReceiveStats {
            acked_packets: counters.acked_packets,
            acked_bytes: counters.acked_bytes,
            dropped_packets: counters.dropped_packets,
            buffered_packets: counters.buffered_packets,
            buffered_bytes: counters.buffered_bytes,
            avg_payload_size: counters.avg_payload_size,
            timespan_ms,
        }
    }

    /// take a sample for the moving average of the acknowledged data's size
    pub fn update_average_size(&self) {
        let now = self.clock.now_micros();
        let ring = self.ring.lock().unwrap();
        let mut counters = self.counters.lock().unwrap();

        let (packets, bytes) = (counters.buffered_packets, counters.buffered_bytes);
        counters.size_average.update(now, packets, bytes, ring.timespan_ms());
    }

    pub fn average_size(&self) -> ReceiveBufferSize {
        let counters = self.counters.lock().unwrap();
        ReceiveBufferSize {
            packets: counters.size_average.packets.prechecked_cast(),
            bytes: counters.size_average.bytes.prechecked_cast(),
            timespan_ms: counters.size_average.timespan_ms,
        }
    }
}
