use std::cmp::min;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use bytes::BufMut;
use tracing::{debug, trace, warn};
use crate::buffers::fixed_buffer::FixedBuf;
use crate::buffers::payload_pool::PayloadPool;
use crate::clock::TimeSource;
use crate::config::{BufferConfig, SendBufferConfig};
use crate::error::BufferError;
use crate::safe_converter::{PrecheckedCast, SafeCast};
use crate::seq_no::{MsgNo, PacketBoundary, SeqNo};
use crate::size_average::SizeAverage;

/// Per-packet overhead of a data packet on the wire (SRT header + UDP + IPv4), used for input
///  rate estimation
const DATA_PACKET_HEADER_SIZE: u64 = 44;

/// A copy of a buffered block, handed out for (re)transmission
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct SendBlock {
    /// position relative to the ACK cursor
    pub offset: usize,
    pub seq_no: SeqNo,
    pub msg_no: MsgNo,
    pub origin_time: u64,
    pub source_time: u64,
    pub data: Vec<u8>,
}

#[derive(Debug, Default, Copy, Clone, Eq, PartialEq)]
pub struct Released {
    pub blocks: usize,
    pub bytes: usize,
}

#[derive(Debug, Default, Copy, Clone, Eq, PartialEq)]
pub struct SendBufferSize {
    pub blocks: usize,
    pub bytes: usize,
    /// time between the oldest and the newest buffered block, rounded up to the next millisecond
    pub timespan_ms: u64,
}

struct Block {
    /// `None` iff the block is on the free list
    payload: Option<FixedBuf>,
    msg_no: MsgNo,
    origin_time: u64,
    source_time: u64,
    ttl: Option<u64>,
    next: Option<usize>,
}

impl Block {
    fn empty() -> Block {
        Block {
            payload: None,
            msg_no: MsgNo::from_raw(0),
            origin_time: 0,
            source_time: 0,
            ttl: None,
            next: None,
        }
    }

    fn len(&self) -> usize {
        self.payload.as_ref().map(|p| p.len()).unwrap_or(0)
    }

    fn is_expired(&self, now: u64) -> bool {
        match self.ttl {
            Some(ttl) => now.saturating_sub(self.origin_time) > ttl,
            None => false,
        }
    }
}

/// Rate at which the application feeds data into the send buffer
struct InputRate {
    enabled: bool,
    period: u64,
    start_time: Option<u64>,
    pkts: u64,
    bytes: u64,
    bytes_per_sec: u64,
    avg_payload_size: u64,
}
impl InputRate {
    const FAST_START_PERIOD: u64 = 500_000;
    const RUNNING_PERIOD: u64 = 1_000_000;

    fn new(enabled: bool) -> InputRate {
        InputRate {
            enabled,
            period: Self::FAST_START_PERIOD,
            start_time: None,
            pkts: 0,
            bytes: 0,
            bytes_per_sec: 0,
            avg_payload_size: 0,
        }
    }

    fn update(&mut self, now: u64, pkts: usize, bytes: usize) {
        if !self.enabled {
            return;
        }

        let start_time = match self.start_time {
            None => {
                self.start_time = Some(now);
                return;
            }
            Some(t) => t,
        };

        self.pkts += SafeCast::<u64>::safe_cast(pkts);
        self.bytes += SafeCast::<u64>::safe_cast(bytes);

        let elapsed = now.saturating_sub(start_time);
        if elapsed > self.period && self.pkts > 0 {
            self.avg_payload_size = self.bytes / self.pkts;
            let wire_bytes = self.bytes + self.pkts * DATA_PACKET_HEADER_SIZE;
            self.bytes_per_sec = wire_bytes * 1_000_000 / elapsed;
            trace!("input rate: {} bytes/s, average payload {} bytes", self.bytes_per_sec, self.avg_payload_size);

            self.pkts = 0;
            self.bytes = 0;
            self.start_time = Some(now);
            self.period = Self::RUNNING_PERIOD;
        }
    }
}

struct SendBufferInner {
    /// block arena - blocks are linked through their `next` index in FIFO order
    blocks: Vec<Block>,
    free: Vec<usize>,

    /// oldest unacknowledged block
    first: Option<usize>,
    last: Option<usize>,
    /// next block that was not sent yet, or `None` if all blocks were sent
    current: Option<usize>,
    num_sent: usize,

    count: usize,
    bytes: usize,
    last_origin_time: u64,

    /// sequence number of the block at the ACK cursor
    ack_seq: SeqNo,
    next_msg_seq: u32,

    size_average: SizeAverage,
    input_rate: InputRate,
}

impl SendBufferInner {
    fn capacity_check(&self, config: &SendBufferConfig, num_blocks: usize) -> Result<(), BufferError> {
        if let Some(max_blocks) = config.max_blocks {
            if self.count + num_blocks > max_blocks {
                return Err(BufferError::BufferFull { capacity: max_blocks });
            }
        }
        Ok(())
    }

    /// Make sure there are at least `num_blocks` blocks on the free list, doubling the arena as
    ///  often as necessary
    fn ensure_free_blocks(&mut self, config: &SendBufferConfig, num_blocks: usize) -> Result<(), BufferError> {
        if self.free.len() >= num_blocks {
            return Ok(());
        }

        let mut new_len = self.blocks.len().max(1);
        while new_len - self.blocks.len() + self.free.len() < num_blocks {
            new_len *= 2;
        }
        if let Some(max_blocks) = config.max_blocks {
            new_len = min(new_len, max_blocks.max(self.blocks.len() + num_blocks - self.free.len()));
        }
        let additional = new_len - self.blocks.len();

        if self.blocks.try_reserve_exact(additional).is_err() || self.free.try_reserve(additional).is_err() {
            warn!("failed to grow send buffer by {} blocks", additional);
            return Err(BufferError::AllocationFailure { requested: additional });
        }

        debug!("growing send buffer from {} to {} blocks", self.blocks.len(), new_len);
        for idx in self.blocks.len()..new_len {
            self.blocks.push(Block::empty());
            self.free.push(idx);
        }
        Ok(())
    }

    fn current_size(&self) -> SendBufferSize {
        let timespan_ms = match self.first {
            Some(first) => (self.last_origin_time.saturating_sub(self.blocks[first].origin_time)) / 1000 + 1,
            None => 0,
        };

        SendBufferSize {
            blocks: self.count,
            bytes: self.bytes,
            timespan_ms,
        }
    }

    /// index of the block `offset` positions after the ACK cursor
    fn nth(&self, offset: usize) -> Option<usize> {
        if offset >= self.count {
            return None;
        }
        let mut idx = self.first?;
        for _ in 0..offset {
            idx = self.blocks[idx].next?;
        }
        Some(idx)
    }

    fn to_send_block(&self, idx: usize, offset: usize) -> SendBlock {
        let block = &self.blocks[idx];
        SendBlock {
            offset,
            seq_no: self.ack_seq + PrecheckedCast::<u32>::prechecked_cast(offset),
            msg_no: block.msg_no,
            origin_time: block.origin_time,
            source_time: block.source_time,
            data: block.payload.as_ref().map(|p| p.as_ref().to_vec()).unwrap_or_default(),
        }
    }

    /// Starting at an expired block, return the index and offset of the first block after the
    ///  expired message, and the number of blocks that were skipped
    fn skip_expired_message(&self, idx: usize, offset: usize) -> (Option<usize>, usize, usize) {
        let msg_seq = self.blocks[idx].msg_no.seq(true);
        let mut num_skipped = 1;
        let mut next = self.blocks[idx].next;

        while let Some(n) = next {
            if self.blocks[n].msg_no.seq(true) != msg_seq || self.blocks[n].msg_no.boundary().starts_message() {
                break;
            }
            num_skipped += 1;
            next = self.blocks[n].next;
        }

        debug!("message {} expired before it could be sent - skipping {} blocks", msg_seq, num_skipped);
        (next, offset + num_skipped, num_skipped)
    }

    /// unlink the block at the ACK cursor, returning its payload
    fn release_first(&mut self) -> Option<FixedBuf> {
        let idx = self.first?;

        let block = &mut self.blocks[idx];
        let payload = block.payload.take();
        let len = payload.as_ref().map(|p| p.len()).unwrap_or(0);
        self.first = block.next.take();
        self.free.push(idx);

        if self.current == Some(idx) {
            self.current = self.first;
        }
        else {
            self.num_sent = self.num_sent.saturating_sub(1);
        }
        if self.first.is_none() {
            self.last = None;
            self.current = None;
            self.num_sent = 0;
        }

        self.count -= 1;
        self.bytes -= len;
        self.ack_seq = self.ack_seq + 1;
        payload
    }
}

/// The send-side retransmission buffer.
///
/// Messages are split into MSS-sized blocks that stay in the buffer until they are
///  acknowledged. Blocks are addressed by their offset from the ACK cursor, which is also how
///  the sender looks them up for retransmission.
pub struct SendBuffer {
    config: Arc<BufferConfig>,
    clock: Arc<dyn TimeSource>,
    payload_pool: PayloadPool,
    inner: Mutex<SendBufferInner>,
}

impl SendBuffer {
    pub fn new(config: Arc<BufferConfig>, clock: Arc<dyn TimeSource>, initial_seq: SeqNo) -> Result<SendBuffer, BufferError> {
        let payload_pool = PayloadPool::new(config.mss, config.send.payload_pool_size);

        let mut inner = SendBufferInner {
            blocks: Vec::new(),
            free: Vec::new(),
            first: None,
            last: None,
            current: None,
            num_sent: 0,
            count: 0,
            bytes: 0,
            last_origin_time: 0,
            ack_seq: initial_seq,
            next_msg_seq: 1,
            size_average: SizeAverage::default(),
            input_rate: InputRate::new(config.send.input_rate_sampling),
        };
        inner.ensure_free_blocks(&config.send, config.send.initial_blocks)?;

        Ok(SendBuffer {
            config,
            clock,
            payload_pool,
            inner: Mutex::new(inner),
        })
    }

    /// Add a message to the buffer, returning the message sequence number assigned to it.
    ///
    /// `ttl` is the time after which the message is not worth sending any more, `None` for
    ///  unlimited. `source_time` is the application's capture time of the data if it differs
    ///  from the time it is handed to the buffer.
    pub fn append(&self, data: &[u8], ttl: Option<Duration>, in_order: bool, source_time: Option<u64>) -> Result<u32, BufferError> {
        let mss = self.config.mss;
        let num_blocks = data.len().div_ceil(mss).max(1);

        // fail fast before copying anything
        self.inner.lock().unwrap()
            .capacity_check(&self.config.send, num_blocks)?;

        let mut payloads = Vec::with_capacity(num_blocks);
        for chunk in data.chunks(mss) {
            let mut payload = match self.payload_pool.get_from_pool() {
                Ok(p) => p,
                Err(e) => {
                    self.return_all_to_pool(payloads);
                    return Err(e);
                }
            };
            payload.put_slice(chunk);
            payloads.push(payload);
        }
        if payloads.is_empty() {
            // zero-length message: a single empty block
            payloads.push(self.payload_pool.get_from_pool()?);
        }

        let now = self.clock.now_micros();
        let mut inner = self.inner.lock().unwrap();

        let structural_check = match inner.capacity_check(&self.config.send, num_blocks) {
            Ok(()) => inner.ensure_free_blocks(&self.config.send, num_blocks),
            Err(e) => Err(e),
        };
        if let Err(e) = structural_check {
            drop(inner);
            self.return_all_to_pool(payloads);
            return Err(e);
        }

        let msg_seq = inner.next_msg_seq;
        let ttl = ttl.map(|t| PrecheckedCast::<u64>::prechecked_cast(t.as_micros()));
        let source_time = source_time.unwrap_or(now);

        for (i, payload) in payloads.into_iter().enumerate() {
            let idx = inner.free.pop()
                .expect("free blocks were ensured above");

            inner.blocks[idx] = Block {
                payload: Some(payload),
                msg_no: MsgNo::new(msg_seq, PacketBoundary::for_position(i, num_blocks), in_order),
                origin_time: now,
                source_time,
                ttl,
                next: None,
            };

            let last = inner.last;
            match last {
                Some(last) => inner.blocks[last].next = Some(idx),
                None => inner.first = Some(idx),
            }
            inner.last = Some(idx);
            if inner.current.is_none() {
                inner.current = Some(idx);
            }
        }

        inner.count += num_blocks;
        inner.bytes += data.len();
        inner.last_origin_time = now;
        inner.next_msg_seq = MsgNo::next_seq(msg_seq);
        inner.input_rate.update(now, num_blocks, data.len());

        trace!("appended message {} with {} bytes in {} blocks", msg_seq, data.len(), num_blocks);
        Ok(msg_seq)
    }

    fn return_all_to_pool(&self, payloads: Vec<FixedBuf>) {
        for payload in payloads {
            self.payload_pool.return_to_pool(payload);
        }
    }

    /// The next block for first transmission, advancing the send cursor. Blocks whose TTL
    ///  expired are skipped along with the rest of their message.
    pub fn next_unsent(&self) -> Option<SendBlock> {
        let now = self.clock.now_micros();
        let mut inner = self.inner.lock().unwrap();

        loop {
            let idx = inner.current?;
            let offset = inner.num_sent;

            if inner.blocks[idx].is_expired(now) {
                let (next, _, num_skipped) = inner.skip_expired_message(idx, offset);
                inner.current = next;
                inner.num_sent += num_skipped;
                continue;
            }

            let result = inner.to_send_block(idx, offset);
            inner.current = inner.blocks[idx].next;
            inner.num_sent += 1;
            return Some(result);
        }
    }

    /// Look up the block `offset` positions after the ACK cursor without removing it, e.g. for
    ///  retransmission. If that block's TTL expired, the first block after its message is
    ///  returned instead (with its actual offset).
    pub fn next_block(&self, offset: usize) -> Option<SendBlock> {
        let now = self.clock.now_micros();
        let inner = self.inner.lock().unwrap();

        let mut offset = offset;
        let mut idx = inner.nth(offset);
        if idx.is_none() {
            trace!("no block at offset {} - {} blocks buffered", offset, inner.count);
        }

        while let Some(i) = idx {
            if !inner.blocks[i].is_expired(now) {
                return Some(inner.to_send_block(i, offset));
            }
            let (next, next_offset, _) = inner.skip_expired_message(i, offset);
            idx = next;
            offset = next_offset;
        }
        None
    }

    /// Advance the ACK cursor by `count` blocks, releasing their storage
    pub fn acknowledge(&self, count: usize) -> Result<Released, BufferError> {
        let mut released_payloads = Vec::with_capacity(count);
        let released = {
            let mut inner = self.inner.lock().unwrap();
            if count > inner.count {
                return Err(BufferError::InvalidOffset { offset: count, limit: inner.count });
            }

            let mut released = Released::default();
            for _ in 0..count {
                if let Some(payload) = inner.release_first() {
                    released.blocks += 1;
                    released.bytes += payload.len();
                    released_payloads.push(payload);
                }
            }
            trace!("acknowledged {} blocks, ACK cursor is now {}", count, inner.ack_seq);
            released
        };

        self.return_all_to_pool(released_payloads);
        Ok(released)
    }

    /// Sequence number form of [SendBuffer::acknowledge]: everything before `seq_no` is
    ///  acknowledged. An ACK behind the current cursor is ignored.
    pub fn acknowledge_to(&self, seq_no: SeqNo) -> Result<Released, BufferError> {
        let ack_seq = self.inner.lock().unwrap().ack_seq;
        let offset = ack_seq.offset_to(seq_no);
        if offset < 0 {
            debug!("ignoring ACK {} which is behind the ACK cursor {}", seq_no, ack_seq);
            return Ok(Released::default());
        }
        self.acknowledge(offset.prechecked_cast())
    }

    /// Drop all blocks that were created before `late_time`, acknowledged or not (too-late
    ///  packet drop on the sender side)
    pub fn drop_late_data(&self, late_time: u64) -> Released {
        let mut dropped_payloads = Vec::new();
        let dropped = {
            let mut inner = self.inner.lock().unwrap();
            let first_seq = inner.ack_seq;

            let mut dropped = Released::default();
            loop {
                let is_late = match inner.first {
                    Some(first) => inner.blocks[first].origin_time < late_time,
                    None => false,
                };
                if !is_late {
                    break;
                }
                if let Some(payload) = inner.release_first() {
                    dropped.blocks += 1;
                    dropped.bytes += payload.len();
                    dropped_payloads.push(payload);
                }
            }

            if dropped.blocks > 0 {
                debug!("dropped {} late blocks ({} bytes) starting at {}", dropped.blocks, dropped.bytes, first_seq);
            }
            dropped
        };

        self.return_all_to_pool(dropped_payloads);
        dropped
    }

    pub fn current_size(&self) -> SendBufferSize {
        self.inner.lock().unwrap().current_size()
    }

    /// take a sample for the moving average of the buffer size
    pub fn update_average_size(&self) {
        let now = self.clock.now_micros();
        let mut inner = self.inner.lock().unwrap();
        let current = inner.current_size();
        inner.size_average.update(now, current.blocks, current.bytes, current.timespan_ms);
    }

    pub fn average_size(&self) -> SendBufferSize {
        let inner = self.inner.lock().unwrap();
        SendBufferSize {
            blocks: inner.size_average.packets.prechecked_cast(),
            bytes: inner.size_average.bytes.prechecked_cast(),
            timespan_ms: inner.size_average.timespan_ms,
        }
    }

    /// (bytes per second including packet headers, average payload size)
    pub fn input_rate(&self) -> (u64, u64) {
        let inner = self.inner.lock().unwrap();
        (inner.input_rate.bytes_per_sec, inner.input_rate.avg_payload_size)
    }

    /// sequence number of the first unacknowledged block
    pub fn ack_seq(&self) -> SeqNo {
        self.inner.lock().unwrap().ack_seq
    }

    /// number of blocks that were handed out for first transmission and are not acknowledged yet
    pub fn num_sent(&self) -> usize {
        self.inner.lock().unwrap().num_sent
    }

    /// number of blocks the arena has room for without growing
    pub fn allocated_blocks(&self) -> usize {
        self.inner.lock().unwrap().blocks.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::MockTimeSource;
    use crate::config::{DriftConfig, ReceiveBufferConfig};
    use rand::Rng;
    use rstest::rstest;
    use std::sync::atomic::{AtomicU64, Ordering};

    fn config(mss: usize, initial_blocks: usize, max_blocks: Option<usize>) -> Arc<BufferConfig> {
        Arc::new(BufferConfig {
            mss,
            send: SendBufferConfig {
                initial_blocks,
                max_blocks,
                payload_pool_size: 16,
                input_rate_sampling: true,
            },
            receive: ReceiveBufferConfig {
                capacity: 16,
                message_mode: true,
            },
            tsbpd: None,
            drift: DriftConfig::default(),
        })
    }

    fn clock(now: Arc<AtomicU64>) -> Arc<dyn TimeSource> {
        let mut clock = MockTimeSource::new();
        clock.expect_now_micros()
            .returning(move || now.load(Ordering::Acquire));
        Arc::new(clock)
    }

    fn buffer(mss: usize, initial_blocks: usize, max_blocks: Option<usize>) -> (SendBuffer, Arc<AtomicU64>) {
        let now = Arc::new(AtomicU64::new(1_000_000));
        let buffer = SendBuffer::new(config(mss, initial_blocks, max_blocks), clock(now.clone()), SeqNo::from_raw(100)).unwrap();
        (buffer, now)
    }

    fn drain_unsent(buffer: &SendBuffer) -> Vec<(u32, Vec<u8>)> {
        let mut result = Vec::new();
        while let Some(block) = buffer.next_unsent() {
            result.push((block.seq_no.to_raw(), block.data));
        }
        result
    }

    #[rstest]
    #[case::empty(vec![], vec![(PacketBoundary::Solo, vec![])])]
    #[case::solo(vec![1,2,3], vec![(PacketBoundary::Solo, vec![1,2,3])])]
    #[case::exactly_mss(vec![1,2,3,4], vec![(PacketBoundary::Solo, vec![1,2,3,4])])]
    #[case::two(vec![1,2,3,4,5], vec![(PacketBoundary::First, vec![1,2,3,4]), (PacketBoundary::Last, vec![5])])]
    #[case::three(vec![1,2,3,4,5,6,7,8,9], vec![
        (PacketBoundary::First, vec![1,2,3,4]),
        (PacketBoundary::Subsequent, vec![5,6,7,8]),
        (PacketBoundary::Last, vec![9]),
    ])]
    fn test_append_splits_into_blocks(#[case] message: Vec<u8>, #[case] expected: Vec<(PacketBoundary, Vec<u8>)>) {
        let (buffer, _) = buffer(4, 2, None);

        let msg_seq = buffer.append(&message, None, true, None).unwrap();
        assert_eq!(msg_seq, 1);

        let mut actual = Vec::new();
        while let Some(block) = buffer.next_unsent() {
            assert_eq!(block.msg_no.seq(true), 1);
            assert!(block.msg_no.in_order());
            actual.push((block.msg_no.boundary(), block.data));
        }
        assert_eq!(actual, expected);

        let size = buffer.current_size();
        assert_eq!(size.blocks, expected.len());
        assert_eq!(size.bytes, message.len());
    }

    #[test]
    fn test_message_numbers_and_sequence_numbers() {
        let (buffer, _) = buffer(4, 2, None);
        assert_eq!(buffer.append(&[1], None, false, None), Ok(1));
        assert_eq!(buffer.append(&[2,2,2,2,2], None, false, None), Ok(2));
        assert_eq!(buffer.append(&[3], None, false, None), Ok(3));

        assert_eq!(drain_unsent(&buffer), vec![
            (100, vec![1]),
            (101, vec![2,2,2,2]),
            (102, vec![2]),
            (103, vec![3]),
        ]);
        assert_eq!(buffer.num_sent(), 4);
    }

    #[test]
    fn test_source_time() {
        let (buffer, now) = buffer(4, 2, None);
        buffer.append(&[1], None, false, Some(777)).unwrap();
        buffer.append(&[2], None, false, None).unwrap();

        let first = buffer.next_block(0).unwrap();
        assert_eq!(first.source_time, 777);
        assert_eq!(first.origin_time, now.load(Ordering::Acquire));

        let second = buffer.next_block(1).unwrap();
        assert_eq!(second.source_time, second.origin_time);
    }

    #[rstest]
    #[case::first(0, Some((100, vec![1])))]
    #[case::middle(1, Some((101, vec![2])))]
    #[case::last(2, Some((102, vec![3])))]
    #[case::beyond(3, None)]
    #[case::far_beyond(1000, None)]
    fn test_next_block(#[case] offset: usize, #[case] expected: Option<(u32, Vec<u8>)>) {
        let (buffer, _) = buffer(4, 2, None);
        for i in 1..=3u8 {
            buffer.append(&[i], None, false, None).unwrap();
        }

        let actual = buffer.next_block(offset)
            .map(|b| (b.seq_no.to_raw(), b.data));
        assert_eq!(actual, expected);

        // lookups do not consume anything
        assert_eq!(buffer.current_size().blocks, 3);
        assert_eq!(buffer.num_sent(), 0);
    }

    #[test]
    fn test_ttl_expired_block_is_skipped_by_next_block() {
        let (buffer, now) = buffer(4, 2, None);
        buffer.append(&[1], Some(Duration::from_millis(50)), false, None).unwrap();
        buffer.append(&[2], None, false, None).unwrap();

        assert_eq!(buffer.next_block(0).unwrap().data, vec![1]);

        now.fetch_add(50_000, Ordering::AcqRel);
        assert_eq!(buffer.next_block(0).unwrap().data, vec![1], "TTL is not exceeded at exactly 50ms");

        now.fetch_add(1, Ordering::AcqRel);
        let block = buffer.next_block(0).unwrap();
        assert_eq!(block.data, vec![2]);
        assert_eq!(block.offset, 1);
        assert_eq!(block.seq_no, SeqNo::from_raw(101));
    }

    #[test]
    fn test_ttl_skips_the_whole_message() {
        let (buffer, now) = buffer(2, 2, None);
        buffer.append(&[1,1,1,1,1], Some(Duration::from_millis(10)), false, None).unwrap();
        buffer.append(&[2,2,2], Some(Duration::from_millis(10)), false, None).unwrap();

        now.fetch_add(5_000, Ordering::AcqRel);
        buffer.append(&[3], Some(Duration::from_millis(10)), false, None).unwrap();

        now.fetch_add(6_000, Ordering::AcqRel);

        // only the last message is young enough
        let block = buffer.next_block(1).unwrap();
        assert_eq!(block.data, vec![3]);
        assert_eq!(block.offset, 5);

        assert_eq!(drain_unsent(&buffer), vec![(105, vec![3])]);
        assert_eq!(buffer.num_sent(), 6);
    }

    #[test]
    fn test_next_block_all_expired() {
        let (buffer, now) = buffer(4, 2, None);
        buffer.append(&[1], Some(Duration::ZERO), false, None).unwrap();
        now.fetch_add(1, Ordering::AcqRel);

        assert_eq!(buffer.next_block(0), None);
        assert_eq!(buffer.next_unsent(), None);
    }

    #[rstest]
    #[case::none(0, 0, 0, 100)]
    #[case::one(1, 1, 3, 101)]
    #[case::two(2, 2, 7, 102)]
    #[case::all(3, 3, 12, 103)]
    fn test_acknowledge(#[case] count: usize, #[case] expected_blocks: usize, #[case] expected_bytes: usize, #[case] expected_ack_seq: u32) {
        let (buffer, _) = buffer(8, 2, None);
        buffer.append(&[1,1,1], None, false, None).unwrap();
        buffer.append(&[2,2,2,2], None, false, None).unwrap();
        buffer.append(&[3,3,3,3,3], None, false, None).unwrap();

        let released = buffer.acknowledge(count).unwrap();
        assert_eq!(released, Released { blocks: expected_blocks, bytes: expected_bytes });
        assert_eq!(buffer.ack_seq(), SeqNo::from_raw(expected_ack_seq));
        assert_eq!(buffer.current_size().blocks, 3 - count);
        assert_eq!(buffer.current_size().bytes, 12 - expected_bytes);
    }

    #[test]
    fn test_acknowledge_beyond_buffered_is_rejected() {
        let (buffer, _) = buffer(8, 2, None);
        buffer.append(&[1], None, false, None).unwrap();

        assert_eq!(buffer.acknowledge(2), Err(BufferError::InvalidOffset { offset: 2, limit: 1 }));
        assert_eq!(buffer.current_size().blocks, 1);
    }

    #[test]
    fn test_acknowledge_keeps_send_cursor() {
        let (buffer, _) = buffer(8, 2, None);
        for i in 0..4u8 {
            buffer.append(&[i], None, false, None).unwrap();
        }
        buffer.next_unsent().unwrap();
        buffer.next_unsent().unwrap();
        buffer.next_unsent().unwrap();

        buffer.acknowledge(2).unwrap();
        assert_eq!(buffer.num_sent(), 1);
        assert_eq!(buffer.next_unsent().unwrap().data, vec![3]);

        // acknowledging unsent blocks moves the send cursor along
        buffer.append(&[4], None, false, None).unwrap();
        buffer.append(&[5], None, false, None).unwrap();
        buffer.acknowledge(3).unwrap();
        assert_eq!(buffer.num_sent(), 0);
        assert_eq!(buffer.next_unsent().unwrap().data, vec![5]);
    }

    #[rstest]
    #[case::forward(103, 3, 103)]
    #[case::same(100, 0, 100)]
    #[case::backward(98, 0, 100)]
    fn test_acknowledge_to(#[case] ack: u32, #[case] expected_blocks: usize, #[case] expected_ack_seq: u32) {
        let (buffer, _) = buffer(8, 2, None);
        for i in 0..5u8 {
            buffer.append(&[i], None, false, None).unwrap();
        }

        assert_eq!(buffer.acknowledge_to(SeqNo::from_raw(ack)).unwrap().blocks, expected_blocks);
        assert_eq!(buffer.ack_seq(), SeqNo::from_raw(expected_ack_seq));
    }

    #[test]
    fn test_ack_cursor_is_monotonic() {
        let (buffer, _) = buffer(8, 2, None);
        for i in 0..5u8 {
            buffer.append(&[i], None, false, None).unwrap();
        }
        buffer.acknowledge_to(SeqNo::from_raw(103)).unwrap();
        buffer.acknowledge_to(SeqNo::from_raw(101)).unwrap();

        assert_eq!(buffer.ack_seq(), SeqNo::from_raw(103));
        assert_eq!(buffer.next_block(0).unwrap().data, vec![3]);
    }

    #[test]
    fn test_released_bytes_equal_appended_bytes() {
        let mut rng = rand::thread_rng();

        for _ in 0..20 {
            let (buffer, _) = buffer(16, 2, None);
            let messages = (0..rng.gen_range(1..30))
                .map(|_| vec![7u8; rng.gen_range(0..40)])
                .collect::<Vec<_>>();

            let mut blocks_per_message = Vec::new();
            for message in &messages {
                let before = buffer.current_size().blocks;
                buffer.append(message, None, false, None).unwrap();
                blocks_per_message.push(buffer.current_size().blocks - before);
            }

            let k = rng.gen_range(0..=messages.len());
            let num_blocks = blocks_per_message[..k].iter().sum::<usize>();
            let expected_bytes = messages[..k].iter().map(|m| m.len()).sum::<usize>();

            let released = buffer.acknowledge(num_blocks).unwrap();
            assert_eq!(released.bytes, expected_bytes);
            assert_eq!(buffer.current_size().bytes, messages[k..].iter().map(|m| m.len()).sum::<usize>());
        }
    }

    #[test]
    fn test_grows_geometrically() {
        let (buffer, _) = buffer(4, 2, None);
        assert_eq!(buffer.allocated_blocks(), 2);

        buffer.append(&[0; 12], None, false, None).unwrap();
        assert_eq!(buffer.allocated_blocks(), 4);

        buffer.append(&[0; 8], None, false, None).unwrap();
        assert_eq!(buffer.allocated_blocks(), 8);
    }

    #[test]
    fn test_freed_blocks_are_reused() {
        let (buffer, _) = buffer(4, 2, None);
        for _ in 0..100 {
            buffer.append(&[1, 2], None, false, None).unwrap();
            buffer.append(&[3, 4], None, false, None).unwrap();
            buffer.acknowledge(2).unwrap();
        }
        assert_eq!(buffer.allocated_blocks(), 2);
        assert_eq!(buffer.ack_seq(), SeqNo::from_raw(300));
    }

    #[test]
    fn test_buffer_full() {
        let (buffer, _) = buffer(4, 2, Some(4));
        buffer.append(&[0; 12], None, false, None).unwrap();

        assert_eq!(buffer.append(&[0; 5], None, false, None), Err(BufferError::BufferFull { capacity: 4 }));
        assert_eq!(buffer.current_size().blocks, 3);

        // a message that fits is still accepted
        assert_eq!(buffer.append(&[0; 4], None, false, None), Ok(2));
        assert_eq!(buffer.allocated_blocks(), 4);
    }

    #[test]
    fn test_drop_late_data() {
        let (buffer, now) = buffer(4, 2, None);
        buffer.append(&[1, 1], None, false, None).unwrap();
        now.fetch_add(1_000, Ordering::AcqRel);
        buffer.append(&[2, 2, 2, 2, 2], None, false, None).unwrap();
        now.fetch_add(1_000, Ordering::AcqRel);
        buffer.append(&[3], None, false, None).unwrap();

        buffer.next_unsent().unwrap();

        let dropped = buffer.drop_late_data(1_001_500);
        assert_eq!(dropped, Released { blocks: 3, bytes: 7 });
        assert_eq!(buffer.ack_seq(), SeqNo::from_raw(103));
        assert_eq!(buffer.num_sent(), 0);
        assert_eq!(drain_unsent(&buffer), vec![(103, vec![3])]);

        assert_eq!(buffer.drop_late_data(0), Released::default());
    }

    #[test]
    fn test_current_size_timespan() {
        let (buffer, now) = buffer(4, 2, None);
        assert_eq!(buffer.current_size(), SendBufferSize::default());

        buffer.append(&[1], None, false, None).unwrap();
        assert_eq!(buffer.current_size().timespan_ms, 1);

        now.fetch_add(30_000, Ordering::AcqRel);
        buffer.append(&[2], None, false, None).unwrap();
        assert_eq!(buffer.current_size(), SendBufferSize { blocks: 2, bytes: 2, timespan_ms: 31 });
    }

    #[test]
    fn test_average_size() {
        let (buffer, now) = buffer(4, 2, None);
        now.store(10_000_000, Ordering::Release);
        buffer.append(&[1, 2, 3, 4], None, false, None).unwrap();

        // the first sample after a long pause takes the current value
        buffer.update_average_size();
        assert_eq!(buffer.average_size().blocks, 1);
        assert_eq!(buffer.average_size().bytes, 4);

        buffer.append(&[5, 6, 7, 8], None, false, None).unwrap();

        // too soon for another sample
        now.fetch_add(10_000, Ordering::AcqRel);
        buffer.update_average_size();
        assert_eq!(buffer.average_size().bytes, 4);

        now.fetch_add(240_000, Ordering::AcqRel);
        buffer.update_average_size();
        assert_eq!(buffer.average_size().bytes, 5);
    }

    #[test]
    fn test_input_rate() {
        let (buffer, now) = buffer(100, 2, None);
        // the first append only starts the measurement
        buffer.append(&[0; 100], None, false, None).unwrap();
        assert_eq!(buffer.input_rate(), (0, 0));

        for _ in 0..10 {
            now.fetch_add(100_000, Ordering::AcqRel);
            buffer.append(&[0; 100], None, false, None).unwrap();
            buffer.acknowledge(1).unwrap();
        }

        // fast start: the first rate is computed after 500ms, from 6 packets in 600ms
        let (bytes_per_sec, avg_payload_size) = buffer.input_rate();
        assert_eq!(avg_payload_size, 100);
        assert!(bytes_per_sec > 0);
    }

    #[test]
    fn test_append_allocation_failure() {
        // payload buffers of this size can not be allocated
        let (buffer, _) = buffer(usize::MAX, 2, None);

        assert_eq!(buffer.append(&[1, 2, 3], None, false, None), Err(BufferError::AllocationFailure { requested: 1 }));
        assert_eq!(buffer.current_size(), SendBufferSize::default());
        assert_eq!(buffer.next_unsent(), None);
    }

    #[test]
    fn test_initial_allocation_failure() {
        let now = Arc::new(AtomicU64::new(0));
        let result = SendBuffer::new(config(4, usize::MAX / 2, None), clock(now), SeqNo::from_raw(100));
        assert!(matches!(result, Err(BufferError::AllocationFailure { .. })));
    }

    #[test]
    fn test_concurrent_append_and_ack() {
        let (buffer, _) = buffer(8, 4, None);
        let buffer = Arc::new(buffer);

        let writer = {
            let buffer = buffer.clone();
            std::thread::spawn(move || {
                for i in 0..1000u32 {
                    buffer.append(&i.to_be_bytes(), None, false, None).unwrap();
                }
            })
        };

        let mut total_released = 0;
        while total_released < 1000 {
            let buffered = buffer.current_size().blocks;
            total_released += buffer.acknowledge(buffered).unwrap().blocks;
        }
        writer.join().unwrap();

        assert_eq!(buffer.current_size(), SendBufferSize::default());
        assert_eq!(buffer.ack_seq(), SeqNo::from_raw(1100));
    }
}
