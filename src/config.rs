use std::time::Duration;
use anyhow::bail;

/// All settings for one connection's buffering core. This is evaluated once when the buffers are
///  created; there are no compile-time variants, so every mode can be exercised from the same
///  build.
pub struct BufferConfig {
    /// This is the maximum payload size of a single data packet, i.e. the size of the chunks
    ///  that the send buffer splits messages into.
    ///
    /// It must be agreed upon with the peer since the receive side stores one packet per slot
    ///  and does not re-chunk.
    pub mss: usize,

    pub send: SendBufferConfig,
    pub receive: ReceiveBufferConfig,

    /// `None` means that received data is handed to the application as soon as it is
    ///  acknowledged, without any timestamp-based playout delay
    pub tsbpd: Option<TsbpdConfig>,
    pub drift: DriftConfig,
}

impl BufferConfig {
    /// Live streaming profile: single-packet messages, 120ms playout delay, too-late drop
    pub fn default_live() -> BufferConfig {
        BufferConfig {
            mss: 1316,
            send: SendBufferConfig {
                initial_blocks: 32,
                max_blocks: Some(8192),
                payload_pool_size: 1024,
                input_rate_sampling: true,
            },
            receive: ReceiveBufferConfig {
                capacity: 8192,
                message_mode: true,
            },
            tsbpd: Some(TsbpdConfig {
                delay: Duration::from_millis(120),
                wrap_check_window: Duration::from_secs(30),
            }),
            drift: DriftConfig::default(),
        }
    }

    /// Bulk transfer profile: byte stream semantics, no playout delay, unbounded send buffer
    pub fn default_file() -> BufferConfig {
        BufferConfig {
            mss: 1456,
            send: SendBufferConfig {
                initial_blocks: 32,
                max_blocks: None,
                payload_pool_size: 4096,
                input_rate_sampling: false,
            },
            receive: ReceiveBufferConfig {
                capacity: 8192,
                message_mode: false,
            },
            tsbpd: None,
            drift: DriftConfig::default(),
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.mss == 0 {
            bail!("MSS must be positive");
        }
        if self.send.initial_blocks == 0 {
            bail!("send buffer must have room for at least one block");
        }
        if let Some(max_blocks) = self.send.max_blocks {
            if max_blocks < self.send.initial_blocks {
                bail!("send buffer limit of {} blocks is below its initial size of {}", max_blocks, self.send.initial_blocks);
            }
        }
        if self.receive.capacity < 2 {
            // one slot always stays empty to tell 'full' from 'empty'
            bail!("receive buffer capacity must be at least 2 slots");
        }
        if self.receive.capacity > SEQ_NO_HALF_RANGE {
            bail!("receive buffer capacity {} exceeds the unambiguous sequence number range", self.receive.capacity);
        }
        if let Some(tsbpd) = &self.tsbpd {
            if tsbpd.wrap_check_window.as_micros() * 2 >= u32::MAX as u128 {
                bail!("wrap check window must be less than half the timestamp range");
            }
            if tsbpd.wrap_check_window.is_zero() {
                bail!("wrap check window must be positive");
            }
        }
        self.drift.validate()
    }
}

const SEQ_NO_HALF_RANGE: usize = 0x4000_0000;

pub struct SendBufferConfig {
    /// Number of blocks (i.e. packets) that the send buffer has room for initially. The buffer
    ///  grows by doubling when that is exhausted.
    pub initial_blocks: usize,

    /// Upper bound for the number of unacknowledged blocks. Appending beyond this is reported
    ///  as backpressure rather than growing further.
    pub max_blocks: Option<usize>,

    /// This is the number of payload buffers that are pooled at a given time - buffers in excess
    ///  of this number are discarded when they are returned.
    pub payload_pool_size: usize,

    pub input_rate_sampling: bool,
}

pub struct ReceiveBufferConfig {
    /// number of packet slots in the ring - fixed for the lifetime of the buffer
    pub capacity: usize,

    /// `true` for message (datagram) semantics, `false` for a byte stream
    pub message_mode: bool,
}

#[derive(Clone, Debug)]
pub struct TsbpdConfig {
    /// fixed buffering delay that is added to every packet's playout time
    pub delay: Duration,

    /// Timestamps this close to the 32 bit wrap-around point start a 'wrap check' period
    pub wrap_check_window: Duration,
}

#[derive(Clone, Debug)]
pub struct DriftConfig {
    /// number of samples (i.e. ACKACK round trips) averaged before a correction is considered
    pub max_samples: u32,
    /// average drift (usec) above which the time base is corrected
    pub max_drift_usec: i64,
    /// a single correction bigger than this (usec) is logged as a likely clock anomaly on the peer
    pub anomaly_usec: i64,
}

impl Default for DriftConfig {
    fn default() -> Self {
        DriftConfig {
            max_samples: 1000,
            max_drift_usec: 5000,
            anomaly_usec: 1_000_000,
        }
    }
}

impl DriftConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_samples == 0 {
            bail!("drift tracking needs at least one sample per window");
        }
        if self.max_drift_usec < 0 {
            bail!("drift threshold must not be negative");
        }
        Ok(())
    }
}
