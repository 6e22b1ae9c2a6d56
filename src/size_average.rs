use crate::safe_converter::SafeCast;

/// Moving average of a buffer's size over roughly one second, sampled every 25ms
#[derive(Debug, Default)]
pub(crate) struct SizeAverage {
    last_sampling_time: u64,
    pub packets: u64,
    pub bytes: u64,
    pub timespan_ms: u64,
}

impl SizeAverage {
    const SAMPLING_INTERVAL_MS: u64 = 25;
    const SPAN_MS: u64 = 1000;

    /// Fold in the current size. Calls less than a sampling interval after the previous sample
    ///  are ignored.
    pub fn update(&mut self, now: u64, packets: usize, bytes: usize, timespan_ms: u64) {
        let elapsed_ms = now.saturating_sub(self.last_sampling_time) / 1000;
        if elapsed_ms < Self::SAMPLING_INTERVAL_MS {
            return;
        }

        if elapsed_ms > Self::SPAN_MS {
            // no sample during the last span: restart from the current value
            self.packets = packets.safe_cast();
            self.bytes = bytes.safe_cast();
            self.timespan_ms = timespan_ms;
        }
        else {
            let weighted = |avg: u64, cur: u64| (avg * (Self::SPAN_MS - elapsed_ms) + cur * elapsed_ms) / Self::SPAN_MS;
            self.packets = weighted(self.packets, packets.safe_cast());
            self.bytes = weighted(self.bytes, bytes.safe_cast());
            self.timespan_ms = weighted(self.timespan_ms, timespan_ms);
        }
        self.last_sampling_time = now;
    }
}
