use std::sync::Mutex;
use tracing::{debug, trace};
use crate::buffers::fixed_buffer::FixedBuf;
use crate::error::BufferError;

/// Pool of MSS-sized payload buffers. Blocks take their storage from here when data is appended
///  and give it back when they are acknowledged or dropped, so steady-state operation does not
///  allocate.
///
/// The pool has its own lock, separate from the send buffer's structural lock: filling a buffer
///  with application data happens between taking it from the pool and linking it into the block
///  chain, without holding either lock.
pub struct PayloadPool {
    buf_size: usize,
    buffers: Mutex<Vec<FixedBuf>>,
}

impl PayloadPool {
    pub fn new(buf_size: usize, max_pool_size: usize) -> Self {
        PayloadPool {
            buf_size,
            buffers: Mutex::new(Vec::with_capacity(max_pool_size)),
        }
    }

    pub fn buf_size(&self) -> usize {
        self.buf_size
    }

    pub fn get_from_pool(&self) -> Result<FixedBuf, BufferError> {
        {
            let mut buffers = self.buffers.lock().unwrap();
            if let Some(buffer) = buffers.pop() {
                trace!("returning payload buffer from pool");
                return Ok(buffer);
            }
        }

        debug!("no payload buffer in pool: creating new buffer");
        FixedBuf::try_new(self.buf_size)
            .map_err(|_| BufferError::AllocationFailure { requested: 1 })
    }

    pub fn return_to_pool(&self, mut buffer: FixedBuf) {
        assert_eq!(buffer.capacity(), self.buf_size,
                   "returned buffer does not have the regular capacity of {} bytes"
                   , self.buf_size);

        buffer.clear();

        let mut buffers = self.buffers.lock().unwrap();
        if buffers.capacity() > buffers.len() {
            trace!("returning payload buffer to pool");
            buffers.push(buffer);
        }
        else {
            debug!("payload pool is full: discarding returned buffer");
        }
    }

    #[cfg(test)]
    pub fn num_pooled(&self) -> usize {
        self.buffers.lock().unwrap().len()
    }
}
