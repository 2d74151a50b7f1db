use std::collections::VecDeque;

/// Byte-capped ring of output chunks.
///
/// Chunks are kept exactly as they were emitted so a replay is the same
/// sequence of writes a live viewer saw. When the total exceeds the cap,
/// whole chunks are dropped from the oldest end; a single chunk larger than
/// the cap keeps only its newest bytes.
#[derive(Debug, Clone)]
pub struct Scrollback {
    chunks: VecDeque<String>,
    bytes: usize,
    capacity: usize,
}

impl Scrollback {
    pub fn new(capacity: usize) -> Self {
        Self {
            chunks: VecDeque::new(),
            bytes: 0,
            capacity,
        }
    }

    pub fn push(&mut self, chunk: &str) {
        if chunk.is_empty() || self.capacity == 0 {
            return;
        }

        let chunk = if chunk.len() > self.capacity {
            tail_at_char_boundary(chunk, self.capacity)
        } else {
            chunk
        };

        self.bytes += chunk.len();
        self.chunks.push_back(chunk.to_string());

        while self.bytes > self.capacity {
            match self.chunks.pop_front() {
                Some(evicted) => self.bytes -= evicted.len(),
                None => break,
            }
        }
    }

    pub fn snapshot(&self) -> Vec<String> {
        self.chunks.iter().cloned().collect()
    }

    pub fn len_bytes(&self) -> usize {
        self.bytes
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    pub fn clear(&mut self) {
        self.chunks.clear();
        self.bytes = 0;
    }
}

fn tail_at_char_boundary(s: &str, max_bytes: usize) -> &str {
    let mut start = s.len() - max_bytes;
    while !s.is_char_boundary(start) {
        start += 1;
    }
    &s[start..]
}
