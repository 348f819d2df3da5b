/// Round-robin scan position over a fixed-size candidate set.
///
/// The cursor moves only when a candidate actually wins, so a candidate that
/// keeps losing arbitration stays first in line instead of being skipped on
/// the next scan.
#[derive(Debug, Clone)]
pub struct RoundRobinCursor {
    len: usize,
    cursor: usize,
}

impl RoundRobinCursor {
    pub fn new(len: usize) -> Self {
        assert!(len > 0, "arbiter needs at least one candidate");
        Self { len, cursor: 0 }
    }

    /// Candidate indices in priority order, starting at the cursor.
    pub fn scan(&self) -> impl Iterator<Item = usize> + '_ {
        (0..self.len).map(move |i| (self.cursor + i) % self.len)
    }

    pub fn advance_past(&mut self, winner: usize) {
        debug_assert!(winner < self.len);
        self.cursor = (winner + 1) % self.len;
    }

    #[cfg(test)]
    pub fn current(&self) -> usize {
        self.cursor
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scan_starts_at_cursor_and_wraps() {
        let mut rr = RoundRobinCursor::new(4);
        assert_eq!(rr.scan().collect::<Vec<_>>(), vec![0, 1, 2, 3]);
        rr.advance_past(2);
        assert_eq!(rr.scan().collect::<Vec<_>>(), vec![3, 0, 1, 2]);
        rr.advance_past(3);
        assert_eq!(rr.current(), 0);
    }

    #[test]
    fn losers_keep_priority() {
        let mut rr = RoundRobinCursor::new(3);
        // candidate 0 scanned first but not granted; cursor must not move
        let first = rr.scan().next().unwrap();
        assert_eq!(first, 0);
        assert_eq!(rr.scan().next().unwrap(), 0);
        rr.advance_past(0);
        assert_eq!(rr.scan().next().unwrap(), 1);
    }
}
