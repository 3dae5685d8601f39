//! Carriage-return progress line on stdout.
//!
//! Log lines go to stderr, the progress line owns stdout: the two never
//! interleave on one line. The line re-renders at most once per second.

use std::io::{self, Write};
use std::time::Instant;

pub struct Progress {
    total: usize,
    processed: usize,
    enabled: bool,
    start: Instant,
    last_render: Instant,
    last_width: usize,
}

impl Progress {
    pub fn new(total: usize, enabled: bool) -> Self {
        let now = Instant::now();
        Self {
            total,
            processed: 0,
            enabled,
            start: now,
            last_render: now,
            last_width: 0,
        }
    }

    /// Count one processed record; re-renders when a second has passed.
    pub fn tick(&mut self) {
        self.processed += 1;
        if !self.enabled {
            return;
        }
        let now = Instant::now();
        if now.duration_since(self.last_render).as_secs() >= 1 || self.processed == self.total {
            self.last_render = now;
            self.render();
        }
    }

    fn render(&mut self) {
        let elapsed = self.start.elapsed().as_secs();
        let remaining = if self.processed > 0 {
            (self.total.saturating_sub(self.processed) as u64 * self.start.elapsed().as_secs())
                / self.processed as u64
        } else {
            0
        };

        let width = self.total.to_string().len();
        let line = format!(
            "{:>width$}/{} {}:{:02} ETA: {}:{:02}",
            self.processed,
            self.total,
            elapsed / 60,
            elapsed % 60,
            remaining / 60,
            remaining % 60,
        );

        let mut stdout = io::stdout().lock();
        let _ = write!(stdout, "\r{line:<pad$}", pad = self.last_width.max(line.len()));
        let _ = stdout.flush();
        self.last_width = line.len();
    }

    /// Finish the line so following output starts clean.
    pub fn finish(&mut self) {
        if self.enabled && self.last_width > 0 {
            let mut stdout = io::stdout().lock();
            let _ = writeln!(stdout);
            let _ = stdout.flush();
        }
    }

    pub fn processed(&self) -> usize {
        self.processed
    }
}
