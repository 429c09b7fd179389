use std::fmt::Write;

/// Line-oriented logger shared by the runners.
///
/// Level 1 carries warnings, level 2 progress of the recovery loop. Each
/// line goes to the in-memory buffer and/or stderr, depending on the level
/// it was started with.
pub struct Logger {
    buffer_level: u32,
    stderr_level: u32,
    buffer: String,
    // level of the line being written
    line_level: u32,
    num_warnings: usize,
}

impl Clone for Logger {
    fn clone(&self) -> Self {
        Self {
            buffer_level: self.buffer_level,
            stderr_level: self.stderr_level,
            buffer: String::new(),
            line_level: 2,
            num_warnings: 0,
        }
    }
}

impl Default for Logger {
    fn default() -> Self {
        Logger::new(0, 1)
    }
}

impl Logger {
    pub fn new(buffer_level: u32, stderr_level: u32) -> Self {
        Self {
            buffer_level,
            stderr_level,
            buffer: String::new(),
            line_level: 2,
            num_warnings: 0,
        }
    }

    /// Logger that records everything in its buffer and prints nothing.
    pub fn buffered() -> Self {
        Logger::new(2, 0)
    }

    #[inline(always)]
    pub fn level_enabled(&self, level: u32) -> bool {
        level <= self.buffer_level.max(self.stderr_level)
    }

    pub fn buffer_level(&self) -> u32 {
        self.buffer_level
    }

    pub fn stderr_level(&self) -> u32 {
        self.stderr_level
    }

    pub fn set_buffer_level(&mut self, level: u32) {
        self.buffer_level = level;
    }

    pub fn set_stderr_level(&mut self, level: u32) {
        self.stderr_level = level;
    }

    pub fn info_logger(&mut self) -> &mut Self {
        self.line_level = 2;
        self
    }

    pub fn warning_logger(&mut self) -> &mut Self {
        self.line_level = 1;
        self
    }

    /// Starts a warning line with `prefix`.
    pub fn write_warning(&mut self, prefix: &str) {
        self.num_warnings += 1;
        let _ = self.warning_logger().write_str(prefix);
    }

    pub fn warn(&mut self, s: &str) {
        if self.level_enabled(1) {
            self.write_warning("Warning: ");
            let _ = writeln!(self.warning_logger(), "{s}");
        }
    }

    pub fn info(&mut self, s: &str) {
        if self.level_enabled(2) {
            let _ = writeln!(self.info_logger(), "{s}");
        }
    }

    pub fn num_warnings(&self) -> usize {
        self.num_warnings
    }

    pub fn get_buffer(&self) -> &str {
        &self.buffer
    }

    pub fn get_and_clear_logs(&mut self) -> String {
        std::mem::take(&mut self.buffer)
    }
}

impl Write for Logger {
    fn write_str(&mut self, s: &str) -> std::fmt::Result {
        if self.line_level <= self.buffer_level {
            self.buffer.push_str(s);
        }
        if self.line_level <= self.stderr_level {
            eprint!("{}", s);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_levels_route_lines() {
        let mut logger = Logger::new(1, 0);
        logger.info("progress");
        logger.warn("careful");
        assert_eq!(logger.get_buffer(), "Warning: careful\n");
        assert_eq!(logger.num_warnings(), 1);

        let mut logger = Logger::buffered();
        logger.info("progress");
        assert_eq!(logger.get_and_clear_logs(), "progress\n");
        assert_eq!(logger.get_buffer(), "");
    }

    #[test]
    fn test_default_is_quiet() {
        let logger = Logger::default();
        assert!(logger.level_enabled(1));
        assert!(!logger.level_enabled(2));
    }

    #[test]
    fn test_clone_drops_logs() {
        let mut logger = Logger::buffered();
        logger.info("x");
        assert_eq!(logger.clone().get_buffer(), "");
    }
}
