use std::collections::VecDeque;
use std::sync::{mpsc, Arc};

use hiddenclick_core::scheduler::Scheduler;
use hiddenclick_core::types::{Command, TargetStatus};

/// Lines kept for the log pane; older ones are dropped.
pub const LOG_CAPACITY: usize = 5000;

/// Newest-last log lines with a scroll offset from the bottom.
pub struct LogBuffer {
    lines: VecDeque<String>,
    capacity: usize,
    scroll: usize, // 0 = latest
}

impl LogBuffer {
    pub fn new(capacity: usize) -> Self {
        Self { lines: VecDeque::new(), capacity: capacity.max(1), scroll: 0 }
    }

    pub fn push(&mut self, line: String) {
        if self.lines.len() == self.capacity {
            self.lines.pop_front();
        }
        self.lines.push_back(line);
        self.scroll = self.scroll.min(self.lines.len().saturating_sub(1));
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    pub fn scroll(&self) -> usize {
        self.scroll
    }

    pub fn scroll_up(&mut self, n: usize) {
        self.scroll = self.scroll.saturating_add(n).min(self.lines.len().saturating_sub(1));
    }

    pub fn scroll_down(&mut self, n: usize) {
        self.scroll = self.scroll.saturating_sub(n);
    }

    /// The lines that fill `height` rows at the current scroll position.
    pub fn visible(&self, height: usize) -> impl Iterator<Item = &String> {
        let total = self.lines.len();
        let scroll = self.scroll.min(total.saturating_sub(height));
        let start = total.saturating_sub(height + scroll);
        let end = total.saturating_sub(scroll);
        self.lines.range(start..end)
    }
}

pub struct App {
    pub scheduler: Arc<Scheduler>,
    /// One line per top-level action, shown under the target list.
    pub actions: Vec<String>,
    pub selected: usize,
    pub log_visible: bool,
    pub logs: LogBuffer,
    pub log_rx: mpsc::Receiver<String>,
    pub cmd_tx: mpsc::Sender<Command>,
    pub should_quit: bool,
}

impl App {
    pub fn new(
        scheduler: Arc<Scheduler>,
        actions: Vec<String>,
        log_rx: mpsc::Receiver<String>,
        cmd_tx: mpsc::Sender<Command>,
    ) -> Self {
        Self {
            scheduler,
            actions,
            selected: 0,
            log_visible: true,
            logs: LogBuffer::new(LOG_CAPACITY),
            log_rx,
            cmd_tx,
            should_quit: false,
        }
    }

    pub fn targets(&self) -> Vec<TargetStatus> {
        self.scheduler.targets()
    }

    pub fn drain_logs(&mut self) {
        while let Ok(msg) = self.log_rx.try_recv() {
            self.logs.push(msg);
        }
    }

    pub fn scroll_log_up(&mut self, n: usize) {
        self.logs.scroll_up(n);
    }

    pub fn scroll_log_down(&mut self, n: usize) {
        self.logs.scroll_down(n);
    }

    pub fn move_up(&mut self) {
        if self.selected > 0 {
            self.selected -= 1;
        }
    }

    pub fn move_down(&mut self) {
        let len = self.targets().len();
        if self.selected + 1 < len {
            self.selected += 1;
        }
    }

    pub fn start(&mut self) {
        self.cmd_tx.send(Command::Start).ok();
    }

    pub fn pause_all(&mut self) {
        self.cmd_tx.send(Command::PauseAll).ok();
    }

    pub fn resume_all(&mut self) {
        self.cmd_tx.send(Command::ResumeAll).ok();
    }

    pub fn toggle_selected(&mut self) {
        self.cmd_tx.send(Command::Toggle(self.selected)).ok();
    }

    pub fn toggle_log(&mut self) {
        self.log_visible = !self.log_visible;
    }

    pub fn quit(&mut self) {
        self.cmd_tx.send(Command::Quit).ok();
        self.should_quit = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filled(capacity: usize, count: usize) -> LogBuffer {
        let mut logs = LogBuffer::new(capacity);
        for i in 0..count {
            logs.push(format!("line {}", i));
        }
        logs
    }

    #[test]
    fn oldest_lines_are_dropped() {
        let logs = filled(3, 10);
        assert_eq!(logs.len(), 3);
        let shown: Vec<&String> = logs.visible(10).collect();
        assert_eq!(shown, vec!["line 7", "line 8", "line 9"]);
    }

    #[test]
    fn scroll_stays_within_buffer() {
        let mut logs = filled(4, 4);
        logs.scroll_up(100);
        assert_eq!(logs.scroll(), 3);
        assert_eq!(logs.visible(1).collect::<Vec<_>>(), vec!["line 0"]);
        logs.scroll_down(1);
        assert_eq!(logs.visible(2).collect::<Vec<_>>(), vec!["line 0", "line 1"]);
        logs.scroll_down(100);
        assert_eq!(logs.visible(1).collect::<Vec<_>>(), vec!["line 3"]);
    }
}
