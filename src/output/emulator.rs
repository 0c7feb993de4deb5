//! Screen model seam and the alacritty-backed implementation.
//!
//! The distributor only needs feed/serialize/resize, so replay tests run
//! against [`MemoryScreen`] while production uses alacritty's grid.

use alacritty_terminal::event::Event as AlacTermEvent;
use alacritty_terminal::grid::Dimensions;
use alacritty_terminal::index::{Column, Line};
use alacritty_terminal::term::{Config as TermConfig, Term};
use alacritty_terminal::vte::ansi::Processor;
use tokio::sync::mpsc::UnboundedSender;

/// Narrow terminal-emulator interface consumed by the output distributor.
pub trait ScreenModel: Send {
    /// Feed raw PTY bytes into the model.
    fn feed(&mut self, bytes: &[u8]);
    /// Render the visible screen as plain text.
    fn serialize_screen(&self) -> String;
    /// Render scrollback plus screen as plain text.
    fn serialize_scrollback(&self) -> String;
    /// Resize the model's grid.
    fn resize(&mut self, cols: u16, rows: u16);
}

/// Bridge from alacritty's event system to our async runtime.
pub struct ScreenEventBridge(pub UnboundedSender<AlacTermEvent>);

impl alacritty_terminal::event::EventListener for ScreenEventBridge {
    fn send_event(&self, event: AlacTermEvent) {
        let _ = self.0.send(event);
    }
}

/// Grid dimensions handed to alacritty.
#[derive(Debug, Clone, Copy)]
struct ScreenSize {
    cols: u16,
    rows: u16,
}

impl Dimensions for ScreenSize {
    fn total_lines(&self) -> usize {
        self.rows as usize
    }

    fn screen_lines(&self) -> usize {
        self.rows as usize
    }

    fn columns(&self) -> usize {
        self.cols as usize
    }

    fn last_column(&self) -> Column {
        Column(self.cols.saturating_sub(1) as usize)
    }

    fn topmost_line(&self) -> Line {
        Line(0)
    }

    fn bottommost_line(&self) -> Line {
        Line(self.rows.saturating_sub(1) as i32)
    }

    fn history_size(&self) -> usize {
        10_000
    }
}

/// alacritty-backed screen model.
pub struct AlacrittyScreen {
    term: Term<ScreenEventBridge>,
    processor: Processor,
    // Bridge events are unused here; the sender must outlive the term.
    _events: tokio::sync::mpsc::UnboundedReceiver<AlacTermEvent>,
}

impl AlacrittyScreen {
    pub fn new(cols: u16, rows: u16) -> Self {
        let (event_tx, event_rx) = tokio::sync::mpsc::unbounded_channel();
        let size = ScreenSize { cols, rows };
        let term = Term::new(TermConfig::default(), &size, ScreenEventBridge(event_tx));
        Self {
            term,
            processor: Processor::default(),
            _events: event_rx,
        }
    }

    fn render_lines(&self, from_line: i32) -> String {
        let grid = self.term.grid();
        let mut output = String::new();
        for line in from_line..=grid.bottommost_line().0 {
            let mut rendered = String::new();
            for col in 0..grid.columns() {
                rendered.push(grid[Line(line)][Column(col)].c);
            }
            output.push_str(rendered.trim_end());
            output.push('\n');
        }
        // Trailing blank rows are grid padding, not content.
        let trimmed = output.trim_end_matches('\n');
        if trimmed.is_empty() {
            String::new()
        } else {
            format!("{}\n", trimmed)
        }
    }
}

impl ScreenModel for AlacrittyScreen {
    fn feed(&mut self, bytes: &[u8]) {
        for byte in bytes {
            self.processor.advance(&mut self.term, *byte);
        }
    }

    fn serialize_screen(&self) -> String {
        self.render_lines(0)
    }

    fn serialize_scrollback(&self) -> String {
        self.render_lines(self.term.grid().topmost_line().0)
    }

    fn resize(&mut self, cols: u16, rows: u16) {
        self.term.resize(ScreenSize { cols, rows });
    }
}

/// In-memory double: accumulates bytes verbatim, screen is the tail lines.
pub struct MemoryScreen {
    rows: u16,
    history: String,
}

impl MemoryScreen {
    pub fn new(rows: u16) -> Self {
        Self {
            rows,
            history: String::new(),
        }
    }
}

impl ScreenModel for MemoryScreen {
    fn feed(&mut self, bytes: &[u8]) {
        self.history.push_str(&String::from_utf8_lossy(bytes));
    }

    fn serialize_screen(&self) -> String {
        let lines: Vec<&str> = self.history.lines().collect();
        let start = lines.len().saturating_sub(self.rows as usize);
        let tail = lines[start..].join("\n");
        if tail.is_empty() {
            String::new()
        } else {
            format!("{}\n", tail)
        }
    }

    fn serialize_scrollback(&self) -> String {
        self.history.clone()
    }

    fn resize(&mut self, _cols: u16, rows: u16) {
        self.rows = rows;
    }
}
