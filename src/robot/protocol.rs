//! Wire protocol spoken with the robot's UI-automation agent.
//!
//! Commands are newline-terminated ASCII lines. Every command gets exactly
//! one reply. Most replies are a single bounded chunk; the full UI dump is
//! streamed in chunks and terminated by an `[END]` line.

use std::fmt;

/// Liveness probe request.
pub const PING: &str = "ping";
/// Liveness probe reply.
pub const PONG: &str = "pong";
/// Request for the serialized UI tree. Replies in chunked mode.
pub const FULL_UI: &str = "getFullUI";
/// Terminates a chunked reply.
pub const END_SENTINEL: &str = "[END]";
/// Scroll the current list forward one page.
pub const SCROLL_FORWARD: &str = "scrollDown";
/// Scroll the current list backward one page.
pub const SCROLL_BACKWARD: &str = "scrollUp";
/// Substring of the agent's reply when a scroll had no effect.
pub const NO_SCROLL_MARKER: &str = "No scrollable";

/// How the reply to a command is framed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyMode {
    /// One bounded read, returned as-is.
    Simple,
    /// Reads until the `[END]` line, peer close, or a read timeout.
    Chunked,
}

/// A request to the agent.
///
/// Commands do not carry session identity. Anything that is not a reserved
/// command is interpreted by the agent as "click the element labelled so".
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    text: String,
    mode: ReplyMode,
}

impl Command {
    /// Builds a command, selecting chunked mode for the UI dump.
    pub fn new(text: impl Into<String>) -> Self {
        let text = text.into();
        let mode = if text == FULL_UI {
            ReplyMode::Chunked
        } else {
            ReplyMode::Simple
        };
        Self { text, mode }
    }

    /// Liveness probe, answered with `pong`.
    pub fn ping() -> Self {
        Self::new(PING)
    }

    /// Full UI dump, chunked until the sentinel.
    pub fn full_ui() -> Self {
        Self::new(FULL_UI)
    }

    /// One scroll step down the list.
    pub fn scroll_forward() -> Self {
        Self::new(SCROLL_FORWARD)
    }

    /// One scroll step back up.
    pub fn scroll_backward() -> Self {
        Self::new(SCROLL_BACKWARD)
    }

    /// Clicks the element whose label equals `label`.
    pub fn activate(label: &str) -> Self {
        Self::new(label)
    }

    /// Command text without the line terminator.
    pub fn text(&self) -> &str {
        &self.text
    }

    /// How the reply is framed.
    pub fn mode(&self) -> ReplyMode {
        self.mode
    }

    /// Bytes written to the socket.
    pub fn to_line(&self) -> Vec<u8> {
        let mut line = Vec::with_capacity(self.text.len() + 1);
        line.extend_from_slice(self.text.as_bytes());
        line.push(b'\n');
        line
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text)
    }
}

/// True when a probe reply is a valid `pong`.
pub fn is_pong(reply: &str) -> bool {
    reply.trim() == PONG
}

/// True when a scroll reply says there was nothing to scroll.
pub fn is_scroll_exhausted(reply: &str) -> bool {
    reply.contains(NO_SCROLL_MARKER)
}

/// Splits accumulated chunked data at the sentinel line.
///
/// Returns the payload before the sentinel once a line consisting of `[END]`
/// has been received, or `None` while more data is expected.
pub fn split_at_sentinel(buffer: &str) -> Option<&str> {
    let mut offset = 0;
    for line in buffer.split_inclusive('\n') {
        if line.trim() == END_SENTINEL {
            return Some(&buffer[..offset]);
        }
        offset += line.len();
    }
    None
}
