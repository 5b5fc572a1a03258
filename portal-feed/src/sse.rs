//! Server-sent events framing.
//!
//! Turns the lines of a `text/event-stream` body into messages. Only the
//! `data` and `id` fields are interpreted; everything else, including
//! keep-alive comments, is skipped.

/// One dispatched server-sent event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseMessage {
    /// Last event id announced by the server at the time of dispatch.
    pub id: Option<String>,
    pub data: String,
}

#[derive(Debug, Default)]
pub struct SseParser {
    data: Vec<String>,
    last_event_id: Option<String>,
    rejected: bool,
}

impl SseParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a single line without its terminator.
    ///
    /// Returns a message when the line is the blank line that ends an event
    /// carrying data.
    pub fn push_line(&mut self, line: &str) -> Option<SseMessage> {
        if line.is_empty() {
            return self.dispatch();
        }

        if line.starts_with(':') {
            tracing::trace!("Received event stream keep-alive");
            return None;
        }

        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };

        match field {
            "data" => self.data.push(value.to_owned()),
            "id" if !value.contains('\0') => self.last_event_id = Some(value.to_owned()),
            _ => tracing::trace!(field, "Ignoring event stream field"),
        }

        None
    }

    /// Flush an event that was not terminated by a blank line before the
    /// stream ended.
    pub fn finish(&mut self) -> Option<SseMessage> {
        self.dispatch()
    }

    /// Drop the event currently being read. Data lines up to the next blank
    /// line are discarded instead of dispatched.
    pub fn reject_event(&mut self) {
        self.rejected = true;
    }

    pub fn last_event_id(&self) -> Option<&str> {
        self.last_event_id.as_deref()
    }

    fn dispatch(&mut self) -> Option<SseMessage> {
        if std::mem::take(&mut self.rejected) {
            self.data.clear();
            return None;
        }

        if self.data.is_empty() {
            return None;
        }

        let data = std::mem::take(&mut self.data).join("\n");

        Some(SseMessage {
            id: self.last_event_id.clone(),
            data,
        })
    }
}
