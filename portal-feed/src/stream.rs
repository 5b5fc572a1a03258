use crate::event::StreamEvent;
use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use futures::StreamExt;
use reqwest::Client;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use url::Url;

pub const DEFAULT_INITIAL_BACKOFF: Duration = Duration::from_millis(1000);
pub const DEFAULT_MAX_BACKOFF: Duration = Duration::from_millis(30_000);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamConfig {
    pub url: Url,
    /// Without a key the client stays disconnected.
    pub api_key: Option<String>,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl StreamConfig {
    pub fn new(url: Url, api_key: Option<String>) -> Self {
        Self {
            url,
            api_key,
            initial_backoff: DEFAULT_INITIAL_BACKOFF,
            max_backoff: DEFAULT_MAX_BACKOFF,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ConnectionStatus {
    pub state: ConnectionState,
    /// Number of reconnects scheduled since the last successful open.
    pub attempt: u64,
    pub last_error: Option<String>,
}

/// Receives everything a live connection produces.
///
/// Callbacks run on the connection task while the client holds its delivery
/// lock, so they must not block for long.
pub trait StreamHandler: Send + Sync + 'static {
    fn on_event(&self, event: StreamEvent);

    fn on_error(&self, _error: &Error) {}
}

impl<F> StreamHandler for F
where
    F: Fn(StreamEvent) + Send + Sync + 'static,
{
    fn on_event(&self, event: StreamEvent) {
        self(event)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("The event stream server closed the connection")]
    ConnectionClosed,
    #[error("Failed to open event stream: {0}")]
    Http(#[from] reqwest::Error),
    #[error("Failed to read from event stream: {0}")]
    Read(#[from] std::io::Error),
}

/// Client for the document notification stream.
///
/// Owns at most one connection at a time. A failed connection is retried
/// forever with exponential backoff until [`EventStreamClient::disconnect`]
/// is called or the client is dropped. Progress is published as
/// [`ConnectionStatus`] snapshots through a watch channel.
pub struct EventStreamClient {
    config: StreamConfig,
    http: Client,
    shared: Arc<Shared>,
    task: Option<JoinHandle<()>>,
}

impl EventStreamClient {
    pub fn new(config: StreamConfig, handler: impl StreamHandler) -> Self {
        Self::new_with_client(config, Client::new(), handler)
    }

    pub fn new_with_client(config: StreamConfig, http: Client, handler: impl StreamHandler) -> Self {
        let (status, _) = watch::channel(ConnectionStatus::default());

        Self {
            config,
            http,
            shared: Arc::new(Shared {
                generation: Mutex::new(0),
                status,
                handler: Arc::new(handler),
            }),
            task: None,
        }
    }

    /// Open the stream unless a connection task is already running.
    ///
    /// Must be called from within a tokio runtime.
    pub fn connect(&mut self) {
        if self.is_live() {
            tracing::debug!("Event stream connection already running");
            return;
        }

        let Some(api_key) = self.config.api_key.clone() else {
            tracing::info!("No event stream API key configured, live updates are disabled");
            self.shared.status.send_modify(|status| {
                status.state = ConnectionState::Disconnected;
            });
            return;
        };

        let generation = self.shared.current_generation();
        self.shared.update(generation, |status| {
            status.state = ConnectionState::Connecting;
        });

        let connection = Connection {
            shared: self.shared.clone(),
            http: self.http.clone(),
            url: self.config.url.clone(),
            api_key,
            generation,
            backoff: reconnect_backoff(self.config.initial_backoff, self.config.max_backoff),
        };

        self.task = Some(tokio::spawn(connection.run()));
    }

    /// Close the stream and cancel any pending reconnect.
    ///
    /// Once this returns, the handler is not called again for the closed
    /// connection.
    pub fn disconnect(&mut self) {
        self.shared.invalidate();

        if let Some(task) = self.task.take() {
            task.abort();
            tracing::debug!("Event stream connection closed");
        }

        self.shared.status.send_modify(|status| {
            status.state = ConnectionState::Disconnected;
            status.attempt = 0;
        });
    }

    /// Replace the API key. A running connection is restarted with the new
    /// key; without a key it stays closed.
    pub fn set_api_key(&mut self, api_key: Option<String>) {
        if self.config.api_key == api_key {
            return;
        }

        let was_live = self.is_live();
        self.disconnect();
        self.config.api_key = api_key;

        if was_live {
            self.connect();
        }
    }

    pub fn is_live(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }

    pub fn status(&self) -> ConnectionStatus {
        self.shared.status.borrow().clone()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.shared.status.subscribe()
    }

    pub fn config(&self) -> &StreamConfig {
        &self.config
    }
}

impl Drop for EventStreamClient {
    fn drop(&mut self) {
        self.shared.invalidate();

        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// Backoff schedule between reconnects: `initial * 2^attempt`, capped at `max`.
pub fn reconnect_backoff(initial: Duration, max: Duration) -> ExponentialBackoff {
    ExponentialBackoff {
        current_interval: initial,
        initial_interval: initial,
        randomization_factor: 0.0,
        multiplier: 2.0,
        max_interval: max,
        // We never give up on reconnecting
        max_elapsed_time: None,
        ..ExponentialBackoff::default()
    }
}

/// State shared between the client and its connection task.
///
/// Every connection task is tagged with the generation that was current when
/// it was spawned. Status updates and handler calls only go through while
/// that generation is still current, and both happen under the generation
/// lock. Bumping the generation therefore fences off a task even before the
/// abort has taken effect.
struct Shared {
    generation: Mutex<u64>,
    status: watch::Sender<ConnectionStatus>,
    handler: Arc<dyn StreamHandler>,
}

impl Shared {
    fn current_generation(&self) -> u64 {
        *self.generation.lock().expect("generation lock poisoned")
    }

    fn invalidate(&self) {
        *self.generation.lock().expect("generation lock poisoned") += 1;
    }

    fn is_current(&self, generation: u64) -> bool {
        self.current_generation() == generation
    }

    /// Run `f` while holding the generation lock, if `generation` is current.
    fn with_current<R>(&self, generation: u64, f: impl FnOnce() -> R) -> Option<R> {
        let current = self.generation.lock().expect("generation lock poisoned");

        (*current == generation).then(f)
    }

    fn update(&self, generation: u64, f: impl FnOnce(&mut ConnectionStatus)) -> Option<()> {
        self.with_current(generation, || self.status.send_modify(f))
    }

    fn deliver(&self, generation: u64, event: StreamEvent) -> Option<()> {
        self.with_current(generation, || self.handler.on_event(event))
    }

    fn fail(&self, generation: u64, error: &Error, attempt: u64) -> Option<()> {
        self.with_current(generation, || {
            self.status.send_modify(|status| {
                status.state = ConnectionState::Error;
                status.attempt = attempt;
                status.last_error = Some(error.to_string());
            });
            self.handler.on_error(error);
        })
    }
}

struct Connection {
    shared: Arc<Shared>,
    http: Client,
    url: Url,
    api_key: String,
    generation: u64,
    backoff: ExponentialBackoff,
}

impl Connection {
    async fn run(mut self) {
        let mut attempt = 0u64;
        let mut last_event_id: Option<String> = None;

        loop {
            if self
                .shared
                .update(self.generation, |status| {
                    status.state = ConnectionState::Connecting;
                })
                .is_none()
            {
                return;
            }

            let url = stream_url(&self.url, &self.api_key, last_event_id.as_deref());

            let error = match connection::new(&self.http, url).await {
                Ok(mut messages) => {
                    self.backoff.reset();
                    attempt = 0;

                    let opened = self.shared.update(self.generation, |status| {
                        status.state = ConnectionState::Connected;
                        status.attempt = 0;
                        status.last_error = None;
                    });
                    if opened.is_none() {
                        return;
                    }
                    tracing::info!("Connected to document event stream");

                    loop {
                        let message = match messages.next().await {
                            Some(Ok(message)) => message,
                            Some(Err(error)) => break error,
                            None => break Error::ConnectionClosed,
                        };

                        if message.id.is_some() {
                            last_event_id = message.id.clone();
                        }

                        match serde_json::from_str::<StreamEvent>(&message.data) {
                            Ok(event) => {
                                if self.shared.deliver(self.generation, event).is_none() {
                                    return;
                                }
                            }
                            Err(error) => {
                                tracing::warn!(%error, "Failed to deserialize event stream message '{}'", message.data);
                            }
                        }
                    }
                }
                Err(error) => error,
            };

            let delay = self
                .backoff
                .next_backoff()
                .unwrap_or(self.backoff.max_interval);
            attempt = attempt.saturating_add(1);

            if self.shared.fail(self.generation, &error, attempt).is_none() {
                return;
            }
            tracing::info!(%error, attempt, "Event stream connection failed, retrying in {}ms", delay.as_millis());

            tokio::time::sleep(delay).await;

            if !self.shared.is_current(self.generation) {
                tracing::debug!("Client was disabled while waiting, not reconnecting");
                return;
            }
        }
    }
}

fn stream_url(base: &Url, api_key: &str, last_event_id: Option<&str>) -> Url {
    let mut url = base.clone();

    {
        let mut query = url.query_pairs_mut();
        query.append_pair("apiKey", api_key);
        if let Some(id) = last_event_id {
            query.append_pair("lastEventId", id);
        }
    }

    url
}

/// Event stream connection module.
///
/// Responsible for opening the HTTP stream and turning the response body
/// into a stream of server-sent event messages. The stream ends with an
/// error or simply ends when the server hangs up. A single undecodable line
/// only drops the event it belongs to.
mod connection {
    use super::Error;
    use crate::sse::{SseMessage, SseParser};
    use bytes::{Buf, BytesMut};
    use futures::stream::{self, BoxStream};
    use futures::{StreamExt, TryStreamExt};
    use reqwest::header::ACCEPT;
    use reqwest::Client;
    use std::io;
    use tokio_util::codec::{Decoder, FramedRead};
    use tokio_util::io::StreamReader;
    use url::Url;

    const MAX_LINE_LENGTH: usize = 1024 * 1024;

    pub async fn new(
        http: &Client,
        url: Url,
    ) -> Result<BoxStream<'static, Result<SseMessage, Error>>, Error> {
        let response = http
            .get(url)
            .header(ACCEPT, "text/event-stream")
            .send()
            .await?
            .error_for_status()?;

        let body = response
            .bytes_stream()
            .map_err(|err| io::Error::new(io::ErrorKind::Other, err));
        let lines = FramedRead::new(StreamReader::new(body), LineDecoder::new(MAX_LINE_LENGTH));

        let messages = stream::unfold(Some((lines, SseParser::new())), |state| async move {
            let (mut lines, mut parser) = state?;

            loop {
                match lines.next().await {
                    Some(Ok(Line::Text(line))) => {
                        if let Some(message) = parser.push_line(&line) {
                            return Some((Ok(message), Some((lines, parser))));
                        }
                    }
                    Some(Ok(Line::Invalid(reason))) => {
                        tracing::warn!(reason, "Dropping event with undecodable line");
                        parser.reject_event();
                    }
                    Some(Err(error)) => return Some((Err(Error::from(error)), None)),
                    None => return parser.finish().map(|message| (Ok(message), None)),
                }
            }
        })
        .boxed();

        Ok(messages)
    }

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub(super) enum Line {
        Text(String),
        /// The line was skipped because it could not be used.
        Invalid(&'static str),
    }

    /// Splits the body on `\n`, dropping a trailing `\r`.
    ///
    /// Unlike `LinesCodec`, a line that is not UTF-8 or is longer than
    /// `max_length` does not end the stream. It is reported as
    /// [`Line::Invalid`] and decoding carries on after its terminator.
    #[derive(Debug)]
    pub(super) struct LineDecoder {
        max_length: usize,
        next_index: usize,
        discarding: bool,
    }

    impl LineDecoder {
        pub(super) fn new(max_length: usize) -> Self {
            Self {
                max_length,
                next_index: 0,
                discarding: false,
            }
        }

        fn text(line: &[u8]) -> Line {
            let line = line.strip_suffix(b"\r").unwrap_or(line);

            match std::str::from_utf8(line) {
                Ok(text) => Line::Text(text.to_owned()),
                Err(_) => Line::Invalid("not valid UTF-8"),
            }
        }
    }

    impl Decoder for LineDecoder {
        type Item = Line;
        type Error = io::Error;

        fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Line>, io::Error> {
            loop {
                let read_to = buf.len().min(self.max_length.saturating_add(1));
                let newline = buf[self.next_index..read_to]
                    .iter()
                    .position(|byte| *byte == b'\n');

                match (self.discarding, newline) {
                    (true, Some(offset)) => {
                        buf.advance(self.next_index + offset + 1);
                        self.next_index = 0;
                        self.discarding = false;
                        return Ok(Some(Line::Invalid("line too long")));
                    }
                    (true, None) => {
                        buf.advance(read_to);
                        self.next_index = 0;
                        if buf.is_empty() {
                            return Ok(None);
                        }
                    }
                    (false, Some(offset)) => {
                        let end = self.next_index + offset;
                        self.next_index = 0;
                        let line = buf.split_to(end + 1);
                        return Ok(Some(Self::text(&line[..end])));
                    }
                    (false, None) if buf.len() > self.max_length => {
                        self.next_index = 0;
                        self.discarding = true;
                    }
                    (false, None) => {
                        self.next_index = read_to;
                        return Ok(None);
                    }
                }
            }
        }

        fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<Line>, io::Error> {
            if let Some(line) = self.decode(buf)? {
                return Ok(Some(line));
            }

            self.next_index = 0;

            if self.discarding {
                self.discarding = false;
                buf.clear();
                return Ok(Some(Line::Invalid("line too long")));
            }

            if buf.is_empty() {
                return Ok(None);
            }

            let line = buf.split_to(buf.len());
            Ok(Some(Self::text(&line)))
        }
    }

}
