use crate::config::Stream;
use crate::session::Session;
use anyhow::{Context, Result};
use portal_feed::{
    ConnectionState, ConnectionStatus, DocumentEventReducer, DomainEvent, EventStreamClient,
};
use std::fmt;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

/// Something worth telling the user about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub event: DomainEvent,
    /// The signed-in account authored the event.
    pub own: bool,
}

impl fmt::Display for Notification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.event, self.own) {
            (DomainEvent::DocumentUploaded(uploaded), true) => write!(
                f,
                "Your document \"{}\" is now listed in {} (blob {})",
                uploaded.title, uploaded.category, uploaded.blob_id
            ),
            (DomainEvent::DocumentUploaded(uploaded), false) => write!(
                f,
                "New document \"{}\" in {} by {}",
                uploaded.title, uploaded.category, uploaded.uploader
            ),
            (DomainEvent::DocumentVoted(voted), true) => write!(
                f,
                "Your vote on document {} was counted ({} votes)",
                voted.document_id, voted.new_vote_count
            ),
            (DomainEvent::DocumentVoted(voted), false) => write!(
                f,
                "Document {} now has {} votes",
                voted.document_id, voted.new_vote_count
            ),
        }
    }
}

/// A stream client wired to a reducer.
///
/// Every classified event that gets past the warm-up is sent to the
/// notification channel, tagged with whether the session's account
/// authored it.
pub struct Feed {
    client: EventStreamClient,
    reducer: Arc<Mutex<DocumentEventReducer>>,
}

impl Feed {
    pub fn new(
        stream: &Stream,
        session: Session,
        notifications: mpsc::UnboundedSender<Notification>,
    ) -> Self {
        let notify = move |event: DomainEvent| {
            let own = session.is_own(&event);
            let _ = notifications.send(Notification { event, own });
        };
        let notify_upload = notify.clone();
        let notify_vote = notify;

        let reducer = DocumentEventReducer::new(stream.reducer_config())
            .on_document_uploaded(move |uploaded| {
                notify_upload(DomainEvent::DocumentUploaded(uploaded.clone()))
            })
            .on_document_voted(move |voted| {
                notify_vote(DomainEvent::DocumentVoted(voted.clone()))
            });
        let reducer = Arc::new(Mutex::new(reducer));

        let client = EventStreamClient::new(stream.stream_config(), {
            let reducer = reducer.clone();
            move |event| {
                reducer
                    .lock()
                    .expect("reducer lock poisoned")
                    .handle(event);
            }
        });

        Self { client, reducer }
    }

    pub fn connect(&mut self) {
        self.client.connect();
    }

    pub fn disconnect(&mut self) {
        self.client.disconnect();
    }

    pub fn is_live(&self) -> bool {
        self.client.is_live()
    }

    pub fn subscribe_status(&self) -> tokio::sync::watch::Receiver<ConnectionStatus> {
        self.client.subscribe_status()
    }

    /// Recent events, newest first.
    pub fn history(&self) -> Vec<DomainEvent> {
        self.reducer
            .lock()
            .expect("reducer lock poisoned")
            .history()
            .cloned()
            .collect()
    }
}

/// Print notifications until interrupted with ctrl-c.
pub async fn watch(stream: &Stream, session: Session) -> Result<()> {
    let (tx, mut notifications) = mpsc::unbounded_channel();
    let mut feed = Feed::new(stream, session, tx);

    feed.connect();
    if !feed.is_live() {
        tracing::warn!(
            "Set `stream.api_key` in the config file or PORTAL_STREAM__API_KEY to receive live updates"
        );
        return Ok(());
    }

    let mut status = feed.subscribe_status();

    loop {
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                result.context("Failed to listen for ctrl-c")?;
                break;
            }
            Some(notification) = notifications.recv() => {
                println!("{}", notification);
            }
            changed = status.changed() => {
                if changed.is_err() {
                    break;
                }
                let status = status.borrow_and_update().clone();
                log_status(&status);
            }
        }
    }

    feed.disconnect();
    tracing::info!(recent_events = feed.history().len(), "Stopped watching");

    Ok(())
}

fn log_status(status: &ConnectionStatus) {
    match status.state {
        ConnectionState::Connected => tracing::info!("Live updates connected"),
        ConnectionState::Connecting => tracing::debug!(attempt = status.attempt, "Connecting"),
        ConnectionState::Error => tracing::warn!(
            attempt = status.attempt,
            error = status.last_error.as_deref().unwrap_or("unknown"),
            "Live updates interrupted"
        ),
        ConnectionState::Disconnected => tracing::info!("Live updates disconnected"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Server;
    use portal_feed::{DocumentUploaded, DocumentVoted};
    use std::time::Duration;
    use tokio::time::timeout;
    use url::Url;

    const UPLOADED: &str = r#"{"kind":"package_event","timestampMs":"1700000000000","transactionHash":"tx-1","payload":{"eventType":"0xP::document_system::DocumentUploaded","sender":"0xU","fields":{"document_id":"d1","uploader":"0xU","title":"Notes","walrus_blob_id":"b1","category":"Math"}}}"#;
    const VOTED: &str = r#"{"kind":"package_event","timestampMs":"1700000001000","transactionHash":"tx-2","payload":{"eventType":"0xP::document_system::DocumentVoted","sender":"0xV","fields":{"document_id":"d1","voter":"0xV","new_vote_count":"1"}}}"#;
    const FOREIGN: &str = r#"{"kind":"package_event","timestampMs":"1","transactionHash":"tx-3","payload":{"eventType":"0xQ::document_system::DocumentVoted","fields":{}}}"#;

    fn stream(url: Url) -> Stream {
        Stream {
            url,
            api_key: Some("secret".to_owned()),
            package_id: "0xP".to_owned(),
            warm_up_ms: 0,
            initial_backoff_ms: 60_000,
            max_backoff_ms: 60_000,
        }
    }

    async fn next(rx: &mut mpsc::UnboundedReceiver<Notification>) -> Notification {
        timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for notification")
            .expect("feed dropped")
    }

    #[tokio::test]
    async fn feed_notifies_once_per_transaction() {
        let mut server = Server::new_async().await;
        let body = format!(
            "data: {UPLOADED}\n\ndata: {UPLOADED}\n\ndata: {FOREIGN}\n\ndata: {VOTED}\n\n"
        );
        let mock = server
            .mock("GET", "/events")
            .match_query(mockito::Matcher::Any)
            .with_header("content-type", "text/event-stream")
            .with_body(body)
            .expect_at_least(1)
            .create_async()
            .await;

        let url = Url::parse(&format!("{}/events", server.url())).unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut feed = Feed::new(&stream(url), Session::signed_in("0xU"), tx);
        feed.connect();

        let first = next(&mut rx).await;
        let second = next(&mut rx).await;
        feed.disconnect();

        assert_eq!(
            first,
            Notification {
                event: DomainEvent::DocumentUploaded(DocumentUploaded {
                    transaction_hash: "tx-1".to_owned(),
                    document_id: "d1".to_owned(),
                    uploader: "0xU".to_owned(),
                    title: "Notes".to_owned(),
                    blob_id: "b1".to_owned(),
                    category: "Math".to_owned(),
                    timestamp: 1_700_000_000_000,
                }),
                own: true,
            }
        );
        assert_eq!(
            second,
            Notification {
                event: DomainEvent::DocumentVoted(DocumentVoted {
                    transaction_hash: "tx-2".to_owned(),
                    document_id: "d1".to_owned(),
                    voter: "0xV".to_owned(),
                    new_vote_count: 1,
                }),
                own: false,
            }
        );
        assert!(rx.try_recv().is_err());

        let history = feed.history();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].transaction_hash(), "tx-2");
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn watch_without_api_key_returns_immediately() {
        let mut config = stream(Url::parse("http://127.0.0.1:1/events").unwrap());
        config.api_key = None;

        timeout(Duration::from_secs(5), watch(&config, Session::anonymous()))
            .await
            .unwrap()
            .unwrap();
    }

    #[test]
    fn notification_wording_depends_on_ownership() {
        let voted = DomainEvent::DocumentVoted(DocumentVoted {
            transaction_hash: "tx".to_owned(),
            document_id: "d9".to_owned(),
            voter: "0xV".to_owned(),
            new_vote_count: 4,
        });

        let own = Notification {
            event: voted.clone(),
            own: true,
        };
        let other = Notification {
            event: voted,
            own: false,
        };

        assert_eq!(own.to_string(), "Your vote on document d9 was counted (4 votes)");
        assert_eq!(other.to_string(), "Document d9 now has 4 votes");
    }
}
