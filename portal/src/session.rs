use portal_feed::DomainEvent;

/// The user the portal acts for.
///
/// Passed explicitly to the commands that need it rather than looked up
/// from ambient storage, so everything that depends on it can be tested
/// without a signed-in identity.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Session {
    account: Option<String>,
    logged_out: bool,
}

impl Session {
    pub fn anonymous() -> Self {
        Self::default()
    }

    pub fn signed_in(account: impl Into<String>) -> Self {
        Self {
            account: Some(account.into()),
            logged_out: false,
        }
    }

    /// Keeps the account id around but stops acting for it.
    pub fn log_out(&mut self) {
        self.logged_out = true;
    }

    /// The active account, `None` when anonymous or logged out.
    pub fn account(&self) -> Option<&str> {
        if self.logged_out {
            return None;
        }
        self.account.as_deref()
    }

    /// Whether the active account authored `event`: uploaded the document
    /// or cast the vote.
    pub fn is_own(&self, event: &DomainEvent) -> bool {
        let Some(account) = self.account() else {
            return false;
        };

        match event {
            DomainEvent::DocumentUploaded(uploaded) => uploaded.uploader == account,
            DomainEvent::DocumentVoted(voted) => voted.voter == account,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use portal_feed::{DocumentUploaded, DocumentVoted};

    fn upload_by(uploader: &str) -> DomainEvent {
        DomainEvent::DocumentUploaded(DocumentUploaded {
            transaction_hash: "tx".to_owned(),
            document_id: "d1".to_owned(),
            uploader: uploader.to_owned(),
            title: "Notes".to_owned(),
            blob_id: "b1".to_owned(),
            category: "Math".to_owned(),
            timestamp: 0,
        })
    }

    fn vote_by(voter: &str) -> DomainEvent {
        DomainEvent::DocumentVoted(DocumentVoted {
            transaction_hash: "tx".to_owned(),
            document_id: "d1".to_owned(),
            voter: voter.to_owned(),
            new_vote_count: 1,
        })
    }

    #[test]
    fn recognises_own_events() {
        let session = Session::signed_in("0xU");

        assert!(session.is_own(&upload_by("0xU")));
        assert!(session.is_own(&vote_by("0xU")));
        assert!(!session.is_own(&upload_by("0xOther")));
    }

    #[test]
    fn logged_out_session_owns_nothing() {
        let mut session = Session::signed_in("0xU");
        session.log_out();

        assert_eq!(session.account(), None);
        assert!(!session.is_own(&upload_by("0xU")));
    }

    #[test]
    fn anonymous_session_owns_nothing() {
        assert!(!Session::anonymous().is_own(&upload_by("")));
    }
}
