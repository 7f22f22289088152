//! Transaction origin tags.
//!
//! An origin is attached to a transaction when it is produced and is only
//! read back by local observers to tell their own echoes apart from genuine
//! remote changes. It is never persisted and plays no part in merging.

use yrs::Origin;

/// Tag carried by deltas applied from the network.
pub const REMOTE_TAG: &str = "remote-update";

/// Tag carried by a snapshot loaded from durable storage.
pub const PERSISTENCE_TAG: &str = "persistence-load";

/// Origin of a locally produced mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LocalOrigin {
    Word,
    Ppt,
    Handwrite,
    PageStructure,
    Background,
}

impl LocalOrigin {
    pub const ALL: [LocalOrigin; 5] = [
        LocalOrigin::Word,
        LocalOrigin::Ppt,
        LocalOrigin::Handwrite,
        LocalOrigin::PageStructure,
        LocalOrigin::Background,
    ];

    pub const fn tag(self) -> &'static str {
        match self {
            LocalOrigin::Word => "local-word-update",
            LocalOrigin::Ppt => "local-ppt-update",
            LocalOrigin::Handwrite => "local-handwrite-update",
            LocalOrigin::PageStructure => "local-page-structure-update",
            LocalOrigin::Background => "local-background-update",
        }
    }

    pub fn origin(self) -> Origin {
        Origin::from(self.tag())
    }

    /// Whether a transaction origin is this tag.
    pub fn matches(self, origin: Option<&Origin>) -> bool {
        origin.is_some_and(|o| *o == self.origin())
    }
}

/// Classified origin of a committed transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnOrigin {
    Local(LocalOrigin),
    Remote,
    Persistence,
    /// No origin, or one this crate did not produce.
    Untagged,
}

impl TxnOrigin {
    pub fn classify(origin: Option<&Origin>) -> Self {
        let Some(origin) = origin else {
            return TxnOrigin::Untagged;
        };
        if *origin == Origin::from(REMOTE_TAG) {
            return TxnOrigin::Remote;
        }
        if *origin == Origin::from(PERSISTENCE_TAG) {
            return TxnOrigin::Persistence;
        }
        LocalOrigin::ALL
            .into_iter()
            .find(|tag| *origin == tag.origin())
            .map_or(TxnOrigin::Untagged, TxnOrigin::Local)
    }

    /// Produced by this replica (and therefore worth sending to peers).
    pub fn is_local(self) -> bool {
        matches!(self, TxnOrigin::Local(_) | TxnOrigin::Untagged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tags_are_distinct() {
        let mut tags: Vec<&str> = LocalOrigin::ALL.iter().map(|o| o.tag()).collect();
        tags.push(REMOTE_TAG);
        tags.push(PERSISTENCE_TAG);
        let len = tags.len();
        tags.sort();
        tags.dedup();
        assert_eq!(tags.len(), len);
    }

    #[test]
    fn test_classify_roundtrip() {
        for tag in LocalOrigin::ALL {
            let origin = tag.origin();
            assert_eq!(TxnOrigin::classify(Some(&origin)), TxnOrigin::Local(tag));
            assert!(tag.matches(Some(&origin)));
        }
        assert_eq!(TxnOrigin::classify(Some(&Origin::from(REMOTE_TAG))), TxnOrigin::Remote);
        assert_eq!(
            TxnOrigin::classify(Some(&Origin::from(PERSISTENCE_TAG))),
            TxnOrigin::Persistence
        );
        assert_eq!(TxnOrigin::classify(None), TxnOrigin::Untagged);
        assert_eq!(TxnOrigin::classify(Some(&Origin::from("other"))), TxnOrigin::Untagged);
    }

    #[test]
    fn test_matches_rejects_other_tags() {
        assert!(!LocalOrigin::Word.matches(Some(&LocalOrigin::Ppt.origin())));
        assert!(!LocalOrigin::Word.matches(None));
    }

    #[test]
    fn test_is_local() {
        assert!(TxnOrigin::Local(LocalOrigin::Word).is_local());
        assert!(TxnOrigin::Untagged.is_local());
        assert!(!TxnOrigin::Remote.is_local());
        assert!(!TxnOrigin::Persistence.is_local());
    }
}
