use std::sync::Arc;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::db::Store;
use crate::email::parse::ThreadRefs;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MatchedBy {
    InReplyTo(String),
    Reference(String),
    Subject,
    Created,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Resolution {
    pub thread_id: Uuid,
    pub matched_by: MatchedBy,
}

impl Resolution {
    /// True when no existing thread matched and an empty one was created.
    pub fn created(&self) -> bool {
        self.matched_by == MatchedBy::Created
    }
}

/// Decides which thread an inbound message joins.
///
/// Rules are tried in order and the first hit wins:
/// 1. a stored message whose provider id equals `In-Reply-To`
/// 2. the first `References` id, in header order, that names a stored message
/// 3. a thread of the account with exactly the normalized subject
/// 4. a new thread
///
/// Header matches are authoritative. The subject rule is a heuristic and will
/// merge unrelated mail that shares a cleaned subject.
#[derive(Clone)]
pub struct ThreadResolver {
    store: Arc<dyn Store>,
}

impl ThreadResolver {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    pub async fn resolve(
        &self,
        account_id: Uuid,
        refs: &ThreadRefs,
        snippet: &str,
        now: DateTime<Utc>,
    ) -> Result<Resolution, anyhow::Error> {

        if let Some(in_reply_to) = &refs.in_reply_to {
            if let Some(thread_id) = self.store.thread_of_provider_message(account_id, in_reply_to).await? {
                return Ok(Resolution {
                    thread_id,
                    matched_by: MatchedBy::InReplyTo(in_reply_to.clone()),
                });
            }
        }

        for reference in &refs.references {
            if let Some(thread_id) = self.store.thread_of_provider_message(account_id, reference).await? {
                return Ok(Resolution {
                    thread_id,
                    matched_by: MatchedBy::Reference(reference.clone()),
                });
            }
        }

        let found = self.store
            .find_or_create_thread(account_id, &refs.normalized_subject, snippet, now)
            .await?;

        Ok(Resolution {
            thread_id: found.thread_id,
            matched_by: if found.created { MatchedBy::Created } else { MatchedBy::Subject },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    use crate::crypto::EncryptedSecret;
    use crate::db::MemoryStore;
    use crate::email::{Direction, MessageStatus, NewAccount, NewMessage, ThreadTouch};

    async fn setup() -> (Arc<MemoryStore>, ThreadResolver, Uuid) {
        let store = Arc::new(MemoryStore::new());
        let account = store.create_account(NewAccount {
            user_id: "u1".into(),
            email: "b@y.com".into(),
            name: "Bea".into(),
            api_key: EncryptedSecret::default(),
        }).await.unwrap();
        let resolver = ThreadResolver::new(store.clone());
        (store, resolver, account.id)
    }

    async fn store_message(store: &MemoryStore, account_id: Uuid, thread_id: Uuid, provider_id: &str) {
        store.record_message(
            ThreadTouch { thread_id, at: Utc::now(), snippet: String::new(), is_read: false },
            NewMessage {
                account_id,
                thread_id,
                message_id: Some(provider_id.to_string()),
                direction: Direction::Inbound,
                from: "a@x.com".into(),
                to: vec!["b@y.com".into()],
                cc: vec![],
                bcc: vec![],
                subject: "s".into(),
                body_html: None,
                body_text: None,
                snippet: String::new(),
                is_read: false,
                status: MessageStatus::Delivered,
                headers: BTreeMap::new(),
                sent_at: None,
                received_at: Some(Utc::now()),
            },
        ).await.unwrap();
    }

    fn refs(in_reply_to: Option<&str>, references: &[&str], subject: &str) -> ThreadRefs {
        ThreadRefs {
            in_reply_to: in_reply_to.map(str::to_string),
            references: references.iter().map(|r| r.to_string()).collect(),
            normalized_subject: subject.to_string(),
        }
    }

    #[tokio::test]
    async fn in_reply_to_wins_over_subject() {
        let (store, resolver, account) = setup().await;
        let original = store.create_thread(account, "Budget", "", Utc::now()).await.unwrap();
        let other = store.create_thread(account, "Lunch", "", Utc::now()).await.unwrap();
        store_message(&store, account, original, "m1").await;

        let resolution = resolver.resolve(account, &refs(Some("m1"), &[], "Lunch"), "", Utc::now()).await.unwrap();

        assert_eq!(resolution.thread_id, original);
        assert_ne!(resolution.thread_id, other);
        assert_eq!(resolution.matched_by, MatchedBy::InReplyTo("m1".into()));
    }

    #[tokio::test]
    async fn first_matching_reference_in_header_order() {
        let (store, resolver, account) = setup().await;
        let first = store.create_thread(account, "A", "", Utc::now()).await.unwrap();
        let second = store.create_thread(account, "B", "", Utc::now()).await.unwrap();
        store_message(&store, account, first, "r2").await;
        store_message(&store, account, second, "r3").await;

        let resolution = resolver
            .resolve(account, &refs(Some("unknown"), &["r1", "r2", "r3"], "Z"), "", Utc::now())
            .await
            .unwrap();

        assert_eq!(resolution.thread_id, first);
        assert_eq!(resolution.matched_by, MatchedBy::Reference("r2".into()));
    }

    #[tokio::test]
    async fn falls_back_to_exact_subject() {
        let (store, resolver, account) = setup().await;
        let thread = store.create_thread(account, "Meeting", "", Utc::now()).await.unwrap();

        let hit = resolver.resolve(account, &refs(None, &["nope"], "Meeting"), "", Utc::now()).await.unwrap();
        assert_eq!(hit.thread_id, thread);
        assert_eq!(hit.matched_by, MatchedBy::Subject);

        let miss = resolver.resolve(account, &refs(None, &[], "meeting"), "", Utc::now()).await.unwrap();
        assert_ne!(miss.thread_id, thread);
        assert!(miss.created());
    }

    #[tokio::test]
    async fn creates_empty_thread() {
        let (store, resolver, account) = setup().await;
        let now = Utc::now();

        let resolution = resolver.resolve(account, &refs(None, &[], "Project Update"), "Here's the update...", now).await.unwrap();
        assert!(resolution.created());

        let thread = store.thread(resolution.thread_id).await.unwrap().unwrap();
        assert_eq!(thread.subject, "Project Update");
        assert_eq!(thread.message_count, 0);
        assert_eq!(thread.last_message_at, now);
        assert_eq!(thread.snippet.as_deref(), Some("Here's the update..."));
    }

    #[tokio::test]
    async fn other_accounts_do_not_match() {
        let (store, resolver, account) = setup().await;
        let stranger = store.create_account(NewAccount {
            user_id: "u2".into(),
            email: "c@z.com".into(),
            name: "Cy".into(),
            api_key: EncryptedSecret::default(),
        }).await.unwrap();
        let theirs = store.create_thread(stranger.id, "Hello", "", Utc::now()).await.unwrap();
        store_message(&store, stranger.id, theirs, "m9").await;

        let resolution = resolver.resolve(account, &refs(Some("m9"), &[], "Hello"), "", Utc::now()).await.unwrap();
        assert_ne!(resolution.thread_id, theirs);
        assert!(resolution.created());
    }

    #[tokio::test]
    async fn concurrent_new_subjects_share_one_thread() {
        let (store, resolver, account) = setup().await;

        let tasks: Vec<_> = (0..8).map(|_| {
            let resolver = resolver.clone();
            tokio::spawn(async move {
                resolver.resolve(account, &refs(None, &[], "Launch"), "", Utc::now()).await.unwrap()
            })
        }).collect();

        let mut ids = Vec::new();
        for task in tasks {
            ids.push(task.await.unwrap().thread_id);
        }
        ids.dedup();

        assert_eq!(ids.len(), 1);
        assert_eq!(store.thread_count().await, 1);
    }
}
