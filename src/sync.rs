//! One-way sync of an external CardDAV address book into the local store.
//!
//! A run resolves the local book, lists every remote ETag, diffs the listing
//! against the ETags stored locally, then fetches the missing cards in
//! bounded multiget batches. Each batch is applied in its own transaction,
//! so a failure part way through keeps the batches that already committed
//! and the next run picks up the rest.

use std::collections::HashMap;
use std::fmt;

use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::db::{ContactBook, Database, EXTERNAL_CARDDAV_SOURCE};
use crate::ingest::{self, ingest_response};
use crate::plan::SyncPlan;
use crate::remote::carddav::{CardDavClient, RemoteError};
use crate::remote::{Credentials, Transport};

/// An external address book as configured by the user.
#[derive(Debug, Clone)]
pub struct ExternalSource {
    pub id: String,
    pub name: String,
    pub url: String,
    pub credentials: Credentials,
    /// Account that owns the mirrored book and its contacts.
    pub account_id: String,
}

/// Where a run was when it stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum SyncPhase {
    ResolvingCollection,
    ListingRemote,
    Planning,
    FetchingBatch,
    Applying,
}

impl SyncPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncPhase::ResolvingCollection => "resolving-collection",
            SyncPhase::ListingRemote => "listing-remote",
            SyncPhase::Planning => "planning",
            SyncPhase::FetchingBatch => "fetching-batch",
            SyncPhase::Applying => "applying",
        }
    }
}

impl fmt::Display for SyncPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("unable to resolve address book {book_id}: {source:#}")]
    Resolve {
        book_id: String,
        #[source]
        source: anyhow::Error,
    },
    #[error(transparent)]
    Remote(#[from] RemoteError),
    #[error("storage failure: {0:#}")]
    Storage(#[from] anyhow::Error),
}

/// Outcome of one run, reported to the caller instead of an error.
#[derive(Debug, Clone, Serialize)]
pub struct SyncResult {
    pub source_id: String,
    pub source_name: String,
    /// Number of cards the server listed, not the number of local rows.
    pub contact_count: usize,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failed_phase: Option<SyncPhase>,
}

impl SyncResult {
    fn succeeded(source: &ExternalSource, contact_count: usize) -> Self {
        Self {
            source_id: source.id.clone(),
            source_name: source.name.clone(),
            contact_count,
            success: true,
            error: None,
            failed_phase: None,
        }
    }

    fn failed(source: &ExternalSource, phase: SyncPhase, err: &SyncError) -> Self {
        Self {
            source_id: source.id.clone(),
            source_name: source.name.clone(),
            contact_count: 0,
            success: false,
            error: Some(err.to_string()),
            failed_phase: Some(phase),
        }
    }
}

/// Drives one sync run for one external source.
pub struct SyncEngine<'a, T> {
    db: &'a mut Database,
    client: CardDavClient<T>,
    source: &'a ExternalSource,
    phase: SyncPhase,
}

impl<'a, T: Transport> SyncEngine<'a, T> {
    pub fn new(db: &'a mut Database, transport: T, source: &'a ExternalSource) -> Self {
        Self {
            db,
            client: CardDavClient::new(transport, source.credentials.clone()),
            source,
            phase: SyncPhase::ResolvingCollection,
        }
    }

    /// Run the sync to completion or to the first fatal error.
    pub fn run(mut self) -> SyncResult {
        info!(source = %self.source.id, url = %self.source.url, "starting external address book sync");

        match self.sync() {
            Ok(contact_count) => {
                info!(source = %self.source.id, contact_count, "external address book sync finished");
                SyncResult::succeeded(self.source, contact_count)
            }
            Err(err) => {
                error!(
                    source = %self.source.id,
                    phase = %self.phase,
                    error = %err,
                    "external address book sync failed"
                );
                SyncResult::failed(self.source, self.phase, &err)
            }
        }
    }

    fn sync(&mut self) -> Result<usize, SyncError> {
        self.phase = SyncPhase::ResolvingCollection;
        let book = self.resolve_address_book()?;
        self.sync_address_book(&book)
    }

    /// Load or create the local book and refresh its URL, ctag and name.
    ///
    /// The PROPFIND is advisory: when it fails the stored ctag is kept.
    pub fn resolve_address_book(&mut self) -> Result<ContactBook, SyncError> {
        let book_id = ingest::book_id(&self.source.id);
        let resolve_err = |source: anyhow::Error| SyncError::Resolve {
            book_id: book_id.clone(),
            source,
        };

        let mut book = match self.db.find_book(&book_id).map_err(resolve_err)? {
            Some(book) => book,
            None => {
                info!(book = %book_id, "creating local address book");
                ContactBook::new(book_id.as_str(), self.source.account_id.as_str())
            }
        };
        book.source = EXTERNAL_CARDDAV_SOURCE.to_string();
        book.url = self.source.url.clone();

        match self.client.fetch_collection_props(&book.url) {
            Ok(props) => {
                match props.ctag {
                    Some(ctag) => book.ctag = Some(ctag),
                    None => warn!(book = %book.id, "server did not report a ctag"),
                }
                if props.display_name.is_some() {
                    book.display_name = props.display_name;
                }
            }
            Err(err) => {
                warn!(book = %book.id, error = %err, "unable to refresh address book ctag");
            }
        }

        self.db.save_book(&book).map_err(resolve_err)?;
        Ok(book)
    }

    /// List, diff, fetch and apply. Returns the remote member count.
    pub fn sync_address_book(&mut self, book: &ContactBook) -> Result<usize, SyncError> {
        self.phase = SyncPhase::ListingRemote;
        let listing = self.client.list_etags(&book.url)?;

        let mut remote = HashMap::with_capacity(listing.len());
        for entry in listing {
            if entry.etag.is_empty() || entry.href.is_empty() {
                debug!(href = %entry.href, etag = %entry.etag, "ignoring listing entry without etag or href");
                continue;
            }
            remote.insert(entry.etag, entry.href);
        }
        let local = self.db.local_etags(&book.id)?;

        self.phase = SyncPhase::Planning;
        let mut plan = SyncPlan::new(&remote, &local);
        info!(
            book = %book.id,
            remote = remote.len(),
            local = local.len(),
            to_fetch = plan.to_fetch.len(),
            to_delete = plan.to_delete.len(),
            "planned address book sync"
        );

        if plan.is_empty() {
            info!(book = %book.id, "address book is up to date");
        }

        let mut pending_deletes = std::mem::take(&mut plan.to_delete);
        let batch_count = plan.batch_count();

        for (index, batch) in plan.batches().enumerate() {
            self.phase = SyncPhase::FetchingBatch;
            debug!(batch = index + 1, of = batch_count, size = batch.len(), "fetching cards");
            let responses = self.client.multiget(&book.url, batch)?;

            self.phase = SyncPhase::Applying;
            let tx = self.db.begin()?;

            // Deletions ride along with the first batch only.
            if !pending_deletes.is_empty() {
                let removed = tx.delete_contacts_by_etag(&book.id, &pending_deletes)?;
                info!(book = %book.id, removed, "removed contacts no longer on the server");
                pending_deletes.clear();
            }

            let mut written = 0usize;
            for response in &responses {
                let ingested = ingest_response(&self.source.id, response);
                if ingested.is_group {
                    debug!(href = %response.href, "group card, rows hidden");
                }
                for draft in ingested.contacts {
                    let existing = tx.find_contact(&draft.id)?;
                    let contact = draft.apply(existing, &book.account_id, &book.id);
                    tx.save_contact(&contact)?;
                    written += 1;
                }
            }

            tx.commit()?;
            debug!(batch = index + 1, received = responses.len(), written, "batch committed");
        }

        if !pending_deletes.is_empty() {
            self.phase = SyncPhase::Applying;
            let removed = self.db.delete_contacts_by_etag(&book.id, &pending_deletes)?;
            info!(book = %book.id, removed, "removed contacts no longer on the server");
        }

        Ok(remote.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Contact;
    use crate::remote::fake::FakeServer;
    use crate::remote::DavMethod;

    const BOOK: &str = "external-work";

    fn source() -> ExternalSource {
        ExternalSource {
            id: "work".into(),
            name: "Work".into(),
            url: "https://dav.example.com/ab/".into(),
            credentials: Credentials::new("me", "secret"),
            account_id: "acct-1".into(),
        }
    }

    fn card(uid: &str, name: &str, emails: &[&str]) -> String {
        let mut out = format!("BEGIN:VCARD\nVERSION:4.0\nUID:{}\nFN:{}\n", uid, name);
        for email in emails {
            out.push_str(&format!("EMAIL:{}\n", email));
        }
        out.push_str("END:VCARD\n");
        out
    }

    fn run(db: &mut Database, server: &FakeServer, source: &ExternalSource) -> SyncResult {
        SyncEngine::new(db, server, source).run()
    }

    fn ids(db: &Database) -> Vec<String> {
        db.contacts_in_book(BOOK)
            .unwrap()
            .into_iter()
            .map(|c| c.id)
            .collect()
    }

    fn href_count(body: &str) -> usize {
        body.matches("<d:href>").count()
    }

    fn populate(server: &FakeServer, n: usize) {
        for i in 0..n {
            server.put_card(
                &format!("/ab/{}.vcf", i),
                &format!("\"e{}\"", i),
                &card(&format!("u{}", i), &format!("Person {}", i), &[&format!("p{}@x.test", i)]),
            );
        }
    }

    #[test_log::test]
    fn test_first_sync_fans_out_emails() {
        let mut db = Database::open_in_memory().unwrap();
        let server = FakeServer::new();
        server.set_ctag(Some("ctag-1"));
        server.set_display_name(Some("Work Contacts"));
        server.put_card("/ab/1.vcf", "\"e1\"", &card("U1", "Ann Lee", &["a@x.test", "b@x.test"]));
        server.put_card("/ab/2.vcf", "\"e2\"", &card("U2", "Bo Chen", &["c@x.test"]));

        let result = run(&mut db, &server, &source());
        assert!(result.success, "{:?}", result.error);
        assert_eq!(result.source_id, "work");
        assert_eq!(result.source_name, "Work");
        // Two cards on the server, three local rows.
        assert_eq!(result.contact_count, 2);
        assert_eq!(ids(&db), vec!["ext-work-U1", "ext-work-U1-1", "ext-work-U2"]);

        let first = db.find_contact("ext-work-U1").unwrap().unwrap();
        let second = db.find_contact("ext-work-U1-1").unwrap().unwrap();
        assert_eq!(first.email, "a@x.test");
        assert_eq!(second.email, "b@x.test");
        assert_eq!(first.name, "Ann Lee");
        assert_eq!(first.info, second.info);
        assert_eq!(first.info.href, "/ab/1.vcf");
        assert_eq!(first.etag.as_deref(), Some("\"e1\""));
        assert_eq!(first.account_id, "acct-1");
        assert!(!first.hidden);

        let book = db.find_book(BOOK).unwrap().unwrap();
        assert_eq!(book.url, "https://dav.example.com/ab/");
        assert_eq!(book.ctag.as_deref(), Some("ctag-1"));
        assert_eq!(book.display_name.as_deref(), Some("Work Contacts"));
        assert_eq!(book.account_id, "acct-1");
        assert_eq!(book.source, EXTERNAL_CARDDAV_SOURCE);
    }

    #[test]
    fn test_second_run_without_changes_fetches_nothing() {
        let mut db = Database::open_in_memory().unwrap();
        let server = FakeServer::new();
        populate(&server, 5);

        assert!(run(&mut db, &server, &source()).success);
        assert_eq!(server.multiget_requests().len(), 1);
        let before = db.contacts_in_book(BOOK).unwrap();

        server.clear_requests();
        let result = run(&mut db, &server, &source());
        assert!(result.success);
        assert_eq!(result.contact_count, 5);
        assert!(server.multiget_requests().is_empty());
        assert_eq!(db.contacts_in_book(BOOK).unwrap(), before);
    }

    #[test]
    fn test_changed_and_removed_cards() {
        let mut db = Database::open_in_memory().unwrap();
        let server = FakeServer::new();
        server.put_card("/ab/1.vcf", "\"e1\"", &card("U1", "Ann", &["a@x.test", "b@x.test"]));
        server.put_card("/ab/2.vcf", "\"e2\"", &card("U2", "Bo", &["c@x.test"]));
        assert!(run(&mut db, &server, &source()).success);

        server.put_card("/ab/1.vcf", "\"e1b\"", &card("U1", "Ann Lee", &["a2@x.test"]));
        server.remove_card("/ab/2.vcf");
        server.clear_requests();

        let result = run(&mut db, &server, &source());
        assert!(result.success, "{:?}", result.error);
        assert_eq!(result.contact_count, 1);

        let multigets = server.multiget_requests();
        assert_eq!(multigets.len(), 1);
        assert_eq!(href_count(&multigets[0].body), 1);

        // The second address of the old revision goes with its ETag.
        assert_eq!(ids(&db), vec!["ext-work-U1"]);
        let contact = db.find_contact("ext-work-U1").unwrap().unwrap();
        assert_eq!(contact.email, "a2@x.test");
        assert_eq!(contact.name, "Ann Lee");
        assert_eq!(contact.etag.as_deref(), Some("\"e1b\""));
    }

    #[test]
    fn test_group_cards_are_hidden() {
        let mut db = Database::open_in_memory().unwrap();
        let server = FakeServer::new();
        server.put_card(
            "/ab/team.vcf",
            "\"g\"",
            "BEGIN:VCARD\nVERSION:4.0\nUID:G\nKIND:group\nFN:Team\nEMAIL:team@x.test\nEND:VCARD\n",
        );
        server.put_card("/ab/ann.vcf", "\"a\"", &card("A", "Ann", &["ann@x.test"]));

        assert!(run(&mut db, &server, &source()).success);

        let group = db.find_contact("ext-work-G").unwrap().unwrap();
        assert!(group.hidden);
        let person = db.find_contact("ext-work-A").unwrap().unwrap();
        assert!(!person.hidden);

        let visible: Vec<_> = db
            .query_contacts("")
            .unwrap()
            .into_iter()
            .map(|r| r.email)
            .collect();
        assert_eq!(visible, vec!["ann@x.test"]);
    }

    #[test_log::test]
    fn test_ctag_failure_does_not_abort() {
        let mut db = Database::open_in_memory().unwrap();
        let server = FakeServer::new();
        server.set_ctag(Some("c1"));
        populate(&server, 2);
        assert!(run(&mut db, &server, &source()).success);

        server.fail_method(DavMethod::Propfind);
        server.put_card("/ab/new.vcf", "\"n\"", &card("N", "New", &["new@x.test"]));

        let result = run(&mut db, &server, &source());
        assert!(result.success, "{:?}", result.error);
        assert_eq!(result.contact_count, 3);
        assert!(db.find_contact("ext-work-N").unwrap().is_some());
        // Last known ctag survives.
        let book = db.find_book(BOOK).unwrap().unwrap();
        assert_eq!(book.ctag.as_deref(), Some("c1"));
    }

    #[test]
    fn test_missing_ctag_on_first_run() {
        let mut db = Database::open_in_memory().unwrap();
        let server = FakeServer::new();
        populate(&server, 1);

        assert!(run(&mut db, &server, &source()).success);
        let book = db.find_book(BOOK).unwrap().unwrap();
        assert_eq!(book.ctag, None);
    }

    #[test]
    fn test_url_is_restamped() {
        let mut db = Database::open_in_memory().unwrap();
        let server = FakeServer::new();
        populate(&server, 1);
        assert!(run(&mut db, &server, &source()).success);

        let mut moved = source();
        moved.url = "https://new.example.com/ab/".into();
        server.clear_requests();
        assert!(run(&mut db, &server, &moved).success);

        let book = db.find_book(BOOK).unwrap().unwrap();
        assert_eq!(book.url, "https://new.example.com/ab/");
        assert!(server
            .requests()
            .iter()
            .all(|r| r.url == "https://new.example.com/ab/"));
    }

    #[test]
    fn test_fetches_in_batches_of_ninety() {
        let mut db = Database::open_in_memory().unwrap();
        let server = FakeServer::new();
        populate(&server, 200);

        let result = run(&mut db, &server, &source());
        assert!(result.success, "{:?}", result.error);
        assert_eq!(result.contact_count, 200);

        let mut sizes: Vec<usize> = server
            .multiget_requests()
            .iter()
            .map(|r| href_count(&r.body))
            .collect();
        sizes.sort();
        assert_eq!(sizes, vec![20, 90, 90]);
        assert_eq!(db.contacts_in_book(BOOK).unwrap().len(), 200);
    }

    #[test_log::test]
    fn test_multiget_failure_keeps_committed_batches() {
        let mut db = Database::open_in_memory().unwrap();

        let mut stale = Contact::new("ext-work-old", "acct-1", "old@x.test");
        stale.book_id = Some(BOOK.to_string());
        stale.etag = Some("\"stale\"".to_string());
        db.save_contact(&stale).unwrap();

        let server = FakeServer::new();
        populate(&server, 200);
        server.fail_multiget_from(1);

        let result = run(&mut db, &server, &source());
        assert!(!result.success);
        assert_eq!(result.failed_phase, Some(SyncPhase::FetchingBatch));
        assert_eq!(result.contact_count, 0);
        let message = result.error.unwrap();
        assert!(message.contains("REPORT"), "{}", message);
        assert!(message.contains("connection reset"), "{}", message);

        // First batch, deletions included, is committed.
        assert_eq!(db.contacts_in_book(BOOK).unwrap().len(), 90);
        assert!(db.find_contact("ext-work-old").unwrap().is_none());

        // A retry finishes the job without refetching the first batch.
        let server_retry = FakeServer::new();
        populate(&server_retry, 200);
        let result = run(&mut db, &server_retry, &source());
        assert!(result.success, "{:?}", result.error);
        let fetched: usize = server_retry
            .multiget_requests()
            .iter()
            .map(|r| href_count(&r.body))
            .sum();
        assert_eq!(fetched, 110);
        assert_eq!(db.contacts_in_book(BOOK).unwrap().len(), 200);
    }

    #[test]
    fn test_listing_failure_reports_phase() {
        let mut db = Database::open_in_memory().unwrap();
        let server = FakeServer::new();
        server.fail_method(DavMethod::Report);

        let result = run(&mut db, &server, &source());
        assert!(!result.success);
        assert_eq!(result.failed_phase, Some(SyncPhase::ListingRemote));
        assert!(result.error.unwrap().contains("connection refused"));
        // The book itself was resolved before the failure.
        assert!(db.find_book(BOOK).unwrap().is_some());
    }

    #[test]
    fn test_unusable_listing_is_a_failure() {
        let mut db = Database::open_in_memory().unwrap();
        let server = FakeServer::new();
        server.respond_raw(DavMethod::Report, "<html><body>login</body></html>");

        let result = run(&mut db, &server, &source());
        assert!(!result.success);
        assert_eq!(result.failed_phase, Some(SyncPhase::ListingRemote));
    }

    #[test]
    fn test_listing_entries_without_etag_are_ignored() {
        let mut db = Database::open_in_memory().unwrap();
        let server = FakeServer::new();
        server.respond_raw(
            DavMethod::Report,
            r#"<d:multistatus xmlns:d="DAV:"><d:response><d:href>/ab/1.vcf</d:href><d:propstat><d:prop><d:getetag/></d:prop></d:propstat></d:response></d:multistatus>"#,
        );

        let result = run(&mut db, &server, &source());
        assert!(result.success, "{:?}", result.error);
        assert_eq!(result.contact_count, 0);
        assert!(server.multiget_requests().is_empty());
    }

    #[test_log::test]
    fn test_empty_and_broken_cards_are_skipped() {
        let mut db = Database::open_in_memory().unwrap();
        let server = FakeServer::new();
        server.put_card("/ab/empty.vcf", "\"x1\"", "");
        server.put_card("/ab/broken.vcf", "\"x2\"", "this is not a vcard");
        server.put_card("/ab/noemail.vcf", "\"x3\"", &card("P", "Phone Only", &[]));
        server.put_card("/ab/good.vcf", "\"x4\"", &card("OK", "Good", &["good@x.test"]));

        let result = run(&mut db, &server, &source());
        assert!(result.success, "{:?}", result.error);
        assert_eq!(result.contact_count, 4);
        assert_eq!(ids(&db), vec!["ext-work-OK"]);
    }

    #[test]
    fn test_deletions_without_batches() {
        let mut db = Database::open_in_memory().unwrap();
        let server = FakeServer::new();
        populate(&server, 3);
        assert!(run(&mut db, &server, &source()).success);
        assert_eq!(ids(&db).len(), 3);

        for i in 0..3 {
            server.remove_card(&format!("/ab/{}.vcf", i));
        }
        server.clear_requests();

        let result = run(&mut db, &server, &source());
        assert!(result.success, "{:?}", result.error);
        assert_eq!(result.contact_count, 0);
        assert!(server.multiget_requests().is_empty());
        assert!(ids(&db).is_empty());
    }

    #[test]
    fn test_deletions_with_several_batches() {
        let mut db = Database::open_in_memory().unwrap();
        let server = FakeServer::new();
        server.put_card("/ab/gone.vcf", "\"gone\"", &card("GONE", "Gone", &["gone@x.test"]));
        assert!(run(&mut db, &server, &source()).success);

        server.remove_card("/ab/gone.vcf");
        populate(&server, 100);
        let result = run(&mut db, &server, &source());
        assert!(result.success, "{:?}", result.error);
        assert_eq!(server.multiget_requests().len(), 3);
        assert!(db.find_contact("ext-work-GONE").unwrap().is_none());
        assert_eq!(ids(&db).len(), 100);
    }

    #[test]
    fn test_result_serializes_phase_in_kebab_case() {
        let result = SyncResult {
            source_id: "work".into(),
            source_name: "Work".into(),
            contact_count: 0,
            success: false,
            error: Some("boom".into()),
            failed_phase: Some(SyncPhase::FetchingBatch),
        };
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["failed_phase"], "fetching-batch");
        assert_eq!(json["success"], false);

        let ok = SyncResult::succeeded(&source(), 3);
        let json = serde_json::to_value(&ok).unwrap();
        assert_eq!(json["contact_count"], 3);
        assert!(json.get("error").is_none());
    }
}
