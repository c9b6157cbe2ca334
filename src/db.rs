use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use directories::BaseDirs;
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row, Transaction, TransactionBehavior};
use serde::{Deserialize, Serialize};

use crate::search;

/// Provenance tag for books and contacts mirrored from an external CardDAV source.
pub const EXTERNAL_CARDDAV_SOURCE: &str = "external-carddav";

const APP_NAME: &str = "carddav-mirror";
const DB_FILE_NAME: &str = "contacts.db";

/// Local mirror of one remote address book.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContactBook {
    pub id: String,
    pub account_id: String,
    pub source: String,
    pub url: String,
    pub ctag: Option<String>,
    pub display_name: Option<String>,
}

impl ContactBook {
    pub fn new(id: impl Into<String>, account_id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            account_id: account_id.into(),
            source: EXTERNAL_CARDDAV_SOURCE.to_string(),
            url: String::new(),
            ctag: None,
            display_name: None,
        }
    }
}

/// Payload shared by every contact row expanded from the same card.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContactInfo {
    pub vcf: String,
    pub href: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub photo: Option<String>,
}

/// One addressable contact: exactly one email address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Contact {
    pub id: String,
    pub account_id: String,
    pub book_id: Option<String>,
    pub source: String,
    pub email: String,
    pub name: String,
    pub etag: Option<String>,
    pub info: ContactInfo,
    pub hidden: bool,
}

impl Contact {
    pub fn new(id: impl Into<String>, account_id: impl Into<String>, email: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            account_id: account_id.into(),
            book_id: None,
            source: EXTERNAL_CARDDAV_SOURCE.to_string(),
            email: email.into(),
            name: String::new(),
            etag: None,
            info: ContactInfo::default(),
            hidden: false,
        }
    }
}

/// Result row for `query`, in mutt/aerc query order.
#[derive(Debug, Clone)]
pub struct QueryResult {
    pub email: String,
    pub name: String,
    pub book_id: Option<String>,
}

#[derive(Debug, Clone)]
pub struct BookSummary {
    pub id: String,
    pub url: String,
    pub ctag: Option<String>,
    pub display_name: Option<String>,
    pub contact_count: i64,
}

pub struct Database {
    conn: Connection,
}

impl Database {
    /// `<data_dir>/carddav-mirror/contacts.db`
    pub fn default_path() -> Result<PathBuf> {
        let base = BaseDirs::new().context("unable to determine data directories")?;
        Ok(base.data_dir().join(APP_NAME).join(DB_FILE_NAME))
    }

    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).with_context(|| {
                    format!("failed to create data directory {}", parent.display())
                })?;
            }
        }
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open database at {}", path.display()))?;
        let mut db = Self { conn };
        db.setup()?;
        Ok(db)
    }

    #[cfg(test)]
    pub fn open_in_memory() -> Result<Self> {
        let mut db = Self {
            conn: Connection::open_in_memory()?,
        };
        db.setup()?;
        Ok(db)
    }

    fn setup(&mut self) -> Result<()> {
        self.conn
            .pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get::<_, String>(0))?;
        self.conn.pragma_update(None, "synchronous", "FULL")?;

        self.conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS contact_books (
              id           TEXT PRIMARY KEY,
              account_id   TEXT NOT NULL,
              source       TEXT NOT NULL,
              url          TEXT NOT NULL,
              ctag         TEXT,
              display_name TEXT
            );

            CREATE TABLE IF NOT EXISTS contacts (
              id         TEXT PRIMARY KEY,
              account_id TEXT NOT NULL,
              book_id    TEXT,
              source     TEXT NOT NULL,
              email      TEXT NOT NULL,
              name       TEXT NOT NULL DEFAULT '',
              etag       TEXT,
              info       TEXT NOT NULL DEFAULT '{}',
              hidden     INTEGER NOT NULL DEFAULT 0
            );

            CREATE INDEX IF NOT EXISTS idx_contacts_book_etag ON contacts(book_id, etag);
            CREATE INDEX IF NOT EXISTS idx_contacts_email ON contacts(email);
        "#,
        )?;
        Ok(())
    }

    pub fn find_book(&self, id: &str) -> Result<Option<ContactBook>> {
        find_book(&self.conn, id)
    }

    pub fn save_book(&self, book: &ContactBook) -> Result<()> {
        save_book(&self.conn, book)
    }

    #[cfg(test)]
    pub fn find_contact(&self, id: &str) -> Result<Option<Contact>> {
        find_contact(&self.conn, id)
    }

    #[cfg(test)]
    pub fn save_contact(&self, contact: &Contact) -> Result<()> {
        save_contact(&self.conn, contact)
    }

    /// Every ETag currently stored for the book.
    pub fn local_etags(&self, book_id: &str) -> Result<HashSet<String>> {
        let mut stmt = self.conn.prepare(
            "SELECT DISTINCT etag FROM contacts WHERE book_id = ?1 AND etag IS NOT NULL",
        )?;
        let rows = stmt.query_map([book_id], |row| row.get::<_, String>(0))?;

        let mut out = HashSet::new();
        for row in rows {
            out.insert(row?);
        }
        Ok(out)
    }

    /// Delete outside any transaction; each statement commits on its own.
    pub fn delete_contacts_by_etag(&self, book_id: &str, etags: &[String]) -> Result<usize> {
        delete_contacts_by_etag(&self.conn, book_id, etags)
    }

    /// Open an immediate transaction. Dropping it without `commit` rolls back.
    pub fn begin(&mut self) -> Result<StoreTx<'_>> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;
        Ok(StoreTx { tx })
    }

    #[cfg(test)]
    pub fn contacts_in_book(&self, book_id: &str) -> Result<Vec<Contact>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {} FROM contacts WHERE book_id = ?1 ORDER BY id",
            CONTACT_COLUMNS
        ))?;
        let rows = stmt.query_map([book_id], row_to_contact)?;

        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Visible contacts whose name or email matches the filter.
    pub fn query_contacts(&self, filter: &str) -> Result<Vec<QueryResult>> {
        let pattern = search::normalize_query(filter)
            .map(|n| search::like_pattern(&n))
            .unwrap_or_else(|| "%".to_string());

        let mut stmt = self.conn.prepare(
            r#"
            SELECT email, name, book_id FROM contacts
            WHERE hidden = 0
              AND (lower(name) LIKE ?1 ESCAPE '\' OR lower(email) LIKE ?1 ESCAPE '\')
            ORDER BY name COLLATE NOCASE, email
            "#,
        )?;
        let rows = stmt.query_map([&pattern], |row| {
            Ok(QueryResult {
                email: row.get(0)?,
                name: row.get(1)?,
                book_id: row.get(2)?,
            })
        })?;

        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    pub fn list_books(&self) -> Result<Vec<BookSummary>> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT b.id, b.url, b.ctag, b.display_name,
                   (SELECT COUNT(*) FROM contacts c WHERE c.book_id = b.id)
            FROM contact_books b
            ORDER BY b.id
            "#,
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(BookSummary {
                id: row.get(0)?,
                url: row.get(1)?,
                ctag: row.get(2)?,
                display_name: row.get(3)?,
                contact_count: row.get(4)?,
            })
        })?;

        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }
}

/// A write transaction over the contact tables.
pub struct StoreTx<'a> {
    tx: Transaction<'a>,
}

impl StoreTx<'_> {
    pub fn find_contact(&self, id: &str) -> Result<Option<Contact>> {
        find_contact(&self.tx, id)
    }

    pub fn save_contact(&self, contact: &Contact) -> Result<()> {
        save_contact(&self.tx, contact)
    }

    pub fn delete_contacts_by_etag(&self, book_id: &str, etags: &[String]) -> Result<usize> {
        delete_contacts_by_etag(&self.tx, book_id, etags)
    }

    pub fn commit(self) -> Result<()> {
        self.tx.commit()?;
        Ok(())
    }
}

const CONTACT_COLUMNS: &str = "id, account_id, book_id, source, email, name, etag, info, hidden";

fn find_book(conn: &Connection, id: &str) -> Result<Option<ContactBook>> {
    let book = conn
        .query_row(
            "SELECT id, account_id, source, url, ctag, display_name FROM contact_books WHERE id = ?1",
            [id],
            |row| {
                Ok(ContactBook {
                    id: row.get(0)?,
                    account_id: row.get(1)?,
                    source: row.get(2)?,
                    url: row.get(3)?,
                    ctag: row.get(4)?,
                    display_name: row.get(5)?,
                })
            },
        )
        .optional()?;
    Ok(book)
}

fn save_book(conn: &Connection, book: &ContactBook) -> Result<()> {
    conn.execute(
        r#"
        INSERT INTO contact_books (id, account_id, source, url, ctag, display_name)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6)
        ON CONFLICT(id) DO UPDATE SET
          account_id=excluded.account_id,
          source=excluded.source,
          url=excluded.url,
          ctag=excluded.ctag,
          display_name=excluded.display_name
    "#,
        params![
            book.id,
            book.account_id,
            book.source,
            book.url,
            book.ctag,
            book.display_name,
        ],
    )?;
    Ok(())
}

fn find_contact(conn: &Connection, id: &str) -> Result<Option<Contact>> {
    let contact = conn
        .query_row(
            &format!("SELECT {} FROM contacts WHERE id = ?1", CONTACT_COLUMNS),
            [id],
            row_to_contact,
        )
        .optional()?;
    Ok(contact)
}

fn save_contact(conn: &Connection, contact: &Contact) -> Result<()> {
    let info = serde_json::to_string(&contact.info).context("failed to encode contact info")?;
    conn.execute(
        r#"
        INSERT INTO contacts (id, account_id, book_id, source, email, name, etag, info, hidden)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
        ON CONFLICT(id) DO UPDATE SET
          account_id=excluded.account_id,
          book_id=excluded.book_id,
          source=excluded.source,
          email=excluded.email,
          name=excluded.name,
          etag=excluded.etag,
          info=excluded.info,
          hidden=excluded.hidden
    "#,
        params![
            contact.id,
            contact.account_id,
            contact.book_id,
            contact.source,
            contact.email,
            contact.name,
            contact.etag,
            info,
            if contact.hidden { 1 } else { 0 },
        ],
    )?;
    Ok(())
}

fn delete_contacts_by_etag(conn: &Connection, book_id: &str, etags: &[String]) -> Result<usize> {
    let mut stmt = conn.prepare("DELETE FROM contacts WHERE book_id = ?1 AND etag = ?2")?;
    let mut deleted = 0;
    for etag in etags {
        deleted += stmt.execute(params![book_id, etag])?;
    }
    Ok(deleted)
}

fn row_to_contact(row: &Row<'_>) -> rusqlite::Result<Contact> {
    let raw_info: String = row.get(7)?;
    let info = serde_json::from_str(&raw_info)
        .map_err(|err| rusqlite::Error::FromSqlConversionFailure(7, Type::Text, Box::new(err)))?;
    Ok(Contact {
        id: row.get(0)?,
        account_id: row.get(1)?,
        book_id: row.get(2)?,
        source: row.get(3)?,
        email: row.get(4)?,
        name: row.get(5)?,
        etag: row.get(6)?,
        info,
        hidden: row.get::<_, i64>(8)? != 0,
    })
}
