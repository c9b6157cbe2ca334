//! Expansion of fetched cards into local contact rows.
//!
//! One card yields one row per non-empty email address. Row ids are derived
//! from the source id and the card's UID (or its href when the card has no
//! UID), so a refetched card overwrites the rows it produced last time.

use tracing::{debug, info};

use crate::db::{Contact, ContactInfo};
use crate::remote::multistatus::DavResponse;
use crate::vcard_io::{self, CardFields};

/// Local book id for an external source.
pub fn book_id(source_id: &str) -> String {
    format!("external-{}", source_id)
}

/// Row id for the email at `index` of the card identified by `card_key`.
///
/// Index 0 uses the bare id; later indexes append `-<index>`.
pub fn contact_id(source_id: &str, card_key: &str, index: usize) -> String {
    let base = format!("ext-{}-{}", source_id, card_key);
    if index == 0 {
        base
    } else {
        format!("{}-{}", base, index)
    }
}

/// Fields for one contact row, ready to be merged onto a stored record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContactDraft {
    pub id: String,
    pub email: String,
    pub name: String,
    pub etag: String,
    pub info: ContactInfo,
    pub hidden: bool,
}

impl ContactDraft {
    /// Overlay the draft on the stored record with the same id, or on a new one.
    pub fn apply(self, existing: Option<Contact>, account_id: &str, book_id: &str) -> Contact {
        let mut contact =
            existing.unwrap_or_else(|| Contact::new(self.id.as_str(), account_id, self.email.as_str()));
        contact.book_id = Some(book_id.to_string());
        contact.info = self.info;
        contact.name = self.name;
        contact.email = self.email;
        contact.etag = Some(self.etag);
        contact.hidden = self.hidden;
        contact
    }
}

#[derive(Debug, Clone, Default)]
pub struct IngestedCard {
    pub contacts: Vec<ContactDraft>,
    pub is_group: bool,
}

/// Parse one multiget entry and expand it.
///
/// Empty payloads and cards that fail to parse produce nothing; both are
/// logged and never abort the batch.
pub fn ingest_response(source_id: &str, response: &DavResponse) -> IngestedCard {
    if response.address_data.trim().is_empty() {
        info!(
            etag = %response.etag,
            href = %response.href,
            "received addressbook entry with an empty body"
        );
        return IngestedCard::default();
    }

    let card = match vcard_io::parse_card(&response.address_data) {
        Ok(card) => card,
        Err(err) => {
            info!(href = %response.href, error = %format!("{:#}", err), "unable to decode vCard");
            return IngestedCard::default();
        }
    };

    build_contacts(
        source_id,
        &response.etag,
        &response.href,
        &response.address_data,
        &card,
    )
}

/// Expand an already parsed card.
pub fn build_contacts(
    source_id: &str,
    etag: &str,
    href: &str,
    raw: &str,
    card: &dyn CardFields,
) -> IngestedCard {
    let emails = card.emails();
    if emails.is_empty() {
        debug!(href, "skipping card without email addresses");
        return IngestedCard::default();
    }

    let card_key = card.unique_id().unwrap_or_else(|| href.to_string());

    let mut name = card.formatted_name();
    if name.is_empty() {
        name = card.name();
    }

    let info = ContactInfo {
        vcf: raw.to_string(),
        href: href.to_string(),
        photo: card.photo().filter(|p| !p.is_empty()),
    };

    let is_group = card.is_group();

    // Empty addresses are skipped but keep their position in the id scheme.
    let contacts = emails
        .into_iter()
        .enumerate()
        .filter(|(_, email)| !email.is_empty())
        .map(|(index, email)| ContactDraft {
            id: contact_id(source_id, &card_key, index),
            email,
            name: name.clone(),
            etag: etag.to_string(),
            info: info.clone(),
            hidden: is_group,
        })
        .collect();

    IngestedCard { contacts, is_group }
}
