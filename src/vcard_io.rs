use std::borrow::Cow;

use anyhow::{anyhow, Context, Result};
use tracing::debug;
use vcard4::property::{AnyProperty, TextListProperty, TextOrUriProperty};
use vcard4::{parse, Vcard};

use crate::vcard3;

const APPLE_KIND: &str = "X-ADDRESSBOOKSERVER-KIND";

/// The subset of a contact card the mirror reads.
pub trait CardFields {
    /// UID, if the card carries a non-empty one.
    fn unique_id(&self) -> Option<String>;
    /// First FN value, or an empty string.
    fn formatted_name(&self) -> String;
    /// Structured N rendered for display, or an empty string.
    fn name(&self) -> String;
    /// EMAIL values in card order, empty values included.
    fn emails(&self) -> Vec<String>;
    fn photo(&self) -> Option<String>;
    /// Whether the card describes a group rather than an individual.
    fn is_group(&self) -> bool;
}

impl CardFields for Vcard {
    fn unique_id(&self) -> Option<String> {
        card_uid(self).filter(|uid| !uid.trim().is_empty())
    }

    fn formatted_name(&self) -> String {
        self.formatted_name
            .first()
            .map(|prop| prop.value.trim().to_string())
            .unwrap_or_default()
    }

    fn name(&self) -> String {
        self.name
            .as_ref()
            .map(name_to_display_string)
            .unwrap_or_default()
    }

    fn emails(&self) -> Vec<String> {
        self.email
            .iter()
            .map(|prop| prop.value.trim().to_string())
            .collect()
    }

    fn photo(&self) -> Option<String> {
        self.photo.first().map(|prop| match prop {
            TextOrUriProperty::Text(text) => text.value.clone(),
            TextOrUriProperty::Uri(uri) => uri.value.to_string(),
        })
    }

    fn is_group(&self) -> bool {
        if let Some(kind) = &self.kind {
            if kind.value.to_string().eq_ignore_ascii_case("group") {
                return true;
            }
        }
        self.extensions.iter().any(|ext| {
            ext.name.eq_ignore_ascii_case(APPLE_KIND)
                && matches!(&ext.value, AnyProperty::Text(value) if value.trim().eq_ignore_ascii_case("group"))
        })
    }
}

/// Properties the mirror reads; everything else may be dropped on retry.
const MIRRORED_PROPERTIES: &[&str] = &[
    "BEGIN", "END", "VERSION", "UID", "FN", "N", "EMAIL", "PHOTO", "KIND", APPLE_KIND,
];

/// Parse the first card out of a raw address-data payload.
///
/// vCard 2.1/3.0 payloads are converted to 4.0 first. When the strict
/// parser rejects a card, it is retried with only the properties the
/// mirror reads.
pub fn parse_card(raw: &str) -> Result<Vcard> {
    let input = if vcard3::is_legacy(raw) {
        Cow::Owned(vcard3::to_vcard4(raw).context("converting legacy vCard")?)
    } else {
        Cow::Borrowed(raw)
    };

    match parse_first(&input) {
        Ok(card) => Ok(card),
        Err(err) => {
            let reduced = mirrored_only(&input);
            match parse_first(&reduced) {
                Ok(card) => {
                    debug!(error = %format!("{:#}", err), "parsed vCard after dropping unread properties");
                    Ok(card)
                }
                Err(_) => Err(err),
            }
        }
    }
}

fn parse_first(input: &str) -> Result<Vcard> {
    let cards = parse(input)
        .map_err(|err| anyhow!(err))
        .context("parsing vCard data")?;
    cards
        .into_iter()
        .next()
        .ok_or_else(|| anyhow!("payload contained no vCard"))
}

/// Keep only the lines of properties in [`MIRRORED_PROPERTIES`].
fn mirrored_only(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for line in vcard3::unfold(input) {
        let keep = vcard3::property_name(&line)
            .is_some_and(|name| MIRRORED_PROPERTIES.contains(&name.as_str()));
        if keep {
            out.push_str(&line);
            out.push_str("\r\n");
        }
    }
    out
}

/// Retrieve the UID value as a string if present.
pub fn card_uid(card: &Vcard) -> Option<String> {
    match &card.uid {
        Some(TextOrUriProperty::Text(text)) => Some(text.value.clone()),
        Some(TextOrUriProperty::Uri(uri)) => Some(uri.value.to_string()),
        None => None,
    }
}

/// Convert a structured name (N property) to a display string.
/// Format: "prefix given additional family suffix" (skipping empty components)
fn name_to_display_string(name: &TextListProperty) -> String {
    // N components: [0]=family, [1]=given, [2]=additional, [3]=prefix, [4]=suffix
    let family = name.value.first().map(|s| s.trim()).unwrap_or("");
    let given = name.value.get(1).map(|s| s.trim()).unwrap_or("");
    let additional = name.value.get(2).map(|s| s.trim()).unwrap_or("");
    let prefix = name.value.get(3).map(|s| s.trim()).unwrap_or("");
    let suffix = name.value.get(4).map(|s| s.trim()).unwrap_or("");

    let parts: Vec<&str> = [prefix, given, additional, family, suffix]
        .into_iter()
        .filter(|s| !s.is_empty())
        .collect();

    parts.join(" ")
}
