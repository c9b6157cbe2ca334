//! Rewrites vCard 2.1/3.0 text into vCard 4.0 that `vcard4` accepts.
//!
//! Servers still hand out 3.0 cards (iCloud, older Radicale and SOGo
//! setups). The 4.0 parser rejects their `ENCODING`, `CHARSET` and
//! positional parameters, so each property line is rewritten:
//!
//! - folded lines and quoted-printable soft breaks are joined
//! - `CHARSET` and transfer encodings are dropped, quoted-printable values
//!   are decoded
//! - base64 `PHOTO`/`LOGO` data becomes a `data:` URI with `MEDIATYPE`
//! - positional parameters (`EMAIL;INTERNET;HOME`) and repeated `TYPE`
//!   parameters merge into one `TYPE=` list, `pref` becomes `PREF=1`

use anyhow::{anyhow, bail, Result};

const BEGIN: &str = "BEGIN:VCARD";
const END: &str = "END:VCARD";
const OCTET_STREAM: &str = "application/octet-stream";

/// Whether any `VERSION` line names something other than 4.0.
pub fn is_legacy(raw: &str) -> bool {
    raw.lines().any(|line| {
        match line.trim_end_matches('\r').split_once(':') {
            Some((lhs, value)) => {
                lhs.trim().eq_ignore_ascii_case("VERSION") && value.trim() != "4.0"
            }
            None => false,
        }
    })
}

/// Convert every card in `raw` to vCard 4.0 text (CRLF line endings).
pub fn to_vcard4(raw: &str) -> Result<String> {
    let mut out: Vec<String> = Vec::new();

    for line in unfold(raw) {
        let Some((lhs, value)) = line.split_once(':') else {
            continue;
        };
        let lhs_trimmed = lhs.trim();
        if lhs_trimmed.eq_ignore_ascii_case("BEGIN") {
            out.push(BEGIN.to_string());
            out.push("VERSION:4.0".to_string());
            continue;
        }
        if lhs_trimmed.eq_ignore_ascii_case("END") {
            out.push(END.to_string());
            continue;
        }
        if lhs_trimmed.eq_ignore_ascii_case("VERSION") {
            continue;
        }

        out.push(convert_property(lhs_trimmed, value)?);
    }

    let mut joined = out.join("\r\n");
    joined.push_str("\r\n");
    Ok(joined)
}

/// Join folded continuation lines and quoted-printable soft breaks.
///
/// Blank lines are dropped.
pub fn unfold(raw: &str) -> Vec<String> {
    let mut lines: Vec<String> = Vec::new();

    for line in raw.split('\n').map(|l| l.trim_end_matches('\r')) {
        if let Some(last) = lines.last_mut() {
            // Quoted-printable soft breaks keep the next line verbatim.
            if last.ends_with('=') && is_quoted_printable(last) {
                last.pop();
                last.push_str(line);
                continue;
            }
            if line.starts_with([' ', '\t']) {
                last.push_str(&line[1..]);
                continue;
            }
        }

        if !line.is_empty() {
            lines.push(line.to_string());
        }
    }

    lines
}

/// Property name of a content line, without its group, upper-cased.
pub fn property_name(line: &str) -> Option<String> {
    let end = line.find([';', ':'])?;
    let head = &line[..end];
    let name = head.rsplit_once('.').map_or(head, |(_, name)| name);
    Some(name.trim().to_ascii_uppercase())
}

fn is_quoted_printable(line: &str) -> bool {
    let Some((lhs, _)) = line.split_once(':') else {
        return false;
    };
    lhs.split(';').skip(1).any(|param| {
        let param = param.trim();
        match param.split_once('=') {
            Some((name, value)) => {
                name.trim().eq_ignore_ascii_case("ENCODING")
                    && value.trim().eq_ignore_ascii_case("QUOTED-PRINTABLE")
            }
            None => param.eq_ignore_ascii_case("QUOTED-PRINTABLE"),
        }
    })
}

fn convert_property(lhs: &str, value: &str) -> Result<String> {
    let mut parts = lhs.split(';');
    let head = parts.next().unwrap_or_default();
    let (group, name) = match head.split_once('.') {
        Some((group, name)) => (Some(group), name),
        None => (None, head),
    };
    let name = name.trim().to_ascii_uppercase();

    let params = LegacyParams::parse(parts, &name);
    let value = params.decode(value, &name)?;

    let mut line = String::new();
    if let Some(group) = group {
        line.push_str(group);
        line.push('.');
    }
    line.push_str(&name);
    for param in params.render() {
        line.push(';');
        line.push_str(&param);
    }
    line.push(':');
    line.push_str(&value);
    Ok(line)
}

#[derive(Debug, Default)]
struct LegacyParams {
    types: Vec<String>,
    other: Vec<(String, String)>,
    pref: bool,
    media_type: Option<String>,
    quoted_printable: bool,
    base64: bool,
}

impl LegacyParams {
    fn parse<'a>(raw: impl Iterator<Item = &'a str>, property: &str) -> Self {
        let mut params = Self::default();
        let media_property = is_media_property(property);

        for param in raw.map(str::trim).filter(|p| !p.is_empty()) {
            let Some((name, value)) = param.split_once('=') else {
                params.positional(param, media_property);
                continue;
            };

            match name.trim().to_ascii_uppercase().as_str() {
                "CHARSET" => {}
                "ENCODING" => match value.trim().to_ascii_uppercase().as_str() {
                    "QUOTED-PRINTABLE" => params.quoted_printable = true,
                    "B" | "BASE64" => params.base64 = true,
                    _ => {}
                },
                "TYPE" => {
                    for item in unquote(value).split(',') {
                        params.positional(item.trim(), media_property);
                    }
                }
                "PREF" => params.pref = true,
                "VALUE" if value.trim().eq_ignore_ascii_case("url") => {
                    params.other.push(("VALUE".to_string(), "uri".to_string()));
                }
                "VALUE" if value.trim().eq_ignore_ascii_case("binary") => {
                    params.base64 = true;
                }
                other => params.other.push((other.to_string(), unquote(value).to_string())),
            }
        }

        params
    }

    fn positional(&mut self, item: &str, media_property: bool) {
        if item.is_empty() {
            return;
        }
        match item.to_ascii_uppercase().as_str() {
            "PREF" => self.pref = true,
            "BASE64" | "B" => self.base64 = true,
            "QUOTED-PRINTABLE" => self.quoted_printable = true,
            "7BIT" | "8BIT" => {}
            upper => match media_property.then(|| media_type(upper)).flatten() {
                Some(media) => self.media_type = Some(media.to_string()),
                None => {
                    if !self.types.iter().any(|t| t.eq_ignore_ascii_case(item)) {
                        self.types.push(item.to_ascii_uppercase());
                    }
                }
            },
        }
    }

    fn decode(&self, value: &str, property: &str) -> Result<String> {
        let mut out = value.trim().to_string();

        if self.quoted_printable {
            out = decode_quoted_printable(&out)?
                .replace('\r', "")
                .replace('\n', "\\n");
        }

        if self.base64 {
            out.retain(|c| !c.is_whitespace());
            if is_media_property(property) {
                let media = self.media_type.as_deref().unwrap_or(OCTET_STREAM);
                out = format!("data:{};base64,{}", media, out);
            }
        }

        Ok(out)
    }

    fn render(&self) -> Vec<String> {
        let mut out = Vec::new();
        if !self.types.is_empty() {
            out.push(format!("TYPE={}", self.types.join(",")));
        }
        if self.pref {
            out.push("PREF=1".to_string());
        }
        if let Some(media) = &self.media_type {
            out.push(format!("MEDIATYPE={}", media));
        }
        for (name, value) in &self.other {
            if value.contains([',', ';', ':']) {
                out.push(format!("{}=\"{}\"", name, value));
            } else {
                out.push(format!("{}={}", name, value));
            }
        }
        out
    }
}

fn is_media_property(name: &str) -> bool {
    matches!(name, "PHOTO" | "LOGO")
}

fn media_type(upper: &str) -> Option<&'static str> {
    match upper {
        "JPEG" | "JPG" | "IMAGE/JPEG" => Some("image/jpeg"),
        "PNG" | "IMAGE/PNG" => Some("image/png"),
        "GIF" | "IMAGE/GIF" => Some("image/gif"),
        _ => None,
    }
}

fn unquote(value: &str) -> &str {
    let trimmed = value.trim();
    trimmed
        .strip_prefix('"')
        .and_then(|v| v.strip_suffix('"'))
        .unwrap_or(trimmed)
}

fn decode_quoted_printable(input: &str) -> Result<String> {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;

    while i < bytes.len() {
        if bytes[i] != b'=' {
            out.push(bytes[i]);
            i += 1;
            continue;
        }

        match bytes.get(i + 1..i + 3) {
            Some(&[hi, lo]) if hi.is_ascii_hexdigit() && lo.is_ascii_hexdigit() => {
                out.push((hex_value(hi) << 4) | hex_value(lo));
                i += 3;
            }
            // Trailing soft break.
            None if i + 1 == bytes.len() => break,
            _ => bail!("invalid quoted-printable escape at byte {}", i),
        }
    }

    String::from_utf8(out).map_err(|err| anyhow!("invalid UTF-8 in quoted-printable value: {}", err))
}

fn hex_value(digit: u8) -> u8 {
    match digit {
        b'0'..=b'9' => digit - b'0',
        b'a'..=b'f' => digit - b'a' + 10,
        _ => digit - b'A' + 10,
    }
}
