//! IMAP FETCH data parsing.
//!
//! Turns the parenthesized FETCH attribute list into [`Item`] trees and walks
//! `BODYSTRUCTURE` into leaf parts with their section paths, so the session
//! can list attachments and fetch single parts without downloading whole
//! messages.

use std::collections::HashMap;
use std::vec::IntoIter;

use encoding_rs::Encoding;

/// One value in IMAP response data.
#[derive(Debug, Clone, PartialEq)]
pub enum Item {
    Nil,
    Atom(String),
    /// Quoted string or literal.
    Str(Vec<u8>),
    List(Vec<Item>),
}

impl Item {
    /// String or atom value as text.
    pub fn text(&self) -> Option<String> {
        match self {
            Item::Atom(a) => Some(a.clone()),
            Item::Str(s) => Some(String::from_utf8_lossy(s).into_owned()),
            _ => None,
        }
    }

    pub fn number(&self) -> Option<u64> {
        match self {
            Item::Atom(a) => a.parse().ok(),
            Item::Str(s) => std::str::from_utf8(s).ok()?.trim().parse().ok(),
            _ => None,
        }
    }

    /// Raw bytes of a string, literal or `NIL` (empty).
    pub fn bytes(&self) -> Option<&[u8]> {
        match self {
            Item::Str(s) => Some(s),
            Item::Nil => Some(&[]),
            _ => None,
        }
    }

    fn list(&self) -> Option<&[Item]> {
        match self {
            Item::List(items) => Some(items),
            _ => None,
        }
    }
}

struct Lexer<'a> {
    text: &'a [u8],
    pos: usize,
    literals: IntoIter<Vec<u8>>,
}

impl Lexer<'_> {
    fn peek(&self) -> Option<u8> {
        self.text.get(self.pos).copied()
    }

    fn skip_spaces(&mut self) {
        while self.peek() == Some(b' ') {
            self.pos += 1;
        }
    }

    fn item(&mut self) -> Result<Item, String> {
        self.skip_spaces();
        match self.peek() {
            None => Err("unexpected end of response".into()),
            Some(b'(') => {
                self.pos += 1;
                let mut items = Vec::new();
                loop {
                    self.skip_spaces();
                    match self.peek() {
                        Some(b')') => {
                            self.pos += 1;
                            return Ok(Item::List(items));
                        }
                        None => return Err("unterminated list".into()),
                        Some(_) => items.push(self.item()?),
                    }
                }
            }
            Some(b'"') => self.quoted(),
            Some(b'{') => self.literal(),
            Some(b')') => Err(format!("unexpected ')' at {}", self.pos)),
            Some(_) => Ok(self.atom()),
        }
    }

    fn quoted(&mut self) -> Result<Item, String> {
        self.pos += 1;
        let mut out = Vec::new();
        loop {
            match self.peek() {
                None => return Err("unterminated quoted string".into()),
                Some(b'"') => {
                    self.pos += 1;
                    return Ok(Item::Str(out));
                }
                Some(b'\\') => {
                    self.pos += 1;
                    if let Some(escaped) = self.peek() {
                        out.push(escaped);
                        self.pos += 1;
                    }
                }
                Some(b) => {
                    out.push(b);
                    self.pos += 1;
                }
            }
        }
    }

    fn literal(&mut self) -> Result<Item, String> {
        let close = self.text[self.pos..]
            .iter()
            .position(|b| *b == b'}')
            .ok_or("unterminated literal length")?;
        self.pos += close + 1;
        self.literals
            .next()
            .map(Item::Str)
            .ok_or_else(|| "literal announced but not received".to_string())
    }

    /// Atoms run to a space or paren; `[...]` sections are kept whole, so
    /// `BODY[HEADER.FIELDS (MESSAGE-ID)]` is one atom.
    fn atom(&mut self) -> Item {
        let start = self.pos;
        let mut depth = 0usize;
        while let Some(b) = self.peek() {
            match b {
                b'[' => depth += 1,
                b']' => depth = depth.saturating_sub(1),
                b' ' | b'(' | b')' if depth == 0 => break,
                _ => {}
            }
            self.pos += 1;
        }
        let atom = String::from_utf8_lossy(&self.text[start..self.pos]).into_owned();
        if atom.eq_ignore_ascii_case("NIL") {
            Item::Nil
        } else {
            Item::Atom(atom)
        }
    }
}

/// Attributes of one `* <n> FETCH (...)` response, keys uppercased. `None`
/// for any other untagged response.
pub fn fetch_attributes(text: &str, literals: Vec<Vec<u8>>) -> Result<Option<Vec<(String, Item)>>, String> {
    let mut words = text.splitn(4, ' ');
    let (Some("*"), Some(seq), Some(verb)) = (words.next(), words.next(), words.next()) else {
        return Ok(None);
    };
    if seq.parse::<u32>().is_err() || !verb.eq_ignore_ascii_case("FETCH") {
        return Ok(None);
    }
    let rest = words.next().unwrap_or_default();

    let mut lexer = Lexer {
        text: rest.as_bytes(),
        pos: 0,
        literals: literals.into_iter(),
    };
    let Item::List(items) = lexer.item()? else {
        return Err("FETCH data is not a list".into());
    };

    let mut attributes = Vec::with_capacity(items.len() / 2);
    let mut items = items.into_iter();
    while let (Some(key), Some(value)) = (items.next(), items.next()) {
        let Item::Atom(key) = key else {
            return Err(format!("FETCH attribute name expected, got {key:?}"));
        };
        attributes.push((key.to_ascii_uppercase(), value));
    }
    Ok(Some(attributes))
}

/// First attribute whose name starts with `prefix`.
pub fn attribute<'a>(attributes: &'a [(String, Item)], prefix: &str) -> Option<&'a Item> {
    attributes
        .iter()
        .find(|(key, _)| key.starts_with(prefix))
        .map(|(_, value)| value)
}

// ── BODYSTRUCTURE ───────────────────────────────────────────────────

/// A non-multipart body part.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BodyPart {
    /// Section path for `BODY[<section>]`, e.g. `1.2`.
    pub section: String,
    /// Lowercase `type/subtype`.
    pub content_type: String,
    pub charset: Option<String>,
    pub disposition: Option<String>,
    pub filename: Option<String>,
    pub encoding: Option<String>,
    pub size: usize,
}

impl BodyPart {
    /// Attachment by the same rule mail clients use: declared as one, named,
    /// or not text.
    pub fn is_attachment(&self) -> bool {
        self.disposition.as_deref() == Some("attachment")
            || self.filename.is_some()
            || !self.content_type.starts_with("text/")
    }
}

/// Leaf parts of a `BODYSTRUCTURE`, in section order.
pub fn leaf_parts(structure: &Item) -> Vec<BodyPart> {
    let mut parts = Vec::new();
    walk(structure, "", &mut parts);
    parts
}

fn walk(item: &Item, section: &str, out: &mut Vec<BodyPart>) {
    let Some(fields) = item.list() else { return };

    if matches!(fields.first(), Some(Item::List(_))) {
        let children = fields.iter().take_while(|f| matches!(f, Item::List(_)));
        for (i, child) in children.enumerate() {
            let child_section = if section.is_empty() {
                (i + 1).to_string()
            } else {
                format!("{section}.{}", i + 1)
            };
            walk(child, &child_section, out);
        }
        return;
    }

    // A single-part message has the one section "1".
    let section = if section.is_empty() { "1" } else { section };
    out.push(leaf(fields, section));
}

fn lower(item: Option<&Item>) -> Option<String> {
    item.and_then(Item::text).map(|t| t.to_ascii_lowercase())
}

/// `("KEY" "value" ...)` into a map with lowercase keys.
fn params(item: Option<&Item>) -> HashMap<String, String> {
    let Some(items) = item.and_then(Item::list) else {
        return HashMap::new();
    };
    items
        .chunks(2)
        .filter_map(|pair| match pair {
            [key, value] => Some((key.text()?.to_ascii_lowercase(), value.text()?)),
            _ => None,
        })
        .collect()
}

/// `name`, or its RFC 2231 `name*` form decoded.
fn param_value(params: &HashMap<String, String>, name: &str) -> Option<String> {
    if let Some(extended) = params.get(&format!("{name}*")) {
        return Some(decode_extended(extended));
    }
    params.get(name).cloned()
}

/// Decode `charset'lang'percent-encoded` (RFC 2231).
pub fn decode_extended(value: &str) -> String {
    let mut pieces = value.splitn(3, '\'');
    let (Some(charset), Some(_lang), Some(encoded)) = (pieces.next(), pieces.next(), pieces.next()) else {
        return value.to_string();
    };

    let raw = encoded.as_bytes();
    let mut bytes = Vec::with_capacity(raw.len());
    let mut i = 0;
    while i < raw.len() {
        let hex = (raw[i] == b'%')
            .then(|| raw.get(i + 1..i + 3))
            .flatten()
            .and_then(|h| std::str::from_utf8(h).ok())
            .and_then(|h| u8::from_str_radix(h, 16).ok());
        match hex {
            Some(b) => {
                bytes.push(b);
                i += 3;
            }
            None => {
                bytes.push(raw[i]);
                i += 1;
            }
        }
    }

    match Encoding::for_label(charset.trim().as_bytes()) {
        Some(encoding) => encoding.decode(&bytes).0.into_owned(),
        None => String::from_utf8_lossy(&bytes).into_owned(),
    }
}

fn leaf(fields: &[Item], section: &str) -> BodyPart {
    let ctype = lower(fields.first()).unwrap_or_else(|| "application".into());
    let subtype = lower(fields.get(1)).unwrap_or_else(|| "octet-stream".into());
    let type_params = params(fields.get(2));

    // Extension data shifts by the type-specific fields.
    let disposition_at = match (ctype.as_str(), subtype.as_str()) {
        ("text", _) => 9,
        ("message", "rfc822") => 11,
        _ => 8,
    };
    let disposition = fields.get(disposition_at).and_then(Item::list);
    let disposition_type = lower(disposition.and_then(|d| d.first()));
    let disposition_params = params(disposition.and_then(|d| d.get(1)));

    let filename = param_value(&disposition_params, "filename").or_else(|| param_value(&type_params, "name"));

    BodyPart {
        section: section.to_string(),
        content_type: format!("{ctype}/{subtype}"),
        charset: type_params.get("charset").cloned(),
        disposition: disposition_type,
        filename,
        encoding: lower(fields.get(5)),
        size: fields.get(6).and_then(Item::number).unwrap_or(0) as usize,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Gmail-style structure: text and html alternatives, a pdf, and an exe.
    const MIXED: &str = "* 3 FETCH (UID 17 BODYSTRUCTURE (((\"TEXT\" \"PLAIN\" (\"CHARSET\" \"UTF-8\") NIL NIL \"7BIT\" 34 2 NIL NIL NIL NIL)\
(\"TEXT\" \"HTML\" (\"CHARSET\" \"UTF-8\") NIL NIL \"QUOTED-PRINTABLE\" 120 3 NIL NIL NIL NIL) \"ALTERNATIVE\" (\"BOUNDARY\" \"alt\") NIL NIL NIL)\
(\"APPLICATION\" \"PDF\" (\"NAME\" \"offer.pdf\") NIL NIL \"BASE64\" 4410 NIL (\"ATTACHMENT\" (\"FILENAME\" \"offer.pdf\")) NIL NIL)\
(\"APPLICATION\" \"X-MSDOWNLOAD\" (\"NAME\" \"setup.exe\") NIL NIL \"BASE64\" 8 NIL (\"attachment\" (\"filename\" \"setup.exe\")) NIL NIL) \
\"MIXED\" (\"BOUNDARY\" \"XX\") NIL NIL NIL))";

    fn structure(text: &str) -> Item {
        let attributes = fetch_attributes(text, Vec::new()).unwrap().unwrap();
        attribute(&attributes, "BODYSTRUCTURE").unwrap().clone()
    }

    #[test]
    fn sections_follow_nesting() {
        let parts = leaf_parts(&structure(MIXED));
        let sections: Vec<_> = parts.iter().map(|p| p.section.as_str()).collect();
        assert_eq!(sections, vec!["1.1", "1.2", "2", "3"]);
        assert_eq!(parts[0].content_type, "text/plain");
        assert_eq!(parts[0].charset.as_deref(), Some("UTF-8"));
        assert!(!parts[0].is_attachment());
        assert!(!parts[1].is_attachment());
    }

    #[test]
    fn attachment_parts_carry_disposition_and_size() {
        let parts = leaf_parts(&structure(MIXED));
        let pdf = &parts[2];
        assert!(pdf.is_attachment());
        assert_eq!(pdf.content_type, "application/pdf");
        assert_eq!(pdf.disposition.as_deref(), Some("attachment"));
        assert_eq!(pdf.filename.as_deref(), Some("offer.pdf"));
        assert_eq!(pdf.encoding.as_deref(), Some("base64"));
        assert_eq!(pdf.size, 4410);
        assert_eq!(parts[3].filename.as_deref(), Some("setup.exe"));
    }

    #[test]
    fn single_part_message_is_section_one() {
        let parts = leaf_parts(&structure(
            "* 1 FETCH (UID 4 BODYSTRUCTURE (\"TEXT\" \"PLAIN\" (\"CHARSET\" \"us-ascii\") NIL NIL \"7BIT\" 12 1 NIL NIL NIL NIL))",
        ));
        assert_eq!(parts.len(), 1);
        assert_eq!(parts[0].section, "1");
        assert!(!parts[0].is_attachment());
    }

    #[test]
    fn literal_filenames_and_header_sections() {
        let text = "* 2 FETCH (UID 9 BODYSTRUCTURE ((\"TEXT\" \"PLAIN\" NIL NIL NIL \"7BIT\" 3 1 NIL NIL NIL NIL)\
(\"APPLICATION\" \"PDF\" NIL NIL NIL \"BASE64\" 10 NIL (\"ATTACHMENT\" (\"FILENAME\" {10})) NIL NIL) \"MIXED\" NIL NIL NIL NIL) \
BODY[HEADER.FIELDS (MESSAGE-ID)] {24})";
        let literals = vec![b"oferta.pdf".to_vec(), b"Message-ID: <a@b>\r\n\r\n".to_vec()];
        let attributes = fetch_attributes(text, literals).unwrap().unwrap();

        assert_eq!(attribute(&attributes, "UID").and_then(Item::number), Some(9));
        let parts = leaf_parts(attribute(&attributes, "BODYSTRUCTURE").unwrap());
        assert_eq!(parts[1].filename.as_deref(), Some("oferta.pdf"));
        let header = attribute(&attributes, "BODY[HEADER").and_then(Item::bytes).unwrap();
        assert!(header.starts_with(b"Message-ID"));
    }

    #[test]
    fn extended_filenames_are_decoded() {
        assert_eq!(decode_extended("utf-8''Oferta%20%C5%81%C3%B3d%C5%BA.pdf"), "Oferta Łódź.pdf");
        assert_eq!(decode_extended("iso-8859-2'pl'%A3%F3d%BC.pdf"), "Łódź.pdf");
        assert_eq!(decode_extended("no-quotes"), "no-quotes");

        let parts = leaf_parts(&structure(
            "* 1 FETCH (BODYSTRUCTURE (\"APPLICATION\" \"PDF\" NIL NIL NIL \"BASE64\" 10 NIL (\"ATTACHMENT\" (\"FILENAME*\" \"utf-8''cennik%202024.pdf\")) NIL NIL))",
        ));
        assert_eq!(parts[0].filename.as_deref(), Some("cennik 2024.pdf"));
    }

    #[test]
    fn quoted_escapes_and_nil() {
        let attributes = fetch_attributes("* 5 FETCH (X \"a\\\"b\" Y NIL)", Vec::new())
            .unwrap()
            .unwrap();
        assert_eq!(attribute(&attributes, "X"), Some(&Item::Str(b"a\"b".to_vec())));
        assert_eq!(attribute(&attributes, "Y"), Some(&Item::Nil));
    }

    #[test]
    fn other_untagged_responses_are_ignored() {
        assert_eq!(fetch_attributes("* 23 EXISTS", Vec::new()).unwrap(), None);
        assert_eq!(fetch_attributes("* SEARCH 1 2", Vec::new()).unwrap(), None);
    }

    #[test]
    fn missing_literal_is_an_error() {
        assert!(fetch_attributes("* 1 FETCH (BODY[2] {4})", Vec::new()).is_err());
    }
}
