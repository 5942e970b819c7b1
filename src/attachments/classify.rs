//! Attachment classification and filename decoding.

use std::sync::LazyLock;
use std::sync::atomic::{AtomicU64, Ordering};

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use encoding_rs::Encoding;
use regex::Regex;
use tracing::warn;

/// Extensions accepted regardless of MIME type.
pub const ALLOWED_EXTENSIONS: &[&str] = &[
    "pdf", "doc", "docx", "xls", "xlsx", "csv", "png", "jpg", "jpeg", "txt",
];

/// MIME types accepted regardless of extension.
pub const ALLOWED_MIME_TYPES: &[&str] = &[
    "application/pdf",
    "application/msword",
    "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
    "application/vnd.ms-excel",
    "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
    "text/csv",
    "text/plain",
    "image/png",
    "image/jpeg",
];

/// Characters replaced with `-` in attachment filenames.
const RESERVED_CHARS: &[char] = &['/', '\\', '?', '%', '*', ':', '|', '"', '<', '>'];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classification {
    pub allowed: bool,
    /// Lowercase, without the dot.
    pub extension: Option<String>,
}

/// Lowercase extension of `filename`, if any.
pub fn extension_of(filename: &str) -> Option<String> {
    let (stem, ext) = filename.rsplit_once('.')?;
    if stem.is_empty() || ext.is_empty() {
        return None;
    }
    Some(ext.to_ascii_lowercase())
}

/// Extension implied by an allow-listed MIME type.
pub fn extension_for_mime(mime_type: &str) -> Option<&'static str> {
    let mime = mime_type.split(';').next().unwrap_or_default().trim().to_ascii_lowercase();
    let ext = match mime.as_str() {
        "application/pdf" => "pdf",
        "application/msword" => "doc",
        "application/vnd.openxmlformats-officedocument.wordprocessingml.document" => "docx",
        "application/vnd.ms-excel" => "xls",
        "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet" => "xlsx",
        "text/csv" => "csv",
        "text/plain" => "txt",
        "image/png" => "png",
        "image/jpeg" => "jpg",
        _ => return None,
    };
    Some(ext)
}

/// Allowed when either the extension or the MIME type is on its allow-list.
pub fn classify(filename: &str, mime_type: &str) -> Classification {
    let extension = extension_of(filename);
    let by_extension = extension
        .as_deref()
        .is_some_and(|ext| ALLOWED_EXTENSIONS.contains(&ext));
    let mime = mime_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase();
    let by_mime = ALLOWED_MIME_TYPES.contains(&mime.as_str());
    Classification {
        allowed: by_extension || by_mime,
        extension,
    }
}

/// Decodes and sanitizes attachment filenames. Owns the counter used for
/// synthetic names, so names are unique for the lifetime of the owner.
#[derive(Debug, Default)]
pub struct FilenameSanitizer {
    unnamed: AtomicU64,
}

impl FilenameSanitizer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode encoded words and replace reserved characters. Empty names get
    /// `unnamed_attachment_<n>`.
    pub fn decode(&self, raw: Option<&str>) -> String {
        let decoded = raw.map(decode_encoded_words).unwrap_or_default();
        let cleaned: String = decoded
            .trim()
            .chars()
            .map(|c| {
                if RESERVED_CHARS.contains(&c) || c.is_control() {
                    '-'
                } else {
                    c
                }
            })
            .collect();

        if cleaned.is_empty() || cleaned == "." || cleaned == ".." {
            let n = self.unnamed.fetch_add(1, Ordering::Relaxed) + 1;
            return format!("unnamed_attachment_{n}");
        }
        cleaned
    }
}

static ENCODED_WORD: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"=\?([^?]+)\?([bBqQ])\?([^?]*)\?=").expect("encoded-word pattern is valid")
});

/// Decode RFC 2047 encoded words (`=?charset?Q|B?text?=`) from their declared
/// charset. Words that fail to decode are left as-is; whitespace between
/// adjacent words is dropped.
pub fn decode_encoded_words(input: &str) -> String {
    let re = &*ENCODED_WORD;
    let mut out = String::with_capacity(input.len());
    let mut last = 0;
    let mut prev_was_word = false;

    for caps in re.captures_iter(input) {
        let Some(whole) = caps.get(0) else { continue };
        let between = &input[last..whole.start()];
        if !(prev_was_word && between.trim().is_empty()) {
            out.push_str(between);
        }

        let charset = &caps[1];
        let encoding = &caps[2];
        let text = &caps[3];
        let bytes = if encoding.eq_ignore_ascii_case("b") {
            STANDARD.decode(text).ok()
        } else {
            Some(decode_q(text))
        };
        match bytes {
            Some(bytes) => out.push_str(&decode_charset(charset, &bytes)),
            None => out.push_str(whole.as_str()),
        }

        last = whole.end();
        prev_was_word = true;
    }
    out.push_str(&input[last..]);
    out
}

/// Decode `bytes` from a MIME charset label, falling back to lossy UTF-8 for
/// labels the WHATWG registry does not know.
fn decode_charset(charset: &str, bytes: &[u8]) -> String {
    // RFC 2231 allows a language suffix: `iso-8859-2*pl`.
    let label = charset.split('*').next().unwrap_or(charset).trim();
    match Encoding::for_label(label.as_bytes()) {
        Some(encoding) => encoding.decode(bytes).0.into_owned(),
        None => {
            warn!(charset = label, "Unknown charset, falling back to UTF-8 lossy");
            String::from_utf8_lossy(bytes).into_owned()
        }
    }
}

fn decode_q(text: &str) -> Vec<u8> {
    let bytes = text.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'_' => out.push(b' '),
            b'=' => {
                let hex = bytes.get(i + 1..i + 3).and_then(|h| std::str::from_utf8(h).ok());
                match hex.and_then(|h| u8::from_str_radix(h, 16).ok()) {
                    Some(b) => {
                        out.push(b);
                        i += 2;
                    }
                    None => out.push(b'='),
                }
            }
            b => out.push(b),
        }
        i += 1;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification_is_a_union() {
        assert!(classify("offer.pdf", "application/octet-stream").allowed);
        assert!(classify("scan", "image/png").allowed);
        assert!(classify("OFFER.PDF", "").allowed);
        assert!(classify("data.bin", "text/csv; charset=utf-8").allowed);
        let exe = classify("setup.exe", "application/x-msdownload");
        assert!(!exe.allowed);
        assert_eq!(exe.extension.as_deref(), Some("exe"));
    }

    #[test]
    fn mime_implies_extension() {
        assert_eq!(extension_for_mime("image/jpeg"), Some("jpg"));
        assert_eq!(extension_for_mime("Application/PDF; name=x"), Some("pdf"));
        assert_eq!(extension_for_mime("application/zip"), None);
    }

    #[test]
    fn extension_rules() {
        assert_eq!(extension_of("a.tar.gz").as_deref(), Some("gz"));
        assert_eq!(extension_of(".hidden"), None);
        assert_eq!(extension_of("noext"), None);
    }

    #[test]
    fn reserved_characters_replaced() {
        let s = FilenameSanitizer::new();
        assert_eq!(s.decode(Some("a/b\\c?d%e*f:g|h\"i<j>k.pdf")), "a-b-c-d-e-f-g-h-i-j-k.pdf");
    }

    #[test]
    fn unnamed_counter_is_monotonic() {
        let s = FilenameSanitizer::new();
        assert_eq!(s.decode(None), "unnamed_attachment_1");
        assert_eq!(s.decode(Some("")), "unnamed_attachment_2");
        assert_eq!(s.decode(Some("   ")), "unnamed_attachment_3");
    }

    #[test]
    fn decodes_q_words() {
        assert_eq!(
            decode_encoded_words("=?UTF-8?Q?Angebot_K=C3=BCche.pdf?="),
            "Angebot Küche.pdf"
        );
    }

    #[test]
    fn decodes_b_words_and_joins_adjacent() {
        assert_eq!(
            decode_encoded_words("=?utf-8?B?T2ZmZXI=?= =?utf-8?B?LnBkZg==?="),
            "Offer.pdf"
        );
    }

    #[test]
    fn decodes_iso_8859_2_words() {
        assert_eq!(
            decode_encoded_words("=?ISO-8859-2?Q?Oferta_=A3=F3d=BC.pdf?="),
            "Oferta Łódź.pdf"
        );
        assert_eq!(decode_encoded_words("=?iso-8859-2?B?o/NkvA==?=.pdf"), "Łódź.pdf");
    }

    #[test]
    fn decodes_windows_1250_words() {
        assert_eq!(
            decode_encoded_words("=?windows-1250?Q?Cennik_=9Cl=B9ski.xlsx?="),
            "Cennik śląski.xlsx"
        );
    }

    #[test]
    fn language_suffix_is_ignored() {
        assert_eq!(decode_encoded_words("=?ISO-8859-2*pl?Q?=A3=F3d=BC?="), "Łódź");
    }

    #[test]
    fn unknown_charset_falls_back_to_utf8() {
        assert_eq!(decode_encoded_words("=?x-made-up?Q?K=C3=BCche?="), "Küche");
    }

    #[test]
    fn plain_text_untouched() {
        assert_eq!(decode_encoded_words("plain name.docx"), "plain name.docx");
    }
}
