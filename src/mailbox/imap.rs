//! IMAP over TLS with XOAUTH2.
//!
//! A blocking rustls stream driven from `spawn_blocking`. All commands use
//! UIDs. Listing reads `BODYSTRUCTURE` only; the body text and each
//! attachment are fetched as single sections with `BODY.PEEK[<section>]`, so
//! reading never sets `\Seen` implicitly. Push mode is `IDLE`, re-issued
//! every keep-alive period.

use std::io::{self, BufRead, BufReader, Read, Write};
use std::net::TcpStream;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use mail_parser::MessageParser;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::bodystructure::{BodyPart, Item, attribute, fetch_attributes, leaf_parts};
use super::{
    Mailbox, MailboxEvent, MailboxSession, MessageContent, MessageRef, PartDescriptor,
    Subscription,
};
use crate::auth::{TokenSource, xoauth2_payload};
use crate::config::{env_or, env_parse, env_required, env_secs};
use crate::error::{ConfigError, MailboxError};

type TlsStream = rustls::StreamOwned<rustls::ClientConnection, TcpStream>;

/// How often the idle loop wakes up to check its stop flag.
const IDLE_POLL: Duration = Duration::from_secs(1);

/// Largest literal accepted from the server.
const MAX_LITERAL: usize = 64 * 1024 * 1024;

// ── Configuration ───────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct ImapConfig {
    pub host: String,
    pub port: u16,
    /// Mailbox address, also the XOAUTH2 user.
    pub user: String,
    /// Folder to watch.
    pub folder: String,
    /// IDLE is re-issued after this long (servers drop idlers after ~29 min).
    pub idle_keepalive: Duration,
    pub io_timeout: Duration,
}

impl ImapConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            host: env_or("INTAKE_IMAP_HOST", "imap.gmail.com"),
            port: env_parse("INTAKE_IMAP_PORT", 993)?,
            user: env_required("INTAKE_EMAIL_ADDRESS")?,
            folder: env_or("INTAKE_MAILBOX", "INBOX"),
            idle_keepalive: env_secs("INTAKE_IDLE_KEEPALIVE_SECS", 1500)?,
            io_timeout: Duration::from_secs(30),
        })
    }
}

// ── Response parsing ────────────────────────────────────────────────

/// One server response with its literals pulled out.
#[derive(Debug, Default)]
struct Response {
    text: String,
    literals: Vec<Vec<u8>>,
}

/// Length of the `{n}` literal announced at the end of `line`.
fn literal_len(line: &str) -> Option<usize> {
    let body = line.strip_suffix('}')?;
    let open = body.rfind('{')?;
    body[open + 1..].trim_end_matches('+').parse().ok()
}

/// UIDs from `* SEARCH` responses.
fn parse_search<'a>(lines: impl IntoIterator<Item = &'a str>) -> Vec<u32> {
    let mut uids: Vec<u32> = lines
        .into_iter()
        .filter_map(|l| l.strip_prefix("* SEARCH"))
        .flat_map(|rest| rest.split_whitespace().filter_map(|n| n.parse().ok()))
        .collect();
    uids.sort_unstable();
    uids.dedup();
    uids
}

/// Whether an untagged line announces new messages (`* <n> EXISTS`).
fn is_exists(line: &str) -> bool {
    let mut words = line.split_whitespace();
    matches!(
        (words.next(), words.next().map(|n| n.parse::<u32>().is_ok()), words.next()),
        (Some("*"), Some(true), Some(w)) if w.eq_ignore_ascii_case("EXISTS")
    )
}

fn quote(s: &str) -> String {
    format!("\"{}\"", s.replace('\\', "\\\\").replace('"', "\\\""))
}

/// Compact UID set: `1:3,7,9:10`.
fn uid_set(uids: &[u32]) -> String {
    let mut ranges: Vec<String> = Vec::new();
    let mut iter = uids.iter().copied().peekable();
    while let Some(start) = iter.next() {
        let mut end = start;
        while iter.peek() == Some(&(end + 1)) {
            end += 1;
            iter.next();
        }
        ranges.push(if start == end {
            start.to_string()
        } else {
            format!("{start}:{end}")
        });
    }
    ranges.join(",")
}

fn io_error(e: io::Error) -> MailboxError {
    if e.kind() == io::ErrorKind::UnexpectedEof {
        MailboxError::Closed
    } else {
        MailboxError::Io(e)
    }
}

fn is_timeout(e: &io::Error) -> bool {
    matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut)
}

// ── Connection ──────────────────────────────────────────────────────

struct Connection {
    reader: BufReader<TlsStream>,
    next_tag: u32,
    /// Partial line carried across read timeouts.
    pending: Vec<u8>,
    io_timeout: Duration,
}

impl Connection {
    fn open(config: &ImapConfig, tls: Arc<rustls::ClientConfig>) -> Result<Self, MailboxError> {
        let failed = |reason: String| MailboxError::ConnectFailed {
            host: config.host.clone(),
            reason,
        };

        let tcp = TcpStream::connect((config.host.as_str(), config.port))
            .map_err(|e| failed(e.to_string()))?;
        tcp.set_read_timeout(Some(config.io_timeout))?;
        tcp.set_write_timeout(Some(config.io_timeout))?;

        let server_name = rustls::pki_types::ServerName::try_from(config.host.clone())
            .map_err(|e| failed(e.to_string()))?;
        let conn = rustls::ClientConnection::new(tls, server_name).map_err(|e| failed(e.to_string()))?;

        let mut connection = Self {
            reader: BufReader::new(rustls::StreamOwned::new(conn, tcp)),
            next_tag: 1,
            pending: Vec::new(),
            io_timeout: config.io_timeout,
        };

        let greeting = connection.read_response()?;
        if !greeting.text.starts_with("* OK") && !greeting.text.starts_with("* PREAUTH") {
            return Err(failed(format!("unexpected greeting: {}", greeting.text)));
        }
        Ok(connection)
    }

    fn tag(&mut self) -> String {
        let tag = format!("A{:04}", self.next_tag);
        self.next_tag += 1;
        tag
    }

    fn set_read_timeout(&mut self, timeout: Duration) -> Result<(), MailboxError> {
        self.reader.get_ref().sock.set_read_timeout(Some(timeout))?;
        Ok(())
    }

    fn write_line(&mut self, line: &str) -> Result<(), MailboxError> {
        let stream = self.reader.get_mut();
        stream.write_all(line.as_bytes()).map_err(io_error)?;
        stream.write_all(b"\r\n").map_err(io_error)?;
        stream.flush().map_err(io_error)
    }

    /// One CRLF-terminated line. Bytes read before a timeout are kept and the
    /// next call resumes the same line.
    fn read_raw_line(&mut self) -> io::Result<Vec<u8>> {
        loop {
            match self.reader.read_until(b'\n', &mut self.pending) {
                Ok(0) => {
                    return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "connection closed"));
                }
                Ok(_) if self.pending.ends_with(b"\n") => return Ok(std::mem::take(&mut self.pending)),
                Ok(_) => continue,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }

    /// One response, following `{n}` literals to the end of the logical line.
    fn read_response(&mut self) -> Result<Response, MailboxError> {
        let mut response = Response::default();
        loop {
            let raw = self.read_raw_line().map_err(io_error)?;
            let line = String::from_utf8_lossy(&raw);
            let line = line.trim_end_matches(['\r', '\n']);
            response.text.push_str(line);

            let Some(len) = literal_len(line) else {
                return Ok(response);
            };
            if len > MAX_LITERAL {
                return Err(MailboxError::Protocol(format!("literal of {len} bytes exceeds limit")));
            }
            let mut literal = vec![0u8; len];
            self.reader.read_exact(&mut literal).map_err(io_error)?;
            response.literals.push(literal);
        }
    }

    /// Send a tagged command and collect untagged responses until it
    /// completes. A non-OK completion is a protocol error.
    fn command(&mut self, command: &str) -> Result<Vec<Response>, MailboxError> {
        let tag = self.tag();
        self.write_line(&format!("{tag} {command}"))?;

        let verb: String = command.split_whitespace().take(2).collect::<Vec<_>>().join(" ");
        let prefix = format!("{tag} ");
        let mut untagged = Vec::new();
        loop {
            let response = self.read_response()?;
            if response.text.starts_with('+') {
                // SASL error challenge; an empty reply makes the server finish.
                self.write_line("")?;
                continue;
            }
            if let Some(status) = response.text.strip_prefix(&prefix) {
                if status.starts_with("OK") {
                    return Ok(untagged);
                }
                return Err(MailboxError::Protocol(format!("{verb}: {status}")));
            }
            untagged.push(response);
        }
    }

    fn authenticate(&mut self, user: &str, payload: &str) -> Result<(), MailboxError> {
        match self.command(&format!("AUTHENTICATE XOAUTH2 {payload}")) {
            Ok(_) => Ok(()),
            Err(MailboxError::Protocol(reason)) => Err(MailboxError::AuthFailed {
                user: user.to_string(),
                reason,
            }),
            Err(e) => Err(e),
        }
    }

    fn select(&mut self, folder: &str) -> Result<(), MailboxError> {
        self.command(&format!("SELECT {}", quote(folder)))?;
        Ok(())
    }

    fn uid_search(&mut self, criteria: &str) -> Result<Vec<u32>, MailboxError> {
        let responses = self.command(&format!("UID SEARCH {criteria}"))?;
        Ok(parse_search(responses.iter().map(|r| r.text.as_str())))
    }

    /// Attributes `items` of one message.
    fn uid_fetch(&mut self, uid: u32, items: &str) -> Result<Vec<(String, Item)>, MailboxError> {
        let responses = self.command(&format!("UID FETCH {uid} {items}"))?;
        fetched(responses)?
            .into_iter()
            .find(|attributes| attribute(attributes, "UID").and_then(Item::number) == Some(uid.into()))
            .ok_or(MailboxError::MessageNotFound { uid })
    }

    /// Raw (still transfer-encoded) bytes of one section.
    fn uid_fetch_section(&mut self, uid: u32, section: &str) -> Result<Vec<u8>, MailboxError> {
        let attributes = self.uid_fetch(uid, &format!("BODY.PEEK[{section}]"))?;
        attribute(&attributes, "BODY[")
            .and_then(Item::bytes)
            .map(<[u8]>::to_vec)
            .ok_or_else(|| MailboxError::Protocol(format!("no BODY[{section}] in FETCH response for {uid}")))
    }

    fn uid_store(&mut self, uids: &[u32], change: &str) -> Result<(), MailboxError> {
        if uids.is_empty() {
            return Ok(());
        }
        self.command(&format!("UID STORE {} {change} (\\Seen)", uid_set(uids)))?;
        Ok(())
    }

    fn logout(&mut self) {
        if let Err(e) = self.command("LOGOUT") {
            debug!(error = %e, "Logout ended without tagged OK");
        }
    }

    /// Idle until `stop` is raised, forwarding events to `events`.
    fn idle(&mut self, stop: &AtomicBool, events: &mpsc::Sender<MailboxEvent>, keepalive: Duration) {
        let emit = |event: MailboxEvent| events.blocking_send(event).is_ok();

        loop {
            let tag = self.tag();
            if let Err(e) = self.start_idle(&tag) {
                emit(MailboxEvent::Error(e.to_string()));
                return;
            }
            let started = Instant::now();

            let reissue = loop {
                if stop.load(Ordering::Relaxed) {
                    break false;
                }
                if started.elapsed() >= keepalive {
                    break true;
                }
                match self.read_raw_line() {
                    Ok(raw) => {
                        let line = String::from_utf8_lossy(&raw);
                        if is_exists(&line) {
                            debug!(line = %line.trim_end(), "New message announced");
                            if !emit(MailboxEvent::NewMessages) {
                                break false;
                            }
                        } else if line.starts_with("* BYE") {
                            emit(MailboxEvent::Closed);
                            return;
                        }
                    }
                    Err(e) if is_timeout(&e) => continue,
                    Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                        emit(MailboxEvent::Closed);
                        return;
                    }
                    Err(e) => {
                        emit(MailboxEvent::Error(e.to_string()));
                        return;
                    }
                }
            };

            if let Err(e) = self.finish_idle(&tag) {
                if reissue {
                    emit(MailboxEvent::Error(e.to_string()));
                }
                return;
            }
            if !reissue {
                self.logout();
                return;
            }
            debug!("Re-issuing IDLE");
        }
    }

    fn start_idle(&mut self, tag: &str) -> Result<(), MailboxError> {
        self.set_read_timeout(self.io_timeout)?;
        self.write_line(&format!("{tag} IDLE"))?;
        loop {
            let response = self.read_response()?;
            if response.text.starts_with('+') {
                break;
            }
            if response.text.starts_with(tag) {
                return Err(MailboxError::Protocol(format!("IDLE: {}", response.text)));
            }
        }
        self.set_read_timeout(IDLE_POLL)
    }

    fn finish_idle(&mut self, tag: &str) -> Result<(), MailboxError> {
        self.set_read_timeout(self.io_timeout)?;
        self.write_line("DONE")?;
        let prefix = format!("{tag} ");
        loop {
            let response = self.read_response()?;
            if let Some(status) = response.text.strip_prefix(&prefix) {
                return if status.starts_with("OK") {
                    Ok(())
                } else {
                    Err(MailboxError::Protocol(format!("IDLE: {status}")))
                };
            }
        }
    }
}

// ── Message parsing ─────────────────────────────────────────────────

/// Attribute lists of the FETCH responses among `responses`.
fn fetched(responses: Vec<Response>) -> Result<Vec<Vec<(String, Item)>>, MailboxError> {
    let mut out = Vec::new();
    for response in responses {
        let parsed = fetch_attributes(&response.text, response.literals)
            .map_err(|e| MailboxError::Protocol(format!("malformed FETCH response: {e}")))?;
        out.extend(parsed);
    }
    Ok(out)
}

fn parse(raw: &[u8]) -> Result<mail_parser::Message<'_>, MailboxError> {
    MessageParser::default()
        .parse(raw)
        .ok_or_else(|| MailboxError::Protocol("unparsable message".into()))
}

/// Build a reference from `UID`, `BODYSTRUCTURE` and the Message-ID header
/// field. `None` when the response lacks them (unsolicited flag updates).
fn describe(attributes: &[(String, Item)]) -> Option<MessageRef> {
    let uid = u32::try_from(attribute(attributes, "UID")?.number()?).ok()?;
    let structure = attribute(attributes, "BODYSTRUCTURE")?;
    let message_id = attribute(attributes, "BODY[HEADER")
        .and_then(Item::bytes)
        .and_then(|header| parse(header).ok()?.message_id().map(str::to_string));

    let parts = leaf_parts(structure)
        .into_iter()
        .enumerate()
        .filter(|(_, part)| part.is_attachment())
        .map(|(index, part)| PartDescriptor {
            index,
            section: part.section,
            content_type: part.content_type,
            disposition: part.disposition,
            filename: part.filename,
            encoding: part.encoding,
            size: part.size,
        })
        .collect();
    Some(MessageRef {
        uid,
        message_id,
        parts,
    })
}

/// The part shown as the message body: plain text, else HTML.
fn body_part(parts: &[BodyPart]) -> Option<&BodyPart> {
    let inline = |ctype: &str| {
        parts
            .iter()
            .find(|p| p.content_type == ctype && p.disposition.as_deref() != Some("attachment") && p.filename.is_none())
    };
    inline("text/plain").or_else(|| inline("text/html"))
}

/// Decode a fetched section by giving mail-parser the headers
/// `BODYSTRUCTURE` reported for it. Text comes back as UTF-8.
fn decode_section(
    content_type: &str,
    charset: Option<&str>,
    encoding: Option<&str>,
    raw: &[u8],
) -> Result<Vec<u8>, MailboxError> {
    let mut entity = format!("Content-Type: {content_type}");
    if let Some(charset) = charset {
        entity.push_str(&format!("; charset=\"{charset}\""));
    }
    if let Some(encoding) = encoding {
        entity.push_str(&format!("\r\nContent-Transfer-Encoding: {encoding}"));
    }
    entity.push_str("\r\n\r\n");
    let mut entity = entity.into_bytes();
    entity.extend_from_slice(raw);

    let message = parse(&entity)?;
    Ok(message.parts.first().map(|p| p.contents().to_vec()).unwrap_or_default())
}

/// Strip HTML tags and collapse whitespace.
fn strip_html(html: &str) -> String {
    let mut text = String::with_capacity(html.len());
    let mut in_tag = false;
    for ch in html.chars() {
        match ch {
            '<' => in_tag = true,
            '>' => {
                in_tag = false;
                text.push(' ');
            }
            _ if !in_tag => text.push(ch),
            _ => {}
        }
    }
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Subject, sender and date from the header block; body from its section.
fn content_of(header: &[u8], body: Option<(BodyPart, Vec<u8>)>) -> Result<MessageContent, MailboxError> {
    let headers = parse(header)?;
    let body = match body {
        Some((part, raw)) => {
            let decoded = decode_section(&part.content_type, part.charset.as_deref(), part.encoding.as_deref(), &raw)?;
            let text = String::from_utf8_lossy(&decoded);
            if part.content_type == "text/html" {
                strip_html(&text)
            } else {
                text.trim_end().to_string()
            }
        }
        None => String::new(),
    };
    Ok(MessageContent {
        subject: headers.subject().unwrap_or_default().to_string(),
        body,
        from: headers
            .from()
            .and_then(|addr| addr.first())
            .and_then(|a| a.address())
            .map(str::to_string),
        date: headers.date().map(|d| d.to_rfc3339()),
    })
}

// ── Session ─────────────────────────────────────────────────────────

/// Authenticated IMAP session with the watched folder selected.
pub struct ImapSession {
    conn: Option<Connection>,
    config: Arc<ImapConfig>,
}

impl ImapSession {
    fn new(conn: Connection, config: Arc<ImapConfig>) -> Self {
        Self {
            conn: Some(conn),
            config,
        }
    }

    /// Run `f` on the connection in a blocking thread.
    async fn with_conn<T, F>(&mut self, f: F) -> Result<T, MailboxError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T, MailboxError> + Send + 'static,
    {
        let mut conn = self.conn.take().ok_or(MailboxError::Closed)?;
        let (conn, result) = tokio::task::spawn_blocking(move || {
            let result = f(&mut conn);
            (conn, result)
        })
        .await
        .map_err(|e| MailboxError::Protocol(format!("IMAP task failed: {e}")))?;

        // A dropped connection stays dropped.
        if !matches!(result, Err(MailboxError::Closed) | Err(MailboxError::Io(_))) {
            self.conn = Some(conn);
        }
        result
    }
}

#[async_trait]
impl MailboxSession for ImapSession {
    async fn list_unconsumed(&mut self) -> Result<Vec<MessageRef>, MailboxError> {
        let uids = self.with_conn(|c| c.uid_search("UNSEEN")).await?;
        debug!(count = uids.len(), "Unseen messages");
        if uids.is_empty() {
            return Ok(Vec::new());
        }

        let set = uid_set(&uids);
        let responses = self
            .with_conn(move |c| {
                c.command(&format!(
                    "UID FETCH {set} (UID BODYSTRUCTURE BODY.PEEK[HEADER.FIELDS (MESSAGE-ID)])"
                ))
            })
            .await?;

        let mut refs = Vec::with_capacity(uids.len());
        for response in responses {
            match fetch_attributes(&response.text, response.literals) {
                Ok(Some(attributes)) => {
                    if let Some(r) = describe(&attributes).filter(|r| uids.binary_search(&r.uid).is_ok()) {
                        refs.push(r);
                    }
                }
                Ok(None) => {}
                Err(e) => warn!(error = %e, "Skipping unparsable FETCH response"),
            }
        }
        refs.sort_by_key(|r| r.uid);
        refs.dedup_by_key(|r| r.uid);
        Ok(refs)
    }

    async fn fetch_content(&mut self, message: &MessageRef) -> Result<MessageContent, MailboxError> {
        let uid = message.uid;
        let (header, body) = self
            .with_conn(move |c| {
                let attributes = c.uid_fetch(uid, "(BODYSTRUCTURE BODY.PEEK[HEADER])")?;
                let header = attribute(&attributes, "BODY[HEADER")
                    .and_then(Item::bytes)
                    .map(<[u8]>::to_vec)
                    .ok_or_else(|| MailboxError::Protocol(format!("no header in FETCH response for {uid}")))?;
                let parts = attribute(&attributes, "BODYSTRUCTURE")
                    .map(leaf_parts)
                    .unwrap_or_default();
                let body = match body_part(&parts) {
                    Some(part) => Some((part.clone(), c.uid_fetch_section(uid, &part.section)?)),
                    None => None,
                };
                Ok((header, body))
            })
            .await?;
        content_of(&header, body)
    }

    async fn fetch_part(&mut self, message: &MessageRef, index: usize) -> Result<Vec<u8>, MailboxError> {
        let uid = message.uid;
        let part = message
            .parts
            .iter()
            .find(|p| p.index == index)
            .ok_or(MailboxError::PartNotFound { uid, part: index })?;

        let section = part.section.clone();
        let raw = self.with_conn(move |c| c.uid_fetch_section(uid, &section)).await?;
        decode_section(&part.content_type, None, part.encoding.as_deref(), &raw)
    }

    async fn acknowledge(&mut self, uid: u32) -> Result<(), MailboxError> {
        self.with_conn(move |c| c.uid_store(&[uid], "+FLAGS.SILENT")).await?;
        Ok(())
    }

    async fn reset_consumed(&mut self) -> Result<usize, MailboxError> {
        self.with_conn(|c| {
            let seen = c.uid_search("SEEN")?;
            c.uid_store(&seen, "-FLAGS.SILENT")?;
            Ok(seen.len())
        })
        .await
    }

    async fn subscribe(self: Box<Self>) -> Result<Subscription, MailboxError> {
        let mut this = self;
        let mut conn = this.conn.take().ok_or(MailboxError::Closed)?;
        let keepalive = this.config.idle_keepalive;
        let (tx, rx) = mpsc::channel(16);
        let stop = Arc::new(AtomicBool::new(false));
        let flag = stop.clone();

        tokio::task::spawn_blocking(move || {
            conn.idle(&flag, &tx, keepalive);
            debug!("IDLE listener exited");
        });
        Ok(Subscription::new(rx, stop))
    }

    async fn close(self: Box<Self>) {
        let mut this = self;
        if this.conn.is_some() {
            let _ = this
                .with_conn(|c| {
                    c.logout();
                    Ok(())
                })
                .await;
        }
    }
}

// ── Mailbox ─────────────────────────────────────────────────────────

/// IMAP mailbox factory.
pub struct ImapMailbox {
    config: Arc<ImapConfig>,
    tls: Arc<rustls::ClientConfig>,
}

impl ImapMailbox {
    pub fn new(config: ImapConfig) -> Self {
        let mut roots = rustls::RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        let tls = rustls::ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();
        Self {
            config: Arc::new(config),
            tls: Arc::new(tls),
        }
    }

    pub fn config(&self) -> &ImapConfig {
        &self.config
    }
}

#[async_trait]
impl Mailbox for ImapMailbox {
    async fn connect(&self, tokens: &dyn TokenSource) -> Result<Box<dyn MailboxSession>, MailboxError> {
        let token = tokens.access_token().await?;
        let payload = xoauth2_payload(&self.config.user, &token);
        let config = self.config.clone();
        let tls = self.tls.clone();

        let conn = tokio::task::spawn_blocking(move || {
            let mut conn = Connection::open(&config, tls)?;
            conn.authenticate(&config.user, &payload)?;
            conn.select(&config.folder)?;
            Ok::<_, MailboxError>(conn)
        })
        .await
        .map_err(|e| MailboxError::Protocol(format!("IMAP connect task failed: {e}")))??;

        info!(
            host = %self.config.host,
            user = %self.config.user,
            folder = %self.config.folder,
            "IMAP session established"
        );
        Ok(Box::new(ImapSession::new(conn, self.config.clone())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fetch(text: &str, literals: Vec<Vec<u8>>) -> Vec<(String, Item)> {
        fetch_attributes(text, literals).unwrap().unwrap()
    }

    const LISTING: &str = "* 3 FETCH (UID 17 BODYSTRUCTURE ((\"TEXT\" \"PLAIN\" (\"CHARSET\" \"utf-8\") NIL NIL \"7BIT\" 34 1 NIL NIL NIL NIL)\
(\"APPLICATION\" \"PDF\" (\"NAME\" \"offer.pdf\") NIL NIL \"BASE64\" 16 NIL (\"ATTACHMENT\" (\"FILENAME\" \"offer.pdf\")) NIL NIL)\
(\"APPLICATION\" \"X-MSDOWNLOAD\" (\"NAME\" \"setup.exe\") NIL NIL \"BASE64\" 8 NIL (\"ATTACHMENT\" (\"FILENAME\" \"setup.exe\")) NIL NIL) \
\"MIXED\" (\"BOUNDARY\" \"XX\") NIL NIL NIL) BODY[HEADER.FIELDS (MESSAGE-ID)] {43})";

    const MESSAGE_ID_HEADER: &[u8] = b"Message-ID: <offer-17@supplier.example>\r\n\r\n";

    #[test]
    fn literal_lengths() {
        assert_eq!(literal_len("* 1 FETCH (UID 5 BODY[] {342}"), Some(342));
        assert_eq!(literal_len("* 1 FETCH (UID 5)"), None);
        assert_eq!(literal_len("{12+}"), Some(12));
    }

    #[test]
    fn search_parsing() {
        let lines = ["* SEARCH 12 4 9", "* SEARCH", "* 3 EXISTS"];
        assert_eq!(parse_search(lines), vec![4, 9, 12]);
    }

    #[test]
    fn exists_detection() {
        assert!(is_exists("* 23 EXISTS\r\n"));
        assert!(!is_exists("* 23 RECENT"));
        assert!(!is_exists("* OK Still here"));
    }

    #[test]
    fn uid_sets_are_compacted() {
        assert_eq!(uid_set(&[1, 2, 3, 7, 9, 10]), "1:3,7,9:10");
        assert_eq!(uid_set(&[5]), "5");
    }

    #[test]
    fn folder_names_are_quoted() {
        assert_eq!(quote("INBOX"), "\"INBOX\"");
        assert_eq!(quote("a\"b"), "\"a\\\"b\"");
    }

    #[test]
    fn describes_attachment_parts_from_bodystructure() {
        let r = describe(&fetch(LISTING, vec![MESSAGE_ID_HEADER.to_vec()])).unwrap();
        assert_eq!(r.uid, 17);
        assert_eq!(r.message_id.as_deref(), Some("offer-17@supplier.example"));
        let names: Vec<_> = r.parts.iter().filter_map(|p| p.filename.as_deref()).collect();
        assert_eq!(names, vec!["offer.pdf", "setup.exe"]);
        assert_eq!(r.parts[0].index, 1);
        assert_eq!(r.parts[0].section, "2");
        assert_eq!(r.parts[0].content_type, "application/pdf");
        assert_eq!(r.parts[0].disposition.as_deref(), Some("attachment"));
        assert_eq!(r.parts[1].section, "3");
    }

    #[test]
    fn flag_updates_are_not_messages() {
        assert!(describe(&fetch("* 3 FETCH (UID 17 FLAGS (\\Seen))", Vec::new())).is_none());
    }

    #[test]
    fn base64_sections_are_decoded() {
        let pdf = decode_section("application/pdf", None, Some("base64"), b"JVBERi0x\r\nLjQK\r\n").unwrap();
        assert_eq!(pdf, b"%PDF-1.4\n");
    }

    #[test]
    fn text_sections_are_decoded_from_their_charset() {
        let text = decode_section(
            "text/plain",
            Some("iso-8859-2"),
            Some("quoted-printable"),
            b"Oferta z =A3odzi, cena netto.=\r\n",
        )
        .unwrap();
        assert_eq!(String::from_utf8(text).unwrap(), "Oferta z Łodzi, cena netto.");
    }

    #[test]
    fn plain_body_preferred_over_html() {
        let attributes = fetch(LISTING, vec![MESSAGE_ID_HEADER.to_vec()]);
        let parts = leaf_parts(attribute(&attributes, "BODYSTRUCTURE").unwrap());
        assert_eq!(body_part(&parts).map(|p| p.section.as_str()), Some("1"));

        let html_only = vec![BodyPart {
            section: "1".into(),
            content_type: "text/html".into(),
            charset: None,
            disposition: None,
            filename: None,
            encoding: None,
            size: 10,
        }];
        assert_eq!(body_part(&html_only).map(|p| p.content_type.as_str()), Some("text/html"));
    }

    #[test]
    fn content_from_header_and_body_section() {
        let header = b"From: Supplier <sales@supplier.example>\r\n\
Subject: Offer 17\r\n\
Date: Tue, 1 Oct 2024 10:00:00 +0000\r\n\r\n";
        let body = BodyPart {
            section: "1".into(),
            content_type: "text/plain".into(),
            charset: Some("utf-8".into()),
            disposition: None,
            filename: None,
            encoding: Some("7bit".into()),
            size: 34,
        };
        let c = content_of(header, Some((body, b"Please find our offer attached.\r\n".to_vec()))).unwrap();
        assert_eq!(c.subject, "Offer 17");
        assert_eq!(c.from.as_deref(), Some("sales@supplier.example"));
        assert_eq!(c.body, "Please find our offer attached.");
        assert!(c.date.is_some());

        let empty = content_of(header, None).unwrap();
        assert_eq!(empty.body, "");
    }

    #[test]
    fn html_is_stripped() {
        assert_eq!(strip_html("<p>Hello <b>there</b></p>"), "Hello there");
    }
}
