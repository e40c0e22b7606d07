//! Gmail API wire types and the parsed record handed to the relay.

use base64::Engine;
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

/// Gmail message from `users.messages.get`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GmailMessage {
    pub id: String,
    #[serde(default)]
    pub thread_id: String,
    pub label_ids: Option<Vec<String>>,
    pub snippet: Option<String>,
    pub payload: Option<GmailMessagePayload>,
    /// Receipt time in epoch milliseconds, string-encoded
    pub internal_date: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GmailMessagePayload {
    pub headers: Option<Vec<GmailHeader>>,
    pub parts: Option<Vec<GmailMessagePart>>,
    pub body: Option<GmailMessageBody>,
    pub mime_type: Option<String>,
}

/// Gmail header (From, To, Subject, etc.)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GmailHeader {
    pub name: String,
    pub value: String,
}

/// Gmail message part (for multipart messages)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GmailMessagePart {
    pub part_id: Option<String>,
    pub mime_type: Option<String>,
    pub body: Option<GmailMessageBody>,
    pub parts: Option<Vec<GmailMessagePart>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GmailMessageBody {
    /// Base64url-encoded body data
    pub data: Option<String>,
    pub size: Option<i64>,
}

/// One page of `users.history.list`
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryPage {
    pub history: Option<Vec<HistoryRecord>>,
    /// Current mailbox history id at the time of the call
    pub history_id: Option<String>,
    pub next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryRecord {
    pub id: String,
    pub messages_added: Option<Vec<MessageAdded>>,
}

#[derive(Debug, Deserialize)]
pub struct MessageAdded {
    pub message: MessageRef,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageRef {
    pub id: String,
}

/// Response of `users.watch`
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WatchResponse {
    pub history_id: String,
    /// Expiry in epoch milliseconds, string-encoded
    pub expiration: String,
}

impl WatchResponse {
    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        parse_epoch_millis(&self.expiration)
    }
}

/// A resolved message, reduced to what the relay projects and reports
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MailRecord {
    pub message_id: String,
    pub thread_id: String,
    pub from: String,
    pub to: String,
    pub subject: String,
    pub snippet: String,
    pub body: String,
    /// Gmail receipt time
    pub received_at: Option<DateTime<Utc>>,
    /// Raw `Date` header, used when receipt time is unknown
    pub date_header: Option<String>,
    pub labels: Vec<String>,
}

pub(crate) fn parse_epoch_millis(raw: &str) -> Option<DateTime<Utc>> {
    let millis: i64 = raw.trim().parse().ok()?;
    Utc.timestamp_millis_opt(millis).single()
}

impl GmailMessage {
    /// Extract a header value by name
    pub fn get_header(&self, name: &str) -> Option<String> {
        self.payload
            .as_ref()?
            .headers
            .as_ref()?
            .iter()
            .find(|h| h.name.eq_ignore_ascii_case(name))
            .map(|h| h.value.clone())
    }

    pub fn to_record(&self) -> MailRecord {
        MailRecord {
            message_id: self.id.clone(),
            thread_id: self.thread_id.clone(),
            from: self.get_header("From").unwrap_or_default(),
            to: self.get_header("To").unwrap_or_default(),
            subject: self.get_header("Subject").unwrap_or_default(),
            snippet: self.snippet.clone().unwrap_or_default(),
            body: self.extract_body().unwrap_or_default(),
            received_at: self.internal_date.as_deref().and_then(parse_epoch_millis),
            date_header: self.get_header("Date"),
            labels: self.label_ids.clone().unwrap_or_default(),
        }
    }

    /// Extract plain text body from message
    fn extract_body(&self) -> Option<String> {
        let payload = self.payload.as_ref()?;

        if let Some(decoded) = payload
            .body
            .as_ref()
            .and_then(|b| b.data.as_deref())
            .and_then(|d| base64_url_decode(d).ok())
        {
            return Some(decoded);
        }

        extract_text_from_parts(payload.parts.as_deref()?)
    }
}

/// Decode base64url (Gmail omits padding, but tolerate it)
fn base64_url_decode(input: &str) -> Result<String, String> {
    let engine = base64::engine::general_purpose::URL_SAFE_NO_PAD;
    let bytes = engine
        .decode(input.trim_end_matches('='))
        .map_err(|e| e.to_string())?;
    String::from_utf8(bytes).map_err(|e| e.to_string())
}

fn part_text(part: &GmailMessagePart) -> Option<String> {
    part.body
        .as_ref()?
        .data
        .as_deref()
        .and_then(|d| base64_url_decode(d).ok())
}

/// Depth-first search for text/plain, falling back to stripped text/html
fn extract_text_from_parts(parts: &[GmailMessagePart]) -> Option<String> {
    fn find(parts: &[GmailMessagePart], mime: &str) -> Option<String> {
        for part in parts {
            if part.mime_type.as_deref() == Some(mime) {
                if let Some(text) = part_text(part) {
                    return Some(text);
                }
            }
            if let Some(text) = part.parts.as_deref().and_then(|nested| find(nested, mime)) {
                return Some(text);
            }
        }
        None
    }

    find(parts, "text/plain").or_else(|| find(parts, "text/html").map(|html| strip_html(&html)))
}

/// Basic HTML tag stripping
fn strip_html(html: &str) -> String {
    let mut result = String::new();
    let mut in_tag = false;

    for c in html.chars() {
        match c {
            '<' => in_tag = true,
            '>' => in_tag = false,
            _ if !in_tag => result.push(c),
            _ => {}
        }
    }

    result
        .lines()
        .map(|l| l.trim())
        .filter(|l| !l.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}
