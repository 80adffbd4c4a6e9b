// Gmail v1 client. Builds a multipart/mixed MIME message and posts it to
// `users/me/messages/send`. "me" is the impersonated mailbox, so the service
// account needs domain-wide delegation (see `service_account.rs`).

use async_trait::async_trait;
use base64::engine::general_purpose::{STANDARD, URL_SAFE};
use base64::Engine;
use reqwest::Client;
use serde_json::json;
use std::sync::Arc;

use super::service_account::{expect_success, ServiceAccountAuth};
use crate::core::requests::request_models::MailMessage;
use crate::core::requests::request_ports::{CollaboratorError, MailSender};

const GMAIL_SEND: &str = "https://gmail.googleapis.com/gmail/v1/users/me/messages/send";

pub struct GmailClient {
    client: Client,
    auth: Arc<ServiceAccountAuth>,
}

impl GmailClient {
    pub fn new(auth: Arc<ServiceAccountAuth>) -> Self {
        Self {
            client: Client::new(),
            auth,
        }
    }
}

/// Header values must stay on one line.
fn header_safe(value: &str) -> String {
    value.replace(['\r', '\n'], " ")
}

/// RFC 2047 encoded-word for anything that is not plain ASCII.
fn encode_header(value: &str) -> String {
    let value = header_safe(value);
    if value.is_ascii() {
        value
    } else {
        format!("=?UTF-8?B?{}?=", STANDARD.encode(value.as_bytes()))
    }
}

fn display_name(name: &str) -> String {
    let name = header_safe(name);
    if name.is_ascii() {
        format!("\"{}\"", name.replace('\\', "\\\\").replace('"', "\\\""))
    } else {
        encode_header(&name)
    }
}

/// RFC 2231 extended parameter value: percent-encoded UTF-8.
fn extended_value(value: &str) -> String {
    let mut out = String::with_capacity(value.len() * 3);
    for byte in value.bytes() {
        if byte.is_ascii_alphanumeric() || b"!#$&+-.^_`|~".contains(&byte) {
            out.push(byte as char);
        } else {
            out.push_str(&format!("%{:02X}", byte));
        }
    }
    out
}

/// Base64 split into 76 character lines, as MIME bodies expect.
fn base64_lines(data: &[u8]) -> String {
    let encoded = STANDARD.encode(data);
    let mut out = String::with_capacity(encoded.len() + encoded.len() / 76 * 2 + 2);
    for chunk in encoded.as_bytes().chunks(76) {
        // base64 output is ASCII
        out.push_str(std::str::from_utf8(chunk).unwrap_or_default());
        out.push_str("\r\n");
    }
    out
}

/// Renders the full MIME message.
pub fn build_mime(message: &MailMessage, from_address: Option<&str>, boundary: &str) -> String {
    let mut mime = String::new();

    if let Some(address) = from_address {
        mime.push_str(&format!(
            "From: {} <{}>\r\n",
            display_name(&message.sender_name),
            header_safe(address)
        ));
    }
    let to: Vec<String> = message.to.iter().map(|r| header_safe(r.trim())).collect();
    mime.push_str(&format!("To: {}\r\n", to.join(", ")));
    mime.push_str(&format!("Subject: {}\r\n", encode_header(&message.subject)));
    mime.push_str("MIME-Version: 1.0\r\n");
    mime.push_str(&format!(
        "Content-Type: multipart/mixed; boundary=\"{}\"\r\n\r\n",
        boundary
    ));

    mime.push_str(&format!("--{}\r\n", boundary));
    mime.push_str("Content-Type: text/plain; charset=\"UTF-8\"\r\n");
    mime.push_str("Content-Transfer-Encoding: base64\r\n\r\n");
    mime.push_str(&base64_lines(message.body.as_bytes()));

    for attachment in &message.attachments {
        let filename = header_safe(&attachment.name).replace('"', "");
        mime.push_str(&format!("--{}\r\n", boundary));
        mime.push_str(&format!(
            "Content-Type: {}; name=\"{}\"\r\n",
            attachment.mime_type,
            encode_header(&filename)
        ));
        if filename.is_ascii() {
            mime.push_str(&format!(
                "Content-Disposition: attachment; filename=\"{}\"\r\n",
                filename
            ));
        } else {
            mime.push_str(&format!(
                "Content-Disposition: attachment; filename*=UTF-8''{}\r\n",
                extended_value(&filename)
            ));
        }
        mime.push_str("Content-Transfer-Encoding: base64\r\n\r\n");
        mime.push_str(&base64_lines(&attachment.data));
    }

    mime.push_str(&format!("--{}--\r\n", boundary));
    mime
}

#[async_trait]
impl MailSender for GmailClient {
    async fn send(&self, message: &MailMessage) -> Result<(), CollaboratorError> {
        if message.to.is_empty() {
            return Err(CollaboratorError::Mail("No recipients".to_string()));
        }

        let token = self.auth.access_token().await?;
        let boundary = format!("request-mail-{:016x}", rand::random::<u64>());
        let mime = build_mime(message, self.auth.subject(), &boundary);

        let response = self
            .client
            .post(GMAIL_SEND)
            .bearer_auth(token)
            .json(&json!({ "raw": URL_SAFE.encode(mime.as_bytes()) }))
            .send()
            .await
            .map_err(|e| CollaboratorError::Mail(e.to_string()))?;
        expect_success(response, "Gmail send failed")
            .await
            .map_err(CollaboratorError::Mail)?;

        tracing::debug!(recipients = message.to.len(), "Mail sent: {}", message.subject);
        Ok(())
    }
}
