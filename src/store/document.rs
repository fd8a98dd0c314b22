//! The crawled page as stored.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as Json};

use crate::error_handling::Error;
use crate::utils::decode_lossy;

/// Field names a store may be told to leave out.
pub const DOCUMENT_FIELDS: &[&str] = &[
    "url",
    "headers",
    "body",
    "links",
    "code",
    "depth",
    "referer",
    "redirect_to",
    "response_time",
    "fetched",
    "user_data",
    "fetched_at",
    "error",
];

/// A crawled page.
///
/// Every field defaults to its zero value when missing from stored JSON, so
/// documents written with an exclusion list decode cleanly. Unknown fields
/// are carried in `extra` and written back untouched.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Document {
    pub url: String,
    pub headers: BTreeMap<String, Vec<String>>,
    pub body: Option<String>,
    pub links: Vec<String>,
    pub code: i32,
    pub depth: i32,
    pub referer: Option<String>,
    pub redirect_to: Option<String>,
    /// Milliseconds.
    pub response_time: Option<i64>,
    pub fetched: bool,
    pub user_data: Json,
    /// Unix seconds.
    pub fetched_at: Option<i64>,
    pub error: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Json>,
}

impl Document {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }

    /// Sets the body from raw fetched bytes, replacing invalid UTF-8 with `?`.
    pub fn set_body_bytes(&mut self, bytes: &[u8]) {
        self.body = if bytes.is_empty() {
            None
        } else {
            Some(decode_lossy(bytes, "body"))
        };
    }

    /// Appends a header value from raw bytes, replacing invalid UTF-8 with `?`.
    pub fn insert_header_bytes(&mut self, name: &str, value: &[u8]) {
        let value = decode_lossy(value, "headers");
        self.headers
            .entry(name.to_ascii_lowercase())
            .or_default()
            .push(value);
    }

    /// Parses a JSON envelope into a document.
    ///
    /// The envelope must be an object with a non-blank `url`. `fetched_at`
    /// may be integer seconds or RFC 3339 text.
    pub fn from_envelope(envelope: &str) -> Result<Self, Error> {
        let parsed: Json = serde_json::from_str(envelope)
            .map_err(|e| Error::InvalidEnvelope(format!("not valid JSON: {e}")))?;
        let Json::Object(mut fields) = parsed else {
            return Err(Error::InvalidEnvelope("expected a JSON object".to_string()));
        };

        match fields.get("url") {
            Some(Json::String(url)) if !url.trim().is_empty() => {}
            _ => return Err(Error::MissingField("url")),
        }

        if let Some(Json::String(text)) = fields.get("fetched_at") {
            let seconds = chrono::DateTime::parse_from_rfc3339(text)
                .map_err(|e| Error::InvalidEnvelope(format!("fetched_at `{text}`: {e}")))?
                .timestamp();
            fields.insert("fetched_at".to_string(), Json::from(seconds));
        }

        Ok(serde_json::from_value(Json::Object(fields))?)
    }

    /// The JSON object written to the page column, minus `except`.
    pub(crate) fn to_record(&self, except: &[String]) -> Result<Map<String, Json>, Error> {
        let Json::Object(mut record) = serde_json::to_value(self)? else {
            return Err(Error::InvalidConfig(
                "document did not serialize to an object".to_string(),
            ));
        };
        for field in except {
            record.remove(field);
        }
        Ok(record)
    }
}

/// Checks an exclusion list against the document fields.
pub(crate) fn validate_exclusions(except: &[String]) -> Result<(), Error> {
    for field in except {
        if field == "url" {
            return Err(Error::InvalidConfig("`url` cannot be excluded".to_string()));
        }
        if !DOCUMENT_FIELDS.contains(&field.as_str()) {
            return Err(Error::InvalidConfig(format!(
                "unknown document field `{field}` in exclusion list"
            )));
        }
    }
    Ok(())
}
