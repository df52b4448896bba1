//! zelidauth credential handling
//!
//! The wallet login flow hands the dashboard an opaque credential that
//! arrives in one of two wire formats: colon-joined
//! (`zelid:signature:loginPhrase`) or query-string
//! (`zelid=...&signature=...&loginPhrase=...`). Node endpoints want a
//! third: a JSON object. Normalization happens once here, at the API
//! boundary, so everything downstream sees a single shape.

use actix_web::{HttpRequest, HttpResponse};
use serde::{Deserialize, Serialize};

/// Canonical credential form
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ZelIdAuth {
    pub zelid: String,
    pub signature: String,
    #[serde(rename = "loginPhrase")]
    pub login_phrase: String,
}

impl ZelIdAuth {
    /// Parse either accepted wire format. Returns None when any of the
    /// three parts is missing or empty.
    pub fn parse(raw: &str) -> Option<Self> {
        let raw = raw.trim();
        if raw.is_empty() {
            return None;
        }

        if raw.contains("zelid=") {
            return Self::parse_query_string(raw);
        }

        // Colon-joined: base64 signatures and login phrases carry no
        // colons, so a 3-way split is unambiguous
        let mut parts = raw.splitn(3, ':');
        let zelid = parts.next()?.trim();
        let signature = parts.next()?.trim();
        let login_phrase = parts.next()?.trim();
        if zelid.is_empty() || signature.is_empty() || login_phrase.is_empty() {
            return None;
        }
        Some(Self {
            zelid: zelid.to_string(),
            signature: signature.to_string(),
            login_phrase: login_phrase.to_string(),
        })
    }

    fn parse_query_string(raw: &str) -> Option<Self> {
        let mut zelid = None;
        let mut signature = None;
        let mut login_phrase = None;
        for pair in raw.split('&') {
            let (key, value) = pair.split_once('=')?;
            let value = urlencoding::decode(value).ok()?.into_owned();
            match key {
                "zelid" => zelid = Some(value),
                "signature" => signature = Some(value),
                "loginPhrase" => login_phrase = Some(value),
                _ => {}
            }
        }
        let (zelid, signature, login_phrase) = (zelid?, signature?, login_phrase?);
        if zelid.is_empty() || signature.is_empty() || login_phrase.is_empty() {
            return None;
        }
        Some(Self { zelid, signature, login_phrase })
    }

    /// JSON-object form required by node endpoints
    pub fn to_header_value(&self) -> String {
        serde_json::json!({
            "zelid": self.zelid,
            "signature": self.signature,
            "loginPhrase": self.login_phrase,
        })
        .to_string()
    }
}

/// Pull and normalize the credential from a dashboard request; a missing
/// or malformed credential fails fast with no network activity.
pub fn require_auth(req: &HttpRequest) -> Result<ZelIdAuth, HttpResponse> {
    let raw = req
        .headers()
        .get("zelidauth")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");

    match ZelIdAuth::parse(raw) {
        Some(auth) => Ok(auth),
        None => Err(HttpResponse::Unauthorized().json(serde_json::json!({
            "error": "Missing or malformed zelidauth credential"
        }))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_colon_joined_form() {
        let auth = ZelIdAuth::parse("1ABCzel:c2lnbmF0dXJl+/=:phrase123").unwrap();
        assert_eq!(auth.zelid, "1ABCzel");
        assert_eq!(auth.signature, "c2lnbmF0dXJl+/=");
        assert_eq!(auth.login_phrase, "phrase123");
    }

    #[test]
    fn parses_query_string_form_with_percent_encoding() {
        let auth =
            ZelIdAuth::parse("zelid=1ABCzel&signature=c2ln%2Bbm%3D&loginPhrase=phrase123").unwrap();
        assert_eq!(auth.zelid, "1ABCzel");
        assert_eq!(auth.signature, "c2ln+bm=");
        assert_eq!(auth.login_phrase, "phrase123");
    }

    #[test]
    fn both_forms_normalize_identically() {
        let a = ZelIdAuth::parse("1ABCzel:sig:phrase").unwrap();
        let b = ZelIdAuth::parse("zelid=1ABCzel&signature=sig&loginPhrase=phrase").unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn rejects_incomplete_credentials() {
        assert!(ZelIdAuth::parse("").is_none());
        assert!(ZelIdAuth::parse("justzelid").is_none());
        assert!(ZelIdAuth::parse("zelid:sig").is_none());
        assert!(ZelIdAuth::parse("zelid::phrase").is_none());
        assert!(ZelIdAuth::parse("zelid=1ABC&signature=sig").is_none());
    }

    #[test]
    fn header_value_is_the_json_object_form() {
        let auth = ZelIdAuth::parse("1ABCzel:sig:phrase").unwrap();
        let v: serde_json::Value = serde_json::from_str(&auth.to_header_value()).unwrap();
        assert_eq!(v["zelid"], "1ABCzel");
        assert_eq!(v["signature"], "sig");
        assert_eq!(v["loginPhrase"], "phrase");
    }
}
