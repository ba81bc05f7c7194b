//! First-line protocol classification.
//!
//! The local socket multiplexes three protocols. The very first line
//! of an accepted connection decides which one, and the decision is
//! final: HTTP request verbs go to the request proxy, the `SUBSCRIBE`
//! verb registers a subscriber, anything else is the first record of
//! an ingestion stream.

use std::collections::HashMap;

use bytes::Bytes;

const REQUEST_VERBS: &[&str] = &["GET", "POST", "PUT", "DELETE", "HEAD", "OPTIONS", "PATCH"];
const SUBSCRIBE_VERB: &str = "SUBSCRIBE";

#[derive(Debug, thiserror::Error)]
pub enum ClassifyError {
    #[error("subscribe line carries no subscriber id")]
    SubscriberIdMissing,
    #[error("malformed filter pair: {pair}")]
    BadFilterPair { pair: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct SubscribeLine {
    pub id: String,
    pub filter: HashMap<String, String>,
}

#[derive(Debug, PartialEq)]
pub enum FirstLine {
    /// `<METHOD> <target> <version>`: one request/response cycle.
    Request(Bytes),
    /// `SUBSCRIBE <id>[ <k>=<v>[,<k>=<v>]*]`: long-lived subscriber.
    Subscribe(SubscribeLine),
    /// Anything else: the line is itself the first ingested record.
    Ingest(Bytes),
}

/// Pure function of the first line.
pub fn classify(line: Bytes) -> Result<FirstLine, ClassifyError> {
    let Ok(text) = core::str::from_utf8(&line) else {
        // Not textual at all; the ingestion path will reject it record by record.
        return Ok(FirstLine::Ingest(line));
    };

    if let Some(rest) = text.strip_prefix(SUBSCRIBE_VERB)
        && (rest.is_empty() || rest.starts_with(char::is_whitespace))
    {
        return parse_subscribe(rest).map(FirstLine::Subscribe);
    }

    let mut tokens = text.split_whitespace();

    match (tokens.next(), tokens.next()) {
        (Some(verb), Some(_)) if REQUEST_VERBS.contains(&verb) => Ok(FirstLine::Request(line)),
        _ => Ok(FirstLine::Ingest(line)),
    }
}

fn parse_subscribe(rest: &str) -> Result<SubscribeLine, ClassifyError> {
    let mut tokens = rest.split_whitespace();

    let id = tokens.next().ok_or(ClassifyError::SubscriberIdMissing)?.to_owned();

    let mut filter = HashMap::new();

    for group in tokens {
        for pair in group.split(',') {
            let (key, value) = pair.split_once('=').ok_or_else(|| ClassifyError::BadFilterPair {
                pair: pair.to_owned(),
            })?;

            filter.insert(key.to_owned(), value.to_owned());
        }
    }

    Ok(SubscribeLine { id, filter })
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    fn classify_str(line: &str) -> Result<FirstLine, ClassifyError> {
        classify(Bytes::copy_from_slice(line.as_bytes()))
    }

    #[rstest]
    #[case("GET /_cluster/health HTTP/1.1")]
    #[case("POST /logs/_doc HTTP/1.1")]
    #[case("DELETE /idx HTTP/1.1")]
    #[case("HEAD / HTTP/1.1")]
    #[case("OPTIONS * HTTP/1.1")]
    #[case("PATCH /x HTTP/1.1")]
    #[case("PUT /x HTTP/1.1")]
    fn request_verbs_route_to_the_request_proxy(#[case] line: &str) {
        assert!(matches!(classify_str(line), Ok(FirstLine::Request(_))));
    }

    #[rstest]
    // A verb with nothing after it is not a request line.
    #[case("GET")]
    // Verbs are case-sensitive.
    #[case("get / HTTP/1.1")]
    // JSON records are ingestion.
    #[case(r#"{"command":"ls","pwd":"/tmp"}"#)]
    // So is arbitrary junk, which the ingestion loop then rejects per record.
    #[case("hello world")]
    // The subscribe verb must stand alone as the first token.
    #[case("SUBSCRIBED tui")]
    #[case("")]
    fn everything_else_is_ingestion(#[case] line: &str) {
        assert!(matches!(classify_str(line), Ok(FirstLine::Ingest(_))));
    }

    #[test]
    fn subscribe_without_filter() {
        let Ok(FirstLine::Subscribe(sub)) = classify_str("SUBSCRIBE tui") else {
            panic!("expected a subscriber");
        };

        assert_eq!(sub.id, "tui");
        assert!(sub.filter.is_empty());
    }

    #[test]
    fn subscribe_with_filter_pairs() {
        let Ok(FirstLine::Subscribe(sub)) = classify_str("SUBSCRIBE tui pwd=/tmp,hostname=h") else {
            panic!("expected a subscriber");
        };

        assert_eq!(sub.id, "tui");
        assert_eq!(sub.filter.get("pwd").map(String::as_str), Some("/tmp"));
        assert_eq!(sub.filter.get("hostname").map(String::as_str), Some("h"));
    }

    #[test]
    fn subscribe_without_id_is_rejected() {
        assert!(matches!(
            classify_str("SUBSCRIBE"),
            Err(ClassifyError::SubscriberIdMissing)
        ));
    }

    #[test]
    fn subscribe_with_malformed_filter_is_rejected() {
        assert!(matches!(
            classify_str("SUBSCRIBE tui pwd"),
            Err(ClassifyError::BadFilterPair { .. })
        ));
    }

    #[test]
    fn classification_is_deterministic() {
        let line = Bytes::from_static(b"GET /x HTTP/1.1");

        let first = classify(line.clone()).expect("classifies");
        let second = classify(line).expect("classifies");

        assert_eq!(first, second);
    }
}
