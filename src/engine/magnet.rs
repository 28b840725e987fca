//! Magnet URL parsing (`spec.md` §4.7).
//!
//! Grounded on `examples/original_source/node/magnet_utils.py`, which
//! splits the query string by hand rather than reaching for a URL-parsing
//! library; this module follows suit since `url::Url` doesn't parse
//! `magnet:?` URLs as queries on their own (they have no host), and the
//! only other tool needed, percent-decoding, is already a dependency.

use percent_encoding::percent_decode_str;

use crate::{error::*, Sha1Hash};

const SCHEME: &str = "magnet:?";
const BTIH_PREFIX: &str = "urn:btih:";

/// The fields of a `magnet:?xt=urn:btih:...` link this engine understands.
pub(crate) struct MagnetLink {
    pub fingerprint: Sha1Hash,
    pub display_name: Option<String>,
    pub trackers: Vec<String>,
}

/// Parses a magnet URL, extracting the required `xt=urn:btih:<hex>`
/// fingerprint, the optional `dn=` display name, and any `tr=` tracker
/// URLs.
pub(crate) fn parse(url: &str) -> Result<MagnetLink> {
    let query = url.strip_prefix(SCHEME).ok_or(Error::MalformedMagnet)?;

    let mut fingerprint = None;
    let mut display_name = None;
    let mut trackers = Vec::new();

    for pair in query.split('&').filter(|p| !p.is_empty()) {
        let mut parts = pair.splitn(2, '=');
        let key = parts.next().unwrap_or("");
        let value = parts.next().unwrap_or("");
        match key {
            "xt" => {
                let hex_digest =
                    value.strip_prefix(BTIH_PREFIX).ok_or(Error::MalformedMagnet)?;
                fingerprint = Some(decode_fingerprint(hex_digest)?);
            }
            "dn" => display_name = Some(decode_component(value)?),
            "tr" => trackers.push(decode_component(value)?),
            _ => {}
        }
    }

    Ok(MagnetLink {
        fingerprint: fingerprint.ok_or(Error::MalformedMagnet)?,
        display_name,
        trackers,
    })
}

fn decode_component(value: &str) -> Result<String> {
    percent_decode_str(value)
        .decode_utf8()
        .map(|s| s.into_owned())
        .map_err(|_| Error::MalformedMagnet)
}

fn decode_fingerprint(hex_digest: &str) -> Result<Sha1Hash> {
    let decoded = hex::decode(hex_digest).map_err(|_| Error::MalformedMagnet)?;
    if decoded.len() != 20 {
        return Err(Error::MalformedMagnet);
    }
    let mut fingerprint = [0u8; 20];
    fingerprint.copy_from_slice(&decoded);
    Ok(fingerprint)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE_HEX: &str = "0102030405060708090a0b0c0d0e0f1011121314";
    const SAMPLE_FINGERPRINT: Sha1Hash = [
        0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08, 0x09, 0x0a, 0x0b,
        0x0c, 0x0d, 0x0e, 0x0f, 0x10, 0x11, 0x12, 0x13, 0x14,
    ];

    #[test]
    fn parses_fingerprint_name_and_tracker() {
        let url = format!(
            "magnet:?xt=urn:btih:{}&dn=sample&tr=http%3A%2F%2Ftracker.example%2Fannounce",
            SAMPLE_HEX
        );
        let magnet = parse(&url).unwrap();
        assert_eq!(magnet.fingerprint, SAMPLE_FINGERPRINT);
        assert_eq!(magnet.display_name.as_deref(), Some("sample"));
        assert_eq!(magnet.trackers, vec!["http://tracker.example/announce"]);
    }

    #[test]
    fn collects_repeated_tr_params() {
        let url = format!(
            "magnet:?xt=urn:btih:{}&tr=http%3A%2F%2Fa.example%2F&tr=http%3A%2F%2Fb.example%2F",
            SAMPLE_HEX
        );
        let magnet = parse(&url).unwrap();
        assert_eq!(
            magnet.trackers,
            vec!["http://a.example/", "http://b.example/"]
        );
    }

    #[test]
    fn rejects_missing_xt() {
        assert!(parse("magnet:?dn=sample").is_err());
    }

    #[test]
    fn rejects_non_btih_namespace() {
        let url = format!("magnet:?xt=urn:sha1:{}", SAMPLE_HEX);
        assert!(parse(&url).is_err());
    }

    #[test]
    fn rejects_url_without_magnet_scheme() {
        assert!(parse("http://example.com/torrent").is_err());
    }

    #[test]
    fn rejects_short_fingerprint() {
        assert!(parse("magnet:?xt=urn:btih:deadbeef").is_err());
    }
}
