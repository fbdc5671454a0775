use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use tracing::debug;

use crate::error::{AppError, Result};

/// Parses `--header` values of the form `Key: Value` into a header map.
///
/// Each entry is split at the first `:`; both sides are trimmed. Later
/// entries replace earlier ones with the same name.
pub fn parse_headers(headers: &[String]) -> Result<HeaderMap> {
    let mut map = HeaderMap::with_capacity(headers.len());

    for raw in headers {
        let (key, value) = raw.split_once(':').ok_or_else(|| {
            AppError::InvalidInput(format!("Invalid header format (expected Key:Value): {raw}"))
        })?;
        let key = key.trim();
        let value = value.trim();
        if key.is_empty() {
            return Err(AppError::InvalidInput(format!(
                "Invalid header format (empty name): {raw}"
            )));
        }

        let name = HeaderName::from_bytes(key.as_bytes())
            .map_err(|e| AppError::InvalidInput(format!("Invalid header name '{key}': {e}")))?;
        let value = HeaderValue::from_str(value)
            .map_err(|e| AppError::InvalidInput(format!("Invalid value for header '{key}': {e}")))?;

        debug!("Added header: {name}");
        map.insert(name, value);
    }

    Ok(map)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(values: &[&str]) -> Vec<String> {
        values.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn splits_on_first_colon_and_trims() {
        let map = parse_headers(&strings(&[
            "Referer: https://example.com/watch?t=1:30",
            "  X-Token :abc ",
        ]))
        .unwrap();

        assert_eq!(
            map.get("referer").unwrap(),
            "https://example.com/watch?t=1:30"
        );
        assert_eq!(map.get("x-token").unwrap(), "abc");
    }

    #[test]
    fn rejects_malformed_entries() {
        assert!(matches!(
            parse_headers(&strings(&["NoSeparator"])),
            Err(AppError::InvalidInput(_))
        ));
        assert!(parse_headers(&strings(&[": value"])).is_err());
        assert!(parse_headers(&strings(&["Bad Name: value"])).is_err());
    }

    #[test]
    fn later_entries_win() {
        let map = parse_headers(&strings(&["Cookie: a=1", "cookie: b=2"])).unwrap();
        assert_eq!(map.get_all("cookie").iter().count(), 1);
        assert_eq!(map.get("cookie").unwrap(), "b=2");
    }
}
