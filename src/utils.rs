//! Utility functions for the dispatcher.

use crate::proxy::{Proxy, ProxyHealthRecord};
use log::warn;

/// Parse a proxy list, one proxy per line, into fresh health records.
///
/// Blank lines and `#` comments are skipped; unparsable lines are logged.
pub fn parse_proxy_list(content: &str) -> Vec<ProxyHealthRecord> {
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(|line| match line.parse::<Proxy>() {
            Ok(proxy) => Some(ProxyHealthRecord::fresh(proxy)),
            Err(e) => {
                warn!("{}", e);
                None
            }
        })
        .collect()
}

/// Collapse every whitespace run into one space and trim the ends.
pub(crate) fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// URL-encode form parameters as an `application/x-www-form-urlencoded` body.
pub(crate) fn encode_form<'a, I>(params: I) -> String
where
    I: IntoIterator<Item = (&'a String, &'a String)>,
{
    url::form_urlencoded::Serializer::new(String::new())
        .extend_pairs(params)
        .finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::ProxyKind;
    use std::collections::BTreeMap;

    #[test]
    fn parses_mixed_list() {
        let list = "# upstreams\n\n10.0.0.1:3128\nsocks5://10.0.0.2:1080\nnonsense\n";
        let records = parse_proxy_list(list);
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].proxy.kind, ProxyKind::Http);
        assert_eq!(records[1].proxy.kind, ProxyKind::Socks);
        assert_eq!(records[1].failure_count, 0);
    }

    #[test]
    fn collapses_whitespace() {
        assert_eq!(collapse_whitespace("  <a>\n\t  b </a>\r\n"), "<a> b </a>");
        assert_eq!(collapse_whitespace(""), "");
    }

    #[test]
    fn encodes_form_pairs() {
        let mut params = BTreeMap::new();
        params.insert("a".to_string(), "1".to_string());
        params.insert("q".to_string(), "x y&z".to_string());
        assert_eq!(encode_form(&params), "a=1&q=x+y%26z");
    }
}
