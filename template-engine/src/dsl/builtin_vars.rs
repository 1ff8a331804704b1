//! Response-derived variables visible to every expression

use super::VarMap;
use crate::codec;
use crate::packet::RawPacket;
use crate::result::ExchangeRecord;
use serde_json::Value;

/// Variables for one response and, when known, its request
pub fn response_vars(response: &[u8], request: Option<&[u8]>, duration: f64, is_https: bool) -> VarMap {
    let mut vars = VarMap::new();
    let parsed = RawPacket::parse(response);
    for (name, value) in &parsed.headers {
        let key = name.to_ascii_lowercase().replace('-', "_");
        vars.insert(key, Value::String(value.clone()));
    }
    let (all_headers, status_code) = if response.is_empty() {
        (String::new(), 0)
    } else {
        (parsed.header_block(), parsed.status_code())
    };
    vars.insert("all_headers".into(), Value::String(all_headers));
    vars.insert("status_code".into(), Value::from(status_code));
    vars.insert("content_length".into(), Value::from(parsed.body.len() as u64));
    vars.insert("body".into(), Value::String(codec::from_bytes(parsed.body)));
    vars.insert("raw".into(), Value::String(codec::from_bytes(response.to_vec())));
    vars.insert("duration".into(), super::number_value(duration));

    match request.filter(|r| !r.is_empty()) {
        Some(request) => {
            let parsed = RawPacket::parse(request);
            vars.insert("request_raw".into(), Value::String(codec::from_bytes(request.to_vec())));
            vars.insert("request_headers".into(), Value::String(parsed.header_block()));
            vars.insert(
                "request_url".into(),
                Value::String(parsed.request_url(is_https).unwrap_or_default()),
            );
            vars.insert("request_body".into(), Value::String(codec::from_bytes(parsed.body)));
            vars.insert("is_https".into(), Value::Bool(is_https));
        }
        None => {
            vars.insert("is_https".into(), Value::Bool(false));
        }
    }
    vars
}

/// Load one exchange into `vars`, optionally also under `name + suffix`.
/// The un-suffixed names always point at the most recently loaded exchange.
pub fn load_exchange(vars: &mut VarMap, exchange: &ExchangeRecord, suffix: Option<&str>) {
    let request = Some(exchange.request.as_slice());
    let loaded = response_vars(&exchange.response, request, exchange.duration, exchange.is_https);
    for (name, value) in loaded {
        if let Some(suffix) = suffix {
            vars.insert(format!("{}{}", name, suffix), value.clone());
        }
        vars.insert(name, value);
    }
}

/// Variables of a whole sequence: every exchange under `_<index>`, then the
/// current exchange again without suffix
pub fn exchange_vars(exchanges: &[ExchangeRecord], current: Option<&ExchangeRecord>) -> VarMap {
    let mut vars = VarMap::new();
    for exchange in exchanges {
        let suffix = format!("_{}", exchange.index);
        load_exchange(&mut vars, exchange, Some(&suffix));
    }
    if let Some(current) = current {
        load_exchange(&mut vars, current, None);
    }
    vars
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn exchange(index: usize, status: u16, body: &str) -> ExchangeRecord {
        ExchangeRecord {
            index,
            request: format!("GET /{} HTTP/1.1\r\nHost: example.com\r\n\r\n", index).into_bytes(),
            response: format!(
                "HTTP/1.1 {} OK\r\nContent-Type: text/html\r\nX-Powered-By: PHP\r\n\r\n{}",
                status, body
            )
            .into_bytes(),
            duration: 0.25,
            ..Default::default()
        }
    }

    #[test]
    fn test_response_vars() {
        let ex = exchange(1, 200, "hello");
        let vars = response_vars(&ex.response, Some(ex.request.as_slice()), 0.25, true);
        assert_eq!(vars["status_code"], json!(200));
        assert_eq!(vars["content_length"], json!(5));
        assert_eq!(vars["body"], json!("hello"));
        assert_eq!(vars["content_type"], json!("text/html"));
        assert_eq!(vars["x_powered_by"], json!("PHP"));
        assert_eq!(vars["duration"], json!(0.25));
        assert_eq!(vars["request_url"], json!("https://example.com/1"));
        assert_eq!(vars["is_https"], json!(true));
        assert!(vars["all_headers"].as_str().unwrap_or_default().contains("Content-Type: text/html"));
    }

    #[test]
    fn test_empty_response() {
        let vars = response_vars(b"", None, 0.0, false);
        assert_eq!(vars["status_code"], json!(0));
        assert_eq!(vars["body"], json!(""));
        assert!(!vars.contains_key("request_url"));
    }

    #[test]
    fn test_suffixed_sequence_vars() {
        let first = exchange(1, 302, "one");
        let second = exchange(2, 200, "two");
        let vars = exchange_vars(&[first.clone(), second], Some(&first));
        assert_eq!(vars["status_code_1"], json!(302));
        assert_eq!(vars["status_code_2"], json!(200));
        assert_eq!(vars["body_2"], json!("two"));
        assert_eq!(vars["status_code"], json!(302));
        assert_eq!(vars["body"], json!("one"));
    }
}
