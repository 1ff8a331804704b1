//! Builtin tag methods such as `{{int(1-10)}}` or `{{base64enc(x)}}`

use crate::codec;
use rand::distributions::Alphanumeric;
use rand::Rng;

/// Upper bound on values a single range tag may produce
const MAX_RANGE: u64 = 1_000_000;

/// Names understood by [`call`]
pub const METHOD_NAMES: &[&str] = &[
    "int", "port", "ports", "integer", "i", "randint", "ri", "randstr", "rs", "array", "list",
    "array:comma", "list:comma", "repeat", "repeatstr", "char", "c", "ch", "substr", "lower",
    "upper", "trim", "base64enc", "base64", "base64dec", "hexenc", "hex", "hexdec", "urlenc",
    "urlescape", "urldec", "doubleurlenc", "md5", "sha1", "sha256", "sha512", "sm3", "uuid",
    "timestamp", "date", "datetime", "null", "crlf",
];

pub fn is_method(name: &str) -> bool {
    METHOD_NAMES.contains(&name.to_ascii_lowercase().as_str())
}

/// Run a builtin method; `None` when the name is not a builtin
pub fn call(name: &str, args: &str) -> Option<Vec<String>> {
    let values = match name.to_ascii_lowercase().as_str() {
        "int" | "port" | "ports" | "integer" | "i" => int_range(args),
        "randint" | "ri" => rand_int(args),
        "randstr" | "rs" => rand_str(args),
        "array" | "list" => split_list(args, '|'),
        "array:comma" | "list:comma" => split_list(args, ','),
        "repeat" => repeat(args),
        "repeatstr" => {
            let (text, times) = split_last(args, '|');
            vec![text.repeat(parse_usize(times).unwrap_or(1))]
        }
        "char" | "c" | "ch" => char_range(args),
        "substr" => vec![substr(args)],
        "lower" => vec![args.to_lowercase()],
        "upper" => vec![args.to_uppercase()],
        "trim" => vec![args.trim().to_string()],
        "base64enc" | "base64" => vec![codec::base64_encode(&codec::to_bytes(args))],
        "base64dec" => vec![codec::base64_decode(args)
            .map(codec::from_bytes)
            .unwrap_or_else(|| args.to_string())],
        "hexenc" | "hex" => vec![hex::encode(codec::to_bytes(args))],
        "hexdec" => vec![codec::hex_decode(args)
            .map(codec::from_bytes)
            .unwrap_or_else(|| args.to_string())],
        "urlenc" => vec![codec::url_encode_all(&codec::to_bytes(args))],
        "urlescape" => vec![codec::url_escape(args)],
        "urldec" => vec![codec::url_decode(args)],
        "doubleurlenc" => {
            let once = codec::url_encode_all(&codec::to_bytes(args));
            vec![codec::url_encode_all(once.as_bytes())]
        }
        algorithm @ ("md5" | "sha1" | "sha256" | "sha512" | "sm3") => {
            vec![codec::digest_hex(algorithm, &codec::to_bytes(args)).unwrap_or_default()]
        }
        "uuid" => (0..parse_usize(args).unwrap_or(1).max(1))
            .map(|_| uuid::Uuid::new_v4().to_string())
            .collect(),
        "timestamp" => vec![timestamp(args)],
        "date" => vec![format_now(if args.is_empty() { "%Y-%m-%d" } else { args })],
        "datetime" => vec![format_now(if args.is_empty() { "%Y-%m-%d %H:%M:%S" } else { args })],
        "null" => vec!["\0".repeat(parse_usize(args).unwrap_or(1))],
        "crlf" => vec!["\r\n".repeat(parse_usize(args).unwrap_or(1))],
        _ => return None,
    };
    Some(values)
}

fn parse_usize(text: &str) -> Option<usize> {
    text.trim().parse().ok()
}

fn split_last(text: &str, sep: char) -> (&str, &str) {
    match text.rfind(sep) {
        Some(index) => (&text[..index], &text[index + 1..]),
        None => (text, ""),
    }
}

fn split_list(text: &str, sep: char) -> Vec<String> {
    text.split(sep)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn pad(value: String, width: usize, right: bool) -> String {
    if value.len() >= width {
        return value;
    }
    let fill = "0".repeat(width - value.len());
    if right {
        value + &fill
    } else {
        fill + &value
    }
}

/// `1-5`, `1-5|4` (zero padding), `1-10|2|3` (padding and step), `1,2,3`
fn int_range(args: &str) -> Vec<String> {
    if args.trim().is_empty() {
        return vec![rand::thread_rng().gen_range(0..10).to_string()];
    }
    let parts: Vec<&str> = args.split('|').collect();
    let range = parts[0].trim();
    let mut padding: Option<(usize, bool)> = None;
    if let Some(raw) = parts.get(1) {
        let raw = raw.trim();
        let right = raw.starts_with('-');
        if let Ok(width) = raw.trim_start_matches('-').parse() {
            padding = Some((width, right));
        }
    }
    let step: u64 = parts
        .get(2)
        .and_then(|s| s.trim().parse().ok())
        .filter(|s| *s > 0)
        .unwrap_or(1);

    let Some((low, high)) = range.split_once('-') else {
        return split_list(range, ',');
    };
    if padding.is_none() && low.len() > 1 && low.starts_with('0') {
        padding = Some((low.len(), false));
    }
    let (Ok(low), Ok(high)) = (low.trim().parse::<u64>(), high.trim().parse::<u64>()) else {
        return vec![args.to_string()];
    };
    if low > high || (high - low) / step >= MAX_RANGE {
        return Vec::new();
    }
    (low..=high)
        .step_by(step as usize)
        .map(|n| match padding {
            Some((width, right)) => pad(n.to_string(), width, right),
            None => n.to_string(),
        })
        .collect()
}

/// `max`, `min,max` or `min,max,count`, with optional `|pad`
fn rand_int(args: &str) -> Vec<String> {
    let (range, padding) = match args.split_once('|') {
        Some((range, raw)) => {
            let raw = raw.trim();
            let width = raw.trim_start_matches('-').parse().unwrap_or(0);
            (range, Some((width, raw.starts_with('-'))))
        }
        None => (args, None),
    };
    let numbers: Vec<i64> = range
        .split(',')
        .filter_map(|s| s.trim().parse().ok())
        .collect();
    let (low, high, count) = match numbers.as_slice() {
        [max] => (0, *max, 1),
        [min, max] => (*min, *max, 1),
        [min, max, count, ..] => (*min, *max, (*count).max(1) as usize),
        [] => (0, 10, 1),
    };
    if low > high {
        return Vec::new();
    }
    let mut rng = rand::thread_rng();
    (0..count)
        .map(|_| {
            let n = rng.gen_range(low..=high).to_string();
            match padding {
                Some((width, right)) => pad(n, width, right),
                None => n,
            }
        })
        .collect()
}

/// `len`, `min,max` or `min,max,count`
fn rand_str(args: &str) -> Vec<String> {
    let numbers: Vec<usize> = args
        .split(',')
        .filter_map(|s| s.trim().parse().ok())
        .collect();
    let (low, high, count) = match numbers.as_slice() {
        [len] => (*len, *len, 1),
        [min, max] => (*min, *max, 1),
        [min, max, count, ..] => (*min, *max, (*count).max(1)),
        [] => (8, 8, 1),
    };
    let mut rng = rand::thread_rng();
    (0..count)
        .map(|_| {
            let len = if high > low { rng.gen_range(low..=high) } else { low };
            (&mut rng)
                .sample_iter(&Alphanumeric)
                .take(len)
                .map(char::from)
                .collect::<String>()
        })
        .collect()
}

/// `n` yields n empty values, `text|n` yields text n times
fn repeat(args: &str) -> Vec<String> {
    if let Some(times) = parse_usize(args) {
        return vec![String::new(); times];
    }
    let (text, times) = split_last(args, '|');
    match parse_usize(times) {
        Some(times) if times > 0 => vec![text.to_string(); times],
        _ => vec![String::new()],
    }
}

fn char_range(args: &str) -> Vec<String> {
    let chars: Vec<char> = args.trim().chars().collect();
    match chars.as_slice() {
        [start, '-', end] if start <= end => (*start..=*end).map(String::from).collect(),
        _ => vec![args.to_string()],
    }
}

/// `text|start` or `text|start,length`
fn substr(args: &str) -> String {
    let (text, range) = split_last(args, '|');
    if range.is_empty() && !args.contains('|') {
        return args.to_string();
    }
    let chars: Vec<char> = text.chars().collect();
    let (start, length) = match range.split_once(',') {
        Some((start, length)) => (
            parse_usize(start).unwrap_or(0),
            parse_usize(length).filter(|l| *l > 0),
        ),
        None => (parse_usize(range).unwrap_or(0), None),
    };
    if start >= chars.len() {
        return String::new();
    }
    let end = length
        .map(|l| (start + l).min(chars.len()))
        .unwrap_or(chars.len());
    chars[start..end].iter().collect()
}

/// Format the local time, falling back to the raw format on bad specifiers
fn format_now(format: &str) -> String {
    use std::fmt::Write;
    let mut out = String::new();
    match write!(out, "{}", chrono::Local::now().format(format)) {
        Ok(()) => out,
        Err(_) => format.to_string(),
    }
}

fn timestamp(args: &str) -> String {
    let now = chrono::Utc::now();
    match args.trim() {
        "ms" => now.timestamp_millis().to_string(),
        "ns" => now.timestamp_nanos_opt().unwrap_or_default().to_string(),
        _ => now.timestamp().to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_int_ranges() {
        assert_eq!(call("int", "1-3"), Some(vec!["1".into(), "2".into(), "3".into()]));
        assert_eq!(call("int", "1-3|3"), Some(vec!["001".into(), "002".into(), "003".into()]));
        assert_eq!(call("int", "08-10"), Some(vec!["08".into(), "09".into(), "10".into()]));
        assert_eq!(call("int", "1-10|1|4"), Some(vec!["1".into(), "5".into(), "9".into()]));
        assert_eq!(call("int", "7,8"), Some(vec!["7".into(), "8".into()]));
    }

    #[test]
    fn test_lists_and_repeat() {
        assert_eq!(call("array", "a|b|c").map(|v| v.len()), Some(3));
        assert_eq!(call("repeat", "3"), Some(vec![String::new(); 3]));
        assert_eq!(call("repeat", "ab|2"), Some(vec!["ab".into(), "ab".into()]));
        assert_eq!(call("repeatstr", "ab|3"), Some(vec!["ababab".into()]));
        assert_eq!(call("char", "a-c"), Some(vec!["a".into(), "b".into(), "c".into()]));
    }

    #[test]
    fn test_substr() {
        assert_eq!(substr("abcdef|2"), "cdef");
        assert_eq!(substr("abcdef|1,3"), "bcd");
        assert_eq!(substr("abc|9"), "");
    }

    #[test]
    fn test_codecs() {
        assert_eq!(call("base64enc", "abc"), Some(vec!["YWJj".into()]));
        assert_eq!(call("base64dec", "YWJj"), Some(vec!["abc".into()]));
        assert_eq!(call("hexenc", "ab"), Some(vec!["6162".into()]));
        assert_eq!(call("urlenc", "a"), Some(vec!["%61".into()]));
        assert_eq!(call("unknown", "x"), None);
    }

    #[test]
    fn test_random_shapes() {
        let values = call("randstr", "5,5,3").unwrap_or_default();
        assert_eq!(values.len(), 3);
        assert!(values.iter().all(|v| v.len() == 5));

        let n: i64 = call("randint", "10,20")
            .and_then(|v| v.first().cloned())
            .and_then(|v| v.parse().ok())
            .unwrap_or(-1);
        assert!((10..=20).contains(&n));
    }
}
