//! Builtin functions callable from expressions

use super::{compile_regex, number_value, value_to_f64, value_to_string};
use crate::codec::{self, Compressor};
use crate::error::EvaluationError;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use rand::seq::SliceRandom;
use rand::Rng;
use serde_json::Value;
use std::net::Ipv4Addr;
use std::time::Duration;
use tracing::warn;

const LOWER: &str = "abcdefghijklmnopqrstuvwxyz";
const UPPER: &str = "ABCDEFGHIJKLMNOPQRSTUVWXYZ";
const DIGITS: &str = "0123456789";

/// Longest pause `wait_for` will honour
const MAX_WAIT: Duration = Duration::from_secs(30);

/// Largest string `repeat` and the random text helpers will build
const MAX_OUTPUT: usize = 1 << 24;

type Outcome = Result<Value, EvaluationError>;

struct Args<'a> {
    function: &'a str,
    values: &'a [Value],
}

impl<'a> Args<'a> {
    fn require(&self, count: usize) -> Result<(), EvaluationError> {
        if self.values.len() < count {
            return Err(EvaluationError::invalid_arguments(
                self.function,
                format!("expected at least {} arguments, got {}", count, self.values.len()),
            ));
        }
        Ok(())
    }

    fn str(&self, index: usize) -> String {
        self.values.get(index).map(value_to_string).unwrap_or_default()
    }

    fn bytes(&self, index: usize) -> Vec<u8> {
        codec::to_bytes(&self.str(index))
    }

    fn int(&self, index: usize) -> Result<i64, EvaluationError> {
        let value = self.values.get(index).ok_or_else(|| {
            EvaluationError::invalid_arguments(self.function, format!("missing argument {}", index + 1))
        })?;
        value_to_f64(value).map(|f| f as i64).ok_or_else(|| {
            EvaluationError::invalid_arguments(
                self.function,
                format!("argument {} is not a number: {}", index + 1, value),
            )
        })
    }

    /// A non-negative count whose output of `unit` bytes per step stays under [`MAX_OUTPUT`]
    fn count(&self, index: usize, unit: usize) -> Result<usize, EvaluationError> {
        let count = self.int(index)?.max(0) as usize;
        match count.checked_mul(unit.max(1)) {
            Some(total) if total <= MAX_OUTPUT => Ok(count),
            _ => Err(EvaluationError::invalid_arguments(
                self.function,
                format!("count {} exceeds the {} byte output limit", count, MAX_OUTPUT),
            )),
        }
    }

    fn opt_int(&self, index: usize) -> Option<i64> {
        self.values.get(index).and_then(value_to_f64).map(|f| f as i64)
    }

    /// Remaining arguments as strings, with array arguments flattened
    fn rest(&self, from: usize) -> Vec<String> {
        self.values
            .iter()
            .skip(from)
            .flat_map(|value| match value {
                Value::Array(items) => items.iter().map(value_to_string).collect::<Vec<_>>(),
                other => vec![value_to_string(other)],
            })
            .collect()
    }
}

fn text(value: impl Into<String>) -> Outcome {
    Ok(Value::String(value.into()))
}

fn binary(bytes: Vec<u8>) -> Outcome {
    Ok(Value::String(codec::from_bytes(bytes)))
}

fn strings(items: Vec<String>) -> Outcome {
    Ok(Value::Array(items.into_iter().map(Value::String).collect()))
}

fn codec_failure(function: &str, err: impl ToString) -> EvaluationError {
    EvaluationError::invalid_arguments(function, err.to_string())
}

/// Call a builtin by name
pub fn call(name: &str, values: &[Value]) -> Outcome {
    let args = Args {
        function: name,
        values,
    };
    match name {
        "to_upper" | "toupper" => {
            args.require(1)?;
            text(args.str(0).to_uppercase())
        }
        "to_lower" | "tolower" => {
            args.require(1)?;
            text(args.str(0).to_lowercase())
        }
        "trim" | "trim_left" | "trim_right" => trim(name, &args),
        "trim_space" => {
            args.require(1)?;
            text(args.str(0).trim())
        }
        "trim_prefix" => {
            args.require(2)?;
            let input = args.str(0);
            let prefix = args.str(1);
            text(input.strip_prefix(prefix.as_str()).unwrap_or(&input))
        }
        "trim_suffix" => {
            args.require(2)?;
            let input = args.str(0);
            let suffix = args.str(1);
            text(input.strip_suffix(suffix.as_str()).unwrap_or(&input))
        }
        "replace" => {
            args.require(3)?;
            text(args.str(0).replace(&args.str(1), &args.str(2)))
        }
        "replace_regex" => {
            args.require(3)?;
            let re = compile_regex(&args.str(1))?;
            text(re.replace_all(&args.str(0), args.str(2).as_str()).into_owned())
        }
        "reverse" => {
            args.require(1)?;
            text(args.str(0).chars().rev().collect::<String>())
        }
        "repeat" => {
            args.require(2)?;
            let input = args.str(0);
            let count = args.count(1, input.len())?;
            text(input.repeat(count))
        }
        "uniq" => uniq(&args),
        "sort" => sort(&args),
        "len" => {
            args.require(1)?;
            let len = match &values[0] {
                Value::Array(items) => items.len(),
                Value::Object(map) => map.len(),
                other => codec::to_bytes(&value_to_string(other)).len(),
            };
            Ok(Value::from(len as i64))
        }
        "index" => {
            args.require(2)?;
            let at = args.int(1)?;
            match &values[0] {
                Value::Array(items) => Ok(usize::try_from(at)
                    .ok()
                    .and_then(|i| items.get(i).cloned())
                    .unwrap_or(Value::Null)),
                other => text(
                    usize::try_from(at)
                        .ok()
                        .and_then(|i| value_to_string(other).chars().nth(i))
                        .map(String::from)
                        .unwrap_or_default(),
                ),
            }
        }
        "concat" | "to_string" => text(args.rest(0).concat()),
        "split" => split(&args),
        "join" => {
            args.require(1)?;
            text(args.rest(1).join(args.str(0).as_str()))
        }
        "substr" => {
            args.require(2)?;
            let chars: Vec<char> = args.str(0).chars().collect();
            let end = args
                .opt_int(2)
                .map(|e| (e.max(0) as usize).min(chars.len()))
                .unwrap_or(chars.len());
            let start = (args.int(1)?.max(0) as usize).min(end);
            text(chars[start..end].iter().collect::<String>())
        }
        "contains" | "contains_all" => {
            args.require(2)?;
            let needles = args.rest(1);
            Ok(Value::Bool(needles.iter().all(|n| contains(&values[0], n))))
        }
        "contains_any" => {
            args.require(2)?;
            let needles = args.rest(1);
            Ok(Value::Bool(needles.iter().any(|n| contains(&values[0], n))))
        }
        "starts_with" => {
            args.require(2)?;
            let input = args.str(0);
            Ok(Value::Bool(args.rest(1).iter().any(|p| input.starts_with(p.as_str()))))
        }
        "ends_with" => {
            args.require(2)?;
            let input = args.str(0);
            Ok(Value::Bool(args.rest(1).iter().any(|s| input.ends_with(s.as_str()))))
        }
        "line_starts_with" | "line_ends_with" => {
            args.require(2)?;
            let input = args.str(0);
            let items = args.rest(1);
            let prefix = name == "line_starts_with";
            Ok(Value::Bool(input.lines().any(|line| {
                items.iter().any(|item| {
                    if prefix {
                        line.starts_with(item.as_str())
                    } else {
                        line.ends_with(item.as_str())
                    }
                })
            })))
        }
        "regex" => {
            args.require(2)?;
            Ok(Value::Bool(compile_regex(&args.str(0))?.is_match(&args.str(1))))
        }
        "regex_all" | "regex_any" => {
            args.require(2)?;
            let re = compile_regex(&args.str(0))?;
            let inputs = args.rest(1);
            let result = if name == "regex_all" {
                inputs.iter().all(|i| re.is_match(i))
            } else {
                inputs.iter().any(|i| re.is_match(i))
            };
            Ok(Value::Bool(result))
        }
        "equals_any" => {
            args.require(2)?;
            let origin = args.str(0);
            Ok(Value::Bool(args.rest(1).contains(&origin)))
        }
        "remove_bad_chars" => {
            args.require(2)?;
            let cutset = args.str(1);
            text(args.str(0).chars().filter(|c| !cutset.contains(*c)).collect::<String>())
        }
        "base64" | "base64_py" => {
            args.require(1)?;
            text(codec::base64_encode(&args.bytes(0)))
        }
        "base64_decode" => {
            args.require(1)?;
            match codec::base64_decode(&args.str(0)) {
                Some(bytes) => binary(bytes),
                None => text(args.str(0)),
            }
        }
        "gzip" | "zlib" | "deflate" => {
            args.require(1)?;
            codec::compress(compressor(name), &args.bytes(0))
                .map_err(|err| codec_failure(name, err))
                .and_then(binary)
        }
        "gzip_decode" | "zlib_decode" | "inflate" => {
            args.require(1)?;
            codec::decompress(compressor(name), &args.bytes(0))
                .map_err(|err| codec_failure(name, err))
                .and_then(binary)
        }
        "url_encode" => {
            args.require(1)?;
            text(codec::url_escape(&args.str(0)))
        }
        "url_decode" => {
            args.require(1)?;
            text(codec::url_decode(&args.str(0)))
        }
        "hex_encode" => {
            args.require(1)?;
            text(hex::encode(args.bytes(0)))
        }
        "hex_decode" => {
            args.require(1)?;
            codec::hex_decode(&args.str(0))
                .ok_or_else(|| codec_failure(name, "invalid hex string"))
                .and_then(binary)
        }
        "html_escape" => {
            args.require(1)?;
            text(codec::html_escape(&args.str(0)))
        }
        "html_unescape" => {
            args.require(1)?;
            text(codec::html_unescape(&args.str(0)))
        }
        "md5" | "sha1" | "sha224" | "sha256" | "sha384" | "sha512" | "sm3" => {
            args.require(1)?;
            codec::digest_hex(name, &args.bytes(0))
                .ok_or_else(|| codec_failure(name, "unsupported digest"))
                .and_then(text)
        }
        "mmh3" => {
            args.require(1)?;
            codec::mmh3(&args.bytes(0))
                .map(Value::from)
                .ok_or_else(|| codec_failure(name, "hash failed"))
        }
        "hmac" => {
            args.require(3)?;
            codec::hmac_hex(&args.str(0), &args.bytes(1), &args.bytes(2))
                .ok_or_else(|| codec_failure(name, format!("unsupported algorithm {}", args.str(0))))
                .and_then(text)
        }
        "rand_char" | "rand_base" => {
            args.require(1)?;
            let charset = args.rest(1).concat();
            let charset = if charset.is_empty() {
                format!("{}{}", LOWER, UPPER)
            } else {
                charset
            };
            text(sample(args.count(0, 1)?, &charset))
        }
        "rand_text_alpha" | "rand_text_alphanumeric" | "rand_text_numeric" => {
            args.require(1)?;
            let full = match name {
                "rand_text_alpha" => format!("{}{}", LOWER, UPPER),
                "rand_text_numeric" => DIGITS.to_string(),
                _ => format!("{}{}{}", LOWER, UPPER, DIGITS),
            };
            let bad = args.rest(1).concat();
            let mut base: String = full.chars().filter(|c| !bad.contains(*c)).collect();
            if base.is_empty() {
                base = full;
            }
            text(sample(args.count(0, 1)?, &base))
        }
        "rand_int" => {
            let (mut low, mut high) = match (args.opt_int(0), args.opt_int(1)) {
                (Some(max), None) => (0, max),
                (Some(min), Some(max)) => (min, max),
                _ => (0, i64::MAX),
            };
            if high < low {
                std::mem::swap(&mut low, &mut high);
            }
            if high == 0 {
                high = i64::MAX;
            }
            if high == low {
                return Ok(Value::from(low));
            }
            Ok(Value::from(rand::thread_rng().gen_range(low..high)))
        }
        "rand_ip" => text(rand_ip(&args.rest(0))),
        "unix_time" => {
            let offset = args.opt_int(0).unwrap_or(0);
            Ok(Value::from(chrono::Utc::now().timestamp() + offset))
        }
        "to_unix_time" => {
            args.require(1)?;
            Ok(Value::from(to_unix_time(&args.str(0), &args.rest(1))))
        }
        "date_time" => {
            args.require(1)?;
            let timestamp = args.opt_int(1).unwrap_or_else(|| chrono::Utc::now().timestamp());
            date_time(&args.str(0), timestamp).map(Value::String)
        }
        "wait_for" => {
            args.require(1)?;
            let seconds = value_to_f64(&values[0]).unwrap_or(0.0).max(0.0);
            let pause = Duration::try_from_secs_f64(seconds)
                .map_err(|err| codec_failure("wait_for", err))?
                .min(MAX_WAIT);
            pause_thread(pause);
            Ok(Value::Bool(true))
        }
        "compare_versions" => {
            args.require(2)?;
            Ok(Value::Bool(compare_versions(&args.str(0), &args.rest(1))))
        }
        "to_number" => {
            let raw = args.rest(0).concat();
            let raw = raw.trim();
            Ok(match raw.parse::<i64>() {
                Ok(n) => Value::from(n),
                Err(_) => raw.parse::<f64>().map(number_value).unwrap_or(Value::from(0)),
            })
        }
        "dec_to_hex" => {
            args.require(1)?;
            text(format!("{:x}", args.int(0)?))
        }
        "hex_to_dec" => radix(name, &args, "0x", 16),
        "oct_to_dec" => radix(name, &args, "0o", 8),
        "bin_to_dec" => radix(name, &args, "0b", 2),
        "aes_cbc" => {
            args.require(2)?;
            let key = args.bytes(1);
            let mut iv = args.bytes(2);
            let random_iv = iv.is_empty();
            if random_iv {
                iv = (0..16).map(|_| rand::random::<u8>()).collect();
            }
            let sealed = codec::aes_cbc_encrypt(&key, &iv, &args.bytes(0)).ok_or_else(|| {
                codec_failure(name, "key must be 16, 24 or 32 bytes and iv 16 bytes")
            })?;
            if random_iv {
                iv.extend(sealed);
                binary(iv)
            } else {
                binary(sealed)
            }
        }
        "generate_jwt" => generate_jwt(&args),
        _ => Err(EvaluationError::UnknownFunction {
            name: name.to_string(),
        }),
    }
}

/// Sleep without stalling the other tasks of a multi-threaded runtime
fn pause_thread(pause: Duration) {
    use tokio::runtime::{Handle, RuntimeFlavor};
    match Handle::try_current() {
        Ok(handle) if handle.runtime_flavor() == RuntimeFlavor::MultiThread => {
            tokio::task::block_in_place(|| std::thread::sleep(pause))
        }
        _ => std::thread::sleep(pause),
    }
}

fn compressor(name: &str) -> Compressor {
    match name {
        "gzip" | "gzip_decode" => Compressor::Gzip,
        "zlib" | "zlib_decode" => Compressor::Zlib,
        _ => Compressor::Deflate,
    }
}

fn trim(name: &str, args: &Args<'_>) -> Outcome {
    args.require(1)?;
    let input = args.str(0);
    let cutset = args.values.get(1).map(value_to_string);
    let matcher = |c: char| match &cutset {
        Some(set) => set.contains(c),
        None => c.is_whitespace(),
    };
    text(match name {
        "trim_left" => input.trim_start_matches(matcher),
        "trim_right" => input.trim_end_matches(matcher),
        _ => input.trim_matches(matcher),
    })
}

fn contains(haystack: &Value, needle: &str) -> bool {
    match haystack {
        Value::Array(items) => items.iter().any(|item| value_to_string(item) == needle),
        Value::Object(map) => map.contains_key(needle),
        other => value_to_string(other).contains(needle),
    }
}

fn uniq(args: &Args<'_>) -> Outcome {
    match args.values {
        [] => strings(Vec::new()),
        [Value::Array(_)] | [_, _, ..] => {
            let mut seen = Vec::new();
            for item in args.rest(0) {
                if !seen.contains(&item) {
                    seen.push(item);
                }
            }
            strings(seen)
        }
        [single] => {
            let mut out = String::new();
            for c in value_to_string(single).chars() {
                if !out.contains(c) {
                    out.push(c);
                }
            }
            text(out)
        }
    }
}

fn sort(args: &Args<'_>) -> Outcome {
    match args.values {
        [] => strings(Vec::new()),
        [Value::Array(_)] | [_, _, ..] => {
            let mut items = args.rest(0);
            items.sort();
            strings(items)
        }
        [single] => {
            let mut chars: Vec<char> = value_to_string(single).chars().collect();
            chars.sort_unstable();
            text(chars.into_iter().collect::<String>())
        }
    }
}

fn split(args: &Args<'_>) -> Outcome {
    args.require(1)?;
    let input = args.str(0);
    match args.values.get(1) {
        None => strings(input.lines().map(str::to_string).collect()),
        Some(Value::Number(n)) => {
            let size = n.as_u64().unwrap_or(0).max(1) as usize;
            let chars: Vec<char> = input.chars().collect();
            strings(chars.chunks(size).map(|c| c.iter().collect()).collect())
        }
        Some(separator) => {
            let separator = value_to_string(separator);
            match args.opt_int(2).filter(|n| *n > 0) {
                Some(limit) => strings(
                    input
                        .splitn(limit as usize, separator.as_str())
                        .map(str::to_string)
                        .collect(),
                ),
                None => strings(input.split(separator.as_str()).map(str::to_string).collect()),
            }
        }
    }
}

fn sample(count: usize, charset: &str) -> String {
    let pool: Vec<char> = charset.chars().collect();
    let mut rng = rand::thread_rng();
    (0..count)
        .filter_map(|_| pool.choose(&mut rng).copied())
        .collect()
}

fn rand_ip(cidrs: &[String]) -> String {
    let mut rng = rand::thread_rng();
    let networks: Vec<(u32, u32)> = cidrs
        .iter()
        .flat_map(|cidr| cidr.split(','))
        .filter_map(|cidr| {
            let (addr, bits) = cidr.trim().split_once('/').unwrap_or((cidr.trim(), "32"));
            let addr: Ipv4Addr = addr.parse().ok()?;
            let bits: u32 = bits.parse().ok().filter(|b| *b <= 32)?;
            let mask = if bits == 0 { 0 } else { u32::MAX << (32 - bits) };
            Some((u32::from(addr) & mask, !mask))
        })
        .collect();
    match networks.choose(&mut rng) {
        Some((base, host_mask)) => {
            Ipv4Addr::from(base | (rng.gen::<u32>() & host_mask)).to_string()
        }
        None => Ipv4Addr::new(
            rng.gen_range(1..=255),
            rng.gen_range(1..=255),
            rng.gen_range(1..=255),
            rng.gen_range(1..=255),
        )
        .to_string(),
    }
}

/// Translate `yyyy-MM-dd HH:mm:ss` style layouts to strftime
fn strftime_layout(layout: &str) -> String {
    if layout.contains('%') {
        return layout.to_string();
    }
    const TOKENS: &[(&str, &str)] = &[
        ("yyyy", "%Y"),
        ("YYYY", "%Y"),
        ("yy", "%y"),
        ("MM", "%m"),
        ("dd", "%d"),
        ("DD", "%d"),
        ("HH", "%H"),
        ("hh", "%I"),
        ("mm", "%M"),
        ("ss", "%S"),
    ];
    let mut out = String::new();
    let mut rest = layout;
    'outer: while !rest.is_empty() {
        for (token, replacement) in TOKENS {
            if let Some(tail) = rest.strip_prefix(token) {
                out.push_str(replacement);
                rest = tail;
                continue 'outer;
            }
        }
        let mut chars = rest.chars();
        if let Some(c) = chars.next() {
            out.push(c);
        }
        rest = chars.as_str();
    }
    out
}

fn date_time(layout: &str, timestamp: i64) -> Result<String, EvaluationError> {
    use std::fmt::Write;
    let moment = chrono::DateTime::from_timestamp(timestamp, 0)
        .ok_or_else(|| EvaluationError::invalid_arguments("date_time", "timestamp out of range"))?;
    let mut out = String::new();
    write!(out, "{}", moment.format(&strftime_layout(layout)))
        .map_err(|_| EvaluationError::invalid_arguments("date_time", format!("bad layout {}", layout)))?;
    Ok(out)
}

fn to_unix_time(input: &str, layouts: &[String]) -> i64 {
    let input = input.trim();
    if let Ok(n) = input.parse::<f64>() {
        return n as i64;
    }
    if let Ok(moment) = chrono::DateTime::parse_from_rfc3339(input) {
        return moment.timestamp();
    }
    if let Ok(moment) = chrono::DateTime::parse_from_rfc2822(input) {
        return moment.timestamp();
    }
    let defaults = ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S", "%Y/%m/%d %H:%M:%S"];
    let candidates: Vec<String> = if layouts.is_empty() {
        defaults.iter().map(|s| s.to_string()).collect()
    } else {
        layouts.iter().map(|l| strftime_layout(l)).collect()
    };
    for layout in &candidates {
        if let Ok(moment) = chrono::NaiveDateTime::parse_from_str(input, layout) {
            return moment.and_utc().timestamp();
        }
        if let Ok(day) = chrono::NaiveDate::parse_from_str(input, layout) {
            if let Some(moment) = day.and_hms_opt(0, 0, 0) {
                return moment.and_utc().timestamp();
            }
        }
    }
    if let Ok(day) = chrono::NaiveDate::parse_from_str(input, "%Y-%m-%d") {
        if let Some(moment) = day.and_hms_opt(0, 0, 0) {
            return moment.and_utc().timestamp();
        }
    }
    0
}

/// Parse loose versions such as `v2.4` or `1.2.3.4-beta` as semver
fn loose_version(raw: &str) -> Option<semver::Version> {
    let raw = raw.trim().trim_start_matches(['v', 'V']);
    let (core, pre) = match raw.split_once(['-', '+']) {
        Some((core, pre)) => (core, Some(pre)),
        None => (raw, None),
    };
    let mut parts: Vec<&str> = core.split('.').take(3).collect();
    while parts.len() < 3 {
        parts.push("0");
    }
    let mut normalized = parts.join(".");
    if let Some(pre) = pre {
        normalized.push('-');
        normalized.push_str(pre);
    }
    semver::Version::parse(&normalized).ok()
}

fn compare_versions(version: &str, constraints: &[String]) -> bool {
    let Some(version) = loose_version(version) else {
        warn!(version, "compare_versions: unparsable version");
        return false;
    };
    let joined = constraints.join(",");
    match semver::VersionReq::parse(&joined) {
        Ok(req) => req.matches(&version),
        Err(err) => {
            warn!(constraints = %joined, error = %err, "compare_versions: bad constraint");
            false
        }
    }
}

fn radix(name: &str, args: &Args<'_>, prefix: &str, base: u32) -> Outcome {
    args.require(1)?;
    let raw = args.str(0);
    let trimmed = raw.trim();
    let digits = trimmed
        .strip_prefix(prefix)
        .or_else(|| trimmed.strip_prefix(&prefix.to_ascii_uppercase()))
        .unwrap_or(trimmed);
    i64::from_str_radix(digits, base)
        .map(Value::from)
        .map_err(|err| codec_failure(name, err))
}

fn generate_jwt(args: &Args<'_>) -> Outcome {
    use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};

    args.require(2)?;
    let mut claims: serde_json::Map<String, Value> = serde_json::from_str(&args.str(0))
        .map_err(|err| codec_failure("generate_jwt", err))?;
    if let Some(max_age) = args.opt_int(3) {
        claims.insert("exp".to_string(), Value::from(max_age));
    }
    let algorithm = args.str(1);
    let key = args.bytes(2);
    let algorithm = match algorithm.to_ascii_uppercase().as_str() {
        "" | "NONE" => {
            let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"none","typ":"JWT"}"#);
            let body = serde_json::to_vec(&claims).map_err(|err| codec_failure("generate_jwt", err))?;
            return text(format!("{}.{}.", header, URL_SAFE_NO_PAD.encode(body)));
        }
        "HS256" => Algorithm::HS256,
        "HS384" => Algorithm::HS384,
        "HS512" => Algorithm::HS512,
        other => {
            return Err(EvaluationError::invalid_arguments(
                "generate_jwt",
                format!("unsupported algorithm {}", other),
            ))
        }
    };
    encode(&Header::new(algorithm), &claims, &EncodingKey::from_secret(&key))
        .map_err(|err| codec_failure("generate_jwt", err))
        .and_then(text)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn run(name: &str, args: &[Value]) -> Value {
        call(name, args).unwrap_or_else(|err| panic!("{} failed: {}", name, err))
    }

    #[test]
    fn test_string_helpers() {
        assert_eq!(run("to_upper", &[json!("abc")]), json!("ABC"));
        assert_eq!(run("trim", &[json!("xxhixx"), json!("x")]), json!("hi"));
        assert_eq!(run("trim_left", &[json!("  hi ")]), json!("hi "));
        assert_eq!(run("trim_prefix", &[json!("prefix-x"), json!("prefix-")]), json!("x"));
        assert_eq!(run("reverse", &[json!("abc")]), json!("cba"));
        assert_eq!(run("repeat", &[json!("ab"), json!(3)]), json!("ababab"));
        assert_eq!(run("substr", &[json!("abcdef"), json!(1), json!(3)]), json!("bc"));
        assert_eq!(run("join", &[json!(","), json!("a"), json!(["b", "c"])]), json!("a,b,c"));
        assert_eq!(run("split", &[json!("a,b"), json!(",")]), json!(["a", "b"]));
        assert_eq!(run("split", &[json!("abcd"), json!(2)]), json!(["ab", "cd"]));
        assert_eq!(run("uniq", &[json!("aabbc")]), json!("abc"));
        assert_eq!(run("sort", &[json!("cab")]), json!("abc"));
        assert_eq!(run("remove_bad_chars", &[json!("a-b_c"), json!("-_")]), json!("abc"));
        assert_eq!(run("concat", &[json!("a"), json!(1), json!(true)]), json!("a1true"));
    }

    #[test]
    fn test_predicates() {
        assert_eq!(run("contains", &[json!("hello world"), json!("world")]), json!(true));
        assert_eq!(run("contains", &[json!("hello"), json!("he"), json!("xx")]), json!(false));
        assert_eq!(run("contains_any", &[json!("hello"), json!("xx"), json!("ll")]), json!(true));
        assert_eq!(run("contains", &[json!(["a", "b"]), json!("b")]), json!(true));
        assert_eq!(run("starts_with", &[json!("hello"), json!("x"), json!("he")]), json!(true));
        assert_eq!(run("line_ends_with", &[json!("a\nfoo;\nb"), json!(";")]), json!(true));
        assert_eq!(run("regex", &[json!("^a+b$"), json!("aaab")]), json!(true));
        assert_eq!(run("regex_any", &[json!("\\d"), json!("x"), json!("1")]), json!(true));
        assert_eq!(run("regex_all", &[json!("\\d"), json!("x"), json!("1")]), json!(false));
        assert_eq!(run("equals_any", &[json!("b"), json!("a"), json!("b")]), json!(true));
    }

    #[test]
    fn test_encodings() {
        assert_eq!(run("base64", &[json!("abc")]), json!("YWJj"));
        assert_eq!(run("base64_decode", &[json!("YWJj")]), json!("abc"));
        assert_eq!(run("hex_encode", &[json!("ab")]), json!("6162"));
        assert_eq!(run("hex_decode", &[json!("6162")]), json!("ab"));
        assert_eq!(run("url_encode", &[json!("a b")]), json!("a+b"));
        assert_eq!(run("html_escape", &[json!("<a>")]), json!("&lt;a&gt;"));
        let packed = run("gzip", &[json!("payload")]);
        assert_eq!(run("gzip_decode", &[packed]), json!("payload"));
        let packed = run("zlib", &[json!("payload")]);
        assert_eq!(run("zlib_decode", &[packed]), json!("payload"));
    }

    #[test]
    fn test_hashes() {
        assert_eq!(run("md5", &[json!("admin")]), json!("21232f297a57a5a743894a0e4a801fc3"));
        assert_eq!(
            run("hmac", &[json!("sha256"), json!("data"), json!("key")]),
            json!("5031fe3d989c6d1537a013fa6e739da23463fdaec3b70137d828e36ace221bd0")
        );
        assert!(run("mmh3", &[json!("abc")]).is_i64());
    }

    #[test]
    fn test_numbers() {
        assert_eq!(run("to_number", &[json!("42")]), json!(42));
        assert_eq!(run("to_number", &[json!("1.5")]), json!(1.5));
        assert_eq!(run("to_number", &[json!("x")]), json!(0));
        assert_eq!(run("dec_to_hex", &[json!(255)]), json!("ff"));
        assert_eq!(run("hex_to_dec", &[json!("0xff")]), json!(255));
        assert_eq!(run("oct_to_dec", &[json!("0o17")]), json!(15));
        assert_eq!(run("bin_to_dec", &[json!("101")]), json!(5));
        assert_eq!(run("len", &[json!("abcd")]), json!(4));
        assert_eq!(run("len", &[json!([1, 2])]), json!(2));
    }

    #[test]
    fn test_random_helpers() {
        let value = run("rand_text_numeric", &[json!(6)]);
        let text = value.as_str().unwrap_or_default();
        assert_eq!(text.len(), 6);
        assert!(text.chars().all(|c| c.is_ascii_digit()));

        let n = run("rand_int", &[json!(5), json!(10)]).as_i64().unwrap_or(-1);
        assert!((5..10).contains(&n));

        let ip = run("rand_ip", &[json!("10.0.0.0/24")]);
        assert!(ip.as_str().unwrap_or_default().starts_with("10.0.0."));
    }

    #[test]
    fn test_versions_and_dates() {
        assert_eq!(
            run("compare_versions", &[json!("v2.4"), json!(">= 2.0"), json!("< 3")]),
            json!(true)
        );
        assert_eq!(run("compare_versions", &[json!("1.9.9"), json!(">=2.0.0")]), json!(false));
        assert_eq!(run("date_time", &[json!("yyyy-MM-dd"), json!(0)]), json!("1970-01-01"));
        assert_eq!(run("to_unix_time", &[json!("1970-01-02 00:00:00")]), json!(86400));
    }

    #[test]
    fn test_aes_and_jwt() {
        let sealed = run(
            "aes_cbc",
            &[json!("secret"), json!("0123456789abcdef"), json!("fedcba9876543210")],
        );
        assert_eq!(codec::to_bytes(sealed.as_str().unwrap_or_default()).len(), 16);

        let with_iv = run("aes_cbc", &[json!("secret"), json!("0123456789abcdef")]);
        assert_eq!(codec::to_bytes(with_iv.as_str().unwrap_or_default()).len(), 32);

        let token = run("generate_jwt", &[json!(r#"{"user":"admin"}"#), json!("HS256"), json!("k")]);
        assert_eq!(token.as_str().unwrap_or_default().split('.').count(), 3);

        let unsigned = run("generate_jwt", &[json!(r#"{"a":1}"#), json!("none")]);
        assert!(unsigned.as_str().unwrap_or_default().ends_with('.'));
    }

    #[test]
    fn test_oversized_arguments_are_errors() {
        assert!(matches!(
            call("wait_for", &[json!("1e999")]),
            Err(EvaluationError::InvalidArguments { .. })
        ));
        assert!(matches!(
            call("repeat", &[json!("x"), json!(1e18)]),
            Err(EvaluationError::InvalidArguments { .. })
        ));
        assert!(matches!(
            call("rand_text_alpha", &[json!(u64::MAX)]),
            Err(EvaluationError::InvalidArguments { .. })
        ));
        assert_eq!(run("wait_for", &[json!(0)]), json!(true));
    }

    #[test]
    fn test_unknown_function() {
        assert!(matches!(
            call("no_such_fn", &[]),
            Err(EvaluationError::UnknownFunction { .. })
        ));
        assert!(matches!(
            call("contains", &[json!("x")]),
            Err(EvaluationError::InvalidArguments { .. })
        ));
    }
}
