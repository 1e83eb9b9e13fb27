//! Response shaping: structured vs primitive framing, interceptors and the
//! optional disk cache.

use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::Path;

use courier_domain::{CourierError, CourierResult, Interceptor, ResponseSpec, StepResponse, TmpConfig};
use flate2::write::ZlibEncoder;
use flate2::Compression;
use tracing::debug;

use crate::eval::Evaluator;

/// Shape the final response for publishing.
///
/// Structured mode produces `{content-type, body, headers}` with JSON bodies
/// parsed in place; primitive mode produces `{data}` with the length-prefixed
/// frame consumers parse without escaping rules.
#[must_use]
pub fn shape(primitive: bool, response: &StepResponse) -> serde_json::Value {
    if primitive {
        shape_primitive(response)
    } else {
        shape_structured(response)
    }
}

fn shape_structured(response: &StepResponse) -> serde_json::Value {
    let body: serde_json::Value = if response.content_type.starts_with("application/json") {
        serde_json::from_str(&response.body)
            .unwrap_or_else(|_| serde_json::Value::String(response.body.clone()))
    } else {
        serde_json::Value::String(response.body.clone())
    };
    serde_json::json!({
        "content-type": response.content_type,
        "body": body,
        "headers": response.headers,
    })
}

fn shape_primitive(response: &StepResponse) -> serde_json::Value {
    serde_json::json!({
        "data": frame(response.code, &response.content_type, &response.body, &response.headers),
    })
}

/// Build the primitive frame:
/// `!<code>,<ct_len>,<ct>,<body_len>,<body>,<h_len>,<name>:<value>,...`
///
/// Every length is a byte count; a header's length covers name and value but
/// not the separating colon, so values containing commas or colons survive.
#[must_use]
pub fn frame(code: u16, content_type: &str, body: &str, headers: &BTreeMap<String, String>) -> String {
    let mut out = format!(
        "!{code},{},{content_type},{},{body}",
        content_type.len(),
        body.len()
    );
    for (name, value) in headers {
        out.push_str(&format!(",{},{name}:{value}", name.len() + value.len()));
    }
    out
}

/// A parsed primitive frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Framed {
    pub code: u16,
    pub content_type: String,
    pub body: String,
    pub headers: Vec<(String, String)>,
}

/// Parse a primitive frame back into its parts.
pub fn parse_frame(data: &str) -> Result<Framed, String> {
    let rest = data.strip_prefix('!').ok_or("frame must start with '!'")?;
    let (code, rest) = split_field(rest)?;
    let code: u16 = code.parse().map_err(|_| format!("invalid status code '{code}'"))?;

    let (content_type, rest) = take_sized(rest)?;
    let rest = rest.strip_prefix(',').ok_or("missing body length")?;
    let (body, mut rest) = take_sized(rest)?;

    let mut headers = Vec::new();
    while !rest.is_empty() {
        rest = rest.strip_prefix(',').ok_or("missing header separator")?;
        let (header, tail) = take_sized_header(rest)?;
        headers.push(header);
        rest = tail;
    }
    Ok(Framed { code, content_type: content_type.to_string(), body: body.to_string(), headers })
}

/// Split at the next comma.
fn split_field(data: &str) -> Result<(&str, &str), String> {
    let at = data.find(',').ok_or("truncated frame")?;
    Ok((&data[..at], &data[at + 1..]))
}

/// Read `<len>,<len bytes>` and return the sized slice plus the remainder.
fn take_sized(data: &str) -> Result<(&str, &str), String> {
    let (len, rest) = split_field(data)?;
    let len: usize = len.parse().map_err(|_| format!("invalid length '{len}'"))?;
    if rest.len() < len {
        return Err("frame shorter than declared length".to_string());
    }
    if !rest.is_char_boundary(len) {
        return Err("declared length splits a UTF-8 sequence".to_string());
    }
    Ok((&rest[..len], &rest[len..]))
}

/// Read a `<len>,<name>:<value>` header segment; `len` counts name and value
/// without the colon.
fn take_sized_header(data: &str) -> Result<((String, String), &str), String> {
    let (len, rest) = split_field(data)?;
    let len: usize = len.parse().map_err(|_| format!("invalid header length '{len}'"))?;
    if rest.len() < len + 1 {
        return Err("header shorter than declared length".to_string());
    }
    let segment = &rest[..len + 1];
    let colon = segment.find(':').ok_or("header segment without a colon")?;
    let name = segment[..colon].to_string();
    let value = segment[colon + 1..].to_string();
    Ok(((name, value), &rest[len + 1..]))
}

/// Run the configured interceptor over the response body. The expression
/// sees `$.response` (the parsed JSON body when there is one, the raw string
/// otherwise) and `$.data`; its return value replaces the body.
pub fn apply_interceptor(
    evaluator: &Evaluator,
    interceptor: &Interceptor,
    response: &mut StepResponse,
) -> CourierResult<()> {
    response.parse();
    let body = response
        .json
        .clone()
        .unwrap_or_else(|| serde_json::Value::String(response.body.clone()));
    let object = serde_json::json!({ "response": body, "data": interceptor.data });
    let result = evaluator.evaluate(&object, &interceptor.expr)?;
    match result {
        serde_json::Value::String(text) => response.body = text,
        other => {
            response.body = other.to_string();
            response.content_type = "application/json".to_string();
        }
    }
    response.json = None;
    Ok(())
}

/// Cache the response body to disk per the response spec and replace the
/// served payload with the public URL of the cached file.
pub fn apply_disk_cache(
    spec: &ResponseSpec,
    tmp: &TmpConfig,
    response: &mut StepResponse,
) -> CourierResult<()> {
    if !spec.caches_to_disk() {
        return Ok(());
    }
    let path = Path::new(&spec.uri);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .map_err(|e| CourierError::Internal(format!("cannot create cache dir: {e}")))?;
    }
    let payload: Vec<u8> = if spec.deflated {
        let mut writer = ZlibEncoder::new(Vec::new(), Compression::new(spec.level.min(9)));
        writer
            .write_all(response.body.as_bytes())
            .map_err(|e| CourierError::Internal(format!("deflate failed: {e}")))?;
        writer.finish().map_err(|e| CourierError::Internal(format!("deflate failed: {e}")))?
    } else {
        response.body.clone().into_bytes()
    };
    fs::write(path, payload)
        .map_err(|e| CourierError::Internal(format!("cannot write cache file: {e}")))?;

    let url = if spec.url.is_empty() {
        let name = path.file_name().and_then(|n| n.to_str()).unwrap_or_default();
        format!("{}/{name}", tmp.base_url.trim_end_matches('/'))
    } else {
        spec.url.clone()
    };
    let validity = if spec.validity > 0 { spec.validity } else { tmp.validity };
    debug!(%url, validity, "response body cached to disk");

    response.body = serde_json::json!({ "url": url }).to_string();
    response.content_type = "application/json".to_string();
    response.json = None;
    Ok(())
}

#[cfg(test)]
mod tests {
    use courier_domain::SignatureOutput;

    use super::*;

    fn response(code: u16, ct: &str, body: &str) -> StepResponse {
        StepResponse::new(code, ct.to_string(), BTreeMap::new(), body.to_string(), 5)
    }

    #[test]
    fn structured_parses_json_bodies() {
        let shaped = shape(false, &response(200, "application/json", r#"{"u":1}"#));
        assert_eq!(shaped["content-type"], "application/json");
        assert_eq!(shaped["body"]["u"], 1);
    }

    #[test]
    fn structured_keeps_text_bodies_as_strings() {
        let shaped = shape(false, &response(200, "text/plain", "hello"));
        assert_eq!(shaped["body"], "hello");
    }

    #[test]
    fn primitive_frame_matches_the_documented_layout() {
        let mut headers = BTreeMap::new();
        headers.insert("X-Trace".to_string(), "1,2".to_string());
        let body = r#"{"k":"a,b"}"#;
        let framed = frame(200, "application/json", body, &headers);

        assert!(framed.starts_with("!200,16,application/json,"));
        assert!(framed.contains(&format!("{},{body}", body.len())));
        assert!(framed.ends_with(",10,X-Trace:1,2"));
    }

    #[test]
    fn framing_is_lossless_for_comma_bearing_values() {
        let mut headers = BTreeMap::new();
        headers.insert("X-Trace".to_string(), "1,2".to_string());
        headers.insert("Set-Cookie".to_string(), "a=b; c=d:e,f".to_string());
        let framed = frame(418, "text/x,comma", "body,with,commas", &headers);

        let parsed = parse_frame(&framed).unwrap();
        assert_eq!(parsed.code, 418);
        assert_eq!(parsed.content_type, "text/x,comma");
        assert_eq!(parsed.body, "body,with,commas");
        let parsed_headers: BTreeMap<_, _> = parsed.headers.into_iter().collect();
        assert_eq!(parsed_headers["X-Trace"], "1,2");
        assert_eq!(parsed_headers["Set-Cookie"], "a=b; c=d:e,f");
    }

    #[test]
    fn empty_body_and_no_headers_round_trip() {
        let framed = frame(204, "", "", &BTreeMap::new());
        let parsed = parse_frame(&framed).unwrap();
        assert_eq!(parsed.code, 204);
        assert_eq!(parsed.content_type, "");
        assert_eq!(parsed.body, "");
        assert!(parsed.headers.is_empty());
    }

    #[test]
    fn truncated_frames_are_rejected() {
        assert!(parse_frame("!200,16,applica").is_err());
        assert!(parse_frame("200,1,a,0,").is_err());
    }

    #[test]
    fn interceptor_replaces_the_body() {
        let evaluator = Evaluator::load(None, SignatureOutput::Base64).unwrap();
        let interceptor = Interceptor {
            expr: r#"$.response.k + "-" + $.data.suffix"#.to_string(),
            data: serde_json::json!({"suffix": "done"}),
        };
        let mut resp = response(200, "application/json", r#"{"k":"v"}"#);
        apply_interceptor(&evaluator, &interceptor, &mut resp).unwrap();
        assert_eq!(resp.body, "v-done");
    }

    #[test]
    fn interceptor_errors_are_evaluation_errors() {
        let evaluator = Evaluator::load(None, SignatureOutput::Base64).unwrap();
        let interceptor = Interceptor { expr: "boom(".to_string(), data: serde_json::Value::Null };
        let mut resp = response(200, "application/json", "{}");
        let err = apply_interceptor(&evaluator, &interceptor, &mut resp).unwrap_err();
        assert!(matches!(err, CourierError::Evaluation(_)));
    }

    #[test]
    fn disk_cache_replaces_the_payload_with_a_url() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("resp-1.json");
        let spec = ResponseSpec {
            uri: file.to_str().unwrap().to_string(),
            validity: 60,
            ..Default::default()
        };
        let tmp = TmpConfig { validity: 300, base_url: "https://cdn.example.com/tmp".into() };

        let mut resp = response(200, "application/json", r#"{"big":"payload"}"#);
        apply_disk_cache(&spec, &tmp, &mut resp).unwrap();

        assert_eq!(fs::read_to_string(&file).unwrap(), r#"{"big":"payload"}"#);
        let body: serde_json::Value = serde_json::from_str(&resp.body).unwrap();
        assert_eq!(body["url"], "https://cdn.example.com/tmp/resp-1.json");
    }

    #[test]
    fn disk_cache_deflates_when_asked() {
        use std::io::Read;

        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("resp-2.bin");
        let spec = ResponseSpec {
            uri: file.to_str().unwrap().to_string(),
            deflated: true,
            level: 6,
            ..Default::default()
        };
        let tmp = TmpConfig { validity: 300, base_url: "https://cdn.example.com/tmp".into() };

        let mut resp = response(200, "text/plain", "abcabcabcabcabcabc");
        apply_disk_cache(&spec, &tmp, &mut resp).unwrap();

        let compressed = fs::read(&file).unwrap();
        let mut decoder = flate2::read::ZlibDecoder::new(compressed.as_slice());
        let mut inflated = String::new();
        decoder.read_to_string(&mut inflated).unwrap();
        assert_eq!(inflated, "abcabcabcabcabcabc");
    }
}
