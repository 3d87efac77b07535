//! Header negotiation shared by the byte-source backends.

use super::error::PDFError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RangeCapabilities {
    pub allow_range_requests: bool,
    /// Content length from the headers, if it parsed.
    pub suggested_length: Option<u64>,
}

/// Decides whether the rest of the document may be fetched with range
/// requests.
///
/// Ranges need a known length above twice the chunk size, ranging not
/// disabled, and (for HTTP) `Accept-Ranges: bytes` with identity encoding.
pub fn validate_range_request_capabilities<F>(
    get_header: F,
    is_http: bool,
    range_chunk_size: usize,
    disable_range: bool,
) -> RangeCapabilities
where
    F: Fn(&str) -> Option<String>,
{
    let mut capabilities = RangeCapabilities::default();

    let Some(length) = get_header("Content-Length").and_then(|value| value.trim().parse::<u64>().ok())
    else {
        return capabilities;
    };
    capabilities.suggested_length = Some(length);

    if length <= 2 * range_chunk_size as u64 {
        return capabilities;
    }
    if disable_range || !is_http {
        return capabilities;
    }
    if get_header("Accept-Ranges").as_deref() != Some("bytes") {
        return capabilities;
    }
    let encoding = get_header("Content-Encoding").unwrap_or_else(|| "identity".to_string());
    if encoding != "identity" {
        return capabilities;
    }

    capabilities.allow_range_requests = true;
    capabilities
}

/// The file name from a `Content-Disposition` header, if it names a PDF.
pub fn extract_filename_from_header(content_disposition: Option<&str>) -> Option<String> {
    let header = content_disposition?;
    let mut filename = filename_from_content_disposition(header)?;
    if filename.contains('%') {
        if let Some(decoded) = percent_decode(&filename) {
            filename = decoded;
        }
    }
    is_pdf_file(&filename).then_some(filename)
}

pub fn is_pdf_file(filename: &str) -> bool {
    filename.to_ascii_lowercase().ends_with(".pdf")
}

fn filename_from_content_disposition(header: &str) -> Option<String> {
    let mut plain = None;
    for param in split_params(header).into_iter().skip(1) {
        let Some((key, value)) = param.split_once('=') else {
            continue;
        };
        let key = key.trim().to_ascii_lowercase();
        let value = value.trim();
        match key.as_str() {
            // RFC 5987: charset'lang'percent-encoded
            "filename*" => {
                if let Some(decoded) = decode_ext_value(value) {
                    return Some(decoded);
                }
            }
            "filename" if plain.is_none() => {
                let value = unquote(value);
                if !value.is_empty() {
                    plain = Some(value);
                }
            }
            _ => {}
        }
    }
    plain
}

fn decode_ext_value(value: &str) -> Option<String> {
    let mut parts = value.splitn(3, '\'');
    let charset = parts.next()?.to_ascii_lowercase();
    let _lang = parts.next()?;
    let encoded = unquote(parts.next()?);
    match charset.as_str() {
        "utf-8" => String::from_utf8(percent_decode_bytes(&encoded)?).ok(),
        // Latin-1 bytes are the first 256 code points.
        "iso-8859-1" | "latin1" => {
            Some(percent_decode_bytes(&encoded)?.into_iter().map(char::from).collect())
        }
        _ => None,
    }
}

/// Splits on `;` outside of quoted strings.
fn split_params(header: &str) -> Vec<&str> {
    let mut params = Vec::new();
    let mut in_quotes = false;
    let mut escaped = false;
    let mut start = 0;
    for (index, ch) in header.char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match ch {
            '\\' if in_quotes => escaped = true,
            '"' => in_quotes = !in_quotes,
            ';' if !in_quotes => {
                params.push(&header[start..index]);
                start = index + 1;
            }
            _ => {}
        }
    }
    params.push(&header[start..]);
    params
}

fn unquote(value: &str) -> String {
    let value = value.trim();
    match value.strip_prefix('"').and_then(|v| v.strip_suffix('"')) {
        Some(inner) => {
            let mut out = String::with_capacity(inner.len());
            let mut chars = inner.chars();
            while let Some(ch) = chars.next() {
                if ch == '\\' {
                    if let Some(next) = chars.next() {
                        out.push(next);
                    }
                } else {
                    out.push(ch);
                }
            }
            out
        }
        None => value.to_string(),
    }
}

fn percent_decode(value: &str) -> Option<String> {
    String::from_utf8(percent_decode_bytes(value)?).ok()
}

fn percent_decode_bytes(value: &str) -> Option<Vec<u8>> {
    let bytes = value.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = value.get(i + 1..i + 3)?;
            out.push(u8::from_str_radix(hex, 16).ok()?);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    Some(out)
}

pub fn create_response_status_error(status: u16, url: &str) -> PDFError {
    if status == 404 || (status == 0 && url.starts_with("file:")) {
        return PDFError::MissingPdf(format!("Missing PDF \"{}\".", url));
    }
    PDFError::UnexpectedResponse {
        message: format!(
            "Unexpected server response ({}) while retrieving PDF \"{}\".",
            status, url
        ),
        status,
    }
}

pub fn validate_response_status(status: u16) -> bool {
    status == 200 || status == 206
}

/// A range request must come back partial; a 200 means the server sent the
/// whole document instead.
pub fn validate_range_response_status(status: u16) -> bool {
    status == 206
}
