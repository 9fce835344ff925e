//! Payload encoding and response decoding.

use bytes::Bytes;
use http::header::HeaderValue;
use serde_json::Value;

use crate::endpoint::BodyKind;
use crate::error::Error;
use crate::util::truncate_body;

const JSON_CONTENT_TYPE: &str = "application/json";
const OCTET_STREAM_CONTENT_TYPE: &str = "application/octet-stream";

/// Which endpoint and declared type a codec call is for.
#[derive(Clone, Copy, Debug)]
pub struct CodecContext<'a> {
    pub endpoint: &'a str,
    pub type_ref: Option<&'a str>,
}

pub trait Serializer: Send + Sync {
    fn encode(&self, payload: &Value, context: CodecContext<'_>) -> Result<Bytes, Error>;

    fn decode(&self, body: &[u8], context: CodecContext<'_>) -> Result<Value, Error>;

    fn content_type(&self) -> &'static str {
        JSON_CONTENT_TYPE
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct JsonSerializer {
    omit_nulls: bool,
}

impl JsonSerializer {
    pub const fn new() -> Self {
        Self { omit_nulls: false }
    }

    /// Drops `null` object members before encoding.
    pub const fn omit_nulls(mut self, omit_nulls: bool) -> Self {
        self.omit_nulls = omit_nulls;
        self
    }
}

impl Serializer for JsonSerializer {
    fn encode(&self, payload: &Value, context: CodecContext<'_>) -> Result<Bytes, Error> {
        let encoded = if self.omit_nulls {
            serde_json::to_vec(&without_nulls(payload))
        } else {
            serde_json::to_vec(payload)
        };
        encoded.map(Bytes::from).map_err(|source| Error::Encode {
            endpoint: context.endpoint.to_owned(),
            message: source.to_string(),
        })
    }

    fn decode(&self, body: &[u8], context: CodecContext<'_>) -> Result<Value, Error> {
        if body.iter().all(u8::is_ascii_whitespace) {
            return Ok(Value::Null);
        }
        serde_json::from_slice(body).map_err(|source| Error::Decode {
            endpoint: context.endpoint.to_owned(),
            message: match context.type_ref {
                Some(type_ref) => format!("expected {type_ref}: {source}"),
                None => source.to_string(),
            },
            body: truncate_body(body),
        })
    }
}

fn without_nulls(value: &Value) -> Value {
    match value {
        Value::Object(members) => Value::Object(
            members
                .iter()
                .filter(|(_, member)| !member.is_null())
                .map(|(name, member)| (name.clone(), without_nulls(member)))
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.iter().map(without_nulls).collect()),
        other => other.clone(),
    }
}

/// Encoded request body and the content type it should be sent with.
#[derive(Clone, Debug, Default)]
pub struct EncodedBody {
    pub bytes: Bytes,
    pub content_type: Option<HeaderValue>,
}

/// Encodes `payload` per the endpoint's body kind. A `null` payload means no
/// body at all.
pub fn encode_body(
    kind: BodyKind,
    serializer: &dyn Serializer,
    payload: &Value,
    context: CodecContext<'_>,
) -> Result<EncodedBody, Error> {
    if payload.is_null() {
        return Ok(EncodedBody::default());
    }
    match kind {
        BodyKind::Json => Ok(EncodedBody {
            bytes: serializer.encode(payload, context)?,
            content_type: Some(HeaderValue::from_static(serializer.content_type())),
        }),
        BodyKind::Raw => Ok(EncodedBody {
            bytes: raw_bytes(payload, context)?,
            content_type: Some(HeaderValue::from_static(OCTET_STREAM_CONTENT_TYPE)),
        }),
        BodyKind::Multipart => encode_multipart(payload, context),
    }
}

fn raw_bytes(payload: &Value, context: CodecContext<'_>) -> Result<Bytes, Error> {
    let invalid = || Error::Encode {
        endpoint: context.endpoint.to_owned(),
        message: "raw body must be a string or an array of bytes".to_owned(),
    };
    match payload {
        Value::String(text) => Ok(Bytes::copy_from_slice(text.as_bytes())),
        Value::Array(items) => items
            .iter()
            .map(|item| {
                item.as_u64()
                    .and_then(|byte| u8::try_from(byte).ok())
                    .ok_or_else(invalid)
            })
            .collect::<Result<Vec<u8>, Error>>()
            .map(Bytes::from),
        _ => Err(invalid()),
    }
}

/// `multipart/form-data` with one part per top-level object member. Strings
/// are sent as text parts, everything else as JSON parts.
pub fn encode_multipart(payload: &Value, context: CodecContext<'_>) -> Result<EncodedBody, Error> {
    let Value::Object(members) = payload else {
        return Err(Error::Encode {
            endpoint: context.endpoint.to_owned(),
            message: "multipart body must be an object".to_owned(),
        });
    };

    let boundary = format!("pristine-{}", uuid::Uuid::new_v4().simple());
    let mut body = Vec::new();
    for (name, value) in members {
        let name = name.replace('"', "%22");
        body.extend_from_slice(format!("--{boundary}\r\n").as_bytes());
        body.extend_from_slice(
            format!("Content-Disposition: form-data; name=\"{name}\"\r\n").as_bytes(),
        );
        match value {
            Value::String(text) => {
                body.extend_from_slice(b"\r\n");
                body.extend_from_slice(text.as_bytes());
            }
            other => {
                body.extend_from_slice(
                    format!("Content-Type: {JSON_CONTENT_TYPE}\r\n\r\n").as_bytes(),
                );
                body.extend_from_slice(other.to_string().as_bytes());
            }
        }
        body.extend_from_slice(b"\r\n");
    }
    body.extend_from_slice(format!("--{boundary}--\r\n").as_bytes());

    let content_type = HeaderValue::from_str(&format!("multipart/form-data; boundary={boundary}"))
        .map_err(|source| Error::InvalidHeaderValue {
            name: http::header::CONTENT_TYPE.to_string(),
            source,
        })?;
    Ok(EncodedBody {
        bytes: Bytes::from(body),
        content_type: Some(content_type),
    })
}
