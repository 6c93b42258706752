//! JSON text envelope protocol for the CastMate bridge
//!
//! Every text frame carries exactly one envelope. The correlation field
//! decides the kind:
//! - `requestId` + `name` + `args`: a request
//! - `responseId` + `result`: a success response
//! - `responseId` + `failed`: a failure response (optional `error`)

use serde_json::{Map, Value};

/// Length of a correlation token in characters
pub const TOKEN_LENGTH: usize = 10;

/// Characters a correlation token is drawn from
pub const TOKEN_ALPHABET: &[u8] = b"abcdefghijklmnop0123456789";

const REQUEST_ID: &str = "requestId";
const RESPONSE_ID: &str = "responseId";
const NAME: &str = "name";
const ARGS: &str = "args";
const RESULT: &str = "result";
const FAILED: &str = "failed";
const ERROR: &str = "error";

/// Generate a fresh correlation token
///
/// Tokens are not secret. They only need to be unique among the calls a
/// single handler has outstanding at one time.
pub fn generate_token() -> String {
    let mut buf = [0u8; TOKEN_LENGTH];
    rand::fill(&mut buf);
    buf.iter()
        .map(|b| TOKEN_ALPHABET[*b as usize % TOKEN_ALPHABET.len()] as char)
        .collect()
}

/// Errors that can occur while decoding an envelope
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    /// The frame text is not valid JSON
    #[error("invalid JSON: {0}")]
    InvalidJson(String),

    /// The frame is valid JSON but not an object
    #[error("envelope is not a JSON object")]
    NotAnObject,

    /// Neither `requestId` nor `responseId` is present
    #[error("envelope has no requestId or responseId")]
    MissingCorrelation,

    /// A correlation field is present but is not a string
    #[error("{0} must be a string")]
    InvalidToken(&'static str),

    /// A request carries no usable method name
    #[error("request has no method name")]
    MissingName,

    /// A request's `args` field is not an array
    #[error("request args must be an array")]
    InvalidArgs,
}

/// One message unit exchanged over a transport
#[derive(Debug, Clone, PartialEq)]
pub enum Envelope {
    /// Invoke `name` on the remote side
    Request {
        request_id: String,
        name: String,
        args: Vec<Value>,
    },
    /// The remote handler resolved
    Success { response_id: String, result: Value },
    /// The remote handler failed
    Failure {
        response_id: String,
        error: Option<Value>,
    },
}

impl Envelope {
    /// Create a request envelope with a freshly generated token
    pub fn request(name: impl Into<String>, args: Vec<Value>) -> Self {
        Envelope::Request {
            request_id: generate_token(),
            name: name.into(),
            args,
        }
    }

    /// Create a success response for `response_id`
    pub fn success(response_id: impl Into<String>, result: Value) -> Self {
        Envelope::Success {
            response_id: response_id.into(),
            result,
        }
    }

    /// Create an opaque failure response for `response_id`
    pub fn failure(response_id: impl Into<String>) -> Self {
        Envelope::Failure {
            response_id: response_id.into(),
            error: None,
        }
    }

    /// The request or response token carried by this envelope
    pub fn token(&self) -> &str {
        match self {
            Envelope::Request { request_id, .. } => request_id,
            Envelope::Success { response_id, .. } | Envelope::Failure { response_id, .. } => {
                response_id
            }
        }
    }

    /// Convert this envelope into its JSON object form
    pub fn to_value(&self) -> Value {
        let mut obj = Map::new();
        match self {
            Envelope::Request {
                request_id,
                name,
                args,
            } => {
                obj.insert(REQUEST_ID.into(), Value::String(request_id.clone()));
                obj.insert(NAME.into(), Value::String(name.clone()));
                obj.insert(ARGS.into(), Value::Array(args.clone()));
            }
            Envelope::Success {
                response_id,
                result,
            } => {
                obj.insert(RESPONSE_ID.into(), Value::String(response_id.clone()));
                obj.insert(RESULT.into(), result.clone());
            }
            Envelope::Failure { response_id, error } => {
                obj.insert(RESPONSE_ID.into(), Value::String(response_id.clone()));
                obj.insert(FAILED.into(), Value::Bool(true));
                if let Some(error) = error {
                    obj.insert(ERROR.into(), error.clone());
                }
            }
        }
        Value::Object(obj)
    }

    /// Encode this envelope as frame text
    pub fn encode(&self) -> String {
        self.to_value().to_string()
    }

    /// Decode an envelope from frame text
    ///
    /// # Errors
    ///
    /// Returns an error if the text is not JSON, is not an object, carries
    /// no correlation token, or is a request without a name or with
    /// non-array args.
    pub fn decode(text: &str) -> Result<Envelope, ProtocolError> {
        let value: Value =
            serde_json::from_str(text).map_err(|e| ProtocolError::InvalidJson(e.to_string()))?;
        Self::from_value(value)
    }

    /// Decode an envelope from an already parsed JSON value
    pub fn from_value(value: Value) -> Result<Envelope, ProtocolError> {
        let Value::Object(mut obj) = value else {
            return Err(ProtocolError::NotAnObject);
        };

        if let Some(token) = obj.remove(RESPONSE_ID) {
            let Value::String(response_id) = token else {
                return Err(ProtocolError::InvalidToken(RESPONSE_ID));
            };

            // Any `failed` other than an explicit false marks a failure
            let failed = match obj.get(FAILED) {
                None | Some(Value::Bool(false)) => false,
                Some(_) => true,
            };
            if failed {
                return Ok(Envelope::Failure {
                    response_id,
                    error: obj.remove(ERROR),
                });
            }

            // A missing result is how an undefined return value looks on the wire
            let result = obj.remove(RESULT).unwrap_or(Value::Null);
            return Ok(Envelope::Success {
                response_id,
                result,
            });
        }

        if let Some(token) = obj.remove(REQUEST_ID) {
            let Value::String(request_id) = token else {
                return Err(ProtocolError::InvalidToken(REQUEST_ID));
            };

            let name = match obj.remove(NAME) {
                Some(Value::String(name)) if !name.is_empty() => name,
                _ => return Err(ProtocolError::MissingName),
            };

            let args = match obj.remove(ARGS) {
                None | Some(Value::Null) => Vec::new(),
                Some(Value::Array(args)) => args,
                Some(_) => return Err(ProtocolError::InvalidArgs),
            };

            return Ok(Envelope::Request {
                request_id,
                name,
                args,
            });
        }

        Err(ProtocolError::MissingCorrelation)
    }
}
