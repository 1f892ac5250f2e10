//! Envelope codec: request events out, typed result variants in. Content is JSON.

use serde::Deserialize;
use serde_json::{Map, Value};

use crate::event::UnsignedEvent;
use crate::keys::ServerKey;
use crate::protocol::{
    Balance, BroadcastResult, CorrelationId, FeeEstimates, OperationType, ResultVariant, Utxo,
    REQUEST_KIND, REQ_TAG, TO_TAG,
};

/// Largest response content we are willing to parse. UTXO sets for busy wallets are the big case.
pub const MAX_RESPONSE_CONTENT_LEN: usize = 1024 * 1024; // 1 MiB

/// Build the request event: `req` and `p` tags, content `{type, ...params, req}`.
/// `type` and `req` are written after params so params cannot override them.
pub fn encode_request(
    id: &CorrelationId,
    server: &ServerKey,
    operation: OperationType,
    params: Map<String, Value>,
) -> Result<UnsignedEvent, EnvelopeError> {
    let mut body = params;
    body.insert("type".into(), Value::String(operation.as_str().into()));
    body.insert(REQ_TAG.into(), Value::String(id.as_str().into()));
    let content = serde_json::to_string(&Value::Object(body)).map_err(EnvelopeError::Encode)?;
    Ok(UnsignedEvent {
        kind: REQUEST_KIND,
        tags: vec![
            vec![REQ_TAG.into(), id.as_str().into()],
            vec![TO_TAG.into(), server.to_hex()],
        ],
        content,
    })
}

/// Correlation id carried in the body's `req` field, if the body is a JSON object that has one.
pub fn body_correlation_id(content: &str) -> Option<CorrelationId> {
    #[derive(Deserialize)]
    struct ReqOnly {
        req: Option<String>,
    }
    serde_json::from_str::<ReqOnly>(content)
        .ok()
        .and_then(|b| b.req)
        .map(CorrelationId::from)
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct BalanceBody {
    confirmed_balance: i64,
    #[serde(default)]
    unconfirmed_balance: i64,
    #[serde(default)]
    transactions: Vec<Value>,
}

#[derive(Deserialize)]
struct UtxoBody {
    utxos: Vec<Utxo>,
}

/// Field whose presence marks a real result for `operation`.
fn result_field(operation: OperationType) -> &'static str {
    match operation {
        OperationType::BalanceLookup => "confirmedBalance",
        OperationType::GetUtxos => "utxos",
        OperationType::BroadcastTx => "success",
        OperationType::GetFeeEstimates => "fast",
    }
}

/// Parse a response body for the operation that issued the matching request.
///
/// A body with a top-level `error` string and no result field is the server reporting failure
/// (`Server`). Anything else that does not fit the expected shape is `Malformed`.
pub fn decode_response(
    operation: OperationType,
    content: &str,
) -> Result<ResultVariant, EnvelopeError> {
    if content.len() > MAX_RESPONSE_CONTENT_LEN {
        return Err(EnvelopeError::TooLarge(content.len()));
    }
    let value: Value =
        serde_json::from_str(content).map_err(|e| EnvelopeError::Malformed(e.to_string()))?;
    let obj = value
        .as_object()
        .ok_or_else(|| EnvelopeError::Malformed("body is not a JSON object".into()))?;

    if !obj.contains_key(result_field(operation)) {
        if let Some(Value::String(msg)) = obj.get("error") {
            return Err(EnvelopeError::Server(msg.clone()));
        }
    }

    let shape = |e: serde_json::Error| {
        EnvelopeError::Malformed(format!("{} response: {}", operation.as_str(), e))
    };
    let variant = match operation {
        OperationType::BalanceLookup => {
            let b: BalanceBody = serde_json::from_value(value).map_err(shape)?;
            ResultVariant::Balance(Balance {
                confirmed: b.confirmed_balance,
                unconfirmed: b.unconfirmed_balance,
                total: b.confirmed_balance.saturating_add(b.unconfirmed_balance),
                transactions: b.transactions,
            })
        }
        OperationType::GetUtxos => {
            let b: UtxoBody = serde_json::from_value(value).map_err(shape)?;
            ResultVariant::UtxoSet(b.utxos)
        }
        OperationType::BroadcastTx => {
            let b: BroadcastResult = serde_json::from_value(value).map_err(shape)?;
            ResultVariant::Broadcast(b)
        }
        OperationType::GetFeeEstimates => {
            let b: FeeEstimates = serde_json::from_value(value).map_err(shape)?;
            ResultVariant::FeeEstimate(b)
        }
    };
    Ok(variant)
}

/// Error building a request or parsing a response body.
#[derive(Debug, thiserror::Error)]
pub enum EnvelopeError {
    #[error("encode error: {0}")]
    Encode(#[source] serde_json::Error),
    #[error("response content too large ({0} bytes)")]
    TooLarge(usize),
    #[error("malformed response: {0}")]
    Malformed(String),
    #[error("server reported error: {0}")]
    Server(String),
}
