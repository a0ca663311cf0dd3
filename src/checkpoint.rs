//! Checkpoint adapter (4.J): serializes master state and the loss-scale
//! controller, tolerant of the legacy key names the non-sharded optimizer
//! used before this crate's state-dict schema was settled.

use serde_json::{json, Value};
use tracing::warn;

/// `{ "optimizer": <inner state>, "grad_scaler": <scaler state or absent>,
/// "fp32_from_fp16_params": [[param, ...], ...] }`.
pub struct CheckpointState {
    pub optimizer: Value,
    pub grad_scaler: Option<Value>,
    pub fp32_from_fp16_params: Vec<Vec<f32>>,
}

pub fn to_state_dict(state: &CheckpointState) -> Value {
    let mut obj = serde_json::Map::new();
    obj.insert("optimizer".to_string(), state.optimizer.clone());
    if let Some(scaler) = &state.grad_scaler {
        obj.insert("grad_scaler".to_string(), scaler.clone());
    }
    obj.insert(
        "fp32_from_fp16_params".to_string(),
        json!(state.fp32_from_fp16_params),
    );
    Value::Object(obj)
}

/// Load a state dict, accepting the legacy key names `optimizer_state_dict`
/// (for `optimizer`) and `fp32_from_fp16` (for `fp32_from_fp16_params`).
/// A missing or unexpected scaler only warns; it never fails the load.
pub fn from_state_dict(dict: &Value, scaler_expected: bool) -> CheckpointState {
    let optimizer = dict
        .get("optimizer")
        .or_else(|| dict.get("optimizer_state_dict"))
        .cloned()
        .unwrap_or(Value::Null);

    let grad_scaler = dict.get("grad_scaler").cloned();
    match (scaler_expected, &grad_scaler) {
        (true, None) => warn!("checkpoint has no grad_scaler state but this optimizer expects one"),
        (false, Some(_)) => warn!("checkpoint has grad_scaler state but this optimizer has none"),
        _ => {}
    }

    let fp32_from_fp16_params = dict
        .get("fp32_from_fp16_params")
        .or_else(|| dict.get("fp32_from_fp16"))
        .and_then(|v| serde_json::from_value(v.clone()).ok())
        .unwrap_or_default();

    CheckpointState {
        optimizer,
        grad_scaler,
        fp32_from_fp16_params,
    }
}
