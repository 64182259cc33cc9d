use mmvmm_core::Error;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One line of the request stream. `target: None` routes to a registry-level
/// method (`new`, `delete`, `get_vm_list`); `Some(name)` routes to that VM's
/// supervisor (spec.md §6, SPEC_FULL.md RPC wire format).
#[derive(Debug, Deserialize)]
pub struct Request {
    pub target: Option<String>,
    pub method: String,
    #[serde(default)]
    pub args: Value,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
pub enum Response {
    Ok { ok: bool, result: Value },
    Err { ok: bool, error: ErrorEnvelope },
}

#[derive(Debug, Serialize)]
pub struct ErrorEnvelope {
    pub kind: String,
    pub message: String,
}

impl Response {
    pub fn ok(result: Value) -> Self {
        Response::Ok { ok: true, result }
    }

    pub fn err(e: &Error) -> Self {
        Response::Err {
            ok: false,
            error: ErrorEnvelope {
                kind: e.kind().to_string(),
                message: e.to_string(),
            },
        }
    }
}
