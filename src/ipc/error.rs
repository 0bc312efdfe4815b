use serde_json::json;

pub fn ok(id: &str, data: serde_json::Value) -> serde_json::Value {
    success(id, 200, "ok", data)
}

pub fn created(id: &str, data: serde_json::Value) -> serde_json::Value {
    success(id, 201, "created", data)
}

fn success(id: &str, status: u16, message: &str, data: serde_json::Value) -> serde_json::Value {
    json!({
        "id": id,
        "success": true,
        "status": status,
        "message": message,
        "data": data,
    })
}

/// Envelope status for transport-level codes. Engine errors carry their own
/// status and go through `err_with_status`.
fn status_for(code: &str) -> u16 {
    match code {
        "bad_params" => 422,
        "not_found" => 404,
        "no_workspace" | "bad_json" => 400,
        "not_implemented" => 404,
        _ => 500,
    }
}

pub fn err(
    id: &str,
    code: &str,
    message: impl Into<String>,
    details: Option<serde_json::Value>,
) -> serde_json::Value {
    err_with_status(id, status_for(code), code, message, details)
}

pub fn err_with_status(
    id: &str,
    status: u16,
    code: &str,
    message: impl Into<String>,
    details: Option<serde_json::Value>,
) -> serde_json::Value {
    let mut error = json!({ "code": code });
    if let Some(d) = details {
        error["details"] = d;
    }
    json!({
        "id": id,
        "success": false,
        "status": status,
        "message": message.into(),
        "data": null,
        "error": error,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failure_envelope_has_null_data_and_code() {
        let v = err("7", "bad_params", "missing enrollmentId", None);
        assert_eq!(v["success"], false);
        assert_eq!(v["status"], 422);
        assert!(v["data"].is_null());
        assert_eq!(v["error"]["code"], "bad_params");
        assert!(v["error"].get("details").is_none());
    }

    #[test]
    fn created_uses_201() {
        let v = created("1", json!({ "id": "x" }));
        assert_eq!(v["status"], 201);
        assert_eq!(v["data"]["id"], "x");
    }
}
