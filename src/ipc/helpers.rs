use super::error::err;
use super::types::Request;

pub fn required_str(req: &Request, key: &str) -> Result<String, serde_json::Value> {
    match req.params.get(key).and_then(|v| v.as_str()) {
        Some(v) => Ok(v.to_string()),
        None => Err(err(&req.id, "bad_params", format!("missing {}", key), None)),
    }
}

pub fn optional_str(req: &Request, key: &str) -> Option<String> {
    req.params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
}

pub fn required_f64(req: &Request, key: &str) -> Result<f64, serde_json::Value> {
    match req.params.get(key).and_then(|v| v.as_f64()) {
        Some(v) => Ok(v),
        None => Err(err(
            &req.id,
            "bad_params",
            format!("missing or non-numeric {}", key),
            None,
        )),
    }
}
